//! HTTP/1.1 protocol types and parsing.
//!
//! This module provides the core HTTP primitives the dispatch engine works
//! with: [`Method`], [`MethodSpec`], [`StatusCode`], [`Headers`], [`Request`],
//! and [`ResponseBuffer`].

use std::fmt;

pub mod headers;
pub mod request;
pub mod response;

pub use headers::Headers;
pub use request::{Request, RequestError};
pub use response::ResponseBuffer;

/// An HTTP response status code.
///
/// # Examples
///
/// ```
/// use graft::http::StatusCode;
///
/// let status = StatusCode::Ok;
/// assert_eq!(status.as_u16(), 200);
/// assert_eq!(status.canonical_reason(), "OK");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum StatusCode {
    // 2xx Success
    Ok = 200,
    Created = 201,
    Accepted = 202,
    NoContent = 204,

    // 3xx Redirection
    MovedPermanently = 301,
    Found = 302,
    NotModified = 304,

    // 4xx Client Error
    BadRequest = 400,
    Unauthorized = 401,
    Forbidden = 403,
    NotFound = 404,
    MethodNotAllowed = 405,
    Conflict = 409,
    PayloadTooLarge = 413,
    UnprocessableEntity = 422,
    TooManyRequests = 429,

    // 5xx Server Error
    InternalServerError = 500,
    NotImplemented = 501,
    BadGateway = 502,
    ServiceUnavailable = 503,
    GatewayTimeout = 504,
}

impl StatusCode {
    /// Returns the numeric status code as a `u16`.
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Returns the canonical reason phrase for this status code.
    pub fn canonical_reason(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Created => "Created",
            Self::Accepted => "Accepted",
            Self::NoContent => "No Content",
            Self::MovedPermanently => "Moved Permanently",
            Self::Found => "Found",
            Self::NotModified => "Not Modified",
            Self::BadRequest => "Bad Request",
            Self::Unauthorized => "Unauthorized",
            Self::Forbidden => "Forbidden",
            Self::NotFound => "Not Found",
            Self::MethodNotAllowed => "Method Not Allowed",
            Self::Conflict => "Conflict",
            Self::PayloadTooLarge => "Payload Too Large",
            Self::UnprocessableEntity => "Unprocessable Entity",
            Self::TooManyRequests => "Too Many Requests",
            Self::InternalServerError => "Internal Server Error",
            Self::NotImplemented => "Not Implemented",
            Self::BadGateway => "Bad Gateway",
            Self::ServiceUnavailable => "Service Unavailable",
            Self::GatewayTimeout => "Gateway Timeout",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.as_u16(), self.canonical_reason())
    }
}

impl From<StatusCode> for u16 {
    fn from(code: StatusCode) -> u16 {
        code.as_u16()
    }
}

/// An HTTP request method.
///
/// Standard methods are represented as unit variants for zero-cost comparison.
/// Non-standard methods are captured in the `Custom` variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Head,
    Options,
    Patch,
    Connect,
    Trace,
    /// A non-standard extension method.
    Custom(String),
}

impl Method {
    /// Returns the method as an upper-case string slice.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
            Self::Patch => "PATCH",
            Self::Connect => "CONNECT",
            Self::Trace => "TRACE",
            Self::Custom(s) => s.as_str(),
        }
    }

    /// Returns `true` for the fixed set of methods route patterns may bind to.
    pub fn is_supported(&self) -> bool {
        !matches!(self, Self::Custom(_))
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Method {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_uppercase().as_str() {
            "GET" => Self::Get,
            "POST" => Self::Post,
            "PUT" => Self::Put,
            "DELETE" => Self::Delete,
            "HEAD" => Self::Head,
            "OPTIONS" => Self::Options,
            "PATCH" => Self::Patch,
            "CONNECT" => Self::Connect,
            "TRACE" => Self::Trace,
            _ => Self::Custom(s.to_ascii_uppercase()),
        })
    }
}

impl AsRef<str> for Method {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

/// The method half of a route pattern: a single supported method, or the
/// `ALL` wildcard that matches every method.
///
/// # Examples
///
/// ```
/// use graft::http::{Method, MethodSpec};
///
/// let spec: MethodSpec = "all".parse().unwrap();
/// assert!(spec.matches(&Method::Delete));
///
/// let spec: MethodSpec = "get".parse().unwrap();
/// assert!(spec.matches(&Method::Get));
/// assert!(!spec.matches(&Method::Post));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MethodSpec {
    /// Matches any request method.
    All,
    /// Matches exactly one method.
    One(Method),
}

impl MethodSpec {
    /// Returns `true` if a request with `method` satisfies this spec.
    pub fn matches(&self, method: &Method) -> bool {
        match self {
            Self::All => true,
            Self::One(m) => m == method,
        }
    }

    /// Returns `true` when bound to a specific method rather than `ALL`.
    pub fn is_specific(&self) -> bool {
        matches!(self, Self::One(_))
    }

    /// Returns the spec as an upper-case string slice.
    pub fn as_str(&self) -> &str {
        match self {
            Self::All => "ALL",
            Self::One(m) => m.as_str(),
        }
    }
}

impl fmt::Display for MethodSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MethodSpec {
    type Err = UnsupportedMethod;

    /// Case-insensitive. Fails for methods outside the fixed supported set;
    /// `ALL` is the wildcard.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("ALL") {
            return Ok(Self::All);
        }
        let Ok(method) = s.parse::<Method>();
        if method.is_supported() {
            Ok(Self::One(method))
        } else {
            Err(UnsupportedMethod(s.to_owned()))
        }
    }
}

/// A method name outside the supported set was used in a route pattern.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported HTTP method in pattern: {0:?}")]
pub struct UnsupportedMethod(pub String);
