//! HTTP/1.1 response buffer.
//!
//! [`ResponseBuffer`] is the write side the dispatch core hands to handler
//! code: a status setter plus a cumulative byte/string writer. Serialization
//! to the HTTP/1.1 wire format happens once, after the pipeline and its
//! output hooks have run.

use bytes::{BufMut, BytesMut};

use super::{Headers, StatusCode};

/// An accumulating HTTP/1.1 response.
///
/// Handlers and middleware append to the body with [`write`](Self::write) and
/// friends; the status stays unset until something sets it or the pipeline
/// finalizes it (200 when a handler served, 404 otherwise).
///
/// # Examples
///
/// ```
/// use graft::http::{ResponseBuffer, StatusCode};
///
/// let mut buffer = ResponseBuffer::new();
/// buffer.set_status(StatusCode::Ok);
/// buffer.write("Hello, ");
/// buffer.write("World!");
///
/// let bytes = buffer.into_bytes();
/// let text = std::str::from_utf8(&bytes).unwrap();
/// assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
/// assert!(text.ends_with("\r\n\r\nHello, World!"));
/// ```
#[derive(Debug, Default)]
pub struct ResponseBuffer {
    status: Option<StatusCode>,
    headers: Headers,
    body: BytesMut,
    keep_alive: bool,
}

impl ResponseBuffer {
    /// Creates an empty response buffer with no status set.
    pub fn new() -> Self {
        Self {
            status: None,
            headers: Headers::new(),
            body: BytesMut::new(),
            keep_alive: true,
        }
    }

    /// Returns the status, if one has been set.
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    /// Sets the response status. Later calls overwrite earlier ones.
    pub fn set_status(&mut self, status: StatusCode) {
        self.status = Some(status);
    }

    /// Appends UTF-8 text to the body.
    pub fn write(&mut self, text: impl AsRef<str>) {
        self.body.put(text.as_ref().as_bytes());
    }

    /// Appends UTF-8 text to the body followed by a newline.
    pub fn writeln(&mut self, text: impl AsRef<str>) {
        self.write(text);
        self.body.put_u8(b'\n');
    }

    /// Appends raw bytes to the body.
    pub fn write_bytes(&mut self, bytes: impl AsRef<[u8]>) {
        self.body.put(bytes.as_ref());
    }

    /// Discards everything written to the body so far.
    pub fn clear_body(&mut self) {
        self.body.clear();
    }

    /// Returns the body accumulated so far.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Returns the response headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the response headers for modification.
    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// Appends a response header.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.append(name, value);
    }

    /// Controls whether `Connection: keep-alive` or `Connection: close` is written.
    pub fn set_keep_alive(&mut self, keep_alive: bool) {
        self.keep_alive = keep_alive;
    }

    /// Serializes the response into HTTP/1.1 wire format.
    ///
    /// An unset status serializes as `200 OK`; the pipeline finalizes the
    /// status before output, so that default only applies to buffers
    /// serialized outside a pipeline run. Automatically adds:
    ///
    /// - `Content-Type: text/plain; charset=utf-8` when the body is non-empty
    ///   and no `Content-Type` was set.
    /// - `Content-Length: <n>` (always written).
    /// - `Connection: keep-alive` or `Connection: close`.
    pub fn into_bytes(mut self) -> BytesMut {
        let status = self.status.unwrap_or(StatusCode::Ok);
        let content_length = self.body.len();

        if !self.body.is_empty() && !self.headers.contains("content-type") {
            self.headers
                .append("Content-Type", "text/plain; charset=utf-8");
        }

        let connection = if self.keep_alive {
            "keep-alive"
        } else {
            "close"
        };
        self.headers.set("Connection", connection);

        let estimated_size = 128 + self.headers.len() * 64 + content_length;
        let mut buf = BytesMut::with_capacity(estimated_size);

        buf.put(
            format!(
                "HTTP/1.1 {} {}\r\n",
                status.as_u16(),
                status.canonical_reason()
            )
            .as_bytes(),
        );

        for (name, value) in self.headers.iter() {
            buf.put(format!("{name}: {value}\r\n").as_bytes());
        }

        // Content-Length is always the last header before the blank line
        buf.put(format!("Content-Length: {content_length}\r\n").as_bytes());

        buf.put(&b"\r\n"[..]);

        if !self.body.is_empty() {
            buf.put(&self.body[..]);
        }

        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_string(bytes: BytesMut) -> String {
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn accumulated_writes_concatenate() {
        let mut r = ResponseBuffer::new();
        r.set_status(StatusCode::Ok);
        r.write("13");
        r.write("test");
        r.write("42");
        let s = to_string(r.into_bytes());
        assert!(s.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(s.ends_with("\r\n\r\n13test42"));
        assert!(s.contains("Content-Length: 8\r\n"));
    }

    #[test]
    fn unset_status_defaults_to_ok() {
        let r = ResponseBuffer::new();
        let s = to_string(r.into_bytes());
        assert!(s.starts_with("HTTP/1.1 200 OK\r\n"));
    }

    #[test]
    fn clear_body_resets_writer() {
        let mut r = ResponseBuffer::new();
        r.write("partial output");
        r.clear_body();
        r.set_status(StatusCode::InternalServerError);
        r.write("boom");
        let s = to_string(r.into_bytes());
        assert!(s.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(s.ends_with("\r\n\r\nboom"));
    }

    #[test]
    fn no_body_no_content_type() {
        let mut r = ResponseBuffer::new();
        r.set_status(StatusCode::NoContent);
        let s = to_string(r.into_bytes());
        assert!(!s.contains("Content-Type"));
        assert!(s.contains("Content-Length: 0\r\n"));
    }

    #[test]
    fn connection_close() {
        let mut r = ResponseBuffer::new();
        r.set_keep_alive(false);
        let s = to_string(r.into_bytes());
        assert!(s.contains("Connection: close\r\n"));
    }
}
