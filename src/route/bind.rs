//! Registered request-binding contracts.
//!
//! A [`Binder`] is a deserialization function chosen at registration time: it
//! turns raw request data into a concrete value type before the handler runs,
//! so dispatch never inspects types at runtime. Built-ins cover the two
//! common sources — a JSON body and the query string.

use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::context::Context;
use crate::http::{Request, StatusCode};

use super::{RouteError, Router};

/// A request-binding failure, reported as a 400 without invoking the handler.
#[derive(Debug, Error)]
pub enum BindError {
    #[error("body deserialization failed: {0}")]
    Body(#[from] serde_json::Error),

    #[error("query deserialization failed: {0}")]
    Query(String),
}

/// Registration-time contract from raw request data to a concrete value.
pub type Binder<T> = Arc<dyn Fn(&Request) -> Result<T, BindError> + Send + Sync>;

/// Binds the request body as JSON.
pub fn json_body<T: DeserializeOwned>() -> Binder<T> {
    Arc::new(|request| Ok(serde_json::from_slice(request.body())?))
}

/// Binds the query string, with every value carried as a string.
pub fn query<T: DeserializeOwned>() -> Binder<T> {
    Arc::new(|request| {
        let map = serde_json::Map::from_iter(
            request
                .query_params()
                .iter()
                .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone()))),
        );
        serde_json::from_value(serde_json::Value::Object(map))
            .map_err(|e| BindError::Query(e.to_string()))
    })
}

impl Router {
    /// Registers a serving handler with a bound value type.
    ///
    /// The binder runs before the handler; on failure the request is answered
    /// with `400 Bad Request` and the handler is never invoked.
    ///
    /// # Examples
    ///
    /// ```
    /// use graft::route::{bind, Router};
    /// use graft::Context;
    /// use serde::Deserialize;
    ///
    /// #[derive(Deserialize)]
    /// struct NewUser {
    ///     name: String,
    /// }
    ///
    /// let mut router = Router::new();
    /// router
    ///     .bind_bound("POST:/users", bind::json_body::<NewUser>(), |ctx: Context, user: NewUser| async move {
    ///         ctx.write(user.name);
    ///     })
    ///     .unwrap();
    /// ```
    pub fn bind_bound<T, H, F>(
        &mut self,
        pattern: &str,
        binder: Binder<T>,
        handler: H,
    ) -> Result<(), RouteError>
    where
        T: Send + 'static,
        H: Fn(Context, T) -> F + Send + Sync + 'static,
        F: Future<Output = ()> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.bind(pattern, move |ctx: Context| {
            let binder = binder.clone();
            let handler = handler.clone();
            async move {
                match binder(ctx.request()) {
                    Ok(value) => handler(ctx, value).await,
                    Err(error) => {
                        tracing::debug!(error = %error, "request binding rejected");
                        ctx.set_status(StatusCode::BadRequest);
                        ctx.write(error.to_string());
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline;
    use crate::route::Resolver;
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct NewUser {
        name: String,
        age: u32,
    }

    #[derive(Deserialize)]
    struct Paging {
        page: String,
    }

    async fn run(router: Router, raw: &[u8]) -> (Option<StatusCode>, String) {
        let mut router = router;
        router.seal();
        let resolver = Resolver::new(Arc::new(router), Resolver::DEFAULT_TTL);
        let (request, _) = Request::parse(raw).unwrap();
        let plan = resolver.resolve_request(&request);
        let ctx = Context::new(request, plan);
        pipeline::serve(&ctx).await;
        let body = ctx.with_response(|r| String::from_utf8_lossy(r.body()).into_owned());
        (ctx.status(), body)
    }

    #[tokio::test]
    async fn json_body_binding() {
        let mut router = Router::new();
        router
            .bind_bound(
                "POST:/users",
                json_body::<NewUser>(),
                |ctx: Context, user: NewUser| async move {
                    ctx.write(format!("{}:{}", user.name, user.age));
                },
            )
            .unwrap();

        let raw = b"POST /users HTTP/1.1\r\nHost: h\r\nContent-Length: 26\r\n\r\n{\"name\":\"alice\",\"age\":30}\n";
        let (status, body) = run(router, raw).await;
        assert_eq!(status, Some(StatusCode::Ok));
        assert_eq!(body, "alice:30");
    }

    #[tokio::test]
    async fn malformed_body_yields_400() {
        let mut router = Router::new();
        router
            .bind_bound(
                "POST:/users",
                json_body::<NewUser>(),
                |_ctx: Context, _user: NewUser| async move {
                    panic!("handler must not run on bind failure");
                },
            )
            .unwrap();

        let raw = b"POST /users HTTP/1.1\r\nHost: h\r\nContent-Length: 9\r\n\r\nnot json!";
        let (status, _body) = run(router, raw).await;
        assert_eq!(status, Some(StatusCode::BadRequest));
    }

    #[tokio::test]
    async fn query_binding() {
        let mut router = Router::new();
        router
            .bind_bound(
                "GET:/list",
                query::<Paging>(),
                |ctx: Context, paging: Paging| async move {
                    ctx.write(paging.page);
                },
            )
            .unwrap();

        let raw = b"GET /list?page=7 HTTP/1.1\r\nHost: h\r\n\r\n";
        let (status, body) = run(router, raw).await;
        assert_eq!(status, Some(StatusCode::Ok));
        assert_eq!(body, "7");
    }
}
