//! Built-in middleware.
//!
//! Middleware here follows the onion contract: run code, call
//! [`Context::next`](crate::Context::next) to resume the chain, run code
//! again on the way back out.

use tokio::time::Instant;

use crate::context::Context;
use crate::route::IntoHandler;

/// Request logger: one `tracing::info!` line per request with method, path,
/// status, and duration, emitted after the downstream chain completes.
///
/// # Examples
///
/// ```
/// use graft::{middleware, route::Router};
///
/// let mut router = Router::new();
/// router.bind_middleware("/", middleware::logger()).unwrap();
/// ```
pub fn logger() -> impl IntoHandler {
    |ctx: Context| async move {
        let start = Instant::now();
        let method = ctx.request().method().as_str().to_owned();
        let path = ctx.request().path().to_owned();

        ctx.next().await;

        let status = ctx
            .status()
            .map(|s| s.as_u16())
            .unwrap_or_default();
        tracing::info!(
            method = %method,
            path = %path,
            status,
            duration = ?start.elapsed(),
            "request served"
        );
    }
}
