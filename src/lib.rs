//! # graft
//!
//! An embeddable async HTTP request-dispatch server: pattern-based routing
//! with a total priority order, an onion middleware/hook pipeline with
//! explicit exit scopes, and zero-downtime restart by handing listening
//! sockets to a successor process.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use graft::{config::ServerConfig, registry::ServerRegistry, server::Server, Context};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = ServerRegistry::new();
//!     let server = Server::new(ServerConfig::default(), registry);
//!
//!     server.with_router(|router| {
//!         router.bind_middleware("/", graft::middleware::logger())?;
//!         router.bind("GET:/users/:id", |ctx: Context| async move {
//!             let id = ctx.param("id").unwrap_or_default();
//!             ctx.write(format!("user {id}"));
//!         })
//!     })?;
//!
//!     server.start().await?;
//!     server.wait_terminated().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod context;
pub mod http;
pub mod middleware;
pub mod pattern;
pub mod pipeline;
pub mod registry;
pub mod route;
pub mod server;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use context::Context;
pub use http::{Headers, Method, MethodSpec, Request, ResponseBuffer, StatusCode};
pub use pattern::RoutePattern;
pub use pipeline::HandlerFault;
pub use route::{HookPhase, RouteError, Router};
pub use server::{AdminError, ListenError, Server};
