//! Minimal graft server: routing, middleware, hooks, and the admin surface.
//!
//! Run with `cargo run --example hello_world`, then:
//!
//! ```text
//! curl http://127.0.0.1:8080/hello
//! curl http://127.0.0.1:8080/users/42
//! curl http://127.0.0.1:8080/admin/restart
//! ```

use graft::{
    config::ServerConfig, middleware, registry::ServerRegistry, server::Server, Context, HookPhase,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let registry = ServerRegistry::new();
    let server = Server::new(ServerConfig::default(), registry);

    server.with_router(|router| {
        router.bind_middleware("/", middleware::logger())?;

        router.bind("GET:/hello", |ctx: Context| async move {
            ctx.write("Hello, World!");
        })?;

        router.bind("GET:/users/:id", |ctx: Context| async move {
            let id = ctx.param("id").unwrap_or_default();
            ctx.write(format!("user {id}"));
        })?;

        router.bind_hook("/", HookPhase::BeforeOutput, |ctx: Context| async move {
            ctx.add_header("X-Served-By", "graft");
        })
    })?;

    server.enable_admin("/admin")?;
    server.start().await?;
    println!("listening on http://127.0.0.1:8080");
    server.wait_terminated().await;
    Ok(())
}
