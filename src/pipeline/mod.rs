//! Pipeline execution — driving a resolved plan with continuation and abort
//! semantics.
//!
//! [`Context::next`] is the sole driver: middleware receives the context,
//! runs its pre-continuation code, calls `next().await`, and runs its
//! post-continuation code — classic onion nesting, not automatic chaining.
//! Plain handlers and object lifecycles are advanced by the loop itself.
//! Every callable runs inside a panic guard; a recovered fault becomes a 500
//! response and stops the loop without touching other requests.

use std::backtrace::Backtrace;

use futures_util::FutureExt;
use thiserror::Error;

use crate::context::Context;
use crate::http::StatusCode;
use crate::route::{Handler, HandlerKind, HookPhase};

pub mod hooks;

/// A recovered fault from a panicking handler, middleware, or hook.
///
/// Carries the panic message and a captured backtrace. When a fault value
/// itself is re-panicked through a nested guard, the original backtrace is
/// preserved rather than replaced.
#[derive(Debug, Clone, Error)]
#[error("handler fault: {message}")]
pub struct HandlerFault {
    pub message: String,
    pub backtrace: String,
}

impl HandlerFault {
    fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        if let Some(fault) = payload.downcast_ref::<HandlerFault>() {
            return fault.clone();
        }
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_owned())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_owned());
        Self {
            message,
            backtrace: Backtrace::force_capture().to_string(),
        }
    }
}

/// Awaits one callable inside a panic guard.
async fn invoke_guarded(ctx: &Context, handler: &Handler) -> Result<(), HandlerFault> {
    match std::panic::AssertUnwindSafe(handler(ctx.clone()))
        .catch_unwind()
        .await
    {
        Ok(()) => Ok(()),
        Err(payload) => Err(HandlerFault::from_panic(payload)),
    }
}

/// Records a recovered fault and writes the 500 response.
fn report_fault(ctx: &Context, fault: HandlerFault) {
    tracing::error!(
        error = %fault.message,
        backtrace = %fault.backtrace,
        "recovered fault during pipeline execution"
    );
    ctx.set_status(StatusCode::InternalServerError);
    ctx.write("Internal Server Error");
    ctx.record_fault(fault);
}

enum Action {
    Done,
    BoundMiddleware(Handler, std::collections::HashMap<String, String>),
    Entry(
        std::sync::Arc<crate::route::HandlerEntry>,
        std::collections::HashMap<String, String>,
    ),
}

impl Context {
    /// Advances the pipeline.
    ///
    /// Middleware is expected to call this to resume the chain; the loop
    /// otherwise walks the plan itself: it skips hook entries (hooks dispatch
    /// separately), switches the parameter context per step, drains each
    /// entry's bound middleware one call at a time, and invokes the entry per
    /// its kind. The loop stops when an exit scope is raised, a middleware
    /// takes over the continuation, or the plan is exhausted.
    pub async fn next(&self) {
        loop {
            if self.exit_state().stops_handlers() {
                return;
            }

            let action = self.with_cursor(|cursor| loop {
                let Some(step) = self.plan().steps().get(cursor.step) else {
                    return Action::Done;
                };
                if step.entry.is_hook() {
                    cursor.step += 1;
                    cursor.middleware = 0;
                    continue;
                }
                if cursor.middleware < step.entry.bound_middleware().len() {
                    let mw = step.entry.bound_middleware()[cursor.middleware].clone();
                    cursor.middleware += 1;
                    return Action::BoundMiddleware(mw, step.params.clone());
                }
                cursor.step += 1;
                cursor.middleware = 0;
                return Action::Entry(step.entry.clone(), step.params.clone());
            });

            match action {
                Action::Done => return,
                Action::BoundMiddleware(mw, params) => {
                    self.switch_params(params);
                    if let Err(fault) = invoke_guarded(self, &mw).await {
                        report_fault(self, fault);
                        self.exit();
                    }
                    // The bound middleware resumes the chain through its own
                    // next() call; returning here is what makes the onion.
                    return;
                }
                Action::Entry(entry, params) => {
                    self.switch_params(params);
                    match entry.kind() {
                        HandlerKind::Handler { serve } => {
                            if !self.exit_state().stops_handlers() {
                                self.mark_served();
                                if let Err(fault) = invoke_guarded(self, serve).await {
                                    report_fault(self, fault);
                                    self.exit();
                                }
                            }
                        }
                        HandlerKind::Object {
                            init,
                            serve,
                            shutdown,
                        } => {
                            if let Some(init) = init {
                                if let Err(fault) = invoke_guarded(self, init).await {
                                    report_fault(self, fault);
                                    self.exit();
                                }
                            }
                            if !self.exit_state().stops_handlers() {
                                self.mark_served();
                                if let Err(fault) = invoke_guarded(self, serve).await {
                                    report_fault(self, fault);
                                    self.exit();
                                }
                            }
                            // Shutdown runs even after an exit or fault.
                            if let Some(shutdown) = shutdown {
                                if let Err(fault) = invoke_guarded(self, shutdown).await {
                                    report_fault(self, fault);
                                    self.exit();
                                }
                            }
                        }
                        HandlerKind::Middleware { run } => {
                            if let Err(fault) = invoke_guarded(self, run).await {
                                report_fault(self, fault);
                                self.exit();
                            }
                            return;
                        }
                        HandlerKind::Hook { .. } => {}
                    }
                }
            }
        }
    }
}

/// Runs a request through the serve side of the pipeline: before-serve hooks,
/// the handler/middleware chain, after-serve hooks, status finalization, and
/// before-output hooks. The caller then serializes the response and calls
/// [`finish`].
pub async fn serve(ctx: &Context) {
    hooks::dispatch(ctx, HookPhase::BeforeServe).await;
    if !ctx.exit_state().is_all() {
        ctx.next().await;
    }
    hooks::dispatch(ctx, HookPhase::AfterServe).await;
    finalize_status(ctx);
    hooks::dispatch(ctx, HookPhase::BeforeOutput).await;
}

/// Runs the after-output hook phase once the response has been written.
pub async fn finish(ctx: &Context) {
    hooks::dispatch(ctx, HookPhase::AfterOutput).await;
}

/// If nothing set a status: 200 when a handler served, 404 otherwise.
fn finalize_status(ctx: &Context) {
    if ctx.status().is_none() {
        let status = if ctx.served() {
            StatusCode::Ok
        } else {
            StatusCode::NotFound
        };
        ctx.set_status(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{Method, Request};
    use crate::route::{to_handler, ObjectHandlers, Resolver, Router};
    use std::sync::Arc;

    fn make_context(build: impl FnOnce(&mut Router), method: &str, path: &str) -> Context {
        let mut router = Router::new();
        build(&mut router);
        router.seal();
        let resolver = Resolver::new(Arc::new(router), Resolver::DEFAULT_TTL);
        let raw = format!("{method} {path} HTTP/1.1\r\nHost: localhost\r\n\r\n");
        let (request, _) = Request::parse(raw.as_bytes()).unwrap();
        let parsed: Method = method.parse().unwrap();
        let plan = resolver.resolve(&parsed, path, request.host());
        Context::new(request, plan)
    }

    fn body_of(ctx: &Context) -> String {
        ctx.with_response(|r| String::from_utf8_lossy(r.body()).into_owned())
    }

    #[tokio::test]
    async fn onion_middleware_interleaving() {
        let ctx = make_context(
            |router| {
                router
                    .bind_middleware("/test", |ctx: Context| async move {
                        ctx.write("1");
                        ctx.next().await;
                        ctx.write("2");
                    })
                    .unwrap();
                router
                    .bind_middleware("/test/:name", |ctx: Context| async move {
                        ctx.write("3");
                        ctx.next().await;
                        ctx.write("4");
                    })
                    .unwrap();
                router
                    .bind("/test/test", |ctx: Context| async move {
                        ctx.write("test");
                    })
                    .unwrap();
            },
            "GET",
            "/test/test",
        );

        serve(&ctx).await;
        assert_eq!(body_of(&ctx), "13test42");
        assert_eq!(ctx.status(), Some(StatusCode::Ok));
    }

    #[tokio::test]
    async fn bound_middleware_wrap_their_handler() {
        let ctx = make_context(
            |router| {
                let m1 = to_handler(|ctx: Context| async move {
                    ctx.write("a");
                    ctx.next().await;
                    ctx.write("d");
                });
                let m2 = to_handler(|ctx: Context| async move {
                    ctx.write("b");
                    ctx.next().await;
                    ctx.write("c");
                });
                router
                    .bind_with("/wrapped", vec![m1, m2], |ctx: Context| async move {
                        ctx.write("X");
                    })
                    .unwrap();
            },
            "GET",
            "/wrapped",
        );

        serve(&ctx).await;
        assert_eq!(body_of(&ctx), "abXcd");
    }

    #[tokio::test]
    async fn middleware_short_circuit_skips_handler() {
        let ctx = make_context(
            |router| {
                router
                    .bind_middleware("/guarded", |ctx: Context| async move {
                        ctx.set_status(StatusCode::Unauthorized);
                        ctx.write("denied");
                        // No next() call: the chain stops here.
                    })
                    .unwrap();
                router
                    .bind("/guarded", |ctx: Context| async move {
                        ctx.write("secret");
                    })
                    .unwrap();
            },
            "GET",
            "/guarded",
        );

        serve(&ctx).await;
        assert_eq!(body_of(&ctx), "denied");
        assert_eq!(ctx.status(), Some(StatusCode::Unauthorized));
        assert!(!ctx.served());
    }

    #[tokio::test]
    async fn exit_stops_handlers_but_after_hooks_run() {
        let ctx = make_context(
            |router| {
                router
                    .bind_middleware("/e", |ctx: Context| async move {
                        ctx.write("before");
                        ctx.exit();
                        ctx.next().await;
                        ctx.write("after");
                    })
                    .unwrap();
                router
                    .bind("/e", |ctx: Context| async move {
                        ctx.write("handler");
                    })
                    .unwrap();
                router
                    .bind_hook("/e", HookPhase::AfterServe, |ctx: Context| async move {
                        ctx.write("|after-serve");
                    })
                    .unwrap();
                router
                    .bind_hook("/e", HookPhase::BeforeOutput, |ctx: Context| async move {
                        ctx.write("|before-output");
                    })
                    .unwrap();
            },
            "GET",
            "/e",
        );

        serve(&ctx).await;
        // The handler never ran, the middleware's post-continuation code did,
        // and both after-hooks fired.
        assert_eq!(body_of(&ctx), "beforeafter|after-serve|before-output");
        assert_eq!(ctx.status(), Some(StatusCode::NotFound));
    }

    #[tokio::test]
    async fn exit_all_in_before_serve_suppresses_everything() {
        let ctx = make_context(
            |router| {
                router
                    .bind_hook("/a", HookPhase::BeforeServe, |ctx: Context| async move {
                        ctx.write("first");
                        ctx.exit_all();
                    })
                    .unwrap();
                router
                    .bind_hook("/a", HookPhase::BeforeServe, |ctx: Context| async move {
                        ctx.write("|second-before");
                    })
                    .unwrap();
                router
                    .bind_hook("/a", HookPhase::AfterServe, |ctx: Context| async move {
                        ctx.write("|after-serve");
                    })
                    .unwrap();
                router
                    .bind_hook("/a", HookPhase::BeforeOutput, |ctx: Context| async move {
                        ctx.write("|before-output");
                    })
                    .unwrap();
                router
                    .bind_hook("/a", HookPhase::AfterOutput, |ctx: Context| async move {
                        ctx.write("|after-output");
                    })
                    .unwrap();
                router
                    .bind("/a", |ctx: Context| async move {
                        ctx.write("|handler");
                    })
                    .unwrap();
            },
            "GET",
            "/a",
        );

        serve(&ctx).await;
        finish(&ctx).await;
        assert_eq!(body_of(&ctx), "first");
        assert!(!ctx.served());
    }

    #[tokio::test]
    async fn exit_hooks_stops_phase_only() {
        let ctx = make_context(
            |router| {
                router
                    .bind_hook("/h", HookPhase::BeforeServe, |ctx: Context| async move {
                        ctx.write("h1");
                        ctx.exit_hooks();
                    })
                    .unwrap();
                router
                    .bind_hook("/h", HookPhase::BeforeServe, |ctx: Context| async move {
                        ctx.write("h2");
                    })
                    .unwrap();
                router
                    .bind_hook("/h", HookPhase::AfterServe, |ctx: Context| async move {
                        ctx.write("|h3");
                    })
                    .unwrap();
                router
                    .bind("/h", |ctx: Context| async move {
                        ctx.write("|serve");
                    })
                    .unwrap();
            },
            "GET",
            "/h",
        );

        serve(&ctx).await;
        // h2 is suppressed; the handler and the next phase still run.
        assert_eq!(body_of(&ctx), "h1|serve|h3");
        assert_eq!(ctx.status(), Some(StatusCode::Ok));
    }

    #[tokio::test]
    async fn panic_is_recovered_as_500() {
        let ctx = make_context(
            |router| {
                router
                    .bind("/boom", |_ctx: Context| async move {
                        panic!("kaboom");
                    })
                    .unwrap();
                router
                    .bind_hook("/boom", HookPhase::AfterServe, |ctx: Context| async move {
                        ctx.write("|survived");
                    })
                    .unwrap();
            },
            "GET",
            "/boom",
        );

        serve(&ctx).await;
        assert_eq!(ctx.status(), Some(StatusCode::InternalServerError));
        let fault = ctx.fault().expect("fault recorded");
        assert_eq!(fault.message, "kaboom");
        assert!(!fault.backtrace.is_empty());
        // The fault stayed contained: the after-serve hook still ran.
        assert!(body_of(&ctx).ends_with("|survived"));
    }

    #[tokio::test]
    async fn unmatched_request_finalizes_404() {
        let ctx = make_context(|_router| {}, "GET", "/nowhere");
        serve(&ctx).await;
        assert_eq!(ctx.status(), Some(StatusCode::NotFound));
        assert!(!ctx.served());
    }

    #[tokio::test]
    async fn object_lifecycle_order() {
        let ctx = make_context(
            |router| {
                let object = ObjectHandlers {
                    init: Some(to_handler(|ctx: Context| async move {
                        ctx.write("init,");
                    })),
                    serve: to_handler(|ctx: Context| async move {
                        ctx.write("serve,");
                    }),
                    shutdown: Some(to_handler(|ctx: Context| async move {
                        ctx.write("shutdown");
                    })),
                };
                router.bind_object("/obj", object).unwrap();
            },
            "GET",
            "/obj",
        );

        serve(&ctx).await;
        assert_eq!(body_of(&ctx), "init,serve,shutdown");
        assert_eq!(ctx.status(), Some(StatusCode::Ok));
    }

    #[tokio::test]
    async fn object_init_exit_skips_serve_but_not_shutdown() {
        let ctx = make_context(
            |router| {
                let object = ObjectHandlers {
                    init: Some(to_handler(|ctx: Context| async move {
                        ctx.write("init,");
                        ctx.exit();
                    })),
                    serve: to_handler(|ctx: Context| async move {
                        ctx.write("serve,");
                    }),
                    shutdown: Some(to_handler(|ctx: Context| async move {
                        ctx.write("shutdown");
                    })),
                };
                router.bind_object("/obj", object).unwrap();
            },
            "GET",
            "/obj",
        );

        serve(&ctx).await;
        assert_eq!(body_of(&ctx), "init,shutdown");
        assert!(!ctx.served());
    }
}
