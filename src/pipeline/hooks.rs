//! Hook dispatch around the serve loop.
//!
//! Four fixed phases run in a fixed order: before-serve, after-serve,
//! before-output, after-output. Each phase filters the plan's hook entries by
//! phase name and runs them in registration order inside the same panic guard
//! the serve loop uses. Hooks share the per-request parameter context but
//! never touch the middleware cursor.

use crate::context::Context;
use crate::route::{HandlerKind, HookPhase};

use super::{invoke_guarded, report_fault};

/// Runs every hook of `phase` for this request.
///
/// Honors the exit scopes: `exit_hooks` stops the remaining hooks of this
/// phase and is cleared afterwards so normal flow resumes; `exit_all` stops
/// this and every later phase. A panicking hook is recovered in place and the
/// rest of the phase continues.
pub(crate) async fn dispatch(ctx: &Context, phase: HookPhase) {
    if ctx.exit_state().is_all() {
        return;
    }

    let steps: Vec<_> = ctx.plan().hooks(phase).cloned().collect();
    for step in steps {
        if ctx.exit_state().stops_hooks() {
            break;
        }
        let HandlerKind::Hook { run, .. } = step.entry.kind() else {
            continue;
        };
        ctx.switch_params(step.params.clone());
        tracing::trace!(
            phase = phase.as_str(),
            route = %step.entry.pattern(),
            "dispatching hook"
        );
        if let Err(fault) = invoke_guarded(ctx, run).await {
            report_fault(ctx, fault);
        }
    }

    ctx.clear_hooks_exit();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{Method, Request};
    use crate::route::{Resolver, Router};
    use std::sync::Arc;

    fn hook_context(build: impl FnOnce(&mut Router)) -> Context {
        let mut router = Router::new();
        build(&mut router);
        router.seal();
        let resolver = Resolver::new(Arc::new(router), Resolver::DEFAULT_TTL);
        let raw = b"GET /p HTTP/1.1\r\nHost: localhost\r\n\r\n";
        let (request, _) = Request::parse(raw).unwrap();
        let plan = resolver.resolve(&Method::Get, "/p", "localhost");
        Context::new(request, plan)
    }

    fn body_of(ctx: &Context) -> String {
        ctx.with_response(|r| String::from_utf8_lossy(r.body()).into_owned())
    }

    #[tokio::test]
    async fn hooks_run_in_registration_order() {
        let ctx = hook_context(|router| {
            router
                .bind_hook("/p", HookPhase::BeforeServe, |ctx: Context| async move {
                    ctx.write("a");
                })
                .unwrap();
            router
                .bind_hook("/p", HookPhase::BeforeServe, |ctx: Context| async move {
                    ctx.write("b");
                })
                .unwrap();
        });
        dispatch(&ctx, HookPhase::BeforeServe).await;
        assert_eq!(body_of(&ctx), "ab");
    }

    #[tokio::test]
    async fn phase_filter_applies() {
        let ctx = hook_context(|router| {
            router
                .bind_hook("/p", HookPhase::AfterOutput, |ctx: Context| async move {
                    ctx.write("late");
                })
                .unwrap();
        });
        dispatch(&ctx, HookPhase::BeforeServe).await;
        assert_eq!(body_of(&ctx), "");
        dispatch(&ctx, HookPhase::AfterOutput).await;
        assert_eq!(body_of(&ctx), "late");
    }

    #[tokio::test]
    async fn panicking_hook_does_not_stop_phase() {
        let ctx = hook_context(|router| {
            router
                .bind_hook("/p", HookPhase::BeforeServe, |_ctx: Context| async move {
                    panic!("hook boom");
                })
                .unwrap();
            router
                .bind_hook("/p", HookPhase::BeforeServe, |ctx: Context| async move {
                    ctx.write("still-here");
                })
                .unwrap();
        });
        dispatch(&ctx, HookPhase::BeforeServe).await;
        assert!(ctx.fault().is_some());
        assert!(body_of(&ctx).ends_with("still-here"));
    }

    #[tokio::test]
    async fn hook_params_bound_from_its_own_pattern() {
        let ctx = hook_context(|router| {
            router
                .bind_hook("/:section", HookPhase::BeforeServe, |ctx: Context| async move {
                    ctx.write(ctx.param("section").unwrap_or_default());
                })
                .unwrap();
        });
        dispatch(&ctx, HookPhase::BeforeServe).await;
        assert_eq!(body_of(&ctx), "p");
    }
}
