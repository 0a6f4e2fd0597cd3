//! Route registration — entries, the registration facade, and the segment index.
//!
//! Registration happens during a bounded startup phase: handlers, objects,
//! middleware, and hooks are bound to compiled patterns, insertion-sorted into
//! the per-domain segment index by the priority comparator, and frozen by
//! [`Router::seal`] before the server accepts traffic.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

use crate::context::Context;
use crate::pattern::{PatternError, RoutePattern};

pub mod bind;
pub mod index;
pub mod priority;
pub mod resolve;

pub use bind::{BindError, Binder};
pub use resolve::{ExecutionPlan, PlanStep, Resolver};

use index::DomainIndex;

/// Type-erased, heap-allocated async handler invoked with a per-request
/// [`Context`].
///
/// Handlers are stored behind `Arc<dyn Fn(…)>` so they can be cloned and
/// shared across index lists and tasks without copying the underlying
/// closure. In practice you never construct this type directly — the
/// [`Router`] bind methods accept any [`IntoHandler`].
pub type Handler =
    Arc<dyn Fn(Context) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync + 'static>;

/// Conversion trait for async handler functions.
///
/// Any `Fn(Context) -> impl Future<Output = ()> + Send` that is also
/// `Send + Sync + 'static` implements this trait automatically via the
/// blanket impl below.
pub trait IntoHandler: Send + Sync + 'static {
    /// Call the handler with the given context, boxing the returned future.
    fn call(&self, ctx: Context) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

impl<T, F> IntoHandler for T
where
    T: Fn(Context) -> F + Send + Sync + 'static,
    F: Future<Output = ()> + Send + 'static,
{
    fn call(&self, ctx: Context) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin((self)(ctx))
    }
}

/// Erases an [`IntoHandler`] into a shareable [`Handler`].
pub fn to_handler(handler: impl IntoHandler) -> Handler {
    Arc::new(move |ctx| handler.call(ctx))
}

/// The four fixed hook phases dispatched around the serve loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPhase {
    BeforeServe,
    AfterServe,
    BeforeOutput,
    AfterOutput,
}

impl HookPhase {
    /// Phase name as registered and logged.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BeforeServe => "before-serve",
            Self::AfterServe => "after-serve",
            Self::BeforeOutput => "before-output",
            Self::AfterOutput => "after-output",
        }
    }
}

/// What a registered entry is, as a closed sum — each variant carries exactly
/// the callables it needs.
pub enum HandlerKind {
    /// A plain serving handler.
    Handler { serve: Handler },
    /// An object-bound serving handler with optional lifecycle callables.
    Object {
        init: Option<Handler>,
        serve: Handler,
        shutdown: Option<Handler>,
    },
    /// Global onion middleware; resumes the chain by calling `Context::next`.
    Middleware { run: Handler },
    /// A hook attached to one of the fixed phases.
    Hook { phase: HookPhase, run: Handler },
}

impl std::fmt::Debug for HandlerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Handler { .. } => f.write_str("Handler"),
            Self::Object { .. } => f.write_str("Object"),
            Self::Middleware { .. } => f.write_str("Middleware"),
            Self::Hook { phase, .. } => write!(f, "Hook({})", phase.as_str()),
        }
    }
}

/// Lifecycle callables for [`Router::bind_object`].
pub struct ObjectHandlers {
    pub init: Option<Handler>,
    pub serve: Handler,
    pub shutdown: Option<Handler>,
}

static NEXT_ENTRY_ID: AtomicU64 = AtomicU64::new(1);

/// One registered route entry.
///
/// Created once at registration and never mutated; every index list the entry
/// joins holds an `Arc` reference to the same value. The id is process-unique
/// and monotonic, which also makes it the registration-order key.
pub struct HandlerEntry {
    id: u64,
    kind: HandlerKind,
    bound_middleware: Vec<Handler>,
    pattern: Arc<RoutePattern>,
    source: String,
}

impl HandlerEntry {
    fn new(
        kind: HandlerKind,
        bound_middleware: Vec<Handler>,
        pattern: Arc<RoutePattern>,
        source: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_ENTRY_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            bound_middleware,
            pattern,
            source,
        })
    }

    /// Process-unique, monotonically assigned id.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> &HandlerKind {
        &self.kind
    }

    /// Middleware registered inline with this entry.
    pub fn bound_middleware(&self) -> &[Handler] {
        &self.bound_middleware
    }

    pub fn pattern(&self) -> &Arc<RoutePattern> {
        &self.pattern
    }

    /// Registration-source label, for logs and route dumps.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_middleware(&self) -> bool {
        matches!(self.kind, HandlerKind::Middleware { .. })
    }

    /// `true` for the kinds that can serve a request (Handler / Object).
    pub fn is_serving(&self) -> bool {
        matches!(
            self.kind,
            HandlerKind::Handler { .. } | HandlerKind::Object { .. }
        )
    }

    pub fn is_hook(&self) -> bool {
        matches!(self.kind, HandlerKind::Hook { .. })
    }

    pub fn hook_phase(&self) -> Option<HookPhase> {
        match self.kind {
            HandlerKind::Hook { phase, .. } => Some(phase),
            _ => None,
        }
    }

    /// Tests this entry's matcher against a request path, binding parameters.
    ///
    /// Middleware matches by prefix so a chain bound at `/api` wraps every
    /// handler underneath it; all other kinds match the path exactly.
    pub fn match_request(&self, path: &str) -> Option<Vec<(String, String)>> {
        if self.is_middleware() {
            self.pattern.match_prefix(path)
        } else {
            self.pattern.match_path(path)
        }
    }
}

impl std::fmt::Debug for HandlerEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerEntry")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("pattern", &format_args!("{}", self.pattern))
            .field("source", &self.source)
            .finish()
    }
}

/// Errors produced at route registration. All are fatal to startup.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error(transparent)]
    InvalidPattern(#[from] PatternError),

    #[error("duplicate route {key:?}: already registered by {existing}")]
    DuplicateRoute { key: String, existing: String },

    #[error("router is sealed; routes cannot be registered after the server starts")]
    RegistrationClosed,
}

/// The route registration facade and per-domain segment index.
///
/// # Examples
///
/// ```
/// use graft::route::Router;
///
/// let mut router = Router::new();
/// router.bind("GET:/users/:id", |ctx: graft::Context| async move {
///     let id = ctx.param("id").unwrap_or_default();
///     ctx.write(id);
/// }).unwrap();
/// ```
pub struct Router {
    domains: HashMap<String, DomainIndex>,
    /// Serving-route dedupe: `METHOD:path@domain` → source label.
    registered: HashMap<String, (u64, String)>,
    allow_override: bool,
    sealed: bool,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    /// Creates an empty router with overriding disabled.
    pub fn new() -> Self {
        Self {
            domains: HashMap::new(),
            registered: HashMap::new(),
            allow_override: false,
            sealed: false,
        }
    }

    /// Permits a later serving registration to replace an earlier one for the
    /// same `(domain, method, path)`. Disabled by default.
    pub fn allow_override(&mut self, allow: bool) -> &mut Self {
        self.allow_override = allow;
        self
    }

    /// Freezes the router. Called when a server starts; registration
    /// afterwards fails with [`RouteError::RegistrationClosed`].
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Registers a plain serving handler.
    pub fn bind(&mut self, pattern: &str, handler: impl IntoHandler) -> Result<(), RouteError> {
        let serve = to_handler(handler);
        self.register(pattern, Vec::new(), "bind", |_| HandlerKind::Handler {
            serve: serve.clone(),
        })
    }

    /// Registers a serving handler with inline bound middleware, executed in
    /// order before the handler for requests this route serves.
    pub fn bind_with(
        &mut self,
        pattern: &str,
        middleware: Vec<Handler>,
        handler: impl IntoHandler,
    ) -> Result<(), RouteError> {
        let serve = to_handler(handler);
        self.register(pattern, middleware, "bind_with", |_| HandlerKind::Handler {
            serve: serve.clone(),
        })
    }

    /// Registers an object-bound handler with optional init/shutdown
    /// lifecycle callables run around the serve method.
    pub fn bind_object(&mut self, pattern: &str, object: ObjectHandlers) -> Result<(), RouteError> {
        let ObjectHandlers {
            init,
            serve,
            shutdown,
        } = object;
        self.register(pattern, Vec::new(), "bind_object", |_| HandlerKind::Object {
            init: init.clone(),
            serve: serve.clone(),
            shutdown: shutdown.clone(),
        })
    }

    /// Registers global onion middleware for every route under `pattern`.
    pub fn bind_middleware(
        &mut self,
        pattern: &str,
        handler: impl IntoHandler,
    ) -> Result<(), RouteError> {
        let run = to_handler(handler);
        self.register(pattern, Vec::new(), "bind_middleware", |_| {
            HandlerKind::Middleware { run: run.clone() }
        })
    }

    /// Registers a hook on one of the fixed phases.
    pub fn bind_hook(
        &mut self,
        pattern: &str,
        phase: HookPhase,
        handler: impl IntoHandler,
    ) -> Result<(), RouteError> {
        let run = to_handler(handler);
        self.register(pattern, Vec::new(), "bind_hook", move |_| HandlerKind::Hook {
            phase,
            run: run.clone(),
        })
    }

    fn register(
        &mut self,
        pattern: &str,
        bound_middleware: Vec<Handler>,
        source: &str,
        make_kind: impl Fn(&Arc<RoutePattern>) -> HandlerKind,
    ) -> Result<(), RouteError> {
        if self.sealed {
            return Err(RouteError::RegistrationClosed);
        }
        let patterns = RoutePattern::parse(pattern)?;
        for route_pattern in patterns {
            let kind = make_kind(&route_pattern);
            let entry = HandlerEntry::new(
                kind,
                bound_middleware.clone(),
                route_pattern.clone(),
                source.to_owned(),
            );

            if entry.is_serving() {
                let key = format!(
                    "{}:{}@{}",
                    route_pattern.method(),
                    route_pattern.path(),
                    route_pattern.domain()
                );
                if let Some((old_id, existing)) = self.registered.get(&key).cloned() {
                    if !self.allow_override {
                        return Err(RouteError::DuplicateRoute { key, existing });
                    }
                    tracing::warn!(route = %key, "overriding previously registered route");
                    if let Some(index) = self.domains.get_mut(route_pattern.domain()) {
                        index.remove(old_id);
                    }
                }
                self.registered
                    .insert(key, (entry.id(), source.to_owned()));
            }

            tracing::debug!(
                route = %route_pattern,
                kind = ?entry.kind(),
                id = entry.id(),
                "route registered"
            );
            self.domains
                .entry(route_pattern.domain().to_owned())
                .or_default()
                .insert(entry);
        }
        Ok(())
    }

    /// Looks up a domain's index, if any route was registered for it.
    pub(crate) fn domain(&self, name: &str) -> Option<&DomainIndex> {
        self.domains.get(name)
    }

    #[cfg(test)]
    pub(crate) fn domain_mut_for_tests(&mut self, name: &str) -> &mut DomainIndex {
        self.domains.get_mut(name).expect("domain not registered")
    }

    /// Total number of entries across all domains.
    pub fn len(&self) -> usize {
        self.domains.values().map(DomainIndex::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
