//! Per-request context — request data, response buffer, parameters, and the
//! pipeline's control state.
//!
//! A [`Context`] is a cheaply-cloneable handle to one request's state. Every
//! handler, middleware, and hook receives a clone; middleware resumes the
//! chain by calling [`Context::next`](crate::pipeline). Interior mutability is
//! lock-per-field and no lock is ever held across an await point — the whole
//! pipeline runs on the connection's task.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::http::{Request, ResponseBuffer, StatusCode};
use crate::pipeline::HandlerFault;
use crate::route::resolve::ExecutionPlan;

/// Recovers the guard even when a panicking handler poisoned the lock; the
/// pipeline's fault path still needs the response buffer afterwards.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Type-erased request extensions map — injects per-request state into
/// handlers without requiring handlers to know about each other's types.
#[derive(Default)]
pub struct Extensions {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T>(&mut self, value: T)
    where
        T: Send + Sync + 'static,
    {
        self.map.insert(TypeId::of::<T>(), Box::new(value));
    }

    pub fn get<T>(&self) -> Option<&T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    pub fn remove<T>(&mut self) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok())
            .map(|value| *value)
    }
}

/// The three abort scopes a pipeline step can raise, plus their combinations.
///
/// Stored as bit flags: the scopes propagate independently. `Handler` stops
/// further handlers/middleware but lets after-hooks and output run; `Hooks`
/// stops the current hook phase only and is cleared when the phase ends;
/// `All` terminates everything that remains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitState(u8);

impl ExitState {
    const HANDLER: u8 = 0b001;
    const HOOKS: u8 = 0b010;
    const ALL: u8 = 0b100;

    pub fn stops_handlers(self) -> bool {
        self.0 & (Self::HANDLER | Self::ALL) != 0
    }

    pub fn stops_hooks(self) -> bool {
        self.0 & (Self::HOOKS | Self::ALL) != 0
    }

    pub fn is_all(self) -> bool {
        self.0 & Self::ALL != 0
    }
}

/// Pipeline cursor: which plan step is active and how far into its bound
/// middleware execution has advanced. Owned exclusively by one request.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Cursor {
    pub step: usize,
    pub middleware: usize,
}

struct Inner {
    request: Request,
    plan: Arc<ExecutionPlan>,
    response: Mutex<ResponseBuffer>,
    params: Mutex<HashMap<String, String>>,
    extensions: Mutex<Extensions>,
    cursor: Mutex<Cursor>,
    exits: AtomicU8,
    served: AtomicBool,
    fault: Mutex<Option<HandlerFault>>,
}

/// Handle to one request's state, shared by every step of its pipeline.
///
/// # Examples
///
/// ```no_run
/// use graft::Context;
///
/// async fn handler(ctx: Context) {
///     let id = ctx.param("id").unwrap_or_default();
///     ctx.write(format!("user {id}"));
/// }
/// ```
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

impl Context {
    pub(crate) fn new(request: Request, plan: Arc<ExecutionPlan>) -> Self {
        Self {
            inner: Arc::new(Inner {
                request,
                plan,
                response: Mutex::new(ResponseBuffer::new()),
                params: Mutex::new(HashMap::new()),
                extensions: Mutex::new(Extensions::new()),
                cursor: Mutex::new(Cursor::default()),
                exits: AtomicU8::new(0),
                served: AtomicBool::new(false),
                fault: Mutex::new(None),
            }),
        }
    }

    /// The parsed request.
    pub fn request(&self) -> &Request {
        &self.inner.request
    }

    pub(crate) fn plan(&self) -> &Arc<ExecutionPlan> {
        &self.inner.plan
    }

    // ── Path parameters ───────────────────────────────────────────────────

    /// A path parameter bound by the active step's matcher.
    pub fn param(&self, name: &str) -> Option<String> {
        lock(&self.inner.params).get(name).cloned()
    }

    /// Snapshot of the active step's parameter map.
    pub fn params(&self) -> HashMap<String, String> {
        lock(&self.inner.params).clone()
    }

    /// Switches the active parameter context when the executor moves to a new
    /// plan step.
    pub(crate) fn switch_params(&self, params: HashMap<String, String>) {
        *lock(&self.inner.params) = params;
    }

    // ── Response buffer ───────────────────────────────────────────────────

    /// Appends UTF-8 text to the response body.
    pub fn write(&self, text: impl AsRef<str>) {
        lock(&self.inner.response).write(text);
    }

    /// Appends UTF-8 text to the response body followed by a newline.
    pub fn writeln(&self, text: impl AsRef<str>) {
        lock(&self.inner.response).writeln(text);
    }

    /// Appends raw bytes to the response body.
    pub fn write_bytes(&self, bytes: impl AsRef<[u8]>) {
        lock(&self.inner.response).write_bytes(bytes);
    }

    /// Sets the response status.
    pub fn set_status(&self, status: StatusCode) {
        lock(&self.inner.response).set_status(status);
    }

    /// The response status, if set.
    pub fn status(&self) -> Option<StatusCode> {
        lock(&self.inner.response).status()
    }

    /// Appends a response header.
    pub fn add_header(&self, name: impl Into<String>, value: impl Into<String>) {
        lock(&self.inner.response).add_header(name, value);
    }

    /// Runs `f` with exclusive access to the response buffer. Do not await
    /// inside `f`.
    pub fn with_response<R>(&self, f: impl FnOnce(&mut ResponseBuffer) -> R) -> R {
        f(&mut lock(&self.inner.response))
    }

    /// Takes the finished response buffer for serialization.
    pub(crate) fn take_response(&self) -> ResponseBuffer {
        std::mem::take(&mut lock(&self.inner.response))
    }

    // ── Extensions ────────────────────────────────────────────────────────

    /// Injects a typed value for later steps of this request.
    pub fn insert_extension<T>(&self, value: T)
    where
        T: Send + Sync + 'static,
    {
        lock(&self.inner.extensions).insert(value);
    }

    /// Clones a previously injected value out of the extensions map.
    pub fn extension<T>(&self) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        lock(&self.inner.extensions).get::<T>().cloned()
    }

    /// Removes and returns a previously injected value.
    pub fn remove_extension<T>(&self) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        lock(&self.inner.extensions).remove::<T>()
    }

    // ── Exit scopes ───────────────────────────────────────────────────────

    /// Stops calling further handlers and middleware for this request.
    /// After-hooks and output still run.
    pub fn exit(&self) {
        self.inner.exits.fetch_or(ExitState::HANDLER, Ordering::SeqCst);
    }

    /// Stops the remaining hooks of the current phase only.
    pub fn exit_hooks(&self) {
        self.inner.exits.fetch_or(ExitState::HOOKS, Ordering::SeqCst);
    }

    /// Terminates the entire pipeline, remaining hook phases included.
    pub fn exit_all(&self) {
        self.inner.exits.fetch_or(ExitState::ALL, Ordering::SeqCst);
    }

    pub(crate) fn exit_state(&self) -> ExitState {
        ExitState(self.inner.exits.load(Ordering::SeqCst))
    }

    /// The hook-phase scope is self-clearing: normal flow resumes once the
    /// phase that raised it ends.
    pub(crate) fn clear_hooks_exit(&self) {
        self.inner
            .exits
            .fetch_and(!ExitState::HOOKS, Ordering::SeqCst);
    }

    // ── Serve/fault bookkeeping ───────────────────────────────────────────

    pub(crate) fn mark_served(&self) {
        self.inner.served.store(true, Ordering::SeqCst);
    }

    /// `true` once a serving handler has been invoked for this request.
    pub fn served(&self) -> bool {
        self.inner.served.load(Ordering::SeqCst)
    }

    pub(crate) fn record_fault(&self, fault: HandlerFault) {
        *lock(&self.inner.fault) = Some(fault);
    }

    /// The recovered fault for this request, if a step panicked.
    pub fn fault(&self) -> Option<HandlerFault> {
        lock(&self.inner.fault).clone()
    }

    pub(crate) fn with_cursor<R>(&self, f: impl FnOnce(&mut Cursor) -> R) -> R {
        f(&mut lock(&self.inner.cursor))
    }

    // ── Cancellation escape hatch ─────────────────────────────────────────

    /// Spawns work that outlives this request's cancellation scope.
    ///
    /// The per-request future is dropped when the client disconnects or the
    /// request times out; work spawned here keeps running. This is a
    /// deliberate, explicit opt-out — not a default.
    pub fn spawn_detached<F>(&self, future: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        tokio::spawn(future)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_context() -> Context {
        let raw = b"GET /x HTTP/1.1\r\nHost: h\r\n\r\n";
        let (req, _) = Request::parse(raw).unwrap();
        let plan = Arc::new(crate::route::resolve::tests_empty_plan());
        Context::new(req, plan)
    }

    #[test]
    fn writes_accumulate_across_clones() {
        let ctx = empty_context();
        let clone = ctx.clone();
        ctx.write("a");
        clone.write("b");
        let body = ctx.with_response(|r| String::from_utf8_lossy(r.body()).into_owned());
        assert_eq!(body, "ab");
    }

    #[test]
    fn exit_scopes_are_independent() {
        let ctx = empty_context();
        assert!(!ctx.exit_state().stops_handlers());

        ctx.exit_hooks();
        assert!(ctx.exit_state().stops_hooks());
        assert!(!ctx.exit_state().stops_handlers());

        ctx.clear_hooks_exit();
        assert!(!ctx.exit_state().stops_hooks());

        ctx.exit();
        assert!(ctx.exit_state().stops_handlers());
        assert!(!ctx.exit_state().stops_hooks());

        ctx.exit_all();
        assert!(ctx.exit_state().is_all());
        assert!(ctx.exit_state().stops_hooks());
    }

    #[test]
    fn clear_hooks_exit_preserves_other_scopes() {
        let ctx = empty_context();
        ctx.exit();
        ctx.exit_hooks();
        ctx.clear_hooks_exit();
        assert!(ctx.exit_state().stops_handlers());
    }

    #[test]
    fn extensions_round_trip() {
        #[derive(Clone, PartialEq, Debug)]
        struct Principal(String);

        let ctx = empty_context();
        ctx.insert_extension(Principal("alice".into()));
        assert_eq!(ctx.extension::<Principal>(), Some(Principal("alice".into())));
        assert_eq!(ctx.remove_extension::<Principal>(), Some(Principal("alice".into())));
        assert_eq!(ctx.extension::<Principal>(), None);
    }

    #[test]
    fn param_context_switches() {
        let ctx = empty_context();
        ctx.switch_params(HashMap::from([("id".to_owned(), "1".to_owned())]));
        assert_eq!(ctx.param("id"), Some("1".to_owned()));
        ctx.switch_params(HashMap::new());
        assert_eq!(ctx.param("id"), None);
    }
}
