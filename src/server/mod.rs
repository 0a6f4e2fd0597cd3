//! The server: listener ownership, accept loops, and request dispatch.
//!
//! A [`Server`] owns N listeners (HTTP and/or HTTPS bind addresses), a sealed
//! [`Router`], and the graceful controller. Each accepted connection gets its
//! own Tokio task; the pipeline and hook dispatch for a request run entirely
//! within that task. Listeners are either bound fresh or adopted from a
//! restarting predecessor through the fd-handoff protocol.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::context::Context;
use crate::http::{Request, RequestError, ResponseBuffer, StatusCode};
use crate::pipeline;
use crate::registry::{ListenerRecord, Scheme, ServerRegistry};
use crate::route::{Resolver, Router};

pub mod graceful;
pub mod handoff;
pub mod tls;

pub use graceful::{AdminError, AdminStatus};
pub use tls::TlsMaterial;

/// Errors starting a listener. Fatal to that listener only; the process can
/// keep serving on the others.
#[derive(Debug, Error)]
pub enum ListenError {
    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to adopt inherited listener for {addr}: {source}")]
    Inherit {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS material error for {path}: {message}")]
    Tls { path: PathBuf, message: String },

    #[error("HTTPS listener {addr} configured without tls_cert/tls_key")]
    MissingTlsConfig { addr: String },
}

/// Lifecycle of one listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerStatus {
    Stopped,
    Running,
}

struct ListenerState {
    scheme: Scheme,
    addr: String,
    status: ListenerStatus,
}

/// Maximum size of a complete HTTP request we will buffer before rejecting it (8 MiB).
const MAX_REQUEST_SIZE: usize = 8 * 1024 * 1024;

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

pub(crate) struct ServerInner {
    pub(crate) config: ServerConfig,
    pub(crate) registry: ServerRegistry,
    router: Mutex<Router>,
    resolver: OnceLock<Arc<Resolver>>,
    listeners: Mutex<Vec<ListenerState>>,
    stop: watch::Sender<bool>,
    pub(crate) active: AtomicUsize,
    pub(crate) drained: Notify,
    pub(crate) shutdown_started: AtomicBool,
    pub(crate) terminated: AtomicBool,
    pub(crate) terminated_notify: Notify,
    pub(crate) admin: graceful::AdminState,
}

/// An embeddable HTTP request-dispatch server.
///
/// # Examples
///
/// ```no_run
/// use graft::{config::ServerConfig, registry::ServerRegistry, server::Server, Context};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let registry = ServerRegistry::new();
///     let server = Server::new(ServerConfig::default(), registry);
///     server.with_router(|router| {
///         router.bind("GET:/hello", |ctx: Context| async move {
///             ctx.write("Hello, World!");
///         })
///     })?;
///     server.start().await?;
///     server.wait_terminated().await;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Server {
    pub(crate) inner: Arc<ServerInner>,
}

impl Server {
    /// Creates a server with an empty router. Register routes through
    /// [`with_router`](Self::with_router) before calling [`start`](Self::start).
    pub fn new(config: ServerConfig, registry: ServerRegistry) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            inner: Arc::new(ServerInner {
                config,
                registry,
                router: Mutex::new(Router::new()),
                resolver: OnceLock::new(),
                listeners: Mutex::new(Vec::new()),
                stop,
                active: AtomicUsize::new(0),
                drained: Notify::new(),
                shutdown_started: AtomicBool::new(false),
                terminated: AtomicBool::new(false),
                terminated_notify: Notify::new(),
                admin: graceful::AdminState::new(),
            }),
        }
    }

    /// Runs `f` with mutable access to the router, for the registration phase.
    /// After [`start`](Self::start) the router is sealed and bind calls fail
    /// with `RegistrationClosed`.
    pub fn with_router<R>(&self, f: impl FnOnce(&mut Router) -> R) -> R {
        let mut router = self.inner.router.lock().expect("router lock");
        f(&mut router)
    }

    /// The configured instance name.
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Per-listener `(scheme, address, status)` snapshot.
    pub fn listener_statuses(&self) -> Vec<(Scheme, String, ListenerStatus)> {
        self.inner
            .listeners
            .lock()
            .expect("listener lock")
            .iter()
            .map(|l| (l.scheme, l.addr.clone(), l.status))
            .collect()
    }

    /// Seals the router, opens or adopts every configured listener, begins
    /// serving on each, and registers the instance.
    ///
    /// A listener that fails to start is logged and skipped; the error is
    /// returned only when no listener could be started at all.
    pub async fn start(&self) -> Result<(), ListenError> {
        // Seal registration and move the route table into the resolver. The
        // sealed placeholder left behind rejects late bind calls.
        let router = {
            let mut guard = self.inner.router.lock().expect("router lock");
            let mut taken = std::mem::take(&mut *guard);
            taken.seal();
            guard.seal();
            Arc::new(taken)
        };
        let resolver = Arc::new(Resolver::new(router, self.inner.config.plan_cache_ttl()));
        let resolver = self.inner.resolver.get_or_init(|| resolver).clone();

        // TLS material must load before an HTTPS listener may join the
        // handoff set; a failure disables those listeners, not the process.
        let tls_ready = if self.inner.config.https_addrs.is_empty() {
            false
        } else {
            match self.load_tls_material() {
                Ok(_) => true,
                Err(error) => {
                    error!(error = %error, "HTTPS listeners disabled");
                    false
                }
            }
        };

        let inherited = handoff::inherited()
            .and_then(|mut map| map.remove(&self.inner.config.name))
            .unwrap_or_default();

        let mut plan: Vec<(Scheme, String)> = Vec::new();
        for addr in &self.inner.config.http_addrs {
            plan.push((Scheme::Http, addr.clone()));
        }
        if tls_ready {
            for addr in &self.inner.config.https_addrs {
                plan.push((Scheme::Https, addr.clone()));
            }
        }

        let mut first_error: Option<ListenError> = None;
        let mut records = Vec::new();
        for (scheme, addr) in plan {
            match self.open_listener(scheme, &addr, &inherited).await {
                Ok(listener) => {
                    let local = listener
                        .local_addr()
                        .map(|a| a.to_string())
                        .unwrap_or_else(|_| addr.clone());
                    let fd = raw_fd_of(&listener);
                    info!(scheme = scheme.as_str(), address = %local, fd, "listening");
                    self.inner.listeners.lock().expect("listener lock").push(
                        ListenerState {
                            scheme,
                            addr: local.clone(),
                            status: ListenerStatus::Running,
                        },
                    );
                    records.push(ListenerRecord {
                        scheme,
                        addr: local.clone(),
                        fd,
                    });
                    let server = self.clone();
                    let resolver = resolver.clone();
                    let stop_rx = self.inner.stop.subscribe();
                    tokio::spawn(async move {
                        server.accept_loop(listener, local, resolver, stop_rx).await;
                    });
                }
                Err(e) => {
                    error!(scheme = scheme.as_str(), address = %addr, error = %e, "listener failed to start");
                    first_error.get_or_insert(e);
                }
            }
        }

        let started = !records.is_empty();
        if started {
            self.inner
                .registry
                .register(&self.inner.config.name, records);
        }

        #[cfg(unix)]
        if handoff::is_restarted_child() {
            handoff::terminate_parent();
        }

        #[cfg(unix)]
        graceful::install_signals(self.clone());

        match (started, first_error) {
            (false, Some(e)) => Err(e),
            _ => Ok(()),
        }
    }

    fn load_tls_material(&self) -> Result<TlsMaterial, ListenError> {
        let config = &self.inner.config;
        match (&config.tls_cert, &config.tls_key) {
            (Some(cert), Some(key)) => TlsMaterial::load(cert, key),
            _ => Err(ListenError::MissingTlsConfig {
                addr: config
                    .https_addrs
                    .first()
                    .cloned()
                    .unwrap_or_default(),
            }),
        }
    }

    async fn open_listener(
        &self,
        scheme: Scheme,
        addr: &str,
        inherited: &handoff::ListenerSet,
    ) -> Result<TcpListener, ListenError> {
        #[cfg(unix)]
        if let Some(fd) = inherited.descriptor_for(scheme, addr) {
            info!(address = %addr, fd, "adopting inherited listener");
            let std_listener =
                handoff::adopt_listener(fd).map_err(|source| ListenError::Inherit {
                    addr: addr.to_owned(),
                    source,
                })?;
            return TcpListener::from_std(std_listener).map_err(|source| ListenError::Inherit {
                addr: addr.to_owned(),
                source,
            });
        }
        #[cfg(not(unix))]
        let _ = inherited;

        TcpListener::bind(addr)
            .await
            .map_err(|source| ListenError::Bind {
                addr: addr.to_owned(),
                source,
            })
    }

    async fn accept_loop(
        &self,
        listener: TcpListener,
        addr: String,
        resolver: Arc<Resolver>,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = stop_rx.changed() => {
                    debug!(address = %addr, "accept loop stopping");
                    break;
                }
                accepted = listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            error!(error = %e, "failed to accept connection");
                            continue;
                        }
                    };
                    debug!(peer = %peer_addr, "connection accepted");
                    let server = self.clone();
                    let resolver = resolver.clone();
                    server.inner.active.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream, resolver).await {
                            warn!(peer = %peer_addr, error = %e, "connection closed with error");
                        }
                        if server.inner.active.fetch_sub(1, Ordering::SeqCst) == 1 {
                            server.inner.drained.notify_waiters();
                        }
                    });
                }
            }
        }

        let mut listeners = self.inner.listeners.lock().expect("listener lock");
        if let Some(state) = listeners.iter_mut().find(|l| l.addr == addr) {
            state.status = ListenerStatus::Stopped;
        }
    }

    /// Handles a single connection over its lifetime. HTTP/1.1 connections
    /// are persistent by default: one request per iteration until the peer
    /// closes or signals `Connection: close`.
    async fn handle_connection(
        &self,
        mut stream: TcpStream,
        resolver: Arc<Resolver>,
    ) -> Result<(), std::io::Error> {
        let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);
        let timeout = self.inner.config.request_timeout();

        loop {
            let bytes_read = stream.read_buf(&mut buf).await?;
            if bytes_read == 0 {
                debug!("connection closed by peer");
                break;
            }

            if buf.len() > MAX_REQUEST_SIZE {
                warn!("request too large — sending 413");
                let mut response = ResponseBuffer::new();
                response.set_status(StatusCode::PayloadTooLarge);
                response.write("Request entity too large");
                response.set_keep_alive(false);
                stream.write_all(&response.into_bytes()).await?;
                break;
            }

            let (request, body_offset) = match Request::parse(&buf) {
                Ok(pair) => pair,
                Err(RequestError::Incomplete) => continue,
                Err(e) => {
                    warn!(error = %e, "bad request — sending 400");
                    let mut response = ResponseBuffer::new();
                    response.set_status(StatusCode::BadRequest);
                    response.write(format!("Bad Request: {e}"));
                    response.set_keep_alive(false);
                    stream.write_all(&response.into_bytes()).await?;
                    break;
                }
            };

            // Wait for the full body if Content-Length is set.
            let content_length = request.content_length().unwrap_or(0);
            let total_needed = body_offset + content_length;
            if buf.len() < total_needed {
                continue;
            }

            let keep_alive = request.is_keep_alive();
            debug!(method = %request.method(), path = %request.path(), "dispatching request");

            let plan = resolver.resolve_request(&request);
            let ctx = Context::new(request, plan);

            let timed_out = tokio::time::timeout(timeout, pipeline::serve(&ctx))
                .await
                .is_err();

            let mut response = if timed_out {
                warn!("request deadline exceeded — sending 503");
                let mut r = ResponseBuffer::new();
                r.set_status(StatusCode::ServiceUnavailable);
                r.write("request timed out");
                r
            } else {
                ctx.take_response()
            };
            response.set_keep_alive(keep_alive && !timed_out);
            stream.write_all(&response.into_bytes()).await?;
            stream.flush().await?;

            if !timed_out {
                pipeline::finish(&ctx).await;
            }

            let _ = buf.split_to(total_needed);
            if !timed_out && keep_alive {
                continue;
            }
            break;
        }

        Ok(())
    }

    /// Stops all accept loops. Used by the graceful controller and by the
    /// non-unix restart fallback.
    pub(crate) fn stop_accepting(&self) {
        self.inner.stop.send_replace(true);
    }

    /// Waits until graceful shutdown has fully completed.
    pub async fn wait_terminated(&self) {
        loop {
            let notified = self.inner.terminated_notify.notified();
            if self.inner.terminated.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(unix)]
fn raw_fd_of(listener: &TcpListener) -> i32 {
    use std::os::fd::AsRawFd;
    listener.as_raw_fd()
}

#[cfg(not(unix))]
fn raw_fd_of(_listener: &TcpListener) -> i32 {
    -1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(name: &str) -> ServerConfig {
        ServerConfig {
            name: name.to_owned(),
            // Ephemeral ports so tests never collide.
            http_addrs: vec!["127.0.0.1:0".to_owned()],
            ..ServerConfig::default()
        }
    }

    async fn send_request(addr: &str, raw: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(raw.as_bytes()).await.unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        String::from_utf8_lossy(&out).into_owned()
    }

    #[tokio::test]
    async fn serves_requests_end_to_end() {
        let server = Server::new(test_config("e2e"), ServerRegistry::new());
        server
            .with_router(|router| {
                router.bind("GET:/hello", |ctx: Context| async move {
                    ctx.write("Hello, World!");
                })
            })
            .unwrap();
        server.start().await.unwrap();

        let (_, addr, _) = server.listener_statuses().remove(0);
        let reply = send_request(&addr, "GET /hello HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n").await;
        assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(reply.ends_with("Hello, World!"));

        let missing = send_request(&addr, "GET /nope HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n").await;
        assert!(missing.starts_with("HTTP/1.1 404 Not Found\r\n"));
    }

    #[tokio::test]
    async fn registers_listeners_with_descriptors() {
        let registry = ServerRegistry::new();
        let mut config = test_config("reg");
        config.http_addrs = vec!["127.0.0.1:0".to_owned(), "127.0.0.1:0".to_owned()];
        let server = Server::new(config, registry.clone());
        server.start().await.unwrap();

        let snapshot = registry.snapshot();
        let records = &snapshot["reg"];
        assert_eq!(records.len(), 2);
        for record in records {
            assert_eq!(record.scheme, Scheme::Http);
            #[cfg(unix)]
            assert!(record.fd >= 0);
        }
        let statuses = server.listener_statuses();
        assert!(statuses.iter().all(|(_, _, s)| *s == ListenerStatus::Running));
    }

    #[tokio::test]
    async fn late_registration_is_rejected() {
        let server = Server::new(test_config("late"), ServerRegistry::new());
        server.start().await.unwrap();
        let err = server
            .with_router(|router| router.bind("/late", |_ctx: Context| async {}))
            .unwrap_err();
        assert!(matches!(
            err,
            crate::route::RouteError::RegistrationClosed
        ));
    }

    #[tokio::test]
    async fn bind_conflict_reports_listen_error() {
        let holder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let taken = holder.local_addr().unwrap().to_string();
        let mut config = test_config("conflict");
        config.http_addrs = vec![taken];
        let server = Server::new(config, ServerRegistry::new());
        let err = server.start().await.unwrap_err();
        assert!(matches!(err, ListenError::Bind { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn adopted_listener_accepts_established_backlog() {
        use std::os::fd::IntoRawFd;

        // Simulate a predecessor: bind, let a client connect into the backlog,
        // then hand the raw descriptor over.
        let predecessor = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = predecessor.local_addr().unwrap().to_string();
        let fd = predecessor.into_raw_fd();

        let client = tokio::spawn({
            let addr = addr.clone();
            async move {
                let mut stream = TcpStream::connect(addr).await.unwrap();
                stream
                    .write_all(b"GET /hello HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n")
                    .await
                    .unwrap();
                let mut out = Vec::new();
                stream.read_to_end(&mut out).await.unwrap();
                String::from_utf8_lossy(&out).into_owned()
            }
        });

        // Successor adopts the descriptor and serves the waiting connection.
        let std_listener = handoff::adopt_listener(fd).unwrap();
        let listener = TcpListener::from_std(std_listener).unwrap();
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);
        stream.read_buf(&mut buf).await.unwrap();
        let (request, _) = Request::parse(&buf).unwrap();
        assert_eq!(request.path(), "/hello");
        let mut response = ResponseBuffer::new();
        response.set_status(StatusCode::Ok);
        response.write("adopted");
        response.set_keep_alive(false);
        stream.write_all(&response.into_bytes()).await.unwrap();
        drop(stream);

        let reply = client.await.unwrap();
        assert!(reply.ends_with("adopted"));
    }
}
