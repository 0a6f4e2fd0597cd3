//! The graceful controller: restart, shutdown, signals, and the admin surface.
//!
//! Restart hands every listener descriptor to a successor process through the
//! environment protocol and lets the old process drain; shutdown stops
//! accepting, drains in-flight connections, and deregisters the instance.
//! Both operations are rate-limited and refuse to overlap. OS signals and the
//! admin HTTP handlers funnel into the same controller paths.

use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::time::Instant;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::context::Context;
use crate::http::StatusCode;
use crate::route::RouteError;

use super::Server;

/// What administrative operation, if any, is currently in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminStatus {
    Idle,
    Restarting,
    ShuttingDown,
}

/// Administrative operation rejections. Non-fatal; the caller retries later.
#[derive(Debug, Error)]
pub enum AdminError {
    #[error("a restart is already in progress")]
    RestartInProgress,

    #[error("a shutdown is already in progress")]
    ShutdownInProgress,

    #[error("administrative actions limited to one per {min_interval_ms} ms")]
    ActionTooFrequent { min_interval_ms: u64 },

    #[error("failed to spawn successor process: {0}")]
    SpawnFailed(String),
}

/// Controller state: the in-flight status plus the rate-limit stamp. Touched
/// only by administrative operations, never on the request path.
pub struct AdminState {
    status: Mutex<AdminStatus>,
    last_action: Mutex<Option<Instant>>,
}

impl AdminState {
    pub(crate) fn new() -> Self {
        Self {
            status: Mutex::new(AdminStatus::Idle),
            last_action: Mutex::new(None),
        }
    }
}

impl Server {
    /// The controller's current status.
    pub fn admin_status(&self) -> AdminStatus {
        *self.inner.admin.status.lock().expect("admin lock")
    }

    /// Admission check shared by restart and shutdown: refuses overlapping
    /// operations and enforces the minimum inter-action interval.
    pub(crate) fn begin_admin(&self, next: AdminStatus) -> Result<(), AdminError> {
        let mut status = self.inner.admin.status.lock().expect("admin lock");
        match *status {
            AdminStatus::Restarting => return Err(AdminError::RestartInProgress),
            AdminStatus::ShuttingDown => return Err(AdminError::ShutdownInProgress),
            AdminStatus::Idle => {}
        }

        let min_interval = self.inner.config.admin_min_interval();
        let mut last = self.inner.admin.last_action.lock().expect("admin lock");
        if let Some(previous) = *last {
            if previous.elapsed() < min_interval {
                return Err(AdminError::ActionTooFrequent {
                    min_interval_ms: min_interval.as_millis() as u64,
                });
            }
        }
        *last = Some(Instant::now());
        *status = next;
        Ok(())
    }

    /// Gracefully shuts the server down: stops accepting, drains in-flight
    /// connections within the grace period, deregisters the instance, and
    /// signals process-wide completion.
    pub async fn shutdown(&self) -> Result<(), AdminError> {
        self.begin_admin(AdminStatus::ShuttingDown)?;
        self.shutdown_internal().await;
        Ok(())
    }

    /// The shutdown body, reachable without the admission check: a restarting
    /// parent finishes through here when its successor signals readiness or
    /// the grace period lapses.
    pub(crate) async fn shutdown_internal(&self) {
        if self.inner.shutdown_started.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(server = %self.name(), "graceful shutdown: draining connections");
        self.stop_accepting();

        let drain = async {
            loop {
                let notified = self.inner.drained.notified();
                if self.inner.active.load(Ordering::SeqCst) == 0 {
                    break;
                }
                notified.await;
            }
        };
        if tokio::time::timeout(self.inner.config.grace_period(), drain)
            .await
            .is_err()
        {
            warn!(
                remaining = self.inner.active.load(Ordering::SeqCst),
                "grace period lapsed with connections still open"
            );
        }

        self.inner.registry.deregister(self.name());
        self.inner.terminated.store(true, Ordering::SeqCst);
        self.inner.terminated_notify.notify_waiters();
        info!(server = %self.name(), "graceful shutdown complete");
    }

    /// Restarts the process without dropping listening sockets.
    ///
    /// On unix every registered listener's descriptor is made inheritable and
    /// a successor is spawned with the serialized listener map in its
    /// environment; this process keeps serving until the successor signals
    /// readiness (SIGTERM) or the grace period lapses. On platforms without
    /// descriptor inheritance the listeners are force-closed first and the
    /// successor binds fresh sockets — briefly unavailable.
    ///
    /// Returns the successor's pid. Must be called from within the server's
    /// runtime.
    pub fn restart(&self) -> Result<u32, AdminError> {
        self.begin_admin(AdminStatus::Restarting)?;
        match self.spawn_successor() {
            Ok(pid) => {
                info!(child = pid, "successor spawned; draining until it takes over");
                let server = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(server.inner.config.grace_period()).await;
                    server.shutdown_internal().await;
                });
                Ok(pid)
            }
            Err(e) => {
                // Roll back so a later attempt is admitted.
                *self.inner.admin.status.lock().expect("admin lock") = AdminStatus::Idle;
                Err(e)
            }
        }
    }

    #[cfg(unix)]
    fn spawn_successor(&self) -> Result<u32, AdminError> {
        use super::handoff;

        let snapshot = self.inner.registry.snapshot();
        let map = handoff::build_map(&snapshot);
        for records in snapshot.values() {
            for record in records {
                if record.fd >= 0 {
                    if let Err(e) = handoff::clear_cloexec(record.fd) {
                        warn!(fd = record.fd, error = %e, "could not make descriptor inheritable");
                    }
                }
            }
        }
        let encoded =
            handoff::encode(&map).map_err(|e| AdminError::SpawnFailed(e.to_string()))?;
        let exe = std::env::current_exe()
            .map_err(|e| AdminError::SpawnFailed(e.to_string()))?;
        let child = std::process::Command::new(exe)
            .args(std::env::args().skip(1))
            .env(handoff::LISTENER_MAP_ENV, encoded)
            .env(handoff::RESTARTED_ENV, "1")
            .spawn()
            .map_err(|e| AdminError::SpawnFailed(e.to_string()))?;
        Ok(child.id())
    }

    /// Fallback without descriptor inheritance: close first, respawn fresh.
    #[cfg(not(unix))]
    fn spawn_successor(&self) -> Result<u32, AdminError> {
        warn!("descriptor inheritance unavailable; force-closing listeners before respawn");
        self.stop_accepting();
        let exe = std::env::current_exe()
            .map_err(|e| AdminError::SpawnFailed(e.to_string()))?;
        let child = std::process::Command::new(exe)
            .args(std::env::args().skip(1))
            .spawn()
            .map_err(|e| AdminError::SpawnFailed(e.to_string()))?;
        Ok(child.id())
    }

    /// Registers the admin handlers `{prefix}/restart` and
    /// `{prefix}/shutdown`. Call during the registration phase.
    ///
    /// Both handlers answer JSON and funnel into the same rate-limited
    /// controller operations as the OS signals.
    pub fn enable_admin(&self, prefix: &str) -> Result<(), RouteError> {
        let prefix = prefix.trim_end_matches('/');

        let restart_target = std::sync::Arc::downgrade(&self.inner);
        let shutdown_target = std::sync::Arc::downgrade(&self.inner);

        self.with_router(|router| {
            router.bind(&format!("{prefix}/restart"), move |ctx: Context| {
                let target = restart_target.clone();
                async move {
                    let Some(inner) = target.upgrade() else {
                        ctx.set_status(StatusCode::ServiceUnavailable);
                        return;
                    };
                    let server = Server { inner };
                    match server.restart() {
                        Ok(pid) => {
                            write_admin_json(
                                &ctx,
                                StatusCode::Ok,
                                serde_json::json!({ "status": "restarting", "successor_pid": pid }),
                            );
                        }
                        Err(e) => write_admin_error(&ctx, &e),
                    }
                }
            })?;

            router.bind(&format!("{prefix}/shutdown"), move |ctx: Context| {
                let target = shutdown_target.clone();
                async move {
                    let Some(inner) = target.upgrade() else {
                        ctx.set_status(StatusCode::ServiceUnavailable);
                        return;
                    };
                    let server = Server { inner };
                    match server.begin_admin(AdminStatus::ShuttingDown) {
                        Ok(()) => {
                            write_admin_json(
                                &ctx,
                                StatusCode::Ok,
                                serde_json::json!({ "status": "shutting-down" }),
                            );
                            // Drain in a detached task so this response can
                            // complete; the drain would otherwise wait on the
                            // very connection carrying it.
                            ctx.spawn_detached(async move {
                                server.shutdown_internal().await;
                            });
                        }
                        Err(e) => write_admin_error(&ctx, &e),
                    }
                }
            })
        })
    }
}

fn write_admin_json(ctx: &Context, status: StatusCode, body: serde_json::Value) {
    ctx.set_status(status);
    ctx.add_header("Content-Type", "application/json");
    ctx.write(body.to_string());
}

fn write_admin_error(ctx: &Context, error: &AdminError) {
    let status = match error {
        AdminError::ActionTooFrequent { .. } => StatusCode::TooManyRequests,
        AdminError::RestartInProgress | AdminError::ShutdownInProgress => StatusCode::Conflict,
        AdminError::SpawnFailed(_) => StatusCode::InternalServerError,
    };
    error!(error = %error, "administrative operation rejected");
    write_admin_json(
        ctx,
        status,
        serde_json::json!({ "status": "rejected", "error": error.to_string() }),
    );
}

/// Maps OS signals onto controller operations: SIGTERM → graceful shutdown,
/// SIGINT/SIGQUIT → immediate stop, SIGUSR1 → restart.
#[cfg(unix)]
pub(crate) fn install_signals(server: Server) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut term = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                return;
            }
        };
        let mut int = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "failed to install SIGINT handler");
                return;
            }
        };
        let mut quit = match signal(SignalKind::quit()) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "failed to install SIGQUIT handler");
                return;
            }
        };
        let mut usr1 = match signal(SignalKind::user_defined1()) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "failed to install SIGUSR1 handler");
                return;
            }
        };

        loop {
            tokio::select! {
                _ = term.recv() => {
                    info!("SIGTERM received: graceful shutdown");
                    server.shutdown_internal().await;
                    return;
                }
                _ = int.recv() => {
                    info!("SIGINT received: immediate stop");
                    server.stop_accepting();
                    std::process::exit(0);
                }
                _ = quit.recv() => {
                    info!("SIGQUIT received: immediate stop");
                    server.stop_accepting();
                    std::process::exit(0);
                }
                _ = usr1.recv() => {
                    info!("SIGUSR1 received: restart");
                    if let Err(e) = server.restart() {
                        error!(error = %e, "signal-triggered restart rejected");
                    }
                }
            }
        }
    });
}
