//! The restart socket-handoff protocol.
//!
//! On restart, the parent serializes every server instance's listeners into a
//! JSON map passed through an environment variable, clears `FD_CLOEXEC` on
//! each descriptor, and spawns the successor with the descriptors inherited.
//! The wire shape is `{instance: {"http": "addr#fd,addr#fd", "https": …}}`.
//! A second variable flags the child as a restarted process so it can safely
//! terminate its parent once its listeners are adopted.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::registry::{ListenerRecord, Scheme};

/// Environment variable carrying the serialized listener map.
pub const LISTENER_MAP_ENV: &str = "GRAFT_LISTENER_MAP";

/// Environment variable flagging a restarted (not freshly started) process.
pub const RESTARTED_ENV: &str = "GRAFT_RESTARTED";

/// One instance's listeners on the wire: comma-joined `addr#fd` pairs per
/// scheme, empty string when the instance has no listener of that scheme.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerSet {
    #[serde(default)]
    pub http: String,
    #[serde(default)]
    pub https: String,
}

impl ListenerSet {
    fn slot(&mut self, scheme: Scheme) -> &mut String {
        match scheme {
            Scheme::Http => &mut self.http,
            Scheme::Https => &mut self.https,
        }
    }

    /// Appends one `addr#fd` pair under the given scheme.
    pub fn push(&mut self, scheme: Scheme, addr: &str, fd: i32) {
        let slot = self.slot(scheme);
        if !slot.is_empty() {
            slot.push(',');
        }
        slot.push_str(&format!("{addr}#{fd}"));
    }

    /// Parses the `addr#fd` pairs of one scheme. Malformed pairs are skipped.
    pub fn entries(&self, scheme: Scheme) -> Vec<(String, i32)> {
        let raw = match scheme {
            Scheme::Http => &self.http,
            Scheme::Https => &self.https,
        };
        raw.split(',')
            .filter(|s| !s.is_empty())
            .filter_map(|pair| {
                let (addr, fd) = pair.rsplit_once('#')?;
                Some((addr.to_owned(), fd.parse().ok()?))
            })
            .collect()
    }

    /// Finds the inherited descriptor for `addr` under `scheme`, if any.
    pub fn descriptor_for(&self, scheme: Scheme, addr: &str) -> Option<i32> {
        self.entries(scheme)
            .into_iter()
            .find(|(a, _)| a == addr)
            .map(|(_, fd)| fd)
    }
}

/// Builds the wire map from a registry snapshot.
pub fn build_map(
    snapshot: &HashMap<String, Vec<ListenerRecord>>,
) -> HashMap<String, ListenerSet> {
    let mut map = HashMap::new();
    for (name, records) in snapshot {
        let set: &mut ListenerSet = map.entry(name.clone()).or_default();
        for record in records {
            set.push(record.scheme, &record.addr, record.fd);
        }
    }
    map
}

/// Serializes the listener map for the environment variable.
pub fn encode(map: &HashMap<String, ListenerSet>) -> Result<String, serde_json::Error> {
    serde_json::to_string(map)
}

/// Deserializes the listener map from environment-variable text.
pub fn decode(text: &str) -> Result<HashMap<String, ListenerSet>, serde_json::Error> {
    serde_json::from_str(text)
}

/// Reads and decodes the inherited listener map, if this process was handed
/// one. An undecodable map is ignored with a warning — the server then binds
/// fresh sockets.
pub fn inherited() -> Option<HashMap<String, ListenerSet>> {
    let raw = std::env::var(LISTENER_MAP_ENV).ok()?;
    match decode(&raw) {
        Ok(map) => Some(map),
        Err(error) => {
            tracing::warn!(error = %error, "ignoring undecodable listener handoff map");
            None
        }
    }
}

/// `true` when this process was spawned by a restarting parent.
pub fn is_restarted_child() -> bool {
    std::env::var(RESTARTED_ENV).is_ok_and(|v| v == "1")
}

/// Clears `FD_CLOEXEC` so the descriptor survives the exec into the
/// successor process.
#[cfg(unix)]
pub fn clear_cloexec(fd: i32) -> std::io::Result<()> {
    // SAFETY: fcntl on an fd we own; no memory is touched.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Rebuilds a std TCP listener from an inherited descriptor.
///
/// # Safety-adjacent note
///
/// The descriptor must be a listening TCP socket owned by this process (the
/// handoff map is the only source of these), and ownership transfers to the
/// returned listener.
#[cfg(unix)]
pub fn adopt_listener(fd: i32) -> std::io::Result<std::net::TcpListener> {
    use std::os::fd::FromRawFd;
    // SAFETY: per the handoff contract the fd is a live listening socket this
    // process inherited and nothing else owns.
    let listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// Signals the pre-restart parent to begin its graceful exit. Called by a
/// restarted child once its listeners are adopted and serving.
#[cfg(unix)]
pub fn terminate_parent() {
    // SAFETY: plain syscalls; getppid cannot fail.
    let parent = unsafe { libc::getppid() };
    if parent > 1 {
        tracing::info!(parent, "signaling pre-restart parent to exit");
        unsafe {
            libc::kill(parent, libc::SIGTERM);
        }
    }
}
