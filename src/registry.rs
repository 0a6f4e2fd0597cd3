//! Process-owned server registry.
//!
//! The registry maps instance names to their live listener records. It is
//! created by the process entry point and injected into each server — there
//! is no process-global state. Restart handoff encodes every registered
//! instance's listeners; graceful shutdown deregisters the instance.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Transport scheme of a listener, as encoded in the handoff map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

/// One live listener of a registered server instance.
#[derive(Debug, Clone)]
pub struct ListenerRecord {
    pub scheme: Scheme,
    /// The bound address, as reported by the socket.
    pub addr: String,
    /// Raw descriptor on unix; `-1` where descriptors are unavailable.
    pub fd: i32,
}

/// Name → listener records for every running server instance in the process.
///
/// Cheap to clone; all clones share state. Mutated only by administrative
/// operations (start, shutdown), never on the request path.
#[derive(Clone, Default)]
pub struct ServerRegistry {
    inner: Arc<Mutex<HashMap<String, Vec<ListenerRecord>>>>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) an instance's listener records.
    pub fn register(&self, name: &str, listeners: Vec<ListenerRecord>) {
        let mut map = self.inner.lock().expect("registry lock");
        if map.insert(name.to_owned(), listeners).is_some() {
            tracing::warn!(server = name, "replacing existing registry entry");
        }
    }

    /// Removes an instance; returns `true` if it was registered.
    pub fn deregister(&self, name: &str) -> bool {
        self.inner
            .lock()
            .expect("registry lock")
            .remove(name)
            .is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.lock().expect("registry lock").contains_key(name)
    }

    /// Snapshot of every instance's listeners, for handoff encoding.
    pub fn snapshot(&self) -> HashMap<String, Vec<ListenerRecord>> {
        self.inner.lock().expect("registry lock").clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("registry lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
