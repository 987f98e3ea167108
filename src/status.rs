//! Per-service readiness map.
//!
//! The runner flips a service to not-ready before its Initialize+Test pass and
//! back to ready only once both steps succeeded. The map itself belongs to the
//! caller (typically a UI mirroring instrument health), which can watch it for
//! changes:
//!
//! ```rust,ignore
//! let mut rx = session.status().subscribe();
//! tokio::spawn(async move {
//!     while rx.changed().await.is_ok() {
//!         render(&rx.borrow());
//!     }
//! });
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;

/// Snapshot of readiness, keyed by service name.
pub type StatusSnapshot = BTreeMap<String, bool>;

/// Observable readiness map.
#[derive(Debug, Clone)]
pub struct ComponentStatus {
    tx: Arc<watch::Sender<StatusSnapshot>>,
}

impl Default for ComponentStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl ComponentStatus {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(StatusSnapshot::new());
        Self { tx: Arc::new(tx) }
    }

    pub fn set_ready(&self, service: &str, ready: bool) {
        self.tx.send_modify(|map| {
            map.insert(service.to_string(), ready);
        });
    }

    /// `None` when the service has never been through Initialize+Test.
    pub fn is_ready(&self, service: &str) -> Option<bool> {
        self.tx.borrow().get(service).copied()
    }

    pub fn all_ready(&self) -> bool {
        self.tx.borrow().values().all(|ready| *ready)
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.tx.subscribe()
    }
}
