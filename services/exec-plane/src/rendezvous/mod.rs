//! Port rendezvous - dynamic port discovery among a group's tasks.
//!
//! Distributed training workloads bind dynamic ports and need to tell their
//! gang peers where to connect. One task publishes under a (group, port
//! name) key; every other task awaits that key. A key resolves exactly once
//! and answers all past and future waiters with the identical value.

mod http;

pub use http::{router, serve};

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use mlgrid_id::GroupId;

/// Key of one rendezvous entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RendezvousKey {
    pub group: GroupId,
    pub port_name: String,
}

impl std::fmt::Display for RendezvousKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.group, self.port_name)
    }
}

enum PortEntry {
    /// No value yet; senders for every blocked consumer.
    Awaiting(Vec<oneshot::Sender<u16>>),
    Resolved(u16),
}

/// Synchronizes port discovery. Entries are independently guarded by the
/// one map lock, which is never held across an await: waiting happens on a
/// per-caller channel registered under the lock.
#[derive(Default)]
pub struct PortRendezvous {
    entries: Mutex<HashMap<RendezvousKey, PortEntry>>,
}

impl PortRendezvous {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until `key` is resolved and returns its value. Returns `None`
    /// when the key is reset while waiting.
    pub async fn await_port(&self, key: RendezvousKey) -> Option<u16> {
        let rx = {
            let mut entries = self.entries.lock().unwrap();
            match entries.entry(key).or_insert_with(|| PortEntry::Awaiting(Vec::new())) {
                PortEntry::Resolved(value) => return Some(*value),
                PortEntry::Awaiting(waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    rx
                }
            }
        };
        rx.await.ok()
    }

    /// Resolves `key` to `value`, unblocking every queued waiter.
    ///
    /// At most one value is accepted per key; a second publish is a logged
    /// anomaly and leaves the value unchanged.
    pub fn publish(&self, key: RendezvousKey, value: u16) {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries
            .entry(key.clone())
            .or_insert_with(|| PortEntry::Awaiting(Vec::new()));
        match entry {
            PortEntry::Resolved(existing) => {
                warn!(
                    key = %key,
                    existing = *existing,
                    rejected = value,
                    "duplicate publish on resolved port, value unchanged"
                );
            }
            PortEntry::Awaiting(_) => {
                let PortEntry::Awaiting(waiters) =
                    std::mem::replace(entry, PortEntry::Resolved(value))
                else {
                    unreachable!()
                };
                debug!(key = %key, value, waiters = waiters.len(), "port resolved");
                for waiter in waiters {
                    let _ = waiter.send(value);
                }
            }
        }
    }

    /// Clears all state for `key`. Outstanding waiters are released empty.
    pub fn reset(&self, key: &RendezvousKey) {
        let removed = self.entries.lock().unwrap().remove(key);
        if removed.is_some() {
            debug!(key = %key, "rendezvous key reset");
        }
    }
}
