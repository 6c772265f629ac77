//! Typed observations emitted by the client engine.
//!
//! Listeners register a callback and get back an opaque token for explicit
//! unsubscription. Emission is synchronous within the emitting task;
//! callbacks receive a shared reference and must not block.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use wharf_protocol::Envelope;

/// What the engine reports to its host.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// A remote update was recorded against the active snapshot.
    UpdateStored {
        snapshot_id: String,
        update_id: String,
    },
    /// A snapshot became the active one (remote or locally created).
    SnapshotStored { snapshot_id: String },
    /// A pending local update came back stamped by the server.
    UpdateAcknowledged {
        snapshot_id: String,
        server_version: u64,
    },
    /// Decrypted presence payload from a peer.
    AwarenessUpdate { payload: Vec<u8> },
    /// A peer asked for our awareness state; the host should respond.
    AwarenessRequested,
    /// The engine wants this envelope sent to the server (periodic
    /// compaction snapshots).
    SendMessage { envelope: Envelope },
}

/// Token returned by [`EventObservers::on`]; pass to `off` to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback = Arc<dyn Fn(&ClientEvent) + Send + Sync>;

/// Subscription registry for [`ClientEvent`]s.
#[derive(Default)]
pub struct EventObservers {
    next_id: AtomicU64,
    listeners: Mutex<HashMap<u64, Callback>>,
}

impl EventObservers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, callback: impl Fn(&ClientEvent) + Send + Sync + 'static) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .unwrap()
            .insert(id, Arc::new(callback));
        SubscriptionId(id)
    }

    pub fn off(&self, id: SubscriptionId) {
        self.listeners.lock().unwrap().remove(&id.0);
    }

    pub fn emit(&self, event: &ClientEvent) {
        let callbacks: Vec<Callback> = self.listeners.lock().unwrap().values().cloned().collect();
        for callback in callbacks {
            callback(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_on_emit_off() {
        let observers = EventObservers::new();
        let count = Arc::new(AtomicUsize::new(0));

        let counted = count.clone();
        let id = observers.on(move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
        });

        observers.emit(&ClientEvent::AwarenessRequested);
        observers.emit(&ClientEvent::AwarenessRequested);
        assert_eq!(count.load(Ordering::SeqCst), 2);

        observers.off(id);
        observers.emit(&ClientEvent::AwarenessRequested);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_multiple_listeners() {
        let observers = EventObservers::new();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let counted = count.clone();
            observers.on(move |_| {
                counted.fetch_add(1, Ordering::SeqCst);
            });
        }
        observers.emit(&ClientEvent::AwarenessRequested);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
