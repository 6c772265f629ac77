//! In-process telemetry bus.
//!
//! A typed publish/subscribe surface for message and connection events,
//! consumed by devtools-style observers. Emission is synchronous in the
//! producing task; subscribers get shared references and must not mutate
//! or block. A bounded ring buffer keeps the most recent events so a
//! late-attaching observer can backfill.
//!
//! The bus is plain data owned by the server — one owner constructs it and
//! hands references to subsystems; no global singleton.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use wharf_protocol::Envelope;

use crate::connection::ConnectionId;

/// Events published by the dispatcher.
#[derive(Debug, Clone)]
pub enum TelemetryEvent {
    ReceivedMessage {
        connection: ConnectionId,
        document_id: String,
        envelope: Envelope,
    },
    SentMessage {
        connection: ConnectionId,
        document_id: String,
        envelope: Envelope,
    },
    Connected {
        connection: ConnectionId,
    },
    Disconnected {
        connection: ConnectionId,
    },
    /// Periodic coarse state: how much the server is holding.
    StateUpdate {
        documents: usize,
        connections: usize,
    },
    DocumentLoaded {
        document_id: String,
    },
    DocumentUnloaded {
        document_id: String,
    },
    /// A frame was dropped or a connection-level failure occurred.
    Error {
        connection: Option<ConnectionId>,
        reason: String,
    },
}

/// Token for unsubscribing a telemetry listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&TelemetryEvent) + Send + Sync>;

/// Publish/subscribe bus with a bounded replay buffer.
pub struct TelemetryBus {
    capacity: usize,
    next_id: AtomicU64,
    listeners: Mutex<HashMap<u64, Listener>>,
    recent: Mutex<VecDeque<TelemetryEvent>>,
}

impl TelemetryBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next_id: AtomicU64::new(0),
            listeners: Mutex::new(HashMap::new()),
            recent: Mutex::new(VecDeque::new()),
        }
    }

    pub fn subscribe(
        &self,
        listener: impl Fn(&TelemetryEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .unwrap()
            .insert(id, Arc::new(listener));
        ListenerId(id)
    }

    pub fn unsubscribe(&self, id: ListenerId) {
        self.listeners.lock().unwrap().remove(&id.0);
    }

    pub fn publish(&self, event: TelemetryEvent) {
        {
            let mut recent = self.recent.lock().unwrap();
            if recent.len() == self.capacity {
                recent.pop_front();
            }
            recent.push_back(event.clone());
        }
        let listeners: Vec<Listener> = self.listeners.lock().unwrap().values().cloned().collect();
        for listener in listeners {
            listener(&event);
        }
    }

    /// Snapshot of the most recent events, oldest first.
    pub fn recent(&self) -> Vec<TelemetryEvent> {
        self.recent.lock().unwrap().iter().cloned().collect()
    }
}
