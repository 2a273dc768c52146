//! Sync lifecycle events and the listener registry
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  EventBus                                                       │
//! │  ├── listeners: kind → ordered [(ListenerId, callback)]         │
//! │  │   └── called synchronously; a panicking listener is logged   │
//! │  │       and the remaining listeners still run                  │
//! │  └── tx: broadcast::Sender<SyncEvent>                           │
//! │      └── for async consumers that prefer a receiver             │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::error;

use crate::conflict::Conflict;
use crate::engine::SyncReport;
use crate::types::{ChangeId, ChangeRecord};

/// Default capacity for the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events emitted by the sync engine
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A cycle entered the syncing state
    SyncStarted,
    /// An upload batch finished
    SyncProgress {
        /// Records uploaded so far in this cycle
        uploaded: usize,
        /// Records scheduled for upload in this cycle
        total: usize,
    },
    /// Conflicts were found in this cycle
    SyncConflict { conflicts: Vec<Conflict> },
    /// A cycle ran to the end (fully or partially successful)
    SyncCompleted(SyncReport),
    /// A cycle aborted on an unexpected error
    SyncFailed { error: String },
    /// A change was recorded locally
    ChangeCreated(ChangeRecord),
    /// The remote service accepted a change
    ChangeSynced { id: ChangeId },
    /// The remote service rejected a change
    ChangeFailed { id: ChangeId, error: String },
}

impl SyncEvent {
    pub fn kind(&self) -> SyncEventKind {
        match self {
            SyncEvent::SyncStarted => SyncEventKind::SyncStart,
            SyncEvent::SyncProgress { .. } => SyncEventKind::SyncProgress,
            SyncEvent::SyncConflict { .. } => SyncEventKind::SyncConflict,
            SyncEvent::SyncCompleted(_) => SyncEventKind::SyncComplete,
            SyncEvent::SyncFailed { .. } => SyncEventKind::SyncError,
            SyncEvent::ChangeCreated(_) => SyncEventKind::ChangeCreated,
            SyncEvent::ChangeSynced { .. } => SyncEventKind::ChangeSynced,
            SyncEvent::ChangeFailed { .. } => SyncEventKind::ChangeFailed,
        }
    }
}

/// Discriminant of [`SyncEvent`], used as the subscription key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncEventKind {
    SyncStart,
    SyncProgress,
    SyncConflict,
    SyncComplete,
    SyncError,
    ChangeCreated,
    ChangeSynced,
    ChangeFailed,
}

impl SyncEventKind {
    pub const ALL: [SyncEventKind; 8] = [
        SyncEventKind::SyncStart,
        SyncEventKind::SyncProgress,
        SyncEventKind::SyncConflict,
        SyncEventKind::SyncComplete,
        SyncEventKind::SyncError,
        SyncEventKind::ChangeCreated,
        SyncEventKind::ChangeSynced,
        SyncEventKind::ChangeFailed,
    ];

    /// Wire name, e.g. `sync:start`
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncEventKind::SyncStart => "sync:start",
            SyncEventKind::SyncProgress => "sync:progress",
            SyncEventKind::SyncConflict => "sync:conflict",
            SyncEventKind::SyncComplete => "sync:complete",
            SyncEventKind::SyncError => "sync:error",
            SyncEventKind::ChangeCreated => "change:created",
            SyncEventKind::ChangeSynced => "change:synced",
            SyncEventKind::ChangeFailed => "change:failed",
        }
    }
}

impl fmt::Display for SyncEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Callback invoked for every event of the subscribed kind
pub type Listener = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

type ListenerId = u64;

#[derive(Default)]
struct Registry {
    listeners: RwLock<HashMap<SyncEventKind, Vec<(ListenerId, Listener)>>>,
}

impl Registry {
    fn remove(&self, kind: SyncEventKind, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let Some(entries) = listeners.get_mut(&kind) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        before != entries.len()
    }
}

/// Token returned by [`EventBus::on`].
///
/// Dropping it keeps the listener registered; call [`Subscription::unsubscribe`]
/// to remove it.
pub struct Subscription {
    kind: SyncEventKind,
    id: ListenerId,
    registry: Weak<Registry>,
}

impl Subscription {
    pub fn kind(&self) -> SyncEventKind {
        self.kind
    }

    /// Remove the listener. Returns `false` if it was already gone.
    pub fn unsubscribe(&self) -> bool {
        self.registry
            .upgrade()
            .is_some_and(|registry| registry.remove(self.kind, self.id))
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .finish()
    }
}

/// Typed publish/subscribe registry for [`SyncEvent`]s
pub struct EventBus {
    registry: Arc<Registry>,
    next_id: AtomicU64,
    event_tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            registry: Arc::new(Registry::default()),
            next_id: AtomicU64::new(1),
            event_tx,
        }
    }

    /// Register `listener` for events of `kind`.
    ///
    /// Listeners run synchronously on the emitting task, in registration order.
    pub fn on<F>(&self, kind: SyncEventKind, listener: F) -> Subscription
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry
            .listeners
            .write()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(listener)));

        Subscription {
            kind,
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Subscribe to every event through a broadcast receiver.
    ///
    /// Slow receivers lag and drop the oldest events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.event_tx.subscribe()
    }

    pub fn listener_count(&self, kind: SyncEventKind) -> usize {
        self.registry
            .listeners
            .read()
            .get(&kind)
            .map_or(0, Vec::len)
    }

    /// Remove every registered listener
    pub fn clear(&self) {
        self.registry.listeners.write().clear();
    }

    /// Deliver `event` to its listeners, then to broadcast receivers.
    ///
    /// Listeners are snapshotted first, so a listener may unsubscribe itself
    /// (or others) without deadlocking.
    pub fn emit(&self, event: SyncEvent) {
        let kind = event.kind();
        let listeners: Vec<Listener> = self
            .registry
            .listeners
            .read()
            .get(&kind)
            .map(|entries| entries.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default();

        for listener in listeners {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| listener(&event))) {
                error!(
                    event = kind.as_str(),
                    panic = panic_message(panic.as_ref()),
                    "Sync event listener panicked"
                );
            }
        }

        let _ = self.event_tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}
