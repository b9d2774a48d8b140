//! In-memory publish/subscribe hub for policy change events.
//!
//! One hub per process. Every mutation to the published policy set goes
//! through [`PolicyHub::publish`], which stamps a strictly increasing
//! revision, appends to a bounded ring buffer, and fans the event out to
//! every subscriber queue with a non-blocking send. A stalled subscriber
//! loses events (logged) instead of back-pressuring publishers; the stream
//! server's delta/snapshot recovery covers the gap on reconnect.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use bor_domain::model::Policy;
use bor_protocol::UpdateKind;

/// Capacity of each subscriber queue.
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 64;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One hub event. A snapshot kind without a payload is the resync
/// sentinel: recipients must produce a fresh full snapshot for their
/// client.
#[derive(Debug, Clone)]
pub struct HubEvent {
    pub kind: UpdateKind,
    pub policy: Option<Arc<Policy>>,
    pub revision: u64,
}

impl HubEvent {
    /// Is this the resync sentinel?
    pub fn is_resync(&self) -> bool {
        self.kind == UpdateKind::Snapshot && self.policy.is_none()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Hub
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct HubInner {
    revision: u64,
    log: VecDeque<HubEvent>,
    capacity: usize,
    subscribers: HashMap<u64, mpsc::Sender<HubEvent>>,
    /// Most recent subscriber per client identity, for targeted dispatch.
    by_client: HashMap<String, u64>,
    next_subscriber_id: u64,
}

/// Process-wide policy event hub.
pub struct PolicyHub {
    inner: RwLock<HubInner>,
}

impl PolicyHub {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(HubInner {
                revision: 0,
                log: VecDeque::new(),
                capacity: capacity.max(2),
                subscribers: HashMap::new(),
                by_client: HashMap::new(),
                next_subscriber_id: 0,
            }),
        })
    }

    /// Current revision. Starts at zero and never decreases while the
    /// process runs.
    pub fn revision(&self) -> u64 {
        self.inner.read().revision
    }

    /// Publish a policy change event to every subscriber.
    pub fn publish(&self, kind: UpdateKind, policy: Option<Arc<Policy>>) -> u64 {
        let (event, senders) = {
            let mut inner = self.inner.write();
            inner.revision += 1;
            let event = HubEvent {
                kind,
                policy,
                revision: inner.revision,
            };
            inner.log.push_back(event.clone());
            if inner.log.len() > inner.capacity {
                // Overflow: drop the older half in one operation.
                let keep = inner.capacity.div_ceil(2);
                let drop_count = inner.log.len() - keep;
                inner.log.drain(..drop_count);
                tracing::debug!(dropped = drop_count, "event log compacted");
            }
            let senders: Vec<(u64, mpsc::Sender<HubEvent>)> = inner
                .subscribers
                .iter()
                .map(|(id, tx)| (*id, tx.clone()))
                .collect();
            (event, senders)
        };

        // Fan out without holding the lock; a full queue drops the event
        // for that subscriber only.
        for (id, tx) in senders {
            if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(event.clone()) {
                tracing::warn!(
                    subscriber = id,
                    revision = event.revision,
                    "subscriber queue full, dropping event"
                );
            }
        }
        event.revision
    }

    /// Publish the resync sentinel. Used when bindings or group
    /// memberships change: such changes alter per-client applicable sets
    /// in ways the event log cannot express, so subscribers re-snapshot.
    pub fn publish_resync(&self) -> u64 {
        self.publish(UpdateKind::Snapshot, None)
    }

    /// Events strictly after `known_revision`, in order.
    ///
    /// Returns an empty list when the caller is already current and `None`
    /// when the delta is no longer available (evicted), signalling a full
    /// snapshot instead.
    pub fn events_since(&self, known_revision: u64) -> Option<Vec<HubEvent>> {
        let inner = self.inner.read();
        if known_revision >= inner.revision {
            return Some(Vec::new());
        }
        match inner.log.front() {
            None => None,
            Some(first) if first.revision > known_revision + 1 => None,
            _ => Some(
                inner
                    .log
                    .iter()
                    .filter(|e| e.revision > known_revision)
                    .cloned()
                    .collect(),
            ),
        }
    }

    /// Decide how to bring a connecting client from `last_known_revision`
    /// up to date.
    ///
    /// Zero means first connect and a value ahead of us means the server
    /// restarted since the client last synced; both get a snapshot. A
    /// delta containing the resync sentinel is useless to replay (it
    /// stands for "your applicable set changed"), so it degrades to a
    /// snapshot as well.
    pub fn plan_initial_sync(&self, last_known_revision: u64) -> InitialSync {
        let current = self.revision();
        if last_known_revision == 0 || last_known_revision > current {
            return InitialSync::Snapshot;
        }
        if last_known_revision == current {
            return InitialSync::UpToDate;
        }
        match self.events_since(last_known_revision) {
            Some(events) if !events.iter().any(HubEvent::is_resync) => {
                InitialSync::Delta(events)
            }
            _ => InitialSync::Snapshot,
        }
    }

    /// Register a subscriber queue. A non-empty `client_id` also records
    /// the queue as that client's current one for targeted dispatch,
    /// replacing any previous entry (reconnect).
    pub fn subscribe(self: &Arc<Self>, client_id: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        let id = {
            let mut inner = self.inner.write();
            let id = inner.next_subscriber_id;
            inner.next_subscriber_id += 1;
            inner.subscribers.insert(id, tx);
            if !client_id.is_empty() {
                inner.by_client.insert(client_id.to_owned(), id);
            }
            id
        };
        Subscription {
            id,
            client_id: client_id.to_owned(),
            hub: Arc::clone(self),
            rx,
        }
    }

    /// Send a targeted metadata-request event to one client's queue.
    /// Returns whether the client was connected and the send succeeded.
    pub fn send_metadata_refresh(&self, client_id: &str) -> bool {
        let inner = self.inner.read();
        let Some(id) = inner.by_client.get(client_id) else {
            return false;
        };
        let Some(tx) = inner.subscribers.get(id) else {
            return false;
        };
        let event = HubEvent {
            kind: UpdateKind::MetadataRequest,
            policy: None,
            revision: inner.revision,
        };
        tx.try_send(event).is_ok()
    }

    fn unsubscribe(&self, id: u64, client_id: &str) {
        let mut inner = self.inner.write();
        inner.subscribers.remove(&id);
        // Only drop the per-client entry if it still points at this queue;
        // a reconnect may already have installed its own.
        if !client_id.is_empty() && inner.by_client.get(client_id) == Some(&id) {
            inner.by_client.remove(client_id);
        }
    }

    #[cfg(test)]
    fn log_len(&self) -> usize {
        self.inner.read().log.len()
    }
}

/// How to synchronise a connecting client.
#[derive(Debug)]
pub enum InitialSync {
    /// Send the full applicable set.
    Snapshot,
    /// Replay these events in order.
    Delta(Vec<HubEvent>),
    /// Nothing to send.
    UpToDate,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Subscription
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A live subscriber queue; unsubscribes on drop.
pub struct Subscription {
    id: u64,
    client_id: String,
    hub: Arc<PolicyHub>,
    pub rx: mpsc::Receiver<HubEvent>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.id, &self.client_id);
    }
}
