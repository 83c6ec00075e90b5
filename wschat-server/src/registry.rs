use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use wschat_core::Envelope;

/// Maximum pending messages per id before the oldest are dropped
pub const DEFAULT_MAX_PENDING: usize = 1000;

pub type ConnectionId = u64;

/// The registry's end of one live connection. Envelopes pushed here are
/// written to the socket by that connection's task.
///
/// Deliberately not `Clone`: once the registry drops a handle, the
/// connection's receiver drains and then reports closed.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Delivered,
    Queued,
}

/// Live connection and backlog for one id, guarded together by the map shard.
#[derive(Debug, Default)]
struct Slot {
    live: Option<ConnectionHandle>,
    pending: VecDeque<Envelope>,
}

impl Slot {
    fn is_vacant(&self) -> bool {
        self.live.is_none() && self.pending.is_empty()
    }

    fn enforce_cap(&mut self, id: &str, max_pending: usize) {
        while self.pending.len() > max_pending {
            self.pending.pop_front();
            info!(user = %id, "Queue limit reached, dropped oldest message");
        }
    }
}

/// Server state: id -> live connection, id -> pending envelopes.
///
/// Each id's connection and queue sit in one map entry, so `register`,
/// `deregister`, `route` and `requeue` on the same id serialize on that
/// entry's shard lock while unrelated ids proceed in parallel.
pub struct RelayRegistry {
    slots: DashMap<String, Slot>,
    max_pending: usize,
    next_connection: AtomicU64,
}

impl RelayRegistry {
    pub fn new() -> Self {
        Self::with_max_pending(DEFAULT_MAX_PENDING)
    }

    pub fn with_max_pending(max_pending: usize) -> Self {
        Self {
            slots: DashMap::new(),
            max_pending: max_pending.max(1),
            next_connection: AtomicU64::new(1),
        }
    }

    /// Create the channel pair for a newly accepted connection.
    pub fn open_connection(&self) -> (ConnectionHandle, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        (ConnectionHandle { id, tx }, rx)
    }

    /// Make `handle` the live connection for `id`, superseding any earlier
    /// one, and hand back everything queued for `id` in arrival order.
    ///
    /// The caller must write the returned envelopes before anything it
    /// receives on the handle's channel.
    pub fn register(&self, id: &str, handle: ConnectionHandle) -> Vec<Envelope> {
        let mut slot = self.slots.entry(id.to_string()).or_default();
        let connection = handle.id;
        if let Some(previous) = slot.live.replace(handle) {
            info!(
                user = %id,
                previous = previous.id,
                current = connection,
                "Superseding earlier connection"
            );
        }
        slot.pending.drain(..).collect()
    }

    /// Remove the live entry for `id` if it still belongs to `connection`.
    /// A stale handler racing a reconnect leaves the newer entry alone.
    pub fn deregister(&self, id: &str, connection: ConnectionId) -> bool {
        let removed = match self.slots.get_mut(id) {
            Some(mut slot) if slot.live.as_ref().is_some_and(|h| h.id == connection) => {
                slot.live = None;
                true
            }
            _ => false,
        };

        if removed {
            self.slots.remove_if(id, |_, slot| slot.is_vacant());
            debug!(user = %id, connection, "Deregistered");
        }
        removed
    }

    /// Deliver to the target's live connection, or queue for later.
    pub fn route(&self, envelope: Envelope) -> RouteOutcome {
        let target = envelope.target_id.clone();
        let mut slot = self.slots.entry(target.clone()).or_default();

        let envelope = match slot.live.as_ref() {
            Some(handle) => match handle.tx.send(envelope) {
                Ok(()) => return RouteOutcome::Delivered,
                Err(mpsc::error::SendError(envelope)) => {
                    warn!(user = %target, "Live connection is gone, queueing instead");
                    slot.live = None;
                    envelope
                }
            },
            None => envelope,
        };

        slot.pending.push_back(envelope);
        slot.enforce_cap(&target, self.max_pending);
        debug!(user = %target, pending = slot.pending.len(), "Queued message for offline user");
        RouteOutcome::Queued
    }

    /// Return envelopes a torn-down connection accepted but never wrote.
    ///
    /// They go to a newer live connection if one exists, otherwise back to
    /// the front of the queue ahead of anything that arrived since.
    pub fn requeue(&self, id: &str, envelopes: Vec<Envelope>) {
        if envelopes.is_empty() {
            return;
        }
        let mut slot = self.slots.entry(id.to_string()).or_default();
        self.requeue_locked(id, &mut slot, envelopes);
    }

    /// Deregister `connection` and requeue what it never wrote, under one
    /// entry lock so a reconnect cannot flush ahead of the leftovers.
    pub fn retire(&self, id: &str, connection: ConnectionId, undelivered: Vec<Envelope>) -> bool {
        let was_live = {
            let mut slot = self.slots.entry(id.to_string()).or_default();
            let was_live = slot.live.as_ref().is_some_and(|h| h.id == connection);
            if was_live {
                slot.live = None;
            }
            self.requeue_locked(id, &mut slot, undelivered);
            was_live
        };

        self.slots.remove_if(id, |_, slot| slot.is_vacant());
        if was_live {
            debug!(user = %id, connection, "Deregistered");
        }
        was_live
    }

    fn requeue_locked(&self, id: &str, slot: &mut Slot, envelopes: Vec<Envelope>) {
        if envelopes.is_empty() {
            return;
        }
        let count = envelopes.len();
        let mut undelivered: VecDeque<Envelope> = envelopes.into();

        if let Some(handle) = slot.live.as_ref() {
            while let Some(envelope) = undelivered.pop_front() {
                if let Err(mpsc::error::SendError(envelope)) = handle.tx.send(envelope) {
                    undelivered.push_front(envelope);
                    break;
                }
            }
        }
        if undelivered.is_empty() {
            debug!(user = %id, count, "Handed undelivered messages to newer connection");
            return;
        }
        if slot.live.as_ref().is_some_and(|h| h.tx.is_closed()) {
            slot.live = None;
        }

        while let Some(envelope) = undelivered.pop_back() {
            slot.pending.push_front(envelope);
        }
        slot.enforce_cap(id, self.max_pending);
        info!(user = %id, count, "Requeued undelivered messages");
    }

    pub fn is_online(&self, id: &str) -> bool {
        self.slots
            .get(id)
            .map(|slot| slot.live.is_some())
            .unwrap_or(false)
    }

    pub fn pending_count(&self, id: &str) -> usize {
        self.slots
            .get(id)
            .map(|slot| slot.pending.len())
            .unwrap_or(0)
    }

    pub fn online_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.live.is_some()).count()
    }

    pub fn max_pending(&self) -> usize {
        self.max_pending
    }
}

impl Default for RelayRegistry {
    fn default() -> Self {
        Self::new()
    }
}
