//! Propagation queue: three lanes with at-least-once delivery
//!
//! - **primary**: entities whose own properties changed
//! - **secondary**: dependents needing a rebuild, collapsed by uuid
//! - **deferred**: failed attempts, each visible once its backoff elapses
//!
//! A received message stays in flight until it is acked. An unacked message
//! becomes visible again on its lane once the visibility timeout passes, so
//! a worker that dies mid-item never loses it.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tessera_core::{IndexMessage, QueueLane, StorageError, TesseraResult};
use tokio::time::Instant;
use uuid::Uuid;

/// A received message and the receipt needed to ack it.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub receipt: u64,
    pub lane: QueueLane,
    pub message: IndexMessage,
}

/// Waiting and in-flight counts for one lane.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LaneStatus {
    pub waiting: usize,
    pub in_flight: usize,
}

/// Per-lane counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub lanes: BTreeMap<QueueLane, LaneStatus>,
}

impl QueueStatus {
    pub fn lane(&self, lane: QueueLane) -> LaneStatus {
        self.lanes.get(&lane).copied().unwrap_or_default()
    }

    pub fn total_waiting(&self) -> usize {
        self.lanes.values().map(|s| s.waiting).sum()
    }

    pub fn total_in_flight(&self) -> usize {
        self.lanes.values().map(|s| s.in_flight).sum()
    }

    pub fn is_idle(&self) -> bool {
        self.total_waiting() == 0 && self.total_in_flight() == 0
    }
}

/// Queue backend carrying [`IndexMessage`]s between callers and workers.
#[async_trait]
pub trait IndexQueue: Send + Sync {
    /// Append messages to a lane. Returns how many were actually enqueued
    /// after collapsing duplicates.
    async fn send(&self, lane: QueueLane, messages: Vec<IndexMessage>) -> TesseraResult<usize>;

    /// Put a message on the deferred lane, invisible for `delay`.
    async fn send_deferred(&self, message: IndexMessage, delay: Duration) -> TesseraResult<()>;

    /// Take up to `max` visible messages: primary first, then secondary,
    /// then deferred messages whose delay has elapsed.
    async fn receive(&self, max: usize) -> TesseraResult<Vec<Delivery>>;

    /// Finish a delivery. Returns false if the receipt is unknown or expired.
    async fn ack(&self, receipt: u64) -> TesseraResult<bool>;

    /// Return a delivery to the front of its lane right away.
    async fn nack(&self, receipt: u64) -> TesseraResult<bool>;

    async fn status(&self) -> TesseraResult<QueueStatus>;

    /// Drop every waiting message on every lane. In-flight messages are
    /// left to their workers.
    async fn purge(&self) -> TesseraResult<usize>;
}

#[derive(Debug)]
struct InFlight {
    lane: QueueLane,
    message: IndexMessage,
    visible_at: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    primary: VecDeque<IndexMessage>,
    secondary: VecDeque<IndexMessage>,
    /// Uuids currently waiting on the secondary lane.
    secondary_waiting: HashSet<Uuid>,
    deferred: VecDeque<(Instant, IndexMessage)>,
    in_flight: HashMap<u64, InFlight>,
    next_receipt: u64,
}

impl QueueState {
    /// Returns whether the message was added rather than collapsed.
    fn push_secondary(&mut self, message: IndexMessage, front: bool) -> bool {
        if self.secondary_waiting.contains(&message.uuid) {
            if let Some(existing) = self.secondary.iter_mut().find(|m| m.uuid == message.uuid) {
                existing.sid = existing.sid.max(message.sid);
            }
            return false;
        }
        self.secondary_waiting.insert(message.uuid);
        if front {
            self.secondary.push_front(message);
        } else {
            self.secondary.push_back(message);
        }
        true
    }

    fn push(&mut self, lane: QueueLane, message: IndexMessage, front: bool, now: Instant) -> bool {
        match lane {
            QueueLane::Primary if front => self.primary.push_front(message),
            QueueLane::Primary => self.primary.push_back(message),
            QueueLane::Secondary => return self.push_secondary(message, front),
            QueueLane::Deferred if front => self.deferred.push_front((now, message)),
            QueueLane::Deferred => self.deferred.push_back((now, message)),
        }
        true
    }

    /// Move expired in-flight messages back onto their lanes.
    fn reclaim_expired(&mut self, now: Instant) {
        let expired: Vec<u64> = self
            .in_flight
            .iter()
            .filter(|(_, entry)| entry.visible_at <= now)
            .map(|(receipt, _)| *receipt)
            .collect();
        for receipt in expired {
            if let Some(entry) = self.in_flight.remove(&receipt) {
                tracing::debug!(
                    uuid = %entry.message.uuid,
                    lane = %entry.lane,
                    "Visibility timeout expired, redelivering"
                );
                self.push(entry.lane, entry.message, true, now);
            }
        }
    }

    fn pop_ready(&mut self, now: Instant) -> Option<(QueueLane, IndexMessage)> {
        if let Some(message) = self.primary.pop_front() {
            return Some((QueueLane::Primary, message));
        }
        if let Some(message) = self.secondary.pop_front() {
            self.secondary_waiting.remove(&message.uuid);
            return Some((QueueLane::Secondary, message));
        }
        let ready = self.deferred.iter().position(|(not_before, _)| *not_before <= now)?;
        self.deferred
            .remove(ready)
            .map(|(_, message)| (QueueLane::Deferred, message))
    }

    fn waiting(&self, lane: QueueLane) -> usize {
        match lane {
            QueueLane::Primary => self.primary.len(),
            QueueLane::Secondary => self.secondary.len(),
            QueueLane::Deferred => self.deferred.len(),
        }
    }
}

/// Process-local [`IndexQueue`].
#[derive(Debug)]
pub struct InMemoryIndexQueue {
    state: Mutex<QueueState>,
    visibility_timeout: Duration,
}

impl InMemoryIndexQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            visibility_timeout,
        }
    }

    /// Waiting messages on one lane, in delivery order.
    pub fn peek(&self, lane: QueueLane) -> TesseraResult<Vec<IndexMessage>> {
        let state = self.lock()?;
        Ok(match lane {
            QueueLane::Primary => state.primary.iter().cloned().collect(),
            QueueLane::Secondary => state.secondary.iter().cloned().collect(),
            QueueLane::Deferred => state.deferred.iter().map(|(_, m)| m.clone()).collect(),
        })
    }

    fn lock(&self) -> TesseraResult<MutexGuard<'_, QueueState>> {
        self.state
            .lock()
            .map_err(|_| StorageError::LockPoisoned.into())
    }
}

#[async_trait]
impl IndexQueue for InMemoryIndexQueue {
    async fn send(&self, lane: QueueLane, messages: Vec<IndexMessage>) -> TesseraResult<usize> {
        let now = Instant::now();
        let mut state = self.lock()?;
        let mut added = 0;
        for message in messages {
            if state.push(lane, message, false, now) {
                added += 1;
            }
        }
        tracing::trace!(lane = %lane, added, "Enqueued messages");
        Ok(added)
    }

    async fn send_deferred(&self, message: IndexMessage, delay: Duration) -> TesseraResult<()> {
        let not_before = Instant::now() + delay;
        self.lock()?.deferred.push_back((not_before, message));
        Ok(())
    }

    async fn receive(&self, max: usize) -> TesseraResult<Vec<Delivery>> {
        let now = Instant::now();
        let mut state = self.lock()?;
        state.reclaim_expired(now);

        let mut deliveries = Vec::new();
        while deliveries.len() < max {
            let Some((lane, message)) = state.pop_ready(now) else {
                break;
            };
            state.next_receipt += 1;
            let receipt = state.next_receipt;
            state.in_flight.insert(
                receipt,
                InFlight {
                    lane,
                    message: message.clone(),
                    visible_at: now + self.visibility_timeout,
                },
            );
            deliveries.push(Delivery {
                receipt,
                lane,
                message,
            });
        }
        Ok(deliveries)
    }

    async fn ack(&self, receipt: u64) -> TesseraResult<bool> {
        Ok(self.lock()?.in_flight.remove(&receipt).is_some())
    }

    async fn nack(&self, receipt: u64) -> TesseraResult<bool> {
        let now = Instant::now();
        let mut state = self.lock()?;
        match state.in_flight.remove(&receipt) {
            Some(entry) => {
                state.push(entry.lane, entry.message, true, now);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn status(&self) -> TesseraResult<QueueStatus> {
        let state = self.lock()?;
        let mut lanes: BTreeMap<QueueLane, LaneStatus> = QueueLane::ALL
            .iter()
            .map(|lane| {
                (
                    *lane,
                    LaneStatus {
                        waiting: state.waiting(*lane),
                        in_flight: 0,
                    },
                )
            })
            .collect();
        for entry in state.in_flight.values() {
            lanes.entry(entry.lane).or_default().in_flight += 1;
        }
        Ok(QueueStatus { lanes })
    }

    async fn purge(&self) -> TesseraResult<usize> {
        let mut state = self.lock()?;
        let dropped = state.primary.len() + state.secondary.len() + state.deferred.len();
        state.primary.clear();
        state.secondary.clear();
        state.secondary_waiting.clear();
        state.deferred.clear();
        tracing::info!(dropped, "Purged queue lanes");
        Ok(dropped)
    }
}
