//! In-process broker with priorities, per-message TTL and dead-lettering.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{self, AtomicU64};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Broker, Delivery, PublishOptions};
use crate::{SchedulerError, SchedulerResult};

#[derive(Debug, Clone)]
struct Message {
    seq: u64,
    priority: u8,
    body: Vec<u8>,
    expire_at: Option<Instant>,
}

impl Message {
    fn is_expired(&self, now: Instant) -> bool {
        self.expire_at.is_some_and(|at| at <= now)
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for Message {}

// Max-heap order: higher priority first, then publish order.
impl Ord for Message {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Message {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct QueueState {
    ready: BinaryHeap<Message>,
    unacked: HashMap<u64, Message>,
    dead_letter: Option<String>,
}

#[derive(Debug, Default)]
struct Inner {
    queues: Mutex<HashMap<String, QueueState>>,
    seq: AtomicU64,
    tags: AtomicU64,
    /// Signalled whenever a queue gains messages or disappears.
    changed: Notify,
    /// Signalled when a message with a TTL is published.
    reaper_wake: Notify,
}

enum Pop {
    Ready(Delivery),
    Empty,
    Gone,
}

impl Inner {
    fn pop(&self, queue: &str) -> Pop {
        let mut queues = self.queues.lock();
        let now = Instant::now();
        let Some(state) = queues.get_mut(queue) else {
            return Pop::Gone;
        };

        let mut expired = Vec::new();
        let mut found = None;
        while let Some(msg) = state.ready.pop() {
            if msg.is_expired(now) {
                expired.push(msg);
            } else {
                found = Some(msg);
                break;
            }
        }

        let dead_letter = state.dead_letter.clone();
        let delivery = found.map(|msg| {
            let tag = self.tags.fetch_add(1, atomic::Ordering::Relaxed) + 1;
            let delivery = Delivery {
                tag,
                queue: queue.to_string(),
                body: msg.body.clone(),
                priority: msg.priority,
            };
            state.unacked.insert(tag, msg);
            delivery
        });

        if self.dead_letter(&mut queues, queue, dead_letter.as_deref(), expired) {
            self.changed.notify_waiters();
        }

        match delivery {
            Some(delivery) => Pop::Ready(delivery),
            None => Pop::Empty,
        }
    }

    /// Move expired messages of every queue to their dead-letter queues.
    /// Returns the earliest remaining expiry.
    fn reap(&self) -> Option<Instant> {
        let mut queues = self.queues.lock();
        let now = Instant::now();
        let mut moves = Vec::new();
        let mut next: Option<Instant> = None;

        for (name, state) in queues.iter_mut() {
            if state.ready.iter().any(|m| m.is_expired(now)) {
                let (expired, keep): (Vec<_>, Vec<_>) = std::mem::take(&mut state.ready)
                    .into_vec()
                    .into_iter()
                    .partition(|m| m.is_expired(now));
                state.ready = BinaryHeap::from(keep);
                moves.push((name.clone(), state.dead_letter.clone(), expired));
            }
            for at in state.ready.iter().filter_map(|m| m.expire_at) {
                next = Some(next.map_or(at, |n| n.min(at)));
            }
        }

        let mut moved = false;
        for (from, dead_letter, expired) in moves {
            moved |= self.dead_letter(&mut queues, &from, dead_letter.as_deref(), expired);
        }
        if moved {
            self.changed.notify_waiters();
        }
        next
    }

    fn dead_letter(
        &self,
        queues: &mut HashMap<String, QueueState>,
        from: &str,
        dead_letter: Option<&str>,
        expired: Vec<Message>,
    ) -> bool {
        if expired.is_empty() {
            return false;
        }

        match dead_letter.and_then(|name| queues.get_mut(name)) {
            Some(target) => {
                debug!(queue = %from, count = expired.len(), "Dead-lettering expired messages");
                for mut msg in expired {
                    msg.expire_at = None;
                    target.ready.push(msg);
                }
                true
            }
            None => {
                warn!(queue = %from, count = expired.len(), "Dropping expired messages without a dead-letter queue");
                false
            }
        }
    }
}

async fn run_reaper(inner: Arc<Inner>, shutdown: CancellationToken) {
    loop {
        let next = inner.reap();
        let expiry = async {
            match next {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = inner.reaper_wake.notified() => {}
            _ = expiry => {}
        }
    }
}

/// Broker kept entirely in process memory.
///
/// One reaper task dead-letters expired messages for all queues; consumers
/// also dead-letter expired messages they reach first.
#[derive(Debug)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
    shutdown: CancellationToken,
}

impl MemoryBroker {
    /// Create a broker and start its reaper. Must be called within a Tokio runtime.
    pub fn new() -> Self {
        let inner = Arc::new(Inner::default());
        let shutdown = CancellationToken::new();
        tokio::spawn(run_reaper(inner.clone(), shutdown.clone()));
        Self { inner, shutdown }
    }

    /// Number of messages waiting for delivery.
    pub fn ready_count(&self, queue: &str) -> usize {
        self.inner
            .queues
            .lock()
            .get(queue)
            .map_or(0, |state| state.ready.len())
    }

    pub fn unacked_count(&self, queue: &str) -> usize {
        self.inner
            .queues
            .lock()
            .get(queue)
            .map_or(0, |state| state.unacked.len())
    }

    pub fn exists(&self, queue: &str) -> bool {
        self.inner.queues.lock().contains_key(queue)
    }
}

impl Drop for MemoryBroker {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare(&self, queue: &str, dead_letter: Option<&str>) -> SchedulerResult<()> {
        let mut queues = self.inner.queues.lock();
        let state = queues.entry(queue.to_string()).or_default();
        state.dead_letter = dead_letter.map(str::to_string);
        Ok(())
    }

    async fn delete(&self, queue: &str) -> SchedulerResult<u64> {
        let removed = self.inner.queues.lock().remove(queue);
        self.inner.changed.notify_waiters();
        Ok(removed.map_or(0, |state| (state.ready.len() + state.unacked.len()) as u64))
    }

    async fn publish(
        &self,
        queue: &str,
        body: Vec<u8>,
        options: PublishOptions,
    ) -> SchedulerResult<()> {
        {
            let mut queues = self.inner.queues.lock();
            let state = queues
                .get_mut(queue)
                .ok_or_else(|| SchedulerError::Queue(format!("queue {} is not declared", queue)))?;
            state.ready.push(Message {
                seq: self.inner.seq.fetch_add(1, atomic::Ordering::Relaxed),
                priority: options.priority,
                body,
                // A TTL past the clock's range never expires.
                expire_at: options.ttl.and_then(|ttl| Instant::now().checked_add(ttl)),
            });
        }

        self.inner.changed.notify_waiters();
        if options.ttl.is_some() {
            self.inner.reaper_wake.notify_one();
        }
        Ok(())
    }

    async fn consume(&self, queue: &str) -> SchedulerResult<Option<Delivery>> {
        loop {
            // Registered before checking so a concurrent publish cannot be missed.
            let changed = self.inner.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            match self.inner.pop(queue) {
                Pop::Ready(delivery) => return Ok(Some(delivery)),
                Pop::Gone => return Ok(None),
                Pop::Empty => changed.await,
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> SchedulerResult<()> {
        if let Some(state) = self.inner.queues.lock().get_mut(&delivery.queue) {
            state.unacked.remove(&delivery.tag);
        }
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> SchedulerResult<()> {
        let mut requeued = false;
        if let Some(state) = self.inner.queues.lock().get_mut(&delivery.queue) {
            if let Some(msg) = state.unacked.remove(&delivery.tag) {
                if requeue {
                    state.ready.push(msg);
                    requeued = true;
                }
            }
        }
        if requeued {
            self.inner.changed.notify_waiters();
        }
        Ok(())
    }

    async fn recover(&self, queue: &str) -> SchedulerResult<u64> {
        let count = {
            let mut queues = self.inner.queues.lock();
            let Some(state) = queues.get_mut(queue) else {
                return Ok(0);
            };
            let pending: Vec<Message> = state.unacked.drain().map(|(_, msg)| msg).collect();
            let count = pending.len() as u64;
            state.ready.extend(pending);
            count
        };
        if count > 0 {
            self.inner.changed.notify_waiters();
        }
        Ok(count)
    }
}
