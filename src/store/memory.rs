//! In-process feedback store.
//!
//! Each key owns a `watch` slot holding `Option<Bytes>`. Waiters subscribe
//! to the slot and wake on the first write; a slot that holds no value and
//! has no waiters is removed, so abandoned waits leave nothing behind.

use super::FeedbackStore;
use crate::error::{PipelineError, PipelineResult};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::trace;

type Slots = Arc<Mutex<HashMap<String, watch::Sender<Option<Bytes>>>>>;

#[derive(Debug, Clone, Default)]
pub struct MemoryFeedbackStore {
    slots: Slots,
}

/// Registered interest in one key. Dropping it prunes the slot if nothing else needs it.
struct Waiter {
    slots: Slots,
    key: String,
    rx: Option<watch::Receiver<Option<Bytes>>>,
}

impl Waiter {
    fn register(slots: &Slots, key: &str) -> Self {
        let rx = slots
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| watch::channel(None).0)
            .subscribe();
        Self {
            slots: slots.clone(),
            key: key.to_string(),
            rx: Some(rx),
        }
    }

    /// Wait until the slot holds a value or `deadline` passes.
    async fn wait_until(&mut self, deadline: Instant) -> bool {
        let Some(rx) = self.rx.as_mut() else {
            return false;
        };
        matches!(
            tokio::time::timeout_at(deadline, rx.wait_for(Option::is_some)).await,
            Ok(Ok(_))
        )
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.rx.take();
        let mut slots = self.slots.lock();
        let prune = slots
            .get(&self.key)
            .map(|slot| slot.receiver_count() == 0 && slot.borrow().is_none())
            .unwrap_or(false);
        if prune {
            slots.remove(&self.key);
        }
    }
}

impl MemoryFeedbackStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently holding a value
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|slot| slot.borrow().is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of retrievals currently blocked across all keys
    pub fn pending_waiters(&self) -> usize {
        self.slots
            .lock()
            .values()
            .map(|slot| slot.receiver_count())
            .sum()
    }

    /// Put `value` back unless a newer value arrived meanwhile.
    pub(crate) fn restore(&self, key: &str, value: Bytes) {
        let mut slots = self.slots.lock();
        let slot = slots
            .entry(key.to_string())
            .or_insert_with(|| watch::channel(None).0);
        if slot.borrow().is_none() {
            slot.send_replace(Some(value));
        }
    }

    fn not_found(key: &str) -> PipelineError {
        PipelineError::NotFound {
            key: key.to_string(),
        }
    }
}

#[async_trait]
impl FeedbackStore for MemoryFeedbackStore {
    async fn put(&self, key: &str, value: Bytes) -> PipelineResult<()> {
        trace!(key, bytes = value.len(), "MemoryFeedbackStore::put");
        self.slots
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| watch::channel(None).0)
            .send_replace(Some(value));
        Ok(())
    }

    async fn get(&self, key: &str, timeout: Duration) -> PipelineResult<Bytes> {
        let deadline = Instant::now() + timeout;
        let mut waiter = Waiter::register(&self.slots, key);
        if !waiter.wait_until(deadline).await {
            return Err(Self::not_found(key));
        }
        waiter
            .rx
            .as_ref()
            .and_then(|rx| rx.borrow().clone())
            .ok_or_else(|| Self::not_found(key))
    }

    async fn take(&self, key: &str, timeout: Duration) -> PipelineResult<Bytes> {
        let deadline = Instant::now() + timeout;
        let mut waiter = Waiter::register(&self.slots, key);
        loop {
            if !waiter.wait_until(deadline).await {
                return Err(Self::not_found(key));
            }
            // Another taker may have won the race between wake-up and lock.
            let taken = self.slots.lock().get(key).and_then(|slot| {
                if slot.borrow().is_some() {
                    slot.send_replace(None)
                } else {
                    None
                }
            });
            if let Some(value) = taken {
                return Ok(value);
            }
        }
    }

    async fn remove(&self, key: &str) -> PipelineResult<bool> {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get(key) else {
            return Ok(false);
        };
        let had_value = slot.borrow().is_some();
        if slot.receiver_count() == 0 {
            slots.remove(key);
        } else if had_value {
            slot.send_replace(None);
        }
        Ok(had_value)
    }
}
