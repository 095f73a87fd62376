use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::messages::LockedMessage;
use crate::domain::ports::{EnqueueError, MessageReceiver, MessageSender, QueueError};

/// A message held by the queue, visible or locked
#[derive(Debug, Clone)]
struct StoredMessage {
    message_id: String,
    sequence_number: i64,
    delivery_count: u32,
    body: Vec<u8>,
}

#[derive(Debug, Clone)]
struct Lock {
    token: String,
    locked_until: OffsetDateTime,
    message: StoredMessage,
}

#[derive(Debug, Default)]
struct QueueState {
    visible: VecDeque<StoredMessage>,
    /// Locked messages keyed by message id
    locked: HashMap<String, Lock>,
    next_sequence: i64,
    completed: usize,
}

/// In-process queue with peek-lock semantics.
///
/// Receiving locks a message for `lock_duration`; a lock that is not completed
/// in time makes the message visible again with a higher delivery count.
#[derive(Debug, Clone)]
pub struct InMemoryQueue {
    state: Arc<RwLock<QueueState>>,
    notify: Arc<Notify>,
    lock_duration: Duration,
    receive_wait: Duration,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::with_timings(Duration::from_secs(30), Duration::from_secs(1))
    }

    /// Queue with a custom lock duration and receive long-poll window
    pub fn with_timings(lock_duration: Duration, receive_wait: Duration) -> Self {
        Self {
            state: Arc::new(RwLock::new(QueueState::default())),
            notify: Arc::new(Notify::new()),
            lock_duration,
            receive_wait,
        }
    }

    /// Number of messages currently visible to receivers
    pub async fn visible_len(&self) -> usize {
        self.state.read().await.visible.len()
    }

    /// Number of messages currently locked by a receiver
    pub async fn locked_len(&self) -> usize {
        self.state.read().await.locked.len()
    }

    /// Number of messages removed through `complete`
    pub async fn completed_count(&self) -> usize {
        self.state.read().await.completed
    }

    pub async fn is_empty(&self) -> bool {
        let state = self.state.read().await;
        state.visible.is_empty() && state.locked.is_empty()
    }

    /// Expire every current lock, as if the lock duration had elapsed
    pub async fn expire_locks(&self) {
        let mut state = self.state.write().await;
        let expired: Vec<Lock> = state.locked.drain().map(|(_, lock)| lock).collect();
        let count = expired.len();
        for lock in expired {
            state.visible.push_back(lock.message);
        }
        drop(state);

        if count > 0 {
            info!(expired_count = count, "Expired message locks");
            self.notify.notify_waiters();
        }
    }

    fn release_expired(state: &mut QueueState, now: OffsetDateTime) {
        let expired: Vec<String> = state
            .locked
            .iter()
            .filter(|(_, lock)| lock.locked_until <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for id in expired {
            if let Some(lock) = state.locked.remove(&id) {
                debug!(message_id = %id, "Lock expired, message visible again");
                state.visible.push_back(lock.message);
            }
        }
    }

    async fn try_lock_next(&self) -> Option<LockedMessage> {
        let now = OffsetDateTime::now_utc();
        let mut state = self.state.write().await;
        Self::release_expired(&mut state, now);

        let mut message = state.visible.pop_front()?;
        message.delivery_count += 1;

        let lock = Lock {
            token: Uuid::new_v4().to_string(),
            locked_until: now + self.lock_duration,
            message: message.clone(),
        };

        let locked = LockedMessage::new(
            message.message_id.clone(),
            lock.token.clone(),
            message.delivery_count,
            message.body.clone(),
        )
        .with_sequence_number(message.sequence_number)
        .with_locked_until(lock.locked_until);

        debug!(
            message_id = %locked.message_id,
            delivery_count = locked.delivery_count,
            "Locked message"
        );
        state.locked.insert(message.message_id, lock);

        Some(locked)
    }

    /// Remove the lock for `message` if its token is still current
    async fn take_lock(&self, message: &LockedMessage) -> Result<Lock, QueueError> {
        let now = OffsetDateTime::now_utc();
        let mut state = self.state.write().await;
        Self::release_expired(&mut state, now);

        match state.locked.get(&message.message_id) {
            Some(lock) if lock.token == message.lock_token => {}
            _ => {
                return Err(QueueError::LockLost {
                    message_id: message.message_id.clone(),
                });
            }
        }

        state
            .locked
            .remove(&message.message_id)
            .ok_or_else(|| QueueError::LockLost {
                message_id: message.message_id.clone(),
            })
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageSender for InMemoryQueue {
    async fn send(&self, body: &[u8]) -> Result<(), EnqueueError> {
        let mut state = self.state.write().await;
        state.next_sequence += 1;

        let message = StoredMessage {
            message_id: Uuid::new_v4().to_string(),
            sequence_number: state.next_sequence,
            delivery_count: 0,
            body: body.to_vec(),
        };
        debug!(message_id = %message.message_id, "Enqueuing message");
        state.visible.push_back(message);
        drop(state);

        self.notify.notify_one();
        Ok(())
    }
}

#[async_trait]
impl MessageReceiver for InMemoryQueue {
    async fn receive(&self) -> Result<Option<LockedMessage>, QueueError> {
        let deadline = tokio::time::Instant::now() + self.receive_wait;

        loop {
            let notified = self.notify.notified();
            if let Some(message) = self.try_lock_next().await {
                return Ok(Some(message));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                // Locks may have expired while we waited
                return Ok(self.try_lock_next().await);
            }
        }
    }

    async fn complete(&self, message: &LockedMessage) -> Result<(), QueueError> {
        self.take_lock(message).await?;
        self.state.write().await.completed += 1;
        debug!(message_id = %message.message_id, "Completed message");
        Ok(())
    }

    async fn abandon(&self, message: &LockedMessage) -> Result<(), QueueError> {
        let lock = self.take_lock(message).await?;
        self.state.write().await.visible.push_back(lock.message);
        debug!(message_id = %message.message_id, "Abandoned message");
        self.notify.notify_one();
        Ok(())
    }
}
