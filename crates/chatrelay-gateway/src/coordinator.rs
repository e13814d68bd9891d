use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chatrelay_common::ChatId;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

/// Upper bound on concurrently admitted units of work. Drain acquires all of
/// them at once.
const DRAIN_PERMITS: u32 = 1 << 20;

/// Per-chat mutual exclusion plus a drain barrier for graceful shutdown.
///
/// Each admitted unit of work holds one drain permit and the lock of its chat.
/// [`begin_drain`](Self::begin_drain) flips the stopping flag so new work is
/// turned away, and [`await_drain_complete`](Self::await_drain_complete)
/// returns once every admitted unit has released its permit.
pub struct ConcurrencyCoordinator {
    locks: DashMap<ChatId, Arc<Mutex<()>>>,
    stopping: AtomicBool,
    drain: Arc<Semaphore>,
}

/// Proof of admission. Dropping it releases the chat lock and the drain permit.
pub struct TurnGuard {
    _identity: OwnedMutexGuard<()>,
    _permit: OwnedSemaphorePermit,
}

impl Default for ConcurrencyCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ConcurrencyCoordinator {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
            stopping: AtomicBool::new(false),
            drain: Arc::new(Semaphore::new(DRAIN_PERMITS as usize)),
        }
    }

    /// Lock the chat identity. Locks are created on first use and kept for
    /// the lifetime of the process.
    pub async fn acquire_identity(&self, chat_id: ChatId) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(self.locks.entry(chat_id).or_default().value());
        lock.lock_owned().await
    }

    pub fn stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Admit one unit of work for `chat_id`, waiting for earlier work of the
    /// same chat to finish. Returns `None` once draining has begun.
    pub async fn admit(&self, chat_id: ChatId) -> Option<TurnGuard> {
        if self.stopping() {
            return None;
        }
        let permit = Arc::clone(&self.drain).acquire_owned().await.ok()?;
        let identity = self.acquire_identity(chat_id).await;

        // Work queued behind the chat lock while draining started is dropped.
        if self.stopping() {
            debug!("dropping queued work for chat {chat_id}: relay is stopping");
            return None;
        }

        Some(TurnGuard {
            _identity: identity,
            _permit: permit,
        })
    }

    pub fn begin_drain(&self) {
        if !self.stopping.swap(true, Ordering::SeqCst) {
            info!("drain started, rejecting new work");
        }
    }

    /// Wait until every admitted unit has finished, then close the barrier.
    pub async fn await_drain_complete(&self) {
        self.begin_drain();
        match self.drain.acquire_many(DRAIN_PERMITS).await {
            Ok(all) => {
                all.forget();
                self.drain.close();
                info!("drain complete");
            }
            Err(_) => debug!("drain barrier already closed"),
        }
    }

    /// Number of admitted units still holding a drain permit.
    pub fn in_flight(&self) -> usize {
        if self.drain.is_closed() {
            return 0;
        }
        DRAIN_PERMITS as usize - self.drain.available_permits()
    }
}
