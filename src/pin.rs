//! Session-scoped PIN challenge.
//!
//! A channel holds at most one outstanding request. A submitted PIN resolves
//! it exactly once; cancelling the channel rejects the request and every
//! later one, so nothing is left waiting after the owning session ends.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::debug;

use crate::error::PinError;

enum Slot {
    Idle,
    Waiting(oneshot::Sender<String>),
    Closed,
}

pub struct PinChannel {
    slot: Mutex<Slot>,
}

impl Default for PinChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl PinChannel {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot::Idle),
        }
    }

    /// Wait up to `limit` on a challenge from [`PinChannel::open`], deregistering it on expiry
    pub async fn await_challenge(&self, challenge: PinChallenge, limit: Duration) -> Result<String, PinError> {
        match tokio::time::timeout(limit, challenge.rx).await {
            Ok(Ok(pin)) => Ok(pin),
            Ok(Err(_)) => Err(PinError::Cancelled),
            Err(_) => {
                self.abandon();
                Err(PinError::TimedOut)
            }
        }
    }

    /// Register a challenge without waiting on it yet
    pub fn open(&self) -> Result<PinChallenge, PinError> {
        let mut slot = self.lock();
        let busy = match &*slot {
            Slot::Closed => return Err(PinError::Cancelled),
            Slot::Waiting(tx) => !tx.is_closed(),
            Slot::Idle => false,
        };
        if busy {
            return Err(PinError::AlreadyPending);
        }

        let (tx, rx) = oneshot::channel();
        *slot = Slot::Waiting(tx);
        debug!("pin requested");
        Ok(PinChallenge { rx })
    }

    /// Hand `pin` to the pending challenge. Returns false if nothing was waiting.
    pub fn submit(&self, pin: &str) -> bool {
        let mut slot = self.lock();
        match std::mem::replace(&mut *slot, Slot::Idle) {
            Slot::Waiting(tx) => tx.send(pin.to_string()).is_ok(),
            other => {
                *slot = other;
                false
            }
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(&*self.lock(), Slot::Waiting(tx) if !tx.is_closed())
    }

    /// Reject the pending challenge and refuse new ones
    pub fn cancel(&self) {
        let mut slot = self.lock();
        if matches!(&*slot, Slot::Waiting(_)) {
            debug!("pending pin request cancelled");
        }
        *slot = Slot::Closed;
    }

    fn abandon(&self) {
        let mut slot = self.lock();
        if matches!(&*slot, Slot::Waiting(_)) {
            *slot = Slot::Idle;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Slot> {
        // a poisoned slot still holds a consistent enum value
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// An outstanding PIN request
pub struct PinChallenge {
    rx: oneshot::Receiver<String>,
}
