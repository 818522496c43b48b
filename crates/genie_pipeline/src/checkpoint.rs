//! Human-confirmation barrier for composite runs.
//!
//! The gate holds at most one pending checkpoint: a step name plus the
//! sending half of a oneshot channel. The run awaits the receiving half; the
//! human-facing surface calls [`CheckpointGate::resolve_checkpoint`].

use crate::launch::LaunchStep;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CheckpointError {
    #[error("checkpoint '{pending}' is still pending; cannot wait at '{requested}'")]
    AlreadyPending {
        pending: LaunchStep,
        requested: LaunchStep,
    },
}

struct PendingCheckpoint {
    step: LaunchStep,
    responder: oneshot::Sender<bool>,
}

/// Single-slot checkpoint gate.
pub struct CheckpointGate {
    enabled: AtomicBool,
    slot: Mutex<Option<PendingCheckpoint>>,
}

impl CheckpointGate {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            slot: Mutex::new(None),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn lock_slot(&self) -> MutexGuard<'_, Option<PendingCheckpoint>> {
        // The slot is only ever swapped whole, so a poisoned guard is still consistent.
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Suspend until the pending checkpoint at `step` is resolved.
    ///
    /// Resolves to `true` immediately when checkpoints are disabled. Returns
    /// `AlreadyPending` if another wait has not been resolved yet. A gate
    /// dropped while waiting resolves to `false`.
    pub async fn wait_for_checkpoint(&self, step: LaunchStep) -> Result<bool, CheckpointError> {
        if !self.is_enabled() {
            debug!("Checkpoints disabled, passing {}", step);
            return Ok(true);
        }

        let receiver = {
            let mut slot = self.lock_slot();
            if let Some(pending) = slot.as_ref() {
                // A waiter that was dropped leaves a closed sender behind.
                if !pending.responder.is_closed() {
                    return Err(CheckpointError::AlreadyPending {
                        pending: pending.step,
                        requested: step,
                    });
                }
                warn!("Discarding abandoned checkpoint: {}", pending.step);
            }
            let (responder, receiver) = oneshot::channel();
            *slot = Some(PendingCheckpoint { step, responder });
            receiver
        };

        info!("Waiting for confirmation at checkpoint: {}", step);
        let proceed = receiver.await.unwrap_or(false);
        info!(
            "Checkpoint {} resolved: {}",
            step,
            if proceed { "continue" } else { "stop" }
        );
        Ok(proceed)
    }

    /// Answer the pending checkpoint.
    ///
    /// Returns true if a waiter was resumed. With nothing pending (including
    /// a checkpoint that was already resolved) this is a no-op returning false.
    pub fn resolve_checkpoint(&self, proceed: bool) -> bool {
        let pending = self.lock_slot().take();
        match pending {
            Some(pending) => pending.responder.send(proceed).is_ok(),
            None => {
                debug!("resolve_checkpoint({}) with nothing pending", proceed);
                false
            }
        }
    }

    /// Step currently awaiting confirmation, if any.
    pub fn pending_checkpoint(&self) -> Option<LaunchStep> {
        self.lock_slot()
            .as_ref()
            .filter(|p| !p.responder.is_closed())
            .map(|p| p.step)
    }
}

impl Default for CheckpointGate {
    fn default() -> Self {
        Self::new(true)
    }
}
