//! Gate control - directional commands keyed by slot
//!
//! `actuate` is fire-and-forget: the command is queued for the gate worker
//! and the caller never waits on the serial link. A failed send does not
//! undo whatever slot change triggered it.

use crate::domain::types::{GateAction, SlotNumber};
use crate::infra::metrics::Metrics;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GateError {
    #[error("gate command queue is full")]
    QueueFull,

    #[error("gate worker has stopped")]
    ChannelClosed,
}

/// A gate command to be written by the worker
#[derive(Debug, Clone)]
pub struct GateCommand {
    pub slot: SlotNumber,
    pub action: GateAction,
    /// When the command was enqueued (for queue delay measurement)
    pub enqueued_at: Instant,
}

impl GateCommand {
    pub fn new(slot: SlotNumber, action: GateAction) -> Self {
        Self { slot, action, enqueued_at: Instant::now() }
    }

    /// Wire form: `<slot_number>:<ACTION>\n`
    pub fn encode(&self) -> String {
        encode_command(self.slot, self.action)
    }
}

pub fn encode_command(slot: SlotNumber, action: GateAction) -> String {
    format!("{}:{}\n", slot, action.as_str())
}

/// Handle used by the allocator to actuate the gate
#[derive(Clone)]
pub struct GateController {
    cmd_tx: mpsc::Sender<GateCommand>,
    metrics: Arc<Metrics>,
}

impl GateController {
    pub fn new(cmd_tx: mpsc::Sender<GateCommand>, metrics: Arc<Metrics>) -> Self {
        Self { cmd_tx, metrics }
    }

    /// Queue one directional command for `slot`. Never blocks.
    pub fn actuate(&self, slot: SlotNumber, action: GateAction) -> Result<(), GateError> {
        match self.cmd_tx.try_send(GateCommand::new(slot, action)) {
            Ok(()) => {
                debug!(slot = %slot, action = %action, "gate_command_queued");
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                self.metrics.record_gate_failure();
                warn!(slot = %slot, action = %action, "gate_command_dropped_queue_full");
                Err(GateError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => {
                self.metrics.record_gate_failure();
                warn!(slot = %slot, action = %action, "gate_command_dropped_worker_stopped");
                Err(GateError::ChannelClosed)
            }
        }
    }
}
