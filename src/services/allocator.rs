//! Slot allocation actor
//!
//! The allocator task is the single writer of the slot table. Camera workers
//! and the operator never touch the store; they send messages on one
//! unbounded FIFO which the allocator drains in arrival order:
//! - `Match` - a camera saw a registered plate
//! - `Release` - the operator frees a slot
//!
//! Per-slot state machine:
//! - `Empty --assign(p)--> Occupied(p)` (persist, gate OPEN, refresh)
//! - `Occupied(p) --assign(p)--> Occupied(p)` (no-op)
//! - `Occupied(p) --assign(q)--> Occupied(p)` (rejected)
//! - `Occupied(p) --release--> Empty` (persist, gate CLOSE, refresh)
//!
//! A plate held in one slot is never assigned to another. Gate commands are
//! sent after the store commits and a failed send does not undo the commit.

use crate::domain::types::{target_slot, GateAction, MatchEvent, ParkingSlot, Plate, SlotNumber};
use crate::infra::metrics::{Metrics, RejectKind};
use crate::io::slot_store::{occupied_count, SlotStore, StoreError};
use crate::services::gate::GateController;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

/// Inbound allocator message
#[derive(Debug)]
pub enum AllocatorMsg {
    Match(MatchEvent),
    Release {
        slot: SlotNumber,
        reply: oneshot::Sender<Result<ReleaseOutcome, StoreError>>,
    },
}

/// Result of processing one match event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Allocation {
    /// Target slot was empty and now holds the plate
    Assigned { slot: SlotNumber },
    /// Target slot already holds this plate
    AlreadyAssigned { slot: SlotNumber },
    /// Plate is parked in another slot
    DuplicateElsewhere { slot: SlotNumber, held_in: SlotNumber },
    /// Target slot is not in the table
    SlotMissing { slot: SlotNumber },
    /// Target slot holds a different plate
    Contention { slot: SlotNumber, holder: Plate },
}

/// Result of an operator release
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released { slot: SlotNumber, previous: Option<Plate> },
    SlotMissing { slot: SlotNumber },
}

#[derive(Debug, Error)]
pub enum AllocatorError {
    #[error("allocator has stopped")]
    Stopped,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Point-in-time copy of the slot table, published after every change
#[derive(Debug, Clone, Default)]
pub struct SlotTable {
    pub revision: u64,
    pub slots: Arc<Vec<ParkingSlot>>,
}

/// Producer side of the event queue, cloned into every camera worker
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<AllocatorMsg>,
}

impl EventSender {
    /// Enqueue a match without blocking. Fails only once the allocator is gone.
    pub fn send(&self, event: MatchEvent) -> Result<(), AllocatorError> {
        self.tx.send(AllocatorMsg::Match(event)).map_err(|_| AllocatorError::Stopped)
    }
}

/// Operator-facing handle to the allocator
#[derive(Debug, Clone)]
pub struct AllocatorHandle {
    tx: mpsc::UnboundedSender<AllocatorMsg>,
}

impl AllocatorHandle {
    pub fn event_sender(&self) -> EventSender {
        EventSender { tx: self.tx.clone() }
    }

    /// Free a slot, waiting for the allocator to apply it
    pub async fn release(&self, slot: SlotNumber) -> Result<ReleaseOutcome, AllocatorError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(AllocatorMsg::Release { slot, reply }).map_err(|_| AllocatorError::Stopped)?;
        Ok(rx.await.map_err(|_| AllocatorError::Stopped)??)
    }
}

/// Create the allocator's inbound queue
pub fn allocator_channel() -> (AllocatorHandle, mpsc::UnboundedReceiver<AllocatorMsg>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (AllocatorHandle { tx }, rx)
}

/// Single consumer of the event queue and sole mutator of the slot table
pub struct SlotAllocator<S> {
    store: S,
    gate: GateController,
    max_slots: u32,
    metrics: Arc<Metrics>,
    table_tx: watch::Sender<SlotTable>,
}

impl<S: SlotStore> SlotAllocator<S> {
    pub fn new(store: S, gate: GateController, max_slots: u32, metrics: Arc<Metrics>) -> Self {
        let slots = match store.all() {
            Ok(slots) => slots,
            Err(e) => {
                error!(error = %e, "slot_table_read_failed");
                Vec::new()
            }
        };
        metrics.set_occupied_slots(occupied_count(&slots) as u64);
        let (table_tx, _) = watch::channel(SlotTable { revision: 0, slots: Arc::new(slots) });
        Self { store, gate, max_slots, metrics, table_tx }
    }

    /// Slot table snapshots; a change of value is the "refresh now" signal
    pub fn subscribe(&self) -> watch::Receiver<SlotTable> {
        self.table_tx.subscribe()
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Drain the queue until every sender is dropped
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<AllocatorMsg>) {
        info!(max_slots = %self.max_slots, "allocator_started");

        while let Some(msg) = rx.recv().await {
            match msg {
                AllocatorMsg::Match(event) => {
                    if let Err(e) = self.handle_match(&event) {
                        self.metrics.record_store_failure();
                        error!(
                            camera_id = %event.camera_id,
                            plate = %event.plate,
                            error = %e,
                            "allocation_store_failed"
                        );
                    }
                }
                AllocatorMsg::Release { slot, reply } => {
                    let result = self.release(slot);
                    if let Err(ref e) = result {
                        self.metrics.record_store_failure();
                        error!(slot = %slot, error = %e, "release_store_failed");
                    }
                    // Operator may have given up waiting
                    let _ = reply.send(result);
                }
            }
        }

        info!("allocator_stopped");
    }

    /// Apply one match event
    pub fn handle_match(&mut self, event: &MatchEvent) -> Result<Allocation, StoreError> {
        let plate = &event.plate;
        let target = target_slot(event.camera_id, self.max_slots);

        let held_elsewhere = self.store.find_by_plate(plate)?.into_iter().find(|s| *s != target);
        if let Some(held_in) = held_elsewhere {
            self.metrics.record_rejection(RejectKind::DuplicateElsewhere);
            info!(
                camera_id = %event.camera_id,
                plate = %plate,
                slot = %target,
                held_in = %held_in,
                "match_rejected_duplicate"
            );
            return Ok(Allocation::DuplicateElsewhere { slot: target, held_in });
        }

        let Some(current) = self.store.get(target)? else {
            self.metrics.record_rejection(RejectKind::SlotMissing);
            warn!(camera_id = %event.camera_id, plate = %plate, slot = %target, "match_rejected_slot_missing");
            return Ok(Allocation::SlotMissing { slot: target });
        };

        match current.plate() {
            Some(holder) if holder == plate => {
                self.metrics.record_repeat_sighting();
                debug!(camera_id = %event.camera_id, plate = %plate, slot = %target, "match_already_assigned");
                Ok(Allocation::AlreadyAssigned { slot: target })
            }
            Some(holder) => {
                self.metrics.record_rejection(RejectKind::Contention);
                info!(
                    camera_id = %event.camera_id,
                    plate = %plate,
                    slot = %target,
                    holder = %holder,
                    "match_rejected_contention"
                );
                Ok(Allocation::Contention { slot: target, holder: holder.clone() })
            }
            None => {
                self.store.set(ParkingSlot::occupied(target, plate.clone()))?;
                self.metrics.record_slot_assigned();
                info!(
                    camera_id = %event.camera_id,
                    plate = %plate,
                    slot = %target,
                    observed_at = %event.observed_at.to_rfc3339(),
                    "slot_assigned"
                );
                if let Err(e) = self.gate.actuate(target, GateAction::Open) {
                    warn!(slot = %target, error = %e, "gate_open_not_sent_slot_kept");
                }
                self.publish_table();
                Ok(Allocation::Assigned { slot: target })
            }
        }
    }

    /// Free a slot regardless of which plate holds it
    pub fn release(&mut self, slot: SlotNumber) -> Result<ReleaseOutcome, StoreError> {
        let Some(current) = self.store.get(slot)? else {
            warn!(slot = %slot, "release_rejected_slot_missing");
            return Ok(ReleaseOutcome::SlotMissing { slot });
        };

        self.store.set(ParkingSlot::empty(slot))?;
        self.metrics.record_release();
        let previous = current.plate().cloned();
        info!(
            slot = %slot,
            plate = %previous.as_ref().map(|p| p.as_str()).unwrap_or(""),
            "slot_released"
        );
        if let Err(e) = self.gate.actuate(slot, GateAction::Close) {
            warn!(slot = %slot, error = %e, "gate_close_not_sent_slot_kept");
        }
        self.publish_table();
        Ok(ReleaseOutcome::Released { slot, previous })
    }

    fn publish_table(&self) {
        match self.store.all() {
            Ok(slots) => {
                self.metrics.set_occupied_slots(occupied_count(&slots) as u64);
                self.table_tx.send_modify(|table| {
                    table.revision += 1;
                    table.slots = Arc::new(slots);
                });
            }
            Err(e) => error!(error = %e, "slot_table_snapshot_failed"),
        }
    }
}
