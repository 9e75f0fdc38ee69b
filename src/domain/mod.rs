//! Domain models - core parking types
//!
//! This module contains the canonical data types used throughout the system:
//! - `Plate` - sanitized vehicle identifier
//! - `ParkingSlot` - fixed slot with binary occupancy
//! - `MatchEvent` - a camera sighting of a registered plate
//! - `PlateBox` - detector output region

pub mod plate;
pub mod types;

pub use plate::sanitize;
pub use types::{
    target_slot, CameraId, GateAction, MatchEvent, ParkingSlot, Plate, PlateBox, SlotNumber,
    SlotStatus,
};
