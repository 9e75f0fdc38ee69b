//! Shared types for the parking gate pipeline

use crate::domain::plate::sanitize;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::fmt;

/// Newtype wrapper for camera IDs to provide type safety
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct CameraId(pub u32);

impl fmt::Display for CameraId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Newtype wrapper for parking slot numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct SlotNumber(pub u32);

impl fmt::Display for SlotNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Slot a camera allocates into: the camera id clamped to `[1, max_slots]`.
///
/// `max_slots` of zero is treated as one so the clamp range is never empty.
pub fn target_slot(camera_id: CameraId, max_slots: u32) -> SlotNumber {
    SlotNumber(camera_id.0.clamp(1, max_slots.max(1)))
}

/// Canonical plate identifier: non-empty, uppercase ASCII alphanumerics only.
///
/// The only way to obtain a `Plate` is through sanitization, so every value
/// of this type upholds the invariant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Plate(String);

impl Plate {
    /// Sanitize raw recognized text into a plate, if anything is left.
    pub fn parse(raw: &str) -> Option<Self> {
        sanitize(raw)
    }

    pub(crate) fn from_sanitized(value: String) -> Self {
        debug_assert!(!value.is_empty());
        Self(value)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Plate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Occupancy of a single slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    Empty,
    Occupied,
}

impl SlotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotStatus::Empty => "empty",
            SlotStatus::Occupied => "occupied",
        }
    }
}

/// A fixed, numbered parking space.
///
/// Status is derived from the plate, so `Occupied` always carries a plate
/// and `Empty` never does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParkingSlot {
    pub slot_number: SlotNumber,
    plate: Option<Plate>,
}

impl ParkingSlot {
    pub fn empty(slot_number: SlotNumber) -> Self {
        Self { slot_number, plate: None }
    }

    pub fn occupied(slot_number: SlotNumber, plate: Plate) -> Self {
        Self { slot_number, plate: Some(plate) }
    }

    pub fn status(&self) -> SlotStatus {
        if self.plate.is_some() {
            SlotStatus::Occupied
        } else {
            SlotStatus::Empty
        }
    }

    pub fn plate(&self) -> Option<&Plate> {
        self.plate.as_ref()
    }

    pub fn is_held_by(&self, plate: &Plate) -> bool {
        self.plate.as_ref() == Some(plate)
    }
}

/// "This camera just saw this registered plate"
#[derive(Debug, Clone, PartialEq)]
pub struct MatchEvent {
    pub camera_id: CameraId,
    pub plate: Plate,
    pub observed_at: DateTime<Utc>,
}

impl MatchEvent {
    pub fn now(camera_id: CameraId, plate: Plate) -> Self {
        Self { camera_id, plate, observed_at: Utc::now() }
    }
}

/// Axis-aligned plate region in frame pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct PlateBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    #[serde(default)]
    pub score: f32,
}

impl PlateBox {
    /// Integer pixel rectangle `(x, y, width, height)` clipped to the frame.
    /// Returns `None` for boxes with no area inside the frame.
    pub fn clip(&self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        let clamp = |v: f32, max: u32| -> u32 {
            if v.is_nan() || v <= 0.0 {
                0
            } else {
                (v as u32).min(max)
            }
        };
        let x1 = clamp(self.x1.min(self.x2), width);
        let x2 = clamp(self.x1.max(self.x2), width);
        let y1 = clamp(self.y1.min(self.y2), height);
        let y2 = clamp(self.y1.max(self.y2), height);

        if x2 <= x1 || y2 <= y1 {
            return None;
        }
        Some((x1, y1, x2 - x1, y2 - y1))
    }
}

/// Direction of a gate actuation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateAction {
    Open,
    Close,
}

impl GateAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateAction::Open => "OPEN",
            GateAction::Close => "CLOSE",
        }
    }
}

impl fmt::Display for GateAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_slot_clamps() {
        assert_eq!(target_slot(CameraId(0), 2), SlotNumber(1));
        assert_eq!(target_slot(CameraId(1), 2), SlotNumber(1));
        assert_eq!(target_slot(CameraId(2), 2), SlotNumber(2));
        assert_eq!(target_slot(CameraId(5), 2), SlotNumber(2));
    }

    #[test]
    fn test_target_slot_monotonic() {
        let mut last = SlotNumber(0);
        for id in 0..10 {
            let slot = target_slot(CameraId(id), 4);
            assert!(slot >= last);
            last = slot;
        }
    }

    #[test]
    fn test_target_slot_zero_max() {
        assert_eq!(target_slot(CameraId(3), 0), SlotNumber(1));
    }

    #[test]
    fn test_slot_status_follows_plate() {
        let plate = Plate::parse("abc123").unwrap();
        let slot = ParkingSlot::occupied(SlotNumber(1), plate.clone());
        assert_eq!(slot.status(), SlotStatus::Occupied);
        assert!(slot.is_held_by(&plate));

        let slot = ParkingSlot::empty(SlotNumber(1));
        assert_eq!(slot.status(), SlotStatus::Empty);
        assert!(slot.plate().is_none());
        assert!(!slot.is_held_by(&plate));
    }

    #[test]
    fn test_plate_box_clip() {
        let b = PlateBox { x1: 10.4, y1: 5.0, x2: 30.9, y2: 15.0, score: 0.9 };
        assert_eq!(b.clip(100, 100), Some((10, 5, 20, 10)));

        // Swapped corners are normalized
        let b = PlateBox { x1: 30.0, y1: 15.0, x2: 10.0, y2: 5.0, score: 0.9 };
        assert_eq!(b.clip(100, 100), Some((10, 5, 20, 10)));

        // Clipped to frame
        let b = PlateBox { x1: -5.0, y1: -5.0, x2: 500.0, y2: 500.0, score: 0.9 };
        assert_eq!(b.clip(64, 48), Some((0, 0, 64, 48)));

        // Fully outside
        let b = PlateBox { x1: 200.0, y1: 200.0, x2: 300.0, y2: 300.0, score: 0.9 };
        assert_eq!(b.clip(64, 48), None);
    }

    #[test]
    fn test_gate_action_as_str() {
        assert_eq!(GateAction::Open.as_str(), "OPEN");
        assert_eq!(GateAction::Close.as_str(), "CLOSE");
    }
}
