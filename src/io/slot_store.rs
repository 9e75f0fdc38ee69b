//! Parking slot persistence
//!
//! The allocator is the only writer, so implementations need no internal
//! locking. `JsonSlotStore` keeps the table in a JSON file with one record per
//! slot:
//!
//! ```json
//! [{"slot_number": 1, "slot_status": "occupied", "plate_number": "ABC123"},
//!  {"slot_number": 2, "slot_status": "empty", "plate_number": ""}]
//! ```

use crate::domain::types::{ParkingSlot, Plate, SlotNumber, SlotStatus};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("slot store IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("slot store JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("corrupt record for slot {slot}: {reason}")]
    Corrupt { slot: u32, reason: String },

    #[error("slot {0} is not configured")]
    UnknownSlot(SlotNumber),
}

/// Slot table capability handed to the allocator
pub trait SlotStore: Send {
    /// Fetch a slot, `None` if the slot number is not configured
    fn get(&self, slot: SlotNumber) -> Result<Option<ParkingSlot>, StoreError>;

    /// Replace an existing slot record
    fn set(&mut self, slot: ParkingSlot) -> Result<(), StoreError>;

    /// Occupied slots currently holding `plate`, ascending
    fn find_by_plate(&self, plate: &Plate) -> Result<Vec<SlotNumber>, StoreError>;

    /// Every slot, ordered by slot number
    fn all(&self) -> Result<Vec<ParkingSlot>, StoreError>;
}

fn initial_table(max_slots: u32) -> BTreeMap<SlotNumber, ParkingSlot> {
    (1..=max_slots).map(|n| (SlotNumber(n), ParkingSlot::empty(SlotNumber(n)))).collect()
}

fn slots_holding(slots: &BTreeMap<SlotNumber, ParkingSlot>, plate: &Plate) -> Vec<SlotNumber> {
    slots.values().filter(|s| s.is_held_by(plate)).map(|s| s.slot_number).collect()
}

/// In-memory slot table
#[derive(Debug, Clone, Default)]
pub struct MemorySlotStore {
    slots: BTreeMap<SlotNumber, ParkingSlot>,
}

impl MemorySlotStore {
    /// Table pre-populated with empty slots `1..=max_slots`
    pub fn with_slots(max_slots: u32) -> Self {
        Self { slots: initial_table(max_slots) }
    }

    /// Table from explicit records (may be sparse)
    pub fn from_slots(slots: impl IntoIterator<Item = ParkingSlot>) -> Self {
        Self { slots: slots.into_iter().map(|s| (s.slot_number, s)).collect() }
    }
}

impl SlotStore for MemorySlotStore {
    fn get(&self, slot: SlotNumber) -> Result<Option<ParkingSlot>, StoreError> {
        Ok(self.slots.get(&slot).cloned())
    }

    fn set(&mut self, slot: ParkingSlot) -> Result<(), StoreError> {
        match self.slots.get_mut(&slot.slot_number) {
            Some(existing) => {
                *existing = slot;
                Ok(())
            }
            None => Err(StoreError::UnknownSlot(slot.slot_number)),
        }
    }

    fn find_by_plate(&self, plate: &Plate) -> Result<Vec<SlotNumber>, StoreError> {
        Ok(slots_holding(&self.slots, plate))
    }

    fn all(&self) -> Result<Vec<ParkingSlot>, StoreError> {
        Ok(self.slots.values().cloned().collect())
    }
}

/// On-disk record layout
#[derive(Debug, Serialize, Deserialize)]
struct SlotRecord {
    slot_number: u32,
    slot_status: String,
    #[serde(default)]
    plate_number: String,
}

impl From<&ParkingSlot> for SlotRecord {
    fn from(slot: &ParkingSlot) -> Self {
        Self {
            slot_number: slot.slot_number.0,
            slot_status: slot.status().as_str().to_string(),
            plate_number: slot.plate().map(|p| p.as_str().to_string()).unwrap_or_default(),
        }
    }
}

impl TryFrom<SlotRecord> for ParkingSlot {
    type Error = StoreError;

    fn try_from(record: SlotRecord) -> Result<Self, Self::Error> {
        let corrupt = |reason: &str| StoreError::Corrupt {
            slot: record.slot_number,
            reason: reason.to_string(),
        };
        if record.slot_number == 0 {
            return Err(corrupt("slot numbers start at 1"));
        }
        let number = SlotNumber(record.slot_number);
        let plate = Plate::parse(&record.plate_number);

        match (record.slot_status.as_str(), plate) {
            ("empty", None) => Ok(ParkingSlot::empty(number)),
            ("empty", Some(_)) => Err(corrupt("empty slot carries a plate")),
            ("occupied", Some(plate)) if plate.as_str() == record.plate_number => {
                Ok(ParkingSlot::occupied(number, plate))
            }
            ("occupied", Some(_)) => Err(corrupt("plate is not in canonical form")),
            ("occupied", None) => Err(corrupt("occupied slot has no plate")),
            (other, _) => Err(corrupt(&format!("unknown status {other:?}"))),
        }
    }
}

/// Slot table persisted as a JSON file, written atomically on every change
#[derive(Debug)]
pub struct JsonSlotStore {
    path: PathBuf,
    slots: BTreeMap<SlotNumber, ParkingSlot>,
}

impl JsonSlotStore {
    /// Open the table at `path`, creating it with `1..=max_slots` empty slots
    /// when absent. Configured slots missing from an existing file are added.
    pub fn open(path: impl Into<PathBuf>, max_slots: u32) -> Result<Self, StoreError> {
        let path = path.into();
        let mut slots = match Self::read_records(&path)? {
            Some(slots) => slots,
            None => BTreeMap::new(),
        };

        let before = slots.len();
        for (number, slot) in initial_table(max_slots) {
            slots.entry(number).or_insert(slot);
        }
        let store = Self { path, slots };

        if store.slots.len() != before {
            store.persist(&store.slots)?;
            info!(
                path = %store.path.display(),
                added = %(store.slots.len() - before),
                max_slots = %max_slots,
                "slot_table_initialized"
            );
        }
        Ok(store)
    }

    /// Read-only view of a table on disk (empty if the file does not exist)
    pub fn read_table(path: impl AsRef<Path>) -> Result<Vec<ParkingSlot>, StoreError> {
        Ok(Self::read_records(path.as_ref())?
            .map(|slots| slots.into_values().collect())
            .unwrap_or_default())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_records(path: &Path) -> Result<Option<BTreeMap<SlotNumber, ParkingSlot>>, StoreError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if content.trim().is_empty() {
            return Ok(None);
        }

        let records: Vec<SlotRecord> = serde_json::from_str(&content)?;
        let mut slots = BTreeMap::new();
        let mut held = HashSet::new();
        for record in records {
            let number = record.slot_number;
            let slot = ParkingSlot::try_from(record)?;
            // A plate occupies at most one slot
            if let Some(plate) = slot.plate() {
                if !held.insert(plate.clone()) {
                    return Err(StoreError::Corrupt {
                        slot: number,
                        reason: format!("plate {plate} held in more than one slot"),
                    });
                }
            }
            if slots.insert(slot.slot_number, slot).is_some() {
                return Err(StoreError::Corrupt {
                    slot: number,
                    reason: "duplicate slot record".to_string(),
                });
            }
        }
        Ok(Some(slots))
    }

    fn persist(&self, slots: &BTreeMap<SlotNumber, ParkingSlot>) -> Result<(), StoreError> {
        let records: Vec<SlotRecord> = slots.values().map(SlotRecord::from).collect();
        let json = serde_json::to_vec_pretty(&records)?;
        write_atomic(&self.path, &json)?;

        debug!(path = %self.path.display(), bytes = %json.len(), "slot_table_written");
        Ok(())
    }
}

impl SlotStore for JsonSlotStore {
    fn get(&self, slot: SlotNumber) -> Result<Option<ParkingSlot>, StoreError> {
        Ok(self.slots.get(&slot).cloned())
    }

    fn set(&mut self, slot: ParkingSlot) -> Result<(), StoreError> {
        if !self.slots.contains_key(&slot.slot_number) {
            return Err(StoreError::UnknownSlot(slot.slot_number));
        }
        // Commit in memory only once the file reflects the change
        let mut next = self.slots.clone();
        next.insert(slot.slot_number, slot);
        self.persist(&next)?;
        self.slots = next;
        Ok(())
    }

    fn find_by_plate(&self, plate: &Plate) -> Result<Vec<SlotNumber>, StoreError> {
        Ok(slots_holding(&self.slots, plate))
    }

    fn all(&self) -> Result<Vec<ParkingSlot>, StoreError> {
        Ok(self.slots.values().cloned().collect())
    }
}

/// Replace `path` with `bytes` via a sibling temp file and rename, so readers
/// see either the old or the new content. Creates missing parent directories.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }

    let mut tmp = path.to_path_buf().into_os_string();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)
}

/// Count of occupied slots in a table
pub fn occupied_count(slots: &[ParkingSlot]) -> usize {
    slots.iter().filter(|s| s.status() == SlotStatus::Occupied).count()
}
