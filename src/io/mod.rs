//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `slot_store` - Persisted parking slot table (JSON file, in-memory)
//! - `registry` - Registered plates (JSON user file)
//! - `vision` - Plate detection and OCR sidecar client
//! - `video` - Camera frame sources
//! - `serial_gate` - Serial link to the gate actuator
//! - `prometheus` - Prometheus metrics HTTP endpoint
//! - `terminal` - ratatui display and keyboard operator input

pub mod prometheus;
pub mod registry;
pub mod serial_gate;
pub mod slot_store;
pub mod terminal;
pub mod video;
pub mod vision;

// Re-export commonly used types
pub use registry::{JsonRegistry, Registry, RegistryError, StaticRegistry, User};
pub use slot_store::{JsonSlotStore, MemorySlotStore, SlotStore, StoreError};
pub use video::{ImageSequenceSource, MemorySource, VideoSource};
pub use vision::{HttpVision, PlateDetector, PlateReader, VisionError};
