//! Services - recognition pipeline and slot state management
//!
//! This module contains the core pipeline services:
//! - `camera_worker` - Per-camera detect, read, and match loop
//! - `frame_sink` - Overwrite-latest frame hand-off to the display
//! - `allocator` - Single-writer slot allocation actor
//! - `gate` - Gate controller interface
//! - `gate_worker` - Async gate command worker
//! - `display` - Tick-driven display scheduler and operator commands
//! - `recognition` - Camera session supervisor

pub mod allocator;
pub mod camera_worker;
pub mod display;
pub mod frame_sink;
pub mod gate;
pub mod gate_worker;
pub mod recognition;

// Re-export commonly used types
pub use allocator::{allocator_channel, AllocatorHandle, EventSender, SlotAllocator, SlotTable};
pub use camera_worker::{AnnotatedFrame, CameraWorker, WorkerContext, WorkerExit};
pub use display::{DisplayScheduler, DisplaySession, HeadlessRenderer, OperatorCommand, ShutdownInput};
pub use gate::{GateController, GateError};
pub use gate_worker::{create_gate_worker, GateCmdWorker};
pub use recognition::{RecognitionSupervisor, SupervisorError};
