//! Display scheduler - cooperative, tick-driven rendering loop
//!
//! Each tick drains at most one frame per active camera session without
//! waiting, then polls the operator input exactly once. A stop request
//! deactivates every session, cancels its worker, and closes its view.
//! Slot table changes arrive on the allocator's watch channel.

use crate::domain::types::{CameraId, SlotNumber};
use crate::services::allocator::{AllocatorHandle, ReleaseOutcome, SlotTable};
use crate::services::camera_worker::AnnotatedFrame;
use crate::services::frame_sink::FrameReceiver;
use image::{ImageFormat, RgbImage};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Operator request read from the input device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorCommand {
    /// Shared cancellation: stop every camera
    Stop,
    /// Free the given slot
    Release(SlotNumber),
}

/// Non-blocking operator input, polled once per tick
pub trait OperatorInput: Send {
    fn poll(&mut self) -> Option<OperatorCommand>;
}

/// Output surface for camera views and the slot table
pub trait Renderer: Send {
    fn render_frame(&mut self, frame: &AnnotatedFrame);
    fn close_view(&mut self, camera_id: CameraId);
    fn render_slots(&mut self, table: &SlotTable);
    /// Called once at the end of every tick
    fn present(&mut self) {}
}

/// Display side of one camera session
pub struct DisplaySession {
    pub camera_id: CameraId,
    frames: FrameReceiver<AnnotatedFrame>,
    cancel: CancellationToken,
    active: bool,
}

impl DisplaySession {
    pub fn new(camera_id: CameraId, frames: FrameReceiver<AnnotatedFrame>, cancel: CancellationToken) -> Self {
        Self { camera_id, frames, cancel, active: true }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}

/// What a tick observed
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub frames_rendered: usize,
    pub views_closed: usize,
    pub stop_requested: bool,
}

pub struct DisplayScheduler<R, I> {
    sessions: Vec<DisplaySession>,
    renderer: R,
    input: I,
    allocator: AllocatorHandle,
    table_rx: watch::Receiver<SlotTable>,
}

impl<R: Renderer, I: OperatorInput> DisplayScheduler<R, I> {
    pub fn new(
        sessions: Vec<DisplaySession>,
        renderer: R,
        input: I,
        allocator: AllocatorHandle,
        table_rx: watch::Receiver<SlotTable>,
    ) -> Self {
        Self { sessions, renderer, input, allocator, table_rx }
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.iter().filter(|s| s.active).count()
    }

    pub fn renderer(&self) -> &R {
        &self.renderer
    }

    /// One scheduler step. Never waits on a frame.
    pub fn tick(&mut self) -> TickReport {
        let mut report = TickReport::default();

        for session in self.sessions.iter_mut().filter(|s| s.active) {
            // Sample liveness before taking so a final frame is never skipped
            let producer_alive = session.frames.is_producer_alive();
            if let Some(frame) = session.frames.try_take() {
                self.renderer.render_frame(&frame);
                report.frames_rendered += 1;
            } else if !producer_alive {
                session.active = false;
                self.renderer.close_view(session.camera_id);
                report.views_closed += 1;
                info!(camera_id = %session.camera_id, "camera_view_closed_stream_ended");
            }
        }

        match self.input.poll() {
            Some(OperatorCommand::Stop) => {
                report.stop_requested = true;
                report.views_closed += self.stop_all();
            }
            Some(OperatorCommand::Release(slot)) => self.request_release(slot),
            None => {}
        }

        self.renderer.present();
        report
    }

    /// Deactivate and cancel every active session
    fn stop_all(&mut self) -> usize {
        let mut closed = 0;
        for session in self.sessions.iter_mut().filter(|s| s.active) {
            session.active = false;
            session.cancel.cancel();
            self.renderer.close_view(session.camera_id);
            closed += 1;
        }
        info!(sessions = %closed, "operator_stop_all_cameras");
        closed
    }

    /// Forward a release to the allocator without blocking the tick
    fn request_release(&self, slot: SlotNumber) {
        info!(slot = %slot, "operator_release_requested");
        let allocator = self.allocator.clone();
        tokio::spawn(async move {
            match allocator.release(slot).await {
                Ok(ReleaseOutcome::Released { previous, .. }) => {
                    debug!(slot = %slot, had_plate = %previous.is_some(), "operator_release_applied");
                }
                Ok(ReleaseOutcome::SlotMissing { .. }) => {
                    warn!(slot = %slot, "operator_release_unknown_slot");
                }
                Err(e) => warn!(slot = %slot, error = %e, "operator_release_failed"),
            }
        });
    }

    fn refresh_slots(&mut self) {
        let table = self.table_rx.borrow_and_update().clone();
        self.renderer.render_slots(&table);
    }

    /// Run until no session remains active
    pub async fn run(mut self, tick: Duration, refresh: Duration) -> R {
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut refresher = tokio::time::interval(refresh);
        refresher.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut table_live = true;

        info!(sessions = %self.sessions.len(), tick_ms = %tick.as_millis(), "display_started");
        self.refresh_slots();

        while self.active_sessions() > 0 {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick();
                }
                changed = self.table_rx.changed(), if table_live => {
                    if changed.is_ok() {
                        self.refresh_slots();
                    } else {
                        debug!("slot_table_channel_closed");
                        table_live = false;
                    }
                }
                _ = refresher.tick() => {
                    self.refresh_slots();
                }
            }
        }

        info!("display_stopped");
        self.renderer
    }
}

/// Input that reports `Stop` once a shutdown token fires.
/// Used when there is no interactive operator.
pub struct ShutdownInput {
    token: CancellationToken,
    reported: bool,
}

impl ShutdownInput {
    pub fn new(token: CancellationToken) -> Self {
        Self { token, reported: false }
    }
}

impl OperatorInput for ShutdownInput {
    fn poll(&mut self) -> Option<OperatorCommand> {
        if !self.reported && self.token.is_cancelled() {
            self.reported = true;
            return Some(OperatorCommand::Stop);
        }
        None
    }
}

/// Minimum spacing between snapshot writes for one camera
const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(1);

/// Renderer that logs instead of drawing.
///
/// With a snapshot directory it also keeps the latest annotated frame of each
/// camera on disk as `camera_<id>.png`, rewritten at most once per second.
#[derive(Debug, Default)]
pub struct HeadlessRenderer {
    frames_seen: u64,
    last_revision: Option<u64>,
    snapshot_dir: Option<PathBuf>,
    pending: BTreeMap<CameraId, RgbImage>,
    last_written: BTreeMap<CameraId, Instant>,
}

impl HeadlessRenderer {
    pub fn with_snapshot_dir(dir: impl Into<PathBuf>) -> Self {
        Self { snapshot_dir: Some(dir.into()), ..Default::default() }
    }

    pub fn frames_seen(&self) -> u64 {
        self.frames_seen
    }

    pub fn snapshot_path(dir: &Path, camera_id: CameraId) -> PathBuf {
        dir.join(format!("camera_{camera_id}.png"))
    }

    fn write_snapshots(&mut self, dir: &Path) {
        let due: Vec<CameraId> = self
            .pending
            .keys()
            .filter(|id| self.last_written.get(*id).map_or(true, |t| t.elapsed() >= SNAPSHOT_INTERVAL))
            .copied()
            .collect();

        for camera_id in due {
            let Some(image) = self.pending.remove(&camera_id) else { continue };
            match write_png(dir, camera_id, &image) {
                Ok(()) => trace!(camera_id = %camera_id, "frame_snapshot_written"),
                Err(e) => warn!(camera_id = %camera_id, dir = %dir.display(), error = %e, "frame_snapshot_failed"),
            }
            self.last_written.insert(camera_id, Instant::now());
        }
    }
}

/// Save through a temp file so viewers never load a half-written image
fn write_png(dir: &Path, camera_id: CameraId, image: &RgbImage) -> image::ImageResult<()> {
    std::fs::create_dir_all(dir)?;
    let path = HeadlessRenderer::snapshot_path(dir, camera_id);
    let tmp = dir.join(format!(".camera_{camera_id}.png.tmp"));
    image.save_with_format(&tmp, ImageFormat::Png)?;
    std::fs::rename(&tmp, &path)?;
    Ok(())
}

impl Renderer for HeadlessRenderer {
    fn render_frame(&mut self, frame: &AnnotatedFrame) {
        self.frames_seen += 1;
        if self.snapshot_dir.is_some() {
            self.pending.insert(frame.camera_id, frame.image.clone());
        }
        for label in frame.labels.iter().filter(|l| l.plate.is_some()) {
            debug!(
                camera_id = %frame.camera_id,
                sequence = %frame.sequence,
                text = %label.text,
                registered = %label.registered,
                "frame_plate_label"
            );
        }
    }

    fn close_view(&mut self, camera_id: CameraId) {
        info!(camera_id = %camera_id, frames_seen = %self.frames_seen, "headless_view_closed");
        // The final frame of a camera is always kept
        self.last_written.remove(&camera_id);
        if let Some(dir) = self.snapshot_dir.clone() {
            self.write_snapshots(&dir);
        }
    }

    fn present(&mut self) {
        if let Some(dir) = self.snapshot_dir.clone() {
            self.write_snapshots(&dir);
        }
    }

    fn render_slots(&mut self, table: &SlotTable) {
        // Periodic refreshes of an unchanged table stay quiet
        if self.last_revision == Some(table.revision) {
            return;
        }
        self.last_revision = Some(table.revision);
        for slot in table.slots.iter() {
            info!(
                revision = %table.revision,
                slot = %slot.slot_number,
                status = %slot.status().as_str(),
                plate = %slot.plate().map(|p| p.as_str()).unwrap_or("-"),
                "slot_table_row"
            );
        }
    }
}
