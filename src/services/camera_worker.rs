//! Per-camera recognition loop
//!
//! Each iteration: pull a frame, detect plate regions, read and sanitize each
//! region independently, enqueue a match for every registered plate, then
//! publish the annotated frame to this camera's sink. The cancellation token
//! is checked once, after publishing.

use crate::domain::plate::sanitize;
use crate::domain::types::{CameraId, MatchEvent, Plate, PlateBox};
use crate::infra::metrics::Metrics;
use crate::io::registry::Registry;
use crate::io::video::VideoSource;
use crate::io::vision::{first_line, PlateDetector, PlateReader};
use crate::services::allocator::EventSender;
use crate::services::frame_sink::FrameSender;
use image::{imageops, Rgb, RgbImage};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

const BOX_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const BOX_THICKNESS: u32 = 2;

/// A recognized region on an annotated frame
#[derive(Debug, Clone, PartialEq)]
pub struct PlateLabel {
    pub bbox: PlateBox,
    /// First OCR line, trimmed
    pub text: String,
    pub plate: Option<Plate>,
    pub registered: bool,
}

/// Frame with detection boxes drawn in and the recognized text alongside
#[derive(Debug, Clone)]
pub struct AnnotatedFrame {
    pub camera_id: CameraId,
    pub sequence: u64,
    pub image: RgbImage,
    pub labels: Vec<PlateLabel>,
}

/// How a worker loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Source has no more frames
    Exhausted,
    /// Cancellation observed
    Cancelled,
    /// Allocator queue closed; matches could no longer be delivered
    AllocatorStopped,
}

/// Collaborators shared by every camera worker
#[derive(Clone)]
pub struct WorkerContext {
    pub detector: Arc<dyn PlateDetector>,
    pub reader: Arc<dyn PlateReader>,
    pub registry: Arc<dyn Registry>,
    pub events: EventSender,
    pub metrics: Arc<Metrics>,
    /// Detections scoring below this are ignored
    pub min_score: f32,
}

pub struct CameraWorker {
    camera_id: CameraId,
    source: Box<dyn VideoSource>,
    ctx: WorkerContext,
    sink: FrameSender<AnnotatedFrame>,
    cancel: CancellationToken,
}

impl CameraWorker {
    pub fn new(
        camera_id: CameraId,
        source: Box<dyn VideoSource>,
        ctx: WorkerContext,
        sink: FrameSender<AnnotatedFrame>,
        cancel: CancellationToken,
    ) -> Self {
        Self { camera_id, source, ctx, sink, cancel }
    }

    /// Run until the source ends or cancellation is observed.
    /// The source is released when the worker returns.
    pub async fn run(mut self) -> WorkerExit {
        info!(camera_id = %self.camera_id, "camera_worker_started");
        let mut sequence = 0u64;

        let exit = loop {
            let Some(frame) = self.source.next_frame().await else {
                break WorkerExit::Exhausted;
            };
            sequence += 1;

            let start = Instant::now();
            let (annotated, delivered) = self.process_frame(frame, sequence).await;
            if self.sink.publish(annotated) {
                self.ctx.metrics.record_frame_dropped();
                trace!(camera_id = %self.camera_id, sequence = %sequence, "frame_overwritten");
            }
            self.ctx.metrics.record_frame_processed(start.elapsed().as_micros() as u64);

            if !delivered {
                break WorkerExit::AllocatorStopped;
            }
            if self.cancel.is_cancelled() {
                break WorkerExit::Cancelled;
            }
        };

        info!(camera_id = %self.camera_id, frames = %sequence, exit = ?exit, "camera_worker_stopped");
        exit
    }

    /// Returns the annotated frame and whether the allocator accepted every match
    async fn process_frame(&self, mut frame: RgbImage, sequence: u64) -> (AnnotatedFrame, bool) {
        let boxes = match self.ctx.detector.detect(&frame).await {
            Ok(boxes) => boxes,
            Err(e) => {
                self.ctx.metrics.record_vision_failure();
                warn!(camera_id = %self.camera_id, sequence = %sequence, error = %e, "plate_detect_failed");
                Vec::new()
            }
        };
        let boxes: Vec<PlateBox> =
            boxes.into_iter().filter(|b| b.score >= self.ctx.min_score).collect();
        self.ctx.metrics.record_detections(boxes.len());

        let mut labels = Vec::with_capacity(boxes.len());
        let mut rects = Vec::with_capacity(boxes.len());
        let mut delivered = true;

        for bbox in boxes {
            let Some(rect) = bbox.clip(frame.width(), frame.height()) else {
                debug!(camera_id = %self.camera_id, bbox = ?bbox, "plate_box_outside_frame");
                continue;
            };
            rects.push(rect);

            let (x, y, w, h) = rect;
            let crop = imageops::crop_imm(&frame, x, y, w, h).to_image();
            let lines = match self.ctx.reader.recognize(&crop).await {
                Ok(lines) => lines,
                Err(e) => {
                    self.ctx.metrics.record_vision_failure();
                    warn!(camera_id = %self.camera_id, sequence = %sequence, error = %e, "plate_ocr_failed");
                    Vec::new()
                }
            };
            let text = first_line(&lines).to_string();
            let plate = sanitize(&text);

            let mut registered = false;
            if let Some(ref plate) = plate {
                self.ctx.metrics.record_plate_read();
                registered = self.is_registered(plate).await;
                if registered {
                    delivered &= self.enqueue_match(plate);
                }
            }

            labels.push(PlateLabel { bbox, text, plate, registered });
        }

        for rect in rects {
            draw_box(&mut frame, rect);
        }

        let annotated = AnnotatedFrame { camera_id: self.camera_id, sequence, image: frame, labels };
        (annotated, delivered)
    }

    /// Registry lookup; a failing registry counts as "not registered"
    async fn is_registered(&self, plate: &Plate) -> bool {
        match self.ctx.registry.lookup(plate).await {
            Ok(true) => {
                self.ctx.metrics.record_registry_hit();
                true
            }
            Ok(false) => {
                debug!(camera_id = %self.camera_id, plate = %plate, "plate_not_registered");
                false
            }
            Err(e) => {
                self.ctx.metrics.record_registry_failure();
                warn!(camera_id = %self.camera_id, plate = %plate, error = %e, "registry_lookup_failed");
                false
            }
        }
    }

    fn enqueue_match(&self, plate: &Plate) -> bool {
        match self.ctx.events.send(MatchEvent::now(self.camera_id, plate.clone())) {
            Ok(()) => {
                self.ctx.metrics.record_match_enqueued();
                info!(camera_id = %self.camera_id, plate = %plate, "plate_matched");
                true
            }
            Err(e) => {
                warn!(camera_id = %self.camera_id, plate = %plate, error = %e, "match_enqueue_failed");
                false
            }
        }
    }
}

/// Outline a rectangle in place, clipped to the image
fn draw_box(image: &mut RgbImage, (x, y, w, h): (u32, u32, u32, u32)) {
    let x_end = (x + w).min(image.width());
    let y_end = (y + h).min(image.height());

    for py in y..y_end {
        for px in x..x_end {
            let on_edge = px < x + BOX_THICKNESS
                || py < y + BOX_THICKNESS
                || px + BOX_THICKNESS >= x_end
                || py + BOX_THICKNESS >= y_end;
            if on_edge {
                image.put_pixel(px, py, BOX_COLOR);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::registry::{RegistryError, StaticRegistry};
    use crate::io::video::MemorySource;
    use crate::io::vision::VisionError;
    use crate::services::allocator::{allocator_channel, AllocatorMsg};
    use crate::services::frame_sink::{frame_sink, FrameReceiver};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use tokio::sync::mpsc;

    struct FixedDetector(Vec<PlateBox>);

    #[async_trait]
    impl PlateDetector for FixedDetector {
        async fn detect(&self, _frame: &RgbImage) -> Result<Vec<PlateBox>, VisionError> {
            Ok(self.0.clone())
        }
    }

    struct BrokenDetector;

    #[async_trait]
    impl PlateDetector for BrokenDetector {
        async fn detect(&self, _frame: &RgbImage) -> Result<Vec<PlateBox>, VisionError> {
            Err(VisionError::Status(503))
        }
    }

    /// Returns scripted OCR results in call order, then nothing
    struct ScriptedReader(Mutex<VecDeque<Vec<String>>>);

    impl ScriptedReader {
        fn new(script: &[&[&str]]) -> Self {
            Self(Mutex::new(
                script.iter().map(|lines| lines.iter().map(|l| l.to_string()).collect()).collect(),
            ))
        }
    }

    #[async_trait]
    impl PlateReader for ScriptedReader {
        async fn recognize(&self, _crop: &RgbImage) -> Result<Vec<String>, VisionError> {
            Ok(self.0.lock().pop_front().unwrap_or_default())
        }
    }

    struct DownRegistry;

    #[async_trait]
    impl Registry for DownRegistry {
        async fn lookup(&self, _plate: &Plate) -> Result<bool, RegistryError> {
            Err(RegistryError::Io(std::io::Error::other("database locked")))
        }
    }

    fn bbox(x1: f32, score: f32) -> PlateBox {
        PlateBox { x1, y1: 2.0, x2: x1 + 10.0, y2: 8.0, score }
    }

    fn frames(n: usize) -> MemorySource {
        MemorySource::new((0..n).map(|_| RgbImage::new(64, 32)))
    }

    struct Rig {
        worker: CameraWorker,
        sink_rx: FrameReceiver<AnnotatedFrame>,
        events_rx: mpsc::UnboundedReceiver<AllocatorMsg>,
        cancel: CancellationToken,
        metrics: Arc<Metrics>,
    }

    fn rig(
        source: MemorySource,
        detector: Arc<dyn PlateDetector>,
        reader: ScriptedReader,
        registry: Arc<dyn Registry>,
    ) -> Rig {
        let (handle, events_rx) = allocator_channel();
        let metrics = Arc::new(Metrics::new());
        let ctx = WorkerContext {
            detector,
            reader: Arc::new(reader),
            registry,
            events: handle.event_sender(),
            metrics: metrics.clone(),
            min_score: 0.5,
        };
        let (sink_tx, sink_rx) = frame_sink();
        let cancel = CancellationToken::new();
        let worker = CameraWorker::new(CameraId(1), Box::new(source), ctx, sink_tx, cancel.clone());
        Rig { worker, sink_rx, events_rx, cancel, metrics }
    }

    fn registered(plates: &[&str]) -> Arc<dyn Registry> {
        Arc::new(StaticRegistry::new(plates.iter().map(|p| Plate::parse(p).unwrap())))
    }

    fn matched_plates(rx: &mut mpsc::UnboundedReceiver<AllocatorMsg>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let AllocatorMsg::Match(event) = msg {
                assert_eq!(event.camera_id, CameraId(1));
                out.push(event.plate.to_string());
            }
        }
        out
    }

    #[tokio::test]
    async fn test_every_region_processed_independently() {
        let detector = Arc::new(FixedDetector(vec![bbox(2.0, 0.9), bbox(30.0, 0.8)]));
        let reader = ScriptedReader::new(&[&["~~"], &["ab-12 cd", "ignored"]]);
        let mut rig = rig(frames(1), detector, reader, registered(&["AB12CD"]));

        assert_eq!(rig.worker.run().await, WorkerExit::Exhausted);
        assert_eq!(matched_plates(&mut rig.events_rx), vec!["AB12CD".to_string()]);

        let frame = rig.sink_rx.try_take().unwrap();
        assert_eq!(frame.sequence, 1);
        assert_eq!(frame.labels.len(), 2);
        assert_eq!(frame.labels[0].plate, None);
        assert!(!frame.labels[0].registered);
        assert_eq!(frame.labels[1].text, "ab-12 cd");
        assert!(frame.labels[1].registered);
        // Box outline drawn at the first region's corner
        assert_eq!(frame.image.get_pixel(2, 2), &BOX_COLOR);
    }

    #[tokio::test]
    async fn test_low_score_and_unregistered_produce_no_match() {
        let detector = Arc::new(FixedDetector(vec![bbox(2.0, 0.1), bbox(30.0, 0.9)]));
        let reader = ScriptedReader::new(&[&["XYZ999"]]);
        let mut rig = rig(frames(1), detector, reader, registered(&["AB12CD"]));

        rig.worker.run().await;
        assert!(matched_plates(&mut rig.events_rx).is_empty());

        let frame = rig.sink_rx.try_take().unwrap();
        assert_eq!(frame.labels.len(), 1);
        assert_eq!(frame.labels[0].plate, Plate::parse("XYZ999"));
        assert!(!frame.labels[0].registered);
    }

    #[tokio::test]
    async fn test_registry_failure_fails_open() {
        let detector = Arc::new(FixedDetector(vec![bbox(2.0, 0.9)]));
        let reader = ScriptedReader::new(&[&["AB12CD"], &["AB12CD"], &["AB12CD"]]);
        let mut rig = rig(frames(3), detector, reader, Arc::new(DownRegistry));

        assert_eq!(rig.worker.run().await, WorkerExit::Exhausted);
        assert!(matched_plates(&mut rig.events_rx).is_empty());

        let summary = rig.metrics.report();
        assert_eq!(summary.frames_total, 3);
        assert_eq!(summary.registry_failures_total, 3);
    }

    #[tokio::test]
    async fn test_detector_failure_still_publishes_frame() {
        let mut rig = rig(frames(1), Arc::new(BrokenDetector), ScriptedReader::new(&[]), registered(&[]));

        assert_eq!(rig.worker.run().await, WorkerExit::Exhausted);
        let frame = rig.sink_rx.try_take().unwrap();
        assert!(frame.labels.is_empty());
        assert_eq!(rig.metrics.report().vision_failures_total, 1);
    }

    #[tokio::test]
    async fn test_cancellation_checked_after_each_frame() {
        let detector = Arc::new(FixedDetector(Vec::new()));
        let rig = rig(frames(5), detector, ScriptedReader::new(&[]), registered(&[]));
        rig.cancel.cancel();

        assert_eq!(rig.worker.run().await, WorkerExit::Cancelled);
        // The in-flight frame completes before the token is observed
        let frame = rig.sink_rx.try_take().unwrap();
        assert_eq!(frame.sequence, 1);
        assert_eq!(rig.metrics.report().frames_total, 1);
    }

    #[tokio::test]
    async fn test_unconsumed_frames_are_overwritten() {
        let detector = Arc::new(FixedDetector(Vec::new()));
        let rig = rig(frames(4), detector, ScriptedReader::new(&[]), registered(&[]));

        rig.worker.run().await;
        assert_eq!(rig.sink_rx.try_take().unwrap().sequence, 4);
        assert!(rig.sink_rx.try_take().is_none());
        assert_eq!(rig.metrics.frames_dropped(), 3);
    }

    #[tokio::test]
    async fn test_worker_stops_when_allocator_gone() {
        let detector = Arc::new(FixedDetector(vec![bbox(2.0, 0.9)]));
        let reader = ScriptedReader::new(&[&["AB12CD"], &["AB12CD"]]);
        let rig = rig(frames(2), detector, reader, registered(&["AB12CD"]));
        drop(rig.events_rx);

        assert_eq!(rig.worker.run().await, WorkerExit::AllocatorStopped);
        assert_eq!(rig.sink_rx.try_take().unwrap().sequence, 1);
    }

    #[test]
    fn test_draw_box_clipped() {
        let mut image = RgbImage::new(10, 10);
        draw_box(&mut image, (6, 6, 10, 10));
        assert_eq!(image.get_pixel(6, 6), &BOX_COLOR);
        assert_eq!(image.get_pixel(9, 9), &BOX_COLOR);
        assert_eq!(image.get_pixel(0, 0), &Rgb([0, 0, 0]));
    }
}
