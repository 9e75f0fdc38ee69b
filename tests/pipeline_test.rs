//! End-to-end pipeline: camera workers -> allocator -> slot file + gate bytes

use async_trait::async_trait;
use image::{Rgb, RgbImage};
use parkgate::domain::types::{CameraId, Plate, PlateBox, SlotNumber, SlotStatus};
use parkgate::infra::Metrics;
use parkgate::io::{
    JsonRegistry, JsonSlotStore, MemorySource, PlateDetector, PlateReader, User, VideoSource, VisionError,
};
use parkgate::services::allocator::ReleaseOutcome;
use parkgate::services::{
    allocator_channel, create_gate_worker, DisplayScheduler, HeadlessRenderer, RecognitionSupervisor,
    ShutdownInput, SlotAllocator, WorkerContext, WorkerExit,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

/// Plate text per frame "color"; the red channel indexes this table
const PLATES: [&str; 3] = ["ab-12 cd", "XY 34 ZZ", "NOPE 99"];

struct CenterBox;

#[async_trait]
impl PlateDetector for CenterBox {
    async fn detect(&self, _frame: &RgbImage) -> Result<Vec<PlateBox>, VisionError> {
        Ok(vec![PlateBox { x1: 4.0, y1: 4.0, x2: 28.0, y2: 12.0, score: 0.9 }])
    }
}

struct ColorReader;

#[async_trait]
impl PlateReader for ColorReader {
    async fn recognize(&self, crop: &RgbImage) -> Result<Vec<String>, VisionError> {
        let index = crop.get_pixel(0, 0)[0] as usize;
        Ok(PLATES.get(index).map(|p| vec![p.to_string()]).unwrap_or_default())
    }
}

fn frames(plates: &[u8]) -> Box<dyn VideoSource> {
    Box::new(MemorySource::new(plates.iter().map(|&i| RgbImage::from_pixel(32, 16, Rgb([i, 0, 0])))))
}

fn user(first: &str, plate: &str) -> User {
    User { first_name: first.into(), last_name: "Driver".into(), age: None, plate_number: plate.into() }
}

#[tokio::test]
async fn test_cameras_to_gate_end_to_end() {
    let dir = TempDir::new().unwrap();
    let slot_file = dir.path().join("parking_info.json");

    let registry = JsonRegistry::new(dir.path().join("users.json"));
    registry.register(user("Ada", "AB12CD")).unwrap();
    registry.register(user("Xia", "xy34zz")).unwrap();

    let metrics = Arc::new(Metrics::new());
    let store = JsonSlotStore::open(&slot_file, 2).unwrap();

    let (link, mut device) = tokio::io::duplex(1024);
    let (gate, gate_worker) = create_gate_worker(Some(link), metrics.clone(), 16);
    let gate_task = tokio::spawn(gate_worker.run());

    let (handle, allocator_rx) = allocator_channel();
    let allocator = SlotAllocator::new(store, gate, 2, metrics.clone());
    let table_rx = allocator.subscribe();
    let allocator_task = tokio::spawn(allocator.run(allocator_rx));

    let ctx = WorkerContext {
        detector: Arc::new(CenterBox),
        reader: Arc::new(ColorReader),
        registry: Arc::new(registry),
        events: handle.event_sender(),
        metrics: metrics.clone(),
        min_score: 0.5,
    };
    let mut supervisor = RecognitionSupervisor::new();
    let sources = vec![(CameraId(1), frames(&[0, 0, 1])), (CameraId(2), frames(&[1, 2]))];
    let sessions = supervisor.start(sources, &ctx).unwrap();
    drop(ctx);

    // Display ends once both streams are exhausted
    let scheduler = DisplayScheduler::new(
        sessions,
        HeadlessRenderer::default(),
        ShutdownInput::new(CancellationToken::new()),
        handle.clone(),
        table_rx,
    );
    scheduler.run(Duration::from_millis(5), Duration::from_secs(1)).await;

    let mut exits = supervisor.stop().await;
    exits.sort_by_key(|(id, _)| *id);
    assert_eq!(exits, vec![(CameraId(1), WorkerExit::Exhausted), (CameraId(2), WorkerExit::Exhausted)]);

    // Release is queued behind every match, so it sees the final assignment
    let outcome = handle.release(SlotNumber(1)).await.unwrap();
    assert_eq!(
        outcome,
        ReleaseOutcome::Released { slot: SlotNumber(1), previous: Plate::parse("AB12CD") }
    );

    drop(handle);
    allocator_task.await.unwrap();
    gate_task.await.unwrap();

    let mut sent = String::new();
    device.read_to_string(&mut sent).await.unwrap();
    let lines: Vec<&str> = sent.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[..2].contains(&"1:OPEN"));
    assert!(lines[..2].contains(&"2:OPEN"));
    assert_eq!(lines[2], "1:CLOSE");

    let table = JsonSlotStore::read_table(&slot_file).unwrap();
    assert_eq!(table.len(), 2);
    assert_eq!(table[0].status(), SlotStatus::Empty);
    assert_eq!(table[1].plate(), Plate::parse("XY34ZZ").as_ref());

    let summary = metrics.report();
    assert_eq!(summary.frames_total, 5);
    assert_eq!(summary.matches_enqueued_total, 4);
    assert_eq!(summary.slots_assigned_total, 2);
    assert_eq!(summary.repeats_total, 1);
    // Camera 1's XY34ZZ lands either before or after camera 2 claims it
    assert_eq!(summary.rejected_duplicate_total + summary.rejected_contention_total, 1);
    assert_eq!(summary.releases_total, 1);
    assert_eq!(summary.gate_commands_sent, 3);
}

#[tokio::test]
async fn test_plate_seen_by_second_camera_is_not_double_parked() {
    let dir = TempDir::new().unwrap();
    let slot_file = dir.path().join("parking_info.json");
    let metrics = Arc::new(Metrics::new());

    let (link, mut device) = tokio::io::duplex(256);
    let (gate, gate_worker) = create_gate_worker(Some(link), metrics.clone(), 16);
    let gate_task = tokio::spawn(gate_worker.run());

    let (handle, allocator_rx) = allocator_channel();
    let allocator = SlotAllocator::new(JsonSlotStore::open(&slot_file, 2).unwrap(), gate, 2, metrics.clone());
    let allocator_task = tokio::spawn(allocator.run(allocator_rx));

    let ctx = WorkerContext {
        detector: Arc::new(CenterBox),
        reader: Arc::new(ColorReader),
        registry: Arc::new(parkgate::io::StaticRegistry::new(Plate::parse("AB12CD"))),
        events: handle.event_sender(),
        metrics: metrics.clone(),
        min_score: 0.0,
    };
    let mut supervisor = RecognitionSupervisor::new();
    let sessions = supervisor
        .start(vec![(CameraId(1), frames(&[0, 0])), (CameraId(2), frames(&[0, 0]))], &ctx)
        .unwrap();
    drop(ctx);
    drop(sessions);

    while supervisor.running() > 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    supervisor.stop().await;
    drop(handle);
    allocator_task.await.unwrap();
    gate_task.await.unwrap();

    // Whichever camera won, the plate holds exactly one slot
    let table = JsonSlotStore::read_table(&slot_file).unwrap();
    let held: Vec<_> = table.iter().filter(|s| s.status() == SlotStatus::Occupied).collect();
    assert_eq!(held.len(), 1);

    let mut sent = String::new();
    device.read_to_string(&mut sent).await.unwrap();
    assert_eq!(sent, format!("{}:OPEN\n", held[0].slot_number));

    let summary = metrics.report();
    assert_eq!(summary.slots_assigned_total, 1);
    assert_eq!(summary.repeats_total + summary.rejected_duplicate_total, 3);
}
