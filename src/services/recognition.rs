//! Recognition supervisor - owns the set of running camera sessions
//!
//! `start` spawns one worker per camera, each with its own cancellation
//! token and frame sink, and hands the display halves back to the caller.
//! `stop` cancels every token and joins every worker.

use crate::domain::types::CameraId;
use crate::io::video::VideoSource;
use crate::services::camera_worker::{CameraWorker, WorkerContext, WorkerExit};
use crate::services::display::DisplaySession;
use crate::services::frame_sink::frame_sink;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("recognition is already running ({0} camera sessions active)")]
    AlreadyRunning(usize),
}

struct WorkerSession {
    camera_id: CameraId,
    cancel: CancellationToken,
    handle: JoinHandle<WorkerExit>,
}

#[derive(Default)]
pub struct RecognitionSupervisor {
    sessions: Vec<WorkerSession>,
}

impl RecognitionSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of workers that have not finished yet
    pub fn running(&self) -> usize {
        self.sessions.iter().filter(|s| !s.handle.is_finished()).count()
    }

    /// Spawn a worker per camera source and return the display sessions
    pub fn start(
        &mut self,
        sources: Vec<(CameraId, Box<dyn VideoSource>)>,
        ctx: &WorkerContext,
    ) -> Result<Vec<DisplaySession>, SupervisorError> {
        let running = self.running();
        if running > 0 {
            return Err(SupervisorError::AlreadyRunning(running));
        }
        self.sessions.clear();

        let mut views = Vec::with_capacity(sources.len());
        for (camera_id, source) in sources {
            let cancel = CancellationToken::new();
            let (sink_tx, sink_rx) = frame_sink();
            let worker = CameraWorker::new(camera_id, source, ctx.clone(), sink_tx, cancel.clone());
            let handle = tokio::spawn(worker.run());

            self.sessions.push(WorkerSession { camera_id, cancel: cancel.clone(), handle });
            views.push(DisplaySession::new(camera_id, sink_rx, cancel));
        }

        let started = views.len();
        info!(cameras = %started, "recognition_started");
        Ok(views)
    }

    /// Cancel every session and wait for its worker to return
    pub async fn stop(&mut self) -> Vec<(CameraId, WorkerExit)> {
        for session in &self.sessions {
            session.cancel.cancel();
        }

        let mut exits = Vec::with_capacity(self.sessions.len());
        for session in self.sessions.drain(..) {
            match session.handle.await {
                Ok(exit) => exits.push((session.camera_id, exit)),
                Err(e) => error!(camera_id = %session.camera_id, error = %e, "camera_worker_join_failed"),
            }
        }

        info!(joined = %exits.len(), "recognition_stopped");
        exits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{Plate, PlateBox};
    use crate::infra::metrics::Metrics;
    use crate::io::registry::StaticRegistry;
    use crate::io::video::MemorySource;
    use crate::io::vision::{PlateDetector, PlateReader, VisionError};
    use crate::services::allocator::{allocator_channel, AllocatorMsg};
    use async_trait::async_trait;
    use image::RgbImage;
    use std::sync::Arc;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct NoPlates;

    #[async_trait]
    impl PlateDetector for NoPlates {
        async fn detect(&self, _frame: &RgbImage) -> Result<Vec<PlateBox>, VisionError> {
            Ok(Vec::new())
        }
    }

    #[async_trait]
    impl PlateReader for NoPlates {
        async fn recognize(&self, _crop: &RgbImage) -> Result<Vec<String>, VisionError> {
            Ok(Vec::new())
        }
    }

    /// Yields frames forever, so only cancellation ends it
    struct EndlessSource;

    #[async_trait]
    impl VideoSource for EndlessSource {
        async fn next_frame(&mut self) -> Option<RgbImage> {
            tokio::task::yield_now().await;
            Some(RgbImage::new(2, 2))
        }
    }

    fn context() -> (WorkerContext, UnboundedReceiver<AllocatorMsg>) {
        let (handle, rx) = allocator_channel();
        let ctx = WorkerContext {
            detector: Arc::new(NoPlates),
            reader: Arc::new(NoPlates),
            registry: Arc::new(StaticRegistry::new(Plate::parse("AB12"))),
            events: handle.event_sender(),
            metrics: Arc::new(Metrics::new()),
            min_score: 0.0,
        };
        (ctx, rx)
    }

    fn endless(ids: &[u32]) -> Vec<(CameraId, Box<dyn VideoSource>)> {
        ids.iter().map(|&id| (CameraId(id), Box::new(EndlessSource) as Box<dyn VideoSource>)).collect()
    }

    #[tokio::test]
    async fn test_start_refused_while_running() {
        let (ctx, _events) = context();
        let mut supervisor = RecognitionSupervisor::new();

        let sessions = supervisor.start(endless(&[1, 2]), &ctx).unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(
            supervisor.start(endless(&[3]), &ctx).err(),
            Some(SupervisorError::AlreadyRunning(2))
        );

        let exits = supervisor.stop().await;
        assert_eq!(exits.len(), 2);
        assert!(exits.iter().all(|(_, exit)| *exit == WorkerExit::Cancelled));
        assert_eq!(supervisor.running(), 0);
    }

    #[tokio::test]
    async fn test_restart_after_streams_end() {
        let (ctx, _events) = context();
        let mut supervisor = RecognitionSupervisor::new();

        let first = vec![(CameraId(1), Box::new(MemorySource::new([RgbImage::new(2, 2)])) as Box<dyn VideoSource>)];
        let sessions = supervisor.start(first, &ctx).unwrap();
        while supervisor.running() > 0 {
            tokio::task::yield_now().await;
        }
        let exits = supervisor.stop().await;
        assert_eq!(exits, vec![(CameraId(1), WorkerExit::Exhausted)]);
        drop(sessions);

        assert!(supervisor.start(endless(&[1]), &ctx).is_ok());
        supervisor.stop().await;
    }
}
