//! Video sources for camera workers
//!
//! A source yields frames until it is exhausted; exhaustion is the normal
//! end of a camera's stream. Dropping a source releases it.

use crate::domain::types::CameraId;
use async_trait::async_trait;
use image::RgbImage;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const FRAME_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

#[async_trait]
pub trait VideoSource: Send + Sync {
    /// Next frame, or `None` once the stream has ended
    async fn next_frame(&mut self) -> Option<RgbImage>;
}

/// Frames read from a directory of images in file-name order
pub struct ImageSequenceSource {
    camera_id: CameraId,
    files: VecDeque<PathBuf>,
}

impl ImageSequenceSource {
    pub fn open(camera_id: CameraId, dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let dir = dir.as_ref();
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| FRAME_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                    .unwrap_or(false)
            })
            .collect();
        files.sort();

        info!(camera_id = %camera_id, dir = %dir.display(), frames = %files.len(), "video_source_opened");
        Ok(Self { camera_id, files: files.into() })
    }

    pub fn remaining(&self) -> usize {
        self.files.len()
    }
}

#[async_trait]
impl VideoSource for ImageSequenceSource {
    async fn next_frame(&mut self) -> Option<RgbImage> {
        while let Some(path) = self.files.pop_front() {
            let decode_path = path.clone();
            let decoded =
                tokio::task::spawn_blocking(move || image::open(&decode_path).map(|i| i.to_rgb8()))
                    .await;

            match decoded {
                Ok(Ok(frame)) => return Some(frame),
                Ok(Err(e)) => {
                    warn!(camera_id = %self.camera_id, path = %path.display(), error = %e, "video_frame_unreadable");
                }
                Err(e) => {
                    warn!(camera_id = %self.camera_id, path = %path.display(), error = %e, "video_decode_task_failed");
                }
            }
        }
        None
    }
}

/// Frames held in memory, yielded in order
#[derive(Default)]
pub struct MemorySource {
    frames: VecDeque<RgbImage>,
}

impl MemorySource {
    pub fn new(frames: impl IntoIterator<Item = RgbImage>) -> Self {
        Self { frames: frames.into_iter().collect() }
    }
}

#[async_trait]
impl VideoSource for MemorySource {
    async fn next_frame(&mut self) -> Option<RgbImage> {
        self.frames.pop_front()
    }
}
