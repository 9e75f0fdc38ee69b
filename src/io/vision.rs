//! Plate detection and text recognition capabilities
//!
//! Both engines are external. Camera workers only see the two traits; the
//! `HttpVision` client talks to an inference sidecar over JSON:
//! - `POST detect_url` `{"image": <base64 JPEG>}` -> `[{"x1":..,"y1":..,"x2":..,"y2":..,"score":..}]`
//! - `POST ocr_url` `{"image": <base64 JPEG>}` -> `{"lines": ["..", ..]}`

use crate::domain::types::PlateBox;
use crate::infra::config::Config;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use image::{ImageFormat, RgbImage};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum VisionError {
    #[error("vision request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("vision service returned status {0}")]
    Status(u16),

    #[error("vision response malformed: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("image encoding failed: {0}")]
    Encode(#[from] image::ImageError),

    #[error("image encoding task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Finds plate regions in a full frame
#[async_trait]
pub trait PlateDetector: Send + Sync {
    async fn detect(&self, frame: &RgbImage) -> Result<Vec<PlateBox>, VisionError>;
}

/// Reads text lines from a cropped plate image
#[async_trait]
pub trait PlateReader: Send + Sync {
    async fn recognize(&self, crop: &RgbImage) -> Result<Vec<String>, VisionError>;
}

/// First recognized line, trimmed. Later lines are ignored.
pub fn first_line(lines: &[String]) -> &str {
    lines.first().map(|l| l.trim()).unwrap_or("")
}

#[derive(Serialize)]
struct ImageRequest {
    image: String,
}

#[derive(Deserialize)]
struct OcrResponse {
    #[serde(default)]
    lines: Vec<String>,
}

fn encode_jpeg(image: &RgbImage) -> Result<String, VisionError> {
    let mut buf = Vec::new();
    image.write_to(&mut Cursor::new(&mut buf), ImageFormat::Jpeg)?;
    Ok(STANDARD.encode(&buf))
}

/// JPEG encoding is CPU-bound; run it off the async worker threads
async fn encode_jpeg_blocking(image: &RgbImage) -> Result<String, VisionError> {
    let image = image.clone();
    tokio::task::spawn_blocking(move || encode_jpeg(&image)).await?
}

/// HTTP client for a detection/OCR sidecar
pub struct HttpVision {
    client: reqwest::Client,
    detect_url: String,
    ocr_url: String,
}

impl HttpVision {
    pub fn new(config: &Config) -> Result<Self, VisionError> {
        // Create HTTP client once for reuse (connection pooling)
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.vision_timeout_ms()))
            .build()?;
        Ok(Self {
            client,
            detect_url: config.detect_url().to_string(),
            ocr_url: config.ocr_url().to_string(),
        })
    }

    async fn post_image(&self, url: &str, image: &RgbImage) -> Result<bytes::Bytes, VisionError> {
        let body = serde_json::to_vec(&ImageRequest { image: encode_jpeg_blocking(image).await? })?;
        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(VisionError::Status(status.as_u16()));
        }
        Ok(response.bytes().await?)
    }
}

#[async_trait]
impl PlateDetector for HttpVision {
    async fn detect(&self, frame: &RgbImage) -> Result<Vec<PlateBox>, VisionError> {
        let bytes = self.post_image(&self.detect_url, frame).await?;
        let boxes: Vec<PlateBox> = serde_json::from_slice(&bytes)?;
        debug!(boxes = %boxes.len(), "vision_detect_response");
        Ok(boxes)
    }
}

#[async_trait]
impl PlateReader for HttpVision {
    async fn recognize(&self, crop: &RgbImage) -> Result<Vec<String>, VisionError> {
        let bytes = self.post_image(&self.ocr_url, crop).await?;
        let response: OcrResponse = serde_json::from_slice(&bytes)?;
        Ok(response.lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_line_trimmed() {
        let lines = vec!["  AB 123 \n".to_string(), "IND".to_string()];
        assert_eq!(first_line(&lines), "AB 123");
        assert_eq!(first_line(&[]), "");
    }

    #[test]
    fn test_detect_response_parses() {
        let boxes: Vec<PlateBox> =
            serde_json::from_str(r#"[{"x1": 1.5, "y1": 2, "x2": 30, "y2": 12, "score": 0.87}]"#)
                .unwrap();
        assert_eq!(boxes.len(), 1);
        assert_eq!(boxes[0].x1, 1.5);
        assert_eq!(boxes[0].score, 0.87);
    }

    #[test]
    fn test_ocr_response_defaults_to_no_lines() {
        let response: OcrResponse = serde_json::from_str("{}").unwrap();
        assert!(response.lines.is_empty());
    }

    #[tokio::test]
    async fn test_blocking_encode_matches_inline() {
        let image = RgbImage::from_pixel(16, 8, image::Rgb([200, 30, 30]));
        let encoded = encode_jpeg_blocking(&image).await.unwrap();
        assert_eq!(encoded, encode_jpeg(&image).unwrap());
    }

    #[test]
    fn test_encode_jpeg_is_base64() {
        let image = RgbImage::new(8, 8);
        let encoded = encode_jpeg(&image).unwrap();
        let decoded = STANDARD.decode(encoded).unwrap();
        // JPEG SOI marker
        assert_eq!(&decoded[..2], &[0xFF, 0xD8]);
    }
}
