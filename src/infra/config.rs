//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/parkgate.toml

use crate::domain::types::CameraId;
use anyhow::Context;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

const DEFAULT_CONFIG_PATH: &str = "config/parkgate.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    /// Unique site identifier, used as the metrics label
    #[serde(default = "default_site_id")]
    pub id: String,
}

fn default_site_id() -> String {
    "parkgate".to_string()
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self { id: default_site_id() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ParkingConfig {
    #[serde(default = "default_max_slots")]
    pub max_slots: u32,
    /// Persisted slot table (JSON)
    #[serde(default = "default_slot_file")]
    pub slot_file: String,
}

fn default_max_slots() -> u32 {
    2
}

fn default_slot_file() -> String {
    "parking_info.json".to_string()
}

impl Default for ParkingConfig {
    fn default() -> Self {
        Self { max_slots: default_max_slots(), slot_file: default_slot_file() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// Registered users (JSON array)
    #[serde(default = "default_registry_file")]
    pub file: String,
}

fn default_registry_file() -> String {
    "users.json".to_string()
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self { file: default_registry_file() }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct CameraConfig {
    pub id: u32,
    /// Directory of frame images, read in file-name order
    pub source: String,
}

fn default_cameras() -> Vec<CameraConfig> {
    vec![
        CameraConfig { id: 1, source: "video/cam1".to_string() },
        CameraConfig { id: 2, source: "video/cam2".to_string() },
    ]
}

#[derive(Debug, Clone, Deserialize)]
pub struct VisionConfig {
    #[serde(default = "default_detect_url")]
    pub detect_url: String,
    #[serde(default = "default_ocr_url")]
    pub ocr_url: String,
    #[serde(default = "default_vision_timeout_ms")]
    pub timeout_ms: u64,
    /// Detections scoring below this are ignored
    #[serde(default)]
    pub min_score: f32,
}

fn default_detect_url() -> String {
    "http://127.0.0.1:8500/detect".to_string()
}

fn default_ocr_url() -> String {
    "http://127.0.0.1:8500/ocr".to_string()
}

fn default_vision_timeout_ms() -> u64 {
    5000
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            detect_url: default_detect_url(),
            ocr_url: default_ocr_url(),
            timeout_ms: default_vision_timeout_ms(),
            min_score: 0.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GateConfig {
    #[serde(default = "default_gate_device")]
    pub device: String,
    #[serde(default = "default_gate_baud")]
    pub baud: u32,
    #[serde(default = "default_gate_queue_size")]
    pub queue_size: usize,
}

fn default_gate_device() -> String {
    "/dev/ttyACM0".to_string()
}

fn default_gate_baud() -> u32 {
    9600
}

fn default_gate_queue_size() -> usize {
    64
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            device: default_gate_device(),
            baud: default_gate_baud(),
            queue_size: default_gate_queue_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DisplayConfig {
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Periodic slot table re-render, on top of change notifications
    #[serde(default = "default_refresh_secs")]
    pub refresh_secs: u64,
    /// Headless mode writes the latest annotated frame per camera here
    #[serde(default)]
    pub snapshot_dir: Option<String>,
}

fn default_tick_ms() -> u64 {
    30
}

fn default_refresh_secs() -> u64 {
    5
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self { tick_ms: default_tick_ms(), refresh_secs: default_refresh_secs(), snapshot_dir: None }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
    /// Prometheus metrics HTTP port (0 to disable)
    #[serde(default)]
    pub prometheus_port: u16,
}

fn default_metrics_interval() -> u64 {
    10
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval(), prometheus_port: 0 }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    /// Log file; when unset logs go to stderr
    #[serde(default)]
    pub file: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub parking: ParkingConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default = "default_cameras")]
    pub cameras: Vec<CameraConfig>,
    #[serde(default)]
    pub vision: VisionConfig,
    #[serde(default)]
    pub gate: GateConfig,
    #[serde(default)]
    pub display: DisplayConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    max_slots: u32,
    slot_file: PathBuf,
    registry_file: PathBuf,
    cameras: Vec<CameraConfig>,
    detect_url: String,
    ocr_url: String,
    vision_timeout_ms: u64,
    min_score: f32,
    gate_device: String,
    gate_baud: u32,
    gate_queue_size: usize,
    tick_ms: u64,
    refresh_secs: u64,
    snapshot_dir: Option<PathBuf>,
    metrics_interval_secs: u64,
    prometheus_port: u16,
    log_file: Option<PathBuf>,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig { cameras: default_cameras(), ..Default::default() }, "default")
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig, config_file: &str) -> Self {
        Self {
            site_id: toml_config.site.id,
            // Slot numbers start at 1, so at least one slot must exist
            max_slots: toml_config.parking.max_slots.max(1),
            slot_file: PathBuf::from(toml_config.parking.slot_file),
            registry_file: PathBuf::from(toml_config.registry.file),
            cameras: toml_config.cameras,
            detect_url: toml_config.vision.detect_url,
            ocr_url: toml_config.vision.ocr_url,
            vision_timeout_ms: toml_config.vision.timeout_ms,
            min_score: toml_config.vision.min_score,
            gate_device: toml_config.gate.device,
            gate_baud: toml_config.gate.baud,
            gate_queue_size: toml_config.gate.queue_size.max(1),
            tick_ms: toml_config.display.tick_ms.max(1),
            refresh_secs: toml_config.display.refresh_secs,
            snapshot_dir: toml_config.display.snapshot_dir.map(PathBuf::from),
            metrics_interval_secs: toml_config.metrics.interval_secs.max(1),
            prometheus_port: toml_config.metrics.prometheus_port,
            log_file: toml_config.logging.file.map(PathBuf::from),
            config_file: config_file.to_string(),
        }
    }

    /// Config file path when `--config` is not given: `CONFIG_FILE`, then the default
    pub fn default_config_path() -> String {
        env::var("CONFIG_FILE").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string())
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Ok(Self::from_toml(toml_config, &path.display().to_string()))
    }

    /// Load configuration from a path, falling back to defaults on error
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "config_load_failed_using_defaults");
                Self::default()
            }
        }
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn max_slots(&self) -> u32 {
        self.max_slots
    }

    pub fn slot_file(&self) -> &Path {
        &self.slot_file
    }

    pub fn registry_file(&self) -> &Path {
        &self.registry_file
    }

    pub fn cameras(&self) -> &[CameraConfig] {
        &self.cameras
    }

    pub fn camera_ids(&self) -> Vec<CameraId> {
        self.cameras.iter().map(|c| CameraId(c.id)).collect()
    }

    pub fn detect_url(&self) -> &str {
        &self.detect_url
    }

    pub fn ocr_url(&self) -> &str {
        &self.ocr_url
    }

    pub fn vision_timeout_ms(&self) -> u64 {
        self.vision_timeout_ms
    }

    pub fn min_score(&self) -> f32 {
        self.min_score
    }

    pub fn gate_device(&self) -> &str {
        &self.gate_device
    }

    pub fn gate_baud(&self) -> u32 {
        self.gate_baud
    }

    pub fn gate_queue_size(&self) -> usize {
        self.gate_queue_size
    }

    pub fn tick_ms(&self) -> u64 {
        self.tick_ms
    }

    pub fn refresh_secs(&self) -> u64 {
        self.refresh_secs
    }

    pub fn snapshot_dir(&self) -> Option<&Path> {
        self.snapshot_dir.as_deref()
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn prometheus_port(&self) -> u16 {
        self.prometheus_port
    }

    pub fn log_file(&self) -> Option<&Path> {
        self.log_file.as_deref()
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }
}
