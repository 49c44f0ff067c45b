//! Configuration management for the frame scanner.
//!
//! Loaded from `config/default`, `config/{RUN_MODE}` and environment variables
//! prefixed with `SCANNER__` (e.g. `SCANNER__SCAN__LOG_DIR`). Cameras are
//! normally listed in the config files.

use crate::extractors::Roi;
use chrono::FixedOffset;
use config::{Config, ConfigError, Environment, File};
use packtrace_ledger::config::{parse_utc_offset, DatabaseConfig, LoggingConfig};
use packtrace_ledger::ConfigValidationError;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the scanner service.
#[derive(Debug, Clone, Deserialize)]
pub struct ScannerConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Datastore used to register segment logs
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Frame analysis configuration
    #[serde(default)]
    pub scan: ScanConfig,

    /// Packing stations
    #[serde(default)]
    pub cameras: Vec<CameraConfig>,

    /// Shutdown behaviour
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

/// Frame analysis configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ScanConfig {
    /// Frame rate assumed when the container does not report one
    #[serde(default = "default_sampling_fps")]
    pub sampling_fps: f64,

    /// Analyze every Nth decoded frame
    #[serde(default = "default_frame_interval")]
    pub frame_interval: u64,

    /// Minimum duration of a packing period, in seconds
    #[serde(default = "default_min_packing_time_secs")]
    pub min_packing_time_secs: f64,

    /// Normalized motion below which the station counts as calm
    #[serde(default = "default_motion_threshold")]
    pub motion_threshold: f64,

    /// Calm for at least this long marks a stable segment, in seconds
    #[serde(default = "default_min_stable_duration_secs")]
    pub min_stable_duration_secs: f64,

    /// Wall-clock length of one segment log, in seconds
    #[serde(default = "default_segment_secs")]
    pub segment_secs: u64,

    /// Code payload marking an idle station; never treated as a tracking code
    #[serde(default = "default_idle_code")]
    pub idle_code: String,

    /// Log an audit line for analyzed frames without any code reading
    #[serde(default = "default_audit_empty_frames")]
    pub audit_empty_frames: bool,

    /// Root directory for segment logs
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Directory layout under `log_dir`
    #[serde(default)]
    pub layout: LogLayout,

    /// UTC offset of the station clock (e.g. "+09:00")
    #[serde(default = "default_timezone")]
    pub timezone: String,

    /// Capacity of the segment writer queue
    #[serde(default = "default_writer_queue_size")]
    pub writer_queue_size: usize,
}

/// Where segment logs are placed under the log directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLayout {
    /// `<log_dir>/<camera>/<camera>_<stamp>.log`
    #[default]
    PerCamera,
    /// `<log_dir>/custom/<camera>_<stamp>.log`
    Flat,
}

/// Source of the hand presence signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceSource {
    /// Readings file written by an external hand detector.
    Sidecar,
    /// Motion inside the packing area.
    #[default]
    Motion,
}

/// One packing station camera.
#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    /// Camera name, written into every segment header
    pub name: String,

    /// Area where the worker handles items
    pub packing_roi: Roi,

    /// Area where codes are shown to the camera; defaults to the packing area
    #[serde(default)]
    pub trigger_roi: Option<Roi>,

    /// Hand presence source
    #[serde(default)]
    pub presence: PresenceSource,

    /// Directory holding `<video stem>.jsonl` detector readings
    #[serde(default)]
    pub readings_dir: Option<PathBuf>,

    /// Motion above which `presence = "motion"` reports a hand
    #[serde(default = "default_presence_motion_threshold")]
    pub presence_motion_threshold: f64,
}

/// Shutdown configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ShutdownConfig {
    /// Time given to in-flight scans after a shutdown signal
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,
}

// Default value functions
fn default_sampling_fps() -> f64 {
    30.0
}
fn default_frame_interval() -> u64 {
    5
}
fn default_min_packing_time_secs() -> f64 {
    5.0
}
fn default_motion_threshold() -> f64 {
    0.02
}
fn default_min_stable_duration_secs() -> f64 {
    2.0
}
fn default_segment_secs() -> u64 {
    300
}
fn default_idle_code() -> String {
    "IDLE".to_string()
}
fn default_audit_empty_frames() -> bool {
    true
}
fn default_log_dir() -> PathBuf {
    PathBuf::from("data/segments")
}
fn default_timezone() -> String {
    "+00:00".to_string()
}
fn default_writer_queue_size() -> usize {
    1024
}
fn default_presence_motion_threshold() -> f64 {
    0.08
}
fn default_grace_secs() -> u64 {
    5
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            sampling_fps: default_sampling_fps(),
            frame_interval: default_frame_interval(),
            min_packing_time_secs: default_min_packing_time_secs(),
            motion_threshold: default_motion_threshold(),
            min_stable_duration_secs: default_min_stable_duration_secs(),
            segment_secs: default_segment_secs(),
            idle_code: default_idle_code(),
            audit_empty_frames: default_audit_empty_frames(),
            log_dir: default_log_dir(),
            layout: LogLayout::default(),
            timezone: default_timezone(),
            writer_queue_size: default_writer_queue_size(),
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_secs: default_grace_secs(),
        }
    }
}

/// Validated scan parameters handed to the scanner and its workers.
#[derive(Debug, Clone)]
pub struct ScanSettings {
    pub sampling_fps: f64,
    pub frame_interval: u64,
    pub min_packing_time: f64,
    pub motion_threshold: f64,
    pub min_stable_duration: f64,
    pub segment_secs: i64,
    pub idle_code: String,
    pub audit_empty_frames: bool,
    pub log_dir: PathBuf,
    pub layout: LogLayout,
    pub timezone: FixedOffset,
}

impl ScannerConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Later sources override earlier ones:
    /// 1. `config/default`
    /// 2. `config/{RUN_MODE}`
    /// 3. Environment variables (prefixed with `SCANNER__`)
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            .add_source(
                Environment::with_prefix("SCANNER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        self.scan.settings()?;

        if self.database.path.is_empty() {
            return Err(ConfigValidationError::MissingField("database.path".to_string()));
        }

        for (i, camera) in self.cameras.iter().enumerate() {
            if camera.name.trim().is_empty() {
                return Err(ConfigValidationError::MissingField(format!("cameras[{}].name", i)));
            }
            if camera.name.contains(&['/', '\\', ','][..]) {
                return Err(ConfigValidationError::InvalidValue {
                    field: format!("cameras[{}].name", i),
                    message: "must not contain path separators or commas".to_string(),
                });
            }
            if camera.packing_roi.is_empty() {
                return Err(ConfigValidationError::InvalidValue {
                    field: format!("cameras[{}].packing_roi", i),
                    message: "width and height must be greater than 0".to_string(),
                });
            }
            if camera.presence == PresenceSource::Sidecar && camera.readings_dir.is_none() {
                return Err(ConfigValidationError::MissingField(format!(
                    "cameras[{}].readings_dir",
                    i
                )));
            }
            if self.cameras[..i].iter().any(|c| c.name == camera.name) {
                return Err(ConfigValidationError::InvalidValue {
                    field: format!("cameras[{}].name", i),
                    message: format!("duplicate camera '{}'", camera.name),
                });
            }
        }

        Ok(())
    }

    pub fn camera(&self, name: &str) -> Option<&CameraConfig> {
        self.cameras.iter().find(|c| c.name == name)
    }
}

impl ScanConfig {
    /// Check the values and build the settings object.
    pub fn settings(&self) -> Result<ScanSettings, ConfigValidationError> {
        if self.sampling_fps <= 0.0 {
            return Err(invalid("scan.sampling_fps", "must be greater than 0"));
        }
        if self.frame_interval == 0 {
            return Err(invalid("scan.frame_interval", "must be at least 1"));
        }
        if self.min_packing_time_secs <= 0.0 {
            return Err(invalid("scan.min_packing_time_secs", "must be greater than 0"));
        }
        if !(0.0..=1.0).contains(&self.motion_threshold) {
            return Err(invalid("scan.motion_threshold", "must be within [0, 1]"));
        }
        if self.min_stable_duration_secs < 0.0 {
            return Err(invalid("scan.min_stable_duration_secs", "must not be negative"));
        }
        if self.segment_secs == 0 {
            return Err(invalid("scan.segment_secs", "must be greater than 0"));
        }
        if self.writer_queue_size == 0 {
            return Err(invalid("scan.writer_queue_size", "must be greater than 0"));
        }
        let timezone = parse_utc_offset(&self.timezone).ok_or_else(|| {
            invalid(
                "scan.timezone",
                &format!("'{}' is not a UTC offset like +09:00", self.timezone),
            )
        })?;

        Ok(ScanSettings {
            sampling_fps: self.sampling_fps,
            frame_interval: self.frame_interval,
            min_packing_time: self.min_packing_time_secs,
            motion_threshold: self.motion_threshold,
            min_stable_duration: self.min_stable_duration_secs,
            segment_secs: self.segment_secs as i64,
            idle_code: self.idle_code.trim().to_string(),
            audit_empty_frames: self.audit_empty_frames,
            log_dir: self.log_dir.clone(),
            layout: self.layout,
            timezone,
        })
    }
}

impl ShutdownConfig {
    /// Get the grace period as Duration.
    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }
}

fn invalid(field: &str, message: &str) -> ConfigValidationError {
    ConfigValidationError::InvalidValue {
        field: field.to_string(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_config() -> ScannerConfig {
        ScannerConfig {
            logging: LoggingConfig::default(),
            database: DatabaseConfig::default(),
            scan: ScanConfig::default(),
            cameras: vec![CameraConfig {
                name: "cam-01".to_string(),
                packing_roi: Roi::new(0, 0, 320, 240),
                trigger_roi: Some(Roi::new(100, 100, 80, 80)),
                presence: PresenceSource::Motion,
                readings_dir: None,
                presence_motion_threshold: 0.1,
            }],
            shutdown: ShutdownConfig::default(),
        }
    }

    #[test]
    fn test_valid_config() {
        let config = create_test_config();
        assert!(config.validate().is_ok());
        assert!(config.camera("cam-01").is_some());
    }

    #[test]
    fn test_empty_packing_roi() {
        let mut config = create_test_config();
        config.cameras[0].packing_roi = Roi::new(10, 10, 0, 50);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sidecar_presence_needs_readings_dir() {
        let mut config = create_test_config();
        config.cameras[0].presence = PresenceSource::Sidecar;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::MissingField(_))
        ));
    }

    #[test]
    fn test_duplicate_camera() {
        let mut config = create_test_config();
        let copy = config.cameras[0].clone();
        config.cameras.push(copy);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_frame_interval() {
        let mut config = create_test_config();
        config.scan.frame_interval = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_settings_from_defaults() {
        let settings = ScanConfig::default().settings().unwrap();
        assert_eq!(settings.segment_secs, 300);
        assert_eq!(settings.layout, LogLayout::PerCamera);
        assert_eq!(settings.timezone.local_minus_utc(), 0);
        assert_eq!(ShutdownConfig::default().grace(), Duration::from_secs(5));
    }

    #[test]
    fn test_layout_deserialize() {
        let layout: LogLayout = serde_json::from_str("\"flat\"").unwrap();
        assert_eq!(layout, LogLayout::Flat);
    }
}
