//! Configuration using Figment
//!
//! Configuration is layered, later sources overriding earlier ones:
//! 1. Built-in defaults (the rig's usual settings)
//! 2. `config/calcium_daq.toml`
//! 3. Environment variables prefixed with `CALCIUM_DAQ_`, nested keys split
//!    on `__` (e.g. `CALCIUM_DAQ_STIMULATOR__PORT=COM3`)
//!
//! # Example
//! ```no_run
//! use calcium_daq::config::AppConfig;
//!
//! let config = AppConfig::load()?;
//! config.validate()?;
//! let plan = config.plan.to_plan()?;
//! # Ok::<(), calcium_daq::error::DaqError>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::acquisition::preview::{DisplayAdjust, PreviewRate};
use crate::error::{DaqError, DaqResult};
use crate::experiment::plan::{AcquisitionMode, ExperimentPlan};
use crate::hardware::Roi;
use crate::logging::OutputFormat;
use crate::stimulus::{PulseMode, PulseSpec};

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/calcium_daq.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "CALCIUM_DAQ_";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Camera setup
    pub camera: CameraSettings,
    /// Stimulator serial link
    pub stimulator: StimulatorConfig,
    /// Output location and writer queue
    pub storage: StorageConfig,
    /// Live preview
    pub preview: PreviewConfig,
    /// Experiment timing
    pub plan: PlanSettings,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "calcium-daq".to_string(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

/// Camera configuration applied before acquisition starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraSettings {
    /// Exposure time in milliseconds
    pub exposure_ms: f64,
    /// Readout region; `None` keeps the full sensor
    pub roi: Option<Roi>,
    /// Properties applied once at configuration
    pub properties: BTreeMap<String, String>,
    /// Properties applied when an experiment run starts
    pub run_properties: BTreeMap<String, String>,
    /// Properties applied when an experiment run ends
    pub idle_properties: BTreeMap<String, String>,
}

impl Default for CameraSettings {
    fn default() -> Self {
        let properties = [
            ("CircularBufferEnabled", "ON"),
            ("CircularBufferFrameCount", "2000"),
            ("ClearMode", "Pre-Sequence"),
            ("ClearCycles", "2"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self {
            exposure_ms: 10.0,
            roi: Some(Roi::new(600, 600)),
            properties,
            run_properties: BTreeMap::from([("ClearMode".to_string(), "Never".to_string())]),
            idle_properties: BTreeMap::from([(
                "ClearMode".to_string(),
                "Pre-Exposure".to_string(),
            )]),
        }
    }
}

/// Stimulator serial link
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StimulatorConfig {
    /// Whether pulses are sent at all
    pub enabled: bool,
    /// Serial port name (e.g. `COM5`, `/dev/ttyACM0`)
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
}

impl Default for StimulatorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: "COM5".to_string(),
            baud_rate: 115_200,
        }
    }
}

/// Output location and writer queue
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory for sessions
    pub base_dir: PathBuf,
    /// Experiment name (second path level)
    pub experiment: String,
    /// Subject name (session folder prefix and batch file stem)
    pub subject: String,
    /// Jobs that may be pending before submission waits
    pub queue_depth: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("data"),
            experiment: "experiment".to_string(),
            subject: "subject".to_string(),
            queue_depth: crate::storage::DEFAULT_QUEUE_DEPTH,
        }
    }
}

/// Live preview
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreviewConfig {
    /// Refresh rate: 5, 10, 15, 30 or 60
    pub fps: u32,
    /// Brightness slider, -100..=100
    pub brightness: i32,
    /// Contrast slider in percent, 10..=300
    pub contrast_percent: i32,
    /// Display zoom factor
    pub zoom: f64,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            fps: 30,
            brightness: 0,
            contrast_percent: 100,
            zoom: 1.0,
        }
    }
}

impl PreviewConfig {
    /// Selected refresh rate.
    pub fn rate(&self) -> DaqResult<PreviewRate> {
        PreviewRate::from_fps(self.fps)
    }

    /// Display adjustment from the slider positions.
    pub fn adjust(&self) -> DisplayAdjust {
        DisplayAdjust::from_sliders(self.brightness, self.contrast_percent).with_zoom(self.zoom)
    }
}

/// Which acquisition mode a plan uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanMode {
    /// Capture windows separated by rest periods
    Burst,
    /// Periodic snaps written in batches and merged
    FixedInterval,
}

/// Stimulus settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PulseSettings {
    /// Whether to stimulate
    pub enabled: bool,
    /// `single` or `train`
    pub mode: PulseMode,
    /// Train frequency in Hz
    pub frequency_hz: f64,
    /// Train duration in milliseconds
    pub duration_ms: f64,
    /// Delay from window start in seconds
    pub delay_secs: f64,
}

impl Default for PulseSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: PulseMode::Single,
            frequency_hz: 40.0,
            duration_ms: 300.0,
            delay_secs: 1.0,
        }
    }
}

/// Experiment timing as written in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanSettings {
    /// Acquisition mode
    pub mode: PlanMode,
    /// Total experiment duration in seconds
    pub total_secs: f64,
    /// Burst capture window in seconds
    pub window_secs: f64,
    /// Burst rest period in seconds
    pub rest_secs: f64,
    /// Fixed-interval snap spacing in seconds
    pub interval_secs: f64,
    /// Fixed-interval snaps per batch file
    pub batch_size: usize,
    /// Camera frame rate
    pub target_fps: f64,
    /// Stimulus
    pub pulse: PulseSettings,
}

impl Default for PlanSettings {
    fn default() -> Self {
        Self {
            mode: PlanMode::Burst,
            total_secs: 300.0,
            window_secs: 2.0,
            rest_secs: 8.0,
            interval_secs: 10.0,
            batch_size: 10,
            target_fps: 30.0,
            pulse: PulseSettings::default(),
        }
    }
}

fn secs(name: &str, value: f64) -> DaqResult<Duration> {
    Duration::try_from_secs_f64(value).map_err(|_| {
        DaqError::Config(format!(
            "{} must be a non-negative number of seconds, got {}",
            name, value
        ))
    })
}

impl PlanSettings {
    /// Build the validated experiment plan.
    pub fn to_plan(&self) -> DaqResult<ExperimentPlan> {
        let total = secs("plan.total_secs", self.total_secs)?;
        let mode = match self.mode {
            PlanMode::Burst => AcquisitionMode::Burst {
                total,
                window: secs("plan.window_secs", self.window_secs)?,
                rest: secs("plan.rest_secs", self.rest_secs)?,
            },
            PlanMode::FixedInterval => AcquisitionMode::FixedInterval {
                total,
                interval: secs("plan.interval_secs", self.interval_secs)?,
                batch_size: self.batch_size,
            },
        };

        let pulse = if self.pulse.enabled {
            let delay = secs("plan.pulse.delay_secs", self.pulse.delay_secs)?;
            Some(match self.pulse.mode {
                PulseMode::Single => PulseSpec::single(delay),
                PulseMode::Train => PulseSpec::train(
                    self.pulse.frequency_hz,
                    secs("plan.pulse.duration_ms", self.pulse.duration_ms / 1000.0)?,
                    delay,
                ),
            })
        } else {
            None
        };

        ExperimentPlan::new(mode, pulse, self.target_fps)
    }
}

impl AppConfig {
    /// Load from the default file and the environment.
    pub fn load() -> DaqResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file (missing files are skipped) and the environment.
    pub fn load_from<P: AsRef<Path>>(path: P) -> DaqResult<Self> {
        let config = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> DaqResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(DaqError::Config(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        self.application
            .log_format
            .parse::<OutputFormat>()
            .map_err(DaqError::Config)?;

        if !(self.camera.exposure_ms.is_finite() && self.camera.exposure_ms > 0.0) {
            return Err(DaqError::Config(format!(
                "Invalid camera.exposure_ms {}. Must be positive",
                self.camera.exposure_ms
            )));
        }

        if self.stimulator.enabled {
            if self.stimulator.port.trim().is_empty() {
                return Err(DaqError::Config("stimulator.port is empty".into()));
            }
            if self.stimulator.baud_rate == 0 {
                return Err(DaqError::Config("stimulator.baud_rate must be positive".into()));
            }
        }

        if self.storage.queue_depth == 0 {
            return Err(DaqError::Config("storage.queue_depth must be at least 1".into()));
        }
        if self.storage.subject.trim().is_empty() {
            return Err(DaqError::Config("storage.subject is empty".into()));
        }

        self.preview.rate()?;
        self.plan.to_plan()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_validate() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.plan.to_plan().unwrap().window_count(), 30);
    }

    #[test]
    fn test_load_from_toml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("calcium_daq.toml");
        std::fs::write(
            &path,
            r#"
[stimulator]
port = "/dev/ttyACM0"

[storage]
subject = "m42"
queue_depth = 16

[plan]
mode = "fixed_interval"
total_secs = 60
interval_secs = 2
batch_size = 5

[plan.pulse]
mode = "train"
frequency_hz = 20
"#,
        )
        .unwrap();

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.stimulator.port, "/dev/ttyACM0");
        assert_eq!(config.stimulator.baud_rate, 115_200);
        assert_eq!(config.storage.subject, "m42");
        assert_eq!(config.storage.queue_depth, 16);
        assert_eq!(config.camera.properties.get("ClearMode").unwrap(), "Pre-Sequence");

        let plan = config.plan.to_plan().unwrap();
        assert_eq!(plan.window_count(), 30);
        assert_eq!(plan.pulse().unwrap().pulse_count(), 6);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = AppConfig::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.application.name, "calcium-daq");
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = AppConfig::default();
        config.application.log_level = "loud".to_string();
        assert!(matches!(config.validate(), Err(DaqError::Config(_))));
    }

    #[test]
    fn test_negative_duration_rejected() {
        let mut config = AppConfig::default();
        config.plan.rest_secs = -1.0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("plan.rest_secs"));
    }

    #[test]
    fn test_zero_queue_depth_rejected() {
        let mut config = AppConfig::default();
        config.storage.queue_depth = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unsupported_preview_rate_rejected() {
        let mut config = AppConfig::default();
        config.preview.fps = 24;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_disabled_pulse_gives_plan_without_stimulus() {
        let mut config = AppConfig::default();
        config.plan.pulse.enabled = false;
        assert!(config.plan.to_plan().unwrap().pulse().is_none());
    }
}
