//! Platform capability configuration using Figment.
//!
//! Capability data is loaded once at startup from:
//! 1. a TOML capability file (base configuration)
//! 2. environment variables prefixed with `CAMERA_HAL_`
//!
//! The result is an immutable value object handed to the camera hardware,
//! capture unit and control unit constructors by `Arc`.
//!
//! # Example
//! ```no_run
//! use hal_core::config::PlatformConfig;
//!
//! let config = PlatformConfig::load_from("config/camera_hal.toml")?;
//! let caps = config.camera(0).expect("camera 0 configured");
//! println!("pipeline depth {}", caps.pipeline_depth());
//! # Ok::<(), hal_core::HalError>(())
//! ```

use crate::error::{HalError, HalResult};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Pipeline depth used when the capability file gives none (or a value ≤ 0).
pub const DEFAULT_PIPELINE_DEPTH: usize = 4;

/// Top-level platform configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Capacity of every actor message queue
    #[serde(default = "default_queue_depth")]
    pub message_queue_depth: usize,
    /// Per-camera capability data
    #[serde(default)]
    pub cameras: Vec<CameraCapabilities>,
}

/// Capability data for one camera.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CameraCapabilities {
    /// Camera id as seen by the framework
    pub id: i32,
    /// Sensor name (informational)
    #[serde(default = "default_sensor_name")]
    pub sensor_name: String,
    /// Maximum in-flight requests; values ≤ 0 select the default
    #[serde(default = "default_pipeline_depth_raw")]
    pub pipeline_depth: i32,
    /// Frames between writing exposure and it taking effect
    #[serde(default = "default_lag")]
    pub exposure_lag: u32,
    /// Frames between writing gain and it taking effect
    #[serde(default = "default_lag")]
    pub gain_lag: u32,
    /// Number of partial-result stages per request
    #[serde(default = "default_partial_result_count")]
    pub partial_result_count: usize,
    /// ISP output video nodes, in priority order
    #[serde(default = "default_video_nodes")]
    pub video_nodes: Vec<String>,
    /// Upper bound of one blocking hardware wait
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    /// Sensor timing and limits
    #[serde(default)]
    pub sensor: SensorTiming,
}

/// Sensor mode timing used for frame duration and AE limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SensorTiming {
    /// Active output width in pixels
    pub output_width: u32,
    /// Active output height in lines
    pub output_height: u32,
    /// Pixel clock in MHz
    pub pixel_clock_mhz: f64,
    /// Line length including blanking, in pixels
    pub line_length_pixels: u32,
    /// Frame length including blanking, in lines
    pub frame_length_lines: u32,
    /// Shortest exposure the sensor accepts
    pub min_exposure_us: u32,
    /// Longest exposure the sensor accepts
    pub max_exposure_us: u32,
    /// Lowest ISO
    pub min_sensitivity: i32,
    /// Highest ISO
    pub max_sensitivity: i32,
}

impl Default for SensorTiming {
    fn default() -> Self {
        Self {
            output_width: 1920,
            output_height: 1080,
            pixel_clock_mhz: 200.0,
            line_length_pixels: 4572,
            frame_length_lines: 1458,
            min_exposure_us: 100,
            max_exposure_us: 33_000,
            min_sensitivity: 100,
            max_sensitivity: 1600,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_queue_depth() -> usize {
    64
}

fn default_sensor_name() -> String {
    "sim-sensor".to_string()
}

fn default_pipeline_depth_raw() -> i32 {
    DEFAULT_PIPELINE_DEPTH as i32
}

fn default_lag() -> u32 {
    2
}

fn default_partial_result_count() -> usize {
    1
}

fn default_video_nodes() -> Vec<String> {
    vec![
        "isp-main".to_string(),
        "isp-preview".to_string(),
        "isp-capture".to_string(),
    ]
}

fn default_poll_timeout_ms() -> u64 {
    1000
}

impl Default for CameraCapabilities {
    fn default() -> Self {
        Self {
            id: 0,
            sensor_name: default_sensor_name(),
            pipeline_depth: default_pipeline_depth_raw(),
            exposure_lag: default_lag(),
            gain_lag: default_lag(),
            partial_result_count: default_partial_result_count(),
            video_nodes: default_video_nodes(),
            poll_timeout_ms: default_poll_timeout_ms(),
            sensor: SensorTiming::default(),
        }
    }
}

impl CameraCapabilities {
    /// Effective pipeline depth.
    #[must_use]
    pub fn pipeline_depth(&self) -> usize {
        if self.pipeline_depth <= 0 {
            DEFAULT_PIPELINE_DEPTH
        } else {
            self.pipeline_depth as usize
        }
    }

    /// Sensor setting delay: the larger of the exposure and gain lags.
    #[must_use]
    pub fn sensor_setting_delay(&self) -> u32 {
        self.exposure_lag.max(self.gain_lag)
    }

    /// Number of ISP output nodes a configuration may bind.
    #[must_use]
    pub fn max_output_nodes(&self) -> usize {
        self.video_nodes.len()
    }

    /// Smallest actor queue that holds every message of the requests and
    /// skip frames that can be in flight at once.
    ///
    /// Each request posts at most one message per buffer and per partial
    /// result, plus admission, capture, shutter and statistics.
    #[must_use]
    pub fn min_message_queue_depth(&self) -> usize {
        let frames = self.pipeline_depth() + self.sensor_setting_delay() as usize + 1;
        frames.saturating_mul(self.max_output_nodes() + self.partial_result_count + 4)
    }
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            message_queue_depth: default_queue_depth(),
            cameras: vec![CameraCapabilities::default()],
        }
    }
}

impl PlatformConfig {
    /// Load from `config/camera_hal.toml` and the environment.
    pub fn load() -> HalResult<Self> {
        Self::load_from("config/camera_hal.toml")
    }

    /// Load from a specific capability file merged over the defaults.
    ///
    /// Environment variables can override values with prefix `CAMERA_HAL_`,
    /// e.g. `CAMERA_HAL_LOG_LEVEL=debug`.
    pub fn load_from<P: AsRef<Path>>(path: P) -> HalResult<Self> {
        let config: Self = Figment::from(Serialized::defaults(PlatformConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("CAMERA_HAL_").only(&["log_level", "message_queue_depth"]))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse capability data from a TOML string.
    pub fn from_toml_str(toml: &str) -> HalResult<Self> {
        let config: Self = Figment::from(Serialized::defaults(PlatformConfig::default()))
            .merge(Toml::string(toml))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> HalResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(HalError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.message_queue_depth == 0 {
            return Err(HalError::Configuration(
                "message_queue_depth must be greater than 0".to_string(),
            ));
        }

        let mut ids = HashSet::new();
        for cam in &self.cameras {
            if !ids.insert(cam.id) {
                return Err(HalError::Configuration(format!(
                    "Duplicate camera id: {}",
                    cam.id
                )));
            }
            if cam.partial_result_count == 0 {
                return Err(HalError::Configuration(format!(
                    "camera {}: partial_result_count must be at least 1",
                    cam.id
                )));
            }
            if cam.video_nodes.is_empty() {
                return Err(HalError::Configuration(format!(
                    "camera {}: at least one video node is required",
                    cam.id
                )));
            }
            if cam.sensor.pixel_clock_mhz <= 0.0 {
                return Err(HalError::Configuration(format!(
                    "camera {}: pixel_clock_mhz must be positive",
                    cam.id
                )));
            }
            let min_depth = cam.min_message_queue_depth();
            if self.message_queue_depth < min_depth {
                return Err(HalError::Configuration(format!(
                    "message_queue_depth {} is below the {} camera {} can have in flight",
                    self.message_queue_depth, min_depth, cam.id
                )));
            }
            if cam.sensor.min_exposure_us > cam.sensor.max_exposure_us
                || cam.sensor.min_sensitivity > cam.sensor.max_sensitivity
            {
                return Err(HalError::Configuration(format!(
                    "camera {}: sensor limits are inverted",
                    cam.id
                )));
            }
        }

        Ok(())
    }

    /// Capability data for one camera.
    #[must_use]
    pub fn camera(&self, id: i32) -> Option<&CameraCapabilities> {
        self.cameras.iter().find(|c| c.id == id)
    }
}
