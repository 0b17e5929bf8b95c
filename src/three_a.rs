//! 3A boundary: AE inputs/outputs, the default AE loop and the AE state
//! machine.
//!
//! The vendor 3A library is out of reach here; [`AaaControl`] is the seam it
//! would plug into. [`DefaultAe`] steers the mean luma of the latest
//! statistics towards a target and honours manual exposure/sensitivity.

use hal_core::config::SensorTiming;
use hal_core::metadata::tags::{self, ae_mode, ae_precapture_trigger, ae_state, control_mode};
use hal_core::{CameraMetadata, HalError, HalResult};
use serde::Serialize;
use tracing::trace;

/// Sensor mode description published once the sensor is opened.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorDescriptor {
    /// Pixel clock in MHz.
    pub pixel_clock_mhz: f64,
    /// Line length including horizontal blanking.
    pub line_length_pixels: u32,
    /// Frame length including vertical blanking.
    pub frame_length_lines: u32,
    /// Active output width.
    pub output_width: u32,
    /// Active output height.
    pub output_height: u32,
    /// Shortest supported exposure.
    pub min_exposure_us: u32,
    /// Longest supported exposure.
    pub max_exposure_us: u32,
    /// Lowest ISO.
    pub min_sensitivity: i32,
    /// Highest ISO.
    pub max_sensitivity: i32,
}

impl SensorDescriptor {
    /// Describe the mode configured by `timing`.
    pub fn from_timing(timing: &SensorTiming) -> Self {
        Self {
            pixel_clock_mhz: timing.pixel_clock_mhz,
            line_length_pixels: timing.line_length_pixels,
            frame_length_lines: timing.frame_length_lines,
            output_width: timing.output_width,
            output_height: timing.output_height,
            min_exposure_us: timing.min_exposure_us,
            max_exposure_us: timing.max_exposure_us,
            min_sensitivity: timing.min_sensitivity,
            max_sensitivity: timing.max_sensitivity,
        }
    }

    /// Time to read out one line, in microseconds.
    pub fn line_time_us(&self) -> f64 {
        f64::from(self.line_length_pixels) / self.pixel_clock_mhz
    }

    /// Frame duration in microseconds: `line_length * frame_length / pixel_clock`.
    pub fn frame_duration_us(&self) -> f64 {
        f64::from(self.line_length_pixels) * f64::from(self.frame_length_lines)
            / self.pixel_clock_mhz
    }
}

impl Default for SensorDescriptor {
    fn default() -> Self {
        Self::from_timing(&SensorTiming::default())
    }
}

/// Statistics produced by the ISP for one captured frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AaaStatistics {
    /// Request id of the frame the statistics describe; skip frames carry
    /// the ids just before the first request
    pub frame_sequence: i64,
    /// Average luma, 0..=255
    pub mean_luma: f32,
    /// Exposure the frame was captured with.
    pub exposure_us: u32,
    /// Analog gain the frame was captured with.
    pub analog_gain: f32,
    /// Start of exposure.
    pub timestamp_ns: i64,
}

/// What the frame is for, as far as AE cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FrameUse {
    /// Viewfinder frames.
    Preview,
    /// Still capture.
    Still,
    /// Video recording.
    Video,
}

/// Antibanding mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FlickerMode {
    /// No antibanding.
    Off,
    /// 50 Hz mains.
    Hz50,
    /// 60 Hz mains.
    Hz60,
    /// Detect the mains frequency.
    Auto,
}

/// AE algorithm input derived from request settings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AeInputParams {
    /// Auto exposure enabled.
    pub ae_on: bool,
    /// Requested exposure when AE is off.
    pub manual_exposure_us: Option<u32>,
    /// Requested ISO when AE is off.
    pub manual_sensitivity: Option<i32>,
    /// In 1/3 EV steps
    pub exposure_compensation: i32,
    /// Use of the frame being exposed.
    pub frame_use: FrameUse,
    /// Antibanding mode to honour.
    pub flicker_mode: FlickerMode,
    /// Minimum and maximum frame rate.
    pub target_fps_range: (i32, i32),
    /// Sensor mode the parameters apply to.
    pub sensor: SensorDescriptor,
}

/// AE algorithm output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AeResults {
    /// Exposure time.
    pub exposure_time_us: u32,
    /// Analog gain.
    pub analog_gain: f32,
    /// Digital gain applied by the ISP.
    pub digital_gain: f32,
    /// Sensitivity, `analog_gain * 100`.
    pub iso: i32,
    /// Whether the loop settled on the target.
    pub converged: bool,
    /// Exposure in sensor lines.
    pub coarse_integration_time: u32,
    /// Line length the exposure was computed for.
    pub line_length_pixels: u32,
    /// Frame length the exposure was computed for.
    pub frame_length_lines: u32,
}

/// Sensor settings applied for one capture.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaptureSettings {
    /// Exposure time programmed on the sensor.
    pub exposure_time_us: u32,
    /// Analog gain programmed on the sensor.
    pub analog_gain: f32,
    /// Digital gain applied by the ISP.
    pub digital_gain: f32,
    /// ISO reported in results.
    pub sensitivity: i32,
    /// Exposure in sensor lines.
    pub coarse_integration_time: u32,
    /// Frame duration of the sensor mode.
    pub frame_duration_us: f64,
}

impl CaptureSettings {
    /// Settings programming `results` on `sensor`.
    pub fn from_ae(results: &AeResults, sensor: &SensorDescriptor) -> Self {
        Self {
            exposure_time_us: results.exposure_time_us,
            analog_gain: results.analog_gain,
            digital_gain: results.digital_gain,
            sensitivity: results.iso,
            coarse_integration_time: results.coarse_integration_time,
            frame_duration_us: sensor.frame_duration_us(),
        }
    }
}

/// Seam for the 3A library.
pub trait AaaControl: Send {
    /// Translate request settings into AE input.
    fn fill_ae_input_params(
        &self,
        settings: &CameraMetadata,
        sensor: &SensorDescriptor,
        ae_on: bool,
    ) -> HalResult<AeInputParams>;

    /// Run one AE iteration, using `stats` when the frame has any.
    fn run_ae(
        &mut self,
        params: &AeInputParams,
        stats: Option<&AaaStatistics>,
    ) -> HalResult<AeResults>;
}

const DEFAULT_TARGET_LUMA: f32 = 118.0;
const CONVERGENCE_TOLERANCE: f32 = 0.08;
const INITIAL_EXPOSURE_US: u32 = 10_000;

/// Mean-luma AE loop.
#[derive(Debug)]
pub struct DefaultAe {
    target_luma: f32,
    last: Option<AeResults>,
}

impl Default for DefaultAe {
    fn default() -> Self {
        Self::new(DEFAULT_TARGET_LUMA)
    }
}

impl DefaultAe {
    /// AE loop aiming at `target_luma` (0..=255).
    pub fn new(target_luma: f32) -> Self {
        Self {
            target_luma,
            last: None,
        }
    }

    /// Output of the latest iteration.
    pub fn last_results(&self) -> Option<&AeResults> {
        self.last.as_ref()
    }

    fn finish(&mut self, sensor: &SensorDescriptor, exposure_us: u32, iso: i32, converged: bool) -> AeResults {
        let line_time = sensor.line_time_us().max(f64::EPSILON);
        let results = AeResults {
            exposure_time_us: exposure_us,
            analog_gain: iso as f32 / 100.0,
            digital_gain: 1.0,
            iso,
            converged,
            coarse_integration_time: (f64::from(exposure_us) / line_time).round() as u32,
            line_length_pixels: sensor.line_length_pixels,
            frame_length_lines: sensor.frame_length_lines,
        };
        self.last = Some(results.clone());
        results
    }
}

impl AaaControl for DefaultAe {
    fn fill_ae_input_params(
        &self,
        settings: &CameraMetadata,
        sensor: &SensorDescriptor,
        ae_on: bool,
    ) -> HalResult<AeInputParams> {
        let frame_use = match settings.find_u8(tags::CONTROL_CAPTURE_INTENT) {
            Some(tags::capture_intent::STILL_CAPTURE | tags::capture_intent::ZERO_SHUTTER_LAG) => {
                FrameUse::Still
            }
            Some(tags::capture_intent::VIDEO_RECORD | tags::capture_intent::VIDEO_SNAPSHOT) => {
                FrameUse::Video
            }
            _ => FrameUse::Preview,
        };
        let flicker_mode = match settings.find_u8(tags::CONTROL_AE_ANTIBANDING_MODE) {
            Some(0) => FlickerMode::Off,
            Some(1) => FlickerMode::Hz50,
            Some(2) => FlickerMode::Hz60,
            _ => FlickerMode::Auto,
        };
        let target_fps_range = match settings.find_i32_slice(tags::CONTROL_AE_TARGET_FPS_RANGE) {
            Some([lo, hi, ..]) if lo <= hi => (*lo, *hi),
            Some(_) => {
                return Err(HalError::BadValue("inverted AE target fps range".into()));
            }
            None => (15, 30),
        };

        let (manual_exposure_us, manual_sensitivity) = if ae_on {
            (None, None)
        } else {
            let exposure = settings
                .find_i64(tags::SENSOR_EXPOSURE_TIME)
                .map(|ns| (ns / 1000).clamp(0, i64::from(u32::MAX)) as u32);
            (exposure, settings.find_i32(tags::SENSOR_SENSITIVITY))
        };

        Ok(AeInputParams {
            ae_on,
            manual_exposure_us,
            manual_sensitivity,
            exposure_compensation: settings
                .find_i32(tags::CONTROL_AE_EXPOSURE_COMPENSATION)
                .unwrap_or(0),
            frame_use,
            flicker_mode,
            target_fps_range,
            sensor: sensor.clone(),
        })
    }

    fn run_ae(
        &mut self,
        params: &AeInputParams,
        stats: Option<&AaaStatistics>,
    ) -> HalResult<AeResults> {
        let sensor = &params.sensor;
        let min_exp = sensor.min_exposure_us;
        let max_exp = sensor.max_exposure_us;
        let min_iso = sensor.min_sensitivity;
        let max_iso = sensor.max_sensitivity;

        if !params.ae_on {
            let exposure = params
                .manual_exposure_us
                .unwrap_or(INITIAL_EXPOSURE_US)
                .clamp(min_exp, max_exp);
            let iso = params.manual_sensitivity.unwrap_or(min_iso).clamp(min_iso, max_iso);
            return Ok(self.finish(sensor, exposure, iso, true));
        }

        let (prev_exp, prev_iso) = self
            .last
            .as_ref()
            .map_or((INITIAL_EXPOSURE_US, min_iso), |r| (r.exposure_time_us, r.iso));

        let Some(stats) = stats else {
            return Ok(self.finish(sensor, prev_exp.clamp(min_exp, max_exp), prev_iso, false));
        };

        let target = self.target_luma * 2f32.powf(params.exposure_compensation as f32 / 3.0);
        let luma = stats.mean_luma.max(1.0);
        let error = (luma - target).abs() / target;
        if error <= CONVERGENCE_TOLERANCE {
            return Ok(self.finish(sensor, prev_exp, prev_iso, true));
        }

        // Total exposure in µs at unity gain, then split exposure first.
        let ratio = (target / luma).clamp(0.25, 4.0);
        let total = f64::from(prev_exp) * f64::from(prev_iso) / 100.0 * f64::from(ratio);
        let exposure = (total.round() as u32).clamp(min_exp, max_exp);
        let iso = ((total / f64::from(exposure.max(1)) * 100.0).round() as i32).clamp(min_iso, max_iso);
        trace!(luma, target, exposure, iso, "ae step");
        Ok(self.finish(sensor, exposure, iso, false))
    }
}

/// AE state reported in result metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AeState {
    /// AE is off or has not run yet.
    Inactive,
    /// Still adjusting.
    Searching,
    /// Settled on a good exposure.
    Converged,
    /// Converged but the scene needs flash.
    FlashRequired,
    /// AE lock is on.
    Locked,
    /// A precapture sequence is running.
    Precapture,
}

impl AeState {
    /// Value of `android.control.aeState`.
    pub fn as_metadata(self) -> u8 {
        match self {
            AeState::Inactive => ae_state::INACTIVE,
            AeState::Searching => ae_state::SEARCHING,
            AeState::Converged => ae_state::CONVERGED,
            AeState::FlashRequired => ae_state::FLASH_REQUIRED,
            AeState::Locked => ae_state::LOCKED,
            AeState::Precapture => ae_state::PRECAPTURE,
        }
    }
}

/// Simplified AE state machine.
///
/// Only the manual transitions are modelled. Cycling between searching,
/// converged and locked in auto mode needs convergence and flash decisions
/// from the 3A library and is left to an [`AaaControl`] implementation.
#[derive(Debug, Clone)]
pub struct AeStateMachine {
    state: AeState,
    last_ae_mode: u8,
}

impl Default for AeStateMachine {
    fn default() -> Self {
        Self {
            state: AeState::Inactive,
            last_ae_mode: ae_mode::ON,
        }
    }
}

impl AeStateMachine {
    /// Current state.
    pub fn state(&self) -> AeState {
        self.state
    }

    /// Whether the settings enable auto exposure.
    pub fn ae_enabled(settings: &CameraMetadata) -> bool {
        let control = settings.find_u8(tags::CONTROL_MODE).unwrap_or(control_mode::AUTO);
        let mode = settings.find_u8(tags::CONTROL_AE_MODE).unwrap_or(ae_mode::ON);
        control != control_mode::OFF && mode != ae_mode::OFF
    }

    /// Advance on the settings of the next request.
    pub fn process(&mut self, settings: &CameraMetadata) -> AeState {
        let mode = settings.find_u8(tags::CONTROL_AE_MODE).unwrap_or(ae_mode::ON);
        let trigger = settings
            .find_u8(tags::CONTROL_AE_PRECAPTURE_TRIGGER)
            .unwrap_or(ae_precapture_trigger::IDLE);
        let locked = settings.find_u8(tags::CONTROL_AE_LOCK).unwrap_or(0) != 0;

        let next = if !Self::ae_enabled(settings) {
            AeState::Inactive
        } else if trigger == ae_precapture_trigger::START {
            AeState::Precapture
        } else if locked {
            AeState::Locked
        } else {
            AeState::Converged
        };

        if mode != self.last_ae_mode || next != self.state {
            trace!(from = ?self.state, to = ?next, "ae state");
        }
        self.last_ae_mode = mode;
        self.state = next;
        next
    }
}
