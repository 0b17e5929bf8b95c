//! Shared building blocks for the camera HAL.
//!
//! - [`error`]: the status taxonomy every HAL operation reports through
//! - [`metadata`]: the tag/value container used for request settings and results
//! - [`config`]: immutable platform capability data loaded at startup
//! - [`logging`]: `tracing` subscriber setup

pub mod config;
pub mod error;
pub mod logging;
pub mod metadata;

pub use config::{CameraCapabilities, PlatformConfig, SensorTiming};
pub use error::{HalError, HalResult};
pub use metadata::{CameraMetadata, MetadataValue, Tag};
