//! Camera metadata container.
//!
//! Request settings and per-request results are tag/value maps. Like the
//! framework's metadata buffers, a [`CameraMetadata`] has an entry capacity
//! and a data capacity. Writing past either one transparently grows the
//! buffer; owners that pool metadata buffers compare capacities afterwards to
//! notice that a writer needed more room.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Metadata tag identifier (`section << 16 | index`).
pub type Tag = u32;

/// Tag values used by the pipeline.
pub mod tags {
    use super::Tag;

    const COLOR_CORRECTION: Tag = 0;
    const CONTROL: Tag = 1 << 16;
    const FLASH: Tag = 4 << 16;
    const JPEG: Tag = 7 << 16;
    const LENS: Tag = 9 << 16;
    const REQUEST: Tag = 13 << 16;
    const SENSOR: Tag = 15 << 16;
    const STATISTICS: Tag = 18 << 16;

    pub const COLOR_CORRECTION_MODE: Tag = COLOR_CORRECTION;
    pub const COLOR_CORRECTION_TRANSFORM: Tag = COLOR_CORRECTION + 1;
    pub const COLOR_CORRECTION_GAINS: Tag = COLOR_CORRECTION + 2;

    pub const CONTROL_AE_ANTIBANDING_MODE: Tag = CONTROL;
    pub const CONTROL_AE_EXPOSURE_COMPENSATION: Tag = CONTROL + 1;
    pub const CONTROL_AE_LOCK: Tag = CONTROL + 2;
    pub const CONTROL_AE_MODE: Tag = CONTROL + 3;
    pub const CONTROL_AE_REGIONS: Tag = CONTROL + 4;
    pub const CONTROL_AE_TARGET_FPS_RANGE: Tag = CONTROL + 5;
    pub const CONTROL_AE_PRECAPTURE_TRIGGER: Tag = CONTROL + 6;
    pub const CONTROL_AF_MODE: Tag = CONTROL + 7;
    pub const CONTROL_AF_TRIGGER: Tag = CONTROL + 9;
    pub const CONTROL_AWB_MODE: Tag = CONTROL + 11;
    pub const CONTROL_CAPTURE_INTENT: Tag = CONTROL + 13;
    pub const CONTROL_MODE: Tag = CONTROL + 15;
    pub const CONTROL_AE_PRECAPTURE_ID: Tag = CONTROL + 31;
    pub const CONTROL_AE_STATE: Tag = CONTROL + 32;
    pub const CONTROL_AF_STATE: Tag = CONTROL + 33;
    pub const CONTROL_AF_TRIGGER_ID: Tag = CONTROL + 34;
    pub const CONTROL_AWB_STATE: Tag = CONTROL + 35;

    pub const FLASH_MODE: Tag = FLASH + 2;

    pub const JPEG_ORIENTATION: Tag = JPEG + 3;
    pub const JPEG_QUALITY: Tag = JPEG + 4;

    pub const LENS_FOCUS_DISTANCE: Tag = LENS + 3;

    pub const REQUEST_FRAME_COUNT: Tag = REQUEST;
    pub const REQUEST_ID: Tag = REQUEST + 1;
    pub const REQUEST_PIPELINE_DEPTH: Tag = REQUEST + 9;

    pub const SENSOR_EXPOSURE_TIME: Tag = SENSOR;
    pub const SENSOR_FRAME_DURATION: Tag = SENSOR + 1;
    pub const SENSOR_SENSITIVITY: Tag = SENSOR + 2;
    pub const SENSOR_TIMESTAMP: Tag = SENSOR + 16;

    pub const STATISTICS_FACE_DETECT_MODE: Tag = STATISTICS;

    /// `CONTROL_MODE` values.
    pub mod control_mode {
        pub const OFF: u8 = 0;
        pub const AUTO: u8 = 1;
    }

    /// `CONTROL_AE_MODE` values.
    pub mod ae_mode {
        pub const OFF: u8 = 0;
        pub const ON: u8 = 1;
        pub const ON_AUTO_FLASH: u8 = 2;
        pub const ON_ALWAYS_FLASH: u8 = 3;
    }

    /// `CONTROL_AE_PRECAPTURE_TRIGGER` values.
    pub mod ae_precapture_trigger {
        pub const IDLE: u8 = 0;
        pub const START: u8 = 1;
        pub const CANCEL: u8 = 2;
    }

    /// `CONTROL_AE_STATE` values.
    pub mod ae_state {
        pub const INACTIVE: u8 = 0;
        pub const SEARCHING: u8 = 1;
        pub const CONVERGED: u8 = 2;
        pub const LOCKED: u8 = 3;
        pub const FLASH_REQUIRED: u8 = 4;
        pub const PRECAPTURE: u8 = 5;
    }

    /// `CONTROL_AF_MODE` values.
    pub mod af_mode {
        pub const OFF: u8 = 0;
        pub const AUTO: u8 = 1;
        pub const CONTINUOUS_VIDEO: u8 = 3;
        pub const CONTINUOUS_PICTURE: u8 = 4;
    }

    /// `CONTROL_AF_STATE` values.
    pub mod af_state {
        pub const INACTIVE: u8 = 0;
        pub const FOCUSED_LOCKED: u8 = 4;
    }

    /// `CONTROL_AWB_MODE` values.
    pub mod awb_mode {
        pub const OFF: u8 = 0;
        pub const AUTO: u8 = 1;
    }

    /// `CONTROL_AWB_STATE` values.
    pub mod awb_state {
        pub const INACTIVE: u8 = 0;
        pub const CONVERGED: u8 = 2;
    }

    /// `CONTROL_CAPTURE_INTENT` values.
    pub mod capture_intent {
        pub const CUSTOM: u8 = 0;
        pub const PREVIEW: u8 = 1;
        pub const STILL_CAPTURE: u8 = 2;
        pub const VIDEO_RECORD: u8 = 3;
        pub const VIDEO_SNAPSHOT: u8 = 4;
        pub const ZERO_SHUTTER_LAG: u8 = 5;
        pub const MANUAL: u8 = 6;
    }

    /// `COLOR_CORRECTION_MODE` values.
    pub mod color_correction_mode {
        pub const TRANSFORM_MATRIX: u8 = 0;
        pub const FAST: u8 = 1;
    }
}

/// Typed payload of one metadata entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MetadataValue {
    Byte(Vec<u8>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    Float(Vec<f32>),
    Double(Vec<f64>),
    Rational(Vec<(i32, i32)>),
}

impl MetadataValue {
    /// Number of elements in the entry.
    #[must_use]
    pub fn count(&self) -> usize {
        match self {
            MetadataValue::Byte(v) => v.len(),
            MetadataValue::Int32(v) => v.len(),
            MetadataValue::Int64(v) => v.len(),
            MetadataValue::Float(v) => v.len(),
            MetadataValue::Double(v) => v.len(),
            MetadataValue::Rational(v) => v.len(),
        }
    }

    /// Payload size in bytes.
    #[must_use]
    pub fn data_size(&self) -> usize {
        let elem = match self {
            MetadataValue::Byte(_) => 1,
            MetadataValue::Int32(_) | MetadataValue::Float(_) => 4,
            MetadataValue::Int64(_) | MetadataValue::Double(_) | MetadataValue::Rational(_) => 8,
        };
        elem * self.count()
    }
}

macro_rules! impl_from_scalar {
    ($ty:ty, $variant:ident) => {
        impl From<$ty> for MetadataValue {
            fn from(v: $ty) -> Self {
                MetadataValue::$variant(vec![v])
            }
        }

        impl From<Vec<$ty>> for MetadataValue {
            fn from(v: Vec<$ty>) -> Self {
                MetadataValue::$variant(v)
            }
        }

        impl From<&[$ty]> for MetadataValue {
            fn from(v: &[$ty]) -> Self {
                MetadataValue::$variant(v.to_vec())
            }
        }
    };
}

impl_from_scalar!(u8, Byte);
impl_from_scalar!(i32, Int32);
impl_from_scalar!(i64, Int64);
impl_from_scalar!(f32, Float);
impl_from_scalar!(f64, Double);
impl_from_scalar!((i32, i32), Rational);

/// Tag/value metadata buffer with framework-style capacity accounting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CameraMetadata {
    entries: BTreeMap<Tag, MetadataValue>,
    entry_capacity: usize,
    data_capacity: usize,
}

impl CameraMetadata {
    /// Empty buffer with no reserved capacity; grows on demand.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty buffer with the given entry and data capacity.
    #[must_use]
    pub fn with_capacity(entry_capacity: usize, data_capacity: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            entry_capacity,
            data_capacity,
        }
    }

    /// Insert or replace an entry, growing the capacities when needed.
    pub fn update(&mut self, tag: Tag, value: impl Into<MetadataValue>) {
        let value = value.into();
        let previous = self.entries.get(&tag).map_or(0, MetadataValue::data_size);
        let needed_entries = self.entries.len() + usize::from(!self.entries.contains_key(&tag));
        let needed_data = self.data_size() - previous + value.data_size();

        if needed_entries > self.entry_capacity {
            self.entry_capacity = (self.entry_capacity * 2).max(needed_entries);
        }
        if needed_data > self.data_capacity {
            self.data_capacity = (self.data_capacity * 2).max(needed_data);
        }
        self.entries.insert(tag, value);
    }

    /// Look up an entry.
    #[must_use]
    pub fn find(&self, tag: Tag) -> Option<&MetadataValue> {
        self.entries.get(&tag)
    }

    /// First element of a byte entry.
    #[must_use]
    pub fn find_u8(&self, tag: Tag) -> Option<u8> {
        match self.entries.get(&tag)? {
            MetadataValue::Byte(v) => v.first().copied(),
            _ => None,
        }
    }

    /// First element of an int32 entry.
    #[must_use]
    pub fn find_i32(&self, tag: Tag) -> Option<i32> {
        match self.entries.get(&tag)? {
            MetadataValue::Int32(v) => v.first().copied(),
            _ => None,
        }
    }

    /// First element of an int64 entry.
    #[must_use]
    pub fn find_i64(&self, tag: Tag) -> Option<i64> {
        match self.entries.get(&tag)? {
            MetadataValue::Int64(v) => v.first().copied(),
            _ => None,
        }
    }

    /// First element of a float entry.
    #[must_use]
    pub fn find_f32(&self, tag: Tag) -> Option<f32> {
        match self.entries.get(&tag)? {
            MetadataValue::Float(v) => v.first().copied(),
            _ => None,
        }
    }

    /// All elements of an int32 entry.
    #[must_use]
    pub fn find_i32_slice(&self, tag: Tag) -> Option<&[i32]> {
        match self.entries.get(&tag)? {
            MetadataValue::Int32(v) => Some(v.as_slice()),
            _ => None,
        }
    }

    /// Remove an entry, returning it.
    pub fn erase(&mut self, tag: Tag) -> Option<MetadataValue> {
        self.entries.remove(&tag)
    }

    #[must_use]
    pub fn contains(&self, tag: Tag) -> bool {
        self.entries.contains_key(&tag)
    }

    /// Drop every entry while keeping the capacities.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Copy every entry of `other` into this buffer.
    pub fn merge(&mut self, other: &CameraMetadata) {
        for (tag, value) in &other.entries {
            self.update(*tag, value.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Tag, &MetadataValue)> {
        self.entries.iter()
    }

    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bytes of payload currently stored.
    #[must_use]
    pub fn data_size(&self) -> usize {
        self.entries.values().map(MetadataValue::data_size).sum()
    }

    #[must_use]
    pub fn entry_capacity(&self) -> usize {
        self.entry_capacity
    }

    #[must_use]
    pub fn data_capacity(&self) -> usize {
        self.data_capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_and_find() {
        let mut meta = CameraMetadata::with_capacity(4, 64);
        meta.update(tags::CONTROL_AE_MODE, tags::ae_mode::ON);
        meta.update(tags::SENSOR_TIMESTAMP, 1_000_i64);
        meta.update(tags::COLOR_CORRECTION_GAINS, vec![1.0f32, 1.0, 1.0, 1.0]);

        assert_eq!(meta.find_u8(tags::CONTROL_AE_MODE), Some(tags::ae_mode::ON));
        assert_eq!(meta.find_i64(tags::SENSOR_TIMESTAMP), Some(1_000));
        assert_eq!(meta.find_i32(tags::SENSOR_TIMESTAMP), None);
        assert_eq!(meta.entry_count(), 3);
        assert_eq!(meta.data_size(), 1 + 8 + 16);
    }

    #[test]
    fn test_growth_changes_capacity() {
        let mut meta = CameraMetadata::with_capacity(1, 4);
        meta.update(tags::CONTROL_AE_MODE, 1u8);
        assert_eq!((meta.entry_capacity(), meta.data_capacity()), (1, 4));

        meta.update(tags::SENSOR_TIMESTAMP, 7_i64);
        assert_eq!(meta.entry_capacity(), 2);
        assert_eq!(meta.data_capacity(), 9);
    }

    #[test]
    fn test_clear_keeps_capacity() {
        let mut meta = CameraMetadata::with_capacity(8, 128);
        meta.update(tags::REQUEST_ID, 3_i32);
        meta.clear();
        assert!(meta.is_empty());
        assert_eq!(meta.entry_capacity(), 8);
        assert_eq!(meta.data_capacity(), 128);
    }

    #[test]
    fn test_replace_does_not_double_count() {
        let mut meta = CameraMetadata::with_capacity(2, 8);
        meta.update(tags::SENSOR_EXPOSURE_TIME, 10_i64);
        meta.update(tags::SENSOR_EXPOSURE_TIME, 20_i64);
        assert_eq!(meta.data_capacity(), 8);
        assert_eq!(meta.find_i64(tags::SENSOR_EXPOSURE_TIME), Some(20));
    }
}
