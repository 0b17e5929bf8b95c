//! Typed capture event bus.
//!
//! The capture unit publishes events from its own task; listeners (the
//! control unit) marshal them into their own mailbox and return at once.
//! `notify` copies the subscriber list and releases the table lock before
//! calling anyone, so a listener may attach or detach from inside a callback.

use crate::capture_unit::CapturedFrame;
use crate::three_a::{AaaStatistics, SensorDescriptor};
use hal_core::{HalError, HalResult};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{trace, warn};

/// Event classes a listener can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CaptureEventKind {
    /// Sensor mode data after `init`
    NewSensorDescriptor,
    /// Request buffers coming back
    NewFrame,
    /// AE statistics
    NewStatistics,
    /// Start of exposure of a request
    Shutter,
    /// Request abandoned by the capture unit
    RequestError,
    /// A frame whose statistics will never be published
    StatisticsLost,
}

impl CaptureEventKind {
    /// Number of event kinds.
    pub const COUNT: usize = 6;
}

impl TryFrom<u32> for CaptureEventKind {
    type Error = HalError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::NewSensorDescriptor),
            1 => Ok(Self::NewFrame),
            2 => Ok(Self::NewStatistics),
            3 => Ok(Self::Shutter),
            4 => Ok(Self::RequestError),
            5 => Ok(Self::StatisticsLost),
            other => Err(HalError::BadValue(format!("event kind {other} out of range"))),
        }
    }
}

/// Event published by the capture unit.
#[derive(Debug, Clone)]
pub enum CaptureEvent {
    /// The sensor was opened.
    NewSensorDescriptor(Arc<SensorDescriptor>),
    /// A request buffer came back from the hardware.
    NewFrame(Arc<CapturedFrame>),
    /// Statistics tagged with the request id of the frame they measure.
    NewStatistics(Arc<AaaStatistics>),
    /// First buffer of a request came back.
    Shutter {
        /// Request the frame belongs to
        request_id: i64,
        /// Start of exposure
        timestamp_ns: i64,
    },
    /// The capture unit gave up on a request.
    RequestError {
        /// Abandoned request
        request_id: i64,
    },
    /// The frame tagged `sequence` was lost before its statistics were read.
    StatisticsLost {
        /// Request id the frame was tagged with
        sequence: i64,
    },
}

impl CaptureEvent {
    /// Subscription class of this event.
    pub fn kind(&self) -> CaptureEventKind {
        match self {
            CaptureEvent::NewSensorDescriptor(_) => CaptureEventKind::NewSensorDescriptor,
            CaptureEvent::NewFrame(_) => CaptureEventKind::NewFrame,
            CaptureEvent::NewStatistics(_) => CaptureEventKind::NewStatistics,
            CaptureEvent::Shutter { .. } => CaptureEventKind::Shutter,
            CaptureEvent::RequestError { .. } => CaptureEventKind::RequestError,
            CaptureEvent::StatisticsLost { .. } => CaptureEventKind::StatisticsLost,
        }
    }
}

/// Receiver of capture events. Must not block.
pub trait CaptureListener: Send + Sync {
    /// Handle one event; errors are logged by the bus.
    fn notify_capture_event(&self, event: &CaptureEvent) -> HalResult<()>;
}

type ListenerTable = BTreeMap<CaptureEventKind, Vec<Arc<dyn CaptureListener>>>;

/// Subscriber table keyed by event kind.
#[derive(Default)]
pub struct EventBus {
    listeners: Mutex<ListenerTable>,
}

fn same_listener(a: &Arc<dyn CaptureListener>, b: &Arc<dyn CaptureListener>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

impl EventBus {
    /// Empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `listener` to `kind`. Attaching twice is `AlreadyExists`.
    pub fn attach(&self, kind: CaptureEventKind, listener: Arc<dyn CaptureListener>) -> HalResult<()> {
        let mut table = self.listeners.lock();
        let entry = table.entry(kind).or_default();
        if entry.iter().any(|l| same_listener(l, &listener)) {
            warn!(?kind, "listener already attached");
            return Err(HalError::AlreadyExists);
        }
        entry.push(listener);
        Ok(())
    }

    /// Attach by raw event index, validating the range.
    pub fn attach_index(&self, index: u32, listener: Arc<dyn CaptureListener>) -> HalResult<()> {
        self.attach(CaptureEventKind::try_from(index)?, listener)
    }

    /// Unsubscribe `listener` from `kind`.
    pub fn detach(&self, kind: CaptureEventKind, listener: &Arc<dyn CaptureListener>) -> HalResult<()> {
        let mut table = self.listeners.lock();
        let Some(entry) = table.get_mut(&kind) else {
            return Err(HalError::BadValue(format!("no listeners for {kind:?}")));
        };
        let before = entry.len();
        entry.retain(|l| !same_listener(l, listener));
        if entry.len() == before {
            return Err(HalError::BadValue(format!("listener not attached to {kind:?}")));
        }
        if entry.is_empty() {
            table.remove(&kind);
        }
        Ok(())
    }

    /// Remove `listener` from every kind it is attached to.
    pub fn detach_all(&self, listener: &Arc<dyn CaptureListener>) {
        let mut table = self.listeners.lock();
        for entry in table.values_mut() {
            entry.retain(|l| !same_listener(l, listener));
        }
        table.retain(|_, entry| !entry.is_empty());
    }

    /// Subscribers of `kind`.
    pub fn listener_count(&self, kind: CaptureEventKind) -> usize {
        self.listeners.lock().get(&kind).map_or(0, Vec::len)
    }

    /// Deliver `event` to every subscriber of its kind, in attach order.
    pub fn notify(&self, event: &CaptureEvent) -> usize {
        let kind = event.kind();
        let subscribers = match self.listeners.lock().get(&kind) {
            Some(entry) => entry.clone(),
            None => {
                trace!(?kind, "event without listeners");
                return 0;
            }
        };
        for listener in &subscribers {
            if let Err(e) = listener.notify_capture_event(event) {
                warn!(?kind, error = %e, "listener rejected event");
            }
        }
        subscribers.len()
    }
}
