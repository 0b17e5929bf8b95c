//! Control unit: runs 3A for each request and correlates delayed statistics
//! with the request they should steer.
//!
//! Statistics measured on the frame of request `n` are only usable for the
//! settings of request `n + D + 1`, where `D` is the sensor setting delay.
//! Requests wait in [`Correlator`] until their statistics arrive, are then
//! run through AE and handed to the capture unit, and wait again until every
//! output buffer is back.
//!
//! The first request after configuration runs without statistics. The `D`
//! skip frames the capture unit queues in front of it carry the ids
//! `first - D .. first`, so their statistics unlock requests
//! `first + 1 ..= first + D`.

use crate::actor::{self, respond, Reply};
use crate::buffer::{BufferStatus, CameraBuffer, PixelFormat};
use crate::capture_unit::{CaptureUnit, CapturedFrame};
use crate::events::{CaptureEvent, CaptureEventKind, CaptureListener};
use crate::jpeg::JpegMaker;
use crate::request::SharedRequest;
use crate::three_a::{
    AaaControl, AaaStatistics, AeInputParams, AeResults, AeState, AeStateMachine, CaptureSettings,
    SensorDescriptor,
};
use hal_core::config::CameraCapabilities;
use hal_core::metadata::tags::{self, af_mode, af_state, awb_mode, awb_state, color_correction_mode};
use hal_core::{HalError, HalResult};
use hal_pool::{ItemPool, Loaned};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

const ACTOR: &str = "control_unit";

const EVENT_KINDS: [CaptureEventKind; CaptureEventKind::COUNT] = [
    CaptureEventKind::NewSensorDescriptor,
    CaptureEventKind::NewFrame,
    CaptureEventKind::NewStatistics,
    CaptureEventKind::Shutter,
    CaptureEventKind::RequestError,
    CaptureEventKind::StatisticsLost,
];

/// What to do with a request handed to [`Correlator::on_new_request`].
#[derive(Debug)]
pub enum Dispatch<S, T> {
    /// Run 3A now, with the statistics if any are usable
    RunNow(S, Option<T>),
    /// Parked until its statistics arrive
    Parked,
}

/// Ordered bookkeeping between requests and statistics.
///
/// `S` is the per-request state and `T` the statistics payload. All maps
/// are keyed by request id; statistics are keyed by the id of the frame
/// they were measured on.
#[derive(Debug)]
pub struct Correlator<S, T> {
    waiting_for_stats: BTreeMap<i64, S>,
    waiting_for_image: BTreeMap<i64, S>,
    available_statistics: BTreeMap<i64, T>,
    /// Statistics sequences that will never arrive
    lost: BTreeSet<i64>,
    /// Request ids seen since the first one; only their frames carry statistics
    submitted: BTreeSet<i64>,
    first_request: Option<i64>,
    delay: i64,
}

impl<S, T> Correlator<S, T> {
    /// Correlator for a sensor applying settings `delay` frames late.
    pub fn new(delay: u32) -> Self {
        Self {
            waiting_for_stats: BTreeMap::new(),
            waiting_for_image: BTreeMap::new(),
            available_statistics: BTreeMap::new(),
            lost: BTreeSet::new(),
            submitted: BTreeSet::new(),
            first_request: None,
            delay: i64::from(delay),
        }
    }

    /// Sensor setting delay in frames.
    pub fn delay(&self) -> i64 {
        self.delay
    }

    /// Id of the first request since the last reset.
    pub fn first_request(&self) -> Option<i64> {
        self.first_request
    }

    /// Id of the request the statistics of `seq` are applied to.
    pub fn next_request_id_for_stats_seq(&self, seq: i64) -> i64 {
        seq + self.delay + 1
    }

    /// Statistics sequence `request_id` waits for.
    pub fn stats_seq_for_request(&self, request_id: i64) -> i64 {
        request_id - self.delay - 1
    }

    /// Forget every request and statistic. Called on reconfiguration.
    pub fn reset(&mut self) {
        self.waiting_for_stats.clear();
        self.waiting_for_image.clear();
        self.available_statistics.clear();
        self.lost.clear();
        self.submitted.clear();
        self.first_request = None;
    }

    fn is_tracked(&self, request_id: i64) -> bool {
        self.waiting_for_stats.contains_key(&request_id)
            || self.waiting_for_image.contains_key(&request_id)
    }

    /// Park `request_id` until its statistics are in, or hand it back to run now.
    pub fn on_new_request(&mut self, request_id: i64, state: S) -> HalResult<Dispatch<S, T>> {
        if self.is_tracked(request_id) {
            error!(request_id, "request already in flight, find the bug");
            return Err(HalError::UnknownError(format!(
                "request {request_id} correlated twice"
            )));
        }
        let first = *self.first_request.get_or_insert(request_id);
        let seq = self.stats_seq_for_request(request_id);

        // Stale statistics nobody will ask for any more.
        self.available_statistics = self.available_statistics.split_off(&seq);
        self.lost = self.lost.split_off(&seq);
        self.submitted = self.submitted.split_off(&seq);
        self.submitted.insert(request_id);

        if seq < first - self.delay {
            trace!(request_id, "no statistics precede this request");
            return Ok(Dispatch::RunNow(state, None));
        }
        if let Some(stats) = self.available_statistics.remove(&seq) {
            return Ok(Dispatch::RunNow(state, Some(stats)));
        }
        if self.lost.remove(&seq) {
            debug!(request_id, seq, "statistics lost, running without");
            return Ok(Dispatch::RunNow(state, None));
        }
        if seq >= first && !self.submitted.contains(&seq) {
            debug!(request_id, seq, "no frame was requested for these statistics");
            return Ok(Dispatch::RunNow(state, None));
        }
        trace!(request_id, seq, "waiting for statistics");
        self.waiting_for_stats.insert(request_id, state);
        Ok(Dispatch::Parked)
    }

    /// Match statistics against a parked request or cache them.
    pub fn on_new_statistics(&mut self, seq: i64, stats: T) -> HalResult<Option<(i64, S, T)>> {
        let target = self.next_request_id_for_stats_seq(seq);
        if let Some(state) = self.waiting_for_stats.remove(&target) {
            return Ok(Some((target, state, stats)));
        }
        if self.available_statistics.contains_key(&seq) {
            error!(seq, "statistics delivered twice, find the bug");
            return Err(HalError::UnknownError(format!("duplicate statistics {seq}")));
        }
        self.available_statistics.insert(seq, stats);
        Ok(None)
    }

    /// The frame of `seq` will never produce statistics. Returns the request
    /// that was waiting for them, to be run without.
    pub fn on_stats_lost(&mut self, seq: i64) -> Option<(i64, S)> {
        let target = self.next_request_id_for_stats_seq(seq);
        match self.waiting_for_stats.remove(&target) {
            Some(state) => Some((target, state)),
            None => {
                self.lost.insert(seq);
                None
            }
        }
    }

    /// Track a request that was dispatched and now waits for its frame.
    pub fn move_to_image(&mut self, request_id: i64, state: S) {
        self.waiting_for_image.insert(request_id, state);
    }

    /// State of a request waiting for its frame.
    pub fn image_state_mut(&mut self, request_id: i64) -> Option<&mut S> {
        self.waiting_for_image.get_mut(&request_id)
    }

    /// Stop tracking a completed request.
    pub fn take_image(&mut self, request_id: i64) -> Option<S> {
        self.waiting_for_image.remove(&request_id)
    }

    /// Remove a request from whichever map holds it.
    pub fn take_any(&mut self, request_id: i64) -> Option<S> {
        self.waiting_for_stats
            .remove(&request_id)
            .or_else(|| self.waiting_for_image.remove(&request_id))
    }

    /// Empty the parked set, in id order.
    pub fn drain_waiting_for_stats(&mut self) -> Vec<(i64, S)> {
        std::mem::take(&mut self.waiting_for_stats).into_iter().collect()
    }

    /// Requests parked on statistics.
    pub fn waiting_for_stats_len(&self) -> usize {
        self.waiting_for_stats.len()
    }

    /// Requests waiting for their frame.
    pub fn waiting_for_image_len(&self) -> usize {
        self.waiting_for_image.len()
    }

    /// Statistics cached for requests not seen yet.
    pub fn available_statistics_len(&self) -> usize {
        self.available_statistics.len()
    }
}

/// Per-request 3A bookkeeping, pooled to the pipeline depth.
#[derive(Debug)]
pub struct RequestCtrlState {
    /// Request being tracked; `None` while the slot is free.
    pub request: Option<SharedRequest>,
    /// AE state reported in the results.
    pub ae_state: AeState,
    /// AF state reported in the results; AF is fixed focus here.
    pub af_state: u8,
    /// AWB state reported in the results.
    pub awb_state: u8,
    /// AE input computed from the request settings.
    pub ae_input: Option<AeInputParams>,
    /// Output of the AE run for this request.
    pub ae_results: Option<AeResults>,
    /// Sensor settings sent with the capture.
    pub capture_settings: Option<CaptureSettings>,
    /// Output buffers completed so far.
    pub output_buffers_done: usize,
    /// Buffers already handed back to their stream
    pub returned: Vec<CameraBuffer>,
    /// Shutter already reported.
    pub shutter_done: bool,
    /// Start of exposure once known.
    pub timestamp_ns: Option<i64>,
    /// Statistics of this request's own frame arrived
    pub statistics_seen: bool,
}

impl Default for RequestCtrlState {
    fn default() -> Self {
        Self {
            request: None,
            ae_state: AeState::Inactive,
            af_state: af_state::INACTIVE,
            awb_state: awb_state::INACTIVE,
            ae_input: None,
            ae_results: None,
            capture_settings: None,
            output_buffers_done: 0,
            returned: Vec::new(),
            shutter_done: false,
            timestamp_ns: None,
            statistics_seen: false,
        }
    }
}

impl RequestCtrlState {
    fn reset(&mut self) {
        *self = Self::default();
    }
}

type CtrlState = Loaned<RequestCtrlState>;

enum ControlMsg {
    NewRequest {
        request: SharedRequest,
    },
    NewImage(Arc<CapturedFrame>),
    NewStatistics(Arc<AaaStatistics>),
    NewShutter {
        request_id: i64,
        timestamp_ns: i64,
    },
    NewSensorDescriptor(Arc<SensorDescriptor>),
    RequestError {
        request_id: i64,
    },
    StatisticsLost {
        sequence: i64,
    },
    ConfigStreamsDone {
        changed: bool,
        reply: Reply<()>,
    },
    Flush {
        reply: Reply<()>,
    },
    Dump {
        reply: Reply<String>,
    },
    Exit {
        reply: Reply<()>,
    },
}

/// Forwards capture unit events into the control unit's mailbox.
struct CaptureEventForwarder {
    tx: mpsc::Sender<ControlMsg>,
}

impl CaptureListener for CaptureEventForwarder {
    fn notify_capture_event(&self, event: &CaptureEvent) -> HalResult<()> {
        let msg = match event {
            CaptureEvent::NewSensorDescriptor(d) => ControlMsg::NewSensorDescriptor(Arc::clone(d)),
            CaptureEvent::NewFrame(f) => ControlMsg::NewImage(Arc::clone(f)),
            CaptureEvent::NewStatistics(s) => ControlMsg::NewStatistics(Arc::clone(s)),
            CaptureEvent::Shutter {
                request_id,
                timestamp_ns,
            } => ControlMsg::NewShutter {
                request_id: *request_id,
                timestamp_ns: *timestamp_ns,
            },
            CaptureEvent::RequestError { request_id } => ControlMsg::RequestError {
                request_id: *request_id,
            },
            CaptureEvent::StatisticsLost { sequence } => ControlMsg::StatisticsLost {
                sequence: *sequence,
            },
        };
        actor::post(&self.tx, ACTOR, msg)
    }
}

/// Handle to the control unit actor.
#[derive(Clone)]
pub struct ControlUnit {
    tx: mpsc::Sender<ControlMsg>,
}

impl ControlUnit {
    /// Spawn the actor and subscribe it to every capture unit event.
    pub fn spawn(
        caps: Arc<CameraCapabilities>,
        capture: CaptureUnit,
        aaa: Box<dyn AaaControl>,
        jpeg: Arc<dyn JpegMaker>,
        queue_depth: usize,
    ) -> HalResult<Self> {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        let listener: Arc<dyn CaptureListener> = Arc::new(CaptureEventForwarder { tx: tx.clone() });
        for kind in EVENT_KINDS {
            capture.attach_listener(kind, Arc::clone(&listener))?;
        }

        let depth = caps.pipeline_depth();
        let actor = ControlUnitActor {
            camera_id: caps.id,
            sensor: SensorDescriptor::from_timing(&caps.sensor),
            correlator: Correlator::new(capture.sensor_setting_delay()),
            ctrl_pool: ItemPool::new_with_reset(depth, RequestCtrlState::default, RequestCtrlState::reset),
            ae_machine: AeStateMachine::default(),
            caps,
            capture,
            aaa,
            jpeg,
            listener,
        };
        actor::spawn_actor(ACTOR, actor.camera_id, actor.run(rx));
        Ok(Self { tx })
    }

    /// Start 3A for an accepted request. Does not block.
    pub fn process_request(&self, request: SharedRequest) -> HalResult<()> {
        actor::post(&self.tx, ACTOR, ControlMsg::NewRequest { request })
    }

    /// Stream configuration finished; `changed` resets correlation.
    pub async fn config_streams_done(&self, changed: bool) -> HalResult<()> {
        actor::call(&self.tx, ACTOR, |reply| ControlMsg::ConfigStreamsDone { changed, reply }).await
    }

    /// Fail every request still waiting for statistics.
    pub async fn flush(&self) -> HalResult<()> {
        actor::call(&self.tx, ACTOR, |reply| ControlMsg::Flush { reply }).await
    }

    /// Counters of the correlator maps.
    pub async fn dump(&self) -> HalResult<String> {
        actor::call(&self.tx, ACTOR, |reply| ControlMsg::Dump { reply }).await
    }

    /// Stop the actor.
    pub async fn shutdown(&self) -> HalResult<()> {
        actor::call(&self.tx, ACTOR, |reply| ControlMsg::Exit { reply }).await
    }
}

struct ControlUnitActor {
    camera_id: i32,
    caps: Arc<CameraCapabilities>,
    capture: CaptureUnit,
    aaa: Box<dyn AaaControl>,
    jpeg: Arc<dyn JpegMaker>,
    listener: Arc<dyn CaptureListener>,
    sensor: SensorDescriptor,
    correlator: Correlator<CtrlState, Arc<AaaStatistics>>,
    ctrl_pool: Arc<ItemPool<RequestCtrlState>>,
    ae_machine: AeStateMachine,
}

impl ControlUnitActor {
    async fn run(mut self, mut rx: mpsc::Receiver<ControlMsg>) {
        while let Some(msg) = rx.recv().await {
            match msg {
                ControlMsg::NewRequest { request } => {
                    if let Err(e) = self.handle_new_request(request) {
                        warn!(error = %e, "new request failed");
                    }
                }
                ControlMsg::NewImage(frame) => self.handle_new_image(&frame),
                ControlMsg::NewStatistics(stats) => self.handle_new_statistics(stats),
                ControlMsg::NewShutter {
                    request_id,
                    timestamp_ns,
                } => self.handle_new_shutter(request_id, timestamp_ns),
                ControlMsg::NewSensorDescriptor(sensor) => {
                    debug!(
                        frame_duration_us = sensor.frame_duration_us(),
                        "sensor descriptor"
                    );
                    self.sensor = (*sensor).clone();
                }
                ControlMsg::RequestError { request_id } => self.handle_request_error(request_id),
                ControlMsg::StatisticsLost { sequence } => self.handle_statistics_lost(sequence),
                ControlMsg::ConfigStreamsDone { changed, reply } => {
                    if changed {
                        self.correlator.reset();
                        self.ae_machine = AeStateMachine::default();
                    }
                    debug!(changed, "config streams done");
                    respond(reply, Ok(()));
                }
                ControlMsg::Flush { reply } => {
                    self.handle_flush();
                    respond(reply, Ok(()));
                }
                ControlMsg::Dump { reply } => respond(reply, Ok(self.dump())),
                ControlMsg::Exit { reply } => {
                    for (id, state) in self.correlator.drain_waiting_for_stats() {
                        self.fail_request(id, state);
                    }
                    for kind in EVENT_KINDS {
                        if let Err(e) = self.capture.detach_listener(kind, &self.listener) {
                            debug!(?kind, error = %e, "detach failed");
                        }
                    }
                    respond(reply, Ok(()));
                    break;
                }
            }
        }
        debug!(camera_id = self.camera_id, "control unit stopped");
    }

    fn handle_new_request(&mut self, request: SharedRequest) -> HalResult<()> {
        let id = request.id();
        let Some(mut state) = self.ctrl_pool.try_acquire() else {
            error!(request_id = id, "no control state available, find the bug");
            self.fail_untracked(&request);
            return Err(HalError::UnknownError("request control state pool exhausted".into()));
        };

        let params = {
            let settings = request.settings();
            state.ae_state = self.ae_machine.process(&settings);
            let ae_on = AeStateMachine::ae_enabled(&settings);
            self.aaa.fill_ae_input_params(&settings, &self.sensor, ae_on)
        };
        let params = match params {
            Ok(p) => p,
            Err(e) => {
                error!(request_id = id, error = %e, "failed to fill AE input");
                self.fail_untracked(&request);
                return Err(e);
            }
        };
        state.ae_input = Some(params);
        state.request = Some(request.clone());

        match self.correlator.on_new_request(id, state) {
            Ok(Dispatch::RunNow(state, stats)) => self.run_3a_and_capture(id, state, stats),
            Ok(Dispatch::Parked) => {}
            Err(e) => {
                self.fail_untracked(&request);
                return Err(e);
            }
        }
        Ok(())
    }

    fn run_3a_and_capture(&mut self, id: i64, mut state: CtrlState, stats: Option<Arc<AaaStatistics>>) {
        let Some(request) = state.request.clone() else {
            error!(request_id = id, "control state without request");
            return;
        };
        let Some(input) = state.ae_input.as_ref() else {
            error!(request_id = id, "control state without AE input");
            self.fail_request(id, state);
            return;
        };

        let results = match self.aaa.run_ae(input, stats.as_deref()) {
            Ok(r) => r,
            Err(e) => {
                error!(request_id = id, error = %e, "AE failed");
                self.fail_request(id, state);
                return;
            }
        };
        let settings = CaptureSettings::from_ae(&results, &self.sensor);
        trace!(
            request_id = id,
            stats = stats.as_ref().map(|s| s.frame_sequence),
            exposure_us = settings.exposure_time_us,
            iso = settings.sensitivity,
            "3A done"
        );
        state.af_state = af_state::FOCUSED_LOCKED;
        self.write_3a_results(&request, &state, &results, &settings);
        state.ae_results = Some(results);
        state.capture_settings = Some(settings.clone());

        if let Err(e) = self.capture.do_capture(request, settings) {
            error!(request_id = id, error = %e, "failed to post capture");
            self.fail_request(id, state);
            return;
        }
        self.correlator.move_to_image(id, state);
    }

    fn write_3a_results(
        &self,
        request: &SharedRequest,
        state: &RequestCtrlState,
        results: &AeResults,
        settings: &CaptureSettings,
    ) {
        let Some(mut meta) = request.partial_result_buffer(0) else {
            return;
        };
        let req_settings = request.settings();
        for (tag, default) in [
            (tags::CONTROL_MODE, tags::control_mode::AUTO),
            (tags::CONTROL_AE_MODE, tags::ae_mode::ON),
            (tags::CONTROL_CAPTURE_INTENT, tags::capture_intent::PREVIEW),
            (tags::CONTROL_AF_MODE, af_mode::OFF),
            (tags::CONTROL_AWB_MODE, awb_mode::AUTO),
            (tags::COLOR_CORRECTION_MODE, color_correction_mode::FAST),
        ] {
            meta.update(tag, req_settings.find_u8(tag).unwrap_or(default));
        }
        if let Some(regions) = req_settings.find_i32_slice(tags::CONTROL_AE_REGIONS) {
            meta.update(tags::CONTROL_AE_REGIONS, regions);
        }
        meta.update(tags::CONTROL_AE_STATE, state.ae_state.as_metadata());
        meta.update(tags::CONTROL_AF_STATE, state.af_state);
        meta.update(tags::CONTROL_AWB_STATE, state.awb_state);
        meta.update(
            tags::SENSOR_EXPOSURE_TIME,
            i64::from(results.exposure_time_us) * 1000,
        );
        meta.update(tags::SENSOR_SENSITIVITY, results.iso);
        meta.update(
            tags::SENSOR_FRAME_DURATION,
            (settings.frame_duration_us * 1000.0).round() as i64,
        );
        let frame_count = request_frame_count(request.id());
        meta.update(
            tags::REQUEST_ID,
            req_settings.find_i32(tags::REQUEST_ID).unwrap_or(frame_count),
        );
        meta.update(tags::REQUEST_FRAME_COUNT, frame_count);
    }

    fn handle_new_statistics(&mut self, stats: Arc<AaaStatistics>) {
        let seq = stats.frame_sequence;
        trace!(seq, luma = stats.mean_luma, "statistics");

        if let Some(state) = self.correlator.image_state_mut(seq) {
            state.statistics_seen = true;
            state.awb_state = awb_state::CONVERGED;
            if let Some(request) = state.request.as_ref() {
                if let Some(mut meta) = request.partial_result_buffer(0) {
                    meta.update(tags::CONTROL_AWB_STATE, awb_state::CONVERGED);
                    meta.update(tags::COLOR_CORRECTION_GAINS, vec![1.0_f32, 1.0, 1.0, 1.0]);
                }
            }
        }

        match self.correlator.on_new_statistics(seq, stats) {
            Ok(Some((id, state, stats))) => self.run_3a_and_capture(id, state, Some(stats)),
            Ok(None) => {}
            Err(e) => warn!(seq, error = %e, "statistics dropped"),
        }
    }

    fn handle_statistics_lost(&mut self, seq: i64) {
        debug!(seq, "statistics lost");
        if let Some((next, state)) = self.correlator.on_stats_lost(seq) {
            self.run_3a_and_capture(next, state, None);
        }
    }

    fn handle_new_shutter(&mut self, request_id: i64, timestamp_ns: i64) {
        let Some(state) = self.correlator.image_state_mut(request_id) else {
            warn!(request_id, "shutter for unknown request");
            return;
        };
        state.timestamp_ns = Some(timestamp_ns);
        if state.shutter_done {
            return;
        }
        state.shutter_done = true;
        let Some(request) = state.request.clone() else {
            return;
        };
        if let Some(mut meta) = request.partial_result_buffer(0) {
            meta.update(tags::SENSOR_TIMESTAMP, timestamp_ns);
        }
        if let Some(cb) = request.callback() {
            if let Err(e) = cb.shutter_done(&request, timestamp_ns) {
                warn!(request_id, error = %e, "shutter callback failed");
            }
        }
    }

    fn handle_new_image(&mut self, frame: &CapturedFrame) {
        let id = frame.request_id();
        let Some(state) = self.correlator.image_state_mut(id) else {
            error!(request_id = id, node = %frame.node, "image for unknown request, find the bug");
            return;
        };
        let request = frame.request.clone();
        let buffer = &frame.buffer;

        if buffer.format() == PixelFormat::Blob && buffer.status() == BufferStatus::Ok {
            let settings = request.settings();
            if let Err(e) = self.jpeg.handle_jpeg(&settings, buffer) {
                error!(request_id = id, error = %e, "jpeg encoding failed");
                buffer.set_status(BufferStatus::Error);
            }
        }

        if let Err(e) = frame.stream.capture_done(buffer, &request) {
            warn!(request_id = id, error = %e, "capture done failed");
        }
        state.output_buffers_done += 1;
        state.returned.push(buffer.clone());
        if state.timestamp_ns.is_none() {
            state.timestamp_ns = Some(frame.timestamp_ns);
        }
        trace!(
            request_id = id,
            done = state.output_buffers_done,
            total = request.number_output_bufs(),
            "buffer done"
        );

        if state.output_buffers_done < request.number_output_bufs() {
            return;
        }
        let Some(state) = self.correlator.take_image(id) else {
            return;
        };
        self.complete_request(id, &request, state);
    }

    fn complete_request(&mut self, id: i64, request: &SharedRequest, state: CtrlState) {
        let timestamp_ns = state.timestamp_ns.unwrap_or_default();
        if !state.statistics_seen {
            // Every buffer is back, so these statistics are not coming.
            self.handle_statistics_lost(id);
        }
        if let Some(mut meta) = request.partial_result_buffer(0) {
            let depth = u8::try_from(self.caps.pipeline_depth()).unwrap_or(u8::MAX);
            meta.update(tags::REQUEST_PIPELINE_DEPTH, depth);
            if !meta.contains(tags::SENSOR_TIMESTAMP) {
                meta.update(tags::SENSOR_TIMESTAMP, timestamp_ns);
            }
        }
        let Some(cb) = request.callback() else {
            error!(request_id = id, "request has no callback");
            return;
        };
        if !state.shutter_done {
            warn!(request_id = id, "completing before shutter");
            if let Err(e) = cb.shutter_done(request, timestamp_ns) {
                warn!(request_id = id, error = %e, "shutter callback failed");
            }
        }
        for index in 0..request.partial_result_count() {
            if let Err(e) = cb.metadata_done(request, index) {
                warn!(request_id = id, index, error = %e, "metadata callback failed");
            }
        }
        debug!(request_id = id, "request complete");
        drop(state);
    }

    fn handle_request_error(&mut self, request_id: i64) {
        match self.correlator.take_any(request_id) {
            Some(state) => self.fail_request(request_id, state),
            None => warn!(request_id, "error for unknown request"),
        }
    }

    /// Return every outstanding buffer of a tracked request with error
    /// status and notify the framework.
    fn fail_request(&mut self, request_id: i64, state: CtrlState) {
        if let Some(request) = state.request.clone() {
            self.return_error_buffers(&request, &state.returned);
        }
        drop(state);
        if let Err(e) = self.capture.cancel_request(request_id) {
            debug!(request_id, error = %e, "cancel not delivered");
        }
        if let Some((next, state)) = self.correlator.on_stats_lost(request_id) {
            self.run_3a_and_capture(next, state, None);
        }
    }

    /// Fail a request that never entered the correlator.
    fn fail_untracked(&mut self, request: &SharedRequest) {
        self.return_error_buffers(request, &[]);
        if let Err(e) = self.capture.cancel_request(request.id()) {
            debug!(request_id = request.id(), error = %e, "cancel not delivered");
        }
        if let Some((next, state)) = self.correlator.on_stats_lost(request.id()) {
            self.run_3a_and_capture(next, state, None);
        }
    }

    fn return_error_buffers(&self, request: &SharedRequest, returned: &[CameraBuffer]) {
        let id = request.id();
        warn!(request_id = id, "request failed");
        if let Some(cb) = request.callback() {
            if let Err(e) = cb.request_error(request) {
                warn!(request_id = id, error = %e, "error callback failed");
            }
        }
        for buffer in request.output_buffers() {
            if returned.iter().any(|b| b.same_as(buffer)) {
                continue;
            }
            buffer.set_status(BufferStatus::Error);
            match buffer.owner() {
                Some(stream) => {
                    if let Err(e) = stream.capture_done(buffer, request) {
                        warn!(request_id = id, error = %e, "returning error buffer failed");
                    }
                }
                None => error!(request_id = id, "buffer without stream"),
            }
        }
    }

    fn handle_flush(&mut self) {
        let parked = self.correlator.drain_waiting_for_stats();
        info!(
            camera_id = self.camera_id,
            parked = parked.len(),
            waiting_for_image = self.correlator.waiting_for_image_len(),
            "control unit flush"
        );
        for (id, state) in parked {
            self.fail_request(id, state);
        }
    }

    fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "ControlUnit camera {}: delay {}, first request {:?}",
            self.camera_id,
            self.correlator.delay(),
            self.correlator.first_request()
        );
        let _ = writeln!(
            out,
            "  waiting for stats {}, waiting for image {}, cached stats {}, ctrl states {}/{}",
            self.correlator.waiting_for_stats_len(),
            self.correlator.waiting_for_image_len(),
            self.correlator.available_statistics_len(),
            self.ctrl_pool.in_use(),
            self.ctrl_pool.capacity()
        );
        out
    }
}

/// `REQUEST_FRAME_COUNT` is an `i32`; ids past its range wrap.
fn request_frame_count(request_id: i64) -> i32 {
    let wrapped = request_id.rem_euclid(i64::from(i32::MAX) + 1);
    i32::try_from(wrapped).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_frame_count_wraps() {
        assert_eq!(request_frame_count(7), 7);
        assert_eq!(request_frame_count(i64::from(i32::MAX)), i32::MAX);
        assert_eq!(request_frame_count(i64::from(i32::MAX) + 1), 0);
        assert_eq!(request_frame_count(i64::from(i32::MAX) + 5), 4);
    }

    fn run_now<S, T>(d: Dispatch<S, T>) -> (S, Option<T>) {
        match d {
            Dispatch::RunNow(s, t) => (s, t),
            Dispatch::Parked => panic!("expected RunNow"),
        }
    }

    #[test]
    fn test_offsets_round_trip() {
        let c: Correlator<(), ()> = Correlator::new(2);
        for seq in -2..20 {
            let id = c.next_request_id_for_stats_seq(seq);
            assert_eq!(id, seq + 3);
            assert_eq!(c.stats_seq_for_request(id), seq);
        }
    }

    #[test]
    fn test_first_request_runs_and_skip_stats_unlock_next() {
        let mut c: Correlator<&str, u32> = Correlator::new(2);
        let (s, stats) = run_now(c.on_new_request(0, "r0").unwrap());
        assert_eq!((s, stats), ("r0", None));
        assert!(matches!(c.on_new_request(1, "r1").unwrap(), Dispatch::Parked));
        assert!(matches!(c.on_new_request(2, "r2").unwrap(), Dispatch::Parked));
        assert!(matches!(c.on_new_request(3, "r3").unwrap(), Dispatch::Parked));

        // Skip frame statistics carry -2 and -1.
        assert_eq!(c.on_new_statistics(-2, 10).unwrap(), Some((1, "r1", 10)));
        assert_eq!(c.on_new_statistics(-1, 11).unwrap(), Some((2, "r2", 11)));
        assert_eq!(c.on_new_statistics(0, 12).unwrap(), Some((3, "r3", 12)));
        assert_eq!(c.waiting_for_stats_len(), 0);
    }

    #[test]
    fn test_statistics_before_request_are_cached() {
        let mut c: Correlator<&str, u32> = Correlator::new(1);
        run_now(c.on_new_request(5, "r5").unwrap());
        assert_eq!(c.on_new_statistics(4, 40).unwrap(), None);
        assert_eq!(c.available_statistics_len(), 1);
        let (s, stats) = run_now(c.on_new_request(6, "r6").unwrap());
        assert_eq!((s, stats), ("r6", Some(40)));
        assert_eq!(c.available_statistics_len(), 0);
    }

    #[test]
    fn test_duplicate_statistics_rejected() {
        let mut c: Correlator<&str, u32> = Correlator::new(2);
        run_now(c.on_new_request(0, "r0").unwrap());
        assert_eq!(c.on_new_statistics(7, 1).unwrap(), None);
        assert!(matches!(
            c.on_new_statistics(7, 2),
            Err(HalError::UnknownError(_))
        ));
    }

    #[test]
    fn test_duplicate_request_rejected() {
        let mut c: Correlator<&str, u32> = Correlator::new(0);
        let (s, _) = run_now(c.on_new_request(0, "r0").unwrap());
        c.move_to_image(0, s);
        assert!(c.on_new_request(0, "again").is_err());
    }

    #[test]
    fn test_lost_statistics_release_waiter() {
        let mut c: Correlator<&str, u32> = Correlator::new(2);
        run_now(c.on_new_request(0, "r0").unwrap());
        assert!(matches!(c.on_new_request(3, "r3").unwrap(), Dispatch::Parked));
        assert_eq!(c.on_stats_lost(0), Some((3, "r3")));

        // Lost before the waiter shows up.
        assert_eq!(c.on_stats_lost(1), None);
        let (s, stats) = run_now(c.on_new_request(4, "r4").unwrap());
        assert_eq!((s, stats), ("r4", None));
    }

    #[test]
    fn test_gap_in_request_ids_does_not_park() {
        let mut c: Correlator<&str, u32> = Correlator::new(2);
        run_now(c.on_new_request(3, "r3").unwrap());
        assert!(matches!(c.on_new_request(4, "r4").unwrap(), Dispatch::Parked));
        // Nobody asked for frame 7, so request 10 cannot wait for it.
        let (s, stats) = run_now(c.on_new_request(10, "r10").unwrap());
        assert_eq!((s, stats), ("r10", None));
        // Frame 10 exists, so request 13 waits.
        assert!(matches!(c.on_new_request(13, "r13").unwrap(), Dispatch::Parked));
    }

    #[test]
    fn test_unpark_follows_statistics_arrival_order() {
        let mut c: Correlator<i64, i64> = Correlator::new(2);
        run_now(c.on_new_request(0, 0).unwrap());
        for id in 1..=3 {
            assert!(matches!(c.on_new_request(id, id).unwrap(), Dispatch::Parked));
        }
        let mut order = Vec::new();
        for seq in [0, -2, -1] {
            if let Some((id, _, _)) = c.on_new_statistics(seq, seq).unwrap() {
                order.push(id);
            }
        }
        assert_eq!(order, vec![3, 1, 2]);
    }

    #[test]
    fn test_reset_forgets_everything() {
        let mut c: Correlator<&str, u32> = Correlator::new(2);
        run_now(c.on_new_request(10, "r10").unwrap());
        assert!(matches!(c.on_new_request(11, "r11").unwrap(), Dispatch::Parked));
        c.on_new_statistics(30, 1).unwrap();
        c.reset();
        assert_eq!(c.first_request(), None);
        assert_eq!(c.waiting_for_stats_len(), 0);
        assert_eq!(c.available_statistics_len(), 0);
        let (s, _) = run_now(c.on_new_request(20, "r20").unwrap());
        assert_eq!(s, "r20");
    }

    #[test]
    fn test_ctrl_state_reset() {
        let mut s = RequestCtrlState {
            output_buffers_done: 3,
            shutter_done: true,
            ..Default::default()
        };
        s.reset();
        assert_eq!(s.output_buffers_done, 0);
        assert!(!s.shutter_done);
        assert!(s.request.is_none());
    }
}
