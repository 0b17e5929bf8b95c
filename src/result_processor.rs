//! Result processor: orders what the pipeline produces into what the
//! framework expects.
//!
//! For every request the shutter notification goes out first; buffers and
//! partial results that arrive earlier are held until then. A failed request
//! gets an error notification and its buffers are passed through. Once all
//! output buffers and partial results of a request are out, the request is
//! handed back through [`RequestRecycler`].

use crate::actor::{self, respond, Reply};
use crate::buffer::CameraBuffer;
use crate::callbacks::{CaptureResult, ErrorCode, NotifyMessage, SharedCallbacks};
use crate::request::{RequestCallback, SharedRequest};
use hal_core::HalResult;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

const ACTOR: &str = "result_processor";

/// Receives requests the result processor is done with.
pub trait RequestRecycler: Send + Sync {
    /// Every result of `request` reached the framework.
    fn request_done(&self, request: SharedRequest);
}

enum ResultMsg {
    Register { request: SharedRequest },
    Unregister { request_id: i64 },
    ShutterDone { request: SharedRequest, timestamp_ns: i64 },
    MetadataDone { request: SharedRequest, partial_index: usize },
    BufferDone { request: SharedRequest, buffer: CameraBuffer },
    RequestError { request: SharedRequest },
    InTransit { reply: Reply<usize> },
    Exit { reply: Reply<()> },
}

/// Handle to the result processor actor. Installed as the callback of every
/// request.
#[derive(Clone)]
pub struct ResultProcessor {
    tx: mpsc::Sender<ResultMsg>,
}

impl ResultProcessor {
    /// Start the actor for one camera.
    pub fn spawn(
        camera_id: i32,
        callbacks: SharedCallbacks,
        recycler: Arc<dyn RequestRecycler>,
        queue_depth: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        let actor = ResultProcessorActor {
            callbacks,
            recycler,
            in_transit: BTreeMap::new(),
        };
        actor::spawn_actor(ACTOR, camera_id, actor.run(rx));
        Self { tx }
    }

    /// Start tracking `request`. Registering twice is ignored.
    pub fn register_request(&self, request: &SharedRequest) -> HalResult<()> {
        actor::post(&self.tx, ACTOR, ResultMsg::Register { request: request.clone() })
    }

    /// Stop tracking a request the pipeline never accepted. It is dropped,
    /// not recycled.
    pub fn unregister_request(&self, request: &SharedRequest) -> HalResult<()> {
        actor::post(&self.tx, ACTOR, ResultMsg::Unregister { request_id: request.id() })
    }

    /// Number of registered requests not yet recycled.
    pub async fn in_transit(&self) -> HalResult<usize> {
        actor::call(&self.tx, ACTOR, |reply| ResultMsg::InTransit { reply }).await
    }

    /// Stop the actor.
    pub async fn shutdown(&self) -> HalResult<()> {
        actor::call(&self.tx, ACTOR, |reply| ResultMsg::Exit { reply }).await
    }
}

impl RequestCallback for ResultProcessor {
    fn shutter_done(&self, request: &SharedRequest, timestamp_ns: i64) -> HalResult<()> {
        actor::post(
            &self.tx,
            ACTOR,
            ResultMsg::ShutterDone {
                request: request.clone(),
                timestamp_ns,
            },
        )
    }

    fn metadata_done(&self, request: &SharedRequest, partial_index: usize) -> HalResult<()> {
        actor::post(
            &self.tx,
            ACTOR,
            ResultMsg::MetadataDone {
                request: request.clone(),
                partial_index,
            },
        )
    }

    fn buffer_done(&self, request: &SharedRequest, buffer: &CameraBuffer) -> HalResult<()> {
        actor::post(
            &self.tx,
            ACTOR,
            ResultMsg::BufferDone {
                request: request.clone(),
                buffer: buffer.clone(),
            },
        )
    }

    fn request_error(&self, request: &SharedRequest) -> HalResult<()> {
        actor::post(&self.tx, ACTOR, ResultMsg::RequestError { request: request.clone() })
    }
}

struct RequestState {
    request: SharedRequest,
    shutter_sent: bool,
    errored: bool,
    pending_buffers: Vec<CameraBuffer>,
    pending_partials: Vec<usize>,
    buffers_to_return: usize,
    buffers_returned: usize,
    partials_to_return: usize,
    partials_returned: usize,
}

impl RequestState {
    fn is_done(&self) -> bool {
        self.buffers_returned >= self.buffers_to_return
            && self.partials_returned >= self.partials_to_return
    }

    fn frame_number(&self) -> u32 {
        u32::try_from(self.request.id()).unwrap_or_default()
    }
}

struct ResultProcessorActor {
    callbacks: SharedCallbacks,
    recycler: Arc<dyn RequestRecycler>,
    in_transit: BTreeMap<i64, RequestState>,
}

impl ResultProcessorActor {
    async fn run(mut self, mut rx: mpsc::Receiver<ResultMsg>) {
        while let Some(msg) = rx.recv().await {
            match msg {
                ResultMsg::Register { request } => self.handle_register(request),
                ResultMsg::Unregister { request_id } => {
                    if self.in_transit.remove(&request_id).is_some() {
                        debug!(request_id, "request unregistered");
                    }
                }
                ResultMsg::ShutterDone {
                    request,
                    timestamp_ns,
                } => self.handle_shutter_done(&request, timestamp_ns),
                ResultMsg::MetadataDone {
                    request,
                    partial_index,
                } => self.handle_metadata_done(&request, partial_index),
                ResultMsg::BufferDone { request, buffer } => {
                    self.handle_buffer_done(&request, buffer);
                }
                ResultMsg::RequestError { request } => self.handle_request_error(&request),
                ResultMsg::InTransit { reply } => respond(reply, Ok(self.in_transit.len())),
                ResultMsg::Exit { reply } => {
                    if !self.in_transit.is_empty() {
                        warn!(outstanding = self.in_transit.len(), "exiting with requests in transit");
                    }
                    respond(reply, Ok(()));
                    break;
                }
            }
        }
        debug!("result processor stopped");
    }

    fn handle_register(&mut self, request: SharedRequest) {
        let id = request.id();
        if self.in_transit.contains_key(&id) {
            warn!(request_id = id, "request registered twice, ignoring");
            return;
        }
        trace!(request_id = id, "request registered");
        self.in_transit.insert(
            id,
            RequestState {
                buffers_to_return: request.number_output_bufs(),
                partials_to_return: request.partial_result_count(),
                request,
                shutter_sent: false,
                errored: false,
                pending_buffers: Vec::new(),
                pending_partials: Vec::new(),
                buffers_returned: 0,
                partials_returned: 0,
            },
        );
    }

    fn state_mut(&mut self, request: &SharedRequest) -> Option<&mut RequestState> {
        let id = request.id();
        let state = self.in_transit.get_mut(&id);
        if state.is_none() {
            error!(request_id = id, "request was not registered, find the bug");
        }
        state
    }

    fn handle_shutter_done(&mut self, request: &SharedRequest, timestamp_ns: i64) {
        let callbacks = Arc::clone(&self.callbacks);
        let Some(state) = self.state_mut(request) else {
            return;
        };
        if state.shutter_sent {
            trace!(request_id = request.id(), "shutter already sent");
            return;
        }
        state.shutter_sent = true;
        callbacks.notify(NotifyMessage::Shutter {
            frame_number: state.frame_number(),
            timestamp_ns,
        });
        Self::return_pending(callbacks.as_ref(), state);
        self.recycle_if_done(request.id());
    }

    fn handle_metadata_done(&mut self, request: &SharedRequest, partial_index: usize) {
        let callbacks = Arc::clone(&self.callbacks);
        let Some(state) = self.state_mut(request) else {
            return;
        };
        if state.errored {
            debug!(request_id = request.id(), partial_index, "dropping metadata of failed request");
            return;
        }
        if !state.shutter_sent {
            trace!(request_id = request.id(), partial_index, "metadata before shutter, holding");
            state.pending_partials.push(partial_index);
            return;
        }
        Self::return_partial(callbacks.as_ref(), state, partial_index);
        self.recycle_if_done(request.id());
    }

    fn handle_buffer_done(&mut self, request: &SharedRequest, buffer: CameraBuffer) {
        let callbacks = Arc::clone(&self.callbacks);
        let Some(state) = self.state_mut(request) else {
            return;
        };
        if !state.shutter_sent && !state.errored {
            trace!(request_id = request.id(), "buffer before shutter, holding");
            state.pending_buffers.push(buffer);
            return;
        }
        Self::return_buffer(callbacks.as_ref(), state, buffer);
        self.recycle_if_done(request.id());
    }

    fn handle_request_error(&mut self, request: &SharedRequest) {
        let callbacks = Arc::clone(&self.callbacks);
        let Some(state) = self.state_mut(request) else {
            return;
        };
        if state.errored {
            return;
        }
        state.errored = true;
        callbacks.notify(NotifyMessage::Error {
            frame_number: state.frame_number(),
            code: ErrorCode::Request,
        });
        // No metadata follows an error notification.
        state.pending_partials.clear();
        state.partials_returned = state.partials_to_return;
        for buffer in std::mem::take(&mut state.pending_buffers) {
            Self::return_buffer(callbacks.as_ref(), state, buffer);
        }
        self.recycle_if_done(request.id());
    }

    fn return_pending(callbacks: &dyn crate::callbacks::FrameworkCallbacks, state: &mut RequestState) {
        for buffer in std::mem::take(&mut state.pending_buffers) {
            Self::return_buffer(callbacks, state, buffer);
        }
        let mut partials = std::mem::take(&mut state.pending_partials);
        partials.sort_unstable();
        for index in partials {
            Self::return_partial(callbacks, state, index);
        }
    }

    fn return_buffer(
        callbacks: &dyn crate::callbacks::FrameworkCallbacks,
        state: &mut RequestState,
        buffer: CameraBuffer,
    ) {
        if state.buffers_returned >= state.buffers_to_return {
            warn!(request_id = state.request.id(), "trying to return buffers twice");
            return;
        }
        let mut result = CaptureResult {
            frame_number: state.frame_number(),
            ..Default::default()
        };
        if state.request.is_input_buffer(&buffer) {
            result.input_buffer = Some(buffer);
        } else {
            result.output_buffers.push(buffer);
        }
        callbacks.process_capture_result(result);
        state.buffers_returned += 1;
        trace!(
            request_id = state.request.id(),
            returned = state.buffers_returned,
            total = state.buffers_to_return,
            "buffer returned"
        );
    }

    fn return_partial(
        callbacks: &dyn crate::callbacks::FrameworkCallbacks,
        state: &mut RequestState,
        index: usize,
    ) {
        let Some(meta) = state.request.partial_result_buffer(index) else {
            return;
        };
        let metadata = meta.clone();
        drop(meta);
        callbacks.process_capture_result(CaptureResult {
            frame_number: state.frame_number(),
            metadata: Some(metadata),
            partial_result: u32::try_from(index + 1).unwrap_or(u32::MAX),
            ..Default::default()
        });
        state.partials_returned += 1;
    }

    fn recycle_if_done(&mut self, request_id: i64) {
        let done = self.in_transit.get(&request_id).is_some_and(RequestState::is_done);
        if !done {
            return;
        }
        if let Some(state) = self.in_transit.remove(&request_id) {
            debug!(request_id, errored = state.errored, "request out of result processor");
            self.recycler.request_done(state.request);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferStatus;
    use crate::testing::{single_stream_request, RecordingCallbacks};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Collect {
        done: Mutex<Vec<i64>>,
    }

    impl RequestRecycler for Collect {
        fn request_done(&self, request: SharedRequest) {
            self.done.lock().push(request.id());
        }
    }

    async fn settle(rp: &ResultProcessor) {
        // A synchronous round trip drains everything posted before it.
        rp.in_transit().await.unwrap();
    }

    #[tokio::test]
    async fn test_buffers_held_until_shutter() {
        let callbacks = Arc::new(RecordingCallbacks::default());
        let recycler = Arc::new(Collect::default());
        let rp = ResultProcessor::spawn(0, callbacks.clone(), recycler.clone(), 16);
        let request = single_stream_request(4, Arc::new(rp.clone()));
        let buffer = request.output_buffers()[0].clone();

        rp.register_request(&request).unwrap();
        rp.buffer_done(&request, &buffer).unwrap();
        rp.metadata_done(&request, 0).unwrap();
        settle(&rp).await;
        assert!(callbacks.events().is_empty());

        rp.shutter_done(&request, 1234).unwrap();
        settle(&rp).await;
        let events = callbacks.events();
        assert_eq!(events[0], "shutter 4 1234");
        assert!(events[1..].contains(&"buffer 4".to_string()));
        assert!(events[1..].contains(&"result 4 partial 1".to_string()));
        assert_eq!(*recycler.done.lock(), vec![4]);
        assert_eq!(rp.in_transit().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_error_passes_buffers_and_recycles() {
        let callbacks = Arc::new(RecordingCallbacks::default());
        let recycler = Arc::new(Collect::default());
        let rp = ResultProcessor::spawn(0, callbacks.clone(), recycler.clone(), 16);
        let request = single_stream_request(9, Arc::new(rp.clone()));
        let buffer = request.output_buffers()[0].clone();
        buffer.set_status(BufferStatus::Error);

        rp.register_request(&request).unwrap();
        rp.register_request(&request).unwrap();
        rp.request_error(&request).unwrap();
        rp.buffer_done(&request, &buffer).unwrap();
        settle(&rp).await;

        assert_eq!(callbacks.events(), vec!["error 9 Request", "buffer 9 error"]);
        assert_eq!(*recycler.done.lock(), vec![9]);
    }

    #[tokio::test]
    async fn test_unregistered_request_is_dropped_not_recycled() {
        let callbacks = Arc::new(RecordingCallbacks::default());
        let recycler = Arc::new(Collect::default());
        let rp = ResultProcessor::spawn(0, callbacks.clone(), recycler.clone(), 16);
        let request = single_stream_request(3, Arc::new(rp.clone()));

        rp.register_request(&request).unwrap();
        assert_eq!(rp.in_transit().await.unwrap(), 1);
        rp.unregister_request(&request).unwrap();
        assert_eq!(rp.in_transit().await.unwrap(), 0);
        assert!(callbacks.events().is_empty());
        assert!(recycler.done.lock().is_empty());
    }
}
