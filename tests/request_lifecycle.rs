//! Request admission through `CameraDevice`: validation, ordering,
//! settings carry-over, back-pressure and flush.

mod common;

use camera_hal::camera_hw::CameraHw;
use camera_hal::request::{RequestCallback, MAX_NUMBER_OUTPUT_STREAMS};
use camera_hal::request_thread::MAX_REQUEST_IN_PROCESS_NUM;
use camera_hal::{
    Camera3Request, Camera3Stream, CameraBuffer, CameraCapabilities, HalError, HalResult,
    PixelFormat, PlatformConfig, SharedRequest, StreamType,
};
use camera_hal::hw::{FrameTiming, SimFault};
use common::{eventually, request, Harness};
use serial_test::serial;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

struct Ignore;

impl RequestCallback for Ignore {
    fn shutter_done(&self, _: &SharedRequest, _: i64) -> HalResult<()> {
        Ok(())
    }
    fn metadata_done(&self, _: &SharedRequest, _: usize) -> HalResult<()> {
        Ok(())
    }
    fn buffer_done(&self, _: &SharedRequest, _: &CameraBuffer) -> HalResult<()> {
        Ok(())
    }
    fn request_error(&self, _: &SharedRequest) -> HalResult<()> {
        Ok(())
    }
}

fn preview() -> Arc<Camera3Stream> {
    Camera3Stream::output(64, 48, PixelFormat::Ycbcr420)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn frame_numbers_must_increase() {
    let h = Harness::open(FrameTiming::Immediate).await;
    let stream = preview();
    h.device.configure_streams(vec![stream.clone()]).await.unwrap();
    let streams = [stream];

    h.submit(3, &streams, Some(h.preview_settings().await)).await.unwrap();
    assert!(matches!(h.submit(3, &streams, None).await, Err(HalError::BadValue(_))));
    assert!(matches!(h.submit(2, &streams, None).await, Err(HalError::BadValue(_))));
    assert!(eventually(WAIT, || h.recorder.count("result 3 partial 1") == 1).await);
    h.submit(4, &streams, None).await.unwrap();
    assert!(eventually(WAIT, || h.recorder.count("result 4 partial 1") == 1).await);
    // Gaps are allowed.
    h.submit(10, &streams, None).await.unwrap();

    assert!(eventually(WAIT, || h.recorder.count("result 10 partial 1") == 1).await);
    assert_eq!(h.recorder.shutter_order(), vec![3, 4, 10]);
    h.device.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn output_buffer_count_is_bounded() {
    let h = Harness::open(FrameTiming::Immediate).await;
    let stream = preview();
    h.device.configure_streams(vec![stream.clone()]).await.unwrap();
    let settings = h.preview_settings().await;

    let empty = request(0, &[], Some(settings.clone()));
    assert!(matches!(
        h.device.process_capture_request(empty).await,
        Err(HalError::BadValue(_))
    ));

    let too_many = request(1, &vec![stream.clone(); MAX_NUMBER_OUTPUT_STREAMS + 1], Some(settings.clone()));
    assert!(matches!(
        h.device.process_capture_request(too_many).await,
        Err(HalError::BadValue(_))
    ));

    // Rejected requests leave nothing behind.
    assert_eq!(h.device.outstanding(), 0);
    assert_eq!(stream.bound().unwrap().buffers_in_hal(), 0);
    h.submit(2, &[stream], Some(settings)).await.unwrap();
    assert!(eventually(WAIT, || h.recorder.count("result 2 partial 1") == 1).await);
    h.device.close().await.unwrap();
}

#[tokio::test]
async fn configured_streams_sort_by_area_then_sequence() {
    let h = Harness::open(FrameTiming::Manual).await;
    let small = Camera3Stream::output(320, 240, PixelFormat::Ycbcr420);
    let wide = Camera3Stream::output(640, 480, PixelFormat::Ycbcr420);
    let tall = Camera3Stream::output(480, 640, PixelFormat::Ycbcr420);
    h.device
        .configure_streams(vec![small.clone(), wide.clone(), tall.clone()])
        .await
        .unwrap();
    let seq = |s: &Arc<Camera3Stream>| s.bound().unwrap().seq_no();
    assert_eq!((seq(&small), seq(&wide), seq(&tall)), (0, 1, 2));

    let raw = request(0, &[small.clone(), tall.clone(), wide.clone(), small.clone(), tall], None);
    let mut req = Camera3Request::new();
    req.init(&raw, Some(Arc::new(Ignore)), Default::default(), &h.caps)
        .unwrap();
    let order: Vec<u32> = req.output_streams().iter().map(|s| s.seq_no()).collect();
    assert_eq!(order, vec![1, 2, 0]);
    assert_eq!(req.number_output_bufs(), 5);
    req.de_init();
    h.device.close().await.unwrap();
}

#[test]
fn partial_result_reset_keeps_capacity_and_clears_content() {
    let mut req = Camera3Request::new();
    req.init_partial_result_buffers(3).unwrap();
    req.partial_result_buffer(2)
        .unwrap()
        .update(hal_core::metadata::tags::JPEG_QUALITY, 90_u8);

    let sizes = |req: &Camera3Request| {
        (0..3)
            .map(|i| {
                let meta = req.partial_result_buffer(i).unwrap();
                assert!(meta.is_empty());
                (meta.entry_capacity(), meta.data_capacity())
            })
            .collect::<Vec<_>>()
    };
    req.init_partial_result_buffers(3).unwrap();
    let first = sizes(&req);
    req.init_partial_result_buffers(3).unwrap();
    assert_eq!(sizes(&req), first);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn settings_carry_over_from_the_previous_request() {
    let h = Harness::open(FrameTiming::Immediate).await;
    let stream = preview();
    h.device.configure_streams(vec![stream.clone()]).await.unwrap();
    let streams = [stream];

    assert!(matches!(h.submit(0, &streams, None).await, Err(HalError::BadValue(_))));
    h.submit(1, &streams, Some(h.preview_settings().await)).await.unwrap();
    h.submit(2, &streams, None).await.unwrap();
    assert!(eventually(WAIT, || h.recorder.count("result 2 partial 1") == 1).await);
    assert_eq!(h.recorder.count("error 2 Request"), 0);
    h.device.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn full_pipeline_blocks_the_caller_until_a_request_completes() {
    let h = Harness::open(FrameTiming::Manual).await;
    let depth = h.caps.pipeline_depth() as u32;
    let stream = preview();
    h.device.configure_streams(vec![stream.clone()]).await.unwrap();
    let streams = vec![stream];

    h.submit(0, &streams, Some(h.preview_settings().await)).await.unwrap();
    for n in 1..depth {
        h.submit(n, &streams, None).await.unwrap();
    }

    let device = h.device.clone();
    let blocked_streams = streams.clone();
    let mut blocked = tokio::spawn(async move {
        device
            .process_capture_request(request(depth, &blocked_streams, None))
            .await
    });
    assert!(tokio::time::timeout(Duration::from_millis(100), &mut blocked)
        .await
        .is_err());
    assert_eq!(h.device.outstanding(), depth as usize + 1);

    let backend = h.backend.clone();
    let pump = tokio::spawn(async move {
        loop {
            backend.complete_all();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    });
    let admitted = tokio::time::timeout(WAIT, blocked).await.unwrap().unwrap();
    assert!(admitted.is_ok());
    assert!(eventually(WAIT, || h.recorder.count(&format!("result {depth} partial 1")) == 1).await);
    assert!(eventually(WAIT, || h.device.outstanding() == 0).await);
    pump.abort();
    h.device.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn flush_drains_in_flight_requests() {
    let h = Harness::open(FrameTiming::Immediate).await;
    let stream = preview();
    h.device.configure_streams(vec![stream.clone()]).await.unwrap();
    let streams = [stream];

    h.submit(0, &streams, Some(h.preview_settings().await)).await.unwrap();
    for n in 1..3 {
        h.submit(n, &streams, None).await.unwrap();
    }
    h.device.flush().await.unwrap();
    assert_eq!(h.device.outstanding(), 0);

    // Every request is accounted for, completed or failed.
    for n in 0..3 {
        let done = h.recorder.count(&format!("result {n} partial 1"));
        let failed = h.recorder.count(&format!("error {n} Request"));
        assert_eq!(done + failed, 1, "request {n}: {:?}", h.recorder.events());
    }

    // The device keeps working after a flush.
    h.submit(3, &streams, None).await.unwrap();
    assert!(eventually(WAIT, || h.recorder.count("result 3 partial 1") == 1).await);
    h.device.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn flush_gives_up_when_hardware_never_returns() {
    let h = Harness::open(FrameTiming::Manual).await;
    let stream = preview();
    h.device.configure_streams(vec![stream.clone()]).await.unwrap();
    h.submit(0, &[stream], Some(h.preview_settings().await)).await.unwrap();

    assert!(matches!(h.device.flush().await, Err(HalError::NoDevice(_))));
    assert_eq!(h.device.outstanding(), 1);

    h.backend.complete_all();
    assert!(eventually(WAIT, || h.device.outstanding() == 0).await);
    assert_eq!(h.recorder.count("result 0 partial 1"), 1);
    h.device.close().await.unwrap();
}

#[tokio::test]
async fn stream_configuration_is_validated() {
    let h = Harness::open(FrameTiming::Manual).await;
    let input = || Camera3Stream::new(StreamType::Input, 64, 48, PixelFormat::Ycbcr420, 0);

    assert!(matches!(
        h.device.configure_streams(Vec::new()).await,
        Err(HalError::BadValue(_))
    ));
    assert!(matches!(
        h.device.configure_streams(vec![input()]).await,
        Err(HalError::BadValue(_))
    ));
    assert!(matches!(
        h.device.configure_streams(vec![preview(), input(), input()]).await,
        Err(HalError::BadValue(_))
    ));
    h.device.configure_streams(vec![preview(), input()]).await.unwrap();
    h.device.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reconfiguration_is_refused_while_requests_are_in_flight() {
    let h = Harness::open(FrameTiming::Manual).await;
    let stream = preview();
    h.device.configure_streams(vec![stream.clone()]).await.unwrap();
    h.submit(0, &[stream.clone()], Some(h.preview_settings().await)).await.unwrap();

    assert!(matches!(
        h.device.configure_streams(vec![preview()]).await,
        Err(HalError::BadValue(_))
    ));

    h.backend.complete_all();
    assert!(eventually(WAIT, || h.device.outstanding() == 0).await);
    let replacement = Camera3Stream::output(32, 24, PixelFormat::Ycbcr420);
    h.device.configure_streams(vec![replacement.clone()]).await.unwrap();
    assert_eq!(replacement.bound().unwrap().seq_no(), 1);
    assert!(!stream.bound().unwrap().is_active());
    h.device.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn input_buffers_are_refused_without_reprocessing() {
    let h = Harness::open(FrameTiming::Manual).await;
    let out = preview();
    let input = Camera3Stream::new(StreamType::Input, 64, 48, PixelFormat::Ycbcr420, 0);
    h.device
        .configure_streams(vec![out.clone(), input.clone()])
        .await
        .unwrap();

    let mut raw = request(0, &[out], Some(h.preview_settings().await));
    raw.input_buffer = Some(camera_hal::StreamBuffer::allocate(&input));
    assert!(matches!(
        h.device.process_capture_request(raw).await,
        Err(HalError::BadValue(_))
    ));
    h.device.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn corrupt_frame_returns_an_error_buffer() {
    let h = Harness::open(FrameTiming::Immediate).await;
    let stream = preview();
    h.device.configure_streams(vec![stream.clone()]).await.unwrap();
    let streams = [stream];
    h.submit(0, &streams, Some(h.preview_settings().await)).await.unwrap();
    assert!(eventually(WAIT, || h.recorder.count("result 0 partial 1") == 1).await);
    assert_eq!(h.recorder.count("buffer 0"), 1);

    // Skip frames are done; the fault hits the next real frame.
    h.backend
        .inject(camera_hal::hw::SimFault::CorruptFrame("isp-main".into()));
    h.submit(1, &streams, None).await.unwrap();
    assert!(eventually(WAIT, || h.recorder.count("result 1 partial 1") == 1).await);
    assert_eq!(h.recorder.count("buffer 1 error"), 1);
    assert_eq!(h.recorder.count("error 1 Request"), 0);

    h.submit(2, &streams, None).await.unwrap();
    assert!(eventually(WAIT, || h.recorder.count("result 2 partial 1") == 1).await);
    assert_eq!(h.recorder.count("buffer 2"), 1);
    h.device.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn refused_request_gives_back_its_slot_and_buffers() {
    let h = Harness::open(FrameTiming::Immediate).await;
    let stream = preview();
    h.device.configure_streams(vec![stream.clone()]).await.unwrap();
    let settings = h.preview_settings().await;
    let streams = [stream.clone()];

    h.hw.shutdown().await.unwrap();
    // More refusals than the request pool holds.
    for n in 0..(MAX_REQUEST_IN_PROCESS_NUM as u32 + 2) {
        let settings = (n == 0).then(|| settings.clone());
        assert!(matches!(h.submit(n, &streams, settings).await, Err(HalError::NoInit)));
        assert!(eventually(WAIT, || stream.bound().unwrap().buffers_in_hal() == 0).await);
    }
    assert_eq!(h.device.outstanding(), 0);
    assert!(h.recorder.events().is_empty());
    let _ = h.device.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn buffer_that_cannot_be_staged_fails_the_request() {
    let h = Harness::open(FrameTiming::Immediate).await;
    let main = preview();
    let side = Camera3Stream::output(32, 24, PixelFormat::Ycbcr420);
    h.device
        .configure_streams(vec![main.clone(), side.clone()])
        .await
        .unwrap();
    let streams = [main.clone(), side.clone()];
    h.submit(0, &streams, Some(h.preview_settings().await)).await.unwrap();
    assert!(eventually(WAIT, || h.recorder.count("result 0 partial 1") == 1).await);

    let producer = h.hw.capture_unit().producer();
    side.bound().unwrap().bind_producer(None);
    h.submit(1, &streams, None).await.unwrap();
    assert!(eventually(WAIT, || h.recorder.count("error 1 Request") == 1).await);
    assert!(eventually(WAIT, || h.recorder.count("buffer 1 error") == 2).await);
    assert!(eventually(WAIT, || h.device.outstanding() == 0).await);
    assert_eq!(main.bound().unwrap().buffers_in_hal(), 0);
    assert_eq!(side.bound().unwrap().buffers_in_hal(), 0);

    // Request 4 waits on the statistics request 1 never produced.
    side.bound().unwrap().bind_producer(Some(producer));
    for n in 2..6 {
        h.submit(n, &streams, None).await.unwrap();
    }
    for n in 2..6 {
        assert!(
            eventually(WAIT, || h.recorder.count(&format!("result {n} partial 1")) == 1).await,
            "request {n}: {:?}",
            h.recorder.events()
        );
    }
    h.device.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_node_setup_closes_every_node() {
    let h = Harness::open(FrameTiming::Manual).await;
    let streams = vec![preview(), Camera3Stream::output(32, 24, PixelFormat::Ycbcr420)];

    h.backend.inject(SimFault::SetFormat("isp-preview".into()));
    assert!(matches!(
        h.device.configure_streams(streams.clone()).await,
        Err(HalError::BadValue(_))
    ));
    assert!(!h.backend.is_node_open("isp-main"));
    assert!(!h.backend.is_node_open("isp-preview"));

    h.backend.clear_faults();
    h.device.configure_streams(streams).await.unwrap();
    assert!(h.backend.is_node_open("isp-main"));
    assert!(h.backend.is_node_open("isp-preview"));
    h.device.close().await.unwrap();
}

#[tokio::test]
#[serial]
async fn pipeline_depth_comes_from_the_capability_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
log_level = "debug"

[[cameras]]
id = 0
pipeline_depth = 2
video_nodes = ["isp-main"]
"#
    )
    .unwrap();

    std::env::set_var("CAMERA_HAL_LOG_LEVEL", "warn");
    let config = PlatformConfig::load_from(file.path());
    std::env::remove_var("CAMERA_HAL_LOG_LEVEL");
    let config = config.unwrap();
    assert_eq!(config.log_level, "warn");

    let caps: CameraCapabilities = config.camera(0).unwrap().clone();
    assert_eq!(caps.pipeline_depth(), 2);

    let h = Harness::open_with(caps, FrameTiming::Manual, false).await;
    let stream = preview();
    h.device.configure_streams(vec![stream.clone()]).await.unwrap();
    let streams = vec![stream];
    h.submit(0, &streams, Some(h.preview_settings().await)).await.unwrap();
    h.submit(1, &streams, None).await.unwrap();

    let device = h.device.clone();
    let third = tokio::spawn(async move { device.process_capture_request(request(2, &streams, None)).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!third.is_finished());
    assert_eq!(h.device.outstanding(), 3);
    third.abort();
    h.device.close().await.unwrap();
}
