//! CLI entry point for the simulated camera HAL.
//!
//! Opens a camera on the software sensor, configures a preview stream (and
//! optionally a JPEG stream), pushes a burst of capture requests through the
//! pipeline and reports what came back.
//!
//! # Usage
//!
//! ```bash
//! camera_hal_sim run --frames 30 --width 1280 --height 720 --jpeg
//! camera_hal_sim dump --config config/camera_hal.toml
//! camera_hal_sim config
//! ```

use anyhow::{anyhow, Context, Result};
use camera_hal::buffer::BufferStatus;
use camera_hal::callbacks::{CaptureResult, FrameworkCallbacks, LoggingCallbacks, NotifyMessage};
use camera_hal::hw::simulated::{FrameTiming, SimulatedBackend};
use camera_hal::{
    Camera3Stream, CameraDevice, CameraHw, CaptureRequest, IpuCameraHw, PixelFormat,
    PlatformConfig, RequestTemplate, StreamBuffer,
};
use clap::{Parser, Subcommand};
use hal_core::logging::{self, TracingConfig};
use parking_lot::Mutex;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

#[derive(Parser)]
#[command(name = "camera_hal_sim")]
#[command(about = "Drive the camera HAL request pipeline on a simulated sensor", long_about = None)]
struct Cli {
    /// Capability file
    #[arg(long, global = true, default_value = "config/camera_hal.toml")]
    config: PathBuf,

    /// Camera id to open
    #[arg(long, global = true, default_value = "0")]
    camera: i32,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a burst of requests and wait for all results
    Run {
        #[arg(long, default_value = "30")]
        frames: u32,

        #[arg(long, default_value = "1280")]
        width: u32,

        #[arg(long, default_value = "720")]
        height: u32,

        /// Add a JPEG stream at the same size
        #[arg(long)]
        jpeg: bool,

        /// Milliseconds between simulated frames; 0 completes immediately
        #[arg(long, default_value = "33")]
        frame_interval_ms: u64,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Open the camera, configure one stream and print the pipeline state
    Dump,

    /// Print the effective configuration (file plus environment) as TOML
    Config,
}

#[derive(Debug, Default, Serialize)]
struct Summary {
    shutters: u32,
    results: u32,
    buffers: u32,
    buffer_errors: u32,
    request_errors: u32,
    last_timestamp_ns: i64,
}

/// Counts what the pipeline hands back and publishes the number of returned
/// buffers.
struct SummaryCallbacks {
    summary: Mutex<Summary>,
    returned: watch::Sender<u32>,
    log: LoggingCallbacks,
}

impl SummaryCallbacks {
    fn new() -> (Arc<Self>, watch::Receiver<u32>) {
        let (returned, rx) = watch::channel(0);
        let callbacks = Arc::new(Self {
            summary: Mutex::new(Summary::default()),
            returned,
            log: LoggingCallbacks,
        });
        (callbacks, rx)
    }
}

impl FrameworkCallbacks for SummaryCallbacks {
    fn notify(&self, message: NotifyMessage) {
        {
            let mut s = self.summary.lock();
            match &message {
                NotifyMessage::Shutter { timestamp_ns, .. } => {
                    s.shutters += 1;
                    s.last_timestamp_ns = *timestamp_ns;
                }
                NotifyMessage::Error { .. } => s.request_errors += 1,
            }
        }
        self.log.notify(message);
    }

    fn process_capture_result(&self, result: CaptureResult) {
        let returned = {
            let mut s = self.summary.lock();
            if result.metadata.is_some() {
                s.results += 1;
            }
            for buffer in &result.output_buffers {
                s.buffers += 1;
                if buffer.status() == BufferStatus::Error {
                    s.buffer_errors += 1;
                }
            }
            s.buffers
        };
        self.returned.send_replace(returned);
        self.log.process_capture_result(result);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = if cli.config.exists() {
        PlatformConfig::load_from(&cli.config)
            .with_context(|| format!("loading {}", cli.config.display()))?
    } else {
        PlatformConfig::default()
    };
    let tracing_config = TracingConfig::from_level_str(&config.log_level).map_err(|e| anyhow!(e))?;
    logging::init(tracing_config).map_err(|e| anyhow!(e))?;

    if let Commands::Config = cli.command {
        print!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let caps = config
        .camera(cli.camera)
        .cloned()
        .ok_or_else(|| anyhow!("camera {} is not in the capability file", cli.camera))?;

    match cli.command {
        Commands::Run {
            frames,
            width,
            height,
            jpeg,
            frame_interval_ms,
            json,
        } => {
            let timing = match frame_interval_ms {
                0 => FrameTiming::Immediate,
                ms => FrameTiming::Interval(Duration::from_millis(ms)),
            };
            run_burst(
                Arc::new(caps),
                config.message_queue_depth,
                timing,
                frames,
                (width, height),
                jpeg,
                json,
            )
            .await
        }
        Commands::Dump => dump(Arc::new(caps), config.message_queue_depth).await,
        Commands::Config => Ok(()),
    }
}

async fn open_device(
    caps: Arc<hal_core::CameraCapabilities>,
    queue_depth: usize,
    timing: FrameTiming,
    callbacks: Arc<dyn FrameworkCallbacks>,
) -> Result<(CameraDevice, Arc<dyn CameraHw>)> {
    let backend = SimulatedBackend::new(&caps, timing);
    let hw: Arc<dyn CameraHw> = Arc::new(IpuCameraHw::new(Arc::clone(&caps), backend, queue_depth)?);
    let device = CameraDevice::open(caps, Arc::clone(&hw), callbacks, queue_depth).await?;
    Ok((device, hw))
}

async fn run_burst(
    caps: Arc<hal_core::CameraCapabilities>,
    queue_depth: usize,
    timing: FrameTiming,
    frames: u32,
    (width, height): (u32, u32),
    jpeg: bool,
    json: bool,
) -> Result<()> {
    let (callbacks, mut returned) = SummaryCallbacks::new();
    let (device, _hw) = open_device(caps, queue_depth, timing, callbacks.clone()).await?;

    let mut streams = vec![Camera3Stream::output(width, height, PixelFormat::Ycbcr420)];
    if jpeg {
        streams.push(Camera3Stream::output(width, height, PixelFormat::Blob));
    }
    device.configure_streams(streams.clone()).await?;
    let settings = device
        .construct_default_request_settings(RequestTemplate::Preview)
        .await?;

    let started = Instant::now();
    for frame_number in 0..frames {
        let request = CaptureRequest {
            frame_number,
            settings: (frame_number == 0).then(|| settings.clone()),
            input_buffer: None,
            output_buffers: streams.iter().map(StreamBuffer::allocate).collect(),
        };
        device
            .process_capture_request(request)
            .await
            .with_context(|| format!("submitting frame {frame_number}"))?;
    }

    let expected = frames * streams.len() as u32;
    let wait = Duration::from_millis(500) + Duration::from_millis(100) * frames;
    let drained = tokio::time::timeout(wait, returned.wait_for(|n| *n >= expected)).await;
    if drained.is_err() {
        tracing::warn!(expected, "timed out waiting for buffers, flushing");
        device.flush().await?;
    }
    let elapsed = started.elapsed();
    device.close().await?;

    let s = callbacks.summary.lock();
    if json {
        let report = serde_json::json!({
            "frames_requested": frames,
            "elapsed_ms": elapsed.as_secs_f64() * 1000.0,
            "summary": &*s,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    println!("frames requested:   {frames}");
    println!("shutters:           {}", s.shutters);
    println!("result metadata:    {}", s.results);
    println!("buffers returned:   {} ({} with errors)", s.buffers, s.buffer_errors);
    println!("request errors:     {}", s.request_errors);
    println!("last timestamp:     {} ns", s.last_timestamp_ns);
    println!("elapsed:            {:.1} ms", elapsed.as_secs_f64() * 1000.0);
    if s.shutters > 0 {
        println!(
            "throughput:         {:.1} fps",
            f64::from(s.shutters) / elapsed.as_secs_f64()
        );
    }
    Ok(())
}

async fn dump(caps: Arc<hal_core::CameraCapabilities>, queue_depth: usize) -> Result<()> {
    let (device, _hw) = open_device(
        Arc::clone(&caps),
        queue_depth,
        FrameTiming::Manual,
        Arc::new(LoggingCallbacks),
    )
    .await?;
    let stream = Camera3Stream::output(
        caps.sensor.output_width,
        caps.sensor.output_height,
        PixelFormat::Ycbcr420,
    );
    device.configure_streams(vec![stream]).await?;
    println!("{}", device.dump().await?);
    device.close().await?;
    Ok(())
}
