use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::{Parser, ValueEnum};
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use video_mirror::config::{self, AppConfig, CaptureBackendKind};
use video_mirror::state::AppState;
use video_mirror::video::capture::{backend_for, open_device};
use video_mirror::video::encoder::H264Encoder;
use video_mirror::video::{EncodeStage, KeyframeRequest};
use video_mirror::web;
use video_mirror::webrtc::{BroadcastDispatcher, SessionRegistry, WebRtcTransportFactory};

const PEER_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// video-mirror command line arguments
#[derive(Parser, Debug)]
#[command(name = "video-mirror")]
#[command(version, about = "Mirror a capture device to WebRTC viewers", long_about = None)]
struct CliArgs {
    /// JSON configuration file
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Listen address (overrides config file)
    #[arg(short = 'a', long, value_name = "ADDRESS")]
    address: Option<String>,

    /// HTTP port (overrides config file)
    #[arg(short = 'p', long, value_name = "PORT")]
    port: Option<u16>,

    /// Directory holding the viewer page
    #[arg(long, value_name = "DIR")]
    document_root: Option<PathBuf>,

    /// Token viewers must present when requesting an offer
    #[arg(long, value_name = "TOKEN")]
    auth_token: Option<String>,

    /// Capture backend (v4l2, test-pattern)
    #[arg(short = 'b', long, value_name = "BACKEND")]
    backend: Option<CaptureBackendKind>,

    /// Capture device name or path
    #[arg(short = 'd', long, value_name = "DEVICE")]
    device: Option<String>,

    #[arg(long)]
    width: Option<u32>,

    #[arg(long)]
    height: Option<u32>,

    /// Frames per second
    #[arg(long)]
    fps: Option<u32>,

    /// Encoder bitrate in bits per second
    #[arg(long, value_name = "BPS")]
    bitrate: Option<u32>,

    /// List capture devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl CliArgs {
    /// Command line flags take precedence over the config file
    fn apply(&self, config: &mut AppConfig) {
        if let Some(address) = &self.address {
            config.signaling.bind_address = address.clone();
        }
        if let Some(port) = self.port {
            config.signaling.port = port;
        }
        if let Some(root) = &self.document_root {
            config.signaling.document_root = Some(root.clone());
        }
        if let Some(token) = &self.auth_token {
            config.signaling.auth_token = token.clone();
        }
        if let Some(backend) = self.backend {
            config.capture.backend = backend;
        }
        if let Some(device) = &self.device {
            config.capture.device = Some(device.clone());
        }
        if let Some(width) = self.width {
            config.capture.width = width;
        }
        if let Some(height) = self.height {
            config.capture.height = height;
        }
        if let Some(fps) = self.fps {
            config.capture.fps_numerator = fps;
            config.capture.fps_denominator = 1;
        }
        if let Some(bitrate) = self.bitrate {
            config.encoder.bitrate_bps = bitrate;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    let _logging = init_logging(args.log_level, args.verbose);

    tracing::info!("Starting video-mirror v{}", env!("CARGO_PKG_VERSION"));

    let mut config = config::load(args.config.as_deref()).context("loading configuration")?;
    args.apply(&mut config);
    config
        .validate()
        .map_err(|e| anyhow!("invalid configuration: {}", e))?;

    let backend = backend_for(&config.capture);
    if args.list_devices {
        for name in backend.enumerate_devices()? {
            println!("{}", name);
        }
        return Ok(());
    }

    // Fatal startup: no device, activation failure, bad geometry
    let mut device = open_device(backend.as_ref(), config.capture.device.as_deref())
        .context("opening capture device")?;
    let geometry = device.geometry();
    let frame_rate = device.frame_rate();

    let encoder = H264Encoder::new(
        config
            .encoder
            .encoder_config(geometry.resolution, frame_rate),
    )
    .context("initializing encoder")?;

    let keyframe_request = KeyframeRequest::new();
    let factory = Arc::new(WebRtcTransportFactory::new(
        config.webrtc.clone(),
        Handle::current(),
    ));
    let registry = Arc::new(
        SessionRegistry::new(factory.clone(), frame_rate)
            .with_keyframe_request(keyframe_request.clone()),
    );
    let dispatcher = Arc::new(BroadcastDispatcher::new(registry.clone()));
    let mut stage = EncodeStage::new(
        geometry,
        config.encoder.row_alignment,
        Box::new(encoder),
        dispatcher.clone(),
        keyframe_request,
    );

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let state = AppState::new(
        config.signaling.clone(),
        registry.clone(),
        Some(stage.stats()),
        shutdown_tx.clone(),
    );

    // Signaling server
    let addr: SocketAddr = format!("{}:{}", config.signaling.bind_address, config.signaling.port)
        .parse()
        .map_err(|_| anyhow!("Invalid bind address: {}", config.signaling.bind_address))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    tracing::info!("Starting HTTP server on {}", listener.local_addr()?);

    let app = web::create_router(state.clone());
    let mut server_shutdown = state.shutdown_signal();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.recv().await;
            })
            .await
    });

    // Capture -> encode -> dispatch on a dedicated blocking thread
    let run = Arc::new(AtomicBool::new(true));
    let capture_run = run.clone();
    let mut capture = tokio::task::spawn_blocking(move || {
        let result = device.stream(&capture_run, &mut stage);
        (stage, result)
    });

    let capture_result = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                tracing::warn!("Failed to listen for CTRL+C: {}", e);
            }
            tracing::info!("Shutdown signal received");
            run.store(false, Ordering::Release);
            (&mut capture).await
        }
        result = &mut capture => {
            tracing::warn!("Capture loop ended");
            result
        }
    };
    run.store(false, Ordering::Release);

    // Close every viewer, then the server, then the encoder
    registry.shutdown();
    if !factory.wait_closed(PEER_CLOSE_TIMEOUT).await {
        tracing::warn!("Peer connections still closing after {:?}", PEER_CLOSE_TIMEOUT);
    }
    let _ = shutdown_tx.send(());
    match server.await {
        Ok(Err(e)) => tracing::error!("HTTP server error: {}", e),
        Err(e) => tracing::error!("HTTP server task failed: {}", e),
        Ok(Ok(())) => {}
    }

    let (mut stage, result) = capture_result.context("capture thread panicked")?;
    stage.shutdown();
    tracing::info!(
        "Dispatched {} samples",
        dispatcher.samples_dispatched()
    );
    result.context("capture failed")?;

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Keeps the global subscriber's lifetime explicit; dropping it at the end
/// of `main` marks logging teardown.
struct LoggingGuard;

impl Drop for LoggingGuard {
    fn drop(&mut self) {
        tracing::debug!("Logging shut down");
    }
}

fn init_logging(level: LogLevel, verbose_count: u8) -> LoggingGuard {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "video_mirror=error,tower_http=error,webrtc=error",
        LogLevel::Warn => "video_mirror=warn,tower_http=warn,webrtc=warn",
        LogLevel::Info => "video_mirror=info,tower_http=info,webrtc=warn",
        LogLevel::Verbose => "video_mirror=debug,tower_http=info,webrtc=warn",
        LogLevel::Debug => "video_mirror=debug,tower_http=debug,webrtc=warn",
        LogLevel::Trace => "video_mirror=trace,tower_http=debug,webrtc=warn",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
    LoggingGuard
}
