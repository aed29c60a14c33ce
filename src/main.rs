use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use camstream::actuator::{Actuator, UartActuator};
use camstream::command::{RecordingIndex, SessionOrchestrator};
use camstream::config::{self, AppConfig};
use camstream::signaling::SignalingServer;
use camstream::video::{CaptureEngine, CodecPipeline};
use camstream::webrtc::WebRtcTransportFactory;

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

/// camstream command line arguments
#[derive(Parser, Debug)]
#[command(name = "camstream")]
#[command(version, about = "Camera streaming over WebRTC with a command side channel", long_about = None)]
struct CliArgs {
    /// Configuration file (TOML)
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Capture device (overrides config)
    #[arg(short = 'd', long, value_name = "DEVICE")]
    device: Option<String>,

    /// Capture width (overrides config)
    #[arg(long, value_name = "PIXELS")]
    width: Option<u32>,

    /// Capture height (overrides config)
    #[arg(long, value_name = "PIXELS")]
    height: Option<u32>,

    /// Capture frame rate (overrides config)
    #[arg(long, value_name = "FPS")]
    fps: Option<u32>,

    /// Hardware encoder device (overrides config)
    #[arg(long, value_name = "DEVICE")]
    encoder: Option<String>,

    /// Recording directory served to file queries (overrides config)
    #[arg(long, value_name = "DIR")]
    record_path: Option<PathBuf>,

    /// Signaling listen address (overrides config)
    #[arg(short = 'a', long, value_name = "ADDRESS")]
    listen: Option<SocketAddr>,

    /// Enable the serial actuator on this port (overrides config)
    #[arg(long, value_name = "PORT")]
    actuator: Option<String>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    let mut config = config::load(args.config.as_deref()).context("failed to load configuration")?;
    apply_overrides(&mut config, &args);
    config.validate().context("invalid configuration")?;

    init_logging(args.log_level, args.verbose);
    tracing::info!(
        "Starting camstream v{} (built {})",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_DATE")
    );

    // Capture is the one resource the process cannot run without
    let capture_config = config.video.capture_config()?;
    let capture = Arc::new(
        CaptureEngine::open(capture_config)
            .with_context(|| format!("failed to open capture device {}", config.video.device))?,
    );

    if let Some((encoder_path, codec_config)) = config.video.encoder_config()? {
        let codec = CodecPipeline::open(&encoder_path, codec_config).with_context(|| {
            format!("failed to open hardware encoder {}", encoder_path.display())
        })?;
        tracing::info!("Hardware encoder attached: {}", encoder_path.display());
        capture.attach_transform(Arc::new(codec));
    } else if !config.video.pixel_format()?.is_compressed() {
        tracing::warn!("Raw capture without an encoder; peers will not receive video");
    }
    capture
        .start()
        .with_context(|| format!("failed to start capture on {}", config.video.device))?;

    let actuator = if config.actuator.enabled {
        Some(Arc::new(UartActuator::open_or_disconnected(
            &config.actuator.device,
            config.actuator.baud_rate,
        )))
    } else {
        tracing::info!("Actuator disabled");
        None
    };

    let factory = Arc::new(WebRtcTransportFactory::new(config.webrtc.clone()));
    let mut orchestrator = SessionOrchestrator::new(config.webrtc.clone(), factory, capture.clone());
    if let Some(actuator) = &actuator {
        orchestrator = orchestrator.with_actuator(actuator.clone());
    }
    if let Some(path) = &config.recording.record_path {
        tracing::info!("Serving recordings from {}", path.display());
        orchestrator = orchestrator.with_recordings(RecordingIndex::new(path));
    }
    let orchestrator = Arc::new(orchestrator);

    let server = SignalingServer::bind(config.signaling.listen, orchestrator.clone()).await?;
    let shutdown = CancellationToken::new();
    let server_task = tokio::spawn(server.run(shutdown.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received");

    // Sessions first so the actuator gets its neutral commands, then capture
    shutdown.cancel();
    if let Err(e) = server_task.await {
        tracing::warn!("Signaling task failed: {}", e);
    }
    orchestrator.close_all().await;
    capture.stop();
    if let Some(actuator) = actuator {
        if let Err(e) = actuator.stop().await {
            tracing::warn!("Actuator stop failed: {}", e);
        }
    }

    tracing::info!("camstream shutdown complete");
    Ok(())
}

fn apply_overrides(config: &mut AppConfig, args: &CliArgs) {
    if let Some(device) = &args.device {
        config.video.device = device.clone();
    }
    if let Some(width) = args.width {
        config.video.width = width;
    }
    if let Some(height) = args.height {
        config.video.height = height;
    }
    if let Some(fps) = args.fps {
        config.video.fps = fps;
    }
    if let Some(encoder) = &args.encoder {
        config.video.encoder_device = Some(encoder.clone());
    }
    if let Some(path) = &args.record_path {
        config.recording.record_path = Some(path.clone());
    }
    if let Some(listen) = args.listen {
        config.signaling.listen = listen;
    }
    if let Some(port) = &args.actuator {
        config.actuator.enabled = true;
        config.actuator.device = port.clone();
    }
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "camstream=error,webrtc=error",
        LogLevel::Warn => "camstream=warn,webrtc=warn",
        LogLevel::Info => "camstream=info,webrtc=warn",
        LogLevel::Verbose => "camstream=debug,webrtc=warn",
        LogLevel::Debug => "camstream=debug,webrtc=info",
        LogLevel::Trace => "camstream=trace,webrtc=debug",
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
}
