use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use camlink::config::ConfigStore;
use camlink::connection::{
    FrameSink, HttpBeaconSink, QualityScore, ReconnectionSupervisor, SupervisorDeps,
    VisibilityPort,
};
use camlink::events::{EventBus, SystemEvent};
use camlink::video::VideoFrame;
use camlink::webrtc::{ConnectionStatus, RtcPeerFactory, WsConnector};

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

/// camlink command line arguments
#[derive(Parser, Debug)]
#[command(name = "camlink")]
#[command(version, about = "Keep a WebRTC link to a network camera alive", long_about = None)]
struct CliArgs {
    /// Camera identifier passed to the signaling server
    #[arg(short = 'c', long, value_name = "ID", default_value = "default")]
    camera: String,

    /// Configuration file (created with defaults if missing)
    #[arg(long, value_name = "FILE", default_value = "/etc/camlink/camlink.json")]
    config: PathBuf,

    /// Signaling WebSocket URL (overrides config)
    #[arg(short = 's', long, value_name = "URL")]
    server: Option<String>,

    /// Heartbeat base URL (overrides config)
    #[arg(long, value_name = "URL")]
    heartbeat_url: Option<String>,

    /// Disable heartbeat beacons
    #[arg(long)]
    no_heartbeat: bool,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose, args.log_json);

    tracing::info!("Starting camlink v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Configuration file: {}", args.config.display());

    let config_store = ConfigStore::new(&args.config).await?;
    if args.server.is_some() || args.heartbeat_url.is_some() || args.no_heartbeat {
        let server = args.server.clone();
        let heartbeat_url = args.heartbeat_url.clone();
        let no_heartbeat = args.no_heartbeat;
        config_store
            .update(move |config| {
                if let Some(url) = server {
                    config.signaling.url = url;
                }
                if let Some(url) = heartbeat_url {
                    config.heartbeat.url = url;
                }
                if no_heartbeat {
                    config.heartbeat.enabled = false;
                }
            })
            .await?;
    }
    let config = config_store.get();
    tracing::info!(
        "Signaling {}, heartbeat {}",
        config.signaling.url,
        if config.heartbeat.enabled {
            config.heartbeat.url.as_str()
        } else {
            "disabled"
        }
    );

    let events = EventBus::new();
    spawn_event_logger(&events);

    let deps = SupervisorDeps {
        connector: Arc::new(WsConnector::new(&config.signaling)),
        peers: Arc::new(RtcPeerFactory::new(config.webrtc.clone())),
        beacons: Arc::new(HttpBeaconSink::new(&config.heartbeat)?),
        sink: Arc::new(LogSink),
        events,
        visibility: VisibilityPort::new(),
    };

    let mut supervisor = ReconnectionSupervisor::new(config_store, deps);
    supervisor.start(&args.camera).await;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    supervisor.stop().await;

    tracing::info!("camlink stopped");
    Ok(())
}

/// Frame sink for headless runs: no rendering, status goes to the log
struct LogSink;

impl FrameSink for LogSink {
    fn current_frame(&self) -> Option<VideoFrame> {
        None
    }

    fn on_status(&self, status: ConnectionStatus, message: Option<&str>) {
        match message {
            Some(message) => tracing::info!("Status: {} ({})", status, message),
            None => tracing::info!("Status: {}", status),
        }
    }

    fn on_quality(&self, score: QualityScore) {
        tracing::info!("Quality: {}", score);
    }

    fn pause(&self) {}

    fn resume(&self) {}
}

fn spawn_event_logger(events: &EventBus) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => log_event(&event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Event logger lagged, {} events dropped", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

fn log_event(event: &SystemEvent) {
    match serde_json::to_string(event) {
        Ok(json) => tracing::debug!(event = event.event_name(), "{}", json),
        Err(e) => tracing::warn!("Failed to serialize event: {}", e),
    }
}

fn init_logging(level: LogLevel, verbose_count: u8, json: bool) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "camlink=error,webrtc=error",
        LogLevel::Warn => "camlink=warn,webrtc=warn",
        LogLevel::Info => "camlink=info,webrtc=warn",
        LogLevel::Verbose => "camlink=debug,webrtc=warn",
        LogLevel::Debug => "camlink=debug,webrtc=info",
        LogLevel::Trace => "camlink=trace,webrtc=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    let result = if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
    };
    if let Err(err) = result {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
