//! knx2mqtt - KNX/IP to MQTT bridge
//!
//! Usage:
//!   knx2mqtt [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>        Configuration file path
//!   --knx <HOST[:PORT]>        KNX gateway (repeatable, replaces knx.gateways)
//!   --mqtt <HOST[:PORT]>       MQTT broker
//!   --mqtt-prefix <PREFIX>     Topic prefix for raw events
//!   --debug                    Debug logging
//!   -l, --log-level            Log level (error, warn, info, debug, trace)
//!   -h, --help                 Print help

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{debug, info, Level};
use tracing_subscriber::FmtSubscriber;

use knx2mqtt::bridge::{Bridge, BridgeOptions};
use knx2mqtt::bus::Bus;
use knx2mqtt::config::Config;
use knx2mqtt::eventlog::EventLog;
use knx2mqtt::knx::KnxTunnelConnector;
use knx2mqtt::mqtt::BrokerClient;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    #[default]
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

/// knx2mqtt - KNX/IP to MQTT bridge
#[derive(Parser, Debug)]
#[command(name = "knx2mqtt")]
#[command(author = "knx2mqtt Contributors")]
#[command(version)]
#[command(about = "Bidirectional KNX/IP to MQTT bridge")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// KNX gateway address, may be given more than once
    #[arg(long = "knx", value_name = "HOST[:PORT]")]
    knx: Vec<String>,

    /// MQTT broker address
    #[arg(long = "mqtt", value_name = "HOST[:PORT]")]
    mqtt: Option<String>,

    /// Topic prefix for raw bus events
    #[arg(long)]
    mqtt_prefix: Option<String>,

    /// Debug logging
    #[arg(long)]
    debug: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Without a file, settings come from KNX2MQTT__* variables and the CLI
    let path = args.config.as_deref().unwrap_or(Path::new(""));
    let mut config = match Config::read(path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config file: {}", e);
            std::process::exit(1);
        }
    };

    // CLI args override file config
    if !args.knx.is_empty() {
        config.knx.gateways = args.knx.clone();
    }
    if let Some(server) = &args.mqtt {
        config.mqtt.server = server.clone();
    }
    if let Some(prefix) = &args.mqtt_prefix {
        config.mqtt.prefix = prefix.clone();
    }
    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    // Setup logging - CLI overrides config, config overrides default (info)
    let log_level = args.log_level.unwrap_or_else(|| {
        if args.debug {
            return LogLevel::Debug;
        }
        match config.log_level().to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    });

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    let catalog = match config.catalog() {
        Ok(catalog) => Arc::new(catalog),
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    let mut bridge_options = BridgeOptions::new(config.mqtt.prefix.clone());
    bridge_options.named_prefix = config.mqtt.named_prefix.clone();
    bridge_options.subscribe_retry = config.mqtt.reconnect_interval;
    let mqtt_options = config.mqtt_options();

    info!("Starting knx2mqtt");
    info!("  KNX gateways: {}", config.knx.gateways.join(", "));
    info!("  MQTT broker: {}", mqtt_options.address());
    info!("  Raw topics: {}/#", bridge_options.prefix);
    match &bridge_options.named_prefix {
        Some(prefix) => info!("  Named topics: {}/#", prefix),
        None => info!("  Named topics: disabled"),
    }
    match &config.event_log.dir {
        Some(dir) => info!("  Event log: {}", dir.display()),
        None => info!("  Event log: disabled"),
    }
    debug!("  Catalog: {} entries", config.device.len() + config.group.len());

    let connector = Arc::new(KnxTunnelConnector::new(config.tunnel_config()));
    let Bus {
        events,
        commands,
        registry,
    } = Bus::start(config.bus_options(), connector);

    let client = BrokerClient::connect(mqtt_options).await;

    let mut bridge = Bridge::new(bridge_options, client, events, commands, catalog);
    if let Some(dir) = &config.event_log.dir {
        bridge = bridge.with_event_log(EventLog::new(dir));
    }

    tokio::select! {
        _ = bridge.run() => {}
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    for link in registry.snapshot() {
        debug!(
            "KNX {}: {} addresses learned",
            link.name,
            link.observed.len()
        );
    }

    Ok(())
}
