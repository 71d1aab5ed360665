use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::builder::NonEmptyStringValueParser;
use clap::{ArgAction, Parser};
use tokio::signal;
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

use freenas_client::{ClientConfig, FreenasClient};
use freenas_volume_plugin::driver::{DEFAULT_DEVICE_WAIT_ATTEMPTS, VolumeDriver};
use freenas_volume_plugin::platform::{DEFAULT_FS_TYPE, Iscsiadm, SystemMounter, validate_fs_type};
use freenas_volume_plugin::plugin::{self, DEFAULT_SOCKET_PATH};
use freenas_volume_plugin::registry::STATE_FILE_NAME;
use freenas_volume_plugin::{
    DevicePollPolicy, DriverSettings, IscsiVolumeDriver, Registry, metrics, reconcile,
};

#[derive(Parser, Debug)]
#[command(name = "freenas-volume-plugin")]
#[command(about = "Docker volume plugin backed by FreeNAS iSCSI storage")]
struct Args {
    /// FreeNAS API base URL (e.g., https://192.168.1.10)
    #[arg(long, env = "FREENAS_API_URL", value_parser = NonEmptyStringValueParser::new())]
    api_url: String,

    /// FreeNAS API username
    #[arg(long, env = "FREENAS_API_USER", value_parser = NonEmptyStringValueParser::new())]
    api_user: String,

    /// FreeNAS API password
    #[arg(
        long,
        env = "FREENAS_API_PASSWORD",
        hide_env_values = true,
        value_parser = NonEmptyStringValueParser::new()
    )]
    api_password: String,

    /// Plugin root holding the state file and the volumes/ mount directory
    #[arg(long, env = "FREENAS_ROOT", default_value = "/mnt/freenas")]
    root: PathBuf,

    /// Unix socket Docker connects to
    #[arg(long, default_value = DEFAULT_SOCKET_PATH)]
    socket: PathBuf,

    /// Filesystem for new volumes (xfs, ext4)
    #[arg(long, default_value = DEFAULT_FS_TYPE)]
    fs_type: String,

    /// Times to look for the block device after iSCSI login
    #[arg(long, default_value_t = DEFAULT_DEVICE_WAIT_ATTEMPTS, value_parser = clap::value_parser!(u32).range(1..))]
    device_wait_attempts: u32,

    /// Delay between device lookups in milliseconds
    #[arg(long, default_value_t = 1000)]
    device_wait_interval_ms: u64,

    /// Skip TLS certificate verification for the appliance API
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    tls_skip_verify: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Prometheus metrics HTTP address (e.g., 0.0.0.0:9091)
    /// If not set, metrics endpoint is disabled
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize tracing with configured log level
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Initialize Prometheus metrics endpoint if configured
    if let Some(ref addr_str) = args.metrics_addr {
        let addr = addr_str
            .parse()
            .map_err(|e| format!("Invalid metrics address '{}': {}", addr_str, e))?;
        if let Err(e) = metrics::init_metrics(addr) {
            return Err(format!("Failed to initialize metrics: {}", e).into());
        }
    }

    info!("Starting freenas-volume-plugin on {}", args.socket.display());
    info!("Log level: {}", args.log_level);
    info!("Appliance API: {}", args.api_url);
    info!("Plugin root: {}", args.root.display());

    match tokio::fs::metadata(&args.root).await {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => {
            return Err(format!("{} exists and is not a directory", args.root.display()).into());
        }
        Err(e) => {
            return Err(format!("Plugin root {} is unusable: {}", args.root.display(), e).into());
        }
    }

    let fs_type = validate_fs_type(&args.fs_type)?;
    info!("Filesystem type: {}", fs_type);

    let mut client_config = ClientConfig::new(&args.api_url, &args.api_user, &args.api_password);
    client_config.accept_invalid_certs = args.tls_skip_verify;
    let client = Arc::new(FreenasClient::new(client_config)?);

    reconcile::ensure_iscsi_service(client.as_ref())
        .await
        .map_err(|e| format!("Startup validation failed: {}", e))?;
    let portal_id = reconcile::reconcile_portal(client.as_ref())
        .await
        .map_err(|e| format!("Startup validation failed: {}", e))?;
    info!("iSCSI portal id: {}", portal_id);

    let registry = Registry::load(args.root.join(STATE_FILE_NAME)).await?;

    let settings = DriverSettings {
        root: args.root.clone(),
        appliance_host: client.host().to_string(),
        portal_id,
        fs_type: fs_type.to_string(),
        device_poll: DevicePollPolicy {
            attempts: args.device_wait_attempts,
            interval: Duration::from_millis(args.device_wait_interval_ms),
        },
    };
    let driver = Arc::new(IscsiVolumeDriver::new(
        registry,
        client,
        Arc::new(Iscsiadm),
        Arc::new(SystemMounter),
        settings,
    ));
    driver.refresh_gauges().await;

    let listener = plugin::bind_socket(&args.socket).await?;
    let driver: Arc<dyn VolumeDriver> = driver;

    // In-flight requests are not drained on shutdown
    tokio::select! {
        result = plugin::serve(listener, driver) => result?,
        _ = shutdown_signal() => info!("Shutdown signal received, exiting"),
    }

    if let Err(e) = tokio::fs::remove_file(&args.socket).await {
        warn!("Failed to remove plugin socket {}: {}", args.socket.display(), e);
    }

    info!("freenas-volume-plugin shutdown complete");
    Ok(())
}

async fn recv_signal(sig: &mut Option<signal::unix::Signal>) {
    match sig {
        Some(s) => {
            s.recv().await;
        }
        None => std::future::pending().await,
    }
}

/// Wait for shutdown signal (SIGTERM, SIGINT, or SIGHUP)
async fn shutdown_signal() {
    use signal::unix::{SignalKind, signal};

    // Install signal handlers, logging errors but continuing with available handlers
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => Some(s),
        Err(e) => {
            tracing::error!("Failed to install SIGTERM handler: {}", e);
            None
        }
    };

    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => Some(s),
        Err(e) => {
            tracing::error!("Failed to install SIGINT handler: {}", e);
            None
        }
    };

    let mut sighup = match signal(SignalKind::hangup()) {
        Ok(s) => Some(s),
        Err(e) => {
            tracing::error!("Failed to install SIGHUP handler: {}", e);
            None
        }
    };

    tokio::select! {
        _ = recv_signal(&mut sigterm) => info!("Received SIGTERM"),
        _ = recv_signal(&mut sigint) => info!("Received SIGINT"),
        _ = recv_signal(&mut sighup) => info!("Received SIGHUP, shutting down"),
    }
}
