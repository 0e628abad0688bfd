use pbx_core::config::PbxConfig;
use pbx_core::infrastructure::protocols::sip::{SignalingClient, UdpSignaling};
use pbx_core::interface::api::{init_metrics, update_gauges};
use pbx_core::Pbx;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Configuration path: first argument, then PBX_CONFIG
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("PBX_CONFIG").ok())
        .map(PathBuf::from);
    let config = PbxConfig::load(config_path.as_deref())?;

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting PBX core");
    match &config_path {
        Some(path) => info!("Configuration loaded from {}", path.display()),
        None => info!("No configuration file, using defaults and environment"),
    }

    if config.metrics.enabled {
        let listen = config.metrics.listen.parse()?;
        init_metrics(listen)?;
        info!("Prometheus exporter listening on {}", listen);
    }

    let shutdown = tokio_util::sync::CancellationToken::new();
    let signaling = UdpSignaling::bind(config.sip.clone(), shutdown.child_token()).await?;
    info!("SIP signaling bound to {}", signaling.local_addr());

    let client: Arc<dyn SignalingClient> = signaling.clone();
    let pbx = Arc::new(Pbx::builder(config.clone(), client).build().await?);
    pbx.spawn_background();

    // Start metrics updater task
    if config.metrics.enabled {
        let pbx = pbx.clone();
        let token = pbx.shutdown_token();
        let period = Duration::from_secs(config.metrics.update_interval_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => update_gauges(&pbx),
                }
            }
        });
        info!("Metrics updater task started");
    }

    // Keep the server running
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    pbx.shutdown().await;
    shutdown.cancel();

    let live = pbx.registry().active_count();
    if live > 0 {
        warn!("Exiting with {} live calls still registered", live);
    }

    Ok(())
}
