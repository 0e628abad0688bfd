//! Periodic maintenance loops
//!
//! Each loop ticks on its own interval and returns as soon as the shared
//! shutdown token is cancelled.

use crate::infrastructure::tls::CertificateManager;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

const MIN_PERIOD: Duration = Duration::from_secs(1);

/// Run `task` every `period` until `shutdown` fires
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    shutdown: CancellationToken,
    mut task: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    let period = period.max(MIN_PERIOD);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!("Background task {} started (every {:?})", name, period);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Background task {} stopped", name);
                    return;
                }
                _ = interval.tick() => task().await,
            }
        }
    })
}

/// Renewal scheduler; failures stay in the manager's status and are retried next tick
pub fn spawn_certificate_renewal(
    certificates: Arc<CertificateManager>,
    period: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    spawn_periodic("certificate-renewal", period, shutdown, move || {
        let certificates = certificates.clone();
        async move {
            match certificates.check_and_renew().await {
                Ok(true) => info!("Scheduled certificate renewal completed"),
                Ok(false) => {}
                Err(e) => error!("Scheduled certificate renewal failed: {}", e),
            }
        }
    })
}
