//! Prometheus metrics

use crate::application::Pbx;
use crate::infrastructure::media::zrtp::ZrtpState;
use metrics::{describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

/// Install the Prometheus recorder with its own HTTP listener
pub fn init_metrics(listen: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(listen)
        .install()?;

    describe_metrics();
    Ok(())
}

/// Describe metrics
pub fn describe_metrics() {
    describe_gauge!("pbx_active_calls", "Number of non-terminated call sessions");
    describe_gauge!(
        "pbx_registered_devices",
        "Number of currently valid registrations"
    );
    describe_gauge!(
        "pbx_moh_active_playbacks",
        "Calls currently receiving hold audio"
    );
    describe_gauge!("pbx_zrtp_sessions", "ZRTP sessions by state");
    describe_gauge!(
        "pbx_tls_certificate_expiry_timestamp",
        "Expiry of the served TLS certificate (unix seconds)"
    );
    describe_counter!(
        "pbx_mwi_notify_total",
        "MWI NOTIFY attempts by outcome"
    );
    describe_counter!(
        "pbx_cert_renewals_total",
        "Certificate renewal attempts by outcome"
    );
}

/// Update active calls gauge
pub fn update_active_calls(count: usize) {
    gauge!("pbx_active_calls").set(count as f64);
}

/// Update registered devices gauge
pub fn update_registered_devices(count: usize) {
    gauge!("pbx_registered_devices").set(count as f64);
}

/// Refresh every gauge from the running PBX
pub fn update_gauges(pbx: &Pbx) {
    update_active_calls(pbx.registry().active_count());

    if let Some(registrar) = pbx.registrar() {
        update_registered_devices(registrar.get_registration_count());
    }
    if let Some(moh) = pbx.moh() {
        gauge!("pbx_moh_active_playbacks").set(moh.active_count() as f64);
    }
    if let Some(zrtp) = pbx.zrtp() {
        let counts = zrtp.state_counts();
        for state in ZrtpState::ALL {
            gauge!("pbx_zrtp_sessions", "state" => state.as_str()).set(counts.get(state) as f64);
        }
    }
}
