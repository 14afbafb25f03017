use std::net::SocketAddr;
use std::str::FromStr;

use tracing_subscriber::EnvFilter;

/// `SECMETA_LOG` wins over the flag; anything unparsable falls back to `info`.
pub fn init_tracing(flag_level: &str) {
    let env = std::env::var("SECMETA_LOG").unwrap_or_else(|_| flag_level.to_string());
    let filter = EnvFilter::from_str(&env).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

pub fn init_metrics(addr: Option<SocketAddr>) {
    let Some(sock) = addr else { return };
    match metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(sock).install() {
        Ok(()) => tracing::info!(addr = %sock, "Prometheus metrics exporter listening"),
        Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
    }
}
