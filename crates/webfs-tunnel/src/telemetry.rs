//! Prometheus exposition for tunnel counters.

use std::net::SocketAddr;

use metrics::counter;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

use crate::error::TunnelError;

pub const CONNECTIONS_TOTAL: &str = "webfs_tunnel_connections_total";
pub const REJECTED_TOTAL: &str = "webfs_tunnel_rejected_total";
pub const BYTES_TOTAL: &str = "webfs_tunnel_bytes_total";

/// Installs the global Prometheus recorder and serves it over HTTP on
/// `address`. Must run inside a tokio runtime.
pub fn install_exporter(address: &str) -> Result<SocketAddr, TunnelError> {
    let addr: SocketAddr = address
        .parse()
        .map_err(|e| TunnelError::Metrics(format!("invalid metrics address {address:?}: {e}")))?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| TunnelError::Metrics(e.to_string()))?;
    info!(%addr, "Metrics exporter listening");
    Ok(addr)
}

pub(crate) fn record_connection() {
    counter!(CONNECTIONS_TOTAL).increment(1);
}

pub(crate) fn record_rejected(reason: &'static str) {
    counter!(REJECTED_TOTAL, "reason" => reason).increment(1);
}

pub(crate) fn record_bytes(inbound: u64, outbound: u64) {
    counter!(BYTES_TOTAL, "direction" => "inbound").increment(inbound);
    counter!(BYTES_TOTAL, "direction" => "outbound").increment(outbound);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_address() {
        assert!(matches!(
            install_exporter("not an address"),
            Err(TunnelError::Metrics(_))
        ));
    }
}
