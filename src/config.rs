use std::net::SocketAddr;
use std::time::Duration;

use crate::cli::Args;
use crate::error::ExporterError;

/// Validated runtime settings of the exporter
#[derive(Debug, Clone)]
pub struct ExporterConfig {
    pub listen_address: SocketAddr,
    pub telemetry_path: String,
    pub config_url: String,
    pub server_url: String,
    pub interval: Duration,
}

impl ExporterConfig {
    pub async fn from_args(args: &Args) -> Result<Self, ExporterError> {
        if args.interval == 0 {
            return Err(ExporterError::Interval);
        }

        Ok(Self {
            listen_address: parse_listen_address(&args.listen_address).await?,
            telemetry_path: validate_telemetry_path(&args.telemetry_path)?,
            config_url: args.config_url.clone(),
            server_url: args.server_url.clone(),
            interval: Duration::from_secs(args.interval),
        })
    }
}

/// Resolves a listen address. `:port` means every interface, IPv6 and IPv4.
pub async fn parse_listen_address(addr: &str) -> Result<SocketAddr, ExporterError> {
    let invalid = |reason: String| ExporterError::ListenAddress {
        addr: addr.to_string(),
        reason,
    };

    let candidate = if addr.starts_with(':') {
        format!("[::]{}", addr)
    } else {
        addr.to_string()
    };

    if let Ok(socket_addr) = candidate.parse::<SocketAddr>() {
        return Ok(socket_addr);
    }

    // hostname:port
    let resolved = tokio::net::lookup_host(candidate.as_str())
        .await
        .map_err(|err| invalid(err.to_string()))?
        .next()
        .ok_or_else(|| invalid("no address resolved".to_string()));
    resolved
}

fn validate_telemetry_path(path: &str) -> Result<String, ExporterError> {
    if path.starts_with('/') {
        Ok(path.to_string())
    } else {
        Err(ExporterError::TelemetryPath(path.to_string()))
    }
}
