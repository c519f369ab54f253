use std::net::SocketAddr;

use thiserror::Error;

/// Errors raised by the gauge registry
#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("gauge {0} is already registered")]
    AlreadyRegistered(String),

    #[error("gauge {0} is not registered")]
    UnknownGauge(String),

    #[error(transparent)]
    Prometheus(#[from] prometheus::Error),
}

/// Errors raised by the speedtest measurement provider
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("failed to build HTTP client: {0}")]
    Builder(#[source] reqwest::Error),

    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("unexpected status {status} from {url}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },

    #[error("malformed speedtest document: {0}")]
    Parse(String),

    #[error("no reachable speedtest server")]
    NoServers,

    #[error("no latency sample succeeded against {0}")]
    NoLatency(String),
}

impl ProviderError {
    pub(crate) fn http(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Http {
            url: url.into(),
            source,
        }
    }

    pub(crate) fn parse<S: Into<String>>(message: S) -> Self {
        Self::Parse(message.into())
    }
}

/// Startup and serving errors of the exporter process
#[derive(Error, Debug)]
pub enum ExporterError {
    #[error("invalid listen address {addr:?}: {reason}")]
    ListenAddress { addr: String, reason: String },

    #[error("telemetry path {0:?} must start with '/'")]
    TelemetryPath(String),

    #[error("measurement interval must be greater than zero")]
    Interval,

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Metrics(#[from] MetricsError),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}
