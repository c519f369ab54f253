mod client;
pub mod settings;

use async_trait::async_trait;

use crate::error::ProviderError;

pub use client::SpeedtestClient;

/// One complete reading. Either every field is valid or the reading is an error.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    /// Latency in milliseconds
    pub ping: f64,
    /// Download bandwidth in Mbps
    pub download: f64,
    /// Upload bandwidth in Mbps
    pub upload: f64,
}

/// Source of network readings polled by the measurement loop
#[async_trait]
pub trait MeasurementProvider: Send + Sync {
    async fn measure(&self) -> Result<Measurement, ProviderError>;
}
