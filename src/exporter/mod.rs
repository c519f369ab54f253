mod metric;
mod runner;
pub mod http_server;

pub use metric::{GaugeSample, GaugeSpec, SpeedtestMetrics, DOWNLOAD, NAMESPACE, PING, UPLOAD};
pub use runner::{measure_once, run_measurement_loop, spawn_measurement_loop};
