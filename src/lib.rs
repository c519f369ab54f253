pub mod cli;
pub mod config;
pub mod error;
pub mod exporter;
pub mod logging;
pub mod speedtest;
