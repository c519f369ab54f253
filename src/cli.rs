use std::ffi::OsString;

use clap::Parser;
use rand::Rng;

use crate::logging::{LogFormat, LogLevel};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

const SPEEDTEST_CONFIG_URL: &str = "http://c.speedtest.net/speedtest-config.php";
const SPEEDTEST_SERVERS_URL: &str = "http://c.speedtest.net/speedtest-servers-static.php";

#[derive(Parser, Debug)]
#[command(
    name = "speedtest-exporter",
    about = "Speedtest Prometheus exporter",
    disable_version_flag = true
)]
pub struct Args {
    #[arg(long = "version", help = "Print version information.")]
    pub version: bool,

    #[arg(
        long = "web.listen-address",
        default_value = ":9112",
        help = "Address to listen on for web interface and telemetry."
    )]
    pub listen_address: String,

    #[arg(
        long = "web.telemetry-path",
        default_value = "/metrics",
        help = "Path under which to expose metrics."
    )]
    pub telemetry_path: String,

    #[arg(
        long = "speedtest.config-url",
        default_value_t = default_config_url(),
        help = "Speedtest configuration URL"
    )]
    pub config_url: String,

    #[arg(
        long = "speedtest.server-url",
        default_value_t = default_server_url(),
        help = "Speedtest server URL"
    )]
    pub server_url: String,

    /// Interval in seconds between two measurements
    #[arg(
        long = "speedtest.interval",
        default_value_t = 60,
        help = "Interval in seconds between measurements."
    )]
    pub interval: u64,

    #[arg(long = "log.level", value_enum, default_value_t = LogLevel::Info, help = "Only log messages with the given severity or above.")]
    pub log_level: LogLevel,

    #[arg(long = "log.format", value_enum, default_value_t = LogFormat::Logfmt, help = "Output format of log messages.")]
    pub log_format: LogFormat,
}

impl Args {
    /// Parses process arguments, accepting Go-style single-dash long flags
    pub fn parse_normalized() -> Self {
        Self::parse_from(normalize_flags(std::env::args_os()))
    }
}

pub fn version_string() -> String {
    format!("Speedtest Prometheus exporter. v{}", VERSION)
}

/// Rewrites `-flag` and `-flag=value` into `--flag` forms.
///
/// Single character short flags (`-h`) and anything after `--` are left untouched.
pub fn normalize_flags<I, T>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    let mut passthrough = false;
    args.into_iter()
        .enumerate()
        .map(|(i, arg)| {
            let arg: OsString = arg.into();
            // program name
            if i == 0 || passthrough {
                return arg;
            }
            let Some(s) = arg.to_str() else {
                return arg;
            };
            if s == "--" {
                passthrough = true;
                return arg;
            }
            let name = s.split('=').next().unwrap_or(s);
            if s.starts_with('-') && !s.starts_with("--") && name.len() > 2 {
                OsString::from(format!("-{}", s))
            } else {
                arg
            }
        })
        .collect()
}

/// Random cache-busting token, unique per process start.
fn random_token() -> String {
    rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(16)
        .map(char::from)
        .collect()
}

fn default_config_url() -> String {
    format!("{}?x={}", SPEEDTEST_CONFIG_URL, random_token())
}

fn default_server_url() -> String {
    format!("{}?x={}", SPEEDTEST_SERVERS_URL, random_token())
}
