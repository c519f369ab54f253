use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use reqwest::{Client, Response, Url};
use tracing::{debug, info, warn};

use crate::cli::VERSION;
use crate::error::ProviderError;
use crate::speedtest::settings::{self, Server};
use crate::speedtest::{Measurement, MeasurementProvider};

// Number of nearest servers probed when picking the test server
const CLOSEST_CANDIDATES: usize = 5;
const LATENCY_SAMPLES: usize = 3;
// Edge length of the random{N}x{N}.jpg images hosted by every server
const DOWNLOAD_SIZES: &[u32] = &[350, 500, 750, 1000, 1500];
const UPLOAD_SIZES: &[usize] = &[256 * 1024, 512 * 1024, 1024 * 1024];
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// speedtest.net client bound to the fastest of the nearest servers
#[derive(Debug)]
pub struct SpeedtestClient {
    http: Client,
    server: Server,
    upload_url: Url,
}

impl SpeedtestClient {
    /// Discovers our location and the server list, then selects the test server.
    pub async fn new(config_url: &str, server_url: &str) -> Result<Self, ProviderError> {
        debug!(config_url, server_url, "New speedtest client");

        let http = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(format!("speedtest-exporter/{}", VERSION))
            .build()
            .map_err(ProviderError::Builder)?;

        let client = settings::parse_client(&fetch_text(&http, config_url).await?)?;
        info!(ip = %client.ip, isp = %client.isp, "Speedtest configuration retrieved");

        let servers = settings::parse_servers(&fetch_text(&http, server_url).await?)?;
        debug!(count = servers.len(), "Speedtest servers retrieved");

        let mut best: Option<(Server, Url, f64)> = None;
        for server in settings::closest_servers(servers, &client.location, CLOSEST_CANDIDATES) {
            let upload_url = match Url::parse(&server.url) {
                Ok(url) => url,
                Err(err) => {
                    warn!(server = %server.url, error = %err, "Skipping server with invalid url");
                    continue;
                }
            };

            match latency(&http, &upload_url).await {
                Ok(ms) => {
                    debug!(server = %server.name, latency_ms = ms, "Probed server");
                    if best.as_ref().map_or(true, |(_, _, fastest)| ms < *fastest) {
                        best = Some((server, upload_url, ms));
                    }
                }
                Err(err) => warn!(server = %server.name, error = %err, "Server unreachable"),
            }
        }

        let (server, upload_url, latency_ms) = best.ok_or(ProviderError::NoServers)?;
        info!(
            id = %server.id,
            name = %server.name,
            sponsor = %server.sponsor,
            country = %server.country,
            host = %server.host,
            latency_ms,
            "Selected speedtest server"
        );

        Ok(Self {
            http,
            server,
            upload_url,
        })
    }

    #[cfg(test)]
    fn server(&self) -> &Server {
        &self.server
    }

    async fn download(&self) -> Result<f64, ProviderError> {
        let mut total_bytes: u64 = 0;
        let start = Instant::now();

        for size in DOWNLOAD_SIZES {
            let url = resource(&self.upload_url, &format!("random{0}x{0}.jpg", size))?;
            let mut resp = send(self.http.get(url.clone()), &url).await?;

            while let Some(chunk) = resp
                .chunk()
                .await
                .map_err(|err| ProviderError::http(url.as_str(), err))?
            {
                total_bytes += chunk.len() as u64;
            }
        }

        Ok(mbps(total_bytes, start.elapsed()))
    }

    async fn upload(&self) -> Result<f64, ProviderError> {
        let payloads: Vec<String> = UPLOAD_SIZES
            .iter()
            .map(|size| format!("content1={}", random_payload(*size)))
            .collect();

        let mut total_bytes: u64 = 0;
        let start = Instant::now();

        for payload in payloads {
            total_bytes += payload.len() as u64;
            let request = self
                .http
                .post(self.upload_url.clone())
                .header("Content-Type", "application/x-www-form-urlencoded")
                .body(payload);
            let resp = send(request, &self.upload_url).await?;
            // drain so the connection can be reused
            resp.bytes()
                .await
                .map_err(|err| ProviderError::http(self.upload_url.as_str(), err))?;
        }

        Ok(mbps(total_bytes, start.elapsed()))
    }
}

#[async_trait]
impl MeasurementProvider for SpeedtestClient {
    async fn measure(&self) -> Result<Measurement, ProviderError> {
        debug!(server = %self.server.name, host = %self.server.host, "Measuring");
        let ping = latency(&self.http, &self.upload_url).await?;
        let download = self.download().await?;
        let upload = self.upload().await?;

        Ok(Measurement {
            ping,
            download,
            upload,
        })
    }
}

/// Average round trip in ms of the successful `latency.txt` probes
async fn latency(http: &Client, upload_url: &Url) -> Result<f64, ProviderError> {
    let url = resource(upload_url, "latency.txt")?;
    let mut samples = Vec::with_capacity(LATENCY_SAMPLES);

    for _ in 0..LATENCY_SAMPLES {
        let start = Instant::now();
        let probe = async {
            let resp = send(http.get(url.clone()), &url).await?;
            resp.bytes()
                .await
                .map_err(|err| ProviderError::http(url.as_str(), err))
        };

        match probe.await {
            Ok(_) => samples.push(start.elapsed().as_secs_f64() * 1000.0),
            Err(err) => debug!(url = %url, error = %err, "Latency probe failed"),
        }
    }

    if samples.is_empty() {
        return Err(ProviderError::NoLatency(url.to_string()));
    }

    Ok(samples.iter().sum::<f64>() / samples.len() as f64)
}

async fn fetch_text(http: &Client, url: &str) -> Result<String, ProviderError> {
    let resp = send(http.get(url), url).await?;
    resp.text()
        .await
        .map_err(|err| ProviderError::http(url, err))
}

async fn send(request: reqwest::RequestBuilder, url: impl AsRef<str>) -> Result<Response, ProviderError> {
    let url = url.as_ref();
    let resp = request
        .send()
        .await
        .map_err(|err| ProviderError::http(url, err))?;

    if !resp.status().is_success() {
        return Err(ProviderError::Status {
            url: url.to_string(),
            status: resp.status(),
        });
    }

    Ok(resp)
}

/// Test files are served from the directory holding the upload endpoint
fn resource(upload_url: &Url, file: &str) -> Result<Url, ProviderError> {
    upload_url
        .join(file)
        .map_err(|err| ProviderError::parse(format!("cannot derive {} from {}: {}", file, upload_url, err)))
}

fn random_payload(size: usize) -> String {
    rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(size)
        .map(char::from)
        .collect()
}

fn mbps(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64().max(1e-6);
    (bytes as f64 * 8.0) / (secs * 1_000_000.0)
}
