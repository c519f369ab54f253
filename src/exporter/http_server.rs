use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use std::convert::Infallible;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::ExporterError;
use crate::exporter::metric::SpeedtestMetrics;
use crate::exporter::runner::wait_for_shutdown;

/// What every request handler needs
#[derive(Debug, Clone)]
pub struct ExporterState {
    pub metrics: Arc<SpeedtestMetrics>,
    pub telemetry_path: Arc<str>,
}

impl ExporterState {
    pub fn new(metrics: Arc<SpeedtestMetrics>, telemetry_path: &str) -> Self {
        Self {
            metrics,
            telemetry_path: Arc::from(telemetry_path),
        }
    }
}

/// Binds `addr` and serves until shutdown is requested
pub async fn start_metrics_server(
    state: ExporterState,
    addr: SocketAddr,
    shutdown: watch::Receiver<bool>,
) -> Result<(), ExporterError> {
    let listener = bind(addr).await?;

    info!(addr = %listener.local_addr().unwrap_or(addr), "Listening on");
    serve(listener, state, shutdown).await;
    Ok(())
}

/// Binds `addr`; `[::]` falls back to `0.0.0.0` on hosts without IPv6
async fn bind(addr: SocketAddr) -> Result<TcpListener, ExporterError> {
    match TcpListener::bind(addr).await {
        Ok(listener) => Ok(listener),
        Err(source) => match ipv4_fallback(addr) {
            Some(fallback) => {
                warn!(%addr, %fallback, error = %source, "IPv6 unavailable, listening on IPv4 only");
                TcpListener::bind(fallback)
                    .await
                    .map_err(|source| ExporterError::Bind { addr: fallback, source })
            }
            None => Err(ExporterError::Bind { addr, source }),
        },
    }
}

fn ipv4_fallback(addr: SocketAddr) -> Option<SocketAddr> {
    match addr {
        SocketAddr::V6(v6) if v6.ip().is_unspecified() => {
            Some(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), v6.port()))
        }
        _ => None,
    }
}

/// Accept loop, one task per connection
pub async fn serve(listener: TcpListener, state: ExporterState, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer)) => {
                        let state = state.clone();

                        tokio::task::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| {
                                let state = state.clone();
                                async move { Ok::<_, Infallible>(handle_request(req, &state)) }
                            });

                            if let Err(err) = Builder::new(TokioExecutor::new())
                                .serve_connection(io, service)
                                .await
                            {
                                debug!(%peer, error = %err, "Error serving connection");
                            }
                        });
                    }
                    Err(err) => {
                        error!(error = %err, "Failed to accept connection");
                    }
                }
            }
            _ = wait_for_shutdown(&mut shutdown) => {
                info!("Metrics server shutting down gracefully");
                break;
            }
        }
    }
}

/// Routes a request. Reading the registry is the only side effect.
pub fn handle_request<B>(req: Request<B>, state: &ExporterState) -> Response<Full<Bytes>> {
    // hyper drops the body of HEAD responses
    if req.method() != Method::GET && req.method() != Method::HEAD {
        return not_found();
    }

    let path = req.uri().path();
    if path == &*state.telemetry_path {
        match state.metrics.gather() {
            Ok(body) => respond(StatusCode::OK, prometheus::TEXT_FORMAT, body),
            Err(err) => {
                error!(error = %err, "Error encoding metrics");
                respond(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "text/plain; charset=utf-8",
                    format!("error encoding metrics: {}", err),
                )
            }
        }
    } else if path == "/" {
        respond(StatusCode::OK, "text/html; charset=utf-8", landing_page(&state.telemetry_path))
    } else {
        not_found()
    }
}

fn landing_page(telemetry_path: &str) -> String {
    format!(
        r#"<html>
<head><title>Speedtest Exporter</title></head>
<body>
<h1>Speedtest Exporter</h1>
<p><a href='{}'>Metrics</a></p>
</body>
</html>"#,
        telemetry_path
    )
}

fn not_found() -> Response<Full<Bytes>> {
    respond(StatusCode::NOT_FOUND, "text/plain; charset=utf-8", "Not Found".to_string())
}

fn respond(status: StatusCode, content_type: &'static str, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}
