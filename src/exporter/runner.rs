use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info};

use crate::error::ProviderError;
use crate::exporter::metric::{SpeedtestMetrics, DOWNLOAD, PING, UPLOAD};
use crate::speedtest::{Measurement, MeasurementProvider};

/// Spawns the measurement loop as a background task.
///
/// The loop stops only when `shutdown` carries `true`. If every sender is
/// dropped it keeps running for the lifetime of the runtime.
pub fn spawn_measurement_loop(
    provider: Arc<dyn MeasurementProvider>,
    metrics: Arc<SpeedtestMetrics>,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(run_measurement_loop(provider, metrics, interval, shutdown))
}

pub async fn run_measurement_loop(
    provider: Arc<dyn MeasurementProvider>,
    metrics: Arc<SpeedtestMetrics>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = wait_for_shutdown(&mut shutdown) => break,
        }

        // a hung provider call stalls every later tick, there is no timeout here
        tokio::select! {
            _ = measure_once(provider.as_ref(), &metrics) => {}
            _ = wait_for_shutdown(&mut shutdown) => break,
        }
    }

    info!("Measurement loop stopped");
}

/// Runs one measurement and publishes it. Gauges are left untouched on failure.
pub async fn measure_once(
    provider: &dyn MeasurementProvider,
    metrics: &SpeedtestMetrics,
) -> Result<Measurement, ProviderError> {
    info!("Speedtest exporter starting");

    let measurement = match provider.measure().await {
        Ok(measurement) => measurement,
        Err(err) => {
            error!(error = %err, "Failed to gather metrics");
            return Err(err);
        }
    };

    publish(metrics, &measurement);
    info!(
        ping_ms = measurement.ping,
        download_mbps = measurement.download,
        upload_mbps = measurement.upload,
        "Speedtest exporter finished"
    );

    Ok(measurement)
}

fn publish(metrics: &SpeedtestMetrics, measurement: &Measurement) {
    for (name, value) in [
        (PING, measurement.ping),
        (DOWNLOAD, measurement.download),
        (UPLOAD, measurement.upload),
    ] {
        if let Err(err) = metrics.set(name, value) {
            error!(error = %err, "Failed to publish {}", name);
        }
    }
}

/// Resolves once shutdown is requested, never if the sender is gone.
pub(crate) async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Replays canned results, then keeps failing
    struct ScriptedProvider {
        results: Mutex<VecDeque<Result<Measurement, ProviderError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn new(results: Vec<Result<Measurement, ProviderError>>) -> Self {
            Self {
                results: Mutex::new(results.into()),
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MeasurementProvider for ScriptedProvider {
        async fn measure(&self) -> Result<Measurement, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(ProviderError::NoServers))
        }
    }

    fn reading(ping: f64, download: f64, upload: f64) -> Measurement {
        Measurement {
            ping,
            download,
            upload,
        }
    }

    fn values(metrics: &SpeedtestMetrics) -> (f64, f64, f64) {
        let snapshot = metrics.snapshot();
        let get = |name: &str| snapshot.iter().find(|s| s.name == name).unwrap().value;
        (get(PING), get(DOWNLOAD), get(UPLOAD))
    }

    #[tokio::test]
    async fn successful_measurement_is_published() {
        let metrics = SpeedtestMetrics::new().unwrap();
        let provider = ScriptedProvider::new(vec![Ok(reading(12.3, 45.6, 7.8))]);

        let measurement = measure_once(&provider, &metrics).await.unwrap();

        assert_eq!(measurement, reading(12.3, 45.6, 7.8));
        assert_eq!(values(&metrics), (12.3, 45.6, 7.8));
    }

    #[tokio::test]
    async fn failed_measurement_keeps_previous_values() {
        let metrics = SpeedtestMetrics::new().unwrap();
        let provider = ScriptedProvider::new(vec![
            Ok(reading(20.0, 100.0, 10.0)),
            Err(ProviderError::NoLatency("http://example".into())),
        ]);

        measure_once(&provider, &metrics).await.unwrap();
        let before = values(&metrics);
        assert!(measure_once(&provider, &metrics).await.is_err());

        assert_eq!(values(&metrics), before);
    }

    #[tokio::test]
    async fn failure_before_any_success_leaves_zeroes() {
        let metrics = SpeedtestMetrics::new().unwrap();
        let provider = ScriptedProvider::new(vec![]);

        assert!(measure_once(&provider, &metrics).await.is_err());
        assert_eq!(values(&metrics), (0.0, 0.0, 0.0));
    }

    #[tokio::test(start_paused = true)]
    async fn loop_measures_immediately_then_every_interval() {
        let metrics = Arc::new(SpeedtestMetrics::new().unwrap());
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok(reading(10.0, 50.0, 5.0)),
            Err(ProviderError::NoServers),
            Ok(reading(11.0, 60.0, 6.0)),
        ]));
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = spawn_measurement_loop(
            provider.clone(),
            metrics.clone(),
            Duration::from_secs(60),
            shutdown_rx,
        );

        time::sleep(Duration::from_secs(1)).await;
        assert_eq!(provider.calls(), 1);
        assert_eq!(values(&metrics), (10.0, 50.0, 5.0));

        // failed tick: no immediate retry, stale values stay
        time::sleep(Duration::from_secs(60)).await;
        assert_eq!(provider.calls(), 2);
        assert_eq!(values(&metrics), (10.0, 50.0, 5.0));

        time::sleep(Duration::from_secs(60)).await;
        assert_eq!(provider.calls(), 3);
        assert_eq!(values(&metrics), (11.0, 60.0, 6.0));

        assert!(!handle.is_finished());
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn loop_outlives_dropped_shutdown_sender() {
        let metrics = Arc::new(SpeedtestMetrics::new().unwrap());
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        drop(shutdown_tx);

        let handle = spawn_measurement_loop(provider.clone(), metrics, Duration::from_secs(10), shutdown_rx);

        time::sleep(Duration::from_secs(35)).await;
        assert_eq!(provider.calls(), 4);
        assert!(!handle.is_finished());
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_the_loop() {
        let metrics = Arc::new(SpeedtestMetrics::new().unwrap());
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = spawn_measurement_loop(provider.clone(), metrics, Duration::from_secs(60), shutdown_rx);
        time::sleep(Duration::from_secs(1)).await;

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(provider.calls(), 1);
    }
}
