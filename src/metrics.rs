//! Prometheus metrics for scheduled pipeline runs
//!
//! Metrics are exposed via HTTP endpoint `/metrics` when a listener port is
//! configured.
//!
//! # Available Metrics
//!
//! - `databridge_fires_total{schedule, outcome}` - Counter of timer fires by outcome
//! - `databridge_steps_total{schedule}` - Counter of root steps emitted by runs
//! - `databridge_step_failures_total{schedule}` - Counter of failed steps
//! - `databridge_fire_duration_seconds{schedule}` - Histogram of run durations
//! - `databridge_runs_in_flight` - Gauge of currently running pipelines
//!
//! # Example
//!
//! ```no_run
//! use databridge::metrics::MetricsServer;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let metrics = MetricsServer::new();
//! metrics.start(9090).await?;
//!
//! metrics.record_fire("nightly-orders", "completed", 12, 0, 1.5);
//! # Ok(())
//! # }
//! ```

use prometheus::{
    CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Histogram bucket boundaries for run duration (in seconds)
const FIRE_DURATION_BUCKETS: &[f64] = &[0.01, 0.1, 0.5, 1.0, 5.0, 30.0, 60.0, 300.0, 1800.0];

/// Prometheus metrics registry with an optional HTTP endpoint
#[derive(Clone)]
pub struct MetricsServer {
    registry: Arc<Registry>,
    fires: Arc<CounterVec>,
    steps: Arc<CounterVec>,
    step_failures: Arc<CounterVec>,
    fire_duration: Arc<HistogramVec>,
    runs_in_flight: Arc<Gauge>,
}

impl MetricsServer {
    pub fn new() -> Self {
        let registry = Registry::new();

        let fires = CounterVec::new(
            Opts::new("databridge_fires_total", "Total number of timer fires"),
            &["schedule", "outcome"],
        )
        .unwrap();

        let steps = CounterVec::new(
            Opts::new("databridge_steps_total", "Root steps emitted by pipeline runs"),
            &["schedule"],
        )
        .unwrap();

        let step_failures = CounterVec::new(
            Opts::new(
                "databridge_step_failures_total",
                "Failed steps in pipeline runs",
            ),
            &["schedule"],
        )
        .unwrap();

        let fire_duration = HistogramVec::new(
            HistogramOpts::new(
                "databridge_fire_duration_seconds",
                "Pipeline run duration in seconds",
            )
            .buckets(FIRE_DURATION_BUCKETS.to_vec()),
            &["schedule"],
        )
        .unwrap();

        let runs_in_flight = Gauge::with_opts(Opts::new(
            "databridge_runs_in_flight",
            "Pipeline runs currently executing",
        ))
        .unwrap();

        registry.register(Box::new(fires.clone())).unwrap();
        registry.register(Box::new(steps.clone())).unwrap();
        registry.register(Box::new(step_failures.clone())).unwrap();
        registry.register(Box::new(fire_duration.clone())).unwrap();
        registry.register(Box::new(runs_in_flight.clone())).unwrap();

        Self {
            registry: Arc::new(registry),
            fires: Arc::new(fires),
            steps: Arc::new(steps),
            step_failures: Arc::new(step_failures),
            fire_duration: Arc::new(fire_duration),
            runs_in_flight: Arc::new(runs_in_flight),
        }
    }

    /// Start the HTTP metrics listener on `port` (127.0.0.1 only)
    pub async fn start(&self, port: u16) -> anyhow::Result<()> {
        let addr = format!("127.0.0.1:{}", port);
        let listener = TcpListener::bind(&addr).await?;
        info!("Metrics server listening on http://{}/metrics", addr);

        let registry = self.registry.clone();

        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _addr)) => {
                        let registry = registry.clone();
                        tokio::spawn(async move {
                            if let Err(e) = Self::handle_request(stream, registry).await {
                                error!("Error handling metrics request: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                    }
                }
            }
        });

        Ok(())
    }

    async fn handle_request(
        mut stream: tokio::net::TcpStream,
        registry: Arc<Registry>,
    ) -> anyhow::Result<()> {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let mut buffer = [0; 1024];
        let n = stream.read(&mut buffer).await?;
        let request = String::from_utf8_lossy(&buffer[..n]);

        if request.starts_with("GET /metrics") {
            let body = Self::encode(&registry)?;
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\n\r\n{}",
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).await?;
        } else {
            let response = "HTTP/1.1 404 Not Found\r\nContent-Length: 9\r\n\r\nNot Found";
            stream.write_all(response.as_bytes()).await?;
        }

        Ok(())
    }

    fn encode(registry: &Registry) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    /// Current metrics in Prometheus text format
    pub fn render(&self) -> anyhow::Result<String> {
        Self::encode(&self.registry)
    }

    /// Record one timer fire
    ///
    /// `outcome` is one of "completed", "failed", "skipped" or "not_armed".
    pub fn record_fire(
        &self,
        schedule: &str,
        outcome: &str,
        steps: usize,
        failures: usize,
        duration_secs: f64,
    ) {
        self.fires.with_label_values(&[schedule, outcome]).inc();
        if steps > 0 {
            self.steps
                .with_label_values(&[schedule])
                .inc_by(steps as f64);
        }
        if failures > 0 {
            self.step_failures
                .with_label_values(&[schedule])
                .inc_by(failures as f64);
        }
        if outcome == "completed" || outcome == "failed" {
            self.fire_duration
                .with_label_values(&[schedule])
                .observe(duration_secs);
        }
    }

    pub fn inc_runs_in_flight(&self) {
        self.runs_in_flight.inc();
    }

    pub fn dec_runs_in_flight(&self) {
        self.runs_in_flight.dec();
    }
}

impl Default for MetricsServer {
    fn default() -> Self {
        Self::new()
    }
}
