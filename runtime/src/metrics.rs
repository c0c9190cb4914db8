//! Prometheus metrics for the transaction engine and the job worker.
//!
//! Recording goes through the `metrics` facade and is a no-op until a
//! recorder is installed, so library code records unconditionally.
//!
//! # Example
//!
//! ```rust,no_run
//! use boxoffice_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Scrape endpoint on port 9090
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.serve()?;
//!
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use boxoffice_core::jobs::JobKind;
use boxoffice_core::types::TransactionStatus;
use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server bound to `addr` once served.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Install the recorder without an HTTP endpoint.
    ///
    /// Metrics are then only available through [`render`](Self::render).
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed. An already
    /// installed recorder is tolerated.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let recorder = builder()?.build_recorder();
        let handle = recorder.handle();
        self.install(recorder, handle)
    }

    /// Install the recorder and serve `/metrics` on the configured address.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed. An already
    /// installed recorder is tolerated.
    pub fn serve(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let (recorder, exporter) = builder()?
            .with_http_listener(self.addr)
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;
        let handle = recorder.handle();
        self.install(recorder, handle)?;

        tokio::spawn(async move {
            if exporter.await.is_err() {
                tracing::error!("Metrics exporter stopped");
            }
        });
        tracing::info!(addr = %self.addr, "Metrics available at http://{}/metrics", self.addr);
        Ok(())
    }

    fn install(
        &mut self,
        recorder: metrics_exporter_prometheus::PrometheusRecorder,
        handle: PrometheusHandle,
    ) -> Result<(), MetricsError> {
        match metrics::set_global_recorder(recorder) {
            Ok(()) => {
                self.handle = Some(handle);
                Ok(())
            },
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            },
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn builder() -> Result<PrometheusBuilder, MetricsError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Suffix("duration_seconds".to_string()),
            &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
        )
        .map_err(|e| MetricsError::Build(e.to_string()))
}

fn register_metrics() {
    // Orders
    describe_counter!(
        "boxoffice_orders_created_total",
        "Total number of orders created"
    );
    describe_counter!(
        "boxoffice_orders_failed_total",
        "Total number of orders rolled back, by error code"
    );

    // Lifecycle
    describe_counter!(
        "boxoffice_transitions_total",
        "Total number of status transitions, by target status"
    );
    describe_counter!(
        "boxoffice_compensations_total",
        "Total number of transactions whose resources were handed back"
    );

    // Jobs
    describe_counter!(
        "boxoffice_jobs_processed_total",
        "Total number of job executions, by kind and outcome"
    );
    describe_counter!(
        "boxoffice_jobs_dead_lettered_total",
        "Total number of jobs moved to the dead-letter store"
    );
    describe_histogram!(
        "boxoffice_job_duration_seconds",
        "Time taken to run a job handler"
    );
}

/// Order and lifecycle metrics recorder.
pub struct LifecycleMetrics;

impl LifecycleMetrics {
    /// Record a committed order.
    pub fn record_order_created() {
        counter!("boxoffice_orders_created_total").increment(1);
    }

    /// Record an order that rolled back.
    pub fn record_order_failed(code: &'static str) {
        counter!("boxoffice_orders_failed_total", "code" => code).increment(1);
    }

    /// Record a committed status transition.
    pub fn record_transition(to: TransactionStatus) {
        counter!("boxoffice_transitions_total", "to" => to.as_str()).increment(1);
    }

    /// Record a compensation that handed resources back.
    pub fn record_compensation() {
        counter!("boxoffice_compensations_total").increment(1);
    }
}

/// Outcome of one job execution, as a metric label.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    /// Handler succeeded, job removed
    Completed,
    /// Handler failed, job rescheduled
    Retried,
    /// Handler failed for the last time or no handler exists
    DeadLettered,
}

impl JobOutcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Retried => "retried",
            Self::DeadLettered => "dead_lettered",
        }
    }
}

/// Job worker metrics recorder.
pub struct JobMetrics;

impl JobMetrics {
    /// Record one job execution.
    pub fn record_execution(kind: JobKind, outcome: JobOutcome, duration: Duration) {
        counter!(
            "boxoffice_jobs_processed_total",
            "kind" => kind.as_str(),
            "outcome" => outcome.as_str()
        )
        .increment(1);
        histogram!("boxoffice_job_duration_seconds", "kind" => kind.as_str())
            .record(duration.as_secs_f64());
        if outcome == JobOutcome::DeadLettered {
            counter!("boxoffice_jobs_dead_lettered_total", "kind" => kind.as_str()).increment(1);
        }
    }
}
