//! Telemetry for Tidecast
//!
//! This module provides the Prometheus metrics the external autoscaler scrapes
//! and the JSON snapshot served for humans. Every update is an atomic
//! operation on a prometheus collector, so workers never contend on a lock
//! and scrapes never block request processing.

use crate::error::{ErrorKind, Result, ServeError};
use prometheus::core::Metric;
use prometheus::{
    Encoder, Gauge, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    Opts, Registry, TextEncoder,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Outcome label for successful requests
pub const OUTCOME_SUCCESS: &str = "success";
/// Outcome label for failed requests
pub const OUTCOME_ERROR: &str = "error";
/// Outcome label for requests withdrawn before dequeue
pub const OUTCOME_CANCELLED: &str = "cancelled";

/// Queue wait buckets in seconds
const QUEUE_WAIT_BUCKETS: [f64; 10] = [0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0];

/// Telemetry emitter shared by queue, pool, registry and API
#[derive(Clone)]
pub struct Telemetry {
    registry: Registry,
    requests_total: IntCounterVec,
    errors_total: IntCounterVec,
    latency: HistogramVec,
    queue_wait: Histogram,
    queue_length: IntGauge,
    queue_oldest_wait: Gauge,
    active_workers: IntGauge,
    workers_total: IntGauge,
    worker_utilization: Gauge,
    model_ready: IntGauge,
    promotions_total: IntCounterVec,
    sanitized_features: IntCounter,
    served_cached: IntCounter,
}

/// One cumulative latency bucket of the JSON snapshot
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LatencyBucket {
    /// Upper bound in seconds
    pub le: f64,
    /// Successful requests at or under the bound
    pub success: u64,
    /// Failed requests at or under the bound
    pub error: u64,
}

/// Read-only view of the aggregate counters
#[derive(Debug, Clone, Serialize)]
pub struct TelemetrySnapshot {
    pub queue_length: i64,
    pub oldest_wait_ms: u64,
    pub active_workers: i64,
    pub workers_total: i64,
    pub worker_utilization: f64,
    pub completed_count: u64,
    pub error_count: u64,
    pub cancelled_count: u64,
    pub served_cached: u64,
    pub model_ready: bool,
    pub errors_by_kind: BTreeMap<String, u64>,
    pub promotions: BTreeMap<String, u64>,
    pub latency_histogram: Vec<LatencyBucket>,
}

fn register<C>(registry: &Registry, collector: C) -> Result<C>
where
    C: prometheus::core::Collector + Clone + 'static,
{
    registry
        .register(Box::new(collector.clone()))
        .map_err(|e| ServeError::config(format!("Failed to register metric: {}", e)))?;
    Ok(collector)
}

fn metric_err(e: prometheus::Error) -> ServeError {
    ServeError::config(format!("Invalid metric definition: {}", e))
}

impl fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Telemetry")
            .field("queue_length", &self.queue_length.get())
            .field("active_workers", &self.active_workers.get())
            .field("workers_total", &self.workers_total.get())
            .finish_non_exhaustive()
    }
}

impl Telemetry {
    /// Create a telemetry emitter with its own registry
    pub fn new(latency_buckets: Vec<f64>) -> Result<Self> {
        let registry = Registry::new();

        let requests_total = register(
            &registry,
            IntCounterVec::new(
                Opts::new("inference_requests_total", "Total requests by terminal outcome"),
                &["outcome"],
            )
            .map_err(metric_err)?,
        )?;

        let errors_total = register(
            &registry,
            IntCounterVec::new(
                Opts::new("inference_errors_total", "Total failed requests by error kind"),
                &["kind"],
            )
            .map_err(metric_err)?,
        )?;

        let latency = register(
            &registry,
            HistogramVec::new(
                HistogramOpts::new(
                    "inference_latency_seconds",
                    "Seconds from dequeue to completion",
                )
                .buckets(latency_buckets),
                &["outcome"],
            )
            .map_err(metric_err)?,
        )?;

        let queue_wait = register(
            &registry,
            Histogram::with_opts(
                HistogramOpts::new(
                    "inference_queue_wait_seconds",
                    "Seconds requests spent waiting in the admission queue",
                )
                .buckets(QUEUE_WAIT_BUCKETS.to_vec()),
            )
            .map_err(metric_err)?,
        )?;

        let queue_length = register(
            &registry,
            IntGauge::new("inference_queue_length", "Current admission queue depth")
                .map_err(metric_err)?,
        )?;

        let queue_oldest_wait = register(
            &registry,
            Gauge::new(
                "inference_queue_oldest_wait_seconds",
                "Age of the oldest queued request in seconds",
            )
            .map_err(metric_err)?,
        )?;

        let active_workers = register(
            &registry,
            IntGauge::new("inference_active_workers", "Workers currently executing")
                .map_err(metric_err)?,
        )?;

        let workers_total = register(
            &registry,
            IntGauge::new("inference_workers_total", "Configured worker slots")
                .map_err(metric_err)?,
        )?;

        let worker_utilization = register(
            &registry,
            Gauge::new("inference_worker_utilization", "Busy worker ratio (0-1)")
                .map_err(metric_err)?,
        )?;

        let model_ready = register(
            &registry,
            IntGauge::new("inference_model_ready", "Whether a model is loaded (1=yes,0=no)")
                .map_err(metric_err)?,
        )?;

        let promotions_total = register(
            &registry,
            IntCounterVec::new(
                Opts::new("inference_promotions_total", "Promotion events by result"),
                &["result"],
            )
            .map_err(metric_err)?,
        )?;

        let sanitized_features = register(
            &registry,
            IntCounter::new(
                "inference_scaler_sanitized_features_total",
                "Zero-variance scaler features clamped at model load",
            )
            .map_err(metric_err)?,
        )?;

        let served_cached = register(
            &registry,
            IntCounter::new(
                "inference_served_cached_total",
                "Requests answered from the last-prediction cache",
            )
            .map_err(metric_err)?,
        )?;

        Ok(Self {
            registry,
            requests_total,
            errors_total,
            latency,
            queue_wait,
            queue_length,
            queue_oldest_wait,
            active_workers,
            workers_total,
            worker_utilization,
            model_ready,
            promotions_total,
            sanitized_features,
            served_cached,
        })
    }

    /// Record a successful request
    pub fn record_success(&self, latency: Duration) {
        self.requests_total.with_label_values(&[OUTCOME_SUCCESS]).inc();
        self.latency
            .with_label_values(&[OUTCOME_SUCCESS])
            .observe(latency.as_secs_f64());
    }

    /// Record a failed request
    ///
    /// `latency` is `None` for requests rejected before reaching a worker.
    pub fn record_error(&self, kind: ErrorKind, latency: Option<Duration>) {
        self.requests_total.with_label_values(&[OUTCOME_ERROR]).inc();
        self.errors_total.with_label_values(&[kind.as_str()]).inc();
        if let Some(latency) = latency {
            self.latency
                .with_label_values(&[OUTCOME_ERROR])
                .observe(latency.as_secs_f64());
        }
    }

    /// Record a request withdrawn by its caller before dequeue
    pub fn record_cancelled(&self) {
        self.requests_total.with_label_values(&[OUTCOME_CANCELLED]).inc();
    }

    /// Record time spent in the admission queue
    pub fn record_queue_wait(&self, wait: Duration) {
        self.queue_wait.observe(wait.as_secs_f64());
    }

    /// Set the queue depth gauge
    pub fn set_queue_length(&self, len: usize) {
        self.queue_length.set(len as i64);
    }

    /// Set the oldest-wait gauge
    pub fn set_oldest_wait(&self, wait: Duration) {
        self.queue_oldest_wait.set(wait.as_secs_f64());
    }

    /// A worker started executing
    pub fn worker_started(&self) {
        self.active_workers.inc();
    }

    /// A worker finished executing
    pub fn worker_finished(&self) {
        self.active_workers.dec();
    }

    /// Set the number of configured worker slots
    pub fn set_workers_total(&self, total: usize) {
        self.workers_total.set(total as i64);
    }

    /// Busy fraction of the worker slots, derived from the live gauges
    pub fn worker_utilization(&self) -> f64 {
        let total = self.workers_total.get().max(1) as f64;
        let active = self.active_workers.get().max(0) as f64;
        (active / total).min(1.0)
    }

    /// Set model readiness
    pub fn set_model_ready(&self, ready: bool) {
        self.model_ready.set(i64::from(ready));
    }

    /// Record a promotion event outcome
    pub fn record_promotion(&self, result: &str) {
        self.promotions_total.with_label_values(&[result]).inc();
    }

    /// Record zero-variance features clamped while loading a model
    pub fn record_sanitized_features(&self, count: usize) {
        self.sanitized_features.inc_by(count as u64);
    }

    /// Record a cached response
    pub fn record_served_cached(&self) {
        self.served_cached.inc();
    }

    /// Current queue depth as seen by scrapers
    pub fn queue_length(&self) -> i64 {
        self.queue_length.get()
    }

    /// Current number of executing workers
    pub fn active_workers(&self) -> i64 {
        self.active_workers.get()
    }

    /// Gather all metrics in the Prometheus text exposition format
    pub fn gather(&self) -> Result<String> {
        self.worker_utilization.set(self.worker_utilization());
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| ServeError::unhandled(format!("Failed to encode metrics: {}", e)))?;
        String::from_utf8(buffer)
            .map_err(|e| ServeError::unhandled(format!("Metrics are not UTF-8: {}", e)))
    }

    /// Build the JSON snapshot
    pub fn snapshot(&self) -> TelemetrySnapshot {
        let errors_by_kind = ErrorKind::ALL
            .iter()
            .map(|kind| {
                let count = self.errors_total.with_label_values(&[kind.as_str()]).get();
                (kind.as_str().to_string(), count)
            })
            .filter(|(_, count)| *count > 0)
            .collect();

        let promotions = ["applied", "unchanged", "stale", "ignored", "failed"]
            .iter()
            .map(|r| (r.to_string(), self.promotions_total.with_label_values(&[r]).get()))
            .filter(|(_, count)| *count > 0)
            .collect();

        TelemetrySnapshot {
            queue_length: self.queue_length.get(),
            oldest_wait_ms: (self.queue_oldest_wait.get() * 1000.0).max(0.0) as u64,
            active_workers: self.active_workers.get(),
            workers_total: self.workers_total.get(),
            worker_utilization: self.worker_utilization(),
            completed_count: self.requests_total.with_label_values(&[OUTCOME_SUCCESS]).get(),
            error_count: self.requests_total.with_label_values(&[OUTCOME_ERROR]).get(),
            cancelled_count: self
                .requests_total
                .with_label_values(&[OUTCOME_CANCELLED])
                .get(),
            served_cached: self.served_cached.get(),
            model_ready: self.model_ready.get() == 1,
            errors_by_kind,
            promotions,
            latency_histogram: self.latency_buckets(),
        }
    }

    fn latency_buckets(&self) -> Vec<LatencyBucket> {
        let success = self.latency.with_label_values(&[OUTCOME_SUCCESS]).metric();
        let error = self.latency.with_label_values(&[OUTCOME_ERROR]).metric();

        success
            .get_histogram()
            .get_bucket()
            .iter()
            .zip(error.get_histogram().get_bucket().iter())
            .map(|(s, e)| LatencyBucket {
                le: s.get_upper_bound(),
                success: s.get_cumulative_count(),
                error: e.get_cumulative_count(),
            })
            .collect()
    }
}
