//! Prometheus metrics for the volume plugin
//!
//! Provides metrics for monitoring lifecycle operations, registry size,
//! and device attachment.

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

/// Metric names
pub mod names {
    /// Counter: Total lifecycle operations by type and status
    pub const OPERATIONS_TOTAL: &str = "volume_driver_operations_total";
    /// Histogram: Duration of lifecycle operations in seconds
    pub const OPERATION_DURATION_SECONDS: &str = "volume_driver_operation_duration_seconds";
    /// Gauge: Number of volumes in the registry
    pub const VOLUMES_TOTAL: &str = "volume_driver_volumes_total";
    /// Gauge: Number of volumes with at least one mount holder
    pub const MOUNTED_VOLUMES: &str = "volume_driver_mounted_volumes";
    /// Counter: Polls that found no device node yet
    pub const DEVICE_WAIT_RETRIES_TOTAL: &str = "volume_driver_device_wait_retries_total";
}

/// Initialize the Prometheus metrics exporter
///
/// Starts an HTTP server on the specified address that serves metrics
/// at the `/metrics` endpoint.
pub fn init_metrics(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on http://{}/metrics", addr);
    Ok(())
}

/// Record a lifecycle operation with its result
pub fn record_operation(operation: &str, status: &str, duration_secs: f64) {
    counter!(names::OPERATIONS_TOTAL, "operation" => operation.to_string(), "status" => status.to_string())
        .increment(1);
    histogram!(names::OPERATION_DURATION_SECONDS, "operation" => operation.to_string())
        .record(duration_secs);
}

pub fn set_volumes_count(count: usize) {
    gauge!(names::VOLUMES_TOTAL).set(count as f64);
}

pub fn set_mounted_count(count: usize) {
    gauge!(names::MOUNTED_VOLUMES).set(count as f64);
}

/// Record a device poll that came up empty
pub fn record_device_wait_retry() {
    counter!(names::DEVICE_WAIT_RETRIES_TOTAL).increment(1);
}

/// Helper for timing operations
pub struct OperationTimer {
    operation: &'static str,
    start: Instant,
}

impl OperationTimer {
    /// Start timing an operation
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }

    /// Complete the operation with success
    pub fn success(self) {
        let duration = self.start.elapsed().as_secs_f64();
        record_operation(self.operation, "success", duration);
    }

    /// Complete the operation with failure
    pub fn failure(self, error_code: &str) {
        let duration = self.start.elapsed().as_secs_f64();
        record_operation(self.operation, error_code, duration);
    }

    /// Complete with the outcome of `result`, passing it through.
    pub fn observe<T>(
        self,
        result: crate::error::DriverResult<T>,
    ) -> crate::error::DriverResult<T> {
        match &result {
            Ok(_) => self.success(),
            Err(e) => self.failure(e.code()),
        }
        result
    }
}
