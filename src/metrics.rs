//! Queue observability: the series duraq emits and the backends that carry
//! them.
//!
//! [`QueueMetrics`] names one method per measurement site in the queue:
//! enqueue volume and payload size, persisted processing outcomes, retry
//! attempt distribution, fetch/heal/clean pass sizes and durations, and the
//! worker-slot gauge. Embedders that already run statsd plug in
//! [`StatsdQueueMetrics`]; everyone else gets [`NoOpQueueMetrics`] for free.

use async_trait::async_trait;
use cadence::{
    BufferedUdpMetricSink, Counted, CountedExt, Gauged, Histogrammed, QueuingMetricSink,
    StatsdClient, Timed,
};
use std::fmt;
use std::net::UdpSocket;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::task::TaskStatus;

/// Passes measured by [`QueueMetrics::operation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueOperation {
    /// A claim pass of the fetch loop.
    Fetch,
    /// A healer pass curing stuck rows.
    Heal,
    /// A cleaner pass deleting terminal rows.
    Clean,
}

impl QueueOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueOperation::Fetch => "fetch",
            QueueOperation::Heal => "heal",
            QueueOperation::Clean => "clean",
        }
    }
}

impl fmt::Display for QueueOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The measurements the queue publishes, one method per site.
#[async_trait]
pub trait QueueMetrics: Send + Sync {
    /// A task entered the queue; `payload_bytes` is its raw payload size.
    async fn task_enqueued(&self, task_type: &str, payload_bytes: usize);

    /// A handler outcome was persisted with the given final status.
    async fn task_processed(&self, task_type: &str, status: TaskStatus);

    /// Attempts a task had consumed when its outcome was persisted.
    async fn task_attempts(&self, task_type: &str, attempts: i32);

    /// One fetch/heal/clean pass touched `rows` rows in `elapsed`.
    async fn operation(
        &self,
        task_type: &str,
        operation: QueueOperation,
        rows: usize,
        elapsed: Duration,
    );

    /// Worker slots available to a processor.
    async fn workers(&self, task_type: &str, count: usize);
}

/// Shared handle to a metrics backend.
pub type SharedQueueMetrics = Arc<dyn QueueMetrics>;

/// Backend that drops every measurement.
#[derive(Debug, Clone, Default)]
pub struct NoOpQueueMetrics;

impl NoOpQueueMetrics {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl QueueMetrics for NoOpQueueMetrics {
    async fn task_enqueued(&self, _task_type: &str, _payload_bytes: usize) {}
    async fn task_processed(&self, _task_type: &str, _status: TaskStatus) {}
    async fn task_attempts(&self, _task_type: &str, _attempts: i32) {}
    async fn operation(
        &self,
        _task_type: &str,
        _operation: QueueOperation,
        _rows: usize,
        _elapsed: Duration,
    ) {
    }
    async fn workers(&self, _task_type: &str, _count: usize) {}
}

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("error-duraq-metrics-1 failed to create statsd publisher: {details}")]
    CreationFailed { details: String },
}

fn creation_failed(err: impl fmt::Display) -> MetricsError {
    MetricsError::CreationFailed {
        details: err.to_string(),
    }
}

/// Tag a cadence builder with the given pairs plus the optional `service`
/// tag, then send.
macro_rules! emit {
    ($self:ident, $builder:expr, $(($key:expr, $value:expr)),+ $(,)?) => {{
        let mut builder = $builder;
        $( builder = builder.with_tag($key, $value); )+
        if let Some(service) = &$self.service {
            builder = builder.with_tag("service", service);
        }
        builder.send();
    }};
}

/// Statsd backend over buffered UDP.
///
/// Series: `task.enqueued` and `task.payload_size_bytes` at enqueue,
/// `task.processed` (tagged by final status) and `task.retry_attempts` at
/// outcome persistence, `queue.operations` and
/// `queue.operation_duration_ms` (tagged by operation) per maintenance or
/// fetch pass, and the `queue.workers` gauge. Every series carries a
/// `task_type` tag.
pub struct StatsdQueueMetrics {
    client: StatsdClient,
    service: Option<String>,
}

impl StatsdQueueMetrics {
    /// `host` is the statsd address (e.g. `"127.0.0.1:8125"`), `prefix` the
    /// metric namespace.
    pub fn new(host: &str, prefix: &str) -> Result<Self, MetricsError> {
        Self::with_service(host, prefix, None)
    }

    /// Attach a `service` tag to every series, for multi-service statsd
    /// roll-ups.
    pub fn with_service(
        host: &str,
        prefix: &str,
        service: Option<String>,
    ) -> Result<Self, MetricsError> {
        let socket = UdpSocket::bind("[::]:0").map_err(creation_failed)?;
        socket.set_nonblocking(true).map_err(creation_failed)?;

        let udp_sink = BufferedUdpMetricSink::from(host, socket).map_err(creation_failed)?;
        let sink = QueuingMetricSink::builder()
            .with_error_handler(|err| warn!(error = %err, "statsd sink dropped a metric"))
            .build(udp_sink);

        Ok(Self {
            client: StatsdClient::from_sink(prefix, sink),
            service,
        })
    }
}

#[async_trait]
impl QueueMetrics for StatsdQueueMetrics {
    async fn task_enqueued(&self, task_type: &str, payload_bytes: usize) {
        emit!(
            self,
            self.client.incr_with_tags("task.enqueued"),
            ("task_type", task_type),
        );
        emit!(
            self,
            self.client
                .histogram_with_tags("task.payload_size_bytes", payload_bytes as u64),
            ("task_type", task_type),
        );
    }

    async fn task_processed(&self, task_type: &str, status: TaskStatus) {
        emit!(
            self,
            self.client.incr_with_tags("task.processed"),
            ("task_type", task_type),
            ("status", status.as_str()),
        );
    }

    async fn task_attempts(&self, task_type: &str, attempts: i32) {
        emit!(
            self,
            self.client
                .histogram_with_tags("task.retry_attempts", attempts.max(0) as u64),
            ("task_type", task_type),
        );
    }

    async fn operation(
        &self,
        task_type: &str,
        operation: QueueOperation,
        rows: usize,
        elapsed: Duration,
    ) {
        emit!(
            self,
            self.client.count_with_tags("queue.operations", rows as u64),
            ("task_type", task_type),
            ("operation", operation.as_str()),
        );
        emit!(
            self,
            self.client
                .time_with_tags("queue.operation_duration_ms", elapsed.as_millis() as u64),
            ("task_type", task_type),
            ("operation", operation.as_str()),
        );
    }

    async fn workers(&self, task_type: &str, count: usize) {
        emit!(
            self,
            self.client.gauge_with_tags("queue.workers", count as u64),
            ("task_type", task_type),
        );
    }
}
