//! Structured metrics emitted by backends and the decision loop.
//!
//! Metrics are delivered as records to an [`Observer`] instance wired in by
//! the host, rather than through process-wide statics: the host decides
//! whether they end up in `tracing`, a metrics registry, or nowhere.

use std::time::Duration;

/// Scan direction of a read operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::Forward => "forward",
            Direction::Backward => "backward",
        }
    }
}

/// Measurement for a single page read from a stream.
#[derive(Debug, Clone)]
pub struct SliceMetric<'a> {
    pub stream: &'a str,
    pub elapsed: Duration,
    pub bytes: usize,
    pub count: usize,
    pub direction: Direction,
}

/// Roll-up measurement covering all the pages of one load operation.
#[derive(Debug, Clone)]
pub struct BatchMetric<'a> {
    pub stream: &'a str,
    pub elapsed: Duration,
    pub bytes: usize,
    pub count: usize,
    pub batches: u32,
    pub direction: Direction,
}

/// Measurement for one append attempt, successful or conflicting.
#[derive(Debug, Clone)]
pub struct WriteMetric<'a> {
    pub stream: &'a str,
    pub elapsed: Duration,
    pub bytes: usize,
    pub count: usize,
}

/// Measurement for one conflict-driven reload inside the decision loop.
#[derive(Debug, Clone)]
pub struct ResyncMetric<'a> {
    pub stream: &'a str,
    pub elapsed: Duration,
    pub attempt: u32,
}

/// Receiver for the structured metrics emitted by a
/// [Backend][crate::store::Backend] and by the
/// [Decider][crate::decider::Decider] retry loop.
///
/// All methods default to doing nothing, so implementations only override
/// the signals they care about.
pub trait Observer: Send + Sync {
    fn slice_read(&self, _metric: &SliceMetric<'_>) {}

    fn batch_rollup(&self, _metric: &BatchMetric<'_>) {}

    fn write_success(&self, _metric: &WriteMetric<'_>) {}

    fn write_conflict(&self, _metric: &WriteMetric<'_>) {}

    fn resync(&self, _metric: &ResyncMetric<'_>) {}
}

/// Observer that discards every metric.
#[derive(Debug, Clone, Copy, Default)]
pub struct Noop;

impl Observer for Noop {}

/// Observer that emits every metric as a `tracing` event at debug level.
#[derive(Debug, Clone, Copy, Default)]
pub struct Tracing;

impl Observer for Tracing {
    fn slice_read(&self, metric: &SliceMetric<'_>) {
        tracing::debug!(
            stream = metric.stream,
            elapsed_ms = metric.elapsed.as_millis() as u64,
            bytes = metric.bytes,
            count = metric.count,
            direction = metric.direction.as_str(),
            "read slice"
        );
    }

    fn batch_rollup(&self, metric: &BatchMetric<'_>) {
        tracing::debug!(
            stream = metric.stream,
            elapsed_ms = metric.elapsed.as_millis() as u64,
            bytes = metric.bytes,
            count = metric.count,
            batches = metric.batches,
            direction = metric.direction.as_str(),
            "read batches"
        );
    }

    fn write_success(&self, metric: &WriteMetric<'_>) {
        tracing::debug!(
            stream = metric.stream,
            elapsed_ms = metric.elapsed.as_millis() as u64,
            bytes = metric.bytes,
            count = metric.count,
            "write success"
        );
    }

    fn write_conflict(&self, metric: &WriteMetric<'_>) {
        tracing::debug!(
            stream = metric.stream,
            elapsed_ms = metric.elapsed.as_millis() as u64,
            bytes = metric.bytes,
            count = metric.count,
            "write conflict"
        );
    }

    fn resync(&self, metric: &ResyncMetric<'_>) {
        tracing::debug!(
            stream = metric.stream,
            elapsed_ms = metric.elapsed.as_millis() as u64,
            attempt = metric.attempt,
            "resync"
        );
    }
}
