// Upstream telemetry buffers.
// Both buffers are filled synchronously on the request path and drained by
// their own timers. Metrics are dropped on a failed flush; token usage is
// merged back and resent.
pub mod metrics;
pub mod usage;

pub use self::metrics::{
    ClientMetricsBucket, FlushSummary, MetricsAggregator, ServerMetricEntry, ToggleCounts,
    UnknownFlagReport,
};
pub use usage::{UsageStats, UsageTracker};
