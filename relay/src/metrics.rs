//! Runtime metrics snapshot for `/api/metrics`.

use serde::Serialize;

use crate::queue::QueueMetricsSnapshot;
use crate::tools::ToolMetricsSnapshot;

/// Admission-layer gauges.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct AdmissionMetrics {
    pub active_streams: usize,
    pub queued_waiters: usize,
}

/// One point-in-time view of the gateway's runtime state.
#[derive(Clone, Debug, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub admission: AdmissionMetrics,
    pub llm_queue: QueueMetricsSnapshot,
    pub tools: Vec<ToolMetricsSnapshot>,
    /// Adaptive writer character↔chunk transitions since boot.
    pub sse_mode_switches: u64,
}
