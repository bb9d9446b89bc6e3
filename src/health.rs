//! Downstream service health, reported on the gateway's own health route.

use serde::Serialize;

/// Reachability of one downstream engine as seen by its last probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceHealth {
    Ok,
    Degraded,
    Down,
}

/// Aggregate health payload for `GET /health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: ServiceHealth,
    pub stt: ServiceHealth,
    pub tts: ServiceHealth,
    pub llm: ServiceHealth,
    pub metrics: crate::metrics::MetricsSnapshot,
}

impl HealthReport {
    /// Gateway status is the worst downstream status: a down engine means
    /// turns will degrade even though the process itself is live.
    pub fn aggregate(
        stt: ServiceHealth,
        tts: ServiceHealth,
        llm: ServiceHealth,
        metrics: crate::metrics::MetricsSnapshot,
    ) -> Self {
        let status = [stt, tts, llm]
            .into_iter()
            .max_by_key(|s| match s {
                ServiceHealth::Ok => 0,
                ServiceHealth::Degraded => 1,
                ServiceHealth::Down => 2,
            })
            .unwrap_or(ServiceHealth::Ok);
        Self {
            status,
            stt,
            tts,
            llm,
            metrics,
        }
    }
}
