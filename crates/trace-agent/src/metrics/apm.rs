// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process resource metrics: memory, CPU load, garbage collection and event loop lag.
//!
//! GC pauses and lag samples are pushed by the runtime introspection layer and
//! accumulate until the next flush. Memory and CPU figures are point-in-time
//! reads taken from a [`RuntimeProbe`] when the snapshot is built.

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};

use crate::collector::{CollectorApi, CollectorError};
use crate::metrics::MetricsSource;

const BYTES_TO_MEGABYTES: u64 = 1024 * 1024;

/// Collection class of a garbage collection pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcKind {
    /// Young generation collection (scavenge).
    Minor,
    /// Full collection (mark-sweep).
    Major,
    /// Both generations collected in the same pause.
    Mixed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryUsage {
    pub used_bytes: u64,
    pub total_bytes: u64,
    pub rss_bytes: u64,
}

/// Point-in-time process readings, taken at flush.
pub trait RuntimeProbe: Send + Sync {
    fn memory(&self) -> MemoryUsage;
    /// One minute load average.
    fn load_average(&self) -> f64;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GcStats {
    /// Total pause time in nanoseconds.
    pub time: u64,
    pub scavenge: u64,
    pub marksweep: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LagStats {
    pub min: u64,
    pub max: u64,
    pub sum: u64,
    pub num: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EventLoopStats {
    pub stats: LagStats,
    pub requests: u64,
    pub handlers: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemorySnapshot {
    pub used: u64,
    pub total: u64,
    pub rss: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CpuSnapshot {
    pub utilization: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApmSnapshot {
    pub timestamp: String,
    pub memory: MemorySnapshot,
    pub cpu: CpuSnapshot,
    pub gc: GcStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eventloop: Option<EventLoopStats>,
}

#[derive(Debug, Default)]
struct ApmCounters {
    gc: GcStats,
    lag: Option<LagStats>,
    active_requests: u64,
    active_handles: u64,
}

pub struct ApmMetrics {
    probe: Arc<dyn RuntimeProbe>,
    counters: Mutex<ApmCounters>,
}

impl ApmMetrics {
    pub fn new(probe: Arc<dyn RuntimeProbe>) -> Self {
        ApmMetrics {
            probe,
            counters: Mutex::new(ApmCounters::default()),
        }
    }

    pub fn record_gc(&self, pause_ns: u64, kind: GcKind) {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        counters.gc.time = counters.gc.time.saturating_add(pause_ns);
        match kind {
            GcKind::Minor => counters.gc.scavenge += 1,
            GcKind::Major => counters.gc.marksweep += 1,
            GcKind::Mixed => {
                counters.gc.scavenge += 1;
                counters.gc.marksweep += 1;
            }
        }
    }

    pub fn record_event_loop_lag(&self, lag_ms: u64) {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        counters.lag = Some(match counters.lag {
            None => LagStats {
                min: lag_ms,
                max: lag_ms,
                sum: lag_ms,
                num: 1,
            },
            Some(stats) => LagStats {
                min: stats.min.min(lag_ms),
                max: stats.max.max(lag_ms),
                sum: stats.sum.saturating_add(lag_ms),
                num: stats.num + 1,
            },
        });
    }

    pub fn set_active_counts(&self, requests: u64, handles: u64) {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        counters.active_requests = requests;
        counters.active_handles = handles;
    }

    /// Builds the window's snapshot and zeroes the GC and lag accumulators.
    pub fn snapshot(&self) -> ApmSnapshot {
        let (gc, lag, requests, handlers) = {
            let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
            (
                std::mem::take(&mut counters.gc),
                counters.lag.take(),
                counters.active_requests,
                counters.active_handles,
            )
        };

        let memory = self.probe.memory();

        ApmSnapshot {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            memory: MemorySnapshot {
                used: memory.used_bytes / BYTES_TO_MEGABYTES,
                total: memory.total_bytes / BYTES_TO_MEGABYTES,
                rss: memory.rss_bytes / BYTES_TO_MEGABYTES,
            },
            cpu: CpuSnapshot {
                utilization: self.probe.load_average().max(0.0).floor() as u64,
            },
            gc,
            eventloop: lag.map(|stats| EventLoopStats {
                stats,
                requests,
                handlers,
            }),
        }
    }
}

#[async_trait]
impl MetricsSource for ApmMetrics {
    fn name(&self) -> &'static str {
        "APM"
    }

    async fn flush_to(&self, api: &CollectorApi) -> Result<(), CollectorError> {
        let snapshot = self.snapshot();
        api.send_apm_metrics(&snapshot).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProbe;

    impl RuntimeProbe for FixedProbe {
        fn memory(&self) -> MemoryUsage {
            MemoryUsage {
                used_bytes: 5 * BYTES_TO_MEGABYTES + 10,
                total_bytes: 8 * BYTES_TO_MEGABYTES,
                rss_bytes: 30 * BYTES_TO_MEGABYTES - 1,
            }
        }

        fn load_average(&self) -> f64 {
            1.87
        }
    }

    fn apm() -> ApmMetrics {
        ApmMetrics::new(Arc::new(FixedProbe))
    }

    #[test]
    fn test_snapshot_reads_probe() {
        let snapshot = apm().snapshot();
        assert_eq!(
            snapshot.memory,
            MemorySnapshot {
                used: 5,
                total: 8,
                rss: 29
            }
        );
        assert_eq!(snapshot.cpu.utilization, 1);
        assert_eq!(snapshot.gc, GcStats::default());
        assert!(snapshot.eventloop.is_none());
    }

    #[test]
    fn test_gc_counters_by_kind_and_reset() {
        let apm = apm();
        apm.record_gc(100, GcKind::Minor);
        apm.record_gc(200, GcKind::Major);
        apm.record_gc(300, GcKind::Mixed);

        let snapshot = apm.snapshot();
        assert_eq!(
            snapshot.gc,
            GcStats {
                time: 600,
                scavenge: 2,
                marksweep: 2
            }
        );

        assert_eq!(apm.snapshot().gc, GcStats::default());
    }

    #[test]
    fn test_event_loop_stats_only_when_sampled() {
        let apm = apm();
        apm.set_active_counts(4, 7);
        apm.record_event_loop_lag(3);
        apm.record_event_loop_lag(1);
        apm.record_event_loop_lag(9);

        let value = serde_json::to_value(apm.snapshot()).unwrap();
        assert_eq!(
            value["eventloop"],
            serde_json::json!({
                "stats": { "min": 1, "max": 9, "sum": 13, "num": 3 },
                "requests": 4,
                "handlers": 7
            })
        );

        let value = serde_json::to_value(apm.snapshot()).unwrap();
        assert!(value.get("eventloop").is_none());
    }
}
