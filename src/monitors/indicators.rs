use std::time::Instant;

use chrono::{DateTime, Utc};
use sysinfo::{Networks, System};
use tracing::trace;

use super::reachability::ProbeResult;
use crate::storage::schema::IndicatorSnapshot;
use crate::util::round2;

/// Host load at the end of a sweep
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceUsage {
    pub cpu_pct: f64,
    pub tx_bytes_per_sec: f64,
}

pub trait SystemTelemetry: Send + Sync {
    fn sample(&mut self) -> ResourceUsage;
}

/// Telemetry read from the host through `sysinfo`.
///
/// CPU usage and transmit rate are both deltas, so the first sample after
/// construction only reflects the time since `new`.
pub struct SysinfoTelemetry {
    system: System,
    networks: Networks,
    last_sample: Instant,
}

impl SysinfoTelemetry {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();

        Self {
            system,
            networks: Networks::new_with_refreshed_list(),
            last_sample: Instant::now(),
        }
    }
}

impl Default for SysinfoTelemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemTelemetry for SysinfoTelemetry {
    fn sample(&mut self) -> ResourceUsage {
        self.system.refresh_cpu_usage();
        self.networks.refresh(true);

        let elapsed = self.last_sample.elapsed().as_secs_f64();
        self.last_sample = Instant::now();

        let transmitted: u64 = self
            .networks
            .list()
            .values()
            .map(|data| data.transmitted())
            .sum();

        let usage = ResourceUsage {
            cpu_pct: self.system.global_cpu_usage() as f64,
            tx_bytes_per_sec: if elapsed > 0.0 {
                transmitted as f64 / elapsed
            } else {
                0.0
            },
        };
        trace!(?usage, "sampled host telemetry");
        usage
    }
}

/// Running totals over the probes of one sweep
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndicatorAccumulator {
    total: usize,
    alive: usize,
    latency_sum_ms: f64,
    loss_sum_pct: f64,
}

impl IndicatorAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, probe: &ProbeResult) {
        self.total += 1;
        self.loss_sum_pct += probe.packet_loss_pct;
        if probe.alive {
            self.alive += 1;
            // a reply without a measured round trip counts as 0 ms
            self.latency_sum_ms += probe.round_trip_ms.unwrap_or(0.0);
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn alive(&self) -> usize {
        self.alive
    }

    pub fn finish(
        &self,
        usage: ResourceUsage,
        max_bandwidth_bytes_per_sec: u64,
        at: DateTime<Utc>,
    ) -> IndicatorSnapshot {
        let ratio = |numerator: f64, denominator: usize| {
            if denominator == 0 {
                0.0
            } else {
                numerator / denominator as f64
            }
        };

        let bandwidth_util = if max_bandwidth_bytes_per_sec == 0 {
            0.0
        } else {
            (usage.tx_bytes_per_sec / max_bandwidth_bytes_per_sec as f64 * 100.0).min(100.0)
        };

        IndicatorSnapshot {
            comm_rate: round2(ratio(self.alive as f64 * 100.0, self.total)),
            avg_delay_ms: ratio(self.latency_sum_ms, self.alive).round() as i64,
            avg_loss: round2(ratio(self.loss_sum_pct, self.total)),
            bandwidth_util: round2(bandwidth_util),
            cpu_util: round2(usage.cpu_pct),
            timestamp: at,
        }
    }
}
