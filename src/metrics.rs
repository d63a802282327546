pub mod anomaly;
pub mod normalize;

use serde::{Deserialize, Serialize};

pub const BYTES_PER_MIB: f64 = 1024.0 * 1024.0;

/// Unit-normalised result of one workload. Throughput is MiB/s, latencies are milliseconds and
/// absent source fields are zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsRecord {
    pub throughput_mibs: f64,
    pub iops: f64,
    pub latency_p95_ms: f64,
    pub latency_p99_ms: f64,
    pub total_ios: u64,
    pub io_bytes: u64,
    pub runtime_ms: u64,
}
impl MetricsRecord {
    /// Throughput derived from bytes actually moved and wall time, independent of the bandwidth
    /// fio reports. Zero when no runtime was recorded.
    pub fn real_throughput(&self) -> f64 {
        if self.runtime_ms == 0 {
            return 0_f64;
        }
        self.io_mib() / (self.runtime_ms as f64 / 1000_f64)
    }

    pub fn io_mib(&self) -> f64 {
        self.io_bytes as f64 / BYTES_PER_MIB
    }

    /// Combines two records: throughput, IOPS, operations and bytes add up, runtime and latency
    /// percentiles keep the worst value.
    pub fn combined_with(&self, other: &MetricsRecord) -> MetricsRecord {
        MetricsRecord {
            throughput_mibs: self.throughput_mibs + other.throughput_mibs,
            iops: self.iops + other.iops,
            latency_p95_ms: self.latency_p95_ms.max(other.latency_p95_ms),
            latency_p99_ms: self.latency_p99_ms.max(other.latency_p99_ms),
            total_ios: self.total_ios.saturating_add(other.total_ios),
            io_bytes: self.io_bytes.saturating_add(other.io_bytes),
            runtime_ms: self.runtime_ms.max(other.runtime_ms),
        }
    }
}
