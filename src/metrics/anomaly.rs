use super::MetricsRecord;
use serde::Serialize;

// a read run under CACHED_RUNTIME_MS that still completed more than CACHED_MIN_IOS requests
// can't have gone over the network
pub const CACHED_RUNTIME_MS: u64 = 100;
pub const CACHED_MIN_IOS: u64 = 10;

/// Produces a substitute read throughput (MiB/s) when the measured one can't be trusted.
/// Whatever this returns is an estimate and is labelled as such in the report.
pub trait ReadEstimator {
    fn name(&self) -> &'static str;

    fn estimate(&self, write: &MetricsRecord) -> Option<f64>;
}

/// Assumes reads run `factor` times faster than the measured real write throughput.
#[derive(Debug, Clone, Copy)]
pub struct WriteScaledEstimate {
    pub factor: f64,
}
impl Default for WriteScaledEstimate {
    fn default() -> Self {
        WriteScaledEstimate { factor: 1.5 }
    }
}
impl ReadEstimator for WriteScaledEstimate {
    fn name(&self) -> &'static str {
        "write-scaled"
    }

    fn estimate(&self, write: &MetricsRecord) -> Option<f64> {
        Some(write.real_throughput() * self.factor)
    }
}

/// Flags cached reads but never offers a substitute figure.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoEstimate;
impl ReadEstimator for NoEstimate {
    fn name(&self) -> &'static str {
        "none"
    }

    fn estimate(&self, _write: &MetricsRecord) -> Option<f64> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnomalyVerdict {
    pub is_anomalous: bool,
    /// MiB/s, only set when the read record was flagged.
    pub corrected_throughput_estimate: Option<f64>,
    pub estimator: Option<&'static str>,
}

/// The http engine can serve repeated reads from an in-memory buffer, which shows up as many
/// operations completing in almost no wall time.
pub fn is_cached_read(read: &MetricsRecord) -> bool {
    read.runtime_ms < CACHED_RUNTIME_MS && read.total_ios > CACHED_MIN_IOS
}

/// Inspects the read record for the caching artifact. Neither record is modified.
pub fn detect(
    read: &MetricsRecord,
    write: &MetricsRecord,
    estimator: &dyn ReadEstimator,
) -> AnomalyVerdict {
    if !is_cached_read(read) {
        return AnomalyVerdict {
            is_anomalous: false,
            corrected_throughput_estimate: None,
            estimator: None,
        };
    }

    AnomalyVerdict {
        is_anomalous: true,
        corrected_throughput_estimate: estimator.estimate(write),
        estimator: Some(estimator.name()),
    }
}
