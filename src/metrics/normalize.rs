use super::MetricsRecord;
use crate::{descriptor::WorkloadRole, errors::BenchError};
use serde_json::Value;
use tracing::{debug, trace};

const KIB_PER_MIB: f64 = 1024.0;
const NS_PER_MS: f64 = 1_000_000.0;

// fio keys its completion latency percentiles by formatted float strings
const P95_KEY: &str = "95.000000";
const P99_KEY: &str = "99.000000";

/// Raw per-job figures, still in fio's units (KiB/s and nanoseconds).
#[derive(Debug, Default, Clone, Copy, PartialEq)]
struct JobSample {
    bw_kib: f64,
    iops: f64,
    total_ios: u64,
    io_bytes: u64,
    runtime_ms: u64,
    p95_ns: f64,
    p99_ns: f64,
}
impl JobSample {
    fn from_operation(op: &Value) -> Self {
        let percentiles = op
            .get("clat_ns")
            .and_then(|clat| clat.get("percentile"));

        JobSample {
            bw_kib: float(Some(op), "bw"),
            iops: float(Some(op), "iops"),
            total_ios: unsigned(op, "total_ios"),
            io_bytes: unsigned(op, "io_bytes"),
            runtime_ms: unsigned(op, "runtime"),
            p95_ns: float(percentiles, P95_KEY),
            p99_ns: float(percentiles, P99_KEY),
        }
    }

    fn merge(self, other: JobSample) -> JobSample {
        JobSample {
            bw_kib: self.bw_kib + other.bw_kib,
            iops: self.iops + other.iops,
            total_ios: self.total_ios.saturating_add(other.total_ios),
            io_bytes: self.io_bytes.saturating_add(other.io_bytes),
            runtime_ms: self.runtime_ms.max(other.runtime_ms),
            p95_ns: self.p95_ns.max(other.p95_ns),
            p99_ns: self.p99_ns.max(other.p99_ns),
        }
    }

    fn into_record(self) -> MetricsRecord {
        MetricsRecord {
            throughput_mibs: self.bw_kib / KIB_PER_MIB,
            iops: self.iops,
            latency_p95_ms: self.p95_ns / NS_PER_MS,
            latency_p99_ms: self.p99_ns / NS_PER_MS,
            total_ios: self.total_ios,
            io_bytes: self.io_bytes,
            runtime_ms: self.runtime_ms,
        }
    }
}

fn float(obj: Option<&Value>, key: &str) -> f64 {
    obj.and_then(|obj| obj.get(key))
        .and_then(Value::as_f64)
        .filter(|val| val.is_finite())
        .unwrap_or(0_f64)
        .max(0_f64)
}

fn unsigned(obj: &Value, key: &str) -> u64 {
    match obj.get(key) {
        Some(val) => val
            .as_u64()
            .or_else(|| val.as_f64().filter(|f| f.is_finite() && *f > 0.0).map(|f| f as u64))
            .unwrap_or(0),
        None => 0,
    }
}

fn non_empty(val: Option<&Value>) -> Option<&Value> {
    val.filter(|val| match val {
        Value::Object(map) => !map.is_empty(),
        Value::Null => false,
        _ => true,
    })
}

/// Picks the section for `expected` from one fio job, falling back to the opposite operation
/// when the expected one is missing or empty.
fn select_operation(job: &Value, expected: WorkloadRole) -> Option<&Value> {
    non_empty(job.get(expected.fio_key())).or_else(|| {
        trace!(
            "job has no {} section, using {}",
            expected.fio_key(),
            expected.opposite().fio_key()
        );
        non_empty(job.get(expected.opposite().fio_key()))
    })
}

/// Parses fio's JSON output into a single record for the expected operation.
///
/// Bandwidth, IOPS, operations and bytes are summed across jobs. Runtime and the p95/p99
/// completion latencies take the maximum, so the record reflects the slowest job.
///
/// # Arguments
///
/// * `raw_output` - fio's standard output (`--output-format=json`).
/// * `expected` - The operation whose statistics should be read.
///
/// # Returns
///
/// The normalised record, or a parse error if `raw_output` is not valid JSON.
pub fn normalize(raw_output: &str, expected: WorkloadRole) -> anyhow::Result<MetricsRecord> {
    let doc: Value = serde_json::from_str(raw_output)
        .map_err(|e| BenchError::parse(&format!("JSON from {}", expected), e, raw_output))?;

    let jobs = doc
        .get("jobs")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    debug!("normalizing {} fio jobs for {}", jobs.len(), expected);

    let sample = jobs
        .iter()
        .filter_map(|job| select_operation(job, expected))
        .map(JobSample::from_operation)
        .fold(JobSample::default(), JobSample::merge);

    Ok(sample.into_record())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job(op: &str, bw: f64, runtime: u64, p95: f64, p99: f64) -> Value {
        let stats = json!({
            "io_bytes": 1024 * 1024,
            "bw": bw,
            "iops": 2.0,
            "runtime": runtime,
            "total_ios": 4,
            "clat_ns": {
                "percentile": { "95.000000": p95, "99.000000": p99 }
            }
        });

        let mut job = serde_json::Map::new();
        job.insert("jobname".to_string(), json!(format!("{op}-job")));
        job.insert(op.to_string(), stats);
        Value::Object(job)
    }

    #[test]
    fn sums_throughput_and_keeps_slowest_job() -> anyhow::Result<()> {
        let doc = json!({
            "jobs": [
                job("write", 1024.0, 50, 1_000_000.0, 2_000_000.0),
                job("write", 2048.0, 120, 3_000_000.0, 4_000_000.0),
                job("write", 1024.0, 30, 2_000_000.0, 8_000_000.0),
            ]
        });

        let record = normalize(&doc.to_string(), WorkloadRole::Write)?;
        assert_eq!(record.runtime_ms, 120);
        assert_eq!(record.throughput_mibs, 4.0);
        assert_eq!(record.iops, 6.0);
        assert_eq!(record.total_ios, 12);
        assert_eq!(record.io_bytes, 3 * 1024 * 1024);
        assert_eq!(record.latency_p95_ms, 3.0);
        assert_eq!(record.latency_p99_ms, 8.0);
        Ok(())
    }

    #[test]
    fn converts_units() -> anyhow::Result<()> {
        let doc = json!({ "jobs": [job("read", 10240.0, 1000, 5_000_000.0, 0.0)] });
        let record = normalize(&doc.to_string(), WorkloadRole::Read)?;
        assert_eq!(record.throughput_mibs, 10.0);
        assert_eq!(record.latency_p95_ms, 5.0);
        Ok(())
    }

    #[test]
    fn falls_back_to_other_operation() -> anyhow::Result<()> {
        let doc = json!({
            "jobs": [{
                "jobname": "read-job-0",
                "read": {},
                "write": { "bw": 2048, "runtime": 10, "total_ios": 3 }
            }]
        });
        let record = normalize(&doc.to_string(), WorkloadRole::Read)?;
        assert_eq!(record.throughput_mibs, 2.0);
        assert_eq!(record.total_ios, 3);
        Ok(())
    }

    #[test]
    fn prefers_expected_operation_when_both_present() -> anyhow::Result<()> {
        let doc = json!({
            "jobs": [{
                "read": { "bw": 1024, "total_ios": 1 },
                "write": { "bw": 4096, "total_ios": 9 }
            }]
        });
        let record = normalize(&doc.to_string(), WorkloadRole::Read)?;
        assert_eq!(record.throughput_mibs, 1.0);
        assert_eq!(record.total_ios, 1);
        Ok(())
    }

    #[test]
    fn missing_fields_default_to_zero() -> anyhow::Result<()> {
        let record = normalize(r#"{"fio version": "fio-3.36"}"#, WorkloadRole::Write)?;
        assert_eq!(record, MetricsRecord::default());

        let doc = json!({ "jobs": [{ "write": { "bw": 1024, "iops": null, "runtime": -5 } }] });
        let record = normalize(&doc.to_string(), WorkloadRole::Write)?;
        assert_eq!(record.throughput_mibs, 1.0);
        assert_eq!(record.iops, 0.0);
        assert_eq!(record.runtime_ms, 0);
        assert_eq!(record.latency_p99_ms, 0.0);
        Ok(())
    }

    #[test]
    fn huge_counters_saturate() -> anyhow::Result<()> {
        let raw = r#"{"jobs":[{"write":{"io_bytes":18446744073709551615,"total_ios":3}},{"write":{"io_bytes":1,"total_ios":18446744073709551615}}]}"#;
        let record = normalize(raw, WorkloadRole::Write)?;
        assert_eq!(record.io_bytes, u64::MAX);
        assert_eq!(record.total_ios, u64::MAX);
        Ok(())
    }

    #[test]
    fn malformed_output_is_a_parse_error() {
        let err = normalize("fio: engine http not loadable", WorkloadRole::Read)
            .expect_err("should not parse");
        match err.downcast_ref::<BenchError>() {
            Some(BenchError::Parse { excerpt, .. }) => {
                assert!(excerpt.contains("engine http"))
            }
            other => panic!("expected parse error, got {:?}", other),
        }
    }

    #[test]
    fn normalizing_is_repeatable() -> anyhow::Result<()> {
        let raw = std::fs::read_to_string("./fixtures/fio_write.json")?;
        let first = normalize(&raw, WorkloadRole::Write)?;
        let second = normalize(&raw, WorkloadRole::Write)?;
        assert_eq!(first, second);
        Ok(())
    }
}
