use crate::{
    artifacts::OutputDir,
    config::Config,
    descriptor::WorkloadRole,
    metrics::{anomaly::AnomalyVerdict, MetricsRecord, BYTES_PER_MIB},
    network::{BaselineOutcome, NetworkBaseline},
};
use anyhow::Context;
use colored::*;
use serde::Serialize;
use std::path::PathBuf;
use term_table::{row, row::Row, table_cell::*, Table, TableStyle};

/// Identity of a run, printed in the report header.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunInfo {
    pub run_id: String,
    pub environment: String,
    pub endpoint: String,
    pub bucket: String,
    pub block_size: String,
    pub write_jobs: u32,
    pub read_jobs: u32,
}
impl RunInfo {
    pub fn new(config: &Config) -> Self {
        RunInfo {
            run_id: nanoid::nanoid!(5),
            environment: config.environment_label().to_string(),
            endpoint: config.s3.endpoint.clone(),
            bucket: config.s3.bucket.clone(),
            block_size: config.fio.object_size.clone(),
            write_jobs: config.fio.write_jobs,
            read_jobs: config.fio.read_jobs,
        }
    }
}

/// The network part of the report. Anything but `Measured` is shown as not measured, with the
/// reason.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NetworkStatus {
    Disabled,
    Unavailable,
    Failed,
    Measured(NetworkSection),
}
impl NetworkStatus {
    pub fn section(&self) -> Option<&NetworkSection> {
        match self {
            NetworkStatus::Measured(section) => Some(section),
            _ => None,
        }
    }

    fn reason(&self) -> &'static str {
        match self {
            NetworkStatus::Disabled => "disabled",
            NetworkStatus::Unavailable => "iperf3 unavailable",
            NetworkStatus::Failed => "probe failed",
            NetworkStatus::Measured(_) => "measured",
        }
    }

    /// Renders the network baseline block, or a line saying why there is none.
    pub fn render(&self) -> String {
        match self {
            NetworkStatus::Measured(net) => format!(
                "{}\n{}",
                "[Network Baseline - iperf3]".green(),
                table(vec![
                    kv(
                        "Bandwidth (send)",
                        format!("{:.2} Mbps ({:.1} MB/s)", net.sent_mbps, net.sent_mbs)
                    ),
                    kv(
                        "Bandwidth (receive)",
                        format!("{:.2} Mbps ({:.1} MB/s)", net.received_mbps, net.received_mbs)
                    ),
                    kv("Test duration", format!("{}s", net.duration_secs)),
                    kv("Data transferred", format!("{:.1} MB", net.transferred_mib)),
                ])
            ),
            status => format!("[Network Baseline] not measured ({})", status.reason())
                .yellow()
                .to_string(),
        }
    }
}
impl From<&BaselineOutcome> for NetworkStatus {
    fn from(outcome: &BaselineOutcome) -> Self {
        match outcome {
            BaselineOutcome::Disabled => NetworkStatus::Disabled,
            BaselineOutcome::Unavailable => NetworkStatus::Unavailable,
            BaselineOutcome::Failed => NetworkStatus::Failed,
            BaselineOutcome::Measured(baseline) => {
                NetworkStatus::Measured(NetworkSection::new(baseline))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkSection {
    pub sent_mbps: f64,
    pub received_mbps: f64,
    /// Megabytes per second, i.e. megabits divided by 8.
    pub sent_mbs: f64,
    pub received_mbs: f64,
    pub duration_secs: u64,
    pub transferred_mib: f64,
}
impl NetworkSection {
    fn new(baseline: &NetworkBaseline) -> Self {
        NetworkSection {
            sent_mbps: baseline.sent_mbps,
            received_mbps: baseline.received_mbps,
            sent_mbs: baseline.sent_mbps / 8_f64,
            received_mbs: baseline.received_mbps / 8_f64,
            duration_secs: baseline.duration_secs,
            transferred_mib: baseline.sent_bytes as f64 / BYTES_PER_MIB,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoleSection {
    pub role: WorkloadRole,
    pub requests: u64,
    pub transferred_mib: f64,
    pub runtime_ms: u64,
    /// Bytes moved over wall time.
    pub real_throughput_mibs: f64,
    /// Bandwidth as reported by fio, kept for cross-checking.
    pub reported_throughput_mibs: f64,
    pub iops: f64,
    pub latency_p95_ms: f64,
    pub latency_p99_ms: f64,
    pub cached: bool,
    pub estimated_throughput_mibs: Option<f64>,
    pub estimator: Option<&'static str>,
}
impl RoleSection {
    fn new(role: WorkloadRole, record: &MetricsRecord) -> Self {
        RoleSection {
            role,
            requests: record.total_ios,
            transferred_mib: record.io_mib(),
            runtime_ms: record.runtime_ms,
            real_throughput_mibs: record.real_throughput(),
            reported_throughput_mibs: record.throughput_mibs,
            iops: record.iops,
            latency_p95_ms: record.latency_p95_ms,
            latency_p99_ms: record.latency_p99_ms,
            cached: false,
            estimated_throughput_mibs: None,
            estimator: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummarySection {
    pub network_capacity_mbs: Option<f64>,
    /// Real write throughput as a percentage of network capacity.
    pub s3_efficiency_pct: Option<f64>,
    pub total_requests: u64,
    pub total_mib: f64,
    pub total_iops: f64,
    pub write_throughput_mibs: f64,
    /// `None` when the read result was served from cache.
    pub read_throughput_mibs: Option<f64>,
    pub worst_latency_p95_ms: f64,
    pub worst_latency_p99_ms: f64,
}

/// The reconciled result of one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    #[serde(flatten)]
    pub info: RunInfo,
    pub network: NetworkStatus,
    pub write: RoleSection,
    pub read: RoleSection,
    pub summary: SummarySection,
}

/// Merges the network baseline and both workload records into one report. The records are only
/// borrowed, the anomaly verdict decides how the read section is presented.
///
/// # Arguments
///
/// * `info` - Run identity for the header.
/// * `write` - Normalised write record.
/// * `read` - Normalised read record.
/// * `verdict` - Cache anomaly verdict for the read record.
/// * `network` - Outcome of the network baseline, measured or not.
pub fn compose(
    info: RunInfo,
    write: &MetricsRecord,
    read: &MetricsRecord,
    verdict: &AnomalyVerdict,
    network: &BaselineOutcome,
) -> Report {
    let write_section = RoleSection::new(WorkloadRole::Write, write);
    let read_section = RoleSection {
        cached: verdict.is_anomalous,
        estimated_throughput_mibs: verdict.corrected_throughput_estimate,
        estimator: verdict.estimator,
        ..RoleSection::new(WorkloadRole::Read, read)
    };

    let network_status = NetworkStatus::from(network);

    let capacity = network_status.section().map(|net| net.sent_mbs);
    let efficiency = capacity.map(|capacity| {
        if capacity > 0_f64 {
            write_section.real_throughput_mibs / capacity * 100_f64
        } else {
            0_f64
        }
    });

    let both = write.combined_with(read);
    let summary = SummarySection {
        network_capacity_mbs: capacity,
        s3_efficiency_pct: efficiency,
        total_requests: both.total_ios,
        total_mib: both.io_mib(),
        total_iops: both.iops,
        write_throughput_mibs: write_section.real_throughput_mibs,
        read_throughput_mibs: (!read_section.cached).then_some(read_section.real_throughput_mibs),
        worst_latency_p95_ms: both.latency_p95_ms,
        worst_latency_p99_ms: both.latency_p99_ms,
    };

    Report {
        info,
        network: network_status,
        write: write_section,
        read: read_section,
        summary,
    }
}

fn kv(key: &str, val: impl ToString) -> (String, String) {
    (key.to_string(), val.to_string())
}

fn table(pairs: Vec<(String, String)>) -> String {
    let rows = pairs
        .into_iter()
        .map(|(key, val)| row![TableCell::new(key), TableCell::new(val)])
        .collect::<Vec<_>>();

    Table::builder()
        .rows(rows)
        .style(TableStyle::rounded())
        .build()
        .render()
}

fn role_rows(section: &RoleSection, request_kind: &str) -> Vec<(String, String)> {
    let mut rows = vec![
        kv(&format!("HTTP {} requests", request_kind), section.requests),
        kv(
            "Data transferred",
            format!("{:.1} MB", section.transferred_mib),
        ),
        kv("Runtime", format!("{} ms", section.runtime_ms)),
    ];

    if section.cached {
        rows.push(kv(
            "Throughput",
            format!("{:.2} MB/s (FROM MEMORY CACHE)", section.real_throughput_mibs).red(),
        ));
        if let Some(estimate) = section.estimated_throughput_mibs {
            rows.push(kv(
                "Estimated real throughput",
                format!("~{:.0} MB/s (estimate)", estimate).yellow(),
            ));
        }
    } else {
        rows.push(kv(
            "Throughput",
            format!("{:.2} MB/s", section.real_throughput_mibs),
        ));
    }

    rows.push(kv("IOPS", format!("{:.2}", section.iops)));
    rows.push(kv("Latency P95", format!("{:.2} ms", section.latency_p95_ms)));
    rows.push(kv("Latency P99", format!("{:.2} ms", section.latency_p99_ms)));
    rows
}

impl Report {
    /// Renders the report for the terminal.
    pub fn render(&self) -> String {
        let mut out = vec![
            format!(
                "\n{}",
                " S3 Load Testing + Network Bandwidth Report ".reversed().green()
            ),
            table(vec![
                kv("Run", &self.info.run_id),
                kv("Environment", &self.info.environment),
                kv("Endpoint", &self.info.endpoint),
                kv("Bucket", &self.info.bucket),
                kv("Block Size", &self.info.block_size),
                kv(
                    "Jobs",
                    format!("write={}, read={}", self.info.write_jobs, self.info.read_jobs),
                ),
            ]),
            self.network.render(),
        ];

        out.push("[Profile A: write] Real S3 traffic".green().to_string());
        out.push(table(role_rows(&self.write, "PUT")));

        let read_heading = if self.read.cached {
            "[Profile B: read] CACHED - not real S3 traffic".yellow()
        } else {
            "[Profile B: read] Real S3 traffic".green()
        };
        out.push(read_heading.to_string());
        out.push(table(role_rows(&self.read, "GET")));

        let summary = &self.summary;
        let mut rows = vec![];
        match (summary.network_capacity_mbs, summary.s3_efficiency_pct) {
            (Some(capacity), Some(efficiency)) => {
                rows.push(kv("Network capacity", format!("{:.1} MB/s", capacity)));
                rows.push(kv(
                    "S3 write efficiency",
                    format!("{:.1}% of network capacity", efficiency),
                ));
            }
            _ => {
                let reason = format!("not measured ({})", self.network.reason());
                rows.push(kv("Network capacity", &reason));
                rows.push(kv("S3 write efficiency", "n/a"));
            }
        }
        rows.push(kv("Total HTTP requests", summary.total_requests));
        rows.push(kv("Total data", format!("{:.1} MB", summary.total_mib)));
        rows.push(kv("Total IOPS", format!("{:.2}", summary.total_iops)));
        rows.push(kv(
            "Write throughput",
            format!("{:.2} MB/s", summary.write_throughput_mibs),
        ));
        rows.push(kv(
            "Read throughput",
            match summary.read_throughput_mibs {
                Some(read) => format!("{:.2} MB/s", read),
                None => "CACHED (see note below)".to_string(),
            },
        ));
        rows.push(kv(
            "Latency P95 (worst)",
            format!("{:.2} ms", summary.worst_latency_p95_ms),
        ));
        rows.push(kv(
            "Latency P99 (worst)",
            format!("{:.2} ms", summary.worst_latency_p99_ms),
        ));

        out.push(format!("\n{}", " Summary ".reversed().green()));
        out.push(table(rows));

        if self.read.cached {
            out.push(
                "NOTE: fio HTTP engine caches read data in memory."
                    .yellow()
                    .to_string(),
            );
            out.push("Read throughput shows memory speed, not S3 speed.".to_string());
            out.push("Write results ARE accurate - each PUT is a real HTTP request.".to_string());
            out.push("\nFor accurate S3 read benchmarks, use:".to_string());
            out.push("  - minio/warp: https://github.com/minio/warp".to_string());
            out.push("  - s3-benchmark: https://github.com/wasabi-tech/s3-benchmark".to_string());
        }

        out.join("\n")
    }

    /// Writes the report as JSON next to the raw artifacts and returns its path.
    pub fn persist(&self, out_dir: &OutputDir) -> anyhow::Result<PathBuf> {
        let json = serde_json::to_string_pretty(self).context("Unable to serialize report")?;
        out_dir.persist_raw(&format!("report_{}", self.info.run_id), &json)
    }
}
