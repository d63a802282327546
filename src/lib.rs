pub mod artifacts;
pub mod clap_args;
pub mod config;
pub mod descriptor;
pub mod errors;
pub mod metrics;
pub mod network;
pub mod process_control;
pub mod provision;
pub mod report;
pub mod tooling;

use artifacts::OutputDir;
use colored::*;
use config::Config;
use descriptor::{WorkloadRole, OBJECTS_PER_WRITE_JOB, READ_OBJECT_COUNT};
use errors::BenchError;
use metrics::{
    anomaly::{self, WriteScaledEstimate},
    normalize::normalize,
    MetricsRecord,
};
use network::BaselineOutcome;
use provision::{ObjectStore, S3Client};
use report::{NetworkStatus, Report, RunInfo};
use std::path::PathBuf;
use tracing::info;

/// Normalised records of both workloads of one run.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Measurements {
    pub write: MetricsRecord,
    pub read: MetricsRecord,
}

/// Generates the write and read descriptors and writes them to the output directory.
///
/// # Returns
///
/// Role and job file path of both workloads, write first.
pub fn generate_descriptors(
    config: &Config,
    out_dir: &OutputDir,
) -> anyhow::Result<Vec<(WorkloadRole, PathBuf)>> {
    let write_objects = config
        .fio
        .write_jobs
        .checked_mul(OBJECTS_PER_WRITE_JOB)
        .ok_or_else(|| BenchError::Config("too many write jobs".to_string()))?;

    let write = descriptor::generate(
        WorkloadRole::Write,
        write_objects,
        &config.fio.object_size,
        config.fio.write_jobs,
        &config.s3,
    )?;
    let read = descriptor::generate(
        WorkloadRole::Read,
        READ_OBJECT_COUNT,
        &config.fio.object_size,
        config.fio.read_jobs,
        &config.s3,
    )?;

    let mut jobs = vec![];
    for desc in [write, read] {
        let path = desc.persist(out_dir)?;
        info!(
            "{} job file with {} sub-jobs at {}",
            desc.role,
            desc.sub_jobs.len(),
            path.display()
        );
        jobs.push((desc.role, path));
    }

    Ok(jobs)
}

/// Runs both workloads concurrently and normalises their output. Nothing is normalised unless
/// both workloads succeeded.
///
/// # Arguments
///
/// * `command` - The fio command.
/// * `jobs` - Role and job file of each workload.
/// * `out_dir` - Destination of the raw fio output.
pub async fn measure_workloads(
    command: &str,
    jobs: &[(WorkloadRole, PathBuf)],
    out_dir: &OutputDir,
) -> anyhow::Result<Measurements> {
    println!("\n{}", " Starting concurrent fio load tests ".reversed().green());

    let handles = process_control::launch(command, jobs)?;
    let outputs = process_control::await_all(handles, out_dir).await?;

    let mut measurements = Measurements::default();
    for output in outputs {
        let record = normalize(&output.stdout, output.role)?;
        match output.role {
            WorkloadRole::Write => measurements.write = record,
            WorkloadRole::Read => measurements.read = record,
        }
    }

    Ok(measurements)
}

/// Uses `store` to create the bucket if needed and upload the objects of the read workload.
pub async fn prepare_storage(store: &dyn ObjectStore, config: &Config) -> anyhow::Result<()> {
    provision::ensure_bucket_exists(store, &config.s3.bucket).await?;
    provision::prepare_read_objects(
        store,
        &config.s3.bucket,
        READ_OBJECT_COUNT,
        config.fio.object_size_bytes,
    )
    .await
}

/// Runs a complete benchmark.
///
/// Capability checks come first, then the bucket and read objects are provisioned, the optional
/// network baseline runs, and finally both workloads run concurrently. Any fatal error aborts
/// the run without a report. When fio has no S3 engine the network baseline still runs, if
/// enabled, before the capability error is returned.
///
/// # Arguments
///
/// * `config` - Fully resolved configuration.
/// * `run_network` - Whether to run the iperf3 baseline.
///
/// # Returns
///
/// The composed report, already persisted to the output directory.
pub async fn run(config: &Config, run_network: bool) -> anyhow::Result<Report> {
    println!("\n{}", " Setting up fiobench ".reversed().green());
    println!("Environment: {}", config.environment_label());
    println!("Endpoint: {}", config.s3.endpoint);
    println!("Bucket: {}", config.s3.bucket);
    println!("iperf3 enabled: {}", if run_network { "Yes" } else { "No" });

    let out_dir = OutputDir::new(&config.out_dir);

    let version = tooling::check_fio_available(&config.fio.command).await?;
    println!("Found fio: {}", version);
    let engine = match tooling::check_fio_s3_support(&config.fio.command).await {
        Ok(engine) => engine,
        Err(err) if run_network => {
            println!("\n{}", " Running network test only ".reversed().yellow());
            let outcome =
                network::run_baseline(&config.network, config.in_container, &out_dir).await;
            println!("{}", NetworkStatus::from(&outcome).render());
            return Err(err);
        }
        Err(err) => return Err(err),
    };
    info!("Using fio engine {:?}", engine);

    let store = S3Client::new(&config.s3)?;
    prepare_storage(&store, config).await?;

    let baseline = if run_network {
        network::run_baseline(&config.network, config.in_container, &out_dir).await
    } else {
        BaselineOutcome::Disabled
    };

    let jobs = generate_descriptors(config, &out_dir)?;
    let measurements = measure_workloads(&config.fio.command, &jobs, &out_dir).await?;

    let verdict = anomaly::detect(
        &measurements.read,
        &measurements.write,
        &WriteScaledEstimate::default(),
    );
    if verdict.is_anomalous {
        info!("read results look cached, reporting an estimate");
    }

    let report = report::compose(
        RunInfo::new(config),
        &measurements.write,
        &measurements.read,
        &verdict,
        &baseline,
    );
    let path = report.persist(&out_dir)?;
    info!("Report written to {}", path.display());

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(out_dir: &std::path::Path, vars: &[(&str, &str)]) -> anyhow::Result<Config> {
        let mut env: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        env.insert("OUT_DIR".to_string(), out_dir.to_string_lossy().to_string());
        Config::resolve(None, move |key| env.get(key).cloned(), false)
    }

    #[test]
    fn generates_both_job_files() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let cfg = config(tmp.path(), &[("FIO_NUMJOBS_A", "3")])?;
        let out = OutputDir::new(&cfg.out_dir);

        let jobs = generate_descriptors(&cfg, &out)?;
        let roles: Vec<_> = jobs.iter().map(|(role, _)| *role).collect();
        assert_eq!(roles, vec![WorkloadRole::Write, WorkloadRole::Read]);

        let write = std::fs::read_to_string(&jobs[0].1)?;
        assert_eq!(write.matches("nrfiles=100").count(), 3);
        let read = std::fs::read_to_string(&jobs[1].1)?;
        assert!(read.contains("filename=/fio-bench/r/o0000:"));
        assert!(read.contains("/fio-bench/r/o0099\n"));
        Ok(())
    }

    #[test]
    fn oversized_job_counts_are_config_errors() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let cfg = config(tmp.path(), &[("FIO_NUMJOBS_A", "4294967295")])?;
        let err = generate_descriptors(&cfg, &OutputDir::new(&cfg.out_dir))
            .expect_err("overflow should be rejected");
        assert_eq!(errors::exit_code_for(&err), 2);
        Ok(())
    }

    #[cfg(target_family = "unix")]
    mod unix {
        use super::*;

        fn fixture(name: &str) -> String {
            format!("{}/fixtures/{}", env!("CARGO_MANIFEST_DIR"), name)
        }

        #[tokio::test]
        async fn fio_without_s3_still_measures_the_network() -> anyhow::Result<()> {
            let tmp = tempfile::tempdir()?;
            let iperf3 = format!("sh -c 'cat {}'", fixture("iperf3.json"));
            let cfg = config(
                tmp.path(),
                &[
                    // answers both --version and --enghelp without listing an S3 engine
                    ("FIO_BIN", "sh -c 'echo fio-3.36'"),
                    ("IPERF3_BIN", iperf3.as_str()),
                    ("IPERF3_SERVER", "iperf3-server"),
                ],
            )?;

            let err = run(&cfg, true).await.expect_err("fio lacks an S3 engine");
            assert_eq!(errors::exit_code_for(&err), 3);

            let artifacts: Vec<String> = std::fs::read_dir(tmp.path())?
                .filter_map(Result::ok)
                .map(|entry| entry.file_name().to_string_lossy().to_string())
                .collect();
            assert!(artifacts.iter().any(|name| name.ends_with("_iperf3.json")));
            assert!(!artifacts.iter().any(|name| name.ends_with(".fio")));
            Ok(())
        }

        #[tokio::test]
        async fn fio_without_s3_skips_a_disabled_network_test() -> anyhow::Result<()> {
            let tmp = tempfile::tempdir()?;
            let cfg = config(tmp.path(), &[("FIO_BIN", "sh -c 'echo fio-3.36'")])?;

            let err = run(&cfg, false).await.expect_err("fio lacks an S3 engine");
            assert_eq!(errors::exit_code_for(&err), 3);
            assert_eq!(std::fs::read_dir(tmp.path())?.count(), 0);
            Ok(())
        }
    }
}
