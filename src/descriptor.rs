use crate::{artifacts::OutputDir, config::S3Settings, errors::BenchError};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, fmt, path::PathBuf};
use tracing::debug;

/// fio rejects `filename=` values longer than this.
pub const IDENTIFIER_LIMIT: usize = 4096;

/// Objects created by every write sub-job.
pub const OBJECTS_PER_WRITE_JOB: u32 = 100;

/// Objects pre-populated for, and read by, the read workload.
pub const READ_OBJECT_COUNT: u32 = 100;

/// Upper bound on files listed by a single read sub-job.
pub const MAX_FILES_PER_READ_JOB: usize = 50;

const FILENUM_TOKEN: &str = "$filenum";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadRole {
    Write,
    Read,
}
impl WorkloadRole {
    /// Key of the per-job section in fio's JSON output, also the `rw=` value.
    pub fn fio_key(&self) -> &'static str {
        match self {
            WorkloadRole::Write => "write",
            WorkloadRole::Read => "read",
        }
    }

    pub fn opposite(&self) -> WorkloadRole {
        match self {
            WorkloadRole::Write => WorkloadRole::Read,
            WorkloadRole::Read => WorkloadRole::Write,
        }
    }

    /// Label used for job files and raw output artifacts.
    pub fn label(&self) -> &'static str {
        match self {
            WorkloadRole::Write => "profile_a_write",
            WorkloadRole::Read => "profile_b_read",
        }
    }
}
impl fmt::Display for WorkloadRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Key under which read object `idx` is provisioned.
pub fn read_object_key(idx: u32) -> String {
    format!("r/o{:04}", idx)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Targets {
    /// fio generates `count` names from `format`, substituting `$filenum`.
    Pattern { format: String, count: u32 },
    /// Pre-existing objects, listed one by one.
    Explicit(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubJobSpec {
    pub name: String,
    pub operation: WorkloadRole,
    pub block_size: String,
    pub targets: Targets,
}
impl SubJobSpec {
    /// Every object identifier this sub-job touches, in service order.
    pub fn identifiers(&self) -> Vec<String> {
        match &self.targets {
            Targets::Pattern { format, count } => (0..*count)
                .map(|n| format.replace(FILENUM_TOKEN, &n.to_string()))
                .collect(),
            Targets::Explicit(ids) => ids.clone(),
        }
    }

    /// Length of the value fio receives for this sub-job's file list.
    pub fn identifier_list_len(&self) -> usize {
        match &self.targets {
            Targets::Pattern { format, .. } => format.len(),
            Targets::Explicit(ids) => filename_list(ids).len(),
        }
    }

    fn render_lines(&self) -> Vec<String> {
        let mut lines = vec![
            String::new(),
            format!("[{}]", self.name),
            format!("rw={}", self.operation.fio_key()),
            format!("bs={}", self.block_size),
            format!("filesize={}", self.block_size),
        ];
        match &self.targets {
            Targets::Pattern { format, count } => {
                lines.push(format!("nrfiles={}", count));
                lines.push(format!("filename_format={}", format));
            }
            Targets::Explicit(ids) => lines.push(format!("filename={}", filename_list(ids))),
        }
        lines.push("openfiles=1".to_string());
        lines.push("file_service_type=sequential".to_string());
        lines
    }
}

fn filename_list(ids: &[String]) -> String {
    ids.iter().join(":")
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionParams {
    pub host: String,
    pub access_key: String,
    #[serde(skip_serializing)]
    pub secret_key: String,
    pub region: String,
}
impl From<&S3Settings> for ConnectionParams {
    fn from(s3: &S3Settings) -> Self {
        ConnectionParams {
            host: s3.host().to_string(),
            access_key: s3.access_key.clone(),
            secret_key: s3.secret_key.clone(),
            region: s3.region.clone(),
        }
    }
}

/// An immutable fio job description for one workload role.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkloadDescriptor {
    pub role: WorkloadRole,
    pub concurrency: u32,
    pub connection: ConnectionParams,
    pub sub_jobs: Vec<SubJobSpec>,
}
impl WorkloadDescriptor {
    /// Renders the descriptor as a fio job file.
    pub fn render(&self) -> String {
        let global = vec![
            "[global]".to_string(),
            "ioengine=http".to_string(),
            "http_mode=s3".to_string(),
            "http_verbose=0".to_string(),
            "direct=1".to_string(),
            format!("http_host={}", self.connection.host),
            format!("http_s3_key={}", self.connection.secret_key),
            format!("http_s3_keyid={}", self.connection.access_key),
            format!("http_s3_region={}", self.connection.region),
        ];

        global
            .into_iter()
            .chain(self.sub_jobs.iter().flat_map(SubJobSpec::render_lines))
            .map(|line| line + "\n")
            .collect()
    }

    /// Writes the job file to `temp_<label>.fio` in the output directory and returns its path.
    pub fn persist(&self, out_dir: &OutputDir) -> anyhow::Result<PathBuf> {
        let file_name = format!("temp_{}.fio", self.role.label());
        out_dir.write(&file_name, &self.render())
    }

    pub fn object_count(&self) -> usize {
        self.sub_jobs
            .iter()
            .map(|job| match &job.targets {
                Targets::Pattern { count, .. } => *count as usize,
                Targets::Explicit(ids) => ids.len(),
            })
            .sum()
    }
}

/// Builds the workload descriptor for a role.
///
/// # Arguments
///
/// * `role` - Which workload to build.
/// * `total_objects` - Objects to create (write) or read (read).
/// * `object_size` - Block and object size, in fio notation.
/// * `concurrency` - Number of write sub-jobs. Read sub-jobs are sized by the identifier limit.
/// * `s3` - Target endpoint, credentials and bucket.
///
/// # Returns
///
/// The descriptor, or a configuration error when counts are not positive or the bucket name
/// leaves no room for identifiers.
pub fn generate(
    role: WorkloadRole,
    total_objects: u32,
    object_size: &str,
    concurrency: u32,
    s3: &S3Settings,
) -> anyhow::Result<WorkloadDescriptor> {
    if concurrency == 0 {
        return Err(BenchError::Config("concurrency must be positive".to_string()).into());
    }
    if total_objects == 0 {
        return Err(BenchError::Config("object count must be positive".to_string()).into());
    }

    let sub_jobs = match role {
        WorkloadRole::Write => write_sub_jobs(total_objects, object_size, concurrency, &s3.bucket)?,
        WorkloadRole::Read => read_sub_jobs(total_objects, object_size, &s3.bucket)?,
    };
    debug!("generated {} sub-jobs for {}", sub_jobs.len(), role);

    Ok(WorkloadDescriptor {
        role,
        concurrency,
        connection: ConnectionParams::from(s3),
        sub_jobs,
    })
}

fn write_sub_jobs(
    total_objects: u32,
    object_size: &str,
    concurrency: u32,
    bucket: &str,
) -> anyhow::Result<Vec<SubJobSpec>> {
    let base = total_objects / concurrency;
    let remainder = total_objects % concurrency;

    let sub_jobs = (0..concurrency)
        .map(|i| {
            let count = base + u32::from(i < remainder);
            SubJobSpec {
                name: format!("write-job-{}", i),
                operation: WorkloadRole::Write,
                block_size: object_size.to_string(),
                targets: Targets::Pattern {
                    format: format!("/{}/w{}-{}", bucket, i, FILENUM_TOKEN),
                    count,
                },
            }
        })
        .filter(|job| matches!(job.targets, Targets::Pattern { count, .. } if count > 0))
        .collect_vec();

    // the longest generated name belongs to the highest file number
    let longest = format!("/{}/w{}-{}", bucket, concurrency - 1, base + 1);
    if longest.len() > IDENTIFIER_LIMIT {
        return Err(BenchError::Config(format!(
            "bucket name {:?} is too long for fio identifiers",
            bucket
        ))
        .into());
    }

    Ok(sub_jobs)
}

/// Number of identifiers a read sub-job may list, bounded by both the fixed cap and what fits in
/// `IDENTIFIER_LIMIT` given the length of a single identifier and its separator.
pub fn read_files_per_job(bucket: &str, total_objects: u32) -> usize {
    let widest = format!("/{}/{}", bucket, read_object_key(total_objects.saturating_sub(1)));
    let per_identifier = widest.len() + 1;
    // n identifiers need n * per_identifier - 1 characters
    let fits = (IDENTIFIER_LIMIT + 1) / per_identifier;
    fits.min(MAX_FILES_PER_READ_JOB)
}

fn read_sub_jobs(
    total_objects: u32,
    object_size: &str,
    bucket: &str,
) -> anyhow::Result<Vec<SubJobSpec>> {
    let files_per_job = read_files_per_job(bucket, total_objects);
    if files_per_job == 0 {
        return Err(BenchError::Config(format!(
            "bucket name {:?} is too long for fio identifiers",
            bucket
        ))
        .into());
    }

    let identifiers = (0..total_objects)
        .map(|idx| format!("/{}/{}", bucket, read_object_key(idx)))
        .collect_vec();

    let sub_jobs = identifiers
        .chunks(files_per_job)
        .enumerate()
        .map(|(i, ids)| SubJobSpec {
            name: format!("read-job-{}", i),
            operation: WorkloadRole::Read,
            block_size: object_size.to_string(),
            targets: Targets::Explicit(ids.to_vec()),
        })
        .collect_vec();

    Ok(sub_jobs)
}

/// Checks that no identifier is repeated across the descriptor's sub-jobs.
pub fn has_unique_identifiers(descriptor: &WorkloadDescriptor) -> bool {
    let mut seen = HashSet::new();
    descriptor
        .sub_jobs
        .iter()
        .flat_map(SubJobSpec::identifiers)
        .all(|id| seen.insert(id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s3(bucket: &str) -> S3Settings {
        S3Settings {
            endpoint: "http://localhost:9000".to_string(),
            access_key: "minioadmin".to_string(),
            secret_key: "secret".to_string(),
            bucket: bucket.to_string(),
            region: "us-east-1".to_string(),
        }
    }

    #[test]
    fn read_partitions_cover_all_objects_within_limit() -> anyhow::Result<()> {
        let desc = generate(WorkloadRole::Read, READ_OBJECT_COUNT, "4M", 4, &s3("fio-bench"))?;

        assert_eq!(desc.sub_jobs.len(), 2);
        for job in &desc.sub_jobs {
            assert!(job.identifier_list_len() <= IDENTIFIER_LIMIT);
            assert_eq!(job.operation, WorkloadRole::Read);
        }

        let all = desc
            .sub_jobs
            .iter()
            .flat_map(SubJobSpec::identifiers)
            .collect_vec();
        let expected = (0..READ_OBJECT_COUNT)
            .map(|i| format!("/fio-bench/r/o{:04}", i))
            .collect_vec();
        assert_eq!(all, expected);
        assert!(has_unique_identifiers(&desc));
        Ok(())
    }

    #[test]
    fn long_bucket_names_shrink_read_partitions() -> anyhow::Result<()> {
        let bucket = "b".repeat(200);
        let desc = generate(WorkloadRole::Read, READ_OBJECT_COUNT, "4M", 1, &s3(&bucket))?;

        // each identifier is 1 + 200 + 1 + 7 = 209 chars, 19 of them fit
        assert_eq!(read_files_per_job(&bucket, READ_OBJECT_COUNT), 19);
        assert_eq!(desc.sub_jobs.len(), 6);
        assert_eq!(desc.object_count(), READ_OBJECT_COUNT as usize);
        for job in &desc.sub_jobs {
            assert!(job.identifier_list_len() <= IDENTIFIER_LIMIT);
        }
        assert!(has_unique_identifiers(&desc));
        Ok(())
    }

    #[test]
    fn write_sub_jobs_create_unique_objects() -> anyhow::Result<()> {
        let concurrency = 4;
        let desc = generate(
            WorkloadRole::Write,
            concurrency * OBJECTS_PER_WRITE_JOB,
            "4M",
            concurrency,
            &s3("fio-bench"),
        )?;

        assert_eq!(desc.sub_jobs.len(), concurrency as usize);
        assert_eq!(
            desc.object_count(),
            (concurrency * OBJECTS_PER_WRITE_JOB) as usize
        );
        for job in &desc.sub_jobs {
            assert!(matches!(job.targets, Targets::Pattern { count: 100, .. }));
        }
        assert!(has_unique_identifiers(&desc));
        Ok(())
    }

    #[test]
    fn uneven_write_totals_are_spread() -> anyhow::Result<()> {
        let desc = generate(WorkloadRole::Write, 10, "1M", 3, &s3("fio-bench"))?;
        let counts = desc
            .sub_jobs
            .iter()
            .map(|job| job.identifiers().len())
            .collect_vec();
        assert_eq!(counts, vec![4, 3, 3]);
        Ok(())
    }

    #[test]
    fn non_positive_counts_are_config_errors() {
        for (total, concurrency) in [(0, 4), (100, 0)] {
            let err = generate(WorkloadRole::Write, total, "4M", concurrency, &s3("b"))
                .expect_err("should reject");
            assert!(matches!(
                err.downcast_ref::<BenchError>(),
                Some(BenchError::Config(_))
            ));
        }
    }

    #[test]
    fn renders_fio_job_file() -> anyhow::Result<()> {
        let desc = generate(WorkloadRole::Write, 200, "4M", 2, &s3("fio-bench"))?;
        let job_file = desc.render();

        assert!(job_file.starts_with("[global]\nioengine=http\nhttp_mode=s3\n"));
        assert!(job_file.contains("http_host=localhost:9000\n"));
        assert!(job_file.contains("http_s3_key=secret\n"));
        assert!(job_file.contains("http_s3_keyid=minioadmin\n"));
        assert!(job_file.contains("[write-job-1]\nrw=write\nbs=4M\nfilesize=4M\nnrfiles=100\n"));
        assert!(job_file.contains("filename_format=/fio-bench/w1-$filenum\n"));
        assert_eq!(job_file.matches("file_service_type=sequential").count(), 2);

        let read = generate(WorkloadRole::Read, 3, "4M", 1, &s3("fio-bench"))?.render();
        assert!(read.contains(
            "filename=/fio-bench/r/o0000:/fio-bench/r/o0001:/fio-bench/r/o0002\n"
        ));
        Ok(())
    }

    #[test]
    fn persists_job_file_by_role() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let out = OutputDir::new(tmp.path());
        let desc = generate(WorkloadRole::Read, 10, "4M", 1, &s3("fio-bench"))?;

        let path = desc.persist(&out)?;
        assert_eq!(path, tmp.path().join("temp_profile_b_read.fio"));
        assert_eq!(std::fs::read_to_string(path)?, desc.render());
        Ok(())
    }
}
