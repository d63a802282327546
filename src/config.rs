use crate::errors::BenchError;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::debug;

pub static DEFAULT_CONFIG_FILE: &str = "fiobench.toml";

/// Longest accepted iperf3 test, one day.
pub const MAX_PROBE_DURATION_SECS: u64 = 86_400;

// ******** ******** ********
// **    CONFIGURATION     **
// ******** ******** ********

/// Fully resolved settings for a single benchmark run. Nothing downstream of `Config::resolve`
/// looks at the environment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Config {
    pub in_container: bool,
    pub s3: S3Settings,
    pub fio: FioSettings,
    pub network: NetworkSettings,
    pub out_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct S3Settings {
    pub endpoint: String,
    pub access_key: String,
    #[serde(skip_serializing)]
    pub secret_key: String,
    pub bucket: String,
    pub region: String,
}
impl S3Settings {
    /// The endpoint with its scheme stripped, as fio's http engine expects it.
    pub fn host(&self) -> &str {
        self.endpoint
            .strip_prefix("http://")
            .or_else(|| self.endpoint.strip_prefix("https://"))
            .unwrap_or(&self.endpoint)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FioSettings {
    /// Command used to invoke fio, split into POSIX words before spawning.
    pub command: String,
    /// Block and object size exactly as written in the job file, e.g. `4M`.
    pub object_size: String,
    pub object_size_bytes: u64,
    pub write_jobs: u32,
    pub read_jobs: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkSettings {
    pub enabled: bool,
    pub command: String,
    pub server: String,
    pub duration_secs: u64,
}

/// Optional overrides read from a TOML file. Every field may be omitted.
#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct FileConfig {
    pub s3: FileS3,
    pub fio: FileFio,
    pub network: FileNetwork,
    pub out_dir: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct FileS3 {
    pub endpoint: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub bucket: Option<String>,
    pub region: Option<String>,
}

#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct FileFio {
    pub command: Option<String>,
    pub object_size: Option<String>,
    pub write_jobs: Option<u32>,
    pub read_jobs: Option<u32>,
}

#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct FileNetwork {
    pub enabled: Option<bool>,
    pub command: Option<String>,
    pub server: Option<String>,
    pub duration_secs: Option<u64>,
}

impl FileConfig {
    pub fn try_from_path(path: &Path) -> anyhow::Result<FileConfig> {
        let conf_str = fs::read_to_string(path)
            .with_context(|| format!("Unable to read config file {}", path.display()))?;
        FileConfig::try_from_str(&conf_str)
    }

    pub fn try_from_str(conf_str: &str) -> anyhow::Result<FileConfig> {
        toml::from_str::<FileConfig>(conf_str)
            .map_err(|e| BenchError::Config(format!("TOML parsing error: {}", e)).into())
    }
}

/// Loads the config file. An explicit path must exist, the default `fiobench.toml` is only read
/// when present.
pub fn load_file_config(path: Option<&Path>) -> anyhow::Result<Option<FileConfig>> {
    match path {
        Some(path) => FileConfig::try_from_path(path).map(Some),
        None => {
            let default_path = Path::new(DEFAULT_CONFIG_FILE);
            if default_path.exists() {
                debug!("Reading {}", DEFAULT_CONFIG_FILE);
                FileConfig::try_from_path(default_path).map(Some)
            } else {
                Ok(None)
            }
        }
    }
}

impl Config {
    /// Resolves the run configuration from defaults, the optional config file and the environment
    /// (highest precedence).
    ///
    /// # Arguments
    ///
    /// * `file` - Values read from the TOML config file, if any.
    /// * `env` - Lookup for environment variables.
    /// * `in_container` - Whether the runner is inside a container, this changes host defaults.
    pub fn resolve<F>(file: Option<FileConfig>, env: F, in_container: bool) -> anyhow::Result<Config>
    where
        F: Fn(&str) -> Option<String>,
    {
        let file = file.unwrap_or_default();

        let default_endpoint = if in_container {
            "http://minio:9000"
        } else {
            "http://localhost:9000"
        };
        let default_iperf3_server = if in_container {
            "iperf3-server"
        } else {
            "localhost"
        };

        let s3 = S3Settings {
            endpoint: pick(&env, "S3_ENDPOINT", file.s3.endpoint, default_endpoint),
            access_key: pick(&env, "S3_ACCESS_KEY", file.s3.access_key, "minioadmin"),
            secret_key: pick(&env, "S3_SECRET_KEY", file.s3.secret_key, "minioadmin"),
            bucket: pick(&env, "S3_BUCKET", file.s3.bucket, "fio-bench"),
            region: pick(&env, "S3_REGION", file.s3.region, "us-east-1"),
        };

        let object_size = pick(&env, "FIO_OBJECT_SIZE", file.fio.object_size, "4M");
        let object_size_bytes = parse_size(&object_size)?;
        let fio = FioSettings {
            command: pick(&env, "FIO_BIN", file.fio.command, "fio"),
            object_size,
            object_size_bytes,
            write_jobs: pick_parsed(&env, "FIO_NUMJOBS_A", file.fio.write_jobs, 4)?,
            read_jobs: pick_parsed(&env, "FIO_NUMJOBS_B", file.fio.read_jobs, 4)?,
        };
        if fio.write_jobs == 0 || fio.read_jobs == 0 {
            return Err(BenchError::Config("job counts must be positive".to_string()).into());
        }

        let network = NetworkSettings {
            enabled: match env("IPERF3_ENABLED") {
                Some(val) => val.trim().eq_ignore_ascii_case("true"),
                None => file.network.enabled.unwrap_or(false),
            },
            command: pick(&env, "IPERF3_BIN", file.network.command, "iperf3"),
            server: pick(
                &env,
                "IPERF3_SERVER",
                file.network.server,
                default_iperf3_server,
            ),
            duration_secs: pick_parsed(&env, "IPERF3_DURATION", file.network.duration_secs, 10)?,
        };
        if network.duration_secs == 0 || network.duration_secs > MAX_PROBE_DURATION_SECS {
            return Err(BenchError::Config(format!(
                "IPERF3_DURATION must be between 1 and {} seconds",
                MAX_PROBE_DURATION_SECS
            ))
            .into());
        }

        let out_dir = env("OUT_DIR")
            .map(PathBuf::from)
            .or(file.out_dir)
            .unwrap_or_else(|| PathBuf::from("./out"));

        Ok(Config {
            in_container,
            s3,
            fio,
            network,
            out_dir,
        })
    }

    /// Resolves the configuration from the real process environment.
    pub fn from_env(file: Option<FileConfig>) -> anyhow::Result<Config> {
        Config::resolve(file, |key| std::env::var(key).ok(), detect_container())
    }

    pub fn environment_label(&self) -> &'static str {
        if self.in_container {
            "Docker"
        } else {
            "Host (IDE/local)"
        }
    }
}

fn pick<F>(env: &F, key: &str, file_val: Option<String>, default: &str) -> String
where
    F: Fn(&str) -> Option<String>,
{
    env(key)
        .or(file_val)
        .unwrap_or_else(|| default.to_string())
}

fn pick_parsed<F, T>(env: &F, key: &str, file_val: Option<T>, default: T) -> anyhow::Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match env(key) {
        Some(raw) => raw.trim().parse::<T>().map_err(|_| {
            BenchError::Config(format!("{} must be a number, got {:?}", key, raw)).into()
        }),
        None => Ok(file_val.unwrap_or(default)),
    }
}

/// Parses a fio style size (`4M`, `512k`, `1G`, `4096`) into bytes. Suffixes are binary.
pub fn parse_size(size: &str) -> anyhow::Result<u64> {
    let trimmed = size.trim();
    let digits_end = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (num, suffix) = trimmed.split_at(digits_end);

    let num = num
        .parse::<u64>()
        .map_err(|_| BenchError::Config(format!("invalid object size {:?}", size)))?;
    let multiplier: u64 = match suffix.to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KIB" => 1024,
        "M" | "MB" | "MIB" => 1024 * 1024,
        "G" | "GB" | "GIB" => 1024 * 1024 * 1024,
        _ => {
            return Err(
                BenchError::Config(format!("unknown size suffix in {:?}", size)).into(),
            )
        }
    };

    match num.checked_mul(multiplier) {
        Some(0) | None => {
            Err(BenchError::Config(format!("object size {:?} is out of range", size)).into())
        }
        Some(bytes) => Ok(bytes),
    }
}

/// Best effort check whether this process runs inside a container.
pub fn detect_container() -> bool {
    container_markers(
        Path::new("/.dockerenv"),
        Path::new("/proc/1/cgroup"),
        std::env::var("DOCKER_CONTAINER").ok(),
    )
}

fn container_markers(dockerenv: &Path, cgroup: &Path, docker_env_var: Option<String>) -> bool {
    if dockerenv.exists() {
        return true;
    }

    if let Ok(cgroups) = fs::read_to_string(cgroup) {
        if cgroups.contains("docker") || cgroups.contains("kubepods") {
            return true;
        }
    }

    docker_env_var.is_some_and(|val| !val.is_empty())
}
