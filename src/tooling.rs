use crate::{errors::BenchError, process_control::run_captured};
use std::time::Duration;
use tracing::{debug, warn};

const VERSION_TIMEOUT: Duration = Duration::from_secs(5);
const ENGHELP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum S3Engine {
    S3,
    /// The older http engine, deprecated but still able to speak S3.
    Http,
}

/// Checks that fio can be executed and returns its version string.
pub async fn check_fio_available(command: &str) -> anyhow::Result<String> {
    let unavailable = |reason: String| BenchError::Capability {
        message: format!("fio is not installed or not runnable ({})", reason),
        guidance: "Install with: apt install fio (Linux) or use Docker".to_string(),
    };

    let output = run_captured(command, &["--version"], VERSION_TIMEOUT)
        .await
        .map_err(|err| unavailable(err.to_string()))?;
    if !output.status.success() {
        return Err(unavailable(format!("exit status {}", output.status)).into());
    }

    let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
    debug!("Found fio: {}", version);
    Ok(version)
}

/// Finds which S3 capable I/O engine fio was built with, if any.
pub fn find_s3_engine(enghelp: &str) -> Option<S3Engine> {
    let engines = enghelp.to_lowercase();
    if engines.contains("s3") {
        Some(S3Engine::S3)
    } else if engines.contains("http") {
        Some(S3Engine::Http)
    } else {
        None
    }
}

/// Checks that fio can talk to S3.
pub async fn check_fio_s3_support(command: &str) -> anyhow::Result<S3Engine> {
    let missing = |reason: String| BenchError::Capability {
        message: format!("fio S3/HTTP engine not available ({})", reason),
        guidance: "This platform's fio has no S3 engine. For S3 testing use Docker: \
                   docker compose up --build"
            .to_string(),
    };

    let output = run_captured(command, &["--enghelp"], ENGHELP_TIMEOUT)
        .await
        .map_err(|err| missing(err.to_string()))?;
    if !output.status.success() {
        return Err(missing(format!("exit status {}", output.status)).into());
    }

    let engine = find_s3_engine(&String::from_utf8_lossy(&output.stdout))
        .ok_or_else(|| missing("no s3 or http engine listed".to_string()))?;
    if engine == S3Engine::Http {
        warn!("fio HTTP engine detected (deprecated)");
    }

    Ok(engine)
}

/// Whether iperf3 can be executed. A missing iperf3 only disables the network baseline.
pub async fn check_iperf3_available(command: &str) -> bool {
    match run_captured(command, &["--version"], VERSION_TIMEOUT).await {
        Ok(output) => output.status.success(),
        Err(err) => {
            debug!("iperf3 unavailable: {}", err);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_engines_from_enghelp() {
        let enghelp = "Available IO engines:\n\tcpuio\n\tmmap\n\tsync\n\thttp\n\tlibaio\n";
        assert_eq!(find_s3_engine(enghelp), Some(S3Engine::Http));

        let enghelp = "Available IO engines:\n\thttp\n\tS3\n";
        assert_eq!(find_s3_engine(enghelp), Some(S3Engine::S3));

        assert_eq!(find_s3_engine("Available IO engines:\n\tsync\n\tpsync\n"), None);
    }

    #[tokio::test]
    async fn missing_fio_is_a_capability_error() {
        let err = check_fio_available("definitely-not-a-real-fio-binary")
            .await
            .expect_err("should not find fio");
        assert!(matches!(
            err.downcast_ref::<BenchError>(),
            Some(BenchError::Capability { .. })
        ));
    }

    #[cfg(target_family = "unix")]
    #[tokio::test]
    async fn reports_version_of_a_runnable_command() -> anyhow::Result<()> {
        // the appended `--version` becomes $0 of the inline script
        let version = check_fio_available("sh -c 'echo fio-3.36'").await?;
        assert_eq!(version, "fio-3.36");

        assert!(check_iperf3_available("true").await);
        assert!(!check_iperf3_available("false").await);
        Ok(())
    }
}
