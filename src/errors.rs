use crate::descriptor::WorkloadRole;
use thiserror::Error;

/// Failures that end (or, for probes, degrade) a benchmark run. These are raised inside
/// `anyhow::Error` so callers can keep using `?` and `main` can downcast to pick an exit code.
#[derive(Debug, Error)]
pub enum BenchError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{message}\n{guidance}")]
    Capability { message: String, guidance: String },

    #[error("fio {role} failed with code {code}\nstderr: {stderr}")]
    Execution {
        role: WorkloadRole,
        code: i32,
        stderr: String,
    },

    #[error("failed to parse {context}: {reason}\noutput: {excerpt}")]
    Parse {
        context: String,
        reason: String,
        excerpt: String,
    },

    #[error("network probe failed: {0}")]
    Probe(String),

    #[error("storage provisioning failed: {0}")]
    Provisioning(String),
}

impl BenchError {
    /// Process exit code for this category of failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            BenchError::Config(_) => 2,
            BenchError::Capability { .. } => 3,
            BenchError::Execution { .. }
            | BenchError::Parse { .. }
            | BenchError::Probe(_)
            | BenchError::Provisioning(_) => 1,
        }
    }

    pub fn parse(context: &str, reason: impl ToString, raw: &str) -> Self {
        BenchError::Parse {
            context: context.to_string(),
            reason: reason.to_string(),
            excerpt: excerpt(raw, 1000),
        }
    }
}

/// Exit code for any error surfaced from a run. Errors that are not part of the taxonomy (I/O,
/// HTTP transport, ...) are treated as generic failures.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<BenchError>()
        .map(BenchError::exit_code)
        .unwrap_or(1)
}

fn excerpt(raw: &str, max_chars: usize) -> String {
    match raw.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &raw[..idx]),
        None => raw.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_taxonomy() {
        assert_eq!(BenchError::Config("x".into()).exit_code(), 2);
        let capability = BenchError::Capability {
            message: "no s3".into(),
            guidance: "use docker".into(),
        };
        assert_eq!(capability.exit_code(), 3);
        let execution = BenchError::Execution {
            role: WorkloadRole::Write,
            code: 1,
            stderr: "boom".into(),
        };
        assert_eq!(execution.exit_code(), 1);
    }

    #[test]
    fn downcasts_through_anyhow() {
        let err: anyhow::Error = BenchError::Config("bad".into()).into();
        assert_eq!(exit_code_for(&err), 2);

        let other = anyhow::anyhow!("io failure");
        assert_eq!(exit_code_for(&other), 1);
    }

    #[test]
    fn parse_error_truncates_raw_output() {
        let raw = "x".repeat(1500);
        match BenchError::parse("fio read", "eof", &raw) {
            BenchError::Parse { excerpt, .. } => {
                assert_eq!(excerpt.len(), 1003);
                assert!(excerpt.ends_with("..."));
            }
            _ => panic!("expected a parse error"),
        }
    }
}
