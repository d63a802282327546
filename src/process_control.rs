use crate::{artifacts::OutputDir, descriptor::WorkloadRole, errors::BenchError};
use anyhow::{anyhow, Context};
use colored::*;
use std::{
    path::{Path, PathBuf},
    process::{Output, Stdio},
    time::Duration,
};
use tokio::{process::Command, task::JoinHandle};
use tracing::{debug, error, info};

/// Breaks a configured command string into POSIX words.
pub fn split_command(command: &str) -> anyhow::Result<Vec<String>> {
    match shlex::split(command) {
        Some(words) if !words.is_empty() => Ok(words),
        _ => Err(BenchError::Config(format!(
            "command {:?} is empty or not POSIX compliant",
            command
        ))
        .into()),
    }
}

fn command_from_words(words: &[String]) -> anyhow::Result<Command> {
    match words {
        [program, args @ ..] => {
            let mut cmd = Command::new(program);
            cmd.args(args);
            Ok(cmd)
        }
        _ => Err(anyhow!("Empty command")),
    }
}

/// Runs a short-lived helper command to completion, capturing its output.
///
/// # Arguments
///
/// * `command` - Base command (e.g. `fio`), split into words with shlex.
/// * `args` - Extra arguments appended after the base command.
/// * `timeout` - Hard limit, the child is killed when it expires.
///
/// # Returns
///
/// The captured output, an error if the command can't be spawned or the timeout elapsed.
pub async fn run_captured(
    command: &str,
    args: &[&str],
    timeout: Duration,
) -> anyhow::Result<Output> {
    let words = split_command(command)?;
    let mut cmd = command_from_words(&words)?;
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = tokio::time::timeout(timeout, cmd.output())
        .await
        .map_err(|_| anyhow!("{} timed out after {}s", command, timeout.as_secs()))?
        .with_context(|| format!("Failed to run {}", command))?;

    Ok(output)
}

/// A workload executor running as its own OS process. The captured output is collected by a
/// task spawned at launch so both workloads drain their pipes concurrently.
#[derive(Debug)]
pub struct ProcessHandle {
    pub role: WorkloadRole,
    pub pid: Option<u32>,
    pub job_file: PathBuf,
    completion: JoinHandle<std::io::Result<Output>>,
}
impl ProcessHandle {
    fn abort(&self) {
        self.completion.abort();
    }
}

/// Standard output of a workload that exited successfully, ready to be normalised.
#[derive(Debug, Clone)]
pub struct RawOutput {
    pub role: WorkloadRole,
    pub stdout: String,
    pub artifact: Option<PathBuf>,
}

/// Builds the fio invocation for a job file. Parallelism lives in the job file's sections, so
/// fio itself runs a single instance of each.
pub fn executor_args(job_file: &Path) -> Vec<String> {
    vec![
        job_file.to_string_lossy().to_string(),
        "--output-format=json".to_string(),
        "--numjobs=1".to_string(),
    ]
}

fn spawn_executor(
    words: &[String],
    role: WorkloadRole,
    job_file: &Path,
) -> anyhow::Result<ProcessHandle> {
    let mut cmd = command_from_words(words)?;
    cmd.args(executor_args(job_file))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd
        .spawn()
        .with_context(|| format!("Failed to start {} for {}", words.join(" "), role))?;
    let pid = child.id();

    debug!("started {} with pid {:?}", role, pid);
    Ok(ProcessHandle {
        role,
        pid,
        job_file: job_file.to_path_buf(),
        completion: tokio::spawn(child.wait_with_output()),
    })
}

/// Starts one executor per job file without waiting for any of them. Must be called from within
/// a tokio runtime.
///
/// # Arguments
///
/// * `command` - The executor command (usually `fio`).
/// * `jobs` - Role and job file for every workload, in reporting order.
///
/// # Returns
///
/// Live handles in launch order. If any launch fails the already running executors are killed.
pub fn launch(command: &str, jobs: &[(WorkloadRole, PathBuf)]) -> anyhow::Result<Vec<ProcessHandle>> {
    let words = split_command(command)?;
    let mut handles: Vec<ProcessHandle> = Vec::with_capacity(jobs.len());

    for (role, job_file) in jobs {
        println!(
            "> starting fio for {} {}",
            role.to_string().green(),
            job_file.display().to_string().bright_black()
        );

        match spawn_executor(&words, *role, job_file) {
            Ok(handle) => handles.push(handle),
            Err(err) => {
                handles.iter().for_each(ProcessHandle::abort);
                return Err(err);
            }
        }
    }

    Ok(handles)
}

/// Waits for every handle in launch order, then persists each captured stdout before checking
/// exit codes. This is the only point where the run blocks on the workloads.
///
/// # Arguments
///
/// * `handles` - Handles returned by `launch`.
/// * `out_dir` - Destination of the raw output artifacts.
///
/// # Returns
///
/// The raw output of every workload in launch order, or an execution error naming the first
/// workload (in launch order) that exited non-zero.
pub async fn await_all(
    handles: Vec<ProcessHandle>,
    out_dir: &OutputDir,
) -> anyhow::Result<Vec<RawOutput>> {
    let mut finished = Vec::with_capacity(handles.len());
    for handle in handles {
        let result = handle.completion.await;
        finished.push((handle.role, result));
    }

    // persist everything that was captured before deciding on failure
    let mut collected = Vec::with_capacity(finished.len());
    for (role, result) in finished {
        let output = match result {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(err)) => Err(anyhow!(err).context(format!("Failed to wait for {}", role))),
            Err(err) => Err(anyhow!(err).context(format!("Collector task for {} failed", role))),
        };

        let artifact = match &output {
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                Some(out_dir.persist_raw(role.label(), &stdout)?)
            }
            Err(_) => None,
        };
        collected.push((role, output, artifact));
    }

    let mut raw_outputs = Vec::with_capacity(collected.len());
    for (role, output, artifact) in collected {
        let output = output?;
        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            error!("fio {} failed with code {}", role, code);
            return Err(BenchError::Execution { role, code, stderr }.into());
        }

        info!("fio {} finished", role);
        raw_outputs.push(RawOutput {
            role,
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            artifact,
        });
    }

    Ok(raw_outputs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_commands_like_a_shell() -> anyhow::Result<()> {
        assert_eq!(split_command("fio")?, vec!["fio"]);
        assert_eq!(
            split_command("docker exec 'bench box' fio")?,
            vec!["docker", "exec", "bench box", "fio"]
        );
        assert!(split_command("").is_err());
        assert!(split_command("fio 'unterminated").is_err());
        Ok(())
    }

    #[test]
    fn builds_json_invocation() {
        let args = executor_args(Path::new("out/temp_profile_a_write.fio"));
        assert_eq!(
            args,
            vec![
                "out/temp_profile_a_write.fio",
                "--output-format=json",
                "--numjobs=1"
            ]
        );
    }

    #[cfg(target_family = "unix")]
    mod unix {
        use super::*;
        use std::fs;

        // `sh <job file> --output-format=json --numjobs=1` runs the job file as a script, which
        // lets the tests stand in for fio.
        fn script(dir: &Path, name: &str, body: &str) -> anyhow::Result<PathBuf> {
            let path = dir.join(name);
            fs::write(&path, body)?;
            Ok(path)
        }

        fn artifacts_for(dir: &Path, label: &str) -> anyhow::Result<Vec<PathBuf>> {
            let mut found = vec![];
            for entry in fs::read_dir(dir)? {
                let path = entry?.path();
                let name = path.file_name().unwrap().to_string_lossy().to_string();
                if name.ends_with(&format!("_{}.json", label)) {
                    found.push(path);
                }
            }
            Ok(found)
        }

        #[tokio::test]
        async fn collects_output_in_launch_order() -> anyhow::Result<()> {
            let tmp = tempfile::tempdir()?;
            let write = script(tmp.path(), "write.sh", "sleep 1\necho '{\"role\":\"write\"}'\n")?;
            let read = script(tmp.path(), "read.sh", "echo '{\"role\":\"read\"}'\n")?;
            let out = OutputDir::new(tmp.path().join("out"));

            let handles = launch(
                "sh",
                &[(WorkloadRole::Write, write), (WorkloadRole::Read, read)],
            )?;
            assert!(handles.iter().all(|h| h.pid.is_some()));

            let outputs = await_all(handles, &out).await?;
            let roles: Vec<_> = outputs.iter().map(|o| o.role).collect();
            assert_eq!(roles, vec![WorkloadRole::Write, WorkloadRole::Read]);
            assert_eq!(outputs[0].stdout.trim(), r#"{"role":"write"}"#);
            assert_eq!(outputs[1].stdout.trim(), r#"{"role":"read"}"#);

            let persisted = outputs[1].artifact.as_ref().expect("artifact should exist");
            assert_eq!(fs::read_to_string(persisted)?, outputs[1].stdout);
            Ok(())
        }

        #[tokio::test]
        async fn failing_write_aborts_but_read_output_is_kept() -> anyhow::Result<()> {
            let tmp = tempfile::tempdir()?;
            let write = script(tmp.path(), "write.sh", "echo 'no engine' >&2\nexit 1\n")?;
            let read = script(tmp.path(), "read.sh", "sleep 1\necho '{\"jobs\":[]}'\n")?;
            let out_path = tmp.path().join("out");
            let out = OutputDir::new(&out_path);

            let handles = launch(
                "sh",
                &[(WorkloadRole::Write, write), (WorkloadRole::Read, read)],
            )?;
            let err = await_all(handles, &out)
                .await
                .expect_err("write failure should be fatal");

            match err.downcast_ref::<BenchError>() {
                Some(BenchError::Execution { role, code, stderr }) => {
                    assert_eq!(*role, WorkloadRole::Write);
                    assert_eq!(*code, 1);
                    assert_eq!(stderr.trim(), "no engine");
                }
                other => panic!("expected execution error, got {:?}", other),
            }

            let read_artifacts = artifacts_for(&out_path, "profile_b_read")?;
            assert_eq!(read_artifacts.len(), 1);
            assert_eq!(fs::read_to_string(&read_artifacts[0])?.trim(), r#"{"jobs":[]}"#);
            Ok(())
        }

        #[tokio::test]
        async fn missing_executor_fails_to_launch() {
            let res = launch(
                "definitely-not-a-real-fio-binary",
                &[(WorkloadRole::Write, PathBuf::from("job.fio"))],
            );
            assert!(res.is_err());
        }

        #[tokio::test]
        async fn helper_commands_time_out() -> anyhow::Result<()> {
            let output = run_captured("sh", &["-c", "echo fio-3.36"], Duration::from_secs(5)).await?;
            assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "fio-3.36");

            let res = run_captured("sleep", &["5"], Duration::from_millis(200)).await;
            assert!(res.is_err());
            Ok(())
        }
    }
}
