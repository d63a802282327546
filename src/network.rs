use crate::{
    artifacts::OutputDir, config::NetworkSettings, errors::BenchError,
    process_control::{run_captured, split_command},
    tooling::check_iperf3_available,
};
use anyhow::{anyhow, Context};
use serde::Serialize;
use serde_json::Value;
use std::{net::IpAddr, time::Duration};
use subprocess::{Exec, NullFile, Popen};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// iperf3's default listening port.
pub const RESPONDER_PORT: u16 = 5201;

const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
const POLL_ATTEMPTS: u32 = 20;
const POLL_INTERVAL: Duration = Duration::from_millis(250);
const PROBE_MARGIN: Duration = Duration::from_secs(30);
const RESPONDER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkBaseline {
    pub sent_mbps: f64,
    pub received_mbps: f64,
    pub sent_bytes: u64,
    pub received_bytes: u64,
    pub duration_secs: u64,
}

/// What became of the optional network baseline.
#[derive(Debug, Clone, PartialEq)]
pub enum BaselineOutcome {
    /// Not requested for this run.
    Disabled,
    /// iperf3 could not be executed.
    Unavailable,
    /// The local responder never came up, or the probe produced no usable result.
    Failed,
    Measured(NetworkBaseline),
}
impl BaselineOutcome {
    pub fn baseline(&self) -> Option<&NetworkBaseline> {
        match self {
            BaselineOutcome::Measured(baseline) => Some(baseline),
            _ => None,
        }
    }
}

/// An `iperf3 -s` started by this run. It is stopped explicitly, or at the latest when dropped,
/// so no exit path leaves it running.
pub struct LocalResponder {
    process: Option<Popen>,
}
impl LocalResponder {
    /// Spawns `<command> -s -p <port>` detached from this process, with its output discarded.
    pub fn spawn(command: &str, port: u16) -> anyhow::Result<LocalResponder> {
        let words = split_command(command)?;
        let process = match &words[..] {
            [program, args @ ..] => Exec::cmd(program)
                .args(args)
                .arg("-s")
                .arg("-p")
                .arg(port.to_string())
                .stdout(NullFile)
                .stderr(NullFile)
                .detached()
                .popen()
                .with_context(|| format!("Failed to spawn {} -s", command))?,
            _ => return Err(anyhow!("Empty command")),
        };

        Ok(LocalResponder {
            process: Some(process),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(Popen::pid)
    }

    /// Terminates the responder and waits a bounded time for it to exit. Best effort, calling it
    /// more than once is harmless.
    pub fn stop(&mut self) {
        let Some(mut process) = self.process.take() else {
            return;
        };

        println!("Stopping local iperf3 server...");
        if let Err(err) = process.terminate() {
            warn!("Failed to stop iperf3 server: {}", err);
            return;
        }

        match process.wait_timeout(RESPONDER_STOP_TIMEOUT) {
            Ok(Some(_)) => info!("Local iperf3 server stopped"),
            Ok(None) => {
                warn!("iperf3 server ignored SIGTERM, killing it");
                if let Err(err) = process.kill() {
                    warn!("Failed to kill iperf3 server: {}", err);
                } else if let Err(err) = process.wait() {
                    warn!("Failed to reap iperf3 server: {}", err);
                }
            }
            Err(err) => warn!("Failed to stop iperf3 server: {}", err),
        }
    }

    /// Same as `stop`, but waits on the blocking pool instead of a runtime worker.
    pub async fn shutdown(mut self) {
        if let Err(err) = tokio::task::spawn_blocking(move || self.stop()).await {
            warn!("Failed to stop iperf3 server: {}", err);
        }
    }
}
impl Drop for LocalResponder {
    fn drop(&mut self) {
        self.stop();
    }
}

pub fn is_loopback(server: &str) -> bool {
    server.eq_ignore_ascii_case("localhost")
        || server
            .parse::<IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false)
}

pub async fn is_port_open(host: &str, port: u16) -> bool {
    matches!(
        tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}

/// Polls `host:port` until it accepts connections or the attempts run out.
pub async fn wait_for_port(host: &str, port: u16, attempts: u32, interval: Duration) -> bool {
    for attempt in 1..=attempts {
        if is_port_open(host, port).await {
            debug!("{}:{} reachable after {} attempts", host, port, attempt);
            return true;
        }
        tokio::time::sleep(interval).await;
    }
    false
}

/// Starts a local iperf3 server on `port` unless one is already listening there.
///
/// # Returns
///
/// `Ok(None)` when a server is already running, `Ok(Some(responder))` once the new server
/// accepts connections, an error if it could not be started or never became reachable.
pub async fn start_local_responder(
    command: &str,
    host: &str,
    port: u16,
) -> anyhow::Result<Option<LocalResponder>> {
    if is_port_open(host, port).await {
        println!("  iperf3 server already running on port {}", port);
        return Ok(None);
    }

    println!("  Starting local iperf3 server...");
    let responder = LocalResponder::spawn(command, port)?;

    if wait_for_port(host, port, POLL_ATTEMPTS, POLL_INTERVAL).await {
        println!("  iperf3 server started successfully on port {}", port);
        Ok(Some(responder))
    } else {
        responder.shutdown().await;
        Err(anyhow!("iperf3 server did not listen on port {} in time", port))
    }
}

fn u64_field(obj: Option<&Value>, key: &str) -> u64 {
    obj.and_then(|obj| obj.get(key))
        .and_then(|val| val.as_u64().or_else(|| val.as_f64().map(|f| f.max(0.0) as u64)))
        .unwrap_or(0)
}

fn f64_field(obj: Option<&Value>, key: &str) -> f64 {
    obj.and_then(|obj| obj.get(key))
        .and_then(Value::as_f64)
        .unwrap_or(0_f64)
        .max(0_f64)
}

/// Reads the end-of-test summary from `iperf3 -J` output. Rates are converted from bits/s to
/// megabits/s.
pub fn parse_baseline(raw: &str, duration_secs: u64) -> anyhow::Result<NetworkBaseline> {
    let doc: Value = serde_json::from_str(raw)
        .map_err(|e| BenchError::parse("iperf3 JSON output", e, raw))?;

    if let Some(reason) = doc.get("error").and_then(Value::as_str) {
        return Err(BenchError::Probe(reason.to_string()).into());
    }

    let end = doc.get("end");
    let sum_sent = end.and_then(|end| end.get("sum_sent"));
    let sum_received = end.and_then(|end| end.get("sum_received"));

    Ok(NetworkBaseline {
        sent_mbps: f64_field(sum_sent, "bits_per_second") / 1_000_000.0,
        received_mbps: f64_field(sum_received, "bits_per_second") / 1_000_000.0,
        sent_bytes: u64_field(sum_sent, "bytes"),
        received_bytes: u64_field(sum_received, "bytes"),
        duration_secs,
    })
}

async fn try_probe(
    command: &str,
    server: &str,
    duration_secs: u64,
    out_dir: &OutputDir,
) -> anyhow::Result<NetworkBaseline> {
    let timeout = Duration::from_secs(duration_secs)
        .checked_add(PROBE_MARGIN)
        .ok_or_else(|| BenchError::Probe(format!("duration {}s is out of range", duration_secs)))?;
    let duration = duration_secs.to_string();

    let output = match run_captured(command, &["-c", server, "-t", &duration, "-J"], timeout).await
    {
        Ok(output) => output,
        Err(err) => {
            out_dir.persist_log("iperf3", &format!("{:#}", err))?;
            return Err(err);
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    out_dir.persist_raw("iperf3", &stdout)?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        out_dir.persist_log("iperf3", &format!("{}\n{}", output.status, stderr))?;
        return Err(anyhow!("iperf3 exited with {}: {}", output.status, stderr.trim()));
    }

    parse_baseline(&stdout, duration_secs)
}

/// Measures raw throughput to `server`. Any failure (timeout, non-zero exit, bad output) is
/// logged and yields `None`; a missing baseline never fails the run.
pub async fn probe(
    command: &str,
    server: &str,
    duration_secs: u64,
    out_dir: &OutputDir,
) -> Option<NetworkBaseline> {
    println!("\nRunning iperf3 network bandwidth test to {}...", server);

    match try_probe(command, server, duration_secs, out_dir).await {
        Ok(baseline) => {
            println!(
                "  Network bandwidth: {:.2} Mbps (send), {:.2} Mbps (receive)",
                baseline.sent_mbps, baseline.received_mbps
            );
            Some(baseline)
        }
        Err(err) => {
            warn!("{}", BenchError::Probe(format!("{:#}", err)));
            None
        }
    }
}

/// Runs the optional network baseline, starting (and always stopping) a local responder when
/// the server is this host.
pub async fn run_baseline(
    settings: &NetworkSettings,
    in_container: bool,
    out_dir: &OutputDir,
) -> BaselineOutcome {
    if !check_iperf3_available(&settings.command).await {
        warn!("iperf3 not available, skipping network baseline test");
        if !in_container {
            println!(
                "  To install iperf3: brew install iperf3 (macOS) or sudo apt install iperf3 (Ubuntu)"
            );
        }
        return BaselineOutcome::Unavailable;
    }

    let mut responder = None;
    if !in_container && is_loopback(&settings.server) {
        match start_local_responder(&settings.command, &settings.server, RESPONDER_PORT).await {
            Ok(started) => responder = started,
            Err(err) => {
                warn!("{}", BenchError::Probe(format!("{:#}", err)));
                return BaselineOutcome::Failed;
            }
        }
    }

    let baseline = probe(
        &settings.command,
        &settings.server,
        settings.duration_secs,
        out_dir,
    )
    .await;

    if let Some(responder) = responder {
        responder.shutdown().await;
    }

    match baseline {
        Some(baseline) => BaselineOutcome::Measured(baseline),
        None => {
            warn!("iperf3 test failed, continuing with S3 tests...");
            BaselineOutcome::Failed
        }
    }
}
