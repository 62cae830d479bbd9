use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{ProbeOutcome, Prober};

static PING_TIME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)time[=<]([\d.]+)\s*ms").expect("valid ping time regex"));

/// Round-trip time in milliseconds from `ping` output, if present.
pub fn parse_ping_time(output: &str) -> Option<f64> {
    PING_TIME
        .captures(output)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Parsed round-trip time as a duration. Values no duration can hold count
/// as unknown.
fn parse_latency(output: &str) -> Option<Duration> {
    parse_ping_time(output).and_then(|ms| Duration::try_from_secs_f64(ms / 1000.0).ok())
}

/// Single ICMP echo through the system `ping` binary.
#[derive(Debug, Clone)]
pub struct PingProber {
    program: String,
    target: String,
    timeout: Duration,
}

impl PingProber {
    pub fn new(target: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: "ping".into(),
            target: target.into(),
            timeout,
        }
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn args(&self) -> Vec<String> {
        let wait_ms = self.timeout.as_millis().max(1).to_string();
        let mut args: Vec<String> = if cfg!(windows) {
            vec!["-n".into(), "1".into(), "-w".into(), wait_ms]
        } else if cfg!(target_os = "macos") {
            vec!["-c".into(), "1".into(), "-W".into(), wait_ms]
        } else {
            let wait_secs = self.timeout.as_secs().max(1).to_string();
            vec!["-c".into(), "1".into(), "-W".into(), wait_secs]
        };
        args.push(self.target.clone());
        args
    }
}

#[async_trait]
impl Prober for PingProber {
    async fn probe(&self) -> ProbeOutcome {
        let child = Command::new(&self.program)
            .args(self.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let child = match child {
            Ok(c) => c,
            Err(e) => {
                warn!(target = %self.target, error = %e, "Failed to run ping");
                return ProbeOutcome::failed(format!("failed to run {}: {}", self.program, e));
            }
        };

        // The child is killed on drop if the outer bound fires.
        let bound = self.timeout + Duration::from_secs(1);
        let output = match tokio::time::timeout(bound, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                warn!(target = %self.target, error = %e, "Ping process error");
                return ProbeOutcome::failed(e.to_string());
            }
            Err(_) => {
                warn!(target = %self.target, "Ping did not exit in time");
                return ProbeOutcome::failed(format!("ping timed out after {:?}", bound));
            }
        };

        if output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let latency = parse_latency(&stdout);
            debug!(target = %self.target, latency_ms = ?latency.map(|d| d.as_secs_f64() * 1000.0), "Ping ok");
            ProbeOutcome::ok(latency)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let message = if stderr.is_empty() {
                format!("ping exited with {}", output.status)
            } else {
                stderr
            };
            warn!(target = %self.target, error = %message, "Ping failed");
            ProbeOutcome::failed(message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_linux_output() {
        let out = "64 bytes from 8.8.8.8: icmp_seq=1 ttl=117 time=12.3 ms";
        assert_eq!(parse_ping_time(out), Some(12.3));
    }

    #[test]
    fn parses_windows_sub_millisecond_output() {
        let out = "Reply from 192.168.1.1: bytes=32 time<1ms TTL=64";
        assert_eq!(parse_ping_time(out), Some(1.0));
    }

    #[test]
    fn parses_case_insensitively() {
        assert_eq!(parse_ping_time("Time=7 MS"), Some(7.0));
    }

    #[test]
    fn parse_miss_is_none() {
        assert_eq!(parse_ping_time("Request timeout for icmp_seq 0"), None);
    }

    #[test]
    fn oversized_time_is_unknown_latency() {
        let huge = format!("64 bytes from 10.0.0.1: time={} ms", "9".repeat(400));
        assert_eq!(parse_ping_time(&huge), Some(f64::INFINITY));
        assert_eq!(parse_latency(&huge), None);
        let ms = parse_latency("time=12.5 ms").unwrap().as_secs_f64() * 1000.0;
        assert!((ms - 12.5).abs() < 1e-6);
    }

    #[test]
    fn args_end_with_target() {
        let p = PingProber::new("1.1.1.1", Duration::from_secs(2));
        let args = p.args();
        assert_eq!(args.last().map(String::as_str), Some("1.1.1.1"));
        assert_eq!(&args[1], "1");
    }

    #[tokio::test]
    async fn missing_binary_is_a_failed_outcome() {
        let p = PingProber::new("127.0.0.1", Duration::from_secs(1))
            .with_program("definitely-not-a-ping-binary-4821");
        let outcome = p.probe().await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("failed to run"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn hung_ping_is_cut_off_after_timeout_plus_one_second() {
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;

        let mut script = tempfile::NamedTempFile::new().unwrap();
        writeln!(script, "#!/bin/sh\nexec sleep 30").unwrap();
        let path = script.into_temp_path();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

        let p = PingProber::new("127.0.0.1", Duration::from_millis(200))
            .with_program(path.to_string_lossy());
        let started = std::time::Instant::now();
        let outcome = p.probe().await;
        let elapsed = started.elapsed();

        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("timed out"));
        assert!(elapsed >= Duration::from_millis(1200));
        assert!(elapsed < Duration::from_secs(5));
    }
}
