use anyhow::Result;
use std::collections::HashMap;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{info, warn};

/// Spawn one worker process with the platform launch contract:
/// `XYP_IPC`, `XYP_WORKER_ID`, `XYP_CAPS` in the environment, stdio piped
/// and relayed with a `[worker <id>]` prefix.
pub fn spawn_worker(
    entry_point: &str,
    args: &[String],
    extra_env: &HashMap<String, String>,
    worker_id: &str,
    ipc_path: &str,
    capabilities: &serde_json::Value,
) -> Result<Child> {
    let mut command = Command::new(entry_point);
    command
        .args(args)
        .envs(extra_env)
        .env("XYP_IPC", ipc_path)
        .env("XYP_WORKER_ID", worker_id)
        .env("XYP_CAPS", serde_json::to_string(capabilities)?)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn()?;
    info!(
        "cluster: spawned worker, id={}, pid={:?}, entry={}",
        worker_id,
        child.id(),
        entry_point
    );

    if let Some(stdout) = child.stdout.take() {
        let id = worker_id.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                info!("[worker {}] {}", id, line);
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        let id = worker_id.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!("[worker {}] {}", id, line);
            }
        });
    }

    Ok(child)
}

// ---------------------------------------------------------------------------
// Resource sampling — reads the kernel's accounting files directly, the same
// way runtime sizing reads cgroup limits. Non-Linux platforms return None
// and the caps become no-ops.
// ---------------------------------------------------------------------------

const PAGE_SIZE: u64 = 4096;
/// Kernel USER_HZ; fixed at 100 on every mainstream Linux.
const JIFFIES_PER_SEC: u64 = 100;

/// Resident set size of `pid` in bytes.
pub fn sample_rss_bytes(pid: u32) -> Option<u64> {
    if !cfg!(target_os = "linux") {
        return None;
    }
    let content = std::fs::read_to_string(format!("/proc/{}/statm", pid)).ok()?;
    parse_statm_rss(&content)
}

/// Cumulative CPU jiffies (utime + stime) consumed by `pid`.
pub fn sample_cpu_jiffies(pid: u32) -> Option<u64> {
    if !cfg!(target_os = "linux") {
        return None;
    }
    let content = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    parse_stat_cpu_jiffies(&content)
}

/// CPU usage percentage over a sampling interval given two jiffy readings.
pub fn cpu_percent(prev_jiffies: u64, current_jiffies: u64, interval_secs: u64) -> f64 {
    if interval_secs == 0 {
        return 0.0;
    }
    let delta = current_jiffies.saturating_sub(prev_jiffies) as f64;
    delta / (JIFFIES_PER_SEC * interval_secs) as f64 * 100.0
}

/// System-wide memory usage as a fraction of total, from /proc/meminfo.
pub fn system_memory_usage() -> Option<f64> {
    if !cfg!(target_os = "linux") {
        return None;
    }
    let content = std::fs::read_to_string("/proc/meminfo").ok()?;
    parse_meminfo_usage(&content)
}

/// Parse /proc/<pid>/statm — second column is resident pages.
fn parse_statm_rss(content: &str) -> Option<u64> {
    let resident_pages: u64 = content.split_whitespace().nth(1)?.parse().ok()?;
    Some(resident_pages * PAGE_SIZE)
}

/// Parse /proc/<pid>/stat — utime and stime are fields 14 and 15 (1-based),
/// counted after the parenthesized command name (which may contain spaces).
fn parse_stat_cpu_jiffies(content: &str) -> Option<u64> {
    let after_comm = content.rsplit_once(')')?.1;
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    // after_comm starts at field 3 (state), so utime/stime are at 11/12.
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

fn parse_meminfo_usage(content: &str) -> Option<f64> {
    let mut total_kb: Option<u64> = None;
    let mut available_kb: Option<u64> = None;
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total_kb = rest.split_whitespace().next()?.parse().ok();
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available_kb = rest.split_whitespace().next()?.parse().ok();
        }
    }
    let total = total_kb? as f64;
    let available = available_kb? as f64;
    if total <= 0.0 {
        return None;
    }
    Some(1.0 - available / total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_statm() {
        // total resident shared text lib data dirty
        assert_eq!(parse_statm_rss("12345 2560 300 1 0 900 0"), Some(2560 * 4096));
        assert_eq!(parse_statm_rss(""), None);
    }

    #[test]
    fn test_parse_stat_handles_spaces_in_comm() {
        // comm "(tokio runtime w)" contains a space; utime=150 stime=50.
        let stat = "4242 (tokio runtime w) S 1 4242 4242 0 -1 4194560 9000 0 0 0 150 50 0 0 20 0 8 0 123456 1000000 2560 18446744073709551615";
        assert_eq!(parse_stat_cpu_jiffies(stat), Some(200));
    }

    #[test]
    fn test_cpu_percent() {
        // 250 jiffies over 5 s at 100 Hz = 50% of one core.
        assert_eq!(cpu_percent(1000, 1250, 5), 50.0);
        assert_eq!(cpu_percent(1000, 1000, 5), 0.0);
        // Counter went backwards (pid reuse): clamp to zero.
        assert_eq!(cpu_percent(1250, 1000, 5), 0.0);
        assert_eq!(cpu_percent(0, 100, 0), 0.0);
    }

    #[test]
    fn test_parse_meminfo() {
        let meminfo = "MemTotal:       16000000 kB\nMemFree:         1000000 kB\nMemAvailable:    4000000 kB\n";
        let usage = parse_meminfo_usage(meminfo).unwrap();
        assert!((usage - 0.75).abs() < 1e-9);
        assert_eq!(parse_meminfo_usage("MemTotal: 0 kB\n"), None);
    }
}
