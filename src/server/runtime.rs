/// Container-aware CPU detection for sizing the tokio worker pool.
///
/// Detection order:
/// 1. `XYPRISS_CPU_LIMIT` env var ("4" or "4000m")
/// 2. cgroup v2 `/sys/fs/cgroup/cpu.max`
/// 3. cgroup v1 cfs quota/period
/// 4. `std::thread::available_parallelism()`
///
/// tokio's default is the host CPU count, which over-provisions threads when
/// the container is limited to a slice of a large machine.
pub fn worker_threads() -> usize {
    // Logging is not initialized this early, hence eprintln.
    if let Ok(value) = std::env::var("XYPRISS_CPU_LIMIT") {
        if let Some(cores) = parse_cpu_value(&value) {
            let threads = cores.max(1);
            eprintln!("[runtime] using XYPRISS_CPU_LIMIT: {} threads", threads);
            return threads;
        }
    }

    if let Ok(content) = std::fs::read_to_string("/sys/fs/cgroup/cpu.max") {
        if let Some(cores) = parse_cgroup_v2(&content) {
            let threads = cores.max(1);
            eprintln!("[runtime] using cgroup v2 cpu limit: {} threads", threads);
            return threads;
        }
    }

    if let (Ok(quota), Ok(period)) = (
        std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_quota_us"),
        std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_period_us"),
    ) {
        if let Some(cores) = parse_cgroup_v1(&quota, &period) {
            let threads = cores.max(1);
            eprintln!("[runtime] using cgroup v1 cpu limit: {} threads", threads);
            return threads;
        }
    }

    let threads = std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1);
    eprintln!("[runtime] using host cpu count: {} threads", threads);
    threads
}

/// "4" (cores) or "4000m" (millicores).
fn parse_cpu_value(value: &str) -> Option<usize> {
    let value = value.trim();
    if let Some(millis) = value.strip_suffix('m') {
        millis.parse::<usize>().ok().map(|m| m / 1000)
    } else {
        value.parse::<usize>().ok()
    }
}

/// cgroup v2 `cpu.max`: "quota period" or "max period" (unlimited).
fn parse_cgroup_v2(content: &str) -> Option<usize> {
    let mut parts = content.split_whitespace();
    let quota = parts.next()?;
    let period: i64 = parts.next()?.parse().ok()?;
    if quota == "max" {
        return None;
    }
    let quota: i64 = quota.parse().ok()?;
    if quota > 0 && period > 0 {
        Some((quota / period).max(1) as usize)
    } else {
        None
    }
}

/// cgroup v1: cfs_quota_us / cfs_period_us; -1 means unlimited.
fn parse_cgroup_v1(quota: &str, period: &str) -> Option<usize> {
    let quota: i64 = quota.trim().parse().ok()?;
    let period: i64 = period.trim().parse().ok()?;
    if quota > 0 && period > 0 {
        Some((quota / period).max(1) as usize)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpu_value() {
        assert_eq!(parse_cpu_value("4"), Some(4));
        assert_eq!(parse_cpu_value("4000m"), Some(4));
        assert_eq!(parse_cpu_value("500m"), Some(0));
        assert_eq!(parse_cpu_value("junk"), None);
    }

    #[test]
    fn test_parse_cgroup_v2() {
        assert_eq!(parse_cgroup_v2("400000 100000"), Some(4));
        assert_eq!(parse_cgroup_v2("max 100000"), None);
        assert_eq!(parse_cgroup_v2("50000 100000"), Some(1));
        assert_eq!(parse_cgroup_v2(""), None);
    }

    #[test]
    fn test_parse_cgroup_v1() {
        assert_eq!(parse_cgroup_v1("200000", "100000"), Some(2));
        assert_eq!(parse_cgroup_v1("-1", "100000"), None);
        assert_eq!(parse_cgroup_v1("x", "100000"), None);
    }
}
