//! 本机资源采样
//!
//! Linux下直接读 /proc，其他平台回退为零值。

use capd_domain::ResourceSample;

/// 采集CPU核数、内存总量与当前负载
pub fn collect() -> ResourceSample {
    let total_cpu = std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(0);

    let (total_mem_mb, mem_percent) = read_meminfo();
    let cpu_percent = read_cpu_percent(total_cpu);

    let host = hostname::get()
        .unwrap_or_else(|_| "unknown".into())
        .to_string_lossy()
        .to_string();
    let platform = format!(
        "{}-{} {}",
        std::env::consts::OS,
        std::env::consts::ARCH,
        host
    );

    ResourceSample {
        total_cpu,
        total_mem_mb,
        platform,
        cpu_percent,
        mem_percent,
    }
}

#[cfg(target_os = "linux")]
fn read_meminfo() -> (i64, i32) {
    match std::fs::read_to_string("/proc/meminfo") {
        Ok(meminfo) => parse_meminfo(&meminfo),
        Err(_) => (0, 0),
    }
}

#[cfg(not(target_os = "linux"))]
fn read_meminfo() -> (i64, i32) {
    (0, 0)
}

#[cfg(target_os = "linux")]
fn read_cpu_percent(total_cpu: i32) -> i32 {
    match std::fs::read_to_string("/proc/loadavg") {
        Ok(loadavg) => parse_loadavg(&loadavg, total_cpu),
        Err(_) => 0,
    }
}

#[cfg(not(target_os = "linux"))]
fn read_cpu_percent(_total_cpu: i32) -> i32 {
    0
}

/// 从 /proc/meminfo 提取总内存（MB）与使用率
fn parse_meminfo(meminfo: &str) -> (i64, i32) {
    let mut total_kb = 0i64;
    let mut available_kb = 0i64;
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total_kb = rest
                .split_whitespace()
                .next()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available_kb = rest
                .split_whitespace()
                .next()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
        }
    }
    if total_kb == 0 {
        return (0, 0);
    }
    let used_percent = ((total_kb - available_kb) * 100 / total_kb) as i32;
    (total_kb / 1024, used_percent.clamp(0, 100))
}

/// 用一分钟负载近似CPU使用率
fn parse_loadavg(loadavg: &str, total_cpu: i32) -> i32 {
    let load: f64 = match loadavg.split_whitespace().next().and_then(|v| v.parse().ok()) {
        Some(load) => load,
        None => return 0,
    };
    if total_cpu <= 0 {
        return 0;
    }
    ((load / total_cpu as f64) * 100.0).round().clamp(0.0, 100.0) as i32
}
