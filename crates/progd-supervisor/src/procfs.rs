//! OS introspection: liveness, command lines, resident memory and the
//! process tree. Linux reads `/proc`; other Unix systems fall back to
//! signal-0 probes and report the rest as unavailable.

use progd_process::SystemMemory;

#[cfg(target_os = "linux")]
use std::sync::OnceLock;

#[cfg(target_os = "linux")]
fn page_size() -> u64 {
    static PAGE: OnceLock<u64> = OnceLock::new();
    *PAGE.get_or_init(|| unsafe {
        let v = libc::sysconf(libc::_SC_PAGESIZE);
        if v <= 0 { 4096 } else { v as u64 }
    })
}

pub(crate) fn parse_state(status: &str) -> Option<char> {
    status
        .lines()
        .find_map(|l| l.strip_prefix("State:"))
        .and_then(|rest| rest.trim().chars().next())
}

// Zombie and dead states do not count as alive.
pub(crate) fn state_is_alive(state: char) -> bool {
    !matches!(state, 'Z' | 'X' | 'x')
}

pub(crate) fn parse_vm_rss_kb(status: &str) -> Option<u64> {
    let rest = status.lines().find_map(|l| l.strip_prefix("VmRSS:"))?;
    let mut it = rest.split_whitespace();
    let value: u64 = it.next()?.parse().ok()?;
    match it.next() {
        Some("kB") | None => Some(value),
        _ => None,
    }
}

pub(crate) fn parse_statm_resident_pages(statm: &str) -> Option<u64> {
    statm.split_whitespace().nth(1)?.parse().ok()
}

// Parent pid from `/proc/<pid>/stat`. The comm field may contain spaces
// and parentheses, so fields are counted after the last `)`.
pub(crate) fn parse_stat_ppid(stat: &str) -> Option<u32> {
    let end = stat.rfind(')')?;
    let rest = stat.get((end + 2)..)?;
    rest.split_whitespace().nth(1)?.parse().ok()
}

pub(crate) fn parse_cmdline(raw: &[u8]) -> Vec<String> {
    raw.split(|b| *b == 0)
        .filter(|s| !s.is_empty())
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect()
}

// Computes totals from `/proc/meminfo` (values there are kB; the result is
// bytes). Available is free + buffers + cached.
pub(crate) fn parse_meminfo(text: &str) -> Option<SystemMemory> {
    let (mut total, mut free, mut buffers, mut cached) = (0u64, 0u64, 0u64, 0u64);
    for line in text.lines() {
        let mut fields = line.split_whitespace();
        let (Some(key), Some(value)) = (fields.next(), fields.next()) else {
            continue;
        };
        let value: u64 = value.parse().unwrap_or(0);
        match key {
            "MemTotal:" => total = value,
            "MemFree:" => free = value,
            "Buffers:" => buffers = value,
            "Cached:" => cached = value,
            _ => {}
        }
    }
    if total == 0 {
        return None;
    }

    let available = free.saturating_add(buffers).saturating_add(cached).min(total);
    let used = total - available;
    Some(SystemMemory {
        total: total * 1024,
        available: available * 1024,
        used: used * 1024,
        used_percent: used as f64 / total as f64 * 100.0,
    })
}

#[cfg(target_os = "linux")]
pub async fn is_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    match tokio::fs::read_to_string(format!("/proc/{pid}/status")).await {
        Ok(s) => parse_state(&s).is_some_and(state_is_alive),
        Err(_) => false,
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
pub async fn is_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if rc == 0 {
        return true;
    }
    // EPERM still means the pid exists.
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub async fn is_alive(_pid: u32) -> bool {
    false
}

#[cfg(target_os = "linux")]
pub async fn cmdline(pid: u32) -> Option<Vec<String>> {
    let raw = tokio::fs::read(format!("/proc/{pid}/cmdline")).await.ok()?;
    let argv = parse_cmdline(&raw);
    if argv.is_empty() { None } else { Some(argv) }
}

#[cfg(not(target_os = "linux"))]
pub async fn cmdline(_pid: u32) -> Option<Vec<String>> {
    None
}

#[cfg(target_os = "linux")]
pub async fn rss_kb(pid: u32) -> Option<u64> {
    if let Ok(status) = tokio::fs::read_to_string(format!("/proc/{pid}/status")).await
        && let Some(kb) = parse_vm_rss_kb(&status).filter(|kb| *kb > 0)
    {
        return Some(kb);
    }

    let statm = tokio::fs::read_to_string(format!("/proc/{pid}/statm"))
        .await
        .ok()?;
    let pages = parse_statm_resident_pages(&statm)?;
    Some(pages.saturating_mul(page_size()) / 1024)
}

#[cfg(not(target_os = "linux"))]
pub async fn rss_kb(_pid: u32) -> Option<u64> {
    None
}

#[cfg(target_os = "linux")]
pub async fn system_memory() -> Option<SystemMemory> {
    let text = tokio::fs::read_to_string("/proc/meminfo").await.ok()?;
    parse_meminfo(&text)
}

#[cfg(not(target_os = "linux"))]
pub async fn system_memory() -> Option<SystemMemory> {
    None
}

#[cfg(target_os = "linux")]
pub async fn child_pids(pid: u32) -> Vec<u32> {
    let mut out = Vec::new();
    let Ok(mut dir) = tokio::fs::read_dir("/proc").await else {
        return out;
    };
    while let Ok(Some(entry)) = dir.next_entry().await {
        let Some(candidate) = entry
            .file_name()
            .to_str()
            .and_then(|s| s.parse::<u32>().ok())
        else {
            continue;
        };
        let Ok(stat) = tokio::fs::read_to_string(format!("/proc/{candidate}/stat")).await else {
            continue;
        };
        if parse_stat_ppid(&stat) == Some(pid) {
            out.push(candidate);
        }
    }
    out
}

#[cfg(not(target_os = "linux"))]
pub async fn child_pids(_pid: u32) -> Vec<u32> {
    Vec::new()
}

#[cfg(unix)]
pub fn process_group(pid: u32) -> Option<i32> {
    if pid == 0 || pid > i32::MAX as u32 {
        return None;
    }
    let pgid = unsafe { libc::getpgid(pid as libc::pid_t) };
    if pgid <= 0 { None } else { Some(pgid) }
}

#[cfg(not(unix))]
pub fn process_group(_pid: u32) -> Option<i32> {
    None
}
