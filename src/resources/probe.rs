//! Environment probe.
//!
//! Reads `/proc/meminfo`, the cgroup memory limit, core count, effective uid
//! and a few well-known markers to classify where the build is running.
//! Every source has a fallback; probing never fails.

use std::fmt;
use std::fs;
use std::path::Path;

const MEMINFO: &str = "/proc/meminfo";
const CGROUP_V2_MAX: &str = "/sys/fs/cgroup/memory.max";
const CGROUP_V2_CURRENT: &str = "/sys/fs/cgroup/memory.current";
const CGROUP_V1_LIMIT: &str = "/sys/fs/cgroup/memory/memory.limit_in_bytes";
const CGROUP_V1_USAGE: &str = "/sys/fs/cgroup/memory/memory.usage_in_bytes";

/// cgroup v1 reports "no limit" as a page-rounded `i64::MAX`.
const CGROUP_UNLIMITED: u64 = 1 << 60;

/// Where the build is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionContext {
    Workstation,
    Container,
    Ci,
}

impl ExecutionContext {
    pub fn slug(self) -> &'static str {
        match self {
            ExecutionContext::Workstation => "workstation",
            ExecutionContext::Container => "container",
            ExecutionContext::Ci => "ci",
        }
    }
}

impl fmt::Display for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

/// Point-in-time view of the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceSnapshot {
    pub context: ExecutionContext,
    /// Bytes usable by the build, after any cgroup limit.
    pub available_memory: u64,
    pub core_count: usize,
    /// Effective uid 0.
    pub privileged: bool,
}

/// Probe the running host.
pub fn probe() -> ResourceSnapshot {
    let context = detect_context(
        |key| std::env::var(key).ok(),
        |path| Path::new(path).exists(),
        fs::read_to_string("/proc/1/cgroup").ok().as_deref(),
    );

    let host_available = fs::read_to_string(MEMINFO)
        .ok()
        .and_then(|text| parse_meminfo_available(&text));
    let cgroup_headroom = cgroup_headroom();
    let available_memory = match (host_available, cgroup_headroom) {
        (Some(host), Some(cgroup)) => host.min(cgroup),
        (Some(host), None) => host,
        (None, Some(cgroup)) => cgroup,
        (None, None) => {
            log::warn!("[probe] could not read available memory; assuming 0 bytes");
            0
        }
    };

    let core_count = match std::thread::available_parallelism() {
        Ok(n) => n.get(),
        Err(e) => {
            log::warn!("[probe] could not detect CPU count ({e}); assuming 1 core");
            1
        }
    };

    let privileged = nix::unistd::geteuid().is_root();

    let snapshot = ResourceSnapshot {
        context,
        available_memory,
        core_count,
        privileged,
    };
    log::debug!("[probe] {snapshot:?}");
    snapshot
}

/// Classify the execution context. CI wins over container markers.
pub fn detect_context(
    env: impl Fn(&str) -> Option<String>,
    exists: impl Fn(&str) -> bool,
    init_cgroup: Option<&str>,
) -> ExecutionContext {
    let truthy = |key: &str| {
        env(key).is_some_and(|v| !v.is_empty() && v != "0" && !v.eq_ignore_ascii_case("false"))
    };
    if ["CI", "GITHUB_ACTIONS", "GITLAB_CI", "BUILDKITE"]
        .iter()
        .any(|key| truthy(key))
    {
        return ExecutionContext::Ci;
    }

    if exists("/.dockerenv") || exists("/run/.containerenv") || env("container").is_some() {
        return ExecutionContext::Container;
    }
    if let Some(cgroup) = init_cgroup {
        if ["docker", "containerd", "kubepods", "libpod", "lxc"]
            .iter()
            .any(|marker| cgroup.contains(marker))
        {
            return ExecutionContext::Container;
        }
    }
    ExecutionContext::Workstation
}

/// `MemAvailable` in bytes, falling back to `MemFree + Cached` on old kernels.
pub fn parse_meminfo_available(text: &str) -> Option<u64> {
    let field = |name: &str| {
        text.lines().find_map(|line| {
            let rest = line.strip_prefix(name)?.strip_prefix(':')?;
            let kb = rest.split_whitespace().next()?.parse::<u64>().ok()?;
            Some(kb * 1024)
        })
    };
    field("MemAvailable").or_else(|| Some(field("MemFree")? + field("Cached").unwrap_or(0)))
}

/// A cgroup limit file; `None` for `max` or the v1 unlimited sentinel.
pub fn parse_cgroup_limit(text: &str) -> Option<u64> {
    let value = text.trim();
    if value == "max" {
        return None;
    }
    value.parse::<u64>().ok().filter(|v| *v < CGROUP_UNLIMITED)
}

fn cgroup_headroom() -> Option<u64> {
    for (limit_path, usage_path) in [
        (CGROUP_V2_MAX, CGROUP_V2_CURRENT),
        (CGROUP_V1_LIMIT, CGROUP_V1_USAGE),
    ] {
        let Some(limit) = fs::read_to_string(limit_path)
            .ok()
            .and_then(|text| parse_cgroup_limit(&text))
        else {
            continue;
        };
        let usage = fs::read_to_string(usage_path)
            .ok()
            .and_then(|text| text.trim().parse::<u64>().ok())
            .unwrap_or(0);
        return Some(limit.saturating_sub(usage));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const MEMINFO_SAMPLE: &str = "MemTotal:       16303412 kB\nMemFree:         1203456 kB\nMemAvailable:    8388608 kB\nBuffers:          123456 kB\nCached:          4000000 kB\n";

    #[test]
    fn meminfo_available_in_bytes() {
        assert_eq!(
            parse_meminfo_available(MEMINFO_SAMPLE),
            Some(8 * 1024 * 1024 * 1024)
        );
    }

    #[test]
    fn meminfo_falls_back_to_free_plus_cached() {
        let text = "MemTotal: 100 kB\nMemFree: 10 kB\nCached: 5 kB\n";
        assert_eq!(parse_meminfo_available(text), Some(15 * 1024));
        assert_eq!(parse_meminfo_available("garbage"), None);
    }

    #[test]
    fn cgroup_limits() {
        assert_eq!(parse_cgroup_limit("max\n"), None);
        assert_eq!(parse_cgroup_limit("4294967296\n"), Some(4294967296));
        assert_eq!(parse_cgroup_limit("9223372036854771712"), None);
    }

    #[test]
    fn ci_variables_win() {
        let ctx = detect_context(
            |key| (key == "GITHUB_ACTIONS").then(|| "true".to_string()),
            |_| true,
            None,
        );
        assert_eq!(ctx, ExecutionContext::Ci);
    }

    #[test]
    fn container_markers() {
        let ctx = detect_context(|_| None, |path| path == "/run/.containerenv", None);
        assert_eq!(ctx, ExecutionContext::Container);

        let ctx = detect_context(|_| None, |_| false, Some("0::/kubepods/besteffort/pod1\n"));
        assert_eq!(ctx, ExecutionContext::Container);

        let ctx = detect_context(|key| (key == "CI").then(|| "false".to_string()), |_| false, Some("0::/init.scope\n"));
        assert_eq!(ctx, ExecutionContext::Workstation);
    }

    #[test]
    fn probe_reports_at_least_one_core() {
        assert!(probe().core_count >= 1);
    }
}
