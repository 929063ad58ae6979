//! cgroup v2 accounting for a single session.
//!
//! Permission failures writing `memory.max`/`cpu.max`/`pids.max` are logged
//! as warnings, not propagated as errors: the cgroup may not be delegated to
//! this daemon.

use std::path::{Path, PathBuf};

use tracing::warn;

use crate::config::Defaults;
use crate::error::Result;

const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Returns this daemon's own cgroup v2 directory, read from
/// `/proc/self/cgroup`'s unified (`0::`) entry.
pub fn own_cgroup_dir() -> Result<PathBuf> {
    let contents = std::fs::read_to_string("/proc/self/cgroup")?;
    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix("0::") {
            let rest = rest.trim_start_matches('/');
            return Ok(Path::new(CGROUP_ROOT).join(rest));
        }
    }
    Ok(PathBuf::from(CGROUP_ROOT))
}

/// Walks from the cgroup root down to `base`, enabling `+cpu +memory +pids`
/// in each ancestor's `cgroup.subtree_control` so a leaf cgroup further down
/// can use those controllers.
pub fn enable_controllers_to(base: &Path) -> Result<()> {
    let relative = base
        .strip_prefix(CGROUP_ROOT)
        .unwrap_or(base)
        .to_path_buf();

    let mut current = PathBuf::from(CGROUP_ROOT);
    for component in relative.components() {
        let control_file = current.join("cgroup.subtree_control");
        if control_file.exists() {
            if let Err(e) = std::fs::write(&control_file, "+cpu +memory +pids") {
                warn!(path = %control_file.display(), error = %e, "failed to enable cgroup controllers");
            }
        }
        current = current.join(component);
    }
    Ok(())
}

/// Creates the session leaf cgroup directory and writes resource limits.
/// Returns the cgroup's absolute path.
pub fn create_session_cgroup(base: &Path, session_id: &str, limits: &Defaults) -> Result<PathBuf> {
    enable_controllers_to(base)?;

    let leaf = base.join(session_id);
    std::fs::create_dir_all(&leaf)?;

    let mem_bytes = limits.mem_limit_mb.saturating_mul(1024 * 1024);
    write_limit(&leaf.join("memory.max"), &mem_bytes.to_string());
    write_limit(&leaf.join("memory.swap.max"), "0");
    write_limit(&leaf.join("pids.max"), &limits.pids_limit.to_string());

    let cpu_quota = ((limits.cpu_limit * 100_000.0).floor() as i64).max(1);
    write_limit(&leaf.join("cpu.max"), &format!("{cpu_quota} 100000"));

    Ok(leaf)
}

fn write_limit(path: &Path, value: &str) {
    if let Err(e) = std::fs::write(path, value) {
        warn!(path = %path.display(), value, error = %e, "cgroup limit write failed (non-delegated?)");
    }
}

/// Attaches `pid` (and, transitively, everything it later forks) to the
/// session cgroup by writing to `cgroup.procs`.
pub fn attach_pid(cgroup_path: &Path, pid: i32) -> Result<()> {
    std::fs::write(cgroup_path.join("cgroup.procs"), pid.to_string())?;
    Ok(())
}

/// Reads every PID currently attached to the cgroup.
pub fn read_procs(cgroup_path: &Path) -> Result<Vec<i32>> {
    let procs_file = cgroup_path.join("cgroup.procs");
    if !procs_file.exists() {
        return Ok(Vec::new());
    }
    let contents = std::fs::read_to_string(procs_file)?;
    Ok(contents
        .lines()
        .filter_map(|l| l.trim().parse::<i32>().ok())
        .collect())
}

/// Reads `memory.current`/`memory.max` and `cpu.stat`'s `usage_usec` for
/// `Driver::Stats`.
pub fn read_stats(cgroup_path: &Path) -> Result<(u64, u64, u64)> {
    let mem_bytes = read_u64(&cgroup_path.join("memory.current")).unwrap_or(0);
    let mem_limit = read_u64(&cgroup_path.join("memory.max")).unwrap_or(u64::MAX);
    let cpu_usec = read_cpu_usec(&cgroup_path.join("cpu.stat")).unwrap_or(0);
    Ok((mem_bytes, mem_limit, cpu_usec))
}

fn read_u64(path: &Path) -> Option<u64> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn read_cpu_usec(path: &Path) -> Option<u64> {
    let contents = std::fs::read_to_string(path).ok()?;
    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix("usage_usec ") {
            return rest.trim().parse().ok();
        }
    }
    None
}

/// Removes the session's leaf cgroup directory. Best-effort: the kernel
/// refuses `rmdir` while processes remain attached, so callers must kill
/// everything in `cgroup.procs` first.
pub fn remove_cgroup(cgroup_path: &Path) -> Result<()> {
    if cgroup_path.exists() {
        let _ = std::fs::remove_dir(cgroup_path);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_quota_floors_fractional_limits() {
        let limits = Defaults {
            cpu_limit: 1.5,
            ..Defaults::default()
        };
        let quota = ((limits.cpu_limit * 100_000.0).floor() as i64).max(1);
        assert_eq!(quota, 150_000);
    }

    #[test]
    fn cpu_quota_never_goes_below_one() {
        let limits = Defaults {
            cpu_limit: 0.0,
            ..Defaults::default()
        };
        let quota = ((limits.cpu_limit * 100_000.0).floor() as i64).max(1);
        assert_eq!(quota, 1);
    }

    #[test]
    fn read_procs_on_missing_file_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let result = read_procs(tmp.path()).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn read_stats_defaults_when_files_absent() {
        let tmp = tempfile::tempdir().unwrap();
        let (mem, limit, cpu) = read_stats(tmp.path()).unwrap();
        assert_eq!(mem, 0);
        assert_eq!(limit, u64::MAX);
        assert_eq!(cpu, 0);
    }
}
