//! Runtime Driver: the privileged host-side subsystem that builds and tears
//! down a sandbox.

pub mod caps;
pub mod cgroup;
pub mod network;
pub mod nsinit;
pub mod overlay;
pub mod seccomp;

use std::net::Ipv4Addr;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{Config, NetworkMode};
use crate::error::{Result, SandkastenError};
use crate::protocol::{Request, Response};

/// Environment variable whose presence signals the second `main()` entry
///. Checked
/// before any logging or tokio runtime initialisation.
pub const NSINIT_SENTINEL_ENV: &str = "__SANDKASTEN_NSINIT__";

/// Mirrors the runtime-relevant fields persisted at
/// `<data>/sessions/<id>/state.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxState {
    pub session_id: String,
    pub init_pid: i32,
    pub cgroup_path: String,
    pub mnt: String,
    pub runner_sock: String,
    #[serde(default)]
    pub network_ready: bool,
    #[serde(default)]
    pub network_addr: Option<Ipv4Addr>,
}

impl SandboxState {
    fn path(session_dir: &Path) -> PathBuf {
        session_dir.join("state.json")
    }

    pub fn load(session_dir: &Path) -> Result<Option<SandboxState>> {
        let path = Self::path(session_dir);
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&raw)?))
    }

    pub fn save(&self, session_dir: &Path) -> Result<()> {
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(Self::path(session_dir), raw)?;
        Ok(())
    }
}

/// Options accepted by `Driver::create`.
pub struct CreateOptions {
    pub session_id: String,
    pub image: String,
    pub workspace_id: String,
}

/// A step's undo action, captured as it runs so any later failure in
/// `create` can unwind everything already done.
type RollbackAction = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct RollbackLadder {
    actions: Vec<RollbackAction>,
}

impl RollbackLadder {
    fn push(&mut self, action: impl FnOnce() + Send + 'static) {
        self.actions.push(Box::new(action));
    }

    fn unwind(&mut self) {
        while let Some(action) = self.actions.pop() {
            action();
        }
    }
}

pub struct Driver {
    config: Config,
    ip_pool: network::IpPool,
}

impl Driver {
    /// Runs the one-time preflight checks: cgroup v2 mounted, overlayfs
    /// available, mount propagation can be made private. Intended to run
    /// once at daemon startup.
    pub fn new(config: Config) -> Result<Driver> {
        Self::preflight()?;
        Ok(Driver {
            config,
            ip_pool: network::IpPool::new(),
        })
    }

    #[cfg(target_os = "linux")]
    fn preflight() -> Result<()> {
        if !Path::new("/sys/fs/cgroup/cgroup.controllers").exists() {
            return Err(SandkastenError::Internal(
                "cgroup v2 is not mounted at /sys/fs/cgroup".to_string(),
            ));
        }
        overlay::probe_overlayfs_available()?;
        overlay::probe_private_propagation()?;
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn preflight() -> Result<()> {
        Err(SandkastenError::Internal(
            "sandkasten's runtime driver only supports Linux".to_string(),
        ))
    }

    fn session_dir(&self, session_id: &str) -> PathBuf {
        self.config.sessions_dir().join(session_id)
    }

    /// The directory containing every session's on-disk state, used by the
    /// reaper's disk-reconciliation pass.
    pub fn sessions_dir(&self) -> PathBuf {
        self.config.sessions_dir()
    }

    /// Builds a fresh sandbox end to end. On any step failure, unwinds every
    /// prior step via the rollback ladder and returns the triggering error.
    #[cfg(target_os = "linux")]
    pub fn create(&self, opts: CreateOptions) -> Result<SandboxState> {
        let mut ladder = RollbackLadder::default();
        match self.create_inner(&opts, &mut ladder) {
            Ok(state) => Ok(state),
            Err(e) => {
                ladder.unwind();
                Err(e)
            }
        }
    }

    #[cfg(target_os = "linux")]
    fn create_inner(&self, opts: &CreateOptions, ladder: &mut RollbackLadder) -> Result<SandboxState> {
        use nix::mount::{mount, MsFlags};
        use nix::unistd::{chown, Gid, Uid};

        let lowers = overlay::resolve_lowerdirs(&self.config, &opts.image)?;
        let lowerdir_opt = overlay::lowerdir_option(&lowers);

        let session_dir = self.session_dir(&opts.session_id);
        let upper = session_dir.join("upper");
        let work = session_dir.join("work");
        let mnt = session_dir.join("mnt");
        let run = session_dir.join("run");
        for dir in [&upper, &work, &mnt, &run] {
            std::fs::create_dir_all(dir)?;
        }
        {
            let session_dir = session_dir.clone();
            ladder.push(move || {
                let _ = std::fs::remove_dir_all(&session_dir);
            });
        }

        let overlay_opts = format!(
            "lowerdir={},upperdir={},workdir={}",
            lowerdir_opt,
            upper.display(),
            work.display()
        );
        mount(
            Some("overlay"),
            &mnt,
            Some("overlay"),
            MsFlags::empty(),
            Some(overlay_opts.as_str()),
        )
        .map_err(|e| SandkastenError::Internal(format!("mounting overlay: {e}")))?;
        {
            let mnt = mnt.clone();
            ladder.push(move || {
                let _ = nix::mount::umount2(&mnt, nix::mount::MntFlags::MNT_DETACH);
            });
        }

        if self.config.defaults.network_mode != NetworkMode::Bridge {
            bind_mount_file(Path::new("/etc/resolv.conf"), &mnt.join("etc/resolv.conf"))?;
            bind_mount_file(Path::new("/etc/hosts"), &mnt.join("etc/hosts"))?;
        }

        let workspace_mnt = mnt.join("workspace");
        std::fs::create_dir_all(&workspace_mnt)?;
        if !opts.workspace_id.is_empty() {
            let workspace_dir = self.config.workspaces_dir().join(&opts.workspace_id);
            if !workspace_dir.exists() {
                std::fs::create_dir_all(&workspace_dir)?;
                let _ = chown(&workspace_dir, Some(Uid::from_raw(1000)), Some(Gid::from_raw(1000)));
            }
            bind_mount_dir(&workspace_dir, &workspace_mnt)?;
        }

        let run_mnt = mnt.join("run").join("sandkasten");
        std::fs::create_dir_all(&run_mnt)?;
        bind_mount_dir(&run, &run_mnt)?;

        mount_tmpfs(&mnt.join("tmp"), "size=512m")?;
        mount_tmpfs(&mnt.join("dev"), "size=16m")?;
        populate_dev_nodes(&mnt.join("dev"))?;
        let home_sandbox = mnt.join("home").join("sandbox");
        std::fs::create_dir_all(&home_sandbox)?;
        mount_tmpfs(&home_sandbox, "size=128m")?;
        let _ = chown(&home_sandbox, Some(Uid::from_raw(1000)), Some(Gid::from_raw(1000)));

        std::fs::create_dir_all(mnt.join(".oldroot"))?;
        std::fs::create_dir_all(mnt.join("dev").join("pts"))?;

        if self.config.defaults.readonly_rootfs {
            let _ = mount(
                Option::<&str>::None,
                &mnt,
                Option::<&str>::None,
                MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_RDONLY,
                Option::<&str>::None,
            );
        }

        let cgroup_base = cgroup::own_cgroup_dir()?.join("sandkasten");
        let cgroup_path = cgroup::create_session_cgroup(&cgroup_base, &opts.session_id, &self.config.defaults)?;
        {
            let cgroup_path = cgroup_path.clone();
            ladder.push(move || {
                let _ = cgroup::remove_cgroup(&cgroup_path);
            });
        }

        let network_mode = self.config.defaults.network_mode;
        let init_pid = nsinit::spawn(nsinit::SpawnOptions {
            session_id: opts.session_id.clone(),
            mnt: mnt.clone(),
            network_mode,
            seccomp_profile: self.config.security.seccomp,
        })?;
        {
            ladder.push(move || {
                let _ = nix::sys::signal::kill(
                    nix::unistd::Pid::from_raw(init_pid),
                    nix::sys::signal::Signal::SIGKILL,
                );
            });
        }

        cgroup::attach_pid(&cgroup_path, init_pid)?;

        let runner_sock = format!("/proc/{init_pid}/root{}", crate::protocol::RUNNER_SOCK_PATH);
        wait_for_runner_socket(&runner_sock)?;

        let state = SandboxState {
            session_id: opts.session_id.clone(),
            init_pid,
            cgroup_path: cgroup_path.to_string_lossy().into_owned(),
            mnt: mnt.to_string_lossy().into_owned(),
            runner_sock,
            network_ready: false,
            network_addr: None,
        };
        state.save(&session_dir)?;

        info!(session_id = %opts.session_id, init_pid, "sandbox created");
        Ok(state)
    }

    /// Sends one request to the in-sandbox runner, lazily provisioning
    /// bridge networking on first use.
    #[cfg(target_os = "linux")]
    pub fn exec(&self, session_id: &str, request: &Request) -> Result<Response> {
        let session_dir = self.session_dir(session_id);
        let mut state = SandboxState::load(&session_dir)?
            .ok_or(SandkastenError::NotRunning)?;

        if self.config.defaults.network_mode == NetworkMode::Bridge && !state.network_ready {
            network::ensure_bridge_ready()?;
            let addr = self.ip_pool.acquire()?;
            let id8 = &session_id[..session_id.len().min(8)];
            if let Err(e) = network::setup_session_network(id8, state.init_pid, addr) {
                self.ip_pool.release(addr);
                return Err(e);
            }
            // resolv.conf is deferred to this lazy network setup for bridge
            // mode; non-bridge modes bind it at `create` time instead.
            let resolv_dst = Path::new(&state.mnt).join("etc/resolv.conf");
            if let Err(e) = bind_mount_file(Path::new("/etc/resolv.conf"), &resolv_dst) {
                warn!(session_id, error = %e, "failed to bind-mount resolv.conf for bridge networking");
            }
            state.network_ready = true;
            state.network_addr = Some(addr);
            state.save(&session_dir)?;
        }

        dial_and_roundtrip(&state.runner_sock, request)
    }

    /// Tears a sandbox down. Idempotent: safe to call repeatedly, including
    /// on a session the kernel already reaped.
    #[cfg(target_os = "linux")]
    pub fn destroy(&self, session_id: &str) -> Result<()> {
        let session_dir = self.session_dir(session_id);
        let state = SandboxState::load(&session_dir)?;

        let Some(state) = state else {
            let _ = std::fs::remove_dir_all(&session_dir);
            return Ok(());
        };

        if let Some(addr) = state.network_addr {
            self.ip_pool.release(addr);
            let id8 = &session_id[..session_id.len().min(8)];
            network::teardown_session_network(id8);
        }

        terminate_process_tree(state.init_pid, Path::new(&state.cgroup_path));
        let _ = cgroup::remove_cgroup(Path::new(&state.cgroup_path));
        let _ = nix::mount::umount2(Path::new(&state.mnt), nix::mount::MntFlags::MNT_DETACH);
        std::fs::remove_dir_all(&session_dir).ok();
        Ok(())
    }

    /// Checks whether `init_pid` is still alive by signalling it with `0`.
    #[cfg(target_os = "linux")]
    pub fn is_running(&self, session_id: &str) -> Result<bool> {
        let session_dir = self.session_dir(session_id);
        let Some(state) = SandboxState::load(&session_dir)? else {
            return Ok(false);
        };
        Ok(nix::sys::signal::kill(nix::unistd::Pid::from_raw(state.init_pid), None).is_ok())
    }

    /// Rebinds `workspace_id` onto a running sandbox's `/workspace` mount
    /// point (used when promoting a workspace-less pooled session).
    #[cfg(target_os = "linux")]
    pub fn mount_workspace(&self, session_id: &str, workspace_id: &str) -> Result<()> {
        use nix::unistd::{chown, Gid, Uid};

        let session_dir = self.session_dir(session_id);
        let state = SandboxState::load(&session_dir)?.ok_or(SandkastenError::NotRunning)?;

        let workspace_dir = self.config.workspaces_dir().join(workspace_id);
        if !workspace_dir.exists() {
            std::fs::create_dir_all(&workspace_dir)?;
            let _ = chown(&workspace_dir, Some(Uid::from_raw(1000)), Some(Gid::from_raw(1000)));
        }
        bind_mount_dir(&workspace_dir, &Path::new(&state.mnt).join("workspace"))
    }

    /// Reads `memory.current`/`memory.max`/`cpu.stat` from the session's
    /// cgroup.
    pub fn stats(&self, session_id: &str) -> Result<(u64, u64, u64)> {
        let session_dir = self.session_dir(session_id);
        let state = SandboxState::load(&session_dir)?.ok_or(SandkastenError::NotRunning)?;
        cgroup::read_stats(Path::new(&state.cgroup_path))
    }

    pub fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(target_os = "linux")]
fn bind_mount_file(src: &Path, dst: &Path) -> Result<()> {
    use nix::mount::{mount, MsFlags};
    if !src.exists() {
        return Ok(());
    }
    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if !dst.exists() {
        std::fs::write(dst, b"")?;
    }
    mount(Some(src), dst, Option::<&str>::None, MsFlags::MS_BIND, Option::<&str>::None)
        .map_err(|e| SandkastenError::Internal(format!("bind-mounting {}: {e}", src.display())))
}

#[cfg(target_os = "linux")]
fn bind_mount_dir(src: &Path, dst: &Path) -> Result<()> {
    use nix::mount::{mount, MsFlags};
    std::fs::create_dir_all(src)?;
    std::fs::create_dir_all(dst)?;
    mount(Some(src), dst, Option::<&str>::None, MsFlags::MS_BIND, Option::<&str>::None)
        .map_err(|e| SandkastenError::Internal(format!("bind-mounting {}: {e}", src.display())))
}

#[cfg(target_os = "linux")]
fn mount_tmpfs(dst: &Path, opts: &str) -> Result<()> {
    use nix::mount::{mount, MsFlags};
    std::fs::create_dir_all(dst)?;
    mount(
        Some("tmpfs"),
        dst,
        Some("tmpfs"),
        MsFlags::empty(),
        Some(opts),
    )
    .map_err(|e| SandkastenError::Internal(format!("mounting tmpfs at {}: {e}", dst.display())))
}

#[cfg(target_os = "linux")]
fn populate_dev_nodes(dev: &Path) -> Result<()> {
    use nix::sys::stat::{mknod, Mode, SFlag};

    let char_devs: &[(&str, u64, u64)] = &[
        ("null", 1, 3),
        ("zero", 1, 5),
        ("random", 1, 8),
        ("urandom", 1, 9),
        ("tty", 5, 0),
    ];
    for (name, major, minor) in char_devs {
        let path = dev.join(name);
        let dev_t = nix::sys::stat::makedev(*major, *minor);
        let _ = mknod(&path, SFlag::S_IFCHR, Mode::from_bits_truncate(0o666), dev_t);
    }

    for (link, target) in [
        ("ptmx", "pts/ptmx"),
        ("fd", "/proc/self/fd"),
        ("stdin", "/proc/self/fd/0"),
        ("stdout", "/proc/self/fd/1"),
        ("stderr", "/proc/self/fd/2"),
    ] {
        let _ = std::os::unix::fs::symlink(target, dev.join(link));
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn wait_for_runner_socket(sock_path: &str) -> Result<()> {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Ok(meta) = std::fs::symlink_metadata(sock_path) {
            if meta.file_type().is_symlink() {
                return Err(SandkastenError::Internal(format!(
                    "refusing symlinked runner socket path: {sock_path}"
                )));
            }
            if UnixStream::connect(sock_path).is_ok() {
                return Ok(());
            }
        }
        if Instant::now() >= deadline {
            return Err(SandkastenError::Internal(format!(
                "runner socket did not appear within deadline: {sock_path}"
            )));
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

fn dial_and_roundtrip(sock_path: &str, request: &Request) -> Result<Response> {
    use std::io::{BufRead, BufReader, Write};

    let meta = std::fs::symlink_metadata(sock_path)?;
    if meta.file_type().is_symlink() {
        return Err(SandkastenError::Internal(format!(
            "refusing symlinked runner socket path: {sock_path}"
        )));
    }

    let mut stream = UnixStream::connect(sock_path)
        .map_err(|e| SandkastenError::RunnerError(format!("dialing runner socket: {e}")))?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    stream.set_write_timeout(Some(Duration::from_secs(5)))?;

    let mut line = serde_json::to_string(request)?;
    line.push('\n');
    stream
        .write_all(line.as_bytes())
        .map_err(|e| SandkastenError::RunnerError(format!("writing to runner: {e}")))?;

    let mut reader = BufReader::new(stream);
    let mut response_line = String::new();
    reader
        .read_line(&mut response_line)
        .map_err(|e| SandkastenError::RunnerError(format!("reading from runner: {e}")))?;

    let response: Response = serde_json::from_str(response_line.trim_end())?;
    Ok(response)
}

#[cfg(target_os = "linux")]
fn terminate_process_tree(init_pid: i32, cgroup_path: &Path) {
    use nix::sys::signal::{kill, Signal};
    use nix::sys::wait::{waitpid, WaitPidFlag};
    use nix::unistd::Pid;

    let pid = Pid::from_raw(init_pid);
    if kill(pid, Signal::SIGTERM).is_ok() {
        std::thread::sleep(Duration::from_millis(500));
        if kill(pid, None).is_ok() {
            let _ = kill(pid, Signal::SIGKILL);
        }
        let _ = waitpid(pid, Some(WaitPidFlag::WNOHANG));
    }

    if let Ok(procs) = cgroup::read_procs(cgroup_path) {
        for leftover in procs {
            let _ = kill(Pid::from_raw(leftover), Signal::SIGKILL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollback_ladder_unwinds_in_lifo_order() {
        use std::sync::{Arc, Mutex};
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut ladder = RollbackLadder::default();
        for i in 0..3 {
            let order = order.clone();
            ladder.push(move || order.lock().unwrap().push(i));
        }
        ladder.unwind();
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
    }

    #[test]
    fn sandbox_state_round_trips_through_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let state = SandboxState {
            session_id: "abc12345-def".to_string(),
            init_pid: 4242,
            cgroup_path: "/sys/fs/cgroup/sandkasten/abc12345-def".to_string(),
            mnt: tmp.path().join("mnt").to_string_lossy().into_owned(),
            runner_sock: "/proc/4242/root/run/sandkasten/runner.sock".to_string(),
            network_ready: false,
            network_addr: None,
        };
        state.save(tmp.path()).unwrap();
        let loaded = SandboxState::load(tmp.path()).unwrap().unwrap();
        assert_eq!(loaded.init_pid, 4242);
        assert!(!loaded.network_ready);
    }

    #[test]
    fn sandbox_state_missing_file_is_none() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(SandboxState::load(tmp.path()).unwrap().is_none());
    }
}
