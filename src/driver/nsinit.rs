//! The namespace fork and the nsinit second entry: the daemon re-execs
//! itself into a trampoline that completes sandbox setup from inside the
//! new namespaces before exec'ing the runner.
//!
//! The daemon re-executes its own binary rather than continuing in the
//! forked child: forking inside a multi-threaded tokio process and then
//! doing namespace/mount/exec work without an intervening `execve` is the
//! kind of thing that looks fine until it deadlocks on someone else's mutex.

use std::path::{Path, PathBuf};

use crate::config::{NetworkMode, SeccompProfile};
use crate::error::{Result, SandkastenError};

pub const ENV_SESSION_ID: &str = "__SANDKASTEN_NSINIT_SESSION_ID__";
pub const ENV_MNT: &str = "__SANDKASTEN_NSINIT_MNT__";
pub const ENV_NETWORK_MODE: &str = "__SANDKASTEN_NSINIT_NETWORK_MODE__";
pub const ENV_SECCOMP_PROFILE: &str = "__SANDKASTEN_NSINIT_SECCOMP__";

/// Where the `runner` layer's lower directory puts the in-sandbox agent
/// binary (see `driver::overlay::resolve_lowerdirs`).
const RUNNER_BINARY_PATH: &str = "/usr/local/bin/sandkasten-runner";

pub struct SpawnOptions {
    pub session_id: String,
    pub mnt: PathBuf,
    pub network_mode: NetworkMode,
    pub seccomp_profile: SeccompProfile,
}

/// Forks a helper into fresh namespaces, maps its UID/GID identically to the
/// host (0:0:65536), then re-execs the daemon binary with the nsinit
/// sentinel set so the new process's `main()` branches into [`run`].
/// Returns the helper's host-visible PID.
#[cfg(target_os = "linux")]
pub fn spawn(opts: SpawnOptions) -> Result<i32> {
    use nix::sched::{clone, CloneFlags};
    use nix::sys::signal::Signal;

    let mut flags = CloneFlags::CLONE_NEWNS
        | CloneFlags::CLONE_NEWPID
        | CloneFlags::CLONE_NEWUTS
        | CloneFlags::CLONE_NEWIPC
        | CloneFlags::CLONE_NEWUSER;
    if opts.network_mode != NetworkMode::Host {
        flags |= CloneFlags::CLONE_NEWNET;
    }

    const STACK_SIZE: usize = 1024 * 1024;
    let mut stack = vec![0u8; STACK_SIZE];

    let session_id = opts.session_id.clone();
    let mnt = opts.mnt.clone();
    let network_mode = opts.network_mode;
    let seccomp_profile = opts.seccomp_profile;

    let child = move || -> isize {
        if let Err(e) = map_identity_ids() {
            eprintln!("sandkasten: nsinit uid/gid mapping failed: {e}");
            return 1;
        }
        if let Err(e) = reexec_into_nsinit(&session_id, &mnt, network_mode, seccomp_profile) {
            eprintln!("sandkasten: nsinit re-exec failed: {e}");
            return 1;
        }
        unreachable!("execve either replaced this process or returned an error above")
    };

    let pid = unsafe { clone(Box::new(child), &mut stack, flags, Some(Signal::SIGCHLD as i32)) }
        .map_err(|e| SandkastenError::Internal(format!("clone into new namespaces: {e}")))?;

    Ok(pid.as_raw())
}

/// Self-maps the calling process's UID/GID identically onto the new user
/// namespace (`0 0 65536`), as the process that created it. Must run before
/// `execve`: once the sentinel re-exec happens the mapping is already fixed
/// for the lifetime of the namespace.
#[cfg(target_os = "linux")]
fn map_identity_ids() -> Result<()> {
    std::fs::write("/proc/self/setgroups", "deny")?;
    std::fs::write("/proc/self/uid_map", "0 0 65536")?;
    std::fs::write("/proc/self/gid_map", "0 0 65536")?;
    Ok(())
}

#[cfg(target_os = "linux")]
fn reexec_into_nsinit(
    session_id: &str,
    mnt: &Path,
    network_mode: NetworkMode,
    seccomp_profile: SeccompProfile,
) -> Result<()> {
    use std::os::unix::process::CommandExt;

    let exe = std::env::current_exe()
        .map_err(|e| SandkastenError::Internal(format!("resolving current_exe: {e}")))?;

    let err = std::process::Command::new(exe)
        .env(super::NSINIT_SENTINEL_ENV, "1")
        .env(ENV_SESSION_ID, session_id)
        .env(ENV_MNT, mnt)
        .env(ENV_NETWORK_MODE, network_mode_tag(network_mode))
        .env(ENV_SECCOMP_PROFILE, seccomp_profile_tag(seccomp_profile))
        .exec();

    Err(SandkastenError::Internal(format!(
        "execve into nsinit entry never returned control, yet returned: {err}"
    )))
}

fn network_mode_tag(mode: NetworkMode) -> &'static str {
    match mode {
        NetworkMode::None => "none",
        NetworkMode::Bridge => "bridge",
        NetworkMode::Host => "host",
    }
}

fn seccomp_profile_tag(profile: SeccompProfile) -> &'static str {
    match profile {
        SeccompProfile::Off => "off",
        SeccompProfile::Mvp => "mvp",
        SeccompProfile::Strict => "strict",
    }
}

/// The second `main()` entry: runs entirely inside the freshly namespaced,
/// identity-mapped process created by [`spawn`]. Never returns on success —
/// it ends in `execve` into the runner.
#[cfg(target_os = "linux")]
pub fn run() -> Result<()> {
    use nix::mount::{mount, umount2, MntFlags, MsFlags};
    use nix::unistd::sethostname;

    let session_id = std::env::var(ENV_SESSION_ID)
        .map_err(|_| SandkastenError::Internal(format!("{ENV_SESSION_ID} not set")))?;
    let mnt = PathBuf::from(
        std::env::var(ENV_MNT).map_err(|_| SandkastenError::Internal(format!("{ENV_MNT} not set")))?,
    );
    let seccomp_profile = match std::env::var(ENV_SECCOMP_PROFILE).as_deref() {
        Ok("off") => SeccompProfile::Off,
        Ok("strict") => SeccompProfile::Strict,
        _ => SeccompProfile::Mvp,
    };

    // 1. sethostname("sk-<id[0:8]>")
    let id8 = &session_id[..session_id.len().min(8)];
    sethostname(format!("sk-{id8}"))
        .map_err(|e| SandkastenError::Internal(format!("sethostname: {e}")))?;

    // 2. Make `/` mount propagation private, recursively.
    mount(
        Option::<&str>::None,
        "/",
        Option::<&str>::None,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        Option::<&str>::None,
    )
    .map_err(|e| SandkastenError::Internal(format!("making / private: {e}")))?;

    // 3. Bind-mount mnt onto itself, pivot_root, detach and drop .oldroot.
    mount(
        Some(&mnt),
        &mnt,
        Option::<&str>::None,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        Option::<&str>::None,
    )
    .map_err(|e| SandkastenError::Internal(format!("bind-mounting mnt onto itself: {e}")))?;
    mount(
        Option::<&str>::None,
        &mnt,
        Option::<&str>::None,
        MsFlags::MS_PRIVATE,
        Option::<&str>::None,
    )
    .map_err(|e| SandkastenError::Internal(format!("making mnt private: {e}")))?;

    let oldroot = mnt.join(".oldroot");
    nix::unistd::pivot_root(&mnt, &oldroot)
        .map_err(|e| SandkastenError::Internal(format!("pivot_root: {e}")))?;
    nix::unistd::chdir("/").map_err(|e| SandkastenError::Internal(format!("chdir /: {e}")))?;
    umount2("/.oldroot", MntFlags::MNT_DETACH)
        .map_err(|e| SandkastenError::Internal(format!("detach-unmounting .oldroot: {e}")))?;
    let _ = std::fs::remove_dir("/.oldroot");

    // 4. Mount proc and a fresh devpts instance.
    std::fs::create_dir_all("/proc")?;
    mount(
        Some("proc"),
        "/proc",
        Some("proc"),
        MsFlags::empty(),
        Option::<&str>::None,
    )
    .map_err(|e| SandkastenError::Internal(format!("mounting /proc: {e}")))?;

    std::fs::create_dir_all("/dev/pts")?;
    mount(
        Some("devpts"),
        "/dev/pts",
        Some("devpts"),
        MsFlags::empty(),
        Some("newinstance,ptmxmode=0666,mode=620,gid=5"),
    )
    .map_err(|e| SandkastenError::Internal(format!("mounting /dev/pts: {e}")))?;

    // 5. No new privileges.
    if unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) } != 0 {
        return Err(SandkastenError::Internal(
            "PR_SET_NO_NEW_PRIVS failed".to_string(),
        ));
    }

    // 6. Seccomp filter.
    super::seccomp::install(seccomp_profile)?;

    // 7. Drop the fixed capability bounding set.
    super::caps::drop_bounding_capabilities()?;

    // 8. setgid/setuid to 1000:1000.
    nix::unistd::setgid(nix::unistd::Gid::from_raw(1000))
        .map_err(|e| SandkastenError::Internal(format!("setgid: {e}")))?;
    nix::unistd::setuid(nix::unistd::Uid::from_raw(1000))
        .map_err(|e| SandkastenError::Internal(format!("setuid: {e}")))?;

    // 9. execve into the runner.
    exec_runner()
}

#[cfg(target_os = "linux")]
fn exec_runner() -> Result<()> {
    use std::ffi::CString;
    use nix::unistd::execve;

    let path = CString::new(RUNNER_BINARY_PATH).unwrap();
    let argv = [path.clone()];
    let envp = [
        CString::new("PATH=/usr/local/bin:/usr/bin:/bin").unwrap(),
        CString::new("HOME=/home/sandbox").unwrap(),
        CString::new("TERM=xterm-256color").unwrap(),
        CString::new("LANG=C.UTF-8").unwrap(),
    ];
    let err = execve(&path, &argv, &envp)
        .map_err(|e| SandkastenError::Internal(format!("execve into runner: {e}")));
    err.map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_mode_tags_round_trip_through_strings() {
        assert_eq!(network_mode_tag(NetworkMode::Bridge), "bridge");
        assert_eq!(network_mode_tag(NetworkMode::Host), "host");
        assert_eq!(network_mode_tag(NetworkMode::None), "none");
    }

    #[test]
    fn seccomp_profile_tags_round_trip_through_strings() {
        assert_eq!(seccomp_profile_tag(SeccompProfile::Off), "off");
        assert_eq!(seccomp_profile_tag(SeccompProfile::Strict), "strict");
        assert_eq!(seccomp_profile_tag(SeccompProfile::Mvp), "mvp");
    }
}
