//! Seccomp filter profiles installed in nsinit before `execve`.
//!
//! Each profile is a deny-list: the named syscalls resolve to `EPERM`,
//! everything else is allowed. Built with `seccompiler` (the BPF-filter
//! builder used by firecracker-family sandboxes) rather than hand-rolled BPF.

use crate::config::SeccompProfile;
use crate::error::{Result, SandkastenError};

/// Syscalls denied by the `mvp` profile.
const MVP_DENYLIST: &[&str] = &[
    "bpf",
    "userfaultfd",
    "perf_event_open",
    "ptrace",
    "kexec_load",
    "open_by_handle_at",
    "keyctl",
    "add_key",
    "request_key",
    "init_module",
    "finit_module",
    "delete_module",
    "mount",
    "umount2",
    "pivot_root",
];

/// Additional syscalls denied by `strict`, on top of `mvp`.
const STRICT_EXTRA_DENYLIST: &[&str] = &["setns", "unshare"];

fn denylist_for(profile: SeccompProfile) -> Vec<&'static str> {
    match profile {
        SeccompProfile::Off => Vec::new(),
        SeccompProfile::Mvp => MVP_DENYLIST.to_vec(),
        SeccompProfile::Strict => MVP_DENYLIST
            .iter()
            .chain(STRICT_EXTRA_DENYLIST.iter())
            .copied()
            .collect(),
    }
}

#[cfg(target_os = "linux")]
pub fn install(profile: SeccompProfile) -> Result<()> {
    use std::collections::BTreeMap;
    use std::convert::TryInto;

    use seccompiler::{apply_filter, BpfProgram, SeccompAction, SeccompFilter};

    let names = denylist_for(profile);
    if names.is_empty() {
        return Ok(());
    }

    let mut rules = BTreeMap::new();
    for name in names {
        let nr = syscall_number(name)
            .ok_or_else(|| SandkastenError::Internal(format!("unknown syscall name: {name}")))?;
        // An empty rule list means "no conditions" — the syscall matches
        // unconditionally whenever it's invoked.
        rules.insert(nr, Vec::new());
    }

    let filter = SeccompFilter::new(
        rules,
        SeccompAction::Allow,
        SeccompAction::Errno(libc::EPERM as u32),
        std::env::consts::ARCH.try_into().map_err(|_| {
            SandkastenError::Internal("unsupported seccomp target arch".to_string())
        })?,
    )
    .map_err(|e| SandkastenError::Internal(format!("building seccomp filter: {e}")))?;

    let bpf_program: BpfProgram = filter
        .try_into()
        .map_err(|e| SandkastenError::Internal(format!("compiling seccomp filter: {e}")))?;

    apply_filter(&bpf_program)
        .map_err(|e| SandkastenError::Internal(format!("installing seccomp filter: {e}")))
}

#[cfg(target_os = "linux")]
fn syscall_number(name: &str) -> Option<i64> {
    let nr = match name {
        "bpf" => libc::SYS_bpf,
        "userfaultfd" => libc::SYS_userfaultfd,
        "perf_event_open" => libc::SYS_perf_event_open,
        "ptrace" => libc::SYS_ptrace,
        "kexec_load" => libc::SYS_kexec_load,
        "open_by_handle_at" => libc::SYS_open_by_handle_at,
        "keyctl" => libc::SYS_keyctl,
        "add_key" => libc::SYS_add_key,
        "request_key" => libc::SYS_request_key,
        "init_module" => libc::SYS_init_module,
        "finit_module" => libc::SYS_finit_module,
        "delete_module" => libc::SYS_delete_module,
        "mount" => libc::SYS_mount,
        "umount2" => libc::SYS_umount2,
        "pivot_root" => libc::SYS_pivot_root,
        "setns" => libc::SYS_setns,
        "unshare" => libc::SYS_unshare,
        _ => return None,
    };
    Some(nr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn off_profile_has_empty_denylist() {
        assert!(denylist_for(SeccompProfile::Off).is_empty());
    }

    #[test]
    fn strict_is_mvp_plus_setns_unshare() {
        let mvp = denylist_for(SeccompProfile::Mvp);
        let strict = denylist_for(SeccompProfile::Strict);
        assert_eq!(strict.len(), mvp.len() + 2);
        assert!(strict.contains(&"setns"));
        assert!(strict.contains(&"unshare"));
        for name in &mvp {
            assert!(strict.contains(name));
        }
    }

    #[test]
    fn mvp_denylist_matches_spec_exactly() {
        let mvp = denylist_for(SeccompProfile::Mvp);
        assert_eq!(mvp.len(), 15);
        assert!(mvp.contains(&"pivot_root"));
        assert!(mvp.contains(&"mount"));
    }
}
