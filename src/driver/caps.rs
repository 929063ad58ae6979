//! Capability bounding-set drops applied inside nsinit, before `execve`
//!.

#[cfg(target_os = "linux")]
use caps::Capability;

/// The fixed set of capabilities dropped from the bounding set in every
/// profile. Listed once here rather than per-profile: the same list is
/// shared across `off`/`mvp`/`strict`. `CAP_SYS_PTRACE` appears twice in the
/// upstream enumeration this was derived from — treated as a spurious
/// duplicate, not a second pass, so it appears once below.
#[cfg(target_os = "linux")]
pub const DROPPED_CAPABILITIES: &[Capability] = &[
    Capability::CAP_NET_RAW,
    Capability::CAP_NET_BIND_SERVICE,
    Capability::CAP_SYS_ADMIN,
    Capability::CAP_SYS_PTRACE,
    Capability::CAP_SYS_MODULE,
    Capability::CAP_SYS_RAWIO,
    Capability::CAP_SYS_TIME,
    Capability::CAP_SYSLOG,
    Capability::CAP_SYS_CHROOT,
    Capability::CAP_SYS_BOOT,
    Capability::CAP_KILL,
    Capability::CAP_DAC_OVERRIDE,
    Capability::CAP_DAC_READ_SEARCH,
    Capability::CAP_FOWNER,
    Capability::CAP_FSETID,
    Capability::CAP_SETGID,
    Capability::CAP_SETUID,
    Capability::CAP_SETPCAP,
    Capability::CAP_LINUX_IMMUTABLE,
    Capability::CAP_NET_BROADCAST,
    Capability::CAP_IPC_LOCK,
    Capability::CAP_IPC_OWNER,
    Capability::CAP_SYS_PACCT,
    Capability::CAP_MKNOD,
];

/// Drops the fixed capability list from the bounding set of the current
/// (nsinit) process. Must run before the final `setuid`/`setgid` drop to an
/// unprivileged UID, since `CAP_SETUID`/`CAP_SETGID` are themselves dropped
/// here.
#[cfg(target_os = "linux")]
pub fn drop_bounding_capabilities() -> crate::error::Result<()> {
    use crate::error::SandkastenError;

    for cap in DROPPED_CAPABILITIES {
        caps::drop(None, caps::CapSet::Bounding, *cap)
            .map_err(|e| SandkastenError::Internal(format!("dropping {cap:?}: {e}")))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropped_list_has_no_accidental_duplicates() {
        let mut sorted: Vec<_> = DROPPED_CAPABILITIES.iter().map(|c| format!("{c:?}")).collect();
        sorted.sort();
        let mut deduped = sorted.clone();
        deduped.dedup();
        assert_eq!(sorted.len(), deduped.len(), "duplicate capability in drop list");
    }
}
