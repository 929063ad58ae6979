//! Resolution of overlayfs lower directories for an image.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::config::Config;
use crate::error::{Result, SandkastenError};

#[derive(Debug, Deserialize, Default)]
struct ImageMeta {
    #[serde(default)]
    layers: Vec<String>,
}

/// Builds the `lowerdir=` list for an image, lowest-priority first, matching
/// overlayfs's own "rightmost wins on conflict is not how lowerdir works"
/// ordering: overlayfs itself treats the *first* entry as the topmost lower.
///
/// If `<data>/images/<image>/meta.json` carries a `layers` array, the lower
/// chain is `<data>/layers/runner/rootfs` followed by each named layer in
/// reverse order; otherwise the lower is the image's own `rootfs` directory.
pub fn resolve_lowerdirs(config: &Config, image: &str) -> Result<Vec<PathBuf>> {
    let image_dir = config.images_dir().join(image);
    let meta_path = image_dir.join("meta.json");

    let lowers = if meta_path.exists() {
        let raw = std::fs::read_to_string(&meta_path)?;
        let meta: ImageMeta = serde_json::from_str(&raw)?;

        let mut chain = vec![config.layers_dir().join("runner").join("rootfs")];
        for layer in meta.layers.iter().rev() {
            chain.push(config.layers_dir().join(layer).join("rootfs"));
        }
        chain
    } else {
        vec![image_dir.join("rootfs")]
    };

    for lower in &lowers {
        if !lower.exists() {
            return Err(SandkastenError::InvalidImage(format!(
                "resolved lower directory does not exist: {}",
                lower.display()
            )));
        }
    }

    Ok(lowers)
}

/// Formats a resolved lower chain as overlayfs's colon-separated `lowerdir=`
/// mount option value.
pub fn lowerdir_option(lowers: &[PathBuf]) -> String {
    lowers
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(":")
}

/// Probes overlayfs availability by mounting a throwaway overlay under a
/// temp directory and immediately tearing it down.
#[cfg(target_os = "linux")]
pub fn probe_overlayfs_available() -> Result<()> {
    use nix::mount::{mount, umount2, MntFlags, MsFlags};

    let probe_root = std::env::temp_dir().join(format!("sandkasten-overlay-probe-{}", std::process::id()));
    let lower = probe_root.join("lower");
    let upper = probe_root.join("upper");
    let work = probe_root.join("work");
    let merged = probe_root.join("merged");
    for dir in [&lower, &upper, &work, &merged] {
        std::fs::create_dir_all(dir)?;
    }

    let opts = format!(
        "lowerdir={},upperdir={},workdir={}",
        lower.display(),
        upper.display(),
        work.display()
    );

    let result = mount(
        Some("overlay"),
        &merged,
        Some("overlay"),
        MsFlags::empty(),
        Some(opts.as_str()),
    );

    if result.is_ok() {
        let _ = umount2(&merged, MntFlags::MNT_DETACH);
    }
    let _ = std::fs::remove_dir_all(&probe_root);

    result.map_err(|e| SandkastenError::Internal(format!("overlayfs unavailable: {e}")))
}

/// Probes that mount propagation can be made private by unsharing a mount
/// namespace and attempting `MS_PRIVATE` on `/` within it.
#[cfg(target_os = "linux")]
pub fn probe_private_propagation() -> Result<()> {
    use nix::sched::{unshare, CloneFlags};

    // This must run in a throwaway child: unshare(CLONE_NEWNS) in a
    // multi-threaded process whose other threads still hold the old mount
    // namespace is confusing to reason about, so we fork once for the probe.
    match unsafe { nix::unistd::fork() } {
        Ok(nix::unistd::ForkResult::Parent { child }) => {
            use nix::sys::wait::{waitpid, WaitStatus};
            match waitpid(child, None) {
                Ok(WaitStatus::Exited(_, 0)) => Ok(()),
                Ok(status) => Err(SandkastenError::Internal(format!(
                    "private mount propagation probe failed: {status:?}"
                ))),
                Err(e) => Err(SandkastenError::Internal(format!(
                    "waitpid on propagation probe: {e}"
                ))),
            }
        }
        Ok(nix::unistd::ForkResult::Child) => {
            use nix::mount::{mount, MsFlags};
            let ok = unshare(CloneFlags::CLONE_NEWNS).is_ok()
                && mount(
                    Option::<&str>::None,
                    Path::new("/"),
                    Option::<&str>::None,
                    MsFlags::MS_REC | MsFlags::MS_PRIVATE,
                    Option::<&str>::None,
                )
                .is_ok();
            std::process::exit(if ok { 0 } else { 1 });
        }
        Err(e) => Err(SandkastenError::Internal(format!("fork for probe: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config_with_data_dir(dir: &Path) -> Config {
        let mut config = Config::default();
        config.data_dir = dir.to_string_lossy().into_owned();
        config
    }

    #[test]
    fn single_lower_when_no_meta_json() {
        let tmp = tempdir().unwrap();
        let config = config_with_data_dir(tmp.path());
        std::fs::create_dir_all(config.images_dir().join("base").join("rootfs")).unwrap();

        let lowers = resolve_lowerdirs(&config, "base").unwrap();
        assert_eq!(lowers.len(), 1);
        assert!(lowers[0].ends_with("base/rootfs"));
    }

    #[test]
    fn layered_meta_json_builds_chain_in_reverse_with_runner_first() {
        let tmp = tempdir().unwrap();
        let config = config_with_data_dir(tmp.path());
        let image_dir = config.images_dir().join("withlayers");
        std::fs::create_dir_all(&image_dir).unwrap();
        std::fs::write(
            image_dir.join("meta.json"),
            r#"{"layers": ["python", "node"]}"#,
        )
        .unwrap();
        std::fs::create_dir_all(config.layers_dir().join("runner").join("rootfs")).unwrap();
        std::fs::create_dir_all(config.layers_dir().join("python").join("rootfs")).unwrap();
        std::fs::create_dir_all(config.layers_dir().join("node").join("rootfs")).unwrap();

        let lowers = resolve_lowerdirs(&config, "withlayers").unwrap();
        assert_eq!(lowers.len(), 3);
        assert!(lowers[0].ends_with("layers/runner/rootfs"));
        assert!(lowers[1].ends_with("layers/node/rootfs"));
        assert!(lowers[2].ends_with("layers/python/rootfs"));
    }

    #[test]
    fn missing_lower_is_an_error() {
        let tmp = tempdir().unwrap();
        let config = config_with_data_dir(tmp.path());
        assert!(resolve_lowerdirs(&config, "missing").is_err());
    }
}
