//! Prepare the rootfs environment before spawning the guest `init` (C6).
//!
//! Device nodes, sockets, the loader symlink, kmsg rotation, and orphan
//! reaping all happen here, in the order the design doc requires: this is
//! the last stop before [`crate::supervisor`] spawns the binding launcher.

use crate::error::{DaemonError, Result};
use std::fs;
use std::path::Path;
use std::process::Command;

/// The rootfs-relative directories that must exist before boot.
const REQUIRED_DIRS: &[&str] = &["dev/input", "dev/socket", "dev/maps"];

/// Ensure `<rootfs>/dev/{input,socket,maps}` and `<app_data>/socket` exist.
pub fn ensure_boot_dirs(rootfs_dir: &Path, app_data: &Path) -> Result<()> {
    for rel in REQUIRED_DIRS {
        fs::create_dir_all(rootfs_dir.join(rel))
            .map_err(|e| DaemonError::Supervisor(format!("creating {rel}: {e}")))?;
    }
    fs::create_dir_all(app_data.join("socket"))
        .map_err(|e| DaemonError::Supervisor(format!("creating app socket dir: {e}")))?;
    Ok(())
}

/// (Re)create `<app_data>/loader64` pointing at `loader_path`. Any prior
/// entry is removed first. Failure here is fatal: boot cannot proceed
/// without the renderer loader in place.
pub fn ensure_loader_symlink(app_data: &Path, loader_path: &Path) -> Result<()> {
    let link = app_data.join("loader64");
    if link.symlink_metadata().is_ok() {
        fs::remove_file(&link)
            .map_err(|e| DaemonError::Supervisor(format!("removing stale loader64: {e}")))?;
    }
    std::os::unix::fs::symlink(loader_path, &link)
        .map_err(|e| DaemonError::Supervisor(format!("linking loader64: {e}")))?;
    Ok(())
}

/// Rotate `<app_data>/kmsg` to `<app_data>/last_kmsg` and leave a fresh,
/// empty `kmsg` in place (scenario S6).
pub fn rotate_kmsg(app_data: &Path) -> Result<()> {
    let kmsg = app_data.join("kmsg");
    let last_kmsg = app_data.join("last_kmsg");
    if kmsg.exists() {
        fs::rename(&kmsg, &last_kmsg)
            .map_err(|e| DaemonError::Supervisor(format!("rotating kmsg: {e}")))?;
    }
    fs::File::create(&kmsg).map_err(|e| DaemonError::Supervisor(format!("creating kmsg: {e}")))?;
    Ok(())
}

/// Forcibly terminate any process whose parent pid is 1 -- orphans left
/// behind by a prior guest "reboot". Best effort: a failure to enumerate
/// or signal a process is logged, not propagated, since it must never
/// block this boot attempt.
pub fn reap_orphans() {
    let Ok(entries) = fs::read_dir("/proc") else {
        tracing::warn!("could not enumerate /proc to reap orphans");
        return;
    };
    for entry in entries.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<i32>().ok()) else {
            continue;
        };
        let stat_path = entry.path().join("stat");
        let Ok(stat) = fs::read_to_string(&stat_path) else {
            continue;
        };
        if let Some(ppid) = parse_ppid(&stat) {
            if ppid == 1 {
                tracing::info!("reaping orphaned guest process pid={pid}");
                if let Err(e) = Command::new("kill").arg("-TERM").arg(pid.to_string()).status() {
                    tracing::warn!("failed to signal orphan pid={pid}: {e}");
                }
            }
        }
    }
}

/// `/proc/<pid>/stat` is `pid (comm) state ppid ...`; the comm field may
/// contain spaces or parens, so split on the last `)` before parsing.
fn parse_ppid(stat: &str) -> Option<i32> {
    let close = stat.rfind(')')?;
    let rest = &stat[close + 1..];
    let mut fields = rest.split_whitespace();
    fields.next()?; // state
    fields.next()?.parse().ok() // ppid
}

/// Run all boot-preparation steps in the order the design doc specifies.
pub fn ensure_boot_files(rootfs_dir: &Path, app_data: &Path, loader_path: &Path) -> Result<()> {
    ensure_boot_dirs(rootfs_dir, app_data)?;
    ensure_loader_symlink(app_data, loader_path)?;
    rotate_kmsg(app_data)?;
    reap_orphans();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_required_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let rootfs = dir.path().join("rootfs");
        let app_data = dir.path().join("app");
        ensure_boot_dirs(&rootfs, &app_data).unwrap();
        for rel in REQUIRED_DIRS {
            assert!(rootfs.join(rel).is_dir());
        }
        assert!(app_data.join("socket").is_dir());
    }

    #[test]
    fn rotates_kmsg() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("kmsg"), b"X").unwrap();
        rotate_kmsg(dir.path()).unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("last_kmsg")).unwrap(), "X");
        assert!(dir.path().join("kmsg").exists());
        assert_eq!(fs::read_to_string(dir.path().join("kmsg")).unwrap(), "");
    }

    #[test]
    fn loader_symlink_replaces_prior_entry() {
        let dir = tempfile::tempdir().unwrap();
        let app_data = dir.path().join("app");
        fs::create_dir_all(&app_data).unwrap();
        let loader = dir.path().join("libtwoyi_renderer.so");
        fs::write(&loader, b"").unwrap();

        let stale_target = dir.path().join("stale.so");
        fs::write(&stale_target, b"").unwrap();
        std::os::unix::fs::symlink(&stale_target, app_data.join("loader64")).unwrap();

        ensure_loader_symlink(&app_data, &loader).unwrap();
        assert_eq!(fs::read_link(app_data.join("loader64")).unwrap(), loader);
    }

    #[test]
    fn parses_ppid_with_parens_in_comm() {
        let stat = "1234 (some (weird) proc) S 1 1234 1234 0 -1 ...";
        assert_eq!(parse_ppid(stat), Some(1));
    }
}
