//! Install, upgrade, or factory-reset a profile's rootfs (C5).
//!
//! The partition-scoped wipe and install-policy table follow the design
//! doc verbatim; extraction itself is delegated to [`crate::archive`].

use crate::archive;
use crate::error::{DaemonError, Result};
use crate::profile::Profile;
use crate::rominfo::RomInfo;
use std::fs;
use std::path::Path;

/// Partitions that are fully owned by the installed ROM and must never
/// survive a re-install.
const WIPED_PARTITIONS: &[&str] = &["system", "vendor"];

/// What [`install`] actually did, so the caller can update any flags it
/// owns (e.g. clearing a persisted `force_install` bit).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    /// Nothing needed to happen.
    NoOp,
    /// First boot: the bundled archive was extracted.
    Factory,
    /// A forced install extracted `bundled`; the caller should clear its
    /// `force_install` flag.
    ForcedBundled,
    /// A forced install extracted the third-party archive; the caller
    /// should clear its `force_install` flag.
    ForcedThirdParty,
    /// The bundled archive was extracted because a newer build is
    /// available.
    Upgrade,
    /// `use_third_party_rom` was set without `force_install`, which is
    /// invalid; nothing was installed.
    ThirdPartyWithoutForce,
}

/// Remove the `system` and `vendor` subdirectories of `rootfs_dir`.
fn wipe_partitions(rootfs_dir: &Path) -> Result<()> {
    for partition in WIPED_PARTITIONS {
        let path = rootfs_dir.join(partition);
        if path.exists() {
            fs::remove_dir_all(&path)
                .map_err(|e| DaemonError::Archive(format!("wiping {partition}: {e}")))?;
        }
    }
    Ok(())
}

/// Install/upgrade/factory-reset the rootfs at `rootfs_dir` per the
/// decision table in the design doc.
#[allow(clippy::too_many_arguments)]
pub fn install(
    rootfs_dir: &Path,
    bundled_archive: &Path,
    third_party_archive: &Path,
    current_exists: bool,
    needs_upgrade: bool,
    force_install: bool,
    use_third_party: bool,
) -> Result<InstallOutcome> {
    wipe_partitions(rootfs_dir)?;

    let outcome = if !current_exists {
        archive::extract_archive(bundled_archive, rootfs_dir)?;
        InstallOutcome::Factory
    } else if force_install && use_third_party {
        archive::extract_archive(third_party_archive, rootfs_dir)?;
        InstallOutcome::ForcedThirdParty
    } else if force_install && !use_third_party {
        archive::extract_archive(bundled_archive, rootfs_dir)?;
        InstallOutcome::ForcedBundled
    } else if !force_install && use_third_party {
        tracing::warn!("use_third_party_rom set without force_install; ignoring");
        InstallOutcome::ThirdPartyWithoutForce
    } else if !force_install && needs_upgrade {
        archive::extract_archive(bundled_archive, rootfs_dir)?;
        InstallOutcome::Upgrade
    } else {
        InstallOutcome::NoOp
    };

    Ok(outcome)
}

/// Host display/locale state written into `vendor/default.prop`.
#[derive(Debug, Clone)]
pub struct HostVendorProps {
    /// e.g. `"en"`.
    pub language: String,
    /// e.g. `"US"`.
    pub country: String,
    /// An IANA timezone name, e.g. `"America/New_York"`.
    pub timezone: String,
    /// LCD density in dpi.
    pub lcd_density: u32,
}

impl Default for HostVendorProps {
    fn default() -> Self {
        Self {
            language: "en".to_string(),
            country: "US".to_string(),
            timezone: "UTC".to_string(),
            lcd_density: 320,
        }
    }
}

/// (Re)write `<rootfs>/vendor/default.prop`. Runs after every materialize
/// and before every boot.
pub fn init(rootfs_dir: &Path, props: &HostVendorProps) -> Result<()> {
    let vendor_dir = rootfs_dir.join("vendor");
    fs::create_dir_all(&vendor_dir)
        .map_err(|e| DaemonError::Archive(format!("creating vendor dir: {e}")))?;
    let contents = format!(
        "persist.sys.language={}\npersist.sys.country={}\npersist.sys.timezone={}\nro.sf.lcd_density={}\n",
        props.language, props.country, props.timezone, props.lcd_density,
    );
    fs::write(vendor_dir.join("default.prop"), contents)
        .map_err(|e| DaemonError::Archive(format!("writing default.prop: {e}")))?;
    Ok(())
}

/// Whether `rootfs_dir` is "initialized": a regular file named `init`
/// exists at its root.
pub fn is_initialized(rootfs_dir: &Path) -> bool {
    rootfs_dir.join("init").is_file()
}

/// Convenience: decide whether an upgrade is needed given the rootfs'
/// current [`RomInfo`] and the bundled archive's.
pub fn profile_needs_upgrade(current: &RomInfo, bundled: &RomInfo) -> bool {
    crate::rominfo::needs_upgrade(current, bundled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn make_bundled_archive(path: &Path) {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_path("init").unwrap();
        header.set_size(0);
        header.set_mode(0o755);
        header.set_cksum();
        builder.append(&header, std::io::empty()).unwrap();
        let bytes = builder.into_inner().unwrap();
        let mut f = fs::File::create(path).unwrap();
        f.write_all(&bytes).unwrap();
    }

    #[test]
    fn first_time_extracts_factory() {
        let dir = tempfile::tempdir().unwrap();
        let rootfs = dir.path().join("rootfs");
        let bundled = dir.path().join("rootfs.tar.gz".replace(".gz", ""));
        make_bundled_archive(&bundled);

        let outcome = install(&rootfs, &bundled, Path::new("/nonexistent"), false, false, false, false).unwrap();
        assert_eq!(outcome, InstallOutcome::Factory);
        assert!(is_initialized(&rootfs));
    }

    #[test]
    fn third_party_without_force_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let rootfs = dir.path().join("rootfs");
        fs::create_dir_all(&rootfs).unwrap();
        fs::write(rootfs.join("init"), b"").unwrap();

        let outcome = install(
            &rootfs,
            Path::new("/nonexistent-bundled"),
            Path::new("/nonexistent-3rd"),
            true,
            false,
            false,
            true,
        )
        .unwrap();
        assert_eq!(outcome, InstallOutcome::ThirdPartyWithoutForce);
    }

    #[test]
    fn partition_wipe_removes_old_contents() {
        let dir = tempfile::tempdir().unwrap();
        let rootfs = dir.path().join("rootfs");
        fs::create_dir_all(rootfs.join("system")).unwrap();
        fs::write(rootfs.join("system/old.so"), b"stale").unwrap();
        fs::write(rootfs.join("init"), b"").unwrap();

        let bundled = dir.path().join("bundled.tar");
        make_bundled_archive(&bundled);

        install(&rootfs, &bundled, Path::new("/nonexistent"), true, true, false, false).unwrap();
        assert!(!rootfs.join("system/old.so").exists());
    }

    #[test]
    fn writes_vendor_default_prop() {
        let dir = tempfile::tempdir().unwrap();
        init(dir.path(), &HostVendorProps::default()).unwrap();
        let contents = fs::read_to_string(dir.path().join("vendor/default.prop")).unwrap();
        assert!(contents.contains("ro.sf.lcd_density=320"));
    }
}
