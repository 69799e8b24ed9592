//! Parse `rom.ini` metadata from an archive or a directory (C3).

use std::io::Read;
use std::path::Path;

/// ROM metadata extracted from `rom.ini`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RomInfo {
    /// The `author` field, or `"unknown"` when absent.
    pub author: String,
    /// The `version` field, or `"unknown"` when absent.
    pub version: String,
    /// The `desc` field, or `"unknown"` when absent.
    pub desc: String,
    /// The `md5` field, or `"unknown"` when absent.
    pub md5: String,
    /// A monotonically increasing build number, or `0` when absent.
    pub code: i64,
}

impl RomInfo {
    /// The sentinel value signaling "no valid info".
    pub fn unknown() -> Self {
        Self {
            author: "unknown".to_string(),
            version: "unknown".to_string(),
            desc: "unknown".to_string(),
            md5: "unknown".to_string(),
            code: 0,
        }
    }

    /// Whether this is real info, i.e. not the [`Self::unknown`] sentinel.
    pub fn is_valid(&self) -> bool {
        *self != Self::unknown()
    }
}

/// `key=value` line parser for `rom.ini`. There are no `[section]` headers
/// in this format, so a general INI crate buys nothing here.
fn parse_ini(contents: &str) -> RomInfo {
    let mut info = RomInfo::unknown();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();
        match key {
            "author" => info.author = value.to_string(),
            "version" => info.version = value.to_string(),
            "desc" => info.desc = value.to_string(),
            "md5" => info.md5 = value.to_string(),
            "code" => info.code = value.parse().unwrap_or(0),
            _ => {}
        }
    }
    info
}

/// Read `rom.ini` directly from a rootfs directory.
pub fn info_from_dir(dir: &Path) -> RomInfo {
    match std::fs::read_to_string(dir.join("rom.ini")) {
        Ok(contents) => parse_ini(&contents),
        Err(_) => RomInfo::unknown(),
    }
}

/// Scan an archive's entries for `rom.ini` (or `./rom.ini`) and parse it.
pub fn info_from_archive(archive_path: &Path) -> RomInfo {
    match scan_archive(archive_path) {
        Ok(Some(info)) => info,
        _ => RomInfo::unknown(),
    }
}

fn scan_archive(archive_path: &Path) -> anyhow::Result<Option<RomInfo>> {
    let file = std::fs::File::open(archive_path)?;
    let name = archive_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();

    if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        scan_tar(tar::Archive::new(flate2::read::GzDecoder::new(file)))
    } else if name.ends_with(".tar.xz") || name.ends_with(".txz") {
        scan_tar(tar::Archive::new(xz2::read::XzDecoder::new(file)))
    } else {
        scan_tar(tar::Archive::new(file))
    }
}

fn scan_tar<R: Read>(mut archive: tar::Archive<R>) -> anyhow::Result<Option<RomInfo>> {
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let name = path.to_string_lossy();
        let name = name.strip_prefix("./").unwrap_or(&name);
        if name == "rom.ini" {
            let mut contents = String::new();
            entry.read_to_string(&mut contents)?;
            return Ok(Some(parse_ini(&contents)));
        }
    }
    Ok(None)
}

/// True iff `current` is [`RomInfo::unknown`] or `bundled` is a strictly
/// newer build (invariant 8).
pub fn needs_upgrade(current: &RomInfo, bundled: &RomInfo) -> bool {
    !current.is_valid() || bundled.code > current.code
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_is_never_valid() {
        assert!(!RomInfo::unknown().is_valid());
    }

    #[test]
    fn parses_key_value_lines() {
        let info = parse_ini("author=twoyi\nversion=1.2\ndesc=AOSP 11\nmd5=abc123\ncode=7\n");
        assert_eq!(info.author, "twoyi");
        assert_eq!(info.code, 7);
        assert!(info.is_valid());
    }

    #[test]
    fn missing_keys_default() {
        let info = parse_ini("author=twoyi\n");
        assert_eq!(info.version, "unknown");
        assert_eq!(info.code, 0);
    }

    #[test]
    fn missing_file_is_unknown() {
        let dir = tempfile::tempdir().unwrap();
        similar_asserts::assert_eq!(info_from_dir(dir.path()), RomInfo::unknown());
    }

    #[test]
    fn upgrade_monotonicity() {
        let unknown = RomInfo::unknown();
        let v1 = RomInfo { code: 1, ..RomInfo::unknown() };
        let v2 = RomInfo { code: 2, ..RomInfo::unknown() };
        assert!(needs_upgrade(&unknown, &v1));
        assert!(needs_upgrade(&v1, &v2));
        assert!(!needs_upgrade(&v2, &v1));
        assert!(!needs_upgrade(&v1, &v1));
    }
}
