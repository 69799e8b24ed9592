//! Stream a `tar.{gz,xz,plain}` archive into a rootfs directory, preserving
//! entry kinds (C2).
//!
//! Format is inferred purely from the archive's filename suffix, and
//! extraction follows `tar::EntryType` dispatch in the same shape as
//! `tar/import.rs`'s object-type matching, generalized from ostree objects
//! to a full filesystem tree and hardened against the partial-failure
//! policy in the design doc: directory/link failures are recorded and
//! skipped, a regular-file write failure aborts the whole extraction.

use crate::error::{DaemonError, Result};
use std::ffi::OsStr;
use std::fs::{self, File};
use std::io::Read;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

/// A directory/link creation failure that extraction tolerated.
#[derive(Debug, Clone)]
pub struct SkippedEntry {
    /// The archive-relative name of the entry that was skipped.
    pub name: String,
    /// A short description of why it was skipped.
    pub reason: String,
}

/// Summary of a completed extraction.
#[derive(Debug, Default)]
pub struct ExtractReport {
    /// Entries whose directory/link creation failed and was tolerated.
    pub skipped: Vec<SkippedEntry>,
}

/// The archive formats this extractor recognizes, inferred by filename
/// suffix only (per the design doc).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Gzip,
    Xz,
    Plain,
}

fn detect_format(path: &Path) -> Format {
    let name = path
        .file_name()
        .and_then(OsStr::to_str)
        .unwrap_or_default()
        .to_ascii_lowercase();
    if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        Format::Gzip
    } else if name.ends_with(".tar.xz") || name.ends_with(".txz") {
        Format::Xz
    } else {
        Format::Plain
    }
}

/// Extract `archive_path` into `target_dir`, creating it if necessary.
///
/// This is restartable: running it twice over the same target is
/// idempotent modulo any mutable state the guest itself has written into
/// the tree in between (invariant 6 / S3 in the design doc).
#[fn_error_context::context("extracting {archive_path:?} into {target_dir:?}")]
pub fn extract_archive(archive_path: &Path, target_dir: &Path) -> Result<ExtractReport> {
    fs::create_dir_all(target_dir)
        .map_err(|e| DaemonError::Archive(format!("creating target dir: {e}")))?;

    let file = File::open(archive_path)
        .map_err(|e| DaemonError::Archive(format!("opening {}: {e}", archive_path.display())))?;

    match detect_format(archive_path) {
        Format::Gzip => {
            let reader = flate2::read::GzDecoder::new(file);
            extract_from(tar::Archive::new(reader), target_dir)
        }
        Format::Xz => {
            let reader = xz2::read::XzDecoder::new(file);
            extract_from(tar::Archive::new(reader), target_dir)
        }
        Format::Plain => extract_from(tar::Archive::new(file), target_dir),
    }
}

fn extract_from<R: Read>(mut archive: tar::Archive<R>, target_dir: &Path) -> Result<ExtractReport> {
    let mut report = ExtractReport::default();
    let entries = archive
        .entries()
        .map_err(|e| DaemonError::Archive(format!("reading archive entries: {e}")))?;

    for entry in entries {
        let mut entry = entry.map_err(|e| DaemonError::Archive(format!("bad entry: {e}")))?;
        let raw_path = entry
            .path()
            .map_err(|e| DaemonError::Archive(format!("bad entry path: {e}")))?
            .into_owned();
        let Some(name) = normalize_name(&raw_path) else {
            continue;
        };
        let out_path = target_dir.join(&name);
        let kind = entry.header().entry_type();
        let mode = entry.header().mode().unwrap_or(0o644);

        let result = match kind {
            tar::EntryType::Directory => create_directory(&out_path),
            tar::EntryType::Symlink => {
                let target = entry
                    .link_name()
                    .ok()
                    .flatten()
                    .map(|p| p.into_owned())
                    .unwrap_or_default();
                create_symlink(&out_path, &target)
            }
            tar::EntryType::Link => {
                let linkname = entry
                    .link_name()
                    .ok()
                    .flatten()
                    .map(|p| p.into_owned())
                    .unwrap_or_default();
                create_hardlink(&out_path, target_dir, &linkname)
            }
            tar::EntryType::Regular => {
                write_regular_file(&mut entry, &out_path, mode)
                    .map_err(|e| DaemonError::Archive(format!("{name}: {e}")))?;
                continue;
            }
            _ => continue,
        };

        if let Err(reason) = result {
            report.skipped.push(SkippedEntry { name, reason });
        }
    }

    Ok(report)
}

/// Strip a leading `./` and skip empty names.
fn normalize_name(path: &Path) -> Option<String> {
    let s = path.to_string_lossy();
    let s = s.strip_prefix("./").unwrap_or(&s);
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

fn create_directory(out_path: &Path) -> std::result::Result<(), String> {
    match fs::create_dir_all(out_path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e.to_string()),
    }
}

fn ensure_parent(out_path: &Path) -> std::result::Result<(), String> {
    if let Some(parent) = out_path.parent() {
        fs::create_dir_all(parent).map_err(|e| e.to_string())?;
    }
    Ok(())
}

fn remove_existing(out_path: &Path) {
    // Best effort: tolerate a missing entry, a plain file, or a symlink.
    let _ = fs::symlink_metadata(out_path).and_then(|meta| {
        if meta.is_dir() {
            fs::remove_dir_all(out_path)
        } else {
            fs::remove_file(out_path)
        }
    });
}

fn create_symlink(out_path: &Path, target: &Path) -> std::result::Result<(), String> {
    ensure_parent(out_path)?;
    remove_existing(out_path);
    std::os::unix::fs::symlink(target, out_path).map_err(|e| e.to_string())
}

fn create_hardlink(
    out_path: &Path,
    target_dir: &Path,
    linkname: &Path,
) -> std::result::Result<(), String> {
    ensure_parent(out_path)?;
    remove_existing(out_path);
    let src = target_dir.join(linkname);
    fs::hard_link(&src, out_path).map_err(|e| e.to_string())
}

fn write_regular_file<R: Read>(
    entry: &mut tar::Entry<R>,
    out_path: &Path,
    mode: u32,
) -> std::io::Result<()> {
    if let Some(parent) = out_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut out = File::create(out_path)?;
    std::io::copy(entry, &mut out)?;
    if mode & 0o111 != 0 {
        let mut perms = out.metadata()?.permissions();
        perms.set_mode(perms.mode() | 0o111);
        fs::set_permissions(out_path, perms)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;

    fn path_for_tar_name(name: &str) -> PathBuf {
        PathBuf::from(name)
    }

    fn build_archive() -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());

        let mut dir_header = tar::Header::new_gnu();
        dir_header.set_entry_type(tar::EntryType::Directory);
        dir_header.set_path("a/").unwrap();
        dir_header.set_size(0);
        dir_header.set_mode(0o755);
        dir_header.set_cksum();
        builder.append(&dir_header, std::io::empty()).unwrap();

        let content = b"hi";
        let mut file_header = tar::Header::new_gnu();
        file_header.set_path("a/b").unwrap();
        file_header.set_size(content.len() as u64);
        file_header.set_mode(0o755);
        file_header.set_cksum();
        builder.append(&file_header, &content[..]).unwrap();

        let mut link_header = tar::Header::new_gnu();
        link_header.set_entry_type(tar::EntryType::Symlink);
        link_header.set_path("a/c").unwrap();
        link_header.set_link_name("b").unwrap();
        link_header.set_size(0);
        link_header.set_mode(0o777);
        link_header.set_cksum();
        builder.append(&link_header, std::io::empty()).unwrap();

        builder.into_inner().unwrap()
    }

    #[test]
    fn extracts_dir_file_and_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("test.tar");
        let mut f = File::create(&archive_path).unwrap();
        f.write_all(&build_archive()).unwrap();

        let target = dir.path().join("out");
        let report = extract_archive(&archive_path, &target).unwrap();
        assert!(report.skipped.is_empty());

        let b = target.join("a/b");
        assert_eq!(fs::read(&b).unwrap(), b"hi");
        assert_eq!(fs::metadata(&b).unwrap().permissions().mode() & 0o111, 0o111);

        let link = target.join("a/c");
        assert_eq!(fs::read_link(&link).unwrap(), path_for_tar_name("b"));
    }

    #[test]
    fn extraction_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("test.tar");
        fs::write(&archive_path, build_archive()).unwrap();

        let target = dir.path().join("out");
        extract_archive(&archive_path, &target).unwrap();
        let first = fs::read(target.join("a/b")).unwrap();
        extract_archive(&archive_path, &target).unwrap();
        let second = fs::read(target.join("a/b")).unwrap();
        assert_eq!(first, second);
        assert_eq!(
            fs::read_link(target.join("a/c")).unwrap(),
            path_for_tar_name("b")
        );
    }

    #[test]
    fn leading_dot_slash_is_stripped() {
        assert_eq!(normalize_name(Path::new("./a/b")).as_deref(), Some("a/b"));
        assert_eq!(normalize_name(Path::new("")), None);
    }
}
