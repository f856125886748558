//! Filesystem helpers shared by converters and the workflow executor.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;

/// Creates a directory (and parents) with mode 0755. Existing directories
/// are left untouched.
pub fn ensure_dir(path: &Path) -> io::Result<()> {
    if path.is_dir() {
        return Ok(());
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        fs::DirBuilder::new().recursive(true).mode(0o755).create(path)
    }
    #[cfg(not(unix))]
    {
        fs::create_dir_all(path)
    }
}

/// Copies `src` to `dst` (creating parent directories) and fsyncs the
/// destination before returning.
pub fn copy_file_synced(src: &Path, dst: &Path) -> io::Result<()> {
    if let Some(parent) = dst.parent() {
        ensure_dir(parent)?;
    }

    let mut reader = File::open(src)?;
    let mut writer = File::create(dst)?;
    io::copy(&mut reader, &mut writer)?;
    writer.sync_all()
}

/// Moves `src` to `dst`. Tries an atomic `rename` first; when that fails
/// (typically a cross-device move) falls back to copy + fsync + remove.
pub fn move_file(src: &Path, dst: &Path) -> io::Result<()> {
    if fs::rename(src, dst).is_ok() {
        return Ok(());
    }

    copy_file_synced(src, dst)?;
    fs::remove_file(src)
}

/// Returns `candidate` unchanged if nothing exists there, otherwise a
/// variant with a timestamp suffix inserted before the extension so an
/// earlier output is never overwritten.
pub fn unique_destination(candidate: &Path) -> PathBuf {
    if !candidate.exists() {
        return candidate.to_path_buf();
    }

    let stem = candidate
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let stamp = Utc::now().format("%Y%m%dT%H%M%S");

    let file_name = match candidate.extension() {
        Some(ext) => format!("{}_{}.{}", stem, stamp, ext.to_string_lossy()),
        None => format!("{}_{}", stem, stamp),
    };

    candidate.with_file_name(file_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_ensure_dir_creates_nested() {
        let tmp = TempDir::new().unwrap();
        let deep = tmp.path().join("a/b/c");

        ensure_dir(&deep).unwrap();
        assert!(deep.is_dir());

        // Idempotent.
        ensure_dir(&deep).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_ensure_dir_mode() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("perms");
        ensure_dir(&dir).unwrap();

        let mode = fs::metadata(&dir).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[test]
    fn test_copy_file_synced_creates_parents() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src.bin");
        let dst = tmp.path().join("nested/out/dst.bin");
        fs::write(&src, b"payload").unwrap();

        copy_file_synced(&src, &dst).unwrap();

        assert_eq!(fs::read(&dst).unwrap(), b"payload");
        assert!(src.exists());
    }

    #[test]
    fn test_move_file_renames() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src.bin");
        let dst = tmp.path().join("dst.bin");
        fs::write(&src, b"data").unwrap();

        move_file(&src, &dst).unwrap();

        assert!(!src.exists());
        assert_eq!(fs::read(&dst).unwrap(), b"data");
    }

    #[test]
    fn test_unique_destination_free_path() {
        let tmp = TempDir::new().unwrap();
        let candidate = tmp.path().join("photo.heic");

        assert_eq!(unique_destination(&candidate), candidate);
    }

    #[test]
    fn test_unique_destination_suffixes_on_collision() {
        let tmp = TempDir::new().unwrap();
        let candidate = tmp.path().join("photo.heic");
        fs::write(&candidate, b"existing").unwrap();

        let unique = unique_destination(&candidate);

        assert_ne!(unique, candidate);
        let name = unique.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("photo_"));
        assert!(name.ends_with(".heic"));
    }
}
