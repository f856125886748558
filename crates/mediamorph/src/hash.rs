//! Streaming content hashing and file-stability checks.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use md5::{Digest, Md5};
use thiserror::Error;

use crate::config::DEFAULT_HASH_CHUNK_SIZE;

#[derive(Error, Debug)]
pub enum HashError {
    #[error("failed to read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("file '{path}' did not stabilize")]
    Unstable { path: PathBuf },
}

/// Computes the streaming MD5 digest of a file as a lowercase hex string.
///
/// The file is read in `chunk_size` slices and fed to the digest engine
/// incrementally; the chunk size never changes the resulting digest.
pub fn file_digest(path: &Path, chunk_size: usize) -> Result<String, HashError> {
    let chunk_size = if chunk_size == 0 {
        DEFAULT_HASH_CHUNK_SIZE
    } else {
        chunk_size
    };

    let io_err = |source| HashError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut file = File::open(path).map_err(io_err)?;
    let mut hasher = Md5::new();
    let mut buffer = vec![0u8; chunk_size];

    loop {
        let n = file.read(&mut buffer).map_err(io_err)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Takes a single (size, mtime) sample, or `None` if the file is gone or
/// unreadable.
pub fn stat_sample(path: &Path) -> Option<(u64, SystemTime)> {
    let meta = std::fs::metadata(path).ok()?;
    let mtime = meta.modified().ok()?;
    Some((meta.len(), mtime))
}

/// A file is stable iff two samples taken `delay` apart report identical
/// size and modification time. Disappearance counts as "not stable".
pub fn is_stable(path: &Path, delay: Duration) -> bool {
    let Some(first) = stat_sample(path) else {
        return false;
    };
    std::thread::sleep(delay);
    match stat_sample(path) {
        Some(second) => first == second,
        None => false,
    }
}

/// Waits until the file reports the same size twice in a row, sampling
/// every `delay`, for at most `max_attempts` samples.
pub fn wait_until_stable(
    path: &Path,
    delay: Duration,
    max_attempts: u32,
) -> Result<(), HashError> {
    let mut last_size: Option<u64> = None;

    for _ in 0..max_attempts {
        let (size, _) = stat_sample(path).ok_or_else(|| HashError::Io {
            path: path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "file disappeared"),
        })?;

        if last_size == Some(size) {
            return Ok(());
        }
        last_size = Some(size);
        std::thread::sleep(delay);
    }

    Err(HashError::Unstable {
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_digest_known_value() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("hello.bin");
        std::fs::write(&path, b"hello world").unwrap();

        // md5("hello world")
        assert_eq!(
            file_digest(&path, 8192).unwrap(),
            "5eb63bbbe01eeed093cb22bb8f5acdc3"
        );
    }

    #[test]
    fn test_digest_independent_of_chunk_size() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("data.bin");
        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &payload).unwrap();

        let small = file_digest(&path, 1024).unwrap();
        let medium = file_digest(&path, 8192).unwrap();
        let large = file_digest(&path, 4 * 1024 * 1024).unwrap();

        assert_eq!(small, medium);
        assert_eq!(medium, large);
    }

    #[test]
    fn test_digest_is_lowercase_hex() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("x");
        std::fs::write(&path, b"x").unwrap();

        let digest = file_digest(&path, 0).unwrap();
        assert_eq!(digest.len(), 32);
        assert!(digest
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
    }

    #[test]
    fn test_digest_missing_file() {
        let tmp = TempDir::new().unwrap();
        let err = file_digest(&tmp.path().join("missing"), 8192).unwrap_err();
        assert!(matches!(err, HashError::Io { .. }));
    }

    #[test]
    fn test_stable_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("settled.jpg");
        std::fs::write(&path, b"settled").unwrap();

        assert!(is_stable(&path, Duration::from_millis(50)));
    }

    #[test]
    fn test_missing_file_is_not_stable() {
        let tmp = TempDir::new().unwrap();
        assert!(!is_stable(
            &tmp.path().join("missing.jpg"),
            Duration::from_millis(10)
        ));
    }

    #[test]
    fn test_wait_until_stable_settles() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("file.jpg");
        std::fs::write(&path, b"final content").unwrap();

        wait_until_stable(&path, Duration::from_millis(20), 5).unwrap();
    }

    #[test]
    fn test_wait_until_stable_missing_file() {
        let tmp = TempDir::new().unwrap();
        let err =
            wait_until_stable(&tmp.path().join("missing"), Duration::from_millis(10), 3)
                .unwrap_err();
        assert!(matches!(err, HashError::Io { .. }));
    }
}
