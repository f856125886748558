//! Critical-metadata probing via exiftool.
//!
//! Only one field is verified on every conversion: EXIF `DateTimeOriginal`.
//! A missing tool, missing tag, or mismatch never fails a conversion; it
//! only flips `metadata_preserved` and fills the summary.

use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;

use log::debug;

/// The single metadata field whose round-trip is verified.
pub const CRITICAL_TAG: &str = "DateTimeOriginal";

/// Result of a metadata probe.
#[derive(Debug, Clone)]
pub struct MetadataVerdict {
    pub preserved: bool,
    pub summary: String,
}

/// Reads the critical tag from a file with `exiftool -s3`. Returns `None`
/// when exiftool is unavailable, fails, or reports an empty value.
pub fn read_critical_tag(path: &Path) -> Option<String> {
    let output = Command::new("exiftool")
        .arg(format!("-{CRITICAL_TAG}"))
        .arg("-s3")
        .arg(path)
        .output()
        .ok()?;

    if !output.status.success() {
        debug!(
            "exiftool probe failed for {}: exit {:?}",
            path.display(),
            output.status.code()
        );
        return None;
    }

    let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Probes whether an output file carries the critical tag at all. Used by
/// the workflow executor, which has no structured view of what its steps
/// did to the metadata.
pub fn probe_output(output: &Path) -> MetadataVerdict {
    match read_critical_tag(output) {
        Some(value) => MetadataVerdict {
            preserved: true,
            summary: format!("{CRITICAL_TAG}: {value}"),
        },
        None => MetadataVerdict {
            preserved: false,
            summary: format!("no {CRITICAL_TAG} found in output"),
        },
    }
}

/// Verifies that the critical tag round-tripped from `src_value` (read
/// before conversion) into the output file.
pub fn verify_critical_tag(src_value: Option<&str>, output: &Path) -> MetadataVerdict {
    let dst_value = read_critical_tag(output);

    match (src_value, dst_value.as_deref()) {
        (Some(src), Some(dst)) if src == dst => MetadataVerdict {
            preserved: true,
            summary: format!("{CRITICAL_TAG} preserved"),
        },
        (Some(_), Some(_)) => MetadataVerdict {
            preserved: false,
            summary: format!("{CRITICAL_TAG} written but differs"),
        },
        (Some(_), None) => MetadataVerdict {
            preserved: false,
            summary: format!("{CRITICAL_TAG} not found in output"),
        },
        (None, _) => MetadataVerdict {
            preserved: false,
            summary: format!("source has no {CRITICAL_TAG}"),
        },
    }
}

/// Checks whether an executable is reachable through `PATH`.
pub fn tool_available(tool: &str) -> bool {
    let Some(paths) = env::var_os("PATH") else {
        return false;
    };

    env::split_paths(&paths).any(|dir| is_executable(&dir.join(tool)))
}

fn is_executable(path: &PathBuf) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::metadata(path)
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        path.is_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_available_finds_sh() {
        assert!(tool_available("sh"));
    }

    #[test]
    fn test_tool_available_rejects_nonsense() {
        assert!(!tool_available("definitely-not-a-real-tool-mediamorph"));
    }

    #[test]
    fn test_verify_without_source_value() {
        let verdict = verify_critical_tag(None, Path::new("/nonexistent/out.heic"));
        assert!(!verdict.preserved);
        assert!(verdict.summary.contains("source has no"));
    }

    #[test]
    fn test_probe_missing_output() {
        let verdict = probe_output(Path::new("/nonexistent/out.heic"));
        assert!(!verdict.preserved);
    }
}
