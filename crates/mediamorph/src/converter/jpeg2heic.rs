//! Built-in JPEG-to-HEIC converter.
//!
//! Encoding is delegated to `heif-enc`; metadata transfer and
//! verification to `exiftool`. Both run as child processes through the
//! shared shell runner, so quality, timeout, and cancellation behave the
//! same as for workflow steps.

use std::fmt::Write as _;
use std::path::Path;
use std::time::{Duration, Instant};

use log::debug;

use crate::metadata;
use crate::process::{run_shell, shell_quote, CancelFlag, ShellCommand};
use crate::{fsops, hash};

use super::{ConvertError, ConvertOptions, Converter, MetaResult};

const STABILITY_PROBE_DELAY: Duration = Duration::from_millis(500);
const STABILITY_PROBE_ATTEMPTS: u32 = 5;

pub struct Jpeg2HeicConverter;

impl Jpeg2HeicConverter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for Jpeg2HeicConverter {
    fn default() -> Self {
        Self::new()
    }
}

impl Converter for Jpeg2HeicConverter {
    fn name(&self) -> String {
        "jpeg2heic".to_string()
    }

    fn target_format(&self) -> String {
        "heic".to_string()
    }

    fn can_convert(&self, src: &Path, mime: Option<&str>) -> bool {
        let by_extension = src
            .extension()
            .map(|e| {
                let ext = e.to_string_lossy().to_lowercase();
                ext == "jpg" || ext == "jpeg"
            })
            .unwrap_or(false);

        by_extension || mime.is_some_and(|m| m.contains("jpeg"))
    }

    fn convert(
        &self,
        cancel: &CancelFlag,
        src: &Path,
        dst: &Path,
        opts: &ConvertOptions,
    ) -> Result<MetaResult, ConvertError> {
        let mut log = String::new();
        let deadline = Some(Instant::now() + opts.timeout);

        for tool in ["heif-enc", "exiftool"] {
            if !metadata::tool_available(tool) {
                return Err(ConvertError::failed(
                    format!("required tool not found: {tool}"),
                    log,
                ));
            }
        }

        // The watcher already debounced this file, but a slow copy can
        // still be in flight when the event fires.
        if let Err(e) = hash::wait_until_stable(src, STABILITY_PROBE_DELAY, STABILITY_PROBE_ATTEMPTS)
        {
            return Err(ConvertError::failed(format!("source not stable: {e}"), log));
        }

        let source_tag = metadata::read_critical_tag(src);
        if let Some(tag) = &source_tag {
            let _ = writeln!(log, "source {}: {tag}", metadata::CRITICAL_TAG);
        } else {
            let _ = writeln!(log, "source has no {}", metadata::CRITICAL_TAG);
        }

        let tmp = tempfile::Builder::new()
            .prefix("jpeg2heic-")
            .tempdir_in(&opts.temp_dir)
            .map_err(|e| {
                ConvertError::failed(format!("failed to create temp dir: {e}"), log.clone())
            })?;
        let tmp_output = tmp.path().join("output.heic");

        let quality = if (1..=100).contains(&opts.quality) {
            opts.quality
        } else {
            85
        };

        let encode = format!(
            "heif-enc -q {quality} -o {} {}",
            shell_quote(&tmp_output.to_string_lossy()),
            shell_quote(&src.to_string_lossy()),
        );
        let outcome = run_shell(&ShellCommand {
            command: &encode,
            workdir: tmp.path(),
            envs: &[],
            deadline,
            cancel: Some(cancel),
        })
        .map_err(|e| ConvertError::failed(format!("failed to spawn heif-enc: {e}"), log.clone()))?;

        let _ = writeln!(log, "heif-enc output:\n{}{}", outcome.stdout, outcome.stderr);

        if !outcome.success() {
            let reason = if outcome.timed_out {
                "heif-enc timed out".to_string()
            } else if outcome.cancelled {
                "conversion cancelled".to_string()
            } else {
                format!("heif-enc failed with exit code {}", outcome.exit_code)
            };
            return Err(ConvertError::failed(reason, log));
        }

        if !tmp_output.exists() {
            return Err(ConvertError::failed(
                "heif-enc did not create an output file",
                log,
            ));
        }

        // Copy metadata into the encoded file. Failures here degrade to
        // metadata_preserved=false rather than failing the conversion.
        let tags = if opts.preserve_metadata {
            "-all:all"
        } else {
            // Only the critical field.
            "-DateTimeOriginal"
        };
        let inject = format!(
            "exiftool -overwrite_original -TagsFromFile {} {} {}",
            shell_quote(&src.to_string_lossy()),
            tags,
            shell_quote(&tmp_output.to_string_lossy()),
        );
        match run_shell(&ShellCommand {
            command: &inject,
            workdir: tmp.path(),
            envs: &[],
            deadline,
            cancel: Some(cancel),
        }) {
            Ok(inject_outcome) if !inject_outcome.success() => {
                let _ = writeln!(
                    log,
                    "warning: exiftool metadata copy failed (exit {}):\n{}",
                    inject_outcome.exit_code, inject_outcome.stderr
                );
            }
            Ok(_) => {}
            Err(e) => {
                let _ = writeln!(log, "warning: exiftool spawn failed: {e}");
            }
        }

        let verdict = metadata::verify_critical_tag(source_tag.as_deref(), &tmp_output);
        let _ = writeln!(log, "metadata: {}", verdict.summary);

        // Atomic publish. The destination picked by the worker is
        // re-checked here in case it appeared while encoding.
        if let Some(parent) = dst.parent() {
            fsops::ensure_dir(parent).map_err(|e| {
                ConvertError::failed(
                    format!("failed to create destination directory: {e}"),
                    log.clone(),
                )
            })?;
        }
        let final_dst = fsops::unique_destination(dst);
        fsops::move_file(&tmp_output, &final_dst).map_err(|e| {
            ConvertError::failed(
                format!("failed to move output into place: {e}"),
                log.clone(),
            )
        })?;

        debug!("converted {} -> {}", src.display(), final_dst.display());
        let _ = writeln!(log, "wrote {}", final_dst.display());

        Ok(MetaResult {
            metadata_preserved: verdict.preserved,
            metadata_summary: verdict.summary,
            conversion_log: log,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity() {
        let converter = Jpeg2HeicConverter::new();
        assert_eq!(converter.name(), "jpeg2heic");
        assert_eq!(converter.target_format(), "heic");
    }

    #[test]
    fn test_can_convert_by_extension() {
        let converter = Jpeg2HeicConverter::new();

        assert!(converter.can_convert(Path::new("/w/a.jpg"), None));
        assert!(converter.can_convert(Path::new("/w/a.JPEG"), None));
        assert!(!converter.can_convert(Path::new("/w/a.png"), None));
        assert!(!converter.can_convert(Path::new("/w/noext"), None));
    }

    #[test]
    fn test_can_convert_by_mime() {
        let converter = Jpeg2HeicConverter::new();
        assert!(converter.can_convert(Path::new("/w/upload"), Some("image/jpeg")));
        assert!(!converter.can_convert(Path::new("/w/upload"), Some("image/png")));
    }
}
