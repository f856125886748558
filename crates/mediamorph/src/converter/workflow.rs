//! Workflow-backed converter: wraps a stored workflow and routes
//! conversions through the executor, recording a run row per execution.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use log::warn;

use crate::db::workflow_repo::{self, NewWorkflowRun, RunCompletion};
use crate::db::{Database, RunStatus, WorkflowRow};
use crate::process::CancelFlag;
use crate::workflow::{self, ExecutionContext, Executor, WorkflowError, WorkflowSpec};

use super::{ConvertError, ConvertOptions, Converter, MetaResult};

/// Output formats recognized when inferring a target extension from the
/// primary output template.
const KNOWN_TARGETS: &[&str] = &["heic", "avif", "webp", "jxl", "png", "jpg"];

pub struct WorkflowConverter {
    row: WorkflowRow,
    spec: WorkflowSpec,
    db: Arc<Database>,
}

impl WorkflowConverter {
    /// Parses and validates the stored spec text; a workflow that does
    /// not validate cannot become a converter.
    pub fn new(row: WorkflowRow, db: Arc<Database>) -> Result<Self, WorkflowError> {
        let spec = workflow::parse_and_validate(&row.spec_yaml)?;
        Ok(Self { row, spec, db })
    }

    pub fn workflow_name(&self) -> &str {
        &self.row.name
    }

    fn execution_context(
        &self,
        src: &Path,
        dst: &Path,
        temp_dir: &Path,
        opts: &ConvertOptions,
    ) -> ExecutionContext {
        ExecutionContext {
            workflow_name: self.row.name.clone(),
            input_file: src.to_path_buf(),
            output_file: dst.to_path_buf(),
            temp_dir: temp_dir.to_path_buf(),
            quality: opts.quality,
            hash_chunk_size: opts.hash_chunk_size,
            extra_variables: BTreeMap::new(),
        }
    }
}

impl Converter for WorkflowConverter {
    fn name(&self) -> String {
        format!("workflow:{}", self.row.name)
    }

    /// Target format inferred from a `<src>-to-<dst>` workflow name, or
    /// from hints in the primary output template, else "unknown".
    fn target_format(&self) -> String {
        if let Some((_, target)) = self.row.name.split_once("-to-") {
            let target = target.trim();
            if !target.is_empty() {
                return target.to_lowercase();
            }
        }

        if let Some(template) = self.spec.outputs.get(workflow::executor::PRIMARY_OUTPUT_KEY) {
            let lowered = template.to_lowercase();
            for target in KNOWN_TARGETS {
                if lowered.contains(&format!(".{target}")) {
                    return target.to_string();
                }
            }
        }

        "unknown".to_string()
    }

    fn can_convert(&self, src: &Path, _mime: Option<&str>) -> bool {
        // The extension gate needs no temp dir or variables.
        if let Some(cc) = &self.spec.can_convert {
            if !cc.extensions.is_empty() {
                let ext = src
                    .extension()
                    .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
                    .unwrap_or_default();
                return cc.extensions.iter().any(|a| a.to_lowercase() == ext);
            }
        } else {
            return true;
        }

        // Probe script: run it in a throwaway temp dir.
        let tmp = match tempfile::Builder::new().prefix("workflow-check-").tempdir() {
            Ok(tmp) => tmp,
            Err(e) => {
                warn!(
                    "can_convert check for workflow '{}' could not create temp dir: {e}",
                    self.row.name
                );
                return false;
            }
        };

        let ctx = ExecutionContext {
            workflow_name: self.row.name.clone(),
            input_file: src.to_path_buf(),
            output_file: tmp.path().join("output"),
            temp_dir: tmp.path().to_path_buf(),
            quality: 90,
            hash_chunk_size: 0,
            extra_variables: BTreeMap::new(),
        };

        let executor = Executor::new(&self.spec, &ctx, crate::process::new_cancel_flag());
        match executor.check_can_convert() {
            Ok(supported) => supported,
            Err(e) => {
                warn!(
                    "can_convert check failed for workflow '{}': {e}",
                    self.row.name
                );
                false
            }
        }
    }

    fn convert(
        &self,
        cancel: &CancelFlag,
        src: &Path,
        dst: &Path,
        opts: &ConvertOptions,
    ) -> Result<MetaResult, ConvertError> {
        let tmp = tempfile::Builder::new()
            .prefix("workflow-")
            .tempdir_in(&opts.temp_dir)
            .map_err(|e| {
                ConvertError::failed(format!("failed to create temp dir: {e}"), String::new())
            })?;

        let ctx = self.execution_context(src, dst, tmp.path(), opts);

        let start_time = Utc::now();
        let job_params = serde_json::json!({ "quality": opts.quality }).to_string();

        // A store failure here loses the run record but not the
        // conversion itself.
        let run_id = match workflow_repo::create_run(
            &self.db,
            &NewWorkflowRun {
                workflow_id: self.row.id,
                workflow_name: self.row.name.clone(),
                file_path: src.to_string_lossy().into_owned(),
                start_time,
                job_params: Some(job_params),
            },
        ) {
            Ok(id) => Some(id),
            Err(e) => {
                warn!("failed to create workflow run record: {e}");
                None
            }
        };

        let result = Executor::new(&self.spec, &ctx, Arc::clone(cancel)).execute();

        if let Some(run_id) = run_id {
            let end_time = Utc::now();
            let completion = RunCompletion {
                status: if result.success {
                    RunStatus::Success
                } else {
                    RunStatus::Failed
                },
                end_time,
                duration_ms: (end_time - start_time).num_milliseconds(),
                exit_code: Some(result.exit_code),
                stdout: result.stdout.clone(),
                stderr: result.stderr.clone(),
                logs: result.logs.clone(),
                metadata_preserved: result.metadata_preserved,
                metadata_summary: Some(result.metadata_summary.clone()),
            };
            if let Err(e) = workflow_repo::complete_run(&self.db, run_id, &completion) {
                warn!("failed to update workflow run record: {e}");
            }
        }

        if result.success {
            Ok(MetaResult {
                metadata_preserved: result.metadata_preserved,
                metadata_summary: result.metadata_summary,
                conversion_log: result.logs,
            })
        } else {
            Err(ConvertError::Failed {
                message: format!(
                    "workflow '{}' failed with exit code {}",
                    self.row.name, result.exit_code
                ),
                log: result.logs,
            })
        }
    }
}

/// Loads all enabled workflows from the store and registers them as
/// converters. Invalid workflows are logged and skipped. Returns the
/// number registered.
pub fn load_workflow_converters(
    registry: &super::ConverterRegistry,
    db: &Arc<Database>,
) -> Result<usize, crate::db::DatabaseError> {
    let workflows = workflow_repo::list_enabled(db)?;
    let mut registered = 0;

    for row in workflows {
        let name = row.name.clone();
        match WorkflowConverter::new(row, Arc::clone(db)) {
            Ok(converter) => {
                registry.register(Arc::new(converter));
                registered += 1;
            }
            Err(e) => {
                warn!("skipping workflow '{name}': {e}");
            }
        }
    }

    Ok(registered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::workflow_repo::NewWorkflow;
    use crate::process::new_cancel_flag;
    use tempfile::TempDir;

    const ECHO_WORKFLOW: &str = r#"
name: txt-to-heic
steps:
  - name: fake-encode
    run: printf converted > {{TMP_OUTPUT}}
outputs:
  output_file: "{{TMP_OUTPUT}}"
"#;

    fn stored(db: &Arc<Database>, name: &str, yaml: &str) -> WorkflowRow {
        workflow_repo::create(
            db,
            &NewWorkflow {
                name: name.to_string(),
                description: String::new(),
                spec_yaml: yaml.to_string(),
                enabled: true,
                created_by: None,
            },
        )
        .unwrap()
    }

    fn options(tmp: &TempDir) -> ConvertOptions {
        ConvertOptions {
            quality: 80,
            preserve_metadata: false,
            temp_dir: tmp.path().to_path_buf(),
            timeout: std::time::Duration::from_secs(60),
            hash_chunk_size: 8192,
        }
    }

    #[test]
    fn test_name_is_prefixed() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let row = stored(&db, "txt-to-heic", ECHO_WORKFLOW);
        let converter = WorkflowConverter::new(row, db).unwrap();

        assert_eq!(converter.name(), "workflow:txt-to-heic");
    }

    #[test]
    fn test_target_format_from_name() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let row = stored(&db, "txt-to-heic", ECHO_WORKFLOW);
        let converter = WorkflowConverter::new(row, db).unwrap();

        assert_eq!(converter.target_format(), "heic");
    }

    #[test]
    fn test_target_format_from_output_hint() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let yaml = r#"
name: plainname
steps:
  - name: s
    run: "true"
outputs:
  output_file: "{{TMP_DIR}}/result.avif"
"#;
        let row = stored(&db, "plainname", yaml);
        let converter = WorkflowConverter::new(row, db).unwrap();

        assert_eq!(converter.target_format(), "avif");
    }

    #[test]
    fn test_target_format_unknown() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let yaml = "name: mystery\nsteps:\n  - name: s\n    run: \"true\"\n";
        let row = stored(&db, "mystery", yaml);
        let converter = WorkflowConverter::new(row, db).unwrap();

        assert_eq!(converter.target_format(), "unknown");
    }

    #[test]
    fn test_invalid_spec_is_rejected() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let row = stored(&db, "broken", "name: broken\nsteps: []\n");

        assert!(WorkflowConverter::new(row, db).is_err());
    }

    #[test]
    fn test_convert_records_successful_run() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let row = stored(&db, "txt-to-heic", ECHO_WORKFLOW);
        let workflow_id = row.id;
        let converter = WorkflowConverter::new(row, Arc::clone(&db)).unwrap();

        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("input.txt");
        std::fs::write(&src, b"source").unwrap();
        let dst = tmp.path().join("out/result.heic");

        let meta = converter
            .convert(&new_cancel_flag(), &src, &dst, &options(&tmp))
            .unwrap();

        assert_eq!(std::fs::read(&dst).unwrap(), b"converted");
        assert!(meta.conversion_log.contains("Workflow execution started"));

        let runs = workflow_repo::list_runs(&db, workflow_id, 10, 0).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Success);
        assert_eq!(runs[0].exit_code, Some(0));
        assert!(runs[0].end_time.unwrap() >= runs[0].start_time);
        assert!(runs[0].job_params.as_ref().unwrap().contains("\"quality\":80"));
    }

    #[test]
    fn test_convert_records_failed_run() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let yaml = r#"
name: always-fails
steps:
  - name: boom
    run: exit 9
"#;
        let row = stored(&db, "always-fails", yaml);
        let workflow_id = row.id;
        let converter = WorkflowConverter::new(row, Arc::clone(&db)).unwrap();

        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("input.txt");
        std::fs::write(&src, b"source").unwrap();
        let dst = tmp.path().join("out/result.heic");

        let err = converter
            .convert(&new_cancel_flag(), &src, &dst, &options(&tmp))
            .unwrap_err();

        assert!(matches!(err, ConvertError::Failed { .. }));
        assert!(err.log().contains("boom") || !err.log().is_empty());
        assert!(!dst.exists());

        let runs = workflow_repo::list_runs(&db, workflow_id, 10, 0).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert_eq!(runs[0].exit_code, Some(9));
    }

    #[test]
    fn test_can_convert_extension_gate_without_probe() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let yaml = r#"
name: png-only
can_convert:
  extensions: [".png"]
steps:
  - name: s
    run: "true"
"#;
        let row = stored(&db, "png-only", yaml);
        let converter = WorkflowConverter::new(row, db).unwrap();

        assert!(converter.can_convert(Path::new("/w/pic.png"), None));
        assert!(!converter.can_convert(Path::new("/w/pic.jpg"), None));
    }

    #[test]
    fn test_can_convert_probe_script() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let yaml = r#"
name: probe-gated
can_convert:
  run: test -f {{INPUT_FILE}}
  timeout: 5
steps:
  - name: s
    run: "true"
"#;
        let row = stored(&db, "probe-gated", yaml);
        let converter = WorkflowConverter::new(row, db).unwrap();

        let tmp = TempDir::new().unwrap();
        let existing = tmp.path().join("real.png");
        std::fs::write(&existing, b"x").unwrap();

        assert!(converter.can_convert(&existing, None));
        assert!(!converter.can_convert(&tmp.path().join("ghost.png"), None));
    }

    #[test]
    fn test_load_workflow_converters_skips_invalid() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        stored(&db, "good", ECHO_WORKFLOW);
        stored(&db, "bad", "name: bad\nsteps: []\n");

        let registry = super::super::ConverterRegistry::new();
        let count = load_workflow_converters(&registry, &db).unwrap();

        assert_eq!(count, 1);
        assert!(registry.get("workflow:good").is_some());
        assert!(registry.get("workflow:bad").is_none());
    }
}
