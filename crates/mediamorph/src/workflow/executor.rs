//! Workflow execution: variable binding, substitution, sequential step
//! execution, output handling, and metadata probing.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::debug;
use regex::Regex;

use crate::process::{
    run_shell, shell_quote, shell_unquote, CancelFlag, ShellCommand,
};
use crate::{fsops, hash, metadata};

use super::spec::{StepSpec, WorkflowSpec};
use super::WorkflowError;

/// The primary output key; its resolved file is copied to the run's
/// destination.
pub const PRIMARY_OUTPUT_KEY: &str = "output_file";

/// Ephemeral per-run state handed to the executor.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub workflow_name: String,
    pub input_file: PathBuf,
    pub output_file: PathBuf,
    pub temp_dir: PathBuf,
    pub quality: u8,
    pub hash_chunk_size: usize,
    /// Caller-supplied bindings. These may add new names but never shadow
    /// the standard ones.
    pub extra_variables: BTreeMap<String, String>,
}

/// Result of a single step.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub step_name: String,
    pub success: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub error: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

/// Result of a whole workflow run.
#[derive(Debug)]
pub struct ExecutionResult {
    pub success: bool,
    pub exit_code: i32,
    pub duration: Duration,
    /// Concatenated per-step stdout, framed by step name.
    pub stdout: String,
    /// Concatenated per-step stderr, framed by step name.
    pub stderr: String,
    /// Human-readable trace of the whole run.
    pub logs: String,
    pub steps: Vec<StepOutcome>,
    pub metadata_preserved: bool,
    pub metadata_summary: String,
    /// Resolved output paths by output key.
    pub output_files: BTreeMap<String, String>,
}

/// Executes one validated workflow spec against one file.
pub struct Executor<'a> {
    spec: &'a WorkflowSpec,
    ctx: &'a ExecutionContext,
    cancel: CancelFlag,
    var_re: Regex,
    variables: BTreeMap<String, String>,
    steps: Vec<StepOutcome>,
    output_files: BTreeMap<String, String>,
    metadata_preserved: bool,
    metadata_summary: String,
    log: String,
}

impl<'a> Executor<'a> {
    pub fn new(spec: &'a WorkflowSpec, ctx: &'a ExecutionContext, cancel: CancelFlag) -> Self {
        Self {
            spec,
            ctx,
            cancel,
            var_re: Regex::new(r"\{\{([A-Z_][A-Z0-9_]*)\}\}").expect("static regex"),
            variables: BTreeMap::new(),
            steps: Vec::new(),
            output_files: BTreeMap::new(),
            metadata_preserved: false,
            metadata_summary: String::new(),
            log: String::new(),
        }
    }

    /// Runs the workflow to completion. Failures (step failure, timeout,
    /// cancellation, output handling) are reported through the result,
    /// never as a panic or early error.
    pub fn execute(mut self) -> ExecutionResult {
        let start = Instant::now();

        self.logln(format_args!(
            "=== Workflow execution started: {} ===",
            self.spec.name
        ));
        self.logln(format_args!("Input file: {}", self.ctx.input_file.display()));
        self.logln(format_args!(
            "Output file: {}",
            self.ctx.output_file.display()
        ));
        self.logln(format_args!("Temp dir: {}", self.ctx.temp_dir.display()));
        self.logln(format_args!("Quality: {}", self.ctx.quality));

        let global_deadline = if self.spec.timeout > 0 {
            self.logln(format_args!("Global timeout: {}s", self.spec.timeout));
            Some(Instant::now() + Duration::from_secs(self.spec.timeout as u64))
        } else {
            self.logln(format_args!("Global timeout: none"));
            None
        };

        if let Err(e) = self.prepare_variables() {
            self.logln(format_args!("ERROR: failed to prepare variables: {e}"));
            return self.finish(false, 1, start);
        }
        self.log_variables();

        let spec = self.spec;
        let total = spec.steps.len();
        for (i, step) in spec.steps.iter().enumerate() {
            self.logln(format_args!("--- Step {}/{}: {} ---", i + 1, total, step.name));

            let outcome = self.run_step(step, global_deadline);
            let failed = !outcome.success;
            let exit_code = outcome.exit_code;
            self.steps.push(outcome);

            if failed {
                self.logln(format_args!(
                    "ERROR: step '{}' failed, aborting workflow",
                    step.name
                ));
                return self.finish(false, exit_code, start);
            }
        }

        self.logln(format_args!("--- Outputs ---"));
        if let Err(message) = self.handle_outputs() {
            self.logln(format_args!("ERROR: {message}"));
            return self.finish(false, 1, start);
        }

        self.logln(format_args!("--- Metadata ---"));
        let verdict = metadata::probe_output(&self.ctx.output_file);
        self.logln(format_args!("Metadata: {}", verdict.summary));
        self.metadata_preserved = verdict.preserved;
        self.metadata_summary = verdict.summary;

        self.finish(true, 0, start)
    }

    /// Decides whether this workflow supports the input file.
    ///
    /// An extension list matches against the input's lowercase extension.
    /// A probe script runs with the standard variables; exit 0 means
    /// supported, any non-zero exit (or timeout) means not supported, and
    /// a spawn failure is an error rather than a negative answer. Absent
    /// `can_convert` means everything is supported.
    pub fn check_can_convert(mut self) -> Result<bool, WorkflowError> {
        let spec = self.spec;
        let Some(cc) = &spec.can_convert else {
            return Ok(true);
        };

        if !cc.extensions.is_empty() {
            let ext = self
                .ctx
                .input_file
                .extension()
                .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
                .unwrap_or_default();
            return Ok(cc
                .extensions
                .iter()
                .any(|allowed| allowed.to_lowercase() == ext));
        }

        let Some(probe) = cc.run.clone().filter(|r| !r.is_empty()) else {
            return Ok(true);
        };

        self.prepare_variables()?;
        let command = self.substitute(&probe);
        let envs = self.env_overlay(&BTreeMap::new());

        if let Err(e) = fsops::ensure_dir(&self.ctx.temp_dir) {
            debug!(
                "can_convert probe could not create temp dir {}: {}",
                self.ctx.temp_dir.display(),
                e
            );
            return Ok(false);
        }

        let outcome = run_shell(&ShellCommand {
            command: &command,
            workdir: &self.ctx.temp_dir,
            envs: &envs,
            deadline: Some(Instant::now() + spec.probe_timeout()),
            cancel: Some(&self.cancel),
        })?;

        Ok(outcome.success())
    }

    /// Seeds the variable map. Standard names are bound last so caller
    /// bindings can never shadow them.
    fn prepare_variables(&mut self) -> Result<(), WorkflowError> {
        let mut vars = self.ctx.extra_variables.clone();

        let input = &self.ctx.input_file;
        let input_dir = input.parent().unwrap_or(Path::new("/")).to_path_buf();
        let parent_dir = input_dir.parent().unwrap_or(Path::new("/")).to_path_buf();
        let basename = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let ext = input
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        let tmp_output = self.ctx.temp_dir.join(
            self.ctx
                .output_file
                .file_name()
                .unwrap_or_else(|| std::ffi::OsStr::new("output")),
        );

        let digest = hash::file_digest(input, self.ctx.hash_chunk_size)?;

        let set = |vars: &mut BTreeMap<String, String>, key: &str, value: String| {
            vars.insert(key.to_string(), value);
        };

        set(&mut vars, "INPUT_FILE", input.to_string_lossy().into_owned());
        set(&mut vars, "INPUT_DIR", input_dir.to_string_lossy().into_owned());
        set(&mut vars, "INPUT_BASENAME", basename);
        set(&mut vars, "INPUT_FILE_EXT", ext);
        set(&mut vars, "PARENT_DIR", parent_dir.to_string_lossy().into_owned());
        set(
            &mut vars,
            "OUTPUT_FILE",
            self.ctx.output_file.to_string_lossy().into_owned(),
        );
        set(
            &mut vars,
            "TMP_DIR",
            self.ctx.temp_dir.to_string_lossy().into_owned(),
        );
        set(&mut vars, "TMP_OUTPUT", tmp_output.to_string_lossy().into_owned());
        set(&mut vars, "FILE_MD5", digest);
        set(&mut vars, "TIMESTAMP", Utc::now().timestamp().to_string());
        set(&mut vars, "QUALITY", self.ctx.quality.to_string());
        set(&mut vars, "CONVERT_QUALITY", self.ctx.quality.to_string());

        self.variables = vars;
        Ok(())
    }

    /// Replaces `{{NAME}}` tokens with shell-quoted bound values. Unknown
    /// names are left untouched; everything outside a token is preserved
    /// byte for byte.
    fn substitute(&self, text: &str) -> String {
        self.var_re
            .replace_all(text, |caps: &regex::Captures<'_>| {
                match self.variables.get(&caps[1]) {
                    Some(value) => shell_quote(value),
                    None => caps[0].to_string(),
                }
            })
            .into_owned()
    }

    /// Spec-level env followed by step-level env, values substituted.
    /// Step entries override spec entries with the same key.
    fn env_overlay(&self, step_env: &BTreeMap<String, String>) -> Vec<(String, String)> {
        let mut merged: BTreeMap<String, String> = BTreeMap::new();
        for (key, value) in &self.spec.env {
            merged.insert(key.clone(), self.substitute(value));
        }
        for (key, value) in step_env {
            merged.insert(key.clone(), self.substitute(value));
        }
        merged.into_iter().collect()
    }

    fn run_step(&mut self, step: &StepSpec, global_deadline: Option<Instant>) -> StepOutcome {
        let start_time = Utc::now();
        let command = self.substitute(&step.run);

        // Paths, unlike command arguments, must not stay shell-quoted.
        let workdir = match &step.workdir {
            Some(raw) => PathBuf::from(shell_unquote(&self.substitute(raw))),
            None => self.ctx.temp_dir.clone(),
        };

        self.logln(format_args!("Command: {command}"));
        self.logln(format_args!("Working directory: {}", workdir.display()));

        let fail = |step: &StepSpec, error: String, start_time: DateTime<Utc>| StepOutcome {
            step_name: step.name.clone(),
            success: false,
            exit_code: 1,
            stdout: String::new(),
            stderr: String::new(),
            error: Some(error),
            start_time,
            end_time: Utc::now(),
        };

        if let Err(e) = fsops::ensure_dir(&workdir) {
            let outcome = fail(
                step,
                format!("failed to create working directory: {e}"),
                start_time,
            );
            self.log_step_outcome(&outcome);
            return outcome;
        }

        let deadline = match (global_deadline, step.timeout) {
            (Some(global), t) if t > 0 => {
                Some(global.min(Instant::now() + Duration::from_secs(t as u64)))
            }
            (Some(global), _) => Some(global),
            (None, t) if t > 0 => Some(Instant::now() + Duration::from_secs(t as u64)),
            (None, _) => None,
        };

        let envs = self.env_overlay(&step.env);

        let outcome = match run_shell(&ShellCommand {
            command: &command,
            workdir: &workdir,
            envs: &envs,
            deadline,
            cancel: Some(&self.cancel),
        }) {
            Ok(run) => {
                let error = if run.timed_out {
                    Some("step timed out".to_string())
                } else if run.cancelled {
                    Some("step cancelled".to_string())
                } else if run.exit_code != 0 {
                    Some(format!("exited with code {}", run.exit_code))
                } else {
                    None
                };

                StepOutcome {
                    step_name: step.name.clone(),
                    success: run.success(),
                    exit_code: run.exit_code,
                    stdout: run.stdout,
                    stderr: run.stderr,
                    error,
                    start_time,
                    end_time: Utc::now(),
                }
            }
            Err(e) => fail(step, format!("failed to spawn step: {e}"), start_time),
        };

        self.log_step_outcome(&outcome);
        outcome
    }

    fn handle_outputs(&mut self) -> Result<(), String> {
        let spec = self.spec;
        for (key, template) in &spec.outputs {
            let resolved = shell_unquote(&self.substitute(template));
            self.output_files.insert(key.clone(), resolved.clone());

            let mut lines = format!("Output '{key}': {resolved}");

            if key == PRIMARY_OUTPUT_KEY {
                fsops::copy_file_synced(Path::new(&resolved), &self.ctx.output_file).map_err(
                    |e| format!("failed to copy output '{resolved}': {e}"),
                )?;
                let _ = write!(
                    lines,
                    "\nCopied primary output to {}",
                    self.ctx.output_file.display()
                );
            }

            self.logln(format_args!("{lines}"));
        }

        Ok(())
    }

    fn finish(self, success: bool, exit_code: i32, start: Instant) -> ExecutionResult {
        let mut logs = self.log;
        let duration = start.elapsed();
        let _ = writeln!(
            logs,
            "=== Workflow finished: {} in {:.3}s ===",
            if success { "SUCCESS" } else { "FAILED" },
            duration.as_secs_f64()
        );

        let stdout = combine_streams(&self.steps, StreamKind::Stdout);
        let stderr = combine_streams(&self.steps, StreamKind::Stderr);

        ExecutionResult {
            success,
            exit_code,
            duration,
            stdout,
            stderr,
            logs,
            steps: self.steps,
            metadata_preserved: self.metadata_preserved,
            metadata_summary: self.metadata_summary,
            output_files: self.output_files,
        }
    }

    fn log_variables(&mut self) {
        let lines: Vec<String> = self
            .variables
            .iter()
            .map(|(k, v)| format!("  {k} = {v}"))
            .collect();
        self.logln(format_args!("Variables:"));
        for line in lines {
            self.logln(format_args!("{line}"));
        }
    }

    fn log_step_outcome(&mut self, outcome: &StepOutcome) {
        if !outcome.stdout.is_empty() {
            self.logln(format_args!("stdout:\n{}", outcome.stdout.trim_end()));
        }
        if !outcome.stderr.is_empty() {
            self.logln(format_args!("stderr:\n{}", outcome.stderr.trim_end()));
        }
        if let Some(error) = &outcome.error {
            self.logln(format_args!("Error: {error}"));
        }
        self.logln(format_args!(
            "Exit code: {} ({})",
            outcome.exit_code,
            if outcome.success { "ok" } else { "failed" }
        ));
    }

    fn logln(&mut self, args: std::fmt::Arguments<'_>) {
        // Writing to a String cannot fail.
        let _ = writeln!(self.log, "{args}");
    }
}

enum StreamKind {
    Stdout,
    Stderr,
}

fn combine_streams(steps: &[StepOutcome], kind: StreamKind) -> String {
    let mut combined = String::new();
    for step in steps {
        let (text, label) = match kind {
            StreamKind::Stdout => (&step.stdout, "stdout"),
            StreamKind::Stderr => (&step.stderr, "stderr"),
        };
        if !text.is_empty() {
            let _ = write!(
                combined,
                "=== {} ({label}) ===\n{}\n",
                step.step_name, text
            );
        }
    }
    combined
}
