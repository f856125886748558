//! The YAML workflow document and its validation rules.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::WorkflowError;

/// Default timeout for a `can_convert` probe script.
const DEFAULT_PROBE_TIMEOUT_SECS: i64 = 10;

fn default_runs_on() -> String {
    "shell".to_string()
}

/// A parsed workflow document.
///
/// `env` and `outputs` are ordered maps so validation and execution walk
/// them in a stable order regardless of the YAML key order.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct WorkflowSpec {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "runs-on", default = "default_runs_on")]
    pub runs_on: String,
    /// Global timeout in seconds; 0 means no timeout.
    #[serde(default)]
    pub timeout: i64,
    #[serde(default)]
    pub can_convert: Option<CanConvertSpec>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub steps: Vec<StepSpec>,
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
}

/// How a workflow decides whether it supports an input file: an extension
/// list or a probe script, never both.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct CanConvertSpec {
    #[serde(default)]
    pub extensions: Vec<String>,
    #[serde(default)]
    pub run: Option<String>,
    /// Probe timeout in seconds; 0 means "use the default".
    #[serde(default)]
    pub timeout: i64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct StepSpec {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub run: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub workdir: Option<String>,
    /// Per-step timeout in seconds; 0 means no timeout.
    #[serde(default)]
    pub timeout: i64,
}

/// Parses YAML into a [`WorkflowSpec`]. Parsing does not validate; see
/// [`WorkflowSpec::validate`].
pub fn parse(source: &str) -> Result<WorkflowSpec, WorkflowError> {
    Ok(serde_yaml::from_str(source)?)
}

/// Parses and validates in one step, collecting all validation errors.
pub fn parse_and_validate(source: &str) -> Result<WorkflowSpec, WorkflowError> {
    let spec = parse(source)?;
    let errors = spec.validate();
    if errors.is_empty() {
        Ok(spec)
    } else {
        Err(WorkflowError::Validation { errors })
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

impl WorkflowSpec {
    /// Validates the document, returning the full list of problems rather
    /// than stopping at the first. An empty list means the workflow may
    /// run.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.name.is_empty() {
            errors.push("workflow name is required".to_string());
        } else if !is_valid_name(&self.name) {
            errors.push(
                "workflow name must be alphanumeric with hyphens/underscores".to_string(),
            );
        }

        if self.runs_on != "shell" {
            errors.push("runs-on must be 'shell'".to_string());
        }

        if self.timeout < 0 {
            errors.push("timeout must be non-negative".to_string());
        }

        if let Some(cc) = &self.can_convert {
            let has_extensions = !cc.extensions.is_empty();
            let has_run = cc.run.as_deref().is_some_and(|r| !r.is_empty());

            match (has_extensions, has_run) {
                (false, false) => errors
                    .push("can_convert: must specify either 'extensions' or 'run'".to_string()),
                (true, true) => errors
                    .push("can_convert: cannot specify both 'extensions' and 'run'".to_string()),
                _ => {}
            }

            for (i, ext) in cc.extensions.iter().enumerate() {
                if !ext.starts_with('.') {
                    errors.push(format!(
                        "can_convert: extensions[{i}] must start with '.' (got '{ext}')"
                    ));
                }
            }

            if cc.timeout < 0 {
                errors.push("can_convert: timeout must be non-negative".to_string());
            }
        }

        if self.steps.is_empty() {
            errors.push("at least one step is required".to_string());
        }

        for (i, step) in self.steps.iter().enumerate() {
            if step.name.is_empty() {
                errors.push(format!("step {i}: name is required"));
            }
            if step.run.is_empty() {
                errors.push(format!("step {i} ({}): run command is required", step.name));
            }
            if step.timeout < 0 {
                errors.push(format!(
                    "step {i} ({}): timeout must be non-negative",
                    step.name
                ));
            }
        }

        for (key, value) in &self.outputs {
            if !value.contains("{{") {
                errors.push(format!(
                    "output '{key}': value must contain a template variable"
                ));
            }
        }

        errors
    }

    /// Effective probe timeout: the declared value, or 10 s when unset.
    pub fn probe_timeout(&self) -> Duration {
        let secs = match &self.can_convert {
            Some(cc) if cc.timeout > 0 => cc.timeout,
            _ => DEFAULT_PROBE_TIMEOUT_SECS,
        };
        Duration::from_secs(secs as u64)
    }

    /// All `{{VAR}}` names referenced in env values, step commands, step
    /// workdirs, step env values, and outputs, sorted.
    pub fn used_variables(&self) -> Vec<String> {
        let re = Regex::new(r"\{\{([A-Z_][A-Z0-9_]*)\}\}").expect("static regex");
        let mut names = BTreeSet::new();

        let mut scan = |text: &str| {
            for caps in re.captures_iter(text) {
                names.insert(caps[1].to_string());
            }
        };

        for value in self.env.values() {
            scan(value);
        }
        for step in &self.steps {
            scan(&step.run);
            if let Some(workdir) = &step.workdir {
                scan(workdir);
            }
            for value in step.env.values() {
                scan(value);
            }
        }
        for value in self.outputs.values() {
            scan(value);
        }

        names.into_iter().collect()
    }
}
