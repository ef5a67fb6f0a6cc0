//! Parameter envelopes and playbooks.
//!
//! An envelope is a flat map: connection keys, behaviour keys, `kind`, and
//! the resource's own attributes side by side. Files are JSON or TOML by
//! extension; `-` reads JSON from stdin.

use anyhow::{Context, Result, bail};
use declarative::{ApplyOptions, Intent, ValidatePolicy};
use ontapkit::{ConnectionConfig, FeatureFlags, UseRest};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::resource::Kind;

fn default_true() -> bool {
    true
}

fn default_time_out() -> u64 {
    180
}

/// One invocation's parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct Params {
    pub kind: Kind,
    #[serde(default)]
    pub state: Intent,
    #[serde(default)]
    pub use_rest: UseRest,
    #[serde(default)]
    pub feature_flags: FeatureFlags,
    #[serde(default = "default_true")]
    pub wait_for_completion: bool,
    /// Seconds to wait for each job
    #[serde(default = "default_time_out")]
    pub time_out: u64,
    #[serde(default)]
    pub validate_changes: ValidatePolicy,
    #[serde(default)]
    pub check_mode: bool,
    #[serde(flatten)]
    pub connection: ConnectionConfig,
    /// Everything else belongs to the resource
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl Params {
    /// Parse an envelope from JSON.
    pub fn from_value(value: Value) -> Result<Self> {
        if !value.is_object() {
            bail!("parameters must be a mapping, got {}", type_name(&value));
        }
        let mut params: Self = serde_json::from_value(value).context("Invalid parameters")?;
        prepare_connection(&mut params.connection)?;
        Ok(params)
    }

    /// Options for the reconcile loop.
    pub fn apply_options(&self) -> ApplyOptions {
        ApplyOptions {
            check_mode: self.check_mode,
            wait_for_completion: self.wait_for_completion,
            job_timeout: Duration::from_secs(self.time_out),
            job_timeout_is_warning: self.feature_flags.job_timeout_is_warning,
            validate: self.validate_changes,
        }
    }

    /// Short label for progress output, e.g. `volume vol1`.
    pub fn label(&self) -> String {
        let name = ["name", "rule_index", "client_match"]
            .iter()
            .find_map(|key| self.attributes.get(*key))
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_default();
        format!("{} {name}", self.kind).trim_end().to_string()
    }
}

/// Connection settings alone, for commands that manage nothing.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionParams {
    #[serde(default)]
    pub use_rest: UseRest,
    #[serde(default)]
    pub feature_flags: FeatureFlags,
    #[serde(flatten)]
    pub connection: ConnectionConfig,
}

/// Expand `~` in certificate paths, then validate.
fn prepare_connection(connection: &mut ConnectionConfig) -> Result<()> {
    let expand = |path: &mut Option<PathBuf>| {
        if let Some(p) = path.as_ref() {
            let expanded = shellexpand::tilde(&p.to_string_lossy()).into_owned();
            *path = Some(PathBuf::from(expanded));
        }
    };
    expand(&mut connection.cert_filepath);
    expand(&mut connection.key_filepath);
    connection.validate()?;
    Ok(())
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "a mapping",
    }
}

/// Read a JSON or TOML document; `-` reads JSON from stdin.
pub fn load_document(path: &Path) -> Result<Value> {
    if path.as_os_str() == "-" {
        let mut content = String::new();
        std::io::stdin()
            .read_to_string(&mut content)
            .context("Could not read parameters from stdin")?;
        return serde_json::from_str(&content).context("Invalid JSON on stdin");
    }

    let content = fs::read_to_string(path).with_context(|| format!("Could not read {}", path.display()))?;
    parse_document(&content, path)
}

fn parse_document(content: &str, path: &Path) -> Result<Value> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => {
            let value: toml::Value =
                toml::from_str(content).with_context(|| format!("Invalid TOML in {}", path.display()))?;
            serde_json::to_value(value).context("Could not convert TOML document")
        }
        _ => serde_json::from_str(content).with_context(|| format!("Invalid JSON in {}", path.display())),
    }
}

/// Load a single parameter envelope.
pub fn load_params(path: &Path) -> Result<Params> {
    Params::from_value(load_document(path)?).with_context(|| format!("In {}", path.display()))
}

/// Load only the connection settings of a parameter file.
pub fn load_connection(path: &Path) -> Result<ConnectionParams> {
    let mut params: ConnectionParams = serde_json::from_value(load_document(path)?)
        .with_context(|| format!("Invalid connection settings in {}", path.display()))?;
    prepare_connection(&mut params.connection)?;
    Ok(params)
}

/// A playbook: shared defaults and a list of tasks.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Playbook {
    #[serde(default)]
    defaults: Map<String, Value>,
    tasks: Vec<Value>,
}

/// Load a playbook, merging each task over the defaults.
pub fn load_playbook(path: &Path) -> Result<Vec<Params>> {
    let document = load_document(path)?;
    let playbook: Playbook =
        serde_json::from_value(document).with_context(|| format!("Invalid playbook {}", path.display()))?;
    playbook_tasks(playbook.defaults, playbook.tasks)
}

fn playbook_tasks(defaults: Map<String, Value>, tasks: Vec<Value>) -> Result<Vec<Params>> {
    tasks
        .into_iter()
        .enumerate()
        .map(|(i, task)| {
            let Value::Object(task) = task else {
                bail!("task {} must be a mapping", i + 1);
            };
            let mut merged = defaults.clone();
            merged.extend(task);
            Params::from_value(Value::Object(merged)).with_context(|| format!("In task {}", i + 1))
        })
        .collect()
}
