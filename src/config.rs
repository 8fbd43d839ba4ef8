//! Typed configuration: the multiverse description (`overview.json`) and the
//! monitor's runtime knobs (environment).

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::monitor::update::StepBoundary;
use crate::stats::bootstrap::{BootstrapSettings, DEFAULT_ITERATIONS};
use crate::stats::sampling::PlannerKind;

pub const OVERVIEW_FILE: &str = "overview.json";
pub const SUMMARY_FILE: &str = "summary.csv";

/// A researcher decision and its valid options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub var: String,
    #[serde(default, deserialize_with = "options_as_strings")]
    pub options: Vec<String>,
}

/// Options may be written as strings, numbers or booleans in overview.json;
/// summary.csv always holds their text form.
fn options_as_strings<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Vec<Value> = Vec::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|v| match v {
            Value::String(s) => s,
            Value::Null => String::new(),
            other => other.to_string(),
        })
        .collect())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensitivityMethod {
    /// One-way F-test
    F,
    /// Median pairwise Kolmogorov-Smirnov statistic
    Ks,
    /// k-sample Anderson-Darling test
    Ad,
}

impl SensitivityMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SensitivityMethod::F => "f",
            SensitivityMethod::Ks => "ks",
            SensitivityMethod::Ad => "ad",
        }
    }
}

impl FromStr for SensitivityMethod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "f" => Ok(SensitivityMethod::F),
            "ks" => Ok(SensitivityMethod::Ks),
            "ad" => Ok(SensitivityMethod::Ad),
            other => Err(anyhow!(
                "Invalid sensitivity flag \"{}\". Available values:\n \
                 - \"f\": algorithm based on the F-test\n \
                 - \"ks\": algorithm based on Kolmogorov-Smirnov statistic\n \
                 - \"ad\": k-samples Anderson-Darling test",
                other
            )),
        }
    }
}

/// A schema field resolved against `visualizer.files`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldSource {
    pub name: String,
    /// Path relative to the multiverse directory. For `multi` files this is a
    /// pattern with `{}` standing for the uid.
    pub path: String,
    pub field: String,
    pub multi: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Overview {
    pub decisions: Vec<Decision>,
    pub schema: BTreeMap<String, FieldSource>,
    pub sensitivity: SensitivityMethod,
}

// Raw, permissive shapes; validated into `Overview`.
#[derive(Deserialize)]
struct RawOverview {
    #[serde(default)]
    decisions: Vec<Value>,
    #[serde(default)]
    visualizer: RawVisualizer,
}

#[derive(Deserialize, Default)]
struct RawVisualizer {
    #[serde(default)]
    files: Vec<Value>,
    #[serde(default)]
    schema: BTreeMap<String, Value>,
    sensitivity: Option<String>,
}

fn required_str(obj: &Value, key: &str, prefix: &str) -> Result<String> {
    obj.get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow!("{}Error: cannot find required field \"{}\" in {}", prefix, key, obj))
}

impl Overview {
    /// Reads and validates `<data_dir>/overview.json`.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(OVERVIEW_FILE);
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Error: {} does not exist.", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("Cannot parse the JSON file {}", path.display()))
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let raw: RawOverview = serde_json::from_str(text)?;

        let prefix = "In parsing decisions in overview.json:\n";
        let mut decisions = Vec::with_capacity(raw.decisions.len());
        for d in &raw.decisions {
            required_str(d, "var", prefix)?;
            let dec: Decision = serde_json::from_value(d.clone())
                .with_context(|| format!("{}Error: malformed decision {}", prefix, d))?;
            decisions.push(dec);
        }

        let prefix = "In parsing visualizer.files in overview.json:\n";
        let mut files: BTreeMap<String, (String, bool)> = BTreeMap::new();
        for f in &raw.visualizer.files {
            let id = required_str(f, "id", prefix)?;
            let path = required_str(f, "path", prefix)?;
            let multi = f.get("multi").and_then(|v| v.as_bool()).unwrap_or(false);
            files.insert(id, (path, multi));
        }

        let prefix = "In parsing visualizer.schema in overview.json:\n";
        if !raw.visualizer.schema.contains_key("point_estimate") {
            return Err(anyhow!(
                "{}Error: cannot find required field \"point_estimate\" in {:?}",
                prefix,
                raw.visualizer.schema.keys().collect::<Vec<_>>()
            ));
        }
        let mut schema = BTreeMap::new();
        for (key, s) in &raw.visualizer.schema {
            let fid = required_str(s, "file", prefix)?;
            let (path, multi) = files.get(&fid).cloned().ok_or_else(|| {
                anyhow!("{}{}\nError: file id \"{}\" is not defined.", prefix, s, fid)
            })?;
            let field = s
                .get("field")
                .and_then(|v| v.as_str())
                .map(|v| v.to_string())
                .unwrap_or_else(|| key.clone());
            schema.insert(
                key.clone(),
                FieldSource {
                    name: key.clone(),
                    path,
                    field,
                    multi,
                },
            );
        }

        let sensitivity = raw
            .visualizer
            .sensitivity
            .as_deref()
            .unwrap_or("ks")
            .parse::<SensitivityMethod>()?;

        Ok(Self {
            decisions,
            schema,
            sensitivity,
        })
    }

    pub fn point_estimate(&self) -> Result<&FieldSource> {
        self.schema
            .get("point_estimate")
            .ok_or_else(|| anyhow!("schema has no point_estimate field"))
    }

    pub fn decision_names(&self) -> Vec<String> {
        self.decisions.iter().map(|d| d.var.clone()).collect()
    }
}

/// Runtime knobs for the monitor, read once at startup.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub data_dir: PathBuf,
    pub tick_interval: Duration,
    pub stop_poll_interval: Duration,
    pub bootstrap_iterations: usize,
    pub alpha: f64,
    pub sampler: PlannerKind,
    pub seed: Option<u64>,
    pub step_boundary: StepBoundary,
    /// Case-insensitive; lines matching it are never used as an error key.
    pub error_skip_pattern: String,
    /// Case-insensitive; marks the key line for universes that exited non-zero.
    pub error_match_pattern: String,
    /// File name of a universe's error output inside the log directory.
    pub error_file_pattern: String,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            tick_interval: Duration::from_millis(5000),
            stop_poll_interval: Duration::from_millis(1000),
            bootstrap_iterations: DEFAULT_ITERATIONS,
            alpha: 0.05,
            sampler: PlannerKind::RoundRobin,
            seed: None,
            step_boundary: StepBoundary::Inclusive,
            error_skip_pattern: r"^\s*$|^\s*(warning|note|message|info|loading|attaching|the following)\b".to_string(),
            error_match_pattern: r"error|exception|fatal|traceback".to_string(),
            error_file_pattern: "error_{}.txt".to_string(),
        }
    }
}

impl MonitorConfig {
    pub fn from_env() -> Result<Self> {
        let d = Self::default();
        Ok(Self {
            data_dir: std::env::var("DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            tick_interval: std::env::var("MONITOR_TICK_MS").ok().and_then(|v| v.parse().ok()).map(Duration::from_millis).unwrap_or(d.tick_interval),
            stop_poll_interval: std::env::var("MONITOR_STOP_POLL_MS").ok().and_then(|v| v.parse().ok()).map(Duration::from_millis).unwrap_or(d.stop_poll_interval),
            bootstrap_iterations: std::env::var("BOOTSTRAP_N").ok().and_then(|v| v.parse().ok()).unwrap_or(d.bootstrap_iterations),
            alpha: std::env::var("CI_ALPHA").ok().and_then(|v| v.parse().ok()).unwrap_or(d.alpha),
            sampler: match std::env::var("SAMPLER") {
                Ok(v) => v.parse()?,
                Err(_) => d.sampler,
            },
            seed: std::env::var("SEED").ok().and_then(|v| v.parse().ok()),
            step_boundary: match std::env::var("STEP_BOUNDARY") {
                Ok(v) => v.parse()?,
                Err(_) => d.step_boundary,
            },
            error_skip_pattern: std::env::var("ERROR_SKIP_PATTERN").unwrap_or(d.error_skip_pattern),
            error_match_pattern: std::env::var("ERROR_MATCH_PATTERN").unwrap_or(d.error_match_pattern),
            error_file_pattern: std::env::var("ERROR_FILE_PATTERN").unwrap_or(d.error_file_pattern),
        })
    }

    pub fn bootstrap_settings(&self) -> BootstrapSettings {
        BootstrapSettings {
            iterations: self.bootstrap_iterations,
            alpha: self.alpha,
            seed: self.seed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OVERVIEW: &str = r#"{
        "decisions": [
            {"var": "outliers", "options": ["none", "2sd"]},
            {"var": "k", "options": [1, 2, 3]}
        ],
        "visualizer": {
            "files": [{"id": "est", "path": "estimate.csv"}],
            "schema": {"point_estimate": {"file": "est", "field": "estimate"}},
            "sensitivity": "ad"
        }
    }"#;

    #[test]
    fn test_overview_parses_and_resolves_files() {
        let o = Overview::from_json_str(OVERVIEW).unwrap();
        assert_eq!(o.decisions.len(), 2);
        assert_eq!(o.decisions[1].options, vec!["1", "2", "3"]);
        let pe = o.point_estimate().unwrap();
        assert_eq!(pe.path, "estimate.csv");
        assert_eq!(pe.field, "estimate");
        assert!(!pe.multi);
        assert_eq!(o.sensitivity, SensitivityMethod::Ad);
    }

    #[test]
    fn test_missing_point_estimate_is_rejected() {
        let text = r#"{"decisions": [], "visualizer": {"files": [], "schema": {}}}"#;
        let err = Overview::from_json_str(text).unwrap_err().to_string();
        assert!(err.contains("point_estimate"));
    }

    #[test]
    fn test_undefined_file_id_is_rejected() {
        let text = r#"{"visualizer": {"files": [],
            "schema": {"point_estimate": {"file": "nope", "field": "x"}}}}"#;
        let err = Overview::from_json_str(text).unwrap_err().to_string();
        assert!(err.contains("file id \"nope\" is not defined"));
    }

    #[test]
    fn test_decision_without_var_is_rejected() {
        let text = r#"{"decisions": [{"options": ["a"]}],
            "visualizer": {"files": [{"id": "e", "path": "e.csv"}],
            "schema": {"point_estimate": {"file": "e"}}}}"#;
        let err = Overview::from_json_str(text).unwrap_err().to_string();
        assert!(err.contains("\"var\""));
    }

    #[test]
    fn test_invalid_sensitivity_flag() {
        assert!("t".parse::<SensitivityMethod>().is_err());
        assert_eq!("ks".parse::<SensitivityMethod>().unwrap(), SensitivityMethod::Ks);
    }

    #[test]
    fn test_default_sensitivity_is_ks() {
        let text = r#"{"visualizer": {"files": [{"id": "e", "path": "e.csv"}],
            "schema": {"point_estimate": {"file": "e"}}}}"#;
        let o = Overview::from_json_str(text).unwrap();
        assert_eq!(o.sensitivity, SensitivityMethod::Ks);
        assert_eq!(o.point_estimate().unwrap().field, "point_estimate");
    }
}
