//! A loaded multiverse directory: overview, universe table and result files.

use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{FieldSource, Overview, SUMMARY_FILE};
use crate::data::{file_sha256, read_outcomes, DataQuality, UniverseTable};
use crate::logging::{log, obj, v_str, Domain, Level};
use serde_json::json;

/// Replaces process-wide globals: everything derived from the data directory
/// at startup, immutable afterwards.
#[derive(Debug, Clone)]
pub struct Session {
    data_dir: PathBuf,
    overview: Overview,
    table: Arc<UniverseTable>,
    summary_sha256: String,
}

impl Session {
    pub fn load(data_dir: &Path) -> Result<Self> {
        let overview = Overview::load(data_dir)?;
        let summary = data_dir.join(SUMMARY_FILE);
        let table = UniverseTable::load(&summary, &overview.decisions)?;
        let summary_sha256 = file_sha256(&summary)?;
        for (decision, values) in unlisted_options(&overview, &table) {
            log(
                Level::Warn,
                Domain::System,
                "unlisted_options",
                obj(&[("decision", v_str(&decision)), ("values", json!(values))]),
            );
        }

        log(
            Level::Info,
            Domain::System,
            "session_loaded",
            obj(&[
                ("data_dir", v_str(&data_dir.display().to_string())),
                ("universes", json!(table.len())),
                ("decisions", json!(overview.decision_names())),
                ("sensitivity", v_str(overview.sensitivity.as_str())),
            ]),
        );

        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            overview,
            table: Arc::new(table),
            summary_sha256,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn overview(&self) -> &Overview {
        &self.overview
    }

    pub fn table(&self) -> &Arc<UniverseTable> {
        &self.table
    }

    pub fn summary_sha256(&self) -> &str {
        &self.summary_sha256
    }

    pub fn result_path(&self, source: &FieldSource) -> PathBuf {
        self.data_dir.join(&source.path)
    }

    /// Every single-file result the schema references must exist. Per-universe
    /// (`multi`) files appear as universes run and are not checked.
    pub fn check_result_files(&self) -> Result<()> {
        for source in self.overview.schema.values().filter(|s| !s.multi) {
            let path = self.result_path(source);
            if !path.is_file() {
                return Err(anyhow!("Error: {} does not exist.", path.display()));
            }
        }
        Ok(())
    }

    /// Point estimates aligned to table positions (NaN where a universe
    /// failed or produced a non-finite value).
    pub fn read_point_estimates(&self) -> Result<(Vec<f64>, DataQuality)> {
        let source = self.overview.point_estimate()?;
        read_outcomes(&self.result_path(source), &source.field, &self.table)
    }

    /// As [`Session::read_point_estimates`], but a result file that does not
    /// exist yet yields all-NaN instead of an error.
    pub fn read_partial_point_estimates(&self) -> Result<Vec<f64>> {
        let source = self.overview.point_estimate()?;
        if !self.result_path(source).exists() {
            return Ok(vec![f64::NAN; self.table.len()]);
        }
        Ok(self.read_point_estimates()?.0)
    }
}

/// Values in the universe table that a decision does not list among its
/// options. Empty values (decision omitted for the universe) are allowed.
pub fn unlisted_options(overview: &Overview, table: &UniverseTable) -> Vec<(String, Vec<String>)> {
    overview
        .decisions
        .iter()
        .filter_map(|d| {
            let dec = table.decision_index(&d.var)?;
            let extra: Vec<String> = table
                .options_of(dec)
                .into_iter()
                .filter(|v| !v.is_empty() && !d.options.contains(v))
                .collect();
            (!extra.is_empty()).then(|| (d.var.clone(), extra))
        })
        .collect()
}
