//! Watcher state and its on-disk form.
//!
//! The outcome and sensitivity series are append-only CSV logs with a
//! one-time header. The plan, weights and cumulative elapsed time live in a
//! JSON save file. Together they are enough to rehydrate a session without
//! recomputing anything.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::data::{escape_csv_field, read_csv};
use crate::logging::{log, obj, v_str, Domain, Level};
use crate::monitor::update::{OutcomeRow, RowType, SensitivityRow, NAN_SENTINEL};
use crate::stats::sampling::SamplingPlan;
use serde_json::json;

pub const OUTCOME_FILE: &str = "monitor_outcome.csv";
pub const SENSITIVITY_FILE: &str = "monitor_sensitivity.csv";
pub const SAVE_FILE: &str = "monitor_save.json";

const OUTCOME_HEADER: [&str; 4] = ["n_samples", "mean", "lower", "upper"];

/// Where a session persists itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorPaths {
    pub outcome: PathBuf,
    pub sensitivity: PathBuf,
    pub save: PathBuf,
}

impl MonitorPaths {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            outcome: dir.join(OUTCOME_FILE),
            sensitivity: dir.join(SENSITIVITY_FILE),
            save: dir.join(SAVE_FILE),
        }
    }
}

/// Append-only CSV: the header is written once, rows are only ever added.
#[derive(Debug)]
pub struct SeriesLog {
    file: File,
    path: PathBuf,
}

impl SeriesLog {
    /// Starts a fresh log, replacing any previous file.
    pub fn create(path: &Path, header: &[String]) -> Result<Self> {
        let mut file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
        writeln!(file, "{}", join_fields(header)).with_context(|| format!("writing {}", path.display()))?;
        file.flush()?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Opens an existing log for appending; writes the header if the file is
    /// missing or empty.
    pub fn open(path: &Path, header: &[String]) -> Result<Self> {
        let empty = fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
        if empty {
            return Self::create(path, header);
        }
        let file = OpenOptions::new()
            .append(true)
            .open(path)
            .with_context(|| format!("opening {}", path.display()))?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn append(&mut self, fields: &[String]) -> Result<()> {
        writeln!(self.file, "{}", join_fields(fields)).with_context(|| format!("appending to {}", self.path.display()))?;
        self.file.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Header and data rows of a log; `None` if the file does not exist.
    pub fn replay(path: &Path) -> Result<Option<(Vec<String>, Vec<Vec<String>>)>> {
        if !path.exists() {
            return Ok(None);
        }
        let mut rows = read_csv(path, 0)?;
        if rows.is_empty() {
            return Ok(Some((Vec::new(), Vec::new())));
        }
        let header = rows.remove(0);
        Ok(Some((header, rows)))
    }
}

fn join_fields(fields: &[String]) -> String {
    fields.iter().map(|f| escape_csv_field(f)).collect::<Vec<_>>().join(",")
}

fn fmt_value(v: f64) -> String {
    if v.is_finite() {
        v.to_string()
    } else {
        NAN_SENTINEL.to_string()
    }
}

fn parse_value(s: &str, path: &Path) -> Result<f64> {
    let s = s.trim();
    if s == NAN_SENTINEL || s.is_empty() {
        return Ok(f64::NAN);
    }
    s.parse::<f64>()
        .with_context(|| format!("{}: \"{}\" is not a number", path.display(), s))
}

fn parse_n(s: &str, path: &Path) -> Result<u64> {
    s.trim()
        .parse::<u64>()
        .with_context(|| format!("{}: \"{}\" is not a sample count", path.display(), s))
}

fn outcome_fields(r: &OutcomeRow) -> Vec<String> {
    vec![r.n_samples.to_string(), fmt_value(r.mean), fmt_value(r.lower), fmt_value(r.upper)]
}

fn sensitivity_fields(r: &SensitivityRow) -> Vec<String> {
    let mut out = vec![r.n_samples.to_string(), r.row_type.to_string()];
    out.extend(r.values.iter().map(|v| fmt_value(*v)));
    out
}

fn sensitivity_header(decisions: &[String]) -> Vec<String> {
    let mut h = vec!["n_samples".to_string(), "row_type".to_string()];
    h.extend(decisions.iter().cloned());
    h
}

/// Resumable session record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveFile {
    pub order: Vec<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weights: Option<Vec<f64>>,
    /// Cumulative running time in seconds.
    pub elapsed: f64,
    /// SHA-256 of `summary.csv` when the plan was drawn.
    pub summary_sha256: String,
}

impl SaveFile {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).with_context(|| format!("no saved session at {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("cannot parse {}", path.display()))
    }

    pub fn store(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string(self)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, text).with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, path).with_context(|| format!("replacing {}", path.display()))?;
        Ok(())
    }
}

/// Everything the monitor mutates during a session. Owned by the monitor
/// task alone.
#[derive(Debug)]
pub struct WatcherState {
    plan: Arc<SamplingPlan>,
    decisions: Vec<String>,
    summary_sha256: String,
    elapsed: Duration,
    resumed_at: Option<Instant>,
    pub last_merge_index: usize,
    outcome: Vec<OutcomeRow>,
    sensitivity: Vec<SensitivityRow>,
    outcome_log: SeriesLog,
    sensitivity_log: SeriesLog,
    paths: MonitorPaths,
}

impl WatcherState {
    /// New session: fresh series files and an immediate save file.
    pub fn create(paths: MonitorPaths, plan: SamplingPlan, decisions: Vec<String>, summary_sha256: String) -> Result<Self> {
        let header: Vec<String> = OUTCOME_HEADER.iter().map(|s| s.to_string()).collect();
        let outcome_log = SeriesLog::create(&paths.outcome, &header)?;
        let sensitivity_log = SeriesLog::create(&paths.sensitivity, &sensitivity_header(&decisions))?;
        let state = Self {
            plan: Arc::new(plan),
            decisions,
            summary_sha256,
            elapsed: Duration::ZERO,
            resumed_at: None,
            last_merge_index: 0,
            outcome: Vec::new(),
            sensitivity: Vec::new(),
            outcome_log,
            sensitivity_log,
            paths,
        };
        state.save()?;
        Ok(state)
    }

    /// Rehydrates a stopped session from its save file and series logs.
    /// Fails if there is no save file or if `summary.csv` changed since the
    /// plan was drawn.
    pub fn load(paths: MonitorPaths, decisions: Vec<String>, summary_sha256: &str) -> Result<Self> {
        let save = SaveFile::load(&paths.save)?;
        if save.summary_sha256 != summary_sha256 {
            return Err(anyhow!(
                "summary.csv changed since the saved plan was drawn ({} != {})",
                summary_sha256,
                save.summary_sha256
            ));
        }

        let mut outcome = Vec::new();
        if let Some((_, rows)) = SeriesLog::replay(&paths.outcome)? {
            for row in rows {
                if row.len() < 4 {
                    return Err(anyhow!("{}: malformed row {:?}", paths.outcome.display(), row));
                }
                outcome.push(OutcomeRow {
                    n_samples: parse_n(&row[0], &paths.outcome)?,
                    mean: parse_value(&row[1], &paths.outcome)?,
                    lower: parse_value(&row[2], &paths.outcome)?,
                    upper: parse_value(&row[3], &paths.outcome)?,
                });
            }
        }

        let mut sensitivity = Vec::new();
        if let Some((header, rows)) = SeriesLog::replay(&paths.sensitivity)? {
            if !header.is_empty() && header != sensitivity_header(&decisions) {
                return Err(anyhow!(
                    "{}: columns {:?} do not match the decisions",
                    paths.sensitivity.display(),
                    header
                ));
            }
            for row in rows {
                if row.len() != decisions.len() + 2 {
                    return Err(anyhow!("{}: malformed row {:?}", paths.sensitivity.display(), row));
                }
                let values = row[2..]
                    .iter()
                    .map(|v| parse_value(v, &paths.sensitivity))
                    .collect::<Result<Vec<_>>>()?;
                sensitivity.push(SensitivityRow {
                    n_samples: parse_n(&row[0], &paths.sensitivity)?,
                    row_type: row[1].parse()?,
                    values,
                });
            }
        }

        let last_merge_index = outcome
            .iter()
            .map(|r| r.n_samples)
            .chain(sensitivity.iter().map(|r| r.n_samples))
            .max()
            .unwrap_or(0) as usize;

        let header: Vec<String> = OUTCOME_HEADER.iter().map(|s| s.to_string()).collect();
        let outcome_log = SeriesLog::open(&paths.outcome, &header)?;
        let sensitivity_log = SeriesLog::open(&paths.sensitivity, &sensitivity_header(&decisions))?;

        log(
            Level::Info,
            Domain::Persist,
            "session_rehydrated",
            obj(&[
                ("save", v_str(&paths.save.display().to_string())),
                ("outcome_rows", json!(outcome.len())),
                ("sensitivity_rows", json!(sensitivity.len())),
                ("n_samples", json!(last_merge_index)),
            ]),
        );

        Ok(Self {
            plan: Arc::new(SamplingPlan {
                order: save.order,
                weights: save.weights,
            }),
            decisions,
            summary_sha256: save.summary_sha256,
            elapsed: Duration::from_secs_f64(save.elapsed.max(0.0)),
            resumed_at: None,
            last_merge_index,
            outcome,
            sensitivity,
            outcome_log,
            sensitivity_log,
            paths,
        })
    }

    pub fn plan(&self) -> &Arc<SamplingPlan> {
        &self.plan
    }

    pub fn decisions(&self) -> &[String] {
        &self.decisions
    }

    pub fn outcome(&self) -> &[OutcomeRow] {
        &self.outcome
    }

    pub fn sensitivity(&self) -> &[SensitivityRow] {
        &self.sensitivity
    }

    pub fn paths(&self) -> &MonitorPaths {
        &self.paths
    }

    pub fn start_clock(&mut self) {
        if self.resumed_at.is_none() {
            self.resumed_at = Some(Instant::now());
        }
    }

    pub fn freeze_clock(&mut self) {
        if let Some(t) = self.resumed_at.take() {
            self.elapsed += t.elapsed();
        }
    }

    /// Cumulative running time across pauses.
    pub fn elapsed(&self) -> Duration {
        self.elapsed + self.resumed_at.map(|t| t.elapsed()).unwrap_or_default()
    }

    pub fn save(&self) -> Result<()> {
        SaveFile {
            order: self.plan.order.clone(),
            weights: self.plan.weights.clone(),
            elapsed: self.elapsed().as_secs_f64(),
            summary_sha256: self.summary_sha256.clone(),
        }
        .store(&self.paths.save)
    }

    fn last_sensitivity_n(&self, row_type: RowType) -> Option<u64> {
        self.sensitivity
            .iter()
            .rev()
            .find(|r| r.row_type == row_type)
            .map(|r| r.n_samples)
    }

    /// Appends outcome rows whose sample count is beyond the last one held,
    /// in memory and on disk. Returns how many were appended.
    pub fn update_outcome(&mut self, rows: &[OutcomeRow]) -> Result<usize> {
        let mut appended = 0;
        for r in rows {
            if self.outcome.last().is_some_and(|last| r.n_samples <= last.n_samples) {
                continue;
            }
            self.outcome_log.append(&outcome_fields(r))?;
            self.outcome.push(*r);
            appended += 1;
        }
        Ok(appended)
    }

    /// Same as [`WatcherState::update_outcome`] for sensitivity rows, with
    /// sample counts increasing per row type.
    pub fn update_sensitivity(&mut self, rows: &[SensitivityRow]) -> Result<usize> {
        let mut appended = 0;
        for r in rows {
            if r.values.len() != self.decisions.len() {
                return Err(anyhow!(
                    "sensitivity row has {} values for {} decisions",
                    r.values.len(),
                    self.decisions.len()
                ));
            }
            if self.last_sensitivity_n(r.row_type).is_some_and(|n| r.n_samples <= n) {
                continue;
            }
            self.sensitivity_log.append(&sensitivity_fields(r))?;
            self.sensitivity.push(r.clone());
            appended += 1;
        }
        Ok(appended)
    }

    /// Appends one recompute's rows to both series. `last_merge_index` only
    /// moves to `merged_to` when both appends succeed; otherwise the next
    /// recompute covers the same checkpoints again and the rows already
    /// written are skipped.
    pub fn merge_checkpoints(
        &mut self,
        outcome: &[OutcomeRow],
        sensitivity: &[SensitivityRow],
        merged_to: usize,
    ) -> (Result<usize>, Result<usize>) {
        let outcome_added = self.update_outcome(outcome);
        let sensitivity_added = self.update_sensitivity(sensitivity);
        if outcome_added.is_ok() && sensitivity_added.is_ok() {
            self.last_merge_index = self.last_merge_index.max(merged_to);
        }
        (outcome_added, sensitivity_added)
    }

    /// Last persisted outcome row, used to impute the next batch.
    pub fn outcome_tail(&self) -> Option<OutcomeRow> {
        self.outcome.last().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn plan() -> SamplingPlan {
        SamplingPlan {
            order: vec![3, 1, 2],
            weights: Some(vec![1.0, 0.5, 2.0]),
        }
    }

    fn decisions() -> Vec<String> {
        vec!["a".to_string(), "b".to_string()]
    }

    fn row(n: u64, mean: f64) -> OutcomeRow {
        OutcomeRow {
            n_samples: n,
            mean,
            lower: mean - 1.0,
            upper: mean + 1.0,
        }
    }

    #[test]
    fn test_create_writes_headers_and_save_file() {
        let dir = TempDir::new().unwrap();
        let paths = MonitorPaths::in_dir(dir.path());
        WatcherState::create(paths.clone(), plan(), decisions(), "abc".into()).unwrap();
        assert_eq!(fs::read_to_string(&paths.outcome).unwrap(), "n_samples,mean,lower,upper\n");
        assert_eq!(fs::read_to_string(&paths.sensitivity).unwrap(), "n_samples,row_type,a,b\n");
        let save = SaveFile::load(&paths.save).unwrap();
        assert_eq!(save.order, vec![3, 1, 2]);
        assert_eq!(save.summary_sha256, "abc");
    }

    #[test]
    fn test_replayed_rows_are_not_duplicated() {
        let dir = TempDir::new().unwrap();
        let paths = MonitorPaths::in_dir(dir.path());
        let mut st = WatcherState::create(paths.clone(), plan(), decisions(), "abc".into()).unwrap();

        let rows = [row(1, 2.0), row(2, 2.5)];
        assert_eq!(st.update_outcome(&rows).unwrap(), 2);
        assert_eq!(st.update_outcome(&rows).unwrap(), 0);
        assert_eq!(st.outcome().len(), 2);

        let text = fs::read_to_string(&paths.outcome).unwrap();
        assert_eq!(text.lines().count(), 3);
    }

    #[test]
    fn test_sensitivity_increasing_per_row_type() {
        let dir = TempDir::new().unwrap();
        let mut st = WatcherState::create(MonitorPaths::in_dir(dir.path()), plan(), decisions(), "abc".into()).unwrap();
        let mk = |n, t| SensitivityRow {
            n_samples: n,
            row_type: t,
            values: vec![1.0, f64::NAN],
        };
        assert_eq!(st.update_sensitivity(&[mk(3, RowType::Score), mk(3, RowType::P)]).unwrap(), 2);
        assert_eq!(st.update_sensitivity(&[mk(3, RowType::Lower), mk(3, RowType::Upper)]).unwrap(), 2);
        assert_eq!(st.update_sensitivity(&[mk(2, RowType::Lower), mk(3, RowType::Score)]).unwrap(), 0);
        assert!(st.update_sensitivity(&[SensitivityRow {
            n_samples: 9,
            row_type: RowType::Score,
            values: vec![1.0],
        }])
        .is_err());
    }

    #[test]
    fn test_failed_append_keeps_merge_index() {
        let dir = TempDir::new().unwrap();
        let paths = MonitorPaths::in_dir(dir.path());
        let mut st = WatcherState::create(paths.clone(), plan(), decisions(), "abc".into()).unwrap();
        let score = SensitivityRow {
            n_samples: 2,
            row_type: RowType::Score,
            values: vec![0.1, 0.2],
        };

        // a read-only handle makes every append fail
        st.sensitivity_log = SeriesLog {
            file: File::open(&paths.sensitivity).unwrap(),
            path: paths.sensitivity.clone(),
        };
        let (o, s) = st.merge_checkpoints(&[row(1, 2.0), row(2, 2.5)], &[score.clone()], 2);
        assert_eq!(o.unwrap(), 2);
        assert!(s.is_err());
        assert_eq!(st.last_merge_index, 0);

        st.sensitivity_log = SeriesLog::open(&paths.sensitivity, &sensitivity_header(&decisions())).unwrap();
        let (o, s) = st.merge_checkpoints(&[row(1, 2.0), row(2, 2.5)], &[score], 2);
        assert_eq!(o.unwrap(), 0);
        assert_eq!(s.unwrap(), 1);
        assert_eq!(st.last_merge_index, 2);
        assert_eq!(fs::read_to_string(&paths.outcome).unwrap().lines().count(), 3);
    }

    #[test]
    fn test_rehydrate_round_trip() {
        let dir = TempDir::new().unwrap();
        let paths = MonitorPaths::in_dir(dir.path());
        {
            let mut st = WatcherState::create(paths.clone(), plan(), decisions(), "abc".into()).unwrap();
            st.update_outcome(&[row(1, 2.0), row(3, 2.5)]).unwrap();
            st.update_sensitivity(&[SensitivityRow {
                n_samples: 3,
                row_type: RowType::Score,
                values: vec![0.4, f64::NAN],
            }])
            .unwrap();
            st.save().unwrap();
        }

        let text = fs::read_to_string(&paths.sensitivity).unwrap();
        assert!(text.ends_with("3,score,0.4,NaN\n"));

        let mut st = WatcherState::load(paths.clone(), decisions(), "abc").unwrap();
        assert_eq!(st.last_merge_index, 3);
        assert_eq!(st.outcome().len(), 2);
        assert!(st.sensitivity()[0].values[1].is_nan());
        assert_eq!(st.plan().weights.as_deref(), Some(&[1.0, 0.5, 2.0][..]));

        // appends continue after the recovered tail
        assert_eq!(st.update_outcome(&[row(3, 9.0), row(4, 3.0)]).unwrap(), 1);
        let text = fs::read_to_string(&paths.outcome).unwrap();
        assert_eq!(text.lines().count(), 4);
        assert_eq!(text.matches("n_samples").count(), 1);
    }

    #[test]
    fn test_rehydrate_requires_save_file() {
        let dir = TempDir::new().unwrap();
        let err = WatcherState::load(MonitorPaths::in_dir(dir.path()), decisions(), "abc").unwrap_err();
        assert!(err.to_string().contains("no saved session"));
    }

    #[test]
    fn test_rehydrate_refuses_changed_summary() {
        let dir = TempDir::new().unwrap();
        let paths = MonitorPaths::in_dir(dir.path());
        WatcherState::create(paths.clone(), plan(), decisions(), "abc".into()).unwrap();
        assert!(WatcherState::load(paths, decisions(), "def").is_err());
    }

    #[test]
    fn test_clock_accumulates_across_pauses() {
        let dir = TempDir::new().unwrap();
        let mut st = WatcherState::create(MonitorPaths::in_dir(dir.path()), plan(), decisions(), "abc".into()).unwrap();
        assert_eq!(st.elapsed(), Duration::ZERO);
        st.start_clock();
        std::thread::sleep(Duration::from_millis(5));
        st.freeze_clock();
        let frozen = st.elapsed();
        assert!(frozen >= Duration::from_millis(5));
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(st.elapsed(), frozen);
    }
}
