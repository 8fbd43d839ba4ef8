//! Pure incremental recomputation: (prefix of the plan, outcomes) -> new
//! series rows.
//!
//! Nothing here touches the watcher state or the disk; the monitor runs
//! these functions on the blocking pool against owned snapshots and merges
//! the results itself.

use anyhow::{anyhow, Result};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::json;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::thread;

use crate::data::{Frame, UniverseTable};
use crate::logging::ProfileScope;
use crate::stats::bootstrap::BootstrapSettings;
use crate::stats::sampling::{bootstrap_decision, bootstrap_outcome, DecisionCi, SamplingPlan};
use crate::stats::sensitivity::ad_wrapper;

/// Whether a recompute fires once exactly `step` new universes have
/// completed (`Inclusive`) or only after more than `step` (`Strict`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepBoundary {
    Inclusive,
    Strict,
}

impl StepBoundary {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepBoundary::Inclusive => "inclusive",
            StepBoundary::Strict => "strict",
        }
    }
}

impl FromStr for StepBoundary {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "inclusive" => Ok(StepBoundary::Inclusive),
            "strict" => Ok(StepBoundary::Strict),
            other => Err(anyhow!("unknown step boundary \"{}\" (expected inclusive or strict)", other)),
        }
    }
}

/// Completions between checkpoints: `clamp(total / 50, 1, 5)`.
pub fn step_size(total: usize) -> usize {
    (total / 50).clamp(1, 5)
}

pub fn should_recompute(done: usize, last_merge_index: usize, step: usize, boundary: StepBoundary) -> bool {
    let new = done.saturating_sub(last_merge_index);
    match boundary {
        StepBoundary::Inclusive => new >= step,
        StepBoundary::Strict => new > step,
    }
}

/// Checkpoint positions `i` (prefix length `i + 1`) between the last merge
/// and the current done count.
pub fn checkpoints(last_merge_index: usize, done: usize, step: usize) -> Vec<usize> {
    (last_merge_index..done).step_by(step.max(1)).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OutcomeRow {
    pub n_samples: u64,
    pub mean: f64,
    pub lower: f64,
    pub upper: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RowType {
    Score,
    P,
    Lower,
    Upper,
}

impl RowType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowType::Score => "score",
            RowType::P => "p",
            RowType::Lower => "lower",
            RowType::Upper => "upper",
        }
    }
}

impl FromStr for RowType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "score" => Ok(RowType::Score),
            "p" => Ok(RowType::P),
            "lower" => Ok(RowType::Lower),
            "upper" => Ok(RowType::Upper),
            other => Err(anyhow!("unknown sensitivity row type \"{}\"", other)),
        }
    }
}

impl fmt::Display for RowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sentinel written for non-finite sensitivity values.
pub const NAN_SENTINEL: &str = "NaN";

fn serialize_with_sentinel<S: Serializer>(values: &[f64], s: S) -> std::result::Result<S::Ok, S::Error> {
    let mut seq = s.serialize_seq(Some(values.len()))?;
    for v in values {
        if v.is_finite() {
            seq.serialize_element(v)?;
        } else {
            seq.serialize_element(NAN_SENTINEL)?;
        }
    }
    seq.end()
}

/// One row of the sensitivity series: a value per decision, in table order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensitivityRow {
    pub n_samples: u64,
    pub row_type: RowType,
    #[serde(serialize_with = "serialize_with_sentinel")]
    pub values: Vec<f64>,
}

/// Outcome row before imputation: `mean` may be NaN, bounds may be NaN.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawOutcome {
    pub n_samples: u64,
    pub mean: f64,
    pub lower: f64,
    pub upper: f64,
}

/// Fills NaN bounds and drops rows without a mean.
///
/// A missing bound takes the previous row's bound; the first row of the
/// batch falls back to the last persisted row (`tail`), and without one to
/// its own mean.
pub fn impute(rows: &[RawOutcome], tail: Option<&OutcomeRow>) -> Vec<OutcomeRow> {
    let mut out: Vec<OutcomeRow> = Vec::with_capacity(rows.len());
    for r in rows {
        if r.mean.is_nan() {
            continue;
        }
        let prev = out.last().or(tail);
        let fill = |v: f64, pick: fn(&OutcomeRow) -> f64| {
            if !v.is_nan() {
                v
            } else {
                prev.map(pick).unwrap_or(r.mean)
            }
        };
        let lower = fill(r.lower, |p| p.lower);
        let upper = fill(r.upper, |p| p.upper);
        out.push(OutcomeRow {
            n_samples: r.n_samples,
            mean: r.mean,
            lower,
            upper,
        });
    }
    out
}

/// Owned snapshot a recompute job runs against.
#[derive(Debug, Clone)]
pub struct RecomputeInput {
    pub table: Arc<UniverseTable>,
    pub plan: Arc<SamplingPlan>,
    /// Outcome per table position, NaN where unavailable.
    pub outcome: Vec<f64>,
    pub last_merge_index: usize,
    pub done: usize,
    pub step: usize,
    pub tail: Option<OutcomeRow>,
    pub settings: BootstrapSettings,
}

#[derive(Debug, Clone, Default)]
pub struct RecomputeOutput {
    pub outcome_rows: Vec<OutcomeRow>,
    pub sensitivity_rows: Vec<SensitivityRow>,
    pub last_merge_index: usize,
    /// Table positions of the most recent checkpoint's prefix.
    pub latest_prefix: Option<Vec<usize>>,
}

/// Walks the checkpoints since the last merge: outcome mean with a
/// percentile CI, and per-decision AD score and p-value (no CI).
pub fn recompute(input: &RecomputeInput) -> RecomputeOutput {
    let done = input.done.min(input.plan.len());
    let _prof = ProfileScope::with_context(
        "recompute",
        &[("from", json!(input.last_merge_index)), ("done", json!(done)), ("step", json!(input.step))],
    );
    let weights = input.plan.weights.as_deref();
    let n_dec = input.table.decisions().len();

    let mut raw = Vec::new();
    let mut sensitivity_rows = Vec::new();
    let mut latest_prefix = None;
    for i in checkpoints(input.last_merge_index, done, input.step) {
        let prefix = input.plan.prefix_positions(&input.table, i + 1);
        let n_samples = (i + 1) as u64;

        let (mean, lower, upper) = bootstrap_outcome(&input.outcome, &prefix, weights, &input.settings, n_samples);
        raw.push(RawOutcome {
            n_samples,
            mean,
            lower,
            upper,
        });

        let frame = Frame::new(&input.table, &input.outcome, &prefix);
        let (scores, ps): (Vec<f64>, Vec<f64>) = (0..n_dec).map(|d| ad_wrapper(&frame, d)).unzip();
        sensitivity_rows.push(SensitivityRow {
            n_samples,
            row_type: RowType::Score,
            values: scores,
        });
        sensitivity_rows.push(SensitivityRow {
            n_samples,
            row_type: RowType::P,
            values: ps,
        });
        latest_prefix = Some(prefix);
    }

    RecomputeOutput {
        outcome_rows: impute(&raw, input.tail.as_ref()),
        sensitivity_rows,
        last_merge_index: done.max(input.last_merge_index),
        latest_prefix,
    }
}

/// Bootstraps a `bc` CI of every decision's AD score over `prefix`, fanning
/// decisions out over up to `workers` threads. Results are in decision order.
pub fn decision_cis(
    table: &UniverseTable,
    outcome: &[f64],
    prefix: &[usize],
    settings: &BootstrapSettings,
    workers: usize,
) -> Vec<DecisionCi> {
    let n_dec = table.decisions().len();
    let _prof = ProfileScope::with_context(
        "decision_ci",
        &[("n_samples", json!(prefix.len())), ("decisions", json!(n_dec))],
    );
    let workers = workers.clamp(1, n_dec.max(1));
    let stream_base = prefix.len() as u64 * 1_000;

    let mut slots: Vec<Option<DecisionCi>> = vec![None; n_dec];
    thread::scope(|s| {
        let handles: Vec<_> = (0..workers)
            .map(|w| {
                s.spawn(move || {
                    (w..n_dec)
                        .step_by(workers)
                        .map(|d| (d, bootstrap_decision(table, outcome, prefix, d, settings, stream_base + d as u64)))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        for h in handles {
            if let Ok(results) = h.join() {
                for (d, ci) in results {
                    slots[d] = Some(ci);
                }
            }
        }
    });

    slots
        .into_iter()
        .enumerate()
        .map(|(d, ci)| {
            ci.unwrap_or_else(|| DecisionCi {
                decision: table.decisions()[d].clone(),
                score: f64::NAN,
                p: f64::NAN,
                score_lower: f64::NAN,
                score_upper: f64::NAN,
            })
        })
        .collect()
}

/// Lower/upper sensitivity rows for a finished decision-CI job.
pub fn ci_rows(n_samples: u64, cis: &[DecisionCi]) -> [SensitivityRow; 2] {
    [
        SensitivityRow {
            n_samples,
            row_type: RowType::Lower,
            values: cis.iter().map(|c| c.score_lower).collect(),
        },
        SensitivityRow {
            n_samples,
            row_type: RowType::Upper,
            values: cis.iter().map(|c| c.score_upper).collect(),
        },
    ]
}
