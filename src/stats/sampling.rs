//! Sampling planners: the order in which universes are visited, and the
//! importance weights that correct the outcome mean for non-uniform draws.
//!
//! Planners work on positions into the universe table; [`SamplingPlan`]
//! translates them to uids.

use anyhow::{anyhow, Result};
use nalgebra::DMatrix;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::data::{Frame, UniverseTable};
use crate::logging::log_plan;
use crate::stats::bootstrap::{Bootstrap, BootstrapSettings, CiType};
use crate::stats::sensitivity::ad_wrapper;
use crate::stats::special::mean;

/// Category name substituted for the reference row's value when encoding
/// interactions. Columns for it are dropped.
const REF_LEVEL: &str = "reference_level";

/// Singular values below this (relative to the largest) span no direction.
const RANK_TOL: f64 = 1e-10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlannerKind {
    RoundRobin,
    Uniform,
    Sketching,
    SketchingInteract,
}

impl PlannerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlannerKind::RoundRobin => "round_robin",
            PlannerKind::Uniform => "uniform",
            PlannerKind::Sketching => "sketching",
            PlannerKind::SketchingInteract => "sketching_interact",
        }
    }

    /// Draws `n` universes (capped at the table size) and builds the plan.
    pub fn plan<R: Rng + ?Sized>(&self, table: &UniverseTable, n: usize, rng: &mut R) -> Result<SamplingPlan> {
        let rows = table.decision_rows();
        let n = n.min(rows.len());
        let (indices, probabilities) = match self {
            PlannerKind::RoundRobin => {
                let (idx, p) = round_robin(&rows, n, rng);
                (idx, Some(p))
            }
            PlannerKind::Uniform => (uniform(rows.len(), n, rng), None),
            PlannerKind::Sketching => {
                let (idx, p) = sketching(&rows, n, false, rng)?;
                (idx, Some(p))
            }
            PlannerKind::SketchingInteract => {
                let (idx, p) = sketching(&rows, n, true, rng)?;
                (idx, Some(p))
            }
        };
        let weights = probabilities.map(|p| importance_weights(&p));
        let plan = SamplingPlan::from_positions(table, &indices, weights);
        log_plan(self.as_str(), plan.order.len(), table.len(), plan.weights.is_some());
        Ok(plan)
    }
}

impl fmt::Display for PlannerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlannerKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "round_robin" | "roundrobin" | "rr" => Ok(PlannerKind::RoundRobin),
            "uniform" => Ok(PlannerKind::Uniform),
            "sketching" => Ok(PlannerKind::Sketching),
            "sketching_interact" => Ok(PlannerKind::SketchingInteract),
            other => Err(anyhow!(
                "unknown sampler \"{}\" (expected round_robin, uniform, sketching or sketching_interact)",
                other
            )),
        }
    }
}

/// Visitation order (uids) plus optional importance weights.
///
/// `weights`, when present, is indexed by table position, not by order, and
/// every entry is finite and strictly positive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingPlan {
    pub order: Vec<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weights: Option<Vec<f64>>,
}

impl SamplingPlan {
    pub fn from_positions(table: &UniverseTable, indices: &[usize], weights: Option<Vec<f64>>) -> Self {
        Self {
            order: indices.iter().map(|&i| table.uid(i)).collect(),
            weights,
        }
    }

    /// Table positions of the first `len` planned universes.
    pub fn prefix_positions(&self, table: &UniverseTable, len: usize) -> Vec<usize> {
        self.order
            .iter()
            .take(len)
            .filter_map(|&uid| table.position(uid))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Stratified round-robin: cycle decisions, and for each decision cycle its
/// remaining options, drawing one not-yet-drawn universe per option.
///
/// Returns positions and each universe's first-round inclusion probability
/// (see [`round_robin_weights`]).
pub fn round_robin<R: Rng + ?Sized>(rows: &[Vec<String>], n: usize, rng: &mut R) -> (Vec<usize>, Vec<f64>) {
    let weights = round_robin_weights(rows);
    let n_dec = rows.first().map_or(0, |r| r.len());

    let mut available = vec![true; rows.len()];
    let mut remaining = rows.len();
    let mut indices = Vec::with_capacity(n.min(rows.len()));

    'outer: while indices.len() < n && remaining > 0 {
        if n_dec == 0 {
            // nothing to stratify on
            let pool: Vec<usize> = (0..rows.len()).filter(|&i| available[i]).collect();
            for i in uniform_from(&pool, n - indices.len(), rng) {
                indices.push(i);
            }
            break;
        }
        for dec in 0..n_dec {
            let mut groups: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
            for (i, row) in rows.iter().enumerate() {
                if available[i] {
                    groups.entry(row[dec].as_str()).or_default().push(i);
                }
            }
            for members in groups.values() {
                let drawn = members[rng.gen_range(0..members.len())];
                available[drawn] = false;
                remaining -= 1;
                indices.push(drawn);
                if indices.len() >= n {
                    break 'outer;
                }
            }
        }
    }
    (indices, weights)
}

/// Probability that each universe is drawn in the first round of
/// [`round_robin`], normalized to sum to 1.
///
/// With marginal probabilities `m_d = 1 / count(option)` per decision, the
/// union over decisions by inclusion-exclusion is `1 - Π(1 - m_d)`.
pub fn round_robin_weights(rows: &[Vec<String>]) -> Vec<f64> {
    if rows.is_empty() {
        return Vec::new();
    }
    let n_dec = rows[0].len();
    let mut counts: Vec<BTreeMap<&str, usize>> = vec![BTreeMap::new(); n_dec];
    for row in rows {
        for (d, v) in row.iter().enumerate() {
            *counts[d].entry(v.as_str()).or_default() += 1;
        }
    }

    let raw: Vec<f64> = rows
        .iter()
        .map(|row| {
            let miss: f64 = row
                .iter()
                .enumerate()
                .map(|(d, v)| 1.0 - 1.0 / counts[d][v.as_str()] as f64)
                .product();
            1.0 - miss
        })
        .collect();
    let total: f64 = raw.iter().sum();
    if total > 0.0 {
        raw.iter().map(|p| p / total).collect()
    } else {
        vec![1.0 / rows.len() as f64; rows.len()]
    }
}

fn uniform_from<R: Rng + ?Sized>(pool: &[usize], n: usize, rng: &mut R) -> Vec<usize> {
    pool.choose_multiple(rng, n.min(pool.len())).copied().collect()
}

/// `n` positions out of `0..total`, uniformly without replacement.
pub fn uniform<R: Rng + ?Sized>(total: usize, n: usize, rng: &mut R) -> Vec<usize> {
    rand::seq::index::sample(rng, total, n.min(total)).into_vec()
}

/// Dummy coding of the decision columns.
///
/// Without interactions each decision gets one column per option except the
/// first (sorted) one. With interactions, every value equal to the first
/// row's is replaced by a reference level, all pairwise decision
/// combinations are added as extra categorical columns, and every category
/// except the reference level gets a column.
pub fn one_hot_encode(rows: &[Vec<String>], interact: bool) -> DMatrix<f64> {
    if rows.is_empty() {
        return DMatrix::zeros(0, 0);
    }
    let n_dec = rows[0].len();

    let columns: Vec<Vec<String>> = if interact {
        let reference = &rows[0];
        let recoded: Vec<Vec<String>> = rows
            .iter()
            .map(|row| {
                let mut out: Vec<String> = row
                    .iter()
                    .zip(reference)
                    .map(|(v, r)| if v == r { REF_LEVEL.to_string() } else { v.clone() })
                    .collect();
                for i in 0..n_dec {
                    for j in (i + 1)..n_dec {
                        let pair = if out[i] == REF_LEVEL || out[j] == REF_LEVEL {
                            REF_LEVEL.to_string()
                        } else {
                            format!("{}_{}", out[i], out[j])
                        };
                        out.push(pair);
                    }
                }
                out
            })
            .collect();
        transpose(&recoded)
    } else {
        transpose(rows)
    };

    // (column, level) for every dummy
    let mut dummies: Vec<(usize, String)> = Vec::new();
    for (c, col) in columns.iter().enumerate() {
        let mut levels: Vec<&String> = col.iter().collect();
        levels.sort();
        levels.dedup();
        let skip = if interact { 0 } else { 1 };
        for level in levels.into_iter().skip(skip) {
            if interact && level == REF_LEVEL {
                continue;
            }
            dummies.push((c, level.clone()));
        }
    }

    DMatrix::from_fn(rows.len(), dummies.len(), |r, k| {
        let (c, level) = &dummies[k];
        if columns[*c][r] == *level {
            1.0
        } else {
            0.0
        }
    })
}

fn transpose(rows: &[Vec<String>]) -> Vec<Vec<String>> {
    let width = rows.first().map_or(0, |r| r.len());
    (0..width)
        .map(|c| rows.iter().map(|r| r[c].clone()).collect())
        .collect()
}

/// Leverage of each row of `x`: `diag(U·Uᵀ)` over the singular vectors that
/// span the column space.
pub fn leverage_scores(x: &DMatrix<f64>) -> Result<Vec<f64>> {
    if x.ncols() == 0 || x.nrows() == 0 {
        return Err(anyhow!("cannot compute leverage of an empty design matrix"));
    }
    let svd = x.clone().svd(true, false);
    let u = svd.u.ok_or_else(|| anyhow!("SVD did not produce left singular vectors"))?;
    let s_max = svd.singular_values.iter().copied().fold(0.0, f64::max);
    let keep: Vec<usize> = svd
        .singular_values
        .iter()
        .enumerate()
        .filter(|(_, &s)| s > RANK_TOL * s_max)
        .map(|(i, _)| i)
        .collect();
    Ok((0..x.nrows())
        .map(|r| keep.iter().map(|&c| u[(r, c)].powi(2)).sum())
        .collect())
}

/// Leverage-score sketching: draw `n` rows without replacement with
/// probability proportional to leverage. Returns positions and the
/// distribution `leverage / feature count`.
///
/// Rows with zero leverage can never be drawn by weight; once the positive
/// rows are exhausted the rest are appended in uniform random order.
pub fn sketching<R: Rng + ?Sized>(
    rows: &[Vec<String>],
    n: usize,
    interact: bool,
    rng: &mut R,
) -> Result<(Vec<usize>, Vec<f64>)> {
    let x = one_hot_encode(rows, interact);
    let leverage = leverage_scores(&x)?;
    let p = x.ncols() as f64;
    let dist: Vec<f64> = leverage.iter().map(|l| l / p).collect();

    let mut indices = weighted_without_replacement(&dist, n, rng);
    if indices.len() < n {
        let mut rest: Vec<usize> = (0..rows.len()).filter(|&i| dist[i] <= 0.0).collect();
        rest.shuffle(rng);
        indices.extend(rest.into_iter().take(n - indices.len()));
    }
    Ok((indices, dist))
}

/// Successive weighted sampling (Efraimidis-Spirakis keys). Only entries with
/// positive weight are eligible.
fn weighted_without_replacement<R: Rng + ?Sized>(weights: &[f64], n: usize, rng: &mut R) -> Vec<usize> {
    let mut keyed: Vec<(f64, usize)> = weights
        .iter()
        .enumerate()
        .filter(|(_, &w)| w > 0.0 && w.is_finite())
        .map(|(i, &w)| {
            let u: f64 = rng.gen_range(f64::EPSILON..1.0);
            (u.ln() / w, i)
        })
        .collect();
    keyed.sort_by(|a, b| b.0.total_cmp(&a.0));
    keyed.into_iter().take(n).map(|(_, i)| i).collect()
}

/// Likelihood-ratio weights `1 / (N·p)` from inclusion probabilities.
/// Universes that can never be drawn (`p = 0`) get weight 1.
pub fn importance_weights(probabilities: &[f64]) -> Vec<f64> {
    let n = probabilities.len() as f64;
    probabilities
        .iter()
        .map(|&p| {
            let w = 1.0 / (n * p);
            if p > 0.0 && w.is_finite() {
                w
            } else {
                1.0
            }
        })
        .collect()
}

/// Mean outcome over `indices`, each value scaled by its importance weight.
/// Non-finite values are ignored; NaN when none remain.
pub fn get_outcome_mean(y: &[f64], indices: &[usize], weights: Option<&[f64]>) -> f64 {
    let values: Vec<f64> = indices
        .iter()
        .map(|&i| match weights {
            Some(w) => w[i] * y[i],
            None => y[i],
        })
        .filter(|v| v.is_finite())
        .collect();
    mean(&values)
}

/// Outcome mean over the sample with a percentile bootstrap CI. Resampling
/// is uniform over `indices`; weights enter through the statistic.
pub fn bootstrap_outcome(
    y: &[f64],
    indices: &[usize],
    weights: Option<&[f64]>,
    settings: &BootstrapSettings,
    stream: u64,
) -> (f64, f64, f64) {
    let stat = |idx: &[usize]| get_outcome_mean(y, idx, weights);
    let mut bs =
        Bootstrap::new(stat, CiType::Percentile, settings.iterations).with_optional_seed(settings.seed_for(stream));
    bs.fit(indices);
    let (lower, upper) = bs.get_ci(settings.alpha);
    (bs.sample_stat(), lower, upper)
}

/// AD sensitivity of one decision with a `bc` bootstrap CI of the score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionCi {
    pub decision: String,
    pub score: f64,
    pub p: f64,
    pub score_lower: f64,
    pub score_upper: f64,
}

/// Scores decision `dec` over `indices` and, when the score is defined,
/// bootstraps it. The CI stays NaN otherwise.
pub fn bootstrap_decision(
    table: &UniverseTable,
    y: &[f64],
    indices: &[usize],
    dec: usize,
    settings: &BootstrapSettings,
    stream: u64,
) -> DecisionCi {
    let (score, p) = ad_wrapper(&Frame::new(table, y, indices), dec);
    let (mut score_lower, mut score_upper) = (f64::NAN, f64::NAN);
    if !score.is_nan() {
        let stat = |idx: &[usize]| ad_wrapper(&Frame::new(table, y, idx), dec).0;
        let mut bs = Bootstrap::new(stat, CiType::Bc, settings.iterations).with_optional_seed(settings.seed_for(stream));
        bs.fit(indices);
        (score_lower, score_upper) = bs.get_ci(settings.alpha);
    }
    DecisionCi {
        decision: table.decisions()[dec].clone(),
        score,
        p,
        score_lower,
        score_upper,
    }
}

/// [`bootstrap_decision`] for every decision of the table, in order.
pub fn bootstrap_sensitivity(
    table: &UniverseTable,
    y: &[f64],
    indices: &[usize],
    settings: &BootstrapSettings,
) -> Vec<DecisionCi> {
    (0..table.decisions().len())
        .map(|dec| bootstrap_decision(table, y, indices, dec, settings, dec as u64 + 1))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;

    fn factorial(levels: &[&[&str]]) -> Vec<Vec<String>> {
        let mut rows: Vec<Vec<String>> = vec![Vec::new()];
        for opts in levels {
            let mut next = Vec::new();
            for row in &rows {
                for o in opts.iter() {
                    let mut r = row.clone();
                    r.push(o.to_string());
                    next.push(r);
                }
            }
            rows = next;
        }
        rows
    }

    fn table_of(rows: Vec<Vec<String>>) -> UniverseTable {
        let width = rows.first().map_or(0, |r| r.len());
        let header: Vec<String> = (0..width).map(|i| format!("d{}", i)).collect();
        UniverseTable::from_rows(header.clone(), rows, &header).unwrap()
    }

    #[test]
    fn test_round_robin_full_draw_is_permutation() {
        let rows = factorial(&[&["a", "b", "c"], &["x", "y", "z"], &["p", "q"]]);
        let mut rng = StdRng::seed_from_u64(3);
        let (idx, _) = round_robin(&rows, rows.len(), &mut rng);
        assert_eq!(idx.len(), rows.len());
        let set: HashSet<usize> = idx.iter().copied().collect();
        assert_eq!(set.len(), rows.len());
    }

    #[test]
    fn test_round_robin_first_cycle_covers_every_option() {
        let levels: &[&[&str]] = &[&["a", "b", "c"], &["x", "y", "z"], &["p", "q"]];
        let rows = factorial(levels);
        let cycle: usize = levels.iter().map(|l| l.len()).sum();
        for seed in 0..20 {
            let mut rng = StdRng::seed_from_u64(seed);
            let (idx, _) = round_robin(&rows, rows.len(), &mut rng);
            for (d, opts) in levels.iter().enumerate() {
                for o in opts.iter() {
                    assert!(
                        idx[..cycle].iter().any(|&i| rows[i][d] == *o),
                        "seed {} missing {}={}",
                        seed,
                        d,
                        o
                    );
                }
            }
        }
    }

    #[test]
    fn test_round_robin_stops_at_n() {
        let rows = factorial(&[&["a", "b"], &["x", "y"]]);
        let mut rng = StdRng::seed_from_u64(1);
        let (idx, _) = round_robin(&rows, 3, &mut rng);
        assert_eq!(idx.len(), 3);
    }

    #[test]
    fn test_round_robin_weights_positive_and_normalized() {
        let mut rows = factorial(&[&["a", "b", "c"], &["x", "y"]]);
        rows.push(vec!["d".into(), "x".into()]);
        let w = round_robin_weights(&rows);
        assert!((w.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!(w.iter().all(|&v| v > 0.0 && v.is_finite()));
        // the lone "d" universe is always drawn in the first round
        assert!(w[6] > w[0]);
    }

    #[test]
    fn test_round_robin_weights_single_decision() {
        let rows = vec![vec!["a".to_string()], vec!["a".to_string()], vec!["b".to_string()]];
        let w = round_robin_weights(&rows);
        assert!((w[0] - 0.25).abs() < 1e-12);
        assert!((w[2] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_uniform_has_no_duplicates() {
        let mut rng = StdRng::seed_from_u64(9);
        let idx = uniform(10, 10, &mut rng);
        let set: HashSet<usize> = idx.iter().copied().collect();
        assert_eq!(set.len(), 10);
        assert_eq!(uniform(3, 10, &mut rng).len(), 3);
    }

    #[test]
    fn test_one_hot_drop_first() {
        let rows = factorial(&[&["a", "b", "c"], &["x", "y"]]);
        let x = one_hot_encode(&rows, false);
        assert_eq!(x.shape(), (6, 3));
        // ("a", "x") is the all-reference row
        assert_eq!(x.row(0).sum(), 0.0);
    }

    #[test]
    fn test_one_hot_interactions() {
        let rows = factorial(&[&["a", "b"], &["x", "y"]]);
        let x = one_hot_encode(&rows, true);
        // b, y and the b_y interaction
        assert_eq!(x.shape(), (4, 3));
        assert_eq!(x.row(3).sum(), 3.0);
    }

    #[test]
    fn test_leverage_sums_to_rank() {
        let rows = factorial(&[&["a", "b", "c"], &["x", "y"]]);
        let x = one_hot_encode(&rows, false);
        let l = leverage_scores(&x).unwrap();
        assert!((l.iter().sum::<f64>() - 3.0).abs() < 1e-9);
        assert!(l.iter().all(|&v| (-1e-12..=1.0 + 1e-12).contains(&v)));
    }

    #[test]
    fn test_sketching_covers_all_rows_when_n_is_total() {
        let rows = factorial(&[&["a", "b", "c"], &["x", "y"]]);
        let mut rng = StdRng::seed_from_u64(5);
        let (idx, dist) = sketching(&rows, rows.len(), false, &mut rng).unwrap();
        let set: HashSet<usize> = idx.iter().copied().collect();
        assert_eq!(set.len(), rows.len());
        assert_eq!(dist.len(), rows.len());
        assert_eq!(*idx.last().unwrap(), 0);
    }

    #[test]
    fn test_importance_weights() {
        let w = importance_weights(&[0.5, 0.25, 0.25, 0.0]);
        assert_eq!(w, vec![0.5, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_outcome_mean_weighted_and_nan_filtered() {
        let y = [1.0, 2.0, f64::NAN, 4.0];
        assert_eq!(get_outcome_mean(&y, &[0, 1, 2, 3], None), 7.0 / 3.0);
        let w = [2.0, 1.0, 1.0, 0.5];
        assert_eq!(get_outcome_mean(&y, &[0, 3], Some(&w)), 2.0);
        assert!(get_outcome_mean(&y, &[2], None).is_nan());
    }

    #[test]
    fn test_bootstrap_outcome_brackets_mean() {
        let y: Vec<f64> = (1..=8).map(|v| v as f64).collect();
        let idx: Vec<usize> = (0..8).collect();
        let settings = BootstrapSettings { seed: Some(42), ..Default::default() };
        let (m, lo, hi) = bootstrap_outcome(&y, &idx, None, &settings, 0);
        assert_eq!(m, 4.5);
        assert!(lo <= m && m <= hi);
    }

    #[test]
    fn test_bootstrap_sensitivity_skips_ci_for_nan_score() {
        let t = table_of(factorial(&[&["a", "b"], &["x", "y"]]));
        let y = [1.0, 2.0, 3.0, 4.0];
        let idx: Vec<usize> = (0..4).collect();
        let out = bootstrap_sensitivity(&t, &y, &idx, &BootstrapSettings::default());
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].decision, "d0");
        assert!(out[0].score.is_nan() && out[0].score_lower.is_nan());
    }

    #[test]
    fn test_plan_translates_to_uids() {
        let t = table_of(factorial(&[&["a", "b"], &["x", "y"]]));
        let mut rng = StdRng::seed_from_u64(2);
        let plan = PlannerKind::Uniform.plan(&t, 4, &mut rng).unwrap();
        let mut uids = plan.order.clone();
        uids.sort();
        assert_eq!(uids, vec![1, 2, 3, 4]);
        assert!(plan.weights.is_none());
        assert_eq!(plan.prefix_positions(&t, 2).len(), 2);

        let plan = PlannerKind::RoundRobin.plan(&t, 4, &mut rng).unwrap();
        let w = plan.weights.unwrap();
        assert!(w.iter().all(|&v| v > 0.0));
    }

    #[test]
    fn test_planner_kind_parse() {
        assert_eq!("sketching_interact".parse::<PlannerKind>().unwrap(), PlannerKind::SketchingInteract);
        assert!("stratified-ish".parse::<PlannerKind>().is_err());
    }
}
