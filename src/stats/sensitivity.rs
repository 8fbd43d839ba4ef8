//! Decision sensitivity: how much the choice of option for one decision moves
//! the outcome distribution.
//!
//! Three interchangeable statistics are provided (F-test, median pairwise
//! Kolmogorov-Smirnov, k-sample Anderson-Darling). The monitor streams the
//! Anderson-Darling score through [`ad_wrapper`], which refuses to score
//! decisions whose groups are too small.

use anyhow::{anyhow, Result};
use nalgebra::{DMatrix, DVector};

use crate::config::{Decision, SensitivityMethod};
use crate::data::{Frame, UniverseTable};
use crate::logging::{log, obj, v_num, v_str, Domain, Level};
use crate::stats::special::{mean, median};

/// Minimum finite observations per option before the AD test is attempted.
pub const MIN_GROUP_SIZE: usize = 3;

/// Significance levels tabulated by Scholz & Stephens (1987).
const AD_SIG: [f64; 7] = [0.25, 0.1, 0.05, 0.025, 0.01, 0.005, 0.001];
const AD_B0: [f64; 7] = [0.675, 1.281, 1.645, 1.96, 2.326, 2.573, 3.085];
const AD_B1: [f64; 7] = [-0.245, 0.25, 0.678, 1.149, 1.822, 2.364, 3.615];
const AD_B2: [f64; 7] = [-0.105, -0.305, -0.362, -0.391, -0.396, -0.345, -0.154];

/// Finite outcomes per configured option, skipping options with no data.
fn non_empty_groups(frame: &Frame, dec: usize, options: &[String]) -> Vec<Vec<f64>> {
    options
        .iter()
        .map(|opt| frame.group(dec, opt))
        .filter(|g| !g.is_empty())
        .collect()
}

/// One-way F statistic: between-group over within-group mean square.
///
/// Returns 0 with fewer than two populated groups. NaN is possible when the
/// within-group variance is degenerate; callers decide whether that is fatal.
pub fn sensitivity_f(frame: &Frame, dec: usize, options: &[String]) -> f64 {
    let groups = non_empty_groups(frame, dec, options);
    if options.len() < 2 || groups.len() < 2 {
        return 0.0;
    }

    let all: Vec<f64> = groups.iter().flatten().copied().collect();
    let x_mean = mean(&all);
    let k = groups.len() as f64;

    let ms_b = groups
        .iter()
        .map(|g| g.len() as f64 * (mean(g) - x_mean).powi(2))
        .sum::<f64>()
        / (k - 1.0);
    let ms_w = groups
        .iter()
        .map(|g| {
            let m = mean(g);
            g.iter().map(|v| (v - m).powi(2)).sum::<f64>()
        })
        .sum::<f64>()
        / (all.len() as f64 - k);

    ms_b / ms_w
}

/// Two-sample Kolmogorov-Smirnov statistic `sup |F_a - F_b|`.
pub fn ks_2samp(a: &[f64], b: &[f64]) -> f64 {
    if a.is_empty() || b.is_empty() {
        return f64::NAN;
    }
    let mut a = a.to_vec();
    let mut b = b.to_vec();
    a.sort_by(f64::total_cmp);
    b.sort_by(f64::total_cmp);

    let (na, nb) = (a.len() as f64, b.len() as f64);
    let (mut i, mut j) = (0usize, 0usize);
    let mut d: f64 = 0.0;
    while i < a.len() && j < b.len() {
        let x = a[i].min(b[j]);
        while i < a.len() && a[i] <= x {
            i += 1;
        }
        while j < b.len() && b[j] <= x {
            j += 1;
        }
        d = d.max((i as f64 / na - j as f64 / nb).abs());
    }
    d
}

/// Median of the pairwise KS statistics between option groups.
pub fn sensitivity_ks(frame: &Frame, dec: usize, options: &[String]) -> f64 {
    let groups = non_empty_groups(frame, dec, options);
    if options.len() < 2 || groups.len() < 2 {
        return 0.0;
    }
    let mut kss = Vec::new();
    for i in 0..groups.len() {
        for j in (i + 1)..groups.len() {
            kss.push(ks_2samp(&groups[i], &groups[j]));
        }
    }
    median(&kss)
}

/// Result of the k-sample Anderson-Darling test.
#[derive(Debug, Clone, PartialEq)]
pub struct AndersonKsamp {
    /// Normalized statistic `(A²kN - (k - 1)) / σ`.
    pub statistic: f64,
    pub critical_values: [f64; 7],
    /// Approximate p-value, within `[0.001, 0.25]`.
    pub significance_level: f64,
}

/// Number of elements of sorted `s` strictly less than `x`.
fn count_lt(s: &[f64], x: f64) -> usize {
    s.partition_point(|&v| v < x)
}

/// Number of elements of sorted `s` less than or equal to `x`.
fn count_le(s: &[f64], x: f64) -> usize {
    s.partition_point(|&v| v <= x)
}

/// k-sample Anderson-Darling test, midrank version for data with ties
/// (Scholz & Stephens 1987).
///
/// Fails with fewer than two samples, an empty sample, or fewer than two
/// distinct values overall.
pub fn anderson_ksamp(samples: &[Vec<f64>]) -> Result<AndersonKsamp> {
    let k = samples.len();
    if k < 2 {
        return Err(anyhow!("anderson_ksamp needs at least two samples"));
    }
    if samples.iter().any(|s| s.is_empty()) {
        return Err(anyhow!("anderson_ksamp encountered an empty sample"));
    }

    let mut z: Vec<f64> = samples.iter().flatten().copied().collect();
    z.sort_by(f64::total_cmp);
    let n_total = z.len();
    let mut z_star = z.clone();
    z_star.dedup();
    if z_star.len() < 2 {
        return Err(anyhow!("anderson_ksamp needs at least two distinct observations"));
    }

    let big_n = n_total as f64;
    let no_ties = z_star.len() == n_total;
    let lj: Vec<f64> = z_star
        .iter()
        .map(|&x| if no_ties { 1.0 } else { (count_le(&z, x) - count_lt(&z, x)) as f64 })
        .collect();
    let bj: Vec<f64> = z_star
        .iter()
        .zip(&lj)
        .map(|(&x, l)| count_lt(&z, x) as f64 + l / 2.0)
        .collect();

    let mut a2akn = 0.0;
    for sample in samples {
        let mut s = sample.clone();
        s.sort_by(f64::total_cmp);
        let ni = s.len() as f64;
        let mut inner = 0.0;
        for (idx, &x) in z_star.iter().enumerate() {
            let right = count_le(&s, x) as f64;
            let fij = right - count_lt(&s, x) as f64;
            let mij = right - fij / 2.0;
            let (l, b) = (lj[idx], bj[idx]);
            inner += l / big_n * (big_n * mij - b * ni).powi(2) / (b * (big_n - b) - big_n * l / 4.0);
        }
        a2akn += inner / ni;
    }
    a2akn *= (big_n - 1.0) / big_n;

    let h_small: f64 = samples.iter().map(|s| 1.0 / s.len() as f64).sum();
    // hs_cs[j] = Σ_{i=N-1-j}^{N-1} 1/i for j = 0..N-3
    let mut hs_cs = Vec::with_capacity(n_total.saturating_sub(2));
    let mut acc = 0.0;
    for i in (2..n_total).rev() {
        acc += 1.0 / i as f64;
        hs_cs.push(acc);
    }
    let h = hs_cs.last().copied().unwrap_or(0.0) + 1.0;
    let g: f64 = hs_cs.iter().enumerate().map(|(j, v)| v / (j + 2) as f64).sum();

    let kf = k as f64;
    let a = (4.0 * g - 6.0) * (kf - 1.0) + (10.0 - 6.0 * g) * h_small;
    let b = (2.0 * g - 4.0) * kf.powi(2) + 8.0 * h * kf + (2.0 * g - 14.0 * h - 4.0) * h_small - 8.0 * h
        + 4.0 * g
        - 6.0;
    let c = (6.0 * h + 2.0 * g - 2.0) * kf.powi(2) + (4.0 * h - 4.0 * g + 6.0) * kf + (2.0 * h - 6.0) * h_small
        + 4.0 * h;
    let d = (2.0 * h + 6.0) * kf.powi(2) - 4.0 * h * kf;
    let sigmasq = (a * big_n.powi(3) + b * big_n.powi(2) + c * big_n + d)
        / ((big_n - 1.0) * (big_n - 2.0) * (big_n - 3.0));
    if !sigmasq.is_finite() || sigmasq <= 0.0 {
        return Err(anyhow!("anderson_ksamp variance is degenerate (N = {})", n_total));
    }

    let m = kf - 1.0;
    let statistic = (a2akn - m) / sigmasq.sqrt();

    let mut critical_values = [0.0; 7];
    for i in 0..7 {
        critical_values[i] = AD_B0[i] + AD_B1[i] / m.sqrt() + AD_B2[i] / m;
    }

    let crit_min = critical_values.iter().copied().fold(f64::INFINITY, f64::min);
    let crit_max = critical_values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let significance_level = if statistic < crit_min {
        AD_SIG[0]
    } else if statistic > crit_max {
        AD_SIG[6]
    } else {
        let coef = quadratic_fit(&critical_values, &AD_SIG.map(f64::ln))?;
        (coef[0] * statistic * statistic + coef[1] * statistic + coef[2]).exp()
    };

    Ok(AndersonKsamp {
        statistic,
        critical_values,
        significance_level,
    })
}

/// Least-squares `y ≈ c0·x² + c1·x + c2`, highest power first.
fn quadratic_fit(x: &[f64], y: &[f64]) -> Result<[f64; 3]> {
    let design = DMatrix::from_fn(x.len(), 3, |r, c| x[r].powi(2 - c as i32));
    let rhs = DVector::from_column_slice(y);
    let sol = design
        .svd(true, true)
        .solve(&rhs, 1e-12)
        .map_err(|e| anyhow!("quadratic fit failed: {}", e))?;
    Ok([sol[0], sol[1], sol[2]])
}

/// AD statistic and significance level over the configured options.
/// `(0, 1)` with fewer than two populated options.
pub fn sensitivity_ad(frame: &Frame, dec: usize, options: &[String]) -> Result<(f64, f64)> {
    let groups = non_empty_groups(frame, dec, options);
    if options.len() < 2 || groups.len() < 2 {
        return Ok((0.0, 1.0));
    }
    let ad = anderson_ksamp(&groups)?;
    Ok((ad.statistic, ad.significance_level))
}

/// AD test over the options present in `frame`, guarded by a minimum group
/// size. Every present option (including the empty value of an omitted
/// decision) needs [`MIN_GROUP_SIZE`] finite outcomes, else `(NaN, NaN)`;
/// numerical failures of the test also give `(NaN, NaN)`.
pub fn ad_wrapper(frame: &Frame, dec: usize) -> (f64, f64) {
    let counts = frame.group_counts(dec);
    if counts.iter().any(|(_, n)| *n < MIN_GROUP_SIZE) {
        return (f64::NAN, f64::NAN);
    }
    let options: Vec<String> = counts.into_iter().map(|(opt, _)| opt).collect();
    sensitivity_ad(frame, dec, &options).unwrap_or((f64::NAN, f64::NAN))
}

/// Whole-multiverse sensitivity of every decision with `method`, over all
/// universes with a finite outcome. A NaN F statistic is an error naming the
/// decision.
pub fn cal_sensitivity(
    table: &UniverseTable,
    outcome: &[f64],
    decisions: &[Decision],
    method: SensitivityMethod,
) -> Result<Vec<(String, f64)>> {
    let rows: Vec<usize> = (0..table.len()).filter(|&r| outcome[r].is_finite()).collect();
    let frame = Frame::new(table, outcome, &rows);

    let mut out = Vec::with_capacity(decisions.len());
    for d in decisions {
        let dec = table
            .decision_index(&d.var)
            .ok_or_else(|| anyhow!("decision \"{}\" is not in the universe table", d.var))?;
        let score = match method {
            SensitivityMethod::F => {
                let s = sensitivity_f(&frame, dec, &d.options);
                if s.is_nan() {
                    log(
                        Level::Error,
                        Domain::Sensitivity,
                        "f_test_nan",
                        obj(&[("decision", v_str(&d.var)), ("msg", v_str("cannot compute sensitivity"))]),
                    );
                    return Err(anyhow!(
                        "cannot compute sensitivity: F-test of decision \"{}\" is NaN",
                        d.var
                    ));
                }
                s
            }
            SensitivityMethod::Ks => sensitivity_ks(&frame, dec, &d.options),
            SensitivityMethod::Ad => sensitivity_ad(&frame, dec, &d.options)
                .map_err(|e| anyhow!("decision \"{}\": {}", d.var, e))?
                .0,
        };
        log(
            Level::Debug,
            Domain::Sensitivity,
            "decision_score",
            obj(&[
                ("decision", v_str(&d.var)),
                ("method", v_str(method.as_str())),
                ("score", v_num(score)),
            ]),
        );
        out.push((d.var.clone(), score));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(values: &[(&str, &str)]) -> UniverseTable {
        let rows = values.iter().map(|(a, b)| vec![a.to_string(), b.to_string()]).collect();
        UniverseTable::from_rows(
            vec!["a".into(), "b".into()],
            rows,
            &["a".to_string(), "b".to_string()],
        )
        .unwrap()
    }

    fn opts(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_f_single_option_is_zero() {
        let t = table(&[("x", "p"), ("x", "q")]);
        let y = [1.0, 2.0];
        let rows = [0, 1];
        let f = Frame::new(&t, &y, &rows);
        assert_eq!(sensitivity_f(&f, 0, &opts(&["x"])), 0.0);
        assert_eq!(sensitivity_f(&f, 0, &opts(&["x", "y"])), 0.0);
    }

    #[test]
    fn test_f_separates_groups() {
        let t = table(&[("x", "p"), ("x", "q"), ("y", "p"), ("y", "q")]);
        let y = [1.0, 2.0, 10.0, 11.0];
        let rows = [0, 1, 2, 3];
        let f = Frame::new(&t, &y, &rows);
        // ms_b = 4 * 4.5^2 / 1 = 81, ms_w = (4 * 0.25) / 2 = 0.5
        assert!((sensitivity_f(&f, 0, &opts(&["x", "y"])) - 162.0).abs() < 1e-9);
        assert!(sensitivity_f(&f, 1, &opts(&["p", "q"])) > 0.0);
    }

    #[test]
    fn test_ks_statistic() {
        assert_eq!(ks_2samp(&[1.0, 2.0, 3.0], &[4.0, 5.0]), 1.0);
        assert_eq!(ks_2samp(&[1.0, 2.0], &[1.0, 2.0]), 0.0);
        assert!((ks_2samp(&[1.0, 2.0, 3.0, 4.0], &[3.0, 4.0, 5.0, 6.0]) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_anderson_ksamp_identical_samples() {
        let s = vec![vec![1.0, 2.0, 3.0, 4.0], vec![1.0, 2.0, 3.0, 4.0]];
        let ad = anderson_ksamp(&s).unwrap();
        assert!(ad.statistic < 0.0);
        assert_eq!(ad.significance_level, 0.25);
    }

    #[test]
    fn test_anderson_ksamp_separated_samples() {
        let s = vec![
            (0..20).map(|i| i as f64).collect::<Vec<_>>(),
            (0..20).map(|i| 100.0 + i as f64).collect::<Vec<_>>(),
        ];
        let ad = anderson_ksamp(&s).unwrap();
        assert!(ad.statistic > ad.critical_values[6]);
        assert_eq!(ad.significance_level, 0.001);
    }

    #[test]
    fn test_anderson_ksamp_interpolated_p_in_range() {
        let s = vec![
            vec![0.1, 0.5, 0.9, 1.3, 1.7, 2.2, 2.8, 3.1],
            vec![0.8, 1.4, 1.9, 2.5, 2.9, 3.4, 3.9, 4.4],
        ];
        let ad = anderson_ksamp(&s).unwrap();
        assert!(ad.significance_level > 0.0 && ad.significance_level < 0.3);
    }

    #[test]
    fn test_anderson_ksamp_rejects_degenerate_input() {
        assert!(anderson_ksamp(&[vec![1.0, 2.0]]).is_err());
        assert!(anderson_ksamp(&[vec![1.0], vec![]]).is_err());
        assert!(anderson_ksamp(&[vec![1.0, 1.0], vec![1.0, 1.0]]).is_err());
    }

    #[test]
    fn test_ad_wrapper_small_group_is_nan() {
        let t = table(&[("x", "p"), ("x", "p"), ("x", "p"), ("y", "p"), ("y", "p")]);
        let y = [1.0, 2.0, 3.0, 4.0, 5.0];
        let rows = [0, 1, 2, 3, 4];
        let (s, p) = ad_wrapper(&Frame::new(&t, &y, &rows), 0);
        assert!(s.is_nan() && p.is_nan());
    }

    #[test]
    fn test_ad_wrapper_single_option_is_zero_one() {
        let t = table(&[("x", "p"), ("x", "p"), ("x", "p")]);
        let y = [1.0, 2.0, 3.0];
        let rows = [0, 1, 2];
        assert_eq!(ad_wrapper(&Frame::new(&t, &y, &rows), 1), (0.0, 1.0));
    }

    #[test]
    fn test_ad_wrapper_counts_only_finite_outcomes() {
        let t = table(&[("x", "p"), ("x", "p"), ("x", "p"), ("y", "p"), ("y", "p"), ("y", "p")]);
        let y = [1.0, 2.0, 3.0, 4.0, f64::NAN, 6.0];
        let rows = [0, 1, 2, 3, 4, 5];
        assert!(ad_wrapper(&Frame::new(&t, &y, &rows), 0).0.is_nan());
    }

    #[test]
    fn test_ad_wrapper_scores_valid_groups() {
        let t = table(&[("x", "p"), ("x", "p"), ("x", "p"), ("y", "p"), ("y", "p"), ("y", "p")]);
        let y = [1.0, 2.0, 3.0, 7.0, 8.0, 9.0];
        let rows = [0, 1, 2, 3, 4, 5];
        let (s, p) = ad_wrapper(&Frame::new(&t, &y, &rows), 0);
        assert!(s.is_finite());
        assert!(p > 0.0 && p < 0.3);
    }

    #[test]
    fn test_cal_sensitivity_f_nan_is_fatal() {
        let t = table(&[("x", "p"), ("y", "q")]);
        let y = [1.0, 2.0];
        let decisions = vec![Decision {
            var: "a".into(),
            options: opts(&["x", "y"]),
        }];
        let err = cal_sensitivity(&t, &y, &decisions, SensitivityMethod::F).unwrap_err();
        assert!(err.to_string().contains("\"a\""));
    }

    #[test]
    fn test_cal_sensitivity_ks() {
        let t = table(&[("x", "p"), ("x", "q"), ("y", "p"), ("y", "q")]);
        let y = [1.0, 2.0, 10.0, 11.0];
        let decisions = vec![
            Decision { var: "a".into(), options: opts(&["x", "y"]) },
            Decision { var: "b".into(), options: opts(&["p", "q"]) },
        ];
        let res = cal_sensitivity(&t, &y, &decisions, SensitivityMethod::Ks).unwrap();
        assert_eq!(res[0], ("a".to_string(), 1.0));
        assert_eq!(res[1], ("b".to_string(), 0.5));
    }
}
