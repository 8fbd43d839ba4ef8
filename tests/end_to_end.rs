use multiverse_monitor::config::SensitivityMethod;
use multiverse_monitor::session::Session;
use multiverse_monitor::stats::sampling::{bootstrap_outcome, get_outcome_mean, PlannerKind};
use multiverse_monitor::stats::sensitivity::cal_sensitivity;
use multiverse_monitor::stats::BootstrapSettings;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// Eight universes over a 2x2 design, replicated twice; universe `u` scored `u`.
fn write_multiverse(dir: &Path, sensitivity: &str) {
    let overview = format!(
        r#"{{
            "decisions": [
                {{"var": "a", "options": ["x", "y"]}},
                {{"var": "b", "options": ["p", "q"]}}
            ],
            "visualizer": {{
                "files": [{{"id": "est", "path": "estimate.csv"}}],
                "schema": {{"point_estimate": {{"file": "est", "field": "estimate"}}}},
                "sensitivity": "{}"
            }}
        }}"#,
        sensitivity
    );
    fs::write(dir.join("overview.json"), overview).unwrap();

    let mut summary = String::from("Filename,a,b\n");
    let mut estimates = String::from("uid,estimate\n");
    for i in 0..8 {
        let a = if i % 2 == 0 { "x" } else { "y" };
        let b = if i < 4 { "p" } else { "q" };
        summary.push_str(&format!("universe_{}.R,{},{}\n", i + 1, a, b));
        estimates.push_str(&format!("{},{}\n", i + 1, i + 1));
    }
    fs::write(dir.join("summary.csv"), summary).unwrap();
    fs::write(dir.join("estimate.csv"), estimates).unwrap();
}

#[test]
fn uniform_plan_over_everything_recovers_the_mean() {
    let dir = TempDir::new().unwrap();
    write_multiverse(dir.path(), "f");
    let session = Session::load(dir.path()).unwrap();
    session.check_result_files().unwrap();
    let (y, quality) = session.read_point_estimates().unwrap();
    assert_eq!(quality.failed, 0);

    let table = session.table();
    let mut rng = StdRng::seed_from_u64(3);
    let plan = PlannerKind::Uniform.plan(table, 8, &mut rng).unwrap();
    assert!(plan.weights.is_none());
    let prefix = plan.prefix_positions(table, plan.len());
    assert_eq!(prefix.len(), 8);

    let mean = get_outcome_mean(&y, &prefix, None);
    assert!((mean - 4.5).abs() < 1e-12);

    let settings = BootstrapSettings {
        iterations: 100,
        alpha: 0.05,
        seed: Some(11),
    };
    let (m, lo, hi) = bootstrap_outcome(&y, &prefix, None, &settings, 0);
    assert!((m - 4.5).abs() < 1e-12);
    assert!(lo <= m && m <= hi);

    let scores = cal_sensitivity(table, &y, &session.overview().decisions, SensitivityMethod::F).unwrap();
    assert_eq!(scores.len(), 2);
    for (_, s) in &scores {
        assert!(s.is_finite() && *s >= 0.0);
    }
    // b separates the outcomes far more than a
    assert!(scores[1].1 > scores[0].1);
}

#[test]
fn every_planner_visits_each_universe_once() {
    let dir = TempDir::new().unwrap();
    write_multiverse(dir.path(), "ks");
    let session = Session::load(dir.path()).unwrap();
    let table = session.table();

    for kind in [
        PlannerKind::RoundRobin,
        PlannerKind::Uniform,
        PlannerKind::Sketching,
        PlannerKind::SketchingInteract,
    ] {
        let mut rng = StdRng::seed_from_u64(5);
        let plan = kind.plan(table, 8, &mut rng).unwrap();
        let distinct: HashSet<u64> = plan.order.iter().copied().collect();
        assert_eq!(distinct.len(), 8, "{}", kind);
        assert!(plan.order.iter().all(|&u| (1..=8).contains(&u)), "{}", kind);
        if let Some(w) = &plan.weights {
            assert_eq!(w.len(), 8);
            assert!(w.iter().all(|v| v.is_finite() && *v > 0.0), "{}", kind);
        }
    }
}

#[test]
fn failed_universes_are_left_out_of_the_summary() {
    let dir = TempDir::new().unwrap();
    write_multiverse(dir.path(), "ks");
    fs::write(dir.path().join("estimate.csv"), "uid,estimate\n1,1\n2,2\n3,NaN\n4,4\n5,5\n").unwrap();
    let session = Session::load(dir.path()).unwrap();
    let (y, quality) = session.read_point_estimates().unwrap();
    assert_eq!(quality.failed, 3);
    assert_eq!(quality.non_finite, 1);

    let all: Vec<usize> = (0..8).collect();
    let mean = get_outcome_mean(&y, &all, None);
    assert!((mean - 3.0).abs() < 1e-12);

    let scores = cal_sensitivity(session.table(), &y, &session.overview().decisions, SensitivityMethod::Ks).unwrap();
    assert!(scores.iter().all(|(_, s)| s.is_finite()));
}
