//! Offline multiverse summary: outcome mean with a bootstrap CI and the
//! sensitivity of every decision, computed over all finished universes.

use anyhow::{anyhow, Result};
use serde_json::json;

use multiverse_monitor::config::MonitorConfig;
use multiverse_monitor::logging::{log, obj, v_num, v_str, Domain, Level, ProfileScope};
use multiverse_monitor::session::Session;
use multiverse_monitor::stats::sampling::bootstrap_outcome;
use multiverse_monitor::stats::sensitivity::cal_sensitivity;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = MonitorConfig::from_env()?;
    let session = Session::load(&cfg.data_dir)?;
    session.check_result_files()?;

    let field = session.overview().point_estimate()?.field.clone();
    let (outcome, quality) = session.read_point_estimates()?;
    quality.log_warnings(&field);

    let settings = cfg.bootstrap_settings();
    let summary = tokio::task::spawn_blocking(move || -> Result<_> {
        let _prof = ProfileScope::new("offline_summary");
        let table = session.table();
        let decisions = &session.overview().decisions;
        let scores = cal_sensitivity(table, &outcome, decisions, session.overview().sensitivity)?;
        let finite: Vec<usize> = (0..table.len()).filter(|&i| outcome[i].is_finite()).collect();
        let ci = bootstrap_outcome(&outcome, &finite, None, &settings, 0);
        Ok((scores, ci, finite.len(), session.overview().sensitivity))
    })
    .await
    .map_err(|e| anyhow!("summary job panicked: {}", e))??;

    let (scores, (mean, lower, upper), n, method) = summary;
    log(
        Level::Info,
        Domain::Bootstrap,
        "outcome_ci",
        obj(&[
            ("field", v_str(&field)),
            ("n_samples", json!(n)),
            ("mean", v_num(mean)),
            ("lower", v_num(lower)),
            ("upper", v_num(upper)),
            ("alpha", v_num(settings.alpha)),
        ]),
    );
    for (decision, score) in &scores {
        log(
            Level::Info,
            Domain::Sensitivity,
            "sensitivity",
            obj(&[
                ("decision", v_str(decision)),
                ("method", v_str(method.as_str())),
                ("score", v_num(*score)),
            ]),
        );
    }
    Ok(())
}
