//! Incremental monitor.
//!
//! A single tokio task owns the [`WatcherState`] and serializes every
//! mutation: commands from [`MonitorHandle`], scheduler firings and finished
//! jobs all arrive on one inbox. Recomputation and the decision-CI bootstrap
//! run on the blocking pool against owned snapshots and post their results
//! back; subscribers receive full-series snapshots over a broadcast channel.
//!
//! Phases: `idle -> running -> stopping -> stopped`, `running` again on
//! resume.
//!
//! Every session (a `start`, or a resume that rehydrates from disk) gets a
//! new generation number. Job results carry the generation they were
//! started under and are dropped if it is no longer current.

pub mod errors;
pub mod run;
pub mod scheduler;
pub mod state;
pub mod update;

use anyhow::{anyhow, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::config::MonitorConfig;
use crate::logging::{log, log_checkpoint, log_phase, log_session_summary, obj, v_str, Domain, Level};
use crate::session::Session;
use crate::stats::sampling::DecisionCi;

use errors::{ErrorClusterer, ErrorGroup};
use run::{read_log_lines, MultiverseRun};
use scheduler::{JobKind, Scheduler};
use state::{MonitorPaths, WatcherState};
use update::{
    ci_rows, decision_cis, recompute, should_recompute, step_size, OutcomeRow, RecomputeInput, RecomputeOutput,
    SensitivityRow,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Idle,
    Running,
    Stopping,
    Stopped,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Running => "running",
            Phase::Stopping => "stopping",
            Phase::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Fail,
}

/// Answer to a monitor command. Failures carry a message instead of data.
#[derive(Debug, Clone, Serialize)]
pub struct Reply<T> {
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> Reply<T> {
    pub fn ok(data: T) -> Self {
        Self {
            status: Status::Success,
            message: None,
            data: Some(data),
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            status: Status::Fail,
            message: Some(message.into()),
            data: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Success
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub logs: Vec<String>,
    pub decisions: Vec<String>,
    pub outcome: Vec<OutcomeRow>,
    pub sensitivity: Vec<SensitivityRow>,
    pub errors: Vec<ErrorGroup>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Progress {
    pub logs: Vec<String>,
    pub is_running: bool,
    pub phase: Phase,
    pub done: usize,
    pub total: usize,
    /// Seconds of cumulative running time.
    pub elapsed: f64,
    /// Estimated seconds until every universe has finished.
    pub time_left: Option<f64>,
}

/// Push notifications. Series events carry the whole series.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MonitorEvent {
    Progress(Progress),
    Outcome { outcome: Vec<OutcomeRow> },
    Sensitivity { decisions: Vec<String>, sensitivity: Vec<SensitivityRow> },
    Errors { errors: Vec<ErrorGroup> },
    Stopped { elapsed: f64 },
    /// The collaborator could not be launched; the session is stopped.
    Failed { message: String },
}

/// `elapsed · (total − done) / max(done, 1)`
pub fn remaining_secs(elapsed: f64, total: usize, done: usize) -> f64 {
    elapsed * total.saturating_sub(done) as f64 / done.max(1) as f64
}

struct RecomputeResult {
    output: RecomputeOutput,
    outcome: Vec<f64>,
    errors: ErrorClusterer,
}

enum Msg {
    Start(oneshot::Sender<Reply<()>>),
    Stop(oneshot::Sender<Reply<()>>),
    Resume(oneshot::Sender<Reply<()>>),
    Snapshot(oneshot::Sender<Reply<Snapshot>>),
    Progress(oneshot::Sender<Reply<Progress>>),
    Fire(JobKind),
    RecomputeDone(u64, Result<RecomputeResult>),
    DecisionCiDone(u64, u64, Result<Vec<DecisionCi>>),
    LaunchFailed(u64, String),
    Shutdown,
}

/// Cloneable front end to a running monitor task.
#[derive(Clone)]
pub struct MonitorHandle {
    tx: mpsc::UnboundedSender<Msg>,
    events: broadcast::Sender<MonitorEvent>,
}

impl MonitorHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<Reply<T>>) -> Msg) -> Result<Reply<T>> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(make(tx)).map_err(|_| anyhow!("monitor is not running"))?;
        rx.await.map_err(|_| anyhow!("monitor dropped the request"))
    }

    pub async fn start(&self) -> Result<Reply<()>> {
        self.request(Msg::Start).await
    }

    pub async fn stop(&self) -> Result<Reply<()>> {
        self.request(Msg::Stop).await
    }

    pub async fn resume(&self) -> Result<Reply<()>> {
        self.request(Msg::Resume).await
    }

    pub async fn snapshot(&self) -> Result<Reply<Snapshot>> {
        self.request(Msg::Snapshot).await
    }

    pub async fn progress(&self) -> Result<Reply<Progress>> {
        self.request(Msg::Progress).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    /// Ends the monitor task and cancels its timers. Jobs in flight finish
    /// but their results are discarded.
    pub fn shutdown(&self) {
        let _ = self.tx.send(Msg::Shutdown);
    }
}

pub struct Monitor {
    cfg: MonitorConfig,
    session: Arc<Session>,
    run: Arc<dyn MultiverseRun>,
    state: Option<WatcherState>,
    phase: Phase,
    scheduler: Scheduler<Msg>,
    tx: mpsc::UnboundedSender<Msg>,
    events: broadcast::Sender<MonitorEvent>,
    errors: ErrorClusterer,
    done: usize,
    seen_running: bool,
    finishing: bool,
    generation: u64,
}

impl Monitor {
    fn new(
        cfg: MonitorConfig,
        session: Arc<Session>,
        run: Arc<dyn MultiverseRun>,
        tx: mpsc::UnboundedSender<Msg>,
        events: broadcast::Sender<MonitorEvent>,
    ) -> Result<Self> {
        let errors = ErrorClusterer::from_config(&cfg)?;
        Ok(Monitor {
            cfg,
            session,
            run,
            state: None,
            phase: Phase::Idle,
            scheduler: Scheduler::new(tx.clone(), Msg::Fire),
            tx,
            events,
            errors,
            done: 0,
            seen_running: false,
            finishing: false,
            generation: 0,
        })
    }

    /// Spawns the monitor task on the current runtime.
    pub fn spawn(cfg: MonitorConfig, session: Arc<Session>, run: Arc<dyn MultiverseRun>) -> Result<MonitorHandle> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(256);
        let monitor = Monitor::new(cfg, session, run, tx.clone(), events.clone())?;
        tokio::spawn(monitor.run_loop(rx));
        Ok(MonitorHandle { tx, events })
    }

    async fn run_loop(mut self, mut rx: mpsc::UnboundedReceiver<Msg>) {
        while let Some(msg) = rx.recv().await {
            match msg {
                Msg::Shutdown => break,
                Msg::Start(reply) => {
                    let r = self.start().await;
                    let _ = reply.send(r);
                }
                Msg::Stop(reply) => {
                    let r = self.stop().await;
                    let _ = reply.send(r);
                }
                Msg::Resume(reply) => {
                    let r = self.resume().await;
                    let _ = reply.send(r);
                }
                Msg::Snapshot(reply) => {
                    let _ = reply.send(Reply::ok(self.snapshot()));
                }
                Msg::Progress(reply) => {
                    let _ = reply.send(Reply::ok(self.progress()));
                }
                Msg::Fire(JobKind::Tick) => self.on_tick(),
                Msg::Fire(JobKind::StopPoll) => self.on_stop_poll(),
                Msg::Fire(_) => {}
                Msg::RecomputeDone(generation, res) => self.on_recompute_done(generation, res),
                Msg::DecisionCiDone(generation, n, res) => self.on_decision_ci_done(generation, n, res),
                Msg::LaunchFailed(generation, message) => self.on_launch_failed(generation, message),
            }
        }
        self.scheduler.shutdown();
        log(Level::Info, Domain::Monitor, "monitor_shutdown", obj(&[("phase", v_str(self.phase.as_str()))]));
    }

    fn set_phase(&mut self, to: Phase, reason: &str) {
        log_phase(self.phase.as_str(), to.as_str(), reason);
        self.phase = to;
    }

    fn publish(&self, event: MonitorEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn total(&self) -> usize {
        self.session.table().len()
    }

    /// Starts a new generation. Jobs still in flight from the previous one
    /// lose their scheduler slots and their results will be dropped.
    fn new_generation(&mut self) {
        self.generation += 1;
        self.scheduler.cancel(JobKind::Recompute);
        self.scheduler.cancel(JobKind::DecisionCi);
    }

    fn is_stale(&self, generation: u64, job: JobKind) -> bool {
        if generation == self.generation {
            return false;
        }
        log(
            Level::Debug,
            Domain::Scheduler,
            "stale_result_dropped",
            obj(&[
                ("job", v_str(job.as_str())),
                ("generation", json!(generation)),
                ("current", json!(self.generation)),
            ]),
        );
        true
    }

    async fn start(&mut self) -> Reply<()> {
        if matches!(self.phase, Phase::Running | Phase::Stopping) || self.run.is_running() {
            return Reply::fail("The multiverse is already running.");
        }
        if self.run.size() != self.total() {
            return Reply::fail(format!(
                "The executor has {} universes but summary.csv lists {}.",
                self.run.size(),
                self.total()
            ));
        }

        let mut rng = match self.cfg.seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        let plan = match self.cfg.sampler.plan(self.session.table(), self.total(), &mut rng) {
            Ok(p) => p,
            Err(e) => return Reply::fail(format!("Cannot build the sampling plan: {:#}", e)),
        };
        let errors = match ErrorClusterer::from_config(&self.cfg) {
            Ok(c) => c,
            Err(e) => return Reply::fail(format!("{:#}", e)),
        };
        let mut state = match WatcherState::create(
            MonitorPaths::in_dir(self.session.data_dir()),
            plan,
            self.session.table().decisions().to_vec(),
            self.session.summary_sha256().to_string(),
        ) {
            Ok(s) => s,
            Err(e) => return Reply::fail(format!("Cannot write the monitor files: {:#}", e)),
        };

        state.start_clock();
        let order = state.plan().order.clone();
        self.new_generation();
        self.state = Some(state);
        self.errors = errors;
        self.done = 0;
        self.seen_running = false;
        self.finishing = false;
        self.set_phase(Phase::Running, "start");
        self.scheduler.every(JobKind::Tick, self.cfg.tick_interval);
        self.launch(order, false);
        Reply::ok(())
    }

    /// Hands the order to the collaborator without blocking the inbox. A
    /// failure comes back as [`Msg::LaunchFailed`].
    fn launch(&self, order: Vec<u64>, resume: bool) {
        let run = self.run.clone();
        let tx = self.tx.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            let res = if resume {
                run.resume_multiverse(order).await
            } else {
                run.run_multiverse(order).await
            };
            if let Err(e) = res {
                log(
                    Level::Error,
                    Domain::Monitor,
                    "run_failed",
                    obj(&[("resume", json!(resume)), ("msg", v_str(&format!("{:#}", e)))]),
                );
                let _ = tx.send(Msg::LaunchFailed(generation, format!("Cannot launch the multiverse: {:#}", e)));
            }
        });
    }

    fn on_launch_failed(&mut self, generation: u64, message: String) {
        if generation != self.generation || self.phase != Phase::Running {
            return;
        }
        self.scheduler.cancel(JobKind::Tick);
        self.finishing = false;
        if let Some(state) = self.state.as_mut() {
            state.freeze_clock();
            if let Err(e) = state.save() {
                log(
                    Level::Error,
                    Domain::Persist,
                    "save_failed",
                    obj(&[("msg", v_str(&format!("{:#}", e)))]),
                );
            }
        }
        self.set_phase(Phase::Stopped, "launch failed");
        self.publish(MonitorEvent::Failed { message });
    }

    async fn stop(&mut self) -> Reply<()> {
        if self.phase != Phase::Running {
            return Reply::fail("The multiverse is not running.");
        }
        if let Err(e) = self.run.stop().await {
            return Reply::fail(format!("Cannot stop the multiverse: {:#}", e));
        }
        self.scheduler.cancel(JobKind::Tick);
        if let Some(state) = self.state.as_mut() {
            state.freeze_clock();
            if let Err(e) = state.save() {
                return Reply::fail(format!("Cannot save the session: {:#}", e));
            }
        }
        self.set_phase(Phase::Stopping, "stop requested");
        self.scheduler.every(JobKind::StopPoll, self.cfg.stop_poll_interval);
        Reply::ok(())
    }

    fn on_stop_poll(&mut self) {
        if self.phase != Phase::Stopping || self.run.is_running() {
            return;
        }
        self.scheduler.cancel(JobKind::StopPoll);
        self.set_phase(Phase::Stopped, "collaborator finished");
        self.announce_stopped();
    }

    fn announce_stopped(&self) {
        let elapsed = self.state.as_ref().map(|s| s.elapsed().as_secs_f64()).unwrap_or(0.0);
        let rows = self.state.as_ref().map(|s| s.outcome().len()).unwrap_or(0);
        let failed: usize = self.errors.groups().iter().map(|g| g.uids.len()).sum();
        log_session_summary(elapsed, self.done, self.total(), rows, failed);
        self.publish(MonitorEvent::Stopped { elapsed });
    }

    async fn resume(&mut self) -> Reply<()> {
        if self.run.is_running() {
            return Reply::fail("The multiverse is still running.");
        }
        if self.phase == Phase::Running {
            return Reply::fail("The multiverse is already running.");
        }
        self.scheduler.cancel(JobKind::StopPoll);

        if self.state.is_none() {
            match WatcherState::load(
                MonitorPaths::in_dir(self.session.data_dir()),
                self.session.table().decisions().to_vec(),
                self.session.summary_sha256(),
            ) {
                Ok(s) => {
                    self.new_generation();
                    self.state = Some(s);
                }
                Err(e) => return Reply::fail(format!("Cannot resume: {:#}", e)),
            }
        }
        let Some(state) = self.state.as_mut() else {
            return Reply::fail("Cannot resume: no sampling plan.");
        };
        state.start_clock();
        let order = state.plan().order.clone();

        self.seen_running = false;
        self.finishing = false;
        self.set_phase(Phase::Running, "resume");
        self.scheduler.every(JobKind::Tick, self.cfg.tick_interval);
        self.launch(order, true);
        Reply::ok(())
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            logs: read_log_lines(&self.run.exit_log_path()),
            decisions: self.session.table().decisions().to_vec(),
            outcome: self.state.as_ref().map(|s| s.outcome().to_vec()).unwrap_or_default(),
            sensitivity: self.state.as_ref().map(|s| s.sensitivity().to_vec()).unwrap_or_default(),
            errors: self.errors.groups().to_vec(),
        }
    }

    fn progress(&self) -> Progress {
        let elapsed = self.state.as_ref().map(|s| s.elapsed().as_secs_f64());
        Progress {
            logs: read_log_lines(&self.run.exit_log_path()),
            is_running: self.run.is_running(),
            phase: self.phase,
            done: self.done,
            total: self.total(),
            elapsed: elapsed.unwrap_or(0.0),
            time_left: elapsed.map(|e| remaining_secs(e, self.total(), self.done)),
        }
    }

    fn on_tick(&mut self) {
        if self.phase != Phase::Running || self.state.is_none() {
            return;
        }
        self.done = self.run.exit_codes().len();
        let running = self.run.is_running();
        if running {
            self.seen_running = true;
        }
        self.publish(MonitorEvent::Progress(self.progress()));

        if !running && (self.seen_running || self.done >= self.total()) {
            self.finishing = true;
            self.scheduler.cancel(JobKind::Tick);
            if !self.schedule_recompute(true) && !self.scheduler.is_active(JobKind::Recompute) {
                self.finalize();
            }
            return;
        }
        self.schedule_recompute(false);
    }

    /// Starts a recompute job if the throttle allows (or `force` and there is
    /// anything new) and none is in flight.
    fn schedule_recompute(&mut self, force: bool) -> bool {
        let Some(state) = self.state.as_ref() else {
            return false;
        };
        let step = step_size(self.total());
        let last = state.last_merge_index;
        let due = if force {
            self.done > last
        } else {
            should_recompute(self.done, last, step, self.cfg.step_boundary)
        };
        if !due || !self.scheduler.begin(JobKind::Recompute) {
            return false;
        }

        let mut input = RecomputeInput {
            table: self.session.table().clone(),
            plan: state.plan().clone(),
            outcome: Vec::new(),
            last_merge_index: last,
            done: self.done,
            step,
            tail: state.outcome_tail(),
            settings: self.cfg.bootstrap_settings(),
        };
        let session = self.session.clone();
        let run = self.run.clone();
        let mut errors = self.errors.clone();
        let tx = self.tx.clone();
        let generation = self.generation;

        tokio::spawn(async move {
            if let Err(e) = run.run_after_execute().await {
                log(
                    Level::Warn,
                    Domain::Monitor,
                    "merge_failed",
                    obj(&[("msg", v_str(&format!("{:#}", e)))]),
                );
            }
            let log_dir = run.log_dir();
            let exits = run.exit_codes();
            let res = tokio::task::spawn_blocking(move || -> Result<RecomputeResult> {
                input.outcome = session.read_partial_point_estimates()?;
                let output = recompute(&input);
                errors.update(&log_dir, &exits);
                Ok(RecomputeResult {
                    output,
                    outcome: input.outcome,
                    errors,
                })
            })
            .await
            .map_err(|e| anyhow!("recompute job panicked: {}", e))
            .and_then(|r| r);
            let _ = tx.send(Msg::RecomputeDone(generation, res));
        });
        true
    }

    fn on_recompute_done(&mut self, generation: u64, res: Result<RecomputeResult>) {
        if self.is_stale(generation, JobKind::Recompute) {
            return;
        }
        self.scheduler.finish(JobKind::Recompute);
        match res {
            Ok(result) => self.merge(result),
            Err(e) => log(
                Level::Error,
                Domain::Monitor,
                "recompute_failed",
                obj(&[("job", v_str(JobKind::Recompute.as_str())), ("msg", v_str(&format!("{:#}", e)))]),
            ),
        }
        if self.finishing && !self.schedule_recompute(true) {
            self.finalize();
        }
    }

    fn merge(&mut self, result: RecomputeResult) {
        let RecomputeResult { output, outcome, errors } = result;

        let errors_changed = errors.groups() != self.errors.groups();
        self.errors = errors;
        if errors_changed {
            self.publish(MonitorEvent::Errors {
                errors: self.errors.groups().to_vec(),
            });
        }

        let Some(state) = self.state.as_mut() else {
            return;
        };
        for r in &output.outcome_rows {
            log_checkpoint(r.n_samples, r.mean, r.lower, r.upper);
        }
        let (outcome_added, sensitivity_added) =
            state.merge_checkpoints(&output.outcome_rows, &output.sensitivity_rows, output.last_merge_index);

        for res in [&outcome_added, &sensitivity_added] {
            if let Err(e) = res {
                log(
                    Level::Error,
                    Domain::Persist,
                    "series_append_failed",
                    obj(&[("msg", v_str(&format!("{:#}", e)))]),
                );
            }
        }
        let outcome_event = matches!(outcome_added, Ok(n) if n > 0).then(|| MonitorEvent::Outcome {
            outcome: state.outcome().to_vec(),
        });
        let sensitivity_event = matches!(sensitivity_added, Ok(n) if n > 0).then(|| MonitorEvent::Sensitivity {
            decisions: state.decisions().to_vec(),
            sensitivity: state.sensitivity().to_vec(),
        });
        for ev in [outcome_event, sensitivity_event].into_iter().flatten() {
            self.publish(ev);
        }

        if let Some(prefix) = output.latest_prefix {
            self.schedule_decision_ci(prefix, outcome);
        }
    }

    /// At most one decision-CI job in flight; a checkpoint arriving while
    /// one runs is skipped and the next recompute tries again.
    fn schedule_decision_ci(&mut self, prefix: Vec<usize>, outcome: Vec<f64>) {
        if !self.scheduler.begin(JobKind::DecisionCi) {
            return;
        }
        let table = self.session.table().clone();
        let settings = self.cfg.bootstrap_settings();
        let n_samples = prefix.len() as u64;
        let tx = self.tx.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            let res = tokio::task::spawn_blocking(move || {
                decision_cis(&table, &outcome, &prefix, &settings, num_cpus::get())
            })
            .await
            .map_err(|e| anyhow!("decision CI job panicked: {}", e));
            let _ = tx.send(Msg::DecisionCiDone(generation, n_samples, res));
        });
    }

    fn on_decision_ci_done(&mut self, generation: u64, n_samples: u64, res: Result<Vec<DecisionCi>>) {
        if self.is_stale(generation, JobKind::DecisionCi) {
            return;
        }
        self.scheduler.finish(JobKind::DecisionCi);
        let cis = match res {
            Ok(c) => c,
            Err(e) => {
                log(
                    Level::Error,
                    Domain::Bootstrap,
                    "decision_ci_failed",
                    obj(&[("msg", v_str(&format!("{:#}", e)))]),
                );
                return;
            }
        };
        let Some(state) = self.state.as_mut() else {
            return;
        };
        match state.update_sensitivity(&ci_rows(n_samples, &cis)) {
            Ok(0) => {}
            Ok(_) => {
                let ev = MonitorEvent::Sensitivity {
                    decisions: state.decisions().to_vec(),
                    sensitivity: state.sensitivity().to_vec(),
                };
                self.publish(ev);
            }
            Err(e) => log(
                Level::Error,
                Domain::Persist,
                "series_append_failed",
                obj(&[("msg", v_str(&format!("{:#}", e)))]),
            ),
        }
    }

    /// The collaborator finished on its own: persist and stop.
    fn finalize(&mut self) {
        self.finishing = false;
        self.scheduler.cancel(JobKind::StopPoll);
        if let Some(state) = self.state.as_mut() {
            state.freeze_clock();
            if let Err(e) = state.save() {
                log(
                    Level::Error,
                    Domain::Persist,
                    "save_failed",
                    obj(&[("msg", v_str(&format!("{:#}", e)))]),
                );
            }
        }
        self.set_phase(Phase::Stopped, "run finished");
        self.announce_stopped();
    }
}
