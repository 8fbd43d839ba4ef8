//! Background job scheduler with an explicit set of active jobs.
//!
//! Interval jobs are tokio tasks that post a firing message to the monitor's
//! inbox. One-shot jobs are only registered here; the monitor spawns them
//! and reports completion with [`Scheduler::finish`].

use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::logging::log_job;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    Tick,
    Recompute,
    DecisionCi,
    StopPoll,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Tick => "tick",
            JobKind::Recompute => "recompute",
            JobKind::DecisionCi => "decision_ci",
            JobKind::StopPoll => "stop_poll",
        }
    }
}

pub struct Scheduler<M> {
    active: HashSet<JobKind>,
    timers: HashMap<JobKind, JoinHandle<()>>,
    tx: UnboundedSender<M>,
    fire: fn(JobKind) -> M,
}

impl<M: Send + 'static> Scheduler<M> {
    /// `fire` wraps a job kind into the inbox message sent on each firing.
    pub fn new(tx: UnboundedSender<M>, fire: fn(JobKind) -> M) -> Self {
        Self {
            active: HashSet::new(),
            timers: HashMap::new(),
            tx,
            fire,
        }
    }

    pub fn is_active(&self, kind: JobKind) -> bool {
        self.active.contains(&kind)
    }

    pub fn active(&self) -> Vec<JobKind> {
        let mut v: Vec<JobKind> = self.active.iter().copied().collect();
        v.sort_by_key(|k| k.as_str());
        v
    }

    /// Fires `kind` every `period`, starting after one period. No-op if the
    /// job is already active.
    pub fn every(&mut self, kind: JobKind, period: Duration) -> bool {
        if !self.active.insert(kind) {
            return false;
        }
        let tx = self.tx.clone();
        let fire = self.fire;
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if tx.send(fire(kind)).is_err() {
                    break;
                }
            }
        });
        self.timers.insert(kind, handle);
        log_job(kind.as_str(), "scheduled");
        true
    }

    /// Registers a one-shot job. Returns false if one is already in flight.
    pub fn begin(&mut self, kind: JobKind) -> bool {
        let fresh = self.active.insert(kind);
        if fresh {
            log_job(kind.as_str(), "started");
        }
        fresh
    }

    pub fn finish(&mut self, kind: JobKind) {
        if self.active.remove(&kind) {
            log_job(kind.as_str(), "finished");
        }
    }

    /// Stops an interval job (or forgets a one-shot registration).
    pub fn cancel(&mut self, kind: JobKind) {
        if let Some(h) = self.timers.remove(&kind) {
            h.abort();
        }
        if self.active.remove(&kind) {
            log_job(kind.as_str(), "cancelled");
        }
    }

    pub fn shutdown(&mut self) {
        for (_, h) in self.timers.drain() {
            h.abort();
        }
        self.active.clear();
    }
}

impl<M> Drop for Scheduler<M> {
    fn drop(&mut self) {
        for (_, h) in self.timers.drain() {
            h.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_interval_job_fires_and_is_exclusive() {
        let (tx, mut rx) = mpsc::unbounded_channel::<JobKind>();
        let mut s = Scheduler::new(tx, |k| k);
        assert!(s.every(JobKind::Tick, Duration::from_millis(5)));
        assert!(!s.every(JobKind::Tick, Duration::from_millis(5)));
        assert_eq!(rx.recv().await, Some(JobKind::Tick));
        s.cancel(JobKind::Tick);
        assert!(!s.is_active(JobKind::Tick));
    }

    #[tokio::test]
    async fn test_one_shot_at_most_once() {
        let (tx, _rx) = mpsc::unbounded_channel::<JobKind>();
        let mut s = Scheduler::new(tx, |k| k);
        assert!(s.begin(JobKind::Recompute));
        assert!(!s.begin(JobKind::Recompute));
        assert!(s.begin(JobKind::DecisionCi));
        assert_eq!(s.active(), vec![JobKind::DecisionCi, JobKind::Recompute]);
        s.finish(JobKind::Recompute);
        assert!(s.begin(JobKind::Recompute));
    }
}
