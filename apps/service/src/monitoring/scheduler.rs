use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior, interval, interval_at, timeout};
use tracing::{debug, info, warn};

use super::pipeline::CheckPipeline;
use super::types::CheckReport;
use crate::error::ValidationError;
use crate::models::{Target, TargetId};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("scheduler is shut down")]
    ShutDown,
}

/// Consumer of every report a scheduled check produces
#[async_trait]
pub trait ReportHandler: Send + Sync {
    async fn handle(&self, target: &Target, report: &CheckReport) -> anyhow::Result<()>;
}

struct ScheduledTarget {
    /// Latest configuration; `None` asks the task to stop after any in-flight check
    control: watch::Sender<Option<Target>>,
    handle: JoinHandle<()>,
}

/// Owns one ticking task per active recurring target
pub struct MonitoringScheduler {
    pipeline: Arc<CheckPipeline>,
    handler: Arc<dyn ReportHandler>,
    min_interval_seconds: u64,
    tasks: HashMap<TargetId, ScheduledTarget>,
    closed: bool,
}

impl MonitoringScheduler {
    pub fn new(pipeline: Arc<CheckPipeline>, handler: Arc<dyn ReportHandler>, min_interval_seconds: u64) -> Self {
        Self { pipeline, handler, min_interval_seconds, tasks: HashMap::new(), closed: false }
    }

    /// Start checking `target`, first check immediately
    pub fn register(&mut self, target: Target) -> Result<(), SchedulerError> {
        if self.closed {
            return Err(SchedulerError::ShutDown);
        }
        if !target.is_recurring() {
            return Err(ValidationError::OneTimeNotSchedulable.into());
        }
        if !target.active {
            return Err(ValidationError::Inactive(target.id).into());
        }
        if self.is_scheduled(target.id) {
            return Err(ValidationError::AlreadyScheduled(target.id).into());
        }

        let target = target.normalized(self.min_interval_seconds)?;
        let id = target.id;
        let (control, updates) = watch::channel(Some(target));
        let handle = tokio::spawn(run_target(Arc::clone(&self.pipeline), Arc::clone(&self.handler), updates));

        self.tasks.insert(id, ScheduledTarget { control, handle });
        Ok(())
    }

    /// Apply a changed target definition from the next tick on.
    ///
    /// Deactivated targets are stopped; active targets that are not running
    /// yet are registered.
    pub fn update(&mut self, target: Target) -> Result<(), SchedulerError> {
        if !target.active || !target.is_recurring() {
            self.unregister(target.id);
            return Ok(());
        }
        if !self.is_scheduled(target.id) {
            self.tasks.remove(&target.id);
            return self.register(target);
        }

        let target = target.normalized(self.min_interval_seconds)?;
        let id = target.id;
        if let Some(scheduled) = self.tasks.get(&id) {
            if scheduled.control.send(Some(target.clone())).is_err() {
                self.tasks.remove(&id);
                return self.register(target);
            }
        }
        debug!(target_id = %id, "Scheduled target updated");
        Ok(())
    }

    /// Cancel future checks. A check already running completes and is handled.
    pub fn unregister(&mut self, id: TargetId) -> bool {
        match self.tasks.remove(&id) {
            Some(scheduled) => {
                let _ = scheduled.control.send(None);
                info!(target_id = %id, "Target unscheduled");
                true
            }
            None => false,
        }
    }

    /// One check outside the schedule; alert state is not touched
    pub async fn run_once(&self, target: &Target) -> CheckReport {
        self.pipeline.run(target).await
    }

    pub fn is_scheduled(&self, id: TargetId) -> bool {
        self.tasks.get(&id).is_some_and(|scheduled| !scheduled.handle.is_finished())
    }

    pub fn scheduled(&self) -> Vec<TargetId> {
        self.tasks.iter().filter(|(_, s)| !s.handle.is_finished()).map(|(id, _)| *id).collect()
    }

    /// Stop every task, giving in-flight checks `grace` to finish
    pub async fn shutdown(&mut self, grace: Duration) {
        self.closed = true;
        let mut handles = Vec::with_capacity(self.tasks.len());
        for (_, scheduled) in self.tasks.drain() {
            let _ = scheduled.control.send(None);
            handles.push(scheduled.handle);
        }

        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        if timeout(grace, join_all(handles)).await.is_err() {
            warn!(tasks = aborts.len(), "Checks still running at shutdown, aborting");
            for abort in aborts {
                abort.abort();
            }
        }
        info!("Scheduler stopped");
    }
}

fn ticker(period: Duration, start: Instant) -> Interval {
    let mut ticker = if start <= Instant::now() { interval(period) } else { interval_at(start, period) };
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

fn period_of(target: &Target) -> Duration {
    target.interval().unwrap_or(Duration::from_secs(60))
}

async fn run_target(
    pipeline: Arc<CheckPipeline>,
    handler: Arc<dyn ReportHandler>,
    mut control: watch::Receiver<Option<Target>>,
) {
    let Some(mut target) = control.borrow_and_update().clone() else {
        return;
    };
    let mut period = period_of(&target);
    let mut timer = ticker(period, Instant::now());
    info!(target_id = %target.id, url = %target.url, interval_seconds = period.as_secs(), "Target scheduled");

    loop {
        tokio::select! {
            _ = timer.tick() => {}
            changed = control.changed() => {
                if changed.is_err() {
                    break;
                }
                match control.borrow_and_update().clone() {
                    Some(updated) => {
                        apply_update(&mut target, updated, &mut period, &mut timer);
                        continue;
                    }
                    None => break,
                }
            }
        }

        let report = pipeline.run(&target).await;
        if let Err(e) = handler.handle(&target, &report).await {
            warn!(target_id = %target.id, error = %e, "Failed to handle check result");
        }

        // Changes that arrived while the check ran.
        if control.has_changed().unwrap_or(true) {
            match control.borrow_and_update().clone() {
                Some(updated) => apply_update(&mut target, updated, &mut period, &mut timer),
                None => break,
            }
        }
    }

    debug!(target_id = %target.id, "Target task stopped");
}

fn apply_update(target: &mut Target, updated: Target, period: &mut Duration, timer: &mut Interval) {
    let new_period = period_of(&updated);
    if new_period != *period {
        *period = new_period;
        *timer = ticker(new_period, Instant::now() + new_period);
    }
    *target = updated;
}
