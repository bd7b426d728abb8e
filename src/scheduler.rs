//! Schedule service: binds triggers to pipeline roots
//!
//! Each registered pipeline becomes a [`ScheduledRun`] under a fresh
//! [`ScheduleId`]. A run moves through Registered, Armed, Firing and Stopped.
//! A fire that arrives while the same run is still executing is skipped, not
//! queued. Fires of different runs are independent.

use crate::command::{dispose, prepare_run, Command};
use crate::error::{BridgeError, Result};
use crate::execution::{execute_once, run_to_end, RunSummary};
use crate::metrics::MetricsServer;
use crate::parameters::ParameterSet;
use crate::schedule::ScheduleInfo;
use crate::timer::{FireCallback, TimerEngine, TimerHandle};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Process-unique schedule identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScheduleId(Uuid);

impl ScheduleId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for ScheduleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Registered,
    Armed,
    Firing,
    Stopped,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Registered => write!(f, "registered"),
            RunState::Armed => write!(f, "armed"),
            RunState::Firing => write!(f, "firing"),
            RunState::Stopped => write!(f, "stopped"),
        }
    }
}

/// What happened to one fire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FireOutcome {
    /// Root ran to the end without failed steps
    Completed(RunSummary),
    /// Root ran to the end, some steps failed
    Failed(RunSummary),
    /// Previous fire of the same run was still executing
    Skipped,
    /// Run is not armed (never armed, or stopped)
    NotArmed,
}

impl FireOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            FireOutcome::Completed(_) => "completed",
            FireOutcome::Failed(_) => "failed",
            FireOutcome::Skipped => "skipped",
            FireOutcome::NotArmed => "not_armed",
        }
    }
}

struct RunStatus {
    state: RunState,
    in_flight: bool,
    timer: Option<TimerHandle>,
    disposed: bool,
}

/// One schedule bound to one root command
pub struct ScheduledRun {
    id: ScheduleId,
    name: String,
    schedule: ScheduleInfo,
    root: Box<dyn Command>,
    status: Mutex<RunStatus>,
    metrics: Option<MetricsServer>,
}

impl ScheduledRun {
    pub fn id(&self) -> ScheduleId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schedule(&self) -> &ScheduleInfo {
        &self.schedule
    }

    pub fn root(&self) -> &dyn Command {
        self.root.as_ref()
    }

    pub fn state(&self) -> RunState {
        self.lock_status().state
    }

    // a command that panicked mid-run must not wedge the run
    fn lock_status(&self) -> MutexGuard<'_, RunStatus> {
        self.status.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Execute the root once against an empty set, unless already executing
    pub fn fire(&self) -> FireOutcome {
        {
            let mut status = self.lock_status();
            if status.in_flight {
                warn!(
                    schedule = %self.id,
                    name = self.name.as_str(),
                    "Previous run still executing, fire skipped"
                );
                drop(status);
                self.record(&FireOutcome::Skipped, 0.0);
                return FireOutcome::Skipped;
            }
            if status.state != RunState::Armed {
                debug!(schedule = %self.id, state = %status.state, "Fire ignored, run not armed");
                drop(status);
                self.record(&FireOutcome::NotArmed, 0.0);
                return FireOutcome::NotArmed;
            }
            status.state = RunState::Firing;
            status.in_flight = true;
        }

        let _guard = InFlightGuard::new(self);
        let started = Instant::now();
        info!(
            schedule = %self.id,
            name = self.name.as_str(),
            root = self.root.name(),
            "Scheduled run started"
        );

        prepare_run(self.root.as_ref());
        let summary = run_to_end(execute_once(self.root.as_ref(), ParameterSet::new()));
        let duration = started.elapsed().as_secs_f64();

        let outcome = if summary.is_success() {
            info!(
                schedule = %self.id,
                name = self.name.as_str(),
                steps = summary.steps,
                duration_secs = duration,
                "Scheduled run completed"
            );
            FireOutcome::Completed(summary)
        } else {
            let failure = BridgeError::SchedulerJob {
                schedule: self.id.to_string(),
                root: self.root.name().to_string(),
                message: summary.first_error.clone().unwrap_or_default(),
            };
            error!(
                schedule = %self.id,
                name = self.name.as_str(),
                steps = summary.steps,
                failures = summary.failures,
                "{}",
                failure
            );
            FireOutcome::Failed(summary)
        };

        self.record(&outcome, duration);
        outcome
    }

    fn record(&self, outcome: &FireOutcome, duration: f64) {
        let Some(metrics) = &self.metrics else {
            return;
        };
        let (steps, failures) = match outcome {
            FireOutcome::Completed(summary) | FireOutcome::Failed(summary) => {
                (summary.steps, summary.failures)
            }
            _ => (0, 0),
        };
        metrics.record_fire(&self.name, outcome.label(), steps, failures, duration);
    }

    /// Mark stopped. Returns the timer to remove and whether the tree can be
    /// disposed right away.
    fn mark_stopped(&self) -> (Option<TimerHandle>, bool) {
        let mut status = self.lock_status();
        status.state = RunState::Stopped;
        let dispose_now = !status.in_flight && !status.disposed;
        if dispose_now {
            status.disposed = true;
        }
        (status.timer.take(), dispose_now)
    }

    fn dispose_tree(&self) {
        match dispose(self.root.as_ref()) {
            Ok(()) => debug!(schedule = %self.id, "Pipeline tree disposed"),
            Err(e) => error!(schedule = %self.id, root = self.root.name(), "Failed to dispose pipeline: {}", e),
        }
    }
}

/// Clears the in-flight flag when a fire ends, including by panic
struct InFlightGuard<'a> {
    run: &'a ScheduledRun,
}

impl<'a> InFlightGuard<'a> {
    fn new(run: &'a ScheduledRun) -> Self {
        if let Some(metrics) = &run.metrics {
            metrics.inc_runs_in_flight();
        }
        Self { run }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if let Some(metrics) = &self.run.metrics {
            metrics.dec_runs_in_flight();
        }

        let dispose_now = {
            let mut status = self.run.lock_status();
            status.in_flight = false;
            match status.state {
                RunState::Firing => {
                    status.state = RunState::Armed;
                    false
                }
                RunState::Stopped if !status.disposed => {
                    status.disposed = true;
                    true
                }
                _ => false,
            }
        };

        if dispose_now {
            info!(schedule = %self.run.id, "Run stopped while firing, disposing after completion");
            self.run.dispose_tree();
        }
    }
}

/// Registry of scheduled pipelines
pub struct ScheduleService {
    engine: Arc<dyn TimerEngine>,
    runs: Mutex<HashMap<ScheduleId, Arc<ScheduledRun>>>,
    metrics: Option<MetricsServer>,
}

impl ScheduleService {
    pub fn new(engine: Arc<dyn TimerEngine>) -> Self {
        Self {
            engine,
            runs: Mutex::new(HashMap::new()),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsServer) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn start(&self) -> Result<()> {
        self.engine.start().await
    }

    /// Stop every run, then shut the timer engine down
    pub async fn shutdown(&self) -> Result<()> {
        let stopped = self.stop_all().await;
        self.engine.shutdown().await?;
        stopped
    }

    fn lock_runs(&self) -> Result<MutexGuard<'_, HashMap<ScheduleId, Arc<ScheduledRun>>>> {
        self.runs
            .lock()
            .map_err(|_| BridgeError::State("schedule registry poisoned".to_string()))
    }

    /// Look up a registered run
    pub fn run(&self, id: ScheduleId) -> Result<Arc<ScheduledRun>> {
        self.lock_runs()?
            .get(&id)
            .cloned()
            .ok_or_else(|| BridgeError::UnknownSchedule(id.to_string()))
    }

    fn take(&self, id: ScheduleId) -> Result<Arc<ScheduledRun>> {
        self.lock_runs()?
            .remove(&id)
            .ok_or_else(|| BridgeError::UnknownSchedule(id.to_string()))
    }

    /// Bind `schedule` to `root` without starting a timer
    pub fn register(
        &self,
        name: impl Into<String>,
        schedule: ScheduleInfo,
        root: Box<dyn Command>,
    ) -> Result<ScheduleId> {
        schedule.validate()?;

        let id = ScheduleId::new();
        let name = name.into();
        info!(schedule = %id, name = name.as_str(), root = root.name(), "Registering {}", schedule);

        let run = Arc::new(ScheduledRun {
            id,
            name,
            schedule,
            root,
            status: Mutex::new(RunStatus {
                state: RunState::Registered,
                in_flight: false,
                timer: None,
                disposed: false,
            }),
            metrics: self.metrics.clone(),
        });
        self.lock_runs()?.insert(id, run);
        Ok(id)
    }

    /// Install the run's trigger in the timer engine
    ///
    /// A failure to arm stops and deregisters that run only.
    pub async fn arm(&self, id: ScheduleId) -> Result<()> {
        let run = self.run(id)?;
        {
            let mut status = run.lock_status();
            if status.state != RunState::Registered {
                return Err(BridgeError::State(format!(
                    "schedule '{}' is {}, only registered schedules can be armed",
                    id, status.state
                )));
            }
            status.state = RunState::Armed;
        }

        let armed = match run.schedule.compile(Utc::now()) {
            Ok(trigger) => {
                self.engine
                    .schedule(trigger, fire_callback(run.clone(), Handle::current()))
                    .await
            }
            Err(e) => Err(e),
        };

        let timer = match armed {
            Ok(timer) => timer,
            Err(e) => {
                let _ = self.take(id);
                let (_, dispose_now) = run.mark_stopped();
                if dispose_now {
                    run.dispose_tree();
                }
                let e = match e {
                    e @ BridgeError::SchedulerArm { .. } => e,
                    other => BridgeError::SchedulerArm {
                        schedule: id.to_string(),
                        message: other.to_string(),
                    },
                };
                error!(schedule = %id, "{}", e);
                return Err(e);
            }
        };

        let stopped_meanwhile = {
            let mut status = run.lock_status();
            if status.state == RunState::Stopped {
                true
            } else {
                status.timer = Some(timer);
                false
            }
        };
        if stopped_meanwhile {
            self.engine.unschedule(timer).await?;
            return Ok(());
        }

        info!(schedule = %id, name = run.name(), "Schedule armed");
        Ok(())
    }

    /// Register and arm in one call
    pub async fn schedule(
        &self,
        name: impl Into<String>,
        schedule: ScheduleInfo,
        root: Box<dyn Command>,
    ) -> Result<ScheduleId> {
        let id = self.register(name, schedule, root)?;
        self.arm(id).await?;
        Ok(id)
    }

    /// Fire a run now, on the calling thread
    pub fn fire(&self, id: ScheduleId) -> Result<FireOutcome> {
        Ok(self.run(id)?.fire())
    }

    /// Remove the trigger, deregister and dispose the tree
    ///
    /// A fire in progress is not aborted; the tree is disposed when it ends.
    pub async fn stop(&self, id: ScheduleId) -> Result<()> {
        let run = self.take(id)?;
        let (timer, dispose_now) = run.mark_stopped();

        if let Some(timer) = timer {
            if let Err(e) = self.engine.unschedule(timer).await {
                warn!(schedule = %id, "Failed to remove trigger: {}", e);
            }
        }

        if dispose_now {
            run.dispose_tree();
        } else {
            info!(schedule = %id, "Run in progress, disposal deferred");
        }
        info!(schedule = %id, name = run.name(), "Schedule stopped");
        Ok(())
    }

    /// Stop every run; returns the first error
    pub async fn stop_all(&self) -> Result<()> {
        let mut first_error = None;
        for id in self.ids() {
            if let Err(e) = self.stop(id).await {
                error!(schedule = %id, "Failed to stop schedule: {}", e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn state(&self, id: ScheduleId) -> Option<RunState> {
        self.run(id).ok().map(|run| run.state())
    }

    pub fn ids(&self) -> Vec<ScheduleId> {
        self.lock_runs()
            .map(|runs| runs.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.lock_runs().map(|runs| runs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Timer callback: run the fire on the blocking pool so adapter calls never
/// stall the timer loop
fn fire_callback(run: Arc<ScheduledRun>, runtime: Handle) -> FireCallback {
    Arc::new(move || {
        let run = run.clone();
        let id = run.id;
        let root = run.root.name().to_string();
        let task = runtime.spawn_blocking(move || run.fire());
        runtime.spawn(async move {
            if let Err(e) = task.await {
                let failure = BridgeError::SchedulerJob {
                    schedule: id.to_string(),
                    root,
                    message: e.to_string(),
                };
                error!(schedule = %id, "{}", failure);
            }
        });
    })
}
