//! Timer engine driving compiled triggers
//!
//! The engine knows nothing about pipelines. It calls a registered callback
//! each time a trigger fires and re-arms the trigger for its next fire time.
//! [`CronTimerEngine`] runs on tokio-cron-scheduler, one one-shot job per
//! pending fire.

use crate::error::{BridgeError, Result};
use crate::schedule::Trigger;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info};
use uuid::Uuid;

/// Called on every fire. Must return quickly; long work belongs on another task.
pub type FireCallback = Arc<dyn Fn() + Send + Sync>;

/// Identifies one scheduled trigger inside an engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(Uuid);

impl TimerHandle {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TimerHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TimerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TimerEngine: Send + Sync {
    async fn start(&self) -> Result<()>;

    /// Arm `trigger`; `on_fire` runs on each fire until unscheduled
    async fn schedule(&self, trigger: Arc<dyn Trigger>, on_fire: FireCallback) -> Result<TimerHandle>;

    async fn unschedule(&self, handle: TimerHandle) -> Result<()>;

    /// Stop firing everything and release the engine
    async fn shutdown(&self) -> Result<()>;
}

struct Slot {
    trigger: Arc<dyn Trigger>,
    on_fire: FireCallback,
    job: Option<Uuid>,
}

type Slots = Arc<Mutex<HashMap<TimerHandle, Slot>>>;

/// Timer engine backed by tokio-cron-scheduler
pub struct CronTimerEngine {
    scheduler: JobScheduler,
    slots: Slots,
}

impl CronTimerEngine {
    pub async fn new() -> Result<Self> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| BridgeError::Other(format!("Failed to create job scheduler: {}", e)))?;

        Ok(Self {
            scheduler,
            slots: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Number of triggers still armed
    pub fn len(&self) -> usize {
        self.slots.lock().map(|slots| slots.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TimerEngine for CronTimerEngine {
    async fn start(&self) -> Result<()> {
        info!("Starting timer engine");

        self.scheduler
            .start()
            .await
            .map_err(|e| BridgeError::Other(format!("Failed to start scheduler: {}", e)))?;

        info!("Timer engine started successfully");
        Ok(())
    }

    async fn schedule(&self, trigger: Arc<dyn Trigger>, on_fire: FireCallback) -> Result<TimerHandle> {
        let handle = TimerHandle::new();
        lock(&self.slots)?.insert(
            handle,
            Slot {
                trigger,
                on_fire,
                job: None,
            },
        );

        if let Err(e) = arm(self.scheduler.clone(), self.slots.clone(), handle, Utc::now()).await {
            lock(&self.slots)?.remove(&handle);
            return Err(e);
        }
        Ok(handle)
    }

    async fn unschedule(&self, handle: TimerHandle) -> Result<()> {
        let slot = lock(&self.slots)?
            .remove(&handle)
            .ok_or_else(|| BridgeError::UnknownSchedule(handle.to_string()))?;

        if let Some(job) = slot.job {
            // the job may already have fired and been dropped
            if let Err(e) = self.scheduler.remove(&job).await {
                debug!(timer = %handle, "Pending job already gone: {}", e);
            }
        }
        debug!(timer = %handle, "Timer unscheduled");
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        info!("Shutting down timer engine");

        lock(&self.slots)?.clear();
        let mut scheduler = self.scheduler.clone();
        scheduler
            .shutdown()
            .await
            .map_err(|e| BridgeError::Other(format!("Failed to shutdown scheduler: {}", e)))?;

        info!("Timer engine shutdown complete");
        Ok(())
    }
}

fn lock(slots: &Slots) -> Result<MutexGuard<'_, HashMap<TimerHandle, Slot>>> {
    slots
        .lock()
        .map_err(|_| BridgeError::State("timer slot table poisoned".to_string()))
}

fn trigger_for(slots: &Slots, handle: TimerHandle) -> Result<Option<Arc<dyn Trigger>>> {
    Ok(lock(slots)?.get(&handle).map(|slot| slot.trigger.clone()))
}

fn callback_for(slots: &Slots, handle: TimerHandle) -> Option<FireCallback> {
    slots
        .lock()
        .ok()
        .and_then(|slots| slots.get(&handle).map(|slot| slot.on_fire.clone()))
}

/// Remember the pending job; false when the slot was removed meanwhile
fn record_job(slots: &Slots, handle: TimerHandle, job: Uuid) -> Result<bool> {
    Ok(match lock(slots)?.get_mut(&handle) {
        Some(slot) => {
            slot.job = Some(job);
            true
        }
        None => false,
    })
}

/// Queue a one-shot job for the trigger's next fire strictly after `after`
fn arm(
    scheduler: JobScheduler,
    slots: Slots,
    handle: TimerHandle,
    after: DateTime<Utc>,
) -> BoxFuture<'static, Result<()>> {
    async move {
        let Some(trigger) = trigger_for(&slots, handle)? else {
            return Ok(());
        };

        let Some(fire_at) = trigger.next_fire_after(after) else {
            info!(timer = %handle, "Trigger has no further fire times, retiring timer");
            lock(&slots)?.remove(&handle);
            return Ok(());
        };

        let delay = (fire_at - Utc::now()).to_std().unwrap_or_default();
        let job_slots = slots.clone();
        let job = Job::new_one_shot_at_instant_async(Instant::now() + delay, move |_uuid, scheduler| {
            Box::pin(fire(scheduler, job_slots.clone(), handle, fire_at))
        })
        .map_err(|e| BridgeError::SchedulerArm {
            schedule: handle.to_string(),
            message: e.to_string(),
        })?;

        let job_id = scheduler.add(job).await.map_err(|e| BridgeError::SchedulerArm {
            schedule: handle.to_string(),
            message: e.to_string(),
        })?;

        if !record_job(&slots, handle, job_id)? {
            let _ = scheduler.remove(&job_id).await;
            return Ok(());
        }

        debug!(timer = %handle, %fire_at, "Timer armed");
        Ok(())
    }
    .boxed()
}

async fn fire(scheduler: JobScheduler, slots: Slots, handle: TimerHandle, fire_at: DateTime<Utc>) {
    let Some(callback) = callback_for(&slots, handle) else {
        debug!(timer = %handle, "Fire for a timer that is no longer scheduled");
        return;
    };

    debug!(timer = %handle, %fire_at, "Timer fired");
    callback();

    // a late fire must not queue a burst of catch-up fires
    let after = Utc::now().max(fire_at);
    if let Err(e) = arm(scheduler, slots, handle, after).await {
        error!(timer = %handle, "Failed to re-arm timer: {}", e);
    }
}
