//! Scheduled dispatch: recurring tasks on fixed intervals.
//!
//! Each registered entry gets its own timer task. The task fires once
//! immediately and then every interval. A firing runs in its own spawned task
//! and is awaited by the timer, so an error or panic is logged and the timer
//! carries on.
//!
//! Config-driven schedules go through a [`TaskRegistry`]: an explicit map from
//! a textual key to a factory, resolved once at startup.

use std::any::type_name;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use opentelemetry::KeyValue;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::config::ScheduleConfig;
use crate::error::{Error, Result};
use crate::telemetry::metrics;

/// A unit of work fired by the scheduler.
#[async_trait]
pub trait ScheduledTask: Send + Sync + 'static {
    /// Name used in logs and metrics.
    fn name(&self) -> &str;

    async fn fire(&self, cancel: &CancellationToken) -> Result<()>;
}

/// Adapter for synchronous units of work.
pub struct FnTask<F> {
    name: String,
    f: F,
}

impl<F> FnTask<F>
where
    F: Fn() -> Result<()> + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<F> ScheduledTask for FnTask<F>
where
    F: Fn() -> Result<()> + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn fire(&self, _cancel: &CancellationToken) -> Result<()> {
        (self.f)()
    }
}

/// A task and the interval it fires at.
#[derive(Clone)]
pub struct ScheduleEntry {
    pub task: Arc<dyn ScheduledTask>,
    pub interval: Duration,
}

impl ScheduleEntry {
    pub fn new(task: Arc<dyn ScheduledTask>, interval: Duration) -> Self {
        Self { task, interval }
    }
}

impl std::fmt::Debug for ScheduleEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduleEntry")
            .field("task", &self.task.name())
            .field("interval", &self.interval)
            .finish()
    }
}

/// Time an in-flight firing gets to finish after `stop()` before it is
/// aborted.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Runs registered entries until stopped.
pub struct Scheduler {
    cancel: CancellationToken,
    timers: Mutex<Vec<JoinHandle<()>>>,
    shutdown_grace: Duration,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            timers: Mutex::new(Vec::new()),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    /// Bound how long `stop()` waits on a firing that ignores cancellation.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Start firing `entry`: once now, then every `entry.interval`.
    pub fn register(&self, entry: ScheduleEntry) -> Result<()> {
        if entry.interval.is_zero() {
            return Err(Error::Config(format!(
                "scheduled task {} has a zero interval",
                entry.task.name()
            )));
        }
        if self.cancel.is_cancelled() {
            return Err(Error::Other(format!(
                "scheduler stopped; cannot register {}",
                entry.task.name()
            )));
        }

        info!(task = entry.task.name(), interval = ?entry.interval, "scheduled task registered");
        let handle = tokio::spawn(drive(
            entry,
            self.cancel.child_token(),
            self.shutdown_grace,
        ));
        self.timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
        Ok(())
    }

    /// Register every entry, stopping at the first invalid one.
    pub fn register_all(&self, entries: impl IntoIterator<Item = ScheduleEntry>) -> Result<()> {
        entries.into_iter().try_for_each(|entry| self.register(entry))
    }

    /// Stop all timers and wait for in-flight firings to finish.
    ///
    /// Idempotent. No firing starts after this is called, and a firing still
    /// running after the shutdown grace is aborted.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let timers = std::mem::take(
            &mut *self.timers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for timer in timers {
            if let Err(e) = timer.await {
                error!("scheduler timer task failed: {e}");
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn drive(entry: ScheduleEntry, cancel: CancellationToken, grace: Duration) {
    let mut ticker = tokio::time::interval(entry.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        // A tick that raced with stop must not fire.
        if cancel.is_cancelled() {
            break;
        }
        fire_guarded(&entry.task, &cancel, grace).await;
    }

    debug!(task = entry.task.name(), "scheduled task stopped");
}

/// Fire once, containing errors and panics.
///
/// Once `cancel` fires, the firing has `grace` to finish before it is aborted.
async fn fire_guarded(
    task: &Arc<dyn ScheduledTask>,
    cancel: &CancellationToken,
    grace: Duration,
) {
    let name = task.name().to_string();
    let span = info_span!("workq.schedule.fire", task = %name);
    let start = Instant::now();

    let mut firing = {
        let task = Arc::clone(task);
        let cancel = cancel.clone();
        tokio::spawn(async move { task.fire(&cancel).await }.instrument(span.clone()))
    };

    let joined = tokio::select! {
        biased;
        joined = &mut firing => joined,
        _ = cancel.cancelled() => match tokio::time::timeout(grace, &mut firing).await {
            Ok(joined) => joined,
            Err(_) => {
                warn!(parent: &span, ?grace, "scheduled task ignored cancellation; aborting");
                firing.abort();
                firing.await
            }
        },
    };
    let result = joined.unwrap_or_else(|e| Err(Error::from_join(e)));

    let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
    let outcome = match &result {
        Ok(()) => {
            debug!(parent: &span, elapsed_ms, "scheduled task fired");
            "ok"
        }
        Err(e) => {
            error!(parent: &span, error = %e, elapsed_ms, "scheduled task failed");
            "error"
        }
    };
    metrics::schedule_firings().add(
        1,
        &[
            KeyValue::new("task", name.clone()),
            KeyValue::new("result", outcome),
        ],
    );
    metrics::operation_duration_ms().record(
        elapsed_ms,
        &[KeyValue::new("operation", format!("schedule.{name}"))],
    );
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

type TaskFactory<C> = Box<dyn Fn(&C) -> Result<Arc<dyn ScheduledTask>> + Send + Sync>;

/// Maps schedule keys to task factories.
///
/// `C` is whatever the factories need to build their task, such as a store
/// handle and policy settings.
pub struct TaskRegistry<C> {
    factories: HashMap<String, TaskFactory<C>>,
}

impl<C: 'static> TaskRegistry<C> {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a factory under an explicit key.
    pub fn register<F>(&mut self, key: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&C) -> Result<Arc<dyn ScheduledTask>> + Send + Sync + 'static,
    {
        self.factories.insert(key.into(), Box::new(factory));
        self
    }

    /// Register a factory keyed by the fully-qualified name of `T`
    /// (e.g. `workq::sweep::StaleClaimSweeper`).
    pub fn register_type<T, F>(&mut self, factory: F) -> &mut Self
    where
        T: ScheduledTask,
        F: Fn(&C) -> Result<T> + Send + Sync + 'static,
    {
        self.register(type_name::<T>(), move |ctx: &C| {
            factory(ctx).map(|task| Arc::new(task) as Arc<dyn ScheduledTask>)
        })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.factories.contains_key(key)
    }

    /// Instantiate a single task.
    pub fn build(&self, key: &str, ctx: &C) -> Result<Arc<dyn ScheduledTask>> {
        let factory = self
            .factories
            .get(key)
            .ok_or_else(|| Error::UnknownTask(key.to_string()))?;
        factory(ctx)
    }

    /// Instantiate every configured entry. Any unknown key fails the whole
    /// resolution.
    pub fn resolve(&self, config: &ScheduleConfig, ctx: &C) -> Result<Vec<ScheduleEntry>> {
        config
            .entries
            .iter()
            .map(|(key, interval)| Ok(ScheduleEntry::new(self.build(key, ctx)?, *interval)))
            .collect()
    }
}

impl<C: 'static> Default for TaskRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}
