//! Resilient iteration loop.
//!
//! Runs one unit of application logic over and over until cancelled. Every
//! iteration gets a fresh unit from its [`WorkFactory`], so resources such as
//! connections and transactions never carry over between iterations. Errors
//! and panics from either acquiring the unit or running it go to the
//! [`FailureHandler`], followed by a mandatory backoff; they never end the
//! loop.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, warn};

use crate::error::{Error, Result};
use crate::telemetry::metrics;
use crate::telemetry::work::start_iteration_span;

/// Lower bound on the pause after a failed iteration.
pub const MIN_FAILURE_BACKOFF: Duration = Duration::from_millis(100);

/// What one iteration accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Work was done; the loop goes straight into the next iteration.
    Processed(usize),
    /// Nothing to do; the loop waits `idle_delay` first.
    Idle,
}

/// One iteration's worth of application logic.
#[async_trait]
pub trait UnitOfWork: Send {
    async fn run(&mut self, cancel: &CancellationToken) -> Result<Outcome>;
}

/// Produces a fresh, independently scoped unit for each iteration.
///
/// Acquiring the unit can fail (e.g. no connection available); such failures
/// are handled exactly like failures inside `run`.
#[async_trait]
pub trait WorkFactory: Send + Sync + 'static {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>>;
}

/// Decides what happens after a failed iteration.
pub trait FailureHandler: Send + Sync {
    /// Report `error` and return how long to back off before the next
    /// iteration. The loop never waits less than its configured minimum.
    fn on_failure(&self, error: &Error, span: &Span) -> Duration;
}

/// Logs the failure and backs off for a fixed delay.
#[derive(Debug, Clone)]
pub struct LogFailureHandler {
    backoff: Duration,
}

impl LogFailureHandler {
    pub fn new(backoff: Duration) -> Self {
        Self { backoff }
    }
}

impl FailureHandler for LogFailureHandler {
    fn on_failure(&self, error: &Error, span: &Span) -> Duration {
        error!(parent: span, error = %error, backoff = ?self.backoff, "iteration failed");
        self.backoff
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Running,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Name used in logs, spans, and metrics.
    pub name: String,
    pub idle_delay: Duration,
    /// Floor for the failure handler's backoff.
    pub min_backoff: Duration,
    /// Time an in-flight iteration gets to unwind after cancellation before
    /// it is aborted.
    pub shutdown_grace: Duration,
}

impl LoopConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            idle_delay: Duration::from_secs(1),
            min_backoff: MIN_FAILURE_BACKOFF,
            shutdown_grace: Duration::from_secs(5),
        }
    }

    pub fn idle_delay(mut self, delay: Duration) -> Self {
        self.idle_delay = delay;
        self
    }

    pub fn min_backoff(mut self, backoff: Duration) -> Self {
        self.min_backoff = backoff;
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

/// Counters reported when a loop stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub iterations: u64,
    pub processed: u64,
    pub failures: u64,
}

pub struct ResilientLoop {
    config: LoopConfig,
    factory: Arc<dyn WorkFactory>,
    handler: Arc<dyn FailureHandler>,
    state: watch::Sender<LoopState>,
}

impl ResilientLoop {
    pub fn new(
        config: LoopConfig,
        factory: Arc<dyn WorkFactory>,
        handler: Arc<dyn FailureHandler>,
    ) -> Self {
        let (state, _) = watch::channel(LoopState::Stopped);
        Self {
            config,
            factory,
            handler,
            state,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Watch the loop move between `Running` and `Stopped`.
    pub fn state(&self) -> watch::Receiver<LoopState> {
        self.state.subscribe()
    }

    /// Run on a background task until `cancel` fires.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<LoopStats> {
        tokio::spawn(async move { self.run(cancel).await })
    }

    /// Iterate until `cancel` fires. Cancellation is the only way out.
    pub async fn run(&self, cancel: CancellationToken) -> LoopStats {
        let mut stats = LoopStats::default();
        self.state.send_replace(LoopState::Running);
        info!(loop_name = %self.config.name, "loop started");

        while !cancel.is_cancelled() {
            stats.iterations += 1;
            let span = start_iteration_span(&self.config.name, stats.iterations);

            let pause = match self.iterate(&cancel, span.clone()).await {
                Ok(Outcome::Processed(n)) => {
                    stats.processed += n as u64;
                    Duration::ZERO
                }
                Ok(Outcome::Idle) => self.config.idle_delay,
                Err(e) => {
                    stats.failures += 1;
                    metrics::loop_failures()
                        .add(1, &[KeyValue::new("loop", self.config.name.clone())]);
                    self.backoff_for(&e, &span)
                }
            };

            if !pause.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }

        self.state.send_replace(LoopState::Stopped);
        info!(
            loop_name = %self.config.name,
            iterations = stats.iterations,
            processed = stats.processed,
            failures = stats.failures,
            "loop stopped"
        );
        stats
    }

    /// Acquire and run one unit on its own task.
    ///
    /// The task is always awaited, so the unit and everything it owns is
    /// dropped before this returns.
    async fn iterate(&self, cancel: &CancellationToken, span: Span) -> Result<Outcome> {
        let factory = Arc::clone(&self.factory);
        let token = cancel.clone();
        let mut task = tokio::spawn(
            async move {
                let mut unit = factory.begin().await?;
                unit.run(&token).await
            }
            .instrument(span),
        );

        tokio::select! {
            biased;
            joined = &mut task => joined.unwrap_or_else(|e| Err(Error::from_join(e))),
            _ = cancel.cancelled() => {
                match tokio::time::timeout(self.config.shutdown_grace, &mut task).await {
                    Ok(joined) => joined.unwrap_or_else(|e| Err(Error::from_join(e))),
                    Err(_) => {
                        warn!(
                            loop_name = %self.config.name,
                            grace = ?self.config.shutdown_grace,
                            "iteration ignored cancellation; aborting"
                        );
                        task.abort();
                        if let Err(e) = task.await
                            && !e.is_cancelled()
                        {
                            debug!("aborted iteration ended with {e}");
                        }
                        Ok(Outcome::Idle)
                    }
                }
            }
        }
    }

    fn backoff_for(&self, error: &Error, span: &Span) -> Duration {
        let requested = catch_unwind(AssertUnwindSafe(|| self.handler.on_failure(error, span)))
            .unwrap_or_else(|_| {
                error!(parent: span, error = %error, "failure handler panicked");
                self.config.min_backoff
            });
        requested.max(self.config.min_backoff)
    }
}
