//! Resilient loop behavior under failures, panics, and cancellation.
//!
//! Runs on paused time; every unit reports `Idle` or fails, so the loop
//! always sleeps between iterations and virtual time can advance.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::Span;
use workq::error::{Error, Result};
use workq::runner::{
    FailureHandler, LoopConfig, LoopState, Outcome, ResilientLoop, UnitOfWork, WorkFactory,
};

#[derive(Default)]
struct Counters {
    begins: AtomicUsize,
    runs: AtomicUsize,
    live: AtomicUsize,
    overlapped: AtomicBool,
}

enum Failure {
    None,
    RunEvery(usize),
    PanicEvery(usize),
    BeginEvery(usize),
}

struct Unit {
    counters: Arc<Counters>,
    failure: Arc<Failure>,
}

impl Drop for Unit {
    fn drop(&mut self) {
        self.counters.live.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl UnitOfWork for Unit {
    async fn run(&mut self, _cancel: &CancellationToken) -> Result<Outcome> {
        let n = self.counters.runs.fetch_add(1, Ordering::SeqCst) + 1;
        match *self.failure {
            Failure::RunEvery(k) if n % k == 0 => Err(Error::Other(format!("run {n} failed"))),
            Failure::PanicEvery(k) if n % k == 0 => panic!("run {n} panicked"),
            _ => Ok(Outcome::Idle),
        }
    }
}

struct Factory {
    counters: Arc<Counters>,
    failure: Arc<Failure>,
}

impl Factory {
    fn new(failure: Failure) -> (Arc<Self>, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let factory = Arc::new(Self {
            counters: Arc::clone(&counters),
            failure: Arc::new(failure),
        });
        (factory, counters)
    }
}

#[async_trait]
impl WorkFactory for Factory {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>> {
        let n = self.counters.begins.fetch_add(1, Ordering::SeqCst) + 1;
        if let Failure::BeginEvery(k) = *self.failure
            && n % k == 0
        {
            return Err(Error::Other(format!("no connection for begin {n}")));
        }
        // The previous iteration's unit must be gone before a new one starts.
        if self.counters.live.fetch_add(1, Ordering::SeqCst) != 0 {
            self.counters.overlapped.store(true, Ordering::SeqCst);
        }
        Ok(Box::new(Unit {
            counters: Arc::clone(&self.counters),
            failure: Arc::clone(&self.failure),
        }))
    }
}

#[derive(Default)]
struct Recorder {
    errors: Mutex<Vec<String>>,
}

impl FailureHandler for Recorder {
    fn on_failure(&self, error: &Error, _span: &Span) -> Duration {
        self.errors.lock().unwrap().push(error.to_string());
        Duration::from_secs(1)
    }
}

fn config() -> LoopConfig {
    LoopConfig::new("test")
        .idle_delay(Duration::from_secs(1))
        .min_backoff(Duration::from_secs(1))
}

/// Run for `secs` virtual seconds plus a half-second margin, then cancel.
async fn run_for(
    secs: u64,
    factory: Arc<dyn WorkFactory>,
    handler: Arc<Recorder>,
) -> workq::runner::LoopStats {
    let runner = Arc::new(ResilientLoop::new(config(), factory, handler));
    let cancel = CancellationToken::new();
    let handle = runner.spawn(cancel.clone());
    tokio::time::sleep(Duration::from_millis(secs * 1000 + 500)).await;
    cancel.cancel();
    handle.await.unwrap()
}

#[tokio::test(start_paused = true)]
async fn failing_iterations_are_handled_once_each() {
    let (factory, counters) = Factory::new(Failure::RunEvery(3));
    let handler = Arc::new(Recorder::default());

    // One iteration per virtual second: t = 0..=10.
    let stats = run_for(10, factory, handler.clone()).await;

    assert_eq!(stats.iterations, 11);
    assert_eq!(stats.failures, 3);
    assert_eq!(counters.runs.load(Ordering::SeqCst), 11);
    let errors = handler.errors.lock().unwrap();
    assert_eq!(errors.len(), 3);
    assert_eq!(errors[0], "run 3 failed");
    assert_eq!(errors[2], "run 9 failed");
}

#[tokio::test(start_paused = true)]
async fn panicking_iterations_do_not_stop_the_loop() {
    let (factory, counters) = Factory::new(Failure::PanicEvery(2));
    let handler = Arc::new(Recorder::default());

    let stats = run_for(5, factory, handler.clone()).await;

    assert_eq!(stats.iterations, 6);
    assert_eq!(stats.failures, 3);
    assert_eq!(counters.runs.load(Ordering::SeqCst), 6);
    let errors = handler.errors.lock().unwrap();
    assert!(errors.iter().all(|e| e.contains("panicked")), "{errors:?}");
    assert!(!counters.overlapped.load(Ordering::SeqCst));
    assert_eq!(counters.live.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn begin_failures_go_to_the_handler() {
    let (factory, counters) = Factory::new(Failure::BeginEvery(2));
    let handler = Arc::new(Recorder::default());

    let stats = run_for(5, factory, handler.clone()).await;

    assert_eq!(stats.iterations, 6);
    assert_eq!(stats.failures, 3);
    assert_eq!(counters.runs.load(Ordering::SeqCst), 3);
    let errors = handler.errors.lock().unwrap();
    assert!(errors.iter().all(|e| e.starts_with("no connection")));
}

#[tokio::test(start_paused = true)]
async fn units_never_overlap_across_iterations() {
    let (factory, counters) = Factory::new(Failure::None);
    let handler = Arc::new(Recorder::default());

    let stats = run_for(20, factory, handler.clone()).await;

    assert_eq!(stats.failures, 0);
    assert!(handler.errors.lock().unwrap().is_empty());
    assert!(!counters.overlapped.load(Ordering::SeqCst));
    assert_eq!(counters.live.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn zero_backoff_is_raised_to_the_floor() {
    struct Eager;

    impl FailureHandler for Eager {
        fn on_failure(&self, _error: &Error, _span: &Span) -> Duration {
            Duration::ZERO
        }
    }

    // Every run fails; without the floor this would spin.
    let (factory, counters) = Factory::new(Failure::RunEvery(1));
    let runner = Arc::new(ResilientLoop::new(config(), factory, Arc::new(Eager)));
    let cancel = CancellationToken::new();
    let handle = runner.spawn(cancel.clone());
    tokio::time::sleep(Duration::from_millis(3500)).await;
    cancel.cancel();
    let stats = handle.await.unwrap();

    assert_eq!(stats.failures, 4);
    assert_eq!(counters.runs.load(Ordering::SeqCst), 4);
}

#[tokio::test(start_paused = true)]
async fn panicking_handler_still_backs_off() {
    struct Broken;

    impl FailureHandler for Broken {
        fn on_failure(&self, _error: &Error, _span: &Span) -> Duration {
            panic!("handler bug");
        }
    }

    let (factory, counters) = Factory::new(Failure::RunEvery(1));
    let runner = Arc::new(ResilientLoop::new(config(), factory, Arc::new(Broken)));
    let cancel = CancellationToken::new();
    let handle = runner.spawn(cancel.clone());
    tokio::time::sleep(Duration::from_millis(2500)).await;
    cancel.cancel();
    let stats = handle.await.unwrap();

    assert_eq!(stats.failures, 3);
    assert_eq!(counters.runs.load(Ordering::SeqCst), 3);
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

struct Stubborn {
    dropped: Arc<AtomicBool>,
}

impl Drop for Stubborn {
    fn drop(&mut self) {
        self.dropped.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl UnitOfWork for Stubborn {
    async fn run(&mut self, _cancel: &CancellationToken) -> Result<Outcome> {
        // Ignores cancellation entirely.
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(Outcome::Processed(1))
    }
}

struct StubbornFactory {
    dropped: Arc<AtomicBool>,
}

#[async_trait]
impl WorkFactory for StubbornFactory {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>> {
        Ok(Box::new(Stubborn {
            dropped: Arc::clone(&self.dropped),
        }))
    }
}

#[tokio::test(start_paused = true)]
async fn stubborn_iteration_is_aborted_after_the_grace_period() {
    let dropped = Arc::new(AtomicBool::new(false));
    let runner = Arc::new(ResilientLoop::new(
        LoopConfig::new("stubborn").shutdown_grace(Duration::from_secs(2)),
        Arc::new(StubbornFactory {
            dropped: Arc::clone(&dropped),
        }),
        Arc::new(Recorder::default()),
    ));
    let mut state = runner.state();
    let cancel = CancellationToken::new();
    let handle = Arc::clone(&runner).spawn(cancel.clone());

    state.wait_for(|s| *s == LoopState::Running).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    let cancelled_at = tokio::time::Instant::now();
    cancel.cancel();
    let stats = handle.await.unwrap();

    assert!(cancelled_at.elapsed() >= Duration::from_secs(2));
    assert!(cancelled_at.elapsed() < Duration::from_secs(3));
    assert!(dropped.load(Ordering::SeqCst), "unit dropped before run returned");
    assert_eq!(stats.iterations, 1);
    assert_eq!(stats.processed, 0);
    assert_eq!(*runner.state().borrow(), LoopState::Stopped);
}

struct Cooperative;

#[async_trait]
impl UnitOfWork for Cooperative {
    async fn run(&mut self, cancel: &CancellationToken) -> Result<Outcome> {
        tokio::select! {
            _ = cancel.cancelled() => Ok(Outcome::Processed(1)),
            _ = tokio::time::sleep(Duration::from_secs(3600)) => Ok(Outcome::Idle),
        }
    }
}

struct CooperativeFactory;

#[async_trait]
impl WorkFactory for CooperativeFactory {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>> {
        Ok(Box::new(Cooperative))
    }
}

#[tokio::test(start_paused = true)]
async fn cooperative_iteration_finishes_its_work_on_cancel() {
    let runner = Arc::new(ResilientLoop::new(
        LoopConfig::new("cooperative").shutdown_grace(Duration::from_secs(30)),
        Arc::new(CooperativeFactory),
        Arc::new(Recorder::default()),
    ));
    let cancel = CancellationToken::new();
    let handle = Arc::clone(&runner).spawn(cancel.clone());

    tokio::time::sleep(Duration::from_secs(1)).await;
    let cancelled_at = tokio::time::Instant::now();
    cancel.cancel();
    let stats = handle.await.unwrap();

    assert!(cancelled_at.elapsed() < Duration::from_secs(1));
    assert_eq!(stats.processed, 1);
    assert_eq!(stats.failures, 0);
}
