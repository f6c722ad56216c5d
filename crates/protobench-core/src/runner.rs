//! Benchmark runner.
//!
//! A run moves through `Idle -> WarmingUp -> Running -> Draining -> Done`,
//! or ends in `Aborted` when the session fails underneath it. Workers are
//! tokio tasks sharing one [`Session`]; every sample they produce travels
//! over a single channel to the runner, which is the only writer of the
//! result set.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::driver::Driver;
use crate::error::{Error, Result};
use crate::operation::{AcquireTiming, BoundOperation, OperationDriver, OperationSpec, Sample};
use crate::profile::ConnectionProfile;
use crate::session::Session;
use crate::stats::Summary;

/// Default number of timed iterations.
pub const DEFAULT_ITERATIONS: u64 = 1_000;

/// Default number of untimed warmup iterations.
pub const DEFAULT_WARMUP: u64 = 10;

/// Default number of samples collected before the error rate is evaluated.
pub const DEFAULT_MIN_SAMPLES: u64 = 20;

/// Failed samples logged at `warn` before dropping to `debug`.
const LOGGED_FAILURES: u64 = 5;

/// Run configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Untimed iterations executed before the timed window.
    pub warmup: u64,

    /// Total timed iterations shared by all workers.
    pub iterations: Option<u64>,

    /// Wall-clock limit of the timed window.
    #[serde(with = "opt_millis")]
    pub duration: Option<Duration>,

    /// Number of concurrent workers.
    pub concurrency: usize,

    /// Per-operation timeout.
    #[serde(with = "opt_millis")]
    pub timeout: Option<Duration>,

    /// Whether pool acquisition is part of each sample.
    pub acquire_timing: AcquireTiming,

    /// Abort once the failed fraction of samples exceeds this rate.
    pub max_error_rate: Option<f64>,

    /// Samples required before `max_error_rate` is checked.
    pub min_samples: u64,
}

impl RunConfig {
    /// A single worker executing `iterations` operations.
    pub fn sequential(iterations: u64) -> Self {
        Self {
            iterations: Some(iterations),
            ..Self::default()
        }
    }

    /// `concurrency` workers sharing a budget of `iterations` operations.
    pub fn parallel(concurrency: usize, iterations: u64) -> Self {
        Self {
            iterations: Some(iterations),
            concurrency,
            ..Self::default()
        }
    }

    /// Set the warmup iteration count.
    pub fn with_warmup(mut self, warmup: u64) -> Self {
        self.warmup = warmup;
        self
    }

    /// Set or clear the iteration budget.
    pub fn with_iterations(mut self, iterations: Option<u64>) -> Self {
        self.iterations = iterations;
        self
    }

    /// Set or clear the wall-clock limit.
    pub fn with_duration(mut self, duration: Option<Duration>) -> Self {
        self.duration = duration;
        self
    }

    /// Set the number of workers.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Set or clear the per-operation timeout.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Choose whether acquisition is timed.
    pub fn with_acquire_timing(mut self, timing: AcquireTiming) -> Self {
        self.acquire_timing = timing;
        self
    }

    /// Abort when more than `rate` of at least `min_samples` samples fail.
    pub fn with_max_error_rate(mut self, rate: f64, min_samples: u64) -> Self {
        self.max_error_rate = Some(rate);
        self.min_samples = min_samples;
        self
    }

    /// Check that the configuration describes a run that can finish.
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(Error::InvalidConfig(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if self.iterations.is_none() && self.duration.is_none() {
            return Err(Error::InvalidConfig(
                "either an iteration count or a duration is required".to_string(),
            ));
        }
        if self.iterations == Some(0) {
            return Err(Error::InvalidConfig(
                "iterations must be greater than 0".to_string(),
            ));
        }
        if self.duration.is_some_and(|d| d.is_zero()) {
            return Err(Error::InvalidConfig(
                "duration must be greater than 0".to_string(),
            ));
        }
        if self.timeout.is_some_and(|t| t.is_zero()) {
            return Err(Error::InvalidConfig(
                "timeout must be greater than 0".to_string(),
            ));
        }
        if let Some(rate) = self.max_error_rate {
            if !(0.0..=1.0).contains(&rate) {
                return Err(Error::InvalidConfig(format!(
                    "max error rate must be between 0 and 1, got {}",
                    rate
                )));
            }
        }
        Ok(())
    }

    fn operation_driver(&self) -> OperationDriver {
        OperationDriver::new()
            .with_timeout(self.timeout)
            .with_acquire_timing(self.acquire_timing)
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            warmup: DEFAULT_WARMUP,
            iterations: Some(DEFAULT_ITERATIONS),
            duration: None,
            concurrency: 1,
            timeout: None,
            acquire_timing: AcquireTiming::Excluded,
            max_error_rate: None,
            min_samples: DEFAULT_MIN_SAMPLES,
        }
    }
}

mod opt_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

/// Phase of a benchmark run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    WarmingUp,
    Running,
    Draining,
    Done,
    Aborted,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunState::Idle => "idle",
            RunState::WarmingUp => "warming_up",
            RunState::Running => "running",
            RunState::Draining => "draining",
            RunState::Done => "done",
            RunState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Why the timed window closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The iteration budget was used up.
    Completed,
    /// The wall-clock limit passed.
    Deadline,
    /// An external cancellation was requested.
    Cancelled,
    /// The run failed underneath the workers.
    Aborted,
}

/// Cooperative cancellation for a running benchmark.
///
/// Workers stop issuing operations once cancelled; operations already in
/// flight finish (or time out) and are still counted.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancelHandle {
    /// Create a handle that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Check whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Samples and outcome of one (profile, operation, concurrency) run.
#[derive(Debug, Clone)]
pub struct RunResult {
    profile: ConnectionProfile,
    operation: OperationSpec,
    driver: String,
    concurrency: usize,
    iterations: Option<u64>,
    state: RunState,
    stop_reason: StopReason,
    abort_reason: Option<Error>,
    samples: Vec<Sample>,
    elapsed: Duration,
    started_at: DateTime<Utc>,
}

impl RunResult {
    /// A completed run built from samples gathered elsewhere.
    pub fn from_samples(
        profile: ConnectionProfile,
        operation: OperationSpec,
        concurrency: usize,
        samples: Vec<Sample>,
        elapsed: Duration,
    ) -> Self {
        Self {
            profile,
            operation,
            driver: String::new(),
            concurrency,
            iterations: Some(samples.len() as u64),
            state: RunState::Done,
            stop_reason: StopReason::Completed,
            abort_reason: None,
            samples,
            elapsed,
            started_at: Utc::now(),
        }
    }

    /// Attach the name of the driver that produced the samples.
    pub fn with_driver(mut self, driver: impl Into<String>) -> Self {
        self.driver = driver.into();
        self
    }

    pub fn profile(&self) -> &ConnectionProfile {
        &self.profile
    }

    pub fn operation(&self) -> &OperationSpec {
        &self.operation
    }

    pub fn driver(&self) -> &str {
        &self.driver
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Configured iteration budget.
    pub fn iterations(&self) -> Option<u64> {
        self.iterations
    }

    /// Final state, either `Done` or `Aborted`.
    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn stop_reason(&self) -> StopReason {
        self.stop_reason
    }

    /// Why the run aborted, if it did.
    pub fn abort_reason(&self) -> Option<&Error> {
        self.abort_reason.as_ref()
    }

    pub fn is_aborted(&self) -> bool {
        self.state == RunState::Aborted
    }

    /// Samples in the order the runner received them.
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn sample_count(&self) -> u64 {
        self.samples.len() as u64
    }

    /// Length of the timed window.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Aggregate statistics, recomputed from the samples.
    pub fn summary(&self) -> Summary {
        Summary::from_samples(&self.samples, self.elapsed)
    }
}

/// Message from a worker to the aggregator.
enum WorkerEvent {
    Sample(Sample),
    Fatal(Error),
}

/// State shared by the workers of one run.
struct Workload<D: Driver> {
    session: Arc<Session<D>>,
    operation: BoundOperation,
    driver: OperationDriver,
    budget: Option<u64>,
    issued: AtomicU64,
    deadline: Option<Instant>,
    halt: AtomicBool,
    cancel: CancelHandle,
}

impl<D: Driver> Workload<D> {
    fn should_stop(&self) -> bool {
        self.halt.load(Ordering::SeqCst)
            || self.cancel.is_cancelled()
            || self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Claim one iteration from the shared budget.
    fn claim(&self) -> bool {
        match self.budget {
            Some(budget) => self.issued.fetch_add(1, Ordering::SeqCst) < budget,
            None => true,
        }
    }

    async fn work(self: Arc<Self>, worker: usize, events: mpsc::UnboundedSender<WorkerEvent>) {
        let mut completed = 0u64;
        while !self.should_stop() && self.claim() {
            match self.driver.execute(&self.session, &self.operation).await {
                Ok(sample) => {
                    completed += 1;
                    if events.send(WorkerEvent::Sample(sample)).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    self.halt.store(true, Ordering::SeqCst);
                    let _ = events.send(WorkerEvent::Fatal(e));
                    break;
                }
            }
        }
        tracing::debug!(worker, completed, "worker finished");
    }
}

/// Drives one operation against one profile and collects its samples.
///
/// # Example
///
/// ```ignore
/// let runner = BenchmarkRunner::new(Arc::new(driver), RunConfig::parallel(8, 10_000));
/// let result = runner.run(profile, OperationSpec::scalar("select 1")).await?;
/// println!("p99 = {}", format_latency(result.summary().p99_ns));
/// ```
pub struct BenchmarkRunner<D: Driver> {
    driver: Arc<D>,
    config: RunConfig,
    cancel: CancelHandle,
}

impl<D: Driver> BenchmarkRunner<D> {
    /// Create a runner.
    pub fn new(driver: Arc<D>, config: RunConfig) -> Self {
        Self {
            driver,
            config,
            cancel: CancelHandle::new(),
        }
    }

    /// Use an externally owned cancellation handle.
    pub fn with_cancel_handle(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    /// Handle that cancels runs started by this runner.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Run the operation against a fresh session for `profile`.
    ///
    /// Invalid configuration, a failed session open and a failed statement
    /// preparation are returned as errors: no run took place. Anything that
    /// goes wrong once the timed window has opened yields an `Aborted`
    /// result carrying every sample collected up to that point.
    pub async fn run(&self, profile: ConnectionProfile, operation: OperationSpec) -> Result<RunResult> {
        self.config.validate()?;
        let started_at = Utc::now();
        let mut state = RunState::Idle;

        tracing::info!(
            driver = self.driver.name(),
            target = %profile.target(),
            operation = %operation,
            concurrency = self.config.concurrency,
            iterations = ?self.config.iterations,
            duration = ?self.config.duration,
            "starting run"
        );

        let session = match Session::open(self.driver.clone(), profile.clone()).await {
            Ok(session) => Arc::new(session),
            Err(e) => {
                tracing::error!(target = %profile.target(), error = %e, "run aborted before start");
                return Err(e);
            }
        };

        let mut result = RunResult {
            profile,
            operation,
            driver: self.driver.name().to_string(),
            concurrency: self.config.concurrency,
            iterations: self.config.iterations,
            state,
            stop_reason: StopReason::Completed,
            abort_reason: None,
            samples: Vec::with_capacity(self.config.iterations.unwrap_or(0).min(1 << 20) as usize),
            elapsed: Duration::ZERO,
            started_at,
        };

        let op_driver = self.config.operation_driver();
        let bound = match op_driver.bind(&session, &result.operation).await {
            Ok(bound) => bound,
            Err(e) => {
                session.close().await;
                tracing::error!(error = %e, "run aborted before start");
                return Err(e);
            }
        };

        transition(&mut state, RunState::WarmingUp);
        if let Err(e) = self.warm_up(&session, &op_driver, &bound).await {
            return Ok(self.finish_aborted(result, &session, e).await);
        }

        transition(&mut state, RunState::Running);
        let workload = Arc::new(Workload {
            session: session.clone(),
            operation: bound,
            driver: op_driver,
            budget: self.config.iterations,
            issued: AtomicU64::new(0),
            deadline: self.config.duration.map(|d| Instant::now() + d),
            halt: AtomicBool::new(false),
            cancel: self.cancel.clone(),
        });

        let start = Instant::now();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handles: Vec<_> = (0..self.config.concurrency)
            .map(|worker| tokio::spawn(workload.clone().work(worker, tx.clone())))
            .collect();
        drop(tx);

        let mut abort: Option<Error> = None;
        let mut failures = 0u64;
        while let Some(event) = rx.recv().await {
            match event {
                WorkerEvent::Sample(sample) => {
                    if let Some(failure) = sample.error() {
                        failures += 1;
                        if failures <= LOGGED_FAILURES {
                            tracing::warn!(kind = %failure.kind, error = %failure.message, "operation failed");
                        } else {
                            tracing::debug!(kind = %failure.kind, error = %failure.message, "operation failed");
                        }
                    }
                    result.samples.push(sample);
                    if abort.is_none() {
                        if let Some(e) = self.check_error_rate(result.samples.len() as u64, failures) {
                            workload.halt.store(true, Ordering::SeqCst);
                            abort = Some(e);
                        }
                    }
                }
                WorkerEvent::Fatal(e) => {
                    if abort.is_none() {
                        abort = Some(e);
                    }
                }
            }
            if state == RunState::Running && workload.should_stop() {
                transition(&mut state, RunState::Draining);
            }
        }

        if state == RunState::Running {
            transition(&mut state, RunState::Draining);
        }
        for handle in handles {
            if let Err(e) = handle.await {
                if abort.is_none() {
                    abort = Some(Error::Worker(e.to_string()));
                }
            }
        }
        result.elapsed = start.elapsed();

        if let Some(e) = abort {
            return Ok(self.finish_aborted(result, &session, e).await);
        }

        let reached_budget = self
            .config
            .iterations
            .is_some_and(|budget| result.samples.len() as u64 >= budget);
        result.stop_reason = if reached_budget {
            StopReason::Completed
        } else if self.cancel.is_cancelled() {
            StopReason::Cancelled
        } else {
            StopReason::Deadline
        };

        if result.samples.is_empty() && result.stop_reason == StopReason::Cancelled {
            return Ok(self.finish_aborted(result, &session, Error::Cancelled).await);
        }

        session.close().await;
        transition(&mut state, RunState::Done);
        result.state = state;

        let summary = result.summary();
        tracing::info!(
            target = %result.profile.target(),
            samples = summary.samples,
            failures = summary.failures,
            stop_reason = ?result.stop_reason,
            elapsed = ?result.elapsed,
            "run finished"
        );
        Ok(result)
    }

    async fn warm_up(
        &self,
        session: &Session<D>,
        op_driver: &OperationDriver,
        bound: &BoundOperation,
    ) -> Result<()> {
        for i in 0..self.config.warmup {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let sample = op_driver.execute(session, bound).await?;
            if let Some(failure) = sample.error() {
                tracing::warn!(iteration = i, error = %failure.message, "warmup operation failed");
            }
        }
        Ok(())
    }

    fn check_error_rate(&self, samples: u64, failures: u64) -> Option<Error> {
        let limit = self.config.max_error_rate?;
        if samples < self.config.min_samples.max(1) {
            return None;
        }
        let rate = failures as f64 / samples as f64;
        (rate > limit).then(|| {
            Error::Query(format!(
                "error rate {:.2}% over {} samples exceeds limit of {:.2}%",
                rate * 100.0,
                samples,
                limit * 100.0
            ))
        })
    }

    async fn finish_aborted(&self, mut result: RunResult, session: &Session<D>, reason: Error) -> RunResult {
        session.close().await;
        tracing::error!(
            target = %result.profile.target(),
            samples = result.samples.len(),
            reason = %reason,
            "run aborted"
        );
        result.state = RunState::Aborted;
        result.stop_reason = StopReason::Aborted;
        result.abort_reason = Some(reason);
        result
    }
}

fn transition(state: &mut RunState, next: RunState) {
    tracing::debug!(from = %state, to = %next, "run state");
    *state = next;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDriver;

    #[test]
    fn test_validate() {
        assert!(RunConfig::sequential(100).validate().is_ok());
        assert!(RunConfig::parallel(0, 100).validate().is_err());
        assert!(RunConfig::sequential(0).validate().is_err());
        assert!(RunConfig::sequential(10)
            .with_iterations(None)
            .validate()
            .is_err());
        assert!(RunConfig::sequential(10)
            .with_iterations(None)
            .with_duration(Some(Duration::from_secs(1)))
            .validate()
            .is_ok());
        assert!(RunConfig::sequential(10)
            .with_max_error_rate(1.5, 10)
            .validate()
            .is_err());
    }

    #[test]
    fn test_config_serde_uses_millis() {
        let config: RunConfig = serde_json::from_str(
            r#"{"iterations": 500, "concurrency": 4, "duration": 2000, "timeout": 250}"#,
        )
        .unwrap();
        assert_eq!(config.iterations, Some(500));
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.duration, Some(Duration::from_secs(2)));
        assert_eq!(config.timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.warmup, DEFAULT_WARMUP);
    }

    #[test]
    fn test_check_error_rate() {
        let runner = BenchmarkRunner::new(
            Arc::new(MockDriver::new()),
            RunConfig::sequential(100).with_max_error_rate(0.1, 10),
        );
        assert!(runner.check_error_rate(5, 5).is_none());
        assert!(runner.check_error_rate(10, 1).is_none());
        assert!(runner.check_error_rate(10, 2).is_some());
    }

    #[test]
    fn test_cancel_handle_shared() {
        let handle = CancelHandle::new();
        let clone = handle.clone();
        assert!(!handle.is_cancelled());
        clone.cancel();
        assert!(handle.is_cancelled());
    }
}
