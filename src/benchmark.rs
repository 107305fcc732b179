//! Benchmark orchestrator.
//!
//! Runs one module across many (backend, configuration) pairs at once and
//! folds the outcomes into a [`BenchmarkReport`]:
//!
//! ```text
//!   BenchmarkSpec ──→ build requests per pair ──→ spawn reps (≤ max_in_flight)
//!                          │                              │
//!                          └─ invalid pair: Failed ───────┴──→ aggregate ──→ report
//! ```
//!
//! A pair that cannot be built, or whose runs fail, is reported as such;
//! the other pairs are unaffected. Runs still pending when the global
//! ceiling elapses are abandoned and reported as `TimedOut`.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{Instant, timeout_at};
use tracing::{info, warn};

use crate::config::ShellConfig;
use crate::dispatcher::{Dispatcher, ExecutionRequest};
use crate::error::{ShellError, ShellResult};
use crate::registry::ModuleRegistry;
use crate::result::{ExecutionResult, ExecutionStatus};

fn default_repetitions() -> u32 {
    1
}
fn default_shots() -> u32 {
    1024
}

/// One (backend, configuration) combination to exercise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BenchmarkPair {
    pub backend: String,
    /// Report label; defaults to the backend id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Option overrides layered over the benchmark-wide options.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    /// Overrides the benchmark-wide shot count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shots: Option<u32>,
}

impl BenchmarkPair {
    pub fn new(backend: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            label: None,
            options: BTreeMap::new(),
            shots: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_option(mut self, name: impl Into<String>, raw: impl Into<String>) -> Self {
        self.options.insert(name.into(), raw.into());
        self
    }

    pub fn with_shots(mut self, shots: u32) -> Self {
        self.shots = Some(shots);
        self
    }

    pub fn label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.backend)
    }
}

/// What to benchmark and how hard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkSpec {
    pub module: String,
    /// Raw option values shared by every pair.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    pub pairs: Vec<BenchmarkPair>,
    #[serde(default = "default_repetitions")]
    pub repetitions: u32,
    #[serde(default = "default_shots")]
    pub shots: u32,
    /// Per-run timeout; the orchestrator default applies when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout_ms: Option<u64>,
    /// Global ceiling for the whole benchmark.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ceiling_ms: Option<u64>,
}

impl BenchmarkSpec {
    pub fn new(module: impl Into<String>, pairs: Vec<BenchmarkPair>, repetitions: u32) -> Self {
        Self {
            module: module.into(),
            options: BTreeMap::new(),
            pairs,
            repetitions,
            shots: default_shots(),
            request_timeout_ms: None,
            ceiling_ms: None,
        }
    }

    pub fn with_option(mut self, name: impl Into<String>, raw: impl Into<String>) -> Self {
        self.options.insert(name.into(), raw.into());
        self
    }

    pub fn with_shots(mut self, shots: u32) -> Self {
        self.shots = shots;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_ceiling(mut self, ceiling: Duration) -> Self {
        self.ceiling_ms = Some(ceiling.as_millis() as u64);
        self
    }

    /// Load a spec from a JSON file.
    pub fn load(path: &Path) -> ShellResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Min/mean/max wall-clock of a set of runs, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DurationStats {
    pub samples: usize,
    pub min_ms: f64,
    pub mean_ms: f64,
    pub max_ms: f64,
}

impl DurationStats {
    /// `None` when there are no samples.
    #[allow(clippy::cast_precision_loss)]
    pub fn from_durations(durations: &[Duration]) -> Option<Self> {
        if durations.is_empty() {
            return None;
        }
        let ms: Vec<f64> = durations.iter().map(|d| d.as_secs_f64() * 1e3).collect();
        let min_ms = ms.iter().copied().fold(f64::INFINITY, f64::min);
        let max_ms = ms.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mean_ms = ms.iter().sum::<f64>() / ms.len() as f64;
        Some(Self {
            samples: ms.len(),
            min_ms,
            mean_ms,
            max_ms,
        })
    }
}

/// Overall outcome of one pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PairOutcome {
    /// Every repetition succeeded.
    Succeeded,
    /// Some repetitions succeeded.
    Partial,
    /// No repetition succeeded and at least one failed.
    Failed,
    /// Every repetition timed out.
    TimedOut,
}

/// Aggregated results for one pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairAggregate {
    pub label: String,
    pub backend_id: String,
    pub options: BTreeMap<String, String>,
    pub shots: u32,
    pub outcome: PairOutcome,
    pub success_count: u32,
    pub failure_count: u32,
    pub timed_out_count: u32,
    pub cancelled_count: u32,
    /// Over successful runs only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub durations: Option<DurationStats>,
    /// Set when the pair was rejected before any run was submitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup_error: Option<String>,
    /// Per-repetition results, in repetition order.
    pub results: Vec<ExecutionResult>,
}

impl PairAggregate {
    fn from_results(
        pair: &BenchmarkPair,
        options: BTreeMap<String, String>,
        shots: u32,
        results: Vec<ExecutionResult>,
        setup_error: Option<String>,
    ) -> Self {
        let count = |status| {
            u32::try_from(results.iter().filter(|r| r.status() == status).count())
                .unwrap_or(u32::MAX)
        };
        let success_count = count(ExecutionStatus::Succeeded);
        let failure_count = count(ExecutionStatus::Failed);
        let timed_out_count = count(ExecutionStatus::TimedOut);
        let cancelled_count = count(ExecutionStatus::Cancelled);
        let total = results.len() as u32;

        let outcome = if success_count == total {
            PairOutcome::Succeeded
        } else if success_count > 0 {
            PairOutcome::Partial
        } else if timed_out_count == total {
            PairOutcome::TimedOut
        } else {
            PairOutcome::Failed
        };

        let succeeded: Vec<Duration> = results
            .iter()
            .filter(|r| r.is_success())
            .map(ExecutionResult::duration)
            .collect();

        Self {
            label: pair.label().to_string(),
            backend_id: pair.backend.clone(),
            options,
            shots,
            outcome,
            success_count,
            failure_count,
            timed_out_count,
            cancelled_count,
            durations: DurationStats::from_durations(&succeeded),
            setup_error,
            results,
        }
    }
}

/// Structured benchmark output, serializable to JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkReport {
    pub module_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub repetitions: u32,
    /// Whether the global ceiling cut the benchmark short.
    pub ceiling_reached: bool,
    pub pairs: Vec<PairAggregate>,
}

impl BenchmarkReport {
    pub fn pair(&self, label: &str) -> Option<&PairAggregate> {
        self.pairs.iter().find(|p| p.label == label)
    }

    pub fn to_json(&self) -> ShellResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(text: &str) -> ShellResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn save(&self, path: &Path) -> ShellResult<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> ShellResult<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }
}

impl fmt::Display for BenchmarkReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "benchmark '{}' x{} ({} pairs){}",
            self.module_id,
            self.repetitions,
            self.pairs.len(),
            if self.ceiling_reached { " [ceiling reached]" } else { "" }
        )?;
        writeln!(
            f,
            "  {:<20} {:>4} {:>4} {:>4} {:>10} {:>10} {:>10}",
            "pair", "ok", "fail", "t/o", "min ms", "mean ms", "max ms"
        )?;
        for pair in &self.pairs {
            let (min, mean, max) = pair.durations.map_or_else(
                || ("-".to_string(), "-".to_string(), "-".to_string()),
                |d| {
                    (
                        format!("{:.2}", d.min_ms),
                        format!("{:.2}", d.mean_ms),
                        format!("{:.2}", d.max_ms),
                    )
                },
            );
            writeln!(
                f,
                "  {:<20} {:>4} {:>4} {:>4} {:>10} {:>10} {:>10}",
                pair.label, pair.success_count, pair.failure_count, pair.timed_out_count, min, mean, max
            )?;
            if let Some(err) = &pair.setup_error {
                writeln!(f, "    setup error: {err}")?;
            }
        }
        Ok(())
    }
}

/// Upper bound on `repetitions` in a single spec.
pub const MAX_REPETITIONS: u32 = 10_000;

/// Fans a benchmark out across backends through the dispatcher.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    registry: Arc<ModuleRegistry>,
    dispatcher: Dispatcher,
    max_in_flight: usize,
    /// Configured per-run timeout; each target's queue-class default applies when unset.
    request_timeout: Option<Duration>,
}

impl Orchestrator {
    pub fn new(registry: Arc<ModuleRegistry>, dispatcher: Dispatcher) -> Self {
        Self::from_config(registry, dispatcher, &ShellConfig::default())
    }

    pub fn from_config(
        registry: Arc<ModuleRegistry>,
        dispatcher: Dispatcher,
        config: &ShellConfig,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            max_in_flight: config.max_in_flight.max(1),
            request_timeout: config.timeout(),
        }
    }

    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self
    }

    /// Run every repetition of every pair and aggregate the results.
    ///
    /// Only a malformed spec (unknown module, no pairs, zero repetitions)
    /// is an `Err`; per-pair problems are part of the report.
    pub async fn run(&self, spec: &BenchmarkSpec) -> ShellResult<BenchmarkReport> {
        if spec.pairs.is_empty() {
            return Err(ShellError::Configuration("benchmark has no pairs".into()));
        }
        if spec.repetitions == 0 {
            return Err(ShellError::Configuration("repetitions must be at least 1".into()));
        }
        if spec.repetitions > MAX_REPETITIONS {
            return Err(ShellError::Configuration(format!(
                "repetitions must be at most {MAX_REPETITIONS}, got {}",
                spec.repetitions
            )));
        }
        let module = self.registry.find(&spec.module)?;
        let reps = spec.repetitions as usize;
        let request_timeout = spec
            .request_timeout_ms
            .map(Duration::from_millis)
            .or(self.request_timeout);

        let started_at = Utc::now();
        let started = Instant::now();
        info!(
            module = %spec.module,
            pairs = spec.pairs.len(),
            repetitions = spec.repetitions,
            max_in_flight = self.max_in_flight,
            "benchmark started"
        );

        // Build every request up front; a pair that cannot be built is failed
        // without touching any backend.
        let mut slots: Vec<Vec<Option<ExecutionResult>>> = vec![vec![None; reps]; spec.pairs.len()];
        let mut setup_errors: Vec<Option<String>> = vec![None; spec.pairs.len()];
        let mut merged_options = Vec::with_capacity(spec.pairs.len());
        let mut requests = Vec::new();

        for (index, pair) in spec.pairs.iter().enumerate() {
            let mut raw = spec.options.clone();
            raw.extend(pair.options.clone());
            let shots = pair.shots.unwrap_or(spec.shots);
            merged_options.push((raw.clone(), shots));

            let built = self
                .dispatcher
                .backends()
                .get(&pair.backend)
                .and_then(|entry| {
                    ExecutionRequest::from_raw(module.as_ref(), &raw, entry.descriptor(), shots)
                });
            match built {
                Ok(request) => {
                    let timeout =
                        request_timeout.unwrap_or_else(|| request.target().default_timeout());
                    requests.push((index, request, timeout));
                }
                Err(err) => {
                    warn!(pair = %pair.label(), error = %err, "benchmark pair rejected");
                    for slot in &mut slots[index] {
                        *slot = Some(ExecutionResult::failed(
                            module.id(),
                            &pair.backend,
                            &err,
                            Duration::ZERO,
                        ));
                    }
                    setup_errors[index] = Some(err.to_string());
                }
            }
        }

        let runs = requests.len() * reps;
        let slowest = requests
            .iter()
            .map(|(_, _, timeout)| *timeout)
            .max()
            .unwrap_or_default();
        let ceiling = spec.ceiling_ms.map_or_else(
            || default_ceiling(slowest, runs, self.max_in_flight),
            Duration::from_millis,
        );
        let deadline = started + ceiling;

        let gate = Arc::new(Semaphore::new(self.max_in_flight));
        let mut tasks = JoinSet::new();
        for (index, request, timeout) in requests {
            for rep in 0..reps {
                let gate = Arc::clone(&gate);
                let dispatcher = self.dispatcher.clone();
                let request = request.clone();
                tasks.spawn(async move {
                    // The gate is never closed, so acquire only fails if dropped.
                    let _permit = gate.acquire_owned().await.ok();
                    let result = dispatcher.execute(request, timeout).await;
                    (index, rep, result)
                });
            }
        }

        let mut ceiling_reached = false;
        loop {
            match timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(Ok((index, rep, result)))) => slots[index][rep] = Some(result),
                Ok(Some(Err(err))) => warn!(error = %err, "benchmark task did not finish"),
                Ok(None) => break,
                Err(_) => {
                    ceiling_reached = true;
                    warn!(
                        pending = tasks.len(),
                        "benchmark ceiling of {ceiling:?} reached, abandoning pending runs"
                    );
                    tasks.abort_all();
                    break;
                }
            }
        }

        let elapsed = started.elapsed();
        let pairs = spec
            .pairs
            .iter()
            .zip(slots)
            .zip(setup_errors)
            .zip(merged_options)
            .map(|(((pair, results), setup_error), (options, shots))| {
                let results = results
                    .into_iter()
                    .map(|slot| {
                        slot.unwrap_or_else(|| {
                            if ceiling_reached {
                                ExecutionResult::timed_out(
                                    module.id(),
                                    &pair.backend,
                                    format!("benchmark ceiling of {ceiling:?} reached"),
                                    elapsed,
                                )
                            } else {
                                ExecutionResult::failed(
                                    module.id(),
                                    &pair.backend,
                                    &ShellError::Backend("execution task aborted".into()),
                                    elapsed,
                                )
                            }
                        })
                    })
                    .collect();
                PairAggregate::from_results(pair, options, shots, results, setup_error)
            })
            .collect::<Vec<_>>();

        info!(
            module = %spec.module,
            elapsed_ms = elapsed.as_millis() as u64,
            ceiling_reached,
            "benchmark finished"
        );

        Ok(BenchmarkReport {
            module_id: module.id().to_string(),
            started_at,
            finished_at: Utc::now(),
            repetitions: spec.repetitions,
            ceiling_reached,
            pairs,
        })
    }
}

/// Enough time for every wave of runs at the concurrency limit, plus one.
fn default_ceiling(request_timeout: Duration, runs: usize, max_in_flight: usize) -> Duration {
    let waves = runs.div_ceil(max_in_flight.max(1)) + 1;
    request_timeout.saturating_mul(u32::try_from(waves).unwrap_or(u32::MAX))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::backend::{AuthHandle, BackendClient, BackendSet};
    use crate::capability::{BackendDescriptor, CapabilityLimits, CredentialRef, QueueClass};
    use crate::job::{JobId, JobStatus};
    use crate::local::{LocalSimulator, QueuedSimulator};
    use crate::module::CircuitSpec;
    use crate::result::Payload;

    /// Records how many jobs are between submit and fetch at once.
    struct Gauge {
        inner: QueuedSimulator,
        active: AtomicUsize,
        peak: AtomicUsize,
        submits: AtomicUsize,
    }

    impl Gauge {
        fn new(limits: CapabilityLimits) -> Self {
            let desc = BackendDescriptor::remote_simulator("gauge", 8, CredentialRef::new("ref"))
                .with_limits(limits)
                .with_poll_interval(Duration::from_millis(50));
            Self {
                inner: QueuedSimulator::new(desc, 2),
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                submits: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl BackendClient for Gauge {
        fn descriptor(&self) -> &BackendDescriptor {
            self.inner.descriptor()
        }
        async fn authenticate(&self, credential: &CredentialRef) -> ShellResult<AuthHandle> {
            self.inner.authenticate(credential).await
        }
        async fn submit(
            &self,
            auth: &AuthHandle,
            circuit: &CircuitSpec,
            shots: u32,
        ) -> ShellResult<JobId> {
            self.submits.fetch_add(1, Ordering::SeqCst);
            let job = self.inner.submit(auth, circuit, shots).await?;
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            Ok(job)
        }
        async fn poll(&self, auth: &AuthHandle, job_id: &JobId) -> ShellResult<JobStatus> {
            self.inner.poll(auth, job_id).await
        }
        async fn fetch(&self, auth: &AuthHandle, job_id: &JobId) -> ShellResult<Payload> {
            let payload = self.inner.fetch(auth, job_id).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            payload
        }
    }

    fn orchestrator(backends: BackendSet) -> Orchestrator {
        Orchestrator::new(
            Arc::new(ModuleRegistry::with_builtins().unwrap()),
            Dispatcher::new(Arc::new(backends)),
        )
    }

    #[test]
    fn test_duration_stats() {
        let stats = DurationStats::from_durations(&[
            Duration::from_millis(10),
            Duration::from_millis(20),
            Duration::from_millis(30),
        ])
        .unwrap();
        assert_eq!(stats.samples, 3);
        assert!((stats.min_ms - 10.0).abs() < 1e-9);
        assert!((stats.mean_ms - 20.0).abs() < 1e-9);
        assert!((stats.max_ms - 30.0).abs() < 1e-9);
        assert!(DurationStats::from_durations(&[]).is_none());
    }

    #[test]
    fn test_default_ceiling() {
        let t = Duration::from_secs(10);
        assert_eq!(default_ceiling(t, 8, 4), Duration::from_secs(30));
        assert_eq!(default_ceiling(t, 0, 4), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_spec_errors() {
        let orch = orchestrator(BackendSet::new());
        let empty = BenchmarkSpec::new("ping", vec![], 1);
        assert!(matches!(orch.run(&empty).await, Err(ShellError::Configuration(_))));
        let unknown = BenchmarkSpec::new("nope", vec![BenchmarkPair::new("local")], 1);
        assert!(matches!(orch.run(&unknown).await, Err(ShellError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_repetitions_are_capped() {
        let backends = BackendSet::new()
            .with(Arc::new(LocalSimulator::new("local", 8)))
            .unwrap();
        let spec = BenchmarkSpec::new("ping", vec![BenchmarkPair::new("local")], MAX_REPETITIONS + 1);
        match orchestrator(backends).run(&spec).await {
            Err(ShellError::Configuration(msg)) => assert!(msg.contains("at most")),
            other => panic!("expected configuration error, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_runs_respect_limit() {
        let gauge = Arc::new(Gauge::new(CapabilityLimits::new(16, 8, 100_000)));
        let backends = BackendSet::new().with(gauge.clone()).unwrap();
        let spec = BenchmarkSpec::new("ping", vec![BenchmarkPair::new("gauge")], 6).with_shots(10);

        let report = orchestrator(backends)
            .with_max_in_flight(2)
            .run(&spec)
            .await
            .unwrap();
        assert_eq!(report.pair("gauge").unwrap().success_count, 6);
        assert_eq!(gauge.peak.load(Ordering::SeqCst), 2);
        assert_eq!(gauge.submits.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backend_parallel_limit_bounds_runs() {
        let gauge = Arc::new(Gauge::new(CapabilityLimits::new(1, 8, 100_000)));
        let backends = BackendSet::new().with(gauge.clone()).unwrap();
        let spec = BenchmarkSpec::new("ping", vec![BenchmarkPair::new("gauge")], 4).with_shots(10);

        let report = orchestrator(backends)
            .with_max_in_flight(8)
            .run(&spec)
            .await
            .unwrap();
        let pair = report.pair("gauge").unwrap();
        assert_eq!(pair.success_count, 4);
        assert_eq!(pair.outcome, PairOutcome::Succeeded);
        assert_eq!(gauge.peak.load(Ordering::SeqCst), 1);
    }

    fn batch_backends() -> BackendSet {
        // Finishes after roughly 100 s of polling.
        let desc = BackendDescriptor::remote_simulator("batch", 8, CredentialRef::new("ref"))
            .with_queue_class(QueueClass::Batch)
            .with_poll_interval(Duration::from_secs(10));
        BackendSet::new()
            .with(Arc::new(QueuedSimulator::new(desc, 9)))
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_unset_timeout_uses_queue_class_default() {
        let spec = BenchmarkSpec::new("ping", vec![BenchmarkPair::new("batch")], 1);
        let report = orchestrator(batch_backends()).run(&spec).await.unwrap();
        assert!(!report.ceiling_reached);
        assert_eq!(report.pair("batch").unwrap().success_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_configured_timeout_applies_to_runs() {
        let config = ShellConfig {
            timeout_secs: Some(60),
            ..ShellConfig::default()
        };
        let orch = Orchestrator::from_config(
            Arc::new(ModuleRegistry::with_builtins().unwrap()),
            Dispatcher::new(Arc::new(batch_backends())),
            &config,
        );
        let spec = BenchmarkSpec::new("ping", vec![BenchmarkPair::new("batch")], 1);
        let report = orch.run(&spec).await.unwrap();
        assert!(!report.ceiling_reached);
        assert_eq!(report.pair("batch").unwrap().timed_out_count, 1);
    }

    #[tokio::test]
    async fn test_invalid_pair_does_not_abort_others() {
        let backends = BackendSet::new()
            .with(Arc::new(LocalSimulator::new("small", 4)))
            .unwrap()
            .with(Arc::new(LocalSimulator::new("large", 64)))
            .unwrap();
        let spec = BenchmarkSpec::new(
            "sample",
            vec![
                BenchmarkPair::new("small"),
                BenchmarkPair::new("large"),
                BenchmarkPair::new("missing"),
            ],
            3,
        )
        .with_option("N", "10")
        .with_shots(50);

        let report = orchestrator(backends).run(&spec).await.unwrap();
        let small = report.pair("small").unwrap();
        assert_eq!(small.outcome, PairOutcome::Failed);
        assert_eq!(small.failure_count, 3);
        assert!(small.setup_error.as_deref().unwrap().contains("qubits"));

        let large = report.pair("large").unwrap();
        assert_eq!(large.outcome, PairOutcome::Succeeded);
        assert_eq!(large.success_count, 3);
        assert_eq!(large.durations.unwrap().samples, 3);

        assert_eq!(report.pair("missing").unwrap().failure_count, 3);
    }

    #[tokio::test]
    async fn test_pair_overrides() {
        let backends = BackendSet::new()
            .with(Arc::new(LocalSimulator::new("local", 16)))
            .unwrap();
        let spec = BenchmarkSpec::new(
            "sample",
            vec![
                BenchmarkPair::new("local").with_label("n2").with_option("N", "2"),
                BenchmarkPair::new("local")
                    .with_label("n8")
                    .with_option("N", "8")
                    .with_shots(10),
            ],
            1,
        )
        .with_option("N", "1");

        let report = orchestrator(backends).run(&spec).await.unwrap();
        let n8 = report.pair("n8").unwrap();
        assert_eq!(n8.shots, 10);
        assert_eq!(n8.options["N"], "8");
        let payload = n8.results[0].payload().unwrap();
        assert_eq!(payload.counts.get("00000000"), 5);
        assert_eq!(report.pair("n2").unwrap().shots, 1024);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ceiling_marks_pending_runs_timed_out() {
        let stuck = BackendDescriptor::remote_hardware("stuck", 8, CredentialRef::new("ref"))
            .with_poll_interval(Duration::from_secs(1));
        let backends = BackendSet::new()
            .with(Arc::new(LocalSimulator::new("local", 8)))
            .unwrap()
            .with(Arc::new(QueuedSimulator::never_completes(stuck)))
            .unwrap();
        let spec = BenchmarkSpec::new(
            "ping",
            vec![BenchmarkPair::new("local"), BenchmarkPair::new("stuck")],
            2,
        )
        .with_request_timeout(Duration::from_secs(600))
        .with_ceiling(Duration::from_secs(5));

        let started = Instant::now();
        let report = orchestrator(backends).run(&spec).await.unwrap();
        assert!(started.elapsed() <= Duration::from_secs(6));
        assert!(report.ceiling_reached);
        assert_eq!(report.pair("local").unwrap().success_count, 2);
        let stuck = report.pair("stuck").unwrap();
        assert_eq!(stuck.outcome, PairOutcome::TimedOut);
        assert_eq!(stuck.timed_out_count, 2);
    }

    #[tokio::test]
    async fn test_report_roundtrip() {
        let backends = BackendSet::new()
            .with(Arc::new(LocalSimulator::new("local", 8)))
            .unwrap();
        let spec = BenchmarkSpec::new("ping", vec![BenchmarkPair::new("local")], 2);
        let report = orchestrator(backends).run(&spec).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        report.save(&path).unwrap();
        let back = BenchmarkReport::load(&path).unwrap();
        assert_eq!(back, report);
        assert!(report.to_string().contains("ping"));
    }
}
