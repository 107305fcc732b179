//! Execution dispatcher.
//!
//! Turns an [`ExecutionRequest`] into a submitted job and drives it to a
//! terminal [`ExecutionResult`]:
//!
//! ```text
//!   submit() ──→ JobHandle ──→ await_result(timeout) ──→ ExecutionResult
//!   Pending ──→ Submitted ──→ Polling ──→ Completed | Failed | TimedOut
//! ```
//!
//! Only local errors are returned as `Err`, and only while building a
//! request. Everything that goes wrong after that (auth rejected, backend
//! down after all retries, job failed, timeout) comes back as a terminal
//! result so callers such as the benchmark orchestrator can keep going.
//!
//! Transient failures ([`ShellError::is_transient`]) during authentication,
//! submission, polling and fetch are retried with bounded exponential
//! backoff. A rejected token is dropped from the backend's auth cache.
//! Validation failures and capability mismatches are never retried.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::OwnedSemaphorePermit;
use tokio::time::{Instant, sleep, sleep_until, timeout_at};
use tracing::{debug, info, instrument, warn};

use crate::backend::{AuthHandle, BackendEntry, BackendSet};
use crate::capability::{BackendDescriptor, ResourceNeeds};
use crate::config::RetryConfig;
use crate::error::{ShellError, ShellResult, ValidationError};
use crate::job::{JobId, JobStatus, RequestState};
use crate::module::{CircuitSpec, Module};
use crate::option::{ResolvedOptions, validate};
use crate::result::ExecutionResult;

/// Bounded exponential backoff for transient failures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Never retry.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let exp = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exp);
        if secs.is_finite() {
            Duration::from_secs_f64(secs.min(self.max_backoff.as_secs_f64()))
        } else {
            self.max_backoff
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            ..Self::default()
        }
    }
}

/// A fully validated unit of work bound to one backend.
///
/// Only constructible when every required option is present and valid and
/// the target's capability limits cover the request. Immutable afterwards.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    module_id: String,
    options: ResolvedOptions,
    circuit: CircuitSpec,
    target: BackendDescriptor,
    shots: u32,
    needs: ResourceNeeds,
}

impl ExecutionRequest {
    /// Build a request from options already resolved for `module`.
    pub fn new(
        module: &dyn Module,
        options: ResolvedOptions,
        target: &BackendDescriptor,
        shots: u32,
    ) -> ShellResult<Self> {
        if options.module_id() != module.id() {
            return Err(ValidationError::ModuleMismatch {
                module: module.id().to_string(),
                resolved: options.module_id().to_string(),
            }
            .into());
        }
        if shots == 0 {
            return Err(ValidationError::InvalidShots("shots must be at least 1".into()).into());
        }

        let circuit = module.workload(&options)?;
        let requirements = module.requirements();
        let needs = ResourceNeeds {
            qubits: circuit.num_qubits.max(requirements.min_qubits),
            shots,
            needs_network: requirements.needs_network,
        };
        target.admit(&needs)?;

        Ok(Self {
            module_id: module.id().to_string(),
            options,
            circuit,
            target: target.clone(),
            shots,
            needs,
        })
    }

    /// Validate raw option strings, then build the request.
    pub fn from_raw(
        module: &dyn Module,
        raw: &BTreeMap<String, String>,
        target: &BackendDescriptor,
        shots: u32,
    ) -> ShellResult<Self> {
        let options = validate(module.id(), module.options(), raw)?;
        Self::new(module, options, target, shots)
    }

    pub fn module_id(&self) -> &str {
        &self.module_id
    }

    pub fn options(&self) -> &ResolvedOptions {
        &self.options
    }

    pub fn circuit(&self) -> &CircuitSpec {
        &self.circuit
    }

    pub fn target(&self) -> &BackendDescriptor {
        &self.target
    }

    pub fn shots(&self) -> u32 {
        self.shots
    }

    pub fn needs(&self) -> &ResourceNeeds {
        &self.needs
    }
}

/// In-flight request returned by [`Dispatcher::submit`].
///
/// Holds the backend circuit slot until the handle is consumed.
#[derive(Debug)]
pub struct JobHandle {
    request: Arc<ExecutionRequest>,
    entry: Option<Arc<BackendEntry>>,
    state: RequestState,
    job_id: Option<JobId>,
    auth: Option<AuthHandle>,
    attempts: u32,
    started: Instant,
    failure: Option<ShellError>,
    _slot: Option<OwnedSemaphorePermit>,
}

impl JobHandle {
    fn pending(request: Arc<ExecutionRequest>) -> Self {
        Self {
            request,
            entry: None,
            state: RequestState::Pending,
            job_id: None,
            auth: None,
            attempts: 0,
            started: Instant::now(),
            failure: None,
            _slot: None,
        }
    }

    fn transition(&mut self, next: RequestState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {} -> {next}",
            self.state
        );
        debug!(
            module = %self.request.module_id(),
            backend = %self.request.target().id,
            from = %self.state,
            to = %next,
            "request state"
        );
        self.state = next;
    }

    fn fail(mut self, error: ShellError) -> Self {
        self.transition(RequestState::Failed);
        self.failure = Some(error);
        self
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn job_id(&self) -> Option<&JobId> {
        self.job_id.as_ref()
    }

    pub fn request(&self) -> &ExecutionRequest {
        &self.request
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    fn finish(&self, result: ExecutionResult) -> ExecutionResult {
        result
            .with_job(self.job_id.clone())
            .with_attempts(self.attempts)
    }

    fn failed(&self, error: &ShellError) -> ExecutionResult {
        self.finish(ExecutionResult::failed(
            self.request.module_id(),
            &self.request.target().id,
            error,
            self.started.elapsed(),
        ))
    }

    fn timed_out(&mut self, limit: Duration) -> ExecutionResult {
        self.transition(RequestState::TimedOut);
        let message = match &self.job_id {
            Some(job) => {
                warn!(
                    backend = %self.request.target().id,
                    job = %job,
                    "abandoning remote job after {limit:?}"
                );
                format!("stopped waiting for job {job} after {limit:?}; remote job abandoned")
            }
            None => format!("submission did not complete within {limit:?}"),
        };
        self.finish(ExecutionResult::timed_out(
            self.request.module_id(),
            &self.request.target().id,
            message,
            self.started.elapsed(),
        ))
    }
}

/// Submits requests to backends and waits for their results.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    backends: Arc<BackendSet>,
    retry: RetryPolicy,
}

impl Dispatcher {
    pub fn new(backends: Arc<BackendSet>) -> Self {
        Self {
            backends,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn backends(&self) -> &BackendSet {
        &self.backends
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    async fn retrying<T, F, Fut>(
        &self,
        what: &str,
        backend: &str,
        attempts: &mut u32,
        mut op: F,
    ) -> ShellResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ShellResult<T>>,
    {
        let mut tries = 0;
        loop {
            tries += 1;
            *attempts += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && tries < self.retry.max_attempts => {
                    let delay = self.retry.backoff(tries);
                    warn!(
                        backend = %backend,
                        attempt = tries,
                        error = %err,
                        "{what} failed, retrying in {delay:?}"
                    );
                    sleep(delay).await;
                }
                Err(err) => {
                    if err.is_transient() {
                        warn!(backend = %backend, attempts = tries, error = %err, "{what} retries exhausted");
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Submit a request. Never fails outright: problems leave the handle in
    /// a terminal `Failed` state that [`await_result`](Self::await_result)
    /// reports.
    pub async fn submit(&self, request: ExecutionRequest) -> JobHandle {
        let mut handle = JobHandle::pending(Arc::new(request));
        let backend_id = handle.request.target().id.clone();

        let entry = match self.backends.get(&backend_id) {
            Ok(entry) => entry,
            Err(err) => return handle.fail(err),
        };
        // The live descriptor wins if it changed since the request was built.
        if let Err(err) = entry.descriptor().admit(handle.request.needs()) {
            return handle.fail(err.into());
        }

        let slot = match entry.acquire_slot().await {
            Ok(slot) => slot,
            Err(err) => return handle.fail(err),
        };
        handle._slot = Some(slot);

        let auth = {
            let entry: &BackendEntry = &entry;
            let mut auth_attempts = 0;
            self.retrying("authentication", &backend_id, &mut auth_attempts, move || {
                entry.auth()
            })
            .await
        };
        let auth = match auth {
            Ok(auth) => auth,
            Err(err) => return handle.fail(err),
        };

        let mut attempts = 0;
        let submitted = {
            let client = entry.client();
            let auth = &auth;
            let circuit = handle.request.circuit();
            let shots = handle.request.shots();
            self.retrying("submission", &backend_id, &mut attempts, move || {
                client.submit(auth, circuit, shots)
            })
            .await
        };
        handle.attempts = attempts;

        match submitted {
            Ok(job_id) => {
                handle.transition(RequestState::Submitted);
                debug!(backend = %backend_id, job = %job_id, "job submitted");
                handle.job_id = Some(job_id);
                handle.auth = Some(auth);
                handle.entry = Some(entry);
                handle
            }
            Err(err) => {
                forget_rejected_auth(&entry, &err).await;
                handle.fail(err)
            }
        }
    }

    /// Wait up to `timeout` for the job behind `handle` to finish.
    pub async fn await_result(&self, handle: JobHandle, timeout: Duration) -> ExecutionResult {
        self.await_until(handle, Instant::now() + timeout, timeout)
            .await
    }

    async fn await_until(
        &self,
        mut handle: JobHandle,
        deadline: Instant,
        limit: Duration,
    ) -> ExecutionResult {
        if let Some(err) = handle.failure.take() {
            return handle.failed(&err);
        }
        let (Some(entry), Some(auth), Some(job_id)) =
            (handle.entry.clone(), handle.auth.clone(), handle.job_id.clone())
        else {
            return handle.failed(&ShellError::Backend("request was never submitted".into()));
        };

        let client = entry.client();
        let interval = entry.descriptor().poll_interval();
        let module_id = handle.request.module_id().to_string();
        let mut poll_failures = 0u32;

        loop {
            let polled = match timeout_at(deadline, client.poll(&auth, &job_id)).await {
                Ok(polled) => polled,
                Err(_) => return handle.timed_out(limit),
            };

            match polled {
                Ok(JobStatus::Completed) => {
                    let mut fetch_attempts = 0;
                    let (auth, job_id_ref) = (&auth, &job_id);
                    let fetched = timeout_at(
                        deadline,
                        self.retrying("fetch", entry.id(), &mut fetch_attempts, move || {
                            client.fetch(auth, job_id_ref)
                        }),
                    )
                    .await;
                    return match fetched {
                        Err(_) => handle.timed_out(limit),
                        Ok(Ok(payload)) => {
                            handle.transition(RequestState::Completed);
                            let elapsed = handle.started.elapsed();
                            info!(
                                module = %module_id,
                                backend = %entry.id(),
                                job = %job_id,
                                elapsed_ms = elapsed.as_millis() as u64,
                                "job completed"
                            );
                            handle.finish(ExecutionResult::succeeded(
                                &module_id,
                                entry.id(),
                                payload,
                                elapsed,
                            ))
                        }
                        Ok(Err(err)) => {
                            forget_rejected_auth(&entry, &err).await;
                            handle.transition(RequestState::Failed);
                            handle.failed(&err)
                        }
                    };
                }
                Ok(JobStatus::Failed(reason)) => {
                    handle.transition(RequestState::Failed);
                    return handle.failed(&ShellError::JobFailed(reason));
                }
                Ok(JobStatus::Cancelled) => {
                    handle.transition(RequestState::Cancelled);
                    return handle.finish(ExecutionResult::cancelled(
                        &module_id,
                        entry.id(),
                        format!("job {job_id} was cancelled by the backend"),
                        handle.started.elapsed(),
                    ));
                }
                Ok(status) => {
                    poll_failures = 0;
                    if handle.state == RequestState::Submitted {
                        handle.transition(RequestState::Polling);
                    }
                    debug!(backend = %entry.id(), job = %job_id, %status, "job pending");
                }
                Err(err) if err.is_transient() => {
                    poll_failures += 1;
                    if poll_failures >= self.retry.max_attempts {
                        warn!(
                            backend = %entry.id(),
                            job = %job_id,
                            attempts = poll_failures,
                            error = %err,
                            "poll retries exhausted"
                        );
                        handle.transition(RequestState::Failed);
                        return handle.failed(&err);
                    }
                    let delay = self.retry.backoff(poll_failures);
                    warn!(
                        backend = %entry.id(),
                        job = %job_id,
                        attempt = poll_failures,
                        error = %err,
                        "poll failed, retrying in {delay:?}"
                    );
                    let next = Instant::now() + delay;
                    if next >= deadline {
                        sleep_until(deadline).await;
                        return handle.timed_out(limit);
                    }
                    sleep_until(next).await;
                    continue;
                }
                Err(err) => {
                    forget_rejected_auth(&entry, &err).await;
                    handle.transition(RequestState::Failed);
                    return handle.failed(&err);
                }
            }

            let next = Instant::now() + interval;
            if next >= deadline {
                sleep_until(deadline).await;
                return handle.timed_out(limit);
            }
            sleep_until(next).await;
        }
    }

    /// Submit and wait, with `timeout` covering both phases.
    #[instrument(skip(self, request), fields(module = %request.module_id(), backend = %request.target().id))]
    pub async fn execute(&self, request: ExecutionRequest, timeout: Duration) -> ExecutionResult {
        let deadline = Instant::now() + timeout;
        let started = Instant::now();
        let module_id = request.module_id().to_string();
        let backend_id = request.target().id.clone();

        match timeout_at(deadline, self.submit(request)).await {
            Ok(handle) => self.await_until(handle, deadline, timeout).await,
            Err(_) => {
                warn!("submission did not finish within {timeout:?}");
                ExecutionResult::timed_out(
                    &module_id,
                    &backend_id,
                    format!("submission did not complete within {timeout:?}"),
                    started.elapsed(),
                )
            }
        }
    }

    /// Stop waiting for a job and ask the backend to cancel it.
    ///
    /// Provider-side cancellation is best effort; the local result is
    /// `Cancelled` either way.
    pub async fn cancel(&self, mut handle: JobHandle) -> ExecutionResult {
        if let Some(err) = handle.failure.take() {
            return handle.failed(&err);
        }
        if let (Some(entry), Some(auth), Some(job_id)) = (&handle.entry, &handle.auth, &handle.job_id) {
            if let Err(err) = entry.client().cancel(auth, job_id).await {
                warn!(backend = %entry.id(), job = %job_id, error = %err, "provider-side cancel failed");
            }
        }
        handle.transition(RequestState::Cancelled);
        handle.finish(ExecutionResult::cancelled(
            handle.request.module_id(),
            &handle.request.target().id,
            "cancelled by caller",
            handle.started.elapsed(),
        ))
    }
}

/// A rejected token is dropped so the next request authenticates again.
async fn forget_rejected_auth(entry: &BackendEntry, err: &ShellError) {
    if matches!(err, ShellError::Auth(_)) {
        entry.invalidate_auth().await;
    }
}
