//! In-process backends.
//!
//! [`LocalSimulator`] completes every job during `submit`, so the
//! dispatcher collapses `Submitted → Completed` on the first poll.
//! [`QueuedSimulator`] behaves like a remote queue: a job reports `Queued`
//! for a fixed number of polls before it completes. Both produce
//! deterministic counts, which makes repeated runs comparable, and both
//! forget a job once its payload has been fetched.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::backend::{AuthHandle, BackendClient, BackendSet};
use crate::capability::{BackendDescriptor, CapabilityLimits, CredentialRef};
use crate::error::{ShellError, ShellResult, ValidationError};
use crate::job::{JobId, JobStatus};
use crate::module::CircuitSpec;
use crate::result::{Counts, Payload};

/// Deterministic stand-in for state-vector sampling.
///
/// Shots are split between the all-zeros and all-ones bitstrings.
fn simulate(circuit: &CircuitSpec, shots: u32) -> Payload {
    let width = circuit.num_qubits.max(1) as usize;
    let split = [
        ("0".repeat(width), u64::from(shots - shots / 2)),
        ("1".repeat(width), u64::from(shots / 2)),
    ];
    let counts = Counts::from_pairs(split.into_iter().filter(|(_, n)| *n > 0));
    Payload::new(counts, shots).with_metadata(serde_json::json!({
        "circuit": circuit.name,
        "gates": circuit.gates.len(),
        "params": circuit.params,
    }))
}

fn check_shots(descriptor: &BackendDescriptor, shots: u32) -> ShellResult<()> {
    if shots == 0 || shots > descriptor.limits.max_shots {
        return Err(ValidationError::InvalidShots(format!(
            "shots must be 1..={}",
            descriptor.limits.max_shots
        ))
        .into());
    }
    Ok(())
}

/// In-memory simulator that completes jobs synchronously.
#[derive(Debug)]
pub struct LocalSimulator {
    descriptor: BackendDescriptor,
    jobs: Mutex<FxHashMap<String, Payload>>,
    next_id: AtomicU64,
}

impl LocalSimulator {
    pub fn new(id: impl Into<String>, max_qubits: u32) -> Self {
        Self::with_descriptor(BackendDescriptor::local_simulator(id, max_qubits))
    }

    pub fn with_descriptor(descriptor: BackendDescriptor) -> Self {
        Self {
            descriptor,
            jobs: Mutex::new(FxHashMap::default()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Jobs whose payload has not been fetched yet.
    pub fn tracked_jobs(&self) -> usize {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[async_trait]
impl BackendClient for LocalSimulator {
    fn descriptor(&self) -> &BackendDescriptor {
        &self.descriptor
    }

    async fn authenticate(&self, _credential: &CredentialRef) -> ShellResult<AuthHandle> {
        Ok(AuthHandle::none())
    }

    async fn submit(
        &self,
        _auth: &AuthHandle,
        circuit: &CircuitSpec,
        shots: u32,
    ) -> ShellResult<JobId> {
        check_shots(&self.descriptor, shots)?;
        let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let id = format!("{}-{n}", self.descriptor.id);
        let payload = simulate(circuit, shots);
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), payload);
        trace!(job = %id, "local job completed");
        Ok(JobId::new(id))
    }

    async fn poll(&self, _auth: &AuthHandle, job_id: &JobId) -> ShellResult<JobStatus> {
        let jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        if jobs.contains_key(job_id.as_str()) {
            Ok(JobStatus::Completed)
        } else {
            Err(ShellError::JobNotFound(job_id.to_string()))
        }
    }

    /// Hands out the payload once; the job is forgotten afterwards.
    async fn fetch(&self, _auth: &AuthHandle, job_id: &JobId) -> ShellResult<Payload> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(job_id.as_str())
            .ok_or_else(|| ShellError::JobNotFound(job_id.to_string()))
    }
}

#[derive(Debug)]
struct QueuedJob {
    status: JobStatus,
    polls: u32,
    payload: Payload,
}

/// Simulator with a remote-style queue.
///
/// Each job reports `Queued` for `queue_polls` polls, then `Running` for one
/// poll, then `Completed`. `queue_polls = u32::MAX` keeps jobs queued forever.
/// Terminal jobs are dropped once fetched (completed) or reported (cancelled).
#[derive(Debug)]
pub struct QueuedSimulator {
    descriptor: BackendDescriptor,
    queue_polls: u32,
    jobs: Mutex<FxHashMap<String, QueuedJob>>,
    next_id: AtomicU64,
}

impl QueuedSimulator {
    pub fn new(descriptor: BackendDescriptor, queue_polls: u32) -> Self {
        Self {
            descriptor,
            queue_polls,
            jobs: Mutex::new(FxHashMap::default()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Jobs are accepted but never leave the queue.
    pub fn never_completes(descriptor: BackendDescriptor) -> Self {
        Self::new(descriptor, u32::MAX)
    }

    /// Jobs still held, terminal or not.
    pub fn tracked_jobs(&self) -> usize {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[async_trait]
impl BackendClient for QueuedSimulator {
    fn descriptor(&self) -> &BackendDescriptor {
        &self.descriptor
    }

    async fn authenticate(&self, credential: &CredentialRef) -> ShellResult<AuthHandle> {
        Ok(AuthHandle::new(format!("sim:{}", credential.as_str())))
    }

    async fn submit(
        &self,
        _auth: &AuthHandle,
        circuit: &CircuitSpec,
        shots: u32,
    ) -> ShellResult<JobId> {
        check_shots(&self.descriptor, shots)?;
        let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let id = format!("{}-q{n}", self.descriptor.id);
        let job = QueuedJob {
            status: JobStatus::Queued {
                position: Some(self.queue_polls.min(1_000)),
            },
            polls: 0,
            payload: simulate(circuit, shots),
        };
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), job);
        Ok(JobId::new(id))
    }

    async fn poll(&self, _auth: &AuthHandle, job_id: &JobId) -> ShellResult<JobStatus> {
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        let job = jobs
            .get_mut(job_id.as_str())
            .ok_or_else(|| ShellError::JobNotFound(job_id.to_string()))?;

        if job.status.is_pending() && self.queue_polls != u32::MAX {
            job.polls += 1;
            job.status = if job.polls <= self.queue_polls {
                JobStatus::Queued {
                    position: Some(self.queue_polls - job.polls),
                }
            } else if job.polls == self.queue_polls + 1 {
                JobStatus::Running
            } else {
                JobStatus::Completed
            };
        }
        let status = job.status.clone();
        if status == JobStatus::Cancelled {
            jobs.remove(job_id.as_str());
        }
        Ok(status)
    }

    async fn fetch(&self, _auth: &AuthHandle, job_id: &JobId) -> ShellResult<Payload> {
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        let status = jobs
            .get(job_id.as_str())
            .map(|job| job.status.clone())
            .ok_or_else(|| ShellError::JobNotFound(job_id.to_string()))?;
        if status != JobStatus::Completed {
            return Err(ShellError::JobFailed(format!(
                "job {job_id} is {status}, not completed"
            )));
        }
        jobs.remove(job_id.as_str())
            .map(|job| job.payload)
            .ok_or_else(|| ShellError::JobNotFound(job_id.to_string()))
    }

    async fn cancel(&self, _auth: &AuthHandle, job_id: &JobId) -> ShellResult<()> {
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        let job = jobs
            .get_mut(job_id.as_str())
            .ok_or_else(|| ShellError::JobNotFound(job_id.to_string()))?;
        if !job.status.is_terminal() {
            job.status = JobStatus::Cancelled;
        }
        Ok(())
    }
}

/// Backends available without any configuration: `local` completes
/// immediately, `queued` behaves like a remote simulator with a short queue.
pub fn builtin_backends() -> ShellResult<BackendSet> {
    BackendSet::new()
        .with(Arc::new(LocalSimulator::new("local", 24)))?
        .with(Arc::new(QueuedSimulator::new(
            BackendDescriptor::remote_simulator("queued", 32, CredentialRef::new("demo"))
                .with_limits(CapabilityLimits::new(2, 32, 100_000))
                .with_poll_interval(Duration::from_millis(200)),
            3,
        )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_simulator_completes_on_submit() {
        let sim = LocalSimulator::new("local", 4);
        let auth = sim.authenticate(&CredentialRef::anonymous()).await.unwrap();
        let circuit = CircuitSpec::new("bell", 2).with_gates(["h", "cx"]);
        let job = sim.submit(&auth, &circuit, 1000).await.unwrap();

        assert_eq!(sim.poll(&auth, &job).await.unwrap(), JobStatus::Completed);
        let payload = sim.fetch(&auth, &job).await.unwrap();
        assert_eq!(payload.counts.get("00"), 500);
        assert_eq!(payload.counts.get("11"), 500);
        assert_eq!(payload.metadata["circuit"], "bell");
    }

    #[tokio::test]
    async fn test_local_simulator_forgets_fetched_jobs() {
        let sim = LocalSimulator::new("local", 4);
        let auth = AuthHandle::none();
        for _ in 0..5 {
            let job = sim.submit(&auth, &CircuitSpec::new("ping", 1), 8).await.unwrap();
            sim.fetch(&auth, &job).await.unwrap();
            assert!(matches!(
                sim.fetch(&auth, &job).await,
                Err(ShellError::JobNotFound(_))
            ));
        }
        assert_eq!(sim.tracked_jobs(), 0);
    }

    #[tokio::test]
    async fn test_local_simulator_is_deterministic() {
        let sim = LocalSimulator::new("local", 4);
        let auth = AuthHandle::none();
        let circuit = CircuitSpec::new("ping", 1);
        let a = sim.submit(&auth, &circuit, 7).await.unwrap();
        let b = sim.submit(&auth, &circuit, 7).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(
            sim.fetch(&auth, &a).await.unwrap(),
            sim.fetch(&auth, &b).await.unwrap()
        );
    }

    #[tokio::test]
    async fn test_single_shot() {
        let sim = LocalSimulator::new("local", 4);
        let job = sim
            .submit(&AuthHandle::none(), &CircuitSpec::new("ping", 1), 1)
            .await
            .unwrap();
        let payload = sim.fetch(&AuthHandle::none(), &job).await.unwrap();
        assert_eq!(payload.counts.total_shots(), 1);
        assert_eq!(payload.counts.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_shots() {
        let sim = LocalSimulator::new("local", 4);
        let err = sim
            .submit(&AuthHandle::none(), &CircuitSpec::new("ping", 1), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, ShellError::Validation(ValidationError::InvalidShots(_))));
    }

    #[tokio::test]
    async fn test_queued_simulator_progresses() {
        let desc = BackendDescriptor::remote_simulator("cloud", 8, CredentialRef::new("ref"));
        let sim = QueuedSimulator::new(desc, 2);
        let auth = sim.authenticate(&CredentialRef::new("ref")).await.unwrap();
        let job = sim.submit(&auth, &CircuitSpec::new("ping", 1), 10).await.unwrap();

        assert!(sim.fetch(&auth, &job).await.is_err());
        assert_eq!(
            sim.poll(&auth, &job).await.unwrap(),
            JobStatus::Queued { position: Some(1) }
        );
        assert_eq!(
            sim.poll(&auth, &job).await.unwrap(),
            JobStatus::Queued { position: Some(0) }
        );
        assert_eq!(sim.poll(&auth, &job).await.unwrap(), JobStatus::Running);
        assert_eq!(sim.poll(&auth, &job).await.unwrap(), JobStatus::Completed);
        assert_eq!(sim.fetch(&auth, &job).await.unwrap().shots, 10);
        assert_eq!(sim.tracked_jobs(), 0);
    }

    #[tokio::test]
    async fn test_queued_simulator_cancel() {
        let desc = BackendDescriptor::remote_simulator("cloud", 8, CredentialRef::anonymous());
        let sim = QueuedSimulator::never_completes(desc);
        let auth = AuthHandle::none();
        let job = sim.submit(&auth, &CircuitSpec::new("ping", 1), 10).await.unwrap();
        assert!(sim.poll(&auth, &job).await.unwrap().is_pending());
        sim.cancel(&auth, &job).await.unwrap();
        assert_eq!(sim.poll(&auth, &job).await.unwrap(), JobStatus::Cancelled);
        assert_eq!(sim.tracked_jobs(), 0);
    }

    #[test]
    fn test_builtin_backends() {
        let set = builtin_backends().unwrap();
        let ids: Vec<_> = set.descriptors().into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["local".to_string(), "queued".to_string()]);
        let queued = set.get("queued").unwrap();
        assert_eq!(queued.descriptor().limits.max_parallel_circuits, 2);
        assert_eq!(queued.available_slots(), 2);
    }
}
