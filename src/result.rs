//! Execution results.
//!
//! Every [`ExecutionRequest`](crate::dispatcher::ExecutionRequest) ends in
//! exactly one [`ExecutionResult`]. Results are built through one
//! constructor per terminal status and expose read-only accessors, so a
//! status can never change after the result exists.
//!
//! Bitstring ordering in [`Counts`]: the rightmost bit corresponds to the
//! lowest-indexed qubit (OpenQASM 3 convention).

use std::time::Duration;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, ShellError};
use crate::job::JobId;

/// Measurement counts from circuit execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counts {
    counts: FxHashMap<String, u64>,
}

impl Counts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build counts from pairs; duplicate bitstrings are summed.
    pub fn from_pairs(iter: impl IntoIterator<Item = (impl Into<String>, u64)>) -> Self {
        let mut counts = Self::new();
        for (k, v) in iter {
            counts.insert(k, v);
        }
        counts
    }

    /// Add `count` occurrences of `bitstring`.
    pub fn insert(&mut self, bitstring: impl Into<String>, count: u64) {
        *self.counts.entry(bitstring.into()).or_default() += count;
    }

    pub fn get(&self, bitstring: &str) -> u64 {
        self.counts.get(bitstring).copied().unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &u64)> {
        self.counts.iter()
    }

    pub fn total_shots(&self) -> u64 {
        self.counts.values().sum()
    }

    /// Most frequent bitstring; ties resolve to the lexicographically smallest.
    pub fn most_frequent(&self) -> Option<(&String, u64)> {
        self.counts
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(k, &v)| (k, v))
    }

    /// Counts sorted by count descending, then bitstring.
    pub fn sorted(&self) -> Vec<(&String, &u64)> {
        let mut items: Vec<_> = self.counts.iter().collect();
        items.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        items
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

/// Result blob fetched from a backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub counts: Counts,
    pub shots: u32,
    /// Derived values or provider extras.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Payload {
    pub fn new(counts: Counts, shots: u32) -> Self {
        Self {
            counts,
            shots,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Relative frequency of each bitstring.
    #[allow(clippy::cast_precision_loss)]
    pub fn probabilities(&self) -> FxHashMap<String, f64> {
        let total = self.counts.total_shots() as f64;
        if total == 0.0 {
            return FxHashMap::default();
        }
        self.counts
            .iter()
            .map(|(k, &v)| (k.clone(), v as f64 / total))
            .collect()
    }
}

/// Terminal status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Succeeded,
    Failed,
    /// This process stopped waiting; the remote job may still be running.
    TimedOut,
    Cancelled,
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionStatus::Succeeded => "succeeded",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::TimedOut => "timed out",
            ExecutionStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Error detail attached to non-successful results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&ShellError> for ErrorDetail {
    fn from(err: &ShellError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Outcome of one execution request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    module_id: String,
    backend_id: String,
    status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<Payload>,
    duration: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<ErrorDetail>,
    /// Remote job, kept so an abandoned job can be traced later.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    job_id: Option<JobId>,
    /// Submission attempts made, including retries.
    attempts: u32,
}

impl ExecutionResult {
    fn build(
        module_id: &str,
        backend_id: &str,
        status: ExecutionStatus,
        duration: Duration,
    ) -> Self {
        Self {
            module_id: module_id.to_string(),
            backend_id: backend_id.to_string(),
            status,
            payload: None,
            duration,
            error: None,
            job_id: None,
            attempts: 0,
        }
    }

    pub fn succeeded(
        module_id: &str,
        backend_id: &str,
        payload: Payload,
        duration: Duration,
    ) -> Self {
        let mut result = Self::build(module_id, backend_id, ExecutionStatus::Succeeded, duration);
        result.payload = Some(payload);
        result
    }

    pub fn failed(module_id: &str, backend_id: &str, error: &ShellError, duration: Duration) -> Self {
        let mut result = Self::build(module_id, backend_id, ExecutionStatus::Failed, duration);
        result.error = Some(error.into());
        result
    }

    pub fn timed_out(
        module_id: &str,
        backend_id: &str,
        message: impl Into<String>,
        duration: Duration,
    ) -> Self {
        let mut result = Self::build(module_id, backend_id, ExecutionStatus::TimedOut, duration);
        result.error = Some(ErrorDetail {
            kind: ErrorKind::Timeout,
            message: message.into(),
        });
        result
    }

    pub fn cancelled(
        module_id: &str,
        backend_id: &str,
        message: impl Into<String>,
        duration: Duration,
    ) -> Self {
        let mut result = Self::build(module_id, backend_id, ExecutionStatus::Cancelled, duration);
        result.error = Some(ErrorDetail {
            kind: ErrorKind::Backend,
            message: message.into(),
        });
        result
    }

    pub(crate) fn with_job(mut self, job_id: Option<JobId>) -> Self {
        self.job_id = job_id;
        self
    }

    pub(crate) fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn module_id(&self) -> &str {
        &self.module_id
    }

    pub fn backend_id(&self) -> &str {
        &self.backend_id
    }

    pub fn status(&self) -> ExecutionStatus {
        self.status
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Succeeded
    }

    pub fn payload(&self) -> Option<&Payload> {
        self.payload.as_ref()
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn error(&self) -> Option<&ErrorDetail> {
        self.error.as_ref()
    }

    pub fn job_id(&self) -> Option<&JobId> {
        self.job_id.as_ref()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
