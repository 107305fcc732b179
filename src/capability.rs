//! Backend descriptors and capability limits.
//!
//! A [`BackendDescriptor`] tells the dispatcher what a backend is (local
//! simulator, remote simulator, remote hardware), how much it can take
//! ([`CapabilityLimits`]), how to authenticate ([`CredentialRef`]) and how
//! long jobs usually sit in its queue ([`QueueClass`]).
//!
//! Requests are checked against the limits when they are built, so an
//! oversized job is rejected before any backend call is made.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Kind of compute provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// In-process simulator; jobs complete during submission.
    LocalSimulator,
    /// Simulator reached over the network.
    RemoteSimulator,
    /// Real device behind a provider queue.
    RemoteHardware,
}

impl BackendKind {
    pub fn is_local(self) -> bool {
        matches!(self, BackendKind::LocalSimulator)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::LocalSimulator => write!(f, "local-simulator"),
            BackendKind::RemoteSimulator => write!(f, "remote-simulator"),
            BackendKind::RemoteHardware => write!(f, "remote-hardware"),
        }
    }
}

/// Expected queueing behaviour, used for timeout and poll defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueClass {
    /// Results in seconds.
    Interactive,
    /// Results in minutes or longer.
    Batch,
}

impl QueueClass {
    /// Default time a caller waits for a job before giving up.
    pub fn default_timeout(self) -> Duration {
        match self {
            QueueClass::Interactive => Duration::from_secs(60),
            QueueClass::Batch => Duration::from_secs(30 * 60),
        }
    }

    /// Default interval between status polls.
    pub fn default_poll_interval(self) -> Duration {
        match self {
            QueueClass::Interactive => Duration::from_millis(200),
            QueueClass::Batch => Duration::from_secs(5),
        }
    }
}

/// Resource limits of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityLimits {
    /// Maximum circuits executing at once.
    pub max_parallel_circuits: u32,
    /// Maximum qubits per circuit.
    pub max_qubits: u32,
    /// Maximum shots per job.
    pub max_shots: u32,
}

impl CapabilityLimits {
    pub fn new(max_parallel_circuits: u32, max_qubits: u32, max_shots: u32) -> Self {
        Self {
            max_parallel_circuits,
            max_qubits,
            max_shots,
        }
    }

    /// List every way `needs` exceeds these limits on a backend of `kind`.
    ///
    /// An empty list means the request fits.
    pub fn violations(&self, kind: BackendKind, needs: &ResourceNeeds) -> Vec<String> {
        let mut reasons = vec![];
        if needs.qubits > self.max_qubits {
            reasons.push(format!(
                "needs {} qubits, backend has {}",
                needs.qubits, self.max_qubits
            ));
        }
        if needs.shots > self.max_shots {
            reasons.push(format!(
                "needs {} shots, backend allows {}",
                needs.shots, self.max_shots
            ));
        }
        if needs.needs_network && kind.is_local() {
            reasons.push("module needs network access, backend is local".into());
        }
        if self.max_parallel_circuits == 0 {
            reasons.push("backend accepts no circuits".into());
        }
        reasons
    }
}

/// Resources one request would consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceNeeds {
    pub qubits: u32,
    pub shots: u32,
    pub needs_network: bool,
}

/// Capability requirements declared by a module.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleRequirements {
    /// Lower bound on qubits regardless of options.
    pub min_qubits: u32,
    /// Module talks to the network (scanners) and cannot run locally.
    pub needs_network: bool,
}

/// Opaque reference into the secret-lookup service.
///
/// This layer never holds the secret itself, only the handle a backend
/// client exchanges for an [`AuthHandle`](crate::backend::AuthHandle).
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CredentialRef(String);

impl CredentialRef {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    /// Reference for backends that need no credentials.
    pub fn anonymous() -> Self {
        Self(String::new())
    }

    pub fn is_anonymous(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for CredentialRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_anonymous() {
            write!(f, "CredentialRef(anonymous)")
        } else {
            write!(f, "CredentialRef(<redacted>)")
        }
    }
}

/// Description of one backend the shell can dispatch to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendDescriptor {
    /// Unique backend identifier.
    pub id: String,
    pub kind: BackendKind,
    pub limits: CapabilityLimits,
    pub credential: CredentialRef,
    pub queue_class: QueueClass,
    /// Overrides the queue class poll interval.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval: Option<Duration>,
}

impl BackendDescriptor {
    /// Descriptor for an in-process simulator.
    pub fn local_simulator(id: impl Into<String>, max_qubits: u32) -> Self {
        Self {
            id: id.into(),
            kind: BackendKind::LocalSimulator,
            limits: CapabilityLimits::new(4, max_qubits, 100_000),
            credential: CredentialRef::anonymous(),
            queue_class: QueueClass::Interactive,
            poll_interval: None,
        }
    }

    /// Descriptor for a simulator behind a network API.
    pub fn remote_simulator(
        id: impl Into<String>,
        max_qubits: u32,
        credential: CredentialRef,
    ) -> Self {
        Self {
            id: id.into(),
            kind: BackendKind::RemoteSimulator,
            limits: CapabilityLimits::new(16, max_qubits, 100_000),
            credential,
            queue_class: QueueClass::Interactive,
            poll_interval: None,
        }
    }

    /// Descriptor for a queued hardware device.
    pub fn remote_hardware(
        id: impl Into<String>,
        max_qubits: u32,
        credential: CredentialRef,
    ) -> Self {
        Self {
            id: id.into(),
            kind: BackendKind::RemoteHardware,
            limits: CapabilityLimits::new(1, max_qubits, 20_000),
            credential,
            queue_class: QueueClass::Batch,
            poll_interval: None,
        }
    }

    pub fn with_limits(mut self, limits: CapabilityLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_queue_class(mut self, class: QueueClass) -> Self {
        self.queue_class = class;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    /// Effective interval between status polls.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
            .unwrap_or_else(|| self.queue_class.default_poll_interval())
    }

    /// Default timeout for jobs on this backend.
    pub fn default_timeout(&self) -> Duration {
        self.queue_class.default_timeout()
    }

    /// Fail if `needs` does not fit within this backend's limits.
    pub fn admit(&self, needs: &ResourceNeeds) -> Result<(), ValidationError> {
        let reasons = self.limits.violations(self.kind, needs);
        if reasons.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::CapabilityExceeded {
                backend: self.id.clone(),
                reasons,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn needs(qubits: u32, shots: u32, needs_network: bool) -> ResourceNeeds {
        ResourceNeeds {
            qubits,
            shots,
            needs_network,
        }
    }

    #[test]
    fn test_local_simulator_descriptor() {
        let desc = BackendDescriptor::local_simulator("local", 24);
        assert!(desc.kind.is_local());
        assert!(desc.credential.is_anonymous());
        assert_eq!(desc.limits.max_qubits, 24);
        assert_eq!(desc.poll_interval(), Duration::from_millis(200));
    }

    #[test]
    fn test_admit_within_limits() {
        let desc = BackendDescriptor::local_simulator("local", 8);
        assert!(desc.admit(&needs(8, 1000, false)).is_ok());
    }

    #[test]
    fn test_admit_collects_all_reasons() {
        let desc = BackendDescriptor::local_simulator("local", 8);
        let err = desc.admit(&needs(9, 200_000, true)).unwrap_err();
        match err {
            ValidationError::CapabilityExceeded { backend, reasons } => {
                assert_eq!(backend, "local");
                assert_eq!(reasons.len(), 3);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_network_module_on_remote_backend() {
        let desc = BackendDescriptor::remote_hardware("qpu", 20, CredentialRef::new("vault:qpu"));
        assert!(desc.admit(&needs(5, 100, true)).is_ok());
        assert_eq!(desc.queue_class, QueueClass::Batch);
        assert_eq!(desc.default_timeout(), Duration::from_secs(1800));
    }

    #[test]
    fn test_credential_debug_is_redacted() {
        let cred = CredentialRef::new("vault:secret/ibm");
        assert_eq!(format!("{cred:?}"), "CredentialRef(<redacted>)");
    }

    #[test]
    fn test_poll_interval_override() {
        let desc = BackendDescriptor::remote_simulator("sim", 30, CredentialRef::anonymous())
            .with_poll_interval(Duration::from_millis(10));
        assert_eq!(desc.poll_interval(), Duration::from_millis(10));
    }
}
