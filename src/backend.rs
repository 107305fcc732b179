//! Backend client contract and the set of configured backends.
//!
//! Every provider (local simulator, cloud simulator, queued hardware) sits
//! behind the same four-call contract:
//!
//! ```text
//!   authenticate() ──→ submit() ──→ poll() ... poll() ──→ fetch()
//!      (async)          (async)       (async)              (async)
//! ```
//!
//! | Method | Kind | Required | Returns |
//! |--------|------|----------|---------|
//! | `descriptor()` | sync | yes | `&BackendDescriptor` |
//! | `authenticate()` | async | yes | `ShellResult<AuthHandle>` |
//! | `submit()` | async | yes | `ShellResult<JobId>` |
//! | `poll()` | async | yes | `ShellResult<JobStatus>` |
//! | `fetch()` | async | yes | `ShellResult<Payload>` |
//! | `cancel()` | async | provided | `ShellResult<()>` |
//!
//! The dispatcher never embeds provider-specific logic beyond this trait.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::capability::{BackendDescriptor, CredentialRef};
use crate::error::{ShellError, ShellResult};
use crate::job::{JobId, JobStatus};
use crate::module::CircuitSpec;
use crate::result::Payload;

/// Session token returned by [`BackendClient::authenticate`].
///
/// Read-only once issued; `Debug` never prints the token.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthHandle(String);

impl AuthHandle {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Handle for backends without authentication.
    pub fn none() -> Self {
        Self(String::new())
    }

    pub fn token(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AuthHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthHandle(<redacted>)")
    }
}

/// Client for one compute provider.
///
/// # Contract
///
/// - `descriptor()` is synchronous and infallible; it is cached at construction.
/// - `authenticate()` returns [`ShellError::Auth`] for rejected credentials and
///   [`ShellError::BackendUnavailable`] for connectivity problems.
/// - `submit()` returns a job whose first reported status is `Queued`,
///   `Running`, or already terminal for synchronous backends.
/// - `fetch()` is only called after `poll()` reported `Completed`.
/// - Rate limiting and connectivity blips map to `BackendUnavailable`; the
///   dispatcher retries exactly those.
#[async_trait]
pub trait BackendClient: Send + Sync {
    fn descriptor(&self) -> &BackendDescriptor;

    /// Exchange a credential reference for a session handle.
    async fn authenticate(&self, credential: &CredentialRef) -> ShellResult<AuthHandle>;

    /// Submit a circuit for `shots` executions.
    async fn submit(&self, auth: &AuthHandle, circuit: &CircuitSpec, shots: u32)
    -> ShellResult<JobId>;

    async fn poll(&self, auth: &AuthHandle, job_id: &JobId) -> ShellResult<JobStatus>;

    async fn fetch(&self, auth: &AuthHandle, job_id: &JobId) -> ShellResult<Payload>;

    /// Ask the provider to stop a job. Best effort; not every provider can.
    async fn cancel(&self, _auth: &AuthHandle, job_id: &JobId) -> ShellResult<()> {
        Err(ShellError::Unsupported(format!(
            "backend '{}' cannot cancel job {job_id}",
            self.descriptor().id
        )))
    }
}

/// A configured backend: client, circuit slots and cached auth.
pub struct BackendEntry {
    client: Arc<dyn BackendClient>,
    slots: Arc<Semaphore>,
    auth: Mutex<Option<AuthHandle>>,
}

impl BackendEntry {
    fn new(client: Arc<dyn BackendClient>) -> Self {
        let permits = client.descriptor().limits.max_parallel_circuits as usize;
        Self {
            client,
            slots: Arc::new(Semaphore::new(permits)),
            auth: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.client.descriptor().id
    }

    pub fn descriptor(&self) -> &BackendDescriptor {
        self.client.descriptor()
    }

    pub fn client(&self) -> &dyn BackendClient {
        self.client.as_ref()
    }

    /// Circuit slots currently free.
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Wait for a circuit slot. The slot is returned when the permit drops.
    pub async fn acquire_slot(&self) -> ShellResult<OwnedSemaphorePermit> {
        Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| ShellError::BackendUnavailable(format!("backend '{}' closed", self.id())))
    }

    /// Cached auth handle, authenticating on first use.
    ///
    /// Failed attempts are not cached, so a later call tries again.
    /// Concurrent callers wait for a single authentication.
    pub async fn auth(&self) -> ShellResult<AuthHandle> {
        let mut cached = self.auth.lock().await;
        if let Some(handle) = cached.as_ref() {
            return Ok(handle.clone());
        }
        debug!(backend = %self.id(), "authenticating");
        let handle = self
            .client
            .authenticate(&self.client.descriptor().credential)
            .await?;
        *cached = Some(handle.clone());
        Ok(handle)
    }

    /// Drop the cached auth handle; the next [`auth`](Self::auth)
    /// authenticates again.
    pub async fn invalidate_auth(&self) {
        if self.auth.lock().await.take().is_some() {
            debug!(backend = %self.id(), "auth handle invalidated");
        }
    }
}

impl fmt::Debug for BackendEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendEntry")
            .field("id", &self.id())
            .field("kind", &self.descriptor().kind)
            .field("available_slots", &self.available_slots())
            .finish()
    }
}

/// Backends known to the dispatcher, keyed by descriptor id.
#[derive(Debug, Default)]
pub struct BackendSet {
    entries: FxHashMap<String, Arc<BackendEntry>>,
}

impl BackendSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a backend. Fails if the id is already taken.
    pub fn insert(&mut self, client: Arc<dyn BackendClient>) -> ShellResult<()> {
        let id = client.descriptor().id.clone();
        if self.entries.contains_key(&id) {
            return Err(ShellError::Fatal(format!("backend '{id}' is already registered")));
        }
        self.entries.insert(id, Arc::new(BackendEntry::new(client)));
        Ok(())
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with(mut self, client: Arc<dyn BackendClient>) -> ShellResult<Self> {
        self.insert(client)?;
        Ok(self)
    }

    pub fn get(&self, id: &str) -> ShellResult<Arc<BackendEntry>> {
        self.entries
            .get(id)
            .cloned()
            .ok_or_else(|| ShellError::NotFound(format!("backend '{id}'")))
    }

    /// Descriptors of every backend, sorted by id.
    pub fn descriptors(&self) -> Vec<BackendDescriptor> {
        let mut descriptors: Vec<_> = self
            .entries
            .values()
            .map(|e| e.descriptor().clone())
            .collect();
        descriptors.sort_by(|a, b| a.id.cmp(&b.id));
        descriptors
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalSimulator;

    #[test]
    fn test_auth_handle_debug_is_redacted() {
        let handle = AuthHandle::new("secret-token");
        assert_eq!(format!("{handle:?}"), "AuthHandle(<redacted>)");
        assert_eq!(handle.token(), "secret-token");
    }

    #[test]
    fn test_backend_set_rejects_duplicates() {
        let mut set = BackendSet::new();
        set.insert(Arc::new(LocalSimulator::new("local", 8))).unwrap();
        let err = set
            .insert(Arc::new(LocalSimulator::new("local", 16)))
            .unwrap_err();
        assert!(matches!(err, ShellError::Fatal(_)));
        assert!(matches!(set.get("other"), Err(ShellError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_slots_follow_parallel_limit() {
        let set = BackendSet::new()
            .with(Arc::new(LocalSimulator::new("local", 8)))
            .unwrap();
        let entry = set.get("local").unwrap();
        let max = entry.descriptor().limits.max_parallel_circuits as usize;
        assert_eq!(entry.available_slots(), max);

        let permit = entry.acquire_slot().await.unwrap();
        assert_eq!(entry.available_slots(), max - 1);
        drop(permit);
        assert_eq!(entry.available_slots(), max);
    }

    #[tokio::test]
    async fn test_auth_is_cached_until_invalidated() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct CountingAuth {
            inner: LocalSimulator,
            logins: AtomicUsize,
        }

        #[async_trait]
        impl BackendClient for CountingAuth {
            fn descriptor(&self) -> &BackendDescriptor {
                self.inner.descriptor()
            }
            async fn authenticate(&self, credential: &CredentialRef) -> ShellResult<AuthHandle> {
                let n = self.logins.fetch_add(1, Ordering::SeqCst);
                self.inner.authenticate(credential).await?;
                Ok(AuthHandle::new(format!("token-{n}")))
            }
            async fn submit(
                &self,
                auth: &AuthHandle,
                circuit: &CircuitSpec,
                shots: u32,
            ) -> ShellResult<JobId> {
                self.inner.submit(auth, circuit, shots).await
            }
            async fn poll(&self, auth: &AuthHandle, job_id: &JobId) -> ShellResult<JobStatus> {
                self.inner.poll(auth, job_id).await
            }
            async fn fetch(&self, auth: &AuthHandle, job_id: &JobId) -> ShellResult<Payload> {
                self.inner.fetch(auth, job_id).await
            }
        }

        let client = Arc::new(CountingAuth {
            inner: LocalSimulator::new("local", 4),
            logins: AtomicUsize::new(0),
        });
        let set = BackendSet::new().with(client.clone()).unwrap();
        let entry = set.get("local").unwrap();

        assert_eq!(entry.auth().await.unwrap().token(), "token-0");
        assert_eq!(entry.auth().await.unwrap().token(), "token-0");
        assert_eq!(client.logins.load(Ordering::SeqCst), 1);

        entry.invalidate_auth().await;
        assert_eq!(entry.auth().await.unwrap().token(), "token-1");
        assert_eq!(client.logins.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_default_cancel_is_unsupported() {
        let sim = LocalSimulator::new("local", 4);
        let err = sim
            .cancel(&AuthHandle::none(), &JobId::new("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, ShellError::Unsupported(_)));
    }
}
