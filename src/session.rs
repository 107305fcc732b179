//! The interactive session.
//!
//! A [`Session`] owns the current module selection, the raw option values
//! typed by the user, and the run history. Its state machine:
//!
//! ```text
//!   Empty ──use──→ Selected ──validate──→ Configured ──run──→ Running
//!     ↑              ↑  ↑                                       │
//!     └────back──────┘  └──set/unset──── Completed | Failed ←───┘
//! ```
//!
//! `set` only records the raw string; validation happens when `run` (or
//! `configure`) is invoked. `run` moves to `Running` before its first await,
//! so a second `run` from another task sees `Running` and gets
//! [`ShellError::Busy`] instead of queueing.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ShellConfig;
use crate::dispatcher::{Dispatcher, ExecutionRequest};
use crate::error::{ShellError, ShellResult, ValidationError};
use crate::module::Module;
use crate::option::{OptionValue, ResolvedOptions, validate};
use crate::registry::ModuleRegistry;
use crate::result::ExecutionResult;

/// Lifecycle state of the session's current module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Empty,
    Selected,
    Configured,
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Empty => "empty",
            SessionState::Selected => "selected",
            SessionState::Configured => "configured",
            SessionState::Running => "running",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub module_id: String,
    pub backend_id: String,
    /// Resolved option values at submission time.
    pub options: BTreeMap<String, OptionValue>,
    pub shots: u32,
    pub result: ExecutionResult,
    pub finished_at: DateTime<Utc>,
}

/// Row of `show options` output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptionRow {
    pub name: String,
    pub kind: String,
    pub required: bool,
    /// Explicit value if set, else the default.
    pub current: Option<String>,
    pub description: String,
}

struct Inner {
    module: Option<Arc<dyn Module>>,
    raw: BTreeMap<String, String>,
    state: SessionState,
    backend: Option<String>,
    shots: u32,
    history: Vec<HistoryEntry>,
}

impl Inner {
    fn ensure_idle(&self) -> ShellResult<()> {
        if self.state == SessionState::Running {
            Err(ShellError::Busy)
        } else {
            Ok(())
        }
    }

    fn module(&self) -> ShellResult<Arc<dyn Module>> {
        self.module.clone().ok_or(ShellError::NoModuleSelected)
    }

    fn set_state(&mut self, next: SessionState) {
        if self.state != next {
            debug!(from = %self.state, to = %next, "session state");
            self.state = next;
        }
    }
}

/// Single mutable context for the command layer.
pub struct Session {
    registry: Arc<ModuleRegistry>,
    dispatcher: Dispatcher,
    /// Configured timeout; the target's queue-class default applies when unset.
    timeout: Option<Duration>,
    inner: Mutex<Inner>,
}

impl Session {
    pub fn new(registry: Arc<ModuleRegistry>, dispatcher: Dispatcher, config: &ShellConfig) -> Self {
        Self {
            registry,
            dispatcher,
            timeout: config.timeout(),
            inner: Mutex::new(Inner {
                module: None,
                raw: BTreeMap::new(),
                state: SessionState::Empty,
                backend: config.default_backend.clone(),
                shots: config.default_shots,
                history: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn current_module(&self) -> Option<String> {
        self.lock().module.as_ref().map(|m| m.id().to_string())
    }

    pub fn backend(&self) -> Option<String> {
        self.lock().backend.clone()
    }

    pub fn shots(&self) -> u32 {
        self.lock().shots
    }

    /// Select a module. Option values reset to defaults.
    pub fn select_module(&self, id: &str) -> ShellResult<()> {
        let mut inner = self.lock();
        inner.ensure_idle()?;
        let module = self.registry.find(id)?;
        inner.module = Some(module);
        inner.raw.clear();
        inner.set_state(SessionState::Selected);
        Ok(())
    }

    /// Drop the current module selection.
    pub fn back(&self) -> ShellResult<()> {
        let mut inner = self.lock();
        inner.ensure_idle()?;
        inner.module = None;
        inner.raw.clear();
        inner.set_state(SessionState::Empty);
        Ok(())
    }

    /// Record a raw value. Checked when the session next runs.
    ///
    /// Names matching a declared option case-insensitively are stored under
    /// the declared spelling.
    pub fn set_option(&self, name: &str, raw: &str) -> ShellResult<()> {
        let mut inner = self.lock();
        inner.ensure_idle()?;
        let module = inner.module()?;
        let name = module
            .options()
            .iter()
            .find(|o| o.name.eq_ignore_ascii_case(name))
            .map_or_else(|| name.to_string(), |o| o.name.clone());
        inner.raw.insert(name, raw.to_string());
        inner.set_state(SessionState::Selected);
        Ok(())
    }

    /// Remove an explicit value, falling back to the default.
    pub fn unset_option(&self, name: &str) -> ShellResult<()> {
        let mut inner = self.lock();
        inner.ensure_idle()?;
        inner.module()?;
        inner.raw.retain(|k, _| !k.eq_ignore_ascii_case(name));
        inner.set_state(SessionState::Selected);
        Ok(())
    }

    /// Choose the backend for subsequent runs.
    pub fn set_backend(&self, id: &str) -> ShellResult<()> {
        self.dispatcher.backends().get(id)?;
        let mut inner = self.lock();
        inner.ensure_idle()?;
        inner.backend = Some(id.to_string());
        Ok(())
    }

    pub fn set_shots(&self, shots: u32) -> ShellResult<()> {
        if shots == 0 {
            return Err(ValidationError::InvalidShots("shots must be at least 1".into()).into());
        }
        let mut inner = self.lock();
        inner.ensure_idle()?;
        inner.shots = shots;
        Ok(())
    }

    /// Validate the current option set, moving to `Configured` on success.
    pub fn configure(&self) -> ShellResult<ResolvedOptions> {
        let mut inner = self.lock();
        inner.ensure_idle()?;
        let module = inner.module()?;
        let resolved = validate(module.id(), module.options(), &inner.raw)?;
        inner.set_state(SessionState::Configured);
        Ok(resolved)
    }

    /// Options of the current module with their current values.
    pub fn show_options(&self) -> ShellResult<Vec<OptionRow>> {
        let inner = self.lock();
        let module = inner.module()?;
        Ok(module
            .options()
            .iter()
            .map(|spec| OptionRow {
                name: spec.name.clone(),
                kind: spec.kind.to_string(),
                required: spec.required,
                current: inner
                    .raw
                    .get(&spec.name)
                    .cloned()
                    .or_else(|| spec.default.as_ref().map(ToString::to_string)),
                description: spec.description.clone(),
            })
            .collect())
    }

    /// Past runs, in completion order.
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.lock().history.clone()
    }

    /// Validate, submit and wait for the current module.
    ///
    /// Local problems (no module, invalid options, capability mismatch,
    /// busy) are returned as `Err` and never reach the dispatcher. Remote
    /// outcomes, including failures and timeouts, come back as `Ok` with a
    /// terminal result that is also appended to the history.
    pub async fn run(&self) -> ShellResult<ExecutionResult> {
        let (request, mut guard) = {
            let mut inner = self.lock();
            inner.ensure_idle()?;
            let module = inner.module()?;
            let options = validate(module.id(), module.options(), &inner.raw)?;

            let backend_id = inner
                .backend
                .clone()
                .ok_or_else(|| ShellError::NotFound("no backend selected".into()))?;
            let target = self.dispatcher.backends().get(&backend_id)?.descriptor().clone();
            let request = ExecutionRequest::new(module.as_ref(), options, &target, inner.shots)?;

            inner.set_state(SessionState::Configured);
            inner.set_state(SessionState::Running);
            (request, RunGuard { session: self, armed: true })
        };

        info!(
            module = %request.module_id(),
            backend = %request.target().id,
            shots = request.shots(),
            "run started"
        );
        let entry_options = request.options().values().clone();
        let backend_id = request.target().id.clone();
        let shots = request.shots();
        let timeout = self
            .timeout
            .unwrap_or_else(|| request.target().default_timeout());
        let result = self.dispatcher.execute(request, timeout).await;

        guard.armed = false;
        let mut inner = self.lock();
        inner.history.push(HistoryEntry {
            module_id: result.module_id().to_string(),
            backend_id,
            options: entry_options,
            shots,
            result: result.clone(),
            finished_at: Utc::now(),
        });
        inner.set_state(if result.is_success() {
            SessionState::Completed
        } else {
            SessionState::Failed
        });
        info!(status = %result.status(), "run finished");
        Ok(result)
    }
}

/// Returns the session to `Configured` if a run future is dropped mid-flight.
struct RunGuard<'a> {
    session: &'a Session,
    armed: bool,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!("run dropped before completion; remote job abandoned");
            self.session.lock().set_state(SessionState::Configured);
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("Session")
            .field("state", &inner.state)
            .field("module", &inner.module.as_ref().map(|m| m.id().to_string()))
            .field("backend", &inner.backend)
            .field("history", &inner.history.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendSet;
    use crate::capability::{BackendDescriptor, CredentialRef, QueueClass};
    use crate::local::{LocalSimulator, QueuedSimulator};
    use crate::result::ExecutionStatus;

    fn session() -> Session {
        let backends = BackendSet::new()
            .with(Arc::new(LocalSimulator::new("local", 16)))
            .unwrap()
            .with(Arc::new(QueuedSimulator::new(
                BackendDescriptor::remote_simulator("cloud", 16, CredentialRef::new("ref"))
                    .with_poll_interval(Duration::from_millis(100)),
                5,
            )))
            .unwrap();
        let config = ShellConfig {
            default_backend: Some("local".into()),
            default_shots: 100,
            ..ShellConfig::default()
        };
        Session::new(
            Arc::new(ModuleRegistry::with_builtins().unwrap()),
            Dispatcher::new(Arc::new(backends)),
            &config,
        )
    }

    #[test]
    fn test_select_resets_options() {
        let session = session();
        assert_eq!(session.state(), SessionState::Empty);
        session.select_module("sample").unwrap();
        session.set_option("n", "5").unwrap();
        let rows = session.show_options().unwrap();
        assert_eq!(rows[0].name, "N");
        assert_eq!(rows[0].current.as_deref(), Some("5"));
        assert_eq!(rows[1].current.as_deref(), Some("z"));

        session.select_module("sample").unwrap();
        assert_eq!(session.show_options().unwrap()[0].current, None);
        assert_eq!(session.state(), SessionState::Selected);
    }

    #[test]
    fn test_set_without_module() {
        let session = session();
        assert!(matches!(
            session.set_option("N", "1"),
            Err(ShellError::NoModuleSelected)
        ));
        assert!(matches!(session.select_module("nope"), Err(ShellError::NotFound(_))));
    }

    #[test]
    fn test_set_backend_must_exist() {
        let session = session();
        assert!(session.set_backend("cloud").is_ok());
        assert!(matches!(session.set_backend("mars"), Err(ShellError::NotFound(_))));
        assert_eq!(session.backend().as_deref(), Some("cloud"));
        assert!(session.set_shots(0).is_err());
    }

    #[tokio::test]
    async fn test_run_missing_required_names_option() {
        let session = session();
        session.select_module("sample").unwrap();
        let err = session.run().await.unwrap_err();
        match err {
            ShellError::Validation(v) => assert_eq!(v.option_name(), Some("N")),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(session.state(), SessionState::Selected);
        assert!(session.history().is_empty());
    }

    #[tokio::test]
    async fn test_run_records_history() {
        let session = session();
        session.select_module("sample").unwrap();
        session.set_option("N", "3").unwrap();
        assert!(session.configure().is_ok());
        assert_eq!(session.state(), SessionState::Configured);

        let result = session.run().await.unwrap();
        assert_eq!(result.status(), ExecutionStatus::Succeeded);
        assert_eq!(session.state(), SessionState::Completed);

        let history = session.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].options["N"], OptionValue::Int(3));
        assert_eq!(history[0].shots, 100);
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent_on_local_backend() {
        let session = session();
        session.select_module("sample").unwrap();
        session.set_option("N", "4").unwrap();
        let first = session.run().await.unwrap();
        let second = session.run().await.unwrap();
        assert_eq!(first.payload(), second.payload());
        assert_eq!(session.history().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_run_is_busy() {
        let session = Arc::new(session());
        session.set_backend("cloud").unwrap();
        session.select_module("ping").unwrap();

        let runner = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.run().await })
        };
        while session.state() != SessionState::Running {
            tokio::task::yield_now().await;
        }

        assert!(matches!(session.run().await, Err(ShellError::Busy)));
        assert!(matches!(session.select_module("sample"), Err(ShellError::Busy)));
        assert!(matches!(session.set_backend("local"), Err(ShellError::Busy)));

        let result = runner.await.unwrap().unwrap();
        assert!(result.is_success());
        assert_eq!(session.state(), SessionState::Completed);
        assert_eq!(session.history().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_run_does_not_wedge_session() {
        let session = session();
        session.set_backend("cloud").unwrap();
        session.select_module("ping").unwrap();

        let outcome = tokio::time::timeout(Duration::from_millis(150), session.run()).await;
        assert!(outcome.is_err());
        assert_eq!(session.state(), SessionState::Configured);
        assert!(session.run().await.is_ok());
    }

    #[tokio::test]
    async fn test_capability_mismatch_keeps_selected_state() {
        let session = session();
        session.select_module("sample").unwrap();
        session.set_option("N", "20").unwrap();
        assert!(matches!(
            session.run().await,
            Err(ShellError::Validation(ValidationError::CapabilityExceeded { .. }))
        ));
        assert_eq!(session.state(), SessionState::Selected);
        assert!(session.history().is_empty());
    }

    fn batch_session(timeout_secs: Option<u64>) -> Session {
        // Finishes after roughly 100 s of polling.
        let desc = BackendDescriptor::remote_simulator("batch", 16, CredentialRef::new("ref"))
            .with_queue_class(QueueClass::Batch)
            .with_poll_interval(Duration::from_secs(10));
        let backends = BackendSet::new()
            .with(Arc::new(QueuedSimulator::new(desc, 9)))
            .unwrap();
        let config = ShellConfig {
            default_backend: Some("batch".into()),
            timeout_secs,
            ..ShellConfig::default()
        };
        let session = Session::new(
            Arc::new(ModuleRegistry::with_builtins().unwrap()),
            Dispatcher::new(Arc::new(backends)),
            &config,
        );
        session.select_module("ping").unwrap();
        session
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_target_waits_past_interactive_timeout() {
        let result = batch_session(None).run().await.unwrap();
        assert_eq!(result.status(), ExecutionStatus::Succeeded);
        assert!(result.duration() >= Duration::from_secs(90));
    }

    #[tokio::test(start_paused = true)]
    async fn test_configured_timeout_overrides_queue_class() {
        let result = batch_session(Some(60)).run().await.unwrap();
        assert_eq!(result.status(), ExecutionStatus::TimedOut);
        assert!(result.duration() <= Duration::from_secs(61));
    }

    #[test]
    fn test_back_clears_module() {
        let session = session();
        session.select_module("ping").unwrap();
        session.back().unwrap();
        assert_eq!(session.state(), SessionState::Empty);
        assert!(session.current_module().is_none());
    }
}
