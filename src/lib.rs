//! HAL Shell: an interactive, module-driven front end for quantum backends
//!
//! This crate lets a user pick a [`Module`], fill in its typed options, and run
//! it against a local simulator or a remote backend through one uniform
//! [`BackendClient`] contract. A benchmark [`Orchestrator`] fans the same
//! module out across several backends and aggregates the results.
//!
//! # Overview
//!
//! The shell is built from:
//! - [`OptionSpec`] schemas and [`validate`](option::validate) for typed options
//! - A [`ModuleRegistry`] holding every [`Module`] by id
//! - [`BackendDescriptor`] / [`CapabilityLimits`] describing what a backend accepts
//! - A [`BackendClient`] trait covering authenticate, submit, poll and fetch
//! - A [`Dispatcher`] that drives one [`ExecutionRequest`] to a terminal
//!   [`ExecutionResult`] with bounded retries and a timeout
//! - A [`Session`] state machine and the [`Shell`] command layer on top of it
//! - [`ShellError`] with local, transient and terminal error categories
//!
//! # Request lifecycle
//!
//! ```text
//!   Pending ──submit──→ Submitted ──poll──→ Polling ──→ Completed
//!      │                    │                  │    ──→ Failed
//!      └──→ Failed          └──→ Completed     └────→ TimedOut | Cancelled
//! ```
//!
//! Validation (unknown options, missing required values, capability
//! mismatch) happens before any backend call and is returned as `Err`.
//! Everything that goes wrong after submission is recorded in the
//! [`ExecutionResult`] instead.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use hal_shell::{Dispatcher, ModuleRegistry, Session, ShellConfig};
//! use hal_shell::local::builtin_backends;
//!
//! let registry = Arc::new(ModuleRegistry::with_builtins()?);
//! let dispatcher = Dispatcher::new(Arc::new(builtin_backends()?));
//! let config = ShellConfig { default_backend: Some("local".into()), ..Default::default() };
//! let session = Session::new(registry, dispatcher, &config);
//!
//! session.select_module("sample")?;
//! session.set_option("N", "4")?;
//! let result = session.run().await?;
//! assert!(result.is_success());
//! ```

pub mod backend;
pub mod benchmark;
pub mod capability;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod job;
pub mod local;
pub mod module;
pub mod option;
pub mod registry;
pub mod result;
pub mod session;
pub mod shell;
pub mod telemetry;

pub use backend::{AuthHandle, BackendClient, BackendSet};
pub use benchmark::{BenchmarkReport, BenchmarkSpec, Orchestrator};
pub use capability::{BackendDescriptor, BackendKind, CapabilityLimits, CredentialRef, QueueClass};
pub use config::ShellConfig;
pub use dispatcher::{Dispatcher, ExecutionRequest, JobHandle, RetryPolicy};
pub use error::{ErrorKind, ShellError, ShellResult, ValidationError};
pub use job::{JobId, JobStatus, RequestState};
pub use module::{CircuitSpec, Module};
pub use option::{OptionKind, OptionRule, OptionSpec, OptionValue, ResolvedOptions};
pub use registry::ModuleRegistry;
pub use result::{Counts, ExecutionResult, ExecutionStatus, Payload};
pub use session::{Session, SessionState};
pub use shell::{Command, Shell};
