//! The module contract and built-in modules.
//!
//! A module is a named unit of work: an option schema, capability
//! requirements and one entry point, [`Module::workload`], that turns
//! resolved options into a [`CircuitSpec`] any backend can execute.
//! The algorithm bodies live behind that entry point.

use serde::{Deserialize, Serialize};

use crate::capability::ModuleRequirements;
use crate::error::{ShellError, ShellResult};
use crate::option::{OptionSpec, OptionValue, ResolvedOptions};

/// Backend-neutral description of the work to execute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitSpec {
    /// Circuit or workload name.
    pub name: String,
    /// Qubits the circuit touches.
    pub num_qubits: u32,
    /// Gate sequence, OpenQASM 3 names.
    #[serde(default)]
    pub gates: Vec<String>,
    /// Module-specific parameters forwarded to the backend.
    #[serde(default)]
    pub params: serde_json::Value,
}

impl CircuitSpec {
    pub fn new(name: impl Into<String>, num_qubits: u32) -> Self {
        Self {
            name: name.into(),
            num_qubits,
            gates: vec![],
            params: serde_json::Value::Null,
        }
    }

    pub fn with_gates<S: Into<String>>(mut self, gates: impl IntoIterator<Item = S>) -> Self {
        self.gates = gates.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }
}

/// A pluggable unit of work.
///
/// # Contract
///
/// - `id()` is unique within a registry.
/// - `options()` is fixed for the lifetime of the module.
/// - `workload()` is only called with options produced by the validator for
///   this module, and must be deterministic in those options.
pub trait Module: Send + Sync {
    fn id(&self) -> &str;

    /// One-line summary shown by `show modules`.
    fn description(&self) -> &str;

    /// Declared options, in display order.
    fn options(&self) -> &[OptionSpec];

    fn requirements(&self) -> ModuleRequirements {
        ModuleRequirements::default()
    }

    /// Build the circuit to run for `options`.
    fn workload(&self, options: &ResolvedOptions) -> ShellResult<CircuitSpec>;
}

/// Liveness check: a one-qubit identity circuit.
#[derive(Debug, Default)]
pub struct Ping;

impl Module for Ping {
    fn id(&self) -> &str {
        "ping"
    }

    fn description(&self) -> &str {
        "Round-trip a trivial one-qubit circuit through a backend"
    }

    fn options(&self) -> &[OptionSpec] {
        &[]
    }

    fn requirements(&self) -> ModuleRequirements {
        ModuleRequirements {
            min_qubits: 1,
            needs_network: false,
        }
    }

    fn workload(&self, _options: &ResolvedOptions) -> ShellResult<CircuitSpec> {
        Ok(CircuitSpec::new("ping", 1).with_gates(["id"]))
    }
}

/// Uniform sampling over `N` qubits in the chosen basis.
#[derive(Debug)]
pub struct Sample {
    options: Vec<OptionSpec>,
}

impl Sample {
    pub fn new() -> Self {
        Self {
            options: vec![
                OptionSpec::int("N")
                    .required()
                    .with_range(1.0, 100.0)
                    .describe("Number of qubits to sample"),
                OptionSpec::choice("BASIS", ["z", "x"])
                    .with_default(OptionValue::String("z".into()))
                    .describe("Measurement basis"),
            ],
        }
    }
}

impl Default for Sample {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for Sample {
    fn id(&self) -> &str {
        "sample"
    }

    fn description(&self) -> &str {
        "Prepare N qubits in superposition and measure"
    }

    fn options(&self) -> &[OptionSpec] {
        &self.options
    }

    fn workload(&self, options: &ResolvedOptions) -> ShellResult<CircuitSpec> {
        let n = options
            .int("N")
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| ShellError::Backend("sample: N missing after validation".into()))?;
        let basis = options.str("BASIS").unwrap_or("z");
        let gates = match basis {
            "x" => vec!["h", "h"],
            _ => vec!["h"],
        };
        Ok(CircuitSpec::new("sample", n)
            .with_gates(gates)
            .with_params(serde_json::json!({ "basis": basis })))
    }
}
