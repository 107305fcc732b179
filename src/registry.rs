//! Module registry.
//!
//! Populated once at startup, then shared read-only (typically behind an
//! `Arc`). Registration rejects duplicate identifiers and inconsistent
//! schemas with [`ShellError::Fatal`] so configuration bugs stop startup.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::error::{ShellError, ShellResult};
use crate::module::{Module, Ping, Sample};
use crate::option::check_schema;

/// Listing entry for `show modules`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleSummary {
    pub id: String,
    pub description: String,
    pub option_count: usize,
    pub required_options: Vec<String>,
}

/// Lookup table of available modules, keyed by identifier.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: BTreeMap<String, Arc<dyn Module>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with `ping` and `sample`.
    pub fn with_builtins() -> ShellResult<Self> {
        let mut registry = Self::new();
        registry.register(Arc::new(Ping))?;
        registry.register(Arc::new(Sample::new()))?;
        Ok(registry)
    }

    /// Add a module. Fails if the id is taken or the schema is inconsistent.
    pub fn register(&mut self, module: Arc<dyn Module>) -> ShellResult<()> {
        let id = module.id().to_string();
        if id.is_empty() || id.contains(char::is_whitespace) {
            return Err(ShellError::Fatal(format!("invalid module id '{id}'")));
        }
        if self.modules.contains_key(&id) {
            return Err(ShellError::Fatal(format!("module '{id}' is already registered")));
        }
        check_schema(&id, module.options())?;
        debug!(module = %id, options = module.options().len(), "registered module");
        self.modules.insert(id, module);
        Ok(())
    }

    pub fn find(&self, id: &str) -> ShellResult<Arc<dyn Module>> {
        self.modules
            .get(id)
            .cloned()
            .ok_or_else(|| ShellError::NotFound(format!("module '{id}'")))
    }

    /// Summaries of every module, sorted by id.
    pub fn list(&self) -> Vec<ModuleSummary> {
        self.modules
            .values()
            .map(|m| ModuleSummary {
                id: m.id().to_string(),
                description: m.description().to_string(),
                option_count: m.options().len(),
                required_options: m
                    .options()
                    .iter()
                    .filter(|o| o.required)
                    .map(|o| o.name.clone())
                    .collect(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("modules", &self.modules.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::CircuitSpec;
    use crate::option::{OptionSpec, ResolvedOptions};

    struct Broken {
        options: Vec<OptionSpec>,
    }

    impl Module for Broken {
        fn id(&self) -> &str {
            "broken"
        }
        fn description(&self) -> &str {
            "duplicate options"
        }
        fn options(&self) -> &[OptionSpec] {
            &self.options
        }
        fn workload(&self, _options: &ResolvedOptions) -> ShellResult<CircuitSpec> {
            Ok(CircuitSpec::new("broken", 1))
        }
    }

    #[test]
    fn test_builtins() {
        let registry = ModuleRegistry::with_builtins().unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.find("ping").unwrap().id(), "ping");
        let list = registry.list();
        assert_eq!(list[0].id, "ping");
        assert_eq!(list[1].required_options, vec!["N".to_string()]);
    }

    #[test]
    fn test_duplicate_registration_is_fatal() {
        let mut registry = ModuleRegistry::with_builtins().unwrap();
        let err = registry.register(Arc::new(Ping)).unwrap_err();
        assert!(matches!(err, ShellError::Fatal(_)));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_inconsistent_schema_is_fatal() {
        let mut registry = ModuleRegistry::new();
        let module = Broken {
            options: vec![OptionSpec::int("X"), OptionSpec::string("X")],
        };
        assert!(matches!(
            registry.register(Arc::new(module)),
            Err(ShellError::Fatal(_))
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_find_missing() {
        let registry = ModuleRegistry::new();
        assert!(matches!(registry.find("nope"), Err(ShellError::NotFound(_))));
    }
}
