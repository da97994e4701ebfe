use std::collections::HashMap;
use std::sync::Arc;

use crate::error::EngineError;
use crate::runner::Runner;

/// Immutable name → runner table consulted for every job.
///
/// Built once through [`RegistryBuilder`]; there is no way to add entries
/// afterwards, so lookups need no locking.
#[derive(Clone, Default)]
pub struct Registry {
    runners: Arc<HashMap<String, Arc<dyn Runner>>>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Exact-match lookup by function name.
    pub fn lookup(&self, name: &str) -> Option<&Arc<dyn Runner>> {
        self.runners.get(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.runners.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.runners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runners.is_empty()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("functions", &self.names())
            .finish()
    }
}

#[derive(Default)]
pub struct RegistryBuilder {
    entries: Vec<(String, Arc<dyn Runner>)>,
}

impl RegistryBuilder {
    pub fn register(mut self, name: impl Into<String>, runner: impl Runner + 'static) -> Self {
        self.entries.push((name.into(), Arc::new(runner)));
        self
    }

    pub fn register_arc(mut self, name: impl Into<String>, runner: Arc<dyn Runner>) -> Self {
        self.entries.push((name.into(), runner));
        self
    }

    /// Freeze the table. Registering the same name twice is rejected.
    pub fn build(self) -> Result<Registry, EngineError> {
        let mut runners = HashMap::with_capacity(self.entries.len());
        for (name, runner) in self.entries {
            if runners.contains_key(&name) {
                return Err(EngineError::DuplicateFunction(name));
            }
            tracing::debug!(
                function = %name,
                input = runner.input_type(),
                output = runner.output_type(),
                "Function registered"
            );
            runners.insert(name, runner);
        }
        Ok(Registry {
            runners: Arc::new(runners),
        })
    }
}
