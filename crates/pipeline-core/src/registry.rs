//! Worker registry: type name to worker factory lookup

use crate::error::RegistryError;
use crate::worker::Worker;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Builds a fresh, uninitialized worker instance
pub type WorkerFactory = Arc<dyn Fn() -> Box<dyn Worker> + Send + Sync>;

/// Registry mapping worker type names to factories
///
/// Short names (`ComputeFrameStats`) live in the built-in table. Names that
/// look like paths (`my_crate::stages::Detector` or `my_crate.stages.Detector`)
/// are looked up among factories registered under their qualified path.
#[derive(Clone, Default)]
pub struct Registry {
    /// Built-in workers by short type name
    builtin: HashMap<String, WorkerFactory>,

    /// Workers by fully qualified path, `::`-separated
    qualified: HashMap<String, WorkerFactory>,
}

impl Registry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self {
            builtin: HashMap::with_capacity(16),
            qualified: HashMap::with_capacity(16),
        }
    }

    /// Register a worker under a short type name
    pub fn register<F>(&mut self, type_name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn Worker> + Send + Sync + 'static,
    {
        let type_name = type_name.into();
        debug!("Registering worker type: {}", type_name);
        self.builtin.insert(type_name, Arc::new(factory));
    }

    /// Register a worker under a fully qualified path
    pub fn register_qualified<F>(&mut self, path: &str, factory: F)
    where
        F: Fn() -> Box<dyn Worker> + Send + Sync + 'static,
    {
        let path = normalize_path(path);
        debug!("Registering qualified worker type: {}", path);
        self.qualified.insert(path, Arc::new(factory));
    }

    /// Register a worker under both its short name and a qualified path
    pub fn register_with_path<F>(&mut self, type_name: &str, path: &str, factory: F)
    where
        F: Fn() -> Box<dyn Worker> + Send + Sync + 'static,
    {
        let factory: WorkerFactory = Arc::new(factory);
        self.builtin
            .insert(type_name.to_string(), Arc::clone(&factory));
        self.qualified.insert(normalize_path(path), factory);
    }

    /// Resolve a type name to its factory
    pub fn resolve(&self, type_name: &str) -> Result<WorkerFactory, RegistryError> {
        if let Some(factory) = self.builtin.get(type_name) {
            return Ok(Arc::clone(factory));
        }
        if is_qualified(type_name) {
            if let Some(factory) = self.qualified.get(&normalize_path(type_name)) {
                return Ok(Arc::clone(factory));
            }
        }
        Err(RegistryError::UnknownWorkerType(type_name.to_string()))
    }

    #[must_use]
    pub fn contains(&self, type_name: &str) -> bool {
        self.resolve(type_name).is_ok()
    }

    /// Built-in type names, sorted
    #[must_use]
    pub fn type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.builtin.keys().cloned().collect();
        names.sort();
        names
    }

    /// Qualified paths, sorted
    #[must_use]
    pub fn qualified_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.qualified.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("builtin", &self.type_names())
            .field("qualified", &self.qualified_names())
            .finish()
    }
}

fn is_qualified(type_name: &str) -> bool {
    type_name.contains("::") || type_name.contains('.')
}

fn normalize_path(path: &str) -> String {
    path.replace('.', "::")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Params;
    use crate::context::WorkerContext;
    use crate::error::WorkerError;
    use crate::queue::Outputs;
    use frame_pipeline_common::Item;

    struct Noop;

    impl Worker for Noop {
        fn initialize(&mut self, _ctx: &WorkerContext, _params: &Params) -> Result<(), WorkerError> {
            Ok(())
        }

        fn run(&mut self, _item: Option<Item>, _out: &Outputs) -> Result<(), WorkerError> {
            Ok(())
        }
    }

    #[test]
    fn test_builtin_lookup() {
        let mut registry = Registry::new();
        registry.register("Noop", || Box::new(Noop));

        assert!(registry.resolve("Noop").is_ok());
        assert!(matches!(
            registry.resolve("Missing"),
            Err(RegistryError::UnknownWorkerType(ref name)) if name == "Missing"
        ));
    }

    #[test]
    fn test_qualified_fallback() {
        let mut registry = Registry::new();
        registry.register_qualified("my_stages.detect.Noop", || Box::new(Noop));

        assert!(registry.contains("my_stages::detect::Noop"));
        assert!(registry.contains("my_stages.detect.Noop"));
        // Short names never reach the qualified table
        assert!(!registry.contains("Noop"));
    }

    #[test]
    fn test_type_names_sorted() {
        let mut registry = Registry::new();
        registry.register_with_path("Zeta", "stages::zeta::Zeta", || Box::new(Noop));
        registry.register("Alpha", || Box::new(Noop));

        assert_eq!(registry.type_names(), vec!["Alpha", "Zeta"]);
        assert!(registry.contains("stages::zeta::Zeta"));
    }
}
