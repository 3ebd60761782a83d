use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use serde_json::{Map, Value};

use crate::descriptor::Descriptor;

pub type ModuleParameters = Map<String, Value>;

/// Executable behaviour bound to a step type.
///
/// Instances are constructed fresh for every step and dropped once the step
/// completes. Construction must not touch the filesystem beyond reads, since
/// `--dry-run` constructs every module without running it.
pub trait Module {
    fn name(&self) -> &str;

    /// False when the inputs this module needs are not available yet.
    fn ready(&self) -> bool;

    /// Paths `run` is expected to write. Fixed at construction.
    fn output_files(&self) -> &[PathBuf];

    fn run(&self) -> Result<()>;
}

type ModuleConstructor = Arc<dyn Fn(ModuleParameters) -> Result<Box<dyn Module>> + Send + Sync>;

pub struct ModuleRegistry {
    factories: HashMap<String, ModuleConstructor>,
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F)
    where
        F: Fn(ModuleParameters) -> Result<Box<dyn Module>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(constructor));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn create(&self, descriptor: &Descriptor) -> Result<Box<dyn Module>> {
        let factory = self.factories.get(&descriptor.module).ok_or_else(|| {
            anyhow!(
                "Unknown module '{}'. Available modules: {}",
                descriptor.module,
                self.known_modules().join(", ")
            )
        })?;
        factory(descriptor.parameters.clone())
    }

    pub fn known_modules(&self) -> Vec<String> {
        let mut names: Vec<_> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}
