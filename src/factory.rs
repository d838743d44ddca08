//! Valve factory — pluggable-type registry keyed by class identifier.
//!
//! Class names are resolved inside an isolation domain ("module"). `None`
//! selects the default module; any other name must have been defined
//! beforehand (registering into a module defines it implicitly).
//!
//! Each class may carry a zero-argument constructor, a path-aware
//! constructor, or both. When the caller supplies a resolved path the
//! path-aware constructor is preferred.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::valve::Valve;

/// Result of a valve constructor. The error string is the constructor's own
/// explanation and ends up in [`FactoryError::Instantiation`].
pub type ConstructResult = Result<Box<dyn Valve>, String>;

type DefaultCtor = Arc<dyn Fn() -> ConstructResult + Send + Sync>;
type PathCtor = Arc<dyn Fn(&Path) -> ConstructResult + Send + Sync>;

#[derive(Debug, Error)]
pub enum FactoryError {
    #[error("class '{class}' not found in module '{module}'")]
    ClassResolution { class: String, module: String },

    #[error("cannot instantiate '{class}': {reason}")]
    Instantiation { class: String, reason: String },

    #[error("isolation domain '{module}' is not defined")]
    IsolationDomain { module: String },
}

#[derive(Default, Clone)]
struct ClassEntry {
    default: Option<DefaultCtor>,
    with_path: Option<PathCtor>,
}

type ClassTable = HashMap<String, ClassEntry>;

/// Display name for the default module in errors and logs.
pub const DEFAULT_MODULE: &str = "<default>";

/// Registry of valve constructors grouped by module.
///
/// Built once at startup and shared immutably (`Arc<ValveFactory>`).
#[derive(Default)]
pub struct ValveFactory {
    default_module: ClassTable,
    modules: HashMap<String, ClassTable>,
}

impl fmt::Debug for ValveFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut modules: Vec<&String> = self.modules.keys().collect();
        modules.sort();
        f.debug_struct("ValveFactory")
            .field("default_classes", &self.default_module.len())
            .field("modules", &modules)
            .finish()
    }
}

impl ValveFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define an empty module so that it resolves even before anything is
    /// registered in it.
    pub fn define_module(&mut self, module: &str) -> &mut Self {
        self.modules.entry(module.to_string()).or_default();
        self
    }

    /// Register a zero-argument constructor for `class` in `module`.
    pub fn register<F>(&mut self, module: Option<&str>, class: &str, ctor: F) -> &mut Self
    where
        F: Fn() -> ConstructResult + Send + Sync + 'static,
    {
        self.entry(module, class).default = Some(Arc::new(ctor));
        debug!(module = module.unwrap_or(DEFAULT_MODULE), class, "valve class registered");
        self
    }

    /// Register a path-aware constructor for `class` in `module`.
    pub fn register_with_path<F>(&mut self, module: Option<&str>, class: &str, ctor: F) -> &mut Self
    where
        F: Fn(&Path) -> ConstructResult + Send + Sync + 'static,
    {
        self.entry(module, class).with_path = Some(Arc::new(ctor));
        debug!(
            module = module.unwrap_or(DEFAULT_MODULE),
            class, "path-aware valve class registered"
        );
        self
    }

    fn entry(&mut self, module: Option<&str>, class: &str) -> &mut ClassEntry {
        let table = match module {
            None => &mut self.default_module,
            Some(name) => self.modules.entry(name.to_string()).or_default(),
        };
        table.entry(class.to_string()).or_default()
    }

    fn table(&self, module: Option<&str>) -> Result<&ClassTable, FactoryError> {
        match module {
            None => Ok(&self.default_module),
            Some(name) => self.modules.get(name).ok_or_else(|| FactoryError::IsolationDomain {
                module: name.to_string(),
            }),
        }
    }

    pub fn contains(&self, module: Option<&str>, class: &str) -> bool {
        self.table(module)
            .map(|t| t.contains_key(class))
            .unwrap_or(false)
    }

    /// Sorted class names registered in `module`.
    pub fn classes(&self, module: Option<&str>) -> Result<Vec<String>, FactoryError> {
        let mut names: Vec<String> = self.table(module)?.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    /// Instantiate `class` from `module`.
    ///
    /// The returned valve is unconfigured and unregistered.
    pub fn create(
        &self,
        resolved_path: Option<&Path>,
        class: &str,
        module: Option<&str>,
    ) -> Result<Box<dyn Valve>, FactoryError> {
        let entry = self
            .table(module)?
            .get(class)
            .ok_or_else(|| FactoryError::ClassResolution {
                class: class.to_string(),
                module: module.unwrap_or(DEFAULT_MODULE).to_string(),
            })?;

        let built = match (resolved_path, &entry.with_path, &entry.default) {
            (Some(path), Some(ctor), _) => ctor(path),
            (_, _, Some(ctor)) => ctor(),
            (None, Some(_), None) => Err("constructor requires a file path".to_string()),
            (_, None, None) => Err("no usable constructor registered".to_string()),
        };

        built.map_err(|reason| FactoryError::Instantiation {
            class: class.to_string(),
            reason,
        })
    }
}
