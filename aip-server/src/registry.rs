//! Method-name-keyed registry of business handlers.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::traits::BusinessHandler;

/// Errors surfaced while assembling the handler registry.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// A handler was already mounted for the method.
    #[error("handler for method `{0}` already registered")]
    Duplicate(String),
}

/// Result alias for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Immutable-after-build map from method name to its business handler.
///
/// Built once at startup alongside the capability card; lookups at request
/// time are read-only.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<String, Arc<dyn BusinessHandler>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("methods", &self.methods().collect::<Vec<_>>())
            .finish()
    }
}

impl HandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mounts a handler for the supplied method name.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Duplicate`] when the method is already taken.
    pub fn register(
        &mut self,
        method: impl Into<String>,
        handler: Arc<dyn BusinessHandler>,
    ) -> RegistryResult<()> {
        let method = method.into();
        if self.handlers.contains_key(&method) {
            return Err(RegistryError::Duplicate(method));
        }
        self.handlers.insert(method, handler);
        Ok(())
    }

    /// Returns the handler mounted for `method`, if any.
    #[must_use]
    pub fn get(&self, method: &str) -> Option<&Arc<dyn BusinessHandler>> {
        self.handlers.get(method)
    }

    /// Iterates the mounted method names in sorted order.
    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}
