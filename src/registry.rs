//! Handler registry
//!
//! Process-wide table of named capability handlers. Subsystems publish one
//! handler each; consumers fetch by name at call time, which keeps teardown
//! and test substitution cheap and breaks dependency cycles between the
//! supervisor and the aggregator.

use dashmap::DashMap;
use std::any::Any;
use std::sync::Arc;

/// Named lookup of typed capability handlers - uses DashMap for lock-free
/// concurrent reads on the hot path.
pub struct HandlerRegistry {
    handlers: DashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }

    /// Register a handler under a name, replacing any prior registration
    pub fn register<T: Send + Sync + 'static>(&self, name: &str, handler: Arc<T>) {
        self.handlers.insert(name.to_string(), handler);
    }

    /// Fetch a handler by name, downcasting to the expected type
    pub fn get<T: Send + Sync + 'static>(&self, name: &str) -> Option<Arc<T>> {
        let entry = self.handlers.get(name)?;
        Arc::clone(&*entry).downcast::<T>().ok()
    }

    /// Remove a handler; returns whether one was registered
    pub fn deregister(&self, name: &str) -> bool {
        self.handlers.remove(name).is_some()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
