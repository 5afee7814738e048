//! Process-wide operation type registry.
//!
//! The registry maps type names to start functions plus the permissions a
//! terminal must hold before a remote OpStart of that type is accepted. It
//! is built during startup, installed once and immutable afterwards, so the
//! dispatcher's hot path reads it without locking.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use crate::error::{Error, Result};
use crate::op::RemoteOpContext;
use crate::permission::Permissions;

/// Start function invoked for a remote OpStart.
///
/// The function validates the init data and spawns the operation's worker;
/// returning an error makes the terminal reply with OpEnd carrying it.
pub type StartFn = Arc<dyn Fn(RemoteOpContext) -> Result<()> + Send + Sync>;

/// A registered operation type.
pub struct OpSpec {
    /// Permissions the hosting terminal must have been granted.
    pub requires: Permissions,
    /// Start function for remote OpStarts.
    pub start: StartFn,
}

/// Immutable name → spec table.
#[derive(Default)]
pub struct OpRegistry {
    entries: HashMap<String, OpSpec>,
}

impl OpRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in operation types.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(
            super::counter::COUNTER_OP,
            Permissions::NONE,
            Arc::new(super::counter::start_remote),
        );
        registry.register(
            super::latency::LATENCY_OP,
            Permissions::IS_CRANE_CONTROLLER,
            Arc::new(super::latency::start_remote),
        );
        registry.register(
            super::capacity::CAPACITY_OP,
            Permissions::IS_CRANE_CONTROLLER,
            Arc::new(super::capacity::start_remote),
        );
        registry.register(
            super::authorize::AUTHORIZE_OP,
            Permissions::NONE,
            Arc::new(super::authorize::start_remote),
        );
        registry
    }

    /// Add an operation type. Later registrations replace earlier ones,
    /// which only matters before the registry is installed.
    pub fn register(&mut self, name: &str, requires: Permissions, start: StartFn) {
        self.entries.insert(name.to_string(), OpSpec { requires, start });
    }

    /// Look up a type by its wire name.
    pub fn lookup(&self, name: &str) -> Option<&OpSpec> {
        self.entries.get(name)
    }

    /// Whether a type name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }
}

static REGISTRY: OnceLock<OpRegistry> = OnceLock::new();

/// Install the process-wide registry. Fails if one is already active.
pub fn install(registry: OpRegistry) -> Result<()> {
    REGISTRY
        .set(registry)
        .map_err(|_| Error::Internal("op registry already installed".into()))
}

/// The active registry; defaults to [`OpRegistry::builtin`] when nothing
/// was installed explicitly.
pub fn active() -> &'static OpRegistry {
    REGISTRY.get_or_init(OpRegistry::builtin)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_entries() {
        let registry = OpRegistry::builtin();
        assert!(registry.contains("counter"));
        assert!(registry.contains("latency"));
        assert!(registry.contains("capacity"));
        assert!(registry.contains("authorize"));
        assert!(!registry.contains("bogus"));

        let latency = registry.lookup("latency").unwrap();
        assert_eq!(latency.requires, Permissions::IS_CRANE_CONTROLLER);
        let counter = registry.lookup("counter").unwrap();
        assert!(counter.requires.is_empty());
    }
}
