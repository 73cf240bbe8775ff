//! Ordered extension registry.

use crate::error::{EngineError, EngineResult};
use crate::extension::Extension;
use std::sync::Arc;

/// The ordered set of registered extensions.
///
/// Registration order is invocation order: hooks fire
/// first-registered-first for every mutation, deterministically.
#[derive(Default)]
pub struct ExtensionRegistry {
    extensions: Vec<Arc<dyn Extension>>,
}

impl ExtensionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an extension. Names must be unique.
    pub fn register(&mut self, extension: Arc<dyn Extension>) -> EngineResult<()> {
        if self.get(extension.name()).is_some() {
            return Err(EngineError::invalid_operation(format!(
                "extension '{}' is already registered",
                extension.name()
            )));
        }
        self.extensions.push(extension);
        Ok(())
    }

    /// Looks up an extension by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Extension>> {
        self.extensions.iter().find(|ext| ext.name() == name)
    }

    /// Iterates extensions in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Extension>> {
        self.extensions.iter()
    }

    /// Returns the number of registered extensions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.extensions.len()
    }

    /// Returns true if no extensions are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }
}

impl std::fmt::Debug for ExtensionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.extensions.iter().map(|ext| ext.name()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extension::{ExtensionReader, ExtensionState, HookContext, MutationHook};
    use crate::changeset::Fragment;

    struct Noop(String);

    struct NoopState;

    impl ExtensionState for NoopState {
        fn apply(&mut self, _fragment: &Fragment) {}
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    struct NoopHook;

    impl MutationHook for NoopHook {
        fn finish(self: Box<Self>) -> Option<Fragment> {
            None
        }
    }

    impl Extension for Noop {
        fn name(&self) -> &str {
            &self.0
        }

        fn connection_state(
            &self,
            _reader: &ExtensionReader<'_, '_>,
        ) -> EngineResult<Box<dyn ExtensionState>> {
            Ok(Box::new(NoopState))
        }

        fn hook(&self) -> Box<dyn MutationHook> {
            Box::new(NoopHook)
        }
    }

    #[test]
    fn registration_order_is_preserved() {
        let mut registry = ExtensionRegistry::new();
        registry.register(Arc::new(Noop("b".into()))).unwrap();
        registry.register(Arc::new(Noop("a".into()))).unwrap();

        let names: Vec<&str> = registry.iter().map(|ext| ext.name()).collect();
        assert_eq!(names, vec!["b", "a"]);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = ExtensionRegistry::new();
        registry.register(Arc::new(Noop("x".into()))).unwrap();
        assert!(registry.register(Arc::new(Noop("x".into()))).is_err());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn lookup_by_name() {
        let mut registry = ExtensionRegistry::new();
        assert!(registry.is_empty());
        registry.register(Arc::new(Noop("x".into()))).unwrap();
        assert!(registry.get("x").is_some());
        assert!(registry.get("y").is_none());
    }
}
