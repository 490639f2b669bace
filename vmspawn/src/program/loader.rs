//! Program resolution.

use super::{Program, ProgramDescriptor};
use crate::errors::SyscallError;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Resolves spawn descriptors into runnable programs.
#[cfg_attr(test, mockall::automock)]
pub trait ProgramLoader: Send + Sync {
    /// Resolves and validates a descriptor.
    ///
    /// Implementations fail with [`SyscallError::InvalidProgram`].
    fn resolve(&self, descriptor: &ProgramDescriptor) -> Result<Arc<dyn Program>, SyscallError>;
}

struct RegisteredProgram {
    program: Arc<dyn Program>,
    image_size: Option<u64>,
}

/// In-memory loader keyed by `(source, index)`.
#[derive(Default)]
pub struct ProgramRegistry {
    programs: RwLock<HashMap<(u64, u64), RegisteredProgram>>,
}

impl ProgramRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a program without an image size; any bounds resolve.
    pub fn register(&self, index: u64, source: u64, program: Arc<dyn Program>) {
        self.programs.write().insert(
            (source, index),
            RegisteredProgram {
                program,
                image_size: None,
            },
        );
    }

    /// Registers a program backed by an image of `image_size` bytes.
    pub fn register_image(&self, index: u64, source: u64, image_size: u64, program: Arc<dyn Program>) {
        self.programs.write().insert(
            (source, index),
            RegisteredProgram {
                program,
                image_size: Some(image_size),
            },
        );
    }

    /// Returns true if a program is registered under the descriptor's key.
    #[must_use]
    pub fn contains(&self, descriptor: &ProgramDescriptor) -> bool {
        self.programs
            .read()
            .contains_key(&(descriptor.source, descriptor.index))
    }

    /// Number of registered programs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.programs.read().len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.programs.read().is_empty()
    }
}

impl ProgramLoader for ProgramRegistry {
    fn resolve(&self, descriptor: &ProgramDescriptor) -> Result<Arc<dyn Program>, SyscallError> {
        let programs = self.programs.read();
        let entry = programs
            .get(&(descriptor.source, descriptor.index))
            .ok_or_else(|| {
                SyscallError::invalid_program(descriptor.index, descriptor.source, "no program registered")
            })?;
        if let Some(image_size) = entry.image_size {
            descriptor
                .bounds
                .within(image_size)
                .map_err(|reason| SyscallError::invalid_program(descriptor.index, descriptor.source, reason))?;
        }
        Ok(Arc::clone(&entry.program))
    }
}

impl std::fmt::Debug for ProgramRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgramRegistry")
            .field("programs", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::Bounds;
    use crate::testing::FnProgram;

    fn exit_with(code: i8) -> Arc<dyn Program> {
        Arc::new(FnProgram::new(move |_ctx, _argv| async move { Ok(code) }))
    }

    #[test]
    fn test_resolve_registered() {
        let registry = ProgramRegistry::new();
        registry.register(0, 3, exit_with(0));

        assert!(registry.resolve(&ProgramDescriptor::new(0, 3)).is_ok());
        assert!(registry.contains(&ProgramDescriptor::new(0, 3)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_resolve_missing() {
        let registry = ProgramRegistry::new();
        registry.register(0, 3, exit_with(0));

        let err = registry
            .resolve(&ProgramDescriptor::new(1, 3))
            .err()
            .unwrap();
        assert_eq!(err.kind(), "invalid_program");
    }

    #[test]
    fn test_resolve_checks_bounds() {
        let registry = ProgramRegistry::new();
        registry.register_image(0, 3, 128, exit_with(0));

        let inside = ProgramDescriptor::new(0, 3).with_bounds(Bounds::new(64, 64));
        let outside = ProgramDescriptor::new(0, 3).with_bounds(Bounds::new(100, 64));
        assert!(registry.resolve(&inside).is_ok());
        assert!(registry.resolve(&outside).is_err());
    }
}
