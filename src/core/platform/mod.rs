//! Purpose: Define the registration seam between a gate and the host device registry.
//! Exports: `Platform`, `PlatformError`, `MemoryPlatform`, `PlatformStats`, `FsPlatform`, `DYNAMIC_MAJORS`.
//! Role: Each registration step has a fallible constructor and an infallible inverse.
//! Invariants: Inverses tolerate absent resources; they never fail and never block.
//! Invariants: A failed constructor leaves nothing allocated for that step.
use std::fmt;
use std::io;
use std::ops::RangeInclusive;
use std::sync::Arc;

use crate::core::identity::{BindingId, ClassId, Identity, SetupStep};

mod fs;
mod memory;

pub use fs::FsPlatform;
pub use memory::{MemoryPlatform, PlatformStats};

/// Majors handed out dynamically, searched from the top down.
pub const DYNAMIC_MAJORS: RangeInclusive<u32> = 234..=254;

#[derive(Debug)]
pub enum PlatformError {
    Exhausted,
    AlreadyExists(String),
    Injected(SetupStep),
    Io(io::Error),
}

impl fmt::Display for PlatformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlatformError::Exhausted => f.write_str("no free device number"),
            PlatformError::AlreadyExists(name) => write!(f, "`{name}` is already registered"),
            PlatformError::Injected(step) => write!(f, "injected failure at {step}"),
            PlatformError::Io(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for PlatformError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PlatformError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for PlatformError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::AlreadyExists {
            return PlatformError::AlreadyExists(err.to_string());
        }
        PlatformError::Io(err)
    }
}

pub trait Platform: Send + Sync {
    fn alloc_region(&self, name: &str, minor_base: u32) -> Result<Identity, PlatformError>;
    fn create_class(&self, name: &str) -> Result<ClassId, PlatformError>;
    fn add_binding(&self, identity: Identity) -> Result<BindingId, PlatformError>;
    fn create_node(
        &self,
        class: ClassId,
        identity: Identity,
        name: &str,
    ) -> Result<(), PlatformError>;

    /// Resolves the binding an open of `identity` would be routed through.
    fn lookup_binding(&self, identity: Identity) -> Option<BindingId>;

    fn destroy_node(&self, class: ClassId, identity: Identity);
    fn del_binding(&self, binding: BindingId);
    fn destroy_class(&self, class: ClassId);
    fn free_region(&self, identity: Identity);
}

impl<T: Platform + ?Sized> Platform for Arc<T> {
    fn alloc_region(&self, name: &str, minor_base: u32) -> Result<Identity, PlatformError> {
        (**self).alloc_region(name, minor_base)
    }

    fn create_class(&self, name: &str) -> Result<ClassId, PlatformError> {
        (**self).create_class(name)
    }

    fn add_binding(&self, identity: Identity) -> Result<BindingId, PlatformError> {
        (**self).add_binding(identity)
    }

    fn create_node(
        &self,
        class: ClassId,
        identity: Identity,
        name: &str,
    ) -> Result<(), PlatformError> {
        (**self).create_node(class, identity, name)
    }

    fn lookup_binding(&self, identity: Identity) -> Option<BindingId> {
        (**self).lookup_binding(identity)
    }

    fn destroy_node(&self, class: ClassId, identity: Identity) {
        (**self).destroy_node(class, identity)
    }

    fn del_binding(&self, binding: BindingId) {
        (**self).del_binding(binding)
    }

    fn destroy_class(&self, class: ClassId) {
        (**self).destroy_class(class)
    }

    fn free_region(&self, identity: Identity) {
        (**self).free_region(identity)
    }
}
