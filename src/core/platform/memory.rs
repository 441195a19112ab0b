// In-process device registry with allocation accounting and fault injection.
use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;

use super::{DYNAMIC_MAJORS, Platform, PlatformError};
use crate::core::identity::{BindingId, ClassId, Identity, SetupStep};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct PlatformStats {
    pub allocated: usize,
    pub released: usize,
    pub double_frees: usize,
}

impl PlatformStats {
    pub fn live(&self) -> usize {
        self.allocated.saturating_sub(self.released)
    }
}

pub struct MemoryPlatform {
    majors: RangeInclusive<u32>,
    inner: Mutex<Registry>,
}

#[derive(Default)]
struct Registry {
    regions: BTreeMap<Identity, String>,
    classes: BTreeMap<ClassId, String>,
    bindings: BTreeMap<BindingId, Identity>,
    nodes: BTreeMap<Identity, (ClassId, String)>,
    next_id: u64,
    fail_at: Option<SetupStep>,
    stats: PlatformStats,
    journal: Vec<&'static str>,
}

impl Registry {
    fn check_fault(&self, step: SetupStep) -> Result<(), PlatformError> {
        if self.fail_at == Some(step) {
            return Err(PlatformError::Injected(step));
        }
        Ok(())
    }

    fn allocated(&mut self, op: &'static str) {
        self.stats.allocated += 1;
        self.journal.push(op);
    }

    fn released(&mut self, op: &'static str, present: bool) {
        if present {
            self.stats.released += 1;
            self.journal.push(op);
        } else {
            tracing::debug!(op, "release of absent resource skipped");
            self.stats.double_frees += 1;
        }
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

impl Default for MemoryPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPlatform {
    pub fn new() -> Self {
        Self::with_majors(DYNAMIC_MAJORS)
    }

    pub fn with_majors(majors: RangeInclusive<u32>) -> Self {
        Self {
            majors,
            inner: Mutex::new(Registry::default()),
        }
    }

    /// Makes every later attempt at `step` fail until cleared.
    pub fn fail_at(&self, step: SetupStep) {
        self.registry().fail_at = Some(step);
    }

    pub fn clear_faults(&self) {
        self.registry().fail_at = None;
    }

    pub fn stats(&self) -> PlatformStats {
        self.registry().stats
    }

    /// Names of successful allocations and releases, oldest first.
    pub fn journal(&self) -> Vec<&'static str> {
        self.registry().journal.clone()
    }

    pub fn node_name(&self, identity: Identity) -> Option<String> {
        self.registry()
            .nodes
            .get(&identity)
            .map(|(_, name)| name.clone())
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Platform for MemoryPlatform {
    fn alloc_region(&self, name: &str, minor_base: u32) -> Result<Identity, PlatformError> {
        let mut registry = self.registry();
        registry.check_fault(SetupStep::Region)?;
        let major = self
            .majors
            .clone()
            .rev()
            .find(|major| !registry.regions.keys().any(|used| used.major == *major))
            .ok_or(PlatformError::Exhausted)?;
        let identity = Identity::new(major, minor_base);
        registry.regions.insert(identity, name.to_string());
        registry.allocated(SetupStep::Region.as_str());
        Ok(identity)
    }

    fn create_class(&self, name: &str) -> Result<ClassId, PlatformError> {
        let mut registry = self.registry();
        registry.check_fault(SetupStep::Class)?;
        if registry.classes.values().any(|existing| existing == name) {
            return Err(PlatformError::AlreadyExists(name.to_string()));
        }
        let class = ClassId(registry.next_id());
        registry.classes.insert(class, name.to_string());
        registry.allocated(SetupStep::Class.as_str());
        Ok(class)
    }

    fn add_binding(&self, identity: Identity) -> Result<BindingId, PlatformError> {
        let mut registry = self.registry();
        registry.check_fault(SetupStep::Binding)?;
        if registry.bindings.values().any(|bound| *bound == identity) {
            return Err(PlatformError::AlreadyExists(identity.to_string()));
        }
        let binding = BindingId(registry.next_id());
        registry.bindings.insert(binding, identity);
        registry.allocated(SetupStep::Binding.as_str());
        Ok(binding)
    }

    fn create_node(
        &self,
        class: ClassId,
        identity: Identity,
        name: &str,
    ) -> Result<(), PlatformError> {
        let mut registry = self.registry();
        registry.check_fault(SetupStep::Node)?;
        let taken = registry.nodes.contains_key(&identity)
            || registry.nodes.values().any(|(_, existing)| existing == name);
        if taken {
            return Err(PlatformError::AlreadyExists(name.to_string()));
        }
        registry.nodes.insert(identity, (class, name.to_string()));
        registry.allocated(SetupStep::Node.as_str());
        Ok(())
    }

    fn lookup_binding(&self, identity: Identity) -> Option<BindingId> {
        self.registry()
            .bindings
            .iter()
            .find(|(_, bound)| **bound == identity)
            .map(|(binding, _)| *binding)
    }

    fn destroy_node(&self, class: ClassId, identity: Identity) {
        let mut registry = self.registry();
        let present = matches!(registry.nodes.get(&identity), Some((owner, _)) if *owner == class);
        if present {
            registry.nodes.remove(&identity);
        }
        registry.released("destroy_node", present);
    }

    fn del_binding(&self, binding: BindingId) {
        let mut registry = self.registry();
        let present = registry.bindings.remove(&binding).is_some();
        registry.released("del_binding", present);
    }

    fn destroy_class(&self, class: ClassId) {
        let mut registry = self.registry();
        let present = registry.classes.remove(&class).is_some();
        registry.released("destroy_class", present);
    }

    fn free_region(&self, identity: Identity) {
        let mut registry = self.registry();
        let present = registry.regions.remove(&identity).is_some();
        registry.released("free_region", present);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn majors_are_allocated_from_the_top() {
        let platform = MemoryPlatform::new();
        let first = platform.alloc_region("a", 0).expect("first");
        let second = platform.alloc_region("b", 0).expect("second");
        assert_eq!(first, Identity::new(254, 0));
        assert_eq!(second, Identity::new(253, 0));

        platform.free_region(first);
        let third = platform.alloc_region("c", 4).expect("reuse");
        assert_eq!(third, Identity::new(254, 4));
    }

    #[test]
    fn exhausted_majors_fail() {
        let platform = MemoryPlatform::with_majors(240..=240);
        platform.alloc_region("a", 0).expect("first");
        let err = platform.alloc_region("b", 0).expect_err("exhausted");
        assert!(matches!(err, PlatformError::Exhausted));
        assert_eq!(platform.stats().allocated, 1);
    }

    #[test]
    fn duplicate_class_and_node_names_are_rejected() {
        let platform = MemoryPlatform::new();
        let class = platform.create_class("dummy_class").expect("class");
        let err = platform.create_class("dummy_class").expect_err("dup class");
        assert!(matches!(err, PlatformError::AlreadyExists(_)));

        let a = platform.alloc_region("a", 0).expect("a");
        let b = platform.alloc_region("b", 0).expect("b");
        platform.create_node(class, a, "customdevice").expect("node");
        let err = platform
            .create_node(class, b, "customdevice")
            .expect_err("dup node");
        assert!(matches!(err, PlatformError::AlreadyExists(_)));
        assert_eq!(platform.node_name(a).as_deref(), Some("customdevice"));
    }

    #[test]
    fn injected_fault_allocates_nothing() {
        let platform = MemoryPlatform::new();
        platform.fail_at(SetupStep::Binding);
        let identity = platform.alloc_region("a", 0).expect("region");
        let err = platform.add_binding(identity).expect_err("fault");
        assert!(matches!(err, PlatformError::Injected(SetupStep::Binding)));
        assert_eq!(platform.lookup_binding(identity), None);

        platform.clear_faults();
        let binding = platform.add_binding(identity).expect("binding");
        assert_eq!(platform.lookup_binding(identity), Some(binding));
    }

    #[test]
    fn absent_releases_are_counted_not_applied() {
        let platform = MemoryPlatform::new();
        let identity = platform.alloc_region("a", 0).expect("region");
        platform.free_region(identity);
        platform.free_region(identity);
        platform.del_binding(BindingId(99));

        let stats = platform.stats();
        assert_eq!(stats.allocated, 1);
        assert_eq!(stats.released, 1);
        assert_eq!(stats.double_frees, 2);
        assert_eq!(stats.live(), 0);
        assert_eq!(platform.journal(), vec!["alloc_region", "free_region"]);
    }
}
