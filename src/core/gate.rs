//! Purpose: Exclusive-open gate for a single registered device.
//! Exports: `Gate`, `GateConfig`, `GateState`, `GateStatus`, `INTERRUPT_POLL`.
//! Role: Runs staged registration, the interruptible open protocol, and teardown.
//! Invariants: At most one session holds the device; the held flag changes only under `state`.
//! Invariants: Identity mismatch and interruption leave the held flag untouched.
//! Invariants: Commands never read or write the held flag.
//! Invariants: Teardown frees a held device without waiting and unwinds registration newest-first.
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;

use crate::core::caller::Caller;
use crate::core::error::{Error, ErrorKind};
use crate::core::identity::{BindingId, Identity, NodeRef, SetupStep};
use crate::core::interrupt::Interrupt;
use crate::core::platform::{Platform, PlatformError};
use crate::core::teardown::{Acquired, Acquisitions};

/// How often a blocked open re-checks its interrupt flag.
pub const INTERRUPT_POLL: Duration = Duration::from_millis(10);

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GateConfig {
    pub name: String,
    pub class: String,
    pub minor_base: u32,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            name: "customdevice".to_string(),
            class: "dummy_class".to_string(),
            minor_base: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateState {
    Uninitialized,
    Idle,
    Locked,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct GateStatus {
    pub state: GateState,
    pub identity: Option<Identity>,
}

impl GateStatus {
    pub fn is_registered(&self) -> bool {
        self.state != GateState::Uninitialized
    }

    pub fn is_locked(&self) -> bool {
        self.state == GateState::Locked
    }
}

struct Registration {
    identity: Identity,
    binding: BindingId,
    acquired: Acquisitions,
}

#[derive(Default)]
struct ResourceState {
    registration: Option<Registration>,
    held: bool,
}

pub struct Gate<P: Platform> {
    config: GateConfig,
    platform: P,
    state: Mutex<ResourceState>,
    freed: Condvar,
}

impl<P: Platform> Gate<P> {
    pub fn new(platform: P, config: GateConfig) -> Self {
        Self {
            config,
            platform,
            state: Mutex::new(ResourceState::default()),
            freed: Condvar::new(),
        }
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn status(&self) -> GateStatus {
        let state = self.resource();
        let identity = state.registration.as_ref().map(|reg| reg.identity);
        let state = match (&state.registration, state.held) {
            (None, _) => GateState::Uninitialized,
            (Some(_), false) => GateState::Idle,
            (Some(_), true) => GateState::Locked,
        };
        GateStatus { state, identity }
    }

    /// The node reference a caller opening this device would present.
    pub fn node(&self) -> Option<NodeRef> {
        self.resource().registration.as_ref().map(|reg| NodeRef {
            identity: reg.identity,
            binding: reg.binding,
        })
    }

    pub fn initialize(&self) -> Result<Identity, Error> {
        let mut state = self.resource();
        if let Some(registration) = &state.registration {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("device is already registered")
                .with_identity(registration.identity));
        }

        let mut acquired = Acquisitions::default();
        let (identity, binding) = match self.register(&mut acquired) {
            Ok(registered) => registered,
            Err(err) => {
                tracing::warn!(
                    device = %self.config.name,
                    error = %err,
                    resources = acquired.len(),
                    "registration failed; rolling back"
                );
                acquired.unwind(&self.platform);
                return Err(err);
            }
        };

        state.held = false;
        state.registration = Some(Registration {
            identity,
            binding,
            acquired,
        });
        tracing::info!(
            device = %self.config.name,
            major = identity.major,
            minor = identity.minor,
            "device registered"
        );
        Ok(identity)
    }

    fn register(&self, acquired: &mut Acquisitions) -> Result<(Identity, BindingId), Error> {
        let name = self.config.name.as_str();

        let identity = self
            .platform
            .alloc_region(name, self.config.minor_base)
            .map_err(|err| registration_error(SetupStep::Region, err))?;
        acquired.push(Acquired::Region(identity));

        let class = self
            .platform
            .create_class(&self.config.class)
            .map_err(|err| registration_error(SetupStep::Class, err).with_identity(identity))?;
        acquired.push(Acquired::Class(class));

        let binding = self
            .platform
            .add_binding(identity)
            .map_err(|err| registration_error(SetupStep::Binding, err).with_identity(identity))?;
        acquired.push(Acquired::Binding(binding));

        self.platform
            .create_node(class, identity, name)
            .map_err(|err| registration_error(SetupStep::Node, err).with_identity(identity))?;
        acquired.push(Acquired::Node { class, identity });

        Ok((identity, binding))
    }

    /// Blocks until the device is free, then marks it held by `caller`.
    ///
    /// A free device is taken even if `interrupt` is already raised; the flag
    /// only aborts an actual wait.
    pub fn acquire(
        &self,
        node: &NodeRef,
        caller: &Caller,
        interrupt: &Interrupt,
    ) -> Result<(), Error> {
        let mut state = self.resource();
        check_node(&state, node, "open")?;

        while state.held {
            if interrupt.is_raised() {
                tracing::warn!(
                    device = %self.config.name,
                    comm = %caller.comm,
                    pid = caller.pid,
                    "open interrupted while waiting"
                );
                return Err(Error::new(ErrorKind::Interrupted)
                    .with_message("interrupted while waiting for device")
                    .with_identity(node.identity));
            }
            state = self
                .freed
                .wait_timeout(state, INTERRUPT_POLL)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
            check_node(&state, node, "open")?;
        }

        state.held = true;
        tracing::info!(
            device = %self.config.name,
            comm = %caller.comm,
            pid = caller.pid,
            "device opened"
        );
        Ok(())
    }

    /// Frees the device if held. Releasing an idle device is a no-op.
    pub fn release(&self, node: &NodeRef) -> Result<(), Error> {
        let mut state = self.resource();
        check_node(&state, node, "release")?;

        if state.held {
            state.held = false;
            self.freed.notify_one();
            tracing::info!(device = %self.config.name, "device released");
        } else {
            tracing::debug!(device = %self.config.name, "release of idle device ignored");
        }
        Ok(())
    }

    /// Accepts any command from any caller; `arg` is ignored and the result is always 0.
    pub fn command(&self, caller: &Caller, code: u32, _arg: u64) -> i64 {
        tracing::info!(
            device = %self.config.name,
            comm = %caller.comm,
            pid = caller.pid,
            code,
            "command issued"
        );
        0
    }

    pub fn teardown(&self) {
        let mut state = self.resource();
        let Some(mut registration) = state.registration.take() else {
            tracing::debug!(device = %self.config.name, "teardown of unregistered device skipped");
            return;
        };

        if state.held {
            tracing::warn!(device = %self.config.name, "forcing release of held device");
            state.held = false;
        }
        self.freed.notify_all();

        registration.acquired.unwind(&self.platform);
        tracing::info!(
            device = %self.config.name,
            major = registration.identity.major,
            minor = registration.identity.minor,
            "device unregistered"
        );
    }

    fn resource(&self) -> MutexGuard<'_, ResourceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<P: Platform> Drop for Gate<P> {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn check_node(state: &ResourceState, node: &NodeRef, op: &str) -> Result<(), Error> {
    let not_found = |message: String| {
        Err(Error::new(ErrorKind::NotFound)
            .with_message(message)
            .with_identity(node.identity))
    };
    match &state.registration {
        Some(reg) if reg.identity == node.identity && reg.binding == node.binding => Ok(()),
        Some(reg) if reg.identity == node.identity => {
            not_found(format!("cannot {op} device: node is bound elsewhere"))
        }
        _ => not_found(format!("cannot {op} device: device doesn't exist")),
    }
}

fn registration_error(step: SetupStep, err: PlatformError) -> Error {
    Error::new(ErrorKind::Registration)
        .with_message(format!("{step} failed"))
        .with_step(step)
        .with_source(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::identity::BindingId;
    use crate::core::platform::{MemoryPlatform, PlatformStats};
    use std::sync::Arc;

    fn registered() -> Gate<MemoryPlatform> {
        let gate = Gate::new(MemoryPlatform::new(), GateConfig::default());
        gate.initialize().expect("initialize");
        gate
    }

    fn caller() -> Caller {
        Caller::new("gate-test", 42)
    }

    #[test]
    fn initialize_then_teardown_releases_everything_once() {
        let gate = registered();
        let status = gate.status();
        assert_eq!(status.state, GateState::Idle);
        assert_eq!(status.identity, Some(Identity::new(254, 0)));
        assert_eq!(gate.platform().stats().live(), 4);

        gate.teardown();
        assert_eq!(gate.status().state, GateState::Uninitialized);
        assert_eq!(gate.status().identity, None);

        let stats = gate.platform().stats();
        assert_eq!(stats.allocated, 4);
        assert_eq!(stats.released, 4);
        assert_eq!(stats.double_frees, 0);
        assert_eq!(
            gate.platform().journal(),
            vec![
                "alloc_region",
                "create_class",
                "add_binding",
                "create_node",
                "destroy_node",
                "del_binding",
                "destroy_class",
                "free_region",
            ]
        );
    }

    #[test]
    fn second_initialize_is_rejected_without_allocating() {
        let gate = registered();
        let err = gate.initialize().expect_err("already registered");
        assert_eq!(err.kind(), ErrorKind::Usage);
        assert_eq!(gate.platform().stats().allocated, 4);
    }

    #[test]
    fn failure_at_class_step_rolls_back_only_the_region() {
        let platform = MemoryPlatform::new();
        platform.fail_at(SetupStep::Class);
        let gate = Gate::new(platform, GateConfig::default());

        let err = gate.initialize().expect_err("class fails");
        assert_eq!(err.kind(), ErrorKind::Registration);
        assert_eq!(err.step(), Some(SetupStep::Class));
        assert_eq!(gate.platform().journal(), vec!["alloc_region", "free_region"]);
        assert_eq!(gate.status().state, GateState::Uninitialized);
    }

    #[test]
    fn failure_at_each_step_leaves_nothing_allocated() {
        for (index, step) in SetupStep::ALL.into_iter().enumerate() {
            let platform = MemoryPlatform::new();
            platform.fail_at(step);
            let gate = Gate::new(platform, GateConfig::default());

            let err = gate.initialize().expect_err("injected");
            assert_eq!(err.step(), Some(step));

            let stats = gate.platform().stats();
            assert_eq!(stats.allocated, index, "allocated before {step}");
            assert_eq!(stats.released, index, "released after {step}");
            assert_eq!(stats.double_frees, 0);
            assert!(gate.node().is_none());
        }
    }

    #[test]
    fn failed_initialize_can_be_retried() {
        let gate = Gate::new(MemoryPlatform::new(), GateConfig::default());
        gate.platform().fail_at(SetupStep::Node);
        gate.initialize().expect_err("node fails");

        gate.platform().clear_faults();
        let identity = gate.initialize().expect("retry");
        assert_eq!(gate.status().identity, Some(identity));
    }

    #[test]
    fn mismatched_identity_changes_nothing() {
        let gate = registered();
        let node = gate.node().expect("node");
        let wrong = [
            NodeRef {
                identity: Identity::new(node.identity.major - 1, node.identity.minor),
                binding: node.binding,
            },
            NodeRef {
                identity: Identity::new(node.identity.major, node.identity.minor + 1),
                binding: node.binding,
            },
            NodeRef {
                identity: node.identity,
                binding: BindingId(node.binding.0 + 100),
            },
        ];

        for held in [false, true] {
            if held {
                gate.acquire(&node, &caller(), &Interrupt::new()).expect("acquire");
            }
            for bad in &wrong {
                let before = gate.status();
                let err = gate
                    .acquire(bad, &caller(), &Interrupt::new())
                    .expect_err("acquire mismatch");
                assert_eq!(err.kind(), ErrorKind::NotFound);
                let err = gate.release(bad).expect_err("release mismatch");
                assert_eq!(err.kind(), ErrorKind::NotFound);
                assert_eq!(gate.status(), before);
            }
        }
    }

    #[test]
    fn release_is_idempotent() {
        let gate = registered();
        let node = gate.node().expect("node");

        gate.release(&node).expect("release idle");
        gate.acquire(&node, &caller(), &Interrupt::new()).expect("acquire");
        gate.release(&node).expect("release");
        gate.release(&node).expect("double release");
        assert_eq!(gate.status().state, GateState::Idle);

        gate.acquire(&node, &caller(), &Interrupt::new()).expect("reacquire");
        assert_eq!(gate.status().state, GateState::Locked);
    }

    #[test]
    fn command_ignores_the_lock() {
        let gate = registered();
        let node = gate.node().expect("node");

        let idle = gate.status();
        assert_eq!(gate.command(&caller(), 0, 0), 0);
        assert_eq!(gate.status(), idle);

        gate.acquire(&node, &caller(), &Interrupt::new()).expect("acquire");
        let locked = gate.status();
        assert_eq!(gate.command(&Caller::new("other", 7), 0x5401, u64::MAX), 0);
        assert_eq!(gate.status(), locked);
    }

    #[test]
    fn raised_interrupt_does_not_block_a_free_device() {
        let gate = registered();
        let node = gate.node().expect("node");
        let interrupt = Interrupt::new();
        interrupt.raise();

        gate.acquire(&node, &caller(), &interrupt).expect("free device");
        let err = gate
            .acquire(&node, &caller(), &interrupt)
            .expect_err("held device");
        assert_eq!(err.kind(), ErrorKind::Interrupted);
        assert_eq!(gate.status().state, GateState::Locked);
    }

    #[test]
    fn teardown_frees_a_held_device() {
        let gate = registered();
        let node = gate.node().expect("node");
        gate.acquire(&node, &caller(), &Interrupt::new()).expect("acquire");

        gate.teardown();
        assert_eq!(gate.status().state, GateState::Uninitialized);
        assert_eq!(gate.platform().stats().live(), 0);

        gate.teardown();
        assert_eq!(gate.platform().stats().double_frees, 0);

        let err = gate.release(&node).expect_err("gone");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = gate
            .acquire(&node, &caller(), &Interrupt::new())
            .expect_err("gone");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn unregistered_gate_is_not_found() {
        let gate = Gate::new(MemoryPlatform::new(), GateConfig::default());
        let node = NodeRef {
            identity: Identity::new(254, 0),
            binding: BindingId(1),
        };
        let err = gate
            .acquire(&node, &caller(), &Interrupt::new())
            .expect_err("unregistered");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        gate.teardown();
        assert_eq!(gate.platform().stats(), PlatformStats::default());
    }

    #[test]
    fn dropping_a_registered_gate_tears_it_down() {
        let platform = Arc::new(MemoryPlatform::new());
        let gate = Gate::new(Arc::clone(&platform), GateConfig::default());
        gate.initialize().expect("initialize");
        assert_eq!(platform.stats().live(), 4);

        drop(gate);
        assert_eq!(platform.stats().live(), 0);
        assert_eq!(platform.stats().double_frees, 0);
    }
}
