//! Purpose: Define the stable public Rust API boundary for devgate.
//! Exports: Gate, session, platform, and error types needed by hosts and the CLI.
//! Role: Public, additive-only surface; hides the rollback machinery.
//! Invariants: This module is the only public path to core types.

#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::caller::Caller;
pub use crate::core::error::{Error, ErrorKind, to_errno};
pub use crate::core::gate::{Gate, GateConfig, GateState, GateStatus, INTERRUPT_POLL};
pub use crate::core::identity::{BindingId, ClassId, Identity, NodeRef, SetupStep};
pub use crate::core::interrupt::Interrupt;
pub use crate::core::platform::{
    DYNAMIC_MAJORS, FsPlatform, MemoryPlatform, Platform, PlatformError, PlatformStats,
};
pub use crate::core::session::{FileHandle, SessionManager};
