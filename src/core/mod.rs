// Core modules implementing the gate, its registration seam, and error modeling.
pub mod caller;
pub mod error;
pub mod gate;
pub mod identity;
pub mod interrupt;
pub mod platform;
pub mod session;
mod teardown;
