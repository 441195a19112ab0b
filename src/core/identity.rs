//! Purpose: Name the handles that address a registered device.
//! Exports: `Identity`, `ClassId`, `BindingId`, `NodeRef`, `SetupStep`.
//! Role: Plain value types shared by the gate, platforms, and session layer.
//! Invariants: An `Identity` is a (major, minor) pair; text form is `major:minor`.
//! Invariants: `SetupStep` order is the registration order; teardown runs it backwards.
use std::fmt;
use std::str::FromStr;

use serde::Serialize;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize)]
pub struct Identity {
    pub major: u32,
    pub minor: u32,
}

impl Identity {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ParseIdentityError(String);

impl fmt::Display for ParseIdentityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid device number `{}` (expected major:minor)", self.0)
    }
}

impl std::error::Error for ParseIdentityError {}

impl FromStr for Identity {
    type Err = ParseIdentityError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let invalid = || ParseIdentityError(trimmed.to_string());
        let (major, minor) = trimmed.split_once(':').ok_or_else(invalid)?;
        let major = major.parse().map_err(|_| invalid())?;
        let minor = minor.parse().map_err(|_| invalid())?;
        Ok(Self { major, minor })
    }
}

/// Class grouping created during registration.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ClassId(pub u64);

/// Dispatch binding that routes opens of an identity to one gate.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct BindingId(pub u64);

/// What a caller presents when opening or closing the device node.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NodeRef {
    pub identity: Identity,
    pub binding: BindingId,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum SetupStep {
    Region,
    Class,
    Binding,
    Node,
}

impl SetupStep {
    pub const ALL: [SetupStep; 4] = [
        SetupStep::Region,
        SetupStep::Class,
        SetupStep::Binding,
        SetupStep::Node,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SetupStep::Region => "alloc_region",
            SetupStep::Class => "create_class",
            SetupStep::Binding => "add_binding",
            SetupStep::Node => "create_node",
        }
    }
}

impl fmt::Display for SetupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
