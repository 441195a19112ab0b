//! Purpose: Device-file layer that dispatches open/command/close into a gate.
//! Exports: `SessionManager`, `FileHandle`.
//! Role: Owns the gate; maps open file handles to the node and caller that opened them.
//! Invariants: A handle exists only between a successful open and its close.
//! Invariants: Unknown handles are the file layer's `Usage` error and never reach the gate.
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::core::caller::Caller;
use crate::core::error::{Error, ErrorKind};
use crate::core::gate::{Gate, GateConfig, GateStatus};
use crate::core::identity::{Identity, NodeRef};
use crate::core::interrupt::Interrupt;
use crate::core::platform::Platform;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct FileHandle(pub u64);

struct OpenFile {
    node: NodeRef,
    caller: Caller,
}

pub struct SessionManager<P: Platform> {
    gate: Gate<P>,
    files: Mutex<BTreeMap<FileHandle, OpenFile>>,
    next_handle: AtomicU64,
}

impl<P: Platform> SessionManager<P> {
    /// Builds a gate over `platform` and registers it.
    pub fn register(platform: P, config: GateConfig) -> Result<Self, Error> {
        let gate = Gate::new(platform, config);
        gate.initialize()?;
        Ok(Self {
            gate,
            files: Mutex::new(BTreeMap::new()),
            next_handle: AtomicU64::new(1),
        })
    }

    pub fn gate(&self) -> &Gate<P> {
        &self.gate
    }

    pub fn identity(&self) -> Option<Identity> {
        self.gate.status().identity
    }

    pub fn status(&self) -> GateStatus {
        self.gate.status()
    }

    pub fn open_files(&self) -> usize {
        self.files().len()
    }

    pub fn on_open(
        &self,
        identity: Identity,
        caller: Caller,
        interrupt: &Interrupt,
    ) -> Result<FileHandle, Error> {
        let binding = self.gate.platform().lookup_binding(identity).ok_or_else(|| {
            Error::new(ErrorKind::NotFound)
                .with_message("no device is bound to this number")
                .with_identity(identity)
        })?;
        let node = NodeRef { identity, binding };
        self.gate.acquire(&node, &caller, interrupt)?;

        let mut files = self.files();
        // `unregister` tears down before clearing files; a teardown that won the
        // race after `acquire` has already freed the device.
        if self.gate.node() != Some(node) {
            return Err(Error::new(ErrorKind::NotFound)
                .with_message("device was unregistered during open")
                .with_identity(identity));
        }
        let handle = FileHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        files.insert(handle, OpenFile { node, caller });
        Ok(handle)
    }

    pub fn on_command(&self, handle: FileHandle, code: u32, arg: u64) -> Result<i64, Error> {
        let caller = self
            .files()
            .get(&handle)
            .map(|file| file.caller.clone())
            .ok_or_else(|| unknown_handle(handle))?;
        Ok(self.gate.command(&caller, code, arg))
    }

    pub fn on_close(&self, handle: FileHandle) -> Result<(), Error> {
        let file = self
            .files()
            .remove(&handle)
            .ok_or_else(|| unknown_handle(handle))?;
        match self.gate.release(&file.node) {
            // The device went away while this file was open; closing it is still fine.
            Err(err) if err.kind() == ErrorKind::NotFound && !self.status().is_registered() => {
                Ok(())
            }
            result => result,
        }
    }

    pub fn unregister(&self) {
        self.gate.teardown();
        self.files().clear();
    }

    fn files(&self) -> MutexGuard<'_, BTreeMap<FileHandle, OpenFile>> {
        self.files.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn unknown_handle(handle: FileHandle) -> Error {
    Error::new(ErrorKind::Usage)
        .with_message(format!("unknown file handle {}", handle.0))
        .with_hint("Open the device first; handles are invalid after close.")
}
