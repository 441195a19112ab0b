//! Purpose: Mirror device visibility into a directory tree, like `/dev` plus sysfs.
//! Exports: `FsPlatform`.
//! Role: Wraps `MemoryPlatform` for numbering and bindings; adds node and class files.
//! Invariants: Node files hold `major:minor\n`; the class entry holds the same in `dev`.
//! Invariants: Removal failures are logged and skipped; creation failures undo partial files.
//! Invariants: Node and class names are single path components; anything else is `InvalidInput`.
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{MemoryPlatform, Platform, PlatformError};
use crate::core::error::{Error, ErrorKind};
use crate::core::identity::{BindingId, ClassId, Identity};

pub struct FsPlatform {
    root: PathBuf,
    memory: MemoryPlatform,
    paths: Mutex<Paths>,
}

#[derive(Default)]
struct Paths {
    classes: BTreeMap<ClassId, PathBuf>,
    nodes: BTreeMap<Identity, NodePaths>,
}

struct NodePaths {
    node: PathBuf,
    class_entry: PathBuf,
}

impl FsPlatform {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_memory(root, MemoryPlatform::new())
    }

    pub fn with_memory(root: impl Into<PathBuf>, memory: MemoryPlatform) -> Self {
        Self {
            root: root.into(),
            memory,
            paths: Mutex::new(Paths::default()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn memory(&self) -> &MemoryPlatform {
        &self.memory
    }

    pub fn node_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Reads the device number a node file advertises.
    pub fn read_node(path: &Path) -> Result<Identity, Error> {
        let text = fs::read_to_string(path).map_err(|err| {
            let kind = if err.kind() == io::ErrorKind::NotFound {
                ErrorKind::NotFound
            } else {
                ErrorKind::Io
            };
            Error::new(kind)
                .with_message("failed to read device node")
                .with_path(path)
                .with_source(err)
        })?;
        text.parse().map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("malformed device node")
                .with_path(path)
                .with_source(err)
        })
    }

    fn paths(&self) -> MutexGuard<'_, Paths> {
        self.paths.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Platform for FsPlatform {
    fn alloc_region(&self, name: &str, minor_base: u32) -> Result<Identity, PlatformError> {
        self.memory.alloc_region(name, minor_base)
    }

    fn create_class(&self, name: &str) -> Result<ClassId, PlatformError> {
        check_component(name)?;
        let class = self.memory.create_class(name)?;
        let dir = self.root.join("class").join(name);
        let created = dir
            .parent()
            .map_or(Ok(()), fs::create_dir_all)
            .and_then(|()| fs::create_dir(&dir));
        if let Err(err) = created {
            self.memory.destroy_class(class);
            return Err(err.into());
        }
        self.paths().classes.insert(class, dir);
        Ok(class)
    }

    fn add_binding(&self, identity: Identity) -> Result<BindingId, PlatformError> {
        self.memory.add_binding(identity)
    }

    fn create_node(
        &self,
        class: ClassId,
        identity: Identity,
        name: &str,
    ) -> Result<(), PlatformError> {
        let Some(class_dir) = self.paths().classes.get(&class).cloned() else {
            return Err(PlatformError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                "class directory is not registered",
            )));
        };
        check_component(name)?;
        self.memory.create_node(class, identity, name)?;

        let node = self.node_path(name);
        let class_entry = class_dir.join(name);
        if let Err(err) = write_node_files(&node, &class_entry, identity) {
            self.memory.destroy_node(class, identity);
            return Err(err.into());
        }
        self.paths()
            .nodes
            .insert(identity, NodePaths { node, class_entry });
        Ok(())
    }

    fn lookup_binding(&self, identity: Identity) -> Option<BindingId> {
        self.memory.lookup_binding(identity)
    }

    fn destroy_node(&self, class: ClassId, identity: Identity) {
        if let Some(paths) = self.paths().nodes.remove(&identity) {
            remove_logged(&paths.node, fs::remove_file(&paths.node));
            remove_logged(&paths.class_entry, fs::remove_dir_all(&paths.class_entry));
        }
        self.memory.destroy_node(class, identity);
    }

    fn del_binding(&self, binding: BindingId) {
        self.memory.del_binding(binding);
    }

    fn destroy_class(&self, class: ClassId) {
        if let Some(dir) = self.paths().classes.remove(&class) {
            remove_logged(&dir, fs::remove_dir(&dir));
        }
        self.memory.destroy_class(class);
    }

    fn free_region(&self, identity: Identity) {
        self.memory.free_region(identity);
    }
}

/// Names become directory entries under the root; they must not reach outside it.
fn check_component(name: &str) -> Result<(), PlatformError> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(PlatformError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("`{name}` is not a single path component"),
        )));
    }
    Ok(())
}

fn write_node_files(node: &Path, class_entry: &Path, identity: Identity) -> io::Result<()> {
    let contents = format!("{identity}\n");
    let mut file = OpenOptions::new().write(true).create_new(true).open(node)?;
    let written = file
        .write_all(contents.as_bytes())
        .and_then(|()| fs::create_dir(class_entry))
        .and_then(|()| fs::write(class_entry.join("dev"), &contents));
    if let Err(err) = written {
        let _ = fs::remove_file(node);
        let _ = fs::remove_dir_all(class_entry);
        return Err(err);
    }
    Ok(())
}

fn remove_logged(path: &Path, result: io::Result<()>) {
    if let Err(err) = result {
        if err.kind() != io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %err, "failed to remove device file");
        }
    }
}
