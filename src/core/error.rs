use std::error::Error as StdError;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::core::identity::{Identity, SetupStep};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    Internal,
    Usage,
    NotFound,
    Interrupted,
    Registration,
    Io,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    hint: Option<String>,
    identity: Option<Identity>,
    step: Option<SetupStep>,
    path: Option<PathBuf>,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            hint: None,
            identity: None,
            step: None,
            path: None,
            source: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    pub fn identity(&self) -> Option<Identity> {
        self.identity
    }

    pub fn step(&self) -> Option<SetupStep> {
        self.step
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn with_step(mut self, step: SetupStep) -> Self {
        self.step = Some(step);
        self
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        if let Some(identity) = self.identity {
            write!(f, " (device: {identity})")?;
        }
        if let Some(step) = self.step {
            write!(f, " (step: {step})")?;
        }
        if let Some(path) = &self.path {
            write!(f, " (path: {})", path.display())?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn StdError + 'static))
    }
}

pub fn to_exit_code(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::Internal => 1,
        ErrorKind::Usage => 2,
        ErrorKind::NotFound => 3,
        ErrorKind::Interrupted => 4,
        ErrorKind::Registration => 5,
        ErrorKind::Io => 6,
    }
}

/// The errno a device-file open would surface for `kind`.
pub fn to_errno(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::Internal => libc::EFAULT,
        ErrorKind::Usage => libc::EINVAL,
        ErrorKind::NotFound => libc::ENODEV,
        ErrorKind::Interrupted => libc::EINTR,
        ErrorKind::Registration => libc::EBUSY,
        ErrorKind::Io => libc::EIO,
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, ErrorKind, to_errno, to_exit_code};
    use crate::core::identity::{Identity, SetupStep};
    use std::error::Error as _;

    #[test]
    fn exit_code_mapping_is_stable() {
        let cases = [
            (ErrorKind::Internal, 1),
            (ErrorKind::Usage, 2),
            (ErrorKind::NotFound, 3),
            (ErrorKind::Interrupted, 4),
            (ErrorKind::Registration, 5),
            (ErrorKind::Io, 6),
        ];

        for (kind, code) in cases {
            assert_eq!(to_exit_code(kind), code);
        }
    }

    #[test]
    fn errno_mapping_matches_device_semantics() {
        assert_eq!(to_errno(ErrorKind::NotFound), libc::ENODEV);
        assert_eq!(to_errno(ErrorKind::Interrupted), libc::EINTR);
        assert_eq!(to_errno(ErrorKind::Registration), libc::EBUSY);
        assert_eq!(to_errno(ErrorKind::Usage), libc::EINVAL);
    }

    #[test]
    fn display_includes_context() {
        let err = Error::new(ErrorKind::Registration)
            .with_message("create_class failed")
            .with_identity(Identity::new(254, 0))
            .with_step(SetupStep::Class);
        assert_eq!(
            err.to_string(),
            "Registration: create_class failed (device: 254:0) (step: create_class)"
        );
    }

    #[test]
    fn source_is_chained() {
        let io = std::io::Error::other("disk gone");
        let err = Error::new(ErrorKind::Io).with_source(io);
        let source = err.source().expect("source");
        assert_eq!(source.to_string(), "disk gone");
    }
}
