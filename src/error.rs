//! Error taxonomy shared by the reader, the network compiler and the driver.
//!
//! Deserialization and load failures are reported as [`Error`] values and map
//! onto a fixed set of integer codes ([`ErrorKind`]) so that callers holding on
//! to the old C-style contract can still report `-1 ..= -5`.
//!
//! Shape or rank violations inside a forward kernel are *not* represented here:
//! they mean the declared architecture and the input disagree, and the kernels
//! panic with a diagnostic instead.

use std::io;
use std::path::PathBuf;

/// Integer error classes, numerically identical to the historical codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorKind {
    /// A model or statistics file could not be opened.
    OpenFile = -1,
    /// A short or partial read anywhere in a binary stream.
    ReadFile = -2,
    /// A serialized type this runtime does not support (functions, upvalues, unknown torch classes).
    NotImplemented = -3,
    /// Bad type tag, malformed class name or dangling backreference.
    Corrupted = -4,
    /// The object tree is well formed but not what was expected.
    WrongObject = -5,
}

impl ErrorKind {
    /// The historical integer code.
    #[must_use]
    pub const fn code(self) -> i32 {
        self as i32
    }
}

/// Errors produced while loading objects, compiling networks or driving them.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Opening a file failed.
    #[error("cannot open {}: {source}", path.display())]
    OpenFile {
        /// The path that was opened.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The stream ended early or could not be read.
    #[error("read error: {0}")]
    ReadFile(#[from] io::Error),

    /// The stream holds a record type this runtime does not handle.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// The stream is malformed.
    #[error("corrupted stream: {0}")]
    Corrupted(String),

    /// The object tree does not have the expected structure.
    #[error("unexpected object: {0}")]
    WrongObject(String),

    /// The model is structurally valid but cannot be turned into a network.
    #[error("model error: {0}")]
    Model(String),
}

impl Error {
    /// Classifies this error into the fixed taxonomy.
    ///
    /// [`Error::Model`] has no code of its own and reports as
    /// [`ErrorKind::WrongObject`].
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::OpenFile { .. } => ErrorKind::OpenFile,
            Self::ReadFile(_) => ErrorKind::ReadFile,
            Self::NotImplemented(_) => ErrorKind::NotImplemented,
            Self::Corrupted(_) => ErrorKind::Corrupted,
            Self::WrongObject(_) | Self::Model(_) => ErrorKind::WrongObject,
        }
    }

    /// Shorthand for `self.kind().code()`.
    #[must_use]
    pub const fn code(&self) -> i32 {
        self.kind().code()
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;
