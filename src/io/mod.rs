//! Reading and writing serialized Torch7 object trees.
//!
//! # Format Overview
//!
//! Every value starts with a little-endian `i32` type tag:
//!
//! ```text
//! ┌─────┬───────────┬──────────────────────────────────────────────────────┐
//! │ tag │ type      │ payload                                              │
//! ├─────┼───────────┼──────────────────────────────────────────────────────┤
//! │ 0   │ nil       │ -                                                    │
//! │ 1   │ number    │ f64                                                  │
//! │ 2   │ string    │ i32 length, raw bytes                                │
//! │ 3   │ table     │ i32 index [, i32 count, count × (name, value)]       │
//! │ 4   │ torch     │ i32 index [, version string, class string, body]     │
//! │ 5   │ boolean   │ i32                                                  │
//! │ 6-8 │ functions │ unsupported                                          │
//! └─────┴───────────┴──────────────────────────────────────────────────────┘
//! ```
//!
//! Tables and torch records carry an index. Indices are handed out in stream
//! order starting at 1; an index other than the next one is a backreference to
//! an object read earlier, and no body follows.
//!
//! Torch record bodies depend on the class name:
//!
//! - `torch.<T>Storage`: a long element count, then the elements.
//! - `torch.<T>Tensor`: `i32` rank, rank × long sizes, rank × long strides,
//!   a 1-based long storage offset, then a storage record or nil.
//! - `nn.<Name>`: one table holding the module fields.
//!
//! "Long" fields are 4 or 8 bytes wide depending on the machine that wrote
//! the file; see [`LongSize`].
//!
//! # Example
//!
//! ```rust
//! use thnets::io::{Object, Reader, ReaderOptions, Writer, WriterOptions};
//!
//! let mut bytes = Vec::new();
//! Writer::new(&mut bytes, WriterOptions::default())
//!     .write_object(&Object::Number(4.0))
//!     .unwrap();
//! let obj = Reader::new(&bytes[..], ReaderOptions::default()).read_object().unwrap();
//! assert_eq!(obj.as_number(), Some(4.0));
//! ```

mod object;
mod reader;
mod writer;

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use log::debug;

pub use object::{
    Flag, ModuleObject, Object, ScalarType, StorageData, StorageObject, Table, TensorObject,
};
pub use reader::Reader;
pub use writer::Writer;

use crate::error::{Error, Result};

/// Type tags.
pub(crate) mod tag {
    pub const NIL: i32 = 0;
    pub const NUMBER: i32 = 1;
    pub const STRING: i32 = 2;
    pub const TABLE: i32 = 3;
    pub const TORCH: i32 = 4;
    pub const BOOLEAN: i32 = 5;
    pub const FUNCTION: i32 = 6;
    pub const LEGACY_RECUR_FUNCTION: i32 = 7;
    pub const RECUR_FUNCTION: i32 = 8;
}

/// On-disk width of "long" fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LongSize {
    /// Written on an ILP32 / LLP64 machine.
    Four,
    /// Written on an LP64 machine.
    #[default]
    Eight,
}

impl LongSize {
    /// Width in bytes.
    #[must_use]
    pub const fn bytes(self) -> usize {
        match self {
            Self::Four => 4,
            Self::Eight => 8,
        }
    }
}

/// Options for [`Reader`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ReaderOptions {
    pub long_size: LongSize,
}

/// Options for [`Writer`].
#[derive(Debug, Clone, Copy, Default)]
pub struct WriterOptions {
    pub long_size: LongSize,
}

/// Reads one object tree from a file.
///
/// # Errors
///
/// [`Error::OpenFile`] if the file cannot be opened, otherwise whatever
/// [`Reader::read_object`] reports.
pub fn load_file(path: impl AsRef<Path>, options: ReaderOptions) -> Result<Object> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| Error::OpenFile {
        path: path.to_path_buf(),
        source,
    })?;
    let obj = Reader::new(BufReader::new(file), options).read_object()?;
    debug!("loaded {} from {}", obj.type_name(), path.display());
    Ok(obj)
}

/// Writes one object tree to a file, replacing it.
///
/// # Errors
///
/// [`Error::OpenFile`] if the file cannot be created, [`Error::ReadFile`] on
/// I/O failure while writing.
pub fn save_file(path: impl AsRef<Path>, obj: &Object, options: WriterOptions) -> Result<()> {
    let path = path.as_ref();
    let file = File::create(path).map_err(|source| Error::OpenFile {
        path: path.to_path_buf(),
        source,
    })?;
    let mut out = BufWriter::new(file);
    Writer::new(&mut out, options).write_object(obj)?;
    out.flush()?;
    Ok(())
}
