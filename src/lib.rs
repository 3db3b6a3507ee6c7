//! File-access layer for a storage engine.
//!
//! The engine never touches OS file APIs directly: it is handed an
//! `Arc<dyn FileSystem>` at startup and gets every [`File`] and lock through it.
//! [`OsFileSystem`] is the production implementation; [`MemFileSystem`] and
//! [`FaultFileSystem`] exist so tests can run the same code without a disk or
//! with failures injected.

pub mod error;
pub mod fileio;
pub mod logfile;
pub mod record;
pub mod write_ahead;

pub use error::{Error, Result};
pub use fileio::{
    Backend, FaultFileSystem, FaultInjector, File, FileInfo, FileLock, FileSystem, MemFileSystem,
    Op, OsFileSystem, ReadAt,
};
pub use record::RecordId;
pub use write_ahead::{WriteAhead, WriteAheadOptions};
