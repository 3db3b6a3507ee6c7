use std::env;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use crate::error::Result;

pub mod fault;
mod lock;
pub mod mem_file;
pub mod os_file;

pub use fault::{FaultFileSystem, FaultInjector, Op};
pub use mem_file::MemFileSystem;
pub use os_file::OsFileSystem;

/// A single open file: closable, randomly readable, sequentially writable.
///
/// # Why
///
/// Abstracting this to a trait has a few benefits:
///
/// 1. Production code runs on the host file system through [`OsFileSystem`]
/// 2. Tests can substitute [`MemFileSystem`] or wrap either in a [`FaultFileSystem`]
/// 3. Every consumer in the engine gets its handles from one injected [`FileSystem`]
///
/// A file is owned by whoever obtained it. Once [`File::close`] returns, every
/// other call (including a second close) fails with [`Error::Closed`](crate::Error::Closed).
pub trait File: Send + Sync + fmt::Debug {
    /// Reads into `buf` starting at byte `offset`.
    ///
    /// A short read is always reported with [`ReadAt::eof`] set, so it cannot be
    /// confused with a failure. Errors are returned only when the medium fails.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<ReadAt>;

    /// Writes all of `buf` at the current write position and advances it.
    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    fn stat(&self) -> Result<FileInfo>;

    fn close(&mut self) -> Result<()>;
}

/// A namespace of files.
///
/// Names are host paths: `/` or `\` separated depending on the platform.
pub trait FileSystem: Send + Sync + fmt::Debug {
    /// Creates `name`, truncating any existing file, opened for reading and writing.
    fn create(&self, name: &Path) -> Result<Box<dyn File>>;

    /// Opens an existing file for reading and writing.
    fn open(&self, name: &Path) -> Result<Box<dyn File>>;

    fn remove(&self, name: &Path) -> Result<()>;

    /// Returns the entry names directly inside `dir`, relative to `dir`, in no
    /// particular order.
    fn list(&self, dir: &Path) -> Result<Vec<String>>;

    /// Creates `dir` and any missing parents.
    fn mkdir_all(&self, dir: &Path) -> Result<()>;

    /// Takes an exclusive advisory lock on `name`, creating the file if needed.
    ///
    /// Release the lock with [`FileLock::release`]; dropping the handle also
    /// drops the claim.
    ///
    /// On Linux, a lock has the same semantics as fcntl(2)'s advisory locks.
    /// In particular, closing any other file descriptor for the same file in
    /// this process releases the lock prematurely.
    ///
    /// Locking is not implemented on other operating systems and returns
    /// [`Error::Unsupported`](crate::Error::Unsupported).
    fn lock(&self, name: &Path) -> Result<Box<dyn FileLock>>;
}

/// An exclusive claim returned by [`FileSystem::lock`].
pub trait FileLock: Send + fmt::Debug {
    fn release(self: Box<Self>) -> Result<()>;
}

/// Outcome of [`File::read_at`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadAt {
    /// Bytes copied into the buffer.
    pub n: usize,
    /// Set when the read ran into the end of the file before filling the buffer.
    pub eof: bool,
}

impl ReadAt {
    pub(crate) fn new(n: usize, wanted: usize) -> Self {
        Self {
            n,
            eof: n < wanted,
        }
    }
}

/// Snapshot of a file's metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub len: u64,
    pub modified: Option<SystemTime>,
    pub is_dir: bool,
}

/// The file system implementations that can be built without wrapping another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    #[default]
    Os,
    Memory,
}

const BACKEND_ENV: &str = "DBFS_BACKEND";

impl Backend {
    /// Reads `DBFS_BACKEND` (`os` or `memory`), falling back to [`Backend::Os`].
    pub fn from_env() -> Self {
        env::var(BACKEND_ENV)
            .ok()
            .and_then(|v| Self::parse(&v))
            .unwrap_or_default()
    }

    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "os" => Some(Backend::Os),
            "memory" | "mem" => Some(Backend::Memory),
            _ => None,
        }
    }

    pub fn build(self) -> Arc<dyn FileSystem> {
        match self {
            Backend::Os => Arc::new(OsFileSystem::new()),
            Backend::Memory => Arc::new(MemFileSystem::new()),
        }
    }
}
