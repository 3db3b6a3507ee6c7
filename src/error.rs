use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{}: no such file", .0.display())]
    NotFound(PathBuf),

    #[error("file already closed")]
    Closed,

    #[error("file locking is not supported on this platform")]
    Unsupported,

    #[error("{}: lock held by another holder", .0.display())]
    LockHeld(PathBuf),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Maps an OS error for `path`, turning a missing entry into [`Error::NotFound`].
    pub(crate) fn at(err: io::Error, path: &Path) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Error::NotFound(path.to_path_buf()),
            _ => Error::Io(err),
        }
    }
}
