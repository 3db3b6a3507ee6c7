use std::path::{Path, PathBuf};

const LOG_SUFFIX: &str = ".log";

/// Logfile represents a log file inside a write-ahead directory.
///
/// # Naming
///
/// Log files are named by a zero-padded, monotonically increasing id followed by
/// `.log`, e.g. `000042.log`. Anything else found in the directory is ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Logfile {
    pub id: u64,
    pub path: PathBuf,
    pub size: u64,
}

impl Logfile {
    pub fn new(id: u64, path: PathBuf, size: u64) -> Self {
        Self { id, path, size }
    }

    pub fn path_for(dir: &Path, id: u64) -> PathBuf {
        dir.join(Self::file_name(id))
    }

    pub fn file_name(id: u64) -> String {
        format!("{id:06}{LOG_SUFFIX}")
    }

    /// Returns the id encoded in `name`, or `None` if it is not a log file name.
    pub fn parse_file_name(name: &str) -> Option<u64> {
        let digits = name.strip_suffix(LOG_SUFFIX)?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }
}
