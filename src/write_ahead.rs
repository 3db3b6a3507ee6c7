use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{debug, info, trace};

use crate::error::Error;
use crate::fileio::{File, FileLock, FileSystem};
use crate::logfile::Logfile;
use crate::record::RecordId;

const LOCK_FILE: &str = "LOCK";

const DEFAULT_LOG_DIR: &str = "./write_ahead";
const DEFAULT_MAX_LOG_SIZE: u64 = 1024 * 1024 * 1024; // 1GB

fn get_log_dir() -> PathBuf {
    env::var_os("WRITEAHEAD_LOG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR))
}

fn get_max_log_size() -> u64 {
    env::var("WRITEAHEAD_MAX_LOG_SIZE")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_MAX_LOG_SIZE)
}

/// WriteAhead owns a log directory: it locks it, discovers the log files already
/// in it, appends records to the newest one and rotates by size.
///
/// All I/O goes through the injected [`FileSystem`]. A WriteAhead is single
/// threaded; callers serialize access to it.
#[derive(Debug)]
pub struct WriteAhead {
    fs: Arc<dyn FileSystem>,
    options: WriteAheadOptions,

    log_files: BTreeMap<u64, Logfile>,
    active: Option<ActiveLog>,
    lock: Option<Box<dyn FileLock>>,
}

#[derive(Debug)]
struct ActiveLog {
    id: u64,
    file: Box<dyn File>,
    size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteAheadOptions {
    pub log_dir: PathBuf,
    pub max_log_size: u64,
}

impl Default for WriteAheadOptions {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from(DEFAULT_LOG_DIR),
            max_log_size: DEFAULT_MAX_LOG_SIZE,
        }
    }
}

impl WriteAheadOptions {
    /// Reads `WRITEAHEAD_LOG_DIR` and `WRITEAHEAD_MAX_LOG_SIZE`, keeping the
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        Self {
            log_dir: get_log_dir(),
            max_log_size: get_max_log_size(),
        }
    }

    pub fn with_log_dir(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.log_dir = log_dir.into();
        self
    }

    pub fn with_max_log_size(mut self, max_log_size: u64) -> Self {
        self.max_log_size = max_log_size;
        self
    }
}

impl WriteAhead {
    pub fn with_options(fs: Arc<dyn FileSystem>, options: WriteAheadOptions) -> Self {
        Self {
            fs,
            options,
            log_files: BTreeMap::new(),
            active: None,
            lock: None,
        }
    }

    fn log_dir(&self) -> &Path {
        &self.options.log_dir
    }

    /// Locks the log directory and loads the log files already in it.
    ///
    /// Fails if another instance holds the directory lock.
    pub fn start(&mut self) -> Result<()> {
        if self.lock.is_some() {
            bail!("write-ahead log already started");
        }

        let dir = self.options.log_dir.clone();
        self.fs
            .mkdir_all(&dir)
            .with_context(|| format!("creating log directory {}", dir.display()))?;

        let lock_path = dir.join(LOCK_FILE);
        let lock = match self.fs.lock(&lock_path) {
            Ok(lock) => lock,
            Err(Error::LockHeld(_)) => {
                bail!("log directory {} is in use by another instance", dir.display())
            }
            Err(e) => {
                return Err(e).with_context(|| format!("locking {}", lock_path.display()));
            }
        };

        // Load in all log files in the log directory
        let names = self
            .fs
            .list(&dir)
            .with_context(|| format!("listing {}", dir.display()))?;
        for name in names {
            let Some(id) = Logfile::parse_file_name(&name) else {
                trace!(%name, "skipping non-log entry");
                continue;
            };
            let path = dir.join(&name);
            let size = self.file_size(&path)?;
            self.log_files.insert(id, Logfile::new(id, path, size));
        }

        self.lock = Some(lock);
        info!(dir = %dir.display(), logs = self.log_files.len(), "write-ahead log started");
        Ok(())
    }

    fn file_size(&self, path: &Path) -> Result<u64> {
        let mut file = self
            .fs
            .open(path)
            .with_context(|| format!("opening {}", path.display()))?;
        let stat = file.stat();
        file.close()?;
        Ok(stat.with_context(|| format!("stat {}", path.display()))?.len)
    }

    /// Appends `data` as one record, rotating to a fresh log file first if it
    /// would not fit in the active one.
    pub fn append(&mut self, data: &[u8]) -> Result<RecordId> {
        if self.lock.is_none() {
            bail!("write-ahead log not started");
        }
        let len = data.len() as u64;
        if len > self.options.max_log_size {
            bail!(
                "record of {len} bytes exceeds max log size {}",
                self.options.max_log_size
            );
        }

        let needs_rotation = match &self.active {
            Some(active) => active.size + len > self.options.max_log_size,
            None => true,
        };
        if needs_rotation {
            self.rotate()?;
        }

        let active = self
            .active
            .as_mut()
            .context("no active log file after rotation")?;
        let offset = active.size;
        active
            .file
            .write(data)
            .with_context(|| format!("appending to log {}", active.id))?;
        active.size += len;

        if let Some(logfile) = self.log_files.get_mut(&active.id) {
            logfile.size = active.size;
        }
        Ok(RecordId::new(active.id, offset, len))
    }

    fn rotate(&mut self) -> Result<()> {
        if let Some(mut active) = self.active.take() {
            active
                .file
                .close()
                .with_context(|| format!("closing log {}", active.id))?;
        }

        let id = self.log_files.keys().next_back().map_or(1, |id| id + 1);
        let path = Logfile::path_for(self.log_dir(), id);
        let file = self
            .fs
            .create(&path)
            .with_context(|| format!("creating {}", path.display()))?;

        self.log_files.insert(id, Logfile::new(id, path, 0));
        self.active = Some(ActiveLog { id, file, size: 0 });
        debug!(id, "rotated to new log file");
        Ok(())
    }

    /// Reads back the record at `record`.
    pub fn read(&self, record: &RecordId) -> Result<Vec<u8>> {
        let logfile = self
            .log_files
            .get(&record.file_id)
            .with_context(|| format!("unknown log file {}", record.file_id))?;
        let len = usize::try_from(record.len).context("record length overflows usize")?;

        let mut file = self
            .fs
            .open(&logfile.path)
            .with_context(|| format!("opening {}", logfile.path.display()))?;
        let mut buf = vec![0u8; len];
        let read = file.read_at(&mut buf, record.file_offset);
        file.close()?;

        let read = read.with_context(|| format!("reading {}", logfile.path.display()))?;
        if read.eof {
            bail!(
                "record at {}:{} truncated: wanted {} bytes, found {}",
                record.file_id,
                record.file_offset,
                record.len,
                read.n
            );
        }
        Ok(buf)
    }

    pub fn log_files(&self) -> impl Iterator<Item = &Logfile> {
        self.log_files.values()
    }

    /// Deletes an obsolete log file. The active log cannot be removed.
    pub fn remove_log(&mut self, id: u64) -> Result<()> {
        if self.active.as_ref().is_some_and(|a| a.id == id) {
            bail!("log {id} is the active log");
        }
        let logfile = self
            .log_files
            .remove(&id)
            .with_context(|| format!("unknown log file {id}"))?;
        self.fs
            .remove(&logfile.path)
            .with_context(|| format!("removing {}", logfile.path.display()))?;
        debug!(id, "removed log file");
        Ok(())
    }

    /// Closes the active log and releases the directory lock.
    pub fn close(mut self) -> Result<()> {
        if let Some(mut active) = self.active.take() {
            active
                .file
                .close()
                .with_context(|| format!("closing log {}", active.id))?;
        }
        if let Some(lock) = self.lock.take() {
            lock.release().context("releasing log directory lock")?;
        }
        info!(dir = %self.log_dir().display(), "write-ahead log closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fileio::{FaultFileSystem, MemFileSystem, Op};

    fn options() -> WriteAheadOptions {
        WriteAheadOptions::default()
            .with_log_dir("/wal")
            .with_max_log_size(16)
    }

    #[test]
    fn test_append_and_read() {
        let fs = Arc::new(MemFileSystem::new());
        let mut wal = WriteAhead::with_options(fs, options());
        wal.start().unwrap();

        let a = wal.append(b"hello").unwrap();
        let b = wal.append(b"world").unwrap();
        assert_eq!(a, RecordId::new(1, 0, 5));
        assert_eq!(b, RecordId::new(1, 5, 5));
        assert_eq!(wal.read(&a).unwrap(), b"hello");
        assert_eq!(wal.read(&b).unwrap(), b"world");
    }

    #[test]
    fn test_rotation_by_size() {
        let fs = Arc::new(MemFileSystem::new());
        let mut wal = WriteAhead::with_options(fs, options());
        wal.start().unwrap();

        wal.append(&[1u8; 10]).unwrap();
        let second = wal.append(&[2u8; 10]).unwrap();
        assert_eq!(second, RecordId::new(2, 0, 10));
        assert_eq!(wal.log_files().map(|l| l.id).collect::<Vec<_>>(), vec![1, 2]);

        assert!(wal.append(&[0u8; 17]).is_err());
    }

    #[test]
    fn test_restart_discovers_logs() {
        let fs = Arc::new(MemFileSystem::new());
        let mut wal = WriteAhead::with_options(fs.clone(), options());
        wal.start().unwrap();
        let first = wal.append(b"persisted").unwrap();
        wal.close().unwrap();

        fs.create(Path::new("/wal/notes.txt")).unwrap();

        let mut wal = WriteAhead::with_options(fs, options());
        wal.start().unwrap();
        let logs: Vec<_> = wal.log_files().cloned().collect();
        assert_eq!(logs, vec![Logfile::new(1, PathBuf::from("/wal/000001.log"), 9)]);
        assert_eq!(wal.read(&first).unwrap(), b"persisted");

        let next = wal.append(b"x").unwrap();
        assert_eq!(next.file_id, 2);
    }

    #[test]
    fn test_second_instance_refused() {
        let fs = MemFileSystem::new();
        let mut first = WriteAhead::with_options(Arc::new(fs.clone()), options());
        first.start().unwrap();

        let mut second = WriteAhead::with_options(Arc::new(fs.clone()), options());
        let err = second.start().unwrap_err();
        assert!(err.to_string().contains("in use by another instance"));

        first.close().unwrap();
        second.start().unwrap();
    }

    #[test]
    fn test_remove_log() {
        let fs = Arc::new(MemFileSystem::new());
        let mut wal = WriteAhead::with_options(fs.clone(), options());
        wal.start().unwrap();
        wal.append(&[1u8; 10]).unwrap();
        wal.append(&[2u8; 10]).unwrap();

        assert!(wal.remove_log(2).is_err());
        wal.remove_log(1).unwrap();
        assert!(wal.remove_log(1).is_err());

        let mut names = fs.list(Path::new("/wal")).unwrap();
        names.sort();
        assert_eq!(names, vec!["000002.log".to_string(), "LOCK".to_string()]);
    }

    #[test]
    fn test_truncated_record_is_reported() {
        let fs = Arc::new(MemFileSystem::new());
        let mut wal = WriteAhead::with_options(fs, options());
        wal.start().unwrap();
        let rec = wal.append(b"abc").unwrap();

        let bogus = RecordId::new(rec.file_id, rec.file_offset, 8);
        let err = wal.read(&bogus).unwrap_err();
        assert!(err.to_string().contains("truncated"));
    }

    #[test]
    fn test_write_fault_surfaces() {
        let fs = FaultFileSystem::new(Arc::new(MemFileSystem::new()));
        let injector = fs.injector().clone();
        let mut wal = WriteAhead::with_options(Arc::new(fs), options());
        wal.start().unwrap();

        injector.fail(Op::Write);
        let err = wal.append(b"abc").unwrap_err();
        assert!(err.downcast_ref::<Error>().is_some());

        injector.heal(Op::Write);
        wal.append(b"abc").unwrap();
    }

    #[test]
    fn test_append_before_start() {
        let mut wal = WriteAhead::with_options(Arc::new(MemFileSystem::new()), options());
        assert!(wal.append(b"abc").is_err());
    }
}
