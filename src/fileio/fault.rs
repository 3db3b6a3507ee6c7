//! A [`FileSystem`] wrapper that fails chosen operations on demand.
//!
//! Faults are armed through a shared [`FaultInjector`]; files handed out by
//! the wrapper consult the same injector, so a test can let a database open
//! normally and then make its next write fail.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::warn;

use super::{File, FileInfo, FileLock, FileSystem, ReadAt};
use crate::error::{Error, Result};

/// Operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Create,
    Open,
    Remove,
    List,
    MkdirAll,
    Lock,
    Read,
    Write,
    Stat,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Op::Create => "create",
            Op::Open => "open",
            Op::Remove => "remove",
            Op::List => "list",
            Op::MkdirAll => "mkdir_all",
            Op::Lock => "lock",
            Op::Read => "read",
            Op::Write => "write",
            Op::Stat => "stat",
        };
        f.write_str(name)
    }
}

/// Calls allowed through before an armed operation starts failing.
#[derive(Debug, Clone, Copy)]
struct Fault {
    remaining: usize,
}

/// Shared switchboard of armed faults.
#[derive(Debug, Clone, Default)]
pub struct FaultInjector {
    faults: Arc<Mutex<HashMap<Op, Fault>>>,
}

impl FaultInjector {
    pub fn new() -> Self {
        Self::default()
    }

    fn faults(&self) -> MutexGuard<'_, HashMap<Op, Fault>> {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes every following call of `op` fail.
    pub fn fail(&self, op: Op) {
        self.fail_after(op, 0);
    }

    /// Lets `n` more calls of `op` succeed, then fails every call after them.
    pub fn fail_after(&self, op: Op, n: usize) {
        self.faults().insert(op, Fault { remaining: n });
    }

    pub fn heal(&self, op: Op) {
        self.faults().remove(&op);
    }

    pub fn heal_all(&self) {
        self.faults().clear();
    }

    fn check(&self, op: Op) -> Result<()> {
        let mut faults = self.faults();
        let Some(fault) = faults.get_mut(&op) else {
            return Ok(());
        };
        if fault.remaining > 0 {
            fault.remaining -= 1;
            return Ok(());
        }

        warn!(%op, "injecting fault");
        Err(Error::Io(io::Error::other(format!("injected fault: {op}"))))
    }
}

/// Wraps another [`FileSystem`], consulting a [`FaultInjector`] before each call.
#[derive(Debug, Clone)]
pub struct FaultFileSystem {
    inner: Arc<dyn FileSystem>,
    injector: FaultInjector,
}

impl FaultFileSystem {
    pub fn new(inner: Arc<dyn FileSystem>) -> Self {
        Self::with_injector(inner, FaultInjector::new())
    }

    pub fn with_injector(inner: Arc<dyn FileSystem>, injector: FaultInjector) -> Self {
        FaultFileSystem { inner, injector }
    }

    pub fn injector(&self) -> &FaultInjector {
        &self.injector
    }

    fn wrap(&self, file: Box<dyn File>) -> Box<dyn File> {
        Box::new(FaultFile {
            inner: file,
            injector: self.injector.clone(),
            closed: false,
        })
    }
}

impl FileSystem for FaultFileSystem {
    fn create(&self, name: &Path) -> Result<Box<dyn File>> {
        self.injector.check(Op::Create)?;
        Ok(self.wrap(self.inner.create(name)?))
    }

    fn open(&self, name: &Path) -> Result<Box<dyn File>> {
        self.injector.check(Op::Open)?;
        Ok(self.wrap(self.inner.open(name)?))
    }

    fn remove(&self, name: &Path) -> Result<()> {
        self.injector.check(Op::Remove)?;
        self.inner.remove(name)
    }

    fn list(&self, dir: &Path) -> Result<Vec<String>> {
        self.injector.check(Op::List)?;
        self.inner.list(dir)
    }

    fn mkdir_all(&self, dir: &Path) -> Result<()> {
        self.injector.check(Op::MkdirAll)?;
        self.inner.mkdir_all(dir)
    }

    fn lock(&self, name: &Path) -> Result<Box<dyn FileLock>> {
        self.injector.check(Op::Lock)?;
        self.inner.lock(name)
    }
}

#[derive(Debug)]
struct FaultFile {
    inner: Box<dyn File>,
    injector: FaultInjector,
    closed: bool,
}

impl FaultFile {
    /// A closed handle reports `Closed` whatever faults are armed.
    fn check(&self, op: Op) -> Result<()> {
        if self.closed {
            return Err(Error::Closed);
        }
        self.injector.check(op)
    }
}

impl File for FaultFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<ReadAt> {
        self.check(Op::Read)?;
        self.inner.read_at(buf, offset)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.check(Op::Write)?;
        self.inner.write(buf)
    }

    fn stat(&self) -> Result<FileInfo> {
        self.check(Op::Stat)?;
        self.inner.stat()
    }

    // Close is never faulted so that ownership of the handle always ends cleanly.
    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::Closed);
        }
        self.inner.close()?;
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fileio::MemFileSystem;

    fn fault_fs() -> FaultFileSystem {
        FaultFileSystem::new(Arc::new(MemFileSystem::new()))
    }

    #[test]
    fn test_passes_through_when_healthy() {
        let fs = fault_fs();
        let mut f = fs.create(Path::new("a")).unwrap();
        f.write(b"abc").unwrap();
        f.close().unwrap();
        assert_eq!(fs.list(Path::new("")).unwrap(), vec!["a".to_string()]);
    }

    #[test]
    fn test_fail_and_heal() {
        let fs = fault_fs();
        fs.injector().fail(Op::Create);
        assert!(matches!(fs.create(Path::new("a")), Err(Error::Io(_))));
        // a failed create leaves nothing behind
        assert!(fs.list(Path::new("")).unwrap().is_empty());

        fs.injector().heal(Op::Create);
        fs.create(Path::new("a")).unwrap();
    }

    #[test]
    fn test_fail_after_counts_calls() {
        let fs = fault_fs();
        let mut f = fs.create(Path::new("a")).unwrap();
        fs.injector().fail_after(Op::Write, 2);

        f.write(b"1").unwrap();
        f.write(b"2").unwrap();
        assert!(matches!(f.write(b"3"), Err(Error::Io(_))));
        assert!(matches!(f.write(b"4"), Err(Error::Io(_))));

        let mut buf = [0u8; 4];
        let r = f.read_at(&mut buf, 0).unwrap();
        assert_eq!(r, ReadAt { n: 2, eof: true });
        assert_eq!(&buf[..2], b"12");
    }

    #[test]
    fn test_close_is_never_faulted() {
        let fs = fault_fs();
        let mut f = fs.create(Path::new("a")).unwrap();
        fs.injector().fail(Op::Read);
        fs.injector().fail(Op::Write);
        fs.injector().fail(Op::Stat);
        f.close().unwrap();

        fs.injector().heal_all();
        assert!(matches!(f.stat(), Err(Error::Closed)));
    }

    #[test]
    fn test_closed_file_ignores_armed_faults() {
        let fs = fault_fs();
        let mut f = fs.create(Path::new("a")).unwrap();
        f.write(b"abc").unwrap();
        f.close().unwrap();

        for op in [Op::Read, Op::Write, Op::Stat] {
            fs.injector().fail(op);
        }
        for _ in 0..2 {
            let mut buf = [0u8; 3];
            assert!(matches!(f.read_at(&mut buf, 0), Err(Error::Closed)));
            assert!(matches!(f.write(b"x"), Err(Error::Closed)));
            assert!(matches!(f.stat(), Err(Error::Closed)));
            assert!(matches!(f.close(), Err(Error::Closed)));
        }
    }

    #[test]
    fn test_shared_injector_covers_lock() {
        let injector = FaultInjector::new();
        let fs = FaultFileSystem::with_injector(Arc::new(MemFileSystem::new()), injector.clone());
        injector.fail(Op::Lock);
        assert!(matches!(fs.lock(Path::new("LOCK")), Err(Error::Io(_))));
        injector.heal(Op::Lock);
        fs.lock(Path::new("LOCK")).unwrap().release().unwrap();
    }
}
