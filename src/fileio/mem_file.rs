use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::SystemTime;

use tracing::debug;

use super::{File, FileInfo, FileLock, FileSystem, ReadAt};
use crate::error::{Error, Result};

/// [`FileSystem`] held entirely in memory.
///
/// Clones share one namespace, so two clones behave like two engine instances
/// pointed at the same directory: a lock taken through one is seen as held by
/// the other. Removing a file unlinks the name while open handles keep working.
#[derive(Debug, Clone, Default)]
pub struct MemFileSystem {
    ns: Arc<Mutex<Namespace>>,
}

#[derive(Debug, Default)]
struct Namespace {
    files: BTreeMap<PathBuf, Arc<RwLock<Node>>>,
    dirs: BTreeSet<PathBuf>,
    locks: BTreeSet<PathBuf>,
}

#[derive(Debug)]
struct Node {
    data: Vec<u8>,
    modified: SystemTime,
}

impl Node {
    fn empty() -> Arc<RwLock<Node>> {
        Arc::new(RwLock::new(Node {
            data: Vec::new(),
            modified: SystemTime::now(),
        }))
    }
}

/// Lexically resolves `.` and `..` so equivalent names share one key.
fn normalize(path: &Path) -> PathBuf {
    let mut parts: Vec<Component<'_>> = Vec::new();
    for c in path.components() {
        match c {
            Component::CurDir => {}
            Component::ParentDir => match parts.last() {
                Some(Component::Normal(_)) => {
                    parts.pop();
                }
                // `..` at the root stays at the root
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => parts.push(c),
            },
            _ => parts.push(c),
        }
    }
    parts.iter().collect()
}

fn io_error(kind: io::ErrorKind, msg: &str, path: &Path) -> Error {
    Error::Io(io::Error::new(kind, format!("{}: {msg}", path.display())))
}

impl Namespace {
    fn is_dir(&self, path: &Path) -> bool {
        path.parent().is_none() || self.dirs.contains(path)
    }

    fn parent_is_dir(&self, path: &Path) -> bool {
        path.parent().is_some_and(|p| self.is_dir(p))
    }
}

impl MemFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    fn ns(&self) -> MutexGuard<'_, Namespace> {
        self.ns.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl FileSystem for MemFileSystem {
    fn create(&self, name: &Path) -> Result<Box<dyn File>> {
        let path = normalize(name);
        let mut ns = self.ns();
        if ns.is_dir(&path) {
            return Err(io_error(io::ErrorKind::Other, "is a directory", &path));
        }
        if !ns.parent_is_dir(&path) {
            return Err(io_error(io::ErrorKind::NotFound, "no such directory", &path));
        }

        let node = match ns.files.get(&path) {
            Some(node) => {
                let mut n = node.write().unwrap_or_else(PoisonError::into_inner);
                n.data.clear();
                n.modified = SystemTime::now();
                node.clone()
            }
            None => {
                let node = Node::empty();
                ns.files.insert(path.clone(), node.clone());
                node
            }
        };
        Ok(Box::new(MemFile::new(path, node)))
    }

    fn open(&self, name: &Path) -> Result<Box<dyn File>> {
        let path = normalize(name);
        let ns = self.ns();
        if ns.is_dir(&path) {
            return Err(io_error(io::ErrorKind::Other, "is a directory", &path));
        }
        let node = ns
            .files
            .get(&path)
            .cloned()
            .ok_or_else(|| Error::NotFound(name.to_path_buf()))?;
        Ok(Box::new(MemFile::new(path, node)))
    }

    fn remove(&self, name: &Path) -> Result<()> {
        let path = normalize(name);
        let mut ns = self.ns();
        if ns.files.remove(&path).is_some() {
            return Ok(());
        }
        if ns.is_dir(&path) {
            return Err(io_error(io::ErrorKind::Other, "is a directory", &path));
        }
        Err(Error::NotFound(name.to_path_buf()))
    }

    fn list(&self, dir: &Path) -> Result<Vec<String>> {
        let dir = normalize(dir);
        let ns = self.ns();
        if !ns.is_dir(&dir) {
            let kind = if ns.files.contains_key(&dir) {
                io::ErrorKind::Other
            } else {
                io::ErrorKind::NotFound
            };
            return Err(io_error(kind, "not a directory", &dir));
        }

        let names = ns
            .files
            .keys()
            .chain(ns.dirs.iter())
            .filter(|p| p.parent() == Some(dir.as_path()))
            .filter_map(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .collect();
        Ok(names)
    }

    fn mkdir_all(&self, dir: &Path) -> Result<()> {
        let dir = normalize(dir);
        let mut ns = self.ns();
        let missing: Vec<PathBuf> = dir
            .ancestors()
            .filter(|p| p.parent().is_some())
            .map(Path::to_path_buf)
            .collect();
        if let Some(file) = missing.iter().find(|p| ns.files.contains_key(*p)) {
            return Err(io_error(io::ErrorKind::AlreadyExists, "not a directory", file));
        }
        ns.dirs.extend(missing);
        Ok(())
    }

    fn lock(&self, name: &Path) -> Result<Box<dyn FileLock>> {
        let path = normalize(name);
        let mut ns = self.ns();
        if ns.is_dir(&path) {
            return Err(io_error(io::ErrorKind::Other, "is a directory", &path));
        }
        if !ns.files.contains_key(&path) {
            if !ns.parent_is_dir(&path) {
                return Err(io_error(io::ErrorKind::NotFound, "no such directory", &path));
            }
            ns.files.insert(path.clone(), Node::empty());
        }
        if !ns.locks.insert(path.clone()) {
            return Err(Error::LockHeld(name.to_path_buf()));
        }

        debug!(path = %path.display(), "acquired in-memory lock");
        Ok(Box::new(MemLock {
            ns: self.ns.clone(),
            path,
        }))
    }
}

#[derive(Debug)]
struct MemLock {
    ns: Arc<Mutex<Namespace>>,
    path: PathBuf,
}

impl FileLock for MemLock {
    fn release(self: Box<Self>) -> Result<()> {
        debug!(path = %self.path.display(), "released in-memory lock");
        Ok(())
    }
}

impl Drop for MemLock {
    fn drop(&mut self) {
        let mut ns = self.ns.lock().unwrap_or_else(PoisonError::into_inner);
        ns.locks.remove(&self.path);
    }
}

#[derive(Debug)]
struct MemFile {
    path: PathBuf,
    node: Arc<RwLock<Node>>,
    pos: u64,
    closed: bool,
}

impl MemFile {
    fn new(path: PathBuf, node: Arc<RwLock<Node>>) -> Self {
        MemFile {
            path,
            node,
            pos: 0,
            closed: false,
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::Closed);
        }
        Ok(())
    }
}

impl File for MemFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<ReadAt> {
        self.check_open()?;
        let node = self.node.read().unwrap_or_else(PoisonError::into_inner);

        let n = match usize::try_from(offset) {
            Ok(start) if start < node.data.len() => {
                let n = buf.len().min(node.data.len() - start);
                buf[..n].copy_from_slice(&node.data[start..start + n]);
                n
            }
            _ => 0,
        };
        Ok(ReadAt::new(n, buf.len()))
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.check_open()?;
        let start = usize::try_from(self.pos)
            .map_err(|_| io_error(io::ErrorKind::InvalidInput, "write offset too large", &self.path))?;
        let end = start + buf.len();

        let mut node = self.node.write().unwrap_or_else(PoisonError::into_inner);
        if node.data.len() < end {
            node.data.resize(end, 0);
        }
        node.data[start..end].copy_from_slice(buf);
        node.modified = SystemTime::now();

        self.pos = end as u64;
        Ok(buf.len())
    }

    fn stat(&self) -> Result<FileInfo> {
        self.check_open()?;
        let node = self.node.read().unwrap_or_else(PoisonError::into_inner);
        Ok(FileInfo {
            len: node.data.len() as u64,
            modified: Some(node.modified),
            is_dir: false,
        })
    }

    fn close(&mut self) -> Result<()> {
        self.check_open()?;
        self.closed = true;
        Ok(())
    }
}
