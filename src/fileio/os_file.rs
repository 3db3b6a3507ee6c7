use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use tracing::instrument;

use super::{lock, File, FileInfo, FileLock, FileSystem, ReadAt};
use crate::error::{Error, Result};

/// [`FileSystem`] backed by the host operating system.
///
/// Stateless: every call goes straight to the OS, and nothing is cached
/// between calls.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsFileSystem;

impl OsFileSystem {
    pub fn new() -> Self {
        OsFileSystem
    }
}

impl FileSystem for OsFileSystem {
    #[instrument(skip(self), level = "trace")]
    fn create(&self, name: &Path) -> Result<Box<dyn File>> {
        let fd = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(name)?;
        Ok(Box::new(OsFile::new(name, fd)))
    }

    #[instrument(skip(self), level = "trace")]
    fn open(&self, name: &Path) -> Result<Box<dyn File>> {
        let fd = OpenOptions::new()
            .read(true)
            .write(true)
            .open(name)
            .map_err(|e| Error::at(e, name))?;
        Ok(Box::new(OsFile::new(name, fd)))
    }

    #[instrument(skip(self), level = "trace")]
    fn remove(&self, name: &Path) -> Result<()> {
        fs::remove_file(name).map_err(|e| Error::at(e, name))
    }

    #[instrument(skip(self), level = "trace")]
    fn list(&self, dir: &Path) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }

    #[instrument(skip(self), level = "trace")]
    fn mkdir_all(&self, dir: &Path) -> Result<()> {
        Ok(fs::create_dir_all(dir)?)
    }

    #[instrument(skip(self), level = "trace")]
    fn lock(&self, name: &Path) -> Result<Box<dyn FileLock>> {
        Ok(Box::new(lock::OsLock::acquire(name)?))
    }
}

/// A file opened through [`OsFileSystem`].
///
/// Writes go to an explicitly tracked position with positional I/O, so reads
/// at arbitrary offsets never move the write position.
#[derive(Debug)]
pub struct OsFile {
    path: PathBuf,
    fd: Option<fs::File>,
    pos: u64,
}

impl OsFile {
    fn new(path: &Path, fd: fs::File) -> Self {
        OsFile {
            path: path.to_path_buf(),
            fd: Some(fd),
            pos: 0,
        }
    }

    fn fd(&self) -> Result<&fs::File> {
        self.fd.as_ref().ok_or(Error::Closed)
    }
}

impl File for OsFile {
    #[instrument(skip(self, buf), fields(path = %self.path.display(), len = buf.len()), level = "trace")]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<ReadAt> {
        let fd = self.fd()?;

        let mut read = 0;
        while read < buf.len() {
            // Positions past i64::MAX are beyond any file the OS can hold.
            let Some(pos) = offset
                .checked_add(read as u64)
                .filter(|pos| *pos <= i64::MAX as u64)
            else {
                break;
            };
            match pread(fd, &mut buf[read..], pos) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Ok(ReadAt::new(read, buf.len()))
    }

    #[instrument(skip(self, buf), fields(path = %self.path.display(), len = buf.len()), level = "trace")]
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let fd = self.fd()?;
        pwrite_all(fd, buf, self.pos)?;
        self.pos += buf.len() as u64;
        Ok(buf.len())
    }

    fn stat(&self) -> Result<FileInfo> {
        let meta = self.fd()?.metadata()?;
        Ok(FileInfo {
            len: meta.len(),
            modified: meta.modified().ok(),
            is_dir: meta.is_dir(),
        })
    }

    #[instrument(skip(self), fields(path = %self.path.display()), level = "trace")]
    fn close(&mut self) -> Result<()> {
        match self.fd.take() {
            Some(fd) => {
                drop(fd);
                Ok(())
            }
            None => Err(Error::Closed),
        }
    }
}

#[cfg(unix)]
fn pread(fd: &fs::File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    fd.read_at(buf, offset)
}

#[cfg(unix)]
fn pwrite_all(fd: &fs::File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    fd.write_all_at(buf, offset)
}

#[cfg(windows)]
fn pread(fd: &fs::File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    fd.seek_read(buf, offset)
}

#[cfg(windows)]
fn pwrite_all(fd: &fs::File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match fd.seek_write(buf, offset) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => {
                buf = &buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_write_reopen_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a");
        let fs = OsFileSystem::new();

        let mut f = fs.create(&path).unwrap();
        assert_eq!(f.write(b"hello").unwrap(), 5);
        f.close().unwrap();

        let f = fs.open(&path).unwrap();
        let mut buf = [0u8; 5];
        let r = f.read_at(&mut buf, 0).unwrap();
        assert_eq!(r, ReadAt { n: 5, eof: false });
        assert_eq!(&buf, b"hello");

        fs.remove(&path).unwrap();
        assert!(matches!(fs.open(&path), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_read_does_not_move_write_position() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pos");
        let fs = OsFileSystem::new();

        let mut f = fs.create(&path).unwrap();
        f.write(b"abc").unwrap();
        let mut buf = [0u8; 1];
        f.read_at(&mut buf, 0).unwrap();
        f.write(b"def").unwrap();

        let mut buf = [0u8; 6];
        f.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"abcdef");
        assert_eq!(f.stat().unwrap().len, 6);
    }

    #[test]
    fn test_open_writes_from_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("overwrite");
        let fs = OsFileSystem::new();

        let mut f = fs.create(&path).unwrap();
        f.write(b"0123456789").unwrap();
        f.close().unwrap();

        let mut f = fs.open(&path).unwrap();
        f.write(b"ab").unwrap();
        let mut buf = [0u8; 10];
        f.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"ab23456789");
    }

    #[test]
    fn test_create_in_missing_dir_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let fs = OsFileSystem::new();
        let err = fs.create(&dir.path().join("nodir").join("a")).unwrap_err();
        assert!(matches!(err, Error::Io(e) if e.kind() == io::ErrorKind::NotFound));
    }

    #[test]
    fn test_read_at_huge_offset_is_eof() {
        let dir = tempfile::tempdir().unwrap();
        let fs = OsFileSystem::new();
        let mut f = fs.create(&dir.path().join("small")).unwrap();
        f.write(b"abc").unwrap();

        let mut buf = [0u8; 4];
        for offset in [i64::MAX as u64 - 1, i64::MAX as u64 + 1, u64::MAX - 1] {
            assert_eq!(f.read_at(&mut buf, offset).unwrap(), ReadAt { n: 0, eof: true });
        }
    }

    #[test]
    fn test_list_missing_dir_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let fs = OsFileSystem::new();
        assert!(matches!(
            fs.list(&dir.path().join("nope")),
            Err(Error::Io(_))
        ));
    }

    #[test]
    fn test_list_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain");
        let fs = OsFileSystem::new();
        fs.create(&path).unwrap().close().unwrap();
        assert!(matches!(fs.list(&path), Err(Error::Io(_))));
    }
}
