//! Local-filesystem backend: files under a root directory.
//!
//! Handles wrap `std::fs::File`; the OS cursor is the handle's
//! read/write position, so partial reads and writes surface naturally.
//! The OS gives no per-file reader/writer lock with the semantics the
//! broker needs, so the same in-process gate registry as the memory
//! backend provides it, keyed by resolved path.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{check_flags, lock_gate, FileHandle, Gate, StorageBackend};
use crate::protocol::{AccessMode, OpenFlags};

pub struct LocalDirBackend {
    root: PathBuf,
    gates: Mutex<HashMap<PathBuf, Arc<RwLock<()>>>>,
}

impl LocalDirBackend {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            gates: Mutex::new(HashMap::new()),
        }
    }

    fn path_for(&self, file: &Path) -> PathBuf {
        self.root.join(file)
    }

    fn gate_for(&self, path: &Path) -> Arc<RwLock<()>> {
        let mut gates = self.gates.lock().unwrap();
        gates.entry(path.to_path_buf()).or_default().clone()
    }
}

pub struct LocalFileHandle {
    file: fs::File,
    mode: AccessMode,
    _gate: Gate,
}

impl std::fmt::Debug for LocalFileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalFileHandle")
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl LocalFileHandle {
    fn require_write(&self) -> io::Result<()> {
        match self.mode {
            AccessMode::ReadWrite => Ok(()),
            AccessMode::ReadOnly => Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "handle is read-only",
            )),
        }
    }
}

#[async_trait]
impl StorageBackend for LocalDirBackend {
    type FileRef = PathBuf;
    type Handle = LocalFileHandle;

    async fn acquire(&self, file: &PathBuf, flags: OpenFlags) -> io::Result<LocalFileHandle> {
        check_flags(flags)?;
        let path = self.path_for(file);
        let mode = flags.access_mode();
        let gate = lock_gate(self.gate_for(&path), mode).await;

        let mut options = fs::OpenOptions::new();
        options
            .read(true)
            .write(mode == AccessMode::ReadWrite)
            .create(flags.contains(OpenFlags::CREATE))
            .create_new(flags.contains(OpenFlags::CREATE_NEW))
            .truncate(flags.contains(OpenFlags::TRUNCATE));
        let mut file = options.open(&path)?;
        if flags.contains(OpenFlags::APPEND) {
            file.seek(SeekFrom::End(0))?;
        }
        Ok(LocalFileHandle {
            file,
            mode,
            _gate: gate,
        })
    }
}

impl FileHandle for LocalFileHandle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.require_write()?;
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.mode == AccessMode::ReadWrite {
            self.file.sync_data()?;
        }
        Ok(())
    }

    fn truncate(&mut self, size: u64) -> io::Result<()> {
        self.require_write()?;
        self.file.set_len(size)?;
        if self.file.stream_position()? > size {
            self.file.seek(SeekFrom::Start(size))?;
        }
        Ok(())
    }

    fn close(self) -> io::Result<()> {
        if self.mode == AccessMode::ReadWrite {
            self.file.sync_all()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RW: OpenFlags = OpenFlags::CREATE.union(OpenFlags::WRITE);

    #[tokio::test]
    async fn write_then_reopen_and_read() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = LocalDirBackend::new(tmp.path());
        let name = PathBuf::from("data.bin");

        let mut h = backend.acquire(&name, RW).await.unwrap();
        h.write(b"local bytes").unwrap();
        h.flush().unwrap();
        h.close().unwrap();

        let mut h = backend.acquire(&name, OpenFlags::READ).await.unwrap();
        let mut buf = vec![0u8; 32];
        let n = h.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"local bytes");
        assert_eq!(h.read(&mut buf).unwrap(), 0);
        h.close().unwrap();
    }

    #[tokio::test]
    async fn create_new_fails_on_existing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = LocalDirBackend::new(tmp.path());
        let name = PathBuf::from("once");

        backend.acquire(&name, RW).await.unwrap().close().unwrap();
        let err = backend
            .acquire(&name, OpenFlags::CREATE_NEW | OpenFlags::WRITE)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    }

    #[tokio::test]
    async fn truncate_clamps_the_cursor() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = LocalDirBackend::new(tmp.path());
        let name = PathBuf::from("clamp");

        let mut h = backend.acquire(&name, RW).await.unwrap();
        h.write(b"0123456789").unwrap();
        h.truncate(4).unwrap();
        h.write(b"x").unwrap();
        h.close().unwrap();

        let mut h = backend.acquire(&name, OpenFlags::READ).await.unwrap();
        let mut buf = vec![0u8; 16];
        let n = h.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"0123x");
        h.close().unwrap();
    }

    #[tokio::test]
    async fn append_continues_at_end() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = LocalDirBackend::new(tmp.path());
        let name = PathBuf::from("log");

        let mut h = backend.acquire(&name, RW).await.unwrap();
        h.write(b"one").unwrap();
        h.close().unwrap();

        let mut h = backend
            .acquire(&name, OpenFlags::WRITE | OpenFlags::APPEND)
            .await
            .unwrap();
        h.write(b" two").unwrap();
        h.close().unwrap();

        let mut h = backend.acquire(&name, OpenFlags::READ).await.unwrap();
        let mut buf = vec![0u8; 16];
        let n = h.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"one two");
        h.close().unwrap();
    }
}
