//! In-memory backend: named byte buffers behind per-file locks.
//!
//! The lock discipline is the point of this backend: a read-write
//! acquisition is exclusive, read-only acquisitions are shared, and a
//! conflicting `acquire` suspends until the holding handle is released.
//! Most of the crate's tests run against it.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{check_flags, lock_gate, FileHandle, Gate, StorageBackend};
use crate::protocol::{AccessMode, OpenFlags};

#[derive(Clone, Default)]
struct MemFile {
    data: Arc<Mutex<Vec<u8>>>,
    gate: Arc<tokio::sync::RwLock<()>>,
}

/// Backend keeping files in memory, keyed by name.
#[derive(Default)]
pub struct MemoryBackend {
    files: Mutex<HashMap<String, MemFile>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a file's contents, for inspection in tests and tools.
    pub fn contents(&self, name: &str) -> Option<Vec<u8>> {
        let files = self.files.lock().unwrap();
        files.get(name).map(|f| f.data.lock().unwrap().clone())
    }
}

pub struct MemoryHandle {
    data: Arc<Mutex<Vec<u8>>>,
    mode: AccessMode,
    pos: u64,
    _gate: Gate,
}

impl std::fmt::Debug for MemoryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryHandle")
            .field("mode", &self.mode)
            .field("pos", &self.pos)
            .finish_non_exhaustive()
    }
}

impl MemoryHandle {
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
impl StorageBackend for MemoryBackend {
    type FileRef = String;
    type Handle = MemoryHandle;

    async fn acquire(&self, file: &String, flags: OpenFlags) -> io::Result<MemoryHandle> {
        check_flags(flags)?;
        let node = {
            let mut files = self.files.lock().unwrap();
            match files.get(file) {
                Some(_) if flags.contains(OpenFlags::CREATE_NEW) => {
                    return Err(io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        format!("file already exists: {file}"),
                    ));
                }
                Some(node) => node.clone(),
                None if flags.intersects(OpenFlags::CREATE | OpenFlags::CREATE_NEW) => {
                    let node = MemFile::default();
                    files.insert(file.clone(), node.clone());
                    node
                }
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("no such file: {file}"),
                    ));
                }
            }
        };

        let mode = flags.access_mode();
        // suspension point: waits for the holding handle to be released
        let gate = lock_gate(node.gate.clone(), mode).await;

        if flags.contains(OpenFlags::TRUNCATE) {
            node.data.lock().unwrap().clear();
        }
        let pos = if flags.contains(OpenFlags::APPEND) {
            node.data.lock().unwrap().len() as u64
        } else {
            0
        };
        Ok(MemoryHandle {
            data: node.data,
            mode,
            pos,
            _gate: gate,
        })
    }
}

impl FileHandle for MemoryHandle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let data = self.data.lock().unwrap();
        let pos = (self.pos as usize).min(data.len());
        let n = buf.len().min(data.len() - pos);
        buf[..n].copy_from_slice(&data[pos..pos + n]);
        self.pos += n as u64;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.require_write()?;
        let mut data = self.data.lock().unwrap();
        let pos = self.pos as usize;
        let end = pos + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[pos..end].copy_from_slice(buf);
        self.pos = end as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn truncate(&mut self, size: u64) -> io::Result<()> {
        self.require_write()?;
        self.data.lock().unwrap().resize(size as usize, 0);
        self.pos = self.pos.min(size);
        Ok(())
    }

    fn close(self) -> io::Result<()> {
        Ok(())
    }
}
