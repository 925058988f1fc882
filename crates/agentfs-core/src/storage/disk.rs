// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! File-per-block storage under a host directory

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tempfile::TempDir;

use super::{write_end, BlockTable, StorageBackend, StorageUsage};
use crate::error::{FsError, FsResult};
use crate::ContentId;

#[cfg(target_os = "macos")]
extern "C" {
    fn clonefile(
        src: *const libc::c_char,
        dst: *const libc::c_char,
        flags: libc::c_int,
    ) -> libc::c_int;
}

struct DiskBlock {
    path: PathBuf,
    len: u64,
}

/// Host filesystem storage backend. Each block is one file named after its
/// content id. Host failures surface as `Io`, a full disk as `NoSpace`.
pub struct DiskBackend {
    root: PathBuf,
    table: BlockTable<DiskBlock>,
    used: AtomicU64,
    // Private block directory, removed on drop.
    _temp: TempDir,
}

impl DiskBackend {
    /// Backend in a fresh private subdirectory of `parent`, so several
    /// instances can share one spill location.
    pub fn new(parent: PathBuf) -> FsResult<Self> {
        fs::create_dir_all(&parent).map_err(FsError::from_spill_io)?;
        let dir = tempfile::Builder::new()
            .prefix("agentfs-spill-")
            .tempdir_in(&parent)
            .map_err(FsError::from_spill_io)?;
        Ok(Self::in_dir(dir))
    }

    /// Backend rooted in a fresh private temporary directory.
    pub fn temporary() -> FsResult<Self> {
        let dir = tempfile::Builder::new()
            .prefix("agentfs-spill-")
            .tempdir()
            .map_err(FsError::from_spill_io)?;
        Ok(Self::in_dir(dir))
    }

    fn in_dir(dir: TempDir) -> Self {
        Self {
            root: dir.path().to_path_buf(),
            table: BlockTable::new(),
            used: AtomicU64::new(0),
            _temp: dir,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn bytes_used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    fn content_path(&self, id: ContentId) -> PathBuf {
        self.root.join(id.to_string())
    }

    fn resized(&self, old_len: u64, new_len: u64) {
        if new_len >= old_len {
            self.used.fetch_add(new_len - old_len, Ordering::AcqRel);
        } else {
            self.used.fetch_sub(old_len - new_len, Ordering::AcqRel);
        }
    }

    fn copy_file(from: &Path, to: &Path) -> std::io::Result<()> {
        #[cfg(target_os = "macos")]
        {
            use std::ffi::CString;
            use std::os::unix::ffi::OsStrExt;

            if let (Ok(src), Ok(dst)) = (
                CString::new(from.as_os_str().as_bytes()),
                CString::new(to.as_os_str().as_bytes()),
            ) {
                // SAFETY: both pointers come from live NUL-terminated CStrings.
                if unsafe { clonefile(src.as_ptr(), dst.as_ptr(), 0) } == 0 {
                    return Ok(());
                }
            }
        }
        fs::copy(from, to).map(|_| ())
    }
}

impl StorageBackend for DiskBackend {
    fn read(&self, id: ContentId, offset: u64, buf: &mut [u8]) -> FsResult<usize> {
        let block = self.table.get(id)?;
        let data = block.data.lock();
        if offset >= data.len || buf.is_empty() {
            return Ok(0);
        }
        let want = buf.len().min((data.len - offset) as usize);
        let mut file = File::open(&data.path).map_err(FsError::from_spill_io)?;
        file.seek(SeekFrom::Start(offset)).map_err(FsError::from_spill_io)?;
        let mut filled = 0;
        while filled < want {
            let n = file.read(&mut buf[filled..want]).map_err(FsError::from_spill_io)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    fn write(&self, id: ContentId, offset: u64, data: &[u8]) -> FsResult<usize> {
        let end = write_end(offset, data.len())?;
        let block = self.table.get_writable(id, "write")?;
        let mut meta = block.data.lock();
        let mut file = OpenOptions::new()
            .write(true)
            .open(&meta.path)
            .map_err(FsError::from_spill_io)?;
        file.seek(SeekFrom::Start(offset)).map_err(FsError::from_spill_io)?;
        file.write_all(data).map_err(FsError::from_spill_io)?;
        if end > meta.len {
            self.resized(meta.len, end);
            meta.len = end;
        }
        tracing::trace!(content = %id, offset, len = data.len(), "disk write");
        Ok(data.len())
    }

    fn truncate(&self, id: ContentId, new_len: u64) -> FsResult<()> {
        let block = self.table.get_writable(id, "truncate")?;
        let mut meta = block.data.lock();
        let file = OpenOptions::new()
            .write(true)
            .open(&meta.path)
            .map_err(FsError::from_spill_io)?;
        file.set_len(new_len).map_err(FsError::from_spill_io)?;
        self.resized(meta.len, new_len);
        meta.len = new_len;
        Ok(())
    }

    fn allocate(&self, initial: &[u8]) -> FsResult<ContentId> {
        let id = self.table.next_id();
        let path = self.content_path(id);
        fs::write(&path, initial).map_err(|err| {
            let _ = fs::remove_file(&path);
            FsError::from_spill_io(err)
        })?;
        let len = initial.len() as u64;
        self.resized(0, len);
        self.table.insert_with_id(id, DiskBlock { path, len });
        Ok(id)
    }

    fn clone_cow(&self, base: ContentId) -> FsResult<ContentId> {
        let block = self.table.get(base)?;
        let source = block.data.lock();
        let id = self.table.next_id();
        let path = self.content_path(id);
        Self::copy_file(&source.path, &path).map_err(FsError::from_spill_io)?;
        self.resized(0, source.len);
        self.table.insert_with_id(
            id,
            DiskBlock {
                path,
                len: source.len,
            },
        );
        Ok(id)
    }

    fn seal(&self, id: ContentId) -> FsResult<()> {
        self.table.seal(id)
    }

    fn retain(&self, id: ContentId) {
        self.table.retain(id);
    }

    fn release(&self, id: ContentId) {
        let Some(block) = self.table.release(id) else {
            return;
        };
        let data = block.data.lock();
        self.resized(data.len, 0);
        if let Err(err) = fs::remove_file(&data.path) {
            tracing::warn!(content = %id, path = %data.path.display(), %err, "failed to remove spilled block");
        }
    }

    fn is_exclusive(&self, id: ContentId) -> bool {
        self.table.is_exclusive(id)
    }

    fn content_len(&self, id: ContentId) -> FsResult<u64> {
        let block = self.table.get(id)?;
        let len = block.data.lock().len;
        Ok(len)
    }

    fn usage(&self) -> StorageUsage {
        StorageUsage {
            bytes_in_memory: 0,
            bytes_spilled: self.bytes_used(),
            blocks: self.table.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::read_all;

    #[test]
    fn blocks_are_files_under_root() {
        let dir = tempfile::tempdir().unwrap();
        let backend = DiskBackend::new(dir.path().join("spill")).unwrap();

        let id = backend.allocate(b"hello world").unwrap();
        assert!(backend.root().join(id.to_string()).exists());

        backend.write(id, 6, b"AgentFS").unwrap();
        assert_eq!(read_all(&backend, id), b"hello AgentFS");
        assert_eq!(backend.bytes_used(), 13);

        backend.truncate(id, 5).unwrap();
        assert_eq!(read_all(&backend, id), b"hello");
        assert_eq!(backend.usage().bytes_spilled, 5);

        backend.release(id);
        assert!(!backend.root().join(id.to_string()).exists());
        assert_eq!(backend.bytes_used(), 0);
    }

    #[test]
    fn backends_sharing_a_parent_keep_separate_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let first = DiskBackend::new(dir.path().to_path_buf()).unwrap();
        let second = DiskBackend::new(dir.path().to_path_buf()).unwrap();
        assert_ne!(first.root(), second.root());
        assert!(first.root().starts_with(dir.path()));

        // Both tables start from the same counter, so ids collide.
        let a = first.allocate(b"first").unwrap();
        let b = second.allocate(b"second").unwrap();
        assert_eq!(a, b);
        assert_eq!(read_all(&first, a), b"first");
        assert_eq!(read_all(&second, b), b"second");

        let private = first.root().to_path_buf();
        drop(first);
        assert!(!private.exists());
        assert!(dir.path().exists());
        assert_eq!(read_all(&second, b), b"second");
    }

    #[test]
    fn clone_is_decoupled() {
        let backend = DiskBackend::temporary().unwrap();
        let base = backend.allocate(b"original").unwrap();
        let copy = backend.clone_cow(base).unwrap();
        backend.write(copy, 0, b"modified").unwrap();
        assert_eq!(read_all(&backend, base), b"original");
        assert_eq!(read_all(&backend, copy), b"modified");
    }

    #[test]
    fn temporary_root_is_removed_on_drop() {
        let backend = DiskBackend::temporary().unwrap();
        let root = backend.root().to_path_buf();
        backend.allocate(b"x").unwrap();
        assert!(root.exists());
        drop(backend);
        assert!(!root.exists());
    }

    #[test]
    fn read_past_end_and_sparse_write() {
        let backend = DiskBackend::temporary().unwrap();
        let id = backend.allocate(b"ab").unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(backend.read(id, 9, &mut buf).unwrap(), 0);
        backend.write(id, 4, b"cd").unwrap();
        assert_eq!(read_all(&backend, id), b"ab\0\0cd");
    }
}
