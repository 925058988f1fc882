// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Memory-first storage that migrates blocks to disk under memory pressure

use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;

use super::{BlockTable, DiskBackend, InMemoryBackend, StorageBackend, StorageUsage};
use crate::error::{FsError, FsResult};
use crate::ContentId;

#[derive(Clone, Copy, Debug)]
enum Placement {
    Memory(ContentId),
    Disk(ContentId),
}

/// Blocks start in memory. When an allocation, clone, write or truncate
/// would push the memory tier past its budget, the affected block moves to
/// a file in the spill directory and the operation completes there.
///
/// Reference counts and seal flags are tracked here; the tier blocks behind
/// each placement always have a single owner.
pub struct SpilloverBackend {
    memory: InMemoryBackend,
    spill_directory: Option<PathBuf>,
    disk: Mutex<Option<Arc<DiskBackend>>>,
    table: BlockTable<Placement>,
}

impl SpilloverBackend {
    pub fn new(max_bytes_in_memory: u64, spill_directory: Option<PathBuf>) -> Self {
        Self {
            memory: InMemoryBackend::with_budget(max_bytes_in_memory),
            spill_directory,
            disk: Mutex::new(None),
            table: BlockTable::new(),
        }
    }

    /// The disk tier is created on first spill.
    fn disk(&self) -> FsResult<Arc<DiskBackend>> {
        let mut disk = self.disk.lock();
        if let Some(existing) = disk.as_ref() {
            return Ok(existing.clone());
        }
        let backend = match &self.spill_directory {
            Some(dir) => DiskBackend::new(dir.clone())?,
            None => DiskBackend::temporary()?,
        };
        tracing::debug!(root = %backend.root().display(), "spill directory ready");
        let backend = Arc::new(backend);
        *disk = Some(backend.clone());
        Ok(backend)
    }

    fn with_tier<R>(
        &self,
        placement: Placement,
        op: impl FnOnce(&dyn StorageBackend, ContentId) -> FsResult<R>,
    ) -> FsResult<R> {
        match placement {
            Placement::Memory(inner) => op(&self.memory, inner),
            Placement::Disk(inner) => op(self.disk()?.as_ref(), inner),
        }
    }

    fn memory_bytes(&self, inner: ContentId) -> FsResult<Vec<u8>> {
        let len = self.memory.content_len(inner)?;
        let mut bytes = vec![0u8; usize::try_from(len).map_err(|_| FsError::NoSpace)?];
        let n = self.memory.read(inner, 0, &mut bytes)?;
        bytes.truncate(n);
        Ok(bytes)
    }

    /// Move a memory block to disk and return its disk id.
    fn spill(&self, inner: ContentId) -> FsResult<ContentId> {
        let bytes = self.memory_bytes(inner)?;
        let on_disk = self.disk()?.allocate(&bytes)?;
        self.memory.release(inner);
        tracing::debug!(bytes = bytes.len(), "spilled block to disk");
        Ok(on_disk)
    }

    /// Run `op` against the tier holding the block, spilling and retrying
    /// on disk once if the memory tier is out of budget.
    fn mutate<R>(
        &self,
        id: ContentId,
        what: &str,
        op: impl Fn(&dyn StorageBackend, ContentId) -> FsResult<R>,
    ) -> FsResult<R> {
        let block = self.table.get_writable(id, what)?;
        let mut placement = block.data.lock();
        let current = *placement;
        match current {
            Placement::Memory(inner) => match op(&self.memory, inner) {
                Err(FsError::NoSpace) => {
                    let on_disk = self.spill(inner)?;
                    *placement = Placement::Disk(on_disk);
                    op(self.disk()?.as_ref(), on_disk)
                }
                other => other,
            },
            Placement::Disk(inner) => op(self.disk()?.as_ref(), inner),
        }
    }
}

impl StorageBackend for SpilloverBackend {
    fn read(&self, id: ContentId, offset: u64, buf: &mut [u8]) -> FsResult<usize> {
        let block = self.table.get(id)?;
        let placement = block.data.lock();
        self.with_tier(*placement, |tier, inner| tier.read(inner, offset, buf))
    }

    fn write(&self, id: ContentId, offset: u64, data: &[u8]) -> FsResult<usize> {
        self.mutate(id, "write", |tier, inner| tier.write(inner, offset, data))
    }

    fn truncate(&self, id: ContentId, new_len: u64) -> FsResult<()> {
        self.mutate(id, "truncate", |tier, inner| tier.truncate(inner, new_len))
    }

    fn allocate(&self, initial: &[u8]) -> FsResult<ContentId> {
        let placement = match self.memory.allocate(initial) {
            Ok(inner) => Placement::Memory(inner),
            Err(FsError::NoSpace) => Placement::Disk(self.disk()?.allocate(initial)?),
            Err(err) => return Err(err),
        };
        Ok(self.table.insert(placement))
    }

    fn clone_cow(&self, base: ContentId) -> FsResult<ContentId> {
        let block = self.table.get(base)?;
        let source = *block.data.lock();
        let placement = match source {
            Placement::Memory(inner) => match self.memory.clone_cow(inner) {
                Ok(copy) => Placement::Memory(copy),
                Err(FsError::NoSpace) => {
                    let bytes = self.memory_bytes(inner)?;
                    Placement::Disk(self.disk()?.allocate(&bytes)?)
                }
                Err(err) => return Err(err),
            },
            Placement::Disk(inner) => Placement::Disk(self.disk()?.clone_cow(inner)?),
        };
        Ok(self.table.insert(placement))
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
        let placement = *block.data.lock();
        match placement {
            Placement::Memory(inner) => self.memory.release(inner),
            Placement::Disk(inner) => match self.disk() {
                Ok(disk) => disk.release(inner),
                Err(err) => tracing::warn!(content = %id, %err, "spill tier unavailable on release"),
            },
        }
    }

    fn is_exclusive(&self, id: ContentId) -> bool {
        self.table.is_exclusive(id)
    }

    fn content_len(&self, id: ContentId) -> FsResult<u64> {
        let block = self.table.get(id)?;
        let placement = *block.data.lock();
        self.with_tier(placement, |tier, inner| tier.content_len(inner))
    }

    fn usage(&self) -> StorageUsage {
        let bytes_spilled = self
            .disk
            .lock()
            .as_ref()
            .map(|disk| disk.bytes_used())
            .unwrap_or(0);
        StorageUsage {
            bytes_in_memory: self.memory.bytes_used(),
            bytes_spilled,
            blocks: self.table.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::read_all;

    #[test]
    fn small_blocks_stay_in_memory() {
        let backend = SpilloverBackend::new(1024, None);
        let id = backend.allocate(b"hello").unwrap();
        backend.write(id, 5, b" world").unwrap();
        assert_eq!(read_all(&backend, id), b"hello world");
        let usage = backend.usage();
        assert_eq!(usage.bytes_in_memory, 11);
        assert_eq!(usage.bytes_spilled, 0);
    }

    #[test]
    fn growing_write_spills_transparently() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SpilloverBackend::new(16, Some(dir.path().to_path_buf()));
        let id = backend.allocate(b"0123456789").unwrap();

        let payload = vec![b'x'; 64];
        backend.write(id, 10, &payload).unwrap();

        let mut expected = b"0123456789".to_vec();
        expected.extend_from_slice(&payload);
        assert_eq!(read_all(&backend, id), expected);

        let usage = backend.usage();
        assert_eq!(usage.bytes_in_memory, 0);
        assert_eq!(usage.bytes_spilled, 74);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn oversized_allocation_goes_straight_to_disk() {
        let backend = SpilloverBackend::new(4, None);
        let id = backend.allocate(b"larger than four").unwrap();
        assert_eq!(backend.content_len(id).unwrap(), 16);
        assert_eq!(backend.usage().bytes_spilled, 16);

        backend.release(id);
        assert_eq!(backend.usage().bytes_spilled, 0);
        assert_eq!(backend.usage().blocks, 0);
    }

    #[test]
    fn clone_under_pressure_lands_on_disk() {
        let backend = SpilloverBackend::new(8, None);
        let base = backend.allocate(b"12345678").unwrap();
        let copy = backend.clone_cow(base).unwrap();
        backend.write(copy, 0, b"abcd").unwrap();

        assert_eq!(read_all(&backend, base), b"12345678");
        assert_eq!(read_all(&backend, copy), b"abcd5678");
        assert_eq!(backend.usage().bytes_in_memory, 8);
        assert_eq!(backend.usage().bytes_spilled, 8);
    }

    #[test]
    fn seal_and_refcounts_are_tracked_above_tiers() {
        let backend = SpilloverBackend::new(8, None);
        let id = backend.allocate(b"x").unwrap();
        assert!(backend.is_exclusive(id));
        backend.retain(id);
        assert!(!backend.is_exclusive(id));
        backend.release(id);
        backend.seal(id).unwrap();
        assert!(!backend.is_exclusive(id));
    }
}
