// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Storage backend implementations for AgentFS Core
//!
//! Content lives in reference-counted blocks addressed by [`ContentId`].
//! A block is writable in place only while exactly one owner holds it and it
//! has not been sealed; everybody else must `clone_cow` first. Violating that
//! rule is a bug in the caller and panics instead of returning an error.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::MemoryPolicy;
use crate::error::{FsError, FsResult};
use crate::ContentId;

mod disk;
mod spill;

pub use disk::DiskBackend;
pub use spill::SpilloverBackend;

/// Byte accounting reported by a backend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StorageUsage {
    pub bytes_in_memory: u64,
    pub bytes_spilled: u64,
    pub blocks: usize,
}

/// Storage backend trait for content-addressable storage with copy-on-write
pub trait StorageBackend: Send + Sync {
    /// Reads up to `buf.len()` bytes at `offset`. Reads past the end return 0.
    fn read(&self, id: ContentId, offset: u64, buf: &mut [u8]) -> FsResult<usize>;
    /// Writes `data` at `offset`, zero-filling any gap past the current end.
    fn write(&self, id: ContentId, offset: u64, data: &[u8]) -> FsResult<usize>;
    fn truncate(&self, id: ContentId, new_len: u64) -> FsResult<()>;
    /// New block holding `initial`, with one reference.
    fn allocate(&self, initial: &[u8]) -> FsResult<ContentId>;
    /// New block whose bytes equal `base`, with one reference and decoupled
    /// from `base` for future writes.
    fn clone_cow(&self, base: ContentId) -> FsResult<ContentId>;
    /// Marks the block immutable for the rest of its life.
    fn seal(&self, id: ContentId) -> FsResult<()>;
    fn retain(&self, id: ContentId);
    /// Drops one reference; the block is freed when none remain.
    fn release(&self, id: ContentId);
    /// True when the block has a single owner and is not sealed.
    fn is_exclusive(&self, id: ContentId) -> bool;
    fn content_len(&self, id: ContentId) -> FsResult<u64>;
    fn usage(&self) -> StorageUsage;
}

/// Pick the backend for a memory policy: spillover when a budget is set,
/// an unbounded in-memory store otherwise.
pub fn create_backend(policy: &MemoryPolicy) -> FsResult<Arc<dyn StorageBackend>> {
    match policy.max_bytes_in_memory {
        None => Ok(Arc::new(InMemoryBackend::new())),
        Some(0) => Err(FsError::InvalidArgument),
        Some(budget) => Ok(Arc::new(SpilloverBackend::new(
            budget,
            policy.spill_directory.clone(),
        ))),
    }
}

pub(crate) struct Block<T> {
    refs: AtomicUsize,
    sealed: AtomicBool,
    pub(crate) data: Mutex<T>,
}

/// Reference counts and seal flags shared by every backend. `T` is the
/// backend-specific payload of a block.
pub(crate) struct BlockTable<T> {
    next_id: AtomicU64,
    blocks: RwLock<HashMap<ContentId, Arc<Block<T>>>>,
}

impl<T> BlockTable<T> {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            blocks: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn next_id(&self) -> ContentId {
        ContentId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn insert_with_id(&self, id: ContentId, data: T) {
        let block = Arc::new(Block {
            refs: AtomicUsize::new(1),
            sealed: AtomicBool::new(false),
            data: Mutex::new(data),
        });
        self.blocks.write().insert(id, block);
    }

    pub(crate) fn insert(&self, data: T) -> ContentId {
        let id = self.next_id();
        self.insert_with_id(id, data);
        id
    }

    pub(crate) fn get(&self, id: ContentId) -> FsResult<Arc<Block<T>>> {
        self.blocks.read().get(&id).cloned().ok_or(FsError::NotFound)
    }

    /// Block about to be mutated in place.
    pub(crate) fn get_writable(&self, id: ContentId, op: &str) -> FsResult<Arc<Block<T>>> {
        let block = self.get(id)?;
        assert!(
            !block.sealed.load(Ordering::Acquire),
            "{op} on sealed content {id}: clone_cow before mutating"
        );
        assert!(
            block.refs.load(Ordering::Acquire) <= 1,
            "{op} on shared content {id}: clone_cow before mutating"
        );
        Ok(block)
    }

    pub(crate) fn retain(&self, id: ContentId) {
        match self.blocks.read().get(&id) {
            Some(block) => {
                block.refs.fetch_add(1, Ordering::AcqRel);
            }
            None => tracing::error!(content = %id, "retain of unknown content"),
        }
    }

    /// Returns the block when the last reference went away.
    pub(crate) fn release(&self, id: ContentId) -> Option<Arc<Block<T>>> {
        let mut blocks = self.blocks.write();
        let Some(block) = blocks.get(&id) else {
            tracing::error!(content = %id, "release of unknown content");
            return None;
        };
        if block.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            blocks.remove(&id)
        } else {
            None
        }
    }

    pub(crate) fn seal(&self, id: ContentId) -> FsResult<()> {
        let block = self.get(id)?;
        block.sealed.store(true, Ordering::Release);
        Ok(())
    }

    pub(crate) fn is_exclusive(&self, id: ContentId) -> bool {
        self.blocks
            .read()
            .get(&id)
            .map(|b| b.refs.load(Ordering::Acquire) == 1 && !b.sealed.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    pub(crate) fn len(&self) -> usize {
        self.blocks.read().len()
    }
}

/// Copy the readable part of `src` starting at `offset` into `buf`.
pub(crate) fn copy_out(src: &[u8], offset: u64, buf: &mut [u8]) -> usize {
    let Ok(start) = usize::try_from(offset) else {
        return 0;
    };
    if start >= src.len() {
        return 0;
    }
    let n = buf.len().min(src.len() - start);
    buf[..n].copy_from_slice(&src[start..start + n]);
    n
}

/// End offset of a write, rejecting ranges the address space cannot hold.
pub(crate) fn write_end(offset: u64, len: usize) -> FsResult<u64> {
    offset.checked_add(len as u64).ok_or(FsError::InvalidArgument)
}

/// In-memory storage backend implementation.
///
/// `clone_cow` shares the buffer of its base; the bytes are copied by
/// whichever side writes first.
pub struct InMemoryBackend {
    table: BlockTable<Arc<Vec<u8>>>,
    used: AtomicU64,
    budget: Option<u64>,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            table: BlockTable::new(),
            used: AtomicU64::new(0),
            budget: None,
        }
    }

    /// Backend that fails with `NoSpace` once `budget` bytes are in use.
    pub fn with_budget(budget: u64) -> Self {
        Self {
            budget: Some(budget),
            ..Self::new()
        }
    }

    pub fn bytes_used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    fn reserve(&self, bytes: u64) -> FsResult<()> {
        let Some(budget) = self.budget else {
            self.used.fetch_add(bytes, Ordering::AcqRel);
            return Ok(());
        };
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(bytes).filter(|total| *total <= budget)
            })
            .map(|_| ())
            .map_err(|_| FsError::NoSpace)
    }

    fn unreserve(&self, bytes: u64) {
        self.used.fetch_sub(bytes, Ordering::AcqRel);
    }

    fn to_index(value: u64) -> FsResult<usize> {
        usize::try_from(value).map_err(|_| FsError::NoSpace)
    }

    /// Zero-extend `bytes` to `len`. An allocation the host cannot satisfy
    /// is `NoSpace`, and the reservation taken for it is returned.
    fn grow(&self, bytes: &mut Vec<u8>, len: usize) -> FsResult<()> {
        let extra = len - bytes.len();
        if let Err(err) = bytes.try_reserve_exact(extra) {
            self.unreserve(extra as u64);
            tracing::warn!(%err, requested = len, "memory block cannot grow");
            return Err(FsError::NoSpace);
        }
        bytes.resize(len, 0);
        Ok(())
    }
}

impl StorageBackend for InMemoryBackend {
    fn read(&self, id: ContentId, offset: u64, buf: &mut [u8]) -> FsResult<usize> {
        let block = self.table.get(id)?;
        let data = block.data.lock();
        Ok(copy_out(&data, offset, buf))
    }

    fn write(&self, id: ContentId, offset: u64, data: &[u8]) -> FsResult<usize> {
        let end = Self::to_index(write_end(offset, data.len())?)?;
        let block = self.table.get_writable(id, "write")?;
        let mut bytes = block.data.lock();
        if end > bytes.len() {
            self.reserve((end - bytes.len()) as u64)?;
        }
        let bytes = Arc::make_mut(&mut *bytes);
        if end > bytes.len() {
            self.grow(bytes, end)?;
        }
        bytes[end - data.len()..end].copy_from_slice(data);
        tracing::trace!(content = %id, offset, len = data.len(), "memory write");
        Ok(data.len())
    }

    fn truncate(&self, id: ContentId, new_len: u64) -> FsResult<()> {
        let new_len = Self::to_index(new_len)?;
        let block = self.table.get_writable(id, "truncate")?;
        let mut bytes = block.data.lock();
        let old_len = bytes.len();
        if new_len == old_len {
            return Ok(());
        }
        let bytes = Arc::make_mut(&mut *bytes);
        if new_len > old_len {
            self.reserve((new_len - old_len) as u64)?;
            self.grow(bytes, new_len)?;
        } else {
            self.unreserve((old_len - new_len) as u64);
            bytes.truncate(new_len);
        }
        Ok(())
    }

    fn allocate(&self, initial: &[u8]) -> FsResult<ContentId> {
        self.reserve(initial.len() as u64)?;
        Ok(self.table.insert(Arc::new(initial.to_vec())))
    }

    fn clone_cow(&self, base: ContentId) -> FsResult<ContentId> {
        let block = self.table.get(base)?;
        let shared = block.data.lock().clone();
        self.reserve(shared.len() as u64)?;
        Ok(self.table.insert(shared))
    }

    fn seal(&self, id: ContentId) -> FsResult<()> {
        self.table.seal(id)
    }

    fn retain(&self, id: ContentId) {
        self.table.retain(id);
    }

    fn release(&self, id: ContentId) {
        if let Some(block) = self.table.release(id) {
            let len = block.data.lock().len() as u64;
            self.unreserve(len);
        }
    }

    fn is_exclusive(&self, id: ContentId) -> bool {
        self.table.is_exclusive(id)
    }

    fn content_len(&self, id: ContentId) -> FsResult<u64> {
        let block = self.table.get(id)?;
        let len = block.data.lock().len() as u64;
        Ok(len)
    }

    fn usage(&self) -> StorageUsage {
        StorageUsage {
            bytes_in_memory: self.bytes_used(),
            bytes_spilled: 0,
            blocks: self.table.len(),
        }
    }
}

#[cfg(test)]
pub(crate) fn read_all(backend: &dyn StorageBackend, id: ContentId) -> Vec<u8> {
    let len = backend.content_len(id).expect("len") as usize;
    let mut buf = vec![0u8; len];
    let n = backend.read(id, 0, &mut buf).expect("read");
    buf.truncate(n);
    buf
}
