// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Open handle table, share-mode admission and byte-range locks

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::branches::Branch;
use crate::error::{FsError, FsResult};
use crate::tree::NodeId;
use crate::{BranchId, HandleId, LockKind, LockRange, OpenOptions, ShareMode};

/// A node as seen by the handle table: the same node id in two branches is
/// two different files.
pub(crate) type NodeKey = (BranchId, NodeId);

/// State behind one open handle. The branch and node are fixed at open
/// time and never retargeted.
pub(crate) struct OpenFile {
    pub(crate) branch: Arc<Branch>,
    pub(crate) node: NodeId,
    /// Stream key, empty for the primary content.
    pub(crate) stream: String,
    /// Path at open time, reported in events for handle operations.
    pub(crate) path: String,
    pub(crate) options: OpenOptions,
}

impl OpenFile {
    pub(crate) fn key(&self) -> NodeKey {
        (self.branch.id, self.node)
    }

    pub(crate) fn can_write(&self) -> bool {
        self.options.write || self.options.append
    }
}

#[derive(Clone, Copy, Debug)]
struct HeldLock {
    handle: HandleId,
    range: LockRange,
}

impl HeldLock {
    fn conflicts(&self, other: &LockRange) -> bool {
        let (Some(end), Some(other_end)) = (self.range.end(), other.end()) else {
            return false;
        };
        let overlap = self.range.offset < other_end && other.offset < end;
        overlap && (self.range.kind == LockKind::Exclusive || other.kind == LockKind::Exclusive)
    }
}

fn accesses(options: &OpenOptions) -> [(bool, ShareMode); 3] {
    [
        (options.read, ShareMode::Read),
        (options.write || options.append || options.truncate, ShareMode::Write),
        (options.delete, ShareMode::Delete),
    ]
}

/// Windows admission: each side must share every access the other holds.
fn share_conflict(held: &OpenOptions, wanted: &OpenOptions) -> bool {
    let refused_by = |owner: &OpenOptions, requester: &OpenOptions| {
        accesses(requester)
            .iter()
            .any(|(want, mode)| *want && !owner.shares(*mode))
    };
    refused_by(held, wanted) || refused_by(wanted, held)
}

#[derive(Default)]
struct HandleState {
    handles: HashMap<HandleId, Arc<OpenFile>>,
    by_node: HashMap<NodeKey, Vec<HandleId>>,
    locks: HashMap<NodeKey, Vec<HeldLock>>,
    next_id: u64,
}

pub(crate) struct HandleTable {
    state: Mutex<HandleState>,
    max_open: usize,
}

/// Everything needed to register a new handle.
pub(crate) struct OpenRequest {
    pub(crate) branch: Arc<Branch>,
    pub(crate) node: NodeId,
    pub(crate) stream: String,
    pub(crate) path: String,
    pub(crate) options: OpenOptions,
}

impl HandleTable {
    pub(crate) fn new(max_open: u32) -> Self {
        Self {
            state: Mutex::new(HandleState {
                next_id: 1,
                ..HandleState::default()
            }),
            max_open: max_open as usize,
        }
    }

    /// Admit a new handle against every handle already open on the node.
    pub(crate) fn open(&self, request: OpenRequest) -> FsResult<HandleId> {
        let mut state = self.state.lock();
        if state.handles.len() >= self.max_open {
            return Err(FsError::TooManyOpenFiles);
        }
        let key = (request.branch.id, request.node);
        if let Some(existing) = state.by_node.get(&key) {
            for handle in existing {
                let held = &state.handles[handle];
                if share_conflict(&held.options, &request.options) {
                    tracing::debug!(node = %request.node, path = %request.path, held = handle.0, "share mode conflict");
                    return Err(FsError::Busy);
                }
            }
        }

        let id = HandleId::new(state.next_id);
        state.next_id += 1;
        let file = Arc::new(OpenFile {
            branch: request.branch,
            node: request.node,
            stream: request.stream,
            path: request.path,
            options: request.options,
        });
        state.by_node.entry(key).or_default().push(id);
        state.handles.insert(id, file);
        Ok(id)
    }

    pub(crate) fn get(&self, id: HandleId) -> FsResult<Arc<OpenFile>> {
        self.state
            .lock()
            .handles
            .get(&id)
            .cloned()
            .ok_or(FsError::BadFileDescriptor)
    }

    /// Remove a handle together with its byte-range locks. Returns the
    /// handle and whether it was the last one open on its node.
    pub(crate) fn close(&self, id: HandleId) -> FsResult<(Arc<OpenFile>, bool)> {
        let mut state = self.state.lock();
        let file = state.handles.remove(&id).ok_or(FsError::BadFileDescriptor)?;
        let key = file.key();

        let last = match state.by_node.get_mut(&key) {
            Some(open) => {
                open.retain(|h| *h != id);
                open.is_empty()
            }
            None => true,
        };
        if last {
            state.by_node.remove(&key);
        }
        if let Some(locks) = state.locks.get_mut(&key) {
            locks.retain(|lock| lock.handle != id);
            if locks.is_empty() {
                state.locks.remove(&key);
            }
        }
        Ok((file, last))
    }

    pub(crate) fn is_open(&self, key: NodeKey) -> bool {
        self.state.lock().by_node.contains_key(&key)
    }

    /// `Busy` when some handle on the node refuses delete sharing.
    pub(crate) fn check_delete(&self, key: NodeKey) -> FsResult<()> {
        let state = self.state.lock();
        let Some(open) = state.by_node.get(&key) else {
            return Ok(());
        };
        if open
            .iter()
            .any(|h| !state.handles[h].options.shares(ShareMode::Delete))
        {
            return Err(FsError::Busy);
        }
        Ok(())
    }

    pub(crate) fn lock(&self, id: HandleId, range: LockRange) -> FsResult<()> {
        range.end().ok_or(FsError::InvalidArgument)?;
        let mut state = self.state.lock();
        let key = state
            .handles
            .get(&id)
            .ok_or(FsError::BadFileDescriptor)?
            .key();
        let held = state.locks.entry(key).or_default();
        if held.iter().any(|lock| lock.conflicts(&range)) {
            return Err(FsError::Busy);
        }
        held.push(HeldLock { handle: id, range });
        Ok(())
    }

    /// Release exactly `range` as previously locked through `id`. Unlocking
    /// a range that is not held is a no-op.
    pub(crate) fn unlock(&self, id: HandleId, range: LockRange) -> FsResult<()> {
        range.end().ok_or(FsError::InvalidArgument)?;
        let mut state = self.state.lock();
        let key = state
            .handles
            .get(&id)
            .ok_or(FsError::BadFileDescriptor)?
            .key();
        if let Some(held) = state.locks.get_mut(&key) {
            if let Some(pos) = held.iter().position(|lock| {
                lock.handle == id && lock.range.offset == range.offset && lock.range.len == range.len
            }) {
                held.remove(pos);
            }
            if held.is_empty() {
                state.locks.remove(&key);
            }
        }
        Ok(())
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().handles.len()
    }
}
