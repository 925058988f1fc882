// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Branch and snapshot registry
//!
//! Lock order: a branch head is always taken before the registry. Nothing
//! locks a head while holding the registry.

use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::config::FsLimits;
use crate::error::{FsError, FsResult};
use crate::events::EventBus;
use crate::tree::{NodeId, Tree};
use crate::{BranchId, BranchInfo, EventKind, SnapshotId, SnapshotInfo};

pub(crate) const DEFAULT_BRANCH_NAME: &str = "default";

/// Mutable state of a branch, guarded by the branch lock.
#[derive(Clone)]
pub(crate) struct BranchHead {
    pub(crate) tree: Tree,
    /// Unlinked nodes kept alive by open handles.
    pub(crate) orphans: BTreeSet<NodeId>,
}

impl BranchHead {
    /// Seal the live content and return the revision a snapshot or a new
    /// branch should start from. Orphans are left out.
    fn freeze(&self) -> FsResult<Tree> {
        let frozen = self.tree.without(self.orphans.iter().copied());
        let sealed = frozen.seal()?;
        tracing::trace!(nodes = frozen.len(), sealed, "revision frozen");
        Ok(frozen)
    }
}

pub(crate) struct Branch {
    pub(crate) id: BranchId,
    pub(crate) name: Option<String>,
    pub(crate) parent: Option<SnapshotId>,
    head: Mutex<BranchHead>,
}

impl Branch {
    pub(crate) fn new(
        id: BranchId,
        name: Option<String>,
        parent: Option<SnapshotId>,
        tree: Tree,
    ) -> Self {
        Self {
            id,
            name,
            parent,
            head: Mutex::new(BranchHead {
                tree,
                orphans: BTreeSet::new(),
            }),
        }
    }

    pub(crate) fn head(&self) -> MutexGuard<'_, BranchHead> {
        self.head.lock()
    }

    /// Current revision. Readers work on this copy without holding the lock.
    pub(crate) fn current(&self) -> Tree {
        self.head.lock().tree.clone()
    }

    pub(crate) fn info(&self) -> BranchInfo {
        BranchInfo {
            id: self.id,
            parent: self.parent,
            name: self.name.clone(),
        }
    }
}

pub(crate) struct Snapshot {
    pub(crate) id: SnapshotId,
    pub(crate) name: Option<String>,
    pub(crate) branch: BranchId,
    pub(crate) tree: Tree,
}

impl Snapshot {
    pub(crate) fn info(&self) -> SnapshotInfo {
        SnapshotInfo {
            id: self.id,
            name: self.name.clone(),
            branch: self.branch,
        }
    }
}

#[derive(Default)]
struct Registry {
    branches: BTreeMap<BranchId, Arc<Branch>>,
    snapshots: BTreeMap<SnapshotId, Arc<Snapshot>>,
}

pub(crate) struct BranchManager {
    registry: RwLock<Registry>,
    limits: FsLimits,
    events: Arc<EventBus>,
}

impl BranchManager {
    /// Registry holding only the default branch, rooted at `initial`.
    pub(crate) fn new(initial: Tree, limits: FsLimits, events: Arc<EventBus>) -> Self {
        let default = Branch::new(
            BranchId::DEFAULT,
            Some(DEFAULT_BRANCH_NAME.to_owned()),
            None,
            initial,
        );
        let mut registry = Registry::default();
        registry.branches.insert(BranchId::DEFAULT, Arc::new(default));
        Self {
            registry: RwLock::new(registry),
            limits,
            events,
        }
    }

    pub(crate) fn branch(&self, id: BranchId) -> FsResult<Arc<Branch>> {
        self.registry
            .read()
            .branches
            .get(&id)
            .cloned()
            .ok_or(FsError::NotFound)
    }

    pub(crate) fn snapshot(&self, id: SnapshotId) -> FsResult<Arc<Snapshot>> {
        self.registry
            .read()
            .snapshots
            .get(&id)
            .cloned()
            .ok_or(FsError::NotFound)
    }

    /// Run `f` while `id` is guaranteed to stay registered.
    pub(crate) fn with_branch<R>(&self, id: BranchId, f: impl FnOnce(&Arc<Branch>) -> R) -> FsResult<R> {
        let registry = self.registry.read();
        let branch = registry.branches.get(&id).ok_or(FsError::NotFound)?;
        Ok(f(branch))
    }

    pub(crate) fn snapshot_create(&self, branch: &Arc<Branch>, name: Option<&str>) -> FsResult<SnapshotInfo> {
        let head = branch.head();
        if self.registry.read().snapshots.len() >= self.limits.max_snapshots as usize {
            return Err(FsError::NoSpace);
        }
        let snapshot = Arc::new(Snapshot {
            id: SnapshotId::new(),
            name: name.map(str::to_owned),
            branch: branch.id,
            tree: head.freeze()?,
        });
        let info = snapshot.info();
        {
            let mut registry = self.registry.write();
            if registry.snapshots.len() >= self.limits.max_snapshots as usize {
                return Err(FsError::NoSpace);
            }
            registry.snapshots.insert(snapshot.id, snapshot);
        }
        tracing::debug!(snapshot = %info.id, branch = %branch.id, name = ?info.name, "snapshot created");
        self.events.emit_with(|| EventKind::SnapshotCreated {
            id: info.id,
            name: info.name.clone(),
        });
        drop(head);
        Ok(info)
    }

    pub(crate) fn snapshot_delete(&self, id: SnapshotId) -> FsResult<()> {
        let removed = self.registry.write().snapshots.remove(&id);
        if removed.is_none() {
            return Err(FsError::NotFound);
        }
        tracing::debug!(snapshot = %id, "snapshot deleted");
        self.events.emit_with(|| EventKind::SnapshotDeleted { id });
        Ok(())
    }

    pub(crate) fn branch_create_from_snapshot(
        &self,
        snapshot: SnapshotId,
        name: Option<&str>,
    ) -> FsResult<BranchInfo> {
        let source = self.snapshot(snapshot)?;
        let branch = Branch::new(
            BranchId::new(),
            name.map(str::to_owned),
            Some(snapshot),
            source.tree.clone(),
        );
        self.register_branch(branch)
    }

    /// Fork the live state of `source`. Its content is sealed so both sides
    /// copy on their next write.
    pub(crate) fn branch_create_from_branch(
        &self,
        source: &Arc<Branch>,
        name: Option<&str>,
    ) -> FsResult<BranchInfo> {
        let head = source.head();
        let branch = Branch::new(BranchId::new(), name.map(str::to_owned), None, head.freeze()?);
        let info = self.register_branch(branch)?;
        drop(head);
        Ok(info)
    }

    fn register_branch(&self, branch: Branch) -> FsResult<BranchInfo> {
        let info = branch.info();
        {
            let mut registry = self.registry.write();
            if registry.branches.len() >= self.limits.max_branches as usize {
                return Err(FsError::NoSpace);
            }
            registry.branches.insert(branch.id, Arc::new(branch));
        }
        tracing::debug!(branch = %info.id, parent = ?info.parent, name = ?info.name, "branch created");
        self.events.emit_with(|| EventKind::BranchCreated {
            id: info.id,
            name: info.name.clone(),
        });
        Ok(info)
    }

    /// Remove a branch. `admit` runs under the registry lock and may veto
    /// the deletion. Handles already open on the branch keep it alive.
    pub(crate) fn delete_branch(
        &self,
        id: BranchId,
        admit: impl FnOnce(&Branch) -> FsResult<()>,
    ) -> FsResult<()> {
        if id == BranchId::DEFAULT {
            return Err(FsError::Busy);
        }
        {
            let mut registry = self.registry.write();
            let branch = registry.branches.get(&id).ok_or(FsError::NotFound)?;
            admit(branch)?;
            registry.branches.remove(&id);
        }
        tracing::debug!(branch = %id, "branch deleted");
        self.events.emit_with(|| EventKind::BranchDeleted { id });
        Ok(())
    }

    pub(crate) fn branch_list(&self) -> Vec<BranchInfo> {
        self.registry
            .read()
            .branches
            .values()
            .map(|branch| branch.info())
            .collect()
    }

    pub(crate) fn snapshot_list(&self) -> Vec<SnapshotInfo> {
        self.registry
            .read()
            .snapshots
            .values()
            .map(|snapshot| snapshot.info())
            .collect()
    }

    pub(crate) fn counts(&self) -> (usize, usize) {
        let registry = self.registry.read();
        (registry.branches.len(), registry.snapshots.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CaseSensitivity;
    use crate::metadata::{Metadata, Stream, PRIMARY_STREAM};
    use crate::storage::{InMemoryBackend, StorageBackend};
    use crate::tree::Node;

    fn manager(limits: FsLimits) -> (BranchManager, Arc<dyn StorageBackend>) {
        let storage: Arc<dyn StorageBackend> = Arc::new(InMemoryBackend::new());
        let mut tree = Tree::new(
            Node::directory(NodeId(1), Metadata::new(0o755, 0, 0, 0)),
            CaseSensitivity::Sensitive,
        );
        let (primary, _) = Stream::empty(&storage).unwrap().write(0, b"base").unwrap();
        tree.insert(Node::file(NodeId(2), Metadata::new(0o644, 0, 0, 0), primary));
        tree.link(tree.root(), "f", NodeId(2), 0).unwrap();
        (
            BranchManager::new(tree, limits, Arc::new(EventBus::new(false))),
            storage,
        )
    }

    fn content_of(tree: &Tree) -> crate::ContentId {
        tree.node(NodeId(2)).unwrap().stream(PRIMARY_STREAM).unwrap().content.id()
    }

    #[test]
    fn default_branch_exists_and_is_protected() {
        let (mgr, _) = manager(FsLimits::default());
        let branches = mgr.branch_list();
        assert_eq!(branches.len(), 1);
        assert_eq!(branches[0].id, BranchId::DEFAULT);
        assert_eq!(branches[0].name.as_deref(), Some(DEFAULT_BRANCH_NAME));
        assert!(matches!(mgr.delete_branch(BranchId::DEFAULT, |_| Ok(())), Err(FsError::Busy)));
    }

    #[test]
    fn snapshot_seals_and_branches_share_content() {
        let (mgr, storage) = manager(FsLimits::default());
        let default = mgr.branch(BranchId::DEFAULT).unwrap();
        let snap = mgr.snapshot_create(&default, Some("clean")).unwrap();
        assert_eq!(snap.branch, BranchId::DEFAULT);

        let content = content_of(&default.current());
        assert!(!storage.is_exclusive(content));

        let info = mgr.branch_create_from_snapshot(snap.id, Some("task-1")).unwrap();
        assert_eq!(info.parent, Some(snap.id));
        let branch = mgr.branch(info.id).unwrap();
        assert_eq!(content_of(&branch.current()), content);
        assert_eq!(mgr.counts(), (2, 1));
    }

    #[test]
    fn snapshots_leave_out_orphans() {
        let (mgr, _) = manager(FsLimits::default());
        let default = mgr.branch(BranchId::DEFAULT).unwrap();
        {
            let mut head = default.head();
            head.tree.unlink(NodeId(1), "f", 1).unwrap();
            head.orphans.insert(NodeId(2));
        }
        let snap = mgr.snapshot_create(&default, None).unwrap();
        assert!(mgr.snapshot(snap.id).unwrap().tree.node(NodeId(2)).is_err());
        assert!(default.current().node(NodeId(2)).is_ok());
    }

    #[test]
    fn limits_and_unknown_ids() {
        let (mgr, _) = manager(FsLimits {
            max_open_handles: 8,
            max_branches: 2,
            max_snapshots: 1,
        });
        let default = mgr.branch(BranchId::DEFAULT).unwrap();
        let snap = mgr.snapshot_create(&default, None).unwrap();
        assert!(matches!(mgr.snapshot_create(&default, None), Err(FsError::NoSpace)));

        let fork = mgr.branch_create_from_branch(&default, Some("fork")).unwrap();
        assert_eq!(fork.parent, None);
        assert!(matches!(
            mgr.branch_create_from_snapshot(snap.id, None),
            Err(FsError::NoSpace)
        ));

        assert!(matches!(mgr.snapshot_delete(SnapshotId::new()), Err(FsError::NotFound)));
        assert!(matches!(mgr.delete_branch(BranchId::new(), |_| Ok(())), Err(FsError::NotFound)));
        assert!(matches!(mgr.delete_branch(fork.id, |_| Err(FsError::Busy)), Err(FsError::Busy)));
        mgr.delete_branch(fork.id, |_| Ok(())).unwrap();
        mgr.snapshot_delete(snap.id).unwrap();
        assert_eq!(mgr.counts(), (1, 0));
    }
}
