// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Filesystem core: the path- and handle-based operation set
//!
//! Every operation runs on behalf of a process. The process table decides
//! which branch it sees and, when permission enforcement is on, which
//! credentials are checked. Readers work on a copy of the branch revision
//! taken under the branch lock; writers build the next revision on a working
//! copy and publish it in one swap, delivering events before the branch lock
//! is released.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::branches::{Branch, BranchHead, BranchManager};
use crate::config::FsConfig;
use crate::error::{FsError, FsResult};
use crate::events::EventBus;
use crate::fault::{FaultInjectingBackend, FaultInjector, FaultPolicy, FaultPolicySummary};
use crate::locking::{HandleTable, OpenFile, OpenRequest};
use crate::metadata::{validate_stream_name, Access, Credentials, Metadata, Stream, PRIMARY_STREAM};
use crate::process::{ProcessTable, PID};
use crate::storage::{create_backend, StorageBackend};
use crate::tree::{join_path, split_path, Node, NodeId, NodeKind, Tree};
use crate::types::now_secs;
use crate::{
    Attributes, BranchId, BranchInfo, DirEntry, EventKind, EventSink, FileTimes, FsStats,
    HandleId, LockRange, OpenOptions, SnapshotId, SnapshotInfo, StreamSpec, SubscriptionId,
};

const ROOT_NODE: NodeId = NodeId(1);
const DEFAULT_FILE_MODE: u32 = 0o644;
const ROOT_DIR_MODE: u32 = 0o755;
const SYMLINK_MODE: u32 = 0o777;

/// Counts reported through the fixed-width stats record.
fn saturating_count(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

/// Branch and credentials an operation runs with.
struct Caller {
    branch: Arc<Branch>,
    creds: Option<Credentials>,
}

/// The main filesystem core implementation
pub struct FsCore {
    config: FsConfig,
    storage: Arc<dyn StorageBackend>,
    faults: Arc<FaultInjector>,
    branches: BranchManager,
    processes: ProcessTable,
    handles: HandleTable,
    events: Arc<EventBus>,
    next_node_id: AtomicU64,
}

impl FsCore {
    /// Create a new FsCore instance with the storage backend selected by
    /// the memory policy.
    pub fn new(config: FsConfig) -> FsResult<Self> {
        config.validate()?;
        let storage = create_backend(&config.memory)?;
        Self::with_storage(config, storage)
    }

    /// Create a new FsCore instance on top of a caller-supplied backend.
    pub fn with_storage(config: FsConfig, storage: Arc<dyn StorageBackend>) -> FsResult<Self> {
        config.validate()?;
        let faults = Arc::new(FaultInjector::new());
        let storage: Arc<dyn StorageBackend> =
            Arc::new(FaultInjectingBackend::new(storage, faults.clone()));

        let root = Node::directory(
            ROOT_NODE,
            Metadata::new(
                ROOT_DIR_MODE,
                config.security.default_uid,
                config.security.default_gid,
                now_secs(),
            ),
        );
        let events = Arc::new(EventBus::new(config.track_events));
        let branches = BranchManager::new(
            Tree::new(root, config.case_sensitivity),
            config.limits.clone(),
            events.clone(),
        );
        tracing::debug!(
            case = ?config.case_sensitivity,
            budget = ?config.memory.max_bytes_in_memory,
            "filesystem core created"
        );
        Ok(Self {
            handles: HandleTable::new(config.limits.max_open_handles),
            config,
            storage,
            faults,
            branches,
            processes: ProcessTable::new(),
            events,
            next_node_id: AtomicU64::new(ROOT_NODE.0 + 1),
        })
    }

    pub fn config(&self) -> &FsConfig {
        &self.config
    }

    // Process binding

    /// Registers a process, recording its credentials for permission checks.
    ///
    /// The process inherits the branch binding of its nearest bound
    /// ancestor. Registering a known process again only refreshes its
    /// credentials.
    pub fn register_process(&self, pid: u32, parent_pid: u32, uid: u32, gid: u32) -> PID {
        self.processes.register(pid, parent_pid, uid, gid)
    }

    /// Drop the binding and credentials of a process that has exited.
    pub fn process_exited(&self, pid: u32) {
        self.processes.exited(pid);
        tracing::debug!(pid, "process exited");
    }

    pub fn bind_process_to_branch(&self, branch_id: BranchId) -> FsResult<()> {
        self.bind_process_to_branch_with_pid(branch_id, PID::current().as_u32())
    }

    pub fn bind_process_to_branch_with_pid(&self, branch_id: BranchId, pid: u32) -> FsResult<()> {
        self.branches
            .with_branch(branch_id, |_| self.processes.bind(pid, branch_id))
    }

    pub fn unbind_process(&self) -> FsResult<()> {
        self.unbind_process_with_pid(PID::current().as_u32())
    }

    pub fn unbind_process_with_pid(&self, pid: u32) -> FsResult<()> {
        self.processes.unbind(pid);
        Ok(())
    }

    /// Branch the process currently acts on.
    pub fn branch_of_process(&self, pid: &PID) -> BranchId {
        self.processes.branch_of(pid.0)
    }

    // Snapshot and branch management

    pub fn snapshot_create(&self, name: Option<&str>) -> FsResult<SnapshotId> {
        self.snapshot_create_for_pid(&PID::current(), name)
    }

    /// Freeze the branch `pid` acts on. The branch keeps mutating on top of
    /// the now shared revision.
    pub fn snapshot_create_for_pid(&self, pid: &PID, name: Option<&str>) -> FsResult<SnapshotId> {
        let branch = self.caller(pid)?.branch;
        Ok(self.branches.snapshot_create(&branch, name)?.id)
    }

    pub fn snapshot_list(&self) -> Vec<SnapshotInfo> {
        self.branches.snapshot_list()
    }

    pub fn snapshot_delete(&self, snapshot_id: SnapshotId) -> FsResult<()> {
        self.branches.snapshot_delete(snapshot_id)
    }

    pub fn branch_create_from_snapshot(
        &self,
        snapshot_id: SnapshotId,
        name: Option<&str>,
    ) -> FsResult<BranchId> {
        Ok(self.branches.branch_create_from_snapshot(snapshot_id, name)?.id)
    }

    pub fn branch_create_from_current(&self, name: Option<&str>) -> FsResult<BranchId> {
        self.branch_create_from_current_for_pid(&PID::current(), name)
    }

    pub fn branch_create_from_current_for_pid(
        &self,
        pid: &PID,
        name: Option<&str>,
    ) -> FsResult<BranchId> {
        let branch = self.caller(pid)?.branch;
        Ok(self.branches.branch_create_from_branch(&branch, name)?.id)
    }

    pub fn branch_list(&self) -> Vec<BranchInfo> {
        self.branches.branch_list()
    }

    /// Delete a branch. Processes bound to it make the call fail with `Busy`
    /// or are moved back to the default branch, depending on the binding
    /// policy. Open handles keep working until closed.
    pub fn delete_branch(&self, branch_id: BranchId) -> FsResult<()> {
        let refuse = self.config.binding.refuse_delete_of_bound_branch;
        self.branches.delete_branch(branch_id, |branch| {
            let bound = self.processes.bound_to(branch.id);
            if bound.is_empty() {
                return Ok(());
            }
            if refuse {
                tracing::debug!(branch = %branch.id, ?bound, "refusing to delete bound branch");
                return Err(FsError::Busy);
            }
            let unbound = self.processes.unbind_branch(branch.id);
            tracing::debug!(branch = %branch.id, unbound, "unbound processes of deleted branch");
            Ok(())
        })
    }

    // Metadata

    /// Resolve a path to its stored-case entry and attributes.
    pub fn lookup(&self, pid: &PID, path: &Path) -> FsResult<(DirEntry, Attributes)> {
        let parts = split_path(path)?;
        let caller = self.caller(pid)?;
        let tree = caller.branch.current();
        let who = caller.creds.as_ref();
        let (id, name) = match parts.split_last() {
            None => (tree.root(), "/".to_owned()),
            Some((name, parent_parts)) => {
                let parent = self.walk_dir(&tree, who, parent_parts)?;
                self.check(who, tree.node(parent)?, Access::SEARCH)?;
                let entry = tree.child(parent, name)?.ok_or(FsError::NotFound)?;
                (entry.node, entry.name.clone())
            }
        };
        let node = tree.node(id)?;
        Ok((node.dir_entry(&name), node.attributes()))
    }

    pub fn getattr(&self, pid: &PID, path: &Path) -> FsResult<Attributes> {
        let parts = split_path(path)?;
        let caller = self.caller(pid)?;
        let tree = caller.branch.current();
        let id = self.walk(&tree, caller.creds.as_ref(), &parts)?;
        Ok(tree.node(id)?.attributes())
    }

    /// Attributes of an open file, including one that has been unlinked.
    pub fn getattr_handle(&self, _pid: &PID, handle_id: HandleId) -> FsResult<Attributes> {
        let file = self.handles.get(handle_id)?;
        let tree = file.branch.current();
        Ok(tree.node(file.node)?.attributes())
    }

    pub fn set_times(&self, pid: &PID, path: &Path, times: FileTimes) -> FsResult<()> {
        self.update_metadata(pid, path, |fs, who, node| {
            fs.check_owner(who, node)?;
            node.meta.times = times;
            Ok(())
        })
    }

    /// Change permission bits (`0o7777`).
    pub fn set_mode(&self, pid: &PID, path: &Path, mode: u32) -> FsResult<()> {
        self.update_metadata(pid, path, |fs, who, node| {
            fs.check_owner(who, node)?;
            node.meta.mode = mode & 0o7777;
            node.meta.touch_changed(now_secs());
            Ok(())
        })
    }

    /// Change ownership. Under enforcement only root may give a node away;
    /// an owner may move it to one of their own groups.
    pub fn set_owner(&self, pid: &PID, path: &Path, uid: u32, gid: u32) -> FsResult<()> {
        self.update_metadata(pid, path, |fs, who, node| {
            if let Some(who) = fs.enforced(who) {
                let is_root = who.uid == 0;
                let keeps_owner = uid == node.meta.uid;
                let own_group = gid == node.meta.gid || who.gid == gid || who.groups.contains(&gid);
                if !is_root && !(keeps_owner && own_group && who.uid == node.meta.uid) {
                    return Err(FsError::AccessDenied);
                }
            }
            node.meta.uid = uid;
            node.meta.gid = gid;
            node.meta.touch_changed(now_secs());
            Ok(())
        })
    }

    // Namespace

    pub fn mkdir(&self, pid: &PID, path: &Path, mode: u32) -> FsResult<()> {
        let parts = split_path(path)?;
        let Some((name, parent_parts)) = parts.split_last() else {
            return Err(FsError::AlreadyExists);
        };
        let caller = self.caller(pid)?;
        let who = caller.creds.as_ref();
        let branch_id = caller.branch.id;
        self.commit(&caller.branch, |head, events| {
            let now = now_secs();
            let parent = self.parent_for_update(&head.tree, who, parent_parts)?;
            if head.tree.child(parent, name)?.is_some() {
                return Err(FsError::AlreadyExists);
            }
            let (uid, gid) = self.owner(who);
            let id = self.alloc_node_id();
            head.tree
                .insert(Node::directory(id, Metadata::new(mode, uid, gid, now)));
            head.tree.link(parent, name, id, now)?;
            tracing::debug!(branch = %branch_id, path = %path.display(), node = %id, "mkdir");
            events.push(EventKind::Created {
                branch: branch_id,
                path: join_path(&parts),
            });
            Ok(())
        })
    }

    /// Create a new file and open it. Fails with `AlreadyExists` when the
    /// path is taken.
    pub fn create(&self, pid: &PID, path: &Path, options: &OpenOptions) -> FsResult<HandleId> {
        let options = OpenOptions {
            create: true,
            ..options.clone()
        };
        self.open_file(pid, path, &options, true)
    }

    /// Open a file, creating it when `options.create` is set. Admission
    /// against other handles on the node happens before any truncation.
    pub fn open(&self, pid: &PID, path: &Path, options: &OpenOptions) -> FsResult<HandleId> {
        self.open_file(pid, path, options, false)
    }

    fn open_file(
        &self,
        pid: &PID,
        path: &Path,
        options: &OpenOptions,
        exclusive: bool,
    ) -> FsResult<HandleId> {
        let wants_write = options.write || options.append || options.truncate;
        if options.truncate && !(options.write || options.append) {
            return Err(FsError::InvalidArgument);
        }
        let stream = match &options.stream {
            Some(name) => {
                if !self.config.enable_ads {
                    return Err(FsError::Unsupported);
                }
                validate_stream_name(name)?;
                name.clone()
            }
            None => PRIMARY_STREAM.to_owned(),
        };
        let parts = split_path(path)?;
        let Some((name, parent_parts)) = parts.split_last() else {
            return Err(FsError::IsADirectory);
        };
        let caller = self.caller(pid)?;
        let who = caller.creds.as_ref();
        let branch_id = caller.branch.id;
        let shown = join_path(&parts);

        self.commit(&caller.branch, |head, events| {
            let now = now_secs();
            let parent = self.walk_dir(&head.tree, who, parent_parts)?;
            let existing = head.tree.child(parent, name)?.map(|entry| entry.node);
            let (id, truncate) = match existing {
                Some(_) if exclusive => return Err(FsError::AlreadyExists),
                Some(id) => {
                    let node = head.tree.node(id)?;
                    let has_stream = node.streams()?.contains_key(&stream);
                    self.check(
                        who,
                        node,
                        Access {
                            read: options.read,
                            write: wants_write,
                            exec: false,
                        },
                    )?;
                    if !has_stream {
                        if !options.create {
                            return Err(FsError::NotFound);
                        }
                        let fresh = Stream::empty(&self.storage)?;
                        head.tree.update(id, |node| {
                            node.streams_mut()?.insert(stream.clone(), fresh);
                            node.meta.touch_changed(now);
                            Ok(())
                        })?;
                    }
                    (id, options.truncate)
                }
                None => {
                    if !options.create {
                        return Err(FsError::NotFound);
                    }
                    self.check(who, head.tree.node(parent)?, Access::MODIFY_DIR)?;
                    let (uid, gid) = self.owner(who);
                    let id = self.alloc_node_id();
                    let mut node = Node::file(
                        id,
                        Metadata::new(DEFAULT_FILE_MODE, uid, gid, now),
                        Stream::empty(&self.storage)?,
                    );
                    if stream != PRIMARY_STREAM {
                        node.streams_mut()?
                            .insert(stream.clone(), Stream::empty(&self.storage)?);
                    }
                    head.tree.insert(node);
                    head.tree.link(parent, name, id, now)?;
                    tracing::debug!(branch = %branch_id, path = %shown, node = %id, "file created");
                    events.push(EventKind::Created {
                        branch: branch_id,
                        path: shown.clone(),
                    });
                    (id, false)
                }
            };

            let handle = self.handles.open(OpenRequest {
                branch: caller.branch.clone(),
                node: id,
                stream: stream.clone(),
                path: shown.clone(),
                options: options.clone(),
            })?;
            if truncate {
                if let Err(err) = Self::resize(&mut head.tree, id, &stream, 0, now) {
                    let _ = self.handles.close(handle);
                    return Err(err);
                }
                events.push(EventKind::Modified {
                    branch: branch_id,
                    path: shown.clone(),
                });
            }
            tracing::trace!(handle = handle.0, node = %id, path = %shown, "open");
            Ok(handle)
        })
    }

    pub fn symlink(&self, pid: &PID, target: &str, linkpath: &Path) -> FsResult<()> {
        if target.is_empty() || target.contains('\0') {
            return Err(FsError::InvalidArgument);
        }
        let parts = split_path(linkpath)?;
        let Some((name, parent_parts)) = parts.split_last() else {
            return Err(FsError::AlreadyExists);
        };
        let caller = self.caller(pid)?;
        let who = caller.creds.as_ref();
        let branch_id = caller.branch.id;
        self.commit(&caller.branch, |head, events| {
            let now = now_secs();
            let parent = self.parent_for_update(&head.tree, who, parent_parts)?;
            if head.tree.child(parent, name)?.is_some() {
                return Err(FsError::AlreadyExists);
            }
            let (uid, gid) = self.owner(who);
            let id = self.alloc_node_id();
            head.tree.insert(Node::symlink(
                id,
                Metadata::new(SYMLINK_MODE, uid, gid, now),
                target.to_owned(),
            ));
            head.tree.link(parent, name, id, now)?;
            events.push(EventKind::Created {
                branch: branch_id,
                path: join_path(&parts),
            });
            Ok(())
        })
    }

    pub fn readlink(&self, pid: &PID, path: &Path) -> FsResult<String> {
        let parts = split_path(path)?;
        let caller = self.caller(pid)?;
        let tree = caller.branch.current();
        let id = self.walk(&tree, caller.creds.as_ref(), &parts)?;
        match &tree.node(id)?.kind {
            NodeKind::Symlink { target } => Ok(target.clone()),
            _ => Err(FsError::InvalidArgument),
        }
    }

    /// Add a hard link `new_path` to the file at `old_path`.
    pub fn link(&self, pid: &PID, old_path: &Path, new_path: &Path) -> FsResult<()> {
        let old_parts = split_path(old_path)?;
        let new_parts = split_path(new_path)?;
        let Some((name, parent_parts)) = new_parts.split_last() else {
            return Err(FsError::AlreadyExists);
        };
        let caller = self.caller(pid)?;
        let who = caller.creds.as_ref();
        let branch_id = caller.branch.id;
        self.commit(&caller.branch, |head, events| {
            let now = now_secs();
            let target = self.walk(&head.tree, who, &old_parts)?;
            if head.tree.node(target)?.is_dir() {
                return Err(FsError::IsADirectory);
            }
            let parent = self.parent_for_update(&head.tree, who, parent_parts)?;
            if head.tree.child(parent, name)?.is_some() {
                return Err(FsError::AlreadyExists);
            }
            head.tree.link(parent, name, target, now)?;
            head.tree.update(target, |node| {
                node.meta.nlink += 1;
                node.meta.touch_changed(now);
                Ok(())
            })?;
            events.push(EventKind::Created {
                branch: branch_id,
                path: join_path(&new_parts),
            });
            Ok(())
        })
    }

    /// POSIX rename: an existing file target is replaced, an existing
    /// directory target only when empty.
    pub fn rename(&self, pid: &PID, old: &Path, new: &Path) -> FsResult<()> {
        let old_parts = split_path(old)?;
        let new_parts = split_path(new)?;
        let (Some((old_name, old_parent)), Some((new_name, new_parent))) =
            (old_parts.split_last(), new_parts.split_last())
        else {
            return Err(FsError::Busy);
        };
        let caller = self.caller(pid)?;
        let who = caller.creds.as_ref();
        let branch_id = caller.branch.id;
        self.commit(&caller.branch, |head, events| {
            let now = now_secs();
            let src_parent = self.parent_for_update(&head.tree, who, old_parent)?;
            let source = head
                .tree
                .child(src_parent, old_name)?
                .map(|entry| entry.node)
                .ok_or(FsError::NotFound)?;

            let mut trail = Vec::new();
            let dst_parent = head.tree.resolve_dir(new_parent, &mut |dir: &Node| {
                trail.push(dir.id);
                self.check(who, dir, Access::SEARCH)
            })?;
            trail.push(dst_parent);
            self.check(who, head.tree.node(dst_parent)?, Access::MODIFY_DIR)?;

            let source_is_dir = head.tree.node(source)?.is_dir();
            if source_is_dir && trail.contains(&source) {
                return Err(FsError::InvalidArgument);
            }
            self.handles.check_delete((branch_id, source))?;

            let renamed = EventKind::Renamed {
                branch: branch_id,
                from: join_path(&old_parts),
                to: join_path(&new_parts),
            };
            if src_parent == dst_parent && head.tree.key(old_name) == head.tree.key(new_name) {
                if old_name != new_name {
                    head.tree.rename_entry(dst_parent, new_name, now)?;
                    events.push(renamed);
                }
                return Ok(());
            }

            if let Some(target) = head.tree.child(dst_parent, new_name)?.map(|e| e.node) {
                if target == source {
                    // Two links to the same node: nothing to do.
                    return Ok(());
                }
                let target_node = head.tree.node(target)?;
                match (source_is_dir, target_node.is_dir()) {
                    (true, false) => return Err(FsError::NotADirectory),
                    (false, true) => return Err(FsError::IsADirectory),
                    (true, true) if !target_node.entries()?.is_empty() => {
                        return Err(FsError::Busy)
                    }
                    _ => {}
                }
                self.handles.check_delete((branch_id, target))?;
                head.tree.unlink(dst_parent, new_name, now)?;
                self.drop_link(head, branch_id, target, now)?;
            }

            head.tree.unlink(src_parent, old_name, now)?;
            head.tree.link(dst_parent, new_name, source, now)?;
            head.tree.update(source, |node| {
                node.meta.touch_changed(now);
                Ok(())
            })?;
            tracing::debug!(branch = %branch_id, from = %old.display(), to = %new.display(), "rename");
            events.push(renamed);
            Ok(())
        })
    }

    /// Remove a directory entry. The file itself lives on while handles to
    /// it are open.
    pub fn unlink(&self, pid: &PID, path: &Path) -> FsResult<()> {
        let parts = split_path(path)?;
        let Some((name, parent_parts)) = parts.split_last() else {
            return Err(FsError::IsADirectory);
        };
        let caller = self.caller(pid)?;
        let who = caller.creds.as_ref();
        let branch_id = caller.branch.id;
        self.commit(&caller.branch, |head, events| {
            let now = now_secs();
            let parent = self.parent_for_update(&head.tree, who, parent_parts)?;
            let id = head
                .tree
                .child(parent, name)?
                .map(|entry| entry.node)
                .ok_or(FsError::NotFound)?;
            if head.tree.node(id)?.is_dir() {
                return Err(FsError::IsADirectory);
            }
            self.handles.check_delete((branch_id, id))?;
            head.tree.unlink(parent, name, now)?;
            self.drop_link(head, branch_id, id, now)?;
            tracing::debug!(branch = %branch_id, path = %path.display(), node = %id, "unlink");
            events.push(EventKind::Removed {
                branch: branch_id,
                path: join_path(&parts),
            });
            Ok(())
        })
    }

    pub fn rmdir(&self, pid: &PID, path: &Path) -> FsResult<()> {
        let parts = split_path(path)?;
        let Some((name, parent_parts)) = parts.split_last() else {
            return Err(FsError::Busy);
        };
        let caller = self.caller(pid)?;
        let who = caller.creds.as_ref();
        let branch_id = caller.branch.id;
        self.commit(&caller.branch, |head, events| {
            let now = now_secs();
            let parent = self.parent_for_update(&head.tree, who, parent_parts)?;
            let id = head
                .tree
                .child(parent, name)?
                .map(|entry| entry.node)
                .ok_or(FsError::NotFound)?;
            if !head.tree.node(id)?.entries()?.is_empty() {
                return Err(FsError::Busy);
            }
            head.tree.unlink(parent, name, now)?;
            head.tree.remove(id);
            tracing::debug!(branch = %branch_id, path = %path.display(), "rmdir");
            events.push(EventKind::Removed {
                branch: branch_id,
                path: join_path(&parts),
            });
            Ok(())
        })
    }

    /// Directory listing with names in the case they were created with.
    pub fn readdir(&self, pid: &PID, path: &Path) -> FsResult<Vec<DirEntry>> {
        Ok(self
            .readdir_plus(pid, path)?
            .into_iter()
            .map(|(entry, _)| entry)
            .collect())
    }

    /// Directory listing with attributes for every entry.
    pub fn readdir_plus(&self, pid: &PID, path: &Path) -> FsResult<Vec<(DirEntry, Attributes)>> {
        let parts = split_path(path)?;
        let caller = self.caller(pid)?;
        let who = caller.creds.as_ref();
        let tree = caller.branch.current();
        let dir = self.walk_dir(&tree, who, &parts)?;
        self.check(
            who,
            tree.node(dir)?,
            Access {
                read: true,
                ..Access::default()
            },
        )?;
        Ok(tree
            .list(dir)?
            .into_iter()
            .map(|(entry, node)| (node.dir_entry(&entry.name), node.attributes()))
            .collect())
    }

    // File I/O

    pub fn read(&self, _pid: &PID, handle_id: HandleId, offset: u64, buf: &mut [u8]) -> FsResult<usize> {
        let file = self.handles.get(handle_id)?;
        if !file.options.read {
            return Err(FsError::BadFileDescriptor);
        }
        let tree = file.branch.current();
        let node = tree.node(file.node)?;
        node.stream(&file.stream)?.read(offset, buf)
    }

    /// Write through a handle. Handles opened with `append` always write at
    /// the current end.
    pub fn write(&self, _pid: &PID, handle_id: HandleId, offset: u64, data: &[u8]) -> FsResult<usize> {
        let file = self.handles.get(handle_id)?;
        if !file.can_write() {
            return Err(FsError::BadFileDescriptor);
        }
        self.commit(&file.branch, |head, events| {
            let current = Arc::clone(head.tree.node(file.node)?);
            let stream = current.stream(&file.stream)?;
            let offset = if file.options.append { stream.len } else { offset };
            let (next, written) = stream.write(offset, data)?;
            let now = now_secs();
            head.tree.update(file.node, |node| {
                node.streams_mut()?.insert(file.stream.clone(), next);
                node.meta.touch_modified(now);
                Ok(())
            })?;
            tracing::trace!(handle = handle_id.0, offset, len = written, "write");
            events.push(Self::modified(&file));
            Ok(written)
        })
    }

    /// Resize the primary content of the file at `path`.
    pub fn truncate(&self, pid: &PID, path: &Path, len: u64) -> FsResult<()> {
        let parts = split_path(path)?;
        let caller = self.caller(pid)?;
        let who = caller.creds.as_ref();
        let branch_id = caller.branch.id;
        self.commit(&caller.branch, |head, events| {
            let id = self.walk(&head.tree, who, &parts)?;
            self.check(
                who,
                head.tree.node(id)?,
                Access {
                    write: true,
                    ..Access::default()
                },
            )?;
            Self::resize(&mut head.tree, id, PRIMARY_STREAM, len, now_secs())?;
            events.push(EventKind::Modified {
                branch: branch_id,
                path: join_path(&parts),
            });
            Ok(())
        })
    }

    /// Resize the stream an open handle refers to.
    pub fn ftruncate(&self, _pid: &PID, handle_id: HandleId, len: u64) -> FsResult<()> {
        let file = self.handles.get(handle_id)?;
        if !file.can_write() {
            return Err(FsError::BadFileDescriptor);
        }
        self.commit(&file.branch, |head, events| {
            Self::resize(&mut head.tree, file.node, &file.stream, len, now_secs())?;
            events.push(Self::modified(&file));
            Ok(())
        })
    }

    /// Close a handle, releasing its byte-range locks. Closing the last
    /// handle of an unlinked file reclaims it.
    pub fn close(&self, _pid: &PID, handle_id: HandleId) -> FsResult<()> {
        let (file, last) = self.handles.close(handle_id)?;
        if last {
            let mut head = file.branch.head();
            if head.orphans.remove(&file.node) {
                head.tree.remove(file.node);
                tracing::debug!(branch = %file.branch.id, node = %file.node, "unlinked file reclaimed");
            }
        }
        Ok(())
    }

    pub fn lock(&self, handle_id: HandleId, range: LockRange) -> FsResult<()> {
        self.handles.lock(handle_id, range)
    }

    pub fn unlock(&self, handle_id: HandleId, range: LockRange) -> FsResult<()> {
        self.handles.unlock(handle_id, range)
    }

    // Extended attributes and streams

    pub fn xattr_get(&self, pid: &PID, path: &Path, name: &str) -> FsResult<Vec<u8>> {
        self.require_xattrs()?;
        let (tree, id) = self.resolve_readable(pid, path)?;
        tree.node(id)?.meta.xattr_get(name)
    }

    pub fn xattr_set(&self, pid: &PID, path: &Path, name: &str, value: &[u8]) -> FsResult<()> {
        self.require_xattrs()?;
        self.update_metadata(pid, path, |fs, who, node| {
            fs.check_writable(who, node)?;
            node.meta.xattr_set(name, value)?;
            node.meta.touch_changed(now_secs());
            Ok(())
        })
    }

    pub fn xattr_list(&self, pid: &PID, path: &Path) -> FsResult<Vec<String>> {
        self.require_xattrs()?;
        let (tree, id) = self.resolve_readable(pid, path)?;
        Ok(tree.node(id)?.meta.xattr_names())
    }

    pub fn xattr_remove(&self, pid: &PID, path: &Path, name: &str) -> FsResult<()> {
        self.require_xattrs()?;
        self.update_metadata(pid, path, |fs, who, node| {
            fs.check_writable(who, node)?;
            node.meta.xattr_remove(name)?;
            node.meta.touch_changed(now_secs());
            Ok(())
        })
    }

    /// Named streams of a file. The primary content is not listed.
    pub fn streams_list(&self, pid: &PID, path: &Path) -> FsResult<Vec<StreamSpec>> {
        if !self.config.enable_ads {
            return Err(FsError::Unsupported);
        }
        let (tree, id) = self.resolve_readable(pid, path)?;
        Ok(tree
            .node(id)?
            .streams()?
            .iter()
            .filter(|(name, _)| name.as_str() != PRIMARY_STREAM)
            .map(|(name, stream)| StreamSpec {
                name: name.clone(),
                len: stream.len,
            })
            .collect())
    }

    // Events

    pub fn subscribe_events(&self, cb: Arc<dyn EventSink>) -> FsResult<SubscriptionId> {
        self.events.subscribe(cb)
    }

    pub fn unsubscribe_events(&self, sub: SubscriptionId) -> FsResult<()> {
        self.events.unsubscribe(sub)
    }

    // Statistics and diagnostics

    pub fn stats(&self) -> FsStats {
        let (branches, snapshots) = self.branches.counts();
        let usage = self.storage.usage();
        FsStats {
            branches: saturating_count(branches),
            snapshots: saturating_count(snapshots),
            open_handles: saturating_count(self.handles.len()),
            bytes_in_memory: usage.bytes_in_memory,
            bytes_spilled: usage.bytes_spilled,
        }
    }

    pub fn set_fault_policy(&self, policy: FaultPolicy) {
        tracing::debug!(rules = policy.rules.len(), enabled = policy.enabled, "fault policy installed");
        self.faults.set_policy(policy);
    }

    pub fn clear_fault_policy(&self) {
        self.faults.clear();
    }

    pub fn fault_policy_summary(&self) -> FaultPolicySummary {
        self.faults.summary()
    }

    // Helpers

    fn caller(&self, pid: &PID) -> FsResult<Caller> {
        let branch = self.branches.branch(self.processes.branch_of(pid.0))?;
        Ok(Caller {
            branch,
            creds: self.processes.credentials(pid.0),
        })
    }

    fn alloc_node_id(&self) -> NodeId {
        NodeId(self.next_node_id.fetch_add(1, Ordering::Relaxed))
    }

    fn owner(&self, who: Option<&Credentials>) -> (u32, u32) {
        match who {
            Some(who) => (who.uid, who.gid),
            None => (self.config.security.default_uid, self.config.security.default_gid),
        }
    }

    /// Credentials to check, `None` when enforcement is off or the caller is
    /// unregistered.
    fn enforced<'a>(&self, who: Option<&'a Credentials>) -> Option<&'a Credentials> {
        who.filter(|_| self.config.security.enforce_posix_permissions)
    }

    fn check(&self, who: Option<&Credentials>, node: &Node, access: Access) -> FsResult<()> {
        match self.enforced(who) {
            Some(who) if !node.meta.permits(who, access, &self.config.security) => {
                Err(FsError::AccessDenied)
            }
            _ => Ok(()),
        }
    }

    fn check_writable(&self, who: Option<&Credentials>, node: &Node) -> FsResult<()> {
        self.check(
            who,
            node,
            Access {
                write: true,
                ..Access::default()
            },
        )
    }

    fn check_owner(&self, who: Option<&Credentials>, node: &Node) -> FsResult<()> {
        match self.enforced(who) {
            Some(who) if !node.meta.owned_by(who, &self.config.security) => {
                Err(FsError::AccessDenied)
            }
            _ => Ok(()),
        }
    }

    fn walk(&self, tree: &Tree, who: Option<&Credentials>, parts: &[&str]) -> FsResult<NodeId> {
        tree.resolve(parts, &mut |dir: &Node| self.check(who, dir, Access::SEARCH))
    }

    fn walk_dir(&self, tree: &Tree, who: Option<&Credentials>, parts: &[&str]) -> FsResult<NodeId> {
        tree.resolve_dir(parts, &mut |dir: &Node| self.check(who, dir, Access::SEARCH))
    }

    /// Resolve a parent directory that is about to gain or lose an entry.
    fn parent_for_update(
        &self,
        tree: &Tree,
        who: Option<&Credentials>,
        parent_parts: &[&str],
    ) -> FsResult<NodeId> {
        let parent = self.walk_dir(tree, who, parent_parts)?;
        self.check(who, tree.node(parent)?, Access::MODIFY_DIR)?;
        Ok(parent)
    }

    fn resolve_readable(&self, pid: &PID, path: &Path) -> FsResult<(Tree, NodeId)> {
        let parts = split_path(path)?;
        let caller = self.caller(pid)?;
        let tree = caller.branch.current();
        let id = self.walk(&tree, caller.creds.as_ref(), &parts)?;
        Ok((tree, id))
    }

    fn require_xattrs(&self) -> FsResult<()> {
        if self.config.enable_xattrs {
            Ok(())
        } else {
            Err(FsError::Unsupported)
        }
    }

    fn modified(file: &OpenFile) -> EventKind {
        EventKind::Modified {
            branch: file.branch.id,
            path: file.path.clone(),
        }
    }

    /// Edit the metadata of the node at `path` and report it as modified.
    fn update_metadata(
        &self,
        pid: &PID,
        path: &Path,
        edit: impl FnOnce(&Self, Option<&Credentials>, &mut Node) -> FsResult<()>,
    ) -> FsResult<()> {
        let parts = split_path(path)?;
        let caller = self.caller(pid)?;
        let who = caller.creds.as_ref();
        let branch_id = caller.branch.id;
        self.commit(&caller.branch, |head, events| {
            let id = self.walk(&head.tree, who, &parts)?;
            head.tree.update(id, |node| edit(self, who, node))?;
            events.push(EventKind::Modified {
                branch: branch_id,
                path: join_path(&parts),
            });
            Ok(())
        })
    }

    fn resize(tree: &mut Tree, id: NodeId, stream: &str, len: u64, now: i64) -> FsResult<()> {
        let current = Arc::clone(tree.node(id)?);
        let next = current.stream(stream)?.truncate(len)?;
        tree.update(id, |node| {
            node.streams_mut()?.insert(stream.to_owned(), next);
            node.meta.touch_modified(now);
            Ok(())
        })
    }

    /// Account for a removed directory entry naming a non-directory node.
    /// The last link either frees the node or, while handles are open,
    /// parks it as an orphan.
    fn drop_link(&self, head: &mut BranchHead, branch: BranchId, id: NodeId, now: i64) -> FsResult<()> {
        if head.tree.node(id)?.is_dir() {
            head.tree.remove(id);
            return Ok(());
        }
        let remaining = head.tree.update(id, |node| {
            node.meta.nlink = node.meta.nlink.saturating_sub(1);
            node.meta.touch_changed(now);
            Ok(node.meta.nlink)
        })?;
        if remaining == 0 {
            if self.handles.is_open((branch, id)) {
                head.orphans.insert(id);
            } else {
                head.tree.remove(id);
            }
        }
        Ok(())
    }

    /// Run `op` against a working copy of the branch head and publish it
    /// only on success. Events collected by `op` are delivered while the
    /// branch lock is still held, so they arrive in mutation order.
    fn commit<R>(
        &self,
        branch: &Branch,
        op: impl FnOnce(&mut BranchHead, &mut Vec<EventKind>) -> FsResult<R>,
    ) -> FsResult<R> {
        let mut head = branch.head();
        let mut working = head.clone();
        let mut events = Vec::new();
        let out = op(&mut working, &mut events)?;
        *head = working;
        if self.events.active() {
            for event in events {
                self.events.emit(event);
            }
        }
        Ok(out)
    }
}
