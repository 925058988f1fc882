// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Persistent namespace tree
//!
//! A [`Tree`] is one revision of a branch or snapshot: a persistent map from
//! [`NodeId`] to immutable nodes. Directories name their children by id, so
//! a hard link is simply a second entry carrying the same id. Mutating a
//! revision replaces the touched nodes with new versions and copies the map
//! spine above them; all other nodes stay shared with earlier revisions.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crate::config::CaseSensitivity;
use crate::error::{FsError, FsResult};
use crate::metadata::{Metadata, Stream, MAX_NAME_LEN, PRIMARY_STREAM};
use crate::pmap::PersistentMap;
use crate::{Attributes, DirEntry, FileMode};

/// Identity of a node inside the trees of one filesystem instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct NodeId(pub(crate) u64);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A directory entry: the name as first created plus the target node.
#[derive(Clone, Debug)]
pub(crate) struct Entry {
    pub(crate) name: String,
    pub(crate) node: NodeId,
}

#[derive(Clone, Debug)]
pub(crate) enum NodeKind {
    /// Data streams keyed by name; the primary stream has the empty name.
    File { streams: BTreeMap<String, Stream> },
    /// Entries keyed by [`CaseSensitivity::key`].
    Directory { entries: BTreeMap<String, Entry> },
    Symlink { target: String },
}

#[derive(Clone, Debug)]
pub(crate) struct Node {
    pub(crate) id: NodeId,
    pub(crate) meta: Metadata,
    pub(crate) kind: NodeKind,
}

impl Node {
    pub(crate) fn directory(id: NodeId, mut meta: Metadata) -> Self {
        meta.nlink = 2;
        Self {
            id,
            meta,
            kind: NodeKind::Directory {
                entries: BTreeMap::new(),
            },
        }
    }

    pub(crate) fn file(id: NodeId, meta: Metadata, primary: Stream) -> Self {
        let mut streams = BTreeMap::new();
        streams.insert(PRIMARY_STREAM.to_owned(), primary);
        Self {
            id,
            meta,
            kind: NodeKind::File { streams },
        }
    }

    pub(crate) fn symlink(id: NodeId, meta: Metadata, target: String) -> Self {
        Self {
            id,
            meta,
            kind: NodeKind::Symlink { target },
        }
    }

    pub(crate) fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Directory { .. })
    }

    pub(crate) fn is_symlink(&self) -> bool {
        matches!(self.kind, NodeKind::Symlink { .. })
    }

    pub(crate) fn entries(&self) -> FsResult<&BTreeMap<String, Entry>> {
        match &self.kind {
            NodeKind::Directory { entries } => Ok(entries),
            _ => Err(FsError::NotADirectory),
        }
    }

    fn entries_mut(&mut self) -> FsResult<&mut BTreeMap<String, Entry>> {
        match &mut self.kind {
            NodeKind::Directory { entries } => Ok(entries),
            _ => Err(FsError::NotADirectory),
        }
    }

    /// Streams of a regular file. Directories report `IsADirectory`,
    /// symlinks `InvalidArgument`.
    pub(crate) fn streams(&self) -> FsResult<&BTreeMap<String, Stream>> {
        match &self.kind {
            NodeKind::File { streams } => Ok(streams),
            NodeKind::Directory { .. } => Err(FsError::IsADirectory),
            NodeKind::Symlink { .. } => Err(FsError::InvalidArgument),
        }
    }

    pub(crate) fn streams_mut(&mut self) -> FsResult<&mut BTreeMap<String, Stream>> {
        match &mut self.kind {
            NodeKind::File { streams } => Ok(streams),
            NodeKind::Directory { .. } => Err(FsError::IsADirectory),
            NodeKind::Symlink { .. } => Err(FsError::InvalidArgument),
        }
    }

    pub(crate) fn stream(&self, name: &str) -> FsResult<&Stream> {
        self.streams()?.get(name).ok_or(FsError::NotFound)
    }

    pub(crate) fn len(&self) -> u64 {
        match &self.kind {
            NodeKind::File { streams } => streams.get(PRIMARY_STREAM).map_or(0, |s| s.len),
            NodeKind::Directory { .. } => 0,
            NodeKind::Symlink { target } => target.len() as u64,
        }
    }

    pub(crate) fn attributes(&self) -> Attributes {
        Attributes {
            len: self.len(),
            times: self.meta.times,
            uid: self.meta.uid,
            gid: self.meta.gid,
            nlink: self.meta.nlink,
            is_dir: self.is_dir(),
            is_symlink: self.is_symlink(),
            mode_user: FileMode::from_bits(self.meta.mode >> 6),
            mode_group: FileMode::from_bits(self.meta.mode >> 3),
            mode_other: FileMode::from_bits(self.meta.mode),
        }
    }

    pub(crate) fn dir_entry(&self, name: &str) -> DirEntry {
        DirEntry {
            name: name.to_owned(),
            is_dir: self.is_dir(),
            is_symlink: self.is_symlink(),
            len: self.len(),
        }
    }
}

/// Split a path into validated components.
///
/// Paths are `/`-separated and always relative to the root. Empty and `.`
/// components are skipped; `..` is rejected.
pub(crate) fn split_path(path: &Path) -> FsResult<Vec<&str>> {
    let text = path.to_str().ok_or(FsError::InvalidName)?;
    let mut parts = Vec::new();
    for part in text.split('/') {
        match part {
            "" | "." => {}
            ".." => return Err(FsError::InvalidArgument),
            name => {
                validate_name(name)?;
                parts.push(name);
            }
        }
    }
    Ok(parts)
}

pub(crate) fn validate_name(name: &str) -> FsResult<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN || name.contains('\0') {
        return Err(FsError::InvalidName);
    }
    Ok(())
}

/// Normalized absolute form of a component list, used in events.
pub(crate) fn join_path(parts: &[&str]) -> String {
    format!("/{}", parts.join("/"))
}

#[derive(Clone)]
pub(crate) struct Tree {
    root: NodeId,
    nodes: PersistentMap<Arc<Node>>,
    case: CaseSensitivity,
}

impl Tree {
    pub(crate) fn new(root: Node, case: CaseSensitivity) -> Self {
        let mut nodes = PersistentMap::new();
        let id = root.id;
        nodes.insert(id.0, Arc::new(root));
        Self {
            root: id,
            nodes,
            case,
        }
    }

    pub(crate) fn root(&self) -> NodeId {
        self.root
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn node(&self, id: NodeId) -> FsResult<&Arc<Node>> {
        self.nodes.get(id.0).ok_or(FsError::NotFound)
    }

    pub(crate) fn nodes(&self) -> impl Iterator<Item = &Arc<Node>> {
        self.nodes.entries().into_iter().map(|(_, node)| node)
    }

    pub(crate) fn insert(&mut self, node: Node) {
        self.nodes.insert(node.id.0, Arc::new(node));
    }

    pub(crate) fn remove(&mut self, id: NodeId) -> Option<Arc<Node>> {
        self.nodes.remove(id.0)
    }

    /// Replace a node with an edited copy. The copy is discarded when `edit`
    /// fails, leaving the revision untouched.
    pub(crate) fn update<R>(
        &mut self,
        id: NodeId,
        edit: impl FnOnce(&mut Node) -> FsResult<R>,
    ) -> FsResult<R> {
        let mut node = Node::clone(self.node(id)?);
        let out = edit(&mut node)?;
        self.insert(node);
        Ok(out)
    }

    pub(crate) fn key(&self, name: &str) -> String {
        self.case.key(name)
    }

    /// Walk `parts` from the root. `visit` sees every directory that is
    /// searched on the way (not the final node) and may veto the walk.
    /// Symlinks are never followed.
    pub(crate) fn resolve(
        &self,
        parts: &[&str],
        visit: &mut dyn FnMut(&Node) -> FsResult<()>,
    ) -> FsResult<NodeId> {
        let mut current = self.root;
        for part in parts {
            let dir = self.node(current)?;
            let entries = dir.entries()?;
            visit(dir)?;
            current = entries
                .get(&self.key(part))
                .map(|entry| entry.node)
                .ok_or(FsError::NotFound)?;
        }
        Ok(current)
    }

    /// Like [`Tree::resolve`] but the target must be a directory. The target
    /// is visited too, since the caller is about to look inside it.
    pub(crate) fn resolve_dir(
        &self,
        parts: &[&str],
        visit: &mut dyn FnMut(&Node) -> FsResult<()>,
    ) -> FsResult<NodeId> {
        let id = self.resolve(parts, visit)?;
        let dir = self.node(id)?;
        dir.entries()?;
        visit(dir)?;
        Ok(id)
    }

    pub(crate) fn child(&self, dir: NodeId, name: &str) -> FsResult<Option<&Entry>> {
        Ok(self.node(dir)?.entries()?.get(&self.key(name)))
    }

    /// Add `name -> child` to `dir`, bumping the directory's times.
    pub(crate) fn link(&mut self, dir: NodeId, name: &str, child: NodeId, now: i64) -> FsResult<()> {
        let key = self.key(name);
        self.update(dir, |node| {
            let entries = node.entries_mut()?;
            if entries.contains_key(&key) {
                return Err(FsError::AlreadyExists);
            }
            entries.insert(
                key,
                Entry {
                    name: name.to_owned(),
                    node: child,
                },
            );
            node.meta.touch_modified(now);
            Ok(())
        })
    }

    /// Remove `name` from `dir` and return the entry it held.
    pub(crate) fn unlink(&mut self, dir: NodeId, name: &str, now: i64) -> FsResult<Entry> {
        let key = self.key(name);
        self.update(dir, |node| {
            let entry = node.entries_mut()?.remove(&key).ok_or(FsError::NotFound)?;
            node.meta.touch_modified(now);
            Ok(entry)
        })
    }

    /// Change the stored spelling of an entry without moving it.
    pub(crate) fn rename_entry(&mut self, dir: NodeId, name: &str, now: i64) -> FsResult<()> {
        let key = self.key(name);
        self.update(dir, |node| {
            let entry = node.entries_mut()?.get_mut(&key).ok_or(FsError::NotFound)?;
            entry.name = name.to_owned();
            node.meta.touch_modified(now);
            Ok(())
        })
    }

    /// Children of a directory with their nodes, ordered by key.
    pub(crate) fn list(&self, dir: NodeId) -> FsResult<Vec<(&Entry, &Arc<Node>)>> {
        let node = self.node(dir)?;
        node.entries()?
            .values()
            .map(|entry| Ok((entry, self.node(entry.node)?)))
            .collect()
    }

    /// Mark every content block reachable from this revision immutable.
    pub(crate) fn seal(&self) -> FsResult<usize> {
        let mut sealed = 0;
        for node in self.nodes() {
            if let NodeKind::File { streams } = &node.kind {
                for stream in streams.values() {
                    stream.content.seal()?;
                    sealed += 1;
                }
            }
        }
        Ok(sealed)
    }

    /// Copy of this revision without the given nodes.
    pub(crate) fn without(&self, ids: impl IntoIterator<Item = NodeId>) -> Tree {
        let mut copy = self.clone();
        for id in ids {
            copy.remove(id);
        }
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{InMemoryBackend, StorageBackend};

    fn dir(id: u64) -> Node {
        Node::directory(NodeId(id), Metadata::new(0o755, 0, 0, 0))
    }

    fn file(storage: &Arc<dyn StorageBackend>, id: u64, data: &[u8]) -> Node {
        let (primary, _) = Stream::empty(storage).unwrap().write(0, data).unwrap();
        Node::file(NodeId(id), Metadata::new(0o644, 0, 0, 0), primary)
    }

    fn no_check(_: &Node) -> FsResult<()> {
        Ok(())
    }

    #[test]
    fn path_rules() {
        assert_eq!(split_path(Path::new("/a//b/./c/")).unwrap(), vec!["a", "b", "c"]);
        assert!(split_path(Path::new("/")).unwrap().is_empty());
        assert!(split_path(Path::new("relative/x")).is_ok());
        assert!(matches!(split_path(Path::new("/a/../b")), Err(FsError::InvalidArgument)));
        assert!(matches!(split_path(Path::new("/a\0b")), Err(FsError::InvalidName)));
        let long = format!("/{}", "x".repeat(MAX_NAME_LEN + 1));
        assert!(matches!(split_path(Path::new(&long)), Err(FsError::InvalidName)));
        assert_eq!(join_path(&["a", "b"]), "/a/b");
        assert_eq!(join_path(&[]), "/");
    }

    #[test]
    fn resolve_and_list() {
        let storage: Arc<dyn StorageBackend> = Arc::new(InMemoryBackend::new());
        let mut tree = Tree::new(dir(1), CaseSensitivity::Sensitive);
        tree.insert(dir(2));
        tree.link(tree.root(), "docs", NodeId(2), 1).unwrap();
        tree.insert(file(&storage, 3, b"hi"));
        tree.link(NodeId(2), "a.txt", NodeId(3), 1).unwrap();

        let mut visited = Vec::new();
        let id = tree
            .resolve(&["docs", "a.txt"], &mut |node: &Node| {
                visited.push(node.id);
                Ok(())
            })
            .unwrap();
        assert_eq!(id, NodeId(3));
        assert_eq!(visited, vec![NodeId(1), NodeId(2)]);

        // A directory target is searched as well.
        visited.clear();
        let id = tree
            .resolve_dir(&["docs"], &mut |node: &Node| {
                visited.push(node.id);
                Ok(())
            })
            .unwrap();
        assert_eq!(id, NodeId(2));
        assert_eq!(visited, vec![NodeId(1), NodeId(2)]);
        assert!(matches!(
            tree.resolve_dir(&["docs"], &mut |node: &Node| {
                if node.id == NodeId(2) {
                    Err(FsError::AccessDenied)
                } else {
                    Ok(())
                }
            }),
            Err(FsError::AccessDenied)
        ));
        assert!(matches!(
            tree.resolve_dir(&["docs", "a.txt"], &mut no_check),
            Err(FsError::NotADirectory)
        ));

        assert!(matches!(
            tree.resolve(&["docs", "a.txt", "x"], &mut no_check),
            Err(FsError::NotADirectory)
        ));
        assert!(matches!(tree.resolve(&["nope"], &mut no_check), Err(FsError::NotFound)));
        assert!(matches!(
            tree.link(NodeId(2), "a.txt", NodeId(3), 1),
            Err(FsError::AlreadyExists)
        ));

        let listing = tree.list(NodeId(2)).unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].0.name, "a.txt");
        assert_eq!(listing[0].1.len(), 2);
    }

    #[test]
    fn case_insensitive_keys_preserve_spelling() {
        let mut tree = Tree::new(dir(1), CaseSensitivity::InsensitivePreserving);
        tree.insert(dir(2));
        tree.link(tree.root(), "Foo", NodeId(2), 1).unwrap();
        assert_eq!(tree.resolve(&["fOO"], &mut no_check).unwrap(), NodeId(2));
        assert!(matches!(
            tree.link(tree.root(), "FOO", NodeId(2), 1),
            Err(FsError::AlreadyExists)
        ));
        tree.rename_entry(tree.root(), "FOO", 2).unwrap();
        assert_eq!(tree.list(tree.root()).unwrap()[0].0.name, "FOO");
    }

    #[test]
    fn revisions_are_isolated() {
        let storage: Arc<dyn StorageBackend> = Arc::new(InMemoryBackend::new());
        let mut tree = Tree::new(dir(1), CaseSensitivity::Sensitive);
        tree.insert(file(&storage, 2, b"v1"));
        tree.link(tree.root(), "f", NodeId(2), 1).unwrap();

        let frozen = tree.clone();
        tree.unlink(tree.root(), "f", 2).unwrap();
        tree.insert(dir(3));
        tree.link(tree.root(), "d", NodeId(3), 2).unwrap();

        assert!(frozen.child(frozen.root(), "f").unwrap().is_some());
        assert!(frozen.child(frozen.root(), "d").unwrap().is_none());
        assert!(tree.child(tree.root(), "f").unwrap().is_none());
        // The file node is unreferenced but still present until removed.
        assert!(tree.node(NodeId(2)).is_ok());
        let pruned = tree.without([NodeId(2)]);
        assert!(matches!(pruned.node(NodeId(2)), Err(FsError::NotFound)));
        assert!(frozen.node(NodeId(2)).is_ok());
    }

    #[test]
    fn failed_update_leaves_revision_untouched() {
        let mut tree = Tree::new(dir(1), CaseSensitivity::Sensitive);
        let before = tree.node(tree.root()).unwrap().clone();
        let result: FsResult<()> = tree.update(tree.root(), |node| {
            node.meta.mode = 0;
            Err(FsError::Busy)
        });
        assert!(result.is_err());
        assert!(Arc::ptr_eq(&before, tree.node(tree.root()).unwrap()));
    }

    #[test]
    fn seal_covers_every_stream() {
        let storage: Arc<dyn StorageBackend> = Arc::new(InMemoryBackend::new());
        let mut tree = Tree::new(dir(1), CaseSensitivity::Sensitive);
        tree.insert(file(&storage, 2, b"a"));
        tree.insert(file(&storage, 3, b"b"));
        assert_eq!(tree.seal().unwrap(), 2);
        let content = tree.node(NodeId(2)).unwrap().stream(PRIMARY_STREAM).unwrap().content.id();
        assert!(!storage.is_exclusive(content));
    }
}
