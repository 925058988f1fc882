// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Process identity and process-to-branch bindings

use parking_lot::RwLock;
use std::collections::HashMap;

use crate::metadata::Credentials;
use crate::BranchId;

/// Process identifier for type safety in the filesystem API.
///
/// Tokens normally come from [`crate::FsCore::register_process`], which
/// also records credentials. An unregistered `PID` still works: it acts on
/// the default branch (or its explicit binding) without permission checks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PID(pub(crate) u32);

impl PID {
    pub fn new(pid: u32) -> Self {
        Self(pid)
    }

    /// The process this library is running in.
    pub fn current() -> Self {
        Self(std::process::id())
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

#[derive(Default)]
struct ProcessState {
    bindings: HashMap<u32, BranchId>,
    identities: HashMap<u32, Credentials>,
    parents: HashMap<u32, u32>,
}

impl ProcessState {
    /// First binding found walking up from `pid` through its ancestors.
    fn inherited_binding(&self, pid: u32) -> Option<BranchId> {
        let mut current = pid;
        // Bounded walk guards against parent cycles.
        for _ in 0..=self.parents.len() {
            if let Some(branch) = self.bindings.get(&current) {
                return Some(*branch);
            }
            match self.parents.get(&current) {
                Some(parent) if *parent != current => current = *parent,
                _ => break,
            }
        }
        None
    }
}

/// Table owned by one `FsCore`, mapping OS processes to their branch and
/// credentials.
#[derive(Default)]
pub(crate) struct ProcessTable {
    state: RwLock<ProcessState>,
}

impl ProcessTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Record credentials and inherit the parent's binding. Registering an
    /// already known process only refreshes its credentials.
    pub(crate) fn register(&self, pid: u32, parent_pid: u32, uid: u32, gid: u32) -> PID {
        let mut state = self.state.write();
        if let Some(existing) = state.identities.get_mut(&pid) {
            *existing = Credentials::new(uid, gid);
            return PID(pid);
        }
        state.identities.insert(pid, Credentials::new(uid, gid));
        if parent_pid != pid {
            state.parents.insert(pid, parent_pid);
        }
        if let Some(branch) = state.inherited_binding(parent_pid) {
            tracing::debug!(pid, parent_pid, %branch, "process inherits branch binding");
            state.bindings.insert(pid, branch);
        }
        PID(pid)
    }

    pub(crate) fn bind(&self, pid: u32, branch: BranchId) {
        self.state.write().bindings.insert(pid, branch);
        tracing::debug!(pid, %branch, "process bound to branch");
    }

    pub(crate) fn unbind(&self, pid: u32) {
        if let Some(branch) = self.state.write().bindings.remove(&pid) {
            tracing::debug!(pid, %branch, "process unbound");
        }
    }

    pub(crate) fn binding(&self, pid: u32) -> Option<BranchId> {
        self.state.read().bindings.get(&pid).copied()
    }

    /// Branch the process acts on; unbound processes use the default branch.
    pub(crate) fn branch_of(&self, pid: u32) -> BranchId {
        self.binding(pid).unwrap_or(BranchId::DEFAULT)
    }

    pub(crate) fn credentials(&self, pid: u32) -> Option<Credentials> {
        self.state.read().identities.get(&pid).cloned()
    }

    /// Forget everything about an exited process. Children keep the
    /// bindings they inherited at registration.
    pub(crate) fn exited(&self, pid: u32) {
        let mut state = self.state.write();
        state.bindings.remove(&pid);
        state.identities.remove(&pid);
        state.parents.remove(&pid);
        state.parents.retain(|_, parent| *parent != pid);
    }

    pub(crate) fn bound_to(&self, branch: BranchId) -> Vec<u32> {
        let state = self.state.read();
        let mut pids: Vec<u32> = state
            .bindings
            .iter()
            .filter(|(_, b)| **b == branch)
            .map(|(pid, _)| *pid)
            .collect();
        pids.sort_unstable();
        pids
    }

    pub(crate) fn unbind_branch(&self, branch: BranchId) -> usize {
        let mut state = self.state.write();
        let before = state.bindings.len();
        state.bindings.retain(|_, b| *b != branch);
        before - state.bindings.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbound_processes_use_default_branch() {
        let table = ProcessTable::new();
        assert_eq!(table.branch_of(42), BranchId::DEFAULT);
        let branch = BranchId::new();
        table.bind(42, branch);
        assert_eq!(table.branch_of(42), branch);
        table.unbind(42);
        assert_eq!(table.branch_of(42), BranchId::DEFAULT);
    }

    #[test]
    fn children_inherit_binding_through_ancestors() {
        let table = ProcessTable::new();
        let branch = BranchId::new();
        table.register(100, 100, 1000, 1000);
        table.bind(100, branch);
        table.register(101, 100, 1000, 1000);
        table.register(102, 101, 1000, 1000);
        assert_eq!(table.binding(102), Some(branch));

        // Later rebinding of the parent does not move registered children.
        let other = BranchId::new();
        table.bind(100, other);
        assert_eq!(table.binding(101), Some(branch));
        assert_eq!(table.bound_to(branch), vec![101, 102]);
    }

    #[test]
    fn reregistration_refreshes_credentials_only() {
        let table = ProcessTable::new();
        table.register(7, 1, 1000, 100);
        let branch = BranchId::new();
        table.bind(7, branch);
        table.register(7, 1, 0, 0);
        assert_eq!(table.credentials(7), Some(Credentials::new(0, 0)));
        assert_eq!(table.binding(7), Some(branch));
    }

    #[test]
    fn exit_clears_state() {
        let table = ProcessTable::new();
        let branch = BranchId::new();
        table.register(5, 1, 0, 0);
        table.bind(5, branch);
        table.bind(6, branch);
        table.exited(5);
        assert!(table.credentials(5).is_none());
        assert_eq!(table.binding(5), None);
        assert_eq!(table.unbind_branch(branch), 1);
        assert!(table.bound_to(branch).is_empty());
    }
}
