// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! AgentFS Core - a branchable in-memory filesystem
//!
//! A platform-neutral filesystem engine with copy-on-write snapshots and
//! writable branches, per-process branch binding, Windows-style share modes
//! and byte-range locks, extended attributes, named streams and synchronous
//! change events. Host glue (FUSE, WinFsp, FSKit) translates OS requests
//! into calls on [`FsCore`].

pub mod config;
pub mod error;
pub mod fault;
pub mod storage;
pub mod types;
pub mod vfs;

mod branches;
mod events;
mod locking;
mod metadata;
mod pmap;
mod process;
mod tree;

pub use config::*;
pub use error::{FsError, FsResult};
pub use fault::{FaultErrno, FaultInjector, FaultOp, FaultPolicy, FaultPolicySummary, FaultRule};
pub use process::PID;
pub use storage::{
    create_backend, DiskBackend, InMemoryBackend, SpilloverBackend, StorageBackend, StorageUsage,
};
pub use types::*;
pub use vfs::FsCore;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_instance_has_only_the_default_branch() {
        let fs = FsCore::new(FsConfig::default()).unwrap();
        let branches = fs.branch_list();
        assert_eq!(branches.len(), 1);
        assert_eq!(branches[0].id, BranchId::DEFAULT);
        assert!(fs.snapshot_list().is_empty());
        assert_eq!(fs.stats().open_handles, 0);
    }

    #[test]
    fn rejects_invalid_configuration() {
        let config = FsConfig {
            limits: FsLimits {
                max_open_handles: 0,
                ..FsLimits::default()
            },
            ..FsConfig::default()
        };
        assert!(matches!(FsCore::new(config), Err(FsError::InvalidArgument)));
    }
}
