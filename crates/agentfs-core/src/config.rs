// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Configuration types for AgentFS Core

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{FsError, FsResult};

/// How directory entry names are matched.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseSensitivity {
    #[default]
    Sensitive,
    /// Lookups fold case, stored names keep the case used at creation.
    InsensitivePreserving,
}

impl CaseSensitivity {
    /// Key under which a name is indexed inside a directory.
    pub fn key(self, name: &str) -> String {
        match self {
            CaseSensitivity::Sensitive => name.to_owned(),
            CaseSensitivity::InsensitivePreserving => name.to_lowercase(),
        }
    }
}

/// Memory policy for storage backends
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryPolicy {
    /// Content beyond this many bytes spills to disk. `None` keeps
    /// everything in memory.
    pub max_bytes_in_memory: Option<u64>,
    /// Where spilled blocks live. A private temporary directory is used
    /// when unset.
    pub spill_directory: Option<PathBuf>,
}

impl Default for MemoryPolicy {
    fn default() -> Self {
        Self {
            max_bytes_in_memory: Some(1024 * 1024 * 1024), // 1GB
            spill_directory: None,
        }
    }
}

/// System limits
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FsLimits {
    pub max_open_handles: u32,
    pub max_branches: u32,
    pub max_snapshots: u32,
}

impl Default for FsLimits {
    fn default() -> Self {
        Self {
            max_open_handles: 10000,
            max_branches: 1000,
            max_snapshots: 10000,
        }
    }
}

/// Kernel cache hints. The core does not interpret these; glue layers read
/// them back through `FsCore::config` when they set up their mounts.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CachePolicy {
    pub attr_ttl_ms: u32,
    pub entry_ttl_ms: u32,
    pub negative_ttl_ms: u32,
    pub enable_readdir_plus: bool,
    pub auto_cache: bool,
    pub writeback_cache: bool,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            attr_ttl_ms: 1000,
            entry_ttl_ms: 1000,
            negative_ttl_ms: 1000,
            enable_readdir_plus: true,
            auto_cache: true,
            writeback_cache: false,
        }
    }
}

/// Security/permissions/ownership policy
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityPolicy {
    /// Enforce POSIX permission bits for registered processes.
    pub enforce_posix_permissions: bool,
    /// Owner of nodes created by processes without registered credentials.
    pub default_uid: u32,
    pub default_gid: u32,
    /// Emulate the Unix root DAC override.
    pub root_bypass_permissions: bool,
}

/// What happens to process bindings when their branch is deleted.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BindingPolicy {
    /// Refuse `delete_branch` with `Busy` while any process is bound to the
    /// branch. When false the bound processes fall back to the default
    /// branch.
    pub refuse_delete_of_bound_branch: bool,
}

impl Default for BindingPolicy {
    fn default() -> Self {
        Self {
            refuse_delete_of_bound_branch: true,
        }
    }
}

/// Main filesystem configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FsConfig {
    pub case_sensitivity: CaseSensitivity,
    pub memory: MemoryPolicy,
    pub limits: FsLimits,
    pub cache: CachePolicy,
    pub enable_xattrs: bool,
    pub enable_ads: bool,
    pub track_events: bool,
    pub security: SecurityPolicy,
    pub binding: BindingPolicy,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            case_sensitivity: CaseSensitivity::Sensitive,
            memory: MemoryPolicy::default(),
            limits: FsLimits::default(),
            cache: CachePolicy::default(),
            enable_xattrs: true,
            enable_ads: false,
            track_events: true,
            security: SecurityPolicy::default(),
            binding: BindingPolicy::default(),
        }
    }
}

impl FsConfig {
    pub fn validate(&self) -> FsResult<()> {
        let limits = &self.limits;
        if limits.max_open_handles == 0 || limits.max_branches == 0 || limits.max_snapshots == 0 {
            return Err(FsError::InvalidArgument);
        }
        if self.memory.max_bytes_in_memory == Some(0) {
            return Err(FsError::InvalidArgument);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: FsConfig = serde_json::from_str(
            r#"{ "case_sensitivity": "insensitive_preserving", "limits": { "max_branches": 4 } }"#,
        )
        .expect("config");
        assert_eq!(config.case_sensitivity, CaseSensitivity::InsensitivePreserving);
        assert_eq!(config.limits.max_branches, 4);
        assert_eq!(config.limits.max_open_handles, 10000);
        assert!(config.enable_xattrs);
        assert!(config.binding.refuse_delete_of_bound_branch);
    }

    #[test]
    fn zero_limits_are_rejected() {
        let mut config = FsConfig::default();
        assert!(config.validate().is_ok());
        config.limits.max_open_handles = 0;
        assert!(matches!(config.validate(), Err(FsError::InvalidArgument)));

        let mut config = FsConfig::default();
        config.memory.max_bytes_in_memory = Some(0);
        assert!(matches!(config.validate(), Err(FsError::InvalidArgument)));
    }

    #[test]
    fn case_keys() {
        assert_eq!(CaseSensitivity::Sensitive.key("Foo.txt"), "Foo.txt");
        assert_eq!(CaseSensitivity::InsensitivePreserving.key("Foo.TXT"), "foo.txt");
    }
}
