// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! C ABI for AgentFS Core
//!
//! Instances live in a process-wide registry and are addressed by an opaque
//! `u64`. Every entry point returns an [`AfResult`]; outputs go through
//! caller-provided pointers. Configuration and open options travel as UTF-8
//! JSON so the ABI stays small as options grow.

use agentfs_core::{CaseSensitivity, FsConfig, FsCore, FsError, MemoryPolicy, OpenOptions};
use lazy_static::lazy_static;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

mod c_api;
mod logging;

pub use c_api::*;

/// Bumped whenever an exported signature or output layout changes.
pub const AF_ABI_VERSION: u32 = 1;

/// Result codes. Error values equal the matching Linux errno.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AfResult {
    AfOk = 0,
    AfErrNotFound = 2,
    AfErrIo = 5,
    AfErrBadf = 9,
    AfErrAcces = 13,
    AfErrBusy = 16,
    AfErrExist = 17,
    AfErrNotDir = 20,
    AfErrIsDir = 21,
    AfErrInval = 22,
    AfErrMfile = 24,
    AfErrNoSpc = 28,
    AfErrIlseq = 84,
    AfErrNotSup = 95,
}

impl From<&FsError> for AfResult {
    fn from(err: &FsError) -> Self {
        match err {
            FsError::NotFound => AfResult::AfErrNotFound,
            FsError::AlreadyExists => AfResult::AfErrExist,
            FsError::AccessDenied => AfResult::AfErrAcces,
            FsError::InvalidArgument => AfResult::AfErrInval,
            FsError::InvalidName => AfResult::AfErrIlseq,
            FsError::NotADirectory => AfResult::AfErrNotDir,
            FsError::IsADirectory => AfResult::AfErrIsDir,
            FsError::Busy => AfResult::AfErrBusy,
            FsError::TooManyOpenFiles => AfResult::AfErrMfile,
            FsError::BadFileDescriptor => AfResult::AfErrBadf,
            FsError::NoSpace => AfResult::AfErrNoSpc,
            FsError::Io(_) => AfResult::AfErrIo,
            FsError::Unsupported => AfResult::AfErrNotSup,
        }
    }
}

impl From<FsError> for AfResult {
    fn from(err: FsError) -> Self {
        AfResult::from(&err)
    }
}

pub(crate) type FfiResult<T = ()> = Result<T, AfResult>;

/// Collapse an internal result into the code returned to C.
pub(crate) fn finish(result: FfiResult) -> AfResult {
    match result {
        Ok(()) => AfResult::AfOk,
        Err(code) => code,
    }
}

lazy_static! {
    static ref INSTANCES: Mutex<HashMap<u64, Arc<FsCore>>> = Mutex::new(HashMap::new());
    static ref NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);
}

pub(crate) fn register_instance(core: FsCore) -> u64 {
    let id = NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed);
    INSTANCES
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(id, Arc::new(core));
    id
}

pub(crate) fn remove_instance(id: u64) -> Option<Arc<FsCore>> {
    INSTANCES
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&id)
}

/// Instance lookup. The registry lock is released before the caller uses
/// the core, so a long operation never blocks other instances.
pub(crate) fn instance(id: u64) -> FfiResult<Arc<FsCore>> {
    INSTANCES
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&id)
        .cloned()
        .ok_or(AfResult::AfErrInval)
}

/// Flat JSON configuration accepted by `af_fs_create`. Unknown keys are
/// ignored.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct FfiConfig {
    pub(crate) max_memory_bytes: Option<u64>,
    pub(crate) spill_directory: Option<PathBuf>,
    pub(crate) max_open_handles: Option<u32>,
    pub(crate) max_branches: Option<u32>,
    pub(crate) max_snapshots: Option<u32>,
    pub(crate) case_sensitivity: Option<CaseSensitivity>,
    pub(crate) enable_xattrs: Option<bool>,
    pub(crate) enable_ads: Option<bool>,
    pub(crate) track_events: Option<bool>,
    pub(crate) enforce_posix_permissions: Option<bool>,
    pub(crate) refuse_delete_of_bound_branch: Option<bool>,
    pub(crate) log_level: Option<String>,
    pub(crate) log_format: Option<logging::LogFormat>,
}

impl FfiConfig {
    pub(crate) fn from_json(json: &str) -> FfiResult<Self> {
        if json.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(json).map_err(|err| {
            tracing::debug!(%err, "rejecting malformed configuration");
            AfResult::AfErrInval
        })
    }

    pub(crate) fn into_fs_config(self) -> FsConfig {
        let mut config = FsConfig::default();
        if self.max_memory_bytes.is_some() || self.spill_directory.is_some() {
            config.memory = MemoryPolicy {
                max_bytes_in_memory: self.max_memory_bytes.or(config.memory.max_bytes_in_memory),
                spill_directory: self.spill_directory,
            };
        }
        if let Some(n) = self.max_open_handles {
            config.limits.max_open_handles = n;
        }
        if let Some(n) = self.max_branches {
            config.limits.max_branches = n;
        }
        if let Some(n) = self.max_snapshots {
            config.limits.max_snapshots = n;
        }
        if let Some(case) = self.case_sensitivity {
            config.case_sensitivity = case;
        }
        if let Some(flag) = self.enable_xattrs {
            config.enable_xattrs = flag;
        }
        if let Some(flag) = self.enable_ads {
            config.enable_ads = flag;
        }
        if let Some(flag) = self.track_events {
            config.track_events = flag;
        }
        if let Some(flag) = self.enforce_posix_permissions {
            config.security.enforce_posix_permissions = flag;
        }
        if let Some(flag) = self.refuse_delete_of_bound_branch {
            config.binding.refuse_delete_of_bound_branch = flag;
        }
        config
    }

    /// Install logging if the host asked for it.
    pub(crate) fn init_logging(&self) -> FfiResult {
        let Some(level) = &self.log_level else {
            return Ok(());
        };
        let level = logging::parse_level(level).map_err(|_| AfResult::AfErrInval)?;
        if let Err(err) = logging::init(level, self.log_format.unwrap_or_default()) {
            // Another subscriber is already in charge; keep using it.
            tracing::debug!(%err, "logging not installed");
        }
        Ok(())
    }
}

pub(crate) fn parse_open_options(json: &str) -> FfiResult<OpenOptions> {
    if json.trim().is_empty() {
        return Ok(OpenOptions::default());
    }
    serde_json::from_str(json).map_err(|_| AfResult::AfErrInval)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_match_errno() {
        assert_eq!(AfResult::from(FsError::NotFound) as i32, 2);
        assert_eq!(AfResult::from(FsError::Busy) as i32, 16);
        assert_eq!(AfResult::from(FsError::NoSpace) as i32, 28);
        assert_eq!(
            AfResult::from(FsError::Io(std::io::Error::other("disk"))),
            AfResult::AfErrIo
        );
        assert_eq!(AfResult::from(FsError::Unsupported) as i32, 95);
    }

    #[test]
    fn flat_config_maps_onto_core_config() {
        let json = r#"{
            "max_memory_bytes": 4096,
            "max_branches": 3,
            "case_sensitivity": "insensitive_preserving",
            "enable_ads": true,
            "enforce_posix_permissions": true,
            "refuse_delete_of_bound_branch": false,
            "some_future_key": 1
        }"#;
        let config = FfiConfig::from_json(json).unwrap().into_fs_config();
        assert_eq!(config.memory.max_bytes_in_memory, Some(4096));
        assert_eq!(config.memory.spill_directory, None);
        assert_eq!(config.limits.max_branches, 3);
        assert_eq!(config.limits.max_snapshots, FsConfig::default().limits.max_snapshots);
        assert_eq!(config.case_sensitivity, CaseSensitivity::InsensitivePreserving);
        assert!(config.enable_ads);
        assert!(config.enable_xattrs);
        assert!(config.security.enforce_posix_permissions);
        assert!(!config.binding.refuse_delete_of_bound_branch);
    }

    #[test]
    fn malformed_inputs_are_invalid() {
        assert!(matches!(FfiConfig::from_json("{"), Err(AfResult::AfErrInval)));
        assert!(matches!(
            FfiConfig::from_json(r#"{"max_branches": "many"}"#),
            Err(AfResult::AfErrInval)
        ));
        assert!(FfiConfig::from_json("").is_ok());
        assert!(matches!(
            parse_open_options(r#"{"share": ["everything"]}"#),
            Err(AfResult::AfErrInval)
        ));
        let opts = parse_open_options(r#"{"write": true, "create": true}"#).unwrap();
        assert!(opts.read && opts.write && opts.create);
    }
}
