// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Core type definitions for AgentFS

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// ULID-like layout: millisecond timestamp followed by a process-wide counter.
fn generate_ulid() -> [u8; 16] {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default();
    let seq = ID_COUNTER.fetch_add(1, Ordering::Relaxed);

    let mut bytes = [0u8; 16];
    bytes[0..8].copy_from_slice(&now.to_be_bytes());
    bytes[8..16].copy_from_slice(&seq.to_be_bytes());
    bytes
}

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(into = "String", try_from = "String")]
        pub struct $name(pub [u8; 16]);

        impl $name {
            pub fn new() -> Self {
                Self(generate_ulid())
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let mut bytes = [0u8; 16];
                hex::decode_to_slice(s, &mut bytes)
                    .map_err(|e| format!("invalid {}: {e}", stringify!($name)))?;
                Ok(Self(bytes))
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> String {
                id.to_string()
            }
        }

        impl TryFrom<String> for $name {
            type Error = String;

            fn try_from(s: String) -> Result<Self, Self::Error> {
                s.parse()
            }
        }
    };
}

opaque_id! {
    /// Opaque snapshot identifier (ULID-like)
    SnapshotId
}

impl Default for SnapshotId {
    fn default() -> Self {
        Self::new()
    }
}

opaque_id! {
    /// Opaque branch identifier
    BranchId
}

impl BranchId {
    /// Special default branch ID for the initial branch
    pub const DEFAULT: BranchId = BranchId([0u8; 16]);
}

impl Default for BranchId {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Branch information
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchInfo {
    pub id: BranchId,
    /// Snapshot the branch was created from. Branches cloned from another
    /// branch's live state have no parent snapshot.
    pub parent: Option<SnapshotId>,
    pub name: Option<String>,
}

/// Snapshot information
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub id: SnapshotId,
    pub name: Option<String>,
    /// Branch whose state was captured.
    pub branch: BranchId,
}

/// Opaque handle identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub u64);

impl HandleId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

/// File timestamps, in seconds since the Unix epoch
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FileTimes {
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub birthtime: i64,
}

impl FileTimes {
    pub fn now() -> Self {
        let now = now_secs();
        Self {
            atime: now,
            mtime: now,
            ctime: now,
            birthtime: now,
        }
    }
}

pub(crate) fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// File permissions
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMode {
    pub read: bool,
    pub write: bool,
    pub exec: bool,
}

impl FileMode {
    /// Decode one `rwx` triple from the low three bits.
    pub fn from_bits(bits: u32) -> Self {
        Self {
            read: bits & 0o4 != 0,
            write: bits & 0o2 != 0,
            exec: bits & 0o1 != 0,
        }
    }

    pub fn bits(self) -> u32 {
        (self.read as u32) << 2 | (self.write as u32) << 1 | self.exec as u32
    }
}

/// File attributes
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attributes {
    pub len: u64,
    pub times: FileTimes,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub is_dir: bool,
    pub is_symlink: bool,
    pub mode_user: FileMode,
    pub mode_group: FileMode,
    pub mode_other: FileMode,
}

impl Attributes {
    /// Permission bits (`0o777`).
    pub fn permissions(&self) -> u32 {
        self.mode_user.bits() << 6 | self.mode_group.bits() << 3 | self.mode_other.bits()
    }

    /// POSIX `st_mode`: file type bits plus permissions.
    pub fn mode(&self) -> u32 {
        let kind = if self.is_dir {
            libc::S_IFDIR
        } else if self.is_symlink {
            libc::S_IFLNK
        } else {
            libc::S_IFREG
        };
        kind as u32 | self.permissions()
    }
}

/// Directory entry information
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    /// Name as stored, in the case used at creation.
    pub name: String,
    pub is_dir: bool,
    pub is_symlink: bool,
    pub len: u64,
}

/// Extended attribute entry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct XattrEntry {
    pub name: String,
    pub value: Vec<u8>,
}

/// Named secondary data stream attached to a file
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamSpec {
    pub name: String,
    pub len: u64,
}

/// File open options
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenOptions {
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub truncate: bool,
    pub append: bool,
    /// Request delete access (Windows `DELETE`).
    pub delete: bool,
    /// Accesses other handles on the same node may hold concurrently.
    pub share: Vec<ShareMode>,
    /// Named stream to open instead of the primary content.
    pub stream: Option<String>,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            read: true,
            write: false,
            create: false,
            truncate: false,
            append: false,
            delete: false,
            share: ShareMode::ALL.to_vec(),
            stream: None,
        }
    }
}

impl OpenOptions {
    pub fn read_only() -> Self {
        Self::default()
    }

    pub fn read_write() -> Self {
        Self {
            write: true,
            ..Self::default()
        }
    }

    /// Read-write, creating the file when it does not exist.
    pub fn create() -> Self {
        Self {
            write: true,
            create: true,
            ..Self::default()
        }
    }

    pub fn with_share(mut self, share: &[ShareMode]) -> Self {
        self.share = share.to_vec();
        self
    }

    pub fn with_stream(mut self, name: impl Into<String>) -> Self {
        self.stream = Some(name.into());
        self
    }

    pub(crate) fn shares(&self, mode: ShareMode) -> bool {
        self.share.contains(&mode)
    }
}

/// Share mode for Windows compatibility
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShareMode {
    Read,
    Write,
    Delete,
}

impl ShareMode {
    pub const ALL: [ShareMode; 3] = [ShareMode::Read, ShareMode::Write, ShareMode::Delete];
}

/// Lock kind for byte-range locking
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockKind {
    Shared,
    Exclusive,
}

/// Byte range lock specification
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockRange {
    pub offset: u64,
    pub len: u64,
    pub kind: LockKind,
}

impl LockRange {
    pub fn shared(offset: u64, len: u64) -> Self {
        Self {
            offset,
            len,
            kind: LockKind::Shared,
        }
    }

    pub fn exclusive(offset: u64, len: u64) -> Self {
        Self {
            offset,
            len,
            kind: LockKind::Exclusive,
        }
    }

    /// Exclusive end offset, `None` for empty or overflowing ranges.
    pub(crate) fn end(&self) -> Option<u64> {
        if self.len == 0 {
            return None;
        }
        self.offset.checked_add(self.len)
    }
}

/// Content identifier for storage backend
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentId(pub u64);

impl ContentId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for ContentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Event kinds for filesystem change notifications
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    Created {
        branch: BranchId,
        path: String,
    },
    Removed {
        branch: BranchId,
        path: String,
    },
    Modified {
        branch: BranchId,
        path: String,
    },
    Renamed {
        branch: BranchId,
        from: String,
        to: String,
    },
    BranchCreated {
        id: BranchId,
        name: Option<String>,
    },
    SnapshotCreated {
        id: SnapshotId,
        name: Option<String>,
    },
    BranchDeleted {
        id: BranchId,
    },
    SnapshotDeleted {
        id: SnapshotId,
    },
}

/// Event sink trait for receiving filesystem change notifications.
///
/// Sinks run inline on the thread performing the mutation, while the
/// mutated branch is still locked. They must return quickly and must not
/// call back into the `FsCore` that delivered the event.
#[cfg_attr(test, mockall::automock)]
pub trait EventSink: Send + Sync {
    fn on_event(&self, evt: &EventKind);
}

/// Opaque event subscription identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

impl SubscriptionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

/// Filesystem statistics
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct FsStats {
    pub branches: u32,
    pub snapshots: u32,
    pub open_handles: u32,
    pub bytes_in_memory: u64,
    pub bytes_spilled: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_round_trip_through_hex() {
        let id = BranchId::new();
        let text = id.to_string();
        assert_eq!(text.len(), 32);
        assert_eq!(text.parse::<BranchId>().expect("parse"), id);
        assert!("xyz".parse::<SnapshotId>().is_err());
        assert_eq!(BranchId::DEFAULT.to_string(), "0".repeat(32));
    }

    #[test]
    fn generated_ids_are_unique() {
        let a = SnapshotId::new();
        let b = SnapshotId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn events_serialize_as_tagged_json() {
        let evt = EventKind::Created {
            branch: BranchId::DEFAULT,
            path: "/a".into(),
        };
        let json = serde_json::to_value(&evt).expect("json");
        assert_eq!(json["kind"], "created");
        assert_eq!(json["path"], "/a");
        assert_eq!(json["branch"], "0".repeat(32));
    }

    #[test]
    fn open_options_json_defaults_share_everything() {
        let opts: OpenOptions = serde_json::from_str(r#"{"write": true}"#).expect("opts");
        assert!(opts.read && opts.write && !opts.create);
        assert_eq!(opts.share, ShareMode::ALL.to_vec());
    }

    #[test]
    fn attribute_mode_bits() {
        let attrs = Attributes {
            len: 0,
            times: FileTimes::default(),
            uid: 0,
            gid: 0,
            nlink: 1,
            is_dir: true,
            is_symlink: false,
            mode_user: FileMode::from_bits(7),
            mode_group: FileMode::from_bits(5),
            mode_other: FileMode::from_bits(0),
        };
        assert_eq!(attrs.permissions(), 0o750);
        assert_eq!(attrs.mode(), libc::S_IFDIR as u32 | 0o750);
    }

    #[test]
    fn lock_range_end() {
        assert_eq!(LockRange::shared(5, 10).end(), Some(15));
        assert_eq!(LockRange::shared(5, 0).end(), None);
        assert_eq!(LockRange::exclusive(u64::MAX, 2).end(), None);
    }
}
