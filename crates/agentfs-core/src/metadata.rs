// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Node metadata, extended attributes and data streams

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::SecurityPolicy;
use crate::error::{FsError, FsResult};
use crate::storage::StorageBackend;
use crate::{ContentId, FileTimes};

/// Longest xattr, stream or directory entry name, in bytes.
pub(crate) const MAX_NAME_LEN: usize = 255;
/// Largest xattr value, in bytes.
pub(crate) const MAX_XATTR_VALUE: usize = 64 * 1024;
/// Key of the unnamed primary data stream.
pub(crate) const PRIMARY_STREAM: &str = "";

/// Owned reference to a storage block. Cloning takes another reference and
/// dropping gives it back, so a block lives exactly as long as some node
/// version points at it.
pub(crate) struct ContentRef {
    id: ContentId,
    storage: Arc<dyn StorageBackend>,
}

impl ContentRef {
    pub(crate) fn allocate(storage: &Arc<dyn StorageBackend>, initial: &[u8]) -> FsResult<Self> {
        let id = storage.allocate(initial)?;
        Ok(Self {
            id,
            storage: storage.clone(),
        })
    }

    #[cfg(test)]
    pub(crate) fn id(&self) -> ContentId {
        self.id
    }

    /// `None` when this block can be written in place. Otherwise a private
    /// copy that the caller must write to and adopt instead.
    pub(crate) fn detach(&self) -> FsResult<Option<ContentRef>> {
        if self.storage.is_exclusive(self.id) {
            return Ok(None);
        }
        let id = self.storage.clone_cow(self.id)?;
        tracing::trace!(from = %self.id, to = %id, "copy-on-write");
        Ok(Some(Self {
            id,
            storage: self.storage.clone(),
        }))
    }

    pub(crate) fn seal(&self) -> FsResult<()> {
        self.storage.seal(self.id)
    }

    pub(crate) fn read(&self, offset: u64, buf: &mut [u8]) -> FsResult<usize> {
        self.storage.read(self.id, offset, buf)
    }
}

impl Clone for ContentRef {
    fn clone(&self) -> Self {
        self.storage.retain(self.id);
        Self {
            id: self.id,
            storage: self.storage.clone(),
        }
    }
}

impl Drop for ContentRef {
    fn drop(&mut self) {
        self.storage.release(self.id);
    }
}

impl std::fmt::Debug for ContentRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ContentRef").field(&self.id).finish()
    }
}

/// One data stream of a file: the primary content or a named stream.
#[derive(Clone, Debug)]
pub(crate) struct Stream {
    pub(crate) content: ContentRef,
    pub(crate) len: u64,
}

impl Stream {
    pub(crate) fn empty(storage: &Arc<dyn StorageBackend>) -> FsResult<Self> {
        Ok(Self {
            content: ContentRef::allocate(storage, &[])?,
            len: 0,
        })
    }

    /// Writes through to storage and returns the stream value for the next
    /// node version. The block is written before the successor takes its
    /// reference, so an unshared block is updated in place.
    pub(crate) fn write(&self, offset: u64, data: &[u8]) -> FsResult<(Stream, usize)> {
        let fresh = self.content.detach()?;
        let target = fresh.as_ref().unwrap_or(&self.content);
        let written = target.storage.write(target.id, offset, data)?;
        let next = Stream {
            content: fresh.unwrap_or_else(|| self.content.clone()),
            len: self.len.max(offset + written as u64),
        };
        Ok((next, written))
    }

    pub(crate) fn truncate(&self, new_len: u64) -> FsResult<Stream> {
        if new_len == self.len {
            return Ok(self.clone());
        }
        let fresh = self.content.detach()?;
        let target = fresh.as_ref().unwrap_or(&self.content);
        target.storage.truncate(target.id, new_len)?;
        Ok(Stream {
            content: fresh.unwrap_or_else(|| self.content.clone()),
            len: new_len,
        })
    }

    pub(crate) fn read(&self, offset: u64, buf: &mut [u8]) -> FsResult<usize> {
        if offset >= self.len {
            return Ok(0);
        }
        let available = (self.len - offset).min(buf.len() as u64) as usize;
        self.content.read(offset, &mut buf[..available])
    }
}

/// Security identity of a process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Credentials {
    pub(crate) uid: u32,
    pub(crate) gid: u32,
    pub(crate) groups: Vec<u32>,
}

impl Credentials {
    pub(crate) fn new(uid: u32, gid: u32) -> Self {
        Self {
            uid,
            gid,
            groups: vec![gid],
        }
    }

    fn in_group(&self, gid: u32) -> bool {
        self.gid == gid || self.groups.contains(&gid)
    }
}

/// Requested access for a permission check.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Access {
    pub(crate) read: bool,
    pub(crate) write: bool,
    pub(crate) exec: bool,
}

impl Access {
    pub(crate) const SEARCH: Access = Access {
        read: false,
        write: false,
        exec: true,
    };
    /// Adding or removing entries in a directory.
    pub(crate) const MODIFY_DIR: Access = Access {
        read: false,
        write: true,
        exec: true,
    };
}

/// Attributes shared by every node kind.
#[derive(Clone, Debug)]
pub(crate) struct Metadata {
    /// Permission bits, `0o7777`.
    pub(crate) mode: u32,
    pub(crate) uid: u32,
    pub(crate) gid: u32,
    pub(crate) times: FileTimes,
    pub(crate) nlink: u32,
    pub(crate) xattrs: BTreeMap<String, Arc<[u8]>>,
}

impl Metadata {
    pub(crate) fn new(mode: u32, uid: u32, gid: u32, now: i64) -> Self {
        Self {
            mode: mode & 0o7777,
            uid,
            gid,
            times: FileTimes {
                atime: now,
                mtime: now,
                ctime: now,
                birthtime: now,
            },
            nlink: 1,
            xattrs: BTreeMap::new(),
        }
    }

    pub(crate) fn touch_modified(&mut self, now: i64) {
        self.times.mtime = now;
        self.times.ctime = now;
    }

    pub(crate) fn touch_changed(&mut self, now: i64) {
        self.times.ctime = now;
    }

    pub(crate) fn permits(&self, who: &Credentials, access: Access, policy: &SecurityPolicy) -> bool {
        if policy.root_bypass_permissions && who.uid == 0 {
            return true;
        }
        let shift = if who.uid == self.uid {
            6
        } else if who.in_group(self.gid) {
            3
        } else {
            0
        };
        let granted = (self.mode >> shift) & 0o7;
        (!access.read || granted & 0o4 != 0)
            && (!access.write || granted & 0o2 != 0)
            && (!access.exec || granted & 0o1 != 0)
    }

    /// Owner-only operations (chmod, chown, utimes).
    pub(crate) fn owned_by(&self, who: &Credentials, policy: &SecurityPolicy) -> bool {
        who.uid == self.uid || (policy.root_bypass_permissions && who.uid == 0)
    }

    pub(crate) fn xattr_get(&self, name: &str) -> FsResult<Vec<u8>> {
        self.xattrs
            .get(name)
            .map(|v| v.to_vec())
            .ok_or(FsError::NotFound)
    }

    pub(crate) fn xattr_set(&mut self, name: &str, value: &[u8]) -> FsResult<()> {
        validate_xattr_name(name)?;
        if value.len() > MAX_XATTR_VALUE {
            return Err(FsError::InvalidArgument);
        }
        self.xattrs.insert(name.to_owned(), Arc::from(value));
        Ok(())
    }

    pub(crate) fn xattr_remove(&mut self, name: &str) -> FsResult<()> {
        self.xattrs.remove(name).map(|_| ()).ok_or(FsError::NotFound)
    }

    pub(crate) fn xattr_names(&self) -> Vec<String> {
        self.xattrs.keys().cloned().collect()
    }
}

pub(crate) fn validate_xattr_name(name: &str) -> FsResult<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN || name.contains('\0') {
        return Err(FsError::InvalidArgument);
    }
    Ok(())
}

/// Named streams exclude the primary stream and path-like names.
pub(crate) fn validate_stream_name(name: &str) -> FsResult<()> {
    if name.is_empty()
        || name.len() > MAX_NAME_LEN
        || name.contains(['/', ':', '\0'])
    {
        return Err(FsError::InvalidName);
    }
    Ok(())
}
