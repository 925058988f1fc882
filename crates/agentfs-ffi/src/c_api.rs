// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Exported `extern "C"` entry points
//!
//! Pointer arguments must be valid for the lengths passed alongside them and
//! strings must be NUL-terminated UTF-8. Null pointers, bad UTF-8 and
//! undersized output buffers yield `AfErrInval`. Variable-sized outputs
//! report the size they need through `out_len`, also on `AfErrInval`, so a
//! caller can retry with a larger buffer.

#![allow(clippy::missing_safety_doc)]

use agentfs_core::{
    BranchId, EventKind, EventSink, FaultPolicy, FileTimes, FsCore, HandleId, LockRange,
    SnapshotId, SubscriptionId, PID,
};
use std::ffi::{c_char, c_void, CStr, CString};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use crate::{
    finish, instance, parse_open_options, register_instance, remove_instance, AfResult,
    FfiConfig, FfiResult, AF_ABI_VERSION,
};

/// Bytes needed for a hex id plus its NUL.
pub const AF_ID_LEN: usize = 33;
/// Size of the `af_getattr` output record.
pub const AF_ATTR_LEN: usize = 48;
/// Size of the `af_stats` output record.
pub const AF_STATS_LEN: usize = 28;

const ATTR_TYPE_FILE: u8 = 0;
const ATTR_TYPE_DIR: u8 = 1;
const ATTR_TYPE_SYMLINK: u8 = 2;

/// Receives every event as a NUL-terminated JSON object. The string is only
/// valid for the duration of the call.
pub type AfEventCallback = extern "C" fn(event_json: *const c_char, user_data: *mut c_void);

/// Run an entry point body, turning panics into `AfErrIo` so they never
/// unwind into C.
fn call(body: impl FnOnce() -> FfiResult) -> AfResult {
    match catch_unwind(AssertUnwindSafe(body)) {
        Ok(result) => finish(result),
        Err(_) => {
            tracing::error!("panic inside agentfs entry point");
            AfResult::AfErrIo
        }
    }
}

unsafe fn str_arg<'a>(ptr: *const c_char) -> FfiResult<&'a str> {
    if ptr.is_null() {
        return Err(AfResult::AfErrInval);
    }
    CStr::from_ptr(ptr).to_str().map_err(|_| AfResult::AfErrInval)
}

unsafe fn opt_str_arg<'a>(ptr: *const c_char) -> FfiResult<Option<&'a str>> {
    if ptr.is_null() {
        Ok(None)
    } else {
        str_arg(ptr).map(Some)
    }
}

unsafe fn path_arg<'a>(ptr: *const c_char) -> FfiResult<&'a Path> {
    str_arg(ptr).map(Path::new)
}

unsafe fn id_arg<T: FromStr>(ptr: *const c_char) -> FfiResult<T> {
    str_arg(ptr)?.parse().map_err(|_| AfResult::AfErrInval)
}

unsafe fn out<T>(ptr: *mut T, value: T) -> FfiResult {
    if ptr.is_null() {
        return Err(AfResult::AfErrInval);
    }
    ptr.write(value);
    Ok(())
}

unsafe fn bytes_arg<'a>(ptr: *const u8, len: usize) -> FfiResult<&'a [u8]> {
    if len == 0 {
        return Ok(&[]);
    }
    if ptr.is_null() {
        return Err(AfResult::AfErrInval);
    }
    Ok(std::slice::from_raw_parts(ptr, len))
}

unsafe fn bytes_out<'a>(ptr: *mut u8, len: usize) -> FfiResult<&'a mut [u8]> {
    if len == 0 {
        return Ok(&mut []);
    }
    if ptr.is_null() {
        return Err(AfResult::AfErrInval);
    }
    Ok(std::slice::from_raw_parts_mut(ptr, len))
}

/// Copy `bytes` into a caller buffer, reporting the needed size first.
unsafe fn fill(bytes: &[u8], buf: *mut u8, buf_len: usize, out_len: *mut usize) -> FfiResult {
    if !out_len.is_null() {
        out_len.write(bytes.len());
    }
    if buf_len < bytes.len() {
        return Err(AfResult::AfErrInval);
    }
    bytes_out(buf, buf_len)?[..bytes.len()].copy_from_slice(bytes);
    Ok(())
}

unsafe fn fill_str(text: &str, buf: *mut c_char, buf_len: usize, out_len: *mut usize) -> FfiResult {
    let mut bytes = Vec::with_capacity(text.len() + 1);
    bytes.extend_from_slice(text.as_bytes());
    bytes.push(0);
    fill(&bytes, buf.cast(), buf_len, out_len)
}

/// Names joined with a NUL after each one.
fn nul_separated<'a>(names: impl IntoIterator<Item = &'a str>) -> Vec<u8> {
    let mut bytes = Vec::new();
    for name in names {
        bytes.extend_from_slice(name.as_bytes());
        bytes.push(0);
    }
    bytes
}

unsafe fn write_id(id: impl ToString, out_id: *mut c_char) -> FfiResult {
    if out_id.is_null() {
        return Err(AfResult::AfErrInval);
    }
    let text = id.to_string();
    let dst = std::slice::from_raw_parts_mut(out_id.cast::<u8>(), AF_ID_LEN);
    dst[..text.len()].copy_from_slice(text.as_bytes());
    dst[text.len()] = 0;
    Ok(())
}

fn json<T: serde::Serialize>(value: &T) -> FfiResult<String> {
    serde_json::to_string(value).map_err(|_| AfResult::AfErrInval)
}

/// `0` means the calling process.
fn pid(pid: u32) -> PID {
    if pid == 0 {
        PID::current()
    } else {
        PID::new(pid)
    }
}

fn with_fs(fs: u64, body: impl FnOnce(&FsCore) -> FfiResult) -> AfResult {
    call(|| body(instance(fs)?.as_ref()))
}

// Lifecycle

#[no_mangle]
pub extern "C" fn af_abi_version() -> u32 {
    AF_ABI_VERSION
}

/// Create an instance from a flat JSON configuration. `config_json` may be
/// null or empty for defaults.
#[no_mangle]
pub unsafe extern "C" fn af_fs_create(config_json: *const c_char, out_fs: *mut u64) -> AfResult {
    call(|| {
        if out_fs.is_null() {
            return Err(AfResult::AfErrInval);
        }
        let config = FfiConfig::from_json(opt_str_arg(config_json)?.unwrap_or(""))?;
        config.init_logging()?;
        let core = FsCore::new(config.into_fs_config())?;
        let id = register_instance(core);
        tracing::debug!(instance = id, "instance created");
        out(out_fs, id)
    })
}

/// Drop an instance. Handles still open on it become invalid.
#[no_mangle]
pub extern "C" fn af_fs_destroy(fs: u64) -> AfResult {
    call(|| {
        remove_instance(fs).ok_or(AfResult::AfErrInval)?;
        tracing::debug!(instance = fs, "instance destroyed");
        Ok(())
    })
}

// Snapshots and branches

#[no_mangle]
pub unsafe extern "C" fn af_snapshot_create(
    fs: u64,
    pid_raw: u32,
    name: *const c_char,
    out_id: *mut c_char,
) -> AfResult {
    with_fs(fs, |core| {
        let id = core.snapshot_create_for_pid(&pid(pid_raw), opt_str_arg(name)?)?;
        write_id(id, out_id)
    })
}

#[no_mangle]
pub unsafe extern "C" fn af_snapshot_delete(fs: u64, snapshot: *const c_char) -> AfResult {
    with_fs(fs, |core| Ok(core.snapshot_delete(id_arg::<SnapshotId>(snapshot)?)?))
}

#[no_mangle]
pub unsafe extern "C" fn af_snapshot_list(
    fs: u64,
    buf: *mut c_char,
    buf_len: usize,
    out_len: *mut usize,
) -> AfResult {
    with_fs(fs, |core| fill_str(&json(&core.snapshot_list())?, buf, buf_len, out_len))
}

#[no_mangle]
pub unsafe extern "C" fn af_branch_create_from_snapshot(
    fs: u64,
    snapshot: *const c_char,
    name: *const c_char,
    out_id: *mut c_char,
) -> AfResult {
    with_fs(fs, |core| {
        let id = core.branch_create_from_snapshot(id_arg(snapshot)?, opt_str_arg(name)?)?;
        write_id(id, out_id)
    })
}

#[no_mangle]
pub unsafe extern "C" fn af_branch_create_from_current(
    fs: u64,
    pid_raw: u32,
    name: *const c_char,
    out_id: *mut c_char,
) -> AfResult {
    with_fs(fs, |core| {
        let id = core.branch_create_from_current_for_pid(&pid(pid_raw), opt_str_arg(name)?)?;
        write_id(id, out_id)
    })
}

#[no_mangle]
pub unsafe extern "C" fn af_branch_delete(fs: u64, branch: *const c_char) -> AfResult {
    with_fs(fs, |core| Ok(core.delete_branch(id_arg::<BranchId>(branch)?)?))
}

#[no_mangle]
pub unsafe extern "C" fn af_branch_list(
    fs: u64,
    buf: *mut c_char,
    buf_len: usize,
    out_len: *mut usize,
) -> AfResult {
    with_fs(fs, |core| fill_str(&json(&core.branch_list())?, buf, buf_len, out_len))
}

// Process binding

#[no_mangle]
pub extern "C" fn af_register_process(fs: u64, pid_raw: u32, parent_pid: u32, uid: u32, gid: u32) -> AfResult {
    with_fs(fs, |core| {
        core.register_process(pid(pid_raw).as_u32(), parent_pid, uid, gid);
        Ok(())
    })
}

#[no_mangle]
pub unsafe extern "C" fn af_bind_process_to_branch(fs: u64, branch: *const c_char) -> AfResult {
    with_fs(fs, |core| Ok(core.bind_process_to_branch(id_arg(branch)?)?))
}

#[no_mangle]
pub unsafe extern "C" fn af_bind_process_to_branch_with_pid(
    fs: u64,
    branch: *const c_char,
    pid_raw: u32,
) -> AfResult {
    with_fs(fs, |core| {
        Ok(core.bind_process_to_branch_with_pid(id_arg(branch)?, pid(pid_raw).as_u32())?)
    })
}

#[no_mangle]
pub extern "C" fn af_unbind_process(fs: u64) -> AfResult {
    with_fs(fs, |core| Ok(core.unbind_process()?))
}

#[no_mangle]
pub extern "C" fn af_unbind_process_with_pid(fs: u64, pid_raw: u32) -> AfResult {
    with_fs(fs, |core| Ok(core.unbind_process_with_pid(pid(pid_raw).as_u32())?))
}

#[no_mangle]
pub extern "C" fn af_process_exited(fs: u64, pid_raw: u32) -> AfResult {
    with_fs(fs, |core| {
        core.process_exited(pid(pid_raw).as_u32());
        Ok(())
    })
}

// Namespace

#[no_mangle]
pub unsafe extern "C" fn af_mkdir(fs: u64, pid_raw: u32, path: *const c_char, mode: u32) -> AfResult {
    with_fs(fs, |core| Ok(core.mkdir(&pid(pid_raw), path_arg(path)?, mode)?))
}

#[no_mangle]
pub unsafe extern "C" fn af_rmdir(fs: u64, pid_raw: u32, path: *const c_char) -> AfResult {
    with_fs(fs, |core| Ok(core.rmdir(&pid(pid_raw), path_arg(path)?)?))
}

#[no_mangle]
pub unsafe extern "C" fn af_unlink(fs: u64, pid_raw: u32, path: *const c_char) -> AfResult {
    with_fs(fs, |core| Ok(core.unlink(&pid(pid_raw), path_arg(path)?)?))
}

#[no_mangle]
pub unsafe extern "C" fn af_rename(
    fs: u64,
    pid_raw: u32,
    old_path: *const c_char,
    new_path: *const c_char,
) -> AfResult {
    with_fs(fs, |core| {
        Ok(core.rename(&pid(pid_raw), path_arg(old_path)?, path_arg(new_path)?)?)
    })
}

#[no_mangle]
pub unsafe extern "C" fn af_link(
    fs: u64,
    pid_raw: u32,
    old_path: *const c_char,
    new_path: *const c_char,
) -> AfResult {
    with_fs(fs, |core| {
        Ok(core.link(&pid(pid_raw), path_arg(old_path)?, path_arg(new_path)?)?)
    })
}

#[no_mangle]
pub unsafe extern "C" fn af_symlink(
    fs: u64,
    pid_raw: u32,
    target: *const c_char,
    link_path: *const c_char,
) -> AfResult {
    with_fs(fs, |core| {
        Ok(core.symlink(&pid(pid_raw), str_arg(target)?, path_arg(link_path)?)?)
    })
}

#[no_mangle]
pub unsafe extern "C" fn af_readlink(
    fs: u64,
    pid_raw: u32,
    path: *const c_char,
    buf: *mut c_char,
    buf_len: usize,
    out_len: *mut usize,
) -> AfResult {
    with_fs(fs, |core| {
        let target = core.readlink(&pid(pid_raw), path_arg(path)?)?;
        fill_str(&target, buf, buf_len, out_len)
    })
}

#[no_mangle]
pub unsafe extern "C" fn af_readdir(
    fs: u64,
    pid_raw: u32,
    path: *const c_char,
    buf: *mut c_char,
    buf_len: usize,
    out_len: *mut usize,
) -> AfResult {
    with_fs(fs, |core| {
        let entries = core.readdir(&pid(pid_raw), path_arg(path)?)?;
        let bytes = nul_separated(entries.iter().map(|e| e.name.as_str()));
        fill(&bytes, buf.cast(), buf_len, out_len)
    })
}

// Files

/// Open (or create, per the options) a file. `options_json` may be null
/// for a read-only open of an existing file.
#[no_mangle]
pub unsafe extern "C" fn af_open(
    fs: u64,
    pid_raw: u32,
    path: *const c_char,
    options_json: *const c_char,
    out_handle: *mut u64,
) -> AfResult {
    with_fs(fs, |core| {
        let options = parse_open_options(opt_str_arg(options_json)?.unwrap_or(""))?;
        let handle = core.open(&pid(pid_raw), path_arg(path)?, &options)?;
        out(out_handle, handle.0)
    })
}

#[no_mangle]
pub unsafe extern "C" fn af_read(
    fs: u64,
    pid_raw: u32,
    handle: u64,
    offset: u64,
    buf: *mut u8,
    len: usize,
    out_read: *mut usize,
) -> AfResult {
    with_fs(fs, |core| {
        let n = core.read(&pid(pid_raw), HandleId(handle), offset, bytes_out(buf, len)?)?;
        out(out_read, n)
    })
}

#[no_mangle]
pub unsafe extern "C" fn af_write(
    fs: u64,
    pid_raw: u32,
    handle: u64,
    offset: u64,
    data: *const u8,
    len: usize,
    out_written: *mut usize,
) -> AfResult {
    with_fs(fs, |core| {
        let n = core.write(&pid(pid_raw), HandleId(handle), offset, bytes_arg(data, len)?)?;
        out(out_written, n)
    })
}

#[no_mangle]
pub extern "C" fn af_close(fs: u64, pid_raw: u32, handle: u64) -> AfResult {
    with_fs(fs, |core| Ok(core.close(&pid(pid_raw), HandleId(handle))?))
}

#[no_mangle]
pub unsafe extern "C" fn af_truncate(fs: u64, pid_raw: u32, path: *const c_char, len: u64) -> AfResult {
    with_fs(fs, |core| Ok(core.truncate(&pid(pid_raw), path_arg(path)?, len)?))
}

/// Fill an [`AF_ATTR_LEN`]-byte little-endian record: `len` u64 @0, type
/// u8 @8, mode u32 @9, atime/mtime/ctime/birthtime i64 @13/21/29/37.
#[no_mangle]
pub unsafe extern "C" fn af_getattr(
    fs: u64,
    pid_raw: u32,
    path: *const c_char,
    out_attr: *mut u8,
    out_attr_len: usize,
) -> AfResult {
    with_fs(fs, |core| {
        if out_attr_len < AF_ATTR_LEN {
            return Err(AfResult::AfErrInval);
        }
        let attrs = core.getattr(&pid(pid_raw), path_arg(path)?)?;
        let record = bytes_out(out_attr, AF_ATTR_LEN)?;
        record.fill(0);
        record[0..8].copy_from_slice(&attrs.len.to_le_bytes());
        record[8] = if attrs.is_dir {
            ATTR_TYPE_DIR
        } else if attrs.is_symlink {
            ATTR_TYPE_SYMLINK
        } else {
            ATTR_TYPE_FILE
        };
        record[9..13].copy_from_slice(&attrs.permissions().to_le_bytes());
        let times = attrs.times;
        for (slot, value) in [times.atime, times.mtime, times.ctime, times.birthtime]
            .into_iter()
            .enumerate()
        {
            let at = 13 + slot * 8;
            record[at..at + 8].copy_from_slice(&value.to_le_bytes());
        }
        Ok(())
    })
}

#[no_mangle]
pub unsafe extern "C" fn af_set_times(
    fs: u64,
    pid_raw: u32,
    path: *const c_char,
    atime: i64,
    mtime: i64,
    ctime: i64,
    birthtime: i64,
) -> AfResult {
    with_fs(fs, |core| {
        let times = FileTimes {
            atime,
            mtime,
            ctime,
            birthtime,
        };
        Ok(core.set_times(&pid(pid_raw), path_arg(path)?, times)?)
    })
}

#[no_mangle]
pub unsafe extern "C" fn af_set_mode(fs: u64, pid_raw: u32, path: *const c_char, mode: u32) -> AfResult {
    with_fs(fs, |core| Ok(core.set_mode(&pid(pid_raw), path_arg(path)?, mode)?))
}

// Extended attributes

#[no_mangle]
pub unsafe extern "C" fn af_xattr_get(
    fs: u64,
    pid_raw: u32,
    path: *const c_char,
    name: *const c_char,
    buf: *mut u8,
    buf_len: usize,
    out_len: *mut usize,
) -> AfResult {
    with_fs(fs, |core| {
        let value = core.xattr_get(&pid(pid_raw), path_arg(path)?, str_arg(name)?)?;
        fill(&value, buf, buf_len, out_len)
    })
}

#[no_mangle]
pub unsafe extern "C" fn af_xattr_set(
    fs: u64,
    pid_raw: u32,
    path: *const c_char,
    name: *const c_char,
    value: *const u8,
    value_len: usize,
) -> AfResult {
    with_fs(fs, |core| {
        Ok(core.xattr_set(
            &pid(pid_raw),
            path_arg(path)?,
            str_arg(name)?,
            bytes_arg(value, value_len)?,
        )?)
    })
}

#[no_mangle]
pub unsafe extern "C" fn af_xattr_list(
    fs: u64,
    pid_raw: u32,
    path: *const c_char,
    buf: *mut c_char,
    buf_len: usize,
    out_len: *mut usize,
) -> AfResult {
    with_fs(fs, |core| {
        let names = core.xattr_list(&pid(pid_raw), path_arg(path)?)?;
        let bytes = nul_separated(names.iter().map(String::as_str));
        fill(&bytes, buf.cast(), buf_len, out_len)
    })
}

#[no_mangle]
pub unsafe extern "C" fn af_xattr_remove(
    fs: u64,
    pid_raw: u32,
    path: *const c_char,
    name: *const c_char,
) -> AfResult {
    with_fs(fs, |core| {
        Ok(core.xattr_remove(&pid(pid_raw), path_arg(path)?, str_arg(name)?)?)
    })
}

// Byte-range locks

fn lock_range(offset: u64, len: u64, exclusive: bool) -> LockRange {
    if exclusive {
        LockRange::exclusive(offset, len)
    } else {
        LockRange::shared(offset, len)
    }
}

#[no_mangle]
pub extern "C" fn af_lock(fs: u64, handle: u64, offset: u64, len: u64, exclusive: bool) -> AfResult {
    with_fs(fs, |core| {
        Ok(core.lock(HandleId(handle), lock_range(offset, len, exclusive))?)
    })
}

#[no_mangle]
pub extern "C" fn af_unlock(fs: u64, handle: u64, offset: u64, len: u64, exclusive: bool) -> AfResult {
    with_fs(fs, |core| {
        Ok(core.unlock(HandleId(handle), lock_range(offset, len, exclusive))?)
    })
}

// Statistics

/// Fill an [`AF_STATS_LEN`]-byte little-endian record: branches u32 @0,
/// snapshots u32 @4, open_handles u32 @8, bytes_in_memory u64 @12,
/// bytes_spilled u64 @20.
#[no_mangle]
pub unsafe extern "C" fn af_stats(fs: u64, out_stats: *mut u8, out_stats_len: usize) -> AfResult {
    with_fs(fs, |core| {
        if out_stats_len < AF_STATS_LEN {
            return Err(AfResult::AfErrInval);
        }
        let stats = core.stats();
        let record = bytes_out(out_stats, AF_STATS_LEN)?;
        record[0..4].copy_from_slice(&stats.branches.to_le_bytes());
        record[4..8].copy_from_slice(&stats.snapshots.to_le_bytes());
        record[8..12].copy_from_slice(&stats.open_handles.to_le_bytes());
        record[12..20].copy_from_slice(&stats.bytes_in_memory.to_le_bytes());
        record[20..28].copy_from_slice(&stats.bytes_spilled.to_le_bytes());
        Ok(())
    })
}

// Fault injection

/// Replace the storage fault policy with the given JSON document.
#[no_mangle]
pub unsafe extern "C" fn af_fault_policy_set(fs: u64, policy_json: *const c_char) -> AfResult {
    with_fs(fs, |core| {
        let policy = FaultPolicy::from_json_bytes(str_arg(policy_json)?.as_bytes()).map_err(|err| {
            tracing::debug!(%err, "rejecting malformed fault policy");
            AfResult::AfErrInval
        })?;
        core.set_fault_policy(policy);
        Ok(())
    })
}

#[no_mangle]
pub extern "C" fn af_fault_policy_clear(fs: u64) -> AfResult {
    with_fs(fs, |core| {
        core.clear_fault_policy();
        Ok(())
    })
}

// Events

struct CallbackSink {
    callback: AfEventCallback,
    user_data: usize,
}

impl EventSink for CallbackSink {
    fn on_event(&self, evt: &EventKind) {
        let payload = match serde_json::to_string(evt).map(CString::new) {
            Ok(Ok(payload)) => payload,
            _ => {
                tracing::warn!(?evt, "event could not be encoded for C");
                return;
            }
        };
        (self.callback)(payload.as_ptr(), self.user_data as *mut c_void);
    }
}

/// Deliver events to `callback` on the thread performing each mutation.
/// The callback must not call back into the same instance.
#[no_mangle]
pub unsafe extern "C" fn af_subscribe_events(
    fs: u64,
    callback: Option<AfEventCallback>,
    user_data: *mut c_void,
    out_sub: *mut u64,
) -> AfResult {
    with_fs(fs, |core| {
        let callback = callback.ok_or(AfResult::AfErrInval)?;
        if out_sub.is_null() {
            return Err(AfResult::AfErrInval);
        }
        let sink = Arc::new(CallbackSink {
            callback,
            user_data: user_data as usize,
        });
        let sub = core.subscribe_events(sink)?;
        out(out_sub, sub.0)
    })
}

#[no_mangle]
pub extern "C" fn af_unsubscribe_events(fs: u64, sub: u64) -> AfResult {
    with_fs(fs, |core| Ok(core.unsubscribe_events(SubscriptionId::new(sub))?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;
    use std::sync::Mutex;

    fn c(s: &str) -> CString {
        CString::new(s).unwrap()
    }

    fn create(config: &str) -> u64 {
        let config = c(config);
        let mut fs = 0u64;
        assert_eq!(unsafe { af_fs_create(config.as_ptr(), &mut fs) }, AfResult::AfOk);
        fs
    }

    fn id_string(buf: &[c_char; AF_ID_LEN]) -> CString {
        unsafe { CStr::from_ptr(buf.as_ptr()) }.to_owned()
    }

    fn write_file(fs: u64, pid: u32, path: &str, data: &[u8]) {
        let path = c(path);
        let opts = c(r#"{"read": true, "write": true, "create": true, "truncate": true}"#);
        let mut h = 0u64;
        let mut written = 0usize;
        unsafe {
            assert_eq!(af_open(fs, pid, path.as_ptr(), opts.as_ptr(), &mut h), AfResult::AfOk);
            assert_eq!(
                af_write(fs, pid, h, 0, data.as_ptr(), data.len(), &mut written),
                AfResult::AfOk
            );
        }
        assert_eq!(written, data.len());
        assert_eq!(af_close(fs, pid, h), AfResult::AfOk);
    }

    fn read_file(fs: u64, pid: u32, path: &str) -> Result<Vec<u8>, AfResult> {
        let path = c(path);
        let mut h = 0u64;
        let rc = unsafe { af_open(fs, pid, path.as_ptr(), ptr::null(), &mut h) };
        if rc != AfResult::AfOk {
            return Err(rc);
        }
        let mut buf = vec![0u8; 256];
        let mut n = 0usize;
        let rc = unsafe { af_read(fs, pid, h, 0, buf.as_mut_ptr(), buf.len(), &mut n) };
        assert_eq!(rc, AfResult::AfOk);
        assert_eq!(af_close(fs, pid, h), AfResult::AfOk);
        buf.truncate(n);
        Ok(buf)
    }

    #[test]
    fn abi_version_is_stable() {
        assert_eq!(af_abi_version(), AF_ABI_VERSION);
    }

    #[test]
    fn panics_stop_at_the_boundary() {
        assert_eq!(call(|| panic!("engine bug")), AfResult::AfErrIo);
        assert_eq!(call(|| Ok(())), AfResult::AfOk);
    }

    #[test]
    fn create_rejects_bad_input() {
        let mut fs = 0u64;
        let bad = c("{not json");
        assert_eq!(unsafe { af_fs_create(bad.as_ptr(), &mut fs) }, AfResult::AfErrInval);
        let zero = c(r#"{"max_open_handles": 0}"#);
        assert_eq!(unsafe { af_fs_create(zero.as_ptr(), &mut fs) }, AfResult::AfErrInval);
        assert_eq!(unsafe { af_fs_create(ptr::null(), ptr::null_mut()) }, AfResult::AfErrInval);
        assert_eq!(af_fs_destroy(u64::MAX), AfResult::AfErrInval);
        assert_eq!(af_close(u64::MAX, 0, 1), AfResult::AfErrInval);
    }

    #[test]
    fn snapshot_branch_scenario_through_the_abi() {
        let fs = create("");
        let pid = 7001;
        let clean_name = c("clean");
        let task_name = c("task-1");
        let mut snap = [0 as c_char; AF_ID_LEN];
        let mut branch = [0 as c_char; AF_ID_LEN];
        unsafe {
            assert_eq!(
                af_snapshot_create(fs, pid, clean_name.as_ptr(), snap.as_mut_ptr()),
                AfResult::AfOk
            );
            assert_eq!(
                af_branch_create_from_snapshot(fs, snap.as_ptr(), task_name.as_ptr(), branch.as_mut_ptr()),
                AfResult::AfOk
            );
            assert_eq!(
                af_bind_process_to_branch_with_pid(fs, branch.as_ptr(), pid),
                AfResult::AfOk
            );
            let project = c("/project");
            assert_eq!(af_mkdir(fs, pid, project.as_ptr(), 0o755), AfResult::AfOk);
            assert_eq!(af_mkdir(fs, pid, project.as_ptr(), 0o755), AfResult::AfErrExist);
        }
        write_file(fs, pid, "/project/README.md", b"Hello AgentFS");
        assert_eq!(read_file(fs, pid, "/project/README.md").unwrap(), b"Hello AgentFS");

        // Another process on the default branch does not see it.
        assert_eq!(read_file(fs, pid + 1, "/project/README.md"), Err(AfResult::AfErrNotFound));

        let mut attr = [0u8; AF_ATTR_LEN];
        let path = c("/project/README.md");
        unsafe {
            assert_eq!(
                af_getattr(fs, pid, path.as_ptr(), attr.as_mut_ptr(), attr.len()),
                AfResult::AfOk
            );
            assert_eq!(
                af_getattr(fs, pid, path.as_ptr(), attr.as_mut_ptr(), 10),
                AfResult::AfErrInval
            );
        }
        assert_eq!(u64::from_le_bytes(attr[0..8].try_into().unwrap()), 13);
        assert_eq!(attr[8], ATTR_TYPE_FILE);
        assert_eq!(u32::from_le_bytes(attr[9..13].try_into().unwrap()), 0o644);

        let mut listing = vec![0u8; 512];
        let mut len = 0usize;
        unsafe {
            assert_eq!(
                af_branch_list(fs, listing.as_mut_ptr().cast(), listing.len(), &mut len),
                AfResult::AfOk
            );
        }
        let text = CStr::from_bytes_with_nul(&listing[..len]).unwrap().to_str().unwrap();
        let branches: serde_json::Value = serde_json::from_str(text).unwrap();
        let branch_id = id_string(&branch);
        assert!(branches
            .as_array()
            .unwrap()
            .iter()
            .any(|b| b["id"] == branch_id.to_str().unwrap() && b["name"] == "task-1"));

        assert_eq!(delete_branch(fs, &branch), AfResult::AfErrBusy);
        assert_eq!(af_unbind_process_with_pid(fs, pid), AfResult::AfOk);
        assert_eq!(delete_branch(fs, &branch), AfResult::AfOk);
        assert_eq!(af_fs_destroy(fs), AfResult::AfOk);
    }

    fn delete_branch(fs: u64, branch: &[c_char; AF_ID_LEN]) -> AfResult {
        unsafe { af_branch_delete(fs, branch.as_ptr()) }
    }

    #[test]
    fn readdir_and_xattrs_use_nul_separated_buffers() {
        let fs = create(r#"{"max_memory_bytes": 65536}"#);
        let pid = 7100;
        write_file(fs, pid, "/b", b"");
        write_file(fs, pid, "/a", b"");

        let root = c("/");
        let mut needed = 0usize;
        let mut small = [0 as c_char; 2];
        let mut buf = [0 as c_char; 16];
        unsafe {
            assert_eq!(
                af_readdir(fs, pid, root.as_ptr(), small.as_mut_ptr(), small.len(), &mut needed),
                AfResult::AfErrInval
            );
            assert_eq!(needed, 4);
            assert_eq!(
                af_readdir(fs, pid, root.as_ptr(), buf.as_mut_ptr(), buf.len(), &mut needed),
                AfResult::AfOk
            );
        }
        let bytes: Vec<u8> = buf[..needed].iter().map(|b| *b as u8).collect();
        assert_eq!(bytes, b"a\0b\0");

        let path = c("/a");
        let name = c("user.test");
        let mut value = [0u8; 8];
        let mut value_len = 0usize;
        unsafe {
            assert_eq!(
                af_xattr_set(fs, pid, path.as_ptr(), name.as_ptr(), b"value".as_ptr(), 5),
                AfResult::AfOk
            );
            assert_eq!(
                af_xattr_get(fs, pid, path.as_ptr(), name.as_ptr(), value.as_mut_ptr(), value.len(), &mut value_len),
                AfResult::AfOk
            );
            assert_eq!(&value[..value_len], b"value");
            assert_eq!(
                af_xattr_list(fs, pid, path.as_ptr(), buf.as_mut_ptr(), buf.len(), &mut needed),
                AfResult::AfOk
            );
            let names: Vec<u8> = buf[..needed].iter().map(|b| *b as u8).collect();
            assert_eq!(names, b"user.test\0");
            assert_eq!(af_xattr_remove(fs, pid, path.as_ptr(), name.as_ptr()), AfResult::AfOk);
            assert_eq!(
                af_xattr_get(fs, pid, path.as_ptr(), name.as_ptr(), value.as_mut_ptr(), value.len(), &mut value_len),
                AfResult::AfErrNotFound
            );
        }
        assert_eq!(af_fs_destroy(fs), AfResult::AfOk);
    }

    #[test]
    fn locks_and_stats() {
        let fs = create("{}");
        let pid = 7200;
        write_file(fs, pid, "/db", b"0123456789");
        let path = c("/db");
        let mut h = 0u64;
        unsafe {
            assert_eq!(af_open(fs, pid, path.as_ptr(), ptr::null(), &mut h), AfResult::AfOk);
        }
        assert_eq!(af_lock(fs, h, 0, 10, true), AfResult::AfOk);
        assert_eq!(af_lock(fs, h, 5, 10, true), AfResult::AfErrBusy);
        assert_eq!(af_unlock(fs, h, 0, 10, true), AfResult::AfOk);
        assert_eq!(af_lock(fs, h, 5, 10, false), AfResult::AfOk);

        let mut stats = [0u8; AF_STATS_LEN];
        assert_eq!(unsafe { af_stats(fs, stats.as_mut_ptr(), stats.len()) }, AfResult::AfOk);
        assert_eq!(u32::from_le_bytes(stats[0..4].try_into().unwrap()), 1);
        assert_eq!(u32::from_le_bytes(stats[8..12].try_into().unwrap()), 1);
        assert!(u64::from_le_bytes(stats[12..20].try_into().unwrap()) >= 10);

        assert_eq!(af_close(fs, pid, h), AfResult::AfOk);
        assert_eq!(af_close(fs, pid, h), AfResult::AfErrBadf);
        assert_eq!(af_fs_destroy(fs), AfResult::AfOk);
    }

    #[test]
    fn spill_directory_from_config_json() {
        let dir = tempfile::tempdir().unwrap();
        let config = serde_json::json!({
            "max_memory_bytes": 1024,
            "spill_directory": dir.path(),
        });
        let fs = create(&config.to_string());
        let pid = 7500;
        let payload = vec![0x5a; 16 * 1024];
        write_file(fs, pid, "/large.bin", &payload);

        let mut stats = [0u8; AF_STATS_LEN];
        assert_eq!(unsafe { af_stats(fs, stats.as_mut_ptr(), stats.len()) }, AfResult::AfOk);
        assert!(u64::from_le_bytes(stats[12..20].try_into().unwrap()) <= 1024);
        assert!(u64::from_le_bytes(stats[20..28].try_into().unwrap()) >= payload.len() as u64);
        assert_eq!(af_fs_destroy(fs), AfResult::AfOk);
    }

    #[test]
    fn fault_policy_makes_writes_fail() {
        let fs = create("");
        let pid = 7400;
        let path = c("/victim");
        let opts = c(r#"{"write": true, "create": true}"#);
        let policy = c(r#"{"enabled": true, "rules": [{"op": "write", "errno": "enospc"}]}"#);
        let garbage = c("[1, 2");
        let mut h = 0u64;
        let mut written = 0usize;
        unsafe {
            assert_eq!(af_fault_policy_set(fs, garbage.as_ptr()), AfResult::AfErrInval);
            assert_eq!(af_fault_policy_set(fs, policy.as_ptr()), AfResult::AfOk);
            assert_eq!(af_open(fs, pid, path.as_ptr(), opts.as_ptr(), &mut h), AfResult::AfOk);
            assert_eq!(
                af_write(fs, pid, h, 0, b"data".as_ptr(), 4, &mut written),
                AfResult::AfErrNoSpc
            );
            assert_eq!(af_fault_policy_clear(fs), AfResult::AfOk);
            assert_eq!(af_write(fs, pid, h, 0, b"data".as_ptr(), 4, &mut written), AfResult::AfOk);
        }
        assert_eq!(written, 4);
        assert_eq!(af_close(fs, pid, h), AfResult::AfOk);
        assert_eq!(af_fs_destroy(fs), AfResult::AfOk);
    }

    lazy_static::lazy_static! {
        static ref RECEIVED: Mutex<Vec<String>> = Mutex::new(Vec::new());
    }

    extern "C" fn record_event(event_json: *const c_char, user_data: *mut c_void) {
        assert_eq!(user_data as usize, 0xfeed);
        let text = unsafe { CStr::from_ptr(event_json) }.to_str().unwrap().to_owned();
        RECEIVED.lock().unwrap().push(text);
    }

    #[test]
    fn events_reach_c_callbacks_as_json() {
        let fs = create("");
        let pid = 7300;
        let mut sub = 0u64;
        unsafe {
            assert_eq!(
                af_subscribe_events(fs, Some(record_event), 0xfeed as *mut c_void, &mut sub),
                AfResult::AfOk
            );
            assert_eq!(
                af_subscribe_events(fs, None, ptr::null_mut(), &mut sub),
                AfResult::AfErrInval
            );
        }
        let dir = c("/watched");
        unsafe {
            assert_eq!(af_mkdir(fs, pid, dir.as_ptr(), 0o755), AfResult::AfOk);
        }
        assert_eq!(af_unsubscribe_events(fs, sub), AfResult::AfOk);
        assert_eq!(af_unsubscribe_events(fs, sub), AfResult::AfErrNotFound);

        let received = RECEIVED.lock().unwrap().clone();
        assert_eq!(received.len(), 1);
        let event: serde_json::Value = serde_json::from_str(&received[0]).unwrap();
        assert_eq!(event["kind"], "created");
        assert_eq!(event["path"], "/watched");
        assert_eq!(af_fs_destroy(fs), AfResult::AfOk);
    }
}
