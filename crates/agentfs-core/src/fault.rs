// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Fault injection for storage operations
//!
//! A [`FaultPolicy`] arrives as JSON from a test harness or supervisor and
//! makes selected storage operations fail with synthetic `Io` or `NoSpace`
//! errors. [`FaultInjectingBackend`] wraps the real backend and consults the
//! active policy before each data operation.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io;
use std::sync::Arc;

use crate::error::{FsError, FsResult};
use crate::storage::{StorageBackend, StorageUsage};
use crate::ContentId;

/// Storage operations that can be made to fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultOp {
    Read,
    Write,
    Truncate,
    Allocate,
    CloneCow,
}

/// Error produced by a matching rule.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultErrno {
    Eio,
    Enospc,
}

impl FaultErrno {
    fn to_error(self) -> FsError {
        match self {
            FaultErrno::Eio => FsError::Io(io::Error::from_raw_os_error(libc::EIO)),
            FaultErrno::Enospc => FsError::NoSpace,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultRule {
    pub op: FaultOp,
    pub errno: FaultErrno,
    /// Matching invocations to let through before the first failure.
    #[serde(default)]
    pub start_after: u64,
    /// Stop failing after this many injected errors.
    #[serde(default)]
    pub max_faults: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultPolicy {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub rules: Vec<FaultRule>,
}

impl FaultPolicy {
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn summary(&self) -> FaultPolicySummary {
        FaultPolicySummary {
            enabled: self.enabled,
            active: self.enabled && !self.rules.is_empty(),
            rule_count: self.rules.len(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FaultPolicySummary {
    pub enabled: bool,
    pub active: bool,
    pub rule_count: usize,
}

#[derive(Clone, Copy, Debug, Default)]
struct RuleCounters {
    hits: u64,
    invocations: u64,
}

#[derive(Default)]
struct FaultState {
    policy: FaultPolicy,
    counters: Vec<RuleCounters>,
}

/// Active policy plus per-rule hit counters.
#[derive(Default)]
pub struct FaultInjector {
    state: Mutex<FaultState>,
}

impl FaultInjector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn policy(&self) -> FaultPolicy {
        self.state.lock().policy.clone()
    }

    pub fn summary(&self) -> FaultPolicySummary {
        self.state.lock().policy.summary()
    }

    /// Replace the policy and reset all counters.
    pub fn set_policy(&self, policy: FaultPolicy) {
        let mut state = self.state.lock();
        state.counters = vec![RuleCounters::default(); policy.rules.len()];
        state.policy = policy;
    }

    pub fn clear(&self) {
        self.set_policy(FaultPolicy::default());
    }

    /// First matching rule that is past its warm-up and under its cap wins.
    pub fn should_fault(&self, op: FaultOp) -> Option<FsError> {
        let mut state = self.state.lock();
        if !state.policy.enabled {
            return None;
        }
        let FaultState { policy, counters } = &mut *state;
        for (rule, counter) in policy.rules.iter().zip(counters.iter_mut()) {
            if rule.op != op {
                continue;
            }
            counter.invocations += 1;
            if counter.invocations <= rule.start_after {
                continue;
            }
            if rule.max_faults.is_some_and(|max| counter.hits >= max) {
                continue;
            }
            counter.hits += 1;
            tracing::debug!(?op, errno = ?rule.errno, "injecting storage fault");
            return Some(rule.errno.to_error());
        }
        None
    }

    fn check(&self, op: FaultOp) -> FsResult<()> {
        match self.should_fault(op) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Storage decorator that fails operations according to a [`FaultInjector`].
/// Reference counting and sealing are never faulted.
pub struct FaultInjectingBackend {
    inner: Arc<dyn StorageBackend>,
    injector: Arc<FaultInjector>,
}

impl FaultInjectingBackend {
    pub fn new(inner: Arc<dyn StorageBackend>, injector: Arc<FaultInjector>) -> Self {
        Self { inner, injector }
    }
}

impl StorageBackend for FaultInjectingBackend {
    fn read(&self, id: ContentId, offset: u64, buf: &mut [u8]) -> FsResult<usize> {
        self.injector.check(FaultOp::Read)?;
        self.inner.read(id, offset, buf)
    }

    fn write(&self, id: ContentId, offset: u64, data: &[u8]) -> FsResult<usize> {
        self.injector.check(FaultOp::Write)?;
        self.inner.write(id, offset, data)
    }

    fn truncate(&self, id: ContentId, new_len: u64) -> FsResult<()> {
        self.injector.check(FaultOp::Truncate)?;
        self.inner.truncate(id, new_len)
    }

    fn allocate(&self, initial: &[u8]) -> FsResult<ContentId> {
        self.injector.check(FaultOp::Allocate)?;
        self.inner.allocate(initial)
    }

    fn clone_cow(&self, base: ContentId) -> FsResult<ContentId> {
        self.injector.check(FaultOp::CloneCow)?;
        self.inner.clone_cow(base)
    }

    fn seal(&self, id: ContentId) -> FsResult<()> {
        self.inner.seal(id)
    }

    fn retain(&self, id: ContentId) {
        self.inner.retain(id)
    }

    fn release(&self, id: ContentId) {
        self.inner.release(id)
    }

    fn is_exclusive(&self, id: ContentId) -> bool {
        self.inner.is_exclusive(id)
    }

    fn content_len(&self, id: ContentId) -> FsResult<u64> {
        self.inner.content_len(id)
    }

    fn usage(&self) -> StorageUsage {
        self.inner.usage()
    }
}
