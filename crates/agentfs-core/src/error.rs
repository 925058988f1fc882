// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for AgentFS Core

use std::io;

/// Core filesystem error type
#[derive(thiserror::Error, Debug)]
pub enum FsError {
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("access denied")]
    AccessDenied,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("name not allowed")]
    InvalidName,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("busy")]
    Busy,
    #[error("too many open files")]
    TooManyOpenFiles,
    #[error("bad file descriptor")]
    BadFileDescriptor,
    #[error("no space left")]
    NoSpace,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("unsupported")]
    Unsupported,
}

impl FsError {
    /// POSIX errno for this error. Glue layers that speak errno can use this
    /// instead of keeping their own table.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::AlreadyExists => libc::EEXIST,
            FsError::AccessDenied => libc::EACCES,
            FsError::InvalidArgument => libc::EINVAL,
            FsError::InvalidName => libc::EINVAL,
            FsError::NotADirectory => libc::ENOTDIR,
            FsError::IsADirectory => libc::EISDIR,
            FsError::Busy => libc::EBUSY,
            FsError::TooManyOpenFiles => libc::EMFILE,
            FsError::BadFileDescriptor => libc::EBADF,
            FsError::NoSpace => libc::ENOSPC,
            FsError::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            FsError::Unsupported => libc::ENOTSUP,
        }
    }

    /// Classify an I/O failure coming from the spill directory. A full disk
    /// is storage exhaustion, everything else stays an I/O error.
    pub(crate) fn from_spill_io(err: io::Error) -> Self {
        if err.raw_os_error() == Some(libc::ENOSPC) {
            FsError::NoSpace
        } else {
            FsError::Io(err)
        }
    }
}

pub type FsResult<T> = Result<T, FsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_is_stable() {
        assert_eq!(FsError::NotFound.errno(), libc::ENOENT);
        assert_eq!(FsError::Busy.errno(), libc::EBUSY);
        assert_eq!(FsError::TooManyOpenFiles.errno(), libc::EMFILE);
        assert_eq!(
            FsError::Io(io::Error::from_raw_os_error(libc::EROFS)).errno(),
            libc::EROFS
        );
        assert_eq!(
            FsError::Io(io::Error::new(io::ErrorKind::Other, "boom")).errno(),
            libc::EIO
        );
    }

    #[test]
    fn full_spill_disk_is_no_space() {
        let err = FsError::from_spill_io(io::Error::from_raw_os_error(libc::ENOSPC));
        assert!(matches!(err, FsError::NoSpace));
        let err = FsError::from_spill_io(io::Error::from_raw_os_error(libc::EIO));
        assert!(matches!(err, FsError::Io(_)));
    }
}
