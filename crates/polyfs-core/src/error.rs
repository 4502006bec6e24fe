// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for PolyFS Core

use std::io;

use crate::os::OsType;

/// Closed set of failure kinds produced by every backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NoSuchFileOrDir,
    AlreadyExists,
    NotADirectory,
    IsADirectory,
    DirectoryNotEmpty,
    /// Mode bits deny the requested access.
    PermissionDenied,
    /// The caller lacks the privilege for the operation (not a mode-bit failure).
    OperationNotPermitted,
    InvalidArgument,
    TooManySymlinks,
    UnsupportedFeature,
    BadFileDescriptor,
    NegativeOffset,
    UnknownUser,
    UnknownUserId,
    UnknownGroup,
    UnknownGroupId,
    AlreadyExistsUser,
    AlreadyExistsGroup,
}

impl ErrorKind {
    /// Numeric code of this kind on `os` (errno on Linux, system error code on Windows).
    pub fn code(self, os: OsType) -> i32 {
        match os {
            OsType::Linux => match self {
                ErrorKind::NoSuchFileOrDir => libc::ENOENT,
                ErrorKind::AlreadyExists => libc::EEXIST,
                ErrorKind::NotADirectory => libc::ENOTDIR,
                ErrorKind::IsADirectory => libc::EISDIR,
                ErrorKind::DirectoryNotEmpty => libc::ENOTEMPTY,
                ErrorKind::PermissionDenied => libc::EACCES,
                ErrorKind::OperationNotPermitted => libc::EPERM,
                ErrorKind::InvalidArgument => libc::EINVAL,
                ErrorKind::TooManySymlinks => libc::ELOOP,
                ErrorKind::UnsupportedFeature => libc::EOPNOTSUPP,
                ErrorKind::BadFileDescriptor => libc::EBADF,
                ErrorKind::NegativeOffset => libc::EINVAL,
                ErrorKind::UnknownUser
                | ErrorKind::UnknownUserId
                | ErrorKind::UnknownGroup
                | ErrorKind::UnknownGroupId => libc::ENOENT,
                ErrorKind::AlreadyExistsUser | ErrorKind::AlreadyExistsGroup => libc::EEXIST,
            },
            OsType::Windows => match self {
                ErrorKind::NoSuchFileOrDir => 2,
                ErrorKind::AlreadyExists => 80,
                ErrorKind::NotADirectory => 267,
                ErrorKind::IsADirectory => 336,
                ErrorKind::DirectoryNotEmpty => 145,
                ErrorKind::PermissionDenied => 5,
                ErrorKind::OperationNotPermitted => 1314,
                ErrorKind::InvalidArgument => 87,
                ErrorKind::TooManySymlinks => 1921,
                ErrorKind::UnsupportedFeature => 50,
                ErrorKind::BadFileDescriptor => 6,
                ErrorKind::NegativeOffset => 131,
                ErrorKind::UnknownUser | ErrorKind::UnknownUserId => 1317,
                ErrorKind::UnknownGroup | ErrorKind::UnknownGroupId => 1319,
                ErrorKind::AlreadyExistsUser => 1316,
                ErrorKind::AlreadyExistsGroup => 1318,
            },
        }
    }

    /// Locale-independent text of this kind on `os`.
    pub fn message(self, os: OsType) -> &'static str {
        match os {
            OsType::Linux => match self {
                ErrorKind::NoSuchFileOrDir => "no such file or directory",
                ErrorKind::AlreadyExists => "file exists",
                ErrorKind::NotADirectory => "not a directory",
                ErrorKind::IsADirectory => "is a directory",
                ErrorKind::DirectoryNotEmpty => "directory not empty",
                ErrorKind::PermissionDenied => "permission denied",
                ErrorKind::OperationNotPermitted => "operation not permitted",
                ErrorKind::InvalidArgument | ErrorKind::NegativeOffset => "invalid argument",
                ErrorKind::TooManySymlinks => "too many levels of symbolic links",
                ErrorKind::UnsupportedFeature => "operation not supported",
                ErrorKind::BadFileDescriptor => "bad file descriptor",
                ErrorKind::UnknownUser | ErrorKind::UnknownUserId => "unknown user",
                ErrorKind::UnknownGroup | ErrorKind::UnknownGroupId => "unknown group",
                ErrorKind::AlreadyExistsUser => "user already exists",
                ErrorKind::AlreadyExistsGroup => "group already exists",
            },
            OsType::Windows => match self {
                ErrorKind::NoSuchFileOrDir => "The system cannot find the file specified.",
                ErrorKind::AlreadyExists => "The file exists.",
                ErrorKind::NotADirectory => "The directory name is invalid.",
                ErrorKind::IsADirectory => "An operation is not supported on a directory.",
                ErrorKind::DirectoryNotEmpty => "The directory is not empty.",
                ErrorKind::PermissionDenied => "Access is denied.",
                ErrorKind::OperationNotPermitted => {
                    "A required privilege is not held by the client."
                }
                ErrorKind::InvalidArgument => "The parameter is incorrect.",
                ErrorKind::TooManySymlinks => {
                    "The name of the file cannot be resolved by the system."
                }
                ErrorKind::UnsupportedFeature => "The request is not supported.",
                ErrorKind::BadFileDescriptor => "The handle is invalid.",
                ErrorKind::NegativeOffset => {
                    "An attempt was made to move the file pointer before the beginning of the file."
                }
                ErrorKind::UnknownUser | ErrorKind::UnknownUserId => {
                    "The specified account does not exist."
                }
                ErrorKind::UnknownGroup | ErrorKind::UnknownGroupId => {
                    "The specified group does not exist."
                }
                ErrorKind::AlreadyExistsUser => "The specified account already exists.",
                ErrorKind::AlreadyExistsGroup => "The specified group already exists.",
            },
        }
    }

    /// Best-effort classification of a host I/O error.
    pub fn from_io(err: &io::Error) -> Self {
        if let Some(code) = err.raw_os_error() {
            match code {
                libc::ENOENT => return ErrorKind::NoSuchFileOrDir,
                libc::EEXIST => return ErrorKind::AlreadyExists,
                libc::ENOTDIR => return ErrorKind::NotADirectory,
                libc::EISDIR => return ErrorKind::IsADirectory,
                libc::ENOTEMPTY => return ErrorKind::DirectoryNotEmpty,
                libc::EACCES => return ErrorKind::PermissionDenied,
                libc::EPERM => return ErrorKind::OperationNotPermitted,
                libc::ELOOP => return ErrorKind::TooManySymlinks,
                libc::EBADF => return ErrorKind::BadFileDescriptor,
                libc::EOPNOTSUPP => return ErrorKind::UnsupportedFeature,
                _ => {}
            }
        }
        match err.kind() {
            io::ErrorKind::NotFound => ErrorKind::NoSuchFileOrDir,
            io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists,
            io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
            io::ErrorKind::Unsupported => ErrorKind::UnsupportedFeature,
            _ => ErrorKind::InvalidArgument,
        }
    }
}

fn describe(kind: &ErrorKind, os: &OsType) -> &'static str {
    kind.message(*os)
}

/// Core filesystem error type
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FsError {
    /// Failure of an operation on a single path.
    #[error("{op} {path}: {}", describe(.kind, .os))]
    Path {
        op: &'static str,
        path: String,
        kind: ErrorKind,
        os: OsType,
    },
    /// Failure of an operation involving two paths (rename, link, symlink).
    #[error("{op} {old} {new}: {}", describe(.kind, .os))]
    Link {
        op: &'static str,
        old: String,
        new: String,
        kind: ErrorKind,
        os: OsType,
    },
    #[error("user: unknown user {0}")]
    UnknownUser(String),
    #[error("user: unknown userid {0}")]
    UnknownUserId(u32),
    #[error("group: unknown group {0}")]
    UnknownGroup(String),
    #[error("group: unknown groupid {0}")]
    UnknownGroupId(u32),
    #[error("user: user {0} already exists")]
    AlreadyExistsUser(String),
    #[error("group: group {0} already exists")]
    AlreadyExistsGroup(String),
    /// Identity operation on a filesystem without an identity manager.
    #[error("{0}: identity manager not available")]
    IdentityUnsupported(&'static str),
}

impl FsError {
    pub fn path(op: &'static str, path: impl Into<String>, kind: ErrorKind, os: OsType) -> Self {
        FsError::Path {
            op,
            path: path.into(),
            kind,
            os,
        }
    }

    pub fn link(
        op: &'static str,
        old: impl Into<String>,
        new: impl Into<String>,
        kind: ErrorKind,
        os: OsType,
    ) -> Self {
        FsError::Link {
            op,
            old: old.into(),
            new: new.into(),
            kind,
            os,
        }
    }

    pub fn from_io(op: &'static str, path: impl Into<String>, err: &io::Error) -> Self {
        FsError::path(op, path, ErrorKind::from_io(err), OsType::host())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            FsError::Path { kind, .. } | FsError::Link { kind, .. } => *kind,
            FsError::UnknownUser(_) => ErrorKind::UnknownUser,
            FsError::UnknownUserId(_) => ErrorKind::UnknownUserId,
            FsError::UnknownGroup(_) => ErrorKind::UnknownGroup,
            FsError::UnknownGroupId(_) => ErrorKind::UnknownGroupId,
            FsError::AlreadyExistsUser(_) => ErrorKind::AlreadyExistsUser,
            FsError::AlreadyExistsGroup(_) => ErrorKind::AlreadyExistsGroup,
            FsError::IdentityUnsupported(_) => ErrorKind::UnsupportedFeature,
        }
    }

    /// OS-specific numeric code; identity errors use the Linux table unless
    /// they carry their own OS.
    pub fn code(&self) -> i32 {
        match self {
            FsError::Path { kind, os, .. } | FsError::Link { kind, os, .. } => kind.code(*os),
            other => other.kind().code(OsType::Linux),
        }
    }

    /// Rewrites the path(s) reported by this error, leaving the kind untouched.
    pub fn map_paths(self, f: impl Fn(&str) -> String) -> Self {
        match self {
            FsError::Path { op, path, kind, os } => FsError::Path {
                op,
                path: f(&path),
                kind,
                os,
            },
            FsError::Link {
                op,
                old,
                new,
                kind,
                os,
            } => FsError::Link {
                op,
                old: f(&old),
                new: f(&new),
                kind,
                os,
            },
            other => other,
        }
    }
}

impl From<FsError> for io::Error {
    fn from(e: FsError) -> Self {
        let kind = match e.kind() {
            ErrorKind::NoSuchFileOrDir => io::ErrorKind::NotFound,
            ErrorKind::AlreadyExists => io::ErrorKind::AlreadyExists,
            ErrorKind::PermissionDenied | ErrorKind::OperationNotPermitted => {
                io::ErrorKind::PermissionDenied
            }
            ErrorKind::InvalidArgument | ErrorKind::NegativeOffset => io::ErrorKind::InvalidInput,
            ErrorKind::UnsupportedFeature => io::ErrorKind::Unsupported,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, e)
    }
}

pub type FsResult<T> = Result<T, FsError>;
