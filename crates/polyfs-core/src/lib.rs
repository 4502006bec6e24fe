// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! PolyFS Core - virtual filesystem abstraction with an in-memory engine
//!
//! [`MemFs`] emulates a Linux or Windows filesystem entirely in memory, with
//! users, permissions, hard and symbolic links and chroot views. [`OsFs`],
//! [`RoFs`] and [`BasePathFs`] expose the same [`FileSystem`] interface over
//! the host, as a read-only layer and below a fixed prefix.

pub mod backend;
pub mod basepathfs;
pub mod config;
pub mod error;
pub mod features;
pub mod identity;
pub mod memfs;
pub mod os;
#[cfg(unix)]
pub mod osfs;
pub mod rofs;
pub mod tree;
pub mod types;

#[cfg(test)]
mod test_concurrency;
#[cfg(test)]
mod test_engine;

pub use backend::FileSystem;
pub use basepathfs::BasePathFs;
pub use config::FsConfig;
pub use error::{ErrorKind, FsError, FsResult};
pub use features::Features;
pub use identity::{Group, IdentityMgr, MemIdm, NoIdm, User};
pub use memfs::MemFs;
pub use os::OsType;
#[cfg(unix)]
pub use osfs::OsFs;
pub use rofs::RoFs;
pub use tree::TreeStats;
pub use types::{DirEntry, FileInfo, FileMode, FileTimes, FileType, HandleId, OpenFlags, SeekFrom, StatT};
