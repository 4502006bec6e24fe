// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Core type definitions for PolyFS

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Opaque handle identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub u64);

impl HandleId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for HandleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "handle#{}", self.0)
    }
}

/// Kind of a filesystem object
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileType {
    Regular,
    Directory,
    Symlink,
}

/// Type and permission bits, laid out like `st_mode`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileMode(pub u32);

impl FileMode {
    pub const TYPE_MASK: u32 = 0o170000;
    pub const DIR: u32 = 0o040000;
    pub const REGULAR: u32 = 0o100000;
    pub const SYMLINK: u32 = 0o120000;

    pub const SETUID: u32 = 0o4000;
    pub const SETGID: u32 = 0o2000;
    pub const STICKY: u32 = 0o1000;
    pub const PERM_MASK: u32 = 0o777;
    /// Permission bits plus setuid/setgid/sticky.
    pub const MODE_MASK: u32 = 0o7777;

    pub fn new(file_type: FileType, perm: u32) -> Self {
        let type_bits = match file_type {
            FileType::Regular => Self::REGULAR,
            FileType::Directory => Self::DIR,
            FileType::Symlink => Self::SYMLINK,
        };
        Self(type_bits | (perm & Self::MODE_MASK))
    }

    pub fn file_type(self) -> FileType {
        match self.0 & Self::TYPE_MASK {
            Self::DIR => FileType::Directory,
            Self::SYMLINK => FileType::Symlink,
            _ => FileType::Regular,
        }
    }

    /// The nine rwx bits.
    pub fn perm(self) -> u32 {
        self.0 & Self::PERM_MASK
    }

    pub fn is_dir(self) -> bool {
        self.file_type() == FileType::Directory
    }

    pub fn is_symlink(self) -> bool {
        self.file_type() == FileType::Symlink
    }

    pub fn is_regular(self) -> bool {
        self.file_type() == FileType::Regular
    }
}

impl std::fmt::Display for FileMode {
    /// `ls -l` style rendering, e.g. `drwxr-xr-x` or `-rw-r--r--`.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let type_char = match self.file_type() {
            FileType::Directory => 'd',
            FileType::Symlink => 'l',
            FileType::Regular => '-',
        };
        let mut s = String::with_capacity(10);
        s.push(type_char);
        let bits = self.0;
        for (shift, special, special_char) in
            [(6, Self::SETUID, 's'), (3, Self::SETGID, 's'), (0, Self::STICKY, 't')]
        {
            let triplet = (bits >> shift) & 0o7;
            s.push(if triplet & 0o4 != 0 { 'r' } else { '-' });
            s.push(if triplet & 0o2 != 0 { 'w' } else { '-' });
            let exec = triplet & 0o1 != 0;
            s.push(match (bits & special != 0, exec) {
                (true, true) => special_char,
                (true, false) => special_char.to_ascii_uppercase(),
                (false, true) => 'x',
                (false, false) => '-',
            });
        }
        f.write_str(&s)
    }
}

/// Ownership-aware part of a stat result.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StatT {
    pub uid: u32,
    pub gid: u32,
    pub nlink: u64,
}

/// File timestamps
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileTimes {
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub birthtime: SystemTime,
}

impl FileTimes {
    pub fn now() -> Self {
        let now = SystemTime::now();
        Self {
            atime: now,
            mtime: now,
            ctime: now,
            birthtime: now,
        }
    }
}

/// Result of `stat`/`lstat`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileInfo {
    pub(crate) name: String,
    pub(crate) size: u64,
    pub(crate) mode: FileMode,
    pub(crate) times: FileTimes,
    pub(crate) sys: StatT,
    /// Identity of the underlying object within its filesystem.
    pub(crate) ino: u64,
}

impl FileInfo {
    pub fn new(
        name: impl Into<String>,
        size: u64,
        mode: FileMode,
        times: FileTimes,
        sys: StatT,
        ino: u64,
    ) -> Self {
        Self {
            name: name.into(),
            size,
            mode,
            times,
            sys,
            ino,
        }
    }

    /// Base name of the path that was looked up.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn mode(&self) -> FileMode {
        self.mode
    }

    pub fn mod_time(&self) -> SystemTime {
        self.times.mtime
    }

    pub fn times(&self) -> FileTimes {
        self.times
    }

    pub fn is_dir(&self) -> bool {
        self.mode.is_dir()
    }

    pub fn sys(&self) -> StatT {
        self.sys
    }

    pub fn ino(&self) -> u64 {
        self.ino
    }
}

/// Directory entry information
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub file_type: FileType,
    pub ino: u64,
}

impl DirEntry {
    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Directory
    }
}

bitflags! {
    /// Flags accepted by `open_file`.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct OpenFlags: u32 {
        const READ     = 1 << 0;
        const WRITE    = 1 << 1;
        const APPEND   = 1 << 2;
        const CREATE   = 1 << 3;
        const EXCL     = 1 << 4;
        const TRUNCATE = 1 << 5;
    }
}

impl OpenFlags {
    pub fn is_write(self) -> bool {
        self.intersects(OpenFlags::WRITE | OpenFlags::APPEND)
    }
}

/// Origin of a `seek`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeekFrom {
    Start(i64),
    Current(i64),
    End(i64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_rendering() {
        assert_eq!(FileMode::new(FileType::Directory, 0o755).to_string(), "drwxr-xr-x");
        assert_eq!(FileMode::new(FileType::Regular, 0o644).to_string(), "-rw-r--r--");
        assert_eq!(FileMode::new(FileType::Symlink, 0o777).to_string(), "lrwxrwxrwx");
        assert_eq!(FileMode::new(FileType::Directory, 0o1777).to_string(), "drwxrwxrwt");
        assert_eq!(FileMode::new(FileType::Regular, 0o4644).to_string(), "-rwSr--r--");
    }

    #[test]
    fn test_mode_type_bits() {
        let mode = FileMode::new(FileType::Directory, 0o700);
        assert!(mode.is_dir());
        assert_eq!(mode.perm(), 0o700);
        assert_eq!(mode.0 & FileMode::TYPE_MASK, FileMode::DIR);
        assert!(FileMode(FileMode::SYMLINK | 0o777).is_symlink());
    }

    #[test]
    fn test_open_flags_write_detection() {
        assert!(!OpenFlags::READ.is_write());
        assert!((OpenFlags::READ | OpenFlags::APPEND).is_write());
        assert!(OpenFlags::WRITE.is_write());
    }
}
