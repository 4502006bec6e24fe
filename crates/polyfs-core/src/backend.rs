// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Capability interface shared by every filesystem backend
//!
//! Callers branch on [`FileSystem::features`], never on the concrete backend.

use std::sync::Arc;
use std::time::SystemTime;

use crate::error::{ErrorKind, FsError, FsResult};
use crate::features::Features;
use crate::identity::{IdentityMgr, User};
use crate::memfs::MemFs;
use crate::os::OsType;
use crate::types::{DirEntry, FileInfo, HandleId, OpenFlags, SeekFrom};

/// Operations every backend provides. Paths use the backend's emulated OS syntax.
pub trait FileSystem: Send + Sync {
    /// Short backend name used in logs and reports.
    fn type_name(&self) -> &'static str;
    fn os_type(&self) -> OsType;
    fn features(&self) -> Features;

    fn has_feature(&self, feature: Features) -> bool {
        self.features().contains(feature)
    }

    fn idm(&self) -> Arc<dyn IdentityMgr>;
    fn user(&self) -> User;

    fn getwd(&self) -> FsResult<String>;
    fn chdir(&self, path: &str) -> FsResult<()>;
    fn chroot(&self, path: &str) -> FsResult<()>;

    fn umask(&self) -> u32;
    /// Replaces the umask, returning the previous value.
    fn set_umask(&self, mask: u32) -> u32;

    fn tmp_dir(&self) -> String {
        match self.os_type() {
            OsType::Linux => "/tmp".to_string(),
            OsType::Windows => "C:\\Windows\\Temp".to_string(),
        }
    }

    fn join(&self, elems: &[&str]) -> String {
        self.os_type().join(elems)
    }

    // handles

    fn open_file(&self, path: &str, flags: OpenFlags, perm: u32) -> FsResult<HandleId>;

    fn open(&self, path: &str) -> FsResult<HandleId> {
        self.open_file(path, OpenFlags::READ, 0)
    }

    fn create(&self, path: &str) -> FsResult<HandleId> {
        self.open_file(
            path,
            OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
            0o666,
        )
    }

    fn read(&self, handle: HandleId, buf: &mut [u8]) -> FsResult<usize>;
    fn read_at(&self, handle: HandleId, buf: &mut [u8], offset: i64) -> FsResult<usize>;
    fn write(&self, handle: HandleId, data: &[u8]) -> FsResult<usize>;
    fn write_at(&self, handle: HandleId, data: &[u8], offset: i64) -> FsResult<usize>;
    fn seek(&self, handle: HandleId, pos: SeekFrom) -> FsResult<u64>;
    fn truncate(&self, handle: HandleId, size: i64) -> FsResult<()>;
    fn close(&self, handle: HandleId) -> FsResult<()>;
    fn handle_stat(&self, handle: HandleId) -> FsResult<FileInfo>;

    // whole files

    fn read_file(&self, path: &str) -> FsResult<Vec<u8>> {
        let handle = self.open(path)?;
        let mut content = Vec::new();
        let mut buf = [0u8; 8192];
        let result = loop {
            match self.read(handle, &mut buf) {
                Ok(0) => break Ok(content),
                Ok(n) => content.extend_from_slice(&buf[..n]),
                Err(e) => break Err(e),
            }
        };
        self.close(handle)?;
        result
    }

    fn write_file(&self, path: &str, data: &[u8], perm: u32) -> FsResult<()> {
        let handle = self.open_file(
            path,
            OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
            perm,
        )?;
        let result = self.write(handle, data).map(|_| ());
        self.close(handle)?;
        result
    }

    // tree

    fn mkdir(&self, path: &str, perm: u32) -> FsResult<()>;
    fn mkdir_all(&self, path: &str, perm: u32) -> FsResult<()>;
    fn remove(&self, path: &str) -> FsResult<()>;
    fn remove_all(&self, path: &str) -> FsResult<()>;
    fn unlink(&self, path: &str) -> FsResult<()>;
    fn rmdir(&self, path: &str) -> FsResult<()>;
    fn rename(&self, old: &str, new: &str) -> FsResult<()>;
    fn symlink(&self, target: &str, link: &str) -> FsResult<()>;
    fn read_link(&self, path: &str) -> FsResult<String>;
    fn link(&self, old: &str, new: &str) -> FsResult<()>;
    fn stat(&self, path: &str) -> FsResult<FileInfo>;
    fn lstat(&self, path: &str) -> FsResult<FileInfo>;
    fn read_dir(&self, path: &str) -> FsResult<Vec<DirEntry>>;

    // metadata

    fn chmod(&self, path: &str, mode: u32) -> FsResult<()>;
    fn chown(&self, path: &str, uid: u32, gid: u32) -> FsResult<()>;
    fn lchown(&self, path: &str, uid: u32, gid: u32) -> FsResult<()>;
    fn chtimes(&self, path: &str, atime: SystemTime, mtime: SystemTime) -> FsResult<()>;
    fn truncate_path(&self, path: &str, size: i64) -> FsResult<()>;

    fn same_file(&self, a: &FileInfo, b: &FileInfo) -> bool {
        a.ino() == b.ino()
    }
}

/// Error for a capability the backend does not have.
pub(crate) fn unsupported(op: &'static str, path: &str, os: OsType) -> FsError {
    FsError::path(op, path, ErrorKind::UnsupportedFeature, os)
}

impl FileSystem for MemFs {
    fn type_name(&self) -> &'static str {
        "MemFs"
    }

    fn os_type(&self) -> OsType {
        MemFs::os_type(self)
    }

    fn features(&self) -> Features {
        MemFs::features(self)
    }

    fn idm(&self) -> Arc<dyn IdentityMgr> {
        MemFs::idm(self)
    }

    fn user(&self) -> User {
        MemFs::user(self)
    }

    fn getwd(&self) -> FsResult<String> {
        MemFs::getwd(self)
    }

    fn chdir(&self, path: &str) -> FsResult<()> {
        MemFs::chdir(self, path)
    }

    fn chroot(&self, path: &str) -> FsResult<()> {
        MemFs::chroot(self, path)
    }

    fn umask(&self) -> u32 {
        MemFs::umask(self)
    }

    fn set_umask(&self, mask: u32) -> u32 {
        MemFs::set_umask(self, mask)
    }

    fn tmp_dir(&self) -> String {
        MemFs::tmp_dir(self)
    }

    fn open_file(&self, path: &str, flags: OpenFlags, perm: u32) -> FsResult<HandleId> {
        MemFs::open_file(self, path, flags, perm)
    }

    fn read(&self, handle: HandleId, buf: &mut [u8]) -> FsResult<usize> {
        MemFs::read(self, handle, buf)
    }

    fn read_at(&self, handle: HandleId, buf: &mut [u8], offset: i64) -> FsResult<usize> {
        MemFs::read_at(self, handle, buf, offset)
    }

    fn write(&self, handle: HandleId, data: &[u8]) -> FsResult<usize> {
        MemFs::write(self, handle, data)
    }

    fn write_at(&self, handle: HandleId, data: &[u8], offset: i64) -> FsResult<usize> {
        MemFs::write_at(self, handle, data, offset)
    }

    fn seek(&self, handle: HandleId, pos: SeekFrom) -> FsResult<u64> {
        MemFs::seek(self, handle, pos)
    }

    fn truncate(&self, handle: HandleId, size: i64) -> FsResult<()> {
        MemFs::truncate(self, handle, size)
    }

    fn close(&self, handle: HandleId) -> FsResult<()> {
        MemFs::close(self, handle)
    }

    fn handle_stat(&self, handle: HandleId) -> FsResult<FileInfo> {
        MemFs::handle_stat(self, handle)
    }

    fn read_file(&self, path: &str) -> FsResult<Vec<u8>> {
        MemFs::read_file(self, path)
    }

    fn write_file(&self, path: &str, data: &[u8], perm: u32) -> FsResult<()> {
        MemFs::write_file(self, path, data, perm)
    }

    fn mkdir(&self, path: &str, perm: u32) -> FsResult<()> {
        MemFs::mkdir(self, path, perm)
    }

    fn mkdir_all(&self, path: &str, perm: u32) -> FsResult<()> {
        MemFs::mkdir_all(self, path, perm)
    }

    fn remove(&self, path: &str) -> FsResult<()> {
        MemFs::remove(self, path)
    }

    fn remove_all(&self, path: &str) -> FsResult<()> {
        MemFs::remove_all(self, path)
    }

    fn unlink(&self, path: &str) -> FsResult<()> {
        MemFs::unlink(self, path)
    }

    fn rmdir(&self, path: &str) -> FsResult<()> {
        MemFs::rmdir(self, path)
    }

    fn rename(&self, old: &str, new: &str) -> FsResult<()> {
        MemFs::rename(self, old, new)
    }

    fn symlink(&self, target: &str, link: &str) -> FsResult<()> {
        MemFs::symlink(self, target, link)
    }

    fn read_link(&self, path: &str) -> FsResult<String> {
        MemFs::read_link(self, path)
    }

    fn link(&self, old: &str, new: &str) -> FsResult<()> {
        MemFs::link(self, old, new)
    }

    fn stat(&self, path: &str) -> FsResult<FileInfo> {
        MemFs::stat(self, path)
    }

    fn lstat(&self, path: &str) -> FsResult<FileInfo> {
        MemFs::lstat(self, path)
    }

    fn read_dir(&self, path: &str) -> FsResult<Vec<DirEntry>> {
        MemFs::read_dir(self, path)
    }

    fn chmod(&self, path: &str, mode: u32) -> FsResult<()> {
        MemFs::chmod(self, path, mode)
    }

    fn chown(&self, path: &str, uid: u32, gid: u32) -> FsResult<()> {
        MemFs::chown(self, path, uid, gid)
    }

    fn lchown(&self, path: &str, uid: u32, gid: u32) -> FsResult<()> {
        MemFs::lchown(self, path, uid, gid)
    }

    fn chtimes(&self, path: &str, atime: SystemTime, mtime: SystemTime) -> FsResult<()> {
        MemFs::chtimes(self, path, atime, mtime)
    }

    fn truncate_path(&self, path: &str, size: i64) -> FsResult<()> {
        MemFs::truncate_path(self, path, size)
    }

    fn same_file(&self, a: &FileInfo, b: &FileInfo) -> bool {
        MemFs::same_file(self, a, b)
    }
}
