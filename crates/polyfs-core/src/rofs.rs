// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Read-only wrapper around any backend

use std::sync::Arc;
use std::time::SystemTime;

use crate::backend::FileSystem;
use crate::error::{ErrorKind, FsError, FsResult};
use crate::features::Features;
use crate::identity::{IdentityMgr, User};
use crate::os::OsType;
use crate::types::{DirEntry, FileInfo, HandleId, OpenFlags, SeekFrom};

/// Serves lookups and reads from `F`; every mutation fails `OperationNotPermitted`.
#[derive(Debug)]
pub struct RoFs<F> {
    inner: F,
}

impl<F: FileSystem> RoFs<F> {
    pub fn new(inner: F) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &F {
        &self.inner
    }

    pub fn into_inner(self) -> F {
        self.inner
    }

    fn denied(&self, op: &'static str, path: &str) -> FsError {
        FsError::path(op, path, ErrorKind::OperationNotPermitted, self.inner.os_type())
    }

    fn denied_link(&self, op: &'static str, old: &str, new: &str) -> FsError {
        FsError::link(op, old, new, ErrorKind::OperationNotPermitted, self.inner.os_type())
    }
}

impl<F: FileSystem> FileSystem for RoFs<F> {
    fn type_name(&self) -> &'static str {
        "RoFs"
    }

    fn os_type(&self) -> OsType {
        self.inner.os_type()
    }

    fn features(&self) -> Features {
        self.inner.features() | Features::READ_ONLY
    }

    fn idm(&self) -> Arc<dyn IdentityMgr> {
        self.inner.idm()
    }

    fn user(&self) -> User {
        self.inner.user()
    }

    fn getwd(&self) -> FsResult<String> {
        self.inner.getwd()
    }

    fn chdir(&self, path: &str) -> FsResult<()> {
        self.inner.chdir(path)
    }

    fn chroot(&self, path: &str) -> FsResult<()> {
        self.inner.chroot(path)
    }

    fn umask(&self) -> u32 {
        self.inner.umask()
    }

    fn set_umask(&self, mask: u32) -> u32 {
        self.inner.set_umask(mask)
    }

    fn tmp_dir(&self) -> String {
        self.inner.tmp_dir()
    }

    fn open_file(&self, path: &str, flags: OpenFlags, perm: u32) -> FsResult<HandleId> {
        let mutating = OpenFlags::WRITE | OpenFlags::APPEND | OpenFlags::CREATE | OpenFlags::TRUNCATE;
        if flags.intersects(mutating) {
            return Err(self.denied("open", path));
        }
        self.inner.open_file(path, flags, perm)
    }

    fn read(&self, handle: HandleId, buf: &mut [u8]) -> FsResult<usize> {
        self.inner.read(handle, buf)
    }

    fn read_at(&self, handle: HandleId, buf: &mut [u8], offset: i64) -> FsResult<usize> {
        self.inner.read_at(handle, buf, offset)
    }

    fn write(&self, handle: HandleId, _data: &[u8]) -> FsResult<usize> {
        Err(self.denied("write", &handle.to_string()))
    }

    fn write_at(&self, handle: HandleId, _data: &[u8], _offset: i64) -> FsResult<usize> {
        Err(self.denied("write", &handle.to_string()))
    }

    fn seek(&self, handle: HandleId, pos: SeekFrom) -> FsResult<u64> {
        self.inner.seek(handle, pos)
    }

    fn truncate(&self, handle: HandleId, _size: i64) -> FsResult<()> {
        Err(self.denied("truncate", &handle.to_string()))
    }

    fn close(&self, handle: HandleId) -> FsResult<()> {
        self.inner.close(handle)
    }

    fn handle_stat(&self, handle: HandleId) -> FsResult<FileInfo> {
        self.inner.handle_stat(handle)
    }

    fn read_file(&self, path: &str) -> FsResult<Vec<u8>> {
        self.inner.read_file(path)
    }

    fn write_file(&self, path: &str, _data: &[u8], _perm: u32) -> FsResult<()> {
        Err(self.denied("open", path))
    }

    fn mkdir(&self, path: &str, _perm: u32) -> FsResult<()> {
        Err(self.denied("mkdir", path))
    }

    fn mkdir_all(&self, path: &str, _perm: u32) -> FsResult<()> {
        Err(self.denied("mkdir", path))
    }

    fn remove(&self, path: &str) -> FsResult<()> {
        Err(self.denied("remove", path))
    }

    fn remove_all(&self, path: &str) -> FsResult<()> {
        Err(self.denied("removeall", path))
    }

    fn unlink(&self, path: &str) -> FsResult<()> {
        Err(self.denied("unlink", path))
    }

    fn rmdir(&self, path: &str) -> FsResult<()> {
        Err(self.denied("rmdir", path))
    }

    fn rename(&self, old: &str, new: &str) -> FsResult<()> {
        Err(self.denied_link("rename", old, new))
    }

    fn symlink(&self, target: &str, link: &str) -> FsResult<()> {
        Err(self.denied_link("symlink", target, link))
    }

    fn read_link(&self, path: &str) -> FsResult<String> {
        self.inner.read_link(path)
    }

    fn link(&self, old: &str, new: &str) -> FsResult<()> {
        Err(self.denied_link("link", old, new))
    }

    fn stat(&self, path: &str) -> FsResult<FileInfo> {
        self.inner.stat(path)
    }

    fn lstat(&self, path: &str) -> FsResult<FileInfo> {
        self.inner.lstat(path)
    }

    fn read_dir(&self, path: &str) -> FsResult<Vec<DirEntry>> {
        self.inner.read_dir(path)
    }

    fn chmod(&self, path: &str, _mode: u32) -> FsResult<()> {
        Err(self.denied("chmod", path))
    }

    fn chown(&self, path: &str, _uid: u32, _gid: u32) -> FsResult<()> {
        Err(self.denied("chown", path))
    }

    fn lchown(&self, path: &str, _uid: u32, _gid: u32) -> FsResult<()> {
        Err(self.denied("lchown", path))
    }

    fn chtimes(&self, path: &str, _atime: SystemTime, _mtime: SystemTime) -> FsResult<()> {
        Err(self.denied("chtimes", path))
    }

    fn truncate_path(&self, path: &str, _size: i64) -> FsResult<()> {
        Err(self.denied("truncate", path))
    }

    fn same_file(&self, a: &FileInfo, b: &FileInfo) -> bool {
        self.inner.same_file(a, b)
    }
}
