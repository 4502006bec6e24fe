// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Prefix confinement wrapper
//!
//! Every path is cleaned against the wrapper's own working directory, so `..`
//! stops at the virtual root, and then prefixed with the base directory before
//! it reaches the inner backend. Paths in returned errors are rewritten back to
//! the virtual namespace.

use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::RwLock;
use tracing::info;

use crate::backend::{unsupported, FileSystem};
use crate::error::{ErrorKind, FsError, FsResult};
use crate::features::Features;
use crate::identity::{IdentityMgr, User};
use crate::os::OsType;
use crate::types::{DirEntry, FileInfo, HandleId, OpenFlags, SeekFrom};

#[derive(Debug)]
pub struct BasePathFs<F> {
    inner: F,
    base: String,
    /// Virtual working directory, always absolute and clean.
    cwd: RwLock<String>,
}

impl<F: FileSystem> BasePathFs<F> {
    /// Confines `inner` below `base`, which must be an existing directory.
    pub fn new(inner: F, base: &str) -> FsResult<Self> {
        let os = inner.os_type();
        let base = os.clean(base);
        let info = inner.stat(&base)?;
        if !info.is_dir() {
            return Err(FsError::path("basepath", base, ErrorKind::NotADirectory, os));
        }
        info!(base = %base, backend = inner.type_name(), "confined filesystem created");
        Ok(Self {
            inner,
            cwd: RwLock::new(os.root().to_string()),
            base,
        })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn inner(&self) -> &F {
        &self.inner
    }

    fn os(&self) -> OsType {
        self.inner.os_type()
    }

    /// Absolute, clean virtual form of `path`.
    fn virtual_path(&self, path: &str) -> String {
        let os = self.os();
        if os.is_abs(path) {
            os.clean(path)
        } else {
            let cwd = self.cwd.read();
            os.clean(&os.join(&[cwd.as_str(), path]))
        }
    }

    fn to_inner(&self, path: &str) -> String {
        let os = self.os();
        let virt = self.virtual_path(path);
        let parts = os.parts(&virt);
        let mut elems = Vec::with_capacity(parts.segments.len() + 1);
        elems.push(self.base.as_str());
        elems.extend(parts.segments);
        os.join(&elems)
    }

    fn to_outer(&self, inner_path: &str) -> String {
        let os = self.os();
        let Some(rest) = inner_path.strip_prefix(self.base.as_str()) else {
            return inner_path.to_string();
        };
        let trimmed = rest.trim_start_matches(|c| os.is_separator(c));
        if trimmed.is_empty() {
            return os.root().to_string();
        }
        if trimmed.len() == rest.len() {
            // Sibling sharing the prefix, e.g. /srv/jail2 for base /srv/jail.
            return inner_path.to_string();
        }
        os.join(&[os.root(), trimmed])
    }

    fn map<T>(&self, result: FsResult<T>) -> FsResult<T> {
        result.map_err(|e| e.map_paths(|p| self.to_outer(p)))
    }
}

impl<F: FileSystem> FileSystem for BasePathFs<F> {
    fn type_name(&self) -> &'static str {
        "BasePathFs"
    }

    fn os_type(&self) -> OsType {
        self.os()
    }

    fn features(&self) -> Features {
        self.inner.features() - (Features::SYMLINK | Features::CHROOT)
    }

    fn idm(&self) -> Arc<dyn IdentityMgr> {
        self.inner.idm()
    }

    fn user(&self) -> User {
        self.inner.user()
    }

    fn getwd(&self) -> FsResult<String> {
        Ok(self.cwd.read().clone())
    }

    fn chdir(&self, path: &str) -> FsResult<()> {
        let info = self.map(self.inner.stat(&self.to_inner(path)))?;
        if !info.is_dir() {
            return Err(FsError::path("chdir", path, ErrorKind::NotADirectory, self.os()));
        }
        *self.cwd.write() = self.virtual_path(path);
        Ok(())
    }

    fn chroot(&self, path: &str) -> FsResult<()> {
        Err(unsupported("chroot", path, self.os()))
    }

    fn umask(&self) -> u32 {
        self.inner.umask()
    }

    fn set_umask(&self, mask: u32) -> u32 {
        self.inner.set_umask(mask)
    }

    fn tmp_dir(&self) -> String {
        self.os().root().to_string()
    }

    fn open_file(&self, path: &str, flags: OpenFlags, perm: u32) -> FsResult<HandleId> {
        self.map(self.inner.open_file(&self.to_inner(path), flags, perm))
    }

    fn read(&self, handle: HandleId, buf: &mut [u8]) -> FsResult<usize> {
        self.map(self.inner.read(handle, buf))
    }

    fn read_at(&self, handle: HandleId, buf: &mut [u8], offset: i64) -> FsResult<usize> {
        self.map(self.inner.read_at(handle, buf, offset))
    }

    fn write(&self, handle: HandleId, data: &[u8]) -> FsResult<usize> {
        self.map(self.inner.write(handle, data))
    }

    fn write_at(&self, handle: HandleId, data: &[u8], offset: i64) -> FsResult<usize> {
        self.map(self.inner.write_at(handle, data, offset))
    }

    fn seek(&self, handle: HandleId, pos: SeekFrom) -> FsResult<u64> {
        self.map(self.inner.seek(handle, pos))
    }

    fn truncate(&self, handle: HandleId, size: i64) -> FsResult<()> {
        self.map(self.inner.truncate(handle, size))
    }

    fn close(&self, handle: HandleId) -> FsResult<()> {
        self.map(self.inner.close(handle))
    }

    fn handle_stat(&self, handle: HandleId) -> FsResult<FileInfo> {
        self.map(self.inner.handle_stat(handle))
    }

    fn read_file(&self, path: &str) -> FsResult<Vec<u8>> {
        self.map(self.inner.read_file(&self.to_inner(path)))
    }

    fn write_file(&self, path: &str, data: &[u8], perm: u32) -> FsResult<()> {
        self.map(self.inner.write_file(&self.to_inner(path), data, perm))
    }

    fn mkdir(&self, path: &str, perm: u32) -> FsResult<()> {
        self.map(self.inner.mkdir(&self.to_inner(path), perm))
    }

    fn mkdir_all(&self, path: &str, perm: u32) -> FsResult<()> {
        self.map(self.inner.mkdir_all(&self.to_inner(path), perm))
    }

    fn remove(&self, path: &str) -> FsResult<()> {
        self.map(self.inner.remove(&self.to_inner(path)))
    }

    fn remove_all(&self, path: &str) -> FsResult<()> {
        if self.virtual_path(path) == self.os().root() {
            return Err(FsError::path("removeall", path, ErrorKind::InvalidArgument, self.os()));
        }
        self.map(self.inner.remove_all(&self.to_inner(path)))
    }

    fn unlink(&self, path: &str) -> FsResult<()> {
        self.map(self.inner.unlink(&self.to_inner(path)))
    }

    fn rmdir(&self, path: &str) -> FsResult<()> {
        self.map(self.inner.rmdir(&self.to_inner(path)))
    }

    fn rename(&self, old: &str, new: &str) -> FsResult<()> {
        self.map(self.inner.rename(&self.to_inner(old), &self.to_inner(new)))
    }

    fn symlink(&self, target: &str, link: &str) -> FsResult<()> {
        Err(FsError::link("symlink", target, link, ErrorKind::UnsupportedFeature, self.os()))
    }

    fn read_link(&self, path: &str) -> FsResult<String> {
        Err(unsupported("readlink", path, self.os()))
    }

    fn link(&self, old: &str, new: &str) -> FsResult<()> {
        self.map(self.inner.link(&self.to_inner(old), &self.to_inner(new)))
    }

    fn stat(&self, path: &str) -> FsResult<FileInfo> {
        self.map(self.inner.stat(&self.to_inner(path)))
    }

    fn lstat(&self, path: &str) -> FsResult<FileInfo> {
        self.map(self.inner.lstat(&self.to_inner(path)))
    }

    fn read_dir(&self, path: &str) -> FsResult<Vec<DirEntry>> {
        self.map(self.inner.read_dir(&self.to_inner(path)))
    }

    fn chmod(&self, path: &str, mode: u32) -> FsResult<()> {
        self.map(self.inner.chmod(&self.to_inner(path), mode))
    }

    fn chown(&self, path: &str, uid: u32, gid: u32) -> FsResult<()> {
        self.map(self.inner.chown(&self.to_inner(path), uid, gid))
    }

    fn lchown(&self, path: &str, uid: u32, gid: u32) -> FsResult<()> {
        self.map(self.inner.lchown(&self.to_inner(path), uid, gid))
    }

    fn chtimes(&self, path: &str, atime: SystemTime, mtime: SystemTime) -> FsResult<()> {
        self.map(self.inner.chtimes(&self.to_inner(path), atime, mtime))
    }

    fn truncate_path(&self, path: &str, size: i64) -> FsResult<()> {
        self.map(self.inner.truncate_path(&self.to_inner(path), size))
    }

    fn same_file(&self, a: &FileInfo, b: &FileInfo) -> bool {
        self.inner.same_file(a, b)
    }
}
