// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Host pass-through backend
//!
//! Every call is served by `std::fs` on the host. The working directory and the
//! umask are kept per instance so several `OsFs` values never disturb each
//! other or the process.

use std::collections::HashMap;
use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io::{self, Read, Seek, Write};
use std::os::unix::fs::{DirBuilderExt, FileExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::backend::{unsupported, FileSystem};
use crate::config::DEFAULT_UMASK;
use crate::error::{ErrorKind, FsError, FsResult};
use crate::features::Features;
use crate::identity::{IdentityMgr, NoIdm, User};
use crate::os::OsType;
use crate::types::{DirEntry, FileInfo, FileMode, FileTimes, FileType, HandleId, OpenFlags, SeekFrom, StatT};

struct HostHandle {
    file: File,
    flags: OpenFlags,
    path: String,
}

/// Filesystem backed by the host operating system.
pub struct OsFs {
    user: User,
    idm: Arc<dyn IdentityMgr>,
    cwd: RwLock<PathBuf>,
    umask: AtomicU32,
    handles: Mutex<HashMap<HandleId, HostHandle>>,
    next_handle: AtomicU64,
}

impl std::fmt::Debug for OsFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OsFs")
            .field("user", &self.user.name())
            .field("cwd", &*self.cwd.read())
            .finish()
    }
}

fn host_user() -> User {
    // SAFETY: geteuid/getegid cannot fail and touch no memory.
    let (uid, gid) = unsafe { (libc::geteuid(), libc::getegid()) };
    let name = std::env::var("USER").unwrap_or_else(|_| uid.to_string());
    User::new(name, uid, gid)
}

fn file_type_of(ft: fs::FileType) -> FileType {
    if ft.is_dir() {
        FileType::Directory
    } else if ft.is_symlink() {
        FileType::Symlink
    } else {
        FileType::Regular
    }
}

fn info_from(name: String, meta: &fs::Metadata) -> FileInfo {
    let created = meta.created().unwrap_or(SystemTime::UNIX_EPOCH);
    let times = FileTimes {
        atime: meta.accessed().unwrap_or(created),
        mtime: meta.modified().unwrap_or(created),
        ctime: meta.modified().unwrap_or(created),
        birthtime: created,
    };
    let mode = FileMode::new(file_type_of(meta.file_type()), meta.mode());
    let sys = StatT {
        uid: meta.uid(),
        gid: meta.gid(),
        nlink: meta.nlink(),
    };
    FileInfo::new(name, meta.len(), mode, times, sys, meta.ino())
}

impl OsFs {
    pub fn new() -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
        let user = host_user();
        info!(user = %user.name(), cwd = %cwd.display(), "host filesystem created");
        Self {
            user,
            idm: Arc::new(NoIdm::new(OsType::Linux)),
            cwd: RwLock::new(cwd),
            umask: AtomicU32::new(DEFAULT_UMASK),
            handles: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    fn host_path(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.cwd.read().join(p)
        }
    }

    fn masked(&self, perm: u32) -> u32 {
        perm & FileMode::MODE_MASK & !self.umask.load(Ordering::SeqCst)
    }

    fn with_handle<T>(
        &self,
        op: &'static str,
        handle: HandleId,
        f: impl FnOnce(&mut HostHandle) -> FsResult<T>,
    ) -> FsResult<T> {
        let mut handles = self.handles.lock();
        let entry = handles
            .get_mut(&handle)
            .ok_or_else(|| FsError::path(op, handle.to_string(), ErrorKind::BadFileDescriptor, OsType::Linux))?;
        f(entry)
    }
}

impl Default for OsFs {
    fn default() -> Self {
        Self::new()
    }
}

fn bad_fd(op: &'static str, path: &str) -> FsError {
    FsError::path(op, path, ErrorKind::BadFileDescriptor, OsType::Linux)
}

fn offset_of(op: &'static str, path: &str, offset: i64) -> FsResult<u64> {
    u64::try_from(offset).map_err(|_| FsError::path(op, path, ErrorKind::NegativeOffset, OsType::Linux))
}

impl FileSystem for OsFs {
    fn type_name(&self) -> &'static str {
        "OsFs"
    }

    fn os_type(&self) -> OsType {
        OsType::Linux
    }

    fn features(&self) -> Features {
        Features::SYMLINK | Features::HARDLINK | Features::REAL_FS
    }

    fn idm(&self) -> Arc<dyn IdentityMgr> {
        Arc::clone(&self.idm)
    }

    fn user(&self) -> User {
        self.user.clone()
    }

    fn getwd(&self) -> FsResult<String> {
        Ok(self.cwd.read().to_string_lossy().into_owned())
    }

    fn chdir(&self, path: &str) -> FsResult<()> {
        let target = self.host_path(path);
        let meta = fs::metadata(&target).map_err(|e| FsError::from_io("chdir", path, &e))?;
        if !meta.is_dir() {
            return Err(FsError::path("chdir", path, ErrorKind::NotADirectory, OsType::Linux));
        }
        let cleaned = OsType::Linux.clean(&target.to_string_lossy());
        *self.cwd.write() = PathBuf::from(cleaned);
        Ok(())
    }

    fn chroot(&self, path: &str) -> FsResult<()> {
        Err(unsupported("chroot", path, OsType::Linux))
    }

    fn umask(&self) -> u32 {
        self.umask.load(Ordering::SeqCst)
    }

    fn set_umask(&self, mask: u32) -> u32 {
        self.umask.swap(mask & FileMode::PERM_MASK, Ordering::SeqCst)
    }

    fn tmp_dir(&self) -> String {
        std::env::temp_dir().to_string_lossy().into_owned()
    }

    fn open_file(&self, path: &str, flags: OpenFlags, perm: u32) -> FsResult<HandleId> {
        const OP: &str = "open";
        if !flags.intersects(OpenFlags::READ | OpenFlags::WRITE | OpenFlags::APPEND) {
            return Err(FsError::path(OP, path, ErrorKind::InvalidArgument, OsType::Linux));
        }
        let file = OpenOptions::new()
            .read(flags.contains(OpenFlags::READ))
            .write(flags.contains(OpenFlags::WRITE))
            .append(flags.contains(OpenFlags::APPEND))
            .create(flags.contains(OpenFlags::CREATE) && !flags.contains(OpenFlags::EXCL))
            .create_new(flags.contains(OpenFlags::CREATE | OpenFlags::EXCL))
            .truncate(flags.contains(OpenFlags::TRUNCATE))
            .mode(self.masked(perm))
            .open(self.host_path(path))
            .map_err(|e| FsError::from_io(OP, path, &e))?;

        let handle = HandleId::new(self.next_handle.fetch_add(1, Ordering::SeqCst));
        self.handles.lock().insert(
            handle,
            HostHandle {
                file,
                flags,
                path: path.to_string(),
            },
        );
        debug!(path = %path, %handle, ?flags, "opened host file");
        Ok(handle)
    }

    fn read(&self, handle: HandleId, buf: &mut [u8]) -> FsResult<usize> {
        self.with_handle("read", handle, |h| {
            if !h.flags.contains(OpenFlags::READ) {
                return Err(bad_fd("read", &h.path));
            }
            h.file.read(buf).map_err(|e| FsError::from_io("read", h.path.as_str(), &e))
        })
    }

    fn read_at(&self, handle: HandleId, buf: &mut [u8], offset: i64) -> FsResult<usize> {
        self.with_handle("read", handle, |h| {
            if !h.flags.contains(OpenFlags::READ) {
                return Err(bad_fd("read", &h.path));
            }
            let offset = offset_of("read", &h.path, offset)?;
            h.file
                .read_at(buf, offset)
                .map_err(|e| FsError::from_io("read", h.path.as_str(), &e))
        })
    }

    fn write(&self, handle: HandleId, data: &[u8]) -> FsResult<usize> {
        self.with_handle("write", handle, |h| {
            if !h.flags.is_write() {
                return Err(bad_fd("write", &h.path));
            }
            h.file
                .write_all(data)
                .map(|()| data.len())
                .map_err(|e| FsError::from_io("write", h.path.as_str(), &e))
        })
    }

    fn write_at(&self, handle: HandleId, data: &[u8], offset: i64) -> FsResult<usize> {
        self.with_handle("write", handle, |h| {
            if !h.flags.is_write() {
                return Err(bad_fd("write", &h.path));
            }
            if h.flags.contains(OpenFlags::APPEND) {
                return Err(FsError::path("write", h.path.as_str(), ErrorKind::InvalidArgument, OsType::Linux));
            }
            let offset = offset_of("write", &h.path, offset)?;
            h.file
                .write_all_at(data, offset)
                .map(|()| data.len())
                .map_err(|e| FsError::from_io("write", h.path.as_str(), &e))
        })
    }

    fn seek(&self, handle: HandleId, pos: SeekFrom) -> FsResult<u64> {
        self.with_handle("seek", handle, |h| {
            let pos = match pos {
                SeekFrom::Start(n) => io::SeekFrom::Start(offset_of("seek", &h.path, n)?),
                SeekFrom::Current(n) => io::SeekFrom::Current(n),
                SeekFrom::End(n) => io::SeekFrom::End(n),
            };
            h.file.seek(pos).map_err(|e| {
                let kind = match e.kind() {
                    io::ErrorKind::InvalidInput => ErrorKind::NegativeOffset,
                    _ => ErrorKind::from_io(&e),
                };
                FsError::path("seek", h.path.as_str(), kind, OsType::Linux)
            })
        })
    }

    fn truncate(&self, handle: HandleId, size: i64) -> FsResult<()> {
        self.with_handle("truncate", handle, |h| {
            if !h.flags.is_write() {
                return Err(bad_fd("truncate", &h.path));
            }
            let len = u64::try_from(size)
                .map_err(|_| FsError::path("truncate", h.path.as_str(), ErrorKind::InvalidArgument, OsType::Linux))?;
            h.file
                .set_len(len)
                .map_err(|e| FsError::from_io("truncate", h.path.as_str(), &e))
        })
    }

    fn close(&self, handle: HandleId) -> FsResult<()> {
        let entry = self
            .handles
            .lock()
            .remove(&handle)
            .ok_or_else(|| bad_fd("close", &handle.to_string()))?;
        debug!(path = %entry.path, %handle, "closed host file");
        Ok(())
    }

    fn handle_stat(&self, handle: HandleId) -> FsResult<FileInfo> {
        self.with_handle("stat", handle, |h| {
            let meta = h.file.metadata().map_err(|e| FsError::from_io("stat", h.path.as_str(), &e))?;
            Ok(info_from(OsType::Linux.base(&h.path), &meta))
        })
    }

    fn mkdir(&self, path: &str, perm: u32) -> FsResult<()> {
        DirBuilder::new()
            .mode(self.masked(perm))
            .create(self.host_path(path))
            .map_err(|e| FsError::from_io("mkdir", path, &e))
    }

    fn mkdir_all(&self, path: &str, perm: u32) -> FsResult<()> {
        DirBuilder::new()
            .recursive(true)
            .mode(self.masked(perm))
            .create(self.host_path(path))
            .map_err(|e| FsError::from_io("mkdir", path, &e))
    }

    fn remove(&self, path: &str) -> FsResult<()> {
        let target = self.host_path(path);
        let meta = fs::symlink_metadata(&target).map_err(|e| FsError::from_io("remove", path, &e))?;
        let removed = if meta.is_dir() {
            fs::remove_dir(&target)
        } else {
            fs::remove_file(&target)
        };
        removed.map_err(|e| FsError::from_io("remove", path, &e))
    }

    fn remove_all(&self, path: &str) -> FsResult<()> {
        let target = self.host_path(path);
        let meta = match fs::symlink_metadata(&target) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(FsError::from_io("removeall", path, &e)),
        };
        let removed = if meta.is_dir() {
            fs::remove_dir_all(&target)
        } else {
            fs::remove_file(&target)
        };
        removed.map_err(|e| FsError::from_io("removeall", path, &e))
    }

    fn unlink(&self, path: &str) -> FsResult<()> {
        fs::remove_file(self.host_path(path)).map_err(|e| FsError::from_io("unlink", path, &e))
    }

    fn rmdir(&self, path: &str) -> FsResult<()> {
        fs::remove_dir(self.host_path(path)).map_err(|e| FsError::from_io("rmdir", path, &e))
    }

    fn rename(&self, old: &str, new: &str) -> FsResult<()> {
        fs::rename(self.host_path(old), self.host_path(new))
            .map_err(|e| FsError::link("rename", old, new, ErrorKind::from_io(&e), OsType::Linux))
    }

    fn symlink(&self, target: &str, link: &str) -> FsResult<()> {
        std::os::unix::fs::symlink(target, self.host_path(link))
            .map_err(|e| FsError::link("symlink", target, link, ErrorKind::from_io(&e), OsType::Linux))
    }

    fn read_link(&self, path: &str) -> FsResult<String> {
        fs::read_link(self.host_path(path))
            .map(|p| p.to_string_lossy().into_owned())
            .map_err(|e| FsError::from_io("readlink", path, &e))
    }

    fn link(&self, old: &str, new: &str) -> FsResult<()> {
        fs::hard_link(self.host_path(old), self.host_path(new))
            .map_err(|e| FsError::link("link", old, new, ErrorKind::from_io(&e), OsType::Linux))
    }

    fn stat(&self, path: &str) -> FsResult<FileInfo> {
        let meta = fs::metadata(self.host_path(path)).map_err(|e| FsError::from_io("stat", path, &e))?;
        Ok(info_from(OsType::Linux.base(path), &meta))
    }

    fn lstat(&self, path: &str) -> FsResult<FileInfo> {
        let meta = fs::symlink_metadata(self.host_path(path)).map_err(|e| FsError::from_io("lstat", path, &e))?;
        Ok(info_from(OsType::Linux.base(path), &meta))
    }

    fn read_dir(&self, path: &str) -> FsResult<Vec<DirEntry>> {
        const OP: &str = "open";
        let mut entries = Vec::new();
        for entry in fs::read_dir(self.host_path(path)).map_err(|e| FsError::from_io(OP, path, &e))? {
            let entry = entry.map_err(|e| FsError::from_io(OP, path, &e))?;
            let file_type = entry.file_type().map_err(|e| FsError::from_io(OP, path, &e))?;
            let meta = entry.metadata().map_err(|e| FsError::from_io(OP, path, &e))?;
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                file_type: file_type_of(file_type),
                ino: meta.ino(),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn chmod(&self, path: &str, mode: u32) -> FsResult<()> {
        fs::set_permissions(self.host_path(path), fs::Permissions::from_mode(mode & FileMode::MODE_MASK))
            .map_err(|e| FsError::from_io("chmod", path, &e))
    }

    fn chown(&self, path: &str, uid: u32, gid: u32) -> FsResult<()> {
        std::os::unix::fs::chown(self.host_path(path), Some(uid), Some(gid))
            .map_err(|e| FsError::from_io("chown", path, &e))
    }

    fn lchown(&self, path: &str, uid: u32, gid: u32) -> FsResult<()> {
        std::os::unix::fs::lchown(self.host_path(path), Some(uid), Some(gid))
            .map_err(|e| FsError::from_io("lchown", path, &e))
    }

    fn chtimes(&self, path: &str, atime: SystemTime, mtime: SystemTime) -> FsResult<()> {
        let file = File::open(self.host_path(path)).map_err(|e| FsError::from_io("chtimes", path, &e))?;
        let times = fs::FileTimes::new().set_accessed(atime).set_modified(mtime);
        file.set_times(times).map_err(|e| FsError::from_io("chtimes", path, &e))
    }

    fn truncate_path(&self, path: &str, size: i64) -> FsResult<()> {
        const OP: &str = "truncate";
        let len = u64::try_from(size).map_err(|_| FsError::path(OP, path, ErrorKind::InvalidArgument, OsType::Linux))?;
        let file = OpenOptions::new()
            .write(true)
            .open(self.host_path(path))
            .map_err(|e| FsError::from_io(OP, path, &e))?;
        file.set_len(len).map_err(|e| FsError::from_io(OP, path, &e))
    }
}
