// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! In-memory filesystem engine
//!
//! A [`MemFs`] is a *view* onto a shared node store: the store, the handle
//! table, the umask and the feature set are shared by every view derived with
//! [`MemFs::with_user`], while the current user, working directory and chroot
//! root belong to the view.
//!
//! Every operation checks capabilities first, then takes the tree lock once and
//! performs resolution, permission checks and mutation under it. The handle
//! table is always locked after the tree.

mod handle;
pub(crate) mod node;
pub(crate) mod perm;
pub(crate) mod resolve;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::FsConfig;
use crate::error::{ErrorKind, FsError, FsResult};
use crate::features::Features;
use crate::identity::{IdentityMgr, MemIdm, NoIdm, User};
use crate::os::OsType;
use crate::types::{DirEntry, FileInfo, FileMode, HandleId, OpenFlags};

use handle::OpenFile;
use node::{NodeId, NodeKind, NodeStore};
use perm::{Caller, READ, WRITE};
use resolve::{Resolved, Walk};

/// State shared by all views of one filesystem.
struct Shared {
    os: OsType,
    features: Features,
    idm: Arc<dyn IdentityMgr>,
    admin_uid: u32,
    tree: RwLock<NodeStore>,
    handles: Mutex<HashMap<HandleId, OpenFile>>,
    next_handle: AtomicU64,
    umask: AtomicU32,
}

/// Per-view state.
#[derive(Clone, Debug)]
struct View {
    user: User,
    root: NodeId,
    /// Working directory segments below `root`, lexically clean.
    cwd: Vec<String>,
}

/// In-memory filesystem view.
pub struct MemFs {
    shared: Arc<Shared>,
    view: RwLock<View>,
}

impl std::fmt::Debug for MemFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let view = self.view.read();
        f.debug_struct("MemFs")
            .field("os", &self.shared.os)
            .field("features", &self.shared.features)
            .field("user", &view.user.name())
            .field("cwd", &view.cwd)
            .finish()
    }
}

/// Standard directories created when [`Features::MAIN_DIRS`] is set.
fn main_dirs(os: OsType) -> &'static [(&'static str, u32)] {
    match os {
        OsType::Linux => &[("/home", 0o755), ("/root", 0o700), ("/tmp", 0o1777)],
        OsType::Windows => &[("C:\\Users", 0o755), ("C:\\Windows\\Temp", 0o777)],
    }
}

fn create_main_dirs(store: &mut NodeStore, os: OsType, uid: u32, gid: u32) -> FsResult<()> {
    for &(path, mode) in main_dirs(os) {
        let parts = os.parts(path);
        let last = parts.segments.len().saturating_sub(1);
        let mut current = store.root();
        for (i, segment) in parts.segments.iter().enumerate() {
            let existing = store
                .lookup(current, segment)
                .map_err(|k| FsError::path("mkdir", path, k, os))?;
            current = match existing {
                Some(id) => id,
                None => {
                    let dir_mode = if i == last { mode } else { 0o755 };
                    store
                        .mkdir(current, segment, dir_mode, uid, gid)
                        .map_err(|k| FsError::path("mkdir", path, k, os))?
                }
            };
        }
    }
    Ok(())
}

impl MemFs {
    /// Creates a filesystem with an identity manager matching its features:
    /// [`MemIdm`] with [`Features::IDENTITY_MGR`], [`NoIdm`] otherwise.
    pub fn new(config: FsConfig) -> FsResult<Self> {
        let idm: Arc<dyn IdentityMgr> = if config.features.contains(Features::IDENTITY_MGR) {
            Arc::new(MemIdm::new(config.os_type))
        } else {
            Arc::new(NoIdm::new(config.os_type))
        };
        Self::with_identity_mgr(config, idm)
    }

    pub fn with_identity_mgr(config: FsConfig, idm: Arc<dyn IdentityMgr>) -> FsResult<Self> {
        let os = config.os_type;
        let mut features = config.features;
        if features.contains(Features::REAL_FS) {
            warn!("in-memory filesystem cannot honour {}, ignoring it", Features::REAL_FS);
            features.remove(Features::REAL_FS);
        }

        let admin = idm.admin_user();
        let admin_gid = idm.admin_group().gid();
        let user = match &config.initial_user {
            Some(name) => idm.lookup_user(name)?,
            None => idm.current_user(),
        };

        let mut store = NodeStore::new(os, 0o755, admin.uid(), admin_gid);
        if features.contains(Features::MAIN_DIRS) {
            create_main_dirs(&mut store, os, admin.uid(), admin_gid)?;
        }
        let root = store.root();

        info!(%os, %features, user = user.name(), umask = %format!("{:o}", config.umask), "created in-memory filesystem");

        Ok(Self {
            shared: Arc::new(Shared {
                os,
                features,
                idm,
                admin_uid: admin.uid(),
                tree: RwLock::new(store),
                handles: Mutex::new(HashMap::new()),
                next_handle: AtomicU64::new(1),
                umask: AtomicU32::new(config.umask & FileMode::PERM_MASK),
            }),
            view: RwLock::new(View {
                user,
                root,
                cwd: Vec::new(),
            }),
        })
    }

    pub fn os_type(&self) -> OsType {
        self.shared.os
    }

    pub fn features(&self) -> Features {
        self.shared.features
    }

    pub fn has_feature(&self, feature: Features) -> bool {
        self.shared.features.contains(feature)
    }

    pub fn idm(&self) -> Arc<dyn IdentityMgr> {
        Arc::clone(&self.shared.idm)
    }

    /// Current user of this view.
    pub fn user(&self) -> User {
        self.view.read().user.clone()
    }

    // ---- views --------------------------------------------------------------

    /// A new view sharing this filesystem, running as `name`, with this view's
    /// root and a working directory at that root.
    pub fn with_user(&self, name: &str) -> FsResult<MemFs> {
        self.require(Features::IDENTITY_MGR, "setuser", name)?;
        let user = self.shared.idm.lookup_user(name)?;
        let root = self.view.read().root;
        debug!(user = name, "derived filesystem view");
        Ok(MemFs {
            shared: Arc::clone(&self.shared),
            view: RwLock::new(View {
                user,
                root,
                cwd: Vec::new(),
            }),
        })
    }

    /// Switches the current user of this view.
    pub fn set_user(&self, name: &str) -> FsResult<User> {
        self.require(Features::IDENTITY_MGR, "setuser", name)?;
        let user = self.shared.idm.lookup_user(name)?;
        self.view.write().user = user.clone();
        debug!(user = name, uid = user.uid(), "switched user");
        Ok(user)
    }

    pub fn getwd(&self) -> FsResult<String> {
        let view = self.view.read();
        Ok(self.display_path(&view.cwd))
    }

    /// Changes the working directory of this view. The stored directory is the
    /// one actually reached, so symlinks in `path` do not survive into `getwd`.
    pub fn chdir(&self, path: &str) -> FsResult<()> {
        const OP: &str = "chdir";
        let view = self.snapshot();
        let cwd = {
            let tree = self.shared.tree.read();
            let caller = self.caller(&view.user);
            let id = self
                .walk(&tree, &caller, &view)
                .resolve(path, true)
                .and_then(Resolved::found)
                .map_err(|k| self.err(OP, path, k))?;
            let node = tree.get(id).map_err(|k| self.err(OP, path, k))?;
            if !node.is_dir() {
                return Err(self.err(OP, path, ErrorKind::NotADirectory));
            }
            caller.check(node, perm::EXEC).map_err(|k| self.err(OP, path, k))?;
            tree.segments_below(view.root, id).map_err(|k| self.err(OP, path, k))?
        };

        self.view.write().cwd = cwd;
        Ok(())
    }

    /// Confines this view below `path`. Only the administrator may do this.
    pub fn chroot(&self, path: &str) -> FsResult<()> {
        const OP: &str = "chroot";
        self.require(Features::CHROOT, OP, path)?;
        let view = self.snapshot();
        let caller = self.caller(&view.user);
        if !caller.is_admin() {
            return Err(self.err(OP, path, ErrorKind::OperationNotPermitted));
        }

        let root = {
            let tree = self.shared.tree.read();
            let id = self
                .walk(&tree, &caller, &view)
                .resolve(path, true)
                .and_then(Resolved::found)
                .map_err(|k| self.err(OP, path, k))?;
            if !tree.get(id).map_err(|k| self.err(OP, path, k))?.is_dir() {
                return Err(self.err(OP, path, ErrorKind::NotADirectory));
            }
            id
        };

        let mut state = self.view.write();
        state.root = root;
        state.cwd.clear();
        debug!(path, root = root.0, "changed root");
        Ok(())
    }

    // ---- umask --------------------------------------------------------------

    pub fn umask(&self) -> u32 {
        self.shared.umask.load(Ordering::SeqCst)
    }

    /// Replaces the umask, returning the previous one.
    pub fn set_umask(&self, mask: u32) -> u32 {
        self.shared.umask.swap(mask & FileMode::PERM_MASK, Ordering::SeqCst)
    }

    // ---- main directories ---------------------------------------------------

    pub fn tmp_dir(&self) -> String {
        match self.shared.os {
            OsType::Linux => "/tmp".to_string(),
            OsType::Windows => "C:\\Windows\\Temp".to_string(),
        }
    }

    pub fn home_dir_user(&self, name: &str) -> String {
        match self.shared.os {
            OsType::Linux if name == self.shared.idm.admin_user().name() => "/root".to_string(),
            OsType::Linux => format!("/home/{name}"),
            OsType::Windows => format!("C:\\Users\\{name}"),
        }
    }

    /// Creates the home directory of `user` with mode 0700, owned by the user.
    pub fn create_home_dir(&self, user: &User) -> FsResult<String> {
        const OP: &str = "mkdir";
        let path = self.home_dir_user(user.name());
        self.require(Features::IDENTITY_MGR, OP, &path)?;
        self.ensure_writable(OP, &path)?;
        let view = self.snapshot();
        if !self.caller(&view.user).is_admin() {
            return Err(self.err(OP, &path, ErrorKind::OperationNotPermitted));
        }

        let mut tree = self.shared.tree.write();
        let id = self
            .mkdir_locked(&mut tree, &view, &path, 0o700)
            .map_err(|k| self.err(OP, &path, k))?;
        let node = tree.get_mut(id).map_err(|k| self.err(OP, &path, k))?;
        node.mode = 0o700;
        node.uid = user.uid();
        node.gid = user.gid();
        debug!(path = %path, uid = user.uid(), "created home directory");
        Ok(path)
    }

    // ---- tree operations ----------------------------------------------------

    pub fn mkdir(&self, path: &str, perm: u32) -> FsResult<()> {
        const OP: &str = "mkdir";
        self.ensure_writable(OP, path)?;
        let view = self.snapshot();
        let mut tree = self.shared.tree.write();
        self.mkdir_locked(&mut tree, &view, path, perm)
            .map(|_| ())
            .map_err(|k| self.err(OP, path, k))
    }

    /// Creates `path` and any missing parents; succeeds if it already is a directory.
    pub fn mkdir_all(&self, path: &str, perm: u32) -> FsResult<()> {
        const OP: &str = "mkdir";
        self.ensure_writable(OP, path)?;
        let view = self.snapshot();
        let mut tree = self.shared.tree.write();
        self.mkdir_all_locked(&mut tree, &view, path, perm)
            .map_err(|k| self.err(OP, path, k))
    }

    /// Removes a file, a symlink or an empty directory.
    pub fn remove(&self, path: &str) -> FsResult<()> {
        const OP: &str = "remove";
        self.ensure_writable(OP, path)?;
        let view = self.snapshot();
        let mut tree = self.shared.tree.write();
        self.remove_entry_locked(&mut tree, &view, path, |is_dir| {
            if is_dir {
                Ok(EntryKind::Directory)
            } else {
                Ok(EntryKind::Other)
            }
        })
        .map_err(|k| self.err(OP, path, k))
    }

    /// Removes a non-directory entry.
    pub fn unlink(&self, path: &str) -> FsResult<()> {
        const OP: &str = "unlink";
        self.ensure_writable(OP, path)?;
        let view = self.snapshot();
        let mut tree = self.shared.tree.write();
        self.remove_entry_locked(&mut tree, &view, path, |is_dir| {
            if is_dir {
                Err(ErrorKind::IsADirectory)
            } else {
                Ok(EntryKind::Other)
            }
        })
        .map_err(|k| self.err(OP, path, k))
    }

    /// Removes an empty directory.
    pub fn rmdir(&self, path: &str) -> FsResult<()> {
        const OP: &str = "rmdir";
        self.ensure_writable(OP, path)?;
        let view = self.snapshot();
        let mut tree = self.shared.tree.write();
        self.remove_entry_locked(&mut tree, &view, path, |is_dir| {
            if is_dir {
                Ok(EntryKind::Directory)
            } else {
                Err(ErrorKind::NotADirectory)
            }
        })
        .map_err(|k| self.err(OP, path, k))
    }

    /// Removes `path` and everything below it. A missing path is not an error.
    /// Every removal is validated before the first one happens.
    pub fn remove_all(&self, path: &str) -> FsResult<()> {
        const OP: &str = "removeall";
        self.ensure_writable(OP, path)?;
        let view = self.snapshot();
        let mut tree = self.shared.tree.write();
        let caller = self.caller(&view.user);

        let resolved = self
            .walk(&tree, &caller, &view)
            .resolve(path, false)
            .map_err(|k| self.err(OP, path, k))?;
        let (id, parent, name) = match resolved {
            Resolved::Missing { .. } => return Ok(()),
            found => found.found_entry().map_err(|k| self.err(OP, path, k))?,
        };

        let mut plan = Vec::new();
        self.plan_removal(&tree, &caller, parent, id, name, &mut plan)
            .map_err(|k| self.err(OP, path, k))?;
        for (parent, name, is_dir) in plan {
            let removed = if is_dir {
                tree.rmdir(parent, &name)
            } else {
                tree.unlink(parent, &name)
            };
            removed.map_err(|k| self.err(OP, path, k))?;
        }
        Ok(())
    }

    pub fn rename(&self, old: &str, new: &str) -> FsResult<()> {
        self.rename_to(old, self, new)
    }

    /// Renames `old` (resolved in this view) to `new` (resolved in `target`).
    /// Views must share both the node store and the root.
    pub fn rename_to(&self, old: &str, target: &MemFs, new: &str) -> FsResult<()> {
        const OP: &str = "rename";
        if self.shared.features.contains(Features::READ_ONLY) {
            return Err(self.link_err(OP, old, new, ErrorKind::OperationNotPermitted));
        }
        let src_view = self.snapshot();
        let dst_view = target.snapshot();
        if !Arc::ptr_eq(&self.shared, &target.shared) || src_view.root != dst_view.root {
            return Err(self.link_err(OP, old, new, ErrorKind::InvalidArgument));
        }

        let mut tree = self.shared.tree.write();
        self.rename_locked(&mut tree, &src_view, old, &dst_view, new)
            .map_err(|k| self.link_err(OP, old, new, k))
    }

    pub fn symlink(&self, target: &str, link: &str) -> FsResult<()> {
        const OP: &str = "symlink";
        if !self.has_feature(Features::SYMLINK) {
            return Err(self.link_err(OP, target, link, ErrorKind::UnsupportedFeature));
        }
        if self.has_feature(Features::READ_ONLY) {
            return Err(self.link_err(OP, target, link, ErrorKind::OperationNotPermitted));
        }
        let view = self.snapshot();
        let mut tree = self.shared.tree.write();
        let caller = self.caller(&view.user);
        let result = (|| {
            let (parent, name) = self.walk(&tree, &caller, &view).resolve(link, false)?.missing()?;
            self.check_name(&name)?;
            caller.check_dir_write(tree.get(parent)?)?;
            tree.symlink(target, parent, &name, caller.uid(), caller.gid())
        })();
        result.map(|_| ()).map_err(|k| self.link_err(OP, target, link, k))
    }

    pub fn read_link(&self, path: &str) -> FsResult<String> {
        const OP: &str = "readlink";
        self.require(Features::SYMLINK, OP, path)?;
        let view = self.snapshot();
        let tree = self.shared.tree.read();
        let caller = self.caller(&view.user);
        let id = self
            .walk(&tree, &caller, &view)
            .resolve(path, false)
            .and_then(Resolved::found)
            .map_err(|k| self.err(OP, path, k))?;
        match &tree.get(id).map_err(|k| self.err(OP, path, k))?.kind {
            NodeKind::Symlink { target } => Ok(target.clone()),
            _ => Err(self.err(OP, path, ErrorKind::InvalidArgument)),
        }
    }

    /// Adds a hard link `new` to the regular file or symlink `old`.
    pub fn link(&self, old: &str, new: &str) -> FsResult<()> {
        const OP: &str = "link";
        if !self.has_feature(Features::HARDLINK) {
            return Err(self.link_err(OP, old, new, ErrorKind::UnsupportedFeature));
        }
        if self.has_feature(Features::READ_ONLY) {
            return Err(self.link_err(OP, old, new, ErrorKind::OperationNotPermitted));
        }
        let view = self.snapshot();
        let mut tree = self.shared.tree.write();
        let caller = self.caller(&view.user);
        let result = (|| {
            let walk = self.walk(&tree, &caller, &view);
            let existing = walk.resolve(old, false)?.found()?;
            let (parent, name) = walk.resolve(new, false)?.missing()?;
            self.check_name(&name)?;
            caller.check_dir_write(tree.get(parent)?)?;
            tree.hardlink(existing, parent, &name)
        })();
        result.map_err(|k| self.link_err(OP, old, new, k))
    }

    pub fn stat(&self, path: &str) -> FsResult<FileInfo> {
        self.stat_impl("stat", path, true)
    }

    /// Like [`MemFs::stat`] but describes a final symlink itself.
    pub fn lstat(&self, path: &str) -> FsResult<FileInfo> {
        self.stat_impl("lstat", path, false)
    }

    fn stat_impl(&self, op: &'static str, path: &str, follow: bool) -> FsResult<FileInfo> {
        let view = self.snapshot();
        let tree = self.shared.tree.read();
        let caller = self.caller(&view.user);
        let id = self
            .walk(&tree, &caller, &view)
            .resolve(path, follow)
            .and_then(Resolved::found)
            .map_err(|k| self.err(op, path, k))?;
        let node = tree.get(id).map_err(|k| self.err(op, path, k))?;
        Ok(node.info(id, self.shared.os.base(path)))
    }

    /// Entries of a directory, sorted by name.
    pub fn read_dir(&self, path: &str) -> FsResult<Vec<DirEntry>> {
        const OP: &str = "open";
        let view = self.snapshot();
        let tree = self.shared.tree.read();
        let caller = self.caller(&view.user);
        let result = (|| {
            let id = self.walk(&tree, &caller, &view).resolve(path, true)?.found()?;
            let node = tree.get(id)?;
            if !node.is_dir() {
                return Err(ErrorKind::NotADirectory);
            }
            caller.check(node, READ)?;
            tree.readdir(id)
        })();
        result.map_err(|k| self.err(OP, path, k))
    }

    pub fn chmod(&self, path: &str, mode: u32) -> FsResult<()> {
        const OP: &str = "chmod";
        self.ensure_writable(OP, path)?;
        self.update_node(OP, path, true, |caller, node| {
            caller.check_owner(node)?;
            node.mode = mode & FileMode::MODE_MASK;
            node.touch_ctime();
            Ok(())
        })
    }

    pub fn chown(&self, path: &str, uid: u32, gid: u32) -> FsResult<()> {
        self.chown_impl("chown", path, uid, gid, true)
    }

    /// Like [`MemFs::chown`] but changes a final symlink itself.
    pub fn lchown(&self, path: &str, uid: u32, gid: u32) -> FsResult<()> {
        self.chown_impl("lchown", path, uid, gid, false)
    }

    fn chown_impl(&self, op: &'static str, path: &str, uid: u32, gid: u32, follow: bool) -> FsResult<()> {
        self.require(Features::IDENTITY_MGR, op, path)?;
        self.ensure_writable(op, path)?;
        self.update_node(op, path, follow, |caller, node| {
            caller.check_chown(node, uid, gid)?;
            node.uid = uid;
            node.gid = gid;
            node.touch_ctime();
            Ok(())
        })
    }

    pub fn chtimes(&self, path: &str, atime: SystemTime, mtime: SystemTime) -> FsResult<()> {
        const OP: &str = "chtimes";
        self.ensure_writable(OP, path)?;
        self.update_node(OP, path, true, |caller, node| {
            caller.check_owner(node)?;
            node.times.atime = atime;
            node.times.mtime = mtime;
            node.touch_ctime();
            Ok(())
        })
    }

    /// Resizes the file at `path`, zero-extending it when growing.
    pub fn truncate_path(&self, path: &str, size: i64) -> FsResult<()> {
        const OP: &str = "truncate";
        self.ensure_writable(OP, path)?;
        let len = usize::try_from(size).map_err(|_| self.err(OP, path, ErrorKind::InvalidArgument))?;
        self.update_node(OP, path, true, |caller, node| {
            if node.is_dir() {
                return Err(ErrorKind::IsADirectory);
            }
            caller.check(node, WRITE)?;
            node.set_len(len)
        })
    }

    pub fn read_file(&self, path: &str) -> FsResult<Vec<u8>> {
        const OP: &str = "open";
        let view = self.snapshot();
        let tree = self.shared.tree.read();
        let caller = self.caller(&view.user);
        let result = (|| {
            let id = self.walk(&tree, &caller, &view).resolve(path, true)?.found()?;
            let node = tree.get(id)?;
            caller.check(node, READ)?;
            match &node.kind {
                NodeKind::File { data } => Ok(data.clone()),
                NodeKind::Directory { .. } => Err(ErrorKind::IsADirectory),
                NodeKind::Symlink { .. } => Err(ErrorKind::InvalidArgument),
            }
        })();
        result.map_err(|k| self.err(OP, path, k))
    }

    /// Replaces the content of `path`, creating it with `perm` (minus umask) if absent.
    pub fn write_file(&self, path: &str, data: &[u8], perm: u32) -> FsResult<()> {
        const OP: &str = "open";
        self.ensure_writable(OP, path)?;
        let view = self.snapshot();
        let mut tree = self.shared.tree.write();
        let result = (|| {
            let flags = OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE;
            let id = self.open_node(&mut tree, &view, path, flags, perm)?;
            let node = tree.get_mut(id)?;
            if let NodeKind::File { data: content } = &mut node.kind {
                content.extend_from_slice(data);
            }
            node.touch();
            Ok(())
        })();
        result.map_err(|k| self.err(OP, path, k))
    }

    /// Whether two stat results describe the same node.
    pub fn same_file(&self, a: &FileInfo, b: &FileInfo) -> bool {
        a.ino() == b.ino()
    }

    // ---- internals ----------------------------------------------------------

    fn snapshot(&self) -> View {
        self.view.read().clone()
    }

    fn caller<'a>(&'a self, user: &'a User) -> Caller<'a> {
        Caller {
            user,
            admin_uid: self.shared.admin_uid,
            features: self.shared.features,
            idm: self.shared.idm.as_ref(),
        }
    }

    fn walk<'a>(&self, store: &'a NodeStore, caller: &'a Caller<'a>, view: &'a View) -> Walk<'a> {
        Walk {
            store,
            caller,
            os: self.shared.os,
            root: view.root,
            cwd: &view.cwd,
        }
    }

    fn err(&self, op: &'static str, path: &str, kind: ErrorKind) -> FsError {
        FsError::path(op, path, kind, self.shared.os)
    }

    fn link_err(&self, op: &'static str, old: &str, new: &str, kind: ErrorKind) -> FsError {
        FsError::link(op, old, new, kind, self.shared.os)
    }

    fn require(&self, feature: Features, op: &'static str, path: &str) -> FsResult<()> {
        if self.shared.features.contains(feature) {
            Ok(())
        } else {
            Err(self.err(op, path, ErrorKind::UnsupportedFeature))
        }
    }

    fn ensure_writable(&self, op: &'static str, path: &str) -> FsResult<()> {
        if self.shared.features.contains(Features::READ_ONLY) {
            Err(self.err(op, path, ErrorKind::OperationNotPermitted))
        } else {
            Ok(())
        }
    }

    fn check_name(&self, name: &str) -> Result<(), ErrorKind> {
        if self.shared.os.valid_name(name) {
            Ok(())
        } else {
            Err(ErrorKind::InvalidArgument)
        }
    }

    /// Mode stored for a new node: `perm &^ umask`.
    fn creation_mode(&self, perm: u32) -> u32 {
        perm & FileMode::MODE_MASK & !self.umask()
    }

    fn display_path(&self, segments: &[String]) -> String {
        let os = self.shared.os;
        format!("{}{}", os.root(), segments.join(&os.separator().to_string()))
    }

    fn mkdir_locked(&self, tree: &mut NodeStore, view: &View, path: &str, perm: u32) -> Result<NodeId, ErrorKind> {
        let caller = self.caller(&view.user);
        let (parent, name) = self.walk(tree, &caller, view).resolve(path, false)?.missing()?;
        self.check_name(&name)?;
        caller.check_dir_write(tree.get(parent)?)?;
        tree.mkdir(parent, &name, self.creation_mode(perm), caller.uid(), caller.gid())
    }

    fn mkdir_all_locked(&self, tree: &mut NodeStore, view: &View, path: &str, perm: u32) -> Result<(), ErrorKind> {
        let os = self.shared.os;
        let caller = self.caller(&view.user);
        let parts = os.parts(path);
        let mut prefix = parts.volume.to_string();
        if parts.absolute {
            prefix.push(os.separator());
        }
        if parts.segments.is_empty() {
            return match self.walk(tree, &caller, view).resolve(&prefix, true)? {
                Resolved::Found { .. } => Ok(()),
                Resolved::Missing { .. } => Err(ErrorKind::NoSuchFileOrDir),
            };
        }

        for segment in parts.segments {
            if !prefix.is_empty() && !prefix.ends_with(|c| os.is_separator(c)) {
                prefix.push(os.separator());
            }
            prefix.push_str(segment);
            let resolved = self.walk(tree, &caller, view).resolve(&prefix, true)?;
            match resolved {
                Resolved::Found { id, .. } => {
                    if !tree.get(id)?.is_dir() {
                        return Err(ErrorKind::NotADirectory);
                    }
                }
                Resolved::Missing { parent, name } => {
                    self.check_name(&name)?;
                    caller.check_dir_write(tree.get(parent)?)?;
                    tree.mkdir(parent, &name, self.creation_mode(perm), caller.uid(), caller.gid())?;
                }
            }
        }
        Ok(())
    }

    fn remove_entry_locked(
        &self,
        tree: &mut NodeStore,
        view: &View,
        path: &str,
        classify: impl Fn(bool) -> Result<EntryKind, ErrorKind>,
    ) -> Result<(), ErrorKind> {
        let caller = self.caller(&view.user);
        let (id, parent, name) = self.walk(tree, &caller, view).resolve(path, false)?.found_entry()?;
        let node = tree.get(id)?;
        let kind = classify(node.is_dir())?;
        caller.check_remove(tree.get(parent)?, node)?;
        match kind {
            EntryKind::Directory => tree.rmdir(parent, &name)?,
            EntryKind::Other => tree.unlink(parent, &name)?,
        };
        Ok(())
    }

    /// Post-order list of removals for `remove_all`, checking permissions on the way.
    fn plan_removal(
        &self,
        tree: &NodeStore,
        caller: &Caller<'_>,
        parent: NodeId,
        id: NodeId,
        name: String,
        plan: &mut Vec<(NodeId, String, bool)>,
    ) -> Result<(), ErrorKind> {
        let node = tree.get(id)?;
        caller.check_remove(tree.get(parent)?, node)?;
        let is_dir = node.is_dir();
        if is_dir {
            for entry in tree.readdir(id)? {
                self.plan_removal(tree, caller, id, NodeId(entry.ino), entry.name, plan)?;
            }
        }
        plan.push((parent, name, is_dir));
        Ok(())
    }

    fn rename_locked(
        &self,
        tree: &mut NodeStore,
        src_view: &View,
        old: &str,
        dst_view: &View,
        new: &str,
    ) -> Result<(), ErrorKind> {
        let src_caller = self.caller(&src_view.user);
        let (src, src_parent, src_name) = self
            .walk(tree, &src_caller, src_view)
            .resolve(old, false)?
            .found_entry()?;

        let dst_caller = self.caller(&dst_view.user);
        let resolved = self.walk(tree, &dst_caller, dst_view).resolve(new, false)?;
        let (dst_parent, dst_name) = match resolved {
            Resolved::Found {
                id,
                entry: Some((parent, name)),
            } => {
                if id != src {
                    src_caller.check_remove(tree.get(parent)?, tree.get(id)?)?;
                }
                (parent, name)
            }
            Resolved::Found { entry: None, .. } => return Err(ErrorKind::InvalidArgument),
            Resolved::Missing { parent, name } => (parent, name),
        };

        self.check_name(&dst_name)?;
        src_caller.check_remove(tree.get(src_parent)?, tree.get(src)?)?;
        src_caller.check_dir_write(tree.get(dst_parent)?)?;
        tree.rename(src_parent, &src_name, dst_parent, &dst_name)
    }

    /// Resolves `path` and applies `f` to its node under the write lock.
    fn update_node(
        &self,
        op: &'static str,
        path: &str,
        follow: bool,
        f: impl FnOnce(&Caller<'_>, &mut node::Node) -> Result<(), ErrorKind>,
    ) -> FsResult<()> {
        let view = self.snapshot();
        let mut tree = self.shared.tree.write();
        let caller = self.caller(&view.user);
        let result = (|| {
            let id = self.walk(&tree, &caller, &view).resolve(path, follow)?.found()?;
            f(&caller, tree.get_mut(id)?)
        })();
        result.map_err(|k| self.err(op, path, k))
    }

    /// Number of live nodes, including unlinked ones still held open.
    #[cfg(test)]
    pub(crate) fn node_count(&self) -> usize {
        self.shared.tree.read().len()
    }
}

enum EntryKind {
    Directory,
    Other,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_fs() -> MemFs {
        MemFs::new(FsConfig::default().with_features(Features::all() - Features::READ_ONLY - Features::REAL_FS))
            .expect("create filesystem")
    }

    fn user_fs(fs: &MemFs, name: &str) -> MemFs {
        let idm = fs.idm();
        if idm.lookup_group("users").is_err() {
            idm.add_group("users").expect("add group");
        }
        idm.add_user(name, "users").expect("add user");
        fs.with_user(name).expect("derive view")
    }

    #[test]
    fn test_main_dirs_created() {
        let fs = create_test_fs();
        let tmp = fs.stat("/tmp").expect("stat /tmp");
        assert_eq!(tmp.mode().to_string(), "drwxrwxrwt");
        assert_eq!(fs.stat("/root").expect("stat /root").mode().perm(), 0o700);
        assert_eq!(fs.tmp_dir(), "/tmp");
        assert_eq!(fs.home_dir_user("root"), "/root");
        assert_eq!(fs.home_dir_user("bob"), "/home/bob");
    }

    #[test]
    fn test_mkdir_applies_umask_and_owner() {
        let fs = create_test_fs();
        fs.mkdir("/d", 0o777).expect("mkdir");
        let info = fs.stat("/d").expect("stat");
        assert!(info.is_dir());
        assert_eq!(info.mode().perm(), 0o755);
        assert_eq!(info.sys().uid, 0);
        assert_eq!(info.sys().nlink, 1);

        let err = fs.mkdir("/d", 0o777).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        assert_eq!(err.to_string(), "mkdir /d: file exists");
    }

    #[test]
    fn test_mkdir_all_and_remove_all() {
        let fs = create_test_fs();
        fs.mkdir_all("/a/b/c", 0o755).expect("mkdir_all");
        fs.mkdir_all("/a/b/c", 0o755).expect("mkdir_all is idempotent");
        fs.write_file("/a/b/c/f", b"x", 0o644).expect("write");
        assert_eq!(
            fs.mkdir_all("/a/b/c/f/g", 0o755).unwrap_err().kind(),
            ErrorKind::NotADirectory
        );

        fs.remove_all("/a").expect("remove_all");
        assert_eq!(fs.stat("/a").unwrap_err().kind(), ErrorKind::NoSuchFileOrDir);
        fs.remove_all("/a").expect("remove_all of a missing path");
    }

    #[test]
    fn test_remove_all_is_all_or_nothing() {
        let fs = create_test_fs();
        let alice = user_fs(&fs, "alice");
        let bob = user_fs(&fs, "bob");
        alice.mkdir("/tmp/shared", 0o777).expect("mkdir");
        alice.chmod("/tmp/shared", 0o777).expect("chmod");
        alice.write_file("/tmp/shared/a", b"a", 0o644).expect("alice write");
        bob.mkdir("/tmp/shared/sub", 0o755).expect("bob mkdir");
        bob.write_file("/tmp/shared/sub/x", b"x", 0o644).expect("bob write");

        let err = alice.remove_all("/tmp/shared").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        assert_eq!(fs.read_dir("/tmp/shared").expect("read_dir").len(), 2);
        assert_eq!(fs.read_file("/tmp/shared/a").expect("untouched"), b"a");
    }

    #[test]
    fn test_unlink_and_rmdir_type_checks() {
        let fs = create_test_fs();
        fs.mkdir("/d", 0o755).expect("mkdir");
        fs.write_file("/f", b"", 0o644).expect("write");

        assert_eq!(fs.unlink("/d").unwrap_err().kind(), ErrorKind::IsADirectory);
        assert_eq!(fs.rmdir("/f").unwrap_err().kind(), ErrorKind::NotADirectory);
        assert_eq!(fs.remove("/").unwrap_err().kind(), ErrorKind::InvalidArgument);
        fs.remove("/d").expect("remove dir");
        fs.remove("/f").expect("remove file");
    }

    #[test]
    fn test_rename_error_format_and_descendant_check() {
        let fs = create_test_fs();
        fs.mkdir_all("/a/b", 0o755).expect("mkdir_all");
        let err = fs.rename("/a", "/a/b/c").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(err.to_string(), "rename /a /a/b/c: invalid argument");

        fs.rename("/a/b", "/b").expect("rename");
        assert!(fs.stat("/b").expect("stat").is_dir());
    }

    #[test]
    fn test_rename_across_views() {
        let fs = create_test_fs();
        fs.mkdir("/jail", 0o755).expect("mkdir");
        fs.write_file("/f", b"data", 0o644).expect("write");

        let same_root = fs.with_user("root").expect("view");
        fs.rename_to("/f", &same_root, "/g").expect("rename within the same root");

        let jailed = fs.with_user("root").expect("view");
        jailed.chroot("/jail").expect("chroot");
        let err = fs.rename_to("/g", &jailed, "/h").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let other = create_test_fs();
        assert_eq!(fs.rename_to("/g", &other, "/h").unwrap_err().kind(), ErrorKind::InvalidArgument);
        assert_eq!(fs.read_file("/g").expect("still there"), b"data");
    }

    #[test]
    fn test_symlink_and_read_link() {
        let fs = create_test_fs();
        fs.write_file("/target", b"t", 0o644).expect("write");
        fs.symlink("/target", "/link").expect("symlink");

        assert_eq!(fs.read_link("/link").expect("readlink"), "/target");
        assert!(fs.lstat("/link").expect("lstat").mode().is_symlink());
        assert_eq!(fs.stat("/link").expect("stat").size(), 1);
        assert_eq!(fs.read_link("/target").unwrap_err().kind(), ErrorKind::InvalidArgument);
        assert_eq!(
            fs.symlink("/x", "/link").unwrap_err().to_string(),
            "symlink /x /link: file exists"
        );
    }

    #[test]
    fn test_chdir_getwd_relative_ops() {
        let fs = create_test_fs();
        fs.mkdir_all("/a/b", 0o755).expect("mkdir_all");
        fs.chdir("/a").expect("chdir");
        assert_eq!(fs.getwd().expect("getwd"), "/a");

        fs.write_file("b/f", b"rel", 0o644).expect("write relative");
        assert_eq!(fs.read_file("/a/b/f").expect("read"), b"rel");
        fs.chdir("b/..").expect("chdir dotdot");
        assert_eq!(fs.getwd().expect("getwd"), "/a");
        assert_eq!(fs.chdir("b/f").unwrap_err().kind(), ErrorKind::NotADirectory);
    }

    #[test]
    fn test_chdir_records_resolved_directory() {
        let fs = create_test_fs();
        fs.mkdir_all("/a/b", 0o755).expect("mkdir_all");
        fs.write_file("/a/marker", b"m", 0o644).expect("write");
        fs.symlink("/a/b", "/lnk").expect("symlink");

        fs.chdir("/lnk/..").expect("chdir through symlink");
        assert_eq!(fs.getwd().expect("getwd"), "/a");
        assert_eq!(fs.read_file("marker").expect("read relative"), b"m");

        fs.chdir("/lnk").expect("chdir to symlink");
        assert_eq!(fs.getwd().expect("getwd"), "/a/b");
    }

    #[test]
    fn test_chmod_and_chown_permissions() {
        let fs = create_test_fs();
        fs.write_file("/f", b"", 0o644).expect("write");
        let alice = user_fs(&fs, "alice");

        assert_eq!(alice.chmod("/f", 0o777).unwrap_err().kind(), ErrorKind::OperationNotPermitted);
        let user = alice.user();
        fs.chown("/f", user.uid(), user.gid()).expect("admin chown");
        alice.chmod("/f", 0o600).expect("owner chmod");
        assert_eq!(fs.stat("/f").expect("stat").mode().perm(), 0o600);
        assert_eq!(alice.chown("/f", 0, 0).unwrap_err().kind(), ErrorKind::OperationNotPermitted);
    }

    #[test]
    fn test_create_home_dir() {
        let fs = create_test_fs();
        let idm = fs.idm();
        idm.add_group("users").expect("group");
        let bob = idm.add_user("bob", "users").expect("user");

        let path = fs.create_home_dir(&bob).expect("home");
        assert_eq!(path, "/home/bob");
        let info = fs.stat(&path).expect("stat");
        assert_eq!(info.mode().perm(), 0o700);
        assert_eq!(info.sys().uid, bob.uid());

        let bob_fs = fs.with_user("bob").expect("view");
        assert_eq!(
            bob_fs.create_home_dir(&bob).unwrap_err().kind(),
            ErrorKind::OperationNotPermitted
        );
        bob_fs.write_file("/home/bob/notes", b"mine", 0o600).expect("write at home");
    }

    #[test]
    fn test_set_umask_returns_previous() {
        let fs = create_test_fs();
        assert_eq!(fs.set_umask(0o077), 0o022);
        assert_eq!(fs.umask(), 0o077);
        fs.write_file("/private", b"", 0o666).expect("write");
        assert_eq!(fs.stat("/private").expect("stat").mode().perm(), 0o600);
    }

    #[test]
    fn test_truncate_path_and_chtimes() {
        let fs = create_test_fs();
        fs.write_file("/f", b"hello", 0o644).expect("write");
        fs.truncate_path("/f", 8).expect("grow");
        assert_eq!(fs.read_file("/f").expect("read"), b"hello\0\0\0");
        fs.truncate_path("/f", 2).expect("shrink");
        assert_eq!(fs.read_file("/f").expect("read"), b"he");
        assert_eq!(fs.truncate_path("/f", -1).unwrap_err().kind(), ErrorKind::InvalidArgument);

        let epoch = SystemTime::UNIX_EPOCH;
        fs.chtimes("/f", epoch, epoch).expect("chtimes");
        assert_eq!(fs.stat("/f").expect("stat").mod_time(), epoch);
    }

    #[test]
    fn test_read_only_rejects_mutations() {
        let fs = MemFs::new(FsConfig::default().with_features(Features::READ_ONLY | Features::SYMLINK))
            .expect("create filesystem");
        let err = fs.mkdir("/d", 0o755).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OperationNotPermitted);
        assert_eq!(fs.symlink("/a", "/b").unwrap_err().kind(), ErrorKind::OperationNotPermitted);
        assert!(fs.read_dir("/").expect("read_dir").is_empty());
    }

    #[test]
    fn test_real_fs_bit_is_dropped() {
        let fs = MemFs::new(FsConfig::default().with_features(Features::REAL_FS | Features::SYMLINK))
            .expect("create filesystem");
        assert_eq!(fs.features(), Features::SYMLINK);
    }
}
