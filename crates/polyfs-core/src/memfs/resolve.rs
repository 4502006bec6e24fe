// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Path resolution over the node store
//!
//! Paths are walked one segment at a time. `..` follows the directory's parent
//! link except at the view root, where it stays put; symlink targets are
//! spliced into the pending segments and charged against a hop budget.

use std::collections::VecDeque;

use tracing::trace;

use crate::error::ErrorKind;
use crate::features::Features;
use crate::os::OsType;

use super::node::{NodeId, NodeKind, NodeStore};
use super::perm::{Caller, EXEC};

/// Symlink expansions allowed in a single resolution.
pub(crate) const MAX_SYMLINK_HOPS: u32 = 40;

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Resolved {
    /// The path names an existing node. `entry` is the directory slot it was
    /// reached through, absent for the view root and `.`/`..` endings.
    Found {
        id: NodeId,
        entry: Option<(NodeId, String)>,
    },
    /// Every directory exists but the final name does not.
    Missing { parent: NodeId, name: String },
}

impl Resolved {
    pub fn found(self) -> Result<NodeId, ErrorKind> {
        match self {
            Resolved::Found { id, .. } => Ok(id),
            Resolved::Missing { .. } => Err(ErrorKind::NoSuchFileOrDir),
        }
    }

    /// Existing node together with the entry that names it.
    pub fn found_entry(self) -> Result<(NodeId, NodeId, String), ErrorKind> {
        match self {
            Resolved::Found {
                id,
                entry: Some((parent, name)),
            } => Ok((id, parent, name)),
            Resolved::Found { entry: None, .. } => Err(ErrorKind::InvalidArgument),
            Resolved::Missing { .. } => Err(ErrorKind::NoSuchFileOrDir),
        }
    }

    /// Slot for a node about to be created.
    pub fn missing(self) -> Result<(NodeId, String), ErrorKind> {
        match self {
            Resolved::Missing { parent, name } => Ok((parent, name)),
            Resolved::Found { .. } => Err(ErrorKind::AlreadyExists),
        }
    }
}

/// Everything a walk depends on besides the store itself.
pub(crate) struct Walk<'a> {
    pub store: &'a NodeStore,
    pub caller: &'a Caller<'a>,
    pub os: OsType,
    /// Directory `..` cannot climb above.
    pub root: NodeId,
    /// Segments of the working directory below `root`.
    pub cwd: &'a [String],
}

impl Walk<'_> {
    fn split(&self, path: &str) -> Result<(bool, Vec<String>), ErrorKind> {
        let parts = self.os.parts(path);
        if !self.os.is_system_volume(parts.volume) {
            return Err(ErrorKind::NoSuchFileOrDir);
        }
        let segments = parts.segments.into_iter().map(str::to_string).collect();
        Ok((parts.absolute, segments))
    }

    pub fn resolve(&self, path: &str, follow_final: bool) -> Result<Resolved, ErrorKind> {
        if path.is_empty() {
            return Err(ErrorKind::NoSuchFileOrDir);
        }
        let (absolute, segments) = self.split(path)?;
        let mut pending: VecDeque<String> = VecDeque::with_capacity(segments.len());
        if !absolute {
            pending.extend(self.cwd.iter().cloned());
        }
        pending.extend(segments);

        let mut current = self.root;
        let mut entry: Option<(NodeId, String)> = None;
        let mut hops = 0u32;

        while let Some(segment) = pending.pop_front() {
            match segment.as_str() {
                "." => {
                    if !self.store.get(current)?.is_dir() {
                        return Err(ErrorKind::NotADirectory);
                    }
                    entry = None;
                    continue;
                }
                ".." => {
                    if current != self.root {
                        current = self.store.parent_of(current)?;
                    }
                    entry = None;
                    continue;
                }
                _ => {}
            }

            let dir = self.store.get(current)?;
            if !dir.is_dir() {
                return Err(ErrorKind::NotADirectory);
            }
            self.caller.check(dir, EXEC)?;

            let Some(child) = self.store.lookup(current, &segment)? else {
                if pending.is_empty() {
                    return Ok(Resolved::Missing {
                        parent: current,
                        name: segment,
                    });
                }
                return Err(ErrorKind::NoSuchFileOrDir);
            };

            let node = self.store.get(child)?;
            if let NodeKind::Symlink { target } = &node.kind {
                if !pending.is_empty() || follow_final {
                    if !self.caller.features.contains(Features::SYMLINK) {
                        return Err(ErrorKind::PermissionDenied);
                    }
                    hops += 1;
                    if hops > MAX_SYMLINK_HOPS {
                        return Err(ErrorKind::TooManySymlinks);
                    }
                    trace!(link = %segment, target = %target, hops, "following symlink");

                    let (target_absolute, target_segments) = self.split(target)?;
                    if target_absolute {
                        current = self.root;
                    }
                    for seg in target_segments.into_iter().rev() {
                        pending.push_front(seg);
                    }
                    entry = None;
                    continue;
                }
            }

            entry = Some((current, segment));
            current = child;
        }

        Ok(Resolved::Found { id: current, entry })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{IdentityMgr, MemIdm, User};

    struct Fixture {
        store: NodeStore,
        idm: MemIdm,
        user: User,
        features: Features,
    }

    impl Fixture {
        fn new(os: OsType) -> Self {
            Self {
                store: NodeStore::new(os, 0o755, 0, 0),
                idm: MemIdm::new(os),
                user: User::new("root", 0, 0),
                features: Features::SYMLINK,
            }
        }

        fn resolve_in(&self, os: OsType, root: NodeId, cwd: &[String], path: &str, follow: bool) -> Result<Resolved, ErrorKind> {
            let caller = Caller {
                user: &self.user,
                admin_uid: 0,
                features: self.features,
                idm: &self.idm as &dyn IdentityMgr,
            };
            let walk = Walk {
                store: &self.store,
                caller: &caller,
                os,
                root,
                cwd,
            };
            walk.resolve(path, follow)
        }

        fn resolve(&self, path: &str, follow: bool) -> Result<Resolved, ErrorKind> {
            self.resolve_in(OsType::Linux, self.store.root(), &[], path, follow)
        }
    }

    #[test]
    fn test_resolve_nested_and_missing() {
        let mut fx = Fixture::new(OsType::Linux);
        let root = fx.store.root();
        let a = fx.store.mkdir(root, "a", 0o755, 0, 0).expect("mkdir");
        let f = fx.store.create_regular(a, "f", 0o644, 0, 0).expect("create");

        assert_eq!(fx.resolve("/a/f", true).unwrap().found().unwrap(), f);
        assert_eq!(fx.resolve("/a/./../a/f", true).unwrap().found().unwrap(), f);
        assert_eq!(
            fx.resolve("/a/g", true).unwrap(),
            Resolved::Missing {
                parent: a,
                name: "g".into()
            }
        );
        assert_eq!(fx.resolve("/b/g", true), Err(ErrorKind::NoSuchFileOrDir));
        assert_eq!(fx.resolve("/a/f/x", true), Err(ErrorKind::NotADirectory));
        assert_eq!(fx.resolve("", true), Err(ErrorKind::NoSuchFileOrDir));
    }

    #[test]
    fn test_relative_paths_use_cwd() {
        let mut fx = Fixture::new(OsType::Linux);
        let root = fx.store.root();
        let a = fx.store.mkdir(root, "a", 0o755, 0, 0).expect("mkdir");
        let f = fx.store.create_regular(a, "f", 0o644, 0, 0).expect("create");

        let cwd = vec!["a".to_string()];
        let found = fx.resolve_in(OsType::Linux, root, &cwd, "f", true).unwrap();
        assert_eq!(found.found().unwrap(), f);
        let up = fx.resolve_in(OsType::Linux, root, &cwd, "..", true).unwrap();
        assert_eq!(up.found().unwrap(), root);
    }

    #[test]
    fn test_symlink_follow_and_nofollow() {
        let mut fx = Fixture::new(OsType::Linux);
        let root = fx.store.root();
        let d = fx.store.mkdir(root, "d", 0o755, 0, 0).expect("mkdir");
        let f = fx.store.create_regular(d, "f", 0o644, 0, 0).expect("create");
        let abs = fx.store.symlink("/d/f", root, "abs", 0, 0).expect("symlink");
        fx.store.symlink("f", d, "rel", 0, 0).expect("symlink");
        fx.store.symlink("d", root, "dirlink", 0, 0).expect("symlink");

        assert_eq!(fx.resolve("/abs", true).unwrap().found().unwrap(), f);
        assert_eq!(fx.resolve("/abs", false).unwrap().found().unwrap(), abs);
        assert_eq!(fx.resolve("/d/rel", true).unwrap().found().unwrap(), f);
        assert_eq!(fx.resolve("/dirlink/f", false).unwrap().found().unwrap(), f);
    }

    #[test]
    fn test_self_loop_exhausts_hop_budget() {
        let mut fx = Fixture::new(OsType::Linux);
        let root = fx.store.root();
        fx.store.symlink("/l2", root, "l2", 0, 0).expect("symlink");
        assert_eq!(fx.resolve("/l2", true), Err(ErrorKind::TooManySymlinks));
        assert!(fx.resolve("/l2", false).is_ok());
    }

    /// Links `c0 -> /c1 -> ... -> /c{n-1} -> target` in the root.
    fn link_chain(fx: &mut Fixture, n: usize, target: &str) {
        let root = fx.store.root();
        for i in 0..n {
            let next = if i + 1 == n { target.to_string() } else { format!("/c{}", i + 1) };
            fx.store.symlink(&next, root, &format!("c{i}"), 0, 0).expect("symlink");
        }
    }

    #[test]
    fn test_hop_budget_boundary() {
        let mut fx = Fixture::new(OsType::Linux);
        let root = fx.store.root();
        let f = fx.store.create_regular(root, "f", 0o644, 0, 0).expect("create");
        link_chain(&mut fx, MAX_SYMLINK_HOPS as usize, "/f");
        assert_eq!(fx.resolve("/c0", true).unwrap().found().unwrap(), f);

        let mut fx = Fixture::new(OsType::Linux);
        let root = fx.store.root();
        fx.store.create_regular(root, "f", 0o644, 0, 0).expect("create");
        link_chain(&mut fx, MAX_SYMLINK_HOPS as usize + 1, "/f");
        assert_eq!(fx.resolve("/c0", true), Err(ErrorKind::TooManySymlinks));
        assert_eq!(fx.resolve("/c1", true).unwrap().found().unwrap(), fx.store.lookup(root, "f").unwrap().unwrap());
    }

    #[test]
    fn test_symlinks_denied_without_capability() {
        let mut fx = Fixture::new(OsType::Linux);
        let root = fx.store.root();
        let d = fx.store.mkdir(root, "d", 0o755, 0, 0).expect("mkdir");
        fx.store.create_regular(d, "f", 0o644, 0, 0).expect("create");
        let link = fx.store.symlink("/d", root, "dirlink", 0, 0).expect("symlink");
        fx.store.symlink("/d/f", root, "filelink", 0, 0).expect("symlink");
        fx.features = Features::empty();

        assert_eq!(fx.resolve("/dirlink/f", true), Err(ErrorKind::PermissionDenied));
        assert_eq!(fx.resolve("/dirlink/f", false), Err(ErrorKind::PermissionDenied));
        assert_eq!(fx.resolve("/filelink", true), Err(ErrorKind::PermissionDenied));
        assert_eq!(fx.resolve("/dirlink", false).unwrap().found().unwrap(), link);
    }

    #[test]
    fn test_dot_after_file_is_not_a_directory() {
        let mut fx = Fixture::new(OsType::Linux);
        let root = fx.store.root();
        let d = fx.store.mkdir(root, "d", 0o755, 0, 0).expect("mkdir");
        fx.store.create_regular(root, "f", 0o644, 0, 0).expect("create");

        assert_eq!(fx.resolve("/f/.", true), Err(ErrorKind::NotADirectory));
        assert_eq!(fx.resolve("/f/..", true), Err(ErrorKind::NotADirectory));
        assert_eq!(fx.resolve("/d/.", true).unwrap().found().unwrap(), d);
    }

    #[test]
    fn test_dotdot_clamps_at_view_root() {
        let mut fx = Fixture::new(OsType::Linux);
        let root = fx.store.root();
        let jail = fx.store.mkdir(root, "jail", 0o755, 0, 0).expect("mkdir");
        let etc = fx.store.mkdir(root, "etc", 0o755, 0, 0).expect("mkdir");
        fx.store.create_regular(etc, "passwd", 0o644, 0, 0).expect("create");

        let result = fx.resolve_in(OsType::Linux, jail, &[], "../../etc/passwd", true);
        assert_eq!(result, Err(ErrorKind::NoSuchFileOrDir));
        let escaped = fx.resolve_in(OsType::Linux, jail, &[], "/..", true).unwrap();
        assert_eq!(escaped.found().unwrap(), jail);
    }

    #[test]
    fn test_windows_paths() {
        let mut fx = Fixture::new(OsType::Windows);
        let root = fx.store.root();
        let users = fx.store.mkdir(root, "Users", 0o755, 0, 0).expect("mkdir");

        let found = fx.resolve_in(OsType::Windows, root, &[], "c:\\USERS", true).unwrap();
        assert_eq!(found.found().unwrap(), users);
        let forward = fx.resolve_in(OsType::Windows, root, &[], "C:/users", true).unwrap();
        assert_eq!(forward.found().unwrap(), users);
        assert_eq!(
            fx.resolve_in(OsType::Windows, root, &[], "D:\\Users", true),
            Err(ErrorKind::NoSuchFileOrDir)
        );
    }

    #[test]
    fn test_search_permission_required() {
        let mut fx = Fixture::new(OsType::Linux);
        let root = fx.store.root();
        let private = fx.store.mkdir(root, "private", 0o700, 0, 0).expect("mkdir");
        fx.store.create_regular(private, "f", 0o644, 0, 0).expect("create");

        fx.user = User::new("guest", 1000, 1000);
        assert_eq!(fx.resolve("/private/f", true), Err(ErrorKind::PermissionDenied));
    }
}
