// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Owner/group/other permission evaluation

use crate::error::ErrorKind;
use crate::features::Features;
use crate::identity::{IdentityMgr, User};
use crate::types::FileMode;

use super::node::Node;

pub(crate) const READ: u32 = 0o4;
pub(crate) const WRITE: u32 = 0o2;
pub(crate) const EXEC: u32 = 0o1;

/// Effective identity of a caller together with what is needed to judge it.
pub(crate) struct Caller<'a> {
    pub user: &'a User,
    pub admin_uid: u32,
    pub features: Features,
    pub idm: &'a dyn IdentityMgr,
}

impl Caller<'_> {
    pub fn uid(&self) -> u32 {
        self.user.uid()
    }

    pub fn gid(&self) -> u32 {
        self.user.gid()
    }

    pub fn is_admin(&self) -> bool {
        self.user.uid() == self.admin_uid
    }

    /// Primary group, or membership reported by the identity manager.
    pub fn in_group(&self, gid: u32) -> bool {
        if self.user.gid() == gid {
            return true;
        }
        self.features.contains(Features::IDENTITY_MGR) && self.idm.is_member(self.user.uid(), gid)
    }

    /// Standard Unix precedence: owner bits, then group bits, then other bits.
    pub fn allowed(&self, node: &Node, want: u32) -> bool {
        if self.is_admin() {
            return true;
        }
        let shift = if self.uid() == node.uid {
            6
        } else if self.in_group(node.gid) {
            3
        } else {
            0
        };
        let granted = (node.mode >> shift) & 0o7;
        granted & want == want
    }

    pub fn check(&self, node: &Node, want: u32) -> Result<(), ErrorKind> {
        if self.allowed(node, want) {
            Ok(())
        } else {
            Err(ErrorKind::PermissionDenied)
        }
    }

    /// Adding or removing an entry needs write and search permission on the directory.
    pub fn check_dir_write(&self, dir: &Node) -> Result<(), ErrorKind> {
        self.check(dir, WRITE | EXEC)
    }

    /// Removal (or rename away) of `child` from `dir`, honouring the sticky bit.
    pub fn check_remove(&self, dir: &Node, child: &Node) -> Result<(), ErrorKind> {
        self.check_dir_write(dir)?;
        let sticky = dir.mode & FileMode::STICKY != 0;
        if sticky && !self.is_admin() && self.uid() != dir.uid && self.uid() != child.uid {
            return Err(ErrorKind::PermissionDenied);
        }
        Ok(())
    }

    /// Mode and timestamp changes are reserved to the owner and the administrator.
    pub fn check_owner(&self, node: &Node) -> Result<(), ErrorKind> {
        if self.is_admin() || self.uid() == node.uid {
            Ok(())
        } else {
            Err(ErrorKind::OperationNotPermitted)
        }
    }

    /// The administrator may change anything; an owner may only move the node
    /// to a group they belong to.
    pub fn check_chown(&self, node: &Node, uid: u32, gid: u32) -> Result<(), ErrorKind> {
        if self.is_admin() {
            return Ok(());
        }
        let owner = self.uid() == node.uid;
        let keeps_owner = uid == node.uid;
        let group_ok = gid == node.gid || self.in_group(gid);
        if owner && keeps_owner && group_ok {
            Ok(())
        } else {
            Err(ErrorKind::OperationNotPermitted)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{MemIdm, MockIdentityMgr};
    use crate::memfs::node::NodeStore;
    use crate::os::OsType;

    fn node_with(mode: u32, uid: u32, gid: u32) -> Node {
        let mut store = NodeStore::new(OsType::Linux, 0o755, 0, 0);
        let root = store.root();
        let id = store.create_regular(root, "n", mode, uid, gid).expect("create");
        store.get(id).expect("node").clone()
    }

    fn caller<'a>(user: &'a User, idm: &'a dyn IdentityMgr) -> Caller<'a> {
        Caller {
            user,
            admin_uid: 0,
            features: Features::IDENTITY_MGR,
            idm,
        }
    }

    #[test]
    fn test_owner_group_other_precedence() {
        let idm = MemIdm::new(OsType::Linux);
        let node = node_with(0o640, 1000, 1000);

        let owner = User::new("owner", 1000, 1000);
        let member = User::new("member", 1001, 1000);
        let other = User::new("other", 1002, 1002);

        assert!(caller(&owner, &idm).allowed(&node, READ | WRITE));
        assert!(caller(&member, &idm).allowed(&node, READ));
        assert!(!caller(&member, &idm).allowed(&node, WRITE));
        assert!(!caller(&other, &idm).allowed(&node, READ));
    }

    #[test]
    fn test_owner_bits_apply_even_when_group_would_allow() {
        let idm = MemIdm::new(OsType::Linux);
        let node = node_with(0o070, 1000, 1000);
        let owner = User::new("owner", 1000, 1000);
        assert!(!caller(&owner, &idm).allowed(&node, READ));
    }

    #[test]
    fn test_admin_bypasses_mode_bits() {
        let idm = MemIdm::new(OsType::Linux);
        let node = node_with(0o000, 1000, 1000);
        let root = User::new("root", 0, 0);
        assert!(caller(&root, &idm).allowed(&node, READ | WRITE | EXEC));
        assert!(caller(&root, &idm).check_chown(&node, 5, 5).is_ok());
    }

    #[test]
    fn test_supplementary_group_via_identity_manager() {
        let mut idm = MockIdentityMgr::new();
        idm.expect_is_member().returning(|uid, gid| uid == 1001 && gid == 2000);
        let node = node_with(0o060, 1000, 2000);
        let user = User::new("dave", 1001, 1001);

        let c = caller(&user, &idm);
        assert!(c.allowed(&node, READ | WRITE));

        let without_idm = Caller {
            features: Features::empty(),
            ..c
        };
        assert!(!without_idm.allowed(&node, READ));
    }

    #[test]
    fn test_sticky_directory_removal() {
        let idm = MemIdm::new(OsType::Linux);
        let dir = node_with(0o1777, 0, 0);
        let child = node_with(0o644, 1000, 1000);

        let owner = User::new("owner", 1000, 1000);
        let stranger = User::new("stranger", 1001, 1001);
        assert!(caller(&owner, &idm).check_remove(&dir, &child).is_ok());
        assert_eq!(
            caller(&stranger, &idm).check_remove(&dir, &child),
            Err(ErrorKind::PermissionDenied)
        );
    }

    #[test]
    fn test_chown_rules_for_owner() {
        let mut idm = MockIdentityMgr::new();
        idm.expect_is_member().returning(|_, gid| gid == 3000);
        let node = node_with(0o644, 1000, 1000);
        let owner = User::new("owner", 1000, 1000);
        let c = caller(&owner, &idm);

        assert!(c.check_chown(&node, 1000, 3000).is_ok());
        assert_eq!(c.check_chown(&node, 1000, 4000), Err(ErrorKind::OperationNotPermitted));
        assert_eq!(c.check_chown(&node, 1001, 1000), Err(ErrorKind::OperationNotPermitted));
        assert_eq!(c.check_owner(&node_with(0o644, 7, 7)), Err(ErrorKind::OperationNotPermitted));
    }
}
