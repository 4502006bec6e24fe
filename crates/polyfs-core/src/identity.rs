// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Identity managers: user/group resolution and the current-identity oracle
//!
//! The engine stores nothing but numeric uid/gid on nodes; names, membership
//! and the starting identity of a filesystem view all come from here.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ErrorKind, FsError, FsResult};
use crate::os::OsType;

/// A user known to an identity manager.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct User {
    name: String,
    uid: u32,
    gid: u32,
}

impl User {
    pub fn new(name: impl Into<String>, uid: u32, gid: u32) -> Self {
        Self {
            name: name.into(),
            uid,
            gid,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    /// Primary group id.
    pub fn gid(&self) -> u32 {
        self.gid
    }
}

/// A group known to an identity manager.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Group {
    name: String,
    gid: u32,
}

impl Group {
    pub fn new(name: impl Into<String>, gid: u32) -> Self {
        Self {
            name: name.into(),
            gid,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn gid(&self) -> u32 {
        self.gid
    }
}

/// Administrator identity of an emulated OS.
pub fn admin_identity(os: OsType) -> (User, Group) {
    match os {
        OsType::Linux => (User::new("root", 0, 0), Group::new("root", 0)),
        OsType::Windows => (
            User::new("ContainerAdministrator", 0, 0),
            Group::new("Administrators", 0),
        ),
    }
}

/// Name/id resolution contract consumed by the engine.
#[cfg_attr(test, mockall::automock)]
pub trait IdentityMgr: Send + Sync {
    fn os_type(&self) -> OsType;

    /// Whether users and groups can be added and removed.
    fn is_writable(&self) -> bool;

    fn admin_user(&self) -> User;
    fn admin_group(&self) -> Group;

    /// Identity a new filesystem view starts with.
    fn current_user(&self) -> User;

    fn lookup_user(&self, name: &str) -> FsResult<User>;
    fn lookup_user_by_id(&self, uid: u32) -> FsResult<User>;
    fn lookup_group(&self, name: &str) -> FsResult<Group>;
    fn lookup_group_by_id(&self, gid: u32) -> FsResult<Group>;

    /// Creates a user whose primary group is `group_name`.
    fn add_user(&self, name: &str, group_name: &str) -> FsResult<User>;
    fn add_group(&self, name: &str) -> FsResult<Group>;
    fn del_user(&self, name: &str) -> FsResult<()>;
    fn del_group(&self, name: &str) -> FsResult<()>;

    /// Adds a supplementary group membership.
    fn add_user_to_group(&self, user_name: &str, group_name: &str) -> FsResult<()>;

    /// Primary or supplementary membership of `uid` in `gid`.
    fn is_member(&self, uid: u32, gid: u32) -> bool;
}

const FIRST_ID: u32 = 1000;

#[derive(Debug)]
struct IdmState {
    users: HashMap<String, User>,
    groups: HashMap<String, Group>,
    supplementary: HashMap<u32, HashSet<u32>>,
    next_uid: u32,
    next_gid: u32,
}

/// Thread-safe in-memory identity manager.
#[derive(Debug)]
pub struct MemIdm {
    os: OsType,
    admin_user: User,
    admin_group: Group,
    state: RwLock<IdmState>,
}

impl MemIdm {
    pub fn new(os: OsType) -> Self {
        let (admin_user, admin_group) = admin_identity(os);
        let mut users = HashMap::new();
        users.insert(admin_user.name().to_string(), admin_user.clone());
        let mut groups = HashMap::new();
        groups.insert(admin_group.name().to_string(), admin_group.clone());

        Self {
            os,
            admin_user,
            admin_group,
            state: RwLock::new(IdmState {
                users,
                groups,
                supplementary: HashMap::new(),
                next_uid: FIRST_ID,
                next_gid: FIRST_ID,
            }),
        }
    }
}

impl IdentityMgr for MemIdm {
    fn os_type(&self) -> OsType {
        self.os
    }

    fn is_writable(&self) -> bool {
        true
    }

    fn admin_user(&self) -> User {
        self.admin_user.clone()
    }

    fn admin_group(&self) -> Group {
        self.admin_group.clone()
    }

    fn current_user(&self) -> User {
        self.admin_user.clone()
    }

    fn lookup_user(&self, name: &str) -> FsResult<User> {
        self.state
            .read()
            .users
            .get(name)
            .cloned()
            .ok_or_else(|| FsError::UnknownUser(name.to_string()))
    }

    fn lookup_user_by_id(&self, uid: u32) -> FsResult<User> {
        self.state
            .read()
            .users
            .values()
            .find(|u| u.uid == uid)
            .cloned()
            .ok_or(FsError::UnknownUserId(uid))
    }

    fn lookup_group(&self, name: &str) -> FsResult<Group> {
        self.state
            .read()
            .groups
            .get(name)
            .cloned()
            .ok_or_else(|| FsError::UnknownGroup(name.to_string()))
    }

    fn lookup_group_by_id(&self, gid: u32) -> FsResult<Group> {
        self.state
            .read()
            .groups
            .values()
            .find(|g| g.gid == gid)
            .cloned()
            .ok_or(FsError::UnknownGroupId(gid))
    }

    fn add_user(&self, name: &str, group_name: &str) -> FsResult<User> {
        let mut state = self.state.write();
        if state.users.contains_key(name) {
            return Err(FsError::AlreadyExistsUser(name.to_string()));
        }
        let gid = state
            .groups
            .get(group_name)
            .map(Group::gid)
            .ok_or_else(|| FsError::UnknownGroup(group_name.to_string()))?;

        let user = User::new(name, state.next_uid, gid);
        state.next_uid += 1;
        state.users.insert(name.to_string(), user.clone());
        debug!(user = name, uid = user.uid, gid, "added user");
        Ok(user)
    }

    fn add_group(&self, name: &str) -> FsResult<Group> {
        let mut state = self.state.write();
        if state.groups.contains_key(name) {
            return Err(FsError::AlreadyExistsGroup(name.to_string()));
        }
        let group = Group::new(name, state.next_gid);
        state.next_gid += 1;
        state.groups.insert(name.to_string(), group.clone());
        debug!(group = name, gid = group.gid, "added group");
        Ok(group)
    }

    fn del_user(&self, name: &str) -> FsResult<()> {
        if name == self.admin_user.name() {
            return Err(FsError::path("deluser", name, ErrorKind::OperationNotPermitted, self.os));
        }
        let mut state = self.state.write();
        let user = state
            .users
            .remove(name)
            .ok_or_else(|| FsError::UnknownUser(name.to_string()))?;
        for members in state.supplementary.values_mut() {
            members.remove(&user.uid);
        }
        debug!(user = name, "removed user");
        Ok(())
    }

    fn del_group(&self, name: &str) -> FsResult<()> {
        if name == self.admin_group.name() {
            return Err(FsError::path("delgroup", name, ErrorKind::OperationNotPermitted, self.os));
        }
        let mut state = self.state.write();
        let group = state
            .groups
            .remove(name)
            .ok_or_else(|| FsError::UnknownGroup(name.to_string()))?;
        state.supplementary.remove(&group.gid);
        debug!(group = name, "removed group");
        Ok(())
    }

    fn add_user_to_group(&self, user_name: &str, group_name: &str) -> FsResult<()> {
        let mut state = self.state.write();
        let uid = state
            .users
            .get(user_name)
            .map(User::uid)
            .ok_or_else(|| FsError::UnknownUser(user_name.to_string()))?;
        let gid = state
            .groups
            .get(group_name)
            .map(Group::gid)
            .ok_or_else(|| FsError::UnknownGroup(group_name.to_string()))?;
        state.supplementary.entry(gid).or_default().insert(uid);
        Ok(())
    }

    fn is_member(&self, uid: u32, gid: u32) -> bool {
        let state = self.state.read();
        let primary = state.users.values().any(|u| u.uid == uid && u.gid == gid);
        primary || state.supplementary.get(&gid).is_some_and(|m| m.contains(&uid))
    }
}

/// Identity manager of filesystems without identity support: only the
/// administrator exists and nothing can be added.
#[derive(Debug)]
pub struct NoIdm {
    os: OsType,
    admin_user: User,
    admin_group: Group,
}

impl NoIdm {
    pub fn new(os: OsType) -> Self {
        let (admin_user, admin_group) = admin_identity(os);
        Self {
            os,
            admin_user,
            admin_group,
        }
    }
}

impl IdentityMgr for NoIdm {
    fn os_type(&self) -> OsType {
        self.os
    }

    fn is_writable(&self) -> bool {
        false
    }

    fn admin_user(&self) -> User {
        self.admin_user.clone()
    }

    fn admin_group(&self) -> Group {
        self.admin_group.clone()
    }

    fn current_user(&self) -> User {
        self.admin_user.clone()
    }

    fn lookup_user(&self, name: &str) -> FsResult<User> {
        if name == self.admin_user.name() {
            Ok(self.admin_user.clone())
        } else {
            Err(FsError::UnknownUser(name.to_string()))
        }
    }

    fn lookup_user_by_id(&self, uid: u32) -> FsResult<User> {
        if uid == self.admin_user.uid() {
            Ok(self.admin_user.clone())
        } else {
            Err(FsError::UnknownUserId(uid))
        }
    }

    fn lookup_group(&self, name: &str) -> FsResult<Group> {
        if name == self.admin_group.name() {
            Ok(self.admin_group.clone())
        } else {
            Err(FsError::UnknownGroup(name.to_string()))
        }
    }

    fn lookup_group_by_id(&self, gid: u32) -> FsResult<Group> {
        if gid == self.admin_group.gid() {
            Ok(self.admin_group.clone())
        } else {
            Err(FsError::UnknownGroupId(gid))
        }
    }

    fn add_user(&self, _name: &str, _group_name: &str) -> FsResult<User> {
        Err(FsError::IdentityUnsupported("adduser"))
    }

    fn add_group(&self, _name: &str) -> FsResult<Group> {
        Err(FsError::IdentityUnsupported("addgroup"))
    }

    fn del_user(&self, _name: &str) -> FsResult<()> {
        Err(FsError::IdentityUnsupported("deluser"))
    }

    fn del_group(&self, _name: &str) -> FsResult<()> {
        Err(FsError::IdentityUnsupported("delgroup"))
    }

    fn add_user_to_group(&self, _user_name: &str, _group_name: &str) -> FsResult<()> {
        Err(FsError::IdentityUnsupported("usermod"))
    }

    fn is_member(&self, uid: u32, gid: u32) -> bool {
        uid == self.admin_user.uid() && gid == self.admin_group.gid()
    }
}
