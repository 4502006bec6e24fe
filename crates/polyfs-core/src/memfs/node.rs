// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Node arena and directory tree of the in-memory engine
//!
//! Nodes never point at each other; directories map folded entry names to
//! [`NodeId`]s and every other reference (open handles, view roots) is an id
//! as well. Ids are allocated monotonically and never reused.

use std::collections::{BTreeMap, HashMap};
use std::time::SystemTime;

use tracing::debug;

use crate::error::ErrorKind;
use crate::os::OsType;
use crate::types::{DirEntry, FileInfo, FileMode, FileTimes, FileType, StatT};

/// Largest file content the engine will hold.
pub(crate) const MAX_FILE_SIZE: usize = 1 << 32;

/// Grows or shrinks `data` to `len`, zero-filling any gap.
pub(crate) fn resize_content(data: &mut Vec<u8>, len: usize) -> Result<(), ErrorKind> {
    if len > MAX_FILE_SIZE {
        return Err(ErrorKind::InvalidArgument);
    }
    if len > data.len() {
        data.try_reserve_exact(len - data.len())
            .map_err(|_| ErrorKind::InvalidArgument)?;
    }
    data.resize(len, 0);
    Ok(())
}

/// Stable identifier of a node in the arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct NodeId(pub u64);

/// A named slot in a directory. The map key is the folded name.
#[derive(Clone, Debug)]
pub(crate) struct Entry {
    pub name: String,
    pub id: NodeId,
}

#[derive(Clone, Debug)]
pub(crate) enum NodeKind {
    File {
        data: Vec<u8>,
    },
    Directory {
        entries: BTreeMap<String, Entry>,
        /// None only for the root of the store.
        parent: Option<NodeId>,
    },
    Symlink {
        target: String,
    },
}

#[derive(Clone, Debug)]
pub(crate) struct Node {
    pub kind: NodeKind,
    /// Permission, setuid, setgid and sticky bits.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub open_handles: u32,
    pub times: FileTimes,
}

impl Node {
    fn new(kind: NodeKind, mode: u32, uid: u32, gid: u32) -> Self {
        Self {
            kind,
            mode: mode & FileMode::MODE_MASK,
            uid,
            gid,
            nlink: 1,
            open_handles: 0,
            times: FileTimes::now(),
        }
    }

    pub fn file_type(&self) -> FileType {
        match self.kind {
            NodeKind::File { .. } => FileType::Regular,
            NodeKind::Directory { .. } => FileType::Directory,
            NodeKind::Symlink { .. } => FileType::Symlink,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Directory { .. })
    }

    pub fn size(&self) -> u64 {
        match &self.kind {
            NodeKind::File { data } => data.len() as u64,
            NodeKind::Directory { .. } => 0,
            NodeKind::Symlink { target } => target.len() as u64,
        }
    }

    pub fn file_mode(&self) -> FileMode {
        FileMode::new(self.file_type(), self.mode)
    }

    pub fn info(&self, id: NodeId, name: impl Into<String>) -> FileInfo {
        FileInfo::new(
            name,
            self.size(),
            self.file_mode(),
            self.times,
            StatT {
                uid: self.uid,
                gid: self.gid,
                nlink: u64::from(self.nlink),
            },
            id.0,
        )
    }

    pub fn touch(&mut self) {
        let now = SystemTime::now();
        self.times.mtime = now;
        self.times.ctime = now;
    }

    pub fn touch_ctime(&mut self) {
        self.times.ctime = SystemTime::now();
    }

    /// Resizes file content, zero-filling any gap.
    pub fn set_len(&mut self, len: usize) -> Result<(), ErrorKind> {
        match &mut self.kind {
            NodeKind::File { data } => {
                resize_content(data, len)?;
                self.touch();
                Ok(())
            }
            NodeKind::Directory { .. } => Err(ErrorKind::IsADirectory),
            NodeKind::Symlink { .. } => Err(ErrorKind::InvalidArgument),
        }
    }
}

/// Outcome of removing a directory entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Unlinked {
    /// The node lost its last link and no handle held it.
    Destroyed,
    /// The node survives through other links or open handles.
    Retained,
}

/// Arena owning every node of one filesystem tree.
#[derive(Debug)]
pub(crate) struct NodeStore {
    nodes: HashMap<NodeId, Node>,
    next_id: u64,
    root: NodeId,
    os: OsType,
}

impl NodeStore {
    pub fn new(os: OsType, root_mode: u32, uid: u32, gid: u32) -> Self {
        let root = NodeId(1);
        let mut nodes = HashMap::new();
        nodes.insert(
            root,
            Node::new(
                NodeKind::Directory {
                    entries: BTreeMap::new(),
                    parent: None,
                },
                root_mode,
                uid,
                gid,
            ),
        );
        Self {
            nodes,
            next_id: 2,
            root,
            os,
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[cfg(test)]
    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn get(&self, id: NodeId) -> Result<&Node, ErrorKind> {
        self.nodes.get(&id).ok_or(ErrorKind::NoSuchFileOrDir)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Result<&mut Node, ErrorKind> {
        self.nodes.get_mut(&id).ok_or(ErrorKind::NoSuchFileOrDir)
    }

    fn entries(&self, dir: NodeId) -> Result<&BTreeMap<String, Entry>, ErrorKind> {
        match &self.get(dir)?.kind {
            NodeKind::Directory { entries, .. } => Ok(entries),
            _ => Err(ErrorKind::NotADirectory),
        }
    }

    fn entries_mut(&mut self, dir: NodeId) -> Result<&mut BTreeMap<String, Entry>, ErrorKind> {
        match &mut self.get_mut(dir)?.kind {
            NodeKind::Directory { entries, .. } => Ok(entries),
            _ => Err(ErrorKind::NotADirectory),
        }
    }

    /// Looks `name` up in directory `dir`.
    pub fn lookup(&self, dir: NodeId, name: &str) -> Result<Option<NodeId>, ErrorKind> {
        let key = self.os.fold_name(name);
        Ok(self.entries(dir)?.get(key.as_ref()).map(|e| e.id))
    }

    /// Parent directory of a directory node; the root is its own parent.
    pub fn parent_of(&self, dir: NodeId) -> Result<NodeId, ErrorKind> {
        match &self.get(dir)?.kind {
            NodeKind::Directory { parent, .. } => Ok(parent.unwrap_or(dir)),
            _ => Err(ErrorKind::NotADirectory),
        }
    }

    /// Whether `ancestor` lies on the parent chain of directory `dir` (inclusive).
    pub fn is_ancestor(&self, ancestor: NodeId, dir: NodeId) -> Result<bool, ErrorKind> {
        let mut current = dir;
        loop {
            if current == ancestor {
                return Ok(true);
            }
            let parent = self.parent_of(current)?;
            if parent == current {
                return Ok(false);
            }
            current = parent;
        }
    }

    /// Entry names leading from directory `top` down to directory `dir`.
    pub fn segments_below(&self, top: NodeId, dir: NodeId) -> Result<Vec<String>, ErrorKind> {
        let mut segments = Vec::new();
        let mut current = dir;
        while current != top {
            let parent = self.parent_of(current)?;
            if parent == current {
                return Err(ErrorKind::NoSuchFileOrDir);
            }
            let entry = self
                .entries(parent)?
                .values()
                .find(|e| e.id == current)
                .ok_or(ErrorKind::NoSuchFileOrDir)?;
            segments.push(entry.name.clone());
            current = parent;
        }
        segments.reverse();
        Ok(segments)
    }

    fn allocate(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        self.nodes.insert(id, node);
        id
    }

    fn link_entry(&mut self, parent: NodeId, name: &str, id: NodeId) -> Result<(), ErrorKind> {
        let key = self.os.fold_name(name).into_owned();
        let entries = self.entries_mut(parent)?;
        if entries.contains_key(&key) {
            return Err(ErrorKind::AlreadyExists);
        }
        entries.insert(
            key,
            Entry {
                name: name.to_string(),
                id,
            },
        );
        self.get_mut(parent)?.touch();
        Ok(())
    }

    /// A directory removed while still open has no links and takes no new entries.
    fn ensure_live_dir(&self, dir: NodeId) -> Result<(), ErrorKind> {
        if self.get(dir)?.nlink == 0 {
            return Err(ErrorKind::NoSuchFileOrDir);
        }
        Ok(())
    }

    fn ensure_absent(&self, parent: NodeId, name: &str) -> Result<(), ErrorKind> {
        self.ensure_live_dir(parent)?;
        match self.lookup(parent, name)? {
            Some(_) => Err(ErrorKind::AlreadyExists),
            None => Ok(()),
        }
    }

    fn insert_child(
        &mut self,
        parent: NodeId,
        name: &str,
        kind: NodeKind,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> Result<NodeId, ErrorKind> {
        self.ensure_absent(parent, name)?;
        let id = self.allocate(Node::new(kind, mode, uid, gid));
        self.link_entry(parent, name, id)?;
        Ok(id)
    }

    /// Creates an empty regular file. `mode` is stored as given.
    pub fn create_regular(
        &mut self,
        parent: NodeId,
        name: &str,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> Result<NodeId, ErrorKind> {
        let id = self.insert_child(parent, name, NodeKind::File { data: Vec::new() }, mode, uid, gid)?;
        debug!(parent = parent.0, name, id = id.0, "created file");
        Ok(id)
    }

    pub fn mkdir(
        &mut self,
        parent: NodeId,
        name: &str,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> Result<NodeId, ErrorKind> {
        let kind = NodeKind::Directory {
            entries: BTreeMap::new(),
            parent: Some(parent),
        };
        let id = self.insert_child(parent, name, kind, mode, uid, gid)?;
        debug!(parent = parent.0, name, id = id.0, "created directory");
        Ok(id)
    }

    /// Stores `target` verbatim; it is only interpreted during resolution.
    pub fn symlink(
        &mut self,
        target: &str,
        parent: NodeId,
        name: &str,
        uid: u32,
        gid: u32,
    ) -> Result<NodeId, ErrorKind> {
        let kind = NodeKind::Symlink {
            target: target.to_string(),
        };
        let id = self.insert_child(parent, name, kind, 0o777, uid, gid)?;
        debug!(parent = parent.0, name, target, id = id.0, "created symlink");
        Ok(id)
    }

    pub fn hardlink(&mut self, existing: NodeId, parent: NodeId, name: &str) -> Result<(), ErrorKind> {
        if self.get(existing)?.is_dir() {
            return Err(ErrorKind::OperationNotPermitted);
        }
        self.ensure_absent(parent, name)?;
        self.link_entry(parent, name, existing)?;
        let node = self.get_mut(existing)?;
        node.nlink += 1;
        node.touch_ctime();
        debug!(parent = parent.0, name, id = existing.0, nlink = node.nlink, "created hard link");
        Ok(())
    }

    /// Drops one link from `id`, destroying it when nothing references it anymore.
    fn drop_link(&mut self, id: NodeId) -> Result<Unlinked, ErrorKind> {
        let node = self.get_mut(id)?;
        node.nlink = node.nlink.saturating_sub(1);
        node.touch_ctime();
        if node.nlink == 0 && node.open_handles == 0 {
            self.nodes.remove(&id);
            Ok(Unlinked::Destroyed)
        } else {
            if node.nlink == 0 {
                debug!(id = id.0, handles = node.open_handles, "deferring destruction until last close");
            }
            Ok(Unlinked::Retained)
        }
    }

    fn remove_entry(&mut self, parent: NodeId, name: &str) -> Result<NodeId, ErrorKind> {
        let key = self.os.fold_name(name).into_owned();
        let entry = self
            .entries_mut(parent)?
            .remove(&key)
            .ok_or(ErrorKind::NoSuchFileOrDir)?;
        self.get_mut(parent)?.touch();
        Ok(entry.id)
    }

    /// Removes a non-directory entry.
    pub fn unlink(&mut self, parent: NodeId, name: &str) -> Result<Unlinked, ErrorKind> {
        let id = self.lookup(parent, name)?.ok_or(ErrorKind::NoSuchFileOrDir)?;
        if self.get(id)?.is_dir() {
            return Err(ErrorKind::IsADirectory);
        }
        self.remove_entry(parent, name)?;
        let outcome = self.drop_link(id)?;
        debug!(parent = parent.0, name, id = id.0, ?outcome, "unlinked");
        Ok(outcome)
    }

    /// Removes an empty directory entry.
    pub fn rmdir(&mut self, parent: NodeId, name: &str) -> Result<Unlinked, ErrorKind> {
        let id = self.lookup(parent, name)?.ok_or(ErrorKind::NoSuchFileOrDir)?;
        if !self.entries(id)?.is_empty() {
            return Err(ErrorKind::DirectoryNotEmpty);
        }
        self.remove_entry(parent, name)?;
        let outcome = self.drop_link(id)?;
        debug!(parent = parent.0, name, id = id.0, "removed directory");
        Ok(outcome)
    }

    /// Moves an entry, replacing a compatible destination. All checks run
    /// before the first mutation.
    pub fn rename(
        &mut self,
        src_parent: NodeId,
        src_name: &str,
        dst_parent: NodeId,
        dst_name: &str,
    ) -> Result<(), ErrorKind> {
        let src = self.lookup(src_parent, src_name)?.ok_or(ErrorKind::NoSuchFileOrDir)?;
        self.ensure_live_dir(dst_parent)?;
        let src_is_dir = self.get(src)?.is_dir();
        let dst = self.lookup(dst_parent, dst_name)?;

        if src_is_dir && self.is_ancestor(src, dst_parent)? {
            return Err(ErrorKind::InvalidArgument);
        }

        if let Some(dst) = dst {
            if dst == src {
                // Same entry with a different spelling: only the display name changes.
                if src_parent == dst_parent && src_name != dst_name {
                    let key = self.os.fold_name(dst_name).into_owned();
                    if let Some(entry) = self.entries_mut(dst_parent)?.get_mut(&key) {
                        entry.name = dst_name.to_string();
                    }
                }
                return Ok(());
            }
            let dst_node = self.get(dst)?;
            match (src_is_dir, dst_node.is_dir()) {
                (true, false) => return Err(ErrorKind::NotADirectory),
                (false, true) => return Err(ErrorKind::IsADirectory),
                (true, true) if !self.entries(dst)?.is_empty() => {
                    return Err(ErrorKind::DirectoryNotEmpty)
                }
                _ => {}
            }
            self.remove_entry(dst_parent, dst_name)?;
            self.drop_link(dst)?;
        }

        self.remove_entry(src_parent, src_name)?;
        self.link_entry(dst_parent, dst_name, src)?;
        let node = self.get_mut(src)?;
        node.touch_ctime();
        if let NodeKind::Directory { parent, .. } = &mut node.kind {
            *parent = Some(dst_parent);
        }
        debug!(src = src.0, src_parent = src_parent.0, dst_parent = dst_parent.0, dst_name, "renamed");
        Ok(())
    }

    /// Entries of `dir`, sorted by name.
    pub fn readdir(&self, dir: NodeId) -> Result<Vec<DirEntry>, ErrorKind> {
        self.entries(dir)?
            .values()
            .map(|entry| {
                Ok(DirEntry {
                    name: entry.name.clone(),
                    file_type: self.get(entry.id)?.file_type(),
                    ino: entry.id.0,
                })
            })
            .collect()
    }

    /// Drops an open-handle reference, destroying the node if it was already unlinked.
    pub fn release(&mut self, id: NodeId) -> Result<Unlinked, ErrorKind> {
        let node = self.get_mut(id)?;
        node.open_handles = node.open_handles.saturating_sub(1);
        if node.nlink == 0 && node.open_handles == 0 {
            self.nodes.remove(&id);
            debug!(id = id.0, "destroyed unlinked node on last close");
            Ok(Unlinked::Destroyed)
        } else {
            Ok(Unlinked::Retained)
        }
    }
}
