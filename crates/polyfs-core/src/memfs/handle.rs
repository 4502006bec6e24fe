// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Open file handles and cursor-based I/O

use std::sync::atomic::Ordering;

use tracing::debug;

use crate::error::{ErrorKind, FsError, FsResult};
use crate::types::{FileInfo, HandleId, OpenFlags, SeekFrom};

use super::node::{resize_content, NodeId, NodeKind, NodeStore};
use super::perm::{READ, WRITE};
use super::resolve::Resolved;
use super::{MemFs, View};

/// Per-open state. Holds a reference on the node, not on its directory entry.
#[derive(Debug)]
pub(crate) struct OpenFile {
    pub node: NodeId,
    pub flags: OpenFlags,
    pub offset: u64,
    /// Path the handle was opened with, for diagnostics.
    pub path: String,
}

fn to_index(value: u64) -> Result<usize, ErrorKind> {
    usize::try_from(value).map_err(|_| ErrorKind::InvalidArgument)
}

fn read_node(store: &NodeStore, id: NodeId, buf: &mut [u8], offset: u64) -> Result<usize, ErrorKind> {
    match &store.get(id)?.kind {
        NodeKind::File { data } => {
            let start = to_index(offset)?;
            if start >= data.len() {
                return Ok(0);
            }
            let n = buf.len().min(data.len() - start);
            buf[..n].copy_from_slice(&data[start..start + n]);
            Ok(n)
        }
        NodeKind::Directory { .. } => Err(ErrorKind::IsADirectory),
        NodeKind::Symlink { .. } => Err(ErrorKind::InvalidArgument),
    }
}

/// Writes `bytes` at `offset`, zero-filling any gap. Returns the end offset.
fn write_node(store: &mut NodeStore, id: NodeId, bytes: &[u8], offset: u64) -> Result<u64, ErrorKind> {
    let node = store.get_mut(id)?;
    let NodeKind::File { data } = &mut node.kind else {
        return Err(ErrorKind::IsADirectory);
    };
    let start = to_index(offset)?;
    let end = start.checked_add(bytes.len()).ok_or(ErrorKind::InvalidArgument)?;
    if data.len() < end {
        resize_content(data, end)?;
    }
    data[start..end].copy_from_slice(bytes);
    node.touch();
    Ok(end as u64)
}

impl MemFs {
    /// Opens `path` with `flags`, creating it with `perm` (minus umask) when
    /// `CREATE` is set and it does not exist.
    pub fn open_file(&self, path: &str, flags: OpenFlags, perm: u32) -> FsResult<HandleId> {
        const OP: &str = "open";
        if !flags.intersects(OpenFlags::READ | OpenFlags::WRITE | OpenFlags::APPEND) {
            return Err(self.err(OP, path, ErrorKind::InvalidArgument));
        }
        if flags.is_write() || flags.intersects(OpenFlags::CREATE | OpenFlags::TRUNCATE) {
            self.ensure_writable(OP, path)?;
        }

        let view = self.snapshot();
        let mut tree = self.shared.tree.write();
        let id = self
            .open_node(&mut tree, &view, path, flags, perm)
            .map_err(|k| self.err(OP, path, k))?;
        let node = tree.get_mut(id).map_err(|k| self.err(OP, path, k))?;
        node.open_handles += 1;
        let offset = if flags.contains(OpenFlags::APPEND) { node.size() } else { 0 };

        let handle = HandleId::new(self.shared.next_handle.fetch_add(1, Ordering::Relaxed));
        self.shared.handles.lock().insert(
            handle,
            OpenFile {
                node: id,
                flags,
                offset,
                path: path.to_string(),
            },
        );
        debug!(path, %handle, node = id.0, ?flags, "opened");
        Ok(handle)
    }

    /// Opens an existing file for reading.
    pub fn open(&self, path: &str) -> FsResult<HandleId> {
        self.open_file(path, OpenFlags::READ, 0)
    }

    /// Creates or truncates `path` and opens it for reading and writing.
    pub fn create(&self, path: &str) -> FsResult<HandleId> {
        self.open_file(
            path,
            OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
            0o666,
        )
    }

    /// Resolves or creates the node an open refers to and checks access.
    pub(super) fn open_node(
        &self,
        tree: &mut NodeStore,
        view: &View,
        path: &str,
        flags: OpenFlags,
        perm: u32,
    ) -> Result<NodeId, ErrorKind> {
        let caller = self.caller(&view.user);
        let resolved = self.walk(tree, &caller, view).resolve(path, true)?;
        let id = match resolved {
            Resolved::Missing { parent, name } => {
                if !flags.contains(OpenFlags::CREATE) {
                    return Err(ErrorKind::NoSuchFileOrDir);
                }
                self.check_name(&name)?;
                caller.check_dir_write(tree.get(parent)?)?;
                return tree.create_regular(parent, &name, self.creation_mode(perm), caller.uid(), caller.gid());
            }
            Resolved::Found { id, .. } => id,
        };

        if flags.contains(OpenFlags::CREATE | OpenFlags::EXCL) {
            return Err(ErrorKind::AlreadyExists);
        }
        let node = tree.get(id)?;
        if node.is_dir() && flags.is_write() {
            return Err(ErrorKind::IsADirectory);
        }
        let mut want = 0;
        if flags.contains(OpenFlags::READ) {
            want |= READ;
        }
        if flags.is_write() {
            want |= WRITE;
        }
        caller.check(node, want)?;

        if flags.contains(OpenFlags::TRUNCATE) && flags.is_write() {
            tree.get_mut(id)?.set_len(0)?;
        }
        Ok(id)
    }

    fn bad_handle(&self, op: &'static str, handle: HandleId) -> FsError {
        self.err(op, &handle.to_string(), ErrorKind::BadFileDescriptor)
    }

    /// Reads at the cursor and advances it. Returns 0 at end of file.
    pub fn read(&self, handle: HandleId, buf: &mut [u8]) -> FsResult<usize> {
        const OP: &str = "read";
        let tree = self.shared.tree.read();
        let mut handles = self.shared.handles.lock();
        let file = handles.get_mut(&handle).ok_or_else(|| self.bad_handle(OP, handle))?;
        if !file.flags.contains(OpenFlags::READ) {
            return Err(self.err(OP, &file.path, ErrorKind::BadFileDescriptor));
        }
        let n = read_node(&tree, file.node, buf, file.offset).map_err(|k| self.err(OP, &file.path, k))?;
        file.offset += n as u64;
        Ok(n)
    }

    /// Reads at `offset` without moving the cursor.
    pub fn read_at(&self, handle: HandleId, buf: &mut [u8], offset: i64) -> FsResult<usize> {
        const OP: &str = "read";
        let tree = self.shared.tree.read();
        let handles = self.shared.handles.lock();
        let file = handles.get(&handle).ok_or_else(|| self.bad_handle(OP, handle))?;
        if !file.flags.contains(OpenFlags::READ) {
            return Err(self.err(OP, &file.path, ErrorKind::BadFileDescriptor));
        }
        let offset = u64::try_from(offset).map_err(|_| self.err(OP, &file.path, ErrorKind::NegativeOffset))?;
        read_node(&tree, file.node, buf, offset).map_err(|k| self.err(OP, &file.path, k))
    }

    /// Writes at the cursor (at end of file in append mode) and advances it.
    pub fn write(&self, handle: HandleId, data: &[u8]) -> FsResult<usize> {
        const OP: &str = "write";
        let mut tree = self.shared.tree.write();
        let mut handles = self.shared.handles.lock();
        let file = handles.get_mut(&handle).ok_or_else(|| self.bad_handle(OP, handle))?;
        if !file.flags.is_write() {
            return Err(self.err(OP, &file.path, ErrorKind::BadFileDescriptor));
        }
        let offset = if file.flags.contains(OpenFlags::APPEND) {
            tree.get(file.node).map_err(|k| self.err(OP, &file.path, k))?.size()
        } else {
            file.offset
        };
        file.offset = write_node(&mut tree, file.node, data, offset).map_err(|k| self.err(OP, &file.path, k))?;
        Ok(data.len())
    }

    /// Writes at `offset` without moving the cursor. Not allowed in append mode.
    pub fn write_at(&self, handle: HandleId, data: &[u8], offset: i64) -> FsResult<usize> {
        const OP: &str = "write";
        let mut tree = self.shared.tree.write();
        let handles = self.shared.handles.lock();
        let file = handles.get(&handle).ok_or_else(|| self.bad_handle(OP, handle))?;
        if !file.flags.is_write() {
            return Err(self.err(OP, &file.path, ErrorKind::BadFileDescriptor));
        }
        if file.flags.contains(OpenFlags::APPEND) {
            return Err(self.err(OP, &file.path, ErrorKind::InvalidArgument));
        }
        let offset = u64::try_from(offset).map_err(|_| self.err(OP, &file.path, ErrorKind::NegativeOffset))?;
        write_node(&mut tree, file.node, data, offset).map_err(|k| self.err(OP, &file.path, k))?;
        Ok(data.len())
    }

    /// Moves the cursor; a resulting negative position fails `NegativeOffset`.
    pub fn seek(&self, handle: HandleId, pos: SeekFrom) -> FsResult<u64> {
        const OP: &str = "seek";
        let tree = self.shared.tree.read();
        let mut handles = self.shared.handles.lock();
        let file = handles.get_mut(&handle).ok_or_else(|| self.bad_handle(OP, handle))?;
        let size = tree.get(file.node).map_err(|k| self.err(OP, &file.path, k))?.size();

        let invalid = || self.err(OP, &file.path, ErrorKind::InvalidArgument);
        let target = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::Current(n) => i64::try_from(file.offset).map_err(|_| invalid())?.checked_add(n),
            SeekFrom::End(n) => i64::try_from(size).map_err(|_| invalid())?.checked_add(n),
        }
        .ok_or_else(invalid)?;

        let offset = u64::try_from(target).map_err(|_| self.err(OP, &file.path, ErrorKind::NegativeOffset))?;
        file.offset = offset;
        Ok(offset)
    }

    pub fn truncate(&self, handle: HandleId, size: i64) -> FsResult<()> {
        const OP: &str = "truncate";
        let mut tree = self.shared.tree.write();
        let handles = self.shared.handles.lock();
        let file = handles.get(&handle).ok_or_else(|| self.bad_handle(OP, handle))?;
        if !file.flags.is_write() {
            return Err(self.err(OP, &file.path, ErrorKind::BadFileDescriptor));
        }
        let len = usize::try_from(size).map_err(|_| self.err(OP, &file.path, ErrorKind::InvalidArgument))?;
        tree.get_mut(file.node)
            .and_then(|node| node.set_len(len))
            .map_err(|k| self.err(OP, &file.path, k))
    }

    /// Releases the handle. Destroys the node if this was the last reference
    /// to an already unlinked file.
    pub fn close(&self, handle: HandleId) -> FsResult<()> {
        const OP: &str = "close";
        let mut tree = self.shared.tree.write();
        let file = self
            .shared
            .handles
            .lock()
            .remove(&handle)
            .ok_or_else(|| self.bad_handle(OP, handle))?;
        tree.release(file.node).map_err(|k| self.err(OP, &file.path, k))?;
        debug!(path = %file.path, %handle, "closed");
        Ok(())
    }

    pub fn handle_stat(&self, handle: HandleId) -> FsResult<FileInfo> {
        const OP: &str = "stat";
        let tree = self.shared.tree.read();
        let handles = self.shared.handles.lock();
        let file = handles.get(&handle).ok_or_else(|| self.bad_handle(OP, handle))?;
        let node = tree.get(file.node).map_err(|k| self.err(OP, &file.path, k))?;
        Ok(node.info(file.node, self.shared.os.base(&file.path)))
    }
}
