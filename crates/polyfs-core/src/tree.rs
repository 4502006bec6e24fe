// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! `tree -pug` style rendering of any backend

use std::collections::HashMap;

use crate::backend::FileSystem;
use crate::error::FsResult;
use crate::types::FileInfo;

/// Counts gathered while rendering; the starting directory is not included.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TreeStats {
    pub dirs: usize,
    pub files: usize,
}

struct Renderer<'a, F: ?Sized> {
    fs: &'a F,
    users: HashMap<u32, String>,
    groups: HashMap<u32, String>,
    stats: TreeStats,
}

impl<F: FileSystem + ?Sized> Renderer<'_, F> {
    fn owner(&mut self, uid: u32) -> String {
        let idm = self.fs.idm();
        self.users
            .entry(uid)
            .or_insert_with(|| {
                idm.lookup_user_by_id(uid)
                    .map(|u| u.name().to_string())
                    .unwrap_or_else(|_| uid.to_string())
            })
            .clone()
    }

    fn group(&mut self, gid: u32) -> String {
        let idm = self.fs.idm();
        self.groups
            .entry(gid)
            .or_insert_with(|| {
                idm.lookup_group_by_id(gid)
                    .map(|g| g.name().to_string())
                    .unwrap_or_else(|_| gid.to_string())
            })
            .clone()
    }

    fn label(&mut self, info: &FileInfo) -> String {
        let sys = info.sys();
        format!(
            "[{} {:<8} {:<8}]",
            info.mode(),
            self.owner(sys.uid),
            self.group(sys.gid)
        )
    }

    fn walk(&mut self, dir: &str, prefix: &str, out: &mut String) {
        let entries = match self.fs.read_dir(dir) {
            Ok(entries) => entries,
            Err(_) => {
                out.push_str(prefix);
                out.push_str("    [error opening dir]\n");
                return;
            }
        };

        let count = entries.len();
        for (i, entry) in entries.into_iter().enumerate() {
            let last = i + 1 == count;
            let path = self.fs.join(&[dir, entry.name.as_str()]);
            let branch = if last { "└── " } else { "├── " };

            let Ok(info) = self.fs.lstat(&path) else {
                out.push_str(&format!("{prefix}{branch}{}\n", entry.name));
                continue;
            };
            let label = self.label(&info);
            let mut line = format!("{prefix}{branch}{label}  {}", entry.name);
            if info.mode().is_symlink() {
                if let Ok(target) = self.fs.read_link(&path) {
                    line.push_str(" -> ");
                    line.push_str(&target);
                }
            }
            line.push('\n');
            out.push_str(&line);

            if info.is_dir() {
                self.stats.dirs += 1;
                let child_prefix = format!("{prefix}{}", if last { "    " } else { "│   " });
                self.walk(&path, &child_prefix, out);
            } else {
                self.stats.files += 1;
            }
        }
    }
}

/// Appends a rendering of the tree below `path` to `out`.
///
/// Symlinks are shown with their target and never descended into. Directories
/// that cannot be listed are marked inline rather than aborting the walk.
pub fn render<F: FileSystem + ?Sized>(fs: &F, path: &str, out: &mut String) -> FsResult<TreeStats> {
    let root = fs.stat(path)?;
    let mut renderer = Renderer {
        fs,
        users: HashMap::new(),
        groups: HashMap::new(),
        stats: TreeStats::default(),
    };
    let label = renderer.label(&root);
    out.push_str(&format!("{label}  {path}\n"));
    if root.is_dir() {
        renderer.walk(path, "", out);
    }

    let stats = renderer.stats;
    let dirs = if stats.dirs == 1 { "directory" } else { "directories" };
    let files = if stats.files == 1 { "file" } else { "files" };
    out.push_str(&format!("\n{} {dirs}, {} {files}\n", stats.dirs, stats.files));
    Ok(stats)
}
