// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Capability bitmask attached to every filesystem instance

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Optional capabilities of a filesystem instance, fixed at construction.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Features: u32 {
        /// Symbolic links can be created and are followed during resolution.
        const SYMLINK      = 1 << 0;
        /// Regular files can be hard linked.
        const HARDLINK     = 1 << 1;
        /// A view can be confined below a directory with `chroot`.
        const CHROOT       = 1 << 2;
        /// Ownership and the current user come from an identity manager.
        const IDENTITY_MGR = 1 << 3;
        /// Every mutating call is rejected.
        const READ_ONLY    = 1 << 4;
        /// Standard system directories exist from construction.
        const MAIN_DIRS    = 1 << 5;
        /// Calls are served by the host operating system.
        const REAL_FS      = 1 << 6;
    }
}

impl Features {
    const NAMES: [(Features, &'static str); 7] = [
        (Features::SYMLINK, "Symlink"),
        (Features::HARDLINK, "Hardlink"),
        (Features::CHROOT, "Chroot"),
        (Features::IDENTITY_MGR, "IdentityMgr"),
        (Features::READ_ONLY, "ReadOnly"),
        (Features::MAIN_DIRS, "MainDirs"),
        (Features::REAL_FS, "RealFs"),
    ];
}

impl std::fmt::Display for Features {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "Feature({})", names.join("|"))
    }
}
