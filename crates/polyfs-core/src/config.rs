// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Construction-time configuration of a filesystem instance

use serde::{Deserialize, Serialize};

use crate::features::Features;
use crate::os::OsType;

/// Umask applied by a fresh instance.
pub const DEFAULT_UMASK: u32 = 0o022;

/// Configuration consumed by [`crate::MemFs::new`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FsConfig {
    /// Emulated operating system.
    pub os_type: OsType,
    /// Requested capabilities. Bits the backend cannot honour are dropped.
    pub features: Features,
    /// Initial creation mask.
    pub umask: u32,
    /// User the first view runs as; the identity manager's current user if unset.
    pub initial_user: Option<String>,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            os_type: OsType::default(),
            features: Features::SYMLINK
                | Features::HARDLINK
                | Features::CHROOT
                | Features::IDENTITY_MGR,
            umask: DEFAULT_UMASK,
            initial_user: None,
        }
    }
}

impl FsConfig {
    pub fn with_os_type(mut self, os_type: OsType) -> Self {
        self.os_type = os_type;
        self
    }

    pub fn with_features(mut self, features: Features) -> Self {
        self.features = features;
        self
    }

    pub fn with_umask(mut self, umask: u32) -> Self {
        self.umask = umask;
        self
    }

    pub fn with_initial_user(mut self, name: impl Into<String>) -> Self {
        self.initial_user = Some(name.into());
        self
    }
}
