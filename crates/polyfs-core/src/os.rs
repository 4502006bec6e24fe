// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Emulated operating system conventions: separators, volumes, case folding
//! and lexical path manipulation.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;

/// Operating system a filesystem instance emulates.
///
/// Selected once at construction; drives path syntax, name comparison and the
/// error tables used when rendering failures.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsType {
    /// Case-sensitive names, `/` separator, single root.
    #[default]
    Linux,
    /// Case-insensitive names, `\` separator, `C:` volume.
    Windows,
}

/// A path broken into its volume, rootedness and non-empty segments.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathParts<'a> {
    pub volume: &'a str,
    pub absolute: bool,
    pub segments: Vec<&'a str>,
}

impl OsType {
    /// Volume of the emulated Windows tree.
    pub const SYSTEM_VOLUME: &'static str = "C:";

    pub fn host() -> Self {
        if cfg!(windows) {
            OsType::Windows
        } else {
            OsType::Linux
        }
    }

    pub fn separator(self) -> char {
        match self {
            OsType::Linux => '/',
            OsType::Windows => '\\',
        }
    }

    pub fn is_separator(self, c: char) -> bool {
        match self {
            OsType::Linux => c == '/',
            OsType::Windows => c == '\\' || c == '/',
        }
    }

    pub fn case_sensitive(self) -> bool {
        self == OsType::Linux
    }

    /// Key under which a directory entry name is stored and looked up.
    pub fn fold_name<'a>(self, name: &'a str) -> Cow<'a, str> {
        if self.case_sensitive() {
            Cow::Borrowed(name)
        } else {
            Cow::Owned(name.to_lowercase())
        }
    }

    /// Textual root of the emulated tree.
    pub fn root(self) -> &'static str {
        match self {
            OsType::Linux => "/",
            OsType::Windows => "C:\\",
        }
    }

    /// Leading volume name (`C:`), empty on Linux.
    pub fn volume_name(self, path: &str) -> &str {
        if self == OsType::Linux {
            return "";
        }
        let bytes = path.as_bytes();
        if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
            &path[..2]
        } else {
            ""
        }
    }

    /// Whether `volume` names the emulated system volume.
    pub fn is_system_volume(self, volume: &str) -> bool {
        volume.is_empty() || volume.eq_ignore_ascii_case(Self::SYSTEM_VOLUME)
    }

    pub fn is_abs(self, path: &str) -> bool {
        let rest = &path[self.volume_name(path).len()..];
        rest.chars().next().is_some_and(|c| self.is_separator(c))
    }

    pub fn parts(self, path: &str) -> PathParts<'_> {
        let volume = self.volume_name(path);
        let rest = &path[volume.len()..];
        let absolute = rest.chars().next().is_some_and(|c| self.is_separator(c));
        let segments = rest
            .split(|c| self.is_separator(c))
            .filter(|s| !s.is_empty())
            .collect();
        PathParts {
            volume,
            absolute,
            segments,
        }
    }

    /// Lexically shortest equivalent of `path`.
    ///
    /// `..` directly under the root is dropped, so a cleaned rooted path never
    /// climbs above its root.
    pub fn clean(self, path: &str) -> String {
        let parts = self.parts(path);
        let mut out: Vec<&str> = Vec::with_capacity(parts.segments.len());
        for seg in parts.segments {
            match seg {
                "." => {}
                ".." => match out.last() {
                    Some(&last) if last != ".." => {
                        out.pop();
                    }
                    _ if parts.absolute => {}
                    _ => out.push(".."),
                },
                _ => out.push(seg),
            }
        }

        let sep = self.separator();
        let mut cleaned = String::with_capacity(path.len());
        cleaned.push_str(parts.volume);
        if parts.absolute {
            cleaned.push(sep);
        }
        cleaned.push_str(&out.join(&sep.to_string()));
        if cleaned.len() == parts.volume.len() {
            cleaned.push('.');
        }
        cleaned
    }

    /// Joins non-empty elements with the separator and cleans the result.
    pub fn join<S: AsRef<str>>(self, elems: &[S]) -> String {
        let kept: Vec<&str> = elems.iter().map(AsRef::as_ref).filter(|e| !e.is_empty()).collect();
        if kept.is_empty() {
            return String::new();
        }
        self.clean(&kept.join(&self.separator().to_string()))
    }

    fn last_separator(self, path: &str) -> Option<usize> {
        path.char_indices().rev().find(|(_, c)| self.is_separator(*c)).map(|(i, _)| i)
    }

    /// Last element of `path`.
    pub fn base(self, path: &str) -> String {
        if path.is_empty() {
            return ".".to_string();
        }
        let trimmed = path.trim_end_matches(|c| self.is_separator(c));
        let trimmed = &trimmed[self.volume_name(trimmed).len()..];
        if trimmed.is_empty() {
            return self.separator().to_string();
        }
        match self.last_separator(trimmed) {
            Some(i) => trimmed[i + 1..].to_string(),
            None => trimmed.to_string(),
        }
    }

    /// All but the last element of `path`, cleaned.
    pub fn dir(self, path: &str) -> String {
        let volume = self.volume_name(path);
        let rest = &path[volume.len()..];
        let dir = match self.last_separator(rest) {
            Some(i) => self.clean(&rest[..=i]),
            None => self.clean(""),
        };
        format!("{volume}{dir}")
    }

    /// Splits `path` after its final separator.
    pub fn split(self, path: &str) -> (String, String) {
        let volume = self.volume_name(path);
        let rest = &path[volume.len()..];
        match self.last_separator(rest) {
            Some(i) => (format!("{volume}{}", &rest[..=i]), rest[i + 1..].to_string()),
            None => (volume.to_string(), rest.to_string()),
        }
    }

    /// Whether `name` can be stored as a directory entry.
    pub fn valid_name(self, name: &str) -> bool {
        if name.is_empty() || name == "." || name == ".." || name.contains('\0') {
            return false;
        }
        match self {
            OsType::Linux => !name.contains('/'),
            OsType::Windows => !name.contains(['\\', '/', ':', '*', '?', '"', '<', '>', '|']),
        }
    }
}

impl std::fmt::Display for OsType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OsType::Linux => write!(f, "linux"),
            OsType::Windows => write!(f, "windows"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_linux() {
        let os = OsType::Linux;
        assert_eq!(os.clean(""), ".");
        assert_eq!(os.clean("/"), "/");
        assert_eq!(os.clean("/a/b/../c/./d/"), "/a/c/d");
        assert_eq!(os.clean("/../../etc"), "/etc");
        assert_eq!(os.clean("a/../../b"), "../b");
        assert_eq!(os.clean("//a//b"), "/a/b");
    }

    #[test]
    fn test_clean_windows() {
        let os = OsType::Windows;
        assert_eq!(os.clean("C:\\Users\\..\\Windows"), "C:\\Windows");
        assert_eq!(os.clean("C:/a/b"), "C:\\a\\b");
        assert_eq!(os.clean("C:"), "C:.");
        assert_eq!(os.clean("\\a\\.\\b"), "\\a\\b");
    }

    #[test]
    fn test_base_dir_split() {
        let os = OsType::Linux;
        assert_eq!(os.base("/a/b/c"), "c");
        assert_eq!(os.base("/a/b/"), "b");
        assert_eq!(os.base("/"), "/");
        assert_eq!(os.base(""), ".");
        assert_eq!(os.dir("/a/b/c"), "/a/b");
        assert_eq!(os.dir("c"), ".");
        assert_eq!(os.dir("/c"), "/");
        assert_eq!(os.split("/a/b"), ("/a/".to_string(), "b".to_string()));

        let win = OsType::Windows;
        assert_eq!(win.base("C:\\a\\b"), "b");
        assert_eq!(win.dir("C:\\a\\b"), "C:\\a");
    }

    #[test]
    fn test_parts_and_abs() {
        let win = OsType::Windows;
        let parts = win.parts("c:\\Users\\bob");
        assert_eq!(parts.volume, "c:");
        assert!(parts.absolute);
        assert_eq!(parts.segments, vec!["Users", "bob"]);
        assert!(win.is_abs("C:\\x"));
        assert!(!win.is_abs("x\\y"));
        assert!(win.is_system_volume("c:"));
        assert!(!win.is_system_volume("D:"));

        assert!(OsType::Linux.is_abs("/x"));
        assert_eq!(OsType::Linux.volume_name("C:/x"), "");
    }

    #[test]
    fn test_fold_and_valid_name() {
        assert_eq!(OsType::Windows.fold_name("ReadMe.TXT"), "readme.txt");
        assert_eq!(OsType::Linux.fold_name("ReadMe.TXT"), "ReadMe.TXT");
        assert!(OsType::Linux.valid_name("a:b"));
        assert!(!OsType::Windows.valid_name("a:b"));
        assert!(!OsType::Linux.valid_name(".."));
    }
}
