//! Mapping between the app's per-category storage layout and the
//! `apps/<package>/<token>/...` tree used inside an Android backup.

use crate::{Error, Result};
use std::fmt;

pub const APPS_PREFIX: &str = "apps/";
pub const MANIFEST_FILENAME: &str = "_manifest";

pub const APK_TREE_TOKEN: &str = "a";
pub const OBB_TREE_TOKEN: &str = "obb";
pub const MANAGED_EXTERNAL_TREE_TOKEN: &str = "ef";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Category {
    Source,
    InternalCe,
    InternalDe,
    External,
    Obb,
    Unknown,
}

impl Category {
    /// Every category that can hold data, in packing order.
    pub const DATA: [Category; 5] = [
        Category::Source,
        Category::InternalCe,
        Category::InternalDe,
        Category::External,
        Category::Obb,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Category::Source => "source",
            Category::InternalCe => "internal-ce",
            Category::InternalDe => "internal-de",
            Category::External => "external",
            Category::Obb => "obb",
            Category::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Subtrees of an app's internal data directory that get their own token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InternalTree {
    Root,
    Files,
    Databases,
    SharedPrefs,
    NoBackup,
    Caches,
}

impl InternalTree {
    const NAMED: [InternalTree; 5] = [
        InternalTree::Files,
        InternalTree::Databases,
        InternalTree::SharedPrefs,
        InternalTree::NoBackup,
        InternalTree::Caches,
    ];

    /// Directory name on the storage side; `None` for the root.
    pub fn dir_name(self) -> Option<&'static str> {
        match self {
            InternalTree::Root => None,
            InternalTree::Files => Some("files"),
            InternalTree::Databases => Some("databases"),
            InternalTree::SharedPrefs => Some("shared_prefs"),
            InternalTree::NoBackup => Some("no_backup"),
            InternalTree::Caches => Some("caches"),
        }
    }

    /// Token on the backup side, credential-encrypted or device-encrypted copy.
    pub fn token(self, device: bool) -> &'static str {
        match (self, device) {
            (InternalTree::Root, false) => "r",
            (InternalTree::Root, true) => "d_r",
            (InternalTree::Files, false) => "f",
            (InternalTree::Files, true) => "d_f",
            (InternalTree::Databases, false) => "db",
            (InternalTree::Databases, true) => "d_db",
            (InternalTree::SharedPrefs, false) => "sp",
            (InternalTree::SharedPrefs, true) => "d_sp",
            (InternalTree::NoBackup, false) => "nb",
            (InternalTree::NoBackup, true) => "d_nb",
            (InternalTree::Caches, false) => "c",
            (InternalTree::Caches, true) => "d_c",
        }
    }

    fn from_token(token: &str) -> Option<(InternalTree, bool)> {
        let (bare, device) = match token.strip_prefix("d_") {
            Some(bare) => (bare, true),
            None => (token, false),
        };
        let tree = match bare {
            "r" => InternalTree::Root,
            "f" => InternalTree::Files,
            "db" => InternalTree::Databases,
            "sp" => InternalTree::SharedPrefs,
            "nb" => InternalTree::NoBackup,
            "c" => InternalTree::Caches,
            _ => return None,
        };
        Some((tree, device))
    }

    /// Splits an internal path into its subtree and the remainder.
    fn split(path: &str) -> (InternalTree, &str) {
        for tree in Self::NAMED {
            if let Some(dir) = tree.dir_name() {
                if let Some(rest) = path.strip_prefix(dir).and_then(|r| r.strip_prefix('/')) {
                    return (tree, rest);
                }
            }
        }
        (InternalTree::Root, path)
    }
}

/// What an entry path inside the backup turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchivePath {
    /// The `_manifest` control record.
    Manifest,
    /// A data entry; `Unknown` when the leading token is not recognised, in
    /// which case `internal_path` is the path below the package prefix as-is.
    Data { category: Category, internal_path: String },
}

/// Bidirectional path mapping for one package.
#[derive(Debug, Clone)]
pub struct PathMapper {
    prefix: String,
}

impl PathMapper {
    pub fn new(package: &str) -> Self {
        Self {
            prefix: format!("{}{}/", APPS_PREFIX, package),
        }
    }

    /// `apps/<package>/`
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn manifest_path(&self) -> String {
        format!("{}{}", self.prefix, MANIFEST_FILENAME)
    }

    /// Rewrites a storage-side path into its backup-side form.
    pub fn to_archive_path(&self, category: Category, internal_path: &str) -> Result<String> {
        let path = internal_path.trim_end_matches('/');
        let (token, rest) = match category {
            Category::Source => (APK_TREE_TOKEN, path),
            Category::External => (MANAGED_EXTERNAL_TREE_TOKEN, path),
            Category::Obb => (OBB_TREE_TOKEN, path),
            Category::InternalCe | Category::InternalDe => {
                let (tree, rest) = InternalTree::split(path);
                (tree.token(category == Category::InternalDe), rest)
            }
            Category::Unknown => return Err(Error::InvalidCategory(category)),
        };
        if rest.is_empty() {
            Ok(format!("{}{}", self.prefix, token))
        } else {
            Ok(format!("{}{}/{}", self.prefix, token, rest))
        }
    }

    /// Classifies a backup-side path and recovers its storage-side form.
    /// `None` when the path is not under this package's prefix.
    pub fn from_archive_path(&self, archive_path: &str) -> Option<ArchivePath> {
        let relative = archive_path.strip_prefix(&self.prefix)?;
        Some(classify_relative(relative))
    }
}

/// Classifies a path that already had `apps/<package>/` removed.
pub fn classify_relative(relative: &str) -> ArchivePath {
    let relative = relative.trim_end_matches('/');
    if relative == MANIFEST_FILENAME {
        return ArchivePath::Manifest;
    }
    let (token, rest) = relative.split_once('/').unwrap_or((relative, ""));
    let category = match token {
        APK_TREE_TOKEN => Category::Source,
        OBB_TREE_TOKEN => Category::Obb,
        MANAGED_EXTERNAL_TREE_TOKEN => Category::External,
        _ => match InternalTree::from_token(token) {
            Some((tree, device)) => {
                let category = if device { Category::InternalDe } else { Category::InternalCe };
                let internal_path = match tree.dir_name() {
                    Some(dir) if rest.is_empty() => dir.to_string(),
                    Some(dir) => format!("{}/{}", dir, rest),
                    None => rest.to_string(),
                };
                return ArchivePath::Data { category, internal_path };
            }
            None => {
                return ArchivePath::Data {
                    category: Category::Unknown,
                    internal_path: relative.to_string(),
                };
            }
        },
    };
    ArchivePath::Data {
        category,
        internal_path: rest.to_string(),
    }
}
