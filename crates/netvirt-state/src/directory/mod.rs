//! Coordination-service contract.
//!
//! Topology state lives in an ordered hierarchical namespace (ZooKeeper
//! style): slash-separated paths, each node carrying opaque data and a
//! version, and a `multi` primitive that commits a batch of operations
//! atomically or not at all. [`Directory`] is the narrow seam this crate
//! consumes; [`MemoryDirectory`] implements it in-process.

mod memory;

pub use memory::MemoryDirectory;

use crate::error::Result;
use async_trait::async_trait;
use std::collections::BTreeSet;

/// Node version as reported by the coordination service.
pub type Version = u32;

/// Lifetime of a created node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CreateMode {
    /// Survives the creating session.
    Persistent,
    /// Removed when the creating session ends. Cannot have children.
    Ephemeral,
}

/// One constituent of an atomic [`Directory::multi`] batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Create {
        path: String,
        data: Vec<u8>,
        mode: CreateMode,
    },
    /// `version: None` deletes regardless of the current version.
    Delete {
        path: String,
        version: Option<Version>,
    },
    SetData {
        path: String,
        data: Vec<u8>,
        version: Option<Version>,
    },
    /// Fails the batch unless `path` exists at exactly `version`.
    Check { path: String, version: Version },
}

impl Op {
    pub fn create(path: impl Into<String>, data: Vec<u8>, mode: CreateMode) -> Self {
        Op::Create {
            path: path.into(),
            data,
            mode,
        }
    }

    /// Persistent node without data, the shape of every container node.
    pub fn create_container(path: impl Into<String>) -> Self {
        Self::create(path, Vec::new(), CreateMode::Persistent)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Op::Delete {
            path: path.into(),
            version: None,
        }
    }

    pub fn delete_versioned(path: impl Into<String>, version: Version) -> Self {
        Op::Delete {
            path: path.into(),
            version: Some(version),
        }
    }

    pub fn set_data(path: impl Into<String>, data: Vec<u8>, version: Option<Version>) -> Self {
        Op::SetData {
            path: path.into(),
            data,
            version,
        }
    }

    pub fn check(path: impl Into<String>, version: Version) -> Self {
        Op::Check {
            path: path.into(),
            version,
        }
    }

    pub fn path(&self) -> &str {
        match self {
            Op::Create { path, .. }
            | Op::Delete { path, .. }
            | Op::SetData { path, .. }
            | Op::Check { path, .. } => path,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, Op::Delete { .. })
    }
}

/// Ordered hierarchical namespace with atomic multi-operation commits.
///
/// Implementations must make [`multi`](Directory::multi) all-or-nothing:
/// when any constituent fails, none of the others are visible to any
/// observer, and the error of the first failing op is returned.
///
/// Errors: `NotFound` for missing nodes (or missing parents on create),
/// `AlreadyExists`, `NotEmpty` when deleting a node with children,
/// `VersionConflict` on version mismatch, `StateAccess` when the service
/// cannot be reached.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Returns node data and its current version.
    async fn get(&self, path: &str) -> Result<(Vec<u8>, Version)>;

    async fn exists(&self, path: &str) -> Result<bool>;

    /// Names (not full paths) of the direct children, in order.
    async fn get_children(&self, path: &str) -> Result<BTreeSet<String>>;

    /// Commits all `ops` atomically, in order.
    async fn multi(&self, ops: Vec<Op>) -> Result<()>;

    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> Result<()> {
        self.multi(vec![Op::create(path, data, mode)]).await
    }

    async fn set(&self, path: &str, data: Vec<u8>, version: Option<Version>) -> Result<()> {
        self.multi(vec![Op::set_data(path, data, version)]).await
    }

    async fn delete(&self, path: &str, version: Option<Version>) -> Result<()> {
        self.multi(vec![Op::Delete {
            path: path.to_string(),
            version,
        }])
        .await
    }
}

/// Parent of an absolute path; `None` for the root.
pub(crate) fn parent_of(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(i) => Some(&path[..i]),
        None => None,
    }
}

/// Last segment of an absolute path.
pub(crate) fn name_of(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

pub(crate) fn is_valid_path(path: &str) -> bool {
    if path == "/" {
        return true;
    }
    path.starts_with('/') && !path.ends_with('/') && !path[1..].split('/').any(str::is_empty)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_helpers() {
        assert_eq!(parent_of("/"), None);
        assert_eq!(parent_of("/netvirt"), Some("/"));
        assert_eq!(parent_of("/netvirt/tenants/t1"), Some("/netvirt/tenants"));
        assert_eq!(name_of("/netvirt/tenants/t1"), "t1");
        assert_eq!(name_of("/netvirt"), "netvirt");
    }

    #[test]
    fn test_path_validation() {
        assert!(is_valid_path("/"));
        assert!(is_valid_path("/a/b"));
        assert!(!is_valid_path("a/b"));
        assert!(!is_valid_path("/a/"));
        assert!(!is_valid_path("/a//b"));
        assert!(!is_valid_path(""));
    }

    #[test]
    fn test_op_path() {
        assert_eq!(Op::create_container("/a").path(), "/a");
        assert_eq!(Op::check("/b", 3).path(), "/b");
        assert!(Op::delete("/c").is_delete());
        assert!(!Op::set_data("/c", vec![], None).is_delete());
    }
}
