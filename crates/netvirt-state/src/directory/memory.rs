//! In-process coordination service.
//!
//! `MemoryDirectory` keeps the whole namespace behind one lock and applies
//! each `multi` batch under it, journaling every applied op so a failing
//! batch is rolled back before the lock is released. Handles obtained from
//! [`MemoryDirectory::new_session`] share the tree but own their ephemeral
//! nodes, which mirrors several agents connected to one ensemble.

use super::{is_valid_path, name_of, parent_of, CreateMode, Directory, Op, Version};
use crate::error::{Result, StateError};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

type SessionId = u64;

#[derive(Debug, Clone)]
struct Node {
    data: Vec<u8>,
    version: Version,
    ephemeral_owner: Option<SessionId>,
    children: BTreeSet<String>,
}

impl Node {
    fn new(data: Vec<u8>, ephemeral_owner: Option<SessionId>) -> Self {
        Self {
            data,
            version: 0,
            ephemeral_owner,
            children: BTreeSet::new(),
        }
    }
}

/// Undo record for one applied op.
enum Undo {
    Created(String),
    Deleted(String, Node),
    DataSet {
        path: String,
        data: Vec<u8>,
        version: Version,
    },
    Checked,
}

#[derive(Debug)]
struct Tree {
    nodes: HashMap<String, Node>,
}

impl Tree {
    fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert("/".to_string(), Node::new(Vec::new(), None));
        Self { nodes }
    }

    fn node(&self, path: &str) -> Result<&Node> {
        self.nodes
            .get(path)
            .ok_or_else(|| StateError::not_found(path))
    }

    fn check_version(path: &str, node: &Node, expected: Option<Version>) -> Result<()> {
        match expected {
            Some(v) if v != node.version => Err(StateError::version_conflict(
                path,
                format!("expected version {}, found {}", v, node.version),
            )),
            _ => Ok(()),
        }
    }

    fn apply(&mut self, op: Op, session: SessionId) -> Result<Undo> {
        let path = op.path().to_string();
        if !is_valid_path(&path) {
            return Err(StateError::invalid_config("path", format!("malformed path {path:?}")));
        }

        match op {
            Op::Create { data, mode, .. } => {
                if self.nodes.contains_key(&path) {
                    return Err(StateError::already_exists(path));
                }
                let parent_path = parent_of(&path).ok_or_else(|| StateError::already_exists("/"))?;
                let parent = self
                    .nodes
                    .get_mut(parent_path)
                    .ok_or_else(|| StateError::not_found(parent_path))?;
                if parent.ephemeral_owner.is_some() {
                    return Err(StateError::invalid_config(
                        "mode",
                        format!("ephemeral node {parent_path} cannot have children"),
                    ));
                }
                parent.children.insert(name_of(&path).to_string());
                parent.version += 1;

                let owner = (mode == CreateMode::Ephemeral).then_some(session);
                self.nodes.insert(path.clone(), Node::new(data, owner));
                Ok(Undo::Created(path))
            }
            Op::Delete { version, .. } => {
                let node = self.node(&path)?;
                Self::check_version(&path, node, version)?;
                if !node.children.is_empty() {
                    return Err(StateError::NotEmpty(path));
                }
                let parent_path = parent_of(&path)
                    .ok_or_else(|| StateError::invalid_config("path", "the root node cannot be deleted"))?;

                let removed = self
                    .nodes
                    .remove(&path)
                    .ok_or_else(|| StateError::not_found(&path))?;
                if let Some(parent) = self.nodes.get_mut(parent_path) {
                    parent.children.remove(name_of(&path));
                    parent.version += 1;
                }
                Ok(Undo::Deleted(path, removed))
            }
            Op::SetData { data, version, .. } => {
                let node = self
                    .nodes
                    .get_mut(&path)
                    .ok_or_else(|| StateError::not_found(&path))?;
                Self::check_version(&path, node, version)?;
                let old_data = std::mem::replace(&mut node.data, data);
                let old_version = node.version;
                node.version += 1;
                Ok(Undo::DataSet {
                    path,
                    data: old_data,
                    version: old_version,
                })
            }
            Op::Check { version, .. } => {
                let node = self.node(&path)?;
                Self::check_version(&path, node, Some(version))?;
                Ok(Undo::Checked)
            }
        }
    }

    fn revert(&mut self, undo: Undo) {
        match undo {
            Undo::Created(path) => {
                self.nodes.remove(&path);
                if let Some(parent) = parent_of(&path).and_then(|p| self.nodes.get_mut(p)) {
                    parent.children.remove(name_of(&path));
                    parent.version -= 1;
                }
            }
            Undo::Deleted(path, node) => {
                if let Some(parent) = parent_of(&path).and_then(|p| self.nodes.get_mut(p)) {
                    parent.children.insert(name_of(&path).to_string());
                    parent.version -= 1;
                }
                self.nodes.insert(path, node);
            }
            Undo::DataSet {
                path,
                data,
                version,
            } => {
                if let Some(node) = self.nodes.get_mut(&path) {
                    node.data = data;
                    node.version = version;
                }
            }
            Undo::Checked => {}
        }
    }
}

/// In-memory [`Directory`] shared by every session handle cloned from it.
#[derive(Debug, Clone)]
pub struct MemoryDirectory {
    tree: Arc<RwLock<Tree>>,
    next_session: Arc<AtomicU64>,
    session: SessionId,
}

impl MemoryDirectory {
    /// Creates an empty namespace containing only `/`.
    pub fn new() -> Self {
        Self {
            tree: Arc::new(RwLock::new(Tree::new())),
            next_session: Arc::new(AtomicU64::new(2)),
            session: 1,
        }
    }

    /// Opens another session on the same namespace.
    pub fn new_session(&self) -> Self {
        Self {
            tree: Arc::clone(&self.tree),
            next_session: Arc::clone(&self.next_session),
            session: self.next_session.fetch_add(1, Ordering::SeqCst),
        }
    }

    pub fn session_id(&self) -> u64 {
        self.session
    }

    /// Ends this session, removing every ephemeral node it created.
    pub fn close_session(&self) {
        let mut tree = self.tree.write();
        let owned: Vec<String> = tree
            .nodes
            .iter()
            .filter(|(_, n)| n.ephemeral_owner == Some(self.session))
            .map(|(p, _)| p.clone())
            .collect();

        for path in &owned {
            tree.nodes.remove(path);
            if let Some(parent) = parent_of(path).and_then(|p| tree.nodes.get_mut(p)) {
                parent.children.remove(name_of(path));
                parent.version += 1;
            }
        }
        debug!(session = self.session, removed = owned.len(), "Closed directory session");
    }

    /// Number of nodes in the namespace, including `/`.
    pub fn node_count(&self) -> usize {
        self.tree.read().nodes.len()
    }

    /// Number of nodes at or below `path`.
    pub fn subtree_size(&self, path: &str) -> usize {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        self.tree
            .read()
            .nodes
            .keys()
            .filter(|p| p.as_str() == path || p.starts_with(&prefix))
            .count()
    }
}

impl Default for MemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn get(&self, path: &str) -> Result<(Vec<u8>, Version)> {
        let tree = self.tree.read();
        let node = tree.node(path)?;
        Ok((node.data.clone(), node.version))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.tree.read().nodes.contains_key(path))
    }

    async fn get_children(&self, path: &str) -> Result<BTreeSet<String>> {
        let tree = self.tree.read();
        Ok(tree.node(path)?.children.clone())
    }

    async fn multi(&self, ops: Vec<Op>) -> Result<()> {
        let count = ops.len();
        let mut tree = self.tree.write();
        let mut journal = Vec::with_capacity(count);

        for op in ops {
            match tree.apply(op, self.session) {
                Ok(undo) => journal.push(undo),
                Err(e) => {
                    for undo in journal.into_iter().rev() {
                        tree.revert(undo);
                    }
                    debug!(ops = count, error = %e, "Directory multi rolled back");
                    return Err(e);
                }
            }
        }

        debug!(ops = count, session = self.session, "Directory multi committed");
        Ok(())
    }
}
