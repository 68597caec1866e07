//! Flow node tree
//!
//! A flow is a rooted tree: internal nodes are groups, leaves are steps with
//! a shell script. Nodes live in an arena (`Vec`) and refer to each other by
//! index, so parent/sibling back-references never form owning cycles.

pub mod loader;

pub use loader::{load_flow_dir, parse_flow, FlowEntry, FlowRegistry, LoaderError};

use std::collections::HashMap;

/// Index of a node inside its [`NodeTree`] arena.
pub type NodeId = usize;

/// Step-vs-group distinction. `allow_failure` exists only for steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Group,
    Step { script: String, allow_failure: bool },
}

/// One node of a flow tree.
#[derive(Debug, Clone)]
pub struct Node {
    /// Root-anchored slash-separated path, e.g. `demo/build/compile`.
    pub path: String,
    pub name: String,
    pub envs: HashMap<String, String>,
    pub kind: NodeKind,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub prev: Option<NodeId>,
    pub next: Option<NodeId>,
}

impl Node {
    pub fn is_step(&self) -> bool {
        matches!(self.kind, NodeKind::Step { .. })
    }

    pub fn script(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Step { script, .. } => Some(script),
            NodeKind::Group => None,
        }
    }

    /// `false` for groups; the flag only exists on steps.
    pub fn allow_failure(&self) -> bool {
        match &self.kind {
            NodeKind::Step { allow_failure, .. } => *allow_failure,
            NodeKind::Group => false,
        }
    }
}

/// Arena-backed flow tree. The root is always index 0.
#[derive(Debug, Clone)]
pub struct NodeTree {
    nodes: Vec<Node>,
    by_path: HashMap<String, NodeId>,
}

impl NodeTree {
    pub fn root(&self) -> NodeId {
        0
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn find(&self, path: &str) -> Option<NodeId> {
        self.by_path.get(path).copied()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All node ids in depth-first pre-order.
    pub fn iter_preorder(&self) -> impl Iterator<Item = NodeId> + '_ {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut cursor = Some(self.root());
        while let Some(id) = cursor {
            order.push(id);
            cursor = self.preorder_next(id);
        }
        order.into_iter()
    }

    /// A node is runnable iff it is a step.
    pub fn runnable(&self, id: NodeId) -> bool {
        self.nodes[id].is_step()
    }

    /// Leftmost descendant leaf, or `id` itself when runnable.
    pub fn first_leaf(&self, id: NodeId) -> Option<NodeId> {
        if self.runnable(id) {
            return Some(id);
        }
        let mut cursor = self.preorder_next(id);
        while let Some(cur) = cursor {
            if !self.in_subtree(cur, id) {
                return None;
            }
            if self.runnable(cur) {
                return Some(cur);
            }
            cursor = self.preorder_next(cur);
        }
        None
    }

    /// The leaf that follows `id` in a depth-first, left-to-right leaf walk,
    /// or `None` when `id` is the last leaf. For a group this is the first
    /// leaf inside it (pre-order visits a group before its children).
    pub fn next_leaf(&self, id: NodeId) -> Option<NodeId> {
        let mut cursor = self.preorder_next(id);
        while let Some(cur) = cursor {
            if self.runnable(cur) {
                return Some(cur);
            }
            cursor = self.preorder_next(cur);
        }
        None
    }

    /// The leaf the walk resumes at once `id`'s entire subtree is done:
    /// the first leaf under the nearest following sibling, climbing up when
    /// a subtree is exhausted. Equal to [`Self::next_leaf`] for leaves.
    pub fn next_leaf_after(&self, id: NodeId) -> Option<NodeId> {
        let mut cur = id;
        loop {
            if let Some(sibling) = self.nodes[cur].next {
                if let Some(leaf) = self.first_leaf(sibling) {
                    return Some(leaf);
                }
                cur = sibling;
            } else {
                cur = self.nodes[cur].parent?;
            }
        }
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id].parent
    }

    pub fn prev_sibling(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id].prev
    }

    pub fn next_sibling(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id].next
    }

    fn preorder_next(&self, id: NodeId) -> Option<NodeId> {
        if let Some(&child) = self.nodes[id].children.first() {
            return Some(child);
        }
        let mut cur = id;
        loop {
            if let Some(sibling) = self.nodes[cur].next {
                return Some(sibling);
            }
            cur = self.nodes[cur].parent?;
        }
    }

    fn in_subtree(&self, id: NodeId, ancestor: NodeId) -> bool {
        let mut cur = Some(id);
        while let Some(c) = cur {
            if c == ancestor {
                return true;
            }
            cur = self.nodes[c].parent;
        }
        false
    }
}

/// Incremental arena builder used by the flow loader.
#[derive(Debug, Default)]
pub struct TreeBuilder {
    nodes: Vec<Node>,
    by_path: HashMap<String, NodeId>,
}

impl TreeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &mut self,
        parent: Option<NodeId>,
        name: &str,
        envs: HashMap<String, String>,
        kind: NodeKind,
    ) -> NodeId {
        let id = self.nodes.len();
        let path = match parent {
            Some(p) => format!("{}/{}", self.nodes[p].path, name),
            None => name.to_string(),
        };
        let prev = parent.and_then(|p| self.nodes[p].children.last().copied());
        if let Some(prev_id) = prev {
            self.nodes[prev_id].next = Some(id);
        }
        if let Some(p) = parent {
            self.nodes[p].children.push(id);
        }
        self.by_path.insert(path.clone(), id);
        self.nodes.push(Node {
            path,
            name: name.to_string(),
            envs,
            kind,
            parent,
            children: Vec::new(),
            prev,
            next: None,
        });
        id
    }

    pub fn build(self) -> NodeTree {
        NodeTree {
            nodes: self.nodes,
            by_path: self.by_path,
        }
    }
}

/// First path segment of a node path, i.e. the flow the node belongs to.
pub fn root_path(path: &str) -> &str {
    path.split('/').next().unwrap_or(path)
}
