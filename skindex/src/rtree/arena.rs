//! In-memory node arena used during a bulk build.
//!
//! Nodes are addressed by dense integer ids assigned at allocation; parents
//! are stored as ids, never as pointers. The arena is the mutable working
//! set of the build and is drained to the node file once the tree is final.

use super::node::{Node, NodeRef};

#[derive(Debug, Default)]
pub struct NodeArena {
    nodes: Vec<Node>,
}

impl NodeArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a fresh node at `level` and returns its id.
    pub fn alloc(&mut self, level: u16) -> NodeRef {
        let id = self.nodes.len() as NodeRef;
        self.nodes.push(Node::new(id, level));
        id
    }

    pub fn get(&self, id: NodeRef) -> &Node {
        &self.nodes[id as usize]
    }

    pub fn get_mut(&mut self, id: NodeRef) -> &mut Node {
        &mut self.nodes[id as usize]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    /// Releases the working set after the build persisted all nodes.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.nodes.shrink_to_fit();
    }
}
