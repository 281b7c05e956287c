use std::vec::IntoIter;

use crate::common::{Id, Node};

/// Nodes kept sorted by ascending XOR distance to a target, without duplicate ids.
#[derive(Debug, Clone)]
pub struct ClosestNodes {
    target: Id,
    nodes: Vec<Node>,
}

impl ClosestNodes {
    pub fn new(target: Id) -> Self {
        Self {
            target,
            nodes: Vec::new(),
        }
    }

    // === Getters ===

    pub fn target(&self) -> Id {
        self.target
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.find(id).is_ok()
    }

    // === Public Methods ===

    /// Insert a node at its position by distance, ignoring it if its id is already present.
    pub fn add(&mut self, node: Node) {
        if let Err(pos) = self.find(node.id()) {
            self.nodes.insert(pos, node)
        }
    }

    pub fn remove(&mut self, id: &Id) -> Option<Node> {
        self.find(id).ok().map(|pos| self.nodes.remove(pos))
    }

    /// Keep only the `len` closest nodes.
    pub fn truncate(&mut self, len: usize) {
        self.nodes.truncate(len)
    }

    // === Private Methods ===

    fn find(&self, id: &Id) -> Result<usize, usize> {
        // Ids are unique, so equal distance means equal id.
        let seek = id.xor(&self.target);

        self.nodes
            .binary_search_by(|probe| probe.id().xor(&self.target).cmp(&seek))
    }
}

impl IntoIterator for ClosestNodes {
    type Item = Node;
    type IntoIter = IntoIter<Node>;

    fn into_iter(self) -> Self::IntoIter {
        self.nodes.into_iter()
    }
}

impl<'a> IntoIterator for &'a ClosestNodes {
    type Item = &'a Node;
    type IntoIter = std::slice::Iter<'a, Node>;

    fn into_iter(self) -> Self::IntoIter {
        self.nodes.iter()
    }
}
