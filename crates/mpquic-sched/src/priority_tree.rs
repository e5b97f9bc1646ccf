//! Dependency tree over streams in the style of RFC 7540 section 5.3.
//!
//! Nodes live in an arena indexed by position; links between them are
//! indices, and a side table maps stream ids to arena slots. Slot 0 is the
//! root, which has no stream and is always active.
//!
//! A node contributes `weight + 1` to its parent's `children_weight`, and is
//! listed in the parent's `children`, exactly while it is active or has at
//! least one active descendant. Closed nodes are kept so that dependencies on
//! them keep their place in the tree.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use mpquic_core::{is_control_stream, StreamId, DEFAULT_STREAM_WEIGHT, ROOT_STREAM_ID};
use tracing::trace;

use crate::error::Error;
use crate::stream::Stream;

const ROOT: usize = 0;

/// Lifecycle of a tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Idle,
    Active,
    Closed,
}

#[derive(Debug)]
struct Node {
    id: StreamId,
    stream: Option<Arc<Stream>>,
    weight: u8,
    state: NodeState,
    children_weight: u32,
    active_children: usize,
    parent: Option<usize>,
    children: Vec<usize>,
    next_child: usize,
    // Already handed out for path assignment.
    visited: bool,
}

impl Node {
    fn new(id: StreamId, stream: Option<Arc<Stream>>, state: NodeState) -> Self {
        Self {
            id,
            stream,
            weight: DEFAULT_STREAM_WEIGHT,
            state,
            children_weight: 0,
            active_children: 0,
            parent: None,
            children: Vec::new(),
            next_child: 0,
            visited: false,
        }
    }

    fn contributes(&self) -> bool {
        self.state == NodeState::Active || self.active_children > 0
    }
}

/// Priority tree for one connection.
#[derive(Debug)]
pub struct PriorityTree {
    nodes: Vec<Node>,
    index: HashMap<StreamId, usize>,
    open_streams: usize,
}

impl Default for PriorityTree {
    fn default() -> Self {
        Self::new()
    }
}

impl PriorityTree {
    pub fn new() -> Self {
        let root = Node::new(ROOT_STREAM_ID, None, NodeState::Active);
        let mut index = HashMap::new();
        index.insert(ROOT_STREAM_ID, ROOT);
        Self {
            nodes: vec![root],
            index,
            open_streams: 0,
        }
    }

    /// Insert an active node for `stream` under the root.
    pub fn add_node(&mut self, stream: Arc<Stream>) -> Result<(), Error> {
        self.insert(stream, NodeState::Active)
    }

    /// Insert a node that does not carry data yet, for example a placeholder
    /// other streams depend on. It contributes no weight until
    /// [`PriorityTree::set_active`] is called.
    pub fn add_idle_node(&mut self, stream: Arc<Stream>) -> Result<(), Error> {
        self.insert(stream, NodeState::Idle)
    }

    fn insert(&mut self, stream: Arc<Stream>, state: NodeState) -> Result<(), Error> {
        let id = stream.id();
        if id == ROOT_STREAM_ID {
            return Err(Error::RootStreamId);
        }
        if self.index.contains_key(&id) {
            return Ok(());
        }
        let idx = self.nodes.len();
        let mut node = Node::new(id, Some(stream), state);
        node.parent = Some(ROOT);
        self.nodes.push(node);
        self.index.insert(id, idx);
        if state == NodeState::Active {
            self.open_streams += 1;
            self.add_weight(ROOT, idx);
        }
        trace!(stream_id = id, ?state, "added priority node");
        Ok(())
    }

    /// Change a node's weight. Control streams keep theirs.
    pub fn set_weight(&mut self, id: StreamId, weight: u8) -> Result<(), Error> {
        if is_control_stream(id) {
            return Ok(());
        }
        let idx = self.lookup(id)?;
        let node = &self.nodes[idx];
        let old = node.weight as u32;
        if let (true, Some(parent)) = (node.contributes(), node.parent) {
            let p = &mut self.nodes[parent];
            p.children_weight = p.children_weight - old + weight as u32;
        }
        self.nodes[idx].weight = weight;
        Ok(())
    }

    /// Make `child_id` depend on `parent_id`.
    ///
    /// If `parent_id` is currently a descendant of `child_id`, it is first
    /// moved up to `child_id`'s former parent. With `exclusive`, the new
    /// parent's other children become children of `child_id`.
    pub fn set_parent(
        &mut self,
        child_id: StreamId,
        parent_id: StreamId,
        exclusive: bool,
    ) -> Result<(), Error> {
        if child_id == parent_id
            || child_id == ROOT_STREAM_ID
            || is_control_stream(child_id)
            || is_control_stream(parent_id)
        {
            return Err(Error::InvalidParent {
                child: child_id,
                parent: parent_id,
            });
        }
        let child = self.lookup(child_id)?;
        let parent = self.lookup(parent_id)?;

        if !exclusive && self.nodes[child].parent == Some(parent) {
            return Ok(());
        }

        // Walk up from the new parent; finding the child there means the
        // move would create a cycle.
        let mut cursor = self.nodes[parent].parent;
        while let Some(n) = cursor {
            if n == child {
                let old_parent = self.nodes[child].parent;
                self.move_node(parent, old_parent);
                break;
            }
            cursor = self.nodes[n].parent;
        }

        self.move_node(child, None);

        if exclusive {
            let mut siblings = self.nodes[parent].children.clone();
            let mut idle: Vec<usize> = (0..self.nodes.len())
                .filter(|&i| {
                    self.nodes[i].parent == Some(parent) && !self.nodes[i].contributes()
                })
                .collect();
            idle.sort_by_key(|&i| self.nodes[i].id);
            siblings.extend(idle);
            for sibling in siblings.into_iter().filter(|&s| s != child) {
                self.move_node(sibling, Some(child));
            }
        }

        self.move_node(child, Some(parent));
        trace!(
            stream_id = child_id,
            parent = parent_id,
            exclusive,
            "re-parented priority node"
        );
        Ok(())
    }

    /// Mark an idle node as carrying data.
    pub fn set_active(&mut self, id: StreamId) -> Result<(), Error> {
        if is_control_stream(id) {
            return Ok(());
        }
        let idx = self.lookup(id)?;
        if self.nodes[idx].state != NodeState::Idle {
            return Ok(());
        }
        let was_contributing = self.nodes[idx].contributes();
        self.nodes[idx].state = NodeState::Active;
        self.open_streams += 1;
        if !was_contributing {
            if let Some(parent) = self.nodes[idx].parent {
                self.add_weight(parent, idx);
            }
        }
        Ok(())
    }

    /// Close the node of a stream that left the connection. The node stays
    /// in the tree so its dependants keep their position.
    pub fn close(&mut self, id: StreamId) -> Result<(), Error> {
        let idx = self.lookup(id)?;
        if idx != ROOT {
            self.deactivate(idx);
        }
        Ok(())
    }

    /// Streams ready for path assignment.
    ///
    /// Walks the tree depth first, starting each level at its round-robin
    /// cursor. A node whose stream finished and sent its FIN is closed and
    /// its children become reachable. Nodes are handed out once; a node is
    /// considered handed out as soon as its stream's size is known (control
    /// streams: as soon as they are returned). Children of a node that is
    /// still sending stay hidden.
    pub fn schedule(&mut self) -> Vec<Arc<Stream>> {
        let mut out = Vec::new();
        self.traverse(ROOT, &mut out);
        out
    }

    /// Every live stream in the tree, level by level.
    pub fn schedule_all(&mut self) -> Vec<Arc<Stream>> {
        let mut out = Vec::new();
        let mut queue = VecDeque::from([ROOT]);
        while let Some(idx) = queue.pop_front() {
            self.deactivate_if_finished(idx);
            if let Some(stream) = &self.nodes[idx].stream {
                out.push(Arc::clone(stream));
            }
            queue.extend(self.rotated_children(idx));
        }
        out
    }

    fn traverse(&mut self, idx: usize, out: &mut Vec<Arc<Stream>>) {
        self.deactivate_if_finished(idx);

        let node = &mut self.nodes[idx];
        let descend = match node.stream.clone() {
            None => true,
            Some(stream) => {
                if stream.checksize() {
                    node.visited = true;
                }
                if !node.visited {
                    if node.state == NodeState::Active {
                        if is_control_stream(node.id) {
                            node.visited = true;
                        }
                        out.push(stream);
                    }
                    false
                } else {
                    is_control_stream(node.id) || stream.finished_write_and_sent_fin()
                }
            }
        };

        if descend && self.nodes[idx].active_children > 0 {
            for child in self.rotated_children(idx) {
                self.traverse(child, out);
            }
        }
    }

    // Children starting at the cursor; advances the cursor by one.
    fn rotated_children(&mut self, idx: usize) -> Vec<usize> {
        let node = &mut self.nodes[idx];
        let len = node.children.len();
        if len == 0 {
            node.next_child = 0;
            return Vec::new();
        }
        let start = node.next_child % len;
        let order = (0..len).map(|i| node.children[(start + i) % len]).collect();
        node.next_child = (start + 1) % len;
        order
    }

    fn deactivate_if_finished(&mut self, idx: usize) {
        let finished = self.nodes[idx]
            .stream
            .as_ref()
            .is_some_and(|s| s.finished_write_and_sent_fin());
        if finished {
            self.deactivate(idx);
        }
    }

    fn deactivate(&mut self, idx: usize) {
        let node = &mut self.nodes[idx];
        let was_contributing = node.contributes();
        if node.state == NodeState::Active {
            self.open_streams -= 1;
        }
        node.state = NodeState::Closed;
        node.stream = None;
        trace!(stream_id = node.id, "closed priority node");
        if was_contributing && !node.contributes() {
            if let Some(parent) = node.parent {
                self.remove_weight(parent, idx);
            }
        }
    }

    // Detach `idx` from its parent and attach it under `new_parent`, moving
    // its weight contribution along if it has one.
    fn move_node(&mut self, idx: usize, new_parent: Option<usize>) {
        let contributes = self.nodes[idx].contributes();
        if let (true, Some(old)) = (contributes, self.nodes[idx].parent) {
            self.remove_weight(old, idx);
        }
        self.nodes[idx].parent = new_parent;
        if let (true, Some(parent)) = (contributes, new_parent) {
            self.add_weight(parent, idx);
        }
    }

    fn add_weight(&mut self, parent: usize, child: usize) {
        let weight = self.nodes[child].weight as u32;
        let p = &mut self.nodes[parent];
        if p.children.contains(&child) {
            return;
        }
        let was_contributing = p.contributes();
        p.children_weight += weight + 1;
        p.active_children += 1;
        p.children.push(child);
        if !was_contributing {
            if let Some(grandparent) = p.parent {
                self.add_weight(grandparent, parent);
            }
        }
    }

    fn remove_weight(&mut self, parent: usize, child: usize) {
        let weight = self.nodes[child].weight as u32;
        let p = &mut self.nodes[parent];
        let Some(pos) = p.children.iter().position(|&c| c == child) else {
            return;
        };
        p.children.remove(pos);
        if pos < p.next_child {
            p.next_child -= 1;
        }
        if p.children.is_empty() {
            p.next_child = 0;
        } else {
            p.next_child %= p.children.len();
        }
        p.children_weight -= weight + 1;
        p.active_children -= 1;
        if !p.contributes() {
            if let Some(grandparent) = p.parent {
                self.remove_weight(grandparent, parent);
            }
        }
    }

    fn lookup(&self, id: StreamId) -> Result<usize, Error> {
        self.index
            .get(&id)
            .copied()
            .ok_or(Error::UnknownStream(id))
    }

    pub fn contains(&self, id: StreamId) -> bool {
        self.index.contains_key(&id)
    }

    /// Number of active nodes.
    pub fn open_streams(&self) -> usize {
        self.open_streams
    }

    pub fn state(&self, id: StreamId) -> Option<NodeState> {
        self.index.get(&id).map(|&i| self.nodes[i].state)
    }

    pub fn weight(&self, id: StreamId) -> Option<u8> {
        self.index.get(&id).map(|&i| self.nodes[i].weight)
    }

    pub fn parent(&self, id: StreamId) -> Option<StreamId> {
        let idx = *self.index.get(&id)?;
        self.nodes[idx].parent.map(|p| self.nodes[p].id)
    }

    /// Ids of the contributing children of `id`, in round-robin order.
    pub fn children(&self, id: StreamId) -> Vec<StreamId> {
        self.index
            .get(&id)
            .map(|&i| {
                self.nodes[i]
                    .children
                    .iter()
                    .map(|&c| self.nodes[c].id)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn children_weight(&self, id: StreamId) -> Option<u32> {
        self.index.get(&id).map(|&i| self.nodes[i].children_weight)
    }

    pub fn active_children(&self, id: StreamId) -> Option<usize> {
        self.index.get(&id).map(|&i| self.nodes[i].active_children)
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        for (idx, node) in self.nodes.iter().enumerate() {
            let listed: u32 = node
                .children
                .iter()
                .map(|&c| self.nodes[c].weight as u32 + 1)
                .sum();
            assert_eq!(node.children_weight, listed, "weight of {}", node.id);
            assert_eq!(node.active_children, node.children.len(), "count of {}", node.id);
            if let Some(parent) = node.parent {
                assert_eq!(
                    self.nodes[parent].children.contains(&idx),
                    node.contributes(),
                    "membership of {} under {}",
                    node.id,
                    self.nodes[parent].id
                );
            } else {
                assert_eq!(idx, ROOT);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mpquic_core::Priority;

    fn stream(id: StreamId) -> Arc<Stream> {
        Arc::new(Stream::new(id, Priority::default()))
    }

    fn tree_with(ids: &[StreamId]) -> (PriorityTree, HashMap<StreamId, Arc<Stream>>) {
        let mut tree = PriorityTree::new();
        let mut streams = HashMap::new();
        for &id in ids {
            let s = stream(id);
            tree.add_node(Arc::clone(&s)).unwrap();
            streams.insert(id, s);
        }
        (tree, streams)
    }

    fn ids(streams: &[Arc<Stream>]) -> Vec<StreamId> {
        let mut v: Vec<_> = streams.iter().map(|s| s.id()).collect();
        v.sort_unstable();
        v
    }

    fn finish(s: &Stream) {
        s.close();
        s.get_data_for_writing(u64::MAX);
        s.sent_fin();
    }

    #[test]
    fn root_stream_id_rejected() {
        let mut tree = PriorityTree::new();
        assert!(matches!(tree.add_node(stream(0)), Err(Error::RootStreamId)));
    }

    #[test]
    fn add_node_contributes_to_root() {
        let (tree, _) = tree_with(&[5, 7]);
        assert_eq!(tree.parent(5), Some(0));
        assert_eq!(tree.children(0), vec![5, 7]);
        assert_eq!(
            tree.children_weight(0),
            Some(2 * (DEFAULT_STREAM_WEIGHT as u32 + 1))
        );
        assert_eq!(tree.open_streams(), 2);
        tree.assert_consistent();
    }

    #[test]
    fn idle_node_contributes_after_activation() {
        let mut tree = PriorityTree::new();
        tree.add_idle_node(stream(5)).unwrap();
        assert_eq!(tree.state(5), Some(NodeState::Idle));
        assert_eq!(tree.children(0), Vec::<StreamId>::new());
        tree.set_active(5).unwrap();
        assert_eq!(tree.state(5), Some(NodeState::Active));
        assert_eq!(tree.children(0), vec![5]);
        // activating twice changes nothing
        tree.set_active(5).unwrap();
        assert_eq!(tree.active_children(0), Some(1));
        tree.assert_consistent();
    }

    #[test]
    fn idle_parent_contributes_through_active_child() {
        let mut tree = PriorityTree::new();
        tree.add_idle_node(stream(5)).unwrap();
        tree.add_idle_node(stream(7)).unwrap();
        tree.set_parent(7, 5, false).unwrap();
        assert!(tree.children(0).is_empty());
        tree.set_active(7).unwrap();
        assert_eq!(tree.children(0), vec![5]);
        assert_eq!(tree.children(5), vec![7]);
        tree.assert_consistent();
    }

    #[test]
    fn set_weight_updates_parent() {
        let (mut tree, _) = tree_with(&[5]);
        tree.set_weight(5, 10).unwrap();
        assert_eq!(tree.weight(5), Some(10));
        assert_eq!(tree.children_weight(0), Some(11));
        tree.assert_consistent();
    }

    #[test]
    fn set_weight_ignores_control_streams() {
        let (mut tree, _) = tree_with(&[1, 3]);
        tree.set_weight(1, 4).unwrap();
        tree.set_weight(3, 4).unwrap();
        assert_eq!(tree.weight(1), Some(DEFAULT_STREAM_WEIGHT));
        assert!(matches!(tree.set_weight(9, 1), Err(Error::UnknownStream(9))));
    }

    #[test]
    fn set_parent_rejections() {
        let (mut tree, _) = tree_with(&[1, 3, 5]);
        assert!(matches!(
            tree.set_parent(5, 5, false),
            Err(Error::InvalidParent { .. })
        ));
        assert!(tree.set_parent(1, 5, false).is_err());
        assert!(tree.set_parent(5, 1, false).is_err());
        assert!(tree.set_parent(5, 3, false).is_err());
        assert!(matches!(
            tree.set_parent(5, 9, false),
            Err(Error::UnknownStream(9))
        ));
        assert_eq!(tree.parent(5), Some(0));
    }

    #[test]
    fn set_parent_same_parent_is_noop() {
        let (mut tree, _) = tree_with(&[5, 7]);
        tree.set_parent(7, 5, false).unwrap();
        tree.set_parent(7, 5, false).unwrap();
        assert_eq!(tree.children(5), vec![7]);
        assert_eq!(tree.children(0), vec![5]);
        tree.assert_consistent();
    }

    #[test]
    fn exclusive_adopts_siblings() {
        // root -> A(5), root -> B(7) -> {C(9), D(11)}
        let (mut tree, _) = tree_with(&[5, 7, 9, 11]);
        tree.set_parent(9, 7, false).unwrap();
        tree.set_parent(11, 7, false).unwrap();

        tree.set_parent(5, 7, true).unwrap();

        assert_eq!(tree.children(0), vec![7]);
        assert_eq!(tree.parent(7), Some(0));
        assert_eq!(tree.children(7), vec![5]);
        assert_eq!(tree.parent(5), Some(7));
        assert_eq!(tree.children(5), vec![9, 11]);
        tree.assert_consistent();
    }

    #[test]
    fn exclusive_with_same_parent() {
        let (mut tree, _) = tree_with(&[5, 7, 9]);
        tree.set_parent(5, 0, true).unwrap();
        assert_eq!(tree.children(0), vec![5]);
        assert_eq!(tree.children(5), vec![7, 9]);
        tree.assert_consistent();
    }

    #[test]
    fn exclusive_moves_idle_siblings_without_weight() {
        let mut tree = PriorityTree::new();
        tree.add_node(stream(5)).unwrap();
        tree.add_idle_node(stream(7)).unwrap();
        tree.add_node(stream(9)).unwrap();
        tree.set_parent(9, 0, true).unwrap();
        assert_eq!(tree.parent(7), Some(9));
        assert_eq!(tree.parent(5), Some(9));
        assert_eq!(tree.children(9), vec![5]);
        assert_eq!(tree.children_weight(9), Some(DEFAULT_STREAM_WEIGHT as u32 + 1));
        tree.assert_consistent();
    }

    #[test]
    fn cycle_is_broken() {
        // root -> 5 -> 7 -> {9, 11}
        let (mut tree, _) = tree_with(&[5, 7, 9, 11]);
        tree.set_parent(7, 5, false).unwrap();
        tree.set_parent(9, 7, false).unwrap();
        tree.set_parent(11, 7, false).unwrap();

        tree.set_parent(5, 9, false).unwrap();

        assert_eq!(tree.children(0), vec![9]);
        assert_eq!(tree.parent(9), Some(0));
        assert_eq!(tree.children(9), vec![5]);
        assert_eq!(tree.children(5), vec![7]);
        assert_eq!(tree.children(7), vec![11]);
        tree.assert_consistent();
    }

    #[test]
    fn cycle_with_exclusive() {
        // root -> 5 -> 7 -> 9, then 5 exclusively under 9
        let (mut tree, _) = tree_with(&[5, 7, 9, 11]);
        tree.set_parent(7, 5, false).unwrap();
        tree.set_parent(9, 7, false).unwrap();
        tree.set_parent(5, 9, true).unwrap();
        assert_eq!(tree.parent(9), Some(0));
        assert_eq!(tree.children(9), vec![5]);
        assert_eq!(tree.children(5), vec![7]);
        tree.assert_consistent();
    }

    #[test]
    fn closing_leaf_removes_weight_chain() {
        let (mut tree, _) = tree_with(&[5, 7]);
        tree.set_parent(7, 5, false).unwrap();
        tree.close(5).unwrap();
        // 5 still has an active child, so it stays listed
        assert_eq!(tree.children(0), vec![5]);
        tree.close(7).unwrap();
        assert!(tree.children(0).is_empty());
        assert!(tree.children(5).is_empty());
        assert_eq!(tree.children_weight(0), Some(0));
        assert_eq!(tree.open_streams(), 0);
        tree.assert_consistent();
    }

    #[test]
    fn schedule_all_lists_every_live_stream() {
        let (mut tree, _) = tree_with(&[1, 3, 4, 5, 6, 7]);
        tree.set_parent(6, 4, false).unwrap();
        tree.set_parent(7, 6, false).unwrap();
        assert_eq!(ids(&tree.schedule_all()), vec![1, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn dependency_order_end_to_end() {
        let (mut tree, streams) = tree_with(&[1, 3, 4, 5, 6, 7]);
        tree.set_parent(6, 4, false).unwrap();
        tree.set_parent(7, 6, false).unwrap();

        assert_eq!(ids(&tree.schedule()), vec![1, 3, 4, 5]);

        // the scheduler reads the sizes of 4 and 5 when assigning them
        for id in [4, 5] {
            streams[&id].write(&[0u8; 10]).unwrap();
            streams[&id].detect_size();
        }
        assert!(tree.schedule().is_empty());

        finish(&streams[&4]);
        assert_eq!(ids(&tree.schedule()), vec![6]);
        assert_eq!(tree.state(4), Some(NodeState::Closed));

        finish(&streams[&6]);
        assert_eq!(ids(&tree.schedule()), vec![7]);
        tree.assert_consistent();
    }

    #[test]
    fn siblings_rotate() {
        let (mut tree, _) = tree_with(&[5, 7, 9]);
        let first: Vec<_> = tree.schedule().iter().map(|s| s.id()).collect();
        let second: Vec<_> = tree.schedule().iter().map(|s| s.id()).collect();
        let third: Vec<_> = tree.schedule().iter().map(|s| s.id()).collect();
        assert_eq!(first, vec![5, 7, 9]);
        assert_eq!(second, vec![7, 9, 5]);
        assert_eq!(third, vec![9, 5, 7]);
    }

    #[test]
    fn schedule_skips_idle() {
        let mut tree = PriorityTree::new();
        tree.add_idle_node(stream(5)).unwrap();
        tree.add_node(stream(7)).unwrap();
        assert_eq!(ids(&tree.schedule()), vec![7]);
    }
}
