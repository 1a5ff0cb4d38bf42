//! Per-ban object queues.
//!
//! Every ban owns a doubly linked queue of the objects last proven clean up to
//! that ban. All queues share one node arena inside the ban state, so an
//! object can be unlinked or moved to the tail in O(1) given its node index.
//!
//! The end-of-pass marker is a distinct [`QueueEntry`] variant rather than a
//! fake object, so it can never be reference counted or mistaken for data.

use std::sync::Arc;

use crate::store::ObjCore;

/// Index of a node in the shared arena.
pub(crate) type NodeIdx = usize;

/// Element of a ban's object queue.
#[derive(Debug, Clone)]
pub enum QueueEntry {
    /// A resident object waiting to be tested against newer bans.
    Object(Arc<ObjCore>),
    /// Bounds one lurker scan of this queue.
    EndOfPass,
}

impl QueueEntry {
    /// True for the end-of-pass marker.
    #[must_use]
    pub const fn is_marker(&self) -> bool {
        matches!(self, Self::EndOfPass)
    }
}

#[derive(Debug)]
struct Node {
    entry: QueueEntry,
    prev: Option<NodeIdx>,
    next: Option<NodeIdx>,
}

/// Storage for the nodes of every queue.
#[derive(Debug, Default)]
pub(crate) struct NodeArena {
    nodes: Vec<Option<Node>>,
    free: Vec<NodeIdx>,
}

impl NodeArena {
    fn alloc(&mut self, node: Node) -> NodeIdx {
        if let Some(idx) = self.free.pop() {
            self.nodes[idx] = Some(node);
            idx
        } else {
            self.nodes.push(Some(node));
            self.nodes.len() - 1
        }
    }

    fn release(&mut self, idx: NodeIdx) -> Node {
        let node = self.nodes[idx]
            .take()
            .unwrap_or_else(|| panic!("queue node {idx} released twice"));
        self.free.push(idx);
        node
    }

    fn node(&self, idx: NodeIdx) -> &Node {
        self.nodes[idx]
            .as_ref()
            .unwrap_or_else(|| panic!("queue node {idx} is vacant"))
    }

    fn node_mut(&mut self, idx: NodeIdx) -> &mut Node {
        self.nodes[idx]
            .as_mut()
            .unwrap_or_else(|| panic!("queue node {idx} is vacant"))
    }

    /// Number of live nodes across all queues.
    pub(crate) fn live(&self) -> usize {
        self.nodes.len() - self.free.len()
    }
}

/// Head/tail of one ban's queue.
#[derive(Debug, Default)]
pub(crate) struct ObjQueue {
    first: Option<NodeIdx>,
    last: Option<NodeIdx>,
    len: usize,
}

impl ObjQueue {
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn push_back(&mut self, arena: &mut NodeArena, entry: QueueEntry) -> NodeIdx {
        let idx = arena.alloc(Node {
            entry,
            prev: self.last,
            next: None,
        });
        match self.last {
            Some(last) => arena.node_mut(last).next = Some(idx),
            None => self.first = Some(idx),
        }
        self.last = Some(idx);
        self.len += 1;
        idx
    }

    pub(crate) fn front<'a>(&self, arena: &'a NodeArena) -> Option<(NodeIdx, &'a QueueEntry)> {
        self.first.map(|idx| (idx, &arena.node(idx).entry))
    }

    pub(crate) fn unlink(&mut self, arena: &mut NodeArena, idx: NodeIdx) -> QueueEntry {
        self.detach_links(arena, idx);
        self.len -= 1;
        arena.release(idx).entry
    }

    /// Move a node to the tail, keeping its index.
    pub(crate) fn move_to_back(&mut self, arena: &mut NodeArena, idx: NodeIdx) {
        if self.last == Some(idx) {
            return;
        }
        self.detach_links(arena, idx);
        {
            let node = arena.node_mut(idx);
            node.prev = self.last;
            node.next = None;
        }
        match self.last {
            Some(last) => arena.node_mut(last).next = Some(idx),
            None => self.first = Some(idx),
        }
        self.last = Some(idx);
    }

    pub(crate) fn iter<'a>(&self, arena: &'a NodeArena) -> impl Iterator<Item = &'a QueueEntry> {
        let mut cursor = self.first;
        std::iter::from_fn(move || {
            let idx = cursor?;
            let node = arena.node(idx);
            cursor = node.next;
            Some(&node.entry)
        })
    }

    /// Node index of the first entry satisfying `pred`.
    pub(crate) fn find(
        &self,
        arena: &NodeArena,
        pred: impl Fn(&QueueEntry) -> bool,
    ) -> Option<NodeIdx> {
        let mut cursor = self.first;
        while let Some(idx) = cursor {
            let node = arena.node(idx);
            if pred(&node.entry) {
                return Some(idx);
            }
            cursor = node.next;
        }
        None
    }

    fn detach_links(&mut self, arena: &mut NodeArena, idx: NodeIdx) {
        let (prev, next) = {
            let node = arena.node(idx);
            (node.prev, node.next)
        };
        match prev {
            Some(p) => arena.node_mut(p).next = next,
            None => self.first = next,
        }
        match next {
            Some(n) => arena.node_mut(n).prev = prev,
            None => self.last = prev,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Expiry, ObjHead};
    use std::collections::HashMap;
    use std::time::{Duration, UNIX_EPOCH};

    fn obj(xid: u64) -> QueueEntry {
        let head = ObjHead::new(format!("/{xid}"));
        QueueEntry::Object(ObjCore::insert(
            &head,
            xid,
            HashMap::new(),
            Expiry::new(UNIX_EPOCH, Duration::from_secs(1)),
        ))
    }

    fn xids(q: &ObjQueue, arena: &NodeArena) -> Vec<Option<u64>> {
        q.iter(arena)
            .map(|e| match e {
                QueueEntry::Object(oc) => Some(oc.xid()),
                QueueEntry::EndOfPass => None,
            })
            .collect()
    }

    #[test]
    fn push_front_and_move_round_robin() {
        let mut arena = NodeArena::default();
        let mut q = ObjQueue::default();
        let a = q.push_back(&mut arena, obj(1));
        q.push_back(&mut arena, obj(2));
        q.push_back(&mut arena, QueueEntry::EndOfPass);
        assert_eq!(xids(&q, &arena), vec![Some(1), Some(2), None]);

        q.move_to_back(&mut arena, a);
        assert_eq!(xids(&q, &arena), vec![Some(2), None, Some(1)]);
        let (front, entry) = q.front(&arena).unwrap();
        assert!(!entry.is_marker());
        q.move_to_back(&mut arena, front);
        assert_eq!(xids(&q, &arena), vec![None, Some(1), Some(2)]);
        assert_eq!(q.len(), 3);
    }

    #[test]
    fn unlink_middle_and_ends() {
        let mut arena = NodeArena::default();
        let mut q = ObjQueue::default();
        let a = q.push_back(&mut arena, obj(1));
        let b = q.push_back(&mut arena, obj(2));
        let c = q.push_back(&mut arena, obj(3));
        q.unlink(&mut arena, b);
        assert_eq!(xids(&q, &arena), vec![Some(1), Some(3)]);
        q.unlink(&mut arena, c);
        q.unlink(&mut arena, a);
        assert!(q.is_empty());
        assert!(q.front(&arena).is_none());
        assert_eq!(arena.live(), 0);
    }

    #[test]
    fn freed_nodes_are_reused() {
        let mut arena = NodeArena::default();
        let mut q = ObjQueue::default();
        let a = q.push_back(&mut arena, obj(1));
        q.unlink(&mut arena, a);
        let b = q.push_back(&mut arena, QueueEntry::EndOfPass);
        assert_eq!(a, b);
    }

    #[test]
    fn move_single_element_is_noop() {
        let mut arena = NodeArena::default();
        let mut q = ObjQueue::default();
        let a = q.push_back(&mut arena, obj(1));
        q.move_to_back(&mut arena, a);
        assert_eq!(xids(&q, &arena), vec![Some(1)]);
    }
}
