//! Per-area fragment index.
//!
//! Every translated block is linked onto the list of each source area it
//! reads from: one head node on the area containing its tag, extra nodes
//! on every other spanned area, chained through `also`. Nodes and their
//! links live in a typed arena and are addressed by index, so blocks and
//! areas reference each other without ownership cycles; freeing a block is
//! freeing its arena slots once every area list has released them.
//!
//! List shape per area: doubly linked, circular on `prev` (the head's
//! `prev` is the tail) and NULL-terminated on `next`, making both prepend
//! and append O(1).

use std::collections::HashMap;

use core_interval::AppAddr;

use crate::collab::BlockHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

/// Node variant. The common links live outside the variant; dispatch is
/// on the variant, not on flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// One per block, on the list of the area containing the tag.
    Head { block: BlockHandle, tag: AppAddr },
    /// Membership in an additional spanned area.
    Extra { block: BlockHandle },
    /// The block does not exist yet; only its tag is known. Transient
    /// within one index mutation, never observable across calls.
    Pending { tag: AppAddr },
}

impl NodeKind {
    pub fn block(&self) -> Option<BlockHandle> {
        match self {
            NodeKind::Head { block, .. } | NodeKind::Extra { block } => Some(*block),
            NodeKind::Pending { .. } => None,
        }
    }
}

#[derive(Debug)]
pub struct Node {
    /// Source bounds of the block within its area.
    pub pc_start: AppAddr,
    pub pc_end: AppAddr,
    /// Circular: the head's `prev` is the list tail.
    pub prev: Option<NodeId>,
    /// NULL-terminated.
    pub next: Option<NodeId>,
    /// Chain to the block's other nodes, head first, NULL-terminated.
    pub also: Option<NodeId>,
    pub kind: NodeKind,
}

enum Slot {
    Occupied(Node),
    Free(Option<NodeId>),
}

/// Typed arena of fragment nodes plus the per-block head map.
pub struct FragmentArena {
    slots: Vec<Slot>,
    free_head: Option<NodeId>,
    heads: HashMap<BlockHandle, NodeId>,
}

impl Default for FragmentArena {
    fn default() -> Self {
        Self::new()
    }
}

impl FragmentArena {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: None,
            heads: HashMap::new(),
        }
    }

    pub fn live_blocks(&self) -> usize {
        self.heads.len()
    }

    fn alloc(&mut self, node: Node) -> NodeId {
        match self.free_head {
            Some(id) => {
                let next_free = match self.slots[id.0 as usize] {
                    Slot::Free(n) => n,
                    Slot::Occupied(_) => unreachable!("free list points at occupied slot"),
                };
                self.free_head = next_free;
                self.slots[id.0 as usize] = Slot::Occupied(node);
                id
            }
            None => {
                self.slots.push(Slot::Occupied(node));
                NodeId((self.slots.len() - 1) as u32)
            }
        }
    }

    fn release(&mut self, id: NodeId) {
        debug_assert!(matches!(self.slots[id.0 as usize], Slot::Occupied(_)));
        self.slots[id.0 as usize] = Slot::Free(self.free_head);
        self.free_head = Some(id);
    }

    pub fn node(&self, id: NodeId) -> &Node {
        match &self.slots[id.0 as usize] {
            Slot::Occupied(n) => n,
            Slot::Free(_) => panic!("dangling fragment node index"),
        }
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        match &mut self.slots[id.0 as usize] {
            Slot::Occupied(n) => n,
            Slot::Free(_) => panic!("dangling fragment node index"),
        }
    }

    // ---- list surgery ------------------------------------------------

    /// Place `id` at the head of the list; O(1).
    pub fn prepend(&mut self, head: &mut Option<NodeId>, id: NodeId) {
        match *head {
            None => {
                let n = self.node_mut(id);
                n.next = None;
                n.prev = Some(id); // sole node is its own tail
            }
            Some(old) => {
                let tail = self.node(old).prev;
                {
                    let n = self.node_mut(id);
                    n.next = Some(old);
                    n.prev = tail;
                }
                self.node_mut(old).prev = Some(id);
            }
        }
        *head = Some(id);
    }

    /// Place `id` at the tail; O(1) through the head's wrapped `prev`.
    pub fn append(&mut self, head: &mut Option<NodeId>, id: NodeId) {
        match *head {
            None => self.prepend(head, id),
            Some(h) => {
                let tail = self.node(h).prev.expect("non-empty list has a tail");
                {
                    let n = self.node_mut(id);
                    n.prev = Some(tail);
                    n.next = None;
                }
                self.node_mut(tail).next = Some(id);
                self.node_mut(h).prev = Some(id);
            }
        }
    }

    /// Disconnect `id` from the list. Does not free the slot and does not
    /// touch the `also` chain.
    pub fn unlink(&mut self, head: &mut Option<NodeId>, id: NodeId) {
        let (prev, next) = {
            let n = self.node(id);
            (n.prev, n.next)
        };
        if *head == Some(id) {
            match next {
                None => *head = None,
                Some(new_head) => {
                    // New head inherits the wrapped tail pointer.
                    self.node_mut(new_head).prev = prev;
                    *head = Some(new_head);
                }
            }
        } else {
            let prev = prev.expect("non-head node has a predecessor");
            self.node_mut(prev).next = next;
            match next {
                Some(nx) => self.node_mut(nx).prev = Some(prev),
                None => {
                    // Removing the tail: rewrap the head's prev.
                    if let Some(h) = *head {
                        self.node_mut(h).prev = Some(prev);
                    }
                }
            }
        }
        let n = self.node_mut(id);
        n.prev = None;
        n.next = None;
    }

    /// Concatenate `src` onto the end of `dst`; O(1).
    pub fn splice(&mut self, dst: &mut Option<NodeId>, src: Option<NodeId>) {
        let Some(src_head) = src else { return };
        match *dst {
            None => *dst = Some(src_head),
            Some(dst_head) => {
                let dst_tail = self.node(dst_head).prev.expect("non-empty list tail");
                let src_tail = self.node(src_head).prev.expect("non-empty list tail");
                self.node_mut(dst_tail).next = Some(src_head);
                self.node_mut(src_head).prev = Some(dst_tail);
                self.node_mut(dst_head).prev = Some(src_tail);
            }
        }
    }

    pub fn list_len(&self, head: Option<NodeId>) -> usize {
        let mut n = 0;
        let mut cur = head;
        while let Some(id) = cur {
            n += 1;
            cur = self.node(id).next;
        }
        n
    }

    pub fn list_nodes(&self, head: Option<NodeId>) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut cur = head;
        while let Some(id) = cur {
            out.push(id);
            cur = self.node(id).next;
        }
        out
    }

    // ---- block-level operations --------------------------------------

    pub fn head_of(&self, block: BlockHandle) -> Option<NodeId> {
        self.heads.get(&block).copied()
    }

    /// The live block whose tag is `tag`, if any.
    pub fn find_by_tag(&self, tag: AppAddr) -> Option<BlockHandle> {
        self.heads.iter().find_map(|(&block, &id)| {
            matches!(self.node(id).kind, NodeKind::Head { tag: t, .. } if t == tag)
                .then_some(block)
        })
    }

    /// All nodes of a block: head first, then the `also` chain.
    pub fn block_nodes(&self, block: BlockHandle) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut cur = self.head_of(block);
        while let Some(id) = cur {
            out.push(id);
            cur = self.node(id).also;
        }
        out
    }

    /// Min/max source bounds across every node of the block.
    pub fn source_span(&self, block: BlockHandle) -> Option<(AppAddr, AppAddr)> {
        let nodes = self.block_nodes(block);
        if nodes.is_empty() {
            return None;
        }
        let mut lo = AppAddr::MAX;
        let mut hi = 0;
        for id in nodes {
            let n = self.node(id);
            lo = lo.min(n.pc_start);
            hi = hi.max(n.pc_end);
        }
        Some((lo, hi))
    }

    /// Create the node set for a new block across its source regions.
    /// `regions` holds `(start, end, list_head_out)` where the third
    /// element is resolved by the caller per region; the head node goes to
    /// the region containing `tag`. Nodes are created in the transient
    /// `Pending` state and promoted once all links are in place, so a
    /// partially built chain is never observable as a real block.
    pub fn add_block<'a>(
        &mut self,
        block: BlockHandle,
        tag: AppAddr,
        regions: impl Iterator<Item = (AppAddr, AppAddr, &'a mut Option<NodeId>)>,
    ) -> Option<NodeId> {
        debug_assert!(self.head_of(block).is_none(), "block already indexed");
        let mut created: Vec<NodeId> = Vec::new();
        let mut head_pos: Option<usize> = None;
        for (start, end, list_head) in regions {
            let id = self.alloc(Node {
                pc_start: start,
                pc_end: end,
                prev: None,
                next: None,
                also: None,
                kind: NodeKind::Pending { tag },
            });
            self.prepend(list_head, id);
            if start <= tag && tag < end {
                head_pos = Some(created.len());
            }
            created.push(id);
        }
        // Caller guarantees the tag region is among `regions`.
        debug_assert!(head_pos.is_some(), "tag not covered by any region");
        let head_pos = head_pos?;
        // Promote: head node first in the also chain, extras after.
        let head_id = created.remove(head_pos);
        self.node_mut(head_id).kind = NodeKind::Head { block, tag };
        let mut prev = head_id;
        for id in created {
            self.node_mut(id).kind = NodeKind::Extra { block };
            self.node_mut(prev).also = Some(id);
            prev = id;
        }
        self.node_mut(prev).also = None;
        self.heads.insert(block, head_id);
        Some(head_id)
    }

    /// Remove every node of `block`, resolving each node's list head
    /// through `find_list`. Frees the slots and the head-map entry.
    pub fn remove_block(
        &mut self,
        block: BlockHandle,
        mut find_list: impl FnMut(AppAddr) -> *mut Option<NodeId>,
    ) -> bool {
        let nodes = self.block_nodes(block);
        if nodes.is_empty() {
            return false;
        }
        for id in nodes {
            let pc = self.node(id).pc_start;
            let list = find_list(pc);
            // The raw pointer bridges the caller's area payload borrow;
            // the caller owns both vector and arena under one lock.
            unsafe {
                self.unlink(&mut *list, id);
            }
            self.release(id);
        }
        self.heads.remove(&block);
        true
    }

    /// Detach every block on `head`'s list entirely (all areas), returning
    /// the handles. Used by the flush engine when an area is unlinked.
    pub fn drain_list(
        &mut self,
        head: &mut Option<NodeId>,
        mut find_list: impl FnMut(AppAddr) -> *mut Option<NodeId>,
    ) -> Vec<BlockHandle> {
        let mut out = Vec::new();
        while let Some(first) = *head {
            match self.node(first).kind.block() {
                Some(block) => {
                    for id in self.block_nodes(block) {
                        if self.on_list(*head, id) {
                            self.unlink(head, id);
                        } else {
                            // Extra node on a different area's list; the
                            // raw pointer bridges the caller's payload
                            // borrow, valid under the view's write lock.
                            let pc = self.node(id).pc_start;
                            let list = find_list(pc);
                            unsafe {
                                self.unlink(&mut *list, id);
                            }
                        }
                        self.release(id);
                    }
                    self.heads.remove(&block);
                    out.push(block);
                }
                None => {
                    // Stray pending node: drop it.
                    self.unlink(head, first);
                    self.release(first);
                }
            }
        }
        out
    }

    fn on_list(&self, head: Option<NodeId>, id: NodeId) -> bool {
        let mut cur = head;
        while let Some(c) = cur {
            if c == id {
                return true;
            }
            cur = self.node(c).next;
        }
        false
    }

    /// After two areas merge, one block may hold two nodes on the merged
    /// list. Keep one node per block (head preferred), splicing the
    /// redundant node out of the list and the `also` chain.
    pub fn cleanup_after_merge(&mut self, head: &mut Option<NodeId>) {
        let mut seen: HashMap<BlockHandle, NodeId> = HashMap::new();
        let mut victims: Vec<NodeId> = Vec::new();
        for id in self.list_nodes(*head) {
            let Some(block) = self.node(id).kind.block() else {
                continue;
            };
            match seen.get(&block) {
                None => {
                    seen.insert(block, id);
                }
                Some(&kept) => {
                    // Prefer keeping the head node.
                    let keep_new = matches!(self.node(id).kind, NodeKind::Head { .. });
                    if keep_new {
                        victims.push(kept);
                        seen.insert(block, id);
                    } else {
                        victims.push(id);
                    }
                }
            }
        }
        for id in victims {
            let block = self
                .node(id)
                .kind
                .block()
                .expect("victims carry real blocks");
            self.unlink(head, id);
            self.unchain_also(block, id);
            self.release(id);
        }
    }

    /// Splice `victim` out of its block's `also` chain.
    fn unchain_also(&mut self, block: BlockHandle, victim: NodeId) {
        let head = self.head_of(block).expect("live block has a head");
        debug_assert_ne!(head, victim, "the head node is never a merge victim");
        let mut cur = head;
        while let Some(next) = self.node(cur).also {
            if next == victim {
                let after = self.node(victim).also;
                self.node_mut(cur).also = after;
                self.node_mut(victim).also = None;
                return;
            }
            cur = next;
        }
        debug_assert!(false, "victim not found on also chain");
    }

    /// Debug invariants over one area's list: every node lies inside the
    /// bounds and no block appears twice.
    pub fn check_list(&self, head: Option<NodeId>, start: AppAddr, end: AppAddr) -> bool {
        let mut seen = std::collections::HashSet::new();
        for id in self.list_nodes(head) {
            let n = self.node(id);
            if n.pc_start < start || n.pc_start >= end {
                return false;
            }
            if let Some(b) = n.kind.block()
                && !seen.insert(b)
            {
                return false;
            }
        }
        true
    }
}
