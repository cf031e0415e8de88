use std::sync::RwLock;

use log::debug;

use super::array::SortedArray;
use super::node::{Entry, Node, NodeId, NodeImage, NODE_HEADER};
use super::pair::{Element, Pair};
use crate::block::{Block, BlockStore, BlockType};
use crate::errdata;
use crate::error::{Error, Result};

// The smallest budget that admits the per-element cap: (total - 6) / 2
// must be at least one byte.
const MIN_TOTAL: u16 = NODE_HEADER as u16 + 2;

/// A B-tree of ordered elements whose nodes each fit one block-store
/// block. Insertion rebalances by splitting overflowing nodes toward the
/// root (popup); deletion pulls parent separators into emptied nodes and
/// absorbs the adjacent sibling (merge), then re-runs popup.
///
/// Operations take a readers/writer lock: `put`, `del` and `sync`
/// exclusively, `get` shared. The whole descent and rebalance is one
/// critical section.
pub struct BTree<E: Element = Pair> {
    total: u16,
    state: RwLock<TreeState<E>>,
}

struct TreeState<E: Element> {
    root: Option<NodeId>,
    nodes: Vec<Node<E>>,
    vacant: Vec<NodeId>,
    /// Blocks of nodes discarded by merges, erased on the next sync.
    reclaimed: Vec<u32>,
}

impl<E: Element> TreeState<E> {
    fn new() -> Self {
        Self {
            root: None,
            nodes: Vec::new(),
            vacant: Vec::new(),
            reclaimed: Vec::new(),
        }
    }

    fn alloc(&mut self, node: Node<E>) -> NodeId {
        match self.vacant.pop() {
            Some(id) => {
                self.nodes[id] = node;
                id
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    fn node(&self, id: NodeId) -> &Node<E> {
        &self.nodes[id]
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node<E> {
        &mut self.nodes[id]
    }

    /// Retires a node, queueing its block for erasure.
    fn release(&mut self, id: NodeId) {
        let block = self.nodes[id].block;
        if block != 0 {
            self.reclaimed.push(block);
        }
        self.nodes[id] = Node::new(None);
        self.vacant.push(id);
    }
}

impl<E: Element> BTree<E> {
    /// Constructs an empty tree with the given node byte budget.
    pub fn new(total: u16) -> Result<Self> {
        if total < MIN_TOTAL {
            return Err(Error::InsufficientRoom);
        }
        Ok(Self {
            total,
            state: RwLock::new(TreeState::new()),
        })
    }

    /// The node byte budget.
    pub fn total(&self) -> u16 {
        self.total
    }

    fn elem_cap(total: u16) -> usize {
        (total as usize - NODE_HEADER) / 2
    }

    /// Inserts an element, replacing any element with an equal key.
    pub fn put(&self, elem: E) -> Result<()> {
        if elem.size() > Self::elem_cap(self.total) {
            return Err(Error::InsufficientRoom);
        }
        let mut state = self.state.write()?;

        let Some(root) = state.root else {
            let mut node = Node::new(None);
            node.elems.insert(Entry { elem, after: None });
            let id = state.alloc(node);
            state.root = Some(id);
            return Ok(());
        };

        let probe = Entry { elem, after: None };
        let mut current = root;
        loop {
            let (pos, exact, first, left_after) = {
                let node = state.node(current);
                let (pos, exact) = node.elems.should_be(&probe);
                let left_after = if pos > 0 { node.elems[pos - 1].after } else { None };
                (pos, exact, node.first, left_after)
            };
            if exact {
                // Replace in place, preserving the entry's subtree. The
                // replacement may be larger than the original, so the
                // overflow check still runs.
                let node = state.node_mut(current);
                if let Some(entry) = node.elems.get_mut(pos) {
                    entry.elem = probe.elem;
                }
                node.synced = false;
                return self.popup(&mut state, current);
            }
            if pos == 0 {
                if let Some(first) = first {
                    current = first;
                    continue;
                }
            } else if let Some(after) = left_after {
                current = after;
                continue;
            }
            // Leaf position reached: splice and rebalance upward.
            let node = state.node_mut(current);
            node.elems.insert(probe);
            node.synced = false;
            return self.popup(&mut state, current);
        }
    }

    /// Looks up the element equal to `probe` (for pairs, equal by key).
    pub fn get(&self, probe: &E) -> Result<E> {
        let state = self.state.read()?;
        let mut current = state.root.ok_or(Error::NotFound)?;
        let probe = Entry {
            elem: probe.clone(),
            after: None,
        };
        loop {
            let node = state.node(current);
            let (pos, exact) = node.elems.should_be(&probe);
            if exact {
                return Ok(node.elems[pos].elem.clone());
            }
            let child = if pos == 0 {
                node.first
            } else {
                node.elems[pos - 1].after
            };
            match child {
                Some(id) => current = id,
                None => return Err(Error::NotFound),
            }
        }
    }

    /// Deletes the element equal to `probe`, if present. Deleting a
    /// missing element is a no-op.
    pub fn del(&self, probe: &E) -> Result<()> {
        let mut state = self.state.write()?;
        let Some(root) = state.root else {
            return Ok(());
        };
        let probe = Entry {
            elem: probe.clone(),
            after: None,
        };

        let mut current = root;
        loop {
            let (pos, exact, first, left_after) = {
                let node = state.node(current);
                let (pos, exact) = node.elems.should_be(&probe);
                let left_after = if pos > 0 { node.elems[pos - 1].after } else { None };
                (pos, exact, node.first, left_after)
            };
            if !exact {
                let child = if pos == 0 { first } else { left_after };
                match child {
                    Some(id) => {
                        current = id;
                        continue;
                    }
                    // Leaf with no match.
                    None => return Ok(()),
                }
            }

            let removed = {
                let node = state.node_mut(current);
                let entry = node.elems.remove(pos);
                node.synced = false;
                entry
            };
            if state.node(current).elems.is_empty() {
                self.merge(&mut state, current, &removed)?;
            } else if let Some(orphan) = removed.after {
                // The removed element's subtree falls between its left
                // neighbour's child and the successor; absorb it there.
                let left = {
                    let node = state.node(current);
                    if pos == 0 {
                        node.first
                    } else {
                        node.elems[pos - 1].after
                    }
                };
                match left {
                    Some(dst) => {
                        let spine = self.graft(&mut state, dst, orphan);
                        for id in spine.into_iter().rev() {
                            self.popup(&mut state, id)?;
                        }
                    }
                    None => {
                        state.node_mut(current).first = Some(orphan);
                        state.node_mut(orphan).parent = Some(current);
                    }
                }
            }
            break;
        }

        self.collapse_root(&mut state);
        Ok(())
    }

    /// Post-insert rebalance: walk from `n` toward the root, splitting
    /// every overflowing node at its midpoint and raising the separator
    /// into the parent.
    fn popup(&self, state: &mut TreeState<E>, mut n: NodeId) -> Result<()> {
        loop {
            if !state.node(n).overflows(self.total) {
                return Ok(());
            }
            let len = state.node(n).elems.len();
            if len < 3 {
                return Err(Error::InsufficientRoom);
            }
            let mid = len / 2;

            let (mut sep, right_entries, parent) = {
                let node = state.node_mut(n);
                let right = node.elems.split_off(mid + 1);
                let sep = match node.elems.pop() {
                    Some(entry) => entry,
                    None => {
                        return Err(Error::InvariantViolation(
                            "split of an empty node".into(),
                        ))
                    }
                };
                node.synced = false;
                (sep, right, node.parent)
            };

            // The new right sibling takes the elements above the
            // separator; the separator's old subtree becomes its first
            // child.
            let nn = state.alloc(Node {
                first: sep.after,
                elems: right_entries,
                parent,
                block: 0,
                synced: false,
            });
            let moved: Vec<NodeId> = {
                let node = state.node(nn);
                node.first
                    .into_iter()
                    .chain(node.elems.iter().filter_map(|entry| entry.after))
                    .collect()
            };
            for child in moved {
                state.node_mut(child).parent = Some(nn);
            }
            sep.after = Some(nn);

            match parent {
                None => {
                    // The split reached the root; grow the tree a level.
                    let top = state.alloc(Node::new(None));
                    state.node_mut(top).first = Some(n);
                    state.node_mut(top).elems.insert(sep);
                    state.node_mut(n).parent = Some(top);
                    state.node_mut(nn).parent = Some(top);
                    state.root = Some(top);
                    return Ok(());
                }
                Some(p) => {
                    let node = state.node_mut(p);
                    node.elems.insert(sep);
                    node.synced = false;
                    n = p;
                }
            }
        }
    }

    /// Post-delete rebalance for an emptied node: pull the adjacent
    /// parent separator down into `n`, absorb the sibling it separated
    /// from, and re-run popup. `removed` is the entry whose removal
    /// emptied `n` and positions the merge within the parent.
    fn merge(&self, state: &mut TreeState<E>, n: NodeId, removed: &Entry<E>) -> Result<()> {
        let Some(p) = state.node(n).parent else {
            // An emptied root collapses at the end of the operation, but
            // the removed separator's subtree must survive under it.
            if let Some(orphan) = removed.after {
                match state.node(n).first {
                    None => {
                        state.node_mut(n).first = Some(orphan);
                        state.node_mut(orphan).parent = Some(n);
                    }
                    Some(f) => {
                        let spine = self.graft(state, f, orphan);
                        for id in spine.into_iter().rev() {
                            self.popup(state, id)?;
                        }
                    }
                }
            }
            return Ok(());
        };
        let (pos, _) = state.node(p).elems.should_be(removed);

        let mut spines: Vec<NodeId> = Vec::new();
        let np_elem;
        if pos == 0 {
            // Right-merge: the first parent separator drops into n, and
            // n absorbs the separator's right subtree.
            let np = {
                let node = state.node_mut(p);
                node.synced = false;
                node.elems.remove(0)
            };
            np_elem = np.elem.clone();
            let mut np_entry = Entry {
                elem: np.elem,
                after: None,
            };

            // The removed element's subtree re-roots below n.
            if let Some(orphan) = removed.after {
                match state.node(n).first {
                    None => {
                        state.node_mut(n).first = Some(orphan);
                        state.node_mut(orphan).parent = Some(n);
                    }
                    Some(f) => spines.extend(self.graft(state, f, orphan)),
                }
            }

            match np.after {
                Some(sib) => {
                    // The sibling's first child covers the keys between
                    // the separator and the sibling's elements.
                    let sib_first = state.node(sib).first;
                    np_entry.after = sib_first;
                    if let Some(f) = sib_first {
                        state.node_mut(f).parent = Some(n);
                    }
                    let mut entries = std::mem::take(&mut state.node_mut(sib).elems);
                    let moved: Vec<NodeId> =
                        entries.iter().filter_map(|entry| entry.after).collect();
                    for child in moved {
                        state.node_mut(child).parent = Some(n);
                    }
                    let node = state.node_mut(n);
                    node.elems.insert(np_entry);
                    node.elems.append(&mut entries);
                    node.synced = false;
                    state.release(sib);
                }
                None => {
                    let node = state.node_mut(n);
                    node.elems.insert(np_entry);
                    node.synced = false;
                }
            }
        } else {
            // Left-merge: the separator left of n drops in after the
            // left sibling's elements, and n takes that sibling over.
            let np = {
                let node = state.node_mut(p);
                node.synced = false;
                node.elems.remove(pos - 1)
            };
            np_elem = np.elem.clone();
            let first_orig = state.node(n).first;
            let mut np_entry = Entry {
                elem: np.elem,
                after: first_orig,
            };
            if let Some(orphan) = removed.after {
                match first_orig {
                    None => {
                        np_entry.after = Some(orphan);
                        state.node_mut(orphan).parent = Some(n);
                    }
                    Some(f) => spines.extend(self.graft(state, f, orphan)),
                }
            }

            let left = if pos >= 2 {
                state.node(p).elems[pos - 2].after
            } else {
                state.node(p).first
            };
            if let Some(l) = left {
                let l_first = state.node(l).first;
                let mut entries = std::mem::take(&mut state.node_mut(l).elems);
                let moved: Vec<NodeId> = l_first
                    .into_iter()
                    .chain(entries.iter().filter_map(|entry| entry.after))
                    .collect();
                for child in moved {
                    state.node_mut(child).parent = Some(n);
                }
                let node = state.node_mut(n);
                node.first = l_first;
                node.elems = entries;
                node.elems.insert(np_entry);
                node.synced = false;
                state.release(l);
            } else {
                let node = state.node_mut(n);
                node.elems.insert(np_entry);
                node.synced = false;
            }
            // Removing the separator took the parent's pointer to n with
            // it; the left slot now leads to the combined node.
            if pos >= 2 {
                if let Some(entry) = state.node_mut(p).elems.get_mut(pos - 2) {
                    entry.after = Some(n);
                }
            } else {
                state.node_mut(p).first = Some(n);
            }
        }

        if state.node(p).elems.is_empty() && state.node(p).parent.is_some() {
            let removed_sep = Entry {
                elem: np_elem,
                after: None,
            };
            self.merge(state, p, &removed_sep)?;
        }
        for id in spines.into_iter().rev() {
            self.popup(state, id)?;
        }
        self.popup(state, n)
    }

    /// Absorbs `src` into `dst`, where every key of `src` orders after
    /// every key of `dst` and both roots sit at the same height. The
    /// recursion follows `src`'s left spine down to the leaves; returns
    /// the modified nodes, deepest last, so callers can re-run popup on
    /// each.
    fn graft(&self, state: &mut TreeState<E>, dst: NodeId, src: NodeId) -> Vec<NodeId> {
        let mut spine = vec![dst];
        if let Some(src_first) = state.node(src).first {
            let dst_last_after = {
                let node = state.node(dst);
                if node.elems.is_empty() {
                    node.first
                } else {
                    node.elems[node.elems.len() - 1].after
                }
            };
            match dst_last_after {
                Some(da) => spine.extend(self.graft(state, da, src_first)),
                None => {
                    state.node_mut(src_first).parent = Some(dst);
                    let node = state.node_mut(dst);
                    if node.elems.is_empty() {
                        node.first = Some(src_first);
                    } else {
                        let last = node.elems.len() - 1;
                        if let Some(entry) = node.elems.get_mut(last) {
                            entry.after = Some(src_first);
                        }
                    }
                }
            }
        }
        let mut entries = std::mem::take(&mut state.node_mut(src).elems);
        let moved: Vec<NodeId> = entries.iter().filter_map(|entry| entry.after).collect();
        for child in moved {
            state.node_mut(child).parent = Some(dst);
        }
        let node = state.node_mut(dst);
        node.elems.append(&mut entries);
        node.synced = false;
        state.release(src);
        spine
    }

    /// Drops an emptied root down to its first child.
    fn collapse_root(&self, state: &mut TreeState<E>) {
        let Some(root) = state.root else { return };
        if !state.node(root).elems.is_empty() {
            return;
        }
        let first = state.node(root).first;
        state.release(root);
        state.root = first;
        if let Some(f) = first {
            state.node_mut(f).parent = None;
        }
    }

    /// Persists every dirty node into `store`, children before parents,
    /// and erases the blocks of nodes discarded since the last sync.
    /// Returns the root's block index, 0 for an empty tree. Idempotent on
    /// a clean tree.
    pub fn sync(&self, store: &mut BlockStore) -> Result<u32> {
        let mut state = self.state.write()?;
        for i in 0..state.reclaimed.len() {
            store.erase(state.reclaimed[i])?;
        }
        state.reclaimed.clear();

        let Some(root) = state.root else {
            return Ok(0);
        };
        let root_block = self.sync_node(&mut state, store, root)?;
        debug!("synced tree to block {root_block}");
        Ok(root_block)
    }

    fn sync_node(
        &self,
        state: &mut TreeState<E>,
        store: &mut BlockStore,
        id: NodeId,
    ) -> Result<u32> {
        {
            let node = state.node(id);
            if node.synced && node.block != 0 {
                return Ok(node.block);
            }
        }

        let first_block = match state.node(id).first {
            Some(f) => self.sync_node(state, store, f)?,
            None => 0,
        };
        let mut elems = Vec::with_capacity(state.node(id).elems.len());
        for i in 0..state.node(id).elems.len() {
            let after = state.node(id).elems[i].after;
            let after_block = match after {
                Some(a) => self.sync_node(state, store, a)?,
                None => 0,
            };
            elems.push((state.node(id).elems[i].elem.clone(), after_block));
        }

        let image = NodeImage {
            first: first_block,
            total: self.total,
            elems,
        };
        let bytes = image.encode(Self::elem_cap(self.total))?;
        if bytes.len() > store.data_size() as usize {
            return Err(Error::PayloadTooLarge(store.data_size() as usize));
        }

        let block = state.node(id).block;
        let block = if block == 0 {
            let mut blocks = store.acquire(bytes.len())?;
            blocks[0].data = bytes;
            store.put(&blocks)?;
            blocks[0].index()
        } else {
            store.update(&Block::single(block, bytes))?;
            block
        };
        let node = state.node_mut(id);
        node.block = block;
        node.synced = true;
        Ok(block)
    }

    /// Materializes a tree from the node image rooted at block `root`.
    /// The node byte budget is recovered from the root image.
    pub fn load(store: &BlockStore, root: u32) -> Result<Self> {
        let image = Self::read_image(store, root)?;
        let total = image.total;
        if total < MIN_TOTAL {
            return Err(Error::InsufficientRoom);
        }
        let mut state = TreeState::new();
        let id = Self::load_node(&mut state, store, image, root, None)?;
        state.root = Some(id);
        Ok(Self {
            total,
            state: RwLock::new(state),
        })
    }

    fn load_node(
        state: &mut TreeState<E>,
        store: &BlockStore,
        image: NodeImage<E>,
        block: u32,
        parent: Option<NodeId>,
    ) -> Result<NodeId> {
        let id = state.alloc(Node {
            elems: SortedArray::new(),
            first: None,
            parent,
            block,
            synced: true,
        });
        if image.first != 0 {
            let child = Self::read_image(store, image.first)?;
            let first = Self::load_node(state, store, child, image.first, Some(id))?;
            state.node_mut(id).first = Some(first);
        }
        for (elem, after_block) in image.elems {
            let after = if after_block != 0 {
                let child = Self::read_image(store, after_block)?;
                Some(Self::load_node(state, store, child, after_block, Some(id))?)
            } else {
                None
            };
            state.node_mut(id).elems.insert(Entry { elem, after });
        }
        Ok(id)
    }

    fn read_image(store: &BlockStore, idx: u32) -> Result<NodeImage<E>> {
        let block = store.get(idx)?;
        if block.kind != BlockType::Single {
            return errdata!("block {idx} does not hold a tree node");
        }
        NodeImage::decode(&block.data)
    }
}
