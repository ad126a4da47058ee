//! Ordered Set
//!
//! Unbalanced binary search tree kept in two parallel arrays.
//!
//! ## Layout
//! ```text
//! header:  ┌──────────────────┬─────────────────┐
//!          │ Values ptr (8)   │ Nodes ptr (8)   │
//!          └────────┬─────────┴────────┬────────┘
//!                   ▼                  ▼
//!   values: [Some(v) | None] ...    nodes: [TreeNode] ...
//!                   ▲                  │
//!                   └── value_index ───┘   left / right index other nodes
//! ```
//!
//! ## Invariants
//! - A non-empty set keeps its root at node 0.
//! - Every live node owns exactly one live value slot.
//! - Removed slots become tombstones (`None` / `TreeNode::EMPTY`) and are
//!   reused highest-index first; a removed tail slot is popped instead.
//! - Removing a node with two children swaps its value with the in-order
//!   successor and removes the successor node instead.

mod node;

pub use node::TreeNode;

use std::cmp::Ordering;

use bytes::{BufMut, BytesMut};

use crate::array::ContiguousArray;
use crate::cache::AgedCache;
use crate::codec::{IoValue, NumberSize};
use crate::config::Config;
use crate::error::{IoCollError, Result};
use crate::slots::FreeSlots;
use crate::storage::{ChunkPtr, Storage};

/// Header size: Values ptr (8) + Nodes ptr (8)
const HEADER_SIZE: u64 = 16;

/// Where a node hangs off its parent
#[derive(Debug, Clone, Copy)]
enum Link {
    Root,
    Left(u64),
    Right(u64),
}

/// Persistent ordered set
pub struct IoTreeSet<T> {
    storage: Storage,
    ptr: ChunkPtr,
    config: Config,
    values: ContiguousArray<Option<T>>,
    nodes: ContiguousArray<TreeNode>,
    free_values: FreeSlots,
    free_nodes: FreeSlots,
    cache: AgedCache<u64, TreeNode>,
}

impl<T: IoValue + Ord> IoTreeSet<T> {
    pub fn create(storage: &Storage, config: &Config) -> Result<Self> {
        let ptr = storage.allocate(HEADER_SIZE, None)?;
        let values = ContiguousArray::create(storage, config)?;
        let nodes = ContiguousArray::create(storage, config)?;
        let mut free_values = FreeSlots::new();
        let mut free_nodes = FreeSlots::new();
        free_values.reset();
        free_nodes.reset();

        let set = Self {
            storage: storage.clone(),
            ptr,
            config: config.clone(),
            values,
            nodes,
            free_values,
            free_nodes,
            cache: AgedCache::new(config.node_cache_capacity),
        };
        set.write_header()?;
        Ok(set)
    }

    pub fn open(storage: &Storage, ptr: ChunkPtr, config: &Config) -> Result<Self> {
        let mut header = [0u8; HEADER_SIZE as usize];
        storage.read_exact(ptr, 0, &mut header)?;
        let values_ptr = ChunkPtr::new(NumberSize::Long.read_slice(&header[..8])?);
        let nodes_ptr = ChunkPtr::new(NumberSize::Long.read_slice(&header[8..])?);
        Ok(Self {
            storage: storage.clone(),
            ptr,
            config: config.clone(),
            values: ContiguousArray::open(storage, values_ptr, config)?,
            nodes: ContiguousArray::open(storage, nodes_ptr, config)?,
            free_values: FreeSlots::new(),
            free_nodes: FreeSlots::new(),
            cache: AgedCache::new(config.node_cache_capacity),
        })
    }

    pub fn ptr(&self) -> ChunkPtr {
        self.ptr
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of values; the first call after open scans for tombstones
    pub fn len(&mut self) -> Result<u64> {
        self.scan_free_values()?;
        Ok(self.values.len() - self.free_values.len())
    }

    /// Slots in the node array, tombstones included
    pub fn node_slots(&self) -> u64 {
        self.nodes.len()
    }

    /// Slots in the value array, tombstones included
    pub fn value_slots(&self) -> u64 {
        self.values.len()
    }

    /// (hits, misses) of the node cache
    pub fn cache_stats(&self) -> (u64, u64) {
        self.cache.hit_stats()
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn contains(&mut self, value: &T) -> Result<bool> {
        Ok(self.find(value)?.is_some())
    }

    pub fn root_value(&mut self) -> Result<Option<T>> {
        if self.is_empty() {
            return Ok(None);
        }
        let root = self.read_node(0)?;
        self.value_of(&root).map(Some)
    }

    /// Smallest value
    pub fn first(&mut self) -> Result<Option<T>> {
        self.extreme(|node| node.left())
    }

    /// Largest value
    pub fn last(&mut self) -> Result<Option<T>> {
        self.extreme(|node| node.right())
    }

    /// In-order iterator
    pub fn iter(&self) -> TreeIter<'_, T> {
        TreeIter {
            set: self,
            stack: Vec::new(),
            current: if self.is_empty() { None } else { Some(0) },
            steps: 0,
        }
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Insert; false if the value was already present
    pub fn add(&mut self, value: T) -> Result<bool> {
        if self.is_empty() {
            self.mutate(|set| {
                let value_index = set.alloc_value(value)?;
                let root = set.nodes.add(TreeNode::leaf(value_index))?;
                set.cache.insert(root, TreeNode::leaf(value_index));
                Ok(())
            })?;
            return Ok(true);
        }

        let mut index = 0u64;
        let (parent, link) = loop {
            let node = self.read_node(index)?;
            let current = self.value_of(&node)?;
            let next = match value.cmp(&current) {
                Ordering::Equal => return Ok(false),
                Ordering::Less => node.left().ok_or(Link::Left(index)),
                Ordering::Greater => node.right().ok_or(Link::Right(index)),
            };
            match next {
                Ok(child) => index = child,
                Err(link) => break (node, link),
            }
        };

        self.mutate(|set| {
            let value_index = set.alloc_value(value)?;
            let child = set.alloc_node(TreeNode::leaf(value_index))?;
            let mut parent = parent;
            let parent_index = match link {
                Link::Left(p) => {
                    parent.left = child as i64;
                    p
                }
                Link::Right(p) => {
                    parent.right = child as i64;
                    p
                }
                Link::Root => 0,
            };
            set.write_node(parent_index, parent)
        })?;

        if self.config.validate {
            self.validate()?;
        }
        Ok(true)
    }

    /// Remove; false if the value was absent
    pub fn remove(&mut self, value: &T) -> Result<bool> {
        let Some((index, link)) = self.find(value)? else {
            return Ok(false);
        };
        self.mutate(|set| set.remove_at(index, link))?;
        if self.config.validate {
            self.validate()?;
        }
        Ok(true)
    }

    pub fn clear(&mut self) -> Result<()> {
        self.mutate(|set| set.clear_arrays())
    }

    pub fn free(self) -> Result<()> {
        let storage = self.storage.clone();
        storage.transaction(|| {
            self.values.free()?;
            self.nodes.free()?;
            storage.free(self.ptr)
        })
    }

    // =========================================================================
    // Validation
    // =========================================================================

    /// Re-derive ordering, slot ownership and cache coherence from storage
    pub fn validate(&self) -> Result<()> {
        let corrupt = |msg: String| IoCollError::Corruption(format!("tree set {}: {}", self.ptr, msg));

        for key in self.cache.keys() {
            let cached = self.cache.peek(key).copied();
            let stored = self.nodes.get(*key)?;
            if cached != Some(stored) {
                return Err(corrupt(format!("cached node {} differs from storage", key)));
            }
        }

        if self.nodes.is_empty() {
            for value in self.values.iter() {
                if value?.is_some() {
                    return Err(corrupt("live value without any node".to_string()));
                }
            }
            return Ok(());
        }

        let mut seen_nodes = vec![false; self.nodes.len() as usize];
        let mut seen_values = vec![false; self.values.len() as usize];
        let mut stack: Vec<(u64, Option<T>, Option<T>)> = vec![(0, None, None)];
        let mut reachable = 0u64;

        while let Some((index, lower, upper)) = stack.pop() {
            let slot = seen_nodes
                .get_mut(index as usize)
                .ok_or_else(|| corrupt(format!("node index {} out of range", index)))?;
            if *slot {
                return Err(corrupt(format!("node {} reachable twice", index)));
            }
            *slot = true;

            let node = self.nodes.get(index)?;
            let value_index = node
                .value()
                .ok_or_else(|| corrupt(format!("reachable node {} is a tombstone", index)))?;
            let owned = seen_values
                .get_mut(value_index as usize)
                .ok_or_else(|| corrupt(format!("value index {} out of range", value_index)))?;
            if *owned {
                return Err(corrupt(format!("value slot {} owned twice", value_index)));
            }
            *owned = true;

            let value = self
                .values
                .get(value_index)?
                .ok_or_else(|| corrupt(format!("node {} points at tombstone {}", index, value_index)))?;
            if lower.as_ref().is_some_and(|low| &value <= low) || upper.as_ref().is_some_and(|high| &value >= high) {
                return Err(corrupt(format!("node {} violates ordering", index)));
            }
            reachable += 1;

            if let Some(left) = node.left() {
                stack.push((left, lower.clone(), Some(value.clone())));
            }
            if let Some(right) = node.right() {
                stack.push((right, Some(value), upper));
            }
        }

        let mut live = 0u64;
        for (index, value) in self.values.iter().enumerate() {
            if value?.is_some() {
                live += 1;
                if !seen_values[index] {
                    return Err(corrupt(format!("live value slot {} is unreachable", index)));
                }
            }
        }
        if live != reachable {
            return Err(corrupt(format!("{} live values but {} reachable nodes", live, reachable)));
        }
        Ok(())
    }

    // =========================================================================
    // Internal Helpers
    // =========================================================================

    fn write_header(&self) -> Result<()> {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE as usize);
        buf.put_u64_le(self.values.ptr().get());
        buf.put_u64_le(self.nodes.ptr().get());
        self.storage.write(self.ptr, 0, &buf)
    }

    /// Run a multi-step change as one transaction; on failure the in-memory
    /// state is rebuilt from what storage rolled back to
    fn mutate(&mut self, f: impl FnOnce(&mut Self) -> Result<()>) -> Result<()> {
        let storage = self.storage.clone();
        let result = storage.transaction(|| f(self));
        if result.is_err() {
            self.cache.clear();
            self.free_values.invalidate();
            self.free_nodes.invalidate();
            self.values = ContiguousArray::open(&self.storage, self.values.ptr(), &self.config)?;
            self.nodes = ContiguousArray::open(&self.storage, self.nodes.ptr(), &self.config)?;
        }
        result
    }

    fn read_node(&mut self, index: u64) -> Result<TreeNode> {
        if let Some(node) = self.cache.get(&index) {
            return Ok(node);
        }
        let node = self.nodes.get(index)?;
        self.cache.insert(index, node);
        Ok(node)
    }

    /// Uncached read for shared borrows
    fn peek_node(&self, index: u64) -> Result<TreeNode> {
        match self.cache.peek(&index) {
            Some(node) => Ok(*node),
            None => self.nodes.get(index),
        }
    }

    fn write_node(&mut self, index: u64, node: TreeNode) -> Result<()> {
        self.nodes.set(index, node)?;
        self.cache.insert(index, node);
        Ok(())
    }

    fn value_of(&self, node: &TreeNode) -> Result<T> {
        let index = node.value().ok_or_else(|| {
            IoCollError::Corruption(format!("tree set {} walked into an empty node", self.ptr))
        })?;
        self.values.get(index)?.ok_or_else(|| {
            IoCollError::Corruption(format!(
                "tree set {} node points at tombstone value {}",
                self.ptr, index
            ))
        })
    }

    /// Node holding `value` and how it hangs off its parent
    fn find(&mut self, value: &T) -> Result<Option<(u64, Link)>> {
        if self.is_empty() {
            return Ok(None);
        }
        let mut index = 0u64;
        let mut link = Link::Root;
        loop {
            let node = self.read_node(index)?;
            let current = self.value_of(&node)?;
            let next = match value.cmp(&current) {
                Ordering::Equal => return Ok(Some((index, link))),
                Ordering::Less => node.left().map(|child| (child, Link::Left(index))),
                Ordering::Greater => node.right().map(|child| (child, Link::Right(index))),
            };
            match next {
                Some((child, child_link)) => {
                    index = child;
                    link = child_link;
                }
                None => return Ok(None),
            }
        }
    }

    fn extreme(&mut self, step: impl Fn(&TreeNode) -> Option<u64>) -> Result<Option<T>> {
        if self.is_empty() {
            return Ok(None);
        }
        let mut node = self.read_node(0)?;
        while let Some(next) = step(&node) {
            node = self.read_node(next)?;
        }
        self.value_of(&node).map(Some)
    }

    fn remove_at(&mut self, index: u64, link: Link) -> Result<()> {
        let mut node = self.read_node(index)?;

        if let (Some(_), Some(right)) = (node.left(), node.right()) {
            // Leftmost node of the right subtree
            let mut successor_index = right;
            let mut successor_link = Link::Right(index);
            let mut successor = self.read_node(right)?;
            while let Some(left) = successor.left() {
                successor_link = Link::Left(successor_index);
                successor_index = left;
                successor = self.read_node(left)?;
            }

            std::mem::swap(&mut node.value_index, &mut successor.value_index);
            self.write_node(index, node)?;
            self.write_node(successor_index, successor)?;
            return self.remove_at(successor_index, successor_link);
        }

        let child = node.left().or(node.right());
        let value_index = node.value().ok_or_else(|| {
            IoCollError::Corruption(format!("tree set {} removing empty node {}", self.ptr, index))
        })?;

        match (link, child) {
            (Link::Root, None) => return self.clear_arrays(),
            (Link::Root, Some(child)) => {
                // The root stays at node 0: pull the child up into it
                let lifted = self.read_node(child)?;
                self.write_node(0, lifted)?;
                self.free_value(value_index)?;
                self.free_node(child)?;
            }
            (Link::Left(parent), child) | (Link::Right(parent), child) => {
                let mut parent_node = self.read_node(parent)?;
                let raw = child.map_or(node::NONE, |c| c as i64);
                if matches!(link, Link::Left(_)) {
                    parent_node.left = raw;
                } else {
                    parent_node.right = raw;
                }
                self.write_node(parent, parent_node)?;
                self.free_value(value_index)?;
                self.free_node(index)?;
            }
        }
        Ok(())
    }

    fn clear_arrays(&mut self) -> Result<()> {
        self.values.clear()?;
        self.nodes.clear()?;
        self.free_values.reset();
        self.free_nodes.reset();
        self.cache.clear();
        Ok(())
    }

    fn scan_free_values(&mut self) -> Result<()> {
        if self.free_values.is_scanned() {
            return Ok(());
        }
        let values = &self.values;
        self.free_values
            .ensure_scanned(values.len(), |i| Ok(values.get(i)?.is_none()))
    }

    fn scan_free_nodes(&mut self) -> Result<()> {
        if self.free_nodes.is_scanned() {
            return Ok(());
        }
        let nodes = &self.nodes;
        self.free_nodes
            .ensure_scanned(nodes.len(), |i| Ok(nodes.get(i)?.is_empty()))
    }

    fn alloc_value(&mut self, value: T) -> Result<u64> {
        self.scan_free_values()?;
        match self.free_values.take_highest() {
            Some(index) => {
                tracing::trace!("tree set {} reuses value slot {}", self.ptr, index);
                self.values.set(index, Some(value))?;
                Ok(index)
            }
            None => self.values.add(Some(value)),
        }
    }

    fn alloc_node(&mut self, node: TreeNode) -> Result<u64> {
        self.scan_free_nodes()?;
        let index = match self.free_nodes.take_highest() {
            Some(index) => {
                tracing::trace!("tree set {} reuses node slot {}", self.ptr, index);
                self.nodes.set(index, node)?;
                index
            }
            None => self.nodes.add(node)?,
        };
        self.cache.insert(index, node);
        Ok(index)
    }

    fn free_value(&mut self, index: u64) -> Result<()> {
        self.scan_free_values()?;
        self.values.set(index, None)?;
        self.free_values.release(index);
        // Pop tombstones off the tail instead of keeping them
        while self.values.len() > 0 && self.free_values.remove(self.values.len() - 1) {
            self.values.pop()?;
        }
        Ok(())
    }

    fn free_node(&mut self, index: u64) -> Result<()> {
        self.scan_free_nodes()?;
        self.write_node(index, TreeNode::EMPTY)?;
        self.free_nodes.release(index);
        while self.nodes.len() > 0 && self.free_nodes.remove(self.nodes.len() - 1) {
            let tail = self.nodes.len() - 1;
            self.nodes.pop()?;
            self.cache.remove(&tail);
        }
        Ok(())
    }
}

// =============================================================================
// Iterator
// =============================================================================

/// In-order iterator driven by an explicit stack
pub struct TreeIter<'a, T> {
    set: &'a IoTreeSet<T>,
    stack: Vec<TreeNode>,
    current: Option<u64>,
    steps: u64,
}

impl<'a, T: IoValue + Ord> Iterator for TreeIter<'a, T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(index) = self.current.take() {
                self.steps += 1;
                if self.steps > self.set.nodes.len() {
                    self.stack.clear();
                    return Some(Err(IoCollError::Corruption(format!(
                        "tree set {} has a cycle",
                        self.set.ptr
                    ))));
                }
                match self.set.peek_node(index) {
                    Ok(node) => {
                        self.current = node.left();
                        self.stack.push(node);
                        continue;
                    }
                    Err(e) => {
                        self.stack.clear();
                        return Some(Err(e));
                    }
                }
            }
            let node = self.stack.pop()?;
            self.current = node.right();
            return Some(self.set.value_of(&node));
        }
    }
}
