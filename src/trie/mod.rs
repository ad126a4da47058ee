//! Prefix Tree
//!
//! Radix tree of string fragments stored in one node array.
//!
//! ## Layout
//! ```text
//! header:  ┌────────────────┬──────────────┐
//!          │ Nodes ptr (8)  │ Has null (1) │
//!          └───────┬────────┴──────────────┘
//!                  ▼
//!   nodes: [0: root ""] [1: "te"] [2: "a" *] [3: "n" *] [None] ...
//!
//!              ""            "tea" and "ten" stored;
//!              └── "te"      * marks terminal nodes
//!                  ├── "a" *
//!                  └── "n" *
//! ```
//!
//! ## Invariants
//! - The root sits at index 0 and has an empty fragment.
//! - Siblings start with distinct characters and are kept sorted, so a
//!   pre-order walk yields keys in lexicographic order.
//! - A non-root node that is not terminal has at least two children.
//! - The null key is a header flag, not a node.

mod node;

pub use node::TrieNode;

use node::common_prefix;

use bytes::{BufMut, BytesMut};

use crate::array::ContiguousArray;
use crate::config::Config;
use crate::error::{IoCollError, Result};
use crate::slots::FreeSlots;
use crate::storage::{ChunkPtr, Storage};

/// Header size: Nodes ptr (8) + Has null (1)
const HEADER_SIZE: u64 = 9;

/// Persistent set of strings (plus an optional null key)
pub struct PrefixTree {
    storage: Storage,
    ptr: ChunkPtr,
    config: Config,
    nodes: ContiguousArray<Option<TrieNode>>,
    has_null: bool,
    free_nodes: FreeSlots,
    count: Option<u64>,
}

impl PrefixTree {
    pub fn create(storage: &Storage, config: &Config) -> Result<Self> {
        let ptr = storage.allocate(HEADER_SIZE, None)?;
        let mut nodes = ContiguousArray::create(storage, config)?;
        nodes.add(Some(TrieNode::default()))?;
        let mut free_nodes = FreeSlots::new();
        free_nodes.reset();

        let tree = Self {
            storage: storage.clone(),
            ptr,
            config: config.clone(),
            nodes,
            has_null: false,
            free_nodes,
            count: Some(0),
        };
        tree.write_header(false)?;
        Ok(tree)
    }

    pub fn open(storage: &Storage, ptr: ChunkPtr, config: &Config) -> Result<Self> {
        let mut header = [0u8; HEADER_SIZE as usize];
        storage.read_exact(ptr, 0, &mut header)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&header[..8]);
        let nodes_ptr = ChunkPtr::new(u64::from_le_bytes(raw));
        let nodes = ContiguousArray::open(storage, nodes_ptr, config)?;
        if nodes.is_empty() {
            return Err(IoCollError::Corruption(format!("prefix tree {} has no root", ptr)));
        }
        Ok(Self {
            storage: storage.clone(),
            ptr,
            config: config.clone(),
            nodes,
            has_null: header[8] != 0,
            free_nodes: FreeSlots::new(),
            count: None,
        })
    }

    pub fn ptr(&self) -> ChunkPtr {
        self.ptr
    }

    /// Number of keys (null included); counted by one walk after open
    pub fn len(&mut self) -> Result<u64> {
        if let Some(count) = self.count {
            return Ok(count + self.has_null as u64);
        }
        let mut count = 0u64;
        for node in self.nodes.iter() {
            if node?.is_some_and(|n| n.terminal) {
                count += 1;
            }
        }
        self.count = Some(count);
        Ok(count + self.has_null as u64)
    }

    pub fn is_empty(&mut self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Live nodes, root included
    pub fn node_count(&mut self) -> Result<u64> {
        self.scan_free_nodes()?;
        Ok(self.nodes.len() - self.free_nodes.len())
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn contains(&self, key: Option<&str>) -> Result<bool> {
        let Some(key) = key else {
            return Ok(self.has_null);
        };
        let mut node = self.node(0)?;
        let mut rest = key;
        loop {
            if rest.is_empty() {
                return Ok(node.terminal);
            }
            let Some((_, child)) = self.child_starting_with(&node, rest)? else {
                return Ok(false);
            };
            let Some(tail) = rest.strip_prefix(child.fragment.as_str()) else {
                return Ok(false);
            };
            rest = tail;
            node = child;
        }
    }

    /// Keys in lexicographic order, null first
    pub fn iter(&self) -> TrieIter<'_> {
        TrieIter {
            tree: self,
            null_pending: self.has_null,
            stack: vec![(0, String::new())],
            visited: 0,
        }
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Insert; false if the key was already present
    pub fn add(&mut self, key: Option<&str>) -> Result<bool> {
        let Some(key) = key else {
            if self.has_null {
                return Ok(false);
            }
            self.write_header(true)?;
            self.has_null = true;
            return Ok(true);
        };

        let added = self.mutate(|tree| tree.insert_key(key))?;
        if added {
            self.count = self.count.map(|c| c + 1);
        }
        if added && self.config.validate {
            self.validate()?;
        }
        Ok(added)
    }

    /// Remove; false if the key was absent
    pub fn remove(&mut self, key: Option<&str>) -> Result<bool> {
        let Some(key) = key else {
            if !self.has_null {
                return Ok(false);
            }
            self.write_header(false)?;
            self.has_null = false;
            return Ok(true);
        };

        let removed = self.mutate(|tree| tree.remove_key(key))?;
        if removed {
            self.count = self.count.map(|c| c - 1);
        }
        if removed && self.config.validate {
            self.validate()?;
        }
        Ok(removed)
    }

    pub fn clear(&mut self) -> Result<()> {
        self.mutate(|tree| {
            tree.nodes.clear()?;
            tree.nodes.add(Some(TrieNode::default()))?;
            tree.write_header(false)?;
            Ok(())
        })?;
        self.free_nodes.reset();
        self.has_null = false;
        self.count = Some(0);
        Ok(())
    }

    pub fn free(self) -> Result<()> {
        let storage = self.storage.clone();
        storage.transaction(|| {
            self.nodes.free()?;
            storage.free(self.ptr)
        })
    }

    // =========================================================================
    // Validation
    // =========================================================================

    /// Check reachability, sibling order and minimality
    pub fn validate(&self) -> Result<()> {
        let corrupt = |msg: String| IoCollError::Corruption(format!("prefix tree {}: {}", self.ptr, msg));

        let root = self.node(0)?;
        if !root.fragment.is_empty() {
            return Err(corrupt("root has a fragment".to_string()));
        }

        let mut seen = vec![false; self.nodes.len() as usize];
        let mut stack = vec![0u64];
        let mut terminals = 0u64;
        while let Some(index) = stack.pop() {
            let slot = seen
                .get_mut(index as usize)
                .ok_or_else(|| corrupt(format!("child index {} out of range", index)))?;
            if *slot {
                return Err(corrupt(format!("node {} reachable twice", index)));
            }
            *slot = true;

            let node = self.node(index)?;
            if index != 0 {
                if node.fragment.is_empty() {
                    return Err(corrupt(format!("node {} has an empty fragment", index)));
                }
                if !node.terminal && node.children.len() < 2 {
                    return Err(corrupt(format!("node {} should have been merged", index)));
                }
            }
            terminals += node.terminal as u64;

            let mut previous: Option<char> = None;
            for &child in &node.children {
                let first = self.node(child)?.first_char();
                if first.is_none() || first <= previous {
                    return Err(corrupt(format!("children of node {} are not sorted", index)));
                }
                previous = first;
                stack.push(child);
            }
        }

        for (index, node) in self.nodes.iter().enumerate() {
            if node?.is_some() && !seen[index] {
                return Err(corrupt(format!("node {} is unreachable", index)));
            }
        }
        if let Some(count) = self.count {
            if count != terminals {
                return Err(corrupt(format!("count {} but {} terminal nodes", count, terminals)));
            }
        }
        Ok(())
    }

    // =========================================================================
    // Internal Helpers
    // =========================================================================

    fn write_header(&self, has_null: bool) -> Result<()> {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE as usize);
        buf.put_u64_le(self.nodes.ptr().get());
        buf.put_u8(has_null as u8);
        self.storage.write(self.ptr, 0, &buf)
    }

    fn mutate<R>(&mut self, f: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        let storage = self.storage.clone();
        let result = storage.transaction(|| f(self));
        if result.is_err() {
            self.free_nodes.invalidate();
            self.count = None;
            self.nodes = ContiguousArray::open(&self.storage, self.nodes.ptr(), &self.config)?;
        }
        result
    }

    fn node(&self, index: u64) -> Result<TrieNode> {
        self.nodes.get(index)?.ok_or_else(|| {
            IoCollError::Corruption(format!("prefix tree {} reached freed node {}", self.ptr, index))
        })
    }

    fn set_node(&mut self, index: u64, node: TrieNode) -> Result<()> {
        self.nodes.set(index, Some(node))
    }

    /// The child whose fragment shares a first character with `rest`
    fn child_starting_with(&self, node: &TrieNode, rest: &str) -> Result<Option<(u64, TrieNode)>> {
        let first = rest.chars().next();
        for &index in &node.children {
            let child = self.node(index)?;
            if child.first_char() == first {
                return Ok(Some((index, child)));
            }
        }
        Ok(None)
    }

    /// Insert `index` into `parent.children`, keeping siblings sorted
    fn link_child(&self, parent: &mut TrieNode, index: u64, first: Option<char>) -> Result<()> {
        let mut position = parent.children.len();
        for (i, &sibling) in parent.children.iter().enumerate() {
            if self.node(sibling)?.first_char() > first {
                position = i;
                break;
            }
        }
        parent.children.insert(position, index);
        Ok(())
    }

    fn insert_key(&mut self, key: &str) -> Result<bool> {
        let mut index = 0u64;
        let mut node = self.node(0)?;
        let mut rest = key;

        loop {
            if rest.is_empty() {
                if node.terminal {
                    return Ok(false);
                }
                node.terminal = true;
                self.set_node(index, node)?;
                return Ok(true);
            }

            let Some((child_index, mut child)) = self.child_starting_with(&node, rest)? else {
                let leaf = self.alloc_node(TrieNode::leaf(rest))?;
                self.link_child(&mut node, leaf, rest.chars().next())?;
                self.set_node(index, node)?;
                return Ok(true);
            };

            let shared = common_prefix(&child.fragment, rest);
            if shared == child.fragment.len() {
                index = child_index;
                node = child;
                rest = &rest[shared..];
                continue;
            }

            // Split: the child keeps the shared prefix, its old payload moves down
            let tail = TrieNode {
                fragment: child.fragment[shared..].to_string(),
                children: std::mem::take(&mut child.children),
                terminal: child.terminal,
            };
            let tail_first = tail.first_char();
            let tail_index = self.alloc_node(tail)?;
            child.fragment.truncate(shared);
            child.children = vec![tail_index];
            child.terminal = rest.len() == shared;
            if !child.terminal {
                let remainder = &rest[shared..];
                let leaf = self.alloc_node(TrieNode::leaf(remainder))?;
                self.link_child(&mut child, leaf, remainder.chars().next())?;
            }
            tracing::trace!(
                "prefix tree {} split node {} at {} (tail {:?})",
                self.ptr,
                child_index,
                shared,
                tail_first
            );
            self.set_node(child_index, child)?;
            return Ok(true);
        }
    }

    fn remove_key(&mut self, key: &str) -> Result<bool> {
        let mut path = vec![0u64];
        let mut node = self.node(0)?;
        let mut rest = key;

        while !rest.is_empty() {
            let Some((child_index, child)) = self.child_starting_with(&node, rest)? else {
                return Ok(false);
            };
            let Some(tail) = rest.strip_prefix(child.fragment.as_str()) else {
                return Ok(false);
            };
            rest = tail;
            path.push(child_index);
            node = child;
        }
        if !node.terminal {
            return Ok(false);
        }
        node.terminal = false;

        // Pop emptied leaves upward, then merge a pass-through node into its child
        let mut depth = path.len() - 1;
        loop {
            let index = path[depth];
            if index == 0 || node.terminal || node.children.len() > 1 {
                self.set_node(index, node)?;
                break;
            }
            if node.children.len() == 1 {
                let only = node.children[0];
                let child = self.node(only)?;
                node.fragment.push_str(&child.fragment);
                node.children = child.children;
                node.terminal = child.terminal;
                self.set_node(index, node)?;
                self.free_node(only)?;
                break;
            }

            self.free_node(index)?;
            depth -= 1;
            let parent_index = path[depth];
            node = self.node(parent_index)?;
            node.children.retain(|&c| c != index);
        }
        Ok(true)
    }

    fn scan_free_nodes(&mut self) -> Result<()> {
        if self.free_nodes.is_scanned() {
            return Ok(());
        }
        let nodes = &self.nodes;
        self.free_nodes
            .ensure_scanned(nodes.len(), |i| Ok(nodes.get(i)?.is_none()))
    }

    fn alloc_node(&mut self, node: TrieNode) -> Result<u64> {
        self.scan_free_nodes()?;
        match self.free_nodes.take_highest() {
            Some(index) => {
                tracing::trace!("prefix tree {} reuses node slot {}", self.ptr, index);
                self.nodes.set(index, Some(node))?;
                Ok(index)
            }
            None => self.nodes.add(Some(node)),
        }
    }

    fn free_node(&mut self, index: u64) -> Result<()> {
        self.scan_free_nodes()?;
        self.nodes.set(index, None)?;
        self.free_nodes.release(index);
        while self.nodes.len() > 1 && self.free_nodes.remove(self.nodes.len() - 1) {
            self.nodes.pop()?;
        }
        Ok(())
    }
}

// =============================================================================
// Iterator
// =============================================================================

/// Pre-order walk yielding full keys
pub struct TrieIter<'a> {
    tree: &'a PrefixTree,
    null_pending: bool,
    stack: Vec<(u64, String)>,
    visited: u64,
}

impl<'a> Iterator for TrieIter<'a> {
    type Item = Result<Option<String>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.null_pending {
            self.null_pending = false;
            return Some(Ok(None));
        }
        while let Some((index, prefix)) = self.stack.pop() {
            self.visited += 1;
            if self.visited > self.tree.nodes.len() {
                self.stack.clear();
                return Some(Err(IoCollError::Corruption(format!(
                    "prefix tree {} has a cycle",
                    self.tree.ptr
                ))));
            }
            let node = match self.tree.node(index) {
                Ok(node) => node,
                Err(e) => {
                    self.stack.clear();
                    return Some(Err(e));
                }
            };
            let key = prefix + &node.fragment;
            // Reverse so the smallest child is popped first
            for &child in node.children.iter().rev() {
                self.stack.push((child, key.clone()));
            }
            if node.terminal {
                return Some(Ok(Some(key)));
            }
        }
        None
    }
}
