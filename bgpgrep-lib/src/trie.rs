//! Binary radix trie over network prefixes, one instance per address
//! family.
//!
//! Nodes live in a `Vec` and reference each other through `u32` slot
//! indices, so a cleared trie keeps its allocation and lookups stay
//! cache-friendly. Each node corresponds to one prefix bit; a node flagged
//! `has_entry` represents a stored prefix whose length equals the node's
//! depth.

use thiserror::Error;

use crate::netaddr::{Afi, NetAddr};

/// Sentinel index meaning "no child".
const NO_NODE: u32 = u32::MAX;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrieError {
    #[error("address family does not match this trie")]
    FamilyMismatch,
}

/// Handle to a stored prefix; stable until the trie is cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeId(u32);

#[derive(Clone)]
struct Node {
    children: [u32; 2],
    has_entry: bool,
}

impl Node {
    fn new() -> Self {
        Node {
            children: [NO_NODE; 2],
            has_entry: false,
        }
    }
}

/// A set of prefixes of one address family, answering longest-prefix
/// relational queries.
pub struct PrefixTrie {
    afi: Afi,
    nodes: Vec<Node>,
    entries: usize,
}

impl PrefixTrie {
    /// Create an empty trie bound to one family.
    pub fn new(afi: Afi) -> Self {
        PrefixTrie {
            afi,
            nodes: vec![Node::new()],
            entries: 0,
        }
    }

    pub fn afi(&self) -> Afi {
        self.afi
    }

    /// Maximum prefix length this trie accepts: 32 or 128.
    pub fn max_bitlen(&self) -> u8 {
        self.afi.max_bitlen()
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    pub fn len(&self) -> usize {
        self.entries
    }

    fn check_family(&self, addr: &NetAddr) -> Result<(), TrieError> {
        if addr.afi() != self.afi {
            return Err(TrieError::FamilyMismatch);
        }
        Ok(())
    }

    /// Insert a prefix, returning a handle to its node. Inserting an
    /// already-present prefix returns the existing node.
    pub fn insert(&mut self, addr: &NetAddr) -> Result<NodeId, TrieError> {
        self.check_family(addr)?;
        let mut cur = 0u32;
        for i in 0..addr.bitlen() {
            let branch = usize::from(addr.bit(i));
            let next = self.nodes[cur as usize].children[branch];
            cur = if next == NO_NODE {
                let id = self.nodes.len() as u32;
                self.nodes.push(Node::new());
                self.nodes[cur as usize].children[branch] = id;
                id
            } else {
                next
            };
        }
        let node = &mut self.nodes[cur as usize];
        if !node.has_entry {
            node.has_entry = true;
            self.entries += 1;
        }
        Ok(NodeId(cur))
    }

    /// Remove an exact entry if present; silent otherwise. The node stays
    /// allocated until [`PrefixTrie::clear`].
    pub fn remove(&mut self, addr: &NetAddr) {
        if let Some(NodeId(id)) = self.search_exact(addr) {
            let node = &mut self.nodes[id as usize];
            if node.has_entry {
                node.has_entry = false;
                self.entries -= 1;
            }
        }
    }

    /// Find the entry with identical family, prefix length, and bits.
    pub fn search_exact(&self, addr: &NetAddr) -> Option<NodeId> {
        if addr.afi() != self.afi {
            return None;
        }
        let mut cur = 0u32;
        for i in 0..addr.bitlen() {
            let branch = usize::from(addr.bit(i));
            cur = self.nodes[cur as usize].children[branch];
            if cur == NO_NODE {
                return None;
            }
        }
        self.nodes[cur as usize].has_entry.then_some(NodeId(cur))
    }

    /// True iff the trie contains a prefix `p` with `bitlen(p) <=
    /// bitlen(addr)` that covers `addr`.
    pub fn is_subnet_of_any(&self, addr: &NetAddr) -> bool {
        if addr.afi() != self.afi {
            return false;
        }
        let mut cur = 0u32;
        if self.nodes[0].has_entry {
            return true; // 0.0.0.0/0 or ::/0 covers everything
        }
        for i in 0..addr.bitlen() {
            let branch = usize::from(addr.bit(i));
            cur = self.nodes[cur as usize].children[branch];
            if cur == NO_NODE {
                return false;
            }
            if self.nodes[cur as usize].has_entry {
                return true;
            }
        }
        false
    }

    /// True iff the trie contains a prefix `p` with `bitlen(p) >=
    /// bitlen(addr)` that `addr` covers.
    pub fn is_supernet_of_any(&self, addr: &NetAddr) -> bool {
        if addr.afi() != self.afi {
            return false;
        }
        let mut cur = 0u32;
        for i in 0..addr.bitlen() {
            let branch = usize::from(addr.bit(i));
            cur = self.nodes[cur as usize].children[branch];
            if cur == NO_NODE {
                return false;
            }
        }
        self.subtree_has_entry(cur)
    }

    /// Either of the two relational queries, inclusive of exact match.
    pub fn is_related_of_any(&self, addr: &NetAddr) -> bool {
        self.is_subnet_of_any(addr) || self.is_supernet_of_any(addr)
    }

    fn subtree_has_entry(&self, root: u32) -> bool {
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let node = &self.nodes[id as usize];
            if node.has_entry {
                return true;
            }
            for &child in &node.children {
                if child != NO_NODE {
                    stack.push(child);
                }
            }
        }
        false
    }

    /// Empty the trie without releasing its allocation.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.nodes.push(Node::new());
        self.entries = 0;
    }
}
