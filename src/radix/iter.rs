//! Stateful, explicit-stack iterator over a [`RadixTree`].
//!
//! Grounded on the teacher's raw-pointer tree walks (`mm::vma_tree`):
//! no parent back-links, so the iterator carries its own path as a
//! stack of frames rather than walking up through the tree. Each frame
//! remembers how many bytes it contributed to the accumulated key so
//! popping a frame can truncate the key buffer back to where it was.
//!
//! Mutating the tree while an iterator over it is live is not checked
//! for — the borrow checker already forbids it, since `Iter` holds a
//! shared borrow of the tree for its entire lifetime.

use std::ptr::NonNull;

use super::node::{self, TAG_MASK, TAG_SCAN};
use super::tree::RadixTree;

struct Frame {
    node: NonNull<u8>,
    /// Bytes this frame pushed onto the key buffer (branch byte, if any,
    /// plus the node's own prefix). Used to truncate on pop.
    pushed_len: usize,
    emitted_self: bool,
    /// Sorted branch bytes still to descend into (scan) or mask
    /// children already materialized into a sorted list (mask).
    remaining: Vec<(u8, NonNull<u8>)>,
}

pub struct Iter<'a, V> {
    tree: &'a RadixTree<V>,
    stack: Vec<Frame>,
    key_buf: Vec<u8>,
}

impl<'a, V> Iter<'a, V> {
    pub(crate) fn new(tree: &'a RadixTree<V>) -> Self {
        let mut iter = Iter {
            tree,
            stack: Vec::new(),
            key_buf: Vec::new(),
        };
        if let Some(root) = tree.root_node() {
            iter.push_frame(root, 0);
        }
        iter
    }

    fn push_frame(&mut self, node: NonNull<u8>, branch_bytes: usize) {
        let prefix_len = match node::node_tag(node) {
            TAG_SCAN => {
                let prefix = self.tree.read_prefix_pub(node);
                self.key_buf.extend_from_slice(&prefix);
                prefix.len()
            }
            TAG_MASK => 0,
            _ => unreachable!("corrupt node tag"),
        };

        let remaining = match node::node_tag(node) {
            TAG_SCAN => {
                let branches = self.tree.scan_branches_pub(node);
                branches
                    .iter()
                    .enumerate()
                    .filter_map(|(i, &b)| self.tree.scan_child_pub(node, i).map(|c| (b, c)))
                    .collect()
            }
            TAG_MASK => self.tree.mask_children_pub(node),
            _ => unreachable!("corrupt node tag"),
        };

        self.stack.push(Frame {
            node,
            pushed_len: branch_bytes + prefix_len,
            emitted_self: false,
            remaining,
        });
    }
}

impl<'a, V> Iterator for Iter<'a, V> {
    type Item = (Vec<u8>, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let top = self.stack.last_mut()?;

            if !top.emitted_self {
                top.emitted_self = true;
                let value_ptr = self.tree.node_value_ptr_pub(top.node);
                if !value_ptr.is_null() {
                    return Some((self.key_buf.clone(), self.tree.value_ref(value_ptr)));
                }
                continue;
            }

            if top.remaining.is_empty() {
                let frame = self.stack.pop().unwrap();
                let new_len = self.key_buf.len() - frame.pushed_len;
                self.key_buf.truncate(new_len);
                continue;
            }

            let (byte, child) = top.remaining.remove(0);
            self.key_buf.push(byte);
            self.push_frame(child, 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tree::MemoryMode;
    use super::*;
    use crate::buddy::{BuddyAllocator, BuddyConfig};
    use std::sync::Arc;

    #[test]
    fn iterates_in_ascending_key_order() {
        let buddy = Arc::new(BuddyAllocator::new(BuddyConfig::default()));
        let mut tree: RadixTree<u32> = RadixTree::new(buddy, MemoryMode::Compact).unwrap();
        let words = ["banana", "apple", "cherry", "app", "ap"];
        for (i, w) in words.iter().enumerate() {
            tree.insert(w.as_bytes(), i as u32).unwrap();
        }
        let collected: Vec<Vec<u8>> = tree.iter().map(|(k, _)| k).collect();
        let mut expected: Vec<Vec<u8>> = words.iter().map(|w| w.as_bytes().to_vec()).collect();
        expected.sort();
        assert_eq!(collected, expected);
    }

    #[test]
    fn empty_tree_iterates_to_nothing() {
        let buddy = Arc::new(BuddyAllocator::new(BuddyConfig::default()));
        let tree: RadixTree<u32> = RadixTree::new(buddy, MemoryMode::Compact).unwrap();
        assert_eq!(tree.iter().count(), 0);
    }
}
