//! Round-trip / idempotence laws for the radix tree, checked against
//! randomly generated key/value sets rather than a fixed example list.

use std::collections::BTreeMap;
use std::sync::Arc;

use mc_core::buddy::{BuddyAllocator, BuddyConfig};
use mc_core::{MemoryMode, RadixTree};
use proptest::prelude::*;

fn fresh_tree() -> RadixTree<u32> {
    let buddy = Arc::new(BuddyAllocator::new(BuddyConfig::default()));
    RadixTree::new(buddy, MemoryMode::Compact).unwrap()
}

proptest! {
    #[test]
    fn insert_then_find_round_trips(
        pairs in prop::collection::vec((prop::collection::vec(any::<u8>(), 0..16), any::<u32>()), 0..200)
    ) {
        let mut tree = fresh_tree();
        let mut model: BTreeMap<Vec<u8>, u32> = BTreeMap::new();

        for (key, value) in &pairs {
            tree.insert(key, *value).unwrap();
            model.insert(key.clone(), *value);
        }

        for (key, value) in &model {
            prop_assert_eq!(tree.get(key), Some(value));
        }
        prop_assert_eq!(tree.len(), model.len());
    }

    #[test]
    fn insert_same_key_twice_keeps_the_second_value(
        key in prop::collection::vec(any::<u8>(), 1..16),
        v1 in any::<u32>(),
        v2 in any::<u32>(),
    ) {
        let mut tree = fresh_tree();
        tree.insert(&key, v1).unwrap();
        let replaced = tree.insert(&key, v2).unwrap();
        prop_assert_eq!(replaced, Some(v1));
        prop_assert_eq!(tree.get(&key), Some(&v2));
    }

    #[test]
    fn insert_then_erase_leaves_no_trace(
        pairs in prop::collection::vec((prop::collection::vec(any::<u8>(), 1..16), any::<u32>()), 1..100)
    ) {
        let mut tree = fresh_tree();
        let mut keys: Vec<Vec<u8>> = Vec::new();
        for (key, value) in &pairs {
            tree.insert(key, *value).unwrap();
            keys.push(key.clone());
        }
        for key in &keys {
            tree.remove(key);
        }
        prop_assert_eq!(tree.len(), 0);
        for key in &keys {
            prop_assert_eq!(tree.get(key), None);
        }
    }

    #[test]
    fn erase_order_does_not_affect_final_tree_size(
        pairs in prop::collection::vec((prop::collection::vec(any::<u8>(), 1..12), any::<u32>()), 1..60),
        seed in any::<u64>(),
    ) {
        let mut tree_a = fresh_tree();
        let mut tree_b = fresh_tree();
        let mut keys: Vec<Vec<u8>> = Vec::new();
        for (key, value) in &pairs {
            tree_a.insert(key, *value).unwrap();
            tree_b.insert(key, *value).unwrap();
            keys.push(key.clone());
        }

        let mut shuffled = keys.clone();
        let mut state = seed | 1;
        for i in (1..shuffled.len()).rev() {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            let j = (state as usize) % (i + 1);
            shuffled.swap(i, j);
        }

        for key in &keys {
            tree_a.remove(key);
        }
        for key in &shuffled {
            tree_b.remove(key);
        }

        prop_assert_eq!(tree_a.len(), tree_b.len());
        prop_assert_eq!(tree_a.len(), 0);
    }
}
