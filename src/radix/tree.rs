//! Variable-depth PATRICIA radix tree over byte-string keys.
//!
//! Grounded on the teacher's `mm::vma_tree` (raw-pointer tree node
//! manipulation, no `Box`/`Rc`, explicit alloc/free pairing) generalized
//! from a single fixed key shape (virtual address ranges) to arbitrary
//! byte strings, plus the two node shapes and pointer-width modes from
//! [`super::node`]. Storage for nodes, prefix overflow, and mask-node
//! group tables all come from a per-tree [`MiniBuddy`]; values live in a
//! dedicated [`Pool`] so node size never depends on `V`.

use std::ptr::NonNull;
use std::sync::Arc;

use crate::buddy::BuddyAllocator;
use crate::error::RadixError;
use crate::mini_buddy::MiniBuddy;
use crate::node_pool::Pool;
use crate::radix::node::{self, PtrWidth, GROUP_SIZE, NODE_SIZE, PREFIX_INLINE, TAG_MASK, TAG_SCAN};
use crate::radix::simd;

/// Governs child-pointer width for the lifetime of a tree. Chosen once
/// at construction; a tree never renegotiates it (see the module docs
/// on why dynamic promotion is out of scope).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MemoryMode {
    /// 32-bit offsets from the tree's arena base. More branches per
    /// node; the tree must stay within ~4 GiB of its first allocation.
    Compact,
    /// Raw 64-bit pointers. Fewer branches per node; no arena-base
    /// bookkeeping on the hot path.
    Performance,
}

impl MemoryMode {
    fn width(self) -> PtrWidth {
        match self {
            MemoryMode::Compact => PtrWidth::Short,
            MemoryMode::Performance => PtrWidth::Long,
        }
    }
}

pub struct RadixTree<V> {
    mode: MemoryMode,
    width: PtrWidth,
    arena_base: usize,
    root: Option<NonNull<u8>>,
    mini: MiniBuddy,
    values: Pool<V>,
    len: usize,
}

// SAFETY: every pointer field is reachable only through `&mut self`
// methods.
unsafe impl<V: Send> Send for RadixTree<V> {}

impl<V> RadixTree<V> {
    pub fn new(buddy: Arc<BuddyAllocator>, mode: MemoryMode) -> Result<Self, RadixError> {
        Self::with_pool_block_size(buddy, mode, 1 << 15)
    }

    pub fn with_pool_block_size(
        buddy: Arc<BuddyAllocator>,
        mode: MemoryMode,
        pool_block_size: usize,
    ) -> Result<Self, RadixError> {
        let mini = MiniBuddy::new(Arc::clone(&buddy), pool_block_size)
            .map_err(|_| RadixError::OutOfMemory)?;
        let values =
            Pool::new(buddy, pool_block_size).map_err(|_| RadixError::OutOfMemory)?;
        Ok(Self {
            mode,
            width: mode.width(),
            arena_base: 0,
            root: None,
            mini,
            values,
            len: 0,
        })
    }

    pub fn mode(&self) -> MemoryMode {
        self.mode
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Resets the tree to empty, keeping backing blocks cached for
    /// reuse. Like the node pool it builds on, this does not run `V`'s
    /// `Drop` for values still present at the time of the call — callers
    /// storing a `V` with meaningful drop glue should `remove` every key
    /// first if that glue must run.
    pub fn clear(&mut self) {
        self.mini.clear();
        self.values.clear();
        self.arena_base = 0;
        self.root = None;
        self.len = 0;
    }

    fn node_value_mut<'a>(&'a self, ptr: *mut u8) -> Option<&'a V> {
        if ptr.is_null() {
            None
        } else {
            Some(unsafe { &*(ptr as *const V) })
        }
    }

    // ---- node-local accessors ------------------------------------------

    unsafe fn read_prefix(&self, node: NonNull<u8>) -> Vec<u8> {
        unsafe {
            let header = node::as_scan_header(node);
            let len = (*header).prefix_len as usize;
            if (*header).prefix_overflow == 0 {
                (*header).prefix[..len.min(PREFIX_INLINE)].to_vec()
            } else {
                let mut v = (*header).prefix.to_vec();
                let companion = NonNull::new((*header).companion).expect("overflow without companion");
                let comp_len =
                    (*(companion.as_ptr() as *const node::PrefixCompanion)).len as usize;
                let comp_bytes =
                    std::slice::from_raw_parts(node::PrefixCompanion::bytes(companion), comp_len);
                v.extend_from_slice(comp_bytes);
                v.truncate(len);
                v
            }
        }
    }

    unsafe fn write_prefix(&mut self, node: NonNull<u8>, bytes: &[u8]) {
        unsafe {
            let header = node::as_scan_header(node);
            let inline_len = bytes.len().min(PREFIX_INLINE);
            (*header).prefix[..inline_len].copy_from_slice(&bytes[..inline_len]);
            (*header).prefix_len = bytes.len() as u8;

            if bytes.len() <= PREFIX_INLINE {
                (*header).prefix_overflow = 0;
                (*header).companion = std::ptr::null_mut();
                return;
            }

            (*header).prefix_overflow = 1;
            let overflow = &bytes[PREFIX_INLINE..];
            let needed = std::mem::size_of::<node::PrefixCompanion>() + overflow.len();
            assert!(
                needed <= NODE_SIZE,
                "radix tree: prefix segment too long for one node ({} bytes of overflow)",
                overflow.len()
            );
            let companion = self
                .mini
                .alloc(needed)
                .expect("radix tree: mini-buddy exhausted allocating prefix companion");
            let comp_header = companion.as_ptr() as *mut node::PrefixCompanion;
            (*comp_header).len = overflow.len() as u16;
            std::ptr::copy_nonoverlapping(
                overflow.as_ptr(),
                node::PrefixCompanion::bytes(companion),
                overflow.len(),
            );
            (*header).companion = companion.as_ptr();
        }
    }

    unsafe fn free_prefix_companion(&mut self, node: NonNull<u8>) {
        unsafe {
            let header = node::as_scan_header(node);
            if (*header).prefix_overflow != 0 && !(*header).companion.is_null() {
                let companion = NonNull::new_unchecked((*header).companion);
                let comp_len =
                    (*(companion.as_ptr() as *const node::PrefixCompanion)).len as usize;
                let size = std::mem::size_of::<node::PrefixCompanion>() + comp_len;
                self.mini.free(companion, size);
            }
        }
    }

    fn alloc_node(&mut self) -> Result<NonNull<u8>, RadixError> {
        let node = self.mini.alloc(NODE_SIZE).ok_or(RadixError::OutOfMemory)?;
        if self.arena_base == 0 {
            self.arena_base = node.as_ptr() as usize;
        } else {
            // `node` is not linked into the tree yet, so promoting here —
            // before anything references it — never has to touch a
            // partially written parent.
            self.ensure_width_fits(node);
        }
        Ok(node)
    }

    /// Promotes the whole tree to long-pointer mode if `candidate`'s
    /// address can no longer be expressed as a short offset from
    /// `arena_base` (either because the arena has grown past 4 GiB, or
    /// because the mini-buddy handed back an address below it).
    fn ensure_width_fits(&mut self, candidate: NonNull<u8>) {
        if self.width != PtrWidth::Short {
            return;
        }
        let addr = candidate.as_ptr() as usize;
        let fits = addr
            .checked_sub(self.arena_base)
            .is_some_and(|off| off < u32::MAX as usize);
        if !fits {
            log::warn!(
                "radix tree: node address no longer fits a 4 GiB short-pointer offset, promoting to long-pointer mode"
            );
            self.promote_to_long();
        }
    }

    /// Transparently widens an entire `MemoryMode::Compact` tree to
    /// `MemoryMode::Performance`, rebuilding every node's child-pointer
    /// encoding. This widens the whole tree rather than promoting a
    /// single node (the companion-prefix-node / 8-entry local-array /
    /// `lp_count` scheme of a true per-node short-to-long transition) —
    /// since the 4 GiB boundary is crossed once per tree, widening
    /// everything at that point is simpler and only ever pays its cost
    /// a single time over a tree's life.
    fn promote_to_long(&mut self) {
        if self.width == PtrWidth::Long {
            return;
        }
        let Some(root) = self.root else {
            self.width = PtrWidth::Long;
            self.mode = MemoryMode::Performance;
            return;
        };

        // Phase 1: any scan node with more branches than long mode's
        // smaller capacity allows must become a mask node first, while
        // every read still uses the current (short) width.
        let mut stack = vec![root];
        while let Some(n) = stack.pop() {
            if node::node_tag(n) == TAG_SCAN {
                let num_branches = unsafe { (*node::as_scan_header(n)).num_branches as usize };
                if num_branches > node::scan_capacity(PtrWidth::Long) {
                    self.convert_to_mask(n)
                        .expect("radix tree: promotion's mask conversion ran out of memory");
                }
            }
            match node::node_tag(n) {
                TAG_SCAN => {
                    for i in 0..self.scan_branches_pub(n).len() {
                        if let Some(c) = self.scan_child(n, i) {
                            stack.push(c);
                        }
                    }
                }
                TAG_MASK => {
                    for (_, c) in self.mask_children_pub(n) {
                        stack.push(c);
                    }
                }
                _ => unreachable!("corrupt node tag"),
            }
        }

        // Phase 2: snapshot every edge, and every mask node reached,
        // while everything is still decoded at the old width.
        let mut edges: Vec<(NonNull<u8>, u8, NonNull<u8>)> = Vec::new();
        let mut mask_nodes: Vec<NonNull<u8>> = Vec::new();
        let mut stack = vec![root];
        while let Some(n) = stack.pop() {
            match node::node_tag(n) {
                TAG_SCAN => {
                    let branches = self.scan_branches_pub(n);
                    for (i, byte) in branches.iter().enumerate() {
                        if let Some(c) = self.scan_child(n, i) {
                            edges.push((n, *byte, c));
                            stack.push(c);
                        }
                    }
                }
                TAG_MASK => {
                    mask_nodes.push(n);
                    for (byte, c) in self.mask_children_pub(n) {
                        edges.push((n, byte, c));
                        stack.push(c);
                    }
                }
                _ => unreachable!("corrupt node tag"),
            }
        }

        // Phase 3: free every mask node's old (short-width) indirect
        // storage before anything is rebuilt.
        let old_width = self.width;
        for n in mask_nodes {
            self.free_mask_indirect_storage(n, old_width);
        }

        // Phase 4: flip the tree's pointer width.
        self.width = PtrWidth::Long;
        self.mode = MemoryMode::Performance;

        // Phase 5: re-point every collected edge at the new width. Scan
        // nodes write straight into their own (unmoved) children block;
        // mask nodes allocate fresh long-width group/groups-table blocks
        // on demand, since their `groups_table` was just nulled out.
        for (node, byte, child) in edges {
            match node::node_tag(node) {
                TAG_SCAN => {
                    let idx = self.scan_find_branch(node, byte).expect("edge byte missing after promotion");
                    self.scan_set_child(node, idx, Some(child));
                }
                TAG_MASK => {
                    self.mask_set_child(node, byte, Some(child))
                        .expect("radix tree: promotion ran out of memory rebuilding a mask node");
                }
                _ => unreachable!("corrupt node tag"),
            }
        }
    }

    /// Frees a mask node's groups-table and every non-null group block it
    /// points to, under `width`'s encoding, then nulls the pointer.
    fn free_mask_indirect_storage(&mut self, node: NonNull<u8>, width: PtrWidth) {
        let mask_node = unsafe { &mut *node::as_mask(node) };
        if let Some(table) = NonNull::new(mask_node.groups_table) {
            for g in 0..node::NUM_GROUPS {
                if let Some(block) = unsafe { node::indirect_get(table, width, g, self.arena_base) } {
                    self.mini.free(block, width.indirect_block_size());
                }
            }
            self.mini.free(table, width.indirect_block_size());
            mask_node.groups_table = std::ptr::null_mut();
        }
    }

    fn alloc_value(&mut self, value: V) -> Result<*mut u8, RadixError> {
        let slot = self.values.alloc().map_err(|_| RadixError::OutOfMemory)?;
        unsafe { std::ptr::write(slot.as_ptr(), value) };
        Ok(slot.as_ptr() as *mut u8)
    }

    unsafe fn take_value(&mut self, ptr: *mut u8) -> V {
        unsafe {
            let typed = NonNull::new_unchecked(ptr as *mut V);
            let value = std::ptr::read(typed.as_ptr());
            self.values.free(typed);
            value
        }
    }

    fn new_scan_leaf(&mut self, prefix: &[u8], value_ptr: *mut u8) -> Result<NonNull<u8>, RadixError> {
        let node = self.alloc_node()?;
        unsafe {
            let header = node::as_scan_header(node);
            (*header).tag = TAG_SCAN;
            (*header).num_branches = 0;
            (*header).value = value_ptr;
            (*header).companion = std::ptr::null_mut();
            (*header).prefix_overflow = 0;
            self.write_prefix(node, prefix);
        }
        Ok(node)
    }

    fn scan_branches<'a>(&self, node: NonNull<u8>) -> &'a [u8] {
        let n = unsafe { (*node::as_scan_header(node)).num_branches as usize };
        unsafe { std::slice::from_raw_parts(node::scan_branches(node), n) }
    }

    fn scan_child(&self, node: NonNull<u8>, index: usize) -> Option<NonNull<u8>> {
        unsafe { node::indirect_get(node::scan_children_block(node), self.width, index, self.arena_base) }
    }

    fn scan_set_child(&mut self, node: NonNull<u8>, index: usize, child: Option<NonNull<u8>>) {
        unsafe {
            node::indirect_set(
                node::scan_children_block(node),
                self.width,
                index,
                child,
                self.arena_base,
            )
        };
    }

    /// Finds the branch index for `byte`, or where it should be inserted.
    fn scan_find_branch(&self, node: NonNull<u8>, byte: u8) -> Result<usize, usize> {
        simd::find_branch(self.scan_branches(node), byte)
    }

    fn scan_insert_branch(
        &mut self,
        node: NonNull<u8>,
        pos: usize,
        byte: u8,
        child: NonNull<u8>,
    ) -> Result<(), RadixError> {
        let cap = node::scan_capacity(self.width);
        let n = unsafe { (*node::as_scan_header(node)).num_branches as usize };
        if n >= cap {
            return Err(RadixError::OutOfMemory);
        }
        unsafe {
            let branches = node::scan_branches(node);
            std::ptr::copy(branches.add(pos), branches.add(pos + 1), n - pos);
            *branches.add(pos) = byte;
        }
        for i in (pos..n).rev() {
            let c = self.scan_child(node, i);
            self.scan_set_child(node, i + 1, c);
        }
        self.scan_set_child(node, pos, Some(child));
        unsafe { (*node::as_scan_header(node)).num_branches = (n + 1) as u8 };
        Ok(())
    }

    fn node_value_ptr(&self, node: NonNull<u8>) -> *mut u8 {
        match node::node_tag(node) {
            TAG_SCAN => unsafe { (*node::as_scan_header(node)).value },
            TAG_MASK => unsafe { (*node::as_mask(node)).value },
            _ => unreachable!("corrupt node tag"),
        }
    }

    fn node_set_value_ptr(&mut self, node: NonNull<u8>, value_ptr: *mut u8) {
        match node::node_tag(node) {
            TAG_SCAN => unsafe { (*node::as_scan_header(node)).value = value_ptr },
            TAG_MASK => unsafe { (*node::as_mask(node)).value = value_ptr },
            _ => unreachable!("corrupt node tag"),
        }
    }

    fn mask_child(&self, node: NonNull<u8>, byte: u8) -> Option<NonNull<u8>> {
        let mask_node = unsafe { &*node::as_mask(node) };
        if !node::mask_test(&mask_node.bitmask, byte) {
            return None;
        }
        let (group, idx) = node::mask_group_of(byte);
        let table = NonNull::new(mask_node.groups_table)?;
        let block = unsafe { node::indirect_get(table, self.width, group, self.arena_base) }?;
        unsafe { node::indirect_get(block, self.width, idx, self.arena_base) }
    }

    fn mask_set_child(&mut self, node: NonNull<u8>, byte: u8, child: Option<NonNull<u8>>) -> Result<(), RadixError> {
        let (group, idx) = node::mask_group_of(byte);
        let width_before = self.width;
        let table = {
            let mask_node = unsafe { &mut *node::as_mask(node) };
            match NonNull::new(mask_node.groups_table) {
                Some(t) => t,
                None => {
                    let t = self
                        .mini
                        .alloc(self.width.indirect_block_size())
                        .ok_or(RadixError::OutOfMemory)?;
                    unsafe { node::indirect_fill_null(t, self.width) };
                    mask_node.groups_table = t.as_ptr();
                    // `t` holds no live entries yet (just null-filled),
                    // so a widen triggered here only has to tear down
                    // and rebuild already-set bits elsewhere in the
                    // tree. `t`/`mask_node` must not be touched after
                    // this call either way — restart from scratch at
                    // the (possibly new) width instead.
                    self.ensure_width_fits(t);
                    if self.width != width_before {
                        return self.mask_set_child(node, byte, child);
                    }
                    t
                }
            }
        };
        let block = match unsafe { node::indirect_get(table, self.width, group, self.arena_base) } {
            Some(b) => b,
            None => {
                let b = self
                    .mini
                    .alloc(self.width.indirect_block_size())
                    .ok_or(RadixError::OutOfMemory)?;
                unsafe { node::indirect_fill_null(b, self.width) };
                unsafe { node::indirect_set(table, self.width, group, Some(b), self.arena_base) };
                self.ensure_width_fits(b);
                if self.width != width_before {
                    return self.mask_set_child(node, byte, child);
                }
                b
            }
        };
        unsafe { node::indirect_set(block, self.width, idx, child, self.arena_base) };
        let mask_node = unsafe { &mut *node::as_mask(node) };
        if child.is_some() {
            node::mask_set(&mut mask_node.bitmask, byte);
        } else {
            node::mask_clear(&mut mask_node.bitmask, byte);
        }
        Ok(())
    }

    /// Converts a scan node at capacity into a mask node in place
    /// (same 128-byte slot, same identity as far as its parent is
    /// concerned — no parent pointer patch needed).
    fn convert_to_mask(&mut self, node: NonNull<u8>) -> Result<(), RadixError> {
        let n = unsafe { (*node::as_scan_header(node)).num_branches as usize };
        log::debug!("radix: scan node full at {n} branches, converting to a mask node");
        let mut entries = Vec::with_capacity(n);
        for i in 0..n {
            let byte = self.scan_branches(node)[i];
            let child = self.scan_child(node, i);
            entries.push((byte, child));
        }
        let value_ptr = self.node_value_ptr(node);
        unsafe { self.free_prefix_companion(node) };

        let mask_node = unsafe { &mut *node::as_mask(node) };
        mask_node.tag = TAG_MASK;
        mask_node.value = value_ptr;
        mask_node.bitmask = [0u32; 8];
        mask_node.groups_table = std::ptr::null_mut();

        for (byte, child) in entries {
            self.mask_set_child(node, byte, child)?;
        }
        Ok(())
    }

    // ---- public operations ---------------------------------------------

    pub fn insert(&mut self, key: &[u8], value: V) -> Result<Option<V>, RadixError> {
        let root = match self.root {
            Some(r) => r,
            None => {
                let value_ptr = self.alloc_value(value)?;
                let node = self.new_scan_leaf(key, value_ptr)?;
                self.root = Some(node);
                self.len += 1;
                return Ok(None);
            }
        };

        let mut cur = root;
        let mut parent: Option<(NonNull<u8>, u8)> = None;
        let mut remaining = key;

        loop {
            match node::node_tag(cur) {
                TAG_SCAN => {
                    let prefix = unsafe { self.read_prefix(cur) };
                    let diff = simd::prefix_find_first_diff(remaining, &prefix);
                    let common = diff.unwrap_or_else(|| remaining.len().min(prefix.len()));

                    if common < prefix.len() {
                        let new_root = self.split_scan(cur, &prefix, common, remaining, value)?;
                        self.attach(parent, new_root);
                        self.len += 1;
                        return Ok(None);
                    }

                    remaining = &remaining[common..];
                    if remaining.is_empty() {
                        let value_ptr = self.alloc_value(value)?;
                        let old_ptr = self.node_value_ptr(cur);
                        self.node_set_value_ptr(cur, value_ptr);
                        if old_ptr.is_null() {
                            self.len += 1;
                            return Ok(None);
                        }
                        return Ok(Some(unsafe { self.take_value(old_ptr) }));
                    }

                    let byte = remaining[0];
                    match self.scan_find_branch(cur, byte) {
                        Ok(idx) => {
                            let child = self.scan_child(cur, idx).expect("branch without child");
                            parent = Some((cur, byte));
                            cur = child;
                            remaining = &remaining[1..];
                        }
                        Err(pos) => {
                            let value_ptr = self.alloc_value(value)?;
                            let leaf = self.new_scan_leaf(&remaining[1..], value_ptr)?;
                            if self.scan_insert_branch(cur, pos, byte, leaf).is_err() {
                                self.convert_to_mask(cur)?;
                                self.mask_set_child(cur, byte, Some(leaf))?;
                            }
                            self.len += 1;
                            return Ok(None);
                        }
                    }
                }
                TAG_MASK => {
                    // A mask node has no prefix of its own; the byte that
                    // selected it was already consumed by the caller.
                    if remaining.is_empty() {
                        let value_ptr = self.alloc_value(value)?;
                        let old_ptr = self.node_value_ptr(cur);
                        self.node_set_value_ptr(cur, value_ptr);
                        if old_ptr.is_null() {
                            self.len += 1;
                            return Ok(None);
                        }
                        return Ok(Some(unsafe { self.take_value(old_ptr) }));
                    }
                    let byte = remaining[0];
                    match self.mask_child(cur, byte) {
                        Some(child) => {
                            parent = Some((cur, byte));
                            cur = child;
                            remaining = &remaining[1..];
                        }
                        None => {
                            let value_ptr = self.alloc_value(value)?;
                            let leaf = self.new_scan_leaf(&remaining[1..], value_ptr)?;
                            self.mask_set_child(cur, byte, Some(leaf))?;
                            self.len += 1;
                            return Ok(None);
                        }
                    }
                }
                _ => unreachable!("corrupt node tag"),
            }
        }
    }

    fn split_scan(
        &mut self,
        old: NonNull<u8>,
        old_prefix: &[u8],
        common: usize,
        remaining: &[u8],
        value: V,
    ) -> Result<NonNull<u8>, RadixError> {
        let new_parent = self.alloc_node()?;
        unsafe {
            let header = node::as_scan_header(new_parent);
            (*header).tag = TAG_SCAN;
            (*header).num_branches = 0;
            (*header).value = std::ptr::null_mut();
            (*header).companion = std::ptr::null_mut();
            (*header).prefix_overflow = 0;
            self.write_prefix(new_parent, &old_prefix[..common]);
        }

        let old_branch_byte = old_prefix[common];
        unsafe {
            self.free_prefix_companion(old);
            self.write_prefix(old, &old_prefix[common + 1..]);
        }

        if common == remaining.len() {
            let value_ptr = self.alloc_value(value)?;
            unsafe { (*node::as_scan_header(new_parent)).value = value_ptr };
            self.scan_insert_branch(new_parent, 0, old_branch_byte, old)?;
        } else {
            let new_branch_byte = remaining[common];
            let value_ptr = self.alloc_value(value)?;
            let leaf = self.new_scan_leaf(&remaining[common + 1..], value_ptr)?;
            let (first_byte, first_node, second_byte, second_node) = if old_branch_byte < new_branch_byte
            {
                (old_branch_byte, old, new_branch_byte, leaf)
            } else {
                (new_branch_byte, leaf, old_branch_byte, old)
            };
            self.scan_insert_branch(new_parent, 0, first_byte, first_node)?;
            self.scan_insert_branch(new_parent, 1, second_byte, second_node)?;
        }

        Ok(new_parent)
    }

    fn attach(&mut self, parent: Option<(NonNull<u8>, u8)>, node: NonNull<u8>) {
        match parent {
            None => self.root = Some(node),
            Some((p, byte)) => match node::node_tag(p) {
                TAG_SCAN => {
                    if let Ok(idx) = self.scan_find_branch(p, byte) {
                        self.scan_set_child(p, idx, Some(node));
                    }
                }
                TAG_MASK => {
                    let _ = self.mask_set_child(p, byte, Some(node));
                }
                _ => unreachable!("corrupt node tag"),
            },
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<&V> {
        let mut cur = self.root?;
        let mut remaining = key;
        loop {
            match node::node_tag(cur) {
                TAG_SCAN => {
                    let prefix = unsafe { self.read_prefix(cur) };
                    if remaining.len() < prefix.len() || &remaining[..prefix.len()] != prefix.as_slice() {
                        return None;
                    }
                    remaining = &remaining[prefix.len()..];
                    if remaining.is_empty() {
                        return self.node_value_mut(self.node_value_ptr(cur));
                    }
                    let idx = self.scan_find_branch(cur, remaining[0]).ok()?;
                    cur = self.scan_child(cur, idx)?;
                    remaining = &remaining[1..];
                }
                TAG_MASK => {
                    if remaining.is_empty() {
                        return self.node_value_mut(self.node_value_ptr(cur));
                    }
                    cur = self.mask_child(cur, remaining[0])?;
                    remaining = &remaining[1..];
                }
                _ => unreachable!("corrupt node tag"),
            }
        }
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }

    /// Longest-prefix match: the value of the deepest node whose full
    /// accumulated prefix is a prefix of `key`, or `None` if the tree
    /// has no such entry. Matches a PATRICIA trie's natural use as a
    /// routing/longest-match structure rather than requiring an exact
    /// key hit the way [`Self::get`] does.
    pub fn find_near(&self, key: &[u8]) -> Option<&V> {
        let mut cur = self.root?;
        let mut remaining = key;
        let mut best: Option<*mut u8> = None;

        loop {
            let value_ptr = self.node_value_ptr(cur);
            if !value_ptr.is_null() {
                best = Some(value_ptr);
            }

            match node::node_tag(cur) {
                TAG_SCAN => {
                    let prefix = unsafe { self.read_prefix(cur) };
                    if remaining.len() < prefix.len() || &remaining[..prefix.len()] != prefix.as_slice()
                    {
                        break;
                    }
                    remaining = &remaining[prefix.len()..];
                    if remaining.is_empty() {
                        break;
                    }
                    match self.scan_find_branch(cur, remaining[0]) {
                        Ok(idx) => {
                            cur = self.scan_child(cur, idx).expect("branch without child");
                            remaining = &remaining[1..];
                        }
                        Err(_) => break,
                    }
                }
                TAG_MASK => {
                    if remaining.is_empty() {
                        break;
                    }
                    match self.mask_child(cur, remaining[0]) {
                        Some(child) => {
                            cur = child;
                            remaining = &remaining[1..];
                        }
                        None => break,
                    }
                }
                _ => unreachable!("corrupt node tag"),
            }
        }

        best.and_then(|p| self.node_value_mut(p))
    }

    pub fn remove(&mut self, key: &[u8]) -> Option<V> {
        let mut cur = self.root?;
        let mut parent: Option<(NonNull<u8>, u8)> = None;
        let mut remaining = key;

        loop {
            match node::node_tag(cur) {
                TAG_SCAN => {
                    let prefix = unsafe { self.read_prefix(cur) };
                    if remaining.len() < prefix.len() || &remaining[..prefix.len()] != prefix.as_slice()
                    {
                        return None;
                    }
                    remaining = &remaining[prefix.len()..];
                    if remaining.is_empty() {
                        let value_ptr = self.node_value_ptr(cur);
                        if value_ptr.is_null() {
                            return None;
                        }
                        self.node_set_value_ptr(cur, std::ptr::null_mut());
                        self.len -= 1;
                        let removed = unsafe { self.take_value(value_ptr) };
                        self.prune_if_empty(cur, parent);
                        return Some(removed);
                    }
                    let idx = self.scan_find_branch(cur, remaining[0]).ok()?;
                    let byte = remaining[0];
                    let child = self.scan_child(cur, idx)?;
                    parent = Some((cur, byte));
                    cur = child;
                    remaining = &remaining[1..];
                }
                TAG_MASK => {
                    if remaining.is_empty() {
                        let value_ptr = self.node_value_ptr(cur);
                        if value_ptr.is_null() {
                            return None;
                        }
                        self.node_set_value_ptr(cur, std::ptr::null_mut());
                        self.len -= 1;
                        return Some(unsafe { self.take_value(value_ptr) });
                    }
                    let byte = remaining[0];
                    let child = self.mask_child(cur, byte)?;
                    parent = Some((cur, byte));
                    cur = child;
                    remaining = &remaining[1..];
                }
                _ => unreachable!("corrupt node tag"),
            }
        }
    }

    /// If `node` (a scan node) has no value and no branches left, detach
    /// it from its parent and free it, then recursively collapse the
    /// parent upward: if removing the branch left it with exactly one
    /// surviving branch and no terminal value of its own, that branch is
    /// merged into the parent by concatenating prefixes and taking over
    /// the subtree, so no internal node is ever left with a single child.
    fn prune_if_empty(&mut self, node: NonNull<u8>, parent: Option<(NonNull<u8>, u8)>) {
        if node::node_tag(node) != TAG_SCAN {
            return;
        }
        let num_branches = unsafe { (*node::as_scan_header(node)).num_branches };
        if num_branches != 0 {
            return;
        }
        match parent {
            None => {
                unsafe { self.free_prefix_companion(node) };
                self.mini.free(node, NODE_SIZE);
                self.root = None;
            }
            Some((p, byte)) => {
                match node::node_tag(p) {
                    TAG_SCAN => {
                        if let Ok(idx) = self.scan_find_branch(p, byte) {
                            self.scan_remove_branch(p, idx);
                        }
                    }
                    TAG_MASK => {
                        let _ = self.mask_set_child(p, byte, None);
                    }
                    _ => unreachable!("corrupt node tag"),
                }
                unsafe { self.free_prefix_companion(node) };
                self.mini.free(node, NODE_SIZE);

                if node::node_tag(p) == TAG_SCAN {
                    self.collapse_if_single_branch(p);
                }
            }
        }
    }

    /// Merges `node`'s sole remaining branch into itself when `node` has
    /// no terminal value: concatenates `node`'s prefix, the branch byte,
    /// and the child's prefix into one combined prefix, then takes over
    /// the child's value and branch/children arrays (same pointer-width
    /// encoding and arena base, so the raw entries copy over unchanged).
    ///
    /// Only scan-into-scan merges are collapsed. A mask node has no
    /// prefix field to absorb the merged bytes into, so a single-branch
    /// scan node whose sole child is a mask node is left in place — it is
    /// the one-byte dispatch a dense bitmask node needs, not slack
    /// structure left over from a removal.
    fn collapse_if_single_branch(&mut self, node: NonNull<u8>) {
        let value = unsafe { (*node::as_scan_header(node)).value };
        let num_branches = unsafe { (*node::as_scan_header(node)).num_branches };
        if num_branches != 1 || !value.is_null() {
            return;
        }
        let byte = self.scan_branches(node)[0];
        let child = self.scan_child(node, 0).expect("branch without child");
        if node::node_tag(child) != TAG_SCAN {
            return;
        }

        let mut merged = unsafe { self.read_prefix(node) };
        merged.push(byte);
        merged.extend_from_slice(&unsafe { self.read_prefix(child) });

        let child_value = unsafe { (*node::as_scan_header(child)).value };
        let child_num_branches = unsafe { (*node::as_scan_header(child)).num_branches };
        let cap = node::scan_capacity(self.width);
        unsafe {
            std::ptr::copy_nonoverlapping(node::scan_branches(child), node::scan_branches(node), cap);
            std::ptr::copy_nonoverlapping(
                node::scan_children_block(child).as_ptr(),
                node::scan_children_block(node).as_ptr(),
                cap * self.width.bytes(),
            );
        }

        unsafe {
            self.free_prefix_companion(node);
            self.write_prefix(node, &merged);
            let header = node::as_scan_header(node);
            (*header).value = child_value;
            (*header).num_branches = child_num_branches;
        }

        unsafe { self.free_prefix_companion(child) };
        self.mini.free(child, NODE_SIZE);
    }

    fn scan_remove_branch(&mut self, node: NonNull<u8>, index: usize) {
        let n = unsafe { (*node::as_scan_header(node)).num_branches as usize };
        unsafe {
            let branches = node::scan_branches(node);
            std::ptr::copy(branches.add(index + 1), branches.add(index), n - index - 1);
        }
        for i in index..n - 1 {
            let c = self.scan_child(node, i + 1);
            self.scan_set_child(node, i, c);
        }
        self.scan_set_child(node, n - 1, None);
        unsafe { (*node::as_scan_header(node)).num_branches = (n - 1) as u8 };
    }

    /// Releases every node, companion, and value, leaving the tree empty.
    pub fn delete(&mut self) {
        self.mini.delete();
        self.values.delete();
        self.arena_base = 0;
        self.root = None;
        self.len = 0;
    }

    /// In-order iterator over `(key, value)` pairs, ascending by key.
    pub fn iter(&self) -> super::iter::Iter<'_, V> {
        super::iter::Iter::new(self)
    }

    pub(crate) fn root_node(&self) -> Option<NonNull<u8>> {
        self.root
    }

    pub(crate) fn width(&self) -> PtrWidth {
        self.width
    }

    pub(crate) fn arena_base(&self) -> usize {
        self.arena_base
    }

    pub(crate) fn read_prefix_pub(&self, node: NonNull<u8>) -> Vec<u8> {
        unsafe { self.read_prefix(node) }
    }

    pub(crate) fn node_value_ptr_pub(&self, node: NonNull<u8>) -> *mut u8 {
        self.node_value_ptr(node)
    }

    pub(crate) fn scan_branches_pub(&self, node: NonNull<u8>) -> Vec<u8> {
        self.scan_branches(node).to_vec()
    }

    pub(crate) fn scan_child_pub(&self, node: NonNull<u8>, index: usize) -> Option<NonNull<u8>> {
        self.scan_child(node, index)
    }

    pub(crate) fn mask_children_pub(&self, node: NonNull<u8>) -> Vec<(u8, NonNull<u8>)> {
        let mask_node = unsafe { &*node::as_mask(node) };
        let mut out = Vec::new();
        for byte in 0u8..=255u8 {
            if node::mask_test(&mask_node.bitmask, byte) {
                if let Some(child) = self.mask_child(node, byte) {
                    out.push((byte, child));
                }
            }
        }
        out
    }

    pub(crate) fn value_ref<'a>(&'a self, ptr: *mut u8) -> &'a V {
        unsafe { &*(ptr as *const V) }
    }
}

impl<V> Drop for RadixTree<V> {
    fn drop(&mut self) {
        self.delete();
    }
}

/// Encodes a `u64` as an 8-byte big-endian-ordered key so that
/// byte-lexicographic comparison (what the tree uses internally)
/// matches integer ordering on a little-endian host. On a big-endian
/// host this is a no-op copy.
pub fn sortint_key(value: u64) -> [u8; 8] {
    value.to_be_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buddy::BuddyConfig;

    fn test_tree<V>(mode: MemoryMode) -> RadixTree<V> {
        let buddy = Arc::new(BuddyAllocator::new(BuddyConfig::default()));
        RadixTree::new(buddy, mode).unwrap()
    }

    #[test]
    fn insert_and_get_round_trip() {
        let mut t: RadixTree<u32> = test_tree(MemoryMode::Compact);
        t.insert(b"hello", 1).unwrap();
        t.insert(b"world", 2).unwrap();
        assert_eq!(t.get(b"hello"), Some(&1));
        assert_eq!(t.get(b"world"), Some(&2));
        assert_eq!(t.get(b"nope"), None);
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn insert_replaces_existing_value() {
        let mut t: RadixTree<u32> = test_tree(MemoryMode::Compact);
        assert_eq!(t.insert(b"key", 1).unwrap(), None);
        assert_eq!(t.insert(b"key", 2).unwrap(), Some(1));
        assert_eq!(t.get(b"key"), Some(&2));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn prefix_split_scenario() {
        let mut t: RadixTree<u32> = test_tree(MemoryMode::Compact);
        t.insert(b"abcdef", 1).unwrap();
        t.insert(b"abcxyz", 2).unwrap();
        assert_eq!(t.get(b"abcdef"), Some(&1));
        assert_eq!(t.get(b"abcxyz"), Some(&2));
        assert_eq!(t.get(b"abc"), None);
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn scan_to_mask_conversion_with_many_single_byte_keys() {
        let mut t: RadixTree<u8> = test_tree(MemoryMode::Compact);
        for b in b'a'..=b'z' {
            t.insert(&[b], b).unwrap();
        }
        for b in b'a'..=b'z' {
            assert_eq!(t.get(&[b]), Some(&b));
        }
        assert_eq!(t.len(), 26);
    }

    #[test]
    fn remove_then_reinsert() {
        let mut t: RadixTree<u32> = test_tree(MemoryMode::Compact);
        t.insert(b"alpha", 1).unwrap();
        t.insert(b"beta", 2).unwrap();
        assert_eq!(t.remove(b"alpha"), Some(1));
        assert_eq!(t.get(b"alpha"), None);
        assert_eq!(t.get(b"beta"), Some(&2));
        assert_eq!(t.len(), 1);
        t.insert(b"alpha", 3).unwrap();
        assert_eq!(t.get(b"alpha"), Some(&3));
    }

    #[test]
    fn remove_collapses_single_remaining_branch_into_parent() {
        let mut t: RadixTree<u32> = test_tree(MemoryMode::Compact);
        t.insert(b"abcdef", 1).unwrap();
        t.insert(b"abcxyz", 2).unwrap();
        assert_eq!(t.remove(b"abcxyz"), Some(2));
        assert_eq!(t.get(b"abcdef"), Some(&1));
        assert_eq!(t.len(), 1);

        let root = t.root_node().unwrap();
        assert_eq!(t.read_prefix_pub(root), b"abcdef".to_vec());
        assert_eq!(t.scan_branches_pub(root).len(), 0);
    }

    #[test]
    fn collapse_preserves_grandchild_branches() {
        let mut t: RadixTree<u32> = test_tree(MemoryMode::Compact);
        t.insert(b"abcdef", 1).unwrap();
        t.insert(b"abcdeg", 2).unwrap();
        t.insert(b"abcxyz", 3).unwrap();
        assert_eq!(t.remove(b"abcxyz"), Some(3));
        assert_eq!(t.get(b"abcdef"), Some(&1));
        assert_eq!(t.get(b"abcdeg"), Some(&2));
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn sortint_keys_preserve_integer_order() {
        let mut t: RadixTree<u64> = test_tree(MemoryMode::Compact);
        for i in (0..100u64).rev() {
            t.insert(&sortint_key(i), i).unwrap();
        }
        let collected: Vec<u64> = t.iter().map(|(_, v)| *v).collect();
        let expected: Vec<u64> = (0..100u64).collect();
        assert_eq!(collected, expected);
    }

    #[test]
    fn crossing_short_pointer_boundary_promotes_to_performance_mode() {
        let mut t: RadixTree<u32> = test_tree(MemoryMode::Compact);
        t.insert(b"alpha", 1).unwrap();
        assert_eq!(t.mode(), MemoryMode::Compact);

        // Simulate the arena having drifted more than 4 GiB from its
        // first allocation (real heap addresses are already far above
        // this offset from a base of 1, without needing to actually
        // commit 4 GiB of memory) and confirm the very next node
        // allocation notices and transparently widens the tree.
        t.arena_base = 1;
        t.insert(b"beta", 2).unwrap();

        assert_eq!(t.mode(), MemoryMode::Performance);
        assert_eq!(t.get(b"alpha"), Some(&1));
        assert_eq!(t.get(b"beta"), Some(&2));
        assert_eq!(t.len(), 2);

        t.insert(b"gamma", 3).unwrap();
        assert_eq!(t.get(b"gamma"), Some(&3));
        assert_eq!(t.remove(b"alpha"), Some(1));
        assert_eq!(t.get(b"alpha"), None);
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn boundary_crossing_rebuilds_an_existing_mask_node() {
        let mut t: RadixTree<u8> = test_tree(MemoryMode::Compact);
        // 22 single-byte keys exceed `SHORT_MAX_BRANCHES == 20`, forcing
        // the root to convert from a scan node into a mask node before
        // the arena-base tweak below even runs.
        for b in b'a'..=b'v' {
            t.insert(&[b], b).unwrap();
        }
        assert_eq!(t.mode(), MemoryMode::Compact);

        t.arena_base = 1;
        t.insert(b"w", b'w').unwrap();

        assert_eq!(t.mode(), MemoryMode::Performance);
        for b in b'a'..=b'w' {
            assert_eq!(t.get(&[b]), Some(&b));
        }
        assert_eq!(t.len(), 23);
    }

    #[test]
    fn performance_mode_round_trip() {
        let mut t: RadixTree<u32> = test_tree(MemoryMode::Performance);
        for (i, word) in ["one", "two", "three", "four", "five"].iter().enumerate() {
            t.insert(word.as_bytes(), i as u32).unwrap();
        }
        for (i, word) in ["one", "two", "three", "four", "five"].iter().enumerate() {
            assert_eq!(t.get(word.as_bytes()), Some(&(i as u32)));
        }
    }

    #[test]
    fn find_near_returns_longest_matching_prefix() {
        let mut t: RadixTree<&'static str> = test_tree(MemoryMode::Compact);
        t.insert(b"10.0.0.0", "network-a").unwrap();
        assert_eq!(t.find_near(b"10.0.0.0/24"), Some(&"network-a"));
        assert_eq!(t.find_near(b"10.0.0.0"), Some(&"network-a"));
        assert_eq!(t.find_near(b"9.0.0.0"), None);
    }
}
