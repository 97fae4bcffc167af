//! Version 1 group B-trees and symbol table nodes: the directory structure
//! of old-style groups.
//!
//! A "TREE" node of type 0 holds `entries_used` child pointers interleaved
//! with `entries_used + 1` keys; keys are byte offsets of link names in the
//! group's local heap. Level 0 children are "SNOD" symbol table nodes, each
//! holding up to 2K entries sorted by link name.

use nom::bytes::streaming::{tag, take};
use nom::error::context;
use nom::multi::count;
use nom::number::streaming::{le_u16, le_u32, le_u8};

use crate::codec::{self, Sizes};
use crate::error::{Hdf5Error, Result};
use crate::heap::LocalHeapInfo;
use crate::parse_util::{address, PResult};

pub const TREE_SIGNATURE: &[u8; 4] = b"TREE";
pub const SNOD_SIGNATURE: &[u8; 4] = b"SNOD";

/// Entry cache types: 0 = plain object, 1 = group whose scratch pad caches
/// its B-tree and local heap addresses.
pub const CACHE_TYPE_OBJECT: u32 = 0;
pub const CACHE_TYPE_GROUP: u32 = 1;

#[derive(Debug, Clone)]
pub struct SymbolTableEntry {
    pub link_name_offset: u64,
    pub object_header_address: u64,
    pub cache_type: u32,
    pub address_of_btree: u64,
    pub address_of_name_heap: u64,
}

impl SymbolTableEntry {
    pub fn empty(offset_size: u8) -> Self {
        SymbolTableEntry {
            link_name_offset: 0,
            object_header_address: codec::undefined(offset_size),
            cache_type: CACHE_TYPE_OBJECT,
            address_of_btree: codec::undefined(offset_size),
            address_of_name_heap: codec::undefined(offset_size),
        }
    }

    pub fn object(link_name_offset: u64, object_header_address: u64) -> Self {
        SymbolTableEntry {
            link_name_offset,
            object_header_address,
            cache_type: CACHE_TYPE_OBJECT,
            address_of_btree: 0,
            address_of_name_heap: 0,
        }
    }

    /// On-disk size: two addresses, cache type, reserved word, and the
    /// 16-byte scratch pad.
    pub fn encoded_size(offset_size: u8) -> usize {
        2 * offset_size as usize + 8 + 16
    }

    pub fn encode(&self, out: &mut Vec<u8>, offset_size: u8) {
        codec::write_le(out, self.link_name_offset, offset_size);
        codec::write_le(out, self.object_header_address, offset_size);
        codec::push_u32(out, self.cache_type);
        codec::push_u32(out, 0);
        // Scratch pad: 16 bytes, meaningful only for cache type 1.
        let scratch_start = out.len();
        if self.cache_type == CACHE_TYPE_GROUP {
            codec::write_le(out, self.address_of_btree, offset_size);
            codec::write_le(out, self.address_of_name_heap, offset_size);
        }
        out.resize(scratch_start + 16, 0);
    }
}

pub fn symbol_table_entry(input: &[u8], offset_size: u8) -> PResult<SymbolTableEntry> {
    context("symbol table entry", move |input| {
        let (input, link_name_offset) = address(offset_size)(input)?;
        let (input, object_header_address) = address(offset_size)(input)?;
        let (input, cache_type) = le_u32(input)?;
        let (input, _reserved) = le_u32(input)?;
        let (rest, scratch) = take(16usize)(input)?;
        let (address_of_btree, address_of_name_heap) = if cache_type == CACHE_TYPE_GROUP {
            let (after_btree, btree) = address(offset_size)(scratch)?;
            let (_, heap) = address(offset_size)(after_btree)?;
            (btree, heap)
        } else {
            (
                codec::undefined(offset_size),
                codec::undefined(offset_size),
            )
        };
        Ok((
            rest,
            SymbolTableEntry {
                link_name_offset,
                object_header_address,
                cache_type,
                address_of_btree,
                address_of_name_heap,
            },
        ))
    })(input)
}

#[derive(Debug)]
pub struct SymbolTableNode {
    pub version: u8,
    pub entries: Vec<SymbolTableEntry>,
}

pub fn symbol_table_node(input: &[u8], offset_size: u8) -> PResult<SymbolTableNode> {
    context("symbol table node", move |input| {
        let (input, _) = tag(SNOD_SIGNATURE)(input)?;
        let (input, version) = le_u8(input)?;
        let (input, _) = tag([0])(input)?;
        let (input, number_of_symbols) = le_u16(input)?;
        let (input, entries) = count(
            |i| symbol_table_entry(i, offset_size),
            number_of_symbols as usize,
        )(input)?;
        Ok((input, SymbolTableNode { version, entries }))
    })(input)
}

#[derive(Debug)]
pub struct GroupBtreeNode {
    pub node_level: u8,
    pub entries_used: u16,
    pub address_of_left_sibling: u64,
    pub address_of_right_sibling: u64,
    /// `entries_used + 1` local-heap key offsets.
    pub keys: Vec<u64>,
    /// `entries_used` child addresses: SNODs at level 0, child tree nodes
    /// above.
    pub children: Vec<u64>,
}

pub fn btree_node(input: &[u8], sizes: Sizes) -> PResult<GroupBtreeNode> {
    context("group b-tree node", move |input| {
        let (input, _) = tag(TREE_SIGNATURE)(input)?;
        let (input, _) = tag([0])(input)?; // node type 0: group
        let (input, node_level) = le_u8(input)?;
        let (input, entries_used) = le_u16(input)?;
        let (input, address_of_left_sibling) = address(sizes.offset)(input)?;
        let (input, address_of_right_sibling) = address(sizes.offset)(input)?;

        let mut keys = Vec::with_capacity(entries_used as usize + 1);
        let mut children = Vec::with_capacity(entries_used as usize);
        let mut input = input;
        for _ in 0..entries_used {
            let (rest, key) = address(sizes.length)(input)?;
            let (rest, child) = address(sizes.offset)(rest)?;
            keys.push(key);
            children.push(child);
            input = rest;
        }
        let (input, last_key) = address(sizes.length)(input)?;
        keys.push(last_key);

        Ok((
            input,
            GroupBtreeNode {
                node_level,
                entries_used,
                address_of_left_sibling,
                address_of_right_sibling,
                keys,
                children,
            },
        ))
    })(input)
}

/// Walk the B-tree rooted at `root` and return every (name, entry) in name
/// order, materializing names through the local heap once per entry.
/// Name order is validated; a non-increasing sequence within a node fails
/// with `BtreeKeyOrderViolation`.
pub fn collect_entries(
    contents: &[u8],
    root: u64,
    heap: &LocalHeapInfo,
    sizes: Sizes,
) -> Result<Vec<(String, SymbolTableEntry)>> {
    let mut out = Vec::new();
    descend(contents, root, heap, sizes, &mut out)?;
    for pair in out.windows(2) {
        if pair[0].0 >= pair[1].0 {
            return Err(Hdf5Error::BtreeKeyOrderViolation);
        }
    }
    Ok(out)
}

fn descend(
    contents: &[u8],
    node_addr: u64,
    heap: &LocalHeapInfo,
    sizes: Sizes,
    out: &mut Vec<(String, SymbolTableEntry)>,
) -> Result<()> {
    let start = node_addr as usize;
    if start >= contents.len() {
        return Err(Hdf5Error::TruncatedRead);
    }
    let (_, node) = btree_node(&contents[start..], sizes)?;
    for child in &node.children {
        if node.node_level == 0 {
            let snod_start = *child as usize;
            if snod_start >= contents.len() {
                return Err(Hdf5Error::TruncatedRead);
            }
            let (_, snod) = symbol_table_node(&contents[snod_start..], sizes.offset)?;
            for entry in snod.entries {
                let name = crate::heap::read_name(contents, heap, entry.link_name_offset)?;
                out.push((name, entry));
            }
        } else {
            descend(contents, *child, heap, sizes, out)?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Write
// ---------------------------------------------------------------------------

/// Fixed encoded size of a tree node at the given widths and fan-out.
pub fn node_size(sizes: Sizes, internal_k: u16) -> u64 {
    let entries = 2 * internal_k as u64;
    24 + (entries + 1) * u64::from(sizes.length) + entries * u64::from(sizes.offset)
}

/// Fixed encoded size of a symbol table node.
pub fn snod_size(sizes: Sizes, leaf_k: u16) -> u64 {
    8 + 2 * leaf_k as u64 * SymbolTableEntry::encoded_size(sizes.offset) as u64
}

#[derive(Debug)]
struct WriterEntry {
    name: String,
    entry: SymbolTableEntry,
}

#[derive(Debug)]
struct SnodBuf {
    address: u64,
    entries: Vec<WriterEntry>,
}

/// In-memory directory for one group being written. Inserts keep entries in
/// name order across a list of SNODs, splitting a full SNOD in half and
/// letting serialization rebuild the interior nodes above them.
#[derive(Debug)]
pub struct GroupTreeWriter {
    root_address: u64,
    leaf_k: u16,
    internal_k: u16,
}

impl GroupTreeWriter {
    pub fn new(root_address: u64, leaf_k: u16, internal_k: u16) -> Self {
        GroupTreeWriter {
            root_address,
            leaf_k,
            internal_k,
        }
    }
}

/// The mutable directory state. Separate from the config so borrows of the
/// two never fight.
#[derive(Debug, Default)]
pub struct GroupDirectory {
    snods: Vec<SnodBuf>,
}

impl GroupDirectory {
    pub fn new() -> Self {
        GroupDirectory { snods: Vec::new() }
    }

    pub fn snod_count(&self) -> usize {
        self.snods.len()
    }

    pub fn snod_addresses(&self) -> Vec<u64> {
        self.snods.iter().map(|s| s.address).collect()
    }

    pub fn len(&self) -> usize {
        self.snods.iter().map(|s| s.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.snods.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.snods
            .iter()
            .flat_map(|s| s.entries.iter())
            .any(|e| e.name == name)
    }

    pub fn names(&self) -> Vec<String> {
        self.snods
            .iter()
            .flat_map(|s| s.entries.iter().map(|e| e.name.clone()))
            .collect()
    }

    pub fn entry(&self, name: &str) -> Option<&SymbolTableEntry> {
        self.snods
            .iter()
            .flat_map(|s| s.entries.iter())
            .find(|e| e.name == name)
            .map(|e| &e.entry)
    }

    /// Repoint a named entry after its object header was relocated.
    pub fn set_header_address(&mut self, name: &str, address: u64) {
        for snod in &mut self.snods {
            for entry in &mut snod.entries {
                if entry.name == name {
                    entry.entry.object_header_address = address;
                    return;
                }
            }
        }
    }

    /// Insert a named entry at its in-order position. `alloc_snod` returns
    /// the file offset for a fresh symbol table node when one is needed
    /// (first insert, or a split).
    pub fn insert<F>(
        &mut self,
        tree: &GroupTreeWriter,
        name: &str,
        entry: SymbolTableEntry,
        mut alloc_snod: F,
    ) -> Result<()>
    where
        F: FnMut() -> Result<u64>,
    {
        let capacity = 2 * tree.leaf_k as usize;
        if self.snods.is_empty() {
            self.snods.push(SnodBuf {
                address: alloc_snod()?,
                entries: Vec::new(),
            });
        }

        // Locate the covering SNOD: the first whose last name is >= the new
        // name, else the last one.
        let mut target = self.snods.len() - 1;
        for (i, snod) in self.snods.iter().enumerate() {
            match snod.entries.last() {
                Some(last) if last.name.as_str() >= name => {
                    target = i;
                    break;
                }
                _ => {}
            }
        }

        if self.snods[target].entries.len() >= capacity {
            // Split in half; the upper half moves to a fresh node and the
            // median boundary surfaces in the parent at serialization.
            let upper = self.snods[target].entries.split_off(capacity / 2);
            let address = alloc_snod()?;
            log::debug!(
                "snod at {:#x} split, new snod at {:#x}",
                self.snods[target].address,
                address
            );
            self.snods.insert(
                target + 1,
                SnodBuf {
                    address,
                    entries: upper,
                },
            );
            if self.snods[target]
                .entries
                .last()
                .map(|last| last.name.as_str() < name)
                .unwrap_or(false)
            {
                target += 1;
            }
        }

        let snod = &mut self.snods[target];
        let position = match snod
            .entries
            .binary_search_by(|probe| probe.name.as_str().cmp(name))
        {
            Ok(_) => {
                return Err(Hdf5Error::TypeMismatch(format!(
                    "link {:?} already exists",
                    name
                )))
            }
            Err(position) => position,
        };
        snod.entries.insert(
            position,
            WriterEntry {
                name: name.to_string(),
                entry,
            },
        );
        Ok(())
    }

    /// Serialize every SNOD and tree node. Interior nodes above level 0 are
    /// allocated through `alloc_node`; the root always lands at the tree's
    /// fixed root address. Returns (address, bytes) blocks.
    pub fn serialize<F>(
        &self,
        tree: &GroupTreeWriter,
        sizes: Sizes,
        mut alloc_node: F,
    ) -> Result<Vec<(u64, Vec<u8>)>>
    where
        F: FnMut() -> Result<u64>,
    {
        let mut blocks = Vec::new();
        for snod in &self.snods {
            blocks.push((snod.address, encode_snod(snod, tree, sizes)?));
        }

        // Child descriptors per level: (address, first key offset, last key
        // offset).
        let mut level: Vec<(u64, u64, u64)> = self
            .snods
            .iter()
            .filter(|snod| !snod.entries.is_empty())
            .map(|snod| {
                let first = snod.entries.first().map(|e| e.entry.link_name_offset);
                let last = snod.entries.last().map(|e| e.entry.link_name_offset);
                (snod.address, first.unwrap_or(0), last.unwrap_or(0))
            })
            .collect();

        if level.is_empty() {
            // A group with no children still owns a single empty root node.
            let undef = codec::undefined(sizes.offset);
            blocks.push((
                tree.root_address,
                encode_tree_node(&[], 0, undef, undef, tree, sizes),
            ));
            return Ok(blocks);
        }

        let fan_out = 2 * tree.internal_k as usize;
        let mut depth = 0u8;
        loop {
            let single = level.len() <= fan_out;
            let chunk_count = (level.len() + fan_out - 1) / std::cmp::max(fan_out, 1);
            let mut next_level = Vec::new();
            let mut node_addrs = Vec::new();
            for _ in 0..chunk_count.max(1) {
                node_addrs.push(if single {
                    tree.root_address
                } else {
                    alloc_node()?
                });
            }
            for (i, chunk) in level.chunks(std::cmp::max(fan_out, 1)).enumerate() {
                let left = if i == 0 {
                    codec::undefined(sizes.offset)
                } else {
                    node_addrs[i - 1]
                };
                let right = if i + 1 == chunk_count {
                    codec::undefined(sizes.offset)
                } else {
                    node_addrs[i + 1]
                };
                let bytes = encode_tree_node(chunk, depth, left, right, tree, sizes);
                blocks.push((node_addrs[i], bytes));
                let first = chunk.first().map(|c| c.1).unwrap_or(0);
                let last = chunk.last().map(|c| c.2).unwrap_or(0);
                next_level.push((node_addrs[i], first, last));
            }
            if single {
                break;
            }
            level = next_level;
            depth += 1;
        }
        Ok(blocks)
    }
}

fn encode_snod(snod: &SnodBuf, tree: &GroupTreeWriter, sizes: Sizes) -> Result<Vec<u8>> {
    let size = snod_size(sizes, tree.leaf_k) as usize;
    let mut out = Vec::with_capacity(size);
    out.extend_from_slice(SNOD_SIGNATURE);
    out.push(1); // version
    out.push(0);
    codec::push_u16(&mut out, snod.entries.len() as u16);
    for entry in &snod.entries {
        entry.entry.encode(&mut out, sizes.offset);
    }
    if out.len() > size {
        return Err(Hdf5Error::BufferOverflowOnWrite);
    }
    out.resize(size, 0);
    Ok(out)
}

fn encode_tree_node(
    children: &[(u64, u64, u64)],
    level: u8,
    left_sibling: u64,
    right_sibling: u64,
    tree: &GroupTreeWriter,
    sizes: Sizes,
) -> Vec<u8> {
    let size = node_size(sizes, tree.internal_k) as usize;
    let mut out = Vec::with_capacity(size);
    out.extend_from_slice(TREE_SIGNATURE);
    out.push(0); // node type: group
    out.push(level);
    codec::push_u16(&mut out, children.len() as u16);
    codec::write_le(&mut out, left_sibling, sizes.offset);
    codec::write_le(&mut out, right_sibling, sizes.offset);
    // key_0 is the empty name at heap offset 0; every later key is the
    // lowest name offset of the child it precedes, and the final key is the
    // highest name offset in the last child.
    for (i, (child, first, _)) in children.iter().enumerate() {
        let key = if i == 0 { 0 } else { *first };
        codec::write_le(&mut out, key, sizes.length);
        codec::write_le(&mut out, *child, sizes.offset);
    }
    let last_key = children.last().map(|c| c.2).unwrap_or(0);
    codec::write_le(&mut out, last_key, sizes.length);
    out.resize(size, 0);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIZES: Sizes = Sizes {
        offset: 8,
        length: 8,
    };

    fn entry(name_offset: u64) -> SymbolTableEntry {
        SymbolTableEntry::object(name_offset, 0x1000 + name_offset)
    }

    #[test]
    fn fixed_node_sizes() {
        assert_eq!(node_size(SIZES, 16), 544);
        assert_eq!(snod_size(SIZES, 4), 328);
    }

    #[test]
    fn entry_roundtrip() {
        let mut group_entry = SymbolTableEntry::object(8, 96);
        group_entry.cache_type = CACHE_TYPE_GROUP;
        group_entry.address_of_btree = 136;
        group_entry.address_of_name_heap = 680;

        let mut bytes = Vec::new();
        group_entry.encode(&mut bytes, 8);
        assert_eq!(bytes.len(), SymbolTableEntry::encoded_size(8));

        let (_, parsed) = symbol_table_entry(&bytes, 8).unwrap();
        assert_eq!(parsed.link_name_offset, 8);
        assert_eq!(parsed.object_header_address, 96);
        assert_eq!(parsed.cache_type, CACHE_TYPE_GROUP);
        assert_eq!(parsed.address_of_btree, 136);
        assert_eq!(parsed.address_of_name_heap, 680);
    }

    #[test]
    fn inserts_stay_sorted_in_any_order() {
        let tree = GroupTreeWriter::new(136, 4, 16);
        let mut directory = GroupDirectory::new();
        let mut next_snod = 0x5000u64;
        let names = ["walrus", "aardvark", "newt", "badger", "zebra", "emu"];
        for (i, name) in names.iter().enumerate() {
            directory
                .insert(&tree, name, entry(8 * (i as u64 + 1)), || {
                    let addr = next_snod;
                    next_snod += 328;
                    Ok(addr)
                })
                .unwrap();
        }
        let mut sorted: Vec<&str> = names.to_vec();
        sorted.sort_unstable();
        assert_eq!(directory.names(), sorted);
        assert_eq!(directory.snod_count(), 1);
    }

    #[test]
    fn full_snod_splits() {
        let tree = GroupTreeWriter::new(136, 4, 16);
        let mut directory = GroupDirectory::new();
        let mut next_snod = 0x5000u64;
        // Capacity 2K = 8; the ninth insert forces a split.
        for i in 0..9 {
            let name = format!("dataset_{:02}", i);
            directory
                .insert(&tree, &name, entry(8 * (i + 1)), || {
                    let addr = next_snod;
                    next_snod += 328;
                    Ok(addr)
                })
                .unwrap();
        }
        assert_eq!(directory.snod_count(), 2);
        assert_eq!(directory.len(), 9);
        let names = directory.names();
        assert!(names.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn serialized_tree_parses_back() {
        let tree = GroupTreeWriter::new(136, 4, 16);
        let mut directory = GroupDirectory::new();
        let mut next_snod = 0x5000u64;
        for i in 0..12 {
            let name = format!("dataset_{:02}", i);
            directory
                .insert(&tree, &name, entry(8 * (i + 1)), || {
                    let addr = next_snod;
                    next_snod += 328;
                    Ok(addr)
                })
                .unwrap();
        }

        let blocks = directory
            .serialize(&tree, SIZES, || panic!("single root node expected"))
            .unwrap();
        let image_size = blocks
            .iter()
            .map(|(addr, bytes)| *addr as usize + bytes.len())
            .max()
            .unwrap();
        let mut image = vec![0u8; image_size];
        for (addr, bytes) in &blocks {
            image[*addr as usize..*addr as usize + bytes.len()].copy_from_slice(bytes);
        }

        let (_, root) = btree_node(&image[136..], SIZES).unwrap();
        assert_eq!(root.node_level, 0);
        assert_eq!(root.entries_used as usize, directory.snod_count());
        assert_eq!(root.keys.len(), root.children.len() + 1);
        assert_eq!(root.keys[0], 0);

        let mut total = 0;
        for child in &root.children {
            let (_, snod) = symbol_table_node(&image[*child as usize..], 8).unwrap();
            total += snod.entries.len();
        }
        assert_eq!(total, 12);
    }
}
