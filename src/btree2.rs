//! Version 2 B-tree read path.
//!
//! Fixed-size nodes; internal nodes interleave records with child pointers.
//! The variable-width "number of records" fields inside child pointers are
//! sized by a cascade that starts at the leaves: the width at each depth is
//! the minimum bytes that hold the maximum record count a child node at
//! that depth can carry.

use nom::bytes::streaming::{tag, take};
use nom::error::context;
use nom::number::streaming::{le_u16, le_u32, le_u8};

use crate::codec::{self, Sizes};
use crate::error::{Hdf5Error, Result};
use crate::parse_util::{address, PResult};

pub const HEADER_SIGNATURE: &[u8; 4] = b"BTHD";
pub const INTERNAL_SIGNATURE: &[u8; 4] = b"BTIN";
pub const LEAF_SIGNATURE: &[u8; 4] = b"BTLF";

/// Record type 5: link name hash into a fractal heap.
pub const RECORD_TYPE_LINK_NAME: u8 = 5;
/// Record type 6: link creation order into a fractal heap.
pub const RECORD_TYPE_CREATION_ORDER: u8 = 6;
/// Record type 8: attribute name into a fractal heap.
pub const RECORD_TYPE_ATTRIBUTE_NAME: u8 = 8;

#[derive(Debug, Clone)]
pub struct BtreeV2Header {
    pub record_type: u8,
    pub node_size: u32,
    pub record_size: u16,
    pub depth: u16,
    pub split_percent: u8,
    pub merge_percent: u8,
    pub root_address: u64,
    pub records_in_root: u16,
    pub total_records: u64,
}

pub fn btree_header(input: &[u8], sizes: Sizes) -> PResult<BtreeV2Header> {
    context("v2 b-tree header", move |input| {
        let (input, _) = tag(HEADER_SIGNATURE)(input)?;
        let (input, _version) = le_u8(input)?;
        let (input, record_type) = le_u8(input)?;
        let (input, node_size) = le_u32(input)?;
        let (input, record_size) = le_u16(input)?;
        let (input, depth) = le_u16(input)?;
        let (input, split_percent) = le_u8(input)?;
        let (input, merge_percent) = le_u8(input)?;
        let (input, root_address) = address(sizes.offset)(input)?;
        let (input, records_in_root) = le_u16(input)?;
        let (input, total_records) = address(sizes.length)(input)?;
        let (input, _checksum) = le_u32(input)?;
        Ok((
            input,
            BtreeV2Header {
                record_type,
                node_size,
                record_size,
                depth,
                split_percent,
                merge_percent,
                root_address,
                records_in_root,
                total_records,
            },
        ))
    })(input)
}

/// One decoded record. Unknown record types are carried as raw bytes so a
/// reader can skip content it does not understand.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    LinkName { name_hash: u32, heap_id: Vec<u8> },
    CreationOrder { order: u64, heap_id: Vec<u8> },
    AttributeName {
        heap_id: Vec<u8>,
        flags: u8,
        creation_order: u32,
        name_hash: u32,
    },
    Unknown(Vec<u8>),
}

fn decode_record(record_type: u8, raw: &[u8]) -> Record {
    match record_type {
        RECORD_TYPE_LINK_NAME if raw.len() >= 4 => Record::LinkName {
            name_hash: codec::read_le(&raw[..4]) as u32,
            heap_id: raw[4..].to_vec(),
        },
        RECORD_TYPE_CREATION_ORDER if raw.len() >= 8 => Record::CreationOrder {
            order: codec::read_le(&raw[..8]),
            heap_id: raw[8..].to_vec(),
        },
        RECORD_TYPE_ATTRIBUTE_NAME if raw.len() >= 17 => Record::AttributeName {
            heap_id: raw[..8].to_vec(),
            flags: raw[8],
            creation_order: codec::read_le(&raw[9..13]) as u32,
            name_hash: codec::read_le(&raw[13..17]) as u32,
        },
        _ => Record::Unknown(raw.to_vec()),
    }
}

/// Per-depth node capacities and child-pointer field widths, computed from
/// the leaves upward.
#[derive(Debug)]
struct NodeSizing {
    /// Maximum records a single node at depth d can hold.
    max_nrec: Vec<u64>,
    /// Maximum records a whole subtree rooted at depth d can hold.
    cum_max: Vec<u64>,
}

const NODE_OVERHEAD: u64 = 10; // signature, version, type, checksum

impl NodeSizing {
    fn compute(header: &BtreeV2Header) -> NodeSizing {
        let node_size = u64::from(header.node_size);
        let record_size = u64::from(header.record_size).max(1);
        let leaf_max = (node_size - NODE_OVERHEAD) / record_size;
        let mut max_nrec = vec![leaf_max];
        let mut cum_max = vec![leaf_max];
        for depth in 1..=u64::from(header.depth) {
            let ptr_size = 8
                + u64::from(codec::min_bytes_to_hold(max_nrec[depth as usize - 1]))
                + if depth > 1 {
                    u64::from(codec::min_bytes_to_hold(cum_max[depth as usize - 1]))
                } else {
                    0
                };
            let internal_max =
                (node_size - NODE_OVERHEAD - ptr_size) / (record_size + ptr_size);
            max_nrec.push(internal_max);
            cum_max.push(internal_max + (internal_max + 1) * cum_max[depth as usize - 1]);
        }
        NodeSizing { max_nrec, cum_max }
    }

    fn nrec_width(&self, child_depth: u64) -> u8 {
        codec::min_bytes_to_hold(self.max_nrec[child_depth as usize])
    }

    fn total_width(&self, child_depth: u64) -> u8 {
        codec::min_bytes_to_hold(self.cum_max[child_depth as usize])
    }
}

/// Read handle over one v2 B-tree; the header is read once and cached.
#[derive(Debug)]
pub struct BtreeV2 {
    pub header: BtreeV2Header,
    sizing: NodeSizing,
    sizes: Sizes,
}

impl BtreeV2 {
    pub fn read(contents: &[u8], addr: u64, sizes: Sizes) -> Result<BtreeV2> {
        let start = addr as usize;
        if start >= contents.len() {
            return Err(Hdf5Error::TruncatedRead);
        }
        let (_, header) = btree_header(&contents[start..], sizes)?;
        log::debug!(
            "v2 b-tree at {:#x}: record type {}, depth {}, {} records",
            addr,
            header.record_type,
            header.depth,
            header.total_records
        );
        let sizing = NodeSizing::compute(&header);
        Ok(BtreeV2 {
            header,
            sizing,
            sizes,
        })
    }

    /// Collect every record in key order.
    pub fn records(&self, contents: &[u8]) -> Result<Vec<Record>> {
        let mut out = Vec::new();
        if codec::is_undefined(self.header.root_address, self.sizes.offset)
            || self.header.total_records == 0
        {
            return Ok(out);
        }
        self.walk(
            contents,
            self.header.root_address,
            u64::from(self.header.records_in_root),
            u64::from(self.header.depth),
            &mut out,
        )?;
        Ok(out)
    }

    fn walk(
        &self,
        contents: &[u8],
        node_addr: u64,
        nrec: u64,
        depth: u64,
        out: &mut Vec<Record>,
    ) -> Result<()> {
        let start = node_addr as usize;
        if start >= contents.len() {
            return Err(Hdf5Error::TruncatedRead);
        }
        let input = &contents[start..];
        if depth == 0 {
            let (_, records) = leaf_node(input, self.header.record_size, nrec)?;
            for raw in records {
                out.push(decode_record(self.header.record_type, raw));
            }
            return Ok(());
        }

        let (_, node) = internal_node(
            input,
            self.header.record_size,
            nrec,
            self.sizes,
            self.sizing.nrec_width(depth - 1),
            if depth > 1 {
                Some(self.sizing.total_width(depth - 1))
            } else {
                None
            },
        )?;
        // child_0, record_0, child_1, ..., record_n-1, child_n.
        for (i, child) in node.children.iter().enumerate() {
            self.walk(contents, child.address, child.record_count, depth - 1, out)?;
            if i < node.records.len() {
                out.push(decode_record(self.header.record_type, &node.records[i]));
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
struct ChildPointer {
    address: u64,
    record_count: u64,
}

#[derive(Debug)]
struct InternalNode<'a> {
    records: Vec<&'a [u8]>,
    children: Vec<ChildPointer>,
}

fn leaf_node(input: &[u8], record_size: u16, nrec: u64) -> PResult<Vec<&[u8]>> {
    context("v2 b-tree leaf", move |input| {
        let (input, _) = tag(LEAF_SIGNATURE)(input)?;
        let (input, _version) = le_u8(input)?;
        let (input, _record_type) = le_u8(input)?;
        let mut records = Vec::with_capacity(nrec as usize);
        let mut input = input;
        for _ in 0..nrec {
            let (rest, raw) = take(record_size as usize)(input)?;
            records.push(raw);
            input = rest;
        }
        Ok((input, records))
    })(input)
}

fn internal_node<'a>(
    input: &'a [u8],
    record_size: u16,
    nrec: u64,
    sizes: Sizes,
    nrec_width: u8,
    total_width: Option<u8>,
) -> PResult<'a, InternalNode<'a>> {
    context("v2 b-tree internal node", move |input| {
        let (input, _) = tag(INTERNAL_SIGNATURE)(input)?;
        let (input, _version) = le_u8(input)?;
        let (input, _record_type) = le_u8(input)?;
        let mut records = Vec::with_capacity(nrec as usize);
        let mut input = input;
        for _ in 0..nrec {
            let (rest, raw) = take(record_size as usize)(input)?;
            records.push(raw);
            input = rest;
        }
        let mut children = Vec::with_capacity(nrec as usize + 1);
        for _ in 0..=nrec {
            let (rest, child_address) = address(sizes.offset)(input)?;
            let (rest, record_count) = address(nrec_width)(rest)?;
            let rest = match total_width {
                Some(width) => address(width)(rest)?.0,
                None => rest,
            };
            children.push(ChildPointer {
                address: child_address,
                record_count,
            });
            input = rest;
        }
        Ok((input, InternalNode { records, children }))
    })(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIZES: Sizes = Sizes {
        offset: 8,
        length: 8,
    };

    fn encode_header(depth: u16, root: u64, records_in_root: u16, total: u64) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(HEADER_SIGNATURE);
        out.push(0); // version
        out.push(RECORD_TYPE_LINK_NAME);
        codec::push_u32(&mut out, 512); // node size
        codec::push_u16(&mut out, 11); // record size: 4 hash + 7 heap id
        codec::push_u16(&mut out, depth);
        out.push(100);
        out.push(40);
        codec::push_u64(&mut out, root);
        codec::push_u16(&mut out, records_in_root);
        codec::push_u64(&mut out, total);
        codec::push_u32(&mut out, 0); // checksum
        out
    }

    fn link_record(hash: u32, id_byte: u8) -> Vec<u8> {
        let mut out = Vec::new();
        codec::push_u32(&mut out, hash);
        out.extend_from_slice(&[id_byte; 7]);
        out
    }

    #[test]
    fn header_roundtrip() {
        let bytes = encode_header(0, 0x2000, 3, 3);
        let (_, header) = btree_header(&bytes, SIZES).unwrap();
        assert_eq!(header.record_type, RECORD_TYPE_LINK_NAME);
        assert_eq!(header.node_size, 512);
        assert_eq!(header.record_size, 11);
        assert_eq!(header.depth, 0);
        assert_eq!(header.root_address, 0x2000);
    }

    #[test]
    fn sizing_cascade() {
        let bytes = encode_header(2, 0x2000, 2, 100);
        let (_, header) = btree_header(&bytes, SIZES).unwrap();
        let sizing = NodeSizing::compute(&header);
        // Leaf: (512 - 10) / 11 = 45 records -> one byte counts.
        assert_eq!(sizing.max_nrec[0], 45);
        assert_eq!(sizing.nrec_width(0), 1);
        // Depth 1: pointer = 8 + 1 = 9; (512 - 10 - 9) / (11 + 9) = 24.
        assert_eq!(sizing.max_nrec[1], 24);
        // Depth-1 subtree: 24 + 25 * 45 = 1149 -> two-byte totals.
        assert_eq!(sizing.cum_max[1], 1149);
        assert_eq!(sizing.total_width(1), 2);
    }

    #[test]
    fn walks_leaf_root() {
        let mut image = vec![0u8; 0x3000];
        let header_bytes = encode_header(0, 0x2000, 3, 3);
        image[..header_bytes.len()].copy_from_slice(&header_bytes);

        let mut leaf = Vec::new();
        leaf.extend_from_slice(LEAF_SIGNATURE);
        leaf.push(0);
        leaf.push(RECORD_TYPE_LINK_NAME);
        for (hash, id) in &[(10u32, 1u8), (20, 2), (30, 3)] {
            leaf.extend_from_slice(&link_record(*hash, *id));
        }
        image[0x2000..0x2000 + leaf.len()].copy_from_slice(&leaf);

        let btree = BtreeV2::read(&image, 0, SIZES).unwrap();
        let records = btree.records(&image).unwrap();
        assert_eq!(records.len(), 3);
        match &records[1] {
            Record::LinkName { name_hash, heap_id } => {
                assert_eq!(*name_hash, 20);
                assert_eq!(heap_id, &vec![2u8; 7]);
            }
            other => panic!("wrong record: {:?}", other),
        }
    }

    #[test]
    fn walks_internal_then_leaves_in_order() {
        let mut image = vec![0u8; 0x5000];
        let header_bytes = encode_header(1, 0x2000, 1, 5);
        image[..header_bytes.len()].copy_from_slice(&header_bytes);

        // Internal root: one record (hash 25), two leaf children.
        let mut internal = Vec::new();
        internal.extend_from_slice(INTERNAL_SIGNATURE);
        internal.push(0);
        internal.push(RECORD_TYPE_LINK_NAME);
        internal.extend_from_slice(&link_record(25, 9));
        // Child pointers: address + 1-byte record count.
        codec::push_u64(&mut internal, 0x3000);
        internal.push(2);
        codec::push_u64(&mut internal, 0x4000);
        internal.push(2);
        image[0x2000..0x2000 + internal.len()].copy_from_slice(&internal);

        for (base, hashes) in &[(0x3000usize, [10u32, 20]), (0x4000, [30, 40])] {
            let mut leaf = Vec::new();
            leaf.extend_from_slice(LEAF_SIGNATURE);
            leaf.push(0);
            leaf.push(RECORD_TYPE_LINK_NAME);
            for hash in hashes {
                leaf.extend_from_slice(&link_record(*hash, *hash as u8));
            }
            image[*base..*base + leaf.len()].copy_from_slice(&leaf);
        }

        let btree = BtreeV2::read(&image, 0, SIZES).unwrap();
        let records = btree.records(&image).unwrap();
        let hashes: Vec<u32> = records
            .iter()
            .map(|r| match r {
                Record::LinkName { name_hash, .. } => *name_hash,
                other => panic!("wrong record: {:?}", other),
            })
            .collect();
        assert_eq!(hashes, vec![10, 20, 25, 30, 40]);
    }
}
