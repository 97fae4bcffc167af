//! Fractal heap read path: resolving a bit-packed heap id to the byte run
//! of its object.
//!
//! The heap's linear address space is tiled by blocks. Row r of an indirect
//! block holds `table_width` children of size `starting_block_size *
//! 2^max(0, r-1)`; rows below the direct-block ceiling point at "FHDB"
//! direct blocks and the rest at further "FHIB" indirect blocks. An
//! indirect block stores a single block offset; each child's position is
//! the running sum of the sizes before it.

use std::cell::RefCell;
use std::collections::HashMap;

use nom::bytes::streaming::tag;
use nom::error::context;
use nom::number::streaming::{le_u16, le_u32, le_u8};

use crate::codec::{self, Sizes};
use crate::error::{Hdf5Error, Result};
use crate::parse_util::{address, PResult};

pub const HEAP_HEADER_SIGNATURE: &[u8; 4] = b"FRHP";
pub const DIRECT_BLOCK_SIGNATURE: &[u8; 4] = b"FHDB";
pub const INDIRECT_BLOCK_SIGNATURE: &[u8; 4] = b"FHIB";

/// Flag bit: direct blocks carry a trailing checksum.
const FLAG_CHECKSUM_DIRECT_BLOCKS: u8 = 0x02;

#[derive(Debug, Clone)]
pub struct FractalHeapHeader {
    pub heap_id_length: u16,
    pub io_filter_length: u16,
    pub flags: u8,
    pub max_managed_object_size: u32,
    pub managed_space: u64,
    pub number_of_managed_objects: u64,
    pub table_width: u16,
    pub starting_block_size: u64,
    pub max_direct_block_size: u64,
    /// Maximum heap size in bits; constrains the offset field width of
    /// every heap id.
    pub max_heap_size: u16,
    pub root_block_address: u64,
    pub current_rows_in_root: u16,
}

impl FractalHeapHeader {
    /// Byte width of the offset field in heap ids and block headers.
    pub fn offset_bytes(&self) -> u8 {
        codec::bytes_for_bits(u32::from(self.max_heap_size))
    }

    /// Byte width of the length field in managed heap ids.
    pub fn length_bytes(&self) -> u8 {
        let bound = std::cmp::min(
            self.max_direct_block_size,
            u64::from(self.max_managed_object_size),
        );
        codec::min_bytes_to_hold(bound)
    }

    /// Rows at or above this index in an indirect block point at further
    /// indirect blocks.
    pub fn max_direct_rows(&self) -> u64 {
        log2(self.max_direct_block_size) - log2(self.starting_block_size) + 2
    }

    pub fn row_block_size(&self, row: u64) -> u64 {
        if row <= 1 {
            self.starting_block_size
        } else {
            self.starting_block_size << (row - 1)
        }
    }

    fn direct_block_header_size(&self, sizes: Sizes) -> u64 {
        let checksum = if self.flags & FLAG_CHECKSUM_DIRECT_BLOCKS != 0 {
            4
        } else {
            0
        };
        5 + u64::from(sizes.offset) + u64::from(self.offset_bytes()) + checksum
    }

    /// Number of rows in an indirect block spanning `block_size` bytes of
    /// heap space.
    fn indirect_rows(&self, block_size: u64) -> u64 {
        log2(block_size) - log2(self.starting_block_size * u64::from(self.table_width)) + 1
    }
}

fn log2(value: u64) -> u64 {
    u64::from(63 - value.max(1).leading_zeros() as u64)
}

/// A parsed heap id for a managed object.
#[derive(Debug, Clone, PartialEq)]
pub struct HeapId {
    pub version: u8,
    pub kind: u8,
    pub offset: u64,
    pub length: u64,
}

pub fn heap_header(input: &[u8], sizes: Sizes) -> PResult<FractalHeapHeader> {
    context("fractal heap header", move |input| {
        let (input, _) = tag(HEAP_HEADER_SIGNATURE)(input)?;
        let (input, _version) = le_u8(input)?;
        let (input, heap_id_length) = le_u16(input)?;
        let (input, io_filter_length) = le_u16(input)?;
        let (input, flags) = le_u8(input)?;
        let (input, max_managed_object_size) = le_u32(input)?;
        let (input, _next_huge_id) = address(sizes.length)(input)?;
        let (input, _huge_btree_address) = address(sizes.offset)(input)?;
        let (input, _free_space) = address(sizes.length)(input)?;
        let (input, _free_space_manager_address) = address(sizes.offset)(input)?;
        let (input, managed_space) = address(sizes.length)(input)?;
        let (input, _allocated_managed_space) = address(sizes.length)(input)?;
        let (input, _direct_block_iterator_offset) = address(sizes.length)(input)?;
        let (input, number_of_managed_objects) = address(sizes.length)(input)?;
        let (input, _huge_size) = address(sizes.length)(input)?;
        let (input, _huge_count) = address(sizes.length)(input)?;
        let (input, _tiny_size) = address(sizes.length)(input)?;
        let (input, _tiny_count) = address(sizes.length)(input)?;
        let (input, table_width) = le_u16(input)?;
        let (input, starting_block_size) = address(sizes.length)(input)?;
        let (input, max_direct_block_size) = address(sizes.length)(input)?;
        let (input, max_heap_size) = le_u16(input)?;
        let (input, _starting_rows) = le_u16(input)?;
        let (input, root_block_address) = address(sizes.offset)(input)?;
        let (input, current_rows_in_root) = le_u16(input)?;
        // Filtered-root fields and the checksum follow; nothing below needs
        // them.
        Ok((
            input,
            FractalHeapHeader {
                heap_id_length,
                io_filter_length,
                flags,
                max_managed_object_size,
                managed_space,
                number_of_managed_objects,
                table_width,
                starting_block_size,
                max_direct_block_size,
                max_heap_size,
                root_block_address,
                current_rows_in_root,
            },
        ))
    })(input)
}

/// The read handle: header plus a per-handle cache of indirect block child
/// tables, keyed by file offset. Entries never invalidate.
#[derive(Debug)]
pub struct FractalHeap {
    pub header: FractalHeapHeader,
    sizes: Sizes,
    child_cache: RefCell<HashMap<u64, Vec<u64>>>,
}

impl FractalHeap {
    pub fn read(contents: &[u8], addr: u64, sizes: Sizes) -> Result<FractalHeap> {
        let start = addr as usize;
        if start >= contents.len() {
            return Err(Hdf5Error::TruncatedRead);
        }
        let (_, header) = heap_header(&contents[start..], sizes)?;
        log::debug!(
            "fractal heap at {:#x}: table width {}, starting block {} bytes, {} rows in root",
            addr,
            header.table_width,
            header.starting_block_size,
            header.current_rows_in_root
        );
        Ok(FractalHeap {
            header,
            sizes,
            child_cache: RefCell::new(HashMap::new()),
        })
    }

    /// Decode a managed heap id from its bit-packed form. The offset field
    /// width comes from the heap's maximum-size bit count, the length field
    /// width from the direct-block and object ceilings.
    pub fn parse_heap_id(&self, bytes: &[u8]) -> Result<HeapId> {
        if bytes.is_empty() {
            return Err(Hdf5Error::TruncatedRead);
        }
        let first = bytes[0];
        let version = first >> 6;
        let kind = first >> 4 & 0x3;
        let offset_len = self.header.offset_bytes() as usize;
        let length_len = self.header.length_bytes() as usize;
        if bytes.len() < 1 + offset_len + length_len {
            return Err(Hdf5Error::TruncatedRead);
        }
        let offset = codec::read_le(&bytes[1..1 + offset_len]);
        let length = codec::read_le(&bytes[1 + offset_len..1 + offset_len + length_len]);
        Ok(HeapId {
            version,
            kind,
            offset,
            length,
        })
    }

    /// Resolve a heap id to the file offset of its first payload byte.
    pub fn resolve(&self, contents: &[u8], id: &HeapId) -> Result<u64> {
        if id.offset >= self.header.managed_space
            || id.offset + id.length > self.header.managed_space
        {
            return Err(Hdf5Error::HeapIdOutOfRange);
        }
        let root = self.header.root_block_address;
        if codec::is_undefined(root, self.sizes.offset) {
            return Err(Hdf5Error::UnallocatedChildBlock);
        }
        if self.header.current_rows_in_root == 0 {
            // Root is a single direct block spanning the start of the heap.
            self.expect_direct_block(contents, root)?;
            return Ok(root + id.offset);
        }
        self.locate(
            contents,
            root,
            0,
            u64::from(self.header.current_rows_in_root),
            id.offset,
        )
    }

    /// Fetch the object's bytes, header excluded.
    pub fn object<'a>(&self, contents: &'a [u8], id: &HeapId) -> Result<&'a [u8]> {
        let file_offset = self.resolve(contents, id)? as usize;
        let end = file_offset + id.length as usize;
        if end > contents.len() {
            return Err(Hdf5Error::TruncatedRead);
        }
        Ok(&contents[file_offset..end])
    }

    fn locate(
        &self,
        contents: &[u8],
        block_addr: u64,
        block_heap_start: u64,
        nrows: u64,
        target: u64,
    ) -> Result<u64> {
        let children = self.indirect_children(contents, block_addr, nrows)?;
        let max_direct_rows = self.header.max_direct_rows();
        let width = u64::from(self.header.table_width);

        let mut cursor = block_heap_start;
        for (i, child) in children.iter().enumerate() {
            let row = i as u64 / width;
            let child_size = self.header.row_block_size(row);
            if target < cursor + child_size {
                if codec::is_undefined(*child, self.sizes.offset) {
                    return Err(Hdf5Error::UnallocatedChildBlock);
                }
                if row < max_direct_rows {
                    self.expect_direct_block(contents, *child)?;
                    return Ok(*child + (target - cursor));
                }
                let child_rows = self.header.indirect_rows(child_size);
                return self.locate(contents, *child, cursor, child_rows, target);
            }
            cursor += child_size;
        }
        Err(Hdf5Error::HeapIdOutOfRange)
    }

    fn indirect_children(
        &self,
        contents: &[u8],
        block_addr: u64,
        nrows: u64,
    ) -> Result<Vec<u64>> {
        if let Some(children) = self.child_cache.borrow().get(&block_addr) {
            return Ok(children.clone());
        }
        let start = block_addr as usize;
        if start >= contents.len() {
            return Err(Hdf5Error::TruncatedRead);
        }
        let n_children = nrows * u64::from(self.header.table_width);
        let (_, children) = indirect_block(
            &contents[start..],
            self.sizes,
            self.header.offset_bytes(),
            n_children,
            self.header.io_filter_length > 0,
            self.header.max_direct_rows() * u64::from(self.header.table_width),
        )?;
        self.child_cache
            .borrow_mut()
            .insert(block_addr, children.clone());
        Ok(children)
    }

    fn expect_direct_block(&self, contents: &[u8], addr: u64) -> Result<()> {
        let start = addr as usize;
        if start + 4 > contents.len() {
            return Err(Hdf5Error::TruncatedRead);
        }
        if &contents[start..start + 4] != DIRECT_BLOCK_SIGNATURE {
            return Err(Hdf5Error::BadSignature);
        }
        Ok(())
    }

    /// Direct block header size, exposed for in-block payload math.
    pub fn block_header_size(&self) -> u64 {
        self.header.direct_block_header_size(self.sizes)
    }
}

/// Parse the child address table of an "FHIB" indirect block. Direct-row
/// children of a filtered heap carry (size, mask) after the address.
fn indirect_block<'a>(
    input: &'a [u8],
    sizes: Sizes,
    heap_offset_bytes: u8,
    n_children: u64,
    filtered: bool,
    n_direct_children: u64,
) -> PResult<'a, Vec<u64>> {
    context("fractal heap indirect block", move |input| {
        let (input, _) = tag(INDIRECT_BLOCK_SIGNATURE)(input)?;
        let (input, _version) = le_u8(input)?;
        let (input, _heap_header_address) = address(sizes.offset)(input)?;
        let (mut input, _block_offset) = address(heap_offset_bytes)(input)?;
        let mut children = Vec::with_capacity(n_children as usize);
        for i in 0..n_children {
            let (rest, child) = address(sizes.offset)(input)?;
            let rest = if filtered && i < n_direct_children {
                let (rest, _filtered_size) = address(sizes.length)(rest)?;
                let (rest, _filter_mask) = le_u32(rest)?;
                rest
            } else {
                rest
            };
            children.push(child);
            input = rest;
        }
        Ok((input, children))
    })(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIZES: Sizes = Sizes {
        offset: 8,
        length: 8,
    };

    /// Header matching the resolution scenario: starting block 512, table
    /// width 4, 16-bit max heap size.
    fn test_header() -> FractalHeapHeader {
        FractalHeapHeader {
            heap_id_length: 7,
            io_filter_length: 0,
            flags: 0,
            max_managed_object_size: 4096,
            managed_space: 8192,
            number_of_managed_objects: 3,
            table_width: 4,
            starting_block_size: 512,
            max_direct_block_size: 4096,
            max_heap_size: 16,
            root_block_address: 0x1000,
            current_rows_in_root: 2,
        }
    }

    fn test_heap(header: FractalHeapHeader) -> FractalHeap {
        FractalHeap {
            header,
            sizes: SIZES,
            child_cache: RefCell::new(HashMap::new()),
        }
    }

    /// Flat image: an indirect root at 0x1000 pointing at eight direct
    /// blocks of 512 bytes each, laid out back to back from 0x2000.
    fn test_image() -> Vec<u8> {
        let mut image = vec![0u8; 0x4000];
        let root = 0x1000usize;
        image[root..root + 4].copy_from_slice(INDIRECT_BLOCK_SIGNATURE);
        image[root + 4] = 0; // version
        // Heap header address (8) + block offset (2 bytes for 16 bits).
        let mut cursor = root + 5 + 8 + 2;
        for i in 0..8u64 {
            let child_addr = 0x2000 + i * 512;
            let mut bytes = Vec::new();
            codec::write_le(&mut bytes, child_addr, 8);
            image[cursor..cursor + 8].copy_from_slice(&bytes);
            cursor += 8;
            let block = child_addr as usize;
            image[block..block + 4].copy_from_slice(DIRECT_BLOCK_SIGNATURE);
        }
        image
    }

    #[test]
    fn width_derivation() {
        let header = test_header();
        assert_eq!(header.offset_bytes(), 2);
        // min(4096, 4096) needs two bytes.
        assert_eq!(header.length_bytes(), 2);
        assert_eq!(header.max_direct_rows(), 5);
        assert_eq!(header.row_block_size(0), 512);
        assert_eq!(header.row_block_size(1), 512);
        assert_eq!(header.row_block_size(2), 1024);
    }

    #[test]
    fn heap_id_unpacks_at_derived_widths() {
        let heap = test_heap(test_header());
        // version 0, type 1 (managed), offset 600, length 42.
        let bytes = [0x10, 0x58, 0x02, 0x2A, 0x00];
        let id = heap.parse_heap_id(&bytes).unwrap();
        assert_eq!(id.kind, 1);
        assert_eq!(id.offset, 600);
        assert_eq!(id.length, 42);
    }

    #[test]
    fn resolves_offset_into_second_row_one_block() {
        let heap = test_heap(test_header());
        let image = test_image();
        // Offset 600 lands in the second row-0/1 child: block size 512,
        // covering heap range [512, 1024).
        let id = HeapId {
            version: 0,
            kind: 1,
            offset: 600,
            length: 42,
        };
        let file_offset = heap.resolve(&image, &id).unwrap();
        assert_eq!(file_offset, 0x2000 + 512 + (600 - 512));
        let object = heap.object(&image, &id).unwrap();
        assert_eq!(object.len(), 42);
    }

    #[test]
    fn rejects_offset_beyond_managed_space() {
        let heap = test_heap(test_header());
        let image = test_image();
        let id = HeapId {
            version: 0,
            kind: 1,
            offset: 8190,
            length: 42,
        };
        match heap.resolve(&image, &id) {
            Err(Hdf5Error::HeapIdOutOfRange) => {}
            other => panic!("expected HeapIdOutOfRange, got {:?}", other),
        }
    }

    #[test]
    fn rejects_unallocated_child() {
        let heap = test_heap(test_header());
        let mut image = test_image();
        // Wipe the second child pointer to the undefined address.
        let slot = 0x1000 + 5 + 8 + 2 + 8;
        for b in &mut image[slot..slot + 8] {
            *b = 0xFF;
        }
        let id = HeapId {
            version: 0,
            kind: 1,
            offset: 600,
            length: 42,
        };
        match heap.resolve(&image, &id) {
            Err(Hdf5Error::UnallocatedChildBlock) => {}
            other => panic!("expected UnallocatedChildBlock, got {:?}", other),
        }
    }
}
