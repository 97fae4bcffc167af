//! Deterministic layout of every metadata and data block in a newly
//! written file.
//!
//! The file opens with a fixed prelude: superblock, root-group object
//! header, root B-tree node, root local heap, then a growth zone reserved
//! for dataset object headers. Data blocks and overflow metadata append
//! after the growth zone. Offsets only grow; every region is disjoint from
//! every other; abandoned regions stay reserved forever.

use crate::codec::{self, Sizes};
use crate::error::{Hdf5Error, Result};
use crate::parse_util::pad8;

/// First byte reserved for data blocks and overflow metadata.
pub const DATA_START: u64 = 2048;

/// Byte size of a dataset object-header slot in the growth zone.
pub const DATASET_HEADER_SLOT: u64 = 272;

/// Size of the first global heap collection; each later one doubles.
pub const FIRST_GLOBAL_HEAP_SIZE: u64 = 4096;

#[derive(Debug, Clone)]
pub struct Region {
    pub tag: String,
    pub offset: u64,
    pub size: u64,
    pub abandoned: bool,
}

impl Region {
    fn end(&self) -> u64 {
        self.offset + self.size
    }
}

#[derive(Debug)]
pub struct FileAllocator {
    sizes: Sizes,
    regions: Vec<Region>,
    /// Next free slot inside the growth zone.
    growth_cursor: u64,
    end_of_file: u64,
    last_global_heap_size: u64,
}

/// Where the fixed prelude landed, for wiring up the root group.
#[derive(Debug, Clone, Copy)]
pub struct Prelude {
    pub superblock: u64,
    pub root_header: u64,
    pub root_header_size: u64,
    pub root_btree: u64,
    pub root_heap_header: u64,
    pub root_heap_contents: u64,
    pub root_heap_contents_size: u64,
}

impl FileAllocator {
    /// Lay out the prelude for a fresh file. `btree_node_size` and the
    /// 88-byte initial heap segment come from the group machinery so that
    /// narrower offset sizes shrink the prelude consistently.
    pub fn new(sizes: Sizes, superblock_size: u64, btree_node_size: u64) -> (Self, Prelude) {
        let mut allocator = FileAllocator {
            sizes,
            regions: Vec::new(),
            growth_cursor: 0,
            end_of_file: DATA_START,
            last_global_heap_size: 0,
        };
        let superblock = allocator.place("superblock", 0, superblock_size);
        let root_header = allocator.place("header:/", superblock, 40);
        let root_btree = allocator.place("btree:/", root_header, btree_node_size);
        let root_heap_header = allocator.place("heap:/", root_btree, 32);
        let root_heap_contents = allocator.place("heap-data:/", root_heap_header, 88);
        allocator.growth_cursor = root_heap_contents;

        let prelude = Prelude {
            superblock: 0,
            root_header: superblock,
            root_header_size: 40,
            root_btree: root_header,
            root_heap_header: root_btree,
            root_heap_contents: root_heap_header,
            root_heap_contents_size: 88,
        };
        (allocator, prelude)
    }

    fn place(&mut self, tag: &str, offset: u64, size: u64) -> u64 {
        self.regions.push(Region {
            tag: tag.to_string(),
            offset,
            size,
            abandoned: false,
        });
        offset + size
    }

    fn check_room(&self, end: u64) -> Result<()> {
        // The undefined sentinel itself must stay unreachable.
        if end >= codec::undefined(self.sizes.offset) {
            return Err(Hdf5Error::AllocationOverflow);
        }
        Ok(())
    }

    fn append(&mut self, tag: String, size: u64) -> Result<u64> {
        let offset = self.end_of_file;
        let end = offset
            .checked_add(pad8(size as usize) as u64)
            .ok_or(Hdf5Error::AllocationOverflow)?;
        self.check_room(end)?;
        self.regions.push(Region {
            tag,
            offset,
            size,
            abandoned: false,
        });
        self.end_of_file = end;
        Ok(offset)
    }

    /// Reserve a dataset object-header slot: in the growth zone while it
    /// lasts, appended past end-of-file after.
    pub fn allocate_dataset_object_header(&mut self, name: &str) -> Result<u64> {
        let tag = format!("header:{}", name);
        if self.growth_cursor + DATASET_HEADER_SLOT <= DATA_START {
            let offset = self.growth_cursor;
            self.growth_cursor += DATASET_HEADER_SLOT;
            self.regions.push(Region {
                tag,
                offset,
                size: DATASET_HEADER_SLOT,
                abandoned: false,
            });
            log::debug!("header slot for {:?} at {:#x} (growth zone)", name, offset);
            Ok(offset)
        } else {
            let offset = self.append(tag, DATASET_HEADER_SLOT)?;
            log::debug!("header slot for {:?} at {:#x} (appended)", name, offset);
            Ok(offset)
        }
    }

    /// Grow a dataset's header to `new_size` bytes, in place when the slot
    /// is the most recent allocation, otherwise by relocating it and
    /// abandoning the old slot. Returns the (possibly new) offset.
    pub fn increase_header_allocation(&mut self, name: &str, new_size: u64) -> Result<u64> {
        let tag = format!("header:{}", name);
        let index = self
            .regions
            .iter()
            .position(|r| r.tag == tag && !r.abandoned)
            .ok_or_else(|| Hdf5Error::Parse(format!("no header region for {}", name)))?;
        let (offset, size) = (self.regions[index].offset, self.regions[index].size);
        if new_size <= size {
            return Ok(offset);
        }
        let new_size = pad8(new_size as usize) as u64;
        if offset + size == self.end_of_file {
            self.check_room(offset + new_size)?;
            self.regions[index].size = new_size;
            self.end_of_file = offset + new_size;
            return Ok(offset);
        }
        if offset + size == self.growth_cursor
            && offset + new_size <= DATA_START
        {
            self.regions[index].size = new_size;
            self.growth_cursor = offset + new_size;
            return Ok(offset);
        }
        self.regions[index].abandoned = true;
        self.append(tag, new_size)
    }

    /// Current capacity of a dataset's header slot.
    pub fn header_capacity(&self, name: &str) -> Option<u64> {
        let tag = format!("header:{}", name);
        self.regions
            .iter()
            .find(|r| r.tag == tag && !r.abandoned)
            .map(|r| r.size)
    }

    /// Continuation region for one object header's overflow messages.
    pub fn allocate_continuation(&mut self, name: &str, size: u64) -> Result<u64> {
        self.append(format!("continuation:{}", name), size)
    }

    /// Contiguous raw data for a dataset.
    pub fn allocate_data_block(&mut self, name: &str, size: u64) -> Result<u64> {
        self.append(format!("data:{}", name), size)
    }

    /// A symbol table node.
    pub fn allocate_snod(&mut self, size: u64) -> Result<u64> {
        let index = self
            .regions
            .iter()
            .filter(|r| r.tag.starts_with("snod:"))
            .count();
        self.append(format!("snod:{}", index), size)
    }

    /// A B-tree node beyond the root.
    pub fn allocate_btree_node(&mut self, size: u64) -> Result<u64> {
        let index = self
            .regions
            .iter()
            .filter(|r| r.tag.starts_with("btree-node:"))
            .count();
        self.append(format!("btree-node:{}", index), size)
    }

    /// A global heap collection: 4 KiB at first, doubling with each
    /// expansion, and never smaller than `min_size`.
    pub fn allocate_global_heap(&mut self, min_size: u64) -> Result<(u64, u64)> {
        let mut size = if self.last_global_heap_size == 0 {
            FIRST_GLOBAL_HEAP_SIZE
        } else {
            self.last_global_heap_size * 2
        };
        while size < min_size {
            size *= 2;
        }
        self.last_global_heap_size = size;
        let offset = self.append(format!("gheap:{:#x}", self.end_of_file), size)?;
        Ok((offset, size))
    }

    /// Replacement segment for an overflowing local heap. The old segment
    /// is marked abandoned: still accounted for, never referenced again.
    pub fn expand_local_heap_contents(&mut self, group: &str, new_size: u64) -> Result<u64> {
        let tag = format!("heap-data:{}", group);
        for region in self
            .regions
            .iter_mut()
            .filter(|r| r.tag == tag && !r.abandoned)
        {
            region.abandoned = true;
        }
        self.append(tag, new_size)
    }

    /// Monotone, 8-byte aligned, and exactly what the superblock's
    /// end-of-file field holds at flush.
    pub fn end_of_file(&self) -> u64 {
        self.end_of_file
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn snod_addresses(&self) -> Vec<u64> {
        self.regions
            .iter()
            .filter(|r| r.tag.starts_with("snod:"))
            .map(|r| r.offset)
            .collect()
    }

    pub fn global_heap_sizes(&self) -> Vec<u64> {
        self.regions
            .iter()
            .filter(|r| r.tag.starts_with("gheap:"))
            .map(|r| r.size)
            .collect()
    }

    /// Every pair of regions is disjoint. Exercised by tests after every
    /// scenario.
    pub fn verify_disjoint(&self) -> Result<()> {
        let mut sorted: Vec<&Region> = self.regions.iter().collect();
        sorted.sort_by_key(|r| r.offset);
        for pair in sorted.windows(2) {
            if pair[0].end() > pair[1].offset {
                return Err(Hdf5Error::Parse(format!(
                    "overlapping regions {} and {}",
                    pair[0].tag, pair[1].tag
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator() -> (FileAllocator, Prelude) {
        FileAllocator::new(Sizes::new(8, 8), 96, 544)
    }

    #[test]
    fn prelude_layout() {
        let (allocator, prelude) = allocator();
        assert_eq!(prelude.root_header, 96);
        assert_eq!(prelude.root_btree, 136);
        assert_eq!(prelude.root_heap_header, 680);
        assert_eq!(prelude.root_heap_contents, 712);
        assert_eq!(allocator.growth_cursor, 800);
        assert_eq!(allocator.end_of_file(), DATA_START);
        allocator.verify_disjoint().unwrap();
    }

    #[test]
    fn single_dataset_scenario() {
        let (mut allocator, _) = allocator();
        let header = allocator.allocate_dataset_object_header("temperature").unwrap();
        assert_eq!(header, 800);
        let data = allocator.allocate_data_block("temperature", 8).unwrap();
        assert_eq!(data, 2048);
        assert_eq!(allocator.end_of_file(), 2056);
        assert_eq!(allocator.end_of_file() % 8, 0);
        allocator.verify_disjoint().unwrap();
    }

    #[test]
    fn growth_zone_holds_four_headers() {
        let (mut allocator, _) = allocator();
        let offsets: Vec<u64> = (0..6)
            .map(|i| {
                allocator
                    .allocate_dataset_object_header(&format!("dataset_{}", i + 1))
                    .unwrap()
            })
            .collect();
        // Four slots fit below 2048; later headers append past the data
        // boundary.
        assert_eq!(offsets[..4], [800, 1072, 1344, 1616]);
        assert!(offsets[4] >= DATA_START);
        assert_eq!(offsets[5], offsets[4] + DATASET_HEADER_SLOT);
        allocator.verify_disjoint().unwrap();
    }

    #[test]
    fn header_regrowth_relocates_when_pinned() {
        let (mut allocator, _) = allocator();
        let first = allocator.allocate_dataset_object_header("a").unwrap();
        let _second = allocator.allocate_dataset_object_header("b").unwrap();
        // "a" is pinned between the prelude and "b": regrowth must move it.
        let moved = allocator.increase_header_allocation("a", 600).unwrap();
        assert_ne!(moved, first);
        assert!(moved >= DATA_START);
        let abandoned: Vec<_> = allocator
            .regions()
            .iter()
            .filter(|r| r.abandoned)
            .collect();
        assert_eq!(abandoned.len(), 1);
        assert_eq!(abandoned[0].offset, first);
        allocator.verify_disjoint().unwrap();
    }

    #[test]
    fn global_heap_doubles() {
        let (mut allocator, _) = allocator();
        let (first, size_a) = allocator.allocate_global_heap(0).unwrap();
        let (_, size_b) = allocator.allocate_global_heap(0).unwrap();
        let (_, size_c) = allocator.allocate_global_heap(0).unwrap();
        assert_eq!(first, DATA_START);
        assert_eq!(
            (size_a, size_b, size_c),
            (4096, 8192, 16384)
        );
        assert_eq!(allocator.global_heap_sizes(), vec![4096, 8192, 16384]);
        allocator.verify_disjoint().unwrap();
    }

    #[test]
    fn local_heap_expansion_abandons_old_segment() {
        let (mut allocator, _) = allocator();
        let new_segment = allocator.expand_local_heap_contents("/", 176).unwrap();
        assert!(new_segment >= DATA_START);
        let old = allocator
            .regions()
            .iter()
            .find(|r| r.tag == "heap-data:/" && r.abandoned)
            .expect("old segment abandoned");
        assert_eq!(old.offset, 712);
        // Abandoned regions remain reserved: nothing lands on them.
        allocator.verify_disjoint().unwrap();
    }

    #[test]
    fn allocation_overflow_at_narrow_offset_size() {
        let (mut allocator, _) = FileAllocator::new(Sizes::new(4, 4), 72, 296);
        // Push end-of-file near the 32-bit undefined sentinel.
        allocator.end_of_file = 0xFFFF_F000;
        match allocator.allocate_data_block("big", 0x2000) {
            Err(Hdf5Error::AllocationOverflow) => {}
            other => panic!("expected AllocationOverflow, got {:?}", other),
        }
    }
}
