//! The two heaps: per-group local heaps holding link names, and the
//! file-global heap holding variable-length payloads.

use std::collections::BTreeMap;

use nom::bytes::streaming::{tag, take};
use nom::error::context;
use nom::number::streaming::{le_u16, le_u8};

use crate::codec::{self, Sizes};
use crate::error::{Hdf5Error, Result};
use crate::parse_util::{address, cstr, pad8, PResult};

pub const LOCAL_HEAP_SIGNATURE: &[u8; 4] = b"HEAP";
pub const GLOBAL_HEAP_SIGNATURE: &[u8; 4] = b"GCOL";

/// Size of the local heap header: signature, version, reserved, and three
/// width-dependent fields at 8-byte widths.
pub const LOCAL_HEAP_HEADER_SIZE: u64 = 32;

/// Initial size of a freshly created group's name arena.
pub const LOCAL_HEAP_INITIAL_SIZE: u64 = 88;

// ---------------------------------------------------------------------------
// Local heap
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LocalHeapInfo {
    pub data_segment_size: u64,
    pub offset_to_head_of_freelist: u64,
    pub address_of_data_segment: u64,
}

pub fn local_heap(input: &[u8], sizes: Sizes) -> PResult<LocalHeapInfo> {
    context("local heap", move |input| {
        let (input, _) = tag(LOCAL_HEAP_SIGNATURE)(input)?;
        let (input, _version) = le_u8(input)?;
        let (input, _) = tag([0, 0, 0])(input)?;
        let (input, data_segment_size) = address(sizes.length)(input)?;
        let (input, offset_to_head_of_freelist) = address(sizes.length)(input)?;
        let (input, address_of_data_segment) = address(sizes.offset)(input)?;
        Ok((
            input,
            LocalHeapInfo {
                data_segment_size,
                offset_to_head_of_freelist,
                address_of_data_segment,
            },
        ))
    })(input)
}

/// Materialize the NUL-terminated name at `offset` within the heap's data
/// segment.
pub fn read_name(contents: &[u8], heap: &LocalHeapInfo, offset: u64) -> Result<String> {
    let start = heap
        .address_of_data_segment
        .checked_add(offset)
        .map(|v| v as usize)
        .filter(|v| *v < contents.len())
        .ok_or(Hdf5Error::TruncatedRead)?;
    Ok(cstr(&contents[start..]))
}

/// Write-side name arena for one group.
///
/// Names pack as NUL-terminated strings aligned to 8 bytes, starting after
/// an 8-byte reserved slot at offset 0. On overflow, a doubled segment is
/// allocated and the old one is abandoned: still accounted for in the file,
/// never referenced again.
#[derive(Debug)]
pub struct LocalHeapWriter {
    pub header_address: u64,
    pub segment_address: u64,
    capacity: u64,
    used: u64,
    data: Vec<u8>,
}

impl LocalHeapWriter {
    pub fn new(header_address: u64, segment_address: u64, capacity: u64) -> Self {
        LocalHeapWriter {
            header_address,
            segment_address,
            capacity,
            used: 8,
            data: vec![0; capacity as usize],
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    /// Append a link name, expanding the heap first if it would not fit.
    ///
    /// `expand` receives the doubled byte size and returns the address of
    /// the new data segment; the old segment becomes abandoned space.
    pub fn insert<F>(&mut self, name: &str, expand: F) -> Result<u64>
    where
        F: FnOnce(u64) -> Result<u64>,
    {
        let entry_len = pad8(name.len() + 1) as u64;
        if self.used + entry_len > self.capacity {
            let mut new_capacity = self.capacity * 2;
            while self.used + entry_len > new_capacity {
                new_capacity *= 2;
            }
            let new_address = expand(new_capacity)?;
            log::debug!(
                "local heap grows {} -> {} bytes, segment moves {:#x} -> {:#x}",
                self.capacity,
                new_capacity,
                self.segment_address,
                new_address
            );
            self.capacity = new_capacity;
            self.segment_address = new_address;
            self.data.resize(new_capacity as usize, 0);
        }
        let offset = self.used;
        let start = offset as usize;
        self.data[start..start + name.len()].copy_from_slice(name.as_bytes());
        self.used += entry_len;
        Ok(offset)
    }

    /// Name lookup used by write-side B-tree key comparisons.
    pub fn name_at(&self, offset: u64) -> &str {
        let start = offset as usize;
        let end = self.data[start..]
            .iter()
            .position(|b| *b == 0)
            .map(|i| start + i)
            .unwrap_or(self.data.len());
        std::str::from_utf8(&self.data[start..end]).unwrap_or("")
    }

    pub fn encode_header(&self, sizes: Sizes) -> Vec<u8> {
        let mut out = Vec::with_capacity(LOCAL_HEAP_HEADER_SIZE as usize);
        out.extend_from_slice(LOCAL_HEAP_SIGNATURE);
        out.push(0); // version
        out.extend_from_slice(&[0, 0, 0]);
        codec::write_le(&mut out, self.capacity, sizes.length);
        // Free blocks are not chained; the tail is simply unused.
        codec::write_le(&mut out, codec::undefined(sizes.length), sizes.length);
        codec::write_le(&mut out, self.segment_address, sizes.offset);
        out
    }

    pub fn encode_segment(&self) -> &[u8] {
        &self.data
    }
}

// ---------------------------------------------------------------------------
// Global heap
// ---------------------------------------------------------------------------

/// One parsed "GCOL" collection, keyed in the reader's cache by its file
/// offset.
#[derive(Debug)]
pub struct GlobalHeapCollection {
    pub address: u64,
    pub objects: BTreeMap<u16, Vec<u8>>,
}

pub fn read_collection(
    contents: &[u8],
    addr: u64,
    sizes: Sizes,
) -> Result<GlobalHeapCollection> {
    let start = addr as usize;
    if start >= contents.len() {
        return Err(Hdf5Error::TruncatedRead);
    }
    let (_, collection) = collection(&contents[start..], addr, sizes)?;
    Ok(collection)
}

fn collection<'a>(
    input: &'a [u8],
    addr: u64,
    sizes: Sizes,
) -> PResult<'a, GlobalHeapCollection> {
    context("global heap collection", move |input| {
        let (input, _) = tag(GLOBAL_HEAP_SIGNATURE)(input)?;
        let (input, _) = tag([1])(input)?; // version
        let (input, _) = tag([0, 0, 0])(input)?;
        let (after_header, collection_size) = address(sizes.length)(input)?;

        let header_len = 8 + sizes.length as usize;
        let body_len = (collection_size as usize).saturating_sub(header_len);
        let (rest, mut body) = take(body_len)(after_header)?;

        let mut objects = BTreeMap::new();
        while body.len() >= 8 + sizes.length as usize {
            let (next, object_index) = le_u16(body)?;
            let (next, _reference_count) = le_u16(next)?;
            let (next, _) = take(4usize)(next)?;
            let (next, object_size) = address(sizes.length)(next)?;
            if object_index == 0 {
                break;
            }
            let (next, data) = take(object_size as usize)(next)?;
            let padded = pad8(object_size as usize) - object_size as usize;
            let (next, _) = take(padded)(next)?;
            objects.insert(object_index, data.to_vec());
            body = next;
        }

        Ok((rest, GlobalHeapCollection { address: addr, objects }))
    })(input)
}

/// Write-side state for the global heap: the current collection receives
/// new objects until its free space runs out, then another collection is
/// allocated.
#[derive(Debug)]
pub struct GlobalHeapWriter {
    collections: Vec<PendingCollection>,
}

#[derive(Debug)]
struct PendingCollection {
    address: u64,
    size: u64,
    /// Encoded object records, header excluded.
    objects: Vec<u8>,
    next_index: u16,
}

impl PendingCollection {
    fn header_len(sizes: Sizes) -> u64 {
        8 + u64::from(sizes.length)
    }

    fn object_overhead(sizes: Sizes) -> u64 {
        8 + u64::from(sizes.length)
    }

    fn free(&self, sizes: Sizes) -> u64 {
        // Keep room for the terminating index-0 object.
        self.size
            .saturating_sub(Self::header_len(sizes))
            .saturating_sub(self.objects.len() as u64)
            .saturating_sub(Self::object_overhead(sizes))
    }
}

impl GlobalHeapWriter {
    pub fn new() -> Self {
        GlobalHeapWriter {
            collections: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }

    /// Store `bytes` as a fresh heap object. `allocate` is called with the
    /// minimum byte size whenever a new collection must be opened and
    /// returns its (address, size).
    pub fn put<F>(&mut self, bytes: &[u8], sizes: Sizes, allocate: F) -> Result<(u64, u16)>
    where
        F: FnOnce(u64) -> Result<(u64, u64)>,
    {
        let needed =
            PendingCollection::object_overhead(sizes) + pad8(bytes.len()) as u64;
        let need_new = match self.collections.last() {
            Some(current) => current.free(sizes) < needed,
            None => true,
        };
        if need_new {
            let min_size = PendingCollection::header_len(sizes)
                + needed
                + PendingCollection::object_overhead(sizes);
            let (address, size) = allocate(min_size)?;
            log::debug!("new global heap collection at {:#x}, {} bytes", address, size);
            self.collections.push(PendingCollection {
                address,
                size,
                objects: Vec::new(),
                next_index: 1,
            });
        }

        let current = self.collections.last_mut().expect("collection ensured above");
        if current.free(sizes) < needed {
            return Err(Hdf5Error::BufferOverflowOnWrite);
        }
        let index = current.next_index;
        current.next_index = current
            .next_index
            .checked_add(1)
            .ok_or(Hdf5Error::AllocationOverflow)?;
        codec::push_u16(&mut current.objects, index);
        codec::push_u16(&mut current.objects, 1); // reference count
        current.objects.extend_from_slice(&[0; 4]);
        codec::write_le(&mut current.objects, bytes.len() as u64, sizes.length);
        current.objects.extend_from_slice(bytes);
        for _ in bytes.len()..pad8(bytes.len()) {
            current.objects.push(0);
        }
        Ok((current.address, index))
    }

    /// Serialize every pending collection as (address, bytes) pairs.
    pub fn encode_collections(&self, sizes: Sizes) -> Vec<(u64, Vec<u8>)> {
        self.collections
            .iter()
            .map(|collection| {
                let mut out = Vec::with_capacity(collection.size as usize);
                out.extend_from_slice(GLOBAL_HEAP_SIGNATURE);
                out.push(1); // version
                out.extend_from_slice(&[0, 0, 0]);
                codec::write_le(&mut out, collection.size, sizes.length);
                out.extend_from_slice(&collection.objects);
                // Terminator: index 0 object whose size is the free tail.
                let free = collection.size - out.len() as u64;
                codec::push_u16(&mut out, 0);
                codec::push_u16(&mut out, 0);
                out.extend_from_slice(&[0; 4]);
                codec::write_le(
                    &mut out,
                    free,
                    sizes.length,
                );
                out.resize(collection.size as usize, 0);
                (collection.address, out)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIZES: Sizes = Sizes {
        offset: 8,
        length: 8,
    };

    #[test]
    fn local_heap_header_roundtrip() {
        let writer = LocalHeapWriter::new(680, 712, LOCAL_HEAP_INITIAL_SIZE);
        let bytes = writer.encode_header(SIZES);
        assert_eq!(bytes.len() as u64, LOCAL_HEAP_HEADER_SIZE);
        let (_, info) = local_heap(&bytes, SIZES).unwrap();
        assert_eq!(info.data_segment_size, 88);
        assert_eq!(info.address_of_data_segment, 712);
    }

    #[test]
    fn local_heap_insert_and_lookup() {
        let mut writer = LocalHeapWriter::new(680, 712, LOCAL_HEAP_INITIAL_SIZE);
        let a = writer.insert("alpha", |_| panic!("no expand")).unwrap();
        let b = writer.insert("beta", |_| panic!("no expand")).unwrap();
        assert_eq!(a, 8);
        assert_eq!(b, 16);
        assert_eq!(writer.name_at(a), "alpha");
        assert_eq!(writer.name_at(b), "beta");
    }

    #[test]
    fn local_heap_doubles_on_overflow() {
        let mut writer = LocalHeapWriter::new(680, 712, LOCAL_HEAP_INITIAL_SIZE);
        let mut expansions = Vec::new();
        // Entries of 16 bytes each; the sixth would end at 104 > 88.
        for i in 0..6 {
            let name = format!("dataset_{}", i + 1);
            writer
                .insert(&name, |new_size| {
                    expansions.push(new_size);
                    Ok(0x3000)
                })
                .unwrap();
        }
        assert_eq!(expansions, vec![176]);
        assert_eq!(writer.capacity(), 176);
        assert_eq!(writer.segment_address, 0x3000);
        // Old names survive the move.
        assert_eq!(writer.name_at(8), "dataset_1");
    }

    #[test]
    fn global_heap_put_get_roundtrip() {
        let mut writer = GlobalHeapWriter::new();
        let (addr_a, index_a) = writer
            .put(b"hello heap", SIZES, |_| Ok((4096, 4096)))
            .unwrap();
        let (addr_b, index_b) = writer
            .put(b"second object", SIZES, |_| panic!("fits in first"))
            .unwrap();
        assert_eq!(addr_a, 4096);
        assert_eq!(addr_b, 4096);
        assert_eq!((index_a, index_b), (1, 2));

        let encoded = writer.encode_collections(SIZES);
        assert_eq!(encoded.len(), 1);
        let (addr, bytes) = &encoded[0];
        assert_eq!(bytes.len(), 4096);

        let mut image = vec![0u8; *addr as usize];
        image.extend_from_slice(bytes);
        let collection = read_collection(&image, *addr, SIZES).unwrap();
        assert_eq!(collection.objects[&1], b"hello heap".to_vec());
        assert_eq!(collection.objects[&2], b"second object".to_vec());
    }

    #[test]
    fn global_heap_opens_new_collection_when_full() {
        let mut writer = GlobalHeapWriter::new();
        let mut next_addr = 4096u64;
        let payload = vec![0xAB; 2000];
        for _ in 0..3 {
            writer
                .put(&payload, SIZES, |_| {
                    let addr = next_addr;
                    next_addr += 4096;
                    Ok((addr, 4096))
                })
                .unwrap();
        }
        // 2016 bytes per object: two fit in a 4096 collection, the third
        // opens another.
        let encoded = writer.encode_collections(SIZES);
        assert_eq!(encoded.len(), 2);
    }
}
