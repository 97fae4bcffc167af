//! File handles: the read-side object graph and the write-side engine.
//!
//! A read handle memory-maps (or copies) the whole file and parses the
//! group tree eagerly; dataset bytes and global heap collections resolve
//! lazily. A write handle buffers every structure in memory, lays it out
//! through the allocator, and flushes in dependency order on close.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use crate::alloc::{FileAllocator, Prelude, DATASET_HEADER_SLOT};
use crate::btree::{
    collect_entries, GroupDirectory, GroupTreeWriter, SymbolTableEntry, CACHE_TYPE_GROUP,
};
use crate::btree2::{BtreeV2, Record};
use crate::channel::{read_all, ByteChannel};
use crate::codec::{self, Sizes};
use crate::datatype::Datatype;
use crate::error::{Hdf5Error, Result};
use crate::fractal::FractalHeap;
use crate::header::{read_object_header, ObjectHeaderBuilder, V1_PREFIX_SIZE};
use crate::btree;
use crate::heap::{
    local_heap, read_collection, GlobalHeapCollection, GlobalHeapWriter, LocalHeapWriter,
    LOCAL_HEAP_INITIAL_SIZE,
};
use crate::message::{self, Attribute, Dataspace, FillValue, LinkTarget, Message};
use crate::superblock::{RootLocation, Superblock};
use crate::value::{DataCell, DataCursor, HeapSink, HeapSource};

const MAX_GROUP_DEPTH: usize = 64;

// ---------------------------------------------------------------------------
// Read side
// ---------------------------------------------------------------------------

enum Backing {
    Map(memmap::Mmap),
    Mem(Vec<u8>),
}

impl Backing {
    fn bytes(&self) -> &[u8] {
        match self {
            Backing::Map(map) => map,
            Backing::Mem(bytes) => bytes,
        }
    }
}

/// An opened HDF5 file.
pub struct Hdf5File {
    backing: Backing,
    superblock: Superblock,
    root: Group,
    collections: RefCell<HashMap<u64, GlobalHeapCollection>>,
}

impl std::fmt::Debug for Hdf5File {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Hdf5File")
            .field("attributes", &self.root.attributes.keys())
            .field("datasets", &self.root.datasets)
            .field("groups", &self.root.groups)
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct Group {
    attributes: BTreeMap<String, Attribute>,
    datasets: BTreeMap<String, Dataset>,
    groups: BTreeMap<String, Group>,
}

/// A group child: either a sub-group or a dataset.
#[derive(Debug)]
pub enum Child<'a> {
    Group(&'a Group),
    Dataset(&'a Dataset),
}

impl Group {
    pub fn child(&self, name: &str) -> Option<Child> {
        if let Some(dataset) = self.datasets.get(name) {
            return Some(Child::Dataset(dataset));
        }
        self.groups.get(name).map(Child::Group)
    }

    /// Children in link-name order.
    pub fn children(&self) -> impl Iterator<Item = (&str, Child)> {
        let mut names: Vec<&String> =
            self.datasets.keys().chain(self.groups.keys()).collect();
        names.sort();
        names.into_iter().map(move |name| {
            (
                name.as_str(),
                self.child(name).expect("child listed but missing"),
            )
        })
    }

    pub fn datasets(&self) -> &BTreeMap<String, Dataset> {
        &self.datasets
    }

    pub fn groups(&self) -> &BTreeMap<String, Group> {
        &self.groups
    }

    pub fn attributes(&self) -> &BTreeMap<String, Attribute> {
        &self.attributes
    }

    fn find_dataset(&self, dataset_path: &str) -> Option<&Dataset> {
        match dataset_path.find('/') {
            Some(i) => {
                let (first, remaining) = dataset_path.split_at(i);
                if let Some(dataset) = self.datasets.get(first) {
                    Some(dataset)
                } else {
                    self.groups.get(first)?.find_dataset(&remaining[1..])
                }
            }
            None => self.datasets.get(dataset_path),
        }
    }
}

pub struct Dataset {
    pub dimensions: Vec<u64>,
    pub max_dimensions: Option<Vec<u64>>,
    pub datatype: Datatype,
    address: u64,
    size: u64,
    attributes: BTreeMap<String, Attribute>,
}

impl std::fmt::Debug for Dataset {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Dataset")
            .field("dimensions", &self.dimensions)
            .field("datatype", &self.datatype.pretty())
            .field("attributes", &self.attributes.keys())
            .finish()
    }
}

impl Dataset {
    pub fn element_count(&self) -> u64 {
        self.dimensions.iter().product()
    }

    pub fn attributes(&self) -> &BTreeMap<String, Attribute> {
        &self.attributes
    }
}

/// Identifies Rust types this library can view fixed-layout datasets as.
pub trait Hdf5Type: private::Sealed {
    fn matches(datatype: &Datatype) -> bool;
}

mod private {
    pub trait Sealed {}
    impl Sealed for f64 {}
    impl Sealed for f32 {}
    impl Sealed for i64 {}
    impl Sealed for i32 {}
}

macro_rules! hdf5_int_type {
    ($ty:ty, $size:expr) => {
        impl Hdf5Type for $ty {
            fn matches(datatype: &Datatype) -> bool {
                match datatype {
                    Datatype::FixedPoint(t) => {
                        t.signed
                            && t.size == $size
                            && t.order == codec::ByteOrder::Little
                    }
                    _ => false,
                }
            }
        }
    };
}

hdf5_int_type!(i64, 8);
hdf5_int_type!(i32, 4);

impl Hdf5Type for f64 {
    fn matches(datatype: &Datatype) -> bool {
        matches!(datatype, Datatype::FloatingPoint(t) if t.size == 8)
    }
}

impl Hdf5Type for f32 {
    fn matches(datatype: &Datatype) -> bool {
        matches!(datatype, Datatype::FloatingPoint(t) if t.size == 4)
    }
}

/// Resolves global heap references against the file's collection cache.
pub struct FileHeap<'a> {
    file: &'a Hdf5File,
}

impl<'a> HeapSource for FileHeap<'a> {
    fn object(&mut self, address: u64, index: u16) -> Result<Vec<u8>> {
        let mut cache = self.file.collections.borrow_mut();
        if !cache.contains_key(&address) {
            let collection =
                read_collection(self.file.backing.bytes(), address, self.file.sizes())?;
            cache.insert(address, collection);
        }
        cache[&address]
            .objects
            .get(&index)
            .cloned()
            .ok_or(Hdf5Error::HeapIdOutOfRange)
    }
}

impl Hdf5File {
    /// Open and memory-map a file from the filesystem.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let contents = unsafe { memmap::Mmap::map(&file)? };
        Hdf5File::from_backing(Backing::Map(contents))
    }

    /// Open from any seekable channel; the contents are drained into
    /// memory.
    pub fn open_for_read(channel: &mut dyn ByteChannel) -> Result<Self> {
        let contents = read_all(channel)?;
        Hdf5File::from_backing(Backing::Mem(contents))
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        Hdf5File::from_backing(Backing::Mem(bytes))
    }

    fn from_backing(backing: Backing) -> Result<Self> {
        let contents = backing.bytes();
        let superblock = Superblock::read(contents)?;
        let sizes = superblock.sizes();

        let root = match &superblock.root {
            RootLocation::Entry(entry) if entry.cache_type == CACHE_TYPE_GROUP => {
                let mut group = parse_old_group(
                    contents,
                    entry.address_of_btree,
                    entry.address_of_name_heap,
                    sizes,
                    0,
                )?;
                if !codec::is_undefined(entry.object_header_address, sizes.offset) {
                    group.attributes =
                        read_group_attributes(contents, entry.object_header_address, sizes)?;
                }
                group
            }
            root => {
                let addr = match root {
                    RootLocation::Entry(entry) => entry.object_header_address,
                    RootLocation::HeaderAddress(addr) => *addr,
                };
                parse_group_from_header(contents, addr, sizes, 0)?
            }
        };

        Ok(Hdf5File {
            backing,
            superblock,
            root,
            collections: RefCell::new(HashMap::new()),
        })
    }

    pub fn sizes(&self) -> Sizes {
        self.superblock.sizes()
    }

    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    pub fn root_group(&self) -> &Group {
        &self.root
    }

    /// Look up a dataset by slash-separated path.
    pub fn dataset(&self, path: &str) -> Result<&Dataset> {
        self.root
            .find_dataset(path)
            .ok_or_else(|| Hdf5Error::TypeMismatch(format!("no dataset at path {:?}", path)))
    }

    /// Decode every cell of a dataset in row-major order.
    pub fn cells(&self, dataset: &Dataset) -> Result<Vec<DataCell>> {
        self.cursor(dataset)?.collect()
    }

    /// Iterate a dataset's cells without materializing them all.
    pub fn cursor<'f>(&'f self, dataset: &'f Dataset) -> Result<DataCursor<'f, FileHeap<'f>>> {
        let bytes = self.raw_data(dataset)?;
        Ok(DataCursor::new(
            bytes,
            &dataset.datatype,
            dataset.element_count() as usize,
            FileHeap { file: self },
        ))
    }

    /// The dataset's contiguous raw bytes.
    pub fn raw_data(&self, dataset: &Dataset) -> Result<&[u8]> {
        let contents = self.backing.bytes();
        if codec::is_undefined(dataset.address, self.superblock.offset_size) {
            return Ok(&contents[0..0]);
        }
        let start = dataset.address as usize;
        let end = start + dataset.size as usize;
        if end > contents.len() {
            return Err(Hdf5Error::TruncatedRead);
        }
        Ok(&contents[start..end])
    }

    /// Zero-copy view of a fixed-layout dataset as a host slice.
    ///
    /// Fails with `TypeMismatch` when the stored datatype does not match
    /// `T`, and with `Parse` when the raw bytes are misaligned for `T`.
    pub fn view<T: Hdf5Type>(&self, path: &str) -> Result<&[T]> {
        let dataset = self.dataset(path)?;
        if !T::matches(&dataset.datatype) {
            return Err(Hdf5Error::TypeMismatch(format!(
                "dataset {:?} holds {}",
                path,
                dataset.datatype.pretty()
            )));
        }
        let bytes = self.raw_data(dataset)?;
        if bytes.as_ptr() as usize % std::mem::align_of::<T>() != 0 {
            return Err(Hdf5Error::Parse(format!(
                "dataset {:?} is misaligned for the requested view",
                path
            )));
        }
        Ok(unsafe {
            std::slice::from_raw_parts(
                bytes.as_ptr() as *const T,
                bytes.len() / std::mem::size_of::<T>(),
            )
        })
    }

    /// Decode an attribute's cells.
    pub fn attribute_cells(&self, attribute: &Attribute) -> Result<Vec<DataCell>> {
        let count = attribute.dataspace.element_count() as usize;
        DataCursor::new(
            &attribute.data,
            &attribute.datatype,
            count,
            FileHeap { file: self },
        )
        .collect()
    }
}

fn read_group_attributes(
    contents: &[u8],
    header_addr: u64,
    sizes: Sizes,
) -> Result<BTreeMap<String, Attribute>> {
    let header = read_object_header(contents, header_addr, sizes)?;
    let mut attributes = BTreeMap::new();
    for message in header.messages {
        if let Message::Attribute(attribute) = message.body {
            attributes.insert(attribute.name.clone(), attribute);
        }
    }
    Ok(attributes)
}

/// Parse an old-style group from its B-tree and local heap addresses.
fn parse_old_group(
    contents: &[u8],
    btree_addr: u64,
    heap_addr: u64,
    sizes: Sizes,
    depth: usize,
) -> Result<Group> {
    if depth > MAX_GROUP_DEPTH {
        return Err(Hdf5Error::Parse("group nesting too deep".to_string()));
    }
    let heap_start = heap_addr as usize;
    if heap_start >= contents.len() {
        return Err(Hdf5Error::TruncatedRead);
    }
    let (_, heap_info) = local_heap(&contents[heap_start..], sizes)?;

    let mut group = Group::default();
    for (name, entry) in collect_entries(contents, btree_addr, &heap_info, sizes)? {
        attach_child(contents, &mut group, &name, &entry, sizes, depth)?;
    }
    Ok(group)
}

fn attach_child(
    contents: &[u8],
    group: &mut Group,
    name: &str,
    entry: &SymbolTableEntry,
    sizes: Sizes,
    depth: usize,
) -> Result<()> {
    if entry.cache_type == CACHE_TYPE_GROUP
        && !codec::is_undefined(entry.address_of_btree, sizes.offset)
    {
        // The scratch pad spares one header read for the tree addresses;
        // the header itself still carries the attributes.
        let mut child =
            parse_old_group(contents, entry.address_of_btree, entry.address_of_name_heap, sizes, depth + 1)?;
        if !codec::is_undefined(entry.object_header_address, sizes.offset) {
            child.attributes =
                read_group_attributes(contents, entry.object_header_address, sizes)?;
        }
        group.groups.insert(name.to_string(), child);
        return Ok(());
    }

    match classify_object(contents, entry.object_header_address, sizes, depth)? {
        Object::Dataset(dataset) => {
            group.datasets.insert(name.to_string(), dataset);
        }
        Object::Group(child) => {
            group.groups.insert(name.to_string(), child);
        }
    }
    Ok(())
}

enum Object {
    Dataset(Dataset),
    Group(Group),
}

/// Read an object header and decide what kind of object it describes, the
/// way the message set dictates: a SymbolTable or LinkInfo message makes a
/// group, a DataLayout/Datatype/Dataspace trio makes a dataset.
fn classify_object(
    contents: &[u8],
    header_addr: u64,
    sizes: Sizes,
    depth: usize,
) -> Result<Object> {
    if depth > MAX_GROUP_DEPTH {
        return Err(Hdf5Error::Parse("group nesting too deep".to_string()));
    }
    let header = read_object_header(contents, header_addr, sizes)?;

    let mut layout = None;
    let mut dtype = None;
    let mut dspace = None;
    let mut symbol_table = None;
    let mut link_info = None;
    let mut attributes = BTreeMap::new();

    for message in header.messages {
        match message.body {
            Message::DataLayout(m) => layout = Some(m),
            Message::Datatype(m) => dtype = Some(m),
            Message::Dataspace(m) => dspace = Some(m),
            Message::SymbolTable(m) => symbol_table = Some(m),
            Message::LinkInfo(m) => link_info = Some(m),
            Message::Attribute(m) => {
                attributes.insert(m.name.clone(), m);
            }
            _ => {}
        }
    }

    if let Some(symbol_table) = symbol_table {
        let mut group = parse_old_group(
            contents,
            symbol_table.btree_address,
            symbol_table.local_heap_address,
            sizes,
            depth + 1,
        )?;
        group.attributes = attributes;
        return Ok(Object::Group(group));
    }
    if let Some(link_info) = link_info {
        let mut group = parse_new_group(contents, &link_info, sizes, depth + 1)?;
        group.attributes = attributes;
        return Ok(Object::Group(group));
    }

    match (dtype, dspace) {
        (Some(datatype), Some(dataspace)) => {
            let (address, size) = match layout {
                Some(layout) => (layout.address, layout.size),
                None => (codec::undefined(sizes.offset), 0),
            };
            Ok(Object::Dataset(Dataset {
                dimensions: dataspace.dimensions,
                max_dimensions: dataspace.max_dimensions,
                datatype,
                address,
                size,
                attributes,
            }))
        }
        _ => Err(Hdf5Error::Parse(
            "object header is neither a group nor a dataset".to_string(),
        )),
    }
}

fn parse_group_from_header(
    contents: &[u8],
    header_addr: u64,
    sizes: Sizes,
    depth: usize,
) -> Result<Group> {
    match classify_object(contents, header_addr, sizes, depth)? {
        Object::Group(group) => Ok(group),
        Object::Dataset(_) => Err(Hdf5Error::Parse(
            "expected a group object header".to_string(),
        )),
    }
}

/// New-style group: link records live in a fractal heap, indexed by a v2
/// B-tree on name hash. Read-only.
fn parse_new_group(
    contents: &[u8],
    link_info: &message::LinkInfo,
    sizes: Sizes,
    depth: usize,
) -> Result<Group> {
    let mut group = Group::default();
    if codec::is_undefined(link_info.fractal_heap_address, sizes.offset) {
        return Ok(group);
    }
    let fractal = FractalHeap::read(contents, link_info.fractal_heap_address, sizes)?;

    let mut links = Vec::new();
    if !codec::is_undefined(link_info.name_index_btree_address, sizes.offset) {
        let btree = BtreeV2::read(contents, link_info.name_index_btree_address, sizes)?;
        for record in btree.records(contents)? {
            if let Record::LinkName { heap_id, .. } = record {
                let id = fractal.parse_heap_id(&heap_id)?;
                let raw = fractal.object(contents, &id)?;
                let (_, link) = message::link(raw, sizes)?;
                links.push(link);
            }
        }
    }

    for link in links {
        match link.target {
            LinkTarget::Hard(addr) => {
                match classify_object(contents, addr, sizes, depth)? {
                    Object::Dataset(dataset) => {
                        group.datasets.insert(link.name, dataset);
                    }
                    Object::Group(child) => {
                        group.groups.insert(link.name, child);
                    }
                }
            }
            LinkTarget::Soft(_) => {
                // Soft links need a path resolver; skipped on enumeration.
                log::debug!("skipping soft link {:?}", link.name);
            }
        }
    }
    Ok(group)
}

// ---------------------------------------------------------------------------
// Write side
// ---------------------------------------------------------------------------

/// Options for `create`.
#[derive(Debug, Clone, Copy)]
pub struct CreateOptions {
    pub offset_size: u8,
    pub length_size: u8,
    pub group_leaf_k: u16,
    pub group_internal_k: u16,
}

impl Default for CreateOptions {
    fn default() -> Self {
        CreateOptions {
            offset_size: 8,
            length_size: 8,
            group_leaf_k: 4,
            group_internal_k: 16,
        }
    }
}

/// Handle to one dataset being written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatasetId(usize);

struct PendingDataset {
    name: String,
    datatype: Datatype,
    dataspace: Dataspace,
    header_address: u64,
    header_capacity: u64,
    data: Option<(u64, Vec<u8>)>,
    attributes: Vec<Attribute>,
}

/// A file being written. Structures accumulate in memory and reach the
/// channel only on flush; a failed write poisons the handle.
pub struct Hdf5Writer<C: ByteChannel> {
    channel: C,
    sizes: Sizes,
    superblock: Superblock,
    allocator: FileAllocator,
    prelude: Prelude,
    tree: GroupTreeWriter,
    directory: GroupDirectory,
    name_heap: LocalHeapWriter,
    global_heap: GlobalHeapWriter,
    datasets: Vec<PendingDataset>,
    poisoned: bool,
    closed: bool,
}

/// Create a new file on `channel` and return its write handle.
pub fn create<C: ByteChannel>(channel: C, options: CreateOptions) -> Result<Hdf5Writer<C>> {
    if options.offset_size != 4 && options.offset_size != 8 {
        return Err(Hdf5Error::UnsupportedVersion(options.offset_size));
    }
    if options.length_size != 4 && options.length_size != 8 {
        return Err(Hdf5Error::UnsupportedVersion(options.length_size));
    }
    let sizes = Sizes::new(options.offset_size, options.length_size);
    let superblock = Superblock::for_write(
        options.offset_size,
        options.length_size,
        options.group_leaf_k,
        options.group_internal_k,
    );
    let superblock_size = superblock.encode()?.len() as u64;
    let node_size = btree::node_size(sizes, options.group_internal_k);
    let (allocator, prelude) = FileAllocator::new(sizes, superblock_size, node_size);
    log::debug!(
        "creating file: offset size {}, length size {}, K = ({}, {})",
        options.offset_size,
        options.length_size,
        options.group_leaf_k,
        options.group_internal_k
    );

    Ok(Hdf5Writer {
        channel,
        sizes,
        superblock,
        tree: GroupTreeWriter::new(
            prelude.root_btree,
            options.group_leaf_k,
            options.group_internal_k,
        ),
        directory: GroupDirectory::new(),
        name_heap: LocalHeapWriter::new(
            prelude.root_heap_header,
            prelude.root_heap_contents,
            LOCAL_HEAP_INITIAL_SIZE,
        ),
        global_heap: GlobalHeapWriter::new(),
        allocator,
        prelude,
        datasets: Vec::new(),
        poisoned: false,
        closed: false,
    })
}

/// Adapter giving datatype encoders access to the writer's global heap.
struct WriterHeap<'a> {
    global_heap: &'a mut GlobalHeapWriter,
    allocator: &'a mut FileAllocator,
    sizes: Sizes,
}

impl<'a> HeapSink for WriterHeap<'a> {
    fn put_object(&mut self, bytes: &[u8]) -> Result<(u64, u16)> {
        let allocator = &mut *self.allocator;
        self.global_heap
            .put(bytes, self.sizes, |min| allocator.allocate_global_heap(min))
    }
}

impl<C: ByteChannel> Hdf5Writer<C> {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Hdf5Error::CacheMissOnClosedHandle);
        }
        if self.poisoned {
            return Err(Hdf5Error::HandlePoisoned);
        }
        Ok(())
    }

    fn poison_on_err<T>(&mut self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            self.poisoned = true;
        }
        result
    }

    pub fn sizes(&self) -> Sizes {
        self.sizes
    }

    /// Create a contiguous dataset in the root group.
    pub fn create_dataset(
        &mut self,
        name: &str,
        datatype: Datatype,
        dataspace: Dataspace,
    ) -> Result<DatasetId> {
        self.ensure_open()?;
        if self.directory.contains(name) {
            return Err(Hdf5Error::TypeMismatch(format!(
                "dataset {:?} already exists",
                name
            )));
        }
        let result = self.create_dataset_inner(name, datatype, dataspace);
        self.poison_on_err(result)
    }

    fn create_dataset_inner(
        &mut self,
        name: &str,
        datatype: Datatype,
        dataspace: Dataspace,
    ) -> Result<DatasetId> {
        let header_address = self.allocator.allocate_dataset_object_header(name)?;

        let allocator = &mut self.allocator;
        let name_offset = self
            .name_heap
            .insert(name, |new_size| {
                allocator.expand_local_heap_contents("/", new_size)
            })?;

        let snod_size = btree::snod_size(self.sizes, self.superblock.group_leaf_node_k);
        let allocator = &mut self.allocator;
        self.directory.insert(
            &self.tree,
            name,
            SymbolTableEntry::object(name_offset, header_address),
            || allocator.allocate_snod(snod_size),
        )?;

        self.datasets.push(PendingDataset {
            name: name.to_string(),
            datatype,
            dataspace,
            header_address,
            header_capacity: DATASET_HEADER_SLOT,
            data: None,
            attributes: Vec::new(),
        });
        Ok(DatasetId(self.datasets.len() - 1))
    }

    /// Write the dataset's entire raw contents from one buffer.
    pub fn write_all(&mut self, id: DatasetId, bytes: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let result = self.write_all_inner(id, bytes.to_vec());
        self.poison_on_err(result)
    }

    /// Write the dataset from a supplier of consecutive buffers.
    pub fn write_each<I>(&mut self, id: DatasetId, buffers: I) -> Result<()>
    where
        I: IntoIterator<Item = Vec<u8>>,
    {
        self.ensure_open()?;
        let mut bytes = Vec::new();
        for buffer in buffers {
            bytes.extend_from_slice(&buffer);
        }
        let result = self.write_all_inner(id, bytes);
        self.poison_on_err(result)
    }

    fn write_all_inner(&mut self, id: DatasetId, bytes: Vec<u8>) -> Result<()> {
        let dataset = self
            .datasets
            .get_mut(id.0)
            .ok_or_else(|| Hdf5Error::TypeMismatch("unknown dataset id".to_string()))?;
        if dataset.data.is_some() {
            return Err(Hdf5Error::TypeMismatch(format!(
                "dataset {:?} already written",
                dataset.name
            )));
        }
        let address = self
            .allocator
            .allocate_data_block(&dataset.name, bytes.len() as u64)?;
        dataset.data = Some((address, bytes));
        Ok(())
    }

    /// Encode typed cells through the datatype registry (variable-length
    /// members land in the global heap) and write the result.
    pub fn write_cells(&mut self, id: DatasetId, cells: &[DataCell]) -> Result<()> {
        self.ensure_open()?;
        let result = self.write_cells_inner(id, cells);
        self.poison_on_err(result)
    }

    fn write_cells_inner(&mut self, id: DatasetId, cells: &[DataCell]) -> Result<()> {
        let datatype = self
            .datasets
            .get(id.0)
            .ok_or_else(|| Hdf5Error::TypeMismatch("unknown dataset id".to_string()))?
            .datatype
            .clone();
        let mut bytes = Vec::with_capacity(cells.len() * datatype.size() as usize);
        {
            let mut heap = WriterHeap {
                global_heap: &mut self.global_heap,
                allocator: &mut self.allocator,
                sizes: self.sizes,
            };
            for cell in cells {
                bytes.extend_from_slice(&datatype.encode_cell(cell, &mut heap)?);
            }
        }
        self.write_all_inner(id, bytes)
    }

    /// Store a raw variable-length payload, returning the (collection
    /// address, index) pair to embed in attribute or dataset cells.
    pub fn put_vlen(&mut self, bytes: &[u8]) -> Result<(u64, u16)> {
        self.ensure_open()?;
        let sizes = self.sizes;
        let global_heap = &mut self.global_heap;
        let allocator = &mut self.allocator;
        let result = global_heap.put(bytes, sizes, |min| allocator.allocate_global_heap(min));
        self.poison_on_err(result)
    }

    /// Attach an attribute to a dataset. The value is the attribute's raw
    /// cell bytes. Headers grow (relocating if pinned) to fit.
    pub fn create_attribute(
        &mut self,
        id: DatasetId,
        name: &str,
        datatype: Datatype,
        dataspace: Dataspace,
        value: &[u8],
    ) -> Result<()> {
        self.ensure_open()?;
        let result = self.create_attribute_inner(id, name, datatype, dataspace, value);
        self.poison_on_err(result)
    }

    fn create_attribute_inner(
        &mut self,
        id: DatasetId,
        name: &str,
        datatype: Datatype,
        dataspace: Dataspace,
        value: &[u8],
    ) -> Result<()> {
        let sizes = self.sizes;
        let dataset = self
            .datasets
            .get_mut(id.0)
            .ok_or_else(|| Hdf5Error::TypeMismatch("unknown dataset id".to_string()))?;
        dataset.attributes.push(Attribute {
            name: name.to_string(),
            datatype,
            dataspace,
            data: value.to_vec(),
        });

        // Grow the header slot ahead of serialization when the message list
        // clearly outgrew it; overflow still lands in a continuation.
        let builder = build_dataset_header(dataset, sizes);
        let needed = V1_PREFIX_SIZE as u64 + builder.total_framed_size(sizes) as u64;
        if needed > dataset.header_capacity {
            let granted = self
                .allocator
                .increase_header_allocation(&dataset.name, needed)?;
            if granted != dataset.header_address {
                dataset.header_address = granted;
                self.directory.set_header_address(&dataset.name, granted);
            }
            dataset.header_capacity = self
                .allocator
                .header_capacity(&dataset.name)
                .unwrap_or(dataset.header_capacity);
        }
        Ok(())
    }

    /// Serialize all pending metadata and flush it through the channel. The
    /// handle refuses further mutation afterwards.
    pub fn flush(&mut self) -> Result<()> {
        self.ensure_open()?;
        let result = self.flush_inner();
        self.closed = true;
        self.poison_on_err(result)
    }

    /// Flush and hand the channel back.
    pub fn close(mut self) -> Result<C> {
        self.flush()?;
        Ok(self.channel)
    }

    fn flush_inner(&mut self) -> Result<()> {
        let sizes = self.sizes;
        let mut blocks: Vec<(u64, Vec<u8>)> = Vec::new();

        // Dataset headers first: continuation allocation must finish before
        // end-of-file is final.
        for dataset in &self.datasets {
            let builder = build_dataset_header(dataset, sizes);
            let allocator = &mut self.allocator;
            let name = dataset.name.clone();
            let serialized = builder.serialize(
                sizes,
                dataset.header_capacity as usize,
                |size| allocator.allocate_continuation(&name, size),
            )?;
            blocks.push((dataset.header_address, serialized.prefix_block));
            if let Some((addr, bytes)) = serialized.continuation {
                blocks.push((addr, bytes));
            }
            if let Some((addr, bytes)) = &dataset.data {
                blocks.push((*addr, bytes.clone()));
            }
        }

        // Root group: object header, B-tree nodes, SNODs, name heap.
        let mut root_builder = ObjectHeaderBuilder::new();
        root_builder.push(Message::SymbolTable(message::SymbolTableMessage {
            btree_address: self.prelude.root_btree,
            local_heap_address: self.prelude.root_heap_header,
        }));
        let root_header = root_builder.serialize(
            sizes,
            self.prelude.root_header_size as usize,
            |_| Err(Hdf5Error::BufferOverflowOnWrite),
        )?;
        blocks.push((self.prelude.root_header, root_header.prefix_block));

        let node_size = btree::node_size(sizes, self.superblock.group_internal_node_k);
        let allocator = &mut self.allocator;
        let tree_blocks = self.directory.serialize(&self.tree, sizes, || {
            allocator.allocate_btree_node(node_size)
        })?;
        blocks.extend(tree_blocks);

        blocks.push((self.name_heap.header_address, self.name_heap.encode_header(sizes)));
        blocks.push((
            self.name_heap.segment_address,
            self.name_heap.encode_segment().to_vec(),
        ));

        blocks.extend(self.global_heap.encode_collections(sizes));

        // Superblock last: its end-of-file field is now final.
        self.superblock.end_of_file_address = self.allocator.end_of_file();
        self.superblock.root = RootLocation::Entry(SymbolTableEntry {
            link_name_offset: 0,
            object_header_address: self.prelude.root_header,
            cache_type: CACHE_TYPE_GROUP,
            address_of_btree: self.prelude.root_btree,
            address_of_name_heap: self.prelude.root_heap_header,
        });
        blocks.push((self.prelude.superblock, self.superblock.encode()?));

        self.allocator.verify_disjoint()?;

        for (addr, bytes) in &blocks {
            self.channel.write_at(*addr, bytes)?;
        }
        // Pad the channel out to the declared end-of-file.
        let eof = self.allocator.end_of_file();
        if self.channel.size()? < eof {
            self.channel.write_at(eof - 1, &[0])?;
        }
        log::debug!(
            "flushed {} blocks, end of file {}",
            blocks.len(),
            eof
        );
        Ok(())
    }

    pub fn allocator(&self) -> &FileAllocator {
        &self.allocator
    }

    pub fn local_heap_capacity(&self) -> u64 {
        self.name_heap.capacity()
    }

    pub fn snod_count(&self) -> usize {
        self.directory.snod_count()
    }
}

fn build_dataset_header(dataset: &PendingDataset, sizes: Sizes) -> ObjectHeaderBuilder {
    let mut builder = ObjectHeaderBuilder::new();
    builder.push(Message::Datatype(dataset.datatype.clone()));
    builder.push(Message::Dataspace(dataset.dataspace.clone()));
    builder.push(Message::FillValue(FillValue::unset()));
    let (address, size) = match &dataset.data {
        Some((address, bytes)) => (*address, bytes.len() as u64),
        None => (codec::undefined(sizes.offset), 0),
    };
    builder.push(Message::DataLayout(message::DataLayout { address, size }));
    for attribute in &dataset.attributes {
        builder.push(Message::Attribute(attribute.clone()));
    }
    builder
}
