//! The object-header message framework.
//!
//! An object header is a linear list of typed messages. Version 1 headers
//! start with a 16-byte prefix and frame every message as (2-byte type,
//! 2-byte data size, 1-byte flags, 3 reserved bytes, data padded to 8).
//! A continuation message names another contiguous region whose bytes
//! extend the list; fragments chain linearly.
//!
//! Unknown message types are preserved as opaque byte runs and re-emitted
//! on write, unless the fail-on-unknown flag bit is set on the message.

use nom::bytes::streaming::take;
use nom::error::context;
use nom::multi::count as nom_count;
use nom::number::streaming::{le_u16, le_u32, le_u64, le_u8};

use crate::codec::{self, Sizes};
use crate::datatype::{self, Datatype};
use crate::parse_util::{address, cstr, failure, pad8, PResult};

pub const MTYPE_NIL: u16 = 0x00;
pub const MTYPE_DATASPACE: u16 = 0x01;
pub const MTYPE_LINK_INFO: u16 = 0x02;
pub const MTYPE_DATATYPE: u16 = 0x03;
pub const MTYPE_FILL_VALUE_OLD: u16 = 0x04;
pub const MTYPE_FILL_VALUE: u16 = 0x05;
pub const MTYPE_LINK: u16 = 0x06;
pub const MTYPE_DATA_LAYOUT: u16 = 0x08;
pub const MTYPE_GROUP_INFO: u16 = 0x0A;
pub const MTYPE_FILTER_PIPELINE: u16 = 0x0B;
pub const MTYPE_ATTRIBUTE: u16 = 0x0C;
pub const MTYPE_MODIFICATION_TIME_OLD: u16 = 0x0E;
pub const MTYPE_CONTINUATION: u16 = 0x10;
pub const MTYPE_SYMBOL_TABLE: u16 = 0x11;
pub const MTYPE_MODIFICATION_TIME: u16 = 0x12;
pub const MTYPE_ATTRIBUTE_INFO: u16 = 0x15;
pub const MTYPE_REFERENCE_COUNT: u16 = 0x16;

/// Message flag bit: fail instead of preserving when the type is unknown.
pub const FLAG_FAIL_ON_UNKNOWN: u8 = 0x08;

#[derive(Debug, Clone)]
pub struct HeaderMessage {
    pub flags: u8,
    pub body: Message,
}

impl HeaderMessage {
    pub fn new(body: Message) -> Self {
        HeaderMessage { flags: 0, body }
    }
}

#[derive(Debug, Clone)]
pub enum Message {
    Nil(usize),
    Dataspace(Dataspace),
    LinkInfo(LinkInfo),
    Datatype(Datatype),
    FillValueOld(FillValueOld),
    FillValue(FillValue),
    Link(Link),
    DataLayout(DataLayout),
    GroupInfo(GroupInfo),
    FilterPipeline(FilterPipeline),
    Attribute(Attribute),
    ModificationTimeOld(Vec<u8>),
    ObjectHeaderContinuation(ObjectHeaderContinuation),
    SymbolTable(SymbolTableMessage),
    ObjectModificationTime(ObjectModificationTime),
    AttributeInfo(AttributeInfo),
    ObjectReferenceCount(ObjectReferenceCount),
    Unknown { message_type: u16, bytes: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dataspace {
    pub dimensions: Vec<u64>,
    pub max_dimensions: Option<Vec<u64>>,
}

impl Dataspace {
    pub fn scalar() -> Self {
        Dataspace {
            dimensions: vec![1],
            max_dimensions: None,
        }
    }

    pub fn simple(dimensions: Vec<u64>) -> Self {
        Dataspace {
            dimensions,
            max_dimensions: None,
        }
    }

    pub fn element_count(&self) -> u64 {
        self.dimensions.iter().product()
    }

    pub fn rank(&self) -> usize {
        self.dimensions.len()
    }
}

#[derive(Debug, Clone)]
pub struct LinkInfo {
    pub max_creation_index: Option<u64>,
    pub fractal_heap_address: u64,
    pub name_index_btree_address: u64,
    pub creation_order_btree_address: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct FillValueOld {
    pub fill: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct FillValue {
    pub space_allocation_time: u8,
    pub fill_value_write_time: u8,
    pub fill: Option<Vec<u8>>,
}

impl FillValue {
    /// The default for newly created datasets: late allocation, undefined
    /// fill.
    pub fn unset() -> Self {
        FillValue {
            space_allocation_time: 2,
            fill_value_write_time: 0,
            fill: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Link {
    pub name: String,
    pub creation_order: Option<u64>,
    pub target: LinkTarget,
}

#[derive(Debug, Clone)]
pub enum LinkTarget {
    Hard(u64),
    Soft(String),
}

/// Contiguous data layout: raw data address plus total byte size.
#[derive(Debug, Clone)]
pub struct DataLayout {
    pub address: u64,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct GroupInfo {
    pub flags: u8,
    pub link_phase_change: Option<(u16, u16)>,
    pub estimates: Option<(u16, u16)>,
}

#[derive(Debug, Clone)]
pub struct FilterPipeline {
    pub filters: Vec<FilterDescriptor>,
}

/// One stage of the I/O filter pipeline. The descriptor is parsed; applying
/// the filter is a collaborator plug-in.
#[derive(Debug, Clone)]
pub struct FilterDescriptor {
    pub id: u16,
    pub name: String,
    pub flags: u16,
    pub client_data: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct Attribute {
    pub name: String,
    pub datatype: Datatype,
    pub dataspace: Dataspace,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectHeaderContinuation {
    pub offset: u64,
    pub length: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SymbolTableMessage {
    pub btree_address: u64,
    pub local_heap_address: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectModificationTime {
    pub seconds_after_unix_epoch: u32,
}

#[derive(Debug, Clone)]
pub struct AttributeInfo {
    pub max_creation_index: Option<u16>,
    pub fractal_heap_address: u64,
    pub name_btree_address: u64,
    pub order_btree_address: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectReferenceCount {
    pub count: u32,
}

// ---------------------------------------------------------------------------
// Parse
// ---------------------------------------------------------------------------

pub fn dataspace(input: &[u8], sizes: Sizes) -> PResult<Dataspace> {
    context("dataspace", move |input| {
        let (input, version) = le_u8(input)?;
        let (input, dimensionality) = le_u8(input)?;
        let (input, flags) = le_u8(input)?;
        let input = match version {
            1 => {
                // One reserved byte, then four more.
                let (input, _) = take(5usize)(input)?;
                input
            }
            2 => {
                let (input, _space_type) = le_u8(input)?;
                input
            }
            _ => return Err(failure(input, "unsupported dataspace version")),
        };
        let dim = address(sizes.length);
        let (input, dimensions) = nom_count(dim, dimensionality as usize)(input)?;
        let (input, max_dimensions) = if flags & 1 == 1 {
            let dim = address(sizes.length);
            let (input, max) = nom_count(dim, dimensionality as usize)(input)?;
            (input, Some(max))
        } else {
            (input, None)
        };
        // Permutation indices (flag bit 1) predate the format spec we
        // target and never appear in practice.
        Ok((
            input,
            Dataspace {
                dimensions,
                max_dimensions,
            },
        ))
    })(input)
}

fn link_info(input: &[u8], sizes: Sizes) -> PResult<LinkInfo> {
    context("link info", move |input| {
        let (input, _version) = le_u8(input)?;
        let (input, flags) = le_u8(input)?;
        let (input, max_creation_index) = if flags & 1 == 1 {
            let (input, v) = le_u64(input)?;
            (input, Some(v))
        } else {
            (input, None)
        };
        let (input, fractal_heap_address) = address(sizes.offset)(input)?;
        let (input, name_index_btree_address) = address(sizes.offset)(input)?;
        let (input, creation_order_btree_address) = if flags & 2 == 2 {
            let (input, v) = address(sizes.offset)(input)?;
            (input, Some(v))
        } else {
            (input, None)
        };
        Ok((
            input,
            LinkInfo {
                max_creation_index,
                fractal_heap_address,
                name_index_btree_address,
                creation_order_btree_address,
            },
        ))
    })(input)
}

fn fill_value_old(input: &[u8]) -> PResult<FillValueOld> {
    context("old fill value", |input| {
        let (input, size) = le_u32(input)?;
        let (input, fill) = take(size as usize)(input)?;
        Ok((
            input,
            FillValueOld {
                fill: fill.to_vec(),
            },
        ))
    })(input)
}

pub fn fill_value(input: &[u8]) -> PResult<FillValue> {
    context("fill value", |input| {
        let (input, version) = le_u8(input)?;
        match version {
            1 => {
                let (input, space_allocation_time) = le_u8(input)?;
                let (input, fill_value_write_time) = le_u8(input)?;
                let (input, size) = le_u32(input)?;
                let (input, fill) = take(size as usize)(input)?;
                Ok((
                    input,
                    FillValue {
                        space_allocation_time,
                        fill_value_write_time,
                        fill: Some(fill.to_vec()),
                    },
                ))
            }
            2 => {
                let (input, space_allocation_time) = le_u8(input)?;
                let (input, fill_value_write_time) = le_u8(input)?;
                let (input, fill_value_defined) = le_u8(input)?;
                if fill_value_defined == 0 {
                    return Ok((
                        input,
                        FillValue {
                            space_allocation_time,
                            fill_value_write_time,
                            fill: None,
                        },
                    ));
                }
                let (input, size) = le_u32(input)?;
                let (input, fill) = take(size as usize)(input)?;
                Ok((
                    input,
                    FillValue {
                        space_allocation_time,
                        fill_value_write_time,
                        fill: Some(fill.to_vec()),
                    },
                ))
            }
            3 => {
                let (input, flags) = le_u8(input)?;
                if flags & 0x20 == 0 {
                    return Ok((
                        input,
                        FillValue {
                            space_allocation_time: flags & 0x3,
                            fill_value_write_time: flags >> 2 & 0x3,
                            fill: None,
                        },
                    ));
                }
                let (input, size) = le_u32(input)?;
                let (input, fill) = take(size as usize)(input)?;
                Ok((
                    input,
                    FillValue {
                        space_allocation_time: flags & 0x3,
                        fill_value_write_time: flags >> 2 & 0x3,
                        fill: Some(fill.to_vec()),
                    },
                ))
            }
            _ => Err(failure(input, "unsupported fill value version")),
        }
    })(input)
}

pub(crate) fn link(input: &[u8], sizes: Sizes) -> PResult<Link> {
    context("link", move |input| {
        let (input, version) = le_u8(input)?;
        if version != 1 {
            return Err(failure(input, "unsupported link version"));
        }
        let (input, flags) = le_u8(input)?;
        let (input, link_type) = if flags & 0x08 != 0 {
            le_u8(input)?
        } else {
            (input, 0)
        };
        let (input, creation_order) = if flags & 0x04 != 0 {
            let (input, v) = le_u64(input)?;
            (input, Some(v))
        } else {
            (input, None)
        };
        let (input, _charset) = if flags & 0x10 != 0 {
            le_u8(input)?
        } else {
            (input, 0)
        };
        let name_len_size = 1usize << (flags & 0x3);
        let (input, raw_len) = take(name_len_size)(input)?;
        let name_len = codec::read_le(raw_len) as usize;
        let (input, name) = take(name_len)(input)?;
        let name = String::from_utf8_lossy(name).into_owned();
        let (input, target) = match link_type {
            0 => {
                let (input, addr) = address(sizes.offset)(input)?;
                (input, LinkTarget::Hard(addr))
            }
            1 => {
                let (input, len) = le_u16(input)?;
                let (input, path) = take(len as usize)(input)?;
                (input, LinkTarget::Soft(cstr(path)))
            }
            _ => return Err(failure(input, "unsupported link type")),
        };
        Ok((
            input,
            Link {
                name,
                creation_order,
                target,
            },
        ))
    })(input)
}

pub fn data_layout(input: &[u8], sizes: Sizes) -> PResult<DataLayout> {
    context("data layout", move |input| {
        let (input, version) = le_u8(input)?;
        match version {
            1 | 2 => {
                let (input, dimensionality) = le_u8(input)?;
                let (input, layout_class) = le_u8(input)?;
                if layout_class != 1 {
                    return Err(failure(input, "only contiguous layout is supported"));
                }
                let (input, _reserved) = take(5usize)(input)?;
                let (input, data_address) = address(sizes.offset)(input)?;
                let (input, dims) = nom_count(le_u32, dimensionality as usize)(input)?;
                let size = dims.iter().map(|d| u64::from(*d)).product();
                Ok((
                    input,
                    DataLayout {
                        address: data_address,
                        size,
                    },
                ))
            }
            3 => {
                let (input, layout_class) = le_u8(input)?;
                if layout_class != 1 {
                    return Err(failure(input, "only contiguous layout is supported"));
                }
                let (input, data_address) = address(sizes.offset)(input)?;
                let (input, size) = address(sizes.length)(input)?;
                Ok((
                    input,
                    DataLayout {
                        address: data_address,
                        size,
                    },
                ))
            }
            _ => Err(failure(input, "unsupported data layout version")),
        }
    })(input)
}

fn group_info(input: &[u8]) -> PResult<GroupInfo> {
    context("group info", |input| {
        let (input, _version) = le_u8(input)?;
        let (input, flags) = le_u8(input)?;
        let (input, link_phase_change) = if flags & 1 == 1 {
            let (input, max_compact) = le_u16(input)?;
            let (input, min_dense) = le_u16(input)?;
            (input, Some((max_compact, min_dense)))
        } else {
            (input, None)
        };
        let (input, estimates) = if flags & 2 == 2 {
            let (input, entries) = le_u16(input)?;
            let (input, name_len) = le_u16(input)?;
            (input, Some((entries, name_len)))
        } else {
            (input, None)
        };
        Ok((
            input,
            GroupInfo {
                flags,
                link_phase_change,
                estimates,
            },
        ))
    })(input)
}

fn filter_pipeline(input: &[u8]) -> PResult<FilterPipeline> {
    context("filter pipeline", |input| {
        let (input, version) = le_u8(input)?;
        let (input, n_filters) = le_u8(input)?;
        let (mut input, _) = match version {
            1 => take(6usize)(input)?,
            2 => (input, &input[..0]),
            _ => return Err(failure(input, "unsupported filter pipeline version")),
        };
        let mut filters = Vec::with_capacity(n_filters as usize);
        for _ in 0..n_filters {
            let (rest, id) = le_u16(input)?;
            let (rest, name_len) = if version == 1 || id >= 256 {
                le_u16(rest)?
            } else {
                (rest, 0)
            };
            let (rest, flags) = le_u16(rest)?;
            let (rest, n_client_values) = le_u16(rest)?;
            let (rest, raw_name) = take(name_len as usize)(rest)?;
            let name = cstr(raw_name);
            let (rest, client_data) = nom_count(le_u32, n_client_values as usize)(rest)?;
            // Version 1 pads the client data to a multiple of 8 bytes.
            let rest = if version == 1 && n_client_values % 2 == 1 {
                take(4usize)(rest)?.0
            } else {
                rest
            };
            filters.push(FilterDescriptor {
                id,
                name,
                flags,
                client_data,
            });
            input = rest;
        }
        Ok((input, FilterPipeline { filters }))
    })(input)
}

fn attribute(input: &[u8], sizes: Sizes) -> PResult<Attribute> {
    context("attribute", move |input| {
        let (_, version) = le_u8(input)?;
        match version {
            1 => attribute_v1(input, sizes),
            2 | 3 => attribute_v3(input, sizes, version),
            _ => Err(failure(input, "unsupported attribute version")),
        }
    })(input)
}

fn attribute_v1(input: &[u8], sizes: Sizes) -> PResult<Attribute> {
    let (input, _version) = le_u8(input)?;
    let (input, _reserved) = le_u8(input)?;
    let (input, name_size) = le_u16(input)?;
    let (input, datatype_size) = le_u16(input)?;
    let (input, dataspace_size) = le_u16(input)?;

    let (_, raw_name) = take(name_size as usize)(input)?;
    let name = cstr(raw_name);
    let input = &input[pad8(name_size as usize)..];

    let (_, dtype) = datatype::datatype(input)?;
    let input = &input[pad8(datatype_size as usize)..];

    let (_, dspace) = dataspace(input, sizes)?;
    let input = &input[pad8(dataspace_size as usize)..];

    // The declared message size includes alignment padding, so the value
    // length comes from the type and the shape, not from the framing.
    let data = attribute_data(input, &dtype, &dspace);
    Ok((
        &input[input.len()..],
        Attribute {
            name,
            datatype: dtype,
            dataspace: dspace,
            data,
        },
    ))
}

fn attribute_data(remaining: &[u8], dtype: &Datatype, dspace: &Dataspace) -> Vec<u8> {
    let expected = u64::from(dtype.size()) * dspace.element_count();
    let take_len = std::cmp::min(expected as usize, remaining.len());
    remaining[..take_len].to_vec()
}

/// Versions 2 and 3 share a layout; version 3 adds a charset byte.
fn attribute_v3(input: &[u8], sizes: Sizes, version: u8) -> PResult<Attribute> {
    let (input, _version) = le_u8(input)?;
    let (input, _flags) = le_u8(input)?;
    let (input, name_size) = le_u16(input)?;
    let (input, _datatype_size) = le_u16(input)?;
    let (input, _dataspace_size) = le_u16(input)?;
    let (input, _charset) = if version == 3 {
        le_u8(input)?
    } else {
        (input, 0)
    };
    let (input, raw_name) = take(name_size as usize)(input)?;
    let name = cstr(raw_name);
    let (input, dtype) = datatype::datatype(input)?;
    let (input, dspace) = dataspace(input, sizes)?;
    let data = attribute_data(input, &dtype, &dspace);
    Ok((
        &input[input.len()..],
        Attribute {
            name,
            datatype: dtype,
            dataspace: dspace,
            data,
        },
    ))
}

pub fn object_header_continuation(
    input: &[u8],
    sizes: Sizes,
) -> PResult<ObjectHeaderContinuation> {
    context("object header continuation", move |input| {
        let (input, offset) = address(sizes.offset)(input)?;
        let (input, length) = address(sizes.length)(input)?;
        Ok((input, ObjectHeaderContinuation { offset, length }))
    })(input)
}

pub fn symbol_table_message(input: &[u8], sizes: Sizes) -> PResult<SymbolTableMessage> {
    context("symbol table message", move |input| {
        let (input, btree_address) = address(sizes.offset)(input)?;
        let (input, local_heap_address) = address(sizes.offset)(input)?;
        Ok((
            input,
            SymbolTableMessage {
                btree_address,
                local_heap_address,
            },
        ))
    })(input)
}

pub fn object_modification_time(input: &[u8]) -> PResult<ObjectModificationTime> {
    context("object modification time", |input| {
        let (input, version) = le_u8(input)?;
        if version != 1 {
            return Err(failure(input, "unsupported modification time version"));
        }
        let (input, _reserved) = take(3usize)(input)?;
        let (input, seconds) = le_u32(input)?;
        Ok((
            input,
            ObjectModificationTime {
                seconds_after_unix_epoch: seconds,
            },
        ))
    })(input)
}

fn attribute_info(input: &[u8], sizes: Sizes) -> PResult<AttributeInfo> {
    context("attribute info", move |input| {
        let (input, _version) = le_u8(input)?;
        let (input, flags) = le_u8(input)?;
        let (input, max_creation_index) = if flags & 1 == 1 {
            let (input, v) = le_u16(input)?;
            (input, Some(v))
        } else {
            (input, None)
        };
        let (input, fractal_heap_address) = address(sizes.offset)(input)?;
        let (input, name_btree_address) = address(sizes.offset)(input)?;
        let (input, order_btree_address) = if flags & 2 == 2 {
            let (input, v) = address(sizes.offset)(input)?;
            (input, Some(v))
        } else {
            (input, None)
        };
        Ok((
            input,
            AttributeInfo {
                max_creation_index,
                fractal_heap_address,
                name_btree_address,
                order_btree_address,
            },
        ))
    })(input)
}

fn reference_count(input: &[u8]) -> PResult<ObjectReferenceCount> {
    context("object reference count", |input| {
        let (input, version) = le_u8(input)?;
        if version != 0 {
            return Err(failure(input, "unsupported reference count version"));
        }
        let (input, count) = le_u32(input)?;
        Ok((input, ObjectReferenceCount { count }))
    })(input)
}

/// Parse one framed message. The returned message owns exactly the declared
/// data region; padding is part of that region in version 1 headers.
pub fn header_message(input: &[u8], sizes: Sizes) -> PResult<HeaderMessage> {
    context("header message", move |input| {
        let (input, message_type) = le_u16(input)?;
        let (input, message_size) = le_u16(input)?;
        let (input, flags) = le_u8(input)?;
        let (input, _reserved) = take(3usize)(input)?;
        let (rest, data) = take(message_size as usize)(input)?;

        let body = parse_body(message_type, data, sizes)?;
        Ok((rest, HeaderMessage { flags, body }))
    })(input)
}

fn parse_body<'a>(
    message_type: u16,
    data: &'a [u8],
    sizes: Sizes,
) -> std::result::Result<Message, nom::Err<nom::error::VerboseError<&'a [u8]>>> {
    let body = match message_type {
        MTYPE_NIL => Message::Nil(data.len()),
        MTYPE_DATASPACE => Message::Dataspace(dataspace(data, sizes)?.1),
        MTYPE_LINK_INFO => Message::LinkInfo(link_info(data, sizes)?.1),
        MTYPE_DATATYPE => Message::Datatype(datatype::datatype(data)?.1),
        MTYPE_FILL_VALUE_OLD => Message::FillValueOld(fill_value_old(data)?.1),
        MTYPE_FILL_VALUE => Message::FillValue(fill_value(data)?.1),
        MTYPE_LINK => Message::Link(link(data, sizes)?.1),
        MTYPE_DATA_LAYOUT => Message::DataLayout(data_layout(data, sizes)?.1),
        MTYPE_GROUP_INFO => Message::GroupInfo(group_info(data)?.1),
        MTYPE_FILTER_PIPELINE => Message::FilterPipeline(filter_pipeline(data)?.1),
        MTYPE_ATTRIBUTE => Message::Attribute(attribute(data, sizes)?.1),
        MTYPE_MODIFICATION_TIME_OLD => Message::ModificationTimeOld(data.to_vec()),
        MTYPE_CONTINUATION => {
            Message::ObjectHeaderContinuation(object_header_continuation(data, sizes)?.1)
        }
        MTYPE_SYMBOL_TABLE => Message::SymbolTable(symbol_table_message(data, sizes)?.1),
        MTYPE_MODIFICATION_TIME => {
            Message::ObjectModificationTime(object_modification_time(data)?.1)
        }
        MTYPE_ATTRIBUTE_INFO => Message::AttributeInfo(attribute_info(data, sizes)?.1),
        MTYPE_REFERENCE_COUNT => Message::ObjectReferenceCount(reference_count(data)?.1),
        _ => Message::Unknown {
            message_type,
            bytes: data.to_vec(),
        },
    };
    Ok(body)
}

// ---------------------------------------------------------------------------
// Encode
// ---------------------------------------------------------------------------

fn push_padded(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(bytes);
    for _ in bytes.len()..pad8(bytes.len()) {
        out.push(0);
    }
}

impl Dataspace {
    pub fn encode(&self, sizes: Sizes) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(1); // version
        out.push(self.dimensions.len() as u8);
        out.push(if self.max_dimensions.is_some() { 1 } else { 0 });
        out.extend_from_slice(&[0; 5]);
        for dim in &self.dimensions {
            codec::write_le(&mut out, *dim, sizes.length);
        }
        if let Some(max) = &self.max_dimensions {
            for dim in max {
                codec::write_le(&mut out, *dim, sizes.length);
            }
        }
        out
    }
}

impl Message {
    pub fn message_type(&self) -> u16 {
        match self {
            Message::Nil(_) => MTYPE_NIL,
            Message::Dataspace(_) => MTYPE_DATASPACE,
            Message::LinkInfo(_) => MTYPE_LINK_INFO,
            Message::Datatype(_) => MTYPE_DATATYPE,
            Message::FillValueOld(_) => MTYPE_FILL_VALUE_OLD,
            Message::FillValue(_) => MTYPE_FILL_VALUE,
            Message::Link(_) => MTYPE_LINK,
            Message::DataLayout(_) => MTYPE_DATA_LAYOUT,
            Message::GroupInfo(_) => MTYPE_GROUP_INFO,
            Message::FilterPipeline(_) => MTYPE_FILTER_PIPELINE,
            Message::Attribute(_) => MTYPE_ATTRIBUTE,
            Message::ModificationTimeOld(_) => MTYPE_MODIFICATION_TIME_OLD,
            Message::ObjectHeaderContinuation(_) => MTYPE_CONTINUATION,
            Message::SymbolTable(_) => MTYPE_SYMBOL_TABLE,
            Message::ObjectModificationTime(_) => MTYPE_MODIFICATION_TIME,
            Message::AttributeInfo(_) => MTYPE_ATTRIBUTE_INFO,
            Message::ObjectReferenceCount(_) => MTYPE_REFERENCE_COUNT,
            Message::Unknown { message_type, .. } => *message_type,
        }
    }

    /// Serialize the message data region (unframed, unpadded).
    pub fn encode_body(&self, sizes: Sizes) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Message::Nil(size) => {
                out.resize(*size, 0);
            }
            Message::Dataspace(m) => out = m.encode(sizes),
            Message::LinkInfo(m) => {
                out.push(0); // version
                let mut flags = 0u8;
                if m.max_creation_index.is_some() {
                    flags |= 1;
                }
                if m.creation_order_btree_address.is_some() {
                    flags |= 2;
                }
                out.push(flags);
                if let Some(v) = m.max_creation_index {
                    codec::push_u64(&mut out, v);
                }
                codec::write_le(&mut out, m.fractal_heap_address, sizes.offset);
                codec::write_le(&mut out, m.name_index_btree_address, sizes.offset);
                if let Some(v) = m.creation_order_btree_address {
                    codec::write_le(&mut out, v, sizes.offset);
                }
            }
            Message::Datatype(m) => m.encode_into(&mut out),
            Message::FillValueOld(m) => {
                codec::push_u32(&mut out, m.fill.len() as u32);
                out.extend_from_slice(&m.fill);
            }
            Message::FillValue(m) => {
                out.push(2); // version
                out.push(m.space_allocation_time);
                out.push(m.fill_value_write_time);
                match &m.fill {
                    Some(fill) => {
                        out.push(1);
                        codec::push_u32(&mut out, fill.len() as u32);
                        out.extend_from_slice(fill);
                    }
                    None => out.push(0),
                }
            }
            Message::Link(m) => {
                out.push(1); // version
                let mut flags = 3u8; // 8-byte name length field
                if m.creation_order.is_some() {
                    flags |= 0x04;
                }
                if let LinkTarget::Soft(_) = m.target {
                    flags |= 0x08;
                }
                out.push(flags);
                if let LinkTarget::Soft(_) = m.target {
                    out.push(1);
                }
                if let Some(order) = m.creation_order {
                    codec::push_u64(&mut out, order);
                }
                codec::push_u64(&mut out, m.name.len() as u64);
                out.extend_from_slice(m.name.as_bytes());
                match &m.target {
                    LinkTarget::Hard(addr) => codec::write_le(&mut out, *addr, sizes.offset),
                    LinkTarget::Soft(path) => {
                        codec::push_u16(&mut out, path.len() as u16 + 1);
                        out.extend_from_slice(path.as_bytes());
                        out.push(0);
                    }
                }
            }
            Message::DataLayout(m) => {
                out.push(3); // version
                out.push(1); // contiguous
                codec::write_le(&mut out, m.address, sizes.offset);
                codec::write_le(&mut out, m.size, sizes.length);
            }
            Message::GroupInfo(m) => {
                out.push(0); // version
                out.push(m.flags);
                if let Some((max_compact, min_dense)) = m.link_phase_change {
                    codec::push_u16(&mut out, max_compact);
                    codec::push_u16(&mut out, min_dense);
                }
                if let Some((entries, name_len)) = m.estimates {
                    codec::push_u16(&mut out, entries);
                    codec::push_u16(&mut out, name_len);
                }
            }
            Message::FilterPipeline(m) => {
                out.push(1); // version
                out.push(m.filters.len() as u8);
                out.extend_from_slice(&[0; 6]);
                for filter in &m.filters {
                    codec::push_u16(&mut out, filter.id);
                    let name_len = pad8(filter.name.len() + 1);
                    codec::push_u16(&mut out, name_len as u16);
                    codec::push_u16(&mut out, filter.flags);
                    codec::push_u16(&mut out, filter.client_data.len() as u16);
                    let start = out.len();
                    out.extend_from_slice(filter.name.as_bytes());
                    out.push(0);
                    while out.len() - start < name_len {
                        out.push(0);
                    }
                    for value in &filter.client_data {
                        codec::push_u32(&mut out, *value);
                    }
                    if filter.client_data.len() % 2 == 1 {
                        codec::push_u32(&mut out, 0);
                    }
                }
            }
            Message::Attribute(m) => {
                let datatype_bytes = m.datatype.encode();
                let dataspace_bytes = m.dataspace.encode(sizes);
                out.push(1); // version
                out.push(0); // reserved
                codec::push_u16(&mut out, m.name.len() as u16 + 1);
                codec::push_u16(&mut out, datatype_bytes.len() as u16);
                codec::push_u16(&mut out, dataspace_bytes.len() as u16);
                let mut name = m.name.as_bytes().to_vec();
                name.push(0);
                push_padded(&mut out, &name);
                push_padded(&mut out, &datatype_bytes);
                push_padded(&mut out, &dataspace_bytes);
                out.extend_from_slice(&m.data);
            }
            Message::ModificationTimeOld(bytes) => out.extend_from_slice(bytes),
            Message::ObjectHeaderContinuation(m) => {
                codec::write_le(&mut out, m.offset, sizes.offset);
                codec::write_le(&mut out, m.length, sizes.length);
            }
            Message::SymbolTable(m) => {
                codec::write_le(&mut out, m.btree_address, sizes.offset);
                codec::write_le(&mut out, m.local_heap_address, sizes.offset);
            }
            Message::ObjectModificationTime(m) => {
                out.push(1); // version
                out.extend_from_slice(&[0; 3]);
                codec::push_u32(&mut out, m.seconds_after_unix_epoch);
            }
            Message::AttributeInfo(m) => {
                out.push(0); // version
                let mut flags = 0u8;
                if m.max_creation_index.is_some() {
                    flags |= 1;
                }
                if m.order_btree_address.is_some() {
                    flags |= 2;
                }
                out.push(flags);
                if let Some(v) = m.max_creation_index {
                    codec::push_u16(&mut out, v);
                }
                codec::write_le(&mut out, m.fractal_heap_address, sizes.offset);
                codec::write_le(&mut out, m.name_btree_address, sizes.offset);
                if let Some(v) = m.order_btree_address {
                    codec::write_le(&mut out, v, sizes.offset);
                }
            }
            Message::ObjectReferenceCount(m) => {
                out.push(0); // version
                codec::push_u32(&mut out, m.count);
            }
            Message::Unknown { bytes, .. } => out.extend_from_slice(bytes),
        }
        out
    }
}

impl HeaderMessage {
    /// Full framed size: 8-byte header plus data padded to 8.
    pub fn framed_size(&self, sizes: Sizes) -> usize {
        8 + pad8(self.body.encode_body(sizes).len())
    }

    pub fn encode_framed(&self, out: &mut Vec<u8>, sizes: Sizes) {
        let body = self.body.encode_body(sizes);
        codec::push_u16(out, self.body.message_type());
        codec::push_u16(out, pad8(body.len()) as u16);
        out.push(self.flags);
        out.extend_from_slice(&[0; 3]);
        push_padded(out, &body);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIZES: Sizes = Sizes {
        offset: 8,
        length: 8,
    };

    fn frame(message: &HeaderMessage) -> Vec<u8> {
        let mut out = Vec::new();
        message.encode_framed(&mut out, SIZES);
        out
    }

    #[test]
    fn dataspace_roundtrip() {
        let space = Dataspace::simple(vec![3, 4]);
        let bytes = space.encode(SIZES);
        let (rest, parsed) = dataspace(&bytes, SIZES).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed, space);
        assert_eq!(parsed.element_count(), 12);
    }

    #[test]
    fn framed_message_roundtrip() {
        let message = HeaderMessage::new(Message::SymbolTable(SymbolTableMessage {
            btree_address: 136,
            local_heap_address: 680,
        }));
        let bytes = frame(&message);
        assert_eq!(bytes.len() % 8, 0);

        let (rest, parsed) = header_message(&bytes, SIZES).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed.flags, 0);
        match parsed.body {
            Message::SymbolTable(m) => {
                assert_eq!(m.btree_address, 136);
                assert_eq!(m.local_heap_address, 680);
            }
            other => panic!("wrong message: {:?}", other),
        }
    }

    #[test]
    fn attribute_roundtrip() {
        let attr = Attribute {
            name: "unit".to_string(),
            datatype: Datatype::int32(),
            dataspace: Dataspace::scalar(),
            data: vec![42, 0, 0, 0],
        };
        let message = HeaderMessage::new(Message::Attribute(attr));
        let bytes = frame(&message);
        let (_, parsed) = header_message(&bytes, SIZES).unwrap();
        match parsed.body {
            Message::Attribute(a) => {
                assert_eq!(a.name, "unit");
                assert_eq!(a.datatype, Datatype::int32());
                assert_eq!(a.dataspace, Dataspace::scalar());
                assert_eq!(a.data, vec![42, 0, 0, 0]);
            }
            other => panic!("wrong message: {:?}", other),
        }
    }

    #[test]
    fn unknown_message_preserved() {
        let raw: Vec<u8> = vec![
            0x99, 0x00, // type 0x99
            0x08, 0x00, // size 8
            0x00, // flags: preserve
            0, 0, 0, // reserved
            1, 2, 3, 4, 5, 6, 7, 8,
        ];
        let (_, parsed) = header_message(&raw, SIZES).unwrap();
        match &parsed.body {
            Message::Unknown {
                message_type,
                bytes,
            } => {
                assert_eq!(*message_type, 0x99);
                assert_eq!(bytes, &[1, 2, 3, 4, 5, 6, 7, 8]);
            }
            other => panic!("wrong message: {:?}", other),
        }
        // Re-emission reproduces the input bytes.
        assert_eq!(frame(&parsed), raw);
    }

    #[test]
    fn fill_value_undefined_roundtrip() {
        let message = HeaderMessage::new(Message::FillValue(FillValue::unset()));
        let bytes = frame(&message);
        let (_, parsed) = header_message(&bytes, SIZES).unwrap();
        match parsed.body {
            Message::FillValue(f) => assert!(f.fill.is_none()),
            other => panic!("wrong message: {:?}", other),
        }
    }

    #[test]
    fn narrow_offset_sizes() {
        let sizes = Sizes::new(4, 4);
        let message = HeaderMessage::new(Message::ObjectHeaderContinuation(
            ObjectHeaderContinuation {
                offset: 0x1000,
                length: 64,
            },
        ));
        let mut bytes = Vec::new();
        message.encode_framed(&mut bytes, sizes);
        // 8 framing + 4 + 4 data = 16
        assert_eq!(bytes.len(), 16);
        let (_, parsed) = header_message(&bytes, sizes).unwrap();
        match parsed.body {
            Message::ObjectHeaderContinuation(c) => {
                assert_eq!(c.offset, 0x1000);
                assert_eq!(c.length, 64);
            }
            other => panic!("wrong message: {:?}", other),
        }
    }
}
