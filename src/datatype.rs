//! Datatype descriptors: the self-describing element layout of a dataset.
//!
//! One tagged union covers the eleven datatype classes, dispatched on the
//! class code in the low four bits of the shared class-and-version byte.
//! Compound, enumeration, variable-length, and array descriptors nest
//! recursively. Parsing accepts descriptor versions 1 through 3; encoding
//! emits one canonical version per class, so `parse(encode(d))` is the
//! identity and `encode(parse(bytes))` is canonical.

use nom::bytes::streaming::take;
use nom::error::context;
use nom::multi::count;
use nom::number::streaming::{le_u16, le_u24, le_u32, le_u8};

use crate::codec::{self, ByteOrder, Pad};
use crate::parse_util::{cstr, failure, pad8, PResult};

#[derive(Debug, Clone, PartialEq)]
pub enum Datatype {
    FixedPoint(FixedPoint),
    FloatingPoint(FloatingPoint),
    Time(Time),
    String(StringType),
    BitField(BitField),
    Opaque(Opaque),
    Compound(Compound),
    Reference(Reference),
    Enumeration(Enumeration),
    VariableLength(VariableLength),
    Array(ArrayType),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FixedPoint {
    pub order: ByteOrder,
    pub lo_pad: Pad,
    pub hi_pad: Pad,
    pub signed: bool,
    pub size: u32,
    pub bit_offset: u16,
    pub bit_precision: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FloatingPoint {
    pub order: ByteOrder,
    pub size: u32,
    pub bit_offset: u16,
    pub bit_precision: u16,
    pub sign_location: u8,
    pub exponent_location: u8,
    pub exponent_size: u8,
    pub mantissa_location: u8,
    pub mantissa_size: u8,
    pub exponent_bias: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Time {
    pub order: ByteOrder,
    pub size: u32,
    pub bit_precision: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StringPad {
    NullTerminate,
    NullPad,
    SpacePad,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CharSet {
    Ascii,
    Utf8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StringType {
    pub size: u32,
    pub padding: StringPad,
    pub charset: CharSet,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BitField {
    pub order: ByteOrder,
    pub lo_pad: Pad,
    pub hi_pad: Pad,
    pub size: u32,
    pub bit_offset: u16,
    pub bit_precision: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Opaque {
    pub size: u32,
    pub tag: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Compound {
    pub size: u32,
    pub members: Vec<CompoundMember>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompoundMember {
    pub name: String,
    pub byte_offset: u32,
    /// Optional per-member array dimensions (version 1 descriptors).
    pub dimensions: Vec<u32>,
    pub datatype: Datatype,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefKind {
    Object,
    Region,
    ObjectV2,
    RegionV2,
    Attribute,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reference {
    pub size: u32,
    pub kind: RefKind,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Enumeration {
    pub size: u32,
    pub base: Box<Datatype>,
    pub names: Vec<String>,
    /// One value per name, each `base.size()` bytes in the base's layout.
    pub values: Vec<Vec<u8>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VlenKind {
    Sequence,
    String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VariableLength {
    /// In-dataset element size: the (collection address, index) pair.
    pub size: u32,
    pub kind: VlenKind,
    pub padding: StringPad,
    pub charset: CharSet,
    pub base: Box<Datatype>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArrayType {
    pub size: u32,
    pub dimensions: Vec<u32>,
    pub base: Box<Datatype>,
}

impl Datatype {
    /// Bytes one element of this type occupies inside the dataset.
    pub fn size(&self) -> u32 {
        match self {
            Datatype::FixedPoint(t) => t.size,
            Datatype::FloatingPoint(t) => t.size,
            Datatype::Time(t) => t.size,
            Datatype::String(t) => t.size,
            Datatype::BitField(t) => t.size,
            Datatype::Opaque(t) => t.size,
            Datatype::Compound(t) => t.size,
            Datatype::Reference(t) => t.size,
            Datatype::Enumeration(t) => t.size,
            Datatype::VariableLength(t) => t.size,
            Datatype::Array(t) => t.size,
        }
    }

    /// Whether cells of this type hold (collection, index) pairs that must
    /// be resolved against the global heap.
    pub fn requires_global_heap(&self) -> bool {
        match self {
            Datatype::VariableLength(_) => true,
            Datatype::Compound(t) => t
                .members
                .iter()
                .any(|m| m.datatype.requires_global_heap()),
            Datatype::Array(t) => t.base.requires_global_heap(),
            Datatype::Enumeration(t) => t.base.requires_global_heap(),
            _ => false,
        }
    }

    /// Short human rendering, compound members in declared order.
    pub fn pretty(&self) -> String {
        match self {
            Datatype::FixedPoint(t) => {
                format!("{}int{}", if t.signed { "" } else { "u" }, t.size * 8)
            }
            Datatype::FloatingPoint(t) => format!("float{}", t.size * 8),
            Datatype::Time(t) => format!("time{}", t.size * 8),
            Datatype::String(t) => format!("string({})", t.size),
            Datatype::BitField(t) => format!("bitfield{}", t.size * 8),
            Datatype::Opaque(t) => format!("opaque[{}]({})", t.size, t.tag),
            Datatype::Compound(t) => {
                let members = t
                    .members
                    .iter()
                    .map(|m| format!("{}: {}", m.name, m.datatype.pretty()))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("compound{{{}}}", members)
            }
            Datatype::Reference(t) => format!("reference({:?})", t.kind),
            Datatype::Enumeration(t) => format!("enum({})", t.base.pretty()),
            Datatype::VariableLength(t) => match t.kind {
                VlenKind::String => "vlen(string)".to_string(),
                VlenKind::Sequence => format!("vlen({})", t.base.pretty()),
            },
            Datatype::Array(t) => format!("{}{:?}", t.base.pretty(), t.dimensions),
        }
    }

    // Constructors for the common cases the write path and tests reach for.

    pub fn int64() -> Datatype {
        Datatype::fixed(8, true)
    }

    pub fn int32() -> Datatype {
        Datatype::fixed(4, true)
    }

    pub fn uint64() -> Datatype {
        Datatype::fixed(8, false)
    }

    pub fn fixed(size: u32, signed: bool) -> Datatype {
        Datatype::FixedPoint(FixedPoint {
            order: ByteOrder::Little,
            lo_pad: Pad::Zero,
            hi_pad: Pad::Zero,
            signed,
            size,
            bit_offset: 0,
            bit_precision: (size * 8) as u16,
        })
    }

    pub fn float32() -> Datatype {
        Datatype::FloatingPoint(FloatingPoint {
            order: ByteOrder::Little,
            size: 4,
            bit_offset: 0,
            bit_precision: 32,
            sign_location: 31,
            exponent_location: 23,
            exponent_size: 8,
            mantissa_location: 0,
            mantissa_size: 23,
            exponent_bias: 127,
        })
    }

    pub fn float64() -> Datatype {
        Datatype::FloatingPoint(FloatingPoint {
            order: ByteOrder::Little,
            size: 8,
            bit_offset: 0,
            bit_precision: 64,
            sign_location: 63,
            exponent_location: 52,
            exponent_size: 11,
            mantissa_location: 0,
            mantissa_size: 52,
            exponent_bias: 1023,
        })
    }

    pub fn ascii(size: u32) -> Datatype {
        Datatype::String(StringType {
            size,
            padding: StringPad::NullTerminate,
            charset: CharSet::Ascii,
        })
    }

    /// Variable-length string cell: a 16-byte (length, collection address,
    /// index) group with 8-byte offsets.
    pub fn vlen_string(sizes: codec::Sizes) -> Datatype {
        Datatype::VariableLength(VariableLength {
            size: 4 + u32::from(sizes.offset) + 4,
            kind: VlenKind::String,
            padding: StringPad::NullTerminate,
            charset: CharSet::Ascii,
            base: Box::new(Datatype::fixed(1, false)),
        })
    }

    pub fn compound(members: Vec<(String, Datatype)>) -> Datatype {
        let mut offset = 0u32;
        let mut out = Vec::with_capacity(members.len());
        for (name, datatype) in members {
            let size = datatype.size();
            out.push(CompoundMember {
                name,
                byte_offset: offset,
                dimensions: Vec::new(),
                datatype,
            });
            offset += size;
        }
        Datatype::Compound(Compound {
            size: offset,
            members: out,
        })
    }
}

// ---------------------------------------------------------------------------
// Parse
// ---------------------------------------------------------------------------

fn order_bit(bits: u32) -> ByteOrder {
    if bits & 1 == 0 {
        ByteOrder::Little
    } else {
        ByteOrder::Big
    }
}

fn pad_bit(bits: u32, shift: u32) -> Pad {
    if bits >> shift & 1 == 0 {
        Pad::Zero
    } else {
        Pad::One
    }
}

fn string_pad(raw: u32) -> StringPad {
    match raw & 0xF {
        1 => StringPad::NullPad,
        2 => StringPad::SpacePad,
        _ => StringPad::NullTerminate,
    }
}

fn charset(raw: u32) -> CharSet {
    if raw & 0xF == 1 {
        CharSet::Utf8
    } else {
        CharSet::Ascii
    }
}

pub fn datatype(input: &[u8]) -> PResult<Datatype> {
    context("datatype", |input| {
        let (input, class_and_version) = le_u8(input)?;
        let (input, bits) = le_u24(input)?;
        let (input, size) = le_u32(input)?;

        let version = class_and_version >> 4;
        let class = class_and_version & 0x0F;
        if version == 0 || version > 3 {
            return Err(failure(input, "unsupported datatype version"));
        }

        match class {
            0 => {
                let (input, bit_offset) = le_u16(input)?;
                let (input, bit_precision) = le_u16(input)?;
                Ok((
                    input,
                    Datatype::FixedPoint(FixedPoint {
                        order: order_bit(bits),
                        lo_pad: pad_bit(bits, 1),
                        hi_pad: pad_bit(bits, 2),
                        signed: bits >> 3 & 1 == 1,
                        size,
                        bit_offset,
                        bit_precision,
                    }),
                ))
            }
            1 => {
                let (input, bit_offset) = le_u16(input)?;
                let (input, bit_precision) = le_u16(input)?;
                let (input, exponent_location) = le_u8(input)?;
                let (input, exponent_size) = le_u8(input)?;
                let (input, mantissa_location) = le_u8(input)?;
                let (input, mantissa_size) = le_u8(input)?;
                let (input, exponent_bias) = le_u32(input)?;
                Ok((
                    input,
                    Datatype::FloatingPoint(FloatingPoint {
                        order: order_bit(bits),
                        size,
                        bit_offset,
                        bit_precision,
                        sign_location: (bits >> 8 & 0xFF) as u8,
                        exponent_location,
                        exponent_size,
                        mantissa_location,
                        mantissa_size,
                        exponent_bias,
                    }),
                ))
            }
            2 => {
                let (input, bit_precision) = le_u16(input)?;
                Ok((
                    input,
                    Datatype::Time(Time {
                        order: order_bit(bits),
                        size,
                        bit_precision,
                    }),
                ))
            }
            3 => Ok((
                input,
                Datatype::String(StringType {
                    size,
                    padding: string_pad(bits),
                    charset: charset(bits >> 4),
                }),
            )),
            4 => {
                let (input, bit_offset) = le_u16(input)?;
                let (input, bit_precision) = le_u16(input)?;
                Ok((
                    input,
                    Datatype::BitField(BitField {
                        order: order_bit(bits),
                        lo_pad: pad_bit(bits, 1),
                        hi_pad: pad_bit(bits, 2),
                        size,
                        bit_offset,
                        bit_precision,
                    }),
                ))
            }
            5 => {
                let tag_len = (bits & 0xFF) as usize;
                let (input, tag) = take(tag_len)(input)?;
                Ok((
                    input,
                    Datatype::Opaque(Opaque {
                        size,
                        tag: cstr(tag),
                    }),
                ))
            }
            6 => compound_members(input, version, size, (bits & 0xFFFF) as usize),
            7 => {
                let kind = match bits & 0xF {
                    0 => RefKind::Object,
                    1 => RefKind::Region,
                    2 => RefKind::ObjectV2,
                    3 => RefKind::RegionV2,
                    4 => RefKind::Attribute,
                    _ => return Err(failure(input, "unknown reference kind")),
                };
                Ok((input, Datatype::Reference(Reference { size, kind })))
            }
            8 => enumeration(input, version, size, (bits & 0xFFFF) as usize),
            9 => {
                let (input, base) = datatype(input)?;
                let kind = match bits & 0xF {
                    0 => VlenKind::Sequence,
                    1 => VlenKind::String,
                    _ => return Err(failure(input, "unknown variable-length kind")),
                };
                Ok((
                    input,
                    Datatype::VariableLength(VariableLength {
                        size,
                        kind,
                        padding: string_pad(bits >> 4),
                        charset: charset(bits >> 8),
                        base: Box::new(base),
                    }),
                ))
            }
            10 => array(input, version, size),
            _ => Err(failure(input, "invalid datatype class")),
        }
    })(input)
}

fn compound_members(
    input: &[u8],
    version: u8,
    size: u32,
    n_members: usize,
) -> PResult<Datatype> {
    let mut members = Vec::with_capacity(n_members);
    let mut input = input;
    for _ in 0..n_members {
        let (rest, member) = compound_member(input, version, size)?;
        members.push(member);
        input = rest;
    }
    Ok((input, Datatype::Compound(Compound { size, members })))
}

fn compound_member(input: &[u8], version: u8, compound_size: u32) -> PResult<CompoundMember> {
    context("compound member", move |input| match version {
        1 => {
            let (input, name) = padded_name(input)?;
            let (input, byte_offset) = le_u32(input)?;
            let (input, dimensionality) = le_u8(input)?;
            let (input, _reserved) = take(3usize)(input)?;
            let (input, _permutation) = le_u32(input)?;
            let (input, _reserved2) = le_u32(input)?;
            let (input, dims) = count(le_u32, 4)(input)?;
            let (input, member_type) = datatype(input)?;
            Ok((
                input,
                CompoundMember {
                    name,
                    byte_offset,
                    dimensions: dims
                        .into_iter()
                        .take(dimensionality as usize)
                        .collect(),
                    datatype: member_type,
                },
            ))
        }
        2 => {
            let (input, name) = padded_name(input)?;
            let (input, byte_offset) = le_u32(input)?;
            let (input, member_type) = datatype(input)?;
            Ok((
                input,
                CompoundMember {
                    name,
                    byte_offset,
                    dimensions: Vec::new(),
                    datatype: member_type,
                },
            ))
        }
        _ => {
            // Version 3: unpadded name, byte offset sized to the compound.
            let nul = input
                .iter()
                .position(|b| *b == 0)
                .ok_or_else(|| failure(input, "unterminated member name"))?;
            let name = cstr(&input[..nul]);
            let input = &input[nul + 1..];
            let offset_width = codec::min_bytes_to_hold(u64::from(compound_size.max(1)));
            let (input, raw_offset) = take(offset_width as usize)(input)?;
            let byte_offset = codec::read_le(raw_offset) as u32;
            let (input, member_type) = datatype(input)?;
            Ok((
                input,
                CompoundMember {
                    name,
                    byte_offset,
                    dimensions: Vec::new(),
                    datatype: member_type,
                },
            ))
        }
    })(input)
}

/// NUL-terminated name padded out to a multiple of 8 bytes.
fn padded_name(input: &[u8]) -> PResult<String> {
    let nul = match input.iter().position(|b| *b == 0) {
        Some(i) => i,
        None => return Err(failure(input, "unterminated name")),
    };
    let name = cstr(&input[..nul]);
    let padded = pad8(nul + 1);
    let (input, _) = take(padded)(input)?;
    Ok((input, name))
}

fn enumeration(input: &[u8], version: u8, size: u32, n: usize) -> PResult<Datatype> {
    let (mut input, base) = datatype(input)?;
    let mut names = Vec::with_capacity(n);
    for _ in 0..n {
        let (rest, name) = if version < 3 {
            padded_name(input)?
        } else {
            let nul = input
                .iter()
                .position(|b| *b == 0)
                .ok_or_else(|| failure(input, "unterminated enum name"))?;
            let name = cstr(&input[..nul]);
            (&input[nul + 1..], name)
        };
        names.push(name);
        input = rest;
    }
    let value_size = base.size() as usize;
    let mut values = Vec::with_capacity(n);
    for _ in 0..n {
        let (rest, value) = take(value_size)(input)?;
        values.push(value.to_vec());
        input = rest;
    }
    Ok((
        input,
        Datatype::Enumeration(Enumeration {
            size,
            base: Box::new(base),
            names,
            values,
        }),
    ))
}

fn array(input: &[u8], version: u8, size: u32) -> PResult<Datatype> {
    let (input, dimensionality) = le_u8(input)?;
    let (input, dims, _perm) = if version == 2 {
        let (input, _reserved) = take(3usize)(input)?;
        let (input, dims) = count(le_u32, dimensionality as usize)(input)?;
        let (input, perm) = count(le_u32, dimensionality as usize)(input)?;
        (input, dims, perm)
    } else {
        let (input, dims) = count(le_u32, dimensionality as usize)(input)?;
        (input, dims, Vec::new())
    };
    let (input, base) = datatype(input)?;
    Ok((
        input,
        Datatype::Array(ArrayType {
            size,
            dimensions: dims,
            base: Box::new(base),
        }),
    ))
}

// ---------------------------------------------------------------------------
// Encode
// ---------------------------------------------------------------------------

fn header_byte(version: u8, class: u8) -> u8 {
    version << 4 | class
}

fn push_bits_and_size(out: &mut Vec<u8>, bits: u32, size: u32) {
    out.push(bits as u8);
    out.push((bits >> 8) as u8);
    out.push((bits >> 16) as u8);
    codec::push_u32(out, size);
}

fn order_flag(order: ByteOrder) -> u32 {
    match order {
        ByteOrder::Little => 0,
        ByteOrder::Big => 1,
    }
}

fn pad_flag(pad: Pad, shift: u32) -> u32 {
    match pad {
        Pad::Zero => 0,
        Pad::One => 1 << shift,
    }
}

fn string_pad_flag(padding: StringPad) -> u32 {
    match padding {
        StringPad::NullTerminate => 0,
        StringPad::NullPad => 1,
        StringPad::SpacePad => 2,
    }
}

fn charset_flag(cs: CharSet) -> u32 {
    match cs {
        CharSet::Ascii => 0,
        CharSet::Utf8 => 1,
    }
}

fn push_padded_name(out: &mut Vec<u8>, name: &str) {
    let len = name.len() + 1;
    out.extend_from_slice(name.as_bytes());
    out.push(0);
    for _ in len..pad8(len) {
        out.push(0);
    }
}

impl Datatype {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Datatype::FixedPoint(t) => {
                out.push(header_byte(1, 0));
                let bits = order_flag(t.order)
                    | pad_flag(t.lo_pad, 1)
                    | pad_flag(t.hi_pad, 2)
                    | if t.signed { 1 << 3 } else { 0 };
                push_bits_and_size(out, bits, t.size);
                codec::push_u16(out, t.bit_offset);
                codec::push_u16(out, t.bit_precision);
            }
            Datatype::FloatingPoint(t) => {
                out.push(header_byte(1, 1));
                let bits = order_flag(t.order) | u32::from(t.sign_location) << 8;
                push_bits_and_size(out, bits, t.size);
                codec::push_u16(out, t.bit_offset);
                codec::push_u16(out, t.bit_precision);
                out.push(t.exponent_location);
                out.push(t.exponent_size);
                out.push(t.mantissa_location);
                out.push(t.mantissa_size);
                codec::push_u32(out, t.exponent_bias);
            }
            Datatype::Time(t) => {
                out.push(header_byte(1, 2));
                push_bits_and_size(out, order_flag(t.order), t.size);
                codec::push_u16(out, t.bit_precision);
            }
            Datatype::String(t) => {
                out.push(header_byte(1, 3));
                let bits = string_pad_flag(t.padding) | charset_flag(t.charset) << 4;
                push_bits_and_size(out, bits, t.size);
            }
            Datatype::BitField(t) => {
                out.push(header_byte(1, 4));
                let bits =
                    order_flag(t.order) | pad_flag(t.lo_pad, 1) | pad_flag(t.hi_pad, 2);
                push_bits_and_size(out, bits, t.size);
                codec::push_u16(out, t.bit_offset);
                codec::push_u16(out, t.bit_precision);
            }
            Datatype::Opaque(t) => {
                out.push(header_byte(1, 5));
                let tag_len = pad8(t.tag.len() + 1) as u32;
                push_bits_and_size(out, tag_len & 0xFF, t.size);
                let start = out.len();
                out.extend_from_slice(t.tag.as_bytes());
                out.push(0);
                while out.len() - start < tag_len as usize {
                    out.push(0);
                }
            }
            Datatype::Compound(t) => {
                out.push(header_byte(1, 6));
                push_bits_and_size(out, t.members.len() as u32 & 0xFFFF, t.size);
                for member in &t.members {
                    push_padded_name(out, &member.name);
                    codec::push_u32(out, member.byte_offset);
                    out.push(member.dimensions.len() as u8);
                    out.extend_from_slice(&[0, 0, 0]); // reserved
                    codec::push_u32(out, 0); // permutation
                    codec::push_u32(out, 0); // reserved
                    for i in 0..4 {
                        let dim = member.dimensions.get(i).copied().unwrap_or(0);
                        codec::push_u32(out, dim);
                    }
                    member.datatype.encode_into(out);
                }
            }
            Datatype::Reference(t) => {
                out.push(header_byte(1, 7));
                let bits = match t.kind {
                    RefKind::Object => 0,
                    RefKind::Region => 1,
                    RefKind::ObjectV2 => 2,
                    RefKind::RegionV2 => 3,
                    RefKind::Attribute => 4,
                };
                push_bits_and_size(out, bits, t.size);
            }
            Datatype::Enumeration(t) => {
                out.push(header_byte(1, 8));
                push_bits_and_size(out, t.names.len() as u32 & 0xFFFF, t.size);
                t.base.encode_into(out);
                for name in &t.names {
                    push_padded_name(out, name);
                }
                for value in &t.values {
                    out.extend_from_slice(value);
                }
            }
            Datatype::VariableLength(t) => {
                out.push(header_byte(1, 9));
                let bits = match t.kind {
                    VlenKind::Sequence => 0,
                    VlenKind::String => 1,
                } | string_pad_flag(t.padding) << 4
                    | charset_flag(t.charset) << 8;
                push_bits_and_size(out, bits, t.size);
                t.base.encode_into(out);
            }
            Datatype::Array(t) => {
                out.push(header_byte(3, 10));
                push_bits_and_size(out, 0, t.size);
                out.push(t.dimensions.len() as u8);
                for dim in &t.dimensions {
                    codec::push_u32(out, *dim);
                }
                t.base.encode_into(out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Sizes;

    fn roundtrip(dt: &Datatype) -> Datatype {
        let bytes = dt.encode();
        let (rest, parsed) = datatype(&bytes).unwrap();
        assert!(rest.is_empty(), "trailing bytes after {:?}", dt);
        parsed
    }

    #[test]
    fn fixed_point_roundtrip() {
        let dt = Datatype::int64();
        assert_eq!(roundtrip(&dt), dt);
        assert_eq!(dt.size(), 8);
        assert!(!dt.requires_global_heap());
        assert_eq!(dt.pretty(), "int64");
    }

    #[test]
    fn unsigned_with_window() {
        let dt = Datatype::FixedPoint(FixedPoint {
            order: ByteOrder::Big,
            lo_pad: Pad::One,
            hi_pad: Pad::Zero,
            signed: false,
            size: 4,
            bit_offset: 8,
            bit_precision: 16,
        });
        assert_eq!(roundtrip(&dt), dt);
    }

    #[test]
    fn float_roundtrip() {
        let dt = Datatype::float64();
        assert_eq!(roundtrip(&dt), dt);
        assert_eq!(dt.pretty(), "float64");
    }

    #[test]
    fn string_roundtrip() {
        let dt = Datatype::ascii(16);
        assert_eq!(roundtrip(&dt), dt);
        assert_eq!(dt.pretty(), "string(16)");
    }

    #[test]
    fn opaque_roundtrip() {
        let dt = Datatype::Opaque(Opaque {
            size: 12,
            tag: "sensor blob".to_string(),
        });
        assert_eq!(roundtrip(&dt), dt);
    }

    #[test]
    fn compound_with_vlen_member() {
        let sizes = Sizes::new(8, 8);
        let dt = Datatype::compound(vec![
            ("id".to_string(), Datatype::int32()),
            ("name".to_string(), Datatype::vlen_string(sizes)),
            ("score".to_string(), Datatype::float64()),
        ]);
        assert_eq!(roundtrip(&dt), dt);
        assert!(dt.requires_global_heap());
        assert_eq!(dt.size(), 4 + 16 + 8);
        assert_eq!(
            dt.pretty(),
            "compound{id: int32, name: vlen(string), score: float64}"
        );
    }

    #[test]
    fn nested_compound_roundtrip() {
        let inner = Datatype::compound(vec![
            ("x".to_string(), Datatype::float32()),
            ("y".to_string(), Datatype::float32()),
        ]);
        let outer = Datatype::compound(vec![
            ("p".to_string(), inner),
            ("tag".to_string(), Datatype::ascii(8)),
        ]);
        assert_eq!(roundtrip(&outer), outer);
    }

    #[test]
    fn enumeration_roundtrip() {
        let dt = Datatype::Enumeration(Enumeration {
            size: 4,
            base: Box::new(Datatype::int32()),
            names: vec!["low".to_string(), "high".to_string()],
            values: vec![vec![0, 0, 0, 0], vec![1, 0, 0, 0]],
        });
        assert_eq!(roundtrip(&dt), dt);
    }

    #[test]
    fn array_roundtrip() {
        let dt = Datatype::Array(ArrayType {
            size: 24,
            dimensions: vec![2, 3],
            base: Box::new(Datatype::int32()),
        });
        assert_eq!(roundtrip(&dt), dt);
        assert_eq!(dt.pretty(), "int32[2, 3]");
    }

    #[test]
    fn canonical_encode_is_stable() {
        let sizes = Sizes::new(8, 8);
        let dt = Datatype::compound(vec![
            ("name".to_string(), Datatype::vlen_string(sizes)),
            ("value".to_string(), Datatype::int64()),
        ]);
        let once = dt.encode();
        let (_, reparsed) = datatype(&once).unwrap();
        assert_eq!(reparsed.encode(), once);
    }
}
