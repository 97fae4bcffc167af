//! Typed cells: decoding raw dataset bytes into host values and encoding
//! host values back into cells.
//!
//! The engine exposes raw typed cells and iterators only; mapping compound
//! rows onto user structs happens through a caller-registered
//! `RecordMapper`, never through reflection.

use crate::codec::{self, ByteOrder, IntCodec};
use crate::datatype::{
    Compound, Datatype, FixedPoint, FloatingPoint, StringPad, StringType, VlenKind,
};
use crate::error::{Hdf5Error, Result};

/// Resolves (collection address, object index) pairs against the global
/// heap. The read path implements this over its collection cache.
pub trait HeapSource {
    fn object(&mut self, address: u64, index: u16) -> Result<Vec<u8>>;
}

/// Accepts variable-length payloads on the write path and hands back the
/// (collection address, object index) pair to embed in the cell.
pub trait HeapSink {
    fn put_object(&mut self, bytes: &[u8]) -> Result<(u64, u16)>;
}

/// For datatypes that never touch the global heap.
pub struct NoHeap;

impl HeapSource for NoHeap {
    fn object(&mut self, _address: u64, _index: u16) -> Result<Vec<u8>> {
        Err(Hdf5Error::TypeMismatch(
            "datatype does not use the global heap".to_string(),
        ))
    }
}

impl HeapSink for NoHeap {
    fn put_object(&mut self, _bytes: &[u8]) -> Result<(u64, u16)> {
        Err(Hdf5Error::TypeMismatch(
            "datatype does not use the global heap".to_string(),
        ))
    }
}

/// One decoded cell.
#[derive(Debug, Clone, PartialEq)]
pub enum DataCell {
    Signed(i64),
    Unsigned(u64),
    Float32(f32),
    Float64(f64),
    Str(String),
    Bytes(Vec<u8>),
    Compound(Vec<(String, DataCell)>),
    Sequence(Vec<DataCell>),
    /// A resolved object reference: the target's object header address.
    Reference(u64),
    Enum(String),
}

impl DataCell {
    pub fn as_i64(&self) -> Result<i64> {
        match self {
            DataCell::Signed(v) => Ok(*v),
            DataCell::Unsigned(v) => Ok(*v as i64),
            other => Err(Hdf5Error::TypeMismatch(format!(
                "expected integer cell, found {:?}",
                other
            ))),
        }
    }

    pub fn as_f64(&self) -> Result<f64> {
        match self {
            DataCell::Float64(v) => Ok(*v),
            DataCell::Float32(v) => Ok(f64::from(*v)),
            other => Err(Hdf5Error::TypeMismatch(format!(
                "expected float cell, found {:?}",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> Result<&str> {
        match self {
            DataCell::Str(s) => Ok(s),
            DataCell::Enum(s) => Ok(s),
            other => Err(Hdf5Error::TypeMismatch(format!(
                "expected string cell, found {:?}",
                other
            ))),
        }
    }
}

fn int_codec(t: &FixedPoint) -> Result<IntCodec> {
    if t.size > 8 {
        return Err(Hdf5Error::PrecisionExceedsWidth);
    }
    IntCodec {
        lo_pad: t.lo_pad,
        hi_pad: t.hi_pad,
        ..IntCodec::new(t.size as u8, t.signed, t.order)
    }
    .with_bits(
        i32::from(t.bit_offset),
        if u32::from(t.bit_precision) == t.size * 8 {
            0
        } else {
            i32::from(t.bit_precision)
        },
    )
}

enum FloatLayout {
    Ieee32,
    Ieee64,
}

fn float_layout(t: &FloatingPoint) -> Result<FloatLayout> {
    match (t.size, t.exponent_size, t.mantissa_size) {
        (4, 8, 23) => Ok(FloatLayout::Ieee32),
        (8, 11, 52) => Ok(FloatLayout::Ieee64),
        _ => Err(Hdf5Error::TypeMismatch(format!(
            "non-IEEE floating point layout: {} byte, {}-bit exponent, {}-bit mantissa",
            t.size, t.exponent_size, t.mantissa_size
        ))),
    }
}

fn read_ordered(bytes: &[u8], order: ByteOrder) -> u64 {
    match order {
        ByteOrder::Little => codec::read_le(bytes),
        ByteOrder::Big => {
            let mut value = 0u64;
            for b in bytes {
                value = value << 8 | u64::from(*b);
            }
            value
        }
    }
}

fn decode_string(bytes: &[u8], t: &StringType) -> String {
    let end = match t.padding {
        StringPad::NullTerminate | StringPad::NullPad => bytes
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(bytes.len()),
        StringPad::SpacePad => bytes
            .iter()
            .rposition(|b| *b != b' ')
            .map(|i| i + 1)
            .unwrap_or(0),
    };
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

impl Datatype {
    /// Decode one in-file element into a cell. Variable-length cells pull
    /// their payload from `heap`.
    pub fn decode_cell(&self, bytes: &[u8], heap: &mut dyn HeapSource) -> Result<DataCell> {
        if bytes.len() < self.size() as usize {
            return Err(Hdf5Error::TruncatedRead);
        }
        let bytes = &bytes[..self.size() as usize];
        match self {
            Datatype::FixedPoint(t) => {
                let codec = int_codec(t)?;
                if t.signed {
                    Ok(DataCell::Signed(codec.decode_signed(bytes)?))
                } else {
                    Ok(DataCell::Unsigned(codec.decode(bytes)?))
                }
            }
            Datatype::FloatingPoint(t) => {
                let raw = read_ordered(bytes, t.order);
                match float_layout(t)? {
                    FloatLayout::Ieee32 => Ok(DataCell::Float32(f32::from_bits(raw as u32))),
                    FloatLayout::Ieee64 => Ok(DataCell::Float64(f64::from_bits(raw))),
                }
            }
            Datatype::Time(t) => Ok(DataCell::Unsigned(read_ordered(bytes, t.order))),
            Datatype::String(t) => Ok(DataCell::Str(decode_string(bytes, t))),
            Datatype::BitField(t) => {
                let codec = IntCodec {
                    lo_pad: t.lo_pad,
                    hi_pad: t.hi_pad,
                    ..IntCodec::new(t.size as u8, false, t.order)
                }
                .with_bits(
                    i32::from(t.bit_offset),
                    if u32::from(t.bit_precision) == t.size * 8 {
                        0
                    } else {
                        i32::from(t.bit_precision)
                    },
                )?;
                Ok(DataCell::Unsigned(codec.decode(bytes)?))
            }
            Datatype::Opaque(_) => Ok(DataCell::Bytes(bytes.to_vec())),
            Datatype::Compound(t) => {
                let mut members = Vec::with_capacity(t.members.len());
                for member in &t.members {
                    let start = member.byte_offset as usize;
                    let repeat: u64 = member.dimensions.iter().map(|d| u64::from(*d)).product();
                    let element = member.datatype.size() as usize;
                    if start + element * repeat.max(1) as usize > bytes.len() {
                        return Err(Hdf5Error::TruncatedRead);
                    }
                    if repeat <= 1 {
                        let cell = member
                            .datatype
                            .decode_cell(&bytes[start..start + element], heap)?;
                        members.push((member.name.clone(), cell));
                    } else {
                        let mut cells = Vec::with_capacity(repeat as usize);
                        for i in 0..repeat as usize {
                            let slice = &bytes[start + i * element..start + (i + 1) * element];
                            cells.push(member.datatype.decode_cell(slice, heap)?);
                        }
                        members.push((member.name.clone(), DataCell::Sequence(cells)));
                    }
                }
                Ok(DataCell::Compound(members))
            }
            Datatype::Reference(t) => {
                Ok(DataCell::Reference(codec::read_le(&bytes[..t.size as usize])))
            }
            Datatype::Enumeration(t) => {
                let raw = &bytes[..t.base.size() as usize];
                match t.values.iter().position(|v| v == raw) {
                    Some(i) => Ok(DataCell::Enum(t.names[i].clone())),
                    None => t.base.decode_cell(raw, heap),
                }
            }
            Datatype::VariableLength(t) => {
                let (count, address, index) = split_vlen_cell(bytes, t.size)?;
                let payload = heap.object(address, index)?;
                match t.kind {
                    VlenKind::String => {
                        let take = std::cmp::min(count as usize, payload.len());
                        Ok(DataCell::Str(
                            String::from_utf8_lossy(&payload[..take]).into_owned(),
                        ))
                    }
                    VlenKind::Sequence => {
                        let element = t.base.size() as usize;
                        let mut cells = Vec::with_capacity(count as usize);
                        for i in 0..count as usize {
                            let start = i * element;
                            if start + element > payload.len() {
                                return Err(Hdf5Error::TruncatedRead);
                            }
                            cells.push(
                                t.base.decode_cell(&payload[start..start + element], heap)?,
                            );
                        }
                        Ok(DataCell::Sequence(cells))
                    }
                }
            }
            Datatype::Array(t) => {
                let repeat: u64 = t.dimensions.iter().map(|d| u64::from(*d)).product();
                let element = t.base.size() as usize;
                if element * repeat as usize > bytes.len() {
                    return Err(Hdf5Error::TruncatedRead);
                }
                let mut cells = Vec::with_capacity(repeat as usize);
                for i in 0..repeat as usize {
                    cells.push(
                        t.base
                            .decode_cell(&bytes[i * element..(i + 1) * element], heap)?,
                    );
                }
                Ok(DataCell::Sequence(cells))
            }
        }
    }

    /// Encode one cell into its in-file form. Variable-length payloads go
    /// through `heap`.
    pub fn encode_cell(&self, cell: &DataCell, heap: &mut dyn HeapSink) -> Result<Vec<u8>> {
        let size = self.size() as usize;
        let mut out = vec![0u8; size];
        match (self, cell) {
            (Datatype::FixedPoint(t), cell) => {
                let codec = int_codec(t)?;
                let value = match cell {
                    DataCell::Signed(v) => *v as u64,
                    DataCell::Unsigned(v) => *v,
                    other => {
                        return Err(Hdf5Error::TypeMismatch(format!(
                            "cannot encode {:?} as {}",
                            other,
                            self.pretty()
                        )))
                    }
                };
                codec.encode(value, &mut out)?;
            }
            (Datatype::FloatingPoint(t), cell) => {
                let raw = match (float_layout(t)?, cell) {
                    (FloatLayout::Ieee32, DataCell::Float32(v)) => u64::from(v.to_bits()),
                    (FloatLayout::Ieee64, DataCell::Float64(v)) => v.to_bits(),
                    (FloatLayout::Ieee64, DataCell::Float32(v)) => f64::from(*v).to_bits(),
                    _ => {
                        return Err(Hdf5Error::TypeMismatch(format!(
                            "cannot encode {:?} as {}",
                            cell,
                            self.pretty()
                        )))
                    }
                };
                write_ordered(&mut out, raw, t.order);
            }
            (Datatype::String(t), DataCell::Str(s)) => {
                let bytes = s.as_bytes();
                if bytes.len() > size {
                    return Err(Hdf5Error::BufferOverflowOnWrite);
                }
                out[..bytes.len()].copy_from_slice(bytes);
                if t.padding == StringPad::SpacePad {
                    for b in &mut out[bytes.len()..] {
                        *b = b' ';
                    }
                }
            }
            (Datatype::Opaque(_), DataCell::Bytes(bytes)) => {
                if bytes.len() > size {
                    return Err(Hdf5Error::BufferOverflowOnWrite);
                }
                out[..bytes.len()].copy_from_slice(bytes);
            }
            (Datatype::Compound(t), DataCell::Compound(members)) => {
                encode_compound(t, members, &mut out, heap)?;
            }
            (Datatype::Reference(t), cell) => {
                let address = match cell {
                    DataCell::Reference(a) => *a,
                    DataCell::Unsigned(a) => *a,
                    other => {
                        return Err(Hdf5Error::TypeMismatch(format!(
                            "cannot encode {:?} as reference",
                            other
                        )))
                    }
                };
                let mut buf = Vec::with_capacity(t.size as usize);
                codec::write_le(&mut buf, address, t.size.min(8) as u8);
                buf.resize(out.len(), 0);
                out.copy_from_slice(&buf);
            }
            (Datatype::Enumeration(t), DataCell::Enum(name)) => {
                let i = t
                    .names
                    .iter()
                    .position(|n| n == name)
                    .ok_or_else(|| {
                        Hdf5Error::TypeMismatch(format!("no enum member named {}", name))
                    })?;
                if t.values[i].len() != out.len() {
                    return Err(Hdf5Error::BufferOverflowOnWrite);
                }
                out.copy_from_slice(&t.values[i]);
            }
            (Datatype::Enumeration(t), cell) => {
                let encoded = t.base.encode_cell(cell, heap)?;
                if encoded.len() != out.len() {
                    return Err(Hdf5Error::BufferOverflowOnWrite);
                }
                out.copy_from_slice(&encoded);
            }
            (Datatype::VariableLength(t), cell) => {
                let (count, payload) = match (t.kind, cell) {
                    (VlenKind::String, DataCell::Str(s)) => {
                        (s.len() as u32, s.as_bytes().to_vec())
                    }
                    (VlenKind::Sequence, DataCell::Sequence(cells)) => {
                        let mut payload = Vec::new();
                        for element in cells {
                            payload.extend_from_slice(&t.base.encode_cell(element, heap)?);
                        }
                        (cells.len() as u32, payload)
                    }
                    _ => {
                        return Err(Hdf5Error::TypeMismatch(format!(
                            "cannot encode {:?} as {}",
                            cell,
                            self.pretty()
                        )))
                    }
                };
                let (address, index) = heap.put_object(&payload)?;
                join_vlen_cell(&mut out, t.size, count, address, index);
            }
            (Datatype::Array(t), DataCell::Sequence(cells)) => {
                let element = t.base.size() as usize;
                if cells.len() * element > out.len() {
                    return Err(Hdf5Error::BufferOverflowOnWrite);
                }
                for (i, cell) in cells.iter().enumerate() {
                    let encoded = t.base.encode_cell(cell, heap)?;
                    out[i * element..(i + 1) * element].copy_from_slice(&encoded);
                }
            }
            (Datatype::Time(t), cell) => {
                let value = match cell {
                    DataCell::Unsigned(v) => *v,
                    DataCell::Signed(v) => *v as u64,
                    other => {
                        return Err(Hdf5Error::TypeMismatch(format!(
                            "cannot encode {:?} as {}",
                            other,
                            self.pretty()
                        )))
                    }
                };
                write_ordered(&mut out, value, t.order);
            }
            (Datatype::BitField(_), DataCell::Unsigned(v)) => {
                let mut buf = Vec::with_capacity(size);
                codec::write_le(&mut buf, *v, size as u8);
                out.copy_from_slice(&buf);
            }
            (_, other) => {
                return Err(Hdf5Error::TypeMismatch(format!(
                    "cannot encode {:?} as {}",
                    other,
                    self.pretty()
                )))
            }
        }
        Ok(out)
    }
}

fn encode_compound(
    t: &Compound,
    members: &[(String, DataCell)],
    out: &mut [u8],
    heap: &mut dyn HeapSink,
) -> Result<()> {
    for member in &t.members {
        let cell = members
            .iter()
            .find(|(name, _)| *name == member.name)
            .map(|(_, cell)| cell)
            .ok_or_else(|| {
                Hdf5Error::TypeMismatch(format!("missing compound member {}", member.name))
            })?;
        let start = member.byte_offset as usize;
        let element = member.datatype.size() as usize;
        let repeat: u64 = member.dimensions.iter().map(|d| u64::from(*d)).product();
        if repeat <= 1 {
            let encoded = member.datatype.encode_cell(cell, heap)?;
            out[start..start + element].copy_from_slice(&encoded);
        } else {
            let cells = match cell {
                DataCell::Sequence(cells) => cells,
                other => {
                    return Err(Hdf5Error::TypeMismatch(format!(
                        "member {} expects a sequence, found {:?}",
                        member.name, other
                    )))
                }
            };
            for (i, cell) in cells.iter().enumerate() {
                let encoded = member.datatype.encode_cell(cell, heap)?;
                out[start + i * element..start + (i + 1) * element].copy_from_slice(&encoded);
            }
        }
    }
    Ok(())
}

/// A variable-length cell is (4-byte count, collection address, 4-byte
/// index); the address width is whatever remains of the declared size.
fn split_vlen_cell(bytes: &[u8], cell_size: u32) -> Result<(u32, u64, u16)> {
    let address_len = cell_size
        .checked_sub(8)
        .ok_or(Hdf5Error::TruncatedRead)? as usize;
    let count = codec::read_le(&bytes[..4]) as u32;
    let address = codec::read_le(&bytes[4..4 + address_len]);
    let index = codec::read_le(&bytes[4 + address_len..8 + address_len]) as u16;
    Ok((count, address, index))
}

fn join_vlen_cell(out: &mut [u8], cell_size: u32, count: u32, address: u64, index: u16) {
    let address_len = (cell_size - 8) as usize;
    let mut buf = Vec::with_capacity(cell_size as usize);
    codec::push_u32(&mut buf, count);
    codec::write_le(&mut buf, address, address_len as u8);
    codec::push_u32(&mut buf, u32::from(index));
    out.copy_from_slice(&buf);
}

fn write_ordered(out: &mut [u8], value: u64, order: ByteOrder) {
    let width = out.len();
    match order {
        ByteOrder::Little => {
            for (i, b) in out.iter_mut().enumerate() {
                *b = (value >> (8 * i as u32)) as u8;
            }
        }
        ByteOrder::Big => {
            for (i, b) in out.iter_mut().enumerate() {
                *b = (value >> (8 * (width - 1 - i) as u32)) as u8;
            }
        }
    }
}

/// Iterator over the cells of a contiguous dataset region.
pub struct DataCursor<'a, H> {
    bytes: &'a [u8],
    datatype: &'a Datatype,
    heap: H,
    index: usize,
    count: usize,
}

impl<'a, H: HeapSource> DataCursor<'a, H> {
    pub fn new(bytes: &'a [u8], datatype: &'a Datatype, count: usize, heap: H) -> Self {
        DataCursor {
            bytes,
            datatype,
            heap,
            index: 0,
            count,
        }
    }
}

impl<'a, H: HeapSource> Iterator for DataCursor<'a, H> {
    type Item = Result<DataCell>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.count {
            return None;
        }
        let element = self.datatype.size() as usize;
        let start = self.index * element;
        self.index += 1;
        if start + element > self.bytes.len() {
            return Some(Err(Hdf5Error::TruncatedRead));
        }
        Some(
            self.datatype
                .decode_cell(&self.bytes[start..start + element], &mut self.heap),
        )
    }
}

/// Caller-registered projection from compound rows to a host type: a
/// (field name -> setter) table plus a constructor. The engine iterates
/// members in declared order and invokes the matching setter.
pub struct RecordMapper<T> {
    construct: fn() -> T,
    fields: Vec<(&'static str, fn(&mut T, &DataCell) -> Result<()>)>,
}

impl<T> RecordMapper<T> {
    pub fn new(construct: fn() -> T) -> Self {
        RecordMapper {
            construct,
            fields: Vec::new(),
        }
    }

    pub fn field(
        mut self,
        name: &'static str,
        set: fn(&mut T, &DataCell) -> Result<()>,
    ) -> Self {
        self.fields.push((name, set));
        self
    }

    /// Build one record from a decoded compound cell. Members with no
    /// registered setter are skipped.
    pub fn apply(&self, cell: &DataCell) -> Result<T> {
        let members = match cell {
            DataCell::Compound(members) => members,
            other => {
                return Err(Hdf5Error::TypeMismatch(format!(
                    "record mapper expects compound cells, found {:?}",
                    other
                )))
            }
        };
        let mut record = (self.construct)();
        for (name, value) in members {
            if let Some((_, set)) = self.fields.iter().find(|(n, _)| n == name) {
                set(&mut record, value)?;
            }
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Sizes;
    use std::collections::HashMap;

    /// In-memory heap standing in for the file-backed global heap.
    #[derive(Default)]
    struct TestHeap {
        objects: HashMap<(u64, u16), Vec<u8>>,
        next_index: u16,
    }

    impl HeapSource for TestHeap {
        fn object(&mut self, address: u64, index: u16) -> Result<Vec<u8>> {
            self.objects
                .get(&(address, index))
                .cloned()
                .ok_or(Hdf5Error::HeapIdOutOfRange)
        }
    }

    impl HeapSink for TestHeap {
        fn put_object(&mut self, bytes: &[u8]) -> Result<(u64, u16)> {
            self.next_index += 1;
            self.objects
                .insert((4096, self.next_index), bytes.to_vec());
            Ok((4096, self.next_index))
        }
    }

    #[test]
    fn int64_roundtrip() {
        let dt = Datatype::int64();
        let bytes = dt
            .encode_cell(&DataCell::Signed(-42), &mut NoHeap)
            .unwrap();
        assert_eq!(bytes.len(), 8);
        let cell = dt.decode_cell(&bytes, &mut NoHeap).unwrap();
        assert_eq!(cell, DataCell::Signed(-42));
        assert_eq!(cell.as_i64().unwrap(), -42);
    }

    #[test]
    fn scalar_int_little_endian_bytes() {
        let dt = Datatype::int64();
        let bytes = dt.encode_cell(&DataCell::Signed(42), &mut NoHeap).unwrap();
        assert_eq!(bytes, vec![0x2A, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn float_roundtrip() {
        let dt = Datatype::float64();
        let bytes = dt
            .encode_cell(&DataCell::Float64(1.25), &mut NoHeap)
            .unwrap();
        let cell = dt.decode_cell(&bytes, &mut NoHeap).unwrap();
        assert_eq!(cell, DataCell::Float64(1.25));
    }

    #[test]
    fn fixed_string_padding() {
        let dt = Datatype::ascii(8);
        let bytes = dt
            .encode_cell(&DataCell::Str("abc".to_string()), &mut NoHeap)
            .unwrap();
        assert_eq!(&bytes, b"abc\0\0\0\0\0");
        let cell = dt.decode_cell(&bytes, &mut NoHeap).unwrap();
        assert_eq!(cell, DataCell::Str("abc".to_string()));
    }

    #[test]
    fn vlen_string_through_heap() {
        let sizes = Sizes::new(8, 8);
        let dt = Datatype::vlen_string(sizes);
        let mut heap = TestHeap::default();
        let bytes = dt
            .encode_cell(&DataCell::Str("variable length".to_string()), &mut heap)
            .unwrap();
        assert_eq!(bytes.len(), 16);
        let cell = dt.decode_cell(&bytes, &mut heap).unwrap();
        assert_eq!(cell, DataCell::Str("variable length".to_string()));
    }

    #[test]
    fn compound_with_vlen_roundtrip() {
        let sizes = Sizes::new(8, 8);
        let dt = Datatype::compound(vec![
            ("id".to_string(), Datatype::int32()),
            ("name".to_string(), Datatype::vlen_string(sizes)),
        ]);
        let mut heap = TestHeap::default();
        let row = DataCell::Compound(vec![
            ("id".to_string(), DataCell::Signed(7)),
            ("name".to_string(), DataCell::Str("seven".to_string())),
        ]);
        let bytes = dt.encode_cell(&row, &mut heap).unwrap();
        let cell = dt.decode_cell(&bytes, &mut heap).unwrap();
        assert_eq!(cell, row);
    }

    #[test]
    fn enum_maps_names() {
        let dt = Datatype::Enumeration(crate::datatype::Enumeration {
            size: 4,
            base: Box::new(Datatype::int32()),
            names: vec!["off".to_string(), "on".to_string()],
            values: vec![vec![0, 0, 0, 0], vec![1, 0, 0, 0]],
        });
        let bytes = dt
            .encode_cell(&DataCell::Enum("on".to_string()), &mut NoHeap)
            .unwrap();
        assert_eq!(bytes, vec![1, 0, 0, 0]);
        let cell = dt.decode_cell(&bytes, &mut NoHeap).unwrap();
        assert_eq!(cell, DataCell::Enum("on".to_string()));
    }

    #[test]
    fn cursor_iterates_in_order() {
        let dt = Datatype::int32();
        let mut bytes = Vec::new();
        for v in &[5i32, 6, 7] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        let cells: Vec<DataCell> = DataCursor::new(&bytes, &dt, 3, NoHeap)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(
            cells,
            vec![
                DataCell::Signed(5),
                DataCell::Signed(6),
                DataCell::Signed(7)
            ]
        );
    }

    #[test]
    fn record_mapper_projects_members() {
        #[derive(Default, Debug, PartialEq)]
        struct Sample {
            id: i64,
            score: f64,
        }

        let mapper = RecordMapper::new(Sample::default)
            .field("id", |r, c| {
                r.id = c.as_i64()?;
                Ok(())
            })
            .field("score", |r, c| {
                r.score = c.as_f64()?;
                Ok(())
            });

        let row = DataCell::Compound(vec![
            ("id".to_string(), DataCell::Signed(3)),
            ("score".to_string(), DataCell::Float64(0.5)),
            ("ignored".to_string(), DataCell::Unsigned(9)),
        ]);
        assert_eq!(
            mapper.apply(&row).unwrap(),
            Sample { id: 3, score: 0.5 }
        );
    }
}
