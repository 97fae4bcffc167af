//! Reading and writing whole object headers: the prefix, the message
//! region, and the continuation chain.

use nom::bytes::streaming::{tag, take};
use nom::error::context;
use nom::number::streaming::{le_u16, le_u32, le_u8};

use crate::codec::{self, Sizes};
use crate::error::{Hdf5Error, Result};
use crate::message::{
    header_message, HeaderMessage, Message, ObjectHeaderContinuation, FLAG_FAIL_ON_UNKNOWN,
};
use crate::parse_util::{pad8, PResult};

/// Size of the version 1 object header prefix, padding included.
pub const V1_PREFIX_SIZE: usize = 16;

#[derive(Debug)]
pub struct ObjectHeaderPrefix {
    pub version: u8,
    pub total_number_of_header_messages: u16,
    pub object_reference_count: u32,
    pub object_header_size: u32,
}

pub fn object_header_prefix(input: &[u8]) -> PResult<ObjectHeaderPrefix> {
    context("object header prefix", |input| {
        let (input, version) = le_u8(input)?;
        let (input, _) = tag([0])(input)?;
        let (input, total_number_of_header_messages) = le_u16(input)?;
        let (input, object_reference_count) = le_u32(input)?;
        let (input, object_header_size) = le_u32(input)?;
        // Pad to 8-byte alignment.
        let (input, _) = take(4usize)(input)?;
        Ok((
            input,
            ObjectHeaderPrefix {
                version,
                total_number_of_header_messages,
                object_reference_count,
                object_header_size,
            },
        ))
    })(input)
}

/// A fully read object header: the flattened message list across the whole
/// continuation chain.
#[derive(Debug)]
pub struct ObjectHeader {
    pub version: u8,
    pub reference_count: u32,
    pub messages: Vec<HeaderMessage>,
}

impl ObjectHeader {
    pub fn find<'a, T, F: Fn(&'a Message) -> Option<T>>(&'a self, pick: F) -> Option<T> {
        self.messages.iter().find_map(|m| pick(&m.body))
    }
}

/// Read the object header at `addr`, following the continuation chain.
///
/// The prefix's declared size covers only the first fragment; each
/// continuation is bounded by its own length and is self-contained.
pub fn read_object_header(contents: &[u8], addr: u64, sizes: Sizes) -> Result<ObjectHeader> {
    let start = addr as usize;
    if start >= contents.len() {
        return Err(Hdf5Error::TruncatedRead);
    }
    match contents[start] {
        1 => read_v1(contents, start, sizes),
        b'O' => read_v2(contents, start, sizes),
        other => Err(Hdf5Error::UnsupportedVersion(other)),
    }
}

fn read_v1(contents: &[u8], start: usize, sizes: Sizes) -> Result<ObjectHeader> {
    let (_, prefix) = object_header_prefix(&contents[start..])?;
    let mut messages = Vec::new();
    let mut fragments = vec![(
        start + V1_PREFIX_SIZE,
        prefix.object_header_size as usize,
    )];
    let mut fragment_index = 0;

    while fragment_index < fragments.len() {
        let (fragment_start, fragment_len) = fragments[fragment_index];
        fragment_index += 1;
        let end = fragment_start
            .checked_add(fragment_len)
            .filter(|end| *end <= contents.len())
            .ok_or(Hdf5Error::TruncatedRead)?;

        let mut region = &contents[fragment_start..end];
        while region.len() >= 8 {
            let (rest, message) = header_message(region, sizes)?;
            region = rest;
            if let Message::Unknown { message_type, .. } = &message.body {
                if message.flags & FLAG_FAIL_ON_UNKNOWN != 0 {
                    return Err(Hdf5Error::UnknownRequiredMessage(*message_type));
                }
            }
            if let Message::ObjectHeaderContinuation(ObjectHeaderContinuation {
                offset,
                length,
            }) = &message.body
            {
                fragments.push((*offset as usize, *length as usize));
            }
            messages.push(message);
        }
    }

    log::trace!(
        "object header v1 at {:#x}: {} messages, {} fragments",
        start,
        messages.len(),
        fragments.len()
    );
    Ok(ObjectHeader {
        version: 1,
        reference_count: prefix.object_reference_count,
        messages,
    })
}

/// Version 2 ("OHDR") headers appear in files with version 2/3 superblocks.
/// Read-only, like those superblocks.
fn read_v2(contents: &[u8], start: usize, sizes: Sizes) -> Result<ObjectHeader> {
    let input = &contents[start..];
    let (input, _) = tag::<_, _, nom::error::VerboseError<&[u8]>>(b"OHDR")(input)
        .map_err(|_| Hdf5Error::BadSignature)?;
    let (input, version) = le_u8::<nom::error::VerboseError<&[u8]>>(input)
        .map_err(|_| Hdf5Error::TruncatedRead)?;
    if version != 2 {
        return Err(Hdf5Error::UnsupportedVersion(version));
    }
    let (mut input, flags) =
        le_u8::<nom::error::VerboseError<&[u8]>>(input).map_err(|_| Hdf5Error::TruncatedRead)?;
    if flags & 0x20 != 0 {
        input = skip(input, 16)?; // access/mod/change/birth times
    }
    if flags & 0x10 != 0 {
        input = skip(input, 4)?; // compact/dense attribute phase change
    }
    let chunk_size_width = 1usize << (flags & 0x3);
    if input.len() < chunk_size_width {
        return Err(Hdf5Error::TruncatedRead);
    }
    let chunk0_size = codec::read_le(&input[..chunk_size_width]) as usize;
    let input = &input[chunk_size_width..];
    let tracked = flags & 0x04 != 0;

    let mut messages = Vec::new();
    let mut fragments = vec![(input, chunk0_size)];
    let mut queued: Vec<(usize, usize)> = Vec::new();
    loop {
        for (region, size) in fragments.drain(..) {
            if region.len() < size {
                return Err(Hdf5Error::TruncatedRead);
            }
            read_v2_fragment(&region[..size], sizes, tracked, &mut messages, &mut queued)?;
        }
        if queued.is_empty() {
            break;
        }
        for (offset, length) in queued.drain(..) {
            if length < 8 {
                return Err(Hdf5Error::TruncatedRead);
            }
            let end = offset
                .checked_add(length)
                .filter(|end| *end <= contents.len())
                .ok_or(Hdf5Error::TruncatedRead)?;
            let block = &contents[offset..end];
            if &block[..4] != b"OCHK" {
                return Err(Hdf5Error::BadSignature);
            }
            // Signature and trailing checksum bracket the messages.
            fragments.push((&block[4..], length - 8));
        }
    }

    Ok(ObjectHeader {
        version: 2,
        reference_count: 1,
        messages,
    })
}

fn read_v2_fragment(
    mut region: &[u8],
    sizes: Sizes,
    tracked: bool,
    messages: &mut Vec<HeaderMessage>,
    queued: &mut Vec<(usize, usize)>,
) -> Result<()> {
    // Version 2 message framing: 1-byte type, 2-byte size, 1-byte flags,
    // optional 2-byte creation order, unpadded data. A trailing gap smaller
    // than a minimal message header is legal.
    let overhead = if tracked { 6 } else { 4 };
    while region.len() > overhead {
        let message_type = u16::from(region[0]);
        let size = u16::from(region[1]) | u16::from(region[2]) << 8;
        let flags = region[3];
        let data_start = overhead;
        let data_end = data_start + size as usize;
        if data_end > region.len() {
            return Err(Hdf5Error::TruncatedRead);
        }
        let data = &region[data_start..data_end];
        let mut framed = Vec::with_capacity(8 + data.len());
        codec::push_u16(&mut framed, message_type);
        codec::push_u16(&mut framed, data.len() as u16);
        framed.push(flags);
        framed.extend_from_slice(&[0, 0, 0]);
        framed.extend_from_slice(data);
        let (_, message) = header_message(&framed, sizes)?;
        if let Message::Unknown { message_type, .. } = &message.body {
            if message.flags & FLAG_FAIL_ON_UNKNOWN != 0 {
                return Err(Hdf5Error::UnknownRequiredMessage(*message_type));
            }
        }
        if let Message::ObjectHeaderContinuation(c) = &message.body {
            queued.push((c.offset as usize, c.length as usize));
        }
        messages.push(message);
        region = &region[data_end..];
    }
    Ok(())
}

fn skip<'a>(input: &'a [u8], n: usize) -> Result<&'a [u8]> {
    if input.len() < n {
        return Err(Hdf5Error::TruncatedRead);
    }
    Ok(&input[n..])
}

// ---------------------------------------------------------------------------
// Write
// ---------------------------------------------------------------------------

/// Accumulates messages for one object header and serializes them into a
/// fixed slot, spilling into a continuation region when they do not fit.
/// Mutable until serialized; the continuation allocation is final.
#[derive(Debug, Default)]
pub struct ObjectHeaderBuilder {
    messages: Vec<HeaderMessage>,
    reference_count: u32,
}

/// Outcome of serializing a header: the bytes for the fixed slot and, when
/// the messages spilled, the continuation region.
#[derive(Debug)]
pub struct SerializedHeader {
    pub prefix_block: Vec<u8>,
    pub continuation: Option<(u64, Vec<u8>)>,
}

impl ObjectHeaderBuilder {
    pub fn new() -> Self {
        ObjectHeaderBuilder {
            messages: Vec::new(),
            reference_count: 1,
        }
    }

    pub fn push(&mut self, body: Message) {
        self.messages.push(HeaderMessage::new(body));
    }

    pub fn messages(&self) -> &[HeaderMessage] {
        &self.messages
    }

    /// Framed size of every message, before slot fitting.
    pub fn total_framed_size(&self, sizes: Sizes) -> usize {
        self.messages.iter().map(|m| m.framed_size(sizes)).sum()
    }

    /// Serialize into a slot of `capacity` bytes (prefix included).
    ///
    /// `alloc_continuation` is called with the byte size of the overflow
    /// region when one is needed and returns its file offset. All
    /// continuations are allocated before the caller finalizes end-of-file.
    pub fn serialize<F>(
        &self,
        sizes: Sizes,
        capacity: usize,
        alloc_continuation: F,
    ) -> Result<SerializedHeader>
    where
        F: FnOnce(u64) -> Result<u64>,
    {
        let data_capacity = capacity
            .checked_sub(V1_PREFIX_SIZE)
            .ok_or(Hdf5Error::BufferOverflowOnWrite)?;

        let framed_sizes: Vec<usize> = self
            .messages
            .iter()
            .map(|m| m.framed_size(sizes))
            .collect();
        let total: usize = framed_sizes.iter().sum();

        if total <= data_capacity {
            let block =
                self.emit_block(sizes, data_capacity, self.messages.len(), None)?;
            return Ok(SerializedHeader {
                prefix_block: block,
                continuation: None,
            });
        }

        // Spill: reserve room for the continuation message inside the slot,
        // pack a prefix of the message list there, and put the rest in a
        // fresh region.
        let continuation_framed = 8 + pad8(usize::from(sizes.offset) + usize::from(sizes.length));
        let budget = data_capacity
            .checked_sub(continuation_framed)
            .ok_or(Hdf5Error::BufferOverflowOnWrite)?;
        let mut in_slot = 0;
        let mut used = 0;
        for size in &framed_sizes {
            if used + size > budget {
                break;
            }
            used += size;
            in_slot += 1;
        }

        let overflow: usize = framed_sizes[in_slot..].iter().sum();
        let continuation_addr = alloc_continuation(overflow as u64)?;

        let block = self.emit_block(
            sizes,
            data_capacity,
            in_slot,
            Some(ObjectHeaderContinuation {
                offset: continuation_addr,
                length: overflow as u64,
            }),
        )?;

        let mut continuation_block = Vec::with_capacity(overflow);
        for message in &self.messages[in_slot..] {
            message.encode_framed(&mut continuation_block, sizes);
        }
        debug_assert_eq!(continuation_block.len(), overflow);

        Ok(SerializedHeader {
            prefix_block: block,
            continuation: Some((continuation_addr, continuation_block)),
        })
    }

    fn emit_block(
        &self,
        sizes: Sizes,
        data_capacity: usize,
        in_slot: usize,
        continuation: Option<ObjectHeaderContinuation>,
    ) -> Result<Vec<u8>> {
        let mut body = Vec::with_capacity(data_capacity);
        for message in &self.messages[..in_slot] {
            message.encode_framed(&mut body, sizes);
        }
        let mut count = in_slot as u16 + (self.messages.len() - in_slot) as u16;
        if let Some(continuation) = continuation {
            HeaderMessage::new(Message::ObjectHeaderContinuation(continuation))
                .encode_framed(&mut body, sizes);
            count += 1;
        }
        // Fill the slot's tail with a NIL message so the declared header
        // size equals the slot's data region.
        if body.len() < data_capacity {
            let gap = data_capacity - body.len();
            if gap < 8 {
                return Err(Hdf5Error::BufferOverflowOnWrite);
            }
            HeaderMessage::new(Message::Nil(gap - 8)).encode_framed(&mut body, sizes);
            count += 1;
        }
        if body.len() != data_capacity {
            return Err(Hdf5Error::BufferOverflowOnWrite);
        }

        let mut block = Vec::with_capacity(V1_PREFIX_SIZE + data_capacity);
        block.push(1); // version
        block.push(0);
        codec::push_u16(&mut block, count);
        codec::push_u32(&mut block, self.reference_count);
        codec::push_u32(&mut block, data_capacity as u32);
        codec::push_u32(&mut block, 0); // alignment pad
        block.extend_from_slice(&body);
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatype::Datatype;
    use crate::message::{Dataspace, ObjectModificationTime, SymbolTableMessage, MTYPE_NIL};

    const SIZES: Sizes = Sizes {
        offset: 8,
        length: 8,
    };

    fn types_of(header: &ObjectHeader) -> Vec<u16> {
        header
            .messages
            .iter()
            .map(|m| m.body.message_type())
            .collect()
    }

    #[test]
    fn header_fits_in_slot() {
        let mut builder = ObjectHeaderBuilder::new();
        builder.push(Message::Datatype(Datatype::int64()));
        builder.push(Message::Dataspace(Dataspace::scalar()));

        let serialized = builder
            .serialize(SIZES, 272, |_| panic!("no continuation expected"))
            .unwrap();
        assert_eq!(serialized.prefix_block.len(), 272);
        assert!(serialized.continuation.is_none());

        let header = read_object_header(&serialized.prefix_block, 0, SIZES).unwrap();
        // Datatype, dataspace, trailing NIL fill.
        assert_eq!(
            types_of(&header),
            vec![
                crate::message::MTYPE_DATATYPE,
                crate::message::MTYPE_DATASPACE,
                MTYPE_NIL
            ]
        );
    }

    #[test]
    fn header_spills_into_continuation() {
        let mut builder = ObjectHeaderBuilder::new();
        builder.push(Message::Datatype(Datatype::int64()));
        builder.push(Message::Dataspace(Dataspace::scalar()));
        for i in 0..8 {
            builder.push(Message::Attribute(crate::message::Attribute {
                name: format!("attribute_{}", i),
                datatype: Datatype::int64(),
                dataspace: Dataspace::scalar(),
                data: vec![i as u8; 8],
            }));
        }

        // Serialize into a 272-byte slot; attributes cannot all fit.
        let continuation_addr = 4096u64;
        let serialized = builder
            .serialize(SIZES, 272, |_| Ok(continuation_addr))
            .unwrap();
        let (addr, continuation_bytes) = serialized.continuation.expect("must spill");
        assert_eq!(addr, continuation_addr);

        // Reassemble a flat file image and re-read through the chain.
        let mut image = vec![0u8; continuation_addr as usize + continuation_bytes.len()];
        image[..272].copy_from_slice(&serialized.prefix_block);
        image[continuation_addr as usize..].copy_from_slice(&continuation_bytes);

        let header = read_object_header(&image, 0, SIZES).unwrap();
        let attribute_count = header
            .messages
            .iter()
            .filter(|m| m.body.message_type() == crate::message::MTYPE_ATTRIBUTE)
            .count();
        assert_eq!(attribute_count, 8);
    }

    #[test]
    fn fail_on_unknown_required_message() {
        let mut image = Vec::new();
        image.push(1);
        image.push(0);
        codec::push_u16(&mut image, 1);
        codec::push_u32(&mut image, 1);
        codec::push_u32(&mut image, 16);
        codec::push_u32(&mut image, 0);
        // One unknown message with the fail-on-unknown bit set.
        codec::push_u16(&mut image, 0x0099);
        codec::push_u16(&mut image, 8);
        image.push(FLAG_FAIL_ON_UNKNOWN);
        image.extend_from_slice(&[0, 0, 0]);
        image.extend_from_slice(&[0; 8]);

        match read_object_header(&image, 0, SIZES) {
            Err(Hdf5Error::UnknownRequiredMessage(0x0099)) => {}
            other => panic!("expected UnknownRequiredMessage, got {:?}", other),
        }
    }

    #[test]
    fn roundtrip_message_lists() {
        let mut builder = ObjectHeaderBuilder::new();
        builder.push(Message::SymbolTable(SymbolTableMessage {
            btree_address: 136,
            local_heap_address: 680,
        }));
        builder.push(Message::ObjectModificationTime(ObjectModificationTime {
            seconds_after_unix_epoch: 1_700_000_000,
        }));
        let serialized = builder.serialize(SIZES, 96, |_| unreachable!()).unwrap();
        let header = read_object_header(&serialized.prefix_block, 0, SIZES).unwrap();
        match &header.messages[0].body {
            Message::SymbolTable(m) => assert_eq!(m.btree_address, 136),
            other => panic!("wrong message: {:?}", other),
        }
        match &header.messages[1].body {
            Message::ObjectModificationTime(m) => {
                assert_eq!(m.seconds_after_unix_epoch, 1_700_000_000)
            }
            other => panic!("wrong message: {:?}", other),
        }
    }
}
