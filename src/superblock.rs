//! The superblock: root metadata block at the start of the file.
//!
//! Versions 0 and 1 are fully supported for read and write; versions 2 and 3
//! are accepted read-only. Everything outside {0, 1, 2, 3} is rejected.

use nom::bytes::streaming::take;
use nom::error::context;
use nom::number::streaming::{le_u16, le_u32, le_u8};

use crate::btree::{symbol_table_entry, SymbolTableEntry};
use crate::codec::{self, Sizes};
use crate::error::{Hdf5Error, Result};
use crate::parse_util::{address, PResult};

pub const SIGNATURE: &[u8; 8] = b"\x89\x48\x44\x46\x0d\x0a\x1a\x0a";

/// Encoded size of a version 0 superblock with 8-byte offsets.
pub const V0_ENCODED_SIZE: u64 = 96;

#[derive(Debug, Clone)]
pub struct Superblock {
    pub version: u8,
    pub offset_size: u8,
    pub length_size: u8,
    pub group_leaf_node_k: u16,
    pub group_internal_node_k: u16,
    pub file_consistency_flags: u32,
    pub base_address: u64,
    pub address_of_file_free_space_info: u64,
    pub end_of_file_address: u64,
    pub driver_information_block_address: u64,
    pub root: RootLocation,
}

/// Where the root group lives. Version 0/1 superblocks carry an inline
/// symbol-table entry whose scratch pad caches the B-tree and local-heap
/// addresses; version 2/3 name only the root object header.
#[derive(Debug, Clone)]
pub enum RootLocation {
    Entry(SymbolTableEntry),
    HeaderAddress(u64),
}

impl Superblock {
    /// Fresh version-0 superblock for a file being created. Addresses are
    /// filled in at flush time.
    pub fn for_write(offset_size: u8, length_size: u8, leaf_k: u16, internal_k: u16) -> Self {
        Superblock {
            version: 0,
            offset_size,
            length_size,
            group_leaf_node_k: leaf_k,
            group_internal_node_k: internal_k,
            file_consistency_flags: 0,
            base_address: 0,
            address_of_file_free_space_info: codec::undefined(offset_size),
            end_of_file_address: 0,
            driver_information_block_address: codec::undefined(offset_size),
            root: RootLocation::Entry(SymbolTableEntry::empty(offset_size)),
        }
    }

    pub fn sizes(&self) -> Sizes {
        Sizes::new(self.offset_size, self.length_size)
    }

    pub fn root_object_header_address(&self) -> u64 {
        match &self.root {
            RootLocation::Entry(entry) => entry.object_header_address,
            RootLocation::HeaderAddress(addr) => *addr,
        }
    }

    /// Decode the superblock at the start of `input`.
    pub fn read(input: &[u8]) -> Result<Superblock> {
        if input.len() < 9 {
            return Err(Hdf5Error::TruncatedRead);
        }
        if &input[..8] != SIGNATURE {
            return Err(Hdf5Error::BadSignature);
        }
        let version = input[8];
        if version <= 1 {
            if input.len() < 16 {
                return Err(Hdf5Error::TruncatedRead);
            }
            if input[9] != 0 || input[11] != 0 || input[15] != 0 {
                return Err(Hdf5Error::ReservedBitsViolated);
            }
        }
        let (_, superblock) = match version {
            0 | 1 => superblock_v0(&input[8..])?,
            2 | 3 => superblock_v2(&input[8..])?,
            other => return Err(Hdf5Error::UnsupportedVersion(other)),
        };
        log::debug!(
            "superblock v{}: offset size {}, length size {}, eof {}",
            superblock.version,
            superblock.offset_size,
            superblock.length_size,
            superblock.end_of_file_address
        );
        Ok(superblock)
    }

    /// Serialize a version 0 superblock. Writing other versions is out of
    /// scope and rejected.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.version != 0 {
            return Err(Hdf5Error::UnsupportedVersion(self.version));
        }
        let entry = match &self.root {
            RootLocation::Entry(entry) => entry,
            RootLocation::HeaderAddress(_) => {
                return Err(Hdf5Error::UnsupportedVersion(self.version))
            }
        };
        let mut out = Vec::with_capacity(V0_ENCODED_SIZE as usize);
        out.extend_from_slice(SIGNATURE);
        out.push(0); // superblock version
        out.push(0); // free space storage version
        out.push(0); // root group symbol table entry version
        out.push(0); // reserved
        out.push(0); // shared header message format version
        out.push(self.offset_size);
        out.push(self.length_size);
        out.push(0); // reserved
        codec::push_u16(&mut out, self.group_leaf_node_k);
        codec::push_u16(&mut out, self.group_internal_node_k);
        codec::push_u32(&mut out, self.file_consistency_flags);
        codec::write_le(&mut out, self.base_address, self.offset_size);
        codec::write_le(
            &mut out,
            self.address_of_file_free_space_info,
            self.offset_size,
        );
        codec::write_le(&mut out, self.end_of_file_address, self.offset_size);
        codec::write_le(
            &mut out,
            self.driver_information_block_address,
            self.offset_size,
        );
        entry.encode(&mut out, self.offset_size);
        Ok(out)
    }
}

/// Version 0/1 body, after the signature. The version byte is re-read so the
/// parser sees the same layout the format document describes.
fn superblock_v0(input: &[u8]) -> PResult<Superblock> {
    context("superblock v0", |input| {
        let (input, version) = le_u8(input)?;
        let (input, free_space_storage_version) = le_u8(input)?;
        let (input, _root_group_version) = le_u8(input)?;
        let (input, reserved0) = le_u8(input)?;
        let (input, _shared_header_version) = le_u8(input)?;
        let (input, offset_size) = le_u8(input)?;
        let (input, length_size) = le_u8(input)?;
        let (input, reserved1) = le_u8(input)?;
        let (input, group_leaf_node_k) = le_u16(input)?;
        let (input, group_internal_node_k) = le_u16(input)?;
        let (input, file_consistency_flags) = le_u32(input)?;
        let (input, _indexed_storage_k) = if version == 1 {
            let (input, k) = le_u16(input)?;
            let (input, _reserved) = le_u16(input)?;
            (input, k)
        } else {
            (input, 0)
        };
        if free_space_storage_version != 0 || reserved0 != 0 || reserved1 != 0 {
            return Err(reserved_failure(input));
        }
        let (input, base_address) = address(offset_size)(input)?;
        let (input, address_of_file_free_space_info) = address(offset_size)(input)?;
        let (input, end_of_file_address) = address(offset_size)(input)?;
        let (input, driver_information_block_address) = address(offset_size)(input)?;
        let (input, entry) = symbol_table_entry(input, offset_size)?;

        Ok((
            input,
            Superblock {
                version,
                offset_size,
                length_size,
                group_leaf_node_k,
                group_internal_node_k,
                file_consistency_flags,
                base_address,
                address_of_file_free_space_info,
                end_of_file_address,
                driver_information_block_address,
                root: RootLocation::Entry(entry),
            },
        ))
    })(input)
}

/// Version 2/3 body: fixed widths up front, then four addresses and a
/// checksum. Read-only.
fn superblock_v2(input: &[u8]) -> PResult<Superblock> {
    context("superblock v2", |input| {
        let (input, version) = le_u8(input)?;
        let (input, offset_size) = le_u8(input)?;
        let (input, length_size) = le_u8(input)?;
        let (input, file_consistency_flags) = le_u8(input)?;
        let (input, base_address) = address(offset_size)(input)?;
        let (input, _superblock_extension_address) = address(offset_size)(input)?;
        let (input, end_of_file_address) = address(offset_size)(input)?;
        let (input, root_header_address) = address(offset_size)(input)?;
        let (input, _checksum) = take(4usize)(input)?;

        Ok((
            input,
            Superblock {
                version,
                offset_size,
                length_size,
                // v2 files carry no B-tree K values; the library defaults
                // apply if such a file ever reaches the v1 group machinery.
                group_leaf_node_k: 4,
                group_internal_node_k: 16,
                file_consistency_flags: u32::from(file_consistency_flags),
                base_address,
                address_of_file_free_space_info: codec::undefined(offset_size),
                end_of_file_address,
                driver_information_block_address: codec::undefined(offset_size),
                root: RootLocation::HeaderAddress(root_header_address),
            },
        ))
    })(input)
}

fn reserved_failure(input: &[u8]) -> nom::Err<nom::error::VerboseError<&[u8]>> {
    nom::Err::Failure(nom::error::VerboseError {
        errors: vec![(
            input,
            nom::error::VerboseErrorKind::Context("reserved byte nonzero"),
        )],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_v0() -> Vec<u8> {
        let mut superblock = Superblock::for_write(8, 8, 4, 16);
        superblock.end_of_file_address = 2056;
        if let RootLocation::Entry(entry) = &mut superblock.root {
            entry.object_header_address = 96;
            entry.cache_type = 1;
            entry.address_of_btree = 136;
            entry.address_of_name_heap = 680;
        }
        superblock.encode().unwrap()
    }

    #[test]
    fn v0_roundtrip() {
        let bytes = sample_v0();
        assert_eq!(bytes.len() as u64, V0_ENCODED_SIZE);

        let superblock = Superblock::read(&bytes).unwrap();
        assert_eq!(superblock.version, 0);
        assert_eq!(superblock.offset_size, 8);
        assert_eq!(superblock.length_size, 8);
        assert_eq!(superblock.group_leaf_node_k, 4);
        assert_eq!(superblock.group_internal_node_k, 16);
        assert_eq!(superblock.end_of_file_address, 2056);
        match &superblock.root {
            RootLocation::Entry(entry) => {
                assert_eq!(entry.object_header_address, 96);
                assert_eq!(entry.address_of_btree, 136);
                assert_eq!(entry.address_of_name_heap, 680);
            }
            other => panic!("expected inline root entry, got {:?}", other),
        }

        // Byte-exact re-encode.
        assert_eq!(superblock.encode().unwrap(), bytes);
    }

    #[test]
    fn rejects_bad_signature() {
        let mut bytes = sample_v0();
        bytes[7] = 0x0B;
        match Superblock::read(&bytes) {
            Err(Hdf5Error::BadSignature) => {}
            other => panic!("expected BadSignature, got {:?}", other),
        }
    }

    #[test]
    fn rejects_unknown_version() {
        let mut bytes = sample_v0();
        bytes[8] = 9;
        match Superblock::read(&bytes) {
            Err(Hdf5Error::UnsupportedVersion(9)) => {}
            other => panic!("expected UnsupportedVersion, got {:?}", other),
        }
    }

    #[test]
    fn rejects_nonzero_reserved() {
        let mut bytes = sample_v0();
        bytes[11] = 1;
        match Superblock::read(&bytes) {
            Err(Hdf5Error::ReservedBitsViolated) => {}
            other => panic!("expected ReservedBitsViolated, got {:?}", other),
        }
    }

    #[test]
    fn reads_v2_layout() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(SIGNATURE);
        bytes.push(2); // version
        bytes.push(8); // offset size
        bytes.push(8); // length size
        bytes.push(0); // flags
        codec::push_u64(&mut bytes, 0); // base
        codec::push_u64(&mut bytes, u64::max_value()); // extension
        codec::push_u64(&mut bytes, 4096); // eof
        codec::push_u64(&mut bytes, 48); // root header
        codec::push_u32(&mut bytes, 0); // checksum
        let superblock = Superblock::read(&bytes).unwrap();
        assert_eq!(superblock.version, 2);
        assert_eq!(superblock.root_object_header_address(), 48);
        // Writing a v2 superblock is out of scope.
        assert!(superblock.encode().is_err());
    }
}
