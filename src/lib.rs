//! A pure-Rust HDF5 library: reads files with superblock versions 0-3 and
//! writes files with version-0 superblocks, bit-exactly compatible with
//! HDF5 1.8.
//!
//! This library does not intend to support every feature of HDF5. Chunked
//! storage, filter application, and new-style group writing are out of
//! scope; new-style (fractal heap + v2 B-tree) groups are readable.

use std::path::Path;

pub mod alloc;
pub mod btree;
pub mod btree2;
pub mod channel;
pub mod codec;
pub mod datatype;
pub mod error;
pub mod file;
pub mod fractal;
pub mod header;
pub mod heap;
pub mod message;
mod parse_util;
pub mod superblock;
pub mod value;

pub use channel::{ByteChannel, FileChannel, MemChannel};
pub use datatype::Datatype;
pub use error::{Hdf5Error, Result};
pub use file::{
    create, Child, CreateOptions, DatasetId, Dataset, Group, Hdf5File, Hdf5Type, Hdf5Writer,
};
pub use message::{Attribute, Dataspace};
pub use value::{DataCell, RecordMapper};

/// Convenience function for Hdf5File::open.
pub fn open<P: AsRef<Path>>(path: P) -> Result<Hdf5File> {
    Hdf5File::open(path)
}

/// Open a file for reading from any seekable channel.
pub fn open_for_read(channel: &mut dyn ByteChannel) -> Result<Hdf5File> {
    Hdf5File::open_for_read(channel)
}
