//! Streaming extractor and lazy decoder for OpenStreetMap PBF data.
//!
//! A PBF file is a sequence of length-prefixed blobs, each wrapping a
//! compressed block of OSM content. This crate consumes any byte source as a
//! forward-only stream, frames the blobs without buffering the file,
//! inflates each one (inline or on a worker pool) and exposes every block as
//! an on-demand view that materializes nodes, dense nodes, ways and
//! relations straight out of the decompressed bytes.
//!
//! ```no_run
//! use osmstream::{Config, Event, Pipeline, ReadSource};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let source = ReadSource::from_path("extract.osm.pbf")?;
//! for event in Pipeline::new(source, Config::default()) {
//!     match event {
//!         Event::BlobReady(block) => {
//!             for group in block.groups()? {
//!                 if let Some(nodes) = group.dense_nodes()? {
//!                     for node in nodes {
//!                         let node = node?;
//!                         println!("{} {} {}", node.id(), node.lat(), node.lon());
//!                     }
//!                 }
//!             }
//!         }
//!         Event::Error { index, error } => eprintln!("{:?}: {}", index, error),
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Consumers always see blocks in file order, independent of how many
//! decompression workers are configured. Entities borrow from their block;
//! copy out whatever needs to outlive it.
//!
//! # Links
//!
//! - [PBF format documentation](https://wiki.openstreetmap.org/wiki/PBF_Format)

mod blob;
mod block;
mod buffer;
mod dense;
mod error;
mod osmpbf;
mod parallel;
mod pipeline;
mod source;
mod stats;
mod strings;
mod varint;

pub use crate::blob::{Compression, Envelope};
pub use crate::block::{
    Bbox, BlockParams, DecodedBlock, Element, ElementIter, Group, GroupIter, GroupKind,
    HeaderBlock, Info, Member, MemberIter, MemberType, Node, NodeIter, RefIter, Relation,
    RelationIter, TagIter, Way, WayIter,
};
pub use crate::buffer::BufferPool;
pub use crate::dense::{DenseInfo, DenseNode, DenseNodeIter, DenseTagIter};
pub use crate::error::{Error, Result};
pub use crate::osmpbf::{BlobRecord, BlobType, FramingReader, MAX_BLOB_HEADER_LEN, MAX_BLOB_LEN};
pub use crate::parallel::ScalingMode;
pub use crate::pipeline::{Blocks, CancelHandle, Config, Event, Pipeline};
pub use crate::source::{ChunkSource, MmapSource, ReadSource};
pub use crate::stats::Stats;
pub use crate::strings::StringTable;
pub use crate::varint::{
    read_len_delim, read_tag, read_uvarint, skip_field, zigzag_decode, zigzag_encode, WireType,
};
