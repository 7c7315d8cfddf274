//! Fixture support: hand-declared prost mirrors of the PBF messages, used to
//! encode test files that the crate then decodes. The shapes match what
//! prost-build generates from fileformat.proto / osmformat.proto.

#![allow(dead_code)]

use std::io::Write;

use flate2::write::ZlibEncoder;
use prost::Message;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BlobHeader {
    #[prost(string, optional, tag = "1")]
    pub r#type: Option<String>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub indexdata: Option<Vec<u8>>,
    #[prost(int32, optional, tag = "3")]
    pub datasize: Option<i32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Blob {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub raw: Option<Vec<u8>>,
    #[prost(int32, optional, tag = "2")]
    pub raw_size: Option<i32>,
    #[prost(bytes = "vec", optional, tag = "3")]
    pub zlib_data: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "4")]
    pub lzma_data: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "6")]
    pub lz4_data: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "7")]
    pub zstd_data: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HeaderBlock {
    #[prost(message, optional, tag = "1")]
    pub bbox: Option<HeaderBBox>,
    #[prost(string, repeated, tag = "4")]
    pub required_features: Vec<String>,
    #[prost(string, repeated, tag = "5")]
    pub optional_features: Vec<String>,
    #[prost(string, optional, tag = "16")]
    pub writingprogram: Option<String>,
    #[prost(string, optional, tag = "17")]
    pub source: Option<String>,
    #[prost(int64, optional, tag = "32")]
    pub osmosis_replication_timestamp: Option<i64>,
    #[prost(int64, optional, tag = "33")]
    pub osmosis_replication_sequence_number: Option<i64>,
    #[prost(string, optional, tag = "34")]
    pub osmosis_replication_base_url: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HeaderBBox {
    #[prost(sint64, optional, tag = "1")]
    pub left: Option<i64>,
    #[prost(sint64, optional, tag = "2")]
    pub right: Option<i64>,
    #[prost(sint64, optional, tag = "3")]
    pub top: Option<i64>,
    #[prost(sint64, optional, tag = "4")]
    pub bottom: Option<i64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StringTable {
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub s: Vec<Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PrimitiveBlock {
    #[prost(message, optional, tag = "1")]
    pub stringtable: Option<StringTable>,
    #[prost(message, repeated, tag = "2")]
    pub primitivegroup: Vec<PrimitiveGroup>,
    #[prost(int32, optional, tag = "17")]
    pub granularity: Option<i32>,
    #[prost(int32, optional, tag = "18")]
    pub date_granularity: Option<i32>,
    #[prost(int64, optional, tag = "19")]
    pub lat_offset: Option<i64>,
    #[prost(int64, optional, tag = "20")]
    pub lon_offset: Option<i64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PrimitiveGroup {
    #[prost(message, repeated, tag = "1")]
    pub nodes: Vec<Node>,
    #[prost(message, optional, tag = "2")]
    pub dense: Option<DenseNodes>,
    #[prost(message, repeated, tag = "3")]
    pub ways: Vec<Way>,
    #[prost(message, repeated, tag = "4")]
    pub relations: Vec<Relation>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Node {
    #[prost(sint64, optional, tag = "1")]
    pub id: Option<i64>,
    #[prost(uint32, repeated, tag = "2")]
    pub keys: Vec<u32>,
    #[prost(uint32, repeated, tag = "3")]
    pub vals: Vec<u32>,
    #[prost(message, optional, tag = "4")]
    pub info: Option<Info>,
    #[prost(sint64, optional, tag = "8")]
    pub lat: Option<i64>,
    #[prost(sint64, optional, tag = "9")]
    pub lon: Option<i64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DenseNodes {
    #[prost(sint64, repeated, tag = "1")]
    pub id: Vec<i64>,
    #[prost(message, optional, tag = "5")]
    pub denseinfo: Option<DenseInfo>,
    #[prost(sint64, repeated, tag = "8")]
    pub lat: Vec<i64>,
    #[prost(sint64, repeated, tag = "9")]
    pub lon: Vec<i64>,
    #[prost(int32, repeated, tag = "10")]
    pub keys_vals: Vec<i32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DenseInfo {
    #[prost(int32, repeated, tag = "1")]
    pub version: Vec<i32>,
    #[prost(sint64, repeated, tag = "2")]
    pub timestamp: Vec<i64>,
    #[prost(sint64, repeated, tag = "3")]
    pub changeset: Vec<i64>,
    #[prost(sint32, repeated, tag = "4")]
    pub uid: Vec<i32>,
    #[prost(sint32, repeated, tag = "5")]
    pub user_sid: Vec<i32>,
    #[prost(bool, repeated, tag = "6")]
    pub visible: Vec<bool>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Info {
    #[prost(int32, optional, tag = "1")]
    pub version: Option<i32>,
    #[prost(int64, optional, tag = "2")]
    pub timestamp: Option<i64>,
    #[prost(int64, optional, tag = "3")]
    pub changeset: Option<i64>,
    #[prost(int32, optional, tag = "4")]
    pub uid: Option<i32>,
    #[prost(uint32, optional, tag = "5")]
    pub user_sid: Option<u32>,
    #[prost(bool, optional, tag = "6")]
    pub visible: Option<bool>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Way {
    #[prost(int64, optional, tag = "1")]
    pub id: Option<i64>,
    #[prost(uint32, repeated, tag = "2")]
    pub keys: Vec<u32>,
    #[prost(uint32, repeated, tag = "3")]
    pub vals: Vec<u32>,
    #[prost(message, optional, tag = "4")]
    pub info: Option<Info>,
    #[prost(sint64, repeated, tag = "8")]
    pub refs: Vec<i64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Relation {
    #[prost(int64, optional, tag = "1")]
    pub id: Option<i64>,
    #[prost(uint32, repeated, tag = "2")]
    pub keys: Vec<u32>,
    #[prost(uint32, repeated, tag = "3")]
    pub vals: Vec<u32>,
    #[prost(message, optional, tag = "4")]
    pub info: Option<Info>,
    #[prost(int32, repeated, tag = "8")]
    pub roles_sid: Vec<i32>,
    #[prost(sint64, repeated, tag = "9")]
    pub memids: Vec<i64>,
    #[prost(int32, repeated, tag = "10")]
    pub types: Vec<i32>,
}

pub const MEMBER_NODE: i32 = 0;
pub const MEMBER_WAY: i32 = 1;
pub const MEMBER_RELATION: i32 = 2;

pub fn string_table(entries: &[&str]) -> Option<StringTable> {
    Some(StringTable {
        s: entries.iter().map(|s| s.as_bytes().to_vec()).collect(),
    })
}

/// An otherwise-empty block holding the given groups and the mandatory
/// empty-sentinel string table.
pub fn block_with(groups: Vec<PrimitiveGroup>) -> PrimitiveBlock {
    PrimitiveBlock {
        stringtable: string_table(&[""]),
        primitivegroup: groups,
        ..Default::default()
    }
}

pub fn zlib(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// Wraps message bytes into a zlib `Blob` with a correct `raw_size`.
pub fn blob_zlib(block: &[u8]) -> Vec<u8> {
    Blob {
        raw_size: Some(block.len() as i32),
        zlib_data: Some(zlib(block)),
        ..Default::default()
    }
    .encode_to_vec()
}

/// Wraps message bytes into an uncompressed `Blob`.
pub fn blob_raw(block: &[u8]) -> Vec<u8> {
    Blob {
        raw: Some(block.to_vec()),
        raw_size: Some(block.len() as i32),
        ..Default::default()
    }
    .encode_to_vec()
}

/// Frames one `[length][BlobHeader][Blob]` record.
pub fn record(blob_type: &str, blob: &[u8]) -> Vec<u8> {
    let header = BlobHeader {
        r#type: Some(blob_type.to_string()),
        indexdata: None,
        datasize: Some(blob.len() as i32),
    }
    .encode_to_vec();
    let mut out = Vec::new();
    out.extend_from_slice(&(header.len() as u32).to_be_bytes());
    out.extend_from_slice(&header);
    out.extend_from_slice(blob);
    out
}

/// A standard header record advertising the usual required features.
pub fn header_record() -> Vec<u8> {
    let header_block = HeaderBlock {
        required_features: vec!["OsmSchema-V0.6".to_string(), "DenseNodes".to_string()],
        writingprogram: Some("osmstream-tests".to_string()),
        ..Default::default()
    }
    .encode_to_vec();
    record("OSMHeader", &blob_zlib(&header_block))
}

/// One `OSMData` record wrapping the given block, zlib-compressed.
pub fn data_record(block: &PrimitiveBlock) -> Vec<u8> {
    record("OSMData", &blob_zlib(&block.encode_to_vec()))
}

/// Assembles a complete PBF file out of framed records.
pub fn pbf_file(records: &[Vec<u8>]) -> Vec<u8> {
    records.concat()
}
