//! Lazy decoding of one decompressed `PrimitiveBlock`.
//!
//! A [`DecodedBlock`] owns the inflated bytes of a single file block. Nothing
//! inside is parsed up front: the top-level layout (string table location,
//! group locations, granularity units) is scanned on first access and
//! memoized, and the entity iterators walk the group bytes one message at a
//! time, yielding values that borrow from the block buffer. Every iterator is
//! single-pass; build a fresh one from the block for another pass.

use std::cell::OnceCell;

use crate::buffer::BlockBuf;
use crate::dense::DenseNodeIter;
use crate::error::{Error, Result};
use crate::osmpbf::BlobType;
use crate::strings::{StringTable, StringTableIndex};
use crate::varint::{
    read_len_delim, read_tag, read_uvarint, skip_field, zigzag_decode, Packed, PackedIter,
    WireType,
};

const STRINGTABLE_FIELD: u32 = 1;
const PRIMITIVEGROUP_FIELD: u32 = 2;
const GRANULARITY_FIELD: u32 = 17;
const DATE_GRANULARITY_FIELD: u32 = 18;
const LAT_OFFSET_FIELD: u32 = 19;
const LON_OFFSET_FIELD: u32 = 20;

/// Coordinate and timestamp scaling of a block.
#[derive(Debug, Clone, Copy)]
pub struct BlockParams {
    /// Nanodegrees per raw coordinate unit.
    pub granularity: i64,
    /// Milliseconds per raw timestamp unit.
    pub date_granularity: i64,
    pub lat_offset: i64,
    pub lon_offset: i64,
}

impl Default for BlockParams {
    fn default() -> Self {
        Self {
            granularity: 100,
            date_granularity: 1000,
            lat_offset: 0,
            lon_offset: 0,
        }
    }
}

impl BlockParams {
    /// Degrees from a raw latitude unit: `(offset + granularity * raw) * 1e-9`.
    #[inline]
    pub fn lat(&self, raw: i64) -> f64 {
        (self.lat_offset + self.granularity * raw) as f64 * 1e-9
    }

    #[inline]
    pub fn lon(&self, raw: i64) -> f64 {
        (self.lon_offset + self.granularity * raw) as f64 * 1e-9
    }
}

#[derive(Debug)]
struct Layout {
    stringtable: Option<(usize, usize)>,
    groups: Vec<(usize, usize)>,
    params: BlockParams,
}

/// Ownership-bearing handle over the decompressed bytes of one block.
#[derive(Debug)]
pub struct DecodedBlock {
    index: u64,
    offset: u64,
    blob_type: BlobType,
    buf: BlockBuf,
    layout: OnceCell<Layout>,
    strings: OnceCell<StringTableIndex>,
}

impl DecodedBlock {
    pub(crate) fn new(index: u64, offset: u64, blob_type: BlobType, buf: BlockBuf) -> Self {
        Self {
            index,
            offset,
            blob_type,
            buf,
            layout: OnceCell::new(),
            strings: OnceCell::new(),
        }
    }

    /// Blob sequence number in file order.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// File offset of the blob this block was inflated from.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn blob_type(&self) -> &BlobType {
        &self.blob_type
    }

    /// The raw decompressed bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    fn layout(&self) -> Result<&Layout> {
        if let Some(layout) = self.layout.get() {
            return Ok(layout);
        }
        let layout = self.scan_layout()?;
        Ok(self.layout.get_or_init(|| layout))
    }

    fn scan_layout(&self) -> Result<Layout> {
        let buf = self.bytes();
        let mut stringtable = None;
        let mut groups = Vec::new();
        let mut params = BlockParams::default();
        let mut pos = 0;
        while pos < buf.len() {
            let (field, wire, consumed) = read_tag(buf, pos)?;
            pos += consumed;
            match (field, wire) {
                (STRINGTABLE_FIELD, WireType::LengthDelim) => {
                    let (data, consumed) = read_len_delim(buf, pos)?;
                    let start = pos + consumed - data.len();
                    pos += consumed;
                    stringtable = Some((start, start + data.len()));
                }
                (PRIMITIVEGROUP_FIELD, WireType::LengthDelim) => {
                    let (data, consumed) = read_len_delim(buf, pos)?;
                    let start = pos + consumed - data.len();
                    pos += consumed;
                    groups.push((start, start + data.len()));
                }
                (GRANULARITY_FIELD, WireType::Varint) => {
                    let (value, consumed) = read_uvarint(buf, pos)?;
                    pos += consumed;
                    params.granularity = value as i64;
                }
                (DATE_GRANULARITY_FIELD, WireType::Varint) => {
                    let (value, consumed) = read_uvarint(buf, pos)?;
                    pos += consumed;
                    params.date_granularity = value as i64;
                }
                (LAT_OFFSET_FIELD, WireType::Varint) => {
                    let (value, consumed) = read_uvarint(buf, pos)?;
                    pos += consumed;
                    params.lat_offset = value as i64;
                }
                (LON_OFFSET_FIELD, WireType::Varint) => {
                    let (value, consumed) = read_uvarint(buf, pos)?;
                    pos += consumed;
                    params.lon_offset = value as i64;
                }
                (_, wire) => pos += skip_field(buf, pos, wire)?,
            }
        }
        Ok(Layout {
            stringtable,
            groups,
            params,
        })
    }

    /// The block's granularity units (defaults apply when absent).
    pub fn params(&self) -> Result<BlockParams> {
        Ok(self.layout()?.params)
    }

    /// Lazy view over the block's string table. The offset index is built on
    /// the first call and reused afterwards.
    pub fn string_table(&self) -> Result<StringTable<'_>> {
        if self.strings.get().is_none() {
            let range = self.layout()?.stringtable.unwrap_or((0, 0));
            let index = StringTableIndex::scan(self.bytes(), range)?;
            let _ = self.strings.set(index);
        }
        let index = self.strings.get().expect("string table index just built");
        Ok(StringTable::new(self.bytes(), index))
    }

    /// Iterates the block's primitive groups.
    pub fn groups(&self) -> Result<GroupIter<'_>> {
        let layout = self.layout()?;
        Ok(GroupIter {
            block: self,
            ranges: layout.groups.iter(),
        })
    }

    /// Decodes an `OSMHeader` payload. Meaningful only for blocks whose blob
    /// type is [`BlobType::OsmHeader`].
    pub fn header(&self) -> Result<HeaderBlock<'_>> {
        HeaderBlock::parse(self.bytes())
    }
}

pub struct GroupIter<'a> {
    block: &'a DecodedBlock,
    ranges: std::slice::Iter<'a, (usize, usize)>,
}

impl<'a> Iterator for GroupIter<'a> {
    type Item = Group<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let &(start, end) = self.ranges.next()?;
        Some(Group {
            block: self.block,
            data: &self.block.bytes()[start..end],
        })
    }
}

/// The four mutually exclusive entity forms a group can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupKind {
    Nodes,
    DenseNodes,
    Ways,
    Relations,
    /// Changeset groups are out of scope; recognized so they can be skipped.
    Changesets,
    Empty,
}

const NODES_FIELD: u32 = 1;
const DENSE_FIELD: u32 = 2;
const WAYS_FIELD: u32 = 3;
const RELATIONS_FIELD: u32 = 4;
const CHANGESETS_FIELD: u32 = 5;

/// One `PrimitiveGroup` within a block.
#[derive(Clone, Copy)]
pub struct Group<'a> {
    block: &'a DecodedBlock,
    data: &'a [u8],
}

impl<'a> Group<'a> {
    /// Determines the entity form by the first entity field present, without
    /// decoding anything else.
    pub fn kind(&self) -> Result<GroupKind> {
        let buf = self.data;
        let mut pos = 0;
        while pos < buf.len() {
            let (field, wire, consumed) = read_tag(buf, pos)?;
            pos += consumed;
            match field {
                NODES_FIELD => return Ok(GroupKind::Nodes),
                DENSE_FIELD => return Ok(GroupKind::DenseNodes),
                WAYS_FIELD => return Ok(GroupKind::Ways),
                RELATIONS_FIELD => return Ok(GroupKind::Relations),
                CHANGESETS_FIELD => return Ok(GroupKind::Changesets),
                _ => pos += skip_field(buf, pos, wire)?,
            }
        }
        Ok(GroupKind::Empty)
    }

    fn context(&self) -> Result<(BlockParams, StringTable<'a>)> {
        Ok((self.block.params()?, self.block.string_table()?))
    }

    /// Iterator over plain (non-dense) nodes.
    pub fn nodes(&self) -> Result<NodeIter<'a>> {
        let (params, strings) = self.context()?;
        Ok(NodeIter {
            messages: MessageIter::new(self.data, NODES_FIELD),
            params,
            strings,
        })
    }

    /// Iterator over the group's dense-node run, if it has one.
    pub fn dense_nodes(&self) -> Result<Option<DenseNodeIter<'a>>> {
        let (params, strings) = self.context()?;
        let mut messages = MessageIter::new(self.data, DENSE_FIELD);
        match messages.next() {
            Some(Ok(msg)) => Ok(Some(DenseNodeIter::new(msg, params, strings)?)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    pub fn ways(&self) -> Result<WayIter<'a>> {
        let (params, strings) = self.context()?;
        Ok(WayIter {
            messages: MessageIter::new(self.data, WAYS_FIELD),
            params,
            strings,
        })
    }

    pub fn relations(&self) -> Result<RelationIter<'a>> {
        let (params, strings) = self.context()?;
        Ok(RelationIter {
            messages: MessageIter::new(self.data, RELATIONS_FIELD),
            params,
            strings,
        })
    }

    /// Uniform iterator over whatever entity form the group holds.
    pub fn elements(&self) -> Result<ElementIter<'a>> {
        Ok(match self.kind()? {
            GroupKind::Nodes => ElementIter::Nodes(self.nodes()?),
            GroupKind::DenseNodes => match self.dense_nodes()? {
                Some(iter) => ElementIter::Dense(iter),
                None => ElementIter::Empty,
            },
            GroupKind::Ways => ElementIter::Ways(self.ways()?),
            GroupKind::Relations => ElementIter::Relations(self.relations()?),
            GroupKind::Changesets | GroupKind::Empty => ElementIter::Empty,
        })
    }
}

/// Walks one repeated length-delimited field of a message, yielding each
/// occurrence's payload. Poisons itself after an error.
#[derive(Clone)]
pub(crate) struct MessageIter<'a> {
    buf: &'a [u8],
    pos: usize,
    field: u32,
}

impl<'a> MessageIter<'a> {
    pub(crate) fn new(buf: &'a [u8], field: u32) -> Self {
        Self { buf, pos: 0, field }
    }
}

impl<'a> Iterator for MessageIter<'a> {
    type Item = Result<&'a [u8]>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.pos < self.buf.len() {
            let step = (|| {
                let (field, wire, consumed) = read_tag(self.buf, self.pos)?;
                if field == self.field && wire == WireType::LengthDelim {
                    let (msg, inner) = read_len_delim(self.buf, self.pos + consumed)?;
                    Ok((consumed + inner, Some(msg)))
                } else {
                    let skipped = skip_field(self.buf, self.pos + consumed, wire)?;
                    Ok((consumed + skipped, None))
                }
            })();
            match step {
                Ok((consumed, found)) => {
                    self.pos += consumed;
                    if let Some(msg) = found {
                        return Some(Ok(msg));
                    }
                }
                Err(e) => {
                    self.pos = self.buf.len();
                    return Some(Err(e));
                }
            }
        }
        None
    }
}

/// Tag pairs resolved through the string table, in wire order. Duplicate
/// keys pass through untouched.
pub struct TagIter<'a> {
    keys: PackedIter<'a>,
    vals: PackedIter<'a>,
    strings: StringTable<'a>,
    done: bool,
}

impl<'a> TagIter<'a> {
    fn new(keys: &Packed<'a>, vals: &Packed<'a>, strings: StringTable<'a>) -> Self {
        Self {
            keys: keys.iter(),
            vals: vals.iter(),
            strings,
            done: false,
        }
    }
}

impl<'a> Iterator for TagIter<'a> {
    type Item = Result<(&'a str, &'a str)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let step = match (self.keys.next(), self.vals.next()) {
            (None, None) => return None,
            (Some(k), Some(v)) => (|| {
                let key = self.strings.get_str(k?)?;
                let val = self.strings.get_str(v?)?;
                Ok((key, val))
            })(),
            _ => Err(Error::ArityMismatch("tag key/value arrays")),
        };
        if step.is_err() {
            self.done = true;
        }
        Some(step)
    }
}

/// A plain (non-dense) node.
pub struct Node<'a> {
    id: i64,
    lat_raw: i64,
    lon_raw: i64,
    keys: Packed<'a>,
    vals: Packed<'a>,
    info: Option<&'a [u8]>,
    params: BlockParams,
    strings: StringTable<'a>,
}

impl<'a> Node<'a> {
    fn parse(msg: &'a [u8], params: BlockParams, strings: StringTable<'a>) -> Result<Self> {
        let mut node = Node {
            id: 0,
            lat_raw: 0,
            lon_raw: 0,
            keys: Packed::Empty,
            vals: Packed::Empty,
            info: None,
            params,
            strings,
        };
        let mut pos = 0;
        while pos < msg.len() {
            let (field, wire, consumed) = read_tag(msg, pos)?;
            pos += consumed;
            match (field, wire) {
                (1, WireType::Varint) => {
                    let (value, consumed) = read_uvarint(msg, pos)?;
                    pos += consumed;
                    node.id = zigzag_decode(value);
                }
                (2, WireType::LengthDelim) => {
                    let (run, consumed) = read_len_delim(msg, pos)?;
                    pos += consumed;
                    node.keys.push_run(run);
                }
                (2, WireType::Varint) => {
                    let (value, consumed) = read_uvarint(msg, pos)?;
                    pos += consumed;
                    node.keys.push_single(value);
                }
                (3, WireType::LengthDelim) => {
                    let (run, consumed) = read_len_delim(msg, pos)?;
                    pos += consumed;
                    node.vals.push_run(run);
                }
                (3, WireType::Varint) => {
                    let (value, consumed) = read_uvarint(msg, pos)?;
                    pos += consumed;
                    node.vals.push_single(value);
                }
                (4, WireType::LengthDelim) => {
                    let (info, consumed) = read_len_delim(msg, pos)?;
                    pos += consumed;
                    node.info = Some(info);
                }
                (8, WireType::Varint) => {
                    let (value, consumed) = read_uvarint(msg, pos)?;
                    pos += consumed;
                    node.lat_raw = zigzag_decode(value);
                }
                (9, WireType::Varint) => {
                    let (value, consumed) = read_uvarint(msg, pos)?;
                    pos += consumed;
                    node.lon_raw = zigzag_decode(value);
                }
                (_, wire) => pos += skip_field(msg, pos, wire)?,
            }
        }
        Ok(node)
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    /// Latitude in decimal degrees.
    pub fn lat(&self) -> f64 {
        self.params.lat(self.lat_raw)
    }

    /// Longitude in decimal degrees.
    pub fn lon(&self) -> f64 {
        self.params.lon(self.lon_raw)
    }

    pub fn tags(&self) -> TagIter<'a> {
        TagIter::new(&self.keys, &self.vals, self.strings)
    }

    /// Optional metadata, decoded on demand.
    pub fn info(&self) -> Result<Option<Info<'a>>> {
        self.info
            .map(|msg| Info::parse(msg, self.params, self.strings))
            .transpose()
    }
}

pub struct NodeIter<'a> {
    messages: MessageIter<'a>,
    params: BlockParams,
    strings: StringTable<'a>,
}

impl<'a> Iterator for NodeIter<'a> {
    type Item = Result<Node<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        let msg = match self.messages.next()? {
            Ok(msg) => msg,
            Err(e) => return Some(Err(e)),
        };
        Some(Node::parse(msg, self.params, self.strings))
    }
}

/// Absolute node references reconstructed from zigzag deltas by prefix sum.
pub struct RefIter<'a> {
    deltas: PackedIter<'a>,
    acc: i64,
}

impl<'a> Iterator for RefIter<'a> {
    type Item = Result<i64>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.deltas.next()? {
            Ok(value) => {
                self.acc += zigzag_decode(value);
                Some(Ok(self.acc))
            }
            Err(e) => Some(Err(e)),
        }
    }
}

pub struct Way<'a> {
    id: i64,
    keys: Packed<'a>,
    vals: Packed<'a>,
    refs: Packed<'a>,
    info: Option<&'a [u8]>,
    params: BlockParams,
    strings: StringTable<'a>,
}

impl<'a> Way<'a> {
    fn parse(msg: &'a [u8], params: BlockParams, strings: StringTable<'a>) -> Result<Self> {
        let mut way = Way {
            id: 0,
            keys: Packed::Empty,
            vals: Packed::Empty,
            refs: Packed::Empty,
            info: None,
            params,
            strings,
        };
        let mut pos = 0;
        while pos < msg.len() {
            let (field, wire, consumed) = read_tag(msg, pos)?;
            pos += consumed;
            match (field, wire) {
                (1, WireType::Varint) => {
                    let (value, consumed) = read_uvarint(msg, pos)?;
                    pos += consumed;
                    way.id = value as i64;
                }
                (2, WireType::LengthDelim) => {
                    let (run, consumed) = read_len_delim(msg, pos)?;
                    pos += consumed;
                    way.keys.push_run(run);
                }
                (2, WireType::Varint) => {
                    let (value, consumed) = read_uvarint(msg, pos)?;
                    pos += consumed;
                    way.keys.push_single(value);
                }
                (3, WireType::LengthDelim) => {
                    let (run, consumed) = read_len_delim(msg, pos)?;
                    pos += consumed;
                    way.vals.push_run(run);
                }
                (3, WireType::Varint) => {
                    let (value, consumed) = read_uvarint(msg, pos)?;
                    pos += consumed;
                    way.vals.push_single(value);
                }
                (4, WireType::LengthDelim) => {
                    let (info, consumed) = read_len_delim(msg, pos)?;
                    pos += consumed;
                    way.info = Some(info);
                }
                (8, WireType::LengthDelim) => {
                    let (run, consumed) = read_len_delim(msg, pos)?;
                    pos += consumed;
                    way.refs.push_run(run);
                }
                (8, WireType::Varint) => {
                    let (value, consumed) = read_uvarint(msg, pos)?;
                    pos += consumed;
                    way.refs.push_single(value);
                }
                (_, wire) => pos += skip_field(msg, pos, wire)?,
            }
        }
        Ok(way)
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn tags(&self) -> TagIter<'a> {
        TagIter::new(&self.keys, &self.vals, self.strings)
    }

    /// The way's node ids, absolute.
    pub fn refs(&self) -> RefIter<'a> {
        RefIter {
            deltas: self.refs.iter(),
            acc: 0,
        }
    }

    pub fn info(&self) -> Result<Option<Info<'a>>> {
        self.info
            .map(|msg| Info::parse(msg, self.params, self.strings))
            .transpose()
    }
}

pub struct WayIter<'a> {
    messages: MessageIter<'a>,
    params: BlockParams,
    strings: StringTable<'a>,
}

impl<'a> Iterator for WayIter<'a> {
    type Item = Result<Way<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        let msg = match self.messages.next()? {
            Ok(msg) => msg,
            Err(e) => return Some(Err(e)),
        };
        Some(Way::parse(msg, self.params, self.strings))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberType {
    Node,
    Way,
    Relation,
}

impl MemberType {
    fn from_raw(raw: u64) -> Result<Self> {
        match raw {
            0 => Ok(MemberType::Node),
            1 => Ok(MemberType::Way),
            2 => Ok(MemberType::Relation),
            _ => Err(Error::Protobuf("invalid relation member type")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Member<'a> {
    pub member_type: MemberType,
    /// Absolute id of the referenced entity.
    pub id: i64,
    pub role: &'a str,
}

/// Lockstep walk over `roles_sid`, `memids` and `types`; the three arrays
/// must be the same length.
pub struct MemberIter<'a> {
    roles: PackedIter<'a>,
    memids: PackedIter<'a>,
    types: PackedIter<'a>,
    acc: i64,
    strings: StringTable<'a>,
    done: bool,
}

impl<'a> Iterator for MemberIter<'a> {
    type Item = Result<Member<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let step = match (self.roles.next(), self.memids.next(), self.types.next()) {
            (None, None, None) => return None,
            (Some(role), Some(memid), Some(member_type)) => (|| {
                self.acc += zigzag_decode(memid?);
                Ok(Member {
                    member_type: MemberType::from_raw(member_type?)?,
                    id: self.acc,
                    role: self.strings.get_str(role?)?,
                })
            })(),
            _ => Err(Error::ArityMismatch("relation member arrays")),
        };
        if step.is_err() {
            self.done = true;
        }
        Some(step)
    }
}

pub struct Relation<'a> {
    id: i64,
    keys: Packed<'a>,
    vals: Packed<'a>,
    roles: Packed<'a>,
    memids: Packed<'a>,
    types: Packed<'a>,
    info: Option<&'a [u8]>,
    params: BlockParams,
    strings: StringTable<'a>,
}

impl<'a> Relation<'a> {
    fn parse(msg: &'a [u8], params: BlockParams, strings: StringTable<'a>) -> Result<Self> {
        let mut relation = Relation {
            id: 0,
            keys: Packed::Empty,
            vals: Packed::Empty,
            roles: Packed::Empty,
            memids: Packed::Empty,
            types: Packed::Empty,
            info: None,
            params,
            strings,
        };
        let mut pos = 0;
        while pos < msg.len() {
            let (field, wire, consumed) = read_tag(msg, pos)?;
            pos += consumed;
            match (field, wire) {
                (1, WireType::Varint) => {
                    let (value, consumed) = read_uvarint(msg, pos)?;
                    pos += consumed;
                    relation.id = value as i64;
                }
                (2 | 3 | 8 | 9 | 10, WireType::LengthDelim) => {
                    let (run, consumed) = read_len_delim(msg, pos)?;
                    pos += consumed;
                    relation.packed_field(field).push_run(run);
                }
                (2 | 3 | 8 | 9 | 10, WireType::Varint) => {
                    let (value, consumed) = read_uvarint(msg, pos)?;
                    pos += consumed;
                    relation.packed_field(field).push_single(value);
                }
                (4, WireType::LengthDelim) => {
                    let (info, consumed) = read_len_delim(msg, pos)?;
                    pos += consumed;
                    relation.info = Some(info);
                }
                (_, wire) => pos += skip_field(msg, pos, wire)?,
            }
        }
        Ok(relation)
    }

    fn packed_field(&mut self, field: u32) -> &mut Packed<'a> {
        match field {
            2 => &mut self.keys,
            3 => &mut self.vals,
            8 => &mut self.roles,
            9 => &mut self.memids,
            _ => &mut self.types,
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn tags(&self) -> TagIter<'a> {
        TagIter::new(&self.keys, &self.vals, self.strings)
    }

    pub fn members(&self) -> MemberIter<'a> {
        MemberIter {
            roles: self.roles.iter(),
            memids: self.memids.iter(),
            types: self.types.iter(),
            acc: 0,
            strings: self.strings,
            done: false,
        }
    }

    pub fn info(&self) -> Result<Option<Info<'a>>> {
        self.info
            .map(|msg| Info::parse(msg, self.params, self.strings))
            .transpose()
    }
}

pub struct RelationIter<'a> {
    messages: MessageIter<'a>,
    params: BlockParams,
    strings: StringTable<'a>,
}

impl<'a> Iterator for RelationIter<'a> {
    type Item = Result<Relation<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        let msg = match self.messages.next()? {
            Ok(msg) => msg,
            Err(e) => return Some(Err(e)),
        };
        Some(Relation::parse(msg, self.params, self.strings))
    }
}

/// Entity metadata (`Info` message).
#[derive(Debug, Clone, Copy)]
pub struct Info<'a> {
    pub version: Option<i32>,
    raw_timestamp: Option<i64>,
    pub changeset: Option<i64>,
    pub uid: Option<i32>,
    user_sid: Option<u64>,
    pub visible: Option<bool>,
    date_granularity: i64,
    strings: StringTable<'a>,
}

impl<'a> Info<'a> {
    fn parse(msg: &'a [u8], params: BlockParams, strings: StringTable<'a>) -> Result<Self> {
        let mut info = Info {
            version: None,
            raw_timestamp: None,
            changeset: None,
            uid: None,
            user_sid: None,
            visible: None,
            date_granularity: params.date_granularity,
            strings,
        };
        let mut pos = 0;
        while pos < msg.len() {
            let (field, wire, consumed) = read_tag(msg, pos)?;
            pos += consumed;
            match (field, wire) {
                (1, WireType::Varint) => {
                    let (value, consumed) = read_uvarint(msg, pos)?;
                    pos += consumed;
                    info.version = Some(value as i32);
                }
                (2, WireType::Varint) => {
                    let (value, consumed) = read_uvarint(msg, pos)?;
                    pos += consumed;
                    info.raw_timestamp = Some(value as i64);
                }
                (3, WireType::Varint) => {
                    let (value, consumed) = read_uvarint(msg, pos)?;
                    pos += consumed;
                    info.changeset = Some(value as i64);
                }
                (4, WireType::Varint) => {
                    let (value, consumed) = read_uvarint(msg, pos)?;
                    pos += consumed;
                    info.uid = Some(value as i32);
                }
                (5, WireType::Varint) => {
                    let (value, consumed) = read_uvarint(msg, pos)?;
                    pos += consumed;
                    info.user_sid = Some(value);
                }
                (6, WireType::Varint) => {
                    let (value, consumed) = read_uvarint(msg, pos)?;
                    pos += consumed;
                    info.visible = Some(value != 0);
                }
                (_, wire) => pos += skip_field(msg, pos, wire)?,
            }
        }
        Ok(info)
    }

    /// Timestamp in milliseconds since the epoch, scaled by the block's
    /// `date_granularity`.
    pub fn timestamp_millis(&self) -> Option<i64> {
        self.raw_timestamp.map(|t| t * self.date_granularity)
    }

    /// The editing user, resolved through the string table.
    pub fn user(&self) -> Result<Option<&'a str>> {
        self.user_sid.map(|sid| self.strings.get_str(sid)).transpose()
    }
}

/// A decoded entity of any form.
pub enum Element<'a> {
    Node(Node<'a>),
    DenseNode(crate::dense::DenseNode<'a>),
    Way(Way<'a>),
    Relation(Relation<'a>),
}

/// Uniform iterator over a group's entities.
pub enum ElementIter<'a> {
    Nodes(NodeIter<'a>),
    Dense(DenseNodeIter<'a>),
    Ways(WayIter<'a>),
    Relations(RelationIter<'a>),
    Empty,
}

impl<'a> Iterator for ElementIter<'a> {
    type Item = Result<Element<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            ElementIter::Nodes(iter) => Some(iter.next()?.map(Element::Node)),
            ElementIter::Dense(iter) => Some(iter.next()?.map(Element::DenseNode)),
            ElementIter::Ways(iter) => Some(iter.next()?.map(Element::Way)),
            ElementIter::Relations(iter) => Some(iter.next()?.map(Element::Relation)),
            ElementIter::Empty => None,
        }
    }
}

/// Decoded `OSMHeader` payload.
#[derive(Debug, Default)]
pub struct HeaderBlock<'a> {
    /// Bounding box in nanodegrees, when present.
    pub bbox: Option<Bbox>,
    pub required_features: Vec<&'a str>,
    pub optional_features: Vec<&'a str>,
    pub writingprogram: Option<&'a str>,
    pub source: Option<&'a str>,
    pub osmosis_replication_timestamp: Option<i64>,
    pub osmosis_replication_sequence_number: Option<i64>,
    pub osmosis_replication_base_url: Option<&'a str>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Bbox {
    pub left: i64,
    pub right: i64,
    pub top: i64,
    pub bottom: i64,
}

impl Bbox {
    fn parse(msg: &[u8]) -> Result<Bbox> {
        let mut bbox = Bbox::default();
        let mut pos = 0;
        while pos < msg.len() {
            let (field, wire, consumed) = read_tag(msg, pos)?;
            pos += consumed;
            match (field, wire) {
                (1..=4, WireType::Varint) => {
                    let (value, consumed) = read_uvarint(msg, pos)?;
                    pos += consumed;
                    let value = zigzag_decode(value);
                    match field {
                        1 => bbox.left = value,
                        2 => bbox.right = value,
                        3 => bbox.top = value,
                        _ => bbox.bottom = value,
                    }
                }
                (_, wire) => pos += skip_field(msg, pos, wire)?,
            }
        }
        Ok(bbox)
    }
}

impl<'a> HeaderBlock<'a> {
    fn parse(buf: &'a [u8]) -> Result<HeaderBlock<'a>> {
        let mut header = HeaderBlock::default();
        let mut pos = 0;
        while pos < buf.len() {
            let (field, wire, consumed) = read_tag(buf, pos)?;
            pos += consumed;
            match (field, wire) {
                (1, WireType::LengthDelim) => {
                    let (msg, consumed) = read_len_delim(buf, pos)?;
                    pos += consumed;
                    header.bbox = Some(Bbox::parse(msg)?);
                }
                (4 | 5 | 16 | 17 | 34, WireType::LengthDelim) => {
                    let (data, consumed) = read_len_delim(buf, pos)?;
                    pos += consumed;
                    let text = std::str::from_utf8(data)
                        .map_err(|_| Error::Protobuf("header string not utf-8"))?;
                    match field {
                        4 => header.required_features.push(text),
                        5 => header.optional_features.push(text),
                        16 => header.writingprogram = Some(text),
                        17 => header.source = Some(text),
                        _ => header.osmosis_replication_base_url = Some(text),
                    }
                }
                (32, WireType::Varint) => {
                    let (value, consumed) = read_uvarint(buf, pos)?;
                    pos += consumed;
                    header.osmosis_replication_timestamp = Some(value as i64);
                }
                (33, WireType::Varint) => {
                    let (value, consumed) = read_uvarint(buf, pos)?;
                    pos += consumed;
                    header.osmosis_replication_sequence_number = Some(value as i64);
                }
                (_, wire) => pos += skip_field(buf, pos, wire)?,
            }
        }
        Ok(header)
    }
}
