//! Dense-node runs: the delta-encoded node layout and its parallel arrays.
//!
//! A `DenseNodes` message carries packed zigzag deltas for ids, latitudes and
//! longitudes, an optional flat `keys_vals` stream of string indices with a
//! `0` terminator per node, and optional parallel `DenseInfo` arrays. The
//! iterator advances all cursors in lockstep while maintaining the running
//! id/lat/lon sums; arrays that fall out of step surface as
//! [`Error::ArityMismatch`].

use crate::block::BlockParams;
use crate::error::{Error, Result};
use crate::strings::StringTable;
use crate::varint::{
    read_len_delim, read_tag, read_uvarint, skip_field, zigzag_decode, Packed, PackedIter,
    WireType,
};

#[derive(Default)]
struct DenseFields<'a> {
    ids: Packed<'a>,
    lats: Packed<'a>,
    lons: Packed<'a>,
    keys_vals: Packed<'a>,
    versions: Packed<'a>,
    timestamps: Packed<'a>,
    changesets: Packed<'a>,
    uids: Packed<'a>,
    user_sids: Packed<'a>,
    visibles: Packed<'a>,
}

impl<'a> DenseFields<'a> {
    fn parse(msg: &'a [u8]) -> Result<Self> {
        let mut fields = DenseFields::default();
        let mut pos = 0;
        while pos < msg.len() {
            let (field, wire, consumed) = read_tag(msg, pos)?;
            pos += consumed;
            match (field, wire) {
                (1 | 8 | 9 | 10, WireType::LengthDelim) => {
                    let (run, consumed) = read_len_delim(msg, pos)?;
                    pos += consumed;
                    fields.packed(field).push_run(run);
                }
                (1 | 8 | 9 | 10, WireType::Varint) => {
                    let (value, consumed) = read_uvarint(msg, pos)?;
                    pos += consumed;
                    fields.packed(field).push_single(value);
                }
                (5, WireType::LengthDelim) => {
                    let (info, consumed) = read_len_delim(msg, pos)?;
                    pos += consumed;
                    fields.parse_info(info)?;
                }
                (_, wire) => pos += skip_field(msg, pos, wire)?,
            }
        }
        Ok(fields)
    }

    fn packed(&mut self, field: u32) -> &mut Packed<'a> {
        match field {
            1 => &mut self.ids,
            8 => &mut self.lats,
            9 => &mut self.lons,
            _ => &mut self.keys_vals,
        }
    }

    /// `DenseInfo`: version(1), timestamp(2), changeset(3), uid(4),
    /// user_sid(5), visible(6); all packed, all but version delta-encoded.
    fn parse_info(&mut self, msg: &'a [u8]) -> Result<()> {
        let mut pos = 0;
        while pos < msg.len() {
            let (field, wire, consumed) = read_tag(msg, pos)?;
            pos += consumed;
            let slot = match field {
                1 => Some(&mut self.versions),
                2 => Some(&mut self.timestamps),
                3 => Some(&mut self.changesets),
                4 => Some(&mut self.uids),
                5 => Some(&mut self.user_sids),
                6 => Some(&mut self.visibles),
                _ => None,
            };
            match (slot, wire) {
                (Some(slot), WireType::LengthDelim) => {
                    let (run, consumed) = read_len_delim(msg, pos)?;
                    pos += consumed;
                    slot.push_run(run);
                }
                (Some(slot), WireType::Varint) => {
                    let (value, consumed) = read_uvarint(msg, pos)?;
                    pos += consumed;
                    slot.push_single(value);
                }
                (_, wire) => pos += skip_field(msg, pos, wire)?,
            }
        }
        Ok(())
    }
}

/// One `DenseInfo` array: an absent array yields `None` for every node, a
/// present one must supply exactly one value per node.
struct InfoArray<'a> {
    iter: PackedIter<'a>,
    present: bool,
}

impl<'a> InfoArray<'a> {
    fn new(field: &Packed<'a>) -> Self {
        Self {
            present: !field.is_empty(),
            iter: field.iter(),
        }
    }

    fn advance(&mut self) -> Result<Option<u64>> {
        if !self.present {
            return Ok(None);
        }
        match self.iter.next() {
            Some(value) => Ok(Some(value?)),
            None => Err(Error::ArityMismatch("dense info arrays")),
        }
    }

    fn check_exhausted(&mut self) -> Result<()> {
        if self.iter.next().is_some() {
            return Err(Error::ArityMismatch("dense info arrays"));
        }
        Ok(())
    }
}

/// Running-sum state for the optional `DenseInfo` arrays.
struct InfoCursors<'a> {
    versions: InfoArray<'a>,
    timestamps: InfoArray<'a>,
    changesets: InfoArray<'a>,
    uids: InfoArray<'a>,
    user_sids: InfoArray<'a>,
    visibles: InfoArray<'a>,
    timestamp_acc: i64,
    changeset_acc: i64,
    uid_acc: i64,
    user_sid_acc: i64,
}

impl<'a> InfoCursors<'a> {
    /// Steps every present array by one; a present array ending early while
    /// ids continue is an arity mismatch.
    fn step(&mut self) -> Result<DenseInfoEntry> {
        let mut entry = DenseInfoEntry::default();
        if let Some(version) = self.versions.advance()? {
            entry.version = Some(version as i32);
        }
        if let Some(delta) = self.timestamps.advance()? {
            self.timestamp_acc += zigzag_decode(delta);
            entry.raw_timestamp = Some(self.timestamp_acc);
        }
        if let Some(delta) = self.changesets.advance()? {
            self.changeset_acc += zigzag_decode(delta);
            entry.changeset = Some(self.changeset_acc);
        }
        if let Some(delta) = self.uids.advance()? {
            self.uid_acc += zigzag_decode(delta);
            entry.uid = Some(self.uid_acc as i32);
        }
        if let Some(delta) = self.user_sids.advance()? {
            self.user_sid_acc += zigzag_decode(delta);
            entry.user_sid = Some(self.user_sid_acc);
        }
        if let Some(visible) = self.visibles.advance()? {
            entry.visible = Some(visible != 0);
        }
        Ok(entry)
    }

    fn check_exhausted(&mut self) -> Result<()> {
        for array in [
            &mut self.versions,
            &mut self.timestamps,
            &mut self.changesets,
            &mut self.uids,
            &mut self.user_sids,
            &mut self.visibles,
        ] {
            array.check_exhausted()?;
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct DenseInfoEntry {
    version: Option<i32>,
    raw_timestamp: Option<i64>,
    changeset: Option<i64>,
    uid: Option<i32>,
    user_sid: Option<i64>,
    visible: Option<bool>,
}

/// Metadata of one dense node, with the deltas already resolved.
#[derive(Clone, Copy)]
pub struct DenseInfo<'a> {
    entry: DenseInfoEntry,
    date_granularity: i64,
    strings: StringTable<'a>,
}

impl<'a> DenseInfo<'a> {
    pub fn version(&self) -> Option<i32> {
        self.entry.version
    }

    pub fn timestamp_millis(&self) -> Option<i64> {
        self.entry
            .raw_timestamp
            .map(|t| t * self.date_granularity)
    }

    pub fn changeset(&self) -> Option<i64> {
        self.entry.changeset
    }

    pub fn uid(&self) -> Option<i32> {
        self.entry.uid
    }

    pub fn visible(&self) -> Option<bool> {
        self.entry.visible
    }

    pub fn user(&self) -> Result<Option<&'a str>> {
        self.entry
            .user_sid
            .map(|sid| {
                if sid < 0 {
                    return Err(Error::Protobuf("negative dense user index"));
                }
                self.strings.get_str(sid as u64)
            })
            .transpose()
    }
}

/// Tag pairs of a single dense node: a bounded replay of the `keys_vals`
/// stream up to the node's `0` terminator.
pub struct DenseTagIter<'a> {
    cursor: PackedIter<'a>,
    strings: StringTable<'a>,
    done: bool,
}

impl<'a> Iterator for DenseTagIter<'a> {
    type Item = Result<(&'a str, &'a str)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let key_sid = match self.cursor.next() {
            None | Some(Ok(0)) => {
                self.done = true;
                return None;
            }
            Some(Ok(sid)) => sid,
            Some(Err(e)) => {
                self.done = true;
                return Some(Err(e));
            }
        };
        let step = (|| {
            let val_sid = match self.cursor.next() {
                Some(sid) => sid?,
                None => return Err(Error::ArityMismatch("dense key without value")),
            };
            Ok((
                self.strings.get_str(key_sid)?,
                self.strings.get_str(val_sid)?,
            ))
        })();
        if step.is_err() {
            self.done = true;
        }
        Some(step)
    }
}

/// One node out of a dense run.
pub struct DenseNode<'a> {
    id: i64,
    lat_raw: i64,
    lon_raw: i64,
    tags: Option<PackedIter<'a>>,
    info: Option<DenseInfoEntry>,
    params: BlockParams,
    strings: StringTable<'a>,
}

impl<'a> DenseNode<'a> {
    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn lat(&self) -> f64 {
        self.params.lat(self.lat_raw)
    }

    pub fn lon(&self) -> f64 {
        self.params.lon(self.lon_raw)
    }

    pub fn tags(&self) -> DenseTagIter<'a> {
        match &self.tags {
            Some(cursor) => DenseTagIter {
                cursor: cursor.clone(),
                strings: self.strings,
                done: false,
            },
            None => DenseTagIter {
                cursor: Packed::Empty.iter(),
                strings: self.strings,
                done: true,
            },
        }
    }

    pub fn info(&self) -> Option<DenseInfo<'a>> {
        self.info.map(|entry| DenseInfo {
            entry,
            date_granularity: self.params.date_granularity,
            strings: self.strings,
        })
    }
}

/// Iterator over a dense run. Single-pass and stateful: ids, coordinates and
/// info fields are running sums that only make sense in order.
pub struct DenseNodeIter<'a> {
    ids: PackedIter<'a>,
    lats: PackedIter<'a>,
    lons: PackedIter<'a>,
    keys_vals: Option<PackedIter<'a>>,
    info: Option<InfoCursors<'a>>,
    id_acc: i64,
    lat_acc: i64,
    lon_acc: i64,
    params: BlockParams,
    strings: StringTable<'a>,
    done: bool,
}

impl<'a> DenseNodeIter<'a> {
    pub(crate) fn new(
        msg: &'a [u8],
        params: BlockParams,
        strings: StringTable<'a>,
    ) -> Result<Self> {
        let fields = DenseFields::parse(msg)?;
        let info = if fields.versions.is_empty()
            && fields.timestamps.is_empty()
            && fields.changesets.is_empty()
            && fields.uids.is_empty()
            && fields.user_sids.is_empty()
            && fields.visibles.is_empty()
        {
            None
        } else {
            Some(InfoCursors {
                versions: InfoArray::new(&fields.versions),
                timestamps: InfoArray::new(&fields.timestamps),
                changesets: InfoArray::new(&fields.changesets),
                uids: InfoArray::new(&fields.uids),
                user_sids: InfoArray::new(&fields.user_sids),
                visibles: InfoArray::new(&fields.visibles),
                timestamp_acc: 0,
                changeset_acc: 0,
                uid_acc: 0,
                user_sid_acc: 0,
            })
        };
        Ok(Self {
            ids: fields.ids.iter(),
            lats: fields.lats.iter(),
            lons: fields.lons.iter(),
            keys_vals: if fields.keys_vals.is_empty() {
                None
            } else {
                Some(fields.keys_vals.iter())
            },
            info,
            id_acc: 0,
            lat_acc: 0,
            lon_acc: 0,
            params,
            strings,
            done: false,
        })
    }

    fn finish(&mut self) -> Result<()> {
        if self.lats.next().is_some() || self.lons.next().is_some() {
            return Err(Error::ArityMismatch("dense id/lat/lon arrays"));
        }
        if let Some(cursor) = &mut self.keys_vals {
            if !cursor.is_exhausted() {
                return Err(Error::ArityMismatch(
                    "dense keys_vals stream longer than node count",
                ));
            }
        }
        if let Some(info) = &mut self.info {
            info.check_exhausted()?;
        }
        Ok(())
    }

    fn step(&mut self, id_delta: u64) -> Result<DenseNode<'a>> {
        let lat_delta = self
            .lats
            .next()
            .ok_or(Error::ArityMismatch("dense id/lat/lon arrays"))??;
        let lon_delta = self
            .lons
            .next()
            .ok_or(Error::ArityMismatch("dense id/lat/lon arrays"))??;

        self.id_acc += zigzag_decode(id_delta);
        self.lat_acc += zigzag_decode(lat_delta);
        self.lon_acc += zigzag_decode(lon_delta);

        // remember where this node's tag pairs start, then skip the parent
        // cursor past them
        let tags = match &mut self.keys_vals {
            Some(cursor) => {
                let start = cursor.clone();
                loop {
                    match cursor.next() {
                        Some(Ok(0)) => break,
                        Some(Ok(_key)) => match cursor.next() {
                            Some(Ok(_val)) => {}
                            Some(Err(e)) => return Err(e),
                            None => {
                                return Err(Error::ArityMismatch("dense key without value"));
                            }
                        },
                        Some(Err(e)) => return Err(e),
                        None => {
                            return Err(Error::ArityMismatch(
                                "dense keys_vals stream shorter than node count",
                            ));
                        }
                    }
                }
                Some(start)
            }
            None => None,
        };

        let info = match &mut self.info {
            Some(cursors) => Some(cursors.step()?),
            None => None,
        };

        Ok(DenseNode {
            id: self.id_acc,
            lat_raw: self.lat_acc,
            lon_raw: self.lon_acc,
            tags,
            info,
            params: self.params,
            strings: self.strings,
        })
    }
}

impl<'a> Iterator for DenseNodeIter<'a> {
    type Item = Result<DenseNode<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.ids.next() {
            None => {
                self.done = true;
                match self.finish() {
                    Ok(()) => None,
                    Err(e) => Some(Err(e)),
                }
            }
            Some(Ok(id_delta)) => {
                let step = self.step(id_delta);
                if step.is_err() {
                    self.done = true;
                }
                Some(step)
            }
            Some(Err(e)) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
