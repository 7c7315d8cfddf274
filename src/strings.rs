//! Lazy view over a block's string table.
//!
//! The table is a `StringTable` sub-message (repeated `bytes`, field 1)
//! inside the decompressed block. It is scanned once into a list of
//! `(offset, len)` pairs on first access; lookups afterwards are O(1) slices
//! into the block buffer. Index 0 is the empty sentinel, which dense-node
//! key/value streams use as a terminator.

use std::str;

use crate::error::{Error, Result};
use crate::varint::{read_len_delim, read_tag, skip_field, WireType};

const ENTRY_FIELD: u32 = 1;

/// `(offset, len)` of every table entry, absolute within the block buffer.
///
/// This is the memoized part; it holds no borrow so it can live inside the
/// block it indexes.
#[derive(Debug, Default)]
pub(crate) struct StringTableIndex {
    entries: Vec<(u32, u32)>,
}

impl StringTableIndex {
    /// Scans the table sub-message located at `range` within `block`.
    pub(crate) fn scan(block: &[u8], range: (usize, usize)) -> Result<StringTableIndex> {
        let buf = &block[range.0..range.1];
        let mut entries = Vec::new();
        let mut pos = 0;
        while pos < buf.len() {
            let (field, wire, consumed) = read_tag(buf, pos)?;
            pos += consumed;
            if field == ENTRY_FIELD && wire == WireType::LengthDelim {
                let (entry, consumed) = read_len_delim(buf, pos)?;
                let start = range.0 + pos + consumed - entry.len();
                entries.push((start as u32, entry.len() as u32));
                pos += consumed;
            } else {
                pos += skip_field(buf, pos, wire)?;
            }
        }
        Ok(StringTableIndex { entries })
    }
}

/// Borrowed lookup handle, produced by
/// [`DecodedBlock::string_table`](crate::block::DecodedBlock::string_table).
#[derive(Debug, Clone, Copy)]
pub struct StringTable<'a> {
    block: &'a [u8],
    index: &'a StringTableIndex,
}

impl<'a> StringTable<'a> {
    pub(crate) fn new(block: &'a [u8], index: &'a StringTableIndex) -> Self {
        Self { block, index }
    }

    pub fn len(&self) -> usize {
        self.index.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.entries.is_empty()
    }

    /// Raw bytes of entry `i`.
    pub fn get(&self, i: u64) -> Result<&'a [u8]> {
        let (offset, len) = *self
            .index
            .entries
            .get(usize::try_from(i).unwrap_or(usize::MAX))
            .ok_or(Error::StringIndexOutOfRange {
                index: i,
                len: self.index.entries.len(),
            })?;
        Ok(&self.block[offset as usize..(offset + len) as usize])
    }

    /// Entry `i` as UTF-8. OSM strings are UTF-8 by spec; anything else is a
    /// malformed block.
    pub fn get_str(&self, i: u64) -> Result<&'a str> {
        str::from_utf8(self.get(i)?).map_err(|_| Error::Protobuf("string table entry not utf-8"))
    }

    pub fn iter(&self) -> impl Iterator<Item = &'a [u8]> + '_ {
        let block = self.block;
        self.index
            .entries
            .iter()
            .map(move |&(offset, len)| &block[offset as usize..(offset + len) as usize])
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// Encodes a `StringTable` message out of the given entries.
    fn table(entries: &[&[u8]]) -> Vec<u8> {
        let mut buf = Vec::new();
        for entry in entries {
            buf.push(0x0a);
            buf.push(entry.len() as u8);
            buf.extend_from_slice(entry);
        }
        buf
    }

    #[test]
    fn lookup_and_iteration() {
        let buf = table(&[b"", b"highway", b"primary"]);
        let index = StringTableIndex::scan(&buf, (0, buf.len())).unwrap();
        let st = StringTable::new(&buf, &index);
        assert_eq!(st.len(), 3);
        assert_eq!(st.get(0).unwrap(), b"");
        assert_eq!(st.get_str(1).unwrap(), "highway");
        assert_eq!(st.get_str(2).unwrap(), "primary");
        let all: Vec<&[u8]> = st.iter().collect();
        assert_eq!(all, [&b""[..], b"highway", b"primary"]);
    }

    #[test]
    fn out_of_range_index() {
        let buf = table(&[b""]);
        let index = StringTableIndex::scan(&buf, (0, buf.len())).unwrap();
        let st = StringTable::new(&buf, &index);
        assert!(matches!(
            st.get(1),
            Err(Error::StringIndexOutOfRange { index: 1, len: 1 })
        ));
    }

    #[test]
    fn embedded_in_larger_buffer() {
        let inner = table(&[b"water"]);
        let mut buf = vec![0xff, 0xee];
        let start = buf.len();
        buf.extend_from_slice(&inner);
        let end = buf.len();
        buf.push(0xdd);
        let index = StringTableIndex::scan(&buf, (start, end)).unwrap();
        let st = StringTable::new(&buf, &index);
        assert_eq!(st.get(0).unwrap(), b"water");
    }
}
