//! B-tree page structure: page types, headers, cells, payload limits

use crate::error::{Error, Result};
use crate::storage::btree::encoding::{read_u16, read_u32, read_varint};
use crate::types::Pgno;

/// Offset of the file header on page 1; B-tree content starts after it.
pub const PAGE1_HEADER_OFFSET: usize = 100;

/// Cell pointer array entry size.
pub const CELL_PTR_SIZE: usize = 2;

/// Maximum cursor stack depth; deeper trees are treated as cyclic.
pub const MAX_DEPTH: usize = 20;

// ============================================================================
// Page Type
// ============================================================================

/// The one-byte B-tree page type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageType {
    IndexInterior = 0x02,
    TableInterior = 0x05,
    IndexLeaf = 0x0A,
    TableLeaf = 0x0D,
}

impl PageType {
    pub fn from_byte(b: u8, pgno: Pgno) -> Result<PageType> {
        match b {
            0x02 => Ok(PageType::IndexInterior),
            0x05 => Ok(PageType::TableInterior),
            0x0A => Ok(PageType::IndexLeaf),
            0x0D => Ok(PageType::TableLeaf),
            _ => Err(Error::CorruptBTree {
                pgno,
                reason: "unknown page type",
            }),
        }
    }

    pub fn is_leaf(self) -> bool {
        matches!(self, PageType::TableLeaf | PageType::IndexLeaf)
    }

    pub fn is_table(self) -> bool {
        matches!(self, PageType::TableLeaf | PageType::TableInterior)
    }

    /// Page header size: interior pages carry a right-child pointer.
    pub fn header_size(self) -> usize {
        if self.is_leaf() {
            8
        } else {
            12
        }
    }
}

// ============================================================================
// Page Header
// ============================================================================

/// Parsed B-tree page header.
#[derive(Debug, Clone, Copy)]
pub struct PageHeader {
    pub ptype: PageType,
    pub cell_count: usize,
    pub content_start: usize,
    /// Right-most child, interior pages only.
    pub right_child: Option<Pgno>,
}

impl PageHeader {
    /// Parse the header at `base` (100 on page 1, 0 elsewhere).
    pub fn parse(bytes: &[u8], base: usize, pgno: Pgno) -> Result<PageHeader> {
        if base + 8 > bytes.len() {
            return Err(Error::CorruptPage {
                pgno,
                reason: "page smaller than its header",
            });
        }
        let ptype = PageType::from_byte(bytes[base], pgno)?;
        let cell_count = read_u16(bytes, base + 3)? as usize;
        let raw_content = read_u16(bytes, base + 5)? as usize;
        let content_start = if raw_content == 0 { 65536 } else { raw_content };
        let right_child = if ptype.is_leaf() {
            None
        } else {
            Some(read_u32(bytes, base + 8)?)
        };
        Ok(PageHeader {
            ptype,
            cell_count,
            content_start,
            right_child,
        })
    }

    /// Offset of cell `i`'s body, via the cell pointer array.
    pub fn cell_offset(&self, bytes: &[u8], base: usize, i: usize, pgno: Pgno) -> Result<usize> {
        let ptr = base + self.ptype.header_size() + i * CELL_PTR_SIZE;
        let off = read_u16(bytes, ptr)? as usize;
        if off >= bytes.len() {
            return Err(Error::CorruptPage {
                pgno,
                reason: "cell pointer out of range",
            });
        }
        Ok(off)
    }
}

// ============================================================================
// Payload Limits
// ============================================================================

/// Local-payload thresholds derived from the usable page size.
#[derive(Debug, Clone, Copy)]
pub struct PayloadLimits {
    pub usable: usize,
    pub max_local_table: usize,
    pub max_local_index: usize,
    pub min_local: usize,
}

impl PayloadLimits {
    pub fn new(usable: u32) -> PayloadLimits {
        let u = usable as usize;
        PayloadLimits {
            usable: u,
            max_local_table: u - 35,
            max_local_index: (u - 12) * 64 / 255 - 23,
            min_local: (u - 12) * 32 / 255 - 23,
        }
    }

    /// Bytes of an oversize payload stored locally on the B-tree page.
    pub fn local_len(&self, payload_len: usize, is_table: bool) -> usize {
        let max_local = if is_table {
            self.max_local_table
        } else {
            self.max_local_index
        };
        if payload_len <= max_local {
            return payload_len;
        }
        let k = self.min_local + (payload_len - self.min_local) % (self.usable - 4);
        if k <= max_local {
            k
        } else {
            self.min_local
        }
    }
}

// ============================================================================
// Cell Parsing
// ============================================================================

/// A parsed cell, with the payload still on its page.
#[derive(Debug, Clone, Copy)]
pub struct ParsedCell {
    /// Table cells: the rowid. Index cells: unset.
    pub rowid: i64,
    /// Interior cells: the left child pointer.
    pub left_child: Option<Pgno>,
    /// Total payload length (local + overflow).
    pub payload_len: usize,
    /// Range of the local payload portion within the page bytes.
    pub local_start: usize,
    pub local_len: usize,
    /// First overflow page, when the payload spills.
    pub overflow: Option<Pgno>,
}

/// Parse the cell at `offset` for the given page type.
pub fn parse_cell(
    bytes: &[u8],
    offset: usize,
    ptype: PageType,
    limits: &PayloadLimits,
    pgno: Pgno,
) -> Result<ParsedCell> {
    let mut pos = offset;
    let left_child = if ptype.is_leaf() {
        None
    } else {
        let child = read_u32(bytes, pos)?;
        pos += 4;
        Some(child)
    };

    if ptype == PageType::TableInterior {
        let (rowid, _) = read_varint(bytes, pos)?;
        return Ok(ParsedCell {
            rowid: rowid as i64,
            left_child,
            payload_len: 0,
            local_start: pos,
            local_len: 0,
            overflow: None,
        });
    }

    let (payload_len, n) = read_varint(bytes, pos)?;
    let payload_len = payload_len as usize;
    pos += n;

    let mut rowid = 0i64;
    if ptype == PageType::TableLeaf {
        let (r, n) = read_varint(bytes, pos)?;
        rowid = r as i64;
        pos += n;
    }

    let local_len = limits.local_len(payload_len, ptype.is_table());
    if pos + local_len > bytes.len() {
        return Err(Error::CorruptPage {
            pgno,
            reason: "cell payload extends past end of page",
        });
    }
    let overflow = if local_len < payload_len {
        Some(read_u32(bytes, pos + local_len)?)
    } else {
        None
    };
    Ok(ParsedCell {
        rowid,
        left_child,
        payload_len,
        local_start: pos,
        local_len,
        overflow,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_type_decode() {
        assert_eq!(PageType::from_byte(0x0D, 2).unwrap(), PageType::TableLeaf);
        assert_eq!(
            PageType::from_byte(0x02, 2).unwrap(),
            PageType::IndexInterior
        );
        assert!(PageType::from_byte(0x03, 2).is_err());
    }

    #[test]
    fn test_local_len_small_payload_stays_local() {
        let limits = PayloadLimits::new(4096);
        assert_eq!(limits.local_len(100, true), 100);
        assert_eq!(limits.local_len(limits.max_local_table, true), limits.max_local_table);
    }

    #[test]
    fn test_local_len_oversize_is_bounded() {
        let limits = PayloadLimits::new(4096);
        for payload in [5000usize, 9000, 123_456] {
            for is_table in [true, false] {
                let local = limits.local_len(payload, is_table);
                assert!(local >= limits.min_local);
                let max = if is_table {
                    limits.max_local_table
                } else {
                    limits.max_local_index
                };
                assert!(local <= max);
            }
        }
    }
}
