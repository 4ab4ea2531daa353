//! B-tree reader
//!
//! [`BtCursor`] walks one table or index B-tree: seek, ordered scan, and
//! payload access. Descent chooses children by binary search within the
//! interior cell array; oversize payloads are reassembled from overflow
//! pages into a per-cursor scratch buffer reused across cells.
//!
//! Table B-trees keep rows only in leaves and produce ascending rowids.
//! Index B-trees carry entries on interior pages too, so the scan is an
//! in-order traversal producing non-decreasing keys with rowids ascending
//! within equal keys.

pub mod encoding;
pub mod types;
pub mod write;

use std::cmp::Ordering;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::storage::record::decode_record;
use crate::storage::source::{Page, PageSource};
use crate::types::{cmp_column_value, CancelToken, Pgno, RowId, SortOrder, Value};

use types::{parse_cell, PageHeader, PageType, ParsedCell, PayloadLimits, MAX_DEPTH, PAGE1_HEADER_OFFSET};

// ============================================================================
// Cursor State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CursorState {
    BeforeFirst,
    Valid,
    AtEnd,
}

/// One level of the descent stack.
struct Frame {
    pgno: Pgno,
    page: Page,
    base: usize,
    header: PageHeader,
    /// Leaf: current cell. Table interior: child index descended into.
    /// Index interior: cells emitted so far / current cell when `on_cell`.
    slot: usize,
    /// Index interior only: positioned on cell `slot` itself.
    on_cell: bool,
}

/// Where the current cell's payload lives.
enum PayloadLoc {
    /// Within the top frame's page bytes.
    Local { start: usize, len: usize },
    /// Reassembled from overflow pages into the scratch buffer.
    Scratch,
}

struct CellInfo {
    rowid: RowId,
    payload: PayloadLoc,
}

// ============================================================================
// BtCursor
// ============================================================================

/// A cursor over one B-tree, bound to a single root page.
pub struct BtCursor {
    src: Arc<dyn PageSource>,
    root: Pgno,
    limits: PayloadLimits,
    is_table: Option<bool>,
    stack: Vec<Frame>,
    scratch: Vec<u8>,
    state: CursorState,
    info: Option<CellInfo>,
    snapshot: Option<u64>,
    cancel: Option<CancelToken>,
}

impl BtCursor {
    /// Open a cursor at `root`. `usable` is the usable page size.
    pub fn new(src: Arc<dyn PageSource>, root: Pgno, usable: u32) -> BtCursor {
        BtCursor {
            src,
            root,
            limits: PayloadLimits::new(usable),
            is_table: None,
            stack: Vec::new(),
            scratch: Vec::new(),
            state: CursorState::BeforeFirst,
            info: None,
            snapshot: None,
            cancel: None,
        }
    }

    /// Attach a cancel token, checked at leaf transitions.
    pub fn with_cancel(mut self, cancel: CancelToken) -> BtCursor {
        self.cancel = Some(cancel);
        self
    }

    /// The data version this cursor's snapshot is pinned to, if any page
    /// has been fetched yet.
    pub fn snapshot_version(&self) -> Option<u64> {
        self.snapshot
    }

    // ------------------------------------------------------------------
    // Page loading
    // ------------------------------------------------------------------

    fn load(&mut self, pgno: Pgno) -> Result<(Page, usize, PageHeader)> {
        match self.snapshot {
            None => self.snapshot = Some(self.src.data_version()),
            Some(v) => {
                if self.src.data_version() != v {
                    return Err(Error::SnapshotStale);
                }
            }
        }
        let page = self.src.page(pgno)?;
        let base = if pgno == 1 { PAGE1_HEADER_OFFSET } else { 0 };
        let header = PageHeader::parse(page.bytes(), base, pgno)?;
        match self.is_table {
            None => self.is_table = Some(header.ptype.is_table()),
            Some(t) => {
                if header.ptype.is_table() != t {
                    return Err(Error::CorruptBTree {
                        pgno,
                        reason: "page-type mismatch during descent",
                    });
                }
            }
        }
        Ok((page, base, header))
    }

    fn push(&mut self, pgno: Pgno, page: Page, base: usize, header: PageHeader, slot: usize) -> Result<()> {
        if self.stack.len() >= MAX_DEPTH {
            return Err(Error::CorruptBTree {
                pgno,
                reason: "descent too deep, cycle suspected",
            });
        }
        self.stack.push(Frame {
            pgno,
            page,
            base,
            header,
            slot,
            on_cell: false,
        });
        Ok(())
    }

    fn reset(&mut self) {
        self.stack.clear();
        self.info = None;
        self.state = CursorState::BeforeFirst;
    }

    fn check_cancel(&self) -> Result<()> {
        if let Some(tok) = &self.cancel {
            if tok.is_canceled() {
                return Err(Error::Canceled);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Cell access
    // ------------------------------------------------------------------

    fn frame_cell(&self, frame: &Frame, slot: usize) -> Result<ParsedCell> {
        let bytes = frame.page.bytes();
        let off = frame.header.cell_offset(bytes, frame.base, slot, frame.pgno)?;
        parse_cell(bytes, off, frame.header.ptype, &self.limits, frame.pgno)
    }

    /// Child page for descent position `c` of an interior frame.
    fn child_at(&self, frame: &Frame, c: usize) -> Result<Pgno> {
        if c < frame.header.cell_count {
            Ok(self
                .frame_cell(frame, c)?
                .left_child
                .expect("interior cell without child"))
        } else {
            frame.header.right_child.ok_or(Error::CorruptBTree {
                pgno: frame.pgno,
                reason: "interior page without right child",
            })
        }
    }

    /// Make the cell at the top frame's current position current,
    /// reassembling overflow into the scratch buffer when needed.
    fn load_current(&mut self) -> Result<()> {
        let top = self.stack.last().expect("no frame to load from");
        let cell = self.frame_cell(top, top.slot)?;
        let payload = if let Some(first) = cell.overflow {
            let local = top.page.bytes()[cell.local_start..cell.local_start + cell.local_len].to_vec();
            self.assemble_overflow(&local, cell.payload_len, first)?;
            PayloadLoc::Scratch
        } else {
            PayloadLoc::Local {
                start: cell.local_start,
                len: cell.local_len,
            }
        };
        self.info = Some(CellInfo {
            rowid: cell.rowid,
            payload,
        });
        self.state = CursorState::Valid;
        Ok(())
    }

    fn assemble_overflow(&mut self, local: &[u8], total: usize, first: Pgno) -> Result<()> {
        self.scratch.clear();
        self.scratch.extend_from_slice(local);
        let mut remaining = total - local.len();
        let mut pgno = first;
        let mut hops = 0usize;
        while remaining > 0 {
            if pgno == 0 || hops > self.src.page_count() as usize {
                return Err(Error::CorruptBTree {
                    pgno,
                    reason: "broken overflow chain",
                });
            }
            let page = self.src.page(pgno)?;
            let bytes = page.bytes();
            let next = encoding::read_u32(bytes, 0)?;
            let avail = self.limits.usable - 4;
            let take = avail.min(remaining);
            if 4 + take > bytes.len() {
                return Err(Error::CorruptPage {
                    pgno,
                    reason: "overflow page too small",
                });
            }
            self.scratch.extend_from_slice(&bytes[4..4 + take]);
            remaining -= take;
            pgno = next;
            hops += 1;
        }
        Ok(())
    }

    /// Payload bytes of an arbitrary cell, allocating only when the cell
    /// overflows. Used by index binary search during descent.
    fn cell_payload_owned(&self, frame: &Frame, slot: usize) -> Result<Vec<u8>> {
        let cell = self.frame_cell(frame, slot)?;
        let bytes = frame.page.bytes();
        let local = &bytes[cell.local_start..cell.local_start + cell.local_len];
        match cell.overflow {
            None => Ok(local.to_vec()),
            Some(first) => {
                let mut out = local.to_vec();
                let mut remaining = cell.payload_len - cell.local_len;
                let mut pgno = first;
                let mut hops = 0usize;
                while remaining > 0 {
                    if pgno == 0 || hops > self.src.page_count() as usize {
                        return Err(Error::CorruptBTree {
                            pgno,
                            reason: "broken overflow chain",
                        });
                    }
                    let page = self.src.page(pgno)?;
                    let pb = page.bytes();
                    let next = encoding::read_u32(pb, 0)?;
                    let take = (self.limits.usable - 4).min(remaining);
                    out.extend_from_slice(&pb[4..4 + take]);
                    remaining -= take;
                    pgno = next;
                    hops += 1;
                }
                Ok(out)
            }
        }
    }

    // ------------------------------------------------------------------
    // Positioning
    // ------------------------------------------------------------------

    /// Advance to the next cell in key order. Returns false past the end.
    pub fn move_next(&mut self) -> Result<bool> {
        match self.state {
            CursorState::AtEnd => Ok(false),
            CursorState::BeforeFirst => self.first(),
            CursorState::Valid => self.advance(),
        }
    }

    /// Position at the first cell. Returns false for an empty tree.
    pub fn first(&mut self) -> Result<bool> {
        self.reset();
        self.descend_leftmost(self.root)
    }

    /// Position at the last cell. Returns false for an empty tree.
    pub fn last(&mut self) -> Result<bool> {
        self.reset();
        let mut pgno = self.root;
        loop {
            let (page, base, header) = self.load(pgno)?;
            if header.ptype.is_leaf() {
                if header.cell_count == 0 {
                    self.state = CursorState::AtEnd;
                    return Ok(false);
                }
                let slot = header.cell_count - 1;
                self.push(pgno, page, base, header, slot)?;
                self.load_current()?;
                return Ok(true);
            }
            let slot = header.cell_count;
            self.push(pgno, page, base, header, slot)?;
            let top = self.stack.last().expect("frame just pushed");
            pgno = self.child_at(top, slot)?;
        }
    }

    fn descend_leftmost(&mut self, mut pgno: Pgno) -> Result<bool> {
        loop {
            let (page, base, header) = self.load(pgno)?;
            if header.ptype.is_leaf() {
                self.push(pgno, page, base, header, 0)?;
                if header.cell_count == 0 {
                    // Only an empty root has an empty leaf.
                    self.stack.pop();
                    return self.ascend();
                }
                self.load_current()?;
                return Ok(true);
            }
            self.push(pgno, page, base, header, 0)?;
            let top = self.stack.last().expect("frame just pushed");
            pgno = self.child_at(top, 0)?;
        }
    }

    fn advance(&mut self) -> Result<bool> {
        let top = self.stack.last_mut().expect("valid cursor without frames");
        if top.header.ptype.is_leaf() {
            if top.slot + 1 < top.header.cell_count {
                top.slot += 1;
                self.load_current()?;
                return Ok(true);
            }
            self.stack.pop();
            self.ascend()
        } else {
            // Index interior, positioned on a cell: continue into the
            // subtree to its right.
            debug_assert!(top.on_cell);
            top.slot += 1;
            top.on_cell = false;
            let child = {
                let top = self.stack.last().expect("frame present");
                self.child_at(top, top.slot)?
            };
            self.descend_leftmost(child)
        }
    }

    /// Pop exhausted frames until a position exists; AtEnd otherwise.
    fn ascend(&mut self) -> Result<bool> {
        self.check_cancel()?;
        loop {
            let Some(top) = self.stack.last_mut() else {
                self.state = CursorState::AtEnd;
                self.info = None;
                return Ok(false);
            };
            match top.header.ptype {
                PageType::TableInterior => {
                    top.slot += 1;
                    if top.slot <= top.header.cell_count {
                        let child = {
                            let top = self.stack.last().expect("frame present");
                            self.child_at(top, top.slot)?
                        };
                        return self.descend_leftmost(child);
                    }
                    self.stack.pop();
                }
                PageType::IndexInterior => {
                    if !top.on_cell && top.slot < top.header.cell_count {
                        top.on_cell = true;
                        self.load_current()?;
                        return Ok(true);
                    }
                    self.stack.pop();
                }
                _ => {
                    self.stack.pop();
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Seeking
    // ------------------------------------------------------------------

    /// Descend to the leaf cell whose rowid equals `key`. On a miss the
    /// cursor rests at the first cell with rowid > `key` (or past the
    /// end) and the result is false.
    pub fn table_seek(&mut self, key: RowId) -> Result<bool> {
        self.reset();
        let mut pgno = self.root;
        loop {
            let (page, base, header) = self.load(pgno)?;
            match header.ptype {
                PageType::TableLeaf => {
                    let mut lo = 0usize;
                    let mut hi = header.cell_count;
                    self.push(pgno, page, base, header, 0)?;
                    let top_idx = self.stack.len() - 1;
                    while lo < hi {
                        let mid = (lo + hi) / 2;
                        let cell = self.frame_cell(&self.stack[top_idx], mid)?;
                        if cell.rowid < key {
                            lo = mid + 1;
                        } else {
                            hi = mid;
                        }
                    }
                    if lo < self.stack[top_idx].header.cell_count {
                        self.stack[top_idx].slot = lo;
                        self.load_current()?;
                        let exact = self.info.as_ref().map(|i| i.rowid) == Some(key);
                        return Ok(exact);
                    }
                    self.stack.pop();
                    self.ascend()?;
                    return Ok(false);
                }
                PageType::TableInterior => {
                    let mut lo = 0usize;
                    let mut hi = header.cell_count;
                    self.push(pgno, page, base, header, 0)?;
                    let top_idx = self.stack.len() - 1;
                    while lo < hi {
                        let mid = (lo + hi) / 2;
                        let cell = self.frame_cell(&self.stack[top_idx], mid)?;
                        if cell.rowid < key {
                            lo = mid + 1;
                        } else {
                            hi = mid;
                        }
                    }
                    self.stack[top_idx].slot = lo;
                    let top = &self.stack[top_idx];
                    pgno = self.child_at(top, lo)?;
                }
                _ => {
                    return Err(Error::CorruptBTree {
                        pgno,
                        reason: "index page inside a table tree",
                    })
                }
            }
        }
    }

    /// Position at the first index entry whose key prefix is ≥ (or > when
    /// `allow_equal` is false) the target, comparing decoded entry columns
    /// against `key` under the index column `orders`. Returns whether the
    /// resting entry's prefix equals the target.
    pub fn index_seek(
        &mut self,
        key: &[Value],
        orders: &[SortOrder],
        allow_equal: bool,
    ) -> Result<bool> {
        self.reset();
        let mut pgno = self.root;
        loop {
            let (page, base, header) = self.load(pgno)?;
            match header.ptype {
                PageType::IndexLeaf | PageType::IndexInterior => {
                    let is_leaf = header.ptype.is_leaf();
                    self.push(pgno, page, base, header, 0)?;
                    let top_idx = self.stack.len() - 1;
                    let mut lo = 0usize;
                    let mut hi = self.stack[top_idx].header.cell_count;
                    while lo < hi {
                        let mid = (lo + hi) / 2;
                        let payload = self.cell_payload_owned(&self.stack[top_idx], mid)?;
                        let ord = compare_index_key(&payload, key, orders)?;
                        let past = match ord {
                            Ordering::Greater => true,
                            Ordering::Equal => allow_equal,
                            Ordering::Less => false,
                        };
                        if past {
                            hi = mid;
                        } else {
                            lo = mid + 1;
                        }
                    }
                    if is_leaf {
                        if lo < self.stack[top_idx].header.cell_count {
                            self.stack[top_idx].slot = lo;
                            self.load_current()?;
                        } else {
                            self.stack.pop();
                            if !self.ascend()? {
                                return Ok(false);
                            }
                        }
                        let exact =
                            compare_index_key(self.payload()?, key, orders)? == Ordering::Equal;
                        return Ok(exact);
                    }
                    // Entries below the chosen cell may still satisfy the
                    // bound; the pop-back path positions on the cell itself
                    // when they do not.
                    self.stack[top_idx].slot = lo;
                    let top = &self.stack[top_idx];
                    pgno = self.child_at(top, lo)?;
                }
                _ => {
                    return Err(Error::CorruptBTree {
                        pgno,
                        reason: "table page inside an index tree",
                    })
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Current cell
    // ------------------------------------------------------------------

    pub fn is_valid(&self) -> bool {
        self.state == CursorState::Valid
    }

    /// The current cell's record bytes.
    pub fn payload(&self) -> Result<&[u8]> {
        let info = self.info.as_ref().ok_or(Error::Misuse("cursor is not positioned"))?;
        match &info.payload {
            PayloadLoc::Scratch => Ok(&self.scratch),
            PayloadLoc::Local { start, len } => {
                let top = self.stack.last().ok_or(Error::Misuse("cursor is not positioned"))?;
                Ok(&top.page.bytes()[*start..*start + *len])
            }
        }
    }

    /// Current rowid. For index cursors this is the trailing rowid column
    /// of the entry.
    pub fn rowid(&self) -> Result<RowId> {
        let info = self.info.as_ref().ok_or(Error::Misuse("cursor is not positioned"))?;
        if self.is_table == Some(true) {
            return Ok(info.rowid);
        }
        let values = decode_record(self.payload()?)?;
        match values.last() {
            Some(crate::types::ColumnValue::Integer(r)) => Ok(*r),
            _ => Err(Error::CorruptRecord("index entry without trailing rowid")),
        }
    }
}

/// Compare an index entry payload's leading columns against `key` under
/// the per-column sort `orders`. An exhausted key compares Equal, so a
/// prefix match reports Equal.
pub fn compare_index_key(
    payload: &[u8],
    key: &[Value],
    orders: &[SortOrder],
) -> Result<Ordering> {
    let entry = decode_record(payload)?;
    for (i, target) in key.iter().enumerate() {
        let Some(col) = entry.get(i) else {
            return Ok(Ordering::Less);
        };
        let order = orders.get(i).copied().unwrap_or_default();
        let ord = order.apply(cmp_column_value(col, target));
        if ord != Ordering::Equal {
            return Ok(ord);
        }
    }
    Ok(Ordering::Equal)
}
