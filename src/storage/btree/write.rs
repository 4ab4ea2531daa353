//! B-tree writer
//!
//! Insert-only maintenance for table and index B-trees. Pages are decoded
//! into cell lists, modified, and re-encoded; a page that no longer fits
//! splits, promoting a separator into the parent (recursively, growing a
//! new root level in place when the root itself splits). Oversize payloads
//! spill onto a chain of freshly allocated overflow pages.

use std::cmp::Ordering;

use crate::error::{Error, Result};
use crate::storage::btree::encoding::{read_u32, read_varint, varint_len, write_u16, write_u32, write_varint};
use crate::storage::btree::types::{parse_cell, PageHeader, PageType, PayloadLimits, PAGE1_HEADER_OFFSET};
use crate::storage::record::decode_record;
use crate::types::{cmp_columns, Pgno, RowId, SortOrder};

// ============================================================================
// Page Store
// ============================================================================

/// Mutable page access for the writer. Implemented by the transaction's
/// shadow layer.
pub trait PageStore {
    fn read_image(&self, pgno: Pgno) -> Result<Vec<u8>>;
    fn write_image(&mut self, pgno: Pgno, image: Vec<u8>) -> Result<()>;
    fn allocate(&mut self) -> Pgno;
    fn page_size(&self) -> u32;
    fn usable_size(&self) -> u32;
}

fn base_of(pgno: Pgno) -> usize {
    if pgno == 1 {
        PAGE1_HEADER_OFFSET
    } else {
        0
    }
}

// ============================================================================
// Node Representation
// ============================================================================

/// A page decoded into its cell list.
struct Node {
    ptype: PageType,
    cells: Vec<Vec<u8>>,
    right_child: Pgno,
}

fn parse_node(image: &[u8], pgno: Pgno, limits: &PayloadLimits) -> Result<Node> {
    let base = base_of(pgno);
    let header = PageHeader::parse(image, base, pgno)?;
    let mut cells = Vec::with_capacity(header.cell_count);
    for i in 0..header.cell_count {
        let off = header.cell_offset(image, base, i, pgno)?;
        let end = cell_end(image, off, header.ptype, limits, pgno)?;
        cells.push(image[off..end].to_vec());
    }
    Ok(Node {
        ptype: header.ptype,
        cells,
        right_child: header.right_child.unwrap_or(0),
    })
}

/// Byte length of the cell starting at `off`.
fn cell_end(
    image: &[u8],
    off: usize,
    ptype: PageType,
    limits: &PayloadLimits,
    pgno: Pgno,
) -> Result<usize> {
    let cell = parse_cell(image, off, ptype, limits, pgno)?;
    if ptype == PageType::TableInterior {
        return Ok(cell.local_start + varint_len(cell.rowid as u64));
    }
    let mut end = cell.local_start + cell.local_len;
    if cell.overflow.is_some() {
        end += 4;
    }
    Ok(end)
}

/// Re-encode a node into a page image, or None when it does not fit.
fn encode_node(node: &Node, pgno: Pgno, page_size: u32, usable: u32) -> Option<Vec<u8>> {
    let base = base_of(pgno);
    let hdr = node.ptype.header_size();
    let n = node.cells.len();
    let content: usize = node.cells.iter().map(|c| c.len()).sum();
    let content_start = (usable as usize).checked_sub(content)?;
    if content_start < base + hdr + 2 * n {
        return None;
    }
    let mut image = vec![0u8; page_size as usize];
    image[base] = node.ptype as u8;
    write_u16(&mut image, base + 3, n as u16);
    let raw_start = if content_start == 65536 {
        0
    } else {
        content_start as u16
    };
    write_u16(&mut image, base + 5, raw_start);
    if !node.ptype.is_leaf() {
        write_u32(&mut image, base + 8, node.right_child);
    }
    let mut pos = content_start;
    for (i, cell) in node.cells.iter().enumerate() {
        image[pos..pos + cell.len()].copy_from_slice(cell);
        write_u16(&mut image, base + hdr + 2 * i, pos as u16);
        pos += cell.len();
    }
    Some(image)
}

/// Left child of an interior cell.
fn cell_child(cell: &[u8]) -> Pgno {
    u32::from_be_bytes([cell[0], cell[1], cell[2], cell[3]])
}

fn set_cell_child(cell: &mut [u8], child: Pgno) {
    cell[0..4].copy_from_slice(&child.to_be_bytes());
}

/// Rowid of a table cell (leaf or interior).
fn cell_rowid(cell: &[u8], ptype: PageType) -> Result<RowId> {
    match ptype {
        PageType::TableInterior => {
            let (rowid, _) = read_varint(cell, 4)?;
            Ok(rowid as i64)
        }
        PageType::TableLeaf => {
            let (_, n) = read_varint(cell, 0)?;
            let (rowid, _) = read_varint(cell, n)?;
            Ok(rowid as i64)
        }
        _ => Err(Error::CorruptRecord("rowid requested from index cell")),
    }
}

/// Full payload of an index cell, following overflow through the store.
fn index_cell_payload(store: &dyn PageStore, cell: &[u8], ptype: PageType) -> Result<Vec<u8>> {
    let limits = PayloadLimits::new(store.usable_size());
    let skip = if ptype.is_leaf() { 0 } else { 4 };
    let (payload_len, n) = read_varint(cell, skip)?;
    let payload_len = payload_len as usize;
    let local = limits.local_len(payload_len, false);
    let start = skip + n;
    let mut out = cell[start..start + local].to_vec();
    if local < payload_len {
        let mut pgno = read_u32(cell, start + local)?;
        let mut remaining = payload_len - local;
        while remaining > 0 {
            if pgno == 0 {
                return Err(Error::CorruptBTree {
                    pgno,
                    reason: "broken overflow chain",
                });
            }
            let image = store.read_image(pgno)?;
            let take = (limits.usable - 4).min(remaining);
            out.extend_from_slice(&image[4..4 + take]);
            pgno = read_u32(&image, 0)?;
            remaining -= take;
        }
    }
    Ok(out)
}

/// Compare two index entry payloads column-by-column under `orders`; the
/// trailing rowid column participates ascending.
fn compare_entries(a: &[u8], b: &[u8], orders: &[SortOrder]) -> Result<Ordering> {
    let av = decode_record(a)?;
    let bv = decode_record(b)?;
    for (i, (x, y)) in av.iter().zip(bv.iter()).enumerate() {
        let order = orders.get(i).copied().unwrap_or_default();
        let ord = order.apply(cmp_columns(x, y));
        if ord != Ordering::Equal {
            return Ok(ord);
        }
    }
    Ok(av.len().cmp(&bv.len()))
}

// ============================================================================
// Cell Construction
// ============================================================================

/// Build a leaf cell for `payload`, spilling to overflow pages as needed.
fn build_leaf_cell(
    store: &mut dyn PageStore,
    is_table: bool,
    rowid: RowId,
    payload: &[u8],
) -> Result<Vec<u8>> {
    let limits = PayloadLimits::new(store.usable_size());
    let local = limits.local_len(payload.len(), is_table);
    let mut cell = Vec::with_capacity(local + 18);
    write_varint(payload.len() as u64, &mut cell);
    if is_table {
        write_varint(rowid as u64, &mut cell);
    }
    cell.extend_from_slice(&payload[..local]);
    if local < payload.len() {
        let first = write_overflow_chain(store, &payload[local..])?;
        cell.extend_from_slice(&first.to_be_bytes());
    }
    Ok(cell)
}

fn write_overflow_chain(store: &mut dyn PageStore, rest: &[u8]) -> Result<Pgno> {
    let usable = store.usable_size() as usize;
    let page_size = store.page_size() as usize;
    let chunk = usable - 4;
    let chunks: Vec<&[u8]> = rest.chunks(chunk).collect();
    let pgnos: Vec<Pgno> = chunks.iter().map(|_| store.allocate()).collect();
    for (i, part) in chunks.iter().enumerate() {
        let mut image = vec![0u8; page_size];
        let next = pgnos.get(i + 1).copied().unwrap_or(0);
        write_u32(&mut image, 0, next);
        image[4..4 + part.len()].copy_from_slice(part);
        store.write_image(pgnos[i], image)?;
    }
    Ok(pgnos[0])
}

// ============================================================================
// Tree Operations
// ============================================================================

/// Allocate and initialize an empty leaf page; returns its page number.
pub fn init_tree(store: &mut dyn PageStore, ptype: PageType) -> Result<Pgno> {
    debug_assert!(ptype.is_leaf());
    let pgno = store.allocate();
    let node = Node {
        ptype,
        cells: Vec::new(),
        right_child: 0,
    };
    let image = encode_node(&node, pgno, store.page_size(), store.usable_size())
        .expect("empty leaf always fits");
    store.write_image(pgno, image)?;
    Ok(pgno)
}

/// Insert `(rowid, record)` into the table B-tree rooted at `root`.
/// A duplicate rowid is a unique violation of the rowid key.
pub fn table_insert(
    store: &mut dyn PageStore,
    root: Pgno,
    rowid: RowId,
    record: &[u8],
) -> Result<()> {
    let limits = PayloadLimits::new(store.usable_size());
    let mut path: Vec<(Pgno, usize)> = Vec::new();
    let mut pgno = root;
    let mut node = loop {
        let node = parse_node(&store.read_image(pgno)?, pgno, &limits)?;
        match node.ptype {
            PageType::TableLeaf => break node,
            PageType::TableInterior => {
                let mut slot = node.cells.len();
                for (i, cell) in node.cells.iter().enumerate() {
                    if cell_rowid(cell, PageType::TableInterior)? >= rowid {
                        slot = i;
                        break;
                    }
                }
                let child = if slot < node.cells.len() {
                    cell_child(&node.cells[slot])
                } else {
                    node.right_child
                };
                path.push((pgno, slot));
                pgno = child;
            }
            _ => {
                return Err(Error::CorruptBTree {
                    pgno,
                    reason: "index page inside a table tree",
                })
            }
        }
    };

    let mut pos = node.cells.len();
    for (i, cell) in node.cells.iter().enumerate() {
        let r = cell_rowid(cell, PageType::TableLeaf)?;
        match r.cmp(&rowid) {
            Ordering::Equal => return Err(Error::UniqueViolation("rowid".into())),
            Ordering::Greater => {
                pos = i;
                break;
            }
            Ordering::Less => {}
        }
    }
    let cell = build_leaf_cell(store, true, rowid, record)?;
    node.cells.insert(pos, cell);
    write_with_splits(store, pgno, node, path, root)
}

/// Insert an index entry payload into the index B-tree rooted at `root`.
pub fn index_insert(
    store: &mut dyn PageStore,
    root: Pgno,
    entry: &[u8],
    orders: &[SortOrder],
) -> Result<()> {
    let limits = PayloadLimits::new(store.usable_size());
    let mut path: Vec<(Pgno, usize)> = Vec::new();
    let mut pgno = root;
    let mut node = loop {
        let node = parse_node(&store.read_image(pgno)?, pgno, &limits)?;
        match node.ptype {
            PageType::IndexLeaf => break node,
            PageType::IndexInterior => {
                let mut slot = node.cells.len();
                for (i, cell) in node.cells.iter().enumerate() {
                    let key = index_cell_payload(store, cell, PageType::IndexInterior)?;
                    if compare_entries(&key, entry, orders)? != Ordering::Less {
                        slot = i;
                        break;
                    }
                }
                let child = if slot < node.cells.len() {
                    cell_child(&node.cells[slot])
                } else {
                    node.right_child
                };
                path.push((pgno, slot));
                pgno = child;
            }
            _ => {
                return Err(Error::CorruptBTree {
                    pgno,
                    reason: "table page inside an index tree",
                })
            }
        }
    };

    let mut pos = node.cells.len();
    for (i, cell) in node.cells.iter().enumerate() {
        let key = index_cell_payload(store, cell, PageType::IndexLeaf)?;
        if compare_entries(&key, entry, orders)? != Ordering::Less {
            pos = i;
            break;
        }
    }
    let cell = build_leaf_cell(store, false, 0, entry)?;
    node.cells.insert(pos, cell);
    write_with_splits(store, pgno, node, path, root)
}

/// Write `node` back to `pgno`, splitting upward while pages overflow.
fn write_with_splits(
    store: &mut dyn PageStore,
    mut pgno: Pgno,
    mut node: Node,
    mut path: Vec<(Pgno, usize)>,
    root: Pgno,
) -> Result<()> {
    let page_size = store.page_size();
    let usable = store.usable_size();
    let limits = PayloadLimits::new(usable);
    loop {
        if let Some(image) = encode_node(&node, pgno, page_size, usable) {
            return store.write_image(pgno, image);
        }

        let (left, sep, right) = split_node(&mut node)?;
        if pgno == root {
            // The root keeps its page number; both halves move to fresh
            // pages and the root becomes a one-cell interior node.
            let left_pg = store.allocate();
            let right_pg = store.allocate();
            let left_img = encode_node(&left, left_pg, page_size, usable)
                .ok_or(Error::CorruptBTree { pgno, reason: "split half does not fit" })?;
            let right_img = encode_node(&right, right_pg, page_size, usable)
                .ok_or(Error::CorruptBTree { pgno, reason: "split half does not fit" })?;
            store.write_image(left_pg, left_img)?;
            store.write_image(right_pg, right_img)?;
            let mut sep = sep;
            set_cell_child(&mut sep, left_pg);
            node = Node {
                ptype: interior_of(left.ptype),
                cells: vec![sep],
                right_child: right_pg,
            };
            continue;
        }

        let right_pg = store.allocate();
        let left_img = encode_node(&left, pgno, page_size, usable)
            .ok_or(Error::CorruptBTree { pgno, reason: "split half does not fit" })?;
        let right_img = encode_node(&right, right_pg, page_size, usable)
            .ok_or(Error::CorruptBTree { pgno, reason: "split half does not fit" })?;
        store.write_image(pgno, left_img)?;
        store.write_image(right_pg, right_img)?;

        let (parent_pg, parent_slot) = path.pop().expect("non-root page without parent");
        let mut parent = parse_node(&store.read_image(parent_pg)?, parent_pg, &limits)?;
        let mut sep = sep;
        set_cell_child(&mut sep, pgno);
        if parent_slot < parent.cells.len() {
            // The old pointer to this page moves past the separator and
            // now refers to the right half.
            parent.cells.insert(parent_slot, sep);
            set_cell_child(&mut parent.cells[parent_slot + 1], right_pg);
        } else {
            parent.cells.push(sep);
            parent.right_child = right_pg;
        }
        node = parent;
        pgno = parent_pg;
    }
}

fn interior_of(leaf: PageType) -> PageType {
    match leaf {
        PageType::TableLeaf | PageType::TableInterior => PageType::TableInterior,
        _ => PageType::IndexInterior,
    }
}

/// Split an overfull node. Returns the left half, the separator cell in
/// parent form (left-child bytes zeroed, to be patched by the caller),
/// and the right half.
fn split_node(node: &mut Node) -> Result<(Node, Vec<u8>, Node)> {
    let n = node.cells.len();
    if n < 2 {
        return Err(Error::CorruptBTree {
            pgno: 0,
            reason: "cannot split a page with fewer than two cells",
        });
    }
    let total: usize = node.cells.iter().map(|c| c.len() + 2).sum();
    let mut acc = 0usize;
    let mut k = n / 2;
    for (i, cell) in node.cells.iter().enumerate() {
        acc += cell.len() + 2;
        if acc >= total / 2 {
            k = i;
            break;
        }
    }

    match node.ptype {
        PageType::TableLeaf => {
            let k = k.clamp(0, n - 2);
            let right_cells = node.cells.split_off(k + 1);
            let left_cells = std::mem::take(&mut node.cells);
            let sep_rowid = cell_rowid(left_cells.last().expect("left half is non-empty"), PageType::TableLeaf)?;
            let mut sep = vec![0u8; 4];
            write_varint(sep_rowid as u64, &mut sep);
            Ok((
                Node { ptype: PageType::TableLeaf, cells: left_cells, right_child: 0 },
                sep,
                Node { ptype: PageType::TableLeaf, cells: right_cells, right_child: 0 },
            ))
        }
        PageType::IndexLeaf => {
            let k = k.clamp(1, n - 2);
            let mut right_cells = node.cells.split_off(k);
            let promoted = right_cells.remove(0);
            let left_cells = std::mem::take(&mut node.cells);
            let mut sep = vec![0u8; 4];
            sep.extend_from_slice(&promoted);
            Ok((
                Node { ptype: PageType::IndexLeaf, cells: left_cells, right_child: 0 },
                sep,
                Node { ptype: PageType::IndexLeaf, cells: right_cells, right_child: 0 },
            ))
        }
        PageType::TableInterior | PageType::IndexInterior => {
            let k = k.clamp(1, n - 2);
            let mut right_cells = node.cells.split_off(k);
            let promoted = right_cells.remove(0);
            let left_cells = std::mem::take(&mut node.cells);
            let left = Node {
                ptype: node.ptype,
                cells: left_cells,
                right_child: cell_child(&promoted),
            };
            let right = Node {
                ptype: node.ptype,
                cells: right_cells,
                right_child: node.right_child,
            };
            // The promoted cell's child pointer is rewritten to the left
            // half by the caller; keep its bytes as the separator.
            Ok((left, promoted, right))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Minimal in-memory store for exercising the writer directly.
    struct MemStore {
        pages: HashMap<Pgno, Vec<u8>>,
        next: Pgno,
        page_size: u32,
    }

    impl MemStore {
        fn new(page_size: u32) -> Self {
            MemStore {
                pages: HashMap::new(),
                next: 1,
                page_size,
            }
        }
    }

    impl PageStore for MemStore {
        fn read_image(&self, pgno: Pgno) -> Result<Vec<u8>> {
            self.pages
                .get(&pgno)
                .cloned()
                .ok_or(Error::InvalidPage(pgno))
        }

        fn write_image(&mut self, pgno: Pgno, image: Vec<u8>) -> Result<()> {
            self.pages.insert(pgno, image);
            Ok(())
        }

        fn allocate(&mut self) -> Pgno {
            let pgno = self.next;
            self.next += 1;
            pgno
        }

        fn page_size(&self) -> u32 {
            self.page_size
        }

        fn usable_size(&self) -> u32 {
            self.page_size
        }
    }

    fn scan_rowids(store: &MemStore, root: Pgno) -> Vec<RowId> {
        // Walk the tree recursively; enough for writer unit tests.
        fn walk(store: &MemStore, pgno: Pgno, out: &mut Vec<RowId>) {
            let limits = PayloadLimits::new(store.page_size);
            let image = store.read_image(pgno).unwrap();
            let node = parse_node(&image, pgno, &limits).unwrap();
            match node.ptype {
                PageType::TableLeaf => {
                    for cell in &node.cells {
                        out.push(cell_rowid(cell, PageType::TableLeaf).unwrap());
                    }
                }
                PageType::TableInterior => {
                    for cell in &node.cells {
                        walk(store, cell_child(cell), out);
                    }
                    walk(store, node.right_child, out);
                }
                _ => panic!("unexpected page type"),
            }
        }
        let mut out = Vec::new();
        walk(store, root, &mut out);
        out
    }

    #[test]
    fn test_insert_and_split_keeps_rowid_order() {
        let mut store = MemStore::new(512);
        let root = init_tree(&mut store, PageType::TableLeaf).unwrap();
        let record = crate::storage::record::encode_record(&[crate::types::Value::Text(
            "payload-payload-payload".into(),
        )]);
        // Interleave ascending and descending inserts to force splits on
        // both edges.
        let mut rowids: Vec<RowId> = (1..=200).collect();
        let reversed: Vec<RowId> = (201..=400).rev().collect();
        for r in rowids.iter().chain(reversed.iter()) {
            table_insert(&mut store, root, *r, &record).unwrap();
        }
        rowids.extend(201..=400);
        let scanned = scan_rowids(&store, root);
        assert_eq!(scanned, rowids);
    }

    #[test]
    fn test_duplicate_rowid_rejected() {
        let mut store = MemStore::new(512);
        let root = init_tree(&mut store, PageType::TableLeaf).unwrap();
        let record = crate::storage::record::encode_record(&[crate::types::Value::Integer(1)]);
        table_insert(&mut store, root, 7, &record).unwrap();
        assert!(matches!(
            table_insert(&mut store, root, 7, &record),
            Err(Error::UniqueViolation(_))
        ));
    }

    #[test]
    fn test_oversize_payload_spills_to_overflow() {
        let mut store = MemStore::new(512);
        let root = init_tree(&mut store, PageType::TableLeaf).unwrap();
        let record = crate::storage::record::encode_record(&[crate::types::Value::Text(
            "x".repeat(3000),
        )]);
        table_insert(&mut store, root, 1, &record).unwrap();
        // Root leaf plus at least one overflow page were written.
        assert!(store.pages.len() >= 2);
        let limits = PayloadLimits::new(512);
        let image = store.read_image(root).unwrap();
        let node = parse_node(&image, root, &limits).unwrap();
        let cell = parse_cell(&image, {
            let header = PageHeader::parse(&image, 0, root).unwrap();
            header.cell_offset(&image, 0, 0, root).unwrap()
        }, node.ptype, &limits, root)
        .unwrap();
        assert!(cell.overflow.is_some());
        assert_eq!(cell.payload_len, record.len());
    }
}
