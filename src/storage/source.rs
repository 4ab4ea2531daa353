//! Page sources
//!
//! A page source reads pages 1..N from a byte-addressable backing. Two
//! variants: [`MemoryPageSource`] over an owned byte buffer, and
//! [`FilePageSource`] with a fixed-capacity LRU cache of whole pages.
//!
//! Returned [`Page`] handles never alias mutable state: each one is either
//! a window into the sole in-memory copy or a stable cache slot that
//! writers replace rather than mutate.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use log::trace;

use crate::error::{Error, Result};
use crate::storage::header::{DbHeader, HEADER_SIZE};
use crate::types::Pgno;

/// Default capacity of the file-backed page cache, in pages.
pub const DEFAULT_CACHE_PAGES: usize = 2000;

// ============================================================================
// Page Handle
// ============================================================================

/// A read-only handle onto one page's bytes
///
/// Cloning is cheap; the underlying buffer is shared and immutable for the
/// lifetime of the handle, so cursors can pin pages across cache eviction.
#[derive(Clone)]
pub struct Page {
    buf: Arc<[u8]>,
    start: usize,
    len: usize,
}

impl Page {
    fn whole(buf: Arc<[u8]>) -> Self {
        let len = buf.len();
        Page { buf, start: 0, len }
    }

    fn window(buf: Arc<[u8]>, start: usize, len: usize) -> Self {
        Page { buf, start, len }
    }

    /// Wrap a whole-page buffer from another source layer.
    pub(crate) fn from_arc(buf: Arc<[u8]>) -> Self {
        Page::whole(buf)
    }

    /// The page body.
    pub fn bytes(&self) -> &[u8] {
        &self.buf[self.start..self.start + self.len]
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Page({} bytes)", self.len)
    }
}

// ============================================================================
// PageSource Trait
// ============================================================================

/// Byte-addressable backing for a database image.
pub trait PageSource: Send + Sync {
    /// Number of pages in the database image.
    fn page_count(&self) -> Pgno;

    /// Page size in bytes.
    fn page_size(&self) -> u32;

    /// Fetch page `pgno` (1-based).
    fn page(&self, pgno: Pgno) -> Result<Page>;

    /// Replace page `pgno`. Writing one page past the end grows the image.
    fn write_page(&self, pgno: Pgno, data: &[u8]) -> Result<()> {
        let _ = (pgno, data);
        Err(Error::ReadOnly)
    }

    /// Drop any cached copy of page `pgno`.
    fn invalidate(&self, pgno: Pgno);

    /// Monotonically increasing counter, bumped on every write.
    fn data_version(&self) -> u64;

    /// Whether this source accepts writes at all.
    fn is_read_only(&self) -> bool;
}

/// Validate a page number against the current count.
fn check_pgno(pgno: Pgno, count: Pgno) -> Result<()> {
    if pgno == 0 || pgno > count {
        return Err(Error::InvalidPage(pgno));
    }
    Ok(())
}

/// Parse the header out of raw image bytes and check the declared page
/// count against the backing size.
fn header_of(bytes: &[u8]) -> Result<DbHeader> {
    if bytes.len() < HEADER_SIZE {
        return Err(Error::CorruptPage {
            pgno: 1,
            reason: "backing smaller than the file header",
        });
    }
    let header = DbHeader::parse(&bytes[..HEADER_SIZE])?;
    let declared = header.page_count as u64 * header.page_size as u64;
    if declared > bytes.len() as u64 {
        return Err(Error::CorruptPage {
            pgno: 1,
            reason: "declared page count exceeds backing size",
        });
    }
    Ok(header)
}

// ============================================================================
// Memory Source
// ============================================================================

enum MemBacking {
    /// One immutable buffer; pages are windows into it.
    Fixed(Arc<[u8]>),
    /// One buffer per page, replaced wholesale on write.
    Paged(RwLock<Vec<Arc<[u8]>>>),
}

/// Page source over an in-memory database image.
pub struct MemoryPageSource {
    backing: MemBacking,
    page_size: u32,
    page_count: AtomicU32,
    version: AtomicU64,
}

impl MemoryPageSource {
    /// Open a read-only source over an existing database image.
    pub fn open(bytes: Vec<u8>) -> Result<Self> {
        let header = header_of(&bytes)?;
        Ok(MemoryPageSource {
            backing: MemBacking::Fixed(Arc::from(bytes)),
            page_size: header.page_size,
            page_count: AtomicU32::new(header.page_count),
            version: AtomicU64::new(0),
        })
    }

    /// Open a writable source over an existing database image.
    pub fn open_writable(bytes: Vec<u8>) -> Result<Self> {
        let header = header_of(&bytes)?;
        let size = header.page_size as usize;
        let pages = bytes
            .chunks(size)
            .take(header.page_count as usize)
            .map(|c| {
                let mut page = vec![0u8; size];
                page[..c.len()].copy_from_slice(c);
                Arc::from(page)
            })
            .collect();
        Ok(MemoryPageSource {
            backing: MemBacking::Paged(RwLock::new(pages)),
            page_size: header.page_size,
            page_count: AtomicU32::new(header.page_count),
            version: AtomicU64::new(0),
        })
    }

    /// Create an empty writable source holding a fresh one-page image.
    pub fn create(page_size: u32) -> Self {
        let image = DbHeader::new_image(page_size);
        MemoryPageSource {
            backing: MemBacking::Paged(RwLock::new(vec![Arc::from(image)])),
            page_size,
            page_count: AtomicU32::new(1),
            version: AtomicU64::new(0),
        }
    }
}

impl PageSource for MemoryPageSource {
    fn page_count(&self) -> Pgno {
        self.page_count.load(Ordering::Acquire)
    }

    fn page_size(&self) -> u32 {
        self.page_size
    }

    fn page(&self, pgno: Pgno) -> Result<Page> {
        check_pgno(pgno, self.page_count())?;
        let size = self.page_size as usize;
        match &self.backing {
            MemBacking::Fixed(buf) => {
                let start = (pgno as usize - 1) * size;
                if start + size > buf.len() {
                    return Err(Error::CorruptPage {
                        pgno,
                        reason: "page extends past end of backing",
                    });
                }
                Ok(Page::window(Arc::clone(buf), start, size))
            }
            MemBacking::Paged(pages) => {
                let pages = pages.read().expect("page table lock poisoned");
                Ok(Page::whole(Arc::clone(&pages[pgno as usize - 1])))
            }
        }
    }

    fn write_page(&self, pgno: Pgno, data: &[u8]) -> Result<()> {
        let pages = match &self.backing {
            MemBacking::Fixed(_) => return Err(Error::ReadOnly),
            MemBacking::Paged(p) => p,
        };
        let count = self.page_count();
        if pgno == 0 || pgno > count + 1 {
            return Err(Error::InvalidPage(pgno));
        }
        let mut pages = pages.write().expect("page table lock poisoned");
        let slot: Arc<[u8]> = Arc::from(data.to_vec());
        if pgno > count {
            pages.push(slot);
            self.page_count.store(pgno, Ordering::Release);
        } else {
            pages[pgno as usize - 1] = slot;
        }
        self.version.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn invalidate(&self, _pgno: Pgno) {}

    fn data_version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    fn is_read_only(&self) -> bool {
        matches!(self.backing, MemBacking::Fixed(_))
    }
}

// ============================================================================
// File Source
// ============================================================================

/// LRU cache of whole pages, keyed by page number.
struct PageCache {
    slots: HashMap<Pgno, Arc<[u8]>>,
    order: Vec<Pgno>,
    capacity: usize,
}

impl PageCache {
    fn new(capacity: usize) -> Self {
        PageCache {
            slots: HashMap::with_capacity(capacity),
            order: Vec::with_capacity(capacity),
            capacity,
        }
    }

    fn get(&mut self, pgno: Pgno) -> Option<Arc<[u8]>> {
        let hit = self.slots.get(&pgno).cloned();
        if hit.is_some() {
            self.touch(pgno);
        }
        hit
    }

    fn put(&mut self, pgno: Pgno, data: Arc<[u8]>) {
        if self.slots.insert(pgno, data).is_none() {
            self.order.push(pgno);
            if self.order.len() > self.capacity {
                let victim = self.order.remove(0);
                self.slots.remove(&victim);
            }
        } else {
            self.touch(pgno);
        }
    }

    fn remove(&mut self, pgno: Pgno) {
        if self.slots.remove(&pgno).is_some() {
            self.order.retain(|&p| p != pgno);
        }
    }

    fn touch(&mut self, pgno: Pgno) {
        if let Some(pos) = self.order.iter().position(|&p| p == pgno) {
            self.order.remove(pos);
            self.order.push(pgno);
        }
    }
}

/// Page source over a database file, with an in-process page cache.
pub struct FilePageSource {
    file: Mutex<File>,
    cache: Mutex<PageCache>,
    page_size: u32,
    page_count: AtomicU32,
    version: AtomicU64,
    read_only: bool,
}

impl FilePageSource {
    /// Open a database file.
    pub fn open(path: &Path, read_only: bool) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)?;
        let mut header_bytes = [0u8; HEADER_SIZE];
        file.read_exact(&mut header_bytes).map_err(|_| Error::CorruptPage {
            pgno: 1,
            reason: "file smaller than the file header",
        })?;
        let header = DbHeader::parse(&header_bytes)?;
        let file_len = file.metadata()?.len();
        if header.page_count as u64 * header.page_size as u64 > file_len {
            return Err(Error::CorruptPage {
                pgno: 1,
                reason: "declared page count exceeds file size",
            });
        }
        Ok(FilePageSource {
            file: Mutex::new(file),
            cache: Mutex::new(PageCache::new(DEFAULT_CACHE_PAGES)),
            page_size: header.page_size,
            page_count: AtomicU32::new(header.page_count),
            version: AtomicU64::new(0),
            read_only,
        })
    }

    /// Create a fresh single-page database file, truncating any existing one.
    pub fn create(path: &Path, page_size: u32) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let image = DbHeader::new_image(page_size);
        file.write_all(&image)?;
        file.sync_all()?;
        Ok(FilePageSource {
            file: Mutex::new(file),
            cache: Mutex::new(PageCache::new(DEFAULT_CACHE_PAGES)),
            page_size,
            page_count: AtomicU32::new(1),
            version: AtomicU64::new(0),
            read_only: false,
        })
    }
}

impl PageSource for FilePageSource {
    fn page_count(&self) -> Pgno {
        self.page_count.load(Ordering::Acquire)
    }

    fn page_size(&self) -> u32 {
        self.page_size
    }

    fn page(&self, pgno: Pgno) -> Result<Page> {
        check_pgno(pgno, self.page_count())?;
        {
            let mut cache = self.cache.lock().expect("page cache lock poisoned");
            if let Some(slot) = cache.get(pgno) {
                trace!("page cache hit: {}", pgno);
                return Ok(Page::whole(slot));
            }
        }
        trace!("page cache miss: {}", pgno);
        let size = self.page_size as usize;
        let mut buf = vec![0u8; size];
        {
            let mut file = self.file.lock().expect("database file lock poisoned");
            file.seek(SeekFrom::Start((pgno as u64 - 1) * size as u64))?;
            file.read_exact(&mut buf).map_err(|_| Error::CorruptPage {
                pgno,
                reason: "short read",
            })?;
        }
        let slot: Arc<[u8]> = Arc::from(buf);
        let mut cache = self.cache.lock().expect("page cache lock poisoned");
        cache.put(pgno, Arc::clone(&slot));
        Ok(Page::whole(slot))
    }

    fn write_page(&self, pgno: Pgno, data: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        let count = self.page_count();
        if pgno == 0 || pgno > count + 1 {
            return Err(Error::InvalidPage(pgno));
        }
        let size = self.page_size as usize;
        {
            let mut file = self.file.lock().expect("database file lock poisoned");
            file.seek(SeekFrom::Start((pgno as u64 - 1) * size as u64))?;
            file.write_all(data)?;
        }
        if pgno > count {
            self.page_count.store(pgno, Ordering::Release);
        }
        let slot: Arc<[u8]> = Arc::from(data.to_vec());
        self.cache
            .lock()
            .expect("page cache lock poisoned")
            .put(pgno, slot);
        self.version.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn invalidate(&self, pgno: Pgno) {
        self.cache
            .lock()
            .expect("page cache lock poisoned")
            .remove(pgno);
    }

    fn data_version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}
