//! Database file header
//!
//! The first 100 bytes of page 1 carry the file header. Layout is the
//! SQLite v3 format: big-endian fixed-width fields at fixed offsets.

use crate::error::{Error, Result};
use crate::types::Pgno;

/// Size of the file header at the start of page 1.
pub const HEADER_SIZE: usize = 100;

/// Magic string at offset 0.
pub const FILE_MAGIC: &[u8; 16] = b"SQLite format 3\0";

/// Legacy (journal DELETE) file format version.
const FORMAT_LEGACY: u8 = 1;

/// Schema format number written into fresh files.
const SCHEMA_FORMAT: u32 = 4;

/// UTF-8 text encoding tag.
const ENCODING_UTF8: u32 = 1;

/// Library version number stamped at offset 96 of files we produce.
const VERSION_NUMBER: u32 = 3_037_000;

/// Parsed file header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbHeader {
    /// Page size in bytes (512..=65536, power of two).
    pub page_size: u32,
    /// File format write version (1 = journal DELETE).
    pub write_version: u8,
    /// File format read version.
    pub read_version: u8,
    /// Reserved bytes at the end of every page.
    pub reserved_per_page: u8,
    /// File change counter.
    pub change_counter: u32,
    /// Database size in pages.
    pub page_count: Pgno,
    /// First freelist trunk page (0 = none).
    pub freelist_head: Pgno,
    /// Total freelist pages.
    pub freelist_count: u32,
    /// Schema cookie, bumped on DDL.
    pub schema_cookie: u32,
    /// Schema format number.
    pub schema_format: u32,
    /// Text encoding (1 = UTF-8).
    pub text_encoding: u32,
}

impl DbHeader {
    /// Parse the 100-byte header.
    pub fn parse(bytes: &[u8]) -> Result<DbHeader> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::CorruptPage {
                pgno: 1,
                reason: "truncated file header",
            });
        }
        if &bytes[0..16] != FILE_MAGIC {
            return Err(Error::CorruptPage {
                pgno: 1,
                reason: "bad magic",
            });
        }
        let raw_size = u16::from_be_bytes([bytes[16], bytes[17]]);
        // 1 encodes a 65536-byte page.
        let page_size = if raw_size == 1 {
            65536
        } else {
            raw_size as u32
        };
        if !(512..=65536).contains(&page_size) || !page_size.is_power_of_two() {
            return Err(Error::CorruptPage {
                pgno: 1,
                reason: "invalid page size",
            });
        }
        let be32 = |off: usize| u32::from_be_bytes([bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]]);
        let text_encoding = be32(56);
        if text_encoding != 0 && text_encoding != ENCODING_UTF8 {
            return Err(Error::CorruptPage {
                pgno: 1,
                reason: "unsupported text encoding",
            });
        }
        Ok(DbHeader {
            page_size,
            write_version: bytes[18],
            read_version: bytes[19],
            reserved_per_page: bytes[20],
            change_counter: be32(24),
            page_count: be32(28),
            freelist_head: be32(32),
            freelist_count: be32(36),
            schema_cookie: be32(40),
            schema_format: be32(44),
            text_encoding,
        })
    }

    /// Usable bytes per page.
    pub fn usable_size(&self) -> u32 {
        self.page_size - self.reserved_per_page as u32
    }

    /// Serialize into the 100-byte header form.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..16].copy_from_slice(FILE_MAGIC);
        let raw_size: u16 = if self.page_size == 65536 {
            1
        } else {
            self.page_size as u16
        };
        out[16..18].copy_from_slice(&raw_size.to_be_bytes());
        out[18] = self.write_version;
        out[19] = self.read_version;
        out[20] = self.reserved_per_page;
        out[21] = 64; // max embedded payload fraction
        out[22] = 32; // min embedded payload fraction
        out[23] = 32; // leaf payload fraction
        out[24..28].copy_from_slice(&self.change_counter.to_be_bytes());
        out[28..32].copy_from_slice(&self.page_count.to_be_bytes());
        out[32..36].copy_from_slice(&self.freelist_head.to_be_bytes());
        out[36..40].copy_from_slice(&self.freelist_count.to_be_bytes());
        out[40..44].copy_from_slice(&self.schema_cookie.to_be_bytes());
        out[44..48].copy_from_slice(&self.schema_format.to_be_bytes());
        out[56..60].copy_from_slice(&self.text_encoding.to_be_bytes());
        // Version-valid-for mirrors the change counter.
        out[92..96].copy_from_slice(&self.change_counter.to_be_bytes());
        out[96..100].copy_from_slice(&VERSION_NUMBER.to_be_bytes());
        out
    }

    /// Header for a fresh one-page database.
    pub fn fresh(page_size: u32) -> DbHeader {
        DbHeader {
            page_size,
            write_version: FORMAT_LEGACY,
            read_version: FORMAT_LEGACY,
            reserved_per_page: 0,
            change_counter: 1,
            page_count: 1,
            freelist_head: 0,
            freelist_count: 0,
            schema_cookie: 0,
            schema_format: SCHEMA_FORMAT,
            text_encoding: ENCODING_UTF8,
        }
    }

    /// Build the full page-1 image of an empty database: header followed
    /// by an empty schema table leaf.
    pub fn new_image(page_size: u32) -> Vec<u8> {
        let header = DbHeader::fresh(page_size);
        let mut image = vec![0u8; page_size as usize];
        image[..HEADER_SIZE].copy_from_slice(&header.encode());
        // Empty table-leaf page header at offset 100.
        image[HEADER_SIZE] = 0x0D;
        // First freeblock: none.
        image[HEADER_SIZE + 1] = 0;
        image[HEADER_SIZE + 2] = 0;
        // Cell count: 0.
        image[HEADER_SIZE + 3] = 0;
        image[HEADER_SIZE + 4] = 0;
        // Cell content area starts at the end of the page (65536 -> 0).
        let content: u16 = if page_size == 65536 {
            0
        } else {
            page_size as u16
        };
        image[HEADER_SIZE + 5..HEADER_SIZE + 7].copy_from_slice(&content.to_be_bytes());
        image
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = DbHeader::fresh(4096);
        let parsed = DbHeader::parse(&header.encode()).unwrap();
        assert_eq!(header, parsed);
    }

    #[test]
    fn test_rejects_bad_magic() {
        let mut bytes = DbHeader::fresh(4096).encode();
        bytes[0] = b'X';
        assert!(DbHeader::parse(&bytes).is_err());
    }

    #[test]
    fn test_page_size_one_means_64k() {
        let header = DbHeader::fresh(65536);
        let encoded = header.encode();
        assert_eq!(u16::from_be_bytes([encoded[16], encoded[17]]), 1);
        assert_eq!(DbHeader::parse(&encoded).unwrap().page_size, 65536);
    }

    #[test]
    fn test_new_image_has_empty_schema_leaf() {
        let image = DbHeader::new_image(512);
        assert_eq!(image.len(), 512);
        assert_eq!(image[HEADER_SIZE], 0x0D);
        assert_eq!(image[HEADER_SIZE + 3], 0);
        assert_eq!(image[HEADER_SIZE + 4], 0);
    }
}
