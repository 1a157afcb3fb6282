//! Page structures for Strata storage.

use serde::{Deserialize, Serialize};

/// Page size in bytes (16 KB).
pub const PAGE_SIZE: usize = 16 * 1024;

/// Unique identifier for a page within a file.
///
/// PageId consists of a file ID and page number within that file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PageId {
    /// File identifier.
    pub file_id: u32,
    /// Page number within the file (0-indexed, page 0 holds metadata).
    pub page_num: u32,
}

impl PageId {
    /// Creates a new PageId.
    pub fn new(file_id: u32, page_num: u32) -> Self {
        Self { file_id, page_num }
    }

    /// Returns the PageId as a single u64 for compact storage.
    pub fn as_u64(&self) -> u64 {
        ((self.file_id as u64) << 32) | (self.page_num as u64)
    }

    /// Creates a PageId from a u64 representation.
    pub fn from_u64(value: u64) -> Self {
        Self {
            file_id: (value >> 32) as u32,
            page_num: value as u32,
        }
    }
}

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.file_id, self.page_num)
    }
}

/// Page types in Strata storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum PageType {
    /// Unallocated/free page.
    Free = 0,
    /// Component metadata page (page 0 of every component file).
    ComponentMeta = 1,
    /// B+ tree leaf page.
    BTreeLeaf = 2,
    /// B+ tree internal page.
    BTreeInternal = 3,
    /// Bloom filter bit page.
    BloomFilter = 4,
}

impl PageType {
    /// Decodes a page type byte. Unknown values yield None.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(PageType::Free),
            1 => Some(PageType::ComponentMeta),
            2 => Some(PageType::BTreeLeaf),
            3 => Some(PageType::BTreeInternal),
            4 => Some(PageType::BloomFilter),
            _ => None,
        }
    }
}

/// Header structure at the beginning of every page.
///
/// Layout (32 bytes total):
/// - page_id: 8 bytes (file_id: 4, page_num: 4)
/// - page_type: 1 byte
/// - flags: 1 byte
/// - free_space_offset: 2 bytes
/// - entry_count: 2 bytes
/// - reserved: 2 bytes
/// - checksum: 4 bytes
/// - reserved: 12 bytes
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PageHeader {
    /// Unique page identifier.
    pub page_id: PageId,
    /// Type of this page.
    pub page_type: PageType,
    /// Page flags.
    pub flags: PageFlags,
    /// Offset to the start of free space within the page.
    pub free_space_offset: u16,
    /// Number of entries on this page.
    pub entry_count: u16,
    /// CRC32 checksum of the page contents (computed with this field zeroed).
    pub checksum: u32,
}

impl PageHeader {
    /// Size of the page header in bytes.
    pub const SIZE: usize = 32;

    /// Byte offset of the checksum field inside the header.
    pub const CHECKSUM_OFFSET: usize = 16;

    /// Creates a new page header.
    pub fn new(page_id: PageId, page_type: PageType) -> Self {
        Self {
            page_id,
            page_type,
            flags: PageFlags::empty(),
            free_space_offset: Self::SIZE as u16,
            entry_count: 0,
            checksum: 0,
        }
    }

    /// Returns the amount of free space available on this page.
    pub fn free_space(&self) -> usize {
        PAGE_SIZE - self.free_space_offset as usize
    }

    /// Serializes the header to bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.page_id.file_id.to_le_bytes());
        buf[4..8].copy_from_slice(&self.page_id.page_num.to_le_bytes());
        buf[8] = self.page_type as u8;
        buf[9] = self.flags.0;
        buf[10..12].copy_from_slice(&self.free_space_offset.to_le_bytes());
        buf[12..14].copy_from_slice(&self.entry_count.to_le_bytes());
        // bytes 14-15 are reserved (already zeroed)
        buf[16..20].copy_from_slice(&self.checksum.to_le_bytes());
        // bytes 20-31 are reserved (already zeroed)
        buf
    }

    /// Deserializes the header from bytes.
    ///
    /// Returns None when the page type byte is not a known type.
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        let file_id = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let page_num = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let page_type = PageType::from_u8(buf[8])?;
        let flags = PageFlags(buf[9]);
        let free_space_offset = u16::from_le_bytes([buf[10], buf[11]]);
        let entry_count = u16::from_le_bytes([buf[12], buf[13]]);
        let checksum = u32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]);

        Some(Self {
            page_id: PageId::new(file_id, page_num),
            page_type,
            flags,
            free_space_offset,
            entry_count,
            checksum,
        })
    }
}

/// Flags for on-disk page state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageFlags(u8);

impl PageFlags {
    /// No flags set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Page belongs to a sealed, immutable component file.
    pub const SEALED: u8 = 0b0000_0001;
    /// Header checksum field is valid.
    pub const CHECKSUMMED: u8 = 0b0000_0010;

    /// Returns true if the sealed flag is set.
    pub fn is_sealed(&self) -> bool {
        self.0 & Self::SEALED != 0
    }

    /// Sets the sealed flag.
    pub fn set_sealed(&mut self, sealed: bool) {
        if sealed {
            self.0 |= Self::SEALED;
        } else {
            self.0 &= !Self::SEALED;
        }
    }

    /// Returns true if the checksum flag is set.
    pub fn is_checksummed(&self) -> bool {
        self.0 & Self::CHECKSUMMED != 0
    }

    /// Sets the checksum flag.
    pub fn set_checksummed(&mut self, checksummed: bool) {
        if checksummed {
            self.0 |= Self::CHECKSUMMED;
        } else {
            self.0 &= !Self::CHECKSUMMED;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_id_new() {
        let page_id = PageId::new(1, 100);
        assert_eq!(page_id.file_id, 1);
        assert_eq!(page_id.page_num, 100);
    }

    #[test]
    fn test_page_id_roundtrip_edge_cases() {
        for page_id in [
            PageId::new(0, 0),
            PageId::new(u32::MAX, u32::MAX),
            PageId::new(0, u32::MAX),
            PageId::new(u32::MAX, 0),
            PageId::new(42, 1000),
        ] {
            assert_eq!(page_id, PageId::from_u64(page_id.as_u64()));
        }
    }

    #[test]
    fn test_page_id_as_u64_bit_layout() {
        let page_id = PageId::new(1, 2);
        // file_id (1) in upper 32 bits, page_num (2) in lower 32 bits
        assert_eq!(page_id.as_u64(), (1u64 << 32) | 2);
    }

    #[test]
    fn test_page_id_display() {
        assert_eq!(PageId::new(5, 123).to_string(), "5:123");
        assert_eq!(PageId::new(0, 0).to_string(), "0:0");
    }

    #[test]
    fn test_page_id_ordering_groups_by_file() {
        let mut ids = vec![PageId::new(2, 0), PageId::new(1, 7), PageId::new(1, 3)];
        ids.sort();
        assert_eq!(
            ids,
            vec![PageId::new(1, 3), PageId::new(1, 7), PageId::new(2, 0)]
        );
    }

    #[test]
    fn test_page_type_from_u8() {
        for page_type in [
            PageType::Free,
            PageType::ComponentMeta,
            PageType::BTreeLeaf,
            PageType::BTreeInternal,
            PageType::BloomFilter,
        ] {
            assert_eq!(PageType::from_u8(page_type as u8), Some(page_type));
        }
        assert_eq!(PageType::from_u8(200), None);
    }

    #[test]
    fn test_page_header_new() {
        let page_id = PageId::new(0, 42);
        let header = PageHeader::new(page_id, PageType::BTreeLeaf);

        assert_eq!(header.page_id, page_id);
        assert_eq!(header.page_type, PageType::BTreeLeaf);
        assert!(!header.flags.is_sealed());
        assert_eq!(header.free_space_offset, PageHeader::SIZE as u16);
        assert_eq!(header.entry_count, 0);
        assert_eq!(header.free_space(), PAGE_SIZE - PageHeader::SIZE);
    }

    #[test]
    fn test_page_header_bytes_layout() {
        let mut header = PageHeader::new(PageId::new(7, 9), PageType::BTreeInternal);
        header.entry_count = 12;
        header.checksum = 0xDEAD_BEEF;
        header.flags.set_sealed(true);

        let bytes = header.to_bytes();
        assert_eq!(bytes[8], PageType::BTreeInternal as u8);
        assert_eq!(
            &bytes[PageHeader::CHECKSUM_OFFSET..PageHeader::CHECKSUM_OFFSET + 4],
            &0xDEAD_BEEFu32.to_le_bytes()
        );

        let decoded = PageHeader::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.page_id, PageId::new(7, 9));
        assert_eq!(decoded.entry_count, 12);
        assert_eq!(decoded.checksum, 0xDEAD_BEEF);
        assert!(decoded.flags.is_sealed());
    }

    #[test]
    fn test_page_header_rejects_unknown_type() {
        let mut bytes = PageHeader::new(PageId::new(0, 0), PageType::Free).to_bytes();
        bytes[8] = 99;
        assert!(PageHeader::from_bytes(&bytes).is_none());
    }

    #[test]
    fn test_page_flags() {
        let mut flags = PageFlags::empty();
        assert!(!flags.is_sealed());
        assert!(!flags.is_checksummed());

        flags.set_sealed(true);
        flags.set_checksummed(true);
        assert!(flags.is_sealed());
        assert!(flags.is_checksummed());

        flags.set_sealed(false);
        assert!(!flags.is_sealed());
        assert!(flags.is_checksummed());
        assert_eq!(PageFlags::default(), PageFlags::empty());
    }

    #[test]
    fn test_page_id_serde_roundtrip() {
        let original = PageId::new(10, 500);
        let serialized = serde_json::to_string(&original).unwrap();
        let deserialized: PageId = serde_json::from_str(&serialized).unwrap();
        assert_eq!(original, deserialized);
    }
}
