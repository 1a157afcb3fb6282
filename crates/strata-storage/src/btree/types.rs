//! Page headers, the metadata page and page checksums for component files.

use super::constants::{COMPONENT_MAGIC, FORMAT_VERSION, NO_PAGE};
use strata_common::page::{PageHeader, PageId, PageType, PAGE_SIZE};
use strata_common::{Result, StrataError};

#[inline]
fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

#[inline]
fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

#[inline]
fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}

fn optional_page(page_num: u32) -> Option<u32> {
    (page_num != NO_PAGE).then_some(page_num)
}

/// Header for B+ tree leaf pages (slotted page format).
///
/// Layout (16 bytes):
/// - num_slots: 2 bytes (number of entries)
/// - data_end: 2 bytes (offset where entry data begins, grows backward from PAGE_SIZE)
/// - next_leaf: 4 bytes (page number in the same file, NO_PAGE for the last leaf)
/// - reserved: 8 bytes
///
/// Page layout:
/// ```text
/// +------------------------+ 0
/// | Page Header (32 bytes) |
/// +------------------------+ 32
/// | Leaf Header (16 bytes) |
/// +------------------------+ 48 (SLOT_ARRAY_START)
/// | Slot Array             |
/// | [offset:2, len:2] * n  |  <- grows forward
/// +------------------------+ 48 + 4*n
/// |      Free Space        |
/// +------------------------+ data_end
/// | Serialized tuples      |  <- grows backward from PAGE_SIZE
/// +------------------------+ PAGE_SIZE
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeafPageHeader {
    /// Number of entries (slots) in this leaf.
    pub num_slots: u16,
    /// Offset where entry data begins.
    pub data_end: u16,
    /// Page number of the next leaf.
    pub next_leaf: u32,
}

impl LeafPageHeader {
    /// Size of the leaf header in bytes.
    pub const SIZE: usize = 16;

    /// Offset of leaf header in page (after PageHeader).
    pub const OFFSET: usize = PageHeader::SIZE;

    /// Creates an empty leaf header.
    pub fn new() -> Self {
        Self {
            num_slots: 0,
            data_end: PAGE_SIZE as u16,
            next_leaf: NO_PAGE,
        }
    }

    /// Returns the next leaf, if any.
    pub fn next(&self) -> Option<u32> {
        optional_page(self.next_leaf)
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..2].copy_from_slice(&self.num_slots.to_le_bytes());
        buf[2..4].copy_from_slice(&self.data_end.to_le_bytes());
        buf[4..8].copy_from_slice(&self.next_leaf.to_le_bytes());
        buf
    }

    /// Deserializes from bytes.
    pub fn from_bytes(buf: &[u8]) -> Self {
        Self {
            num_slots: read_u16(buf, 0),
            data_end: read_u16(buf, 2),
            next_leaf: read_u32(buf, 4),
        }
    }
}

impl Default for LeafPageHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// Header for B+ tree internal pages.
///
/// Layout (16 bytes):
/// - num_keys: 2 bytes
/// - data_end: 2 bytes
/// - level: 2 bytes (1 = just above leaves)
/// - reserved: 2 bytes
/// - leftmost_child: 4 bytes
/// - reserved: 4 bytes
///
/// Each slot points at `child:u32` followed by a serialized separator key.
/// The separator is the first key stored under that child; keys below the
/// first separator live under `leftmost_child`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InternalPageHeader {
    /// Number of separator keys.
    pub num_keys: u16,
    /// Offset where entry data begins.
    pub data_end: u16,
    /// Level in the tree.
    pub level: u16,
    /// Child holding keys below the first separator.
    pub leftmost_child: u32,
}

impl InternalPageHeader {
    /// Size of the internal header in bytes.
    pub const SIZE: usize = 16;

    /// Offset of internal header in page (after PageHeader).
    pub const OFFSET: usize = PageHeader::SIZE;

    /// Creates an empty internal header.
    pub fn new(level: u16, leftmost_child: u32) -> Self {
        Self {
            num_keys: 0,
            data_end: PAGE_SIZE as u16,
            level,
            leftmost_child,
        }
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..2].copy_from_slice(&self.num_keys.to_le_bytes());
        buf[2..4].copy_from_slice(&self.data_end.to_le_bytes());
        buf[4..6].copy_from_slice(&self.level.to_le_bytes());
        buf[8..12].copy_from_slice(&self.leftmost_child.to_le_bytes());
        buf
    }

    /// Deserializes from bytes.
    pub fn from_bytes(buf: &[u8]) -> Self {
        Self {
            num_keys: read_u16(buf, 0),
            data_end: read_u16(buf, 2),
            level: read_u16(buf, 4),
            leftmost_child: read_u32(buf, 8),
        }
    }
}

/// Contents of the metadata page (page 0) of a component file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BTreeMeta {
    /// Number of key fields the tree was ordered by.
    pub key_field_count: u16,
    /// Root page, NO_PAGE for an empty tree.
    pub root_page: u32,
    /// Number of levels, leaves included. 0 for an empty tree.
    pub height: u16,
    /// Number of tuples stored.
    pub tuple_count: u64,
    /// Number of leaf pages.
    pub leaf_count: u32,
    /// Leftmost leaf, NO_PAGE for an empty tree.
    pub first_leaf: u32,
    /// Total pages in the file, metadata and bloom pages included.
    pub page_count: u32,
    /// First bloom filter page.
    pub bloom_first_page: u32,
    /// Number of bloom filter pages. 0 when the tree has no filter.
    pub bloom_page_count: u32,
    /// Bloom filter bit count.
    pub bloom_bit_count: u64,
    /// Bloom filter probes per key.
    pub bloom_hash_count: u32,
}

impl BTreeMeta {
    const MAGIC_AT: usize = PageHeader::SIZE;
    const VERSION_AT: usize = PageHeader::SIZE + 4;
    const BODY_AT: usize = PageHeader::SIZE + 6;

    /// Metadata of a tree with no tuples and no filter.
    pub fn empty(key_field_count: u16) -> Self {
        Self {
            key_field_count,
            root_page: NO_PAGE,
            height: 0,
            tuple_count: 0,
            leaf_count: 0,
            first_leaf: NO_PAGE,
            page_count: 1,
            bloom_first_page: NO_PAGE,
            bloom_page_count: 0,
            bloom_bit_count: 0,
            bloom_hash_count: 0,
        }
    }

    /// Returns the root page, if the tree has any tuples.
    pub fn root(&self) -> Option<u32> {
        optional_page(self.root_page)
    }

    /// Returns true if a bloom filter follows the tree.
    pub fn has_bloom(&self) -> bool {
        self.bloom_page_count > 0
    }

    /// Writes the metadata page into `data`.
    pub fn write_page(&self, page_id: PageId, data: &mut [u8]) {
        data[..PAGE_SIZE].fill(0);
        let header = PageHeader::new(page_id, PageType::ComponentMeta);
        data[..PageHeader::SIZE].copy_from_slice(&header.to_bytes());

        data[Self::MAGIC_AT..Self::MAGIC_AT + 4].copy_from_slice(&COMPONENT_MAGIC.to_le_bytes());
        data[Self::VERSION_AT..Self::VERSION_AT + 2]
            .copy_from_slice(&FORMAT_VERSION.to_le_bytes());

        let b = Self::BODY_AT;
        data[b..b + 2].copy_from_slice(&self.key_field_count.to_le_bytes());
        data[b + 2..b + 6].copy_from_slice(&self.root_page.to_le_bytes());
        data[b + 6..b + 8].copy_from_slice(&self.height.to_le_bytes());
        data[b + 8..b + 16].copy_from_slice(&self.tuple_count.to_le_bytes());
        data[b + 16..b + 20].copy_from_slice(&self.leaf_count.to_le_bytes());
        data[b + 20..b + 24].copy_from_slice(&self.first_leaf.to_le_bytes());
        data[b + 24..b + 28].copy_from_slice(&self.page_count.to_le_bytes());
        data[b + 28..b + 32].copy_from_slice(&self.bloom_first_page.to_le_bytes());
        data[b + 32..b + 36].copy_from_slice(&self.bloom_page_count.to_le_bytes());
        data[b + 36..b + 44].copy_from_slice(&self.bloom_bit_count.to_le_bytes());
        data[b + 44..b + 48].copy_from_slice(&self.bloom_hash_count.to_le_bytes());
    }

    /// Parses and validates the metadata page.
    pub fn read_page(page_id: PageId, data: &[u8]) -> Result<Self> {
        let corrupted = |reason: String| StrataError::PageCorrupted { page_id, reason };

        match PageHeader::from_bytes(data) {
            Some(h) if h.page_type == PageType::ComponentMeta => {}
            Some(h) => {
                return Err(corrupted(format!(
                    "expected metadata page, found {:?}",
                    h.page_type
                )))
            }
            None => return Err(corrupted("unknown page type".to_string())),
        }

        let magic = read_u32(data, Self::MAGIC_AT);
        if magic != COMPONENT_MAGIC {
            return Err(corrupted(format!("bad magic {:#010x}", magic)));
        }
        let version = read_u16(data, Self::VERSION_AT);
        if version != FORMAT_VERSION {
            return Err(corrupted(format!("unsupported format version {}", version)));
        }

        let b = Self::BODY_AT;
        let meta = Self {
            key_field_count: read_u16(data, b),
            root_page: read_u32(data, b + 2),
            height: read_u16(data, b + 6),
            tuple_count: read_u64(data, b + 8),
            leaf_count: read_u32(data, b + 16),
            first_leaf: read_u32(data, b + 20),
            page_count: read_u32(data, b + 24),
            bloom_first_page: read_u32(data, b + 28),
            bloom_page_count: read_u32(data, b + 32),
            bloom_bit_count: read_u64(data, b + 36),
            bloom_hash_count: read_u32(data, b + 44),
        };

        if (meta.root_page == NO_PAGE) != (meta.tuple_count == 0) {
            return Err(corrupted(format!(
                "root {} inconsistent with {} tuples",
                meta.root_page, meta.tuple_count
            )));
        }
        Ok(meta)
    }
}

/// Marks a fully written page sealed and stamps its CRC32 checksum.
///
/// The checksum covers the whole page with the checksum field zeroed.
pub fn seal_page(data: &mut [u8]) {
    data[9] |= strata_common::PageFlags::SEALED | strata_common::PageFlags::CHECKSUMMED;
    let at = PageHeader::CHECKSUM_OFFSET;
    data[at..at + 4].fill(0);
    let checksum = crc32fast::hash(&data[..PAGE_SIZE]);
    data[at..at + 4].copy_from_slice(&checksum.to_le_bytes());
}

/// Verifies the checksum of a sealed page.
pub fn verify_page(page_id: PageId, data: &[u8]) -> Result<()> {
    let header = PageHeader::from_bytes(data).ok_or_else(|| StrataError::PageCorrupted {
        page_id,
        reason: "unknown page type".to_string(),
    })?;
    if !header.flags.is_checksummed() {
        return Err(StrataError::PageCorrupted {
            page_id,
            reason: "page was never sealed".to_string(),
        });
    }

    let at = PageHeader::CHECKSUM_OFFSET;
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&data[..at]);
    hasher.update(&[0u8; 4]);
    hasher.update(&data[at + 4..PAGE_SIZE]);
    let actual = hasher.finalize();

    if actual != header.checksum {
        return Err(StrataError::PageCorrupted {
            page_id,
            reason: format!(
                "checksum mismatch: stored {:#010x}, computed {:#010x}",
                header.checksum, actual
            ),
        });
    }
    if header.page_id != page_id {
        return Err(StrataError::PageCorrupted {
            page_id,
            reason: format!("page claims to be {}", header.page_id),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leaf_header_layout() {
        let mut header = LeafPageHeader::new();
        assert_eq!(header.next(), None);
        header.num_slots = 3;
        header.data_end = 16000;
        header.next_leaf = 7;

        let decoded = LeafPageHeader::from_bytes(&header.to_bytes());
        assert_eq!(decoded, header);
        assert_eq!(decoded.next(), Some(7));
    }

    #[test]
    fn test_internal_header_layout() {
        let mut header = InternalPageHeader::new(2, 11);
        header.num_keys = 40;
        let decoded = InternalPageHeader::from_bytes(&header.to_bytes());
        assert_eq!(decoded, header);
        assert_eq!(decoded.leftmost_child, 11);
    }

    #[test]
    fn test_meta_page() {
        let meta = BTreeMeta {
            key_field_count: 2,
            root_page: 9,
            height: 2,
            tuple_count: 1_000,
            leaf_count: 8,
            first_leaf: 1,
            page_count: 12,
            bloom_first_page: 10,
            bloom_page_count: 2,
            bloom_bit_count: 9_586,
            bloom_hash_count: 7,
        };
        let page_id = PageId::new(3, 0);
        let mut page = vec![0u8; PAGE_SIZE];
        meta.write_page(page_id, &mut page);
        assert_eq!(BTreeMeta::read_page(page_id, &page).unwrap(), meta);
        assert!(meta.has_bloom());
        assert_eq!(meta.root(), Some(9));
    }

    #[test]
    fn test_meta_page_rejects_bad_magic() {
        let page_id = PageId::new(3, 0);
        let mut page = vec![0u8; PAGE_SIZE];
        BTreeMeta::empty(1).write_page(page_id, &mut page);
        page[BTreeMeta::MAGIC_AT] ^= 0xFF;
        assert!(matches!(
            BTreeMeta::read_page(page_id, &page),
            Err(StrataError::PageCorrupted { .. })
        ));
    }

    #[test]
    fn test_meta_page_rejects_unknown_version() {
        let page_id = PageId::new(3, 0);
        let mut page = vec![0u8; PAGE_SIZE];
        BTreeMeta::empty(1).write_page(page_id, &mut page);
        page[BTreeMeta::VERSION_AT] = 99;
        assert!(BTreeMeta::read_page(page_id, &page).is_err());
    }

    #[test]
    fn test_seal_and_verify() {
        let page_id = PageId::new(1, 4);
        let mut page = vec![0u8; PAGE_SIZE];
        page[..PageHeader::SIZE]
            .copy_from_slice(&PageHeader::new(page_id, PageType::BTreeLeaf).to_bytes());
        page[1000] = 0x5A;
        seal_page(&mut page);
        verify_page(page_id, &page).unwrap();

        let header = PageHeader::from_bytes(&page).unwrap();
        assert!(header.flags.is_sealed());

        page[1000] = 0x5B;
        assert!(matches!(
            verify_page(page_id, &page),
            Err(StrataError::PageCorrupted { .. })
        ));
    }

    #[test]
    fn test_verify_rejects_unsealed_and_misplaced_pages() {
        let page_id = PageId::new(1, 4);
        let mut page = vec![0u8; PAGE_SIZE];
        assert!(verify_page(page_id, &page).is_err());

        page[..PageHeader::SIZE]
            .copy_from_slice(&PageHeader::new(page_id, PageType::BTreeLeaf).to_bytes());
        seal_page(&mut page);
        assert!(verify_page(PageId::new(1, 5), &page).is_err());
    }
}
