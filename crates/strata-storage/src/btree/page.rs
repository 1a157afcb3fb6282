//! B+Tree page implementations (leaf and internal nodes).
//!
//! Component files are written once, so pages are built by appending
//! entries in key order (`*_in_slice` builders over a confiscated frame) and
//! read through borrowed views taken under a page read latch.

use super::constants::{NO_PAGE, SLOT_SIZE};
use super::types::{InternalPageHeader, LeafPageHeader};
use std::cmp::Ordering;
use strata_common::page::{PageHeader, PageId, PageType, PAGE_SIZE};
use strata_common::{MultiComparator, Result, StrataError, Tuple};

const SLOT_ARRAY_START: usize = PageHeader::SIZE + LeafPageHeader::SIZE;

#[inline]
fn slot(data: &[u8], index: usize) -> (usize, usize) {
    let at = SLOT_ARRAY_START + index * SLOT_SIZE;
    let offset = u16::from_le_bytes([data[at], data[at + 1]]) as usize;
    let len = u16::from_le_bytes([data[at + 2], data[at + 3]]) as usize;
    (offset, len)
}

/// Reserves `len` bytes at the back of the data region and a slot for them.
///
/// Returns the entry offset, or None if the page cannot hold it.
fn push_slot(data: &mut [u8], num_slots: u16, data_end: u16, len: usize) -> Option<usize> {
    let slot_array_end = SLOT_ARRAY_START + (num_slots as usize + 1) * SLOT_SIZE;
    let data_end = data_end as usize;
    if data_end < slot_array_end + len {
        return None;
    }
    let offset = data_end - len;
    let at = SLOT_ARRAY_START + num_slots as usize * SLOT_SIZE;
    data[at..at + 2].copy_from_slice(&(offset as u16).to_le_bytes());
    data[at + 2..at + 4].copy_from_slice(&(len as u16).to_le_bytes());
    Some(offset)
}

fn check_type(page_id: PageId, data: &[u8], expected: PageType) -> Result<()> {
    match PageHeader::from_bytes(data) {
        Some(header) if header.page_type == expected => Ok(()),
        Some(header) => Err(StrataError::PageCorrupted {
            page_id,
            reason: format!("expected {:?} page, found {:?}", expected, header.page_type),
        }),
        None => Err(StrataError::PageCorrupted {
            page_id,
            reason: "unknown page type".to_string(),
        }),
    }
}

/// Read view over a B+ tree leaf page.
///
/// Entries are serialized tuples in key order.
pub struct BTreeLeafPage<'a> {
    page_id: PageId,
    data: &'a [u8],
    header: LeafPageHeader,
}

impl<'a> BTreeLeafPage<'a> {
    /// Initializes an empty leaf in `data`.
    pub fn init_in_slice(data: &mut [u8], page_id: PageId) {
        data[..PAGE_SIZE].fill(0);
        let header = PageHeader::new(page_id, PageType::BTreeLeaf);
        data[..PageHeader::SIZE].copy_from_slice(&header.to_bytes());
        let offset = LeafPageHeader::OFFSET;
        data[offset..offset + LeafPageHeader::SIZE]
            .copy_from_slice(&LeafPageHeader::new().to_bytes());
    }

    /// Appends a serialized tuple after every existing entry.
    ///
    /// Returns false, leaving the page untouched, if it does not fit.
    pub fn append_in_slice(data: &mut [u8], entry: &[u8]) -> bool {
        let offset = LeafPageHeader::OFFSET;
        let mut header = LeafPageHeader::from_bytes(&data[offset..offset + LeafPageHeader::SIZE]);
        let Some(at) = push_slot(data, header.num_slots, header.data_end, entry.len()) else {
            return false;
        };
        data[at..at + entry.len()].copy_from_slice(entry);

        header.num_slots += 1;
        header.data_end = at as u16;
        data[offset..offset + LeafPageHeader::SIZE].copy_from_slice(&header.to_bytes());

        if let Some(mut page_header) = PageHeader::from_bytes(data) {
            page_header.entry_count = header.num_slots;
            page_header.free_space_offset =
                (SLOT_ARRAY_START + header.num_slots as usize * SLOT_SIZE) as u16;
            data[..PageHeader::SIZE].copy_from_slice(&page_header.to_bytes());
        }
        true
    }

    /// Sets the next-leaf link.
    pub fn set_next_leaf_in_slice(data: &mut [u8], next: Option<u32>) {
        let offset = LeafPageHeader::OFFSET;
        let mut header = LeafPageHeader::from_bytes(&data[offset..offset + LeafPageHeader::SIZE]);
        header.next_leaf = next.unwrap_or(NO_PAGE);
        data[offset..offset + LeafPageHeader::SIZE].copy_from_slice(&header.to_bytes());
    }

    /// Number of entries in an initialized leaf.
    pub fn num_entries_in_slice(data: &[u8]) -> usize {
        let offset = LeafPageHeader::OFFSET;
        u16::from_le_bytes([data[offset], data[offset + 1]]) as usize
    }

    /// Wraps a leaf page read from disk.
    pub fn new(page_id: PageId, data: &'a [u8]) -> Result<Self> {
        check_type(page_id, data, PageType::BTreeLeaf)?;
        let offset = LeafPageHeader::OFFSET;
        let header = LeafPageHeader::from_bytes(&data[offset..offset + LeafPageHeader::SIZE]);
        if SLOT_ARRAY_START + header.num_slots as usize * SLOT_SIZE > header.data_end as usize {
            return Err(StrataError::PageCorrupted {
                page_id,
                reason: format!("{} slots overlap entry data", header.num_slots),
            });
        }
        Ok(Self {
            page_id,
            data,
            header,
        })
    }

    /// Number of entries.
    pub fn num_entries(&self) -> usize {
        self.header.num_slots as usize
    }

    /// Next leaf in key order.
    pub fn next_leaf(&self) -> Option<u32> {
        self.header.next()
    }

    /// Bytes left between the slot array and the entry data.
    pub fn free_space(&self) -> usize {
        let slot_array_end = SLOT_ARRAY_START + self.num_entries() * SLOT_SIZE;
        (self.header.data_end as usize).saturating_sub(slot_array_end)
    }

    fn entry(&self, index: usize) -> Result<&'a [u8]> {
        let (offset, len) = slot(self.data, index);
        if offset < self.header.data_end as usize || offset + len > PAGE_SIZE {
            return Err(StrataError::PageCorrupted {
                page_id: self.page_id,
                reason: format!("slot {} points outside the data region", index),
            });
        }
        Ok(&self.data[offset..offset + len])
    }

    /// Decodes the tuple at `index`.
    pub fn tuple(&self, index: usize) -> Result<Tuple> {
        Tuple::from_bytes(self.entry(index)?)
    }

    /// Decodes every tuple from `start` to the end of the page.
    pub fn tuples_from(&self, start: usize) -> Result<Vec<Tuple>> {
        (start..self.num_entries()).map(|i| self.tuple(i)).collect()
    }

    /// Index of the first entry not less than `key`. Equals `num_entries()`
    /// when every entry sorts below it.
    pub fn lower_bound(&self, key: &Tuple, cmp: &MultiComparator) -> Result<usize> {
        let mut low = 0usize;
        let mut high = self.num_entries();
        while low < high {
            let mid = low + (high - low) / 2;
            match cmp.try_compare(&self.tuple(mid)?, key)? {
                Ordering::Less => low = mid + 1,
                _ => high = mid,
            }
        }
        Ok(low)
    }
}

/// Read view over a B+ tree internal page.
pub struct BTreeInternalPage<'a> {
    page_id: PageId,
    data: &'a [u8],
    header: InternalPageHeader,
}

impl<'a> BTreeInternalPage<'a> {
    /// Initializes an internal page whose keys all sit above `leftmost_child`.
    pub fn init_in_slice(data: &mut [u8], page_id: PageId, level: u16, leftmost_child: u32) {
        data[..PAGE_SIZE].fill(0);
        let header = PageHeader::new(page_id, PageType::BTreeInternal);
        data[..PageHeader::SIZE].copy_from_slice(&header.to_bytes());
        let offset = InternalPageHeader::OFFSET;
        data[offset..offset + InternalPageHeader::SIZE]
            .copy_from_slice(&InternalPageHeader::new(level, leftmost_child).to_bytes());
    }

    /// Appends a child keyed by its first key (`separator`, serialized).
    ///
    /// Returns false, leaving the page untouched, if it does not fit.
    pub fn append_in_slice(data: &mut [u8], child: u32, separator: &[u8]) -> bool {
        let offset = InternalPageHeader::OFFSET;
        let mut header =
            InternalPageHeader::from_bytes(&data[offset..offset + InternalPageHeader::SIZE]);
        let len = 4 + separator.len();
        let Some(at) = push_slot(data, header.num_keys, header.data_end, len) else {
            return false;
        };
        data[at..at + 4].copy_from_slice(&child.to_le_bytes());
        data[at + 4..at + len].copy_from_slice(separator);

        header.num_keys += 1;
        header.data_end = at as u16;
        data[offset..offset + InternalPageHeader::SIZE].copy_from_slice(&header.to_bytes());
        true
    }

    /// Wraps an internal page read from disk.
    pub fn new(page_id: PageId, data: &'a [u8]) -> Result<Self> {
        check_type(page_id, data, PageType::BTreeInternal)?;
        let offset = InternalPageHeader::OFFSET;
        let header =
            InternalPageHeader::from_bytes(&data[offset..offset + InternalPageHeader::SIZE]);
        if SLOT_ARRAY_START + header.num_keys as usize * SLOT_SIZE > header.data_end as usize {
            return Err(StrataError::PageCorrupted {
                page_id,
                reason: format!("{} slots overlap entry data", header.num_keys),
            });
        }
        Ok(Self {
            page_id,
            data,
            header,
        })
    }

    /// Number of separator keys. The page has one more child than keys.
    pub fn num_keys(&self) -> usize {
        self.header.num_keys as usize
    }

    /// Level above the leaves (1 = children are leaves).
    pub fn level(&self) -> u16 {
        self.header.level
    }

    fn entry(&self, index: usize) -> Result<(u32, Tuple)> {
        let (offset, len) = slot(self.data, index);
        if len < 4 || offset < self.header.data_end as usize || offset + len > PAGE_SIZE {
            return Err(StrataError::PageCorrupted {
                page_id: self.page_id,
                reason: format!("slot {} points outside the data region", index),
            });
        }
        let bytes = &self.data[offset..offset + len];
        let child = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        Ok((child, Tuple::from_bytes(&bytes[4..])?))
    }

    /// Child at `index`, 0 being the leftmost child.
    pub fn child(&self, index: usize) -> Result<u32> {
        if index == 0 {
            Ok(self.header.leftmost_child)
        } else {
            Ok(self.entry(index - 1)?.0)
        }
    }

    /// Separator key `index` (the first key of child `index + 1`).
    pub fn separator(&self, index: usize) -> Result<Tuple> {
        Ok(self.entry(index)?.1)
    }

    /// Child to descend into when looking for the first entry not less than `key`.
    ///
    /// Picks the child whose key range holds `key`. A separator is the first
    /// key of its right child, so a full key equal to a separator descends
    /// right. A prefix key that equals several separators lands on the
    /// leftmost candidate and callers follow next-leaf links from there.
    pub fn find_child(&self, key: &Tuple, cmp: &MultiComparator) -> Result<u32> {
        let full_key = key.arity() >= cmp.key_field_count();
        let mut low = 0usize;
        let mut high = self.num_keys();
        while low < high {
            let mid = low + (high - low) / 2;
            match cmp.try_compare(&self.separator(mid)?, key)? {
                Ordering::Less => low = mid + 1,
                Ordering::Equal if full_key => low = mid + 1,
                _ => high = mid,
            }
        }
        self.child(low)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf_with(page_id: PageId, values: &[i64]) -> Vec<u8> {
        let mut page = vec![0u8; PAGE_SIZE];
        BTreeLeafPage::init_in_slice(&mut page, page_id);
        for v in values {
            assert!(BTreeLeafPage::append_in_slice(
                &mut page,
                &Tuple::from_ints(&[*v, v * 10]).to_bytes()
            ));
        }
        page
    }

    #[test]
    fn test_leaf_append_and_read() {
        let page_id = PageId::new(1, 1);
        let page = leaf_with(page_id, &[1, 5, 9]);

        let leaf = BTreeLeafPage::new(page_id, &page).unwrap();
        assert_eq!(leaf.num_entries(), 3);
        assert_eq!(leaf.next_leaf(), None);
        assert_eq!(leaf.tuple(1).unwrap(), Tuple::from_ints(&[5, 50]));
        assert_eq!(
            leaf.tuples_from(1).unwrap(),
            vec![Tuple::from_ints(&[5, 50]), Tuple::from_ints(&[9, 90])]
        );
        assert_eq!(BTreeLeafPage::num_entries_in_slice(&page), 3);
    }

    #[test]
    fn test_leaf_lower_bound() {
        let page_id = PageId::new(1, 1);
        let page = leaf_with(page_id, &[1, 5, 9]);
        let leaf = BTreeLeafPage::new(page_id, &page).unwrap();
        let cmp = MultiComparator::int64(1);

        assert_eq!(leaf.lower_bound(&Tuple::from_ints(&[0]), &cmp).unwrap(), 0);
        assert_eq!(leaf.lower_bound(&Tuple::from_ints(&[5]), &cmp).unwrap(), 1);
        assert_eq!(leaf.lower_bound(&Tuple::from_ints(&[6]), &cmp).unwrap(), 2);
        assert_eq!(leaf.lower_bound(&Tuple::from_ints(&[10]), &cmp).unwrap(), 3);
    }

    #[test]
    fn test_leaf_fills_up() {
        let page_id = PageId::new(1, 1);
        let mut page = vec![0u8; PAGE_SIZE];
        BTreeLeafPage::init_in_slice(&mut page, page_id);

        let mut count = 0i64;
        while BTreeLeafPage::append_in_slice(&mut page, &Tuple::from_ints(&[count]).to_bytes()) {
            count += 1;
        }
        // 11-byte entries plus 4-byte slots
        assert_eq!(count as usize, (PAGE_SIZE - SLOT_ARRAY_START) / 15);

        let leaf = BTreeLeafPage::new(page_id, &page).unwrap();
        assert_eq!(leaf.num_entries(), count as usize);
        assert!(leaf.free_space() < 15);
        assert_eq!(leaf.tuple(count as usize - 1).unwrap(), Tuple::from_ints(&[count - 1]));
    }

    #[test]
    fn test_leaf_next_link() {
        let page_id = PageId::new(1, 1);
        let mut page = leaf_with(page_id, &[1]);
        BTreeLeafPage::set_next_leaf_in_slice(&mut page, Some(2));
        assert_eq!(BTreeLeafPage::new(page_id, &page).unwrap().next_leaf(), Some(2));
        BTreeLeafPage::set_next_leaf_in_slice(&mut page, None);
        assert_eq!(BTreeLeafPage::new(page_id, &page).unwrap().next_leaf(), None);
    }

    #[test]
    fn test_wrong_page_type() {
        let page_id = PageId::new(1, 1);
        let page = leaf_with(page_id, &[1]);
        assert!(matches!(
            BTreeInternalPage::new(page_id, &page),
            Err(StrataError::PageCorrupted { .. })
        ));
    }

    #[test]
    fn test_internal_find_child() {
        let page_id = PageId::new(1, 10);
        let mut page = vec![0u8; PAGE_SIZE];
        BTreeInternalPage::init_in_slice(&mut page, page_id, 1, 1);
        // children 2 and 3 start at keys 100 and 200
        assert!(BTreeInternalPage::append_in_slice(
            &mut page,
            2,
            &Tuple::from_ints(&[100]).to_bytes()
        ));
        assert!(BTreeInternalPage::append_in_slice(
            &mut page,
            3,
            &Tuple::from_ints(&[200]).to_bytes()
        ));

        let node = BTreeInternalPage::new(page_id, &page).unwrap();
        let cmp = MultiComparator::int64(1);
        assert_eq!(node.num_keys(), 2);
        assert_eq!(node.level(), 1);
        assert_eq!(node.child(0).unwrap(), 1);
        assert_eq!(node.separator(1).unwrap(), Tuple::from_ints(&[200]));

        let find = |k: i64| node.find_child(&Tuple::from_ints(&[k]), &cmp).unwrap();
        assert_eq!(find(-5), 1);
        assert_eq!(find(99), 1);
        // A full key equal to a separator descends into the child it starts
        assert_eq!(find(100), 2);
        assert_eq!(find(101), 2);
        assert_eq!(find(199), 2);
        assert_eq!(find(200), 3);
        assert_eq!(find(500), 3);
    }

    #[test]
    fn test_internal_find_child_prefix_key_goes_leftmost() {
        let page_id = PageId::new(1, 11);
        let mut page = vec![0u8; PAGE_SIZE];
        BTreeInternalPage::init_in_slice(&mut page, page_id, 1, 1);
        // children 2 and 3 start at (5, 10) and (5, 20)
        assert!(BTreeInternalPage::append_in_slice(
            &mut page,
            2,
            &Tuple::from_ints(&[5, 10]).to_bytes()
        ));
        assert!(BTreeInternalPage::append_in_slice(
            &mut page,
            3,
            &Tuple::from_ints(&[5, 20]).to_bytes()
        ));

        let node = BTreeInternalPage::new(page_id, &page).unwrap();
        let cmp = MultiComparator::int64(2);
        assert_eq!(node.find_child(&Tuple::from_ints(&[5]), &cmp).unwrap(), 1);
        assert_eq!(node.find_child(&Tuple::from_ints(&[5, 20]), &cmp).unwrap(), 3);
        assert_eq!(node.find_child(&Tuple::from_ints(&[5, 15]), &cmp).unwrap(), 2);
    }
}
