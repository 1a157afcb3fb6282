//! Bottom-up bulk loader for immutable component files.

use super::constants::{MAX_TUPLE_SIZE, META_PAGE_NUM};
use super::page::{BTreeInternalPage, BTreeLeafPage};
use super::types::{seal_page, BTreeMeta};
use crate::bloom::BloomFilter;
use crate::freelist::LongArrayList;
use std::cmp::Ordering;
use std::sync::Arc;
use strata_buffer::{BufferCache, ConfiscatedPage};
use strata_common::page::PageId;
use strata_common::{MultiComparator, Result, StrataError, Tuple};
use tracing::debug;

/// Writes a sorted tuple stream into a new component file.
///
/// Leaves are filled left to right in confiscated frames and written as
/// soon as they are full; internal levels are built from the leaf page list
/// once the input ends, then the bloom filter pages, then page 0. Nothing is
/// readable until [`BulkLoader::finish`] has written the metadata page and
/// synced the file.
pub struct BulkLoader {
    cache: Arc<BufferCache>,
    file_id: u32,
    comparator: MultiComparator,
    bloom: Option<BloomFilter>,
    leaf: Option<(ConfiscatedPage, u32)>,
    next_page: u32,
    leaves: LongArrayList,
    leaf_first_keys: Vec<Tuple>,
    last: Option<Tuple>,
    tuple_count: u64,
    scratch: Vec<u8>,
}

impl BulkLoader {
    /// Starts loading `file_id`. Keys of every added tuple go into `bloom`
    /// when one is given.
    pub fn new(
        cache: Arc<BufferCache>,
        file_id: u32,
        comparator: MultiComparator,
        bloom: Option<BloomFilter>,
    ) -> Self {
        Self {
            cache,
            file_id,
            comparator,
            bloom,
            leaf: None,
            next_page: META_PAGE_NUM + 1,
            leaves: LongArrayList::default(),
            leaf_first_keys: Vec::new(),
            last: None,
            tuple_count: 0,
            scratch: Vec::with_capacity(256),
        }
    }

    /// Number of tuples added so far.
    pub fn tuple_count(&self) -> u64 {
        self.tuple_count
    }

    fn allocate_page(&mut self) -> u32 {
        let page_num = self.next_page;
        self.next_page += 1;
        page_num
    }

    fn write_page(&self, mut page: ConfiscatedPage, page_num: u32) -> Result<()> {
        seal_page(&mut page.data_mut()[..]);
        self.cache
            .write_confiscated(page, PageId::new(self.file_id, page_num))
    }

    /// Adds the next tuple. Keys must be strictly increasing.
    pub fn add(&mut self, tuple: &Tuple) -> Result<()> {
        self.comparator.check(tuple)?;
        if let Some(last) = &self.last {
            if self.comparator.try_compare(last, tuple)? != Ordering::Less {
                return Err(StrataError::OutOfOrder(format!(
                    "{} does not sort after {}",
                    tuple, last
                )));
            }
        }

        self.scratch.clear();
        tuple.encode_into(&mut self.scratch);
        if self.scratch.len() > MAX_TUPLE_SIZE {
            return Err(StrataError::KeyTooLarge {
                size: self.scratch.len(),
                max: MAX_TUPLE_SIZE,
            });
        }

        let appended = match self.leaf.as_mut() {
            Some((page, _)) => BTreeLeafPage::append_in_slice(&mut page.data_mut()[..], &self.scratch),
            None => false,
        };
        if !appended {
            self.start_leaf()?;
            let fits = match self.leaf.as_mut() {
                Some((page, _)) => {
                    BTreeLeafPage::append_in_slice(&mut page.data_mut()[..], &self.scratch)
                }
                None => false,
            };
            if !fits {
                return Err(StrataError::Internal(format!(
                    "{}-byte tuple does not fit an empty leaf",
                    self.scratch.len()
                )));
            }
            self.leaf_first_keys
                .push(tuple.key(self.comparator.key_field_count()));
        }

        if let Some(bloom) = self.bloom.as_mut() {
            bloom.insert(&tuple.key(self.comparator.key_field_count()).to_bytes());
        }
        self.last = Some(tuple.clone());
        self.tuple_count += 1;
        Ok(())
    }

    /// Links the current leaf to a fresh one, writes it and opens the fresh one.
    fn start_leaf(&mut self) -> Result<()> {
        let page_num = self.allocate_page();
        if let Some((mut full, full_num)) = self.leaf.take() {
            BTreeLeafPage::set_next_leaf_in_slice(&mut full.data_mut()[..], Some(page_num));
            self.write_page(full, full_num)?;
        }

        let mut page = self.cache.confiscate()?;
        BTreeLeafPage::init_in_slice(
            &mut page.data_mut()[..],
            PageId::new(self.file_id, page_num),
        );
        self.leaves.add(page_num as i64);
        self.leaf = Some((page, page_num));
        Ok(())
    }

    /// Builds one internal level over `children`, consuming the list.
    fn build_parent_level(
        &mut self,
        children: &mut LongArrayList,
        child_keys: &[Tuple],
        level: u16,
    ) -> Result<(LongArrayList, Vec<Tuple>)> {
        let mut parents = LongArrayList::default();
        let mut parent_keys = Vec::new();
        let mut current: Option<(ConfiscatedPage, u32)> = None;

        while !children.is_last() {
            let key = &child_keys[children.first()];
            let child = children.get_first() as u32;
            children.move_first();

            self.scratch.clear();
            key.encode_into(&mut self.scratch);
            let appended = match current.as_mut() {
                Some((page, _)) => BTreeInternalPage::append_in_slice(
                    &mut page.data_mut()[..],
                    child,
                    &self.scratch,
                ),
                None => false,
            };
            if appended {
                continue;
            }

            if let Some((page, page_num)) = current.take() {
                self.write_page(page, page_num)?;
            }
            let page_num = self.allocate_page();
            let mut page = self.cache.confiscate()?;
            BTreeInternalPage::init_in_slice(
                &mut page.data_mut()[..],
                PageId::new(self.file_id, page_num),
                level,
                child,
            );
            parents.add(page_num as i64);
            parent_keys.push(key.clone());
            current = Some((page, page_num));
        }

        if let Some((page, page_num)) = current.take() {
            self.write_page(page, page_num)?;
        }
        Ok((parents, parent_keys))
    }

    /// Builds internal levels until one page remains. Returns (root, height).
    fn build_levels(&mut self) -> Result<(u32, u16)> {
        let mut level_pages = std::mem::take(&mut self.leaves);
        let mut first_keys = std::mem::take(&mut self.leaf_first_keys);
        let mut height = 1u16;

        while level_pages.size() > 1 {
            let (pages, keys) = self.build_parent_level(&mut level_pages, &first_keys, height)?;
            level_pages = pages;
            first_keys = keys;
            height += 1;
        }
        Ok((level_pages.get(0) as u32, height))
    }

    /// Writes the remaining pages and the metadata page, then syncs the file.
    pub fn finish(mut self) -> Result<BTreeMeta> {
        let mut meta = BTreeMeta::empty(self.comparator.key_field_count() as u16);

        if let Some((last_leaf, page_num)) = self.leaf.take() {
            self.write_page(last_leaf, page_num)?;
            meta.leaf_count = self.leaves.size() as u32;
            meta.first_leaf = self.leaves.get(0) as u32;
            let (root, height) = self.build_levels()?;
            meta.root_page = root;
            meta.height = height;
            meta.tuple_count = self.tuple_count;
        }

        if let Some(bloom) = self.bloom.take() {
            meta.bloom_first_page = self.next_page;
            meta.bloom_page_count = bloom.page_count();
            meta.bloom_bit_count = bloom.num_bits();
            meta.bloom_hash_count = bloom.num_hashes();
            for index in 0..bloom.page_count() {
                let page_num = self.allocate_page();
                let mut page = self.cache.confiscate()?;
                bloom.write_page(
                    index,
                    PageId::new(self.file_id, page_num),
                    &mut page.data_mut()[..],
                );
                self.write_page(page, page_num)?;
            }
        }
        meta.page_count = self.next_page;

        let mut page = self.cache.confiscate()?;
        meta.write_page(
            PageId::new(self.file_id, META_PAGE_NUM),
            &mut page.data_mut()[..],
        );
        self.write_page(page, META_PAGE_NUM)?;
        self.cache.store().sync_file(self.file_id)?;

        debug!(
            file_id = self.file_id,
            tuples = meta.tuple_count,
            leaves = meta.leaf_count,
            height = meta.height,
            pages = meta.page_count,
            "bulk load finished"
        );
        Ok(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::constants::NO_PAGE;
    use strata_buffer::MemoryPageStore;
    use strata_common::BufferCacheConfig;

    fn cache(store: Arc<MemoryPageStore>) -> Arc<BufferCache> {
        let config = BufferCacheConfig {
            num_frames: 16,
            pin_timeout_ms: 50,
            ..Default::default()
        };
        BufferCache::new(config, store).unwrap()
    }

    #[test]
    fn test_empty_load() {
        let store = Arc::new(MemoryPageStore::new());
        let loader = BulkLoader::new(cache(store.clone()), 1, MultiComparator::int64(1), None);
        let meta = loader.finish().unwrap();

        assert_eq!(meta.tuple_count, 0);
        assert_eq!(meta.root_page, NO_PAGE);
        assert_eq!(meta.page_count, 1);
        assert!(store.page(PageId::new(1, 0)).is_some());
    }

    #[test]
    fn test_single_leaf_load() {
        let store = Arc::new(MemoryPageStore::new());
        let mut loader = BulkLoader::new(cache(store), 1, MultiComparator::int64(1), None);
        for k in [1, 5, 9] {
            loader.add(&Tuple::from_ints(&[k, k])).unwrap();
        }
        let meta = loader.finish().unwrap();

        assert_eq!(meta.tuple_count, 3);
        assert_eq!(meta.height, 1);
        assert_eq!(meta.leaf_count, 1);
        assert_eq!(meta.root_page, meta.first_leaf);
        assert_eq!(meta.page_count, 2);
    }

    #[test]
    fn test_multi_level_load_frees_frames() {
        let store = Arc::new(MemoryPageStore::new());
        let cache = cache(store);
        let mut loader = BulkLoader::new(Arc::clone(&cache), 1, MultiComparator::int64(1), None);
        for k in 0..200_000 {
            loader.add(&Tuple::from_ints(&[k])).unwrap();
        }
        let meta = loader.finish().unwrap();

        assert_eq!(meta.tuple_count, 200_000);
        assert!(meta.leaf_count > 100);
        assert_eq!(meta.height, 2);
        assert_eq!(meta.first_leaf, 1);
        // Every confiscated frame went back to the pool
        assert_eq!(cache.free_count(), cache.num_frames());
    }

    #[test]
    fn test_out_of_order_rejected() {
        let store = Arc::new(MemoryPageStore::new());
        let mut loader = BulkLoader::new(cache(store), 1, MultiComparator::int64(1), None);
        loader.add(&Tuple::from_ints(&[5])).unwrap();
        assert!(matches!(
            loader.add(&Tuple::from_ints(&[5])),
            Err(StrataError::OutOfOrder(_))
        ));
        assert!(matches!(
            loader.add(&Tuple::from_ints(&[4])),
            Err(StrataError::OutOfOrder(_))
        ));
        assert_eq!(loader.tuple_count(), 1);
    }

    #[test]
    fn test_oversized_tuple_rejected() {
        let store = Arc::new(MemoryPageStore::new());
        let mut loader = BulkLoader::new(cache(store), 1, MultiComparator::int64(1), None);
        let big = Tuple::new(vec![
            strata_common::Field::Int64(1),
            strata_common::Field::Bytes(vec![7u8; MAX_TUPLE_SIZE].into()),
        ]);
        assert!(matches!(
            loader.add(&big),
            Err(StrataError::KeyTooLarge { .. })
        ));
    }

    #[test]
    fn test_bloom_pages_follow_tree() {
        let store = Arc::new(MemoryPageStore::new());
        let bloom = BloomFilter::with_rate(100, 0.01);
        let mut loader =
            BulkLoader::new(cache(store.clone()), 2, MultiComparator::int64(1), Some(bloom));
        for k in 0..100 {
            loader.add(&Tuple::from_ints(&[k])).unwrap();
        }
        let meta = loader.finish().unwrap();

        assert!(meta.has_bloom());
        assert_eq!(meta.bloom_first_page, 2);
        assert_eq!(meta.page_count, meta.bloom_first_page + meta.bloom_page_count);
        assert!(store.page(PageId::new(2, meta.bloom_first_page)).is_some());
    }
}
