//! Read side of a bulk-loaded component file.

use super::constants::META_PAGE_NUM;
use super::page::{BTreeInternalPage, BTreeLeafPage};
use super::types::{verify_page, BTreeMeta};
use crate::bloom::BloomFilter;
use std::collections::VecDeque;
use std::sync::Arc;
use strata_buffer::BufferCache;
use strata_common::page::PageId;
use strata_common::{MultiComparator, RangePredicate, Result, StrataError, Tuple};

/// Pins `page_id`, verifies it under a read latch and hands its bytes to `f`.
///
/// Both latch and pin are released before returning.
pub(crate) fn with_page<R>(
    cache: &BufferCache,
    page_id: PageId,
    f: impl FnOnce(&[u8]) -> Result<R>,
) -> Result<R> {
    let handle = cache.pin(page_id)?;
    let latch = handle.read_latch();
    verify_page(page_id, &latch)?;
    f(&latch)
}

/// Immutable B+tree stored in one component file.
pub struct DiskBTree {
    cache: Arc<BufferCache>,
    file_id: u32,
    comparator: MultiComparator,
    meta: BTreeMeta,
    bloom: Option<BloomFilter>,
}

impl DiskBTree {
    /// Opens a component file written by the bulk loader.
    ///
    /// Validates the metadata page and loads the bloom filter, if any.
    pub fn open(cache: Arc<BufferCache>, file_id: u32, comparator: MultiComparator) -> Result<Self> {
        let meta_id = PageId::new(file_id, META_PAGE_NUM);
        let meta = with_page(&cache, meta_id, |data| BTreeMeta::read_page(meta_id, data))?;

        if meta.key_field_count as usize != comparator.key_field_count() {
            return Err(StrataError::ComparatorMismatch(format!(
                "file {} is ordered by {} key fields, comparator has {}",
                file_id,
                meta.key_field_count,
                comparator.key_field_count()
            )));
        }

        let bloom = if meta.has_bloom() {
            let mut pages = Vec::with_capacity(meta.bloom_page_count as usize);
            for i in 0..meta.bloom_page_count {
                let page_id = PageId::new(file_id, meta.bloom_first_page + i);
                pages.push(with_page(&cache, page_id, |data| Ok(data.to_vec()))?);
            }
            Some(BloomFilter::from_pages(
                meta.bloom_bit_count,
                meta.bloom_hash_count,
                pages.iter().map(|p| p.as_slice()),
            )?)
        } else {
            None
        };

        Ok(Self {
            cache,
            file_id,
            comparator,
            meta,
            bloom,
        })
    }

    /// File holding the tree.
    pub fn file_id(&self) -> u32 {
        self.file_id
    }

    /// Metadata page contents.
    pub fn meta(&self) -> &BTreeMeta {
        &self.meta
    }

    /// Comparator the tree is ordered by.
    pub fn comparator(&self) -> &MultiComparator {
        &self.comparator
    }

    /// Number of tuples.
    pub fn tuple_count(&self) -> u64 {
        self.meta.tuple_count
    }

    /// Bytes on disk.
    pub fn size_bytes(&self) -> u64 {
        self.meta.page_count as u64 * strata_common::PAGE_SIZE as u64
    }

    /// The bloom filter over the tree's keys, if one was built.
    pub fn bloom(&self) -> Option<&BloomFilter> {
        self.bloom.as_ref()
    }

    /// False only if the bloom filter proves `key` absent. Trees without a
    /// filter always answer true.
    pub fn may_contain(&self, key: &Tuple) -> bool {
        match &self.bloom {
            Some(bloom) => {
                bloom.may_contain(&key.key(self.comparator.key_field_count()).to_bytes())
            }
            None => true,
        }
    }

    fn find_leaf(&self, root: u32, key: &Tuple) -> Result<u32> {
        let mut page_num = root;
        for _ in 1..self.meta.height {
            let page_id = PageId::new(self.file_id, page_num);
            page_num = with_page(&self.cache, page_id, |data| {
                BTreeInternalPage::new(page_id, data)?.find_child(key, &self.comparator)
            })?;
        }
        Ok(page_num)
    }

    /// Opens a cursor over the tuples matching `predicate`, in key order.
    pub fn range_cursor(&self, predicate: &RangePredicate) -> Result<DiskRangeCursor> {
        let mut cursor = DiskRangeCursor {
            cache: Arc::clone(&self.cache),
            file_id: self.file_id,
            predicate: predicate.clone(),
            buffered: VecDeque::new(),
            next_leaf: None,
            exhausted: true,
        };
        self.reposition(&mut cursor, predicate)?;
        Ok(cursor)
    }

    /// Points an existing cursor at `predicate` on this tree, keeping its
    /// buffer allocation. The cursor may come from any tree of the same cache.
    pub fn reposition(&self, cursor: &mut DiskRangeCursor, predicate: &RangePredicate) -> Result<()> {
        if !predicate.comparator.is_compatible(&self.comparator) {
            return Err(StrataError::ComparatorMismatch(format!(
                "predicate comparator does not match file {}",
                self.file_id
            )));
        }
        predicate.validate()?;

        cursor.close();
        cursor.cache = Arc::clone(&self.cache);
        cursor.file_id = self.file_id;
        cursor.predicate = predicate.clone();
        if let Some(root) = self.meta.root() {
            let leaf = match &predicate.low {
                Some(low) => self.find_leaf(root, low)?,
                None => self.meta.first_leaf,
            };
            cursor.exhausted = false;
            cursor.load_leaf(leaf, predicate.low.as_ref())?;
        }
        Ok(())
    }

    /// Full scan in key order.
    pub fn scan(&self) -> Result<DiskRangeCursor> {
        self.range_cursor(&RangePredicate::full_scan(self.comparator.clone()))
    }

    /// Returns the tuple whose key equals the key prefix of `key`.
    pub fn point_lookup(&self, key: &Tuple) -> Result<Option<Tuple>> {
        let key = key.key(self.comparator.key_field_count());
        let predicate = RangePredicate::point(key, self.comparator.clone());
        self.range_cursor(&predicate)?.next_tuple()
    }
}

impl std::fmt::Debug for DiskBTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskBTree")
            .field("file_id", &self.file_id)
            .field("meta", &self.meta)
            .field("bloom", &self.bloom)
            .finish()
    }
}

/// Forward cursor over a key range of a [`DiskBTree`].
///
/// Each leaf is decoded into an owned buffer while pinned and latched, so
/// the cursor never holds a pin between calls.
pub struct DiskRangeCursor {
    cache: Arc<BufferCache>,
    file_id: u32,
    predicate: RangePredicate,
    buffered: VecDeque<Tuple>,
    next_leaf: Option<u32>,
    exhausted: bool,
}

impl DiskRangeCursor {
    fn load_leaf(&mut self, page_num: u32, low: Option<&Tuple>) -> Result<()> {
        let page_id = PageId::new(self.file_id, page_num);
        let comparator = &self.predicate.comparator;
        let (tuples, next) = with_page(&self.cache, page_id, |data| {
            let leaf = BTreeLeafPage::new(page_id, data)?;
            let start = match low {
                Some(key) => leaf.lower_bound(key, comparator)?,
                None => 0,
            };
            Ok((leaf.tuples_from(start)?, leaf.next_leaf()))
        })?;
        self.buffered.clear();
        self.buffered.extend(tuples);
        self.next_leaf = next;
        Ok(())
    }

    /// Returns the next matching tuple, or None once past the range.
    pub fn next_tuple(&mut self) -> Result<Option<Tuple>> {
        loop {
            if self.exhausted {
                return Ok(None);
            }
            match self.buffered.pop_front() {
                Some(tuple) if self.predicate.is_below_low(&tuple) => continue,
                Some(tuple) if self.predicate.is_above_high(&tuple) => {
                    self.close();
                    return Ok(None);
                }
                Some(tuple) => return Ok(Some(tuple)),
                None => match self.next_leaf {
                    Some(page_num) => {
                        if let Err(e) = self.load_leaf(page_num, None) {
                            self.close();
                            return Err(e);
                        }
                    }
                    None => self.close(),
                },
            }
        }
    }

    /// Drops buffered tuples; every later call returns None.
    pub fn close(&mut self) {
        self.exhausted = true;
        self.buffered.clear();
        self.next_leaf = None;
    }

    /// Returns true once the cursor has run past its range or been closed.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }
}

impl Iterator for DiskRangeCursor {
    type Item = Result<Tuple>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_tuple().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::loader::BulkLoader;
    use strata_buffer::MemoryPageStore;
    use strata_common::BufferCacheConfig;

    fn cache() -> Arc<BufferCache> {
        let config = BufferCacheConfig {
            num_frames: 32,
            pin_timeout_ms: 50,
            ..Default::default()
        };
        BufferCache::new(config, Arc::new(MemoryPageStore::new())).unwrap()
    }

    fn load(cache: &Arc<BufferCache>, file_id: u32, keys: impl IntoIterator<Item = i64>) -> DiskBTree {
        let cmp = MultiComparator::int64(1);
        let mut loader = BulkLoader::new(Arc::clone(cache), file_id, cmp.clone(), None);
        for k in keys {
            loader.add(&Tuple::from_ints(&[k, -k])).unwrap();
        }
        loader.finish().unwrap();
        DiskBTree::open(Arc::clone(cache), file_id, cmp).unwrap()
    }

    fn keys(cursor: DiskRangeCursor) -> Vec<i64> {
        cursor
            .map(|t| t.unwrap().field(0).and_then(|f| f.as_i64()).unwrap())
            .collect()
    }

    fn range(low: i64, high: i64) -> RangePredicate {
        RangePredicate::closed(
            Tuple::from_ints(&[low]),
            Tuple::from_ints(&[high]),
            MultiComparator::int64(1),
        )
        .unwrap()
    }

    #[test]
    fn test_scan_small_tree() {
        let cache = cache();
        let tree = load(&cache, 1, [1, 5, 9]);
        assert_eq!(keys(tree.scan().unwrap()), vec![1, 5, 9]);
        assert_eq!(keys(tree.range_cursor(&range(2, 9)).unwrap()), vec![5, 9]);
        assert_eq!(keys(tree.range_cursor(&range(10, 20)).unwrap()), Vec::<i64>::new());
    }

    #[test]
    fn test_empty_tree() {
        let cache = cache();
        let tree = load(&cache, 1, []);
        assert_eq!(tree.tuple_count(), 0);
        assert!(tree.scan().unwrap().is_exhausted());
        assert_eq!(tree.point_lookup(&Tuple::from_ints(&[1])).unwrap(), None);
    }

    #[test]
    fn test_range_across_leaves() {
        let cache = cache();
        let tree = load(&cache, 1, (0..50_000).map(|k| k * 2));
        assert_eq!(tree.meta().height, 2);

        let found = keys(tree.range_cursor(&range(10_001, 30_000)).unwrap());
        assert_eq!(found.len(), 10_000);
        assert_eq!(found.first(), Some(&10_002));
        assert_eq!(found.last(), Some(&30_000));

        let exclusive = RangePredicate::new(
            Some(Tuple::from_ints(&[10_002])),
            Some(Tuple::from_ints(&[10_010])),
            false,
            false,
            MultiComparator::int64(1),
        )
        .unwrap();
        assert_eq!(
            keys(tree.range_cursor(&exclusive).unwrap()),
            vec![10_004, 10_006, 10_008]
        );
    }

    #[test]
    fn test_point_lookup() {
        let cache = cache();
        let tree = load(&cache, 1, (0..20_000).map(|k| k * 3));

        for k in [0i64, 3, 2_997, 30_000, 59_997] {
            assert_eq!(
                tree.point_lookup(&Tuple::from_ints(&[k])).unwrap(),
                Some(Tuple::from_ints(&[k, -k]))
            );
        }
        for k in [-1i64, 1, 59_998, 100_000] {
            assert_eq!(tree.point_lookup(&Tuple::from_ints(&[k])).unwrap(), None);
        }
    }

    #[test]
    fn test_point_lookup_reads_one_leaf() {
        let cache = cache();
        let tree = load(&cache, 1, 0..5_000);
        assert_eq!(tree.meta().height, 2);

        // Leaf first keys are separators in the root; they must not cost a
        // detour through the leaf to their left.
        for k in 0..5_000i64 {
            let before = cache.stats();
            assert_eq!(
                tree.point_lookup(&Tuple::from_ints(&[k])).unwrap(),
                Some(Tuple::from_ints(&[k, -k]))
            );
            let after = cache.stats();
            let pins = (after.hits + after.misses) - (before.hits + before.misses);
            assert_eq!(pins, 2, "lookup of {k}");
        }
    }

    #[test]
    fn test_comparator_mismatch() {
        let cache = cache();
        let tree = load(&cache, 1, [1, 2]);
        let other = RangePredicate::full_scan(MultiComparator::int64(2));
        assert!(matches!(
            tree.range_cursor(&other),
            Err(StrataError::ComparatorMismatch(_))
        ));
        assert!(matches!(
            DiskBTree::open(Arc::clone(&cache), 1, MultiComparator::int64(2)),
            Err(StrataError::ComparatorMismatch(_))
        ));
    }

    #[test]
    fn test_bloom_loaded_on_open() {
        let cache = cache();
        let cmp = MultiComparator::int64(1);
        let mut loader = BulkLoader::new(
            Arc::clone(&cache),
            7,
            cmp.clone(),
            Some(BloomFilter::with_rate(1_000, 0.01)),
        );
        for k in 0..1_000 {
            loader.add(&Tuple::from_ints(&[k * 2])).unwrap();
        }
        loader.finish().unwrap();

        let tree = DiskBTree::open(Arc::clone(&cache), 7, cmp).unwrap();
        assert!(tree.bloom().is_some());
        for k in 0..1_000 {
            assert!(tree.may_contain(&Tuple::from_ints(&[k * 2])));
        }
        let negatives = (0..1_000)
            .filter(|k| !tree.may_contain(&Tuple::from_ints(&[k * 2 + 1])))
            .count();
        assert!(negatives > 900);
    }

    #[test]
    fn test_reposition_reuses_cursor() {
        let cache = cache();
        let a = load(&cache, 1, 0..100);
        let b = load(&cache, 2, (0..100).map(|k| k + 1_000));

        let mut cursor = a.range_cursor(&range(10, 12)).unwrap();
        assert_eq!(cursor.next_tuple().unwrap(), Some(Tuple::from_ints(&[10, -10])));

        b.reposition(&mut cursor, &range(1_050, 1_051)).unwrap();
        assert_eq!(keys(cursor), vec![1_050, 1_051]);
    }

    #[test]
    fn test_cursor_leaves_no_pins() {
        let cache = cache();
        let tree = load(&cache, 1, 0..10_000);
        let mut cursor = tree.scan().unwrap();
        cursor.next_tuple().unwrap();
        assert_eq!(cache.stats().pinned_frames, 0);
    }
}
