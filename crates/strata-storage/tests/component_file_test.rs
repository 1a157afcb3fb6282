//! Component file integration tests.
//!
//! Exercises the full write/read path of an immutable component file:
//! - Bulk load through confiscated frames into a real data directory
//! - Range and point reads through a buffer cache smaller than the file
//! - Reopen from disk through a fresh cache
//! - Checksum failure on a damaged page
//! - Bloom filter pages surviving a reopen

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::sync::Arc;
use tempfile::tempdir;

use strata_buffer::BufferCache;
use strata_common::page::PAGE_SIZE;
use strata_common::{
    BufferCacheConfig, Field, MultiComparator, RangePredicate, StrataError, Tuple,
};
use strata_storage::{BloomFilter, BulkLoader, DiskBTree, DiskManager, DiskManagerConfig};

// =============================================================================
// Helpers
// =============================================================================

fn open_store(dir: &std::path::Path) -> Arc<DiskManager> {
    let config = DiskManagerConfig {
        data_dir: dir.to_path_buf(),
        fsync_enabled: false,
    };
    Arc::new(DiskManager::new(config).unwrap())
}

fn open_cache(disk: &Arc<DiskManager>, frames: usize) -> Arc<BufferCache> {
    let config = BufferCacheConfig {
        num_frames: frames,
        pin_timeout_ms: 200,
        ..Default::default()
    };
    BufferCache::new(config, disk.clone()).unwrap()
}

fn row(key: i64) -> Tuple {
    Tuple::new(vec![
        Field::Int64(key),
        Field::text(&format!("value-{:06}", key)),
    ])
}

fn random_keys(count: usize, seed: u64) -> Vec<i64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut keys = BTreeSet::new();
    while keys.len() < count {
        keys.insert(rng.gen_range(0..1_000_000i64));
    }
    keys.into_iter().collect()
}

fn load(cache: &Arc<BufferCache>, disk: &DiskManager, keys: &[i64], bloom: bool) -> u32 {
    let file_id = disk.create_file().unwrap();
    let bloom = bloom.then(|| BloomFilter::with_rate(keys.len(), 0.01));
    let mut loader =
        BulkLoader::new(Arc::clone(cache), file_id, MultiComparator::int64(1), bloom);
    for &k in keys {
        loader.add(&row(k)).unwrap();
    }
    loader.finish().unwrap();
    file_id
}

fn scan_keys(tree: &DiskBTree, predicate: &RangePredicate) -> Vec<i64> {
    tree.range_cursor(predicate)
        .unwrap()
        .map(|t| t.unwrap().field(0).and_then(Field::as_i64).unwrap())
        .collect()
}

// =============================================================================
// Tests
// =============================================================================

#[test]
fn test_load_and_scan_through_small_cache() {
    let dir = tempdir().unwrap();
    let disk = open_store(dir.path());
    // Far fewer frames than the file has pages
    let cache = open_cache(&disk, 8);
    let keys = random_keys(30_000, 7);

    let file_id = load(&cache, &disk, &keys, false);
    let tree = DiskBTree::open(Arc::clone(&cache), file_id, MultiComparator::int64(1)).unwrap();
    assert_eq!(tree.tuple_count(), keys.len() as u64);
    assert!(tree.meta().page_count > 8);

    let cmp = MultiComparator::int64(1);
    assert_eq!(scan_keys(&tree, &RangePredicate::full_scan(cmp.clone())), keys);

    let (low, high) = (keys[1_000], keys[2_000]);
    let predicate =
        RangePredicate::closed(Tuple::from_ints(&[low]), Tuple::from_ints(&[high]), cmp).unwrap();
    assert_eq!(scan_keys(&tree, &predicate), keys[1_000..=2_000].to_vec());
    assert_eq!(cache.stats().pinned_frames, 0);
}

#[test]
fn test_point_lookups_after_reopen() {
    let dir = tempdir().unwrap();
    let keys = random_keys(10_000, 11);
    let file_id = {
        let disk = open_store(dir.path());
        let cache = open_cache(&disk, 16);
        load(&cache, &disk, &keys, false)
    };

    let disk = open_store(dir.path());
    let cache = open_cache(&disk, 16);
    let tree = DiskBTree::open(Arc::clone(&cache), file_id, MultiComparator::int64(1)).unwrap();

    let mut rng = StdRng::seed_from_u64(3);
    for _ in 0..500 {
        let k = keys[rng.gen_range(0..keys.len())];
        assert_eq!(tree.point_lookup(&Tuple::from_ints(&[k])).unwrap(), Some(row(k)));
    }
    let present: BTreeSet<i64> = keys.iter().copied().collect();
    for k in (0..2_000).filter(|k| !present.contains(k)) {
        assert_eq!(tree.point_lookup(&Tuple::from_ints(&[k])).unwrap(), None);
    }
}

#[test]
fn test_damaged_leaf_is_detected() {
    let dir = tempdir().unwrap();
    let disk = open_store(dir.path());
    let cache = open_cache(&disk, 8);
    let file_id = load(&cache, &disk, &(0..5_000).collect::<Vec<_>>(), false);
    let path = disk.file_path(file_id);

    // Flip one byte in the middle of the first leaf
    {
        let mut file = OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(PAGE_SIZE as u64 + 9_000)).unwrap();
        file.write_all(&[0xEE]).unwrap();
    }

    let disk = open_store(dir.path());
    let cache = open_cache(&disk, 8);
    let tree = DiskBTree::open(Arc::clone(&cache), file_id, MultiComparator::int64(1)).unwrap();
    let result = tree.scan();
    assert!(matches!(result, Err(StrataError::PageCorrupted { .. })));
}

#[test]
fn test_missing_file_fails_to_open() {
    let dir = tempdir().unwrap();
    let disk = open_store(dir.path());
    let cache = open_cache(&disk, 8);
    let result = DiskBTree::open(cache, 999, MultiComparator::int64(1));
    assert!(matches!(result, Err(StrataError::IoError(_))));
}

#[test]
fn test_bloom_filter_survives_reopen() {
    let dir = tempdir().unwrap();
    let keys: Vec<i64> = (0..20_000).map(|k| k * 2).collect();
    let file_id = {
        let disk = open_store(dir.path());
        let cache = open_cache(&disk, 16);
        load(&cache, &disk, &keys, true)
    };

    let disk = open_store(dir.path());
    let cache = open_cache(&disk, 16);
    let tree = DiskBTree::open(Arc::clone(&cache), file_id, MultiComparator::int64(1)).unwrap();
    assert!(tree.meta().has_bloom());

    for &k in &keys {
        assert!(tree.may_contain(&Tuple::from_ints(&[k])));
    }
    let false_positives = (0..20_000)
        .filter(|k| tree.may_contain(&Tuple::from_ints(&[k * 2 + 1])))
        .count();
    assert!(false_positives < 1_000, "false positives: {}", false_positives);
}
