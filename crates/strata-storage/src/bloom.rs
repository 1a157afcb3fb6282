//! Bloom filter over serialized keys, persisted as a run of pages.
//!
//! Bit positions come from double hashing (`h1 + i * h2`) of two
//! `SipHasher13` digests with fixed keys, so a filter written by one process
//! answers identically when reloaded by another.

use siphasher::sip::SipHasher13;
use std::hash::Hasher;
use strata_common::page::{PageHeader, PageId, PageType, PAGE_SIZE};
use strata_common::{Result, StrataError};

const SEED_A: (u64, u64) = (0x517c_c1b7_2722_0a95, 0x0fc9_4dc6_e6eb_8a5f);
const SEED_B: (u64, u64) = (0x9e37_79b9_7f4a_7c15, 0xbf58_476d_1ce4_e5b9);

/// Bytes of filter bits carried by one page.
pub const BLOOM_BYTES_PER_PAGE: usize = PAGE_SIZE - PageHeader::SIZE;

/// Probabilistic set of keys. No false negatives.
#[derive(Clone)]
pub struct BloomFilter {
    bits: Vec<u64>,
    num_bits: u64,
    num_hashes: u32,
}

impl BloomFilter {
    /// Creates a filter with `num_bits` bits and `num_hashes` probes.
    pub fn new(num_bits: u64, num_hashes: u32) -> Self {
        let num_bits = num_bits.max(64);
        Self {
            bits: vec![0u64; num_bits.div_ceil(64) as usize],
            num_bits,
            num_hashes: num_hashes.clamp(1, 30),
        }
    }

    /// Creates a filter sized for `expected_items` at `false_positive_rate`.
    pub fn with_rate(expected_items: usize, false_positive_rate: f64) -> Self {
        let expected_items = expected_items.max(1);
        let fp_rate = false_positive_rate.clamp(0.0001, 0.5);

        // m = -n * ln(p) / ln(2)^2
        let m = -((expected_items as f64) * fp_rate.ln() / (2.0_f64.ln().powi(2)));
        let num_bits = (m.ceil() as u64).max(64);
        // k = (m / n) * ln(2)
        let k = ((num_bits as f64 / expected_items as f64) * 2.0_f64.ln()).round() as u32;

        Self::new(num_bits, k)
    }

    fn hash_pair(key: &[u8]) -> (u64, u64) {
        let mut a = SipHasher13::new_with_keys(SEED_A.0, SEED_A.1);
        a.write(key);
        let mut b = SipHasher13::new_with_keys(SEED_B.0, SEED_B.1);
        b.write(key);
        // Odd step so the probes cycle through distinct positions
        (a.finish(), b.finish() | 1)
    }

    #[inline]
    fn bit_index(&self, h1: u64, h2: u64, i: u32) -> u64 {
        h1.wrapping_add((i as u64).wrapping_mul(h2)) % self.num_bits
    }

    /// Adds a key.
    pub fn insert(&mut self, key: &[u8]) {
        let (h1, h2) = Self::hash_pair(key);
        for i in 0..self.num_hashes {
            let idx = self.bit_index(h1, h2, i);
            self.bits[(idx / 64) as usize] |= 1u64 << (idx % 64);
        }
    }

    /// Returns false if `key` was definitely never inserted.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        let (h1, h2) = Self::hash_pair(key);
        (0..self.num_hashes).all(|i| {
            let idx = self.bit_index(h1, h2, i);
            self.bits[(idx / 64) as usize] & (1u64 << (idx % 64)) != 0
        })
    }

    /// Number of bits.
    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }

    /// Number of probes per key.
    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    /// Fraction of bits set.
    pub fn fill_ratio(&self) -> f64 {
        let ones: u64 = self.bits.iter().map(|w| w.count_ones() as u64).sum();
        ones as f64 / self.num_bits as f64
    }

    fn byte_len(&self) -> usize {
        self.bits.len() * 8
    }

    /// Number of pages needed to persist the bits.
    pub fn page_count(&self) -> u32 {
        self.byte_len().div_ceil(BLOOM_BYTES_PER_PAGE) as u32
    }

    /// Writes the `index`-th bit page into `data`.
    pub fn write_page(&self, index: u32, page_id: PageId, data: &mut [u8]) {
        data[..PAGE_SIZE].fill(0);
        let start = index as usize * BLOOM_BYTES_PER_PAGE;
        let end = (start + BLOOM_BYTES_PER_PAGE).min(self.byte_len());

        let mut header = PageHeader::new(page_id, PageType::BloomFilter);
        header.free_space_offset = (PageHeader::SIZE + (end - start)) as u16;
        data[..PageHeader::SIZE].copy_from_slice(&header.to_bytes());

        for (offset, byte_idx) in (start..end).enumerate() {
            let word = self.bits[byte_idx / 8];
            data[PageHeader::SIZE + offset] = (word >> ((byte_idx % 8) * 8)) as u8;
        }
    }

    /// Rebuilds a filter from its pages, in order.
    pub fn from_pages<'a>(
        num_bits: u64,
        num_hashes: u32,
        pages: impl IntoIterator<Item = &'a [u8]>,
    ) -> Result<Self> {
        let mut filter = Self::new(num_bits, num_hashes);
        let total = filter.byte_len();
        let mut byte_idx = 0;

        for page in pages {
            let header = PageHeader::from_bytes(page).ok_or_else(|| {
                StrataError::Internal("bloom page with unknown page type".to_string())
            })?;
            if header.page_type != PageType::BloomFilter {
                return Err(StrataError::PageCorrupted {
                    page_id: header.page_id,
                    reason: format!("expected bloom filter page, found {:?}", header.page_type),
                });
            }
            let len = (total - byte_idx).min(BLOOM_BYTES_PER_PAGE);
            for &byte in &page[PageHeader::SIZE..PageHeader::SIZE + len] {
                filter.bits[byte_idx / 8] |= (byte as u64) << ((byte_idx % 8) * 8);
                byte_idx += 1;
            }
        }

        if byte_idx != total {
            return Err(StrataError::Internal(format!(
                "bloom filter pages hold {} of {} bytes",
                byte_idx, total
            )));
        }
        Ok(filter)
    }
}

impl std::fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BloomFilter")
            .field("num_bits", &self.num_bits)
            .field("num_hashes", &self.num_hashes)
            .field("fill_ratio", &format!("{:.2}%", self.fill_ratio() * 100.0))
            .finish()
    }
}
