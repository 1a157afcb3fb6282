//! Merge policies.
//!
//! A policy looks at the Disk component metadata, newest first, and picks a
//! contiguous run to merge. Policies are pure: the same metadata always
//! yields the same answer.

use crate::component::{ComponentId, ComponentKind, ComponentMetadata};
use strata_common::MergePolicyKind;

/// Chooses which Disk components to merge.
pub trait MergePolicy: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Returns the ids to merge, newest first, or None if no merge is due.
    ///
    /// `components` lists the operational Disk components newest first.
    /// Memory components are never selected.
    fn select_merge_candidates(&self, components: &[ComponentMetadata]) -> Option<Vec<ComponentId>>;
}

/// Builds the policy named by the configuration.
pub fn create_merge_policy(kind: &MergePolicyKind) -> Box<dyn MergePolicy> {
    match kind {
        MergePolicyKind::NoMerge => Box::new(NoMergePolicy),
        MergePolicyKind::Constant { max_components } => Box::new(ConstantMergePolicy {
            max_components: *max_components,
        }),
        MergePolicyKind::SizeTiered {
            min_merge_width,
            max_merge_width,
            size_ratio,
        } => Box::new(SizeTieredMergePolicy {
            min_merge_width: *min_merge_width,
            max_merge_width: *max_merge_width,
            size_ratio: *size_ratio,
        }),
    }
}

fn disk_only(components: &[ComponentMetadata]) -> impl Iterator<Item = &ComponentMetadata> {
    components.iter().filter(|c| c.kind == ComponentKind::Disk)
}

/// Never merges.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMergePolicy;

impl MergePolicy for NoMergePolicy {
    fn name(&self) -> &'static str {
        "no-merge"
    }

    fn select_merge_candidates(&self, _components: &[ComponentMetadata]) -> Option<Vec<ComponentId>> {
        None
    }
}

/// Merges every Disk component once there are more than `max_components`.
#[derive(Debug, Clone, Copy)]
pub struct ConstantMergePolicy {
    pub max_components: usize,
}

impl MergePolicy for ConstantMergePolicy {
    fn name(&self) -> &'static str {
        "constant"
    }

    fn select_merge_candidates(&self, components: &[ComponentMetadata]) -> Option<Vec<ComponentId>> {
        let ids: Vec<ComponentId> = disk_only(components).map(|c| c.id).collect();
        (ids.len() > self.max_components).then_some(ids)
    }
}

/// Merges the newest run of similarly sized Disk components.
///
/// A run qualifies when it has at least `min_merge_width` members and its
/// largest member is at most `size_ratio` times its smallest. Runs are cut
/// at `max_merge_width`.
#[derive(Debug, Clone, Copy)]
pub struct SizeTieredMergePolicy {
    pub min_merge_width: usize,
    pub max_merge_width: usize,
    pub size_ratio: f64,
}

impl MergePolicy for SizeTieredMergePolicy {
    fn name(&self) -> &'static str {
        "size-tiered"
    }

    fn select_merge_candidates(&self, components: &[ComponentMetadata]) -> Option<Vec<ComponentId>> {
        let disk: Vec<&ComponentMetadata> = disk_only(components).collect();
        let size = |i: usize| disk[i].size_bytes.max(1) as f64;

        for start in 0..disk.len() {
            let (mut smallest, mut largest) = (size(start), size(start));
            let mut end = start + 1;
            while end < disk.len() && end - start < self.max_merge_width {
                let s = size(end);
                let (lo, hi) = (smallest.min(s), largest.max(s));
                if hi > lo * self.size_ratio {
                    break;
                }
                smallest = lo;
                largest = hi;
                end += 1;
            }
            if end - start >= self.min_merge_width {
                return Some(disk[start..end].iter().map(|c| c.id).collect());
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disk(id: u64, size_bytes: u64) -> ComponentMetadata {
        ComponentMetadata {
            id: ComponentId(id),
            kind: ComponentKind::Disk,
            size_bytes,
            tuple_count: size_bytes / 10,
            tombstone_count: 0,
            created_at: id,
        }
    }

    fn ids(raw: &[u64]) -> Vec<ComponentId> {
        raw.iter().map(|&id| ComponentId(id)).collect()
    }

    #[test]
    fn test_no_merge() {
        let components: Vec<_> = (0..10).map(|i| disk(i, 100)).collect();
        assert_eq!(NoMergePolicy.select_merge_candidates(&components), None);
    }

    #[test]
    fn test_constant_threshold() {
        let policy = ConstantMergePolicy { max_components: 3 };
        let three: Vec<_> = (1..=3).rev().map(|i| disk(i, 100)).collect();
        assert_eq!(policy.select_merge_candidates(&three), None);

        let mut four = three.clone();
        four.insert(0, disk(4, 100));
        assert_eq!(policy.select_merge_candidates(&four), Some(ids(&[4, 3, 2, 1])));
    }

    #[test]
    fn test_constant_ignores_memory_components() {
        let policy = ConstantMergePolicy { max_components: 1 };
        let mut memory = disk(9, 10);
        memory.kind = ComponentKind::Memory;
        let components = vec![memory, disk(2, 100), disk(1, 100)];
        assert_eq!(policy.select_merge_candidates(&components), Some(ids(&[2, 1])));
    }

    #[test]
    fn test_size_tiered_picks_similar_run() {
        let policy = SizeTieredMergePolicy {
            min_merge_width: 3,
            max_merge_width: 4,
            size_ratio: 2.0,
        };
        // Newest first: one small, then three of similar size, then a big one
        let components = vec![
            disk(6, 10),
            disk(5, 1_000),
            disk(4, 1_200),
            disk(3, 1_500),
            disk(2, 100_000),
        ];
        assert_eq!(policy.select_merge_candidates(&components), Some(ids(&[5, 4, 3])));
        // Same input, same answer
        assert_eq!(
            policy.select_merge_candidates(&components),
            policy.select_merge_candidates(&components)
        );
    }

    #[test]
    fn test_size_tiered_respects_width() {
        let policy = SizeTieredMergePolicy {
            min_merge_width: 2,
            max_merge_width: 3,
            size_ratio: 1.5,
        };
        let components: Vec<_> = (1..=6).rev().map(|i| disk(i, 500)).collect();
        assert_eq!(policy.select_merge_candidates(&components), Some(ids(&[6, 5, 4])));

        let spread = vec![disk(3, 10), disk(2, 1_000), disk(1, 100_000)];
        assert_eq!(policy.select_merge_candidates(&spread), None);
    }

    #[test]
    fn test_create_from_config() {
        let policy = create_merge_policy(&MergePolicyKind::Constant { max_components: 2 });
        assert_eq!(policy.name(), "constant");
        assert_eq!(create_merge_policy(&MergePolicyKind::NoMerge).name(), "no-merge");
    }
}
