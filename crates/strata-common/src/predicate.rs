//! Range predicates over key-ordered tuples.

use crate::comparator::MultiComparator;
use crate::error::{Result, StrataError};
use crate::tuple::Tuple;
use std::cmp::Ordering;

/// Key range `[low, high]` with per-side inclusivity.
///
/// A missing bound is unbounded on that side.
#[derive(Debug, Clone)]
pub struct RangePredicate {
    pub low: Option<Tuple>,
    pub high: Option<Tuple>,
    pub low_inclusive: bool,
    pub high_inclusive: bool,
    pub comparator: MultiComparator,
}

impl RangePredicate {
    /// Creates a predicate, rejecting a low bound above the high bound.
    ///
    /// Equal bounds with an exclusive side are accepted and match nothing.
    pub fn new(
        low: Option<Tuple>,
        high: Option<Tuple>,
        low_inclusive: bool,
        high_inclusive: bool,
        comparator: MultiComparator,
    ) -> Result<Self> {
        let predicate = Self {
            low,
            high,
            low_inclusive,
            high_inclusive,
            comparator,
        };
        predicate.validate()?;
        Ok(predicate)
    }

    /// Predicate matching every tuple.
    pub fn full_scan(comparator: MultiComparator) -> Self {
        Self {
            low: None,
            high: None,
            low_inclusive: true,
            high_inclusive: true,
            comparator,
        }
    }

    /// Predicate matching exactly `key`.
    pub fn point(key: Tuple, comparator: MultiComparator) -> Self {
        Self {
            low: Some(key.clone()),
            high: Some(key),
            low_inclusive: true,
            high_inclusive: true,
            comparator,
        }
    }

    /// Inclusive range `[low, high]`.
    pub fn closed(low: Tuple, high: Tuple, comparator: MultiComparator) -> Result<Self> {
        Self::new(Some(low), Some(high), true, true, comparator)
    }

    /// Returns true if neither side is bounded.
    pub fn is_full_scan(&self) -> bool {
        self.low.is_none() && self.high.is_none()
    }

    /// Checks bound types against the comparator and bound ordering.
    pub fn validate(&self) -> Result<()> {
        for bound in [&self.low, &self.high].into_iter().flatten() {
            self.check_bound(bound)?;
        }
        if let (Some(low), Some(high)) = (&self.low, &self.high) {
            if self.comparator.try_compare(low, high)? == Ordering::Greater {
                return Err(StrataError::InvalidPredicate(format!(
                    "low bound {} is above high bound {}",
                    low, high
                )));
            }
        }
        Ok(())
    }

    fn check_bound(&self, bound: &Tuple) -> Result<()> {
        if bound.arity() > self.comparator.key_field_count() {
            return Err(StrataError::InvalidPredicate(format!(
                "bound {} has more fields than the {}-field key",
                bound,
                self.comparator.key_field_count()
            )));
        }
        for (cmp, field) in self.comparator.fields().iter().zip(bound.fields()) {
            if field.type_id() != cmp.type_id() && !matches!(field, crate::types::Field::Null) {
                return Err(StrataError::TypeMismatch {
                    expected: cmp.type_id().to_string(),
                    actual: field.type_id().to_string(),
                });
            }
        }
        Ok(())
    }

    /// Returns true if `tuple` sorts below the low bound.
    pub fn is_below_low(&self, tuple: &Tuple) -> bool {
        match &self.low {
            None => false,
            Some(low) => match self.comparator.compare(tuple, low) {
                Ordering::Less => true,
                Ordering::Equal => !self.low_inclusive,
                Ordering::Greater => false,
            },
        }
    }

    /// Returns true if `tuple` sorts above the high bound.
    pub fn is_above_high(&self, tuple: &Tuple) -> bool {
        match &self.high {
            None => false,
            Some(high) => match self.comparator.compare(tuple, high) {
                Ordering::Greater => true,
                Ordering::Equal => !self.high_inclusive,
                Ordering::Less => false,
            },
        }
    }

    /// Returns true if `tuple` falls inside the range.
    pub fn contains(&self, tuple: &Tuple) -> bool {
        !self.is_below_low(tuple) && !self.is_above_high(tuple)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Field;

    fn key(v: i64) -> Tuple {
        Tuple::from_ints(&[v])
    }

    #[test]
    fn test_full_scan_contains_everything() {
        let pred = RangePredicate::full_scan(MultiComparator::int64(1));
        assert!(pred.is_full_scan());
        assert!(pred.contains(&key(i64::MIN)));
        assert!(pred.contains(&key(i64::MAX)));
        assert!(!pred.is_above_high(&key(0)));
    }

    #[test]
    fn test_closed_range() {
        let pred = RangePredicate::closed(key(0), key(10), MultiComparator::int64(1)).unwrap();
        assert!(pred.contains(&key(0)));
        assert!(pred.contains(&key(10)));
        assert!(!pred.contains(&key(11)));
        assert!(pred.is_above_high(&key(11)));
        assert!(pred.is_below_low(&key(-1)));
    }

    #[test]
    fn test_exclusive_bounds() {
        let pred =
            RangePredicate::new(Some(key(1)), Some(key(5)), false, false, MultiComparator::int64(1))
                .unwrap();
        assert!(!pred.contains(&key(1)));
        assert!(pred.contains(&key(2)));
        assert!(!pred.contains(&key(5)));
        assert!(pred.is_above_high(&key(5)));
    }

    #[test]
    fn test_point_predicate() {
        let pred = RangePredicate::point(key(7), MultiComparator::int64(1));
        assert!(pred.contains(&Tuple::new(vec![Field::Int64(7), Field::text("x")])));
        assert!(!pred.contains(&key(8)));
    }

    #[test]
    fn test_inverted_bounds_rejected() {
        let err = RangePredicate::closed(key(10), key(0), MultiComparator::int64(1)).unwrap_err();
        assert!(matches!(err, StrataError::InvalidPredicate(_)));

    }

    #[test]
    fn test_equal_bounds_with_exclusive_side_match_nothing() {
        for (low_inclusive, high_inclusive) in [(true, false), (false, true), (false, false)] {
            let pred = RangePredicate::new(
                Some(key(3)),
                Some(key(3)),
                low_inclusive,
                high_inclusive,
                MultiComparator::int64(1),
            )
            .unwrap();
            for k in 2..=4 {
                assert!(!pred.contains(&key(k)), "{low_inclusive} {high_inclusive} {k}");
            }
        }
    }

    #[test]
    fn test_bound_type_checked() {
        let err = RangePredicate::new(
            Some(Tuple::new(vec![Field::text("a")])),
            None,
            true,
            true,
            MultiComparator::int64(1),
        )
        .unwrap_err();
        assert!(matches!(err, StrataError::TypeMismatch { .. }));

        let err = RangePredicate::new(
            Some(Tuple::from_ints(&[1, 2])),
            None,
            true,
            true,
            MultiComparator::int64(1),
        )
        .unwrap_err();
        assert!(matches!(err, StrataError::InvalidPredicate(_)));
    }
}
