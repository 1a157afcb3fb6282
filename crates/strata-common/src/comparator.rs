//! Field and tuple comparators.
//!
//! A [`MultiComparator`] is an ordered list of per-field comparators and
//! defines the total order used for sort order and range bounds alike.

use crate::error::{Result, StrataError};
use crate::tuple::Tuple;
use crate::types::{Field, TypeId};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Sort direction of one key field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

/// Comparator for a single key field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldComparator {
    Int64(SortOrder),
    Float64(SortOrder),
    Bytes(SortOrder),
}

impl FieldComparator {
    /// Returns the field type this comparator accepts.
    pub fn type_id(&self) -> TypeId {
        match self {
            FieldComparator::Int64(_) => TypeId::Int64,
            FieldComparator::Float64(_) => TypeId::Float64,
            FieldComparator::Bytes(_) => TypeId::Bytes,
        }
    }

    fn order(&self) -> SortOrder {
        match self {
            FieldComparator::Int64(o) | FieldComparator::Float64(o) | FieldComparator::Bytes(o) => {
                *o
            }
        }
    }

    /// Compares two fields. Null sorts before every non-null value.
    pub fn compare(&self, a: &Field, b: &Field) -> Result<Ordering> {
        let ordering = match (a, b) {
            (Field::Null, Field::Null) => return Ok(Ordering::Equal),
            (Field::Null, _) => return Ok(Ordering::Less),
            (_, Field::Null) => return Ok(Ordering::Greater),
            (Field::Int64(x), Field::Int64(y)) if self.type_id() == TypeId::Int64 => x.cmp(y),
            (Field::Float64(x), Field::Float64(y)) if self.type_id() == TypeId::Float64 => {
                x.total_cmp(y)
            }
            (Field::Bytes(x), Field::Bytes(y)) if self.type_id() == TypeId::Bytes => {
                x.as_ref().cmp(y.as_ref())
            }
            (a, b) => {
                let actual = if a.type_id() != self.type_id() { a } else { b };
                return Err(StrataError::TypeMismatch {
                    expected: self.type_id().to_string(),
                    actual: actual.type_id().to_string(),
                });
            }
        };
        Ok(match self.order() {
            SortOrder::Ascending => ordering,
            SortOrder::Descending => ordering.reverse(),
        })
    }
}

/// Ordered list of per-field comparators over the key prefix of tuples.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MultiComparator {
    fields: Vec<FieldComparator>,
}

impl MultiComparator {
    /// Creates a comparator from its per-field comparators.
    pub fn new(fields: Vec<FieldComparator>) -> Self {
        Self { fields }
    }

    /// Ascending Int64 comparator over `key_fields` fields.
    pub fn int64(key_fields: usize) -> Self {
        Self {
            fields: vec![FieldComparator::Int64(SortOrder::Ascending); key_fields],
        }
    }

    /// Returns the per-field comparators.
    pub fn fields(&self) -> &[FieldComparator] {
        &self.fields
    }

    /// Returns the number of key fields this comparator orders by.
    pub fn key_field_count(&self) -> usize {
        self.fields.len()
    }

    /// Two comparators are compatible when they agree field for field.
    pub fn is_compatible(&self, other: &MultiComparator) -> bool {
        self == other
    }

    /// Compares two tuples over the key fields.
    ///
    /// Either side may be a shorter prefix key; comparison stops at the
    /// shorter of the two and a prefix compares equal to its extensions.
    pub fn try_compare(&self, a: &Tuple, b: &Tuple) -> Result<Ordering> {
        for (i, cmp) in self.fields.iter().enumerate() {
            let (Some(x), Some(y)) = (a.field(i), b.field(i)) else {
                break;
            };
            match cmp.compare(x, y)? {
                Ordering::Equal => continue,
                other => return Ok(other),
            }
        }
        Ok(Ordering::Equal)
    }

    /// Compares two tuples, treating a field type mismatch as equal.
    ///
    /// Ordered containers need a total comparison; callers validate tuples
    /// with [`MultiComparator::check`] before inserting them.
    pub fn compare(&self, a: &Tuple, b: &Tuple) -> Ordering {
        self.try_compare(a, b).unwrap_or(Ordering::Equal)
    }

    /// Verifies that the key prefix of `tuple` has the types this comparator expects.
    pub fn check(&self, tuple: &Tuple) -> Result<()> {
        if tuple.arity() < self.fields.len() {
            return Err(StrataError::InvalidTuple(format!(
                "tuple has {} fields, key needs {}",
                tuple.arity(),
                self.fields.len()
            )));
        }
        for (cmp, field) in self.fields.iter().zip(tuple.fields()) {
            if !matches!(field, Field::Null) && field.type_id() != cmp.type_id() {
                return Err(StrataError::TypeMismatch {
                    expected: cmp.type_id().to_string(),
                    actual: field.type_id().to_string(),
                });
            }
        }
        Ok(())
    }
}
