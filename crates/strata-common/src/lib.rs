//! Strata common types, errors, and utilities.
//!
//! This crate provides shared definitions used across all Strata components:
//! the error taxonomy, configuration, page identifiers and the tuple model.

pub mod comparator;
pub mod config;
pub mod error;
pub mod page;
pub mod predicate;
pub mod tuple;
pub mod types;

pub use comparator::{FieldComparator, MultiComparator, SortOrder};
pub use config::{BufferCacheConfig, LsmConfig, MergePolicyKind, StorageConfig};
pub use error::{ErrorKind, Result, StrataError};
pub use page::{PageFlags, PageHeader, PageId, PageType, PAGE_SIZE};
pub use predicate::RangePredicate;
pub use tuple::Tuple;
pub use types::{Field, TypeId};
