//! On-disk constants for component B+tree files.

/// Magic number at the start of every metadata page ("STRT").
pub const COMPONENT_MAGIC: u32 = 0x5354_5254;

/// Current component file format version.
pub const FORMAT_VERSION: u16 = 1;

/// Page number of the metadata page.
pub const META_PAGE_NUM: u32 = 0;

/// Sentinel page number meaning "no page".
pub const NO_PAGE: u32 = u32::MAX;

/// Maximum serialized tuple size in bytes.
///
/// Keeps at least three entries per page, so internal levels always shrink.
pub const MAX_TUPLE_SIZE: usize = 4000;

/// Size of one slot in the slot array (offset:2 + len:2).
pub(crate) const SLOT_SIZE: usize = 4;
