//! Indexed parent/child containers.
//!
//! File layout, after the chain header:
//!
//! ```text
//! magic      "PVCONT01"
//! parents    u32 count, then one record per parent (id == position)
//! children   records grouped by parent, in parent order
//! index      (u64 offset, u64 count) per parent
//! trailer    u64 first-parent offset, u64 index offset
//! ```
//!
//! A container is written once, in a single pass, and never updated.

mod reader;
mod slicer;
mod writer;

pub use reader::{ChildCursor, ChildRange, ContainerReader};
pub use slicer::{slice_container, ContainerSlicer, SliceReport};
pub use writer::ContainerWriter;

/// Magic bytes following the chain header of every container.
pub const CONTAINER_MAGIC: &[u8; 8] = b"PVCONT01";
