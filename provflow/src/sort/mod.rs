//! External sorting with scoped spill storage.

mod external;
mod spill;

pub use external::{ExternalSorter, SortKey, SortedRecords};
pub use spill::SpillArena;
