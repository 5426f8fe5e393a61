//! Assertions over record sequences.

use crate::records::Record;

/// Asserts that ids strictly increase.
pub fn assert_strictly_increasing_ids(records: &[Record]) {
    for pair in records.windows(2) {
        assert!(
            pair[0].id < pair[1].id,
            "Expected strictly increasing ids, got {} then {}",
            pair[0].id,
            pair[1].id
        );
    }
}

/// Asserts that every record has a parent in `0..parent_count`.
pub fn assert_parent_ids_in_range(records: &[Record], parent_count: usize) {
    for record in records {
        let parent = record.parent_id;
        assert!(
            parent.and_then(|p| usize::try_from(p).ok()).is_some_and(|p| p < parent_count),
            "Record {} has parent {:?}, expected one in 0..{}",
            record.id,
            parent,
            parent_count
        );
    }
}

/// Asserts that every record belongs to `parent_id`.
pub fn assert_all_children_of(records: &[Record], parent_id: i32) {
    for record in records {
        assert_eq!(
            record.parent_id,
            Some(parent_id),
            "Record {} belongs to {:?}, expected {}",
            record.id,
            record.parent_id,
            parent_id
        );
    }
}
