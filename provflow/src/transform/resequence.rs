//! Restoring input order after unordered completion.

use std::collections::BTreeMap;

use crate::errors::{ProvflowError, Result};

/// Holds out-of-order completions until every predecessor was released.
///
/// Items are tagged with their zero-based input position.
#[derive(Debug)]
pub struct Resequencer<T> {
    next: u64,
    pending: BTreeMap<u64, T>,
}

impl<T> Default for Resequencer<T> {
    fn default() -> Self {
        Self {
            next: 0,
            pending: BTreeMap::new(),
        }
    }
}

impl<T> Resequencer<T> {
    /// Creates an empty resequencer expecting position 0 first.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts the item at `position`.
    pub fn push(&mut self, position: u64, item: T) -> Result<()> {
        if position < self.next || self.pending.contains_key(&position) {
            return Err(ProvflowError::invalid_state(format!(
                "position {position} was already sequenced"
            )));
        }
        self.pending.insert(position, item);
        Ok(())
    }

    /// Releases the next item if it has arrived.
    pub fn pop_ready(&mut self) -> Option<T> {
        let item = self.pending.remove(&self.next)?;
        self.next += 1;
        Some(item)
    }

    /// Number of items released so far.
    #[must_use]
    pub fn released(&self) -> u64 {
        self.next
    }

    /// Number of items waiting for a predecessor.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_order_arrivals() {
        let mut seq = Resequencer::new();
        seq.push(2, "c").unwrap();
        seq.push(1, "b").unwrap();
        assert_eq!(seq.pop_ready(), None);
        assert_eq!(seq.pending(), 2);

        seq.push(0, "a").unwrap();
        let released: Vec<_> = std::iter::from_fn(|| seq.pop_ready()).collect();
        assert_eq!(released, vec!["a", "b", "c"]);
        assert_eq!(seq.released(), 3);
    }

    #[test]
    fn test_duplicate_positions_are_rejected() {
        let mut seq = Resequencer::new();
        seq.push(0, 1).unwrap();
        assert!(seq.push(0, 2).is_err());
        seq.pop_ready();
        assert!(seq.push(0, 3).is_err());
    }
}
