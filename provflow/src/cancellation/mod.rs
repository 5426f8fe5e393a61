//! Cooperative cancellation.
//!
//! Stages abort by cancelling the token shared with their upstream source;
//! the source then reports end of stream and downstream stages wind down
//! normally, releasing any spill storage they hold.

mod token;

pub use token::CancellationToken;
