//! Sources that stop when their token is cancelled.

use tracing::debug;

use super::record::Record;
use super::source::RecordSource;
use crate::cancellation::CancellationToken;
use crate::errors::Result;

/// Wraps a source so that cancelling `token` closes it.
///
/// Once cancelled the wrapper closes the inner source and reports end of
/// stream; downstream stages finish normally and release their resources.
#[derive(Debug)]
pub struct CancellableSource<S> {
    inner: S,
    token: CancellationToken,
    closed: bool,
}

impl<S: RecordSource> CancellableSource<S> {
    /// Wraps `inner`.
    #[must_use]
    pub fn new(inner: S, token: CancellationToken) -> Self {
        Self {
            inner,
            token,
            closed: false,
        }
    }

    /// The token observed by this source.
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Unwraps the inner source.
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: RecordSource> RecordSource for CancellableSource<S> {
    fn next_record(&mut self) -> Result<Option<Record>> {
        if self.closed {
            return Ok(None);
        }
        if self.token.is_cancelled() {
            debug!(reason = ?self.token.reason(), "Source cancelled");
            self.close();
            return Ok(None);
        }
        self.inner.next_record()
    }

    fn progress(&self) -> f64 {
        self.inner.progress()
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.inner.close();
        }
    }
}
