use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::AlignmentError;

/// A cooperative cancellation flag shared between the caller and a running
/// alignment. Long-running drivers check it between rounds, never inside
/// the scoring math.
#[derive(Debug, Default, Clone)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Convert the flag into an error suitable for `?` at a round boundary
    pub fn check(&self) -> Result<(), AlignmentError> {
        if self.is_cancelled() {
            Err(AlignmentError::Cancelled)
        } else {
            Ok(())
        }
    }
}
