// crates/verifetch-painter/src/options.rs

//! Tunables for a [`crate::Painter`].

use std::time::Duration;

/// Fetch and retry configuration for a painter.
///
/// The retry budget is per *chunk*, not per request: `retry_limit`
/// additional attempts with doubling backoff, the whole sequence bounded by
/// `chunk_deadline`.
#[derive(Debug, Clone)]
pub struct PainterOptions {
    /// Maximum concurrent chunk fetches.
    pub max_in_flight: usize,
    /// Additional attempts after the first failed one.
    pub retry_limit: u32,
    /// Backoff before the first retry; doubles per retry.
    pub initial_backoff: Duration,
    /// Timeout applied to each HTTP request.
    pub request_timeout: Duration,
    /// Deadline for one chunk across all retries.
    pub chunk_deadline: Duration,
}

impl Default for PainterOptions {
    fn default() -> Self {
        Self {
            max_in_flight: 8,
            retry_limit: 3,
            initial_backoff: Duration::from_millis(250),
            request_timeout: Duration::from_secs(30),
            chunk_deadline: Duration::from_secs(120),
        }
    }
}
