//! Default constants for fundhist configuration.
//!
//! All magic numbers are centralized here with documentation.

// =============================================================================
// Hashing Defaults
// =============================================================================

/// Fields that identify "the same listing" across runs.
/// The detail page URL survives title edits and re-categorisation.
pub const DEFAULT_IDENTITY_FIELDS: &[&str] = &["url"];

/// Fields whose changes open a new content version.
pub const DEFAULT_CHECKSUM_FIELDS: &[&str] = &["title", "url", "description"];

// =============================================================================
// Engine Defaults
// =============================================================================

/// Identity count above which the per-identity merge runs on the rayon pool.
/// Below this the thread hand-off costs more than the merge itself.
pub const DEFAULT_PARALLEL_THRESHOLD: usize = 50_000;

// =============================================================================
// Storage Defaults
// =============================================================================

/// Default data directory for the RocksDB history store
pub const DEFAULT_DATA_DIR: &str = "fundhist-data";

// =============================================================================
// Ingest Retry Defaults
// =============================================================================

/// Attempts after the first request before an ingestor gives up
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Base of the exponential backoff, in seconds
pub const DEFAULT_BACKOFF_FACTOR: f64 = 0.6;

/// Upper bound of the random jitter added to each backoff, in seconds
pub const DEFAULT_MAX_JITTER_SECS: f64 = 1.0;

/// Per-request timeout in seconds
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

/// HTTP status codes worth retrying
pub const DEFAULT_RETRY_STATUSES: &[u16] = &[429, 500, 502, 503, 504];

pub fn default_identity_fields() -> Vec<String> {
    DEFAULT_IDENTITY_FIELDS.iter().map(|s| s.to_string()).collect()
}

pub fn default_checksum_fields() -> Vec<String> {
    DEFAULT_CHECKSUM_FIELDS.iter().map(|s| s.to_string()).collect()
}
