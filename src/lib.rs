pub mod api;
pub mod auth;
pub mod collector;
pub mod provider;
pub mod record;
pub mod sanitize;
pub mod status;
pub mod ws;

/// Upper bound on records retained in memory, and the sizing basis for
/// the dedup horizon the providers keep.
pub const MAX_RECORDS_IN_MEMORY: usize = 10_000;
