//! Quill API
//!
//! Operations HTTP interface over the shared job store: the producer's
//! enqueue endpoint plus job listings, status counts, session statistics and
//! administrative overrides.

pub mod api;
