//! Core domain types
//!
//! This module contains the core domain structures used across Quill services.
//! They are shared between the store (persistence), the dispatcher (execution)
//! and the operations API (queries).

pub mod checkpoint;
pub mod job;
pub mod session;
