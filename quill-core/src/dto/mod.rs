//! Data Transfer Objects
//!
//! Request and response shapes exchanged between producers, operators and the
//! operations API.

pub mod job;
