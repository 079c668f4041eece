//! Quill Core
//!
//! Core types shared by every Quill component.
//!
//! This crate contains:
//! - Domain types: jobs, checkpoints and the shared dispatch session
//! - DTOs: request/response shapes for the operations API
//! - Clock: the time source used by stores and the rate limit guard

pub mod clock;
pub mod domain;
pub mod dto;
