#![forbid(unsafe_code)]

//! Shared library for the tubegrab backend: configuration, metadata DTOs,
//! the progress store, the extraction seam and the download orchestrator.
//! The HTTP surface lives in `src/bin/backend.rs`.

pub mod config;
pub mod downloads;
pub mod extract;
pub mod metadata;
pub mod progress;
pub mod security;
