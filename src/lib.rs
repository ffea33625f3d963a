//! Shared git mirror cache.
//!
//! Keeps one bare mirror per repository under a cache root and materializes
//! ref checkouts from it into caller-owned directories, so repeated deploys of
//! the same repository never re-download its full history.

pub mod cache;
pub mod config;
pub mod exec;
pub mod types;
