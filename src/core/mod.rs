//! Core domain models for cirun
//!
//! This module defines the fundamental data structures that represent
//! job files, pipelines, jobs, steps and cache keys.

pub mod cache_key;
pub mod config;
pub mod context;
pub mod lint;
pub mod matrix;
pub mod pipeline;
pub mod state;
pub mod step;

pub use cache_key::{CacheKeyTemplate, CacheKeyError, KeyContext};
pub use context::*;
pub use pipeline::*;
pub use state::*;
pub use step::*;
