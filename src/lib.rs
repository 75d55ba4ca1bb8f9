//! Anvil: lifetime-tracked Vulkan object wrappers.
//!
//! The crate covers the device-side core of a renderer backend: an object
//! registry with leak reporting, a content-addressed shader module cache,
//! deferred pipeline baking with derivative resolution, deferred memory
//! allocation, and sparse residency tracking for buffers and images.

pub mod backend;
pub mod config;
mod error;

pub use error::{driver_result, AnvilError};
