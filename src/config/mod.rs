//! # Configuration Module
//!
//! Centralizes the numeric constants of the B-tree substrate. Constants that
//! depend on each other are co-located in [`constants`] and their
//! relationships documented there, with compile-time assertions where a
//! mismatch would corrupt on-segment data.

pub mod constants;
pub use constants::*;
