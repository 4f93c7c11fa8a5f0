//! Shared test utilities for adapters-core.
//!
//! Tiny host configurations, twin models over identical base weights, and
//! tensor comparison helpers for unit and integration tests.

mod tiny_config;
mod twins;

pub use tiny_config::{tiny_config, tiny_decoder_config};
pub use twins::{max_abs_diff, sample_input_ids, twin_models};
