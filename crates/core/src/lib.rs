pub mod adapters;
pub mod config;
pub mod model;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
