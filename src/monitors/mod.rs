//! Shipped monitor implementations.

pub mod kernel;
