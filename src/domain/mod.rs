//! Domain Layer
//!
//! Ports the sharing core depends on. Adapters live in `crate::adapters`.

pub mod ports;
