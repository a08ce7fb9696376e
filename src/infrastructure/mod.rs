//! Infrastructure Layer
//!
//! Cross-cutting concerns.

pub mod shutdown;

pub use shutdown::{shutdown_signal, ShutdownController, TaskGuard};
