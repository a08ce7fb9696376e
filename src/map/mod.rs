//! Versioned map engine.

pub mod method;
pub mod reference;
pub mod types;
pub mod versioned;

pub use method::MethodSpec;
pub use reference::MapRef;
pub use types::{CatchUp, Delta, DEFAULT_LOG_WINDOW, FIRST_VERSION, VERSION_KEY};
pub use versioned::{MapOptions, VersionedMap};
