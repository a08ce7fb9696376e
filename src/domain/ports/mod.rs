mod map_store;
mod transport;

pub use map_store::MapStore;
pub use transport::{Subscription, Transport};
