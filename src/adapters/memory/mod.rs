//! Process-local implementations of the storage and feed seams, used by tests and
//! single-node development runs.

mod feed;
mod store;

pub use feed::InMemoryFeed;
pub use store::InMemoryStore;
