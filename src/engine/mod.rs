// Fetch-path engine: parallel range download re-serialized in order.

pub mod fetcher;
pub mod partition;
pub mod reassembler;
pub mod session;
pub mod stats;
pub mod store;
