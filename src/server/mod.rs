// HTTP surface of the relay.

pub mod handler;
pub mod registry;
