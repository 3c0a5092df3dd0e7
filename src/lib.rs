//! Relay large remote media streams to a client without staging them on disk.
//!
//! Two delivery paths share one error model:
//!
//! - **Fetch path** ([`engine::session::StreamRelay`]): a resource of known
//!   size is pulled in parallel byte ranges and re-serialized in order.
//! - **Mux path** ([`pipe::relay::ProcessPipeRelay`]): remote inputs are fed
//!   to an external mux process whose stdout is forwarded live.
//!
//! Both tear down their workers or process when the consumer goes away.

pub mod config;
pub mod engine;
pub mod error;
pub mod mime;
pub mod pipe;
pub mod resolver;
pub mod server;
pub mod source;
pub mod telemetry;

pub use config::RelayConfig;
pub use error::RelayError;
