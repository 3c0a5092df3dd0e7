// Data source abstraction for the origin behind a relay session.

pub mod http_source;
pub mod traits;
