// Mux path: an external process whose stdout becomes the response body.

pub mod command;
pub mod relay;
