//! HTTP API: health, active cycle resolution and the admin surface.

pub mod cycles;
pub mod error;
pub mod extract;
pub mod routes;
pub mod sources;
pub mod status;

pub use routes::*;
