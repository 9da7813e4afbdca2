//! Database models and schema.

pub mod cycles;
pub mod memory;
pub mod models;
pub mod runs;
pub mod sources;
