pub mod app;
pub mod cli;
pub mod config;
pub mod cycles;
pub mod data;
pub mod ingest;
pub mod logging;
pub mod pollers;
pub mod queue;
pub mod services;
pub mod state;
pub mod utils;
pub mod web;
