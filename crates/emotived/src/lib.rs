//! emotived: HTTP front end for the emotive-core pipeline.

pub mod config;
pub mod engine;
pub mod server;
