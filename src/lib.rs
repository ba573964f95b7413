// src/lib.rs

pub mod config;
pub mod dataset;
pub mod dedup;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod mapping;
pub mod parse;
pub mod pipeline;

pub use config::Config;
pub use error::{Error, Result};
