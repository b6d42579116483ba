pub mod agent;
pub mod collab;
pub mod config;
pub mod core;
pub mod error;
pub mod execution;
pub mod log;
pub mod prompt;
pub mod sandbox;
pub mod util;
pub mod validation;

pub use error::{Error, Result};
