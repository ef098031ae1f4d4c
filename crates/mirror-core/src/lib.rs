pub mod audit;
pub mod config;
pub mod error;
pub mod io;
pub mod manifest;
pub mod paths;
pub mod rate_limit;
pub mod refresh;
pub mod schedule;

pub use error::{MirrorError, Result};
