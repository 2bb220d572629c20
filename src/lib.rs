pub mod algorithms;
pub mod config;
pub mod error;
pub mod features;
pub mod matching;
pub mod tracking;

pub use config::Config;
pub use error::{Error, Result};
