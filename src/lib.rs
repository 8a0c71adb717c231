pub mod cli;
pub mod config;
pub mod control;
pub mod core;
pub mod error;

pub use control::{ControlBlock, SharedControl, MAX_OUTPUTS};
pub use error::{Error, Result};
