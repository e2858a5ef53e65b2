pub mod assembler;
pub mod config;
pub mod error;
pub mod gate;
pub mod registry;
pub mod run;
pub mod store;
pub mod types;

pub use error::{Result, RunbookError};
