pub mod cli;
pub mod config;
pub mod editor;
pub mod error;
pub mod orchestrator;
pub mod preview;
pub mod project;
pub mod relay;
pub mod resize;
pub mod sandbox;
pub mod session;
pub mod shell;
pub mod terminal;

#[cfg(test)]
mod testing;

pub use error::{PlaypenError, Result};
