//! Configuration module

pub mod cli;
pub mod settings;

pub use cli::{CliArgs, Framing};
pub use settings::Settings;
