#![warn(clippy::all)]

pub mod config;
pub mod gateway;
pub mod relay;

pub use config::Config;
