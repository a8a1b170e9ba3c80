pub mod aggregate;
pub mod anthropic;
pub mod app;
pub mod cli;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod model;
pub mod pipeline;
pub mod resilience;
pub mod ui;

pub use error::RelayError;
