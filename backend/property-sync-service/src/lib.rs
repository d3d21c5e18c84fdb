pub mod config;
pub mod error;
pub mod metrics;
pub mod server;
pub mod services;

pub use config::Config;
pub use error::{ErrorClass, Result, SyncError};
