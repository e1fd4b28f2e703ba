pub mod config;
pub mod errors;
pub mod logging;

pub use config::{AppConfig, DispatcherConfig, LogConfig, WorkerConfig};
pub use errors::{CapError, CapResult};
pub use logging::init_logging;
