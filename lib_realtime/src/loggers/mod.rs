/// File and console logging for the binaries built on this crate.
pub mod file_logger;

pub use file_logger::{parse_level, setup_logging, LoggingError};
