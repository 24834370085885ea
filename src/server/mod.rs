mod config;

pub use config::{AuthSection, LoggingSection, ServerConfig, ServerSection};
