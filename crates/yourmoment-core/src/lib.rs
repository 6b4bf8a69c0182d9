/// Core library for the yourMoment monitoring and commenting service.
///
/// This crate contains all business logic: configuration management, the
/// credential vault, the platform scraper adapter, session management, the
/// LLM gateway, the monitoring pipeline, and shared storage types used by
/// the CLI binary.
pub mod config;
pub mod content;
pub mod error;
pub mod llm;
pub mod monitor;
pub mod queue;
pub mod ratelimit;
pub mod scraper;
pub mod session;
pub mod startup;
pub mod storage;
pub mod vault;
pub mod versioning;

pub use error::*;

/// Returns the version of the yourmoment-core library.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
