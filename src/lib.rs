//! hopstore - object-relational persistence and caching core for node stores
//!
//! Objects ("nodes") are addressed by keys, cached in a two-generation
//! cache and stored either in relational tables described by per-type
//! mappings or as one XML file per node in an embedded database.

// Core foundational modules
pub mod core;

// Main functional modules
pub mod mapping;
pub mod node;
pub mod storage;
pub mod manager;
pub mod store;
pub mod system;

// Re-export commonly used items for convenience
pub use core::{Config, Error, Result};
pub use manager::{NodeManager, WrappedNodeManager};
pub use mapping::{DbMapping, Key, MappingRegistry, Relation};
pub use node::{Node, NodeHandle, NodeRef, SharedNode, Value};
pub use store::Store;

/// Crate version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Install the tracing subscriber for `config.logging`. `RUST_LOG`
/// overrides the configured level.
pub fn init_logging(config: &core::config::LoggingConfig) -> Result<()> {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| Error::config(format!("Invalid log level {:?}: {}", config.level, e)))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let installed = match config.format.as_str() {
        "json" => builder.json().try_init(),
        "compact" => builder.compact().try_init(),
        _ => builder.pretty().try_init(),
    };
    installed.map_err(|e| Error::config(format!("Logging already initialized: {}", e)))?;

    tracing::info!("Initializing {} v{}", NAME, VERSION);
    Ok(())
}
