//! Store assembly
//!
//! Wires configuration, type mappings, the embedded XML database, metrics
//! and the node manager together.

use crate::core::{Config, Result};
use crate::manager::{NodeManager, WrappedNodeManager};
use crate::mapping::MappingRegistry;
use crate::storage::{DbSource, FileOps, OsFileOps, XmlDatabase};
use crate::system::StoreMetrics;
use std::sync::Arc;
use tracing::{info, warn};

/// One opened node store
#[derive(Debug)]
pub struct Store {
    config: Config,
    registry: Arc<MappingRegistry>,
    nmgr: Arc<NodeManager>,
    wrapped: WrappedNodeManager,
    metrics: Arc<StoreMetrics>,
}

impl Store {
    /// Open the store described by `config`, loading mappings from the
    /// configured application directory
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        let registry = MappingRegistry::from_config(&config.mapping)?;
        Self::open_with(config, registry, Arc::new(OsFileOps))
    }

    /// Open with an already populated registry and custom file operations
    pub fn open_with(config: Config, registry: MappingRegistry, ops: Arc<dyn FileOps>) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(registry);
        registry.update_all()?;

        let db = XmlDatabase::init_with(&config.storage.db_home, config.effective_id_base(), ops)?;
        let metrics = Arc::new(StoreMetrics::new()?);
        let nmgr = Arc::new(NodeManager::new(
            registry.clone(),
            db,
            config.cache.capacity,
            config.mapping.segment_length,
            metrics.clone(),
        ));
        let wrapped = WrappedNodeManager::new(nmgr.clone());

        info!(
            home = %config.storage.db_home.display(),
            mappings = registry.names().len(),
            cache = config.cache.capacity,
            "Store opened"
        );
        Ok(Self {
            config,
            registry,
            nmgr,
            wrapped,
            metrics,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<MappingRegistry> {
        &self.registry
    }

    pub fn node_manager(&self) -> &Arc<NodeManager> {
        &self.nmgr
    }

    /// Manager API with implicit transactions and not-found as `None`
    pub fn wrapped(&self) -> &WrappedNodeManager {
        &self.wrapped
    }

    pub fn metrics(&self) -> &Arc<StoreMetrics> {
        &self.metrics
    }

    /// Make a relational data source available to mappings naming it
    pub fn register_source(&self, source: Arc<dyn DbSource>) {
        info!(source = source.name(), "Registered data source");
        self.registry.register_source(source);
    }

    /// Save the id generator and drop all cached nodes
    pub fn shutdown(self) -> Result<()> {
        if self.nmgr.has_transaction() {
            warn!("Shutting down with an open transaction, aborting it");
            self.nmgr.abort()?;
        }
        self.nmgr.database().flush()?;
        self.nmgr.clear_cache();
        info!(home = %self.config.storage.db_home.display(), "Store shut down");
        Ok(())
    }
}
