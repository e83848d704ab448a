//! Node management: cache, transactions and the manager facades

pub mod cache;
pub mod node_manager;
pub mod transactor;
pub mod wrapped;

pub use cache::NodeCache;
pub use node_manager::NodeManager;
pub use transactor::Transactor;
pub use wrapped::WrappedNodeManager;
