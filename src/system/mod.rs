//! System utilities and monitoring

pub mod metrics;

pub use metrics::{StoreMetrics, Timer};
