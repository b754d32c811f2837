//! Monitoring points and the query service that exposes them.
pub mod server;
pub mod store;

pub use store::{MonitorValue, MonitoringPoint, MonitoringStore, PointStatus};
