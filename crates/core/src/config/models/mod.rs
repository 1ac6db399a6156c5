pub mod app_config;
pub mod cluster;
pub mod store_observability;

pub use app_config::AppConfig;
pub use cluster::{CoordinationConfig, GroupsConfig, NodeConfig};
pub use store_observability::{ObservabilityConfig, StoreConfig};
