pub mod app_config;
pub mod driver_node;
pub mod load_balancing;

// Re-export main types for easier imports
pub use app_config::AppConfig;
pub use driver_node::{DriverConfig, NodeConfig};
pub use load_balancing::{Algorithm, LoadBalancingConfig, Weighting};
