pub mod entities;
pub mod ports;

pub use entities::*;
pub use fleet_core::{ClusterError, ClusterResult};
pub use ports::*;
