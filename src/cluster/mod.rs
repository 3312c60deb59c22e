pub mod autoscaler;
pub mod manager;
pub mod process;

pub use autoscaler::Autoscaler;
pub use manager::{AutoscaleCommand, ClusterManager, ResourceSample};
