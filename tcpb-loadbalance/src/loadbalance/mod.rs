pub mod balancer;
pub mod pool;
pub mod strategy;
pub mod traits;
pub mod upstream;

#[cfg(test)]
pub(crate) mod test_support;

pub use balancer::{Balancer, HealthStats};
pub use pool::UpstreamPool;
pub use strategy::{SelectedUpstream, SelectionStrategy};
pub use traits::UpstreamResolver;
pub use upstream::{Upstream, UpstreamKey, UpstreamStatus, DEFAULT_PROBE_INTERVAL};
