//! tcp-balance load balancing library
//!
//! This library provides the upstream side of the balancer:
//! - Upstreams with passive health probing
//! - The upstream pool
//! - Selection strategies (single, robin, random, weighted)
//! - The balancer that resolves a connected upstream per client

pub mod loadbalance;

// Re-export commonly used types
pub use loadbalance::{
    Balancer, HealthStats, SelectedUpstream, SelectionStrategy, Upstream, UpstreamKey,
    UpstreamPool, UpstreamResolver, UpstreamStatus, DEFAULT_PROBE_INTERVAL,
};
