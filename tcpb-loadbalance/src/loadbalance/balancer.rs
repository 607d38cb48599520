use super::pool::UpstreamPool;
use super::strategy::{SelectedUpstream, SelectionStrategy};
use super::upstream::{Upstream, UpstreamKey, UpstreamStatus};
use std::sync::Arc;
use std::time::Duration;
use tcpb_core::{Config, LoadBalanceStrategy, UpstreamSpec};
use tracing::{debug, info, warn};

/// 负载均衡器
/// 持有一个上游池和一个选择策略，为每个客户端连接解析出一个已连接的上游
pub struct Balancer {
    pool: UpstreamPool,
    strategy: SelectionStrategy,
}

impl Balancer {
    /// 创建新的负载均衡器
    pub fn new(kind: LoadBalanceStrategy, probe_interval: Duration) -> Self {
        Self {
            pool: UpstreamPool::new(probe_interval),
            strategy: SelectionStrategy::new(kind),
        }
    }

    /// 按配置创建并加入所有上游
    ///
    /// 上游会立即开始探测，因此需要在tokio运行时中调用。
    pub fn from_config(config: &Config) -> Self {
        let balancer = Self::new(config.strategy, config.settings.probe_interval());
        for spec in &config.upstreams {
            balancer.put_upstream_spec(spec);
        }

        info!(
            "Initialized {} balancer with {} upstreams",
            config.strategy,
            balancer.pool.len()
        );
        balancer
    }

    pub fn strategy(&self) -> LoadBalanceStrategy {
        self.strategy.kind()
    }

    pub fn pool(&self) -> &UpstreamPool {
        &self.pool
    }

    pub fn put_upstream(&self, host: &str, port: u16, weight: u32) -> Arc<Upstream> {
        self.pool.put_upstream(host, port, weight)
    }

    pub fn put_upstream_spec(&self, spec: &UpstreamSpec) -> Arc<Upstream> {
        self.pool.put_upstream(&spec.host, spec.port, spec.weight)
    }

    /// 移除上游，同时丢弃策略中属于它的状态
    pub fn remove_upstream(&self, host: &str, port: u16) -> Option<Arc<Upstream>> {
        let removed = self.pool.remove_upstream(host, port)?;
        self.strategy.forget(removed.key());
        Some(removed)
    }

    /// 清空所有上游，停止探测
    pub fn clear_upstreams(&self) {
        self.pool.clear_upstreams();
        self.strategy.reset();
    }

    /// 为一个新的客户端连接解析上游
    pub async fn resolve(&self) -> Option<SelectedUpstream> {
        let selected = self.strategy.resolve(&self.pool).await;

        match &selected {
            Some(s) => debug!("Resolved upstream {} ({})", s.upstream.key(), self.strategy()),
            None => warn!(
                "No upstream available ({} configured, {} alive)",
                self.pool.len(),
                self.pool.alive_count()
            ),
        }

        selected
    }

    /// 获取健康状态统计
    pub fn health_stats(&self) -> HealthStats {
        let total_upstreams = self.pool.len();
        let alive_upstreams = self.pool.alive_count();

        HealthStats {
            alive_upstreams,
            total_upstreams,
            health_ratio: if total_upstreams > 0 {
                alive_upstreams as f64 / total_upstreams as f64
            } else {
                0.0
            },
        }
    }

    pub fn upstream_statuses(&self) -> Vec<UpstreamStatus> {
        self.pool.statuses()
    }

    /// 加权积分（用于监控），非加权策略返回空
    pub fn weighted_credits(&self) -> Vec<(UpstreamKey, i64)> {
        let mut credits: Vec<(UpstreamKey, i64)> = self.strategy.credits().into_iter().collect();
        credits.sort_by(|a, b| a.0.to_string().cmp(&b.0.to_string()));
        credits
    }
}

/// 健康状态统计
#[derive(Debug, Clone)]
pub struct HealthStats {
    pub alive_upstreams: usize,
    pub total_upstreams: usize,
    pub health_ratio: f64,
}

impl HealthStats {
    /// 至少有一个上游存活
    pub fn is_healthy(&self) -> bool {
        self.health_ratio > 0.0
    }

    /// 所有上游都存活
    pub fn is_fully_healthy(&self) -> bool {
        self.health_ratio >= 1.0
    }
}
