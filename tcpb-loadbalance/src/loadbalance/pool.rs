use super::upstream::{Upstream, UpstreamStatus, DEFAULT_PROBE_INTERVAL};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// 上游池
///
/// 以 `(host, port)` 为键保存上游，遍历顺序为加入顺序。
/// 选择策略只读取池中内容；读取的是实时视图，
/// 一次选择过程中可能观察到并发的增删。
pub struct UpstreamPool {
    upstreams: RwLock<Vec<Arc<Upstream>>>,
    probe_interval: Duration,
}

impl UpstreamPool {
    pub fn new(probe_interval: Duration) -> Self {
        Self {
            upstreams: RwLock::new(Vec::new()),
            probe_interval,
        }
    }

    pub fn probe_interval(&self) -> Duration {
        self.probe_interval
    }

    /// 添加上游；已存在时只更新权重，探测不受影响
    pub fn put_upstream(&self, host: &str, port: u16, weight: u32) -> Arc<Upstream> {
        let mut upstreams = self.upstreams.write();

        if let Some(existing) = upstreams.iter().find(|u| u.key().matches(host, port)) {
            debug!(
                "Updating upstream {} weight {} -> {}",
                existing.key(),
                existing.weight(),
                weight
            );
            existing.set_weight(weight);
            existing.start();
            return Arc::clone(existing);
        }

        let upstream = Upstream::new(host, port, weight, self.probe_interval);
        upstreams.push(Arc::clone(&upstream));
        upstream.start();

        info!("Added upstream {} with weight {}", upstream.key(), weight);
        upstream
    }

    /// 移除上游并停止其探测；不存在时什么也不做
    pub fn remove_upstream(&self, host: &str, port: u16) -> Option<Arc<Upstream>> {
        let mut upstreams = self.upstreams.write();
        let index = upstreams.iter().position(|u| u.key().matches(host, port))?;

        let upstream = upstreams.remove(index);
        upstream.end();

        info!("Removed upstream {}", upstream.key());
        Some(upstream)
    }

    /// 停止所有上游的探测并清空池
    pub fn clear_upstreams(&self) {
        let removed: Vec<Arc<Upstream>> = self.upstreams.write().drain(..).collect();
        for upstream in &removed {
            upstream.end();
        }

        if !removed.is_empty() {
            info!("Cleared {} upstreams", removed.len());
        }
    }

    /// 当前所有上游的快照
    pub fn snapshot(&self) -> Vec<Arc<Upstream>> {
        self.upstreams.read().clone()
    }

    /// 按当前顺序取第 `index` 个上游
    pub fn get(&self, index: usize) -> Option<Arc<Upstream>> {
        self.upstreams.read().get(index).cloned()
    }

    pub fn find(&self, host: &str, port: u16) -> Option<Arc<Upstream>> {
        self.upstreams
            .read()
            .iter()
            .find(|u| u.key().matches(host, port))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.upstreams.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.upstreams.read().is_empty()
    }

    pub fn alive_count(&self) -> usize {
        self.upstreams.read().iter().filter(|u| u.is_alive()).count()
    }

    pub fn statuses(&self) -> Vec<UpstreamStatus> {
        self.upstreams.read().iter().map(|u| u.status()).collect()
    }
}

impl Default for UpstreamPool {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_INTERVAL)
    }
}

impl Drop for UpstreamPool {
    fn drop(&mut self) {
        for upstream in self.upstreams.get_mut().iter() {
            upstream.end();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loadbalance::test_support::{spawn_backend, wait_until_alive};

    #[tokio::test]
    async fn test_put_upstream_twice_updates_weight() {
        let pool = UpstreamPool::default();
        let first = pool.put_upstream("127.0.0.1", 4000, 100);
        let second = pool.put_upstream("127.0.0.1", 4000, 250);

        assert_eq!(pool.len(), 1);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.weight(), 250);
        assert!(first.is_running());

        pool.clear_upstreams();
    }

    #[tokio::test]
    async fn test_put_upstream_keeps_probe_state() {
        let (_listener, port) = spawn_backend().await;
        let pool = UpstreamPool::default();

        let upstream = pool.put_upstream("127.0.0.1", port, 100);
        wait_until_alive(&upstream, true).await;

        pool.put_upstream("127.0.0.1", port, 300);
        assert!(upstream.is_alive());
        assert!(upstream.is_running());

        pool.clear_upstreams();
    }

    #[tokio::test]
    async fn test_remove_absent_upstream_is_noop() {
        let pool = UpstreamPool::default();
        pool.put_upstream("127.0.0.1", 4000, 100);

        assert!(pool.remove_upstream("127.0.0.1", 4001).is_none());
        assert!(pool.remove_upstream("127.0.0.2", 4000).is_none());
        assert_eq!(pool.len(), 1);

        pool.clear_upstreams();
    }

    #[tokio::test]
    async fn test_remove_upstream_ends_probing() {
        let pool = UpstreamPool::default();
        pool.put_upstream("127.0.0.1", 4000, 100);
        pool.put_upstream("127.0.0.1", 4001, 100);

        let removed = pool.remove_upstream("127.0.0.1", 4000).unwrap();
        assert!(!removed.is_running());
        assert_eq!(pool.len(), 1);
        assert!(pool.find("127.0.0.1", 4000).is_none());
        assert!(pool.find("127.0.0.1", 4001).is_some());

        pool.clear_upstreams();
    }

    #[tokio::test]
    async fn test_clear_upstreams() {
        let pool = UpstreamPool::default();
        let a = pool.put_upstream("127.0.0.1", 4000, 100);
        let b = pool.put_upstream("127.0.0.1", 4001, 100);

        pool.clear_upstreams();

        assert!(pool.is_empty());
        assert!(!a.is_running());
        assert!(!b.is_running());
        assert!(pool.get(0).is_none());
    }

    #[tokio::test]
    async fn test_insertion_order() {
        let pool = UpstreamPool::default();
        pool.put_upstream("127.0.0.1", 4003, 100);
        pool.put_upstream("127.0.0.1", 4001, 100);
        pool.put_upstream("127.0.0.1", 4002, 100);
        pool.put_upstream("127.0.0.1", 4003, 5);

        let keys: Vec<String> = pool.snapshot().iter().map(|u| u.key().to_string()).collect();
        assert_eq!(keys, vec!["127.0.0.1:4003", "127.0.0.1:4001", "127.0.0.1:4002"]);

        let statuses = pool.statuses();
        assert_eq!(statuses[0].weight, 5);

        pool.clear_upstreams();
    }
}
