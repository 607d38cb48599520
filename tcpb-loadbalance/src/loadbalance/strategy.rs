use super::pool::UpstreamPool;
use super::upstream::{Upstream, UpstreamKey};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tcpb_core::LoadBalanceStrategy;
use tokio::net::TcpStream;
use tracing::debug;

/// 选中的上游及其已建立的连接
#[derive(Debug)]
pub struct SelectedUpstream {
    pub upstream: Arc<Upstream>,
    pub stream: TcpStream,
}

/// 上游选择策略
///
/// 每个变体自带私有状态（轮询游标、加权积分），由所属的均衡器独占。
/// 同一次选择中连接失败的上游不会被重试，策略按自身规则换下一个候选。
pub enum SelectionStrategy {
    /// 按 `(存活, 权重)` 降序依次尝试存活的上游
    Single,
    /// 每尝试一个候选游标前进一位，对当前池大小取模
    RoundRobin { cursor: AtomicUsize },
    /// 在存活的上游中随机选择
    Random,
    /// 平滑加权轮询
    WeightedFair { credits: Mutex<HashMap<UpstreamKey, i64>> },
}

impl SelectionStrategy {
    pub fn new(kind: LoadBalanceStrategy) -> Self {
        match kind {
            LoadBalanceStrategy::Single => SelectionStrategy::Single,
            LoadBalanceStrategy::Robin => SelectionStrategy::RoundRobin {
                cursor: AtomicUsize::new(0),
            },
            LoadBalanceStrategy::Random => SelectionStrategy::Random,
            LoadBalanceStrategy::Weighted => SelectionStrategy::WeightedFair {
                credits: Mutex::new(HashMap::new()),
            },
        }
    }

    pub fn kind(&self) -> LoadBalanceStrategy {
        match self {
            SelectionStrategy::Single => LoadBalanceStrategy::Single,
            SelectionStrategy::RoundRobin { .. } => LoadBalanceStrategy::Robin,
            SelectionStrategy::Random => LoadBalanceStrategy::Random,
            SelectionStrategy::WeightedFair { .. } => LoadBalanceStrategy::Weighted,
        }
    }

    /// 从池中选出一个上游并建立连接，所有候选都失败时返回 `None`
    pub async fn resolve(&self, pool: &UpstreamPool) -> Option<SelectedUpstream> {
        match self {
            SelectionStrategy::Single => self.resolve_single(pool).await,
            SelectionStrategy::RoundRobin { cursor } => self.resolve_round_robin(pool, cursor).await,
            SelectionStrategy::Random => self.resolve_random(pool).await,
            SelectionStrategy::WeightedFair { credits } => {
                self.resolve_weighted_fair(pool, credits).await
            }
        }
    }

    /// 上游移出池后丢弃其私有状态
    pub fn forget(&self, key: &UpstreamKey) {
        if let SelectionStrategy::WeightedFair { credits } = self {
            credits.lock().remove(key);
        }
    }

    pub fn reset(&self) {
        match self {
            SelectionStrategy::RoundRobin { cursor } => cursor.store(0, Ordering::Relaxed),
            SelectionStrategy::WeightedFair { credits } => credits.lock().clear(),
            SelectionStrategy::Single | SelectionStrategy::Random => {}
        }
    }

    /// 当前的加权积分（用于监控和测试）
    pub fn credits(&self) -> HashMap<UpstreamKey, i64> {
        match self {
            SelectionStrategy::WeightedFair { credits } => credits.lock().clone(),
            _ => HashMap::new(),
        }
    }

    async fn resolve_single(&self, pool: &UpstreamPool) -> Option<SelectedUpstream> {
        // 先取一次快照再排序，避免排序过程中状态变化
        let mut ranked: Vec<(bool, u32, Arc<Upstream>)> = pool
            .snapshot()
            .into_iter()
            .map(|u| (u.is_alive(), u.weight(), u))
            .collect();
        ranked.sort_by(|a, b| (b.0, b.1).cmp(&(a.0, a.1)));

        for (_, _, upstream) in ranked {
            if !upstream.is_alive() {
                continue;
            }

            if let Some(selected) = try_upstream(&upstream).await {
                return Some(selected);
            }
        }

        None
    }

    async fn resolve_round_robin(
        &self,
        pool: &UpstreamPool,
        cursor: &AtomicUsize,
    ) -> Option<SelectedUpstream> {
        let mut attempts = 0;

        while attempts < pool.len() {
            attempts += 1;

            let len = pool.len();
            if len == 0 {
                break;
            }

            let index = cursor.fetch_add(1, Ordering::Relaxed) % len;
            let Some(upstream) = pool.get(index) else {
                continue;
            };

            if !upstream.is_alive() {
                continue;
            }

            if let Some(selected) = try_upstream(&upstream).await {
                return Some(selected);
            }
        }

        None
    }

    async fn resolve_random(&self, pool: &UpstreamPool) -> Option<SelectedUpstream> {
        let mut candidates: Vec<Arc<Upstream>> =
            pool.snapshot().into_iter().filter(|u| u.is_alive()).collect();

        while !candidates.is_empty() {
            let index = rand::rng().random_range(0..candidates.len());

            if let Some(selected) = try_upstream(&candidates[index]).await {
                return Some(selected);
            }

            candidates.swap_remove(index);
        }

        None
    }

    async fn resolve_weighted_fair(
        &self,
        pool: &UpstreamPool,
        credits: &Mutex<HashMap<UpstreamKey, i64>>,
    ) -> Option<SelectedUpstream> {
        let mut candidates: Vec<Arc<Upstream>> =
            pool.snapshot().into_iter().filter(|u| u.is_alive()).collect();

        while !candidates.is_empty() {
            let index = pick_weighted(&candidates, &mut credits.lock());

            if let Some(selected) = try_upstream(&candidates[index]).await {
                return Some(selected);
            }

            // 失败的上游退出本轮候选，但积分变化保留；保持顺序以便平局按出现顺序决定
            candidates.remove(index);
        }

        None
    }
}

/// 平滑加权轮询的一步：每个候选积分加上自身权重，
/// 积分最高者胜出（平局取先出现者），胜者扣除全部候选的权重之和。
fn pick_weighted(candidates: &[Arc<Upstream>], credits: &mut HashMap<UpstreamKey, i64>) -> usize {
    let weights: Vec<i64> = candidates.iter().map(|u| i64::from(u.weight())).collect();
    let total: i64 = weights.iter().sum();

    let mut selected = 0;
    let mut max = i64::MIN;
    for (index, (upstream, weight)) in candidates.iter().zip(&weights).enumerate() {
        let credit = credits.entry(upstream.key().clone()).or_insert(0);
        *credit += weight;
        if *credit > max {
            max = *credit;
            selected = index;
        }
    }

    if let Some(credit) = credits.get_mut(candidates[selected].key()) {
        *credit -= total;
    }

    debug!(
        "Weighted selection picked {} (credit {} -> {})",
        candidates[selected].key(),
        max,
        max - total
    );
    selected
}

async fn try_upstream(upstream: &Arc<Upstream>) -> Option<SelectedUpstream> {
    debug!("Trying upstream {} ...", upstream.key());
    let stream = upstream.connect().await?;
    Some(SelectedUpstream {
        upstream: Arc::clone(upstream),
        stream,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_candidates(weights: &[u32]) -> Vec<Arc<Upstream>> {
        weights
            .iter()
            .enumerate()
            .map(|(i, w)| {
                Upstream::new(
                    "127.0.0.1",
                    5000 + i as u16,
                    *w,
                    super::super::upstream::DEFAULT_PROBE_INTERVAL,
                )
            })
            .collect()
    }

    fn run_rounds(weights: &[u32], rounds: usize) -> Vec<usize> {
        let candidates = create_candidates(weights);
        let mut credits = HashMap::new();
        (0..rounds)
            .map(|_| pick_weighted(&candidates, &mut credits))
            .collect()
    }

    #[test]
    fn test_weighted_pick_is_smooth() {
        // A(100), B(300)
        let picks = run_rounds(&[100, 300], 4);
        assert_eq!(picks, vec![1, 0, 1, 1]);
    }

    #[test]
    fn test_weighted_pick_distribution() {
        let picks = run_rounds(&[500, 200, 100], 800);

        let mut counts = [0usize; 3];
        for pick in &picks {
            counts[*pick] += 1;
        }

        assert_eq!(counts, [500, 200, 100]);
    }

    #[test]
    fn test_weighted_pick_never_bursts_equal_weights() {
        let picks = run_rounds(&[100, 100, 100], 6);
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_weighted_credits_sum_to_zero() {
        let candidates = create_candidates(&[100, 300, 50]);
        let mut credits = HashMap::new();

        for _ in 0..17 {
            pick_weighted(&candidates, &mut credits);
            assert_eq!(credits.values().sum::<i64>(), 0);
        }
    }

    #[test]
    fn test_strategy_kind_roundtrip() {
        for kind in LoadBalanceStrategy::ALL {
            assert_eq!(SelectionStrategy::new(kind).kind(), kind);
        }
    }

    #[test]
    fn test_forget_drops_credit() {
        let strategy = SelectionStrategy::new(LoadBalanceStrategy::Weighted);
        let candidates = create_candidates(&[100, 300]);

        if let SelectionStrategy::WeightedFair { credits } = &strategy {
            pick_weighted(&candidates, &mut credits.lock());
        }
        assert_eq!(strategy.credits().len(), 2);

        strategy.forget(candidates[0].key());
        assert_eq!(strategy.credits().len(), 1);

        strategy.reset();
        assert!(strategy.credits().is_empty());
    }
}
