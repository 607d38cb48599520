use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// 默认被动探测间隔
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// 上游在池中的唯一标识
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UpstreamKey {
    pub host: String,
    pub port: u16,
}

impl UpstreamKey {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn matches(&self, host: &str, port: u16) -> bool {
        self.port == port && self.host == host
    }
}

impl fmt::Display for UpstreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// 单个上游后端
///
/// 每个上游自己维护存活状态和探测任务：
/// - 每次真实连接都会刷新存活状态，并把下一次被动探测推迟一个探测间隔
/// - 被动探测只在空闲时触发，只建立连接后立即关闭
/// - `end()` 之后不再探测，也不再建立新连接
pub struct Upstream {
    key: UpstreamKey,
    weight: AtomicU32,
    available: AtomicBool,
    running: AtomicBool,
    probe_interval: Duration,
    last_check: Mutex<Option<Instant>>,
    probe: Mutex<Option<JoinHandle<()>>>,
}

impl Upstream {
    pub fn new(host: impl Into<String>, port: u16, weight: u32, probe_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            key: UpstreamKey::new(host, port),
            weight: AtomicU32::new(weight),
            available: AtomicBool::new(false),
            running: AtomicBool::new(false),
            probe_interval,
            last_check: Mutex::new(None),
            probe: Mutex::new(None),
        })
    }

    pub fn key(&self) -> &UpstreamKey {
        &self.key
    }

    pub fn host(&self) -> &str {
        &self.key.host
    }

    pub fn port(&self) -> u16 {
        self.key.port
    }

    pub fn weight(&self) -> u32 {
        self.weight.load(Ordering::Relaxed)
    }

    pub fn set_weight(&self, weight: u32) {
        self.weight.store(weight, Ordering::Relaxed);
    }

    /// 最近一次探测或连接的结果，不做任何I/O
    pub fn is_alive(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// 最近一次探测或连接完成的时间
    pub fn last_check(&self) -> Option<Instant> {
        *self.last_check.lock()
    }

    /// 开始参与健康探测，并立即执行第一次探测
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }

        debug!("Starting health probe for upstream {}", self.key);
        self.schedule_probe(Duration::ZERO);
    }

    /// 停止探测，取消尚未执行的探测任务
    pub fn end(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }

        debug!("Stopping health probe for upstream {}", self.key);
        self.cancel_probe();
    }

    /// 建立一个新的上游连接
    ///
    /// 未运行时直接返回 `None`。连接结果会作为新的存活状态，
    /// 无论成功与否都会重新安排下一次被动探测。
    /// 调用方放弃等待时，连接尝试仍会在后台完成并记录结果。
    pub async fn connect(self: &Arc<Self>) -> Option<TcpStream> {
        if !self.is_running() {
            return None;
        }

        self.cancel_probe();

        let upstream = Arc::clone(self);
        let attempt = tokio::spawn(async move {
            let result = upstream.open_socket().await;
            if let Err(e) = &result {
                warn!("Failed to connect to upstream {}: {}", upstream.key, e);
            }

            upstream.record(result.is_ok());
            upstream.schedule_probe(upstream.probe_interval);
            result.ok()
        });

        match attempt.await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Connect task for upstream {} failed: {}", self.key, e);
                None
            }
        }
    }

    /// 当前状态快照
    pub fn status(&self) -> UpstreamStatus {
        UpstreamStatus {
            host: self.key.host.clone(),
            port: self.key.port,
            weight: self.weight(),
            alive: self.is_alive(),
            running: self.is_running(),
        }
    }

    async fn open_socket(&self) -> std::io::Result<TcpStream> {
        TcpStream::connect((self.key.host.as_str(), self.key.port)).await
    }

    /// 被动探测：连接成功后立即关闭
    async fn check(&self) {
        if !self.is_running() {
            return;
        }

        info!("Checking upstream {} ...", self.key);
        let alive = match self.open_socket().await {
            Ok(_stream) => true,
            Err(e) => {
                debug!("Health probe for upstream {} failed: {}", self.key, e);
                false
            }
        };

        self.record(alive);
    }

    fn record(&self, alive: bool) {
        *self.last_check.lock() = Some(Instant::now());

        let was_alive = self.available.swap(alive, Ordering::AcqRel);
        if alive && !was_alive {
            info!("Upstream {} is up", self.key);
        } else if !alive {
            if was_alive {
                warn!("Upstream {} is down", self.key);
            } else {
                debug!("Upstream {} is still down", self.key);
            }
        }
    }

    /// 安排一次被动探测，之后每隔一个探测间隔重复
    ///
    /// 已有的探测任务会被替换。任务只持有弱引用，上游被释放后自然退出。
    fn schedule_probe(self: &Arc<Self>, delay: Duration) {
        let mut probe = self.probe.lock();
        if let Some(handle) = probe.take() {
            handle.abort();
        }

        // 在锁内检查，保证与 end() 并发时不会留下探测任务
        if !self.is_running() {
            return;
        }

        let upstream: Weak<Self> = Arc::downgrade(self);
        let interval = self.probe_interval;
        *probe = Some(tokio::spawn(async move {
            let mut delay = delay;
            loop {
                tokio::time::sleep(delay).await;

                let Some(upstream) = upstream.upgrade() else {
                    break;
                };
                if !upstream.is_running() {
                    break;
                }

                upstream.check().await;
                delay = interval;
            }
        }));
    }

    fn cancel_probe(&self) {
        if let Some(handle) = self.probe.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for Upstream {
    fn drop(&mut self) {
        if let Some(handle) = self.probe.get_mut().take() {
            handle.abort();
        }
    }
}

impl fmt::Debug for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Upstream")
            .field("key", &self.key)
            .field("weight", &self.weight())
            .field("alive", &self.is_alive())
            .field("running", &self.is_running())
            .finish()
    }
}

/// 上游状态快照（用于监控）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamStatus {
    pub host: String,
    pub port: u16,
    pub weight: u32,
    pub alive: bool,
    pub running: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loadbalance::test_support::{dead_port, spawn_backend, wait_for_check, wait_until_alive};
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_start_probes_immediately() {
        let (listener, port) = spawn_backend().await;
        let upstream = Upstream::new("127.0.0.1", port, 100, DEFAULT_PROBE_INTERVAL);

        assert!(!upstream.is_alive());
        assert!(upstream.last_check().is_none());

        upstream.start();
        wait_until_alive(&upstream, true).await;
        assert!(upstream.is_running());

        // 探测连接在建立后立即关闭
        let (mut probe, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 1];
        let n = tokio::io::AsyncReadExt::read(&mut probe, &mut buf).await.unwrap();
        assert_eq!(n, 0);

        upstream.end();
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let (listener, port) = spawn_backend().await;
        let upstream = Upstream::new("127.0.0.1", port, 100, DEFAULT_PROBE_INTERVAL);

        upstream.start();
        upstream.start();
        wait_until_alive(&upstream, true).await;

        assert!(listener.accept().await.is_ok());
        // 第二次 start 不会再触发探测
        assert!(timeout(Duration::from_millis(200), listener.accept()).await.is_err());

        upstream.end();
    }

    #[tokio::test]
    async fn test_dead_upstream_stays_down() {
        let port = dead_port().await;
        let upstream = Upstream::new("127.0.0.1", port, 100, DEFAULT_PROBE_INTERVAL);

        upstream.start();
        wait_for_check(&upstream).await;

        assert!(!upstream.is_alive());
        assert!(upstream.connect().await.is_none());
        assert!(!upstream.is_alive());

        upstream.end();
    }

    #[tokio::test]
    async fn test_connect_when_not_running() {
        let (listener, port) = spawn_backend().await;
        let upstream = Upstream::new("127.0.0.1", port, 100, DEFAULT_PROBE_INTERVAL);

        assert!(upstream.connect().await.is_none());
        assert!(timeout(Duration::from_millis(200), listener.accept()).await.is_err());
        assert!(upstream.last_check().is_none());
    }

    #[tokio::test]
    async fn test_connect_records_liveness() {
        let (listener, port) = spawn_backend().await;
        let upstream = Upstream::new("127.0.0.1", port, 100, DEFAULT_PROBE_INTERVAL);

        upstream.start();
        wait_until_alive(&upstream, true).await;

        let stream = upstream.connect().await;
        assert!(stream.is_some());
        assert!(upstream.is_alive());

        // 上游下线后，真实连接失败会立即标记为不可用
        drop(listener);
        assert!(upstream.connect().await.is_none());
        assert!(!upstream.is_alive());

        upstream.end();
    }

    #[tokio::test]
    async fn test_passive_probe_reschedules() {
        let (listener, port) = spawn_backend().await;
        let upstream = Upstream::new("127.0.0.1", port, 100, Duration::from_millis(50));

        upstream.start();

        for _ in 0..3 {
            let accepted = timeout(Duration::from_secs(2), listener.accept()).await;
            assert!(accepted.is_ok());
        }

        upstream.end();
    }

    #[tokio::test]
    async fn test_end_stops_probing() {
        let (listener, port) = spawn_backend().await;
        let upstream = Upstream::new("127.0.0.1", port, 100, Duration::from_millis(50));

        upstream.start();
        wait_until_alive(&upstream, true).await;
        upstream.end();
        upstream.end();
        assert!(!upstream.is_running());

        // 清空已经排队的探测连接
        while timeout(Duration::from_millis(100), listener.accept()).await.is_ok() {}

        assert!(timeout(Duration::from_millis(300), listener.accept()).await.is_err());
        assert!(upstream.connect().await.is_none());
    }

    #[test]
    fn test_weight_update() {
        let upstream = Upstream::new("127.0.0.1", 9, 100, DEFAULT_PROBE_INTERVAL);
        upstream.set_weight(300);

        let status = upstream.status();
        assert_eq!(status.weight, 300);
        assert_eq!(status.host, "127.0.0.1");
        assert!(!status.alive);
        assert!(!status.running);
        assert_eq!(upstream.key().to_string(), "127.0.0.1:9");
    }
}
