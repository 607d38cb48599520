use super::Upstream;
use std::time::Duration;
use tokio::net::TcpListener;

/// 在本地随机端口启动一个只监听不处理的后端
pub(crate) async fn spawn_backend() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

/// 返回一个当前无人监听的端口
pub(crate) async fn dead_port() -> u16 {
    let (listener, port) = spawn_backend().await;
    drop(listener);
    port
}

pub(crate) async fn wait_until_alive(upstream: &Upstream, alive: bool) {
    for _ in 0..200 {
        if upstream.is_alive() == alive && upstream.last_check().is_some() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("upstream {} never became alive={}", upstream.key(), alive);
}

pub(crate) async fn wait_for_check(upstream: &Upstream) {
    for _ in 0..200 {
        if upstream.last_check().is_some() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("upstream {} was never probed", upstream.key());
}
