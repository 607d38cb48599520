use super::connection::{Connection, ConnectionSequence};
use crate::error::RelayError;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tcpb_core::{BindAddress, GlobalSettings};
use tcpb_loadbalance::UpstreamResolver;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// accept失败后等待多久再重试
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// 客户端监听器
///
/// 每个接受的连接在独立任务中解析上游，等待期间客户端数据进入缓冲区，
/// 解析成功后开始转发，没有可用上游时直接关闭客户端。
pub struct Listener {
    listener: TcpListener,
    resolver: Arc<dyn UpstreamResolver>,
    sequence: ConnectionSequence,
    read_size: usize,
    pending_limit: usize,
}

impl Listener {
    /// 绑定监听地址，读缓冲大小和等待上游期间的缓冲上限取自 `settings`
    pub async fn bind(
        addr: &BindAddress,
        resolver: Arc<dyn UpstreamResolver>,
        settings: &GlobalSettings,
    ) -> Result<Self, RelayError> {
        let listener = TcpListener::bind((addr.host.as_str(), addr.port))
            .await
            .map_err(|source| RelayError::Bind {
                addr: addr.to_string(),
                source,
            })?;

        Ok(Self {
            listener,
            resolver,
            sequence: ConnectionSequence::new(),
            read_size: settings.relay_buffer_size,
            pending_limit: settings.pending_buffer_limit,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RelayError> {
        self.listener.local_addr().map_err(RelayError::LocalAddr)
    }

    /// 接受连接直到 `shutdown` 被取消
    ///
    /// 返回时监听套接字已关闭，已建立的连接继续转发直到自然结束。
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), RelayError> {
        let local_addr = self.local_addr()?;
        info!("Listening on {}", local_addr);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Listener on {} shutting down", local_addr);
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((client, peer)) => {
                        let id = self.sequence.next_id();
                        info!("New connection #{} from {}", id, peer);

                        let connection = Connection::new(
                            id,
                            client,
                            peer,
                            self.read_size,
                            self.pending_limit,
                        );
                        let resolver = Arc::clone(&self.resolver);
                        tokio::spawn(handle_connection(connection, resolver));
                    }
                    Err(e) => {
                        // 单个连接的accept失败（如文件描述符耗尽）不影响监听
                        error!("Failed to accept connection on {}: {}", local_addr, e);
                        back_off(&shutdown).await;
                    }
                },
            }
        }

        Ok(())
    }
}

/// 持续的accept错误不会占满CPU，取消时立即返回
async fn back_off(shutdown: &CancellationToken) {
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => {}
    }
}

async fn handle_connection(mut connection: Connection, resolver: Arc<dyn UpstreamResolver>) {
    let id = connection.id();
    let mut resolve = resolver.resolve();

    let selected = loop {
        tokio::select! {
            selected = &mut resolve => break selected,
            read = connection.buffer_client(), if connection.wants_client_data() => {
                if let Err(e) = read {
                    debug!("Connection #{} failed while pending: {}", id, e);
                    connection.close().await;
                    return;
                }
            }
        }
    };

    let Some(selected) = selected else {
        warn!("No upstream for connection #{}, closing", id);
        connection.close().await;
        return;
    };

    info!(
        "Forwarding connection #{} to {}",
        id,
        selected.upstream.key()
    );

    let peer = connection.peer();
    let stats = connection.bridge(selected.stream).await;
    info!(
        "Connection #{} from {} closed ({}, {} bytes up, {} bytes down)",
        id, peer, stats.closed_by, stats.client_to_upstream, stats.upstream_to_client
    );
}
