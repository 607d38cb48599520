use bytes::{BufMut, BytesMut};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// 连接编号的上限，超过后从1重新开始
pub const MAX_CONNECTION_ID: u64 = (1 << 53) - 1;

/// 连接编号序列，只用于日志
#[derive(Debug)]
pub struct ConnectionSequence {
    next: AtomicU64,
}

impl ConnectionSequence {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(id: u64) -> Self {
        Self {
            next: AtomicU64::new(id.clamp(1, MAX_CONNECTION_ID)),
        }
    }

    pub fn next_id(&self) -> u64 {
        let result = self.next.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| {
            Some(if id >= MAX_CONNECTION_ID { 1 } else { id + 1 })
        });

        match result {
            Ok(id) | Err(id) => id,
        }
    }
}

impl Default for ConnectionSequence {
    fn default() -> Self {
        Self::new()
    }
}

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// 等待上游，客户端数据进入缓冲区
    Pending,
    /// 双向转发中
    Bridged,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            ConnectionState::Pending => "pending",
            ConnectionState::Bridged => "bridged",
            ConnectionState::Closed => "closed",
        };
        f.write_str(state)
    }
}

/// 转发结束的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ClientClosed,
    UpstreamClosed,
    ClientError,
    UpstreamError,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            CloseReason::ClientClosed => "client closed",
            CloseReason::UpstreamClosed => "upstream closed",
            CloseReason::ClientError => "client error",
            CloseReason::UpstreamError => "upstream error",
        };
        f.write_str(reason)
    }
}

/// 一次转发的统计
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeStats {
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
    pub closed_by: CloseReason,
}

/// 一个客户端连接
///
/// 上游确定之前（`Pending`），客户端发来的数据按到达顺序追加到缓冲区；
/// 缓冲区达到上限后暂停读取，由TCP流量控制让客户端等待。
/// `bridge` 先把缓冲区原样写给上游，再开始双向转发。
/// 任意一端关闭或出错后，两端都会被关闭。
#[derive(Debug)]
pub struct Connection {
    id: u64,
    peer: SocketAddr,
    client: TcpStream,
    pending: BytesMut,
    pending_limit: usize,
    read_size: usize,
    client_eof: bool,
    state: ConnectionState,
}

impl Connection {
    pub fn new(
        id: u64,
        client: TcpStream,
        peer: SocketAddr,
        read_size: usize,
        pending_limit: usize,
    ) -> Self {
        let read_size = read_size.max(1);
        let pending_limit = pending_limit.max(1);
        Self {
            id,
            peer,
            client,
            pending: BytesMut::with_capacity(read_size.min(pending_limit)),
            pending_limit,
            read_size,
            client_eof: false,
            state: ConnectionState::Pending,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// 尚未转发给上游的客户端数据
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    /// 缓冲区是否已达上限
    pub fn is_pending_full(&self) -> bool {
        self.pending.len() >= self.pending_limit
    }

    /// 等待上游期间是否还应继续读取客户端
    pub fn wants_client_data(&self) -> bool {
        !self.client_eof && !self.is_pending_full()
    }

    /// 客户端是否已经在等待上游期间关闭了写方向
    pub fn is_client_eof(&self) -> bool {
        self.client_eof
    }

    /// 读取一批客户端数据追加到缓冲区，返回读取的字节数
    ///
    /// 可以在 `select!` 中安全取消，已读取的数据不会丢失。
    /// 客户端关闭或缓冲区已满时返回 `Ok(0)`，单次读取不会越过上限。
    pub async fn buffer_client(&mut self) -> io::Result<usize> {
        if !self.wants_client_data() {
            return Ok(0);
        }

        let room = (self.pending_limit - self.pending.len()).min(self.read_size);
        self.pending.reserve(room);
        let n = self
            .client
            .read_buf(&mut (&mut self.pending).limit(room))
            .await?;
        if n == 0 {
            debug!(
                "Connection #{} closed by client while pending ({} bytes buffered)",
                self.id,
                self.pending.len()
            );
            self.client_eof = true;
        }

        Ok(n)
    }

    /// 连接上游并开始双向转发，直到任意一端关闭
    ///
    /// 消耗连接本身，因此每个连接只能转发一次。
    pub async fn bridge(mut self, mut upstream: TcpStream) -> BridgeStats {
        self.state = ConnectionState::Bridged;

        let mut stats = BridgeStats {
            client_to_upstream: 0,
            upstream_to_client: 0,
            closed_by: CloseReason::ClientClosed,
        };

        if !self.pending.is_empty() {
            let pending = self.pending.split();
            if let Err(e) = upstream.write_all(&pending).await {
                debug!("Connection #{} failed to flush pending data: {}", self.id, e);
                stats.closed_by = CloseReason::UpstreamError;
                self.teardown(upstream).await;
                return stats;
            }
            stats.client_to_upstream += pending.len() as u64;
        }

        if !self.client_eof {
            let reason = self.relay(&mut upstream, &mut stats).await;
            stats.closed_by = reason;
        }

        self.teardown(upstream).await;
        stats
    }

    /// 没有可用上游时直接关闭客户端
    pub async fn close(mut self) {
        self.state = ConnectionState::Closed;
        let _ = self.client.shutdown().await;
    }

    async fn relay(&mut self, upstream: &mut TcpStream, stats: &mut BridgeStats) -> CloseReason {
        let mut client_buf = vec![0u8; self.read_size];
        let mut upstream_buf = vec![0u8; self.read_size];

        loop {
            tokio::select! {
                result = self.client.read(&mut client_buf) => match result {
                    Ok(0) => return CloseReason::ClientClosed,
                    Ok(n) => {
                        if let Err(e) = upstream.write_all(&client_buf[..n]).await {
                            debug!("Connection #{} upstream write failed: {}", self.id, e);
                            return CloseReason::UpstreamError;
                        }
                        stats.client_to_upstream += n as u64;
                    }
                    Err(e) => {
                        debug!("Connection #{} client read failed: {}", self.id, e);
                        return CloseReason::ClientError;
                    }
                },
                result = upstream.read(&mut upstream_buf) => match result {
                    Ok(0) => return CloseReason::UpstreamClosed,
                    Ok(n) => {
                        if let Err(e) = self.client.write_all(&upstream_buf[..n]).await {
                            debug!("Connection #{} client write failed: {}", self.id, e);
                            return CloseReason::ClientError;
                        }
                        stats.upstream_to_client += n as u64;
                    }
                    Err(e) => {
                        debug!("Connection #{} upstream read failed: {}", self.id, e);
                        return CloseReason::UpstreamError;
                    }
                },
            }
        }
    }

    async fn teardown(&mut self, mut upstream: TcpStream) {
        self.state = ConnectionState::Closed;
        let _ = upstream.shutdown().await;
        let _ = self.client.shutdown().await;
    }
}
