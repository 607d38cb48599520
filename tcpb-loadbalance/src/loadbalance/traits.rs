use async_trait::async_trait;

use super::{Balancer, SelectedUpstream};

/// 上游解析接口
///
/// 监听器只依赖这个trait，便于替换实现和单元测试
#[async_trait]
pub trait UpstreamResolver: Send + Sync {
    /// 为一个新的客户端连接选择上游并建立连接
    async fn resolve(&self) -> Option<SelectedUpstream>;
}

#[async_trait]
impl UpstreamResolver for Balancer {
    async fn resolve(&self) -> Option<SelectedUpstream> {
        Balancer::resolve(self).await
    }
}
