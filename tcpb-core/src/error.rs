use thiserror::Error;

/// 配置错误类型
///
/// 覆盖命令行与配置文件中所有可能出现的非法输入，
/// 任何一个错误都会阻止服务启动。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid bind address: {0}")]
    InvalidBindAddress(String),
    #[error("Invalid balancer: {0} (expected one of: single, robin, random, weighted)")]
    InvalidStrategy(String),
    #[error("Invalid upstream: {0}")]
    InvalidUpstream(String),
    #[error("Invalid weight for upstream {upstream}: {weight} (must be a positive integer)")]
    InvalidWeight { upstream: String, weight: String },
    #[error("Invalid port for upstream {0}: port cannot be 0")]
    InvalidPort(String),
    #[error("Upstream has empty host: {0}")]
    EmptyHost(String),
    #[error("Invalid setting {name}: {reason}")]
    InvalidSetting { name: &'static str, reason: String },
}
