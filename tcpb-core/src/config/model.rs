use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// 上游默认权重
pub const DEFAULT_WEIGHT: u32 = 100;

/// 未指定IP时监听的地址
pub const DEFAULT_BIND_HOST: &str = "0.0.0.0";

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct Config {
    /// 监听地址，格式 `[ip:]port`
    #[serde(default)]
    pub bind: Option<BindAddress>,
    #[serde(default)]
    pub strategy: LoadBalanceStrategy,
    #[serde(default)]
    pub upstreams: Vec<UpstreamSpec>,
    #[serde(default)]
    pub settings: GlobalSettings,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct GlobalSettings {
    /// 空闲时被动探测的间隔
    #[serde(default = "default_probe_interval")]
    pub probe_interval_seconds: u64,
    /// 转发时单次读取的缓冲区大小
    #[serde(default = "default_relay_buffer_size")]
    pub relay_buffer_size: usize,
    /// 等待上游期间最多缓存的客户端数据，达到后暂停读取
    #[serde(default = "default_pending_buffer_limit")]
    pub pending_buffer_limit: usize,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            probe_interval_seconds: default_probe_interval(),
            relay_buffer_size: default_relay_buffer_size(),
            pending_buffer_limit: default_pending_buffer_limit(),
        }
    }
}

impl GlobalSettings {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_seconds)
    }
}

/// 负载均衡策略
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum LoadBalanceStrategy {
    /// 优先级：总是选择存活且权重最高的上游
    Single,
    /// 轮询
    #[default]
    Robin,
    /// 随机
    Random,
    /// 平滑加权轮询
    Weighted,
}

impl LoadBalanceStrategy {
    pub const ALL: [LoadBalanceStrategy; 4] = [
        LoadBalanceStrategy::Single,
        LoadBalanceStrategy::Robin,
        LoadBalanceStrategy::Random,
        LoadBalanceStrategy::Weighted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LoadBalanceStrategy::Single => "single",
            LoadBalanceStrategy::Robin => "robin",
            LoadBalanceStrategy::Random => "random",
            LoadBalanceStrategy::Weighted => "weighted",
        }
    }
}

impl fmt::Display for LoadBalanceStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoadBalanceStrategy {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == value)
            .ok_or_else(|| ConfigError::InvalidStrategy(value.to_string()))
    }
}

/// 监听地址
///
/// 文本格式为 `[ip:]port`，省略IP时监听 `0.0.0.0`。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BindAddress {
    pub host: String,
    pub port: u16,
}

impl BindAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl Default for BindAddress {
    fn default() -> Self {
        Self::new("127.0.0.1", 8080)
    }
}

impl FromStr for BindAddress {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (host, port) = match value.rsplit_once(':') {
            Some((host, port)) => (host, port),
            None => ("", value),
        };

        let port = parse_digits::<u16>(port)
            .ok_or_else(|| ConfigError::InvalidBindAddress(value.to_string()))?;

        // IPv6地址必须写在方括号内
        let bracketed = host.starts_with('[') && host.ends_with(']');
        let host = strip_brackets(host);
        if !bracketed && host.contains(':') {
            return Err(ConfigError::InvalidBindAddress(value.to_string()));
        }
        let host = if host.is_empty() { DEFAULT_BIND_HOST } else { host };

        Ok(Self::new(host, port))
    }
}

impl TryFrom<String> for BindAddress {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BindAddress> for String {
    fn from(value: BindAddress) -> Self {
        value.to_string()
    }
}

impl fmt::Display for BindAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// 上游配置
///
/// 命令行格式为 `host:port[%weight]`，例如 `h1.example.com:3721%200`；
/// 配置文件中既可以写成同样的字符串，也可以写成 `{ host, port, weight }` 表。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "UpstreamEntry")]
pub struct UpstreamSpec {
    pub host: String,
    pub port: u16,
    pub weight: u32,
}

impl UpstreamSpec {
    pub fn new(host: impl Into<String>, port: u16, weight: u32) -> Self {
        Self {
            host: host.into(),
            port,
            weight,
        }
    }

    /// 上游在池中的唯一标识
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// 校验单个上游配置
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::EmptyHost(self.key()));
        }

        if self.port == 0 {
            return Err(ConfigError::InvalidPort(self.host.clone()));
        }

        if self.weight == 0 {
            return Err(ConfigError::InvalidWeight {
                upstream: self.key(),
                weight: self.weight.to_string(),
            });
        }

        Ok(())
    }
}

impl FromStr for UpstreamSpec {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidUpstream(value.to_string());

        let (address, weight) = match value.rsplit_once('%') {
            Some((address, weight)) => (address, Some(weight)),
            None => (value, None),
        };

        let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
        let port = parse_digits::<u16>(port).ok_or_else(invalid)?;

        let weight = match weight {
            None => DEFAULT_WEIGHT,
            Some(weight) if weight.is_empty() || !weight.bytes().all(|b| b.is_ascii_digit()) => {
                return Err(invalid());
            }
            Some(weight) => weight.parse::<u32>().map_err(|_| ConfigError::InvalidWeight {
                upstream: address.to_string(),
                weight: weight.to_string(),
            })?,
        };

        let spec = Self::new(strip_brackets(host), port, weight);
        spec.validate()?;
        Ok(spec)
    }
}

impl fmt::Display for UpstreamSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}%{}", self.host, self.port, self.weight)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum UpstreamEntry {
    Spec(String),
    Table {
        host: String,
        port: u16,
        #[serde(default = "default_weight")]
        weight: u32,
    },
}

impl TryFrom<UpstreamEntry> for UpstreamSpec {
    type Error = ConfigError;

    fn try_from(entry: UpstreamEntry) -> Result<Self, Self::Error> {
        match entry {
            UpstreamEntry::Spec(value) => value.parse(),
            UpstreamEntry::Table { host, port, weight } => {
                let spec = UpstreamSpec::new(host, port, weight);
                spec.validate()?;
                Ok(spec)
            }
        }
    }
}

// Default value functions
fn default_weight() -> u32 {
    DEFAULT_WEIGHT
}

fn default_probe_interval() -> u64 {
    300 // 5分钟
}

fn default_relay_buffer_size() -> usize {
    8192
}

fn default_pending_buffer_limit() -> usize {
    1024 * 1024
}

fn parse_digits<T: FromStr>(value: &str) -> Option<T> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    value.parse().ok()
}

fn strip_brackets(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}

impl Config {
    /// 验证配置的有效性
    pub fn validate(&self) -> Result<(), ConfigError> {
        for upstream in &self.upstreams {
            upstream.validate()?;
        }

        if self.settings.probe_interval_seconds == 0 {
            return Err(ConfigError::InvalidSetting {
                name: "probe_interval_seconds",
                reason: "cannot be 0".to_string(),
            });
        }

        if self.settings.pending_buffer_limit == 0 {
            return Err(ConfigError::InvalidSetting {
                name: "pending_buffer_limit",
                reason: "cannot be 0".to_string(),
            });
        }

        if self.settings.relay_buffer_size == 0 {
            return Err(ConfigError::InvalidSetting {
                name: "relay_buffer_size",
                reason: "cannot be 0".to_string(),
            });
        }

        Ok(())
    }

    /// 获取监听地址，未配置时使用默认值
    pub fn bind_address(&self) -> BindAddress {
        self.bind.clone().unwrap_or_default()
    }

    /// 添加上游；同一 `host:port` 再次添加时只更新权重
    pub fn put_upstream(&mut self, spec: UpstreamSpec) {
        match self
            .upstreams
            .iter_mut()
            .find(|u| u.host == spec.host && u.port == spec.port)
        {
            Some(existing) => existing.weight = spec.weight,
            None => self.upstreams.push(spec),
        }
    }
}
