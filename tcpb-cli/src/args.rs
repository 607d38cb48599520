use anyhow::{Context, Result};
use clap::Parser;
use tcpb_core::config::loader::load_config_from_path;
use tcpb_core::{BindAddress, Config, LoadBalanceStrategy, UpstreamSpec};

#[derive(Parser, Debug)]
#[command(name = "tcp-balance")]
#[command(about = "A transparent TCP load balancer", version)]
#[command(override_usage = "tcp-balance [OPTIONS] host:port[%weight] ...")]
pub struct Cli {
    /// Listen address, `[ip:]port` (default 127.0.0.1:8080)
    #[arg(short, long)]
    pub bind: Option<BindAddress>,

    /// Balancing algorithm: single, robin, random or weighted (default robin)
    #[arg(short = 'a', long = "algorithm")]
    pub algorithm: Option<LoadBalanceStrategy>,

    /// Path to a TOML configuration file
    #[arg(short, long)]
    pub config: Option<String>,

    /// Seconds between passive health probes of an idle upstream
    #[arg(long)]
    pub probe_interval: Option<u64>,

    /// Log filter, overrides RUST_LOG (e.g. `debug`, `tcpb_loadbalance=debug`)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Validate the configuration, probe every upstream once and exit
    #[arg(long)]
    pub check: bool,

    /// Upstreams, `host:port[%weight]`
    #[arg(value_name = "UPSTREAM")]
    pub upstreams: Vec<UpstreamSpec>,
}

impl Cli {
    /// 合并配置文件和命令行参数，命令行优先
    pub fn resolve_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => load_config_from_path(path)?,
            None => Config::default(),
        };

        if let Some(bind) = &self.bind {
            config.bind = Some(bind.clone());
        }
        if let Some(algorithm) = self.algorithm {
            config.strategy = algorithm;
        }
        if let Some(seconds) = self.probe_interval {
            config.settings.probe_interval_seconds = seconds;
        }
        for upstream in &self.upstreams {
            config.put_upstream(upstream.clone());
        }

        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}
