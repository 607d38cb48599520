use crate::config::model::Config;
use anyhow::Context;

pub fn load_config_from_path(config_path: &str) -> Result<Config, anyhow::Error> {
    let config_str = std::fs::read_to_string(config_path)
        .with_context(|| format!("Failed to read config file '{}'", config_path))?;
    let config = parse_config(&config_str)
        .with_context(|| format!("Failed to parse config file '{}'", config_path))?;
    tracing::debug!(
        "Loaded config from {}: {} upstreams, strategy {}",
        config_path,
        config.upstreams.len(),
        config.strategy
    );
    Ok(config)
}

pub fn parse_config(config_str: &str) -> Result<Config, anyhow::Error> {
    let config: Config = toml::from_str(config_str)?;
    Ok(config)
}
