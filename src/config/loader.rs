use super::schema::Config;
use crate::error::{ConfigError, Result};
use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment,
};
use std::path::Path;

pub fn load_from_env_or_file() -> Result<Config> {
    let config: Config = Figment::new()
        .merge(Toml::file("bridle.toml"))
        .merge(Json::file("bridle.json"))
        .merge(Yaml::file("bridle.yaml"))
        .merge(Yaml::file("bridle.yml"))
        .merge(Env::prefixed("BRIDLE_").split("_"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    validate(&config)?;
    Ok(config)
}

pub fn load_from_path(path: &Path) -> Result<Config> {
    let figment = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => Figment::new().merge(Json::file(path)),
        Some("yaml") | Some("yml") => Figment::new().merge(Yaml::file(path)),
        _ => Figment::new().merge(Toml::file(path)),
    };

    let config: Config = figment
        .merge(Env::prefixed("BRIDLE_").split("_"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.admin.enabled && config.proxy.port == config.admin.port {
        return Err(ConfigError::Validation(
            "Proxy and admin ports must be different".into(),
        )
        .into());
    }

    if config.backend.host.is_empty() {
        return Err(ConfigError::Validation("Backend host must not be empty".into()).into());
    }

    Ok(())
}
