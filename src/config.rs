#![forbid(unsafe_code)]

//! Runtime configuration for the tubegrab backend.
//!
//! Values come from (highest precedence first) explicit overrides, process
//! environment variables, a `.env` style file, then built-in defaults. The
//! staging root is where in-flight downloads are written before delivery.

use anyhow::{Context, Result, anyhow};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_CLEANUP_DELAY_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub staging_root: PathBuf,
    pub www_root: PathBuf,
    pub port: u16,
    pub host: String,
    pub cleanup_delay_secs: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub staging_root: Option<PathBuf>,
    pub www_root: Option<PathBuf>,
    pub port: Option<u16>,
    pub host: Option<String>,
    pub cleanup_delay_secs: Option<u64>,
    pub env_path: Option<PathBuf>,
}

pub fn load_runtime_config() -> Result<RuntimeConfig> {
    resolve_runtime_config(ConfigOverrides::default())
}

pub fn resolve_runtime_config(overrides: ConfigOverrides) -> Result<RuntimeConfig> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_runtime_config_with_overrides(&file_vars, env_var_string, overrides)
}

#[cfg(test)]
fn build_runtime_config(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Result<RuntimeConfig> {
    build_runtime_config_with_overrides(file_vars, env_lookup, ConfigOverrides::default())
}

fn build_runtime_config_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: ConfigOverrides,
) -> Result<RuntimeConfig> {
    let staging_root = overrides
        .staging_root
        .map(|path| path.to_string_lossy().into_owned())
        .or_else(|| lookup_value("TUBEGRAB_STAGING_ROOT", file_vars, &env_lookup))
        .ok_or_else(|| anyhow!("TUBEGRAB_STAGING_ROOT not set"))?;
    let www_root = overrides
        .www_root
        .map(|path| path.to_string_lossy().into_owned())
        .or_else(|| lookup_value("TUBEGRAB_WWW_ROOT", file_vars, &env_lookup))
        .ok_or_else(|| anyhow!("TUBEGRAB_WWW_ROOT not set"))?;
    let port = overrides
        .port
        .or_else(|| {
            lookup_value("TUBEGRAB_PORT", file_vars, &env_lookup)
                .and_then(|value| value.parse::<u16>().ok())
        })
        .unwrap_or(DEFAULT_PORT);
    let host = overrides
        .host
        .and_then(|value| {
            let trimmed = value.trim().to_string();
            if trimmed.is_empty() { None } else { Some(trimmed) }
        })
        .or_else(|| lookup_value("TUBEGRAB_HOST", file_vars, &env_lookup))
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let cleanup_delay_secs = overrides
        .cleanup_delay_secs
        .or_else(|| {
            lookup_value("TUBEGRAB_CLEANUP_DELAY_SECS", file_vars, &env_lookup)
                .and_then(|value| value.parse::<u64>().ok())
        })
        .unwrap_or(DEFAULT_CLEANUP_DELAY_SECS);
    Ok(RuntimeConfig {
        staging_root: PathBuf::from(staging_root),
        www_root: PathBuf::from(www_root),
        port,
        host,
        cleanup_delay_secs,
    })
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| file_vars.get(key).cloned())
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}
