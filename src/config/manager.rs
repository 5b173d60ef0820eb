//! 配置管理器 - 负责处理不同环境下的配置选择和覆盖
//!
//! 该模块提供了配置管理功能，包括：
//! - 加载环境特定配置（`environments/{env}.toml`）
//! - 从环境变量覆盖配置字段

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use toml::Value;
use tracing::debug;

use super::{RegistryConfig, ServiceAppConfig, merge_value};
use crate::error::BootstrapError;

/// 环境名称变量
pub const ENVIRONMENT_VAR: &str = "DALVIS_ENV";

/// 配置管理器
pub struct ConfigManager;

impl ConfigManager {
    /// 获取当前环境名称
    ///
    /// 从 DALVIS_ENV 获取，未设置时默认为 "development"
    pub fn environment_from<F>(lookup: F) -> String
    where
        F: Fn(&str) -> Option<String>,
    {
        lookup(ENVIRONMENT_VAR)
            .filter(|env| !env.trim().is_empty())
            .unwrap_or_else(|| "development".to_string())
    }

    /// 环境配置文件路径
    ///
    /// 配置源是目录时位于 `{dir}/environments/`，
    /// 是文件时位于同级的 `environments/`
    pub fn environment_config_path(source: &Path, environment: &str) -> PathBuf {
        let root = if source.is_dir() {
            source.to_path_buf()
        } else {
            source
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."))
        };
        root.join("environments").join(format!("{environment}.toml"))
    }

    /// 根据环境加载特定配置，并合并到基础配置中
    pub fn load_environment_overlay(base: &mut Value, source: &Path, environment: &str) -> Result<()> {
        let env_config_path = Self::environment_config_path(source, environment);

        if env_config_path.exists() {
            let content = fs::read_to_string(&env_config_path).with_context(|| {
                format!("unable to read environment config {}", env_config_path.display())
            })?;
            let overlay: Value = toml::from_str(&content).with_context(|| {
                format!("invalid environment config {}", env_config_path.display())
            })?;

            debug!(environment = %environment, path = %env_config_path.display(), "applying environment config");
            merge_value(base, overlay);
        }

        Ok(())
    }

    /// 从给定的变量查找函数覆盖配置
    ///
    /// 支持的变量：
    /// - `SERVICE_NAME` / `SERVICE_VERSION` / `SERVICE_INSTANCE_ID`
    /// - `SERVER_ADDRESS` / `SERVER_PORT`
    /// - `REGISTRY_TYPE` / `REGISTRY_ENDPOINTS`（逗号分隔）/ `REGISTRY_NAMESPACE`
    /// - `SERVICE_HEARTBEAT_INTERVAL`（秒）
    /// - `LOG_LEVEL`
    pub fn apply_env_overrides_from<F>(
        cfg: &mut ServiceAppConfig,
        lookup: F,
    ) -> crate::error::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(name) = get("SERVICE_NAME") {
            cfg.service.name = Some(name);
        }
        if let Some(version) = get("SERVICE_VERSION") {
            cfg.service.version = Some(version);
        }
        if let Some(instance_id) = get("SERVICE_INSTANCE_ID") {
            cfg.service.instance_id = Some(instance_id);
        }
        if let Some(address) = get("SERVER_ADDRESS") {
            cfg.server.address = Some(address);
        }
        if let Some(port) = get("SERVER_PORT") {
            let port = port.trim().parse::<u16>().map_err(|_| {
                BootstrapError::configuration("SERVER_PORT", format!("`{port}` is not a valid port"))
            })?;
            cfg.server.port = Some(port);
        }

        let registry_type = get("REGISTRY_TYPE");
        let endpoints = get("REGISTRY_ENDPOINTS").map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>()
        });

        // 只要提供了类型或端点，就确保 registry 段存在
        if registry_type.is_some() || endpoints.is_some() {
            let registry = cfg
                .registry
                .get_or_insert_with(|| RegistryConfig::new("consul", Vec::new()));
            if let Some(registry_type) = registry_type {
                registry.registry_type = registry_type;
            }
            if let Some(endpoints) = endpoints {
                registry.endpoints = endpoints;
            }
        }

        if let Some(registry) = cfg.registry.as_mut() {
            if let Some(namespace) = get("REGISTRY_NAMESPACE") {
                registry.namespace = namespace;
            }
            if let Some(interval) = get("SERVICE_HEARTBEAT_INTERVAL") {
                registry.heartbeat_interval_secs = interval.trim().parse::<u64>().map_err(|_| {
                    BootstrapError::configuration(
                        "SERVICE_HEARTBEAT_INTERVAL",
                        format!("`{interval}` is not a number of seconds"),
                    )
                })?;
            }
        }

        if let Some(level) = get("LOG_LEVEL") {
            cfg.logging.level = level;
        }

        Ok(())
    }
}
