//! Dalvis 平台配置模块
//!
//! 该模块提供服务启动所需的完整配置管理功能，包括：
//! - 配置文件（单文件或目录）加载和解析
//! - 环境特定配置覆盖
//! - 环境变量与命令行覆盖
//! - 启动前的配置校验
//!
//! 配置不再是进程级单例：`load_config` 返回一个拥有所有权的值，
//! 由调用方显式传递给启动器。

use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use toml::Value;
use tracing::warn;
use tracing_subscriber::EnvFilter;
use url::Url;

use crate::discovery::{BackendType, parse_backend_type};
use crate::error::{BootstrapError, Result};

mod cli;
mod manager;

pub use cli::ServiceArgs;
pub use manager::ConfigManager;

/// Spring Boot Actuator 默认的健康检查路径
pub const DEFAULT_HEALTH_CHECK_PATH: &str = "/actuator/health";

/// 服务标识配置
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ServiceSection {
    /// 逻辑服务名（注册中心中的名字）
    #[serde(default)]
    pub name: Option<String>,
    /// 服务版本
    #[serde(default)]
    pub version: Option<String>,
    /// 实例 ID（未配置时自动生成）
    #[serde(default)]
    pub instance_id: Option<String>,
}

/// 监听器配置
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ServerSection {
    /// 监听地址
    #[serde(default)]
    pub address: Option<String>,
    /// 监听端口，0 表示由系统分配
    #[serde(default)]
    pub port: Option<u16>,
    /// 健康检查路径
    #[serde(default)]
    pub health_check_path: Option<String>,
    /// 优雅停机宽限时间（秒）
    #[serde(default)]
    pub shutdown_grace_period_secs: Option<u64>,
}

/// 注册重试策略
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// 首次退避时间（毫秒）
    pub initial_backoff_ms: u64,
    /// 最大退避时间（毫秒）
    pub max_backoff_ms: u64,
    /// 退避倍数
    pub multiplier: f64,
    /// 最大尝试次数
    pub max_attempts: u32,
    /// 整体注册截止时间（秒）
    pub deadline_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 500,
            max_backoff_ms: 10_000,
            multiplier: 2.0,
            max_attempts: 10,
            deadline_secs: 60,
        }
    }
}

impl RetryConfig {
    /// 第 `attempt` 次失败后的退避时间（attempt 从 1 开始）
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let millis = (self.initial_backoff_ms as f64) * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_backoff_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }
}

fn default_registry_ttl() -> u64 {
    30
}

fn default_heartbeat_interval() -> u64 {
    10
}

fn default_namespace() -> String {
    "dalvis".to_string()
}

/// 注册中心配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RegistryConfig {
    /// 注册中心类型（consul / etcd）
    pub registry_type: String,
    /// 注册中心端点列表
    #[serde(default)]
    pub endpoints: Vec<String>,
    /// 命名空间
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// 注册过期时间（秒）
    #[serde(default = "default_registry_ttl")]
    pub ttl: u64,
    /// 心跳间隔（秒）
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// 对外公布的地址（监听 0.0.0.0 时使用）
    #[serde(default)]
    pub advertise_address: Option<String>,
    /// 实例标签
    #[serde(default)]
    pub tags: HashMap<String, String>,
    /// 注册重试策略
    #[serde(default)]
    pub retry: RetryConfig,
}

impl RegistryConfig {
    /// 使用默认 TTL、心跳与重试策略构造
    pub fn new(registry_type: impl Into<String>, endpoints: Vec<String>) -> Self {
        Self {
            registry_type: registry_type.into(),
            endpoints,
            namespace: default_namespace(),
            ttl: default_registry_ttl(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            advertise_address: None,
            tags: HashMap::new(),
            retry: RetryConfig::default(),
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl)
    }
}

/// 日志配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 日志级别（EnvFilter 语法）
    pub level: String,
    pub with_target: bool,
    pub with_thread_ids: bool,
    pub with_file: bool,
    pub with_line_number: bool,
    /// 输出 JSON 格式日志
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            with_target: true,
            with_thread_ids: false,
            with_file: false,
            with_line_number: false,
            json: false,
        }
    }
}

/// 服务应用配置主结构体（反序列化后的原始形态，字段均可缺省）
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ServiceAppConfig {
    /// 服务标识
    #[serde(default)]
    pub service: ServiceSection,
    /// 监听器
    #[serde(default)]
    pub server: ServerSection,
    /// 注册中心
    #[serde(default)]
    pub registry: Option<RegistryConfig>,
    /// 日志
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// 校验通过的启动配置
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    pub service_name: String,
    pub version: String,
    pub instance_id: Option<String>,
    pub bind_address: SocketAddr,
    pub health_check_path: String,
    pub shutdown_grace_period: Duration,
    pub backend: BackendType,
    pub registry: RegistryConfig,
    pub logging: LoggingConfig,
}

impl ServiceAppConfig {
    /// 为服务二进制补齐固有默认值（服务名与默认端口）
    ///
    /// 已配置的值不会被覆盖；注册中心没有默认值
    pub fn compose_service_config(mut self, fallback_name: &str, fallback_port: u16) -> Self {
        if self
            .service
            .name
            .as_deref()
            .map(str::is_empty)
            .unwrap_or(true)
        {
            self.service.name = Some(fallback_name.to_string());
        }
        if self.server.port.is_none() {
            self.server.port = Some(fallback_port);
        }
        self
    }

    /// 校验配置并生成启动配置
    pub fn validate(&self) -> Result<BootstrapConfig> {
        let service_name = match self.service.name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => crate::bail_config!("service.name", "missing required field"),
        };
        validate_service_name(&service_name)?;

        let address = self.server.address.as_deref().unwrap_or("0.0.0.0");
        let ip: IpAddr = address.parse().map_err(|_| {
            BootstrapError::configuration("server.address", format!("`{address}` is not an IP address"))
        })?;
        let Some(port) = self.server.port else {
            crate::bail_config!("server.port", "missing required field");
        };

        let health_check_path = self
            .server
            .health_check_path
            .clone()
            .unwrap_or_else(|| DEFAULT_HEALTH_CHECK_PATH.to_string());
        if !health_check_path.starts_with('/') {
            crate::bail_config!("server.health_check_path", "must start with `/`");
        }

        let Some(registry) = self.registry.clone() else {
            crate::bail_config!("registry", "missing required section");
        };
        let backend = parse_backend_type(&registry.registry_type)
            .map_err(|reason| BootstrapError::configuration("registry.registry_type", reason))?;
        validate_registry(&registry)?;

        EnvFilter::try_new(&self.logging.level).map_err(|e| {
            BootstrapError::configuration("logging.level", format!("invalid filter: {e}"))
        })?;

        Ok(BootstrapConfig {
            service_name,
            version: self
                .service
                .version
                .clone()
                .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string()),
            instance_id: self.service.instance_id.clone().filter(|id| !id.is_empty()),
            bind_address: SocketAddr::new(ip, port),
            health_check_path,
            shutdown_grace_period: Duration::from_secs(
                self.server.shutdown_grace_period_secs.unwrap_or(10),
            ),
            backend,
            registry,
            logging: self.logging.clone(),
        })
    }
}

fn validate_service_name(name: &str) -> Result<()> {
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if !valid_chars || name.starts_with('-') || name.ends_with('-') {
        crate::bail_config!(
            "service.name",
            "`{name}` must be lowercase letters, digits and inner hyphens"
        );
    }
    Ok(())
}

fn validate_registry(registry: &RegistryConfig) -> Result<()> {
    if registry.endpoints.is_empty() {
        crate::bail_config!("registry.endpoints", "at least one endpoint is required");
    }
    for endpoint in &registry.endpoints {
        Url::parse(endpoint).map_err(|e| {
            BootstrapError::configuration("registry.endpoints", format!("`{endpoint}`: {e}"))
        })?;
    }
    if registry.heartbeat_interval_secs == 0 {
        crate::bail_config!("registry.heartbeat_interval_secs", "must be greater than 0");
    }
    if registry.ttl <= registry.heartbeat_interval_secs {
        crate::bail_config!(
            "registry.ttl",
            "ttl ({}s) must exceed the heartbeat interval ({}s)",
            registry.ttl,
            registry.heartbeat_interval_secs
        );
    }
    if let Some(advertise) = registry.advertise_address.as_deref() {
        advertise.parse::<IpAddr>().map_err(|_| {
            BootstrapError::configuration(
                "registry.advertise_address",
                format!("`{advertise}` is not an IP address"),
            )
        })?;
    }

    let retry = &registry.retry;
    if retry.max_attempts == 0 {
        crate::bail_config!("registry.retry.max_attempts", "must be at least 1");
    }
    if retry.deadline_secs == 0 {
        crate::bail_config!("registry.retry.deadline_secs", "must be greater than 0");
    }
    if retry.multiplier.is_nan() || retry.multiplier < 1.0 {
        crate::bail_config!("registry.retry.multiplier", "must be >= 1.0");
    }
    if retry.initial_backoff_ms > retry.max_backoff_ms {
        crate::bail_config!(
            "registry.retry.initial_backoff_ms",
            "must not exceed max_backoff_ms"
        );
    }
    Ok(())
}

/// 加载配置
///
/// 查找顺序：显式路径 → `config` 目录 → `config.toml`；
/// 之后依次叠加环境配置文件与环境变量。
/// 显式路径不存在视为配置错误；隐式候选都不存在时使用空配置。
pub fn load_config(path: Option<&str>) -> Result<ServiceAppConfig> {
    load_config_with(path, |key| std::env::var(key).ok())
}

/// 加载配置，环境名称与覆盖变量从 `lookup` 读取
pub fn load_config_with<F>(path: Option<&str>, lookup: F) -> Result<ServiceAppConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let (mut value, source) = match path {
        Some(p) => {
            let path = PathBuf::from(p);
            let value = load_config_value(&path).map_err(to_config_error)?;
            (value, Some(path))
        }
        None => load_with_fallback(&[PathBuf::from("config"), PathBuf::from("config.toml")])
            .map_err(to_config_error)?,
    };

    if let Some(source) = source.as_deref() {
        let environment = ConfigManager::environment_from(&lookup);
        ConfigManager::load_environment_overlay(&mut value, source, &environment)
            .map_err(to_config_error)?;
    }

    let mut cfg: ServiceAppConfig = value
        .try_into()
        .map_err(|e| BootstrapError::configuration("config", e.to_string()))?;
    ConfigManager::apply_env_overrides_from(&mut cfg, &lookup)?;
    Ok(cfg)
}

/// 从 TOML 字符串解析配置（不叠加环境覆盖）
pub fn parse_config_str(content: &str) -> Result<ServiceAppConfig> {
    toml::from_str(content).map_err(|e| BootstrapError::configuration("config", e.to_string()))
}

fn to_config_error(err: anyhow::Error) -> BootstrapError {
    BootstrapError::configuration("config", format!("{err:#}"))
}

/// 使用备选方案加载配置
fn load_with_fallback(candidates: &[PathBuf]) -> anyhow::Result<(Value, Option<PathBuf>)> {
    for path in candidates {
        if path.exists() {
            let value = load_config_value(path)?;
            return Ok((value, Some(path.clone())));
        }
    }

    warn!("no configuration source found, starting from an empty configuration");
    Ok((Value::Table(Default::default()), None))
}

/// 从源加载配置
fn load_config_value(path: &Path) -> anyhow::Result<Value> {
    if !path.exists() {
        return Err(anyhow!(
            "configuration path {} does not exist",
            path.display()
        ));
    }

    let metadata = path
        .metadata()
        .with_context(|| format!("unable to read metadata for {}", path.display()))?;

    if metadata.is_dir() {
        load_config_from_directory(path)
    } else {
        load_toml_value(path)
    }
}

/// 从目录加载配置
fn load_config_from_directory(path: &Path) -> anyhow::Result<Value> {
    let base_file = path.join("base.toml");
    if !base_file.exists() {
        return Err(anyhow!(
            "missing base configuration: {}",
            base_file.display()
        ));
    }

    let mut merged = load_toml_value(&base_file)?;

    if !merged.is_table() {
        return Err(anyhow!(
            "base configuration must be a table: {}",
            base_file.display()
        ));
    }

    merge_directory(&mut merged, &path.join("shared"))?;
    merge_directory(&mut merged, &path.join("services"))?;
    merge_directory(&mut merged, &path.join("overrides"))?;

    Ok(merged)
}

/// 合并目录中的配置
fn merge_directory(root: &mut Value, dir: &Path) -> anyhow::Result<()> {
    if !dir.exists() {
        return Ok(());
    }

    let mut entries = fs::read_dir(dir)
        .with_context(|| format!("unable to read config directory {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .path()
                .extension()
                .and_then(OsStr::to_str)
                .map(|ext| ext.eq_ignore_ascii_case("toml"))
                .unwrap_or(false)
        })
        .collect::<Vec<_>>();

    entries.sort_by_key(|entry| entry.path());

    for entry in entries {
        let value = load_toml_value(&entry.path())?;
        merge_value(root, value);
    }

    Ok(())
}

/// 加载 TOML 值
fn load_toml_value(path: &Path) -> anyhow::Result<Value> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("unable to read config fragment {}", path.display()))?;
    let value: Value = toml::from_str(&content)
        .with_context(|| format!("invalid TOML content in fragment {}", path.display()))?;
    Ok(value)
}

/// 合并值：表按键递归合并，其余类型直接覆盖
pub(crate) fn merge_value(base: &mut Value, overlay: Value) {
    match overlay {
        Value::Table(overlay_table) => {
            if let Value::Table(base_table) = base {
                for (key, overlay_value) in overlay_table.into_iter() {
                    match base_table.get_mut(&key) {
                        Some(base_value) => merge_value(base_value, overlay_value),
                        None => {
                            base_table.insert(key, overlay_value);
                        }
                    }
                }
            } else {
                *base = Value::Table(overlay_table);
            }
        }
        other => {
            *base = other;
        }
    }
}
