//! 服务发现模块
//!
//! 启动器只依赖 [`DiscoveryClient`] 能力对象：
//! `register` / `heartbeat` / `deregister`，以及用于查找的 `discover`。
//! 后端实现：
//! - [`ConsulDiscovery`]：Consul agent HTTP API，TTL 健康检查
//! - [`EtcdDiscovery`]：etcd v3，租约 + key 前缀
//! - [`InMemoryRegistry`]：进程内注册表，带 TTL 过期
//!
//! ## 使用方式
//!
//! ```rust,ignore
//! use dalvis_platform_core::discovery::{create_discovery_client, ServiceInstance};
//!
//! let client = create_discovery_client(&registry_config)?;
//! let instance = ServiceInstance::new("docgen-service", "docgen-service-a1b2c3d4", address);
//! client.register(&instance).await?;
//! let found = client.discover("docgen-service").await?;
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::DEFAULT_HEALTH_CHECK_PATH;
use crate::error::DiscoveryResult;

pub mod consul;
pub mod etcd;
pub mod init;
pub mod memory;

pub use consul::ConsulDiscovery;
pub use etcd::EtcdDiscovery;
pub use init::{
    build_service_instance, create_discovery_client, generate_instance_id, parse_backend_type,
};
pub use memory::InMemoryRegistry;

/// 注册中心后端类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    Consul,
    Etcd,
}

impl BackendType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendType::Consul => "consul",
            BackendType::Etcd => "etcd",
        }
    }
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 注册到注册中心的服务实例
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// 逻辑服务名
    pub service_name: String,
    /// 实例 ID
    pub instance_id: String,
    /// 对外可达地址
    pub address: SocketAddr,
    /// 健康检查 URL
    pub health_check_url: String,
    /// 命名空间
    #[serde(default)]
    pub namespace: String,
    /// 服务版本
    #[serde(default)]
    pub version: String,
    /// 标签（key=value）
    #[serde(default)]
    pub tags: HashMap<String, String>,
    /// 注册时间
    #[serde(default)]
    pub registered_at: Option<DateTime<Utc>>,
}

impl ServiceInstance {
    pub fn new(
        service_name: impl Into<String>,
        instance_id: impl Into<String>,
        address: SocketAddr,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            instance_id: instance_id.into(),
            address,
            health_check_url: health_check_url(address, DEFAULT_HEALTH_CHECK_PATH),
            namespace: String::new(),
            version: String::new(),
            tags: HashMap::new(),
            registered_at: None,
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_health_check_path(mut self, path: &str) -> Self {
        self.health_check_url = health_check_url(self.address, path);
        self
    }

    /// `key=value` 形式的标签列表，按 key 排序
    pub fn tag_list(&self) -> Vec<String> {
        let mut tags: Vec<String> = self
            .tags
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        tags.sort();
        tags
    }
}

fn health_check_url(address: SocketAddr, path: &str) -> String {
    format!("http://{address}{path}")
}

/// 注册中心客户端能力
///
/// 实现需要是幂等的：重复 `register` 覆盖已有注册，
/// 对未注册实例 `deregister` 视为成功。
#[async_trait]
pub trait DiscoveryClient: Send + Sync {
    /// 后端名称，用于日志与指标
    fn backend_name(&self) -> &'static str;

    /// 注册实例
    async fn register(&self, instance: &ServiceInstance) -> DiscoveryResult<()>;

    /// 续期注册；实例已不存在时返回 `DiscoveryError::NotRegistered`
    async fn heartbeat(&self, instance: &ServiceInstance) -> DiscoveryResult<()>;

    /// 注销实例
    async fn deregister(&self, instance: &ServiceInstance) -> DiscoveryResult<()>;

    /// 按逻辑服务名查找存活实例
    async fn discover(&self, service_name: &str) -> DiscoveryResult<Vec<ServiceInstance>>;
}
