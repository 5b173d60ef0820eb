//! 服务注册发现初始化模块
//!
//! 从注册中心配置构建 [`DiscoveryClient`]，并根据启动配置构建待注册的实例

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use uuid::Uuid;

use super::{BackendType, ConsulDiscovery, DiscoveryClient, EtcdDiscovery, ServiceInstance};
use crate::config::{BootstrapConfig, RegistryConfig};
use crate::error::{DiscoveryError, DiscoveryResult};

/// 将注册中心类型字符串转换为 BackendType
pub fn parse_backend_type(registry_type: &str) -> Result<BackendType, String> {
    match registry_type.trim().to_lowercase().as_str() {
        "consul" => Ok(BackendType::Consul),
        "etcd" => Ok(BackendType::Etcd),
        "dns" | "mesh" => Err(format!(
            "registry type `{registry_type}` does not support service registration"
        )),
        _ => Err(format!("Unsupported registry type: {registry_type}")),
    }
}

/// 生成实例 ID（如果未提供）
///
/// 生成格式: `{service_name}-{uuid_short}`
/// 例如: `docgen-service-a1b2c3d4`
pub fn generate_instance_id(service_name: &str, instance_id: Option<String>) -> String {
    instance_id.unwrap_or_else(|| format!("{}-{}", service_name, &Uuid::new_v4().to_string()[..8]))
}

/// 从注册中心配置创建客户端
///
/// 不会在此处连接注册中心：连接失败需要进入注册重试流程，而不是在构建阶段失败
pub fn create_discovery_client(config: &RegistryConfig) -> DiscoveryResult<Arc<dyn DiscoveryClient>> {
    let backend =
        parse_backend_type(&config.registry_type).map_err(DiscoveryError::Unsupported)?;

    let client: Arc<dyn DiscoveryClient> = match backend {
        BackendType::Consul => Arc::new(
            ConsulDiscovery::new(&config.endpoints, config.ttl())?
                .with_namespace(&config.namespace),
        ),
        BackendType::Etcd => Arc::new(EtcdDiscovery::new(
            config.endpoints.clone(),
            &config.namespace,
            config.ttl(),
        )),
    };

    tracing::debug!(
        registry_type = %backend,
        endpoints = ?config.endpoints,
        "discovery client created"
    );

    Ok(client)
}

/// 计算对外公布的地址
///
/// 监听在未指定地址（0.0.0.0 / ::）时，使用 `advertise_address`，否则回退到回环地址
pub fn advertised_address(bound: SocketAddr, registry: &RegistryConfig) -> SocketAddr {
    if !bound.ip().is_unspecified() {
        return bound;
    }
    let ip = registry
        .advertise_address
        .as_deref()
        .and_then(|addr| addr.parse::<IpAddr>().ok())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
    SocketAddr::new(ip, bound.port())
}

/// 根据启动配置与实际绑定地址构建待注册实例
pub fn build_service_instance(config: &BootstrapConfig, bound: SocketAddr) -> ServiceInstance {
    let instance_id = generate_instance_id(&config.service_name, config.instance_id.clone());
    let address = advertised_address(bound, &config.registry);

    let mut instance = ServiceInstance::new(&config.service_name, instance_id, address)
        .with_version(&config.version)
        .with_health_check_path(&config.health_check_path);

    // 设置命名空间（如果配置了）
    if !config.registry.namespace.is_empty() {
        instance = instance.with_namespace(&config.registry.namespace);
    }

    for (key, value) in &config.registry.tags {
        instance = instance.with_tag(key.clone(), value.clone());
    }

    instance
}
