//! 应用启动器 - 负责补齐默认配置并启动服务
use std::sync::Arc;

use dalvis_platform_core::config::{BootstrapConfig, ServiceAppConfig};
use dalvis_platform_core::discovery::{DiscoveryClient, create_discovery_client};
use dalvis_platform_core::error::Result;
use dalvis_platform_core::service_names::{PRODUCT_QUOTE_SERVICE, get_service_name};
use dalvis_platform_core::ServiceBootstrapper;
use tracing::info;

/// 默认监听端口
pub const DEFAULT_PORT: u16 = 8082;

/// 应用启动器
pub struct ApplicationBootstrap;

impl ApplicationBootstrap {
    /// 运行应用的主入口点
    pub async fn run(config: ServiceAppConfig) -> Result<()> {
        let config = Self::prepare(config)?;
        Self::create_bootstrapper(config)?.start().await
    }

    /// 补齐服务名与端口默认值，并校验配置
    pub fn prepare(config: ServiceAppConfig) -> Result<BootstrapConfig> {
        config
            .compose_service_config(&get_service_name(PRODUCT_QUOTE_SERVICE), DEFAULT_PORT)
            .validate()
    }

    /// 根据配置中的注册中心创建启动器
    pub fn create_bootstrapper(config: BootstrapConfig) -> Result<ServiceBootstrapper> {
        let discovery = create_discovery_client(&config.registry)?;
        Self::with_discovery(config, discovery)
    }

    /// 使用指定的注册中心客户端创建启动器
    pub fn with_discovery(
        config: BootstrapConfig,
        discovery: Arc<dyn DiscoveryClient>,
    ) -> Result<ServiceBootstrapper> {
        info!(
            service = %config.service_name,
            backend = discovery.backend_name(),
            "creating product quote service bootstrapper"
        );
        ServiceBootstrapper::new(config, discovery)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dalvis_platform_core::config::parse_config_str;

    #[test]
    fn test_prepare_fills_defaults() {
        let config = parse_config_str(
            r#"
            [registry]
            registry_type = "consul"
            endpoints = ["http://127.0.0.1:8500"]
            "#,
        )
        .unwrap();

        let prepared = ApplicationBootstrap::prepare(config).unwrap();
        assert_eq!(prepared.service_name, "product-quote-service");
        assert_eq!(prepared.bind_address.port(), 8082);
    }

    #[test]
    fn test_prepare_requires_registry() {
        let err = ApplicationBootstrap::prepare(ServiceAppConfig::default()).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }
}
