//! Dalvis 平台公共库
//!
//! 提供服务启动、配置加载与服务注册发现功能，
//! 各服务二进制（docgen-service、product-quote-service）共用。

pub mod bootstrap;
pub mod config;
pub mod discovery;
pub mod error;
pub mod metrics;
pub mod registry;
pub mod server;
pub mod service_names;
pub mod shutdown;
pub mod tracing;

pub use bootstrap::{BootstrapState, ServiceBootstrapper};
pub use config::{
    BootstrapConfig, ConfigManager, LoggingConfig, RegistryConfig, RetryConfig, ServiceAppConfig,
    ServiceArgs, load_config, load_config_with,
};
pub use discovery::{
    BackendType, DiscoveryClient, InMemoryRegistry, ServiceInstance, create_discovery_client,
};
pub use error::{BootstrapError, DiscoveryError, Result};
pub use registry::ServiceRegistrar;
pub use shutdown::{ShutdownTrigger, shutdown_signal};
