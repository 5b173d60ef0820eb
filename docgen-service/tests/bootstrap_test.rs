// 启动测试 - 使用进程内注册表验证 docgen-service 的注册与注销
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use dalvis_platform_core::config::parse_config_str;
use dalvis_platform_core::discovery::{DiscoveryClient, InMemoryRegistry};
use dalvis_platform_core::{BootstrapState, ShutdownTrigger};
use docgen_service::ApplicationBootstrap;

#[tokio::test]
async fn test_docgen_registers_under_logical_name() -> Result<(), Box<dyn Error>> {
    let mut config = parse_config_str(
        r#"
        [server]
        address = "127.0.0.1"
        port = 0

        [registry]
        registry_type = "consul"
        endpoints = ["http://127.0.0.1:8500"]
        "#,
    )?;
    config.service.version = Some("1.2.3".to_string());

    let prepared = ApplicationBootstrap::prepare(config)?;
    let registry = Arc::new(InMemoryRegistry::new(Duration::from_secs(30)));
    let bootstrapper = ApplicationBootstrap::with_discovery(prepared, registry.clone())?;
    let mut state = bootstrapper.state_receiver();

    let trigger = ShutdownTrigger::new();
    let running = tokio::spawn(bootstrapper.run_until(trigger.wait()));

    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == BootstrapState::Serving),
    )
    .await??;

    let instances = registry.discover("docgen-service").await?;
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].version, "1.2.3");

    let health = reqwest::get(&instances[0].health_check_url).await?;
    assert_eq!(health.status(), 200);
    let body: serde_json::Value = health.json().await?;
    assert_eq!(body["service"], "docgen-service");

    trigger.trigger();
    running.await??;

    assert!(registry.discover("docgen-service").await?.is_empty());
    Ok(())
}
