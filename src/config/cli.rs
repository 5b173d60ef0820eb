//! 服务二进制通用的命令行参数

use std::path::PathBuf;

use clap::Parser;

use super::{RegistryConfig, ServiceAppConfig};

/// 服务启动参数
#[derive(Parser, Debug, Clone, Default)]
#[command(version, about, long_about = None)]
pub struct ServiceArgs {
    /// 配置文件或配置目录
    #[arg(short, long, env = "SERVICE_CONFIG")]
    pub config: Option<PathBuf>,

    /// 覆盖监听端口
    #[arg(short, long)]
    pub port: Option<u16>,

    /// 覆盖逻辑服务名
    #[arg(short, long)]
    pub name: Option<String>,

    /// 覆盖注册中心端点（可重复）
    #[arg(long = "registry")]
    pub registry_endpoints: Vec<String>,
}

impl ServiceArgs {
    /// 将命令行参数叠加到配置上（优先级最高）
    pub fn apply(&self, cfg: &mut ServiceAppConfig) {
        if let Some(port) = self.port {
            cfg.server.port = Some(port);
        }
        if let Some(name) = self.name.as_ref().filter(|n| !n.is_empty()) {
            cfg.service.name = Some(name.clone());
        }
        if !self.registry_endpoints.is_empty() {
            cfg.registry
                .get_or_insert_with(|| RegistryConfig::new("consul", Vec::new()))
                .endpoints = self.registry_endpoints.clone();
        }
    }

    pub fn config_path(&self) -> Option<&str> {
        self.config.as_deref().and_then(|p| p.to_str())
    }
}
