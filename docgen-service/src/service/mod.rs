//! 服务模块 - 包含服务启动和注册相关功能

pub mod bootstrap;

pub use bootstrap::{ApplicationBootstrap, DEFAULT_PORT};
