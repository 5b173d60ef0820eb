//! 文档生成服务
//!
//! 目前只负责启动并注册到服务发现，业务接口尚未定义。

pub mod service;

pub use service::{ApplicationBootstrap, DEFAULT_PORT};
