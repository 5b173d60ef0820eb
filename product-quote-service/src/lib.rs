//! 产品报价服务
//!
//! 当前只包含启动与服务注册，报价接口由后续版本补充。

pub mod service;

pub use service::{ApplicationBootstrap, DEFAULT_PORT};
