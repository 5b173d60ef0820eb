//! HTTP 监听模块
//!
//! 提供健康检查、实例信息与 Prometheus 指标端点，服务自定义路由可合并进来。

pub mod router;

pub use router::{HttpState, build_router};
