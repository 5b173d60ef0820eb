//! Dalvis 平台错误模块
//!
//! - `BootstrapError`：启动流程对外暴露的错误类型，每一类映射到固定的进程退出码
//! - `DiscoveryError`：注册中心后端（consul / etcd / 内存）的错误类型

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// 启动流程统一结果类型
pub type Result<T, E = BootstrapError> = std::result::Result<T, E>;

/// 注册中心后端结果类型
pub type DiscoveryResult<T> = std::result::Result<T, DiscoveryError>;

/// 启动错误
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// 配置缺失或非法，不可恢复
    #[error("invalid configuration `{field}`: {reason}")]
    Configuration { field: String, reason: String },

    /// 监听端口不可用，不可恢复
    #[error("failed to bind listener on {address}: {source}")]
    Bind {
        address: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// 注册中心在重试预算内始终不可达
    #[error("service registration failed after {attempts} attempt(s): {last_error}")]
    Registration {
        attempts: u32,
        #[source]
        last_error: DiscoveryError,
    },

    /// 注册中心后端错误
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    /// 运行期间监听器异常退出
    #[error("http listener failed: {0}")]
    Server(#[source] io::Error),

    /// 指标注册失败
    #[error("failed to register metrics: {0}")]
    Metrics(String),
}

impl BootstrapError {
    /// 便捷构造配置错误
    pub fn configuration(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configuration {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// 进程退出码
    ///
    /// 0 保留给正常退出，其余错误均为非零值
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration { .. } => 2,
            Self::Bind { .. } => 3,
            Self::Registration { .. } | Self::Discovery(_) => 4,
            Self::Server(_) | Self::Metrics(_) => 1,
        }
    }

    /// 错误类别名称，用于日志字段
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "ConfigurationError",
            Self::Bind { .. } => "BindError",
            Self::Registration { .. } => "RegistrationError",
            Self::Discovery(_) => "DiscoveryError",
            Self::Server(_) => "ServerError",
            Self::Metrics(_) => "MetricsError",
        }
    }
}

impl From<prometheus::Error> for BootstrapError {
    fn from(err: prometheus::Error) -> Self {
        Self::Metrics(err.to_string())
    }
}

/// 注册中心错误
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// 网络层失败（连接拒绝、超时等）
    #[error("registry transport error: {0}")]
    Transport(String),

    /// 注册中心返回非成功状态
    #[error("registry responded with status {code}: {body}")]
    Status { code: u16, body: String },

    /// 注册中心中已不存在该实例（TTL 过期或被清理）
    #[error("instance `{0}` is not registered")]
    NotRegistered(String),

    /// 响应解析失败
    #[error("failed to decode registry payload: {0}")]
    Decode(String),

    /// 后端不支持的操作或配置
    #[error("unsupported registry operation: {0}")]
    Unsupported(String),
}

impl DiscoveryError {
    /// 是否值得重试
    ///
    /// 配置类错误（不支持的后端）重试也无法成功
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Unsupported(_) | Self::Decode(_))
    }
}

impl From<reqwest::Error> for DiscoveryError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

impl From<etcd_client::Error> for DiscoveryError {
    fn from(err: etcd_client::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for DiscoveryError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

/// 便捷宏：构造配置错误并提前返回
#[macro_export]
macro_rules! bail_config {
    ($field:expr, $($arg:tt)*) => {
        return Err($crate::error::BootstrapError::configuration($field, format!($($arg)*)))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_non_zero() {
        let errors = vec![
            BootstrapError::configuration("service.name", "missing"),
            BootstrapError::Bind {
                address: "127.0.0.1:8081".parse().unwrap(),
                source: io::Error::new(io::ErrorKind::AddrInUse, "in use"),
            },
            BootstrapError::Registration {
                attempts: 3,
                last_error: DiscoveryError::Transport("connection refused".into()),
            },
            BootstrapError::Server(io::Error::other("boom")),
        ];

        for err in &errors {
            assert_ne!(err.exit_code(), 0, "{} must exit non-zero", err.kind());
        }
    }

    #[test]
    fn test_configuration_error_names_field() {
        let err = BootstrapError::configuration("server.port", "missing required field");
        assert_eq!(err.kind(), "ConfigurationError");
        assert!(err.to_string().contains("server.port"));
    }

    #[test]
    fn test_bail_config_macro() {
        fn check(port: Option<u16>) -> Result<u16> {
            match port {
                Some(port) => Ok(port),
                None => crate::bail_config!("server.port", "missing required field"),
            }
        }

        assert_eq!(check(Some(8081)).unwrap(), 8081);
        assert!(matches!(
            check(None),
            Err(BootstrapError::Configuration { ref field, .. }) if field == "server.port"
        ));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(DiscoveryError::Transport("refused".into()).is_retryable());
        assert!(DiscoveryError::Status { code: 503, body: String::new() }.is_retryable());
        assert!(!DiscoveryError::Unsupported("dns".into()).is_retryable());
    }
}
