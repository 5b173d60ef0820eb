//! 服务名定义模块
//!
//! 注册与发现使用同一组常量，避免两侧名字不一致。
//!
//! ## 使用方式
//!
//! ```rust
//! use dalvis_platform_core::service_names::*;
//!
//! let name = get_service_name(DOCGEN_SERVICE);
//! assert!(is_known_service(DOCGEN_SERVICE));
//! ```
//!
//! ## 环境变量覆盖
//!
//! 不同环境可以通过 `{NAME}_SERVICE` 覆盖默认名，
//! 例如 `DOCGEN_SERVICE=docgen-service-staging`。

/// 文档生成服务
pub const DOCGEN_SERVICE: &str = "docgen-service";

/// 产品报价服务
pub const PRODUCT_QUOTE_SERVICE: &str = "product-quote-service";

/// 所有已知服务名
pub const ALL_SERVICES: &[&str] = &[DOCGEN_SERVICE, PRODUCT_QUOTE_SERVICE];

/// 是否为已定义的服务名
pub fn is_known_service(name: &str) -> bool {
    ALL_SERVICES.contains(&name)
}

/// 获取服务名的环境变量名称
///
/// `docgen-service` → `DOCGEN_SERVICE`，`product-quote-service` → `PRODUCT_QUOTE_SERVICE`
pub fn service_name_env_var(service_name: &str) -> String {
    let base = service_name
        .strip_suffix("-service")
        .unwrap_or(service_name);
    format!("{}_SERVICE", base.to_uppercase().replace('-', "_"))
}

/// 从环境变量或常量获取服务名
///
/// 优先使用环境变量，如果没有则使用常量默认值
pub fn get_service_name(constant_name: &str) -> String {
    std::env::var(service_name_env_var(constant_name))
        .ok()
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| constant_name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_names() {
        assert_eq!(service_name_env_var(DOCGEN_SERVICE), "DOCGEN_SERVICE");
        assert_eq!(
            service_name_env_var(PRODUCT_QUOTE_SERVICE),
            "PRODUCT_QUOTE_SERVICE"
        );
        assert_eq!(service_name_env_var("billing"), "BILLING_SERVICE");
    }

    #[test]
    fn test_known_services() {
        assert!(is_known_service("docgen-service"));
        assert!(is_known_service("product-quote-service"));
        assert!(!is_known_service("billing-service"));
    }

    #[test]
    fn test_get_service_name_defaults_to_constant() {
        // 测试环境中不会设置这个变量
        assert_eq!(get_service_name("unset-test-only-service"), "unset-test-only-service");
    }
}
