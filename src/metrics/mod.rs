//! # Prometheus 指标收集模块
//!
//! 为启动器提供注册、心跳与生命周期状态指标。
//! 每个启动器持有独立的 `Registry`，所有指标带 `service` 常量标签。

use std::collections::HashMap;

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

/// 启动器指标
pub struct BootstrapMetrics {
    registry: Registry,
    /// 注册尝试次数（按结果）
    pub registration_attempts_total: IntCounterVec,
    /// 注册成功耗时（秒，含重试）
    pub registration_duration_seconds: Histogram,
    /// 心跳次数（按结果）
    pub heartbeats_total: IntCounterVec,
    /// 当前生命周期状态（见 `BootstrapState::gauge_value`）
    pub bootstrap_state: IntGauge,
}

impl BootstrapMetrics {
    pub fn new(service_name: &str) -> Result<Self, prometheus::Error> {
        let labels = HashMap::from([("service".to_string(), service_name.to_string())]);
        let registry = Registry::new_custom(Some("dalvis".to_string()), Some(labels))?;

        let registration_attempts_total = IntCounterVec::new(
            Opts::new(
                "registration_attempts_total",
                "Total number of discovery registration attempts",
            ),
            &["backend", "outcome"],
        )?;

        let registration_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "registration_duration_seconds",
                "Time from first registration attempt to success in seconds",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0]),
        )?;

        let heartbeats_total = IntCounterVec::new(
            Opts::new("heartbeats_total", "Total number of registry heartbeats"),
            &["outcome"],
        )?;

        let bootstrap_state = IntGauge::new(
            "bootstrap_state",
            "Current bootstrap lifecycle state (0=starting .. 5=failed)",
        )?;

        registry.register(Box::new(registration_attempts_total.clone()))?;
        registry.register(Box::new(registration_duration_seconds.clone()))?;
        registry.register(Box::new(heartbeats_total.clone()))?;
        registry.register(Box::new(bootstrap_state.clone()))?;

        Ok(Self {
            registry,
            registration_attempts_total,
            registration_duration_seconds,
            heartbeats_total,
            bootstrap_state,
        })
    }

    pub fn record_registration(&self, backend: &str, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        self.registration_attempts_total
            .with_label_values(&[backend, outcome])
            .inc();
    }

    pub fn record_heartbeat(&self, outcome: &str) {
        self.heartbeats_total.with_label_values(&[outcome]).inc();
    }

    /// Prometheus 文本格式输出
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bootstrap_metrics() -> Result<(), Box<dyn std::error::Error>> {
        let metrics = BootstrapMetrics::new("docgen-service")?;

        metrics.record_registration("consul", false);
        metrics.record_registration("consul", true);
        metrics.record_heartbeat("ok");
        metrics.bootstrap_state.set(2);

        assert_eq!(
            metrics
                .registration_attempts_total
                .with_label_values(&["consul", "failure"])
                .get(),
            1
        );

        let text = metrics.encode()?;
        assert!(text.contains("dalvis_registration_attempts_total"));
        assert!(text.contains("service=\"docgen-service\""));
        assert!(text.contains("dalvis_bootstrap_state"));

        Ok(())
    }

    #[test]
    fn test_independent_registries() -> Result<(), Box<dyn std::error::Error>> {
        // 同一进程内可以创建多个启动器
        let first = BootstrapMetrics::new("docgen-service")?;
        let second = BootstrapMetrics::new("product-quote-service")?;
        first.record_heartbeat("ok");
        assert_eq!(second.heartbeats_total.with_label_values(&["ok"]).get(), 0);
        Ok(())
    }
}
