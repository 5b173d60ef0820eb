//! 服务注册器 - 负责实例的注册、心跳与注销

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, timeout};
use tracing::{debug, info, warn};

use crate::config::RetryConfig;
use crate::discovery::{DiscoveryClient, ServiceInstance};
use crate::error::{BootstrapError, DiscoveryError, Result};
use crate::metrics::BootstrapMetrics;

/// 单次注册请求的超时上限
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);

/// 服务注册器
#[derive(Clone)]
pub struct ServiceRegistrar {
    client: Arc<dyn DiscoveryClient>,
    instance: ServiceInstance,
    retry: RetryConfig,
    heartbeat_interval: Duration,
    metrics: Arc<BootstrapMetrics>,
}

/// 心跳任务句柄
pub struct HeartbeatHandle {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl HeartbeatHandle {
    /// 停止心跳并在 `grace` 内等待任务退出，超时则中止任务
    pub async fn stop(self, grace: Duration) {
        let _ = self.stop.send(true);
        let mut handle = self.handle;
        match timeout(grace, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "heartbeat task ended abnormally"),
            Err(_) => {
                warn!(
                    grace_ms = grace.as_millis() as u64,
                    "heartbeat task did not stop in time, aborting"
                );
                handle.abort();
            }
        }
    }
}

impl ServiceRegistrar {
    pub fn new(
        client: Arc<dyn DiscoveryClient>,
        instance: ServiceInstance,
        retry: RetryConfig,
        heartbeat_interval: Duration,
        metrics: Arc<BootstrapMetrics>,
    ) -> Self {
        Self {
            client,
            instance,
            retry,
            heartbeat_interval,
            metrics,
        }
    }

    pub fn instance(&self) -> &ServiceInstance {
        &self.instance
    }

    /// 按重试策略注册实例
    ///
    /// 在 `max_attempts` 次尝试或 `deadline` 内未成功时返回 `BootstrapError::Registration`；
    /// 不可重试的错误立即返回。成功时返回所用的尝试次数
    pub async fn register_with_retry(&self) -> Result<u32> {
        let backend = self.client.backend_name();
        let started = Instant::now();
        let deadline = started + self.retry.deadline();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let remaining = deadline.saturating_duration_since(Instant::now());
            let outcome = match timeout(
                remaining.min(ATTEMPT_TIMEOUT),
                self.client.register(&self.instance),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(DiscoveryError::Transport(
                    "registration attempt timed out".to_string(),
                )),
            };

            let err = match outcome {
                Ok(()) => {
                    self.metrics.record_registration(backend, true);
                    self.metrics
                        .registration_duration_seconds
                        .observe(started.elapsed().as_secs_f64());
                    info!(
                        service = %self.instance.service_name,
                        instance_id = %self.instance.instance_id,
                        address = %self.instance.address,
                        backend,
                        attempt,
                        "service registered"
                    );
                    return Ok(attempt);
                }
                Err(err) => err,
            };
            self.metrics.record_registration(backend, false);

            if !err.is_retryable() {
                warn!(backend, attempt, error = %err, "registration failed with non-retryable error");
                return Err(BootstrapError::Registration {
                    attempts: attempt,
                    last_error: err,
                });
            }
            if attempt >= self.retry.max_attempts {
                warn!(backend, attempt, error = %err, "registration attempts exhausted");
                return Err(BootstrapError::Registration {
                    attempts: attempt,
                    last_error: err,
                });
            }

            let backoff = self.retry.backoff_for(attempt);
            if Instant::now() + backoff >= deadline {
                warn!(
                    backend,
                    attempt,
                    deadline_secs = self.retry.deadline_secs,
                    error = %err,
                    "registration deadline exceeded"
                );
                return Err(BootstrapError::Registration {
                    attempts: attempt,
                    last_error: err,
                });
            }

            warn!(
                backend,
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                error = %err,
                "registration failed, retrying"
            );
            tokio::time::sleep(backoff).await;
        }
    }

    /// 启动心跳任务
    ///
    /// 注册中心报告实例不存在时重新注册一次
    pub fn spawn_heartbeat(&self) -> HeartbeatHandle {
        let (stop, mut stopped) = watch::channel(false);
        let registrar = self.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(registrar.heartbeat_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // 注册刚完成，跳过立即触发的第一个 tick
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stopped.wait_for(|stop| *stop) => break,
                }
                // 心跳进行中也要响应停止信号，单次心跳不超过一个周期
                tokio::select! {
                    beat = timeout(registrar.heartbeat_interval, registrar.beat()) => {
                        if beat.is_err() {
                            registrar.metrics.record_heartbeat("timeout");
                            warn!(
                                instance_id = %registrar.instance.instance_id,
                                "heartbeat timed out"
                            );
                        }
                    }
                    _ = stopped.wait_for(|stop| *stop) => break,
                }
            }
            debug!(instance_id = %registrar.instance.instance_id, "heartbeat task stopped");
        });

        HeartbeatHandle { stop, handle }
    }

    async fn beat(&self) {
        match self.client.heartbeat(&self.instance).await {
            Ok(()) => {
                self.metrics.record_heartbeat("ok");
                debug!(instance_id = %self.instance.instance_id, "heartbeat sent");
            }
            Err(DiscoveryError::NotRegistered(_)) => {
                warn!(
                    instance_id = %self.instance.instance_id,
                    "registry lost the instance, re-registering"
                );
                match self.client.register(&self.instance).await {
                    Ok(()) => self.metrics.record_heartbeat("reregistered"),
                    Err(err) => {
                        self.metrics.record_heartbeat("error");
                        warn!(error = %err, "re-registration failed");
                    }
                }
            }
            Err(err) => {
                self.metrics.record_heartbeat("error");
                warn!(
                    instance_id = %self.instance.instance_id,
                    error = %err,
                    "heartbeat failed"
                );
            }
        }
    }

    /// 尽力注销，超过宽限时间放弃。返回是否注销成功
    pub async fn deregister(&self, grace: Duration) -> bool {
        match timeout(grace, self.client.deregister(&self.instance)).await {
            Ok(Ok(())) => {
                info!(instance_id = %self.instance.instance_id, "service deregistered");
                true
            }
            Ok(Err(err)) => {
                warn!(error = %err, "deregistration failed, registry TTL will expire the instance");
                false
            }
            Err(_) => {
                warn!(
                    grace_ms = grace.as_millis() as u64,
                    "deregistration timed out, registry TTL will expire the instance"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::InMemoryRegistry;

    fn retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
            multiplier: 2.0,
            max_attempts,
            deadline_secs: 60,
        }
    }

    fn registrar(registry: Arc<InMemoryRegistry>, retry: RetryConfig) -> ServiceRegistrar {
        let instance =
            ServiceInstance::new("docgen-service", "docgen-1", "127.0.0.1:8081".parse().unwrap());
        let metrics = Arc::new(BootstrapMetrics::new("docgen-service").unwrap());
        ServiceRegistrar::new(registry, instance, retry, Duration::from_secs(5), metrics)
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_retries_until_success() {
        let registry = Arc::new(InMemoryRegistry::new(Duration::from_secs(30)));
        registry.fail_next_registrations(2);
        let registrar = registrar(registry.clone(), retry(5));

        let started = Instant::now();
        let attempts = registrar.register_with_retry().await.unwrap();

        assert_eq!(attempts, 3);
        // 100ms + 200ms 的退避
        assert_eq!(started.elapsed(), Duration::from_millis(300));
        assert_eq!(registry.discover("docgen-service").await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_gives_up_after_max_attempts() {
        let registry = Arc::new(InMemoryRegistry::new(Duration::from_secs(30)));
        registry.set_available(false);
        let registrar = registrar(registry.clone(), retry(3));

        let err = registrar.register_with_retry().await.unwrap_err();
        assert!(matches!(err, BootstrapError::Registration { attempts: 3, .. }));
        assert_eq!(err.exit_code(), 4);
        assert_eq!(registry.calls().register, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_respects_deadline() {
        let registry = Arc::new(InMemoryRegistry::new(Duration::from_secs(30)));
        registry.set_available(false);
        let registrar = registrar(
            registry.clone(),
            RetryConfig {
                initial_backoff_ms: 1_000,
                max_backoff_ms: 1_000,
                multiplier: 1.0,
                max_attempts: 100,
                deadline_secs: 3,
            },
        );

        let started = Instant::now();
        let err = registrar.register_with_retry().await.unwrap_err();
        assert!(matches!(err, BootstrapError::Registration { .. }));
        assert!(started.elapsed() <= Duration::from_secs(3));
        assert!(registry.calls().register < 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_reregisters_lost_instance() {
        let registry = Arc::new(InMemoryRegistry::new(Duration::from_secs(30)));
        let registrar = registrar(registry.clone(), retry(3));
        registrar.register_with_retry().await.unwrap();

        // 注册中心丢失实例
        registry.deregister(registrar.instance()).await.unwrap();
        assert!(registry.discover("docgen-service").await.unwrap().is_empty());

        let heartbeat = registrar.spawn_heartbeat();
        tokio::time::sleep(Duration::from_secs(6)).await;
        heartbeat.stop(Duration::from_secs(1)).await;

        assert_eq!(registry.discover("docgen-service").await.unwrap().len(), 1);
        assert_eq!(registry.calls().heartbeat, 1);
        assert_eq!(
            registrar.metrics.heartbeats_total.with_label_values(&["reregistered"]).get(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_keeps_instance_alive() {
        let registry = Arc::new(InMemoryRegistry::new(Duration::from_secs(30)));
        let registrar = registrar(registry.clone(), retry(3));
        registrar.register_with_retry().await.unwrap();

        let heartbeat = registrar.spawn_heartbeat();
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(registry.discover("docgen-service").await.unwrap().len(), 1);

        heartbeat.stop(Duration::from_secs(1)).await;
        let beats = registry.calls().heartbeat;
        assert!(beats >= 12, "expected periodic heartbeats, got {beats}");

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(registry.discover("docgen-service").await.unwrap().is_empty());
    }

    /// 心跳请求永不返回的注册中心
    struct StalledHeartbeat(InMemoryRegistry);

    #[async_trait::async_trait]
    impl DiscoveryClient for StalledHeartbeat {
        fn backend_name(&self) -> &'static str {
            "stalled"
        }

        async fn register(&self, instance: &ServiceInstance) -> crate::error::DiscoveryResult<()> {
            self.0.register(instance).await
        }

        async fn heartbeat(&self, _instance: &ServiceInstance) -> crate::error::DiscoveryResult<()> {
            std::future::pending().await
        }

        async fn deregister(&self, instance: &ServiceInstance) -> crate::error::DiscoveryResult<()> {
            self.0.deregister(instance).await
        }

        async fn discover(
            &self,
            service_name: &str,
        ) -> crate::error::DiscoveryResult<Vec<ServiceInstance>> {
            self.0.discover(service_name).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_interrupts_inflight_heartbeat() {
        let client = Arc::new(StalledHeartbeat(InMemoryRegistry::new(Duration::from_secs(30))));
        let instance =
            ServiceInstance::new("docgen-service", "docgen-1", "127.0.0.1:8081".parse().unwrap());
        let metrics = Arc::new(BootstrapMetrics::new("docgen-service").unwrap());
        let registrar =
            ServiceRegistrar::new(client, instance, retry(3), Duration::from_secs(5), metrics);
        registrar.register_with_retry().await.unwrap();

        let heartbeat = registrar.spawn_heartbeat();
        // 第一次心跳在 5s 时发出并一直挂起
        tokio::time::sleep(Duration::from_millis(5_500)).await;

        let started = Instant::now();
        heartbeat.stop(Duration::from_secs(1)).await;
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_heartbeat_is_bounded_by_interval() {
        let client = Arc::new(StalledHeartbeat(InMemoryRegistry::new(Duration::from_secs(30))));
        let instance =
            ServiceInstance::new("docgen-service", "docgen-1", "127.0.0.1:8081".parse().unwrap());
        let metrics = Arc::new(BootstrapMetrics::new("docgen-service").unwrap());
        let registrar = ServiceRegistrar::new(
            client,
            instance,
            retry(3),
            Duration::from_secs(5),
            metrics.clone(),
        );
        registrar.register_with_retry().await.unwrap();

        let heartbeat = registrar.spawn_heartbeat();
        tokio::time::sleep(Duration::from_secs(21)).await;
        heartbeat.stop(Duration::from_secs(1)).await;

        assert!(metrics.heartbeats_total.with_label_values(&["timeout"]).get() >= 2);
    }

    #[tokio::test]
    async fn test_deregister_reports_failure() {
        let registry = Arc::new(InMemoryRegistry::new(Duration::from_secs(30)));
        let registrar = registrar(registry.clone(), retry(3));
        registrar.register_with_retry().await.unwrap();

        registry.set_available(false);
        assert!(!registrar.deregister(Duration::from_secs(1)).await);

        registry.set_available(true);
        assert!(registrar.deregister(Duration::from_secs(1)).await);
        assert!(registry.discover("docgen-service").await.unwrap().is_empty());
    }
}
