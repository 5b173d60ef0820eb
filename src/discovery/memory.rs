//! 进程内注册表
//!
//! 按服务名保存实例与最近一次心跳时间，超过 TTL 未续期的实例不再被发现。
//! 可以通过 `set_available(false)` 模拟注册中心不可达。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;

use super::{DiscoveryClient, ServiceInstance};
use crate::error::{DiscoveryError, DiscoveryResult};

struct Entry {
    instance: ServiceInstance,
    last_heartbeat: Instant,
}

/// 调用计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryCalls {
    pub register: u64,
    pub heartbeat: u64,
    pub deregister: u64,
}

/// 进程内注册表
pub struct InMemoryRegistry {
    ttl: Duration,
    services: RwLock<HashMap<String, HashMap<String, Entry>>>,
    available: AtomicBool,
    failing_registrations: AtomicU32,
    register_calls: AtomicU64,
    heartbeat_calls: AtomicU64,
    deregister_calls: AtomicU64,
}

impl InMemoryRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            services: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
            failing_registrations: AtomicU32::new(0),
            register_calls: AtomicU64::new(0),
            heartbeat_calls: AtomicU64::new(0),
            deregister_calls: AtomicU64::new(0),
        }
    }

    /// 切换注册中心可达性
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// 接下来的 `count` 次注册返回网络错误
    pub fn fail_next_registrations(&self, count: u32) {
        self.failing_registrations.store(count, Ordering::SeqCst);
    }

    pub fn calls(&self) -> RegistryCalls {
        RegistryCalls {
            register: self.register_calls.load(Ordering::SeqCst),
            heartbeat: self.heartbeat_calls.load(Ordering::SeqCst),
            deregister: self.deregister_calls.load(Ordering::SeqCst),
        }
    }

    /// 清除过期实例，返回被清除的数量
    pub async fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut services = self.services.write().await;
        let mut evicted = 0;
        for instances in services.values_mut() {
            let before = instances.len();
            instances.retain(|_, entry| now.duration_since(entry.last_heartbeat) < self.ttl);
            evicted += before - instances.len();
        }
        services.retain(|_, instances| !instances.is_empty());
        evicted
    }

    fn ensure_available(&self) -> DiscoveryResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DiscoveryError::Transport("registry unreachable".to_string()))
        }
    }

    fn is_live(&self, entry: &Entry, now: Instant) -> bool {
        now.duration_since(entry.last_heartbeat) < self.ttl
    }
}

#[async_trait]
impl DiscoveryClient for InMemoryRegistry {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn register(&self, instance: &ServiceInstance) -> DiscoveryResult<()> {
        self.register_calls.fetch_add(1, Ordering::SeqCst);
        self.ensure_available()?;

        let injected_failure = self
            .failing_registrations
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected_failure {
            return Err(DiscoveryError::Transport("connection refused".to_string()));
        }

        let mut instance = instance.clone();
        instance.registered_at.get_or_insert_with(chrono::Utc::now);

        let mut services = self.services.write().await;
        services
            .entry(instance.service_name.clone())
            .or_default()
            .insert(
                instance.instance_id.clone(),
                Entry {
                    instance,
                    last_heartbeat: Instant::now(),
                },
            );
        Ok(())
    }

    async fn heartbeat(&self, instance: &ServiceInstance) -> DiscoveryResult<()> {
        self.heartbeat_calls.fetch_add(1, Ordering::SeqCst);
        self.ensure_available()?;

        let now = Instant::now();
        let mut services = self.services.write().await;
        let entry = services
            .get_mut(&instance.service_name)
            .and_then(|instances| instances.get_mut(&instance.instance_id));

        match entry {
            Some(entry) if self.is_live(entry, now) => {
                entry.last_heartbeat = now;
                Ok(())
            }
            _ => Err(DiscoveryError::NotRegistered(instance.instance_id.clone())),
        }
    }

    async fn deregister(&self, instance: &ServiceInstance) -> DiscoveryResult<()> {
        self.deregister_calls.fetch_add(1, Ordering::SeqCst);
        self.ensure_available()?;

        let mut services = self.services.write().await;
        if let Some(instances) = services.get_mut(&instance.service_name) {
            instances.remove(&instance.instance_id);
            if instances.is_empty() {
                services.remove(&instance.service_name);
            }
        }
        Ok(())
    }

    async fn discover(&self, service_name: &str) -> DiscoveryResult<Vec<ServiceInstance>> {
        self.ensure_available()?;

        let now = Instant::now();
        let services = self.services.read().await;
        let mut found: Vec<ServiceInstance> = services
            .get(service_name)
            .map(|instances| {
                instances
                    .values()
                    .filter(|entry| self.is_live(entry, now))
                    .map(|entry| entry.instance.clone())
                    .collect()
            })
            .unwrap_or_default();
        found.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        Ok(found)
    }
}
