//! etcd 后端
//!
//! key 布局：`/{namespace}/{service_name}/{instance_id}` → 实例 JSON。
//! key 绑定在租约上，心跳即一次租约续期；租约过期或被撤销后 key 自动删除。

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions, GetOptions, PutOptions};
use tokio::sync::OnceCell;

use super::{DiscoveryClient, ServiceInstance};
use crate::error::{DiscoveryError, DiscoveryResult};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// etcd 注册中心客户端
pub struct EtcdDiscovery {
    endpoints: Vec<String>,
    namespace: String,
    ttl: Duration,
    client: OnceCell<Client>,
    leases: Mutex<HashMap<String, i64>>,
}

impl EtcdDiscovery {
    /// 创建客户端，首次调用时才建立连接
    pub fn new(endpoints: Vec<String>, namespace: &str, ttl: Duration) -> Self {
        Self {
            endpoints,
            namespace: namespace.trim_matches('/').to_string(),
            ttl,
            client: OnceCell::new(),
            leases: Mutex::new(HashMap::new()),
        }
    }

    async fn client(&self) -> DiscoveryResult<Client> {
        let client = self
            .client
            .get_or_try_init(|| async {
                tracing::debug!(endpoints = ?self.endpoints, "connecting to etcd");
                let options = ConnectOptions::new()
                    .with_connect_timeout(CONNECT_TIMEOUT)
                    .with_timeout(REQUEST_TIMEOUT);
                Client::connect(&self.endpoints, Some(options)).await
            })
            .await?;
        Ok(client.clone())
    }

    fn service_prefix(&self, service_name: &str) -> String {
        if self.namespace.is_empty() {
            format!("/{service_name}/")
        } else {
            format!("/{}/{service_name}/", self.namespace)
        }
    }

    fn instance_key(&self, instance: &ServiceInstance) -> String {
        format!(
            "{}{}",
            self.service_prefix(&instance.service_name),
            instance.instance_id
        )
    }

    // 租约表只做插入和删除，持锁线程 panic 后数据仍然完整
    fn leases(&self) -> MutexGuard<'_, HashMap<String, i64>> {
        self.leases.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lease_of(&self, instance_id: &str) -> Option<i64> {
        self.leases().get(instance_id).copied()
    }

    fn remember_lease(&self, instance_id: &str, lease_id: i64) -> Option<i64> {
        self.leases().insert(instance_id.to_string(), lease_id)
    }

    fn forget_lease(&self, instance_id: &str) -> Option<i64> {
        self.leases().remove(instance_id)
    }

    fn ttl_secs(&self) -> i64 {
        self.ttl.as_secs().max(1) as i64
    }
}

#[async_trait]
impl DiscoveryClient for EtcdDiscovery {
    fn backend_name(&self) -> &'static str {
        "etcd"
    }

    async fn register(&self, instance: &ServiceInstance) -> DiscoveryResult<()> {
        let mut client = self.client().await?;

        // 重复注册时先撤销旧租约，避免残留 key
        if let Some(previous) = self.forget_lease(&instance.instance_id) {
            let _ = client.lease_revoke(previous).await;
        }

        let lease = client.lease_grant(self.ttl_secs(), None).await?;
        let lease_id = lease.id();

        let mut record = instance.clone();
        record.registered_at = Some(chrono::Utc::now());
        let value = serde_json::to_vec(&record)?;

        client
            .put(
                self.instance_key(instance),
                value,
                Some(PutOptions::new().with_lease(lease_id)),
            )
            .await?;
        if let Some(stale) = self.remember_lease(&instance.instance_id, lease_id) {
            // 并发注册留下的租约
            let _ = client.lease_revoke(stale).await;
        }
        Ok(())
    }

    async fn heartbeat(&self, instance: &ServiceInstance) -> DiscoveryResult<()> {
        let lease_id = self
            .lease_of(&instance.instance_id)
            .ok_or_else(|| DiscoveryError::NotRegistered(instance.instance_id.clone()))?;

        let mut client = self.client().await?;
        let (mut keeper, mut stream) = client.lease_keep_alive(lease_id).await?;
        keeper.keep_alive().await?;

        match stream.message().await? {
            Some(response) if response.ttl() > 0 => Ok(()),
            _ => {
                // 租约已过期
                self.forget_lease(&instance.instance_id);
                Err(DiscoveryError::NotRegistered(instance.instance_id.clone()))
            }
        }
    }

    async fn deregister(&self, instance: &ServiceInstance) -> DiscoveryResult<()> {
        let mut client = self.client().await?;
        match self.forget_lease(&instance.instance_id) {
            Some(lease_id) => {
                client.lease_revoke(lease_id).await?;
            }
            None => {
                client.delete(self.instance_key(instance), None).await?;
            }
        }
        Ok(())
    }

    async fn discover(&self, service_name: &str) -> DiscoveryResult<Vec<ServiceInstance>> {
        let mut client = self.client().await?;
        let response = client
            .get(
                self.service_prefix(service_name),
                Some(GetOptions::new().with_prefix()),
            )
            .await?;

        let mut instances = Vec::with_capacity(response.kvs().len());
        for kv in response.kvs() {
            match serde_json::from_slice::<ServiceInstance>(kv.value()) {
                Ok(instance) => instances.push(instance),
                Err(err) => tracing::warn!(
                    key = %String::from_utf8_lossy(kv.key()),
                    error = %err,
                    "skipping undecodable etcd entry"
                ),
            }
        }
        instances.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        Ok(instances)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let etcd = EtcdDiscovery::new(
            vec!["http://127.0.0.1:2379".to_string()],
            "/dalvis/",
            Duration::from_secs(30),
        );
        let instance =
            ServiceInstance::new("docgen-service", "docgen-1", "127.0.0.1:8081".parse().unwrap());

        assert_eq!(etcd.service_prefix("docgen-service"), "/dalvis/docgen-service/");
        assert_eq!(etcd.instance_key(&instance), "/dalvis/docgen-service/docgen-1");
    }

    #[test]
    fn test_key_layout_without_namespace() {
        let etcd = EtcdDiscovery::new(vec![], "", Duration::from_secs(30));
        assert_eq!(etcd.service_prefix("product-quote-service"), "/product-quote-service/");
    }

    #[test]
    fn test_prefix_does_not_match_longer_service_names() {
        let etcd = EtcdDiscovery::new(vec![], "dalvis", Duration::from_secs(30));
        let instance =
            ServiceInstance::new("docgen-service", "docgen-1", "127.0.0.1:8081".parse().unwrap());
        assert!(!etcd.instance_key(&instance).starts_with(&etcd.service_prefix("docgen")));
    }

    #[test]
    fn test_reregister_replaces_lease() {
        let etcd = EtcdDiscovery::new(vec![], "dalvis", Duration::from_secs(30));
        assert_eq!(etcd.remember_lease("docgen-1", 7), None);
        assert_eq!(etcd.lease_of("docgen-1"), Some(7));

        // 重复注册先取出旧租约再写入新租约
        assert_eq!(etcd.forget_lease("docgen-1"), Some(7));
        assert_eq!(etcd.lease_of("docgen-1"), None);
        assert_eq!(etcd.remember_lease("docgen-1", 8), None);
        assert_eq!(etcd.lease_of("docgen-1"), Some(8));

        // 并发写入时返回被替换的租约
        assert_eq!(etcd.remember_lease("docgen-1", 9), Some(8));
        assert_eq!(etcd.lease_of("docgen-2"), None);
    }

    #[test]
    fn test_poisoned_lease_table_is_still_usable() {
        let etcd = EtcdDiscovery::new(vec![], "dalvis", Duration::from_secs(30));
        etcd.remember_lease("docgen-1", 7);

        std::thread::scope(|scope| {
            let poisoner = scope.spawn(|| {
                let _guard = etcd.leases.lock().unwrap();
                panic!("poison lease table");
            });
            assert!(poisoner.join().is_err());
        });
        assert!(etcd.leases.is_poisoned());

        assert_eq!(etcd.lease_of("docgen-1"), Some(7));
        assert_eq!(etcd.forget_lease("docgen-1"), Some(7));
    }

    #[tokio::test]
    async fn test_heartbeat_without_registration_is_not_registered() {
        let etcd = EtcdDiscovery::new(
            vec!["http://127.0.0.1:1".to_string()],
            "dalvis",
            Duration::from_secs(30),
        );
        let instance =
            ServiceInstance::new("docgen-service", "docgen-1", "127.0.0.1:8081".parse().unwrap());
        assert!(matches!(
            etcd.heartbeat(&instance).await,
            Err(DiscoveryError::NotRegistered(_))
        ));
    }
}
