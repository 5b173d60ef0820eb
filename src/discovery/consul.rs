//! Consul 后端
//!
//! 通过本地 agent 的 HTTP API 注册，使用 TTL 健康检查作为心跳：
//! - 注册：`PUT /v1/agent/service/register`
//! - 心跳：`PUT /v1/agent/check/pass/service:{id}`
//! - 注销：`PUT /v1/agent/service/deregister/{id}`
//! - 发现：`GET /v1/health/service/{name}?passing=true`
//!
//! 多个端点按顺序尝试，直到某个端点给出 HTTP 响应。
//! 命名空间写入 `Meta.namespace`，发现时只返回同一命名空间的实例。

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use url::Url;

use super::{DiscoveryClient, ServiceInstance};
use crate::error::{DiscoveryError, DiscoveryResult};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const META_NAMESPACE: &str = "namespace";
const META_VERSION: &str = "version";
const META_HEALTH_CHECK_URL: &str = "health_check_url";
const META_INSTANCE_ID: &str = "instance_id";
const META_REGISTERED_AT: &str = "registered_at";

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct AgentServiceRegistration<'a> {
    #[serde(rename = "ID")]
    id: &'a str,
    name: &'a str,
    address: String,
    port: u16,
    tags: Vec<String>,
    meta: HashMap<String, String>,
    check: AgentServiceCheck,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct AgentServiceCheck {
    #[serde(rename = "CheckID")]
    check_id: String,
    name: String,
    notes: String,
    #[serde(rename = "TTL")]
    ttl: String,
    deregister_critical_service_after: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthServiceEntry {
    #[serde(default)]
    node: Option<HealthNode>,
    service: HealthService,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthNode {
    #[serde(default)]
    address: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthService {
    #[serde(rename = "ID")]
    id: String,
    service: String,
    #[serde(default)]
    address: String,
    port: u16,
    #[serde(default)]
    tags: Option<Vec<String>>,
    #[serde(default)]
    meta: Option<HashMap<String, String>>,
}

/// Consul 注册中心客户端
pub struct ConsulDiscovery {
    http: reqwest::Client,
    endpoints: Vec<Url>,
    namespace: String,
    ttl: Duration,
}

impl ConsulDiscovery {
    pub fn new(endpoints: &[String], ttl: Duration) -> DiscoveryResult<Self> {
        let endpoints = endpoints
            .iter()
            .map(|raw| {
                Url::parse(raw)
                    .map_err(|e| DiscoveryError::Unsupported(format!("invalid consul endpoint `{raw}`: {e}")))
            })
            .collect::<DiscoveryResult<Vec<_>>>()?;
        if endpoints.is_empty() {
            return Err(DiscoveryError::Unsupported(
                "consul requires at least one endpoint".to_string(),
            ));
        }

        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| DiscoveryError::Transport(e.to_string()))?;

        Ok(Self {
            http,
            endpoints,
            namespace: String::new(),
            ttl,
        })
    }

    /// 限定发现结果的命名空间
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    fn check_id(instance_id: &str) -> String {
        format!("service:{instance_id}")
    }

    /// 依次尝试各端点，返回第一个 HTTP 响应
    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&serde_json::Value>,
    ) -> DiscoveryResult<reqwest::Response> {
        let mut last_error = None;

        for endpoint in &self.endpoints {
            let url = endpoint
                .join(path)
                .map_err(|e| DiscoveryError::Unsupported(e.to_string()))?;
            let mut request = self.http.request(method.clone(), url).query(query);
            if let Some(body) = body {
                request = request.json(body);
            }

            match request.send().await {
                Ok(response) => return Ok(response),
                Err(err) => {
                    tracing::debug!(endpoint = %endpoint, error = %err, "consul endpoint unreachable");
                    last_error = Some(DiscoveryError::from(err));
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| DiscoveryError::Transport("no consul endpoint configured".to_string())))
    }

    async fn expect_success(response: reqwest::Response) -> DiscoveryResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(DiscoveryError::Status {
            code: status.as_u16(),
            body,
        })
    }

    fn registration_body(&self, instance: &ServiceInstance) -> DiscoveryResult<serde_json::Value> {
        let mut meta = HashMap::new();
        meta.insert(META_VERSION.to_string(), instance.version.clone());
        meta.insert(
            META_HEALTH_CHECK_URL.to_string(),
            instance.health_check_url.clone(),
        );
        meta.insert(META_INSTANCE_ID.to_string(), instance.instance_id.clone());
        if !instance.namespace.is_empty() {
            meta.insert(META_NAMESPACE.to_string(), instance.namespace.clone());
        }
        let registered_at = instance.registered_at.unwrap_or_else(Utc::now);
        meta.insert(META_REGISTERED_AT.to_string(), registered_at.to_rfc3339());

        let ttl_secs = self.ttl.as_secs().max(1);
        // Consul 要求自动清理时间不少于 1 分钟
        let deregister_after = (ttl_secs * 3).max(60);

        let registration = AgentServiceRegistration {
            id: &instance.instance_id,
            name: &instance.service_name,
            address: instance.address.ip().to_string(),
            port: instance.address.port(),
            tags: instance.tag_list(),
            meta,
            check: AgentServiceCheck {
                check_id: Self::check_id(&instance.instance_id),
                name: format!("{} heartbeat", instance.service_name),
                notes: format!("health endpoint: {}", instance.health_check_url),
                ttl: format!("{ttl_secs}s"),
                deregister_critical_service_after: format!("{deregister_after}s"),
            },
        };

        Ok(serde_json::to_value(registration)?)
    }

    fn to_instance(entry: HealthServiceEntry) -> DiscoveryResult<ServiceInstance> {
        let service = entry.service;
        let host = if service.address.is_empty() {
            entry.node.map(|node| node.address).unwrap_or_default()
        } else {
            service.address
        };
        let ip: IpAddr = host.parse().map_err(|_| {
            DiscoveryError::Decode(format!("instance `{}` has no usable address `{host}`", service.id))
        })?;
        let address = SocketAddr::new(ip, service.port);

        let meta = service.meta.unwrap_or_default();
        let tags = service
            .tags
            .unwrap_or_default()
            .into_iter()
            .filter_map(|tag| {
                tag.split_once('=')
                    .map(|(k, v)| (k.to_string(), v.to_string()))
            })
            .collect();

        let mut instance = ServiceInstance::new(service.service, service.id, address);
        instance.tags = tags;
        if let Some(url) = meta.get(META_HEALTH_CHECK_URL) {
            instance.health_check_url = url.clone();
        }
        if let Some(version) = meta.get(META_VERSION) {
            instance.version = version.clone();
        }
        if let Some(namespace) = meta.get(META_NAMESPACE) {
            instance.namespace = namespace.clone();
        }
        instance.registered_at = meta
            .get(META_REGISTERED_AT)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|at| at.with_timezone(&Utc));
        Ok(instance)
    }
}

#[async_trait]
impl DiscoveryClient for ConsulDiscovery {
    fn backend_name(&self) -> &'static str {
        "consul"
    }

    async fn register(&self, instance: &ServiceInstance) -> DiscoveryResult<()> {
        let body = self.registration_body(instance)?;
        let response = self
            .send(Method::PUT, "/v1/agent/service/register", &[], Some(&body))
            .await?;
        Self::expect_success(response).await?;

        // 注册后立即置为 passing，避免等待第一个心跳周期
        self.heartbeat(instance).await
    }

    async fn heartbeat(&self, instance: &ServiceInstance) -> DiscoveryResult<()> {
        let path = format!(
            "/v1/agent/check/pass/{}",
            Self::check_id(&instance.instance_id)
        );
        let response = self.send(Method::PUT, &path, &[], None).await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(DiscoveryError::NotRegistered(instance.instance_id.clone()));
        }
        match Self::expect_success(response).await {
            // 旧版本 agent 对未知 check 返回 500
            Err(DiscoveryError::Status { body, .. }) if body.contains("Unknown check") => {
                Err(DiscoveryError::NotRegistered(instance.instance_id.clone()))
            }
            other => other.map(|_| ()),
        }
    }

    async fn deregister(&self, instance: &ServiceInstance) -> DiscoveryResult<()> {
        let path = format!("/v1/agent/service/deregister/{}", instance.instance_id);
        let response = self.send(Method::PUT, &path, &[], None).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::expect_success(response).await.map(|_| ())
    }

    async fn discover(&self, service_name: &str) -> DiscoveryResult<Vec<ServiceInstance>> {
        let path = format!("/v1/health/service/{service_name}");
        let response = self
            .send(Method::GET, &path, &[("passing", "true")], None)
            .await?;
        let entries: Vec<HealthServiceEntry> = Self::expect_success(response).await?.json().await?;

        let mut instances = Vec::with_capacity(entries.len());
        for entry in entries {
            match Self::to_instance(entry) {
                Ok(instance) if instance.namespace == self.namespace => instances.push(instance),
                Ok(_) => {}
                Err(err) => tracing::warn!(service = %service_name, error = %err, "skipping consul entry"),
            }
        }
        instances.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        Ok(instances)
    }
}
