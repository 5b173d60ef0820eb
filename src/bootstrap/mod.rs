//! 服务启动器
//!
//! 负责一个服务实例的完整生命周期：
//! 1. 绑定监听端口并启动 HTTP 服务（健康检查在注册完成前返回 503）
//! 2. 按重试策略注册到注册中心
//! 3. 运行期间周期性心跳
//! 4. 收到停机信号后注销实例并在宽限时间内排空连接

mod lifecycle;

pub use lifecycle::BootstrapState;

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::BootstrapConfig;
use crate::discovery::{DiscoveryClient, build_service_instance, generate_instance_id};
use crate::error::{BootstrapError, Result};
use crate::metrics::BootstrapMetrics;
use crate::registry::ServiceRegistrar;
use crate::server::{HttpState, build_router};
use crate::shutdown::shutdown_signal;

type ServerTask = JoinHandle<io::Result<()>>;

/// 服务启动器
pub struct ServiceBootstrapper {
    config: BootstrapConfig,
    discovery: Arc<dyn DiscoveryClient>,
    state: watch::Sender<BootstrapState>,
    metrics: Arc<BootstrapMetrics>,
    router: Router,
}

impl ServiceBootstrapper {
    /// 创建启动器
    ///
    /// 未配置实例 ID 时在此生成，之后整个生命周期内保持不变
    pub fn new(mut config: BootstrapConfig, discovery: Arc<dyn DiscoveryClient>) -> Result<Self> {
        let instance_id = generate_instance_id(&config.service_name, config.instance_id.take());
        config.instance_id = Some(instance_id);

        let metrics = Arc::new(BootstrapMetrics::new(&config.service_name)?);
        metrics
            .bootstrap_state
            .set(BootstrapState::Starting.gauge_value());
        let (state, _) = watch::channel(BootstrapState::Starting);

        Ok(Self {
            config,
            discovery,
            state,
            metrics,
            router: Router::new(),
        })
    }

    /// 合并服务自定义路由
    pub fn with_router(mut self, router: Router) -> Self {
        self.router = self.router.merge(router);
        self
    }

    /// 订阅生命周期状态
    pub fn state_receiver(&self) -> watch::Receiver<BootstrapState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> BootstrapState {
        *self.state.borrow()
    }

    pub fn instance_id(&self) -> &str {
        self.config.instance_id.as_deref().unwrap_or_default()
    }

    pub fn config(&self) -> &BootstrapConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<BootstrapMetrics> {
        self.metrics.clone()
    }

    /// 运行直到收到 Ctrl-C / SIGTERM
    pub async fn start(self) -> Result<()> {
        self.run_until(shutdown_signal()).await
    }

    /// 运行完整生命周期，`shutdown` 完成时开始停机
    ///
    /// 启动失败（配置、端口、注册）时返回错误，状态为 `Failed`；
    /// 正常停机返回 `Ok(())`，状态为 `Terminated`
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let grace = self.config.shutdown_grace_period;
        info!(
            service = %self.config.service_name,
            version = %self.config.version,
            instance_id = %self.instance_id(),
            bind = %self.config.bind_address,
            backend = %self.config.backend,
            health_check_path = %self.config.health_check_path,
            "starting service"
        );

        // STARTING：绑定端口
        let listener = match TcpListener::bind(self.config.bind_address).await {
            Ok(listener) => listener,
            Err(source) => {
                return Err(self.fail(BootstrapError::Bind {
                    address: self.config.bind_address,
                    source,
                }));
            }
        };
        let bound = match listener.local_addr() {
            Ok(addr) => addr,
            Err(source) => {
                return Err(self.fail(BootstrapError::Bind {
                    address: self.config.bind_address,
                    source,
                }));
            }
        };
        info!(address = %bound, "listener bound");

        let instance = build_service_instance(&self.config, bound);
        let http_state = HttpState {
            service_name: self.config.service_name.clone(),
            instance_id: instance.instance_id.clone(),
            version: self.config.version.clone(),
            state: self.state.subscribe(),
            metrics: self.metrics.clone(),
        };
        let extra = std::mem::take(&mut self.router);
        let app = build_router(http_state, &self.config.health_check_path, extra);

        let (drain_tx, drain_rx) = oneshot::channel::<()>();
        let mut server: ServerTask = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = drain_rx.await;
                })
                .await
        });

        // REGISTERING
        self.transition(BootstrapState::Registering);
        let registrar = ServiceRegistrar::new(
            self.discovery.clone(),
            instance,
            self.config.registry.retry.clone(),
            self.config.registry.heartbeat_interval(),
            self.metrics.clone(),
        );

        tokio::pin!(shutdown);
        let registered = tokio::select! {
            outcome = registrar.register_with_retry() => Some(outcome),
            _ = &mut shutdown => None,
        };

        match registered {
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                let err = self.fail(err);
                if let Err(drain_err) = drain_server(server, drain_tx, grace).await {
                    warn!(error = %drain_err, "listener failed while stopping");
                }
                return Err(err);
            }
            None => {
                info!("shutdown requested during registration");
                self.transition(BootstrapState::ShuttingDown);
                // 注册请求可能已在注册中心生效
                registrar.deregister(grace).await;
                let drained = drain_server(server, drain_tx, grace).await;
                self.transition(BootstrapState::Terminated);
                return drained;
            }
        }

        // SERVING
        self.transition(BootstrapState::Serving);
        info!(
            service = %self.config.service_name,
            address = %registrar.instance().address,
            "service is serving"
        );
        let heartbeat = registrar.spawn_heartbeat();

        let server_exit = tokio::select! {
            _ = &mut shutdown => None,
            exit = &mut server => Some(exit),
        };

        // SHUTTING_DOWN
        self.transition(BootstrapState::ShuttingDown);
        heartbeat.stop(grace).await;
        registrar.deregister(grace).await;

        let result = match server_exit {
            None => drain_server(server, drain_tx, grace).await,
            Some(exit) => {
                let err = match exit {
                    Ok(Ok(())) => io::Error::other("listener stopped unexpectedly"),
                    Ok(Err(err)) => err,
                    Err(join_err) => io::Error::other(join_err),
                };
                error!(error = %err, "http listener exited while serving");
                Err(BootstrapError::Server(err))
            }
        };

        self.transition(BootstrapState::Terminated);
        info!(service = %self.config.service_name, "service stopped");
        result
    }

    fn transition(&self, next: BootstrapState) {
        let current = *self.state.borrow();
        if !current.can_transition_to(next) {
            warn!(from = %current, to = %next, "ignoring invalid state transition");
            return;
        }
        self.state.send_replace(next);
        self.metrics.bootstrap_state.set(next.gauge_value());
        info!(from = %current, to = %next, "bootstrap state changed");
    }

    fn fail(&self, err: BootstrapError) -> BootstrapError {
        error!(kind = err.kind(), error = %err, "bootstrap failed");
        self.transition(BootstrapState::Failed);
        err
    }
}

/// 通知 HTTP 服务停止接收新连接，并在宽限时间内等待其退出
async fn drain_server(
    mut server: ServerTask,
    drain_tx: oneshot::Sender<()>,
    grace: Duration,
) -> Result<()> {
    let _ = drain_tx.send(());
    match tokio::time::timeout(grace, &mut server).await {
        Ok(Ok(Ok(()))) => Ok(()),
        Ok(Ok(Err(err))) => Err(BootstrapError::Server(err)),
        Ok(Err(join_err)) => Err(BootstrapError::Server(io::Error::other(join_err))),
        Err(_) => {
            warn!(
                grace_ms = grace.as_millis() as u64,
                "connections still open after grace period, aborting listener"
            );
            server.abort();
            Ok(())
        }
    }
}
