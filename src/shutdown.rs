//! 优雅停机信号

use std::future::Future;

use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};

/// 等待停机信号（Ctrl-C 或 SIGTERM）
///
/// 信号处理器安装失败时只记录日志，对应的分支永不完成
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, initiating shutdown"),
        _ = terminate => info!("received SIGTERM, initiating shutdown"),
    }
}

/// 手动触发的停机开关，用于测试与嵌入场景
#[derive(Clone)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// 触发停机
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// 返回一个在触发后完成的 future
    pub fn wait(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.tx.subscribe();
        async move {
            // 发送端被释放时同样视为停机
            let _ = rx.wait_for(|triggered| *triggered).await;
        }
    }
}

impl Default for ShutdownTrigger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_trigger_completes_waiters() {
        let trigger = ShutdownTrigger::new();
        let first = tokio::spawn(trigger.wait());
        let second = tokio::spawn(trigger.wait());

        trigger.trigger();

        tokio::time::timeout(Duration::from_secs(1), async {
            first.await.unwrap();
            second.await.unwrap();
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_wait_after_trigger_is_immediate() {
        let trigger = ShutdownTrigger::new();
        trigger.trigger();
        tokio::time::timeout(Duration::from_millis(100), trigger.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_pending_until_triggered() {
        let trigger = ShutdownTrigger::new();
        assert!(
            tokio::time::timeout(Duration::from_millis(50), trigger.wait())
                .await
                .is_err()
        );
    }
}
