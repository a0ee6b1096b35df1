//! 关闭信号处理
//!
//! Ctrl+C / SIGTERM 只触发一次 token；CLI 据此向 Manager 发送 stop，
//! 让当前队头的进程被协作式终止，而不是直接杀掉整个进程组。
//! 第一个信号决定关闭原因，进程按惯例以 128 + 信号值退出。

use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;

/// 关闭原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM
    Signal,
}

impl ShutdownReason {
    /// 按 shell 惯例的退出码：SIGINT 130，SIGTERM 143
    pub fn exit_code(self) -> u8 {
        match self {
            ShutdownReason::UserInitiated => 130,
            ShutdownReason::Signal => 143,
        }
    }
}

/// 关闭信号管理器
#[derive(Debug, Default)]
pub struct ShutdownManager {
    shutdown_token: CancellationToken,
    reason: OnceLock<ShutdownReason>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 触发关闭；只记录第一次的原因
    pub fn shutdown(&self, reason: ShutdownReason) {
        if self.reason.set(reason).is_err() {
            tracing::debug!(?reason, "shutdown already requested");
        }
        self.shutdown_token.cancel();
    }

    /// 尚未关闭时为 None
    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.get().copied()
    }

    pub async fn wait_for_shutdown(&self) {
        self.shutdown_token.cancelled().await;
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received Ctrl+C, stopping the running tool chain");
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, stopping the running tool chain");
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_manager_new() {
        let manager = ShutdownManager::new();
        assert_eq!(manager.reason(), None);
    }

    #[tokio::test]
    async fn test_first_reason_wins() {
        let manager = ShutdownManager::new();
        manager.shutdown(ShutdownReason::Signal);
        manager.shutdown(ShutdownReason::UserInitiated);
        manager.wait_for_shutdown().await;
        assert_eq!(manager.reason(), Some(ShutdownReason::Signal));
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(ShutdownReason::UserInitiated.exit_code(), 130);
        assert_eq!(ShutdownReason::Signal.exit_code(), 143);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sigterm_sets_reason() {
        use nix::sys::signal::{raise, Signal};

        let manager = Arc::new(ShutdownManager::new());
        manager.install_signal_handlers();
        // 等信号处理器注册完成
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        raise(Signal::SIGTERM).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), manager.wait_for_shutdown())
            .await
            .unwrap();
        assert_eq!(manager.reason(), Some(ShutdownReason::Signal));
    }
}
