//! 工具链服务：把 Manager 放进单个 tokio 任务，作为唯一的控制线程
//!
//! 命令（Run / Stop / Quit）与 Launcher 通知在同一个 `select!` 循环中串行处理，
//! 因此队列与工具状态不存在并发修改。

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::core::ToolchainError;
use crate::tools::events::ToolchainEvent;
use crate::tools::manager::Manager;
use crate::tools::tool::ToolId;

/// 发往控制循环的命令
#[derive(Debug)]
pub enum ToolchainCommand {
    Run {
        tool: String,
        variant: Option<String>,
        reply: oneshot::Sender<Result<ToolId, ToolchainError>>,
    },
    /// 停止当前队头
    Stop,
    /// 停止并退出控制循环
    Quit,
}

/// 控制循环的句柄
#[derive(Clone)]
pub struct ToolchainHandle {
    cmd_tx: mpsc::UnboundedSender<ToolchainCommand>,
    idle_rx: watch::Receiver<bool>,
    events: broadcast::Sender<ToolchainEvent>,
}

impl ToolchainHandle {
    pub async fn run(&self, tool: &str, variant: Option<&str>) -> Result<ToolId, ToolchainError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(ToolchainCommand::Run {
                tool: tool.to_string(),
                variant: variant.map(str::to_string),
                reply,
            })
            .map_err(|_| ToolchainError::ServiceClosed)?;
        rx.await.map_err(|_| ToolchainError::ServiceClosed)?
    }

    pub fn stop(&self) -> Result<(), ToolchainError> {
        self.cmd_tx
            .send(ToolchainCommand::Stop)
            .map_err(|_| ToolchainError::ServiceClosed)
    }

    pub fn quit(&self) {
        let _ = self.cmd_tx.send(ToolchainCommand::Quit);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ToolchainEvent> {
        self.events.subscribe()
    }

    pub fn is_idle(&self) -> bool {
        *self.idle_rx.borrow()
    }

    /// 等待队列清空
    pub async fn wait_idle(&self) -> Result<(), ToolchainError> {
        let mut rx = self.idle_rx.clone();
        rx.wait_for(|idle| *idle)
            .await
            .map(|_| ())
            .map_err(|_| ToolchainError::ServiceClosed)
    }
}

pub struct ToolchainService;

impl ToolchainService {
    /// 在后台任务中运行 Manager
    pub fn spawn(mut manager: Manager) -> (ToolchainHandle, JoinHandle<()>) {
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
        let (idle_tx, idle_rx) = watch::channel(manager.is_idle());
        let handle = ToolchainHandle {
            cmd_tx,
            idle_rx,
            events: manager.events().sender(),
        };

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    cmd = cmd_rx.recv() => match cmd {
                        Some(ToolchainCommand::Run { tool, variant, reply }) => {
                            let result = manager.run(&tool, variant.as_deref());
                            // 先更新空闲状态再回复，调用方随后的 wait_idle 才不会看到旧值
                            idle_tx.send_replace(manager.is_idle());
                            let _ = reply.send(result);
                        }
                        Some(ToolchainCommand::Stop) => manager.stop(),
                        Some(ToolchainCommand::Quit) | None => {
                            manager.stop();
                            tracing::debug!("toolchain service exiting");
                            break;
                        }
                    },
                    Some(event) = manager.recv_launch_event() => manager.handle(event),
                }
                idle_tx.send_replace(manager.is_idle());
            }
        });
        (handle, task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::core::ToolStatus;
    use crate::host::AutoConfirm;
    use crate::tools::manager::ManagerBuilder;
    use crate::tools::store::ToolConfigStore;
    use crate::tools::testing::{MemoryDocumentModel, ScriptedLaunchers, Step};

    #[tokio::test]
    async fn test_service_runs_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let launchers = Arc::new(ScriptedLaunchers::new());
        launchers.script("BibTeX", Step::Hold);
        let manager = ManagerBuilder::new(ToolConfigStore::standard().unwrap())
            .with_documents(Arc::new(MemoryDocumentModel::with_root(dir.path(), "paper")))
            .with_launchers(launchers.clone())
            .with_prompt(Arc::new(AutoConfirm(true)))
            .build();
        let (handle, task) = ToolchainService::spawn(manager);
        let mut events = handle.subscribe();

        handle.run("BibTeX", None).await.unwrap();
        assert!(!handle.is_idle());
        handle.stop().unwrap();
        handle.wait_idle().await.unwrap();

        let mut finished = None;
        while let Ok(ev) = events.try_recv() {
            if let ToolchainEvent::ToolFinished { status, .. } = ev {
                finished = Some(status);
            }
        }
        assert_eq!(finished, Some(ToolStatus::Aborted));

        assert!(handle.run("Nope", None).await.is_err());
        handle.quit();
        task.await.unwrap();
    }
}
