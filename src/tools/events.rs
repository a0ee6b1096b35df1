//! 工具链事件：日志面板、输出面板与宿主界面消费的只写事件流
//!
//! 事件可序列化为 JSON（CLI `--json` 逐行输出）。发送端是 broadcast，没有订阅者时静默丢弃。

use serde::Serialize;
use tokio::sync::broadcast;

use crate::core::ToolStatus;

/// 日志消息级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolchainEvent {
    /// 日志消息（附工具名）
    Message {
        severity: Severity,
        tool: String,
        text: String,
        /// 毫秒时间戳
        at: i64,
    },
    /// 进程的原始输出（流式，按行）
    Output { tool: String, text: String },
    /// 距上次运行超过清屏间隔，日志与输出面板应清空
    ClearLog,
    /// 全局「停止」按钮是否可用
    StopEnabled { enabled: bool },
    ToolStarted { tool: String },
    ToolFinished { tool: String, status: ToolStatus },
    /// 运行前请求保存所有打开的文档
    RequestSaveAll,
    /// 编译有错误且配置了 jumpToFirstError
    JumpToFirstError {
        tool: String,
        file: Option<String>,
        line: Option<usize>,
    },
}

/// 事件发送端的薄封装
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<ToolchainEvent>,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ToolchainEvent> {
        self.tx.subscribe()
    }

    pub fn sender(&self) -> broadcast::Sender<ToolchainEvent> {
        self.tx.clone()
    }

    pub fn emit(&self, event: ToolchainEvent) {
        let _ = self.tx.send(event);
    }

    pub fn message(&self, severity: Severity, tool: &str, text: impl Into<String>) {
        let text = text.into();
        match severity {
            Severity::Error => tracing::warn!(tool, "{}", text),
            _ => tracing::info!(tool, "{}", text),
        }
        self.emit(ToolchainEvent::Message {
            severity,
            tool: tool.to_string(),
            text,
            at: chrono::Utc::now().timestamp_millis(),
        });
    }

    pub fn output(&self, tool: &str, text: impl Into<String>) {
        self.emit(ToolchainEvent::Output {
            tool: tool.to_string(),
            text: text.into(),
        });
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_tagged() {
        let ev = ToolchainEvent::ToolFinished {
            tool: "LaTeX".into(),
            status: ToolStatus::Success,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "tool_finished");
        assert_eq!(json["status"], "Success");
    }

    #[tokio::test]
    async fn test_message_reaches_subscriber() {
        let sink = EventSink::default();
        let mut rx = sink.subscribe();
        sink.message(Severity::Info, "BibTeX", "Done!");
        match rx.recv().await.unwrap() {
            ToolchainEvent::Message { severity, tool, text, .. } => {
                assert_eq!(severity, Severity::Info);
                assert_eq!(tool, "BibTeX");
                assert_eq!(text, "Done!");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
