//! 工具链错误类型与工具结果码
//!
//! ToolStatus 是 Tool 与 Manager 之间的结果契约：同步的配置/前置条件失败与异步的进程结束
//! 都会落到同一套结果码上，Manager 的推进逻辑因此与失败来源无关。

use serde::Serialize;
use thiserror::Error;

/// 工具结果码（Tool -> Manager）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ToolStatus {
    /// 已启动，等待 Launcher 的异步完成通知
    Running,
    Success,
    /// 成功，但不再输出完成提示（如 Sequence，子工具各自报告）
    Silent,
    Failed,
    /// 用户取消
    Aborted,
    ConfigureFailed,
    NoLauncherInstalled,
    NoValidSource,
    NoValidTarget,
    TargetHasWrongPermissions,
    NoValidPrereqs,
    SelfCheckFailed,
    CouldNotLaunch,
}

impl ToolStatus {
    /// Success / Silent：队列可以继续推进
    pub fn is_ok(self) -> bool {
        matches!(self, ToolStatus::Success | ToolStatus::Silent)
    }

    pub fn is_running(self) -> bool {
        self == ToolStatus::Running
    }
}

impl std::fmt::Display for ToolStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ToolStatus::Running => "running",
            ToolStatus::Success => "success",
            ToolStatus::Silent => "silent",
            ToolStatus::Failed => "failed",
            ToolStatus::Aborted => "aborted",
            ToolStatus::ConfigureFailed => "configure failed",
            ToolStatus::NoLauncherInstalled => "no launcher installed",
            ToolStatus::NoValidSource => "no valid source",
            ToolStatus::NoValidTarget => "no valid target",
            ToolStatus::TargetHasWrongPermissions => "target has wrong permissions",
            ToolStatus::NoValidPrereqs => "prerequisites not met",
            ToolStatus::SelfCheckFailed => "self-check failed",
            ToolStatus::CouldNotLaunch => "could not launch",
        };
        f.write_str(s)
    }
}

/// 配置与实例化阶段的错误（工具未定义、类名/启动方式未知等）
#[derive(Error, Debug)]
pub enum ToolchainError {
    #[error("Unknown tool {0}.")]
    UnknownTool(String),

    #[error("Unknown tool class '{class}' for tool {tool}.")]
    UnknownClass { tool: String, class: String },

    #[error("Can't find the tool {0} in the configuration database.")]
    MissingConfig(String),

    #[error("Unknown launcher type '{kind}' for tool {tool}.")]
    UnknownLauncher { tool: String, kind: String },

    #[error("Tool definition parse error: {0}")]
    Definitions(#[from] toml::de::Error),

    #[error("Cannot read tool definitions {path}: {source}")]
    DefinitionsIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Toolchain service has shut down")]
    ServiceClosed,
}

impl ToolchainError {
    /// 映射到结果码，供同步失败路径复用 Manager 的统一处理
    pub fn status(&self) -> ToolStatus {
        match self {
            ToolchainError::UnknownLauncher { .. } => ToolStatus::NoLauncherInstalled,
            _ => ToolStatus::ConfigureFailed,
        }
    }
}

/// Launcher 立即失败的原因（进程根本没有启动）
#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("No command configured")]
    EmptyCommand,

    #[error("Program '{0}' not found")]
    ProgramNotFound(String),

    #[error("Spawn failed: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("No viewer available for {0}")]
    ViewerUnavailable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ok_statuses() {
        assert!(ToolStatus::Success.is_ok());
        assert!(ToolStatus::Silent.is_ok());
        assert!(!ToolStatus::Aborted.is_ok());
        assert!(!ToolStatus::Running.is_ok());
        assert!(!ToolStatus::TargetHasWrongPermissions.is_ok());
    }

    #[test]
    fn test_error_status_mapping() {
        let e = ToolchainError::UnknownLauncher {
            tool: "LaTeX".into(),
            kind: "Telnet".into(),
        };
        assert_eq!(e.status(), ToolStatus::NoLauncherInstalled);
        assert_eq!(
            ToolchainError::UnknownTool("Foo".into()).to_string(),
            "Unknown tool Foo."
        );
    }
}
