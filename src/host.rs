//! 宿主界面协作者：确认对话框、列表选择与内嵌查看器
//!
//! 核心不依赖任何 GUI；CLI 用终端提问或 `--yes` 自动确认，查看器默认不可用。

use std::io::{BufRead, Write};
use std::path::Path;

use crate::core::LaunchError;

/// 「是否继续？」类确认与多选一
pub trait UserPrompt: Send + Sync {
    fn confirm(&self, question: &str, caption: &str) -> bool;
    /// 返回所选项的下标；取消时为 None
    fn choose(&self, items: &[String], caption: &str) -> Option<usize>;
}

/// 固定回答
#[derive(Debug, Clone, Copy)]
pub struct AutoConfirm(pub bool);

impl UserPrompt for AutoConfirm {
    fn confirm(&self, question: &str, caption: &str) -> bool {
        tracing::debug!(caption, question, answer = self.0, "auto confirm");
        self.0
    }

    /// 肯定回答时取第一项
    fn choose(&self, items: &[String], caption: &str) -> Option<usize> {
        tracing::debug!(caption, count = items.len(), answer = self.0, "auto choose");
        (self.0 && !items.is_empty()).then_some(0)
    }
}

/// 在终端上询问 y/N
#[derive(Debug, Default)]
pub struct TerminalPrompt;

impl TerminalPrompt {
    /// 在 stderr 上提问并读一行回答
    fn ask(&self, question: &str) -> Option<String> {
        let ask = || {
            let mut stderr = std::io::stderr();
            let _ = write!(stderr, "{}", question);
            let _ = stderr.flush();
            let mut answer = String::new();
            match std::io::stdin().lock().read_line(&mut answer) {
                Ok(_) => Some(answer.trim().to_string()),
                Err(e) => {
                    tracing::warn!("reading answer failed: {}", e);
                    None
                }
            }
        };
        // 控制循环运行在多线程运行时中，阻塞读取前让出工作线程
        match tokio::runtime::Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == tokio::runtime::RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(ask)
            }
            _ => ask(),
        }
    }
}

impl UserPrompt for TerminalPrompt {
    fn confirm(&self, question: &str, caption: &str) -> bool {
        self.ask(&format!("{}: {} [y/N] ", caption, question))
            .map_or(false, |a| matches!(a.as_str(), "y" | "Y" | "yes" | "Yes"))
    }

    fn choose(&self, items: &[String], caption: &str) -> Option<usize> {
        let mut question = format!("{}:\n", caption);
        for (i, item) in items.iter().enumerate() {
            question.push_str(&format!("  {}) {}\n", i + 1, item));
        }
        question.push_str(&format!("[1-{}, empty to cancel] ", items.len()));
        parse_choice(&self.ask(&question)?, items.len())
    }
}

/// 1 起始的编号转为下标；越界或无法解析时为 None
fn parse_choice(answer: &str, count: usize) -> Option<usize> {
    match answer.trim().parse::<usize>() {
        Ok(n) if (1..=count).contains(&n) => Some(n - 1),
        _ => None,
    }
}

/// 内嵌查看器宿主（Part / DocPart Launcher 使用）
pub trait ViewerHost: Send + Sync {
    /// 以组件库名与类名加载查看器组件并打开目标
    fn open_part(&self, lib: &str, class: &str, target: &Path) -> Result<(), LaunchError>;
    /// 在文档区打开目标
    fn open_document(&self, target: &Path) -> Result<(), LaunchError>;
    fn is_available(&self) -> bool;
}

/// 无界面宿主：一律拒绝
#[derive(Debug, Default, Clone, Copy)]
pub struct HeadlessViewerHost;

impl ViewerHost for HeadlessViewerHost {
    fn open_part(&self, lib: &str, class: &str, target: &Path) -> Result<(), LaunchError> {
        Err(LaunchError::ViewerUnavailable(format!(
            "{} ({}::{})",
            target.display(),
            lib,
            class
        )))
    }

    fn open_document(&self, target: &Path) -> Result<(), LaunchError> {
        Err(LaunchError::ViewerUnavailable(target.display().to_string()))
    }

    fn is_available(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_confirm() {
        assert!(AutoConfirm(true).confirm("Continue?", "Continue?"));
        assert!(!AutoConfirm(false).confirm("Continue?", "Continue?"));
    }

    #[test]
    fn test_auto_choose() {
        let bibs = vec!["refs".to_string(), "extra".to_string()];
        assert_eq!(AutoConfirm(true).choose(&bibs, "Select a bibliography"), Some(0));
        assert_eq!(AutoConfirm(false).choose(&bibs, "Select a bibliography"), None);
        assert_eq!(AutoConfirm(true).choose(&[], "Select a bibliography"), None);
    }

    #[test]
    fn test_parse_choice() {
        assert_eq!(parse_choice("2", 3), Some(1));
        assert_eq!(parse_choice(" 1\n", 3), Some(0));
        assert_eq!(parse_choice("0", 3), None);
        assert_eq!(parse_choice("4", 3), None);
        assert_eq!(parse_choice("", 3), None);
    }

    #[test]
    fn test_headless_viewer_refuses() {
        let host = HeadlessViewerHost;
        assert!(!host.is_available());
        assert!(host.open_document(Path::new("/tmp/x.pdf")).is_err());
    }
}
