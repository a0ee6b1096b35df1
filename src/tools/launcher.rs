//! Launcher：真正启动一次工作单元（子进程 / 终端中的子进程 / 内嵌查看器）
//!
//! `launch` 立即返回；输出与完成通知通过 `LaunchSender` 异步送回 Manager 的控制循环。
//! 返回 Err 只表示「根本没能启动」，此时由 `self_check` 区分是程序缺失还是启动后立即崩溃。

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::{LaunchError, ToolStatus};
use crate::host::ViewerHost;
use crate::tools::dict::{shell_quote, ParamDict};
use crate::tools::events::Severity;
use crate::tools::store::ToolConfig;
use crate::tools::tool::ToolId;

/// 未配置 `terminal` 时的终端前缀
pub const DEFAULT_TERMINAL: &str = "konsole --noclose -e";

/// Launcher -> Manager 的异步通知
#[derive(Debug, Clone)]
pub struct LaunchEvent {
    pub tool_id: ToolId,
    pub kind: LaunchEventKind,
}

#[derive(Debug, Clone)]
pub enum LaunchEventKind {
    /// 一行原始输出
    Output(String),
    Message(Severity, String),
    /// 工作单元结束（每次 launch 恰好一次）
    Finished(ToolStatus),
}

pub type LaunchSender = mpsc::UnboundedSender<LaunchEvent>;

/// 一次启动所需的全部输入，由 Tool 在前置条件全部通过后构造
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub tool_id: ToolId,
    pub tool_name: String,
    /// 进程工作目录（目标目录）
    pub working_dir: PathBuf,
    /// 目标文件的绝对路径（查看器打开它）
    pub target: PathBuf,
    pub dict: ParamDict,
    pub config: ToolConfig,
    /// 查看器出队后在后台运行，texchain 退出时不随之结束
    pub detach: bool,
}

impl LaunchSpec {
    fn event(&self, kind: LaunchEventKind) -> LaunchEvent {
        LaunchEvent {
            tool_id: self.tool_id,
            kind,
        }
    }
}

/// 启动策略
pub trait Launcher: Send {
    fn launch(&mut self, spec: LaunchSpec, tx: LaunchSender) -> Result<(), LaunchError>;
    /// 协作式终止；没有在运行的工作单元时什么也不做
    fn kill(&mut self);
    fn self_check(&self) -> bool;
}

/// 配置中 `type` 键的取值
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LauncherKind {
    Process,
    Konsole,
    Part,
    DocPart,
}

impl FromStr for LauncherKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Process" => Ok(LauncherKind::Process),
            "Konsole" => Ok(LauncherKind::Konsole),
            "Part" => Ok(LauncherKind::Part),
            "DocPart" => Ok(LauncherKind::DocPart),
            other => Err(format!("unknown launcher type '{}'", other)),
        }
    }
}

/// 按 `type` 字符串创建 Launcher；测试可替换为脚本化实现
pub trait LauncherFactory: Send + Sync {
    fn supports(&self, kind: &str) -> bool;
    fn create(&self, kind: &str, config: &ToolConfig) -> Option<Box<dyn Launcher>>;
}

/// 标准四种 Launcher
pub struct StandardLaunchers {
    viewer: Arc<dyn ViewerHost>,
    terminal: String,
}

impl StandardLaunchers {
    pub fn new(viewer: Arc<dyn ViewerHost>) -> Self {
        Self {
            viewer,
            terminal: DEFAULT_TERMINAL.to_string(),
        }
    }

    pub fn with_terminal(mut self, terminal: impl Into<String>) -> Self {
        self.terminal = terminal.into();
        self
    }
}

impl LauncherFactory for StandardLaunchers {
    fn supports(&self, kind: &str) -> bool {
        kind.parse::<LauncherKind>().is_ok()
    }

    fn create(&self, kind: &str, config: &ToolConfig) -> Option<Box<dyn Launcher>> {
        let launcher: Box<dyn Launcher> = match kind.parse::<LauncherKind>().ok()? {
            LauncherKind::Process => Box::new(ProcessLauncher::new()),
            LauncherKind::Konsole => {
                let terminal = config
                    .get("terminal")
                    .filter(|t| !t.trim().is_empty())
                    .cloned()
                    .unwrap_or_else(|| self.terminal.clone());
                Box::new(ProcessLauncher::in_terminal(terminal))
            }
            LauncherKind::Part => Box::new(PartLauncher::new(Arc::clone(&self.viewer))),
            LauncherKind::DocPart => Box::new(DocPartLauncher::new(Arc::clone(&self.viewer))),
        };
        Some(launcher)
    }
}

/// 外部进程（可选包在终端命令里）
#[derive(Debug, Default)]
pub struct ProcessLauncher {
    terminal: Option<String>,
    program: Option<String>,
    working_dir: PathBuf,
    cancel: Option<CancellationToken>,
}

impl ProcessLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_terminal(terminal: impl Into<String>) -> Self {
        Self {
            terminal: Some(terminal.into()),
            ..Self::default()
        }
    }

    /// 展开后的完整命令行：`command` 后接 `%options`（除非 command 自己引用了它）
    pub fn command_line(&self, spec: &LaunchSpec) -> Result<String, LaunchError> {
        let command = spec
            .config
            .get("command")
            .map(|c| c.trim())
            .filter(|c| !c.is_empty())
            .ok_or(LaunchError::EmptyCommand)?;
        let template = if command.contains("%options") {
            command.to_string()
        } else {
            format!("{} %options", command)
        };
        let line = spec.dict.expand_for_shell(&template);
        let line = line.trim().to_string();
        Ok(match &self.terminal {
            Some(terminal) => format!("{} sh -c {}", terminal, shell_quote(&line)),
            None => line,
        })
    }
}

impl Launcher for ProcessLauncher {
    fn launch(&mut self, spec: LaunchSpec, tx: LaunchSender) -> Result<(), LaunchError> {
        let line = self.command_line(&spec)?;
        let program = line
            .split_whitespace()
            .next()
            .ok_or(LaunchError::EmptyCommand)?
            .to_string();
        self.program = Some(program.clone());
        self.working_dir = spec.working_dir.clone();
        if find_program(&program, &spec.working_dir).is_none() {
            return Err(LaunchError::ProgramNotFound(program));
        }

        tracing::info!(tool = %spec.tool_name, dir = %spec.working_dir.display(), command = %line, "launch process");
        let _ = tx.send(spec.event(LaunchEventKind::Message(
            Severity::Info,
            format!("Launching: {}", line),
        )));

        let mut cmd = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", &line]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", &line]);
            c
        };
        let mut child = cmd
            .current_dir(&spec.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(!spec.detach)
            .spawn()?;

        let token = CancellationToken::new();
        self.cancel = Some(token.clone());

        let stdout = child.stdout.take().map(|s| forward_lines(s, &spec, tx.clone()));
        let stderr = child.stderr.take().map(|s| forward_lines(s, &spec, tx.clone()));

        tokio::spawn(async move {
            let status = tokio::select! {
                res = child.wait() => match res {
                    Ok(exit) if exit.success() => ToolStatus::Success,
                    Ok(exit) => {
                        let text = match exit.code() {
                            Some(code) => format!("Process exited with code {}.", code),
                            None => "Process was terminated by a signal.".to_string(),
                        };
                        let _ = tx.send(spec.event(LaunchEventKind::Message(Severity::Error, text)));
                        ToolStatus::Failed
                    }
                    Err(e) => {
                        let _ = tx.send(spec.event(LaunchEventKind::Message(
                            Severity::Error,
                            format!("Waiting for the process failed: {}", e),
                        )));
                        ToolStatus::Failed
                    }
                },
                _ = token.cancelled() => {
                    if let Err(e) = child.kill().await {
                        tracing::warn!(tool = %spec.tool_name, "kill failed: {}", e);
                    }
                    ToolStatus::Aborted
                }
            };
            // 先把剩余输出送完，再报告结束
            for handle in [stdout, stderr].into_iter().flatten() {
                let _ = handle.await;
            }
            tracing::debug!(tool = %spec.tool_name, %status, "process finished");
            let _ = tx.send(spec.event(LaunchEventKind::Finished(status)));
        });
        Ok(())
    }

    fn kill(&mut self) {
        if let Some(token) = &self.cancel {
            token.cancel();
        }
    }

    fn self_check(&self) -> bool {
        self.program
            .as_deref()
            .map_or(false, |p| find_program(p, &self.working_dir).is_some())
    }
}

fn forward_lines<R>(reader: R, spec: &LaunchSpec, tx: LaunchSender) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let tool_id = spec.tool_id;
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let _ = tx.send(LaunchEvent {
                tool_id,
                kind: LaunchEventKind::Output(line),
            });
        }
    })
}

/// 在 PATH 中查找可执行程序；含路径分隔符时相对 `working_dir` 解析
pub fn find_program(program: &str, working_dir: &Path) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        let path = working_dir.join(candidate);
        return is_executable(&path).then_some(path);
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|p| is_executable(p))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use nix::unistd::{access, AccessFlags};
    path.is_file() && access(path, AccessFlags::X_OK).is_ok()
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// 内嵌查看器组件（按库名/类名加载）
pub struct PartLauncher {
    viewer: Arc<dyn ViewerHost>,
}

impl PartLauncher {
    pub fn new(viewer: Arc<dyn ViewerHost>) -> Self {
        Self { viewer }
    }
}

impl Launcher for PartLauncher {
    fn launch(&mut self, spec: LaunchSpec, tx: LaunchSender) -> Result<(), LaunchError> {
        let lib = spec.config.get("libName").map(String::as_str).unwrap_or("");
        let class = spec.config.get("className").map(String::as_str).unwrap_or("");
        self.viewer.open_part(lib, class, &spec.target)?;
        tracing::info!(tool = %spec.tool_name, target = %spec.target.display(), "opened viewer part");
        let _ = tx.send(spec.event(LaunchEventKind::Finished(ToolStatus::Success)));
        Ok(())
    }

    fn kill(&mut self) {}

    fn self_check(&self) -> bool {
        self.viewer.is_available()
    }
}

/// 在文档区打开的查看器
pub struct DocPartLauncher {
    viewer: Arc<dyn ViewerHost>,
}

impl DocPartLauncher {
    pub fn new(viewer: Arc<dyn ViewerHost>) -> Self {
        Self { viewer }
    }
}

impl Launcher for DocPartLauncher {
    fn launch(&mut self, spec: LaunchSpec, tx: LaunchSender) -> Result<(), LaunchError> {
        self.viewer.open_document(&spec.target)?;
        tracing::info!(tool = %spec.tool_name, target = %spec.target.display(), "opened document view");
        let _ = tx.send(spec.event(LaunchEventKind::Finished(ToolStatus::Success)));
        Ok(())
    }

    fn kill(&mut self) {}

    fn self_check(&self) -> bool {
        self.viewer.is_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HeadlessViewerHost;

    fn spec(dir: &Path, command: &str, options: &str) -> LaunchSpec {
        let mut config = ToolConfig::new();
        config.insert("command".into(), command.into());
        let mut dict = ParamDict::new();
        dict.set("%source", "my paper.tex");
        dict.set_raw("%options", options);
        LaunchSpec {
            tool_id: ToolId::next(),
            tool_name: "Test".into(),
            working_dir: dir.to_path_buf(),
            target: dir.join("out.pdf"),
            dict,
            config,
            detach: false,
        }
    }

    async fn collect(mut rx: mpsc::UnboundedReceiver<LaunchEvent>) -> (Vec<String>, ToolStatus) {
        let mut lines = Vec::new();
        while let Some(ev) = rx.recv().await {
            match ev.kind {
                LaunchEventKind::Output(line) => lines.push(line),
                LaunchEventKind::Message(..) => {}
                LaunchEventKind::Finished(status) => return (lines, status),
            }
        }
        panic!("launcher never finished");
    }

    #[test]
    fn test_launcher_kind_from_str() {
        assert_eq!("Konsole".parse::<LauncherKind>().unwrap(), LauncherKind::Konsole);
        assert!("Telnet".parse::<LauncherKind>().is_err());
    }

    #[test]
    fn test_command_line_appends_options() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = ProcessLauncher::new();
        let s = spec(dir.path(), "latex", "-interaction=nonstopmode 'my paper.tex'");
        assert_eq!(
            launcher.command_line(&s).unwrap(),
            "latex -interaction=nonstopmode 'my paper.tex'"
        );
        let s = spec(dir.path(), "cat %source %options", "-n");
        assert_eq!(launcher.command_line(&s).unwrap(), "cat 'my paper.tex' -n");
    }

    #[test]
    fn test_terminal_wraps_command() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = ProcessLauncher::in_terminal("xterm -e");
        let s = spec(dir.path(), "latex", "x.tex");
        assert_eq!(launcher.command_line(&s).unwrap(), "xterm -e sh -c 'latex x.tex'");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_streams_output_and_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut launcher = ProcessLauncher::new();
        launcher
            .launch(spec(dir.path(), "echo", "one; echo two"), tx)
            .unwrap();
        let (lines, status) = collect(rx).await;
        assert_eq!(status, ToolStatus::Success);
        assert_eq!(lines, vec!["one", "two"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_failed() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut launcher = ProcessLauncher::new();
        launcher.launch(spec(dir.path(), "false", ""), tx).unwrap();
        let (_, status) = collect(rx).await;
        assert_eq!(status, ToolStatus::Failed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_kill_reports_aborted() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut launcher = ProcessLauncher::new();
        launcher.launch(spec(dir.path(), "sleep", "30"), tx).unwrap();
        launcher.kill();
        let (_, status) = collect(rx).await;
        assert_eq!(status, ToolStatus::Aborted);
    }

    #[test]
    fn test_missing_program_fails_self_check() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut launcher = ProcessLauncher::new();
        let err = launcher
            .launch(spec(dir.path(), "definitely-not-a-tex-binary", ""), tx)
            .unwrap_err();
        assert!(matches!(err, LaunchError::ProgramNotFound(_)));
        assert!(!launcher.self_check());
        launcher.kill();
    }

    #[cfg(unix)]
    #[test]
    fn test_find_program_resolves_against_working_dir() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("build.sh");
        std::fs::write(&script, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o644)).unwrap();
        assert!(find_program("./build.sh", dir.path()).is_none());

        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        assert_eq!(find_program("./build.sh", dir.path()), Some(dir.path().join("./build.sh")));
        assert!(find_program("sh", dir.path()).is_some());
    }

    /// 读取 /proc/<pid>/stat 的状态字段；进程不存在时为 None
    #[cfg(target_os = "linux")]
    fn process_state(pid: i32) -> Option<char> {
        let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
        let (_, rest) = stat.rsplit_once(')')?;
        rest.trim_start().chars().next()
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_detached_viewer_outlives_runtime() {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("pid");
        let mut s = spec(dir.path(), "echo", "$$ > pid; exec sleep 30");
        s.detach = true;

        let runtime = tokio::runtime::Runtime::new().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut launcher = ProcessLauncher::new();
        runtime.block_on(async {
            launcher.launch(s, tx).unwrap();
            for _ in 0..100 {
                if std::fs::read_to_string(&pid_file).map_or(false, |p| p.ends_with('\n')) {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            }
        });
        let pid: i32 = std::fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
        drop(runtime);
        std::thread::sleep(std::time::Duration::from_millis(100));

        let state = process_state(pid);
        let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
        assert!(matches!(state, Some(c) if c != 'Z'), "viewer state after exit: {:?}", state);
    }

    #[test]
    fn test_headless_part_refuses() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut launcher = PartLauncher::new(Arc::new(HeadlessViewerHost));
        assert!(launcher.launch(spec(dir.path(), "", ""), tx).is_err());
        assert!(!launcher.self_check());
    }
}
