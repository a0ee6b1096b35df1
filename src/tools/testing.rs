//! 测试替身：脚本化 Launcher 与内存文档模型
//!
//! 不调用真实的 TeX 程序：每次启动按工具名取出下一步脚本（结束码 / 挂起 / 拒绝启动），
//! 并可在启动时写入文件（如编译日志），以驱动完整的队列与重跑逻辑。

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use crate::core::{LaunchError, ToolStatus};
use crate::document::{CompileTarget, DocumentModel};
use crate::tools::launcher::{
    LaunchEvent, LaunchEventKind, LaunchSender, LaunchSpec, Launcher, LauncherFactory,
    LauncherKind,
};
use crate::tools::store::ToolConfig;
use crate::tools::tool::ToolId;

/// 一次启动的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// 立即以该结果结束
    Finish(ToolStatus),
    /// 一直运行，直到被 kill（报告 Aborted）
    Hold,
    /// launch 直接失败，self_check 也失败
    Refuse,
}

#[derive(Debug, Clone)]
struct Run {
    step: Step,
    /// (路径模板, 内容)，路径经参数字典展开
    writes: Vec<(String, String)>,
}

/// 一次启动的记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub tool: String,
    pub source: Option<String>,
    pub target: PathBuf,
    /// 启动时参数字典中的 `%target`（正向搜索会改写它）
    pub target_param: Option<String>,
}

#[derive(Debug, Default)]
struct Script {
    runs: HashMap<String, VecDeque<Run>>,
    invocations: Vec<Invocation>,
}

/// 脚本化 LauncherFactory；没有脚本的工具以 Success 结束
#[derive(Debug, Default, Clone)]
pub struct ScriptedLaunchers {
    script: Arc<Mutex<Script>>,
}

fn lock(script: &Mutex<Script>) -> MutexGuard<'_, Script> {
    script.lock().unwrap_or_else(|e| e.into_inner())
}

impl ScriptedLaunchers {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为工具的下一次启动追加一步
    pub fn script(&self, tool: &str, step: Step) {
        self.script_writes(tool, step, &[]);
    }

    /// 同 `script`，并在启动时写入文件
    pub fn script_writes(&self, tool: &str, step: Step, writes: &[(&str, &str)]) {
        let run = Run {
            step,
            writes: writes
                .iter()
                .map(|(p, c)| (p.to_string(), c.to_string()))
                .collect(),
        };
        lock(&self.script)
            .runs
            .entry(tool.to_string())
            .or_default()
            .push_back(run);
    }

    /// 被启动过的工具名，按启动顺序
    pub fn invocations(&self) -> Vec<String> {
        lock(&self.script)
            .invocations
            .iter()
            .map(|i| i.tool.clone())
            .collect()
    }

    pub fn invocation_details(&self) -> Vec<Invocation> {
        lock(&self.script).invocations.clone()
    }
}

impl LauncherFactory for ScriptedLaunchers {
    fn supports(&self, kind: &str) -> bool {
        kind.parse::<LauncherKind>().is_ok()
    }

    fn create(&self, kind: &str, _config: &ToolConfig) -> Option<Box<dyn Launcher>> {
        kind.parse::<LauncherKind>().ok()?;
        Some(Box::new(ScriptedLauncher {
            script: Arc::clone(&self.script),
            held: None,
            refused: false,
        }))
    }
}

struct ScriptedLauncher {
    script: Arc<Mutex<Script>>,
    held: Option<(ToolId, LaunchSender)>,
    refused: bool,
}

impl Launcher for ScriptedLauncher {
    fn launch(&mut self, spec: LaunchSpec, tx: LaunchSender) -> Result<(), LaunchError> {
        let run = {
            let mut script = lock(&self.script);
            script.invocations.push(Invocation {
                tool: spec.tool_name.clone(),
                source: spec.dict.get("%source").map(str::to_string),
                target: spec.target.clone(),
                target_param: spec.dict.get("%target").map(str::to_string),
            });
            script
                .runs
                .get_mut(&spec.tool_name)
                .and_then(VecDeque::pop_front)
                .unwrap_or(Run {
                    step: Step::Finish(ToolStatus::Success),
                    writes: Vec::new(),
                })
        };

        for (template, content) in &run.writes {
            let path = spec.working_dir.join(spec.dict.expand(template));
            std::fs::write(&path, content)?;
        }

        let send = |kind| {
            let _ = tx.send(LaunchEvent {
                tool_id: spec.tool_id,
                kind,
            });
        };
        match run.step {
            Step::Finish(status) => {
                send(LaunchEventKind::Output(format!("scripted {}", spec.tool_name)));
                send(LaunchEventKind::Finished(status));
            }
            Step::Hold => self.held = Some((spec.tool_id, tx.clone())),
            Step::Refuse => {
                self.refused = true;
                return Err(LaunchError::ProgramNotFound(spec.tool_name.clone()));
            }
        }
        Ok(())
    }

    fn kill(&mut self) {
        if let Some((tool_id, tx)) = self.held.take() {
            let _ = tx.send(LaunchEvent {
                tool_id,
                kind: LaunchEventKind::Finished(ToolStatus::Aborted),
            });
        }
    }

    fn self_check(&self) -> bool {
        !self.refused
    }
}

/// 内存文档模型
#[derive(Debug, Clone, Default)]
pub struct MemoryDocumentModel {
    active: Option<PathBuf>,
    target: Option<CompileTarget>,
    roots: BTreeSet<PathBuf>,
    packages: Vec<String>,
    bibliographies: Vec<String>,
    last_modified: Option<SystemTime>,
    cursor_line: Option<usize>,
    asy_figures: usize,
}

impl MemoryDocumentModel {
    /// 没有活动文档
    pub fn new() -> Self {
        Self::default()
    }

    /// 活动文档 `<dir>/<stem>.tex`，是根文档
    pub fn with_root(dir: &Path, stem: &str) -> Self {
        let path = dir.join(format!("{}.tex", stem));
        let mut roots = BTreeSet::new();
        roots.insert(path.clone());
        Self {
            active: Some(path.clone()),
            target: Some(CompileTarget::Path(path)),
            roots,
            last_modified: Some(SystemTime::now()),
            ..Self::default()
        }
    }

    /// 活动文档存在但不是根文档
    pub fn with_non_root(dir: &Path, stem: &str) -> Self {
        Self {
            roots: BTreeSet::new(),
            ..Self::with_root(dir, stem)
        }
    }

    pub fn untitled() -> Self {
        Self {
            active: Some(PathBuf::new()),
            target: Some(CompileTarget::Untitled),
            ..Self::default()
        }
    }

    /// 有活动文档但无法确定主文档
    pub fn without_master(active: &Path) -> Self {
        Self {
            active: Some(active.to_path_buf()),
            target: None,
            ..Self::default()
        }
    }

    pub fn with_packages(mut self, packages: &[&str]) -> Self {
        self.packages = packages.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn with_bibliographies(mut self, bibs: &[&str]) -> Self {
        self.bibliographies = bibs.iter().map(|b| b.to_string()).collect();
        self
    }

    pub fn with_last_modified(mut self, time: Option<SystemTime>) -> Self {
        self.last_modified = time;
        self
    }

    pub fn with_cursor_line(mut self, line: usize) -> Self {
        self.cursor_line = Some(line);
        self
    }

    pub fn with_asy_figures(mut self, count: usize) -> Self {
        self.asy_figures = count;
        self
    }
}

impl DocumentModel for MemoryDocumentModel {
    fn has_active_document(&self) -> bool {
        self.active.is_some()
    }

    fn active_document(&self) -> Option<PathBuf> {
        self.active.clone().filter(|p| !p.as_os_str().is_empty())
    }

    fn compile_target(&self) -> Option<CompileTarget> {
        self.target.clone()
    }

    fn is_root(&self, path: &Path) -> bool {
        self.roots.contains(path)
    }

    fn packages(&self, _path: &Path) -> Vec<String> {
        self.packages.clone()
    }

    fn bibliographies(&self, _path: &Path) -> Vec<String> {
        self.bibliographies.clone()
    }

    fn last_modified(&self, _path: &Path) -> Option<SystemTime> {
        self.last_modified
    }

    fn cursor_line(&self) -> Option<usize> {
        self.cursor_line
    }

    fn asy_figures(&self, _dir: &Path, _stem: &str) -> usize {
        self.asy_figures
    }
}
