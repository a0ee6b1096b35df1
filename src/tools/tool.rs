//! Tool：一个已配置、有状态的工作单元
//!
//! 生命周期 Unconfigured -> Configuring -> SourceResolved -> TargetResolved -> PreconditionsChecked
//! -> Launched -> Finished。前置条件全部在启动前同步检查；任何一步失败都不会安装 Launcher。
//! 行为差异由封闭的 `ToolClass` 决定，而不是由继承层次决定。

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::core::{ToolStatus, ToolchainError};
use crate::document::{CompileTarget, DocumentModel};
use crate::host::UserPrompt;
use crate::output::{DiagnosticKind, LogSummary, OutputParser};
use crate::tools::dict::ParamDict;
use crate::tools::events::{EventSink, Severity, ToolchainEvent};
use crate::tools::factory::Factory;
use crate::tools::launcher::{LaunchSender, LaunchSpec, Launcher, LauncherFactory};
use crate::tools::rerun::{plan_reruns, RerunCounter, RerunTriggers, MAX_RERUNS};
use crate::tools::store::{extract, ToolConfig, ToolConfigStore};

/// 工具实例的唯一标识，Launcher 的异步通知据此找到对应的 Tool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ToolId(u64);

impl ToolId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ToolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 配置中 `class` 键的取值
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ToolClass {
    Base,
    Compile,
    LaTeX,
    Convert,
    View,
    ViewHTML,
    ViewBib,
    ForwardDVI,
    Archive,
    Sequence,
}

impl ToolClass {
    pub const ALL: [ToolClass; 10] = [
        ToolClass::Base,
        ToolClass::Compile,
        ToolClass::LaTeX,
        ToolClass::Convert,
        ToolClass::View,
        ToolClass::ViewHTML,
        ToolClass::ViewBib,
        ToolClass::ForwardDVI,
        ToolClass::Archive,
        ToolClass::Sequence,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ToolClass::Base => "Base",
            ToolClass::Compile => "Compile",
            ToolClass::LaTeX => "LaTeX",
            ToolClass::Convert => "Convert",
            ToolClass::View => "View",
            ToolClass::ViewHTML => "ViewHTML",
            ToolClass::ViewBib => "ViewBib",
            ToolClass::ForwardDVI => "ForwardDVI",
            ToolClass::Archive => "Archive",
            ToolClass::Sequence => "Sequence",
        }
    }

    /// 纯查看器：启动后立即出队，不阻塞后续工具
    pub fn is_viewer(self) -> bool {
        matches!(
            self,
            ToolClass::View | ToolClass::ViewHTML | ToolClass::ViewBib | ToolClass::ForwardDVI
        )
    }

    pub fn is_compiler(self) -> bool {
        matches!(self, ToolClass::Compile | ToolClass::LaTeX)
    }

    pub fn requirements(self) -> Requirements {
        if self.is_viewer() {
            Requirements::viewer()
        } else {
            Requirements::standard()
        }
    }
}

impl FromStr for ToolClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ToolClass::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown tool class '{}'", s))
    }
}

impl fmt::Display for ToolClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolState {
    Unconfigured,
    Configuring,
    SourceResolved,
    TargetResolved,
    PreconditionsChecked,
    Launched,
    Finished(ToolStatus),
}

/// 单个前置条件，每个对应一条面向用户的消息
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    TargetDirExec,
    TargetDirWrite,
    TargetExists,
    TargetReadable,
    ActiveDocument,
    MasterDocument,
    NoUntitledDocument,
}

impl Precondition {
    /// 文件系统检查的固定顺序
    pub const TARGET_CHECKS: [Precondition; 4] = [
        Precondition::TargetDirExec,
        Precondition::TargetDirWrite,
        Precondition::TargetExists,
        Precondition::TargetReadable,
    ];
}

/// 工具要求的前置条件集合
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Requirements {
    pub target_dir_exec: bool,
    pub target_dir_write: bool,
    pub target_exists: bool,
    pub target_readable: bool,
    pub active_document: bool,
    pub master_document: bool,
    pub no_untitled: bool,
}

impl Requirements {
    /// 生成结果的工具：目标目录可进入、可写
    pub fn standard() -> Self {
        Self {
            target_dir_exec: true,
            target_dir_write: true,
            target_exists: false,
            target_readable: false,
            active_document: true,
            master_document: true,
            no_untitled: true,
        }
    }

    /// 查看器：目标文件存在且可读，不要求目录可写
    pub fn viewer() -> Self {
        Self {
            target_dir_write: false,
            target_exists: true,
            target_readable: true,
            ..Self::standard()
        }
    }

    pub fn requires(&self, p: Precondition) -> bool {
        match p {
            Precondition::TargetDirExec => self.target_dir_exec,
            Precondition::TargetDirWrite => self.target_dir_write,
            Precondition::TargetExists => self.target_exists,
            Precondition::TargetReadable => self.target_readable,
            Precondition::ActiveDocument => self.active_document,
            Precondition::MasterDocument => self.master_document,
            Precondition::NoUntitledDocument => self.no_untitled,
        }
    }

    /// 按固定顺序返回第一个未满足的文件系统条件
    pub fn first_unmet(&self, dir: &Path, target: &Path) -> Option<Precondition> {
        Precondition::TARGET_CHECKS.into_iter().find(|&p| {
            self.requires(p)
                && !match p {
                    Precondition::TargetDirExec => fsperm::is_traversable(dir),
                    Precondition::TargetDirWrite => fsperm::is_writable(dir),
                    Precondition::TargetExists => target.exists(),
                    Precondition::TargetReadable => fsperm::is_readable(target),
                    _ => true,
                }
        })
    }
}

/// 以有效用户身份检查访问权限
mod fsperm {
    use std::path::Path;

    #[cfg(unix)]
    fn allows(path: &Path, mode: nix::unistd::AccessFlags) -> bool {
        nix::unistd::access(path, mode).is_ok()
    }

    #[cfg(unix)]
    pub fn is_traversable(dir: &Path) -> bool {
        dir.is_dir() && allows(dir, nix::unistd::AccessFlags::X_OK)
    }

    #[cfg(unix)]
    pub fn is_writable(path: &Path) -> bool {
        allows(path, nix::unistd::AccessFlags::W_OK)
    }

    #[cfg(unix)]
    pub fn is_readable(path: &Path) -> bool {
        allows(path, nix::unistd::AccessFlags::R_OK)
    }

    #[cfg(not(unix))]
    pub fn is_traversable(dir: &Path) -> bool {
        dir.is_dir()
    }

    #[cfg(not(unix))]
    pub fn is_writable(path: &Path) -> bool {
        std::fs::metadata(path).map_or(false, |m| !m.permissions().readonly())
    }

    #[cfg(not(unix))]
    pub fn is_readable(path: &Path) -> bool {
        path.exists()
    }
}

/// 子工具在队列中的位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// 紧跟在当前队头之后（自动重跑）
    Next,
    /// 队尾（Sequence 展开）
    Back,
}

pub struct ChildRun {
    pub tool: Tool,
    pub placement: Placement,
}

/// Tool 运行与结束时可用的协作者
pub struct RunContext<'a> {
    pub factory: &'a Factory,
    pub documents: &'a dyn DocumentModel,
    pub parser: &'a dyn OutputParser,
    pub prompt: &'a dyn UserPrompt,
    pub launchers: &'a dyn LauncherFactory,
    pub events: &'a EventSink,
    pub launch_tx: &'a LaunchSender,
    /// 「监视文件」模式：Sequence 跳过查看器
    pub watch_file: bool,
}

pub struct Tool {
    id: ToolId,
    name: String,
    variant: String,
    class: ToolClass,
    state: ToolState,
    config: ToolConfig,
    requirements: Requirements,

    /// 源文件名（不含目录）
    source: Option<String>,
    base_dir: PathBuf,
    stem: String,
    target: String,
    target_dir: PathBuf,
    working_dir_override: Option<PathBuf>,
    target_dir_override: Option<PathBuf>,

    dict: ParamDict,
    launcher: Option<Box<dyn Launcher>>,
    rerun: RerunCounter,
    children: Vec<ChildRun>,
}

impl fmt::Debug for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tool")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("variant", &self.variant)
            .field("class", &self.class)
            .field("state", &self.state)
            .field("source", &self.source)
            .field("target", &self.target)
            .finish()
    }
}

impl Tool {
    pub(crate) fn new(name: &str, variant: &str, class: ToolClass) -> Self {
        Self {
            id: ToolId::next(),
            name: name.to_string(),
            variant: variant.to_string(),
            class,
            state: ToolState::Unconfigured,
            config: ToolConfig::new(),
            requirements: class.requirements(),
            source: None,
            base_dir: PathBuf::new(),
            stem: String::new(),
            target: String::new(),
            target_dir: PathBuf::new(),
            working_dir_override: None,
            target_dir_override: None,
            dict: ParamDict::new(),
            launcher: None,
            rerun: RerunCounter::new(),
            children: Vec::new(),
        }
    }

    pub fn id(&self) -> ToolId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 实际使用的配置变体
    pub fn variant(&self) -> &str {
        &self.variant
    }

    pub fn class(&self) -> ToolClass {
        self.class
    }

    pub fn state(&self) -> ToolState {
        self.state
    }

    pub fn is_viewer(&self) -> bool {
        self.class.is_viewer()
    }

    pub fn config(&self) -> &ToolConfig {
        &self.config
    }

    pub fn requirements(&self) -> Requirements {
        self.requirements
    }

    /// 配置项，缺省为空串
    pub fn read_entry(&self, key: &str) -> &str {
        self.config.get(key).map(String::as_str).unwrap_or("")
    }

    /// 源文件绝对路径
    pub fn source(&self) -> Option<PathBuf> {
        self.source.as_ref().map(|s| self.base_dir.join(s))
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn stem(&self) -> &str {
        &self.stem
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn target_dir(&self) -> &Path {
        &self.target_dir
    }

    pub fn working_dir(&self) -> &Path {
        self.working_dir_override.as_deref().unwrap_or(&self.base_dir)
    }

    pub fn dict(&self) -> &ParamDict {
        &self.dict
    }

    pub fn has_launcher(&self) -> bool {
        self.launcher.is_some()
    }

    pub fn rerun_counter(&self) -> RerunCounter {
        self.rerun
    }

    pub(crate) fn set_rerun_counter(&mut self, counter: RerunCounter) {
        self.rerun = counter;
    }

    /// 取出 run / finish 期间安排的子工具
    pub fn take_children(&mut self) -> Vec<ChildRun> {
        std::mem::take(&mut self.children)
    }

    /// 从配置存储拉取本变体的键值表
    pub fn configure(&mut self, store: &ToolConfigStore) -> Result<(), ToolchainError> {
        self.state = ToolState::Configuring;
        let map = store
            .entry_map(&self.name, Some(&self.variant))
            .ok_or_else(|| ToolchainError::MissingConfig(self.name.clone()))?;
        self.config = map.clone();
        Ok(())
    }

    /// 设置源文件（会套用配置的 `from` 扩展名）；Launcher 运行期间拒绝修改
    pub fn set_source(&mut self, path: &Path) -> bool {
        if self.state == ToolState::Launched {
            tracing::warn!(tool = %self.name, "source is fixed while the tool is running");
            return false;
        }
        let from = self.read_entry("from").trim();
        let path = if from.is_empty() {
            path.to_path_buf()
        } else {
            path.with_extension(from)
        };
        let base_dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => absolute(p),
            _ => absolute(Path::new(".")),
        };
        let file_name = path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        let stem = path
            .file_stem()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();

        self.dict.set("%dir_base", base_dir.to_string_lossy());
        self.dict.set("%source", file_name.as_str());
        self.dict.set("%S", stem.as_str());
        tracing::debug!(tool = %self.name, source = %file_name, S = %stem, basedir = %base_dir.display(), "set source");
        self.base_dir = base_dir;
        self.source = Some(file_name);
        self.stem = stem;
        true
    }

    /// 子工具继承父工具的工作目录与目标目录
    pub fn copy_paths(&mut self, parent: &Tool) {
        self.working_dir_override = Some(parent.working_dir().to_path_buf());
        if !parent.target_dir.as_os_str().is_empty() {
            self.target_dir_override = Some(parent.target_dir.clone());
        }
    }

    fn send(&self, ctx: &RunContext<'_>, severity: Severity, text: impl Into<String>) {
        ctx.events.message(severity, &self.name, text);
    }

    fn precondition_message(&self, p: Precondition) -> String {
        let dir = self.target_dir.display();
        match p {
            Precondition::TargetDirExec => format!("Could not change to the folder {}.", dir),
            Precondition::TargetDirWrite => format!(
                "The folder {} is not writable, therefore {} will not be able to save its results.",
                dir, self.name
            ),
            Precondition::TargetExists if self.is_viewer() => format!(
                "The file {}/{} does not exist. Did you compile the source file?",
                dir, self.target
            ),
            Precondition::TargetExists => format!(
                "The file {}/{} does not exist. If you're surprised, check the file permissions.",
                dir, self.target
            ),
            Precondition::TargetReadable => format!(
                "The file {}/{} is not readable. If you're surprised, check the file permissions.",
                dir, self.target
            ),
            Precondition::ActiveDocument => format!(
                "Could not determine on which file to run {}, because there is no active document.",
                self.name
            ),
            Precondition::MasterDocument => {
                "Could not determine the master file for this document.".to_string()
            }
            Precondition::NoUntitledDocument => "Please save the untitled document first.".to_string(),
        }
    }

    /// 同步部分：配置、解析源与目标、检查前置条件并启动 Launcher。
    /// 返回 Running 时等待 Launcher 的异步完成通知；其他结果都是终态。
    pub fn run(&mut self, ctx: &RunContext<'_>) -> ToolStatus {
        tracing::debug!(tool = %self.name, variant = %self.variant, id = %self.id, "run");
        let status = match self.prepare(ctx) {
            Ok(()) if self.class == ToolClass::Sequence => self.expand_sequence(ctx),
            Ok(()) => self.launch(ctx),
            Err(status) => status,
        };
        if !status.is_running() {
            self.state = ToolState::Finished(status);
        }
        status
    }

    fn prepare(&mut self, ctx: &RunContext<'_>) -> Result<(), ToolStatus> {
        if let Err(e) = self.configure(ctx.factory.store()) {
            self.send(ctx, Severity::Error, e.to_string());
            return Err(e.status());
        }

        if self.class == ToolClass::Sequence {
            self.determine_source(ctx)?;
            self.state = ToolState::SourceResolved;
            return Ok(());
        }

        let kind = self.read_entry("type").to_string();
        if !ctx.launchers.supports(&kind) {
            self.send(
                ctx,
                Severity::Error,
                format!("Cannot launch {}: unknown launcher type '{}'.", self.name, kind),
            );
            return Err(ToolStatus::NoLauncherInstalled);
        }

        self.determine_source(ctx)?;
        self.state = ToolState::SourceResolved;
        self.determine_target(ctx)?;
        self.state = ToolState::TargetResolved;
        self.check_target(ctx)?;
        self.check_prereqs(ctx)?;
        self.state = ToolState::PreconditionsChecked;
        Ok(())
    }

    fn determine_source(&mut self, ctx: &RunContext<'_>) -> Result<(), ToolStatus> {
        let docs = ctx.documents;
        let source = match self.source() {
            Some(explicit) => explicit,
            None => {
                if self.requirements.active_document && !docs.has_active_document() {
                    self.send(ctx, Severity::Error, self.precondition_message(Precondition::ActiveDocument));
                    return Err(ToolStatus::NoValidSource);
                }
                match docs.compile_target() {
                    Some(CompileTarget::Path(p)) => p,
                    Some(CompileTarget::Untitled) if self.requirements.no_untitled => {
                        self.send(ctx, Severity::Error, self.precondition_message(Precondition::NoUntitledDocument));
                        return Err(ToolStatus::NoValidSource);
                    }
                    _ => {
                        self.send(ctx, Severity::Error, self.precondition_message(Precondition::MasterDocument));
                        return Err(ToolStatus::NoValidSource);
                    }
                }
            }
        };
        self.set_source(&source);

        if self.class == ToolClass::Convert {
            // 实际输入是 stem + from，而不是逻辑上的源文件
            let from = self.read_entry("from").to_string();
            let derived = self.base_dir.join(format!("{}.{}", self.stem, from));
            self.set_source(&derived);
        }
        if self.class == ToolClass::ViewBib {
            self.determine_bibliography(ctx)?;
        }

        docs.save_all();
        ctx.events.emit(ToolchainEvent::RequestSaveAll);
        Ok(())
    }

    /// 源文件换成文档引用的参考文献库；多于一个时请用户选择，没有时把源文件本身当作 .bib
    fn determine_bibliography(&mut self, ctx: &RunContext<'_>) -> Result<(), ToolStatus> {
        let Some(source) = self.source() else {
            return Err(ToolStatus::NoValidSource);
        };
        let bibs = ctx.documents.bibliographies(&source);
        tracing::debug!(tool = %self.name, count = bibs.len(), "found bibliographies");

        let file = match bibs.as_slice() {
            [] if source.is_file() => return Ok(()),
            [] => {
                self.send(ctx, Severity::Error, "No bibliographies found.");
                return Err(ToolStatus::NoValidSource);
            }
            [only] => only.clone(),
            _ => match ctx.prompt.choose(&bibs, "Select a bibliography") {
                Some(i) if i < bibs.len() => bibs[i].clone(),
                _ => {
                    self.send(ctx, Severity::Warning, "No bibliography selected.");
                    return Err(ToolStatus::NoValidSource);
                }
            },
        };
        let file = if file.ends_with(".bib") { file } else { format!("{}.bib", file) };
        let path = locate_bib(&self.base_dir, &file);
        self.set_source(&path);
        Ok(())
    }

    fn determine_target(&mut self, ctx: &RunContext<'_>) -> Result<(), ToolStatus> {
        let mut rel_dir = self.dict.expand(self.read_entry("relDir"));
        let mut target = self.dict.expand(self.read_entry("target"));

        if self.class == ToolClass::ViewHTML && rel_dir.is_empty() && target.is_empty() {
            let (dir, trg) = self.detect_html(ctx)?;
            rel_dir = dir;
            target = trg;
        }

        if target.is_empty() {
            let to = self.read_entry("to");
            target = if to.is_empty() {
                self.source.clone().unwrap_or_default()
            } else {
                format!("{}.{}", self.stem, to)
            };
        }
        self.target = target;
        self.target_dir = match &self.target_dir_override {
            Some(dir) => dir.clone(),
            None if rel_dir.is_empty() => self.base_dir.clone(),
            None => self.base_dir.join(rel_dir),
        };
        self.dict.set("%dir_target", self.target_dir.to_string_lossy());
        self.dict.set("%target", self.target.as_str());

        if self.class == ToolClass::ForwardDVI {
            self.forward_search_target(ctx)?;
        }
        tracing::debug!(tool = %self.name, target = %self.target, dir = %self.target_dir.display(), "determined target");
        Ok(())
    }

    /// 自动寻找要查看的 HTML：`<S>/index.html` 或 `<S>.html`，都可读时取较新的
    fn detect_html(&self, ctx: &RunContext<'_>) -> Result<(String, String), ToolStatus> {
        let index = self.base_dir.join(&self.stem).join("index.html");
        let single = self.base_dir.join(format!("{}.html", self.stem));
        let mut use_index = fsperm::is_readable(&index);
        let use_single = fsperm::is_readable(&single);
        if !use_index && !use_single {
            self.send(
                ctx,
                Severity::Error,
                format!(
                    "Unable to find {} or {}; if you are trying to view some other HTML file, set the relDir and target entries of {}.",
                    index.display(),
                    single.display(),
                    self.name
                ),
            );
            return Err(ToolStatus::NoValidTarget);
        }
        if use_index && use_single {
            let mtime = |p: &Path| std::fs::metadata(p).and_then(|m| m.modified()).ok();
            use_index = mtime(&index) > mtime(&single);
        }
        Ok(if use_index {
            (self.stem.clone(), "index.html".to_string())
        } else {
            (String::new(), format!("{}.html", self.stem))
        })
    }

    /// 正向搜索：`file:<dir>/<target>#src:<line> <相对源文件>`
    fn forward_search_target(&mut self, ctx: &RunContext<'_>) -> Result<(), ToolStatus> {
        let Some(active) = ctx.documents.active_document() else {
            self.send(ctx, Severity::Error, self.precondition_message(Precondition::ActiveDocument));
            return Err(ToolStatus::NoValidTarget);
        };
        let line = ctx.documents.cursor_line().unwrap_or(0) + 1;
        let relative = active
            .strip_prefix(&self.base_dir)
            .unwrap_or(&active)
            .to_string_lossy()
            .into_owned();
        let file = format!("file:{}/{}#src:{}", self.target_dir.display(), self.target, line);
        self.dict.set("%dir_target", "");
        self.dict.set("%target", format!("{} {}", file, relative));
        self.dict.set("%absolute_target", format!("{}{}", file, active.display()));
        Ok(())
    }

    fn check_target(&self, ctx: &RunContext<'_>) -> Result<(), ToolStatus> {
        let target = self.target_dir.join(&self.target);
        match self.requirements.first_unmet(&self.target_dir, &target) {
            Some(p) => {
                self.send(ctx, Severity::Error, self.precondition_message(p));
                Err(ToolStatus::TargetHasWrongPermissions)
            }
            None => Ok(()),
        }
    }

    /// 编译器：源文件不是根文档且开启了 checkForRoot 时需要用户确认
    fn check_prereqs(&self, ctx: &RunContext<'_>) -> Result<(), ToolStatus> {
        if !self.class.is_compiler() || self.read_entry("checkForRoot") != "yes" {
            return Ok(());
        }
        let Some(source) = self.source() else {
            return Ok(());
        };
        if ctx.documents.is_root(&source) {
            return Ok(());
        }
        let question = format!(
            "The document {} is not a LaTeX root document. Continue anyway?",
            source.display()
        );
        if ctx.prompt.confirm(&question, "Continue?") {
            Ok(())
        } else {
            self.send(
                ctx,
                Severity::Error,
                format!("{} was not run because {} is not a LaTeX root document.", self.name, source.display()),
            );
            Err(ToolStatus::NoValidPrereqs)
        }
    }

    fn launch(&mut self, ctx: &RunContext<'_>) -> ToolStatus {
        if self.launcher.is_none() {
            self.launcher = ctx.launchers.create(self.read_entry("type"), &self.config);
        }
        if self.launcher.is_none() {
            self.send(ctx, Severity::Error, format!("No launcher available for {}.", self.name));
            return ToolStatus::NoLauncherInstalled;
        }
        let options = self.dict.expand_for_shell(self.read_entry("options"));
        self.dict.set_raw("%options", options);

        let spec = LaunchSpec {
            tool_id: self.id,
            tool_name: self.name.clone(),
            working_dir: self.working_dir().to_path_buf(),
            target: self.target_dir.join(&self.target),
            dict: self.dict.clone(),
            config: self.config.clone(),
            detach: self.is_viewer(),
        };
        let Some(launcher) = self.launcher.as_mut() else {
            return ToolStatus::NoLauncherInstalled;
        };
        match launcher.launch(spec, ctx.launch_tx.clone()) {
            Ok(()) => {
                self.state = ToolState::Launched;
                ToolStatus::Running
            }
            Err(e) => {
                let status = if launcher.self_check() {
                    ToolStatus::CouldNotLaunch
                } else {
                    ToolStatus::SelfCheckFailed
                };
                tracing::warn!(tool = %self.name, %status, "launching failed: {}", e);
                self.send(ctx, Severity::Error, format!("Launching failed: {}", e));
                status
            }
        }
    }

    /// 展开 `sequence`：先全部实例化，任何一个失败则整个 Sequence 失败且不排入任何子工具
    fn expand_sequence(&mut self, ctx: &RunContext<'_>) -> ToolStatus {
        let Some(source) = self.source() else {
            return ToolStatus::NoValidSource;
        };
        let entries: Vec<String> = self
            .read_entry("sequence")
            .split(',')
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(str::to_string)
            .collect();

        let mut tools = Vec::with_capacity(entries.len());
        for entry in &entries {
            let (name, variant) = extract(entry);
            match ctx.factory.create(&name, variant.as_deref()) {
                Ok(tool) => tools.push(tool),
                Err(e) => {
                    tracing::debug!(sequence = %self.name, "cannot create {}: {}", entry, e);
                    self.send(ctx, Severity::Error, format!("Unknown tool {}.", entry));
                    return ToolStatus::Failed;
                }
            }
        }

        for mut tool in tools {
            if ctx.watch_file && tool.is_viewer() {
                tracing::debug!(sequence = %self.name, tool = %tool.name, "watch file mode, skipping viewer");
                continue;
            }
            tool.set_source(&source);
            self.children.push(ChildRun {
                tool,
                placement: Placement::Back,
            });
        }
        ToolStatus::Silent
    }

    /// 协作式终止正在运行的 Launcher
    pub fn stop(&mut self) {
        if let Some(launcher) = self.launcher.as_mut() {
            tracing::info!(tool = %self.name, "stopping");
            launcher.kill();
        }
    }

    /// Launcher 完成后调用一次：LaTeX 在成功时分析日志并决定是否重跑，然后报告终态
    pub fn finish(&mut self, result: ToolStatus, ctx: &RunContext<'_>) -> ToolStatus {
        if result == ToolStatus::Success && self.class == ToolClass::LaTeX {
            self.check_log(ctx);
        }
        match result {
            ToolStatus::Aborted => self.send(ctx, Severity::Error, "Aborted"),
            ToolStatus::Success => self.send(ctx, Severity::Info, "Done!"),
            _ => {}
        }
        self.state = ToolState::Finished(result);
        result
    }

    fn check_log(&mut self, ctx: &RunContext<'_>) {
        let Some(source) = self.source() else {
            return;
        };
        let log = self.target_dir.join(format!("{}.log", self.stem));
        let summary = match ctx.parser.parse(&log, &source) {
            Some(summary) => {
                self.report_problems(ctx, &source, &summary);
                summary
            }
            None => LogSummary::default(),
        };

        if summary.errors > 0 && self.read_entry("jumpToFirstError") == "yes" {
            ctx.events.emit(ToolchainEvent::JumpToFirstError {
                tool: self.name.clone(),
                file: Some(source.to_string_lossy().into_owned()),
                line: summary.first_error().and_then(|d| d.line),
            });
        }

        if self.read_entry("autoRun") == "yes" {
            self.check_auto_run(ctx, &source, &summary);
        }
    }

    fn report_problems(&self, ctx: &RunContext<'_>, source: &Path, summary: &LogSummary) {
        let file = source
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        for d in &summary.diagnostics {
            let severity = match d.kind {
                DiagnosticKind::Error => Severity::Error,
                DiagnosticKind::Warning | DiagnosticKind::BadBox => Severity::Warning,
            };
            let text = match d.line {
                Some(line) => format!("{}:{}: {}", file, line, d.message),
                None => format!("{}: {}", file, d.message),
            };
            self.send(ctx, severity, text);
        }
        self.send(ctx, Severity::Info, summary.summary_line());
    }

    fn check_auto_run(&mut self, ctx: &RunContext<'_>, source: &Path, summary: &LogSummary) {
        let triggers = RerunTriggers::collect(
            ctx.documents,
            source,
            &self.target_dir,
            &self.stem,
            summary,
        );
        let plan = plan_reruns(self.rerun, summary.errors, triggers);
        if !plan.rerun {
            return;
        }
        self.send(
            ctx,
            Severity::Info,
            format!("Rerunning {} ({} of {}).", self.name, plan.next.value(), MAX_RERUNS),
        );

        let target_dir = self.target_dir.clone();
        let stem = self.stem.clone();
        if plan.bibliography {
            self.schedule_aux(ctx, "BibTeX", |from| target_dir.join(format!("{}.{}", stem, from)));
        }
        if plan.index {
            self.schedule_aux(ctx, "MakeIndex", |from| target_dir.join(format!("{}.{}", stem, from)));
        }
        if plan.asymptote {
            let figures = ctx.documents.asy_figures(&target_dir, &stem);
            for i in 1..=figures {
                self.schedule_aux(ctx, "Asymptote", |from| {
                    target_dir.join(format!("{}-{}.{}", stem, i, from))
                });
            }
        }

        match ctx.factory.create(&self.name, Some(&self.variant)) {
            Ok(mut compiler) => {
                compiler.set_source(source);
                compiler.copy_paths(self);
                compiler.set_rerun_counter(plan.next);
                self.children.push(ChildRun {
                    tool: compiler,
                    placement: Placement::Next,
                });
            }
            Err(e) => self.send(ctx, Severity::Warning, e.to_string()),
        }
    }

    /// 安排一个辅助工具；其源文件由它自己配置的 `from` 扩展名决定
    fn schedule_aux<F>(&mut self, ctx: &RunContext<'_>, name: &str, source_for: F)
    where
        F: Fn(&str) -> PathBuf,
    {
        match ctx.factory.create(name, None) {
            Ok(mut tool) => {
                let source = source_for(tool.read_entry("from"));
                tool.set_source(&source);
                tool.copy_paths(self);
                self.children.push(ChildRun {
                    tool,
                    placement: Placement::Next,
                });
            }
            Err(e) => {
                tracing::warn!(tool = %self.name, "cannot schedule {}: {}", name, e);
                self.send(ctx, Severity::Warning, e.to_string());
            }
        }
    }
}

/// 参考文献库先相对源文件目录找，找不到再查 BIBINPUTS
fn locate_bib(base_dir: &Path, file: &str) -> PathBuf {
    let local = base_dir.join(file);
    if local.exists() {
        return local;
    }
    std::env::var_os("BIBINPUTS")
        .and_then(|paths| {
            std::env::split_paths(&paths)
                .filter(|dir| !dir.as_os_str().is_empty())
                .map(|dir| dir.join(file))
                .find(|p| p.exists())
        })
        .unwrap_or(local)
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}
