//! Manager：FIFO 运行队列与工具生命周期
//!
//! 不变式：队头是唯一处于运行（或即将启动）状态的工具；查看器启动后立即出队，移入后台，
//! 不阻塞后续工具。队头以非 Success / Silent 结束时丢弃整个剩余队列。
//! Manager 本身是普通结构体，只由持有者（`ToolchainService` 的控制循环或测试）修改，
//! Launcher 的异步通知经 mpsc 送回后由 `handle` 处理。

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use crate::core::{ToolStatus, ToolchainError};
use crate::document::{DocumentModel, FsDocumentModel};
use crate::host::{AutoConfirm, HeadlessViewerHost, UserPrompt};
use crate::output::{LatexLogParser, OutputParser};
use crate::tools::events::{EventSink, Severity, ToolchainEvent};
use crate::tools::factory::Factory;
use crate::tools::launcher::{
    LaunchEvent, LaunchEventKind, LaunchSender, LauncherFactory, StandardLaunchers,
};
use crate::tools::store::ToolConfigStore;
use crate::tools::tool::{ChildRun, Placement, RunContext, Tool, ToolId};

/// 清空日志的默认间隔
pub const DEFAULT_CLEAR_LOG_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// 距上一次 run 超过该间隔才清空日志与输出
    pub clear_log_timeout: Duration,
    /// 「监视文件」模式：Sequence 不运行查看器
    pub watch_file: bool,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            clear_log_timeout: DEFAULT_CLEAR_LOG_TIMEOUT,
            watch_file: false,
        }
    }
}

/// 只读协作者，与队列分开存放以便同时借用
struct Shared {
    factory: Factory,
    documents: Arc<dyn DocumentModel>,
    parser: Arc<dyn OutputParser>,
    prompt: Arc<dyn UserPrompt>,
    launchers: Arc<dyn LauncherFactory>,
    events: EventSink,
    launch_tx: LaunchSender,
    settings: ManagerSettings,
}

impl Shared {
    fn ctx(&self) -> RunContext<'_> {
        RunContext {
            factory: &self.factory,
            documents: self.documents.as_ref(),
            parser: self.parser.as_ref(),
            prompt: self.prompt.as_ref(),
            launchers: self.launchers.as_ref(),
            events: &self.events,
            launch_tx: &self.launch_tx,
            watch_file: self.settings.watch_file,
        }
    }
}

pub struct Manager {
    shared: Shared,
    queue: VecDeque<Tool>,
    /// 已出队但仍在运行的查看器
    background: Vec<Tool>,
    launch_rx: mpsc::UnboundedReceiver<LaunchEvent>,
    last_run: Option<Instant>,
    stop_enabled: bool,
}

/// Manager 构建器：未指定的协作者使用无界面默认实现
pub struct ManagerBuilder {
    store: ToolConfigStore,
    documents: Option<Arc<dyn DocumentModel>>,
    parser: Option<Arc<dyn OutputParser>>,
    prompt: Option<Arc<dyn UserPrompt>>,
    launchers: Option<Arc<dyn LauncherFactory>>,
    events: Option<EventSink>,
    settings: ManagerSettings,
}

impl ManagerBuilder {
    pub fn new(store: ToolConfigStore) -> Self {
        Self {
            store,
            documents: None,
            parser: None,
            prompt: None,
            launchers: None,
            events: None,
            settings: ManagerSettings::default(),
        }
    }

    pub fn with_documents(mut self, documents: Arc<dyn DocumentModel>) -> Self {
        self.documents = Some(documents);
        self
    }

    pub fn with_parser(mut self, parser: Arc<dyn OutputParser>) -> Self {
        self.parser = Some(parser);
        self
    }

    pub fn with_prompt(mut self, prompt: Arc<dyn UserPrompt>) -> Self {
        self.prompt = Some(prompt);
        self
    }

    pub fn with_launchers(mut self, launchers: Arc<dyn LauncherFactory>) -> Self {
        self.launchers = Some(launchers);
        self
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_settings(mut self, settings: ManagerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn build(self) -> Manager {
        for problem in self.store.validate() {
            tracing::warn!("tool definitions: {}", problem);
        }
        let (launch_tx, launch_rx) = mpsc::unbounded_channel();
        Manager {
            shared: Shared {
                factory: Factory::new(self.store),
                documents: self
                    .documents
                    .unwrap_or_else(|| Arc::new(FsDocumentModel::default())),
                parser: self.parser.unwrap_or_else(|| Arc::new(LatexLogParser)),
                prompt: self.prompt.unwrap_or_else(|| Arc::new(AutoConfirm(false))),
                launchers: self
                    .launchers
                    .unwrap_or_else(|| Arc::new(StandardLaunchers::new(Arc::new(HeadlessViewerHost)))),
                events: self.events.unwrap_or_default(),
                launch_tx,
                settings: self.settings,
            },
            queue: VecDeque::new(),
            background: Vec::new(),
            launch_rx,
            last_run: None,
            stop_enabled: false,
        }
    }
}

impl Manager {
    pub fn events(&self) -> &EventSink {
        &self.shared.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ToolchainEvent> {
        self.shared.events.subscribe()
    }

    pub fn factory(&self) -> &Factory {
        &self.shared.factory
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.shared.settings
    }

    pub fn launch_sender(&self) -> LaunchSender {
        self.shared.launch_tx.clone()
    }

    pub fn is_idle(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn stop_enabled(&self) -> bool {
        self.stop_enabled
    }

    /// 队列中的工具名，队头在前
    pub fn queued_names(&self) -> Vec<String> {
        self.queue.iter().map(|t| t.name().to_string()).collect()
    }

    pub fn background_count(&self) -> usize {
        self.background.len()
    }

    pub fn config_name(&self, tool: &str) -> String {
        self.shared.factory.store().config_name(tool)
    }

    pub fn set_config_name(&mut self, tool: &str, variant: &str) {
        self.shared.factory.store_mut().set_config_name(tool, variant);
    }

    pub fn group_for(&self, tool: &str) -> String {
        self.shared.factory.store().group_for(tool)
    }

    pub fn config_names(&self, tool: &str) -> Vec<String> {
        self.shared.factory.store().config_names(tool)
    }

    pub fn tool_list(&self, menu_only: bool) -> Vec<String> {
        self.shared.factory.store().tool_list(menu_only)
    }

    /// 按名字运行工具；未知工具只记录日志，不改动队列
    pub fn run(&mut self, name: &str, variant: Option<&str>) -> Result<ToolId, ToolchainError> {
        match self.shared.factory.create(name, variant) {
            Ok(tool) => Ok(self.run_tool(tool)),
            Err(e) => {
                tracing::warn!(tool = name, "cannot create tool: {}", e);
                self.shared
                    .events
                    .message(Severity::Error, name, format!("Unknown tool {}.", name));
                Err(e)
            }
        }
    }

    /// 追加到队尾；成为唯一的队列项时立即启动
    pub fn run_tool(&mut self, tool: Tool) -> ToolId {
        self.restart_clear_timer();
        let id = tool.id();
        tracing::debug!(tool = tool.name(), %id, queued = self.queue.len() + 1, "enqueue");
        self.queue.push_back(tool);
        if self.queue.len() == 1 {
            self.run_next_in_queue();
        }
        id
    }

    /// 插到队头之后；队列为空时直接启动
    pub fn run_next(&mut self, tool: Tool) -> ToolId {
        let id = tool.id();
        if self.queue.is_empty() {
            self.queue.push_back(tool);
            self.run_next_in_queue();
        } else {
            self.queue.insert(1, tool);
        }
        id
    }

    /// 用户取消：只影响队头
    pub fn stop(&mut self) {
        self.set_stop_enabled(false);
        if let Some(head) = self.queue.front_mut() {
            head.stop();
        }
    }

    /// 处理一条 Launcher 通知
    pub fn handle(&mut self, event: LaunchEvent) {
        let LaunchEvent { tool_id, kind } = event;
        match kind {
            LaunchEventKind::Output(text) => {
                let name = self.tool_name(tool_id);
                self.shared.events.output(&name, text);
            }
            LaunchEventKind::Message(severity, text) => {
                let name = self.tool_name(tool_id);
                self.shared.events.message(severity, &name, text);
            }
            LaunchEventKind::Finished(status) => self.finished(tool_id, status),
        }
    }

    pub async fn recv_launch_event(&mut self) -> Option<LaunchEvent> {
        self.launch_rx.recv().await
    }

    /// 驱动异步通知直到队列为空（后台查看器不计入）
    pub async fn run_until_idle(&mut self) {
        while !self.queue.is_empty() {
            match self.launch_rx.recv().await {
                Some(event) => self.handle(event),
                None => break,
            }
        }
    }

    fn tool_name(&self, id: ToolId) -> String {
        self.queue
            .iter()
            .chain(self.background.iter())
            .find(|t| t.id() == id)
            .map(|t| t.name().to_string())
            .unwrap_or_else(|| id.to_string())
    }

    /// 计时器在每次 run 时重启：连续快速运行的工具不会清空彼此的日志
    fn restart_clear_timer(&mut self) {
        let now = Instant::now();
        let elapsed = self
            .last_run
            .map_or(true, |last| now.duration_since(last) >= self.shared.settings.clear_log_timeout);
        if elapsed {
            self.shared.events.emit(ToolchainEvent::ClearLog);
        }
        self.last_run = Some(now);
    }

    fn set_stop_enabled(&mut self, enabled: bool) {
        if self.stop_enabled != enabled {
            self.stop_enabled = enabled;
            self.shared
                .events
                .emit(ToolchainEvent::StopEnabled { enabled });
        }
    }

    /// 启动队头；同步结束的工具（失败、Sequence）立即出队并继续推进
    fn run_next_in_queue(&mut self) {
        loop {
            let ctx = self.shared.ctx();
            let Some(head) = self.queue.front_mut() else {
                return;
            };
            let status = head.run(&ctx);
            let children = head.take_children();
            self.enqueue_children(children);

            let advance = if status.is_running() {
                self.started()
            } else {
                self.complete_head(status)
            };
            if !advance {
                return;
            }
        }
    }

    /// 队头已启动；查看器移入后台并返回 true 以启动下一个工具
    fn started(&mut self) -> bool {
        self.set_stop_enabled(true);
        let Some(head) = self.queue.front() else {
            return false;
        };
        tracing::info!(tool = head.name(), id = %head.id(), "started");
        self.shared.events.emit(ToolchainEvent::ToolStarted {
            tool: head.name().to_string(),
        });
        if !head.is_viewer() {
            return false;
        }
        if let Some(viewer) = self.queue.pop_front() {
            self.background.push(viewer);
        }
        self.set_stop_enabled(false);
        true
    }

    fn finished(&mut self, id: ToolId, status: ToolStatus) {
        let is_head = self.queue.front().map_or(false, |t| t.id() == id);
        if !is_head {
            // 队头之外结束的工具（通常是后台查看器）直接丢弃
            if let Some(pos) = self.background.iter().position(|t| t.id() == id) {
                let mut viewer = self.background.remove(pos);
                viewer.finish(status, &self.shared.ctx());
            }
            tracing::debug!(%id, %status, "discarding out-of-band completion");
            return;
        }

        let ctx = self.shared.ctx();
        let Some(head) = self.queue.front_mut() else {
            return;
        };
        let status = head.finish(status, &ctx);
        let children = head.take_children();
        self.enqueue_children(children);
        if self.complete_head(status) {
            self.run_next_in_queue();
        }
    }

    /// 队头到达终态：出队；成功时返回 true，否则丢弃剩余队列
    fn complete_head(&mut self, status: ToolStatus) -> bool {
        self.set_stop_enabled(false);
        if let Some(tool) = self.queue.pop_front() {
            tracing::info!(tool = tool.name(), id = %tool.id(), %status, "finished");
            self.shared.events.emit(ToolchainEvent::ToolFinished {
                tool: tool.name().to_string(),
                status,
            });
        }
        if status.is_ok() {
            return true;
        }
        if !self.queue.is_empty() {
            tracing::info!(discarded = self.queue.len(), "discarding the remaining queue");
            self.queue.clear();
        }
        false
    }

    /// 自动重跑的子工具按顺序紧跟队头；Sequence 的子工具经 run 追加到队尾
    fn enqueue_children(&mut self, children: Vec<ChildRun>) {
        let mut next = 1;
        for ChildRun { tool, placement } in children {
            match placement {
                Placement::Next => {
                    let pos = next.min(self.queue.len());
                    tracing::debug!(tool = tool.name(), pos, "run child next");
                    self.queue.insert(pos, tool);
                    next += 1;
                }
                Placement::Back => {
                    self.restart_clear_timer();
                    tracing::debug!(tool = tool.name(), "run child");
                    self.queue.push_back(tool);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::testing::{MemoryDocumentModel, ScriptedLaunchers, Step};

    fn manager(launchers: Arc<ScriptedLaunchers>, docs: MemoryDocumentModel) -> Manager {
        ManagerBuilder::new(ToolConfigStore::standard().unwrap())
            .with_documents(Arc::new(docs))
            .with_launchers(launchers)
            .with_prompt(Arc::new(AutoConfirm(true)))
            .build()
    }

    #[tokio::test]
    async fn test_unknown_tool_leaves_queue_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let launchers = Arc::new(ScriptedLaunchers::new());
        let mut m = manager(launchers.clone(), MemoryDocumentModel::with_root(dir.path(), "paper"));
        let mut events = m.subscribe();
        assert!(matches!(
            m.run("NoSuchTool", None),
            Err(ToolchainError::UnknownTool(_))
        ));
        assert!(m.is_idle());
        let mut saw_message = false;
        while let Ok(ev) = events.try_recv() {
            if let ToolchainEvent::Message { text, .. } = ev {
                saw_message |= text == "Unknown tool NoSuchTool.";
            }
        }
        assert!(saw_message);
        assert!(launchers.invocations().is_empty());
    }

    #[tokio::test]
    async fn test_only_head_runs() {
        let dir = tempfile::tempdir().unwrap();
        let launchers = Arc::new(ScriptedLaunchers::new());
        launchers.script("BibTeX", Step::Hold);
        let mut m = manager(launchers.clone(), MemoryDocumentModel::with_root(dir.path(), "paper"));
        m.run("BibTeX", None).unwrap();
        m.run("MakeIndex", None).unwrap();
        assert_eq!(m.queued_names(), vec!["BibTeX", "MakeIndex"]);
        assert_eq!(launchers.invocations(), vec!["BibTeX"]);
        assert!(m.stop_enabled());
    }

    #[tokio::test]
    async fn test_stop_aborts_chain() {
        let dir = tempfile::tempdir().unwrap();
        let launchers = Arc::new(ScriptedLaunchers::new());
        launchers.script("BibTeX", Step::Hold);
        let mut m = manager(launchers.clone(), MemoryDocumentModel::with_root(dir.path(), "paper"));
        m.run("BibTeX", None).unwrap();
        m.run("MakeIndex", None).unwrap();
        m.stop();
        assert!(!m.stop_enabled());
        m.run_until_idle().await;
        assert!(m.is_idle());
        assert_eq!(launchers.invocations(), vec!["BibTeX"]);
    }

    #[tokio::test]
    async fn test_run_next_inserts_behind_head() {
        let dir = tempfile::tempdir().unwrap();
        let launchers = Arc::new(ScriptedLaunchers::new());
        launchers.script("BibTeX", Step::Hold);
        let mut m = manager(launchers.clone(), MemoryDocumentModel::with_root(dir.path(), "paper"));
        m.run("BibTeX", None).unwrap();
        m.run("MakeIndex", None).unwrap();
        let next = m.factory().create("Asymptote", None).unwrap();
        m.run_next(next);
        assert_eq!(m.queued_names(), vec!["BibTeX", "Asymptote", "MakeIndex"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_log_debounce() {
        let dir = tempfile::tempdir().unwrap();
        let launchers = Arc::new(ScriptedLaunchers::new());
        let mut m = manager(launchers, MemoryDocumentModel::with_root(dir.path(), "paper"));
        let mut events = m.subscribe();
        let count_clears = |rx: &mut broadcast::Receiver<ToolchainEvent>| {
            let mut n = 0;
            while let Ok(ev) = rx.try_recv() {
                if matches!(ev, ToolchainEvent::ClearLog) {
                    n += 1;
                }
            }
            n
        };

        m.run("BibTeX", None).unwrap();
        m.run_until_idle().await;
        assert_eq!(count_clears(&mut events), 1);

        tokio::time::advance(Duration::from_secs(5)).await;
        m.run("BibTeX", None).unwrap();
        m.run_until_idle().await;
        assert_eq!(count_clears(&mut events), 0);

        tokio::time::advance(Duration::from_secs(11)).await;
        m.run("BibTeX", None).unwrap();
        m.run_until_idle().await;
        assert_eq!(count_clears(&mut events), 1);
    }
}
