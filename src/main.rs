//! texchain 命令行入口
//!
//! `run` 启动一条工具链并把事件打印到 stdout（人类可读或 JSON 行），日志写到 stderr；
//! `list` / `configs` 只查询工具定义。

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio::sync::broadcast;

use texchain::config::{load_config, AppConfig};
use texchain::core::ShutdownManager;
use texchain::document::FsDocumentModel;
use texchain::host::{AutoConfirm, HeadlessViewerHost, TerminalPrompt, UserPrompt};
use texchain::observability;
use texchain::tools::store::{extract, ToolConfigStore};
use texchain::tools::{
    ManagerBuilder, Severity, StandardLaunchers, ToolchainEvent, ToolchainService,
};

#[derive(Debug, Parser)]
#[command(name = "texchain", about = "Run a TeX tool chain with automatic reruns")]
struct Cli {
    /// 应用配置文件（TOML）
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// 运行工具，如 `LaTeX`、`QuickBuild`、`ViewPDF(Okular)`
    Run(RunArgs),
    /// 列出已定义的工具
    List {
        /// 只列出出现在菜单中的工具
        #[arg(long)]
        menu: bool,
    },
    /// 列出某个工具的全部配置变体
    Configs { tool: String },
}

#[derive(Debug, Args, Clone)]
struct RunArgs {
    /// TOOL 或 TOOL(config)
    tool: String,
    /// 活动文档
    #[arg(long)]
    source: Option<PathBuf>,
    /// 事件按 JSON 行输出
    #[arg(long)]
    json: bool,
    /// 对确认问题自动回答「是」
    #[arg(long)]
    yes: bool,
    /// 光标所在行（正向搜索使用，从 0 开始）
    #[arg(long)]
    cursor_line: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    observability::init();

    let cli = Cli::parse();
    let cfg = load_config(cli.config.clone()).context("Failed to load configuration")?;
    let store = tool_store(&cfg)?;

    match cli.command {
        Command::List { menu } => {
            for tool in store.tool_list(menu) {
                println!("{}\t{}", tool, store.config_name(&tool));
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Configs { tool } => {
            let selected = store.config_name(&tool);
            let names = store.config_names(&tool);
            anyhow::ensure!(!names.is_empty(), "Unknown tool {}.", tool);
            for name in names {
                let mark = if name == selected { "*" } else { " " };
                println!("{} {}", mark, name);
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Run(args) => run(cfg, store, args).await,
    }
}

/// 内置定义叠加用户定义
fn tool_store(cfg: &AppConfig) -> anyhow::Result<ToolConfigStore> {
    let mut store = ToolConfigStore::standard().context("Built-in tool definitions are invalid")?;
    if let Some(path) = &cfg.tools.definitions {
        let user = ToolConfigStore::load(path)
            .with_context(|| format!("Failed to load tool definitions from {}", path.display()))?;
        store.merge(user);
    }
    Ok(store)
}

/// 被信号中断时按信号给出退出码
async fn run(cfg: AppConfig, store: ToolConfigStore, args: RunArgs) -> anyhow::Result<ExitCode> {
    let (tool, variant) = extract(&args.tool);

    let source = match &args.source {
        Some(path) if path.is_relative() => Some(
            std::env::current_dir()
                .context("Cannot determine the current directory")?
                .join(path),
        ),
        other => other.clone(),
    };
    let mut documents = FsDocumentModel::new(source);
    if let Some(line) = args.cursor_line {
        documents = documents.with_cursor_line(line);
    }

    let prompt: Arc<dyn UserPrompt> = if args.yes || cfg.app.auto_confirm {
        Arc::new(AutoConfirm(true))
    } else {
        Arc::new(TerminalPrompt)
    };
    let mut launchers = StandardLaunchers::new(Arc::new(HeadlessViewerHost));
    if let Some(terminal) = &cfg.tools.terminal {
        launchers = launchers.with_terminal(terminal.clone());
    }

    let manager = ManagerBuilder::new(store)
        .with_documents(Arc::new(documents))
        .with_prompt(prompt)
        .with_launchers(Arc::new(launchers))
        .with_settings(cfg.manager_settings())
        .build();
    let (handle, service) = ToolchainService::spawn(manager);

    let printer = tokio::spawn(print_events(handle.subscribe(), args.json));

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();
    let stopper = {
        let handle = handle.clone();
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            shutdown.wait_for_shutdown().await;
            let _ = handle.stop();
        })
    };

    let started = handle.run(&tool, variant.as_deref()).await;
    if started.is_ok() {
        handle.wait_idle().await.context("Tool chain service stopped unexpectedly")?;
    }

    handle.quit();
    stopper.abort();
    let _ = stopper.await;
    service.await.context("Tool chain service panicked")?;
    // 最后一个发送端随 handle 释放，打印任务随之结束
    drop(handle);
    let failures = printer.await.context("Event printer panicked")?;

    if let Err(e) = started {
        anyhow::bail!(e);
    }
    if let Some(reason) = shutdown.reason() {
        tracing::info!(?reason, "tool chain interrupted");
        return Ok(ExitCode::from(reason.exit_code()));
    }
    anyhow::ensure!(failures == 0, "{} did not finish successfully", args.tool);
    Ok(ExitCode::SUCCESS)
}

/// 打印事件直到通道关闭，返回未成功结束的工具数
async fn print_events(mut rx: broadcast::Receiver<ToolchainEvent>, json: bool) -> usize {
    let mut failures = 0;
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, "event printer lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        if let ToolchainEvent::ToolFinished { status, .. } = &event {
            if !status.is_ok() {
                failures += 1;
            }
        }
        if json {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => tracing::warn!("cannot serialize event: {}", e),
            }
            continue;
        }
        match event {
            ToolchainEvent::Message { severity, tool, text, .. } => {
                let level = match severity {
                    Severity::Info => "",
                    Severity::Warning => "warning: ",
                    Severity::Error => "error: ",
                };
                println!("[{}] {}{}", tool, level, text);
            }
            ToolchainEvent::Output { text, .. } => println!("{}", text),
            ToolchainEvent::ToolStarted { tool } => println!("==> {}", tool),
            ToolchainEvent::ToolFinished { tool, status } => println!("<== {} ({})", tool, status),
            ToolchainEvent::JumpToFirstError { tool, file, line } => {
                let file = file.unwrap_or_default();
                match line {
                    Some(line) => println!("[{}] first error at {}:{}", tool, file, line),
                    None => println!("[{}] first error in {}", tool, file),
                }
            }
            ToolchainEvent::ClearLog
            | ToolchainEvent::StopEnabled { .. }
            | ToolchainEvent::RequestSaveAll => {}
        }
    }
    failures
}
