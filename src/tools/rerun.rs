//! 自动重跑判定
//!
//! 编译器成功结束后决定工具链是否已到不动点：参考文献、索引过期或日志里有 "Rerun" 提示时，
//! 重新安排 BibTeX / MakeIndex / Asymptote 与编译器本身。计数器随一次顶层编译沿子工具传递，
//! 编译器最多被自动重跑 `MAX_RERUNS` 次。

use std::path::Path;
use std::time::SystemTime;

use crate::document::DocumentModel;
use crate::output::LogSummary;

pub const MAX_RERUNS: u32 = 2;

/// 当前编译处于第几次自动重跑（顶层编译为 0）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct RerunCounter(u32);

impl RerunCounter {
    pub fn new() -> Self {
        Self(0)
    }

    pub fn value(self) -> u32 {
        self.0
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    pub fn is_exhausted(self) -> bool {
        self.0 >= MAX_RERUNS
    }
}

/// 三个相互独立的过期触发器与日志提示
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RerunTriggers {
    pub bibliography: bool,
    pub index: bool,
    pub asymptote: bool,
    pub rerun_warning: bool,
}

impl RerunTriggers {
    /// 从文档模型与日志收集触发器
    pub fn collect(
        documents: &dyn DocumentModel,
        source: &Path,
        target_dir: &Path,
        stem: &str,
        log: &LogSummary,
    ) -> Self {
        let newest = documents.last_modified(source);
        let packages = documents.packages(source);
        let uses = |pkg: &str| packages.iter().any(|p| p == pkg);

        let bibliography = !documents.bibliographies(source).is_empty()
            && needs_update(&target_dir.join(format!("{}.bbl", stem)), newest);
        let index = uses("makeidx") && needs_update(&target_dir.join(format!("{}.ind", stem)), newest);

        Self {
            bibliography,
            index,
            asymptote: uses("asymptote"),
            rerun_warning: log.has_rerun_hint(),
        }
    }
}

/// 本次结束后要安排的子工具
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RerunPlan {
    pub bibliography: bool,
    pub index: bool,
    pub asymptote: bool,
    /// 是否重新安排编译器
    pub rerun: bool,
    /// 重新安排的编译器携带的计数
    pub next: RerunCounter,
}

/// 纯函数：计数已满或有错误时不安排任何东西；Asymptote 只在第一遍触发
pub fn plan_reruns(counter: RerunCounter, errors: usize, triggers: RerunTriggers) -> RerunPlan {
    if counter.is_exhausted() {
        tracing::debug!(counter = counter.value(), "already rerun the maximum number of times");
        return RerunPlan::default();
    }
    if errors > 0 {
        tracing::debug!(errors, "errors found, not running again");
        return RerunPlan::default();
    }

    let asymptote = counter.value() == 0 && triggers.asymptote;
    let rerun = asymptote || triggers.bibliography || triggers.index || triggers.rerun_warning;
    tracing::debug!(
        asy = asymptote,
        bibs = triggers.bibliography,
        index = triggers.index,
        warning = triggers.rerun_warning,
        rerun,
        "rerun check"
    );
    RerunPlan {
        bibliography: triggers.bibliography,
        index: triggers.index,
        asymptote,
        rerun,
        next: if rerun { counter.next() } else { RerunCounter::new() },
    }
}

/// 目标不存在或比最新的源文件旧时需要更新；源文件时间未知时不更新
pub fn needs_update(target: &Path, newest_source: Option<SystemTime>) -> bool {
    let Some(newest) = newest_source else {
        return false;
    };
    match std::fs::metadata(target).and_then(|m| m.modified()) {
        Ok(modified) => modified < newest,
        Err(_) => true,
    }
}
