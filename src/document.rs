//! 文档模型协作者：回答「当前编译目标是谁、引用了哪些宏包/参考文献、最近修改时间」等问题
//!
//! Tool 只读地查询它。`FsDocumentModel` 直接扫描磁盘上的 .tex 源文件，供 CLI 使用；
//! 测试使用 `tools::testing::MemoryDocumentModel`。

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::SystemTime;

use regex::Regex;

/// 当前编译目标
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileTarget {
    Path(PathBuf),
    /// 活动文档从未保存过
    Untitled,
}

pub trait DocumentModel: Send + Sync {
    fn has_active_document(&self) -> bool;

    /// 活动文档的磁盘路径（未保存时为 None）
    fn active_document(&self) -> Option<PathBuf>;

    /// 主文档（或活动文档本身）；无法确定主文档时返回 None
    fn compile_target(&self) -> Option<CompileTarget>;

    /// 是否为可编译的根文档
    fn is_root(&self, path: &Path) -> bool;

    /// 根文档及其包含文件引用的宏包
    fn packages(&self, path: &Path) -> Vec<String>;

    fn bibliographies(&self, path: &Path) -> Vec<String>;

    /// 参与编译的文件中最新的修改时间
    fn last_modified(&self, path: &Path) -> Option<SystemTime>;

    /// 光标所在行（0 起始）
    fn cursor_line(&self) -> Option<usize>;

    /// `<dir>/<stem>-*.asy` 图形的数量
    fn asy_figures(&self, dir: &Path, stem: &str) -> usize;

    /// 运行前保存所有打开的文档
    fn save_all(&self) {}
}

fn documentclass_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^[^%\n]*\\documentclass").expect("valid regex"))
}

fn magic_root_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?mi)^\s*%\s*!\s*TEX\s+root\s*=\s*(.+?)\s*$").expect("valid regex")
    })
}

fn usepackage_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^[^%\n]*?\\(?:usepackage|RequirePackage)\s*(?:\[[^\]]*\])?\s*\{([^}]*)\}")
            .expect("valid regex")
    })
}

fn bibliography_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^[^%\n]*?\\(?:bibliography|addbibresource)\s*(?:\[[^\]]*\])?\s*\{([^}]*)\}")
            .expect("valid regex")
    })
}

fn input_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^[^%\n]*?\\(?:input|include)\s*\{([^}]*)\}").expect("valid regex")
    })
}

fn comma_list(caps: regex::CaptureMatches<'_, '_>) -> Vec<String> {
    caps.flat_map(|c| {
        c[1].split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
    })
    .collect()
}

fn with_default_extension(dir: &Path, name: &str, ext: &str) -> PathBuf {
    let path = dir.join(name);
    if path.extension().is_some() {
        path
    } else {
        path.with_extension(ext)
    }
}

/// 基于文件系统的文档模型：活动文档是一个磁盘文件
#[derive(Debug, Clone, Default)]
pub struct FsDocumentModel {
    active: Option<PathBuf>,
    cursor_line: Option<usize>,
}

impl FsDocumentModel {
    pub fn new(active: Option<PathBuf>) -> Self {
        Self {
            active,
            cursor_line: None,
        }
    }

    pub fn with_cursor_line(mut self, line: usize) -> Self {
        self.cursor_line = Some(line);
        self
    }

    /// 根文档与其 \input / \include 递归引用的文件
    fn contributing_files(&self, root: &Path) -> Vec<PathBuf> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![root.to_path_buf()];
        let mut files = Vec::new();
        while let Some(path) = stack.pop() {
            if !seen.insert(path.clone()) {
                continue;
            }
            let Ok(text) = std::fs::read_to_string(&path) else {
                continue;
            };
            let dir = root.parent().unwrap_or(Path::new("."));
            for caps in input_re().captures_iter(&text) {
                stack.push(with_default_extension(dir, caps[1].trim(), "tex"));
            }
            files.push(path);
        }
        files
    }

    fn read_all(&self, root: &Path) -> String {
        self.contributing_files(root)
            .iter()
            .filter_map(|p| std::fs::read_to_string(p).ok())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl DocumentModel for FsDocumentModel {
    fn has_active_document(&self) -> bool {
        self.active.is_some()
    }

    fn active_document(&self) -> Option<PathBuf> {
        self.active
            .clone()
            .filter(|p| !p.as_os_str().is_empty())
    }

    fn compile_target(&self) -> Option<CompileTarget> {
        let active = self.active.as_ref()?;
        if active.as_os_str().is_empty() {
            return Some(CompileTarget::Untitled);
        }
        let text = match std::fs::read_to_string(active) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(path = %active.display(), "cannot read active document: {}", e);
                return None;
            }
        };
        if let Some(caps) = magic_root_re().captures(&text) {
            let dir = active.parent().unwrap_or(Path::new("."));
            return Some(CompileTarget::Path(dir.join(caps[1].trim())));
        }
        Some(CompileTarget::Path(active.clone()))
    }

    fn is_root(&self, path: &Path) -> bool {
        std::fs::read_to_string(path)
            .map(|text| documentclass_re().is_match(&text))
            .unwrap_or(false)
    }

    fn packages(&self, path: &Path) -> Vec<String> {
        comma_list(usepackage_re().captures_iter(&self.read_all(path)))
    }

    fn bibliographies(&self, path: &Path) -> Vec<String> {
        comma_list(bibliography_re().captures_iter(&self.read_all(path)))
    }

    fn last_modified(&self, path: &Path) -> Option<SystemTime> {
        let dir = path.parent().unwrap_or(Path::new("."));
        let bibs = self
            .bibliographies(path)
            .into_iter()
            .map(|b| with_default_extension(dir, &b, "bib"));
        self.contributing_files(path)
            .into_iter()
            .chain(bibs)
            .filter_map(|p| std::fs::metadata(p).and_then(|m| m.modified()).ok())
            .max()
    }

    fn cursor_line(&self) -> Option<usize> {
        self.cursor_line
    }

    fn asy_figures(&self, dir: &Path, stem: &str) -> usize {
        let pattern = format!(
            "{}/{}-*.asy",
            glob::Pattern::escape(&dir.to_string_lossy()),
            glob::Pattern::escape(stem)
        );
        match glob::glob(&pattern) {
            Ok(paths) => paths.filter_map(Result::ok).count(),
            Err(e) => {
                tracing::warn!("bad asy glob {}: {}", pattern, e);
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAIN: &str = r"\documentclass{article}
\usepackage[utf8]{inputenc}
\usepackage{makeidx, amsmath}
% \usepackage{ignored}
\begin{document}
\input{chapter}
\bibliography{refs}
\end{document}
";

    #[test]
    fn test_root_packages_and_bibliographies() {
        let dir = tempfile::tempdir().unwrap();
        let main = dir.path().join("main.tex");
        std::fs::write(&main, MAIN).unwrap();
        std::fs::write(dir.path().join("chapter.tex"), "\\usepackage{asymptote}\n").unwrap();
        let model = FsDocumentModel::new(Some(main.clone()));

        assert!(model.is_root(&main));
        assert!(!model.is_root(&dir.path().join("chapter.tex")));
        let mut pkgs = model.packages(&main);
        pkgs.sort();
        assert_eq!(pkgs, vec!["amsmath", "asymptote", "inputenc", "makeidx"]);
        assert_eq!(model.bibliographies(&main), vec!["refs"]);
        assert!(model.last_modified(&main).is_some());
    }

    #[test]
    fn test_magic_root_comment() {
        let dir = tempfile::tempdir().unwrap();
        let chapter = dir.path().join("chapter.tex");
        std::fs::write(&chapter, "% !TEX root = main.tex\n\\section{A}\n").unwrap();
        let model = FsDocumentModel::new(Some(chapter));
        assert_eq!(
            model.compile_target(),
            Some(CompileTarget::Path(dir.path().join("main.tex")))
        );
    }

    #[test]
    fn test_untitled_and_missing() {
        assert_eq!(
            FsDocumentModel::new(Some(PathBuf::new())).compile_target(),
            Some(CompileTarget::Untitled)
        );
        let none = FsDocumentModel::new(None);
        assert!(!none.has_active_document());
        assert_eq!(none.compile_target(), None);
    }

    #[test]
    fn test_asy_figures_glob() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["paper-1.asy", "paper-2.asy", "other-1.asy"] {
            std::fs::write(dir.path().join(name), "").unwrap();
        }
        let model = FsDocumentModel::default();
        assert_eq!(model.asy_figures(dir.path(), "paper"), 2);
    }
}
