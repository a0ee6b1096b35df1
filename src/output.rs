//! 输出解析协作者：把编译日志归类为错误 / 警告 / badbox
//!
//! `LatexLogParser` 逐行识别：`! ...` 为错误（随后的 `l.<n>` 给出行号），
//! `LaTeX ... Warning:` / `Package ... Warning:` / `Class ... Warning:` 为警告，`Overfull` / `Underfull` 为 badbox。
//! 警告一直延续到空行为止，`(<package>)` 开头的续行并入同一条警告。

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    Error,
    Warning,
    BadBox,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub message: String,
    /// 源文件行号（1 起始），日志中给出时才有
    pub line: Option<usize>,
}

/// 一次日志解析的结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LogSummary {
    pub errors: usize,
    pub warnings: usize,
    pub badboxes: usize,
    pub diagnostics: Vec<Diagnostic>,
}

impl LogSummary {
    /// 是否有警告建议重新运行编译器
    pub fn has_rerun_hint(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.kind == DiagnosticKind::Warning && d.message.contains("Rerun"))
    }

    pub fn first_error(&self) -> Option<&Diagnostic> {
        self.diagnostics.iter().find(|d| d.kind == DiagnosticKind::Error)
    }

    /// "1 error, 2 warnings, 0 badboxes"
    pub fn summary_line(&self) -> String {
        fn count(n: usize, one: &str, many: &str) -> String {
            if n == 1 {
                format!("1 {}", one)
            } else {
                format!("{} {}", n, many)
            }
        }
        format!(
            "{}, {}, {}",
            count(self.errors, "error", "errors"),
            count(self.warnings, "warning", "warnings"),
            count(self.badboxes, "badbox", "badboxes")
        )
    }
}

pub trait OutputParser: Send + Sync {
    /// 解析日志文件；日志不存在或不可读时返回 None
    fn parse(&self, log: &Path, source: &Path) -> Option<LogSummary>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LatexLogParser;

fn warning_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:LaTeX|Package|Class)(?:\s+\S+)?\s+Warning:").expect("valid regex")
    })
}

fn warning_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"on input line (\d+)").expect("valid regex"))
}

fn error_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^l\.(\d+)").expect("valid regex"))
}

fn badbox_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:Overfull|Underfull) \\[hv]box(?:.*?lines? (\d+))?").expect("valid regex")
    })
}

/// 去掉续行开头的 `(<package>)` 标记
fn continuation_text(line: &str) -> &str {
    let trimmed = line.trim_start();
    match trimmed.strip_prefix('(').and_then(|rest| rest.split_once(')')) {
        Some((tag, rest)) if !tag.is_empty() && !tag.contains(char::is_whitespace) => rest.trim(),
        _ => trimmed,
    }
}

impl LatexLogParser {
    pub fn parse_str(&self, log: &str) -> LogSummary {
        let mut summary = LogSummary::default();
        // 等待 `l.<n>` 行号的最近一条错误
        let mut pending_error: Option<usize> = None;
        // 仍可能有续行的警告
        let mut open_warning: Option<usize> = None;

        for raw in log.lines() {
            let line = raw.trim_end();
            if line.is_empty() {
                open_warning = None;
                continue;
            }
            if let Some(msg) = line.strip_prefix("! ") {
                open_warning = None;
                summary.errors += 1;
                pending_error = Some(summary.diagnostics.len());
                summary.diagnostics.push(Diagnostic {
                    kind: DiagnosticKind::Error,
                    message: msg.to_string(),
                    line: None,
                });
            } else if let Some(caps) = error_line_re().captures(line) {
                if let Some(idx) = pending_error.take() {
                    summary.diagnostics[idx].line = caps[1].parse().ok();
                }
            } else if warning_re().is_match(line) {
                summary.warnings += 1;
                open_warning = Some(summary.diagnostics.len());
                summary.diagnostics.push(Diagnostic {
                    kind: DiagnosticKind::Warning,
                    message: line.to_string(),
                    line: warning_line_re()
                        .captures(line)
                        .and_then(|c| c[1].parse().ok()),
                });
            } else if let Some(caps) = badbox_re().captures(line) {
                open_warning = None;
                summary.badboxes += 1;
                summary.diagnostics.push(Diagnostic {
                    kind: DiagnosticKind::BadBox,
                    message: line.to_string(),
                    line: caps.get(1).and_then(|m| m.as_str().parse().ok()),
                });
            } else if let Some(idx) = open_warning {
                let text = continuation_text(line);
                let warning = &mut summary.diagnostics[idx];
                if !text.is_empty() {
                    warning.message.push(' ');
                    warning.message.push_str(text);
                }
                if warning.line.is_none() {
                    warning.line = warning_line_re()
                        .captures(&warning.message)
                        .and_then(|c| c[1].parse().ok());
                }
            }
        }
        summary
    }
}

impl OutputParser for LatexLogParser {
    fn parse(&self, log: &Path, source: &Path) -> Option<LogSummary> {
        // 日志里常有非 UTF-8 字节（字体名、输入编码）
        let bytes = match std::fs::read(log) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::debug!(log = %log.display(), "no log to parse: {}", e);
                return None;
            }
        };
        let summary = self.parse_str(&String::from_utf8_lossy(&bytes));
        tracing::debug!(
            source = %source.display(),
            errors = summary.errors,
            warnings = summary.warnings,
            badboxes = summary.badboxes,
            "parsed log"
        );
        Some(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOG: &str = r"This is pdfTeX, Version 3.141592653
(./paper.tex
LaTeX Warning: Reference `fig:a' on page 1 undefined on input line 12.
Package natbib Warning: Citation `knuth' undefined on input line 14.
Overfull \hbox (12.3pt too wide) in paragraph at lines 20--22
! Undefined control sequence.
l.31 \foo
LaTeX Warning: Label(s) may have changed. Rerun to get cross-references right.

)";

    #[test]
    fn test_parse_counts_and_lines() {
        let s = LatexLogParser.parse_str(LOG);
        assert_eq!((s.errors, s.warnings, s.badboxes), (1, 3, 1));
        let err = s.first_error().unwrap();
        assert_eq!(err.message, "Undefined control sequence.");
        assert_eq!(err.line, Some(31));
        assert_eq!(s.diagnostics[0].line, Some(12));
        assert!(s.has_rerun_hint());
    }

    #[test]
    fn test_package_warning_continuation_lines() {
        let log = "Package rerunfilecheck Warning: File `paper.out' has changed.\n\
                   (rerunfilecheck)                Rerun to get outlines right\n\
                   (rerunfilecheck)                or use package `bookmark'.\n\
                   \n\
                   Package hyperref Warning: Token not allowed in a PDF string (Unicode):\n\
                   (hyperref)                removing `math shift' on input\n\
                   (hyperref)                line 7.\n\
                   \n\
                   Rerun is mentioned outside any warning.\n";
        let s = LatexLogParser.parse_str(log);
        assert_eq!(s.warnings, 2);
        assert!(s.has_rerun_hint());
        assert_eq!(
            s.diagnostics[0].message,
            "Package rerunfilecheck Warning: File `paper.out' has changed. Rerun to get outlines right or use package `bookmark'."
        );
        assert_eq!(s.diagnostics[1].line, Some(7));
        assert!(!s.diagnostics[1].message.contains("Rerun"));
    }

    #[test]
    fn test_warning_line_number_on_wrapped_line() {
        let log = "LaTeX Warning: Citation `knuth' on page 2 undefined on input\nline 42.\n\n";
        let s = LatexLogParser.parse_str(log);
        assert_eq!(s.warnings, 1);
        assert_eq!(s.diagnostics[0].line, Some(42));
    }

    #[test]
    fn test_continuation_text() {
        assert_eq!(continuation_text("(hyperref)    removing"), "removing");
        assert_eq!(continuation_text("(see the transcript file)"), "(see the transcript file)");
        assert_eq!(continuation_text("  wrapped text"), "wrapped text");
    }

    #[test]
    fn test_summary_line() {
        let s = LatexLogParser.parse_str(LOG);
        assert_eq!(s.summary_line(), "1 error, 3 warnings, 1 badbox");
        assert_eq!(LogSummary::default().summary_line(), "0 errors, 0 warnings, 0 badboxes");
    }

    #[test]
    fn test_clean_log_has_no_rerun_hint() {
        let s = LatexLogParser.parse_str("Output written on paper.dvi (1 page).\n");
        assert_eq!(s, LogSummary::default());
        assert!(!s.has_rerun_hint());
    }

    #[test]
    fn test_missing_log_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(LatexLogParser
            .parse(&dir.path().join("nope.log"), &dir.path().join("nope.tex"))
            .is_none());
    }
}
