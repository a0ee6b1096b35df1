//! 参数字典：`%source`、`%target` 等占位符 -> 展开值
//!
//! 展开是纯字符串替换：单遍扫描模板，同一位置优先匹配更长的键，替换结果不会被再次扫描，
//! 因此键的迭代顺序是确定的，命令行可复现。shell 引用由 Launcher 通过 `expand_for_shell` 决定。

use std::borrow::Cow;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    value: String,
    /// 原样拼入命令行（如 `%options`），shell 展开时不加引号
    raw: bool,
}

/// 占位符字典：键唯一，后写覆盖
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParamDict {
    entries: BTreeMap<String, Entry>,
}

impl ParamDict {
    pub fn new() -> Self {
        Self::default()
    }

    /// 插入或覆盖；返回键是否为新键
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> bool {
        self.insert(key.into(), value.into(), false)
    }

    /// 插入一段已是命令行片段的值（shell 展开时不加引号）
    pub fn set_raw(&mut self, key: impl Into<String>, value: impl Into<String>) -> bool {
        self.insert(key.into(), value.into(), true)
    }

    fn insert(&mut self, key: String, value: String, raw: bool) -> bool {
        self.entries.insert(key, Entry { value, raw }).is_none()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(|e| e.value.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, e)| (k.as_str(), e.value.as_str()))
    }

    /// 替换模板中所有已知键的每一次出现
    pub fn expand(&self, template: &str) -> String {
        self.expand_with(template, |entry| Cow::Borrowed(entry.value.as_str()))
    }

    /// 同 `expand`，但非 raw 的值经过 shell 引用
    pub fn expand_for_shell(&self, template: &str) -> String {
        self.expand_with(template, |entry| {
            if entry.raw {
                Cow::Borrowed(entry.value.as_str())
            } else {
                shell_quote(&entry.value)
            }
        })
    }

    fn expand_with<'a, F>(&'a self, template: &str, render: F) -> String
    where
        F: Fn(&'a Entry) -> Cow<'a, str>,
    {
        if self.entries.is_empty() {
            return template.to_string();
        }
        // 长键优先，同长度按字典序；`%S` 不会截断 `%SOURCE` 之类的更长键
        let mut keys: Vec<(&String, &Entry)> =
            self.entries.iter().filter(|(k, _)| !k.is_empty()).collect();
        keys.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(b.0)));

        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        'scan: while !rest.is_empty() {
            for (key, entry) in &keys {
                if rest.starts_with(key.as_str()) {
                    out.push_str(&render(*entry));
                    rest = &rest[key.len()..];
                    continue 'scan;
                }
            }
            let mut chars = rest.chars();
            if let Some(c) = chars.next() {
                out.push(c);
            }
            rest = chars.as_str();
        }
        out
    }
}

/// POSIX shell 单引号引用；只含安全字符时原样返回
pub fn shell_quote(s: &str) -> Cow<'_, str> {
    let safe = !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=+,@%".contains(c));
    if safe {
        Cow::Borrowed(s)
    } else {
        Cow::Owned(format!("'{}'", s.replace('\'', r"'\''")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ParamDict {
        let mut d = ParamDict::new();
        d.set("%source", "paper.tex");
        d.set("%S", "paper");
        d.set("%dir_base", "/home/u/thesis");
        d
    }

    #[test]
    fn test_set_reports_new_keys() {
        let mut d = ParamDict::new();
        assert!(d.set("%S", "a"));
        assert!(!d.set("%S", "b"));
        assert_eq!(d.get("%S"), Some("b"));
        assert_eq!(d.len(), 1);
    }

    #[test]
    fn test_expand_replaces_every_occurrence() {
        let d = sample();
        assert_eq!(
            d.expand("%S.aux %S.log %source"),
            "paper.aux paper.log paper.tex"
        );
    }

    #[test]
    fn test_expand_is_idempotent_without_keys() {
        let d = sample();
        let s = "pdflatex -interaction=nonstopmode 100%";
        assert_eq!(d.expand(s), s);
        assert_eq!(d.expand(&d.expand(s)), d.expand(s));
    }

    #[test]
    fn test_values_are_not_rescanned() {
        let mut d = ParamDict::new();
        d.set("%target", "%S.pdf");
        d.set("%S", "paper");
        assert_eq!(d.expand("%target"), "%S.pdf");
    }

    #[test]
    fn test_longer_key_wins() {
        let mut d = ParamDict::new();
        d.set("%dir", "X");
        d.set("%dir_target", "/out");
        assert_eq!(d.expand("%dir_target/%dir"), "/out/X");
    }

    #[test]
    fn test_expand_for_shell_quotes_non_raw_values() {
        let mut d = ParamDict::new();
        d.set("%source", "my paper.tex");
        d.set_raw("%options", "-interaction=nonstopmode 'my paper.tex'");
        assert_eq!(
            d.expand_for_shell("latex %options"),
            "latex -interaction=nonstopmode 'my paper.tex'"
        );
        assert_eq!(d.expand_for_shell("cat %source"), "cat 'my paper.tex'");
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("paper.tex"), "paper.tex");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }
}
