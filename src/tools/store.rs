//! 工具配置存储：`Tool/<name>/<variant>` 分组的键值表
//!
//! 内置定义来自 config/tools.toml（编译期嵌入），用户定义按分组覆盖。
//! 核心只读；唯一的写操作 `set_config_name` 只改内存中的选中变体。

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;

use crate::core::ToolchainError;
use crate::tools::launcher::LauncherKind;
use crate::tools::tool::ToolClass;

/// 单个分组的键值表
pub type ToolConfig = BTreeMap<String, String>;

/// 未选择变体时使用的名字
pub const DEFAULT_VARIANT: &str = "Default";

const STANDARD_TOOLS: &str = include_str!("../../config/tools.toml");

#[derive(Debug, Deserialize, Default)]
struct DefinitionFile {
    #[serde(default)]
    selected: BTreeMap<String, String>,
    #[serde(default)]
    tool: BTreeMap<String, BTreeMap<String, BTreeMap<String, toml::Value>>>,
}

/// 分组化的工具配置
#[derive(Debug, Clone, Default)]
pub struct ToolConfigStore {
    groups: BTreeMap<String, ToolConfig>,
    selected: BTreeMap<String, String>,
}

impl ToolConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 内置标准工具集
    pub fn standard() -> Result<Self, ToolchainError> {
        Self::from_toml_str(STANDARD_TOOLS)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ToolchainError> {
        let file: DefinitionFile = toml::from_str(text)?;
        let mut store = Self::new();
        for (tool, variants) in file.tool {
            for (variant, entries) in variants {
                let map = entries
                    .into_iter()
                    .map(|(k, v)| (k, value_to_entry(v)))
                    .collect();
                store.insert_group(&tool, &variant, map);
            }
        }
        store.selected = file.selected;
        Ok(store)
    }

    /// 读取用户定义文件
    pub fn load(path: &Path) -> Result<Self, ToolchainError> {
        let text = std::fs::read_to_string(path).map_err(|source| ToolchainError::DefinitionsIo {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// 用另一份定义覆盖（分组整体替换，选中变体逐项覆盖）
    pub fn merge(&mut self, other: ToolConfigStore) {
        self.groups.extend(other.groups);
        self.selected.extend(other.selected);
    }

    pub fn insert_group(&mut self, tool: &str, variant: &str, map: ToolConfig) {
        self.groups.insert(group_for(tool, variant), map);
    }

    pub fn has_group(&self, tool: &str, variant: &str) -> bool {
        self.groups.contains_key(&group_for(tool, variant))
    }

    /// 变体的键值表；variant 为空时使用当前选中的变体
    pub fn entry_map(&self, tool: &str, variant: Option<&str>) -> Option<&ToolConfig> {
        let variant = self.resolve_variant(tool, variant);
        self.groups.get(&group_for(tool, &variant))
    }

    pub fn resolve_variant(&self, tool: &str, variant: Option<&str>) -> String {
        match variant.map(str::trim).filter(|v| !v.is_empty()) {
            Some(v) => v.to_string(),
            None => self.config_name(tool),
        }
    }

    /// 当前选中的变体名，默认 "Default"
    pub fn config_name(&self, tool: &str) -> String {
        self.selected
            .get(tool)
            .cloned()
            .unwrap_or_else(|| DEFAULT_VARIANT.to_string())
    }

    pub fn set_config_name(&mut self, tool: &str, variant: &str) {
        tracing::debug!(tool, variant, "select tool config");
        self.selected.insert(tool.to_string(), variant.to_string());
    }

    pub fn group_for(&self, tool: &str) -> String {
        group_for(tool, &self.config_name(tool))
    }

    /// 某个工具定义的全部变体
    pub fn config_names(&self, tool: &str) -> Vec<String> {
        let prefix = format!("Tool/{tool}/");
        self.groups
            .keys()
            .filter_map(|g| g.strip_prefix(&prefix))
            .map(str::to_string)
            .collect()
    }

    /// 选中变体存在的工具，按 toolbarPos 排序（缺省或非数字排在最后）；
    /// menu_only 时只保留 menu 不为 "none" 的工具
    pub fn tool_list(&self, menu_only: bool) -> Vec<String> {
        let mut tools: Vec<(i64, String)> = Vec::new();
        for group in self.groups.keys() {
            let Some((tool, variant)) = split_group(group) else {
                continue;
            };
            if variant != self.config_name(tool) {
                continue;
            }
            let Some(map) = self.groups.get(group) else {
                continue;
            };
            if menu_only && map.get("menu").map_or(true, |m| m == "none") {
                continue;
            }
            let pos = map
                .get("toolbarPos")
                .and_then(|p| p.parse::<i64>().ok())
                .unwrap_or(1000);
            tools.push((pos, tool.to_string()));
        }
        tools.sort();
        tools.into_iter().map(|(_, name)| name).collect()
    }

    /// 启动时校验：class 与 type 都必须属于已知集合
    pub fn validate(&self) -> Vec<ToolchainError> {
        let mut problems = Vec::new();
        for (group, map) in &self.groups {
            let tool = split_group(group).map_or(group.as_str(), |(t, _)| t);
            let class = map.get("class").map(String::as_str).unwrap_or("");
            if class.parse::<ToolClass>().is_err() {
                problems.push(ToolchainError::UnknownClass {
                    tool: tool.to_string(),
                    class: class.to_string(),
                });
            }
            let kind = map.get("type").map(String::as_str).unwrap_or("");
            if kind != "Sequence" && kind.parse::<LauncherKind>().is_err() {
                problems.push(ToolchainError::UnknownLauncher {
                    tool: tool.to_string(),
                    kind: kind.to_string(),
                });
            }
        }
        problems
    }
}

fn value_to_entry(value: toml::Value) -> String {
    match value {
        toml::Value::String(s) => s,
        toml::Value::Boolean(true) => "yes".to_string(),
        toml::Value::Boolean(false) => "no".to_string(),
        other => other.to_string(),
    }
}

fn split_group(group: &str) -> Option<(&str, &str)> {
    let rest = group.strip_prefix("Tool/")?;
    rest.rsplit_once('/')
}

/// 分组键 `Tool/<tool>/<variant>`
pub fn group_for(tool: &str, variant: &str) -> String {
    format!("Tool/{tool}/{variant}")
}

/// 解析 `tool(config)`；没有括号时 config 为 None
pub fn extract(entry: &str) -> (String, Option<String>) {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"^(.*)\((.*)\)$").expect("valid regex"));
    let entry = entry.trim();
    match re.captures(entry) {
        Some(caps) => (caps[1].trim().to_string(), Some(caps[2].trim().to_string())),
        None => (entry.to_string(), None),
    }
}

/// `extract` 的逆操作
pub fn format(tool: &str, variant: Option<&str>) -> String {
    match variant {
        Some(v) => format!("{tool}({v})"),
        None => tool.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_tools_parse_and_validate() {
        let store = ToolConfigStore::standard().unwrap();
        assert!(store.has_group("LaTeX", "Default"));
        assert!(store.validate().is_empty(), "{:?}", store.validate());
        let latex = store.entry_map("LaTeX", None).unwrap();
        assert_eq!(latex.get("class").unwrap(), "LaTeX");
        assert_eq!(latex.get("autoRun").unwrap(), "yes");
        assert_eq!(latex.get("toolbarPos").unwrap(), "0");
    }

    #[test]
    fn test_selected_variant() {
        let store = ToolConfigStore::standard().unwrap();
        assert_eq!(store.config_name("ViewDVI"), "Okular");
        assert_eq!(store.config_name("NotConfigured"), "Default");
        assert_eq!(store.group_for("ViewDVI"), "Tool/ViewDVI/Okular");
        assert_eq!(
            store.entry_map("ViewDVI", Some("Embedded")).unwrap()["type"],
            "Part"
        );
    }

    #[test]
    fn test_config_names() {
        let store = ToolConfigStore::standard().unwrap();
        let mut names = store.config_names("LaTeX");
        names.sort();
        assert_eq!(names, vec!["Default", "Konsole", "Modern"]);
    }

    #[test]
    fn test_tool_list_sorted_by_toolbar_pos() {
        let store = ToolConfigStore::standard().unwrap();
        let tools = store.tool_list(false);
        assert_eq!(&tools[..3], &["LaTeX", "PDFLaTeX", "ViewDVI"]);
        assert!(tools.contains(&"Archive".to_string()));
        assert!(!store.tool_list(true).contains(&"Archive".to_string()));
    }

    #[test]
    fn test_merge_overrides_groups() {
        let mut store = ToolConfigStore::standard().unwrap();
        let user = ToolConfigStore::from_toml_str(
            r#"
            [selected]
            LaTeX = "Fast"

            [tool.LaTeX.Fast]
            class = "LaTeX"
            type = "Process"
            command = "latex"
            options = "-draftmode %source"
            "#,
        )
        .unwrap();
        store.merge(user);
        assert_eq!(store.config_name("LaTeX"), "Fast");
        assert_eq!(
            store.entry_map("LaTeX", None).unwrap()["options"],
            "-draftmode %source"
        );
        assert!(store.has_group("LaTeX", "Default"));
    }

    #[test]
    fn test_validate_reports_unknown_class_and_type() {
        let store = ToolConfigStore::from_toml_str(
            r#"
            [tool.Weird.Default]
            class = "Magic"
            type = "Telnet"
            "#,
        )
        .unwrap();
        let problems = store.validate();
        assert_eq!(problems.len(), 2);
    }

    #[test]
    fn test_extract_and_format() {
        assert_eq!(
            extract(" LaTeX(Modern) "),
            ("LaTeX".to_string(), Some("Modern".to_string()))
        );
        assert_eq!(extract("BibTeX"), ("BibTeX".to_string(), None));
        assert_eq!(format("LaTeX", Some("Modern")), "LaTeX(Modern)");
        assert_eq!(format("BibTeX", None), "BibTeX");
        let (tool, cfg) = extract(&format("ViewPDF", Some("Document")));
        assert_eq!(format(&tool, cfg.as_deref()), "ViewPDF(Document)");
    }
}
