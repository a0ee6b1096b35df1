//! Factory：按配置中的 `class` 构造 Tool 并立即配置
//!
//! 没有配置分组或 class 未知时返回错误，调用方不得把它排入队列。

use crate::core::ToolchainError;
use crate::tools::store::ToolConfigStore;
use crate::tools::tool::{Tool, ToolClass};

#[derive(Debug, Clone, Default)]
pub struct Factory {
    store: ToolConfigStore,
}

impl Factory {
    pub fn new(store: ToolConfigStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &ToolConfigStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut ToolConfigStore {
        &mut self.store
    }

    /// variant 为 None 时使用当前选中的变体
    pub fn create(&self, name: &str, variant: Option<&str>) -> Result<Tool, ToolchainError> {
        let variant = self.store.resolve_variant(name, variant);
        let map = self
            .store
            .entry_map(name, Some(&variant))
            .ok_or_else(|| ToolchainError::UnknownTool(name.to_string()))?;
        let class_name = map.get("class").map(String::as_str).unwrap_or("");
        let class: ToolClass = class_name
            .parse()
            .map_err(|_| ToolchainError::UnknownClass {
                tool: name.to_string(),
                class: class_name.to_string(),
            })?;

        let mut tool = Tool::new(name, &variant, class);
        tool.configure(&self.store)?;
        tracing::debug!(tool = name, %variant, %class, id = %tool.id(), "created tool");
        Ok(tool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::tool::ToolState;

    fn factory() -> Factory {
        Factory::new(ToolConfigStore::standard().unwrap())
    }

    #[test]
    fn test_create_known_tool() {
        let tool = factory().create("LaTeX", None).unwrap();
        assert_eq!(tool.class(), ToolClass::LaTeX);
        assert_eq!(tool.variant(), "Default");
        assert_eq!(tool.state(), ToolState::Configuring);
        assert_eq!(tool.read_entry("autoRun"), "yes");
    }

    #[test]
    fn test_create_with_variant() {
        let tool = factory().create("ViewPDF", Some("Document")).unwrap();
        assert_eq!(tool.read_entry("type"), "DocPart");
        assert!(tool.is_viewer());
    }

    #[test]
    fn test_unknown_tool_and_variant() {
        let f = factory();
        assert!(matches!(
            f.create("NoSuchTool", None),
            Err(ToolchainError::UnknownTool(_))
        ));
        assert!(matches!(
            f.create("LaTeX", Some("NoSuchVariant")),
            Err(ToolchainError::UnknownTool(_))
        ));
    }

    #[test]
    fn test_unknown_class() {
        let store = ToolConfigStore::from_toml_str(
            r#"
            [tool.Preview.Default]
            class = "LaTeXpreview"
            type = "Process"
            "#,
        )
        .unwrap();
        let err = Factory::new(store).create("Preview", None).unwrap_err();
        assert!(matches!(err, ToolchainError::UnknownClass { .. }));
    }
}
