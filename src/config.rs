//! 应用配置：从 config/default.toml、用户文件与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `TEXCHAIN__*` 覆盖（双下划线表示嵌套，如 `TEXCHAIN__APP__WATCH_FILE=true`）。
//! 工具定义本身不在这里，见 `tools::store`；这里只记录用户定义文件的位置。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::tools::manager::ManagerSettings;

/// 应用配置根
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub tools: ToolsSection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    /// 距上次运行超过该毫秒数才清空日志
    #[serde(default = "default_clear_log_timeout_ms")]
    pub clear_log_timeout_ms: u64,
    /// 监视文件模式：Sequence 跳过查看器
    #[serde(default)]
    pub watch_file: bool,
    /// 对「继续吗？」类问题自动回答
    #[serde(default)]
    pub auto_confirm: bool,
}

fn default_clear_log_timeout_ms() -> u64 {
    10_000
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            clear_log_timeout_ms: default_clear_log_timeout_ms(),
            watch_file: false,
            auto_confirm: false,
        }
    }
}

/// [tools] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ToolsSection {
    /// 用户工具定义（TOML），叠加在内置定义之上
    pub definitions: Option<PathBuf>,
    /// Konsole 类型工具使用的终端命令
    pub terminal: Option<String>,
}

impl AppConfig {
    pub fn manager_settings(&self) -> ManagerSettings {
        ManagerSettings {
            clear_log_timeout: Duration::from_millis(self.app.clear_log_timeout_ms),
            watch_file: self.app.watch_file,
        }
    }
}

/// 加载配置，环境变量 TEXCHAIN__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件
/// 3. 最后叠加环境变量
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("TEXCHAIN")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
