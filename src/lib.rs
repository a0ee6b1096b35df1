//! texchain - TeX 工具链编排
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误、结果码与关闭信号
//! - **document**: 文档模型协作者（根文档、宏包、参考文献、修改时间）
//! - **host**: 用户确认与内嵌查看器宿主
//! - **output**: 编译日志解析
//! - **tools**: 参数字典、Launcher、Tool 状态机、Factory、Manager 队列与自动重跑

pub mod config;
pub mod core;
pub mod document;
pub mod host;
pub mod observability;
pub mod output;
pub mod tools;

pub use crate::core::{LaunchError, ToolStatus, ToolchainError};
pub use crate::tools::{Manager, ManagerBuilder, ToolchainHandle, ToolchainService};
