//! 核心层：错误与结果码、关闭信号

pub mod error;
pub mod shutdown;

pub use error::{LaunchError, ToolStatus, ToolchainError};
pub use shutdown::{ShutdownManager, ShutdownReason};
