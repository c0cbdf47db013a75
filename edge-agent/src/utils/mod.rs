//! 工具模块 - 日志和输入校验
//!
//! 错误类型来自 `shared::error`，这里只做再导出。

pub mod logger;
pub mod validation;

pub use shared::error::{AppError, AppResult, ErrorCode};
