//! OIBus Edge Agent - OIAnalytics 云端命令与消息同步
//!
//! # 架构概述
//!
//! - **注册** (`services::registration`): 激活码握手、令牌与密钥对
//! - **命令同步** (`cloud::command_sync`): 拉取、取消、确认远程命令
//! - **命令执行** (`cloud::command_executor`): 逐条执行并分派到处理器
//! - **消息同步** (`cloud::message_sync`): 配置快照上送
//! - **账本** (`db`): 嵌入式 redb 存储
//!
//! 首次注册由 `OIA_HOST` 触发 (见 [`AgentState::bootstrap_registration`])；
//! 修改与注销通过 `RegistrationService` 的 API 完成。
//!
//! # 模块结构
//!
//! ```text
//! edge-agent/src/
//! ├── core/          # 配置、状态、后台任务
//! ├── cloud/         # 云端传输和三个同步引擎
//! ├── services/      # 注册、加密、本地配置
//! ├── db/            # 账本
//! └── utils/         # 日志、校验
//! ```

pub mod cloud;
pub mod core;
pub mod db;
pub mod services;
pub mod utils;

#[cfg(test)]
mod testing;

// Re-export 公共类型
pub use crate::core::{AgentState, BackgroundTasks, Config};
pub use utils::{AppError, AppResult, ErrorCode};

// Re-export logger functions
pub use utils::logger::{init_logger, init_logger_with_file};

/// 设置运行环境
///
/// 1. 加载 `.env`
/// 2. 读取配置
/// 3. 初始化日志
pub fn setup_environment() -> Config {
    if let Err(e) = dotenv::dotenv() {
        // .env is optional
        eprintln!("No .env loaded: {e}");
    }
    let config = Config::from_env();
    init_logger_with_file(Some(&config.log_level), config.log_json, config.log_dir.as_deref());
    config
}

pub fn print_banner() {
    println!(
        r#"
   ____  ________
  / __ \/  _/ __ )__  _______
 / / / // // __  / / / / ___/
/ /_/ // // /_/ / /_/ (__  )
\____/___/_____/\__,_/____/
        edge agent
    "#
    );
}
