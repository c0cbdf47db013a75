//! 核心模块 - 配置、状态和后台任务
//!
//! # 模块结构
//!
//! - [`Config`] - 代理配置
//! - [`AgentState`] - 代理状态 (所有引擎的单例)
//! - [`BackgroundTasks`] - 后台任务管理
//! - [`InFlight`] - 单飞标志

pub mod config;
pub mod flight;
pub mod state;
pub mod tasks;

pub use config::Config;
pub use flight::{InFlight, InFlightGuard};
pub use state::AgentState;
pub use tasks::{BackgroundTasks, TaskKind};
