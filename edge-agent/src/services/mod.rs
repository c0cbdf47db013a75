//! 服务层 - 注册、密钥与本地配置
//!
//! # 服务列表
//!
//! - [`RegistrationService`] - OIAnalytics 注册状态管理
//! - [`SecretCipher`] - 本地对称加密 (AES-GCM)
//! - [`ConfigStore`] - 本地 JSON 配置存储，实现所有领域协作者
//! - [`secrets`] / [`manifests`] - 按清单过滤与解密设置中的密钥

pub mod config_store;
pub mod crypto;
pub mod domain;
pub mod manifests;
pub mod registration;
pub mod secrets;

pub use config_store::ConfigStore;
pub use crypto::SecretCipher;
pub use domain::DomainServices;
pub use registration::RegistrationService;
