use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// 代理配置 - 边缘代理的所有配置项
///
/// # 环境变量
///
/// 所有配置项都可以通过环境变量覆盖（启动时先加载 `.env`）：
///
/// | 环境变量 | 默认值 | 说明 |
/// |----------|--------|------|
/// | WORK_DIR | ./data | 工作目录（账本、密钥、配置、升级包） |
/// | LOG_LEVEL | info | 日志级别（RUST_LOG 优先） |
/// | LOG_JSON | false | 是否输出 JSON 日志 |
/// | LOG_DIR | 未设置 | 日志文件目录，设置后按天滚动 |
/// | AGENT_VERSION | crate 版本 | 当前运行版本，用于目标版本校验 |
/// | LAUNCHER_VERSION | crate 版本 | 启动器版本 |
/// | REGISTRATION_CHECK_INTERVAL_MS | 10000 | 注册检查轮询间隔 |
/// | HTTP_TIMEOUT_MS | 10000 | 云端请求超时 |
/// | DOWNLOAD_TIMEOUT_MS | 900000 | 升级包下载超时 |
/// | EXECUTION_POLL_INTERVAL_MS | 5000 | 命令执行兜底轮询间隔 |
/// | MESSAGE_PACING_MS | 1000 | 两条消息之间的发送间隔 |
/// | TERMINATION_GRACE_MS | 1500 | 重启/升级前等待确认的时间 |
/// | SHUTDOWN_TIMEOUT_MS | 30000 | 关闭时等待进行中任务的上限 |
/// | RSA_KEY_BITS | 2048 | 注册密钥对长度 |
/// | IGNORE_REMOTE_UPDATE | false | 拒绝远程升级命令 |
/// | OIA_HOST | 未设置 | 未注册时启动即向该 OIAnalytics 发起注册 |
///
/// 注册之后的修改 (代理、间隔、权限、注销) 通过 `RegistrationService` 完成，
/// 二进制本身只负责首次注册。
/// # 示例
///
/// ```ignore
/// WORK_DIR=/var/lib/oibus LOG_LEVEL=debug cargo run
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// 工作目录
    pub work_dir: PathBuf,
    pub log_level: String,
    pub log_json: bool,
    pub log_dir: Option<PathBuf>,
    /// 当前运行版本
    pub agent_version: String,
    pub launcher_version: String,
    pub registration_check_interval_ms: u64,
    pub http_timeout_ms: u64,
    pub download_timeout_ms: u64,
    pub execution_poll_interval_ms: u64,
    pub message_pacing_ms: u64,
    pub termination_grace_ms: u64,
    /// 关闭超时时间 (毫秒)
    pub shutdown_timeout_ms: u64,
    pub rsa_key_bits: usize,
    pub ignore_remote_update: bool,
    /// 首次注册的 OIAnalytics 地址
    pub registration_host: Option<String>,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// 从环境变量加载配置
    ///
    /// 如果环境变量未设置或无法解析，使用默认值
    pub fn from_env() -> Self {
        let version = env!("CARGO_PKG_VERSION").to_string();
        Self {
            work_dir: std::env::var("WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
            log_json: env_or("LOG_JSON", false),
            log_dir: std::env::var("LOG_DIR").ok().map(PathBuf::from),
            agent_version: std::env::var("AGENT_VERSION").unwrap_or_else(|_| version.clone()),
            launcher_version: std::env::var("LAUNCHER_VERSION").unwrap_or(version),
            registration_check_interval_ms: env_or("REGISTRATION_CHECK_INTERVAL_MS", 10_000),
            http_timeout_ms: env_or("HTTP_TIMEOUT_MS", 10_000),
            download_timeout_ms: env_or("DOWNLOAD_TIMEOUT_MS", 900_000),
            execution_poll_interval_ms: env_or("EXECUTION_POLL_INTERVAL_MS", 5_000),
            message_pacing_ms: env_or("MESSAGE_PACING_MS", 1_000),
            termination_grace_ms: env_or("TERMINATION_GRACE_MS", 1_500),
            shutdown_timeout_ms: env_or("SHUTDOWN_TIMEOUT_MS", 30_000),
            rsa_key_bits: env_or("RSA_KEY_BITS", 2048),
            ignore_remote_update: env_or("IGNORE_REMOTE_UPDATE", false),
            registration_host: std::env::var("OIA_HOST").ok().filter(|h| !h.trim().is_empty()),
        }
    }

    /// 使用自定义工作目录覆盖配置
    ///
    /// 常用于测试场景
    pub fn with_work_dir(work_dir: impl Into<PathBuf>) -> Self {
        let mut config = Self::from_env();
        config.work_dir = work_dir.into();
        config
    }

    /// 命令/消息/注册账本
    pub fn ledger_path(&self) -> PathBuf {
        self.work_dir.join("oibus.redb")
    }

    /// 本地密钥文件
    pub fn cipher_key_path(&self) -> PathBuf {
        self.work_dir.join("cipher.key")
    }

    /// 本地 JSON 配置存储
    pub fn config_store_path(&self) -> PathBuf {
        self.work_dir.join("oibus.json")
    }

    /// 升级包下载目录
    pub fn update_dir(&self) -> PathBuf {
        self.work_dir.join("update")
    }

    pub fn registration_check_interval(&self) -> Duration {
        Duration::from_millis(self.registration_check_interval_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_millis(self.download_timeout_ms)
    }

    pub fn execution_poll_interval(&self) -> Duration {
        Duration::from_millis(self.execution_poll_interval_ms)
    }

    pub fn message_pacing(&self) -> Duration {
        Duration::from_millis(self.message_pacing_ms)
    }

    pub fn termination_grace(&self) -> Duration {
        Duration::from_millis(self.termination_grace_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}
