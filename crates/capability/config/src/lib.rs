//! 连接配置加载。
//!
//! 支持两种来源：
//! - JSON（设备接入配置中的 `protocol_config`）
//! - 环境变量（`PLC_*`）
//!
//! ```json
//! { "host": "192.168.1.100", "port": 502, "receive_timeout_ms": 2000, "persistent": true }
//! ```

use serde::{Deserialize, Deserializer, Serialize};
use std::env;

/// 配置加载错误。
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required env: {0}")]
    Missing(String),
    #[error("invalid value for {0}: {1}")]
    Invalid(String, String),
    #[error("config parse error: {0}")]
    Parse(String),
}

/// 传输类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    #[default]
    Tcp,
    Udp,
}

/// 单个设备连接的配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// 设备主机地址
    pub host: String,
    /// 设备端口
    pub port: u16,
    /// 传输类型
    #[serde(default)]
    pub transport: TransportKind,
    /// 连接超时（毫秒）
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// 接收超时（毫秒）；负数表示不等待响应，0 表示不限时
    #[serde(default = "default_receive_timeout")]
    pub receive_timeout_ms: i64,
    /// 发送后、接收前的等待时间（毫秒）
    #[serde(default)]
    pub sleep_before_receive_ms: u64,
    /// TCP keep-alive 间隔（毫秒），为空或 0 则不启用
    #[serde(default, deserialize_with = "non_zero_millis")]
    pub keep_alive_ms: Option<u64>,
    /// 是否长连接
    #[serde(default)]
    pub persistent: bool,
    /// 单连接允许同时排队的等待者上限
    #[serde(default = "default_lock_limit")]
    pub lock_limit: usize,
    /// 帧头对齐最大重试次数
    #[serde(default = "default_max_realign_attempts")]
    pub max_realign_attempts: usize,
    /// 单帧内容最大长度（字节）
    #[serde(default = "default_max_content_length")]
    pub max_content_length: usize,
}

fn non_zero_millis<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<u64>::deserialize(deserializer)?.filter(|ms| *ms > 0))
}

fn default_connect_timeout() -> u64 {
    10_000
}

fn default_receive_timeout() -> i64 {
    5_000
}

fn default_lock_limit() -> usize {
    1_000
}

fn default_max_realign_attempts() -> usize {
    10
}

fn default_max_content_length() -> usize {
    16 * 1024 * 1024
}

impl ConnectionConfig {
    /// 以默认参数构造指定端点的配置。
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            transport: TransportKind::default(),
            connect_timeout_ms: default_connect_timeout(),
            receive_timeout_ms: default_receive_timeout(),
            sleep_before_receive_ms: 0,
            keep_alive_ms: None,
            persistent: false,
            lock_limit: default_lock_limit(),
            max_realign_attempts: default_max_realign_attempts(),
            max_content_length: default_max_content_length(),
        }
    }

    /// 从 JSON 配置字符串解析
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// 从环境变量读取配置。
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = env::var("PLC_HOST").map_err(|_| ConfigError::Missing("PLC_HOST".to_string()))?;
        let port = read_u16("PLC_PORT")?;
        let transport = match read_optional("PLC_TRANSPORT") {
            None => TransportKind::default(),
            Some(value) => match value.to_ascii_lowercase().as_str() {
                "tcp" => TransportKind::Tcp,
                "udp" => TransportKind::Udp,
                _ => return Err(ConfigError::Invalid("PLC_TRANSPORT".to_string(), value)),
            },
        };
        let connect_timeout_ms =
            read_u64_with_default("PLC_CONNECT_TIMEOUT_MS", default_connect_timeout())?;
        let receive_timeout_ms =
            read_i64_with_default("PLC_RECEIVE_TIMEOUT_MS", default_receive_timeout())?;
        let sleep_before_receive_ms = read_u64_with_default("PLC_SLEEP_BEFORE_RECEIVE_MS", 0)?;
        let keep_alive_ms = read_optional_u64("PLC_KEEP_ALIVE_MS")?.filter(|value| *value > 0);
        let persistent = read_bool_with_default("PLC_PERSISTENT", false);
        let lock_limit = read_usize_with_default("PLC_LOCK_LIMIT", default_lock_limit())?;
        let max_realign_attempts =
            read_usize_with_default("PLC_MAX_REALIGN_ATTEMPTS", default_max_realign_attempts())?;

        Ok(Self {
            host,
            port,
            transport,
            connect_timeout_ms,
            receive_timeout_ms,
            sleep_before_receive_ms,
            keep_alive_ms,
            persistent,
            lock_limit,
            max_realign_attempts,
            max_content_length: default_max_content_length(),
        })
    }

    /// `host:port` 形式的端点。
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn read_u16(key: &str) -> Result<u16, ConfigError> {
    let value = env::var(key).map_err(|_| ConfigError::Missing(key.to_string()))?;
    value
        .parse::<u16>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_u64_with_default(key: &str, default: u64) -> Result<u64, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .parse::<u64>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_i64_with_default(key: &str, default: i64) -> Result<i64, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .parse::<i64>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_usize_with_default(key: &str, default: usize) -> Result<usize, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .parse::<usize>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_optional(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(value) if !value.is_empty() => Some(value),
        _ => None,
    }
}

fn read_optional_u64(key: &str) -> Result<Option<u64>, ConfigError> {
    match env::var(key) {
        Ok(value) if value.is_empty() => Ok(None),
        Ok(value) => value
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(key.to_string(), value)),
        Err(_) => Ok(None),
    }
}

fn read_bool_with_default(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(value) => matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "on"),
        Err(_) => default,
    }
}
