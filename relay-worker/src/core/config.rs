use relay_client::{BusConfig, QoS, TlsCredentials};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use super::lifecycle::RelayOptions;
use crate::relay::dedup::DEFAULT_RECENT_TOKENS;

/// Configuration could not be built from the environment
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// All absent required variables, in declaration order
    #[error("Missing required environment variables: {}", .0.join(", "))]
    Missing(Vec<String>),

    #[error("Invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

/// Worker 配置 - 启动时从环境变量加载一次
///
/// # 环境变量
///
/// | 环境变量 | 默认值 | 说明 |
/// |----------|--------|------|
/// | ENDPOINT | (必填) | Broker 主机名 |
/// | CA_FILE | (必填) | CA 信任链 (PEM) |
/// | DEVICE_CERT | (必填) | 客户端证书 (PEM) |
/// | PRIVATE_KEY | (必填) | 客户端私钥 (PEM) |
/// | CLIENT_ID | (必填) | MQTT client id |
/// | SUBSCRIBE_TOPIC | (必填) | 接收工作请求的 topic |
/// | SUBMIT_TOPIC | (必填) | 发布结果的 topic |
/// | MQTT_PORT | 8883 | Broker 端口 |
/// | KEEP_ALIVE_SECS | 30 | 心跳间隔 |
/// | CLEAN_SESSION | false | 是否请求 clean session |
/// | CONNECT_TIMEOUT_MS | 30000 | 首次握手超时 |
/// | ACK_TIMEOUT_MS | 10000 | publish/subscribe 确认超时 |
/// | RECONNECT_DELAY_MS | 1000 | 首次重连延迟 |
/// | MAX_RECONNECT_DELAY_MS | 60000 | 最大重连延迟 |
/// | DRAIN_TIMEOUT_MS | 10000 | 关闭时等待进行中请求的时间 |
/// | STATS_INTERVAL_SECS | 60 | 统计日志间隔，0 表示关闭 |
/// | RECENT_TOKENS | 10000 | 用于去重的最近 task token 数量，0 表示关闭 |
/// | LOG_LEVEL | info | 默认日志级别 (RUST_LOG 优先) |
/// | LOG_DIR | (无) | 按天滚动的日志目录 |
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub endpoint: String,
    pub port: u16,
    pub ca_file: PathBuf,
    pub device_cert: PathBuf,
    pub private_key: PathBuf,
    pub client_id: String,
    pub subscribe_topic: String,
    pub submit_topic: String,
    pub keep_alive: Duration,
    pub clean_session: bool,
    pub connect_timeout: Duration,
    pub ack_timeout: Duration,
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    pub drain_timeout: Duration,
    /// `None` disables the periodic stats log
    pub stats_interval: Option<Duration>,
    pub recent_tokens: usize,
    pub log_level: String,
    pub log_dir: Option<PathBuf>,
}

const REQUIRED: [&str; 7] = [
    "ENDPOINT",
    "CA_FILE",
    "DEVICE_CERT",
    "PRIVATE_KEY",
    "CLIENT_ID",
    "SUBSCRIBE_TOPIC",
    "SUBMIT_TOPIC",
];

impl WorkerConfig {
    /// 从环境变量加载配置
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup; empty values count as absent
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let missing: Vec<String> = REQUIRED
            .iter()
            .filter(|key| get(**key).is_none())
            .map(|key| key.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }
        let required = |key: &str| get(key).unwrap_or_default();

        let submit_topic = required("SUBMIT_TOPIC");
        if submit_topic.contains(['+', '#']) {
            return Err(ConfigError::Invalid {
                key: "SUBMIT_TOPIC".to_string(),
                value: submit_topic,
                reason: "wildcards are not allowed in a publish topic".to_string(),
            });
        }

        let stats_secs: u64 = parse_or(&get, "STATS_INTERVAL_SECS", 60)?;

        Ok(Self {
            endpoint: required("ENDPOINT"),
            port: parse_or(&get, "MQTT_PORT", BusConfig::DEFAULT_PORT)?,
            ca_file: PathBuf::from(required("CA_FILE")),
            device_cert: PathBuf::from(required("DEVICE_CERT")),
            private_key: PathBuf::from(required("PRIVATE_KEY")),
            client_id: required("CLIENT_ID"),
            subscribe_topic: required("SUBSCRIBE_TOPIC"),
            submit_topic,
            keep_alive: Duration::from_secs(parse_or(&get, "KEEP_ALIVE_SECS", 30)?),
            clean_session: parse_bool_or(&get, "CLEAN_SESSION", false)?,
            connect_timeout: Duration::from_millis(parse_or(&get, "CONNECT_TIMEOUT_MS", 30_000)?),
            ack_timeout: Duration::from_millis(parse_or(&get, "ACK_TIMEOUT_MS", 10_000)?),
            reconnect_delay: Duration::from_millis(parse_or(&get, "RECONNECT_DELAY_MS", 1_000)?),
            max_reconnect_delay: Duration::from_millis(parse_or(
                &get,
                "MAX_RECONNECT_DELAY_MS",
                60_000,
            )?),
            drain_timeout: Duration::from_millis(parse_or(&get, "DRAIN_TIMEOUT_MS", 10_000)?),
            stats_interval: (stats_secs > 0).then(|| Duration::from_secs(stats_secs)),
            recent_tokens: parse_or(&get, "RECENT_TOKENS", DEFAULT_RECENT_TOKENS)?,
            log_level: get("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            log_dir: get("LOG_DIR").map(PathBuf::from),
        })
    }

    /// Connection settings for the bus
    pub fn bus_config(&self) -> BusConfig {
        BusConfig::new(
            &self.endpoint,
            &self.client_id,
            TlsCredentials::new(&self.ca_file, &self.device_cert, &self.private_key),
        )
        .with_port(self.port)
        .with_keep_alive(self.keep_alive)
        .with_clean_session(self.clean_session)
        .with_connect_timeout(self.connect_timeout)
        .with_ack_timeout(self.ack_timeout)
        .with_reconnect_delay(self.reconnect_delay, self.max_reconnect_delay)
        .with_drain_timeout(self.drain_timeout)
    }

    pub fn relay_options(&self) -> RelayOptions {
        RelayOptions {
            subscribe_topic: self.subscribe_topic.clone(),
            submit_topic: self.submit_topic.clone(),
            subscribe_qos: QoS::AtLeastOnce,
            stats_interval: self.stats_interval,
            recent_tokens: self.recent_tokens,
        }
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
            key: key.to_string(),
            reason: e.to_string(),
            value,
        }),
    }
}

fn parse_bool_or<G>(get: &G, key: &str, default: bool) -> Result<bool, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let Some(value) = get(key) else {
        return Ok(default);
    };
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key: key.to_string(),
            value,
            reason: "expected a boolean".to_string(),
        }),
    }
}
