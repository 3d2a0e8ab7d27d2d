// relay-client/src/config.rs
// 总线连接配置

use std::path::PathBuf;
use std::time::Duration;

/// mTLS 凭据文件路径
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsCredentials {
    /// CA 信任链 (PEM)
    pub ca_path: PathBuf,
    /// 客户端证书 (PEM)
    pub cert_path: PathBuf,
    /// 客户端私钥 (PEM，支持 PKCS8/PKCS1/SEC1)
    pub key_path: PathBuf,
}

impl TlsCredentials {
    pub fn new(
        ca_path: impl Into<PathBuf>,
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            ca_path: ca_path.into(),
            cert_path: cert_path.into(),
            key_path: key_path.into(),
        }
    }
}

/// 总线连接配置
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Broker 主机名
    pub host: String,
    /// Broker 端口 (mTLS 默认 8883)
    pub port: u16,
    /// MQTT client id
    pub client_id: String,
    /// mTLS 凭据
    pub credentials: TlsCredentials,
    /// 心跳间隔
    pub keep_alive: Duration,
    /// 是否请求 clean session (默认 false，保留服务端订阅)
    pub clean_session: bool,
    /// 首次握手超时
    pub connect_timeout: Duration,
    /// publish / subscribe 等待 broker 确认的超时
    pub ack_timeout: Duration,
    /// 首次重连延迟
    pub reconnect_delay: Duration,
    /// 最大重连延迟 (指数退避上限)
    pub max_reconnect_delay: Duration,
    /// 断开前等待进行中消息处理完成的时间
    pub drain_timeout: Duration,
    /// 事件循环请求通道容量
    pub request_capacity: usize,
    /// 生命周期事件广播容量
    pub event_capacity: usize,
}

impl BusConfig {
    pub const DEFAULT_PORT: u16 = 8883;

    pub fn new(
        host: impl Into<String>,
        client_id: impl Into<String>,
        credentials: TlsCredentials,
    ) -> Self {
        Self {
            host: host.into(),
            port: Self::DEFAULT_PORT,
            client_id: client_id.into(),
            credentials,
            keep_alive: Duration::from_secs(30),
            clean_session: false,
            connect_timeout: Duration::from_secs(30),
            ack_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(60),
            drain_timeout: Duration::from_secs(10),
            request_capacity: 64,
            event_capacity: 64,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_clean_session(mut self, clean: bool) -> Self {
        self.clean_session = clean;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// 设置重连退避区间
    pub fn with_reconnect_delay(mut self, initial: Duration, max: Duration) -> Self {
        self.reconnect_delay = initial;
        self.max_reconnect_delay = max.max(initial);
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// 校验基本参数
    pub fn validate(&self) -> Result<(), crate::ConnectError> {
        if self.host.trim().is_empty() {
            return Err(crate::ConnectError::InvalidConfig("host is empty".into()));
        }
        if self.client_id.trim().is_empty() {
            return Err(crate::ConnectError::InvalidConfig(
                "client_id is empty".into(),
            ));
        }
        if self.keep_alive < Duration::from_secs(5) {
            return Err(crate::ConnectError::InvalidConfig(
                "keep_alive must be at least 5 seconds".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> TlsCredentials {
        TlsCredentials::new("ca.pem", "cert.pem", "key.pem")
    }

    #[test]
    fn test_config_default() {
        let config = BusConfig::new("broker.local", "worker-01", creds());
        assert_eq!(config.port, 8883);
        assert_eq!(config.keep_alive, Duration::from_secs(30));
        assert!(!config.clean_session);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = BusConfig::new("broker.local", "worker-01", creds())
            .with_port(1883)
            .with_clean_session(true)
            .with_reconnect_delay(Duration::from_secs(5), Duration::from_secs(1));

        assert_eq!(config.port, 1883);
        assert!(config.clean_session);
        // 上限不能小于初始值
        assert_eq!(config.max_reconnect_delay, Duration::from_secs(5));
    }

    #[test]
    fn test_config_validate() {
        assert!(BusConfig::new(" ", "id", creds()).validate().is_err());
        assert!(BusConfig::new("host", "", creds()).validate().is_err());
        assert!(
            BusConfig::new("host", "id", creds())
                .with_keep_alive(Duration::from_secs(1))
                .validate()
                .is_err()
        );
    }
}
