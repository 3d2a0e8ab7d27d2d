//! 连接状态与生命周期事件
//!
//! 由 Bus Connection 独占维护，其他组件只读观察。

use serde::{Deserialize, Serialize};
use std::fmt;

/// Connection state owned by the bus connection
///
/// ```text
/// Disconnected ──▶ Connecting ──▶ Connected ◀──▶ Interrupted
///                                     │
///                                     ▼
///                               Disconnected (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Interrupted,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// Advisory lifecycle notification emitted on the connection's health stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionEvent {
    /// 首次握手成功
    Connected { session_present: bool },
    /// 连接意外中断，底层传输会自动重连
    Interrupted { error: String },
    /// 中断后重新建立连接
    Resumed { session_present: bool },
    /// 连接已关闭 (终态)
    Closed,
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionEvent::Connected { session_present } => {
                write!(f, "connected (session_present={})", session_present)
            }
            ConnectionEvent::Interrupted { error } => write!(f, "interrupted: {}", error),
            ConnectionEvent::Resumed { session_present } => {
                write!(f, "resumed (session_present={})", session_present)
            }
            ConnectionEvent::Closed => write!(f, "closed"),
        }
    }
}
