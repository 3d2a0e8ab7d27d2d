//! 核心模块 - 配置、生命周期、信号和错误定义
//!
//! - [`WorkerConfig`] - 环境变量配置
//! - [`Worker`] - 进程生命周期
//! - [`WorkerError`] - 致命错误

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod signal;

pub use config::{ConfigError, WorkerConfig};
pub use error::{WorkerError, WorkerResult};
pub use lifecycle::{LifecycleState, RelayOptions, Worker};
pub use signal::wait_for_shutdown_signal;
