//! Relay Worker - 工作请求中继
//!
//! # 架构概述
//!
//! 通过一条长连接 (mTLS MQTT) 接收编排端下发的工作请求，执行计算，
//! 并把结果按 task token 关联后发布回去：
//!
//! ```text
//! orchestrator ──{Input, TaskToken}──▶ SUBSCRIBE_TOPIC ──▶ RequestHandler
//!                                                              │
//!                                                        ComputeFunction
//!                                                              │
//! orchestrator ◀──{result, TaskToken[, exception]}── SUBMIT_TOPIC
//! ```
//!
//! # 模块结构
//!
//! ```text
//! relay-worker/src/
//! ├── core/          # 配置、生命周期、信号、错误
//! ├── relay/         # 计算边界、请求处理、重新订阅、统计
//! └── utils/         # 日志
//! ```

pub mod core;
pub mod relay;
pub mod utils;

pub use core::{
    ConfigError, LifecycleState, RelayOptions, Worker, WorkerConfig, WorkerError, WorkerResult,
    wait_for_shutdown_signal,
};
pub use relay::{
    AddOperands, BlockingCompute, ComputeError, ComputeFunction, HandleOutcome, RelayStats,
    RequestHandler, ResolutionStatus, Resubscriber, Subscription,
};
pub use utils::logger::{init_logger, init_logger_with_file};

pub fn print_banner() {
    println!(
        r#"
    ____       __
   / __ \___  / /___ ___  __
  / /_/ / _ \/ / __ `/ / / /
 / _, _/  __/ / /_/ / /_/ /
/_/ |_|\___/_/\__,_/\__, /
                   /____/  worker
    "#
    );
}
