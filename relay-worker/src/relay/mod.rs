//! Relay - 请求处理与订阅维护
//!
//! - [`compute`] - 计算边界 (`ComputeFunction`)
//! - [`dedup`] - 最近已处理的 task token
//! - [`handler`] - 单条消息的状态机
//! - [`resubscribe`] - 非持久会话恢复后的重新订阅
//! - [`stats`] - 计数器

pub mod compute;
pub mod dedup;
pub mod handler;
pub mod resubscribe;
pub mod stats;

pub use compute::{AddOperands, BlockingCompute, ComputeError, ComputeFunction};
pub use dedup::{DEFAULT_RECENT_TOKENS, RecentTokens};
pub use handler::{HandleOutcome, RequestHandler, ResolutionStatus};
pub use resubscribe::{ResubscribeReport, Resubscriber, Subscription};
pub use stats::{RelayStats, StatsSnapshot};
