//! Process lifecycle
//!
//! ```text
//! Starting ──connect──▶ Connected ──subscribe──▶ Subscribed ──▶ Running
//!                                                                  │
//!        signal / shutdown() / fatal resubscribe / unexpected close │
//!                                                                  ▼
//!                                   Stopped ◀──disconnect── ShuttingDown
//! ```
//!
//! Failures before `Running` are fatal and returned immediately. A fatal
//! resubscription still goes through `ShuttingDown` so in-flight requests get
//! their drain window, and is then returned as `Err`.

use relay_client::{BusClient, ConnectError, MessageHandler, QoS};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::error::{WorkerError, WorkerResult};
use crate::relay::compute::ComputeFunction;
use crate::relay::dedup::DEFAULT_RECENT_TOKENS;
use crate::relay::handler::RequestHandler;
use crate::relay::resubscribe::{Resubscriber, Subscription};
use crate::relay::stats::{RelayStats, report_periodically};

/// 生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Starting,
    Connected,
    Subscribed,
    Running,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Starting => write!(f, "starting"),
            LifecycleState::Connected => write!(f, "connected"),
            LifecycleState::Subscribed => write!(f, "subscribed"),
            LifecycleState::Running => write!(f, "running"),
            LifecycleState::ShuttingDown => write!(f, "shutting_down"),
            LifecycleState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Topics and relay behaviour, independent of the transport
#[derive(Debug, Clone)]
pub struct RelayOptions {
    pub subscribe_topic: String,
    pub submit_topic: String,
    pub subscribe_qos: QoS,
    /// `None` disables the periodic stats log
    pub stats_interval: Option<Duration>,
    /// Resolved tokens remembered for duplicate detection, 0 disables
    pub recent_tokens: usize,
}

impl RelayOptions {
    pub fn new(subscribe_topic: impl Into<String>, submit_topic: impl Into<String>) -> Self {
        Self {
            subscribe_topic: subscribe_topic.into(),
            submit_topic: submit_topic.into(),
            subscribe_qos: QoS::AtLeastOnce,
            stats_interval: None,
            recent_tokens: DEFAULT_RECENT_TOKENS,
        }
    }

    pub fn with_stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = Some(interval);
        self
    }
}

/// Owns the relay for the lifetime of the process
pub struct Worker {
    options: RelayOptions,
    compute: Arc<dyn ComputeFunction>,
    stats: Arc<RelayStats>,
    state: watch::Sender<LifecycleState>,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(options: RelayOptions, compute: Arc<dyn ComputeFunction>) -> Self {
        let (state, _) = watch::channel(LifecycleState::Starting);
        Self {
            options,
            compute,
            stats: Arc::new(RelayStats::new()),
            state,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Observe lifecycle transitions
    pub fn watch_state(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> Arc<RelayStats> {
        self.stats.clone()
    }

    /// Request a graceful stop
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Drive the whole lifecycle
    ///
    /// `connect` yields the bus connection; `stop` resolves on an external
    /// termination signal. Returns `Ok` only after a graceful stop.
    pub async fn run<C, S>(&self, connect: C, stop: S) -> WorkerResult<()>
    where
        C: Future<Output = Result<Arc<dyn BusClient>, ConnectError>>,
        S: Future<Output = ()>,
    {
        let topic = self.options.subscribe_topic.clone();
        let qos = self.options.subscribe_qos;
        self.transition(LifecycleState::Starting);

        // 1. Starting -> Connected
        let bus = match connect.await {
            Ok(bus) => bus,
            Err(e) => {
                tracing::error!(error = %e, "Connection failed");
                self.transition(LifecycleState::Stopped);
                return Err(e.into());
            }
        };
        // Taken before subscribing so no resume is missed
        let events = bus.events();
        self.transition(LifecycleState::Connected);

        // 2. Connected -> Subscribed
        let handler: Arc<dyn MessageHandler> = Arc::new(
            RequestHandler::new(
                bus.clone(),
                self.compute.clone(),
                &self.options.submit_topic,
                self.stats.clone(),
            )
            .with_recent_tokens(self.options.recent_tokens),
        );
        tracing::info!(topic = %topic, "Subscribing to topic...");
        match bus.subscribe(&topic, qos, handler.clone()).await {
            Ok(granted) => tracing::info!(topic = %topic, granted = %granted, "Subscribed"),
            Err(source) => {
                tracing::error!(topic = %topic, error = %source, "Initial subscription failed");
                if let Err(e) = bus.disconnect().await {
                    tracing::warn!(error = %e, "Disconnect after failed subscribe also failed");
                }
                self.transition(LifecycleState::Stopped);
                return Err(WorkerError::Subscribe { topic, source });
            }
        }
        self.transition(LifecycleState::Subscribed);

        // 3. Supervisors, stopped only after the select below has decided
        let tasks = CancellationToken::new();
        let resubscriber =
            Resubscriber::new(bus.clone(), vec![Subscription::new(topic, qos, handler)]);
        let mut supervisor = tokio::spawn(resubscriber.run(events, tasks.clone()));
        if let Some(interval) = self.options.stats_interval {
            tokio::spawn(report_periodically(self.stats.clone(), interval, tasks.clone()));
        }

        // 4. Running
        self.transition(LifecycleState::Running);
        tracing::info!(submit_topic = %self.options.submit_topic, "Waiting for work requests...");

        tokio::pin!(stop);
        let fatal = tokio::select! {
            biased;

            _ = &mut stop => {
                tracing::info!("Received stop signal, shutting down gracefully...");
                None
            }
            _ = self.shutdown.cancelled() => {
                tracing::info!("Shutdown requested, shutting down gracefully...");
                None
            }
            joined = &mut supervisor => match joined {
                Ok(Ok(())) if self.shutdown.is_cancelled() => None,
                Ok(Ok(())) => Some(WorkerError::ConnectionClosed),
                Ok(Err(e)) => Some(e),
                Err(e) => Some(WorkerError::Task(e.to_string())),
            },
        };

        // 5. ShuttingDown -> Stopped
        self.transition(LifecycleState::ShuttingDown);
        tasks.cancel();
        if !supervisor.is_finished() {
            supervisor.abort();
        }

        tracing::info!(in_flight = self.stats.snapshot().in_flight, "Disconnecting...");
        let disconnected = bus.disconnect().await;
        self.transition(LifecycleState::Stopped);
        self.stats.log_summary();

        match (fatal, disconnected) {
            (Some(e), _) => {
                tracing::error!(error = %e, "Relay worker stopped on fatal error");
                Err(e)
            }
            (None, Err(e)) => {
                tracing::error!(error = %e, "Disconnect failed");
                Err(e.into())
            }
            (None, Ok(())) => {
                tracing::info!("Disconnected!");
                Ok(())
            }
        }
    }

    fn transition(&self, next: LifecycleState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!(from = %previous, to = %next, "Lifecycle transition");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::compute::AddOperands;
    use relay_client::MemoryBus;

    #[tokio::test]
    async fn test_connect_failure_is_fatal() {
        let worker = Worker::new(RelayOptions::new("in", "out"), Arc::new(AddOperands));

        let result = worker
            .run(
                async {
                    Err::<Arc<dyn BusClient>, _>(ConnectError::Handshake("refused".to_string()))
                },
                std::future::pending::<()>(),
            )
            .await;

        assert!(matches!(result, Err(WorkerError::Connect(_))));
        assert_eq!(worker.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn test_graceful_stop() {
        let bus = MemoryBus::new();
        let worker = Worker::new(
            RelayOptions::new("in", "out").with_stats_interval(Duration::from_millis(10)),
            Arc::new(AddOperands),
        );
        let connected: Arc<dyn BusClient> = Arc::new(bus.clone());

        worker
            .run(async move { Ok::<_, ConnectError>(connected) }, async {})
            .await
            .unwrap();

        assert_eq!(worker.state(), LifecycleState::Stopped);
        assert_eq!(bus.subscribe_calls(), vec![("in".to_string(), QoS::AtLeastOnce)]);
        assert_eq!(bus.state(), relay_client::ConnectionState::Disconnected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_request_always_stops_cleanly() {
        for _ in 0..50 {
            let bus = MemoryBus::new();
            let worker = Arc::new(Worker::new(
                RelayOptions::new("in", "out"),
                Arc::new(AddOperands),
            ));
            let mut state = worker.watch_state();
            let connected: Arc<dyn BusClient> = Arc::new(bus.clone());

            let runner = worker.clone();
            let task = tokio::spawn(async move {
                runner
                    .run(
                        async move { Ok::<_, ConnectError>(connected) },
                        std::future::pending::<()>(),
                    )
                    .await
            });
            state
                .wait_for(|s| *s == LifecycleState::Running)
                .await
                .unwrap();

            worker.shutdown();
            let result = tokio::time::timeout(Duration::from_secs(2), task)
                .await
                .unwrap()
                .unwrap();

            assert!(result.is_ok(), "unexpected: {:?}", result);
            assert_eq!(worker.state(), LifecycleState::Stopped);
        }
    }

    #[test]
    fn test_state_display() {
        assert_eq!(LifecycleState::ShuttingDown.to_string(), "shutting_down");
    }
}
