//! mTLS MQTT bus connection
//!
//! Wraps a `rumqttc` client and its event loop:
//!
//! 1. 加载并校验 mTLS 凭据
//! 2. 启动事件循环任务，等待首个 CONNACK
//! 3. 事件循环负责 keep-alive 与重连 (指数退避)
//! 4. 生命周期事件通过 broadcast 通道发布
//!
//! ```text
//!  publish()/subscribe() ──▶ AsyncClient ──▶ EventLoop task ──▶ broker
//!                                               │
//!             ┌─────────────────────────────────┼──────────────────────┐
//!             ▼                                 ▼                      ▼
//!       AckTracker (PUBACK/SUBACK)     handler tasks (PUBLISH)   events (health)
//! ```

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, Publish,
    SubscribeReasonCode, TlsConfiguration, Transport,
};
use shared::{ConnectionEvent, ConnectionState, QoS};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::acks::AckTracker;
use crate::bus::{BusClient, IncomingMessage, MessageHandler};
use crate::config::BusConfig;
use crate::credential::PemBundle;
use crate::error::{ConnectError, DisconnectError, PublishError, SubscribeError};
use crate::topic::{topic_matches, validate_filter};

/// At most one physical connection per process
static ACTIVE_CONNECTION: AtomicBool = AtomicBool::new(false);

/// Time allowed for the event loop to finish after DISCONNECT
const EVENT_LOOP_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// MQTT bus connection
///
/// Cheap to clone; all clones share the same connection.
#[derive(Clone)]
pub struct MqttBus {
    inner: Arc<Inner>,
}

struct Inner {
    client: AsyncClient,
    config: BusConfig,
    state: RwLock<ConnectionState>,
    /// Topic filter -> handler
    routes: DashMap<String, Arc<dyn MessageHandler>>,
    acks: Mutex<AckTracker>,
    events: broadcast::Sender<ConnectionEvent>,
    /// In-flight handler invocations
    handlers: TaskTracker,
    closing: AtomicBool,
    shutdown: CancellationToken,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for MqttBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttBus")
            .field("client_id", &self.inner.config.client_id)
            .field("host", &self.inner.config.host)
            .field("state", &self.inner.state())
            .finish()
    }
}

impl MqttBus {
    /// 使用 mTLS 连接到 broker
    ///
    /// Returns once the first CONNACK is received. Any failure here is fatal
    /// for the caller; later connection drops are recovered by the event loop.
    pub async fn connect(config: BusConfig) -> Result<Self, ConnectError> {
        config.validate()?;
        let pem = PemBundle::load(&config.credentials).await?;

        if ACTIVE_CONNECTION.swap(true, Ordering::SeqCst) {
            return Err(ConnectError::InvalidConfig(
                "a bus connection is already active in this process".to_string(),
            ));
        }

        tracing::info!(
            host = %config.host,
            port = config.port,
            client_id = %config.client_id,
            ca_certs = pem.ca_count,
            "Connecting to message bus..."
        );

        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options
            .set_keep_alive(config.keep_alive)
            .set_clean_session(config.clean_session)
            .set_transport(Transport::tls_with_config(TlsConfiguration::Simple {
                ca: pem.ca,
                alpn: None,
                client_auth: Some((pem.cert, pem.key)),
            }));

        let (client, eventloop) = AsyncClient::new(options, config.request_capacity);
        let connect_timeout = config.connect_timeout;
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        let inner = Arc::new(Inner {
            client,
            config,
            state: RwLock::new(ConnectionState::Connecting),
            routes: DashMap::new(),
            acks: Mutex::new(AckTracker::default()),
            events,
            handlers: TaskTracker::new(),
            closing: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            event_loop: Mutex::new(None),
        });

        let (ready_tx, ready_rx) = oneshot::channel();
        let handle = tokio::spawn(drive(inner.clone(), eventloop, ready_tx));
        *inner.event_loop.lock() = Some(handle);

        match tokio::time::timeout(connect_timeout, ready_rx).await {
            Ok(Ok(Ok(session_present))) => {
                tracing::info!(session_present, "Connected!");
                Ok(Self { inner })
            }
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(ConnectError::Handshake(
                "event loop stopped before CONNACK".to_string(),
            )),
            Err(_) => {
                inner.shutdown.cancel();
                Err(ConnectError::Timeout(format!(
                    "no CONNACK within {:?}",
                    connect_timeout
                )))
            }
        }
    }
}

#[async_trait]
impl BusClient for MqttBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), PublishError> {
        let state = self.inner.state();
        if !state.is_connected() {
            return Err(PublishError::NotConnected(state));
        }

        let ack_rx = {
            // Queue order must equal request-channel order
            let mut acks = self.inner.acks.lock();
            let ack_rx = match qos {
                QoS::AtLeastOnce => {
                    let (tx, rx) = oneshot::channel();
                    acks.queue_publish(tx);
                    Some(rx)
                }
                QoS::AtMostOnce => None,
            };
            if let Err(e) = self
                .inner
                .client
                .try_publish(topic, to_mqtt_qos(qos), false, payload)
            {
                if ack_rx.is_some() {
                    acks.unqueue_publish();
                }
                return Err(PublishError::Client(e.to_string()));
            }
            ack_rx
        };

        let Some(ack_rx) = ack_rx else {
            return Ok(());
        };

        match tokio::time::timeout(self.inner.config.ack_timeout, ack_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PublishError::Closed),
            Err(_) => Err(PublishError::Timeout(topic.to_string())),
        }
    }

    async fn subscribe(
        &self,
        topic: &str,
        qos: QoS,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<QoS, SubscribeError> {
        validate_filter(topic).map_err(SubscribeError::InvalidTopic)?;
        let state = self.inner.state();
        if !state.is_connected() {
            return Err(SubscribeError::NotConnected(state));
        }

        // Route first so deliveries racing the SUBACK are not lost
        self.inner.routes.insert(topic.to_string(), handler);

        let (tx, rx) = oneshot::channel();
        {
            let mut acks = self.inner.acks.lock();
            acks.queue_subscribe(topic, tx);
            if let Err(e) = self.inner.client.try_subscribe(topic, to_mqtt_qos(qos)) {
                acks.unqueue_subscribe();
                return Err(SubscribeError::Client(e.to_string()));
            }
        }

        let result = match tokio::time::timeout(self.inner.config.ack_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SubscribeError::Closed),
            Err(_) => Err(SubscribeError::Timeout(topic.to_string())),
        };

        match &result {
            Ok(granted) => {
                tracing::info!(topic = %topic, granted = %granted, "Subscribed");
            }
            Err(SubscribeError::Rejected(_)) => {
                self.inner.routes.remove(topic);
            }
            Err(_) => {}
        }
        result
    }

    async fn disconnect(&self) -> Result<(), DisconnectError> {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::info!("Disconnecting...");

        // 1. 等待进行中的消息处理完成
        self.inner.handlers.close();
        let drain_timeout = self.inner.config.drain_timeout;
        if tokio::time::timeout(drain_timeout, self.inner.handlers.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                in_flight = self.inner.handlers.len(),
                "In-flight messages still running after {:?}, disconnecting anyway",
                drain_timeout
            );
        }

        // 2. 发送 DISCONNECT (仅在连接正常时)
        let mut result = Ok(());
        if self.inner.state().is_connected() {
            if let Err(e) = self.inner.client.try_disconnect() {
                result = Err(DisconnectError::Client(e.to_string()));
                self.inner.shutdown.cancel();
            }
        } else {
            self.inner.shutdown.cancel();
        }

        // 3. 等待事件循环退出
        let handle = self.inner.event_loop.lock().take();
        if let Some(handle) = handle
            && tokio::time::timeout(EVENT_LOOP_STOP_TIMEOUT, handle).await.is_err()
        {
            self.inner.shutdown.cancel();
            if result.is_ok() {
                result = Err(DisconnectError::Timeout(
                    "event loop did not stop after DISCONNECT".to_string(),
                ));
            }
        }
        self.inner.shutdown.cancel();

        tracing::info!("Disconnected!");
        result
    }

    fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    fn state(&self) -> ConnectionState {
        self.inner.state()
    }
}

impl Inner {
    fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Returns the previous state
    fn set_state(&self, next: ConnectionState) -> ConnectionState {
        std::mem::replace(&mut *self.state.write(), next)
    }

    fn emit(&self, event: ConnectionEvent) {
        if let Err(e) = self.events.send(event) {
            tracing::debug!("No subscribers for connection event: {}", e.0);
        }
    }

    /// Route a PUBLISH to every matching handler, each on its own task
    fn dispatch(&self, publish: Publish) {
        let handlers: Vec<Arc<dyn MessageHandler>> = self
            .routes
            .iter()
            .filter(|entry| topic_matches(entry.key(), &publish.topic))
            .map(|entry| entry.value().clone())
            .collect();

        if handlers.is_empty() {
            tracing::warn!(topic = %publish.topic, "No handler registered for topic");
            return;
        }

        let msg = IncomingMessage {
            message_id: Uuid::new_v4(),
            topic: publish.topic,
            payload: publish.payload.to_vec(),
            qos: from_mqtt_qos(publish.qos),
            dup: publish.dup,
            retain: publish.retain,
        };
        tracing::debug!(
            message_id = %msg.message_id,
            topic = %msg.topic,
            qos = %msg.qos,
            len = msg.payload.len(),
            "Received message"
        );

        for handler in handlers {
            let msg = msg.clone();
            self.handlers.spawn(async move {
                handler.on_message(msg).await;
            });
        }
    }
}

/// Event loop task: keep-alive, reconnects, acks and deliveries
async fn drive(
    inner: Arc<Inner>,
    mut eventloop: EventLoop,
    ready: oneshot::Sender<Result<bool, ConnectError>>,
) {
    let mut ready = Some(ready);
    let mut startup_error: Option<ConnectError> = None;
    let mut backoff = inner.config.reconnect_delay;

    loop {
        let polled = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            polled = eventloop.poll() => polled,
        };

        match polled {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                backoff = inner.config.reconnect_delay;
                let previous = inner.set_state(ConnectionState::Connected);
                match ready.take() {
                    Some(tx) => {
                        tracing::info!(
                            session_present = ack.session_present,
                            "Connection successful"
                        );
                        inner.emit(ConnectionEvent::Connected {
                            session_present: ack.session_present,
                        });
                        let _ = tx.send(Ok(ack.session_present));
                    }
                    None => {
                        tracing::info!(
                            session_present = ack.session_present,
                            previous = %previous,
                            "Connection resumed"
                        );
                        inner.emit(ConnectionEvent::Resumed {
                            session_present: ack.session_present,
                        });
                    }
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => inner.dispatch(publish),
            Ok(Event::Incoming(Packet::PubAck(ack))) => inner.acks.lock().on_puback(ack.pkid),
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                let granted = ack.return_codes.first().and_then(granted_qos);
                inner.acks.lock().on_suback(ack.pkid, granted);
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                inner.acks.lock().on_outgoing_publish(pkid)
            }
            Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => {
                inner.acks.lock().on_outgoing_subscribe(pkid)
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                tracing::debug!("DISCONNECT sent");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if ready.is_some() {
                    tracing::error!(error = %e, "Connection failed");
                    startup_error = Some(ConnectError::Handshake(e.to_string()));
                    break;
                }
                if inner.closing.load(Ordering::SeqCst) {
                    tracing::debug!(error = %e, "Connection error while closing");
                    break;
                }

                let error = e.to_string();
                if inner.state().is_connected() {
                    inner.set_state(ConnectionState::Interrupted);
                    tracing::warn!(error = %error, "Connection interrupted");
                    inner.acks.lock().on_interrupted(&error);
                    inner.emit(ConnectionEvent::Interrupted {
                        error: error.clone(),
                    });
                } else {
                    tracing::debug!(error = %error, "Reconnect attempt failed");
                }

                tracing::debug!(delay_ms = backoff.as_millis() as u64, "Waiting before reconnect");
                tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(inner.config.max_reconnect_delay);
            }
        }
    }

    inner.set_state(ConnectionState::Disconnected);
    inner.acks.lock().close();
    ACTIVE_CONNECTION.store(false, Ordering::SeqCst);

    match ready.take() {
        Some(tx) => {
            let error = startup_error.unwrap_or_else(|| {
                ConnectError::Handshake("connection cancelled before CONNACK".to_string())
            });
            let _ = tx.send(Err(error));
        }
        None => {
            inner.emit(ConnectionEvent::Closed);
            tracing::info!("Connection closed");
        }
    }
}

fn to_mqtt_qos(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
    }
}

/// QoS 2 is never requested; a broker upgrade is treated as at-least-once
fn from_mqtt_qos(qos: rumqttc::QoS) -> QoS {
    match qos {
        rumqttc::QoS::AtMostOnce => QoS::AtMostOnce,
        rumqttc::QoS::AtLeastOnce | rumqttc::QoS::ExactlyOnce => QoS::AtLeastOnce,
    }
}

fn granted_qos(code: &SubscribeReasonCode) -> Option<QoS> {
    match code {
        SubscribeReasonCode::Success(qos) => Some(from_mqtt_qos(*qos)),
        SubscribeReasonCode::Failure => None,
    }
}
