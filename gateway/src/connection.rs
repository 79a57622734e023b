use crate::config::MqttConfig;
use crate::dispatch::InboundMessage;
use crate::errors::{Error, Result};
use crate::metrics::{CONNECTION_STATE, CONNECTS_TOTAL, MESSAGES_TOTAL};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, Publish, QoS};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Offline,
}

/// Discrete lifecycle events fed to the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Start,
    Tick,
    ConnAck,
    TransportLost,
    ConnectTimeout,
    Shutdown,
}

impl ConnectionState {
    pub fn next(self, event: ConnectionEvent) -> ConnectionState {
        use ConnectionEvent::*;
        use ConnectionState::*;

        match (self, event) {
            (_, Shutdown) => Disconnected,
            (Disconnected | Offline, Start | Tick) => Connecting,
            (Connecting, ConnAck) => Connected,
            (Connecting, TransportLost | ConnectTimeout) => Offline,
            (Connected, TransportLost) => Offline,
            (state, _) => state,
        }
    }

    fn code(self) -> f64 {
        match self {
            ConnectionState::Disconnected => 0.0,
            ConnectionState::Connecting => 1.0,
            ConnectionState::Connected => 2.0,
            ConnectionState::Offline => 3.0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub connected: bool,
    pub broker: String,
    pub port: u16,
}

/// Cloneable view of the single broker connection, used for status reads
/// and outbound publishes.
#[derive(Clone)]
pub struct ConnectionHandle {
    client: AsyncClient,
    state: watch::Receiver<ConnectionState>,
    broker: Arc<str>,
    port: u16,
}

impl ConnectionHandle {
    pub fn get_status(&self) -> ConnectionStatus {
        let state = *self.state.borrow();
        ConnectionStatus {
            state,
            connected: state == ConnectionState::Connected,
            broker: self.broker.to_string(),
            port: self.port,
        }
    }

    pub fn is_connected(&self) -> bool {
        *self.state.borrow() == ConnectionState::Connected
    }

    /// Queues a QoS 1 publish. Fails with `PublishUnavailable` unless the
    /// connection is currently `Connected`.
    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::PublishUnavailable);
        }
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await?;
        Ok(())
    }
}

/// Owns the broker event loop: connect, detect loss, reconnect on a fixed
/// timer and resubscribe after every successful connect.
pub struct ConnectionManager {
    config: MqttConfig,
    client: AsyncClient,
    eventloop: EventLoop,
    state_tx: watch::Sender<ConnectionState>,
    subscriptions: Vec<&'static str>,
    subscription_rounds: usize,
    inbound: mpsc::Sender<InboundMessage>,
}

impl ConnectionManager {
    pub fn new(
        config: MqttConfig,
        subscriptions: Vec<&'static str>,
        inbound: mpsc::Sender<InboundMessage>,
    ) -> (Self, ConnectionHandle) {
        let mut mqtt_options =
            MqttOptions::new(config.client_id.clone(), config.broker.clone(), config.port);
        mqtt_options.set_keep_alive(Duration::from_secs(30));
        mqtt_options.set_clean_session(false);

        let (client, mut eventloop) = AsyncClient::new(mqtt_options, 100);
        eventloop
            .network_options
            .set_connection_timeout(transport_timeout_secs(config.connect_timeout));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        CONNECTION_STATE.set(ConnectionState::Disconnected.code());

        let handle = ConnectionHandle {
            client: client.clone(),
            state: state_rx,
            broker: Arc::from(config.broker.as_str()),
            port: config.port,
        };

        let manager = Self {
            config,
            client,
            eventloop,
            state_tx,
            subscriptions,
            subscription_rounds: 0,
            inbound,
        };

        (manager, handle)
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub(crate) fn apply(&mut self, event: ConnectionEvent) -> ConnectionState {
        let current = self.state();
        let next = current.next(event);

        if next != current {
            info!("MQTT connection {:?} -> {:?} on {:?}", current, next, event);
            self.state_tx.send_replace(next);
            CONNECTION_STATE.set(next.code());

            if next == ConnectionState::Connected {
                CONNECTS_TOTAL.inc();
                self.subscribe_all();
            }
        }

        next
    }

    /// Subscriptions are idempotent on the broker, so every round reissues
    /// the full set.
    fn subscribe_all(&mut self) {
        for topic in &self.subscriptions {
            match self.client.try_subscribe(*topic, QoS::AtLeastOnce) {
                Ok(()) => info!("Subscribed to {} with QoS 1", topic),
                Err(e) => error!("Failed to subscribe to {}: {}", topic, e),
            }
        }
        self.subscription_rounds += 1;
    }

    pub async fn run(mut self) {
        info!(
            "Connecting to MQTT broker at {}:{}",
            self.config.broker, self.config.port
        );

        let mut ticker = interval(self.config.reconnect_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        self.apply(ConnectionEvent::Start);
        let mut deadline = Instant::now() + self.config.connect_timeout;

        loop {
            match self.state() {
                ConnectionState::Connecting => {
                    match timeout_at(deadline, self.eventloop.poll()).await {
                        Ok(Ok(Event::Incoming(Packet::ConnAck(ack)))) => {
                            debug!("ConnAck received: {:?}", ack.code);
                            self.apply(ConnectionEvent::ConnAck);
                        }
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => {
                            warn!("Connect attempt failed: {}", e);
                            self.apply(ConnectionEvent::TransportLost);
                        }
                        Err(_) => {
                            warn!(
                                "Connect attempt timed out after {:?}",
                                self.config.connect_timeout
                            );
                            self.apply(ConnectionEvent::ConnectTimeout);
                        }
                    }
                }
                ConnectionState::Connected => match self.eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        if !forward(&self.inbound, publish).await {
                            break;
                        }
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        warn!("Broker sent disconnect");
                        self.apply(ConnectionEvent::TransportLost);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("MQTT connection lost: {}", e);
                        self.apply(ConnectionEvent::TransportLost);
                    }
                },
                ConnectionState::Offline | ConnectionState::Disconnected => {
                    ticker.tick().await;
                    if self.apply(ConnectionEvent::Tick) == ConnectionState::Connecting {
                        deadline = Instant::now() + self.config.connect_timeout;
                    }
                }
            }
        }

        self.apply(ConnectionEvent::Shutdown);
        if let Err(e) = self.client.try_disconnect() {
            debug!("Disconnect request not queued: {}", e);
        }
        info!("Connection manager stopped");
    }
}

/// The transport's own connect timeout must outlast the connect deadline
/// in `run`, otherwise rumqttc aborts the attempt first.
fn transport_timeout_secs(connect_timeout: Duration) -> u64 {
    connect_timeout.as_secs().max(1) + 1
}

/// Hands the message to the dispatcher. Returns false once the
/// dispatcher is gone.
async fn forward(inbound: &mpsc::Sender<InboundMessage>, publish: Publish) -> bool {
    MESSAGES_TOTAL.inc();
    debug!(
        "Received message on topic {}, size: {} bytes",
        publish.topic,
        publish.payload.len()
    );

    let message = InboundMessage {
        topic: publish.topic,
        payload: publish.payload.to_vec(),
    };

    match inbound.try_send(message) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(message)) => {
            debug!("Inbound queue full, waiting for dispatcher");
            inbound.send(message).await.is_ok()
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            error!("Inbound channel closed, stopping connection manager");
            false
        }
    }
}
