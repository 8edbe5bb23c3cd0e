use crate::config::Config;
use crate::errors::{Error, Result};
use crate::metrics::{BROKER_CONNECTED, INFLIGHT_WRITES, MESSAGES_TOTAL};
use crate::worker::Ingestor;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, Publish, QoS, SubAck, SubscribeReasonCode};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const INITIAL_BACKOFF_MS: u64 = 100;
const MAX_BACKOFF_MS: u64 = 30_000;
const REQUEST_CHANNEL_CAPACITY: usize = 100;

/// Link state of the subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Subscribed,
    Processing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Poll,
    ConnAck,
    SubAck,
    Message,
    MessageDispatched,
    ConnectionLost,
}

/// Connection loss from any state goes back to `Connecting`; a `ConnAck` alone is not enough
/// to count as subscribed.
pub fn transition(state: ConnectionState, event: LinkEvent) -> ConnectionState {
    use ConnectionState::*;
    match (state, event) {
        (_, LinkEvent::ConnectionLost) => Connecting,
        (Disconnected, LinkEvent::Poll) => Connecting,
        (_, LinkEvent::ConnAck) => Connecting,
        (Connecting, LinkEvent::SubAck) => Subscribed,
        (Subscribed, LinkEvent::Message) => Processing,
        (Processing, LinkEvent::MessageDispatched) => Subscribed,
        (current, _) => current,
    }
}

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub broker: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic: String,
    pub keepalive: Duration,
    pub max_reconnects: u32,
    pub pool_size: usize,
}

impl MqttSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            broker: config.mqtt_broker.clone(),
            port: config.mqtt_port,
            client_id: format!("sensorhub-{}", uuid::Uuid::new_v4()),
            username: config.mqtt_username.clone(),
            password: config.mqtt_password.clone(),
            topic: config.mqtt_topic.clone(),
            keepalive: config.mqtt_keepalive(),
            max_reconnects: config.mqtt_max_reconnects.max(1),
            pool_size: config.worker_pool_size.max(1),
        }
    }

    fn mqtt_options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(self.client_id.clone(), self.broker.clone(), self.port);
        options.set_keep_alive(self.keepalive);
        // No reliance on broker session state; the subscription is re-issued on every ConnAck.
        options.set_clean_session(true);
        if let Some(username) = &self.username {
            options.set_credentials(username.clone(), self.password.clone().unwrap_or_default());
        }
        options
    }
}

fn reconnect_backoff(failures: u32) -> Duration {
    let ms = INITIAL_BACKOFF_MS.saturating_mul(2_u64.saturating_pow(failures.saturating_sub(1)));
    Duration::from_millis(ms.min(MAX_BACKOFF_MS))
}

/// Runs the subscription until `shutdown` fires or the broker stays unreachable for
/// `max_reconnects` consecutive attempts. In both cases in-flight messages are finished
/// before returning.
pub async fn run_mqtt(
    settings: MqttSettings,
    ingestor: Ingestor,
    shutdown: CancellationToken,
) -> Result<()> {
    info!(
        "Connecting to MQTT broker at {}:{} as {}",
        settings.broker, settings.port, settings.client_id
    );

    let (client, mut eventloop) =
        AsyncClient::new(settings.mqtt_options(), REQUEST_CHANNEL_CAPACITY);
    let permits = Arc::new(Semaphore::new(settings.pool_size));

    let mut state = ConnectionState::Disconnected;
    let mut failures: u32 = 0;
    let mut outcome = Ok(());

    loop {
        state = transition(state, LinkEvent::Poll);

        let event = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                failures = 0;
                state = transition(state, LinkEvent::ConnAck);
                info!(code = ?ack.code, "Connected to MQTT broker, subscribing to {}", settings.topic);
                if let Err(e) = client.subscribe(settings.topic.clone(), QoS::AtLeastOnce).await {
                    outcome = Err(Error::Mqtt(e));
                    break;
                }
            }
            Ok(Event::Incoming(Packet::SubAck(suback))) => {
                if subscription_rejected(&suback) {
                    failures += 1;
                    if failures >= settings.max_reconnects {
                        error!(
                            "Broker rejected subscription to {} {} times",
                            settings.topic, failures
                        );
                        outcome = Err(Error::SubscriptionRejected {
                            topic: settings.topic.clone(),
                            attempts: failures,
                        });
                        break;
                    }

                    let backoff = reconnect_backoff(failures);
                    warn!(
                        "Broker rejected subscription to {} (attempt {}/{}). Resubscribing in {}ms...",
                        settings.topic,
                        failures,
                        settings.max_reconnects,
                        backoff.as_millis()
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    if let Err(e) = client.subscribe(settings.topic.clone(), QoS::AtLeastOnce).await {
                        outcome = Err(Error::Mqtt(e));
                        break;
                    }
                    continue;
                }
                failures = 0;
                state = transition(state, LinkEvent::SubAck);
                BROKER_CONNECTED.set(1);
                info!("Subscribed to {} with QoS 1", settings.topic);
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                MESSAGES_TOTAL.inc();
                state = transition(state, LinkEvent::Message);
                debug!(
                    "Received message on topic {}, size: {} bytes",
                    publish.topic,
                    publish.payload.len()
                );

                // Blocks the poll loop while the pool is saturated. Not raced against
                // shutdown: the broker already has its PUBACK.
                if !dispatch(&permits, &ingestor, publish).await {
                    break;
                }
                state = transition(state, LinkEvent::MessageDispatched);
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("Broker sent disconnect");
                BROKER_CONNECTED.set(0);
                state = transition(state, LinkEvent::ConnectionLost);
            }
            Ok(_) => {}
            Err(e) => {
                failures += 1;
                BROKER_CONNECTED.set(0);
                state = transition(state, LinkEvent::ConnectionLost);

                if failures >= settings.max_reconnects {
                    error!("MQTT connection failed {} times in a row: {}", failures, e);
                    outcome = Err(Error::BrokerUnreachable {
                        attempts: failures,
                        last_error: e.to_string(),
                    });
                    break;
                }

                let backoff = reconnect_backoff(failures);
                warn!(
                    "MQTT connection error (attempt {}/{}): {}. Reconnecting in {}ms...",
                    failures,
                    settings.max_reconnects,
                    e,
                    backoff.as_millis()
                );
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }
        debug!(?state, "MQTT link state");
    }

    BROKER_CONNECTED.set(0);
    drain(&permits, settings.pool_size).await;
    if let Err(e) = client.try_disconnect() {
        debug!("MQTT disconnect not sent: {}", e);
    }
    info!("MQTT subscription stopped");
    outcome
}

fn subscription_rejected(suback: &SubAck) -> bool {
    suback
        .return_codes
        .iter()
        .any(|code| matches!(code, SubscribeReasonCode::Failure))
}

/// Spawns processing of one message once a pool slot is free. Returns `false` only when the
/// pool has been closed.
async fn dispatch(permits: &Arc<Semaphore>, ingestor: &Ingestor, publish: Publish) -> bool {
    let permit = match permits.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return false,
    };

    let ingestor = ingestor.clone();
    tokio::spawn(async move {
        INFLIGHT_WRITES.inc();
        ingestor.handle(&publish.topic, &publish.payload).await;
        INFLIGHT_WRITES.dec();
        drop(permit);
    });
    true
}

/// Waits until every spawned message task has released its permit.
async fn drain(permits: &Arc<Semaphore>, pool_size: usize) {
    let in_flight = pool_size - permits.available_permits();
    if in_flight > 0 {
        info!("Waiting for {} in-flight messages", in_flight);
    }
    match permits.acquire_many(pool_size as u32).await {
        Ok(_all) => permits.close(),
        Err(_) => warn!("Worker pool closed before draining"),
    }
}
