use std::{sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, Incoming, MqttOptions, QoS};
use tokio::sync::Mutex;
use tracing::{info, warn};

use sensor_node_common::{LinkInfo, NodeError, Outbound, ReconnectPolicy, RuntimeConfig};

const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// Outbound half of the broker session, shared by the heartbeat task and the
/// dispatch loop.
#[async_trait]
pub trait Session: Send + Sync {
    async fn publish(&self, outbound: Outbound) -> anyhow::Result<()>;
    async fn subscribe(&self, topic: &str) -> anyhow::Result<()>;
    async fn disconnect(&self);
}

/// What the dispatch loop needs to know about one event-loop poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Frame { topic: String, payload: Vec<u8> },
    ConnAck,
    Other,
    Failed(String),
}

impl SessionEvent {
    pub fn from_poll(polled: Result<Event, ConnectionError>) -> Self {
        match polled {
            Ok(Event::Incoming(Incoming::Publish(message))) => Self::Frame {
                topic: message.topic,
                payload: message.payload.to_vec(),
            },
            Ok(Event::Incoming(Incoming::ConnAck(_))) => Self::ConnAck,
            Ok(_) => Self::Other,
            Err(err) => Self::Failed(err.to_string()),
        }
    }
}

/// Every publish goes through this one lock.
#[derive(Clone)]
pub struct SessionPublisher {
    client: Arc<Mutex<AsyncClient>>,
}

impl SessionPublisher {
    fn new(client: AsyncClient) -> Self {
        Self {
            client: Arc::new(Mutex::new(client)),
        }
    }
}

#[async_trait]
impl Session for SessionPublisher {
    async fn publish(&self, outbound: Outbound) -> anyhow::Result<()> {
        let Outbound { topic, payload } = outbound;
        let client = self.client.lock().await;
        client
            .publish(topic.as_str(), QoS::AtMostOnce, false, payload)
            .await
            .with_context(|| format!("failed to publish to `{topic}`"))
    }

    async fn subscribe(&self, topic: &str) -> anyhow::Result<()> {
        let client = self.client.lock().await;
        client
            .subscribe(topic, QoS::AtMostOnce)
            .await
            .with_context(|| format!("failed to subscribe to `{topic}`"))
    }

    async fn disconnect(&self) {
        let client = self.client.lock().await;
        if let Err(err) = client.disconnect().await {
            warn!("mqtt disconnect failed: {err}");
        }
    }
}

fn mqtt_options(runtime: &RuntimeConfig) -> MqttOptions {
    let network = &runtime.network;
    let mut options = MqttOptions::new(
        network.mqtt_client_id.clone(),
        network.mqtt_host.clone(),
        network.mqtt_port,
    );
    options.set_keep_alive(Duration::from_secs(network.keepalive_secs));
    options.set_clean_session(true);
    if !network.mqtt_user.is_empty() {
        options.set_credentials(network.mqtt_user.clone(), network.mqtt_pass.clone());
    }
    options
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), NodeError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => return Ok(()),
            Ok(_) => {}
            Err(err) => return Err(NodeError::connection("mqtt", err.to_string())),
        }
    }
}

/// Takes the link so a broker session can only be opened once the network is up.
pub async fn connect(
    runtime: &RuntimeConfig,
    link: &LinkInfo,
) -> anyhow::Result<(SessionPublisher, EventLoop)> {
    let network = &runtime.network;
    let attempts = runtime.supervisor.connect_attempts;
    let timeout = Duration::from_millis(runtime.supervisor.connect_timeout_ms);
    let backoff = ReconnectPolicy::from_config(&runtime.supervisor);

    let mut last_err = NodeError::connection("mqtt", "no connection attempt made");
    for attempt in 1..=attempts {
        info!(
            "connecting to mqtt://{}:{} from {} (attempt {attempt}/{attempts})",
            network.mqtt_host, network.mqtt_port, link.ip_addr
        );

        let (client, mut eventloop) =
            AsyncClient::new(mqtt_options(runtime), REQUEST_CHANNEL_CAPACITY);
        match tokio::time::timeout(timeout, wait_for_connack(&mut eventloop)).await {
            Ok(Ok(())) => {
                info!("mqtt connected as `{}`", network.mqtt_client_id);
                return Ok((SessionPublisher::new(client), eventloop));
            }
            Ok(Err(err)) => {
                warn!("mqtt connect attempt {attempt} failed: {err}");
                last_err = err;
            }
            Err(_) => {
                warn!("mqtt connect attempt {attempt} timed out after {timeout:?}");
                last_err = NodeError::connection("mqtt", format!("no ConnAck within {timeout:?}"));
            }
        }

        if attempt < attempts {
            tokio::time::sleep(backoff.delay_for(attempt)).await;
        }
    }

    Err(last_err).context("broker connection failed")
}
