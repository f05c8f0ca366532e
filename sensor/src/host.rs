use std::{
    future::Future,
    net::{Ipv4Addr, SocketAddr, ToSocketAddrs, UdpSocket},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use chrono::Utc;
use rumqttc::EventLoop;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use sensor_node_common::{
    associate, Dispatch, HeartbeatFailurePolicy, LinkInfo, LinkStatus, MacAddress,
    NetworkConfig, NetworkLink, NodeContext, NodeError, NodeInfo, ReconnectPolicy, RuntimeConfig,
    SimulatedTemperature, StatusIndicator, Supervisor, TemperatureSource, Verdict,
};

use crate::session::{self, Session, SessionEvent};

const CONFIG_PATH_ENV: &str = "SENSOR_NODE_CONFIG";
const SIMULATED_MEAN_C: f32 = 21.0;
const ASSOCIATION_TICK: Duration = Duration::from_secs(1);

/// Host stand-in for the radio: the address is whatever local interface
/// routes to the broker.
struct HostLink {
    broker: String,
    mac_addr: MacAddress,
    polls: u32,
    ip_addr: Option<Ipv4Addr>,
}

impl HostLink {
    fn new(runtime: &RuntimeConfig) -> Self {
        Self {
            broker: format!(
                "{}:{}",
                runtime.network.mqtt_host, runtime.network.mqtt_port
            ),
            mac_addr: runtime.node.mac_addr,
            polls: 0,
            ip_addr: None,
        }
    }

    fn route_to_broker(&self) -> Option<Ipv4Addr> {
        let target = self
            .broker
            .to_socket_addrs()
            .ok()?
            .find(SocketAddr::is_ipv4)?;
        let socket = UdpSocket::bind(("0.0.0.0", 0)).ok()?;
        socket.connect(target).ok()?;
        match socket.local_addr().ok()? {
            SocketAddr::V4(addr) => Some(*addr.ip()),
            SocketAddr::V6(_) => None,
        }
    }
}

impl NetworkLink for HostLink {
    fn begin(&mut self, ssid: &str, _passphrase: &str) -> Result<(), NodeError> {
        debug!("host build has no radio; ignoring association to `{ssid}`");
        self.polls = 0;
        self.ip_addr = None;
        Ok(())
    }

    fn status(&mut self) -> LinkStatus {
        self.polls = self.polls.saturating_add(1);
        if self.polls == 1 {
            return LinkStatus::Connecting;
        }
        if self.ip_addr.is_none() {
            self.ip_addr = Some(self.route_to_broker().unwrap_or_else(|| {
                warn!("no route to {}; announcing loopback address", self.broker);
                Ipv4Addr::LOCALHOST
            }));
        }
        LinkStatus::GotIp
    }

    fn ip_addr(&mut self) -> Option<Ipv4Addr> {
        self.ip_addr
    }

    fn mac_addr(&mut self) -> MacAddress {
        self.mac_addr
    }
}

struct LogIndicator;

impl StatusIndicator for LogIndicator {
    fn set_busy(&mut self, busy: bool) {
        debug!("status led {}", if busy { "on" } else { "off" });
    }

    fn show_fault(&mut self) {
        error!("status led: fault");
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let runtime = load_runtime_config()?;

    let (link, (publisher, eventloop)) = bring_up(
        &runtime.network,
        HostLink::new(&runtime),
        ASSOCIATION_TICK,
        |link| {
            let runtime = runtime.clone();
            async move { session::connect(&runtime, &link).await }
        },
    )
    .await?;

    let node = NodeContext::from_config(
        &runtime.node,
        &link,
        SimulatedTemperature::new(SIMULATED_MEAN_C),
        LogIndicator,
    );
    let mut dispatcher = Dispatcher::new(
        node,
        publisher.clone(),
        ReconnectPolicy::from_config(&runtime.supervisor),
    );
    dispatcher.subscribe_routes().await?;

    let (fatal_tx, fatal_rx) = mpsc::channel(1);
    spawn_heartbeat(
        dispatcher.node.info().clone(),
        publisher,
        runtime.node.heartbeat_period_ms,
        runtime.supervisor.heartbeat_failure,
        fatal_tx,
    );

    run_event_loop(dispatcher, eventloop, fatal_rx).await
}

fn load_runtime_config() -> anyhow::Result<RuntimeConfig> {
    let mut runtime = match std::env::var(CONFIG_PATH_ENV) {
        Ok(path) => {
            let raw = std::fs::read(&path)
                .with_context(|| format!("failed to read runtime config `{path}`"))?;
            serde_json::from_slice::<RuntimeConfig>(&raw)
                .with_context(|| format!("invalid runtime config `{path}`"))?
        }
        Err(_) => RuntimeConfig::default(),
    };

    let network = &mut runtime.network;
    if let Ok(host) = std::env::var("MQTT_HOST") {
        network.mqtt_host = host;
    }
    if let Some(port) = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
    {
        network.mqtt_port = port;
    }
    if let Ok(user) = std::env::var("MQTT_USER") {
        network.mqtt_user = user;
        network.mqtt_pass = std::env::var("MQTT_PASS").unwrap_or_default();
    }
    if let Ok(ssid) = std::env::var("WIFI_SSID") {
        network.wifi_ssid = ssid;
    }
    if let Ok(pass) = std::env::var("WIFI_PASS") {
        network.wifi_pass = pass;
    }
    if network.wifi_ssid.is_empty() {
        network.wifi_ssid = option_env!("WIFI_SSID").unwrap_or("CHANGE_ME").to_string();
    }
    if network.wifi_pass.is_empty() {
        network.wifi_pass = option_env!("WIFI_PASS").unwrap_or_default().to_string();
    }

    runtime.sanitize();
    Ok(runtime)
}

/// Associates first and only then dials the broker with the resulting link.
async fn bring_up<L, S, F, Fut>(
    network: &NetworkConfig,
    mut link: L,
    tick: Duration,
    connect: F,
) -> anyhow::Result<(LinkInfo, S)>
where
    L: NetworkLink + Send + 'static,
    F: FnOnce(LinkInfo) -> Fut,
    Fut: Future<Output = anyhow::Result<S>>,
{
    let network = network.clone();
    let link_info = tokio::task::spawn_blocking(move || {
        associate(
            &mut link,
            &network.wifi_ssid,
            &network.wifi_pass,
            network.association_timeout_ticks,
            |remaining| {
                info!("waiting for connection... ({remaining} ticks left)");
                std::thread::sleep(tick);
            },
        )
    })
    .await
    .context("association task failed")?
    .context("wifi startup failed")?;
    info!("link up: ip {} mac {}", link_info.ip_addr, link_info.mac_addr);

    let session = connect(link_info).await?;
    Ok((link_info, session))
}

fn spawn_heartbeat<S>(
    node_info: Arc<NodeInfo>,
    session: S,
    period_ms: u64,
    policy: HeartbeatFailurePolicy,
    fatal: mpsc::Sender<anyhow::Error>,
) -> JoinHandle<()>
where
    S: Session + 'static,
{
    tokio::spawn(async move {
        let period = Duration::from_millis(period_ms);
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            let record = node_info.heartbeat_record(Utc::now().timestamp());
            info!("HEARTBEAT {}", record.sent_at);

            let outbound = match node_info.heartbeat_outbound(&record) {
                Ok(outbound) => outbound,
                Err(err) => {
                    let _ = fatal.send(anyhow::Error::new(err)).await;
                    break;
                }
            };

            if let Err(err) = session.publish(outbound).await {
                match policy {
                    HeartbeatFailurePolicy::LogAndContinue => {
                        warn!("heartbeat publish failed: {err:#}");
                    }
                    HeartbeatFailurePolicy::Fatal => {
                        let _ = fatal.send(err).await;
                        break;
                    }
                }
            }
        }
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Owns the node context and handles one session event at a time.
struct Dispatcher<S, T, I> {
    node: NodeContext<T, I>,
    session: S,
    supervisor: Supervisor,
    resubscribe: bool,
}

impl<S, T, I> Dispatcher<S, T, I>
where
    S: Session,
    T: TemperatureSource,
    I: StatusIndicator,
{
    fn new(node: NodeContext<T, I>, session: S, policy: ReconnectPolicy) -> Self {
        Self {
            node,
            session,
            supervisor: Supervisor::new(policy),
            resubscribe: false,
        }
    }

    async fn subscribe_routes(&self) -> anyhow::Result<()> {
        for topic in self.node.router().subscriptions() {
            self.session.subscribe(topic).await?;
            info!("subscribed to `{topic}`");
        }
        Ok(())
    }

    async fn step(&mut self, event: SessionEvent) -> anyhow::Result<Flow> {
        match event {
            SessionEvent::Frame { topic, payload } => {
                self.supervisor.record_success();
                info!("received {} byte(s) on `{topic}`", payload.len());

                let now = Utc::now().timestamp();
                match self.node.handle_message(topic.as_bytes(), &payload, now)? {
                    Dispatch::Publish(outbound) => {
                        let topic = outbound.topic.clone();
                        match self.session.publish(outbound).await {
                            Ok(()) => info!("poll answered on `{topic}`"),
                            Err(err) => warn!("dropping poll response: {err:#}"),
                        }
                    }
                    Dispatch::Ignored(topic) => debug!("no route for `{topic}`; dropped"),
                    Dispatch::Skipped(err) => warn!("poll skipped: {err}"),
                    Dispatch::Shutdown => {
                        info!("disconnect requested; leaving broker");
                        self.session.disconnect().await;
                        return Ok(Flow::Stop);
                    }
                }
            }
            SessionEvent::ConnAck => {
                self.supervisor.record_success();
                if self.resubscribe {
                    info!("mqtt reconnected");
                    self.subscribe_routes().await?;
                    self.resubscribe = false;
                }
            }
            SessionEvent::Other => {}
            SessionEvent::Failed(reason) => {
                self.resubscribe = true;
                match self.supervisor.record_failure() {
                    Verdict::Retry { attempt, delay } => {
                        warn!("mqtt poll error: {reason}; reconnect {attempt} in {delay:?}");
                        tokio::time::sleep(delay).await;
                    }
                    Verdict::Escalate { failures } => {
                        self.node.indicator_mut().show_fault();
                        error!("giving up after {failures} consecutive transport failures");
                        return Err(NodeError::Transport(reason).into());
                    }
                }
            }
        }
        Ok(Flow::Continue)
    }
}

async fn run_event_loop<S, T, I>(
    mut dispatcher: Dispatcher<S, T, I>,
    mut eventloop: EventLoop,
    mut fatal: mpsc::Receiver<anyhow::Error>,
) -> anyhow::Result<()>
where
    S: Session,
    T: TemperatureSource,
    I: StatusIndicator,
{
    info!("sensor node running");

    loop {
        let event = tokio::select! {
            polled = eventloop.poll() => SessionEvent::from_poll(polled),
            Some(err) = fatal.recv() => return Err(err.context("heartbeat failed")),
        };

        if dispatcher.step(event).await? == Flow::Stop {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    };

    use super::*;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use sensor_node_common::{NodeConfig, Outbound, SensorReadError, SupervisorConfig};

    #[derive(Default)]
    struct Recorded {
        attempts: usize,
        published: Vec<(Duration, Outbound)>,
        subscribed: Vec<String>,
        disconnected: bool,
    }

    #[derive(Clone)]
    struct RecordingSession {
        started: Instant,
        fail_publish: bool,
        recorded: Arc<Mutex<Recorded>>,
    }

    impl RecordingSession {
        fn new(fail_publish: bool) -> Self {
            Self {
                started: Instant::now(),
                fail_publish,
                recorded: Arc::new(Mutex::new(Recorded::default())),
            }
        }

        fn attempts(&self) -> usize {
            self.recorded.lock().unwrap().attempts
        }

        fn published_at_secs(&self) -> Vec<u64> {
            let recorded = self.recorded.lock().unwrap();
            recorded.published.iter().map(|(at, _)| at.as_secs()).collect()
        }

        fn topics(&self) -> Vec<String> {
            let recorded = self.recorded.lock().unwrap();
            recorded
                .published
                .iter()
                .map(|(_, outbound)| outbound.topic.clone())
                .collect()
        }

        fn subscribed(&self) -> Vec<String> {
            self.recorded.lock().unwrap().subscribed.clone()
        }
    }

    #[async_trait]
    impl Session for RecordingSession {
        async fn publish(&self, outbound: Outbound) -> anyhow::Result<()> {
            let mut recorded = self.recorded.lock().unwrap();
            recorded.attempts += 1;
            if self.fail_publish {
                anyhow::bail!("broker unreachable");
            }
            recorded.published.push((self.started.elapsed(), outbound));
            Ok(())
        }

        async fn subscribe(&self, topic: &str) -> anyhow::Result<()> {
            self.recorded.lock().unwrap().subscribed.push(topic.to_string());
            Ok(())
        }

        async fn disconnect(&self) {
            self.recorded.lock().unwrap().disconnected = true;
        }
    }

    struct StuckLink;

    impl NetworkLink for StuckLink {
        fn begin(&mut self, _ssid: &str, _passphrase: &str) -> Result<(), NodeError> {
            Ok(())
        }

        fn status(&mut self) -> LinkStatus {
            LinkStatus::Connecting
        }

        fn ip_addr(&mut self) -> Option<Ipv4Addr> {
            None
        }

        fn mac_addr(&mut self) -> MacAddress {
            MacAddress([2, 0, 0, 0, 0, 1])
        }
    }

    struct ReadyLink;

    impl NetworkLink for ReadyLink {
        fn begin(&mut self, _ssid: &str, _passphrase: &str) -> Result<(), NodeError> {
            Ok(())
        }

        fn status(&mut self) -> LinkStatus {
            LinkStatus::GotIp
        }

        fn ip_addr(&mut self) -> Option<Ipv4Addr> {
            Some(Ipv4Addr::new(10, 1, 2, 3))
        }

        fn mac_addr(&mut self) -> MacAddress {
            MacAddress([2, 0, 0, 0, 0, 1])
        }
    }

    struct FlakySensor {
        fail: bool,
    }

    impl TemperatureSource for FlakySensor {
        fn read_celsius(&mut self) -> Result<f32, SensorReadError> {
            if self.fail {
                Err(SensorReadError::new("sensor unplugged"))
            } else {
                Ok(22.5)
            }
        }
    }

    #[derive(Default)]
    struct FaultCounter {
        faults: usize,
    }

    impl StatusIndicator for FaultCounter {
        fn set_busy(&mut self, _busy: bool) {}

        fn show_fault(&mut self) {
            self.faults += 1;
        }
    }

    fn link_info() -> LinkInfo {
        LinkInfo {
            ip_addr: Ipv4Addr::new(10, 1, 2, 3),
            mac_addr: MacAddress([2, 0, 0, 0, 0, 1]),
        }
    }

    fn node_info() -> Arc<NodeInfo> {
        Arc::new(NodeInfo::new(&NodeConfig::default(), &link_info()))
    }

    fn dispatcher(
        session: RecordingSession,
        sensor_fails: bool,
        honor_disconnect: bool,
    ) -> Dispatcher<RecordingSession, FlakySensor, FaultCounter> {
        let config = NodeConfig {
            honor_disconnect,
            ..NodeConfig::default()
        };
        let node = NodeContext::from_config(
            &config,
            &link_info(),
            FlakySensor { fail: sensor_fails },
            FaultCounter::default(),
        );
        let policy = ReconnectPolicy {
            max_attempts: 2,
            backoff_ms: vec![1_000],
            sustained_delay_ms: 5_000,
        };
        Dispatcher::new(node, session, policy)
    }

    fn frame(topic: &str) -> SessionEvent {
        SessionEvent::Frame {
            topic: topic.to_string(),
            payload: Vec::new(),
        }
    }

    fn stuck_network() -> NetworkConfig {
        NetworkConfig {
            wifi_ssid: "home".to_string(),
            association_timeout_ticks: 3,
            ..NetworkConfig::default()
        }
    }

    #[tokio::test]
    async fn failed_association_never_dials_broker() {
        let dialled = Arc::new(AtomicBool::new(false));
        let flag = dialled.clone();

        let result = bring_up(&stuck_network(), StuckLink, Duration::ZERO, |_| async move {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        })
        .await;

        let err = result.unwrap_err();
        assert!(err.to_string().contains("wifi startup failed"), "{err:#}");
        assert!(!dialled.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn broker_is_dialled_with_associated_link() {
        let (link, dialled_with) =
            bring_up(&stuck_network(), ReadyLink, Duration::ZERO, |link| async move {
                Ok(link)
            })
            .await
            .unwrap();

        assert_eq!(link.ip_addr, Ipv4Addr::new(10, 1, 2, 3));
        assert_eq!(dialled_with, link);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_fires_once_per_period_after_first_delay() {
        let session = RecordingSession::new(false);
        let (fatal_tx, mut fatal_rx) = mpsc::channel(1);

        let handle = spawn_heartbeat(
            node_info(),
            session.clone(),
            30_000,
            HeartbeatFailurePolicy::LogAndContinue,
            fatal_tx,
        );
        tokio::time::sleep(Duration::from_millis(95_000)).await;
        handle.abort();

        assert_eq!(session.published_at_secs(), vec![30, 60, 90]);
        assert!(session.topics().iter().all(|topic| topic == "heartbeat/picow"));
        assert!(fatal_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_failures_are_logged_by_default() {
        let session = RecordingSession::new(true);
        let (fatal_tx, mut fatal_rx) = mpsc::channel(1);

        let handle = spawn_heartbeat(
            node_info(),
            session.clone(),
            30_000,
            SupervisorConfig::default().heartbeat_failure,
            fatal_tx,
        );
        tokio::time::sleep(Duration::from_millis(95_000)).await;

        assert_eq!(session.attempts(), 3);
        assert!(fatal_rx.try_recv().is_err());
        assert!(!handle.is_finished());
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_heartbeat_policy_reports_first_failure() {
        let session = RecordingSession::new(true);
        let (fatal_tx, mut fatal_rx) = mpsc::channel(1);

        let handle = spawn_heartbeat(
            node_info(),
            session.clone(),
            30_000,
            HeartbeatFailurePolicy::Fatal,
            fatal_tx,
        );
        let err = tokio::time::timeout(Duration::from_secs(31), fatal_rx.recv())
            .await
            .unwrap()
            .unwrap();
        handle.await.unwrap();

        assert!(err.to_string().contains("broker unreachable"));
        assert_eq!(session.attempts(), 1);
    }

    #[tokio::test]
    async fn subscribes_poll_topic_before_dispatching() {
        let session = RecordingSession::new(false);
        let dispatcher = dispatcher(session.clone(), false, false);

        dispatcher.subscribe_routes().await.unwrap();

        assert_eq!(
            session.subscribed(),
            vec!["picow/f3088463-5623-476f-a1b5-ecb49446a443/poll".to_string()]
        );
    }

    #[tokio::test]
    async fn poll_frame_publishes_one_reading() {
        let session = RecordingSession::new(false);
        let mut dispatcher = dispatcher(session.clone(), false, false);
        let poll = dispatcher.node.info().topics.poll.clone();

        let flow = dispatcher.step(frame(&poll)).await.unwrap();
        dispatcher.step(frame("heartbeat/picow")).await.unwrap();
        dispatcher.step(SessionEvent::Other).await.unwrap();

        assert_eq!(flow, Flow::Continue);
        assert_eq!(
            session.topics(),
            vec!["picow/f3088463-5623-476f-a1b5-ecb49446a443/read".to_string()]
        );
    }

    #[tokio::test]
    async fn sensor_failure_publishes_nothing() {
        let session = RecordingSession::new(false);
        let mut dispatcher = dispatcher(session.clone(), true, false);
        let poll = dispatcher.node.info().topics.poll.clone();

        let flow = dispatcher.step(frame(&poll)).await.unwrap();

        assert_eq!(flow, Flow::Continue);
        assert_eq!(session.attempts(), 0);
    }

    #[tokio::test]
    async fn disconnect_frame_stops_loop_when_honored() {
        let session = RecordingSession::new(false);
        let mut dispatcher = dispatcher(session.clone(), false, true);
        let disconnect = dispatcher.node.info().topics.disconnect.clone();

        let flow = dispatcher.step(frame(&disconnect)).await.unwrap();

        assert_eq!(flow, Flow::Stop);
        assert!(session.recorded.lock().unwrap().disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failures_escalate_after_budget() {
        let session = RecordingSession::new(false);
        let mut dispatcher = dispatcher(session, false, false);
        let started = Instant::now();

        for _ in 0..2 {
            let flow = dispatcher
                .step(SessionEvent::Failed("connection reset".to_string()))
                .await
                .unwrap();
            assert_eq!(flow, Flow::Continue);
        }
        assert_eq!(started.elapsed().as_secs(), 6);

        let err = dispatcher
            .step(SessionEvent::Failed("connection reset".to_string()))
            .await
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<NodeError>(),
            Some(NodeError::Transport(reason)) if reason == "connection reset"
        ));
        assert_eq!(dispatcher.node.indicator_mut().faults, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_renews_subscriptions_and_resets_budget() {
        let session = RecordingSession::new(false);
        let mut dispatcher = dispatcher(session.clone(), false, false);

        dispatcher.step(SessionEvent::ConnAck).await.unwrap();
        assert!(session.subscribed().is_empty());

        for _ in 0..2 {
            dispatcher
                .step(SessionEvent::Failed("timeout".to_string()))
                .await
                .unwrap();
        }
        dispatcher.step(SessionEvent::ConnAck).await.unwrap();

        assert_eq!(session.subscribed().len(), 1);
        assert_eq!(dispatcher.supervisor.consecutive_failures(), 0);
        let flow = dispatcher
            .step(SessionEvent::Failed("timeout".to_string()))
            .await
            .unwrap();
        assert_eq!(flow, Flow::Continue);
    }
}
