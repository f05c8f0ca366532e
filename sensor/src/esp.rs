use std::{
    net::Ipv4Addr,
    sync::{mpsc, Arc, Mutex, OnceLock},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    mqtt::client::QoS,
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    adc::{
        attenuation::DB_11,
        oneshot::{config::AdcChannelConfig, AdcChannelDriver, AdcDriver},
        ADC1,
    },
    gpio::{AnyOutputPin, Gpio34, Output, PinDriver},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::prelude::Peripherals,
    log::EspLogger,
    mqtt::client::{
        Details, EspMqttClient, EspMqttConnection, EventPayload, MqttClientConfiguration,
    },
    nvs::EspDefaultNvsPartition,
    sntp::EspSntp,
    wifi::EspWifi,
};
use log::{error, info, warn};

use sensor_node_common::{
    associate, AdcChannel, AdcTemperature, Dispatch, HeartbeatFailurePolicy, HeartbeatSchedule,
    LinearAdcConversion, LinkStatus, MacAddress, NetworkLink, NodeContext, NodeError, NodeInfo,
    Outbound, ReconnectPolicy, RuntimeConfig, SensorReadError, StatusIndicator, Supervisor,
    Verdict,
};

const STATUS_LED_PIN: i32 = 2;
const HEARTBEAT_POLL_MS: u64 = 250;
const FAULT_BLINKS: u32 = 20;
const FAULT_BLINK_MS: u64 = 100;

/// TMP36-style sensor on GPIO34: 0.5 V at 0 °C, +10 mV/°C, 12-bit reads at 11 dB.
const TMP36_CONVERSION: LinearAdcConversion = LinearAdcConversion {
    vref: 3.1,
    full_scale: 4_095.0,
    offset_volts: 0.5,
    slope_volts_per_degree: -0.010,
    reference_celsius: 0.0,
};

type SharedClient = Arc<Mutex<EspMqttClient<'static>>>;
type EspNode = NodeContext<AdcTemperature<Tmp36Channel>, StatusLed>;

struct Tmp36Channel {
    driver: AdcChannelDriver<'static, Gpio34, AdcDriver<'static, ADC1>>,
}

impl AdcChannel for Tmp36Channel {
    fn read_raw(&mut self) -> Result<u16, SensorReadError> {
        self.driver
            .read_raw()
            .map_err(|err| SensorReadError::new(format!("adc1/gpio34: {err}")))
    }
}

struct StatusLed {
    pin: Option<PinDriver<'static, AnyOutputPin, Output>>,
}

impl StatusLed {
    fn new(pin: i32) -> Self {
        let driver = unsafe { PinDriver::output(AnyOutputPin::new(pin)) };
        match driver {
            Ok(mut driver) => {
                let _ = driver.set_low();
                Self { pin: Some(driver) }
            }
            Err(err) => {
                warn!("status LED unavailable on GPIO{pin}: {err}");
                Self { pin: None }
            }
        }
    }
}

impl StatusIndicator for StatusLed {
    fn set_busy(&mut self, busy: bool) {
        if let Some(pin) = self.pin.as_mut() {
            let _ = if busy { pin.set_high() } else { pin.set_low() };
        }
    }

    fn show_fault(&mut self) {
        let Some(pin) = self.pin.as_mut() else {
            return;
        };
        for _ in 0..FAULT_BLINKS {
            let _ = pin.toggle();
            thread::sleep(Duration::from_millis(FAULT_BLINK_MS));
        }
        let _ = pin.set_high();
    }
}

struct EspLink {
    wifi: EspWifi<'static>,
}

impl NetworkLink for EspLink {
    fn begin(&mut self, ssid: &str, passphrase: &str) -> Result<(), NodeError> {
        let auth_method = if passphrase.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };
        let config = Configuration::Client(ClientConfiguration {
            ssid: ssid
                .try_into()
                .map_err(|_| NodeError::Config("wifi ssid too long".to_string()))?,
            password: passphrase
                .try_into()
                .map_err(|_| NodeError::Config("wifi password too long".to_string()))?,
            auth_method,
            ..Default::default()
        });

        let wifi_err =
            |err: esp_idf_svc::sys::EspError| NodeError::connection("wifi", err.to_string());
        self.wifi.set_configuration(&config).map_err(wifi_err)?;
        self.wifi.start().map_err(wifi_err)?;
        self.wifi.connect().map_err(wifi_err)?;
        info!("wifi started, connecting to `{ssid}`");
        Ok(())
    }

    fn status(&mut self) -> LinkStatus {
        match self.wifi.is_connected() {
            Ok(false) => LinkStatus::Connecting,
            Ok(true) => match self.ip_addr() {
                Some(_) => LinkStatus::GotIp,
                None => LinkStatus::NoIp,
            },
            Err(err) => LinkStatus::Failed(err.code()),
        }
    }

    fn ip_addr(&mut self) -> Option<Ipv4Addr> {
        self.wifi
            .sta_netif()
            .get_ip_info()
            .ok()
            .map(|info| info.ip)
            .filter(|ip| !ip.is_unspecified())
    }

    fn mac_addr(&mut self) -> MacAddress {
        match self.wifi.sta_netif().get_mac() {
            Ok(mac) => MacAddress(mac),
            Err(err) => {
                warn!("failed to read station MAC: {err}");
                RuntimeConfig::default().node.mac_addr
            }
        }
    }
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let mut runtime = RuntimeConfig::default();
    runtime.network.wifi_ssid = option_env!("WIFI_SSID").unwrap_or("CHANGE_ME").to_string();
    runtime.network.wifi_pass = option_env!("WIFI_PASS").unwrap_or_default().to_string();
    if let Some(host) = option_env!("MQTT_HOST") {
        runtime.network.mqtt_host = host.to_string();
    }
    runtime.sanitize();
    if !runtime.network.has_station_credentials() {
        return Err(anyhow!("no wifi credentials compiled in; set WIFI_SSID/WIFI_PASS"));
    }

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let peripherals = Peripherals::take()?;

    let adc = AdcDriver::new(peripherals.adc1)?;
    let adc_config = AdcChannelConfig {
        attenuation: DB_11,
        ..Default::default()
    };
    let tmp36 = Tmp36Channel {
        driver: AdcChannelDriver::new(adc, peripherals.pins.gpio34, &adc_config)?,
    };

    let mut link = EspLink {
        wifi: EspWifi::new(peripherals.modem, sys_loop, Some(nvs_partition))?,
    };
    let network = &runtime.network;
    let link_info = associate(
        &mut link,
        &network.wifi_ssid,
        &network.wifi_pass,
        network.association_timeout_ticks,
        |remaining| {
            info!("waiting for connection... ({remaining} ticks left)");
            thread::sleep(Duration::from_secs(1));
        },
    )
    .context("wifi startup failed")?;
    info!("link up: ip {} mac {}", link_info.ip_addr, link_info.mac_addr);

    let _sntp = EspSntp::new_default()
        .map_err(|err| warn!("sntp unavailable, timestamps will drift: {err}"))
        .ok();

    let (client, conn) = create_mqtt_client(&runtime)?;
    let (frame_tx, frames) = mpsc::channel();
    spawn_mqtt_receiver(conn, frame_tx)?;
    wait_for_broker(&frames, &runtime)?;
    let client: SharedClient = Arc::new(Mutex::new(client));

    let mut node: EspNode = NodeContext::from_config(
        &runtime.node,
        &link_info,
        AdcTemperature::new(tmp36, TMP36_CONVERSION),
        StatusLed::new(STATUS_LED_PIN),
    );
    subscribe_routes(&node, &client)?;

    spawn_heartbeat(
        node.info().clone(),
        client.clone(),
        runtime.node.heartbeat_period_ms,
        runtime.supervisor.heartbeat_failure,
    )?;

    let mut supervisor = Supervisor::new(ReconnectPolicy::from_config(&runtime.supervisor));
    let mut resubscribe = false;
    info!("sensor node running");

    loop {
        let frame = frames.recv().context("mqtt receiver thread stopped")?;
        match frame {
            MqttFrame::Received { topic, data } => {
                info!("received {} byte(s) on `{topic}`", data.len());
                let now = chrono::Utc::now().timestamp();
                match node.handle_message(topic.as_bytes(), &data, now)? {
                    Dispatch::Publish(outbound) => {
                        if let Err(err) = publish(&client, &outbound) {
                            warn!("dropping poll response: {err:#}");
                        }
                    }
                    Dispatch::Ignored(topic) => info!("no route for `{topic}`; dropped"),
                    Dispatch::Skipped(err) => warn!("poll skipped: {err}"),
                    Dispatch::Shutdown => {
                        info!("disconnect requested; leaving broker");
                        return Ok(());
                    }
                }
            }
            MqttFrame::Connected => {
                supervisor.record_success();
                if resubscribe {
                    info!("mqtt reconnected");
                    subscribe_routes(&node, &client)?;
                    resubscribe = false;
                }
            }
            MqttFrame::Disconnected(reason) => {
                resubscribe = true;
                escalate_or_wait(&mut supervisor, &mut node, &reason)?;
            }
        }
    }
}

/// Owned copy of one connection event.
enum MqttFrame {
    Connected,
    Disconnected(String),
    Received { topic: String, data: Vec<u8> },
}

/// Drains the connection on its own thread. Each event is copied and dropped
/// before it is forwarded, so the client is never used while the MQTT task
/// waits on an undelivered event.
fn spawn_mqtt_receiver(
    mut conn: EspMqttConnection,
    frames: mpsc::Sender<MqttFrame>,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(12 * 1024)
        .spawn(move || loop {
            let frame = match conn.next() {
                Ok(event) => match event.payload() {
                    EventPayload::Received {
                        topic: Some(topic),
                        data,
                        details: Details::Complete,
                        ..
                    } => MqttFrame::Received {
                        topic: topic.to_string(),
                        data: data.to_vec(),
                    },
                    EventPayload::Connected(_) => MqttFrame::Connected,
                    EventPayload::Disconnected => {
                        MqttFrame::Disconnected("broker disconnected".to_string())
                    }
                    EventPayload::Error(err) => {
                        warn!("mqtt error event: {err:?}");
                        continue;
                    }
                    _ => continue,
                },
                Err(err) => {
                    let frame = MqttFrame::Disconnected(format!("{err:?}"));
                    if frames.send(frame).is_err() {
                        break;
                    }
                    thread::sleep(Duration::from_secs(2));
                    continue;
                }
            };

            if frames.send(frame).is_err() {
                break;
            }
        })
        .context("failed to spawn mqtt receiver thread")?;
    Ok(())
}

fn escalate_or_wait(
    supervisor: &mut Supervisor,
    node: &mut EspNode,
    reason: &str,
) -> Result<(), NodeError> {
    match supervisor.record_failure() {
        Verdict::Retry { attempt, delay } => {
            warn!("mqtt transport error ({reason}); reconnect {attempt} in {delay:?}");
            thread::sleep(delay);
            Ok(())
        }
        Verdict::Escalate { failures } => {
            error!("giving up after {failures} consecutive transport failures");
            node.indicator_mut().show_fault();
            Err(NodeError::Transport(reason.to_string()))
        }
    }
}

fn create_mqtt_client(
    runtime: &RuntimeConfig,
) -> anyhow::Result<(EspMqttClient<'static>, EspMqttConnection)> {
    let network = &runtime.network;
    let url = format!("mqtt://{}:{}", network.mqtt_host, network.mqtt_port);

    let conf = MqttClientConfiguration {
        client_id: Some(network.mqtt_client_id.as_str()),
        keep_alive_interval: Some(Duration::from_secs(network.keepalive_secs)),
        username: if network.mqtt_user.is_empty() {
            None
        } else {
            Some(network.mqtt_user.as_str())
        },
        password: if network.mqtt_pass.is_empty() {
            None
        } else {
            Some(network.mqtt_pass.as_str())
        },
        ..Default::default()
    };

    Ok(EspMqttClient::new(url.as_str(), &conf)?)
}

fn wait_for_broker(
    frames: &mpsc::Receiver<MqttFrame>,
    runtime: &RuntimeConfig,
) -> anyhow::Result<()> {
    let attempts = runtime.supervisor.connect_attempts;
    let timeout = Duration::from_millis(runtime.supervisor.connect_timeout_ms);
    let backoff = ReconnectPolicy::from_config(&runtime.supervisor);
    let mut failures = 0;

    loop {
        let reason = match frames.recv_timeout(timeout) {
            Ok(MqttFrame::Connected) => {
                info!("mqtt connected as `{}`", runtime.network.mqtt_client_id);
                return Ok(());
            }
            Ok(MqttFrame::Disconnected(reason)) => reason,
            Ok(MqttFrame::Received { topic, .. }) => {
                warn!("dropping `{topic}` received before the session was up");
                continue;
            }
            Err(mpsc::RecvTimeoutError::Timeout) => format!("no CONNACK within {timeout:?}"),
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                return Err(anyhow!("mqtt receiver thread stopped"));
            }
        };

        failures += 1;
        if failures >= attempts {
            return Err(NodeError::connection(
                "mqtt",
                format!("no session after {failures} attempt(s): {reason}"),
            ))
            .context("broker connection failed");
        }
        warn!("mqtt connect attempt {failures}/{attempts} failed: {reason}");
        thread::sleep(backoff.delay_for(failures));
    }
}

fn subscribe_routes(node: &EspNode, client: &SharedClient) -> anyhow::Result<()> {
    let mut client = client
        .lock()
        .map_err(|_| anyhow!("mqtt client lock poisoned"))?;
    for topic in node.router().subscriptions() {
        client
            .subscribe(topic, QoS::AtMostOnce)
            .with_context(|| format!("failed to subscribe to `{topic}`"))?;
        info!("subscribed to `{topic}`");
    }
    Ok(())
}

fn publish(client: &SharedClient, outbound: &Outbound) -> anyhow::Result<()> {
    let mut client = client
        .lock()
        .map_err(|_| anyhow!("mqtt client lock poisoned"))?;
    client
        .publish(&outbound.topic, QoS::AtMostOnce, false, &outbound.payload)
        .with_context(|| format!("failed to publish to `{}`", outbound.topic))?;
    Ok(())
}

fn restart(reason: &anyhow::Error) -> ! {
    error!("heartbeat failed, restarting: {reason:#}");
    thread::sleep(Duration::from_millis(100));
    unsafe { esp_idf_svc::sys::esp_restart() }
}

fn spawn_heartbeat(
    node_info: Arc<NodeInfo>,
    client: SharedClient,
    period_ms: u64,
    policy: HeartbeatFailurePolicy,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("heartbeat".into())
        .stack_size(8 * 1024)
        .spawn(move || {
            let mut schedule = HeartbeatSchedule::new(period_ms, monotonic_ms());
            loop {
                thread::sleep(Duration::from_millis(
                    schedule.until_due_ms(monotonic_ms()).clamp(1, HEARTBEAT_POLL_MS),
                ));
                if !schedule.poll(monotonic_ms()) {
                    continue;
                }

                let record = node_info.heartbeat_record(chrono::Utc::now().timestamp());
                info!("HEARTBEAT {}", record.sent_at);
                let outbound = match node_info.heartbeat_outbound(&record) {
                    Ok(outbound) => outbound,
                    Err(err) => restart(&anyhow::Error::new(err)),
                };

                if let Err(err) = publish(&client, &outbound) {
                    if policy == HeartbeatFailurePolicy::Fatal {
                        restart(&err);
                    }
                    warn!("heartbeat failed: {err:#}");
                }
            }
        })
        .context("failed to spawn heartbeat thread")?;
    Ok(())
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
