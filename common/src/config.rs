use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::MacAddress;

pub const DEFAULT_SENSOR_ID: Uuid = Uuid::from_u128(0xf3088463_5623_476f_a1b5_ecb49446a443);
pub const DEFAULT_TOPIC_BASE: &str = "picow";
pub const DEFAULT_MAC: MacAddress = MacAddress([0x28, 0xcd, 0xc1, 0x03, 0xe2, 0x9f]);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub sensor_id: Uuid,
    pub sensor_type: String,
    pub alias: String,
    pub location: String,
    pub topic_base: String,
    pub mac_addr: MacAddress,
    pub poll_interval_ms: u64,
    pub heartbeat_period_ms: u64,
    pub honor_disconnect: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            sensor_id: DEFAULT_SENSOR_ID,
            sensor_type: "temp".to_string(),
            alias: "temp_01".to_string(),
            location: "rp-pico-w".to_string(),
            topic_base: DEFAULT_TOPIC_BASE.to_string(),
            mac_addr: DEFAULT_MAC,
            poll_interval_ms: 60_000,
            heartbeat_period_ms: 30_000,
            honor_disconnect: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub association_timeout_ticks: u32,
    pub mqtt_client_id: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
    pub keepalive_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            association_timeout_ticks: 10,
            mqtt_client_id: "picow_sensor1".to_string(),
            mqtt_host: "pi4.local".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
            keepalive_secs: 7_200,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatFailurePolicy {
    Fatal,
    LogAndContinue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub connect_attempts: u32,
    pub connect_timeout_ms: u64,
    pub max_reconnect_attempts: u32,
    pub backoff_ms: Vec<u64>,
    pub sustained_delay_ms: u64,
    pub heartbeat_failure: HeartbeatFailurePolicy,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            connect_attempts: 3,
            connect_timeout_ms: 10_000,
            max_reconnect_attempts: 5,
            backoff_ms: vec![1_000, 2_000, 5_000, 10_000],
            sustained_delay_ms: 30_000,
            heartbeat_failure: HeartbeatFailurePolicy::LogAndContinue,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub node: NodeConfig,
    pub network: NetworkConfig,
    pub supervisor: SupervisorConfig,
}

impl NodeConfig {
    pub fn sanitize(&mut self) {
        let base = self.topic_base.trim().trim_matches('/');
        self.topic_base = if base.is_empty() {
            DEFAULT_TOPIC_BASE.to_string()
        } else {
            base.to_string()
        };

        if self.heartbeat_period_ms == 0 {
            self.heartbeat_period_ms = NodeConfig::default().heartbeat_period_ms;
        }
        if self.poll_interval_ms == 0 {
            self.poll_interval_ms = NodeConfig::default().poll_interval_ms;
        }
    }
}

impl NetworkConfig {
    pub fn sanitize(&mut self) {
        self.association_timeout_ticks = self.association_timeout_ticks.clamp(1, 120);
        if self.mqtt_port == 0 {
            self.mqtt_port = 1883;
        }
        // rumqttc rejects keepalive below 5s
        self.keepalive_secs = self.keepalive_secs.clamp(5, u16::MAX as u64);
        if self.mqtt_client_id.trim().is_empty() {
            self.mqtt_client_id = NetworkConfig::default().mqtt_client_id;
        }
    }

    pub fn has_station_credentials(&self) -> bool {
        let ssid = self.wifi_ssid.trim();
        !ssid.is_empty() && ssid != "CHANGE_ME"
    }
}

impl SupervisorConfig {
    pub fn sanitize(&mut self) {
        self.connect_attempts = self.connect_attempts.max(1);
        self.connect_timeout_ms = self.connect_timeout_ms.max(500);
    }
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.node.sanitize();
        self.network.sanitize();
        self.supervisor.sanitize();
    }
}
