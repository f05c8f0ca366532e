use std::{fmt, net::Ipv4Addr};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{config::NodeConfig, link::LinkInfo, topics::TopicSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MacAddress(pub [u8; 6]);

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    pub id: Uuid,
    pub sensor_type: String,
    pub alias: String,
    pub location: String,
    pub mac_addr: MacAddress,
    pub ip_addr: Ipv4Addr,
}

impl NodeIdentity {
    pub fn new(config: &NodeConfig, link: &LinkInfo) -> Self {
        Self {
            id: config.sensor_id,
            sensor_type: config.sensor_type.clone(),
            alias: config.alias.clone(),
            location: config.location.clone(),
            mac_addr: link.mac_addr,
            ip_addr: link.ip_addr,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeartbeatRecord {
    pub id: Uuid,
    pub alias: String,
    pub poll_interval: u64,
    pub poll_topic: String,
    pub read_topic: String,
    pub disconnect_topic: String,
    pub ip_addr: Ipv4Addr,
    pub mac_addr: MacAddress,
    pub location: String,
    #[serde(skip)]
    pub sent_at: i64,
}

impl HeartbeatRecord {
    pub fn new(
        identity: &NodeIdentity,
        topics: &TopicSet,
        poll_interval_ms: u64,
        now_secs: i64,
    ) -> Self {
        Self {
            id: identity.id,
            alias: identity.alias.clone(),
            poll_interval: poll_interval_ms,
            poll_topic: topics.poll.clone(),
            read_topic: topics.read.clone(),
            disconnect_topic: topics.disconnect.clone(),
            ip_addr: identity.ip_addr,
            mac_addr: identity.mac_addr,
            location: identity.location.clone(),
            sent_at: now_secs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub sensor_id: Uuid,
    pub sensor_type: String,
    pub value: f32,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn identity() -> NodeIdentity {
        NodeIdentity::new(
            &NodeConfig::default(),
            &LinkInfo {
                ip_addr: Ipv4Addr::new(192, 168, 1, 42),
                mac_addr: MacAddress([40, 205, 193, 3, 226, 159]),
            },
        )
    }

    #[test]
    fn mac_displays_as_colon_hex() {
        assert_eq!(
            MacAddress([40, 205, 193, 3, 226, 159]).to_string(),
            "28:CD:C1:03:E2:9F"
        );
    }

    #[test]
    fn heartbeat_payload_has_wire_fields_only() {
        let identity = identity();
        let topics = TopicSet::derive("picow", &identity.id);
        let record = HeartbeatRecord::new(&identity, &topics, 60_000, 1_700_000_000);

        let value = serde_json::to_value(&record).unwrap();

        assert_eq!(
            value,
            serde_json::json!({
                "id": "f3088463-5623-476f-a1b5-ecb49446a443",
                "alias": "temp_01",
                "poll_interval": 60000,
                "poll_topic": "picow/f3088463-5623-476f-a1b5-ecb49446a443/poll",
                "read_topic": "picow/f3088463-5623-476f-a1b5-ecb49446a443/read",
                "disconnect_topic": "picow/f3088463-5623-476f-a1b5-ecb49446a443/disconnect",
                "ip_addr": "192.168.1.42",
                "mac_addr": [40, 205, 193, 3, 226, 159],
                "location": "rp-pico-w",
            })
        );
    }

    #[test]
    fn reading_payload_keys() {
        let reading = SensorReading {
            sensor_id: identity().id,
            sensor_type: "temp".to_string(),
            value: 21.5,
            timestamp: 1_700_000_000,
        };

        let value = serde_json::to_value(&reading).unwrap();
        let object = value.as_object().unwrap();

        let mut keys: Vec<&str> = object.keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(keys, vec!["sensor_id", "sensor_type", "timestamp", "value"]);
        assert_eq!(object["value"].as_f64(), Some(21.5));
        assert_eq!(object["timestamp"].as_i64(), Some(1_700_000_000));
    }
}
