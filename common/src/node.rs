use std::sync::Arc;

use crate::{
    config::NodeConfig,
    error::{NodeError, SensorReadError},
    link::LinkInfo,
    router::{MessageRouter, Route},
    sensor::TemperatureSource,
    topics::TopicSet,
    types::{HeartbeatRecord, NodeIdentity, Outbound, SensorReading},
};

pub trait StatusIndicator {
    fn set_busy(&mut self, busy: bool);
    fn show_fault(&mut self);
}

/// Immutable per-process facts shared by the timer and the dispatch loop.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeInfo {
    pub identity: NodeIdentity,
    pub topics: TopicSet,
    pub poll_interval_ms: u64,
}

impl NodeInfo {
    pub fn new(config: &NodeConfig, link: &LinkInfo) -> Self {
        let identity = NodeIdentity::new(config, link);
        let topics = TopicSet::derive(&config.topic_base, &identity.id);
        Self {
            identity,
            topics,
            poll_interval_ms: config.poll_interval_ms,
        }
    }

    pub fn heartbeat_record(&self, now_secs: i64) -> HeartbeatRecord {
        HeartbeatRecord::new(&self.identity, &self.topics, self.poll_interval_ms, now_secs)
    }

    pub fn heartbeat_outbound(&self, record: &HeartbeatRecord) -> Result<Outbound, NodeError> {
        Ok(Outbound {
            topic: self.topics.heartbeat.clone(),
            payload: serde_json::to_vec(record)?,
        })
    }

    pub fn reading(&self, value: f32, now_secs: i64) -> Result<Outbound, NodeError> {
        let reading = SensorReading {
            sensor_id: self.identity.id,
            sensor_type: self.identity.sensor_type.clone(),
            value,
            timestamp: now_secs,
        };
        Ok(Outbound {
            topic: self.topics.read.clone(),
            payload: serde_json::to_vec(&reading)?,
        })
    }
}

#[derive(Debug)]
pub enum Dispatch {
    Publish(Outbound),
    Ignored(String),
    Skipped(SensorReadError),
    Shutdown,
}

pub struct NodeContext<T, I> {
    info: Arc<NodeInfo>,
    router: MessageRouter,
    sensor: T,
    indicator: I,
}

impl<T, I> NodeContext<T, I>
where
    T: TemperatureSource,
    I: StatusIndicator,
{
    pub fn new(info: Arc<NodeInfo>, router: MessageRouter, sensor: T, indicator: I) -> Self {
        Self {
            info,
            router,
            sensor,
            indicator,
        }
    }

    pub fn from_config(config: &NodeConfig, link: &LinkInfo, sensor: T, indicator: I) -> Self {
        let info = NodeInfo::new(config, link);
        let router = MessageRouter::new(&info.topics, config.honor_disconnect);
        Self::new(Arc::new(info), router, sensor, indicator)
    }

    pub fn info(&self) -> &Arc<NodeInfo> {
        &self.info
    }

    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    pub fn indicator_mut(&mut self) -> &mut I {
        &mut self.indicator
    }

    pub fn handle_message(
        &mut self,
        topic: &[u8],
        _payload: &[u8],
        now_secs: i64,
    ) -> Result<Dispatch, NodeError> {
        self.indicator.set_busy(true);
        let result = self.dispatch(topic, now_secs);
        self.indicator.set_busy(false);
        result
    }

    fn dispatch(&mut self, topic: &[u8], now_secs: i64) -> Result<Dispatch, NodeError> {
        match self.router.route(topic) {
            Some(Route::Poll) => match self.sensor.read_celsius() {
                Ok(value) => Ok(Dispatch::Publish(self.info.reading(value, now_secs)?)),
                Err(err) => Ok(Dispatch::Skipped(err)),
            },
            Some(Route::Disconnect) => Ok(Dispatch::Shutdown),
            None => Ok(Dispatch::Ignored(
                String::from_utf8_lossy(topic).into_owned(),
            )),
        }
    }
}
