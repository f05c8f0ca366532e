pub mod config;
pub mod error;
pub mod heartbeat;
pub mod link;
pub mod node;
pub mod router;
pub mod sensor;
pub mod supervisor;
pub mod topics;
pub mod types;

pub use config::{
    HeartbeatFailurePolicy, NetworkConfig, NodeConfig, RuntimeConfig, SupervisorConfig,
};
pub use error::{NodeError, SensorReadError};
pub use heartbeat::HeartbeatSchedule;
pub use link::{associate, LinkInfo, LinkStatus, NetworkLink};
pub use node::{Dispatch, NodeContext, NodeInfo, StatusIndicator};
pub use router::{MessageRouter, Route};
pub use sensor::{
    AdcChannel, AdcTemperature, LinearAdcConversion, SimulatedTemperature, TemperatureSource,
};
pub use supervisor::{ReconnectPolicy, Supervisor, Verdict};
pub use topics::TopicSet;
pub use types::{HeartbeatRecord, MacAddress, NodeIdentity, Outbound, SensorReading};
