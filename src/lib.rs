pub mod actors;
pub mod clock;
pub mod config;
pub mod hub;
pub mod monitors;
pub mod normalize;
pub mod points;
pub mod protocols;
pub mod storage;
pub mod util;

pub use clock::{Clock, ManualClock, SystemClock};
pub use hub::{HubParts, MonitoringHub};
pub use points::{DataType, MonitoredPoint, NewPoint, Protocol, ProtocolType};
