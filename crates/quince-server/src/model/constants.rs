//! TPS check points guarded by the HTTP surface

pub const CONFIG_LISTEN_POINT: &str = "ConfigListen";
pub const CONFIG_PUBLISH_POINT: &str = "ConfigPublish";

/// Capacity of the config change event channel
pub const CONFIG_EVENT_CAPACITY: usize = 16384;
