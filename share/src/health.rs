use serde::{Deserialize, Serialize};

/// Capacity of the process-wide health event queue.
pub const HEALTH_QUEUE_CAPACITY: usize = 200;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Bool(bool),
    Str(String),
}

/// Fire-and-forget event consumed by the health reporter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HealthEvent {
    /// A configuration snapshot entry.
    Config { key: String, value: ConfigValue },
    /// A component signalling it is still making progress.
    Liveness { component: String },
}

impl HealthEvent {
    pub fn config_bool(key: &str, value: bool) -> Self {
        HealthEvent::Config {
            key: key.to_owned(),
            value: ConfigValue::Bool(value),
        }
    }

    pub fn config_str(key: &str, value: impl Into<String>) -> Self {
        HealthEvent::Config {
            key: key.to_owned(),
            value: ConfigValue::Str(value.into()),
        }
    }

    pub fn liveness(component: &str) -> Self {
        HealthEvent::Liveness {
            component: component.to_owned(),
        }
    }
}
