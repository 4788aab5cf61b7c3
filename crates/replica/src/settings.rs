//! Replica configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Behavior switches and timer durations for a single replica.
///
/// A `None` duration disables the corresponding background behavior.
/// Durations are (de)serialized as integer milliseconds, so settings can be
/// read from a JSON config file:
///
/// ```json
/// { "stale_time_ms": 30000, "clear_time_ms": 60000 }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicaSettings {
    /// How long data stays fresh after a successful load.
    #[serde(rename = "stale_time_ms", with = "duration_ms")]
    pub stale_time: Option<Duration>,

    /// How long data and errors survive once the last observer leaves.
    #[serde(rename = "clear_time_ms", with = "duration_ms")]
    pub clear_time: Option<Duration>,

    /// How long an error survives once the last observer leaves.
    #[serde(rename = "clear_error_time_ms", with = "duration_ms")]
    pub clear_error_time: Option<Duration>,

    /// How long an unrequested load keeps running once the last observer leaves.
    #[serde(rename = "cancel_time_ms", with = "duration_ms")]
    pub cancel_time: Option<Duration>,

    /// Revalidate whenever the number of active observers grows.
    pub revalidate_on_active_observer_added: bool,

    /// Revalidate when network connectivity comes back while observed.
    pub revalidate_on_network_reconnect: bool,

    /// Whether the auto-clear timer also removes the value from storage.
    pub clear_storage_on_auto_clear: bool,
}

impl Default for ReplicaSettings {
    fn default() -> Self {
        Self {
            stale_time: None,
            clear_time: None,
            clear_error_time: None,
            cancel_time: None,
            revalidate_on_active_observer_added: true,
            revalidate_on_network_reconnect: true,
            clear_storage_on_auto_clear: false,
        }
    }
}

impl ReplicaSettings {
    /// Settings with the given stale time and everything else at defaults.
    pub fn with_stale_time(stale_time: Duration) -> Self {
        Self {
            stale_time: Some(stale_time),
            ..Self::default()
        }
    }

    /// Parse settings from a JSON document.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
