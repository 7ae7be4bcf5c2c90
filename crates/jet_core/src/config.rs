//! Broker configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How `fetch` requests are served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchMode {
    /// Full matcher/sorter fetches with peer-chosen ids.
    #[default]
    Full,
    /// One unsorted "everything" fetch per peer, id `fetch_all`.
    Simple,
}

impl FetchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Simple => "simple",
        }
    }
}

/// Settings of one broker instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Reported by `info`.
    pub name: String,

    /// How long a routed `call`/`set` waits for the owning peer.
    #[serde(rename = "route_timeout_ms", with = "duration_ms_serde")]
    pub route_timeout: Duration,

    pub fetch: FetchMode,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            name: "jetd".to_string(),
            route_timeout: Duration::from_secs(5),
            fetch: FetchMode::Full,
        }
    }
}

mod duration_ms_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}
