//! The `info` method's result.

use serde::Serialize;

use crate::config::{BrokerConfig, FetchMode};

/// Protocol revision spoken by this broker.
pub const PROTOCOL_VERSION: u32 = 2;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Info {
    pub name: String,
    pub version: String,
    pub protocol_version: u32,
    pub features: Features,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Features {
    pub batches: bool,
    pub authentication: bool,
    pub fetch: FetchMode,
}

impl Info {
    pub fn new(config: &BrokerConfig) -> Self {
        Self {
            name: config.name.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            protocol_version: PROTOCOL_VERSION,
            features: Features {
                batches: true,
                authentication: false,
                fetch: config.fetch,
            },
        }
    }
}
