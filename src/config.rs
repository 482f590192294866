//! Engine Configuration
//!
//! [`EngineConfig`] collects the sizes and identity strings that are fixed
//! when a [`ConnectionPool`](crate::connection::ConnectionPool) is created.

use bytes::Bytes;
use std::time::Duration;

/// Context XML served by `PRINT` when the embedder supplies none.
pub const EMPTY_CONTEXT_XML: &str = concat!(
    "<?xml version=\"1.0\" encoding=\"utf-8\"?>",
    "<!DOCTYPE context [<!ELEMENT context (device)*>]>",
    "<context name=\"nbiiod\" description=\"nbiiod\"></context>"
);

/// Configuration for the protocol engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of connection slots in the pool (default: 16)
    pub max_connections: usize,

    /// Capacity of each connection's line buffer (default: 512 bytes)
    pub line_size: usize,

    /// Scratch buffer size handed to each connection by the TCP driver
    /// (default: 64 KiB)
    pub scratch_size: usize,

    /// Stream-oriented transport: READBUF accumulates a full chunk before
    /// sending it (default: true)
    pub network: bool,

    /// How long the TCP driver sleeps after a round with no progress
    /// (default: 1ms)
    pub poll_interval: Duration,

    /// Document returned by `PRINT`
    pub context_xml: Bytes,

    /// Protocol version reported by `VERSION`
    pub version_major: u32,
    pub version_minor: u32,

    /// Build tag reported by `VERSION` (truncated to 7 characters)
    pub version_tag: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_connections: 16,
            line_size: 512,
            scratch_size: 64 * 1024,
            network: true,
            poll_interval: Duration::from_millis(1),
            context_xml: Bytes::from_static(EMPTY_CONTEXT_XML.as_bytes()),
            version_major: 0,
            version_minor: 25,
            version_tag: "0000000".to_string(),
        }
    }
}

impl EngineConfig {
    /// Returns the `VERSION` reply body, e.g. `0.25 0000000`.
    pub fn version_string(&self) -> String {
        let tag: String = self.version_tag.chars().take(7).collect();
        format!("{}.{} {}", self.version_major, self.version_minor, tag)
    }
}
