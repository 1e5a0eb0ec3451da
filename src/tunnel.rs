//! Tunnel agent status parsing
//!
//! The ngrok agent lists its tunnels at `GET /api/tunnels` on its local web
//! interface. The operator reads that listing from inside the tunnel pod and
//! keeps only what it needs: the public URL and protocol of each tunnel.

use serde::Deserialize;

/// Protocol tag of the tunnel whose URL is published on the resource
pub const HTTPS_PROTO: &str = "https";

/// Decoded `/api/tunnels` response
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TunnelInfo {
    pub tunnels: Vec<Tunnel>,
}

/// A single tunnel reported by the agent
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Tunnel {
    pub public_url: String,
    pub proto: String,
}

impl TunnelInfo {
    /// Decode the agent's JSON response.
    ///
    /// Malformed input is an error; an empty `tunnels` list is not.
    pub fn parse(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }

    /// URL of the first tunnel whose protocol is exactly `https`, if any.
    pub fn https_url(&self) -> Option<&str> {
        self.tunnels
            .iter()
            .find(|t| t.proto == HTTPS_PROTO)
            .map(|t| t.public_url.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }
}
