//! Runtime configuration for the Kubexpose controller
//!
//! Everything the reconciler needs beyond the Kubexpose object itself: which
//! tunnel image to launch, how to reach its status endpoint, and the requeue
//! timings. The binary fills this from command-line flags.

use crate::error::{OperatorError, Result};
use std::time::Duration;

pub const DEFAULT_TUNNEL_IMAGE: &str = "wernight/ngrok";
pub const DEFAULT_TUNNEL_CONTAINER: &str = "ngrok";
pub const DEFAULT_AGENT_PORT: i32 = 4040;
pub const DEFAULT_AGENT_STATUS_PATH: &str = "/api/tunnels";

const DEFAULT_NOT_READY_DELAY: Duration = Duration::from_secs(5);
const DEFAULT_REQUEUE_AFTER_CREATE: Duration = Duration::from_secs(1);
const DEFAULT_ERROR_BACKOFF: Duration = Duration::from_secs(10);
const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(10);

/// Controller settings shared by every reconcile pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorConfig {
    /// Image running the tunnel agent
    pub tunnel_image: String,
    /// Name of the agent container inside the tunnel pod
    pub tunnel_container: String,
    /// Port of the agent's local web interface
    pub agent_port: i32,
    /// Path of the agent's tunnel listing endpoint
    pub agent_status_path: String,
    /// Delay before retrying when the tunnel is not ready yet
    pub not_ready_delay: Duration,
    /// Delay before re-evaluating after a child resource was created
    pub requeue_after_create: Duration,
    /// Delay before retrying after a failed pass
    pub error_backoff: Duration,
    /// Upper bound on one exec round trip into the tunnel container
    pub exec_timeout: Duration,
    /// Maximum number of concurrent reconcile passes, 0 for unbounded
    pub concurrency: u16,
    /// Window for coalescing bursts of watch events
    pub debounce: Duration,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            tunnel_image: DEFAULT_TUNNEL_IMAGE.to_string(),
            tunnel_container: DEFAULT_TUNNEL_CONTAINER.to_string(),
            agent_port: DEFAULT_AGENT_PORT,
            agent_status_path: DEFAULT_AGENT_STATUS_PATH.to_string(),
            not_ready_delay: DEFAULT_NOT_READY_DELAY,
            requeue_after_create: DEFAULT_REQUEUE_AFTER_CREATE,
            error_backoff: DEFAULT_ERROR_BACKOFF,
            exec_timeout: DEFAULT_EXEC_TIMEOUT,
            concurrency: 0,
            debounce: Duration::ZERO,
        }
    }
}

impl OperatorConfig {
    /// Reject settings that would make the controller spin or never finish.
    pub fn validate(&self) -> Result<()> {
        if self.tunnel_image.trim().is_empty() {
            return Err(OperatorError::Configuration(
                "tunnel image must not be empty".to_string(),
            ));
        }
        if self.tunnel_container.trim().is_empty() {
            return Err(OperatorError::Configuration(
                "tunnel container name must not be empty".to_string(),
            ));
        }
        if !(1..=65535).contains(&self.agent_port) {
            return Err(OperatorError::Configuration(format!(
                "agent port {} is outside 1-65535",
                self.agent_port
            )));
        }
        if !self.agent_status_path.starts_with('/') {
            return Err(OperatorError::Configuration(format!(
                "agent status path {:?} must start with '/'",
                self.agent_status_path
            )));
        }
        for (name, value) in [
            ("not-ready delay", self.not_ready_delay),
            ("requeue-after-create delay", self.requeue_after_create),
            ("error backoff", self.error_backoff),
            ("exec timeout", self.exec_timeout),
        ] {
            if value.is_zero() {
                return Err(OperatorError::Configuration(format!(
                    "{} must be greater than zero",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Local URL of the agent's tunnel listing, as seen from inside its pod
    pub fn agent_status_url(&self) -> String {
        format!(
            "http://localhost:{}{}",
            self.agent_port, self.agent_status_path
        )
    }

    /// Command executed in the tunnel container to read the tunnel list
    pub fn status_command(&self) -> Vec<String> {
        vec!["curl".to_string(), "-s".to_string(), self.agent_status_url()]
    }
}
