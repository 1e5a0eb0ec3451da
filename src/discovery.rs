//! Public URL discovery
//!
//! The tunnel URL is assigned by ngrok at startup and can only be learned by
//! asking the agent. Discovery finds the tunnel pod, runs a status query
//! inside its container and picks the https tunnel out of the answer.
//!
//! Everything that can go wrong while the tunnel pod is still starting is a
//! [`NotReady`] reason, not an error. Only a failed pod list, which says the
//! API server itself is unhappy, surfaces as an error.

use crate::client::{KubexposeClient, PodExecutor};
use crate::config::OperatorConfig;
use crate::crd::Kubexpose;
use crate::error::Result;
use crate::resources::tunnel_selector;
use crate::tunnel::TunnelInfo;
use kube::ResourceExt;
use std::fmt;
use tracing::debug;

/// Result of one discovery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Discovery {
    /// The tunnel reports this https URL
    Found(String),
    /// The tunnel cannot be queried yet
    NotReady(NotReady),
}

/// Why the tunnel URL could not be read on this pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotReady {
    /// No tunnel pod is scheduled yet
    NoPods,
    /// An old pod is still terminating next to its replacement
    MultiplePods(usize),
    /// The exec call failed, e.g. the container has not started
    ExecFailed(String),
    /// The exec call did not finish within the configured timeout
    ExecTimedOut,
    /// The agent answered with nothing
    EmptyResponse,
    /// The agent's answer was not a tunnel listing
    MalformedResponse(String),
    /// The agent is up but has not opened a tunnel yet
    NoTunnels,
    /// Tunnels exist but none of them is https
    NoHttpsTunnel,
}

impl fmt::Display for NotReady {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotReady::NoPods => write!(f, "no tunnel pod found"),
            NotReady::MultiplePods(n) => write!(f, "{} tunnel pods found, expected one", n),
            NotReady::ExecFailed(msg) => write!(f, "exec into tunnel container failed: {}", msg),
            NotReady::ExecTimedOut => write!(f, "exec into tunnel container timed out"),
            NotReady::EmptyResponse => write!(f, "tunnel agent returned no output"),
            NotReady::MalformedResponse(msg) => {
                write!(f, "could not decode tunnel agent response: {}", msg)
            }
            NotReady::NoTunnels => write!(f, "tunnel agent reports no tunnels yet"),
            NotReady::NoHttpsTunnel => write!(f, "tunnel agent reports no https tunnel yet"),
        }
    }
}

/// Ask the tunnel agent of `kexp` for its public https URL.
pub async fn discover_public_url(
    client: &dyn KubexposeClient,
    executor: &dyn PodExecutor,
    config: &OperatorConfig,
    kexp: &Kubexpose,
) -> Result<Discovery> {
    let namespace = &kexp.spec.target_namespace;
    let selector = tunnel_selector(kexp);

    let pods = client.list_pods(namespace, &selector).await?;
    let pod_name = match pods.as_slice() {
        [] => return Ok(Discovery::NotReady(NotReady::NoPods)),
        [pod] => pod.name_any(),
        many => return Ok(Discovery::NotReady(NotReady::MultiplePods(many.len()))),
    };

    debug!(namespace = %namespace, pod = %pod_name, "Querying tunnel agent");

    let exec = executor.exec(
        namespace,
        &pod_name,
        &config.tunnel_container,
        config.status_command(),
    );
    let output = match tokio::time::timeout(config.exec_timeout, exec).await {
        Err(_) => return Ok(Discovery::NotReady(NotReady::ExecTimedOut)),
        Ok(Err(e)) => return Ok(Discovery::NotReady(NotReady::ExecFailed(e.to_string()))),
        Ok(Ok(output)) => output,
    };

    Ok(Discovery::from_agent_output(&output.stdout))
}

impl Discovery {
    /// Classify the raw stdout of the agent status query.
    pub fn from_agent_output(stdout: &[u8]) -> Self {
        if stdout.iter().all(u8::is_ascii_whitespace) {
            return Discovery::NotReady(NotReady::EmptyResponse);
        }
        let info = match TunnelInfo::parse(stdout) {
            Ok(info) => info,
            Err(e) => return Discovery::NotReady(NotReady::MalformedResponse(e.to_string())),
        };
        if info.is_empty() {
            return Discovery::NotReady(NotReady::NoTunnels);
        }
        match info.https_url() {
            Some(url) => Discovery::Found(url.to_string()),
            None => Discovery::NotReady(NotReady::NoHttpsTunnel),
        }
    }
}
