//! Kubexpose Kubernetes Operator
//!
//! An operator that puts existing Deployments on a public URL through an
//! ngrok tunnel.
//!
//! ## Custom Resources
//!
//! - `Kubexpose`: exposes one port of a Deployment; the operator creates a
//!   Service and an ngrok Deployment for it and reports the tunnel URL in
//!   `status.url`
//!
//! ## Example
//!
//! ```yaml
//! apiVersion: kubexpose.kubexpose.io/v1
//! kind: Kubexpose
//! metadata:
//!   name: expose-nginx
//! spec:
//!   sourceDeployment: nginx
//!   port: 80
//!   targetNamespace: default
//! ```

pub mod client;
pub mod config;
pub mod controllers;
pub mod crd;
pub mod discovery;
pub mod error;
pub mod leader_election;
pub mod resources;
pub mod tunnel;

pub use config::OperatorConfig;
pub use controllers::{Context, KubexposeController};
pub use crd::{Kubexpose, KubexposeSpec, KubexposeStatus};
pub use error::{OperatorError, Result};
