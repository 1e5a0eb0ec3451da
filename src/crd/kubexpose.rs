//! Kubexpose Custom Resource Definition
//!
//! A Kubexpose asks the operator to put an existing Deployment on a public
//! URL: the operator fronts it with a Service, runs an ngrok tunnel against
//! that Service and reports the tunnel's https URL in `status.url`.

use crate::error::{OperatorError, Result};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Kubexpose is the Schema for the kubexposes API
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "kubexpose.kubexpose.io",
    version = "v1",
    kind = "Kubexpose",
    namespaced,
    status = "KubexposeStatus",
    shortname = "kexp",
    printcolumn = r#"{"name":"Source","type":"string","jsonPath":".spec.sourceDeployment"}"#,
    printcolumn = r#"{"name":"Port","type":"integer","jsonPath":".spec.port"}"#,
    printcolumn = r#"{"name":"Target","type":"string","jsonPath":".spec.targetNamespace"}"#,
    printcolumn = r#"{"name":"URL","type":"string","jsonPath":".status.url"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct KubexposeSpec {
    /// Name of the Deployment to expose; it must live in `targetNamespace`
    #[serde(rename = "sourceDeployment")]
    pub source_deployment: String,

    /// Port the Service exposes and the tunnel forwards to
    #[schemars(range(min = 1, max = 65535))]
    pub port: i32,

    /// Namespace in which the Service and the tunnel Deployment are created
    #[serde(rename = "targetNamespace")]
    pub target_namespace: String,
}

impl KubexposeSpec {
    /// Check the fields the reconciler relies on.
    pub fn validate(&self) -> Result<()> {
        if self.source_deployment.trim().is_empty() {
            return Err(OperatorError::InvalidSpec(
                "sourceDeployment must not be empty".to_string(),
            ));
        }
        if self.target_namespace.trim().is_empty() {
            return Err(OperatorError::InvalidSpec(
                "targetNamespace must not be empty".to_string(),
            ));
        }
        if !(1..=65535).contains(&self.port) {
            return Err(OperatorError::InvalidSpec(format!(
                "port {} is outside 1-65535",
                self.port
            )));
        }
        Ok(())
    }
}

/// Observed state of a Kubexpose
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub struct KubexposeStatus {
    /// Public URL reported by the tunnel, empty until discovered
    #[serde(rename = "url", default)]
    pub public_url: String,
}

impl Kubexpose {
    /// The URL currently recorded in status, empty if none.
    pub fn public_url(&self) -> &str {
        self.status
            .as_ref()
            .map(|s| s.public_url.as_str())
            .unwrap_or_default()
    }
}
