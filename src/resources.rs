//! Child resources owned by a Kubexpose
//!
//! Names are derived from the source Deployment and the request name so that
//! every pass computes the same identities without storing any progress.

use crate::config::OperatorConfig;
use crate::crd::Kubexpose;
use crate::error::{OperatorError, Result};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, PodSpec, PodTemplateSpec, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;

/// Pod label naming the source Deployment being exposed
pub const EXPOSING_LABEL: &str = "exposing";
/// Pod label naming the Kubexpose that owns the tunnel
pub const KUBEXPOSE_CR_LABEL: &str = "kubexpose-cr";

const TUNNEL_REPLICAS: i32 = 1;

/// Name of the Service fronting the source Deployment.
pub fn service_name(source: &str, request: &str) -> String {
    format!("{}-svc-{}", source, request)
}

/// Name of the Deployment running the tunnel agent.
pub fn deployment_name(source: &str, request: &str) -> String {
    format!("{}-expose-{}", source, request)
}

/// Labels carried by the tunnel pods; also the tunnel Deployment's selector.
pub fn tunnel_labels(kexp: &Kubexpose) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(
        EXPOSING_LABEL.to_string(),
        kexp.spec.source_deployment.clone(),
    );
    labels.insert(KUBEXPOSE_CR_LABEL.to_string(), kexp.name_any());
    labels
}

/// Label selector string matching the tunnel pods, e.g. `exposing=web,kubexpose-cr=req1`.
pub fn tunnel_selector(kexp: &Kubexpose) -> String {
    tunnel_labels(kexp)
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Controller owner reference pointing at the Kubexpose.
///
/// Children carrying it are garbage collected when the Kubexpose is deleted.
pub fn owner_reference(kexp: &Kubexpose) -> Result<OwnerReference> {
    let uid = kexp.metadata.uid.clone().ok_or_else(|| {
        OperatorError::InvalidState(format!("Kubexpose {} has no uid", kexp.name_any()))
    })?;
    Ok(OwnerReference {
        api_version: Kubexpose::api_version(&()).to_string(),
        kind: Kubexpose::kind(&()).to_string(),
        name: kexp.name_any(),
        uid,
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}

/// Whether the children live outside the Kubexpose's namespace.
///
/// Owner references only resolve within one namespace. The garbage collector
/// treats a cross-namespace owner as absent and deletes such children, so they
/// are recreated on the next pass.
pub fn crosses_namespaces(kexp: &Kubexpose) -> bool {
    kexp.namespace().as_deref() != Some(kexp.spec.target_namespace.as_str())
}

/// Build the ClusterIP Service for the source Deployment.
///
/// The selector is copied verbatim from the source Deployment's `matchLabels`.
pub fn build_service(
    kexp: &Kubexpose,
    selector: BTreeMap<String, String>,
) -> Result<Service> {
    let name = service_name(&kexp.spec.source_deployment, &kexp.name_any());

    Ok(Service {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(kexp.spec.target_namespace.clone()),
            owner_references: Some(vec![owner_reference(kexp)?]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(selector),
            ports: Some(vec![ServicePort {
                port: kexp.spec.port,
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Build the single-replica tunnel Deployment forwarding to the Service.
pub fn build_tunnel_deployment(kexp: &Kubexpose, config: &OperatorConfig) -> Result<Deployment> {
    let request = kexp.name_any();
    let source = &kexp.spec.source_deployment;
    let labels = tunnel_labels(kexp);
    let upstream = format!("{}:{}", service_name(source, &request), kexp.spec.port);

    let container = Container {
        name: config.tunnel_container.clone(),
        image: Some(config.tunnel_image.clone()),
        command: Some(vec!["ngrok".to_string()]),
        args: Some(vec!["http".to_string(), upstream]),
        ports: Some(vec![ContainerPort {
            container_port: config.agent_port,
            ..Default::default()
        }]),
        ..Default::default()
    };

    Ok(Deployment {
        metadata: ObjectMeta {
            name: Some(deployment_name(source, &request)),
            namespace: Some(kexp.spec.target_namespace.clone()),
            owner_references: Some(vec![owner_reference(kexp)?]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(TUNNEL_REPLICAS),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Pod selector labels of a Deployment, if it selects by `matchLabels`.
pub fn deployment_selector(deployment: &Deployment) -> Option<BTreeMap<String, String>> {
    deployment
        .spec
        .as_ref()
        .and_then(|s| s.selector.match_labels.clone())
        .filter(|labels| !labels.is_empty())
}
