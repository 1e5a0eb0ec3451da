//! Kubernetes access used by the reconciler
//!
//! The reconciler never talks to `kube::Client` directly. It goes through
//! these traits so that a pass can be driven against mocks in tests and
//! against the API server in production.

use crate::crd::{Kubexpose, KubexposeStatus};
use crate::error::{is_already_exists, OperatorError, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::{Api, AttachParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

/// Outcome of a create call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Created {
    /// The object was created by this call
    New,
    /// An object with that name was already there
    AlreadyExisted,
}

/// Captured output of a command run inside a container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: String,
}

/// Resource store operations the reconciler depends on
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubexposeClient: Send + Sync {
    /// Fetch a Kubexpose, `None` if it does not exist
    async fn get_kubexpose(&self, namespace: &str, name: &str) -> Result<Option<Kubexpose>>;

    /// Fetch a Deployment, `None` if it does not exist
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>>;

    /// Fetch a Service, `None` if it does not exist
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>>;

    /// Create a Service in the namespace set on its metadata
    async fn create_service(&self, service: &Service) -> Result<Created>;

    /// Create a Deployment in the namespace set on its metadata
    async fn create_deployment(&self, deployment: &Deployment) -> Result<Created>;

    /// List pods matching a label selector
    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>>;

    /// Write `status.url` through the status subresource
    async fn patch_status_url(&self, namespace: &str, name: &str, url: &str) -> Result<()>;
}

/// Remote command execution inside a running container
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PodExecutor: Send + Sync {
    /// Run `command` in `container` of `pod` and wait for it to finish
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: Vec<String>,
    ) -> Result<ExecOutput>;
}

/// API server backed implementation of [`KubexposeClient`]
#[derive(Clone)]
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn get_opt<K>(&self, namespace: &str, name: &str) -> Result<Option<K>>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + Debug,
        K::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create<K>(&self, obj: &K) -> Result<Created>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + Serialize
            + Debug,
        K::DynamicType: Default,
    {
        let namespace = obj.namespace().ok_or_else(|| {
            OperatorError::InvalidState(format!("{} has no namespace", obj.name_any()))
        })?;
        let api: Api<K> = Api::namespaced(self.client.clone(), &namespace);
        match api.create(&PostParams::default(), obj).await {
            Ok(_) => Ok(Created::New),
            Err(e) if is_already_exists(&e) => Ok(Created::AlreadyExisted),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl KubexposeClient for KubeClientImpl {
    async fn get_kubexpose(&self, namespace: &str, name: &str) -> Result<Option<Kubexpose>> {
        self.get_opt(namespace, name).await
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        self.get_opt(namespace, name).await
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        self.get_opt(namespace, name).await
    }

    async fn create_service(&self, service: &Service) -> Result<Created> {
        self.create(service).await
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<Created> {
        self.create(deployment).await
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = pods
            .list(&ListParams::default().labels(label_selector))
            .await?;
        Ok(list.items)
    }

    async fn patch_status_url(&self, namespace: &str, name: &str, url: &str) -> Result<()> {
        let api: Api<Kubexpose> = Api::namespaced(self.client.clone(), namespace);
        let status = KubexposeStatus {
            public_url: url.to_string(),
        };
        let patch = serde_json::json!({ "status": status });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Websocket exec implementation of [`PodExecutor`]
#[derive(Clone)]
pub struct KubePodExecutor {
    client: Client,
}

impl KubePodExecutor {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PodExecutor for KubePodExecutor {
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: Vec<String>,
    ) -> Result<ExecOutput> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = AttachParams::default()
            .container(container)
            .stdin(false)
            .stdout(true)
            .stderr(true);

        debug!(namespace, pod, container, ?command, "Opening exec session");
        let mut attached = pods
            .exec(pod, command, &params)
            .await
            .map_err(|e| OperatorError::Exec(e.to_string()))?;

        let stdout_reader = attached.stdout();
        let stderr_reader = attached.stderr();
        let status = attached.take_status();

        let (stdout, stderr) = tokio::join!(read_all(stdout_reader), read_all(stderr_reader));
        let stdout = stdout.map_err(|e| OperatorError::Exec(e.to_string()))?;
        let stderr = stderr.map_err(|e| OperatorError::Exec(e.to_string()))?;

        let status = match status {
            Some(status) => status.await,
            None => None,
        };
        attached
            .join()
            .await
            .map_err(|e| OperatorError::Exec(e.to_string()))?;

        if let Some(status) = status {
            if status.status.as_deref() == Some("Failure") {
                return Err(OperatorError::Exec(
                    status
                        .message
                        .unwrap_or_else(|| "command failed".to_string()),
                ));
            }
        }

        Ok(ExecOutput {
            stdout,
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }
}

async fn read_all<R>(reader: Option<R>) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        reader.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}
