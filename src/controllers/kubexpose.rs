//! Kubexpose Controller
//!
//! Reconciles Kubexpose custom resources into a Service fronting the source
//! Deployment, an ngrok Deployment tunneling to that Service, and the tunnel's
//! public URL on `status.url`.
//!
//! Every pass starts from a fresh read and walks the same steps in order:
//!
//! 1. fetch the Kubexpose (gone means nothing to do)
//! 2. ensure the Service exists
//! 3. ensure the tunnel Deployment exists
//! 4. ask the tunnel agent for its https URL
//! 5. write the URL to status if it changed
//!
//! A step that creates something ends the pass with a short requeue so the
//! next pass observes the created object before moving on.

use crate::client::{
    Created, KubeClientImpl, KubePodExecutor, KubexposeClient, PodExecutor,
};
use crate::config::OperatorConfig;
use crate::crd::Kubexpose;
use crate::discovery::{discover_public_url, Discovery};
use crate::error::{OperatorError, Result};
use crate::resources::{
    build_service, build_tunnel_deployment, crosses_namespaces, deployment_name,
    deployment_selector, service_name,
};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use kube::api::Api;
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::watcher::Config;
use kube::{Client, ResourceExt};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Shared state handed to every reconcile pass
pub struct Context {
    /// Resource store access
    pub client: Arc<dyn KubexposeClient>,
    /// Exec access into tunnel pods
    pub executor: Arc<dyn PodExecutor>,
    /// Controller settings
    pub config: OperatorConfig,
}

impl Context {
    /// Context backed by a live cluster connection
    pub fn new(client: Client, config: OperatorConfig) -> Self {
        Self {
            client: Arc::new(KubeClientImpl::new(client.clone())),
            executor: Arc::new(KubePodExecutor::new(client)),
            config,
        }
    }

    /// Context over arbitrary client implementations
    pub fn with_clients(
        client: Arc<dyn KubexposeClient>,
        executor: Arc<dyn PodExecutor>,
        config: OperatorConfig,
    ) -> Self {
        Self {
            client,
            executor,
            config,
        }
    }
}

/// Runs the Kubexpose reconciliation loop
pub struct KubexposeController {
    client: Client,
    config: OperatorConfig,
    namespace: Option<String>,
}

impl KubexposeController {
    /// Create a new controller; `namespace` restricts the watch, `None` watches all
    pub fn new(client: Client, config: OperatorConfig, namespace: Option<String>) -> Self {
        Self {
            client,
            config,
            namespace,
        }
    }

    fn api<K>(&self) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    /// Run the controller until `shutdown` resolves or a termination signal arrives.
    ///
    /// Services and Deployments are watched too; their events are mapped back
    /// to the owning Kubexpose so that externally deleted children get
    /// recreated.
    pub async fn run(self, shutdown: impl Future<Output = ()> + Send + Sync + 'static) {
        let kubexposes: Api<Kubexpose> = self.api();
        let services: Api<Service> = self.api();
        let deployments: Api<Deployment> = self.api();

        let controller_config = controller::Config::default()
            .concurrency(self.config.concurrency)
            .debounce(self.config.debounce);
        let ctx = Arc::new(Context::new(self.client.clone(), self.config.clone()));

        info!(
            namespace = self.namespace.as_deref().unwrap_or("all"),
            concurrency = self.config.concurrency,
            "Starting Kubexpose controller"
        );

        Controller::new(kubexposes, Config::default())
            .owns(services, Config::default())
            .owns(deployments, Config::default())
            .with_config(controller_config)
            .graceful_shutdown_on(shutdown)
            .shutdown_on_signal()
            .run(reconcile, error_policy, ctx)
            .for_each(|result| async move {
                match result {
                    Ok((obj, action)) => {
                        debug!(name = %obj.name, namespace = ?obj.namespace, ?action, "Reconciled Kubexpose");
                    }
                    Err(e) => {
                        warn!("Reconciliation failed: {}", e);
                    }
                }
            })
            .await;

        info!("Kubexpose controller stopped");
    }
}

/// Requeue failed passes after the configured backoff.
pub fn error_policy(kexp: Arc<Kubexpose>, error: &OperatorError, ctx: Arc<Context>) -> Action {
    let namespace = kexp.namespace().unwrap_or_default();
    error!(
        namespace = %namespace,
        name = %kexp.name_any(),
        "Reconciliation error: {}", error
    );
    Action::requeue(ctx.config.error_backoff)
}

/// One reconcile pass for the Kubexpose identified by `kexp`.
///
/// The object from the watch cache only names the resource; the pass reads
/// the current object from the API server.
#[instrument(skip_all, fields(namespace = tracing::field::Empty, name = %kexp.name_any()))]
pub async fn reconcile(kexp: Arc<Kubexpose>, ctx: Arc<Context>) -> Result<Action> {
    let name = kexp.name_any();
    let namespace = kexp.namespace().unwrap_or_else(|| "default".to_string());
    tracing::Span::current().record("namespace", namespace.as_str());

    info!("Reconciling Kubexpose {}/{}", namespace, name);

    let kexp = match ctx.client.get_kubexpose(&namespace, &name).await? {
        Some(k) => k,
        None => {
            info!("Kubexpose not found, it must have been deleted");
            return Ok(Action::await_change());
        }
    };

    if let Err(e) = kexp.spec.validate() {
        warn!("Ignoring Kubexpose until it is edited: {}", e);
        return Ok(Action::await_change());
    }

    if crosses_namespaces(&kexp) {
        warn!(
            target_namespace = %kexp.spec.target_namespace,
            "Owner reference cannot resolve across namespaces; garbage collection will delete the children and they will be recreated"
        );
    }

    if let Some(action) = ensure_service(&kexp, &ctx).await? {
        return Ok(action);
    }

    if let Some(action) = ensure_tunnel_deployment(&kexp, &ctx).await? {
        return Ok(action);
    }

    let current_url = kexp.public_url();
    info!(url = %current_url, "URL as per status");

    let latest_url = match discover_public_url(
        ctx.client.as_ref(),
        ctx.executor.as_ref(),
        &ctx.config,
        &kexp,
    )
    .await?
    {
        Discovery::Found(url) => url,
        Discovery::NotReady(reason) => {
            info!("Public URL not available yet: {}", reason);
            return Ok(Action::requeue(ctx.config.not_ready_delay));
        }
    };

    if latest_url != current_url {
        ctx.client
            .patch_status_url(&namespace, &name, &latest_url)
            .await?;
        info!(url = %latest_url, "Status updated with public URL");
        return Ok(Action::await_change());
    }

    info!(
        service = %service_name(&kexp.spec.source_deployment, &name),
        deployment = %deployment_name(&kexp.spec.source_deployment, &name),
        url = %latest_url,
        "Kubexpose successfully reconciled"
    );
    Ok(Action::await_change())
}

/// Create the Service if it is missing.
///
/// Returns the action that ends the pass, or `None` when the Service exists
/// and the pass can move on.
async fn ensure_service(kexp: &Kubexpose, ctx: &Context) -> Result<Option<Action>> {
    let namespace = &kexp.spec.target_namespace;
    let source = &kexp.spec.source_deployment;
    let name = service_name(source, &kexp.name_any());

    if ctx.client.get_service(namespace, &name).await?.is_some() {
        return Ok(None);
    }

    info!(namespace = %namespace, source = %source, "Looking for source deployment");
    let source_deployment = match ctx.client.get_deployment(namespace, source).await? {
        Some(d) => d,
        None => {
            // Nothing to build a selector from; wait for the Kubexpose to change
            warn!(namespace = %namespace, source = %source, "Source deployment does not exist");
            return Ok(Some(Action::await_change()));
        }
    };

    let Some(selector) = deployment_selector(&source_deployment) else {
        warn!(
            namespace = %namespace,
            source = %source,
            "Source deployment has no matchLabels selector, cannot build a service"
        );
        return Ok(Some(Action::await_change()));
    };

    let service = build_service(kexp, selector)?;
    match ctx.client.create_service(&service).await? {
        Created::New => info!(namespace = %namespace, service = %name, "Service created"),
        Created::AlreadyExisted => {
            debug!(namespace = %namespace, service = %name, "Service already exists")
        }
    }

    Ok(Some(Action::requeue(ctx.config.requeue_after_create)))
}

/// Create the tunnel Deployment if it is missing.
async fn ensure_tunnel_deployment(kexp: &Kubexpose, ctx: &Context) -> Result<Option<Action>> {
    let namespace = &kexp.spec.target_namespace;
    let name = deployment_name(&kexp.spec.source_deployment, &kexp.name_any());

    if ctx.client.get_deployment(namespace, &name).await?.is_some() {
        return Ok(None);
    }

    let deployment = build_tunnel_deployment(kexp, &ctx.config)?;
    match ctx.client.create_deployment(&deployment).await? {
        Created::New => info!(namespace = %namespace, deployment = %name, "Tunnel deployment created"),
        Created::AlreadyExisted => {
            debug!(namespace = %namespace, deployment = %name, "Tunnel deployment already exists")
        }
    }

    Ok(Some(Action::requeue(ctx.config.requeue_after_create)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ExecOutput, MockKubexposeClient, MockPodExecutor};
    use crate::crd::{KubexposeSpec, KubexposeStatus};
    use k8s_openapi::api::apps::v1::DeploymentSpec;
    use k8s_openapi::api::core::v1::Pod;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::time::Duration;

    const HTTPS_URL: &str = "https://1a2b3c.ngrok.io";
    const TUNNELS: &str = r#"{"tunnels":[
        {"public_url":"https://1a2b3c.ngrok.io","proto":"https"},
        {"public_url":"http://1a2b3c.ngrok.io","proto":"http"}
    ]}"#;

    fn kubexpose(url: Option<&str>) -> Kubexpose {
        let mut kexp = Kubexpose::new(
            "req1",
            KubexposeSpec {
                source_deployment: "web".to_string(),
                port: 8080,
                target_namespace: "apps".to_string(),
            },
        );
        kexp.metadata.namespace = Some("default".to_string());
        kexp.metadata.uid = Some("uid-1".to_string());
        kexp.status = url.map(|u| KubexposeStatus {
            public_url: u.to_string(),
        });
        kexp
    }

    fn source_deployment() -> Deployment {
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), "web".to_string());
        Deployment {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("apps".to_string()),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                selector: LabelSelector {
                    match_labels: Some(labels),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn tunnel_pod() -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("web-expose-req1-7d9f-abcde".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn context(client: MockKubexposeClient, executor: MockPodExecutor) -> Arc<Context> {
        Arc::new(Context::with_clients(
            Arc::new(client),
            Arc::new(executor),
            OperatorConfig::default(),
        ))
    }

    fn agent_output() -> ExecOutput {
        ExecOutput {
            stdout: TUNNELS.as_bytes().to_vec(),
            stderr: String::new(),
        }
    }

    /// A mock client for a fully converged cluster with the given status URL
    fn converged_client(status_url: Option<&'static str>) -> MockKubexposeClient {
        let mut client = MockKubexposeClient::new();
        client
            .expect_get_kubexpose()
            .returning(move |_, _| Ok(Some(kubexpose(status_url))));
        client
            .expect_get_service()
            .returning(|_, _| Ok(Some(Service::default())));
        client
            .expect_get_deployment()
            .returning(|_, _| Ok(Some(Deployment::default())));
        client
            .expect_list_pods()
            .returning(|_, _| Ok(vec![tunnel_pod()]));
        client
    }

    #[tokio::test]
    async fn test_missing_kubexpose_is_terminal() {
        let mut client = MockKubexposeClient::new();
        client.expect_get_kubexpose().returning(|_, _| Ok(None));
        client.expect_get_service().times(0);
        client.expect_create_service().times(0);

        let action = reconcile(
            Arc::new(kubexpose(None)),
            context(client, MockPodExecutor::new()),
        )
        .await
        .unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn test_invalid_spec_waits_for_change() {
        let mut client = MockKubexposeClient::new();
        client.expect_get_kubexpose().returning(|_, _| {
            let mut kexp = kubexpose(None);
            kexp.spec.port = 0;
            Ok(Some(kexp))
        });
        client.expect_get_service().times(0);

        let action = reconcile(
            Arc::new(kubexpose(None)),
            context(client, MockPodExecutor::new()),
        )
        .await
        .unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn test_missing_source_deployment_stalls_without_error() {
        let mut client = MockKubexposeClient::new();
        client
            .expect_get_kubexpose()
            .returning(|_, _| Ok(Some(kubexpose(None))));
        client.expect_get_service().returning(|_, _| Ok(None));
        client
            .expect_get_deployment()
            .withf(|ns, name| ns == "apps" && name == "web")
            .returning(|_, _| Ok(None));
        client.expect_create_service().times(0);

        let action = reconcile(
            Arc::new(kubexpose(None)),
            context(client, MockPodExecutor::new()),
        )
        .await
        .unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn test_creates_service_with_owner_and_requeues() {
        let mut client = MockKubexposeClient::new();
        client
            .expect_get_kubexpose()
            .returning(|_, _| Ok(Some(kubexpose(None))));
        client
            .expect_get_service()
            .withf(|ns, name| ns == "apps" && name == "web-svc-req1")
            .returning(|_, _| Ok(None));
        client
            .expect_get_deployment()
            .returning(|_, _| Ok(Some(source_deployment())));
        client
            .expect_create_service()
            .withf(|svc| {
                let owners = svc.metadata.owner_references.clone().unwrap_or_default();
                let selector = svc.spec.as_ref().and_then(|s| s.selector.clone());
                svc.metadata.name.as_deref() == Some("web-svc-req1")
                    && owners.len() == 1
                    && owners[0].uid == "uid-1"
                    && owners[0].controller == Some(true)
                    && selector.and_then(|s| s.get("app").cloned()).as_deref() == Some("web")
            })
            .times(1)
            .returning(|_| Ok(Created::New));
        client.expect_create_deployment().times(0);

        let action = reconcile(
            Arc::new(kubexpose(None)),
            context(client, MockPodExecutor::new()),
        )
        .await
        .unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn test_service_already_exists_is_success() {
        let mut client = MockKubexposeClient::new();
        client
            .expect_get_kubexpose()
            .returning(|_, _| Ok(Some(kubexpose(None))));
        client.expect_get_service().returning(|_, _| Ok(None));
        client
            .expect_get_deployment()
            .returning(|_, _| Ok(Some(source_deployment())));
        client
            .expect_create_service()
            .returning(|_| Ok(Created::AlreadyExisted));

        let action = reconcile(
            Arc::new(kubexpose(None)),
            context(client, MockPodExecutor::new()),
        )
        .await
        .unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn test_service_create_failure_is_error() {
        let mut client = MockKubexposeClient::new();
        client
            .expect_get_kubexpose()
            .returning(|_, _| Ok(Some(kubexpose(None))));
        client.expect_get_service().returning(|_, _| Ok(None));
        client
            .expect_get_deployment()
            .returning(|_, _| Ok(Some(source_deployment())));
        client
            .expect_create_service()
            .returning(|_| Err(OperatorError::KubeApi("forbidden".to_string())));

        let result = reconcile(
            Arc::new(kubexpose(None)),
            context(client, MockPodExecutor::new()),
        )
        .await;
        assert!(matches!(result, Err(OperatorError::KubeApi(_))));
    }

    #[tokio::test]
    async fn test_creates_tunnel_deployment_with_owner() {
        let mut client = MockKubexposeClient::new();
        client
            .expect_get_kubexpose()
            .returning(|_, _| Ok(Some(kubexpose(None))));
        client
            .expect_get_service()
            .returning(|_, _| Ok(Some(Service::default())));
        client
            .expect_get_deployment()
            .withf(|ns, name| ns == "apps" && name == "web-expose-req1")
            .returning(|_, _| Ok(None));
        client
            .expect_create_deployment()
            .withf(|dep| {
                let owners = dep.metadata.owner_references.clone().unwrap_or_default();
                dep.metadata.name.as_deref() == Some("web-expose-req1")
                    && dep.metadata.namespace.as_deref() == Some("apps")
                    && owners.len() == 1
                    && owners[0].kind == "Kubexpose"
            })
            .times(1)
            .returning(|_| Ok(Created::New));
        client.expect_list_pods().times(0);

        let action = reconcile(
            Arc::new(kubexpose(None)),
            context(client, MockPodExecutor::new()),
        )
        .await
        .unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn test_tunnel_deployment_already_exists_is_success() {
        let mut client = MockKubexposeClient::new();
        client
            .expect_get_kubexpose()
            .returning(|_, _| Ok(Some(kubexpose(None))));
        client
            .expect_get_service()
            .returning(|_, _| Ok(Some(Service::default())));
        client.expect_get_deployment().returning(|_, _| Ok(None));
        client
            .expect_create_deployment()
            .times(1)
            .returning(|_| Ok(Created::AlreadyExisted));
        client.expect_list_pods().times(0);

        let action = reconcile(
            Arc::new(kubexpose(None)),
            context(client, MockPodExecutor::new()),
        )
        .await
        .unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn test_tunnel_deployment_create_failure_is_error() {
        let mut client = MockKubexposeClient::new();
        client
            .expect_get_kubexpose()
            .returning(|_, _| Ok(Some(kubexpose(None))));
        client
            .expect_get_service()
            .returning(|_, _| Ok(Some(Service::default())));
        client.expect_get_deployment().returning(|_, _| Ok(None));
        client
            .expect_create_deployment()
            .returning(|_| Err(OperatorError::KubeApi("quota exceeded".to_string())));
        client.expect_list_pods().times(0);

        let result = reconcile(
            Arc::new(kubexpose(None)),
            context(client, MockPodExecutor::new()),
        )
        .await;
        assert!(matches!(result, Err(OperatorError::KubeApi(_))));
    }

    #[tokio::test]
    async fn test_kubexpose_get_failure_is_error() {
        let mut client = MockKubexposeClient::new();
        client
            .expect_get_kubexpose()
            .returning(|_, _| Err(OperatorError::KubeApi("connection refused".to_string())));
        client.expect_get_service().times(0);

        let result = reconcile(
            Arc::new(kubexpose(None)),
            context(client, MockPodExecutor::new()),
        )
        .await;
        assert!(matches!(result, Err(OperatorError::KubeApi(_))));
    }

    #[tokio::test]
    async fn test_service_get_failure_is_error() {
        let mut client = MockKubexposeClient::new();
        client
            .expect_get_kubexpose()
            .returning(|_, _| Ok(Some(kubexpose(None))));
        client
            .expect_get_service()
            .returning(|_, _| Err(OperatorError::KubeApi("forbidden".to_string())));
        client.expect_get_deployment().times(0);
        client.expect_create_service().times(0);

        let result = reconcile(
            Arc::new(kubexpose(None)),
            context(client, MockPodExecutor::new()),
        )
        .await;
        assert!(matches!(result, Err(OperatorError::KubeApi(_))));
    }

    #[tokio::test]
    async fn test_source_deployment_get_failure_is_error() {
        let mut client = MockKubexposeClient::new();
        client
            .expect_get_kubexpose()
            .returning(|_, _| Ok(Some(kubexpose(None))));
        client.expect_get_service().returning(|_, _| Ok(None));
        client
            .expect_get_deployment()
            .withf(|ns, name| ns == "apps" && name == "web")
            .returning(|_, _| Err(OperatorError::KubeApi("timeout".to_string())));
        client.expect_create_service().times(0);

        let result = reconcile(
            Arc::new(kubexpose(None)),
            context(client, MockPodExecutor::new()),
        )
        .await;
        assert!(matches!(result, Err(OperatorError::KubeApi(_))));
    }

    #[tokio::test]
    async fn test_tunnel_deployment_get_failure_is_error() {
        let mut client = MockKubexposeClient::new();
        client
            .expect_get_kubexpose()
            .returning(|_, _| Ok(Some(kubexpose(None))));
        client
            .expect_get_service()
            .returning(|_, _| Ok(Some(Service::default())));
        client
            .expect_get_deployment()
            .withf(|ns, name| ns == "apps" && name == "web-expose-req1")
            .returning(|_, _| Err(OperatorError::KubeApi("timeout".to_string())));
        client.expect_create_deployment().times(0);
        client.expect_list_pods().times(0);

        let result = reconcile(
            Arc::new(kubexpose(None)),
            context(client, MockPodExecutor::new()),
        )
        .await;
        assert!(matches!(result, Err(OperatorError::KubeApi(_))));
    }

    #[tokio::test]
    async fn test_same_namespace_target_converges() {
        let mut client = MockKubexposeClient::new();
        client.expect_get_kubexpose().returning(|_, _| {
            let mut kexp = kubexpose(Some(HTTPS_URL));
            kexp.spec.target_namespace = "default".to_string();
            Ok(Some(kexp))
        });
        client
            .expect_get_service()
            .withf(|ns, _| ns == "default")
            .returning(|_, _| Ok(Some(Service::default())));
        client
            .expect_get_deployment()
            .withf(|ns, _| ns == "default")
            .returning(|_, _| Ok(Some(Deployment::default())));
        client
            .expect_list_pods()
            .returning(|_, _| Ok(vec![tunnel_pod()]));
        client.expect_patch_status_url().times(0);
        let mut executor = MockPodExecutor::new();
        executor
            .expect_exec()
            .returning(|_, _, _, _| Ok(agent_output()));

        let action = reconcile(Arc::new(kubexpose(None)), context(client, executor))
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn test_first_discovery_writes_status() {
        let mut client = converged_client(None);
        client
            .expect_patch_status_url()
            .withf(|ns, name, url| ns == "default" && name == "req1" && url == HTTPS_URL)
            .times(1)
            .returning(|_, _, _| Ok(()));
        let mut executor = MockPodExecutor::new();
        executor
            .expect_exec()
            .returning(|_, _, _, _| Ok(agent_output()));

        let action = reconcile(Arc::new(kubexpose(None)), context(client, executor))
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn test_changed_url_overwrites_status() {
        let mut client = converged_client(Some("https://stale.ngrok.io"));
        client
            .expect_patch_status_url()
            .withf(|_, _, url| url == HTTPS_URL)
            .times(1)
            .returning(|_, _, _| Ok(()));
        let mut executor = MockPodExecutor::new();
        executor
            .expect_exec()
            .returning(|_, _, _, _| Ok(agent_output()));

        reconcile(Arc::new(kubexpose(None)), context(client, executor))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unchanged_url_skips_status_write() {
        let mut client = converged_client(Some(HTTPS_URL));
        client.expect_patch_status_url().times(0);
        client.expect_create_service().times(0);
        client.expect_create_deployment().times(0);
        let mut executor = MockPodExecutor::new();
        executor
            .expect_exec()
            .returning(|_, _, _, _| Ok(agent_output()));

        let action = reconcile(Arc::new(kubexpose(None)), context(client, executor))
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn test_status_write_failure_is_error() {
        let mut client = converged_client(None);
        client
            .expect_patch_status_url()
            .returning(|_, _, _| Err(OperatorError::KubeApi("conflict".to_string())));
        let mut executor = MockPodExecutor::new();
        executor
            .expect_exec()
            .returning(|_, _, _, _| Ok(agent_output()));

        let result = reconcile(Arc::new(kubexpose(None)), context(client, executor)).await;
        assert!(result.is_err());
    }

    async fn not_ready_action(client: MockKubexposeClient, executor: MockPodExecutor) -> Action {
        reconcile(Arc::new(kubexpose(None)), context(client, executor))
            .await
            .expect("not-ready must not surface as an error")
    }

    #[tokio::test]
    async fn test_not_ready_conditions_share_one_outcome() {
        let retry = Action::requeue(Duration::from_secs(5));

        // exec into a container that has not started
        let mut client = converged_client(None);
        client.expect_patch_status_url().times(0);
        let mut executor = MockPodExecutor::new();
        executor.expect_exec().returning(|_, _, _, _| {
            Err(OperatorError::Exec(
                "container not found (\"ngrok\")".to_string(),
            ))
        });
        assert_eq!(not_ready_action(client, executor).await, retry);

        // no tunnel pod scheduled yet
        let mut client = MockKubexposeClient::new();
        client
            .expect_get_kubexpose()
            .returning(|_, _| Ok(Some(kubexpose(None))));
        client
            .expect_get_service()
            .returning(|_, _| Ok(Some(Service::default())));
        client
            .expect_get_deployment()
            .returning(|_, _| Ok(Some(Deployment::default())));
        client.expect_list_pods().returning(|_, _| Ok(vec![]));
        client.expect_patch_status_url().times(0);
        assert_eq!(not_ready_action(client, MockPodExecutor::new()).await, retry);

        // agent up but no tunnels yet
        let mut client = converged_client(None);
        client.expect_patch_status_url().times(0);
        let mut executor = MockPodExecutor::new();
        executor.expect_exec().returning(|_, _, _, _| {
            Ok(ExecOutput {
                stdout: br#"{"tunnels":[]}"#.to_vec(),
                stderr: String::new(),
            })
        });
        assert_eq!(not_ready_action(client, executor).await, retry);
    }

    #[tokio::test]
    async fn test_malformed_agent_output_does_not_clear_status() {
        let mut client = converged_client(Some(HTTPS_URL));
        client.expect_patch_status_url().times(0);
        let mut executor = MockPodExecutor::new();
        executor.expect_exec().returning(|_, _, _, _| {
            Ok(ExecOutput {
                stdout: b"curl: (7) Failed to connect".to_vec(),
                stderr: String::new(),
            })
        });

        let action = not_ready_action(client, executor).await;
        assert_eq!(action, Action::requeue(Duration::from_secs(5)));
    }

    /// In-memory cluster used to drive several passes in a row
    #[derive(Default)]
    struct FakeCluster {
        services: Mutex<Vec<Service>>,
        deployments: Mutex<Vec<Deployment>>,
        status_url: Mutex<Option<String>>,
        mutations: Mutex<usize>,
    }

    #[async_trait::async_trait]
    impl KubexposeClient for FakeCluster {
        async fn get_kubexpose(&self, _namespace: &str, _name: &str) -> Result<Option<Kubexpose>> {
            let url = self.status_url.lock().unwrap().clone();
            Ok(Some(kubexpose(url.as_deref())))
        }

        async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
            if namespace == "apps" && name == "web" {
                return Ok(Some(source_deployment()));
            }
            Ok(self
                .deployments
                .lock()
                .unwrap()
                .iter()
                .find(|d| d.metadata.name.as_deref() == Some(name))
                .cloned())
        }

        async fn get_service(&self, _namespace: &str, name: &str) -> Result<Option<Service>> {
            Ok(self
                .services
                .lock()
                .unwrap()
                .iter()
                .find(|s| s.metadata.name.as_deref() == Some(name))
                .cloned())
        }

        async fn create_service(&self, service: &Service) -> Result<Created> {
            *self.mutations.lock().unwrap() += 1;
            self.services.lock().unwrap().push(service.clone());
            Ok(Created::New)
        }

        async fn create_deployment(&self, deployment: &Deployment) -> Result<Created> {
            *self.mutations.lock().unwrap() += 1;
            self.deployments.lock().unwrap().push(deployment.clone());
            Ok(Created::New)
        }

        async fn list_pods(&self, _namespace: &str, _selector: &str) -> Result<Vec<Pod>> {
            if self.deployments.lock().unwrap().is_empty() {
                return Ok(vec![]);
            }
            Ok(vec![tunnel_pod()])
        }

        async fn patch_status_url(&self, _namespace: &str, _name: &str, url: &str) -> Result<()> {
            *self.mutations.lock().unwrap() += 1;
            *self.status_url.lock().unwrap() = Some(url.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_converges_and_stays_idle() {
        let cluster = Arc::new(FakeCluster::default());
        let mut executor = MockPodExecutor::new();
        executor
            .expect_exec()
            .returning(|_, _, _, _| Ok(agent_output()));
        let ctx = Arc::new(Context::with_clients(
            cluster.clone(),
            Arc::new(executor),
            OperatorConfig::default(),
        ));

        let mut passes = 0;
        loop {
            let action = reconcile(Arc::new(kubexpose(None)), ctx.clone())
                .await
                .unwrap();
            passes += 1;
            if action == Action::await_change() {
                break;
            }
            assert!(passes < 10, "reconcile did not converge");
        }

        // service, deployment, status
        assert_eq!(passes, 3);
        assert_eq!(cluster.services.lock().unwrap().len(), 1);
        assert_eq!(cluster.deployments.lock().unwrap().len(), 1);
        assert_eq!(
            cluster.services.lock().unwrap()[0].metadata.name.as_deref(),
            Some("web-svc-req1")
        );
        assert_eq!(
            cluster.deployments.lock().unwrap()[0].metadata.name.as_deref(),
            Some("web-expose-req1")
        );
        assert_eq!(cluster.status_url.lock().unwrap().as_deref(), Some(HTTPS_URL));

        // a second pass on unchanged state mutates nothing
        let mutations = *cluster.mutations.lock().unwrap();
        let action = reconcile(Arc::new(kubexpose(None)), ctx.clone())
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(*cluster.mutations.lock().unwrap(), mutations);
    }

    #[test]
    fn test_error_policy_uses_backoff() {
        let ctx = context(MockKubexposeClient::new(), MockPodExecutor::new());
        let action = error_policy(
            Arc::new(kubexpose(None)),
            &OperatorError::KubeApi("boom".to_string()),
            ctx,
        );
        assert_eq!(action, Action::requeue(Duration::from_secs(10)));
    }
}
