//! Helper methods only available for tests
use http::{Method, Request, Response, StatusCode};
use hyper::Body;
use kube::Client;
use serde_json::json;

use crate::resources::conditions;

type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;

/// A mocked API server answering a fixed sequence of requests
pub struct ApiServerVerifier(ApiServerHandle);

/// Scenarios we test for in ApiServerVerifier
pub enum Scenario {
    /// A managed resource secret and the managed resource itself are applied, in that order
    ManagedResourceApplied { namespace: String, name: String },
    /// The managed resource is deleted, its secret is already gone
    ManagedResourceDeleted { namespace: String, name: String },
    /// A single GET of the managed resource returns a healthy object
    ManagedResourceHealthy { namespace: String, name: String },
    /// `keepObjects` is patched on a managed resource that does not exist
    KeepObjectsOnMissing { namespace: String, name: String },
    /// Listing Etcds across all namespaces returns the given number of objects
    EtcdsListed(usize),
    /// A single GET of an Etcd returns one with a pending reconcile operation
    EtcdReconcilePending { namespace: String, name: String },
    /// A single GET of an Etcd returns a ready one
    EtcdReady { namespace: String, name: String },
    /// etcd-druid is destroyed while the Etcd CRD is not installed
    EtcdDruidDestroyedWithoutCrd { namespace: String },
    /// The managed resource is still found `polls` times, then it is gone
    ManagedResourceDeletedAfterPolls { namespace: String, name: String, polls: usize },
    /// The managed resource reports unhealthy resources on `polls` GETs
    ManagedResourceUnhealthy { namespace: String, name: String, polls: usize },
    /// Neither the identity config map nor the managed resource secret exist yet
    ClusterIdentityMissing { namespace: String },
    /// The deployed identity config map is found and written back unchanged
    ClusterIdentityKept { namespace: String, identity: String },
    /// The main etcd is deployed: network policy, Etcd, then one autoscaler while the other is removed
    EtcdDeployed { namespace: String, hvpa: bool },
    /// The main etcd is destroyed: deletion confirmed, Etcd deleted, then its companions
    EtcdDestroyed { namespace: String },
    /// An idle Etcd is scaled to the given number of replicas
    EtcdScaled { namespace: String, name: String, replicas: i32 },
    /// gardener-resource-manager is deployed with cluster wide RBAC, a VPA and a PDB
    ResourceManagerDeployed { namespace: String },
    /// gardener-resource-manager is destroyed, nothing of it exists anymore
    ResourceManagerDestroyed { namespace: String },
    /// A single GET of a deployment returns a rolled out one
    DeploymentAvailable { namespace: String, name: String },
    /// Managed resources (namespace, name) and their secrets are deleted in this order
    ManagedResourcesDeletedInOrder(Vec<(String, String)>),
}

/// How a mocked request is answered
enum Reply {
    /// The request body is sent back, as the API server does for an apply
    Echo,
    NotFound,
    Deleted,
    Object(serde_json::Value),
}

pub async fn timeout_after_1s(handle: tokio::task::JoinHandle<()>) {
    tokio::time::timeout(std::time::Duration::from_secs(1), handle)
        .await
        .expect("timeout on mock apiserver")
        .expect("scenario succeeded")
}

fn not_found(what: &str) -> Response<Body> {
    let status = json!({
        "kind": "Status",
        "apiVersion": "v1",
        "metadata": {},
        "status": "Failure",
        "message": format!("{what} not found"),
        "reason": "NotFound",
        "code": 404,
    });
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(Body::from(serde_json::to_vec(&status).unwrap()))
        .unwrap()
}

const IDENTITY_CONFIG_MAP_PATH: &str = "/api/v1/namespaces/kube-system/configmaps/cluster-identity";

fn managed_resource_path(namespace: &str, name: &str) -> String {
    format!("/apis/resources.gardener.cloud/v1alpha1/namespaces/{namespace}/managedresources/{name}")
}

fn managed_resource(namespace: &str, name: &str, healthy: bool) -> serde_json::Value {
    let (status, reason) = if healthy {
        ("True", "ResourcesHealthy")
    } else {
        ("False", "DeploymentUnhealthy")
    };
    json!({
        "apiVersion": "resources.gardener.cloud/v1alpha1",
        "kind": "ManagedResource",
        "metadata": { "name": name, "namespace": namespace, "generation": 1 },
        "spec": { "class": "seed", "secretRefs": [{ "name": format!("managedresource-{name}") }] },
        "status": {
            "observedGeneration": 1,
            "conditions": [
                { "type": conditions::RESOURCES_APPLIED, "status": "True", "reason": "ApplySucceeded", "message": "" },
                { "type": conditions::RESOURCES_HEALTHY, "status": status, "reason": reason, "message": "" },
            ],
        },
    })
}

fn etcd(namespace: &str, name: &str, annotations: serde_json::Value) -> serde_json::Value {
    json!({
        "apiVersion": "druid.gardener.cloud/v1alpha1",
        "kind": "Etcd",
        "metadata": {
            "name": name,
            "namespace": namespace,
            "generation": 2,
            "annotations": annotations,
        },
        "spec": { "selector": {}, "replicas": 1, "etcd": {}, "backup": {} },
        "status": { "observedGeneration": 2, "ready": true },
    })
}

fn deleted() -> Response<Body> {
    json_response(json!({
        "kind": "Status",
        "apiVersion": "v1",
        "metadata": {},
        "status": "Success",
    }))
}

fn json_response(value: serde_json::Value) -> Response<Body> {
    Response::builder()
        .body(Body::from(serde_json::to_vec(&value).unwrap()))
        .unwrap()
}

impl ApiServerVerifier {
    /// Create a kube client talking to a fresh mocked API server
    pub fn new() -> (Client, ApiServerVerifier) {
        let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let mock_client = Client::new(mock_service, "default");
        (mock_client, ApiServerVerifier(handle))
    }

    /// Tests only get to run specific scenarios that have matching handlers
    ///
    /// NB: If the test causes more calls than we are handling in the scenario,
    /// you then typically see a `KubeError(Service(Closed(())))` from the test.
    ///
    /// You should await the `JoinHandle` (with a timeout) from this function to ensure that the
    /// scenario runs to completion (i.e. all expected calls were responded to),
    /// using the timeout to catch missing api calls to Kubernetes.
    pub fn run(self, scenario: Scenario) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            // moving self => one scenario per test
            match scenario {
                Scenario::ManagedResourceApplied { namespace, name } => {
                    self.handle_secret_apply(&namespace, &name)
                        .await
                        .unwrap()
                        .handle_managed_resource_apply(&namespace, &name)
                        .await
                }
                Scenario::ManagedResourceDeleted { namespace, name } => {
                    self.handle_managed_resource_delete(&namespace, &name)
                        .await
                        .unwrap()
                        .handle_secret_delete_missing(&namespace, &name)
                        .await
                }
                Scenario::ManagedResourceHealthy { namespace, name } => {
                    self.handle_managed_resource_get_healthy(&namespace, &name).await
                }
                Scenario::KeepObjectsOnMissing { namespace, name } => {
                    self.handle_keep_objects_missing(&namespace, &name).await
                }
                Scenario::EtcdsListed(count) => self.handle_etcd_list(count).await,
                Scenario::EtcdReconcilePending { namespace, name } => {
                    self.handle_etcd_get(&namespace, &name, true).await
                }
                Scenario::EtcdReady { namespace, name } => {
                    self.handle_etcd_get(&namespace, &name, false).await
                }
                Scenario::EtcdDruidDestroyedWithoutCrd { namespace } => {
                    self.handle_etcd_list_missing()
                        .await
                        .unwrap()
                        .handle_etcd_crd_annotate_missing()
                        .await
                        .unwrap()
                        .handle_managed_resource_delete(&namespace, "etcd-druid")
                        .await
                        .unwrap()
                        .handle_secret_delete_missing(&namespace, "etcd-druid")
                        .await
                }
                Scenario::ManagedResourceDeletedAfterPolls { namespace, name, polls } => {
                    let path = managed_resource_path(&namespace, &name);
                    let mut this = self;
                    for _ in 0..polls {
                        this = this
                            .expect(Method::GET, &path, Reply::Object(managed_resource(&namespace, &name, true)))
                            .await
                            .unwrap();
                    }
                    this.expect(Method::GET, &path, Reply::NotFound).await
                }
                Scenario::ManagedResourceUnhealthy { namespace, name, polls } => {
                    let path = managed_resource_path(&namespace, &name);
                    let mut this = self;
                    for _ in 0..polls {
                        this = this
                            .expect(Method::GET, &path, Reply::Object(managed_resource(&namespace, &name, false)))
                            .await
                            .unwrap();
                    }
                    Ok(this)
                }
                Scenario::ClusterIdentityMissing { namespace } => {
                    self.expect(Method::GET, IDENTITY_CONFIG_MAP_PATH, Reply::NotFound)
                        .await
                        .unwrap()
                        .expect(
                            Method::GET,
                            &format!("/api/v1/namespaces/{namespace}/secrets/managedresource-cluster-identity"),
                            Reply::NotFound,
                        )
                        .await
                }
                Scenario::ClusterIdentityKept { namespace, identity } => {
                    let config_map = json!({
                        "apiVersion": "v1",
                        "kind": "ConfigMap",
                        "metadata": { "name": "cluster-identity", "namespace": "kube-system" },
                        "immutable": true,
                        "data": { "cluster-identity": identity, "origin": "seed" },
                    });
                    self.expect(Method::GET, IDENTITY_CONFIG_MAP_PATH, Reply::Object(config_map))
                        .await
                        .unwrap()
                        .handle_secret_apply_containing(&namespace, "cluster-identity", &identity)
                        .await
                        .unwrap()
                        .handle_managed_resource_apply(&namespace, "cluster-identity")
                        .await
                }
                Scenario::EtcdDeployed { namespace, hvpa } => {
                    let etcds = format!("/apis/druid.gardener.cloud/v1alpha1/namespaces/{namespace}/etcds");
                    let hvpas = format!("/apis/autoscaling.k8s.io/v1alpha1/namespaces/{namespace}/hvpas/etcd-main");
                    let vpas = format!(
                        "/apis/autoscaling.k8s.io/v1/namespaces/{namespace}/verticalpodautoscalers/etcd-main-vpa"
                    );
                    let (applied, removed) = if hvpa { (hvpas, vpas) } else { (vpas, hvpas) };

                    self.expect(
                        Method::PATCH,
                        &format!("/apis/networking.k8s.io/v1/namespaces/{namespace}/networkpolicies/allow-etcd"),
                        Reply::Echo,
                    )
                    .await
                    .unwrap()
                    .expect(Method::PATCH, &format!("{etcds}/etcd-main"), Reply::Echo)
                    .await
                    .unwrap()
                    .expect(Method::PATCH, &applied, Reply::Echo)
                    .await
                    .unwrap()
                    .expect(Method::DELETE, &removed, Reply::NotFound)
                    .await
                }
                Scenario::EtcdDestroyed { namespace } => {
                    let etcd = format!("/apis/druid.gardener.cloud/v1alpha1/namespaces/{namespace}/etcds/etcd-main");
                    self.handle_etcd_confirm_deletion(&namespace, "etcd-main")
                        .await
                        .unwrap()
                        .expect(Method::DELETE, &etcd, Reply::Deleted)
                        .await
                        .unwrap()
                        .expect(
                            Method::DELETE,
                            &format!("/apis/autoscaling.k8s.io/v1alpha1/namespaces/{namespace}/hvpas/etcd-main"),
                            Reply::NotFound,
                        )
                        .await
                        .unwrap()
                        .expect(
                            Method::DELETE,
                            &format!(
                                "/apis/autoscaling.k8s.io/v1/namespaces/{namespace}/verticalpodautoscalers/etcd-main-vpa"
                            ),
                            Reply::NotFound,
                        )
                        .await
                        .unwrap()
                        .expect(
                            Method::DELETE,
                            &format!("/apis/networking.k8s.io/v1/namespaces/{namespace}/networkpolicies/allow-etcd"),
                            Reply::NotFound,
                        )
                        .await
                }
                Scenario::EtcdScaled { namespace, name, replicas } => {
                    self.handle_etcd_get(&namespace, &name, false)
                        .await
                        .unwrap()
                        .handle_etcd_scale(&namespace, &name, replicas)
                        .await
                }
                Scenario::ResourceManagerDeployed { namespace } => {
                    let core = format!("/api/v1/namespaces/{namespace}");
                    let rbac = "/apis/rbac.authorization.k8s.io/v1";
                    // service account, service and RBAC are applied concurrently
                    self.expect_unordered(vec![
                        (Method::PATCH, format!("{core}/serviceaccounts/gardener-resource-manager")),
                        (Method::PATCH, format!("{core}/services/gardener-resource-manager")),
                        (Method::PATCH, format!("{rbac}/clusterroles/gardener.cloud:gardener-resource-manager")),
                        (
                            Method::PATCH,
                            format!("{rbac}/clusterrolebindings/gardener.cloud:gardener-resource-manager"),
                        ),
                    ])
                    .await
                    .unwrap()
                    .expect(
                        Method::PATCH,
                        &format!("/apis/apps/v1/namespaces/{namespace}/deployments/gardener-resource-manager"),
                        Reply::Echo,
                    )
                    .await
                    .unwrap()
                    .expect(
                        Method::PATCH,
                        &format!(
                            "/apis/autoscaling.k8s.io/v1/namespaces/{namespace}/verticalpodautoscalers/gardener-resource-manager-vpa"
                        ),
                        Reply::Echo,
                    )
                    .await
                    .unwrap()
                    .expect(
                        Method::PATCH,
                        &format!("/apis/policy/v1/namespaces/{namespace}/poddisruptionbudgets/gardener-resource-manager"),
                        Reply::Echo,
                    )
                    .await
                }
                Scenario::ResourceManagerDestroyed { namespace } => {
                    let rbac = "/apis/rbac.authorization.k8s.io/v1";
                    let paths = [
                        format!(
                            "/apis/autoscaling.k8s.io/v1/namespaces/{namespace}/verticalpodautoscalers/gardener-resource-manager-vpa"
                        ),
                        format!("/apis/policy/v1/namespaces/{namespace}/poddisruptionbudgets/gardener-resource-manager"),
                        format!("/apis/apps/v1/namespaces/{namespace}/deployments/gardener-resource-manager"),
                        format!("/api/v1/namespaces/{namespace}/services/gardener-resource-manager"),
                        format!("/api/v1/namespaces/{namespace}/serviceaccounts/gardener-resource-manager"),
                        format!("{rbac}/clusterrolebindings/gardener.cloud:gardener-resource-manager"),
                        format!("{rbac}/clusterroles/gardener.cloud:gardener-resource-manager"),
                    ];
                    let mut this = self;
                    for path in paths {
                        this = this.expect(Method::DELETE, &path, Reply::NotFound).await
                        .unwrap();
                    }
                    Ok(this)
                }
                Scenario::DeploymentAvailable { namespace, name } => {
                    let deployment = json!({
                        "apiVersion": "apps/v1",
                        "kind": "Deployment",
                        "metadata": { "name": name, "namespace": namespace, "generation": 3 },
                        "spec": {
                            "replicas": 2,
                            "selector": { "matchLabels": { "app": name } },
                            "template": {},
                        },
                        "status": {
                            "observedGeneration": 3,
                            "replicas": 2,
                            "updatedReplicas": 2,
                            "availableReplicas": 2,
                            "conditions": [
                                { "type": "Available", "status": "True" },
                                { "type": "Progressing", "status": "True" },
                            ],
                        },
                    });
                    self.expect(
                        Method::GET,
                        &format!("/apis/apps/v1/namespaces/{namespace}/deployments/{name}"),
                        Reply::Object(deployment),
                    )
                    .await
                }
                Scenario::ManagedResourcesDeletedInOrder(managed_resources) => {
                    let mut this = self;
                    for (namespace, name) in managed_resources {
                        this = this
                            .handle_managed_resource_delete(&namespace, &name)
                            .await
                            .unwrap()
                            .handle_secret_delete_missing(&namespace, &name)
                            .await
                            .unwrap();
                    }
                    Ok(this)
                }
            }
            .expect("scenario completed without errors");
        })
    }

    /// Expect a single request with the given method and path and answer it
    async fn expect(mut self, method: Method, path: &str, reply: Reply) -> anyhow::Result<Self> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), method);
        assert_eq!(request.uri().path(), path);

        let response = match reply {
            Reply::Echo => {
                let body = hyper::body::to_bytes(request.into_body()).await?;
                json_response(serde_json::from_slice(&body)?)
            }
            Reply::NotFound => not_found(path),
            Reply::Deleted => deleted(),
            Reply::Object(object) => json_response(object),
        };
        send.send_response(response);
        Ok(self)
    }

    /// Expect applies of the given paths in any order, as issued by concurrent calls
    async fn expect_unordered(mut self, mut expected: Vec<(Method, String)>) -> anyhow::Result<Self> {
        while !expected.is_empty() {
            let (request, send) = self.0.next_request().await.expect("service not called");
            let call = (request.method().clone(), request.uri().path().to_string());
            let position = expected
                .iter()
                .position(|e| *e == call)
                .unwrap_or_else(|| panic!("unexpected request {call:?}"));
            expected.remove(position);

            let body = hyper::body::to_bytes(request.into_body()).await?;
            send.send_response(json_response(serde_json::from_slice(&body)?));
        }
        Ok(self)
    }

    async fn handle_secret_apply_containing(mut self, namespace: &str, name: &str, needle: &str) -> anyhow::Result<Self> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), Method::PATCH);
        assert_eq!(
            request.uri().path(),
            format!("/api/v1/namespaces/{namespace}/secrets/managedresource-{name}")
        );

        let body = hyper::body::to_bytes(request.into_body()).await?;
        let secret: k8s_openapi::api::core::v1::Secret = serde_json::from_slice(&body)?;
        let manifests: Vec<String> = secret
            .data
            .clone()
            .unwrap_or_default()
            .into_values()
            .map(|manifest| String::from_utf8(manifest.0))
            .collect::<Result<_, _>>()?;
        assert!(
            manifests.iter().any(|manifest| manifest.contains(needle)),
            "no manifest contains {needle}"
        );

        send.send_response(json_response(serde_json::to_value(&secret)?));
        Ok(self)
    }

    async fn handle_etcd_confirm_deletion(mut self, namespace: &str, name: &str) -> anyhow::Result<Self> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), Method::PATCH);
        assert_eq!(
            request.uri().path(),
            format!("/apis/druid.gardener.cloud/v1alpha1/namespaces/{namespace}/etcds/{name}")
        );

        let body = hyper::body::to_bytes(request.into_body()).await?;
        let patch: serde_json::Value = serde_json::from_slice(&body)?;
        assert_eq!(
            patch["metadata"]["annotations"]["confirmation.gardener.cloud/deletion"],
            "true"
        );

        let annotations = json!({ "confirmation.gardener.cloud/deletion": "true" });
        send.send_response(json_response(etcd(namespace, name, annotations)));
        Ok(self)
    }

    async fn handle_etcd_scale(mut self, namespace: &str, name: &str, replicas: i32) -> anyhow::Result<Self> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), Method::PATCH);
        assert_eq!(
            request.uri().path(),
            format!("/apis/druid.gardener.cloud/v1alpha1/namespaces/{namespace}/etcds/{name}")
        );

        let body = hyper::body::to_bytes(request.into_body()).await?;
        let patch: serde_json::Value = serde_json::from_slice(&body)?;
        assert_eq!(patch["spec"]["replicas"], replicas);
        assert_eq!(patch["metadata"]["annotations"]["gardener.cloud/operation"], "reconcile");
        assert!(patch["metadata"]["annotations"]["gardener.cloud/timestamp"].is_string());

        let annotations = json!({ "gardener.cloud/operation": "reconcile" });
        send.send_response(json_response(etcd(namespace, name, annotations)));
        Ok(self)
    }

    async fn handle_secret_apply(mut self, namespace: &str, name: &str) -> anyhow::Result<Self> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), Method::PATCH);
        assert_eq!(
            request.uri().path(),
            format!("/api/v1/namespaces/{namespace}/secrets/managedresource-{name}")
        );
        assert!(request.uri().to_string().contains("fieldManager=gardener-deployers"));

        let body = hyper::body::to_bytes(request.into_body()).await?;
        let secret: serde_json::Value = serde_json::from_slice(&body)?;
        assert_eq!(secret["kind"], "Secret");
        assert_eq!(secret["type"], "Opaque");

        send.send_response(json_response(secret));
        Ok(self)
    }

    async fn handle_managed_resource_apply(mut self, namespace: &str, name: &str) -> anyhow::Result<Self> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), Method::PATCH);
        assert_eq!(
            request.uri().path(),
            format!("/apis/resources.gardener.cloud/v1alpha1/namespaces/{namespace}/managedresources/{name}")
        );

        let body = hyper::body::to_bytes(request.into_body()).await?;
        let mr: serde_json::Value = serde_json::from_slice(&body)?;
        assert_eq!(
            mr["spec"]["secretRefs"][0]["name"],
            format!("managedresource-{name}")
        );

        send.send_response(json_response(mr));
        Ok(self)
    }

    async fn handle_managed_resource_delete(mut self, namespace: &str, name: &str) -> anyhow::Result<Self> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), Method::DELETE);
        assert_eq!(
            request.uri().path(),
            format!("/apis/resources.gardener.cloud/v1alpha1/namespaces/{namespace}/managedresources/{name}")
        );

        send.send_response(json_response(json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Success",
        })));
        Ok(self)
    }

    async fn handle_secret_delete_missing(mut self, namespace: &str, name: &str) -> anyhow::Result<Self> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), Method::DELETE);
        assert_eq!(
            request.uri().path(),
            format!("/api/v1/namespaces/{namespace}/secrets/managedresource-{name}")
        );

        send.send_response(not_found("secret"));
        Ok(self)
    }

    async fn handle_managed_resource_get_healthy(mut self, namespace: &str, name: &str) -> anyhow::Result<Self> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), Method::GET);
        assert_eq!(
            request.uri().path(),
            format!("/apis/resources.gardener.cloud/v1alpha1/namespaces/{namespace}/managedresources/{name}")
        );

        send.send_response(json_response(json!({
            "apiVersion": "resources.gardener.cloud/v1alpha1",
            "kind": "ManagedResource",
            "metadata": { "name": name, "namespace": namespace, "generation": 1 },
            "spec": { "class": "seed", "secretRefs": [{ "name": format!("managedresource-{name}") }] },
            "status": {
                "observedGeneration": 1,
                "conditions": [
                    { "type": conditions::RESOURCES_APPLIED, "status": "True", "reason": "ApplySucceeded", "message": "" },
                    { "type": conditions::RESOURCES_HEALTHY, "status": "True", "reason": "ResourcesHealthy", "message": "" },
                    { "type": conditions::RESOURCES_PROGRESSING, "status": "False", "reason": "ResourcesRolledOut", "message": "" },
                ],
            },
        })));
        Ok(self)
    }

    async fn handle_keep_objects_missing(mut self, namespace: &str, name: &str) -> anyhow::Result<Self> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), Method::PATCH);
        assert_eq!(
            request.uri().path(),
            format!("/apis/resources.gardener.cloud/v1alpha1/namespaces/{namespace}/managedresources/{name}")
        );

        let body = hyper::body::to_bytes(request.into_body()).await?;
        let patch: serde_json::Value = serde_json::from_slice(&body)?;
        assert_eq!(patch, json!({ "spec": { "keepObjects": true } }));

        send.send_response(not_found("managedresource"));
        Ok(self)
    }

    async fn handle_etcd_list(mut self, count: usize) -> anyhow::Result<Self> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), Method::GET);
        assert_eq!(request.uri().path(), "/apis/druid.gardener.cloud/v1alpha1/etcds");

        let items: Vec<_> = (0..count)
            .map(|i| {
                json!({
                    "apiVersion": "druid.gardener.cloud/v1alpha1",
                    "kind": "Etcd",
                    "metadata": { "name": "etcd-main", "namespace": format!("shoot--foo--bar{i}") },
                    "spec": { "selector": {}, "replicas": 1, "etcd": {}, "backup": {} },
                })
            })
            .collect();
        send.send_response(json_response(json!({
            "apiVersion": "druid.gardener.cloud/v1alpha1",
            "kind": "EtcdList",
            "metadata": { "resourceVersion": "1" },
            "items": items,
        })));
        Ok(self)
    }

    async fn handle_etcd_list_missing(mut self) -> anyhow::Result<Self> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), Method::GET);
        assert_eq!(request.uri().path(), "/apis/druid.gardener.cloud/v1alpha1/etcds");

        send.send_response(not_found("etcds.druid.gardener.cloud"));
        Ok(self)
    }

    async fn handle_etcd_crd_annotate_missing(mut self) -> anyhow::Result<Self> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), Method::PATCH);
        assert_eq!(
            request.uri().path(),
            "/apis/apiextensions.k8s.io/v1/customresourcedefinitions/etcds.druid.gardener.cloud"
        );

        let body = hyper::body::to_bytes(request.into_body()).await?;
        let patch: serde_json::Value = serde_json::from_slice(&body)?;
        assert_eq!(
            patch["metadata"]["annotations"]["confirmation.gardener.cloud/deletion"],
            "true"
        );

        send.send_response(not_found("customresourcedefinitions.apiextensions.k8s.io"));
        Ok(self)
    }

    async fn handle_etcd_get(mut self, namespace: &str, name: &str, pending: bool) -> anyhow::Result<Self> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), Method::GET);
        assert_eq!(
            request.uri().path(),
            format!("/apis/druid.gardener.cloud/v1alpha1/namespaces/{namespace}/etcds/{name}")
        );

        let annotations = if pending {
            json!({ "gardener.cloud/operation": "reconcile" })
        } else {
            json!({})
        };
        send.send_response(json_response(etcd(namespace, name, annotations)));
        Ok(self)
    }
}
