//! Planner entry point
//!
//! [`Planner::process`] is called once per reconcile event for a control
//! plane. It gates on the owning CAPI cluster, loads the plan aggregate, runs
//! the long-running operation state machines and finally the tiered
//! reconcile. Every "come back later" outcome is an [`Error::Waiting`]; the
//! caller persists the mutated status and re-enqueues.
//!
//! # Architecture
//!
//! ```text
//! process
//!   ├── cluster gates (exists, deleting, infrastructure, sanity)
//!   ├── PlanStore::load
//!   ├── create_etcd_snapshot / restore_etcd_snapshot
//!   ├── rotate_certificates / rotate_encryption_keys
//!   └── full_reconcile (bootstrap → etcd → control plane → worker)
//! ```

mod certrotation;
mod encryption_keys;
mod etcd_create;
mod etcd_restore;
mod generate;
mod reconcile;

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use k8s_openapi::ByteString;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, info, warn};

use capr_common::crd::conditions::{BOOTSTRAPPED, CONTROL_PLANE_INITIALIZED, PROVISIONED, STABLE};
use capr_common::crd::{
    Cluster, ConditionStatus, Conditions, RKEControlPlane, RKEControlPlaneStatus,
};
use capr_common::naming::{cluster_state_secret_name, hex_encode};
use capr_common::retry::{retry_with_backoff, RetryConfig};
use capr_common::{
    Error, EXCLUDE_NODE_DRAINING_ANNOTATION, FORCE_REMOVE_ETCD_ANNOTATION, PAUSED_ANNOTATION,
    SECRET_TYPE_CLUSTER_STATE,
};

use crate::client::{
    ClusterStore, ClusterStoreImpl, InfoProvider, MachineStore, MachineStoreImpl,
    PlanSecretStore, PlanSecretStoreImpl, ReleaseData, SecretReader, SecretReaderImpl,
    SnapshotStore, SnapshotStoreImpl,
};
use crate::filters::{
    collect, has_join_url, has_joined_to, is_control_plane, is_deleting, is_etcd, is_worker,
};
use crate::plan::{ClusterTokens, Plan};
use crate::settings::PlannerConfig;
use crate::store::PlanStore;

const SERVER_TOKEN_KEY: &str = "serverToken";
const AGENT_TOKEN_KEY: &str = "agentToken";

const RESTORATION_REQUIRED_MESSAGE: &str = "rkecontrolplane was already initialized but no etcd machines exist that have plans, indicating the etcd plane has been entirely replaced. Restoration from etcd snapshot is required.";

/// Inputs that stay fixed for one `process` call
#[derive(Clone, Copy)]
pub(crate) struct Pass<'a> {
    /// Control plane being reconciled; its status is the one persisted
    /// before this call
    pub(crate) control_plane: &'a RKEControlPlane,
    /// Release allow-lists and feature versions
    pub(crate) release: &'a ReleaseData,
    /// Join tokens from the cluster state secret
    pub(crate) tokens: &'a ClusterTokens,
}

/// Reconciles RKEControlPlanes into per-machine plans
///
/// One planner serves every cluster. Calls for the same control plane are
/// serialized on a lock keyed by its UID; different clusters run
/// concurrently.
pub struct Planner {
    pub(crate) store: PlanStore,
    pub(crate) machines: Arc<dyn MachineStore>,
    pub(crate) clusters: Arc<dyn ClusterStore>,
    pub(crate) secrets: Arc<dyn SecretReader>,
    pub(crate) snapshots: Arc<dyn SnapshotStore>,
    pub(crate) info: Arc<dyn InfoProvider>,
    pub(crate) config: PlannerConfig,
    plan_secrets: Arc<dyn PlanSecretStore>,
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl Planner {
    /// Create a builder for constructing a Planner
    pub fn builder(client: Client, info: Arc<dyn InfoProvider>) -> PlannerBuilder {
        PlannerBuilder::new(client, info)
    }

    /// Create a planner backed by the Kubernetes API
    ///
    /// This is a convenience method equivalent to
    /// `Planner::builder(client, info).build()`.
    pub fn new(client: Client, info: Arc<dyn InfoProvider>) -> Self {
        Self::builder(client, info).build()
    }

    /// Create a planner from explicit stores
    ///
    /// Primarily for unit tests where a real Kubernetes client is not
    /// available.
    #[cfg(test)]
    pub(crate) fn for_testing(
        machines: Arc<dyn MachineStore>,
        plan_secrets: Arc<dyn PlanSecretStore>,
        clusters: Arc<dyn ClusterStore>,
        secrets: Arc<dyn SecretReader>,
        snapshots: Arc<dyn SnapshotStore>,
        info: Arc<dyn InfoProvider>,
        config: PlannerConfig,
    ) -> Self {
        Self::assemble(machines, plan_secrets, clusters, secrets, snapshots, info, config)
    }

    fn assemble(
        machines: Arc<dyn MachineStore>,
        plan_secrets: Arc<dyn PlanSecretStore>,
        clusters: Arc<dyn ClusterStore>,
        secrets: Arc<dyn SecretReader>,
        snapshots: Arc<dyn SnapshotStore>,
        info: Arc<dyn InfoProvider>,
        config: PlannerConfig,
    ) -> Self {
        let store = PlanStore::new(
            plan_secrets.clone(),
            machines.clone(),
            config.plan_secret_poll.clone(),
        );
        Self {
            store,
            machines,
            clusters,
            secrets,
            snapshots,
            info,
            config,
            plan_secrets,
            locks: DashMap::new(),
        }
    }

    /// Reconcile one control plane
    ///
    /// `status` starts as the control plane's persisted status and carries
    /// every change this pass makes, including on error; the caller persists
    /// it either way.
    pub async fn process(
        &self,
        control_plane: &RKEControlPlane,
        status: &mut RKEControlPlaneStatus,
    ) -> Result<(), Error> {
        let uid = control_plane.uid().unwrap_or_default();
        let lock = self.locks.entry(uid).or_default().value().clone();
        let _guard = lock.lock().await;

        let namespace = control_plane.namespace().unwrap_or_default();
        let name = control_plane.name_any();
        debug!(cluster = %name, %namespace, "processing control plane");

        let version = &control_plane.spec.kubernetes_version;
        let current_version = parse_kubernetes_version(version).map_err(|e| {
            Error::validation_for(
                &name,
                format!("error semver parsing kubernetes version {version}: {e}"),
            )
        })?;

        let Some(release) = self.info.release_data(control_plane).await else {
            return Err(Error::waiting(format!(
                "{namespace}/{name}: release data is empty for {version}"
            )));
        };

        let Some(cluster) = self.owner_cluster(control_plane).await? else {
            return Err(Error::waiting("CAPI cluster does not exist"));
        };

        if cluster.is_deleting() {
            if is_paused(&cluster, control_plane) {
                if let Err(e) = self.pause_capi_cluster(control_plane, false).await {
                    warn!(cluster = %name, error = %e, "failed to unpause deleting CAPI cluster");
                }
            }
            info!(cluster = %name, "CAPI cluster is deleting, stopping reconciliation");
            return Ok(());
        }

        if !cluster.infrastructure_ready() {
            return Err(Error::waiting("waiting for infrastructure ready"));
        }

        let (mut plan, any_plan_delivered) = self.store.load(&cluster, control_plane).await?;

        if let Some(missing) = missing_roles(&plan) {
            return self.uninitialize(control_plane, status, &plan, &missing).await;
        }
        status.set_condition(PROVISIONED, ConditionStatus::True, "", "");

        let tokens = self
            .ensure_rke_state_secret(control_plane, !any_plan_delivered)
            .await?;
        let pass = Pass {
            control_plane,
            release: &release,
            tokens: &tokens,
        };

        self.create_etcd_snapshot(pass, status, &mut plan).await?;
        self.restore_etcd_snapshot(pass, status, &mut plan, &current_version)
            .await?;
        self.rotate_certificates(pass, status, &mut plan).await?;
        self.rotate_encryption_keys(pass, status, &mut plan).await?;

        if is_paused(&cluster, control_plane) {
            return Err(Error::waiting("CAPI cluster or RKEControlPlane is paused"));
        }

        if restoration_required(status, &plan) {
            status.set_condition(STABLE, ConditionStatus::False, "", "");
            return Err(Error::waiting(RESTORATION_REQUIRED_MESSAGE));
        }

        self.full_reconcile(pass, status, &mut plan, false).await
    }

    /// CAPI cluster owning the control plane
    ///
    /// The owner reference wins; the spec's cluster name is the fallback for
    /// objects created before CAPI adopted them.
    pub(crate) async fn owner_cluster(
        &self,
        control_plane: &RKEControlPlane,
    ) -> Result<Option<Cluster>, Error> {
        let namespace = control_plane.namespace().unwrap_or_default();
        let owner = control_plane
            .owner_references()
            .iter()
            .find(|r| r.kind == "Cluster" && r.api_version.starts_with("cluster.x-k8s.io/"))
            .map(|r| r.name.clone())
            .unwrap_or_else(|| control_plane.spec.cluster_name.clone());
        if owner.is_empty() {
            return Ok(None);
        }
        self.clusters.get_cluster(&namespace, &owner).await
    }

    async fn uninitialize(
        &self,
        control_plane: &RKEControlPlane,
        status: &mut RKEControlPlaneStatus,
        plan: &Plan,
        missing: &[&str],
    ) -> Result<(), Error> {
        status.set_condition(STABLE, ConditionStatus::False, "", "");
        if status.initialized || status.ready {
            status.initialized = false;
            status.ready = false;
            return Err(Error::waiting(format!(
                "uninitializing rkecontrolplane {}/{}",
                control_plane.namespace().unwrap_or_default(),
                control_plane.name_any()
            )));
        }
        if let Err(e) = self
            .ensure_capi_cluster_control_plane_initialized_false(control_plane)
            .await
        {
            return Err(Error::waiting(format!("uninitializing CAPI cluster: {e}")));
        }
        if self
            .force_delete_all_deleting_etcd_machines(control_plane, plan)
            .await?
            > 0
        {
            return Err(Error::waiting("waiting for all etcd machines to be deleted"));
        }
        Err(Error::waiting(format!(
            "waiting for at least one control plane, etcd, and worker node to be registered (missing {})",
            missing.join(", ")
        )))
    }

    /// Load or create the cluster state secret holding the join tokens
    ///
    /// Tokens are only ever generated for a new cluster; an existing cluster
    /// that lost its secret cannot be joined again with fresh tokens.
    pub(crate) async fn ensure_rke_state_secret(
        &self,
        control_plane: &RKEControlPlane,
        new_cluster: bool,
    ) -> Result<ClusterTokens, Error> {
        if control_plane.spec.unmanaged_config {
            return Ok(ClusterTokens::default());
        }

        let namespace = control_plane.namespace().unwrap_or_default();
        let name = cluster_state_secret_name(&control_plane.name_any());

        let Some(secret) = self.plan_secrets.get(&namespace, &name).await? else {
            if !new_cluster {
                return Err(Error::internal_with_context(
                    "planner",
                    format!("newCluster was false and secret {namespace}/{name} does not exist"),
                ));
            }
            let tokens = ClusterTokens {
                server_token: random_token()?,
                agent_token: random_token()?,
            };
            let secret = cluster_state_secret(control_plane, &namespace, &name, &tokens);
            self.plan_secrets.create(&secret).await?;
            info!(cluster = %control_plane.name_any(), secret = %name, "created cluster state secret");
            return Ok(tokens);
        };

        let type_ = secret.type_.as_deref().unwrap_or("");
        if type_ != SECRET_TYPE_CLUSTER_STATE {
            return Err(Error::internal_with_context(
                "planner",
                format!(
                    "secret {namespace}/{name} type {type_} did not match expected type {SECRET_TYPE_CLUSTER_STATE}"
                ),
            ));
        }

        let read = |key: &str| {
            secret
                .data
                .as_ref()
                .and_then(|d| d.get(key))
                .map(|v| String::from_utf8_lossy(&v.0).into_owned())
                .unwrap_or_default()
        };
        Ok(ClusterTokens {
            server_token: read(SERVER_TOKEN_KEY),
            agent_token: read(AGENT_TOKEN_KEY),
        })
    }

    /// Pause or unpause the owning CAPI cluster
    ///
    /// Pausing stops CAPI from replacing machines while an operation has
    /// services down.
    pub(crate) async fn pause_capi_cluster(
        &self,
        control_plane: &RKEControlPlane,
        pause: bool,
    ) -> Result<(), Error> {
        retry_with_backoff(&RetryConfig::default(), "pause CAPI cluster", || async {
            let Some(mut cluster) = self.owner_cluster(control_plane).await? else {
                return Err(Error::operation_failed(
                    "pause CAPI cluster",
                    format!(
                        "CAPI cluster does not exist for {}/{}",
                        control_plane.namespace().unwrap_or_default(),
                        control_plane.name_any()
                    ),
                ));
            };
            if cluster.spec.paused == pause {
                return Ok(());
            }
            cluster.spec.paused = pause;
            self.clusters.update_cluster(&cluster).await?;
            info!(cluster = %control_plane.name_any(), pause, "updated CAPI cluster pause");
            Ok(())
        })
        .await
    }

    async fn ensure_capi_cluster_control_plane_initialized_false(
        &self,
        control_plane: &RKEControlPlane,
    ) -> Result<(), Error> {
        let Some(mut cluster) = self.owner_cluster(control_plane).await? else {
            return Err(Error::internal_with_context(
                "planner",
                format!(
                    "CAPI cluster does not exist for {}/{}",
                    control_plane.namespace().unwrap_or_default(),
                    control_plane.name_any()
                ),
            ));
        };
        let status = cluster.status.get_or_insert_with(Default::default);
        if status.conditions.is_false(CONTROL_PLANE_INITIALIZED) {
            return Ok(());
        }
        status.set_condition(
            CONTROL_PLANE_INITIALIZED,
            ConditionStatus::False,
            "WaitingForControlPlaneProviderInitialized",
            "Waiting for control plane provider to indicate the control plane has been initialized",
        );
        self.clusters.update_cluster_status(&cluster).await?;
        Ok(())
    }

    /// Force-remove every deleting etcd machine
    ///
    /// With quorum lost, the safe etcd member removal these machines wait on
    /// can never finish. Returns how many deleting etcd machines exist.
    pub(crate) async fn force_delete_all_deleting_etcd_machines(
        &self,
        control_plane: &RKEControlPlane,
        plan: &Plan,
    ) -> Result<usize, Error> {
        let cluster = control_plane.name_any();
        let deleting: Vec<_> = collect(plan, is_etcd)
            .into_iter()
            .filter(is_deleting)
            .collect();

        for entry in &deleting {
            let Some(config_ref) = entry.machine.spec.bootstrap.config_ref.as_ref() else {
                warn!(%cluster, machine = %entry.name(), "deleting etcd machine has no bootstrap ref");
                continue;
            };
            let api_version = config_ref.api_version.as_deref().unwrap_or("");
            if !api_version.contains("rke.cattle.io") {
                warn!(
                    %cluster,
                    machine = %entry.name(),
                    %api_version,
                    "deleting etcd machine has an unexpected bootstrap API version"
                );
                continue;
            }
            info!(%cluster, machine = %entry.name(), "force deleting etcd machine");

            let mut machine = entry.machine.clone();
            machine
                .annotations_mut()
                .insert(EXCLUDE_NODE_DRAINING_ANNOTATION.to_string(), "true".to_string());
            self.machines.update(&machine).await?;

            let namespace = config_ref
                .namespace
                .clone()
                .or_else(|| machine.namespace())
                .unwrap_or_default();
            let Some(mut bootstrap) = self
                .clusters
                .get_bootstrap(&namespace, entry.machine.bootstrap_name())
                .await?
            else {
                continue;
            };
            bootstrap
                .annotations_mut()
                .insert(FORCE_REMOVE_ETCD_ANNOTATION.to_string(), "true".to_string());
            self.clusters.update_bootstrap(&bootstrap).await?;
        }
        Ok(deleting.len())
    }
}

/// Builder for [`Planner`]
///
/// Every store defaults to its Kubernetes-backed implementation.
pub struct PlannerBuilder {
    client: Client,
    info: Arc<dyn InfoProvider>,
    machines: Option<Arc<dyn MachineStore>>,
    plan_secrets: Option<Arc<dyn PlanSecretStore>>,
    clusters: Option<Arc<dyn ClusterStore>>,
    secrets: Option<Arc<dyn SecretReader>>,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    config: Option<PlannerConfig>,
}

impl PlannerBuilder {
    fn new(client: Client, info: Arc<dyn InfoProvider>) -> Self {
        Self {
            client,
            info,
            machines: None,
            plan_secrets: None,
            clusters: None,
            secrets: None,
            snapshots: None,
            config: None,
        }
    }

    /// Override the machine store (primarily for testing)
    pub fn machine_store(mut self, machines: Arc<dyn MachineStore>) -> Self {
        self.machines = Some(machines);
        self
    }

    /// Override the plan secret store (primarily for testing)
    pub fn plan_secret_store(mut self, plan_secrets: Arc<dyn PlanSecretStore>) -> Self {
        self.plan_secrets = Some(plan_secrets);
        self
    }

    /// Override the CAPI cluster store (primarily for testing)
    pub fn cluster_store(mut self, clusters: Arc<dyn ClusterStore>) -> Self {
        self.clusters = Some(clusters);
        self
    }

    /// Override the secret and configmap reader (primarily for testing)
    pub fn secret_reader(mut self, secrets: Arc<dyn SecretReader>) -> Self {
        self.secrets = Some(secrets);
        self
    }

    /// Override the snapshot store (primarily for testing)
    pub fn snapshot_store(mut self, snapshots: Arc<dyn SnapshotStore>) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    /// Set the planner configuration; defaults to [`PlannerConfig::default`]
    pub fn config(mut self, config: PlannerConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Build the planner
    pub fn build(self) -> Planner {
        let client = self.client;
        Planner::assemble(
            self.machines
                .unwrap_or_else(|| Arc::new(MachineStoreImpl::new(client.clone()))),
            self.plan_secrets
                .unwrap_or_else(|| Arc::new(PlanSecretStoreImpl::new(client.clone()))),
            self.clusters
                .unwrap_or_else(|| Arc::new(ClusterStoreImpl::new(client.clone()))),
            self.secrets
                .unwrap_or_else(|| Arc::new(SecretReaderImpl::new(client.clone()))),
            self.snapshots
                .unwrap_or_else(|| Arc::new(SnapshotStoreImpl::new(client.clone()))),
            self.info,
            self.config.unwrap_or_default(),
        )
    }
}

/// Parse a Kubernetes version such as `v1.29.4+rke2r1`
pub(crate) fn parse_kubernetes_version(version: &str) -> Result<semver::Version, semver::Error> {
    semver::Version::parse(version.trim_start_matches('v'))
}

fn is_paused(cluster: &Cluster, control_plane: &RKEControlPlane) -> bool {
    cluster.spec.paused || control_plane.annotations().contains_key(PAUSED_ANNOTATION)
}

/// Roles without a single non-deleting machine, `None` when all are covered
fn missing_roles(plan: &Plan) -> Option<Vec<&'static str>> {
    let roles: [(&'static str, fn(&crate::plan::PlanEntry) -> bool); 3] = [
        ("etcd", is_etcd),
        ("control plane", is_control_plane),
        ("worker", is_worker),
    ];
    let missing: Vec<&'static str> = roles
        .into_iter()
        .filter(|(_, role)| collect(plan, *role).iter().all(is_deleting))
        .map(|(name, _)| name)
        .collect();
    (!missing.is_empty()).then_some(missing)
}

/// The cluster was bootstrapped once, but no etcd machine has plan data
///
/// Happens when every etcd machine was replaced; only a snapshot restore
/// can bring the datastore back.
fn restoration_required(status: &RKEControlPlaneStatus, plan: &Plan) -> bool {
    let was_bootstrapped = status.conditions.is_true(BOOTSTRAPPED)
        || !collect(plan, has_join_url).is_empty()
        || !collect(plan, has_joined_to).is_empty();
    let etcd_has_plan = collect(plan, is_etcd)
        .iter()
        .any(|e| e.plan.as_ref().is_some_and(|n| n.plan_data_exists));
    was_bootstrapped && !etcd_has_plan
}

fn random_token() -> Result<String, Error> {
    let mut raw = vec![0u8; 32];
    aws_lc_rs::rand::fill(&mut raw)
        .map_err(|_| Error::internal_with_context("planner", "failed to generate token"))?;
    Ok(hex_encode(&raw))
}

fn cluster_state_secret(
    control_plane: &RKEControlPlane,
    namespace: &str,
    name: &str,
    tokens: &ClusterTokens,
) -> Secret {
    let mut secret = Secret {
        type_: Some(SECRET_TYPE_CLUSTER_STATE.to_string()),
        data: Some(BTreeMap::from([
            (
                SERVER_TOKEN_KEY.to_string(),
                ByteString(tokens.server_token.clone().into_bytes()),
            ),
            (
                AGENT_TOKEN_KEY.to_string(),
                ByteString(tokens.agent_token.clone().into_bytes()),
            ),
        ])),
        ..Default::default()
    };
    secret.metadata.name = Some(name.to_string());
    secret.metadata.namespace = Some(namespace.to_string());
    secret.metadata.owner_references = Some(vec![OwnerReference {
        api_version: RKEControlPlane::api_version(&()).to_string(),
        kind: RKEControlPlane::kind(&()).to_string(),
        name: control_plane.name_any(),
        uid: control_plane.uid().unwrap_or_default(),
        ..Default::default()
    }]);
    secret
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    use capr_common::crd::{ClusterSpec, ClusterStatus};

    use super::*;
    use crate::client::{
        MockClusterStore, MockInfoProvider, MockMachineStore, MockPlanSecretStore,
        MockSecretReader, MockSnapshotStore,
    };
    use crate::filters::tests::entry;

    fn control_plane() -> RKEControlPlane {
        let mut cp = RKEControlPlane::new("prod", Default::default());
        cp.metadata.namespace = Some("fleet".to_string());
        cp.metadata.uid = Some("cp-uid".to_string());
        cp.spec.cluster_name = "prod".to_string();
        cp.spec.kubernetes_version = "v1.29.4+rke2r1".to_string();
        cp
    }

    fn cluster(paused: bool, infrastructure_ready: bool) -> Cluster {
        let mut cluster = Cluster::new(
            "prod",
            ClusterSpec {
                paused,
                ..Default::default()
            },
        );
        cluster.metadata.namespace = Some("fleet".to_string());
        cluster.status = Some(ClusterStatus {
            infrastructure_ready,
            ..Default::default()
        });
        cluster
    }

    fn info() -> MockInfoProvider {
        let mut info = MockInfoProvider::new();
        info.expect_release_data()
            .returning(|_| Some(ReleaseData::default()));
        info
    }

    fn planner(
        machines: MockMachineStore,
        plan_secrets: MockPlanSecretStore,
        clusters: MockClusterStore,
        info: MockInfoProvider,
    ) -> Planner {
        Planner::for_testing(
            Arc::new(machines),
            Arc::new(plan_secrets),
            Arc::new(clusters),
            Arc::new(MockSecretReader::new()),
            Arc::new(MockSnapshotStore::new()),
            Arc::new(info),
            PlannerConfig::default(),
        )
    }

    fn plan_of(entries: Vec<crate::plan::PlanEntry>) -> Plan {
        let mut plan = Plan::default();
        for e in entries {
            plan.machines.insert(e.name().to_string(), e.machine.clone());
            plan.absorb(&e);
        }
        plan
    }

    #[test]
    fn test_parse_kubernetes_version() {
        let v = parse_kubernetes_version("v1.29.4+rke2r1").expect("version");
        assert_eq!((v.major, v.minor, v.patch), (1, 29, 4));
        assert!(parse_kubernetes_version("latest").is_err());
    }

    #[test]
    fn test_missing_roles_ignores_deleting_machines() {
        let mut deleting_worker = entry("w", &["worker"]);
        deleting_worker.machine.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        let plan = plan_of(vec![entry("e", &["etcd", "cp"]), deleting_worker]);
        assert_eq!(missing_roles(&plan), Some(vec!["worker"]));

        let plan = plan_of(vec![entry("a", &["etcd", "cp", "worker"])]);
        assert_eq!(missing_roles(&plan), None);
    }

    #[test]
    fn test_restoration_required_after_etcd_plane_replaced() {
        let mut status = RKEControlPlaneStatus::default();
        let plan = plan_of(vec![entry("e", &["etcd"])]);
        assert!(!restoration_required(&status, &plan));

        status.set_true(BOOTSTRAPPED);
        assert!(restoration_required(&status, &plan));
    }

    #[tokio::test]
    async fn test_missing_release_data_waits() {
        let mut info = MockInfoProvider::new();
        info.expect_release_data().returning(|_| None);
        let planner = planner(
            MockMachineStore::new(),
            MockPlanSecretStore::new(),
            MockClusterStore::new(),
            info,
        );
        let err = planner
            .process(&control_plane(), &mut RKEControlPlaneStatus::default())
            .await
            .expect_err("no release data");
        assert!(err.is_waiting());
        assert!(err.to_string().contains("release data is empty"));
    }

    #[tokio::test]
    async fn test_invalid_version_is_a_validation_error() {
        let mut cp = control_plane();
        cp.spec.kubernetes_version = "not-a-version".to_string();
        let planner = planner(
            MockMachineStore::new(),
            MockPlanSecretStore::new(),
            MockClusterStore::new(),
            info(),
        );
        let err = planner
            .process(&cp, &mut RKEControlPlaneStatus::default())
            .await
            .expect_err("bad version");
        assert!(!err.is_waiting());
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_infrastructure_not_ready_waits() {
        let mut clusters = MockClusterStore::new();
        clusters
            .expect_get_cluster()
            .returning(|_, _| Ok(Some(cluster(false, false))));
        let planner = planner(
            MockMachineStore::new(),
            MockPlanSecretStore::new(),
            clusters,
            info(),
        );
        let err = planner
            .process(&control_plane(), &mut RKEControlPlaneStatus::default())
            .await
            .expect_err("infrastructure");
        assert_eq!(err.to_string(), "waiting for infrastructure ready");
    }

    /// Story: the CAPI cluster is being deleted while paused; the planner
    /// unpauses it so CAPI can finish and reports success without touching
    /// any machine.
    #[tokio::test]
    async fn story_deleting_cluster_is_unpaused() {
        let mut deleting = cluster(true, true);
        deleting.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        let updates = Arc::new(Mutex::new(Vec::new()));

        let mut clusters = MockClusterStore::new();
        let current = deleting.clone();
        clusters
            .expect_get_cluster()
            .returning(move |_, _| Ok(Some(current.clone())));
        let seen = updates.clone();
        clusters.expect_update_cluster().returning(move |c| {
            seen.lock().expect("lock").push(c.spec.paused);
            Ok(c.clone())
        });

        let planner = planner(
            MockMachineStore::new(),
            MockPlanSecretStore::new(),
            clusters,
            info(),
        );
        planner
            .process(&control_plane(), &mut RKEControlPlaneStatus::default())
            .await
            .expect("deleting cluster is not an error");
        assert_eq!(*updates.lock().expect("lock"), vec![false]);
    }

    #[tokio::test]
    async fn test_state_secret_created_for_new_cluster() {
        let created = Arc::new(Mutex::new(None));
        let mut secrets = MockPlanSecretStore::new();
        secrets.expect_get().returning(|_, _| Ok(None));
        let seen = created.clone();
        secrets.expect_create().returning(move |s| {
            *seen.lock().expect("lock") = Some(s.clone());
            Ok(s.clone())
        });
        let planner = planner(
            MockMachineStore::new(),
            secrets,
            MockClusterStore::new(),
            info(),
        );

        let tokens = planner
            .ensure_rke_state_secret(&control_plane(), true)
            .await
            .expect("created");
        assert_eq!(tokens.server_token.len(), 64);
        assert_ne!(tokens.server_token, tokens.agent_token);

        let secret = created.lock().expect("lock").clone().expect("secret");
        assert_eq!(secret.metadata.name.as_deref(), Some("prod-rke-state"));
        assert_eq!(secret.type_.as_deref(), Some(SECRET_TYPE_CLUSTER_STATE));
        let owner = &secret.metadata.owner_references.expect("owner")[0];
        assert_eq!(owner.kind, "RKEControlPlane");
        assert_eq!(owner.uid, "cp-uid");
    }

    #[tokio::test]
    async fn test_state_secret_missing_on_existing_cluster_is_an_error() {
        let mut secrets = MockPlanSecretStore::new();
        secrets.expect_get().returning(|_, _| Ok(None));
        let planner = planner(
            MockMachineStore::new(),
            secrets,
            MockClusterStore::new(),
            info(),
        );
        let err = planner
            .ensure_rke_state_secret(&control_plane(), false)
            .await
            .expect_err("missing secret");
        assert!(err.to_string().contains("newCluster was false"));
    }

    #[tokio::test]
    async fn test_state_secret_type_is_checked() {
        let mut secrets = MockPlanSecretStore::new();
        secrets.expect_get().returning(|_, _| {
            Ok(Some(Secret {
                type_: Some("Opaque".to_string()),
                ..Default::default()
            }))
        });
        let planner = planner(
            MockMachineStore::new(),
            secrets,
            MockClusterStore::new(),
            info(),
        );
        let err = planner
            .ensure_rke_state_secret(&control_plane(), true)
            .await
            .expect_err("wrong type");
        assert!(err.to_string().contains("did not match expected type"));
    }

    #[tokio::test]
    async fn test_unmanaged_config_skips_state_secret() {
        let mut cp = control_plane();
        cp.spec.unmanaged_config = true;
        let planner = planner(
            MockMachineStore::new(),
            MockPlanSecretStore::new(),
            MockClusterStore::new(),
            info(),
        );
        let tokens = planner
            .ensure_rke_state_secret(&cp, false)
            .await
            .expect("unmanaged");
        assert_eq!(tokens, ClusterTokens::default());
    }

    /// Story: a fresh cluster with one machine per role provisions from
    /// scratch. The etcd node bootstraps first and publishes its join URL
    /// through the membership scrape, the control plane joins it, and only
    /// then do workers get a plan. No plan is ever rewritten and nothing is
    /// drained along the way.
    #[tokio::test]
    async fn story_three_machine_cluster_provisions() {
        use crate::testing::FakeCluster;
        use capr_common::DRAIN_ANNOTATION;

        let fake = FakeCluster::new();
        fake.add_machine("etcd-0", &["etcd"]);
        fake.add_machine("cp-0", &["cp"]);
        fake.add_machine("worker-0", &["worker"]);
        let planner = fake.planner();

        let mut cp = fake.control_plane();
        let mut status = RKEControlPlaneStatus {
            agent_connected: true,
            ..Default::default()
        };

        let mut outcome = Err(Error::waiting("not started"));
        for _ in 0..40 {
            cp.status = Some(status.clone());
            outcome = planner.process(&cp, &mut status).await;
            match &outcome {
                Ok(()) => break,
                Err(e) => assert!(e.is_waiting(), "unexpected error: {e}"),
            }
            fake.run_agents();
        }

        outcome.expect("cluster settles");
        assert!(status.initialized);
        assert!(status.ready);
        assert!(status.conditions.is_true(BOOTSTRAPPED));
        assert!(status.conditions.is_true(PROVISIONED));

        let writes = fake.plan_writes();
        assert_eq!(writes.len(), 3);
        assert!(writes.values().all(|n| *n == 1), "plans rewritten: {writes:?}");
        assert!(fake
            .plan_secrets()
            .iter()
            .all(|s| !s.annotations().contains_key(DRAIN_ANNOTATION)));
    }

    /// Story: a restore restarts workers one at a time
    ///
    /// Restarting the cluster after a restore ignores the configured
    /// concurrency, which falls back to one machine per tier rather than
    /// lifting the limit.
    #[tokio::test]
    async fn story_restore_restart_brings_workers_back_one_at_a_time() {
        use capr_common::naming::plan_secret_name;

        use crate::testing::FakeCluster;

        let fake = FakeCluster::new();
        fake.add_machine("etcd-0", &["etcd"]);
        fake.add_machine("cp-0", &["cp"]);
        fake.add_machine("worker-0", &["worker"]);
        fake.add_machine("worker-1", &["worker"]);
        let planner = fake.planner();

        let mut cp = fake.control_plane();
        cp.spec.upgrade_strategy.control_plane_concurrency = "0".to_string();
        cp.spec.upgrade_strategy.worker_concurrency = "0".to_string();
        let mut status = RKEControlPlaneStatus {
            agent_connected: true,
            ..Default::default()
        };
        for _ in 0..40 {
            cp.status = Some(status.clone());
            if planner.process(&cp, &mut status).await.is_ok() {
                break;
            }
            fake.run_agents();
        }
        assert!(status.initialized && status.ready);

        // a new provision generation changes every restart stamp
        cp.spec.provision_generation += 1;
        cp.status = Some(status.clone());
        let cluster = planner
            .owner_cluster(&cp)
            .await
            .expect("cluster lookup")
            .expect("cluster exists");
        let (mut plan, _) = planner.store.load(&cluster, &cp).await.expect("plan loads");
        let release = planner.info.release_data(&cp).await.expect("release data");
        let tokens = planner
            .ensure_rke_state_secret(&cp, false)
            .await
            .expect("tokens");
        let pass = Pass {
            control_plane: &cp,
            release: &release,
            tokens: &tokens,
        };
        let _ = planner.full_reconcile(pass, &mut status, &mut plan, true).await;

        let writes = fake.plan_writes();
        let restarted_workers = ["worker-0", "worker-1"]
            .iter()
            .filter(|w| writes.get(&plan_secret_name(&format!("{w}-bootstrap"))) == Some(&2))
            .count();
        assert_eq!(restarted_workers, 1, "plan writes: {writes:?}");
    }

    /// Story: losing every etcd machine uninitializes the cluster
    ///
    /// While the deleting etcd machines are force-removed, the status keeps
    /// one fixed message no matter which machine is still going away.
    #[tokio::test]
    async fn story_deleting_etcd_plane_waits_for_all_deletions() {
        use crate::testing::FakeCluster;

        let fake = FakeCluster::new();
        fake.add_machine("etcd-1", &["etcd"]);
        fake.add_machine("etcd-0", &["etcd"]);
        fake.add_machine("cp-0", &["cp"]);
        fake.add_machine("worker-0", &["worker"]);
        fake.mark_deleting("etcd-0");
        fake.mark_deleting("etcd-1");
        let planner = fake.planner();

        let cp = fake.control_plane();
        let mut status = RKEControlPlaneStatus::default();
        let err = planner
            .process(&cp, &mut status)
            .await
            .expect_err("etcd plane is gone");
        assert!(err.is_waiting());
        assert_eq!(err.to_string(), "waiting for all etcd machines to be deleted");
        assert!(!status.initialized);
    }
}
