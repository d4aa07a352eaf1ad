//! Collaborator traits the planner reads and writes through
//!
//! Every trait has a kube-backed `*Impl` and a mockall mock in tests. The
//! error contract is shared: a missing object is `Ok(None)`, anything else
//! propagates as a hard error.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::{Api, ListParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::{Deserialize, Serialize};

#[cfg(test)]
use mockall::automock;

use capr_common::crd::{Cluster, ETCDSnapshot, Machine, RKEBootstrap, RKEControlPlane};
use capr_common::{Error, CAPI_CLUSTER_NAME_LABEL, CLUSTER_NAME_LABEL};

use crate::plan::File;

/// Access to CAPI machines
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MachineStore: Send + Sync {
    /// List the machines labelled with the given CAPI cluster name
    async fn list(&self, namespace: &str, cluster_name: &str) -> Result<Vec<Machine>, Error>;

    /// Get a machine by name
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Machine>, Error>;

    /// Replace a machine's metadata and spec
    async fn update(&self, machine: &Machine) -> Result<Machine, Error>;

    /// Replace a machine's status (the Reconciled condition)
    async fn update_status(&self, machine: &Machine) -> Result<Machine, Error>;
}

/// Access to plan secrets and the cluster state secret
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PlanSecretStore: Send + Sync {
    /// Get a secret by name
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error>;

    /// Replace a secret, failing on a stale resource version
    async fn update(&self, secret: &Secret) -> Result<Secret, Error>;

    /// Create a secret
    async fn create(&self, secret: &Secret) -> Result<Secret, Error>;
}

/// Access to the CAPI cluster, the control plane and bootstrap configs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Get the CAPI cluster
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<Cluster>, Error>;

    /// Replace the CAPI cluster's metadata and spec
    async fn update_cluster(&self, cluster: &Cluster) -> Result<Cluster, Error>;

    /// Replace the CAPI cluster's status
    async fn update_cluster_status(&self, cluster: &Cluster) -> Result<Cluster, Error>;

    /// Replace the control plane's metadata and spec
    ///
    /// Only labels are ever changed; status is persisted by the caller of
    /// `process`.
    async fn update_control_plane(
        &self,
        control_plane: &RKEControlPlane,
    ) -> Result<RKEControlPlane, Error>;

    /// Get an RKEBootstrap
    async fn get_bootstrap(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<RKEBootstrap>, Error>;

    /// Replace an RKEBootstrap
    async fn update_bootstrap(&self, bootstrap: &RKEBootstrap) -> Result<RKEBootstrap, Error>;
}

/// Read access to user-provided secrets and configmaps
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretReader: Send + Sync {
    /// Get a secret by name
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error>;

    /// Get a configmap by name
    async fn get_config_map(&self, namespace: &str, name: &str)
        -> Result<Option<ConfigMap>, Error>;
}

/// Read access to etcd snapshot records
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// List the snapshots of a cluster
    async fn list(&self, namespace: &str, cluster_name: &str) -> Result<Vec<ETCDSnapshot>, Error>;

    /// Get a snapshot by name
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<ETCDSnapshot>, Error>;
}

/// Release metadata for one Kubernetes version
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseData {
    /// Config keys accepted by servers, keyed without the `--` prefix
    #[serde(default)]
    pub server_args: BTreeMap<String, serde_json::Value>,
    /// Config keys accepted by agents
    #[serde(default)]
    pub agent_args: BTreeMap<String, serde_json::Value>,
    /// Feature name to semver string
    #[serde(default)]
    pub feature_versions: BTreeMap<String, String>,
}

/// Images, manifests and release data resolved outside the planner
#[cfg_attr(test, automock)]
#[async_trait]
pub trait InfoProvider: Send + Sync {
    /// Release data for the control plane's version, `None` if unknown
    async fn release_data(&self, control_plane: &RKEControlPlane) -> Option<ReleaseData>;

    /// Image prefix of the system agent installer
    fn system_agent_image(&self) -> String;

    /// Manifests delivered to the init node before the cluster is up
    async fn bootstrap_manifests(&self, control_plane: &RKEControlPlane)
        -> Result<Vec<File>, Error>;

    /// Manifests delivered to every other control plane node
    async fn control_plane_manifests(
        &self,
        control_plane: &RKEControlPlane,
    ) -> Result<Vec<File>, Error>;

    /// Manifests that must be applied before control plane nodes report ready
    async fn pre_bootstrap_manifests(
        &self,
        control_plane: &RKEControlPlane,
    ) -> Result<Vec<File>, Error>;

    /// Extra `namespace:selector` pod selectors deleted after an etcd restore
    fn system_pod_label_selectors(&self, control_plane: &RKEControlPlane) -> Vec<String>;
}

/// Machine store backed by the Kubernetes API
pub struct MachineStoreImpl {
    client: Client,
}

impl MachineStoreImpl {
    /// Create a new MachineStoreImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MachineStore for MachineStoreImpl {
    async fn list(&self, namespace: &str, cluster_name: &str) -> Result<Vec<Machine>, Error> {
        let api: Api<Machine> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().labels(&format!("{CAPI_CLUSTER_NAME_LABEL}={cluster_name}"));
        Ok(api.list(&lp).await?.items)
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Machine>, Error> {
        let api: Api<Machine> = Api::namespaced(self.client.clone(), namespace);
        get_opt(&api, name).await
    }

    async fn update(&self, machine: &Machine) -> Result<Machine, Error> {
        let api: Api<Machine> = Api::namespaced(self.client.clone(), &namespace_of(machine));
        Ok(api
            .replace(&machine.name_any(), &PostParams::default(), machine)
            .await?)
    }

    async fn update_status(&self, machine: &Machine) -> Result<Machine, Error> {
        let api: Api<Machine> = Api::namespaced(self.client.clone(), &namespace_of(machine));
        let data = serde_json::to_vec(machine)?;
        Ok(api
            .replace_status(&machine.name_any(), &PostParams::default(), data)
            .await?)
    }
}

/// Secret store backed by the Kubernetes API
pub struct PlanSecretStoreImpl {
    client: Client,
}

impl PlanSecretStoreImpl {
    /// Create a new PlanSecretStoreImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PlanSecretStore for PlanSecretStoreImpl {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        get_opt(&api, name).await
    }

    async fn update(&self, secret: &Secret) -> Result<Secret, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &namespace_of(secret));
        Ok(api
            .replace(&secret.name_any(), &PostParams::default(), secret)
            .await?)
    }

    async fn create(&self, secret: &Secret) -> Result<Secret, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &namespace_of(secret));
        Ok(api.create(&PostParams::default(), secret).await?)
    }
}

/// Cluster store backed by the Kubernetes API
pub struct ClusterStoreImpl {
    client: Client,
}

impl ClusterStoreImpl {
    /// Create a new ClusterStoreImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterStore for ClusterStoreImpl {
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<Cluster>, Error> {
        let api: Api<Cluster> = Api::namespaced(self.client.clone(), namespace);
        get_opt(&api, name).await
    }

    async fn update_cluster(&self, cluster: &Cluster) -> Result<Cluster, Error> {
        let api: Api<Cluster> = Api::namespaced(self.client.clone(), &namespace_of(cluster));
        Ok(api
            .replace(&cluster.name_any(), &PostParams::default(), cluster)
            .await?)
    }

    async fn update_cluster_status(&self, cluster: &Cluster) -> Result<Cluster, Error> {
        let api: Api<Cluster> = Api::namespaced(self.client.clone(), &namespace_of(cluster));
        let data = serde_json::to_vec(cluster)?;
        Ok(api
            .replace_status(&cluster.name_any(), &PostParams::default(), data)
            .await?)
    }

    async fn update_control_plane(
        &self,
        control_plane: &RKEControlPlane,
    ) -> Result<RKEControlPlane, Error> {
        let api: Api<RKEControlPlane> =
            Api::namespaced(self.client.clone(), &namespace_of(control_plane));
        Ok(api
            .replace(&control_plane.name_any(), &PostParams::default(), control_plane)
            .await?)
    }

    async fn get_bootstrap(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<RKEBootstrap>, Error> {
        let api: Api<RKEBootstrap> = Api::namespaced(self.client.clone(), namespace);
        get_opt(&api, name).await
    }

    async fn update_bootstrap(&self, bootstrap: &RKEBootstrap) -> Result<RKEBootstrap, Error> {
        let api: Api<RKEBootstrap> =
            Api::namespaced(self.client.clone(), &namespace_of(bootstrap));
        Ok(api
            .replace(&bootstrap.name_any(), &PostParams::default(), bootstrap)
            .await?)
    }
}

/// Secret and configmap reader backed by the Kubernetes API
pub struct SecretReaderImpl {
    client: Client,
}

impl SecretReaderImpl {
    /// Create a new SecretReaderImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretReader for SecretReaderImpl {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        get_opt(&api, name).await
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        get_opt(&api, name).await
    }
}

/// Snapshot store backed by the Kubernetes API
pub struct SnapshotStoreImpl {
    client: Client,
}

impl SnapshotStoreImpl {
    /// Create a new SnapshotStoreImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SnapshotStore for SnapshotStoreImpl {
    async fn list(&self, namespace: &str, cluster_name: &str) -> Result<Vec<ETCDSnapshot>, Error> {
        let api: Api<ETCDSnapshot> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().labels(&format!("{CLUSTER_NAME_LABEL}={cluster_name}"));
        Ok(api.list(&lp).await?.items)
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Option<ETCDSnapshot>, Error> {
        let api: Api<ETCDSnapshot> = Api::namespaced(self.client.clone(), namespace);
        get_opt(&api, name).await
    }
}

async fn get_opt<K>(api: &Api<K>, name: &str) -> Result<Option<K>, Error>
where
    K: Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    match api.get(name).await {
        Ok(obj) => Ok(Some(obj)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn namespace_of<K: Resource>(obj: &K) -> String {
    obj.meta().namespace.clone().unwrap_or_default()
}
