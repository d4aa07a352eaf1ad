//! In-memory cluster for planner stories
//!
//! [`FakeCluster`] implements every collaborator trait over one shared
//! state and plays the part of the system agent: [`FakeCluster::run_agents`]
//! applies whatever plan is on each secret and reports back the way a
//! healthy node would.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use k8s_openapi::api::core::v1::{ConfigMap, NodeSystemInfo, ObjectReference, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::ByteString;
use kube::ResourceExt;

use capr_common::crd::conditions::INFRASTRUCTURE_READY;
use capr_common::crd::{
    Cluster, ClusterSpec, ClusterStatus, Condition, ConditionStatus, ETCDSnapshot, Machine,
    MachineAddress, MachineAddressType, MachineStatus, RKEBootstrap, RKEControlPlane,
};
use capr_common::naming::plan_secret_name;
use capr_common::{Error, CAPI_CLUSTER_NAME_LABEL, SECRET_TYPE_MACHINE_PLAN};

use crate::client::{
    ClusterStore, InfoProvider, MachineStore, PlanSecretStore, ReleaseData, SecretReader,
    SnapshotStore,
};
use crate::instructions::{CAPTURE_ADDRESS_INSTRUCTION_NAME, ETCD_NAME_INSTRUCTION_NAME};
use crate::plan::{File, NodePlan, PeriodicInstructionOutput, ProbeStatus};
use crate::planner::Planner;
use crate::settings::PlannerConfig;
use crate::store::tests::{bootstrapped_machine, no_poll};

pub(crate) const NAMESPACE: &str = "fleet";
pub(crate) const CLUSTER: &str = "prod";
pub(crate) const VERSION: &str = "v1.29.4+rke2r1";

#[derive(Default)]
struct State {
    cluster: Option<Cluster>,
    machines: BTreeMap<String, Machine>,
    secrets: BTreeMap<String, Secret>,
    /// Writes that changed a secret's `plan` bytes
    plan_writes: BTreeMap<String, usize>,
    next_address: u8,
}

/// Shared in-memory API server plus simulated agents
#[derive(Clone, Default)]
pub(crate) struct FakeCluster {
    state: Arc<Mutex<State>>,
}

impl FakeCluster {
    /// Empty cluster with a ready CAPI cluster object
    pub(crate) fn new() -> Self {
        let fake = Self::default();
        let mut cluster = Cluster::new(
            CLUSTER,
            ClusterSpec {
                control_plane_ref: Some(ObjectReference {
                    kind: Some("RKEControlPlane".to_string()),
                    name: Some(CLUSTER.to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
        cluster.metadata.namespace = Some(NAMESPACE.to_string());
        cluster.status = Some(ClusterStatus {
            infrastructure_ready: true,
            ..Default::default()
        });
        fake.lock().cluster = Some(cluster);
        fake
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("fake cluster state poisoned")
    }

    /// Register a provisioned machine and its empty plan secret
    pub(crate) fn add_machine(&self, name: &str, roles: &[&str]) {
        let mut m = bootstrapped_machine(name, roles);
        m.labels_mut()
            .insert(CAPI_CLUSTER_NAME_LABEL.to_string(), CLUSTER.to_string());
        m.spec.cluster_name = CLUSTER.to_string();
        m.status = Some(MachineStatus {
            conditions: vec![Condition::new(
                INFRASTRUCTURE_READY,
                ConditionStatus::True,
                "",
                "",
            )],
            ..Default::default()
        });

        let mut secret = Secret {
            type_: Some(SECRET_TYPE_MACHINE_PLAN.to_string()),
            ..Default::default()
        };
        secret.metadata.name = Some(plan_secret_name(m.bootstrap_name()));
        secret.metadata.namespace = Some(NAMESPACE.to_string());

        let mut state = self.lock();
        state.secrets.insert(secret.name_any(), secret);
        state.machines.insert(name.to_string(), m);
    }

    /// Set a deletion timestamp on a registered machine
    pub(crate) fn mark_deleting(&self, name: &str) {
        if let Some(m) = self.lock().machines.get_mut(name) {
            m.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        }
    }

    /// Planner wired to this fake for every store
    pub(crate) fn planner(&self) -> Planner {
        let config = PlannerConfig {
            plan_secret_poll: no_poll(),
            ..Default::default()
        };
        Planner::for_testing(
            Arc::new(self.clone()),
            Arc::new(self.clone()),
            Arc::new(self.clone()),
            Arc::new(self.clone()),
            Arc::new(self.clone()),
            Arc::new(self.clone()),
            config,
        )
    }

    /// Control plane object matching the fake cluster
    pub(crate) fn control_plane(&self) -> RKEControlPlane {
        let mut cp = RKEControlPlane::new(CLUSTER, Default::default());
        cp.metadata.namespace = Some(NAMESPACE.to_string());
        cp.metadata.uid = Some("cp-uid".to_string());
        cp.spec.cluster_name = CLUSTER.to_string();
        cp.spec.kubernetes_version = VERSION.to_string();
        cp
    }

    /// Number of distinct plans written per machine's plan secret
    pub(crate) fn plan_writes(&self) -> BTreeMap<String, usize> {
        self.lock().plan_writes.clone()
    }

    pub(crate) fn plan_secrets(&self) -> Vec<Secret> {
        self.lock()
            .secrets
            .values()
            .filter(|s| s.type_.as_deref() == Some(SECRET_TYPE_MACHINE_PLAN))
            .cloned()
            .collect()
    }

    /// Apply every delivered plan as a healthy agent would
    ///
    /// The machine registers its node on first apply. Etcd members report
    /// their address through the periodic instructions the planner asks for.
    pub(crate) fn run_agents(&self) {
        let mut state = self.lock();
        let names: Vec<String> = state.machines.keys().cloned().collect();
        for name in names {
            let Some(secret_name) = state
                .machines
                .get(&name)
                .map(|m| plan_secret_name(m.bootstrap_name()))
            else {
                continue;
            };
            let Some(raw) = state
                .secrets
                .get(&secret_name)
                .and_then(|s| s.data.as_ref())
                .and_then(|d| d.get("plan"))
                .map(|b| b.0.clone())
            else {
                continue;
            };
            let plan: NodePlan = serde_json::from_slice(&raw).expect("plan json");

            let registered = state
                .machines
                .get(&name)
                .and_then(|m| m.status.as_ref())
                .and_then(|s| s.addresses.first())
                .map(|a| a.address.clone());
            let address = match registered {
                Some(address) => address,
                None => {
                    state.next_address += 1;
                    format!("10.0.0.{}", state.next_address)
                }
            };
            let periodic = periodic_output(&plan, &name, &address);
            let probes: BTreeMap<String, ProbeStatus> = plan
                .probes
                .keys()
                .map(|k| {
                    let status = ProbeStatus {
                        healthy: true,
                        success_count: 1,
                        ..Default::default()
                    };
                    (k.clone(), status)
                })
                .collect();

            if let Some(secret) = state.secrets.get_mut(&secret_name) {
                let data = secret.data.get_or_insert_with(BTreeMap::new);
                data.insert("appliedPlan".to_string(), ByteString(raw));
                data.insert(
                    "probe-statuses".to_string(),
                    ByteString(serde_json::to_vec(&probes).expect("probes json")),
                );
                if let Some(periodic) = periodic {
                    data.insert("applied-periodic-output".to_string(), ByteString(periodic));
                }
            }

            if let Some(m) = state.machines.get_mut(&name) {
                let status = m.status.get_or_insert_with(Default::default);
                if status.node_ref.is_none() {
                    status.node_ref = Some(ObjectReference {
                        name: Some(format!("node-{name}")),
                        ..Default::default()
                    });
                    status.addresses = vec![MachineAddress {
                        type_: MachineAddressType::InternalIP,
                        address,
                    }];
                    status.node_info = Some(NodeSystemInfo {
                        kubelet_version: VERSION.to_string(),
                        ..Default::default()
                    });
                }
            }
        }
    }
}

/// Gzipped periodic output answering the etcd membership scrape
fn periodic_output(plan: &NodePlan, machine: &str, address: &str) -> Option<Vec<u8>> {
    let wanted = |name: &str| plan.periodic_instructions.iter().any(|p| p.common.name == name);
    if !wanted(CAPTURE_ADDRESS_INSTRUCTION_NAME) || !wanted(ETCD_NAME_INSTRUCTION_NAME) {
        return None;
    }
    let member = format!("{machine}-member");
    let members = serde_json::json!({
        "members": [{ "name": member, "clientURLs": [format!("https://{address}:2379")] }]
    });
    let output = |name: &str, stdout: String| PeriodicInstructionOutput {
        name: name.to_string(),
        stdout: stdout.into_bytes(),
        exit_code: 0,
        last_successful_run_time: "2026-01-01T00:00:00Z".to_string(),
        ..Default::default()
    };
    let outputs = BTreeMap::from([
        (
            CAPTURE_ADDRESS_INSTRUCTION_NAME.to_string(),
            output(CAPTURE_ADDRESS_INSTRUCTION_NAME, format!("{members}\n")),
        ),
        (
            ETCD_NAME_INSTRUCTION_NAME.to_string(),
            output(ETCD_NAME_INSTRUCTION_NAME, member.clone()),
        ),
    ]);
    let mut gz = GzEncoder::new(Vec::new(), Compression::default());
    gz.write_all(&serde_json::to_vec(&outputs).expect("periodic json"))
        .expect("gzip");
    Some(gz.finish().expect("gzip"))
}

fn not_found(kind: &str, name: &str) -> Error {
    Error::internal_with_context("fake", format!("{kind} {name} not found"))
}

#[async_trait]
impl MachineStore for FakeCluster {
    async fn list(&self, _namespace: &str, cluster_name: &str) -> Result<Vec<Machine>, Error> {
        Ok(self
            .lock()
            .machines
            .values()
            .filter(|m| m.spec.cluster_name == cluster_name)
            .cloned()
            .collect())
    }

    async fn get(&self, _namespace: &str, name: &str) -> Result<Option<Machine>, Error> {
        Ok(self.lock().machines.get(name).cloned())
    }

    async fn update(&self, machine: &Machine) -> Result<Machine, Error> {
        let mut state = self.lock();
        let name = machine.name_any();
        let stored = state
            .machines
            .get_mut(&name)
            .ok_or_else(|| not_found("machine", &name))?;
        stored.metadata = machine.metadata.clone();
        stored.spec = machine.spec.clone();
        Ok(stored.clone())
    }

    async fn update_status(&self, machine: &Machine) -> Result<Machine, Error> {
        let mut state = self.lock();
        let name = machine.name_any();
        let stored = state
            .machines
            .get_mut(&name)
            .ok_or_else(|| not_found("machine", &name))?;
        // the agent owns node registration; only conditions come from the planner
        let conditions = machine
            .status
            .as_ref()
            .map(|s| s.conditions.clone())
            .unwrap_or_default();
        stored.status.get_or_insert_with(Default::default).conditions = conditions;
        Ok(stored.clone())
    }
}

#[async_trait]
impl PlanSecretStore for FakeCluster {
    async fn get(&self, _namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        Ok(self.lock().secrets.get(name).cloned())
    }

    async fn update(&self, secret: &Secret) -> Result<Secret, Error> {
        let mut state = self.lock();
        let name = secret.name_any();
        let previous = state
            .secrets
            .get(&name)
            .ok_or_else(|| not_found("secret", &name))?;
        let plan_of = |s: &Secret| s.data.as_ref().and_then(|d| d.get("plan")).cloned();
        if plan_of(previous) != plan_of(secret) {
            *state.plan_writes.entry(name.clone()).or_default() += 1;
        }
        state.secrets.insert(name, secret.clone());
        Ok(secret.clone())
    }

    async fn create(&self, secret: &Secret) -> Result<Secret, Error> {
        let mut state = self.lock();
        let name = secret.name_any();
        if state.secrets.contains_key(&name) {
            return Err(Error::internal_with_context(
                "fake",
                format!("secret {name} already exists"),
            ));
        }
        state.secrets.insert(name, secret.clone());
        Ok(secret.clone())
    }
}

#[async_trait]
impl ClusterStore for FakeCluster {
    async fn get_cluster(&self, _namespace: &str, name: &str) -> Result<Option<Cluster>, Error> {
        Ok(self.lock().cluster.clone().filter(|c| c.name_any() == name))
    }

    async fn update_cluster(&self, cluster: &Cluster) -> Result<Cluster, Error> {
        self.lock().cluster = Some(cluster.clone());
        Ok(cluster.clone())
    }

    async fn update_cluster_status(&self, cluster: &Cluster) -> Result<Cluster, Error> {
        let mut state = self.lock();
        let stored = state
            .cluster
            .as_mut()
            .ok_or_else(|| not_found("cluster", &cluster.name_any()))?;
        stored.status = cluster.status.clone();
        Ok(stored.clone())
    }

    async fn update_control_plane(
        &self,
        control_plane: &RKEControlPlane,
    ) -> Result<RKEControlPlane, Error> {
        Ok(control_plane.clone())
    }

    async fn get_bootstrap(
        &self,
        _namespace: &str,
        _name: &str,
    ) -> Result<Option<RKEBootstrap>, Error> {
        Ok(None)
    }

    async fn update_bootstrap(&self, bootstrap: &RKEBootstrap) -> Result<RKEBootstrap, Error> {
        Ok(bootstrap.clone())
    }
}

#[async_trait]
impl SecretReader for FakeCluster {
    async fn get_secret(&self, _namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        Ok(self.lock().secrets.get(name).cloned())
    }

    async fn get_config_map(
        &self,
        _namespace: &str,
        _name: &str,
    ) -> Result<Option<ConfigMap>, Error> {
        Ok(None)
    }
}

#[async_trait]
impl SnapshotStore for FakeCluster {
    async fn list(&self, _namespace: &str, _cluster_name: &str) -> Result<Vec<ETCDSnapshot>, Error> {
        Ok(Vec::new())
    }

    async fn get(&self, _namespace: &str, _name: &str) -> Result<Option<ETCDSnapshot>, Error> {
        Ok(None)
    }
}

#[async_trait]
impl InfoProvider for FakeCluster {
    async fn release_data(&self, _control_plane: &RKEControlPlane) -> Option<ReleaseData> {
        let args = |keys: &[&str]| {
            keys.iter()
                .map(|k| (k.to_string(), serde_json::json!({})))
                .collect()
        };
        Some(ReleaseData {
            server_args: args(&["cluster-init", "token", "server", "etcd-expose-metrics"]),
            agent_args: args(&["token", "server", "node-label", "node-taint", "private-registry"]),
            feature_versions: BTreeMap::new(),
        })
    }

    fn system_agent_image(&self) -> String {
        "rancher/system-agent-installer-".to_string()
    }

    async fn bootstrap_manifests(
        &self,
        _control_plane: &RKEControlPlane,
    ) -> Result<Vec<File>, Error> {
        Ok(vec![File::new(
            "/var/lib/rancher/rke2/server/manifests/rancher/cluster-agent.yaml",
            "kind: Deployment",
        )])
    }

    async fn control_plane_manifests(
        &self,
        _control_plane: &RKEControlPlane,
    ) -> Result<Vec<File>, Error> {
        Ok(Vec::new())
    }

    async fn pre_bootstrap_manifests(
        &self,
        _control_plane: &RKEControlPlane,
    ) -> Result<Vec<File>, Error> {
        Ok(Vec::new())
    }

    fn system_pod_label_selectors(&self, _control_plane: &RKEControlPlane) -> Vec<String> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_machines_are_listed_per_cluster() {
        let fake = FakeCluster::new();
        fake.add_machine("a", &["etcd"]);
        assert_eq!(MachineStore::list(&fake, NAMESPACE, CLUSTER).await.expect("list").len(), 1);
        assert!(MachineStore::list(&fake, NAMESPACE, "other").await.expect("list").is_empty());
        assert_eq!(fake.plan_secrets().len(), 1);
    }

    #[test]
    fn test_agent_ignores_machines_without_plan() {
        let fake = FakeCluster::new();
        fake.add_machine("a", &["etcd"]);
        fake.run_agents();
        let state = fake.lock();
        assert!(state.machines["a"].node_name().is_none());
        assert!(state.plan_writes.is_empty());
    }
}
