//! Plan store: loads the cluster plan aggregate and is the only write path
//! for plan secrets
//!
//! Plan secrets are always read fresh from the API rather than a cache, so
//! every write goes through an optimistic update on the latest version.

use std::collections::BTreeMap;
use std::io::Read;
use std::net::Ipv6Addr;
use std::sync::Arc;

use base64::Engine;
use flate2::read::GzDecoder;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::ResourceExt;
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use capr_common::crd::{Cluster, Machine, MachineAddressType, RKEControlPlane, RKE_BOOTSTRAP_KIND};
use capr_common::naming::{plan_secret_name, sha256_hex};
use capr_common::retry::{retry_with_backoff, RetryConfig};
use capr_common::{
    is_managed_metadata_key, Error, JOINED_TO_ANNOTATION, JOIN_URL_ANNOTATION,
    PLAN_PROBES_PASSED_ANNOTATION, PLAN_UPDATED_TIME_ANNOTATION, SECRET_TYPE_MACHINE_PLAN,
};

use crate::client::{MachineStore, PlanSecretStore};
use crate::config::is_distro_config_path;
use crate::filters::{
    is_control_plane, is_etcd, is_etcd_only_init_node, is_init_node, join_url_autoset_disabled,
};
use crate::instructions::{CAPTURE_ADDRESS_INSTRUCTION_NAME, ETCD_NAME_INSTRUCTION_NAME};
use crate::plan::{Metadata, Node, NodePlan, Plan, PlanEntry, ProbeStatus};

/// Status message for a machine whose agent never applied a plan
pub const NO_AGENT_PLAN_STATUS_MESSAGE: &str = "waiting for agent to check in and apply initial plan";

/// Status message for a plan that is delivered but not yet applied
pub const WAITING_PLAN_STATUS_MESSAGE: &str = "waiting for plan to be applied";

/// Status message for a plan that failed past its threshold
pub const FAILED_PLAN_STATUS_MESSAGE: &str = "failure while applying plan";

/// Reads and writes per-machine plan secrets
#[derive(Clone)]
pub struct PlanStore {
    secrets: Arc<dyn PlanSecretStore>,
    machines: Arc<dyn MachineStore>,
    poll: RetryConfig,
}

impl PlanStore {
    /// Create a store over the given secret and machine clients
    pub fn new(
        secrets: Arc<dyn PlanSecretStore>,
        machines: Arc<dyn MachineStore>,
        poll: RetryConfig,
    ) -> Self {
        Self {
            secrets,
            machines,
            poll,
        }
    }

    /// Load the plan aggregate for a cluster
    ///
    /// Returns the plan and whether any machine has ever been delivered a
    /// plan. A join URL repair on any machine returns Waiting so the next pass
    /// sees the updated secret.
    pub async fn load(
        &self,
        cluster: &Cluster,
        control_plane: &RKEControlPlane,
    ) -> Result<(Plan, bool), Error> {
        let namespace = cluster.namespace().unwrap_or_default();
        let machines: Vec<Machine> = self
            .machines
            .list(&namespace, &cluster.name_any())
            .await?
            .into_iter()
            .filter(|m| m.bootstrap_kind() == RKE_BOOTSTRAP_KIND)
            .collect();

        let mut result = Plan::default();
        let mut any_plan_delivered = false;

        for machine in &machines {
            result
                .machines
                .insert(machine.name_any(), machine.clone());
        }

        for machine in machines {
            let Some(secret) = self.fetch_plan_secret(&machine).await? else {
                debug!(machine = %machine.name_any(), "plan secret not found, skipping");
                continue;
            };
            let name = machine.name_any();
            let metadata = Metadata {
                labels: secret.labels().clone(),
                annotations: secret.annotations().clone(),
            };
            result.metadata.insert(name.clone(), metadata.clone());

            let Some(node) = secret_to_node(&secret)? else {
                continue;
            };
            if node.plan_data_exists {
                any_plan_delivered = true;
            }

            let mut entry = PlanEntry {
                machine,
                plan: Some(node),
                metadata,
            };
            self.set_machine_join_url(&mut entry, cluster, control_plane)
                .await?;
            result.absorb(&entry);
        }

        Ok((result, any_plan_delivered))
    }

    /// Fetch the plan secret for a machine, polling while it does not exist yet
    ///
    /// Returns `None` if the secret still doesn't exist once the poll budget is
    /// spent.
    pub async fn get_plan_secret_from_machine(
        &self,
        machine: &Machine,
    ) -> Result<Option<Secret>, Error> {
        let polled = retry_with_backoff(&self.poll, "get plan secret", || async {
            match self.fetch_plan_secret(machine).await? {
                Some(secret) => Ok(secret),
                None => Err(Error::waiting(format!(
                    "plan secret for machine {} does not exist yet",
                    machine.name_any()
                ))),
            }
        })
        .await;
        match polled {
            Ok(secret) => Ok(Some(secret)),
            Err(e) if e.is_waiting() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn fetch_plan_secret(&self, machine: &Machine) -> Result<Option<Secret>, Error> {
        let namespace = machine.namespace().unwrap_or_default();
        let machine_name = machine.name_any();
        if machine.bootstrap_kind() != RKE_BOOTSTRAP_KIND {
            return Err(Error::internal_with_context(
                "store",
                format!("machine {namespace}/{machine_name} is not using RKEBootstrap"),
            ));
        }
        let bootstrap = machine.bootstrap_name();
        if bootstrap.is_empty() {
            return Err(Error::internal_with_context(
                "store",
                format!("machine {namespace}/{machine_name} bootstrap configref name was empty"),
            ));
        }

        let name = plan_secret_name(bootstrap);
        let Some(secret) = self.secrets.get(&namespace, &name).await? else {
            return Ok(None);
        };
        let type_ = secret.type_.as_deref().unwrap_or("");
        if type_ != SECRET_TYPE_MACHINE_PLAN {
            return Err(Error::internal_with_context(
                "store",
                format!(
                    "retrieved secret {namespace}/{name} type {type_} did not match expected type {SECRET_TYPE_MACHINE_PLAN}"
                ),
            ));
        }
        Ok(Some(secret))
    }

    async fn require_plan_secret(&self, machine: &Machine) -> Result<Secret, Error> {
        self.get_plan_secret_from_machine(machine)
            .await?
            .ok_or_else(|| {
                Error::waiting(format!(
                    "waiting for plan secret of machine {}",
                    machine.name_any()
                ))
            })
    }

    /// Write a new plan to a machine's plan secret
    ///
    /// `max_failures` and `failure_threshold` are written only when positive
    /// or -1 (unlimited). The entry is refreshed from the written secret, so
    /// `in_sync` reflects the new bytes immediately.
    pub async fn update_plan(
        &self,
        entry: &mut PlanEntry,
        new_plan: &NodePlan,
        joined_to: &str,
        max_failures: i32,
        failure_threshold: i32,
    ) -> Result<(), Error> {
        if max_failures < failure_threshold && failure_threshold != -1 && max_failures != -1 {
            return Err(Error::validation(format!(
                "failureThreshold ({failure_threshold}) cannot be greater than maxFailures ({max_failures})"
            )));
        }

        let mut secret = self.require_plan_secret(&entry.machine).await?;
        let data = serde_json::to_vec(new_plan)?;

        let init = is_init_node(entry);
        let annotations = &mut entry.metadata.annotations;
        if !joined_to.is_empty() {
            let value = if joined_to == "-" || init { "" } else { joined_to };
            annotations.insert(JOINED_TO_ANNOTATION.to_string(), value.to_string());
        }
        // an init node is joined to itself
        if init {
            annotations.insert(JOINED_TO_ANNOTATION.to_string(), String::new());
        }
        annotations.insert(
            PLAN_UPDATED_TIME_ANNOTATION.to_string(),
            chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        );
        annotations.insert(PLAN_PROBES_PASSED_ANNOTATION.to_string(), String::new());

        copy_plan_metadata_to_secret(&mut secret, &entry.metadata);

        let secret_data = secret.data.get_or_insert_with(BTreeMap::new);
        secret_data.remove("probe-statuses");
        secret_data.insert("plan".to_string(), ByteString(data));
        set_threshold(secret_data, "max-failures", max_failures);
        set_threshold(secret_data, "failure-threshold", failure_threshold);

        let updated = self.secrets.update(&secret).await?;
        debug!(machine = %entry.name(), "plan updated");
        entry.plan = secret_to_node(&updated)?;
        Ok(())
    }

    /// Persist the entry's managed labels and annotations onto its plan secret
    pub async fn update_plan_secret_labels_and_annotations(
        &self,
        entry: &mut PlanEntry,
    ) -> Result<(), Error> {
        let mut secret = self.require_plan_secret(&entry.machine).await?;
        copy_plan_metadata_to_secret(&mut secret, &entry.metadata);
        let updated = self.secrets.update(&secret).await?;
        entry.plan = secret_to_node(&updated)?;
        Ok(())
    }

    /// Remove a label from the plan secret; a no-op when it is absent
    pub async fn remove_plan_secret_label(
        &self,
        entry: &mut PlanEntry,
        key: &str,
    ) -> Result<(), Error> {
        let mut secret = self.require_plan_secret(&entry.machine).await?;
        if !secret.labels().contains_key(key) {
            return Ok(());
        }
        secret.labels_mut().remove(key);
        let updated = self.secrets.update(&secret).await?;
        entry.plan = secret_to_node(&updated)?;
        entry.metadata.labels = updated.labels().clone();
        Ok(())
    }

    /// Discover the URL other nodes join this machine through
    ///
    /// Etcd-only init nodes have no supervisor address of their own to trust,
    /// so their URL comes from the etcd member list scraped by periodic
    /// instructions. Everything else uses the machine's reported addresses.
    pub async fn set_machine_join_url(
        &self,
        entry: &mut PlanEntry,
        cluster: &Cluster,
        control_plane: &RKEControlPlane,
    ) -> Result<(), Error> {
        if join_url_autoset_disabled(entry) {
            return Ok(());
        }

        let port = control_plane.runtime().supervisor_port();
        let join_url = if is_etcd_only_init_node(entry) {
            match join_url_from_output(entry, cluster, port)? {
                Some(url) => url,
                None => return Ok(()),
            }
        } else {
            let has_node_info = entry
                .machine
                .status
                .as_ref()
                .is_some_and(|s| s.node_info.is_some());
            if !has_node_info {
                return Ok(());
            }
            preferred_address(&entry.machine)
                .map(|address| join_url_from_address(&address, port))
                .unwrap_or_default()
        };

        let mut update_required = false;
        if !join_url.is_empty() && entry.metadata.annotation(JOIN_URL_ANNOTATION) != join_url {
            entry
                .metadata
                .annotations
                .insert(JOIN_URL_ANNOTATION.to_string(), join_url);
            update_required = true;
        }

        // Older plans may predate the joined-to annotation; recover it from the
        // rendered config.
        if !is_init_node(entry) && entry.metadata.annotation(JOINED_TO_ANNOTATION).is_empty() {
            if let Some(server) = joined_server_from_plan(entry)? {
                entry
                    .metadata
                    .annotations
                    .insert(JOINED_TO_ANNOTATION.to_string(), server);
                update_required = true;
            }
        }

        if update_required {
            self.update_plan_secret_labels_and_annotations(entry).await?;
            return Err(Error::waiting(format!(
                "updated join url annotations on machine {}",
                entry.name()
            )));
        }
        Ok(())
    }
}

/// Assign `new_plan` to the entry and check that it has been applied
///
/// Writing a different plan returns Waiting; the caller is re-invoked once the
/// agent has had a chance to apply it.
pub async fn assign_and_check_plan(
    store: &PlanStore,
    msg: &str,
    entry: &mut PlanEntry,
    new_plan: &NodePlan,
    joined_to: &str,
    max_failures: i32,
    failure_threshold: i32,
) -> Result<(), Error> {
    let current = match &entry.plan {
        Some(node) if node.plan == *new_plan => node,
        _ => {
            store
                .update_plan(entry, new_plan, joined_to, max_failures, failure_threshold)
                .await?;
            return Err(Error::waiting(format!("starting {msg}")));
        }
    };
    if current.failed {
        return Err(Error::operation_failed(msg, format!("operation {msg} failed")));
    }
    if !current.in_sync {
        return Err(Error::waiting(format!("waiting for {msg}")));
    }
    if !current.healthy {
        return Err(Error::waiting(format!("waiting for {msg} probes")));
    }
    Ok(())
}

/// Parse a plan secret into a node
///
/// Returns `None` when no plan has been written yet.
pub fn secret_to_node(secret: &Secret) -> Result<Option<Node>, Error> {
    let type_ = secret.type_.as_deref().unwrap_or("");
    if type_ != SECRET_TYPE_MACHINE_PLAN {
        return Err(Error::internal_with_context(
            "store",
            format!(
                "secret {}/{} was not type {SECRET_TYPE_MACHINE_PLAN}",
                secret.namespace().unwrap_or_default(),
                secret.name_any()
            ),
        ));
    }

    let empty = BTreeMap::new();
    let data = secret.data.as_ref().unwrap_or(&empty);
    let field = |key: &str| data.get(key).map(|b| b.0.as_slice()).unwrap_or(&[]);

    let plan_data = field("plan");
    let applied_plan_data = field("appliedPlan");
    let mut node = Node {
        healthy: true,
        plan_data_exists: !plan_data.is_empty(),
        probes_usable: !secret
            .annotations()
            .get(PLAN_PROBES_PASSED_ANNOTATION)
            .map(String::is_empty)
            .unwrap_or(true),
        ..Default::default()
    };

    let failure_count = field("failure-count");
    let failed_checksum = String::from_utf8_lossy(field("failed-checksum"));
    if !failure_count.is_empty() && plan_hash(plan_data) == failed_checksum {
        let count = parse_int(failure_count, "failure-count")?;
        if count > 0 {
            node.failed = true;
            // an unset threshold means any failure counts
            let threshold = field("failure-threshold");
            if !threshold.is_empty() {
                let threshold = parse_int(threshold, "failure-threshold")?;
                if count < threshold || threshold == -1 {
                    node.failed = false;
                }
            }
        }
    }

    let probes = field("probe-statuses");
    if !probes.is_empty() {
        let (statuses, healthy) = parse_probe_statuses(probes)?;
        node.probe_status = statuses;
        node.healthy = healthy;
    }

    if plan_data.is_empty() {
        return Ok(None);
    }
    node.plan = serde_json::from_slice(plan_data)?;

    if !applied_plan_data.is_empty() {
        node.applied_plan = Some(serde_json::from_slice(applied_plan_data)?);
    }

    if let Some(joined_to) = secret.annotations().get(JOINED_TO_ANNOTATION) {
        node.joined_to = joined_to.clone();
    }

    let output = field("applied-output");
    if !output.is_empty() {
        let raw: BTreeMap<String, String> = serde_json::from_slice(&gunzip(output)?)?;
        node.output = raw
            .into_iter()
            .map(|(k, v)| {
                base64::engine::general_purpose::STANDARD
                    .decode(v)
                    .map(|bytes| (k, bytes))
                    .map_err(|e| Error::serialization_for_kind("applied-output", e.to_string()))
            })
            .collect::<Result<_, _>>()?;
    }

    let periodic = field("applied-periodic-output");
    if !periodic.is_empty() {
        node.periodic_output = serde_json::from_slice(&gunzip(periodic)?)?;
    }

    node.in_sync = plan_data == applied_plan_data;
    Ok(Some(node))
}

/// Parse the agent's probe report, returning the statuses and overall health
pub fn parse_probe_statuses(raw: &[u8]) -> Result<(BTreeMap<String, ProbeStatus>, bool), Error> {
    if raw.is_empty() {
        return Err(Error::serialization_for_kind(
            "probe-statuses",
            "probe status length was 0",
        ));
    }
    let statuses: BTreeMap<String, ProbeStatus> = serde_json::from_slice(raw)?;
    let healthy = statuses.values().all(|s| s.healthy);
    Ok((statuses, healthy))
}

/// Hex SHA-256 of serialized plan bytes, matched against `failed-checksum`
pub fn plan_hash(plan: &[u8]) -> String {
    sha256_hex(plan)
}

/// Human-readable state of an entry's plan, empty when settled
pub fn plan_status_message(entry: &PlanEntry) -> String {
    let Some(node) = entry.plan.as_ref() else {
        return no_plan_message(entry).to_string();
    };
    if node.plan.instructions.is_empty() {
        return no_plan_message(entry).to_string();
    }
    if node.applied_plan.is_none() {
        return NO_AGENT_PLAN_STATUS_MESSAGE.to_string();
    }
    if !node.plan.error.is_empty() {
        return node.plan.error.clone();
    }
    if !node.healthy {
        let unhealthy: Vec<&str> = node
            .probe_status
            .iter()
            .filter(|(_, s)| !s.healthy)
            .map(|(name, _)| name.as_str())
            .collect();
        return format!("waiting for probes: {}", unhealthy.join(", "));
    }
    if node.in_sync {
        return String::new();
    }
    if node.failed {
        return FAILED_PLAN_STATUS_MESSAGE.to_string();
    }
    WAITING_PLAN_STATUS_MESSAGE.to_string()
}

fn no_plan_message(entry: &PlanEntry) -> &'static str {
    if is_etcd(entry) {
        "waiting for bootstrap etcd to be available"
    } else if is_control_plane(entry) {
        "waiting for etcd to be available"
    } else {
        "waiting for control plane to be available"
    }
}

/// Full join URL for an address, bracketing bare IPv6
pub fn join_url_from_address(address: &str, port: u16) -> String {
    if address.parse::<Ipv6Addr>().is_ok() {
        format!("https://[{address}]:{port}")
    } else {
        format!("https://{address}:{port}")
    }
}

/// Copy managed labels and annotations onto a secret
pub fn copy_plan_metadata_to_secret(secret: &mut Secret, metadata: &Metadata) {
    let labels = secret.labels_mut();
    for (k, v) in &metadata.labels {
        if is_managed_metadata_key(k) {
            labels.insert(k.clone(), v.clone());
        }
    }
    let annotations = secret.annotations_mut();
    for (k, v) in &metadata.annotations {
        if is_managed_metadata_key(k) {
            annotations.insert(k.clone(), v.clone());
        }
    }
}

fn set_threshold(data: &mut BTreeMap<String, ByteString>, key: &str, value: i32) {
    if value > 0 || value == -1 {
        data.insert(key.to_string(), ByteString(value.to_string().into_bytes()));
    } else {
        data.remove(key);
    }
}

fn parse_int(raw: &[u8], key: &str) -> Result<i64, Error> {
    String::from_utf8_lossy(raw)
        .trim()
        .parse()
        .map_err(|e: std::num::ParseIntError| Error::serialization_for_kind(key, e.to_string()))
}

fn gunzip(raw: &[u8]) -> Result<Vec<u8>, Error> {
    let mut out = Vec::new();
    GzDecoder::new(raw)
        .read_to_end(&mut out)
        .map_err(|e| Error::serialization_for_kind("gzip", e.to_string()))?;
    Ok(out)
}

/// InternalIP wins over ExternalIP; the last InternalIP listed is used
fn preferred_address(machine: &Machine) -> Option<String> {
    let mut address: Option<String> = None;
    for a in machine.status.as_ref().map(|s| s.addresses.as_slice()).unwrap_or(&[]) {
        match a.type_ {
            MachineAddressType::InternalIP => address = Some(a.address.clone()),
            MachineAddressType::ExternalIP if address.is_none() => {
                address = Some(a.address.clone())
            }
            _ => {}
        }
    }
    address.filter(|a| !a.is_empty())
}

#[derive(Deserialize)]
struct DbInfo {
    #[serde(default)]
    members: Vec<DbMember>,
}

#[derive(Deserialize)]
struct DbMember {
    #[serde(default)]
    name: String,
    #[serde(default, rename = "clientURLs")]
    client_urls: Vec<String>,
}

fn join_url_from_output(
    entry: &PlanEntry,
    cluster: &Cluster,
    port: u16,
) -> Result<Option<String>, Error> {
    let Some(node) = entry.plan.as_ref() else {
        return Ok(None);
    };
    if cluster.spec.control_plane_ref.is_none() {
        return Ok(None);
    }

    let succeeded = |name: &str| {
        node.periodic_output
            .get(name)
            .filter(|o| o.exit_code == 0 && !o.last_successful_run_time.is_empty())
    };
    let (Some(capture), Some(etcd_name)) = (
        succeeded(CAPTURE_ADDRESS_INSTRUCTION_NAME),
        succeeded(ETCD_NAME_INSTRUCTION_NAME),
    ) else {
        return Ok(None);
    };

    let name = String::from_utf8_lossy(&etcd_name.stdout).trim().to_string();
    let stdout = String::from_utf8_lossy(&capture.stdout);
    let Some(line) = stdout.lines().find(|l| l.starts_with('{')) else {
        return Ok(None);
    };
    let info: DbInfo = serde_json::from_str(line)?;

    // a missing member is retried once the agent reports again
    let Some(member) = info.members.iter().find(|m| m.name == name) else {
        return Ok(None);
    };
    let Some(client_url) = member.client_urls.first() else {
        warn!(member = %member.name, "etcd member has no client URLs");
        return Ok(None);
    };
    Ok(Some(join_url_from_address(&url_hostname(client_url)?, port)))
}

/// Host part of a URL, without brackets or port
fn url_hostname(raw: &str) -> Result<String, Error> {
    let url = Url::parse(raw).map_err(|e| Error::serialization(format!("invalid URL {raw}: {e}")))?;
    let host = url
        .host_str()
        .ok_or_else(|| Error::serialization(format!("URL {raw} has no host")))?;
    Ok(host.trim_start_matches('[').trim_end_matches(']').to_string())
}

fn joined_server_from_plan(entry: &PlanEntry) -> Result<Option<String>, Error> {
    let Some(node) = entry.plan.as_ref() else {
        return Ok(None);
    };
    let Some(file) = node.plan.files.iter().find(|f| is_distro_config_path(&f.path)) else {
        return Ok(None);
    };
    let raw = base64::engine::general_purpose::STANDARD
        .decode(&file.content)
        .map_err(|e| Error::serialization_for_kind("config", e.to_string()))?;
    let config: serde_json::Map<String, serde_json::Value> = serde_json::from_slice(&raw)?;
    Ok(config
        .get("server")
        .and_then(|s| s.as_str())
        .map(str::to_string))
}
