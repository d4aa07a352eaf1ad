//! Typed views of the Cluster API objects the planner reads
//!
//! Only the fields the planner consumes are modelled; unknown fields are
//! ignored on deserialization. CAPI owns these objects, so the planner limits
//! itself to status conditions and a handful of annotations.

use k8s_openapi::api::core::v1::{NodeSystemInfo, ObjectReference};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::Error;

use super::conditions::{Condition, Conditions, INFRASTRUCTURE_READY};

/// CAPI failure reason set when infrastructure deletion failed
pub const DELETE_MACHINE_ERROR: &str = "DeleteError";

/// Kind of the bootstrap config owned by this provider
pub const RKE_BOOTSTRAP_KIND: &str = "RKEBootstrap";

/// Spec of a CAPI Machine
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cluster.x-k8s.io",
    version = "v1beta1",
    kind = "Machine",
    plural = "machines",
    status = "MachineStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    /// Owning CAPI cluster name
    pub cluster_name: String,

    /// Bootstrap configuration reference
    #[serde(default)]
    pub bootstrap: Bootstrap,

    /// Infrastructure machine reference
    #[serde(default)]
    pub infrastructure_ref: ObjectReference,

    /// Desired Kubernetes version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Bootstrap section of a Machine spec
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Bootstrap {
    /// Reference to the bootstrap config object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_ref: Option<ObjectReference>,

    /// Secret holding rendered bootstrap data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_secret_name: Option<String>,
}

/// Observed state of a CAPI Machine
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatus {
    /// Node backing this machine once it joined
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_ref: Option<ObjectReference>,

    /// Node system info reported by the kubelet
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_info: Option<NodeSystemInfo>,

    /// Addresses reported by the infrastructure provider
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<MachineAddress>,

    /// Infrastructure provider finished provisioning
    #[serde(default)]
    pub infrastructure_ready: bool,

    /// Terminal failure reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    /// Terminal failure message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,

    /// CAPI lifecycle phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,

    /// Machine conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl Conditions for MachineStatus {
    fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.conditions
    }
}

/// Machine address type
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum MachineAddressType {
    /// Hostname
    Hostname,
    /// Routable external address
    ExternalIP,
    /// Cluster-internal address
    InternalIP,
    /// External DNS name
    ExternalDNS,
    /// Internal DNS name
    InternalDNS,
}

/// One address of a machine
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct MachineAddress {
    /// Address kind
    #[serde(rename = "type")]
    pub type_: MachineAddressType,
    /// Address value
    pub address: String,
}

impl Machine {
    /// True once a deletion timestamp is set
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// True if CAPI reports a terminal failure
    pub fn is_failed(&self) -> bool {
        self.status.as_ref().is_some_and(|s| {
            s.failure_reason.as_deref().is_some_and(|r| !r.is_empty())
                || s.failure_message.as_deref().is_some_and(|m| !m.is_empty())
        })
    }

    /// True if the infrastructure-ready condition is true
    pub fn infrastructure_ready(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.conditions.is_true(INFRASTRUCTURE_READY))
    }

    /// Kind of the bootstrap config ref, empty if unset
    pub fn bootstrap_kind(&self) -> &str {
        self.spec
            .bootstrap
            .config_ref
            .as_ref()
            .and_then(|r| r.kind.as_deref())
            .unwrap_or("")
    }

    /// Name of the bootstrap config ref, empty if unset
    pub fn bootstrap_name(&self) -> &str {
        self.spec
            .bootstrap
            .config_ref
            .as_ref()
            .and_then(|r| r.name.as_deref())
            .unwrap_or("")
    }

    /// Name of the node this machine registered, if any
    pub fn node_name(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.node_ref.as_ref())
            .and_then(|r| r.name.as_deref())
    }

    /// First address of the given type
    pub fn address(&self, type_: MachineAddressType) -> Option<&str> {
        self.status.as_ref().and_then(|s| {
            s.addresses
                .iter()
                .find(|a| a.type_ == type_ && !a.address.is_empty())
                .map(|a| a.address.as_str())
        })
    }

    /// Value of a label, empty if absent
    pub fn label(&self, key: &str) -> &str {
        self.labels().get(key).map(String::as_str).unwrap_or("")
    }

    /// Machine UID, empty if unset
    pub fn uid_str(&self) -> &str {
        self.metadata.uid.as_deref().unwrap_or("")
    }
}

/// Deletion progress of the first machine by name
///
/// Only the first machine is reported. A failed infrastructure deletion is
/// a hard error because the machine must then be removed by hand.
pub fn machine_deletion_status(machines: &[Machine]) -> Result<Option<String>, Error> {
    let Some(first) = machines.iter().min_by_key(|m| m.name_any()) else {
        return Ok(None);
    };
    let failed_delete = first
        .status
        .as_ref()
        .and_then(|s| s.failure_reason.as_deref())
        == Some(DELETE_MACHINE_ERROR);
    if failed_delete {
        return Err(Error::operation_failed(
            "machine deletion",
            format!(
                "error deleting machine [{}], machine must be deleted manually",
                first.name_any()
            ),
        ));
    }
    Ok(Some(format!("waiting for machine [{}] to delete", first.name_any())))
}

/// Spec of a CAPI Cluster
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cluster.x-k8s.io",
    version = "v1beta1",
    kind = "Cluster",
    plural = "clusters",
    status = "ClusterStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Stops CAPI controllers from reconciling this cluster
    #[serde(default)]
    pub paused: bool,

    /// Control plane provider reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane_ref: Option<ObjectReference>,

    /// Infrastructure provider reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infrastructure_ref: Option<ObjectReference>,
}

/// Observed state of a CAPI Cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// Infrastructure provider finished provisioning
    #[serde(default)]
    pub infrastructure_ready: bool,

    /// Control plane reports ready
    #[serde(default)]
    pub control_plane_ready: bool,

    /// Cluster conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl Conditions for ClusterStatus {
    fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.conditions
    }
}

impl Cluster {
    /// True once a deletion timestamp is set
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// True if CAPI reports infrastructure as provisioned
    pub fn infrastructure_ready(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.infrastructure_ready)
    }
}

/// Spec of an RKEBootstrap config
///
/// The planner only touches bootstrap annotations; the spec is opaque.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "rke.cattle.io",
    version = "v1",
    kind = "RKEBootstrap",
    plural = "rkebootstraps",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct RKEBootstrapSpec {
    /// Cluster name the bootstrap belongs to
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster_name: String,
}
