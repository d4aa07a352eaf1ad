//! RKEControlPlane Custom Resource Definition
//!
//! The control plane object carries the declarative cluster configuration and
//! the only durable record of in-progress long-running operations. The
//! planner reads the spec and returns a mutated status; persisting that
//! status is the calling controller's job.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::conditions::{Condition, Conditions};
use super::operation::{
    EncryptionKeyRotationPhase, EtcdSnapshotCreatePhase, EtcdSnapshotRestorePhase, Operation,
};

/// Loosely-typed distro configuration (keys vary by Kubernetes release)
pub type GenericMap = serde_json::Map<String, serde_json::Value>;

/// Specification for an RKEControlPlane
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "rke.cattle.io",
    version = "v1",
    kind = "RKEControlPlane",
    plural = "rkecontrolplanes",
    status = "RKEControlPlaneStatus",
    namespaced,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.kubernetesVersion"}"#,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RKEControlPlaneSpec {
    /// Name of the CAPI cluster this control plane belongs to
    pub cluster_name: String,

    /// Management-side cluster name, used for chart values and authorization
    #[serde(default)]
    pub management_cluster_name: String,

    /// Kubernetes version including the distro suffix (e.g. `v1.29.4+rke2r1`)
    pub kubernetes_version: String,

    /// Environment variables handed to the install script
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub agent_env_vars: Vec<EnvVar>,

    /// Config applied to every machine
    #[serde(default)]
    pub machine_global_config: GenericMap,

    /// Config applied to machines matching a label selector
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub machine_selector_config: Vec<SystemConfig>,

    /// Files delivered to machines matching a label selector
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub machine_selector_files: Vec<ProvisioningFiles>,

    /// Private registry mirrors and credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registries: Option<Registry>,

    /// Registry prefixed to system images
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub system_default_registry: String,

    /// Etcd snapshot settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etcd: Option<EtcdConfig>,

    /// Helm chart values keyed by chart name
    #[serde(default)]
    pub chart_values: GenericMap,

    /// Extra manifests appended to control plane nodes
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub additional_manifest: String,

    /// Per-tier concurrency and drain options
    #[serde(default)]
    pub upgrade_strategy: UpgradeStrategy,

    /// Local cluster auth endpoint configuration
    #[serde(default)]
    pub local_cluster_auth_endpoint: LocalClusterAuthEndpoint,

    /// Bumped to force a restart of every node
    #[serde(default)]
    pub provision_generation: i64,

    /// When set, no config files are rendered
    #[serde(default)]
    pub unmanaged_config: bool,

    /// Data directory overrides
    #[serde(default)]
    pub data_directories: DataDirectories,

    /// Cluster networking preferences
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub networking: Option<Networking>,

    /// Certificate rotation request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotate_certificates: Option<RotateCertificates>,

    /// Encryption key rotation request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotate_encryption_keys: Option<RotateEncryptionKeys>,

    /// Etcd snapshot creation request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etcd_snapshot_create: Option<EtcdSnapshotCreate>,

    /// Etcd snapshot restore request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etcd_snapshot_restore: Option<EtcdSnapshotRestore>,
}

/// Name/value environment variable
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct EnvVar {
    /// Variable name
    pub name: String,
    /// Variable value
    #[serde(default)]
    pub value: String,
}

/// Config applied to machines matching a selector
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SystemConfig {
    /// Selector over machine labels; `None` matches every machine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_label_selector: Option<LabelSelector>,
    /// Config keys to merge
    #[serde(default)]
    pub config: GenericMap,
}

/// Files delivered to machines matching a selector
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningFiles {
    /// Selector over machine labels; `None` matches every machine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_label_selector: Option<LabelSelector>,
    /// Objects the files are read from
    #[serde(default)]
    pub file_sources: Vec<ProvisioningFileSource>,
}

/// Exactly one of a secret or a configmap
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningFileSource {
    /// Secret source; must be authorized for the cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<ObjectFileSource>,
    /// ConfigMap source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map: Option<ObjectFileSource>,
}

/// Object holding file contents
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectFileSource {
    /// Object name in the control plane namespace
    pub name: String,
    /// Keys to project
    #[serde(default)]
    pub items: Vec<KeyToPath>,
    /// Permissions for items that don't set their own
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub default_permissions: String,
}

/// Projection of one object key to a node path
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KeyToPath {
    /// Data key
    pub key: String,
    /// Absolute path on the node
    pub path: String,
    /// Changes to a dynamic file don't restart the service
    #[serde(default)]
    pub dynamic: bool,
    /// File mode (e.g. "0600")
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub permissions: String,
    /// Expected base64 SHA-256 of the content
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hash: String,
}

/// Registry mirrors and per-registry auth/TLS
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Registry {
    /// Mirror endpoints keyed by registry host
    #[serde(default)]
    pub mirrors: BTreeMap<String, Mirror>,
    /// Auth and TLS settings keyed by registry host
    #[serde(default)]
    pub configs: BTreeMap<String, RegistryConfig>,
}

/// Mirror endpoints for one registry
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Mirror {
    /// Mirror URLs tried in order
    #[serde(default)]
    pub endpoints: Vec<String>,
    /// Repository rewrite rules
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub rewrites: BTreeMap<String, String>,
}

/// Auth and TLS settings for one registry
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegistryConfig {
    /// Secret with `username`/`password` keys
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub auth_config_secret_name: String,
    /// TLS secret with `tls.crt`/`tls.key`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tls_secret_name: String,
    /// PEM CA bundle
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ca_bundle: String,
    /// Skip TLS verification
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

/// Etcd snapshot schedule and storage
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EtcdConfig {
    /// Disable scheduled snapshots
    #[serde(default)]
    pub disable_snapshots: bool,
    /// Cron schedule for snapshots
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub snapshot_schedule_cron: String,
    /// Number of snapshots to keep
    #[serde(default)]
    pub snapshot_retention: i32,
    /// S3 storage for scheduled snapshots
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3: Option<EtcdS3>,
}

/// S3 target for etcd snapshots
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EtcdS3 {
    /// Bucket name
    #[serde(default)]
    pub bucket: String,
    /// S3 endpoint host
    #[serde(default)]
    pub endpoint: String,
    /// PEM CA for the endpoint
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub endpoint_ca: String,
    /// Folder inside the bucket
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub folder: String,
    /// Bucket region
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub region: String,
    /// Secret (`namespace:name`) holding access and secret keys
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cloud_credential_name: String,
    /// Skip TLS verification
    #[serde(default)]
    pub skip_ssl_verify: bool,
}

/// Per-tier rollout limits
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeStrategy {
    /// Count or percentage of control plane nodes that may be unavailable
    #[serde(default)]
    pub control_plane_concurrency: String,
    /// Drain options for control plane nodes
    #[serde(default)]
    pub control_plane_drain_options: DrainOptions,
    /// Count or percentage of worker nodes that may be unavailable
    #[serde(default)]
    pub worker_concurrency: String,
    /// Drain options for worker nodes
    #[serde(default)]
    pub worker_drain_options: DrainOptions,
}

/// Options forwarded to the external drain controller
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DrainOptions {
    /// Drain before disruptive changes
    #[serde(default)]
    pub enabled: bool,
    /// Delete pods not managed by a controller
    #[serde(default)]
    pub force: bool,
    /// Ignore DaemonSet-managed pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ignore_daemon_sets: Option<bool>,
    /// Continue past eviction errors
    #[serde(default)]
    pub ignore_errors: bool,
    /// Delete pods using emptyDir volumes
    #[serde(default)]
    pub delete_empty_dir_data: bool,
    /// Delete instead of evict
    #[serde(default)]
    pub disable_eviction: bool,
    /// Pod termination grace period in seconds
    #[serde(default)]
    pub grace_period: i64,
    /// Drain timeout in seconds
    #[serde(default)]
    pub timeout: i64,
    /// Skip waiting for pods deleted longer ago than this
    #[serde(default)]
    pub skip_wait_for_delete_timeout_seconds: i64,
    /// Annotations that must be acknowledged before draining
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pre_drain_hooks: Vec<DrainHook>,
    /// Annotations that must be acknowledged after draining
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_drain_hooks: Vec<DrainHook>,
}

/// Hook acknowledged through an annotation on the plan secret
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct DrainHook {
    /// Annotation key the hook owner sets when done
    pub annotation: String,
}

/// Local cluster auth endpoint settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LocalClusterAuthEndpoint {
    /// Render the authentication webhook on control plane nodes
    #[serde(default)]
    pub enabled: bool,
    /// Public FQDN for the endpoint
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub fqdn: String,
    /// CA certificates for the FQDN
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ca_certs: String,
}

/// Data directory overrides
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataDirectories {
    /// System agent data dir
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub system_agent: String,
    /// Provisioning data dir
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub provisioning: String,
    /// Distro (`data-dir`) data dir
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub k8s_distro: String,
}

/// IP stack preference for loopback addresses
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StackPreference {
    /// IPv4 loopback
    #[default]
    Ipv4,
    /// IPv6 loopback
    Ipv6,
    /// `localhost`
    Dual,
}

/// Cluster networking preferences
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Networking {
    /// Loopback address family used by node-local commands
    #[serde(default)]
    pub stack_preference: StackPreference,
}

/// Certificate rotation request
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct RotateCertificates {
    /// Bump to request a new rotation
    #[serde(default)]
    pub generation: i64,
    /// Services to rotate; empty rotates everything
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<String>,
}

/// Encryption key rotation request
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct RotateEncryptionKeys {
    /// Bump to request a new rotation
    #[serde(default)]
    pub generation: i64,
}

/// Etcd snapshot creation request
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct EtcdSnapshotCreate {
    /// Bump to request a new snapshot
    #[serde(default)]
    pub generation: i64,
    /// Optional S3 target overriding local storage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3: Option<EtcdS3>,
}

/// Etcd snapshot restore request
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EtcdSnapshotRestore {
    /// Snapshot name (ETCDSnapshot object or local file name)
    #[serde(default)]
    pub name: String,
    /// Bump to request the same snapshot again
    #[serde(default)]
    pub generation: i64,
    /// Which parts of the recorded cluster config to restore
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub restore_rke_config: String,
}

/// Status for an RKEControlPlane
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RKEControlPlaneStatus {
    /// Control plane conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Control plane has come up at least once
    #[serde(default)]
    pub initialized: bool,

    /// Control plane is ready
    #[serde(default)]
    pub ready: bool,

    /// The cluster agent reported in at least once
    #[serde(default)]
    pub agent_connected: bool,

    /// Last processed metadata.generation
    #[serde(default)]
    pub observed_generation: i64,

    /// Bumped to force config re-rendering and service restarts
    #[serde(default)]
    pub config_generation: i64,

    /// Generation of the last completed certificate rotation
    #[serde(default)]
    pub certificate_rotation_generation: i64,

    /// Encryption key rotation progress
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotate_encryption_keys: Option<Operation<RotateEncryptionKeys, EncryptionKeyRotationPhase>>,

    /// Machine leading the current encryption key rotation
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub rotate_encryption_keys_leader: String,

    /// Etcd snapshot creation progress
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etcd_snapshot_create: Option<Operation<EtcdSnapshotCreate, EtcdSnapshotCreatePhase>>,

    /// Etcd snapshot restore progress
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etcd_snapshot_restore: Option<Operation<EtcdSnapshotRestore, EtcdSnapshotRestorePhase>>,
}

impl Conditions for RKEControlPlaneStatus {
    fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.conditions
    }
}

impl RKEControlPlaneStatus {
    /// Current encryption key rotation phase, if any
    pub fn encryption_key_phase(&self) -> Option<EncryptionKeyRotationPhase> {
        self.rotate_encryption_keys.as_ref().map(|op| op.phase)
    }

    /// Current restore phase, if any
    pub fn restore_phase(&self) -> Option<EtcdSnapshotRestorePhase> {
        self.etcd_snapshot_restore.as_ref().map(|op| op.phase)
    }
}
