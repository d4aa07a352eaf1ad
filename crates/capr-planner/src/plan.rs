//! Plan record wire types and the per-pass cluster aggregate
//!
//! [`NodePlan`] is the contract handed to the node agent. It is serialized
//! with camelCase keys and empty fields omitted so the bytes written to a
//! plan secret stay stable across passes; `InSync` compares those bytes.

use std::collections::BTreeMap;

use capr_common::crd::Machine;
use capr_common::Error;
use serde::{Deserialize, Serialize};

/// Declarative plan delivered to one machine
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodePlan {
    /// Files written before any instruction runs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<File>,

    /// Instructions run once, in order, per plan content
    #[serde(default, rename = "instructions", skip_serializing_if = "Vec::is_empty")]
    pub instructions: Vec<OneTimeInstruction>,

    /// Health probes keyed by name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub probes: BTreeMap<String, Probe>,

    /// Instructions run forever at their period
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub periodic_instructions: Vec<PeriodicInstruction>,

    /// Error surfaced instead of applying the plan
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// File written by the agent
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct File {
    /// Base64-encoded content
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content: String,

    /// Absolute path on the node
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,

    /// File mode, e.g. "0600"
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub permissions: String,

    /// Content changes don't require a service restart
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub dynamic: bool,

    /// Content changes don't affect availability and bypass the rollout budget
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub minor: bool,
}

impl File {
    /// Build a file from plain content, base64-encoding it
    pub fn new(path: impl Into<String>, content: impl AsRef<[u8]>) -> Self {
        use base64::Engine;
        Self {
            content: base64::engine::general_purpose::STANDARD.encode(content.as_ref()),
            path: path.into(),
            ..Default::default()
        }
    }

    /// Decoded content
    pub fn decoded(&self) -> Result<Vec<u8>, Error> {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD
            .decode(&self.content)
            .map_err(|e| Error::serialization_for_kind("file", format!("{}: {e}", self.path)))
    }
}

/// Fields shared by one-time and periodic instructions
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommonInstruction {
    /// Instruction name, also the output key
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    /// Image the command is extracted from
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,

    /// `KEY=value` environment
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,

    /// Command arguments
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Command to run
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub command: String,
}

/// Instruction run once per plan
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OneTimeInstruction {
    /// Command and environment
    #[serde(flatten)]
    pub common: CommonInstruction,

    /// Save stdout into `applied-output`
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub save_output: bool,
}

/// Instruction run forever at a fixed period
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PeriodicInstruction {
    /// Command and environment
    #[serde(flatten)]
    pub common: CommonInstruction,

    /// Period between runs
    #[serde(default, skip_serializing_if = "is_zero")]
    pub period_seconds: i64,

    /// Keep stderr alongside stdout
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub save_stderr_output: bool,
}

/// Latest result of a periodic instruction
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PeriodicInstructionOutput {
    /// Instruction name
    #[serde(default)]
    pub name: String,

    /// Captured stdout
    #[serde(default, with = "base64_bytes")]
    pub stdout: Vec<u8>,

    /// Captured stderr
    #[serde(default, with = "base64_bytes")]
    pub stderr: Vec<u8>,

    /// Exit code of the last run
    #[serde(default)]
    pub exit_code: i32,

    /// Time of the last successful run, empty if never
    #[serde(default)]
    pub last_successful_run_time: String,

    /// Consecutive failures
    #[serde(default)]
    pub failures: i32,

    /// Time of the last failed run
    #[serde(default)]
    pub last_failed_run_time: String,
}

/// HTTP health probe
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Probe {
    /// Seconds before the first check
    #[serde(default, skip_serializing_if = "is_zero")]
    pub initial_delay_seconds: i64,

    /// Per-check timeout
    #[serde(default, skip_serializing_if = "is_zero")]
    pub timeout_seconds: i64,

    /// Successes needed to turn healthy
    #[serde(default, skip_serializing_if = "is_zero")]
    pub success_threshold: i64,

    /// Failures needed to turn unhealthy
    #[serde(default, skip_serializing_if = "is_zero")]
    pub failure_threshold: i64,

    /// Request to issue
    #[serde(default, rename = "httpGet")]
    pub http_get: HttpGetAction,
}

/// HTTP GET performed by a probe
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpGetAction {
    /// Target URL
    #[serde(default)]
    pub url: String,

    /// Skip TLS verification
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub insecure: bool,

    /// Client certificate path
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub client_cert: String,

    /// Client key path
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub client_key: String,

    /// CA certificate path
    #[serde(default, rename = "caCert", skip_serializing_if = "String::is_empty")]
    pub ca_cert: String,
}

/// Probe result reported by the agent
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProbeStatus {
    /// Probe currently passes
    #[serde(default)]
    pub healthy: bool,

    /// Consecutive successes
    #[serde(default)]
    pub success_count: i64,

    /// Consecutive failures
    #[serde(default)]
    pub failure_count: i64,
}

/// Observed state of one machine, parsed from its plan secret
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Node {
    /// Plan currently assigned
    pub plan: NodePlan,
    /// Plan the agent last applied
    pub applied_plan: Option<NodePlan>,
    /// One-time instruction output keyed by instruction name
    pub output: BTreeMap<String, Vec<u8>>,
    /// Periodic instruction output keyed by instruction name
    pub periodic_output: BTreeMap<String, PeriodicInstructionOutput>,
    /// Applying the current plan failed past the threshold
    pub failed: bool,
    /// `plan` and `appliedPlan` are byte-identical
    pub in_sync: bool,
    /// Every reported probe is healthy
    pub healthy: bool,
    /// Reported probe results
    pub probe_status: BTreeMap<String, ProbeStatus>,
    /// Join URL of the server this node joined
    pub joined_to: String,
    /// The secret holds a non-empty plan
    pub plan_data_exists: bool,
    /// Probes passed at least once since the plan was written
    pub probes_usable: bool,
}

/// Labels and annotations of a plan secret
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Metadata {
    /// Secret labels
    pub labels: BTreeMap<String, String>,
    /// Secret annotations
    pub annotations: BTreeMap<String, String>,
}

impl Metadata {
    /// Annotation value, empty if absent
    pub fn annotation(&self, key: &str) -> &str {
        self.annotations.get(key).map(String::as_str).unwrap_or("")
    }

    /// Label value, empty if absent
    pub fn label(&self, key: &str) -> &str {
        self.labels.get(key).map(String::as_str).unwrap_or("")
    }
}

/// Whole-cluster snapshot for one `process` call, keyed by machine name
#[derive(Clone, Debug, Default)]
pub struct Plan {
    /// Machines owned by the cluster
    pub machines: BTreeMap<String, Machine>,
    /// Parsed plan secrets
    pub nodes: BTreeMap<String, Node>,
    /// Plan secret labels and annotations
    pub metadata: BTreeMap<String, Metadata>,
}

impl Plan {
    /// Write an entry's node and metadata back into the aggregate
    pub fn absorb(&mut self, entry: &PlanEntry) {
        let name = entry.name().to_string();
        match &entry.plan {
            Some(node) => {
                self.nodes.insert(name.clone(), node.clone());
            }
            None => {
                self.nodes.remove(&name);
            }
        }
        self.metadata.insert(name, entry.metadata.clone());
    }
}

/// Join of a machine with its parsed plan and secret metadata
#[derive(Clone, Debug)]
pub struct PlanEntry {
    /// CAPI machine
    pub machine: Machine,
    /// Parsed plan secret, `None` when no plan was written yet
    pub plan: Option<Node>,
    /// Plan secret labels and annotations
    pub metadata: Metadata,
}

impl PlanEntry {
    /// Machine name
    pub fn name(&self) -> &str {
        self.machine.metadata.name.as_deref().unwrap_or("")
    }
}

/// Tokens nodes use to join the cluster
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClusterTokens {
    /// Token servers join with
    pub server_token: String,
    /// Token agents join with
    pub agent_token: String,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let raw = Option::<String>::deserialize(d)?.unwrap_or_default();
        base64::engine::general_purpose::STANDARD
            .decode(raw)
            .map_err(serde::de::Error::custom)
    }
}
