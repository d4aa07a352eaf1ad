//! Common types for the capr planner: CRDs, errors, naming and runtime helpers

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod naming;
pub mod retry;
pub mod runtime;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Label on machines and plan secrets naming the owning cluster
pub const CLUSTER_NAME_LABEL: &str = "rke.cattle.io/cluster-name";

/// CAPI label naming the owning cluster
pub const CAPI_CLUSTER_NAME_LABEL: &str = "cluster.x-k8s.io/cluster-name";

/// Machine label marking the etcd role
pub const ETCD_ROLE_LABEL: &str = "rke.cattle.io/etcd-role";

/// Machine label marking the control plane role
pub const CONTROL_PLANE_ROLE_LABEL: &str = "rke.cattle.io/control-plane-role";

/// Machine label marking the worker role
pub const WORKER_ROLE_LABEL: &str = "rke.cattle.io/worker-role";

/// Machine label carrying the operating system
pub const CATTLE_OS_LABEL: &str = "cattle.io/os";

/// Value of [`CATTLE_OS_LABEL`] for Windows machines
pub const WINDOWS_OS: &str = "windows";

/// Plan secret label marking the elected init node
pub const INIT_NODE_LABEL: &str = "rke.cattle.io/init-node";

/// Control plane label pinning the init node to a machine ID
pub const INIT_NODE_MACHINE_ID_LABEL: &str = "rke.cattle.io/init-node-machine-id";

/// Control plane label set once a pinned init node has been honoured
pub const INIT_NODE_MACHINE_ID_DONE_LABEL: &str = "rke.cattle.io/init-node-machine-id-done";

/// Machine/snapshot label with the machine ID
pub const MACHINE_ID_LABEL: &str = "rke.cattle.io/machine-id";

/// Machine label with the name of the node it registered
pub const NODE_NAME_LABEL: &str = "rke.cattle.io/node-name";

/// Node label carrying the machine UID
pub const MACHINE_UID_LABEL: &str = "rke.cattle.io/machine";

/// Plan secret annotation with the URL other nodes join through
pub const JOIN_URL_ANNOTATION: &str = "rke.cattle.io/join-url";

/// Plan secret annotation with the URL this node joined
pub const JOINED_TO_ANNOTATION: &str = "rke.cattle.io/joined-to";

/// Plan secret annotation disabling join URL discovery
pub const JOIN_URL_AUTOSET_DISABLED: &str = "rke.cattle.io/join-url-autoset-disabled";

/// Machine annotation with a user-provided external address
pub const ADDRESS_ANNOTATION: &str = "rke.cattle.io/address";

/// Machine annotation with a user-provided internal address
pub const INTERNAL_ADDRESS_ANNOTATION: &str = "rke.cattle.io/internal-address";

/// Machine annotation with JSON-encoded extra node labels
pub const LABELS_ANNOTATION: &str = "rke.cattle.io/labels";

/// Machine annotation with JSON-encoded extra node taints
pub const TAINTS_ANNOTATION: &str = "rke.cattle.io/taints";

/// Plan secret annotation requesting a drain (JSON drain options)
pub const DRAIN_ANNOTATION: &str = "rke.cattle.io/drain-options";

/// Plan secret annotation written when a drain completes
pub const DRAIN_DONE_ANNOTATION: &str = "rke.cattle.io/drain-done";

/// Plan secret annotation written when a drain fails
pub const DRAIN_ERROR_ANNOTATION: &str = "rke.cattle.io/drain-error";

/// Plan secret annotation requesting an uncordon
pub const UNCORDON_ANNOTATION: &str = "rke.cattle.io/uncordon";

/// Plan secret annotation with the pending pre-drain hook value
pub const PRE_DRAIN_ANNOTATION: &str = "rke.cattle.io/pre-drain";

/// Plan secret annotation with the pending post-drain hook value
pub const POST_DRAIN_ANNOTATION: &str = "rke.cattle.io/post-drain";

/// Plan secret annotation stamped on every plan write (RFC3339 UTC)
pub const PLAN_UPDATED_TIME_ANNOTATION: &str = "rke.cattle.io/plan-last-updated";

/// Plan secret annotation set once probes passed for the current plan
pub const PLAN_PROBES_PASSED_ANNOTATION: &str = "rke.cattle.io/plan-probes-passed";

/// Secret annotation listing clusters allowed to read it
pub const AUTHORIZED_OBJECT_ANNOTATION: &str = "rke.cattle.io/object-authorized-for-clusters";

/// RKEBootstrap annotation skipping safe etcd member removal
pub const FORCE_REMOVE_ETCD_ANNOTATION: &str = "rke.cattle.io/etcd-force-remove";

/// CAPI machine annotation excluding the node from draining
pub const EXCLUDE_NODE_DRAINING_ANNOTATION: &str = "machine.cluster.x-k8s.io/exclude-node-draining";

/// Annotation pausing CAPI reconciliation of an object
pub const PAUSED_ANNOTATION: &str = "cluster.x-k8s.io/paused";

/// Secret type of per-machine plan records
pub const SECRET_TYPE_MACHINE_PLAN: &str = "rke.cattle.io/machine-plan";

/// Secret type of the cluster token record
pub const SECRET_TYPE_CLUSTER_STATE: &str = "rke.cattle.io/cluster-state";

/// Join URL value for a node that must not pick a join server yet
pub const JOIN_SERVER_IMPLAUSIBLE: &str = "implausible";

/// True for label and annotation keys the planner copies onto plan secrets
pub fn is_managed_metadata_key(key: &str) -> bool {
    key.starts_with("rke.cattle.io/")
        || key.starts_with("cluster.x-k8s.io/")
        || key.starts_with("machine.cluster.x-k8s.io/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_managed_metadata_keys() {
        assert!(is_managed_metadata_key(INIT_NODE_LABEL));
        assert!(is_managed_metadata_key(EXCLUDE_NODE_DRAINING_ANNOTATION));
        assert!(is_managed_metadata_key(CAPI_CLUSTER_NAME_LABEL));
        assert!(!is_managed_metadata_key("app.kubernetes.io/name"));
        assert!(!is_managed_metadata_key("cattle.io/os"));
    }
}
