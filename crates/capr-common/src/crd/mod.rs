//! Custom Resource Definitions read and written by the planner
//!
//! The control plane CRD is owned by this project. The CAPI and snapshot
//! types are partial views of objects owned by other controllers.

mod capi;
pub mod conditions;
mod control_plane;
pub mod operation;
mod snapshot;

pub use capi::{
    Bootstrap, Cluster, ClusterSpec, ClusterStatus, Machine, MachineAddress, MachineAddressType,
    machine_deletion_status, MachineSpec, MachineStatus, RKEBootstrap, RKEBootstrapSpec,
    DELETE_MACHINE_ERROR, RKE_BOOTSTRAP_KIND,
};
pub use conditions::{Condition, ConditionStatus, Conditions};
pub use control_plane::{
    DataDirectories, DrainHook, DrainOptions, EnvVar, EtcdConfig, EtcdS3, EtcdSnapshotCreate,
    EtcdSnapshotRestore, GenericMap, KeyToPath, LocalClusterAuthEndpoint, Mirror, Networking,
    ObjectFileSource, ProvisioningFileSource, ProvisioningFiles, RKEControlPlane,
    RKEControlPlaneSpec, RKEControlPlaneStatus, Registry, RegistryConfig, RotateCertificates,
    RotateEncryptionKeys, StackPreference, SystemConfig, UpgradeStrategy,
};
pub use operation::{
    EncryptionKeyRotationPhase, EtcdSnapshotCreatePhase, EtcdSnapshotRestorePhase, Operation,
    Phase,
};
pub use snapshot::{ETCDSnapshot, ETCDSnapshotFile, ETCDSnapshotSpec};
