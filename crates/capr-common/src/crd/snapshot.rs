//! ETCDSnapshot records written by the snapshot sync controller
//!
//! Unlike most CRDs the snapshot file lives at the top level of the object,
//! beside `spec`, so the resource is described by hand rather than derived.

use std::borrow::Cow;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::NamespaceResourceScope;
use kube::Resource;
use serde::{Deserialize, Serialize};

use super::control_plane::EtcdS3;

/// ETCDSnapshot object (`rke.cattle.io/v1`)
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ETCDSnapshot {
    /// Standard object metadata
    #[serde(default)]
    pub metadata: ObjectMeta,

    /// Owning cluster
    #[serde(default)]
    pub spec: ETCDSnapshotSpec,

    /// Snapshot file details
    #[serde(default)]
    pub snapshot_file: ETCDSnapshotFile,
}

/// Spec of an ETCDSnapshot
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ETCDSnapshotSpec {
    /// Provisioning cluster name
    #[serde(default)]
    pub cluster_name: String,
}

/// Snapshot file as reported by the distro
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ETCDSnapshotFile {
    /// File name passed to `--cluster-reset-restore-path`
    #[serde(default)]
    pub name: String,
    /// Node that took a local snapshot
    #[serde(default)]
    pub node_name: String,
    /// Snapshot URI
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub location: String,
    /// Base64 JSON map of snapshot metadata
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub metadata: String,
    /// Set for snapshots stored in S3
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3: Option<EtcdS3>,
    /// Snapshot status (successful/failed)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
    /// Failure message
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl Resource for ETCDSnapshot {
    type DynamicType = ();
    type Scope = NamespaceResourceScope;

    fn kind(_: &()) -> Cow<'_, str> {
        "ETCDSnapshot".into()
    }

    fn group(_: &()) -> Cow<'_, str> {
        "rke.cattle.io".into()
    }

    fn version(_: &()) -> Cow<'_, str> {
        "v1".into()
    }

    fn plural(_: &()) -> Cow<'_, str> {
        "etcdsnapshots".into()
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl ETCDSnapshot {
    /// True for snapshots stored in S3 rather than on a node
    pub fn is_s3(&self) -> bool {
        self.snapshot_file.s3.is_some()
    }
}
