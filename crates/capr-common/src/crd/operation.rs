//! Long-running operation records persisted on the control plane status
//!
//! Each operation kind keeps one [`Operation`] record: the request that
//! started it (compared by equality to detect a new request) and the current
//! phase. Phase transitions are validated against explicit tables so a
//! resumed reconcile can never skip or rewind a step. The only way back to an
//! initial phase is a changed request, which replaces the record.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::Error;

/// A phase enum with an explicit transition table
pub trait Phase: Copy + Eq + std::fmt::Debug + 'static {
    /// Phase a fresh request starts in
    const INITIAL: Self;

    /// Phases reachable from `self` in one step
    fn allowed_next(self) -> &'static [Self];

    /// True if no further transitions are allowed
    fn is_terminal(self) -> bool {
        self.allowed_next().is_empty()
    }

    /// True if `next` is `self` or reachable in one step
    fn can_transition_to(self, next: Self) -> bool {
        self == next || self.allowed_next().contains(&next)
    }
}

/// Persisted record of one long-running operation
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Operation<R, P> {
    /// Copy of the spec request this record tracks
    pub request: R,
    /// Current phase
    pub phase: P,
}

impl<R: PartialEq + Clone, P: Phase> Operation<R, P> {
    /// Start tracking a request in its initial phase
    pub fn start(request: R) -> Self {
        Self {
            request,
            phase: P::INITIAL,
        }
    }

    /// True if this record tracks exactly `request`
    pub fn tracks(&self, request: &R) -> bool {
        &self.request == request
    }

    /// Move to `next`, rejecting transitions outside the table
    pub fn advance(&mut self, next: P) -> Result<(), Error> {
        if !self.phase.can_transition_to(next) {
            return Err(Error::internal_with_context(
                "operation",
                format!("invalid phase transition {:?} -> {:?}", self.phase, next),
            ));
        }
        self.phase = next;
        Ok(())
    }
}

/// Encryption key rotation phases
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum EncryptionKeyRotationPhase {
    /// Leader runs `secrets-encrypt prepare`
    Prepare,
    /// Servers restart to pick up the prepared key
    PostPrepareRestart,
    /// Leader runs `secrets-encrypt rotate`
    Rotate,
    /// Servers restart to pick up the rotated key
    PostRotateRestart,
    /// Leader runs `secrets-encrypt reencrypt`
    Reencrypt,
    /// Servers restart after reencryption
    PostReencryptRestart,
    /// Rotation complete
    Done,
    /// Terminal failure; recovery requires an etcd restore
    Failed,
}

impl Phase for EncryptionKeyRotationPhase {
    const INITIAL: Self = Self::Prepare;

    fn allowed_next(self) -> &'static [Self] {
        use EncryptionKeyRotationPhase::*;
        match self {
            Prepare => &[PostPrepareRestart, Failed],
            PostPrepareRestart => &[Rotate, Failed],
            Rotate => &[PostRotateRestart, Failed],
            PostRotateRestart => &[Reencrypt, Failed],
            Reencrypt => &[PostReencryptRestart, Failed],
            PostReencryptRestart => &[Done, Failed],
            Done | Failed => &[],
        }
    }
}

impl EncryptionKeyRotationPhase {
    /// True for every phase between Prepare and PostReencryptRestart
    pub fn in_progress(self) -> bool {
        !matches!(self, Self::Done | Self::Failed)
    }
}

impl std::fmt::Display for EncryptionKeyRotationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Etcd snapshot creation phases
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum EtcdSnapshotCreatePhase {
    /// Snapshot instructions are being delivered to every etcd machine
    Started,
    /// Etcd machines are returned to their regular plans
    RestartCluster,
    /// Snapshot complete
    Finished,
    /// At least one machine failed to snapshot
    Failed,
}

impl Phase for EtcdSnapshotCreatePhase {
    const INITIAL: Self = Self::Started;

    fn allowed_next(self) -> &'static [Self] {
        use EtcdSnapshotCreatePhase::*;
        match self {
            Started => &[RestartCluster, Failed],
            RestartCluster => &[Finished],
            Finished | Failed => &[],
        }
    }
}

/// Etcd snapshot restore phases
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum EtcdSnapshotRestorePhase {
    /// Request accepted; waiting for an init node candidate
    Started,
    /// Runtime stopped and etcd tombstoned on every machine
    Shutdown,
    /// Cluster reset delivered to the designated init node
    Restore,
    /// Stale system pods deleted
    PostRestorePodCleanup,
    /// First full reconcile after the reset
    InitialRestartCluster,
    /// Nodes that no longer have machines deleted
    PostRestoreNodeCleanup,
    /// Final full reconcile
    RestartCluster,
    /// Restore complete
    Finished,
}

impl Phase for EtcdSnapshotRestorePhase {
    const INITIAL: Self = Self::Started;

    fn allowed_next(self) -> &'static [Self] {
        use EtcdSnapshotRestorePhase::*;
        match self {
            Started => &[Shutdown],
            Shutdown => &[Restore],
            Restore => &[PostRestorePodCleanup],
            PostRestorePodCleanup => &[InitialRestartCluster],
            InitialRestartCluster => &[PostRestoreNodeCleanup],
            PostRestoreNodeCleanup => &[RestartCluster],
            RestartCluster => &[Finished],
            Finished => &[],
        }
    }
}
