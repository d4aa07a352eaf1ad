//! Planner-wide configuration
//!
//! Everything cluster-specific lives on the RKEControlPlane; this only holds
//! knobs that apply to every cluster the planner serves.

use serde::{Deserialize, Serialize};

use capr_common::retry::RetryConfig;

/// Default installer image prefix; the runtime and version are appended
pub const DEFAULT_SYSTEM_AGENT_IMAGE: &str = "rancher/system-agent-installer-";

/// Failure budget written alongside a plan
///
/// `max_failures` is how many failed applies the agent attempts before
/// giving up; `failure_threshold` is how many it tolerates before the plan
/// counts as failed. `-1` means unlimited; `0` leaves the agent default.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureLimits {
    /// Maximum apply attempts
    pub max_failures: i32,
    /// Failures tolerated before the plan is failed
    pub failure_threshold: i32,
}

impl FailureLimits {
    /// Construct a budget
    pub const fn new(max_failures: i32, failure_threshold: i32) -> Self {
        Self {
            max_failures,
            failure_threshold,
        }
    }
}

/// Configuration shared by every reconcile
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlannerConfig {
    /// Installer image prefix used when the info provider returns none
    pub system_agent_image: String,
    /// Backoff while waiting for a plan secret to be created
    pub plan_secret_poll: RetryConfig,
    /// Budget for encryption key rotation steps on followers
    pub encryption_key_rotation: FailureLimits,
    /// Budget for the encryption key rotation leader's commands
    pub encryption_key_rotation_leader: FailureLimits,
    /// Budget for server plans delivered during an etcd restore
    pub etcd_restore: FailureLimits,
    /// Budget for the on-demand snapshot save on each etcd machine
    pub etcd_snapshot_create: FailureLimits,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            system_agent_image: DEFAULT_SYSTEM_AGENT_IMAGE.to_string(),
            plan_secret_poll: RetryConfig::default(),
            encryption_key_rotation: FailureLimits::new(5, 5),
            encryption_key_rotation_leader: FailureLimits::new(1, 1),
            etcd_restore: FailureLimits::new(5, 5),
            etcd_snapshot_create: FailureLimits::new(3, 3),
        }
    }
}

impl PlannerConfig {
    /// Load from `CAPR_*` environment variables over the defaults
    ///
    /// Unset or unparsable variables keep their default.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(image) = std::env::var("CAPR_SYSTEM_AGENT_IMAGE") {
            if !image.is_empty() {
                config.system_agent_image = image;
            }
        }
        if let Some(attempts) = env_parse("CAPR_PLAN_SECRET_POLL_ATTEMPTS") {
            config.plan_secret_poll.max_attempts = attempts;
        }
        if let Some(limits) = env_limits("CAPR_ENCRYPTION_KEY_ROTATION") {
            config.encryption_key_rotation = limits;
        }
        if let Some(limits) = env_limits("CAPR_ENCRYPTION_KEY_ROTATION_LEADER") {
            config.encryption_key_rotation_leader = limits;
        }
        if let Some(limits) = env_limits("CAPR_ETCD_RESTORE") {
            config.etcd_restore = limits;
        }
        if let Some(limits) = env_limits("CAPR_ETCD_SNAPSHOT_CREATE") {
            config.etcd_snapshot_create = limits;
        }
        config
    }

    /// Full installer image for the control plane's runtime and version
    ///
    /// `+` is not valid in an image tag, so `v1.29.4+rke2r1` becomes
    /// `v1.29.4-rke2r1`.
    pub fn installer_image(&self, prefix: &str, runtime: &str, version: &str) -> String {
        let prefix = if prefix.is_empty() {
            self.system_agent_image.as_str()
        } else {
            prefix
        };
        format!("{prefix}{runtime}:{}", version.replace('+', "-"))
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.trim().parse().ok()
}

/// Reads `<PREFIX>_MAX_FAILURES` and `<PREFIX>_FAILURE_THRESHOLD` as a pair
fn env_limits(prefix: &str) -> Option<FailureLimits> {
    let max_failures = env_parse(&format!("{prefix}_MAX_FAILURES"))?;
    let failure_threshold = env_parse(&format!("{prefix}_FAILURE_THRESHOLD"))?;
    Some(FailureLimits::new(max_failures, failure_threshold))
}
