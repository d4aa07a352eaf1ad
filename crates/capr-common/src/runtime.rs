//! Distro runtime helpers
//!
//! The distro (k3s or rke2) is derived from the Kubernetes version string,
//! and with it every unit name, binary path and port the plans reference.

use std::fmt;

use crate::crd::{RKEControlPlane, StackPreference};

/// Default provisioning data dir on nodes
pub const DEFAULT_PROVISIONING_DATA_DIR: &str = "/var/lib/rancher/capr";

/// Default system-agent data dir on nodes
pub const DEFAULT_SYSTEM_AGENT_DATA_DIR: &str = "/var/lib/rancher/agent";

/// Kubernetes distribution running on the nodes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Runtime {
    /// K3s
    K3s,
    /// RKE2
    Rke2,
}

impl Runtime {
    /// Runtime for a Kubernetes version (`v1.29.4+k3s1` is k3s, anything else rke2)
    pub fn from_version(kubernetes_version: &str) -> Self {
        if kubernetes_version.contains("k3s") {
            Runtime::K3s
        } else {
            Runtime::Rke2
        }
    }

    /// Lowercase name, also the binary name
    pub fn as_str(self) -> &'static str {
        match self {
            Runtime::K3s => "k3s",
            Runtime::Rke2 => "rke2",
        }
    }

    /// Uppercase name used in env var prefixes
    pub fn env_name(self) -> &'static str {
        match self {
            Runtime::K3s => "K3S",
            Runtime::Rke2 => "RKE2",
        }
    }

    /// systemd unit for server nodes
    pub fn server_unit(self) -> &'static str {
        match self {
            Runtime::K3s => "k3s",
            Runtime::Rke2 => "rke2-server",
        }
    }

    /// systemd unit for agent nodes
    pub fn agent_unit(self) -> &'static str {
        match self {
            Runtime::K3s => "k3s-agent",
            Runtime::Rke2 => "rke2-agent",
        }
    }

    /// Port agents use to join servers
    pub fn supervisor_port(self) -> u16 {
        match self {
            Runtime::K3s => 6443,
            Runtime::Rke2 => 9345,
        }
    }

    /// kubectl binary and kubeconfig path on server nodes
    pub fn kubectl_and_kubeconfig(self) -> (&'static str, &'static str) {
        match self {
            Runtime::K3s => ("/usr/local/bin/kubectl", "/etc/rancher/k3s/k3s.yaml"),
            Runtime::Rke2 => (
                "/var/lib/rancher/rke2/bin/kubectl",
                "/etc/rancher/rke2/rke2.yaml",
            ),
        }
    }

    /// Default distro data dir
    pub fn default_data_dir(self) -> String {
        format!("/var/lib/rancher/{}", self.as_str())
    }
}

impl fmt::Display for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl RKEControlPlane {
    /// Runtime of this control plane
    pub fn runtime(&self) -> Runtime {
        Runtime::from_version(&self.spec.kubernetes_version)
    }

    /// Distro data dir, honouring the override
    pub fn distro_data_dir(&self) -> String {
        let dir = &self.spec.data_directories.k8s_distro;
        if dir.is_empty() {
            self.runtime().default_data_dir()
        } else {
            dir.clone()
        }
    }

    /// Provisioning data dir, honouring the override
    pub fn provisioning_data_dir(&self) -> String {
        let dir = &self.spec.data_directories.provisioning;
        if dir.is_empty() {
            DEFAULT_PROVISIONING_DATA_DIR.to_string()
        } else {
            dir.clone()
        }
    }

    /// System-agent data dir, honouring the override
    pub fn system_agent_data_dir(&self) -> String {
        let dir = &self.spec.data_directories.system_agent;
        if dir.is_empty() {
            DEFAULT_SYSTEM_AGENT_DATA_DIR.to_string()
        } else {
            dir.clone()
        }
    }

    /// Loopback address matching the configured stack preference
    pub fn loopback_address(&self) -> &'static str {
        let preference = self
            .spec
            .networking
            .as_ref()
            .map(|n| n.stack_preference)
            .unwrap_or_default();
        match preference {
            StackPreference::Ipv4 => "127.0.0.1",
            StackPreference::Ipv6 => "[::1]",
            StackPreference::Dual => "localhost",
        }
    }
}
