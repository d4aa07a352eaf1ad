//! Role-appropriate health probes
//!
//! Probe URLs and TLS material follow the rendered distro config, so a user
//! moving a component's `secure-port` or `cert-dir` moves its probe too.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use serde_json::Value;

use capr_common::crd::{GenericMap, RKEControlPlane};
use capr_common::runtime::Runtime;

use crate::config::{
    get_arg_value, to_string_slice, CERT_DIR_ARGUMENT, DEFAULT_KUBE_CONTROLLER_MANAGER_CERT,
    DEFAULT_KUBE_CONTROLLER_MANAGER_CERT_DIR, DEFAULT_KUBE_CONTROLLER_MANAGER_SECURE_PORT,
    DEFAULT_KUBE_SCHEDULER_CERT, DEFAULT_KUBE_SCHEDULER_CERT_DIR,
    DEFAULT_KUBE_SCHEDULER_SECURE_PORT, KUBE_CONTROLLER_MANAGER_ARG, KUBE_SCHEDULER_ARG,
    SECURE_PORT_ARGUMENT, TLS_CERT_FILE_ARGUMENT,
};
use crate::filters::{is_control_plane, is_etcd};
use crate::plan::{HttpGetAction, PlanEntry, Probe};

const CALICO: &str = "calico";
const ETCD: &str = "etcd";
const KUBE_APISERVER: &str = "kube-apiserver";
const KUBE_CONTROLLER_MANAGER: &str = "kube-controller-manager";
const KUBE_SCHEDULER: &str = "kube-scheduler";
const KUBELET: &str = "kubelet";

/// Probe templates; `{LOOPBACK}`, `{PORT}` and `{DATA_DIR}` are substituted
static TEMPLATES: LazyLock<BTreeMap<&'static str, Probe>> = LazyLock::new(|| {
    let probe = |url: &str, ca: &str, cert: &str, key: &str| Probe {
        initial_delay_seconds: 1,
        timeout_seconds: 5,
        success_threshold: 1,
        failure_threshold: 2,
        http_get: HttpGetAction {
            url: url.to_string(),
            ca_cert: ca.to_string(),
            client_cert: cert.to_string(),
            client_key: key.to_string(),
            insecure: false,
        },
    };
    BTreeMap::from([
        (CALICO, probe("http://127.0.0.1:9099/liveness", "", "", "")),
        (ETCD, probe("http://{LOOPBACK}:2381/health", "", "", "")),
        (
            KUBE_APISERVER,
            probe(
                "https://{LOOPBACK}:6443/readyz",
                "{DATA_DIR}/server/tls/server-ca.crt",
                "{DATA_DIR}/server/tls/client-kube-apiserver.crt",
                "{DATA_DIR}/server/tls/client-kube-apiserver.key",
            ),
        ),
        (
            KUBE_SCHEDULER,
            probe("https://{LOOPBACK}:{PORT}/healthz", "", "", ""),
        ),
        (
            KUBE_CONTROLLER_MANAGER,
            probe("https://{LOOPBACK}:{PORT}/healthz", "", "", ""),
        ),
        (KUBELET, probe("http://{LOOPBACK}:10248/healthz", "", "", "")),
    ])
});

struct Substitutions<'a> {
    loopback: &'a str,
    data_dir: &'a str,
    port: String,
}

impl Substitutions<'_> {
    fn apply(&self, s: &str) -> String {
        s.replace("{LOOPBACK}", self.loopback)
            .replace("{DATA_DIR}", self.data_dir)
            .replace("{PORT}", &self.port)
    }
}

fn render(name: &str, subs: &Substitutions<'_>) -> Option<Probe> {
    let mut probe = TEMPLATES.get(name)?.clone();
    probe.http_get.url = subs.apply(&probe.http_get.url);
    probe.http_get.ca_cert = subs.apply(&probe.http_get.ca_cert);
    probe.http_get.client_cert = subs.apply(&probe.http_get.client_cert);
    probe.http_get.client_key = subs.apply(&probe.http_get.client_key);
    Some(probe)
}

/// Secure port and serving CA of a control-plane component
///
/// `tls-cert-file` wins over `cert-dir`, which wins over the default dir.
fn component_port_and_ca(
    config: &GenericMap,
    arg_key: &str,
    data_dir: &str,
    default_port: &str,
    default_cert_dir: &str,
    default_cert: &str,
) -> (String, String) {
    let args = to_string_slice(config.get(arg_key));
    let port = get_arg_value(&args, SECURE_PORT_ARGUMENT, "=")
        .unwrap_or_else(|| default_port.to_string());
    let ca = match get_arg_value(&args, TLS_CERT_FILE_ARGUMENT, "=") {
        Some(cert_file) => cert_file,
        None => {
            let dir = get_arg_value(&args, CERT_DIR_ARGUMENT, "=")
                .unwrap_or_else(|| format!("{data_dir}/{default_cert_dir}"));
            format!("{dir}/{default_cert}")
        }
    };
    (port, ca)
}

fn uses_calico(config: &GenericMap, runtime: Runtime) -> bool {
    match config.get("cni") {
        Some(Value::String(cni)) => cni == "calico" || cni == "calico+multus",
        Some(Value::Array(cnis)) => cnis.first().and_then(Value::as_str) == Some("calico"),
        Some(_) => false,
        None => runtime == Runtime::Rke2,
    }
}

/// Probes for an entry, given its rendered distro config
pub fn probes(
    control_plane: &RKEControlPlane,
    entry: &PlanEntry,
    config: &GenericMap,
) -> BTreeMap<String, Probe> {
    let data_dir = control_plane.distro_data_dir();
    let mut subs = Substitutions {
        loopback: control_plane.loopback_address(),
        data_dir: &data_dir,
        port: String::new(),
    };
    let mut out = BTreeMap::new();
    let mut add = |name: &str, subs: &Substitutions<'_>, ca_override: Option<String>| {
        if let Some(mut probe) = render(name, subs) {
            if let Some(ca) = ca_override {
                probe.http_get.ca_cert = ca;
            }
            out.insert(name.to_string(), probe);
        }
    };

    if is_etcd(entry) {
        add(ETCD, &subs, None);
    }
    if is_control_plane(entry) {
        add(KUBE_APISERVER, &subs, None);

        let (port, ca) = component_port_and_ca(
            config,
            KUBE_CONTROLLER_MANAGER_ARG,
            &data_dir,
            DEFAULT_KUBE_CONTROLLER_MANAGER_SECURE_PORT,
            DEFAULT_KUBE_CONTROLLER_MANAGER_CERT_DIR,
            DEFAULT_KUBE_CONTROLLER_MANAGER_CERT,
        );
        subs.port = port;
        add(KUBE_CONTROLLER_MANAGER, &subs, Some(ca));

        let (port, ca) = component_port_and_ca(
            config,
            KUBE_SCHEDULER_ARG,
            &data_dir,
            DEFAULT_KUBE_SCHEDULER_SECURE_PORT,
            DEFAULT_KUBE_SCHEDULER_CERT_DIR,
            DEFAULT_KUBE_SCHEDULER_CERT,
        );
        subs.port = port;
        add(KUBE_SCHEDULER, &subs, Some(ca));
    }
    add(KUBELET, &subs, None);
    if uses_calico(config, control_plane.runtime()) {
        add(CALICO, &subs, None);
    }
    out
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;
    use crate::filters::tests::entry;

    fn control_plane(version: &str) -> RKEControlPlane {
        let mut cp = RKEControlPlane::new("prod", Default::default());
        cp.spec.kubernetes_version = version.to_string();
        cp
    }

    #[rstest]
    #[case::etcd_only(&["etcd"], &["etcd", "kubelet"])]
    #[case::cp_only(&["cp"], &["kube-apiserver", "kube-controller-manager", "kube-scheduler", "kubelet"])]
    #[case::worker(&["worker"], &["kubelet"])]
    fn test_probe_selection_by_role(#[case] roles: &[&str], #[case] expected: &[&str]) {
        let cp = control_plane("v1.29.4+k3s1");
        let got = probes(&cp, &entry("m", roles), &GenericMap::new());
        let names: Vec<_> = got.keys().map(String::as_str).collect();
        assert_eq!(names, expected);
    }

    #[test]
    fn test_rke2_defaults_to_calico_probe() {
        let cp = control_plane("v1.29.4+rke2r1");
        let got = probes(&cp, &entry("w", &["worker"]), &GenericMap::new());
        assert!(got.contains_key(CALICO));

        let mut config = GenericMap::new();
        config.insert("cni".to_string(), json!("cilium"));
        let got = probes(&cp, &entry("w", &["worker"]), &config);
        assert!(!got.contains_key(CALICO));
    }

    #[test]
    fn test_apiserver_probe_uses_data_dir_certs() {
        let cp = control_plane("v1.29.4+rke2r1");
        let got = probes(&cp, &entry("m", &["cp"]), &GenericMap::new());
        let apiserver = &got[KUBE_APISERVER].http_get;
        assert_eq!(apiserver.url, "https://127.0.0.1:6443/readyz");
        assert_eq!(apiserver.ca_cert, "/var/lib/rancher/rke2/server/tls/server-ca.crt");
        assert_eq!(
            apiserver.client_key,
            "/var/lib/rancher/rke2/server/tls/client-kube-apiserver.key"
        );
    }

    /// Story: a user moves the controller manager to another port and cert
    /// dir, and the scheduler to an explicit serving cert; the probes follow.
    #[test]
    fn story_user_overridden_component_args() {
        let cp = control_plane("v1.29.4+k3s1");
        let mut config = GenericMap::new();
        config.insert(
            KUBE_CONTROLLER_MANAGER_ARG.to_string(),
            json!(["secure-port=11257", "cert-dir=/custom"]),
        );
        config.insert(
            KUBE_SCHEDULER_ARG.to_string(),
            json!(["tls-cert-file=/certs/ks.crt"]),
        );
        let got = probes(&cp, &entry("m", &["cp"]), &config);

        let kcm = &got[KUBE_CONTROLLER_MANAGER].http_get;
        assert_eq!(kcm.url, "https://127.0.0.1:11257/healthz");
        assert_eq!(kcm.ca_cert, "/custom/kube-controller-manager.crt");

        let ks = &got[KUBE_SCHEDULER].http_get;
        assert_eq!(ks.url, "https://127.0.0.1:10259/healthz");
        assert_eq!(ks.ca_cert, "/certs/ks.crt");
    }

    #[test]
    fn test_probe_thresholds() {
        let cp = control_plane("v1.29.4+k3s1");
        let got = probes(&cp, &entry("m", &["etcd"]), &GenericMap::new());
        let etcd = &got[ETCD];
        assert_eq!(
            (
                etcd.initial_delay_seconds,
                etcd.timeout_seconds,
                etcd.success_threshold,
                etcd.failure_threshold
            ),
            (1, 5, 1, 2)
        );
        assert_eq!(etcd.http_get.url, "http://127.0.0.1:2381/health");
    }
}
