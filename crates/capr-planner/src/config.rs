//! Distro config rendering
//!
//! Builds the `50-rancher.yaml` drop-in for one machine as a JSON value bag,
//! plus every file the config references (audit policy, cloud provider
//! config, registries, user-selected files). Keys the release does not know
//! about are filtered out before role-specific keys are layered on, so user
//! config can never smuggle in flags the distro would reject.

use std::collections::BTreeMap;

use aws_lc_rs::digest::{Context, SHA256};
use base64::Engine;
use k8s_openapi::api::core::v1::Taint;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::ResourceExt;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use capr_common::crd::{GenericMap, ObjectFileSource, RKEControlPlane};
use capr_common::naming::hex_encode;
use capr_common::runtime::Runtime;
use capr_common::{
    Error, ADDRESS_ANNOTATION, AUTHORIZED_OBJECT_ANNOTATION, INTERNAL_ADDRESS_ANNOTATION,
    JOINED_TO_ANNOTATION, JOIN_SERVER_IMPLAUSIBLE, LABELS_ANNOTATION, MACHINE_UID_LABEL,
    NODE_NAME_LABEL, TAINTS_ANNOTATION,
};

use crate::client::{ReleaseData, SecretReader};
use crate::filters::{
    is_control_plane, is_etcd, is_init_node, is_only_control_plane, is_only_etcd, is_only_worker,
    is_worker,
};
use crate::plan::{ClusterTokens, File, NodePlan, PlanEntry};
use crate::registries::RenderedRegistries;
use crate::s3;

/// kube-controller-manager extra args key
pub const KUBE_CONTROLLER_MANAGER_ARG: &str = "kube-controller-manager-arg";
/// kube-controller-manager extra mounts key (rke2 only)
pub const KUBE_CONTROLLER_MANAGER_EXTRA_MOUNT: &str = "kube-controller-manager-extra-mount";
/// Cert dir of kube-controller-manager, relative to the distro data dir
pub const DEFAULT_KUBE_CONTROLLER_MANAGER_CERT_DIR: &str = "server/tls/kube-controller-manager";
/// Default kube-controller-manager secure port
pub const DEFAULT_KUBE_CONTROLLER_MANAGER_SECURE_PORT: &str = "10257";
/// Serving cert of kube-controller-manager inside its cert dir
pub const DEFAULT_KUBE_CONTROLLER_MANAGER_CERT: &str = "kube-controller-manager.crt";
/// kube-scheduler extra args key
pub const KUBE_SCHEDULER_ARG: &str = "kube-scheduler-arg";
/// kube-scheduler extra mounts key (rke2 only)
pub const KUBE_SCHEDULER_EXTRA_MOUNT: &str = "kube-scheduler-extra-mount";
/// Cert dir of kube-scheduler, relative to the distro data dir
pub const DEFAULT_KUBE_SCHEDULER_CERT_DIR: &str = "server/tls/kube-scheduler";
/// Default kube-scheduler secure port
pub const DEFAULT_KUBE_SCHEDULER_SECURE_PORT: &str = "10259";
/// Serving cert of kube-scheduler inside its cert dir
pub const DEFAULT_KUBE_SCHEDULER_CERT: &str = "kube-scheduler.crt";
/// `--secure-port`
pub const SECURE_PORT_ARGUMENT: &str = "secure-port";
/// `--cert-dir`
pub const CERT_DIR_ARGUMENT: &str = "cert-dir";
/// `--tls-cert-file`
pub const TLS_CERT_FILE_ARGUMENT: &str = "tls-cert-file";

const AUTHN_WEBHOOK_FILE_NAME: &str = "kube-api-authn-webhook.yaml";

const AUDIT_POLICY_ARG: &str = "audit-policy-file";
const CLOUD_PROVIDER_CONFIG_ARG: &str = "cloud-provider-config";
const PRIVATE_REGISTRY_ARG: &str = "private-registry";
const FLANNEL_CONF_ARG: &str = "flannel-conf";

/// Config keys whose value is file content, materialized as files on the node
const FILE_PARAMS: [&str; 4] = [
    AUDIT_POLICY_ARG,
    CLOUD_PROVIDER_CONFIG_ARG,
    PRIVATE_REGISTRY_ARG,
    FLANNEL_CONF_ARG,
];

/// Keys that don't change what runs on a node and so never justify a drain
const DRAIN_IRRELEVANT_KEYS: [&str; 5] = ["server", "token", "agent-token", "node-label", "node-taint"];

const AUTHN_WEBHOOK: &str = r#"
apiVersion: v1
kind: Config
clusters:
- name: Default
  cluster:
    insecure-skip-tls-verify: true
    server: http://{LOOPBACK}:6440/v1/authenticate
users:
- name: Default
  user:
    insecure-skip-tls-verify: true
current-context: webhook
contexts:
- name: webhook
  context:
    user: Default
    cluster: Default
"#;

/// Inputs shared by the renderers for one machine
#[derive(Clone, Copy)]
pub struct RenderContext<'a> {
    /// Control plane being rendered
    pub control_plane: &'a RKEControlPlane,
    /// Release allow-lists for the control plane's version
    pub release: &'a ReleaseData,
    /// Reader for user-referenced secrets and configmaps
    pub secrets: &'a dyn SecretReader,
}

/// Output of [`add_config_file`]
#[derive(Clone, Debug)]
pub struct RenderedConfig {
    /// Plan with the config file and referenced files appended
    pub plan: NodePlan,
    /// The rendered config, after pruning
    pub config: GenericMap,
    /// Server the config joins, `-` for the init node
    pub joined_server: String,
}

/// Path of the distro config drop-in
pub fn distro_config_path(runtime: Runtime) -> String {
    format!("/etc/rancher/{runtime}/config.yaml.d/50-rancher.yaml")
}

/// True for the distro config drop-in of either runtime
pub fn is_distro_config_path(path: &str) -> bool {
    path.contains("/etc/rancher/") && path.ends_with("/config.yaml.d/50-rancher.yaml")
}

/// Path of a file referenced from the config
pub fn config_file(control_plane: &RKEControlPlane, filename: &str) -> String {
    if filename == PRIVATE_REGISTRY_ARG {
        return format!("/etc/rancher/{}/registries.yaml", control_plane.runtime());
    }
    format!(
        "{}/etc/config-files/{filename}",
        control_plane.distro_data_dir()
    )
}

/// Render the distro config for an entry and append it to the plan
///
/// `join_server` is the URL this node should join; empty means "whatever
/// it joined before". A non-init node with neither is implausible and
/// rejected, since rendering it would point the node at nothing.
pub async fn add_config_file(
    ctx: RenderContext<'_>,
    mut plan: NodePlan,
    entry: &PlanEntry,
    tokens: &ClusterTokens,
    join_server: &str,
    registries: &RenderedRegistries,
    render_s3: bool,
) -> Result<RenderedConfig, Error> {
    let cp = ctx.control_plane;
    let mut config = GenericMap::new();

    add_defaults(&mut config, cp);
    // filters everything rendered so far, so it must run before role config
    add_user_config(&mut config, ctx, entry)?;

    let etcd_files = add_etcd(&mut config, ctx, entry, render_s3).await?;
    plan.files.extend(etcd_files);

    let joined_server = add_role_config(&mut config, cp, entry, join_server);
    if joined_server == JOIN_SERVER_IMPLAUSIBLE {
        return Err(Error::internal_with_context(
            "config",
            format!("implausible joined server for entry {}", entry.name()),
        ));
    }

    add_local_cluster_auth_endpoint_config(&mut config, cp, entry);
    add_token(&mut config, entry, tokens);
    add_addresses(&mut config, entry);
    add_labels(&mut config, entry)?;
    add_taints(&mut config, entry, cp.runtime())?;

    for param in FILE_PARAMS {
        let content: Vec<u8> = if param == PRIVATE_REGISTRY_ARG {
            if registries.raw.is_empty() {
                continue;
            }
            registries.raw.clone()
        } else {
            match config.get(param) {
                Some(v) => value_to_string(v).into_bytes(),
                None => continue,
            }
        };

        let content = if param == CLOUD_PROVIDER_CONFIG_ARG {
            match secret_reference(param, &String::from_utf8_lossy(&content))? {
                Some((namespace, name)) => {
                    cloud_provider_config_from_secret(ctx, &namespace, &name).await?
                }
                None => content,
            }
        } else {
            content
        };

        let path = config_file(cp, param);
        config.insert(param.to_string(), Value::String(path.clone()));
        plan.files.push(File::new(path, content));
    }

    plan.files.extend(render_files(ctx, entry).await?);

    prune_empty(&mut config);

    let data = serde_json::to_vec_pretty(&config)?;
    plan.files
        .push(File::new(distro_config_path(cp.runtime()), data));

    Ok(RenderedConfig {
        plan,
        config,
        joined_server,
    })
}

fn add_defaults(config: &mut GenericMap, control_plane: &RKEControlPlane) {
    if control_plane.runtime() == Runtime::Rke2 {
        config.insert("cni".to_string(), json!("calico"));
    }
}

/// Merge global and matching selector config, then apply the release filter
pub fn add_user_config(
    config: &mut GenericMap,
    ctx: RenderContext<'_>,
    entry: &PlanEntry,
) -> Result<(), Error> {
    let cp = ctx.control_plane;
    for (k, v) in &cp.spec.machine_global_config {
        config.insert(k.clone(), v.clone());
    }

    let labels = entry.machine.labels();
    for selector_config in &cp.spec.machine_selector_config {
        let matches = match &selector_config.machine_label_selector {
            None => true,
            Some(selector) => selector_matches(selector, labels)?,
        };
        if matches {
            for (k, v) in &selector_config.config {
                config.insert(k.clone(), v.clone());
            }
        }
    }

    filter_config_data(config, ctx.release, entry);

    // data-dir maps to a CRD field rather than a release arg
    let data_dir = &cp.spec.data_directories.k8s_distro;
    if !data_dir.is_empty() {
        config.insert("data-dir".to_string(), json!(data_dir));
    }
    Ok(())
}

/// Drop keys the release doesn't accept for this entry's roles
///
/// Servers accept both server and agent args; workers only agent args.
pub fn filter_config_data(config: &mut GenericMap, release: &ReleaseData, entry: &PlanEntry) {
    let is_server = is_etcd(entry) || is_control_plane(entry);
    let allowed = |args: &BTreeMap<String, Value>, key: &str| {
        args.keys().any(|k| k.trim_start_matches("--") == key)
    };
    config.retain(|key, _| {
        let key = key.trim_start_matches("--");
        let keep = (is_server && allowed(&release.server_args, key))
            || allowed(&release.agent_args, key);
        if !keep {
            debug!(key, machine = %entry.name(), "dropping config key not in release");
        }
        keep
    });
}

async fn add_etcd(
    config: &mut GenericMap,
    ctx: RenderContext<'_>,
    entry: &PlanEntry,
    render_s3: bool,
) -> Result<Vec<File>, Error> {
    let cp = ctx.control_plane;
    let Some(etcd) = cp.spec.etcd.as_ref().filter(|_| is_etcd(entry)) else {
        return Ok(Vec::new());
    };

    if etcd.disable_snapshots {
        config.insert("etcd-disable-snapshots".to_string(), json!(true));
    }
    if etcd.snapshot_retention > 0 {
        config.insert(
            "etcd-snapshot-retention".to_string(),
            json!(etcd.snapshot_retention),
        );
    }
    if !etcd.snapshot_schedule_cron.is_empty() {
        config.insert(
            "etcd-snapshot-schedule-cron".to_string(),
            json!(etcd.snapshot_schedule_cron),
        );
    }

    if !render_s3 {
        return Ok(Vec::new());
    }
    let rendered = s3::to_args(ctx.secrets, etcd.s3.as_ref(), cp, "etcd-", false).await?;
    for arg in &rendered.args {
        let (k, v) = arg.split_once('=').unwrap_or((arg.as_str(), ""));
        let k = k.trim_start_matches("--").to_string();
        if v.is_empty() {
            config.insert(k, json!(true));
        } else {
            config.insert(k, json!(v));
        }
    }
    Ok(rendered.files)
}

/// Add role-specific keys and return the server the config joins
///
/// Returns `-` for the init node and [`JOIN_SERVER_IMPLAUSIBLE`] when
/// there's nothing to join.
fn add_role_config(
    config: &mut GenericMap,
    control_plane: &RKEControlPlane,
    entry: &PlanEntry,
    join_server: &str,
) -> String {
    let runtime = control_plane.runtime();
    let join_server = if is_init_node(entry) {
        if runtime == Runtime::K3s {
            config.insert("cluster-init".to_string(), json!(true));
        }
        "-".to_string()
    } else if join_server.is_empty() {
        match entry.metadata.annotations.get(JOINED_TO_ANNOTATION) {
            Some(joined) => joined.clone(),
            None => return JOIN_SERVER_IMPLAUSIBLE.to_string(),
        }
    } else {
        join_server.to_string()
    };

    // the init node is rendered both before and after it knows its own URL,
    // so it must never carry a server key
    if !join_server.is_empty() && join_server != "-" {
        config.insert("server".to_string(), json!(join_server));
    }

    if is_only_etcd(entry) {
        for key in ["disable-scheduler", "disable-apiserver", "disable-controller-manager"] {
            config.insert(key.to_string(), json!(true));
        }
    } else if is_only_control_plane(entry) {
        config.insert("disable-etcd".to_string(), json!(true));
    }

    let registry = &control_plane.spec.system_default_registry;
    if !registry.is_empty() && !is_only_worker(entry) {
        config.insert("system-default-registry".to_string(), json!(registry));
    }

    if is_control_plane(entry) {
        for (arg_key, mount_key, port, cert_dir) in [
            (
                KUBE_CONTROLLER_MANAGER_ARG,
                KUBE_CONTROLLER_MANAGER_EXTRA_MOUNT,
                DEFAULT_KUBE_CONTROLLER_MANAGER_SECURE_PORT,
                DEFAULT_KUBE_CONTROLLER_MANAGER_CERT_DIR,
            ),
            (
                KUBE_SCHEDULER_ARG,
                KUBE_SCHEDULER_EXTRA_MOUNT,
                DEFAULT_KUBE_SCHEDULER_SECURE_PORT,
                DEFAULT_KUBE_SCHEDULER_CERT_DIR,
            ),
        ] {
            let (args, mounts) = render_arg_and_mount(
                config.get(arg_key),
                config.get(mount_key),
                control_plane,
                port,
                cert_dir,
            );
            config.insert(arg_key.to_string(), json!(args));
            if runtime == Runtime::Rke2 {
                config.insert(mount_key.to_string(), json!(mounts));
            }
        }
    }

    let node_name = entry.metadata.label(NODE_NAME_LABEL);
    if !node_name.is_empty() {
        config.insert("node-name".to_string(), json!(node_name));
    }
    join_server
}

/// Append cert-dir/secure-port args and the matching mount for a component
///
/// A user-provided `tls-cert-file` or `cert-dir` wins over the default cert
/// dir, and the mount follows it. A user-provided `secure-port` is kept.
/// Mounts are only rendered for rke2, whose components run as static pods.
pub fn render_arg_and_mount(
    existing_arg: Option<&Value>,
    existing_mount: Option<&Value>,
    control_plane: &RKEControlPlane,
    default_secure_port: &str,
    default_cert_dir: &str,
) -> (Vec<String>, Vec<String>) {
    let mut args = to_string_slice(existing_arg);
    let mut mounts = to_string_slice(existing_mount);
    let rendered_cert_dir = format!("{}/{default_cert_dir}", control_plane.distro_data_dir());

    let mut cert_dir_arg = Some(format!("{CERT_DIR_ARGUMENT}={rendered_cert_dir}"));
    let mut cert_dir_mount = format!("{rendered_cert_dir}:{rendered_cert_dir}");
    let mut secure_port_arg = Some(format!("{SECURE_PORT_ARGUMENT}={default_secure_port}"));

    if !args.is_empty() {
        if let Some(cert_file) = get_arg_value(&args, TLS_CERT_FILE_ARGUMENT, "=") {
            cert_dir_arg = None;
            let dir = parent_dir(&cert_file);
            cert_dir_mount = format!("{dir}:{dir}");
        } else if let Some(cert_dir) = get_arg_value(&args, CERT_DIR_ARGUMENT, "=") {
            cert_dir_arg = None;
            cert_dir_mount = format!("{cert_dir}:{cert_dir}");
        }
        if get_arg_value(&args, SECURE_PORT_ARGUMENT, "=").is_some() {
            secure_port_arg = None;
        }
    }

    args.extend(cert_dir_arg);
    args.extend(secure_port_arg);
    if control_plane.runtime() == Runtime::Rke2 {
        mounts.push(cert_dir_mount);
    }
    (args, mounts)
}

/// Value of `search` in a list of `key<delim>value` args
pub fn get_arg_value(args: &[String], search: &str, delim: &str) -> Option<String> {
    args.iter().find_map(|arg| {
        let (k, v) = arg.split_once(delim)?;
        (k == search && !v.is_empty()).then(|| v.to_string())
    })
}

fn parent_dir(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(i) => &path[..i],
        None => ".",
    }
}

fn add_local_cluster_auth_endpoint_config(
    config: &mut GenericMap,
    control_plane: &RKEControlPlane,
    entry: &PlanEntry,
) {
    if is_only_worker(entry) || !control_plane.spec.local_cluster_auth_endpoint.enabled {
        return;
    }
    let auth_file = authn_webhook_path(control_plane);
    let mut args = to_string_slice(config.get("kube-apiserver-arg"));
    args.push(format!("authentication-token-webhook-config-file={auth_file}"));
    config.insert("kube-apiserver-arg".to_string(), json!(args));
}

/// Webhook kubeconfig for the local cluster auth endpoint
pub fn add_local_cluster_auth_endpoint_file(
    mut plan: NodePlan,
    control_plane: &RKEControlPlane,
    entry: &PlanEntry,
) -> NodePlan {
    if is_only_worker(entry) || !control_plane.spec.local_cluster_auth_endpoint.enabled {
        return plan;
    }
    let content = AUTHN_WEBHOOK.replace("{LOOPBACK}", control_plane.loopback_address());
    plan.files
        .push(File::new(authn_webhook_path(control_plane), content));
    plan
}

fn authn_webhook_path(control_plane: &RKEControlPlane) -> String {
    format!("{}/{AUTHN_WEBHOOK_FILE_NAME}", control_plane.distro_data_dir())
}

fn add_token(config: &mut GenericMap, entry: &PlanEntry, tokens: &ClusterTokens) {
    if tokens.server_token.is_empty() {
        return;
    }
    if is_only_worker(entry) {
        config.insert("token".to_string(), json!(tokens.agent_token));
    } else {
        config.insert("token".to_string(), json!(tokens.server_token));
        config.insert("agent-token".to_string(), json!(tokens.agent_token));
    }
}

fn split_addresses(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(str::to_string)
        .collect()
}

fn add_addresses(config: &mut GenericMap, entry: &PlanEntry) {
    let internal = split_addresses(entry.metadata.annotation(INTERNAL_ADDRESS_ANNOTATION));
    let external = split_addresses(entry.metadata.annotation(ADDRESS_ANNOTATION));

    let mut node_ips = to_string_slice(config.get("node-ip"));
    for ip in &internal {
        if !node_ips.contains(ip) {
            node_ips.push(ip.clone());
        }
    }
    config.insert("node-ip".to_string(), json!(node_ips));

    // a cloud provider manages external addresses itself
    if config
        .get("cloud-provider-name")
        .map(value_to_string)
        .unwrap_or_default()
        .is_empty()
    {
        let mut external_ips = to_string_slice(config.get("node-external-ip"));
        for ip in &external {
            if !external_ips.contains(ip) && !node_ips.contains(ip) {
                external_ips.push(ip.clone());
            }
        }
        config.insert("node-external-ip".to_string(), json!(external_ips));
    }

    if is_only_worker(entry) || internal.is_empty() || external.is_empty() {
        return;
    }
    let mut sorted_internal = internal.clone();
    let mut sorted_external = external.clone();
    sorted_internal.sort();
    sorted_external.sort();
    if sorted_internal != sorted_external {
        config.insert("advertise-address".to_string(), json!(internal[0]));
        let mut sans = to_string_slice(config.get("tls-san"));
        for ip in external {
            if !sans.contains(&ip) {
                sans.push(ip);
            }
        }
        config.insert("tls-san".to_string(), json!(sans));
    }
}

fn add_labels(config: &mut GenericMap, entry: &PlanEntry) -> Result<(), Error> {
    let mut labels = Vec::new();
    let raw = entry.metadata.annotation(LABELS_ANNOTATION);
    if !raw.is_empty() {
        let extra: BTreeMap<String, String> = serde_json::from_str(raw)?;
        labels.extend(extra.into_iter().map(|(k, v)| format!("{k}={v}")));
    }
    labels.push(format!("{MACHINE_UID_LABEL}={}", entry.machine.uid_str()));
    labels.sort();
    config.insert("node-label".to_string(), json!(labels));
    Ok(())
}

/// Taints for a machine: the annotation's, plus role taints on servers
///
/// k3s charts don't tolerate the etcd taint on combined etcd and control
/// plane nodes, so it is skipped there.
pub fn taints(entry: &PlanEntry, runtime: Runtime) -> Result<Vec<Taint>, Error> {
    let raw = entry.metadata.annotation(TAINTS_ANNOTATION);
    let mut result: Vec<Taint> = if raw.is_empty() {
        Vec::new()
    } else {
        serde_json::from_str(raw)?
    };

    if !is_worker(entry) {
        if is_etcd(entry) && (runtime != Runtime::K3s || !is_control_plane(entry)) {
            result.push(Taint {
                key: "node-role.kubernetes.io/etcd".to_string(),
                effect: "NoExecute".to_string(),
                ..Default::default()
            });
        }
        if is_control_plane(entry) {
            result.push(Taint {
                key: "node-role.kubernetes.io/control-plane".to_string(),
                effect: "NoSchedule".to_string(),
                ..Default::default()
            });
        }
    }
    Ok(result)
}

/// `key=value:Effect`, or `key:Effect` without a value
pub fn taint_to_string(taint: &Taint) -> String {
    match taint.value.as_deref() {
        Some(value) if !value.is_empty() => format!("{}={value}:{}", taint.key, taint.effect),
        _ => format!("{}:{}", taint.key, taint.effect),
    }
}

fn add_taints(config: &mut GenericMap, entry: &PlanEntry, runtime: Runtime) -> Result<(), Error> {
    let mut rendered: Vec<String> = taints(entry, runtime)?
        .iter()
        .filter(|t| !t.key.is_empty())
        .map(taint_to_string)
        .collect();
    rendered.sort();
    config.insert("node-taint".to_string(), json!(rendered));
    Ok(())
}

/// Parse a `secret://namespace:name` reference
fn secret_reference(field: &str, value: &str) -> Result<Option<(String, String)>, Error> {
    let Some(rest) = value.strip_prefix("secret://") else {
        return Ok(None);
    };
    match rest.split(':').collect::<Vec<_>>().as_slice() {
        [namespace, name] if !namespace.is_empty() && !name.is_empty() => {
            Ok(Some((namespace.to_string(), name.to_string())))
        }
        _ => Err(Error::validation(format!(
            "provided value for {field} secret is malformed, must be of the format secret://namespace:name"
        ))),
    }
}

async fn cloud_provider_config_from_secret(
    ctx: RenderContext<'_>,
    namespace: &str,
    name: &str,
) -> Result<Vec<u8>, Error> {
    let cluster = ctx.control_plane.name_any();
    let secret = ctx
        .secrets
        .get_secret(namespace, name)
        .await?
        .ok_or_else(|| {
            Error::validation(format!(
                "secret 'secret://{namespace}:{name}' referenced by the cloud-provider-config was not found"
            ))
        })?;
    if !cluster_object_authorized(secret.annotations(), &cluster) {
        return Err(Error::validation(format!(
            "the secret 'secret://{namespace}:{name}' provided within the cloud-provider-config does not belong to cluster '{cluster}'"
        )));
    }
    secret
        .data
        .as_ref()
        .and_then(|d| d.get("credential"))
        .map(|c| c.0.clone())
        .ok_or_else(|| {
            Error::validation(format!(
                "the cloud-provider-config specified a secret, but no config could be found within the secret 'secret://{namespace}:{name}'"
            ))
        })
}

/// True if the object's authorization annotation lists the cluster
pub fn cluster_object_authorized(annotations: &BTreeMap<String, String>, cluster: &str) -> bool {
    if cluster.is_empty() {
        return false;
    }
    annotations
        .get(AUTHORIZED_OBJECT_ANNOTATION)
        .is_some_and(|v| v.split(',').any(|c| c == cluster))
}

/// Render user files selected for this machine from secrets and configmaps
pub async fn render_files(ctx: RenderContext<'_>, entry: &PlanEntry) -> Result<Vec<File>, Error> {
    let cp = ctx.control_plane;
    let namespace = cp.namespace().unwrap_or_default();
    let cluster = cp.name_any();
    let mut files = Vec::new();

    for selector_files in &cp.spec.machine_selector_files {
        if let Some(selector) = &selector_files.machine_label_selector {
            if !selector_matches(selector, entry.machine.labels())? {
                continue;
            }
        }
        for source in &selector_files.file_sources {
            match (&source.secret, &source.config_map) {
                (Some(secret), Some(config_map)) => {
                    return Err(Error::validation(format!(
                        "secret {namespace}/{} and configmap {namespace}/{} cannot both be defined at the same time for files, use separate entries",
                        secret.name, config_map.name
                    )));
                }
                (Some(src), None) => {
                    let secret = ctx
                        .secrets
                        .get_secret(&namespace, &src.name)
                        .await?
                        .ok_or_else(|| {
                            Error::validation(format!(
                                "error retrieving secret {namespace}/{} while rendering files: not found",
                                src.name
                            ))
                        })?;
                    if !cluster_object_authorized(secret.annotations(), &cluster) {
                        return Err(Error::validation(format!(
                            "error rendering files: cluster {namespace}/{cluster} was not authorized to access secret {namespace}/{}",
                            src.name
                        )));
                    }
                    let data = secret.data.unwrap_or_default();
                    files.extend(project_items(src, "secret", |key| {
                        data.get(key).map(|b| b.0.clone()).unwrap_or_default()
                    })?);
                }
                (None, Some(src)) => {
                    let config_map = ctx
                        .secrets
                        .get_config_map(&namespace, &src.name)
                        .await?
                        .ok_or_else(|| {
                            Error::validation(format!(
                                "error retrieving configmap {namespace}/{} while rendering files: not found",
                                src.name
                            ))
                        })?;
                    if !cluster_object_authorized(config_map.annotations(), &cluster) {
                        return Err(Error::validation(format!(
                            "error rendering files: cluster {namespace}/{cluster} was not authorized to access configmap {namespace}/{}",
                            src.name
                        )));
                    }
                    let data = config_map.data.unwrap_or_default();
                    files.extend(project_items(src, "configmap", |key| {
                        data.get(key).map(|s| s.as_bytes().to_vec()).unwrap_or_default()
                    })?);
                }
                (None, None) => {}
            }
        }
    }
    Ok(files)
}

fn project_items(
    source: &ObjectFileSource,
    kind: &str,
    content: impl Fn(&str) -> Vec<u8>,
) -> Result<Vec<File>, Error> {
    source
        .items
        .iter()
        .map(|item| {
            let data = content(&item.key);
            if !item.hash.is_empty() {
                let digest = aws_lc_rs::digest::digest(&SHA256, &data);
                let actual = base64::engine::general_purpose::STANDARD.encode(digest.as_ref());
                if actual != item.hash {
                    return Err(Error::validation(format!(
                        "{kind} {} does not contain the expected content",
                        source.name
                    )));
                }
            }
            let mut file = File::new(item.path.clone(), data);
            file.dynamic = item.dynamic;
            file.permissions = if item.permissions.is_empty() {
                source.default_permissions.clone()
            } else {
                item.permissions.clone()
            };
            Ok(file)
        })
        .collect()
}

/// Evaluate a label selector against a label set
///
/// An empty selector matches everything.
pub fn selector_matches(
    selector: &LabelSelector,
    labels: &BTreeMap<String, String>,
) -> Result<bool, Error> {
    if let Some(match_labels) = &selector.match_labels {
        if match_labels.iter().any(|(k, v)| labels.get(k) != Some(v)) {
            return Ok(false);
        }
    }
    for expr in selector.match_expressions.iter().flatten() {
        let values = expr.values.as_deref().unwrap_or_default();
        let value = labels.get(&expr.key);
        let matched = match expr.operator.as_str() {
            "In" => value.is_some_and(|v| values.contains(v)),
            "NotIn" => value.is_none_or(|v| !values.contains(v)),
            "Exists" => value.is_some(),
            "DoesNotExist" => value.is_none(),
            other => {
                return Err(Error::validation(format!(
                    "{other:?} is not a valid label selector operator"
                )))
            }
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HelmChartConfig {
    api_version: &'static str,
    kind: &'static str,
    metadata: HelmChartConfigMeta,
    spec: HelmChartConfigSpec,
}

#[derive(Serialize)]
struct HelmChartConfigMeta {
    name: String,
    namespace: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HelmChartConfigSpec {
    values_content: String,
}

/// Chart values with the vSphere CSI chart added when the vSphere cloud
/// provider is selected, so its cluster ID gets rendered
fn chart_values(ctx: RenderContext<'_>, entry: &PlanEntry) -> Result<GenericMap, Error> {
    let mut user = GenericMap::new();
    add_user_config(&mut user, ctx, entry)?;
    let mut values = ctx.control_plane.spec.chart_values.clone();
    if user.get("cloud-provider-name") == Some(&json!("rancher-vsphere"))
        && !values.contains_key("rancher-vsphere-csi")
    {
        values.insert("rancher-vsphere-csi".to_string(), json!({}));
    }
    Ok(values)
}

/// Managed HelmChartConfig manifest for server nodes
pub fn add_chart_configs(
    mut plan: NodePlan,
    ctx: RenderContext<'_>,
    entry: &PlanEntry,
) -> Result<NodePlan, Error> {
    if is_only_worker(entry) {
        return Ok(plan);
    }
    let cp = ctx.control_plane;

    let mut docs = Vec::new();
    for (chart, value) in chart_values(ctx, entry)? {
        let mut values = value.as_object().cloned().unwrap_or_default();
        let global = values
            .entry("global")
            .or_insert_with(|| json!({}));
        if !global.is_object() {
            *global = json!({});
        }
        let cattle = global
            .as_object_mut()
            .map(|g| g.entry("cattle").or_insert_with(|| json!({})));
        if let Some(cattle) = cattle {
            if !cattle.is_object() {
                *cattle = json!({});
            }
            if let Some(cattle) = cattle.as_object_mut() {
                cattle.insert(
                    "clusterId".to_string(),
                    json!(cp.spec.management_cluster_name),
                );
            }
        }

        let doc = HelmChartConfig {
            api_version: "helm.cattle.io/v1",
            kind: "HelmChartConfig",
            metadata: HelmChartConfigMeta {
                name: chart,
                namespace: "kube-system",
            },
            spec: HelmChartConfigSpec {
                values_content: serde_json::to_string(&values)?,
            },
        };
        docs.push(
            serde_yaml::to_string(&doc)
                .map_err(|e| Error::serialization_for_kind("HelmChartConfig", e.to_string()))?,
        );
    }

    let mut file = File::new(
        format!(
            "{}/server/manifests/rancher/managed-chart-config.yaml",
            cp.distro_data_dir()
        ),
        docs.join("---\n"),
    );
    file.dynamic = true;
    plan.files.push(file);
    Ok(plan)
}

/// Remove null, empty-string and empty-list values
pub fn prune_empty(config: &mut GenericMap) {
    config.retain(|_, v| match v {
        Value::Null => false,
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        _ => true,
    });
}

/// Hash of everything that requires a service restart when it changes
pub fn restart_stamp(plan: &NodePlan, control_plane: &RKEControlPlane, image: &str) -> String {
    stamp(plan, control_plane, image, |file| file.content.as_bytes().to_vec())
}

/// Like [`restart_stamp`], but blind to config keys that don't need a drain
pub fn drain_hash(
    plan: &NodePlan,
    control_plane: &RKEControlPlane,
    image: &str,
) -> Result<String, Error> {
    let mut contents = BTreeMap::new();
    for file in plan.files.iter().filter(|f| is_distro_config_path(&f.path)) {
        let raw = file.decoded()?;
        if let Ok(mut config) = serde_json::from_slice::<GenericMap>(&raw) {
            for key in DRAIN_IRRELEVANT_KEYS {
                config.remove(key);
            }
            contents.insert(file.path.clone(), serde_json::to_vec_pretty(&config)?);
        }
    }
    Ok(stamp(plan, control_plane, image, |file| {
        contents
            .get(&file.path)
            .cloned()
            .unwrap_or_else(|| file.content.as_bytes().to_vec())
    }))
}

fn stamp(
    plan: &NodePlan,
    control_plane: &RKEControlPlane,
    image: &str,
    content: impl Fn(&File) -> Vec<u8>,
) -> String {
    let mut ctx = Context::new(&SHA256);
    ctx.update(control_plane.spec.provision_generation.to_string().as_bytes());
    ctx.update(image.as_bytes());
    for file in plan.files.iter().filter(|f| !f.dynamic) {
        ctx.update(file.path.as_bytes());
        ctx.update(&content(file));
    }
    let config_generation = control_plane
        .status
        .as_ref()
        .map(|s| s.config_generation)
        .unwrap_or_default();
    ctx.update(config_generation.to_string().as_bytes());
    hex_encode(ctx.finish().as_ref())
}

/// Render a loosely-typed config value as a plain string
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Render a config value as a list of strings; scalars become one element
pub fn to_string_slice(value: Option<&Value>) -> Vec<String> {
    match value {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.iter().map(value_to_string).collect(),
        Some(other) => vec![value_to_string(other)],
    }
}
