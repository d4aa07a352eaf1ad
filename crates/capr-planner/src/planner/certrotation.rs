//! Certificate rotation
//!
//! Requested by bumping `spec.rotateCertificates.generation`. Machines are
//! walked in a fixed order (etcd-only, etcd with other roles, control plane,
//! workers) and each receives a plan that stops the runtime, rotates, and
//! restarts it. The walk only moves past a machine once its rotation plan
//! applied cleanly, so the loop resumes where it left off on every call.

use kube::ResourceExt;
use tracing::info;

use capr_common::crd::{GenericMap, RKEControlPlane, RKEControlPlaneStatus, RotateCertificates};
use capr_common::runtime::Runtime;
use capr_common::Error;

use super::{Pass, Planner};
use crate::config::{
    get_arg_value, to_string_slice, CERT_DIR_ARGUMENT, DEFAULT_KUBE_CONTROLLER_MANAGER_CERT,
    DEFAULT_KUBE_CONTROLLER_MANAGER_CERT_DIR, DEFAULT_KUBE_SCHEDULER_CERT,
    DEFAULT_KUBE_SCHEDULER_CERT_DIR, KUBE_CONTROLLER_MANAGER_ARG, KUBE_SCHEDULER_ARG,
    TLS_CERT_FILE_ARGUMENT,
};
use crate::election::find_init_node;
use crate::filters::{
    collect, is_control_plane, is_deleting, is_etcd, is_only_etcd, is_only_worker, is_worker,
};
use crate::instructions::{
    idempotent_instruction, idempotent_restart_instructions,
    remove_static_pod_manifests_instruction,
};
use crate::plan::{NodePlan, OneTimeInstruction, Plan, PlanEntry};
use crate::store::assign_and_check_plan;

const ROTATION_MESSAGE: &str = "certificate rotation";

/// Services whose certificates live on every node
const AGENT_SERVICES: &[&str] = &[
    "rke2-server",
    "k3s-server",
    "api-server",
    "kubelet",
    "kube-proxy",
    "auth-proxy",
];

/// Services only control plane nodes run
const CONTROL_PLANE_SERVICES: &[&str] = &[
    "controller-manager",
    "scheduler",
    "rke2-controller",
    "k3s-controller",
    "admin",
    "cloud-controller",
];

const ETCD_SERVICES: &[&str] = &["etcd", "kubelet", "k3s-server", "rke2-server"];

impl Planner {
    /// Drive a pending certificate rotation to completion
    ///
    /// The owning CAPI cluster is paused while services are down so it does
    /// not replace machines that look unhealthy mid-rotation.
    pub(crate) async fn rotate_certificates(
        &self,
        pass: Pass<'_>,
        status: &mut RKEControlPlaneStatus,
        plan: &mut Plan,
    ) -> Result<(), Error> {
        let cp = pass.control_plane;
        let Some(rotation) = rotation_requested(cp, status) else {
            return Ok(());
        };

        let (found, join_server, _) = find_init_node(plan)?;
        if !found || join_server.is_empty() {
            return Err(Error::waiting("waiting for control plane to be available"));
        }

        self.pause_capi_cluster(cp, true)
            .await
            .map_err(|e| Error::waiting(format!("pausing CAPI cluster: {e}")))?;

        for mut entry in ordered_entries(plan) {
            if !should_rotate_entry(rotation, &entry) {
                continue;
            }
            let (rotate_plan, joined_server) = self
                .rotate_certificates_plan(pass, rotation, &entry, &join_server)
                .await?;
            let result = assign_and_check_plan(
                &self.store,
                ROTATION_MESSAGE,
                &mut entry,
                &rotate_plan,
                &joined_server,
                0,
                0,
            )
            .await;
            plan.absorb(&entry);
            result?;
        }

        self.pause_capi_cluster(cp, false)
            .await
            .map_err(|e| Error::waiting(format!("unpausing CAPI cluster: {e}")))?;

        status.certificate_rotation_generation = rotation.generation;
        info!(
            cluster = %cp.name_any(),
            generation = rotation.generation,
            "certificate rotation complete"
        );
        Ok(())
    }

    /// Plan that rotates one machine's certificates
    ///
    /// Workers only restart their agent, which re-requests its certificates.
    /// Servers stop, run `certificate rotate`, and drop the controller
    /// manager and scheduler serving certs, which the runtime only
    /// regenerates when missing.
    pub(crate) async fn rotate_certificates_plan(
        &self,
        pass: Pass<'_>,
        rotation: &RotateCertificates,
        entry: &PlanEntry,
        join_server: &str,
    ) -> Result<(NodePlan, String), Error> {
        let cp = pass.control_plane;
        // a worker keeps the server it joined
        let join_server = if is_only_worker(entry) { "" } else { join_server };
        let generated = self
            .generate_plan_with_config_files(pass, entry, join_server, true)
            .await?;
        let mut plan = generated.plan;
        let generation = rotation.generation.to_string();
        let runtime = cp.runtime();

        if is_only_worker(entry) {
            plan.instructions.extend(idempotent_restart_instructions(
                cp,
                "certificate-rotation/restart",
                &generation,
                runtime.agent_unit(),
            ));
            return Ok((plan, generated.joined_server));
        }

        let mut args = vec!["certificate".to_string(), "rotate".to_string()];
        for service in &rotation.services {
            args.push("-s".to_string());
            args.push(service.clone());
        }
        plan.instructions.push(idempotent_instruction(
            cp,
            "certificate-rotation/stop",
            &generation,
            "systemctl",
            &["stop".to_string(), runtime.server_unit().to_string()],
            &[],
        ));
        plan.instructions.push(idempotent_instruction(
            cp,
            "certificate-rotation/rotate",
            &generation,
            runtime.as_str(),
            &args,
            &[],
        ));

        if is_control_plane(entry) {
            let components = [
                (
                    "controller-manager",
                    "kcm",
                    KUBE_CONTROLLER_MANAGER_ARG,
                    DEFAULT_KUBE_CONTROLLER_MANAGER_CERT_DIR,
                    DEFAULT_KUBE_CONTROLLER_MANAGER_CERT,
                ),
                (
                    "scheduler",
                    "ks",
                    KUBE_SCHEDULER_ARG,
                    DEFAULT_KUBE_SCHEDULER_CERT_DIR,
                    DEFAULT_KUBE_SCHEDULER_CERT,
                ),
            ];
            for (service, short, arg_key, default_dir, cert) in components {
                if !rotates(rotation, service) {
                    continue;
                }
                if let Some(path) =
                    serving_cert_path(cp, &generated.config, arg_key, default_dir, cert)
                {
                    plan.instructions.push(remove_file_instruction(
                        cp,
                        &format!("certificate-rotation/rm-{short}-cert"),
                        &generation,
                        &path,
                    ));
                }
            }
        }

        if runtime == Runtime::Rke2 {
            // static pods keep old certs mounted until recreated
            plan.instructions.extend(remove_static_pod_manifests_instruction(
                cp,
                entry,
                "certificate-rotation/rm-static-pods",
                &generation,
            ));
        }

        plan.instructions.extend(idempotent_restart_instructions(
            cp,
            "certificate-rotation/restart",
            &generation,
            runtime.server_unit(),
        ));
        Ok((plan, generated.joined_server))
    }
}

/// The rotation request, if it has not been completed yet
fn rotation_requested<'a>(
    control_plane: &'a RKEControlPlane,
    status: &RKEControlPlaneStatus,
) -> Option<&'a RotateCertificates> {
    control_plane
        .spec
        .rotate_certificates
        .as_ref()
        .filter(|r| r.generation != status.certificate_rotation_generation)
}

fn rotates(rotation: &RotateCertificates, service: &str) -> bool {
    rotation.services.is_empty() || rotation.services.iter().any(|s| s == service)
}

/// Machines in rotation order, each once, deleting ones skipped
fn ordered_entries(plan: &Plan) -> Vec<PlanEntry> {
    let groups: [fn(&PlanEntry) -> bool; 4] = [
        is_only_etcd,
        |e| is_etcd(e) && !is_only_etcd(e),
        |e| is_control_plane(e) && !is_etcd(e),
        |e| is_worker(e) && !is_etcd(e) && !is_control_plane(e),
    ];
    groups
        .into_iter()
        .flat_map(|group| collect(plan, group))
        .filter(|e| !is_deleting(e))
        .collect()
}

/// True if the machine runs any service being rotated
pub(crate) fn should_rotate_entry(rotation: &RotateCertificates, entry: &PlanEntry) -> bool {
    if rotation.services.is_empty() {
        return true;
    }
    let mut relevant: Vec<&str> = Vec::new();
    if is_worker(entry) {
        relevant.extend(AGENT_SERVICES);
    }
    if is_control_plane(entry) {
        relevant.extend(AGENT_SERVICES);
        relevant.extend(CONTROL_PLANE_SERVICES);
    }
    if is_etcd(entry) {
        relevant.extend(ETCD_SERVICES);
    }
    rotation
        .services
        .iter()
        .any(|s| relevant.contains(&s.as_str()))
}

/// Serving cert the runtime generated for a component
///
/// `None` when the user supplied their own with `tls-cert-file`; those are
/// not ours to delete.
fn serving_cert_path(
    control_plane: &RKEControlPlane,
    config: &GenericMap,
    arg_key: &str,
    default_dir: &str,
    cert: &str,
) -> Option<String> {
    let args = to_string_slice(config.get(arg_key));
    if get_arg_value(&args, TLS_CERT_FILE_ARGUMENT, "=").is_some() {
        return None;
    }
    let dir = get_arg_value(&args, CERT_DIR_ARGUMENT, "=")
        .unwrap_or_else(|| format!("{}/{default_dir}", control_plane.distro_data_dir()));
    Some(format!("{dir}/{cert}"))
}

fn remove_file_instruction(
    control_plane: &RKEControlPlane,
    identifier: &str,
    value: &str,
    path: &str,
) -> OneTimeInstruction {
    idempotent_instruction(
        control_plane,
        identifier,
        value,
        "rm",
        &["-f".to_string(), path.to_string()],
        &[],
    )
}
