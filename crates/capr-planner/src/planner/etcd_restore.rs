//! Etcd snapshot restore
//!
//! A restore takes the whole cluster down: every server stops its runtime
//! and etcd machines are tombstoned so none of them rejoins the old member
//! set. One designated init node then runs a cluster reset from the
//! snapshot, and the rest of the cluster is brought back by full reconciles
//! that ignore drain and concurrency.
//!
//! The designated node is the one holding the snapshot. For a local snapshot
//! that is fixed by the snapshot's machine ID label or node name; an S3
//! snapshot can be restored anywhere, so a regular election decides.

use std::io::Read;

use base64::Engine;
use flate2::read::GzDecoder;
use kube::ResourceExt;
use serde::Deserialize;
use tracing::{debug, error, info};

use capr_common::crd::conditions::BOOTSTRAPPED;
use capr_common::crd::{
    ConditionStatus, Conditions, ETCDSnapshot, EtcdSnapshotRestore, EtcdSnapshotRestorePhase,
    Operation, RKEControlPlane, RKEControlPlaneStatus,
};
use capr_common::naming::sha256_hex;
use capr_common::runtime::Runtime;
use capr_common::{Error, MACHINE_ID_LABEL};

use super::{Pass, Planner};
use crate::election::{designate_init_node, elect_init_node, find_init_node};
use crate::filters::{
    can_be_init_node, collect, is_control_plane, is_deleting, is_etcd, is_init_node, is_windows,
    no_role,
};
use crate::instructions::{
    convert_to_idempotent_instruction, idempotent_cleanup_instruction, idempotent_instruction,
    install_instruction_skip_start, remove_static_pod_manifests_instruction, static_pod_manifests,
};
use crate::plan::{CommonInstruction, File, NodePlan, OneTimeInstruction, Plan, PlanEntry};
use crate::s3;
use crate::store::assign_and_check_plan;

const OPERATION: &str = "etcd restore";

const BIN_PREFIX: &str = "capr/etcd-restore/bin";
const WAIT_FOR_POD_LIST_SCRIPT: &str = "wait_for_pod_list.sh";
const WAIT_FOR_READY_SCRIPT: &str = "wait_for_ready.sh";
const CLEAN_UP_NODES_SCRIPT: &str = "clean_up_nodes.sh";

/// Snapshot metadata key holding the gzipped, base64 cluster spec
const CLUSTER_SPEC_METADATA_KEY: &str = "provisioning-cluster-spec";

/// Snapshots from before this version can't be restored onto it or later
const MINIMUM_SNAPSHOT_VERSION: semver::Version = semver::Version::new(1, 25, 0);

const WAIT_FOR_POD_LIST: &str = r#"#!/bin/sh
# usage: wait_for_pod_list.sh <command...>
for _ in $(seq 1 30); do
    "$@" >/dev/null 2>&1 && exit 0
    sleep 10
done
exit 1
"#;

const WAIT_FOR_READY: &str = r#"#!/bin/sh
# usage: wait_for_ready.sh <machine uid...>
# Waits for the listed machines' nodes to be Ready, then for every node.
: "${KUBECTL:?KUBECTL must be set}"
: "${KUBECONFIG:?KUBECONFIG must be set}"
ready() {
    [ "$("$KUBECTL" get node --no-headers -l "rke.cattle.io/machine=$1" \
        -o 'custom-columns=STATUS:status.conditions[?(@.type=="Ready")].status')" = "True" ]
}
for uid in "$@"; do
    until ready "$uid"; do
        sleep 5
    done
done
for _ in $(seq 1 60); do
    total=$("$KUBECTL" get nodes --no-headers | wc -l)
    ready=$("$KUBECTL" get nodes --no-headers \
        -o 'custom-columns=STATUS:status.conditions[?(@.type=="Ready")].status' | grep -c '^True$')
    [ "$total" = "$ready" ] && exit 0
    sleep 5
done
"#;

const CLEAN_UP_NODES: &str = r#"#!/bin/sh
# usage: clean_up_nodes.sh <machine uids file> <node names file>
# Deletes every node that is neither listed nor backed by a listed machine.
: "${KUBECTL:?KUBECTL must be set}"
: "${KUBECONFIG:?KUBECONFIG must be set}"
[ -n "$1" ] && [ -n "$2" ] || { echo "machine uids and node names files are required"; exit 1; }
keep=$(mktemp)
cat "$2" > "$keep"
while IFS='' read -r uid; do
    "$KUBECTL" get node --no-headers -l "rke.cattle.io/machine=$uid" \
        -o 'jsonpath={.items[0].metadata.name}' >> "$keep" && echo >> "$keep"
done < "$1"
"$KUBECTL" get nodes --no-headers -o 'jsonpath={range .items[*]}{.metadata.name}{"\n"}{end}' |
while IFS='' read -r node; do
    [ -z "$node" ] && continue
    grep -qxF "$node" "$keep" || "$KUBECTL" delete node "$node" --wait=false
done
rm -f "$keep" "$1" "$2"
"#;

/// System pods shared by both runtimes
const COMMON_POD_SELECTORS: &[&str] = &[
    "kube-system:k8s-app=kube-dns",
    "kube-system:k8s-app=kube-dns-autoscaler",
];

/// Pods from rke2's packaged charts
const RKE2_POD_SELECTORS: &[&str] = &[
    "kube-system:app=rke2-metrics-server",
    "tigera-operator:k8s-app=tigera-operator",
    "calico-system:k8s-app=calico-node",
    "calico-system:k8s-app=calico-kube-controllers",
    "calico-system:k8s-app=calico-typha",
    "kube-system:k8s-app=canal",
    "kube-system:k8s-app=cilium",
    "kube-system:app=rke2-multus",
    "kube-system:app.kubernetes.io/name=rke2-ingress-nginx",
];

/// Inputs fixed for one restore pass
struct RestorePass<'a> {
    pass: Pass<'a>,
    request: &'a EtcdSnapshotRestore,
    snapshot: Option<&'a ETCDSnapshot>,
    /// Idempotence value; changes with every new request
    value: String,
}

impl Planner {
    /// Advance a requested etcd restore by at most one phase
    pub(crate) async fn restore_etcd_snapshot(
        &self,
        pass: Pass<'_>,
        status: &mut RKEControlPlaneStatus,
        plan: &mut Plan,
        current_version: &semver::Version,
    ) -> Result<(), Error> {
        let cp = pass.control_plane;
        let cluster = cp.name_any();
        let Some(request) = cp
            .spec
            .etcd_snapshot_restore
            .as_ref()
            .filter(|r| !r.name.is_empty())
        else {
            if status.etcd_snapshot_restore.take().is_some() {
                return Err(refreshing());
            }
            return Ok(());
        };

        let tracked = status
            .etcd_snapshot_restore
            .as_ref()
            .filter(|op| op.tracks(request))
            .map(|op| op.phase);
        let Some(phase) = tracked else {
            info!(%cluster, snapshot = %request.name, "starting etcd restore");
            status.etcd_snapshot_restore = Some(Operation::start(request.clone()));
            return Err(refreshing());
        };
        if phase == EtcdSnapshotRestorePhase::Finished {
            return Ok(());
        }

        let namespace = cp.namespace().unwrap_or_default();
        let snapshot = self.snapshots.get(&namespace, &request.name).await?;
        if let Some(snapshot) = &snapshot {
            check_snapshot_version(cp, snapshot, current_version)?;
        }
        let restore = RestorePass {
            pass,
            request,
            snapshot: snapshot.as_ref(),
            value: serde_json::to_string(request)?,
        };

        debug!(%cluster, ?phase, "etcd restore phase");
        use EtcdSnapshotRestorePhase::*;
        let (next, message) = match phase {
            Started => {
                if collect(plan, can_be_init_node).is_empty() {
                    return Err(Error::waiting(
                        "waiting for an etcd machine to restore the snapshot onto",
                    ));
                }
                if status.initialized || status.ready {
                    status.initialized = false;
                    status.ready = false;
                    debug!(%cluster, "cleared initialized and ready for etcd restore");
                }
                (Shutdown, "shutting down cluster")
            }
            Shutdown => {
                self.stop_services(&restore, plan).await?;
                status.set_condition(BOOTSTRAPPED, ConditionStatus::False, "", "");
                (Restore, "cluster shutdown complete, running etcd restore")
            }
            Restore => {
                self.run_restore(&restore, plan).await?;
                // a new generation changes every restart stamp
                status.config_generation += 1;
                (PostRestorePodCleanup, "refreshing etcd restore state")
            }
            PostRestorePodCleanup => {
                self.clean_up_pods(&restore, plan).await?;
                (InitialRestartCluster, "refreshing etcd restore state")
            }
            InitialRestartCluster => {
                self.pause_capi_cluster(cp, false).await?;
                info!(%cluster, "initial cluster restart after etcd restore");
                self.full_reconcile(pass, status, plan, true).await?;
                (PostRestoreNodeCleanup, "refreshing etcd restore state")
            }
            PostRestoreNodeCleanup => {
                self.clean_up_nodes(&restore, plan).await?;
                (RestartCluster, "refreshing etcd restore state")
            }
            RestartCluster => {
                self.pause_capi_cluster(cp, false).await?;
                info!(%cluster, "restarting cluster after etcd restore");
                self.full_reconcile(pass, status, plan, true).await?;
                info!(%cluster, snapshot = %request.name, "etcd restore finished");
                (Finished, "refreshing etcd restore state")
            }
            Finished => return Ok(()),
        };
        match status.etcd_snapshot_restore.as_mut() {
            Some(op) => op.advance(next)?,
            None => {
                return Err(Error::internal_with_context(
                    "etcd-restore",
                    "no etcd restore in progress",
                ))
            }
        }
        Err(Error::waiting(message))
    }

    /// Pin the init node to the machine that can restore the snapshot
    async fn restore_init_node(
        &self,
        restore: &RestorePass<'_>,
        plan: &mut Plan,
    ) -> Result<String, Error> {
        let cp = restore.pass.control_plane;
        let cluster = cp.name_any();
        match restore.snapshot {
            Some(snapshot) if !snapshot.is_s3() => {
                if let Some(id) = snapshot.labels().get(MACHINE_ID_LABEL) {
                    info!(%cluster, machine_id = %id, snapshot = %snapshot.name_any(), "designating init node for local snapshot");
                    return designate_init_node(&self.store, plan, |e| {
                        e.machine.label(MACHINE_ID_LABEL) == id.as_str()
                    })
                    .await;
                }
                let node_name = snapshot.snapshot_file.node_name.as_str();
                if node_name.is_empty() {
                    return Err(Error::validation_for(
                        &cluster,
                        format!(
                            "unable to designate machine as label {MACHINE_ID_LABEL} on snapshot {} did not exist",
                            snapshot.name_any()
                        ),
                    ));
                }
                info!(%cluster, node = %node_name, snapshot = %snapshot.name_any(), "designating init node for local snapshot");
                designate_init_node(&self.store, plan, |e| e.machine.node_name() == Some(node_name))
                    .await
            }
            Some(snapshot) => {
                info!(%cluster, snapshot = %snapshot.name_any(), "electing init node for S3 snapshot");
                elect_init_node(&self.store, &*self.clusters, cp, plan, true).await
            }
            None => match collect(plan, can_be_init_node).len() {
                0 => Err(Error::validation_for(
                    &cluster,
                    "no init node existed and no corresponding etcd snapshot found, no assumption can be made for the machine that contains the snapshot",
                )),
                1 => {
                    info!(%cluster, "electing init node for local snapshot without a snapshot object");
                    elect_init_node(&self.store, &*self.clusters, cp, plan, true).await
                }
                _ => Err(Error::validation_for(
                    &cluster,
                    "more than one init node candidate existed and no corresponding etcd snapshot found, no assumption can be made for the machine that contains the snapshot",
                )),
            },
        }
    }

    /// Stop the runtime everywhere and tombstone etcd
    async fn stop_services(&self, restore: &RestorePass<'_>, plan: &mut Plan) -> Result<(), Error> {
        let cp = restore.pass.control_plane;
        let runtime = cp.runtime();
        let join_server = self.restore_init_node(restore, plan).await?;

        let deleting = self.force_delete_all_deleting_etcd_machines(cp, plan).await?;
        if deleting > 0 {
            return Err(Error::waiting(format!(
                "waiting for {deleting} etcd machines to delete"
            )));
        }

        let mut updated = false;
        for mut server in collect(plan, |e| !no_role(e) && !is_windows(e)) {
            let Some(current) = server.plan.as_ref().map(|n| n.plan.clone()) else {
                continue;
            };
            let (stop_plan, joined_server) = self.stop_plan(restore, &server, &join_server).await?;
            if current != stop_plan {
                self.store
                    .update_plan(&mut server, &stop_plan, &joined_server, 0, 0)
                    .await?;
                plan.absorb(&server);
                updated = true;
            }
        }
        if updated {
            return Err(Error::waiting(format!(
                "stopping {runtime} services on control plane and etcd machines/nodes"
            )));
        }

        for server in collect(plan, |e| !no_role(e) && !is_windows(e)) {
            let Some(node) = server.plan.as_ref() else {
                continue;
            };
            if !node.in_sync {
                return Err(Error::waiting(match server.machine.node_name() {
                    Some(node_name) => {
                        format!("waiting to stop {runtime} services on node [{node_name}]")
                    }
                    None => format!(
                        "waiting to stop {runtime} services on machine [{}]",
                        server.name()
                    ),
                }));
            }
        }

        if collect(plan, |e| is_etcd(e) && !is_deleting(e)).is_empty() {
            return Err(Error::waiting(
                "waiting for suitable etcd nodes for etcd restore continuation",
            ));
        }
        Ok(())
    }

    async fn stop_plan(
        &self,
        restore: &RestorePass<'_>,
        server: &PlanEntry,
        join_server: &str,
    ) -> Result<(NodePlan, String), Error> {
        let cp = restore.pass.control_plane;
        let data_dir = cp.distro_data_dir();
        let generated = self
            .generate_plan_with_config_files(restore.pass, server, join_server, true)
            .await?;
        let mut node_plan = generated.plan;

        node_plan.instructions.push(kill_all_instruction(cp));
        let manifests = static_pod_manifests(cp, server);
        if !manifests.is_empty() {
            node_plan.instructions.push(plain_instruction(
                "remove-static-pod-manifests",
                "rm",
                std::iter::once("-f".to_string()).chain(manifests).collect(),
            ));
        }
        // forget earlier restore attempts
        node_plan
            .instructions
            .push(idempotent_cleanup_instruction(cp, "etcd-restore"));
        if is_etcd(server) {
            node_plan.instructions.push(plain_instruction(
                "create-etcd-tombstone",
                "touch",
                vec![format!("{data_dir}/server/db/etcd/tombstone")],
            ));
        }
        if is_etcd(server) || is_control_plane(server) {
            node_plan.instructions.extend([
                plain_instruction(
                    "remove-tls-directory",
                    "rm",
                    vec!["-rf".to_string(), format!("{data_dir}/server/tls")],
                ),
                plain_instruction(
                    "remove-cred-directory",
                    "rm",
                    vec!["-rf".to_string(), format!("{data_dir}/server/cred")],
                ),
            ]);
        }
        Ok((node_plan, generated.joined_server))
    }

    /// Deliver the cluster reset to the designated init node
    async fn run_restore(&self, restore: &RestorePass<'_>, plan: &mut Plan) -> Result<(), Error> {
        let cp = restore.pass.control_plane;
        let join_server = self.restore_init_node(restore, plan).await?;
        let mut init_node = single_init_node(plan)?;

        self.pause_capi_cluster(cp, true).await?;
        let (restore_plan, joined_server) =
            self.restore_plan(restore, &init_node, &join_server).await?;
        self.assign(&mut init_node, &restore_plan, &joined_server, plan)
            .await
    }

    async fn restore_plan(
        &self,
        restore: &RestorePass<'_>,
        entry: &PlanEntry,
        join_server: &str,
    ) -> Result<(NodePlan, String), Error> {
        let cp = restore.pass.control_plane;
        let runtime = cp.runtime();
        // S3 settings come from the snapshot, not the cluster config
        let generated = self
            .generate_plan_with_config_files(restore.pass, entry, join_server, false)
            .await?;
        let mut node_plan = generated.plan;

        let mut args = vec![
            "server".to_string(),
            "--cluster-reset".to_string(),
            format!(
                "--etcd-arg=advertise-client-urls=https://{}:2379",
                cp.loopback_address()
            ),
            "--etcd-disable-snapshots=false".to_string(),
        ];
        let mut env = Vec::new();
        match restore.snapshot {
            Some(snapshot) if snapshot.is_s3() => {
                args.push(format!(
                    "--cluster-reset-restore-path={}",
                    snapshot.snapshot_file.name
                ));
                let s3_args = s3::to_args(
                    &*self.secrets,
                    snapshot.snapshot_file.s3.as_ref(),
                    cp,
                    "etcd-",
                    true,
                )
                .await?;
                args.extend(s3_args.args);
                env = s3_args.env;
                node_plan.files.extend(s3_args.files);
            }
            local => {
                let file = local
                    .map(|s| s.snapshot_file.name.as_str())
                    .unwrap_or(restore.request.name.as_str());
                args.push(format!("--cluster-reset-restore-path=db/snapshots/{file}"));
                args.push("--etcd-s3=false".to_string());
            }
        }

        node_plan.instructions.push(convert_to_idempotent_instruction(
            cp,
            "etcd-restore/restore-kill-all",
            &restore.value,
            &kill_all_instruction(cp),
        ));
        if runtime == Runtime::Rke2 {
            node_plan
                .instructions
                .extend(remove_static_pod_manifests_instruction(
                    cp,
                    entry,
                    "etcd-restore/restore-manifest-removal",
                    &restore.value,
                ));
        }
        // the desired version is installed before the reset runs
        node_plan.instructions.extend([
            install_instruction_skip_start(cp, entry, &self.installer_image(cp)),
            idempotent_instruction(
                cp,
                "etcd-restore/clean-etcd-dir",
                &restore.value,
                "rm",
                &[
                    "-rf".to_string(),
                    format!("{}/server/db/etcd", cp.distro_data_dir()),
                ],
                &[],
            ),
            idempotent_instruction(
                cp,
                "etcd-restore/restore",
                &restore.value,
                runtime.as_str(),
                &args,
                &env,
            ),
        ]);
        Ok((node_plan, generated.joined_server))
    }

    /// Delete system pods so they are rescheduled against the restored state
    ///
    /// The cleanup needs a running API server. An etcd-only init node gets
    /// its regular plan first and the first control plane machine runs the
    /// cleanup once it has joined.
    async fn clean_up_pods(&self, restore: &RestorePass<'_>, plan: &mut Plan) -> Result<(), Error> {
        let pass = restore.pass;
        let cp = pass.control_plane;
        let mut init_node = single_init_node(plan)?;
        let (mut init_plan, _) = self.desired_plan(pass, &init_node, "").await?;

        if is_control_plane(&init_node) {
            let (files, instructions) =
                self.pod_cleanup(restore, &[init_node.machine.uid_str()]);
            init_plan.files.extend(files);
            init_plan.instructions.extend(instructions);
            return self.assign(&mut init_node, &init_plan, "", plan).await;
        }
        self.assign(&mut init_node, &init_plan, "", plan).await?;

        let (_, join_server, _) = find_init_node(plan)?;
        if join_server.is_empty() {
            return Err(Error::waiting("waiting for join server"));
        }
        let mut first = collect(plan, |e| is_control_plane(e) && !is_deleting(e))
            .into_iter()
            .next()
            .ok_or_else(|| {
                Error::internal_with_context(
                    "etcd-restore",
                    "no suitable control plane entries found for post restore cleanup",
                )
            })?;
        let (mut first_plan, joined_server) = self.desired_plan(pass, &first, &join_server).await?;
        let (files, instructions) = self.pod_cleanup(
            restore,
            &[init_node.machine.uid_str(), first.machine.uid_str()],
        );
        first_plan.files.extend(files);
        first_plan.instructions.extend(instructions);
        debug!(cluster = %cp.name_any(), machine = %first.name(), "running pod cleanup on first control plane");
        self.assign(&mut first, &first_plan, &joined_server, plan).await
    }

    fn pod_cleanup(
        &self,
        restore: &RestorePass<'_>,
        machine_uids: &[&str],
    ) -> (Vec<File>, Vec<OneTimeInstruction>) {
        let cp = restore.pass.control_plane;
        let (kubectl, kubeconfig) = kubectl_and_kubeconfig(cp);
        let kube_env = vec![
            format!("KUBECTL={kubectl}"),
            format!("KUBECONFIG={kubeconfig}"),
        ];

        let mut instructions = vec![
            idempotent_instruction(
                cp,
                "etcd-restore/pods-wait-for-podlist",
                &restore.value,
                "/bin/sh",
                &[
                    "-x".to_string(),
                    script_path(cp, WAIT_FOR_POD_LIST_SCRIPT),
                    kubectl.clone(),
                    "--kubeconfig".to_string(),
                    kubeconfig.clone(),
                    "get".to_string(),
                    "pods".to_string(),
                    "--all-namespaces".to_string(),
                ],
                &[],
            ),
            idempotent_instruction(
                cp,
                "etcd-restore/wait-for-desired-ready-nodes",
                &restore.value,
                "/bin/sh",
                &std::iter::once(script_path(cp, WAIT_FOR_READY_SCRIPT))
                    .chain(machine_uids.iter().map(|u| u.to_string()))
                    .collect::<Vec<_>>(),
                &kube_env,
            ),
        ];

        let mut selectors: Vec<String> =
            COMMON_POD_SELECTORS.iter().map(|s| s.to_string()).collect();
        if cp.runtime() == Runtime::Rke2 {
            selectors.extend(RKE2_POD_SELECTORS.iter().map(|s| s.to_string()));
        }
        selectors.extend(self.info.system_pod_label_selectors(cp));

        for (i, selector) in selectors.iter().enumerate() {
            let Some((namespace, labels)) = selector.split_once(':') else {
                continue;
            };
            instructions.push(idempotent_instruction(
                cp,
                &format!("etcd-restore/post-restore-cleanup-pods-{i}"),
                &restore.value,
                &kubectl,
                &[
                    "--kubeconfig".to_string(),
                    kubeconfig.clone(),
                    "delete".to_string(),
                    "pods".to_string(),
                    "-n".to_string(),
                    namespace.to_string(),
                    "-l".to_string(),
                    labels.to_string(),
                    "--wait=false".to_string(),
                ],
                &[],
            ));
        }

        let files = vec![
            script_file(cp, WAIT_FOR_POD_LIST_SCRIPT, WAIT_FOR_POD_LIST),
            script_file(cp, WAIT_FOR_READY_SCRIPT, WAIT_FOR_READY),
        ];
        (files, instructions)
    }

    /// Delete nodes left over from the snapshot that no machine backs
    async fn clean_up_nodes(&self, restore: &RestorePass<'_>, plan: &mut Plan) -> Result<(), Error> {
        let pass = restore.pass;
        let cp = pass.control_plane;
        let mut init_node = single_init_node(plan)?;
        let (mut init_plan, _) = self.desired_plan(pass, &init_node, "").await?;

        let mut machine_uids = String::new();
        let mut node_names = String::new();
        for entry in collect(plan, |e| !is_deleting(e)) {
            let uid = entry.machine.uid_str();
            if !uid.is_empty() {
                machine_uids.push_str(uid);
                machine_uids.push('\n');
            }
            if let Some(node_name) = entry.machine.node_name().filter(|n| !n.is_empty()) {
                node_names.push_str(node_name);
                node_names.push('\n');
            }
        }

        let id = cleanup_identifier(restore.request);
        let uids_path = script_path(cp, &format!("machine-ids-{id}"));
        let names_path = script_path(cp, &format!("node-names-{id}"));
        let (kubectl, kubeconfig) = kubectl_and_kubeconfig(cp);

        init_plan.files.extend([
            script_file(cp, CLEAN_UP_NODES_SCRIPT, CLEAN_UP_NODES),
            dynamic_file(uids_path.clone(), machine_uids),
            dynamic_file(names_path.clone(), node_names),
        ]);
        init_plan.instructions.push(idempotent_instruction(
            cp,
            "etcd-restore/cleanup-nodes",
            &restore.value,
            "/bin/sh",
            &[script_path(cp, CLEAN_UP_NODES_SCRIPT), uids_path, names_path],
            &[format!("KUBECTL={kubectl}"), format!("KUBECONFIG={kubeconfig}")],
        ));
        self.assign(&mut init_node, &init_plan, "", plan).await
    }

    async fn assign(
        &self,
        entry: &mut PlanEntry,
        node_plan: &NodePlan,
        joined_server: &str,
        plan: &mut Plan,
    ) -> Result<(), Error> {
        let limits = self.config.etcd_restore;
        let result = assign_and_check_plan(
            &self.store,
            OPERATION,
            entry,
            node_plan,
            joined_server,
            limits.max_failures,
            limits.failure_threshold,
        )
        .await;
        plan.absorb(entry);
        result
    }
}

fn refreshing() -> Error {
    Error::waiting("refreshing etcd restore state")
}

fn single_init_node(plan: &Plan) -> Result<PlanEntry, Error> {
    let mut init_nodes = collect(plan, is_init_node);
    if init_nodes.len() != 1 {
        return Err(Error::internal_with_context(
            "etcd-restore",
            format!(
                "expected exactly one init node for etcd restore, found {}",
                init_nodes.len()
            ),
        ));
    }
    Ok(init_nodes.remove(0))
}

/// Reject restoring a pre-1.25 snapshot onto 1.25 or later
///
/// Snapshots without readable cluster spec metadata are allowed through.
fn check_snapshot_version(
    control_plane: &RKEControlPlane,
    snapshot: &ETCDSnapshot,
    current: &semver::Version,
) -> Result<(), Error> {
    let recorded = match snapshot_kubernetes_version(snapshot) {
        Ok(Some(version)) => version,
        Ok(None) => return Ok(()),
        Err(e) => {
            error!(
                cluster = %control_plane.name_any(),
                snapshot = %snapshot.name_any(),
                error = %e,
                "unable to parse snapshot cluster spec"
            );
            return Ok(());
        }
    };
    let recorded = super::parse_kubernetes_version(&recorded).map_err(|e| {
        Error::validation_for(
            control_plane.name_any(),
            format!("snapshot kubernetes version {recorded}: {e}"),
        )
    })?;
    if *current >= MINIMUM_SNAPSHOT_VERSION && recorded < MINIMUM_SNAPSHOT_VERSION {
        return Err(Error::validation_for(
            control_plane.name_any(),
            "unable to restore etcd snapshot: recorded Kubernetes version on snapshot was older than v1.25.0 and current cluster version is v1.25.0 or newer",
        ));
    }
    Ok(())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecordedClusterSpec {
    #[serde(default)]
    kubernetes_version: String,
}

/// Kubernetes version recorded in the snapshot's cluster spec metadata
fn snapshot_kubernetes_version(snapshot: &ETCDSnapshot) -> Result<Option<String>, Error> {
    let metadata = &snapshot.snapshot_file.metadata;
    if metadata.is_empty() {
        return Ok(None);
    }
    let engine = base64::engine::general_purpose::STANDARD;
    let decode = |raw: &str| {
        engine
            .decode(raw.trim())
            .map_err(|e| Error::serialization_for_kind("ETCDSnapshot", e.to_string()))
    };

    let fields: std::collections::BTreeMap<String, String> =
        serde_json::from_slice(&decode(metadata)?)?;
    let Some(spec) = fields.get(CLUSTER_SPEC_METADATA_KEY) else {
        return Ok(None);
    };
    let mut json = Vec::new();
    GzDecoder::new(decode(spec)?.as_slice())
        .read_to_end(&mut json)
        .map_err(|e| Error::serialization_for_kind("ETCDSnapshot", e.to_string()))?;
    let spec: RecordedClusterSpec = serde_json::from_slice(&json)?;
    Ok(Some(spec.kubernetes_version).filter(|v| !v.is_empty()))
}

/// Stable per-request suffix for the node cleanup data files
fn cleanup_identifier(request: &EtcdSnapshotRestore) -> String {
    let raw = format!(
        "{}{}{}",
        request.name, request.restore_rke_config, request.generation
    );
    sha256_hex(raw)[..10].to_string()
}

fn kubectl_and_kubeconfig(control_plane: &RKEControlPlane) -> (String, String) {
    let runtime = control_plane.runtime();
    let (kubectl, kubeconfig) = runtime.kubectl_and_kubeconfig();
    match runtime {
        Runtime::Rke2 => (
            format!("{}/bin/kubectl", control_plane.distro_data_dir()),
            kubeconfig.to_string(),
        ),
        Runtime::K3s => (kubectl.to_string(), kubeconfig.to_string()),
    }
}

/// Stop the runtime and everything it started, tolerating a missing install
fn kill_all_instruction(control_plane: &RKEControlPlane) -> OneTimeInstruction {
    let runtime = control_plane.runtime();
    let script = format!("{runtime}-killall.sh");
    OneTimeInstruction {
        common: CommonInstruction {
            name: "shutdown".to_string(),
            command: "/bin/sh".to_string(),
            env: vec![format!(
                "{}_DATA_DIR={}",
                runtime.env_name(),
                control_plane.distro_data_dir()
            )],
            args: vec![
                "-c".to_string(),
                format!(
                    "if [ -z $(command -v {runtime}) ] && [ -z $(command -v {script}) ]; then echo {runtime} does not appear to be installed; exit 0; else {script}; fi"
                ),
            ],
            ..Default::default()
        },
        save_output: false,
    }
}

fn plain_instruction(name: &str, command: &str, args: Vec<String>) -> OneTimeInstruction {
    OneTimeInstruction {
        common: CommonInstruction {
            name: name.to_string(),
            command: command.to_string(),
            args,
            ..Default::default()
        },
        save_output: false,
    }
}

fn script_path(control_plane: &RKEControlPlane, file: &str) -> String {
    format!("{}/{BIN_PREFIX}/{file}", control_plane.distro_data_dir())
}

fn script_file(control_plane: &RKEControlPlane, file: &str, content: &str) -> File {
    dynamic_file(script_path(control_plane, file), content)
}

fn dynamic_file(path: String, content: impl AsRef<[u8]>) -> File {
    let mut file = File::new(path, content);
    file.dynamic = true;
    file
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::io::Write;
    use std::sync::Arc;

    use flate2::write::GzEncoder;
    use flate2::Compression;
    use k8s_openapi::api::core::v1::ObjectReference;

    use capr_common::crd::{EtcdS3, MachineStatus};

    use super::*;
    use crate::client::{
        MockClusterStore, MockMachineStore, MockPlanSecretStore, MockSecretReader,
        MockSnapshotStore, ReleaseData,
    };
    use crate::filters::tests::entry;
    use crate::plan::ClusterTokens;
    use crate::planner::generate::tests::{control_plane, info, init, planner};
    use crate::settings::PlannerConfig;

    fn snapshot_with_version(version: &str) -> ETCDSnapshot {
        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        gz.write_all(format!(r#"{{"kubernetesVersion":"{version}"}}"#).as_bytes())
            .expect("gzip");
        let engine = base64::engine::general_purpose::STANDARD;
        let spec = engine.encode(gz.finish().expect("gzip"));
        let fields = BTreeMap::from([(CLUSTER_SPEC_METADATA_KEY.to_string(), spec)]);
        let mut snapshot = ETCDSnapshot::default();
        snapshot.metadata.name = Some("prod-snap".to_string());
        snapshot.snapshot_file.metadata =
            engine.encode(serde_json::to_vec(&fields).expect("json"));
        snapshot
    }

    fn pass_parts() -> (ReleaseData, ClusterTokens) {
        (ReleaseData::default(), ClusterTokens::default())
    }

    fn restore_for<'a>(
        pass: Pass<'a>,
        request: &'a EtcdSnapshotRestore,
        snapshot: Option<&'a ETCDSnapshot>,
    ) -> RestorePass<'a> {
        RestorePass {
            pass,
            request,
            snapshot,
            value: serde_json::to_string(request).expect("json"),
        }
    }

    fn instruction_keys(plan: &NodePlan) -> Vec<String> {
        plan.instructions
            .iter()
            .map(|i| {
                if i.common.name.starts_with("idempotent-") {
                    i.common.args[2].clone()
                } else {
                    i.common.name.clone()
                }
            })
            .collect()
    }

    #[test]
    fn test_snapshot_version_is_read_from_metadata() {
        let snapshot = snapshot_with_version("v1.24.17+rke2r1");
        assert_eq!(
            snapshot_kubernetes_version(&snapshot).expect("parse"),
            Some("v1.24.17+rke2r1".to_string())
        );
        assert_eq!(
            snapshot_kubernetes_version(&ETCDSnapshot::default()).expect("empty"),
            None
        );
    }

    #[test]
    fn test_old_snapshot_cannot_restore_onto_new_cluster() {
        let cp = control_plane();
        let current = semver::Version::new(1, 29, 4);
        let err = check_snapshot_version(&cp, &snapshot_with_version("v1.24.17+rke2r1"), &current)
            .expect_err("too old");
        assert!(err.to_string().contains("v1.25.0"));

        check_snapshot_version(&cp, &snapshot_with_version("v1.28.9+rke2r1"), &current)
            .expect("same era");
        check_snapshot_version(
            &cp,
            &snapshot_with_version("v1.24.17+rke2r1"),
            &semver::Version::new(1, 24, 17),
        )
        .expect("both old");
    }

    #[test]
    fn test_unreadable_metadata_is_not_fatal() {
        let mut snapshot = ETCDSnapshot::default();
        snapshot.snapshot_file.metadata = "not base64!".to_string();
        check_snapshot_version(&control_plane(), &snapshot, &semver::Version::new(1, 29, 0))
            .expect("allowed through");
    }

    #[test]
    fn test_cleanup_identifier_changes_with_generation() {
        let mut request = EtcdSnapshotRestore {
            name: "snap".to_string(),
            generation: 1,
            restore_rke_config: "none".to_string(),
        };
        let first = cleanup_identifier(&request);
        assert_eq!(first.len(), 10);
        request.generation = 2;
        assert_ne!(first, cleanup_identifier(&request));
    }

    #[tokio::test]
    async fn test_stop_plan_tombstones_etcd_and_clears_certificates() {
        let cp = control_plane();
        let (release, tokens) = pass_parts();
        let pass = Pass {
            control_plane: &cp,
            release: &release,
            tokens: &tokens,
        };
        let request = EtcdSnapshotRestore {
            name: "snap".to_string(),
            ..Default::default()
        };
        let restore = restore_for(pass, &request, None);
        let planner = planner(info(vec![]));

        let (etcd_plan, _) = planner
            .stop_plan(&restore, &init(entry("a", &["etcd"])), "")
            .await
            .expect("plan");
        let keys = instruction_keys(&etcd_plan);
        assert_eq!(keys[0], "shutdown");
        assert_eq!(keys[1], "remove-static-pod-manifests");
        assert!(keys.contains(&"create-etcd-tombstone".to_string()));
        assert!(keys.contains(&"remove-tls-directory".to_string()));

        let (worker_plan, _) = planner
            .stop_plan(&restore, &entry("w", &["worker"]), "https://a:9345")
            .await
            .expect("plan");
        let keys = instruction_keys(&worker_plan);
        assert!(!keys.contains(&"create-etcd-tombstone".to_string()));
        assert!(!keys.contains(&"remove-tls-directory".to_string()));
        assert!(!keys.contains(&"remove-static-pod-manifests".to_string()));
    }

    #[tokio::test]
    async fn test_local_restore_plan_resets_from_snapshot_dir() {
        let cp = control_plane();
        let (release, tokens) = pass_parts();
        let pass = Pass {
            control_plane: &cp,
            release: &release,
            tokens: &tokens,
        };
        let request = EtcdSnapshotRestore {
            name: "prod-snap".to_string(),
            ..Default::default()
        };
        let mut snapshot = ETCDSnapshot::default();
        snapshot.snapshot_file.name = "on-demand-a-1700000000".to_string();
        let restore = restore_for(pass, &request, Some(&snapshot));

        let (node_plan, _) = planner(info(vec![]))
            .restore_plan(&restore, &init(entry("a", &["etcd", "cp"])), "")
            .await
            .expect("plan");
        let keys = instruction_keys(&node_plan);
        assert_eq!(
            keys,
            vec![
                "rke2-etcd-restore/restore-kill-all",
                "rke2-etcd-restore/restore-manifest-removal",
                "install",
                "rke2-etcd-restore/clean-etcd-dir",
                "rke2-etcd-restore/restore",
            ]
        );
        let restore_args = &node_plan.instructions[4].common.args;
        assert!(restore_args.contains(
            &"--cluster-reset-restore-path=db/snapshots/on-demand-a-1700000000".to_string()
        ));
        assert!(restore_args.contains(&"--etcd-s3=false".to_string()));
    }

    #[tokio::test]
    async fn test_s3_restore_plan_renders_snapshot_target() {
        let cp = control_plane();
        let (release, tokens) = pass_parts();
        let pass = Pass {
            control_plane: &cp,
            release: &release,
            tokens: &tokens,
        };
        let request = EtcdSnapshotRestore {
            name: "prod-snap".to_string(),
            ..Default::default()
        };
        let mut snapshot = ETCDSnapshot::default();
        snapshot.snapshot_file.name = "prod-snap-s3".to_string();
        snapshot.snapshot_file.s3 = Some(EtcdS3 {
            bucket: "backups".to_string(),
            ..Default::default()
        });
        let restore = restore_for(pass, &request, Some(&snapshot));

        let (node_plan, _) = planner(info(vec![]))
            .restore_plan(&restore, &init(entry("a", &["etcd"])), "")
            .await
            .expect("plan");
        let restore_args = &node_plan
            .instructions
            .last()
            .expect("restore instruction")
            .common
            .args;
        assert!(restore_args.contains(&"--cluster-reset-restore-path=prod-snap-s3".to_string()));
        assert!(restore_args.contains(&"--etcd-s3-bucket=backups".to_string()));
        assert!(!restore_args.contains(&"--etcd-s3=false".to_string()));
    }

    #[test]
    fn test_pod_cleanup_adds_custom_selectors() {
        let mut cp = control_plane();
        cp.spec.kubernetes_version = "v1.29.4+k3s1".to_string();
        let (release, tokens) = pass_parts();
        let pass = Pass {
            control_plane: &cp,
            release: &release,
            tokens: &tokens,
        };
        let request = EtcdSnapshotRestore::default();
        let restore = restore_for(pass, &request, None);

        let mut provider = info(vec![]);
        provider
            .expect_system_pod_label_selectors()
            .returning(|_| vec!["cattle-system:app=agent".to_string(), "bad".to_string()]);
        let (files, instructions) = planner(provider).pod_cleanup(&restore, &["uid-a"]);

        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|f| f.dynamic));
        // two waits, two common selectors, one custom; the malformed one is skipped
        assert_eq!(instructions.len(), 5);
        let last = &instructions[4].common.args;
        assert!(last.contains(&"cattle-system".to_string()));
        assert!(last.contains(&"app=agent".to_string()));
    }

    /// Story: a restore is requested before any etcd machine exists. The
    /// request is recorded, then parks in Started until a machine that can
    /// hold the snapshot shows up; status flags stay untouched meanwhile.
    #[tokio::test]
    async fn story_restore_waits_in_started_without_candidates() {
        let mut cp = control_plane();
        cp.spec.etcd_snapshot_restore = Some(EtcdSnapshotRestore {
            name: "prod-snap".to_string(),
            generation: 1,
            ..Default::default()
        });
        let (release, tokens) = pass_parts();
        let pass = Pass {
            control_plane: &cp,
            release: &release,
            tokens: &tokens,
        };
        let mut snapshots = MockSnapshotStore::new();
        snapshots.expect_get().returning(|_, _| Ok(None));
        let mut secrets = MockSecretReader::new();
        secrets.expect_get_secret().returning(|_, _| Ok(None));
        let planner = Planner::for_testing(
            Arc::new(MockMachineStore::new()),
            Arc::new(MockPlanSecretStore::new()),
            Arc::new(MockClusterStore::new()),
            Arc::new(secrets),
            Arc::new(snapshots),
            Arc::new(info(vec![])),
            PlannerConfig::default(),
        );
        let mut status = RKEControlPlaneStatus {
            initialized: true,
            ready: true,
            ..Default::default()
        };
        let mut plan = Plan::default();
        let current = semver::Version::new(1, 29, 4);

        let err = planner
            .restore_etcd_snapshot(pass, &mut status, &mut plan, &current)
            .await
            .expect_err("recorded");
        assert_eq!(err.to_string(), "refreshing etcd restore state");

        for _ in 0..2 {
            let err = planner
                .restore_etcd_snapshot(pass, &mut status, &mut plan, &current)
                .await
                .expect_err("parked");
            assert!(err.is_waiting());
            assert_eq!(status.restore_phase(), Some(EtcdSnapshotRestorePhase::Started));
        }
        assert!(status.initialized);

        // an etcd machine appears; the next pass moves on and takes the
        // cluster down
        let mut candidate = entry("a", &["etcd"]);
        candidate.machine.status = Some(MachineStatus {
            node_ref: Some(ObjectReference {
                name: Some("node-a".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        });
        plan.machines
            .insert("a".to_string(), candidate.machine.clone());
        plan.absorb(&candidate);
        let err = planner
            .restore_etcd_snapshot(pass, &mut status, &mut plan, &current)
            .await
            .expect_err("shutting down");
        assert_eq!(err.to_string(), "shutting down cluster");
        assert_eq!(status.restore_phase(), Some(EtcdSnapshotRestorePhase::Shutdown));
        assert!(!status.initialized && !status.ready);
    }
}
