//! Secrets encryption key rotation
//!
//! Runs `secrets-encrypt prepare`, `rotate` and `reencrypt` on a single
//! leader, restarting every server after each command so they all load the
//! new key set. The leader's reported stage is scraped from saved command
//! output and followers must report the same stage after their restart.
//!
//! Any failure latches the phase to Failed. Half-rotated keys cannot be
//! rolled forward safely, so recovery is an etcd restore rather than a retry.

use kube::ResourceExt;
use tracing::{debug, info, warn};

use capr_common::crd::conditions::READY;
use capr_common::crd::{
    Conditions, EncryptionKeyRotationPhase, Operation, Phase, RKEControlPlane,
    RKEControlPlaneStatus,
};
use capr_common::runtime::Runtime;
use capr_common::Error;

use super::{Pass, Planner};
use crate::election::find_init_node;
use crate::filters::{
    collect, entry_for, is_control_plane, is_deleting, is_etcd, is_init_node,
};
use crate::instructions::{
    idempotent_instruction, idempotent_restart_instructions,
    remove_static_pod_manifests_instruction,
};
use crate::plan::{
    CommonInstruction, File, NodePlan, OneTimeInstruction, PeriodicInstruction, Plan, PlanEntry,
};
use crate::probes::probes;
use crate::settings::FailureLimits;
use crate::store::assign_and_check_plan;

const OPERATION: &str = "encryption key rotation";

const FEATURE_NAME: &str = "encryption-key-rotation";
/// Feature major that works; 1.x releases shipped a broken rotation
const SUPPORTED_FEATURE_MAJOR: u64 = 2;

const STAGE_REENCRYPT_REQUEST: &str = "reencrypt_request";
const STAGE_REENCRYPT_ACTIVE: &str = "reencrypt_active";
const STAGE_REENCRYPT_FINISHED: &str = "reencrypt_finished";

const STATUS_COMMAND_NAME: &str = "secrets-encrypt-status";
const STAGE_PREFIX: &str = "Current Rotation Stage: ";

const CONTAINERD_ENDPOINT_ENV: &str =
    "CONTAINER_RUNTIME_ENDPOINT=unix:///var/run/k3s/containerd/containerd.sock";

const WAIT_FOR_SYSTEMCTL_SCRIPT: &str = "wait_for_systemctl_status.sh";
const WAIT_FOR_STATUS_SCRIPT: &str = "wait_for_secrets_encrypt_status.sh";
const STATUS_SCRIPT: &str = "secrets_encrypt_status.sh";

const WAIT_FOR_SYSTEMCTL: &str = r#"#!/bin/sh
# usage: wait_for_systemctl_status.sh <unit>
for _ in $(seq 1 30); do
    systemctl is-active "$1" && exit 0
    sleep 10
done
exit 1
"#;

const WAIT_FOR_STATUS: &str = r#"#!/bin/sh
# usage: wait_for_secrets_encrypt_status.sh <runtime>
for _ in $(seq 1 10); do
    "$1" secrets-encrypt status && exit 0
    sleep 10
done
exit 1
"#;

const STATUS: &str = r#"#!/bin/sh
# usage: secrets_encrypt_status.sh <runtime> [expected stage]
for _ in $(seq 1 10); do
    if output="$("$1" secrets-encrypt status)"; then
        if [ -z "$2" ]; then
            exit 0
        fi
        echo "$output" | grep -q "$2" && exit 0
    fi
    sleep 10
done
exit 1
"#;

impl Planner {
    /// Advance a requested encryption key rotation by at most one phase
    pub(crate) async fn rotate_encryption_keys(
        &self,
        pass: Pass<'_>,
        status: &mut RKEControlPlaneStatus,
        plan: &mut Plan,
    ) -> Result<(), Error> {
        let cp = pass.control_plane;
        let cluster = cp.name_any();
        let Some(request) = cp.spec.rotate_encryption_keys.as_ref() else {
            if status.rotate_encryption_keys.is_none() {
                return Ok(());
            }
            status.rotate_encryption_keys = None;
            status.rotate_encryption_keys_leader.clear();
            return Err(refreshing());
        };

        if !rotation_supported(pass)? {
            if status
                .rotate_encryption_keys
                .as_ref()
                .is_some_and(|op| op.tracks(request) && op.phase == EncryptionKeyRotationPhase::Failed)
            {
                return Ok(());
            }
            debug!(
                %cluster,
                version = %cp.spec.kubernetes_version,
                "encryption key rotation not supported by release"
            );
            status.rotate_encryption_keys = Some(Operation {
                request: request.clone(),
                phase: EncryptionKeyRotationPhase::Failed,
            });
            return Err(refreshing());
        }

        let in_progress = status
            .encryption_key_phase()
            .is_some_and(EncryptionKeyRotationPhase::in_progress);
        let ready = status.is_true(READY);
        if !ready && !in_progress {
            return Ok(());
        }
        if status
            .rotate_encryption_keys
            .as_ref()
            .is_some_and(|op| op.tracks(request) && op.phase.is_terminal())
        {
            return Ok(());
        }

        if !status.initialized {
            warn!(%cluster, "skipping encryption key rotation, cluster not initialized");
            return Ok(());
        }

        let (found, join_server, init_node) = find_init_node(plan)?;
        let Some(init_node) = init_node.filter(|_| found && !join_server.is_empty()) else {
            warn!(%cluster, "skipping encryption key rotation, cluster has no init node");
            return Ok(());
        };

        if !in_progress {
            info!(%cluster, generation = request.generation, "starting encryption key rotation");
            status.rotate_encryption_keys = Some(Operation::start(request.clone()));
            return Err(refreshing());
        }
        let Some(phase) = status.encryption_key_phase() else {
            return Err(refreshing());
        };

        let leader = find_leader(status, plan, &init_node, phase)?;
        if status.rotate_encryption_keys_leader != leader.name() {
            status.rotate_encryption_keys_leader = leader.name().to_string();
            return Err(Error::waiting(format!(
                "elected {} as control plane leader for encryption key rotation",
                leader.name()
            )));
        }

        debug!(%cluster, %phase, leader = %leader.name(), "encryption key rotation phase");
        let rotation = Rotation {
            pass,
            phase,
            generation: request.generation.to_string(),
            join_server: &join_server,
        };
        use EncryptionKeyRotationPhase::*;
        let next = match phase {
            Prepare => {
                self.pause_capi_cluster(cp, true)
                    .await
                    .map_err(|_| Error::waiting("pausing CAPI cluster"))?;
                self.leader_phase(&rotation, status, plan, leader).await?;
                PostPrepareRestart
            }
            Rotate => {
                self.leader_phase(&rotation, status, plan, leader).await?;
                PostRotateRestart
            }
            Reencrypt => {
                self.leader_phase(&rotation, status, plan, leader).await?;
                PostReencryptRestart
            }
            PostPrepareRestart => {
                self.restart_nodes(&rotation, status, plan, &leader, &init_node)
                    .await?;
                Rotate
            }
            PostRotateRestart => {
                self.restart_nodes(&rotation, status, plan, &leader, &init_node)
                    .await?;
                Reencrypt
            }
            PostReencryptRestart => {
                self.restart_nodes(&rotation, status, plan, &leader, &init_node)
                    .await?;
                self.pause_capi_cluster(cp, false)
                    .await
                    .map_err(|_| Error::waiting("unpausing CAPI cluster"))?;
                status.rotate_encryption_keys_leader.clear();
                info!(%cluster, "encryption key rotation complete");
                Done
            }
            Done | Failed => return Ok(()),
        };
        advance(status, next)?;
        Err(refreshing())
    }

    /// Run the phase's `secrets-encrypt` command on the leader and verify
    /// the stage it reports
    async fn leader_phase(
        &self,
        rotation: &Rotation<'_>,
        status: &mut RKEControlPlaneStatus,
        plan: &mut Plan,
        mut leader: PlanEntry,
    ) -> Result<(), Error> {
        let cp = rotation.pass.control_plane;
        let generated = self
            .generate_plan_with_config_files(rotation.pass, &leader, rotation.join_server, true)
            .await?;
        let apply = match secrets_encrypt_instruction(rotation) {
            Ok(apply) => apply,
            Err(e) => return Err(failed(status, e)),
        };

        let mut node_plan = generated.plan;
        node_plan.files.extend([
            script_file(cp, WAIT_FOR_STATUS_SCRIPT, WAIT_FOR_STATUS),
            script_file(cp, STATUS_SCRIPT, STATUS),
        ]);
        node_plan.instructions = vec![
            apply,
            status_script_instruction(rotation, ""),
            status_instruction(rotation),
        ];
        node_plan.periodic_instructions = vec![status_periodic_instruction(cp)];

        let limits = self.config.encryption_key_rotation_leader;
        let result = self
            .assign_rotation_plan(rotation, &mut leader, &node_plan, &generated.joined_server, limits)
            .await;
        plan.absorb(&leader);
        match result {
            Ok(()) => {}
            Err(e) if e.is_waiting() => {
                if e.to_string().starts_with("starting") {
                    info!(
                        cluster = %cp.name_any(),
                        phase = %rotation.phase,
                        leader = %leader.name(),
                        "applying encryption key rotation command"
                    );
                }
                return Err(e);
            }
            Err(e) => return Err(failed(status, e)),
        }

        let stage = stage_from_output(&leader)?;
        let periodic = stage_from_periodic(&leader)?;
        if let Err(e) = stage_allowed(&stage, rotation.phase) {
            return Err(failed(status, e));
        }
        if (stage == STAGE_REENCRYPT_REQUEST || stage == STAGE_REENCRYPT_ACTIVE)
            && periodic != STAGE_REENCRYPT_FINISHED
        {
            return Err(Error::waiting(
                "waiting for encryption key rotation stage to be finished",
            ));
        }
        info!(
            cluster = %cp.name_any(),
            phase = %rotation.phase,
            %stage,
            "encryption key rotation command applied"
        );
        Ok(())
    }

    /// Restart servers in an order that keeps etcd membership anchored
    ///
    /// When the leader isn't the init node, the init node and the other
    /// etcd-only machines restart first. Then the leader, whose reported
    /// stage every remaining control plane machine must match.
    async fn restart_nodes(
        &self,
        rotation: &Rotation<'_>,
        status: &mut RKEControlPlaneStatus,
        plan: &mut Plan,
        leader: &PlanEntry,
        init_node: &PlanEntry,
    ) -> Result<(), Error> {
        let leader_name = leader.name().to_string();

        if !is_init_node(leader) {
            debug!(leader = %leader_name, "leader is not the init node, restarting etcd first");
            self.restart_service(rotation, status, plan, init_node.clone(), false, "")
                .await?;
            let etcd_followers: Vec<PlanEntry> = collect(plan, is_etcd)
                .into_iter()
                .filter(|e| !is_control_plane(e) && !is_init_node(e) && e.name() != leader_name)
                .collect();
            for entry in etcd_followers {
                self.restart_service(rotation, status, plan, entry, false, "")
                    .await?;
            }
        }

        let leader_stage = self
            .restart_service(rotation, status, plan, leader.clone(), true, "")
            .await?;

        let followers: Vec<PlanEntry> = collect(plan, is_control_plane)
            .into_iter()
            .filter(|e| !is_init_node(e) && e.name() != leader_name)
            .collect();
        for entry in followers {
            let name = entry.name().to_string();
            let stage = self
                .restart_service(rotation, status, plan, entry, true, &leader_stage)
                .await?;
            if stage != leader_stage {
                return Err(failed(
                    status,
                    Error::internal_with_context(
                        "encryption",
                        format!(
                            "leader [{leader_name}] with {leader_stage} stage and follower [{name}] with {stage} stage"
                        ),
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Restart one server and return its reported stage when asked
    async fn restart_service(
        &self,
        rotation: &Rotation<'_>,
        status: &mut RKEControlPlaneStatus,
        plan: &mut Plan,
        mut entry: PlanEntry,
        scrape_stage: bool,
        leader_stage: &str,
    ) -> Result<String, Error> {
        let cp = rotation.pass.control_plane;
        let runtime = cp.runtime();
        let phase = rotation.phase.to_string().to_lowercase();
        let generated = self
            .generate_plan_with_config_files(rotation.pass, &entry, rotation.join_server, true)
            .await?;

        let mut node_plan = generated.plan;
        node_plan
            .files
            .push(script_file(cp, WAIT_FOR_SYSTEMCTL_SCRIPT, WAIT_FOR_SYSTEMCTL));
        node_plan.instructions.clear();
        if runtime == Runtime::Rke2 {
            node_plan
                .instructions
                .extend(remove_static_pod_manifests_instruction(
                    cp,
                    &entry,
                    &format!("encryption-key-rotation/manifest-cleanup/{phase}"),
                    &rotation.generation,
                ));
        }
        node_plan.instructions.extend(idempotent_restart_instructions(
            cp,
            &format!("encryption-key-rotation/restart/{phase}"),
            &rotation.generation,
            runtime.server_unit(),
        ));
        node_plan
            .instructions
            .push(wait_for_systemctl_instruction(rotation));

        if is_control_plane(&entry) {
            node_plan.files.extend([
                script_file(cp, STATUS_SCRIPT, STATUS),
                script_file(cp, WAIT_FOR_STATUS_SCRIPT, WAIT_FOR_STATUS),
            ]);
            node_plan.instructions.extend([
                wait_for_status_instruction(rotation),
                status_script_instruction(rotation, leader_stage),
                status_instruction(rotation),
            ]);
        }
        node_plan.probes = probes(cp, &entry, &generated.config);

        let limits = self.config.encryption_key_rotation;
        let result = self
            .assign_rotation_plan(rotation, &mut entry, &node_plan, &generated.joined_server, limits)
            .await;
        plan.absorb(&entry);
        match result {
            Ok(()) => {}
            Err(e) if e.is_waiting() => return Err(e),
            Err(e) => return Err(failed(status, e)),
        }

        if !scrape_stage || !is_control_plane(&entry) {
            return Ok(String::new());
        }
        stage_from_output(&entry)
    }

    async fn assign_rotation_plan(
        &self,
        rotation: &Rotation<'_>,
        entry: &mut PlanEntry,
        node_plan: &NodePlan,
        joined_server: &str,
        limits: FailureLimits,
    ) -> Result<(), Error> {
        let message = format!(
            "encryption key rotation [{}] for machine [{}]",
            rotation.phase,
            entry.name()
        );
        assign_and_check_plan(
            &self.store,
            &message,
            entry,
            node_plan,
            joined_server,
            limits.max_failures,
            limits.failure_threshold,
        )
        .await
    }
}

/// Inputs fixed for one phase of a rotation
struct Rotation<'a> {
    pass: Pass<'a>,
    phase: EncryptionKeyRotationPhase,
    generation: String,
    join_server: &'a str,
}

fn refreshing() -> Error {
    Error::waiting("refreshing encryption key rotation state")
}

fn advance(
    status: &mut RKEControlPlaneStatus,
    next: EncryptionKeyRotationPhase,
) -> Result<(), Error> {
    match status.rotate_encryption_keys.as_mut() {
        Some(op) => op.advance(next),
        None => Err(Error::internal_with_context(
            "encryption",
            "no encryption key rotation in progress",
        )),
    }
}

/// Latch the rotation to Failed and wrap the cause
fn failed(status: &mut RKEControlPlaneStatus, cause: Error) -> Error {
    if let Err(e) = advance(status, EncryptionKeyRotationPhase::Failed) {
        warn!(error = %e, "could not mark encryption key rotation failed");
    }
    Error::operation_failed(
        OPERATION,
        format!("{cause}, please perform an etcd restore"),
    )
}

fn rotation_supported(pass: Pass<'_>) -> Result<bool, Error> {
    let Some(version) = pass.release.feature_versions.get(FEATURE_NAME) else {
        return Ok(false);
    };
    let version = semver::Version::parse(version).map_err(|e| {
        Error::validation_for(
            pass.control_plane.name_any(),
            format!("unable to parse semver version for encryption key rotation: {version}: {e}"),
        )
    })?;
    Ok(version.major == SUPPORTED_FEATURE_MAJOR)
}

/// Control plane machine that can lead: not deleting, registered, Ready
fn suitable_leader(entry: &PlanEntry) -> bool {
    is_control_plane(entry)
        && !is_deleting(entry)
        && entry.machine.node_name().is_some()
        && entry
            .machine
            .status
            .as_ref()
            .is_some_and(|s| s.conditions.is_true(READY))
}

/// Keep the recorded leader while it stays suitable; elect only in Prepare
fn find_leader(
    status: &RKEControlPlaneStatus,
    plan: &Plan,
    init_node: &PlanEntry,
    phase: EncryptionKeyRotationPhase,
) -> Result<PlanEntry, Error> {
    if let Some(current) = entry_for(plan, &status.rotate_encryption_keys_leader) {
        if suitable_leader(&current) {
            return Ok(current);
        }
    }

    if phase != EncryptionKeyRotationPhase::Prepare {
        return Err(Error::internal_with_context(
            "encryption",
            format!("cannot elect control plane leader in phase {phase}"),
        ));
    }

    if is_control_plane(init_node) {
        return Ok(init_node.clone());
    }
    collect(plan, suitable_leader)
        .into_iter()
        .next()
        .ok_or_else(|| {
            Error::internal_with_context(
                "encryption",
                "no suitable control plane nodes for encryption key rotation",
            )
        })
}

fn secrets_encrypt_instruction(rotation: &Rotation<'_>) -> Result<OneTimeInstruction, Error> {
    let command = match rotation.phase {
        EncryptionKeyRotationPhase::Prepare => "prepare",
        EncryptionKeyRotationPhase::Rotate => "rotate",
        EncryptionKeyRotationPhase::Reencrypt => "reencrypt",
        other => {
            return Err(Error::internal_with_context(
                "encryption",
                format!("cannot determine desired secrets-encrypt command for phase: [{other}]"),
            ))
        }
    };
    let cp = rotation.pass.control_plane;
    Ok(idempotent_instruction(
        cp,
        &format!(
            "encryption-key-rotation/{}",
            rotation.phase.to_string().to_lowercase()
        ),
        &rotation.generation,
        cp.runtime().as_str(),
        &["secrets-encrypt".to_string(), command.to_string()],
        &[],
    ))
}

/// Stage and generation env vars
///
/// Etcd-only followers would otherwise get byte-identical plans across
/// phases and the agent would not rerun them.
fn rotation_env(rotation: &Rotation<'_>) -> Vec<String> {
    vec![
        format!("ENCRYPTION_KEY_ROTATION_STAGE={}", rotation.phase),
        format!("ENCRYPTION_KEY_ROTATION_GENERATION={}", rotation.generation),
    ]
}

fn script_path(control_plane: &RKEControlPlane, script: &str) -> String {
    format!(
        "{}/capr/encryption-key-rotation/bin/{script}",
        control_plane.distro_data_dir()
    )
}

fn script_file(control_plane: &RKEControlPlane, script: &str, content: &str) -> File {
    File {
        permissions: "0700".to_string(),
        ..File::new(script_path(control_plane, script), content)
    }
}

fn sh_instruction(name: &str, args: Vec<String>, env: Vec<String>, save_output: bool) -> OneTimeInstruction {
    OneTimeInstruction {
        common: CommonInstruction {
            name: name.to_string(),
            command: "sh".to_string(),
            args,
            env,
            ..Default::default()
        },
        save_output,
    }
}

fn wait_for_systemctl_instruction(rotation: &Rotation<'_>) -> OneTimeInstruction {
    let cp = rotation.pass.control_plane;
    let mut env = vec![CONTAINERD_ENDPOINT_ENV.to_string()];
    env.extend(rotation_env(rotation));
    sh_instruction(
        "wait-for-systemctl-status",
        vec![
            "-x".to_string(),
            script_path(cp, WAIT_FOR_SYSTEMCTL_SCRIPT),
            cp.runtime().server_unit().to_string(),
        ],
        env,
        false,
    )
}

fn wait_for_status_instruction(rotation: &Rotation<'_>) -> OneTimeInstruction {
    let cp = rotation.pass.control_plane;
    let mut env = vec![CONTAINERD_ENDPOINT_ENV.to_string()];
    env.extend(rotation_env(rotation));
    sh_instruction(
        "wait-for-secrets-encrypt-status",
        vec![
            "-x".to_string(),
            script_path(cp, WAIT_FOR_STATUS_SCRIPT),
            cp.runtime().as_str().to_string(),
        ],
        env,
        true,
    )
}

/// Block until `secrets-encrypt status` mentions `expected`, if given
fn status_script_instruction(rotation: &Rotation<'_>, expected: &str) -> OneTimeInstruction {
    let cp = rotation.pass.control_plane;
    let mut args = vec![
        "-x".to_string(),
        script_path(cp, STATUS_SCRIPT),
        cp.runtime().as_str().to_string(),
    ];
    if !expected.is_empty() {
        args.push(expected.to_string());
    }
    sh_instruction("secrets-encrypt-status-script", args, rotation_env(rotation), false)
}

fn status_instruction(rotation: &Rotation<'_>) -> OneTimeInstruction {
    OneTimeInstruction {
        common: CommonInstruction {
            name: STATUS_COMMAND_NAME.to_string(),
            command: rotation.pass.control_plane.runtime().as_str().to_string(),
            args: vec!["secrets-encrypt".to_string(), "status".to_string()],
            env: rotation_env(rotation),
            ..Default::default()
        },
        save_output: true,
    }
}

fn status_periodic_instruction(control_plane: &RKEControlPlane) -> PeriodicInstruction {
    PeriodicInstruction {
        common: CommonInstruction {
            name: STATUS_COMMAND_NAME.to_string(),
            command: control_plane.runtime().as_str().to_string(),
            args: vec!["secrets-encrypt".to_string(), "status".to_string()],
            ..Default::default()
        },
        period_seconds: 5,
        save_stderr_output: false,
    }
}

/// Stage from the saved one-time status output
fn stage_from_output(entry: &PlanEntry) -> Result<String, Error> {
    let output = entry
        .plan
        .as_ref()
        .and_then(|n| n.output.get(STATUS_COMMAND_NAME))
        .ok_or_else(|| {
            Error::waiting(format!(
                "could not extract current status from plan for [{}]: no output for status",
                entry.name()
            ))
        })?;
    parse_stage(entry.name(), &String::from_utf8_lossy(output))
}

/// Stage from the periodic status output
fn stage_from_periodic(entry: &PlanEntry) -> Result<String, Error> {
    let Some(node) = entry.plan.as_ref() else {
        return Err(Error::waiting(format!(
            "could not extract current status from plan for [{}]: no plan",
            entry.name()
        )));
    };
    match node.periodic_output.get(STATUS_COMMAND_NAME) {
        Some(output) => parse_stage(entry.name(), &String::from_utf8_lossy(&output.stdout)),
        None if node
            .plan
            .periodic_instructions
            .iter()
            .any(|p| p.common.name == STATUS_COMMAND_NAME) =>
        {
            Err(Error::waiting(format!(
                "could not extract current status from plan for [{}]: no output for status",
                entry.name()
            )))
        }
        None => Err(Error::internal_with_context(
            "encryption",
            format!(
                "could not extract current status from plan for [{}]: status command not present in plan",
                entry.name()
            ),
        )),
    }
}

/// Pull the stage out of `secrets-encrypt status` output
fn parse_stage(machine: &str, output: &str) -> Result<String, Error> {
    if output.lines().count() < 2 {
        return Err(Error::waiting(format!(
            "could not extract current stage from plan for [{machine}]: status output is incomplete"
        )));
    }
    output
        .lines()
        .find_map(|line| line.trim().strip_prefix(STAGE_PREFIX))
        .map(|stage| stage.trim().to_string())
        .ok_or_else(|| Error::waiting("unable to parse rotation stage from output"))
}

/// Reencrypt may report any of its three stages; the request and active
/// stages only mean it has not failed yet
fn stage_allowed(stage: &str, phase: EncryptionKeyRotationPhase) -> Result<(), Error> {
    let allowed = match phase {
        EncryptionKeyRotationPhase::Prepare => stage == "prepare",
        EncryptionKeyRotationPhase::Rotate => stage == "rotate",
        EncryptionKeyRotationPhase::Reencrypt => matches!(
            stage,
            STAGE_REENCRYPT_REQUEST | STAGE_REENCRYPT_ACTIVE | STAGE_REENCRYPT_FINISHED
        ),
        _ => false,
    };
    if allowed {
        Ok(())
    } else {
        Err(Error::internal_with_context(
            "encryption",
            format!("unexpected encryption key rotation stage [{stage}] for phase [{phase}]"),
        ))
    }
}
