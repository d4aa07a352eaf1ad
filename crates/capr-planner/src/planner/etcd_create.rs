//! On-demand etcd snapshots
//!
//! Every etcd machine saves a snapshot in parallel; the plans are delivered
//! together and the outcome is judged only once all of them have reported.
//! Afterwards the etcd machines get their regular plans back.

use futures::future::join_all;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use capr_common::crd::{
    EtcdSnapshotCreate, EtcdSnapshotCreatePhase, Operation, RKEControlPlane,
    RKEControlPlaneStatus,
};
use capr_common::Error;

use super::{Pass, Planner};
use crate::election::find_init_node;
use crate::filters::{collect, is_deleting, is_etcd};
use crate::instructions::idempotent_instruction;
use crate::plan::{OneTimeInstruction, Plan, PlanEntry};
use crate::s3::{self, S3Args};
use crate::store::assign_and_check_plan;

const OPERATION: &str = "etcd snapshot creation";

impl Planner {
    /// Advance a requested on-demand snapshot by at most one phase
    pub(crate) async fn create_etcd_snapshot(
        &self,
        pass: Pass<'_>,
        status: &mut RKEControlPlaneStatus,
        plan: &mut Plan,
    ) -> Result<(), Error> {
        let cp = pass.control_plane;
        let Some(request) = cp.spec.etcd_snapshot_create.as_ref() else {
            if status.etcd_snapshot_create.take().is_some() {
                return Err(refreshing());
            }
            return Ok(());
        };

        let tracked = status
            .etcd_snapshot_create
            .as_ref()
            .filter(|op| op.tracks(request))
            .map(|op| op.phase);
        let Some(phase) = tracked else {
            info!(
                cluster = %cp.name_any(),
                generation = request.generation,
                "starting etcd snapshot creation"
            );
            status.etcd_snapshot_create = Some(Operation::start(request.clone()));
            return Err(refreshing());
        };

        let (_, join_server, _) = find_init_node(plan)?;
        let next = match phase {
            EtcdSnapshotCreatePhase::Started => {
                if join_server.is_empty() {
                    return Err(Error::waiting(
                        "waiting for init node join URL before creating etcd snapshot",
                    ));
                }
                match self.save_snapshots(pass, request, plan, &join_server).await {
                    Ok(()) => EtcdSnapshotCreatePhase::RestartCluster,
                    Err(e) if e.is_waiting() => return Err(e),
                    Err(e) => {
                        warn!(cluster = %cp.name_any(), error = %e, "etcd snapshot creation failed");
                        advance(status, EtcdSnapshotCreatePhase::Failed)?;
                        return Err(e);
                    }
                }
            }
            EtcdSnapshotCreatePhase::RestartCluster => {
                self.return_etcd_plans(pass, plan, &join_server).await?;
                info!(cluster = %cp.name_any(), "etcd snapshot creation finished");
                EtcdSnapshotCreatePhase::Finished
            }
            EtcdSnapshotCreatePhase::Finished | EtcdSnapshotCreatePhase::Failed => return Ok(()),
        };
        advance(status, next)?;
        Err(refreshing())
    }

    /// Deliver the save instruction to every etcd machine at once
    async fn save_snapshots(
        &self,
        pass: Pass<'_>,
        request: &EtcdSnapshotCreate,
        plan: &mut Plan,
        join_server: &str,
    ) -> Result<(), Error> {
        let cp = pass.control_plane;
        let s3_args = s3::to_args(&*self.secrets, request.s3.as_ref(), cp, "", true).await?;
        let value = serde_json::to_string(request)?;
        let limits = self.config.etcd_snapshot_create;

        let entries: Vec<PlanEntry> = collect(plan, is_etcd)
            .into_iter()
            .filter(|e| !is_deleting(e))
            .collect();
        debug!(cluster = %cp.name_any(), machines = entries.len(), "delivering etcd snapshot save");

        let saves = entries.into_iter().map(|mut entry| {
            let s3_args = &s3_args;
            let value = value.as_str();
            async move {
                let result = async {
                    let generated = self
                        .generate_plan_with_config_files(pass, &entry, join_server, true)
                        .await?;
                    let mut node_plan = generated.plan;
                    node_plan.files.extend(s3_args.files.iter().cloned());
                    node_plan
                        .instructions
                        .push(save_instruction(cp, value, s3_args));
                    let message = format!("{OPERATION} for machine [{}]", entry.name());
                    assign_and_check_plan(
                        &self.store,
                        &message,
                        &mut entry,
                        &node_plan,
                        &generated.joined_server,
                        limits.max_failures,
                        limits.failure_threshold,
                    )
                    .await
                }
                .await;
                (entry, result)
            }
        });

        let mut results = Vec::new();
        for (entry, result) in join_all(saves).await {
            plan.absorb(&entry);
            results.push(result);
        }
        aggregate(results)
    }

    /// Put every etcd machine back on its desired plan
    async fn return_etcd_plans(
        &self,
        pass: Pass<'_>,
        plan: &mut Plan,
        join_server: &str,
    ) -> Result<(), Error> {
        for mut entry in collect(plan, is_etcd) {
            if is_deleting(&entry) {
                continue;
            }
            let (node_plan, joined_server) = self.desired_plan(pass, &entry, join_server).await?;
            let message = format!("{OPERATION} for machine [{}]", entry.name());
            let result = assign_and_check_plan(
                &self.store,
                &message,
                &mut entry,
                &node_plan,
                &joined_server,
                0,
                0,
            )
            .await;
            plan.absorb(&entry);
            result?;
        }
        Ok(())
    }
}

fn refreshing() -> Error {
    Error::waiting("refreshing etcd snapshot creation state")
}

fn advance(status: &mut RKEControlPlaneStatus, next: EtcdSnapshotCreatePhase) -> Result<(), Error> {
    match status.etcd_snapshot_create.as_mut() {
        Some(op) => op.advance(next),
        None => Err(Error::internal_with_context(
            "etcd-snapshot",
            "no etcd snapshot creation in progress",
        )),
    }
}

/// `<runtime> etcd-snapshot save`, once per distinct request
fn save_instruction(
    control_plane: &RKEControlPlane,
    request_value: &str,
    s3_args: &S3Args,
) -> OneTimeInstruction {
    let mut args = vec!["etcd-snapshot".to_string(), "save".to_string()];
    args.extend(s3_args.args.iter().cloned());
    idempotent_instruction(
        control_plane,
        "etcd-snapshot-create",
        request_value,
        control_plane.runtime().as_str(),
        &args,
        &s3_args.env,
    )
}

/// Fold per-machine outcomes
///
/// Still-waiting machines only delay the operation; any real failure fails
/// it. Messages from every machine are kept.
fn aggregate(results: Vec<Result<(), Error>>) -> Result<(), Error> {
    let errors: Vec<Error> = results.into_iter().filter_map(Result::err).collect();
    if errors.is_empty() {
        return Ok(());
    }
    let failed = errors.iter().any(|e| !e.is_waiting());
    let message = errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    if failed {
        Err(Error::operation_failed(OPERATION, message))
    } else {
        Err(Error::waiting(message))
    }
}

#[cfg(test)]
mod tests {
    use capr_common::crd::EtcdS3;

    use super::*;
    use crate::client::ReleaseData;
    use crate::plan::ClusterTokens;
    use crate::planner::generate::tests::{control_plane, info, planner};

    #[test]
    fn test_aggregate_waits_until_every_machine_reports() {
        assert!(aggregate(vec![Ok(()), Ok(())]).is_ok());

        let err = aggregate(vec![Ok(()), Err(Error::waiting("waiting for a"))])
            .expect_err("still waiting");
        assert!(err.is_waiting());
        assert_eq!(err.to_string(), "waiting for a");
    }

    #[test]
    fn test_aggregate_fails_on_any_real_failure() {
        let err = aggregate(vec![
            Err(Error::waiting("waiting for a")),
            Err(Error::operation_failed("save", "disk full")),
        ])
        .expect_err("failed");
        assert!(!err.is_waiting());
        let message = err.to_string();
        assert!(message.contains("waiting for a"));
        assert!(message.contains("disk full"));
    }

    #[test]
    fn test_save_instruction_carries_s3_args() {
        let cp = control_plane();
        let s3_args = S3Args {
            args: vec!["--s3".to_string(), "--s3-bucket=backups".to_string()],
            env: vec!["AWS_SECRET_ACCESS_KEY=secret".to_string()],
            files: vec![],
        };
        let instruction = save_instruction(&cp, "{}", &s3_args);
        let args = &instruction.common.args;
        assert_eq!(args[2], "rke2-etcd-snapshot-create");
        assert_eq!(args[4], "rke2");
        assert_eq!(
            &args[5..],
            &["etcd-snapshot", "save", "--s3", "--s3-bucket=backups"]
        );
        assert_eq!(instruction.common.env, s3_args.env);
    }

    #[tokio::test]
    async fn test_request_lifecycle_without_machines() {
        let mut cp = control_plane();
        let release = ReleaseData::default();
        let tokens = ClusterTokens::default();
        let planner = planner(info(vec![]));
        let mut status = RKEControlPlaneStatus::default();
        let mut plan = Plan::default();

        cp.spec.etcd_snapshot_create = Some(EtcdSnapshotCreate {
            generation: 1,
            s3: None,
        });
        let pass = Pass {
            control_plane: &cp,
            release: &release,
            tokens: &tokens,
        };
        let err = planner
            .create_etcd_snapshot(pass, &mut status, &mut plan)
            .await
            .expect_err("started");
        assert!(err.is_waiting());
        assert_eq!(
            status.etcd_snapshot_create.as_ref().map(|op| op.phase),
            Some(EtcdSnapshotCreatePhase::Started)
        );

        // no init node yet
        let err = planner
            .create_etcd_snapshot(pass, &mut status, &mut plan)
            .await
            .expect_err("waiting for join url");
        assert!(err.to_string().contains("join URL"));

        let mut changed = cp.clone();
        changed.spec.etcd_snapshot_create = Some(EtcdSnapshotCreate {
            generation: 2,
            s3: Some(EtcdS3::default()),
        });
        let pass = Pass {
            control_plane: &changed,
            ..pass
        };
        planner
            .create_etcd_snapshot(pass, &mut status, &mut plan)
            .await
            .expect_err("restarted");
        assert_eq!(
            status.etcd_snapshot_create.as_ref().map(|op| op.request.generation),
            Some(2)
        );

        let mut cleared = cp.clone();
        cleared.spec.etcd_snapshot_create = None;
        let pass = Pass {
            control_plane: &cleared,
            ..pass
        };
        planner
            .create_etcd_snapshot(pass, &mut status, &mut plan)
            .await
            .expect_err("cleared");
        assert!(status.etcd_snapshot_create.is_none());
        planner
            .create_etcd_snapshot(pass, &mut status, &mut plan)
            .await
            .expect("nothing to do");
    }

    #[tokio::test]
    async fn test_terminal_phase_is_left_alone() {
        let mut cp = control_plane();
        let request = EtcdSnapshotCreate {
            generation: 3,
            s3: None,
        };
        cp.spec.etcd_snapshot_create = Some(request.clone());
        let release = ReleaseData::default();
        let tokens = ClusterTokens::default();
        let pass = Pass {
            control_plane: &cp,
            release: &release,
            tokens: &tokens,
        };
        let mut status = RKEControlPlaneStatus {
            etcd_snapshot_create: Some(Operation {
                request,
                phase: EtcdSnapshotCreatePhase::Failed,
            }),
            ..Default::default()
        };
        planner(info(vec![]))
            .create_etcd_snapshot(pass, &mut status, &mut Plan::default())
            .await
            .expect("failed snapshot stays failed");
        assert_eq!(
            status.etcd_snapshot_create.map(|op| op.phase),
            Some(EtcdSnapshotCreatePhase::Failed)
        );
    }
}
