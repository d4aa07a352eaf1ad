//! Tiered reconcile
//!
//! Machines are reconciled one role tier at a time: the bootstrap etcd
//! node, the remaining etcd nodes, control plane, then workers. Each tier
//! needs join information that only exists once the previous tier settled.
//!
//! Within a tier, a desired plan is rendered for every machine and compared
//! with the plan on its secret. Minor changes (only files flagged minor) go
//! out immediately; major changes are rationed by the tier's unavailability
//! budget and may require a drain first.

use std::collections::BTreeMap;

use kube::ResourceExt;
use tracing::{debug, info};

use capr_common::crd::conditions::{BOOTSTRAPPED, RECONCILED};
use capr_common::crd::{
    ConditionStatus, Conditions, DrainOptions, Machine, RKEControlPlane, RKEControlPlaneStatus,
};
use capr_common::{Error, DRAIN_ANNOTATION, DRAIN_DONE_ANNOTATION, JOIN_URL_ANNOTATION};
use capr_common::{POST_DRAIN_ANNOTATION, PRE_DRAIN_ANNOTATION, UNCORDON_ANNOTATION};

use super::{Pass, Planner};
use crate::drain::{drain, undrain};
use crate::election::{elect_init_node, find_init_node};
use crate::filters::{
    collect, has_join_url, is_control_plane, is_deleting, is_etcd, is_init_node,
    is_init_node_or_deleting, is_not_init_node_or_is_deleting, is_only_worker, Filter,
};
use crate::plan::{NodePlan, Plan, PlanEntry};
use crate::store::{plan_status_message, WAITING_PLAN_STATUS_MESSAGE};

/// One role tier of the cluster
#[derive(Clone, Copy)]
pub(crate) struct Tier {
    name: &'static str,
    include: Filter,
    exclude: Filter,
    /// An empty tier is Waiting rather than done
    required: bool,
}

/// Only the init node, selected from all etcd so the budget counts them all
const BOOTSTRAP_TIER: Tier = Tier {
    name: "bootstrap",
    include: is_etcd,
    exclude: is_not_init_node_or_is_deleting,
    required: true,
};

const ETCD_TIER: Tier = Tier {
    name: "etcd",
    include: is_etcd,
    exclude: is_init_node_or_deleting,
    required: true,
};

const CONTROL_PLANE_TIER: Tier = Tier {
    name: "control plane",
    include: is_control_plane,
    exclude: is_init_node_or_deleting,
    required: true,
};

const WORKER_TIER: Tier = Tier {
    name: "worker",
    include: is_only_worker,
    exclude: is_init_node_or_deleting,
    required: false,
};

/// Machine whose desired plan has been rendered
struct Reconcilable {
    entry: PlanEntry,
    desired: NodePlan,
    joined_url: String,
    change: bool,
    minor_change: bool,
}

/// Health of a machine as reported by its own conditions
#[derive(Debug, Default, PartialEq)]
struct MachineSummary {
    error: bool,
    transitioning: bool,
    messages: Vec<String>,
}

/// Machine names bucketed by what the tier is waiting on
#[derive(Default)]
struct TierOutcome {
    ready: Vec<String>,
    out_of_sync: Vec<String>,
    non_ready: Vec<String>,
    failing: Vec<String>,
    draining: Vec<String>,
    uncordoning: Vec<String>,
    messages: BTreeMap<String, Vec<String>>,
}

impl TierOutcome {
    fn note(&mut self, machine: &str, message: impl Into<String>) {
        self.messages
            .entry(machine.to_string())
            .or_default()
            .push(message.into());
    }
}

impl Planner {
    /// Reconcile every tier in order
    ///
    /// With `ignore_drain_and_concurrency` (used by etcd restore) nothing is
    /// drained and the spec's concurrency is replaced by the default of one
    /// machine per tier.
    pub(crate) async fn full_reconcile(
        &self,
        pass: Pass<'_>,
        status: &mut RKEControlPlaneStatus,
        plan: &mut Plan,
        ignore_drain_and_concurrency: bool,
    ) -> Result<(), Error> {
        let cp = pass.control_plane;
        let mut join_server = elect_init_node(&self.store, &*self.clusters, cp, plan, true).await?;

        let strategy = &cp.spec.upgrade_strategy;
        let (control_plane_drain, worker_drain, control_plane_concurrency, worker_concurrency) =
            if ignore_drain_and_concurrency {
                (DrainOptions::default(), DrainOptions::default(), "", "")
            } else {
                (
                    strategy.control_plane_drain_options.clone(),
                    strategy.worker_drain_options.clone(),
                    strategy.control_plane_concurrency.as_str(),
                    strategy.worker_concurrency.as_str(),
                )
            };

        let mut first_ignore = None;

        let result = self
            .reconcile(pass, plan, BOOTSTRAP_TIER, "1", "", &control_plane_drain)
            .await;
        status.set_condition(BOOTSTRAPPED, ConditionStatus::True, "", "");
        ignore_errors(&mut first_ignore, result)?;

        if join_server.is_empty() {
            let (_, url, _) = find_init_node(plan)?;
            join_server = url;
        }
        if join_server.is_empty() {
            return Err(match first_ignore {
                Some(e) => Error::waiting(format!(
                    "{e} and join url to be available on bootstrap node"
                )),
                None => Error::waiting("waiting for join url to be available on bootstrap node"),
            });
        }

        let result = self
            .reconcile(pass, plan, ETCD_TIER, "1", &join_server, &control_plane_drain)
            .await;
        ignore_errors(&mut first_ignore, result)?;

        let result = self
            .reconcile(
                pass,
                plan,
                CONTROL_PLANE_TIER,
                control_plane_concurrency,
                &join_server,
                &control_plane_drain,
            )
            .await;
        ignore_errors(&mut first_ignore, result)?;

        if joinable_control_plane(plan).is_empty() {
            return Err(Error::waiting("waiting for control plane to be available"));
        }

        if !status.initialized || !status.ready {
            status.initialized = true;
            status.ready = true;
            info!(cluster = %cp.name_any(), "control plane initialized");
            return Err(Error::waiting("marking control plane as initialized and ready"));
        }

        let result = self
            .reconcile(pass, plan, WORKER_TIER, worker_concurrency, "", &worker_drain)
            .await;
        ignore_errors(&mut first_ignore, result)?;

        match first_ignore {
            Some(e) => Err(Error::waiting(e.to_string())),
            None => Ok(()),
        }
    }

    /// Reconcile one tier
    ///
    /// Per-machine problems come back as [`Error::Ignore`] so later tiers
    /// still run; anything else aborts the pass.
    async fn reconcile(
        &self,
        pass: Pass<'_>,
        plan: &mut Plan,
        tier: Tier,
        max_unavailable: &str,
        forced_join_url: &str,
        drain_options: &DrainOptions,
    ) -> Result<(), Error> {
        let cp = pass.control_plane;
        let cluster = cp.name_any();
        let entries = collect(plan, tier.include);

        let mut reconcilables = Vec::new();
        for entry in entries.iter().filter(|e| !(tier.exclude)(*e)) {
            let join_url = determine_join_url(cp, entry, plan, forced_join_url)?;
            debug!(
                %cluster,
                tier = tier.name,
                machine = %entry.name(),
                %join_url,
                "rendering desired plan"
            );
            let (desired, joined_url) = self.desired_plan(pass, entry, &join_url).await?;
            let (change, minor_change) = match &entry.plan {
                Some(node) => (
                    node.plan != desired,
                    minor_plan_change_detected(&node.plan, &desired),
                ),
                None => (false, false),
            };
            reconcilables.push(Reconcilable {
                entry: entry.clone(),
                desired,
                joined_url,
                change,
                minor_change,
            });
        }

        let (concurrency, mut unavailable) = calculate_concurrency(max_unavailable, &reconcilables)
            .map_err(|e| Error::validation_for(&cluster, e))?;
        let pre_bootstrap = self.info.pre_bootstrap_manifests(cp).await?;
        let single_machine = plan.machines.len() == 1;
        let agent_connected = cp.status.as_ref().is_some_and(|s| s.agent_connected);

        let mut outcome = TierOutcome::default();
        for mut r in reconcilables {
            let name = r.entry.name().to_string();

            let summary = summarize(&r.entry.machine);
            if summary.error {
                outcome.failing.push(name.clone());
            }
            if summary.transitioning {
                outcome.non_ready.push(name.clone());
            }
            let plan_status = plan_status_message(&r.entry);
            let mut messages = summary.messages;
            if !plan_status.is_empty() {
                messages.push(plan_status.clone());
            }
            outcome.messages.insert(name.clone(), messages);

            let Some(node) = r.entry.plan.as_ref() else {
                debug!(%cluster, tier = tier.name, machine = %name, "setting initial plan");
                outcome.out_of_sync.push(name);
                self.store
                    .update_plan(&mut r.entry, &r.desired, &r.joined_url, -1, 1)
                    .await?;
                plan.absorb(&r.entry);
                continue;
            };

            if r.minor_change {
                debug!(%cluster, tier = tier.name, machine = %name, "applying minor plan change");
                outcome.out_of_sync.push(name);
                self.store
                    .update_plan(&mut r.entry, &r.desired, &r.joined_url, -1, 1)
                    .await?;
                plan.absorb(&r.entry);
                continue;
            }

            if r.change {
                outcome.out_of_sync.push(name.clone());
                let admit = is_in_drain(&r.entry)
                    || node.failed
                    || concurrency == 0
                    || unavailable < concurrency
                    || plan_applied_but_probes_never_healthy(&r.entry);
                debug!(
                    %cluster,
                    tier = tier.name,
                    machine = %name,
                    concurrency,
                    unavailable,
                    admit,
                    "major plan change"
                );
                if !admit {
                    continue;
                }
                if !is_unavailable(&r) {
                    unavailable += 1;
                }

                let applied = node.applied_plan.clone();
                let drained = drain(
                    &self.store,
                    cp,
                    applied.as_ref(),
                    &r.desired,
                    &mut r.entry,
                    drain_options,
                    single_machine,
                )
                .await;
                plan.absorb(&r.entry);
                match drained {
                    Ok(true) => {
                        self.store
                            .update_plan(&mut r.entry, &r.desired, &r.joined_url, -1, 1)
                            .await?;
                        plan.absorb(&r.entry);
                        if !r.entry.metadata.annotation(DRAIN_DONE_ANNOTATION).is_empty() {
                            outcome.note(&name, "drain completed");
                        } else if plan_status.is_empty() {
                            outcome.note(&name, WAITING_PLAN_STATUS_MESSAGE);
                        }
                    }
                    Ok(false) => {
                        outcome.draining.push(name.clone());
                        outcome.note(&name, "draining node");
                    }
                    Err(e) if e.is_ignorable() => {
                        outcome.draining.push(name.clone());
                        outcome.note(&name, e.to_string());
                    }
                    Err(e) => return Err(e),
                }
                continue;
            }

            if !plan_status.is_empty() {
                outcome.out_of_sync.push(name);
                continue;
            }

            let uncordoned = undrain(&self.store, &mut r.entry).await?;
            plan.absorb(&r.entry);
            if !uncordoned {
                outcome.uncordoning.push(name.clone());
                outcome.note(&name, "waiting for uncordon to finish");
            } else if !kubelet_version_up_to_date(cp, &r.entry.machine) {
                outcome.out_of_sync.push(name.clone());
                outcome.note(&name, "waiting for kubelet to update");
            } else if is_control_plane(&r.entry) && !pre_bootstrap.is_empty() {
                outcome.out_of_sync.push(name.clone());
                outcome.note(&name, "waiting for cluster pre-bootstrap to complete");
            } else if is_control_plane(&r.entry) && !agent_connected {
                outcome.out_of_sync.push(name.clone());
                outcome.note(&name, "waiting for cluster agent to connect");
            } else {
                outcome.ready.push(name);
            }
        }

        if tier.required && entries.is_empty() {
            return Err(Error::waiting(format!(
                "waiting for at least one {} node",
                tier.name
            )));
        }

        // every group is written even after a failure so no condition is left stale
        let groups = [
            (&outcome.uncordoning, format!("uncordoning {} node(s) ", tier.name), true),
            (&outcome.draining, format!("draining {} node(s) ", tier.name), true),
            (&outcome.out_of_sync, format!("configuring {} node(s) ", tier.name), true),
            (&outcome.ready, String::new(), false),
        ];
        let mut first_error = None;
        for (machines, prefix, with_messages) in groups {
            let messages = with_messages.then_some(&outcome.messages);
            if let Err(e) = self
                .set_machine_condition_status(plan, machines, &prefix, messages)
                .await
            {
                first_error.get_or_insert(e);
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        if !outcome.failing.is_empty() {
            return Err(Error::ignore(format!(
                "failing {} machine(s) {}{}",
                tier.name,
                at_most_three(&outcome.failing),
                detailed_message(&outcome.failing, &outcome.messages)
            )));
        }
        if !outcome.non_ready.is_empty() {
            return Err(Error::ignore(format!(
                "non-ready {} machine(s) {}{}",
                tier.name,
                at_most_three(&outcome.non_ready),
                detailed_message(&outcome.non_ready, &outcome.messages)
            )));
        }
        Ok(())
    }

    /// Write the Reconciled condition for a group of machines
    ///
    /// Returns Waiting naming the group when any machine is still waiting
    /// or had its condition changed; the condition write re-enqueues the
    /// control plane anyway.
    async fn set_machine_condition_status(
        &self,
        plan: &mut Plan,
        machines: &[String],
        prefix: &str,
        messages: Option<&BTreeMap<String, Vec<String>>>,
    ) -> Result<(), Error> {
        let mut waiting = false;
        for name in machines {
            let Some(machine) = plan.machines.get(name) else {
                return Err(Error::internal_with_context(
                    "planner",
                    format!("found unexpected machine {name} that is not in cluster plan"),
                ));
            };
            if !machine.infrastructure_ready() {
                waiting = true;
                continue;
            }

            let mut machine = machine.clone();
            let status = machine.status.get_or_insert_with(Default::default);
            let message = messages
                .and_then(|m| m.get(name))
                .map(|m| m.join(", "))
                .unwrap_or_default();
            if !message.is_empty() {
                waiting = true;
                if status.condition_message(RECONCILED) == message {
                    continue;
                }
                status.set_condition(RECONCILED, ConditionStatus::Unknown, "Waiting", &message);
            } else if !status.is_true(RECONCILED) {
                status.set_true(RECONCILED);
                waiting = true;
            } else {
                continue;
            }

            let updated = self.machines.update_status(&machine).await?;
            plan.machines.insert(name.clone(), updated);
        }

        if waiting {
            let empty = BTreeMap::new();
            return Err(Error::waiting(format!(
                "{prefix}{}{}",
                at_most_three(machines),
                detailed_message(machines, messages.unwrap_or(&empty))
            )));
        }
        Ok(())
    }
}

/// Keep the first ignorable error, propagate anything else
fn ignore_errors(first: &mut Option<Error>, result: Result<(), Error>) -> Result<(), Error> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.is_ignorable() => {
            first.get_or_insert(e);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Non-deleting control plane machines other nodes can join through
fn joinable_control_plane(plan: &Plan) -> Vec<PlanEntry> {
    collect(plan, is_control_plane)
        .into_iter()
        .filter(|e| has_join_url(e) && !is_deleting(e))
        .collect()
}

fn valid_join_url(plan: &Plan, join_url: &str) -> bool {
    joinable_control_plane(plan)
        .iter()
        .any(|e| e.metadata.annotation(JOIN_URL_ANNOTATION) == join_url)
}

/// Pick a control plane join URL for a worker by hashing its UID
///
/// Stable for a given set of joinable control plane machines; the init node
/// joins nothing and gets `-`.
fn calculate_join_url(control_plane: &RKEControlPlane, entry: &PlanEntry, plan: &Plan) -> String {
    if is_init_node(entry) {
        return "-".to_string();
    }
    let entries = joinable_control_plane(plan);
    if entries.is_empty() {
        return String::new();
    }

    let mut checksum = crc32fast::hash(entry.machine.uid_str().as_bytes());
    if checksum == u32::MAX {
        checksum -= 1;
    }
    let index = (u64::from(checksum) * entries.len() as u64 / u64::from(u32::MAX)) as usize;
    let join_url = entries[index].metadata.annotation(JOIN_URL_ANNOTATION).to_string();
    debug!(
        cluster = %control_plane.name_any(),
        machine = %entry.name(),
        %join_url,
        checksum,
        index,
        "calculated join url"
    );
    join_url
}

/// Join URL to render for an entry
///
/// Servers use whatever was forced. Workers keep the server they joined
/// while it is still valid, so deleting an unrelated control plane machine
/// doesn't churn every worker plan.
fn determine_join_url(
    control_plane: &RKEControlPlane,
    entry: &PlanEntry,
    plan: &Plan,
    join_url: &str,
) -> Result<String, Error> {
    if !is_only_worker(entry) || !join_url.is_empty() {
        return Ok(join_url.to_string());
    }

    let joined_to = entry
        .plan
        .as_ref()
        .map(|n| n.joined_to.as_str())
        .unwrap_or("");
    if !joined_to.is_empty() && valid_join_url(plan, joined_to) {
        return Ok(joined_to.to_string());
    }

    let join_url = calculate_join_url(control_plane, entry, plan);
    info!(
        cluster = %control_plane.name_any(),
        machine = %entry.name(),
        previous = %joined_to,
        %join_url,
        "previous join server was not valid, using new join server"
    );
    if join_url.is_empty() {
        return Err(Error::internal_with_context(
            "planner",
            format!(
                "no suitable join URL found to join machine {}/{} in rkecluster {}/{} to",
                entry.machine.namespace().unwrap_or_default(),
                entry.name(),
                control_plane.namespace().unwrap_or_default(),
                control_plane.name_any()
            ),
        ));
    }
    Ok(join_url)
}

/// Any part of the drain protocol is in flight
fn is_in_drain(entry: &PlanEntry) -> bool {
    [
        PRE_DRAIN_ANNOTATION,
        POST_DRAIN_ANNOTATION,
        DRAIN_ANNOTATION,
        UNCORDON_ANNOTATION,
    ]
    .iter()
    .any(|key| !entry.metadata.annotation(key).is_empty())
}

/// Out of sync, draining, or unhealthy with nothing pending to fix it
fn is_unavailable(r: &Reconcilable) -> bool {
    let Some(node) = &r.entry.plan else {
        return false;
    };
    !node.in_sync || is_in_drain(&r.entry) || (!r.change && !r.minor_change && !node.healthy)
}

/// The plan applied but probes never passed, so it is likely a bad config
/// that may be replaced without waiting for budget
fn plan_applied_but_probes_never_healthy(entry: &PlanEntry) -> bool {
    entry.plan.as_ref().is_some_and(|node| {
        node.applied_plan.as_ref() == Some(&node.plan) && !node.healthy && !node.probes_usable
    })
}

/// Budget and current unavailable count for a tier
///
/// `""` is 1, a bare integer is used as is, `N%` rounds up against the
/// tier size. 0 means unlimited.
fn calculate_concurrency(
    max_unavailable: &str,
    reconcilables: &[Reconcilable],
) -> Result<(i64, i64), String> {
    let count = reconcilables.len() as i64;
    let unavailable = reconcilables.iter().filter(|r| is_unavailable(r)).count() as i64;

    if let Ok(n) = max_unavailable.parse::<i64>() {
        return Ok((n, unavailable));
    }
    if max_unavailable.is_empty() {
        return Ok((1, unavailable));
    }
    let percentage: f64 = max_unavailable
        .trim_end_matches('%')
        .parse()
        .map_err(|e| format!("concurrency must be a number or a percentage: {e}"))?;
    let budget = (count as f64 * percentage / 100.0).ceil() as i64;
    Ok((budget, unavailable))
}

/// True when the only differences are files flagged minor
fn minor_plan_change_detected(old: &NodePlan, new: &NodePlan) -> bool {
    if old.instructions != new.instructions
        || old.periodic_instructions != new.periodic_instructions
        || old.probes != new.probes
        || old.error != new.error
    {
        return false;
    }
    if old.files == new.files {
        return false;
    }

    let mut added: BTreeMap<&str, _> = new.files.iter().map(|f| (f.path.as_str(), f)).collect();
    for old_file in &old.files {
        match added.get(old_file.path.as_str()) {
            Some(new_file) if new_file.content == old_file.content => {
                added.remove(old_file.path.as_str());
            }
            Some(_) => {}
            None if !old_file.minor => return false,
            None => {}
        }
    }

    added.values().all(|f| f.minor)
}

/// Kubelet reports the control plane's version, ignoring build metadata
///
/// Without node info or a connected agent there is nothing reliable to
/// compare, so provisioning is not held back.
fn kubelet_version_up_to_date(control_plane: &RKEControlPlane, machine: &Machine) -> bool {
    let agent_connected = control_plane
        .status
        .as_ref()
        .is_some_and(|s| s.agent_connected);
    let Some(node_info) = machine.status.as_ref().and_then(|s| s.node_info.as_ref()) else {
        return true;
    };
    if !agent_connected {
        return true;
    }
    let parse = |v: &str| semver::Version::parse(v.trim_start_matches('v')).ok();
    match (
        parse(&node_info.kubelet_version),
        parse(&control_plane.spec.kubernetes_version),
    ) {
        (Some(kubelet), Some(wanted)) => {
            (kubelet.major, kubelet.minor, kubelet.patch)
                == (wanted.major, wanted.minor, wanted.patch)
        }
        _ => false,
    }
}

/// Summarize a machine from its conditions, skipping Reconciled which the
/// planner writes itself
fn summarize(machine: &Machine) -> MachineSummary {
    let mut summary = MachineSummary::default();
    let Some(status) = &machine.status else {
        return summary;
    };
    if machine.is_failed() {
        summary.error = true;
        let message = status
            .failure_message
            .as_deref()
            .or(status.failure_reason.as_deref())
            .unwrap_or("");
        if !message.is_empty() {
            summary.messages.push(message.to_string());
        }
    }
    for condition in status.conditions.iter().filter(|c| c.type_ != RECONCILED) {
        if condition.status == ConditionStatus::True {
            continue;
        }
        summary.transitioning = true;
        if !condition.message.is_empty() {
            summary.messages.push(condition.message.clone());
        }
    }
    summary
}

/// `a, b, c and 2 more`
fn at_most_three(names: &[String]) -> String {
    let mut sorted: Vec<&str> = names.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    if sorted.len() > 3 {
        format!("{} and {} more", sorted[..3].join(", "), sorted.len() - 3)
    } else {
        sorted.join(", ")
    }
}

/// Per-machine detail for the first three machines that have any
fn detailed_message(names: &[String], messages: &BTreeMap<String, Vec<String>>) -> String {
    let mut sorted: Vec<&String> = names.iter().collect();
    sorted.sort_unstable();
    let details: Vec<String> = sorted
        .into_iter()
        .filter_map(|name| {
            let msgs = messages.get(name).filter(|m| !m.is_empty())?;
            Some(format!("{name}: {}", msgs.join(", ")))
        })
        .take(3)
        .collect();
    if details.is_empty() {
        return String::new();
    }
    if names.len() == 1 {
        // a single machine needs no name prefix
        let only = &names[0];
        return format!(": {}", messages[only].join(", "));
    }
    format!(" ({})", details.join("; "))
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::NodeSystemInfo;
    use rstest::rstest;

    use capr_common::crd::{Condition, MachineStatus};

    use super::*;
    use crate::filters::tests::entry;
    use crate::plan::{File, Node};

    fn reconcilable(in_sync: bool, healthy: bool, change: bool) -> Reconcilable {
        let mut e = entry("m", &["worker"]);
        e.plan = Some(Node {
            in_sync,
            healthy,
            ..Default::default()
        });
        Reconcilable {
            entry: e,
            desired: NodePlan::default(),
            joined_url: String::new(),
            change,
            minor_change: false,
        }
    }

    #[rstest]
    #[case::empty_is_one("", 10, 1)]
    #[case::count("3", 10, 3)]
    #[case::zero_is_unlimited("0", 10, 0)]
    #[case::percent_rounds_up("10%", 15, 2)]
    #[case::full_percent("100%", 4, 4)]
    fn test_calculate_concurrency(
        #[case] max_unavailable: &str,
        #[case] machines: usize,
        #[case] expected: i64,
    ) {
        let rs: Vec<Reconcilable> = (0..machines).map(|_| reconcilable(true, true, false)).collect();
        let (budget, unavailable) = calculate_concurrency(max_unavailable, &rs).expect("budget");
        assert_eq!(budget, expected);
        assert_eq!(unavailable, 0);
    }

    #[test]
    fn test_calculate_concurrency_rejects_garbage() {
        let err = calculate_concurrency("lots", &[]).expect_err("garbage");
        assert!(err.contains("number or a percentage"));
    }

    #[rstest]
    #[case::out_of_sync(false, true, false, true)]
    #[case::healthy(true, true, false, false)]
    #[case::unhealthy_without_change(true, false, false, true)]
    #[case::unhealthy_with_pending_change(true, false, true, false)]
    fn test_is_unavailable(
        #[case] in_sync: bool,
        #[case] healthy: bool,
        #[case] change: bool,
        #[case] expected: bool,
    ) {
        assert_eq!(is_unavailable(&reconcilable(in_sync, healthy, change)), expected);
    }

    #[test]
    fn test_draining_counts_as_unavailable() {
        let mut r = reconcilable(true, true, false);
        r.entry
            .metadata
            .annotations
            .insert(UNCORDON_ANNOTATION.to_string(), "true".to_string());
        assert!(is_unavailable(&r));
    }

    fn file(path: &str, content: &str, minor: bool) -> File {
        File {
            minor,
            ..File::new(path, content)
        }
    }

    #[rstest]
    #[case::identical(vec![file("/a", "1", false)], vec![file("/a", "1", false)], false)]
    #[case::new_minor_file(vec![file("/a", "1", false)], vec![file("/a", "1", false), file("/m", "x", true)], true)]
    #[case::changed_minor_file(vec![file("/m", "x", true)], vec![file("/m", "y", true)], true)]
    #[case::changed_major_file(vec![file("/a", "1", false)], vec![file("/a", "2", false)], false)]
    #[case::removed_major_file(vec![file("/a", "1", false), file("/m", "x", true)], vec![file("/m", "y", true)], false)]
    #[case::removed_minor_file(vec![file("/a", "1", false), file("/m", "x", true)], vec![file("/a", "1", false)], true)]
    #[case::no_files(vec![], vec![], false)]
    fn test_minor_plan_change(
        #[case] old: Vec<File>,
        #[case] new: Vec<File>,
        #[case] expected: bool,
    ) {
        let old = NodePlan {
            files: old,
            ..Default::default()
        };
        let new = NodePlan {
            files: new,
            ..Default::default()
        };
        assert_eq!(minor_plan_change_detected(&old, &new), expected);
    }

    #[test]
    fn test_instruction_change_is_never_minor() {
        let old = NodePlan {
            files: vec![file("/m", "x", true)],
            ..Default::default()
        };
        let mut new = old.clone();
        new.files[0].content = "changed".to_string();
        new.error = "boom".to_string();
        assert!(!minor_plan_change_detected(&old, &new));
    }

    fn joinable(name: &str, url: &str) -> PlanEntry {
        let mut e = entry(name, &["cp"]);
        e.metadata
            .annotations
            .insert(JOIN_URL_ANNOTATION.to_string(), url.to_string());
        e
    }

    fn plan_of(entries: Vec<PlanEntry>) -> Plan {
        let mut plan = Plan::default();
        for e in entries {
            plan.machines.insert(e.name().to_string(), e.machine.clone());
            plan.absorb(&e);
        }
        plan
    }

    fn control_plane() -> RKEControlPlane {
        let mut cp = RKEControlPlane::new("prod", Default::default());
        cp.spec.kubernetes_version = "v1.29.4+rke2r1".to_string();
        cp
    }

    #[test]
    fn test_calculate_join_url_is_stable() {
        let plan = plan_of(vec![
            joinable("cp-1", "https://10.0.0.1:9345"),
            joinable("cp-2", "https://10.0.0.2:9345"),
            joinable("cp-3", "https://10.0.0.3:9345"),
        ]);
        let worker = entry("w", &["worker"]);
        let first = calculate_join_url(&control_plane(), &worker, &plan);
        assert!(first.starts_with("https://10.0.0."));
        assert_eq!(first, calculate_join_url(&control_plane(), &worker, &plan));
        assert!(calculate_join_url(&control_plane(), &worker, &Plan::default()).is_empty());
    }

    #[test]
    fn test_worker_keeps_valid_join_server() {
        let plan = plan_of(vec![
            joinable("cp-1", "https://10.0.0.1:9345"),
            joinable("cp-2", "https://10.0.0.2:9345"),
        ]);
        let mut worker = entry("w", &["worker"]);
        worker.plan = Some(Node {
            joined_to: "https://10.0.0.2:9345".to_string(),
            ..Default::default()
        });
        let url = determine_join_url(&control_plane(), &worker, &plan, "").expect("url");
        assert_eq!(url, "https://10.0.0.2:9345");

        worker.plan = Some(Node {
            joined_to: "https://10.0.0.9:9345".to_string(),
            ..Default::default()
        });
        let url = determine_join_url(&control_plane(), &worker, &plan, "").expect("url");
        assert_ne!(url, "https://10.0.0.9:9345");

        let err = determine_join_url(&control_plane(), &worker, &Plan::default(), "")
            .expect_err("nothing to join");
        assert!(err.to_string().contains("no suitable join URL"));
    }

    #[test]
    fn test_servers_use_forced_join_url() {
        let url = determine_join_url(
            &control_plane(),
            &entry("cp", &["cp"]),
            &Plan::default(),
            "https://init:9345",
        )
        .expect("url");
        assert_eq!(url, "https://init:9345");
    }

    fn with_kubelet(version: &str) -> Machine {
        let mut e = entry("m", &["worker"]);
        e.machine.status = Some(MachineStatus {
            node_info: Some(NodeSystemInfo {
                kubelet_version: version.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        });
        e.machine
    }

    #[rstest]
    #[case::same_patch_other_build("v1.29.4+rke2r2", true, true)]
    #[case::older("v1.28.9+rke2r1", true, false)]
    #[case::garbage("unknown", true, false)]
    #[case::agent_disconnected("v1.28.9+rke2r1", false, true)]
    fn test_kubelet_version_up_to_date(
        #[case] kubelet: &str,
        #[case] agent_connected: bool,
        #[case] expected: bool,
    ) {
        let mut cp = control_plane();
        cp.status = Some(RKEControlPlaneStatus {
            agent_connected,
            ..Default::default()
        });
        assert_eq!(kubelet_version_up_to_date(&cp, &with_kubelet(kubelet)), expected);
    }

    #[test]
    fn test_at_most_three() {
        let names: Vec<String> = ["d", "a", "c", "b", "e"].iter().map(|s| s.to_string()).collect();
        assert_eq!(at_most_three(&names), "a, b, c and 2 more");
        assert_eq!(at_most_three(&names[..2]), "a, d");
    }

    #[test]
    fn test_detailed_message() {
        let messages = BTreeMap::from([
            ("a".to_string(), vec!["waiting for probes: kubelet".to_string()]),
            ("b".to_string(), vec![]),
        ]);
        assert_eq!(
            detailed_message(&["a".to_string()], &messages),
            ": waiting for probes: kubelet"
        );
        assert_eq!(
            detailed_message(&["b".to_string(), "a".to_string()], &messages),
            " (a: waiting for probes: kubelet)"
        );
        assert_eq!(detailed_message(&["b".to_string()], &messages), "");
    }

    #[test]
    fn test_summarize_skips_reconciled() {
        let mut machine = entry("m", &["worker"]).machine;
        machine.status = Some(MachineStatus {
            conditions: vec![
                Condition::new(RECONCILED, ConditionStatus::Unknown, "Waiting", "planner"),
                Condition::new("NodeHealthy", ConditionStatus::False, "", "kubelet down"),
            ],
            ..Default::default()
        });
        let summary = summarize(&machine);
        assert!(summary.transitioning);
        assert!(!summary.error);
        assert_eq!(summary.messages, vec!["kubelet down".to_string()]);
    }

    #[test]
    fn test_ignore_errors_keeps_first() {
        let mut first = None;
        ignore_errors(&mut first, Err(Error::ignore("one"))).expect("ignorable");
        ignore_errors(&mut first, Err(Error::ignore("two"))).expect("ignorable");
        assert_eq!(first.expect("kept").to_string(), "one");
        assert!(ignore_errors(&mut None, Err(Error::waiting("wait"))).is_err());
    }
}
