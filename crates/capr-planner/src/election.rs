//! Init-node election
//!
//! The init node is the etcd machine that bootstraps the cluster; every
//! other server joins through it until the control plane has join URLs of
//! its own. The mark lives as a label on the machine's plan secret so it
//! survives restarts and is visible to the agent-facing tooling.
//!
//! Election is deliberately sticky. Switching init nodes changes the join
//! target of every server plan, so a new node is only marked after the old
//! marks are cleared and a fresh pass observes the cleared state.

use kube::ResourceExt;
use tracing::{debug, info, warn};

use capr_common::crd::RKEControlPlane;
use capr_common::{
    Error, INIT_NODE_LABEL, INIT_NODE_MACHINE_ID_DONE_LABEL, INIT_NODE_MACHINE_ID_LABEL,
    JOIN_URL_ANNOTATION, MACHINE_ID_LABEL,
};

use crate::client::ClusterStore;
use crate::filters::{can_be_init_node, collect, has_join_url, is_etcd, is_init_node};
use crate::plan::{Plan, PlanEntry};
use crate::store::PlanStore;

/// Outcome of scanning the plan for the current init node
#[derive(Clone, Debug)]
enum Lookup {
    /// Exactly one usable init node
    Found { join_url: String, entry: PlanEntry },
    /// No machine carries the mark
    NotFound,
    /// A mark exists but a different machine should hold it
    ReelectionRequired { reason: String },
}

/// Etcd machine that can bootstrap the cluster right now
fn is_candidate(entry: &PlanEntry) -> bool {
    can_be_init_node(entry) && entry.machine.infrastructure_ready()
}

fn lookup(plan: &Plan) -> Result<Lookup, Error> {
    let marked: Vec<PlanEntry> = collect(plan, is_etcd)
        .into_iter()
        .filter(is_init_node)
        .collect();

    let entry = match marked.as_slice() {
        [] => return Ok(Lookup::NotFound),
        [one] => one.clone(),
        many => {
            let names: Vec<&str> = many.iter().map(PlanEntry::name).collect();
            return Err(Error::internal_with_context(
                "election",
                format!("multiple init nodes found: {}", names.join(",")),
            ));
        }
    };

    if !is_candidate(&entry) {
        return Ok(Lookup::ReelectionRequired {
            reason: format!("init node {} is no longer eligible", entry.name()),
        });
    }

    let join_url = entry.metadata.annotation(JOIN_URL_ANNOTATION).to_string();
    if join_url.is_empty() {
        let populated = collect(plan, is_candidate)
            .into_iter()
            .find(|c| c.name() != entry.name() && has_join_url(c));
        if let Some(better) = populated {
            return Ok(Lookup::ReelectionRequired {
                reason: format!(
                    "init node {} has no join url but {} does",
                    entry.name(),
                    better.name()
                ),
            });
        }
    }

    Ok(Lookup::Found { join_url, entry })
}

/// Locate the current init node
///
/// Returns whether one was found, its join URL (possibly empty while the
/// node comes up), and the entry. Two marked machines, or a mark that should
/// move to another machine, are errors.
pub fn find_init_node(plan: &Plan) -> Result<(bool, String, Option<PlanEntry>), Error> {
    match lookup(plan)? {
        Lookup::Found { join_url, entry } => Ok((true, join_url, Some(entry))),
        Lookup::NotFound => Ok((false, String::new(), None)),
        Lookup::ReelectionRequired { reason } => Err(Error::internal_with_context(
            "election",
            format!("{reason}, re-election required"),
        )),
    }
}

/// Ensure an init node is marked and return its join URL
///
/// An operator-pinned machine ID wins. Otherwise the current mark is kept
/// when usable; when it isn't and re-election is permitted, every mark is
/// cleared first (Waiting) and a later pass marks the best candidate.
pub async fn elect_init_node(
    store: &PlanStore,
    clusters: &dyn ClusterStore,
    control_plane: &RKEControlPlane,
    plan: &mut Plan,
    permit_reelection: bool,
) -> Result<String, Error> {
    if let Some(join_url) =
        designate_init_node_by_machine_id(store, clusters, control_plane, plan).await?
    {
        return Ok(join_url);
    }

    match lookup(plan)? {
        Lookup::Found { join_url, .. } => return Ok(join_url),
        Lookup::ReelectionRequired { reason } if !permit_reelection => {
            return Err(Error::internal_with_context(
                "election",
                format!("{reason}, re-election required"),
            ));
        }
        Lookup::ReelectionRequired { reason } => {
            warn!(cluster = %control_plane.name_any(), %reason, "re-electing init node");
        }
        Lookup::NotFound if !permit_reelection => {
            return Err(Error::waiting(
                "init node not found and re-election is not permitted",
            ));
        }
        Lookup::NotFound => {}
    }

    if clear_init_node_marks(store, plan, |_| true).await? {
        return Err(Error::waiting("cleared init node marks, waiting for re-election"));
    }

    let candidates = collect(plan, is_candidate);
    let Some(chosen) = candidates
        .iter()
        .find(|c| has_join_url(c))
        .or_else(|| candidates.first())
    else {
        return Err(Error::waiting(
            "waiting for an etcd machine that can be the init node",
        ));
    };

    let mut chosen = chosen.clone();
    set_init_node_mark(store, plan, &mut chosen).await?;
    info!(
        cluster = %control_plane.name_any(),
        machine = %chosen.name(),
        "elected init node"
    );
    Ok(chosen.metadata.annotation(JOIN_URL_ANNOTATION).to_string())
}

/// Honour `rke.cattle.io/init-node-machine-id` once
///
/// Returns `None` when no pin is pending. Once the pinned machine is marked
/// the control plane gets the done label so the pin is not re-applied over a
/// later election.
pub async fn designate_init_node_by_machine_id(
    store: &PlanStore,
    clusters: &dyn ClusterStore,
    control_plane: &RKEControlPlane,
    plan: &mut Plan,
) -> Result<Option<String>, Error> {
    let labels = control_plane.labels();
    let fixed = labels
        .get(INIT_NODE_MACHINE_ID_LABEL)
        .map(String::as_str)
        .unwrap_or("");
    let done = labels
        .get(INIT_NODE_MACHINE_ID_DONE_LABEL)
        .is_some_and(|v| !v.is_empty());
    if fixed.is_empty() || done {
        return Ok(None);
    }

    let fixed = fixed.to_string();
    let join_url =
        designate_init_node(store, plan, |e| e.machine.label(MACHINE_ID_LABEL) == fixed).await?;

    let mut updated = control_plane.clone();
    updated
        .labels_mut()
        .insert(INIT_NODE_MACHINE_ID_DONE_LABEL.to_string(), "true".to_string());
    clusters.update_control_plane(&updated).await?;
    info!(cluster = %control_plane.name_any(), machine_id = %fixed, "pinned init node");
    Ok(Some(join_url))
}

/// Move the mark to the single etcd machine matching `designated`
///
/// Marks on every other etcd machine are cleared. Zero or several matches
/// is Waiting, since machines may still be registering.
pub async fn designate_init_node<F>(
    store: &PlanStore,
    plan: &mut Plan,
    designated: F,
) -> Result<String, Error>
where
    F: Fn(&PlanEntry) -> bool,
{
    let matches: Vec<PlanEntry> = collect(plan, is_etcd)
        .into_iter()
        .filter(|e| designated(e))
        .collect();
    let [chosen] = matches.as_slice() else {
        return Err(Error::waiting(format!(
            "waiting for exactly one designated init node, found {}",
            matches.len()
        )));
    };
    let mut chosen = chosen.clone();
    let chosen_name = chosen.name().to_string();

    clear_init_node_marks(store, plan, |e| e.name() != chosen_name).await?;
    set_init_node_mark(store, plan, &mut chosen).await?;
    Ok(chosen.metadata.annotation(JOIN_URL_ANNOTATION).to_string())
}

async fn set_init_node_mark(
    store: &PlanStore,
    plan: &mut Plan,
    entry: &mut PlanEntry,
) -> Result<(), Error> {
    if is_init_node(entry) {
        return Ok(());
    }
    entry
        .metadata
        .labels
        .insert(INIT_NODE_LABEL.to_string(), "true".to_string());
    store
        .update_plan_secret_labels_and_annotations(entry)
        .await?;
    plan.absorb(entry);
    debug!(machine = %entry.name(), "set init node mark");
    Ok(())
}

/// Clear the mark on every marked etcd entry matching `filter`
///
/// Returns whether anything changed.
async fn clear_init_node_marks<F>(store: &PlanStore, plan: &mut Plan, filter: F) -> Result<bool, Error>
where
    F: Fn(&PlanEntry) -> bool,
{
    let mut changed = false;
    for mut entry in collect(plan, is_etcd) {
        if !is_init_node(&entry) || !filter(&entry) {
            continue;
        }
        store
            .remove_plan_secret_label(&mut entry, INIT_NODE_LABEL)
            .await?;
        entry.metadata.labels.remove(INIT_NODE_LABEL);
        plan.absorb(&entry);
        debug!(machine = %entry.name(), "cleared init node mark");
        changed = true;
    }
    Ok(changed)
}
