//! Role and life-cycle predicates over plan entries
//!
//! Roles come from the machine's role labels, the init-node mark from the
//! plan secret labels. Every predicate is a plain `fn` so they compose into
//! include/exclude pairs for [`collect`].

use capr_common::{
    CATTLE_OS_LABEL, CONTROL_PLANE_ROLE_LABEL, ETCD_ROLE_LABEL, INIT_NODE_LABEL,
    JOINED_TO_ANNOTATION, JOIN_URL_ANNOTATION, JOIN_URL_AUTOSET_DISABLED, WINDOWS_OS,
    WORKER_ROLE_LABEL,
};

use crate::plan::{Metadata, Plan, PlanEntry};

/// Predicate over a plan entry
pub type Filter = fn(&PlanEntry) -> bool;

/// Machine carries the etcd role
pub fn is_etcd(entry: &PlanEntry) -> bool {
    entry.machine.label(ETCD_ROLE_LABEL) == "true"
}

/// Machine carries the control plane role
pub fn is_control_plane(entry: &PlanEntry) -> bool {
    entry.machine.label(CONTROL_PLANE_ROLE_LABEL) == "true"
}

/// Machine carries the worker role
pub fn is_worker(entry: &PlanEntry) -> bool {
    entry.machine.label(WORKER_ROLE_LABEL) == "true"
}

/// Plan secret carries the init-node mark
pub fn is_init_node(entry: &PlanEntry) -> bool {
    entry.metadata.label(INIT_NODE_LABEL) == "true"
}

/// Machine has a deletion timestamp
pub fn is_deleting(entry: &PlanEntry) -> bool {
    entry.machine.is_deleting()
}

/// CAPI reports a terminal failure
pub fn is_failed(entry: &PlanEntry) -> bool {
    entry.machine.is_failed()
        || entry
            .machine
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            == Some("Failed")
}

/// Healthy etcd machine eligible to bootstrap the cluster
pub fn can_be_init_node(entry: &PlanEntry) -> bool {
    is_etcd(entry) && !is_deleting(entry) && !is_failed(entry)
}

/// Etcd without control plane
pub fn is_only_etcd(entry: &PlanEntry) -> bool {
    is_etcd(entry) && !is_control_plane(entry)
}

/// Control plane without etcd
pub fn is_only_control_plane(entry: &PlanEntry) -> bool {
    !is_etcd(entry) && is_control_plane(entry)
}

/// Worker without any server role
pub fn is_only_worker(entry: &PlanEntry) -> bool {
    !is_etcd(entry) && !is_control_plane(entry) && is_worker(entry)
}

/// Init node running only etcd, whose join URL comes from probe output
pub fn is_etcd_only_init_node(entry: &PlanEntry) -> bool {
    is_init_node(entry) && is_only_etcd(entry)
}

/// Init node, or anything being deleted
pub fn is_init_node_or_deleting(entry: &PlanEntry) -> bool {
    is_init_node(entry) || is_deleting(entry)
}

/// Neither the init node nor deleting
pub fn is_not_init_node_or_is_deleting(entry: &PlanEntry) -> bool {
    !is_init_node(entry) || is_deleting(entry)
}

/// No role labels at all
pub fn no_role(entry: &PlanEntry) -> bool {
    !is_etcd(entry) && !is_control_plane(entry) && !is_worker(entry)
}

/// Plan secret has a join URL
pub fn has_join_url(entry: &PlanEntry) -> bool {
    !entry.metadata.annotation(JOIN_URL_ANNOTATION).is_empty()
}

/// Plan secret records which server this node joined
pub fn has_joined_to(entry: &PlanEntry) -> bool {
    !entry.metadata.annotation(JOINED_TO_ANNOTATION).is_empty()
}

/// Join URL discovery is disabled for this machine
pub fn join_url_autoset_disabled(entry: &PlanEntry) -> bool {
    entry
        .metadata
        .annotations
        .contains_key(JOIN_URL_AUTOSET_DISABLED)
}

/// Machine runs Windows
pub fn is_windows(entry: &PlanEntry) -> bool {
    entry.machine.label(CATTLE_OS_LABEL) == WINDOWS_OS
}

/// Matches every entry
pub fn any(_: &PlanEntry) -> bool {
    true
}

/// Matches no entry
pub fn none(_: &PlanEntry) -> bool {
    false
}

/// Any machine in the cluster has been delivered a plan
pub fn any_plan_data_exists(plan: &Plan) -> bool {
    plan.nodes.values().any(|n| n.plan_data_exists)
}

/// Build the entry for one machine name, if the machine exists
pub fn entry_for(plan: &Plan, name: &str) -> Option<PlanEntry> {
    plan.machines.get(name).map(|machine| PlanEntry {
        machine: machine.clone(),
        plan: plan.nodes.get(name).cloned(),
        metadata: plan.metadata.get(name).cloned().unwrap_or_else(Metadata::default),
    })
}

/// Entries matching `include`, sorted by machine name
pub fn collect(plan: &Plan, include: Filter) -> Vec<PlanEntry> {
    plan.machines
        .keys()
        .filter_map(|name| entry_for(plan, name))
        .filter(|e| include(e))
        .collect()
}

/// Entries matching `include` and not `exclude`, sorted by machine name
pub fn collect_excluding(plan: &Plan, include: Filter, exclude: Filter) -> Vec<PlanEntry> {
    plan.machines
        .keys()
        .filter_map(|name| entry_for(plan, name))
        .filter(|e| include(e) && !exclude(e))
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::BTreeMap;

    use capr_common::crd::{Machine, MachineSpec};
    use rstest::rstest;

    use super::*;
    use crate::plan::Node;

    /// Machine with role labels, for tests across the crate
    pub(crate) fn machine(name: &str, roles: &[&str]) -> Machine {
        let mut m = Machine::new(name, MachineSpec::default());
        m.metadata.namespace = Some("fleet".to_string());
        m.metadata.uid = Some(format!("uid-{name}"));
        let mut labels = BTreeMap::new();
        for role in roles {
            let key = match *role {
                "etcd" => ETCD_ROLE_LABEL,
                "cp" => CONTROL_PLANE_ROLE_LABEL,
                "worker" => WORKER_ROLE_LABEL,
                other => other,
            };
            labels.insert(key.to_string(), "true".to_string());
        }
        m.metadata.labels = Some(labels);
        m
    }

    pub(crate) fn entry(name: &str, roles: &[&str]) -> PlanEntry {
        PlanEntry {
            machine: machine(name, roles),
            plan: None,
            metadata: Metadata::default(),
        }
    }

    #[rstest]
    #[case::etcd_only(&["etcd"], true, false, false, true)]
    #[case::etcd_cp(&["etcd", "cp"], true, true, false, false)]
    #[case::cp_only(&["cp"], false, true, false, false)]
    #[case::worker(&["worker"], false, false, true, false)]
    fn test_role_predicates(
        #[case] roles: &[&str],
        #[case] etcd: bool,
        #[case] cp: bool,
        #[case] worker: bool,
        #[case] only_etcd: bool,
    ) {
        let e = entry("m", roles);
        assert_eq!(is_etcd(&e), etcd);
        assert_eq!(is_control_plane(&e), cp);
        assert_eq!(is_worker(&e), worker);
        assert_eq!(is_only_etcd(&e), only_etcd);
        assert_eq!(is_only_worker(&e), worker);
        assert!(!no_role(&e));
    }

    #[test]
    fn test_init_node_mark_lives_on_plan_secret() {
        let mut e = entry("m", &["etcd"]);
        assert!(!is_init_node(&e));
        e.metadata
            .labels
            .insert(INIT_NODE_LABEL.to_string(), "true".to_string());
        assert!(is_init_node(&e));
        assert!(is_etcd_only_init_node(&e));
        assert!(can_be_init_node(&e));
    }

    #[test]
    fn test_failed_phase_excludes_init_candidates() {
        let mut e = entry("m", &["etcd"]);
        e.machine.status = Some(capr_common::crd::MachineStatus {
            phase: Some("Failed".to_string()),
            ..Default::default()
        });
        assert!(is_failed(&e));
        assert!(!can_be_init_node(&e));
    }

    #[test]
    fn test_collect_sorts_and_excludes() {
        let mut plan = Plan::default();
        for (name, roles) in [("c", &["worker"][..]), ("a", &["etcd"]), ("b", &["etcd", "cp"])] {
            plan.machines.insert(name.to_string(), machine(name, roles));
        }
        plan.nodes.insert(
            "a".to_string(),
            Node {
                plan_data_exists: true,
                ..Default::default()
            },
        );

        let etcd: Vec<_> = collect(&plan, is_etcd).iter().map(|e| e.name().to_string()).collect();
        assert_eq!(etcd, ["a", "b"]);

        let rest = collect_excluding(&plan, any, is_only_etcd);
        assert_eq!(rest.len(), 2);
        assert!(rest[0].plan.is_none());
        assert!(any_plan_data_exists(&plan));
    }
}
