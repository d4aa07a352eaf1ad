//! Annotation-driven drain coordination
//!
//! The planner never drains a node itself. It writes the drain options onto
//! the machine's plan secret and waits for an external drain controller to
//! acknowledge them; everything is in annotations, so an interrupted drain
//! resumes where it left off after a restart.
//!
//! Protocol for one major plan change:
//!
//! 1. `drain-options` (and `pre-drain` when pre hooks exist) are set to the
//!    JSON-encoded options.
//! 2. Each pre hook annotation must echo the encoded options.
//! 3. `drain-done` must echo them too; `drain-error` is surfaced meanwhile.
//! 4. `post-drain` is set and each post hook must echo the options.
//!
//! Undrain sets `uncordon` and waits for the controller to clear it.

use tracing::{debug, info};

use capr_common::crd::{DrainHook, DrainOptions, RKEControlPlane};
use capr_common::{
    Error, DRAIN_ANNOTATION, DRAIN_DONE_ANNOTATION, DRAIN_ERROR_ANNOTATION,
    POST_DRAIN_ANNOTATION, PRE_DRAIN_ANNOTATION, UNCORDON_ANNOTATION,
};

use crate::config::drain_hash;
use crate::instructions::INSTALL_INSTRUCTION_NAME;
use crate::plan::{NodePlan, PlanEntry};
use crate::store::PlanStore;

/// Image of the install instruction, which the drain hash covers
fn install_image(plan: &NodePlan) -> &str {
    plan.instructions
        .iter()
        .find(|i| i.common.name == INSTALL_INSTRUCTION_NAME)
        .map(|i| i.common.image.as_str())
        .unwrap_or("")
}

/// True when moving from `applied` to `desired` needs the node drained
pub fn drain_required(
    control_plane: &RKEControlPlane,
    applied: Option<&NodePlan>,
    desired: &NodePlan,
) -> Result<bool, Error> {
    let Some(applied) = applied else {
        return Ok(false);
    };
    Ok(drain_hash(applied, control_plane, install_image(applied))?
        != drain_hash(desired, control_plane, install_image(desired))?)
}

fn hooks_done(entry: &PlanEntry, hooks: &[DrainHook], encoded: &str) -> bool {
    hooks
        .iter()
        .all(|h| entry.metadata.annotation(&h.annotation) == encoded)
}

/// Drive the drain protocol one step
///
/// Returns `Ok(true)` once the node may receive the new plan. A drain error
/// reported by the controller comes back as an ignorable error so only this
/// machine's status carries it. `single_machine` skips the drain itself but
/// still runs the hooks.
pub async fn drain(
    store: &PlanStore,
    control_plane: &RKEControlPlane,
    applied: Option<&NodePlan>,
    desired: &NodePlan,
    entry: &mut PlanEntry,
    options: &DrainOptions,
    single_machine: bool,
) -> Result<bool, Error> {
    if !drain_required(control_plane, applied, desired)? {
        return Ok(true);
    }

    let mut options = options.clone();
    if single_machine {
        options.enabled = false;
    }
    if !options.enabled && options.pre_drain_hooks.is_empty() && options.post_drain_hooks.is_empty() {
        return Ok(true);
    }

    let encoded = serde_json::to_string(&options)?;

    if entry.metadata.annotation(DRAIN_ANNOTATION) != encoded {
        let annotations = &mut entry.metadata.annotations;
        annotations.insert(DRAIN_ANNOTATION.to_string(), encoded.clone());
        if !options.pre_drain_hooks.is_empty() {
            annotations.insert(PRE_DRAIN_ANNOTATION.to_string(), encoded.clone());
        }
        store
            .update_plan_secret_labels_and_annotations(entry)
            .await?;
        info!(machine = %entry.name(), "requested drain");
        return Ok(false);
    }

    if !hooks_done(entry, &options.pre_drain_hooks, &encoded) {
        debug!(machine = %entry.name(), "waiting for pre-drain hooks");
        return Ok(false);
    }

    if entry.metadata.annotation(DRAIN_DONE_ANNOTATION) != encoded {
        let error = entry.metadata.annotation(DRAIN_ERROR_ANNOTATION);
        if !error.is_empty() {
            return Err(Error::ignore(format!(
                "error draining machine {}: {error}",
                entry.name()
            )));
        }
        return Ok(false);
    }

    if !options.post_drain_hooks.is_empty() {
        if entry.metadata.annotation(POST_DRAIN_ANNOTATION) != encoded {
            entry
                .metadata
                .annotations
                .insert(POST_DRAIN_ANNOTATION.to_string(), encoded);
            store
                .update_plan_secret_labels_and_annotations(entry)
                .await?;
            return Ok(false);
        }
        if !hooks_done(entry, &options.post_drain_hooks, &encoded) {
            debug!(machine = %entry.name(), "waiting for post-drain hooks");
            return Ok(false);
        }
    }

    Ok(true)
}

/// Ask the controller to uncordon a drained node
///
/// Returns `Ok(true)` when the node carries no drain state.
pub async fn undrain(store: &PlanStore, entry: &mut PlanEntry) -> Result<bool, Error> {
    let drained = !entry.metadata.annotation(DRAIN_ANNOTATION).is_empty();
    let uncordoning = !entry.metadata.annotation(UNCORDON_ANNOTATION).is_empty();
    if !drained && !uncordoning {
        return Ok(true);
    }
    if !uncordoning {
        entry
            .metadata
            .annotations
            .insert(UNCORDON_ANNOTATION.to_string(), "true".to_string());
        store
            .update_plan_secret_labels_and_annotations(entry)
            .await?;
        info!(machine = %entry.name(), "requested uncordon");
    }
    Ok(false)
}
