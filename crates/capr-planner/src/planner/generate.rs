//! Per-machine plan rendering

use capr_common::crd::{GenericMap, RKEControlPlane};
use capr_common::Error;

use super::{Pass, Planner};
use crate::config::{
    add_chart_configs, add_config_file, add_local_cluster_auth_endpoint_file, restart_stamp,
    RenderContext,
};
use crate::filters::{
    is_control_plane, is_etcd, is_init_node, is_only_etcd, is_windows, join_url_autoset_disabled,
};
use crate::instructions::{
    add_windows_permissions, idempotent_script_file, init_node_periodic_instructions,
    install_instruction, snapshot_list_local_instruction, snapshot_list_s3_instruction,
};
use crate::plan::{File, NodePlan, PlanEntry};
use crate::probes::probes;
use crate::registries;
use crate::s3;

/// Plan with its rendered distro config and the server it joins
pub(crate) struct GeneratedPlan {
    pub(crate) plan: NodePlan,
    pub(crate) config: GenericMap,
    pub(crate) joined_server: String,
}

impl Planner {
    /// Installer image for the control plane's runtime and version
    pub(crate) fn installer_image(&self, control_plane: &RKEControlPlane) -> String {
        self.config.installer_image(
            &self.info.system_agent_image(),
            control_plane.runtime().as_str(),
            &control_plane.spec.kubernetes_version,
        )
    }

    fn render_context<'a>(&'a self, pass: Pass<'a>) -> RenderContext<'a> {
        RenderContext {
            control_plane: pass.control_plane,
            release: pass.release,
            secrets: &*self.secrets,
        }
    }

    /// Files-only plan for an entry
    ///
    /// Any plan already on the entry is discarded. `render_s3` controls
    /// whether the etcd S3 settings land in the distro config; the restore
    /// path renders them on the command line instead.
    pub(crate) async fn generate_plan_with_config_files(
        &self,
        pass: Pass<'_>,
        entry: &PlanEntry,
        join_server: &str,
        render_s3: bool,
    ) -> Result<GeneratedPlan, Error> {
        let cp = pass.control_plane;
        if cp.spec.unmanaged_config {
            return Ok(GeneratedPlan {
                plan: NodePlan::default(),
                config: GenericMap::new(),
                joined_server: String::new(),
            });
        }

        let registries = registries::render(&*self.secrets, cp).await?;
        let common = NodePlan {
            files: registries.certificate_files.clone(),
            ..Default::default()
        };

        let ctx = self.render_context(pass);
        let rendered = add_config_file(
            ctx,
            common,
            entry,
            pass.tokens,
            join_server,
            &registries,
            render_s3,
        )
        .await?;

        let mut plan = rendered.plan;
        plan.files.extend(self.manifests(cp, entry).await?);
        let mut plan = add_chart_configs(plan, ctx, entry)?;
        plan = add_local_cluster_auth_endpoint_file(plan, cp, entry);
        plan.files.push(idempotent_script_file(cp));

        Ok(GeneratedPlan {
            plan,
            config: rendered.config,
            joined_server: rendered.joined_server,
        })
    }

    /// Manifests for an entry
    ///
    /// Pending pre-bootstrap manifests replace everything else until they
    /// have been applied.
    async fn manifests(
        &self,
        control_plane: &RKEControlPlane,
        entry: &PlanEntry,
    ) -> Result<Vec<File>, Error> {
        let pre_bootstrap = self.info.pre_bootstrap_manifests(control_plane).await?;
        if !pre_bootstrap.is_empty() {
            return Ok(pre_bootstrap);
        }

        let mut files = if is_init_node(entry) {
            self.info.bootstrap_manifests(control_plane).await?
        } else if is_control_plane(entry) {
            self.info.control_plane_manifests(control_plane).await?
        } else {
            Vec::new()
        };

        if is_control_plane(entry) && !control_plane.spec.additional_manifest.is_empty() {
            let mut file = File::new(
                format!(
                    "{}/server/manifests/rancher/additional-manifest.yaml",
                    control_plane.distro_data_dir()
                ),
                &control_plane.spec.additional_manifest,
            );
            file.dynamic = true;
            files.push(file);
        }
        Ok(files)
    }

    /// Full desired plan for an entry, with probes and the install instruction
    ///
    /// Returns the plan and the server it joins (`-` for the init node).
    pub(crate) async fn desired_plan(
        &self,
        pass: Pass<'_>,
        entry: &PlanEntry,
        join_server: &str,
    ) -> Result<(NodePlan, String), Error> {
        let cp = pass.control_plane;
        let generated = self
            .generate_plan_with_config_files(pass, entry, join_server, true)
            .await?;
        let mut plan = generated.plan;
        plan.probes = probes(cp, entry, &generated.config);

        // the stamp hashes file content, so the install instruction goes last
        let image = self.installer_image(cp);
        let stamp = restart_stamp(&plan, cp, &image);
        plan.instructions
            .push(install_instruction(cp, entry, &image, &stamp));

        if is_init_node(entry) && is_only_etcd(entry) && !join_url_autoset_disabled(entry) {
            plan.periodic_instructions
                .extend(init_node_periodic_instructions(cp));
        }

        let ready = cp.status.as_ref().is_some_and(|s| s.ready);
        if is_windows(entry) && ready {
            plan = add_windows_permissions(plan);
        }

        if is_etcd(entry) {
            plan.periodic_instructions
                .push(snapshot_list_local_instruction(cp));
            let target = cp.spec.etcd.as_ref().and_then(|e| e.s3.as_ref());
            if s3::s3_enabled(target) && is_init_node(entry) {
                let args = s3::to_args(&*self.secrets, target, cp, "etcd-", true).await?;
                plan.periodic_instructions
                    .push(snapshot_list_s3_instruction(cp, args.args, args.env));
                plan.files.extend(args.files);
            }
        }

        Ok((plan, generated.joined_server))
    }
}
