//! One-time and periodic instruction builders
//!
//! Every mutating instruction the planner hands to a node goes through
//! [`idempotent_instruction`]: the agent re-runs plans whenever they change,
//! so a destructive step (rotate, reset, rm) is wrapped by a small script
//! that records the last hash it ran for a key and skips identical replays.

use capr_common::crd::RKEControlPlane;
use capr_common::naming::sha256_hex;
use capr_common::runtime::Runtime;

use crate::filters::{is_control_plane, is_etcd, is_only_worker, is_windows};
use crate::plan::{CommonInstruction, File, NodePlan, OneTimeInstruction, PeriodicInstruction, PlanEntry};

/// Periodic instruction scraping the etcd member list on the init node
pub const CAPTURE_ADDRESS_INSTRUCTION_NAME: &str = "capture-address";
/// Periodic instruction reporting the local etcd member name
pub const ETCD_NAME_INSTRUCTION_NAME: &str = "etcd-name";
/// Periodic local snapshot listing
pub const ETCD_SNAPSHOT_LIST_LOCAL_INSTRUCTION_NAME: &str = "etcd-snapshot-list-local";
/// Periodic S3 snapshot listing
pub const ETCD_SNAPSHOT_LIST_S3_INSTRUCTION_NAME: &str = "etcd-snapshot-list-s3";
/// Install/run instruction name
pub const INSTALL_INSTRUCTION_NAME: &str = "install";
/// Windows ACL hardening instruction name
pub const SET_PERMISSIONS_WINDOWS_INSTRUCTION_NAME: &str = "set-permissions-windows";

const PERIODIC_SCRAPE_SECONDS: i64 = 600;

const IDEMPOTENT_SCRIPT: &str = r#"#!/bin/sh

key=$1
targetHash=$2
cmd=$3
shift 3

dataRoot="$(dirname "$0")/$key"
hashFile="$dataRoot/last-hash"

currentHash=""
if [ -f "$hashFile" ]; then
    currentHash=$(cat "$hashFile")
fi

if [ "$currentHash" != "$targetHash" ]; then
    set -e
    "$cmd" "$@"
    mkdir -p "$dataRoot"
    echo "$targetHash" > "$hashFile"
fi
"#;

const SET_PERMISSIONS_WINDOWS_SCRIPT_PATH: &str = "c:/var/lib/rancher/capr/set-permissions.ps1";

const SET_PERMISSIONS_WINDOWS_SCRIPT: &str = r#"$ErrorActionPreference = 'Stop'

$paths = @(
    "c:\etc\rancher",
    "c:\var\lib\rancher",
    "c:\usr\local\bin"
)

foreach ($path in $paths) {
    if (-not (Test-Path $path)) {
        continue
    }
    icacls $path /inheritance:r /grant:r "BUILTIN\Administrators:(OI)(CI)F" "NT AUTHORITY\SYSTEM:(OI)(CI)F" | Out-Null
    if ($LASTEXITCODE -ne 0) {
        throw "failed to restrict permissions on $path"
    }
}
"#;

/// Directory holding the idempotence script and its per-key state
pub fn idempotence_dir(control_plane: &RKEControlPlane) -> String {
    format!("{}/idempotence", control_plane.provisioning_data_dir())
}

/// Path of the idempotence script on the node
pub fn idempotent_script_path(control_plane: &RKEControlPlane) -> String {
    format!("{}/idempotent.sh", idempotence_dir(control_plane))
}

/// Script file every managed plan carries
pub fn idempotent_script_file(control_plane: &RKEControlPlane) -> File {
    File {
        path: idempotent_script_path(control_plane),
        dynamic: true,
        minor: true,
        ..File::new("", IDEMPOTENT_SCRIPT)
    }
}

fn idempotence_key(control_plane: &RKEControlPlane, identifier: &str) -> String {
    format!("{}-{identifier}", control_plane.runtime()).to_lowercase()
}

/// Wrap `command args...` so it runs at most once per `(identifier, value)`
pub fn idempotent_instruction(
    control_plane: &RKEControlPlane,
    identifier: &str,
    value: &str,
    command: &str,
    args: &[String],
    env: &[String],
) -> OneTimeInstruction {
    let mut wrapped = vec![
        "-x".to_string(),
        idempotent_script_path(control_plane),
        idempotence_key(control_plane, identifier),
        sha256_hex(value),
        command.to_string(),
    ];
    wrapped.extend(args.iter().cloned());

    OneTimeInstruction {
        common: CommonInstruction {
            name: format!("idempotent-{}", &sha256_hex(identifier)[..16]),
            command: "/bin/sh".to_string(),
            args: wrapped,
            env: env.to_vec(),
            ..Default::default()
        },
        save_output: false,
    }
}

/// Rewrap an existing instruction, keeping its image and output capture
pub fn convert_to_idempotent_instruction(
    control_plane: &RKEControlPlane,
    identifier: &str,
    value: &str,
    instruction: &OneTimeInstruction,
) -> OneTimeInstruction {
    let mut out = idempotent_instruction(
        control_plane,
        identifier,
        value,
        &instruction.common.command,
        &instruction.common.args,
        &instruction.common.env,
    );
    out.common.image = instruction.common.image.clone();
    out.save_output = instruction.save_output;
    out
}

/// `systemctl daemon-reload` then `systemctl restart <unit>`, both idempotent
pub fn idempotent_restart_instructions(
    control_plane: &RKEControlPlane,
    identifier: &str,
    value: &str,
    unit: &str,
) -> [OneTimeInstruction; 2] {
    [
        idempotent_instruction(
            control_plane,
            &format!("{identifier}/daemon-reload"),
            value,
            "systemctl",
            &["daemon-reload".to_string()],
            &[],
        ),
        idempotent_instruction(
            control_plane,
            &format!("{identifier}/restart"),
            value,
            "systemctl",
            &["restart".to_string(), unit.to_string()],
            &[],
        ),
    ]
}

/// Remove the recorded hashes under a key prefix
pub fn idempotent_cleanup_instruction(
    control_plane: &RKEControlPlane,
    key_prefix: &str,
) -> OneTimeInstruction {
    OneTimeInstruction {
        common: CommonInstruction {
            name: format!("cleanup-{}", &sha256_hex(key_prefix)[..16]),
            command: "/bin/sh".to_string(),
            args: vec![
                "-c".to_string(),
                format!(
                    "rm -rf {}/{}",
                    idempotence_dir(control_plane),
                    idempotence_key(control_plane, key_prefix)
                ),
            ],
            ..Default::default()
        },
        save_output: false,
    }
}

/// Static pod manifests rke2 runs for the entry's roles
///
/// k3s embeds its components and has none.
pub fn static_pod_manifests(control_plane: &RKEControlPlane, entry: &PlanEntry) -> Vec<String> {
    if control_plane.runtime() != Runtime::Rke2 {
        return Vec::new();
    }
    let dir = format!("{}/agent/pod-manifests", control_plane.distro_data_dir());
    let mut components = Vec::new();
    if is_etcd(entry) {
        components.push("etcd");
    }
    if is_control_plane(entry) {
        components.extend(["kube-apiserver", "kube-controller-manager", "kube-scheduler"]);
    }
    components
        .into_iter()
        .map(|c| format!("{dir}/{c}.yaml"))
        .collect()
}

/// Idempotently delete the entry's static pod manifests so they are recreated
pub fn remove_static_pod_manifests_instruction(
    control_plane: &RKEControlPlane,
    entry: &PlanEntry,
    identifier: &str,
    value: &str,
) -> Option<OneTimeInstruction> {
    let manifests = static_pod_manifests(control_plane, entry);
    if manifests.is_empty() {
        return None;
    }
    let mut args = vec!["-f".to_string()];
    args.extend(manifests);
    Some(idempotent_instruction(
        control_plane,
        identifier,
        value,
        "rm",
        &args,
        &[],
    ))
}

fn env_entry(windows: bool, key: &str, value: &str) -> String {
    if windows {
        format!("$env:{key}=\"{value}\"")
    } else {
        format!("{key}={value}")
    }
}

fn install_env(control_plane: &RKEControlPlane, entry: &PlanEntry) -> Vec<String> {
    let windows = is_windows(entry);
    let mut env: Vec<String> = control_plane
        .spec
        .agent_env_vars
        .iter()
        .filter(|v| !v.name.is_empty())
        .map(|v| env_entry(windows, &v.name, &v.value))
        .collect();
    if is_only_worker(entry) {
        env.push(env_entry(
            windows,
            &format!("INSTALL_{}_EXEC", control_plane.runtime().env_name()),
            "agent",
        ));
    }
    env
}

fn install_command(entry: &PlanEntry) -> (String, Vec<String>) {
    if is_windows(entry) {
        (
            "powershell.exe".to_string(),
            vec!["-File".to_string(), "run.ps1".to_string()],
        )
    } else {
        ("sh".to_string(), vec!["-c".to_string(), "run.sh".to_string()])
    }
}

/// Install/run instruction carrying the restart stamp
///
/// The stamp changes only when config or image changes, which is what makes
/// the installer bounce the service.
pub fn install_instruction(
    control_plane: &RKEControlPlane,
    entry: &PlanEntry,
    image: &str,
    restart_stamp: &str,
) -> OneTimeInstruction {
    let (command, args) = install_command(entry);
    let mut env = install_env(control_plane, entry);
    if is_windows(entry) {
        env.push(env_entry(true, "WINS_RESTART_STAMP", restart_stamp));
    } else {
        env.push(env_entry(false, "RESTART_STAMP", restart_stamp));
    }
    OneTimeInstruction {
        common: CommonInstruction {
            name: INSTALL_INSTRUCTION_NAME.to_string(),
            image: image.to_string(),
            command,
            args,
            env,
        },
        save_output: false,
    }
}

/// Install without starting the service; operations restart it themselves
pub fn install_instruction_skip_start(
    control_plane: &RKEControlPlane,
    entry: &PlanEntry,
    image: &str,
) -> OneTimeInstruction {
    let (command, args) = install_command(entry);
    let mut env = install_env(control_plane, entry);
    env.push(env_entry(
        is_windows(entry),
        &format!("INSTALL_{}_SKIP_START", control_plane.runtime().env_name()),
        "true",
    ));
    OneTimeInstruction {
        common: CommonInstruction {
            name: INSTALL_INSTRUCTION_NAME.to_string(),
            image: image.to_string(),
            command,
            args,
            env,
        },
        save_output: false,
    }
}

/// Periodic scrape of the etcd member list and the local member name
///
/// Together they let the store derive the init node's join URL without an
/// address on the machine object.
pub fn init_node_periodic_instructions(control_plane: &RKEControlPlane) -> [PeriodicInstruction; 2] {
    let data_dir = control_plane.distro_data_dir();
    let tls = format!("{data_dir}/server/tls/etcd");
    let capture = format!(
        "curl -s -f -L -X POST --connect-timeout 5 --max-time 10 \
         --cacert {tls}/server-ca.crt --cert {tls}/server-client.crt --key {tls}/server-client.key \
         https://{}:2379/v3/cluster/member/list | grep 'clientURLs'",
        control_plane.loopback_address()
    );
    [
        PeriodicInstruction {
            common: CommonInstruction {
                name: CAPTURE_ADDRESS_INSTRUCTION_NAME.to_string(),
                command: "sh".to_string(),
                args: vec!["-c".to_string(), capture],
                ..Default::default()
            },
            period_seconds: PERIODIC_SCRAPE_SECONDS,
            save_stderr_output: false,
        },
        PeriodicInstruction {
            common: CommonInstruction {
                name: ETCD_NAME_INSTRUCTION_NAME.to_string(),
                command: "sh".to_string(),
                args: vec![
                    "-c".to_string(),
                    format!("cat {data_dir}/server/db/etcd/name"),
                ],
                ..Default::default()
            },
            period_seconds: PERIODIC_SCRAPE_SECONDS,
            save_stderr_output: false,
        },
    ]
}

/// Periodic `etcd-snapshot list` against local storage
pub fn snapshot_list_local_instruction(control_plane: &RKEControlPlane) -> PeriodicInstruction {
    PeriodicInstruction {
        common: CommonInstruction {
            name: ETCD_SNAPSHOT_LIST_LOCAL_INSTRUCTION_NAME.to_string(),
            command: control_plane.runtime().as_str().to_string(),
            args: vec![
                "etcd-snapshot".to_string(),
                "list".to_string(),
                "--etcd-s3=false".to_string(),
            ],
            ..Default::default()
        },
        period_seconds: PERIODIC_SCRAPE_SECONDS,
        save_stderr_output: true,
    }
}

/// Periodic `etcd-snapshot list` against the configured S3 target
pub fn snapshot_list_s3_instruction(
    control_plane: &RKEControlPlane,
    s3_args: Vec<String>,
    s3_env: Vec<String>,
) -> PeriodicInstruction {
    let mut args = vec!["etcd-snapshot".to_string(), "list".to_string()];
    args.extend(s3_args);
    PeriodicInstruction {
        common: CommonInstruction {
            name: ETCD_SNAPSHOT_LIST_S3_INSTRUCTION_NAME.to_string(),
            command: control_plane.runtime().as_str().to_string(),
            args,
            env: s3_env,
            ..Default::default()
        },
        period_seconds: PERIODIC_SCRAPE_SECONDS,
        save_stderr_output: true,
    }
}

/// Append the Windows ACL hardening script and its instruction
pub fn add_windows_permissions(mut plan: NodePlan) -> NodePlan {
    plan.files.push(File::new(
        SET_PERMISSIONS_WINDOWS_SCRIPT_PATH,
        SET_PERMISSIONS_WINDOWS_SCRIPT,
    ));
    plan.instructions.push(OneTimeInstruction {
        common: CommonInstruction {
            name: SET_PERMISSIONS_WINDOWS_INSTRUCTION_NAME.to_string(),
            command: "powershell.exe".to_string(),
            args: vec![
                "-File".to_string(),
                SET_PERMISSIONS_WINDOWS_SCRIPT_PATH.to_string(),
            ],
            ..Default::default()
        },
        save_output: false,
    });
    plan
}

#[cfg(test)]
mod tests {
    use capr_common::crd::EnvVar;
    use capr_common::CATTLE_OS_LABEL;

    use super::*;
    use crate::filters::tests::entry;

    fn control_plane(version: &str) -> RKEControlPlane {
        let mut cp = RKEControlPlane::new("prod", Default::default());
        cp.spec.kubernetes_version = version.to_string();
        cp
    }

    #[test]
    fn test_idempotent_instruction_is_deterministic() {
        let cp = control_plane("v1.29.4+rke2r1");
        let args = vec!["-f".to_string(), "/x".to_string()];
        let a = idempotent_instruction(&cp, "certificate-rotation/rm", "3", "rm", &args, &[]);
        let b = idempotent_instruction(&cp, "certificate-rotation/rm", "3", "rm", &args, &[]);
        assert_eq!(a, b);
        assert_eq!(a.common.command, "/bin/sh");
        assert_eq!(
            a.common.args[1],
            "/var/lib/rancher/capr/idempotence/idempotent.sh"
        );
        assert_eq!(a.common.args[2], "rke2-certificate-rotation/rm");
        assert_eq!(a.common.args[3], sha256_hex("3"));
        assert_eq!(&a.common.args[4..], ["rm", "-f", "/x"]);
        assert!(a.common.name.starts_with("idempotent-"));
    }

    #[test]
    fn test_value_change_changes_hash_not_name() {
        let cp = control_plane("v1.29.4+k3s1");
        let a = idempotent_instruction(&cp, "rotate", "1", "k3s", &[], &[]);
        let b = idempotent_instruction(&cp, "rotate", "2", "k3s", &[], &[]);
        assert_eq!(a.common.name, b.common.name);
        assert_ne!(a.common.args, b.common.args);
    }

    #[test]
    fn test_restart_pair_reloads_before_restart() {
        let cp = control_plane("v1.29.4+k3s1");
        let [reload, restart] = idempotent_restart_instructions(&cp, "op/restart", "1", "k3s");
        assert_eq!(&reload.common.args[4..], ["systemctl", "daemon-reload"]);
        assert_eq!(&restart.common.args[4..], ["systemctl", "restart", "k3s"]);
        assert_ne!(reload.common.name, restart.common.name);
    }

    #[test]
    fn test_cleanup_targets_key_prefix() {
        let cp = control_plane("v1.29.4+rke2r1");
        let cleanup = idempotent_cleanup_instruction(&cp, "encryption-key-rotation");
        assert_eq!(
            cleanup.common.args[1],
            "rm -rf /var/lib/rancher/capr/idempotence/rke2-encryption-key-rotation"
        );
    }

    #[test]
    fn test_convert_keeps_image_and_output() {
        let cp = control_plane("v1.29.4+rke2r1");
        let original = OneTimeInstruction {
            common: CommonInstruction {
                name: "restore".to_string(),
                image: "installer:v1".to_string(),
                command: "rke2".to_string(),
                args: vec!["server".to_string()],
                env: vec!["A=B".to_string()],
            },
            save_output: true,
        };
        let out = convert_to_idempotent_instruction(&cp, "restore", "snap", &original);
        assert_eq!(out.common.image, "installer:v1");
        assert!(out.save_output);
        assert_eq!(out.common.env, ["A=B"]);
        assert_eq!(&out.common.args[4..], ["rke2", "server"]);
    }

    /// Story: a Linux worker gets the agent exec switch and the restart stamp
    /// while the user's agent env vars ride along.
    #[test]
    fn story_linux_worker_install() {
        let mut cp = control_plane("v1.29.4+rke2r1");
        cp.spec.agent_env_vars = vec![
            EnvVar {
                name: "HTTP_PROXY".to_string(),
                value: "http://proxy:3128".to_string(),
            },
            EnvVar::default(),
        ];
        let worker = entry("w", &["worker"]);
        let install = install_instruction(&cp, &worker, "agent-installer-rke2:v1", "stamp");
        assert_eq!(install.common.command, "sh");
        assert_eq!(install.common.args, ["-c", "run.sh"]);
        assert_eq!(
            install.common.env,
            [
                "HTTP_PROXY=http://proxy:3128",
                "INSTALL_RKE2_EXEC=agent",
                "RESTART_STAMP=stamp"
            ]
        );
    }

    #[test]
    fn test_windows_install_uses_powershell_env() {
        let cp = control_plane("v1.29.4+rke2r1");
        let mut worker = entry("w", &["worker"]);
        worker
            .machine
            .metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert(CATTLE_OS_LABEL.to_string(), "windows".to_string());
        let install = install_instruction(&cp, &worker, "img", "stamp");
        assert_eq!(install.common.command, "powershell.exe");
        assert!(install
            .common
            .env
            .contains(&"$env:WINS_RESTART_STAMP=\"stamp\"".to_string()));
        assert!(install
            .common
            .env
            .contains(&"$env:INSTALL_RKE2_EXEC=\"agent\"".to_string()));
    }

    #[test]
    fn test_skip_start_install() {
        let cp = control_plane("v1.29.4+k3s1");
        let server = entry("s", &["etcd", "cp"]);
        let install = install_instruction_skip_start(&cp, &server, "img");
        assert_eq!(install.common.env, ["INSTALL_K3S_SKIP_START=true"]);
    }

    #[test]
    fn test_static_pod_manifests_only_on_rke2() {
        let server = entry("s", &["etcd", "cp"]);
        assert!(static_pod_manifests(&control_plane("v1.29.4+k3s1"), &server).is_empty());
        let manifests = static_pod_manifests(&control_plane("v1.29.4+rke2r1"), &server);
        assert_eq!(manifests.len(), 4);
        assert!(manifests[0].ends_with("/agent/pod-manifests/etcd.yaml"));
    }

    #[test]
    fn test_snapshot_list_instructions() {
        let cp = control_plane("v1.29.4+k3s1");
        let local = snapshot_list_local_instruction(&cp);
        assert_eq!(local.common.command, "k3s");
        assert_eq!(local.period_seconds, 600);
        assert!(local.save_stderr_output);
        let s3 = snapshot_list_s3_instruction(
            &cp,
            vec!["--s3".to_string()],
            vec!["AWS_SECRET_ACCESS_KEY=x".to_string()],
        );
        assert_eq!(s3.common.args, ["etcd-snapshot", "list", "--s3"]);
        assert_eq!(s3.common.env.len(), 1);
    }
}
