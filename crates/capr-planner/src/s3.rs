//! Etcd S3 argument rendering
//!
//! Turns an [`EtcdS3`] target plus its cloud credential secret into distro
//! CLI arguments. The same arguments feed the distro config (prefix
//! `etcd-`, keys stripped of `--`) and the snapshot save/list/restore
//! instructions, where the secret key can be moved into the environment so
//! it doesn't show up in process listings.

use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;

use capr_common::crd::{EtcdS3, RKEControlPlane};
use capr_common::naming::sha256_hex;
use capr_common::Error;

use crate::client::SecretReader;
use crate::config::config_file;
use crate::plan::File;

const CREDENTIAL_PREFIX: &str = "amazonec2credentialConfig-";

/// Rendered S3 arguments
#[derive(Clone, Debug, Default, PartialEq)]
pub struct S3Args {
    /// `--<prefix>s3...` arguments
    pub args: Vec<String>,
    /// Environment carrying the secret key, when requested
    pub env: Vec<String>,
    /// Endpoint CA file referenced by the arguments
    pub files: Vec<File>,
}

/// Effective S3 settings after merging the credential's defaults
#[derive(Clone, Debug, Default, PartialEq)]
struct S3Credential {
    access_key: String,
    secret_key: String,
    bucket: String,
    region: String,
    folder: String,
    endpoint: String,
    endpoint_ca: String,
    skip_ssl_verify: bool,
}

/// True when the target names at least a bucket or a credential
pub fn s3_enabled(s3: Option<&EtcdS3>) -> bool {
    s3.is_some_and(|s3| !s3.bucket.is_empty() || !s3.cloud_credential_name.is_empty())
}

/// Render S3 arguments for a target; `None` renders nothing
pub async fn to_args(
    secrets: &dyn SecretReader,
    s3: Option<&EtcdS3>,
    control_plane: &RKEControlPlane,
    prefix: &str,
    secret_key_in_env: bool,
) -> Result<S3Args, Error> {
    let Some(s3) = s3 else {
        return Ok(S3Args::default());
    };
    let cred = credential(secrets, s3, control_plane).await?;
    let mut out = S3Args::default();

    out.args.push(format!("--{prefix}s3"));
    if !cred.access_key.is_empty() {
        out.args
            .push(format!("--{prefix}s3-access-key={}", cred.access_key));
    }
    if !cred.secret_key.is_empty() {
        if secret_key_in_env {
            out.env
                .push(format!("AWS_SECRET_ACCESS_KEY={}", cred.secret_key));
        } else {
            out.args
                .push(format!("--{prefix}s3-secret-key={}", cred.secret_key));
        }
    }
    for (flag, value) in [
        ("bucket", &cred.bucket),
        ("region", &cred.region),
        ("folder", &cred.folder),
        ("endpoint", &cred.endpoint),
    ] {
        if !value.is_empty() {
            out.args.push(format!("--{prefix}s3-{flag}={value}"));
        }
    }
    if !cred.endpoint_ca.is_empty() {
        let hash = sha256_hex(&cred.endpoint_ca);
        let path = config_file(control_plane, &format!("s3-endpoint-ca-{}.crt", &hash[..5]));
        out.files.push(File::new(path.clone(), &cred.endpoint_ca));
        out.args.push(format!("--{prefix}s3-endpoint-ca={path}"));
    }
    if cred.skip_ssl_verify {
        out.args.push(format!("--{prefix}s3-skip-ssl-verify"));
    }
    Ok(out)
}

/// Split `namespace:name`, defaulting the namespace to the control plane's
fn credential_ref(raw: &str, control_plane: &RKEControlPlane) -> (String, String) {
    match raw.split_once(':') {
        Some((namespace, name)) => (namespace.to_string(), name.to_string()),
        None => (
            control_plane.namespace().unwrap_or_default(),
            raw.to_string(),
        ),
    }
}

fn secret_value(secret: &Secret, key: &str) -> String {
    let data = secret.data.as_ref();
    [key.to_string(), format!("{CREDENTIAL_PREFIX}{key}")]
        .iter()
        .find_map(|k| data.and_then(|d| d.get(k)))
        .map(|v| String::from_utf8_lossy(&v.0).into_owned())
        .unwrap_or_default()
}

async fn credential(
    secrets: &dyn SecretReader,
    s3: &EtcdS3,
    control_plane: &RKEControlPlane,
) -> Result<S3Credential, Error> {
    let mut cred = S3Credential {
        bucket: s3.bucket.clone(),
        region: s3.region.clone(),
        folder: s3.folder.clone(),
        endpoint: s3.endpoint.clone(),
        endpoint_ca: s3.endpoint_ca.clone(),
        skip_ssl_verify: s3.skip_ssl_verify,
        ..Default::default()
    };
    if s3.cloud_credential_name.is_empty() {
        return Ok(cred);
    }

    let (namespace, name) = credential_ref(&s3.cloud_credential_name, control_plane);
    let secret = secrets.get_secret(&namespace, &name).await?.ok_or_else(|| {
        Error::validation(format!(
            "cloud credential {namespace}:{name} for etcd S3 was not found"
        ))
    })?;

    cred.access_key = secret_value(&secret, "accessKey");
    cred.secret_key = secret_value(&secret, "secretKey");
    // credential defaults fill in what the target leaves blank
    for (field, key) in [
        (&mut cred.bucket, "defaultBucket"),
        (&mut cred.region, "defaultRegion"),
        (&mut cred.folder, "defaultFolder"),
        (&mut cred.endpoint, "defaultEndpoint"),
        (&mut cred.endpoint_ca, "defaultEndpointCA"),
    ] {
        if field.is_empty() {
            *field = secret_value(&secret, key);
        }
    }
    if !cred.skip_ssl_verify {
        cred.skip_ssl_verify = secret_value(&secret, "defaultSkipSSLVerify") == "true";
    }
    Ok(cred)
}
