//! Private registry rendering
//!
//! Produces the `registries.yaml` body for `spec.registries` and the TLS
//! material it points at. Credentials and certificates are read from
//! secrets in the control plane namespace.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use serde::Serialize;

use capr_common::crd::RKEControlPlane;
use capr_common::Error;

use crate::client::SecretReader;
use crate::plan::File;

const SECRET_TYPE_TLS: &str = "kubernetes.io/tls";
const SECRET_TYPE_BASIC_AUTH: &str = "kubernetes.io/basic-auth";
const SECRET_TYPE_AUTH_CONFIG: &str = "rke.cattle.io/auth-config";

/// Rendered registry configuration
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RenderedRegistries {
    /// `registries.yaml` content; empty when no registries are configured
    pub raw: Vec<u8>,
    /// Certificates and keys referenced by the config
    pub certificate_files: Vec<File>,
}

#[derive(Serialize, Default)]
struct RegistriesFile {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    mirrors: BTreeMap<String, MirrorEntry>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    configs: BTreeMap<String, ConfigEntry>,
}

#[derive(Serialize)]
struct MirrorEntry {
    endpoint: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    rewrite: BTreeMap<String, String>,
}

#[derive(Serialize, Default)]
struct ConfigEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    auth: Option<AuthEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tls: Option<TlsEntry>,
}

#[derive(Serialize, Default)]
struct AuthEntry {
    #[serde(skip_serializing_if = "String::is_empty")]
    username: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    password: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    auth: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    identity_token: String,
}

#[derive(Serialize, Default)]
struct TlsEntry {
    #[serde(skip_serializing_if = "String::is_empty")]
    cert_file: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    key_file: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    ca_file: String,
    insecure_skip_verify: bool,
}

fn tls_path(control_plane: &RKEControlPlane, registry: &str, file: &str) -> String {
    format!(
        "/etc/rancher/{}/tls/registries/{registry}/{file}",
        control_plane.runtime()
    )
}

fn data_string(secret: &Secret, key: &str) -> String {
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .map(|v| String::from_utf8_lossy(&v.0).into_owned())
        .unwrap_or_default()
}

async fn required_secret(
    secrets: &dyn SecretReader,
    namespace: &str,
    name: &str,
) -> Result<Secret, Error> {
    secrets.get_secret(namespace, name).await?.ok_or_else(|| {
        Error::validation(format!(
            "registry secret {namespace}/{name} was not found"
        ))
    })
}

/// Render `spec.registries` for a control plane
pub async fn render(
    secrets: &dyn SecretReader,
    control_plane: &RKEControlPlane,
) -> Result<RenderedRegistries, Error> {
    let Some(registries) = &control_plane.spec.registries else {
        return Ok(RenderedRegistries::default());
    };
    let namespace = control_plane.namespace().unwrap_or_default();
    let mut rendered = RenderedRegistries::default();
    let mut file = RegistriesFile::default();

    for (name, mirror) in &registries.mirrors {
        file.mirrors.insert(
            name.clone(),
            MirrorEntry {
                endpoint: mirror.endpoints.clone(),
                rewrite: mirror.rewrites.clone(),
            },
        );
    }

    for (registry, config) in &registries.configs {
        let mut entry = ConfigEntry::default();

        if config.insecure_skip_verify
            || !config.tls_secret_name.is_empty()
            || !config.ca_bundle.is_empty()
        {
            entry.tls = Some(TlsEntry {
                insecure_skip_verify: config.insecure_skip_verify,
                ..Default::default()
            });
        }

        if let Some(tls) = entry.tls.as_mut() {
            if !config.tls_secret_name.is_empty() {
                let secret = required_secret(secrets, &namespace, &config.tls_secret_name).await?;
                if secret.type_.as_deref() != Some(SECRET_TYPE_TLS) {
                    return Err(Error::validation(format!(
                        "secret [{}] must be of type [{SECRET_TYPE_TLS}]",
                        config.tls_secret_name
                    )));
                }
                let cert = data_string(&secret, "tls.crt");
                let key = data_string(&secret, "tls.key");
                if !cert.is_empty() && !key.is_empty() {
                    tls.cert_file = tls_path(control_plane, registry, "tls.crt");
                    tls.key_file = tls_path(control_plane, registry, "tls.key");
                    rendered
                        .certificate_files
                        .push(File::new(tls.cert_file.clone(), cert));
                    rendered
                        .certificate_files
                        .push(File::new(tls.key_file.clone(), key));
                }
            }
            if !config.ca_bundle.is_empty() {
                tls.ca_file = tls_path(control_plane, registry, "ca.crt");
                rendered
                    .certificate_files
                    .push(File::new(tls.ca_file.clone(), &config.ca_bundle));
            }
        }

        if !config.auth_config_secret_name.is_empty() {
            let secret =
                required_secret(secrets, &namespace, &config.auth_config_secret_name).await?;
            let type_ = secret.type_.as_deref().unwrap_or("");
            if type_ != SECRET_TYPE_AUTH_CONFIG && type_ != SECRET_TYPE_BASIC_AUTH {
                return Err(Error::validation(format!(
                    "secret [{}] must be of type [{SECRET_TYPE_AUTH_CONFIG}] or [{SECRET_TYPE_BASIC_AUTH}]",
                    config.auth_config_secret_name
                )));
            }
            entry.auth = Some(AuthEntry {
                username: data_string(&secret, "username"),
                password: data_string(&secret, "password"),
                auth: data_string(&secret, "auth"),
                identity_token: data_string(&secret, "identityToken"),
            });
        }

        file.configs.insert(registry.clone(), entry);
    }

    if file.mirrors.is_empty() && file.configs.is_empty() {
        return Ok(rendered);
    }
    rendered.raw = serde_yaml::to_string(&file)
        .map_err(|e| Error::serialization_for_kind("registries", e.to_string()))?
        .into_bytes();
    Ok(rendered)
}

#[cfg(test)]
mod tests {
    use k8s_openapi::ByteString;

    use capr_common::crd::{Mirror, Registry, RegistryConfig};

    use super::*;
    use crate::client::MockSecretReader;

    fn control_plane(registries: Registry) -> RKEControlPlane {
        let mut cp = RKEControlPlane::new("prod", Default::default());
        cp.spec.kubernetes_version = "v1.29.4+k3s1".to_string();
        cp.metadata.namespace = Some("fleet".to_string());
        cp.spec.registries = Some(registries);
        cp
    }

    fn secret(type_: &str, data: &[(&str, &str)]) -> Secret {
        Secret {
            type_: Some(type_.to_string()),
            data: Some(
                data.iter()
                    .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_no_registries_renders_nothing() {
        let mut cp = control_plane(Registry::default());
        cp.spec.registries = None;
        let secrets = MockSecretReader::new();
        let out = render(&secrets, &cp).await.expect("renders");
        assert!(out.raw.is_empty());
        assert!(out.certificate_files.is_empty());
    }

    /// Story: a mirror plus a registry with auth and a client certificate
    /// renders one registries.yaml and three files for the node.
    #[tokio::test]
    async fn story_mirror_with_auth_and_tls() {
        let mut registries = Registry::default();
        registries.mirrors.insert(
            "docker.io".to_string(),
            Mirror {
                endpoints: vec!["https://mirror.local".to_string()],
                rewrites: BTreeMap::new(),
            },
        );
        registries.configs.insert(
            "mirror.local".to_string(),
            RegistryConfig {
                auth_config_secret_name: "creds".to_string(),
                tls_secret_name: "client-tls".to_string(),
                ca_bundle: "CA".to_string(),
                insecure_skip_verify: false,
            },
        );
        let cp = control_plane(registries);

        let mut secrets = MockSecretReader::new();
        secrets.expect_get_secret().returning(|_, name| {
            Ok(Some(match name {
                "creds" => secret(
                    SECRET_TYPE_BASIC_AUTH,
                    &[("username", "bot"), ("password", "pw")],
                ),
                _ => secret(SECRET_TYPE_TLS, &[("tls.crt", "CERT"), ("tls.key", "KEY")]),
            }))
        });

        let out = render(&secrets, &cp).await.expect("renders");
        let yaml: serde_yaml::Value = serde_yaml::from_slice(&out.raw).expect("valid yaml");
        assert_eq!(
            yaml["mirrors"]["docker.io"]["endpoint"][0],
            serde_yaml::Value::from("https://mirror.local")
        );
        let config = &yaml["configs"]["mirror.local"];
        assert_eq!(config["auth"]["username"], serde_yaml::Value::from("bot"));
        assert_eq!(
            config["tls"]["ca_file"],
            serde_yaml::Value::from("/etc/rancher/k3s/tls/registries/mirror.local/ca.crt")
        );
        let paths: Vec<_> = out.certificate_files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths.len(), 3);
        assert!(paths.iter().all(|p| p.starts_with("/etc/rancher/k3s/tls/registries/")));
    }

    #[tokio::test]
    async fn test_tls_secret_must_have_tls_type() {
        let mut registries = Registry::default();
        registries.configs.insert(
            "r".to_string(),
            RegistryConfig {
                tls_secret_name: "opaque".to_string(),
                ..Default::default()
            },
        );
        let cp = control_plane(registries);
        let mut secrets = MockSecretReader::new();
        secrets
            .expect_get_secret()
            .returning(|_, _| Ok(Some(secret("Opaque", &[]))));
        let err = render(&secrets, &cp).await.expect_err("wrong type");
        assert!(err.to_string().contains("must be of type [kubernetes.io/tls]"));
    }
}
