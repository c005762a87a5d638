//! TLS material manager (C4): self-signed CA + leaf certs for the Vault
//! server/client pair and for the three etcd secrets this operator owns.
//!
//! rcgen cannot mint RSA keys itself (key generation is delegated to a
//! signing backend that only supports ECDSA/Ed25519); the RSA-2048 choice in
//! the original implementation was an artifact of Go's `crypto/rsa`, not a
//! protocol requirement Vault's listener cares about, so the generated CA and
//! leaf here use rcgen's native ECDSA P-256 keys (see DESIGN.md).

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use kube::{
    Api, Client, Resource,
    api::{ObjectMeta, PostParams},
};
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose,
};
use time::{Duration as TimeDuration, OffsetDateTime};
use vault_operator_types::{
    CA_TLS_CERT_NAME, VaultService, default_vault_client_tls_secret_name,
    default_vault_server_tls_secret_name, etcd_client_tls_secret_name,
    etcd_peer_tls_secret_name, etcd_server_tls_secret_name,
};

use crate::consts::ANNOTATION_CREATED_BY;
use crate::error::Error;

/// A generated certificate/key pair, PEM-encoded.
pub struct CertPair {
    pub cert_pem: String,
    pub key_pem: String,
}

fn ca_params() -> Result<CertificateParams, Error> {
    let mut params = CertificateParams::new(Vec::<String>::new())?;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyEncipherment,
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
    ];
    params
        .distinguished_name
        .push(DnType::CommonName, "vault-operator CA");
    let now = OffsetDateTime::now_utc();
    params.not_before = now - TimeDuration::minutes(5);
    params.not_after = now + TimeDuration::days(365);
    Ok(params)
}

/// Generates a fresh self-signed CA. Returns the CA cert PEM (for the client
/// secret) alongside the params/key pair needed to sign leaf certificates.
fn generate_ca() -> Result<(String, CertificateParams, KeyPair), Error> {
    let params = ca_params()?;
    let key_pair = KeyPair::generate()?;
    let cert = params.clone().self_signed(&key_pair)?;
    Ok((cert.pem(), params, key_pair))
}

/// Signs a leaf certificate for `sans` off the given CA, with server+client
/// extended key usage (§4.3).
fn generate_leaf(
    sans: Vec<String>,
    ca_params: &CertificateParams,
    ca_key: &KeyPair,
) -> Result<CertPair, Error> {
    let mut params = CertificateParams::new(sans)?;
    params.key_usages = vec![
        KeyUsagePurpose::KeyEncipherment,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];
    params
        .distinguished_name
        .push(DnType::CommonName, "vault-operator leaf");
    let now = OffsetDateTime::now_utc();
    params.not_before = now - TimeDuration::minutes(5);
    params.not_after = now + TimeDuration::days(365);

    let key_pair = KeyPair::generate()?;
    let issuer = Issuer::from_params(ca_params, ca_key);
    let cert = params.signed_by(&key_pair, &issuer)?;
    Ok(CertPair {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
    })
}

/// A freshly generated CA + leaf pair, ready to be split across the client
/// (CA-only) and server (leaf-only) secrets.
struct GeneratedPair {
    ca_cert_pem: String,
    leaf: CertPair,
}

fn generate_pair(sans: Vec<String>) -> Result<GeneratedPair, Error> {
    let (ca_cert_pem, ca_params, ca_key) = generate_ca()?;
    let leaf = generate_leaf(sans, &ca_params, &ca_key)?;
    Ok(GeneratedPair { ca_cert_pem, leaf })
}

fn owned_secret(
    name: &str,
    namespace: &str,
    owner: &VaultService,
    string_data: BTreeMap<String, String>,
) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            owner_references: Some(vec![owner.controller_owner_ref(&()).unwrap()]),
            annotations: Some(BTreeMap::from([(
                ANNOTATION_CREATED_BY.to_string(),
                "vault-operator".to_string(),
            )])),
            ..Default::default()
        },
        string_data: Some(string_data),
        ..Default::default()
    }
}

async fn create_if_absent(api: &Api<Secret>, secret: &Secret) -> Result<(), Error> {
    match api.create(&PostParams::default(), secret).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Resolves the (server, client) secret names `ensure_vault_tls` and
/// `deploy::tls_projected_volume` both target: whatever `spec.tls.static`
/// actually holds, falling back to the default names only if that field is
/// somehow still absent (defaulting always populates it — see
/// `VaultService::apply_defaults`). Kept pure so the resolution itself is
/// unit-testable without an API client.
pub fn vault_secret_names(cluster: &VaultService) -> (String, String) {
    let name = cluster.metadata.name.clone().unwrap_or_default();
    let static_tls = cluster.spec.tls.as_ref().and_then(|t| t.static_tls.as_ref());
    let server_name = static_tls
        .map(|s| s.server_secret.clone())
        .unwrap_or_else(|| default_vault_server_tls_secret_name(&name));
    let client_name = static_tls
        .map(|s| s.client_secret.clone())
        .unwrap_or_else(|| default_vault_client_tls_secret_name(&name));
    (server_name, client_name)
}

/// Ensures the Vault server/client TLS secrets named by `spec.tls.static`
/// exist (defaulting guarantees this field is always populated, either by
/// the user or with the default secret names). Idempotent: a name the user
/// already pre-created is left untouched (`AlreadyExists` is success and the
/// operator never attaches an owner reference to it); a name that does not
/// yet exist is generated and owned by this `cluster` (§4.3).
pub async fn ensure_vault_tls(client: Client, cluster: &VaultService) -> Result<(), Error> {
    let namespace = cluster.metadata.namespace.clone().unwrap_or_default();
    let name = cluster.metadata.name.clone().unwrap_or_default();
    let api: Api<Secret> = Api::namespaced(client, &namespace);

    let (server_name, client_name) = vault_secret_names(cluster);

    let sans = vec![
        "localhost".to_string(),
        format!("*.{namespace}.pod"),
        format!("{name}.{namespace}.svc"),
    ];
    let pair = generate_pair(sans)?;

    let server_secret = owned_secret(
        &server_name,
        &namespace,
        cluster,
        BTreeMap::from([
            ("server.crt".to_string(), pair.leaf.cert_pem.clone()),
            ("server.key".to_string(), pair.leaf.key_pem.clone()),
        ]),
    );
    let client_secret = owned_secret(
        &client_name,
        &namespace,
        cluster,
        BTreeMap::from([(CA_TLS_CERT_NAME.to_string(), pair.ca_cert_pem.clone())]),
    );

    create_if_absent(&api, &server_secret).await?;
    create_if_absent(&api, &client_secret).await?;
    Ok(())
}

/// Ensures the three etcd TLS secrets (peer, server, client) exist for the
/// backing etcd cluster, each an independent CA+leaf pair (§4.3).
pub async fn ensure_etcd_tls(client: Client, cluster: &VaultService) -> Result<(), Error> {
    let name = cluster.metadata.name.clone().unwrap_or_default();
    let namespace = cluster.metadata.namespace.clone().unwrap_or_default();
    let api: Api<Secret> = Api::namespaced(client, &namespace);

    for (secret_name, role) in [
        (etcd_peer_tls_secret_name(&name), "peer"),
        (etcd_server_tls_secret_name(&name), "server"),
        (etcd_client_tls_secret_name(&name), "client"),
    ] {
        let sans = vec![
            "localhost".to_string(),
            format!("*.{name}-etcd.{namespace}.svc"),
            format!("{name}-etcd-client.{namespace}.svc"),
        ];
        let pair = generate_pair(sans)?;
        let secret = owned_secret(
            &secret_name,
            &namespace,
            cluster,
            BTreeMap::from([
                ("ca.crt".to_string(), pair.ca_cert_pem),
                (format!("{role}.crt"), pair.leaf.cert_pem),
                (format!("{role}.key"), pair.leaf.key_pem),
            ]),
        );
        create_if_absent(&api, &secret).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vault_operator_types::{StaticTls, TlsPolicy, VaultServiceSpec};

    #[test]
    fn leaf_is_signed_by_the_generated_ca() {
        let pair = generate_pair(vec!["localhost".to_string()]).expect("generate");
        assert!(pair.ca_cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(pair.leaf.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(pair.leaf.key_pem.contains("BEGIN PRIVATE KEY") || pair.leaf.key_pem.contains("BEGIN EC PRIVATE KEY"));
    }

    #[test]
    fn vault_secret_names_falls_back_to_defaults_when_tls_absent() {
        let mut v = VaultService::new("v", VaultServiceSpec::default());
        v.metadata.name = Some("v".to_string());
        assert_eq!(
            vault_secret_names(&v),
            (
                default_vault_server_tls_secret_name("v"),
                default_vault_client_tls_secret_name("v"),
            )
        );
    }

    #[test]
    fn vault_secret_names_honors_user_supplied_static_names() {
        let mut v = VaultService::new("v", VaultServiceSpec::default());
        v.metadata.name = Some("v".to_string());
        v.spec.tls = Some(TlsPolicy {
            static_tls: Some(StaticTls {
                server_secret: "my-server-tls".to_string(),
                client_secret: "my-client-tls".to_string(),
            }),
        });
        assert_eq!(
            vault_secret_names(&v),
            ("my-server-tls".to_string(), "my-client-tls".to_string())
        );
    }
}
