use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Default container image for a managed Vault replica.
pub const DEFAULT_BASE_IMAGE: &str = "quay.io/coreos/vault";
/// Default upstream Vault version. Format is "<upstream-version>-<operator-version>".
pub const DEFAULT_VERSION: &str = "0.11.1-0";

fn default_nodes() -> u32 {
    1
}

/// Resource requirements applied to each managed Vault container, mirroring
/// Kubernetes' own `ResourceRequirements` shape closely enough to pass through
/// to a `Container.resources` field without reinterpretation.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct PodResources {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<BTreeMap<String, String>>,
}

/// Names of pre-created secrets holding static (user-supplied) TLS material.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct StaticTls {
    /// Secret containing `server.crt` and `server.key` for the Vault listener.
    pub server_secret: String,
    /// Secret containing `vault-client-ca.crt` used to verify the server cert.
    pub client_secret: String,
}

/// TLS policy of the Vault nodes. Absent means the operator auto-generates
/// and owns the TLS material (see the TLS material manager).
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct TlsPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "static")]
    pub static_tls: Option<StaticTls>,
}

impl TlsPolicy {
    /// Whether the user supplied both secrets required for a static policy.
    pub fn is_configured(&self) -> bool {
        self.static_tls
            .as_ref()
            .is_some_and(|s| !s.server_secret.is_empty() && !s.client_secret.is_empty())
    }
}

#[derive(CustomResource, Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "vault.security.coreos.com",
    version = "v1alpha1",
    kind = "VaultService",
    plural = "vaultservices",
    shortname = "vault",
    derive = "PartialEq",
    status = "VaultServiceStatus",
    namespaced
)]
#[kube(derive = "Default")]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.phase\", \"name\": \"PHASE\", \"type\": \"string\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.lastUpdated\", \"name\": \"AGE\", \"type\": \"date\" }"
)]
pub struct VaultServiceSpec {
    /// Desired number of Vault replicas.
    #[serde(default = "default_nodes")]
    pub nodes: u32,
    /// Image repository for the Vault container; combined with `version` for
    /// the running image reference, so the upgrade protocol can compare them
    /// independently of the pod's full image string.
    #[serde(default)]
    pub base_image: String,
    #[serde(default)]
    pub version: String,
    /// Opaque integrity tag for the rendered config payload. A change implies
    /// the config map must be redeployed; the operator does not interpret it.
    #[serde(default)]
    pub config_map_hash: String,
    /// Resource requirements applied to each managed container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod: Option<PodResources>,
    /// Name of a user-provided base HCL ConfigMap. The operator appends/overrides
    /// the `listener` and `storage` stanzas on top of its contents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map_name: Option<String>,
    /// TLS policy; absent means auto-generated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsPolicy>,
}

impl VaultService {
    /// Applies spec defaults in place (§3 invariant 5: `len(field)==0` / `field==nil`
    /// tests only; a user-supplied non-empty value is never overwritten). Returns
    /// true iff anything changed, mirroring the original `VaultService.SetDefaults`.
    pub fn apply_defaults(&mut self) -> bool {
        let mut changed = false;
        let name = self.metadata.name.clone().unwrap_or_default();
        let spec = &mut self.spec;
        if spec.nodes == 0 {
            spec.nodes = default_nodes();
            changed = true;
        }
        if spec.base_image.is_empty() {
            spec.base_image = DEFAULT_BASE_IMAGE.to_string();
            changed = true;
        }
        if spec.version.is_empty() {
            spec.version = DEFAULT_VERSION.to_string();
            changed = true;
        }
        if spec.tls.is_none() {
            spec.tls = Some(TlsPolicy {
                static_tls: Some(StaticTls {
                    server_secret: default_vault_server_tls_secret_name(&name),
                    client_secret: default_vault_client_tls_secret_name(&name),
                }),
            });
            changed = true;
        }
        changed
    }

    /// Image reference the spec currently demands (`<baseImage>:<version>`).
    pub fn image(&self) -> String {
        format!("{}:{}", self.spec.base_image, self.spec.version)
    }
}

/// Name of the default (operator-generated) Vault server TLS secret.
pub fn default_vault_server_tls_secret_name(vault_name: &str) -> String {
    format!("{vault_name}-default-vault-server-tls")
}

/// Name of the default (operator-generated) Vault client (CA-only) TLS secret.
pub fn default_vault_client_tls_secret_name(vault_name: &str) -> String {
    format!("{vault_name}-default-vault-client-tls")
}

/// Name of the CA certificate file inside the client TLS secret.
pub const CA_TLS_CERT_NAME: &str = "vault-client-ca.crt";

/// Names of the etcd TLS secrets this operator manages for the backing etcd
/// cluster (peer, server, client), keyed off the VaultService name.
pub fn etcd_peer_tls_secret_name(vault_name: &str) -> String {
    format!("{vault_name}-etcd-peer-tls")
}
pub fn etcd_server_tls_secret_name(vault_name: &str) -> String {
    format!("{vault_name}-etcd-server-tls")
}
pub fn etcd_client_tls_secret_name(vault_name: &str) -> String {
    format!("{vault_name}-etcd-client-tls")
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Default)]
pub enum VaultServicePhase {
    #[default]
    Initial,
    Running,
}

impl fmt::Display for VaultServicePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VaultServicePhase::Initial => write!(f, "Initial"),
            VaultServicePhase::Running => write!(f, "Running"),
        }
    }
}

/// Health classification of the managed Vault replicas, as last observed by
/// the health monitor. At most one pod appears in `active`; the three sets
/// are pairwise disjoint (§3 invariants 1-2).
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct VaultStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<String>,
    #[serde(default)]
    pub standby: Vec<String>,
    #[serde(default)]
    pub sealed: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct VaultServiceStatus {
    #[serde(default)]
    pub phase: VaultServicePhase,
    /// True once at least one probed replica has reported `initialized=true`.
    #[serde(default)]
    pub initialized: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_port: Option<u16>,
    #[serde(default)]
    pub vault_status: VaultStatus,
    /// Pods whose container image matches `spec.baseImage:spec.version`.
    #[serde(default)]
    pub updated_nodes: Vec<String>,
    #[serde(default, rename = "lastUpdated", skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<Time>,
}

/// Minimal, hand-rolled representation of the backing etcd-operator's
/// `EtcdCluster` custom resource. The etcd-operator itself is an external
/// collaborator (out of scope for this crate); this operator only needs to
/// create one CR per VaultService and poll its member status, so it does not
/// vendor a generated client for the whole `etcd.database.coreos.com` group.
#[derive(CustomResource, Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "etcd.database.coreos.com",
    version = "v1beta2",
    kind = "EtcdCluster",
    plural = "etcdclusters",
    derive = "PartialEq",
    status = "EtcdClusterStatus",
    namespaced
)]
pub struct EtcdClusterSpec {
    pub size: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<EtcdTlsPolicy>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct EtcdTlsPolicy {
    pub static_tls: EtcdStaticTls,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct EtcdStaticTls {
    pub member: EtcdMemberSecret,
    pub operator_secret: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct EtcdMemberSecret {
    pub peer_secret: String,
    pub server_secret: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct EtcdClusterStatus {
    #[serde(default)]
    pub members: EtcdMembersStatus,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct EtcdMembersStatus {
    #[serde(default)]
    pub ready: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_service(name: &str) -> VaultService {
        let mut v = VaultService::new(name, VaultServiceSpec::default());
        v.metadata.name = Some(name.to_string());
        v
    }

    #[test]
    fn defaults_populate_empty_fields_once() {
        let mut v = bare_service("v");
        assert!(v.apply_defaults());
        assert_eq!(v.spec.nodes, 1);
        assert_eq!(v.spec.base_image, DEFAULT_BASE_IMAGE);
        assert_eq!(v.spec.version, DEFAULT_VERSION);
        assert!(v.spec.tls.is_some());
        // Second application is a no-op: nothing left to default.
        assert!(!v.apply_defaults());
    }

    #[test]
    fn defaults_never_overwrite_populated_fields() {
        let mut v = bare_service("v");
        v.spec.nodes = 5;
        v.spec.base_image = "my.registry/vault".to_string();
        assert!(v.apply_defaults()); // version/tls still need defaulting
        assert_eq!(v.spec.nodes, 5);
        assert_eq!(v.spec.base_image, "my.registry/vault");
    }

    #[test]
    fn tls_static_secret_names_are_deterministic() {
        assert_eq!(
            default_vault_server_tls_secret_name("v"),
            "v-default-vault-server-tls"
        );
        assert_eq!(
            default_vault_client_tls_secret_name("v"),
            "v-default-vault-client-tls"
        );
    }

    #[test]
    fn image_combines_base_and_version() {
        let mut v = bare_service("v");
        v.apply_defaults();
        assert_eq!(v.image(), format!("{DEFAULT_BASE_IMAGE}:{DEFAULT_VERSION}"));
    }
}
