//! Config composer (C5): renders the Vault HCL document and persists it as a
//! ConfigMap. Composition is pure string concatenation, mirroring the
//! original `vaultutil.NewConfigWithEtcd` approach rather than an HCL AST
//! builder — the operator never needs to parse the result, only append to it.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::{
    Api, Client, Resource,
    api::{ObjectMeta, PostParams},
};
use vault_operator_types::VaultService;

use crate::consts::ANNOTATION_CREATED_BY;
use crate::error::Error;

/// Directory mounted into the Vault container holding all TLS assets (§6).
pub const TLS_ASSET_DIR: &str = "/run/vault/tls";
/// Path to the rendered Vault config inside the container (§6).
pub const CONFIG_PATH: &str = "/run/vault/config/vault.hcl";
/// Key under which the rendered document is stored in its ConfigMap.
pub const CONFIG_MAP_KEY: &str = "vault.hcl";

fn etcd_client_url(cluster_name: &str) -> String {
    format!("https://{cluster_name}-etcd-client:2379")
}

/// Renders the full HCL document: optional base payload, then the fixed
/// telemetry preamble, listener stanza, and etcd storage stanza (§4.4).
pub fn compose(cluster_name: &str, base_payload: Option<&str>) -> String {
    let mut doc = String::new();
    if let Some(base) = base_payload {
        doc.push_str(base);
        doc.push('\n');
    }
    doc.push_str(
        "ui = true\n\n\
         telemetry {\n\
         \u{20}\u{20}statsd_address = \"localhost:9125\"\n\
         }\n\n",
    );
    doc.push_str(&format!(
        "listener \"tcp\" {{\n\
         \u{20}\u{20}address = \"0.0.0.0:8200\"\n\
         \u{20}\u{20}cluster_address = \"0.0.0.0:8201\"\n\
         \u{20}\u{20}tls_cert_file = \"{dir}/server.crt\"\n\
         \u{20}\u{20}tls_key_file = \"{dir}/server.key\"\n\
         }}\n\n",
        dir = TLS_ASSET_DIR,
    ));
    doc.push_str(&format!(
        "storage \"etcd\" {{\n\
         \u{20}\u{20}address = \"{addr}\"\n\
         \u{20}\u{20}etcd_api = \"v3\"\n\
         \u{20}\u{20}ha_enabled = \"true\"\n\
         \u{20}\u{20}sync = \"false\"\n\
         \u{20}\u{20}tls_ca_file = \"{dir}/etcd-client-ca.crt\"\n\
         \u{20}\u{20}tls_cert_file = \"{dir}/etcd-client.crt\"\n\
         \u{20}\u{20}tls_key_file = \"{dir}/etcd-client.key\"\n\
         }}\n",
        addr = etcd_client_url(cluster_name),
        dir = TLS_ASSET_DIR,
    ));
    doc
}

/// Name of the ConfigMap the rendered document is persisted under.
pub fn config_map_name(cluster: &VaultService) -> String {
    let cluster_name = cluster.metadata.name.clone().unwrap_or_default();
    match cluster.spec.config_map_name.as_deref() {
        Some(base) if !base.is_empty() => format!("{base}-copy"),
        _ => format!("{cluster_name}-copy"),
    }
}

async fn read_base_payload(
    client: &Client,
    cluster: &VaultService,
    namespace: &str,
) -> Result<Option<String>, Error> {
    let Some(base_name) = cluster.spec.config_map_name.as_deref() else {
        return Ok(None);
    };
    let api: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
    match api.get(base_name).await {
        Ok(cm) => Ok(cm.data.and_then(|d| d.get(CONFIG_MAP_KEY).cloned())),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Renders and persists the composed config map for `cluster`. Re-composition
/// on every reconcile is idempotent; "already exists" is treated as success
/// (the document is not diffed/patched beyond creation, per §9).
pub async fn ensure(client: Client, cluster: &VaultService) -> Result<(), Error> {
    let name = cluster.metadata.name.clone().unwrap_or_default();
    let namespace = cluster.metadata.namespace.clone().unwrap_or_default();
    let base_payload = read_base_payload(&client, cluster, &namespace).await?;
    let document = compose(&name, base_payload.as_deref());

    let cm = ConfigMap {
        metadata: ObjectMeta {
            name: Some(config_map_name(cluster)),
            namespace: Some(namespace.clone()),
            owner_references: Some(vec![cluster.controller_owner_ref(&()).unwrap()]),
            annotations: Some(BTreeMap::from([(
                ANNOTATION_CREATED_BY.to_string(),
                "vault-operator".to_string(),
            )])),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            CONFIG_MAP_KEY.to_string(),
            document,
        )])),
        ..Default::default()
    };

    let api: Api<ConfigMap> = Api::namespaced(client, &namespace);
    match api.create(&PostParams::default(), &cm).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composed_document_has_exactly_one_listener_and_storage_stanza() {
        let doc = compose("v", None);
        assert_eq!(doc.matches("listener \"tcp\"").count(), 1);
        assert_eq!(doc.matches("storage \"etcd\"").count(), 1);
        assert!(doc.contains("https://v-etcd-client:2379"));
    }

    #[test]
    fn base_payload_is_prepended_verbatim() {
        let doc = compose("v", Some("# user config\nui = false\n"));
        assert!(doc.starts_with("# user config"));
        assert_eq!(doc.matches("listener \"tcp\"").count(), 1);
    }

    #[test]
    fn config_map_name_falls_back_to_cluster_name() {
        let mut v = VaultService::new("v", Default::default());
        v.metadata.name = Some("v".to_string());
        assert_eq!(config_map_name(&v), "v-copy");
        v.spec.config_map_name = Some("base".to_string());
        assert_eq!(config_map_name(&v), "base-copy");
    }
}
