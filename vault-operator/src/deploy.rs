//! Workload deployer (C6): the fronting Deployment + Service, the backing
//! `EtcdCluster`, and the rolling-upgrade policy.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy, RollingUpdateDeployment};
use k8s_openapi::api::core::v1::{
    Capabilities, ConfigMapVolumeSource, Container, ContainerPort, EnvVar, ExecAction, HTTPGetAction,
    KeyToPath, PodSpec, PodTemplateSpec, Probe, ResourceRequirements, SecretProjection,
    SecurityContext, Service, ServicePort, ServiceSpec, Volume, VolumeMount, VolumeProjection,
    ProjectedVolumeSource,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{
    Api, Client, Resource,
    api::{ObjectMeta, Patch, PatchParams, PostParams},
};
use vault_operator_types::{
    EtcdCluster, EtcdClusterSpec, EtcdMemberSecret, EtcdStaticTls, EtcdTlsPolicy, VaultService,
    etcd_client_tls_secret_name, etcd_peer_tls_secret_name, etcd_server_tls_secret_name,
};

use crate::consts::{ANNOTATION_CREATED_BY, BOUNDED_RETRY_ATTEMPTS, BOUNDED_RETRY_INTERVAL, MANAGER_NAME};
use crate::error::Error;
use crate::hcl;

const CLIENT_PORT: i32 = 8200;
const CLUSTER_PORT: i32 = 8201;
const PROMETHEUS_PORT: i32 = 9102;
const STATSD_PORT: i32 = 9125;
const ETCD_SIZE: u32 = 3;

fn cluster_name(cluster: &VaultService) -> String {
    cluster.metadata.name.clone().unwrap_or_default()
}

fn namespace(cluster: &VaultService) -> String {
    cluster.metadata.namespace.clone().unwrap_or_default()
}

pub fn selector(cluster: &VaultService) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), "vault".to_string()),
        ("vault_cluster".to_string(), cluster_name(cluster)),
    ])
}

fn server_tls_secret(cluster: &VaultService) -> String {
    crate::tls::vault_secret_names(cluster).0
}

fn client_tls_secret(cluster: &VaultService) -> String {
    crate::tls::vault_secret_names(cluster).1
}

fn owner_annotations() -> BTreeMap<String, String> {
    BTreeMap::from([(ANNOTATION_CREATED_BY.to_string(), "vault-operator".to_string())])
}

fn vault_container(cluster: &VaultService) -> Container {
    let name = cluster_name(cluster);
    let ns = namespace(cluster);
    let client_url = format!("https://{name}.{ns}.svc:{CLIENT_PORT}");
    let cluster_url = format!("https://{name}.{ns}.svc:{CLUSTER_PORT}");
    Container {
        name: "vault".to_string(),
        image: Some(cluster.image()),
        command: Some(vec![
            "/bin/vault".to_string(),
            "server".to_string(),
            format!("-config={}", hcl::CONFIG_PATH),
        ]),
        env: Some(vec![
            EnvVar {
                name: "VAULT_API_ADDR".to_string(),
                value: Some(client_url),
                ..Default::default()
            },
            EnvVar {
                name: "VAULT_CLUSTER_ADDR".to_string(),
                value: Some(cluster_url),
                ..Default::default()
            },
        ]),
        ports: Some(vec![
            ContainerPort {
                name: Some("vault-client".to_string()),
                container_port: CLIENT_PORT,
                ..Default::default()
            },
            ContainerPort {
                name: Some("vault-cluster".to_string()),
                container_port: CLUSTER_PORT,
                ..Default::default()
            },
        ]),
        security_context: Some(SecurityContext {
            capabilities: Some(Capabilities {
                add: Some(vec!["IPC_LOCK".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        }),
        liveness_probe: Some(Probe {
            exec: Some(ExecAction {
                command: Some(vec![
                    "curl".to_string(),
                    "-k".to_string(),
                    format!("https://localhost:{CLIENT_PORT}/v1/sys/health"),
                ]),
            }),
            ..Default::default()
        }),
        readiness_probe: Some(Probe {
            http_get: Some(HTTPGetAction {
                path: Some("/v1/sys/health".to_string()),
                port: IntOrString::Int(CLIENT_PORT),
                scheme: Some("HTTPS".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }),
        volume_mounts: Some(vec![
            VolumeMount {
                name: "vault-config".to_string(),
                mount_path: "/run/vault/config".to_string(),
                ..Default::default()
            },
            VolumeMount {
                name: "vault-tls-secret".to_string(),
                mount_path: hcl::TLS_ASSET_DIR.to_string(),
                read_only: Some(true),
                ..Default::default()
            },
        ]),
        resources: cluster.spec.pod.as_ref().map(|p| ResourceRequirements {
            limits: p.limits.as_ref().map(|m| {
                m.iter()
                    .map(|(k, v)| (k.clone(), k8s_openapi::apimachinery::pkg::api::resource::Quantity(v.clone())))
                    .collect()
            }),
            requests: p.requests.as_ref().map(|m| {
                m.iter()
                    .map(|(k, v)| (k.clone(), k8s_openapi::apimachinery::pkg::api::resource::Quantity(v.clone())))
                    .collect()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn metrics_sidecar() -> Container {
    Container {
        name: "statsd-prometheus-sidecar".to_string(),
        image: Some("prom/statsd-exporter:latest".to_string()),
        ports: Some(vec![
            ContainerPort {
                name: Some("statsd".to_string()),
                container_port: STATSD_PORT,
                protocol: Some("UDP".to_string()),
                ..Default::default()
            },
            ContainerPort {
                name: Some("prometheus".to_string()),
                container_port: PROMETHEUS_PORT,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            },
        ]),
        ..Default::default()
    }
}

fn tls_projected_volume(cluster: &VaultService) -> Volume {
    let sources = vec![
        VolumeProjection {
            secret: Some(SecretProjection {
                name: etcd_client_tls_secret_name(&cluster_name(cluster)),
                items: Some(vec![
                    KeyToPath { key: "ca.crt".to_string(), path: "etcd-client-ca.crt".to_string(), ..Default::default() },
                    KeyToPath { key: "client.crt".to_string(), path: "etcd-client.crt".to_string(), ..Default::default() },
                    KeyToPath { key: "client.key".to_string(), path: "etcd-client.key".to_string(), ..Default::default() },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        },
        VolumeProjection {
            secret: Some(SecretProjection {
                name: server_tls_secret(cluster),
                items: Some(vec![
                    KeyToPath { key: "server.crt".to_string(), path: "server.crt".to_string(), ..Default::default() },
                    KeyToPath { key: "server.key".to_string(), path: "server.key".to_string(), ..Default::default() },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        },
        VolumeProjection {
            secret: Some(SecretProjection {
                name: client_tls_secret(cluster),
                items: Some(vec![KeyToPath {
                    key: vault_operator_types::CA_TLS_CERT_NAME.to_string(),
                    path: vault_operator_types::CA_TLS_CERT_NAME.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        },
    ];
    Volume {
        name: "vault-tls-secret".to_string(),
        projected: Some(ProjectedVolumeSource {
            sources: Some(sources),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn pod_template(cluster: &VaultService) -> PodTemplateSpec {
    let labels = selector(cluster);
    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(labels),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            containers: vec![vault_container(cluster), metrics_sidecar()],
            volumes: Some(vec![
                Volume {
                    name: "vault-config".to_string(),
                    config_map: Some(ConfigMapVolumeSource {
                        name: hcl::config_map_name(cluster),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                tls_projected_volume(cluster),
            ]),
            ..Default::default()
        }),
    }
}

fn default_rolling_update() -> RollingUpdateDeployment {
    RollingUpdateDeployment {
        max_unavailable: Some(IntOrString::Int(1)),
        max_surge: Some(IntOrString::Int(1)),
    }
}

fn upgrade_rolling_update(nodes: u32) -> RollingUpdateDeployment {
    RollingUpdateDeployment {
        max_unavailable: Some(IntOrString::Int((nodes.saturating_sub(1)) as i32)),
        max_surge: Some(IntOrString::Int(1)),
    }
}

fn deployment_resource(cluster: &VaultService) -> Deployment {
    let name = cluster_name(cluster);
    let ns = namespace(cluster);
    let labels = selector(cluster);
    Deployment {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(ns),
            labels: Some(labels.clone()),
            owner_references: Some(vec![cluster.controller_owner_ref(&()).unwrap()]),
            annotations: Some(owner_annotations()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(cluster.spec.nodes as i32),
            selector: k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector {
                match_labels: Some(labels),
                ..Default::default()
            },
            template: pod_template(cluster),
            strategy: Some(DeploymentStrategy {
                type_: Some("RollingUpdate".to_string()),
                rolling_update: Some(default_rolling_update()),
            }),
            ..Default::default()
        }),
        status: None,
    }
}

fn service_resource(cluster: &VaultService) -> Service {
    let name = cluster_name(cluster);
    let ns = namespace(cluster);
    let labels = selector(cluster);
    Service {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(ns),
            labels: Some(labels.clone()),
            owner_references: Some(vec![cluster.controller_owner_ref(&()).unwrap()]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(labels),
            ports: Some(vec![
                ServicePort {
                    name: Some("vault-client".to_string()),
                    port: CLIENT_PORT,
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                },
                ServicePort {
                    name: Some("vault-cluster".to_string()),
                    port: CLUSTER_PORT,
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                },
                ServicePort {
                    name: Some("prometheus".to_string()),
                    port: PROMETHEUS_PORT,
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        }),
        status: None,
    }
}

fn etcd_cluster_resource(cluster: &VaultService) -> EtcdCluster {
    let name = cluster_name(cluster);
    let ns = namespace(cluster);
    let etcd_name = format!("{name}-etcd");
    EtcdCluster {
        metadata: ObjectMeta {
            name: Some(etcd_name),
            namespace: Some(ns),
            owner_references: Some(vec![cluster.controller_owner_ref(&()).unwrap()]),
            ..Default::default()
        },
        spec: EtcdClusterSpec {
            size: ETCD_SIZE,
            tls: Some(EtcdTlsPolicy {
                static_tls: EtcdStaticTls {
                    member: EtcdMemberSecret {
                        peer_secret: etcd_peer_tls_secret_name(&name),
                        server_secret: etcd_server_tls_secret_name(&name),
                    },
                    operator_secret: etcd_client_tls_secret_name(&name),
                },
            }),
        },
        status: None,
    }
}

/// Creates the Deployment + Service for `cluster`; "already exists" is success.
pub async fn deploy(client: Client, cluster: &VaultService) -> Result<(), Error> {
    let ns = namespace(cluster);
    let deployments: Api<Deployment> = Api::namespaced(client.clone(), &ns);
    match deployments.create(&PostParams::default(), &deployment_resource(cluster)).await {
        Ok(_) => {}
        Err(kube::Error::Api(ae)) if ae.code == 409 => {}
        Err(e) => return Err(e.into()),
    }
    let services: Api<Service> = Api::namespaced(client, &ns);
    match services.create(&PostParams::default(), &service_resource(cluster)).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Cascade-deletes the Deployment and Service. Tolerates absence.
pub async fn destroy(client: Client, cluster: &VaultService) -> Result<(), Error> {
    let ns = namespace(cluster);
    let name = cluster_name(cluster);
    let deployments: Api<Deployment> = Api::namespaced(client.clone(), &ns);
    match deployments.delete(&name, &Default::default()).await {
        Ok(_) => {}
        Err(kube::Error::Api(ae)) if ae.code == 404 => {}
        Err(e) => return Err(e.into()),
    }
    let services: Api<Service> = Api::namespaced(client, &ns);
    match services.delete(&name, &Default::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Fetches the managed Deployment, if it exists.
pub async fn get_deployment(client: Client, cluster: &VaultService) -> Result<Option<Deployment>, Error> {
    let ns = namespace(cluster);
    let name = cluster_name(cluster);
    let api: Api<Deployment> = Api::namespaced(client, &ns);
    match api.get(&name).await {
        Ok(d) => Ok(Some(d)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Patches `spec.replicas` to `spec.nodes` if they differ.
pub async fn resize(client: Client, cluster: &VaultService, current: &Deployment) -> Result<(), Error> {
    let desired = cluster.spec.nodes as i32;
    let actual = current.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
    if actual == desired {
        return Ok(());
    }
    let ns = namespace(cluster);
    let name = cluster_name(cluster);
    let api: Api<Deployment> = Api::namespaced(client, &ns);
    let patch = serde_json::json!({ "spec": { "replicas": desired } });
    api.patch(&name, &PatchParams::apply(MANAGER_NAME), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Whether `current`'s container image already matches the spec's desired image.
pub fn image_matches(current: &Deployment, cluster: &VaultService) -> bool {
    current
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .and_then(|p| p.containers.iter().find(|c| c.name == "vault"))
        .and_then(|c| c.image.as_ref())
        .is_some_and(|image| *image == cluster.image())
}

/// Tightens the rolling-update bound to `nodes-1` and patches the container
/// image to the desired version (§4.5 `upgradeDeployment`).
pub async fn upgrade_deployment(client: Client, cluster: &VaultService) -> Result<(), Error> {
    let ns = namespace(cluster);
    let name = cluster_name(cluster);
    let api: Api<Deployment> = Api::namespaced(client, &ns);
    let rolling = upgrade_rolling_update(cluster.spec.nodes);
    let patch = serde_json::json!({
        "spec": {
            "strategy": {
                "type": "RollingUpdate",
                "rollingUpdate": {
                    "maxUnavailable": rolling.max_unavailable,
                    "maxSurge": rolling.max_surge,
                }
            },
            "template": {
                "spec": {
                    "containers": [
                        { "name": "vault", "image": cluster.image() }
                    ]
                }
            }
        }
    });
    api.patch(&name, &PatchParams::apply(MANAGER_NAME), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Creates the sibling `EtcdCluster`. "already exists" is success.
pub async fn ensure_etcd_cluster(client: Client, cluster: &VaultService) -> Result<(), Error> {
    let ns = namespace(cluster);
    let api: Api<EtcdCluster> = Api::namespaced(client, &ns);
    match api.create(&PostParams::default(), &etcd_cluster_resource(cluster)).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Polls the backing `EtcdCluster` until `status.members.ready >= size`, with
/// bounded retry (10 attempts x 10s) rather than unbounded cancellation-aware
/// waiting (§5: a known coarseness, acceptable given leader-election death
/// terminates the process).
pub async fn wait_for_etcd_ready(client: Client, cluster: &VaultService) -> Result<(), Error> {
    let ns = namespace(cluster);
    let etcd_name = format!("{}-etcd", cluster_name(cluster));
    let api: Api<EtcdCluster> = Api::namespaced(client, &ns);
    for attempt in 0..BOUNDED_RETRY_ATTEMPTS {
        match api.get(&etcd_name).await {
            Ok(etcd) => {
                let ready = etcd
                    .status
                    .map(|s| s.members.ready.len() as u32)
                    .unwrap_or(0);
                if ready >= ETCD_SIZE {
                    return Ok(());
                }
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => return Err(e.into()),
        }
        if attempt + 1 < BOUNDED_RETRY_ATTEMPTS {
            tokio::time::sleep(BOUNDED_RETRY_INTERVAL).await;
        }
    }
    Err(Error::EtcdNotReady {
        attempts: BOUNDED_RETRY_ATTEMPTS,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use vault_operator_types::VaultServiceSpec;

    fn cluster(nodes: u32) -> VaultService {
        let mut v = VaultService::new(
            "v",
            VaultServiceSpec {
                nodes,
                base_image: "quay.io/coreos/vault".to_string(),
                version: "0.11.1-0".to_string(),
                ..Default::default()
            },
        );
        v.metadata.name = Some("v".to_string());
        v.metadata.namespace = Some("ns".to_string());
        v
    }

    #[test]
    fn deployment_replicas_matches_spec_nodes() {
        let c = cluster(3);
        let d = deployment_resource(&c);
        assert_eq!(d.spec.unwrap().replicas, Some(3));
    }

    #[test]
    fn default_rolling_update_allows_single_unavailable() {
        let rolling = default_rolling_update();
        assert_eq!(rolling.max_unavailable, Some(IntOrString::Int(1)));
    }

    #[test]
    fn upgrade_rolling_update_bounds_unavailable_to_nodes_minus_one() {
        let rolling = upgrade_rolling_update(3);
        assert_eq!(rolling.max_unavailable, Some(IntOrString::Int(2)));
    }

    #[test]
    fn service_exposes_client_cluster_and_prometheus_ports() {
        let c = cluster(1);
        let svc = service_resource(&c);
        let ports: Vec<i32> = svc
            .spec
            .unwrap()
            .ports
            .unwrap()
            .into_iter()
            .map(|p| p.port)
            .collect();
        assert_eq!(ports, vec![CLIENT_PORT, CLUSTER_PORT, PROMETHEUS_PORT]);
    }

    #[test]
    fn image_matches_compares_vault_container_only() {
        let c = cluster(1);
        let d = deployment_resource(&c);
        assert!(image_matches(&d, &c));
    }
}
