//! Per-cluster health monitor (C7): classifies replicas by probing
//! `/v1/sys/health` over TLS and republishes `status.vaultStatus`.

use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::{Api, Client, ResourceExt, api::ListParams};
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use vault_operator_types::{VaultService, VaultServicePhase, VaultServiceStatus, VaultStatus};

use crate::consts::MONITOR_TICK;
use crate::error::Error;
use crate::patch::patch_status;
use crate::store::{ObjectKey, ResourceStore};

#[cfg(feature = "metrics")]
use crate::metrics::ControllerMetrics;
#[cfg(feature = "metrics")]
use std::sync::Arc;

const CLIENT_PORT: u16 = 8200;

/// Cancellation + join handle for a spawned per-cluster monitor task. Owned
/// by the reconciler in a map keyed by cluster name (§4.7, §9).
pub struct MonitorHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl MonitorHandle {
    /// Requests cooperative shutdown; does not wait for the task to exit.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

#[derive(Deserialize, Debug, Clone, Copy, Default)]
struct VaultHealth {
    #[serde(default)]
    initialized: bool,
    #[serde(default)]
    sealed: bool,
    #[serde(default)]
    standby: bool,
}

struct ProbedPod {
    name: String,
    image_matches: bool,
    health: Option<VaultHealth>,
}

/// Pure classification: folds per-pod probe results into the status fields
/// this monitor owns. Returns `None` when not a single probe succeeded, so
/// the caller can honor "stale data is preferred to falsely clearing live
/// values" (§4.7 step 4) by skipping the write entirely.
fn classify(pods: &[ProbedPod]) -> Option<(VaultStatus, bool, Vec<String>)> {
    if pods.iter().all(|p| p.health.is_none()) {
        return None;
    }
    let mut status = VaultStatus::default();
    let mut initialized = false;
    let mut updated = Vec::new();

    for pod in pods {
        if pod.image_matches {
            updated.push(pod.name.clone());
        }
        let Some(health) = pod.health else {
            continue;
        };
        if health.initialized {
            initialized = true;
        }
        if health.sealed {
            status.sealed.push(pod.name.clone());
        } else if health.standby {
            status.standby.push(pod.name.clone());
        } else if health.initialized {
            status.active = Some(pod.name.clone());
        }
    }
    Some((status, initialized, updated))
}

fn statuses_equal(a: &VaultServiceStatus, b: &VaultServiceStatus) -> bool {
    a.vault_status == b.vault_status && a.initialized == b.initialized && a.updated_nodes == b.updated_nodes
}

fn pod_dns_name(pod: &Pod, namespace: &str) -> Option<String> {
    let ip = pod.status.as_ref()?.pod_ip.as_ref()?;
    Some(format!("{}.{namespace}.pod", ip.replace('.', "-")))
}

fn running_and_not_terminating(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_none()
        && pod
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .is_some_and(|phase| phase == "Running")
}

fn container_image_matches(pod: &Pod, desired_image: &str) -> bool {
    pod.spec
        .as_ref()
        .into_iter()
        .flat_map(|s| s.containers.iter())
        .find(|c| c.name == "vault")
        .and_then(|c| c.image.as_deref())
        .is_some_and(|image| image == desired_image)
}

async fn load_ca_cert(client: &Client, namespace: &str, secret_name: &str) -> Result<reqwest::Certificate, Error> {
    let api: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let secret = api.get(secret_name).await?;
    let pem = secret
        .data
        .as_ref()
        .and_then(|d| d.get(vault_operator_types::CA_TLS_CERT_NAME))
        .map(|b| b.0.clone())
        .unwrap_or_default();
    reqwest::Certificate::from_pem(&pem).map_err(Error::from)
}

fn build_probe_client(ca_cert: reqwest::Certificate) -> Result<reqwest::Client, Error> {
    reqwest::Client::builder()
        .add_root_certificate(ca_cert)
        .timeout(std::time::Duration::from_secs(5))
        .build()
        .map_err(Error::from)
}

async fn probe_pod(http: &reqwest::Client, pod_host: &str) -> Option<VaultHealth> {
    let url = format!("https://{pod_host}:{CLIENT_PORT}/v1/sys/health");
    let response = http.get(&url).send().await.ok()?;
    response.json::<VaultHealth>().await.ok()
}

async fn run_tick(
    client: &Client,
    namespace: &str,
    cluster: &VaultService,
    http: &reqwest::Client,
) -> Result<Vec<ProbedPod>, Error> {
    let selector = crate::deploy::selector(cluster);
    let label_selector = selector
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",");
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let list = pods
        .list(&ListParams::default().labels(&label_selector))
        .await?;

    let desired_image = cluster.image();
    let mut results = Vec::new();
    for pod in list.items {
        if !running_and_not_terminating(&pod) {
            continue;
        }
        let name = pod.name_any();
        let image_matches = container_image_matches(&pod, &desired_image);
        let health = match pod_dns_name(&pod, namespace) {
            Some(host) => probe_pod(http, &host).await,
            None => None,
        };
        results.push(ProbedPod {
            name,
            image_matches,
            health,
        });
    }
    Ok(results)
}

async fn write_initial_status(client: Client, instance: &VaultService) -> Result<(), Error> {
    let service_name = instance.name_any();
    let client_port = CLIENT_PORT;
    patch_status::<VaultServiceStatus, VaultService>(client, instance, |status| {
        status.phase = VaultServicePhase::Running;
        status.service_name = Some(service_name);
        status.client_port = Some(client_port);
    })
    .await
    .map_err(Error::from)?;
    Ok(())
}

/// Spawns the per-cluster monitor loop. Writes an initial status before
/// returning control to the caller is intentionally *not* done here (it
/// happens as the task's first action) — the reconciler only needs the
/// handle to hold onto for later cancellation.
pub fn spawn(
    client: Client,
    store: ResourceStore,
    key: ObjectKey,
    #[cfg(feature = "metrics")] metrics: Arc<ControllerMetrics>,
) -> MonitorHandle {
    let cancel = CancellationToken::new();
    let task_cancel = cancel.clone();
    let handle = tokio::spawn(async move {
        run(
            client,
            store,
            key,
            task_cancel,
            #[cfg(feature = "metrics")]
            metrics,
        )
        .await;
    });
    MonitorHandle { cancel, handle }
}

async fn run(
    client: Client,
    store: ResourceStore,
    key: ObjectKey,
    cancel: CancellationToken,
    #[cfg(feature = "metrics")] metrics: Arc<ControllerMetrics>,
) {
    let Some(instance) = store.get(&key).await else {
        return;
    };
    if let Err(error) = write_initial_status(client.clone(), &instance).await {
        tracing::warn!(cluster = %key, %error, "failed to write initial monitor status");
    }

    let client_secret_name = instance
        .spec
        .tls
        .as_ref()
        .and_then(|t| t.static_tls.as_ref())
        .map(|s| s.client_secret.clone())
        .unwrap_or_else(|| vault_operator_types::default_vault_client_tls_secret_name(&key.name));

    let http = loop {
        if cancel.is_cancelled() {
            return;
        }
        match load_ca_cert(&client, &key.namespace, &client_secret_name)
            .await
            .and_then(build_probe_client)
        {
            Ok(http) => break http,
            Err(error) => {
                tracing::warn!(cluster = %key, %error, "monitor could not build probe client yet, retrying");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(MONITOR_TICK) => {}
                }
            }
        }
    };

    let mut last_status: Option<VaultServiceStatus> = None;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(MONITOR_TICK) => {}
        }

        let Some(current) = store.get(&key).await else {
            return;
        };
        let results = match run_tick(&client, &key.namespace, &current, &http).await {
            Ok(results) => results,
            Err(error) => {
                tracing::warn!(cluster = %key, %error, "health probe tick failed, keeping previous status");
                continue;
            }
        };

        let Some((vault_status, initialized, updated_nodes)) = classify(&results) else {
            #[cfg(feature = "metrics")]
            metrics
                .monitor_probe_errors_total
                .with_label_values(&[&key.to_string()])
                .inc();
            continue;
        };

        let candidate = VaultServiceStatus {
            vault_status: vault_status.clone(),
            initialized,
            updated_nodes: updated_nodes.clone(),
            ..current.status.clone().unwrap_or_default()
        };
        if last_status.as_ref().is_some_and(|prev| statuses_equal(prev, &candidate)) {
            continue;
        }

        match patch_status::<VaultServiceStatus, VaultService>(client.clone(), &current, |status| {
            status.vault_status = vault_status.clone();
            status.initialized = initialized;
            status.updated_nodes = updated_nodes.clone();
        })
        .await
        {
            Ok(patched) => {
                last_status = patched.status.clone();
            }
            Err(error) => {
                tracing::warn!(cluster = %key, %error, "failed to persist monitor status");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod(name: &str, image_matches: bool, health: Option<VaultHealth>) -> ProbedPod {
        ProbedPod {
            name: name.to_string(),
            image_matches,
            health,
        }
    }

    #[test]
    fn all_probes_failing_leaves_status_unchanged() {
        let pods = vec![pod("v-0", true, None), pod("v-1", true, None)];
        assert!(classify(&pods).is_none());
    }

    #[test]
    fn active_standby_sealed_are_disjoint() {
        let pods = vec![
            pod(
                "v-0",
                true,
                Some(VaultHealth {
                    initialized: true,
                    sealed: false,
                    standby: false,
                }),
            ),
            pod(
                "v-1",
                true,
                Some(VaultHealth {
                    initialized: true,
                    sealed: false,
                    standby: true,
                }),
            ),
            pod(
                "v-2",
                false,
                Some(VaultHealth {
                    initialized: false,
                    sealed: true,
                    standby: false,
                }),
            ),
        ];
        let (status, initialized, updated) = classify(&pods).unwrap();
        assert_eq!(status.active.as_deref(), Some("v-0"));
        assert_eq!(status.standby, vec!["v-1".to_string()]);
        assert_eq!(status.sealed, vec!["v-2".to_string()]);
        assert!(initialized);
        assert_eq!(updated, vec!["v-0".to_string(), "v-1".to_string()]);
    }

    #[test]
    fn partial_probe_failure_still_classifies_successful_ones() {
        let pods = vec![
            pod(
                "v-0",
                true,
                Some(VaultHealth {
                    initialized: true,
                    sealed: true,
                    standby: false,
                }),
            ),
            pod("v-1", true, None),
        ];
        let (status, _, updated) = classify(&pods).unwrap();
        assert_eq!(status.sealed, vec!["v-0".to_string()]);
        assert!(status.active.is_none());
        assert_eq!(updated, vec!["v-0".to_string(), "v-1".to_string()]);
    }
}
