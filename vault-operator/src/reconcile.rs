//! Reconciler (C8): the state machine driven by every dequeued work item.
//!
//! Orchestrates C4-C7 in the order §4.6 lays out, owns the map of per-cluster
//! monitor handles, and is the only component permitted to decide between
//! requeue (`addRateLimited`) and give-up (`forget`) — everything below it
//! just returns errors.

use std::collections::HashMap;

use kube::Client;
use tokio::sync::Mutex;

use crate::deploy;
use crate::error::Error;
use crate::hcl;
use crate::monitor::{self, MonitorHandle};
use crate::store::{ObjectKey, ResourceStore};
use crate::tls;

#[cfg(feature = "metrics")]
use crate::metrics::ControllerMetrics;
#[cfg(feature = "metrics")]
use std::sync::Arc;

/// Per-cluster monitor handles, owned exclusively by the reconcile worker
/// (§5 "shared-resource policy") — nothing else is allowed to touch this map.
pub struct MonitorRegistry {
    handles: Mutex<HashMap<ObjectKey, MonitorHandle>>,
}

impl MonitorRegistry {
    pub fn new() -> Self {
        MonitorRegistry {
            handles: Mutex::new(HashMap::new()),
        }
    }

    async fn spawn_if_absent(
        &self,
        client: Client,
        store: ResourceStore,
        key: &ObjectKey,
        #[cfg(feature = "metrics")] metrics: Arc<ControllerMetrics>,
    ) {
        let mut handles = self.handles.lock().await;
        if !handles.contains_key(key) {
            handles.insert(
                key.clone(),
                monitor::spawn(
                    client,
                    store,
                    key.clone(),
                    #[cfg(feature = "metrics")]
                    metrics,
                ),
            );
        }
    }

    async fn remove_and_cancel(&self, key: &ObjectKey) {
        if let Some(handle) = self.handles.lock().await.remove(key) {
            handle.cancel();
        }
    }
}

impl Default for MonitorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Persists `instance` with its defaults applied (§4.6 step 2). The subsequent
/// watch `Apply` event re-enqueues the key, so this function never continues
/// on to the rest of the reconcile on the same pass.
async fn persist_defaults(client: &Client, namespace: &str, instance: &mut vault_operator_types::VaultService) -> Result<(), Error> {
    let api: kube::Api<vault_operator_types::VaultService> = kube::Api::namespaced(client.clone(), namespace);
    let name = instance.metadata.name.clone().unwrap_or_default();
    let patched = api
        .replace(&name, &Default::default(), instance)
        .await?;
    *instance = patched;
    Ok(())
}

/// Evaluates whether the active replica should step down (§4.6 step 8,
/// preserved verbatim per the source ambiguity noted in the design notes:
/// both `standby == updated` and `standby ∪ sealed == updated` are checked,
/// even though the former implies the latter whenever `sealed` is empty).
pub fn should_step_down(
    active: &Option<String>,
    standby: &[String],
    sealed: &[String],
    updated: &[String],
) -> bool {
    use std::collections::BTreeSet;
    if active.is_none() {
        return false;
    }
    let standby_set: BTreeSet<&String> = standby.iter().collect();
    let updated_set: BTreeSet<&String> = updated.iter().collect();
    if standby_set != updated_set {
        return false;
    }
    let standby_or_sealed: BTreeSet<&String> = standby.iter().chain(sealed.iter()).collect();
    standby_or_sealed == updated_set
}

/// One pass of the reconcile state machine for `key`. Returns `Ok(())` on
/// success (the caller should `forget` the key's failure history);
/// `Err(_)` signals the caller should `addRateLimited` the key again.
pub async fn reconcile(
    client: Client,
    store: &ResourceStore,
    monitors: &MonitorRegistry,
    key: ObjectKey,
    #[cfg(feature = "metrics")] metrics: Arc<ControllerMetrics>,
) -> Result<(), Error> {
    #[cfg(feature = "metrics")]
    metrics
        .reconcile_total
        .with_label_values(&[&key.to_string()])
        .inc();

    let Some(instance) = store.get(&key).await else {
        tracing::info!(cluster = %key, "reconcile: object no longer in store, assuming deleted");
        monitors.remove_and_cancel(&key).await;
        return Ok(());
    };

    let mut instance = (*instance).clone();

    if instance.apply_defaults() {
        persist_defaults(&client, &key.namespace, &mut instance).await?;
        tracing::info!(cluster = %key, "reconcile: persisted defaults, awaiting re-enqueue");
        return Ok(());
    }

    if instance.status.as_ref().map(|s| s.phase).unwrap_or_default() == vault_operator_types::VaultServicePhase::Initial {
        tls::ensure_etcd_tls(client.clone(), &instance).await?;
        deploy::ensure_etcd_cluster(client.clone(), &instance).await?;
        deploy::wait_for_etcd_ready(client.clone(), &instance).await?;
    }

    tls::ensure_vault_tls(client.clone(), &instance).await?;
    hcl::ensure(client.clone(), &instance).await?;
    deploy::deploy(client.clone(), &instance).await?;

    if let Some(current) = deploy::get_deployment(client.clone(), &instance).await? {
        deploy::resize(client.clone(), &instance, &current).await?;
        sync_upgrade(client.clone(), &instance, &current).await?;
    }

    monitors
        .spawn_if_absent(
            client.clone(),
            store.clone(),
            &key,
            #[cfg(feature = "metrics")]
            metrics,
        )
        .await;

    Ok(())
}

async fn sync_upgrade(
    client: Client,
    instance: &vault_operator_types::VaultService,
    current: &k8s_openapi::api::apps::v1::Deployment,
) -> Result<(), Error> {
    if !deploy::image_matches(current, instance) {
        deploy::upgrade_deployment(client, instance).await?;
        return Ok(());
    }

    let status = instance.status.as_ref();
    let active = status.map(|s| s.vault_status.active.clone()).unwrap_or(None);
    let standby = status.map(|s| s.vault_status.standby.clone()).unwrap_or_default();
    let sealed = status.map(|s| s.vault_status.sealed.clone()).unwrap_or_default();
    let updated = status.map(|s| s.updated_nodes.clone()).unwrap_or_default();

    if should_step_down(&active, &standby, &sealed, &updated) {
        let Some(active_pod) = active else {
            return Ok(());
        };
        let namespace = instance.metadata.namespace.clone().unwrap_or_default();
        let pods: kube::Api<k8s_openapi::api::core::v1::Pod> = kube::Api::namespaced(client, &namespace);
        match pods.delete(&active_pod, &Default::default()).await {
            Ok(_) => {}
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn step_down_requires_active_present() {
        assert!(!should_step_down(&None, &strings(&["a"]), &[], &strings(&["a"])));
    }

    #[test]
    fn step_down_true_when_all_non_active_are_updated_standby() {
        let active = Some("v-0".to_string());
        let standby = strings(&["v-1", "v-2"]);
        let sealed = strings(&[]);
        let updated = strings(&["v-1", "v-2"]);
        assert!(should_step_down(&active, &standby, &sealed, &updated));
    }

    #[test]
    fn step_down_false_when_a_sealed_pod_is_not_yet_updated() {
        let active = Some("v-0".to_string());
        let standby = strings(&["v-1"]);
        let sealed = strings(&["v-2"]);
        // standby != updated ("v-2" missing from standby), so it's already false
        // on the first check even though standby ∪ sealed == updated.
        let updated = strings(&["v-1", "v-2"]);
        assert!(!should_step_down(&active, &standby, &sealed, &updated));
    }

    #[test]
    fn step_down_false_when_an_old_version_standby_remains() {
        let active = Some("v-0".to_string());
        let standby = strings(&["v-1", "v-2"]);
        let sealed = strings(&[]);
        // v-2 is standby but not in updated: old-version standby blocks step-down.
        let updated = strings(&["v-1"]);
        assert!(!should_step_down(&active, &standby, &sealed, &updated));
    }
}
