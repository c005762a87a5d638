//! Process bootstrap: environment checks, in-cluster client, leader
//! election, and the single reconcile worker loop.

mod colors;
mod consts;
mod deploy;
mod error;
mod hcl;
#[cfg(feature = "metrics")]
mod metrics;
mod monitor;
mod leader;
mod patch;
mod queue;
mod readyz;
mod reconcile;
mod store;
mod tls;

use kube::{Api, Client};
use owo_colors::OwoColorize;
use tokio_util::sync::CancellationToken;
use vault_operator_types::VaultService;

use crate::colors::FG1;
use crate::error::Error;
use crate::queue::WorkQueue;
use crate::reconcile::MonitorRegistry;
use crate::store::{ObjectKey, ResourceStore};

#[cfg(feature = "metrics")]
use std::sync::Arc;

fn required_env(name: &'static str) -> Result<String, Error> {
    std::env::var(name).map_err(|_| Error::MissingEnv(name))
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn run_worker(
    client: Client,
    store: ResourceStore,
    queue: std::sync::Arc<WorkQueue<ObjectKey>>,
    monitors: std::sync::Arc<MonitorRegistry>,
    #[cfg(feature = "metrics")] metrics: Arc<metrics::ControllerMetrics>,
) {
    while let Some(key) = queue.get().await {
        let result = reconcile::reconcile(
            client.clone(),
            &store,
            &monitors,
            key.clone(),
            #[cfg(feature = "metrics")]
            metrics.clone(),
        )
        .await;
        queue.done(&key).await;
        match result {
            Ok(()) => queue.forget(&key).await,
            Err(error) => {
                #[cfg(feature = "metrics")]
                metrics
                    .reconcile_errors_total
                    .with_label_values(&[&key.to_string()])
                    .inc();
                tracing::warn!(cluster = %key, %error, "reconcile Vault failed, will retry");
                queue.add_rate_limited(key).await;
            }
        }
    }
}

async fn run_controller(client: Client) {
    let namespace = required_env("MY_POD_NAMESPACE").unwrap_or_else(|_| "default".to_string());
    let root_cancel = CancellationToken::new();

    let api: Api<VaultService> = Api::namespaced(client.clone(), &namespace);
    let (store, store_handle) = ResourceStore::run(api, root_cancel.clone());

    let queue: std::sync::Arc<WorkQueue<ObjectKey>> = std::sync::Arc::new(WorkQueue::new());
    let monitors = std::sync::Arc::new(MonitorRegistry::new());

    #[cfg(feature = "metrics")]
    let metrics = std::sync::Arc::new(metrics::ControllerMetrics::new());

    let readyz_cancel = root_cancel.clone();
    let readyz_store = store.clone();
    #[cfg(feature = "metrics")]
    let readyz_metrics = metrics.clone();
    let readyz_handle = tokio::spawn(async move {
        #[cfg(feature = "metrics")]
        readyz::serve(readyz_store, readyz_metrics, readyz_cancel).await;
        #[cfg(not(feature = "metrics"))]
        readyz::serve(readyz_store, readyz_cancel).await;
    });

    // Watch callbacks only ever enqueue; the monitor/reconcile map mutation
    // stays exclusively on the worker (§5 "shared-resource policy").
    let mut events = store.subscribe();
    let event_queue = queue.clone();
    let watch_forward = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => event_queue.add(event.key()).await,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // Belt-and-suspenders full resync: re-enqueues every cached key on an
    // interval so a reconcile that never produced a triggering watch event
    // (e.g. an externally-deleted Deployment) is still eventually observed.
    let resync_cancel = root_cancel.clone();
    let resync_store = store.clone();
    let resync_queue = queue.clone();
    let resync_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = resync_cancel.cancelled() => return,
                _ = tokio::time::sleep(consts::PROBE_INTERVAL) => {}
            }
            for key in resync_store.keys().await {
                resync_queue.add(key).await;
            }
        }
    });

    let worker_client = client.clone();
    let worker_store = store.clone();
    let worker_queue = queue.clone();
    let worker_monitors = monitors.clone();
    #[cfg(feature = "metrics")]
    let worker_metrics = metrics.clone();
    let worker_handle = tokio::spawn(run_worker(
        worker_client,
        worker_store,
        worker_queue,
        worker_monitors,
        #[cfg(feature = "metrics")]
        worker_metrics,
    ));

    shutdown_signal().await;
    root_cancel.cancel();
    watch_forward.abort();
    resync_handle.abort();
    queue.shutdown().await;
    let _ = worker_handle.await;
    let _ = store_handle.await;
    readyz_handle.abort();
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    if let Err(error) = required_env("MY_POD_NAMESPACE") {
        eprintln!("fatal: {error}");
        std::process::exit(1);
    }
    if let Err(error) = required_env("MY_POD_NAME") {
        eprintln!("fatal: {error}");
        std::process::exit(1);
    }
    let namespace = required_env("MY_POD_NAMESPACE").unwrap();
    let holder_id = required_env("MY_POD_NAME").unwrap();

    let client = match Client::try_default().await {
        Ok(client) => client,
        Err(error) => {
            eprintln!("fatal: in-cluster config unavailable: {error}");
            std::process::exit(1);
        }
    };

    println!("{}", "vault-operator starting, contesting leadership".color(FG1));
    leader::run_while_leader(client, &namespace, holder_id, run_controller).await;
}
