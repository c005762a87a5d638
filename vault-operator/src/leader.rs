//! Leader election (C9): at most one operator replica drives the reconcile
//! worker and owns monitor tasks at a time. Losing the lease is fatal.

use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams, LeaseLockResult};
use owo_colors::OwoColorize;

use crate::colors::{FG1, FG2};
use crate::consts::{LEASE_RENEW_EVERY, LEASE_RETRY_PERIOD, LEASE_TTL, MANAGER_NAME};

/// Runs `body` only while this replica holds the lease, retrying acquisition
/// every [`LEASE_RETRY_PERIOD`] while a candidate. Once acquired, a background
/// task renews the lease every [`LEASE_RENEW_EVERY`]; any failure to renew
/// (lost lock, apiserver error) is fatal (§4.8) — the process exits
/// immediately rather than attempt graceful hand-off, so the Deployment
/// restarts it and it re-contests the lock with no partial-leadership window
/// for monitor tasks.
pub async fn run_while_leader<F, Fut>(client: Client, namespace: &str, holder_id: String, body: F) -> !
where
    F: FnOnce(Client) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let lock = LeaseLock::new(
        client.clone(),
        namespace,
        LeaseLockParams {
            holder_id,
            lease_name: format!("{MANAGER_NAME}-lock"),
            lease_ttl: LEASE_TTL,
        },
    );

    loop {
        match lock.try_acquire_or_renew().await {
            Ok(LeaseLockResult::Acquired(_)) => break,
            Ok(LeaseLockResult::NotAcquired) => {
                tokio::time::sleep(LEASE_RETRY_PERIOD).await;
            }
            Err(error) => {
                eprintln!(
                    "{}",
                    format!("leader election error, assuming unsafe to lead: {error}").color(FG2)
                );
                std::process::exit(1);
            }
        }
    }

    println!("{}", "acquired leadership, starting reconciler".color(FG1));
    let renewal = tokio::spawn(async move {
        let mut tick = tokio::time::interval(LEASE_RENEW_EVERY);
        tick.tick().await; // first tick fires immediately; we just acquired.
        loop {
            tick.tick().await;
            match lock.try_acquire_or_renew().await {
                Ok(LeaseLockResult::Acquired(_)) => {}
                Ok(LeaseLockResult::NotAcquired) => {
                    eprintln!("{}", "lost leadership; terminating".color(FG2));
                    std::process::exit(1);
                }
                Err(error) => {
                    eprintln!(
                        "{}",
                        format!("lease renewal failed, assuming lost: {error}").color(FG2)
                    );
                    std::process::exit(1);
                }
            }
        }
    });

    body(client).await;
    renewal.abort();
    std::process::exit(0);
}
