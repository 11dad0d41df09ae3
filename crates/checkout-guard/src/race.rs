//! Fire identical submissions concurrently and count what each one got

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::GuardResult;
use crate::guard::{CheckoutGuard, GuardOutcome, GuardRequest};
use crate::store::{LockStore, OrderStatus, StoreSession};

/// Tally of one race
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RaceReport {
    pub requests: usize,
    pub proceeded: usize,
    pub rejected: usize,
    pub contended: usize,
    pub failed: usize,
    /// Orders stored for the fingerprint once every request finished
    pub orders_committed: u64,
    /// Ids of the orders created during the race
    pub created_order_ids: Vec<u64>,
}

impl fmt::Display for RaceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} requests: {} proceeded, {} rejected, {} contended, {} failed; {} order(s) committed",
            self.requests,
            self.proceeded,
            self.rejected,
            self.contended,
            self.failed,
            self.orders_committed
        )
    }
}

enum Attempt {
    Created(u64),
    Rejected,
    Contended,
    Failed,
}

/// Submit the same request `config.simulated_requests` times in parallel.
///
/// A request that gets through records an order, holds the lock for `hold`
/// (payment latency), then completes its permit.
pub async fn run_race<S: LockStore>(
    guard: Arc<CheckoutGuard<S>>,
    request: GuardRequest,
    hold: Duration,
) -> GuardResult<RaceReport> {
    let requests = guard.config().simulated_requests;
    info!(
        "Racing {} submissions of {} (guard enabled: {})",
        requests,
        request.fingerprint(),
        guard.config().enabled
    );

    let mut tasks = JoinSet::new();
    for worker in 0..requests {
        let guard = guard.clone();
        let request = request.clone();
        tasks.spawn(async move { submit(worker, &guard, &request, hold).await });
    }

    let mut report = RaceReport {
        requests,
        ..RaceReport::default()
    };
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Attempt::Created(id)) => {
                report.proceeded += 1;
                report.created_order_ids.push(id);
            }
            Ok(Attempt::Rejected) => report.rejected += 1,
            Ok(Attempt::Contended) => report.contended += 1,
            Ok(Attempt::Failed) => report.failed += 1,
            Err(e) => {
                warn!("Race worker crashed: {}", e);
                report.failed += 1;
            }
        }
    }
    report.created_order_ids.sort_unstable();

    let mut session = guard.store().open_session().await?;
    report.orders_committed = session.count_orders(request.fingerprint()).await?;
    session.close().await?;

    info!("Race finished: {}", report);
    Ok(report)
}

async fn submit<S: LockStore>(
    worker: usize,
    guard: &CheckoutGuard<S>,
    request: &GuardRequest,
    hold: Duration,
) -> Attempt {
    match guard.check(request).await {
        GuardOutcome::Proceed(mut permit) => {
            let order = match permit.record_order(OrderStatus::Processing).await {
                Ok(order) => order,
                Err(e) => {
                    warn!("Worker {} could not record its order: {}", worker, e);
                    return Attempt::Failed;
                }
            };
            tokio::time::sleep(hold).await;
            if let Err(e) = permit.complete().await {
                warn!("Worker {} failed to release its lock: {}", worker, e);
            }
            debug!("Worker {} created order {}", worker, order.id);
            Attempt::Created(order.id)
        }
        GuardOutcome::Rejected(existing) => {
            debug!("Worker {} rejected, order {} exists", worker, existing.id);
            Attempt::Rejected
        }
        GuardOutcome::Contended { waited } => {
            debug!("Worker {} gave up after {:?}", worker, waited);
            Attempt::Contended
        }
        GuardOutcome::StoreUnavailable(e) => {
            warn!("Worker {} hit a store failure: {}", worker, e);
            Attempt::Failed
        }
    }
}
