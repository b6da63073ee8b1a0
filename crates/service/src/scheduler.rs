// Periodic task runner gated by a task lock.
//
// Every tick the replica acquires (or renews) the lease for the task name
// and runs the job only while it holds it. The lease is released when the
// shutdown signal fires.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::task_lock::{AcquireResult, ReleaseResult, RenewResult, TaskLockManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodicTask {
    pub name: &'static str,
    pub interval: Duration,
}

/// Run `job` every `task.interval` until `shutdown` flips to `true`.
pub async fn run_periodic<F, Fut>(
    task: PeriodicTask,
    locks: TaskLockManager,
    holder_id: Uuid,
    job: F,
    mut shutdown: watch::Receiver<bool>,
) where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send,
{
    if locks.ttl() <= task.interval {
        warn!(
            task = task.name,
            ttl_ms = locks.ttl().as_millis() as u64,
            interval_ms = task.interval.as_millis() as u64,
            "task lock ttl does not exceed the interval; the lease may lapse between runs"
        );
    }

    let mut lease_id: Option<Uuid> = None;
    loop {
        if *shutdown.borrow() {
            break;
        }

        match hold_lease(&locks, task.name, holder_id, lease_id).await {
            LeaseTick::Held(id) => {
                lease_id = Some(id);
                job().instrument(info_span!("scheduled_task", task = task.name)).await;
            }
            // Still ours to release, but not safe to run on.
            LeaseTick::Unconfirmed(id) => lease_id = Some(id),
            LeaseTick::NotHeld => lease_id = None,
        }

        tokio::select! {
            _ = tokio::time::sleep(task.interval) => {},
            _ = shutdown.changed() => {
                debug!(task = task.name, "periodic task shutting down");
                break;
            }
        }
    }

    if lease_id.is_some() {
        match locks.release(task.name, holder_id).await {
            Ok(ReleaseResult::Released) => info!(task = task.name, "task lock released on shutdown"),
            Ok(other) => debug!(task = task.name, result = ?other, "no task lock to release"),
            Err(error) => warn!(task = task.name, %error, "failed to release task lock"),
        }
    }
}

/// Lease state for one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeaseTick {
    /// Confirmed for this tick; run the job.
    Held(Uuid),
    /// Renewal errored; the lease may still be ours.
    Unconfirmed(Uuid),
    NotHeld,
}

/// Renew the current lease or acquire a new one.
async fn hold_lease(
    locks: &TaskLockManager,
    task_name: &str,
    holder_id: Uuid,
    current: Option<Uuid>,
) -> LeaseTick {
    if let Some(lease_id) = current {
        match locks.renew(task_name, holder_id, lease_id).await {
            Ok(RenewResult::Renewed) => return LeaseTick::Held(lease_id),
            Ok(lost) => warn!(task = task_name, result = ?lost, "task lock lost"),
            Err(error) => {
                warn!(task = task_name, %error, "task lock renew failed");
                return LeaseTick::Unconfirmed(lease_id);
            }
        }
    }

    match locks.acquire(task_name, holder_id).await {
        Ok(AcquireResult::Granted { lease_id }) => {
            info!(task = task_name, %lease_id, "task lock acquired");
            LeaseTick::Held(lease_id)
        }
        Ok(AcquireResult::Renewed { lease_id }) => LeaseTick::Held(lease_id),
        Ok(AcquireResult::Denied { current_holder }) => {
            debug!(task = task_name, %current_holder, "task lock held by another replica");
            LeaseTick::NotHeld
        }
        Err(error) => {
            warn!(task = task_name, %error, "task lock acquire failed");
            LeaseTick::NotHeld
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::task_lock::MemoryTaskLocks;

    const TASK: PeriodicTask = PeriodicTask { name: "dialer", interval: Duration::from_millis(100) };

    fn counting_job(counter: &Arc<AtomicUsize>) -> impl Fn() -> std::future::Ready<()> + Send + Sync {
        let counter = Arc::clone(counter);
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn only_one_replica_runs_a_task() {
        let locks = TaskLockManager::memory(Duration::from_secs(30));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runs_a = Arc::new(AtomicUsize::new(0));
        let runs_b = Arc::new(AtomicUsize::new(0));

        let a = tokio::spawn(run_periodic(
            TASK,
            locks.clone(),
            Uuid::new_v4(),
            counting_job(&runs_a),
            shutdown_rx.clone(),
        ));
        let b = tokio::spawn(run_periodic(
            TASK,
            locks.clone(),
            Uuid::new_v4(),
            counting_job(&runs_b),
            shutdown_rx,
        ));

        tokio::time::sleep(Duration::from_millis(1_050)).await;
        shutdown_tx.send(true).expect("schedulers should be listening");
        a.await.expect("replica a should stop cleanly");
        b.await.expect("replica b should stop cleanly");

        let (a_runs, b_runs) = (runs_a.load(Ordering::SeqCst), runs_b.load(Ordering::SeqCst));
        assert!(a_runs == 0 || b_runs == 0, "both replicas ran: {a_runs} and {b_runs}");
        assert!(a_runs + b_runs >= 10, "holder ran too few times: {}", a_runs + b_runs);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_releases_the_lease() {
        let locks = TaskLockManager::memory(Duration::from_secs(30));
        let holder = Uuid::new_v4();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runs = Arc::new(AtomicUsize::new(0));

        let handle =
            tokio::spawn(run_periodic(TASK, locks.clone(), holder, counting_job(&runs), shutdown_rx));
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(
            locks.current(TASK.name).await.expect("current").map(|lease| lease.holder_id),
            Some(holder)
        );

        shutdown_tx.send(true).expect("scheduler should be listening");
        handle.await.expect("scheduler should stop cleanly");

        assert!(runs.load(Ordering::SeqCst) >= 1);
        assert!(locks.current(TASK.name).await.expect("current").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_renewal_skips_the_run_but_still_releases() {
        let memory = MemoryTaskLocks::default();
        let locks = TaskLockManager::Memory { locks: memory.clone(), ttl: Duration::from_secs(30) };
        let holder = Uuid::new_v4();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runs = Arc::new(AtomicUsize::new(0));

        let handle =
            tokio::spawn(run_periodic(TASK, locks.clone(), holder, counting_job(&runs), shutdown_rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        memory.fail_next_renewals(usize::MAX);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(
            locks.current(TASK.name).await.expect("current").map(|lease| lease.holder_id),
            Some(holder)
        );

        shutdown_tx.send(true).expect("scheduler should be listening");
        handle.await.expect("scheduler should stop cleanly");
        assert!(locks.current(TASK.name).await.expect("current").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn task_is_denied_while_another_holder_has_it() {
        let locks = TaskLockManager::memory(Duration::from_secs(30));
        let other = Uuid::new_v4();
        locks.acquire(TASK.name, other).await.expect("acquire");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runs = Arc::new(AtomicUsize::new(0));
        let handle = tokio::spawn(run_periodic(
            TASK,
            locks.clone(),
            Uuid::new_v4(),
            counting_job(&runs),
            shutdown_rx,
        ));
        tokio::time::sleep(Duration::from_millis(500)).await;
        shutdown_tx.send(true).expect("scheduler should be listening");
        handle.await.expect("scheduler should stop cleanly");

        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(
            locks.current(TASK.name).await.expect("current").map(|lease| lease.holder_id),
            Some(other)
        );
    }
}
