// In-process task locks with the same CAS rules as the Postgres table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{AcquireResult, ReleaseResult, RenewResult, TaskLease};

#[derive(Clone, Default)]
pub struct MemoryTaskLocks {
    leases: Arc<Mutex<HashMap<String, TaskLease>>>,
    failing_renewals: Arc<AtomicUsize>,
}

impl MemoryTaskLocks {
    /// Make the next `count` renewals fail as if the database were unreachable.
    pub fn fail_next_renewals(&self, count: usize) {
        self.failing_renewals.store(count, Ordering::SeqCst);
    }

    pub(super) fn take_renew_failure(&self) -> bool {
        self.failing_renewals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }

    fn with_leases<T>(&self, apply: impl FnOnce(&mut HashMap<String, TaskLease>) -> T) -> T {
        let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        apply(&mut leases)
    }

    pub(super) fn acquire_at(
        &self,
        task_name: &str,
        holder_id: Uuid,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> AcquireResult {
        self.with_leases(|leases| match leases.get_mut(task_name) {
            Some(lease) if !lease.is_expired_at(now) && lease.holder_id != holder_id => {
                AcquireResult::Denied { current_holder: lease.holder_id }
            }
            Some(lease) if !lease.is_expired_at(now) => {
                lease.expires_at = expires_at;
                AcquireResult::Renewed { lease_id: lease.lease_id }
            }
            _ => {
                let lease_id = Uuid::new_v4();
                leases.insert(
                    task_name.to_owned(),
                    TaskLease {
                        task_name: task_name.to_owned(),
                        holder_id,
                        lease_id,
                        acquired_at: now,
                        expires_at,
                    },
                );
                AcquireResult::Granted { lease_id }
            }
        })
    }

    pub(super) fn renew_at(
        &self,
        task_name: &str,
        holder_id: Uuid,
        lease_id: Uuid,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> RenewResult {
        self.with_leases(|leases| match leases.get_mut(task_name) {
            Some(lease) if lease.is_expired_at(now) => RenewResult::NotFound,
            Some(lease) if lease.holder_id == holder_id && lease.lease_id == lease_id => {
                lease.expires_at = expires_at;
                RenewResult::Renewed
            }
            Some(_) => RenewResult::WrongHolder,
            None => RenewResult::NotFound,
        })
    }

    pub(super) fn release_at(
        &self,
        task_name: &str,
        holder_id: Uuid,
        now: DateTime<Utc>,
    ) -> ReleaseResult {
        self.with_leases(|leases| match leases.get(task_name) {
            Some(lease) if lease.is_expired_at(now) => ReleaseResult::NotFound,
            Some(lease) if lease.holder_id == holder_id => {
                leases.remove(task_name);
                ReleaseResult::Released
            }
            Some(_) => ReleaseResult::WrongHolder,
            None => ReleaseResult::NotFound,
        })
    }

    pub(super) fn current_at(&self, task_name: &str, now: DateTime<Utc>) -> Option<TaskLease> {
        self.with_leases(|leases| {
            leases.get(task_name).filter(|lease| !lease.is_expired_at(now)).cloned()
        })
    }
}
