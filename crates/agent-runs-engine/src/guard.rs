use agent_runs_domain::{AdmissionRefusal, DateTimeUtc, Run, RunError, TaskKind, TenantId};
use agent_runs_store_core::{RunLedger, StartOutcome};

/// Admission control for starting a queued run: a per-(tenant, task kind)
/// lock plus the per-tenant running cap.
pub struct ConcurrencyGuard<'a> {
    ledger: &'a dyn RunLedger,
    running_cap: u32,
    lock_ttl: time::Duration,
}

pub enum Admission<'a> {
    Started { run: Run, lock: LockGuard<'a> },
    /// The run was no longer startable once the start transaction ran.
    Skipped(Run),
}

impl<'a> ConcurrencyGuard<'a> {
    #[must_use]
    pub fn new(ledger: &'a dyn RunLedger, running_cap: u32, lock_ttl: time::Duration) -> Self {
        Self {
            ledger,
            running_cap,
            lock_ttl,
        }
    }

    /// Take the task-kind lock, then move the run to running under the
    /// tenant cap. The lock is released on every path that does not start the run.
    ///
    /// # Errors
    /// Returns [`RunError::ConcurrencyLimit`] when the lock is held elsewhere or
    /// the tenant is at its cap; the run stays queued in both cases.
    pub fn admit(&self, run: &Run, now: DateTimeUtc) -> Result<Admission<'a>, RunError> {
        let owner = run.run_id.to_string();
        let acquired =
            self.ledger
                .try_acquire_lock(run.tenant_id, run.task_kind, &owner, now, self.lock_ttl)?;
        if !acquired {
            tracing::debug!(
                run_id = %run.run_id,
                tenant_id = %run.tenant_id,
                task_kind = %run.task_kind,
                "task kind lock held by another run"
            );
            return Err(RunError::ConcurrencyLimit(
                AdmissionRefusal::TaskKindLocked {
                    tenant_id: run.tenant_id,
                    task_kind: run.task_kind,
                },
            ));
        }
        let lock = LockGuard {
            ledger: self.ledger,
            tenant_id: run.tenant_id,
            task_kind: run.task_kind,
            owner,
        };

        match self.ledger.start_run(
            run.tenant_id,
            run.run_id,
            run.attempts,
            self.running_cap,
            now,
        )? {
            StartOutcome::Started(run) => Ok(Admission::Started { run, lock }),
            StartOutcome::TenantCapReached { running } => {
                tracing::debug!(
                    run_id = %run.run_id,
                    tenant_id = %run.tenant_id,
                    running,
                    cap = self.running_cap,
                    "tenant running cap reached"
                );
                Err(RunError::ConcurrencyLimit(AdmissionRefusal::TenantCap {
                    tenant_id: run.tenant_id,
                    running,
                    cap: self.running_cap,
                }))
            }
            StartOutcome::NotStartable(current) => Ok(Admission::Skipped(current)),
            StartOutcome::Missing => Err(RunError::run_not_found(run.tenant_id, run.run_id)),
        }
    }
}

/// Holds a tenant task-kind lock until dropped.
pub struct LockGuard<'a> {
    ledger: &'a dyn RunLedger,
    tenant_id: TenantId,
    task_kind: TaskKind,
    owner: String,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        match self
            .ledger
            .release_lock(self.tenant_id, self.task_kind, &self.owner)
        {
            Ok(true) => {}
            Ok(false) => tracing::debug!(
                owner = %self.owner,
                task_kind = %self.task_kind,
                "lock was already released or taken over"
            ),
            Err(err) => tracing::warn!(
                owner = %self.owner,
                task_kind = %self.task_kind,
                error = %format!("{err:#}"),
                "failed to release tenant lock; it will expire after its ttl"
            ),
        }
    }
}
