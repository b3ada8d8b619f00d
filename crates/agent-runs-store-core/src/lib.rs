#![forbid(unsafe_code)]

use agent_runs_domain::{
    DateTimeUtc, EventRow, NewRun, ProposedMutation, Run, RunId, RunStatus, SubjectId,
    SubjectState, TaskKind, TenantId,
};
use anyhow::Result;
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct RunFilter {
    pub tenant_id: Option<TenantId>,
    pub status: Option<RunStatus>,
    pub subject_id: Option<SubjectId>,
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub run: Run,
    /// False when the idempotency key matched an existing run.
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
    Started(Run),
    TenantCapReached { running: u32 },
    /// The run was no longer queued, not yet due, or on another attempt.
    NotStartable(Run),
    Missing,
}

/// Result of a guarded single-row state change.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Applied(Run),
    /// The precondition did not hold; carries the run as currently stored.
    Unchanged(Run),
    Missing,
}

impl Transition {
    #[must_use]
    pub fn applied(&self) -> bool {
        matches!(self, Transition::Applied(_))
    }

    #[must_use]
    pub fn into_run(self) -> Option<Run> {
        match self {
            Transition::Applied(run) | Transition::Unchanged(run) => Some(run),
            Transition::Missing => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApplyCommit {
    Committed { run: Run, applied: usize },
    /// A handler failed; the transaction was rolled back.
    Aborted { errors: Vec<String> },
    NotApplicable(Run),
    Missing,
}

/// Identity stamped onto every row a mutation handler writes.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationContext {
    pub tenant_id: TenantId,
    pub subject_id: SubjectId,
    pub run_id: RunId,
    pub actor: String,
    pub now: DateTimeUtc,
}

/// Writes against the mutation target tables, bound to the applier's transaction.
pub trait MutationWriter {
    #[allow(clippy::missing_errors_doc)]
    fn create_rehab_task(
        &self,
        ctx: &MutationContext,
        title: &str,
        category: Option<&str>,
        cost_estimate: Option<f64>,
        notes: Option<&str>,
    ) -> Result<i64>;

    #[allow(clippy::missing_errors_doc)]
    fn update_checklist_item_status(
        &self,
        ctx: &MutationContext,
        item_code: &str,
        status: &str,
    ) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn create_workflow_event(
        &self,
        ctx: &MutationContext,
        event_type: &str,
        payload: &Value,
    ) -> Result<i64>;
}

/// Applies every intent through the writer, returning the applied count or
/// all handler errors.
pub type ApplyFn<'f> = dyn Fn(&dyn MutationWriter) -> std::result::Result<usize, Vec<String>> + 'f;

/// Persisted run records, the tenant lock table and the per-run audit log.
///
/// Every state-changing method is a single guarded transaction that also
/// appends the matching audit event.
pub trait RunLedger {
    #[allow(clippy::missing_errors_doc)]
    fn migrate(&self) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn submit(&self, new_run: &NewRun, now: DateTimeUtc) -> Result<Submission>;

    #[allow(clippy::missing_errors_doc)]
    fn get_run(&self, tenant_id: TenantId, run_id: RunId) -> Result<Option<Run>>;

    #[allow(clippy::missing_errors_doc)]
    fn find_run(&self, run_id: RunId) -> Result<Option<Run>>;

    #[allow(clippy::missing_errors_doc)]
    fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>>;

    #[allow(clippy::missing_errors_doc)]
    fn list_due_runs(&self, now: DateTimeUtc, limit: u32) -> Result<Vec<Run>>;

    #[allow(clippy::missing_errors_doc)]
    fn count_runs_since(
        &self,
        tenant_id: TenantId,
        subject_id: SubjectId,
        since: DateTimeUtc,
    ) -> Result<u32>;

    #[allow(clippy::missing_errors_doc)]
    fn try_acquire_lock(
        &self,
        tenant_id: TenantId,
        task_kind: TaskKind,
        owner: &str,
        now: DateTimeUtc,
        ttl: time::Duration,
    ) -> Result<bool>;

    #[allow(clippy::missing_errors_doc)]
    fn release_lock(&self, tenant_id: TenantId, task_kind: TaskKind, owner: &str)
        -> Result<bool>;

    #[allow(clippy::missing_errors_doc)]
    fn start_run(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
        expected_attempts: u32,
        running_cap: u32,
        now: DateTimeUtc,
    ) -> Result<StartOutcome>;

    #[allow(clippy::missing_errors_doc)]
    fn schedule_retry(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
        error: &str,
        next_attempt_at: DateTimeUtc,
        now: DateTimeUtc,
    ) -> Result<Transition>;

    #[allow(clippy::missing_errors_doc)]
    fn finish_done(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
        output: &Value,
        now: DateTimeUtc,
    ) -> Result<Transition>;

    #[allow(clippy::missing_errors_doc)]
    fn finish_blocked(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
        output: &Value,
        mutations: &[ProposedMutation],
        now: DateTimeUtc,
    ) -> Result<Transition>;

    #[allow(clippy::missing_errors_doc)]
    fn fail_running(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
        error: &str,
        now: DateTimeUtc,
    ) -> Result<Transition>;

    #[allow(clippy::missing_errors_doc)]
    fn approve(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
        actor: &str,
        now: DateTimeUtc,
    ) -> Result<Transition>;

    #[allow(clippy::missing_errors_doc)]
    fn reject(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
        actor: &str,
        reason: &str,
        now: DateTimeUtc,
    ) -> Result<Transition>;

    #[allow(clippy::missing_errors_doc)]
    fn commit_apply(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
        actor: &str,
        now: DateTimeUtc,
        apply: &ApplyFn<'_>,
    ) -> Result<ApplyCommit>;

    #[allow(clippy::missing_errors_doc)]
    fn record_apply_failure(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
        actor: &str,
        errors: &[String],
        now: DateTimeUtc,
    ) -> Result<Transition>;

    #[allow(clippy::missing_errors_doc)]
    fn sweep_run(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
        stale_before: DateTimeUtc,
        now: DateTimeUtc,
    ) -> Result<Transition>;

    #[allow(clippy::missing_errors_doc)]
    fn sweep_stale(&self, stale_before: DateTimeUtc, now: DateTimeUtc) -> Result<Vec<Run>>;

    #[allow(clippy::missing_errors_doc)]
    fn list_events(&self, run_id: RunId) -> Result<Vec<EventRow>>;
}

pub trait SubjectStateSource {
    #[allow(clippy::missing_errors_doc)]
    fn subject_state(
        &self,
        tenant_id: TenantId,
        subject_id: SubjectId,
    ) -> Result<Option<SubjectState>>;

    #[allow(clippy::missing_errors_doc)]
    fn upsert_subject_state(&self, state: &SubjectState) -> Result<()>;
}
