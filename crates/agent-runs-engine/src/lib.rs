#![forbid(unsafe_code)]

mod clock;
mod config;
mod guard;
mod pool;
mod tasks;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{EngineConfig, ENV_PREFIX};
pub use guard::{Admission, ConcurrencyGuard, LockGuard};
pub use pool::{PoolOptions, PoolReport, WorkerPool};
pub use tasks::{FnTask, TaskFunction, TaskInput, TaskRegistry};

use std::panic::AssertUnwindSafe;

use agent_runs_contract::{ContractRegistry, ContractValidation};
use agent_runs_domain::{
    ensure_non_empty, verify_event_chain, ApprovalStatus, DateTimeUtc, EventRow, MutationIntent,
    NewRun, Run, RunError, RunId, RunStatus, SubjectId, SubjectState, TaskKind, TaskOutput,
    TenantId,
};
use agent_runs_planner::{PlanInput, PlannedRun, Stage};
use agent_runs_store_core::{
    ApplyCommit, MutationContext, MutationWriter, RunFilter, RunLedger, SubjectStateSource,
    Transition,
};
use anyhow::Context;
use serde::Serialize;
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApplyOutcome {
    pub applied_count: usize,
    pub errors: Vec<String>,
    pub run: Run,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub swept: Vec<RunId>,
    #[serde(with = "time::serde::rfc3339")]
    pub stale_before: DateTimeUtc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditReport {
    pub run_id: RunId,
    pub events: usize,
    pub chain_valid: bool,
}

/// Drives runs through submit, execute, approval and apply against one ledger.
pub struct RunEngine<'a> {
    ledger: &'a dyn RunLedger,
    subjects: &'a dyn SubjectStateSource,
    contracts: &'a ContractRegistry,
    tasks: &'a TaskRegistry,
    config: &'a EngineConfig,
    clock: &'a dyn Clock,
}

impl<'a> RunEngine<'a> {
    #[must_use]
    pub fn new(
        ledger: &'a dyn RunLedger,
        subjects: &'a dyn SubjectStateSource,
        contracts: &'a ContractRegistry,
        tasks: &'a TaskRegistry,
        config: &'a EngineConfig,
        clock: &'a dyn Clock,
    ) -> Self {
        Self {
            ledger,
            subjects,
            contracts,
            tasks,
            config,
            clock,
        }
    }

    /// Queue a run. A repeated idempotency key within the tenant returns the
    /// run created by the first submission.
    ///
    /// # Errors
    /// Returns [`RunError::Store`] when the ledger cannot be written.
    pub fn submit(
        &self,
        tenant_id: TenantId,
        task_kind: TaskKind,
        subject_id: Option<SubjectId>,
        payload: Value,
        idempotency_key: Option<String>,
    ) -> Result<Run, RunError> {
        let new_run = NewRun {
            tenant_id,
            task_kind,
            subject_id,
            input: payload,
            idempotency_key: idempotency_key
                .map(|key| key.trim().to_string())
                .filter(|key| !key.is_empty()),
        };
        let submission = self.ledger.submit(&new_run, self.clock.now())?;
        if submission.created {
            tracing::info!(
                run_id = %submission.run.run_id,
                tenant_id = %tenant_id,
                task_kind = %task_kind,
                "run submitted"
            );
        } else {
            tracing::debug!(
                run_id = %submission.run.run_id,
                tenant_id = %tenant_id,
                "idempotency key matched an existing run"
            );
        }
        Ok(submission.run)
    }

    /// Execute the next attempt of a run, whatever its attempt count is.
    ///
    /// # Errors
    /// See [`RunEngine::execute`].
    pub fn execute_next(&self, tenant_id: TenantId, run_id: RunId) -> Result<Run, RunError> {
        let run = self.get_run(tenant_id, run_id)?;
        self.execute(tenant_id, run_id, run.attempts.saturating_add(1))
    }

    /// Run attempt number `attempt` of a queued run.
    ///
    /// A delivery for any other attempt, or for a run that is not queued or
    /// not yet due, changes nothing and returns the stored run.
    ///
    /// # Errors
    /// Returns [`RunError::ConcurrencyLimit`] when admission is refused (the
    /// run stays queued), [`RunError::NotFound`] for an unknown run, and
    /// [`RunError::Configuration`] when no task function is registered.
    pub fn execute(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
        attempt: u32,
    ) -> Result<Run, RunError> {
        let span = tracing::info_span!("execute", run_id = %run_id, tenant_id = %tenant_id, attempt);
        let _entered = span.enter();

        let now = self.clock.now();
        let run = self.touch(tenant_id, run_id, now)?;
        if run.status != RunStatus::Queued
            || attempt != run.attempts.saturating_add(1)
            || !run.is_due(now)
        {
            tracing::debug!(
                status = run.status.as_str(),
                attempts = run.attempts,
                "delivery does not match a due attempt; nothing to do"
            );
            return Ok(run);
        }

        let function = self.tasks.get(run.task_kind).ok_or_else(|| {
            RunError::Configuration(format!(
                "no task function registered for {}",
                run.task_kind
            ))
        })?;

        let guard = ConcurrencyGuard::new(
            self.ledger,
            self.config.max_running_per_tenant,
            self.config.lock_ttl(),
        );
        let (run, lock) = match guard.admit(&run, now)? {
            Admission::Started { run, lock } => (run, lock),
            Admission::Skipped(run) => return Ok(run),
        };
        tracing::info!(task = function.name(), attempts = run.attempts, "run started");

        let input = TaskInput {
            tenant_id,
            subject_id: run.subject_id,
            payload: run.input.clone(),
        };
        let result = run_task(function, &input);

        let finished = self.clock.now();
        let elapsed = finished - run.started_at.unwrap_or(now);
        let transition = if elapsed > self.config.run_timeout() {
            let message = RunError::Timeout(format!(
                "task ran for {elapsed}, limit is {}s",
                self.config.run_timeout_secs
            ))
            .to_string();
            tracing::warn!(error = %message, "run exceeded its timeout; output discarded");
            self.ledger
                .fail_running(tenant_id, run_id, &message, finished)?
        } else {
            match result {
                Ok(output) => self.record_output(&run, &output, finished)?,
                Err(err) => self.record_task_error(&run, &err, finished)?,
            }
        };
        drop(lock);

        settle(transition, tenant_id, run_id)
    }

    fn record_task_error(
        &self,
        run: &Run,
        err: &anyhow::Error,
        now: DateTimeUtc,
    ) -> Result<Transition, RunError> {
        let message = RunError::Execution(format!("{err:#}")).to_string();
        if run.attempts <= self.config.max_retries {
            let delay = self.config.backoff(run.attempts);
            tracing::warn!(
                attempts = run.attempts,
                delay = %delay,
                error = %message,
                "task failed; retry scheduled"
            );
            Ok(self
                .ledger
                .schedule_retry(run.tenant_id, run.run_id, &message, now + delay, now)?)
        } else {
            tracing::error!(
                attempts = run.attempts,
                error = %message,
                "task failed; retry ceiling reached"
            );
            Ok(self
                .ledger
                .fail_running(run.tenant_id, run.run_id, &message, now)?)
        }
    }

    fn record_output(
        &self,
        run: &Run,
        output: &TaskOutput,
        now: DateTimeUtc,
    ) -> Result<Transition, RunError> {
        let validation = self.contracts.validate_output(run.task_kind, output);
        if !validation.ok() {
            let message = RunError::ContractViolation(validation.violations).to_string();
            tracing::warn!(error = %message, "task output rejected by contract");
            return Ok(self
                .ledger
                .fail_running(run.tenant_id, run.run_id, &message, now)?);
        }

        let output_value =
            serde_json::to_value(output).context("failed to serialize task output")?;
        if output.proposed_mutations.is_empty() {
            tracing::info!("run finished");
            return Ok(self
                .ledger
                .finish_done(run.tenant_id, run.run_id, &output_value, now)?);
        }

        tracing::info!(
            proposed = output.proposed_mutations.len(),
            "run blocked awaiting approval"
        );
        Ok(self.ledger.finish_blocked(
            run.tenant_id,
            run.run_id,
            &output_value,
            &output.proposed_mutations,
            now,
        )?)
    }

    /// # Errors
    /// Returns [`RunError::InvalidTransition`] unless the run is blocked and
    /// pending or already approved; terminal runs are returned unchanged.
    pub fn approve(&self, tenant_id: TenantId, run_id: RunId, actor: &str) -> Result<Run, RunError> {
        let actor = require_actor(actor)?;
        let now = self.clock.now();
        let run = self.touch(tenant_id, run_id, now)?;
        match (run.status, run.approval_status) {
            (RunStatus::Blocked, ApprovalStatus::Pending) => {
                let transition = self.ledger.approve(tenant_id, run_id, actor, now)?;
                tracing::info!(run_id = %run_id, actor, "run approved");
                settle(transition, tenant_id, run_id)
            }
            (RunStatus::Blocked, ApprovalStatus::Approved) => Ok(run),
            (status, _) if status.is_terminal() => Ok(run),
            (status, approval) => Err(RunError::InvalidTransition(format!(
                "cannot approve run {run_id} in status {} (approval {})",
                status.as_str(),
                approval.as_str()
            ))),
        }
    }

    /// # Errors
    /// Returns [`RunError::InvalidTransition`] for queued and running runs.
    pub fn reject(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
        actor: &str,
        reason: &str,
    ) -> Result<Run, RunError> {
        let actor = require_actor(actor)?;
        let reason = if reason.trim().is_empty() {
            "no reason given"
        } else {
            reason.trim()
        };
        let now = self.clock.now();
        let run = self.touch(tenant_id, run_id, now)?;
        match (run.status, run.approval_status) {
            (RunStatus::Blocked, ApprovalStatus::Pending | ApprovalStatus::Approved) => {
                let transition = self.ledger.reject(tenant_id, run_id, actor, reason, now)?;
                tracing::info!(run_id = %run_id, actor, reason, "run rejected");
                settle(transition, tenant_id, run_id)
            }
            (status, _) if status.is_terminal() => Ok(run),
            (status, approval) => Err(RunError::InvalidTransition(format!(
                "cannot reject run {run_id} in status {} (approval {})",
                status.as_str(),
                approval.as_str()
            ))),
        }
    }

    /// Apply an approved run's mutations in one transaction.
    ///
    /// A done run returns `applied_count == 0` and writes nothing. Contract
    /// drift and handler failures end the run failed; the outcome then lists
    /// every error.
    ///
    /// # Errors
    /// Returns [`RunError::InvalidTransition`] unless the run is blocked and
    /// approved, or already done.
    pub fn apply(
        &self,
        tenant_id: TenantId,
        run_id: RunId,
        actor: &str,
    ) -> Result<ApplyOutcome, RunError> {
        let actor = require_actor(actor)?;
        let now = self.clock.now();
        let run = self.touch(tenant_id, run_id, now)?;
        if run.status == RunStatus::Done {
            tracing::debug!(run_id = %run_id, "run already done; nothing to apply");
            return Ok(ApplyOutcome {
                applied_count: 0,
                errors: Vec::new(),
                run,
            });
        }
        if run.status != RunStatus::Blocked || run.approval_status != ApprovalStatus::Approved {
            return Err(RunError::InvalidTransition(format!(
                "cannot apply run {run_id} in status {} (approval {})",
                run.status.as_str(),
                run.approval_status.as_str()
            )));
        }

        let Some(subject_id) = run.subject_id else {
            return self.fail_apply(
                &run,
                actor,
                vec!["run has no subject to apply mutations to".to_string()],
                now,
            );
        };
        let validation = match &run.output {
            Some(output) => self.contracts.validate_output_value(run.task_kind, output),
            None => ContractValidation {
                violations: vec!["run has no stored output".to_string()],
                intents: Vec::new(),
            },
        };
        if !validation.ok() {
            return self.fail_apply(&run, actor, validation.violations, now);
        }

        let ctx = MutationContext {
            tenant_id,
            subject_id,
            run_id,
            actor: actor.to_string(),
            now,
        };
        let intents = validation.intents;
        let apply = |writer: &dyn MutationWriter| apply_intents(writer, &ctx, &intents);

        match self
            .ledger
            .commit_apply(tenant_id, run_id, actor, now, &apply)?
        {
            ApplyCommit::Committed { run, applied } => {
                tracing::info!(run_id = %run_id, applied, "mutations applied");
                Ok(ApplyOutcome {
                    applied_count: applied,
                    errors: Vec::new(),
                    run,
                })
            }
            ApplyCommit::Aborted { errors } => self.fail_apply(&run, actor, errors, now),
            ApplyCommit::NotApplicable(current) if current.status == RunStatus::Done => {
                Ok(ApplyOutcome {
                    applied_count: 0,
                    errors: Vec::new(),
                    run: current,
                })
            }
            ApplyCommit::NotApplicable(current) => Err(RunError::InvalidTransition(format!(
                "run {run_id} changed to status {} during apply",
                current.status.as_str()
            ))),
            ApplyCommit::Missing => Err(RunError::run_not_found(tenant_id, run_id)),
        }
    }

    fn fail_apply(
        &self,
        run: &Run,
        actor: &str,
        errors: Vec<String>,
        now: DateTimeUtc,
    ) -> Result<ApplyOutcome, RunError> {
        tracing::warn!(run_id = %run.run_id, errors = ?errors, "apply aborted; run failed");
        let transition =
            self.ledger
                .record_apply_failure(run.tenant_id, run.run_id, actor, &errors, now)?;
        let run = settle(transition, run.tenant_id, run.run_id)?;
        Ok(ApplyOutcome {
            applied_count: 0,
            errors,
            run,
        })
    }

    /// Candidate runs for a subject. Reads only; nothing is submitted.
    ///
    /// # Errors
    /// Returns [`RunError::Store`] when the subject state or run history
    /// cannot be read.
    pub fn plan(&self, tenant_id: TenantId, subject_id: SubjectId) -> Result<Vec<PlannedRun>, RunError> {
        let now = self.clock.now();
        let state = self
            .subjects
            .subject_state(tenant_id, subject_id)?
            .unwrap_or_else(|| SubjectState {
                tenant_id,
                subject_id,
                stage: Stage::Intake.as_str().to_string(),
                flags: Vec::new(),
                attributes: Map::new(),
                updated_at: now,
            });
        let runs_in_last_hour =
            self.ledger
                .count_runs_since(tenant_id, subject_id, now - time::Duration::HOUR)?;

        let planned = agent_runs_planner::plan(&PlanInput {
            state: &state,
            runs_in_last_hour,
            hourly_cap: self.config.max_runs_per_subject_per_hour,
            plan_version: self.config.plan_version,
        })?;
        tracing::debug!(
            tenant_id = %tenant_id,
            subject_id = %subject_id,
            runs_in_last_hour,
            planned = planned.len(),
            "planned subject"
        );
        Ok(planned)
    }

    /// # Errors
    /// Returns [`RunError::InvalidTransition`] when a planned run belongs to
    /// another tenant, or [`RunError::Store`] when submission fails.
    pub fn submit_planned(
        &self,
        tenant_id: TenantId,
        planned: &[PlannedRun],
    ) -> Result<Vec<Run>, RunError> {
        planned
            .iter()
            .map(|candidate| {
                if candidate.tenant_id != tenant_id {
                    return Err(RunError::InvalidTransition(format!(
                        "planned run for tenant {} cannot be submitted for tenant {tenant_id}",
                        candidate.tenant_id
                    )));
                }
                self.submit(
                    tenant_id,
                    candidate.task_kind,
                    Some(candidate.subject_id),
                    candidate.payload.clone(),
                    Some(candidate.idempotency_key.clone()),
                )
            })
            .collect()
    }

    /// Fail every running run whose heartbeat is older than the run timeout.
    ///
    /// # Errors
    /// Returns [`RunError::Store`] when the sweep cannot be written.
    pub fn sweep_stale_runs(&self) -> Result<SweepReport, RunError> {
        let now = self.clock.now();
        let stale_before = now - self.config.run_timeout();
        let swept = self.ledger.sweep_stale(stale_before, now)?;
        for run in &swept {
            tracing::warn!(
                run_id = %run.run_id,
                tenant_id = %run.tenant_id,
                task_kind = %run.task_kind,
                "stale run swept to failed"
            );
        }
        Ok(SweepReport {
            swept: swept.into_iter().map(|run| run.run_id).collect(),
            stale_before,
        })
    }

    /// # Errors
    /// Returns [`RunError::NotFound`] for an unknown run.
    pub fn replay_audit(&self, run_id: RunId) -> Result<AuditReport, RunError> {
        let run = self
            .ledger
            .find_run(run_id)?
            .ok_or_else(|| RunError::NotFound(format!("run {run_id} not found")))?;
        let events = self.ledger.list_events(run.run_id)?;
        let chain_valid = verify_event_chain(&events)?;
        if !chain_valid {
            tracing::error!(run_id = %run_id, "audit chain failed verification");
        }
        Ok(AuditReport {
            run_id: run.run_id,
            events: events.len(),
            chain_valid,
        })
    }

    /// # Errors
    /// Returns [`RunError::NotFound`] for an unknown run.
    pub fn events(&self, run_id: RunId) -> Result<Vec<EventRow>, RunError> {
        if self.ledger.find_run(run_id)?.is_none() {
            return Err(RunError::NotFound(format!("run {run_id} not found")));
        }
        Ok(self.ledger.list_events(run_id)?)
    }

    /// Load a run, sweeping it first if it is stuck in running.
    ///
    /// # Errors
    /// Returns [`RunError::NotFound`] when the run does not exist for the tenant.
    pub fn get_run(&self, tenant_id: TenantId, run_id: RunId) -> Result<Run, RunError> {
        self.touch(tenant_id, run_id, self.clock.now())
    }

    /// # Errors
    /// Returns [`RunError::Store`] when the ledger cannot be read.
    pub fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>, RunError> {
        Ok(self.ledger.list_runs(filter)?)
    }

    fn touch(&self, tenant_id: TenantId, run_id: RunId, now: DateTimeUtc) -> Result<Run, RunError> {
        let run = self
            .ledger
            .get_run(tenant_id, run_id)?
            .ok_or_else(|| RunError::run_not_found(tenant_id, run_id))?;
        let timeout = self.config.run_timeout();
        if !run.is_stale(now, timeout) {
            return Ok(run);
        }

        let transition = self
            .ledger
            .sweep_run(tenant_id, run_id, now - timeout, now)?;
        if transition.applied() {
            tracing::warn!(run_id = %run_id, tenant_id = %tenant_id, "stale run swept on access");
        }
        settle(transition, tenant_id, run_id)
    }
}

fn settle(transition: Transition, tenant_id: TenantId, run_id: RunId) -> Result<Run, RunError> {
    match transition {
        Transition::Applied(run) => Ok(run),
        Transition::Unchanged(run) => {
            tracing::warn!(
                run_id = %run_id,
                status = run.status.as_str(),
                "run changed before the transition committed; keeping stored state"
            );
            Ok(run)
        }
        Transition::Missing => Err(RunError::run_not_found(tenant_id, run_id)),
    }
}

fn require_actor(actor: &str) -> Result<&str, RunError> {
    ensure_non_empty("actor", actor)
        .map_err(|err| RunError::InvalidTransition(err.to_string()))?;
    Ok(actor.trim())
}

fn apply_intents(
    writer: &dyn MutationWriter,
    ctx: &MutationContext,
    intents: &[MutationIntent],
) -> Result<usize, Vec<String>> {
    let mut errors = Vec::new();
    for (index, intent) in intents.iter().enumerate() {
        let outcome = match intent {
            MutationIntent::CreateRehabTask {
                title,
                category,
                cost_estimate,
                notes,
            } => writer
                .create_rehab_task(
                    ctx,
                    title,
                    category.as_deref(),
                    *cost_estimate,
                    notes.as_deref(),
                )
                .map(|_| ()),
            MutationIntent::UpdateChecklistItemStatus { item_code, status } => {
                writer.update_checklist_item_status(ctx, item_code, status)
            }
            MutationIntent::CreateWorkflowEvent {
                event_type,
                payload,
            } => writer
                .create_workflow_event(ctx, event_type, payload)
                .map(|_| ()),
        };
        if let Err(err) = outcome {
            errors.push(format!(
                "mutations[{index}] {}/{}: {err:#}",
                intent.target().as_str(),
                intent.op().as_str()
            ));
        }
    }
    if errors.is_empty() {
        Ok(intents.len())
    } else {
        Err(errors)
    }
}

/// Run a task function, turning a panic into an ordinary task failure so the
/// run still moves through the retry ladder.
fn run_task(function: &dyn TaskFunction, input: &TaskInput) -> anyhow::Result<TaskOutput> {
    std::panic::catch_unwind(AssertUnwindSafe(|| function.run(input))).unwrap_or_else(|panic| {
        let message = panic
            .downcast_ref::<&str>()
            .map(|text| (*text).to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-text panic payload".to_string());
        Err(anyhow::anyhow!("task function panicked: {message}"))
    })
}
