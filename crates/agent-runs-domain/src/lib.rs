#![forbid(unsafe_code)]

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

pub type DateTimeUtc = OffsetDateTime;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RunId(pub Ulid);

impl RunId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse a run identifier from its ULID text form.
    ///
    /// # Errors
    /// Returns an error when the input is not a valid ULID.
    pub fn parse(value: &str) -> Result<Self> {
        let ulid = Ulid::from_string(value).map_err(|err| anyhow!("invalid run_id ULID: {err}"))?;
        Ok(Self(ulid))
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct TenantId(pub i64);

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct SubjectId(pub i64);

impl std::fmt::Display for SubjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Closed set of automated task kinds a run can execute.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    IntakeValidate,
    PublicRecordsCheck,
    RentReasonableness,
    PacketBuilder,
    HqsPrecheck,
    TimelineNudger,
    OpsJudge,
}

impl TaskKind {
    pub const ALL: [TaskKind; 7] = [
        TaskKind::IntakeValidate,
        TaskKind::PublicRecordsCheck,
        TaskKind::RentReasonableness,
        TaskKind::PacketBuilder,
        TaskKind::HqsPrecheck,
        TaskKind::TimelineNudger,
        TaskKind::OpsJudge,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::IntakeValidate => "intake-validate",
            TaskKind::PublicRecordsCheck => "public-records-check",
            TaskKind::RentReasonableness => "rent-reasonableness",
            TaskKind::PacketBuilder => "packet-builder",
            TaskKind::HqsPrecheck => "hqs-precheck",
            TaskKind::TimelineNudger => "timeline-nudger",
            TaskKind::OpsJudge => "ops-judge",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value.trim())
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Blocked,
    Done,
    Failed,
}

impl RunStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Blocked => "blocked",
            RunStatus::Done => "done",
            RunStatus::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(RunStatus::Queued),
            "running" => Some(RunStatus::Running),
            "blocked" => Some(RunStatus::Blocked),
            "done" => Some(RunStatus::Done),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }

    /// Done and failed are sinks; nothing moves a run out of them.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Done | RunStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    NotRequired,
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ApprovalStatus::NotRequired => "not_required",
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "not_required" => Some(ApprovalStatus::NotRequired),
            "pending" => Some(ApprovalStatus::Pending),
            "approved" => Some(ApprovalStatus::Approved),
            "rejected" => Some(ApprovalStatus::Rejected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MutationTarget {
    RehabTask,
    ChecklistItem,
    WorkflowEvent,
}

impl MutationTarget {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            MutationTarget::RehabTask => "rehab_task",
            MutationTarget::ChecklistItem => "checklist_item",
            MutationTarget::WorkflowEvent => "workflow_event",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "rehab_task" => Some(MutationTarget::RehabTask),
            "checklist_item" => Some(MutationTarget::ChecklistItem),
            "workflow_event" => Some(MutationTarget::WorkflowEvent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MutationOp {
    Create,
    UpdateStatus,
}

impl MutationOp {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            MutationOp::Create => "create",
            MutationOp::UpdateStatus => "update_status",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "create" => Some(MutationOp::Create),
            "update_status" => Some(MutationOp::UpdateStatus),
            _ => None,
        }
    }
}

/// A mutation exactly as a task function proposed it.
///
/// Target and operation stay textual so an unknown pair can be reported as a
/// contract violation instead of failing deserialization.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProposedMutation {
    pub target: String,
    pub op: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ProposedMutation {
    #[must_use]
    pub fn new(target: MutationTarget, op: MutationOp, payload: Value) -> Self {
        Self {
            target: target.as_str().to_string(),
            op: op.as_str().to_string(),
            payload,
            reason: None,
        }
    }

    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// A proposed mutation after contract validation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "intent", rename_all = "snake_case")]
pub enum MutationIntent {
    CreateRehabTask {
        title: String,
        category: Option<String>,
        cost_estimate: Option<f64>,
        notes: Option<String>,
    },
    UpdateChecklistItemStatus {
        item_code: String,
        status: String,
    },
    CreateWorkflowEvent {
        event_type: String,
        payload: Value,
    },
}

impl MutationIntent {
    #[must_use]
    pub fn target(&self) -> MutationTarget {
        match self {
            MutationIntent::CreateRehabTask { .. } => MutationTarget::RehabTask,
            MutationIntent::UpdateChecklistItemStatus { .. } => MutationTarget::ChecklistItem,
            MutationIntent::CreateWorkflowEvent { .. } => MutationTarget::WorkflowEvent,
        }
    }

    #[must_use]
    pub fn op(&self) -> MutationOp {
        match self {
            MutationIntent::CreateRehabTask { .. } | MutationIntent::CreateWorkflowEvent { .. } => {
                MutationOp::Create
            }
            MutationIntent::UpdateChecklistItemStatus { .. } => MutationOp::UpdateStatus,
        }
    }
}

/// What a task function returns.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TaskOutput {
    pub summary: String,
    #[serde(default)]
    pub facts: Map<String, Value>,
    #[serde(default)]
    pub proposed_mutations: Vec<ProposedMutation>,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Run {
    pub run_id: RunId,
    pub tenant_id: TenantId,
    pub task_kind: TaskKind,
    pub subject_id: Option<SubjectId>,
    pub status: RunStatus,
    pub approval_status: ApprovalStatus,
    pub idempotency_key: Option<String>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub input: Value,
    pub proposed_mutations: Option<Vec<ProposedMutation>>,
    pub output: Option<Value>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: DateTimeUtc,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<DateTimeUtc>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub heartbeat_at: Option<DateTimeUtc>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub finished_at: Option<DateTimeUtc>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub next_attempt_at: Option<DateTimeUtc>,
    pub decided_by: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub decided_at: Option<DateTimeUtc>,
}

impl Run {
    /// A queued run is due once its retry backoff has elapsed.
    #[must_use]
    pub fn is_due(&self, now: DateTimeUtc) -> bool {
        self.next_attempt_at.map_or(true, |at| at <= now)
    }

    /// A running run whose last heartbeat is older than `timeout` is stuck.
    #[must_use]
    pub fn is_stale(&self, now: DateTimeUtc, timeout: time::Duration) -> bool {
        if self.status != RunStatus::Running {
            return false;
        }
        let last_seen = self.heartbeat_at.or(self.started_at).unwrap_or(self.created_at);
        now - last_seen > timeout
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewRun {
    pub tenant_id: TenantId,
    pub task_kind: TaskKind,
    pub subject_id: Option<SubjectId>,
    pub input: Value,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RunEventType {
    RunSubmitted,
    RunStarted,
    RunRetryScheduled,
    RunFinished,
    RunBlocked,
    RunApproved,
    RunRejected,
    RunFailed,
    RunSwept,
    MutationsApplied,
    MutationsApplyFailed,
}

impl RunEventType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            RunEventType::RunSubmitted => "run_submitted",
            RunEventType::RunStarted => "run_started",
            RunEventType::RunRetryScheduled => "run_retry_scheduled",
            RunEventType::RunFinished => "run_finished",
            RunEventType::RunBlocked => "run_blocked",
            RunEventType::RunApproved => "run_approved",
            RunEventType::RunRejected => "run_rejected",
            RunEventType::RunFailed => "run_failed",
            RunEventType::RunSwept => "run_swept",
            RunEventType::MutationsApplied => "mutations_applied",
            RunEventType::MutationsApplyFailed => "mutations_apply_failed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "run_submitted" => Some(RunEventType::RunSubmitted),
            "run_started" => Some(RunEventType::RunStarted),
            "run_retry_scheduled" => Some(RunEventType::RunRetryScheduled),
            "run_finished" => Some(RunEventType::RunFinished),
            "run_blocked" => Some(RunEventType::RunBlocked),
            "run_approved" => Some(RunEventType::RunApproved),
            "run_rejected" => Some(RunEventType::RunRejected),
            "run_failed" => Some(RunEventType::RunFailed),
            "run_swept" => Some(RunEventType::RunSwept),
            "mutations_applied" => Some(RunEventType::MutationsApplied),
            "mutations_apply_failed" => Some(RunEventType::MutationsApplyFailed),
            _ => None,
        }
    }
}

/// An audit event before it is chained onto the run's log.
#[derive(Debug, Clone, PartialEq)]
pub struct EventDraft {
    pub event_type: RunEventType,
    pub actor: String,
    pub payload: Value,
}

impl EventDraft {
    #[must_use]
    pub fn new(event_type: RunEventType, actor: &str, payload: Value) -> Self {
        Self {
            event_type,
            actor: actor.to_string(),
            payload,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RunEvent {
    pub event_id: Ulid,
    pub run_id: RunId,
    pub tenant_id: TenantId,
    pub event_type: RunEventType,
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_at: DateTimeUtc,
    pub actor: String,
    pub payload: Value,
    pub payload_hash: String,
    pub prev_event_hash: Option<String>,
    pub event_hash: String,
}

impl RunEvent {
    /// Chain a draft onto a run's log after `prev_event_hash`.
    ///
    /// # Errors
    /// Returns an error if the payload or hash material cannot be serialized.
    pub fn seal(
        run_id: RunId,
        tenant_id: TenantId,
        draft: EventDraft,
        occurred_at: DateTimeUtc,
        prev_event_hash: Option<String>,
    ) -> Result<Self> {
        let payload_hash = hash_json(&draft.payload)?;
        let mut event = Self {
            event_id: Ulid::new(),
            run_id,
            tenant_id,
            event_type: draft.event_type,
            occurred_at,
            actor: draft.actor,
            payload: draft.payload,
            payload_hash,
            prev_event_hash,
            event_hash: String::new(),
        };
        event.event_hash = compute_event_hash(&event)?;
        Ok(event)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct EventRow {
    pub event_seq: i64,
    pub event: RunEvent,
}

/// Per-subject workflow snapshot the planner routes on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubjectState {
    pub tenant_id: TenantId,
    pub subject_id: SubjectId,
    pub stage: String,
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: DateTimeUtc,
}

/// Why the concurrency guard refused to start a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "refusal", rename_all = "snake_case")]
pub enum AdmissionRefusal {
    TenantCap {
        tenant_id: TenantId,
        running: u32,
        cap: u32,
    },
    TaskKindLocked {
        tenant_id: TenantId,
        task_kind: TaskKind,
    },
}

impl std::fmt::Display for AdmissionRefusal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdmissionRefusal::TenantCap {
                tenant_id,
                running,
                cap,
            } => write!(
                f,
                "tenant {tenant_id} already has {running} running runs (cap {cap})"
            ),
            AdmissionRefusal::TaskKindLocked {
                tenant_id,
                task_kind,
            } => write!(f, "task kind {task_kind} is locked for tenant {tenant_id}"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("contract_violation: {}", .0.join("; "))]
    ContractViolation(Vec<String>),
    #[error("concurrency_limit: {0}")]
    ConcurrencyLimit(AdmissionRefusal),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("execution_error: {0}")]
    Execution(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("apply_failure: {}", .0.join("; "))]
    ApplyFailure(Vec<String>),
    #[error("invalid_transition: {0}")]
    InvalidTransition(String),
    #[error("configuration_error: {0}")]
    Configuration(String),
    #[error("store_error: {0:#}")]
    Store(#[from] anyhow::Error),
}

impl RunError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            RunError::ContractViolation(_) => "contract_violation",
            RunError::ConcurrencyLimit(_) => "concurrency_limit",
            RunError::NotFound(_) => "not_found",
            RunError::Execution(_) => "execution_error",
            RunError::Timeout(_) => "timeout",
            RunError::ApplyFailure(_) => "apply_failure",
            RunError::InvalidTransition(_) => "invalid_transition",
            RunError::Configuration(_) => "configuration_error",
            RunError::Store(_) => "store_error",
        }
    }

    /// Only admission refusals leave the run queued for a later attempt.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, RunError::ConcurrencyLimit(_))
    }

    #[must_use]
    pub fn run_not_found(tenant_id: TenantId, run_id: RunId) -> Self {
        RunError::NotFound(format!("run {run_id} not found for tenant {tenant_id}"))
    }
}

#[must_use]
pub fn now_utc() -> DateTimeUtc {
    OffsetDateTime::now_utc()
}

#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Hash a JSON value with stable `serde_json` serialization + SHA-256.
///
/// # Errors
/// Returns an error if JSON serialization fails.
pub fn hash_json(value: &Value) -> Result<String> {
    let bytes = serde_json::to_vec(value)?;
    Ok(hash_bytes(&bytes))
}

/// Ensure a string field is non-empty after trimming.
///
/// # Errors
/// Returns an error when the provided value is empty/whitespace.
pub fn ensure_non_empty(field_name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(anyhow!("{field_name} MUST be non-empty"));
    }
    Ok(())
}

/// Stored timestamps: UTC with a fixed nanosecond fraction, so text order is
/// time order and SQL can compare them directly.
const STORED_TIMESTAMP: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:9]Z");

/// Format a timestamp as fixed-width UTC RFC 3339.
///
/// # Errors
/// Returns an error when the timestamp cannot be represented.
pub fn rfc3339(value: DateTimeUtc) -> Result<String> {
    value
        .to_offset(UtcOffset::UTC)
        .format(STORED_TIMESTAMP)
        .map_err(|err| anyhow!("invalid datetime format: {err}"))
}

/// Parse an RFC 3339 timestamp.
///
/// # Errors
/// Returns an error when the input is not RFC 3339.
pub fn parse_rfc3339(value: &str) -> Result<DateTimeUtc> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| anyhow!("invalid RFC3339 datetime: {err}"))
}

/// Compute the chained hash of an audit event, excluding its own hash field.
///
/// # Errors
/// Returns an error if the hash material cannot be serialized.
pub fn compute_event_hash(event: &RunEvent) -> Result<String> {
    let material = json!({
        "event_id": event.event_id,
        "run_id": event.run_id,
        "tenant_id": event.tenant_id,
        "event_type": event.event_type,
        "occurred_at": rfc3339(event.occurred_at)?,
        "actor": event.actor,
        "payload_hash": event.payload_hash,
        "prev_event_hash": event.prev_event_hash,
    });
    hash_json(&material)
}

/// Verify links and hashes of one run's events in sequence order.
///
/// # Errors
/// Returns an error if an event cannot be re-hashed.
pub fn verify_event_chain(events: &[EventRow]) -> Result<bool> {
    let mut prev: Option<&str> = None;
    for row in events {
        if row.event.prev_event_hash.as_deref() != prev {
            return Ok(false);
        }
        if hash_json(&row.event.payload)? != row.event.payload_hash {
            return Ok(false);
        }
        if compute_event_hash(&row.event)? != row.event.event_hash {
            return Ok(false);
        }
        prev = Some(row.event.event_hash.as_str());
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::{
        parse_rfc3339, rfc3339, verify_event_chain, EventDraft, EventRow, RunError, RunEvent,
        RunEventType, RunId, RunStatus, TaskKind, TenantId,
    };
    use serde_json::json;

    fn chain(len: usize) -> Vec<EventRow> {
        let run_id = RunId::new();
        let mut prev = None;
        let mut rows = Vec::new();
        for seq in 0..len {
            let event = RunEvent::seal(
                run_id,
                TenantId(1),
                EventDraft::new(RunEventType::RunStarted, "test", json!({"seq": seq})),
                time::OffsetDateTime::now_utc(),
                prev.clone(),
            );
            assert!(event.is_ok());
            let event = event.unwrap_or_else(|_| unreachable!());
            prev = Some(event.event_hash.clone());
            rows.push(EventRow {
                event_seq: i64::try_from(seq).unwrap_or(i64::MAX) + 1,
                event,
            });
        }
        rows
    }

    #[test]
    fn task_kind_round_trips_through_text_and_serde() {
        for kind in TaskKind::ALL {
            assert_eq!(TaskKind::parse(kind.as_str()), Some(kind));
            let encoded = serde_json::to_value(kind);
            assert!(encoded.is_ok());
            assert_eq!(
                encoded.unwrap_or_else(|_| unreachable!()),
                json!(kind.as_str())
            );
        }
        assert_eq!(TaskKind::parse("deal_intake"), None);
    }

    #[test]
    fn stored_timestamps_sort_as_text_in_time_order() {
        let whole = time::OffsetDateTime::from_unix_timestamp(1_760_000_000);
        assert!(whole.is_ok());
        let whole = whole.unwrap_or_else(|_| unreachable!());
        let later = whole + time::Duration::milliseconds(5);
        let east = time::UtcOffset::from_hms(2, 0, 0).unwrap_or(time::UtcOffset::UTC);
        let offset = whole.to_offset(east);

        let texts: Vec<String> = [whole, later, offset]
            .into_iter()
            .map(|value| rfc3339(value).unwrap_or_default())
            .collect();
        assert_eq!(texts[0], "2025-10-09T08:53:20.000000000Z");
        assert_eq!(texts[0].len(), texts[1].len());
        assert!(texts[0] < texts[1]);
        assert_eq!(texts[0], texts[2]);

        let parsed = parse_rfc3339(&texts[1]);
        assert!(parsed.is_ok());
        assert_eq!(parsed.unwrap_or_else(|_| unreachable!()), later);
    }

    #[test]
    fn only_done_and_failed_are_terminal() {
        assert!(RunStatus::Done.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(!RunStatus::Blocked.is_terminal());
        assert!(!RunStatus::Queued.is_terminal());
    }

    #[test]
    fn sealed_chain_verifies_and_detects_tampering() {
        let rows = chain(4);
        assert!(matches!(verify_event_chain(&rows), Ok(true)));

        let mut tampered = rows.clone();
        tampered[2].event.payload = json!({"seq": 99});
        assert!(matches!(verify_event_chain(&tampered), Ok(false)));

        let mut relinked = rows;
        relinked.remove(1);
        assert!(matches!(verify_event_chain(&relinked), Ok(false)));
    }

    #[test]
    fn error_codes_prefix_rendered_messages() {
        let err = RunError::ContractViolation(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(err.to_string(), "contract_violation: a; b");
        assert!(err.to_string().starts_with(err.code()));
        assert!(!err.is_retryable());
    }
}
