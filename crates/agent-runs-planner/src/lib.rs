#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use agent_runs_domain::{hash_json, SubjectId, SubjectState, TaskKind, TenantId};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

const FINGERPRINT_HEX_LEN: usize = 32;

/// Workflow stage a subject is in, as far as routing is concerned.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Intake,
    Underwrite,
    Compliance,
    Rehab,
    Tenant,
    Cash,
    Equity,
}

impl Stage {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Intake => "intake",
            Stage::Underwrite => "underwrite",
            Stage::Compliance => "compliance",
            Stage::Rehab => "rehab",
            Stage::Tenant => "tenant",
            Stage::Cash => "cash",
            Stage::Equity => "equity",
        }
    }

    /// Resolve a stage name or alias. Unknown and empty names clamp to intake.
    #[must_use]
    pub fn resolve(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "underwrite" | "rent" | "evaluate" => Stage::Underwrite,
            "compliance" | "inspection" => Stage::Compliance,
            "rehab" => Stage::Rehab,
            "tenant" => Stage::Tenant,
            "cash" => Stage::Cash,
            "equity" => Stage::Equity,
            _ => Stage::Intake,
        }
    }

    #[must_use]
    pub fn routes(self) -> &'static [TaskKind] {
        match self {
            Stage::Intake => &[
                TaskKind::IntakeValidate,
                TaskKind::PublicRecordsCheck,
                TaskKind::PacketBuilder,
            ],
            Stage::Underwrite => &[TaskKind::RentReasonableness, TaskKind::PacketBuilder],
            Stage::Compliance => &[TaskKind::HqsPrecheck, TaskKind::TimelineNudger],
            Stage::Rehab => &[TaskKind::TimelineNudger],
            Stage::Tenant | Stage::Cash | Stage::Equity => &[TaskKind::OpsJudge],
        }
    }
}

#[must_use]
pub fn flag_route(flag: &str) -> Option<TaskKind> {
    match flag {
        "valuation-stale" | "rent-gap" => Some(TaskKind::RentReasonableness),
        "valuation-due" => Some(TaskKind::TimelineNudger),
        "inspection-failed" => Some(TaskKind::HqsPrecheck),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlanInput<'s> {
    pub state: &'s SubjectState,
    pub runs_in_last_hour: u32,
    pub hourly_cap: u32,
    pub plan_version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlannedRun {
    pub tenant_id: TenantId,
    pub subject_id: SubjectId,
    pub task_kind: TaskKind,
    pub payload: Value,
    pub fingerprint: String,
    pub idempotency_key: String,
    pub reason: String,
}

/// Route a subject snapshot to candidate runs.
///
/// Candidates are unique by task kind: stage routes first, then flag routes in
/// sorted flag order. Candidates beyond the hourly cap are dropped.
///
/// # Errors
/// Returns an error if fingerprint material cannot be serialized.
pub fn plan(input: &PlanInput<'_>) -> Result<Vec<PlannedRun>> {
    let state = input.state;
    let stage = Stage::resolve(&state.stage);
    let flags = normalized_flags(&state.flags);

    let mut seen = BTreeSet::new();
    let mut candidates = Vec::new();
    for kind in stage.routes() {
        if seen.insert(*kind) {
            candidates.push((*kind, format!("stage {}", stage.as_str())));
        }
    }
    for flag in &flags {
        if let Some(kind) = flag_route(flag) {
            if seen.insert(kind) {
                candidates.push((kind, format!("flag {flag}")));
            }
        }
    }

    let budget = input.hourly_cap.saturating_sub(input.runs_in_last_hour);
    candidates.truncate(usize::try_from(budget).unwrap_or(usize::MAX));

    candidates
        .into_iter()
        .map(|(task_kind, reason)| {
            let fingerprint =
                fingerprint(input.plan_version, stage, &flags, task_kind, state.subject_id)?;
            Ok(PlannedRun {
                tenant_id: state.tenant_id,
                subject_id: state.subject_id,
                task_kind,
                payload: json!({
                    "stage": stage.as_str(),
                    "flags": flags,
                    "attributes": state.attributes,
                }),
                idempotency_key: format!(
                    "plan:{}:{}:{}:{}",
                    state.tenant_id, state.subject_id, task_kind, fingerprint
                ),
                fingerprint,
                reason,
            })
        })
        .collect()
}

/// Deterministic digest of the routing inputs for one candidate.
///
/// # Errors
/// Returns an error if the hash material cannot be serialized.
pub fn fingerprint(
    plan_version: u32,
    stage: Stage,
    flags: &[String],
    task_kind: TaskKind,
    subject_id: SubjectId,
) -> Result<String> {
    let material = json!({
        "plan_version": plan_version,
        "stage": stage.as_str(),
        "flags": normalized_flags(flags),
        "task_kind": task_kind.as_str(),
        "subject_id": subject_id,
    });
    let mut digest = hash_json(&material)?;
    digest.truncate(FINGERPRINT_HEX_LEN);
    Ok(digest)
}

fn normalized_flags(flags: &[String]) -> Vec<String> {
    flags
        .iter()
        .map(|flag| flag.trim().to_ascii_lowercase())
        .filter(|flag| !flag.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{fingerprint, plan, PlanInput, Stage};
    use agent_runs_domain::{SubjectId, SubjectState, TaskKind, TenantId};
    use proptest::prelude::*;
    use serde_json::Map;

    fn state(stage: &str, flags: &[&str]) -> SubjectState {
        SubjectState {
            tenant_id: TenantId(3),
            subject_id: SubjectId(11),
            stage: stage.to_string(),
            flags: flags.iter().map(|flag| (*flag).to_string()).collect(),
            attributes: Map::new(),
            updated_at: time::OffsetDateTime::UNIX_EPOCH,
        }
    }

    fn kinds(state: &SubjectState, runs_in_last_hour: u32, hourly_cap: u32) -> Vec<TaskKind> {
        let planned = plan(&PlanInput {
            state,
            runs_in_last_hour,
            hourly_cap,
            plan_version: 1,
        });
        assert!(planned.is_ok());
        planned
            .unwrap_or_else(|_| unreachable!())
            .into_iter()
            .map(|run| run.task_kind)
            .collect()
    }

    #[test]
    fn stage_routes_come_before_flag_routes_without_duplicates() {
        let subject = state("inspection", &["rent-gap", "inspection-failed", "unknown"]);
        assert_eq!(
            kinds(&subject, 0, 10),
            vec![
                TaskKind::HqsPrecheck,
                TaskKind::TimelineNudger,
                TaskKind::RentReasonableness,
            ]
        );
    }

    #[test]
    fn unknown_and_empty_stages_clamp_to_intake() {
        assert_eq!(Stage::resolve(""), Stage::Intake);
        assert_eq!(Stage::resolve("closing"), Stage::Intake);
        assert_eq!(Stage::resolve(" Deal "), Stage::Intake);
        assert_eq!(Stage::resolve("EVALUATE"), Stage::Underwrite);
        assert_eq!(kinds(&state("", &[]), 0, 3).len(), 3);
    }

    #[test]
    fn hourly_cap_drops_excess_candidates() {
        let subject = state("intake", &["valuation-due"]);
        assert_eq!(kinds(&subject, 0, 10).len(), 4);
        assert_eq!(
            kinds(&subject, 1, 3),
            vec![TaskKind::IntakeValidate, TaskKind::PublicRecordsCheck]
        );
        assert!(kinds(&subject, 3, 3).is_empty());
        assert!(kinds(&subject, 9, 3).is_empty());
    }

    #[test]
    fn idempotency_key_names_tenant_subject_and_kind() {
        let subject = state("rehab", &[]);
        let planned = plan(&PlanInput {
            state: &subject,
            runs_in_last_hour: 0,
            hourly_cap: 3,
            plan_version: 1,
        });
        assert!(planned.is_ok());
        let planned = planned.unwrap_or_else(|_| unreachable!());
        assert_eq!(planned.len(), 1);
        let run = &planned[0];
        assert_eq!(run.fingerprint.len(), 32);
        assert_eq!(
            run.idempotency_key,
            format!("plan:3:11:timeline-nudger:{}", run.fingerprint)
        );
        assert_eq!(run.payload["stage"], "rehab");
    }

    #[test]
    fn plan_version_changes_the_fingerprint() {
        let flags = vec!["rent-gap".to_string()];
        let v1 = fingerprint(1, Stage::Underwrite, &flags, TaskKind::PacketBuilder, SubjectId(1));
        let v2 = fingerprint(2, Stage::Underwrite, &flags, TaskKind::PacketBuilder, SubjectId(1));
        assert!(v1.is_ok() && v2.is_ok());
        assert_ne!(
            v1.unwrap_or_else(|_| unreachable!()),
            v2.unwrap_or_else(|_| unreachable!())
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_fingerprint_ignores_flag_order_and_duplicates(
            flags in prop::collection::vec(
                prop::sample::select(vec![
                    "rent-gap",
                    "valuation-due",
                    "valuation-stale",
                    "inspection-failed",
                    "lease-expiring",
                ]),
                0..8,
            ),
            seed in any::<u64>(),
        ) {
            let forward: Vec<String> = flags.iter().map(|flag| (*flag).to_string()).collect();
            let mut shuffled = forward.clone();
            shuffled.reverse();
            let rotate_by = usize::try_from(seed).unwrap_or(0) % shuffled.len().max(1);
            shuffled.rotate_left(rotate_by);
            if let Some(first) = forward.first() {
                shuffled.push(first.clone());
            }

            let a = fingerprint(1, Stage::Compliance, &forward, TaskKind::HqsPrecheck, SubjectId(5));
            let b = fingerprint(1, Stage::Compliance, &shuffled, TaskKind::HqsPrecheck, SubjectId(5));
            prop_assert!(a.is_ok() && b.is_ok());
            prop_assert_eq!(a.unwrap_or_else(|_| unreachable!()), b.unwrap_or_else(|_| unreachable!()));
        }
    }
}
