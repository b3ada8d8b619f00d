use std::collections::BTreeMap;

use agent_runs_domain::{
    MutationOp, MutationTarget, ProposedMutation, SubjectId, TaskKind, TaskOutput, TenantId,
};
use anyhow::{anyhow, Result};
use serde_json::{json, Map, Value};

/// What a task function sees: the run's tenant, subject and stored input.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskInput {
    pub tenant_id: TenantId,
    pub subject_id: Option<SubjectId>,
    pub payload: Value,
}

impl TaskInput {
    /// Look a key up in `payload.attributes`, then at the top level of the payload.
    #[must_use]
    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.payload
            .get("attributes")
            .and_then(|attributes| attributes.get(key))
            .or_else(|| self.payload.get(key))
            .filter(|value| !value.is_null())
    }

    #[must_use]
    pub fn flags(&self) -> Vec<String> {
        self.payload
            .get("flags")
            .and_then(Value::as_array)
            .map(|flags| {
                flags
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn number(&self, key: &str) -> Option<f64> {
        self.attribute(key).and_then(Value::as_f64)
    }

    fn text(&self, key: &str) -> Option<&str> {
        self.attribute(key)
            .and_then(Value::as_str)
            .filter(|value| !value.trim().is_empty())
    }
}

pub trait TaskFunction: Send + Sync {
    fn name(&self) -> &'static str;

    #[allow(clippy::missing_errors_doc)]
    fn run(&self, input: &TaskInput) -> Result<TaskOutput>;
}

/// Adapts a closure into a [`TaskFunction`].
pub struct FnTask<F> {
    name: &'static str,
    function: F,
}

impl<F> FnTask<F>
where
    F: Fn(&TaskInput) -> Result<TaskOutput> + Send + Sync,
{
    pub fn new(name: &'static str, function: F) -> Self {
        Self { name, function }
    }
}

impl<F> TaskFunction for FnTask<F>
where
    F: Fn(&TaskInput) -> Result<TaskOutput> + Send + Sync,
{
    fn name(&self) -> &'static str {
        self.name
    }

    fn run(&self, input: &TaskInput) -> Result<TaskOutput> {
        (self.function)(input)
    }
}

/// Task functions keyed by the closed set of task kinds.
#[derive(Default)]
pub struct TaskRegistry {
    functions: BTreeMap<TaskKind, Box<dyn TaskFunction>>,
}

impl TaskRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with a deterministic function for every task kind.
    #[must_use]
    pub fn builtin() -> Self {
        let mut functions: BTreeMap<TaskKind, Box<dyn TaskFunction>> = BTreeMap::new();
        functions.insert(TaskKind::IntakeValidate, Box::new(IntakeValidate));
        functions.insert(TaskKind::PublicRecordsCheck, Box::new(PublicRecordsCheck));
        functions.insert(TaskKind::RentReasonableness, Box::new(RentReasonableness));
        functions.insert(TaskKind::PacketBuilder, Box::new(PacketBuilder));
        functions.insert(TaskKind::HqsPrecheck, Box::new(HqsPrecheck));
        functions.insert(TaskKind::TimelineNudger, Box::new(TimelineNudger));
        functions.insert(TaskKind::OpsJudge, Box::new(OpsJudge));
        Self { functions }
    }

    /// # Errors
    /// Returns an error when `kind` already has a function.
    pub fn register(&mut self, kind: TaskKind, function: Box<dyn TaskFunction>) -> Result<()> {
        if self.functions.contains_key(&kind) {
            return Err(anyhow!("task kind {kind} is already registered"));
        }
        self.functions.insert(kind, function);
        Ok(())
    }

    /// # Errors
    /// Returns an error when `key` is not a known task kind or is already registered.
    pub fn register_key(&mut self, key: &str, function: Box<dyn TaskFunction>) -> Result<()> {
        let kind = TaskKind::parse(key).ok_or_else(|| anyhow!("unknown task kind: {key}"))?;
        self.register(kind, function)
    }

    #[must_use]
    pub fn get(&self, kind: TaskKind) -> Option<&dyn TaskFunction> {
        self.functions.get(&kind).map(|function| &**function)
    }

    pub fn kinds(&self) -> impl Iterator<Item = TaskKind> + '_ {
        self.functions.keys().copied()
    }
}

const INTAKE_FIELDS: [&str; 4] = ["address", "asking_price", "bedrooms", "seller_contact"];
const PACKET_DOCUMENTS: [&str; 4] = [
    "purchase_agreement",
    "inspection_report",
    "rent_roll",
    "insurance_quote",
];

struct IntakeValidate;

impl TaskFunction for IntakeValidate {
    fn name(&self) -> &'static str {
        "builtin.intake-validate"
    }

    fn run(&self, input: &TaskInput) -> Result<TaskOutput> {
        let missing: Vec<&str> = INTAKE_FIELDS
            .into_iter()
            .filter(|field| input.attribute(field).is_none())
            .collect();

        let mut facts = Map::new();
        facts.insert("missing_fields".to_string(), json!(missing));
        facts.insert("complete".to_string(), json!(missing.is_empty()));

        Ok(TaskOutput {
            summary: if missing.is_empty() {
                "intake record is complete".to_string()
            } else {
                format!("intake record is missing {} field(s)", missing.len())
            },
            facts,
            proposed_mutations: Vec::new(),
            recommendations: missing
                .iter()
                .map(|field| format!("collect {field} before underwriting"))
                .collect(),
        })
    }
}

struct PublicRecordsCheck;

impl TaskFunction for PublicRecordsCheck {
    fn name(&self) -> &'static str {
        "builtin.public-records-check"
    }

    fn run(&self, input: &TaskInput) -> Result<TaskOutput> {
        let parcel = input.text("parcel_id");
        let owner = input.text("owner_name");
        let seller = input.text("seller_name");

        let mut recommendations = Vec::new();
        if parcel.is_none() {
            recommendations.push("look up the parcel id with the county assessor".to_string());
        }
        if owner.is_none() {
            recommendations.push("pull the deed to confirm the owner of record".to_string());
        }
        let owner_matches = match (owner, seller) {
            (Some(owner), Some(seller)) => Some(owner.eq_ignore_ascii_case(seller)),
            _ => None,
        };
        if owner_matches == Some(false) {
            recommendations.push("seller is not the owner of record; verify authority to sell".to_string());
        }

        let mut facts = Map::new();
        facts.insert("parcel_present".to_string(), json!(parcel.is_some()));
        facts.insert("owner_present".to_string(), json!(owner.is_some()));
        facts.insert("owner_matches_seller".to_string(), json!(owner_matches));

        Ok(TaskOutput {
            summary: format!(
                "public records check found {} issue(s)",
                recommendations.len()
            ),
            facts,
            proposed_mutations: Vec::new(),
            recommendations,
        })
    }
}

struct RentReasonableness;

impl TaskFunction for RentReasonableness {
    fn name(&self) -> &'static str {
        "builtin.rent-reasonableness"
    }

    fn run(&self, input: &TaskInput) -> Result<TaskOutput> {
        let mut comps: Vec<f64> = input
            .attribute("comparable_rents")
            .and_then(Value::as_array)
            .map(|values| values.iter().filter_map(Value::as_f64).collect())
            .unwrap_or_default();
        comps.sort_by(f64::total_cmp);
        let asking = input.number("asking_rent");

        let mut facts = Map::new();
        facts.insert("comparables".to_string(), json!(comps.len()));
        facts.insert("asking_rent".to_string(), json!(asking));

        let Some(median) = median(&comps) else {
            return Ok(TaskOutput {
                summary: "no comparable rents available".to_string(),
                facts,
                proposed_mutations: Vec::new(),
                recommendations: vec!["gather at least three comparable rents".to_string()],
            });
        };
        facts.insert("median_comparable_rent".to_string(), json!(median));

        let Some(asking) = asking else {
            return Ok(TaskOutput {
                summary: format!("median comparable rent is {median:.0}"),
                facts,
                proposed_mutations: Vec::new(),
                recommendations: vec!["record the asking rent to compare".to_string()],
            });
        };

        let ratio = asking / median;
        facts.insert("ratio_to_median".to_string(), json!(ratio));
        let mut recommendations = Vec::new();
        if ratio > 1.1 {
            recommendations.push(format!(
                "asking rent is {:.0}% above the comparable median; expect a reasonableness challenge",
                (ratio - 1.0) * 100.0
            ));
        } else if ratio < 0.9 {
            recommendations.push(format!(
                "asking rent is {:.0}% below the comparable median; consider raising it",
                (1.0 - ratio) * 100.0
            ));
        }

        Ok(TaskOutput {
            summary: format!("asking rent {asking:.0} vs comparable median {median:.0}"),
            facts,
            proposed_mutations: Vec::new(),
            recommendations,
        })
    }
}

fn median(sorted: &[f64]) -> Option<f64> {
    let mid = sorted.len() / 2;
    match sorted.len() {
        0 => None,
        len if len % 2 == 0 => Some((sorted[mid - 1] + sorted[mid]) / 2.0),
        _ => Some(sorted[mid]),
    }
}

struct PacketBuilder;

impl TaskFunction for PacketBuilder {
    fn name(&self) -> &'static str {
        "builtin.packet-builder"
    }

    fn run(&self, input: &TaskInput) -> Result<TaskOutput> {
        let present: Vec<&str> = input
            .attribute("documents")
            .and_then(Value::as_array)
            .map(|docs| docs.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        let missing: Vec<&str> = PACKET_DOCUMENTS
            .into_iter()
            .filter(|doc| !present.contains(doc))
            .collect();

        let mut facts = Map::new();
        facts.insert("documents_present".to_string(), json!(present));
        facts.insert("documents_missing".to_string(), json!(missing));

        Ok(TaskOutput {
            summary: format!(
                "packet has {} of {} required documents",
                PACKET_DOCUMENTS.len() - missing.len(),
                PACKET_DOCUMENTS.len()
            ),
            facts,
            proposed_mutations: Vec::new(),
            recommendations: missing
                .iter()
                .map(|doc| format!("attach {doc} to the packet"))
                .collect(),
        })
    }
}

struct TimelineNudger;

impl TaskFunction for TimelineNudger {
    fn name(&self) -> &'static str {
        "builtin.timeline-nudger"
    }

    fn run(&self, input: &TaskInput) -> Result<TaskOutput> {
        let stage = input
            .payload
            .get("stage")
            .and_then(Value::as_str)
            .unwrap_or("intake");
        let age_days = input.number("stage_age_days");

        let (urgency, recommendations) = match age_days {
            Some(days) if days > 30.0 => (
                "overdue",
                vec![format!("{stage} has been open {days:.0} days; escalate to the owner")],
            ),
            Some(days) if days > 14.0 => (
                "nudge",
                vec![format!("{stage} has been open {days:.0} days; send a reminder")],
            ),
            Some(_) => ("on_track", Vec::new()),
            None => (
                "unknown",
                vec!["record when the current stage started".to_string()],
            ),
        };

        let mut facts = Map::new();
        facts.insert("stage".to_string(), json!(stage));
        facts.insert("stage_age_days".to_string(), json!(age_days));
        facts.insert("urgency".to_string(), json!(urgency));

        Ok(TaskOutput {
            summary: format!("{stage} timeline is {urgency}"),
            facts,
            proposed_mutations: Vec::new(),
            recommendations,
        })
    }
}

struct OpsJudge;

impl TaskFunction for OpsJudge {
    fn name(&self) -> &'static str {
        "builtin.ops-judge"
    }

    fn run(&self, input: &TaskInput) -> Result<TaskOutput> {
        let flags = input.flags();
        let mut facts = Map::new();
        facts.insert("open_flags".to_string(), json!(flags));

        Ok(TaskOutput {
            summary: if flags.is_empty() {
                "no open flags".to_string()
            } else {
                format!("{} open flag(s) need an owner", flags.len())
            },
            facts,
            proposed_mutations: Vec::new(),
            recommendations: flags
                .iter()
                .map(|flag| format!("assign an owner and a due date for {flag}"))
                .collect(),
        })
    }
}

/// Proposes a rehab task per failed inspection item plus one workflow event
/// summarizing the precheck.
struct HqsPrecheck;

impl TaskFunction for HqsPrecheck {
    fn name(&self) -> &'static str {
        "builtin.hqs-precheck"
    }

    fn run(&self, input: &TaskInput) -> Result<TaskOutput> {
        let items = match input.attribute("inspection_items") {
            None => Vec::new(),
            Some(Value::Array(items)) => items.clone(),
            Some(other) => {
                return Err(anyhow!(
                    "inspection_items must be an array, got {}",
                    json_kind(other)
                ))
            }
        };

        let mut failed_codes = Vec::new();
        let mut mutations = Vec::new();
        for item in &items {
            let result = item.get("result").and_then(Value::as_str).unwrap_or("pass");
            if !result.eq_ignore_ascii_case("fail") {
                continue;
            }
            let code = item
                .get("code")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            let description = item
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("failed inspection item");
            failed_codes.push(code.to_string());
            mutations.push(
                ProposedMutation::new(
                    MutationTarget::RehabTask,
                    MutationOp::Create,
                    json!({
                        "title": format!("Repair {code}: {description}"),
                        "category": "hqs",
                        "cost_estimate": item.get("cost_estimate").and_then(Value::as_f64),
                        "notes": item.get("notes").and_then(Value::as_str),
                    }),
                )
                .with_reason(format!("inspection item {code} failed")),
            );
        }

        if !failed_codes.is_empty() {
            mutations.push(
                ProposedMutation::new(
                    MutationTarget::WorkflowEvent,
                    MutationOp::Create,
                    json!({
                        "event_type": "hqs_precheck_failed",
                        "payload": { "failed_items": failed_codes },
                    }),
                )
                .with_reason("record the precheck outcome on the subject timeline"),
            );
        }

        let mut facts = Map::new();
        facts.insert("items_checked".to_string(), json!(items.len()));
        facts.insert("failed_items".to_string(), json!(failed_codes));

        Ok(TaskOutput {
            summary: format!(
                "hqs precheck: {} of {} item(s) failed",
                failed_codes.len(),
                items.len()
            ),
            facts,
            proposed_mutations: mutations,
            recommendations: if failed_codes.is_empty() {
                vec!["schedule the HQS inspection".to_string()]
            } else {
                vec!["approve the proposed rehab tasks before scheduling the inspection".to_string()]
            },
        })
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::{FnTask, TaskInput, TaskRegistry};
    use agent_runs_contract::ContractRegistry;
    use agent_runs_domain::{SubjectId, TaskKind, TaskOutput, TenantId};
    use serde_json::{json, Value};

    fn input(payload: Value) -> TaskInput {
        TaskInput {
            tenant_id: TenantId(1),
            subject_id: Some(SubjectId(2)),
            payload,
        }
    }

    fn run(kind: TaskKind, payload: Value) -> TaskOutput {
        let registry = TaskRegistry::builtin();
        let function = registry.get(kind);
        assert!(function.is_some());
        let output = function
            .unwrap_or_else(|| unreachable!())
            .run(&input(payload));
        assert!(output.is_ok());
        output.unwrap_or_else(|_| unreachable!())
    }

    #[test]
    fn registration_rejects_duplicates_and_unknown_keys() {
        let mut registry = TaskRegistry::new();
        let ok = registry.register(
            TaskKind::OpsJudge,
            Box::new(FnTask::new("first", |_: &TaskInput| Ok(TaskOutput::default()))),
        );
        assert!(ok.is_ok());
        let duplicate = registry.register_key(
            "ops-judge",
            Box::new(FnTask::new("second", |_: &TaskInput| Ok(TaskOutput::default()))),
        );
        assert!(duplicate.is_err());
        let unknown = registry.register_key(
            "deal_intake",
            Box::new(FnTask::new("third", |_: &TaskInput| Ok(TaskOutput::default()))),
        );
        assert!(unknown.is_err_and(|err| err.to_string().contains("unknown task kind")));
        assert_eq!(registry.kinds().collect::<Vec<_>>(), vec![TaskKind::OpsJudge]);
    }

    #[test]
    fn every_builtin_output_satisfies_the_builtin_contracts() {
        let contracts = ContractRegistry::builtin();
        let payload = json!({
            "stage": "compliance",
            "flags": ["rent-gap"],
            "attributes": {
                "comparable_rents": [1200, 1300, 1250],
                "asking_rent": 1500,
                "inspection_items": [
                    {"code": "smoke-detector", "result": "fail", "cost_estimate": 40.0},
                    {"code": "handrail", "result": "pass"}
                ]
            }
        });
        for kind in TaskKind::ALL {
            let output = run(kind, payload.clone());
            let validation = contracts.validate_output(kind, &output);
            assert!(validation.ok(), "{kind}: {:?}", validation.violations);
        }
    }

    #[test]
    fn hqs_precheck_proposes_tasks_for_failed_items_only() {
        let output = run(
            TaskKind::HqsPrecheck,
            json!({"attributes": {"inspection_items": [
                {"code": "gfci", "description": "kitchen outlet", "result": "FAIL"},
                {"code": "window", "result": "pass"},
                {"code": "stairs", "result": "fail"}
            ]}}),
        );
        assert_eq!(output.proposed_mutations.len(), 3);
        assert_eq!(output.proposed_mutations[0].target, "rehab_task");
        assert_eq!(
            output.proposed_mutations[0].payload["title"],
            "Repair gfci: kitchen outlet"
        );
        assert_eq!(output.proposed_mutations[2].target, "workflow_event");

        let clean = run(TaskKind::HqsPrecheck, json!({"attributes": {}}));
        assert!(clean.proposed_mutations.is_empty());
    }

    #[test]
    fn hqs_precheck_errors_on_malformed_items() {
        let registry = TaskRegistry::builtin();
        let function = registry.get(TaskKind::HqsPrecheck);
        assert!(function.is_some());
        let output = function
            .unwrap_or_else(|| unreachable!())
            .run(&input(json!({"inspection_items": "all good"})));
        assert!(output.is_err());
    }

    #[test]
    fn rent_reasonableness_flags_high_asking_rent() {
        let output = run(
            TaskKind::RentReasonableness,
            json!({"attributes": {"comparable_rents": [1000, 1100, 1200, 1300], "asking_rent": 1500}}),
        );
        assert_eq!(output.facts["median_comparable_rent"], json!(1150.0));
        assert_eq!(output.recommendations.len(), 1);
        assert!(output.recommendations[0].contains("above"));
    }
}
