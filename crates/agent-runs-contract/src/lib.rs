#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use agent_runs_domain::{
    MutationIntent, MutationOp, MutationTarget, ProposedMutation, TaskKind, TaskOutput,
};
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ContractMode {
    AdvisoryOnly,
    ApprovalRequired,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd)]
pub struct AllowedMutation {
    pub target: MutationTarget,
    pub op: MutationOp,
}

/// Side-effect policy for one task kind.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CapabilityContract {
    pub mode: ContractMode,
    pub allowed: BTreeSet<AllowedMutation>,
    pub required_fields: BTreeMap<MutationTarget, Vec<String>>,
}

impl CapabilityContract {
    /// Advisory-only with an empty allow-list.
    #[must_use]
    pub fn restrictive() -> Self {
        Self {
            mode: ContractMode::AdvisoryOnly,
            allowed: BTreeSet::new(),
            required_fields: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn allows(&self, target: MutationTarget, op: MutationOp) -> bool {
        self.allowed.contains(&AllowedMutation { target, op })
    }

    fn required_for(&self, target: MutationTarget) -> &[String] {
        self.required_fields
            .get(&target)
            .map_or(&[] as &[String], Vec::as_slice)
    }
}

/// Outcome of checking a task output against its contract.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContractValidation {
    pub violations: Vec<String>,
    pub intents: Vec<MutationIntent>,
}

impl ContractValidation {
    #[must_use]
    pub fn ok(&self) -> bool {
        self.violations.is_empty()
    }

    fn violation(message: String) -> Self {
        Self {
            violations: vec![message],
            intents: Vec::new(),
        }
    }
}

/// Immutable set of contracts, built once at startup and passed by reference.
#[derive(Debug, Clone, PartialEq)]
pub struct ContractRegistry {
    contracts: BTreeMap<TaskKind, CapabilityContract>,
    fallback: CapabilityContract,
}

impl ContractRegistry {
    /// Every kind is advisory-only except `hqs-precheck`, which may propose
    /// rehab tasks, checklist status changes and workflow events for approval.
    #[must_use]
    pub fn builtin() -> Self {
        let mut contracts = BTreeMap::new();
        for kind in TaskKind::ALL {
            contracts.insert(kind, CapabilityContract::restrictive());
        }

        let mut required_fields = BTreeMap::new();
        required_fields.insert(MutationTarget::RehabTask, vec!["title".to_string()]);
        required_fields.insert(
            MutationTarget::ChecklistItem,
            vec!["item_code".to_string(), "status".to_string()],
        );
        required_fields.insert(MutationTarget::WorkflowEvent, vec!["event_type".to_string()]);
        contracts.insert(
            TaskKind::HqsPrecheck,
            CapabilityContract {
                mode: ContractMode::ApprovalRequired,
                allowed: [
                    AllowedMutation {
                        target: MutationTarget::RehabTask,
                        op: MutationOp::Create,
                    },
                    AllowedMutation {
                        target: MutationTarget::ChecklistItem,
                        op: MutationOp::UpdateStatus,
                    },
                    AllowedMutation {
                        target: MutationTarget::WorkflowEvent,
                        op: MutationOp::Create,
                    },
                ]
                .into_iter()
                .collect(),
                required_fields,
            },
        );

        Self {
            contracts,
            fallback: CapabilityContract::restrictive(),
        }
    }

    /// Parse a registry from YAML. Kinds the document omits fall back to the
    /// restrictive contract.
    ///
    /// # Errors
    /// Returns an error when the YAML is malformed, names an unknown task kind,
    /// target or operation, repeats a kind, or declares an approval-required
    /// contract with nothing allow-listed.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let file: ContractFile = serde_yaml::from_str(yaml)
            .map_err(|err| anyhow!("invalid contract YAML structure: {err}"))?;

        let mut contracts = BTreeMap::new();
        for entry in file.contracts {
            let kind = TaskKind::parse(&entry.task_kind)
                .ok_or_else(|| anyhow!("unknown task_kind in contracts: {}", entry.task_kind))?;
            let contract = entry.into_contract(kind)?;
            if contracts.insert(kind, contract).is_some() {
                return Err(anyhow!("duplicate contract for task_kind: {kind}"));
            }
        }

        Ok(Self {
            contracts,
            fallback: CapabilityContract::restrictive(),
        })
    }

    #[must_use]
    pub fn lookup(&self, kind: TaskKind) -> &CapabilityContract {
        self.contracts.get(&kind).unwrap_or(&self.fallback)
    }

    pub fn contracts(&self) -> impl Iterator<Item = (TaskKind, &CapabilityContract)> {
        TaskKind::ALL
            .into_iter()
            .map(|kind| (kind, self.lookup(kind)))
    }

    /// Check a task output against the contract for `kind`.
    ///
    /// Pure: the same inputs always produce the same violations, and typed
    /// intents are only returned when there are no violations.
    #[must_use]
    pub fn validate_output(&self, kind: TaskKind, output: &TaskOutput) -> ContractValidation {
        let contract = self.lookup(kind);
        let mut violations = Vec::new();

        if output.summary.trim().is_empty() {
            violations.push("summary MUST be non-empty".to_string());
        }

        if contract.mode == ContractMode::AdvisoryOnly {
            if !output.proposed_mutations.is_empty() {
                violations.push(format!(
                    "proposed_mutations: advisory-only task kind {kind} may not propose mutations ({} proposed)",
                    output.proposed_mutations.len()
                ));
            }
            return ContractValidation {
                violations,
                intents: Vec::new(),
            };
        }

        let mut intents = Vec::with_capacity(output.proposed_mutations.len());
        for (index, mutation) in output.proposed_mutations.iter().enumerate() {
            match check_mutation(contract, mutation) {
                Ok(intent) => intents.push(intent),
                Err(errors) => violations.extend(
                    errors
                        .into_iter()
                        .map(|err| format!("proposed_mutations[{index}]: {err}")),
                ),
            }
        }

        if !violations.is_empty() {
            intents.clear();
        }
        ContractValidation {
            violations,
            intents,
        }
    }

    /// Same as [`ContractRegistry::validate_output`] for output held as raw JSON.
    #[must_use]
    pub fn validate_output_value(&self, kind: TaskKind, output: &Value) -> ContractValidation {
        match serde_json::from_value::<TaskOutput>(output.clone()) {
            Ok(parsed) => self.validate_output(kind, &parsed),
            Err(err) => ContractValidation::violation(format!(
                "output is not a structured task output: {err}"
            )),
        }
    }
}

/// Load a contract registry from a YAML file.
///
/// # Errors
/// Returns an error when the file cannot be read or fails validation.
pub fn load_contracts_from_path(path: &Path) -> Result<ContractRegistry> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read contracts from {}", path.display()))?;
    ContractRegistry::from_yaml_str(&content)
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ContractFile {
    #[serde(default)]
    contracts: Vec<ContractEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ContractEntry {
    task_kind: String,
    mode: ContractMode,
    #[serde(default)]
    allowed: Vec<AllowedEntry>,
    #[serde(default)]
    required_fields: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AllowedEntry {
    target: String,
    op: String,
}

impl ContractEntry {
    fn into_contract(self, kind: TaskKind) -> Result<CapabilityContract> {
        let mut allowed = BTreeSet::new();
        for entry in &self.allowed {
            let target = MutationTarget::parse(&entry.target).ok_or_else(|| {
                anyhow!("contract {kind}: unknown mutation target {}", entry.target)
            })?;
            let op = MutationOp::parse(&entry.op)
                .ok_or_else(|| anyhow!("contract {kind}: unknown mutation op {}", entry.op))?;
            allowed.insert(AllowedMutation { target, op });
        }

        match self.mode {
            ContractMode::AdvisoryOnly if !allowed.is_empty() => {
                return Err(anyhow!(
                    "contract {kind}: advisory_only contracts cannot allow mutations"
                ));
            }
            ContractMode::ApprovalRequired if allowed.is_empty() => {
                return Err(anyhow!(
                    "contract {kind}: approval_required contracts need at least one allowed mutation"
                ));
            }
            _ => {}
        }

        let mut required_fields = BTreeMap::new();
        for (raw_target, fields) in self.required_fields {
            let target = MutationTarget::parse(&raw_target).ok_or_else(|| {
                anyhow!("contract {kind}: unknown required_fields target {raw_target}")
            })?;
            if !allowed.iter().any(|pair| pair.target == target) {
                return Err(anyhow!(
                    "contract {kind}: required_fields names {raw_target}, which is not allow-listed"
                ));
            }
            required_fields.insert(target, fields);
        }

        Ok(CapabilityContract {
            mode: self.mode,
            allowed,
            required_fields,
        })
    }
}

fn check_mutation(
    contract: &CapabilityContract,
    mutation: &ProposedMutation,
) -> std::result::Result<MutationIntent, Vec<String>> {
    let mut errors = Vec::new();

    let target = MutationTarget::parse(&mutation.target);
    let op = MutationOp::parse(&mutation.op);
    if target.is_none() {
        errors.push(format!("target '{}' is not allowed", mutation.target));
    }
    if op.is_none() {
        errors.push(format!("op '{}' is not allowed", mutation.op));
    }
    let (Some(target), Some(op)) = (target, op) else {
        return Err(errors);
    };

    if !contract.allows(target, op) {
        errors.push(format!(
            "({}, {}) is not allowed by contract",
            target.as_str(),
            op.as_str()
        ));
    }

    let Some(payload) = mutation.payload.as_object() else {
        errors.push("payload must be an object".to_string());
        return Err(errors);
    };

    for field in contract.required_for(target) {
        if !has_value(payload, field) {
            errors.push(format!("payload is missing required field '{field}'"));
        }
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    build_intent(target, op, payload).map_err(|err| vec![err])
}

fn has_value(payload: &Map<String, Value>, field: &str) -> bool {
    match payload.get(field) {
        None | Some(Value::Null) => false,
        Some(Value::String(text)) => !text.trim().is_empty(),
        Some(_) => true,
    }
}

fn build_intent(
    target: MutationTarget,
    op: MutationOp,
    payload: &Map<String, Value>,
) -> std::result::Result<MutationIntent, String> {
    match (target, op) {
        (MutationTarget::RehabTask, MutationOp::Create) => Ok(MutationIntent::CreateRehabTask {
            title: required_str(payload, "title")?,
            category: optional_str(payload, "category")?,
            cost_estimate: optional_f64(payload, "cost_estimate")?,
            notes: optional_str(payload, "notes")?,
        }),
        (MutationTarget::ChecklistItem, MutationOp::UpdateStatus) => {
            Ok(MutationIntent::UpdateChecklistItemStatus {
                item_code: required_str(payload, "item_code")?,
                status: required_str(payload, "status")?,
            })
        }
        (MutationTarget::WorkflowEvent, MutationOp::Create) => {
            Ok(MutationIntent::CreateWorkflowEvent {
                event_type: required_str(payload, "event_type")?,
                payload: event_body(payload)?,
            })
        }
        (target, op) => Err(format!(
            "no handler for ({}, {})",
            target.as_str(),
            op.as_str()
        )),
    }
}

/// The event body lives under `payload`; an absent body records an empty object.
fn event_body(payload: &Map<String, Value>) -> std::result::Result<Value, String> {
    match payload.get("payload") {
        None | Some(Value::Null) => Ok(Value::Object(Map::new())),
        Some(body @ Value::Object(_)) => Ok(body.clone()),
        Some(_) => Err("field 'payload' must be an object".to_string()),
    }
}

fn required_str(payload: &Map<String, Value>, field: &str) -> std::result::Result<String, String> {
    match payload.get(field) {
        Some(Value::String(text)) if !text.trim().is_empty() => Ok(text.trim().to_string()),
        Some(Value::String(_)) | None | Some(Value::Null) => {
            Err(format!("payload is missing required field '{field}'"))
        }
        Some(_) => Err(format!("field '{field}' must be a string")),
    }
}

fn optional_str(
    payload: &Map<String, Value>,
    field: &str,
) -> std::result::Result<Option<String>, String> {
    match payload.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(text)) => Ok(Some(text.clone())),
        Some(_) => Err(format!("field '{field}' must be a string")),
    }
}

fn optional_f64(
    payload: &Map<String, Value>,
    field: &str,
) -> std::result::Result<Option<f64>, String> {
    match payload.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(number)) => Ok(number.as_f64()),
        Some(_) => Err(format!("field '{field}' must be a number")),
    }
}

#[cfg(test)]
mod tests {
    use super::{ContractMode, ContractRegistry};
    use agent_runs_domain::{
        MutationIntent, MutationOp, MutationTarget, ProposedMutation, TaskKind, TaskOutput,
    };
    use serde_json::json;

    fn output_with(mutations: Vec<ProposedMutation>) -> TaskOutput {
        TaskOutput {
            summary: "checked".to_string(),
            proposed_mutations: mutations,
            ..TaskOutput::default()
        }
    }

    #[test]
    fn kind_missing_from_a_loaded_registry_gets_restrictive_contract() {
        let registry = ContractRegistry::from_yaml_str("contracts: []\n");
        assert!(registry.is_ok());
        let registry = registry.unwrap_or_else(|_| unreachable!());
        let contract = registry.lookup(TaskKind::HqsPrecheck);
        assert_eq!(contract.mode, ContractMode::AdvisoryOnly);
        assert!(contract.allowed.is_empty());
    }

    #[test]
    fn workflow_event_intent_carries_only_the_event_body() {
        let registry = ContractRegistry::builtin();
        let event = |payload| {
            output_with(vec![ProposedMutation::new(
                MutationTarget::WorkflowEvent,
                MutationOp::Create,
                payload,
            )])
        };

        let with_body = registry.validate_output(
            TaskKind::HqsPrecheck,
            &event(json!({"event_type": "hqs_precheck_failed", "payload": {"failed_items": ["gfci"]}})),
        );
        assert!(with_body.ok(), "{:?}", with_body.violations);
        assert_eq!(
            with_body.intents,
            vec![MutationIntent::CreateWorkflowEvent {
                event_type: "hqs_precheck_failed".to_string(),
                payload: json!({"failed_items": ["gfci"]}),
            }]
        );

        let without_body = registry.validate_output(
            TaskKind::HqsPrecheck,
            &event(json!({"event_type": "inspection_scheduled"})),
        );
        assert!(matches!(
            without_body.intents.as_slice(),
            [MutationIntent::CreateWorkflowEvent { payload, .. }] if *payload == json!({})
        ));

        let scalar_body = registry.validate_output(
            TaskKind::HqsPrecheck,
            &event(json!({"event_type": "inspection_scheduled", "payload": "tomorrow"})),
        );
        assert!(!scalar_body.ok());
        assert!(scalar_body.intents.is_empty());
        assert_eq!(
            scalar_body.violations,
            vec!["proposed_mutations[0]: field 'payload' must be an object".to_string()]
        );
    }

    #[test]
    fn advisory_output_with_any_mutation_is_rejected() {
        let registry = ContractRegistry::builtin();
        let output = output_with(vec![ProposedMutation::new(
            MutationTarget::RehabTask,
            MutationOp::Create,
            json!({"title": "paint"}),
        )]);
        let validation = registry.validate_output(TaskKind::TimelineNudger, &output);
        assert!(!validation.ok());
        assert!(validation.intents.is_empty());
        assert!(validation.violations[0].contains("advisory-only"));
    }

    #[test]
    fn approval_contract_converts_valid_mutations_into_intents() {
        let registry = ContractRegistry::builtin();
        let output = output_with(vec![
            ProposedMutation::new(
                MutationTarget::RehabTask,
                MutationOp::Create,
                json!({"title": "Replace smoke detector", "cost_estimate": 40}),
            ),
            ProposedMutation::new(
                MutationTarget::ChecklistItem,
                MutationOp::UpdateStatus,
                json!({"item_code": "smoke_detectors", "status": "failed"}),
            ),
        ]);
        let validation = registry.validate_output(TaskKind::HqsPrecheck, &output);
        assert!(validation.ok(), "{:?}", validation.violations);
        assert_eq!(validation.intents.len(), 2);
        assert!(matches!(
            &validation.intents[0],
            MutationIntent::CreateRehabTask { title, cost_estimate: Some(_), .. } if title == "Replace smoke detector"
        ));
    }

    #[test]
    fn violations_name_every_bad_mutation() {
        let registry = ContractRegistry::builtin();
        let output = output_with(vec![
            ProposedMutation {
                target: "invoice".to_string(),
                op: "create".to_string(),
                payload: json!({}),
                reason: None,
            },
            ProposedMutation::new(
                MutationTarget::RehabTask,
                MutationOp::Create,
                json!("not an object"),
            ),
            ProposedMutation::new(
                MutationTarget::RehabTask,
                MutationOp::Create,
                json!({"title": "   "}),
            ),
            ProposedMutation::new(
                MutationTarget::WorkflowEvent,
                MutationOp::UpdateStatus,
                json!({"event_type": "x"}),
            ),
        ]);
        let validation = registry.validate_output(TaskKind::HqsPrecheck, &output);
        assert!(!validation.ok());
        assert!(validation.intents.is_empty());
        let joined = validation.violations.join("\n");
        assert!(joined.contains("proposed_mutations[0]: target 'invoice' is not allowed"));
        assert!(joined.contains("proposed_mutations[1]: payload must be an object"));
        assert!(joined.contains("proposed_mutations[2]: payload is missing required field 'title'"));
        assert!(joined.contains("proposed_mutations[3]: (workflow_event, update_status) is not allowed"));
    }

    #[test]
    fn mutating_contract_accepts_output_without_proposals() {
        let registry = ContractRegistry::builtin();
        let validation = registry.validate_output(TaskKind::HqsPrecheck, &output_with(Vec::new()));
        assert!(validation.ok());
        assert!(validation.intents.is_empty());
    }

    #[test]
    fn raw_output_that_is_not_structured_is_a_violation() {
        let registry = ContractRegistry::builtin();
        let validation = registry.validate_output_value(TaskKind::OpsJudge, &json!([1, 2]));
        assert!(!validation.ok());
    }

    #[test]
    fn yaml_registry_overrides_and_falls_back() {
        let yaml = r"
contracts:
  - task_kind: ops-judge
    mode: approval_required
    allowed:
      - { target: workflow_event, op: create }
    required_fields:
      workflow_event: [event_type]
";
        let registry = ContractRegistry::from_yaml_str(yaml);
        assert!(registry.is_ok());
        let registry = registry.unwrap_or_else(|_| unreachable!());
        assert_eq!(
            registry.lookup(TaskKind::OpsJudge).mode,
            ContractMode::ApprovalRequired
        );
        assert_eq!(
            registry.lookup(TaskKind::HqsPrecheck).mode,
            ContractMode::AdvisoryOnly
        );
    }

    #[test]
    fn yaml_registry_rejects_bad_documents() {
        for yaml in [
            "contracts:\n  - { task_kind: nope, mode: advisory_only }\n",
            "contracts:\n  - { task_kind: ops-judge, mode: approval_required }\n",
            "contracts:\n  - { task_kind: ops-judge, mode: advisory_only }\n  - { task_kind: ops-judge, mode: advisory_only }\n",
            "contracts:\n  - task_kind: ops-judge\n    mode: approval_required\n    allowed: [{ target: invoice, op: create }]\n",
            "contracts:\n  - task_kind: ops-judge\n    mode: approval_required\n    allowed: [{ target: rehab_task, op: create }]\n    required_fields: { checklist_item: [item_code] }\n",
        ] {
            assert!(ContractRegistry::from_yaml_str(yaml).is_err(), "{yaml}");
        }
    }
}
