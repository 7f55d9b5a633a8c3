use std::collections::{BTreeSet, HashSet};

use log::{debug, warn};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::literal;
use crate::planner::{Plan, Task};

/// Why a model response could not be turned into a plan.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FailureReason {
    #[error("no parseable JSON found in the model output")]
    MalformedResponse,
    #[error("parsed output does not have the expected plan shape: {detail}")]
    SchemaViolation { detail: String, parsed: Value },
}

/// Outcome of interpreting one model response.
///
/// Both arms keep the raw text and the candidate substring that was parsed
/// (or last attempted) so callers can show them for debugging.
#[derive(Debug, Clone, PartialEq)]
pub enum InterpretationResult {
    Success {
        plan: Plan,
        raw_text: String,
        candidate: String,
    },
    Failure {
        reason: FailureReason,
        raw_text: String,
        candidate: String,
    },
}

impl InterpretationResult {
    pub fn plan(&self) -> Option<&Plan> {
        match self {
            InterpretationResult::Success { plan, .. } => Some(plan),
            InterpretationResult::Failure { .. } => None,
        }
    }

    pub fn raw_text(&self) -> &str {
        match self {
            InterpretationResult::Success { raw_text, .. }
            | InterpretationResult::Failure { raw_text, .. } => raw_text,
        }
    }

    pub fn candidate(&self) -> &str {
        match self {
            InterpretationResult::Success { candidate, .. }
            | InterpretationResult::Failure { candidate, .. } => candidate,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, InterpretationResult::Success { .. })
    }
}

/// Which step of the fallback chain produced the parsed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStage {
    ObjectSpan,
    ArraySpan,
    WholeText,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Grammar {
    Strict,
    Lenient,
}

/// Interprets raw completion text into a `Plan`.
pub struct Interpreter;

impl Interpreter {
    pub fn new() -> Self {
        Self
    }

    /// Run the fallback chain over `raw_text`. Never fails across the boundary.
    pub fn interpret(&self, raw_text: &str) -> InterpretationResult {
        interpret(raw_text)
    }
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

pub fn interpret(raw_text: &str) -> InterpretationResult {
    let cleaned = strip_code_fence(raw_text);
    let mut candidate = cleaned;

    // The outermost container is whichever bracket opens first.
    let mut spans = [
        (ParseStage::ObjectSpan, cleaned.find('{'), bracket_span(cleaned, '{', '}')),
        (ParseStage::ArraySpan, cleaned.find('['), bracket_span(cleaned, '[', ']')),
    ];
    spans.sort_by_key(|(_, start, _)| start.unwrap_or(usize::MAX));
    for (stage, _, span) in spans {
        let Some(span) = span else { continue };
        candidate = span;
        if let Some((value, grammar)) = parse_candidate(span) {
            debug!("Parsed {:?} with {:?} grammar", stage, grammar);
            return validate(value, raw_text, span);
        }
    }

    if !cleaned.is_empty() {
        candidate = cleaned;
        if let Some((value, grammar)) = parse_candidate(cleaned) {
            if value.is_object() || value.is_array() {
                debug!("Parsed {:?} with {:?} grammar", ParseStage::WholeText, grammar);
                return validate(value, raw_text, cleaned);
            }
        }
    }

    debug!("No parseable payload in {} bytes of model output", raw_text.len());
    InterpretationResult::Failure {
        reason: FailureReason::MalformedResponse,
        raw_text: raw_text.to_string(),
        candidate: candidate.to_string(),
    }
}

/// Remove a leading ```` ``` ```` fence (with optional language tag) and the
/// last closing fence, so fences quoted inside the payload survive. Text that
/// does not start with a fence is only trimmed.
pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let tag_len = rest
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '+'))
        .unwrap_or(rest.len());
    let body = &rest[tag_len..];
    let body = match body.rfind("```") {
        Some(end) => &body[..end],
        None => body,
    };
    body.trim()
}

/// First `open` through last `close`, if the close comes after the open.
fn bracket_span(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    (end > start).then(|| &text[start..=end])
}

fn parse_candidate(candidate: &str) -> Option<(Value, Grammar)> {
    match serde_json::from_str::<Value>(candidate) {
        Ok(value) => Some((value, Grammar::Strict)),
        Err(strict_err) => match literal::parse(candidate) {
            Ok(value) => Some((value, Grammar::Lenient)),
            Err(lenient_err) => {
                debug!(
                    "Candidate rejected (strict: {}; lenient: {})",
                    strict_err, lenient_err
                );
                None
            }
        },
    }
}

fn validate(value: Value, raw_text: &str, candidate: &str) -> InterpretationResult {
    match build_plan(&value) {
        Ok(plan) => {
            for warning in &plan.warnings {
                warn!("{}", warning);
            }
            InterpretationResult::Success {
                plan,
                raw_text: raw_text.to_string(),
                candidate: candidate.to_string(),
            }
        }
        Err(detail) => InterpretationResult::Failure {
            reason: FailureReason::SchemaViolation {
                detail,
                parsed: value,
            },
            raw_text: raw_text.to_string(),
            candidate: candidate.to_string(),
        },
    }
}

fn build_plan(value: &Value) -> Result<Plan, String> {
    let entries = match value {
        Value::Array(items) => items,
        Value::Object(map) => match map.get("plan") {
            Some(Value::Array(items)) => items,
            Some(other) => {
                return Err(format!(
                    "'plan' must be a list of tasks, found {}",
                    kind_of(other)
                ));
            }
            None => return Err("mapping has no 'plan' key".to_string()),
        },
        other => {
            return Err(format!(
                "expected a mapping or a list, found {}",
                kind_of(other)
            ));
        }
    };

    let mut tasks = Vec::with_capacity(entries.len());
    let mut warnings = Vec::new();
    let mut seen_ids = HashSet::new();

    for (index, entry) in entries.iter().enumerate() {
        let position = index + 1;
        let Value::Object(fields) = entry else {
            warnings.push(format!(
                "Skipped plan entry #{}: expected a mapping, found {}",
                position,
                kind_of(entry)
            ));
            continue;
        };
        let Some(task) = task_from_fields(fields, position, &mut warnings) else {
            continue;
        };
        if let Some(id) = task.task_id {
            if !seen_ids.insert(id) {
                warnings.push(format!(
                    "Duplicate task_id {} in plan entry #{}; keeping the first occurrence",
                    id, position
                ));
                continue;
            }
        }
        tasks.push(task);
    }

    if !entries.is_empty() && tasks.iter().all(|t| t.task_id.is_none()) {
        return Err("no task carries a usable task_id".to_string());
    }

    for task in &tasks {
        for dep in &task.dependencies {
            if !seen_ids.contains(dep) {
                warnings.push(format!(
                    "Task '{}' depends on unknown task_id {}",
                    task.task_name, dep
                ));
            }
        }
    }

    Ok(Plan { tasks, warnings })
}

fn task_from_fields(
    fields: &Map<String, Value>,
    position: usize,
    warnings: &mut Vec<String>,
) -> Option<Task> {
    let task_id = fields.get("task_id").and_then(coerce_positive_id);
    let task_name = fields.get("task_name").and_then(coerce_text);

    if task_id.is_none() && task_name.is_none() {
        warnings.push(format!(
            "Skipped plan entry #{}: neither task_id nor task_name is usable",
            position
        ));
        return None;
    }
    if task_id.is_none() {
        warnings.push(format!("Plan entry #{} has no usable task_id", position));
    }
    let task_name = task_name.unwrap_or_else(|| {
        warnings.push(format!("Plan entry #{} has no task_name", position));
        "Unnamed".to_string()
    });

    let description = fields
        .get("description")
        .and_then(coerce_text)
        .unwrap_or_default();

    let dependencies = match fields.get("dependencies") {
        None | Some(Value::Null) => BTreeSet::new(),
        Some(value) => coerce_dependencies(value, position, warnings),
    };

    let duration_days = match fields.get("duration_days") {
        None | Some(Value::Null) => 0,
        Some(value) => coerce_duration(value).unwrap_or_else(|| {
            warnings.push(format!(
                "Plan entry #{} has an unusable duration_days {}; using 0",
                position, value
            ));
            0
        }),
    };

    Some(Task {
        task_id,
        task_name,
        description,
        dependencies,
        duration_days,
    })
}

fn coerce_positive_id(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => {
            if let Some(id) = n.as_u64() {
                return (id > 0).then_some(id);
            }
            let f = n.as_f64()?;
            (f >= 1.0 && f.fract() == 0.0 && f <= u64::MAX as f64).then(|| f as u64)
        }
        Value::String(s) => s.trim().parse::<u64>().ok().filter(|id| *id > 0),
        _ => None,
    }
}

fn coerce_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

fn coerce_dependencies(value: &Value, position: usize, warnings: &mut Vec<String>) -> BTreeSet<u64> {
    let items: Vec<Value> = match value {
        Value::Array(items) => items.clone(),
        Value::String(s) if s.trim().is_empty() || s.trim().eq_ignore_ascii_case("none") => {
            Vec::new()
        }
        Value::String(s) => s
            .split(',')
            .map(|part| Value::String(part.trim().to_string()))
            .collect(),
        other => vec![other.clone()],
    };

    let mut deps = BTreeSet::new();
    for item in &items {
        match coerce_positive_id(item) {
            Some(id) => {
                deps.insert(id);
            }
            None => warnings.push(format!(
                "Ignored dependency {} in plan entry #{}",
                item, position
            )),
        }
    }
    deps
}

fn coerce_duration(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => {
            if let Some(days) = n.as_u64() {
                return Some(days);
            }
            let f = n.as_f64()?;
            (f >= 0.0 && f.is_finite()).then(|| f.round() as u64)
        }
        Value::String(s) => {
            let digits: String = s
                .trim()
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .collect();
            digits.parse().ok()
        }
        _ => None,
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "a mapping",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAN_JSON: &str = r#"{"plan":[{"task_id":1,"task_name":"Design","description":"d","dependencies":[],"duration_days":2},{"task_id":2,"task_name":"Build","description":"b","dependencies":[1],"duration_days":5}]}"#;

    fn expect_plan(result: &InterpretationResult) -> &Plan {
        match result {
            InterpretationResult::Success { plan, .. } => plan,
            InterpretationResult::Failure { reason, .. } => panic!("expected success, got {}", reason),
        }
    }

    fn expect_reason(result: &InterpretationResult) -> &FailureReason {
        match result {
            InterpretationResult::Failure { reason, .. } => reason,
            InterpretationResult::Success { .. } => panic!("expected failure"),
        }
    }

    #[test]
    fn test_bare_json_round_trip() {
        let result = interpret(PLAN_JSON);
        let plan = expect_plan(&result);
        assert_eq!(
            plan.tasks,
            vec![
                Task {
                    task_id: Some(1),
                    task_name: "Design".to_string(),
                    description: "d".to_string(),
                    dependencies: BTreeSet::new(),
                    duration_days: 2,
                },
                Task {
                    task_id: Some(2),
                    task_name: "Build".to_string(),
                    description: "b".to_string(),
                    dependencies: BTreeSet::from([1]),
                    duration_days: 5,
                },
            ]
        );
        assert!(plan.warnings.is_empty());
        assert_eq!(result.candidate(), PLAN_JSON);
    }

    #[test]
    fn test_fenced_equals_unfenced() {
        let bare = interpret(PLAN_JSON);
        for fenced in [
            format!("```json\n{}\n```", PLAN_JSON),
            format!("```\n{}\n```", PLAN_JSON),
            format!("```JSON {}```", PLAN_JSON),
        ] {
            let result = interpret(&fenced);
            assert_eq!(result.plan(), bare.plan());
            assert_eq!(result.candidate(), PLAN_JSON);
        }
    }

    #[test]
    fn test_surrounding_prose_is_ignored() {
        let raw = r#"Sure! Here is your plan: {"plan":[{"task_id":1,"task_name":"Design","description":"d","dependencies":[],"duration_days":2}]} Hope that helps!"#;
        let result = interpret(raw);
        let plan = expect_plan(&result);
        assert_eq!(plan.tasks.len(), 1);
        assert_eq!(plan.tasks[0].task_name, "Design");
        assert_eq!(result.raw_text(), raw);
    }

    #[test]
    fn test_prose_only_is_malformed() {
        let result = interpret("I'm sorry, I can't produce a plan for that goal.");
        assert_eq!(expect_reason(&result), &FailureReason::MalformedResponse);
        assert_eq!(
            result.candidate(),
            "I'm sorry, I can't produce a plan for that goal."
        );
    }

    #[test]
    fn test_empty_input_is_malformed() {
        let result = interpret("");
        assert_eq!(expect_reason(&result), &FailureReason::MalformedResponse);
        assert_eq!(result.candidate(), "");

        let result = interpret("   \n ");
        assert_eq!(expect_reason(&result), &FailureReason::MalformedResponse);
    }

    #[test]
    fn test_scalar_whole_text_is_malformed() {
        assert_eq!(expect_reason(&interpret("None")), &FailureReason::MalformedResponse);
        assert_eq!(expect_reason(&interpret("42")), &FailureReason::MalformedResponse);
    }

    #[test]
    fn test_object_without_plan_key_is_schema_violation() {
        let result = interpret(r#"{"tasks":[]}"#);
        match expect_reason(&result) {
            FailureReason::SchemaViolation { parsed, .. } => {
                assert_eq!(parsed, &serde_json::json!({"tasks": []}));
            }
            other => panic!("unexpected reason {:?}", other),
        }
    }

    #[test]
    fn test_plan_not_a_list_is_schema_violation() {
        let result = interpret(r#"{"plan": "later"}"#);
        assert!(matches!(
            expect_reason(&result),
            FailureReason::SchemaViolation { .. }
        ));
    }

    #[test]
    fn test_no_usable_task_id_is_schema_violation() {
        let result = interpret(r#"{"plan":[{"task_name":"A"},{"task_id":0,"task_name":"B"}]}"#);
        match expect_reason(&result) {
            FailureReason::SchemaViolation { detail, .. } => {
                assert!(detail.contains("task_id"));
            }
            other => panic!("unexpected reason {:?}", other),
        }
    }

    #[test]
    fn test_missing_optional_fields_default() {
        let result = interpret(r#"{"plan":[{"task_id":1,"task_name":"Kickoff"}]}"#);
        let task = &expect_plan(&result).tasks[0];
        assert_eq!(task.description, "");
        assert!(task.dependencies.is_empty());
        assert_eq!(task.duration_days, 0);
    }

    #[test]
    fn test_bare_array_is_task_list() {
        let result = interpret(r#"[{"task_id":1,"task_name":"Only"}]"#);
        assert_eq!(expect_plan(&result).tasks[0].task_name, "Only");
    }

    #[test]
    fn test_single_task_array_inside_prose() {
        let raw = r#"Here is the plan: [{"task_id": 1, "task_name": "Only", "duration_days": 2}] Good luck!"#;
        let result = interpret(raw);
        let plan = expect_plan(&result);
        assert_eq!(plan.tasks.len(), 1);
        assert_eq!(plan.tasks[0].duration_days, 2);
        assert!(result.candidate().starts_with('['));
    }

    #[test]
    fn test_object_before_array_keeps_object_span() {
        let result = interpret(r#"Result: {"tasks": [{"task_id": 1, "task_name": "A"}]}"#);
        assert!(matches!(
            expect_reason(&result),
            FailureReason::SchemaViolation { .. }
        ));
        assert!(result.candidate().starts_with('{'));
    }

    #[test]
    fn test_empty_plan_is_success() {
        let result = interpret(r#"{"plan": []}"#);
        assert!(expect_plan(&result).tasks.is_empty());

        let result = interpret("[]");
        assert!(expect_plan(&result).is_empty());
    }

    #[test]
    fn test_lenient_fallback_on_python_literal() {
        let raw = "Here you go:\n{'plan': [{'task_id': 1, 'task_name': 'Research', 'dependencies': [], 'duration_days': 3,},]}";
        let result = interpret(raw);
        let plan = expect_plan(&result);
        assert_eq!(plan.tasks[0].task_name, "Research");
        assert_eq!(plan.tasks[0].duration_days, 3);
    }

    #[test]
    fn test_array_span_used_when_object_span_fails() {
        let raw = r#"Tasks: [{"task_id": 1, "task_name": "A"}, {"task_id": 2, "task_name": "B"}]"#;
        let result = interpret(raw);
        assert_eq!(expect_plan(&result).tasks.len(), 2);
        assert!(result.candidate().starts_with('['));
    }

    #[test]
    fn test_failure_keeps_last_candidate() {
        let raw = "Plan: {\"plan\": [ broken";
        let result = interpret(raw);
        assert_eq!(expect_reason(&result), &FailureReason::MalformedResponse);
        assert_eq!(result.candidate(), raw);
    }

    #[test]
    fn test_duplicate_ids_keep_first() {
        let result = interpret(
            r#"{"plan":[{"task_id":1,"task_name":"First"},{"task_id":1,"task_name":"Second"}]}"#,
        );
        let plan = expect_plan(&result);
        assert_eq!(plan.tasks.len(), 1);
        assert_eq!(plan.tasks[0].task_name, "First");
        assert!(plan.warnings.iter().any(|w| w.contains("Duplicate task_id 1")));
    }

    #[test]
    fn test_unknown_dependency_is_kept_with_warning() {
        let result = interpret(r#"{"plan":[{"task_id":1,"task_name":"A","dependencies":[9]}]}"#);
        let plan = expect_plan(&result);
        assert_eq!(plan.tasks[0].dependencies, BTreeSet::from([9]));
        assert!(plan.warnings.iter().any(|w| w.contains("unknown task_id 9")));
    }

    #[test]
    fn test_field_coercion() {
        let result = interpret(
            r#"{"plan":[{"task_id":"2","task_name":"A","dependencies":"1, 3","duration_days":"4 days"},{"task_id":1.0,"task_name":"B","duration_days":2.6},{"task_id":3,"task_name":"C","dependencies":null}]}"#,
        );
        let plan = expect_plan(&result);
        assert_eq!(plan.tasks[0].task_id, Some(2));
        assert_eq!(plan.tasks[0].dependencies, BTreeSet::from([1, 3]));
        assert_eq!(plan.tasks[0].duration_days, 4);
        assert_eq!(plan.tasks[1].task_id, Some(1));
        assert_eq!(plan.tasks[1].duration_days, 3);
        assert!(plan.tasks[2].dependencies.is_empty());
    }

    #[test]
    fn test_entry_without_id_is_kept_and_flagged() {
        let result = interpret(r#"{"plan":[{"task_id":1,"task_name":"A"},{"task_name":"Loose"}]}"#);
        let plan = expect_plan(&result);
        assert_eq!(plan.tasks.len(), 2);
        assert_eq!(plan.tasks[1].task_id, None);
        assert!(plan.warnings.iter().any(|w| w.contains("#2 has no usable task_id")));
    }

    #[test]
    fn test_non_mapping_entries_are_skipped() {
        let result = interpret(r#"{"plan":[{"task_id":1,"task_name":"A"}, "stray", 4]}"#);
        let plan = expect_plan(&result);
        assert_eq!(plan.tasks.len(), 1);
        assert_eq!(plan.warnings.len(), 2);
    }

    #[test]
    fn test_strip_code_fence() {
        assert_eq!(strip_code_fence("```json\n{}\n```"), "{}");
        assert_eq!(strip_code_fence("```\n[1]\n```\nThanks!"), "[1]");
        assert_eq!(strip_code_fence("  {\"a\": 1}  "), "{\"a\": 1}");
        assert_eq!(strip_code_fence("```json\n{\"a\": 1}"), "{\"a\": 1}");
        assert_eq!(strip_code_fence("Intro ```json {} ```"), "Intro ```json {} ```");
    }

    #[test]
    fn test_fenced_plan_with_quoted_fence_in_description() {
        let raw = "```json\n{\"plan\":[{\"task_id\":1,\"task_name\":\"Doc\",\"description\":\"Add a ```bash``` snippet\"}]}\n```";
        let result = interpret(raw);
        let plan = expect_plan(&result);
        assert_eq!(plan.tasks[0].description, "Add a ```bash``` snippet");
    }

    #[test]
    fn test_interpret_is_idempotent() {
        let interpreter = Interpreter::new();
        for raw in [PLAN_JSON, "nothing here", r#"{"tasks":[]}"#, "```json\n[]\n```"] {
            assert_eq!(interpreter.interpret(raw), interpreter.interpret(raw));
        }
    }
}
