use std::collections::BTreeSet;
use std::sync::Arc;

use log::info;
use serde::Serialize;
use thiserror::Error;

use crate::event_bus::{Event, EventBus};
use crate::interpreter::{InterpretationResult, Interpreter};
use crate::llm_manager::{GenerationOptions, LLMManager, ServiceError};

/// One unit of work in a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Task {
    /// `None` when the model gave no usable id; such tasks sort last.
    pub task_id: Option<u64>,
    pub task_name: String,
    pub description: String,
    pub dependencies: BTreeSet<u64>,
    pub duration_days: u64,
}

/// Tasks returned for one goal, in the order the model produced them.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Plan {
    pub tasks: Vec<Task>,
    /// Non-fatal problems found while validating (duplicate ids, unknown dependencies, ...).
    pub warnings: Vec<String>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Tasks in display order: ascending `task_id`, id-less tasks last in input order.
    pub fn display_order(&self) -> Vec<&Task> {
        let mut ordered: Vec<&Task> = self.tasks.iter().collect();
        ordered.sort_by_key(|task| (task.task_id.is_none(), task.task_id));
        ordered
    }

    pub fn total_duration_days(&self) -> u64 {
        self.tasks.iter().map(|t| t.duration_days).sum()
    }
}

#[derive(Debug, Error)]
pub enum PlanningError {
    #[error("Goal cannot be empty.")]
    EmptyGoal,
    #[error("Model call failed: {0}")]
    Service(#[from] ServiceError),
}

/// Builds the planning prompt, calls the completion service and interprets the reply.
pub struct Planner {
    system_prompt: String,
    interpreter: Interpreter,
    event_bus: Option<Arc<EventBus>>,
}

impl Planner {
    pub fn new() -> Self {
        Self {
            system_prompt: Self::default_system_prompt(),
            interpreter: Interpreter::new(),
            event_bus: None,
        }
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Ask the model for a plan for `goal`.
    ///
    /// Service failures are returned as errors; anything the model says comes
    /// back as an `InterpretationResult`, including unparseable replies.
    pub async fn plan(
        &self,
        goal: &str,
        llm: &LLMManager,
        options: &GenerationOptions,
    ) -> Result<InterpretationResult, PlanningError> {
        let goal = goal.trim();
        if goal.is_empty() {
            return Err(PlanningError::EmptyGoal);
        }

        let prompt = self.build_prompt(goal);
        let raw = llm.complete(&prompt, options).await?;
        let result = self.interpreter.interpret(raw.trim());

        match &result {
            InterpretationResult::Success { plan, .. } => {
                info!("Interpreted plan with {} tasks", plan.tasks.len());
                self.emit(Event::PlanInterpreted {
                    tasks: plan.tasks.len(),
                    warnings: plan.warnings.len(),
                })
                .await;
            }
            InterpretationResult::Failure { reason, .. } => {
                info!("Could not interpret model output: {}", reason);
                self.emit(Event::InterpretationFailed {
                    reason: reason.to_string(),
                })
                .await;
            }
        }

        Ok(result)
    }

    pub fn build_prompt(&self, goal: &str) -> String {
        format!(
            r#"{}

The user's goal is: "{}"

Produce a JSON object with a single key "plan" whose value is an array of task objects.
Each task object must include:
- task_id (integer, starting at 1)
- task_name (short actionable string)
- description (short explanation)
- dependencies (array of task_id integers, empty array if none)
- duration_days (integer)

Example shape:
{{"plan":[{{"task_id":1,"task_name":"...","description":"...","dependencies":[],"duration_days":3}}, ...]}}"#,
            self.system_prompt, goal
        )
    }

    async fn emit(&self, event: Event) {
        if let Some(bus) = &self.event_bus {
            let _ = bus.emit(event).await;
        }
    }

    fn default_system_prompt() -> String {
        "You are an expert project manager AI. Output MUST be valid JSON only. \
Do not include any explanatory text. Only return a single JSON object."
            .to_string()
    }
}

impl Default for Planner {
    fn default() -> Self {
        Self::new()
    }
}
