use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::time::Duration;

use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use serde_json::Value;

use crate::config::{OutputFormat, UIConfig};
use crate::event_bus::{Event, EventBus};
use crate::interpreter::{FailureReason, InterpretationResult};
use crate::planner::{Plan, Task};

/// Terminal presentation of plans and failures.
pub struct UIHandler {
    format: OutputFormat,
    preview_chars: usize,
}

impl UIHandler {
    pub fn new(config: &UIConfig) -> Self {
        if !config.colorful {
            colored::control::set_override(false);
        }
        Self {
            format: config.output_format,
            preview_chars: config.candidate_preview_chars,
        }
    }

    pub fn banner(&self, provider: &str, model: &str) {
        if self.format == OutputFormat::Json {
            return;
        }
        println!("{}", "Smart Task Planner".bright_white().bold());
        println!("{}", format!("Model: {} ({})", model, provider).dimmed());
        println!();
    }

    /// Spinner shown while the completion call is in flight. `None` unless the
    /// output format is `terminal`.
    pub fn start_spinner(&self, bus: &EventBus) -> Option<ProgressBar> {
        if self.format != OutputFormat::Terminal {
            return None;
        }
        let spinner = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
            spinner.set_style(style);
        }
        spinner.set_message("Calling model...");
        spinner.enable_steady_tick(Duration::from_millis(100));

        let bar = spinner.clone();
        let mut receiver = bus.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = receiver.recv().await {
                match event {
                    Event::APICallStarted { model, attempt, .. } if attempt > 1 => {
                        bar.set_message(format!("Calling {} (attempt {})...", model, attempt));
                    }
                    Event::RetryScheduled {
                        attempt, delay_ms, ..
                    } => {
                        bar.set_message(format!(
                            "Service busy, retry {} in {:.1}s...",
                            attempt,
                            delay_ms as f64 / 1000.0
                        ));
                    }
                    _ => {}
                }
            }
        });
        Some(spinner)
    }

    /// Render an interpretation result for the configured output format.
    pub fn render_result(&self, result: &InterpretationResult, show_raw: bool) -> String {
        match self.format {
            OutputFormat::Json => self.render_json(result, show_raw),
            OutputFormat::Terminal | OutputFormat::Plain => self.render_text(result, show_raw),
        }
    }

    /// Render an error that happened before any model output was available.
    pub fn render_error(&self, message: &str) -> String {
        match self.format {
            OutputFormat::Json => to_json(&JsonReport::Error {
                message: message.to_string(),
            }),
            _ => format!("{}", message.red().bold()),
        }
    }

    fn render_text(&self, result: &InterpretationResult, show_raw: bool) -> String {
        let mut out = String::new();
        if show_raw {
            let _ = writeln!(out, "{}", "Raw model output:".bold());
            let _ = writeln!(out, "{}", result.raw_text());
            let _ = writeln!(out);
        }

        match result {
            InterpretationResult::Success { plan, .. } => render_plan(&mut out, plan),
            InterpretationResult::Failure {
                reason: FailureReason::SchemaViolation { detail, parsed },
                ..
            } => {
                let _ = writeln!(
                    out,
                    "{}",
                    "Parsed something, but it does not have the expected plan shape.".yellow()
                );
                let _ = writeln!(out, "Detail: {}", detail);
                let _ = writeln!(out, "{}", pretty(parsed));
                let _ = writeln!(
                    out,
                    "{}",
                    "If parsing succeeded but the shape is wrong, check the model prompt and desired schema."
                        .dimmed()
                );
            }
            InterpretationResult::Failure {
                reason: FailureReason::MalformedResponse,
                candidate,
                ..
            } => {
                let _ = writeln!(
                    out,
                    "{}",
                    "Failed to parse valid JSON from the model output.".red().bold()
                );
                let _ = writeln!(out, "What we attempted to parse (trimmed):");
                let _ = writeln!(out, "{}", preview(candidate, self.preview_chars));
                let _ = writeln!(
                    out,
                    "{}",
                    "Try rephrasing your goal to be shorter/simpler, or run with --example to test a known-good prompt."
                        .dimmed()
                );
            }
        }
        out
    }

    fn render_json(&self, result: &InterpretationResult, show_raw: bool) -> String {
        let raw_text = show_raw.then(|| result.raw_text());
        let report = match result {
            InterpretationResult::Success { plan, .. } => JsonReport::Success {
                tasks: plan.display_order(),
                warnings: &plan.warnings,
                total_duration_days: plan.total_duration_days(),
                candidate: show_raw.then(|| result.candidate()),
                raw_text,
            },
            InterpretationResult::Failure {
                reason, candidate, ..
            } => JsonReport::Failure {
                kind: match reason {
                    FailureReason::MalformedResponse => "malformed_response",
                    FailureReason::SchemaViolation { .. } => "schema_violation",
                },
                reason: reason.to_string(),
                candidate: preview(candidate, self.preview_chars),
                parsed: match reason {
                    FailureReason::SchemaViolation { parsed, .. } => Some(parsed),
                    FailureReason::MalformedResponse => None,
                },
                raw_text,
            },
        };
        to_json(&report)
    }
}

#[derive(Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum JsonReport<'a> {
    Success {
        tasks: Vec<&'a Task>,
        warnings: &'a [String],
        total_duration_days: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        candidate: Option<&'a str>,
        #[serde(skip_serializing_if = "Option::is_none")]
        raw_text: Option<&'a str>,
    },
    Failure {
        kind: &'static str,
        reason: String,
        candidate: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        parsed: Option<&'a Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        raw_text: Option<&'a str>,
    },
    Error {
        message: String,
    },
}

fn to_json(report: &JsonReport<'_>) -> String {
    serde_json::to_string_pretty(report)
        .unwrap_or_else(|e| format!("{{\"status\":\"error\",\"message\":\"{}\"}}", e))
}

fn render_plan(out: &mut String, plan: &Plan) {
    if plan.is_empty() {
        let _ = writeln!(
            out,
            "{}",
            "The model returned an empty plan. Try a more specific goal.".yellow()
        );
        return;
    }

    let _ = writeln!(
        out,
        "{}",
        format!(
            "Parsed JSON plan successfully! {} tasks, {} days in total.",
            plan.tasks.len(),
            plan.total_duration_days()
        )
        .green()
        .bold()
    );
    let _ = writeln!(out);

    for task in plan.display_order() {
        let id = task
            .task_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "?".to_string());
        let _ = writeln!(
            out,
            "{}",
            format!("Task {}: {} ({} days)", id, task.task_name, task.duration_days).cyan().bold()
        );
        let _ = writeln!(out, "    Description: {}", task.description);
        let _ = writeln!(
            out,
            "    Dependencies: {}",
            format_dependencies(&task.dependencies)
        );
    }

    if !plan.warnings.is_empty() {
        let _ = writeln!(out);
        for warning in &plan.warnings {
            let _ = writeln!(out, "{} {}", "warning:".yellow(), warning);
        }
    }
}

/// Comma-joined dependency ids, or `None` when there are none.
pub fn format_dependencies(dependencies: &BTreeSet<u64>) -> String {
    if dependencies.is_empty() {
        return "None".to_string();
    }
    dependencies
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// First `max_chars` characters of `text`, marked when cut short.
pub fn preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}... (truncated)", &text[..cut]),
        None => text.to_string(),
    }
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
