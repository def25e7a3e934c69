//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use serde::Serialize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::ValidationResult;
use crate::coordinator::StackOutputs;
use crate::planner::{ActionType, OperationPlan, ProgressEvent};
use crate::state::{StackOperation, StackRef, StackState};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug, Clone, Copy)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan action row for table display.
#[derive(Tabled)]
struct PlanActionRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Type")]
    resource_type: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Resource row for state display.
#[derive(Tabled)]
struct ResourceRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Type")]
    resource_type: String,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Hash")]
    hash: String,
    #[tabled(rename = "Updated")]
    updated: String,
}

/// Output row.
#[derive(Tabled)]
struct OutputRow {
    #[tabled(rename = "Output")]
    name: String,
    #[tabled(rename = "Value")]
    value: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Returns true if the formatter renders JSON.
    #[must_use]
    pub fn is_json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    /// Formats an operation plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &OperationPlan, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => to_json(plan),
            OutputFormat::Text => Self::format_plan_text(plan, detailed),
        }
    }

    /// Formats a plan as text.
    fn format_plan_text(plan: &OperationPlan, detailed: bool) -> String {
        if plan.is_empty() {
            return format!(
                "{} No changes required - stack {} is up to date.\n",
                "✓".green(),
                plan.stack
            );
        }

        let mut output = String::new();

        let _ = writeln!(output, "\nPlan for {}", plan.stack.to_string().bold());
        let _ = write!(
            output,
            "   Program hash: {}\n\n",
            &plan.program_hash[..12.min(plan.program_hash.len())]
        );

        let rows: Vec<PlanActionRow> = plan
            .actions
            .iter()
            .map(|a| PlanActionRow {
                index: a.index + 1,
                action: Self::format_action_type(a.action_type),
                resource: a.resource_name.clone(),
                resource_type: a.resource_type.clone(),
                reason: Self::truncate(&a.reason, 40),
            })
            .collect();

        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        if detailed {
            output.push_str("\nChanged fields:\n");
            for action in plan.actions.iter().filter(|a| !a.changes.is_empty()) {
                let _ = writeln!(
                    output,
                    "   {}: {}",
                    action.resource_name,
                    action.changes.join(", ")
                );
            }
        }

        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to replace, {} to delete\n",
            plan.count(ActionType::Create).to_string().green(),
            plan.count(ActionType::Update).to_string().yellow(),
            plan.count(ActionType::Replace).to_string().magenta(),
            plan.count(ActionType::Delete).to_string().red()
        );

        output
    }

    /// Formats stack outputs.
    #[must_use]
    pub fn format_outputs(&self, outputs: &StackOutputs) -> String {
        match self.format {
            OutputFormat::Json => to_json(outputs),
            OutputFormat::Text => {
                let mut output = String::new();

                if let Some(summary) = outputs.summary {
                    let _ = writeln!(
                        output,
                        "Resources: {} created, {} updated, {} replaced, {} deleted, {} unchanged",
                        summary.created.to_string().green(),
                        summary.updated.to_string().yellow(),
                        summary.replaced.to_string().magenta(),
                        summary.deleted.to_string().red(),
                        summary.unchanged
                    );
                }

                if outputs.values.is_empty() {
                    let _ = writeln!(output, "Stack {} has no outputs.", outputs.stack);
                    return output;
                }

                let rows: Vec<OutputRow> = outputs
                    .values
                    .iter()
                    .map(|(name, value)| OutputRow {
                        name: name.clone(),
                        value: value
                            .as_str()
                            .map_or_else(|| value.to_string(), ToString::to_string),
                    })
                    .collect();
                output.push_str(&Table::new(rows).to_string());
                output.push('\n');
                output
            }
        }
    }

    /// Formats a list of stacks.
    #[must_use]
    pub fn format_stacks(&self, project: &str, stacks: &[StackRef]) -> String {
        match self.format {
            OutputFormat::Json => to_json(&stacks),
            OutputFormat::Text => {
                if stacks.is_empty() {
                    return format!("Project {project} has no stacks.\n");
                }
                let mut output = format!("Stacks of {}:\n", project.bold());
                for stack in stacks {
                    let _ = writeln!(output, "   {}", stack.stack);
                }
                output
            }
        }
    }

    /// Formats recorded stack state.
    #[must_use]
    pub fn format_state(&self, state: &StackState) -> String {
        match self.format {
            OutputFormat::Json => to_json(state),
            OutputFormat::Text => {
                let mut output = String::new();

                let _ = write!(output, "\nState: {}/{}\n\n", state.project, state.stack);
                let _ = writeln!(output, "   Version: {}", state.version);
                let _ = writeln!(
                    output,
                    "   Program hash: {}",
                    &state.program_hash[..12.min(state.program_hash.len())]
                );
                let _ = writeln!(output, "   Created: {}", state.created_at);
                let _ = writeln!(output, "   Last updated: {}", state.last_updated);
                let _ = writeln!(output, "   Resources: {}\n", state.resources.len());

                if !state.resources.is_empty() {
                    let rows: Vec<ResourceRow> = state
                        .resources
                        .values()
                        .map(|r| ResourceRow {
                            name: r.name.clone(),
                            resource_type: r.resource_type.clone(),
                            id: Self::truncate(&r.provider_id, 40),
                            hash: r.property_hash.chars().take(12).collect(),
                            updated: r.updated_at.format("%Y-%m-%d %H:%M").to_string(),
                        })
                        .collect();
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }

                if !state.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", state.history.len());
                    for entry in state.history.iter().rev().take(5) {
                        let status = if entry.success {
                            "✓".green()
                        } else {
                            "✗".red()
                        };
                        let _ = write!(
                            output,
                            "     {status} {} - {} ({})",
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.operation,
                            entry.resources.join(", ")
                        );
                        if let Some(error) = &entry.error {
                            let _ = write!(output, ": {error}");
                        }
                        output.push('\n');
                    }
                }

                output
            }
        }
    }

    /// Formats a validation result.
    #[must_use]
    pub fn format_validation(&self, result: &ValidationResult, show_warnings: bool) -> String {
        match self.format {
            OutputFormat::Json => to_json(&serde_json::json!({
                "valid": result.is_valid(),
                "errors": result.errors.iter().map(ToString::to_string).collect::<Vec<_>>(),
                "warnings": result.warnings,
            })),
            OutputFormat::Text => {
                let mut output = format!("{} Configuration and program are valid.\n", "✓".green());
                if show_warnings && !result.warnings.is_empty() {
                    let _ = write!(output, "\n{} Warnings:\n", "⚠".yellow());
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                }
                output
            }
        }
    }

    /// Formats a progress event as one line.
    #[must_use]
    pub fn format_event(&self, event: &ProgressEvent) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string(event).unwrap_or_default(),
            OutputFormat::Text => {
                let line = event.to_string();
                match event {
                    ProgressEvent::ActionSucceeded { .. } => line.green().to_string(),
                    ProgressEvent::ActionFailed { .. } => line.red().to_string(),
                    ProgressEvent::ActionRetrying { .. } | ProgressEvent::ActionSkipped { .. } => {
                        line.yellow().to_string()
                    }
                    _ => line,
                }
            }
        }
    }

    /// Formats the success message of the operation that produced `outputs`.
    #[must_use]
    pub fn applied(&self, outputs: &StackOutputs) -> String {
        let stack = &outputs.stack;
        let message = match outputs.operation {
            Some(StackOperation::Create) => format!("Successfully created stack '{stack}'"),
            Some(StackOperation::Destroy) => format!("Stack '{stack}' successfully deleted!"),
            Some(StackOperation::Update) | None => format!("Stack '{stack}' successfully updated!"),
        };
        self.success(&message)
    }

    /// Formats a success message.
    #[must_use]
    pub fn success(&self, message: &str) -> String {
        self.message("success", &"✓".green(), message)
    }

    /// Formats an error message.
    #[must_use]
    pub fn error(&self, message: &str) -> String {
        self.message("error", &"✗".red(), message)
    }

    fn message(&self, status: &str, marker: &colored::ColoredString, message: &str) -> String {
        match self.format {
            OutputFormat::Json => to_json(&serde_json::json!({ "status": status, "message": message })),
            OutputFormat::Text => format!("{marker} {message}"),
        }
    }

    /// Formats an action type with color.
    fn format_action_type(action_type: ActionType) -> String {
        match action_type {
            ActionType::Create => "+create".green().to_string(),
            ActionType::Update => "~update".yellow().to_string(),
            ActionType::Replace => "+-replace".magenta().to_string(),
            ActionType::Delete => "-delete".red().to_string(),
        }
    }

    /// Truncates a string to a maximum number of characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{head}...")
        }
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::ChangeSummary;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn outputs() -> StackOutputs {
        StackOutputs {
            stack: StackRef::new("shop", "dev"),
            values: BTreeMap::from([(String::from("name"), json!("nginx-1a2b3c4d"))]),
            operation: Some(StackOperation::Create),
            summary: Some(ChangeSummary {
                created: 1,
                ..ChangeSummary::default()
            }),
        }
    }

    #[test]
    fn test_outputs_as_json() {
        let rendered = OutputFormatter::new(OutputFormat::Json).format_outputs(&outputs());
        let value: serde_json::Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(value["values"]["name"], json!("nginx-1a2b3c4d"));
        assert_eq!(value["stack"]["stack"], json!("dev"));
        assert_eq!(value["summary"]["created"], json!(1));
    }

    #[test]
    fn test_outputs_as_text() {
        colored::control::set_override(false);
        let rendered = OutputFormatter::new(OutputFormat::Text).format_outputs(&outputs());
        assert!(rendered.contains("1 created"));
        assert!(rendered.contains("nginx-1a2b3c4d"));
    }

    #[test]
    fn test_applied_message_follows_operation() {
        colored::control::set_override(false);
        let formatter = OutputFormatter::new(OutputFormat::Text);
        let mut outputs = outputs();
        assert_eq!(formatter.applied(&outputs), "✓ Successfully created stack 'shop/dev'");

        outputs.operation = Some(StackOperation::Update);
        assert_eq!(formatter.applied(&outputs), "✓ Stack 'shop/dev' successfully updated!");
    }

    #[test]
    fn test_empty_plan() {
        colored::control::set_override(false);
        let plan = OperationPlan::empty(&StackRef::new("shop", "dev"), "abc");
        let rendered = OutputFormatter::new(OutputFormat::Text).format_plan(&plan, false);
        assert!(rendered.contains("shop/dev is up to date"));
    }

    #[test]
    fn test_truncate() {
        assert_eq!(OutputFormatter::truncate("short", 10), "short");
        assert_eq!(OutputFormatter::truncate("default/nginx-1a2b3c4d", 10), "default...");
    }
}
