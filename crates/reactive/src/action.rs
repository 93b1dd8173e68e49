//! Reaction actions and the tasks they synthesize.

use conductor_core::{Execution, TaskPriority, TaskSpec, TaskType};
use serde::Serialize;
use serde_json::{json, Value};

/// What a matched rule asks the bridge to do.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ReactionAction {
    /// Rerun the code through a syntax fixer
    AutoFixSyntax,

    /// Install a missing module
    InstallModule {
        /// Package name, as the package manager knows it
        module: String,
    },

    /// Look for a faster version of code that hit the time limit
    OptimizeCode,

    /// Feed structured output into a decision
    ProcessData {
        /// Parsed output
        data: Value,
    },

    /// Index the produced artifacts
    StoreArtifacts,

    /// Enqueue a caller-provided task
    Enqueue {
        /// Task to insert
        task: TaskSpec,
    },
}

impl ReactionAction {
    /// Wire name of the action.
    pub fn name(&self) -> &'static str {
        match self {
            ReactionAction::AutoFixSyntax => "auto_fix_syntax",
            ReactionAction::InstallModule { .. } => "install_module",
            ReactionAction::OptimizeCode => "optimize_code",
            ReactionAction::ProcessData { .. } => "process_data",
            ReactionAction::StoreArtifacts => "store_artifacts",
            ReactionAction::Enqueue { .. } => "enqueue",
        }
    }

    /// Build the follow-up task for `execution`.
    pub fn to_task(&self, execution: &Execution) -> TaskSpec {
        let id = execution.id.to_string();
        match self {
            ReactionAction::AutoFixSyntax => {
                TaskSpec::new(TaskType::CodeExecution, "Fix syntax error")
                    .with_priority(TaskPriority::High)
                    .with_input("action", self.name())
                    .with_input("execution_id", id)
                    .with_input("language", execution.language.as_str())
                    .with_input("code", execution.code.as_str())
                    .with_input("error", execution.error.clone().unwrap_or_default())
            }
            ReactionAction::InstallModule { module } => {
                TaskSpec::new(TaskType::CodeExecution, format!("Install missing module {module}"))
                    .with_priority(TaskPriority::High)
                    .with_input("action", self.name())
                    .with_input("execution_id", id)
                    .with_input("language", execution.language.as_str())
                    .with_input("module", module.as_str())
                    .with_input("command", install_command(&execution.language, module))
                    .with_input("retry_code", execution.code.as_str())
            }
            ReactionAction::OptimizeCode => {
                let timeout_ms = execution.duration.map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
                TaskSpec::new(TaskType::CodeExecution, "Optimize slow code")
                    .with_priority(TaskPriority::Medium)
                    .with_input("action", self.name())
                    .with_input("execution_id", id)
                    .with_input("language", execution.language.as_str())
                    .with_input("code", execution.code.as_str())
                    .with_input("timeout_ms", json!(timeout_ms))
            }
            ReactionAction::ProcessData { data } => {
                TaskSpec::new(TaskType::Decision, "Process structured execution output")
                    .with_priority(TaskPriority::Medium)
                    .with_input("action", self.name())
                    .with_input("execution_id", id)
                    .with_input("data", data.clone())
            }
            ReactionAction::StoreArtifacts => {
                let artifacts: Vec<Value> = execution
                    .artifacts
                    .iter()
                    .map(|a| json!({ "name": a.name, "kind": a.kind, "location": a.location }))
                    .collect();
                TaskSpec::new(
                    TaskType::FileAnalysis,
                    format!("Store {} artifact(s)", artifacts.len()),
                )
                .with_priority(TaskPriority::Low)
                .with_input("action", self.name())
                .with_input("execution_id", id)
                .with_input("artifacts", artifacts)
            }
            ReactionAction::Enqueue { task } => task.clone(),
        }
    }
}

/// Package manager command for `module` in `language`.
pub fn install_command(language: &str, module: &str) -> String {
    match language.to_ascii_lowercase().as_str() {
        "javascript" | "js" | "node" | "typescript" | "ts" => format!("npm install {module}"),
        _ => format!("pip install {module}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_core::Artifact;
    use std::time::Duration;

    #[test]
    fn test_install_task_carries_module_and_command() {
        let execution = Execution::new("import numpy", "python").failed("ModuleNotFoundError");
        let spec = ReactionAction::InstallModule { module: "numpy".into() }.to_task(&execution);

        assert_eq!(spec.task_type, TaskType::CodeExecution);
        assert_eq!(spec.priority, TaskPriority::High);
        assert_eq!(spec.input["module"], "numpy");
        assert_eq!(spec.input["command"], "pip install numpy");
        assert_eq!(spec.input["retry_code"], "import numpy");
    }

    #[test]
    fn test_install_command_by_language() {
        assert_eq!(install_command("JavaScript", "lodash"), "npm install lodash");
        assert_eq!(install_command("python", "pandas"), "pip install pandas");
    }

    #[test]
    fn test_priorities_follow_action_table() {
        let execution = Execution::new("x", "python")
            .timed_out(Duration::from_secs(30))
            .with_artifact(Artifact {
                name: "plot.png".into(),
                kind: "image/png".into(),
                location: "/tmp/plot.png".into(),
            });

        let optimize = ReactionAction::OptimizeCode.to_task(&execution);
        assert_eq!(optimize.priority, TaskPriority::Medium);
        assert_eq!(optimize.input["timeout_ms"], 30_000);

        let store = ReactionAction::StoreArtifacts.to_task(&execution);
        assert_eq!(store.task_type, TaskType::FileAnalysis);
        assert_eq!(store.priority, TaskPriority::Low);
        assert_eq!(store.input["artifacts"][0]["name"], "plot.png");

        let data = ReactionAction::ProcessData { data: json!({"rows": 3}) }.to_task(&execution);
        assert_eq!(data.task_type, TaskType::Decision);
        assert_eq!(data.input["data"]["rows"], 3);
    }

    #[test]
    fn test_action_serializes_with_tag() {
        let value = serde_json::to_value(ReactionAction::InstallModule { module: "requests".into() })
            .unwrap();
        assert_eq!(value, json!({"action": "install_module", "module": "requests"}));
    }
}
