//! Built-in reaction rules.

use conductor_core::{Execution, ExecutionStatus};
use regex::Regex;
use serde_json::Value;

use crate::action::ReactionAction;
use crate::rule::ReactionRule;

/// The default rule set, in evaluation order.
pub fn default_rules() -> Vec<ReactionRule> {
    vec![
        ReactionRule::new("syntax_error", syntax_error),
        ReactionRule::new("missing_module", missing_module),
        ReactionRule::new("timeout", timeout),
        ReactionRule::new("structured_output", structured_output),
        ReactionRule::new("artifacts", artifacts),
    ]
}

fn syntax_error(execution: &Execution) -> Option<ReactionAction> {
    let error = failed_with(execution)?;
    ["SyntaxError", "IndentationError", "TabError"]
        .iter()
        .any(|kind| error.contains(kind))
        .then_some(ReactionAction::AutoFixSyntax)
}

fn missing_module(execution: &Execution) -> Option<ReactionAction> {
    let error = failed_with(execution)?;
    let module = extract_module(error, &execution.language)?;
    Some(ReactionAction::InstallModule { module })
}

fn timeout(execution: &Execution) -> Option<ReactionAction> {
    (execution.status == ExecutionStatus::Timeout).then_some(ReactionAction::OptimizeCode)
}

fn structured_output(execution: &Execution) -> Option<ReactionAction> {
    if execution.status != ExecutionStatus::Success {
        return None;
    }
    let output = execution.output.as_deref()?.trim();
    if !(output.starts_with('{') || output.starts_with('[')) {
        return None;
    }
    let data: Value = serde_json::from_str(output).ok()?;
    Some(ReactionAction::ProcessData { data })
}

fn artifacts(execution: &Execution) -> Option<ReactionAction> {
    (execution.status == ExecutionStatus::Success && !execution.artifacts.is_empty())
        .then_some(ReactionAction::StoreArtifacts)
}

fn failed_with(execution: &Execution) -> Option<&str> {
    match execution.status {
        ExecutionStatus::Error => execution.error.as_deref(),
        _ => None,
    }
}

/// Pull the missing package name out of an import error.
///
/// Python submodules resolve to their top-level package; Node relative
/// paths are not packages and yield nothing.
pub fn extract_module(error: &str, language: &str) -> Option<String> {
    let lang = language.to_ascii_lowercase();
    let node = matches!(lang.as_str(), "javascript" | "js" | "node" | "typescript" | "ts");

    if !node {
        if let Some(module) = python_module(error) {
            return Some(module);
        }
    }
    node_module(error)
}

fn python_module(error: &str) -> Option<String> {
    let re = Regex::new(r"No module named '([^']+)'").ok()?;
    let name = re.captures(error)?.get(1)?.as_str();
    name.split('.').next().map(str::to_string)
}

fn node_module(error: &str) -> Option<String> {
    let re = Regex::new(r"Cannot find module '([^']+)'").ok()?;
    let name = re.captures(error)?.get(1)?.as_str();
    if name.starts_with('.') || name.starts_with('/') {
        return None;
    }
    Some(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_core::Artifact;
    use std::time::Duration;

    fn matches(execution: &Execution) -> Vec<(&'static str, ReactionAction)> {
        let rules = default_rules();
        let mut hits = Vec::new();
        for rule in &rules {
            if let Some(action) = rule.evaluate(execution) {
                hits.push((action.name(), action));
            }
        }
        hits
    }

    #[test]
    fn test_missing_python_module() {
        let execution = Execution::new("import numpy as np", "python")
            .failed("ModuleNotFoundError: No module named 'numpy'");
        let hits = matches(&execution);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].1, ReactionAction::InstallModule { module: "numpy".into() });
    }

    #[test]
    fn test_submodule_resolves_to_package() {
        assert_eq!(
            extract_module("ImportError: No module named 'google.cloud.storage'", "python"),
            Some("google".into())
        );
    }

    #[test]
    fn test_node_modules() {
        assert_eq!(
            extract_module("Error: Cannot find module 'express'", "javascript"),
            Some("express".into())
        );
        assert_eq!(extract_module("Error: Cannot find module './util'", "javascript"), None);
        assert_eq!(extract_module("TypeError: x is undefined", "javascript"), None);
    }

    #[test]
    fn test_syntax_error() {
        let execution =
            Execution::new("def f(:\n  pass", "python").failed("  File \"<stdin>\", line 1\nSyntaxError: invalid syntax");
        let hits = matches(&execution);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "auto_fix_syntax");
    }

    #[test]
    fn test_timeout() {
        let execution = Execution::new("while True: pass", "python").timed_out(Duration::from_secs(30));
        let hits = matches(&execution);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "optimize_code");
    }

    #[test]
    fn test_structured_output_and_artifacts() {
        let execution = Execution::new("print(json.dumps(rows))", "python")
            .succeeded("  [{\"id\": 1}]\n")
            .with_artifact(Artifact {
                name: "rows.csv".into(),
                kind: "csv".into(),
                location: "/tmp/rows.csv".into(),
            });
        let names: Vec<_> = matches(&execution).into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["process_data", "store_artifacts"]);
    }

    #[test]
    fn test_plain_success_matches_nothing() {
        let execution = Execution::new("print('hi')", "python").succeeded("hi\n");
        assert!(matches(&execution).is_empty());

        let not_json = Execution::new("print('{oops')", "python").succeeded("{oops");
        assert!(matches(&not_json).is_empty());
    }
}
