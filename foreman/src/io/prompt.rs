//! Prompt rendering for coding-agent invocations.

use std::path::Path;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;

const TASK_TEMPLATE: &str = include_str!("prompts/task.md");

/// Issue fields handed to the template.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct IssueContext {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
    pub url: Option<String>,
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("task", TASK_TEMPLATE)
            .expect("task template should be valid");
        Self { env }
    }

    /// Render the prompt for one issue, optionally replaying the previous
    /// failure so the agent does not repeat it.
    pub fn render_task(
        &self,
        issue: &IssueContext,
        failure: Option<&str>,
        output_path: &Path,
    ) -> Result<String> {
        let template = self.env.get_template("task")?;
        let rendered = template
            .render(context! {
                issue => issue,
                failure => failure.map(str::trim).filter(|s| !s.is_empty()),
                output_path => output_path.display().to_string(),
            })
            .context("render task prompt")?;
        Ok(rendered)
    }
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn issue() -> IssueContext {
        IssueContext {
            number: 42,
            title: "Fix flaky retry test".to_string(),
            body: "The retry test fails under load.".to_string(),
            labels: vec!["bug".to_string(), "ci".to_string()],
            url: Some("https://example.test/issues/42".to_string()),
        }
    }

    #[test]
    fn renders_issue_fields_and_output_path() {
        let engine = PromptEngine::new();
        let prompt = engine
            .render_task(&issue(), None, &PathBuf::from("/tmp/out.json"))
            .expect("render");

        assert!(prompt.contains("issue #42"));
        assert!(prompt.contains("Fix flaky retry test"));
        assert!(prompt.contains("bug, ci"));
        assert!(prompt.contains("/tmp/out.json"));
        assert!(!prompt.contains("Previous attempt"));
    }

    #[test]
    fn includes_failure_section_only_when_present() {
        let engine = PromptEngine::new();
        let prompt = engine
            .render_task(&issue(), Some("guard failed: tests red"), Path::new("o.json"))
            .expect("render");
        assert!(prompt.contains("Previous attempt"));
        assert!(prompt.contains("guard failed: tests red"));

        let blank = engine
            .render_task(&issue(), Some("   "), Path::new("o.json"))
            .expect("render");
        assert!(!blank.contains("Previous attempt"));
    }
}
