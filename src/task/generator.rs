#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{self, LlmConfig, ServiceMode};

const TICKET_TEMPLATE: &str = "# [Concise, action-oriented summary]

## Description
Brief explanation of the task. What needs to be done and why?

## Context
What triggered this task? Is it related to a bug, a feature request, a customer need, or a refactor?

## Acceptance Criteria / Definition of Done
- [ ] Clear and testable success condition 1
- [ ] Outcome or deliverable 2
- [ ] Optional edge cases or error handling

## Links & References
- [Ticket / Design doc / PRD](https://)
- Related tickets: ABC-123, XYZ-456";

const DEFAULT_PROMPT: &str = "You are helping write an issue tracker ticket.
Expand the one-line request below into JSON with the keys \"summary\",
\"description\" (markdown) and \"type\" (Task, Bug or Story).

Request: {{input}}";

/// A structured ticket proposal built from a one-line summary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskDraft {
    pub summary: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type", default = "default_type")]
    pub issue_type: String,
}

fn default_type() -> String {
    "Task".to_owned()
}

/// Expands a short summary into a [`TaskDraft`], either from a fixed template
/// or by asking an LLM endpoint. Never fails: errors are folded into the draft
/// so the user can still edit and submit it.
#[derive(Debug, Clone)]
pub struct TaskGenerator {
    cfg: LlmConfig,
    client: reqwest::Client,
}

impl TaskGenerator {
    pub fn from_config(cfg: &LlmConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_seconds.max(1)))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            cfg: cfg.clone(),
            client,
        })
    }

    pub async fn generate(&self, summary: &str) -> TaskDraft {
        if self.cfg.mode == ServiceMode::Mock {
            return TaskDraft {
                summary: format!("generated {summary}"),
                description: TICKET_TEMPLATE.to_owned(),
                issue_type: "Bug".to_owned(),
            };
        }

        let template = match self.load_prompt() {
            Ok(t) => t,
            Err(e) => {
                warn!("failed to load prompt template: {e:#}");
                return TaskDraft {
                    summary: format!("[Prompt Load Error] {summary}"),
                    description: format!(
                        "# Prompt error\n\nFailed to load or render prompt:\n\n{e:#}"
                    ),
                    issue_type: "Task".to_owned(),
                };
            }
        };
        let prompt = template.replace("{{input}}", summary);

        match self.request(&prompt).await {
            Ok(draft) => draft,
            Err(e) => {
                warn!("LLM call failed: {e:#}");
                TaskDraft {
                    summary: format!("[Fallback] {summary}"),
                    description: format!(
                        "# [LLM Error]\n\nThe LLM failed to respond.\n\nError: {e:#}"
                    ),
                    issue_type: "Task".to_owned(),
                }
            }
        }
    }

    fn load_prompt(&self) -> anyhow::Result<String> {
        if self.cfg.prompt_path.trim().is_empty() {
            return Ok(DEFAULT_PROMPT.to_owned());
        }
        let path = config::expand_path(&self.cfg.prompt_path)?;
        std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))
    }

    async fn request(&self, prompt: &str) -> anyhow::Result<TaskDraft> {
        let url = format!(
            "{}{}",
            self.cfg.base_url.trim_end_matches('/'),
            self.cfg.endpoint
        );
        debug!(%url, "requesting ticket draft");
        let draft = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "prompt": prompt }))
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?
            .error_for_status()?
            .json::<TaskDraft>()
            .await
            .context("failed to decode draft")?;
        Ok(draft)
    }
}
