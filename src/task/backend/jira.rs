#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{self, Config, JiraConfig, ServiceMode};
use crate::error::CtrlLordError;
use crate::task::backend::TaskBackend;
use crate::task::model::{TaskPayload, TaskResult};
use crate::task::storage::TaskStorage;

const MOCK_LATENCY: Duration = Duration::from_millis(500);
const MOCK_KEY_DRAWS: usize = 64;

/// Issue tracker client speaking the Jira REST v2 API.
///
/// In `mock` mode no request is made; a fake `MOCK-<n>` issue comes back after
/// a short simulated delay. Created issues are also written to the task data
/// dir (when one is configured) so they show up in the daily list.
#[derive(Debug)]
pub struct JiraBackend {
    cfg: JiraConfig,
    client: reqwest::Client,
    storage: Option<TaskStorage>,
    mock_latency: Duration,
}

impl JiraBackend {
    pub fn from_config(cfg: &Config) -> anyhow::Result<Self> {
        Ok(Self {
            cfg: cfg.jira.clone(),
            client: build_client(&cfg.jira)?,
            storage: storage_for(cfg)?,
            mock_latency: MOCK_LATENCY,
        })
    }

    #[must_use]
    pub fn with_mock_latency(mut self, latency: Duration) -> Self {
        self.mock_latency = latency;
        self
    }

    fn browse_url(&self, key: &str) -> String {
        format!("{}/browse/{key}", self.cfg.base_url.trim_end_matches('/'))
    }

    async fn create_mock(&self, payload: &TaskPayload) -> TaskResult {
        tokio::time::sleep(self.mock_latency).await;
        let key = self.free_mock_key();
        let url = self.browse_url(&key);
        TaskResult::from_payload(payload, key, url)
    }

    /// Random `MOCK-<100..999>` key with no record on disk yet. Once the
    /// range is crowded, counts upward from `MOCK-1000` instead.
    fn free_mock_key(&self) -> String {
        let taken = |key: &str| {
            self.storage
                .as_ref()
                .is_some_and(|s| s.record_path(key).exists())
        };
        for _ in 0..MOCK_KEY_DRAWS {
            let key = format!("MOCK-{}", 100 + Uuid::new_v4().as_u128() % 900);
            if !taken(&key) {
                return key;
            }
        }
        let mut n = 1000u64;
        loop {
            let key = format!("MOCK-{n}");
            if !taken(&key) {
                return key;
            }
            n += 1;
        }
    }

    async fn create_issue(&self, payload: &TaskPayload) -> anyhow::Result<TaskResult> {
        let endpoint = format!("{}/rest/api/2/issue", self.cfg.base_url.trim_end_matches('/'));
        let mut fields = json!({
            "project": { "key": self.cfg.project_key },
            "summary": payload.summary,
            "description": payload.description,
            "issuetype": { "name": payload.issue_type },
        });
        if !payload.component.trim().is_empty() {
            fields["components"] = json!([{ "name": payload.component }]);
        }

        info!(project = %self.cfg.project_key, "creating issue");
        let mut req = self.client.post(&endpoint).json(&json!({ "fields": fields }));
        if !self.cfg.username.is_empty() {
            req = req.basic_auth(&self.cfg.username, Some(&self.cfg.token));
        } else if !self.cfg.token.is_empty() {
            req = req.bearer_auth(&self.cfg.token);
        }

        let resp = req
            .send()
            .await
            .with_context(|| format!("request to {endpoint} failed"))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            error!(status = status.as_u16(), "issue creation rejected");
            return Err(CtrlLordError::HttpStatus {
                backend: "jira",
                status: status.as_u16(),
                body,
            }
            .into());
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to decode issue creation response")?;
        let key = body
            .get("key")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("UNKNOWN")
            .to_owned();
        debug!(%key, "issue created");
        let url = self.browse_url(&key);
        Ok(TaskResult::from_payload(payload, key, url))
    }
}

#[async_trait]
impl TaskBackend for JiraBackend {
    fn name(&self) -> &'static str {
        "jira"
    }

    async fn submit(&mut self, payload: &TaskPayload) -> anyhow::Result<TaskResult> {
        let result = match self.cfg.mode {
            ServiceMode::Mock => self.create_mock(payload).await,
            ServiceMode::Live => self.create_issue(payload).await?,
        };
        if let Some(storage) = &self.storage
            && let Err(e) = storage.save(&result)
        {
            warn!(key = %result.key, "failed to save task record: {e:#}");
        }
        Ok(result)
    }

    fn reload(&mut self, cfg: &Config) -> anyhow::Result<()> {
        info!("jira backend config is reloading");
        self.client = build_client(&cfg.jira)?;
        self.storage = storage_for(cfg)?;
        self.cfg = cfg.jira.clone();
        Ok(())
    }
}

fn build_client(cfg: &JiraConfig) -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(cfg.timeout_seconds.max(1)))
        .build()
        .context("failed to build HTTP client")
}

fn storage_for(cfg: &Config) -> anyhow::Result<Option<TaskStorage>> {
    if cfg.task.data_dir.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(TaskStorage::new(config::expand_path(
        &cfg.task.data_dir,
    )?)))
}
