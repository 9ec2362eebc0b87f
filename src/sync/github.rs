use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::SyncError;
use crate::models::{ExternalIssue, Provider, TaskSource};

use super::{CredentialProvider, IssueSource};

pub const GITHUB_API_URL: &str = "https://api.github.com";
const DEFAULT_PAGE_SIZE: u32 = 100;

#[derive(Debug, Serialize, Deserialize)]
pub struct GitHubLabel {
    pub name: String,
}

/// A GitHub issue (subset of fields).
#[derive(Debug, Serialize, Deserialize)]
pub struct GitHubIssue {
    pub number: i64,
    pub title: String,
    pub body: Option<String>,
    pub state: String,
    pub html_url: String,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub labels: Vec<GitHubLabel>,
    /// Pull requests also come through the issues endpoint; filter them out.
    pub pull_request: Option<serde_json::Value>,
}

impl GitHubIssue {
    fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l.name.eq_ignore_ascii_case(label))
    }

    fn into_external(self) -> ExternalIssue {
        ExternalIssue {
            external_id: self.number.to_string(),
            title: self.title,
            body: self.body.unwrap_or_default(),
            url: Some(self.html_url),
            state: self.state,
            updated_at: self.updated_at,
        }
    }
}

/// Drop pull requests and, when a label filter is set, unlabelled issues.
pub fn select_issues(page: Vec<GitHubIssue>, label: Option<&str>) -> Vec<ExternalIssue> {
    page.into_iter()
        .filter(|i| i.pull_request.is_none())
        .filter(|i| label.is_none_or(|l| i.has_label(l)))
        .map(GitHubIssue::into_external)
        .collect()
}

/// Lists open issues through the REST issues endpoint.
pub struct GitHubIssueSource {
    client: reqwest::Client,
    api_url: String,
    page_size: u32,
    credentials: Arc<dyn CredentialProvider>,
}

impl GitHubIssueSource {
    pub fn new(api_url: impl Into<String>, credentials: Arc<dyn CredentialProvider>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            page_size: DEFAULT_PAGE_SIZE,
            credentials,
        }
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Paginates through all pages. The label filter is sent to GitHub and
    /// re-checked locally.
    async fn list_issues(
        &self,
        token: &str,
        owner_repo: &str,
        label: Option<&str>,
    ) -> anyhow::Result<Vec<ExternalIssue>> {
        let url = format!("{}/repos/{}/issues", self.api_url, owner_repo);
        let per_page = self.page_size.to_string();
        let mut all_issues = Vec::new();
        let mut page = 1u32;

        loop {
            let mut query = vec![
                ("state", "open".to_string()),
                ("per_page", per_page.clone()),
                ("page", page.to_string()),
            ];
            if let Some(label) = label {
                query.push(("labels", label.to_string()));
            }
            let resp: Vec<GitHubIssue> = self
                .client
                .get(&url)
                .header("Authorization", format!("Bearer {}", token))
                .header("User-Agent", "ticketflow")
                .header("Accept", "application/vnd.github+json")
                .query(&query)
                .send()
                .await
                .context("Failed to send issues request to GitHub")?
                .error_for_status()
                .context("GitHub issues API returned error status")?
                .json()
                .await
                .context("Failed to parse issues response from GitHub")?;

            let count = resp.len();
            all_issues.extend(select_issues(resp, label));

            if count < self.page_size as usize {
                break;
            }
            page += 1;
        }

        Ok(all_issues)
    }
}

#[async_trait]
impl IssueSource for GitHubIssueSource {
    fn provider(&self) -> Provider {
        Provider::Github
    }

    async fn fetch(&self, source: &TaskSource) -> Result<Vec<ExternalIssue>, SyncError> {
        let token = self.credentials.credential(Provider::Github).await?;
        self.list_issues(&token, &source.repository, source.filter.as_deref())
            .await
            .map_err(|source| SyncError::Fetch {
                provider: Provider::Github.to_string(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LifecycleStatus;
    use crate::sync::StaticCredentials;
    use axum::extract::Query;
    use axum::http::HeaderMap;
    use axum::{Json, Router, routing::get};
    use serde_json::json;
    use std::collections::HashMap;

    fn issue(number: i64, labels: &[&str], pr: bool) -> GitHubIssue {
        GitHubIssue {
            number,
            title: format!("Issue {}", number),
            body: None,
            state: "open".into(),
            html_url: format!("https://github.com/o/r/issues/{}", number),
            updated_at: Utc::now(),
            labels: labels
                .iter()
                .map(|l| GitHubLabel {
                    name: l.to_string(),
                })
                .collect(),
            pull_request: pr.then(|| json!({"url": "x"})),
        }
    }

    fn source(filter: Option<&str>) -> TaskSource {
        TaskSource {
            id: 1,
            name: "web".into(),
            provider: Provider::Github,
            repository: "o/r".into(),
            filter: filter.map(String::from),
            sync_status: LifecycleStatus::Active,
            sync_status_updated_at: Utc::now(),
            last_synced_at: None,
            last_sync_error: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_select_issues_drops_pull_requests() {
        let selected = select_issues(vec![issue(1, &[], false), issue(2, &[], true)], None);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].external_id, "1");
        assert_eq!(selected[0].body, "");
    }

    #[test]
    fn test_select_issues_applies_label_filter() {
        let selected = select_issues(
            vec![issue(1, &["AI-Ready"], false), issue(2, &["bug"], false)],
            Some("ai-ready"),
        );
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].external_id, "1");
    }

    #[test]
    fn test_issue_deserializes_from_api_json() {
        let raw = json!({
            "number": 42,
            "title": "Crash on save",
            "body": "steps...",
            "state": "open",
            "html_url": "https://github.com/o/r/issues/42",
            "updated_at": "2026-03-01T10:00:00Z",
            "labels": [{"name": "bug", "color": "f00"}]
        });
        let parsed: GitHubIssue = serde_json::from_value(raw).unwrap();
        assert!(parsed.pull_request.is_none());
        assert!(parsed.has_label("bug"));
    }

    async fn issues_handler(
        headers: HeaderMap,
        Query(q): Query<HashMap<String, String>>,
    ) -> Json<serde_json::Value> {
        assert_eq!(
            headers.get("authorization").and_then(|v| v.to_str().ok()),
            Some("Bearer ghp_test")
        );
        let page: i64 = q.get("page").and_then(|p| p.parse().ok()).unwrap_or(1);
        let items: Vec<serde_json::Value> = match page {
            1 => vec![1, 2],
            2 => vec![3],
            _ => vec![],
        }
        .into_iter()
        .map(|n: i64| {
            json!({
                "number": n,
                "title": format!("Issue {}", n),
                "body": null,
                "state": "open",
                "html_url": format!("https://github.com/o/r/issues/{}", n),
                "updated_at": "2026-03-01T10:00:00Z",
                "labels": []
            })
        })
        .collect();
        Json(json!(items))
    }

    #[tokio::test]
    async fn test_fetch_paginates_until_short_page() {
        let app = Router::new().route("/repos/o/r/issues", get(issues_handler));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let adapter = GitHubIssueSource::new(
            format!("http://{}", addr),
            Arc::new(StaticCredentials::new(Some("ghp_test".into()))),
        )
        .with_page_size(2);
        let issues = adapter.fetch(&source(None)).await.unwrap();
        let ids: Vec<&str> = issues.iter().map(|i| i.external_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn test_fetch_without_token_is_credential_error() {
        let adapter =
            GitHubIssueSource::new("http://127.0.0.1:9", Arc::new(StaticCredentials::default()));
        let err = adapter.fetch(&source(None)).await.unwrap_err();
        assert!(matches!(err, SyncError::Credential { .. }));
    }
}
