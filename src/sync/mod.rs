//! Task-source synchronization: provider adapters and the diffing engine.

pub mod engine;
pub mod github;

use async_trait::async_trait;

use crate::errors::SyncError;
use crate::models::{ExternalIssue, Provider, TaskSource};

pub use engine::{SyncEngine, SyncReport};
pub use github::GitHubIssueSource;

/// Fetches the current item list for one task source.
#[async_trait]
pub trait IssueSource: Send + Sync {
    fn provider(&self) -> Provider;

    async fn fetch(&self, source: &TaskSource) -> Result<Vec<ExternalIssue>, SyncError>;
}

/// Supplies provider credentials. Token refresh, if any, happens behind
/// this call.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn credential(&self, provider: Provider) -> Result<String, SyncError>;

    /// Reference a worker can resolve on its own side, e.g. `env:GITHUB_TOKEN`.
    fn reference(&self, provider: Provider) -> String;
}

/// Token taken from configuration (or `GITHUB_TOKEN`).
#[derive(Clone, Default)]
pub struct StaticCredentials {
    github_token: Option<String>,
}

impl StaticCredentials {
    pub fn new(github_token: Option<String>) -> Self {
        Self { github_token }
    }
}

impl std::fmt::Debug for StaticCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticCredentials")
            .field("github_token", &self.github_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn credential(&self, provider: Provider) -> Result<String, SyncError> {
        match provider {
            Provider::Github => self
                .github_token
                .clone()
                .filter(|t| !t.is_empty())
                .ok_or_else(|| SyncError::Credential {
                    provider: provider.to_string(),
                    message: "no GitHub token configured (set github.token or GITHUB_TOKEN)"
                        .to_string(),
                }),
        }
    }

    fn reference(&self, provider: Provider) -> String {
        match provider {
            Provider::Github => "env:GITHUB_TOKEN".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_credentials() {
        let creds = StaticCredentials::new(Some("ghp_abc".into()));
        assert_eq!(creds.credential(Provider::Github).await.unwrap(), "ghp_abc");
        assert!(!format!("{:?}", creds).contains("ghp_abc"));

        let err = StaticCredentials::new(Some(String::new()))
            .credential(Provider::Github)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Credential { .. }));
    }
}
