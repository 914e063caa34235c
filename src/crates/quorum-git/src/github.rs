//! Thin GitHub PR client used by auto-PR/auto-merge finalization (§4.D).
//! Deliberately minimal: the git manager owns branch/merge mechanics, this
//! just talks to the REST API for the two calls finalization needs.

use quorum_core::{CoreError, ErrorCode, Result};
use serde::Deserialize;

pub struct GitHubClient {
    http: reqwest::Client,
    token: String,
    owner: String,
    repo: String,
}

#[derive(Debug, Deserialize)]
struct PullRequestResponse {
    number: u64,
    html_url: String,
}

#[derive(Debug, Clone)]
pub struct PullRequest {
    pub number: u64,
    pub url: String,
}

impl GitHubClient {
    pub fn new(token: impl Into<String>, owner: impl Into<String>, repo: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            token: token.into(),
            owner: owner.into(),
            repo: repo.into(),
        }
    }

    fn api_base(&self) -> String {
        format!("https://api.github.com/repos/{}/{}", self.owner, self.repo)
    }

    pub async fn open_pull_request(&self, title: &str, head: &str, base: &str, body: &str) -> Result<PullRequest> {
        let resp = self
            .http
            .post(format!("{}/pulls", self.api_base()))
            .bearer_auth(&self.token)
            .header("User-Agent", "quorum-ai")
            .json(&serde_json::json!({ "title": title, "head": head, "base": base, "body": body }))
            .send()
            .await
            .map_err(|e| CoreError::new(ErrorCode::Git, format!("opening pull request: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(CoreError::new(ErrorCode::Git, format!("GitHub PR create failed ({status}): {text}")));
        }

        let parsed: PullRequestResponse = resp
            .json()
            .await
            .map_err(|e| CoreError::new(ErrorCode::Git, format!("parsing pull request response: {e}")))?;

        Ok(PullRequest { number: parsed.number, url: parsed.html_url })
    }

    pub async fn merge_pull_request(&self, number: u64, merge_method: &str) -> Result<()> {
        let resp = self
            .http
            .put(format!("{}/pulls/{}/merge", self.api_base(), number))
            .bearer_auth(&self.token)
            .header("User-Agent", "quorum-ai")
            .json(&serde_json::json!({ "merge_method": merge_method }))
            .send()
            .await
            .map_err(|e| CoreError::new(ErrorCode::Git, format!("merging pull request: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(CoreError::new(ErrorCode::Git, format!("GitHub PR merge failed ({status}): {text}")));
        }
        Ok(())
    }
}
