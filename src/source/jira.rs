//! Jira REST v2 adapter.
//!
//! Pages through `GET /rest/api/2/search` with `startAt` as the cursor and
//! maps HTTP outcomes onto [`SourceError`] kinds:
//!
//! - 401 / 403 → [`SourceError::Auth`]
//! - 429, 5xx, timeouts, connection errors → [`SourceError::Transient`]
//! - any other non-success status → [`SourceError::Rejected`]

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use jira_mirror_core::models::{QueryScope, RawIssue};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

use super::{IssueSource, SourceError, SourceIdentity, SourcePage};
use crate::config::Config;

/// Keys per lookup request; keeps the query string well under URL limits.
const KEY_CHUNK: usize = 50;

/// Built-in fields every search requests.
const BASE_FIELDS: &[&str] = &[
    "key",
    "summary",
    "description",
    "status",
    "priority",
    "assignee",
    "reporter",
    "created",
    "updated",
    "comment",
    "project",
    "issuetype",
    "labels",
    "components",
];

pub struct JiraSource {
    client: reqwest::Client,
    base_url: String,
    username: String,
    token: String,
    fields: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(rename = "startAt", default)]
    start_at: u64,
    #[serde(default)]
    total: Option<u64>,
    #[serde(default)]
    issues: Vec<serde_json::Value>,
}

/// One entry of `GET /rest/api/2/field`.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteField {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub custom: bool,
    #[serde(default)]
    schema: Option<FieldSchema>,
}

#[derive(Debug, Clone, Deserialize)]
struct FieldSchema {
    #[serde(rename = "type", default)]
    value_type: Option<String>,
}

impl RemoteField {
    /// Jira's schema type, `string` when the field declares none.
    pub fn value_type(&self) -> &str {
        self.schema
            .as_ref()
            .and_then(|s| s.value_type.as_deref())
            .unwrap_or("string")
    }
}

#[derive(Debug, Deserialize)]
struct Myself {
    #[serde(rename = "accountId", default)]
    account_id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(rename = "displayName", default)]
    display_name: Option<String>,
}

impl JiraSource {
    pub fn new(
        base_url: &str,
        username: &str,
        token: &str,
        timeout: Duration,
        custom_field_ids: &[String],
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        let mut fields: Vec<&str> = BASE_FIELDS.to_vec();
        fields.extend(custom_field_ids.iter().map(String::as_str));
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            username: username.to_string(),
            token: token.to_string(),
            fields: fields.join(","),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let ids: Vec<String> = config.custom_fields.iter().map(|c| c.id.clone()).collect();
        Self::new(
            &config.jira.url,
            &config.jira.username,
            &config.jira_token()?,
            Duration::from_secs(config.jira.timeout_secs),
            &ids,
        )
    }

    /// Every custom field defined on the instance, sorted by id.
    pub async fn custom_fields(&self) -> Result<Vec<RemoteField>, SourceError> {
        let body = self.get("/rest/api/2/field", &[]).await?;
        let fields: Vec<RemoteField> =
            serde_json::from_str(&body).map_err(|e| SourceError::Decode(e.to_string()))?;
        let mut custom: Vec<RemoteField> = fields.into_iter().filter(|f| f.custom).collect();
        custom.sort_by(|a, b| a.id.cmp(&b.id));
        debug!(fields = custom.len(), "listed custom fields");
        Ok(custom)
    }

    async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<String, SourceError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .basic_auth(&self.username, Some(&self.token))
            .header("Accept", "application/json")
            .query(query)
            .send()
            .await
            .map_err(|e| SourceError::Transient {
                reason: format!("request to {} failed: {}", path, e),
                retry_after: None,
            })?;

        let status = response.status();
        let retry_after = retry_after(response.headers());
        let body = response.text().await.map_err(|e| SourceError::Transient {
            reason: format!("reading response body failed: {}", e),
            retry_after: None,
        })?;

        if status.is_success() {
            return Ok(body);
        }
        Err(classify_status(status, retry_after, body))
    }
}

fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn classify_status(status: StatusCode, retry_after: Option<Duration>, body: String) -> SourceError {
    let body: String = body.chars().take(500).collect();
    match status.as_u16() {
        401 | 403 => SourceError::Auth(format!("HTTP {}", status.as_u16())),
        429 => SourceError::Transient {
            reason: "rate limited (HTTP 429)".to_string(),
            retry_after,
        },
        s if status.is_server_error() => SourceError::Transient {
            reason: format!("HTTP {}: {}", s, body),
            retry_after,
        },
        s => SourceError::Rejected { status: s, body },
    }
}

/// Cursor of the page after `resp`, or `None` when the scope is exhausted.
fn next_cursor(resp: &SearchResponse) -> Option<u64> {
    if resp.issues.is_empty() {
        return None;
    }
    let next = resp.start_at + resp.issues.len() as u64;
    match resp.total {
        Some(total) if next >= total => None,
        _ => Some(next),
    }
}

#[async_trait]
impl IssueSource for JiraSource {
    async fn fetch_page(
        &self,
        scope: &QueryScope,
        cursor: Option<u64>,
        page_size: usize,
    ) -> Result<SourcePage, SourceError> {
        let start_at = cursor.unwrap_or(0);
        let jql = scope.to_jql();
        debug!(jql = %jql, start_at, "fetching search page");

        let body = self
            .get(
                "/rest/api/2/search",
                &[
                    ("jql", jql),
                    ("startAt", start_at.to_string()),
                    ("maxResults", page_size.to_string()),
                    ("fields", self.fields.clone()),
                    ("expand", "names".to_string()),
                ],
            )
            .await?;

        let resp: SearchResponse =
            serde_json::from_str(&body).map_err(|e| SourceError::Decode(e.to_string()))?;
        Ok(SourcePage {
            next_cursor: next_cursor(&resp),
            total: resp.total,
            issues: resp.issues.into_iter().map(RawIssue).collect(),
        })
    }

    async fn fetch_keys(
        &self,
        scope: &QueryScope,
        keys: &[String],
    ) -> Result<Vec<RawIssue>, SourceError> {
        let mut found = Vec::new();
        for chunk in keys.chunks(KEY_CHUNK) {
            let jql = scope.keys_jql(chunk);
            debug!(keys = chunk.len(), "looking up issues by key");
            // `warn` turns unknown keys into warnings instead of a 400.
            let body = self
                .get(
                    "/rest/api/2/search",
                    &[
                        ("jql", jql),
                        ("startAt", "0".to_string()),
                        ("maxResults", chunk.len().to_string()),
                        ("validateQuery", "warn".to_string()),
                        ("fields", self.fields.clone()),
                    ],
                )
                .await?;
            let resp: SearchResponse =
                serde_json::from_str(&body).map_err(|e| SourceError::Decode(e.to_string()))?;
            found.extend(resp.issues.into_iter().map(RawIssue));
        }
        Ok(found)
    }

    async fn whoami(&self) -> Result<SourceIdentity, SourceError> {
        let body = self.get("/rest/api/2/myself", &[]).await?;
        let me: Myself =
            serde_json::from_str(&body).map_err(|e| SourceError::Decode(e.to_string()))?;
        let name = me
            .account_id
            .or(me.name)
            .ok_or_else(|| SourceError::Decode("identity has no account id or name".into()))?;
        Ok(SourceIdentity {
            name,
            display_name: me.display_name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resp(start_at: u64, n: usize, total: Option<u64>) -> SearchResponse {
        SearchResponse {
            start_at,
            total,
            issues: vec![serde_json::json!({}); n],
        }
    }

    #[test]
    fn test_next_cursor() {
        assert_eq!(next_cursor(&resp(0, 100, Some(250))), Some(100));
        assert_eq!(next_cursor(&resp(200, 50, Some(250))), None);
        assert_eq!(next_cursor(&resp(0, 0, Some(250))), None);
        assert_eq!(next_cursor(&resp(0, 10, None)), Some(10));
    }

    #[test]
    fn test_classify_status() {
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, None, String::new()),
            SourceError::Auth(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, None, String::new()),
            SourceError::Auth(_)
        ));
        assert!(matches!(
            classify_status(
                StatusCode::TOO_MANY_REQUESTS,
                Some(Duration::from_secs(7)),
                String::new()
            ),
            SourceError::Transient {
                retry_after: Some(d),
                ..
            } if d == Duration::from_secs(7)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, None, "oops".into()),
            SourceError::Transient { .. }
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, None, "bad jql".into()),
            SourceError::Rejected { status: 400, .. }
        ));
    }
}
