//! Linear GraphQL tracker
//!
//! Fetches every issue of the project named in the local marker, cursor
//! page by cursor page, and keeps a TTL cache in front of the API. When the
//! API fails the last cache is served flagged as stale; with no cache the
//! error surfaces with a `linear api:` prefix.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use autonomy::{run_with_retry, ErrorCategory, RetryPolicies, RetryPolicy, StaleWorkDetector};
use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::cache::{IssueCache, DEFAULT_CACHE_TTL};
use super::pending::{PendingJournal, PendingOperation};
use super::project::ProjectMarker;
use super::{IssueTracker, TrackedIssue, TrackerError, WorkSummary};

pub const LINEAR_API_URL: &str = "https://api.linear.app/graphql";

const PAGE_SIZE: u32 = 100;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const ISSUES_QUERY: &str = r#"
query($projectId: ID!, $after: String) {
    issues(
        filter: { project: { id: { eq: $projectId } } }
        first: 100
        after: $after
    ) {
        pageInfo { hasNextPage endCursor }
        nodes {
            id
            identifier
            title
            description
            priority
            updatedAt
            state { name }
        }
    }
}
"#;

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct GraphqlResponse {
    data: Option<IssuesData>,
    errors: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
struct IssuesData {
    issues: IssueConnection,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IssueConnection {
    page_info: PageInfo,
    nodes: Vec<IssueNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    has_next_page: bool,
    end_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IssueNode {
    id: String,
    identifier: String,
    title: String,
    description: Option<String>,
    priority: Option<f64>,
    updated_at: Option<String>,
    state: Option<StateNode>,
}

#[derive(Debug, Deserialize)]
struct StateNode {
    name: String,
}

impl From<IssueNode> for TrackedIssue {
    fn from(node: IssueNode) -> Self {
        Self {
            id: node.id,
            identifier: node.identifier,
            title: node.title,
            description: node.description,
            priority: node
                .priority
                .filter(|p| p.is_finite() && *p >= 0.0)
                .map(|p| p.round().min(f64::from(u8::MAX)) as u8),
            status: node
                .state
                .map(|s| s.name)
                .unwrap_or_else(|| "Unknown".to_string()),
            updated_at: node.updated_at,
        }
    }
}

// ── Tracker ─────────────────────────────────────────────────────────

/// [`IssueTracker`] backed by the Linear GraphQL API.
#[derive(Debug, Clone)]
pub struct LinearTracker {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    project_dir: PathBuf,
    cache_ttl: Duration,
    detector: StaleWorkDetector,
    retry: RetryPolicies,
    pending: PendingJournal,
}

impl LinearTracker {
    pub fn new(
        api_key: impl Into<String>,
        project_dir: impl Into<PathBuf>,
    ) -> Result<Self, TrackerError> {
        let project_dir = project_dir.into();
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        // short budget: the tracker is consulted between sessions
        let retry = RetryPolicies::default()
            .with_policy(
                ErrorCategory::ExternalApi,
                RetryPolicy::new(2, Duration::from_secs(2)).with_max_delay(Duration::from_secs(10)),
            )
            .with_policy(
                ErrorCategory::Transient,
                RetryPolicy::new(2, Duration::from_secs(1)).with_max_delay(Duration::from_secs(5)),
            );

        Ok(Self {
            client,
            api_url: LINEAR_API_URL.to_string(),
            api_key: api_key.into(),
            pending: PendingJournal::in_project(&project_dir),
            project_dir,
            cache_ttl: DEFAULT_CACHE_TTL,
            detector: StaleWorkDetector::default(),
            retry,
        })
    }

    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    pub fn with_cache_ttl(mut self, cache_ttl: Duration) -> Self {
        self.cache_ttl = cache_ttl;
        self
    }

    pub fn with_retry_policies(mut self, retry: RetryPolicies) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_stale_detector(mut self, detector: StaleWorkDetector) -> Self {
        self.detector = detector;
        self
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    /// Fetch every issue of `project_id`, with retries.
    pub async fn fetch_issues(&self, project_id: &str) -> Result<Vec<TrackedIssue>, TrackerError> {
        run_with_retry(&self.retry, ErrorCategory::ExternalApi, || {
            self.fetch_all_pages(project_id)
        })
        .await
    }

    async fn fetch_all_pages(&self, project_id: &str) -> Result<Vec<TrackedIssue>, TrackerError> {
        let mut issues = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut variables = serde_json::json!({ "projectId": project_id });
            if let Some(after) = &cursor {
                variables["after"] = serde_json::Value::String(after.clone());
            }

            let response = self
                .client
                .post(&self.api_url)
                .header("Authorization", &self.api_key)
                .json(&serde_json::json!({ "query": ISSUES_QUERY, "variables": variables }))
                .send()
                .await?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(TrackerError::Status {
                    status: status.as_u16(),
                    body,
                });
            }

            let body: GraphqlResponse = response
                .json()
                .await
                .map_err(|e| TrackerError::Malformed(e.to_string()))?;

            if let Some(errors) = body.errors.filter(|e| !e.is_empty()) {
                return Err(TrackerError::Graphql(
                    serde_json::Value::Array(errors).to_string(),
                ));
            }
            let connection = body
                .data
                .ok_or_else(|| TrackerError::Malformed("response has no data".to_string()))?
                .issues;

            debug!(page = issues.len() / PAGE_SIZE as usize + 1, nodes = connection.nodes.len(), "fetched issue page");
            issues.extend(connection.nodes.into_iter().map(TrackedIssue::from));

            match (connection.page_info.has_next_page, connection.page_info.end_cursor) {
                (true, Some(next)) => cursor = Some(next),
                _ => break,
            }
        }

        Ok(issues)
    }

    fn summary_from_cache(&self, cache: &IssueCache, stale: bool) -> WorkSummary {
        let now = Utc::now();
        let mut summary = WorkSummary::from_issues(&cache.issues, &self.detector, now);
        summary.from_cache = true;
        summary.stale_cache = stale;
        summary.cache_age_secs = Some(cache.age_at(now).as_secs());
        summary
    }
}

#[async_trait]
impl IssueTracker for LinearTracker {
    async fn get_work_summary(&self) -> Result<WorkSummary, TrackerError> {
        let mut marker = ProjectMarker::load(&self.project_dir)
            .ok_or_else(|| TrackerError::NotInitialized(self.project_dir.display().to_string()))?;
        let project_id = marker
            .project_id
            .clone()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| TrackerError::NotInitialized(self.project_dir.display().to_string()))?;

        let cached = IssueCache::load(&self.project_dir);
        if let Some(cache) = &cached {
            if cache.is_valid_at(&project_id, self.cache_ttl, Utc::now()) {
                debug!(project_id = %project_id, "serving issues from cache");
                return Ok(self.summary_from_cache(cache, false));
            }
        }

        let issues = match self.fetch_issues(&project_id).await {
            Ok(issues) => issues,
            Err(e) => {
                return match cached {
                    Some(cache) => {
                        warn!(error = %e, "linear api unavailable, serving stale issue cache");
                        Ok(self.summary_from_cache(&cache, true))
                    }
                    None => Err(e),
                };
            }
        };

        let cache = IssueCache::new(project_id, issues, self.cache_ttl);
        if let Err(e) = cache.save(&self.project_dir) {
            warn!(error = %e, "could not write issue cache");
        }
        if let Err(e) = marker.store_counts(&self.project_dir, &cache.counts) {
            warn!(error = %e, "could not update project marker counts");
        }

        info!(
            total = cache.counts.total,
            done = cache.counts.done,
            in_progress = cache.counts.in_progress,
            todo = cache.counts.todo,
            "fetched issues from linear"
        );
        Ok(WorkSummary::from_issues(
            &cache.issues,
            &self.detector,
            Utc::now(),
        ))
    }

    async fn report_completion(&self) -> Result<bool, TrackerError> {
        let summary = self.get_work_summary().await?;
        Ok(summary.counts.is_complete())
    }

    async fn queue_pending_operation(
        &self,
        item_id: &str,
        action: &str,
        params: serde_json::Value,
    ) -> Result<(), TrackerError> {
        self.pending.add(item_id, action, params)?;
        info!(item_id, action, pending = self.pending.count(), "queued tracker operation");
        Ok(())
    }

    fn pending_count(&self) -> usize {
        self.pending.count()
    }

    fn pending_operations(&self) -> Vec<PendingOperation> {
        self.pending.load().pending_updates
    }

    fn clear_pending(&self) -> Result<usize, TrackerError> {
        self.pending.clear()
    }

    fn is_initialized(&self) -> bool {
        ProjectMarker::is_initialized(&self.project_dir)
    }
}
