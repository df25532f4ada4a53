//! Google Tasks REST client.
//!
//! Maps the `tasklists` and `tasks` resources of the Tasks v1 API onto the
//! remote snapshot types. Every request carries a bearer token from the
//! configured [`AuthProvider`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::RemoteTaskService;
use crate::auth::AuthProvider;
use crate::error::{AuthError, ConfigError, SyncError};
use crate::model::{Page, RemoteTask, RemoteTaskList, TaskFields, TaskLink, TaskStatus};
use crate::storage::config::RemoteConfig;
use crate::sync::CancelToken;

const SERVICE: &str = "google_tasks";

// === Wire types ===

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePage<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireTaskList {
    id: String,
    #[serde(default)]
    title: String,
    updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct WireLink {
    #[serde(rename = "type", default)]
    link_type: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    link: String,
}

#[derive(Debug, Deserialize)]
struct WireTask {
    id: String,
    #[serde(default)]
    title: String,
    notes: Option<String>,
    status: Option<String>,
    due: Option<DateTime<Utc>>,
    completed: Option<DateTime<Utc>>,
    parent: Option<String>,
    #[serde(default)]
    position: String,
    #[serde(default)]
    deleted: bool,
    #[serde(default)]
    hidden: bool,
    #[serde(default)]
    links: Vec<WireLink>,
    updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct ListBody<'a> {
    title: &'a str,
}

/// Writable task fields. `due` and `completed` are sent as explicit nulls so
/// a PATCH can clear them.
#[derive(Debug, Serialize)]
struct TaskBody<'a> {
    title: &'a str,
    notes: &'a str,
    status: &'a str,
    due: Option<String>,
    completed: Option<String>,
}

impl<'a> From<&'a TaskFields> for TaskBody<'a> {
    fn from(fields: &'a TaskFields) -> Self {
        Self {
            title: &fields.title,
            notes: &fields.notes,
            status: fields.status.as_str(),
            due: fields.due.map(|d| d.to_rfc3339()),
            completed: match fields.status {
                TaskStatus::Completed => fields.completed_at.map(|d| d.to_rfc3339()),
                TaskStatus::NeedsAction => None,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireErrorEnvelope {
    error: WireError,
}

#[derive(Debug, Deserialize)]
struct WireError {
    message: String,
}

impl From<WireTaskList> for RemoteTaskList {
    fn from(wire: WireTaskList) -> Self {
        Self {
            remote_id: wire.id,
            title: wire.title,
            updated_at: wire.updated.unwrap_or_else(Utc::now),
        }
    }
}

impl From<WireTask> for RemoteTask {
    fn from(wire: WireTask) -> Self {
        Self {
            remote_id: wire.id,
            parent_remote_id: wire.parent.filter(|p| !p.is_empty()),
            title: wire.title,
            notes: wire.notes.unwrap_or_default(),
            status: wire
                .status
                .as_deref()
                .map(TaskStatus::parse)
                .unwrap_or_default(),
            due: wire.due,
            completed_at: wire.completed,
            position: wire.position,
            deleted: wire.deleted,
            hidden: wire.hidden,
            links: wire
                .links
                .into_iter()
                .map(|l| TaskLink {
                    link_type: l.link_type,
                    description: l.description,
                    url: l.link,
                })
                .collect(),
            updated_at: wire.updated.unwrap_or_else(Utc::now),
        }
    }
}

impl<T, U: From<T>> From<WirePage<T>> for Page<U> {
    fn from(wire: WirePage<T>) -> Self {
        Page {
            items: wire.items.into_iter().map(U::from).collect(),
            next_page_token: wire.next_page_token.filter(|t| !t.is_empty()),
        }
    }
}

/// Google Tasks API client.
pub struct GoogleTasksClient {
    http: Client,
    base_url: String,
    page_size: u32,
    auth: Arc<dyn AuthProvider>,
}

impl GoogleTasksClient {
    /// Build a client from the `[remote]` config section.
    ///
    /// # Errors
    /// Returns an error if `api_base` is not a valid URL or the HTTP client
    /// cannot be built.
    pub fn new(auth: Arc<dyn AuthProvider>, config: &RemoteConfig) -> Result<Self, ConfigError> {
        url::Url::parse(&config.api_base).map_err(|e| ConfigError::InvalidValue {
            key: "remote.api_base".into(),
            message: e.to_string(),
        })?;
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                key: "remote.timeout_secs".into(),
                message: e.to_string(),
            })?;
        Ok(Self {
            http,
            base_url: config.api_base.trim_end_matches('/').to_string(),
            page_size: config.page_size,
            auth,
        })
    }

    /// Client against an arbitrary base URL with default settings.
    pub fn with_base_url(auth: Arc<dyn AuthProvider>, base_url: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            http: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            page_size: 100,
            auth,
        }
    }

    fn lists_url(&self) -> String {
        format!("{}/users/@me/lists", self.base_url)
    }

    fn list_url(&self, list_id: &str) -> String {
        format!("{}/{}", self.lists_url(), urlencoding::encode(list_id))
    }

    fn tasks_url(&self, list_id: &str) -> String {
        format!("{}/lists/{}/tasks", self.base_url, urlencoding::encode(list_id))
    }

    fn task_url(&self, list_id: &str, task_id: &str) -> String {
        format!("{}/{}", self.tasks_url(list_id), urlencoding::encode(task_id))
    }

    /// Attach the bearer token, send, and map non-2xx responses to errors.
    async fn execute(
        &self,
        request: RequestBuilder,
        cancel: &CancelToken,
    ) -> Result<Response, SyncError> {
        let token = cancel
            .run(async { Ok::<_, SyncError>(self.auth.access_token().await?) })
            .await?
            .ok_or_else(|| {
                SyncError::Authentication(AuthError::NotAuthenticated {
                    service: SERVICE.into(),
                })
            })?;

        let response = cancel
            .run(async { Ok::<_, SyncError>(request.bearer_auth(token).send().await?) })
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = cancel
            .run(async { Ok::<_, SyncError>(response.text().await.unwrap_or_default()) })
            .await?;
        let message = serde_json::from_str::<WireErrorEnvelope>(&body)
            .map(|e| e.error.message)
            .ok()
            .filter(|m| !m.is_empty())
            .or_else(|| (!body.trim().is_empty()).then(|| body.trim().to_string()))
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed").to_string());

        if status == StatusCode::UNAUTHORIZED {
            return Err(SyncError::Authentication(AuthError::Rejected(message)));
        }
        Err(SyncError::remote(Some(status.as_u16()), message))
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        cancel: &CancelToken,
    ) -> Result<T, SyncError> {
        let response = self.execute(request, cancel).await?;
        cancel
            .run(async { Ok::<_, SyncError>(response.json::<T>().await?) })
            .await
    }
}

fn placement_query<'a>(
    parent: Option<&'a str>,
    previous: Option<&'a str>,
) -> Vec<(&'static str, &'a str)> {
    let mut query = Vec::new();
    if let Some(parent) = parent {
        query.push(("parent", parent));
    }
    if let Some(previous) = previous {
        query.push(("previous", previous));
    }
    query
}

#[async_trait]
impl RemoteTaskService for GoogleTasksClient {
    async fn list_task_lists_page(
        &self,
        page_token: Option<&str>,
        cancel: &CancelToken,
    ) -> Result<Page<RemoteTaskList>, SyncError> {
        let mut query = vec![("maxResults", self.page_size.to_string())];
        if let Some(token) = page_token {
            query.push(("pageToken", token.to_string()));
        }
        let page: WirePage<WireTaskList> = self
            .fetch(self.http.get(self.lists_url()).query(&query), cancel)
            .await?;
        debug!(
            count = page.items.len(),
            more = page.next_page_token.is_some(),
            "fetched task list page"
        );
        Ok(page.into())
    }

    async fn create_task_list(
        &self,
        title: &str,
        cancel: &CancelToken,
    ) -> Result<RemoteTaskList, SyncError> {
        let wire: WireTaskList = self
            .fetch(self.http.post(self.lists_url()).json(&ListBody { title }), cancel)
            .await?;
        Ok(wire.into())
    }

    async fn update_task_list(
        &self,
        list_id: &str,
        title: &str,
        cancel: &CancelToken,
    ) -> Result<RemoteTaskList, SyncError> {
        let wire: WireTaskList = self
            .fetch(
                self.http.patch(self.list_url(list_id)).json(&ListBody { title }),
                cancel,
            )
            .await?;
        Ok(wire.into())
    }

    async fn delete_task_list(
        &self,
        list_id: &str,
        cancel: &CancelToken,
    ) -> Result<(), SyncError> {
        self.execute(self.http.delete(self.list_url(list_id)), cancel)
            .await?;
        Ok(())
    }

    async fn list_tasks_page(
        &self,
        list_id: &str,
        page_token: Option<&str>,
        include_completed: bool,
        include_hidden: bool,
        cancel: &CancelToken,
    ) -> Result<Page<RemoteTask>, SyncError> {
        let mut query = vec![
            ("maxResults", self.page_size.to_string()),
            ("showCompleted", include_completed.to_string()),
            ("showHidden", include_hidden.to_string()),
        ];
        if let Some(token) = page_token {
            query.push(("pageToken", token.to_string()));
        }
        let page: WirePage<WireTask> = self
            .fetch(self.http.get(self.tasks_url(list_id)).query(&query), cancel)
            .await?;
        debug!(
            list = %list_id,
            count = page.items.len(),
            more = page.next_page_token.is_some(),
            "fetched task page"
        );
        Ok(page.into())
    }

    async fn get_task(
        &self,
        list_id: &str,
        task_id: &str,
        cancel: &CancelToken,
    ) -> Result<RemoteTask, SyncError> {
        let wire: WireTask = self
            .fetch(self.http.get(self.task_url(list_id, task_id)), cancel)
            .await?;
        Ok(wire.into())
    }

    async fn create_task(
        &self,
        list_id: &str,
        fields: &TaskFields,
        parent: Option<&str>,
        previous: Option<&str>,
        cancel: &CancelToken,
    ) -> Result<RemoteTask, SyncError> {
        let request = self
            .http
            .post(self.tasks_url(list_id))
            .query(&placement_query(parent, previous))
            .json(&TaskBody::from(fields));
        let wire: WireTask = self.fetch(request, cancel).await?;
        Ok(wire.into())
    }

    async fn update_task(
        &self,
        list_id: &str,
        task_id: &str,
        fields: &TaskFields,
        cancel: &CancelToken,
    ) -> Result<RemoteTask, SyncError> {
        let request = self
            .http
            .patch(self.task_url(list_id, task_id))
            .json(&TaskBody::from(fields));
        let wire: WireTask = self.fetch(request, cancel).await?;
        Ok(wire.into())
    }

    async fn delete_task(
        &self,
        list_id: &str,
        task_id: &str,
        cancel: &CancelToken,
    ) -> Result<(), SyncError> {
        self.execute(self.http.delete(self.task_url(list_id, task_id)), cancel)
            .await?;
        Ok(())
    }

    async fn move_task(
        &self,
        list_id: &str,
        task_id: &str,
        parent: Option<&str>,
        previous: Option<&str>,
        cancel: &CancelToken,
    ) -> Result<RemoteTask, SyncError> {
        let request = self
            .http
            .post(format!("{}/move", self.task_url(list_id, task_id)))
            .query(&placement_query(parent, previous));
        let wire: WireTask = self.fetch(request, cancel).await?;
        Ok(wire.into())
    }

    async fn clear_completed(&self, list_id: &str, cancel: &CancelToken) -> Result<(), SyncError> {
        let url = format!("{}/lists/{}/clear", self.base_url, urlencoding::encode(list_id));
        self.execute(self.http.post(url), cancel).await?;
        Ok(())
    }
}
