use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::Mutex;
use reqwest::{header::RETRY_AFTER, Client, Method, RequestBuilder, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::client::retry::RetryPolicy;
use crate::client::traits::BranchProvider;
use crate::config::{BranchConfig, DEFAULT_API_BASE_URL};
use crate::error::{BranchError, RemoteErrorKind, RemoteFailure, Result};
use crate::model::{BranchDescriptor, CreateBranch};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const DEFAULT_ENDPOINT_WAIT: Duration = Duration::from_secs(60);

// =============================================================================
// Neon API Types
// =============================================================================

#[derive(Debug, Deserialize)]
struct BranchPayload {
    id: String,
    #[serde(default)]
    parent_id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    default: bool,
    #[serde(default)]
    primary: bool,
}

#[derive(Debug, Deserialize)]
struct EndpointPayload {
    id: String,
    host: String,
    #[serde(default)]
    current_state: Option<String>,
    #[serde(rename = "type", default)]
    endpoint_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OperationPayload {
    id: String,
    #[serde(default)]
    endpoint_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreateBranchResponse {
    branch: BranchPayload,
    #[serde(default)]
    endpoints: Vec<EndpointPayload>,
    #[serde(default)]
    operations: Vec<OperationPayload>,
}

#[derive(Debug, Deserialize)]
struct BranchResponse {
    branch: BranchPayload,
    #[serde(default)]
    operations: Vec<OperationPayload>,
}

#[derive(Debug, Deserialize)]
struct BranchesResponse {
    branches: Vec<BranchPayload>,
}

#[derive(Debug, Deserialize)]
struct EndpointResponse {
    endpoint: EndpointPayload,
}

#[derive(Debug, Deserialize)]
struct EndpointsResponse {
    endpoints: Vec<EndpointPayload>,
}

#[derive(Debug, Deserialize)]
struct OperationResponse {
    operation: OperationPayload,
}

#[derive(Debug, Deserialize)]
struct PasswordResponse {
    password: String,
}

enum OperationState {
    Pending,
    Done,
    Failed,
}

fn operation_state(status: Option<&str>) -> OperationState {
    match status {
        Some("finished") | Some("skipped") => OperationState::Done,
        Some("failed") | Some("error") | Some("cancelled") => OperationState::Failed,
        _ => OperationState::Pending,
    }
}

// =============================================================================
// Client
// =============================================================================

/// Neon v2 REST client implementing [`BranchProvider`].
pub struct NeonClient {
    http: Client,
    base_url: Url,
    api_key: String,
    project_id: String,
    role: String,
    database: String,
    retry: RetryPolicy,
    poll_interval: Duration,
    endpoint_wait: Duration,
    /// `Some(None)` once looked up and no default branch was found
    default_branch: Mutex<Option<Option<String>>>,
}

impl NeonClient {
    pub fn new(api_key: impl Into<String>, project_id: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| BranchError::Configuration(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: parse_base_url(DEFAULT_API_BASE_URL)?,
            api_key: api_key.into(),
            project_id: project_id.into(),
            role: "neondb_owner".to_string(),
            database: "neondb".to_string(),
            retry: RetryPolicy::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            endpoint_wait: DEFAULT_ENDPOINT_WAIT,
            default_branch: Mutex::new(None),
        })
    }

    pub fn from_config(config: &BranchConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::new(config.api_key()?, config.project_id()?)?
            .with_base_url(&config.api_base_url)?
            .with_role(&config.role)
            .with_database(&config.database))
    }

    pub fn with_base_url(mut self, base_url: &str) -> Result<Self> {
        self.base_url = parse_base_url(base_url)?;
        Ok(self)
    }

    pub fn with_role(mut self, role: &str) -> Self {
        self.role = role.to_string();
        self
    }

    pub fn with_database(mut self, database: &str) -> Self {
        self.database = database.to_string();
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Polling cadence and ceiling for operations and endpoint readiness
    pub fn with_polling(mut self, interval: Duration, max_wait: Duration) -> Self {
        self.poll_interval = interval;
        self.endpoint_wait = max_wait;
        self
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| BranchError::Configuration(format!("invalid API path {}: {}", path, e)))
    }

    /// Issue one request through the retry policy and decode the response.
    async fn call<T: DeserializeOwned>(
        &self,
        operation: &str,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<T> {
        let url = self.url(path)?;
        self.retry
            .run(operation, || {
                let request = self
                    .http
                    .request(method.clone(), url.clone())
                    .bearer_auth(&self.api_key)
                    .header("Accept", "application/json");
                let request = match &body {
                    Some(body) => request.json(body),
                    None => request,
                };
                execute::<T>(request)
            })
            .await
    }

    async fn default_branch_id(&self) -> Option<String> {
        let cached = self.default_branch.lock().clone();
        if let Some(cached) = cached {
            return cached;
        }

        let path = format!("projects/{}/branches", self.project_id);
        let found = match self
            .call::<BranchesResponse>("list_branches", Method::GET, &path, None)
            .await
        {
            Ok(response) => response
                .branches
                .into_iter()
                .find(|b| b.default || b.primary)
                .map(|b| b.id),
            Err(e) => {
                warn!("Could not look up the default branch, safety check skipped: {}", e);
                None
            }
        };

        *self.default_branch.lock() = Some(found.clone());
        found
    }

    async fn ensure_not_default(&self, action: &str, branch_id: &str) -> Result<()> {
        if self.default_branch_id().await.as_deref() == Some(branch_id) {
            return Err(BranchError::UnsafeTarget {
                action: action.to_string(),
                branch_id: branch_id.to_string(),
            });
        }
        Ok(())
    }

    async fn wait_for_operations(&self, branch_id: &str, operations: &[OperationPayload]) -> Result<()> {
        for op in operations {
            let mut status = op.status.clone();
            let mut waited = Duration::ZERO;
            loop {
                match operation_state(status.as_deref()) {
                    OperationState::Done => break,
                    OperationState::Failed => {
                        return Err(BranchError::OperationFailed {
                            operation_id: op.id.clone(),
                            branch_id: branch_id.to_string(),
                            status: status.unwrap_or_default(),
                        })
                    }
                    OperationState::Pending if waited >= self.endpoint_wait => {
                        return Err(BranchError::OperationTimeout {
                            operation_id: op.id.clone(),
                            branch_id: branch_id.to_string(),
                            status: status.unwrap_or_default(),
                            waited,
                        })
                    }
                    OperationState::Pending => {}
                }

                tokio::time::sleep(self.poll_interval).await;
                waited += self.poll_interval;

                let path = format!("projects/{}/operations/{}", self.project_id, op.id);
                let response: OperationResponse =
                    self.call("operation_status", Method::GET, &path, None).await?;
                debug!("Operation {} is {:?}", op.id, response.operation.status);
                status = response.operation.status;
            }
        }
        Ok(())
    }

    async fn wait_for_endpoint(&self, endpoint_id: &str) -> Result<String> {
        let path = format!("projects/{}/endpoints/{}", self.project_id, endpoint_id);
        let mut waited = Duration::ZERO;

        loop {
            let response: EndpointResponse =
                self.call("endpoint_status", Method::GET, &path, None).await?;
            let state = response.endpoint.current_state.unwrap_or_default();

            if state == "active" {
                return Ok(response.endpoint.host);
            }

            if waited >= self.endpoint_wait {
                return Err(BranchError::EndpointTimeout {
                    endpoint_id: endpoint_id.to_string(),
                    state,
                    waited,
                });
            }

            tokio::time::sleep(self.poll_interval).await;
            waited += self.poll_interval;
        }
    }

    /// Reveal (never reset) the role password and build the connection URI.
    async fn connection_uri(&self, branch_id: &str, host: &str) -> Result<String> {
        let path = format!(
            "projects/{}/branches/{}/roles/{}/reveal_password",
            self.project_id, branch_id, self.role
        );
        let response: PasswordResponse = self
            .call("role_password_reveal", Method::GET, &path, None)
            .await?;

        Ok(format!(
            "postgresql://{}:{}@{}/{}?sslmode=require",
            self.role, response.password, host, self.database
        ))
    }

    fn descriptor(&self, branch: BranchPayload, host: String, uri: String, endpoint_id: String) -> BranchDescriptor {
        BranchDescriptor {
            branch_id: branch.id,
            project_id: self.project_id.clone(),
            parent_branch_id: branch.parent_id,
            connection_uri: uri,
            host,
            created_at: branch.created_at.unwrap_or_else(Utc::now),
            name: branch.name,
            endpoint_id: Some(endpoint_id),
            is_creator: false,
        }
    }
}

#[async_trait::async_trait]
impl BranchProvider for NeonClient {
    async fn create(&self, request: &CreateBranch) -> Result<BranchDescriptor> {
        let mut branch = json!({ "name": request.name });
        if let Some(parent_id) = &request.parent_id {
            branch["parent_id"] = json!(parent_id);
        }
        if let Some(expires_at) = request.expires_at(Utc::now()) {
            branch["expires_at"] = json!(expires_at);
        }
        let body = json!({
            "branch": branch,
            "endpoints": [{ "type": "read_write" }],
        });

        let path = format!("projects/{}/branches", self.project_id);
        let response: CreateBranchResponse = self
            .call("branch_create", Method::POST, &path, Some(body))
            .await?;

        let branch_id = response.branch.id.clone();
        let endpoint_id = response
            .operations
            .iter()
            .find_map(|op| op.endpoint_id.clone())
            .or_else(|| response.endpoints.first().map(|e| e.id.clone()))
            .ok_or_else(|| BranchError::Remote {
                operation: "branch_create".to_string(),
                kind: RemoteErrorKind::Malformed,
                status: None,
                message: format!("no endpoint created for branch {}", branch_id),
            })?;

        self.wait_for_operations(&branch_id, &response.operations).await?;
        let host = self.wait_for_endpoint(&endpoint_id).await?;

        // Never hand out the project's default branch
        self.ensure_not_default("use", &branch_id).await?;

        let uri = self.connection_uri(&branch_id, &host).await?;
        info!("Created Neon branch {} ({})", branch_id, request.name);

        Ok(self
            .descriptor(response.branch, host, uri, endpoint_id)
            .with_creator(true))
    }

    async fn reset(&self, branch_id: &str, target_id: &str) -> Result<()> {
        self.ensure_not_default("reset", branch_id).await?;

        let path = format!("projects/{}/branches/{}/restore", self.project_id, branch_id);
        let body = json!({ "source_branch_id": target_id });
        let response: BranchResponse = self
            .call("branch_restore", Method::POST, &path, Some(body))
            .await?;

        self.wait_for_operations(branch_id, &response.operations).await?;
        debug!("Restored branch {} from {}", branch_id, target_id);
        Ok(())
    }

    async fn delete(&self, branch_id: &str) -> Result<()> {
        self.ensure_not_default("delete", branch_id).await?;

        let path = format!("projects/{}/branches/{}", self.project_id, branch_id);
        match self
            .call::<Value>("branch_delete", Method::DELETE, &path, None)
            .await
        {
            Ok(_) => {
                info!("Deleted Neon branch {}", branch_id);
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!("Branch {} already gone", branch_id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn describe(&self, branch_id: &str) -> Result<BranchDescriptor> {
        let path = format!("projects/{}/branches/{}", self.project_id, branch_id);
        let response: BranchResponse = self
            .call("branch_describe", Method::GET, &path, None)
            .await?;

        let path = format!("projects/{}/branches/{}/endpoints", self.project_id, branch_id);
        let endpoints: EndpointsResponse = self
            .call("branch_endpoints", Method::GET, &path, None)
            .await?;

        let mut endpoints = endpoints.endpoints;
        let position = endpoints
            .iter()
            .position(|e| e.endpoint_type.as_deref() == Some("read_write"))
            .unwrap_or(0);
        if endpoints.is_empty() {
            return Err(BranchError::Remote {
                operation: "branch_describe".to_string(),
                kind: RemoteErrorKind::Malformed,
                status: None,
                message: format!("branch {} has no endpoint", branch_id),
            });
        }
        let endpoint = endpoints.swap_remove(position);

        let uri = self.connection_uri(branch_id, &endpoint.host).await?;
        Ok(self.descriptor(response.branch, endpoint.host, uri, endpoint.id))
    }
}

fn parse_base_url(base_url: &str) -> Result<Url> {
    // `Url::join` drops the last segment unless the base ends with a slash
    let normalized = if base_url.ends_with('/') {
        base_url.to_string()
    } else {
        format!("{}/", base_url)
    };
    Url::parse(&normalized)
        .map_err(|e| BranchError::Configuration(format!("invalid API base URL {}: {}", base_url, e)))
}

fn parse_retry_after(response: &reqwest::Response) -> Option<Duration> {
    let value = response.headers().get(RETRY_AFTER)?.to_str().ok()?;
    let seconds: f64 = value.trim().parse().ok()?;
    Duration::try_from_secs_f64(seconds).ok()
}

/// Makes a single request attempt
async fn execute<T: DeserializeOwned>(request: RequestBuilder) -> std::result::Result<T, RemoteFailure> {
    let response = request
        .send()
        .await
        .map_err(|e| RemoteFailure::new(RemoteErrorKind::Network, e.to_string()))?;

    let status = response.status().as_u16();
    if let Some(kind) = RemoteErrorKind::from_status(status) {
        let retry_after = parse_retry_after(&response);
        let text = response.text().await.unwrap_or_default();
        return Err(RemoteFailure::new(kind, format!("HTTP {}: {}", status, text))
            .with_status(status)
            .with_retry_after(retry_after));
    }

    let text = response
        .text()
        .await
        .map_err(|e| RemoteFailure::new(RemoteErrorKind::Network, e.to_string()))?;
    let text = if text.trim().is_empty() { "null" } else { text.as_str() };
    serde_json::from_str(text).map_err(|e| {
        RemoteFailure::new(RemoteErrorKind::Malformed, format!("Parse error: {}", e)).with_status(status)
    })
}
