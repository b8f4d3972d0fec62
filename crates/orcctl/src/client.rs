//! HTTP client for orcd.
//!
//! Communicates with orcd via its local HTTP API (Section 6).

use orc_core::{Artifact, Pattern, Project, Run, Step, TaskType};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("daemon not running at {addr}\n  → start with: orcd\n  → or set ORCD_ADDR if using a different address")]
    ConnectionFailed { addr: String },

    #[error("HTTP error: {status} - {message}")]
    HttpError { status: u16, message: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error(
        "daemon not ready after {timeout_ms}ms at {addr}\n  → ensure orcd is running"
    )]
    DaemonNotReady { addr: String, timeout_ms: u64 },
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            let addr = e.url().map(std::string::ToString::to_string).unwrap_or_else(|| "unknown".to_string());
            ClientError::ConnectionFailed { addr }
        } else {
            ClientError::HttpError {
                status: e.status().map(|s| s.as_u16()).unwrap_or(0),
                message: e.to_string(),
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    detail: String,
}

#[derive(Debug, Serialize)]
pub struct UpsertProjectRequest {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_type: Option<TaskType>,
}

#[derive(Debug, Serialize)]
pub struct CreateRunRequest {
    pub project_id: String,
    pub name: String,
    pub instructions: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_type: Option<TaskType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_run_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WorkspaceFilesResponse {
    pub total_files: usize,
    pub files: Vec<WorkspaceFileEntry>,
}

#[derive(Debug, Deserialize)]
pub struct WorkspaceFileEntry {
    pub path: String,
    pub size_bytes: u64,
    #[serde(rename = "type")]
    pub mime_type: String,
}

/// Default total timeout for daemon readiness probe.
const DEFAULT_READY_TIMEOUT_MS: u64 = 5000;

/// Initial backoff delay for readiness probe.
const INITIAL_BACKOFF_MS: u64 = 200;

/// HTTP client for orcd.
pub struct Client {
    base_url: String,
    http: reqwest::Client,
}

impl Client {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    pub fn addr(&self) -> &str {
        &self.base_url
    }

    async fn check_reachable(&self) -> Result<bool, ClientError> {
        let url = format!("{}/projects", self.base_url);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        Ok(response.status().is_success())
    }

    pub async fn wait_for_ready(&self) -> Result<(), ClientError> {
        self.wait_for_ready_with_timeout(DEFAULT_READY_TIMEOUT_MS).await
    }

    pub async fn wait_for_ready_with_timeout(&self, timeout_ms: u64) -> Result<(), ClientError> {
        let start = std::time::Instant::now();
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            match self.check_reachable().await {
                Ok(true) => return Ok(()),
                Ok(false) | Err(_) => {
                    let elapsed = start.elapsed().as_millis() as u64;
                    if elapsed >= timeout_ms {
                        return Err(ClientError::DaemonNotReady {
                            addr: self.base_url.clone(),
                            timeout_ms,
                        });
                    }
                    eprintln!("waiting for daemon at {} (retrying in {backoff_ms}ms)", self.base_url);
                    let remaining = timeout_ms.saturating_sub(elapsed);
                    tokio::time::sleep(std::time::Duration::from_millis(backoff_ms.min(remaining))).await;
                    backoff_ms = backoff_ms.saturating_mul(2);
                }
            }
        }
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers
    }

    async fn handle_error(&self, response: reqwest::Response) -> ClientError {
        let status = response.status().as_u16();
        let message = response
            .json::<ErrorBody>()
            .await
            .map(|e| e.detail)
            .unwrap_or_else(|_| "unknown error".to_string());
        ClientError::HttpError { status, message }
    }

    pub async fn upsert_project(&self, id: &str, req: &UpsertProjectRequest) -> Result<Project, ClientError> {
        let url = format!("{}/projects/{}", self.base_url, id);
        let response = self.http.put(&url).headers(self.headers()).json(req).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>, ClientError> {
        let url = format!("{}/projects", self.base_url);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    pub async fn create_run(&self, project_id: &str, req: &CreateRunRequest) -> Result<Run, ClientError> {
        let url = format!("{}/projects/{}/runs", self.base_url, project_id);
        let response = self.http.post(&url).headers(self.headers()).json(req).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    pub async fn list_runs(&self, project_id: Option<&str>) -> Result<Vec<Run>, ClientError> {
        let mut url = format!("{}/runs", self.base_url);
        if let Some(project_id) = project_id {
            url = format!("{url}?project_id={project_id}");
        }
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Run, ClientError> {
        let url = format!("{}/runs/{run_id}", self.base_url);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    pub async fn list_steps(&self, run_id: &str) -> Result<Vec<Step>, ClientError> {
        let url = format!("{}/runs/{run_id}/steps", self.base_url);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    pub async fn cancel_run(&self, run_id: &str) -> Result<(), ClientError> {
        let url = format!("{}/runs/{run_id}/cancel", self.base_url);
        let response = self.http.post(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        Ok(())
    }

    pub async fn list_workspace_files(&self, run_id: &str) -> Result<WorkspaceFilesResponse, ClientError> {
        let url = format!("{}/runs/{run_id}/workspace/files", self.base_url);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    pub async fn list_artifacts(&self, run_id: &str) -> Result<Vec<Artifact>, ClientError> {
        let url = format!("{}/runs/{run_id}/artifacts", self.base_url);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    pub async fn get_pattern(&self, run_id: &str) -> Result<Pattern, ClientError> {
        let url = format!("{}/patterns/{run_id}", self.base_url);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    /// Follow the run's event stream, printing each event line until the
    /// connection closes (Section 6: the stream closes on terminal status).
    pub async fn stream_run(&self, run_id: &str) -> Result<(), ClientError> {
        use futures::StreamExt;

        let url = format!("{}/runs/{run_id}/stream", self.base_url);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| ClientError::IoError(e.to_string()))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(end) = buffer.find("\n\n") {
                let event_str = buffer[..end].to_string();
                buffer = buffer[end + 2..].to_string();
                if let Some(data) = event_str.strip_prefix("data:") {
                    println!("{}", data.trim());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_trims_trailing_slash() {
        let client = Client::new("http://localhost:7700/");
        assert_eq!(client.base_url, "http://localhost:7700");
    }

    #[test]
    fn client_preserves_url_without_trailing_slash() {
        let client = Client::new("http://localhost:7700");
        assert_eq!(client.base_url, "http://localhost:7700");
    }

    #[test]
    fn client_headers_include_content_type() {
        let client = Client::new("http://localhost:7700");
        let headers = client.headers();
        assert_eq!(headers.get(CONTENT_TYPE).unwrap(), "application/json");
    }

    #[test]
    fn client_addr_returns_base_url() {
        let client = Client::new("http://localhost:7700");
        assert_eq!(client.addr(), "http://localhost:7700");
    }

    #[tokio::test]
    async fn wait_for_ready_times_out_when_daemon_not_running() {
        let client = Client::new("http://127.0.0.1:19999");
        let result = client.wait_for_ready_with_timeout(100).await;
        match result {
            Err(ClientError::DaemonNotReady { addr, timeout_ms }) => {
                assert_eq!(addr, "http://127.0.0.1:19999");
                assert_eq!(timeout_ms, 100);
            }
            _ => panic!("expected DaemonNotReady error"),
        }
    }

    #[test]
    fn connection_failed_error_suggests_start_command() {
        let err = ClientError::ConnectionFailed { addr: "http://127.0.0.1:7700".to_string() };
        let msg = err.to_string();
        assert!(msg.contains("orcd"), "should suggest starting orcd");
    }
}
