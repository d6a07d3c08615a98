use anyhow::{Context, Result};
use common::{
    ClaimRequest, ClaimResponse, ClaimedTask, CompleteTaskRequest, ErrorBody, FailTaskRequest,
    FailTaskResponse, HeartbeatRequest, HelloResponse, AGENT_KEY_HEADER,
};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

/// How the coordinator answered a task report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportAck {
    Accepted { will_retry: bool },
    /// 404 or 409: the task is gone or belongs to another spot now.
    Rejected(String),
}

/// Thin wrapper over the `/internal/v1` endpoints.
#[derive(Clone)]
pub struct CoordinatorClient {
    http: Client,
    base_url: String,
    key: Option<String>,
}

async fn error_message(resp: Response) -> String {
    let status = resp.status();
    match resp.json::<ErrorBody>().await {
        Ok(body) => format!("{status}: {}", body.error),
        Err(_) => status.to_string(),
    }
}

impl CoordinatorClient {
    pub fn new(base_url: &str, key: Option<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            key,
        }
    }

    fn post(&self, path: &str) -> RequestBuilder {
        let req = self.http.post(format!("{}/internal/v1{}", self.base_url, path));
        match &self.key {
            Some(key) => req.header(AGENT_KEY_HEADER, key),
            None => req,
        }
    }

    async fn call<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let resp = self
            .post(path)
            .json(body)
            .send()
            .await
            .with_context(|| format!("POST {path}"))?;
        if !resp.status().is_success() {
            anyhow::bail!("POST {path} failed: {}", error_message(resp).await);
        }
        resp.json().await.with_context(|| format!("decoding {path} response"))
    }

    pub async fn hello(&self) -> Result<HelloResponse> {
        let resp = self.post("/hello").send().await.context("POST /hello")?;
        if !resp.status().is_success() {
            anyhow::bail!("hello rejected: {}", error_message(resp).await);
        }
        resp.json().await.context("decoding hello response")
    }

    pub async fn heartbeat(&self, req: &HeartbeatRequest) -> Result<()> {
        let _: serde_json::Value = self.call("/heartbeat", req).await?;
        Ok(())
    }

    pub async fn claim(&self, spot_id: &str, max_tasks: i32) -> Result<Vec<ClaimedTask>> {
        let resp: ClaimResponse = self
            .call(
                "/tasks/claim",
                &ClaimRequest {
                    spot_id: spot_id.to_string(),
                    max_tasks,
                },
            )
            .await?;
        Ok(resp.tasks)
    }

    async fn report<B: Serialize>(&self, path: &str, body: &B) -> Result<Response> {
        self.post(path)
            .json(body)
            .send()
            .await
            .with_context(|| format!("POST {path}"))
    }

    pub async fn complete(&self, task_id: &str, req: &CompleteTaskRequest) -> Result<ReportAck> {
        let resp = self.report(&format!("/tasks/{task_id}/complete"), req).await?;
        match resp.status() {
            s if s.is_success() => Ok(ReportAck::Accepted { will_retry: false }),
            StatusCode::NOT_FOUND | StatusCode::CONFLICT => {
                Ok(ReportAck::Rejected(error_message(resp).await))
            }
            _ => anyhow::bail!("completing {task_id} failed: {}", error_message(resp).await),
        }
    }

    pub async fn fail(&self, task_id: &str, req: &FailTaskRequest) -> Result<ReportAck> {
        let resp = self.report(&format!("/tasks/{task_id}/fail"), req).await?;
        match resp.status() {
            s if s.is_success() => {
                let body: FailTaskResponse = resp.json().await.unwrap_or_else(|e| {
                    warn!("undecodable fail response for {}: {}", task_id, e);
                    FailTaskResponse {
                        success: true,
                        will_retry: false,
                        message: None,
                    }
                });
                Ok(ReportAck::Accepted {
                    will_retry: body.will_retry,
                })
            }
            StatusCode::NOT_FOUND | StatusCode::CONFLICT => {
                Ok(ReportAck::Rejected(error_message(resp).await))
            }
            _ => anyhow::bail!("failing {task_id} failed: {}", error_message(resp).await),
        }
    }
}
