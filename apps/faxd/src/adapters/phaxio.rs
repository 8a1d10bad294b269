//! Phaxio cloud adapter. Sends by `content_url`: Phaxio fetches the PDF back
//! from our tokenized artifact route instead of taking an upload.

use async_trait::async_trait;

use fax_core::{FaxError, JobStatus, OutboundJob, ProviderError};

use crate::AppState;
use crate::dispatch::{SendAdapter, SendOutcome};

use super::{json_str, read_json, transport, vendor_error};

const DEFAULT_BASE_URL: &str = "https://api.phaxio.com/v2";

pub struct PhaxioAdapter {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    /// `{public_url}/phaxio-callback`; the job id is appended per send.
    callback_url: String,
}

impl PhaxioAdapter {
    pub fn from_state(state: &AppState) -> Result<Self, FaxError> {
        let settings = &state.config.phaxio;
        if !settings.is_configured() {
            return Err(FaxError::Config("phaxio credentials not configured".into()));
        }
        Ok(Self {
            http: state.http.clone(),
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: settings.api_key.clone(),
            api_secret: settings.api_secret.clone(),
            callback_url: format!(
                "{}/phaxio-callback",
                state.config.public_url.trim_end_matches('/')
            ),
        })
    }

    #[cfg(test)]
    pub fn for_tests(base_url: String, callback_url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            api_key: "key".into(),
            api_secret: "secret".into(),
            callback_url,
        }
    }

    fn outcome_from(&self, body: &serde_json::Value, fallback_status: JobStatus) -> SendOutcome {
        let provider_sid = json_str(body, &["data", "id"]);
        let status = json_str(body, &["data", "status"])
            .map(|s| JobStatus::from_provider(&s))
            .unwrap_or(fallback_status);
        let pages = json_str(body, &["data", "num_pages"]).and_then(|p| p.parse().ok());
        let error = json_str(body, &["data", "error_message"])
            .or_else(|| json_str(body, &["message"]).filter(|_| status == JobStatus::Failed));
        SendOutcome {
            provider_sid,
            status,
            pages,
            error,
        }
    }
}

#[async_trait]
impl SendAdapter for PhaxioAdapter {
    fn id(&self) -> &str {
        "phaxio"
    }

    async fn send(&self, job: &OutboundJob) -> Result<SendOutcome, ProviderError> {
        let pdf_url = job
            .pdf_url
            .as_deref()
            .ok_or_else(|| ProviderError::application("job has no artifact url"))?;
        let callback = format!("{}?job_id={}", self.callback_url, job.id);
        let form = [
            ("to", job.to_number.as_str()),
            ("content_url[]", pdf_url),
            ("callback_url", callback.as_str()),
        ];
        let response = self
            .http
            .post(format!("{}/faxes", self.base_url))
            .basic_auth(&self.api_key, Some(&self.api_secret))
            .form(&form)
            .send()
            .await
            .map_err(transport)?;
        let (status, body) = read_json(response).await?;
        if !status.is_success() {
            let detail = json_str(&body, &["message"]).unwrap_or_default();
            return Err(vendor_error(status, &detail));
        }
        if body.get("success").and_then(|v| v.as_bool()) == Some(false) {
            let detail = json_str(&body, &["message"]).unwrap_or_else(|| "send rejected".into());
            return Err(ProviderError::application(detail));
        }
        Ok(self.outcome_from(&body, JobStatus::InProgress))
    }

    async fn get_status(&self, job: &OutboundJob) -> Result<SendOutcome, ProviderError> {
        let sid = job
            .provider_sid
            .as_deref()
            .ok_or_else(|| ProviderError::application("job has no provider id"))?;
        let response = self
            .http
            .get(format!("{}/faxes/{sid}", self.base_url))
            .basic_auth(&self.api_key, Some(&self.api_secret))
            .send()
            .await
            .map_err(transport)?;
        let (status, body) = read_json(response).await?;
        if !status.is_success() {
            let detail = json_str(&body, &["message"]).unwrap_or_default();
            return Err(vendor_error(status, &detail));
        }
        Ok(self.outcome_from(&body, job.status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::routing::post;
    use serde_json::json;

    fn job_with_url() -> OutboundJob {
        let mut job = OutboundJob::new(
            "job1".into(),
            "+15551234567".into(),
            "/tmp/job1.txt".into(),
            "/tmp/job1.pdf".into(),
            "phaxio".into(),
        );
        job.pdf_url = Some("http://gw.test/fax/job1/pdf?token=t".into());
        job
    }

    #[tokio::test]
    async fn send_extracts_sid_and_status() {
        let app = Router::new().route(
            "/faxes",
            post(|body: String| async move {
                assert!(body.contains("content_url"));
                assert!(body.contains("callback_url"));
                axum::Json(json!({
                    "success": true,
                    "data": { "id": 4242, "status": "queued" }
                }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });

        let adapter =
            PhaxioAdapter::for_tests(format!("http://{addr}"), "http://gw.test/phaxio-callback".into());
        let outcome = adapter.send(&job_with_url()).await.unwrap();
        assert_eq!(outcome.provider_sid.as_deref(), Some("4242"));
        assert_eq!(outcome.status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn vendor_rejection_is_not_retryable() {
        let app = Router::new().route(
            "/faxes",
            post(|| async {
                (
                    axum::http::StatusCode::UNPROCESSABLE_ENTITY,
                    axum::Json(json!({ "success": false, "message": "invalid number" })),
                )
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });

        let adapter = PhaxioAdapter::for_tests(format!("http://{addr}"), "http://cb".into());
        let err = adapter.send(&job_with_url()).await.unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("invalid number"));
    }
}
