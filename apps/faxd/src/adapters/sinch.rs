//! Sinch Fax API v3 adapter. Unlike Phaxio this uploads the PDF directly as
//! multipart instead of handing the vendor a fetch-back URL.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};

use fax_core::{FaxError, JobStatus, OutboundJob, ProviderError};

use crate::AppState;
use crate::dispatch::{SendAdapter, SendOutcome};

use super::{json_str, read_json, transport, vendor_error};

pub struct SinchAdapter {
    http: reqwest::Client,
    base_url: String,
    project_id: String,
    api_key: String,
    api_secret: String,
}

impl SinchAdapter {
    pub fn from_state(state: &AppState) -> Result<Self, FaxError> {
        let settings = &state.config.sinch;
        if !settings.is_configured() {
            return Err(FaxError::Config("sinch credentials not configured".into()));
        }
        Ok(Self {
            http: state.http.clone(),
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            project_id: settings.project_id.clone(),
            api_key: settings.api_key.clone(),
            api_secret: settings.api_secret.clone(),
        })
    }

    fn faxes_url(&self) -> String {
        format!("{}/projects/{}/faxes", self.base_url, self.project_id)
    }

    fn outcome_from(&self, body: &serde_json::Value, fallback: JobStatus) -> SendOutcome {
        let provider_sid =
            json_str(body, &["id"]).or_else(|| json_str(body, &["data", "id"]));
        let status = json_str(body, &["status"])
            .or_else(|| json_str(body, &["data", "status"]))
            .map(|s| JobStatus::from_provider(&s))
            .unwrap_or(fallback);
        let pages = json_str(body, &["numberOfPages"]).and_then(|p| p.parse().ok());
        SendOutcome {
            provider_sid,
            status,
            pages,
            error: None,
        }
    }
}

#[async_trait]
impl SendAdapter for SinchAdapter {
    fn id(&self) -> &str {
        "sinch"
    }

    async fn send(&self, job: &OutboundJob) -> Result<SendOutcome, ProviderError> {
        let bytes = tokio::fs::read(&job.pdf_path)
            .await
            .map_err(|err| ProviderError::application(format!("artifact unreadable: {err}")))?;
        let part = Part::bytes(bytes)
            .file_name(format!("{}.pdf", job.id))
            .mime_str("application/pdf")
            .map_err(|err| ProviderError::application(err.to_string()))?;
        let form = Form::new().text("to", job.to_number.clone()).part("file", part);

        let response = self
            .http
            .post(self.faxes_url())
            .basic_auth(&self.api_key, Some(&self.api_secret))
            .multipart(form)
            .send()
            .await
            .map_err(transport)?;
        let (status, body) = read_json(response).await?;
        if !status.is_success() {
            let detail = json_str(&body, &["error", "message"])
                .or_else(|| json_str(&body, &["message"]))
                .unwrap_or_default();
            return Err(vendor_error(status, &detail));
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
            .get(format!("{}/{sid}", self.faxes_url()))
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
    use std::io::Write;

    #[tokio::test]
    async fn send_uploads_multipart_and_extracts_id() {
        let app = Router::new().route(
            "/projects/p1/faxes",
            post(|| async {
                axum::Json(json!({ "id": "fax-77", "status": "IN_PROGRESS" }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });

        let mut pdf = tempfile::NamedTempFile::new().unwrap();
        pdf.write_all(b"%PDF-1.4 test").unwrap();
        let mut job = OutboundJob::new(
            "job2".into(),
            "+15551234567".into(),
            pdf.path().display().to_string(),
            pdf.path().display().to_string(),
            "sinch".into(),
        );
        job.provider_sid = None;

        let adapter = SinchAdapter {
            http: reqwest::Client::new(),
            base_url: format!("http://{addr}"),
            project_id: "p1".into(),
            api_key: "k".into(),
            api_secret: "s".into(),
        };
        let outcome = adapter.send(&job).await.unwrap();
        assert_eq!(outcome.provider_sid.as_deref(), Some("fax-77"));
        assert_eq!(outcome.status, JobStatus::InProgress);
    }
}
