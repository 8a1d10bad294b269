//! SignalWire compatibility fax API adapter (Twilio-shaped). Sends by
//! `MediaUrl` pointing at our tokenized artifact route.

use async_trait::async_trait;

use fax_core::{FaxError, JobStatus, OutboundJob, ProviderError};

use crate::AppState;
use crate::dispatch::{SendAdapter, SendOutcome};

use super::{json_str, read_json, transport, vendor_error};

pub struct SignalWireAdapter {
    http: reqwest::Client,
    space_url: String,
    project_id: String,
    api_token: String,
    from_number: String,
    callback_url: String,
}

impl SignalWireAdapter {
    pub fn from_state(state: &AppState) -> Result<Self, FaxError> {
        let settings = &state.config.signalwire;
        if !settings.is_configured() {
            return Err(FaxError::Config(
                "signalwire credentials not configured".into(),
            ));
        }
        let space = settings.space_url.trim_end_matches('/');
        let space_url = if space.starts_with("http") {
            space.to_string()
        } else {
            format!("https://{space}")
        };
        Ok(Self {
            http: state.http.clone(),
            space_url,
            project_id: settings.project_id.clone(),
            api_token: settings.api_token.clone(),
            from_number: settings.from_number.clone(),
            callback_url: format!(
                "{}/signalwire-callback",
                state.config.public_url.trim_end_matches('/')
            ),
        })
    }

    fn faxes_url(&self) -> String {
        format!(
            "{}/api/laml/2010-04-01/Accounts/{}/Faxes",
            self.space_url, self.project_id
        )
    }

    fn outcome_from(&self, body: &serde_json::Value, fallback: JobStatus) -> SendOutcome {
        SendOutcome {
            provider_sid: json_str(body, &["sid"]),
            status: json_str(body, &["status"])
                .map(|s| JobStatus::from_provider(&s))
                .unwrap_or(fallback),
            pages: json_str(body, &["num_pages"]).and_then(|p| p.parse().ok()),
            error: None,
        }
    }
}

#[async_trait]
impl SendAdapter for SignalWireAdapter {
    fn id(&self) -> &str {
        "signalwire"
    }

    async fn send(&self, job: &OutboundJob) -> Result<SendOutcome, ProviderError> {
        let media_url = job
            .pdf_url
            .as_deref()
            .ok_or_else(|| ProviderError::application("job has no artifact url"))?;
        let callback = format!("{}?job_id={}", self.callback_url, job.id);
        let form = [
            ("To", job.to_number.as_str()),
            ("From", self.from_number.as_str()),
            ("MediaUrl", media_url),
            ("StatusCallback", callback.as_str()),
        ];
        let response = self
            .http
            .post(format!("{}.json", self.faxes_url()))
            .basic_auth(&self.project_id, Some(&self.api_token))
            .form(&form)
            .send()
            .await
            .map_err(transport)?;
        let (status, body) = read_json(response).await?;
        if !status.is_success() {
            let detail = json_str(&body, &["message"]).unwrap_or_default();
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
            .get(format!("{}/{sid}.json", self.faxes_url()))
            .basic_auth(&self.project_id, Some(&self.api_token))
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
