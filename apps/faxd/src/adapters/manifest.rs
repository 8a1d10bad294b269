//! Adapter around the manifest interpreter: any provider declared under
//! `providers/<id>/manifest.json` becomes a send backend without code.

use std::path::Path;

use async_trait::async_trait;
use serde_json::Value;

use fax_core::{FaxError, JobStatus, OutboundJob, ProviderError};
use fax_manifest::{ManifestRuntime, ProviderManifest, SendRequest};

use crate::AppState;
use crate::dispatch::{SendAdapter, SendOutcome};

pub struct ManifestProviderAdapter {
    id: String,
    runtime: ManifestRuntime,
}

impl ManifestProviderAdapter {
    pub fn load(id: &str, state: &AppState) -> Result<Self, FaxError> {
        let dir = state.config.providers_dir.join(id);
        let raw = std::fs::read_to_string(dir.join("manifest.json"))?;
        let manifest = ProviderManifest::from_json(&raw)
            .map_err(|err| FaxError::Config(format!("provider {id}: {err}")))?;
        let credentials = read_optional_json(&dir.join("credentials.json"))?;
        let settings = read_optional_json(&dir.join("settings.json"))?;
        Ok(Self {
            id: id.to_string(),
            runtime: ManifestRuntime::new(manifest, credentials, settings),
        })
    }

    fn outcome_from(&self, outcome: fax_manifest::ActionOutcome) -> SendOutcome {
        SendOutcome {
            provider_sid: (!outcome.job_id.is_empty()).then_some(outcome.job_id),
            status: JobStatus::from_provider(&outcome.status),
            pages: None,
            error: outcome.error,
        }
    }
}

fn read_optional_json(path: &Path) -> Result<Value, FaxError> {
    match std::fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str(&raw)
            .map_err(|err| FaxError::Config(format!("{}: {err}", path.display()))),
        Err(_) => Ok(Value::Object(Default::default())),
    }
}

#[async_trait]
impl SendAdapter for ManifestProviderAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send(&self, job: &OutboundJob) -> Result<SendOutcome, ProviderError> {
        let outcome = self
            .runtime
            .send(SendRequest {
                to: &job.to_number,
                file_url: job.pdf_url.as_deref(),
                file_path: Some(&job.pdf_path),
                from_number: None,
            })
            .await?;
        Ok(self.outcome_from(outcome))
    }

    async fn get_status(&self, job: &OutboundJob) -> Result<SendOutcome, ProviderError> {
        let outcome = self
            .runtime
            .get_status(Some(&job.id), job.provider_sid.as_deref())
            .await?;
        Ok(self.outcome_from(outcome))
    }
}
