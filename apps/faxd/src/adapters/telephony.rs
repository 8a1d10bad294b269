//! Self-hosted telephony adapter. Encodes the PDF to fax TIFF and originates
//! a call through the manager interface; the terminal status arrives later as
//! a `FaxResult` event, so `send` only ever reports `in_progress`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use fax_ami::AmiClient;
use fax_core::{JobStatus, OutboundJob, ProviderError, Renderer};

use crate::AppState;
use crate::dispatch::{SendAdapter, SendOutcome};

pub struct TelephonyAdapter {
    ami: AmiClient,
    renderer: Arc<dyn Renderer>,
    data_dir: PathBuf,
}

impl TelephonyAdapter {
    pub fn from_state(state: &AppState) -> Self {
        Self {
            ami: state.ami.clone(),
            renderer: state.renderer.clone(),
            data_dir: state.config.data_dir.clone(),
        }
    }
}

#[async_trait]
impl SendAdapter for TelephonyAdapter {
    fn id(&self) -> &str {
        "telephony"
    }

    async fn send(&self, job: &OutboundJob) -> Result<SendOutcome, ProviderError> {
        let tiff_path = match job.tiff_path.as_deref() {
            Some(path) => PathBuf::from(path),
            None => {
                let path = self.data_dir.join(format!("{}.tiff", job.id));
                self.renderer
                    .pdf_to_tiff(Path::new(&job.pdf_path), &path)
                    .map_err(|err| ProviderError::application(err.to_string()))?;
                path
            }
        };
        let tiff = tiff_path.to_string_lossy();
        self.ami
            .originate_sendfax(&job.id, &job.to_number, &tiff)
            .await?;
        Ok(SendOutcome {
            provider_sid: Some(job.id.clone()),
            status: JobStatus::InProgress,
            pages: None,
            error: None,
        })
    }

    /// Telephony delivery state only moves on manager events; polling just
    /// reflects the stored status back.
    async fn get_status(&self, job: &OutboundJob) -> Result<SendOutcome, ProviderError> {
        Ok(SendOutcome {
            provider_sid: job.provider_sid.clone(),
            status: job.status,
            pages: job.pages,
            error: None,
        })
    }
}
