//! Outbound dispatch: resolves the active backend to a send adapter, drives
//! the job lifecycle, and owns the retry policy. Jobs are durably inserted
//! before anything here runs; a crash mid-dispatch leaves an inspectable
//! record, never a lost request.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use tracing::{error, info, warn};

use fax_core::store::JobUpdate;
use fax_core::{FaxError, JobStatus, OutboundJob, ProviderError};

use crate::AppState;
use crate::adapters;

/// Closed set of backend families. Manifest-driven providers are one family;
/// the concrete provider id selects which manifest to interpret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendKind {
    Phaxio,
    Sinch,
    SignalWire,
    Telephony,
    Manifest(String),
}

impl BackendKind {
    /// Maps a backend id onto its family. Unknown ids are a configuration
    /// error, not a runtime fallback.
    pub fn resolve(id: &str, state: &AppState) -> Result<Self, FaxError> {
        match id {
            "phaxio" => Ok(BackendKind::Phaxio),
            "sinch" => Ok(BackendKind::Sinch),
            "signalwire" => Ok(BackendKind::SignalWire),
            "telephony" | "sip" => Ok(BackendKind::Telephony),
            other => {
                let manifest_path = state.config.providers_dir.join(other).join("manifest.json");
                if manifest_path.is_file() {
                    Ok(BackendKind::Manifest(other.to_string()))
                } else {
                    Err(FaxError::Config(format!("unknown fax backend: {other}")))
                }
            }
        }
    }
}

/// Result of one provider send or status poll.
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub provider_sid: Option<String>,
    pub status: JobStatus,
    pub pages: Option<u32>,
    pub error: Option<String>,
}

/// Contract every backend family implements. `send` transmits the artifact;
/// `get_status` re-polls the vendor and is extracted identically to `send`.
#[async_trait]
pub trait SendAdapter: Send + Sync {
    fn id(&self) -> &str;
    async fn send(&self, job: &OutboundJob) -> Result<SendOutcome, ProviderError>;
    async fn get_status(&self, job: &OutboundJob) -> Result<SendOutcome, ProviderError>;
}

const SEND_ATTEMPTS: u32 = 3;
const RETRY_BASE: Duration = Duration::from_secs(1);
const RETRY_CAP: Duration = Duration::from_secs(8);

#[derive(Clone)]
pub struct Dispatcher {
    state: AppState,
}

impl Dispatcher {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    pub fn resolve(&self, backend: &str) -> Result<Arc<dyn SendAdapter>, FaxError> {
        adapters::build(BackendKind::resolve(backend, &self.state)?, &self.state)
    }

    /// Detached dispatch entry point. Every failure path ends in persisted
    /// job state; nothing propagates out of the spawned task.
    pub fn spawn(&self, job_id: String) {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            dispatcher.run(&job_id).await;
        });
    }

    pub async fn run(&self, job_id: &str) {
        if let Err(err) = self.try_dispatch(job_id).await {
            self.record_failure(job_id, &err);
        }
    }

    /// Converts a dispatch error into persisted terminal state. The store
    /// sanitizes the message before it lands in the row.
    fn record_failure(&self, job_id: &str, err: &FaxError) {
        counter!("fax_jobs_failed_total").increment(1);
        error!(job_id, error = %err, "dispatch failed");
        let message = err.to_string();
        let update = JobUpdate::automated(job_id, JobStatus::Failed).with_error(&message);
        if let Err(persist_err) = self.state.store.apply_status(&update) {
            error!(job_id, error = %persist_err, "failed job state not persisted");
        }
    }

    async fn try_dispatch(&self, job_id: &str) -> Result<(), FaxError> {
        let job = self
            .state
            .store
            .get_job(job_id)?
            .ok_or_else(|| FaxError::NotFound(format!("job {job_id}")))?;

        if self.state.config.disabled {
            info!(job_id, "fax sending disabled, recording job without dispatch");
            self.state
                .store
                .apply_status(&JobUpdate::automated(job_id, JobStatus::Disabled))?;
            return Ok(());
        }

        let adapter = self.resolve(&job.backend)?;
        self.deliver(job_id, adapter.as_ref()).await
    }

    async fn deliver(&self, job_id: &str, adapter: &dyn SendAdapter) -> Result<(), FaxError> {
        // Cloud vendors fetch the artifact back from us; mint the capability
        // token before the send so the URL in the request is live.
        let issued = self.state.job_tokens.issue();
        let pdf_url = self.state.config.job_pdf_url(job_id, &issued.token);
        self.state
            .store
            .attach_job_token(job_id, &issued.token, issued.expires_at, &pdf_url)?;
        self.state
            .store
            .apply_status(&JobUpdate::automated(job_id, JobStatus::InProgress))?;

        // Re-read so the adapter sees the token and url.
        let job = self
            .state
            .store
            .get_job(job_id)?
            .ok_or_else(|| FaxError::NotFound(format!("job {job_id}")))?;

        let outcome = self.send_with_retry(adapter, &job).await?;
        self.apply_outcome(job_id, &outcome)?;
        counter!("fax_jobs_dispatched_total").increment(1);
        info!(
            job_id,
            backend = %job.backend,
            status = outcome.status.as_str(),
            "dispatch complete"
        );
        Ok(())
    }

    /// Transport failures are retried with exponential backoff; application
    /// rejections are final on the first attempt.
    async fn send_with_retry(
        &self,
        adapter: &dyn SendAdapter,
        job: &OutboundJob,
    ) -> Result<SendOutcome, ProviderError> {
        let mut delay = RETRY_BASE;
        let mut attempt = 1;
        loop {
            match adapter.send(job).await {
                Ok(outcome) => return Ok(outcome),
                Err(err) if err.is_retryable() && attempt < SEND_ATTEMPTS => {
                    warn!(
                        job_id = %job.id,
                        attempt,
                        error = %err,
                        "transport failure, retrying"
                    );
                    counter!("fax_send_retries_total").increment(1);
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(RETRY_CAP);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn apply_outcome(&self, job_id: &str, outcome: &SendOutcome) -> Result<(), FaxError> {
        let mut update = JobUpdate::automated(job_id, outcome.status);
        if let Some(sid) = outcome.provider_sid.as_deref() {
            update = update.with_provider_sid(sid);
        }
        if let Some(pages) = outcome.pages {
            update = update.with_pages(pages);
        }
        if let Some(error) = outcome.error.as_deref() {
            update = update.with_error(error);
        }
        self.state.store.apply_status(&update)?;
        Ok(())
    }

    /// Manual refresh: re-resolves the adapter for the job's backend and
    /// applies send-identical extraction to the polled status.
    pub async fn refresh(&self, job_id: &str) -> Result<OutboundJob, FaxError> {
        let job = self
            .state
            .store
            .get_job(job_id)?
            .ok_or_else(|| FaxError::NotFound(format!("job {job_id}")))?;
        if job.status.is_terminal() || self.state.config.disabled {
            return Ok(job);
        }
        let adapter = self.resolve(&job.backend)?;
        let outcome = adapter.get_status(&job).await?;
        self.apply_outcome(job_id, &outcome)?;
        self.state
            .store
            .get_job(job_id)?
            .ok_or_else(|| FaxError::NotFound(format!("job {job_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use tempfile::TempDir;

    use fax_core::JobStore;

    use crate::config::{
        FaxConfig, PhaxioSettings, SignalWireSettings, SinchSettings, TelephonySettings,
    };

    fn live_state(dir: &TempDir) -> AppState {
        let config = FaxConfig {
            bind: "127.0.0.1:0".into(),
            data_dir: dir.path().to_path_buf(),
            public_url: "http://gw.test".into(),
            api_key: None,
            disabled: false,
            backend: "phaxio".into(),
            outbound_backend: None,
            inbound_backend: None,
            inbound_enabled: false,
            traits_path: dir.path().join("fax_providers.json"),
            providers_dir: dir.path().join("providers"),
            max_file_size_mb: 2,
            pdf_token_ttl_minutes: 60,
            inbound_token_ttl_minutes: 60,
            inbound_retention_days: 30,
            phaxio: PhaxioSettings::default(),
            sinch: SinchSettings::default(),
            signalwire: SignalWireSettings::default(),
            telephony: TelephonySettings::default(),
        };
        let store = JobStore::open_in_memory().expect("in-memory store");
        AppState::with_store(config, store).expect("app state")
    }

    fn sample_job(id: &str) -> OutboundJob {
        OutboundJob::new(
            id.into(),
            "+15551234567".into(),
            format!("/tmp/{id}.pdf"),
            format!("/tmp/{id}.pdf"),
            "phaxio".into(),
        )
    }

    /// Fails with a transport error until `succeed_after` attempts, then
    /// reports an in-progress send.
    struct FlakySend {
        attempts: AtomicU32,
        succeed_after: u32,
        error: &'static str,
    }

    impl FlakySend {
        fn failing_with(error: &'static str) -> Self {
            Self { attempts: AtomicU32::new(0), succeed_after: u32::MAX, error }
        }

        fn recovering_on(succeed_after: u32) -> Self {
            Self { attempts: AtomicU32::new(0), succeed_after, error: "connect timed out" }
        }

        fn attempts(&self) -> u32 {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SendAdapter for FlakySend {
        fn id(&self) -> &str {
            "flaky"
        }

        async fn send(&self, _job: &OutboundJob) -> Result<SendOutcome, ProviderError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt >= self.succeed_after {
                Ok(SendOutcome {
                    provider_sid: Some("sid-1".into()),
                    status: JobStatus::InProgress,
                    pages: None,
                    error: None,
                })
            } else {
                Err(ProviderError::transport(self.error))
            }
        }

        async fn get_status(&self, _job: &OutboundJob) -> Result<SendOutcome, ProviderError> {
            Err(ProviderError::transport("not polled in these tests"))
        }
    }

    /// Rejects every send with an application error.
    struct RejectingSend {
        attempts: AtomicU32,
    }

    #[async_trait]
    impl SendAdapter for RejectingSend {
        fn id(&self) -> &str {
            "rejecting"
        }

        async fn send(&self, _job: &OutboundJob) -> Result<SendOutcome, ProviderError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(ProviderError::application("invalid destination"))
        }

        async fn get_status(&self, _job: &OutboundJob) -> Result<SendOutcome, ProviderError> {
            Err(ProviderError::transport("not polled in these tests"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failures_retry_until_success() {
        let dir = TempDir::new().expect("tempdir");
        let dispatcher = live_state(&dir).dispatcher();
        let adapter = FlakySend::recovering_on(3);

        let outcome = dispatcher
            .send_with_retry(&adapter, &sample_job("j-retry"))
            .await
            .expect("send succeeds on third attempt");

        assert_eq!(adapter.attempts(), SEND_ATTEMPTS);
        assert_eq!(outcome.status, JobStatus::InProgress);
        assert_eq!(outcome.provider_sid.as_deref(), Some("sid-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn application_rejection_is_final_on_first_attempt() {
        let dir = TempDir::new().expect("tempdir");
        let dispatcher = live_state(&dir).dispatcher();
        let adapter = RejectingSend { attempts: AtomicU32::new(0) };

        let err = dispatcher
            .send_with_retry(&adapter, &sample_job("j-reject"))
            .await
            .expect_err("application errors are not retried");

        assert_eq!(adapter.attempts.load(Ordering::SeqCst), 1);
        assert!(!err.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_leave_job_failed_with_sanitized_error() {
        let dir = TempDir::new().expect("tempdir");
        let state = live_state(&dir);
        let dispatcher = state.dispatcher();
        state.store.insert_job(&sample_job("j-dead")).expect("insert");

        let adapter = FlakySend::failing_with(
            "no route to carrier gateway for +15551234567, tried primary and secondary \
             trunks before giving up entirely",
        );
        let err = dispatcher
            .deliver("j-dead", &adapter)
            .await
            .expect_err("retries exhausted");
        dispatcher.record_failure("j-dead", &err);

        assert_eq!(adapter.attempts(), SEND_ATTEMPTS);
        let job = state.store.get_job("j-dead").expect("get").expect("job");
        assert_eq!(job.status, JobStatus::Failed);
        let error = job.error.expect("failure message persisted");
        assert!(!error.is_empty());
        assert!(error.len() <= 80);
        assert!(!error.contains("15551234567"));
        assert!(error.contains("***"));
    }
}
