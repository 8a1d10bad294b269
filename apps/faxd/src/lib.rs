//! Fax gateway daemon: accepts outbound fax jobs over HTTP, dispatches them
//! through the active provider backend, receives vendor status callbacks and
//! inbound fax webhooks, and serves artifacts behind capability tokens.

pub mod adapters;
pub mod callbacks;
pub mod config;
pub mod dispatch;
pub mod http;
pub mod telemetry;

use std::sync::Arc;

use tracing::{info, warn};

use fax_ami::{AmiClient, AmiConfig};
use fax_core::store::JobUpdate;
use fax_core::{
    ArtifactStore, FaxError, JobStatus, JobStore, LocalArtifactStore, PassthroughRenderer,
    Renderer,
};
use fax_provider_registry::{ProviderRegistry, RegistrySettings};
use fax_tokens::TokenService;

pub use config::FaxConfig;
pub use dispatch::Dispatcher;
pub use http::build_router;

/// Shared service root. Cloning is cheap; all members are handles.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<FaxConfig>,
    pub store: JobStore,
    pub registry: Arc<ProviderRegistry>,
    pub job_tokens: TokenService,
    pub inbound_tokens: TokenService,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub renderer: Arc<dyn Renderer>,
    pub ami: AmiClient,
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(config: FaxConfig) -> Result<Self, FaxError> {
        std::fs::create_dir_all(&config.data_dir)?;
        let store = JobStore::open(config.db_path())?;
        Self::with_store(config, store)
    }

    /// Builds the service root around an already-open store. Tests use this
    /// with an in-memory store.
    pub fn with_store(config: FaxConfig, store: JobStore) -> Result<Self, FaxError> {
        std::fs::create_dir_all(&config.data_dir)?;
        let registry = Arc::new(ProviderRegistry::new(RegistrySettings {
            traits_path: config.traits_path.clone(),
            providers_dir: config.providers_dir.clone(),
            default_backend: config.backend.clone(),
            outbound_backend: config.outbound_backend.clone(),
            inbound_backend: config.inbound_backend.clone(),
        }));
        let artifacts: Arc<dyn ArtifactStore> =
            Arc::new(LocalArtifactStore::new(config.data_dir.join("artifacts"))?);
        let mut ami_config = AmiConfig::new(
            config.telephony.ami_host.clone(),
            config.telephony.ami_port,
            config.telephony.ami_username.clone(),
            config.telephony.ami_password.clone(),
        );
        ami_config.station_id = config.telephony.station_id.clone();
        let state = Self {
            job_tokens: TokenService::from_ttl_minutes(config.pdf_token_ttl_minutes),
            inbound_tokens: TokenService::from_ttl_minutes(config.inbound_token_ttl_minutes),
            config: Arc::new(config),
            store,
            registry,
            artifacts,
            renderer: Arc::new(PassthroughRenderer),
            ami: AmiClient::new(ami_config),
            http: reqwest::Client::new(),
        };
        state.install_fax_result_listener();
        Ok(state)
    }

    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(self.clone())
    }

    /// Routes `FaxResult` manager events into terminal job state. The event
    /// carries the job id we planted as a call variable at originate time.
    fn install_fax_result_listener(&self) {
        let store = self.store.clone();
        self.ami.on_fax_result(Arc::new(move |event| {
            let Some(job_id) = event.get("JobId").cloned() else {
                warn!("fax result event without JobId");
                return;
            };
            let status = event
                .get("Status")
                .map(|s| JobStatus::from_provider(s))
                .unwrap_or(JobStatus::Failed);
            let mut update = JobUpdate::automated(&job_id, status);
            if let Some(pages) = event.get("Pages").and_then(|p| p.parse().ok()) {
                update = update.with_pages(pages);
            }
            let error = event.get("Error").cloned();
            if status == JobStatus::Failed {
                if let Some(error) = error.as_deref() {
                    update = update.with_error(error);
                }
            }
            match store.apply_status(&update) {
                Ok(true) => info!(job_id, status = status.as_str(), "fax result applied"),
                Ok(false) => info!(job_id, "fax result ignored for terminal or unknown job"),
                Err(err) => warn!(job_id, error = %err, "fax result not persisted"),
            }
        }));
    }
}
