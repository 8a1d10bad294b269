//! Environment-driven configuration for the fax gateway daemon. Every knob
//! has a workable default so a bare `faxd` starts in disabled mode against a
//! local data directory.

use std::path::PathBuf;

use fax_core::FaxError;

#[derive(Debug, Clone)]
pub struct FaxConfig {
    pub bind: String,
    pub data_dir: PathBuf,
    pub public_url: String,
    /// When set, caller-facing routes require this `X-API-Key` value.
    pub api_key: Option<String>,
    /// Records jobs without any vendor I/O.
    pub disabled: bool,
    pub backend: String,
    pub outbound_backend: Option<String>,
    pub inbound_backend: Option<String>,
    pub inbound_enabled: bool,
    pub traits_path: PathBuf,
    pub providers_dir: PathBuf,
    pub max_file_size_mb: u64,
    pub pdf_token_ttl_minutes: i64,
    pub inbound_token_ttl_minutes: i64,
    pub inbound_retention_days: i64,
    pub phaxio: PhaxioSettings,
    pub sinch: SinchSettings,
    pub signalwire: SignalWireSettings,
    pub telephony: TelephonySettings,
}

#[derive(Debug, Clone, Default)]
pub struct PhaxioSettings {
    pub api_key: String,
    pub api_secret: String,
    pub verify_signature: bool,
    pub inbound_verify_signature: bool,
}

impl PhaxioSettings {
    pub fn is_configured(&self) -> bool {
        !self.api_key.is_empty() && !self.api_secret.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SinchSettings {
    pub project_id: String,
    pub api_key: String,
    pub api_secret: String,
    pub base_url: String,
    pub inbound_basic_user: Option<String>,
    pub inbound_basic_pass: Option<String>,
    pub inbound_hmac_secret: Option<String>,
}

impl SinchSettings {
    pub fn is_configured(&self) -> bool {
        !self.project_id.is_empty() && !self.api_key.is_empty() && !self.api_secret.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SignalWireSettings {
    pub space_url: String,
    pub project_id: String,
    pub api_token: String,
    pub from_number: String,
    pub signing_key: Option<String>,
}

impl SignalWireSettings {
    pub fn is_configured(&self) -> bool {
        !self.space_url.is_empty() && !self.project_id.is_empty() && !self.api_token.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct TelephonySettings {
    pub ami_host: String,
    pub ami_port: u16,
    pub ami_username: String,
    pub ami_password: String,
    pub station_id: String,
    /// Shared secret for the internal inbound ingestion route.
    pub internal_secret: Option<String>,
}

impl Default for TelephonySettings {
    fn default() -> Self {
        Self {
            ami_host: "asterisk".into(),
            ami_port: 5038,
            ami_username: "faxd".into(),
            ami_password: String::new(),
            station_id: String::new(),
            internal_secret: None,
        }
    }
}

impl FaxConfig {
    pub fn from_env() -> Result<Self, FaxError> {
        let data_dir = PathBuf::from(env_or("FAX_DATA_DIR", "./faxdata"));
        let config = Self {
            bind: env_or("BIND", "0.0.0.0:8080"),
            public_url: env_or("PUBLIC_API_URL", "http://localhost:8080"),
            api_key: env_opt("API_KEY"),
            disabled: env_bool("FAX_DISABLED", true),
            backend: env_or("FAX_BACKEND", "phaxio"),
            outbound_backend: env_opt("FAX_OUTBOUND_BACKEND"),
            inbound_backend: env_opt("FAX_INBOUND_BACKEND"),
            inbound_enabled: env_bool("INBOUND_ENABLED", false),
            traits_path: PathBuf::from(env_or("FAX_TRAITS_PATH", "config/fax_providers.json")),
            providers_dir: PathBuf::from(env_or("FAX_PROVIDERS_DIR", "config/providers")),
            max_file_size_mb: env_parse("MAX_FILE_SIZE_MB", 10)?,
            pdf_token_ttl_minutes: env_parse("PDF_TOKEN_TTL_MINUTES", 60)?,
            inbound_token_ttl_minutes: env_parse("INBOUND_TOKEN_TTL_MINUTES", 60)?,
            inbound_retention_days: env_parse("INBOUND_RETENTION_DAYS", 30)?,
            phaxio: PhaxioSettings {
                api_key: env_or("PHAXIO_API_KEY", ""),
                api_secret: env_or("PHAXIO_API_SECRET", ""),
                verify_signature: env_bool("PHAXIO_VERIFY_SIGNATURE", true),
                inbound_verify_signature: env_bool("PHAXIO_INBOUND_VERIFY_SIGNATURE", true),
            },
            sinch: SinchSettings {
                project_id: env_or("SINCH_PROJECT_ID", ""),
                api_key: env_or("SINCH_API_KEY", ""),
                api_secret: env_or("SINCH_API_SECRET", ""),
                base_url: env_or("SINCH_BASE_URL", "https://fax.api.sinch.com/v3"),
                inbound_basic_user: env_opt("SINCH_INBOUND_BASIC_USER"),
                inbound_basic_pass: env_opt("SINCH_INBOUND_BASIC_PASS"),
                inbound_hmac_secret: env_opt("SINCH_INBOUND_HMAC_SECRET"),
            },
            signalwire: SignalWireSettings {
                space_url: env_or("SIGNALWIRE_SPACE_URL", ""),
                project_id: env_or("SIGNALWIRE_PROJECT_ID", ""),
                api_token: env_or("SIGNALWIRE_API_TOKEN", ""),
                from_number: env_or("SIGNALWIRE_FAX_FROM", ""),
                signing_key: env_opt("SIGNALWIRE_SIGNING_KEY"),
            },
            telephony: TelephonySettings {
                ami_host: env_or("AMI_HOST", "asterisk"),
                ami_port: env_parse("AMI_PORT", 5038)?,
                ami_username: env_or("AMI_USERNAME", "faxd"),
                ami_password: env_or("AMI_PASSWORD", ""),
                station_id: env_or("FAX_STATION_ID", ""),
                internal_secret: env_opt("TELEPHONY_INBOUND_SECRET"),
            },
            data_dir,
        };
        Ok(config)
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("faxd.db")
    }

    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb * 1024 * 1024
    }

    /// Tokenized artifact URL handed to cloud vendors for a given job.
    pub fn job_pdf_url(&self, job_id: &str, token: &str) -> String {
        format!(
            "{}/fax/{job_id}/pdf?token={token}",
            self.public_url.trim_end_matches('/')
        )
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T, FaxError> {
    match std::env::var(key) {
        Ok(value) => value
            .parse()
            .map_err(|_| FaxError::Config(format!("{key} is not a valid value: {value}"))),
        Err(_) => Ok(default),
    }
}
