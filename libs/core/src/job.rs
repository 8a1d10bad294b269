use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Canonical job status vocabulary. `Success` and `Failed` are terminal:
/// the store refuses any further automated transition out of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    #[serde(rename = "queued")]
    Queued,
    #[serde(rename = "in_progress")]
    InProgress,
    #[serde(rename = "SUCCESS")]
    Success,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "disabled")]
    Disabled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::InProgress => "in_progress",
            JobStatus::Success => "SUCCESS",
            JobStatus::Failed => "FAILED",
            JobStatus::Disabled => "disabled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failed)
    }

    /// Parses a stored canonical status string.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(JobStatus::Queued),
            "in_progress" => Some(JobStatus::InProgress),
            "SUCCESS" => Some(JobStatus::Success),
            "FAILED" => Some(JobStatus::Failed),
            "disabled" => Some(JobStatus::Disabled),
            _ => None,
        }
    }

    /// Normalizes a vendor status word into the canonical vocabulary.
    /// Unknown non-failure words degrade to `Queued` so a surprising vendor
    /// vocabulary never parks a job in an invalid state.
    pub fn from_provider(value: &str) -> Self {
        if let Some(parsed) = Self::parse(value) {
            return parsed;
        }
        match value.to_ascii_lowercase().as_str() {
            "queued" | "pending" => JobStatus::Queued,
            "in_progress" | "in-progress" | "sending" | "processing" | "started" => {
                JobStatus::InProgress
            }
            "success" | "delivered" | "completed" | "ok" => JobStatus::Success,
            "failed" | "failure" | "error" | "cancelled" | "canceled" => JobStatus::Failed,
            other if other.contains("fail") => JobStatus::Failed,
            _ => JobStatus::Queued,
        }
    }
}

/// One outbound fax-send attempt and its tracked lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundJob {
    pub id: String,
    pub to_number: String,
    pub original_path: String,
    pub pdf_path: String,
    pub tiff_path: Option<String>,
    pub status: JobStatus,
    pub backend: String,
    pub provider_sid: Option<String>,
    pub pages: Option<u32>,
    /// Sanitized and length-capped before persisting.
    pub error: Option<String>,
    pub pdf_url: Option<String>,
    pub pdf_token: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub pdf_token_expires_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl OutboundJob {
    pub fn new(
        id: String,
        to_number: String,
        original_path: String,
        pdf_path: String,
        backend: String,
    ) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id,
            to_number,
            original_path,
            pdf_path,
            tiff_path: None,
            status: JobStatus::Queued,
            backend,
            provider_sid: None,
            pages: None,
            error: None,
            pdf_url: None,
            pdf_token: None,
            pdf_token_expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One received fax, created only by the callback receiver or the internal
/// telephony ingestion route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundArtifact {
    pub id: String,
    pub from_number: Option<String>,
    pub to_number: Option<String>,
    pub status: String,
    pub backend: String,
    pub provider_sid: Option<String>,
    pub pages: Option<u32>,
    pub size_bytes: Option<u64>,
    pub sha256: Option<String>,
    /// URI under the artifact store (local path or remote object URI).
    pub pdf_uri: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub retention_until: Option<OffsetDateTime>,
    pub pdf_token: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub pdf_token_expires_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_vocabulary_normalizes() {
        assert_eq!(JobStatus::from_provider("sending"), JobStatus::InProgress);
        assert_eq!(JobStatus::from_provider("delivered"), JobStatus::Success);
        assert_eq!(JobStatus::from_provider("canceled"), JobStatus::Failed);
        assert_eq!(JobStatus::from_provider("transmitfailed"), JobStatus::Failed);
        assert_eq!(JobStatus::from_provider("whatever"), JobStatus::Queued);
    }

    #[test]
    fn canonical_strings_round_trip() {
        for status in [
            JobStatus::Queued,
            JobStatus::InProgress,
            JobStatus::Success,
            JobStatus::Failed,
            JobStatus::Disabled,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn terminal_states() {
        assert!(JobStatus::Success.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::InProgress.is_terminal());
        assert!(!JobStatus::Disabled.is_terminal());
    }
}
