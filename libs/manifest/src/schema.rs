use std::collections::BTreeMap;

use serde::Deserialize;

/// Errors produced while parsing or validating a provider manifest.
#[derive(thiserror::Error, Debug)]
pub enum ManifestError {
    #[error("manifest parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("manifest invalid: {0}")]
    Invalid(String),
}

/// Declarative description of a vendor HTTP fax API.
#[derive(Clone, Debug, Deserialize)]
pub struct ProviderManifest {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub allowed_domains: Vec<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub actions: Actions,
}

fn default_timeout_ms() -> u64 {
    15_000
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Actions {
    #[serde(default)]
    pub send_fax: Option<HttpAction>,
    #[serde(default)]
    pub get_status: Option<HttpAction>,
    #[serde(default)]
    pub cancel_fax: Option<HttpAction>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct HttpAction {
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: BodySpec,
    #[serde(default)]
    pub path_params: Vec<PathParam>,
    #[serde(default)]
    pub response: ResponseMap,
}

fn default_method() -> String {
    "POST".to_string()
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct BodySpec {
    #[serde(default)]
    pub kind: BodyKind,
    #[serde(default)]
    pub template: String,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BodyKind {
    #[default]
    None,
    Json,
    Form,
    Multipart,
}

/// Binds a `{name}` placeholder in the action URL to a context path.
#[derive(Clone, Debug, Deserialize)]
pub struct PathParam {
    pub name: String,
    #[serde(default)]
    pub source: Option<String>,
}

/// Field-extraction map applied to the vendor response body.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ResponseMap {
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    /// Vendor status vocabulary → canonical status. Absent keys pass through.
    #[serde(default)]
    pub status_map: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub scheme: AuthScheme,
    #[serde(default)]
    pub header_name: Option<String>,
    #[serde(default)]
    pub query_name: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuthScheme {
    #[default]
    None,
    Basic,
    Bearer,
    ApiKeyHeader,
    ApiKeyQuery,
}

impl ProviderManifest {
    /// Parses and validates a manifest from a JSON string.
    pub fn from_json(content: &str) -> Result<Self, ManifestError> {
        let manifest: ProviderManifest = serde_json::from_str(content)?;
        manifest.ensure_valid()?;
        Ok(manifest)
    }

    /// Structural checks surfaced at install/readiness time, not mid-send.
    pub fn ensure_valid(&self) -> Result<(), ManifestError> {
        if self.id.trim().is_empty() {
            return Err(ManifestError::Invalid("id must not be empty".into()));
        }
        let Some(send) = &self.actions.send_fax else {
            return Err(ManifestError::Invalid("missing send_fax action".into()));
        };
        for (label, action) in [
            ("send_fax", Some(send)),
            ("get_status", self.actions.get_status.as_ref()),
            ("cancel_fax", self.actions.cancel_fax.as_ref()),
        ] {
            if let Some(action) = action {
                if action.url.trim().is_empty() {
                    return Err(ManifestError::Invalid(format!("{label}.url must not be empty")));
                }
            }
        }
        if self.allowed_domains.is_empty() {
            return Err(ManifestError::Invalid(
                "allowed_domains must list at least one host".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "id": "acmefax",
        "name": "Acme Fax",
        "auth": { "scheme": "api_key_header", "header_name": "X-Acme-Key" },
        "allowed_domains": ["api.acmefax.test"],
        "timeout_ms": 5000,
        "actions": {
            "send_fax": {
                "method": "POST",
                "url": "https://api.acmefax.test/v1/faxes",
                "body": { "kind": "json", "template": "{\"to\":\"{{ to }}\"}" },
                "response": { "job_id": "id", "status": "state",
                              "status_map": { "SENT": "SUCCESS" } }
            },
            "get_status": {
                "method": "GET",
                "url": "https://api.acmefax.test/v1/faxes/{fax}",
                "path_params": [{ "name": "fax", "source": "provider_sid" }]
            }
        }
    }"#;

    #[test]
    fn parses_full_manifest() {
        let manifest = ProviderManifest::from_json(SAMPLE).unwrap();
        assert_eq!(manifest.auth.scheme, AuthScheme::ApiKeyHeader);
        let send = manifest.actions.send_fax.unwrap();
        assert_eq!(send.body.kind, BodyKind::Json);
        assert_eq!(send.response.status_map.get("SENT").unwrap(), "SUCCESS");
        let status = manifest.actions.get_status.unwrap();
        assert_eq!(status.path_params[0].source.as_deref(), Some("provider_sid"));
    }

    #[test]
    fn missing_send_action_is_invalid() {
        let err = ProviderManifest::from_json(
            r#"{ "id": "x", "allowed_domains": ["a.test"], "actions": {} }"#,
        )
        .unwrap_err();
        assert!(matches!(err, ManifestError::Invalid(_)));
    }

    #[test]
    fn empty_allowlist_is_invalid() {
        let err = ProviderManifest::from_json(
            r#"{ "id": "x", "actions": { "send_fax": { "url": "https://a.test/f" } } }"#,
        )
        .unwrap_err();
        assert!(matches!(err, ManifestError::Invalid(_)));
    }

    #[test]
    fn defaults_apply() {
        let manifest = ProviderManifest::from_json(
            r#"{ "id": "x", "allowed_domains": ["a.test"],
                 "actions": { "send_fax": { "url": "https://a.test/f" } } }"#,
        )
        .unwrap();
        assert_eq!(manifest.timeout_ms, 15_000);
        assert_eq!(manifest.auth.scheme, AuthScheme::None);
        assert_eq!(manifest.actions.send_fax.unwrap().method, "POST");
    }
}
