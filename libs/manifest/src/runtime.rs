//! Generic interpreter that executes a manifest action against a vendor API.
//! Everything vendor-specific — URL shape, auth, body, response vocabulary —
//! comes from the manifest; the interpreter only enforces the allowlist,
//! timeouts, and the extraction rules.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::Method;
use serde_json::{Value, json};
use tracing::debug;
use url::Url;

use fax_core::ProviderError;

use crate::schema::{AuthScheme, BodyKind, HttpAction, ProviderManifest, ResponseMap};
use crate::template::{extract, render};

/// Field names whose form value designates the binary attachment part.
const ATTACHMENT_KEYS: &[&str] = &["attachment", "file", "document"];

/// Outcome of a manifest send/status action after response extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionOutcome {
    pub provider_id: String,
    pub job_id: String,
    pub status: String,
    pub error: Option<String>,
}

/// Inputs for a manifest-driven send.
#[derive(Debug, Clone, Default)]
pub struct SendRequest<'a> {
    pub to: &'a str,
    pub file_url: Option<&'a str>,
    pub file_path: Option<&'a str>,
    pub from_number: Option<&'a str>,
}

pub struct ManifestRuntime {
    manifest: ProviderManifest,
    credentials: Value,
    settings: Value,
    http: reqwest::Client,
}

impl ManifestRuntime {
    pub fn new(manifest: ProviderManifest, credentials: Value, settings: Value) -> Self {
        Self {
            manifest,
            credentials,
            settings,
            http: reqwest::Client::new(),
        }
    }

    pub fn manifest(&self) -> &ProviderManifest {
        &self.manifest
    }

    /// Executes the `send_fax` action.
    pub async fn send(&self, request: SendRequest<'_>) -> Result<ActionOutcome, ProviderError> {
        let action = self.action("send_fax", self.manifest.actions.send_fax.as_ref())?;
        let ctx = json!({
            "to": request.to,
            "from": request.from_number,
            "file_url": request.file_url,
            "file_path": request.file_path,
            "settings": self.settings,
            "creds": self.credentials,
        });
        let attachment = AttachmentSource {
            file_url: request.file_url,
            file_path: request.file_path,
        };
        self.execute(action, &ctx, Some(attachment), "").await
    }

    /// Executes the `get_status` action, applying send-identical extraction.
    pub async fn get_status(
        &self,
        job_id: Option<&str>,
        provider_sid: Option<&str>,
    ) -> Result<ActionOutcome, ProviderError> {
        let action = self.action("get_status", self.manifest.actions.get_status.as_ref())?;
        let ctx = json!({
            "job_id": job_id.or(provider_sid),
            "provider_sid": provider_sid.or(job_id),
            "settings": self.settings,
            "creds": self.credentials,
        });
        let fallback = provider_sid.or(job_id).unwrap_or_default();
        self.execute(action, &ctx, None, fallback).await
    }

    /// Executes the `cancel_fax` action; true when the vendor accepted it.
    pub async fn cancel(&self, provider_sid: &str) -> Result<bool, ProviderError> {
        let action = self.action("cancel_fax", self.manifest.actions.cancel_fax.as_ref())?;
        let ctx = json!({
            "job_id": provider_sid,
            "provider_sid": provider_sid,
            "settings": self.settings,
            "creds": self.credentials,
        });
        match self.execute(action, &ctx, None, provider_sid).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_retryable() => Err(err),
            Err(_) => Ok(false),
        }
    }

    fn action<'a>(
        &self,
        name: &str,
        action: Option<&'a HttpAction>,
    ) -> Result<&'a HttpAction, ProviderError> {
        action.ok_or_else(|| {
            ProviderError::application(format!(
                "manifest {} missing {name} action",
                self.manifest.id
            ))
        })
    }

    fn resolve_url(&self, action: &HttpAction, ctx: &Value) -> Result<Url, ProviderError> {
        let mut raw = action.url.clone();
        for param in &action.path_params {
            let source = param.source.as_deref().unwrap_or(&param.name);
            let value = extract(ctx, source)
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_default();
            raw = raw.replace(&format!("{{{}}}", param.name), &value);
        }
        let url = Url::parse(&raw)
            .map_err(|err| ProviderError::application(format!("manifest url invalid: {err}")))?;
        let host = url.host_str().unwrap_or_default();
        if !self
            .manifest
            .allowed_domains
            .iter()
            .any(|allowed| allowed == host)
        {
            return Err(ProviderError::application(format!(
                "host {host} not in manifest allowlist"
            )));
        }
        Ok(url)
    }

    /// Injects credentials per the manifest auth scheme. Secrets never reach
    /// logs; only the scheme name is traced.
    fn apply_auth(
        &self,
        headers: &mut Vec<(String, String)>,
        query: &mut Vec<(String, String)>,
    ) {
        let cred = |key: &str| -> String {
            self.credentials
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        match self.manifest.auth.scheme {
            AuthScheme::None => {}
            AuthScheme::Basic => {
                let user = cred("username");
                let mut pass = cred("api_key");
                if pass.is_empty() {
                    pass = cred("password");
                }
                let token = BASE64.encode(format!("{user}:{pass}"));
                headers.push(("Authorization".into(), format!("Basic {token}")));
            }
            AuthScheme::Bearer => {
                let mut token = cred("api_key");
                if token.is_empty() {
                    token = cred("token");
                }
                headers.push(("Authorization".into(), format!("Bearer {token}")));
            }
            AuthScheme::ApiKeyHeader => {
                let name = self
                    .manifest
                    .auth
                    .header_name
                    .clone()
                    .unwrap_or_else(|| "X-API-Key".into());
                headers.push((name, cred("api_key")));
            }
            AuthScheme::ApiKeyQuery => {
                let name = self
                    .manifest
                    .auth
                    .query_name
                    .clone()
                    .unwrap_or_else(|| "api_key".into());
                query.push((name, cred("api_key")));
            }
        }
    }

    async fn execute(
        &self,
        action: &HttpAction,
        ctx: &Value,
        attachment: Option<AttachmentSource<'_>>,
        fallback_job_id: &str,
    ) -> Result<ActionOutcome, ProviderError> {
        // The allowlist check must precede any network activity.
        let url = self.resolve_url(action, ctx)?;

        let method = Method::from_bytes(action.method.as_bytes()).unwrap_or(Method::POST);
        let mut headers: Vec<(String, String)> = action
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), render(v, ctx)))
            .collect();
        let mut query: Vec<(String, String)> = Vec::new();
        self.apply_auth(&mut headers, &mut query);

        let mut builder = self
            .http
            .request(method, url)
            .timeout(Duration::from_millis(self.manifest.timeout_ms));
        for (name, value) in &headers {
            builder = builder.header(name, value);
        }
        if !query.is_empty() {
            builder = builder.query(&query);
        }

        builder = match action.body.kind {
            BodyKind::None => builder,
            BodyKind::Json => {
                let rendered = render(&action.body.template, ctx);
                let body: Value = serde_json::from_str(&rendered).map_err(|err| {
                    ProviderError::application(format!(
                        "manifest body template is not valid JSON: {err}"
                    ))
                })?;
                builder.json(&body)
            }
            BodyKind::Form => builder.form(&render_pairs(&action.body.template, ctx)),
            BodyKind::Multipart => {
                let source = attachment.ok_or_else(|| {
                    ProviderError::application("multipart body requires an artifact")
                })?;
                let mut form = reqwest::multipart::Form::new();
                let mut wants_attachment = None;
                for (key, value) in render_pairs(&action.body.template, ctx) {
                    if ATTACHMENT_KEYS.contains(&key.to_ascii_lowercase().as_str()) {
                        wants_attachment = Some(key);
                    } else {
                        form = form.text(key, value);
                    }
                }
                if let Some(field) = wants_attachment {
                    let (bytes, filename) = source.load(&self.http).await?;
                    let part = reqwest::multipart::Part::bytes(bytes)
                        .file_name(filename)
                        .mime_str("application/pdf")
                        .map_err(|err| ProviderError::application(err.to_string()))?;
                    form = form.part(field, part);
                }
                builder.multipart(form)
            }
        };

        debug!(provider = %self.manifest.id, "executing manifest action");
        let response = builder
            .send()
            .await
            .map_err(|err| ProviderError::transport(err.to_string()))?;
        let http_status = response.status();
        let text = response
            .text()
            .await
            .map_err(|err| ProviderError::transport(err.to_string()))?;
        let data: Value = serde_json::from_str(&text)
            .unwrap_or_else(|_| json!({ "status_code": http_status.as_u16(), "text": text }));

        let outcome = extract_outcome(
            &action.response,
            &data,
            http_status.as_u16(),
            &self.manifest.id,
            fallback_job_id,
        );
        if http_status.is_client_error() {
            let detail = outcome.error.unwrap_or_else(|| outcome.status.clone());
            return Err(ProviderError::application(format!(
                "vendor rejected request ({}): {detail}",
                http_status.as_u16()
            )));
        }
        if http_status.is_server_error() {
            return Err(ProviderError::transport(format!(
                "vendor error {}",
                http_status.as_u16()
            )));
        }
        Ok(outcome)
    }
}

struct AttachmentSource<'a> {
    file_url: Option<&'a str>,
    file_path: Option<&'a str>,
}

impl AttachmentSource<'_> {
    /// Loads the artifact bytes, preferring the URL over the local path.
    async fn load(&self, http: &reqwest::Client) -> Result<(Vec<u8>, String), ProviderError> {
        if let Some(url) = self.file_url {
            let filename = Url::parse(url)
                .ok()
                .and_then(|u| {
                    u.path_segments()
                        .and_then(|mut s| s.next_back().map(str::to_string))
                })
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| "fax.pdf".into());
            let response = http
                .get(url)
                .send()
                .await
                .map_err(|err| ProviderError::transport(err.to_string()))?;
            if !response.status().is_success() {
                return Err(ProviderError::transport(format!(
                    "artifact fetch failed with {}",
                    response.status().as_u16()
                )));
            }
            let bytes = response
                .bytes()
                .await
                .map_err(|err| ProviderError::transport(err.to_string()))?;
            return Ok((bytes.to_vec(), filename));
        }
        if let Some(path) = self.file_path {
            let bytes = tokio::fs::read(path)
                .await
                .map_err(|err| ProviderError::application(format!("artifact unreadable: {err}")))?;
            let filename = std::path::Path::new(path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "fax.pdf".into());
            return Ok((bytes, filename));
        }
        Err(ProviderError::application("no artifact reference provided"))
    }
}

/// Splits a rendered `k=v&k=v` template into pairs, dropping empty chunks.
fn render_pairs(template: &str, ctx: &Value) -> Vec<(String, String)> {
    render(template, ctx)
        .split('&')
        .filter(|chunk| !chunk.is_empty())
        .map(|chunk| match chunk.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (chunk.to_string(), String::new()),
        })
        .collect()
}

/// Applies the response field-extraction map. HTTP status ≥ 400 forces
/// canonical `FAILED`; a vendor status present in `status_map` is remapped
/// and anything else passes through unchanged.
pub fn extract_outcome(
    map: &ResponseMap,
    data: &Value,
    http_status: u16,
    provider_id: &str,
    fallback_job_id: &str,
) -> ActionOutcome {
    let job_id_expr = map.job_id.as_deref().unwrap_or("id");
    let status_expr = map.status.as_deref().unwrap_or("status");

    let job_id = extract(data, job_id_expr)
        .map(value_string)
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| fallback_job_id.to_string());

    let status = if http_status >= 400 {
        "FAILED".to_string()
    } else {
        extract(data, status_expr)
            .map(value_string)
            .filter(|v| !v.is_empty())
            .map(|raw| map.status_map.get(&raw).cloned().unwrap_or(raw))
            .unwrap_or_else(|| "queued".to_string())
    };

    let error = map
        .error
        .as_deref()
        .and_then(|expr| extract(data, expr))
        .map(value_string)
        .filter(|v| !v.is_empty());

    ActionOutcome {
        provider_id: provider_id.to_string(),
        job_id,
        status,
        error,
    }
}

fn value_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::extract::State;
    use axum::http::HeaderMap;
    use axum::routing::{get, post};
    use serde_json::json;
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};

    fn response_map(json_map: Value) -> ResponseMap {
        serde_json::from_value(json_map).unwrap()
    }

    #[test]
    fn status_map_remaps_known_keys_and_passes_unknown() {
        let map = response_map(json!({
            "status": "state",
            "status_map": { "SENT": "SUCCESS", "BROKE": "FAILED" }
        }));
        let mapped = extract_outcome(&map, &json!({ "state": "SENT" }), 200, "p", "");
        assert_eq!(mapped.status, "SUCCESS");
        let passthrough = extract_outcome(&map, &json!({ "state": "WEIRD" }), 200, "p", "");
        assert_eq!(passthrough.status, "WEIRD");
    }

    #[test]
    fn http_4xx_forces_failed_regardless_of_body() {
        let map = response_map(json!({ "status": "state" }));
        let outcome = extract_outcome(&map, &json!({ "state": "SENT" }), 422, "p", "");
        assert_eq!(outcome.status, "FAILED");
    }

    #[test]
    fn missing_fields_fall_back() {
        let map = ResponseMap::default();
        let outcome = extract_outcome(&map, &json!({}), 200, "p", "sid-1");
        assert_eq!(outcome.job_id, "sid-1");
        assert_eq!(outcome.status, "queued");
        assert_eq!(outcome.error, None);
    }

    #[test]
    fn error_field_is_extracted() {
        let map = response_map(json!({ "error": "fault.message" }));
        let outcome = extract_outcome(
            &map,
            &json!({ "fault": { "message": "line busy" } }),
            200,
            "p",
            "",
        );
        assert_eq!(outcome.error.as_deref(), Some("line busy"));
    }

    fn manifest_for(addr: SocketAddr, extra: Value) -> ProviderManifest {
        let mut base = json!({
            "id": "acmefax",
            "name": "Acme Fax",
            "allowed_domains": ["127.0.0.1"],
            "timeout_ms": 5000,
            "actions": {
                "send_fax": {
                    "method": "POST",
                    "url": format!("http://{addr}/faxes"),
                    "body": { "kind": "json",
                              "template": "{\"to\":\"{{ to }}\",\"url\":\"{{ file_url }}\"}" },
                    "response": { "job_id": "id", "status": "status" }
                },
                "get_status": {
                    "method": "GET",
                    "url": format!("http://{addr}/faxes/{{fax}}"),
                    "path_params": [{ "name": "fax", "source": "provider_sid" }],
                    "response": { "job_id": "id", "status": "status",
                                  "status_map": { "done": "SUCCESS" } }
                }
            }
        });
        if let (Some(base_obj), Some(extra_obj)) = (base.as_object_mut(), extra.as_object()) {
            for (k, v) in extra_obj {
                base_obj.insert(k.clone(), v.clone());
            }
        }
        serde_json::from_value(base).unwrap()
    }

    type Seen = Arc<Mutex<Vec<(String, String)>>>;

    async fn spawn_vendor() -> (SocketAddr, Seen) {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new()
            .route(
                "/faxes",
                post(
                    |State(seen): State<Seen>, headers: HeaderMap, body: String| async move {
                        let auth = headers
                            .get("authorization")
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or("")
                            .to_string();
                        seen.lock().unwrap().push((auth, body));
                        axum::Json(json!({ "id": "abc", "status": "in_progress" }))
                    },
                ),
            )
            .route(
                "/faxes/{id}",
                get(|axum::extract::Path(id): axum::extract::Path<String>| async move {
                    axum::Json(json!({ "id": id, "status": "done" }))
                }),
            )
            .with_state(seen.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        (addr, seen)
    }

    #[tokio::test]
    async fn send_extracts_provider_id_and_status() {
        let (addr, seen) = spawn_vendor().await;
        let manifest = manifest_for(addr, json!({ "auth": { "scheme": "bearer" } }));
        let runtime =
            ManifestRuntime::new(manifest, json!({ "api_key": "sekrit" }), json!({}));
        let outcome = runtime
            .send(SendRequest {
                to: "+15551234567",
                file_url: Some("https://gw.test/fax/j1/pdf?token=t"),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(outcome.job_id, "abc");
        assert_eq!(outcome.status, "in_progress");
        let calls = seen.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "Bearer sekrit");
        assert!(calls[0].1.contains("+15551234567"));
    }

    #[tokio::test]
    async fn get_status_applies_remap() {
        let (addr, _seen) = spawn_vendor().await;
        let runtime = ManifestRuntime::new(manifest_for(addr, json!({})), json!({}), json!({}));
        let outcome = runtime.get_status(None, Some("abc")).await.unwrap();
        assert_eq!(outcome.job_id, "abc");
        assert_eq!(outcome.status, "SUCCESS");
    }

    #[tokio::test]
    async fn allowlist_violation_aborts_before_any_call() {
        let (addr, seen) = spawn_vendor().await;
        let mut manifest = manifest_for(addr, json!({}));
        manifest.allowed_domains = vec!["api.other.test".into()];
        let runtime = ManifestRuntime::new(manifest, json!({}), json!({}));
        let err = runtime
            .send(SendRequest { to: "+15551234567", ..Default::default() })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("allowlist"));
        assert!(!err.is_retryable());
        assert!(seen.lock().unwrap().is_empty());
    }
}
