//! Vendor callback receiver. Each route authenticates its caller (HMAC over
//! the raw body, HTTP Basic, or a shared-secret header), claims the event in
//! the idempotency ledger, normalizes vendor field synonyms, and applies the
//! result to job or inbound state. Responses stay success-shaped for unknown
//! jobs so vendors do not retry-storm us over records we cannot correlate.

use std::collections::BTreeMap;

use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::routing::post;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use metrics::counter;
use serde::Deserialize;
use serde_json::{Value, json};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::{Duration, OffsetDateTime};
use tracing::{info, warn};

use fax_core::store::JobUpdate;
use fax_core::{
    FaxError, InboundArtifact, JobStatus, new_record_id, storage::sha256_hex,
};

use crate::AppState;
use crate::http::ApiError;

const PLACEHOLDER_PDF: &[u8] = b"%PDF-1.4\n% placeholder inbound\n%%EOF";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/phaxio-callback", post(phaxio_callback))
        .route("/signalwire-callback", post(signalwire_callback))
        .route("/phaxio-inbound", post(phaxio_inbound))
        .route("/sinch-inbound", post(sinch_inbound))
        .route("/_internal/telephony/inbound", post(telephony_inbound))
}

/// Hex HMAC-SHA256 of the raw body compared in constant time.
fn verify_hmac(secret: &str, body: &[u8], provided: &str) -> bool {
    let mut mac = match Hmac::<Sha256>::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(body);
    let expected = hex::encode(mac.finalize().into_bytes());
    let provided = provided.trim().to_ascii_lowercase();
    expected.len() == provided.len()
        && bool::from(expected.as_bytes().ct_eq(provided.as_bytes()))
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Parses the callback payload as a flat string map: form-encoded bodies and
/// one-level JSON objects both normalize to the same shape.
fn parse_payload(headers: &HeaderMap, body: &[u8]) -> BTreeMap<String, String> {
    let content_type = header(headers, "content-type").unwrap_or("");
    if content_type.starts_with("application/json") {
        return json_to_map(body);
    }
    let mut map: BTreeMap<String, String> = url::form_urlencoded::parse(body)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if map.is_empty() {
        map = json_to_map(body);
    }
    map
}

fn json_to_map(body: &[u8]) -> BTreeMap<String, String> {
    let Ok(Value::Object(obj)) = serde_json::from_slice::<Value>(body) else {
        return BTreeMap::new();
    };
    obj.into_iter()
        .filter_map(|(k, v)| {
            let value = match v {
                Value::String(s) => s,
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => return None,
            };
            Some((k, value))
        })
        .collect()
}

/// Vendor payloads disagree on field names; take the first synonym present.
fn first_of(map: &BTreeMap<String, String>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| map.get(*k))
        .filter(|v| !v.is_empty())
        .cloned()
}

#[derive(Debug, Deserialize)]
struct JobIdQuery {
    job_id: Option<String>,
}

async fn phaxio_callback(
    State(state): State<AppState>,
    Query(query): Query<JobIdQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    if state.config.phaxio.verify_signature {
        let provided = header(&headers, "x-phaxio-signature")
            .or_else(|| header(&headers, "x-phaxio-signature-sha256"))
            .ok_or_else(|| FaxError::Auth("missing signature".into()))?;
        let secret = &state.config.phaxio.api_secret;
        if secret.is_empty() || !verify_hmac(secret, &body, provided) {
            return Err(FaxError::Auth("invalid signature".into()).into());
        }
    }

    let payload = parse_payload(&headers, &body);
    let Some(job_id) = query.job_id else {
        return Ok(Json(json!({ "status": "no job_id provided" })));
    };

    let status_word = first_of(&payload, &["fax[status]", "status"]).or_else(|| {
        first_of(&payload, &["success"]).map(|ok| {
            if ok == "true" { "SUCCESS".into() } else { "FAILED".into() }
        })
    });
    let status = status_word
        .as_deref()
        .map(JobStatus::from_provider)
        .unwrap_or(JobStatus::InProgress);
    let pages = first_of(&payload, &["fax[num_pages]", "num_pages", "pages"])
        .and_then(|p| p.parse().ok());
    let error = first_of(&payload, &["fax[error_message]", "error_message", "message"]);

    apply_callback_update(&state, &job_id, status, pages, error.as_deref(), "phaxio")?;
    Ok(Json(json!({ "status": "ok" })))
}

async fn signalwire_callback(
    State(state): State<AppState>,
    Query(query): Query<JobIdQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    if let Some(key) = state.config.signalwire.signing_key.as_deref() {
        let provided = header(&headers, "x-signalwire-signature").unwrap_or("");
        if !verify_hmac(key, &body, provided) {
            return Err(FaxError::Auth("invalid signature".into()).into());
        }
    }

    let payload = parse_payload(&headers, &body);
    let provider_sid = first_of(&payload, &["FaxSid", "Sid", "sid"]);
    let status = first_of(&payload, &["FaxStatus", "Status", "status"])
        .as_deref()
        .map(JobStatus::from_provider)
        .unwrap_or(JobStatus::InProgress);
    let pages = first_of(&payload, &["NumPages", "num_pages"]).and_then(|p| p.parse().ok());

    // Correlate by our job id when the callback URL carried one, else by the
    // vendor sid.
    let job_id = match query.job_id {
        Some(id) => Some(id),
        None => match provider_sid.as_deref() {
            Some(sid) => state.store.find_job_by_provider_sid(sid)?.map(|j| j.id),
            None => None,
        },
    };
    let Some(job_id) = job_id else {
        return Ok(Json(json!({ "ok": true })));
    };

    apply_callback_update(&state, &job_id, status, pages, None, "signalwire")?;
    Ok(Json(json!({ "ok": true })))
}

fn apply_callback_update(
    state: &AppState,
    job_id: &str,
    status: JobStatus,
    pages: Option<u32>,
    error: Option<&str>,
    vendor: &str,
) -> Result<(), FaxError> {
    let mut update = JobUpdate::automated(job_id, status);
    if let Some(pages) = pages {
        update = update.with_pages(pages);
    }
    // Vendors attach diagnostic detail to non-terminal updates too; keep it
    // whenever present. The store sanitizes before persisting.
    if let Some(error) = error {
        update = update.with_error(error);
    }
    match state.store.apply_status(&update)? {
        true => {
            counter!("fax_callbacks_applied_total").increment(1);
            info!(job_id, vendor, status = status.as_str(), "callback applied");
        }
        false => {
            info!(job_id, vendor, "callback ignored for unknown or terminal job");
        }
    }
    Ok(())
}

/// Gate shared by the inbound routes: inbound must be enabled, and when an
/// explicit inbound backend is configured the route must match it.
fn inbound_gate(state: &AppState, route_backend: &str) -> Result<(), FaxError> {
    if !state.config.inbound_enabled {
        return Err(FaxError::NotFound("inbound not enabled".into()));
    }
    if state.config.inbound_backend.is_some()
        && state.registry.active_inbound() != route_backend
    {
        warn!(route_backend, "inbound route not active for current backend");
        return Err(FaxError::NotFound(
            "inbound route not active for current backend".into(),
        ));
    }
    Ok(())
}

struct InboundEvent {
    provider_sid: String,
    from_number: Option<String>,
    to_number: Option<String>,
    status: String,
    pages: Option<u32>,
    file_url: Option<String>,
}

async fn phaxio_inbound(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    inbound_gate(&state, "phaxio")?;
    if state.config.phaxio.inbound_verify_signature {
        let provided = header(&headers, "x-phaxio-signature")
            .or_else(|| header(&headers, "x-phaxio-signature-sha256"))
            .ok_or_else(|| FaxError::Auth("missing signature".into()))?;
        let secret = &state.config.phaxio.api_secret;
        if secret.is_empty() || !verify_hmac(secret, &body, provided) {
            return Err(FaxError::Auth("invalid signature".into()).into());
        }
    }

    let payload = parse_payload(&headers, &body);
    let Some(provider_sid) = first_of(&payload, &["fax[id]", "id", "fax_id", "faxId"]) else {
        return Ok(Json(json!({ "status": "ignored" })));
    };
    let event = InboundEvent {
        provider_sid,
        from_number: first_of(&payload, &["fax[from]", "from", "from_number"]),
        to_number: first_of(&payload, &["fax[to]", "to", "to_number"]),
        status: first_of(&payload, &["fax[status]", "status"]).unwrap_or_else(|| "received".into()),
        pages: first_of(&payload, &["fax[num_pages]", "num_pages", "pages"])
            .and_then(|p| p.parse().ok()),
        file_url: first_of(&payload, &["file_url", "media_url", "pdf_url"]),
    };

    if !state
        .store
        .claim_event(&event.provider_sid, "phaxio-inbound")?
    {
        return Ok(Json(json!({ "status": "ok" })));
    }

    let pdf_bytes = fetch_inbound_pdf(&state, event.file_url.as_deref(), true).await;
    persist_inbound(&state, "phaxio", event, pdf_bytes)?;
    Ok(Json(json!({ "status": "ok" })))
}

async fn sinch_inbound(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    inbound_gate(&state, "sinch")?;
    let sinch = &state.config.sinch;
    if let Some(user) = sinch.inbound_basic_user.as_deref() {
        let pass = sinch.inbound_basic_pass.as_deref().unwrap_or("");
        if !verify_basic(&headers, user, pass) {
            return Err(FaxError::Auth("invalid basic auth".into()).into());
        }
    }
    if let Some(secret) = sinch.inbound_hmac_secret.as_deref() {
        let provided = header(&headers, "x-sinch-signature").unwrap_or("");
        if !verify_hmac(secret, &body, provided) {
            return Err(FaxError::Auth("invalid signature".into()).into());
        }
    }

    let payload = parse_payload(&headers, &body);
    let Some(provider_sid) = first_of(&payload, &["id", "fax_id", "faxId"]) else {
        return Ok(Json(json!({ "status": "ignored" })));
    };
    let event = InboundEvent {
        provider_sid,
        from_number: first_of(&payload, &["from", "from_number"]),
        to_number: first_of(&payload, &["to", "to_number"]),
        status: first_of(&payload, &["status"]).unwrap_or_else(|| "received".into()),
        pages: first_of(&payload, &["num_pages", "pages"]).and_then(|p| p.parse().ok()),
        file_url: first_of(&payload, &["file_url", "media_url"]),
    };

    if !state
        .store
        .claim_event(&event.provider_sid, "sinch-inbound")?
    {
        return Ok(Json(json!({ "status": "ok" })));
    }

    let pdf_bytes = fetch_inbound_pdf(&state, event.file_url.as_deref(), false).await;
    persist_inbound(&state, "sinch", event, pdf_bytes)?;
    Ok(Json(json!({ "status": "ok" })))
}

fn verify_basic(headers: &HeaderMap, user: &str, pass: &str) -> bool {
    let Some(value) = header(headers, "authorization") else {
        return false;
    };
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = BASE64.decode(encoded.trim()) else {
        return false;
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return false;
    };
    let expected = format!("{user}:{pass}");
    expected.len() == decoded.len()
        && bool::from(expected.as_bytes().ct_eq(decoded.as_bytes()))
}

/// Best-effort artifact fetch; failures degrade to the placeholder so the
/// record always exists.
async fn fetch_inbound_pdf(
    state: &AppState,
    file_url: Option<&str>,
    with_phaxio_auth: bool,
) -> Option<Vec<u8>> {
    let url = file_url?;
    let mut request = state.http.get(url);
    if with_phaxio_auth && state.config.phaxio.is_configured() {
        request = request.basic_auth(
            &state.config.phaxio.api_key,
            Some(&state.config.phaxio.api_secret),
        );
    }
    match request.send().await {
        Ok(response) if response.status().is_success() => {
            response.bytes().await.ok().map(|b| b.to_vec())
        }
        Ok(response) => {
            warn!(status = response.status().as_u16(), "inbound artifact fetch rejected");
            None
        }
        Err(err) => {
            warn!(error = %err, "inbound artifact fetch failed");
            None
        }
    }
}

fn persist_inbound(
    state: &AppState,
    backend: &str,
    event: InboundEvent,
    pdf_bytes: Option<Vec<u8>>,
) -> Result<InboundArtifact, FaxError> {
    let bytes = pdf_bytes.unwrap_or_else(|| PLACEHOLDER_PDF.to_vec());
    let id = new_record_id();
    std::fs::create_dir_all(&state.config.data_dir)?;
    let local_path = state.config.data_dir.join(format!("{id}.pdf"));
    std::fs::write(&local_path, &bytes)?;
    let stored_uri = state.artifacts.put(&local_path, &format!("{id}.pdf"))?;

    let issued = state.inbound_tokens.issue();
    let now = OffsetDateTime::now_utc();
    let retention_days = state.config.inbound_retention_days;
    let retention_until = (retention_days > 0).then(|| now + Duration::days(retention_days));

    let artifact = InboundArtifact {
        id: id.clone(),
        from_number: event.from_number,
        to_number: event.to_number,
        status: event.status,
        backend: backend.to_string(),
        provider_sid: Some(event.provider_sid),
        pages: event.pages,
        size_bytes: Some(bytes.len() as u64),
        sha256: Some(sha256_hex(&bytes)),
        pdf_uri: Some(stored_uri),
        retention_until,
        pdf_token: Some(issued.token),
        pdf_token_expires_at: Some(issued.expires_at),
        created_at: now,
        updated_at: now,
    };
    state.store.insert_inbound(&artifact)?;
    counter!("fax_inbound_received_total").increment(1);
    info!(inbound_id = %id, backend, "inbound fax recorded");
    Ok(artifact)
}

#[derive(Debug, Deserialize)]
struct TelephonyInboundPayload {
    tiff_path: String,
    #[serde(default)]
    to_number: Option<String>,
    #[serde(default)]
    from_number: Option<String>,
    #[serde(default)]
    faxstatus: Option<String>,
    #[serde(default)]
    faxpages: Option<u32>,
    #[serde(default)]
    uniqueid: Option<String>,
}

/// Private-network ingestion route called from the dialplan after a receive.
async fn telephony_inbound(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<TelephonyInboundPayload>,
) -> Result<Json<Value>, ApiError> {
    inbound_gate(&state, "telephony")?;
    let Some(secret) = state.config.telephony.internal_secret.as_deref() else {
        return Err(FaxError::Auth("internal secret not configured".into()).into());
    };
    let provided = header(&headers, "x-internal-secret").unwrap_or("");
    let matches = secret.len() == provided.len()
        && bool::from(secret.as_bytes().ct_eq(provided.as_bytes()));
    if !matches {
        return Err(FaxError::Auth("invalid internal secret".into()).into());
    }

    let tiff = std::path::Path::new(&payload.tiff_path);
    if payload.tiff_path.is_empty() || !tiff.is_file() {
        return Err(FaxError::Validation("tiff path invalid".into()).into());
    }

    let id = new_record_id();
    std::fs::create_dir_all(&state.config.data_dir).map_err(FaxError::from)?;
    let pdf_path = state.config.data_dir.join(format!("{id}.pdf"));
    let rendered_pages = state.renderer.tiff_to_pdf(tiff, &pdf_path)?;
    let bytes = std::fs::read(&pdf_path).map_err(FaxError::from)?;
    let stored_uri = state.artifacts.put(&pdf_path, &format!("{id}.pdf"))?;

    let issued = state.inbound_tokens.issue();
    let now = OffsetDateTime::now_utc();
    let retention_days = state.config.inbound_retention_days;
    let retention_until = (retention_days > 0).then(|| now + Duration::days(retention_days));

    let artifact = InboundArtifact {
        id: id.clone(),
        from_number: payload.from_number.filter(|v| !v.is_empty()),
        to_number: payload.to_number.filter(|v| !v.is_empty()),
        status: payload
            .faxstatus
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "received".into()),
        backend: "telephony".into(),
        provider_sid: payload.uniqueid.filter(|v| !v.is_empty()),
        pages: payload.faxpages.or(Some(rendered_pages)),
        size_bytes: Some(bytes.len() as u64),
        sha256: Some(sha256_hex(&bytes)),
        pdf_uri: Some(stored_uri),
        retention_until,
        pdf_token: Some(issued.token),
        pdf_token_expires_at: Some(issued.expires_at),
        created_at: now,
        updated_at: now,
    };
    state.store.insert_inbound(&artifact)?;
    counter!("fax_inbound_received_total").increment(1);
    info!(inbound_id = %id, backend = "telephony", "inbound fax recorded");
    Ok(Json(json!({ "id": id, "status": "ok" })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hmac_verification_matches_hex_digest() {
        let body = b"fax[id]=123&fax[status]=success";
        let mut mac = Hmac::<Sha256>::new_from_slice(b"secret").unwrap();
        mac.update(body);
        let digest = hex::encode(mac.finalize().into_bytes());
        assert!(verify_hmac("secret", body, &digest));
        assert!(verify_hmac("secret", body, &digest.to_uppercase()));
        assert!(!verify_hmac("secret", body, "deadbeef"));
        assert!(!verify_hmac("other", body, &digest));
    }

    #[test]
    fn payload_parsing_handles_form_and_json() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "application/x-www-form-urlencoded".parse().unwrap());
        let form = parse_payload(&headers, b"fax%5Bid%5D=99&fax%5Bstatus%5D=success");
        assert_eq!(form.get("fax[id]").map(String::as_str), Some("99"));

        let mut headers = HeaderMap::new();
        headers.insert("content-type", "application/json".parse().unwrap());
        let json = parse_payload(&headers, br#"{"id": 42, "status": "received"}"#);
        assert_eq!(json.get("id").map(String::as_str), Some("42"));
    }

    #[test]
    fn synonym_lookup_takes_first_present() {
        let mut map = BTreeMap::new();
        map.insert("fax_id".to_string(), "b".to_string());
        map.insert("id".to_string(), "a".to_string());
        assert_eq!(
            first_of(&map, &["fax[id]", "id", "fax_id"]).as_deref(),
            Some("a")
        );
        assert_eq!(first_of(&map, &["missing"]), None);
    }

    #[test]
    fn basic_auth_verification() {
        let mut headers = HeaderMap::new();
        let encoded = BASE64.encode("user:pass");
        headers.insert(
            "authorization",
            format!("Basic {encoded}").parse().unwrap(),
        );
        assert!(verify_basic(&headers, "user", "pass"));
        assert!(!verify_basic(&headers, "user", "wrong"));
    }
}
