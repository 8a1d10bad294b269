//! Caller-facing HTTP surface: job submission, status, tokenized artifact
//! fetch, inbound listing, and health. Vendor callback routes live in
//! `callbacks` and are merged in unauthenticated; vendors prove themselves
//! with signatures, not API keys.

use axum::Json;
use axum::Router;
use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::json;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;
use tracing::info;

use fax_core::{FaxError, InboundArtifact, OutboundJob, mask_phone, new_record_id};
use fax_provider_registry::Direction;
use fax_tokens::TokenError;

use crate::AppState;
use crate::callbacks;

pub fn build_router(state: AppState) -> Router {
    let body_limit = state.config.max_file_size_bytes() as usize + 64 * 1024;
    let protected = Router::new()
        .route("/fax", post(send_fax))
        .route("/fax/{id}", get(get_fax))
        .route("/fax/{id}/refresh", post(refresh_fax))
        .route("/inbound", get(list_inbound))
        .route("/inbound/{id}", get(get_inbound))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ))
        .layer(DefaultBodyLimit::max(body_limit));
    let open = Router::new()
        .route("/fax/{id}/pdf", get(serve_job_pdf))
        .route("/inbound/{id}/pdf", get(serve_inbound_pdf))
        .route("/health", get(health))
        .route("/health/ready", get(ready));
    protected
        .merge(open)
        .merge(callbacks::router())
        .with_state(state)
}

/// Error envelope at the API boundary. Each taxonomy variant owns exactly one
/// status code.
pub struct ApiError(pub FaxError);

impl From<FaxError> for ApiError {
    fn from(err: FaxError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            FaxError::Validation(_) => StatusCode::BAD_REQUEST,
            FaxError::Auth(_) => StatusCode::UNAUTHORIZED,
            FaxError::Forbidden(_) => StatusCode::FORBIDDEN,
            FaxError::NotFound(_) => StatusCode::NOT_FOUND,
            FaxError::Provider(_) => StatusCode::BAD_GATEWAY,
            FaxError::Config(_) | FaxError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let detail = match &self.0 {
            // Internal details stay out of responses.
            FaxError::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        };
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

async fn require_api_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Result<Response, ApiError> {
    if let Some(expected) = state.config.api_key.as_deref() {
        let provided = headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let matches = expected.len() == provided.len()
            && bool::from(expected.as_bytes().ct_eq(provided.as_bytes()));
        if !matches {
            return Err(FaxError::Auth("invalid or missing API key".into()).into());
        }
    }
    Ok(next.run(request).await)
}

/// Serialized job shape. Destination numbers are masked on every read path.
#[derive(Debug, Serialize)]
pub struct JobView {
    pub id: String,
    pub to: String,
    pub status: String,
    pub backend: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_sid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pages: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl From<&OutboundJob> for JobView {
    fn from(job: &OutboundJob) -> Self {
        Self {
            id: job.id.clone(),
            to: mask_phone(&job.to_number),
            status: job.status.as_str().to_string(),
            backend: job.backend.clone(),
            provider_sid: job.provider_sid.clone(),
            pages: job.pages,
            error: job.error.clone(),
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct InboundView {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    pub status: String,
    pub backend: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pages: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retention_until: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl From<&InboundArtifact> for InboundView {
    fn from(artifact: &InboundArtifact) -> Self {
        Self {
            id: artifact.id.clone(),
            from: artifact.from_number.as_deref().map(mask_phone),
            to: artifact.to_number.as_deref().map(mask_phone),
            status: artifact.status.clone(),
            backend: artifact.backend.clone(),
            pages: artifact.pages,
            size_bytes: artifact.size_bytes,
            sha256: artifact.sha256.clone(),
            retention_until: artifact.retention_until,
            created_at: artifact.created_at,
        }
    }
}

/// Accepts destinations as E.164 or bare digits, tolerating common
/// separator characters.
fn validate_destination(raw: &str) -> Result<String, FaxError> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '(' | ')' | '.'))
        .collect();
    let digits = cleaned.strip_prefix('+').unwrap_or(&cleaned);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(FaxError::Validation("destination must be a fax number".into()));
    }
    if !(6..=20).contains(&digits.len()) {
        return Err(FaxError::Validation(
            "destination number length out of range".into(),
        ));
    }
    Ok(cleaned)
}

enum UploadKind {
    Pdf,
    Txt,
}

/// Contents decide the type: a PDF magic header wins, everything else must be
/// plain UTF-8 text with a `.txt` name.
fn sniff_upload(filename: &str, bytes: &[u8]) -> Result<UploadKind, FaxError> {
    if bytes.starts_with(b"%PDF-") {
        return Ok(UploadKind::Pdf);
    }
    if filename.to_ascii_lowercase().ends_with(".txt") && std::str::from_utf8(bytes).is_ok() {
        return Ok(UploadKind::Txt);
    }
    Err(FaxError::Validation(
        "only PDF and plain-text uploads are accepted".into(),
    ))
}

async fn send_fax(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<JobView>), ApiError> {
    let mut to = None;
    let mut file: Option<(String, Vec<u8>)> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| FaxError::Validation(err.to_string()))?
    {
        match field.name() {
            Some("to") => {
                let value = field
                    .text()
                    .await
                    .map_err(|err| FaxError::Validation(err.to_string()))?;
                to = Some(value);
            }
            Some("file") => {
                let name = field.file_name().unwrap_or("upload").to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|err| FaxError::Validation(err.to_string()))?;
                file = Some((name, bytes.to_vec()));
            }
            _ => {}
        }
    }

    let to = validate_destination(
        to.as_deref()
            .ok_or_else(|| FaxError::Validation("missing 'to' field".into()))?,
    )?;
    let (filename, bytes) =
        file.ok_or_else(|| FaxError::Validation("missing 'file' field".into()))?;
    if bytes.len() as u64 > state.config.max_file_size_bytes() {
        return Err(FaxError::Validation(format!(
            "file exceeds {} MB limit",
            state.config.max_file_size_mb
        ))
        .into());
    }
    let kind = sniff_upload(&filename, &bytes)?;

    let job_id = new_record_id();
    let data_dir = &state.config.data_dir;
    std::fs::create_dir_all(data_dir).map_err(FaxError::from)?;
    let pdf_path = data_dir.join(format!("{job_id}.pdf"));
    let original_path = match kind {
        UploadKind::Pdf => {
            std::fs::write(&pdf_path, &bytes).map_err(FaxError::from)?;
            pdf_path.clone()
        }
        UploadKind::Txt => {
            let txt_path = data_dir.join(format!("{job_id}.txt"));
            std::fs::write(&txt_path, &bytes).map_err(FaxError::from)?;
            state.renderer.txt_to_pdf(&txt_path, &pdf_path)?;
            txt_path
        }
    };

    let backend = state.registry.active_outbound();
    let job = OutboundJob::new(
        job_id.clone(),
        to,
        original_path.to_string_lossy().into_owned(),
        pdf_path.to_string_lossy().into_owned(),
        backend,
    );
    state.store.insert_job(&job)?;
    counter!("fax_jobs_accepted_total").increment(1);
    info!(job_id, backend = %job.backend, "fax job accepted");

    state.dispatcher().spawn(job_id);
    Ok((StatusCode::ACCEPTED, Json(JobView::from(&job))))
}

async fn get_fax(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobView>, ApiError> {
    let job = state
        .store
        .get_job(&id)?
        .ok_or_else(|| FaxError::NotFound(format!("job {id}")))?;
    Ok(Json(JobView::from(&job)))
}

async fn refresh_fax(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobView>, ApiError> {
    let job = state.dispatcher().refresh(&id).await?;
    Ok(Json(JobView::from(&job)))
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

fn check_token(
    service: &fax_tokens::TokenService,
    stored: Option<(&str, Option<OffsetDateTime>)>,
    provided: Option<&str>,
) -> Result<(), FaxError> {
    match service.validate(stored, provided.unwrap_or("")) {
        Ok(()) => Ok(()),
        Err(TokenError::NotIssued) => Err(FaxError::NotFound("no artifact token issued".into())),
        Err(TokenError::Forbidden) => Err(FaxError::Forbidden("invalid or expired token".into())),
    }
}

fn pdf_response(bytes: Vec<u8>, filename: &str) -> Response {
    (
        [
            (header::CONTENT_TYPE, "application/pdf".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("inline; filename=\"{filename}\""),
            ),
            (header::CACHE_CONTROL, "no-cache, no-store, must-revalidate".to_string()),
        ],
        bytes,
    )
        .into_response()
}

async fn serve_job_pdf(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<TokenQuery>,
) -> Result<Response, ApiError> {
    let job = state
        .store
        .get_job(&id)?
        .ok_or_else(|| FaxError::NotFound(format!("job {id}")))?;
    check_token(
        &state.job_tokens,
        job.pdf_token
            .as_deref()
            .map(|t| (t, job.pdf_token_expires_at)),
        query.token.as_deref(),
    )?;
    let bytes =
        std::fs::read(&job.pdf_path).map_err(|_| FaxError::NotFound("artifact missing".into()))?;
    info!(job_id = %id, "outbound artifact served");
    Ok(pdf_response(bytes, &format!("fax_{id}.pdf")))
}

async fn serve_inbound_pdf(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<TokenQuery>,
) -> Result<Response, ApiError> {
    let artifact = state
        .store
        .get_inbound(&id)?
        .ok_or_else(|| FaxError::NotFound(format!("inbound {id}")))?;
    check_token(
        &state.inbound_tokens,
        artifact
            .pdf_token
            .as_deref()
            .map(|t| (t, artifact.pdf_token_expires_at)),
        query.token.as_deref(),
    )?;
    let uri = artifact
        .pdf_uri
        .as_deref()
        .ok_or_else(|| FaxError::NotFound("artifact missing".into()))?;
    let bytes = state.artifacts.get(uri)?;
    info!(inbound_id = %id, "inbound artifact served");
    Ok(pdf_response(bytes, &format!("inbound_{id}.pdf")))
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    #[serde(default)]
    limit: Option<u32>,
    #[serde(default)]
    offset: Option<u32>,
}

async fn list_inbound(
    State(state): State<AppState>,
    Query(page): Query<PageQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !state.config.inbound_enabled {
        return Err(FaxError::NotFound("inbound not enabled".into()).into());
    }
    let limit = page.limit.unwrap_or(50).min(200);
    let offset = page.offset.unwrap_or(0);
    let items: Vec<InboundView> = state
        .store
        .list_inbound(limit, offset)?
        .iter()
        .map(InboundView::from)
        .collect();
    let total = state.store.count_inbound()?;
    Ok(Json(json!({ "items": items, "total": total })))
}

async fn get_inbound(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<InboundView>, ApiError> {
    if !state.config.inbound_enabled {
        return Err(FaxError::NotFound("inbound not enabled".into()).into());
    }
    let artifact = state
        .store
        .get_inbound(&id)?
        .ok_or_else(|| FaxError::NotFound(format!("inbound {id}")))?;
    Ok(Json(InboundView::from(&artifact)))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// Readiness includes trait-driven checks: a telephony-backed deployment is
/// not ready until the manager socket is reachable.
async fn ready(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    state.store.count_inbound()?;
    let outbound = state.registry.active_outbound();
    let schema_issues = state.registry.schema_issues();

    let mut telephony_ok = true;
    if state
        .registry
        .has_trait(Direction::Any, "requires_legacy_telephony")
        || outbound == "telephony"
    {
        let t = &state.config.telephony;
        telephony_ok = state.ami.is_connected()
            || fax_ami::probe(&t.ami_host, t.ami_port, &t.ami_username, &t.ami_password).await;
    }

    let body = json!({
        "status": if telephony_ok { "ok" } else { "degraded" },
        "backend": outbound,
        "inbound_backend": state.registry.active_inbound(),
        "disabled": state.config.disabled,
        "telephony_ok": telephony_ok,
        "trait_schema_issues": schema_issues,
    });
    Ok(Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_validation_accepts_e164_and_digits() {
        assert_eq!(validate_destination("+1 555 123-4567").unwrap(), "+15551234567");
        assert_eq!(validate_destination("5551234567").unwrap(), "5551234567");
        assert!(validate_destination("fax-me").is_err());
        assert!(validate_destination("+12").is_err());
    }

    #[test]
    fn upload_sniffing_is_content_first() {
        assert!(matches!(
            sniff_upload("whatever.bin", b"%PDF-1.7 data").unwrap(),
            UploadKind::Pdf
        ));
        assert!(matches!(
            sniff_upload("note.txt", b"hello fax").unwrap(),
            UploadKind::Txt
        ));
        assert!(sniff_upload("note.docx", b"PK\x03\x04").is_err());
        assert!(sniff_upload("note.txt", &[0xff, 0xfe, 0x00]).is_err());
    }
}
