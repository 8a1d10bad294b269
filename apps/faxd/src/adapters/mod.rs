//! Backend send adapters. Each built-in vendor gets a thin adapter over its
//! HTTP API; manifest-declared providers share one adapter around the
//! interpreter; the telephony backend rides the AMI client.

pub mod manifest;
pub mod phaxio;
pub mod signalwire;
pub mod sinch;
pub mod telephony;

use std::sync::Arc;

use reqwest::StatusCode;
use serde_json::Value;

use fax_core::{FaxError, ProviderError};

use crate::AppState;
use crate::dispatch::{BackendKind, SendAdapter};

pub fn build(kind: BackendKind, state: &AppState) -> Result<Arc<dyn SendAdapter>, FaxError> {
    match kind {
        BackendKind::Phaxio => Ok(Arc::new(phaxio::PhaxioAdapter::from_state(state)?)),
        BackendKind::Sinch => Ok(Arc::new(sinch::SinchAdapter::from_state(state)?)),
        BackendKind::SignalWire => Ok(Arc::new(signalwire::SignalWireAdapter::from_state(state)?)),
        BackendKind::Telephony => Ok(Arc::new(telephony::TelephonyAdapter::from_state(state))),
        BackendKind::Manifest(id) => {
            Ok(Arc::new(manifest::ManifestProviderAdapter::load(&id, state)?))
        }
    }
}

pub(crate) fn transport(err: reqwest::Error) -> ProviderError {
    ProviderError::transport(err.to_string())
}

/// Non-2xx vendor response → error with the retry class the status implies.
pub(crate) fn vendor_error(status: StatusCode, detail: &str) -> ProviderError {
    let message = format!("vendor returned {}: {detail}", status.as_u16());
    if status.is_client_error() {
        ProviderError::application(message)
    } else {
        ProviderError::transport(message)
    }
}

/// Reads the response body as JSON, tolerating non-JSON error pages.
pub(crate) async fn read_json(
    response: reqwest::Response,
) -> Result<(StatusCode, Value), ProviderError> {
    let status = response.status();
    let text = response.text().await.map_err(transport)?;
    let body = serde_json::from_str(&text).unwrap_or(Value::Null);
    Ok((status, body))
}

pub(crate) fn json_str(value: &Value, path: &[&str]) -> Option<String> {
    let mut current = value;
    for key in path {
        current = current.get(key)?;
    }
    match current {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
