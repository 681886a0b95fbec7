//! HTTP front end.
//!
//! `GET /device_data?mac_address=<addr>&adapter=<renogy_rover|jbd>[&alias=<name>]`
//! answers with the telemetry document, or `{"success": false, "error": ..}`.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::adapter::AdapterKind;
use crate::ble::DeviceTarget;
use crate::error::Error;
use crate::fetcher::Fetcher;

pub fn router(fetcher: Arc<Fetcher>) -> Router {
    Router::new()
        .route("/device_data", get(device_data))
        .route("/health", get(health))
        .with_state(fetcher)
}

#[derive(Debug, Deserialize)]
pub struct DeviceQuery {
    mac_address: Option<String>,
    adapter: Option<String>,
    alias: Option<String>,
}

async fn device_data(
    State(fetcher): State<Arc<Fetcher>>,
    Query(query): Query<DeviceQuery>,
) -> Response {
    let (Some(address), Some(adapter)) = (non_blank(query.mac_address), non_blank(query.adapter))
    else {
        return failure(
            StatusCode::BAD_REQUEST,
            "`mac_address` and `adapter` are required".to_string(),
        );
    };

    let kind = match adapter.parse::<AdapterKind>() {
        Ok(kind) => kind,
        Err(err) => return err.into_response(),
    };
    let mut target = DeviceTarget::new(address);
    if let Some(alias) = query.alias {
        target = target.with_alias(alias);
    }

    debug!(address = %target.address, adapter = %kind, "device_data");
    match fetcher.fetch(target, kind).await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn failure(status: StatusCode, error: String) -> Response {
    (status, Json(json!({ "success": false, "error": error }))).into_response()
}

impl Error {
    pub fn http_status(&self) -> StatusCode {
        match self {
            Error::UnsupportedAdapter(_) | Error::InvalidCommand(_) => StatusCode::BAD_REQUEST,
            Error::DeviceNotFound(_) => StatusCode::NOT_FOUND,
            Error::ConnectionTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        failure(self.http_status(), self.to_string())
    }
}
