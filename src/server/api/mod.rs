// src/server/api/mod.rs

//! The HTTP/JSON API surface, covered only to the extent it carries semantics the
//! core depends on (§6).

pub mod members;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::core::errors::ErrorKind;
use crate::core::ClusterError;

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

/// Maps a `ClusterError` onto an HTTP response per §7's error taxonomy and §6's
/// not-leader redirect contract.
impl IntoResponse for ClusterError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.to_string(),
        });
        match self.kind() {
            ErrorKind::Validation => (StatusCode::BAD_REQUEST, body).into_response(),
            ErrorKind::Precondition => (StatusCode::PRECONDITION_FAILED, body).into_response(),
            ErrorKind::NotFound => (StatusCode::NOT_FOUND, body).into_response(),
            ErrorKind::NotClustered => (StatusCode::BAD_REQUEST, body).into_response(),
            ErrorKind::Conflict => (StatusCode::CONFLICT, body).into_response(),
            ErrorKind::Transient => (StatusCode::SERVICE_UNAVAILABLE, body).into_response(),
            ErrorKind::Fatal => (StatusCode::INTERNAL_SERVER_ERROR, body).into_response(),
            ErrorKind::NotLeader => {
                if let ClusterError::NotLeader { leader_addr } = &self {
                    let mut response = (StatusCode::TEMPORARY_REDIRECT, body).into_response();
                    if let Ok(value) = axum::http::HeaderValue::from_str(leader_addr) {
                        response.headers_mut().insert(axum::http::header::LOCATION, value);
                    }
                    response
                } else {
                    (StatusCode::INTERNAL_SERVER_ERROR, body).into_response()
                }
            }
        }
    }
}
