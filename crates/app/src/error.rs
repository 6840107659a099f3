//! Service error taxonomy and HTTP mapping.
//!
//! Only input-validation and missing-capability failures surface to
//! callers; transient source/engine faults are absorbed inside the
//! pipeline and show up as degraded output instead.

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("no frame source reachable")]
    SourceUnavailable,
    #[error("source read failed: {0}")]
    ReadFailure(String),
    #[error("input is not decodable: {0}")]
    DecodeFailure(String),
    #[error("inference failed: {0}")]
    EngineFailure(String),
    #[error("session negotiation failed: {0}")]
    SessionNegotiation(String),
    #[error("resource cleanup failed: {0}")]
    ResourceCleanup(String),
    #[error("{0} support is not built into this binary")]
    CapabilityUnavailable(&'static str),
    #[error("artifact path rejected: {0}")]
    ArtifactPathRejected(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ServiceError {
    fn status(&self) -> StatusCode {
        match self {
            ServiceError::SourceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::DecodeFailure(_) | ServiceError::SessionNegotiation(_) => {
                StatusCode::BAD_REQUEST
            }
            ServiceError::ArtifactPathRejected(_) => StatusCode::FORBIDDEN,
            ServiceError::CapabilityUnavailable(_) => StatusCode::NOT_IMPLEMENTED,
            ServiceError::ReadFailure(_)
            | ServiceError::EngineFailure(_)
            | ServiceError::ResourceCleanup(_)
            | ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl ResponseError for ServiceError {
    fn status_code(&self) -> StatusCode {
        self.status()
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status()).json(json!({ "detail": self.to_string() }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(
            ServiceError::SourceUnavailable.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ServiceError::DecodeFailure("bad jpeg".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ServiceError::CapabilityUnavailable("webrtc").status(),
            StatusCode::NOT_IMPLEMENTED
        );
        assert_eq!(
            ServiceError::ArtifactPathRejected("outside sandbox".into()).status(),
            StatusCode::FORBIDDEN
        );
    }
}
