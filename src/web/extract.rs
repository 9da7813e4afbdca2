use crate::web::error::ApiError;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use uuid::Uuid;

/// Header carrying a per-request cycle override (admin preview of staged data).
pub const CYCLE_ID_HEADER: &str = "x-cycle-id";

/// Optional `X-Cycle-Id` override. A present but malformed value is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CycleOverride(pub Option<Uuid>);

impl<S: Send + Sync> FromRequestParts<S> for CycleOverride {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let Some(value) = parts.headers.get(CYCLE_ID_HEADER) else {
            return Ok(Self(None));
        };

        let raw = value
            .to_str()
            .map_err(|_| ApiError::bad_request("X-Cycle-Id must be ASCII"))?
            .trim();
        if raw.is_empty() {
            return Ok(Self(None));
        }

        Uuid::parse_str(raw)
            .map(|id| Self(Some(id)))
            .map_err(|_| ApiError::bad_request(format!("X-Cycle-Id is not a valid UUID: {raw}")))
    }
}
