use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Domain error taxonomy for the HTTP surface.
///
/// Conflicts carry enough structure for the caller to act without re-querying:
/// a claim conflict names the current holder, a policy conflict names the
/// version that superseded the caller's base.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("authentication required")]
    Unauthenticated,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("workspace is deleted")]
    WorkspaceGone,

    #[error("bead {bead_id} is already claimed by {holder_alias}")]
    ClaimConflict {
        bead_id: String,
        held_by: String,
        holder_alias: String,
    },

    #[error("policy base version is stale (current is v{current_version})")]
    PolicyConflict {
        current_policy_id: String,
        current_version: i64,
    },

    #[error("escalation is already {status}")]
    EscalationClosed { status: String },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("rate limit exceeded")]
    RateLimited { retry_after_seconds: u64 },

    #[error("service temporarily unavailable")]
    Unavailable,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn validation(msg: impl Into<String>) -> Self {
        ApiError::Validation(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        ApiError::Forbidden(msg.into())
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::WorkspaceGone => StatusCode::GONE,
            ApiError::ClaimConflict { .. }
            | ApiError::PolicyConflict { .. }
            | ApiError::EscalationClosed { .. } => StatusCode::CONFLICT,
            ApiError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::Unauthenticated => "unauthenticated",
            ApiError::Forbidden(_) => "forbidden",
            ApiError::NotFound(_) => "not_found",
            ApiError::WorkspaceGone => "workspace_deleted",
            ApiError::ClaimConflict { .. } => "claim_conflict",
            ApiError::PolicyConflict { .. } => "policy_conflict",
            ApiError::EscalationClosed { .. } => "escalation_closed",
            ApiError::Validation(_) => "validation_error",
            ApiError::RateLimited { .. } => "rate_limited",
            ApiError::Unavailable => "unavailable",
            ApiError::Internal(_) => "internal_error",
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        ApiError::Internal(anyhow::Error::new(err).context("database error"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        let mut body = json!({
            "error": self.code(),
            "detail": match &self {
                // Internal details stay in the logs, not on the wire.
                ApiError::Internal(err) => {
                    tracing::error!(error = ?err, "internal server error");
                    "internal server error".to_string()
                }
                other => other.to_string(),
            },
        });

        match &self {
            ApiError::ClaimConflict {
                bead_id,
                held_by,
                holder_alias,
            } => {
                body["bead_id"] = json!(bead_id);
                body["held_by"] = json!(held_by);
                body["holder_alias"] = json!(holder_alias);
            }
            ApiError::PolicyConflict {
                current_policy_id,
                current_version,
            } => {
                body["current_policy_id"] = json!(current_policy_id);
                body["current_version"] = json!(current_version);
            }
            _ => {}
        }

        if let ApiError::RateLimited {
            retry_after_seconds,
        } = &self
        {
            return (
                status,
                [(header::RETRY_AFTER, retry_after_seconds.to_string())],
                Json(body),
            )
                .into_response();
        }

        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_errors_map_to_409() {
        let err = ApiError::ClaimConflict {
            bead_id: "bd-1".into(),
            held_by: "ws-a".into(),
            holder_alias: "alice".into(),
        };
        assert_eq!(err.status(), StatusCode::CONFLICT);
        assert_eq!(err.code(), "claim_conflict");

        let err = ApiError::PolicyConflict {
            current_policy_id: "p-1".into(),
            current_version: 3,
        };
        assert_eq!(err.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn gone_maps_to_410() {
        assert_eq!(ApiError::WorkspaceGone.status(), StatusCode::GONE);
    }
}
