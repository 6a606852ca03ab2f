//! Authentication middleware.
//!
//! Bearer token extraction for the control API. When `AUTH_SECRET` is set,
//! the token must match it; otherwise requests are accepted anonymously.

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts, StatusCode},
};

use crate::AppState;

/// Caller that passed the control API check.
#[derive(Debug, Clone)]
pub struct ApiCaller {
    /// The bearer token, or `anonymous` when no secret is configured
    pub token: String,
}

impl FromRequestParts<AppState> for ApiCaller {
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let auth_header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok());

        match (auth_header, state.config.auth_secret.as_deref()) {
            (Some(header), secret) if header.starts_with("Bearer ") => {
                let token = header.trim_start_matches("Bearer ").to_string();

                if token.is_empty() {
                    return Err((StatusCode::UNAUTHORIZED, "Empty bearer token"));
                }
                if secret.is_some_and(|secret| secret != token) {
                    tracing::warn!("Rejected control API call with a wrong token");
                    return Err((StatusCode::UNAUTHORIZED, "Invalid bearer token"));
                }

                Ok(ApiCaller { token })
            }
            (Some(_), _) => Err((
                StatusCode::UNAUTHORIZED,
                "Invalid authorization header format",
            )),
            (None, None) => Ok(ApiCaller {
                token: "anonymous".to_string(),
            }),
            (None, Some(_)) => Err((StatusCode::UNAUTHORIZED, "Missing authorization header")),
        }
    }
}
