use axum::{
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use subtle::ConstantTimeEq;

/// Principal recorded in audit lines for callers holding the shared API key.
pub const API_KEY_PRINCIPAL: &str = "api_key";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRejection(&'static str);

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({
                "error": {
                    "code": "UNAUTHORIZED",
                    "message": self.0
                }
            })),
        )
            .into_response()
    }
}

pub fn verify_bearer(headers: &HeaderMap, expected_key: &str) -> Result<&'static str, AuthRejection> {
    let token = extract_bearer_token(headers)?;

    let matches: bool = token.trim().as_bytes().ct_eq(expected_key.as_bytes()).into();
    if !matches {
        return Err(AuthRejection("Invalid API key"));
    }

    Ok(API_KEY_PRINCIPAL)
}

pub fn extract_bearer_token(headers: &HeaderMap) -> Result<&str, AuthRejection> {
    let Some(raw_header) = headers.get(AUTHORIZATION) else {
        return Err(AuthRejection("Missing Authorization header"));
    };

    let Ok(value) = raw_header.to_str() else {
        return Err(AuthRejection("Invalid Authorization header"));
    };

    let Some(token) = value.strip_prefix("Bearer ") else {
        return Err(AuthRejection("Authorization must use Bearer token"));
    };

    Ok(token)
}
