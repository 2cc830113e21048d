//! Request authentication
//!
//! HS256 JWTs whose `sub` names the user. API routes take the token from the
//! `Authorization: Bearer` header; the terminal WebSocket route also accepts
//! `?token=` or the `nimbus_token` cookie, since browsers cannot set headers
//! on a WebSocket upgrade.

use crate::server::ApiError;
use axum::extract::{Query, Request, State};
use axum::http::{HeaderMap, Uri};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum_extra::extract::cookie::CookieJar;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use nimbus_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const TOKEN_COOKIE: &str = "nimbus_token";
pub const TOKEN_QUERY: &str = "token";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: u64,
}

/// The authenticated caller, placed in request extensions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser(pub String);

pub struct JwtAuth {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl JwtAuth {
    pub fn new(secret: &str) -> Result<Self> {
        if secret.is_empty() {
            return Err(Error::Validation("JWT secret is empty".to_string()));
        }
        Ok(Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        })
    }

    /// Mint a token for `user` valid for `ttl`
    pub fn issue(&self, user: &str, ttl: Duration) -> Result<String> {
        let claims = Claims {
            sub: user.to_string(),
            exp: chrono::Utc::now().timestamp() as u64 + ttl.as_secs(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| Error::Internal(format!("failed to sign token: {}", e)))
    }

    /// The user a valid token names
    pub fn verify(&self, token: &str) -> Result<String> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation).map_err(|e| {
            Error::Authentication {
                message: "invalid or expired token".to_string(),
                detail: Some(e.to_string()),
            }
        })?;
        if data.claims.sub.is_empty() {
            return Err(Error::Authentication {
                message: "token has no subject".to_string(),
                detail: None,
            });
        }
        Ok(data.claims.sub)
    }
}

fn bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

fn query_token(uri: &Uri) -> Option<String> {
    let Query(mut params) = Query::<HashMap<String, String>>::try_from_uri(uri).ok()?;
    params.remove(TOKEN_QUERY).filter(|v| !v.is_empty())
}

fn cookie_token(headers: &HeaderMap) -> Option<String> {
    CookieJar::from_headers(headers)
        .get(TOKEN_COOKIE)
        .map(|c| c.value().to_string())
        .filter(|v| !v.is_empty())
}

/// Find a token: header first, then (if allowed) query string, then cookie
pub fn extract_token(headers: &HeaderMap, uri: &Uri, allow_alternates: bool) -> Option<String> {
    bearer(headers).or_else(|| {
        if allow_alternates {
            query_token(uri).or_else(|| cookie_token(headers))
        } else {
            None
        }
    })
}

fn is_terminal_socket(path: &str) -> bool {
    path.starts_with("/api/terminal/sessions/") && path.ends_with("/ws")
}

/// Middleware rejecting requests without a valid token
pub async fn require_auth(State(auth): State<Arc<JwtAuth>>, mut req: Request, next: Next) -> Response {
    let path = req.uri().path();
    let token = extract_token(req.headers(), req.uri(), is_terminal_socket(path));

    let Some(token) = token else {
        debug!(path = %path, "Request without token");
        return ApiError(Error::Authentication {
            message: "missing bearer token".to_string(),
            detail: None,
        })
        .into_response();
    };

    match auth.verify(&token) {
        Ok(user) => {
            req.extensions_mut().insert(AuthUser(user));
            next.run(req).await
        }
        Err(e) => ApiError(e).into_response(),
    }
}
