//! Identity service seam.
//!
//! Exchanges a client's bearer credential and network address for the
//! identity used in routing decisions.

use crate::connection::Identity;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use thiserror::Error;
use tracing::debug;

/// Identity service failure.
///
/// The display text is what the client sees after `Authorization Error: `.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// The service refused the credential.
    #[error("{0}")]
    Rejected(String),

    /// The service could not be reached.
    #[error("identity service unavailable: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Decodes client credentials into identities.
#[async_trait]
pub trait IdentityService: Send + Sync + 'static {
    /// Decode `credential` presented from `address`.
    async fn decode(&self, address: IpAddr, credential: &str) -> Result<Identity, IdentityError>;
}

#[derive(Debug, Serialize)]
struct DecodeRequest<'a> {
    address: String,
    jwt: &'a str,
}

#[derive(Debug, Deserialize)]
struct DecodeResponse {
    user: DecodedUser,
}

#[derive(Debug, Deserialize)]
struct DecodedUser {
    id: String,
    #[serde(default)]
    owner: String,
}

/// Error body returned by the identity service on rejection.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    detail: String,
}

/// HTTP adapter for the identity service.
#[derive(Debug, Clone)]
pub struct HttpIdentityService {
    http: reqwest::Client,
    decode_url: String,
}

impl HttpIdentityService {
    pub fn new(decode_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            decode_url: decode_url.into(),
        }
    }
}

#[async_trait]
impl IdentityService for HttpIdentityService {
    async fn decode(&self, address: IpAddr, credential: &str) -> Result<Identity, IdentityError> {
        let request = DecodeRequest {
            address: address.to_string(),
            jwt: credential,
        };
        debug!("Decoding credential for {}", address);

        let response = self.http.post(&self.decode_url).json(&request).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let message = match serde_json::from_str::<ErrorBody>(&body) {
                Ok(error) => error.detail,
                Err(_) if body.trim().is_empty() => status.to_string(),
                Err(_) => body.trim().to_string(),
            };
            return Err(IdentityError::Rejected(message));
        }

        let decoded: DecodeResponse = response.json().await?;
        Ok(Identity {
            person_id: decoded.user.id,
            owner: decoded.user.owner,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::post, Json, Router};
    use serde_json::{json, Value};

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}/decode", addr)
    }

    fn localhost() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    #[tokio::test]
    async fn test_decode_success() {
        let router = Router::new().route(
            "/decode",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["address"], "127.0.0.1");
                assert_eq!(body["jwt"], "good");
                Json(json!({ "user": { "id": "5f0c6f2e-2b8a-4e0b-9a55-3c1d9d1f6b20", "owner": "acme" } }))
            }),
        );
        let service = HttpIdentityService::new(serve(router).await);

        let identity = service.decode(localhost(), "good").await.unwrap();
        assert_eq!(identity.person_id, "5f0c6f2e-2b8a-4e0b-9a55-3c1d9d1f6b20");
        assert_eq!(identity.owner, "acme");
    }

    #[tokio::test]
    async fn test_decode_rejection_detail() {
        let router = Router::new().route(
            "/decode",
            post(|| async {
                (
                    StatusCode::UNAUTHORIZED,
                    Json(json!({ "id": "auth", "code": 401, "detail": "invalid signature" })),
                )
            }),
        );
        let service = HttpIdentityService::new(serve(router).await);

        let err = service.decode(localhost(), "bad").await.unwrap_err();
        assert!(matches!(err, IdentityError::Rejected(_)));
        assert_eq!(err.to_string(), "invalid signature");
    }

    #[tokio::test]
    async fn test_decode_rejection_plain_text() {
        let router = Router::new().route(
            "/decode",
            post(|| async { (StatusCode::FORBIDDEN, "token expired") }),
        );
        let service = HttpIdentityService::new(serve(router).await);

        let err = service.decode(localhost(), "old").await.unwrap_err();
        assert_eq!(err.to_string(), "token expired");
    }

    #[tokio::test]
    async fn test_decode_unreachable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let service = HttpIdentityService::new(format!("http://{}/decode", addr));
        let err = service.decode(localhost(), "tok").await.unwrap_err();
        assert!(matches!(err, IdentityError::Transport(_)));
    }
}
