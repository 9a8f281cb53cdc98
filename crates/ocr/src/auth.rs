//! OAuth2 access tokens for a Google service account (JWT bearer grant).

use jsonwebtoken::{Algorithm, EncodingKey, Header};
use receipt_core::ServiceAccountKey;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::recognizer::OcrError;

pub const VISION_SCOPE: &str = "https://www.googleapis.com/auth/cloud-vision";

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 3600;
/// Refresh this long before the token actually expires.
const EXPIRY_MARGIN_SECS: i64 = 60;

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    iss: String,
    scope: String,
    aud: String,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    ASSERTION_LIFETIME_SECS
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: i64,
}

pub struct ServiceAccountAuth {
    key: ServiceAccountKey,
    encoding_key: EncodingKey,
    http: reqwest::Client,
    cached: Mutex<Option<CachedToken>>,
}

impl ServiceAccountAuth {
    /// Parses the private key immediately so a broken key file is reported at
    /// startup rather than on the first image.
    pub fn new(key: ServiceAccountKey, http: reqwest::Client) -> Result<Self, OcrError> {
        let encoding_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .map_err(|e| OcrError::Auth(format!("invalid service-account private key: {e}")))?;
        Ok(Self { key, encoding_key, http, cached: Mutex::new(None) })
    }

    /// Signed RS256 assertion valid from `now` for one hour.
    pub fn assertion(&self, now: i64) -> Result<String, OcrError> {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = self.key.private_key_id.clone();
        let claims = Claims {
            iss: self.key.client_email.clone(),
            scope: VISION_SCOPE.to_string(),
            aud: self.key.token_uri.clone(),
            iat: now,
            exp: now + ASSERTION_LIFETIME_SECS,
        };
        jsonwebtoken::encode(&header, &claims, &self.encoding_key)
            .map_err(|e| OcrError::Auth(format!("failed to sign assertion: {e}")))
    }

    /// A bearer token, reusing the cached one until shortly before it expires.
    pub async fn access_token(&self) -> Result<String, OcrError> {
        let now = chrono::Utc::now().timestamp();
        let mut cached = self.cached.lock().await;
        if let Some(t) = cached.as_ref() {
            if t.expires_at - EXPIRY_MARGIN_SECS > now {
                return Ok(t.token.clone());
            }
        }

        tracing::debug!("Requesting access token for {}", self.key.client_email);
        let assertion = self.assertion(now)?;
        let response = self
            .http
            .post(&self.key.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await
            .map_err(|e| OcrError::Auth(format!("token request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| OcrError::Auth(format!("failed to read token response: {e}")))?;
        if !status.is_success() {
            return Err(OcrError::Auth(format!("token endpoint returned {status}: {body}")));
        }

        let token: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| OcrError::Auth(format!("malformed token response: {e}")))?;
        *cached = Some(CachedToken {
            token: token.access_token.clone(),
            expires_at: now + token.expires_in,
        });
        Ok(token.access_token)
    }
}
