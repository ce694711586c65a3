//! Request authentication: trust-mode (decode without verifying) and
//! verify-mode (HMAC-SHA256) JWT, plus a separate admin bearer-key check.

use async_trait::async_trait;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthOutcome {
    pub authenticated: bool,
    pub user_id: Option<String>,
    pub claims: Option<Value>,
    pub error: Option<String>,
}

impl AuthOutcome {
    fn unauthenticated(error: impl Into<String>) -> Self {
        AuthOutcome {
            authenticated: false,
            user_id: None,
            claims: None,
            error: Some(error.into()),
        }
    }
}

/// Bearer token from the `Authorization` header, or the `token` query param
/// as a fallback for SSE clients that cannot set headers.
pub struct RawToken<'a> {
    pub bearer: Option<&'a str>,
    pub query_token: Option<&'a str>,
}

impl<'a> RawToken<'a> {
    pub fn token(&self) -> Option<&'a str> {
        self.bearer.or(self.query_token)
    }
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, token: RawToken<'_>) -> AuthOutcome;
}

/// Decodes the JWT payload without checking the signature, extracting the
/// identity claim at `claim_path` (default `sub`).
pub struct TrustAuthenticator {
    pub claim_path: String,
}

impl Default for TrustAuthenticator {
    fn default() -> Self {
        TrustAuthenticator {
            claim_path: "sub".to_string(),
        }
    }
}

fn decode_jwt_payload_unverified(token: &str) -> Option<Value> {
    let mut parts = token.split('.');
    let _header = parts.next()?;
    let payload_b64 = parts.next()?;
    let bytes =
        base64::Engine::decode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, payload_b64)
            .ok()?;
    serde_json::from_slice(&bytes).ok()
}

#[async_trait]
impl Authenticator for TrustAuthenticator {
    async fn authenticate(&self, token: RawToken<'_>) -> AuthOutcome {
        let Some(raw) = token.token() else {
            return AuthOutcome::unauthenticated("missing token");
        };
        let Some(claims) = decode_jwt_payload_unverified(raw) else {
            return AuthOutcome::unauthenticated("malformed token");
        };
        let user_id = claims
            .get(&self.claim_path)
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        AuthOutcome {
            authenticated: true,
            user_id,
            claims: Some(claims),
            error: None,
        }
    }
}

/// Verifies HMAC-SHA256 signature, base64url(header).base64url(body), and
/// checks `exp`; rejects algorithm mismatch, tampering, and expiry.
pub struct VerifyAuthenticator {
    pub signing_key: String,
    pub claim_path: String,
}

#[async_trait]
impl Authenticator for VerifyAuthenticator {
    async fn authenticate(&self, token: RawToken<'_>) -> AuthOutcome {
        let Some(raw) = token.token() else {
            return AuthOutcome::unauthenticated("missing token");
        };
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        // The claim set is arbitrary and application-defined; audience
        // checks are not part of this contract.
        validation.validate_aud = false;
        let key = DecodingKey::from_secret(self.signing_key.as_bytes());
        match decode::<Value>(raw, &key, &validation) {
            Ok(data) => {
                let user_id = data
                    .claims
                    .get(&self.claim_path)
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string());
                AuthOutcome {
                    authenticated: true,
                    user_id,
                    claims: Some(data.claims),
                    error: None,
                }
            }
            Err(e) => AuthOutcome::unauthenticated(e.to_string()),
        }
    }
}

/// Separate authenticator for `/forge-admin/*`: constant-time compare
/// against a configured key. Unset or empty key fails closed.
pub struct AdminAuthenticator {
    pub admin_key: Option<String>,
}

impl AdminAuthenticator {
    /// `Ok(())` on match, `Err(true)` if the key itself is unset/empty
    /// (caller should respond 503), `Err(false)` on a wrong bearer token
    /// (caller should respond 403).
    pub fn check(&self, bearer: Option<&str>) -> Result<(), bool> {
        let Some(expected) = self.admin_key.as_ref().filter(|k| !k.is_empty()) else {
            return Err(true);
        };
        let Some(provided) = bearer else {
            return Err(false);
        };
        if constant_time_eq(expected.as_bytes(), provided.as_bytes()) {
            Ok(())
        } else {
            Err(false)
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trust_mode_missing_token_is_unauthenticated() {
        let auth = TrustAuthenticator::default();
        let outcome = auth
            .authenticate(RawToken {
                bearer: None,
                query_token: None,
            })
            .await;
        assert!(!outcome.authenticated);
    }

    #[tokio::test]
    async fn trust_mode_missing_claim_is_authenticated_with_null_user() {
        let auth = TrustAuthenticator::default();
        let header = base64_url_encode(b"{\"alg\":\"none\"}");
        let payload = base64_url_encode(b"{\"other\":\"x\"}");
        let token = format!("{header}.{payload}.sig");
        let outcome = auth
            .authenticate(RawToken {
                bearer: Some(&token),
                query_token: None,
            })
            .await;
        assert!(outcome.authenticated);
        assert_eq!(outcome.user_id, None);
    }

    fn base64_url_encode(bytes: &[u8]) -> String {
        base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, bytes)
    }

    #[test]
    fn admin_auth_fails_closed_when_unset() {
        let admin = AdminAuthenticator { admin_key: None };
        assert_eq!(admin.check(Some("x")), Err(true));
    }

    #[test]
    fn admin_auth_rejects_wrong_key() {
        let admin = AdminAuthenticator {
            admin_key: Some("secret".to_string()),
        };
        assert_eq!(admin.check(Some("nope")), Err(false));
        assert_eq!(admin.check(Some("secret")), Ok(()));
    }
}
