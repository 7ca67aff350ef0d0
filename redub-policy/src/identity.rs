use std::sync::Arc;

use chrono::Utc;
use hmac::{Hmac, Mac};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::debug;

use redub_core::{AuthMethod, Identity, Role, Scope, SessionId, UserId};
use redub_store::MetaStore;

use crate::error::{PolicyError, PolicyResult};

/// Name of the session cookie.
pub const SESSION_COOKIE: &str = "redub_session";

/// Bearer token lifetime.
const TOKEN_TTL_SECS: i64 = 3600;

type HmacSha256 = Hmac<Sha256>;

/// JWT claims carried by bearer tokens.
#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    /// Session the token was minted from, if any; revoking the session
    /// kills the token
    sid: Option<String>,
    exp: i64,
    iat: i64,
}

/// Credentials extracted from a request, transport-agnostic. The HTTP
/// layer fills this from headers; resolution order is fixed here.
#[derive(Debug, Default, Clone)]
pub struct RequestCredentials {
    /// `X-Api-Key` header (`prefix.secret`)
    pub api_key: Option<String>,
    /// `Authorization: Bearer <jwt>`
    pub bearer: Option<String>,
    /// Value of the signed session cookie
    pub session_cookie: Option<String>,
}

impl RequestCredentials {
    pub fn is_empty(&self) -> bool {
        self.api_key.is_none() && self.bearer.is_none() && self.session_cookie.is_none()
    }
}

/// Default scopes per role; explicit scopes on API keys override these.
fn default_scopes(role: Role) -> Vec<Scope> {
    match role {
        Role::Viewer => vec![Scope::new("read:job")],
        Role::Operator => vec![Scope::new("read:job"), Scope::new("submit:job")],
        Role::Editor => vec![
            Scope::new("read:job"),
            Scope::new("submit:job"),
            Scope::new("edit:job"),
        ],
        Role::Admin => vec![Scope::new("admin:*")],
    }
}

/// Resolves request credentials to an [`Identity`].
///
/// Order: API key header, then bearer token, then signed session cookie.
/// The first credential present wins; a present-but-invalid credential is
/// an authentication failure, not a fallthrough.
pub struct IdentityResolver {
    meta: Arc<MetaStore>,
    jwt_encoding: EncodingKey,
    jwt_decoding: DecodingKey,
    session_secret: String,
}

impl IdentityResolver {
    pub fn new(meta: Arc<MetaStore>, jwt_secret: &str, session_secret: &str) -> Self {
        Self {
            meta,
            jwt_encoding: EncodingKey::from_secret(jwt_secret.as_bytes()),
            jwt_decoding: DecodingKey::from_secret(jwt_secret.as_bytes()),
            session_secret: session_secret.to_string(),
        }
    }

    pub async fn resolve(&self, creds: &RequestCredentials) -> PolicyResult<Option<Identity>> {
        if let Some(raw) = &creds.api_key {
            return self.resolve_api_key(raw).await.map(Some);
        }
        if let Some(token) = &creds.bearer {
            return self.resolve_bearer(token).await.map(Some);
        }
        if let Some(cookie) = &creds.session_cookie {
            return self.resolve_session_cookie(cookie).await.map(Some);
        }
        Ok(None)
    }

    async fn resolve_api_key(&self, raw: &str) -> PolicyResult<Identity> {
        let (prefix, secret) = raw.split_once('.').ok_or(PolicyError::Auth)?;
        let key = self
            .meta
            .find_api_key_by_prefix(prefix)
            .await
            .map_err(|_| PolicyError::Auth)?;
        if !key.is_usable(Utc::now()) {
            return Err(PolicyError::Auth);
        }
        let ok = bcrypt::verify(secret, &key.secret_hash).unwrap_or(false);
        if !ok {
            debug!(prefix, "api key secret mismatch");
            return Err(PolicyError::Auth);
        }
        let user = self
            .meta
            .get_user(&key.owner_id)
            .await
            .map_err(|_| PolicyError::Auth)?;
        Ok(Identity {
            user_id: user.id,
            role: user.role,
            scopes: key.scopes,
            method: AuthMethod::ApiKey,
            session_id: None,
        })
    }

    async fn resolve_bearer(&self, token: &str) -> PolicyResult<Identity> {
        let data = decode::<Claims>(token, &self.jwt_decoding, &Validation::default())
            .map_err(|_| PolicyError::Auth)?;
        let user_id = UserId::from_string(data.claims.sub);
        let user = self
            .meta
            .get_user(&user_id)
            .await
            .map_err(|_| PolicyError::Auth)?;

        let session_id = match data.claims.sid {
            Some(sid) => {
                let session_id = SessionId::from_string(sid);
                let session = self
                    .meta
                    .get_session(&session_id)
                    .await
                    .map_err(|_| PolicyError::Auth)?;
                if !session.is_active() {
                    return Err(PolicyError::Auth);
                }
                Some(session_id)
            }
            None => None,
        };

        Ok(Identity {
            user_id: user.id,
            role: user.role,
            scopes: default_scopes(user.role),
            method: AuthMethod::Bearer,
            session_id,
        })
    }

    async fn resolve_session_cookie(&self, cookie: &str) -> PolicyResult<Identity> {
        let session_id = self.verify_session_cookie(cookie)?;
        let session = self
            .meta
            .get_session(&session_id)
            .await
            .map_err(|_| PolicyError::Auth)?;
        if !session.is_active() {
            return Err(PolicyError::Auth);
        }
        let user = self
            .meta
            .get_user(&session.user_id)
            .await
            .map_err(|_| PolicyError::Auth)?;
        Ok(Identity {
            user_id: user.id,
            role: user.role,
            scopes: default_scopes(user.role),
            method: AuthMethod::SessionCookie,
            session_id: Some(session_id),
        })
    }

    /// Mint a bearer token for a user; tokens minted at login carry the
    /// session so revocation propagates.
    pub fn issue_bearer(&self, user: &UserId, session: Option<&SessionId>) -> PolicyResult<String> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: user.as_str().to_string(),
            sid: session.map(|s| s.as_str().to_string()),
            iat: now,
            exp: now + TOKEN_TTL_SECS,
        };
        encode(&Header::default(), &claims, &self.jwt_encoding)
            .map_err(|e| PolicyError::Forbidden(e.to_string()))
    }

    /// Sign a session ID into a cookie value: `<id>.<hmac>`.
    pub fn sign_session(&self, session_id: &SessionId) -> String {
        let mut mac = HmacSha256::new_from_slice(self.session_secret.as_bytes())
            .expect("hmac accepts any key length");
        mac.update(session_id.as_str().as_bytes());
        let tag: String = mac
            .finalize()
            .into_bytes()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect();
        format!("{}.{tag}", session_id.as_str())
    }

    fn verify_session_cookie(&self, cookie: &str) -> PolicyResult<SessionId> {
        let (id, tag_hex) = cookie.split_once('.').ok_or(PolicyError::Auth)?;
        let tag = hex_decode(tag_hex).ok_or(PolicyError::Auth)?;
        let mut mac = HmacSha256::new_from_slice(self.session_secret.as_bytes())
            .expect("hmac accepts any key length");
        mac.update(id.as_bytes());
        mac.verify_slice(&tag).map_err(|_| PolicyError::Auth)?;
        Ok(SessionId::from_string(id.to_string()))
    }

    /// Hash an IP for session records; raw addresses are never stored.
    pub fn hash_ip(&self, ip: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.session_secret.as_bytes())
            .expect("hmac accepts any key length");
        mac.update(ip.as_bytes());
        mac.finalize()
            .into_bytes()
            .iter()
            .take(16)
            .map(|b| format!("{b:02x}"))
            .collect()
    }
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}
