use hmac::{Hmac, Mac};
use sha2::Sha256;

use redub_core::SessionId;

use crate::error::{PolicyError, PolicyResult};

type HmacSha256 = Hmac<Sha256>;

/// Double-submit CSRF tokens, bound to the session by HMAC.
///
/// The token travels both as a cookie and as the `X-CSRF-Token` header on
/// every state-mutating cookie-authenticated request; GET/HEAD and
/// bearer/API-key requests are exempt (the identity layer records which
/// method authenticated).
pub struct CsrfGuard {
    secret: String,
}

impl CsrfGuard {
    pub const COOKIE: &'static str = "redub_csrf";
    pub const HEADER: &'static str = "x-csrf-token";

    pub fn new(secret: &str) -> Self {
        Self {
            secret: secret.to_string(),
        }
    }

    /// Mint a token for a session: `<nonce>.<mac(session, nonce)>`.
    pub fn mint(&self, session_id: &SessionId) -> String {
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        let tag = self.tag(session_id, &nonce);
        format!("{nonce}.{tag}")
    }

    /// Verify the double-submit pair for a mutating request.
    pub fn verify(
        &self,
        session_id: &SessionId,
        cookie_token: Option<&str>,
        header_token: Option<&str>,
    ) -> PolicyResult<()> {
        let (cookie_token, header_token) = match (cookie_token, header_token) {
            (Some(c), Some(h)) => (c, h),
            _ => return Err(PolicyError::Csrf),
        };
        if cookie_token != header_token {
            return Err(PolicyError::Csrf);
        }
        let (nonce, tag_hex) = cookie_token.split_once('.').ok_or(PolicyError::Csrf)?;
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("hmac accepts any key length");
        mac.update(session_id.as_str().as_bytes());
        mac.update(b":");
        mac.update(nonce.as_bytes());
        // Constant-time comparison via the mac itself.
        let provided = hex_decode(tag_hex).ok_or(PolicyError::Csrf)?;
        mac.verify_slice(&provided).map_err(|_| PolicyError::Csrf)?;
        Ok(())
    }

    fn tag(&self, session_id: &SessionId, nonce: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("hmac accepts any key length");
        mac.update(session_id.as_str().as_bytes());
        mac.update(b":");
        mac.update(nonce.as_bytes());
        mac.finalize()
            .into_bytes()
            .iter()
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
