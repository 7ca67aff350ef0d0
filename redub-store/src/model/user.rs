use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use redub_core::{ApiKeyId, InviteToken, Role, Scope, SessionId, UserId};

/// An account. Creation happens only through invite redemption or an
/// admin-create path; there is no self-signup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: UserId,
    pub login: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
    /// bcrypt hash; never serialized out of the store layer
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub totp_enabled: bool,
    /// Base32 TOTP secret, present once setup has begun
    #[serde(skip_serializing)]
    pub totp_secret: Option<String>,
}

/// One-shot invite. `redeemed_by` flips exactly once, atomically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InviteRecord {
    pub token: InviteToken,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub redeemed_by: Option<UserId>,
    pub redeemed_at: Option<DateTime<Utc>>,
}

impl InviteRecord {
    pub fn is_redeemable(&self, now: DateTime<Utc>) -> bool {
        self.redeemed_by.is_none() && self.expires_at > now
    }
}

/// A cookie-backed login session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub user_id: UserId,
    pub device_id: String,
    /// Hash of the creating IP; the raw address is never persisted
    pub created_ip_hash: String,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl SessionRecord {
    pub fn is_active(&self) -> bool {
        self.revoked_at.is_none()
    }
}

/// An API key. Clients present `prefix.secret`; only the bcrypt hash of
/// the secret half is stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub id: ApiKeyId,
    pub prefix: String,
    #[serde(skip_serializing)]
    pub secret_hash: String,
    pub owner_id: UserId,
    pub scopes: Vec<Scope>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl ApiKeyRecord {
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && self.expires_at.map(|e| e > now).unwrap_or(true)
    }
}

/// Short-lived one-shot code minted by `/auth/qr/init` and redeemed by a
/// second device to obtain its own session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingCode {
    pub code: String,
    pub user_id: UserId,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub redeemed: bool,
}

impl PairingCode {
    pub fn is_redeemable(&self, now: DateTime<Utc>) -> bool {
        !self.redeemed && self.expires_at > now
    }
}
