use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use redub_core::{ApiKeyId, InviteToken, Role, Scope, SessionId, UserId};

use crate::db::MetaStore;
use crate::error::{StoreError, StoreResult};
use crate::model::user::{ApiKeyRecord, InviteRecord, PairingCode, SessionRecord, UserRecord};
use crate::time::{from_millis, to_millis};

const BCRYPT_COST: u32 = 10;

fn random_secret() -> String {
    format!(
        "{}{}",
        uuid::Uuid::new_v4().simple(),
        uuid::Uuid::new_v4().simple()
    )
}

fn user_from_row(row: &SqliteRow) -> UserRecord {
    UserRecord {
        id: UserId::from_string(row.get("id")),
        login: row.get("login"),
        role: row
            .get::<String, _>("role")
            .parse()
            .unwrap_or(Role::Viewer),
        password_hash: row.get("password_hash"),
        totp_enabled: row.get::<i64, _>("totp_enabled") != 0,
        totp_secret: row.get("totp_secret"),
        created_at: from_millis(row.get("created_at")),
    }
}

fn session_from_row(row: &SqliteRow) -> SessionRecord {
    SessionRecord {
        id: SessionId::from_string(row.get("id")),
        user_id: UserId::from_string(row.get("user_id")),
        device_id: row.get("device_id"),
        created_ip_hash: row.get("created_ip_hash"),
        created_at: from_millis(row.get("created_at")),
        revoked_at: row.get::<Option<i64>, _>("revoked_at").map(from_millis),
    }
}

fn api_key_from_row(row: &SqliteRow) -> ApiKeyRecord {
    let scopes: Vec<String> =
        serde_json::from_str(row.get::<String, _>("scopes").as_str()).unwrap_or_default();
    ApiKeyRecord {
        id: ApiKeyId::from_string(row.get("id")),
        prefix: row.get("prefix"),
        secret_hash: row.get("secret_hash"),
        owner_id: UserId::from_string(row.get("owner_id")),
        scopes: scopes.into_iter().map(Scope::new).collect(),
        created_at: from_millis(row.get("created_at")),
        expires_at: row.get::<Option<i64>, _>("expires_at").map(from_millis),
        revoked_at: row.get::<Option<i64>, _>("revoked_at").map(from_millis),
    }
}

impl MetaStore {
    // ---- users -----------------------------------------------------------

    /// Create an account directly (admin path; invite redemption is below).
    pub async fn create_user(
        &self,
        login: &str,
        password: &str,
        role: Role,
    ) -> StoreResult<UserRecord> {
        let _guard = self.write_lock.lock().await;
        let user = UserRecord {
            id: UserId::new(),
            login: login.to_string(),
            role,
            password_hash: bcrypt::hash(password, BCRYPT_COST)
                .map_err(|e| StoreError::Database(e.to_string()))?,
            totp_enabled: false,
            totp_secret: None,
            created_at: Utc::now(),
        };

        let result = sqlx::query(
            "INSERT OR IGNORE INTO users (id, login, role, password_hash, totp_enabled, totp_secret, created_at)
             VALUES (?1, ?2, ?3, ?4, 0, NULL, ?5)",
        )
        .bind(user.id.as_str())
        .bind(&user.login)
        .bind(user.role.name())
        .bind(&user.password_hash)
        .bind(to_millis(user.created_at))
        .execute(&self.auth_db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!("login taken: {login}")));
        }
        Ok(user)
    }

    pub async fn get_user(&self, id: &UserId) -> StoreResult<UserRecord> {
        let row = sqlx::query("SELECT * FROM users WHERE id = ?1")
            .bind(id.as_str())
            .fetch_optional(&self.auth_db)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("user {id}")))?;
        Ok(user_from_row(&row))
    }

    pub async fn get_user_by_login(&self, login: &str) -> StoreResult<UserRecord> {
        let row = sqlx::query("SELECT * FROM users WHERE login = ?1")
            .bind(login)
            .fetch_optional(&self.auth_db)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("login {login}")))?;
        Ok(user_from_row(&row))
    }

    pub async fn list_users(&self) -> StoreResult<Vec<UserRecord>> {
        let rows = sqlx::query("SELECT * FROM users ORDER BY created_at")
            .fetch_all(&self.auth_db)
            .await?;
        Ok(rows.iter().map(user_from_row).collect())
    }

    pub async fn count_users(&self) -> StoreResult<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM users")
            .fetch_one(&self.auth_db)
            .await?;
        Ok(row.get::<i64, _>("n").max(0) as u64)
    }

    /// Verify a login/password pair. Wrong login and wrong password are
    /// indistinguishable to the caller.
    pub async fn verify_login(&self, login: &str, password: &str) -> StoreResult<UserRecord> {
        let user = self
            .get_user_by_login(login)
            .await
            .map_err(|_| StoreError::NotFound("bad credentials".into()))?;
        let ok = bcrypt::verify(password, &user.password_hash)
            .map_err(|e| StoreError::Database(e.to_string()))?;
        if !ok {
            return Err(StoreError::NotFound("bad credentials".into()));
        }
        Ok(user)
    }

    /// Stash a TOTP secret during setup; enablement happens on verify.
    pub async fn set_totp_secret(&self, user: &UserId, secret: &str) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query("UPDATE users SET totp_secret = ?1 WHERE id = ?2")
            .bind(secret)
            .bind(user.as_str())
            .execute(&self.auth_db)
            .await?;
        Ok(())
    }

    pub async fn enable_totp(&self, user: &UserId) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query("UPDATE users SET totp_enabled = 1 WHERE id = ?1")
            .bind(user.as_str())
            .execute(&self.auth_db)
            .await?;
        Ok(())
    }

    // ---- invites ---------------------------------------------------------

    pub async fn create_invite(
        &self,
        created_by: &UserId,
        ttl: chrono::Duration,
    ) -> StoreResult<InviteRecord> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now();
        let invite = InviteRecord {
            token: InviteToken::new(),
            created_by: created_by.clone(),
            created_at: now,
            expires_at: now + ttl,
            redeemed_by: None,
            redeemed_at: None,
        };

        sqlx::query(
            "INSERT INTO invites (token, created_by, created_at, expires_at, redeemed_by, redeemed_at)
             VALUES (?1, ?2, ?3, ?4, NULL, NULL)",
        )
        .bind(invite.token.as_str())
        .bind(invite.created_by.as_str())
        .bind(to_millis(invite.created_at))
        .bind(to_millis(invite.expires_at))
        .execute(&self.auth_db)
        .await?;
        Ok(invite)
    }

    /// Redeem an invite and create the account, atomically: the token flip
    /// and the user insert share one transaction, so a token can never
    /// mint two accounts.
    pub async fn redeem_invite(
        &self,
        token: &InviteToken,
        login: &str,
        password: &str,
    ) -> StoreResult<UserRecord> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now();
        let mut tx = self.auth_db.begin().await?;

        let user = UserRecord {
            id: UserId::new(),
            login: login.to_string(),
            role: Role::Viewer,
            password_hash: bcrypt::hash(password, BCRYPT_COST)
                .map_err(|e| StoreError::Database(e.to_string()))?,
            totp_enabled: false,
            totp_secret: None,
            created_at: now,
        };

        let flipped = sqlx::query(
            "UPDATE invites SET redeemed_by = ?1, redeemed_at = ?2
             WHERE token = ?3 AND redeemed_by IS NULL AND expires_at > ?2",
        )
        .bind(user.id.as_str())
        .bind(to_millis(now))
        .bind(token.as_str())
        .execute(&mut *tx)
        .await?;

        if flipped.rows_affected() == 0 {
            return Err(StoreError::Conflict("invite not redeemable".into()));
        }

        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO users (id, login, role, password_hash, totp_enabled, totp_secret, created_at)
             VALUES (?1, ?2, ?3, ?4, 0, NULL, ?5)",
        )
        .bind(user.id.as_str())
        .bind(&user.login)
        .bind(user.role.name())
        .bind(&user.password_hash)
        .bind(to_millis(now))
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!("login taken: {login}")));
        }

        tx.commit().await?;
        Ok(user)
    }

    pub async fn list_invites(&self) -> StoreResult<Vec<InviteRecord>> {
        let rows = sqlx::query("SELECT * FROM invites ORDER BY created_at DESC")
            .fetch_all(&self.auth_db)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| InviteRecord {
                token: InviteToken::from_string(row.get("token")),
                created_by: UserId::from_string(row.get("created_by")),
                created_at: from_millis(row.get("created_at")),
                expires_at: from_millis(row.get("expires_at")),
                redeemed_by: row
                    .get::<Option<String>, _>("redeemed_by")
                    .map(UserId::from_string),
                redeemed_at: row.get::<Option<i64>, _>("redeemed_at").map(from_millis),
            })
            .collect())
    }

    // ---- sessions --------------------------------------------------------

    pub async fn create_session(
        &self,
        user: &UserId,
        device_id: &str,
        created_ip_hash: &str,
    ) -> StoreResult<SessionRecord> {
        let _guard = self.write_lock.lock().await;
        let session = SessionRecord {
            id: SessionId::new(),
            user_id: user.clone(),
            device_id: device_id.to_string(),
            created_ip_hash: created_ip_hash.to_string(),
            created_at: Utc::now(),
            revoked_at: None,
        };
        sqlx::query(
            "INSERT INTO sessions (id, user_id, device_id, created_ip_hash, created_at, revoked_at)
             VALUES (?1, ?2, ?3, ?4, ?5, NULL)",
        )
        .bind(session.id.as_str())
        .bind(session.user_id.as_str())
        .bind(&session.device_id)
        .bind(&session.created_ip_hash)
        .bind(to_millis(session.created_at))
        .execute(&self.auth_db)
        .await?;
        Ok(session)
    }

    pub async fn get_session(&self, id: &SessionId) -> StoreResult<SessionRecord> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = ?1")
            .bind(id.as_str())
            .fetch_optional(&self.auth_db)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("session {id}")))?;
        Ok(session_from_row(&row))
    }

    pub async fn revoke_session(&self, id: &SessionId) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query("UPDATE sessions SET revoked_at = ?1 WHERE id = ?2 AND revoked_at IS NULL")
            .bind(to_millis(Utc::now()))
            .bind(id.as_str())
            .execute(&self.auth_db)
            .await?;
        Ok(())
    }

    pub async fn list_sessions(&self, user: &UserId) -> StoreResult<Vec<SessionRecord>> {
        let rows = sqlx::query("SELECT * FROM sessions WHERE user_id = ?1 ORDER BY created_at DESC")
            .bind(user.as_str())
            .fetch_all(&self.auth_db)
            .await?;
        Ok(rows.iter().map(session_from_row).collect())
    }

    // ---- api keys --------------------------------------------------------

    /// Mint an API key. The plaintext secret is returned exactly once;
    /// only its bcrypt hash is stored.
    pub async fn create_api_key(
        &self,
        owner: &UserId,
        scopes: Vec<Scope>,
        expires_at: Option<DateTime<Utc>>,
    ) -> StoreResult<(ApiKeyRecord, String)> {
        let _guard = self.write_lock.lock().await;
        let id = ApiKeyId::new();
        let prefix = format!("rdb_{}", &id.as_str()[4..12]);
        let secret = random_secret();

        let record = ApiKeyRecord {
            id: id.clone(),
            prefix: prefix.clone(),
            secret_hash: bcrypt::hash(&secret, BCRYPT_COST)
                .map_err(|e| StoreError::Database(e.to_string()))?,
            owner_id: owner.clone(),
            scopes,
            created_at: Utc::now(),
            expires_at,
            revoked_at: None,
        };

        let scopes_json = serde_json::to_string(
            &record
                .scopes
                .iter()
                .map(|s| s.as_str().to_string())
                .collect::<Vec<_>>(),
        )?;

        sqlx::query(
            "INSERT INTO api_keys (id, prefix, secret_hash, owner_id, scopes, created_at, expires_at, revoked_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL)",
        )
        .bind(record.id.as_str())
        .bind(&record.prefix)
        .bind(&record.secret_hash)
        .bind(record.owner_id.as_str())
        .bind(scopes_json)
        .bind(to_millis(record.created_at))
        .bind(record.expires_at.map(to_millis))
        .execute(&self.auth_db)
        .await?;

        Ok((record, format!("{prefix}.{secret}")))
    }

    pub async fn find_api_key_by_prefix(&self, prefix: &str) -> StoreResult<ApiKeyRecord> {
        let row = sqlx::query("SELECT * FROM api_keys WHERE prefix = ?1")
            .bind(prefix)
            .fetch_optional(&self.auth_db)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("api key {prefix}")))?;
        Ok(api_key_from_row(&row))
    }

    pub async fn revoke_api_key(&self, id: &ApiKeyId) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query("UPDATE api_keys SET revoked_at = ?1 WHERE id = ?2 AND revoked_at IS NULL")
            .bind(to_millis(Utc::now()))
            .bind(id.as_str())
            .execute(&self.auth_db)
            .await?;
        Ok(())
    }

    // ---- device pairing --------------------------------------------------

    pub async fn create_pairing_code(
        &self,
        user: &UserId,
        ttl: chrono::Duration,
    ) -> StoreResult<PairingCode> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now();
        let code = PairingCode {
            code: random_secret(),
            user_id: user.clone(),
            created_at: now,
            expires_at: now + ttl,
            redeemed: false,
        };
        sqlx::query(
            "INSERT INTO pairing_codes (code, user_id, created_at, expires_at, redeemed)
             VALUES (?1, ?2, ?3, ?4, 0)",
        )
        .bind(&code.code)
        .bind(code.user_id.as_str())
        .bind(to_millis(code.created_at))
        .bind(to_millis(code.expires_at))
        .execute(&self.auth_db)
        .await?;
        Ok(code)
    }

    /// Redeem a pairing code: one atomic flip, like invites.
    pub async fn redeem_pairing_code(&self, code: &str) -> StoreResult<UserId> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now();

        let flipped = sqlx::query(
            "UPDATE pairing_codes SET redeemed = 1
             WHERE code = ?1 AND redeemed = 0 AND expires_at > ?2",
        )
        .bind(code)
        .bind(to_millis(now))
        .execute(&self.auth_db)
        .await?;

        if flipped.rows_affected() == 0 {
            return Err(StoreError::Conflict("pairing code not redeemable".into()));
        }

        let row = sqlx::query("SELECT user_id FROM pairing_codes WHERE code = ?1")
            .bind(code)
            .fetch_one(&self.auth_db)
            .await?;
        Ok(UserId::from_string(row.get("user_id")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_store() -> (tempfile::TempDir, MetaStore) {
        std::env::set_var("REDUB_ALLOW_UNSAFE_STATE_DIR", "1");
        let dir = tempfile::tempdir().unwrap();
        let store = MetaStore::open(&dir.path().join("state"), &dir.path().join("logs"))
            .await
            .unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn login_verification() {
        let (_dir, store) = open_store().await;
        store
            .create_user("nadia", "correct horse", Role::Editor)
            .await
            .unwrap();

        let user = store.verify_login("nadia", "correct horse").await.unwrap();
        assert_eq!(user.role, Role::Editor);
        assert!(store.verify_login("nadia", "wrong").await.is_err());
        assert!(store.verify_login("nobody", "x").await.is_err());
    }

    #[tokio::test]
    async fn duplicate_login_conflicts() {
        let (_dir, store) = open_store().await;
        store.create_user("sam", "pw1", Role::Viewer).await.unwrap();
        let err = store.create_user("sam", "pw2", Role::Viewer).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn invite_is_one_shot() {
        let (_dir, store) = open_store().await;
        let admin = store.create_user("root", "pw", Role::Admin).await.unwrap();
        let invite = store
            .create_invite(&admin.id, chrono::Duration::hours(1))
            .await
            .unwrap();

        let user = store
            .redeem_invite(&invite.token, "newcomer", "pw")
            .await
            .unwrap();
        assert_eq!(user.role, Role::Viewer);

        let err = store
            .redeem_invite(&invite.token, "second", "pw")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn api_key_round_trip() {
        let (_dir, store) = open_store().await;
        let owner = store.create_user("ops", "pw", Role::Operator).await.unwrap();
        let (record, plaintext) = store
            .create_api_key(&owner.id, vec![Scope::new("read:job")], None)
            .await
            .unwrap();

        let (prefix, secret) = plaintext.split_once('.').unwrap();
        let found = store.find_api_key_by_prefix(prefix).await.unwrap();
        assert_eq!(found.id, record.id);
        assert!(bcrypt::verify(secret, &found.secret_hash).unwrap());

        store.revoke_api_key(&record.id).await.unwrap();
        let revoked = store.find_api_key_by_prefix(prefix).await.unwrap();
        assert!(!revoked.is_usable(Utc::now()));
    }

    #[tokio::test]
    async fn pairing_code_is_one_shot() {
        let (_dir, store) = open_store().await;
        let user = store.create_user("mobile", "pw", Role::Viewer).await.unwrap();
        let code = store
            .create_pairing_code(&user.id, chrono::Duration::minutes(5))
            .await
            .unwrap();

        assert_eq!(store.redeem_pairing_code(&code.code).await.unwrap(), user.id);
        assert!(store.redeem_pairing_code(&code.code).await.is_err());
    }
}
