use serde::{Deserialize, Serialize};

use crate::ids::{SessionId, UserId};

/// Account roles, ordered from least to most privileged.
///
/// The derived `Ord` is load-bearing: `role >= Role::Operator` is how
/// handlers express "operator or better".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Viewer,
    Operator,
    Editor,
    Admin,
}

impl Role {
    pub fn name(self) -> &'static str {
        match self {
            Self::Viewer => "viewer",
            Self::Operator => "operator",
            Self::Editor => "editor",
            Self::Admin => "admin",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "viewer" => Ok(Self::Viewer),
            "operator" => Ok(Self::Operator),
            "editor" => Ok(Self::Editor),
            "admin" => Ok(Self::Admin),
            _ => Err(format!("invalid role: {}", s)),
        }
    }
}

/// A capability scope string.
///
/// Scopes are colon-separated segments; a `*` segment matches anything at
/// its position and beyond. Examples: `read:job`, `submit:job`, `admin:*`,
/// and the resource-scoped `job:{id}:read`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope(pub String);

impl Scope {
    pub fn new(scope: impl Into<String>) -> Self {
        Self(scope.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this granted scope satisfies `required`.
    pub fn allows(&self, required: &str) -> bool {
        let mut granted = self.0.split(':');
        let mut wanted = required.split(':');
        loop {
            match (granted.next(), wanted.next()) {
                (Some("*"), _) => return true,
                (Some(g), Some(w)) if g == w => continue,
                (None, None) => return true,
                _ => return false,
            }
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a request authenticated. CSRF only applies to cookie sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    ApiKey,
    Bearer,
    SessionCookie,
}

impl AuthMethod {
    /// Cookie-authenticated mutations must present a CSRF token
    pub fn requires_csrf(self) -> bool {
        matches!(self, Self::SessionCookie)
    }
}

/// The resolved identity attached to every authenticated request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: UserId,
    pub role: Role,
    pub scopes: Vec<Scope>,
    pub method: AuthMethod,
    /// Present only for cookie sessions; used by CSRF binding and revocation
    pub session_id: Option<SessionId>,
}

impl Identity {
    /// Whether this identity carries a scope satisfying `required`.
    ///
    /// Admins implicitly hold every scope; everyone else needs an explicit
    /// grant. Role checks are separate (`role >= ...`).
    pub fn has_scope(&self, required: &str) -> bool {
        if self.role == Role::Admin {
            return true;
        }
        self.scopes.iter().any(|s| s.allows(required))
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_lattice_orders_correctly() {
        assert!(Role::Viewer < Role::Operator);
        assert!(Role::Operator < Role::Editor);
        assert!(Role::Editor < Role::Admin);
    }

    #[test]
    fn scope_matching() {
        assert!(Scope::new("read:job").allows("read:job"));
        assert!(!Scope::new("read:job").allows("edit:job"));
        assert!(Scope::new("admin:*").allows("admin:invites"));
        assert!(Scope::new("*").allows("anything:at:all"));
        assert!(Scope::new("job:job_abc:read").allows("job:job_abc:read"));
        assert!(!Scope::new("job:job_abc:read").allows("job:job_xyz:read"));
        assert!(!Scope::new("read:job").allows("read:job:extra"));
    }

    #[test]
    fn admin_holds_every_scope() {
        let ident = Identity {
            user_id: UserId::new(),
            role: Role::Admin,
            scopes: vec![],
            method: AuthMethod::Bearer,
            session_id: None,
        };
        assert!(ident.has_scope("submit:job"));
    }

    #[test]
    fn csrf_applies_to_cookie_sessions_only() {
        assert!(AuthMethod::SessionCookie.requires_csrf());
        assert!(!AuthMethod::Bearer.requires_csrf());
        assert!(!AuthMethod::ApiKey.requires_csrf());
    }
}
