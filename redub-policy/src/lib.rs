//! redub-policy: who may do what.
//!
//! Identity resolution (API key, bearer token, signed session cookie, in
//! that order), the role/scope model, CSRF for cookie sessions, token
//! bucket rate limits, the outer network gate, TOTP, and the one and only
//! object-access module. Handlers never re-implement a check that lives
//! here.

pub mod access;
pub mod csrf;
pub mod error;
pub mod identity;
pub mod netgate;
pub mod ratelimit;
pub mod totp;

pub use access::ObjectAccess;
pub use csrf::CsrfGuard;
pub use error::{PolicyError, PolicyResult};
pub use identity::{IdentityResolver, RequestCredentials, SESSION_COOKIE};
pub use netgate::NetGate;
pub use ratelimit::{EndpointClass, RateLimiter};
