//! redub-core: shared vocabulary for the redub dubbing job server.
//!
//! Everything here is transport- and storage-agnostic: opaque identifiers,
//! the error taxonomy, the operator configuration surface, and the
//! authenticated-identity model. The heavier crates (store, dispatch,
//! engine, policy, server) all speak these types at their seams.

pub mod config;
pub mod error;
pub mod identity;
pub mod ids;
pub mod redact;

pub use config::{Config, CookieSameSite, QueueBackendKind, RemoteAccessMode, RetentionPolicy};
pub use error::{ErrorKind, QuotaDetail};
pub use identity::{AuthMethod, Identity, Role, Scope};
pub use ids::{
    ApiKeyId, ClaimToken, ConsumerId, InviteToken, JobId, RequestId, SessionId, UploadId, UserId,
};
pub use redact::redact;
