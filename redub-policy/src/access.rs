use std::path::{Path, PathBuf};
use std::sync::Arc;

use redub_core::Identity;
use redub_store::{JobRecord, LibraryKey, MetaStore, UploadRecord, Visibility};

use crate::error::{PolicyError, PolicyResult};

/// The only authorized path to per-resource decisions. Every handler
/// serving or mutating a job, upload, file or library entry goes through
/// these helpers; nothing re-implements the rules elsewhere.
///
/// Rules: admins always pass; owners always pass; `shared` visibility
/// passes reads only; everything else is forbidden.
pub struct ObjectAccess {
    meta: Arc<MetaStore>,
    outputs_root: PathBuf,
}

impl ObjectAccess {
    pub fn new(meta: Arc<MetaStore>, outputs_root: &Path) -> Self {
        Self {
            meta,
            outputs_root: outputs_root.to_path_buf(),
        }
    }

    pub fn require_job_access(
        &self,
        ident: &Identity,
        job: &JobRecord,
        allow_shared_read: bool,
    ) -> PolicyResult<()> {
        if job.is_soft_deleted() {
            return Err(PolicyError::NotFound);
        }
        if ident.is_admin() || job.owner_id == ident.user_id {
            return Ok(());
        }
        if allow_shared_read && job.visibility == Visibility::Shared {
            return Ok(());
        }
        Err(PolicyError::Forbidden(format!("job {}", job.id)))
    }

    pub fn require_upload_access(
        &self,
        ident: &Identity,
        upload: &UploadRecord,
    ) -> PolicyResult<()> {
        if ident.is_admin() || upload.owner_id == ident.user_id {
            return Ok(());
        }
        Err(PolicyError::Forbidden(format!("upload {}", upload.id)))
    }

    /// Resolve a requested file path to its canonical form, verify
    /// containment under the outputs root, map it to the owning job, and
    /// apply the job rule (shared reads allowed). Returns the canonical
    /// path to serve.
    pub async fn require_file_access(
        &self,
        ident: &Identity,
        requested: &str,
    ) -> PolicyResult<PathBuf> {
        let relative = requested.trim_start_matches('/');
        let joined = self.outputs_root.join(relative);

        let canonical = tokio::fs::canonicalize(&joined)
            .await
            .map_err(|_| PolicyError::NotFound)?;
        let root = tokio::fs::canonicalize(&self.outputs_root)
            .await
            .map_err(|_| PolicyError::NotFound)?;
        if !canonical.starts_with(&root) {
            return Err(PolicyError::Forbidden("path escapes outputs root".into()));
        }

        // First component under the root is the job's stem directory; its
        // `.job` pointer names the owner.
        let rel = canonical
            .strip_prefix(&root)
            .map_err(|_| PolicyError::NotFound)?;
        let stem = rel
            .components()
            .next()
            .ok_or(PolicyError::NotFound)?
            .as_os_str()
            .to_owned();
        let marker = root.join(&stem).join(".job");
        let job_id = tokio::fs::read_to_string(&marker)
            .await
            .map_err(|_| PolicyError::NotFound)?;

        let job = self
            .meta
            .get_job(&redub_core::JobId::from_string(job_id.trim().to_string()))
            .await
            .map_err(|_| PolicyError::NotFound)?;

        self.require_job_access(ident, &job, true)?;
        Ok(canonical)
    }

    pub async fn require_library_access(
        &self,
        ident: &Identity,
        key: &LibraryKey,
        allow_shared_read: bool,
    ) -> PolicyResult<JobRecord> {
        let entry = self
            .meta
            .library_entry(key)
            .await?
            .ok_or(PolicyError::NotFound)?;
        let job = self
            .meta
            .get_job(&entry.job_id)
            .await
            .map_err(|_| PolicyError::NotFound)?;
        self.require_job_access(ident, &job, allow_shared_read)?;
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redub_core::{AuthMethod, Role, Scope, UserId};
    use redub_store::InputRef;

    fn identity(user_id: &UserId, role: Role) -> Identity {
        Identity {
            user_id: user_id.clone(),
            role,
            scopes: vec![Scope::new("read:job")],
            method: AuthMethod::Bearer,
            session_id: None,
        }
    }

    async fn fixture() -> (tempfile::TempDir, Arc<MetaStore>, ObjectAccess) {
        std::env::set_var("REDUB_ALLOW_UNSAFE_STATE_DIR", "1");
        let dir = tempfile::tempdir().unwrap();
        let meta = Arc::new(
            MetaStore::open(&dir.path().join("state"), &dir.path().join("logs"))
                .await
                .unwrap(),
        );
        let outputs = dir.path().join("output");
        std::fs::create_dir_all(&outputs).unwrap();
        let access = ObjectAccess::new(meta.clone(), &outputs);
        (dir, meta, access)
    }

    fn job_for(owner: &UserId, visibility: Visibility) -> JobRecord {
        let mut job = JobRecord::new(
            owner.clone(),
            InputRef::Path { path: "/x".into() },
            serde_json::json!({}),
        );
        job.visibility = visibility;
        job
    }

    #[tokio::test]
    async fn owner_admin_shared_rules() {
        let (_dir, _meta, access) = fixture().await;
        let alice = UserId::new();
        let bob = UserId::new();

        let private_job = job_for(&alice, Visibility::Private);
        let shared_job = job_for(&alice, Visibility::Shared);

        let alice_ident = identity(&alice, Role::Viewer);
        let bob_ident = identity(&bob, Role::Viewer);
        let admin_ident = identity(&bob, Role::Admin);

        assert!(access.require_job_access(&alice_ident, &private_job, true).is_ok());
        assert!(access.require_job_access(&admin_ident, &private_job, false).is_ok());
        assert!(access.require_job_access(&bob_ident, &private_job, true).is_err());

        // Shared: read yes, write no.
        assert!(access.require_job_access(&bob_ident, &shared_job, true).is_ok());
        assert!(access.require_job_access(&bob_ident, &shared_job, false).is_err());
    }

    #[tokio::test]
    async fn soft_deleted_jobs_vanish() {
        let (_dir, _meta, access) = fixture().await;
        let alice = UserId::new();
        let mut job = job_for(&alice, Visibility::Private);
        job.deleted_at = Some(chrono::Utc::now());
        let err = access
            .require_job_access(&identity(&alice, Role::Viewer), &job, true)
            .unwrap_err();
        assert!(matches!(err, PolicyError::NotFound));
    }

    #[tokio::test]
    async fn file_access_resolves_owning_job_and_blocks_non_owners() {
        let (dir, meta, access) = fixture().await;
        let alice = UserId::new();
        let bob = UserId::new();

        let job = job_for(&alice, Visibility::Private);
        meta.put_job(&job).await.unwrap();

        // Lay out a stem dir with its .job marker and one artifact.
        let stem = dir.path().join("output").join("ep01-abc");
        std::fs::create_dir_all(&stem).unwrap();
        std::fs::write(stem.join(".job"), job.id.as_str()).unwrap();
        std::fs::write(stem.join("final.mkv"), b"video").unwrap();

        let path = access
            .require_file_access(&identity(&alice, Role::Viewer), "ep01-abc/final.mkv")
            .await
            .unwrap();
        assert!(path.ends_with("final.mkv"));

        let err = access
            .require_file_access(&identity(&bob, Role::Viewer), "ep01-abc/final.mkv")
            .await
            .unwrap_err();
        assert!(matches!(err, PolicyError::Forbidden(_)));
    }

    #[tokio::test]
    async fn traversal_cannot_escape_the_outputs_root() {
        let (dir, _meta, access) = fixture().await;
        // A real file outside the root.
        std::fs::write(dir.path().join("secret.txt"), b"nope").unwrap();

        let err = access
            .require_file_access(
                &identity(&UserId::new(), Role::Viewer),
                "../secret.txt",
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PolicyError::Forbidden(_) | PolicyError::NotFound
        ));
    }
}
