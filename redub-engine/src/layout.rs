use std::path::{Path, PathBuf};

use redub_core::JobId;
use redub_store::JobRecord;

use crate::error::EngineResult;

/// Artifact subdirectories created for every job's working directory.
pub const WORK_SUBDIRS: &[&str] = &[
    "manifests", "audio", "subs", "mobile", "review", "qa", "analysis",
];

/// Where job artifacts live on disk.
///
/// Each job gets a stem directory under the outputs root, named after its
/// input file plus a short job suffix to keep stems unique, and a stable
/// pointer at `jobs/<job_id>/target.txt` so anything holding only the job
/// ID can find the stem directory.
#[derive(Debug, Clone)]
pub struct OutputLayout {
    root: PathBuf,
}

impl OutputLayout {
    pub fn new(output_dir: &Path) -> EngineResult<Self> {
        std::fs::create_dir_all(output_dir)?;
        std::fs::create_dir_all(output_dir.join("jobs"))?;
        Ok(Self {
            root: output_dir.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The stem directory for a job: `<input-stem>-<job-suffix>`.
    pub fn stem_dir(&self, job: &JobRecord, input_path: &Path) -> PathBuf {
        let stem = input_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "input".to_string());
        let suffix = job
            .id
            .as_str()
            .strip_prefix("job_")
            .unwrap_or(job.id.as_str());
        let suffix = &suffix[..suffix.len().min(8)];
        self.root.join(format!("{stem}-{suffix}"))
    }

    /// Create the stem directory, its artifact subdirectories and the
    /// `jobs/<id>/target.txt` pointer. Idempotent.
    pub async fn prepare(&self, job: &JobRecord, input_path: &Path) -> EngineResult<PathBuf> {
        let work_dir = self.stem_dir(job, input_path);
        tokio::fs::create_dir_all(&work_dir).await?;
        for sub in WORK_SUBDIRS {
            tokio::fs::create_dir_all(work_dir.join(sub)).await?;
        }

        let pointer_dir = self.pointer_dir(&job.id);
        tokio::fs::create_dir_all(&pointer_dir).await?;
        tokio::fs::write(
            pointer_dir.join("target.txt"),
            work_dir.to_string_lossy().as_bytes(),
        )
        .await?;
        // Reverse pointer: lets file serving resolve a path back to the
        // owning job without scanning the store.
        tokio::fs::write(work_dir.join(".job"), job.id.as_str().as_bytes()).await?;

        Ok(work_dir)
    }

    fn pointer_dir(&self, job_id: &JobId) -> PathBuf {
        self.root.join("jobs").join(job_id.as_str())
    }

    /// Resolve a job's stem directory through its pointer file.
    pub async fn resolve(&self, job_id: &JobId) -> EngineResult<Option<PathBuf>> {
        let pointer = self.pointer_dir(job_id).join("target.txt");
        match tokio::fs::read_to_string(&pointer).await {
            Ok(target) => Ok(Some(PathBuf::from(target.trim()))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Append one line to the operator-facing log mirror in the stem dir.
    pub async fn append_job_log(&self, work_dir: &Path, line: &str) -> EngineResult<()> {
        use tokio::io::AsyncWriteExt;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(work_dir.join("job.log"))
            .await?;
        file.write_all(format!("{line}\n").as_bytes()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redub_core::UserId;
    use redub_store::InputRef;

    #[tokio::test]
    async fn prepare_creates_layout_and_pointer() {
        let dir = tempfile::tempdir().unwrap();
        let layout = OutputLayout::new(dir.path()).unwrap();
        let job = JobRecord::new(
            UserId::new(),
            InputRef::Path {
                path: "/data/episode-01.mkv".into(),
            },
            serde_json::json!({}),
        );

        let work_dir = layout
            .prepare(&job, Path::new("/data/episode-01.mkv"))
            .await
            .unwrap();
        assert!(work_dir.is_dir());
        for sub in WORK_SUBDIRS {
            assert!(work_dir.join(sub).is_dir());
        }

        let resolved = layout.resolve(&job.id).await.unwrap().unwrap();
        assert_eq!(resolved, work_dir);
        assert!(layout.resolve(&JobId::new()).await.unwrap().is_none());
    }
}
