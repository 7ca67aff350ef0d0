use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use sha2::{Digest, Sha256};

use redub_store::{JobRecord, StageCheckpoint};

use crate::error::EngineResult;
use crate::stage::StageOutput;

/// SHA-256 of a file's content, lowercase hex.
pub async fn hash_file(path: &Path) -> EngineResult<String> {
    let bytes = tokio::fs::read(path).await?;
    let digest = Sha256::digest(&bytes);
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

/// Build the checkpoint entry for a completed stage: hash every artifact
/// it produced.
pub async fn checkpoint_for(output: &StageOutput) -> EngineResult<StageCheckpoint> {
    let mut artifact_hashes = BTreeMap::new();
    for (name, path) in &output.artifacts {
        artifact_hashes.insert(name.clone(), hash_file(path).await?);
    }
    Ok(StageCheckpoint {
        done: true,
        done_at: Some(Utc::now()),
        artifact_hashes,
    })
}

/// Whether a recorded checkpoint still holds: the stage is done and every
/// recorded artifact exists on disk with a matching hash. Any drift means
/// the stage reruns.
pub async fn checkpoint_valid(
    entry: &StageCheckpoint,
    work_dir: &Path,
    artifact_paths: &BTreeMap<String, PathBuf>,
) -> bool {
    if !entry.done {
        return false;
    }
    for (name, expected_hash) in &entry.artifact_hashes {
        let path = artifact_paths
            .get(name)
            .cloned()
            .unwrap_or_else(|| work_dir.join(name));
        match hash_file(&path).await {
            Ok(actual) if actual == *expected_hash => {}
            _ => return false,
        }
    }
    true
}

/// Operator-visible mirror of the authoritative checkpoint in the store,
/// written next to the artifacts after every stage.
pub async fn write_checkpoint_mirror(job: &JobRecord, work_dir: &Path) -> EngineResult<()> {
    let path = work_dir.join(".checkpoint.json");
    let body = serde_json::to_string_pretty(&job.checkpoint)
        .unwrap_or_else(|_| "{}".to_string());
    tokio::fs::write(path, body).await?;
    Ok(())
}
