use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use redub_store::LibraryKey;

use crate::error::ApiError;
use crate::extract::RequireIdentity;
use crate::handlers::jobs::JobResponse;
use crate::AppState;

#[derive(Deserialize)]
pub struct ListParams {
    pub series: Option<String>,
}

/// `GET /api/library`: the denormalized episode index, filtered down to
/// entries whose backing job the caller may read.
pub async fn list(
    State(state): State<AppState>,
    RequireIdentity(identity): RequireIdentity,
    Query(params): Query<ListParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let entries = state.meta.list_library(params.series.as_deref()).await?;

    let mut visible = Vec::new();
    for entry in entries {
        let readable = state
            .access
            .require_library_access(&identity, &entry.key, true)
            .await
            .is_ok();
        if readable {
            visible.push(json!({
                "series_slug": entry.key.series_slug,
                "season": entry.key.season,
                "episode": entry.key.episode,
                "job_id": entry.job_id,
                "updated_at": entry.updated_at,
            }));
        }
    }

    Ok(Json(json!({ "entries": visible })))
}

/// `GET /api/library/{series}/{season}/{episode}`: resolve a coordinate
/// to its backing job.
pub async fn get_entry(
    State(state): State<AppState>,
    RequireIdentity(identity): RequireIdentity,
    Path((series, season, episode)): Path<(String, u32, u32)>,
) -> Result<Json<JobResponse>, ApiError> {
    let key = LibraryKey {
        series_slug: series,
        season,
        episode,
    };
    let job = state
        .access
        .require_library_access(&identity, &key, true)
        .await?;
    Ok(Json(job.into()))
}
